//! Selection and confirmation for ambiguous or destructive operations

use crate::error::{Result, ValidationError};
use std::io::{self, BufRead, IsTerminal, Write};

/// Resolves ambiguity by asking the user, or by refusing to guess
pub trait Chooser {
    /// Pick entries out of `candidates`, returning their indices
    fn choose(&mut self, prompt: &str, candidates: &[String]) -> Result<Vec<usize>>;

    /// Ask for confirmation of a destructive action
    fn confirm(&mut self, prompt: &str) -> Result<bool>;
}

/// Pick the chooser matching the current terminal
pub fn select_chooser() -> Box<dyn Chooser> {
    if io::stdin().is_terminal() && io::stderr().is_terminal() {
        Box::new(InteractiveChooser::stdio())
    } else {
        Box::new(NonInteractiveChooser)
    }
}

/// Prompts on a terminal
pub struct InteractiveChooser {
    input: Box<dyn BufRead>,
    output: Box<dyn Write>,
}

impl InteractiveChooser {
    /// Chooser reading answers from `input` and writing prompts to `output`
    pub fn new(input: Box<dyn BufRead>, output: Box<dyn Write>) -> Self {
        Self { input, output }
    }

    /// Chooser on stdin/stderr
    pub fn stdio() -> Self {
        Self::new(Box::new(io::BufReader::new(io::stdin())), Box::new(io::stderr()))
    }

    fn read_answer(&mut self) -> Result<String> {
        self.output.flush()?;
        let mut line = String::new();
        self.input.read_line(&mut line)?;
        Ok(line.trim().to_string())
    }
}

impl Chooser for InteractiveChooser {
    fn choose(&mut self, prompt: &str, candidates: &[String]) -> Result<Vec<usize>> {
        writeln!(self.output, "{}", prompt)?;
        for (i, candidate) in candidates.iter().enumerate() {
            writeln!(self.output, "  {}) {}", i + 1, candidate)?;
        }
        write!(self.output, "Select (numbers, 'all', or empty for none): ")?;
        let answer = self.read_answer()?;
        parse_selection(&answer, candidates.len())
    }

    fn confirm(&mut self, prompt: &str) -> Result<bool> {
        write!(self.output, "{} [y/N] ", prompt)?;
        let answer = self.read_answer()?.to_lowercase();
        Ok(answer == "y" || answer == "yes")
    }
}

/// Never prompts: a single candidate is taken, anything else is an error
#[derive(Debug, Default, Clone, Copy)]
pub struct NonInteractiveChooser;

impl Chooser for NonInteractiveChooser {
    fn choose(&mut self, prompt: &str, candidates: &[String]) -> Result<Vec<usize>> {
        match candidates.len() {
            0 => Ok(Vec::new()),
            1 => Ok(vec![0]),
            _ => Err(ValidationError::InvalidFlag(format!(
                "{} Ambiguous without a terminal; candidates: {}",
                prompt,
                candidates.join(", ")
            ))
            .into()),
        }
    }

    fn confirm(&mut self, prompt: &str) -> Result<bool> {
        Err(ValidationError::InvalidFlag(format!(
            "{} Refusing without a terminal; pass --force to skip confirmation",
            prompt
        ))
        .into())
    }
}

/// Parse `1,3 4`, `all` or an empty answer into zero-based indices
fn parse_selection(answer: &str, len: usize) -> Result<Vec<usize>> {
    if answer.eq_ignore_ascii_case("all") {
        return Ok((0..len).collect());
    }

    let mut picked = Vec::new();
    for token in answer.split(|c: char| c == ',' || c.is_whitespace()).filter(|t| !t.is_empty()) {
        let index = token
            .parse::<usize>()
            .ok()
            .filter(|n| (1..=len).contains(n))
            .ok_or_else(|| ValidationError::InvalidFlag(format!("invalid selection '{}'", token)))?;
        if !picked.contains(&(index - 1)) {
            picked.push(index - 1);
        }
    }
    Ok(picked)
}
