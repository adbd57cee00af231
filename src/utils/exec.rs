//! Command execution utilities

use crate::error::Result;
use std::process::{Command, Stdio};

/// Command output
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit status code
    pub status: i32,
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
}

impl CommandOutput {
    /// Check if command was successful
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Execute a command and return output
pub fn execute_command<S: AsRef<str>>(
    program: &str,
    args: &[S],
    inherit_stdio: bool,
) -> Result<CommandOutput> {
    let mut cmd = Command::new(program);
    cmd.args(args.iter().map(AsRef::as_ref));

    if inherit_stdio {
        cmd.stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit());

        let status = cmd.status()?;
        Ok(CommandOutput {
            status: status.code().unwrap_or(-1),
            stdout: String::new(),
            stderr: String::new(),
        })
    } else {
        let output = cmd.stdin(Stdio::null()).output()?;
        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Check if a command exists
pub fn command_exists(command: &str) -> bool {
    execute_command("which", &[command], false)
        .map(|output| output.success())
        .unwrap_or(false)
}
