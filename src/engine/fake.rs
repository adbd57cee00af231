//! In-memory container engine for tests

use crate::engine::labels;
use crate::engine::{
    BuildOptions, ContainerEngine, ContainerSpec, ContainerState, ContainerSummary, ExecOutput,
};
use crate::error::{EngineError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// A container held by [`FakeEngine`]
#[derive(Debug, Clone, Default)]
pub struct FakeContainer {
    /// Container is running
    pub running: bool,
    /// Container labels
    pub labels: HashMap<String, String>,
    /// Creation time
    pub created_at: Option<DateTime<Utc>>,
    /// Spec the container was created from, if created through the engine
    pub spec: Option<ContainerSpec>,
}

#[derive(Debug, Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    image_present: bool,
    never_running: bool,
    start_error: Option<String>,
    racer: Option<HashMap<String, String>>,
    exec_result: ExecOutput,
    attach_exit_code: i32,
    logs: Vec<u8>,
    calls: Vec<String>,
    exec_calls: Vec<Vec<String>>,
}

/// Scriptable in-memory [`ContainerEngine`]
#[derive(Debug, Default)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
}

impl FakeEngine {
    /// Empty engine: no image, no containers
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the sandbox image as present
    pub fn with_image(self) -> Self {
        self.lock().image_present = true;
        self
    }

    /// Seed an existing container
    pub fn with_container(self, name: &str, running: bool, labels: HashMap<String, String>) -> Self {
        self.lock().containers.insert(
            name.to_string(),
            FakeContainer {
                running,
                labels,
                created_at: Some(Utc::now()),
                spec: None,
            },
        );
        self
    }

    /// Containers never reach the running state after create or start
    pub fn never_running(self) -> Self {
        self.lock().never_running = true;
        self
    }

    /// Every start fails with `message`; create still leaves the container
    /// behind in the created state, as the Docker engine does
    pub fn failing_start(self, message: &str) -> Self {
        self.lock().start_error = Some(message.to_string());
        self
    }

    /// Another invocation creates the same name, with `labels`, just before
    /// this engine's next create
    pub fn race_on_create(self, labels: HashMap<String, String>) -> Self {
        self.lock().racer = Some(labels);
        self
    }

    /// Result returned by every `exec`
    pub fn with_exec_result(self, result: ExecOutput) -> Self {
        self.lock().exec_result = result;
        self
    }

    /// Exit code returned by `attach`
    pub fn with_attach_exit_code(self, code: i32) -> Self {
        self.lock().attach_exit_code = code;
        self
    }

    /// Output returned by `logs`
    pub fn with_logs(self, logs: &str) -> Self {
        self.lock().logs = logs.as_bytes().to_vec();
        self
    }

    /// Operations performed so far, as `operation:target`
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Argument vectors passed to `exec`
    pub fn exec_calls(&self) -> Vec<Vec<String>> {
        self.lock().exec_calls.clone()
    }

    /// Snapshot of one container
    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.lock().containers.get(name).cloned()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, operation: &str, target: &str) -> MutexGuard<'_, FakeState> {
        let mut state = self.lock();
        state.calls.push(format!("{}:{}", operation, target));
        state
    }
}

#[async_trait]
impl ContainerEngine for FakeEngine {
    async fn inspect(&self, name: &str) -> Result<ContainerState> {
        let state = self.record("inspect", name);
        Ok(match state.containers.get(name) {
            Some(c) => ContainerState {
                exists: true,
                running: c.running,
                labels: c.labels.clone(),
                created_at: c.created_at,
            },
            None => ContainerState::absent(),
        })
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<()> {
        let mut state = self.record("create", &spec.name);
        if let Some(labels) = state.racer.take() {
            state.containers.insert(
                spec.name.clone(),
                FakeContainer {
                    running: true,
                    labels,
                    created_at: Some(Utc::now()),
                    spec: None,
                },
            );
        }
        if state.containers.contains_key(&spec.name) {
            return Err(EngineError::NameConflict(spec.name.clone()).into());
        }

        let running = !state.never_running && state.start_error.is_none();
        state.containers.insert(
            spec.name.clone(),
            FakeContainer {
                running,
                labels: spec.labels.clone(),
                created_at: Some(Utc::now()),
                spec: Some(spec.clone()),
            },
        );
        match &state.start_error {
            Some(message) => Err(EngineError::command("start", &spec.name, message).into()),
            None => Ok(()),
        }
    }

    async fn start(&self, name: &str) -> Result<()> {
        let mut state = self.record("start", name);
        if let Some(message) = &state.start_error {
            return Err(EngineError::command("start", name, message).into());
        }
        let running = !state.never_running;
        match state.containers.get_mut(name) {
            Some(c) => {
                c.running = running;
                Ok(())
            }
            None => Err(EngineError::NotFound(name.to_string()).into()),
        }
    }

    async fn remove(&self, name: &str, _force: bool) -> Result<()> {
        let mut state = self.record("remove", name);
        state
            .containers
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EngineError::NotFound(name.to_string()).into())
    }

    async fn exec(&self, name: &str, argv: &[String]) -> Result<ExecOutput> {
        let mut state = self.record("exec", name);
        if !state.containers.get(name).is_some_and(|c| c.running) {
            return Err(EngineError::command("exec", name, "container is not running").into());
        }
        state.exec_calls.push(argv.to_vec());
        Ok(state.exec_result.clone())
    }

    async fn attach(&self, name: &str, _argv: &[String]) -> Result<i32> {
        let state = self.record("attach", name);
        if !state.containers.get(name).is_some_and(|c| c.running) {
            return Err(EngineError::command("attach", name, "container is not running").into());
        }
        Ok(state.attach_exit_code)
    }

    async fn image_exists(&self, tag: &str) -> Result<bool> {
        Ok(self.record("image_exists", tag).image_present)
    }

    async fn build(&self, tag: &str, _context_dir: &Path, _options: &BuildOptions) -> Result<()> {
        self.record("build", tag).image_present = true;
        Ok(())
    }

    async fn logs(&self, name: &str, _tail: usize) -> Result<Vec<u8>> {
        Ok(self.record("logs", name).logs.clone())
    }

    async fn list(&self) -> Result<Vec<ContainerSummary>> {
        let state = self.record("list", "containers");
        let mut summaries: Vec<ContainerSummary> = state
            .containers
            .iter()
            .filter(|(_, c)| c.labels.contains_key(labels::SIGNATURE))
            .map(|(name, c)| ContainerSummary {
                name: name.clone(),
                running: c.running,
                labels: c.labels.clone(),
                created_at: c.created_at,
            })
            .collect();
        summaries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(summaries)
    }
}
