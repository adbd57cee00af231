//! Sandbox lifecycle orchestrator

use crate::buildctx::{BuildContext, SANDBOX_BINARY_PATH};
use crate::config::SandboxConfig;
use crate::engine::{labels, BindMount, BuildOptions, ContainerEngine, ContainerSpec, ContainerState, ContainerSummary};
use crate::error::{EngineError, Result, SandboxError, ValidationError};
use crate::sandbox::chooser::Chooser;
use crate::workspace::WorkspaceIdentity;
use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Lines of container output kept when a container fails to start
const READINESS_LOG_TAIL: usize = 50;

/// Mount root inside the sandbox
const WORKSPACE_ROOT: &str = "/workspace";

/// Capabilities the in-sandbox firewall needs
const CAPABILITIES: &[&str] = &["NET_ADMIN", "NET_RAW"];

/// Keep-alive command of every sandbox container
const KEEP_ALIVE: &[&str] = &["tail", "-f", "/dev/null"];

/// Knobs for one `run` invocation
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Workspace directories; empty means the current directory
    pub dirs: Vec<PathBuf>,
    /// Share the host network and clear the sandbox firewall
    pub host_network: bool,
    /// Use this container name instead of the derived one
    pub name_override: Option<String>,
    /// Remove any existing container first
    pub force_replace: bool,
    /// Always create a new, uniquely suffixed container
    pub always_parallel: bool,
    /// Fail instead of warning when recorded mounts differ
    pub strict_mounts: bool,
}

/// Which containers `destroy` considers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StateFilter {
    /// Running and stopped
    #[default]
    Any,
    /// Running only
    Running,
    /// Stopped only
    Stopped,
}

/// Selection for `destroy`
#[derive(Debug, Clone, Default)]
pub struct DestroyOptions {
    /// Exact container name
    pub name: Option<String>,
    /// Workspace signature
    pub signature: Option<String>,
    /// Every managed container
    pub all: bool,
    /// State filter applied before selection
    pub state: StateFilter,
    /// Skip confirmation
    pub force: bool,
}

/// Per-invocation lifecycle state of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// No container holds the name
    Absent,
    /// Container exists but is not running
    ExistsStopped,
    /// Container is running
    ExistsRunning,
}

impl From<&ContainerState> for LifecycleState {
    fn from(state: &ContainerState) -> Self {
        match (state.exists, state.running) {
            (false, _) => LifecycleState::Absent,
            (true, false) => LifecycleState::ExistsStopped,
            (true, true) => LifecycleState::ExistsRunning,
        }
    }
}

/// How the container for an invocation came to be running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provisioned {
    /// Freshly created
    Created,
    /// Existing stopped container started again
    Started,
    /// Existing running container reused
    Reused,
}

/// Sandbox manager
pub struct SandboxManager<E> {
    engine: E,
    config: SandboxConfig,
}

impl<E: ContainerEngine> SandboxManager<E> {
    /// Create a new sandbox manager
    pub fn new(engine: E, config: SandboxConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { engine, config })
    }

    /// The underlying engine
    pub fn engine(&self) -> &E {
        &self.engine
    }

    /// Derive the identity `options` would run under
    pub fn identity(&self, options: &RunOptions) -> Result<WorkspaceIdentity> {
        if options.force_replace && options.always_parallel {
            return Err(ValidationError::InvalidFlag(
                "--replace and --parallel cannot be combined".to_string(),
            )
            .into());
        }

        let mut identity = WorkspaceIdentity::derive(&options.dirs, &self.config.naming)?;
        if let Some(name) = &options.name_override {
            validate_container_name(name)?;
            identity = identity.with_name(name.clone());
        }
        if options.always_parallel {
            identity = identity.with_parallel_suffix(Utc::now().format("%Y%m%d-%H%M%S%3f"));
        }
        Ok(identity)
    }

    /// Provision the sandbox, activate its firewall and attach a shell.
    /// Returns the shell's exit code.
    pub async fn run(&self, options: &RunOptions) -> Result<i32> {
        let identity = self.identity(options)?;
        info!(
            "Workspace {} -> {} ({} mounts)",
            identity.slug,
            identity.name,
            identity.mounts.len()
        );

        let provisioned = self.provision(&identity, options).await?;
        debug!("Container {} {:?}", identity.name, provisioned);

        self.activate_firewall(&identity.name, options.host_network).await?;

        info!("Attaching to {}", identity.name);
        self.engine.attach(&identity.name, &["bash".to_string()]).await
    }

    /// Bring the container for `identity` to the running state
    pub async fn provision(&self, identity: &WorkspaceIdentity, options: &RunOptions) -> Result<Provisioned> {
        let name = identity.name.as_str();
        let mut state = self.engine.inspect(name).await?;

        if state.exists && options.force_replace {
            info!("Replacing container {}", name);
            self.engine.remove(name, true).await?;
            state = ContainerState::absent();
        }

        if LifecycleState::from(&state) == LifecycleState::Absent {
            match self.create(identity, options.host_network).await {
                Ok(()) => return Ok(Provisioned::Created),
                Err(SandboxError::Engine(EngineError::NameConflict(_))) => {
                    warn!("Container {} was created concurrently; reusing it", name);
                    state = self.engine.inspect(name).await?;
                    if !state.exists {
                        return Err(EngineError::NotFound(name.to_string()).into());
                    }
                }
                Err(e) => return Err(e),
            }
        }

        self.check_drift(identity, &state, options.strict_mounts)?;
        check_network(name, &state, options.host_network)?;

        match LifecycleState::from(&state) {
            LifecycleState::ExistsRunning => Ok(Provisioned::Reused),
            _ => {
                info!("Starting stopped container {}", name);
                self.engine.start(name).await?;
                self.wait_until_running(name).await?;
                Ok(Provisioned::Started)
            }
        }
    }

    /// Build the sandbox image from the embedded build context
    pub async fn build_image(&self, no_cache: bool) -> Result<()> {
        let context = BuildContext::for_current_exe()?;
        let options = BuildOptions {
            no_cache,
            ..Default::default()
        };
        self.engine
            .build(&self.config.image.tag, context.path(), &options)
            .await
    }

    /// Remove managed containers chosen by `options`. Returns the removed names.
    pub async fn destroy(&self, options: &DestroyOptions, chooser: &mut dyn Chooser) -> Result<Vec<String>> {
        let candidates: Vec<ContainerSummary> = self
            .engine
            .list()
            .await?
            .into_iter()
            .filter(|c| match options.state {
                StateFilter::Any => true,
                StateFilter::Running => c.running,
                StateFilter::Stopped => !c.running,
            })
            .collect();

        let selected: Vec<String> = if let Some(name) = &options.name {
            let found: Vec<String> = candidates.iter().filter(|c| &c.name == name).map(|c| c.name.clone()).collect();
            if found.is_empty() {
                return Err(EngineError::NotFound(name.clone()).into());
            }
            found
        } else if let Some(signature) = &options.signature {
            let found: Vec<String> = candidates
                .iter()
                .filter(|c| c.labels.get(labels::SIGNATURE) == Some(signature))
                .map(|c| c.name.clone())
                .collect();
            if found.is_empty() {
                return Err(EngineError::NotFound(format!("signature {}", signature)).into());
            }
            found
        } else if options.all {
            candidates.iter().map(|c| c.name.clone()).collect()
        } else {
            let names: Vec<String> = candidates.iter().map(|c| c.name.clone()).collect();
            chooser
                .choose("Which sandboxes should be removed?", &names)?
                .into_iter()
                .map(|i| names[i].clone())
                .collect()
        };

        if selected.is_empty() {
            info!("No sandboxes to remove");
            return Ok(selected);
        }

        if !options.force
            && !chooser.confirm(&format!("Remove {}?", selected.join(", ")))?
        {
            info!("Aborted");
            return Ok(Vec::new());
        }

        for name in &selected {
            self.engine.remove(name, true).await?;
        }
        Ok(selected)
    }

    async fn ensure_image(&self) -> Result<()> {
        let tag = &self.config.image.tag;
        if self.engine.image_exists(tag).await? {
            return Ok(());
        }
        info!("Image {} not found, building it", tag);
        self.build_image(false).await
    }

    async fn create(&self, identity: &WorkspaceIdentity, host_network: bool) -> Result<()> {
        self.ensure_image().await?;
        let host_env = std::env::vars_os()
            .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)));
        let spec = self.container_spec(identity, host_network, host_env)?;
        match self.engine.create(&spec).await {
            Ok(()) => {}
            Err(e @ SandboxError::Engine(EngineError::NameConflict(_))) => return Err(e),
            Err(e) => {
                self.discard_partial(&spec.name).await;
                return Err(e);
            }
        }
        self.wait_until_running(&identity.name).await
    }

    /// Remove a container left behind by a failed create or start
    async fn discard_partial(&self, name: &str) {
        match self.engine.inspect(name).await {
            Ok(state) if state.exists => {
                warn!("Removing {} after a failed start", name);
                if let Err(e) = self.engine.remove(name, true).await {
                    warn!("Failed to remove {}: {}", name, e);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("Failed to inspect {} after a failed start: {}", name, e),
        }
    }

    fn container_spec<I>(&self, identity: &WorkspaceIdentity, host_network: bool, host_env: I) -> Result<ContainerSpec>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let passthrough = passthrough_matcher(&self.config.image.passthrough_env)?;
        let mut env: Vec<String> = host_env
            .into_iter()
            .filter(|(key, _)| passthrough.is_match(key))
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        env.sort();

        Ok(ContainerSpec {
            name: identity.name.clone(),
            image: self.config.image.tag.clone(),
            labels: labels::for_identity(identity, host_network, Utc::now())?,
            mounts: mount_targets(&identity.mounts),
            env,
            cap_add: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
            host_network,
            command: KEEP_ALIVE.iter().map(|c| c.to_string()).collect(),
        })
    }

    /// Poll until running; on timeout capture logs and remove the container
    async fn wait_until_running(&self, name: &str) -> Result<()> {
        let timeout = self.config.readiness.timeout();
        let interval = self.config.readiness.interval();
        let started = Instant::now();

        loop {
            if self.engine.inspect(name).await?.running {
                debug!("{} running after {:?}", name, started.elapsed());
                return Ok(());
            }
            if started.elapsed() >= timeout {
                break;
            }
            sleep(interval).await;
        }

        let logs = match self.engine.logs(name, READINESS_LOG_TAIL).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).trim_end().to_string(),
            Err(e) => format!("(logs unavailable: {})", e),
        };
        if let Err(e) = self.engine.remove(name, true).await {
            warn!("Failed to remove {} after readiness timeout: {}", name, e);
        }
        Err(SandboxError::ReadinessTimeout {
            name: name.to_string(),
            waited: started.elapsed(),
            logs,
        })
    }

    fn check_drift(&self, identity: &WorkspaceIdentity, state: &ContainerState, strict: bool) -> Result<()> {
        let recorded = labels::recorded_mounts(&state.labels);
        if let Some(recorded) = &recorded {
            if labels::same_mount_set(recorded, &identity.mounts) {
                return Ok(());
            }
        }

        let drift = SandboxError::Drift {
            name: identity.name.clone(),
            recorded: recorded.unwrap_or_default(),
            requested: identity.mounts.clone(),
        };
        if strict {
            return Err(drift);
        }
        warn!("{}", drift);
        Ok(())
    }

    async fn activate_firewall(&self, name: &str, host_network: bool) -> Result<()> {
        let argv = self.firewall_argv(host_network);
        info!("Activating firewall in {}", name);

        let output = self.engine.exec(name, &argv).await?;
        if !output.stdout.trim().is_empty() {
            debug!("{}", output.stdout.trim_end());
        }
        if !output.success() {
            return Err(SandboxError::Firewall(format!(
                "activation in {} exited with status {}: {}",
                name,
                output.exit_code,
                output.stderr.trim()
            )));
        }
        Ok(())
    }

    fn firewall_argv(&self, host_network: bool) -> Vec<String> {
        let mut argv = vec![SANDBOX_BINARY_PATH.to_string(), "firewall".to_string()];
        if host_network {
            argv.push("clear".to_string());
            return argv;
        }

        let firewall = &self.config.firewall;
        argv.push("apply".to_string());
        for domain in &firewall.extra_allowed_domains {
            argv.push("--allow-domain".to_string());
            argv.push(domain.clone());
        }
        argv.push("--blocked-probe".to_string());
        argv.push(firewall.blocked_probe.clone());
        if let Some(allowed) = &firewall.allowed_probe {
            argv.push("--allowed-probe".to_string());
            argv.push(allowed.clone());
        }
        argv
    }
}

/// Refuse to reuse a container created for the other network mode
fn check_network(name: &str, state: &ContainerState, host_network: bool) -> Result<()> {
    match labels::recorded_host_network(&state.labels) {
        Some(recorded) if recorded == host_network => Ok(()),
        recorded => Err(SandboxError::NetworkMismatch {
            name: name.to_string(),
            recorded: recorded.map_or("unknown", labels::network_mode).to_string(),
            requested: labels::network_mode(host_network).to_string(),
        }),
    }
}

/// Bind each directory at `/workspace/<basename>`, suffixing clashing basenames
fn mount_targets(mounts: &[PathBuf]) -> Vec<BindMount> {
    let mut taken = HashSet::new();
    mounts
        .iter()
        .map(|source| {
            let base = basename(source);
            let mut target = format!("{}/{}", WORKSPACE_ROOT, base);
            let mut n = 2;
            while !taken.insert(target.clone()) {
                target = format!("{}/{}-{}", WORKSPACE_ROOT, base, n);
                n += 1;
            }
            BindMount {
                source: source.clone(),
                target,
            }
        })
        .collect()
}

/// Host variables forwarded into the sandbox, as glob patterns over names
fn passthrough_matcher(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| SandboxError::Config(format!("invalid passthrough pattern '{}': {}", pattern, e)))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| SandboxError::Config(e.to_string()))
}

fn basename(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string())
}

fn validate_container_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidName(name.to_string()).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReadinessConfig;
    use crate::engine::{ExecOutput, FakeEngine};
    use crate::sandbox::chooser::NonInteractiveChooser;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn config() -> SandboxConfig {
        SandboxConfig {
            readiness: ReadinessConfig {
                timeout_ms: 40,
                interval_ms: 5,
            },
            ..Default::default()
        }
    }

    fn workspace(names: &[&str]) -> (TempDir, Vec<PathBuf>) {
        let root = tempfile::tempdir().unwrap();
        let dirs = names
            .iter()
            .map(|n| {
                let dir = root.path().join(n);
                std::fs::create_dir(&dir).unwrap();
                dir
            })
            .collect();
        (root, dirs)
    }

    fn run_options(dirs: &[PathBuf]) -> RunOptions {
        RunOptions {
            dirs: dirs.to_vec(),
            ..Default::default()
        }
    }

    fn labels_for(dirs: &[PathBuf], name: &str) -> HashMap<String, String> {
        network_labels_for(dirs, name, false)
    }

    fn network_labels_for(dirs: &[PathBuf], name: &str, host_network: bool) -> HashMap<String, String> {
        let identity = WorkspaceIdentity::derive(dirs, &config().naming)
            .unwrap()
            .with_name(name);
        labels::for_identity(&identity, host_network, Utc::now()).unwrap()
    }

    fn position(calls: &[String], call: &str) -> usize {
        calls
            .iter()
            .position(|c| c == call)
            .unwrap_or_else(|| panic!("{} not in {:?}", call, calls))
    }

    #[tokio::test]
    async fn test_fresh_run_orders_steps() {
        let (_root, dirs) = workspace(&["app"]);
        let manager = SandboxManager::new(FakeEngine::new().with_image(), config()).unwrap();
        let name = manager.identity(&run_options(&dirs)).unwrap().name;

        assert_eq!(manager.run(&run_options(&dirs)).await.unwrap(), 0);

        let calls = manager.engine().calls();
        let image = position(&calls, "image_exists:agentbox");
        let create = position(&calls, &format!("create:{}", name));
        let exec = position(&calls, &format!("exec:{}", name));
        let attach = position(&calls, &format!("attach:{}", name));
        assert!(image < create && create < exec && exec < attach);

        let container = manager.engine().container(&name).unwrap();
        let spec = container.spec.unwrap();
        assert_eq!(spec.mounts[0].target, "/workspace/app");
        assert_eq!(spec.cap_add, vec!["NET_ADMIN", "NET_RAW"]);
        assert_eq!(spec.command, vec!["tail", "-f", "/dev/null"]);
        assert!(!spec.host_network);
        assert_eq!(
            labels::recorded_mounts(&container.labels).unwrap(),
            vec![dirs[0].canonicalize().unwrap()]
        );

        let exec_calls = manager.engine().exec_calls();
        assert_eq!(&exec_calls[0][..3], &[SANDBOX_BINARY_PATH, "firewall", "apply"]);
    }

    #[tokio::test]
    async fn test_missing_image_is_built_before_create() {
        let (_root, dirs) = workspace(&["app"]);
        let manager = SandboxManager::new(FakeEngine::new(), config()).unwrap();

        manager.run(&run_options(&dirs)).await.unwrap();

        let calls = manager.engine().calls();
        let build = position(&calls, "build:agentbox");
        let create = calls.iter().position(|c| c.starts_with("create:")).unwrap();
        assert!(build < create);
    }

    #[tokio::test]
    async fn test_strict_drift_fails_before_attach() {
        let (_root, dirs) = workspace(&["a", "b"]);
        let requested = vec![dirs[1].clone()];
        let namer = SandboxManager::new(FakeEngine::new(), config()).unwrap();
        let name = namer.identity(&run_options(&requested)).unwrap().name;

        let engine = FakeEngine::new()
            .with_image()
            .with_container(&name, true, labels_for(&dirs[..1], &name));
        let manager = SandboxManager::new(engine, config()).unwrap();
        let options = RunOptions {
            strict_mounts: true,
            ..run_options(&requested)
        };

        let err = manager.run(&options).await.unwrap_err();
        assert!(matches!(err, SandboxError::Drift { .. }));
        let calls = manager.engine().calls();
        assert!(!calls.iter().any(|c| c.starts_with("attach:") || c.starts_with("exec:")));
        assert!(manager.engine().container(&name).is_some());
    }

    #[tokio::test]
    async fn test_lenient_drift_warns_and_attaches() {
        let (_root, dirs) = workspace(&["a", "b"]);
        let requested = vec![dirs[1].clone()];
        let namer = SandboxManager::new(FakeEngine::new(), config()).unwrap();
        let name = namer.identity(&run_options(&requested)).unwrap().name;

        let engine = FakeEngine::new()
            .with_image()
            .with_container(&name, true, labels_for(&dirs[..1], &name));
        let manager = SandboxManager::new(engine, config()).unwrap();

        assert_eq!(manager.run(&run_options(&requested)).await.unwrap(), 0);
        assert!(manager.engine().calls().contains(&format!("attach:{}", name)));
    }

    #[tokio::test]
    async fn test_readiness_timeout_leaves_absent() {
        let (_root, dirs) = workspace(&["app"]);
        let engine = FakeEngine::new().with_image().never_running().with_logs("exec format error\n");
        let manager = SandboxManager::new(engine, config()).unwrap();
        let name = manager.identity(&run_options(&dirs)).unwrap().name;

        let err = manager.run(&run_options(&dirs)).await.unwrap_err();
        match err {
            SandboxError::ReadinessTimeout { name: failed, logs, .. } => {
                assert_eq!(failed, name);
                assert_eq!(logs, "exec format error");
            }
            other => panic!("unexpected error: {}", other),
        }

        let state = manager.engine().inspect(&name).await.unwrap();
        assert_eq!(LifecycleState::from(&state), LifecycleState::Absent);
        assert!(!manager.engine().calls().iter().any(|c| c.starts_with("attach:")));
    }

    #[tokio::test]
    async fn test_stopped_container_that_never_runs_is_removed() {
        let (_root, dirs) = workspace(&["app"]);
        let namer = SandboxManager::new(FakeEngine::new(), config()).unwrap();
        let name = namer.identity(&run_options(&dirs)).unwrap().name;

        let engine = FakeEngine::new()
            .with_image()
            .never_running()
            .with_container(&name, false, labels_for(&dirs, &name));
        let manager = SandboxManager::new(engine, config()).unwrap();

        let err = manager.run(&run_options(&dirs)).await.unwrap_err();
        assert!(matches!(err, SandboxError::ReadinessTimeout { .. }), "{}", err);

        let calls = manager.engine().calls();
        assert!(calls.contains(&format!("start:{}", name)));
        assert!(!calls.iter().any(|c| c.starts_with("create:") || c.starts_with("attach:")));
        let state = manager.engine().inspect(&name).await.unwrap();
        assert_eq!(LifecycleState::from(&state), LifecycleState::Absent);
    }

    #[tokio::test]
    async fn test_failed_start_after_create_removes_container() {
        let (_root, dirs) = workspace(&["app"]);
        let engine = FakeEngine::new().with_image().failing_start("no such device");
        let manager = SandboxManager::new(engine, config()).unwrap();
        let name = manager.identity(&run_options(&dirs)).unwrap().name;

        let err = manager.run(&run_options(&dirs)).await.unwrap_err();
        assert!(err.to_string().contains("no such device"), "{}", err);

        let calls = manager.engine().calls();
        assert!(position(&calls, &format!("create:{}", name)) < position(&calls, &format!("remove:{}", name)));
        assert!(!calls.iter().any(|c| c.starts_with("attach:")));
        assert!(manager.engine().container(&name).is_none());
        let state = manager.engine().inspect(&name).await.unwrap();
        assert_eq!(LifecycleState::from(&state), LifecycleState::Absent);
    }

    #[tokio::test]
    async fn test_stopped_container_is_started() {
        let (_root, dirs) = workspace(&["app"]);
        let namer = SandboxManager::new(FakeEngine::new(), config()).unwrap();
        let name = namer.identity(&run_options(&dirs)).unwrap().name;

        let engine = FakeEngine::new()
            .with_image()
            .with_container(&name, false, labels_for(&dirs, &name));
        let manager = SandboxManager::new(engine, config()).unwrap();
        let identity = manager.identity(&run_options(&dirs)).unwrap();

        let provisioned = manager.provision(&identity, &run_options(&dirs)).await.unwrap();
        assert_eq!(provisioned, Provisioned::Started);
        let calls = manager.engine().calls();
        assert!(calls.contains(&format!("start:{}", name)));
        assert!(!calls.iter().any(|c| c.starts_with("create:")));
    }

    #[tokio::test]
    async fn test_running_container_is_reused() {
        let (_root, dirs) = workspace(&["app"]);
        let namer = SandboxManager::new(FakeEngine::new(), config()).unwrap();
        let name = namer.identity(&run_options(&dirs)).unwrap().name;

        let engine = FakeEngine::new()
            .with_image()
            .with_container(&name, true, labels_for(&dirs, &name));
        let manager = SandboxManager::new(engine, config()).unwrap();
        let identity = manager.identity(&run_options(&dirs)).unwrap();

        let provisioned = manager.provision(&identity, &run_options(&dirs)).await.unwrap();
        assert_eq!(provisioned, Provisioned::Reused);
        assert_eq!(manager.engine().calls(), vec![format!("inspect:{}", name)]);
    }

    #[tokio::test]
    async fn test_force_replace_recreates() {
        let (_root, dirs) = workspace(&["app"]);
        let namer = SandboxManager::new(FakeEngine::new(), config()).unwrap();
        let name = namer.identity(&run_options(&dirs)).unwrap().name;

        let engine = FakeEngine::new()
            .with_image()
            .with_container(&name, true, HashMap::new());
        let manager = SandboxManager::new(engine, config()).unwrap();
        let options = RunOptions {
            force_replace: true,
            ..run_options(&dirs)
        };
        let identity = manager.identity(&options).unwrap();

        assert_eq!(manager.provision(&identity, &options).await.unwrap(), Provisioned::Created);
        let calls = manager.engine().calls();
        assert!(position(&calls, &format!("remove:{}", name)) < position(&calls, &format!("create:{}", name)));
        assert!(manager.engine().container(&name).unwrap().spec.is_some());
    }

    #[tokio::test]
    async fn test_name_conflict_falls_back_to_reuse() {
        let (_root, dirs) = workspace(&["app"]);
        let namer = SandboxManager::new(FakeEngine::new(), config()).unwrap();
        let name = namer.identity(&run_options(&dirs)).unwrap().name;

        let engine = FakeEngine::new().with_image().race_on_create(labels_for(&dirs, &name));
        let manager = SandboxManager::new(engine, config()).unwrap();
        let identity = manager.identity(&run_options(&dirs)).unwrap();

        assert_eq!(
            manager.provision(&identity, &run_options(&dirs)).await.unwrap(),
            Provisioned::Reused
        );
    }

    #[tokio::test]
    async fn test_name_conflict_still_checks_drift() {
        let (_root, dirs) = workspace(&["a", "b"]);
        let requested = vec![dirs[1].clone()];
        let namer = SandboxManager::new(FakeEngine::new(), config()).unwrap();
        let name = namer.identity(&run_options(&requested)).unwrap().name;

        let engine = FakeEngine::new()
            .with_image()
            .race_on_create(labels_for(&dirs[..1], &name));
        let manager = SandboxManager::new(engine, config()).unwrap();
        let options = RunOptions {
            strict_mounts: true,
            ..run_options(&requested)
        };

        let err = manager.run(&options).await.unwrap_err();
        assert!(matches!(err, SandboxError::Drift { .. }));
    }

    #[tokio::test]
    async fn test_bridge_container_is_not_reused_for_host_network() {
        let (_root, dirs) = workspace(&["app"]);
        let namer = SandboxManager::new(FakeEngine::new(), config()).unwrap();
        let name = namer.identity(&run_options(&dirs)).unwrap().name;

        let engine = FakeEngine::new()
            .with_image()
            .with_container(&name, true, network_labels_for(&dirs, &name, false));
        let manager = SandboxManager::new(engine, config()).unwrap();
        let options = RunOptions {
            host_network: true,
            ..run_options(&dirs)
        };

        let err = manager.run(&options).await.unwrap_err();
        match &err {
            SandboxError::NetworkMismatch { recorded, requested, .. } => {
                assert_eq!(recorded, "bridge");
                assert_eq!(requested, "host");
            }
            other => panic!("unexpected error: {}", other),
        }
        assert!(err.to_string().contains("--replace"));
        assert!(manager.engine().exec_calls().is_empty());
        assert!(!manager.engine().calls().iter().any(|c| c.starts_with("attach:")));
    }

    #[tokio::test]
    async fn test_host_container_is_not_reused_for_bridge_network() {
        let (_root, dirs) = workspace(&["app"]);
        let namer = SandboxManager::new(FakeEngine::new(), config()).unwrap();
        let name = namer.identity(&run_options(&dirs)).unwrap().name;

        let engine = FakeEngine::new()
            .with_image()
            .with_container(&name, false, network_labels_for(&dirs, &name, true));
        let manager = SandboxManager::new(engine, config()).unwrap();

        let err = manager.run(&run_options(&dirs)).await.unwrap_err();
        match &err {
            SandboxError::NetworkMismatch { recorded, requested, .. } => {
                assert_eq!(recorded, "host");
                assert_eq!(requested, "bridge");
            }
            other => panic!("unexpected error: {}", other),
        }
        let calls = manager.engine().calls();
        assert!(!calls.iter().any(|c| c.starts_with("start:") || c.starts_with("exec:")));
    }

    #[tokio::test]
    async fn test_unlabelled_network_is_not_reused() {
        let (_root, dirs) = workspace(&["app"]);
        let namer = SandboxManager::new(FakeEngine::new(), config()).unwrap();
        let name = namer.identity(&run_options(&dirs)).unwrap().name;

        let mut recorded = labels_for(&dirs, &name);
        recorded.remove(labels::NETWORK);
        let engine = FakeEngine::new().with_image().with_container(&name, true, recorded);
        let manager = SandboxManager::new(engine, config()).unwrap();

        let err = manager.run(&run_options(&dirs)).await.unwrap_err();
        assert!(
            matches!(&err, SandboxError::NetworkMismatch { recorded, .. } if recorded == "unknown"),
            "{}",
            err
        );
    }

    #[tokio::test]
    async fn test_name_conflict_checks_network_mode() {
        let (_root, dirs) = workspace(&["app"]);
        let namer = SandboxManager::new(FakeEngine::new(), config()).unwrap();
        let name = namer.identity(&run_options(&dirs)).unwrap().name;

        let engine = FakeEngine::new()
            .with_image()
            .race_on_create(network_labels_for(&dirs, &name, true));
        let manager = SandboxManager::new(engine, config()).unwrap();

        let err = manager.run(&run_options(&dirs)).await.unwrap_err();
        assert!(matches!(err, SandboxError::NetworkMismatch { .. }), "{}", err);
        assert!(manager.engine().exec_calls().is_empty());
        assert!(manager.engine().container(&name).is_some());
    }

    #[tokio::test]
    async fn test_parallel_gets_its_own_container() {
        let (_root, dirs) = workspace(&["app"]);
        let namer = SandboxManager::new(FakeEngine::new(), config()).unwrap();
        let base = namer.identity(&run_options(&dirs)).unwrap().name;

        let engine = FakeEngine::new()
            .with_image()
            .with_container(&base, true, labels_for(&dirs, &base));
        let manager = SandboxManager::new(engine, config()).unwrap();
        let options = RunOptions {
            always_parallel: true,
            ..run_options(&dirs)
        };
        let identity = manager.identity(&options).unwrap();
        assert!(identity.name.starts_with(&format!("{}-", base)));

        assert_eq!(manager.provision(&identity, &options).await.unwrap(), Provisioned::Created);
        assert!(manager.engine().container(&base).is_some());
        assert!(manager.engine().container(&identity.name).is_some());
    }

    #[tokio::test]
    async fn test_invalid_flags_fail_before_side_effects() {
        let (_root, dirs) = workspace(&["app"]);
        let manager = SandboxManager::new(FakeEngine::new(), config()).unwrap();

        let options = RunOptions {
            name_override: Some("-bad name".to_string()),
            ..run_options(&dirs)
        };
        let err = manager.run(&options).await.unwrap_err();
        assert!(matches!(err, SandboxError::Validation(ValidationError::InvalidName(_))));

        let options = RunOptions {
            force_replace: true,
            always_parallel: true,
            ..run_options(&dirs)
        };
        assert!(manager.run(&options).await.is_err());

        let options = run_options(&[dirs[0].join("missing")]);
        let err = manager.run(&options).await.unwrap_err();
        assert!(matches!(err, SandboxError::Validation(ValidationError::NotADirectory(_))));

        assert!(manager.engine().calls().is_empty());
    }

    #[tokio::test]
    async fn test_name_override() {
        let (_root, dirs) = workspace(&["app"]);
        let manager = SandboxManager::new(FakeEngine::new().with_image(), config()).unwrap();
        let options = RunOptions {
            name_override: Some("scratch".to_string()),
            ..run_options(&dirs)
        };

        manager.run(&options).await.unwrap();
        let container = manager.engine().container("scratch").unwrap();
        assert!(container.labels.contains_key(labels::SIGNATURE));
    }

    #[tokio::test]
    async fn test_host_network_clears_firewall() {
        let (_root, dirs) = workspace(&["app"]);
        let manager = SandboxManager::new(FakeEngine::new().with_image(), config()).unwrap();
        let options = RunOptions {
            host_network: true,
            ..run_options(&dirs)
        };
        let name = manager.identity(&options).unwrap().name;

        manager.run(&options).await.unwrap();
        assert!(manager.engine().container(&name).unwrap().spec.unwrap().host_network);
        assert_eq!(
            manager.engine().exec_calls(),
            vec![vec![SANDBOX_BINARY_PATH.to_string(), "firewall".to_string(), "clear".to_string()]]
        );
    }

    #[tokio::test]
    async fn test_firewall_failure_is_fatal() {
        let (_root, dirs) = workspace(&["app"]);
        let engine = FakeEngine::new().with_image().with_exec_result(ExecOutput {
            exit_code: 1,
            stdout: String::new(),
            stderr: "firewall verification failed: https://example.com is reachable\n".to_string(),
        });
        let manager = SandboxManager::new(engine, config()).unwrap();
        let name = manager.identity(&run_options(&dirs)).unwrap().name;

        let err = manager.run(&run_options(&dirs)).await.unwrap_err();
        assert!(matches!(err, SandboxError::Firewall(_)));
        assert!(err.to_string().contains("example.com is reachable"));
        assert!(!manager.engine().calls().iter().any(|c| c.starts_with("attach:")));
        assert!(manager.engine().container(&name).is_some());
    }

    #[tokio::test]
    async fn test_attach_exit_code_is_returned() {
        let (_root, dirs) = workspace(&["app"]);
        let engine = FakeEngine::new().with_image().with_attach_exit_code(3);
        let manager = SandboxManager::new(engine, config()).unwrap();
        assert_eq!(manager.run(&run_options(&dirs)).await.unwrap(), 3);
    }

    #[test]
    fn test_firewall_argv_carries_config() {
        let mut config = config();
        config.firewall.extra_allowed_domains = vec!["crates.io".to_string()];
        config.firewall.allowed_probe = Some("https://crates.io".to_string());
        let manager = SandboxManager::new(FakeEngine::new(), config).unwrap();

        assert_eq!(
            manager.firewall_argv(false),
            vec![
                SANDBOX_BINARY_PATH,
                "firewall",
                "apply",
                "--allow-domain",
                "crates.io",
                "--blocked-probe",
                "https://example.com",
                "--allowed-probe",
                "https://crates.io",
            ]
        );
    }

    #[test]
    fn test_container_spec_passes_through_env() {
        let (_root, dirs) = workspace(&["app"]);
        let manager = SandboxManager::new(FakeEngine::new(), config()).unwrap();
        let identity = manager.identity(&run_options(&dirs)).unwrap();

        let host_env = [
            ("PATH", "/usr/bin"),
            ("OPENAI_API_KEY", "sk-2"),
            ("ANTHROPIC_API_KEY", "sk-1"),
        ]
        .map(|(k, v)| (k.to_string(), v.to_string()));

        let spec = manager.container_spec(&identity, false, host_env.clone()).unwrap();
        assert_eq!(spec.env, vec!["ANTHROPIC_API_KEY=sk-1", "OPENAI_API_KEY=sk-2"]);
        assert_eq!(spec.image, "agentbox");

        let mut config = config();
        config.image.passthrough_env = vec!["*_API_KEY".to_string(), "PATH".to_string()];
        let manager = SandboxManager::new(FakeEngine::new(), config).unwrap();
        let spec = manager.container_spec(&identity, false, host_env).unwrap();
        assert_eq!(spec.env.len(), 3);
    }

    #[test]
    fn test_mount_targets_suffix_collisions() {
        let mounts = vec![
            PathBuf::from("/home/me/app"),
            PathBuf::from("/srv/app"),
            PathBuf::from("/srv/app-2"),
            PathBuf::from("/tmp/app"),
        ];
        let targets: Vec<String> = mount_targets(&mounts).into_iter().map(|m| m.target).collect();
        assert_eq!(
            targets,
            vec!["/workspace/app", "/workspace/app-2", "/workspace/app-2-2", "/workspace/app-3"]
        );
    }

    #[test]
    fn test_validate_container_name() {
        assert!(validate_container_name("agentbox-app-1234abcd").is_ok());
        assert!(validate_container_name("a.b_c").is_ok());
        assert!(validate_container_name("").is_err());
        assert!(validate_container_name("_x").is_err());
        assert!(validate_container_name("has space").is_err());
    }

    fn seeded_engine() -> FakeEngine {
        let labelled = |sig: &str| HashMap::from([(labels::SIGNATURE.to_string(), sig.to_string())]);
        FakeEngine::new()
            .with_container("agentbox-a-11111111", true, labelled("11111111"))
            .with_container("agentbox-b-22222222", false, labelled("22222222"))
            .with_container("agentbox-b-22222222-2", true, labelled("22222222"))
            .with_container("unrelated", true, HashMap::new())
    }

    #[tokio::test]
    async fn test_destroy_by_name_and_signature() {
        let manager = SandboxManager::new(seeded_engine(), config()).unwrap();
        let mut chooser = NonInteractiveChooser;

        let removed = manager
            .destroy(
                &DestroyOptions {
                    name: Some("agentbox-a-11111111".to_string()),
                    force: true,
                    ..Default::default()
                },
                &mut chooser,
            )
            .await
            .unwrap();
        assert_eq!(removed, vec!["agentbox-a-11111111"]);

        let removed = manager
            .destroy(
                &DestroyOptions {
                    signature: Some("22222222".to_string()),
                    state: StateFilter::Running,
                    force: true,
                    ..Default::default()
                },
                &mut chooser,
            )
            .await
            .unwrap();
        assert_eq!(removed, vec!["agentbox-b-22222222-2"]);
        assert!(manager.engine().container("agentbox-b-22222222").is_some());
        assert!(manager.engine().container("unrelated").is_some());

        let err = manager
            .destroy(
                &DestroyOptions {
                    name: Some("unrelated".to_string()),
                    force: true,
                    ..Default::default()
                },
                &mut chooser,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Engine(EngineError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_destroy_refuses_to_guess() {
        let manager = SandboxManager::new(seeded_engine(), config()).unwrap();
        let mut chooser = NonInteractiveChooser;

        assert!(manager
            .destroy(&DestroyOptions::default(), &mut chooser)
            .await
            .is_err());
        assert!(manager
            .destroy(
                &DestroyOptions {
                    all: true,
                    ..Default::default()
                },
                &mut chooser,
            )
            .await
            .is_err());
        assert!(!manager.engine().calls().iter().any(|c| c.starts_with("remove:")));

        let removed = manager
            .destroy(
                &DestroyOptions {
                    all: true,
                    force: true,
                    ..Default::default()
                },
                &mut chooser,
            )
            .await
            .unwrap();
        assert_eq!(removed.len(), 3);
        assert!(manager.engine().container("unrelated").is_some());
    }
}
