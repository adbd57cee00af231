//! Docker-backed container engine

use crate::engine::labels;
use crate::engine::{
    BuildOptions, ContainerEngine, ContainerSpec, ContainerState, ContainerSummary, ExecOutput,
};
use crate::error::{EngineError, Result, SandboxError};
use crate::utils::exec::command_exists;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, ListContainersOptions, LogOutput,
    LogsOptions, RemoveContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, Mount, MountTypeEnum};
use bollard::Docker;
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Container engine talking to the local Docker daemon
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect to the local Docker daemon
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            EngineError::command("connect", "docker", format!("failed to connect to Docker: {}", e))
        })?;

        // Verify Docker is running
        docker.ping().await.map_err(|e| {
            EngineError::command("ping", "docker", format!("Docker daemon not available: {}", e))
        })?;

        Ok(Self { docker })
    }

    /// Run the docker CLI with the caller's terminal attached
    async fn docker_cli(&self, operation: &'static str, target: &str, args: &[String]) -> Result<i32> {
        if !command_exists("docker") {
            return Err(SandboxError::CommandNotFound("docker".to_string()));
        }

        debug!("docker {}", shell_words::join(args));
        let status = Command::new("docker")
            .args(args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .status()
            .await
            .map_err(|e| EngineError::command(operation, target, e))?;

        Ok(status.code().unwrap_or(-1))
    }
}

fn is_status(err: &BollardError, code: u16) -> bool {
    matches!(err, BollardError::DockerResponseServerError { status_code, .. } if *status_code == code)
}

fn parse_created(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

fn mounts_for(spec: &ContainerSpec) -> Vec<Mount> {
    spec.mounts
        .iter()
        .map(|m| Mount {
            target: Some(m.target.clone()),
            source: Some(m.source.to_string_lossy().into_owned()),
            typ: Some(MountTypeEnum::BIND),
            ..Default::default()
        })
        .collect()
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn inspect(&self, name: &str) -> Result<ContainerState> {
        let response = match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(response) => response,
            Err(e) if is_status(&e, 404) => return Ok(ContainerState::absent()),
            Err(e) => return Err(EngineError::command("inspect", name, e).into()),
        };

        let running = response
            .state
            .as_ref()
            .and_then(|s| s.running)
            .unwrap_or(false);
        let labels = response
            .config
            .and_then(|c| c.labels)
            .unwrap_or_default();

        Ok(ContainerState {
            exists: true,
            running,
            labels,
            created_at: parse_created(response.created.as_deref()),
        })
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<()> {
        info!("Creating container {} from image {}", spec.name, spec.image);

        let host_config = HostConfig {
            mounts: Some(mounts_for(spec)),
            cap_add: Some(spec.cap_add.clone()),
            network_mode: spec.host_network.then(|| "host".to_string()),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            cmd: Some(spec.command.clone()),
            host_config: Some(host_config),
            tty: Some(true),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };

        match self.docker.create_container(Some(options), config).await {
            Ok(container) => debug!("Created container {} ({})", spec.name, container.id),
            Err(e) if is_status(&e, 409) => {
                return Err(EngineError::NameConflict(spec.name.clone()).into())
            }
            Err(e) => return Err(EngineError::command("create", &spec.name, e).into()),
        }

        self.start(&spec.name).await
    }

    async fn start(&self, name: &str) -> Result<()> {
        info!("Starting container: {}", name);

        self.docker
            .start_container::<String>(name, None)
            .await
            .map_err(|e| EngineError::command("start", name, e))?;

        Ok(())
    }

    async fn remove(&self, name: &str, force: bool) -> Result<()> {
        info!("Removing container: {}", name);

        match self
            .docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_status(&e, 404) => Err(EngineError::NotFound(name.to_string()).into()),
            Err(e) => Err(EngineError::command("remove", name, e).into()),
        }
    }

    async fn exec(&self, name: &str, argv: &[String]) -> Result<ExecOutput> {
        debug!("Executing in {}: {}", name, shell_words::join(argv));

        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(argv.to_vec()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    user: Some("root".to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| EngineError::command("exec", name, e))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| EngineError::command("exec", name, e))?
        {
            while let Some(msg) = output.next().await {
                match msg {
                    Ok(LogOutput::StdOut { message }) => stdout.extend_from_slice(&message),
                    Ok(LogOutput::StdErr { message }) => stderr.extend_from_slice(&message),
                    Err(e) => {
                        warn!("Error reading exec output: {}", e);
                    }
                    _ => {}
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| EngineError::command("exec", name, e))?;

        Ok(ExecOutput {
            exit_code: inspect.exit_code.unwrap_or(-1),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    async fn attach(&self, name: &str, argv: &[String]) -> Result<i32> {
        let mut args = vec!["exec".to_string(), "-it".to_string(), name.to_string()];
        args.extend(argv.iter().cloned());
        self.docker_cli("attach", name, &args).await
    }

    async fn image_exists(&self, tag: &str) -> Result<bool> {
        match self.docker.inspect_image(tag).await {
            Ok(_) => Ok(true),
            Err(e) if is_status(&e, 404) => Ok(false),
            Err(e) => Err(EngineError::command("image inspect", tag, e).into()),
        }
    }

    async fn build(&self, tag: &str, context_dir: &Path, options: &BuildOptions) -> Result<()> {
        info!("Building image {} from {}", tag, context_dir.display());

        let mut args = vec!["build".to_string(), "-t".to_string(), tag.to_string()];
        if options.no_cache {
            args.push("--no-cache".to_string());
        }
        let mut keys: Vec<&String> = options.build_args.keys().collect();
        keys.sort();
        for key in keys {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, options.build_args[key]));
        }
        args.push(context_dir.to_string_lossy().into_owned());

        let code = self.docker_cli("build", tag, &args).await?;
        if code != 0 {
            return Err(EngineError::command("build", tag, format!("docker build exited with status {}", code)).into());
        }
        Ok(())
    }

    async fn logs(&self, name: &str, tail: usize) -> Result<Vec<u8>> {
        let mut stream = self.docker.logs(
            name,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail: tail.to_string(),
                ..Default::default()
            }),
        );

        let mut out = Vec::new();
        while let Some(msg) = stream.next().await {
            match msg.map_err(|e| EngineError::command("logs", name, e))? {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => out.extend_from_slice(&message),
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok(out)
    }

    async fn list(&self) -> Result<Vec<ContainerSummary>> {
        let filters = HashMap::from([("label".to_string(), vec![labels::SIGNATURE.to_string()])]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| EngineError::command("list", "containers", e))?;

        let mut summaries: Vec<ContainerSummary> = containers
            .into_iter()
            .filter_map(|c| {
                let name = c
                    .names
                    .as_ref()
                    .and_then(|names| names.first())
                    .map(|n| n.trim_start_matches('/').to_string())?;
                Some(ContainerSummary {
                    name,
                    running: c.state.as_deref() == Some("running"),
                    labels: c.labels.unwrap_or_default(),
                    created_at: c.created.and_then(|secs| DateTime::from_timestamp(secs, 0)),
                })
            })
            .collect();
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(summaries)
    }
}
