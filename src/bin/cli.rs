//! CLI binary for the agent sandbox

use agent_sandbox::{
    config::SandboxConfig,
    engine::DockerEngine,
    error::SandboxError,
    firewall::{CurlProber, DigResolver, Firewall, Probes, SystemRunner},
    sandbox::{select_chooser, DestroyOptions, RunOptions, SandboxManager, StateFilter},
    utils::debug::DebugLogger,
    workspace::WorkspaceIdentity,
    VERSION,
};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

#[derive(Parser)]
#[command(name = "agentbox")]
#[command(about = "Network-restricted sandboxes for AI coding agents", long_about = None)]
#[command(version = VERSION)]
#[command(args_conflicts_with_subcommands = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    run: RunArgs,

    /// Path to settings file
    #[arg(short, long, global = true, env = "AGENTBOX_SETTINGS")]
    settings: Option<String>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Salt mixed into workspace signatures
    #[arg(long, global = true, env = "AGENTBOX_NAME_SALT", hide_env_values = true)]
    salt: Option<String>,

    /// Container name prefix
    #[arg(long, global = true, env = "AGENTBOX_NAME_PREFIX")]
    prefix: Option<String>,

    /// Allow an extra domain, IP or CIDR (can be used multiple times)
    #[arg(
        long = "allow-domain",
        global = true,
        env = "AGENTBOX_ALLOW_DOMAINS",
        value_delimiter = ','
    )]
    allowed_domains: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Provision (or reuse) the sandbox for a workspace and attach to it
    Run(RunArgs),

    /// Build the sandbox image
    Build {
        /// Do not use the build cache
        #[arg(long)]
        no_cache: bool,
    },

    /// Print the identity derived for a workspace
    Identity {
        /// Workspace directories (default: current directory)
        dirs: Vec<PathBuf>,
    },

    /// Remove sandbox containers
    Destroy {
        /// Container name
        #[arg(long, conflicts_with_all = ["signature", "all"])]
        name: Option<String>,

        /// Workspace signature
        #[arg(long, conflicts_with = "all")]
        signature: Option<String>,

        /// Every sandbox container
        #[arg(long)]
        all: bool,

        /// Only running containers
        #[arg(long, conflicts_with = "stopped")]
        running: bool,

        /// Only stopped containers
        #[arg(long)]
        stopped: bool,

        /// Do not ask for confirmation
        #[arg(short, long)]
        force: bool,
    },

    /// Manage the egress firewall (inside a sandbox, as root)
    Firewall {
        #[command(subcommand)]
        action: FirewallAction,
    },
}

#[derive(Args, Default)]
struct RunArgs {
    /// Workspace directories (default: current directory)
    dirs: Vec<PathBuf>,

    /// Use the host network and disable the sandbox firewall
    #[arg(long)]
    host_network: bool,

    /// Container name (skips name derivation)
    #[arg(long)]
    name: Option<String>,

    /// Start an additional sandbox for the same workspace
    #[arg(long)]
    parallel: bool,

    /// Remove and recreate an existing sandbox
    #[arg(long)]
    replace: bool,

    /// Fail if the existing sandbox was created for other directories
    #[arg(long)]
    strict_mounts: bool,
}

#[derive(Subcommand)]
enum FirewallAction {
    /// Install and verify the default-deny policy
    Apply {
        /// Skip the reachability self-check
        #[arg(long)]
        no_verify: bool,

        /// URL that must be unreachable after install
        #[arg(long)]
        blocked_probe: Option<String>,

        /// URL that must be reachable after install
        #[arg(long)]
        allowed_probe: Option<String>,
    },

    /// Remove all rules and accept all traffic
    Clear,
}

impl From<RunArgs> for RunOptions {
    fn from(args: RunArgs) -> Self {
        RunOptions {
            dirs: args.dirs,
            host_network: args.host_network,
            name_override: args.name,
            force_replace: args.replace,
            always_parallel: args.parallel,
            strict_mounts: args.strict_mounts,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logger
    DebugLogger::init(cli.debug);

    // Run and exit with appropriate code
    let exit_code = run(cli).await.unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        if let SandboxError::ReadinessTimeout { logs, .. } = &e {
            if !logs.is_empty() {
                eprintln!("Last container output:\n{}", logs);
            }
        }
        1
    });

    std::process::exit(exit_code);
}

fn load_config(cli: &Cli) -> agent_sandbox::Result<SandboxConfig> {
    let mut config = match &cli.settings {
        Some(path) => {
            let path = PathBuf::from(shellexpand::tilde(path).into_owned());
            SandboxConfig::from_file(&path)?
        }
        None => {
            let default_path = SandboxConfig::default_settings_path();
            if default_path.exists() {
                SandboxConfig::from_file(&default_path)?
            } else {
                SandboxConfig::default()
            }
        }
    };

    // Override with CLI arguments and environment
    if let Some(salt) = &cli.salt {
        config.naming.salt = Some(salt.clone());
    }
    if let Some(prefix) = &cli.prefix {
        config.naming.prefix = prefix.clone();
    }
    config
        .firewall
        .extra_allowed_domains
        .extend(cli.allowed_domains.iter().filter(|d| !d.trim().is_empty()).cloned());

    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli) -> agent_sandbox::Result<i32> {
    let mut config = load_config(&cli)?;

    match cli.command {
        None => run_sandbox(config, cli.run).await,
        Some(Commands::Run(args)) => run_sandbox(config, args).await,

        Some(Commands::Build { no_cache }) => {
            let manager = SandboxManager::new(DockerEngine::connect().await?, config)?;
            manager.build_image(no_cache).await?;
            Ok(0)
        }

        Some(Commands::Identity { dirs }) => {
            let identity = WorkspaceIdentity::derive(&dirs, &config.naming)?;
            println!("name:      {}", identity.name);
            println!("signature: {}", identity.signature);
            println!("slug:      {}", identity.slug);
            println!("mounts:");
            for mount in &identity.mounts {
                println!("  {}", mount.display());
            }
            Ok(0)
        }

        Some(Commands::Destroy {
            name,
            signature,
            all,
            running,
            stopped,
            force,
        }) => {
            let state = match (running, stopped) {
                (true, _) => StateFilter::Running,
                (_, true) => StateFilter::Stopped,
                _ => StateFilter::Any,
            };
            let options = DestroyOptions {
                name,
                signature,
                all,
                state,
                force,
            };

            let manager = SandboxManager::new(DockerEngine::connect().await?, config)?;
            let mut chooser = select_chooser();
            let removed = manager.destroy(&options, chooser.as_mut()).await?;
            for name in removed {
                println!("{}", name);
            }
            Ok(0)
        }

        Some(Commands::Firewall { action }) => {
            require_root()?;
            let runner = SystemRunner;
            let resolver = DigResolver::new(&runner);
            let prober = CurlProber::new(&runner);
            let firewall = Firewall::new(&runner, &resolver, &prober);

            match action {
                FirewallAction::Apply {
                    no_verify,
                    blocked_probe,
                    allowed_probe,
                } => {
                    if let Some(url) = blocked_probe {
                        config.firewall.blocked_probe = url;
                    }
                    if let Some(url) = allowed_probe {
                        config.firewall.allowed_probe = Some(url);
                    }
                    config.validate()?;

                    let probes = Probes {
                        blocked: config.firewall.blocked_probe.clone(),
                        allowed: config.firewall.allowed_probe(),
                    };
                    let rules = firewall.apply(
                        &config.firewall.allowed_domains(),
                        (!no_verify).then_some(&probes),
                    )?;
                    debug!("Installed {} firewall commands", rules.commands.len());
                }
                FirewallAction::Clear => firewall.clear()?,
            }
            Ok(0)
        }
    }
}

async fn run_sandbox(config: SandboxConfig, args: RunArgs) -> agent_sandbox::Result<i32> {
    let manager = SandboxManager::new(DockerEngine::connect().await?, config)?;
    manager.run(&args.into()).await
}

#[cfg(unix)]
fn require_root() -> agent_sandbox::Result<()> {
    if nix::unistd::geteuid().is_root() {
        Ok(())
    } else {
        Err(SandboxError::Firewall(
            "firewall commands must run as root".to_string(),
        ))
    }
}

#[cfg(not(unix))]
fn require_root() -> agent_sandbox::Result<()> {
    Err(SandboxError::Firewall(
        "firewall commands are only supported on Linux".to_string(),
    ))
}
