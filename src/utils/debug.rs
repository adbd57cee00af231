//! Logging setup

use tracing_subscriber::{fmt, EnvFilter};

/// Process-wide tracing subscriber
pub struct DebugLogger;

impl DebugLogger {
    /// Initialize the logger.
    ///
    /// `RUST_LOG` wins when set; otherwise `debug` selects debug level for
    /// this crate and info everywhere else.
    pub fn init(debug: bool) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            if debug {
                EnvFilter::new("agent_sandbox=debug,agentbox=debug")
            } else {
                EnvFilter::new("agent_sandbox=info,agentbox=info")
            }
        });

        fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_thread_ids(false)
            .with_line_number(debug)
            .init();
    }
}
