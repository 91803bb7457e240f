//! Server configuration context.

use std::{path::PathBuf, time::Duration};

/// Explicit configuration passed through every constructor.
///
/// There is deliberately no process-wide singleton; `Default` is the only
/// convenience and every field can be overridden per instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the server binds to.
    pub bind_addr: String,

    /// Hard cap on concurrent client connections. Connections past the cap
    /// are rejected immediately, never queued.
    pub max_connections: usize,

    /// Interval between registry sweep iterations.
    pub sweep_interval: Duration,

    /// Terminal sessions older than this are reclaimed by the sweep.
    /// Non-terminal sessions idle for twice this long are treated as
    /// abandoned and reclaimed too.
    pub session_max_age: Duration,

    /// Client-visible hint attached to input-request notifications.
    /// The server itself never expires a pending request.
    pub input_timeout_hint: Duration,

    /// Directory that save/convert paths are resolved against and where
    /// flow programs are staged for subprocess runners.
    pub workspace_dir: PathBuf,

    /// Base command line for the flow interpreter, split with shlex.
    pub runner_command: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8765".to_string(),
            max_connections: 100,
            sweep_interval: Duration::from_secs(60),
            session_max_age: Duration::from_secs(300),
            input_timeout_hint: Duration::from_secs(300),
            workspace_dir: PathBuf::from("."),
            runner_command: "python3 -u".to_string(),
        }
    }
}

impl ServerConfig {
    /// Override the maximum connection count.
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Override the sweep timing.
    #[must_use]
    pub fn with_sweep(mut self, interval: Duration, max_age: Duration) -> Self {
        self.sweep_interval = interval;
        self.session_max_age = max_age;
        self
    }

    /// Override the workspace directory.
    #[must_use]
    pub fn with_workspace_dir(mut self, dir: PathBuf) -> Self {
        self.workspace_dir = dir;
        self
    }
}
