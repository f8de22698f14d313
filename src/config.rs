//! Server configuration from flags and `WEBTERM_*` environment variables.

use clap::Args;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::executor::{ExecConfig, DEFAULT_MAX_OUTPUT_BYTES, DEFAULT_SHELL};
use crate::history::DEFAULT_QUEUE_CAPACITY;
use crate::store::DEFAULT_HISTORY_LIMIT;

/// Resolved settings for one server instance.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    pub sandbox_base: PathBuf,
    pub exec: ExecConfig,
    pub history_limit: usize,
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 5000),
            sandbox_base: default_sandbox_base(),
            exec: ExecConfig::default(),
            history_limit: DEFAULT_HISTORY_LIMIT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// `<system temp>/webterminal`
pub fn default_sandbox_base() -> PathBuf {
    std::env::temp_dir().join("webterminal")
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Address to bind
    #[arg(long, env = "WEBTERM_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to listen on
    #[arg(long, env = "WEBTERM_PORT", default_value = "5000")]
    pub port: u16,

    /// Directory holding per-session sandboxes [default: <tmp>/webterminal]
    #[arg(long, env = "WEBTERM_SANDBOX_BASE")]
    pub sandbox_base: Option<PathBuf>,

    /// Shell used to run commands
    #[arg(long, env = "WEBTERM_SHELL", default_value = DEFAULT_SHELL)]
    pub shell: PathBuf,

    /// Wall-clock limit per command in seconds
    #[arg(long, env = "WEBTERM_TIMEOUT_SECS", default_value = "30")]
    pub timeout_secs: u64,

    /// Combined stdout+stderr cap per command
    #[arg(long, env = "WEBTERM_MAX_OUTPUT_BYTES", default_value_t = DEFAULT_MAX_OUTPUT_BYTES)]
    pub max_output_bytes: usize,

    /// Default number of commands returned by the history endpoint
    #[arg(long, env = "WEBTERM_HISTORY_LIMIT", default_value_t = DEFAULT_HISTORY_LIMIT)]
    pub history_limit: usize,

    /// Capacity of the persistence queue
    #[arg(long, env = "WEBTERM_QUEUE_CAPACITY", default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,
}

impl From<ServeArgs> for ServerConfig {
    fn from(args: ServeArgs) -> Self {
        Self {
            addr: SocketAddr::new(args.host, args.port),
            sandbox_base: args.sandbox_base.unwrap_or_else(default_sandbox_base),
            exec: ExecConfig {
                shell: args.shell,
                timeout: Duration::from_secs(args.timeout_secs),
                max_output_bytes: args.max_output_bytes,
            },
            history_limit: args.history_limit,
            queue_capacity: args.queue_capacity,
        }
    }
}
