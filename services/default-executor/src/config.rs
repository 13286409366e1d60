//! Startup configuration: environment intake and command-line flags.
//!
//! The agent hands the executor its identity and endpoint through the
//! environment; the only flag is the launcher directory consumed by the
//! check engines.

use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;

use mesos_proto::{ExecutorId, FrameworkId};

/// Command-line flags.
#[derive(Debug, Parser)]
#[command(name = "mesos-default-executor")]
pub struct Flags {
    /// Directory containing helper binaries used by the check engines.
    #[arg(long = "launcher_dir", default_value = "/usr/libexec/mesos")]
    pub launcher_dir: PathBuf,
}

/// Errors surfaced while assembling the startup configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("expecting '{0}' to be set in the environment")]
    MissingEnv(&'static str),

    #[error("failed to parse agent PID '{pid}': {reason}")]
    InvalidAgentPid { pid: String, reason: String },

    #[error("failed to build agent endpoint URL: {0}")]
    InvalidEndpoint(String),
}

/// Resolved executor configuration, immutable after startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub framework_id: FrameworkId,
    pub executor_id: ExecutorId,

    /// Agent API endpoint, derived from `MESOS_SLAVE_PID`.
    pub agent: reqwest::Url,

    /// The executor's sandbox directory.
    pub sandbox_directory: PathBuf,

    /// Directory of helper binaries for the check engines.
    pub launcher_dir: PathBuf,

    /// `Authorization` header value attached to every agent call.
    pub authorization_header: Option<String>,
}

impl Config {
    /// Reads configuration from the environment the agent prepared.
    pub fn from_env(flags: Flags) -> Result<Self, ConfigError> {
        let framework_id = require_env("MESOS_FRAMEWORK_ID")?.into();
        let executor_id = require_env("MESOS_EXECUTOR_ID")?.into();

        let scheme = if ssl_enabled() { "https" } else { "http" };
        let pid = require_env("MESOS_SLAVE_PID")?;
        let agent = agent_endpoint(scheme, &pid)?;

        let sandbox_directory = PathBuf::from(require_env("MESOS_SANDBOX")?);

        let authorization_header = std::env::var("MESOS_EXECUTOR_AUTHENTICATION_TOKEN")
            .ok()
            .map(|token| format!("Bearer {}", token));

        Ok(Self {
            framework_id,
            executor_id,
            agent,
            sandbox_directory,
            launcher_dir: flags.launcher_dir,
            authorization_header,
        })
    }
}

fn require_env(name: &'static str) -> Result<String, ConfigError> {
    std::env::var(name).map_err(|_| ConfigError::MissingEnv(name))
}

fn ssl_enabled() -> bool {
    ["SSL_ENABLED", "LIBPROCESS_SSL_ENABLED"]
        .iter()
        .filter_map(|name| std::env::var(name).ok())
        .any(|value| value == "1" || value == "true")
}

/// Derives the agent API endpoint from an actor address of the form
/// `id@ip:port`: `<scheme>://<ip>:<port>/<id>/api/v1`.
pub fn agent_endpoint(scheme: &str, pid: &str) -> Result<reqwest::Url, ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidAgentPid {
        pid: pid.to_string(),
        reason: reason.to_string(),
    };

    let (id, address) = pid.split_once('@').ok_or_else(|| invalid("missing '@'"))?;
    if id.is_empty() {
        return Err(invalid("empty actor id"));
    }

    let (ip, port) = address
        .rsplit_once(':')
        .ok_or_else(|| invalid("missing port"))?;
    let port: u16 = port.parse().map_err(|_| invalid("invalid port"))?;
    let _: std::net::IpAddr = ip.parse().map_err(|_| invalid("invalid IP address"))?;

    let url = format!("{}://{}:{}/{}/api/v1", scheme, ip, port, id);
    reqwest::Url::parse(&url).map_err(|e| ConfigError::InvalidEndpoint(e.to_string()))
}
