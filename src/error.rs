//! Error types shared by the tracer binary and library
//!
//! Only a handful of conditions are ever surfaced as errors. Everything that
//! happens inside the trace loop is logged and absorbed; see the tracer module.

use nix::errno::Errno;

/// Error type for tracer startup and invocation
#[derive(Debug)]
pub enum TracerError {
    /// Wrong number of command line arguments
    Usage(String),
    /// The spawner pid argument is not a positive integer
    InvalidPid(String),
    /// PTRACE_ATTACH on the spawner failed
    AttachFailed { pid: i32, errno: Errno },
}

impl std::fmt::Display for TracerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TracerError::Usage(program) => write!(f, "Usage: {} <pid>", program),
            TracerError::InvalidPid(arg) => write!(f, "Invalid pid passed [{}]", arg),
            TracerError::AttachFailed { pid, errno } => {
                write!(f, "Attach to [{}] failed: {} ({})", pid, errno, *errno as i32)
            }
        }
    }
}

impl std::error::Error for TracerError {}

/// Error type for loading the runtime configuration
#[derive(Debug)]
pub enum ConfigError {
    /// The config file could not be read
    Io(std::io::Error),
    /// The config file is not valid JSON for `TracerConfig`
    Parse(serde_json::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "Failed to read config: {}", e),
            ConfigError::Parse(e) => write!(f, "Failed to parse config: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(e: serde_json::Error) -> Self {
        ConfigError::Parse(e)
    }
}
