//! Runtime configuration
//!
//! Every field has a default, so an absent config file is the normal case.
//! The file is JSON:
//!
//! ```text
//! {
//!   "policy_path": "/sbin/supersu/suhide/suhide.uid",
//!   "proc_root": "/proc",
//!   "stop_timeout_ms": 128,
//!   "stop_poll_interval_ms": 1,
//!   "log_format": "text"
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Names a JSON config file
pub const CONFIG_ENV: &str = "ROOTCLOAK_CONFIG";

/// Overrides `policy_path`
pub const POLICY_ENV: &str = "ROOTCLOAK_POLICY";

pub const DEFAULT_POLICY_PATH: &str = "/sbin/supersu/suhide/suhide.uid";
pub const DEFAULT_PROC_ROOT: &str = "/proc";
pub const DEFAULT_STOP_TIMEOUT_MS: u64 = 128;
pub const DEFAULT_STOP_POLL_INTERVAL_MS: u64 = 1;

/// Log line encoding
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Tracer settings
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct TracerConfig {
    /// Hide policy file
    pub policy_path: PathBuf,
    /// procfs mount used for thread lists, uids, names and namespaces
    pub proc_root: PathBuf,
    /// Upper bound on waiting for a thread to stop before detaching it
    pub stop_timeout_ms: u64,
    pub stop_poll_interval_ms: u64,
    pub log_format: LogFormat,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            policy_path: PathBuf::from(DEFAULT_POLICY_PATH),
            proc_root: PathBuf::from(DEFAULT_PROC_ROOT),
            stop_timeout_ms: DEFAULT_STOP_TIMEOUT_MS,
            stop_poll_interval_ms: DEFAULT_STOP_POLL_INTERVAL_MS,
            log_format: LogFormat::Text,
        }
    }
}

impl TracerConfig {
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Build the config from the process environment.
    ///
    /// Always yields a usable config. A config file that cannot be loaded is
    /// returned alongside the defaults so the caller can log it once logging
    /// is up.
    pub fn load() -> (Self, Option<ConfigError>) {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// `load` with an injectable environment lookup
    pub fn load_with<F>(lookup: F) -> (Self, Option<ConfigError>)
    where
        F: Fn(&str) -> Option<String>,
    {
        let (config, error) = match lookup(CONFIG_ENV) {
            Some(path) => match Self::from_file(Path::new(&path)) {
                Ok(config) => (config, None),
                Err(e) => (Self::default(), Some(e)),
            },
            None => (Self::default(), None),
        };
        (config.with_env_overrides(lookup), error)
    }

    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(POLICY_ENV).filter(|p| !p.is_empty()) {
            self.policy_path = PathBuf::from(path);
        }
        self
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    /// Never zero, so the stop poll always sleeps between attempts
    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = TracerConfig::default();
        assert_eq!(config.policy_path, PathBuf::from("/sbin/supersu/suhide/suhide.uid"));
        assert_eq!(config.proc_root, PathBuf::from("/proc"));
        assert_eq!(config.stop_timeout(), Duration::from_millis(128));
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    fn test_partial_json_keeps_other_defaults() {
        let config = TracerConfig::from_json(r#"{"stop_timeout_ms": 50, "log_format": "json"}"#).unwrap();
        assert_eq!(config.stop_timeout_ms, 50);
        assert_eq!(config.log_format, LogFormat::Json);
        assert_eq!(config.proc_root, PathBuf::from(DEFAULT_PROC_ROOT));
    }

    #[test]
    fn test_malformed_json_is_a_parse_error() {
        assert!(matches!(
            TracerConfig::from_json("{not json"),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            TracerConfig::from_json(r#"{"log_format": "xml"}"#),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_zero_poll_interval_is_clamped() {
        let config = TracerConfig {
            stop_poll_interval_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.stop_poll_interval(), Duration::from_millis(1));
    }

    #[test]
    fn test_policy_env_overrides_path() {
        let (config, error) = TracerConfig::load_with(env(&[(POLICY_ENV, "/data/local/tmp/hide")]));
        assert!(error.is_none());
        assert_eq!(config.policy_path, PathBuf::from("/data/local/tmp/hide"));
    }

    #[test]
    fn test_missing_config_file_falls_back_to_defaults() {
        let (config, error) = TracerConfig::load_with(env(&[(CONFIG_ENV, "/nonexistent/rootcloak.json")]));
        assert!(matches!(error, Some(ConfigError::Io(_))));
        assert_eq!(config, TracerConfig::default());
    }

    #[test]
    fn test_config_file_then_env_override() {
        let path = std::env::temp_dir().join(format!("rootcloak-config-{}.json", std::process::id()));
        fs::write(&path, r#"{"policy_path": "/from/file", "proc_root": "/altproc"}"#).unwrap();

        let file = path.to_string_lossy().into_owned();
        let (config, error) = TracerConfig::load_with(env(&[(CONFIG_ENV, file.as_str()), (POLICY_ENV, "/from/env")]));
        assert!(error.is_none());
        assert_eq!(config.proc_root, PathBuf::from("/altproc"));
        assert_eq!(config.policy_path, PathBuf::from("/from/env"));

        fs::remove_file(&path).unwrap();
    }
}
