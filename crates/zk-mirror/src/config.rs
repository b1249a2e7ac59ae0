//! Configuration loading and management

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// File name looked up by [`MirrorConfig::load`].
pub const CONFIG_FILE: &str = "zk-mirror.json";

/// Mirror configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Ensemble to connect to, `host:port[,host:port...]`
    #[serde(default = "default_connect_string")]
    pub connect_string: String,

    /// How long `open` waits for the session to connect (default: 3 seconds)
    #[serde(default = "default_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Session timeout requested from the ensemble (default: 3 seconds)
    #[serde(default = "default_timeout_ms")]
    pub session_timeout_ms: u64,

    /// Retries when a node gains children while being deleted
    #[serde(default = "default_delete_retries")]
    pub delete_retries: u32,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            connect_string: default_connect_string(),
            connect_timeout_ms: default_timeout_ms(),
            session_timeout_ms: default_timeout_ms(),
            delete_retries: default_delete_retries(),
        }
    }
}

fn default_connect_string() -> String {
    "127.0.0.1:2181".to_string()
}

fn default_timeout_ms() -> u64 {
    3000
}

fn default_delete_retries() -> u32 {
    3
}

impl MirrorConfig {
    /// Configuration targeting `connect_string`, defaults otherwise.
    pub fn new(connect_string: impl Into<String>) -> Self {
        Self {
            connect_string: connect_string.into(),
            ..Self::default()
        }
    }

    /// Load `zk-mirror.json` from `dir`, or defaults if the file is absent.
    pub fn load(dir: &Path) -> Result<Self, ConfigError> {
        let path = dir.join(CONFIG_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with environment variables.
    ///
    /// - `ZK_MIRROR_CONNECT`: connect string
    /// - `ZK_MIRROR_CONNECT_TIMEOUT_MS`: connect timeout in milliseconds
    /// - `ZK_MIRROR_SESSION_TIMEOUT_MS`: session timeout in milliseconds
    /// - `ZK_MIRROR_DELETE_RETRIES`: retries for recursive delete
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.overlay(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply variables returned by `lookup` on top of this configuration.
    pub fn overlay(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(connect) = lookup("ZK_MIRROR_CONNECT") {
            self.connect_string = connect;
        }
        if let Some(value) = lookup("ZK_MIRROR_CONNECT_TIMEOUT_MS") {
            self.connect_timeout_ms = parse_var("ZK_MIRROR_CONNECT_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("ZK_MIRROR_SESSION_TIMEOUT_MS") {
            self.session_timeout_ms = parse_var("ZK_MIRROR_SESSION_TIMEOUT_MS", &value)?;
        }
        if let Some(value) = lookup("ZK_MIRROR_DELETE_RETRIES") {
            self.delete_retries = parse_var("ZK_MIRROR_DELETE_RETRIES", &value)?;
        }
        self.validate()
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.connect_string.trim().is_empty() {
            return Err(ConfigError::Invalid("connect_string is empty".to_string()));
        }
        if self.connect_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "connect_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::BadVariable {
        name: name.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("{name} has an invalid value: '{value}'")]
    BadVariable { name: String, value: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = MirrorConfig::default();
        assert_eq!(config.connect_string, "127.0.0.1:2181");
        assert_eq!(config.connect_timeout(), Duration::from_millis(3000));
        assert_eq!(config.session_timeout_ms, 3000);
        assert_eq!(config.delete_retries, 3);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        let config = MirrorConfig::load(dir.path()).unwrap();
        assert_eq!(config, MirrorConfig::default());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"connect_string": "zk1:2181,zk2:2181", "delete_retries": 5}"#,
        )
        .unwrap();

        let config = MirrorConfig::load(dir.path()).unwrap();
        assert_eq!(config.connect_string, "zk1:2181,zk2:2181");
        assert_eq!(config.delete_retries, 5);
        assert_eq!(config.connect_timeout_ms, 3000);
    }

    #[test]
    fn test_load_rejects_bad_json() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{ not json").unwrap();
        assert!(matches!(
            MirrorConfig::load(dir.path()),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn test_overlay() {
        let vars: HashMap<&str, &str> = [
            ("ZK_MIRROR_CONNECT", "10.0.0.1:2181"),
            ("ZK_MIRROR_CONNECT_TIMEOUT_MS", "250"),
        ]
        .into_iter()
        .collect();

        let mut config = MirrorConfig::default();
        config
            .overlay(|name| vars.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.connect_string, "10.0.0.1:2181");
        assert_eq!(config.connect_timeout_ms, 250);
        assert_eq!(config.delete_retries, 3);
    }

    #[test]
    fn test_overlay_rejects_garbage() {
        let mut config = MirrorConfig::default();
        let err = config
            .overlay(|name| (name == "ZK_MIRROR_DELETE_RETRIES").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::BadVariable { .. }));
    }

    #[test]
    fn test_zero_timeout_is_invalid() {
        let mut config = MirrorConfig::default();
        let err = config
            .overlay(|name| (name == "ZK_MIRROR_CONNECT_TIMEOUT_MS").then(|| "0".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}
