//! Configuration System
//!
//! Layered loading, lowest precedence first:
//! - `~/.etb.toml` (user defaults)
//! - `./etb.toml` (per-directory settings)
//! - Environment variables (`ETB_` prefix, `__` section separator)
//! - Command-line flags (merged by the binaries, highest precedence)
//!
//! ```toml
//! # etb.toml
//! [node]
//! host = "0.0.0.0"
//! port = 26532
//! data_dir = "/var/lib/etb"
//! rule_files = ["rules/base.etb"]
//! ```

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration struct.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node settings, mirroring the daemon's command-line flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Listen address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Per-node working directory (blob store, workspace, scratch).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Directory of external wrapper manifests.
    #[serde(default)]
    pub wrappers_dir: Option<PathBuf>,

    /// Rule files loaded as permanent rules at startup.
    #[serde(default)]
    pub rule_files: Vec<PathBuf>,

    /// Log file path; stderr when unset.
    #[serde(default)]
    pub log: Option<PathBuf>,

    /// Overall deadline for one remote delegation, in seconds.
    #[serde(default = "default_remote_deadline")]
    pub remote_deadline_secs: u64,

    /// Transport retries per provider.
    #[serde(default = "default_remote_retries")]
    pub remote_retries: u32,

    /// Engine-level wrapper deadline in seconds; 0 disables it.
    #[serde(default)]
    pub wrapper_deadline_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    26532
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("./etb-data")
}
fn default_remote_deadline() -> u64 {
    60
}
fn default_remote_retries() -> u32 {
    3
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
            wrappers_dir: None,
            rule_files: Vec::new(),
            log: None,
            remote_deadline_secs: default_remote_deadline(),
            remote_retries: default_remote_retries(),
            wrapper_deadline_secs: 0,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load from the default locations: user-home config, then
    /// current-directory config, then environment.
    pub fn load() -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(home) = std::env::var_os("HOME") {
            figment = figment.merge(Toml::file(PathBuf::from(home).join(".etb.toml")));
        }
        figment
            .merge(Toml::file("etb.toml"))
            .merge(Env::prefixed("ETB_").split("__"))
            .extract()
    }

    /// Load a specific file (the `--conf` flag), still honouring the
    /// environment on top.
    pub fn from_file(path: &std::path::Path) -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("ETB_").split("__"))
            .extract()
    }

    pub fn engine_config(&self) -> crate::engine::EngineConfig {
        crate::engine::EngineConfig {
            remote_deadline: std::time::Duration::from_secs(self.node.remote_deadline_secs),
            remote_retries: self.node.remote_retries,
            wrapper_deadline: match self.node.wrapper_deadline_secs {
                0 => None,
                secs => Some(std::time::Duration::from_secs(secs)),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.node.port, 26532);
        assert_eq!(config.node.data_dir, PathBuf::from("./etb-data"));
        assert!(config.node.rule_files.is_empty());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_from_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("etb.toml");
        std::fs::write(
            &path,
            "[node]\nport = 9999\nrule_files = [\"a.etb\", \"b.etb\"]\n",
        )
        .unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.node.port, 9999);
        assert_eq!(config.node.rule_files.len(), 2);
        // Untouched keys keep their defaults.
        assert_eq!(config.node.host, "127.0.0.1");
    }

    #[test]
    fn test_engine_config_mapping() {
        let mut config = Config::default();
        config.node.wrapper_deadline_secs = 0;
        assert!(config.engine_config().wrapper_deadline.is_none());
        config.node.wrapper_deadline_secs = 5;
        assert_eq!(
            config.engine_config().wrapper_deadline,
            Some(std::time::Duration::from_secs(5))
        );
    }
}
