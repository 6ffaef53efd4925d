//! Configuration loading: CLI flags > `BROKER_*` env vars > JSON config
//! file > built-in defaults. [`Config::load`] handles the file and env
//! layers; the CLI layer is merged in by the caller, which must then call
//! [`Config::validate`] once over the fully-merged result.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Broker configuration. Mirrors the external-interfaces configuration
/// keys plus the peer allow-lists.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
    #[serde(default = "default_systemd_enabled")]
    pub systemd_enabled: bool,
    #[serde(default = "default_receiver_unit")]
    pub receiver_unit: String,
    #[serde(default)]
    pub receiver_path: Option<PathBuf>,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub allowed_peer_uids: Vec<u32>,
    #[serde(default)]
    pub allowed_peer_gids: Vec<u32>,
}

fn default_systemd_enabled() -> bool {
    crate::systemd::detected()
}

fn default_receiver_unit() -> String {
    "haproxy".to_string()
}

fn default_listen_port() -> u16 {
    443
}

impl Default for Config {
    fn default() -> Self {
        Self {
            systemd_enabled: default_systemd_enabled(),
            receiver_unit: default_receiver_unit(),
            receiver_path: None,
            listen_port: default_listen_port(),
            allowed_peer_uids: Vec::new(),
            allowed_peer_gids: Vec::new(),
        }
    }
}

impl Config {
    /// Platform config directory, e.g. `~/.config/connbroker` on Linux.
    /// Overridable with `BROKER_CONFIG_DIR` for tests and unusual
    /// deployments.
    pub fn config_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("BROKER_CONFIG_DIR") {
            return PathBuf::from(dir);
        }
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("connbroker")
    }

    /// Loads configuration from `explicit_path` (from `--config`) or the
    /// platform config file, then applies env overrides. A missing config
    /// file is not an error.
    ///
    /// Deliberately does not validate: CLI flags are merged in by the
    /// caller after this returns, and only the fully-merged config (file +
    /// env + CLI) reflects what the user actually asked for. Call
    /// [`Config::validate`] once that merge is done.
    pub fn load(explicit_path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let mut config = match explicit_path {
            Some(path) => Self::load_from_file(path)?,
            None => {
                let default_path = Self::config_dir().join("config.json");
                if default_path.exists() {
                    Self::load_from_file(&default_path)?
                } else {
                    log::debug!("no config file at {}, using defaults", default_path.display());
                    Self::default()
                }
            }
        };

        config.apply_env_overrides();
        Ok(config)
    }

    fn load_from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("BROKER_SYSTEMD_ENABLED") {
            if let Ok(b) = v.parse() {
                self.systemd_enabled = b;
            }
        }
        if let Ok(v) = std::env::var("BROKER_RECEIVER_UNIT") {
            self.receiver_unit = v;
        }
        if let Ok(v) = std::env::var("BROKER_RECEIVER_PATH") {
            self.receiver_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("BROKER_LISTEN_PORT") {
            if let Ok(p) = v.parse() {
                self.listen_port = p;
            }
        }
    }

    /// `ReceiverPath` empty while `SystemdEnabled` is false has no way to
    /// ever spawn a child, and a zero `ListenPort` can never bind — both
    /// are caught here rather than surfacing later as a `SpawnFailed` once
    /// sockets are already open.
    ///
    /// Callers must run this after merging in CLI overrides (see
    /// [`Config::load`]), not before, so a flag like `--receiver-path` or
    /// `--no-systemd` gets to satisfy (or violate) the invariant it affects.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.systemd_enabled && self.receiver_path.is_none() {
            return Err(ConfigError::MissingReceiverPath);
        }
        if self.listen_port == 0 {
            return Err(ConfigError::InvalidListenPort);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_standard_port_and_unit() {
        let config = Config::default();
        assert_eq!(config.listen_port, 443);
        assert_eq!(config.receiver_unit, "haproxy");
        assert!(config.allowed_peer_uids.is_empty());
    }

    #[test]
    fn validate_rejects_missing_receiver_path_without_systemd() {
        let config = Config {
            systemd_enabled: false,
            receiver_path: None,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingReceiverPath)
        ));
    }

    #[test]
    fn validate_rejects_zero_listen_port() {
        let config = Config {
            systemd_enabled: true,
            listen_port: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidListenPort)
        ));
    }

    #[test]
    fn validate_accepts_systemd_enabled_without_receiver_path() {
        let config = Config {
            systemd_enabled: true,
            receiver_path: None,
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn load_from_missing_file_reports_read_error() {
        let config = Config::load(Some(std::path::Path::new("/nonexistent/broker.json")));
        assert!(matches!(config, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn round_trips_through_json() {
        let config = Config {
            receiver_path: Some(PathBuf::from("/usr/local/bin/receiver")),
            ..Config::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let loaded: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(loaded.listen_port, config.listen_port);
        assert_eq!(loaded.receiver_path, config.receiver_path);
    }
}
