// Server and client configuration.
//
// `ServerConfig` is a plain struct with a `Default` impl; the binary fills in a
// few fields from command-line flags and, optionally, a JSON config file
// (`ConfigFile`) that carries the alert levels, options and user list.
// Durations in the file are whole seconds.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use watchpost_protocol::arbiter::BackoffPolicy;
use watchpost_protocol::handshake::{MIN_CLIENT_VERSION, PROTOCOL_VERSION};
use watchpost_protocol::message::{AlertLevel, OptionEntry};

/// Name of the option that switches alert delivery to alert nodes on and off.
pub const ALERT_SYSTEM_ACTIVE: &str = "alertSystemActive";

/// Every wait a connection can block on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timeouts {
    /// From accept (or connect) until the handshake reaches `Active`.
    pub handshake: Duration,
    /// Each RTS/CTS/request/response step.
    pub exchange: Duration,
    /// Server side: no inbound traffic for this long closes the connection.
    pub idle: Duration,
    /// Client side: how often to ping when otherwise quiet.
    pub ping_interval: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            handshake: Duration::from_secs(30),
            exchange: Duration::from_secs(20),
            idle: Duration::from_secs(90),
            ping_interval: Duration::from_secs(30),
        }
    }
}

/// Configuration for starting a server.
#[derive(Clone, Debug)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    pub server_version: f64,
    pub min_client_version: f64,
    pub alert_levels: Vec<AlertLevel>,
    pub options: Vec<OptionEntry>,
    pub timeouts: Timeouts,
    pub backoff: BackoffPolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".into(),
            port: 44556,
            server_version: PROTOCOL_VERSION,
            min_client_version: MIN_CLIENT_VERSION,
            alert_levels: vec![AlertLevel {
                level: 0,
                name: "default".into(),
                trigger_always: false,
                smtp_activated: false,
                to_addr: String::new(),
            }],
            options: vec![OptionEntry {
                option_type: ALERT_SYSTEM_ACTIVE.into(),
                value: 1.0,
            }],
            timeouts: Timeouts::default(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("alert level {0} is defined twice")]
    DuplicateLevel(u32),
    #[error("option {0} is defined twice")]
    DuplicateOption(String),
}

/// A user entry of the config file.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UserEntry {
    pub username: String,
    pub password: String,
}

/// On-disk form of the parts of `ServerConfig` that do not fit on a command
/// line. Missing keys keep their defaults.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct ConfigFile {
    pub bind_addr: Option<String>,
    pub port: Option<u16>,
    pub min_client_version: Option<f64>,
    pub alert_levels: Option<Vec<AlertLevel>>,
    pub options: Vec<OptionEntry>,
    pub users: Vec<UserEntry>,
    pub exchange_timeout_secs: Option<u64>,
    pub idle_timeout_secs: Option<u64>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Overlay the file onto `config`. File options are merged into the
    /// defaults by name.
    pub fn apply(self, config: &mut ServerConfig) -> Result<(), ConfigError> {
        if let Some(bind_addr) = self.bind_addr {
            config.bind_addr = bind_addr;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(min) = self.min_client_version {
            config.min_client_version = min;
        }
        if let Some(levels) = self.alert_levels {
            let mut seen = BTreeSet::new();
            for level in &levels {
                if !seen.insert(level.level) {
                    return Err(ConfigError::DuplicateLevel(level.level));
                }
            }
            config.alert_levels = levels;
        }
        let mut seen = BTreeSet::new();
        for entry in self.options {
            if !seen.insert(entry.option_type.clone()) {
                return Err(ConfigError::DuplicateOption(entry.option_type));
            }
            match config
                .options
                .iter_mut()
                .find(|o| o.option_type == entry.option_type)
            {
                Some(existing) => existing.value = entry.value,
                None => config.options.push(entry),
            }
        }
        if let Some(secs) = self.exchange_timeout_secs {
            config.timeouts.exchange = Duration::from_secs(secs);
        }
        if let Some(secs) = self.idle_timeout_secs {
            config.timeouts.idle = Duration::from_secs(secs);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_enable_the_alert_system() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 44556);
        assert!(
            config
                .options
                .iter()
                .any(|o| o.option_type == ALERT_SYSTEM_ACTIVE && o.value == 1.0)
        );
    }

    #[test]
    fn file_overlays_defaults() {
        let file: ConfigFile = serde_json::from_value(serde_json::json!({
            "port": 5000,
            "alertLevels": [
                {"level": 2, "name": "intrusion", "triggerAlways": true,
                 "smtpActivated": false, "toAddr": ""}
            ],
            "options": [{"type": "alertSystemActive", "value": 0.0}],
            "users": [{"username": "sensor1", "password": "pw"}],
            "idleTimeoutSecs": 10
        }))
        .unwrap();
        assert_eq!(file.users.len(), 1);

        let mut config = ServerConfig::default();
        file.apply(&mut config).unwrap();
        assert_eq!(config.port, 5000);
        assert_eq!(config.alert_levels[0].level, 2);
        assert_eq!(config.options.len(), 1);
        assert_eq!(config.options[0].value, 0.0);
        assert_eq!(config.timeouts.idle, Duration::from_secs(10));
    }

    #[test]
    fn duplicate_levels_are_refused() {
        let level = AlertLevel {
            level: 1,
            name: "a".into(),
            trigger_always: false,
            smtp_activated: false,
            to_addr: String::new(),
        };
        let file = ConfigFile {
            alert_levels: Some(vec![level.clone(), level]),
            ..ConfigFile::default()
        };
        assert!(matches!(
            file.apply(&mut ServerConfig::default()),
            Err(ConfigError::DuplicateLevel(1))
        ));
    }

    #[test]
    fn unknown_keys_are_refused() {
        let result = serde_json::from_value::<ConfigFile>(serde_json::json!({"prot": 1}));
        assert!(result.is_err());
    }
}
