//! Agent configuration
//!
//! An optional TOML file, then `KIOSK_AGENT_*` environment overrides with
//! `__` between nested keys (`KIOSK_AGENT_DRIVER__SERIAL_PATH=/dev/ttyACM0`).

use config::{Config, ConfigError, Environment, File};
use obd_driver::{DriverConfig, LinkKind};
use obd_session::SessionConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use storage::StorageConfig;

pub const ENV_PREFIX: &str = "KIOSK_AGENT";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `trace`, `debug`, `info`, `warn` or `error`
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    /// Prometheus scrape endpoint
    pub listen: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen: SocketAddr::from(([127, 0, 0, 1], 9464)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub driver: DriverConfig,
    pub session: SessionConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
    pub metrics: MetricsConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            // The agent ships without a BLE stack
            driver: DriverConfig {
                link: LinkKind::Serial,
                ..Default::default()
            },
            session: SessionConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Resolve defaults, `path` (when given) and the environment
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load_with(path, Environment::with_prefix(ENV_PREFIX))
    }

    fn load_with(path: Option<&str>, env: Environment) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().set_default("driver.link", "serial")?;
        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        builder
            .add_source(env.prefix_separator("_").separator("__").try_parsing(true))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use storage::StorageBackend;

    fn no_env() -> Environment {
        Environment::with_prefix(ENV_PREFIX).source(Some(HashMap::new()))
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::load_with(None, no_env()).unwrap();
        assert_eq!(config.driver.link, LinkKind::Serial);
        assert_eq!(config.session.attempts, 3);
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert!(!config.metrics.enabled);
    }

    #[test]
    fn test_file_then_environment() {
        let path = std::env::temp_dir().join(format!("kiosk-agent-{}.toml", std::process::id()));
        std::fs::write(
            &path,
            "[driver]\nserial_path = \"/dev/ttyACM0\"\ncommand_timeout_ms = 2000\n\n[storage]\nbackend = \"memory\"\n",
        )
        .unwrap();

        let env = Environment::with_prefix(ENV_PREFIX).source(Some(HashMap::from([
            ("KIOSK_AGENT_DRIVER__COMMAND_TIMEOUT_MS".to_string(), "3000".to_string()),
            ("KIOSK_AGENT_LOGGING__JSON".to_string(), "true".to_string()),
        ])));
        let config = AgentConfig::load_with(path.to_str(), env).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.driver.link, LinkKind::Serial);
        assert_eq!(config.driver.serial_path, "/dev/ttyACM0");
        assert_eq!(config.driver.command_timeout_ms, 3000);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert!(config.logging.json);
    }
}
