//! Gateway configuration.
//!
//! Values come from an optional TOML file and from command line flags.
//! Flags win; file values fill whatever the flags left open.
//!
//! ```toml
//! log_level = "debug"
//! things_dir = "/etc/thingbridge/things"
//!
//! [mqtt]
//! brokers = ["tcp://localhost:1883"]
//! client_id = "thingbridge"
//!
//! [storage]
//! driver = "memory"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thingbridge_core::{Error, Result};
use thingbridge_devices::transport::mqtt::DEFAULT_PORT;
use thingbridge_devices::MqttSettings;
use tracing::warn;

/// Accepted values of `log_level`.
pub const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

const DEFAULT_KEEP_ALIVE_SECS: u64 = 60;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub log_level: Option<String>,
    pub things_dir: Option<PathBuf>,
    pub mqtt: MqttConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MqttConfig {
    /// Broker addresses: `tcp://host:port`, `mqtt://host:port` or `host:port`.
    pub brokers: Vec<String>,
    pub client_id: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    pub driver: String,
    /// Driver specific options string.
    pub options: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            driver: "memory".to_string(),
            options: String::new(),
        }
    }
}

impl Config {
    /// Read a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::parse(&content).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Fill every value left open in `self` from `file`.
    pub fn merge(mut self, file: Config) -> Self {
        self.log_level = self.log_level.or(file.log_level);
        self.things_dir = self.things_dir.or(file.things_dir);

        if self.mqtt.brokers.is_empty() {
            self.mqtt.brokers = file.mqtt.brokers;
        }
        self.mqtt.client_id = self.mqtt.client_id.or(file.mqtt.client_id);
        self.mqtt.username = self.mqtt.username.or(file.mqtt.username);
        self.mqtt.password = self.mqtt.password.or(file.mqtt.password);
        self.mqtt.keep_alive_secs = self.mqtt.keep_alive_secs.or(file.mqtt.keep_alive_secs);

        if self.storage == StorageConfig::default() {
            self.storage = file.storage;
        }

        self
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(level) = &self.log_level {
            if !LOG_LEVELS.contains(&level.as_str()) {
                return Err(Error::Config(format!(
                    "invalid log level '{}', expected one of {}",
                    level,
                    LOG_LEVELS.join(", ")
                )));
            }
        }

        for broker in &self.mqtt.brokers {
            parse_broker(broker)?;
        }

        if self.storage.driver.is_empty() {
            return Err(Error::Config("storage driver must not be empty".to_string()));
        }

        Ok(())
    }

    /// Connection settings for the first configured broker.
    pub fn mqtt_settings(&self) -> Result<MqttSettings> {
        let broker = self
            .mqtt
            .brokers
            .first()
            .ok_or_else(|| Error::Config("missing MQTT broker".to_string()))?;

        if self.mqtt.brokers.len() > 1 {
            warn!(
                broker = %broker,
                ignored = self.mqtt.brokers.len() - 1,
                "Only the first MQTT broker is used"
            );
        }

        let (host, port) = parse_broker(broker)?;
        let client_id = self
            .mqtt
            .client_id
            .clone()
            .unwrap_or_else(default_client_id);

        let mut settings = MqttSettings::new(host, port, client_id);
        settings.username = self.mqtt.username.clone();
        settings.password = self.mqtt.password.clone();
        settings.keep_alive = Duration::from_secs(
            self.mqtt
                .keep_alive_secs
                .unwrap_or(DEFAULT_KEEP_ALIVE_SECS),
        );
        Ok(settings)
    }
}

fn default_client_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("thingbridge-{}", &id[..8])
}

/// Split a broker address into host and port.
pub fn parse_broker(broker: &str) -> Result<(String, u16)> {
    let address = match broker.split_once("://") {
        Some(("tcp" | "mqtt", rest)) => rest,
        Some((scheme, _)) => {
            return Err(Error::Config(format!(
                "unsupported broker scheme '{}' in '{}'",
                scheme, broker
            )))
        }
        None => broker,
    };
    let address = address.trim_end_matches('/');

    let (host, port) = match address.rsplit_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| Error::Config(format!("invalid port in broker '{}'", broker)))?;
            (host, port)
        }
        None => (address, DEFAULT_PORT),
    };

    if host.is_empty() {
        return Err(Error::Config(format!("missing host in broker '{}'", broker)));
    }

    Ok((host.to_string(), port))
}
