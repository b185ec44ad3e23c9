//! Application configuration

use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use serde_with::serde_as;

use crate::{errors::RelayError, models::TRAIL_LIMIT};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    /// Socket address for HTTP and WebSocket traffic
    pub bind: String,
    /// Per-connection buffer of outgoing operator updates
    pub ws_buffer: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8080".to_string(),
            ws_buffer: 64,
        }
    }
}

#[serde_as]
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConfig {
    pub enabled: bool,
    pub uri: String,
    pub port: u16,
    pub client_id: String,
    pub topics: Vec<String>,
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub keep_alive: Duration,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            uri: "localhost".to_string(),
            port: 1883,
            client_id: "operator-relay".to_string(),
            topics: vec!["operators/+/location".to_string()],
            keep_alive: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RelayConfig {
    /// Positions kept per operator trail
    pub trail_limit: usize,
    /// Queue length of the relay task
    pub command_buffer: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            trail_limit: TRAIL_LIMIT,
            command_buffer: 1024,
        }
    }
}

impl AppConfig {
    /// Load `config/default` (if present) and `OPRELAY__*` environment variables
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(Path::new("config/default"))
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::from(path).required(false))
            .add_source(
                Environment::with_prefix("OPRELAY")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("mqtt.topics"),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<(), RelayError> {
        self.server.validate()?;
        self.mqtt.validate()?;
        self.relay.validate()?;
        Ok(())
    }
}

fn invalid(message: &str) -> RelayError {
    RelayError::ConfigurationError {
        message: message.to_string(),
    }
}

impl ServerConfig {
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.bind.trim().is_empty() {
            return Err(invalid("Server bind address cannot be empty"));
        }
        if self.ws_buffer == 0 {
            return Err(invalid("WebSocket buffer must be greater than zero"));
        }
        Ok(())
    }
}

impl MqttConfig {
    pub fn validate(&self) -> Result<(), RelayError> {
        if !self.enabled {
            return Ok(());
        }
        if self.uri.trim().is_empty() {
            return Err(invalid("MQTT uri cannot be empty"));
        }
        if self.topics.is_empty() {
            return Err(invalid("At least one MQTT topic is required"));
        }
        if self.keep_alive.is_zero() {
            return Err(invalid("MQTT keep alive must be greater than zero"));
        }
        Ok(())
    }
}

impl RelayConfig {
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.trail_limit == 0 {
            return Err(invalid("Trail limit must be greater than zero"));
        }
        if self.command_buffer == 0 {
            return Err(invalid("Relay command buffer must be greater than zero"));
        }
        Ok(())
    }
}
