//! Client configuration loaded from a TOML file.
//!
//! ```toml
//! version = "0.1.0"
//!
//! [broker]
//! address = "127.0.0.1"
//! port = "51015"
//!
//! [client]
//! request_timeout_ms = 10000
//! task_topic_policy = "pinned"
//!
//! [subscription]
//! credits = 32
//! lock_duration_ms = 300000
//! ```

use crate::envelope::TaskTopicPolicy;
use crate::error::{ClientError, ClientResult};
use crate::subscription::SubscriptionSpec;
use serde::Deserialize;
use std::fmt;
use std::path::Path;
use std::time::Duration;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/zeebe/config.toml";

pub const DEFAULT_BROKER_ADDRESS: &str = "127.0.0.1";
pub const DEFAULT_BROKER_PORT: &str = "51015";
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// Broker endpoint as written in the configuration file.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerContact {
    pub address: String,
    pub port: String,
}

impl Default for BrokerContact {
    fn default() -> Self {
        Self {
            address: DEFAULT_BROKER_ADDRESS.to_string(),
            port: DEFAULT_BROKER_PORT.to_string(),
        }
    }
}

impl fmt::Display for BrokerContact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Request/response behaviour of a connection.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub request_timeout_ms: u64,
    pub task_topic_policy: TaskTopicPolicy,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            task_topic_policy: TaskTopicPolicy::default(),
        }
    }
}

impl ClientSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Complete client configuration, passed explicitly to every component.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub version: String,
    pub broker: BrokerContact,
    pub client: ClientSettings,
    pub subscription: SubscriptionSpec,
}

impl ClientConfig {
    /// Parse a configuration document.
    pub fn from_toml_str(contents: &str) -> ClientResult<Self> {
        toml::from_str(contents).map_err(|e| ClientError::InvalidFormat(e.to_string()))
    }

    /// Load the configuration file at `path`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> ClientResult<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|_| ClientError::ResourceNotFound(path.to_path_buf()))?;
        Self::from_toml_str(&contents)
    }

    /// `host:port` of the broker.
    pub fn broker_address(&self) -> String {
        self.broker.to_string()
    }

    /// Replace the broker endpoint with a `host:port` string.
    pub fn with_broker_address(mut self, address: &str) -> ClientResult<Self> {
        let (host, port) = address.rsplit_once(':').ok_or_else(|| {
            ClientError::invalid_argument(format!("broker address '{}' is not host:port", address))
        })?;
        if host.is_empty() || port.is_empty() {
            return Err(ClientError::invalid_argument(format!(
                "broker address '{}' is not host:port",
                address
            )));
        }
        self.broker = BrokerContact {
            address: host.to_string(),
            port: port.to_string(),
        };
        Ok(self)
    }
}

impl fmt::Display for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "version: {}\tBroker: {}", self.version, self.broker)
    }
}
