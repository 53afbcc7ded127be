/*!
 * Configuration types for the VRPC client
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::{Result, VrpcError};

/// Username sent to the broker when authenticating with a token
pub const TOKEN_USERNAME: &str = "__token__";

/// Main configuration for a `VrpcRemote` client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Discovery namespace
    #[serde(default = "default_domain")]
    pub domain: String,

    /// Default target agent for calls (may be overridden per call)
    #[serde(default)]
    pub agent: String,

    /// Broker URL, e.g. "mqtt://broker:1883"
    #[serde(default = "default_broker")]
    pub broker: String,

    /// Broker username
    #[serde(default)]
    pub username: Option<String>,

    /// Broker password
    #[serde(default)]
    pub password: Option<String>,

    /// Access token (sent as password with the `__token__` username)
    #[serde(default)]
    pub token: Option<String>,

    /// Transport client id (generated when absent)
    #[serde(default)]
    pub client_id: Option<String>,

    /// Per-call deadline in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Bind every successful result under the invoked function name
    #[serde(default = "default_true")]
    pub auto_bind: bool,

    /// Remove agents on offline announcement instead of marking them offline
    #[serde(default)]
    pub purge_offline_agents: bool,

    /// Capacity of the discovery event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            agent: String::new(),
            broker: default_broker(),
            username: None,
            password: None,
            token: None,
            client_id: None,
            timeout_ms: default_timeout_ms(),
            auto_bind: true,
            purge_offline_agents: false,
            event_capacity: default_event_capacity(),
            log: LogConfig::default(),
        }
    }
}

impl RemoteConfig {
    /// Create a configuration for the given domain, agent and broker URL
    pub fn new(domain: impl Into<String>, agent: impl Into<String>, broker: impl Into<String>) -> Self {
        Self {
            domain: domain.into(),
            agent: agent.into(),
            broker: broker.into(),
            ..Default::default()
        }
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input).map_err(|e| VrpcError::Config(format!("Invalid TOML: {}", e)))
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            VrpcError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Per-call deadline
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Parsed broker address
    pub fn broker_address(&self) -> Result<BrokerAddress> {
        BrokerAddress::parse(&self.broker)
    }

    /// Effective broker credentials; a token takes precedence
    pub fn credentials(&self) -> Option<(String, String)> {
        if let Some(token) = &self.token {
            return Some((TOKEN_USERNAME.to_string(), token.clone()));
        }
        match (&self.username, &self.password) {
            (Some(user), Some(pass)) => Some((user.clone(), pass.clone())),
            _ => None,
        }
    }

    /// Check invariants that do not need the network
    pub fn validate(&self) -> Result<()> {
        if self.domain.is_empty() || self.domain.contains(['/', '+', '#']) {
            return Err(VrpcError::Config(format!(
                "Invalid domain '{}': must be non-empty and free of '/', '+', '#'",
                self.domain
            )));
        }
        if self.timeout_ms == 0 {
            return Err(VrpcError::Config("timeout_ms must be positive".to_string()));
        }
        if self.event_capacity == 0 {
            return Err(VrpcError::Config("event_capacity must be positive".to_string()));
        }
        Ok(())
    }
}

/// Broker endpoint extracted from the broker URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddress {
    /// Parse a broker URL.
    ///
    /// Schemes `mqtt`/`tcp` default to port 1883, `mqtts`/`ssl` to 8883.
    pub fn parse(broker: &str) -> Result<Self> {
        if !broker.contains("://") {
            return Err(VrpcError::Config(format!(
                "Missing scheme in broker url '{}' (use e.g. mqtts://<hostname>)",
                broker
            )));
        }

        let url = Url::parse(broker)
            .map_err(|e| VrpcError::Config(format!("Invalid broker url '{}': {}", broker, e)))?;

        let tls = match url.scheme() {
            "mqtt" | "tcp" => false,
            "mqtts" | "ssl" => true,
            other => {
                return Err(VrpcError::Config(format!(
                    "Unsupported broker scheme '{}'",
                    other
                )))
            }
        };

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| VrpcError::Config(format!("Missing host in broker url '{}'", broker)))?
            .to_string();

        let port = url.port().unwrap_or(if tls { 8883 } else { 1883 });

        Ok(Self { host, port, tls })
    }
}

/// Logging configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level for diagnostic output
    #[serde(default)]
    pub level: LogLevel,

    /// Log file path (None = compact output on stderr)
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for level = debug)
    #[serde(default)]
    pub verbose: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_domain() -> String {
    "public.vrpc".to_string()
}

fn default_broker() -> String {
    "mqtts://vrpc.io:8883".to_string()
}

fn default_timeout_ms() -> u64 {
    12_000
}

fn default_event_capacity() -> usize {
    256
}
