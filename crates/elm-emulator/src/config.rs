//! Emulator configuration
//!
//! Optional TOML file selecting the transport, the scenario, extra catalogs,
//! counter presets and the forwarder. Every field has a default, so an empty
//! file is a valid configuration.

use std::path::PathBuf;
use std::time::Duration;

use elm_core::{Counters, DEFAULT_SCENARIO};
use serde::{Deserialize, Serialize};

/// Complete emulator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmulatorConfig {
    /// Scenario laid over the AT and default layers
    #[serde(default = "default_scenario")]
    pub scenario: String,

    /// YAML catalogs merged over the built-in one, in order
    #[serde(default)]
    pub catalogs: Vec<PathBuf>,

    /// Terminate lines with LF instead of CR
    #[serde(default)]
    pub newline: bool,

    /// Counter values restored on every adapter reset
    #[serde(default)]
    pub presets: Counters,

    /// Where the tester connects
    #[serde(default)]
    pub transport: TransportConfig,

    /// Real adapter receiving unknown commands
    #[serde(default)]
    pub forward: Option<ForwardConfig>,
}

fn default_scenario() -> String {
    DEFAULT_SCENARIO.to_string()
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self {
            scenario: default_scenario(),
            catalogs: Vec::new(),
            newline: false,
            presets: Counters::new(),
            transport: TransportConfig::default(),
            forward: None,
        }
    }
}

impl EmulatorConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Tester-facing transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Pseudo-terminal; the slave name is printed at startup
    Pty,
    /// Existing character device
    Device(DeviceConfig),
    /// Serial port
    Serial(SerialConfig),
    /// TCP listener, one tester at a time
    Tcp(TcpConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Pty
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Port name, e.g. `/dev/ttyUSB0` or `COM3`
    pub port: String,

    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

pub fn default_baud_rate() -> u32 {
    38400
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    pub port: u16,
}

pub fn default_bind() -> String {
    "0.0.0.0".to_string()
}

// =============================================================================
// Forwarder Configuration
// =============================================================================

/// Real adapter to which unknown commands are forwarded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ForwardConfig {
    Tcp {
        host: String,
        port: u16,
        #[serde(default = "default_forward_timeout")]
        timeout_secs: f64,
    },
    Serial {
        port: String,
        #[serde(default = "default_baud_rate")]
        baud_rate: u32,
        #[serde(default = "default_forward_timeout")]
        timeout_secs: f64,
    },
}

fn default_forward_timeout() -> f64 {
    0.2
}

impl ForwardConfig {
    pub fn timeout(&self) -> Duration {
        let secs = match self {
            ForwardConfig::Tcp { timeout_secs, .. } | ForwardConfig::Serial { timeout_secs, .. } => *timeout_secs,
        };
        Duration::try_from_secs_f64(secs).unwrap_or_else(|_| Duration::from_secs_f64(default_forward_timeout()))
    }
}
