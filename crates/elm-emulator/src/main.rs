//! ELM327 Emulator
//!
//! Emulates an ELM327 OBD-II adapter and the vehicle behind it, answering
//! AT commands, OBD-II PIDs and UDS requests from a scenario catalog.
//!
//! # Usage
//!
//! Pseudo-terminal (prints the device to open):
//! ```bash
//! ./elm-emulator
//! ```
//!
//! TCP, like a WiFi adapter, with the `car` scenario:
//! ```bash
//! ./elm-emulator --port 35000 --scenario car
//! ```
//!
//! With config file:
//! ```bash
//! ./elm-emulator --config config/elm-emulator.toml
//! ```

use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use elm_emulator::config::{
    default_baud_rate, default_bind, DeviceConfig, EmulatorConfig, ForwardConfig, SerialConfig, TcpConfig,
    TransportConfig,
};
use elm_emulator::{build_engine, transport, Emulator};

#[derive(Parser, Debug)]
#[command(name = "elm-emulator")]
#[command(about = "ELM327 OBD-II adapter emulator")]
struct Args {
    /// Configuration file path (TOML format)
    /// If provided, overrides command-line options
    #[arg(short, long)]
    config: Option<String>,

    /// Scenario laid over the AT and default layers
    #[arg(short, long, default_value = elm_core::DEFAULT_SCENARIO)]
    scenario: String,

    /// Extra YAML catalog merged over the built-in one (repeatable)
    #[arg(long = "catalog")]
    catalogs: Vec<PathBuf>,

    /// Listen on this TCP port instead of a pseudo-terminal
    #[arg(short, long, conflicts_with_all = ["serial", "device"])]
    port: Option<u16>,

    /// TCP bind address
    #[arg(long, default_value_t = default_bind())]
    bind: String,

    /// Serve on a serial port
    #[arg(long, conflicts_with = "device")]
    serial: Option<String>,

    /// Serial baud rate
    #[arg(long, default_value_t = default_baud_rate())]
    baud_rate: u32,

    /// Serve on an existing character device
    #[arg(long)]
    device: Option<PathBuf>,

    /// Lines end with LF instead of CR
    #[arg(long)]
    newline: bool,

    /// Forward unknown commands to a real adapter at HOST:PORT
    #[arg(long, value_name = "HOST:PORT", conflicts_with = "forward_serial")]
    forward: Option<String>,

    /// Forward unknown commands to a real adapter on a serial port
    #[arg(long)]
    forward_serial: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn to_config(&self) -> Result<EmulatorConfig> {
        let transport = if let Some(port) = self.port {
            TransportConfig::Tcp(TcpConfig {
                bind: self.bind.clone(),
                port,
            })
        } else if let Some(port) = &self.serial {
            TransportConfig::Serial(SerialConfig {
                port: port.clone(),
                baud_rate: self.baud_rate,
            })
        } else if let Some(path) = &self.device {
            TransportConfig::Device(DeviceConfig { path: path.clone() })
        } else {
            TransportConfig::Pty
        };

        let forward = match (&self.forward, &self.forward_serial) {
            (Some(addr), _) => {
                let (host, port) = addr
                    .rsplit_once(':')
                    .ok_or_else(|| anyhow::anyhow!("Invalid forward address: {}", addr))?;
                let port = port
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid forward port {}: {}", port, e))?;
                Some(ForwardConfig::Tcp {
                    host: host.to_string(),
                    port,
                    timeout_secs: 0.2,
                })
            }
            (None, Some(port)) => Some(ForwardConfig::Serial {
                port: port.clone(),
                baud_rate: self.baud_rate,
                timeout_secs: 0.2,
            }),
            (None, None) => None,
        };

        Ok(EmulatorConfig {
            scenario: self.scenario.clone(),
            catalogs: self.catalogs.clone(),
            newline: self.newline,
            transport,
            forward,
            ..EmulatorConfig::default()
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing; RUST_LOG takes precedence
    let filter = if args.verbose {
        "elm_emulator=debug,elm_core=debug"
    } else {
        "elm_emulator=info,elm_core=info"
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    // Load configuration
    let config = if let Some(config_path) = &args.config {
        info!("Loading config from: {}", config_path);
        EmulatorConfig::load(config_path).map_err(|e| anyhow::anyhow!("Failed to load config: {}", e))?
    } else {
        args.to_config()?
    };

    info!("Starting ELM327 emulator");
    info!(
        scenario = %config.scenario,
        catalogs = config.catalogs.len(),
        transport = ?config.transport
    );

    let engine = build_engine(&config).map_err(|e| anyhow::anyhow!("Failed to load catalog: {}", e))?;
    let transport = transport::open(&config.transport).map_err(|e| anyhow::anyhow!("Failed to open transport: {}", e))?;

    info!("Press Ctrl+C to stop");
    let emulator = Emulator::new(engine, config.newline);
    emulator.run(transport).await?;

    info!("ELM327 emulator stopped");
    Ok(())
}
