//! Emulator process loop
//!
//! One blocking worker reads lines from the transport and hands them to the
//! engine, one at a time. The async runtime only waits for Ctrl+C and then
//! stops the worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use elm_core::{Catalog, CatalogError, Engine};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::EmulatorConfig;
use crate::forward;
use crate::line::{LineEvent, LineReader};
use crate::transport::{ByteTransport, TransportError};

/// Build an engine from the built-in catalog, the configured catalogs,
/// presets, scenario and forwarder
pub fn build_engine(config: &EmulatorConfig) -> Result<Engine, CatalogError> {
    let mut catalog = Catalog::builtin()?;
    for path in &config.catalogs {
        catalog.merge(Catalog::load(path)?);
    }
    let mut engine = Engine::new(catalog, config.presets.clone());
    if let Err(e) = engine.set_scenario(&config.scenario) {
        // Kept selected: requests get no output until the scenario exists
        warn!(scenario = %config.scenario, %e, "Scenario not found in catalog");
    }
    if let Some(forward) = &config.forward {
        engine.set_forwarder(forward::create(forward));
    }
    Ok(engine)
}

/// Serve lines from `transport` until `running` is cleared
///
/// A dropped TCP tester resets the session and waits for the next one; end of
/// stream on any other transport ends the loop with an error.
pub fn serve(
    engine: &Mutex<Engine>,
    transport: &mut dyn ByteTransport,
    newline: bool,
    running: &AtomicBool,
) -> Result<(), TransportError> {
    let mut reader = LineReader::new(newline);
    info!(transport = %transport.describe(), "Waiting for requests");

    while running.load(Ordering::SeqCst) {
        let event = {
            let mut engine = engine.lock();
            reader.poll(transport, &mut engine.session_mut().counters)?
        };
        match event {
            LineEvent::Line(line) => {
                debug!(%line, "Received request");
                let chunks = engine.lock().process_line(&line);
                for chunk in chunks {
                    transport.write_bytes(chunk.as_bytes())?;
                }
            }
            LineEvent::Idle => {}
            LineEvent::Eof => {
                engine.lock().reset();
                reader.clear();
                if !transport.reconnect(running)? {
                    if !running.load(Ordering::SeqCst) {
                        break;
                    }
                    return Err(TransportError::Io(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("{} closed", transport.describe()),
                    )));
                }
            }
        }
    }
    Ok(())
}

/// Running emulator
pub struct Emulator {
    engine: Arc<Mutex<Engine>>,
    running: Arc<AtomicBool>,
    newline: bool,
}

impl Emulator {
    pub fn new(engine: Engine, newline: bool) -> Self {
        Self {
            engine: Arc::new(Mutex::new(engine)),
            running: Arc::new(AtomicBool::new(true)),
            newline,
        }
    }

    pub fn engine(&self) -> Arc<Mutex<Engine>> {
        self.engine.clone()
    }

    /// Serve `transport` until Ctrl+C or a fatal transport error
    pub async fn run(&self, mut transport: Box<dyn ByteTransport>) -> Result<()> {
        let engine = self.engine.clone();
        let running = self.running.clone();
        let newline = self.newline;
        let mut worker: JoinHandle<Result<(), TransportError>> =
            tokio::task::spawn_blocking(move || serve(&engine, transport.as_mut(), newline, &running));

        let outcome = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                self.running.store(false, Ordering::SeqCst);
                match tokio::time::timeout(Duration::from_secs(2), &mut worker).await {
                    Ok(joined) => joined.map_err(anyhow::Error::from).and_then(|r| r.map_err(anyhow::Error::from)),
                    Err(_) => {
                        warn!("Worker did not stop in time");
                        Ok(())
                    }
                }
            }
            joined = &mut worker => {
                self.running.store(false, Ordering::SeqCst);
                joined.map_err(anyhow::Error::from).and_then(|r| r.map_err(anyhow::Error::from))
            }
        };

        self.dump_counters();
        if let Err(e) = &outcome {
            error!(%e, "Emulator stopped");
        }
        outcome
    }

    /// Log the session counters as JSON
    pub fn dump_counters(&self) {
        let engine = self.engine.lock();
        match serde_json::to_string_pretty(engine.counters()) {
            Ok(json) => info!(scenario = %engine.scenario(), "Counters:\n{}", json),
            Err(e) => error!(%e, "Cannot serialize counters"),
        }
    }
}
