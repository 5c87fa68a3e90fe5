//! Command interpretation engine
//!
//! One [`Engine`] emulates one adapter: it owns the catalog, the session,
//! the task registry and the optional forwarder, and turns each line from
//! the tester into the chunks to write back.

mod resolve;
mod tasks;

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::catalog::{Catalog, ScenarioEntry, DEFAULT_LAYER};
use crate::counters::Counters;
use crate::error::{CatalogError, ElmResult};
use crate::forward::Forwarder;
use crate::normalizer::{self, Request};
use crate::render::{Outbox, Renderer};
use crate::session::Session;
use crate::task::multiframe::{Reassembler, MULTILINE_TASK};
use crate::task::{TaskFactory, TaskInfo, TaskMethod, TaskRegistry, TaskSlot};
use crate::uds::is_hex_payload;

/// Scenario selected at startup
pub const DEFAULT_SCENARIO: &str = DEFAULT_LAYER;

/// Outcome of one request, before rendering
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Request header at the time of the request
    pub header: Option<String>,
    /// Command as finally resolved (after any task passthrough)
    pub cmd: String,
    /// Template to render; `None` for no output
    pub template: Option<String>,
}

/// ELM327 emulation engine
pub struct Engine {
    catalog: Catalog,
    scenario: String,
    /// Merged entries for the current scenario
    sorted: Arc<[ScenarioEntry]>,
    session: Session,
    registry: TaskRegistry,
    forwarder: Option<Box<dyn Forwarder>>,
    out: Outbox,
}

impl Engine {
    pub fn new(catalog: Catalog, presets: Counters) -> Self {
        let mut engine = Self {
            catalog,
            scenario: String::new(),
            sorted: Arc::from(Vec::new()),
            session: Session::new(presets),
            registry: TaskRegistry::with_builtins(),
            forwarder: None,
            out: Outbox::new(),
        };
        if let Err(e) = engine.set_scenario(DEFAULT_SCENARIO) {
            warn!(%e, "Catalog has no default scenario");
        }
        engine
    }

    /// Engine over the built-in catalog
    pub fn builtin() -> Result<Self, CatalogError> {
        Ok(Self::new(Catalog::builtin()?, Counters::new()))
    }

    // =========================================================================
    // Configuration
    // =========================================================================

    /// Select the scenario laid over the `AT` and `default` layers
    ///
    /// An unknown scenario stays selected, and every request is answered
    /// with no output until a valid one is chosen.
    pub fn set_scenario(&mut self, scenario: &str) -> Result<(), CatalogError> {
        self.scenario = scenario.to_string();
        match self.catalog.sorted(scenario) {
            Ok(sorted) => {
                info!(scenario, entries = sorted.len(), "Scenario selected");
                self.sorted = Arc::from(sorted);
                Ok(())
            }
            Err(e) => {
                error!(scenario, "Unknown scenario");
                self.sorted = Arc::from(Vec::new());
                Err(e)
            }
        }
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Lay another catalog over the current one and re-sort
    pub fn merge_catalog(&mut self, catalog: Catalog) -> Result<(), CatalogError> {
        self.catalog.merge(catalog);
        let scenario = self.scenario.clone();
        self.set_scenario(&scenario)
    }

    pub fn register_task(&mut self, name: impl Into<String>, factory: TaskFactory) -> ElmResult<()> {
        self.registry.register(name, factory)
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn set_forwarder(&mut self, forwarder: Box<dyn Forwarder>) {
        info!(peer = %forwarder.describe(), "Forwarding unknown commands");
        self.forwarder = Some(forwarder);
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    pub fn counters(&self) -> &Counters {
        &self.session.counters
    }

    /// Adapter reset (startup, ATZ, dropped connection)
    pub fn reset(&mut self) {
        self.session.reset();
    }

    // =========================================================================
    // Request processing
    // =========================================================================

    /// Process one line and return the chunks to write, in order
    pub fn process_line(&mut self, line: &str) -> Vec<String> {
        let resolution = self.handle_request(line);
        if let Some(template) = &resolution.template {
            Renderer::new(&mut self.session.counters, &mut self.out).render(
                template,
                resolution.header.as_deref(),
                Some(&resolution.cmd),
            );
        }
        self.out.take()
    }

    /// Interpret one line and return the template answering it
    ///
    /// Flow Control frames and intermediate task output are written to the
    /// outbox while the request is handled.
    pub fn handle_request(&mut self, line: &str) -> Resolution {
        let request = match normalizer::normalize(line, &mut self.session.counters) {
            Ok(request) => request,
            Err(e) => {
                error!(line, %e, "Rejected request");
                return Resolution {
                    header: self.session.header(),
                    cmd: line.to_string(),
                    template: None,
                };
            }
        };
        let header = self.session.header();
        let Request {
            mut cmd,
            mut length,
            mut frame,
        } = request;
        debug!(%cmd, ?header, "Handling");

        if !self.catalog.contains(&self.scenario) {
            error!(scenario = %self.scenario, "Unknown scenario");
            return Resolution {
                header,
                cmd,
                template: None,
            };
        }

        let key = header.clone().unwrap_or_default();
        if !self.session.has_task(&key) && frame.is_some() {
            let info = TaskInfo::new(MULTILINE_TASK, key.as_str(), cmd.as_str());
            self.session
                .insert_task(TaskSlot::new(info, Box::new(Reassembler::new())));
        }

        if self.session.has_task(&key) {
            if is_hex_payload(&cmd) {
                let reply = self.task_action(&key, TaskMethod::Run, &cmd, length, frame);
                match reply.passthrough {
                    None => {
                        return Resolution {
                            header,
                            cmd,
                            template: reply.response,
                        }
                    }
                    Some(passthrough) => {
                        cmd = passthrough;
                        length = None;
                        frame = None;
                    }
                }
            } else {
                warn!(
                    task = self.session.task_name(&key).unwrap_or_default(),
                    header = %key,
                    "Interrupted task"
                );
                let reply = self.task_action(&key, TaskMethod::Stop, &cmd, length, frame);
                self.session.take_task(&key);
                match reply.passthrough {
                    Some(passthrough) => cmd = passthrough,
                    None if reply.response.is_some() => {
                        return Resolution {
                            header,
                            cmd,
                            template: reply.response,
                        }
                    }
                    None => {}
                }
            }
        }

        let template = self.resolve(header.as_deref(), &mut cmd, length, frame);
        Resolution {
            header,
            cmd,
            template,
        }
    }
}
