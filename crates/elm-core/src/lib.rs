//! ELM327 adapter emulation engine
//!
//! Interprets the command stream a tester sends to an ELM327 OBD-II
//! adapter and synthesizes the replies a real adapter and vehicle would
//! produce:
//!
//! - AT configuration commands (echo, headers, spaces, linefeeds, CAF, ...)
//! - OBD-II PID queries answered from a scenario catalog
//! - UDS requests, including multi-frame ISO-TP exchanges with flow control
//! - 11-bit and 29-bit addressed reply framing
//!
//! The engine is transport-agnostic: feed it lines with
//! [`Engine::process_line`] and write back the returned chunks.
//!
//! ```
//! use elm_core::Engine;
//!
//! let mut engine = Engine::builtin().unwrap();
//! let reply = engine.process_line("ATI");
//! assert_eq!(reply, vec!["ELM327 v1.5\r\r>".to_string()]);
//! ```

pub mod catalog;
pub mod counters;
pub mod engine;
pub mod error;
pub mod expr;
pub mod forward;
pub mod normalizer;
pub mod render;
pub mod session;
pub mod task;
pub mod template;
pub mod uds;

pub use catalog::{Catalog, ScenarioEntry};
pub use counters::{CounterValue, Counters};
pub use engine::{Engine, Resolution, DEFAULT_SCENARIO};
pub use error::{CatalogError, ElmError, ElmResult};
pub use forward::{ForwardError, Forwarder};
pub use session::Session;
pub use task::{Task, TaskContext, TaskFactory, TaskInfo, TaskRegistry, TaskReply, TaskState};
