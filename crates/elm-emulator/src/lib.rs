//! elm-emulator - ELM327 adapter emulator process
//!
//! Wires the [`elm_core`] engine to a tester-facing transport.
//!
//! # Modules
//!
//! - [`config`] - TOML configuration
//! - [`transport`] - pty, device, serial and TCP byte transports
//! - [`line`] - line assembly and echo
//! - [`forward`] - forwarding of unknown commands to a real adapter
//! - [`server`] - worker loop and shutdown

pub mod config;
pub mod forward;
pub mod line;
pub mod server;
pub mod transport;

pub use config::EmulatorConfig;
pub use server::{build_engine, serve, Emulator};
