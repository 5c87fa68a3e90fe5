//! Forwarding of unknown commands to a real adapter
//!
//! The engine only knows this trait; TCP and serial implementations live
//! in the emulator binary.

use thiserror::Error;

/// Forwarding failure; never aborts the primary response
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Forwarder I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Forwarder not connected: {0}")]
    NotConnected(String),
}

/// Synchronous request/reply exchange with a timeout of its own
pub trait Forwarder: Send {
    /// Send `request` and return whatever arrives before the timeout
    ///
    /// `Ok(None)` means the peer answered nothing in time.
    fn exchange(&mut self, request: &[u8]) -> Result<Option<Vec<u8>>, ForwardError>;

    /// Human readable peer description
    fn describe(&self) -> String;
}
