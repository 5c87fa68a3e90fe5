//! Line assembly from the byte transport

use std::time::{Duration, Instant};

use elm_core::counters::keys;
use elm_core::Counters;
use tracing::{debug, error};

use crate::transport::{ByteTransport, ReadEvent, TransportError};

/// Gap allowed between two bytes of the same line when `req_timeout` is unset
pub const MAX_REQ_TIMEOUT: f64 = 1440.0;

/// What a poll of the reader produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LineEvent {
    /// A complete line, terminator removed
    Line(String),
    /// The tester went away
    Eof,
    /// Nothing complete yet
    Idle,
}

/// Accumulates bytes into lines
///
/// CR ends a line and LF is ignored; in newline mode the roles are
/// swapped. Bytes are echoed back unless `cmd_echo` is false.
#[derive(Debug)]
pub struct LineReader {
    buffer: Vec<u8>,
    terminator: u8,
    ignored: u8,
    last_byte: Option<Instant>,
}

impl LineReader {
    pub fn new(newline: bool) -> Self {
        let (terminator, ignored) = if newline { (b'\n', b'\r') } else { (b'\r', b'\n') };
        Self {
            buffer: Vec::new(),
            terminator,
            ignored,
            last_byte: None,
        }
    }

    /// Read at most one byte and report a completed line, if any
    pub fn poll(&mut self, transport: &mut dyn ByteTransport, counters: &mut Counters) -> Result<LineEvent, TransportError> {
        let byte = match transport.read_byte()? {
            ReadEvent::Byte(byte) => byte,
            ReadEvent::Eof => {
                self.clear();
                return Ok(LineEvent::Eof);
            }
            ReadEvent::Timeout => return Ok(LineEvent::Idle),
        };

        if counters.flag(keys::ECHO, true) {
            transport.write_bytes(&[byte])?;
        }

        let now = Instant::now();
        if let Some(last) = self.last_byte {
            if !self.buffer.is_empty() && now.duration_since(last) > req_timeout(counters) {
                debug!(discarded = %String::from_utf8_lossy(&self.buffer), "'req_timeout' expired while reading data");
                self.buffer.clear();
            }
        }
        self.last_byte = Some(now);

        if byte == self.terminator {
            let line = String::from_utf8_lossy(&self.buffer).into_owned();
            self.buffer.clear();
            return Ok(LineEvent::Line(line));
        }
        if byte != self.ignored {
            self.buffer.push(byte);
        }
        Ok(LineEvent::Idle)
    }

    /// Forget any partial line (dropped connection)
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.last_byte = None;
    }
}

/// Current inter-byte timeout, repairing an unusable `req_timeout`
fn req_timeout(counters: &mut Counters) -> Duration {
    let configured = counters.get(keys::REQ_TIMEOUT).map(|v| (v.to_string(), v.as_float()));
    let secs = match configured {
        Some((_, Some(secs))) if secs.is_finite() && secs >= 0.0 => secs,
        Some((value, _)) => {
            error!(%value, "Improper configuration of \"{}\"; resetting it to {}", keys::REQ_TIMEOUT, MAX_REQ_TIMEOUT);
            counters.set(keys::REQ_TIMEOUT, MAX_REQ_TIMEOUT);
            MAX_REQ_TIMEOUT
        }
        None => MAX_REQ_TIMEOUT,
    };
    Duration::from_secs_f64(secs)
}
