//! Tester-facing byte transports
//!
//! Every transport reads one byte at a time with a short poll timeout, so the
//! worker loop can notice shutdown and stale partial lines. TCP survives a
//! dropped tester by waiting for the next connection; the others treat end of
//! stream as fatal.

use std::fs::OpenOptions;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serialport::SerialPort;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;

/// Interval at which a blocked read returns [`ReadEvent::Timeout`]
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Cannot open {target}: {source}")]
    Open {
        target: String,
        #[source]
        source: io::Error,
    },

    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Transport not supported: {0}")]
    Unsupported(String),
}

/// Result of one byte read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEvent {
    Byte(u8),
    /// Peer closed the stream
    Eof,
    /// Nothing arrived within [`POLL_INTERVAL`]
    Timeout,
}

/// Byte stream between the tester and the emulator
pub trait ByteTransport: Send {
    fn read_byte(&mut self) -> Result<ReadEvent, TransportError>;

    fn write_bytes(&mut self, data: &[u8]) -> Result<(), TransportError>;

    /// Human readable endpoint, e.g. the pty slave name
    fn describe(&self) -> String;

    /// Wait for a new tester after [`ReadEvent::Eof`]
    ///
    /// Returns `Ok(false)` when the transport cannot reconnect or `running`
    /// was cleared while waiting.
    fn reconnect(&mut self, _running: &AtomicBool) -> Result<bool, TransportError> {
        Ok(false)
    }
}

/// Open the transport selected by the configuration
pub fn open(config: &TransportConfig) -> Result<Box<dyn ByteTransport>, TransportError> {
    match config {
        TransportConfig::Pty => Ok(Box::new(PtyTransport::open()?)),
        TransportConfig::Device(cfg) => {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&cfg.path)
                .map_err(|source| TransportError::Open {
                    target: cfg.path.display().to_string(),
                    source,
                })?;
            Ok(Box::new(StreamTransport::new(file, cfg.path.display().to_string())))
        }
        TransportConfig::Serial(cfg) => {
            let port = serialport::new(&cfg.port, cfg.baud_rate)
                .timeout(POLL_INTERVAL)
                .open()?;
            info!(port = %cfg.port, baud_rate = cfg.baud_rate, "Serial port opened");
            Ok(Box::new(StreamTransport::new(port, cfg.port.clone())))
        }
        TransportConfig::Tcp(cfg) => {
            let addr = format!("{}:{}", cfg.bind, cfg.port);
            let listener = TcpListener::bind(&addr).map_err(|source| TransportError::Open { target: addr, source })?;
            Ok(Box::new(TcpTransport::new(listener)?))
        }
    }
}

fn read_one<R: Read + ?Sized>(reader: &mut R) -> Result<ReadEvent, TransportError> {
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(ReadEvent::Eof),
            Ok(_) => return Ok(ReadEvent::Byte(byte[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => {
                return Ok(ReadEvent::Timeout)
            }
            Err(e) => return Err(e.into()),
        }
    }
}

// =============================================================================
// Stream transports (device, serial)
// =============================================================================

/// Any readable and writable byte stream
pub struct StreamTransport<S> {
    stream: S,
    name: String,
}

impl<S: Read + Write + Send> StreamTransport<S> {
    pub fn new(stream: S, name: impl Into<String>) -> Self {
        Self {
            stream,
            name: name.into(),
        }
    }
}

impl<S: Read + Write + Send> ByteTransport for StreamTransport<S> {
    fn read_byte(&mut self) -> Result<ReadEvent, TransportError> {
        read_one(&mut self.stream)
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(data)?;
        self.stream.flush()?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.name.clone()
    }
}

// =============================================================================
// Pseudo-terminal
// =============================================================================

/// Master side of a freshly allocated pseudo-terminal
///
/// The slave stays open for the lifetime of the transport so the master
/// never sees a hangup while no tester is attached.
#[cfg(unix)]
pub struct PtyTransport {
    master: serialport::TTYPort,
    _slave: serialport::TTYPort,
    slave_name: String,
}

#[cfg(unix)]
impl PtyTransport {
    pub fn open() -> Result<Self, TransportError> {
        let (mut master, mut slave) = serialport::TTYPort::pair()?;
        slave.set_exclusive(false)?;
        master.set_timeout(POLL_INTERVAL)?;
        let slave_name = slave.name().unwrap_or_default();
        info!(pty = %slave_name, "Pseudo-terminal allocated");
        println!("ELM327 emulator running on {}", slave_name);
        Ok(Self {
            master,
            _slave: slave,
            slave_name,
        })
    }
}

#[cfg(unix)]
impl ByteTransport for PtyTransport {
    fn read_byte(&mut self) -> Result<ReadEvent, TransportError> {
        read_one(&mut self.master)
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.master.write_all(data)?;
        Ok(())
    }

    fn describe(&self) -> String {
        self.slave_name.clone()
    }
}

#[cfg(not(unix))]
pub struct PtyTransport;

#[cfg(not(unix))]
impl PtyTransport {
    pub fn open() -> Result<Self, TransportError> {
        Err(TransportError::Unsupported(
            "pseudo-terminals require a Unix system".to_string(),
        ))
    }
}

#[cfg(not(unix))]
impl ByteTransport for PtyTransport {
    fn read_byte(&mut self) -> Result<ReadEvent, TransportError> {
        Ok(ReadEvent::Eof)
    }

    fn write_bytes(&mut self, _data: &[u8]) -> Result<(), TransportError> {
        Ok(())
    }

    fn describe(&self) -> String {
        "pty".to_string()
    }
}

// =============================================================================
// TCP
// =============================================================================

/// TCP listener serving one tester at a time
pub struct TcpTransport {
    listener: TcpListener,
    conn: Option<(TcpStream, SocketAddr)>,
}

impl TcpTransport {
    pub fn new(listener: TcpListener) -> Result<Self, TransportError> {
        listener.set_nonblocking(true)?;
        info!(addr = %listener.local_addr()?, "Listening for testers");
        Ok(Self { listener, conn: None })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Poll the listener once; `Ok(true)` when a tester was accepted
    fn try_accept(&mut self) -> Result<bool, TransportError> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                stream.set_nonblocking(false)?;
                stream.set_read_timeout(Some(POLL_INTERVAL))?;
                stream.set_nodelay(true)?;
                info!(%peer, "Tester connected");
                self.conn = Some((stream, peer));
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn drop_connection(&mut self, reason: &str) {
        if let Some((_, peer)) = self.conn.take() {
            warn!(%peer, reason, "Tester disconnected");
        }
    }
}

impl ByteTransport for TcpTransport {
    fn read_byte(&mut self) -> Result<ReadEvent, TransportError> {
        let Some((stream, _)) = self.conn.as_mut() else {
            if self.try_accept()? {
                return self.read_byte();
            }
            std::thread::sleep(POLL_INTERVAL);
            return Ok(ReadEvent::Timeout);
        };
        match read_one(stream) {
            Ok(ReadEvent::Eof) => {
                self.drop_connection("closed");
                Ok(ReadEvent::Eof)
            }
            Err(TransportError::Io(e)) => {
                debug!(%e, "Read failed");
                self.drop_connection("reset");
                Ok(ReadEvent::Eof)
            }
            other => other,
        }
    }

    fn write_bytes(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let Some((stream, _)) = self.conn.as_mut() else {
            debug!(len = data.len(), "No tester connected; dropping output");
            return Ok(());
        };
        if let Err(e) = stream.write_all(data) {
            debug!(%e, "Write failed");
            self.drop_connection("broken pipe");
        }
        Ok(())
    }

    fn describe(&self) -> String {
        self.listener
            .local_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "tcp".to_string())
    }

    fn reconnect(&mut self, running: &AtomicBool) -> Result<bool, TransportError> {
        self.conn = None;
        while running.load(Ordering::SeqCst) {
            if self.try_accept()? {
                return Ok(true);
            }
            std::thread::sleep(POLL_INTERVAL);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// In-memory stream: reads from `input`, collects writes
    struct Loopback {
        input: Cursor<Vec<u8>>,
        output: Vec<u8>,
    }

    impl Read for Loopback {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.input.read(buf)
        }
    }

    impl Write for Loopback {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.output.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_stream_reads_bytes_then_eof() {
        let stream = Loopback {
            input: Cursor::new(b"AT".to_vec()),
            output: Vec::new(),
        };
        let mut transport = StreamTransport::new(stream, "loopback");
        assert_eq!(transport.read_byte().unwrap(), ReadEvent::Byte(b'A'));
        assert_eq!(transport.read_byte().unwrap(), ReadEvent::Byte(b'T'));
        assert_eq!(transport.read_byte().unwrap(), ReadEvent::Eof);
        transport.write_bytes(b"OK\r\r>").unwrap();
        assert_eq!(transport.stream.output, b"OK\r\r>");
        assert!(!transport.reconnect(&AtomicBool::new(true)).unwrap());
    }

    #[test]
    fn test_tcp_idle_without_tester() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut transport = TcpTransport::new(listener).unwrap();
        assert_eq!(transport.read_byte().unwrap(), ReadEvent::Timeout);
        // output without a tester is dropped silently
        transport.write_bytes(b"OK").unwrap();
    }

    #[test]
    fn test_tcp_reconnect_stops_with_running_flag() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut transport = TcpTransport::new(listener).unwrap();
        assert!(!transport.reconnect(&AtomicBool::new(false)).unwrap());
    }
}
