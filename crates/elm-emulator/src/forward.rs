//! Forwarders to a real adapter
//!
//! Unknown commands are copied to a physical ELM327 reachable over TCP or a
//! serial port. The reply is whatever arrives before the read timeout.

use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use elm_core::{ForwardError, Forwarder};
use serialport::SerialPort;
use tracing::{debug, info, warn};

use crate::config::ForwardConfig;

/// Largest reply kept from one exchange
const MAX_REPLY: usize = 1024;

/// Build the forwarder described by the configuration
///
/// Connection is lazy: a peer that is down at startup is retried on the
/// next unknown command.
pub fn create(config: &ForwardConfig) -> Box<dyn Forwarder> {
    match config {
        ForwardConfig::Tcp { host, port, .. } => Box::new(TcpForwarder::new(host, *port, config.timeout())),
        ForwardConfig::Serial { port, baud_rate, .. } => {
            Box::new(SerialForwarder::new(port, *baud_rate, config.timeout()))
        }
    }
}

fn exchange_on<S: Read + Write + ?Sized>(stream: &mut S, request: &[u8]) -> Result<Option<Vec<u8>>, ForwardError> {
    if !request.is_empty() {
        stream.write_all(request)?;
        debug!(data = ?String::from_utf8_lossy(request), "Write forward data");
    }
    let mut reply = vec![0u8; MAX_REPLY];
    let len = match stream.read(&mut reply) {
        Ok(len) => len,
        Err(e) if matches!(e.kind(), io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock) => 0,
        Err(e) => return Err(e.into()),
    };
    reply.truncate(len);
    debug!(data = ?String::from_utf8_lossy(&reply), "Read forward data");
    Ok((!reply.is_empty()).then_some(reply))
}

// =============================================================================
// TCP
// =============================================================================

pub struct TcpForwarder {
    addr: String,
    timeout: Duration,
    stream: Option<TcpStream>,
}

impl TcpForwarder {
    pub fn new(host: &str, port: u16, timeout: Duration) -> Self {
        Self {
            addr: format!("{}:{}", host, port),
            timeout,
            stream: None,
        }
    }

    fn connect(&mut self) -> Result<&mut TcpStream, ForwardError> {
        if self.stream.is_none() {
            let stream = TcpStream::connect(&self.addr)?;
            stream.set_read_timeout(Some(self.timeout))?;
            info!(addr = %self.addr, "Connected to forward peer");
            self.stream = Some(stream);
        }
        self.stream
            .as_mut()
            .ok_or_else(|| ForwardError::NotConnected(self.addr.clone()))
    }
}

impl Forwarder for TcpForwarder {
    fn exchange(&mut self, request: &[u8]) -> Result<Option<Vec<u8>>, ForwardError> {
        let stream = self.connect()?;
        let result = exchange_on(stream, request);
        if let Err(e) = &result {
            warn!(addr = %self.addr, %e, "The network link of the forward peer dropped");
            self.stream = None;
        }
        result
    }

    fn describe(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

// =============================================================================
// Serial
// =============================================================================

pub struct SerialForwarder {
    port_name: String,
    baud_rate: u32,
    timeout: Duration,
    port: Option<Box<dyn SerialPort>>,
}

impl SerialForwarder {
    pub fn new(port_name: &str, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            port_name: port_name.to_string(),
            baud_rate,
            timeout,
            port: None,
        }
    }

    fn connect(&mut self) -> Result<&mut Box<dyn SerialPort>, ForwardError> {
        if self.port.is_none() {
            let port = serialport::new(&self.port_name, self.baud_rate)
                .timeout(self.timeout)
                .open()
                .map_err(|e| ForwardError::NotConnected(format!("{}: {}", self.port_name, e)))?;
            info!(port = %self.port_name, baud_rate = self.baud_rate, "Opened forward serial port");
            self.port = Some(port);
        }
        self.port
            .as_mut()
            .ok_or_else(|| ForwardError::NotConnected(self.port_name.clone()))
    }
}

impl Forwarder for SerialForwarder {
    fn exchange(&mut self, request: &[u8]) -> Result<Option<Vec<u8>>, ForwardError> {
        let port = self.connect()?;
        let result = exchange_on(port.as_mut(), request);
        if result.is_err() {
            self.port = None;
        }
        result
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.port_name, self.baud_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::TcpListener;

    #[test]
    fn test_tcp_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 16];
            let n = stream.read(&mut buf).unwrap();
            assert_eq!(&buf[..n], b"ATRV\r");
            stream.write_all(b"12.6V\r\r>").unwrap();
        });

        let mut forwarder = TcpForwarder::new("127.0.0.1", port, Duration::from_secs(2));
        let reply = forwarder.exchange(b"ATRV\r").unwrap();
        assert_eq!(reply.as_deref(), Some(&b"12.6V\r\r>"[..]));
        peer.join().unwrap();
    }

    #[test]
    fn test_tcp_silent_peer_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut forwarder = TcpForwarder::new("127.0.0.1", port, Duration::from_millis(50));
        // the connection sits in the backlog; nobody answers
        assert_eq!(forwarder.exchange(b"0100\r").unwrap(), None);
        drop(listener);
    }

    #[test]
    fn test_unreachable_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let mut forwarder = TcpForwarder::new("127.0.0.1", port, Duration::from_millis(50));
        assert!(forwarder.exchange(b"0100\r").is_err());
    }
}
