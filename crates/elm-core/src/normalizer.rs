//! Request normalization
//!
//! Cleans up one line from the tester and, when CAN automatic formatting is
//! off, splits the ISO-TP PCI byte from the payload.

use tracing::{debug, error};

use crate::counters::{keys, Counters};
use crate::error::{ElmError, ElmResult};
use crate::uds::is_hex;

/// A normalized command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Command without spaces, upper-cased, PCI removed
    pub cmd: String,
    /// Declared payload length in bytes (Single or First Frame)
    pub length: Option<usize>,
    /// Frame index: 0 for a First Frame, sequence number for a Consecutive Frame
    pub frame: Option<u32>,
}

impl Request {
    fn plain(cmd: String) -> Self {
        Self {
            cmd,
            length: None,
            frame: None,
        }
    }
}

/// Reject lines the adapter would never receive from a tester
pub fn validate(line: &str) -> ElmResult<()> {
    match line.chars().find(|c| !c.is_ascii() || (c.is_ascii_control() && *c != '\t')) {
        Some(c) => Err(ElmError::malformed(format!("invalid character {:?} in {:?}", c, line))),
        None => Ok(()),
    }
}

/// Normalize one line, updating `commands`, `cmd_last_cmd` and the
/// first-come header counters
pub fn normalize(line: &str, counters: &mut Counters) -> ElmResult<Request> {
    validate(line)?;
    let mut cmd: String = line
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect::<String>()
        .to_ascii_uppercase();
    counters.increment(keys::COMMANDS);

    if cmd.is_empty() {
        if let Some(last) = counters.string(keys::LAST_CMD) {
            debug!(cmd = %last, "Repeating last command");
            cmd = last;
        }
    } else {
        counters.set(keys::LAST_CMD, cmd.as_str());
    }

    if counters.flag(keys::FCSM, false) && !cmd.starts_with("AT") && cmd.len() >= 3 && is_hex(&cmd[..3]) {
        let header = cmd[..3].to_string();
        debug!(%header, "First-come header");
        counters.set(keys::SET_HEADER, header);
        counters.set(keys::CAF, false);
        counters.set(keys::USE_HEADER, true);
        cmd.replace_range(..3, "");
    }

    let caf_off = counters.get(keys::CAF).map(|v| !v.is_truthy()).unwrap_or(false);
    if !caf_off || cmd.starts_with("AT") {
        return Ok(Request::plain(cmd));
    }
    let size = &cmd[..cmd.len().min(2)];
    if !is_hex(size) {
        return Ok(Request::plain(cmd));
    }
    let pci = u8::from_str_radix(size, 16).map_err(|e| ElmError::malformed(format!("improper size {:?}: {}", size, e)))?;
    let payload = &cmd[size.len()..];
    if payload.is_empty() {
        error!(%cmd, "Missing data for request");
        return Err(ElmError::malformed(format!("missing data in {:?}", cmd)));
    }

    let request = match pci {
        0x00..=0x0F => {
            let length = usize::from(pci);
            if length == 0 || payload.len() < length * 2 {
                error!(%cmd, size, "Request data has an improper length");
                return Err(ElmError::malformed(format!("{:?} is shorter than {} bytes", payload, length)));
            }
            Request {
                cmd: payload[..length * 2].to_string(),
                length: Some(length),
                frame: None,
            }
        }
        0x10..=0x1F => {
            let low = payload
                .get(..2)
                .filter(|b| is_hex(b))
                .and_then(|b| usize::from_str_radix(b, 16).ok())
                .ok_or_else(|| {
                    error!(%cmd, "Improper First Frame length");
                    ElmError::malformed(format!("improper First Frame length in {:?}", cmd))
                })?;
            Request {
                cmd: payload[2..].to_string(),
                length: Some((usize::from(pci & 0x0F) << 8) | low),
                frame: Some(0),
            }
        }
        // 0x20 is index 0 after the sequence number wraps, not a plain command
        _ => Request {
            cmd: payload.to_string(),
            length: None,
            frame: Some(u32::from(pci - 0x20)),
        },
    };
    debug!(length = ?request.length, frame = ?request.frame, cmd = %request.cmd, "Framed request");
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn caf_off() -> Counters {
        let mut counters = Counters::new();
        counters.set(keys::CAF, false);
        counters
    }

    #[test]
    fn test_spaces_removed_and_uppercased() {
        let mut counters = Counters::new();
        let request = normalize("at sh 7e0", &mut counters).unwrap();
        assert_eq!(request, Request::plain("ATSH7E0".into()));
        assert_eq!(counters.int(keys::COMMANDS), Some(1));
    }

    #[test]
    fn test_fast_repeat() {
        let mut counters = Counters::new();
        normalize("01 0C", &mut counters).unwrap();
        let request = normalize("", &mut counters).unwrap();
        assert_eq!(request.cmd, "010C");
        assert_eq!(counters.int(keys::COMMANDS), Some(2));
    }

    #[test]
    fn test_control_characters_rejected() {
        let mut counters = Counters::new();
        assert!(normalize("01\x0700", &mut counters).is_err());
        assert!(normalize("01é0", &mut counters).is_err());
        assert!(normalize("AT\tZ", &mut counters).is_ok());
    }

    #[test]
    fn test_caf_on_keeps_pci() {
        let mut counters = Counters::new();
        counters.set(keys::CAF, true);
        let request = normalize("020100", &mut counters).unwrap();
        assert_eq!(request, Request::plain("020100".into()));
    }

    #[test]
    fn test_single_frame() {
        let mut counters = caf_off();
        let request = normalize("02 01 00 55 55", &mut counters).unwrap();
        assert_eq!(
            request,
            Request {
                cmd: "0100".into(),
                length: Some(2),
                frame: None,
            }
        );
    }

    #[test]
    fn test_single_frame_too_short() {
        let mut counters = caf_off();
        assert!(normalize("030100", &mut counters).is_err());
        assert!(normalize("02", &mut counters).is_err());
    }

    #[test]
    fn test_first_frame_length() {
        let mut counters = caf_off();
        let request = normalize("10 14 2E F1 90 57 30 4C", &mut counters).unwrap();
        assert_eq!(request.cmd, "2EF19057304C");
        assert_eq!(request.length, Some(0x14));
        assert_eq!(request.frame, Some(0));

        let request = normalize("1102AABBCCDDEEFF", &mut counters).unwrap();
        assert_eq!(request.length, Some(0x102));
    }

    #[test]
    fn test_consecutive_frame() {
        let mut counters = caf_off();
        let request = normalize("21 30 30 30 30 34 33 4D", &mut counters).unwrap();
        assert_eq!(request.cmd, "3030303034334D");
        assert_eq!(request.length, None);
        assert_eq!(request.frame, Some(1));

        let request = normalize("2011", &mut counters).unwrap();
        assert_eq!(request.frame, Some(0));
    }

    #[test]
    fn test_at_commands_skip_pci() {
        let mut counters = caf_off();
        let request = normalize("ATCAF1", &mut counters).unwrap();
        assert_eq!(request, Request::plain("ATCAF1".into()));
    }

    #[test]
    fn test_first_come_header() {
        let mut counters = Counters::new();
        counters.set(keys::FCSM, true);
        let request = normalize("7E0 02 01 00", &mut counters).unwrap();
        assert_eq!(counters.string(keys::SET_HEADER).as_deref(), Some("7E0"));
        assert!(counters.flag(keys::USE_HEADER, false));
        assert!(!counters.flag(keys::CAF, true));
        assert_eq!(request.cmd, "0100");
        assert_eq!(request.length, Some(2));
    }
}
