//! UDS framing for emulated ECU replies
//!
//! Builds the bytes an ELM327 would print for one CAN reply: the reply
//! header (when header echo is on), the length byte and the payload for
//! 11-bit identifiers, or the format byte, swapped addresses and checksum
//! for 29-bit identifiers.

use crate::error::{ElmError, ElmResult};

/// UDS Service IDs used by the emulator
pub mod service_id {
    pub const READ_DATA_BY_ID: u8 = 0x22;
    pub const WRITE_DATA_BY_ID: u8 = 0x2E;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;
}

/// ISO-TP Flow Control, status "continue to send"
pub const FLOW_CONTROL_CTS: u8 = 0x30;

/// Offset added to the service id in a positive response
pub const POSITIVE_RESPONSE_OFFSET: u8 = 0x40;

/// Offset between an 11-bit physical request id and its reply id
const REPLY_ID_OFFSET: u32 = 8;

/// 29-bit format byte: physical addressing, length in the low nibble
const FORMAT_BYTE: u8 = 0x80;

/// What kind of frame to encode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Regular reply carrying a payload
    Answer,
    /// Flow Control frame sent back during a multi-frame request
    Flow,
}

/// Formatting options derived from the session
#[derive(Debug, Clone, Copy)]
pub struct Framing<'a> {
    /// Print the reply header and length
    pub echo_header: bool,
    /// Separator between bytes
    pub sp: &'a str,
}

/// Positive response payload: `(SID + 0x40) ‖ request[1] ‖ text`
pub fn positive_response(request: &str, text: &str) -> ElmResult<String> {
    let request = decode(request)?;
    let Some(&sid) = request.first() else {
        return Err(ElmError::malformed("empty request for positive response"));
    };
    let mut data = format!("{:02X}", sid.wrapping_add(POSITIVE_RESPONSE_OFFSET));
    if let Some(sub) = request.get(1) {
        data.push_str(&format!("{:02X}", sub));
    }
    data.push_str(text);
    Ok(data)
}

/// Negative response payload: `7F ‖ SID ‖ text`
pub fn negative_response(request: &str, text: &str) -> ElmResult<String> {
    let request = decode(request)?;
    let Some(&sid) = request.first() else {
        return Err(ElmError::malformed("empty request for negative response"));
    };
    Ok(format!(
        "{:02X}{:02X}{}",
        service_id::NEGATIVE_RESPONSE,
        sid,
        text
    ))
}

/// Encode one reply frame
///
/// `header` is the request header; `data` the payload in hex, spaced or not.
pub fn encode(header: &str, data: &str, kind: FrameKind, framing: Framing<'_>) -> ElmResult<String> {
    let header: String = header
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_uppercase();
    if header.is_empty() {
        return Err(ElmError::malformed(format!("missing request header for data {:?}", data)));
    }
    if !is_hex(&header) {
        return Err(ElmError::malformed(format!("invalid request header {:?}", header)));
    }
    let payload = decode(data)?;
    let sp = framing.sp;
    let body = join_bytes(&payload, sp);

    match header.len() {
        3 => {
            let reply_id = u32::from_str_radix(&header, 16)
                .map_err(|_| ElmError::malformed(format!("invalid request header {:?}", header)))?
                + REPLY_ID_OFFSET;
            let mut answer = String::new();
            match kind {
                FrameKind::Flow => {
                    if framing.echo_header {
                        answer.push_str(&format!("{:X}{}", reply_id, sp));
                    }
                    answer.push_str(&format!("{:02X}{}", FLOW_CONTROL_CTS, sp));
                }
                FrameKind::Answer => {
                    if framing.echo_header {
                        answer.push_str(&format!("{:X}{}{:02X}{}", reply_id, sp, payload.len(), sp));
                    }
                }
            }
            answer.push_str(&body);
            Ok(answer)
        }
        6 | 8 => {
            // The leading priority byte of a full 29-bit id is not echoed
            let id = &header[header.len() - 6..];
            if kind == FrameKind::Flow {
                return Err(ElmError::violation("flow control with 29-bit addressing"));
            }
            if !framing.echo_header {
                return Err(ElmError::violation("29-bit reply without header echo"));
            }
            let ta = hex_byte(&id[2..4])?;
            let sa = hex_byte(&id[4..6])?;

            let mut frame = Vec::with_capacity(payload.len() + 5);
            if payload.len() < 16 {
                frame.push(FORMAT_BYTE + payload.len() as u8);
                frame.extend([sa, ta]);
            } else {
                let len = u8::try_from(payload.len())
                    .map_err(|_| ElmError::malformed(format!("payload too long: {} bytes", payload.len())))?;
                frame.extend([FORMAT_BYTE, sa, ta, len]);
            }
            frame.extend_from_slice(&payload);
            let checksum = frame.iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
            frame.push(checksum);
            Ok(join_bytes(&frame, sp))
        }
        _ => Err(ElmError::malformed(format!("invalid request header {:?}", header))),
    }
}

/// Decode a hex string, ignoring embedded whitespace
pub fn decode(data: &str) -> ElmResult<Vec<u8>> {
    let unspaced: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&unspaced).map_err(|e| ElmError::malformed(format!("invalid hex {:?}: {}", data, e)))
}

/// Whether `cmd` is a non-empty, even-length hex string
pub fn is_hex_payload(cmd: &str) -> bool {
    !cmd.is_empty() && cmd.len() % 2 == 0 && cmd.chars().all(|c| c.is_ascii_hexdigit())
}

/// Whether `header` is a 29-bit address (`DA F1 10` or `18 DA F1 10`)
pub fn is_extended_header(header: &str) -> bool {
    let digits = header.chars().filter(|c| !c.is_whitespace()).count();
    matches!(digits, 6 | 8)
}

/// Whether `s` is a non-empty hex string of any length
pub fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn hex_byte(s: &str) -> ElmResult<u8> {
    u8::from_str_radix(s, 16).map_err(|_| ElmError::malformed(format!("invalid address byte {:?}", s)))
}

fn join_bytes(bytes: &[u8], sp: &str) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(sp)
}
