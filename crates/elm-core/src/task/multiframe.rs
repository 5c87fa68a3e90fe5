//! Multi-frame request reassembly (ISO 15765-2 style)
//!
//! With CAN automatic formatting off, the tester sends its own PCI bytes. A
//! First Frame opens a collection on the request header, Consecutive Frames
//! extend it and a Flow Control frame is written back every block. Once the
//! declared length is reached the payload is passed through to the catalog.

use tracing::{debug, error};

use super::{Task, TaskContext, TaskReply};
use crate::counters::keys;
use crate::error::{ElmError, ElmResult};
use crate::uds;

/// Name under which the engine installs reassembly tasks
pub const MULTILINE_TASK: &str = "multiline";

/// Default flow control block size
pub const DEFAULT_BLOCK_SIZE: u8 = 0x20;

/// Reassembly state for one header
#[derive(Debug, Default)]
pub struct Reassembler {
    /// Payload collected so far (hex digits)
    payload: String,
    /// Next expected Consecutive Frame index; `None` when idle
    expected: Option<u32>,
    /// Declared total length in bytes
    length: Option<usize>,
    /// Frames left before the next Flow Control
    cadence: usize,
}

impl Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_collecting(&self) -> bool {
        self.expected.is_some()
    }

    fn block_size(ctx: &TaskContext<'_>) -> u8 {
        ctx.counters
            .int(keys::FC_BLOCK_SIZE)
            .and_then(|bs| u8::try_from(bs).ok())
            .unwrap_or(DEFAULT_BLOCK_SIZE)
    }

    fn flow_control(&mut self, ctx: &mut TaskContext<'_>, cmd: &str) -> ElmResult<()> {
        if self.cadence > 0 {
            self.cadence -= 1;
            return Ok(());
        }
        let block_size = Self::block_size(ctx);
        let enabled = ctx
            .counters
            .get(keys::CFC)
            .map(|v| v.as_int() == Some(1))
            .unwrap_or(true);
        if enabled {
            if uds::is_extended_header(&ctx.info.header) {
                return Err(ElmError::violation(format!(
                    "flow control with 29-bit header {}",
                    ctx.info.header
                )));
            }
            let template = format!("<flow>{:02X} 00</flow>", block_size);
            ctx.emit(&template, cmd);
        }
        // Block size 0: the sender never waits again for this message
        self.cadence = match block_size {
            0 => usize::MAX,
            bs => usize::from(bs) - 1,
        };
        Ok(())
    }

    fn next_index(index: u32) -> u32 {
        // Sequence numbers are four bits wide
        (index + 1) & 0x0F
    }
}

impl Task for Reassembler {
    fn run(
        &mut self,
        ctx: &mut TaskContext<'_>,
        cmd: &str,
        length: Option<usize>,
        frame: Option<u32>,
    ) -> ElmResult<TaskReply> {
        match (frame, length) {
            // First Frame
            (Some(0), Some(len)) if len > 0 => {
                if self.is_collecting() || self.length.is_some() {
                    error!(length = len, cmd, "Invalid initial frame");
                    return Ok(TaskReply::error());
                }
                self.payload = cmd.to_string();
                self.expected = Some(1);
                self.length = Some(len);
            }
            // Consecutive Frame
            (Some(index), None) if self.expected == Some(index) => {
                self.payload.push_str(cmd);
                self.expected = Some(Self::next_index(index));
            }
            // Single Frame
            (None, length) if !self.is_collecting() && length != Some(0) => {
                self.length = length;
                let payload = match length {
                    Some(len) => truncate_hex(cmd, len),
                    None => cmd.to_string(),
                };
                return Ok(TaskReply::passthrough(payload));
            }
            _ => {
                error!(?frame, ?length, cmd, "Invalid consecutive frame");
                return Ok(TaskReply::error());
            }
        }

        self.flow_control(ctx, cmd)?;

        let total = self.length.unwrap_or(0);
        if total * 2 <= self.payload.len() {
            debug!(length = total, "Multi-frame request complete");
            self.expected = None;
            return Ok(TaskReply::passthrough(truncate_hex(&self.payload, total)));
        }
        Ok(TaskReply::incomplete())
    }
}

fn truncate_hex(payload: &str, length: usize) -> String {
    payload.chars().take(length * 2).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::Counters;
    use crate::render::Outbox;
    use crate::task::{TaskInfo, TaskState};

    fn run(
        task: &mut Reassembler,
        counters: &mut Counters,
        out: &mut Outbox,
        cmd: &str,
        length: Option<usize>,
        frame: Option<u32>,
    ) -> TaskReply {
        let info = TaskInfo::new(MULTILINE_TASK, "7E0", cmd);
        let mut ctx = TaskContext::new(counters, &info, out);
        task.run(&mut ctx, cmd, length, frame).unwrap()
    }

    #[test]
    fn test_single_frame_truncates() {
        let mut task = Reassembler::new();
        let mut counters = Counters::new();
        let mut out = Outbox::new();
        let reply = run(&mut task, &mut counters, &mut out, "0100AAAA", Some(2), None);
        assert_eq!(reply.passthrough.as_deref(), Some("0100"));
        assert_eq!(reply.state, TaskState::Terminate);
        assert!(out.is_empty());
    }

    #[test]
    fn test_first_and_consecutive_frames() {
        let mut task = Reassembler::new();
        let mut counters = Counters::new();
        let mut out = Outbox::new();

        let reply = run(&mut task, &mut counters, &mut out, "2EF1905745", Some(10), Some(0));
        assert_eq!(reply, TaskReply::incomplete());
        // First Frame always triggers Flow Control
        assert_eq!(out.chunks(), ["30 20 00 \r\r>".to_string()]);

        let reply = run(&mut task, &mut counters, &mut out, "30313233343536", None, Some(1));
        assert_eq!(reply.passthrough.as_deref(), Some("2EF19057453031323334"));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_out_of_order_frame_is_violation() {
        let mut task = Reassembler::new();
        let mut counters = Counters::new();
        let mut out = Outbox::new();
        run(&mut task, &mut counters, &mut out, "2EF1905745", Some(20), Some(0));
        let reply = run(&mut task, &mut counters, &mut out, "30313233343536", None, Some(2));
        assert_eq!(reply, TaskReply::error());
    }

    #[test]
    fn test_duplicate_first_frame_is_violation() {
        let mut task = Reassembler::new();
        let mut counters = Counters::new();
        let mut out = Outbox::new();
        run(&mut task, &mut counters, &mut out, "2EF1905745", Some(20), Some(0));
        let reply = run(&mut task, &mut counters, &mut out, "2EF1905745", Some(20), Some(0));
        assert_eq!(reply, TaskReply::error());
    }

    #[test]
    fn test_flow_control_cadence() {
        let mut task = Reassembler::new();
        let mut counters = Counters::new();
        counters.set(keys::FC_BLOCK_SIZE, 2i64);
        let mut out = Outbox::new();

        // 6 + 7 * 4 = 34 bytes
        run(&mut task, &mut counters, &mut out, "000000000000", Some(34), Some(0));
        assert_eq!(out.len(), 1);
        run(&mut task, &mut counters, &mut out, "00000000000000", None, Some(1));
        assert_eq!(out.len(), 1);
        run(&mut task, &mut counters, &mut out, "00000000000000", None, Some(2));
        assert_eq!(out.len(), 2);
        assert_eq!(out.chunks()[1], "30 02 00 \r\r>");
        run(&mut task, &mut counters, &mut out, "00000000000000", None, Some(3));
        assert_eq!(out.len(), 2);
        let reply = run(&mut task, &mut counters, &mut out, "00000000000000", None, Some(4));
        assert_eq!(out.len(), 3);
        assert_eq!(reply.passthrough.map(|p| p.len()), Some(68));
    }

    #[test]
    fn test_flow_control_suppressed() {
        let mut task = Reassembler::new();
        let mut counters = Counters::new();
        counters.set(keys::CFC, 0i64);
        let mut out = Outbox::new();
        run(&mut task, &mut counters, &mut out, "2EF1905745", Some(10), Some(0));
        assert!(out.is_empty());
    }

    #[test]
    fn test_flow_control_on_29bit_header_is_violation() {
        let mut task = Reassembler::new();
        let mut counters = Counters::new();
        let mut out = Outbox::new();
        let info = TaskInfo::new(MULTILINE_TASK, "18DAF110", "2EF1905745");
        let mut ctx = TaskContext::new(&mut counters, &info, &mut out);
        let err = task.run(&mut ctx, "2EF1905745", Some(20), Some(0)).unwrap_err();
        assert!(matches!(err, ElmError::ProtocolViolation(_)));
        assert!(out.is_empty());
    }

    #[test]
    fn test_sequence_number_wraps() {
        let mut task = Reassembler::new();
        let mut counters = Counters::new();
        let mut out = Outbox::new();
        // 6 + 16 * 7 = 118 bytes
        run(&mut task, &mut counters, &mut out, "000000000000", Some(118), Some(0));
        for index in 1..=15 {
            let reply = run(&mut task, &mut counters, &mut out, "11111111111111", None, Some(index));
            assert_eq!(reply, TaskReply::incomplete());
        }
        let reply = run(&mut task, &mut counters, &mut out, "22222222222222", None, Some(0));
        let payload = reply.passthrough.unwrap();
        assert_eq!(payload.len(), 236);
        assert!(payload.ends_with("22222222222222"));
    }
}
