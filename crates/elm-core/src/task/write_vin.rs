//! `task_write_vin`: UDS WriteDataByIdentifier for the VIN (DID F190)

use tracing::warn;

use super::{Task, TaskContext, TaskReply, TaskState};
use crate::counters::keys;
use crate::error::ElmResult;

/// WriteDataByIdentifier request prefix for DID F190
const WRITE_VIN_PREFIX: &str = "2EF190";

/// Stores a written VIN in the `vin` counter and acknowledges it
pub struct WriteVin;

impl Task for WriteVin {
    fn run(
        &mut self,
        ctx: &mut TaskContext<'_>,
        cmd: &str,
        _length: Option<usize>,
        _frame: Option<u32>,
    ) -> ElmResult<TaskReply> {
        let Some(data) = cmd.strip_prefix(WRITE_VIN_PREFIX) else {
            return Ok(TaskReply::respond("<writeln>NO DATA</writeln>", TaskState::Terminate));
        };
        let vin = match hex::decode(data) {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) => {
                warn!(%e, cmd, "Cannot decode written VIN");
                return Ok(TaskReply::respond("<writeln>NO DATA</writeln>", TaskState::Terminate));
            }
        };
        warn!(%vin, "Written VIN");
        ctx.counters.set(keys::VIN, vin);
        Ok(TaskReply::respond("<pos_answer>90</pos_answer>", TaskState::Terminate))
    }
}
