//! Task lifecycle driving

use tracing::{debug, error};

use super::Engine;
use crate::render::Renderer;
use crate::task::{TaskMethod, TaskReply};

impl Engine {
    /// Call `method` on the task bound to `header`
    ///
    /// A response returned together with a passthrough is written right
    /// away; otherwise it is handed back for the caller to render. A
    /// terminating or failing task is removed from the session.
    pub(super) fn task_action(
        &mut self,
        header: &str,
        method: TaskMethod,
        cmd: &str,
        length: Option<usize>,
        frame: Option<u32>,
    ) -> TaskReply {
        let Some(mut slot) = self.session.take_task(header) else {
            error!(header, %method, "No task to run");
            return TaskReply::error();
        };
        debug!(
            task = %slot.info.plugin,
            pid = slot.info.pid().unwrap_or_default(),
            %method,
            cmd,
            ?length,
            ?frame,
            header,
            "Running task"
        );

        let reply = match slot.call(method, &mut self.session.counters, &mut self.out, cmd, length, frame) {
            Ok(reply) => reply,
            Err(e) => {
                error!(
                    task = %slot.info.plugin,
                    header,
                    %method,
                    %e,
                    "Error in task"
                );
                return TaskReply::error();
            }
        };
        debug!(
            response = ?reply.response,
            state = ?reply.state,
            passthrough = ?reply.passthrough,
            "Task replied"
        );

        if reply.passthrough.is_some() {
            if let Some(response) = &reply.response {
                Renderer::new(&mut self.session.counters, &mut self.out).render(
                    response,
                    Some(header),
                    Some(&slot.info.request),
                );
            }
        }

        if reply.terminates() {
            self.session.counters.increment(&slot.info.plugin);
            debug!(task = %slot.info.plugin, header, elapsed = ?slot.info.started.elapsed(), "Task terminated");
        } else {
            self.session.insert_task(slot);
        }
        reply
    }
}
