//! Stateful per-header tasks
//!
//! A task lets one command sequence span many physical frames. Tasks are
//! created either by a catalog entry naming a plugin, or implicitly by the
//! engine when a First Frame arrives (see [`multiframe::Reassembler`]).
//!
//! Every method returns a [`TaskReply`]: an optional response template, whether
//! the task stays alive, and an optional passthrough command that the engine
//! feeds back into catalog resolution.

pub mod multiframe;
pub mod registry;
pub mod write_vin;

use std::time::Instant;

use crate::catalog::ScenarioEntry;
use crate::counters::Counters;
use crate::error::ElmResult;
use crate::render::{Outbox, Renderer};

pub use registry::{TaskFactory, TaskRegistry};

/// Whether a task stays installed after a method call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Continue,
    Terminate,
}

/// Return value of every task method
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReply {
    /// Template to render, if any
    pub response: Option<String>,
    pub state: TaskState,
    /// Command to resolve against the catalog after this reply
    pub passthrough: Option<String>,
}

impl TaskReply {
    /// Terminate without output
    pub fn error() -> Self {
        Self {
            response: None,
            state: TaskState::Terminate,
            passthrough: None,
        }
    }

    /// Stay alive, waiting for more frames
    pub fn incomplete() -> Self {
        Self {
            response: None,
            state: TaskState::Continue,
            passthrough: None,
        }
    }

    /// Terminate and hand `cmd` back to the catalog
    pub fn passthrough(cmd: impl Into<String>) -> Self {
        Self {
            response: None,
            state: TaskState::Terminate,
            passthrough: Some(cmd.into()),
        }
    }

    pub fn respond(response: impl Into<String>, state: TaskState) -> Self {
        Self {
            response: Some(response.into()),
            state,
            passthrough: None,
        }
    }

    pub fn terminates(&self) -> bool {
        self.state == TaskState::Terminate
    }
}

/// Static attributes of a task instance
#[derive(Debug, Clone)]
pub struct TaskInfo {
    /// Plugin name (also the completion counter key)
    pub plugin: String,
    /// Request header the task is bound to
    pub header: String,
    /// Request that created the task
    pub request: String,
    /// Catalog entry that declared the task
    pub entry: Option<ScenarioEntry>,
    pub started: Instant,
}

impl TaskInfo {
    pub fn new(plugin: impl Into<String>, header: impl Into<String>, request: impl Into<String>) -> Self {
        Self {
            plugin: plugin.into(),
            header: header.into(),
            request: request.into(),
            entry: None,
            started: Instant::now(),
        }
    }

    pub fn with_entry(mut self, entry: ScenarioEntry) -> Self {
        self.entry = Some(entry);
        self
    }

    /// Name of the catalog entry that declared the task, if any
    pub fn pid(&self) -> Option<&str> {
        self.entry.as_ref().map(|e| e.name.as_str())
    }
}

/// What a task may touch while it runs
pub struct TaskContext<'a> {
    pub counters: &'a mut Counters,
    pub info: &'a TaskInfo,
    out: &'a mut Outbox,
}

impl<'a> TaskContext<'a> {
    pub fn new(counters: &'a mut Counters, info: &'a TaskInfo, out: &'a mut Outbox) -> Self {
        Self { counters, info, out }
    }

    /// Render a template and write it to the tester right away
    pub fn emit(&mut self, template: &str, request_data: &str) -> Option<String> {
        Renderer::new(&mut *self.counters, &mut *self.out).render(
            template,
            Some(&self.info.header),
            Some(request_data),
        )
    }
}

/// Task contract
///
/// `start` runs when the task is created, `stop` when a non-hex command
/// interrupts it; both default to `run`.
pub trait Task: Send {
    fn run(
        &mut self,
        ctx: &mut TaskContext<'_>,
        cmd: &str,
        length: Option<usize>,
        frame: Option<u32>,
    ) -> ElmResult<TaskReply>;

    fn start(
        &mut self,
        ctx: &mut TaskContext<'_>,
        cmd: &str,
        length: Option<usize>,
        frame: Option<u32>,
    ) -> ElmResult<TaskReply> {
        self.run(ctx, cmd, length, frame)
    }

    fn stop(
        &mut self,
        ctx: &mut TaskContext<'_>,
        cmd: &str,
        length: Option<usize>,
        frame: Option<u32>,
    ) -> ElmResult<TaskReply> {
        self.run(ctx, cmd, length, frame)
    }
}

/// Which task method to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskMethod {
    Start,
    Run,
    Stop,
}

impl std::fmt::Display for TaskMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskMethod::Start => f.write_str("start"),
            TaskMethod::Run => f.write_str("run"),
            TaskMethod::Stop => f.write_str("stop"),
        }
    }
}

/// An installed task
pub struct TaskSlot {
    pub info: TaskInfo,
    pub task: Box<dyn Task>,
}

impl TaskSlot {
    pub fn new(info: TaskInfo, task: Box<dyn Task>) -> Self {
        Self { info, task }
    }

    pub fn call(
        &mut self,
        method: TaskMethod,
        counters: &mut Counters,
        out: &mut Outbox,
        cmd: &str,
        length: Option<usize>,
        frame: Option<u32>,
    ) -> ElmResult<TaskReply> {
        let mut ctx = TaskContext::new(counters, &self.info, out);
        match method {
            TaskMethod::Start => self.task.start(&mut ctx, cmd, length, frame),
            TaskMethod::Run => self.task.run(&mut ctx, cmd, length, frame),
            TaskMethod::Stop => self.task.stop(&mut ctx, cmd, length, frame),
        }
    }
}
