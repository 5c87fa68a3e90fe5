//! Session state for one emulated adapter connection
//!
//! Owns the counters, the per-header task table and the cached answers. The
//! engine is the only writer; nothing here is shared across threads.

use std::collections::HashMap;

use tracing::debug;

use crate::counters::{keys, CounterValue, Counters};
use crate::task::TaskSlot;

/// Functional OBD-II request header selected after reset
pub const DEFAULT_HEADER: &str = "7DF";

/// Session context
pub struct Session {
    /// Live counters
    pub counters: Counters,
    /// Values restored on every reset
    presets: Counters,
    /// Active tasks by request header
    tasks: HashMap<String, TaskSlot>,
    /// Fixed answers by catalog entry name, bypassing template generation
    answers: HashMap<String, String>,
}

impl Session {
    pub fn new(presets: Counters) -> Self {
        let mut session = Self {
            counters: Counters::new(),
            presets,
            tasks: HashMap::new(),
            answers: HashMap::new(),
        };
        session.counters.extend(&session.presets);
        session.reset();
        session
    }

    /// Return all settings to their defaults (startup, ATZ, ATD, disconnect)
    pub fn reset(&mut self) {
        let removed = self.counters.remove_prefixed(keys::COMMAND_PREFIX);
        debug!(removed, tasks = self.tasks.len(), "Resetting counters");
        self.counters.set("ELM_PIDS_A", 0i64);
        self.counters.set("ELM_MIDS_A", 0i64);
        self.counters.set(keys::SET_HEADER, DEFAULT_HEADER);
        self.counters.extend(&self.presets);
        self.tasks.clear();
    }

    pub fn presets(&self) -> &Counters {
        &self.presets
    }

    pub fn set_preset(&mut self, key: impl Into<String>, value: impl Into<CounterValue>) {
        self.presets.set(key, value);
    }

    /// Currently configured request header, upper-cased
    pub fn header(&self) -> Option<String> {
        self.counters
            .string(keys::SET_HEADER)
            .map(|h| h.trim().to_uppercase())
            .filter(|h| !h.is_empty())
    }

    // ---------------------------------------------------------------------
    // Task slots
    // ---------------------------------------------------------------------

    pub fn has_task(&self, header: &str) -> bool {
        self.tasks.contains_key(header)
    }

    pub fn task_name(&self, header: &str) -> Option<&str> {
        self.tasks.get(header).map(|slot| slot.info.plugin.as_str())
    }

    /// Install a task, returning the one it evicted
    pub fn insert_task(&mut self, slot: TaskSlot) -> Option<TaskSlot> {
        self.tasks.insert(slot.info.header.clone(), slot)
    }

    pub fn take_task(&mut self, header: &str) -> Option<TaskSlot> {
        self.tasks.remove(header)
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    // ---------------------------------------------------------------------
    // Cached answers
    // ---------------------------------------------------------------------

    pub fn set_answer(&mut self, entry: impl Into<String>, template: impl Into<String>) {
        self.answers.insert(entry.into(), template.into());
    }

    pub fn clear_answer(&mut self, entry: &str) -> Option<String> {
        self.answers.remove(entry)
    }

    pub fn answer(&self, entry: &str) -> Option<&str> {
        self.answers.get(entry).map(String::as_str)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new(Counters::new())
    }
}
