//! Task plugin registry
//!
//! Plugins are registered explicitly at startup under a `task_` name; a
//! catalog entry refers to them through its `Task` field.

use std::collections::BTreeMap;

use tracing::{debug, error};

use super::write_vin::WriteVin;
use super::{Task, TaskInfo};
use crate::error::{ElmError, ElmResult};

/// Name prefix every plugin must carry
pub const PLUGIN_PREFIX: &str = "task_";

/// Builds a fresh task instance
pub type TaskFactory = Box<dyn Fn(&TaskInfo) -> Box<dyn Task> + Send + Sync>;

/// Plugin name → factory
#[derive(Default)]
pub struct TaskRegistry {
    factories: BTreeMap<String, TaskFactory>,
}

impl TaskRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the plugins shipped with the engine
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let builtins: [(&str, TaskFactory); 1] =
            [("task_write_vin", Box::new(|_: &TaskInfo| Box::new(WriteVin) as Box<dyn Task>))];
        for (name, factory) in builtins {
            if let Err(e) = registry.register(name, factory) {
                error!(plugin = name, %e, "Built-in plugin rejected");
            }
        }
        registry
    }

    /// Register a plugin; invalid names are rejected, not fatal
    pub fn register(&mut self, name: impl Into<String>, factory: TaskFactory) -> ElmResult<()> {
        let name = name.into();
        let suffix = name.strip_prefix(PLUGIN_PREFIX).unwrap_or_default();
        if suffix.is_empty()
            || !suffix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            error!(plugin = %name, "Task plugin rejected: invalid name");
            return Err(ElmError::plugin(
                name,
                format!("plugin names must match '{}<name>'", PLUGIN_PREFIX),
            ));
        }
        if self.factories.insert(name.clone(), factory).is_some() {
            debug!(plugin = %name, "Task plugin replaced");
        } else {
            debug!(plugin = %name, "Task plugin registered");
        }
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Instantiate a plugin
    pub fn create(&self, name: &str, info: &TaskInfo) -> Option<Box<dyn Task>> {
        self.factories.get(name).map(|factory| factory(info))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskContext, TaskReply};

    struct Echo;

    impl Task for Echo {
        fn run(
            &mut self,
            _ctx: &mut TaskContext<'_>,
            cmd: &str,
            _length: Option<usize>,
            _frame: Option<u32>,
        ) -> ElmResult<TaskReply> {
            Ok(TaskReply::passthrough(cmd))
        }
    }

    #[test]
    fn test_builtins_registered() {
        let registry = TaskRegistry::with_builtins();
        assert!(registry.contains("task_write_vin"));
    }

    #[test]
    fn test_register_rejects_bad_names() {
        let mut registry = TaskRegistry::new();
        let result = registry.register("echo", Box::new(|_: &TaskInfo| Box::new(Echo) as Box<dyn Task>));
        assert!(matches!(result, Err(ElmError::PluginFault { .. })));
        let result = registry.register("task_", Box::new(|_: &TaskInfo| Box::new(Echo) as Box<dyn Task>));
        assert!(result.is_err());
        assert_eq!(registry.names().count(), 0);
    }

    #[test]
    fn test_create_unknown_plugin() {
        let mut registry = TaskRegistry::new();
        registry
            .register("task_echo", Box::new(|_: &TaskInfo| Box::new(Echo) as Box<dyn Task>))
            .unwrap();
        let info = TaskInfo::new("task_echo", "7E0", "0100");
        assert!(registry.create("task_echo", &info).is_some());
        assert!(registry.create("task_missing", &info).is_none());
    }
}
