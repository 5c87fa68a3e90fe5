//! Catalog resolution

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use super::Engine;
use crate::catalog::{Action, ScenarioEntry};
use crate::counters::keys;
use crate::expr::{self, Locals};
use crate::task::{TaskInfo, TaskMethod, TaskSlot};
use crate::uds::is_hex_payload;

/// Answer of an entry without `Response`
pub const ELM_OK: &str = "<writeln>OK</writeln>";

/// Answer to an unknown hex request
pub const ELM_NO_DATA: &str = "<writeln>NO DATA</writeln>";

/// Answer to an unknown adapter command
pub const ELM_UNKNOWN: &str = "<writeln>?</writeln>";

/// Where an expression attached to an entry is evaluated
#[derive(Debug, Clone, Copy)]
enum Field {
    Exec,
    Info,
    Warning,
    Log,
    ResponseHeader,
    ResponseFooter,
}

impl Engine {
    /// Match `cmd` against the sorted entries and build the response template
    ///
    /// `cmd` is replaced when a task started by an entry passes a command
    /// through.
    pub(super) fn resolve(
        &mut self,
        header: Option<&str>,
        cmd: &mut String,
        length: Option<usize>,
        frame: Option<u32>,
    ) -> Option<String> {
        let entries = Arc::clone(&self.sorted);
        for entry in entries.iter() {
            if !entry.matches(cmd) || !entry.accepts_header(header) {
                continue;
            }
            let pid = entry.name.as_str();
            self.session.counters.increment(pid);

            match entry.action {
                Some(Action::Skip) => {
                    info!(%cmd, pid, "Skipping entry");
                    continue;
                }
                Some(Action::Reset) => {
                    debug!(%cmd, pid, "Adapter reset");
                    self.session.reset();
                }
                None => {}
            }
            match &entry.descr {
                Some(descr) => debug!(%cmd, pid, descr = %descr, "Matched"),
                None => warn!(%cmd, pid, "Missing description"),
            }

            if let Some(answer) = self.session.answer(pid) {
                return Some(answer.to_string());
            }

            if let Some(plugin) = &entry.task {
                match self.start_task(plugin, header, cmd, entry, length, frame) {
                    TaskStart::Answer(response) => return response,
                    TaskStart::Passthrough(passthrough) => *cmd = passthrough,
                }
            }

            self.evaluate(entry, Field::Exec, cmd);
            self.evaluate(entry, Field::Info, cmd);
            self.evaluate(entry, Field::Warning, cmd);
            self.evaluate(entry, Field::Log, cmd);

            return match &entry.response {
                None => Some(ELM_OK.to_string()),
                Some(None) => None,
                Some(Some(response)) => {
                    let prefix = self.evaluate(entry, Field::ResponseHeader, cmd).unwrap_or_default();
                    let suffix = self.evaluate(entry, Field::ResponseFooter, cmd).unwrap_or_default();
                    response
                        .choose()
                        .map(|body| format!("{}{}{}", prefix, body, suffix))
                }
            };
        }

        self.unknown(header, cmd)
    }

    fn start_task(
        &mut self,
        plugin: &str,
        header: Option<&str>,
        cmd: &str,
        entry: &ScenarioEntry,
        length: Option<usize>,
        frame: Option<u32>,
    ) -> TaskStart {
        let key = header.unwrap_or_default();
        let info = TaskInfo::new(plugin, key, cmd).with_entry(entry.clone());
        let Some(task) = self.registry.create(plugin, &info) else {
            error!(plugin, pid = %entry.name, "Unexisting plugin");
            return TaskStart::Answer(None);
        };
        if let Some(evicted) = self.session.take_task(key) {
            debug!(
                task = %evicted.info.plugin,
                header = key,
                "Another task was active on the same header; deleting it"
            );
        }
        self.session.insert_task(TaskSlot::new(info, task));
        debug!(plugin, header = key, "Starting task");

        let reply = self.task_action(key, TaskMethod::Start, cmd, length, frame);
        match reply.passthrough {
            Some(passthrough) => TaskStart::Passthrough(passthrough),
            None => TaskStart::Answer(reply.response),
        }
    }

    /// Evaluate one expression field of `entry`
    fn evaluate(&mut self, entry: &ScenarioEntry, field: Field, cmd: &str) -> Option<String> {
        let expression = match field {
            Field::Exec => entry.exec.as_deref(),
            Field::Info => entry.info.as_deref(),
            Field::Warning => entry.warning.as_deref(),
            Field::Log => entry.log.as_deref(),
            Field::ResponseHeader => entry.response_header.as_deref(),
            Field::ResponseFooter => entry.response_footer.as_deref(),
        }?;
        let locals = Locals::new().with("cmd", cmd).with("pid", entry.name.as_str());
        let value = match expr::evaluate(expression, &mut self.session.counters, &locals) {
            Ok(value) => value,
            Err(e) => {
                error!(pid = %entry.name, ?field, %e, "Cannot evaluate expression");
                return None;
            }
        };
        let message = value.as_deref().unwrap_or_default();
        match field {
            Field::Info => info!(pid = %entry.name, "{}", message),
            Field::Warning => warn!(pid = %entry.name, "{}", message),
            Field::Log => debug!(pid = %entry.name, "{}", message),
            _ => {}
        }
        value
    }

    /// Count, optionally forward and answer an unknown command
    fn unknown(&mut self, header: Option<&str>, cmd: &str) -> Option<String> {
        let counter = format!("{}{}", keys::UNKNOWN_PREFIX, cmd);
        let hits = self.session.counters.increment(&counter);
        if cmd.is_empty() {
            info!("No ELM command");
            return None;
        }

        if let Some(forwarder) = self.forwarder.as_mut() {
            match forwarder.exchange(format!("{}\r", cmd).as_bytes()) {
                Ok(reply) => {
                    let reply = reply
                        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                        .unwrap_or_default();
                    debug!(%cmd, reply = ?reply, "Forwarded unknown command");
                    self.session.counters.set(format!("{}_R", counter), reply);
                }
                Err(e) => warn!(%cmd, %e, "Forwarding failed"),
            }
        }

        let hex = is_hex_payload(cmd);
        let kind = if hex { "request" } else { "ELM command" };
        if hits == 1 {
            warn!(%cmd, header = header.unwrap_or_default(), "Unknown {}", kind);
        } else {
            debug!(%cmd, header = header.unwrap_or_default(), hits, "Unknown {}", kind);
        }
        Some(if hex { ELM_NO_DATA } else { ELM_UNKNOWN }.to_string())
    }
}

enum TaskStart {
    /// Return this template (or nothing) for the request
    Answer(Option<String>),
    /// Keep processing the entry with this command
    Passthrough(String),
}

#[cfg(test)]
mod tests {
    use crate::catalog::Catalog;
    use crate::counters::{keys, Counters};
    use crate::engine::Engine;
    use crate::forward::{ForwardError, Forwarder};
    use pretty_assertions::assert_eq;

    const CATALOG: &str = r#"
default:
  ELM_PIDS_A:
    Request: ^0100$
    Descr: PIDS_A
    Response: <header>7E8</header><size>06</size><data>41 00 BE 3F A8 13</data>
  QUIET:
    Request: ^0200$
    Descr: No answer
    Response: ~
  COUNTED:
    Request: ^0300$
    Descr: Counted only
    Action: skip
  FOOTER:
    Request: ^0400$
    Descr: Header and footer
    ResponseHeader: '"<string>" + pid + "</string>"'
    ResponseFooter: '"<writeln>" + cmd + "</writeln>"'
    Response: <string>-</string>
AT:
  ELM_HEADERS:
    Request: ^ATH[01]$
    Descr: Headers
    Exec: 'cmd_use_header = slice(cmd, 3) == "1"'
"#;

    fn engine() -> Engine {
        Engine::new(Catalog::from_yaml(CATALOG).unwrap(), Counters::new())
    }

    /// Real adapter stand-in with a fixed behavior
    enum FakeAdapter {
        Answers(&'static str),
        Silent,
        Unreachable,
    }

    impl Forwarder for FakeAdapter {
        fn exchange(&mut self, request: &[u8]) -> Result<Option<Vec<u8>>, ForwardError> {
            assert!(request.ends_with(b"\r"), "request {:?}", request);
            match self {
                FakeAdapter::Answers(reply) => Ok(Some(reply.as_bytes().to_vec())),
                FakeAdapter::Silent => Ok(None),
                FakeAdapter::Unreachable => Err(ForwardError::NotConnected("fake".into())),
            }
        }

        fn describe(&self) -> String {
            "fake".to_string()
        }
    }

    #[test]
    fn test_missing_response_answers_ok() {
        let mut engine = engine();
        assert_eq!(engine.process_line("ATH1"), vec!["OK\r\r>".to_string()]);
        assert!(engine.counters().flag(keys::USE_HEADER, false));
        assert_eq!(
            engine.process_line("0100"),
            vec!["7E8 06 41 00 BE 3F A8 13 \r\r>".to_string()]
        );
    }

    #[test]
    fn test_null_response_is_silent() {
        let mut engine = engine();
        assert!(engine.process_line("0200").is_empty());
        assert_eq!(engine.counters().int("QUIET"), Some(1));
    }

    #[test]
    fn test_skip_counts_and_continues() {
        let mut engine = engine();
        assert_eq!(engine.process_line("0300"), vec!["NO DATA\r\r>".to_string()]);
        assert_eq!(engine.counters().int("COUNTED"), Some(1));
        assert_eq!(engine.counters().int("unknown_0300"), Some(1));
    }

    #[test]
    fn test_header_and_footer_expressions() {
        let mut engine = engine();
        assert_eq!(engine.process_line("0400"), vec!["FOOTER-0400\r\r>".to_string()]);
    }

    #[test]
    fn test_cached_answer_bypasses_template() {
        let mut engine = engine();
        engine.session_mut().set_answer("ELM_PIDS_A", "<writeln>cached</writeln>");
        assert_eq!(engine.process_line("0100"), vec!["cached\r\r>".to_string()]);

        assert!(engine.session_mut().clear_answer("ELM_PIDS_A").is_some());
        assert_eq!(
            engine.process_line("0100"),
            vec!["41 00 BE 3F A8 13 \r\r>".to_string()]
        );
    }

    #[test]
    fn test_unknown_commands() {
        let mut engine = engine();
        assert_eq!(engine.process_line("0999"), vec!["NO DATA\r\r>".to_string()]);
        assert_eq!(engine.process_line("0999"), vec!["NO DATA\r\r>".to_string()]);
        assert_eq!(engine.process_line("ATXYZ"), vec!["?\r\r>".to_string()]);
        assert_eq!(engine.process_line("099"), vec!["?\r\r>".to_string()]);
        assert_eq!(engine.counters().int("unknown_0999"), Some(2));
        assert_eq!(engine.counters().int("unknown_ATXYZ"), Some(1));
    }

    #[test]
    fn test_forwarded_reply_is_recorded() {
        let mut engine = engine();
        engine.set_forwarder(Box::new(FakeAdapter::Answers("41 99 00\r\r>")));
        assert_eq!(engine.process_line("0199"), vec!["NO DATA\r\r>".to_string()]);
        assert_eq!(
            engine.counters().string("unknown_0199_R").as_deref(),
            Some("41 99 00\r\r>")
        );
        assert_eq!(engine.counters().int("unknown_0199"), Some(1));
    }

    #[test]
    fn test_forwarder_timeout_records_empty_reply() {
        let mut engine = engine();
        engine.set_forwarder(Box::new(FakeAdapter::Silent));
        assert_eq!(engine.process_line("ATXYZ"), vec!["?\r\r>".to_string()]);
        assert_eq!(engine.counters().string("unknown_ATXYZ_R").as_deref(), Some(""));
    }

    #[test]
    fn test_forwarder_error_keeps_primary_answer() {
        let mut engine = engine();
        engine.set_forwarder(Box::new(FakeAdapter::Unreachable));
        assert_eq!(engine.process_line("0199"), vec!["NO DATA\r\r>".to_string()]);
        assert_eq!(engine.process_line("ATXYZ"), vec!["?\r\r>".to_string()]);
        assert!(!engine.counters().contains("unknown_0199_R"));
        assert_eq!(engine.counters().int("unknown_0199"), Some(1));
    }

    #[test]
    fn test_known_commands_are_not_forwarded() {
        let mut engine = engine();
        engine.set_forwarder(Box::new(FakeAdapter::Answers("unexpected")));
        engine.process_line("0100");
        assert!(!engine.counters().contains("unknown_0100_R"));
    }
}
