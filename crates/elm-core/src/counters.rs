//! Session counters
//!
//! A flat map of named values holding both the ELM327 configuration bits
//! (header echo, spacing, linefeeds, CAF, ...) and hit counts per catalog
//! entry and per unknown command. Keys are created on first use.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Well-known counter keys
pub mod keys {
    /// Prefix of every key cleared on adapter reset
    pub const COMMAND_PREFIX: &str = "cmd_";

    /// Header echo (ATH)
    pub const USE_HEADER: &str = "cmd_use_header";
    /// Inter-byte spacing (ATS)
    pub const SPACES: &str = "cmd_spaces";
    /// Line terminator style 0..=5 (ATL)
    pub const LINEFEEDS: &str = "cmd_linefeeds";
    /// CAN automatic formatting (ATCAF); false means requests carry a PCI byte
    pub const CAF: &str = "cmd_caf";
    /// Flow control emission (ATCFC); emitted when absent or 1
    pub const CFC: &str = "cmd_cfc";
    /// Flow control block size
    pub const FC_BLOCK_SIZE: &str = "cmd_fcbs";
    /// Receive address filter (ATCRA)
    pub const CRA: &str = "cmd_cra";
    /// Experimental first-come header mode
    pub const FCSM: &str = "cmd_fcsm";
    /// Echo of received bytes (ATE)
    pub const ECHO: &str = "cmd_echo";
    /// Current request header (ATSH)
    pub const SET_HEADER: &str = "cmd_set_header";
    /// Previous command, re-issued on an empty line
    pub const LAST_CMD: &str = "cmd_last_cmd";
    /// Read timeout in seconds between two bytes of the same line
    pub const REQ_TIMEOUT: &str = "req_timeout";
    /// Total number of processed commands
    pub const COMMANDS: &str = "commands";
    /// Last VIN written through UDS
    pub const VIN: &str = "vin";
    /// Prefix of unknown command counters
    pub const UNKNOWN_PREFIX: &str = "unknown_";
}

/// A single counter value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CounterValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl CounterValue {
    /// Python-like truthiness
    pub fn is_truthy(&self) -> bool {
        match self {
            CounterValue::Bool(b) => *b,
            CounterValue::Int(i) => *i != 0,
            CounterValue::Float(f) => *f != 0.0,
            CounterValue::Str(s) => !s.is_empty(),
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            CounterValue::Bool(b) => Some(i64::from(*b)),
            CounterValue::Int(i) => Some(*i),
            CounterValue::Float(f) => Some(*f as i64),
            CounterValue::Str(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            CounterValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            CounterValue::Int(i) => Some(*i as f64),
            CounterValue::Float(f) => Some(*f),
            CounterValue::Str(s) => s.trim().parse().ok(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            CounterValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for CounterValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CounterValue::Bool(b) => write!(f, "{}", b),
            CounterValue::Int(i) => write!(f, "{}", i),
            CounterValue::Float(v) => write!(f, "{}", v),
            CounterValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<bool> for CounterValue {
    fn from(value: bool) -> Self {
        CounterValue::Bool(value)
    }
}

impl From<i64> for CounterValue {
    fn from(value: i64) -> Self {
        CounterValue::Int(value)
    }
}

impl From<f64> for CounterValue {
    fn from(value: f64) -> Self {
        CounterValue::Float(value)
    }
}

impl From<&str> for CounterValue {
    fn from(value: &str) -> Self {
        CounterValue::Str(value.to_string())
    }
}

impl From<String> for CounterValue {
    fn from(value: String) -> Self {
        CounterValue::Str(value)
    }
}

/// Named session values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Counters {
    values: BTreeMap<String, CounterValue>,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&CounterValue> {
        self.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<CounterValue>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<CounterValue> {
        self.values.remove(key)
    }

    /// Truthiness of a key; `default` when the key is absent
    pub fn flag(&self, key: &str, default: bool) -> bool {
        self.values
            .get(key)
            .map(CounterValue::is_truthy)
            .unwrap_or(default)
    }

    pub fn int(&self, key: &str) -> Option<i64> {
        self.values.get(key).and_then(CounterValue::as_int)
    }

    pub fn string(&self, key: &str) -> Option<String> {
        self.values.get(key).map(|v| v.to_string())
    }

    /// Increment an integer counter, creating it at zero first
    pub fn increment(&mut self, key: &str) -> i64 {
        let next = self.int(key).unwrap_or(0) + 1;
        self.values
            .insert(key.to_string(), CounterValue::Int(next));
        next
    }

    /// Remove every key starting with `prefix`
    pub fn remove_prefixed(&mut self, prefix: &str) -> usize {
        let before = self.values.len();
        self.values.retain(|k, _| !k.starts_with(prefix));
        before - self.values.len()
    }

    pub fn extend(&mut self, other: &Counters) {
        for (k, v) in &other.values {
            self.values.insert(k.clone(), v.clone());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CounterValue)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

impl FromIterator<(String, CounterValue)> for Counters {
    fn from_iter<I: IntoIterator<Item = (String, CounterValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_increment_creates_key() {
        let mut counters = Counters::new();
        assert_eq!(counters.increment("ENGINE_RPM"), 1);
        assert_eq!(counters.increment("ENGINE_RPM"), 2);
        assert_eq!(counters.int("ENGINE_RPM"), Some(2));
    }

    #[test]
    fn test_flag_truthiness() {
        let mut counters = Counters::new();
        assert!(counters.flag(keys::ECHO, true));
        counters.set(keys::ECHO, false);
        assert!(!counters.flag(keys::ECHO, true));
        counters.set(keys::LINEFEEDS, 0i64);
        assert!(!counters.flag(keys::LINEFEEDS, true));
        counters.set(keys::CRA, "");
        assert!(!counters.flag(keys::CRA, true));
    }

    #[test]
    fn test_remove_prefixed() {
        let mut counters = Counters::new();
        counters.set("cmd_use_header", true);
        counters.set("cmd_spaces", 0i64);
        counters.set("commands", 4i64);
        assert_eq!(counters.remove_prefixed(keys::COMMAND_PREFIX), 2);
        assert_eq!(counters.len(), 1);
        assert!(counters.contains("commands"));
    }

    #[test]
    fn test_untagged_deserialize() {
        let yaml = r#"
cmd_use_header: true
cmd_linefeeds: 1
req_timeout: 0.5
cmd_set_header: "7E0"
"#;
        let counters: Counters = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(counters.get("cmd_use_header"), Some(&CounterValue::Bool(true)));
        assert_eq!(counters.get("cmd_linefeeds"), Some(&CounterValue::Int(1)));
        assert_eq!(counters.get("req_timeout"), Some(&CounterValue::Float(0.5)));
        assert_eq!(counters.string("cmd_set_header").as_deref(), Some("7E0"));
    }
}
