//! Message catalog
//!
//! A catalog maps scenario names to keyed entries:
//!
//! ```yaml
//! default:
//!   ELM_PIDS_A:
//!     Request: ^0100$
//!     Descr: PIDS_A
//!     Response: <header>7E8</header><size>06</size><data>41 00 BE 3F A8 13</data>
//! ```
//!
//! The reserved `AT` and `default` layers are always active; the selected
//! scenario is laid over them.

use std::path::Path;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Deserializer};
use tracing::{debug, info};

use crate::error::CatalogError;

/// Layer holding the OBD-II and UDS defaults
pub const DEFAULT_LAYER: &str = "default";

/// Layer holding the AT command set
pub const AT_LAYER: &str = "AT";

/// Priority of an entry that does not declare one
pub const DEFAULT_PRIORITY: i64 = 10;

const BUILTIN_CATALOG: &str = include_str!("builtin.yaml");

fn default_priority() -> i64 {
    DEFAULT_PRIORITY
}

/// Keeps an explicit YAML null apart from a missing field
fn explicit<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// Special handling requested by an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Count the match and keep scanning
    Skip,
    /// Adapter reset before answering
    Reset,
}

/// Response template, or alternatives picked at random
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Response {
    One(String),
    Choice(Vec<String>),
}

impl Response {
    /// Pick the template to render
    pub fn choose(&self) -> Option<&str> {
        match self {
            Response::One(template) => Some(template),
            Response::Choice(choices) => {
                use rand::seq::SliceRandom;
                choices.choose(&mut rand::thread_rng()).map(String::as_str)
            }
        }
    }
}

/// One catalog row
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ScenarioEntry {
    /// Key of the entry in its layer; also its hit counter
    #[serde(skip)]
    pub name: String,

    /// Pattern matched at the start of the normalized command
    pub request: String,

    #[serde(skip)]
    pattern: Option<Regex>,

    /// Only match while this request header is selected
    #[serde(default)]
    pub header: Option<String>,

    #[serde(default = "default_priority")]
    pub priority: i64,

    /// `None`: answer `OK`; `Some(None)`: answer nothing
    #[serde(default, deserialize_with = "explicit")]
    pub response: Option<Option<Response>>,

    /// Expression whose value prefixes the response
    #[serde(default)]
    pub response_header: Option<String>,

    /// Expression whose value suffixes the response
    #[serde(default)]
    pub response_footer: Option<String>,

    /// Task plugin started by this entry
    #[serde(default)]
    pub task: Option<String>,

    #[serde(default)]
    pub exec: Option<String>,

    #[serde(default)]
    pub info: Option<String>,

    #[serde(default)]
    pub warning: Option<String>,

    #[serde(default)]
    pub log: Option<String>,

    #[serde(default)]
    pub action: Option<Action>,

    #[serde(default)]
    pub descr: Option<String>,
}

impl ScenarioEntry {
    /// Compile the request pattern, anchored at the start of the command
    fn compile(&mut self) -> Result<(), CatalogError> {
        let pattern = Regex::new(&format!("^(?:{})", self.request)).map_err(|e| CatalogError::Pattern {
            key: self.name.clone(),
            pattern: self.request.clone(),
            message: e.to_string(),
        })?;
        self.pattern = Some(pattern);
        Ok(())
    }

    pub fn matches(&self, cmd: &str) -> bool {
        self.pattern.as_ref().map(|re| re.is_match(cmd)).unwrap_or(false)
    }

    /// Whether the entry applies with `header` selected
    pub fn accepts_header(&self, header: Option<&str>) -> bool {
        match (self.header.as_deref(), header) {
            (Some(required), Some(current)) => required.trim().eq_ignore_ascii_case(current.trim()),
            _ => true,
        }
    }
}

type Layer = IndexMap<String, ScenarioEntry>;

/// All scenarios known to the engine
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    scenarios: IndexMap<String, Layer>,
}

impl Catalog {
    /// Catalog shipped with the engine
    pub fn builtin() -> Result<Self, CatalogError> {
        Self::from_yaml(BUILTIN_CATALOG)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self, CatalogError> {
        let mut scenarios: IndexMap<String, Layer> = serde_yaml::from_str(yaml)?;
        for layer in scenarios.values_mut() {
            for (key, entry) in layer.iter_mut() {
                entry.name = key.clone();
                entry.compile()?;
            }
        }
        Ok(Self { scenarios })
    }

    /// Load a catalog file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CatalogError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| CatalogError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let catalog = Self::from_yaml(&content)?;
        info!(path = %path.display(), scenarios = catalog.scenarios.len(), "Loaded catalog");
        Ok(catalog)
    }

    /// Lay `other` over this catalog; entries with the same key are replaced
    pub fn merge(&mut self, other: Catalog) {
        for (scenario, layer) in other.scenarios {
            let target = self.scenarios.entry(scenario).or_default();
            for (key, entry) in layer {
                target.insert(key, entry);
            }
        }
    }

    pub fn contains(&self, scenario: &str) -> bool {
        self.scenarios.contains_key(scenario)
    }

    pub fn scenarios(&self) -> impl Iterator<Item = &str> {
        self.scenarios.keys().map(String::as_str)
    }

    pub fn entry(&self, scenario: &str, key: &str) -> Option<&ScenarioEntry> {
        self.scenarios.get(scenario).and_then(|layer| layer.get(key))
    }

    /// Entries active for `scenario`, in match order
    ///
    /// Order: scenario layer, then `AT`, then `default`; lower `Priority`
    /// first within a layer; catalog order last. A key defined in several
    /// layers only keeps its highest layer.
    pub fn sorted(&self, scenario: &str) -> Result<Vec<ScenarioEntry>, CatalogError> {
        if !self.contains(scenario) {
            return Err(CatalogError::UnknownScenario(scenario.to_string()));
        }

        let mut layers = vec![(2usize, DEFAULT_LAYER), (1, AT_LAYER)];
        if scenario != DEFAULT_LAYER && scenario != AT_LAYER {
            layers.push((0, scenario));
        }

        let mut merged: IndexMap<&str, (usize, usize, &ScenarioEntry)> = IndexMap::new();
        for (rank, name) in layers {
            let Some(layer) = self.scenarios.get(name) else {
                continue;
            };
            for (position, (key, entry)) in layer.iter().enumerate() {
                merged.insert(key.as_str(), (rank, position, entry));
            }
        }

        let mut entries: Vec<_> = merged.into_values().collect();
        entries.sort_by_key(|(rank, position, entry)| (*rank, entry.priority, *position));
        debug!(scenario, entries = entries.len(), "Sorted catalog");
        Ok(entries.into_iter().map(|(_, _, entry)| entry.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const LAYERED: &str = r#"
default:
  SPEED:
    Request: ^010D
    Response: <writeln>default</writeln>
  RPM:
    Request: ^010C
    Priority: 1
    Response: <writeln>rpm</writeln>
  SHARED:
    Request: ^0105
    Response: <writeln>default shared</writeln>
AT:
  ELM_Z:
    Request: ^ATZ$
    Response: <writeln>ELM327 v1.5</writeln>
  SHARED:
    Request: ^0105
    Priority: 20
    Response: <writeln>at shared</writeln>
car:
  SHARED:
    Request: ^0105
    Priority: 30
    Response: <writeln>car shared</writeln>
  LOW:
    Request: ^01
    Priority: 5
    Response: ~
"#;

    fn names(entries: &[ScenarioEntry]) -> Vec<&str> {
        entries.iter().map(|e| e.name.as_str()).collect()
    }

    #[test]
    fn test_builtin_catalog_loads() {
        let catalog = Catalog::builtin().unwrap();
        assert!(catalog.contains(DEFAULT_LAYER));
        assert!(catalog.contains(AT_LAYER));
        assert!(catalog.contains("car"));
        assert!(catalog.sorted("car").unwrap().len() > 20);
    }

    #[test]
    fn test_layer_order() {
        let catalog = Catalog::from_yaml(LAYERED).unwrap();
        let sorted = catalog.sorted("car").unwrap();
        assert_eq!(names(&sorted), vec!["LOW", "SHARED", "ELM_Z", "RPM", "SPEED"]);
        assert_eq!(sorted[1].priority, 30);

        let sorted = catalog.sorted(DEFAULT_LAYER).unwrap();
        assert_eq!(names(&sorted), vec!["ELM_Z", "SHARED", "RPM", "SPEED"]);
        assert_eq!(sorted[1].priority, 20);
    }

    #[test]
    fn test_unknown_scenario() {
        let catalog = Catalog::from_yaml(LAYERED).unwrap();
        assert!(matches!(catalog.sorted("truck"), Err(CatalogError::UnknownScenario(_))));
    }

    #[test]
    fn test_response_missing_vs_null() {
        let catalog = Catalog::from_yaml(LAYERED).unwrap();
        assert_eq!(catalog.entry("car", "LOW").unwrap().response, Some(None));
        assert!(catalog.entry("default", "SPEED").unwrap().response.is_some());

        let catalog = Catalog::from_yaml("AT:\n  ELM_D:\n    Request: ATD\n").unwrap();
        let entry = catalog.entry(AT_LAYER, "ELM_D").unwrap();
        assert_eq!(entry.response, None);
        assert_eq!(entry.priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn test_pattern_anchored_at_start() {
        let catalog = Catalog::from_yaml(LAYERED).unwrap();
        let entry = catalog.entry(AT_LAYER, "ELM_Z").unwrap();
        assert!(entry.matches("ATZ"));
        assert!(!entry.matches("XATZ"));
        let entry = catalog.entry("car", "LOW").unwrap();
        assert!(entry.matches("0100"));
        assert!(!entry.matches("0901"));
    }

    #[test]
    fn test_bad_pattern_rejected() {
        let err = Catalog::from_yaml("default:\n  BAD:\n    Request: '(01'\n").unwrap_err();
        assert!(matches!(err, CatalogError::Pattern { key, .. } if key == "BAD"));
    }

    #[test]
    fn test_header_constraint() {
        let catalog = Catalog::from_yaml("default:\n  ECU:\n    Request: ^22\n    Header: \"7e0\"\n").unwrap();
        let entry = catalog.entry(DEFAULT_LAYER, "ECU").unwrap();
        assert!(entry.accepts_header(Some("7E0")));
        assert!(!entry.accepts_header(Some("7DF")));
        assert!(entry.accepts_header(None));
    }

    #[test]
    fn test_merge_and_load() {
        let mut catalog = Catalog::from_yaml(LAYERED).unwrap();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "car:\n  SHARED:\n    Request: ^0105\n    Response: <writeln>override</writeln>").unwrap();
        catalog.merge(Catalog::load(file.path()).unwrap());

        let entry = catalog.entry("car", "SHARED").unwrap();
        assert_eq!(entry.priority, DEFAULT_PRIORITY);
        assert_eq!(
            entry.response,
            Some(Some(Response::One("<writeln>override</writeln>".into())))
        );
        assert!(catalog.entry("car", "LOW").is_some());
    }

    #[test]
    fn test_choice_response() {
        let response = Response::Choice(vec!["a".into(), "b".into()]);
        for _ in 0..10 {
            assert!(matches!(response.choose(), Some("a") | Some("b")));
        }
        assert_eq!(Response::Choice(vec![]).choose(), None);
    }
}
