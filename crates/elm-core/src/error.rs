//! Engine errors
//!
//! None of these are fatal to the worker loop: every variant is logged by the
//! engine and mapped to an empty, `NO DATA` or `?` reply.

use thiserror::Error;

/// Errors raised while interpreting a request or rendering a response
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ElmError {
    /// Non-hex payload or header, bad size field, truncated request
    #[error("Malformed input: {0}")]
    MalformedInput(String),

    /// Out-of-sequence frame, duplicate First Frame, unimplemented addressing mode
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A task handler failed or a plugin could not be registered/instantiated
    #[error("Plugin fault in {plugin}: {message}")]
    PluginFault { plugin: String, message: String },

    /// Response template could not be parsed
    #[error("Template error: {0}")]
    Template(String),

    /// Inline expression failed to evaluate
    #[error("Expression error in '{expression}': {message}")]
    Expression { expression: String, message: String },
}

impl ElmError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedInput(msg.into())
    }

    pub fn violation(msg: impl Into<String>) -> Self {
        Self::ProtocolViolation(msg.into())
    }

    pub fn plugin(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PluginFault {
            plugin: plugin.into(),
            message: message.into(),
        }
    }
}

/// Result type for engine operations
pub type ElmResult<T> = Result<T, ElmError>;

/// Errors raised while loading a message catalog
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to read catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid catalog YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid request pattern '{pattern}' for entry {key}: {message}")]
    Pattern {
        key: String,
        pattern: String,
        message: String,
    },

    #[error("Unknown scenario: {0}")]
    UnknownScenario(String),
}
