//! Error types for the metering engine

use thiserror::Error;

/// Rejected configuration value. Raised before any packet is processed.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Source missing or not resolvable
    #[error("invalid source: {0}")]
    Source(String),

    /// Option value outside its accepted range
    #[error("invalid {option}: {reason}")]
    OutOfRange {
        option: &'static str,
        reason: String,
    },

    /// Packet filter expression failed to compile
    #[error("invalid packet filter {expression:?}: {reason}")]
    Filter { expression: String, reason: String },

    /// Wrong value kind or unknown option in a configuration document
    #[error("malformed configuration: {0}")]
    Malformed(String),
}

impl ConfigError {
    pub(crate) fn out_of_range(option: &'static str, reason: impl Into<String>) -> Self {
        Self::OutOfRange {
            option,
            reason: reason.into(),
        }
    }
}

/// Failure raised by a plugin hook
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct PluginError(String);

impl PluginError {
    /// Create from a message
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Packet source failure
#[derive(Error, Debug)]
pub enum SourceError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be decoded
    #[error("line {line}: {source}")]
    Decode {
        line: usize,
        source: serde_json::Error,
    },
}

/// Boundary error of a metering run. Configuration and plugin failures
/// surface through the same type.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Configuration error
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    /// Plugin hook failed; fatal for the run
    #[error("plugin {plugin} failed: {source}")]
    Plugin { plugin: String, source: PluginError },

    /// Packet source failed
    #[error("source error: {0}")]
    Source(#[from] SourceError),

    /// Writing exported records failed
    #[error("export error: {0}")]
    Export(#[from] std::io::Error),

    /// Worker thread could not be started
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),
}

/// Result type for metering runs
pub type StreamResult<T> = Result<T, StreamError>;
