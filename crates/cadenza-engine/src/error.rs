use std::io;

use cadenza_graph::{GraphError, NodeKey};
use cadenza_plugin_host::PluginError;
use thiserror::Error;

use crate::backend::BackendKind;
use crate::transport::TransportState;

/// Errors raised while validating or executing actions.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ActionError {
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("invalid action: {0}")]
    Invalid(String),
    #[error("routing change would create a cycle")]
    WouldCycle,
    #[error(transparent)]
    Port(#[from] PortError),
    #[error("plugin rejected: {0}")]
    Plugin(String),
    #[error("\"{0}\" clears the undo history and must be confirmed")]
    ConfirmationRequired(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("invariant violated: {0}")]
    InvariantViolation(String),
}

impl ActionError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        ActionError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        ActionError::Invalid(message.into())
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        ActionError::InvariantViolation(message.into())
    }
}

impl From<PluginError> for ActionError {
    fn from(err: PluginError) -> Self {
        ActionError::Plugin(err.to_string())
    }
}

/// Port routing errors in project terms.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PortError {
    #[error("{0} does not belong to any project object")]
    UnknownNode(NodeKey),
    #[error("connections between implicit channel ports cannot be edited")]
    Implicit,
    #[error(transparent)]
    Graph(#[from] GraphError),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TransportError {
    #[error("cannot go from {from:?} to {to:?}")]
    IllegalTransition {
        from: TransportState,
        to: TransportState,
    },
    #[error("tempo {0} bpm is outside 1..=999")]
    InvalidTempo(f64),
    #[error("time signature {numerator}/{denominator} is not supported")]
    InvalidTimeSignature { numerator: u8, denominator: u8 },
    #[error("range {start}..{end} is empty")]
    EmptyRange { start: u64, end: u64 },
    #[error("the tempo and meter at tick 0 cannot be removed")]
    FirstEventFixed,
    #[error("no tempo change at tick {tick}")]
    NoTempoEvent { tick: u64 },
    #[error("no time signature change at tick {tick}")]
    NoSignatureEvent { tick: u64 },
    #[error("time signature change at tick {tick} is not on a bar line")]
    OffBarLine { tick: u64 },
}

#[derive(Debug, Error)]
pub enum RecordingError {
    #[error("no recording in progress")]
    NotRecording,
    #[error("capture buffers overflowed, {0} frame(s) lost")]
    Overflow(u64),
    #[error(transparent)]
    Action(#[from] ActionError),
}

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{kind:?} backend is unavailable: {reason}")]
    Unavailable { kind: BackendKind, reason: String },
    #[error("{0:?} backend support was not compiled in")]
    FeatureDisabled(BackendKind),
    #[error("audio device error: {0}")]
    Device(String),
    #[error("audio stream error: {0}")]
    Stream(String),
    #[error("backend io error: {0}")]
    Io(#[from] io::Error),
    #[error("backend is already running")]
    AlreadyRunning,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] io::Error),
    #[error("config could not be parsed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Rejection of a project document by the schema check.
#[derive(Debug, Error)]
pub enum VersionedMigrationError {
    #[error("project document has no version field")]
    MissingVersion,
    #[error("project version {found} is not supported (expected {supported})")]
    UnsupportedVersion { found: u64, supported: u64 },
    #[error("project document is malformed: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("project content is inconsistent: {0}")]
    Inconsistent(String),
}

#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("project io error: {0}")]
    Io(#[from] io::Error),
    #[error("project could not be encoded: {0}")]
    Encode(#[from] serde_json::Error),
    #[error(transparent)]
    Migration(#[from] VersionedMigrationError),
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Action(#[from] ActionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Recording(#[from] RecordingError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Port(#[from] PortError),
    #[error("engine io error: {0}")]
    Io(#[from] io::Error),
    #[error("the engine is driven by a running backend")]
    BackendRunning,
    #[error("unknown parameter {0}")]
    UnknownParam(String),
    #[error("parameter queue is full")]
    QueueFull,
}
