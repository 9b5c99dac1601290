//! Bus Error Types
//!
//! Failures of registry and lifecycle operations. The originating verbs
//! (`order`, `answer`, `poll`, `stream`, `broadcast`) never surface these:
//! they log and return `None` / `false`.

use codec::CodecError;
use thiserror::Error;
use types::ComponentKind;

#[derive(Debug, Error)]
pub enum BusError {
    /// No component under this name
    #[error("Component '{name}' is not registered")]
    NotRegistered { name: String },

    /// Name already registered with another hosting kind
    #[error("Component '{name}' is registered as {existing}, cannot re-register as {requested}")]
    ConflictingKind {
        name: String,
        existing: ComponentKind,
        requested: ComponentKind,
    },

    /// Class name absent from the catalog
    #[error("Unknown component class '{class}'")]
    UnknownClass { class: String },

    /// Constructor or `initialize` failed
    #[error("Failed to construct '{name}': {message}")]
    Construct { name: String, message: String },

    /// Bus is shutting down; no new work accepted
    #[error("Bus is shutting down")]
    ShuttingDown,

    /// Worker thread or process could not be launched
    #[error("Failed to spawn worker for '{name}': {message}")]
    Spawn {
        name: String,
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Worker socket failure
    #[error("Transport error: {context}: {source}")]
    Transport {
        context: &'static str,
        #[source]
        source: CodecError,
    },

    /// Bounded lock wait expired
    #[error("Timed out waiting for {what} lock")]
    LockTimeout { what: &'static str },

    /// Invalid bus configuration
    #[error(transparent)]
    Config(#[from] bus_config::ConfigError),

    /// Instance is not of the requested component type
    #[error("Component '{name}' is not a {expected}")]
    WrongClass { name: String, expected: &'static str },
}

pub type Result<T> = std::result::Result<T, BusError>;

impl BusError {
    pub fn not_registered(name: impl Into<String>) -> Self {
        Self::NotRegistered { name: name.into() }
    }

    pub fn construct(name: impl Into<String>, message: impl ToString) -> Self {
        Self::Construct {
            name: name.into(),
            message: message.to_string(),
        }
    }

    pub fn spawn(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Spawn {
            name: name.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn spawn_with_source(
        name: impl Into<String>,
        message: impl Into<String>,
        source: std::io::Error,
    ) -> Self {
        Self::Spawn {
            name: name.into(),
            message: message.into(),
            source: Some(source),
        }
    }

    pub fn transport(context: &'static str, source: CodecError) -> Self {
        Self::Transport { context, source }
    }

    /// The peer of a worker link is gone
    pub fn is_disconnect(&self) -> bool {
        matches!(self, BusError::Transport { source, .. } if source.is_disconnect())
    }
}
