use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// A malformed inbox event. The event is logged and dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassificationError {
    #[error("inbox event has an empty id")]
    MissingId,

    #[error("inbox event {id} has a malformed sender: {sender:?}")]
    MalformedSender { id: String, sender: String },
}

/// Speech that did not map to any intent
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("could not understand {heard:?}")]
pub struct IntentUnclear {
    pub heard: String,
}

/// Misuse of the conversation session API
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("no turn is open")]
    NoOpenTurn,

    #[error("turn {given} is not the open turn (open: {open})")]
    StaleTurn { given: u64, open: u64 },

    #[error("interrupt nesting limit of {limit} reached")]
    NestingLimit { limit: usize },

    #[error("a turn is already in progress")]
    TurnInProgress,
}

/// Configuration that could not be loaded or is inconsistent
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Errors that can occur while coordinating the assistant
#[derive(Error, Debug)]
pub enum AssistantError {
    #[error(transparent)]
    Classification(#[from] ClassificationError),

    #[error(transparent)]
    IntentUnclear(#[from] IntentUnclear),

    #[error("mail connection lost")]
    ConnectivityLost,

    #[error("mail authorization expired")]
    AuthExpired,

    #[error("{effect} was not acknowledged within {waited:?}")]
    SideEffectTimeout { effect: String, waited: Duration },

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("{collaborator} failed: {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
    },

    #[error("event loop is no longer running")]
    LoopClosed,
}

impl AssistantError {
    /// Wrap a collaborator failure, keeping the full anyhow chain as text
    #[must_use]
    pub fn collaborator(collaborator: &'static str, err: &anyhow::Error) -> Self {
        Self::Collaborator {
            collaborator,
            message: format!("{err:#}"),
        }
    }
}
