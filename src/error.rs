// src/error.rs
use serde::Serialize;
use thiserror::Error;

/// Failure classes of the matching engine.
///
/// Storage and collaborator failures are usually attached as `anyhow` context
/// so the underlying driver error stays in the chain; use
/// [`MatchError::classify`] to recover the class from an `anyhow::Error`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MatchError {
    /// Malformed or empty record fields. Recovered locally by dropping the record.
    #[error("input error: {0}")]
    Input(String),
    /// Missing reference corpus, invalid settings. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),
    /// Connection loss or failed statement. Fatal to the in-flight run.
    #[error("storage error: {0}")]
    Storage(String),
    /// The embedding job failed or timed out. Fatal to vector retrieval for the run.
    #[error("collaborator error: {0}")]
    Collaborator(String),
    #[error("run cancelled: {0}")]
    Cancelled(String),
}

impl MatchError {
    pub fn storage(msg: impl Into<String>) -> Self {
        MatchError::Storage(msg.into())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MatchError::Input(_) => "input",
            MatchError::Configuration(_) => "configuration",
            MatchError::Storage(_) => "storage",
            MatchError::Collaborator(_) => "collaborator",
            MatchError::Cancelled(_) => "cancelled",
        }
    }

    /// Finds the first `MatchError` anywhere in the chain, including context layers.
    pub fn classify(err: &anyhow::Error) -> Option<&MatchError> {
        err.downcast_ref::<MatchError>()
            .or_else(|| err.chain().find_map(|cause| cause.downcast_ref::<MatchError>()))
    }
}

/// Structured error body returned by the single-record command.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub status: &'static str,
    pub kind: &'static str,
    pub message: String,
}

impl From<&anyhow::Error> for ErrorPayload {
    fn from(err: &anyhow::Error) -> Self {
        let kind = MatchError::classify(err).map_or("internal", MatchError::kind);
        ErrorPayload {
            status: "error",
            kind,
            message: format!("{:#}", err),
        }
    }
}

/// Success envelope shared by the CLI commands.
#[derive(Debug, Clone, Serialize)]
pub struct SuccessPayload<T: Serialize> {
    pub status: &'static str,
    pub message: String,
    pub data: T,
}

impl<T: Serialize> SuccessPayload<T> {
    pub fn new(message: impl Into<String>, data: T) -> Self {
        Self {
            status: "success",
            message: message.into(),
            data,
        }
    }
}
