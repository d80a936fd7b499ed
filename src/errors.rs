//! Engine-wide error taxonomy.
//!
//! Every failure the engine reports carries an [`ErrorKind`] so callers can
//! branch on the class of failure instead of parsing messages.

use crate::backend::BackendError;
use crate::models::RecordId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

/// Field name → message. Ordered so error payloads are stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct FieldErrors(BTreeMap<String, String>);

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, field: &str, message: impl Into<String>) {
        self.0.entry(field.to_string()).or_insert_with(|| message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn remove(&mut self, field: &str) {
        self.0.remove(field);
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn extend(&mut self, other: FieldErrors) {
        for (field, message) in other.0 {
            self.0.entry(field).or_insert(message);
        }
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.0
    }

    /// `Ok(())` when empty, otherwise a validation error carrying the fields.
    pub fn into_result(self) -> Result<(), EngineError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(EngineError::Validation(self))
        }
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(|(field, message)| format!("{field}: {message}"))
            .collect::<Vec<_>>()
            .join("; ");
        f.write_str(&joined)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FileFailure {
    pub index: usize,
    pub name: String,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Upload,
    TransitionRejected,
    CommitPartialFailure,
    ServerRejected,
    NetworkFailure,
    InFlight,
    NotFound,
    Unauthorized,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(FieldErrors),
    #[error("{} of {attempted} uploads failed", failures.len())]
    Upload {
        attempted: usize,
        failures: Vec<FileFailure>,
    },
    #[error("transition rejected: {0}")]
    TransitionRejected(String),
    #[error("pet {pet_id} was updated but the listing was not committed: {detail}")]
    CommitPartialFailure { pet_id: RecordId, detail: String },
    #[error("stage `{stage}` rejected by backend: {detail}")]
    ServerRejected { stage: &'static str, detail: String },
    #[error("stage `{stage}` failed: {detail}")]
    NetworkFailure { stage: &'static str, detail: String },
    #[error("`{0}` is already in flight")]
    InFlight(&'static str),
    #[error("{0} not found")]
    NotFound(String),
    #[error("backend refused the access token at `{stage}` (HTTP {status})")]
    Unauthorized { stage: &'static str, status: u16 },
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Upload => "upload",
            ErrorKind::TransitionRejected => "transition_rejected",
            ErrorKind::CommitPartialFailure => "commit_partial_failure",
            ErrorKind::ServerRejected => "server_rejected",
            ErrorKind::NetworkFailure => "network_failure",
            ErrorKind::InFlight => "in_flight",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Unauthorized => "unauthorized",
        }
    }
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::Upload { .. } => ErrorKind::Upload,
            EngineError::TransitionRejected(_) => ErrorKind::TransitionRejected,
            EngineError::CommitPartialFailure { .. } => ErrorKind::CommitPartialFailure,
            EngineError::ServerRejected { .. } => ErrorKind::ServerRejected,
            EngineError::NetworkFailure { .. } => ErrorKind::NetworkFailure,
            EngineError::InFlight(_) => ErrorKind::InFlight,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::Unauthorized { .. } => ErrorKind::Unauthorized,
        }
    }

    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        let mut errors = FieldErrors::new();
        errors.insert(field, message);
        EngineError::Validation(errors)
    }

    /// Maps a backend failure for a stage that does not drive a request
    /// transition.
    pub fn from_backend(stage: &'static str, err: BackendError) -> Self {
        match err {
            BackendError::NotFound(what) => EngineError::NotFound(what),
            BackendError::Unauthorized(status) => EngineError::Unauthorized { stage, status },
            BackendError::Rejected { detail, .. } => EngineError::ServerRejected { stage, detail },
            other => EngineError::NetworkFailure {
                stage,
                detail: other.to_string(),
            },
        }
    }

    /// Like [`EngineError::from_backend`], but a 4xx other than 401/403 from
    /// a confirm/cancel call is the server refusing the transition.
    pub fn from_transition(stage: &'static str, err: BackendError) -> Self {
        match err {
            BackendError::Rejected { detail, .. } => EngineError::TransitionRejected(detail),
            other => Self::from_backend(stage, other),
        }
    }

    pub fn field_errors(&self) -> Option<&FieldErrors> {
        match self {
            EngineError::Validation(fields) => Some(fields),
            _ => None,
        }
    }
}
