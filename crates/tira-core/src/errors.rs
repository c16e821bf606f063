//! Error surface shared across TiraStore crates.
//!
//! Every failure carries one [`ErrorInfo`] payload: a stable code for
//! programmatic handling, a sentence for humans, and whatever diagnostic
//! pairs the failure site attached. Context pairs keep their attachment
//! order, matching how the failure unfolded.

use std::fmt::{self, Display};

use thiserror::Error;

/// Diagnostic payload carried by every [`TiraError`].
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorInfo {
    /// Stable machine readable code, e.g. `tira_store.lock_deadline`.
    pub code: String,
    /// What went wrong, in one sentence.
    pub message: String,
    /// Diagnostic key/value pairs, in attachment order.
    pub context: Vec<(String, String)>,
    /// Suggested remediation, when one is known.
    pub hint: Option<String>,
}

impl ErrorInfo {
    /// Starts a payload from its code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            context: Vec::new(),
            hint: None,
        }
    }

    /// Attaches one diagnostic pair.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.push((key.into(), value.into()));
        self
    }

    /// Records a remediation hint.
    pub fn hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// Looks up a context value by key (first attachment wins).
    pub fn get(&self, key: &str) -> Option<&str> {
        self.context
            .iter()
            .find(|(name, _)| name == key)
            .map(|(_, value)| value.as_str())
    }
}

impl Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        for (key, value) in &self.context {
            write!(f, "; {key}={value}")?;
        }
        if let Some(hint) = &self.hint {
            write!(f, " (hint: {hint})")?;
        }
        Ok(())
    }
}

/// Failure classes surfaced by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The caller passed something the store cannot accept.
    InvalidArgument,
    /// The CPU profile gate is closed for this connection.
    ReadOnlyConnection,
    /// No record exists under the requested key.
    NotFound,
    /// The hard-link mutex could not be taken in time.
    LockUnavailable,
    /// The database was created with a different schema version.
    SchemaIncompatible,
    /// The SQL engine reported a non-retryable failure.
    Storage,
    /// A filesystem operation outside the engine failed.
    Io,
}

/// Canonical error type for TiraStore operations.
///
/// `InvalidArgument` is always raised before any filesystem I/O; `Storage`
/// carries the engine's own message in the payload hint.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TiraError {
    /// See [`ErrorKind::InvalidArgument`].
    #[error("rejected: {0}")]
    InvalidArgument(ErrorInfo),
    /// See [`ErrorKind::ReadOnlyConnection`].
    #[error("writes disabled: {0}")]
    ReadOnlyConnection(ErrorInfo),
    /// See [`ErrorKind::NotFound`].
    #[error("missing record: {0}")]
    NotFound(ErrorInfo),
    /// See [`ErrorKind::LockUnavailable`].
    #[error("lock not acquired: {0}")]
    LockUnavailable(ErrorInfo),
    /// See [`ErrorKind::SchemaIncompatible`].
    #[error("schema mismatch: {0}")]
    SchemaIncompatible(ErrorInfo),
    /// See [`ErrorKind::Storage`].
    #[error("engine failure: {0}")]
    Storage(ErrorInfo),
    /// See [`ErrorKind::Io`].
    #[error("filesystem failure: {0}")]
    Io(ErrorInfo),
}

impl TiraError {
    /// The failure class, for callers that branch on it.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TiraError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            TiraError::ReadOnlyConnection(_) => ErrorKind::ReadOnlyConnection,
            TiraError::NotFound(_) => ErrorKind::NotFound,
            TiraError::LockUnavailable(_) => ErrorKind::LockUnavailable,
            TiraError::SchemaIncompatible(_) => ErrorKind::SchemaIncompatible,
            TiraError::Storage(_) => ErrorKind::Storage,
            TiraError::Io(_) => ErrorKind::Io,
        }
    }

    /// The diagnostic payload, whatever the class.
    pub fn info(&self) -> &ErrorInfo {
        let (TiraError::InvalidArgument(info)
        | TiraError::ReadOnlyConnection(info)
        | TiraError::NotFound(info)
        | TiraError::LockUnavailable(info)
        | TiraError::SchemaIncompatible(info)
        | TiraError::Storage(info)
        | TiraError::Io(info)) = self;
        info
    }
}
