//! Error types for pipeline construction and execution.

use std::fmt;

use thiserror::Error;

/// Errors produced while rendering or running pipeline commands.
#[derive(Error, Debug, Clone)]
pub enum ChainError {
    /// The storage backend rejected or failed a query.
    #[error("backend error: {0}")]
    Backend(String),

    /// A validation step failed.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A user callback returned an error.
    #[error("callback error: {0}")]
    Callback(String),

    /// The backend does not implement the requested operation.
    #[error("operation '{operation}' is not supported by backend '{backend}'")]
    Unsupported { backend: String, operation: String },

    /// A value could not be rendered into a query.
    #[error("invalid value: {0}")]
    InvalidValue(String),

    /// Establishing a backend connection failed.
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// A registered source did not become available in time.
    #[error("timed out waiting for source '{source_id}' after {attempts} attempts")]
    ConnectionTimeout { source_id: String, attempts: u32 },

    /// A named query template was not registered.
    #[error("unknown query template '{0}'")]
    UnknownTemplate(String),

    /// Converting between wire formats failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl ChainError {
    pub fn backend(message: impl fmt::Display) -> Self {
        ChainError::Backend(message.to_string())
    }

    pub fn validation(message: impl Into<String>) -> Self {
        ChainError::Validation(message.into())
    }

    pub fn callback(message: impl fmt::Display) -> Self {
        ChainError::Callback(message.to_string())
    }

    pub fn unsupported(backend: impl Into<String>, operation: impl Into<String>) -> Self {
        ChainError::Unsupported {
            backend: backend.into(),
            operation: operation.into(),
        }
    }

    pub fn invalid_value(message: impl Into<String>) -> Self {
        ChainError::InvalidValue(message.into())
    }

    pub fn connection_failed(message: impl fmt::Display) -> Self {
        ChainError::ConnectionFailed(message.to_string())
    }

    pub fn serialization(message: impl fmt::Display) -> Self {
        ChainError::Serialization(message.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ChainError>;

/// An error recorded during a run, tagged with the step that produced it.
#[derive(Debug, Clone)]
pub struct StepError {
    /// Name of the command the error belongs to, if it had one.
    pub step: Option<String>,
    pub error: ChainError,
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.step {
            Some(step) => write!(f, "{}: {}", step, self.error),
            None => write!(f, "{}", self.error),
        }
    }
}

/// Collector for everything that went wrong during a run.
///
/// Execution keeps going after most failures, so a single run can
/// accumulate several entries. Validation steps and callers inspect the
/// report to decide whether the run as a whole succeeded.
#[derive(Debug, Clone, Default)]
pub struct ErrorReport {
    entries: Vec<StepError>,
}

impl ErrorReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, error: ChainError) {
        self.entries.push(StepError { step: None, error });
    }

    pub fn push_step(&mut self, step: impl Into<String>, error: ChainError) {
        self.entries.push(StepError {
            step: Some(step.into()),
            error,
        });
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &StepError> {
        self.entries.iter()
    }

    /// First recorded error, if any.
    pub fn first(&self) -> Option<&StepError> {
        self.entries.first()
    }

    /// True if any entry was recorded for the named step.
    pub fn has_step(&self, step: &str) -> bool {
        self.entries
            .iter()
            .any(|e| e.step.as_deref() == Some(step))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl fmt::Display for ErrorReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.entries.is_empty() {
            return write!(f, "no errors");
        }
        for (i, entry) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", entry)?;
        }
        Ok(())
    }
}
