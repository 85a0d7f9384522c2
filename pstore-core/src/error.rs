use std::fmt;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Canonical cross-backend error kinds. Callers branch on these only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    Duplicate,
    Validation,
    Connection,
    Transaction,
    Timeout,
    Unsupported,
    Constraint,
    Serialization,
    InvalidArgument,
}

impl ErrorKind {
    /// Returns a stable error code for this kind.
    /// These codes are stable and can be used by clients for error classification.
    pub fn code(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Duplicate => "DUPLICATE",
            ErrorKind::Validation => "VALIDATION",
            ErrorKind::Connection => "CONNECTION",
            ErrorKind::Transaction => "TRANSACTION",
            ErrorKind::Timeout => "TIMEOUT",
            ErrorKind::Unsupported => "UNSUPPORTED",
            ErrorKind::Constraint => "CONSTRAINT",
            ErrorKind::Serialization => "SERIALIZATION",
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
        }
    }

    /// Returns true if an operation failing with this kind may succeed when
    /// retried by the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            // Transient
            ErrorKind::Connection => true,
            ErrorKind::Timeout => true,
            ErrorKind::Transaction => true,

            // Logical/permanent
            ErrorKind::NotFound => false,
            ErrorKind::Duplicate => false,
            ErrorKind::Validation => false,
            ErrorKind::Unsupported => false,
            ErrorKind::Constraint => false,
            ErrorKind::Serialization => false,
            ErrorKind::InvalidArgument => false,
        }
    }

    /// All kinds, in declaration order
    pub const ALL: [ErrorKind; 10] = [
        ErrorKind::NotFound,
        ErrorKind::Duplicate,
        ErrorKind::Validation,
        ErrorKind::Connection,
        ErrorKind::Transaction,
        ErrorKind::Timeout,
        ErrorKind::Unsupported,
        ErrorKind::Constraint,
        ErrorKind::Serialization,
        ErrorKind::InvalidArgument,
    ];
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::NotFound => "Not found",
            ErrorKind::Duplicate => "Duplicate",
            ErrorKind::Validation => "Validation failed",
            ErrorKind::Connection => "Connection error",
            ErrorKind::Transaction => "Transaction error",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::Unsupported => "Unsupported",
            ErrorKind::Constraint => "Constraint violation",
            ErrorKind::Serialization => "Serialization error",
            ErrorKind::InvalidArgument => "Invalid argument",
        };
        f.write_str(label)
    }
}

/// Canonical error: a kind, a message, and the native cause when there is one.
#[derive(Error, Debug)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    message: String,
    #[source]
    cause: Option<BoxError>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Attach the native error this one was normalized from
    pub fn with_cause(mut self, cause: impl Into<BoxError>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn duplicate(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Duplicate, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Connection, message)
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transaction, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unsupported, message)
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Constraint, message)
    }

    pub fn serialization(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Serialization, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Stable code of this error's kind
    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }

    /// Text of the native cause, for diagnostics only
    pub fn cause_text(&self) -> Option<String> {
        self.cause.as_ref().map(|c| c.to_string())
    }

    /// Adds context to the message while keeping the kind and cause.
    ///
    /// # Examples
    ///
    /// ```
    /// use pstore_core::{Error, ErrorKind};
    ///
    /// let err = Error::not_found("users/42").with_context("failed to load profile");
    /// assert_eq!(err.kind(), ErrorKind::NotFound);
    /// assert_eq!(err.message(), "failed to load profile: users/42");
    /// ```
    pub fn with_context(mut self, context: &str) -> Error {
        self.message = format!("{}: {}", context, self.message);
        self
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization(format!("JSON: {}", err)).with_cause(err)
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::serialization(format!("bincode: {}", err)).with_cause(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
