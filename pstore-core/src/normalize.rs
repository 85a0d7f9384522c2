/// Error normalizer
///
/// Maps native failure signals from every backend to exactly one
/// [`ErrorKind`]. Structured codes are consulted first; message patterns are
/// the last resort for backends without them. Anything unrecognized becomes
/// `Connection`. The native error is kept as the cause.

use crate::{Error, ErrorKind};
use rusqlite::ffi;
use rusqlite::ErrorCode;
use thiserror::Error as ThisError;

/// Failure reported by a document store client
#[derive(ThisError, Debug, Clone, PartialEq)]
#[error("document store error{}: {message}", .code.map(|c| format!(" {}", c)).unwrap_or_default())]
pub struct DocumentFailure {
    /// Server error code, when the server sent one
    pub code: Option<i32>,
    /// Error labels such as `TransientTransactionError`
    pub labels: Vec<String>,
    pub message: String,
    /// The "no documents" sentinel
    pub not_found: bool,
}

impl DocumentFailure {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            labels: Vec::new(),
            message: message.into(),
            not_found: false,
        }
    }

    /// A failure without a server code
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            code: None,
            labels: Vec::new(),
            message: message.into(),
            not_found: false,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            not_found: true,
            ..Self::message(message)
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.push(label.into());
        self
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// Failure reported by a key-value store client. These carry no structured
/// code, only text.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
#[error("key-value store error: {0}")]
pub struct KvFailure(pub String);

impl KvFailure {
    pub fn new(message: impl Into<String>) -> Self {
        KvFailure(message.into())
    }
}

/// Canonical kind for a SQLite failure
pub fn sqlite_kind(err: &rusqlite::Error) -> ErrorKind {
    use rusqlite::Error as E;
    match err {
        E::QueryReturnedNoRows => ErrorKind::NotFound,
        E::SqliteFailure(failure, _) => match failure.code {
            ErrorCode::ConstraintViolation => match failure.extended_code {
                ffi::SQLITE_CONSTRAINT_UNIQUE | ffi::SQLITE_CONSTRAINT_PRIMARYKEY => ErrorKind::Duplicate,
                _ => ErrorKind::Constraint,
            },
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked | ErrorCode::OperationInterrupted => {
                ErrorKind::Timeout
            }
            ErrorCode::CannotOpen
            | ErrorCode::NotADatabase
            | ErrorCode::PermissionDenied
            | ErrorCode::AuthorizationForStatementDenied => ErrorKind::Connection,
            ErrorCode::TooBig | ErrorCode::ParameterOutOfRange | ErrorCode::TypeMismatch => {
                ErrorKind::Validation
            }
            _ => ErrorKind::Connection,
        },
        E::FromSqlConversionFailure(..)
        | E::IntegralValueOutOfRange(..)
        | E::InvalidColumnType(..)
        | E::Utf8Error(_)
        | E::ToSqlConversionFailure(_) => ErrorKind::Serialization,
        E::InvalidParameterName(_)
        | E::InvalidParameterCount(..)
        | E::InvalidColumnIndex(_)
        | E::InvalidColumnName(_)
        | E::NulError(_)
        | E::MultipleStatement
        | E::ExecuteReturnedResults
        | E::InvalidQuery => ErrorKind::InvalidArgument,
        _ => ErrorKind::Connection,
    }
}

pub fn normalize_sqlite(err: rusqlite::Error) -> Error {
    let kind = sqlite_kind(&err);
    Error::new(kind, err.to_string()).with_cause(err)
}

/// Canonical kind for a five-character SQLSTATE
pub fn sqlstate_kind(state: &str) -> ErrorKind {
    match state {
        "23505" => ErrorKind::Duplicate,
        "40001" | "40P01" => ErrorKind::Transaction,
        "57014" => ErrorKind::Timeout,
        "0A000" => ErrorKind::Unsupported,
        _ => match state.get(..2) {
            Some("23") => ErrorKind::Constraint,
            Some("25") => ErrorKind::Transaction,
            Some("08") | Some("28") => ErrorKind::Connection,
            Some("22") => ErrorKind::Validation,
            Some("42") => ErrorKind::InvalidArgument,
            _ => ErrorKind::Connection,
        },
    }
}

pub fn normalize_sqlstate(state: &str, message: &str) -> Error {
    Error::new(sqlstate_kind(state), format!("[{}] {}", state, message))
}

/// Canonical kind for a MySQL server error number
pub fn mysql_kind(number: u16) -> ErrorKind {
    match number {
        1062 => ErrorKind::Duplicate,
        1451 | 1452 | 1048 | 3819 => ErrorKind::Constraint,
        1205 | 3024 => ErrorKind::Timeout,
        1213 => ErrorKind::Transaction,
        1045 | 2002 | 2003 | 2006 | 2013 => ErrorKind::Connection,
        1235 => ErrorKind::Unsupported,
        _ => ErrorKind::Connection,
    }
}

pub fn normalize_mysql(number: u16, message: &str) -> Error {
    Error::new(mysql_kind(number), format!("MySQL error {}: {}", number, message))
}

/// Canonical kind for a document store failure
pub fn document_kind(failure: &DocumentFailure) -> ErrorKind {
    if failure.not_found {
        return ErrorKind::NotFound;
    }
    if failure.has_label("TransientTransactionError") {
        return ErrorKind::Transaction;
    }
    let by_code = failure.code.and_then(|code| match code {
        11000 | 11001 | 12582 => Some(ErrorKind::Duplicate),
        // DocumentValidationFailure, BadValue, FailedToParse, TypeMismatch
        121 | 2 | 9 | 14 => Some(ErrorKind::Validation),
        50 | 262 => Some(ErrorKind::Timeout),
        // 20 is IllegalOperation, e.g. transactions on a standalone server
        20 | 112 | 225 | 251 | 256 | 263 => Some(ErrorKind::Transaction),
        6 | 7 | 13 | 18 | 89 | 91 | 189 | 9001 => Some(ErrorKind::Connection),
        115 | 168 | 303 | 40324 => Some(ErrorKind::Unsupported),
        _ => None,
    });
    by_code
        .or_else(|| message_kind(&failure.message))
        .unwrap_or(ErrorKind::Connection)
}

pub fn normalize_document(failure: DocumentFailure) -> Error {
    let kind = document_kind(&failure);
    Error::new(kind, failure.message.clone()).with_cause(failure)
}

/// Canonical kind for a key-value store failure, by message only
pub fn kv_kind(failure: &KvFailure) -> ErrorKind {
    message_kind(&failure.0).unwrap_or(ErrorKind::Connection)
}

pub fn normalize_kv(failure: KvFailure) -> Error {
    let kind = kv_kind(&failure);
    Error::new(kind, failure.0.clone()).with_cause(failure)
}

/// Last-resort classification of an error message
fn message_kind(message: &str) -> Option<ErrorKind> {
    let lower = message.to_ascii_lowercase();
    let has = |needle: &str| lower.contains(needle);

    if has("not found") || lower == "nil" || has("redis: nil") {
        Some(ErrorKind::NotFound)
    } else if has("busykey") || has("already exists") || has("duplicate") {
        Some(ErrorKind::Duplicate)
    } else if has("timeout") || has("timed out") || has("deadline") {
        Some(ErrorKind::Timeout)
    } else if has("execabort")
        || has("multi calls can not be nested")
        || has("exec without multi")
        || has("discard without multi")
        || has("watch inside multi")
    {
        Some(ErrorKind::Transaction)
    } else if has("unknown command") || has("unsupported") || has("not supported") {
        Some(ErrorKind::Unsupported)
    } else if has("wrongtype") || has("decode") || has("serializ") {
        Some(ErrorKind::Serialization)
    } else if has("noauth") || has("wrongpass") || has("refused") || has("broken pipe") || has("connection") {
        Some(ErrorKind::Connection)
    } else {
        None
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        normalize_sqlite(err)
    }
}

impl From<DocumentFailure> for Error {
    fn from(failure: DocumentFailure) -> Self {
        normalize_document(failure)
    }
}

impl From<KvFailure> for Error {
    fn from(failure: KvFailure) -> Self {
        normalize_kv(failure)
    }
}
