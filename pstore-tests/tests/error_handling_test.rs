use pstore_core::normalize::{
    document_kind, kv_kind, mysql_kind, normalize_document, normalize_kv, sqlite_kind, sqlstate_kind,
};
use pstore_core::retry::{retry_with_policy, RetryPolicy};
use pstore_core::{CancelToken, Context, DocumentFailure, Error, ErrorKind, KvFailure, Query};
use pstore_test_utils::*;
use rusqlite::{ffi, ErrorCode};
use std::cell::Cell;
use std::collections::HashSet;
use std::time::Duration;

fn sqlite(code: ErrorCode, extended: i32) -> rusqlite::Error {
    rusqlite::Error::SqliteFailure(ffi::Error { code, extended_code: extended }, None)
}

fn sqlite_table() -> Vec<(rusqlite::Error, ErrorKind)> {
    vec![
        (sqlite(ErrorCode::ConstraintViolation, ffi::SQLITE_CONSTRAINT_UNIQUE), ErrorKind::Duplicate),
        (sqlite(ErrorCode::ConstraintViolation, ffi::SQLITE_CONSTRAINT_PRIMARYKEY), ErrorKind::Duplicate),
        (sqlite(ErrorCode::ConstraintViolation, ffi::SQLITE_CONSTRAINT_FOREIGNKEY), ErrorKind::Constraint),
        (sqlite(ErrorCode::ConstraintViolation, ffi::SQLITE_CONSTRAINT_NOTNULL), ErrorKind::Constraint),
        (sqlite(ErrorCode::DatabaseBusy, ffi::SQLITE_BUSY), ErrorKind::Timeout),
        (sqlite(ErrorCode::DatabaseLocked, ffi::SQLITE_LOCKED), ErrorKind::Timeout),
        (sqlite(ErrorCode::CannotOpen, ffi::SQLITE_CANTOPEN), ErrorKind::Connection),
        (sqlite(ErrorCode::TooBig, ffi::SQLITE_TOOBIG), ErrorKind::Validation),
        (rusqlite::Error::QueryReturnedNoRows, ErrorKind::NotFound),
        (
            rusqlite::Error::InvalidColumnType(0, "age".into(), rusqlite::types::Type::Text),
            ErrorKind::Serialization,
        ),
        (rusqlite::Error::InvalidParameterCount(1, 2), ErrorKind::InvalidArgument),
    ]
}

fn document_table() -> Vec<(DocumentFailure, ErrorKind)> {
    vec![
        (DocumentFailure::new(11000, "E11000 duplicate key error"), ErrorKind::Duplicate),
        (DocumentFailure::new(121, "Document failed validation"), ErrorKind::Validation),
        (DocumentFailure::new(2, "bad value"), ErrorKind::Validation),
        (DocumentFailure::new(50, "operation exceeded time limit"), ErrorKind::Timeout),
        (DocumentFailure::new(112, "WriteConflict"), ErrorKind::Transaction),
        (DocumentFailure::new(251, "NoSuchTransaction"), ErrorKind::Transaction),
        (DocumentFailure::new(6, "HostUnreachable"), ErrorKind::Connection),
        (DocumentFailure::new(40324, "Unrecognized pipeline stage"), ErrorKind::Unsupported),
        (
            DocumentFailure::message("commit failed").with_label("TransientTransactionError"),
            ErrorKind::Transaction,
        ),
        (DocumentFailure::not_found("no documents in result"), ErrorKind::NotFound),
        (DocumentFailure::message("connection refused"), ErrorKind::Connection),
        (DocumentFailure::new(99_999, "something new"), ErrorKind::Connection),
    ]
}

fn kv_table() -> Vec<(KvFailure, ErrorKind)> {
    vec![
        (KvFailure::new("redis: nil"), ErrorKind::NotFound),
        (KvFailure::new("BUSYKEY Target key name already exists."), ErrorKind::Duplicate),
        (KvFailure::new("read tcp: i/o timeout"), ErrorKind::Timeout),
        (KvFailure::new("EXECABORT Transaction discarded because of previous errors."), ErrorKind::Transaction),
        (KvFailure::new("ERR unknown command 'FOO'"), ErrorKind::Unsupported),
        (
            KvFailure::new("WRONGTYPE Operation against a key holding the wrong kind of value"),
            ErrorKind::Serialization,
        ),
        (KvFailure::new("NOAUTH Authentication required."), ErrorKind::Connection),
        (KvFailure::new("something odd happened"), ErrorKind::Connection),
    ]
}

#[test]
fn test_every_documented_signal_maps_to_its_kind() {
    let mut reached = HashSet::new();

    for (err, kind) in sqlite_table() {
        assert_eq!(sqlite_kind(&err), kind, "{:?}", err);
        reached.insert(kind);
    }
    for (failure, kind) in document_table() {
        assert_eq!(document_kind(&failure), kind, "{:?}", failure);
        reached.insert(kind);
    }
    for (failure, kind) in kv_table() {
        assert_eq!(kv_kind(&failure), kind, "{:?}", failure);
        reached.insert(kind);
    }

    for (state, kind) in [
        ("23505", ErrorKind::Duplicate),
        ("23503", ErrorKind::Constraint),
        ("40001", ErrorKind::Transaction),
        ("57014", ErrorKind::Timeout),
        ("08006", ErrorKind::Connection),
        ("22001", ErrorKind::Validation),
        ("42601", ErrorKind::InvalidArgument),
        ("0A000", ErrorKind::Unsupported),
    ] {
        assert_eq!(sqlstate_kind(state), kind, "{}", state);
    }
    for (number, kind) in [
        (1062, ErrorKind::Duplicate),
        (1452, ErrorKind::Constraint),
        (1205, ErrorKind::Timeout),
        (1213, ErrorKind::Transaction),
        (2006, ErrorKind::Connection),
        (1235, ErrorKind::Unsupported),
    ] {
        assert_eq!(mysql_kind(number), kind, "{}", number);
    }

    for kind in ErrorKind::ALL {
        assert!(reached.contains(&kind), "{:?} is unreachable", kind);
    }
}

#[test]
fn test_normalized_errors_keep_the_native_cause() {
    let err = normalize_document(DocumentFailure::new(11000, "E11000 duplicate key error"));
    assert_eq!(err.kind(), ErrorKind::Duplicate);
    assert!(err.cause_text().unwrap().contains("11000"));

    let err = normalize_kv(KvFailure::new("NOAUTH Authentication required."));
    assert_eq!(err.kind(), ErrorKind::Connection);
    assert!(err.cause_text().unwrap().contains("NOAUTH"));
}

#[test]
fn test_error_codes_are_stable() {
    assert_eq!(Error::not_found("x").code(), "NOT_FOUND");
    assert_eq!(Error::duplicate("x").code(), "DUPLICATE");
    assert_eq!(Error::timeout("x").code(), "TIMEOUT");
    assert_eq!(Error::invalid_argument("x").code(), "INVALID_ARGUMENT");
    assert!(Error::connection("x").is_retryable());
    assert!(!Error::validation("x").is_retryable());
}

#[test]
fn test_retry_recovers_from_transient_failures() {
    let ctx = Context::background();
    let attempts = Cell::new(0);
    let value = retry_with_policy(&ctx, &RetryPolicy::fast(), || {
        attempts.set(attempts.get() + 1);
        if attempts.get() < 3 {
            Err(Error::connection("reset by peer"))
        } else {
            Ok(42)
        }
    })
    .unwrap();
    assert_eq!(value, 42);
    assert_eq!(attempts.get(), 3);
}

#[test]
fn test_retry_stops_on_permanent_failure() {
    let ctx = Context::background();
    let attempts = Cell::new(0);
    let err = retry_with_policy(&ctx, &RetryPolicy::fast(), || -> pstore_core::Result<()> {
        attempts.set(attempts.get() + 1);
        Err(Error::duplicate("users/1"))
    })
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Duplicate);
    assert_eq!(attempts.get(), 1);
}

#[test]
fn test_retry_gives_up_after_policy() {
    let ctx = Context::background();
    let attempts = Cell::new(0);
    let policy = RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2), 2.0);
    let err = retry_with_policy(&ctx, &policy, || -> pstore_core::Result<()> {
        attempts.set(attempts.get() + 1);
        Err(Error::timeout("busy"))
    })
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(attempts.get(), 3);
}

#[test]
fn test_cancellation_is_a_timeout_everywhere() {
    init_tracing();
    for backend in Backend::ALL {
        let token = CancelToken::new();
        let ctx = Context::background().with_cancel(token.clone());
        let repo = seeded(backend, &ten_people()).unwrap();
        assert_eq!(repo.count(&ctx, &Query::new()).unwrap(), 10);
        token.cancel();
        let err = repo.find_all(&ctx, &Query::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout, "{}", backend);
        assert_eq!(err.message(), "operation cancelled", "{}", backend);
    }
}

#[test]
fn test_expired_deadline_is_a_timeout_everywhere() {
    let ctx = Context::with_timeout(Duration::from_millis(1));
    std::thread::sleep(Duration::from_millis(5));
    for backend in Backend::ALL {
        let repo = person_repository(backend).unwrap();
        let err = repo
            .create(&ctx, &mut Person::new("a", "amy", 20, "active"))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout, "{}", backend);
        assert_eq!(
            repo.count(&Context::background(), &Query::new()).unwrap(),
            0,
            "{}",
            backend
        );
    }
}

#[test]
fn test_malformed_conditions_fail_the_same_way() {
    use pstore_core::query::opts::where_;
    use pstore_core::Operator;

    let ctx = Context::background();
    let bad_between = Query::new().filter(where_("age", Operator::Between, 5));
    let bad_regex = Query::new().filter(where_("name", Operator::Regex, "("));
    for backend in Backend::ALL {
        let repo = person_repository(backend).unwrap();
        for query in [&bad_between, &bad_regex] {
            let err = repo.find_all(&ctx, query).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Validation, "{}", backend);
        }
    }
}
