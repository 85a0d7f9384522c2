use pstore_core::{EntitySchema, FieldKind, Item, Value};
use regex::Regex;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{Connection, Row, ToSql};
use std::sync::Arc;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Binds a `Value` as a SQLite parameter. Booleans become 0/1 and lists are
/// stored as JSON text.
pub(crate) struct SqlParam<'a>(pub &'a Value);

impl ToSql for SqlParam<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self.0 {
            Value::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Value::Int(n) => ToSqlOutput::Owned(SqlValue::Integer(*n)),
            Value::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::String(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            Value::Bytes(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
            Value::List(_) => ToSqlOutput::Owned(SqlValue::Text(self.0.to_json().to_string())),
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
        })
    }
}

/// Decode one row into an item keyed by logical field names. Without a
/// schema, columns keep their names and values their storage class.
pub(crate) fn decode_row(
    row: &Row<'_>,
    columns: &[String],
    schema: Option<&EntitySchema>,
) -> rusqlite::Result<Item> {
    let mut item = Item::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let (name, kind) = match schema {
            Some(schema) => {
                let name = schema.field_for_column(column);
                (name.to_string(), schema.kind_of(name))
            }
            None => (column.clone(), None),
        };
        item.insert(name, decode_value(row.get_ref(i)?, kind)?);
    }
    Ok(item)
}

fn decode_value(raw: ValueRef<'_>, kind: Option<FieldKind>) -> rusqlite::Result<Value> {
    Ok(match raw {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(n) => match kind {
            Some(FieldKind::Bool) => Value::Bool(n != 0),
            Some(FieldKind::Float) => Value::Float(n as f64),
            _ => Value::Int(n),
        },
        ValueRef::Real(f) => Value::Float(f),
        ValueRef::Text(bytes) => {
            let text = std::str::from_utf8(bytes).map_err(rusqlite::Error::Utf8Error)?;
            match kind {
                Some(FieldKind::Json) => match serde_json::from_str::<serde_json::Value>(text) {
                    Ok(json) => Value::from_json(&json),
                    Err(_) => Value::String(text.to_string()),
                },
                _ => Value::String(text.to_string()),
            }
        }
        ValueRef::Blob(bytes) => Value::Bytes(bytes::Bytes::copy_from_slice(bytes)),
    })
}

/// Per-connection setup: a `regexp` function for `REGEXP`, case-sensitive
/// LIKE, and enforced foreign keys.
pub(crate) fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA case_sensitive_like = ON; PRAGMA foreign_keys = ON;")?;

    // `X REGEXP Y` calls regexp(Y, X)
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        |ctx| {
            let re: Arc<Regex> = ctx.get_or_create_aux(0, |pattern| -> Result<Regex, BoxError> {
                Ok(Regex::new(pattern.as_str()?)?)
            })?;
            let matched = match ctx.get_raw(1) {
                ValueRef::Null => None,
                ValueRef::Integer(n) => Some(re.is_match(&n.to_string())),
                ValueRef::Real(f) => Some(re.is_match(&f.to_string())),
                ValueRef::Text(t) | ValueRef::Blob(t) => Some(re.is_match(&String::from_utf8_lossy(t))),
            };
            Ok(matched)
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_regexp_function() {
        let conn = Connection::open_in_memory().unwrap();
        configure_connection(&conn).unwrap();
        let hit: bool = conn
            .query_row("SELECT 'alice@example.com' REGEXP '^a.*\\.com$'", [], |r| r.get(0))
            .unwrap();
        assert!(hit);
        let null: Option<bool> = conn.query_row("SELECT NULL REGEXP 'a'", [], |r| r.get(0)).unwrap();
        assert_eq!(null, None);
    }

    #[test]
    fn test_like_is_case_sensitive() {
        let conn = Connection::open_in_memory().unwrap();
        configure_connection(&conn).unwrap();
        let hit: bool = conn.query_row("SELECT 'Alice' LIKE 'a%'", [], |r| r.get(0)).unwrap();
        assert!(!hit);
    }

    #[test]
    fn test_param_binding() {
        let conn = Connection::open_in_memory().unwrap();
        let flag = Value::Bool(true);
        let list = Value::list(["a", "b"]);
        let (n, text): (i64, String) = conn
            .query_row("SELECT ?1, ?2", [SqlParam(&flag), SqlParam(&list)], |r| {
                Ok((r.get(0)?, r.get(1)?))
            })
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(text, r#"["a","b"]"#);
    }
}
