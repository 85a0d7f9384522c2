/// Relational backend over SQLite
///
/// Conditions compile through [`SqlCompiler`](pstore_core::SqlCompiler) with
/// the SQLite dialect and run on a shared `rusqlite` connection. Every native
/// failure goes through the SQLite normalizer.
mod convert;
mod ops;

use crate::repository::{
    effective_context, BatchOutcome, RelationalCapable, Repository, TxFn,
};
use ops::SqlOps;
use parking_lot::{Mutex, MutexGuard};
use pstore_core::normalize::normalize_sqlite;
use pstore_core::transaction::run_in_scope;
use pstore_core::{
    Context, Dialect, EntitySchema, Error, Item, Query, RepositoryConfig, Result, TxScope, TxStateMachine,
    Value,
};
use rusqlite::Connection;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info};

/// Connection shared by every repository on one database
pub type SharedConnection = Arc<Mutex<Connection>>;

/// Wrap a caller-opened connection for sharing between repositories
pub fn share_connection(conn: Connection) -> SharedConnection {
    Arc::new(Mutex::new(conn))
}

pub struct RelationalRepository<E> {
    conn: SharedConnection,
    schema: Arc<EntitySchema>,
    config: RepositoryConfig,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for RelationalRepository<E> {
    fn clone(&self) -> Self {
        Self {
            conn: Arc::clone(&self.conn),
            schema: Arc::clone(&self.schema),
            config: self.config.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E> RelationalRepository<E> {
    pub fn new(conn: SharedConnection, schema: EntitySchema, config: RepositoryConfig) -> Result<Self> {
        config.validate()?;
        schema.validate()?;
        if config.dialect != Dialect::Sqlite {
            return Err(Error::unsupported(format!(
                "no {:?} driver is bundled; only SQLite connections are supported",
                config.dialect
            )));
        }
        convert::configure_connection(&conn.lock()).map_err(normalize_sqlite)?;
        info!(table = %schema.name, "relational repository ready");
        Ok(Self {
            conn,
            schema: Arc::new(schema),
            config,
            _entity: PhantomData,
        })
    }

    /// Private in-memory database with the schema's table created
    pub fn open_in_memory(schema: EntitySchema, config: RepositoryConfig) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(normalize_sqlite)?;
        conn.execute_batch(&schema.create_table_sql())
            .map_err(normalize_sqlite)?;
        Self::new(share_connection(conn), schema, config)
    }

    pub fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    pub fn connection(&self) -> &SharedConnection {
        &self.conn
    }

    fn context(&self, ctx: &Context) -> Context {
        effective_context(ctx, self.config.default_timeout)
    }

    /// Lock the connection, giving up at the context's deadline
    fn acquire(&self, ctx: &Context) -> Result<MutexGuard<'_, Connection>> {
        ctx.check()?;
        match ctx.remaining() {
            Some(remaining) => self
                .conn
                .try_lock_for(remaining)
                .ok_or_else(|| Error::timeout("timed out waiting for the connection")),
            None => Ok(self.conn.lock()),
        }
    }

    fn with_ops<T>(&self, ctx: &Context, f: impl FnOnce(&SqlOps<'_>, &Context) -> Result<T>) -> Result<T> {
        let ctx = self.context(ctx);
        let conn = self.acquire(&ctx)?;
        let ops = SqlOps {
            conn: &conn,
            schema: &self.schema,
        };
        f(&ops, &ctx)
    }
}

impl<E> Repository<E> for RelationalRepository<E>
where
    E: Serialize + DeserializeOwned,
{
    fn create(&self, ctx: &Context, entity: &mut E) -> Result<()> {
        self.with_ops(ctx, |ops, ctx| ops.create(ctx, entity))
    }

    fn create_batch(&self, ctx: &Context, entities: &mut [E]) -> Result<BatchOutcome> {
        self.with_ops(ctx, |ops, ctx| ops.create_batch(ctx, entities))
    }

    fn find_by_id(&self, ctx: &Context, id: &Value) -> Result<E> {
        self.with_ops(ctx, |ops, ctx| ops.find_by_id(ctx, id))
    }

    fn find_all(&self, ctx: &Context, query: &Query) -> Result<Vec<E>> {
        self.with_ops(ctx, |ops, ctx| ops.find_all(ctx, query))
    }

    fn update(&self, ctx: &Context, entity: &E) -> Result<()> {
        self.with_ops(ctx, |ops, ctx| ops.update(ctx, entity))
    }

    fn update_partial(&self, ctx: &Context, id: &Value, fields: &Item) -> Result<()> {
        self.with_ops(ctx, |ops, ctx| ops.update_partial(ctx, id, fields))
    }

    fn delete(&self, ctx: &Context, id: &Value) -> Result<()> {
        self.with_ops(ctx, |ops, ctx| ops.delete(ctx, id))
    }

    fn delete_by_condition(&self, ctx: &Context, query: &Query) -> Result<u64> {
        self.with_ops(ctx, |ops, ctx| ops.delete_by_condition(ctx, query))
    }

    fn query(&self, ctx: &Context, query: &Query) -> Result<Vec<Item>> {
        self.with_ops(ctx, |ops, ctx| ops.query(ctx, query))
    }

    fn query_one(&self, ctx: &Context, query: &Query) -> Result<Item> {
        self.with_ops(ctx, |ops, ctx| ops.query_one(ctx, query))
    }

    fn count(&self, ctx: &Context, query: &Query) -> Result<u64> {
        self.with_ops(ctx, |ops, ctx| ops.count(ctx, query))
    }

    fn exists(&self, ctx: &Context, query: &Query) -> Result<bool> {
        self.with_ops(ctx, |ops, ctx| ops.exists(ctx, query))
    }

    fn transaction(&self, ctx: &Context, f: &mut TxFn<'_, E>) -> Result<()> {
        let ctx = self.context(ctx);
        let conn = self.acquire(&ctx)?;
        let tx = conn.unchecked_transaction().map_err(normalize_sqlite)?;
        debug!(table = %self.schema.name, "transaction started");

        let machine = TxStateMachine::new();
        run_in_scope(&machine, SqliteScope(tx), |scope| {
            let handle = RelationalTx {
                ops: SqlOps {
                    conn: &scope.0,
                    schema: &self.schema,
                },
                machine: &machine,
                default_timeout: self.config.default_timeout,
                _entity: PhantomData,
            };
            f(&handle)
        })
    }

    fn as_relational(&self) -> Option<&dyn RelationalCapable> {
        Some(self)
    }
}

impl<E> RelationalCapable for RelationalRepository<E> {
    fn execute_raw(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<u64> {
        self.with_ops(ctx, |ops, ctx| Ok(ops.execute(ctx, sql, params)? as u64))
    }

    fn query_raw(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<Vec<Item>> {
        self.with_ops(ctx, |ops, ctx| ops.fetch(ctx, sql, params, None))
    }
}

struct SqliteScope<'c>(rusqlite::Transaction<'c>);

impl TxScope for SqliteScope<'_> {
    fn commit(self) -> Result<()> {
        self.0.commit().map_err(normalize_sqlite)
    }

    fn rollback(self) -> Result<()> {
        self.0.rollback().map_err(normalize_sqlite)
    }
}

/// Repository handle bound to one open transaction
struct RelationalTx<'t, E> {
    ops: SqlOps<'t>,
    machine: &'t TxStateMachine,
    default_timeout: Option<std::time::Duration>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> RelationalTx<'_, E> {
    fn with_ops<T>(&self, ctx: &Context, f: impl FnOnce(&SqlOps<'_>, &Context) -> Result<T>) -> Result<T> {
        self.machine.ensure_active()?;
        f(&self.ops, &effective_context(ctx, self.default_timeout))
    }
}

impl<E> Repository<E> for RelationalTx<'_, E>
where
    E: Serialize + DeserializeOwned,
{
    fn create(&self, ctx: &Context, entity: &mut E) -> Result<()> {
        self.with_ops(ctx, |ops, ctx| ops.create(ctx, entity))
    }

    fn create_batch(&self, ctx: &Context, entities: &mut [E]) -> Result<BatchOutcome> {
        self.with_ops(ctx, |ops, ctx| ops.create_batch(ctx, entities))
    }

    fn find_by_id(&self, ctx: &Context, id: &Value) -> Result<E> {
        self.with_ops(ctx, |ops, ctx| ops.find_by_id(ctx, id))
    }

    fn find_all(&self, ctx: &Context, query: &Query) -> Result<Vec<E>> {
        self.with_ops(ctx, |ops, ctx| ops.find_all(ctx, query))
    }

    fn update(&self, ctx: &Context, entity: &E) -> Result<()> {
        self.with_ops(ctx, |ops, ctx| ops.update(ctx, entity))
    }

    fn update_partial(&self, ctx: &Context, id: &Value, fields: &Item) -> Result<()> {
        self.with_ops(ctx, |ops, ctx| ops.update_partial(ctx, id, fields))
    }

    fn delete(&self, ctx: &Context, id: &Value) -> Result<()> {
        self.with_ops(ctx, |ops, ctx| ops.delete(ctx, id))
    }

    fn delete_by_condition(&self, ctx: &Context, query: &Query) -> Result<u64> {
        self.with_ops(ctx, |ops, ctx| ops.delete_by_condition(ctx, query))
    }

    fn query(&self, ctx: &Context, query: &Query) -> Result<Vec<Item>> {
        self.with_ops(ctx, |ops, ctx| ops.query(ctx, query))
    }

    fn query_one(&self, ctx: &Context, query: &Query) -> Result<Item> {
        self.with_ops(ctx, |ops, ctx| ops.query_one(ctx, query))
    }

    fn count(&self, ctx: &Context, query: &Query) -> Result<u64> {
        self.with_ops(ctx, |ops, ctx| ops.count(ctx, query))
    }

    fn exists(&self, ctx: &Context, query: &Query) -> Result<bool> {
        self.with_ops(ctx, |ops, ctx| ops.exists(ctx, query))
    }

    fn transaction(&self, _ctx: &Context, _f: &mut TxFn<'_, E>) -> Result<()> {
        Err(Error::unsupported("nested transactions are not supported"))
    }

    fn as_relational(&self) -> Option<&dyn RelationalCapable> {
        Some(self)
    }
}

impl<E> RelationalCapable for RelationalTx<'_, E> {
    fn execute_raw(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<u64> {
        self.with_ops(ctx, |ops, ctx| Ok(ops.execute(ctx, sql, params)? as u64))
    }

    fn query_raw(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<Vec<Item>> {
        self.with_ops(ctx, |ops, ctx| ops.fetch(ctx, sql, params, None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pstore_core::query::opts::*;
    use pstore_core::{CancelToken, Direction, ErrorKind, FieldDef, FieldKind, IdStrategy, ItemBuilder, Operator};
    use rusqlite::functions::FunctionFlags;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Task {
        id: Option<i64>,
        title: String,
        done: bool,
        tags: Vec<String>,
    }

    fn task(title: &str, done: bool) -> Task {
        Task {
            id: None,
            title: title.into(),
            done,
            tags: vec!["a".into()],
        }
    }

    fn repo() -> RelationalRepository<Task> {
        let schema = EntitySchema::new("tasks", "id")
            .id_strategy(IdStrategy::AutoIncrement)
            .field(FieldDef::new("id", FieldKind::Int))
            .field(FieldDef::new("title", FieldKind::Text).column("task_title").required().unique())
            .field(FieldDef::new("done", FieldKind::Bool))
            .field(FieldDef::new("tags", FieldKind::Json));
        RelationalRepository::open_in_memory(schema, RepositoryConfig::default()).unwrap()
    }

    #[test]
    fn test_create_assigns_rowid() {
        let repo = repo();
        let ctx = Context::background();
        let mut t = task("write", false);
        repo.create(&ctx, &mut t).unwrap();
        assert_eq!(t.id, Some(1));

        let loaded: Task = repo.find_by_id(&ctx, &Value::Int(1)).unwrap();
        assert_eq!(loaded, t);
    }

    #[test]
    fn test_duplicate_and_not_found() {
        let repo = repo();
        let ctx = Context::background();
        repo.create(&ctx, &mut task("same", false)).unwrap();
        let err = repo.create(&ctx, &mut task("same", true)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Duplicate);

        let err = repo.find_by_id(&ctx, &Value::Int(99)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        let err = repo.delete(&ctx, &Value::Int(99)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let repo = repo();
        let ctx = Context::background();
        let mut batch = vec![task("x", false), task("y", false), task("x", true)];
        let err = repo.create_batch(&ctx, &mut batch).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Duplicate);
        assert_eq!(repo.count(&ctx, &Query::new()).unwrap(), 0);
        assert!(batch.iter().all(|t| t.id.is_none()));

        let mut batch = vec![task("x", false), task("y", false)];
        let outcome = repo.create_batch(&ctx, &mut batch).unwrap();
        assert_eq!(outcome.inserted, 2);
        assert!(outcome.is_complete());
        assert_eq!(batch[1].id, Some(2));
    }

    /// Registers an AFTER INSERT trigger that cancels the token currently
    /// in the returned slot
    fn cancel_on_insert(repo: &RelationalRepository<Task>) -> Arc<std::sync::Mutex<CancelToken>> {
        let slot = Arc::new(std::sync::Mutex::new(CancelToken::new()));
        let trigger_slot = Arc::clone(&slot);
        let conn = repo.connection().lock();
        conn.create_scalar_function("cancel_now", 0, FunctionFlags::SQLITE_UTF8, move |_| {
            trigger_slot.lock().unwrap().cancel();
            Ok(1i64)
        })
        .unwrap();
        conn.execute_batch(
            "CREATE TRIGGER cancel_after_insert AFTER INSERT ON tasks BEGIN SELECT cancel_now(); END;",
        )
        .unwrap();
        slot
    }

    fn fresh_token(slot: &std::sync::Mutex<CancelToken>) -> CancelToken {
        let token = CancelToken::new();
        *slot.lock().unwrap() = token.clone();
        token
    }

    #[test]
    fn test_completed_insert_survives_cancellation() {
        let repo = repo();
        let slot = cancel_on_insert(&repo);

        let ctx = Context::background().with_cancel(fresh_token(&slot));
        let mut t = task("write", false);
        repo.create(&ctx, &mut t).unwrap();
        assert!(ctx.is_done());
        assert_eq!(t.id, Some(1));

        let err = repo.create(&ctx, &mut task("late", false)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(repo.count(&Context::background(), &Query::new()).unwrap(), 1);
    }

    #[test]
    fn test_batch_savepoint_closed_after_cancellation() {
        let repo = repo();
        let slot = cancel_on_insert(&repo);

        // Cancelled by the last insert: the batch still completes
        let ctx = Context::background().with_cancel(fresh_token(&slot));
        let mut one = vec![task("only", false)];
        let outcome = repo.create_batch(&ctx, &mut one).unwrap();
        assert_eq!(outcome.inserted, 1);
        assert_eq!(one[0].id, Some(1));
        assert!(repo.connection().lock().is_autocommit());

        // Cancelled mid-batch: nothing from this batch is kept
        let ctx = Context::background().with_cancel(fresh_token(&slot));
        let mut two = vec![task("a", false), task("b", false)];
        let err = repo.create_batch(&ctx, &mut two).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert!(repo.connection().lock().is_autocommit());
        assert_eq!(repo.count(&Context::background(), &Query::new()).unwrap(), 1);
    }

    #[test]
    fn test_partial_update_uses_columns() {
        let repo = repo();
        let ctx = Context::background();
        let mut t = task("old", false);
        repo.create(&ctx, &mut t).unwrap();

        let fields = ItemBuilder::new().set("title", "new").set("done", true).build();
        repo.update_partial(&ctx, &Value::Int(1), &fields).unwrap();

        let rows = repo
            .query(&ctx, &Query::new().filter(where_("done", Operator::Equal, true)))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["title"], Value::string("new"));
        assert_eq!(rows[0]["done"], Value::Bool(true));
        assert_eq!(rows[0]["tags"], Value::list(["a"]));
    }

    #[test]
    fn test_grouped_query() {
        let repo = repo();
        let ctx = Context::background();
        let mut batch = vec![task("a", true), task("b", false), task("c", true)];
        repo.create_batch(&ctx, &mut batch).unwrap();

        let rows = repo
            .query(
                &ctx,
                &Query::new().group_by(&["done"]).order_by("count", Direction::Desc),
            )
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["done"], Value::Bool(true));
        assert_eq!(rows[0]["count"], Value::Int(2));
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let repo = repo();
        let ctx = Context::background();
        let err = repo
            .transaction(&ctx, &mut |tx| {
                tx.create(&ctx, &mut task("inside", false))?;
                assert_eq!(tx.count(&ctx, &Query::new())?, 1);
                Err(Error::validation("abort"))
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(repo.count(&ctx, &Query::new()).unwrap(), 0);

        repo.transaction(&ctx, &mut |tx| tx.create(&ctx, &mut task("kept", false)))
            .unwrap();
        assert_eq!(repo.count(&ctx, &Query::new()).unwrap(), 1);
    }

    #[test]
    fn test_nested_transaction_unsupported() {
        let repo = repo();
        let ctx = Context::background();
        let err = repo
            .transaction(&ctx, &mut |tx| tx.transaction(&ctx, &mut |_| Ok(())))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_lock_mode_unsupported_on_sqlite() {
        let repo = repo();
        let ctx = Context::background();
        let err = repo
            .query(&ctx, &Query::new().lock(pstore_core::LockMode::ForUpdate))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_rejects_other_dialects() {
        let schema = EntitySchema::new("t", "id").field(FieldDef::new("id", FieldKind::Int));
        let conn = share_connection(Connection::open_in_memory().unwrap());
        let config = RepositoryConfig::default().with_dialect(Dialect::Postgres);
        let err = RelationalRepository::<Task>::new(conn, schema, config).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }

    #[test]
    fn test_raw_access() {
        let repo = repo();
        let ctx = Context::background();
        let raw = repo.as_relational().unwrap();
        raw.execute_raw(
            &ctx,
            "INSERT INTO tasks (task_title, done, tags) VALUES (?, ?, ?)",
            &[Value::string("raw"), Value::Bool(false), Value::list(Vec::<String>::new())],
        )
        .unwrap();
        let rows = raw.query_raw(&ctx, "SELECT task_title FROM tasks", &[]).unwrap();
        assert_eq!(rows[0]["task_title"], Value::string("raw"));
    }
}
