/// The generic repository contract and its capability extensions
///
/// Every backend implements [`Repository`]. Backend-specific operations live
/// behind narrower traits that callers discover by probing:
///
/// ```ignore
/// if let Some(sql) = repo.as_relational() {
///     sql.execute_raw(&ctx, "VACUUM", &[])?;
/// }
/// ```
///
/// Operations spanning two repositories have no shared atomicity. Callers
/// that write to more than one backend own any compensation.

use pstore_core::{Context, Error, Item, Query, Result, Value};
use serde_json::Value as Json;
use std::time::Duration;

/// Callback run inside [`Repository::transaction`]
pub type TxFn<'a, E> = dyn FnMut(&dyn Repository<E>) -> Result<()> + 'a;

/// Result of a batch insert.
///
/// Relational batches are all-or-nothing and fail as a whole, so `failures`
/// is always empty there. Document and key-value batches insert what they
/// can and report the rest by input position.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub inserted: usize,
    pub failures: Vec<(usize, Error)>,
}

impl BatchOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

pub trait Repository<E> {
    /// Insert `entity`. A generated id is written back into it.
    fn create(&self, ctx: &Context, entity: &mut E) -> Result<()>;

    fn create_batch(&self, ctx: &Context, entities: &mut [E]) -> Result<BatchOutcome>;

    /// NotFound when no record has this id
    fn find_by_id(&self, ctx: &Context, id: &Value) -> Result<E>;

    fn find_all(&self, ctx: &Context, query: &Query) -> Result<Vec<E>>;

    /// Replace the stored record with `entity`, matched by its id
    fn update(&self, ctx: &Context, entity: &E) -> Result<()>;

    /// Set only the given logical fields
    fn update_partial(&self, ctx: &Context, id: &Value, fields: &Item) -> Result<()>;

    fn delete(&self, ctx: &Context, id: &Value) -> Result<()>;

    /// Delete every record matching the query's conditions; returns the count
    fn delete_by_condition(&self, ctx: &Context, query: &Query) -> Result<u64>;

    /// Raw records, honouring projection and grouping
    fn query(&self, ctx: &Context, query: &Query) -> Result<Vec<Item>>;

    /// First matching record or NotFound
    fn query_one(&self, ctx: &Context, query: &Query) -> Result<Item>;

    fn count(&self, ctx: &Context, query: &Query) -> Result<u64>;

    fn exists(&self, ctx: &Context, query: &Query) -> Result<bool>;

    /// Run `f` with a transaction-scoped handle. `Ok` commits; `Err` or a
    /// panic rolls back.
    fn transaction(&self, ctx: &Context, f: &mut TxFn<'_, E>) -> Result<()>;

    fn as_relational(&self) -> Option<&dyn RelationalCapable> {
        None
    }

    fn as_document(&self) -> Option<&dyn DocumentCapable> {
        None
    }

    fn as_key_value(&self) -> Option<&dyn KeyValueCapable<E>> {
        None
    }
}

/// Raw statements against a relational engine
pub trait RelationalCapable {
    /// Returns the number of affected rows
    fn execute_raw(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<u64>;

    fn query_raw(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<Vec<Item>>;
}

/// Native aggregation pipelines
pub trait DocumentCapable {
    fn aggregate(&self, ctx: &Context, pipeline: &[Json]) -> Result<Vec<Item>>;
}

/// Expiring records
pub trait KeyValueCapable<E> {
    fn create_with_ttl(&self, ctx: &Context, entity: &mut E, ttl: Duration) -> Result<()>;

    fn expire(&self, ctx: &Context, id: &Value, ttl: Duration) -> Result<()>;

    /// Remaining time to live; `None` when the record never expires
    fn ttl(&self, ctx: &Context, id: &Value) -> Result<Option<Duration>>;
}

/// Context with the repository's default timeout applied when the caller
/// set no deadline
pub(crate) fn effective_context(ctx: &Context, default_timeout: Option<Duration>) -> Context {
    match (ctx.deadline(), default_timeout) {
        (None, Some(timeout)) => ctx.clone().with_deadline(std::time::Instant::now() + timeout),
        _ => ctx.clone(),
    }
}

/// `query` limited to its first row
pub(crate) fn first_only(query: &Query) -> Query {
    query.clone().limit(1)
}

/// Rejects descriptor parts that make no sense for a delete
pub(crate) fn check_delete_query(query: &Query) -> Result<()> {
    if query.limit.is_some()
        || query.offset.is_some()
        || !query.joins.is_empty()
        || query.is_grouped()
        || !query.having.is_empty()
    {
        return Err(Error::invalid_argument(
            "delete by condition accepts conditions only",
        ));
    }
    Ok(())
}
