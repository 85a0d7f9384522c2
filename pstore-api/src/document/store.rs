use pstore_core::{DocumentFailure, FindOptions};
use serde_json::Value as Json;

pub type StoreResult<T> = std::result::Result<T, DocumentFailure>;

/// Client session handle; transactions are scoped to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

/// Document store client.
///
/// Filters, options and pipelines are MongoDB-shaped JSON. Every call takes
/// the session it runs in; `None` runs outside any transaction.
pub trait DocumentStore: Send + Sync {
    fn insert_one(&self, session: Option<SessionId>, collection: &str, doc: Json) -> StoreResult<()>;

    fn find(
        &self,
        session: Option<SessionId>,
        collection: &str,
        filter: &Json,
        options: &FindOptions,
    ) -> StoreResult<Vec<Json>>;

    fn count(&self, session: Option<SessionId>, collection: &str, filter: &Json) -> StoreResult<u64>;

    /// `$set` the given fields on the first match; returns the match count
    fn update_one(
        &self,
        session: Option<SessionId>,
        collection: &str,
        filter: &Json,
        set: &Json,
    ) -> StoreResult<u64>;

    /// Replace the first match, keeping its `_id`; returns the match count
    fn replace_one(
        &self,
        session: Option<SessionId>,
        collection: &str,
        filter: &Json,
        doc: Json,
    ) -> StoreResult<u64>;

    fn delete_many(&self, session: Option<SessionId>, collection: &str, filter: &Json) -> StoreResult<u64>;

    fn aggregate(
        &self,
        session: Option<SessionId>,
        collection: &str,
        pipeline: &[Json],
    ) -> StoreResult<Vec<Json>>;

    /// False for deployments without multi-document transactions
    fn supports_transactions(&self) -> bool;

    fn start_session(&self) -> StoreResult<SessionId>;

    fn start_transaction(&self, session: SessionId) -> StoreResult<()>;

    fn commit_transaction(&self, session: SessionId) -> StoreResult<()>;

    fn abort_transaction(&self, session: SessionId) -> StoreResult<()>;

    /// Ends the session, aborting any transaction still open on it
    fn end_session(&self, session: SessionId);
}
