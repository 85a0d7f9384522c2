use super::eval::{lookup, matches, project, run_pipeline, sort_docs};
use super::store::{DocumentStore, SessionId, StoreResult};
use parking_lot::{Mutex, RwLock};
use pstore_core::{DocumentFailure, FindOptions};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Clone, Default)]
struct Collection {
    docs: Vec<Json>,
    /// Fields with a unique index besides `_id`
    unique: Vec<String>,
}

type Collections = HashMap<String, Collection>;

#[derive(Default)]
struct Data {
    collections: Collections,
    /// Bumped by every committed write
    version: u64,
}

/// Working copy of an open transaction
struct Snapshot {
    base_version: u64,
    collections: Collections,
    dirty: bool,
}

/// In-memory document store with MongoDB-style filters and pipelines.
///
/// Transactions work on a private copy of the data and commit with an
/// optimistic check: if another writer committed first, the commit fails
/// with a transient write conflict.
pub struct MemoryDocumentStore {
    data: RwLock<Data>,
    sessions: Mutex<HashMap<SessionId, Option<Snapshot>>>,
    next_session: AtomicU64,
    transactions: bool,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocumentStore {
    /// A store that supports multi-document transactions
    pub fn new() -> Self {
        Self {
            data: RwLock::new(Data::default()),
            sessions: Mutex::new(HashMap::new()),
            next_session: AtomicU64::new(1),
            transactions: true,
        }
    }

    /// A store that rejects transactions, like a standalone server
    pub fn standalone() -> Self {
        Self {
            transactions: false,
            ..Self::new()
        }
    }

    /// Reject inserts and updates that repeat a non-null value of `field`
    pub fn create_unique_index(&self, collection: &str, field: &str) {
        let mut data = self.data.write();
        let coll = data.collections.entry(collection.to_string()).or_default();
        if !coll.unique.iter().any(|f| f == field) {
            coll.unique.push(field.to_string());
        }
    }

    fn no_session(session: SessionId) -> DocumentFailure {
        DocumentFailure::new(251, format!("session {} has ended", session.0))
    }

    fn read<T>(&self, session: Option<SessionId>, f: impl FnOnce(&Collections) -> StoreResult<T>) -> StoreResult<T> {
        if let Some(id) = session {
            let sessions = self.sessions.lock();
            match sessions.get(&id) {
                None => return Err(Self::no_session(id)),
                Some(Some(snapshot)) => return f(&snapshot.collections),
                Some(None) => {}
            }
        }
        f(&self.data.read().collections)
    }

    fn write<T>(
        &self,
        session: Option<SessionId>,
        f: impl FnOnce(&mut Collections) -> StoreResult<T>,
    ) -> StoreResult<T> {
        if let Some(id) = session {
            let mut sessions = self.sessions.lock();
            match sessions.get_mut(&id) {
                None => return Err(Self::no_session(id)),
                Some(Some(snapshot)) => {
                    snapshot.dirty = true;
                    return f(&mut snapshot.collections);
                }
                Some(None) => {}
            }
        }
        let mut data = self.data.write();
        let out = f(&mut data.collections)?;
        data.version += 1;
        Ok(out)
    }
}

fn duplicate(collection: &str, field: &str, value: &Json) -> DocumentFailure {
    DocumentFailure::new(
        11000,
        format!(
            "E11000 duplicate key error collection: {} index: {}_1 dup key: {{ {}: {} }}",
            collection, field, field, value
        ),
    )
}

/// Checks `_id` and unique indexes against every document except `skip`
fn check_unique(name: &str, coll: &Collection, doc: &Json, skip: Option<usize>) -> StoreResult<()> {
    for field in std::iter::once("_id").chain(coll.unique.iter().map(String::as_str)) {
        let value = match lookup(doc, field) {
            Some(v) if !v.is_null() => v,
            _ => continue,
        };
        let clash = coll
            .docs
            .iter()
            .enumerate()
            .any(|(i, other)| Some(i) != skip && lookup(other, field) == Some(value));
        if clash {
            return Err(duplicate(name, field, value));
        }
    }
    Ok(())
}

fn matching_positions(docs: &[Json], filter: &Json) -> StoreResult<Vec<usize>> {
    let mut positions = Vec::new();
    for (i, doc) in docs.iter().enumerate() {
        if matches(doc, filter)? {
            positions.push(i);
        }
    }
    Ok(positions)
}

fn first_match(docs: &[Json], filter: &Json) -> StoreResult<Option<usize>> {
    for (i, doc) in docs.iter().enumerate() {
        if matches(doc, filter)? {
            return Ok(Some(i));
        }
    }
    Ok(None)
}

impl DocumentStore for MemoryDocumentStore {
    fn insert_one(&self, session: Option<SessionId>, collection: &str, doc: Json) -> StoreResult<()> {
        if !doc.is_object() || lookup(&doc, "_id").map_or(true, Json::is_null) {
            return Err(DocumentFailure::new(2, "document must be an object with an _id"));
        }
        self.write(session, |cols| {
            let coll = cols.entry(collection.to_string()).or_default();
            check_unique(collection, coll, &doc, None)?;
            coll.docs.push(doc);
            Ok(())
        })
    }

    fn find(
        &self,
        session: Option<SessionId>,
        collection: &str,
        filter: &Json,
        options: &FindOptions,
    ) -> StoreResult<Vec<Json>> {
        let mut docs = self.read(session, |cols| {
            let mut found = Vec::new();
            if let Some(coll) = cols.get(collection) {
                for doc in &coll.docs {
                    if matches(doc, filter)? {
                        found.push(doc.clone());
                    }
                }
            }
            Ok(found)
        })?;

        sort_docs(&mut docs, &options.sort);
        let skip = options.skip.unwrap_or(0) as usize;
        let limit = options.limit.map_or(usize::MAX, |n| n as usize);
        let page = docs.into_iter().skip(skip).take(limit);
        match &options.projection {
            Some(spec) => page.map(|doc| project(&doc, spec)).collect(),
            None => Ok(page.collect()),
        }
    }

    fn count(&self, session: Option<SessionId>, collection: &str, filter: &Json) -> StoreResult<u64> {
        self.read(session, |cols| match cols.get(collection) {
            Some(coll) => Ok(matching_positions(&coll.docs, filter)?.len() as u64),
            None => Ok(0),
        })
    }

    fn update_one(
        &self,
        session: Option<SessionId>,
        collection: &str,
        filter: &Json,
        set: &Json,
    ) -> StoreResult<u64> {
        let fields = set
            .as_object()
            .ok_or_else(|| DocumentFailure::new(2, "$set needs an object"))?;
        if fields.contains_key("_id") {
            return Err(DocumentFailure::new(2, "the _id field is immutable"));
        }
        self.write(session, |cols| {
            let coll = match cols.get_mut(collection) {
                Some(coll) => coll,
                None => return Ok(0),
            };
            let i = match first_match(&coll.docs, filter)? {
                Some(i) => i,
                None => return Ok(0),
            };
            let mut updated = coll.docs[i].clone();
            if let Json::Object(map) = &mut updated {
                for (k, v) in fields {
                    map.insert(k.clone(), v.clone());
                }
            }
            check_unique(collection, coll, &updated, Some(i))?;
            coll.docs[i] = updated;
            Ok(1)
        })
    }

    fn replace_one(
        &self,
        session: Option<SessionId>,
        collection: &str,
        filter: &Json,
        mut doc: Json,
    ) -> StoreResult<u64> {
        if !doc.is_object() {
            return Err(DocumentFailure::new(2, "replacement must be an object"));
        }
        self.write(session, |cols| {
            let coll = match cols.get_mut(collection) {
                Some(coll) => coll,
                None => return Ok(0),
            };
            let i = match first_match(&coll.docs, filter)? {
                Some(i) => i,
                None => return Ok(0),
            };
            let id = coll.docs[i].get("_id").cloned().unwrap_or(Json::Null);
            if let Json::Object(map) = &mut doc {
                map.insert("_id".into(), id);
            }
            check_unique(collection, coll, &doc, Some(i))?;
            coll.docs[i] = doc;
            Ok(1)
        })
    }

    fn delete_many(&self, session: Option<SessionId>, collection: &str, filter: &Json) -> StoreResult<u64> {
        self.write(session, |cols| {
            let coll = match cols.get_mut(collection) {
                Some(coll) => coll,
                None => return Ok(0),
            };
            let doomed = matching_positions(&coll.docs, filter)?;
            let mut position = 0;
            coll.docs.retain(|_| {
                let keep = doomed.binary_search(&position).is_err();
                position += 1;
                keep
            });
            Ok(doomed.len() as u64)
        })
    }

    fn aggregate(
        &self,
        session: Option<SessionId>,
        collection: &str,
        pipeline: &[Json],
    ) -> StoreResult<Vec<Json>> {
        let docs = self.read(session, |cols| {
            Ok(cols.get(collection).map(|c| c.docs.clone()).unwrap_or_default())
        })?;
        run_pipeline(docs, pipeline)
    }

    fn supports_transactions(&self) -> bool {
        self.transactions
    }

    fn start_session(&self) -> StoreResult<SessionId> {
        let id = SessionId(self.next_session.fetch_add(1, Ordering::SeqCst));
        self.sessions.lock().insert(id, None);
        Ok(id)
    }

    fn start_transaction(&self, session: SessionId) -> StoreResult<()> {
        if !self.transactions {
            return Err(DocumentFailure::new(
                20,
                "Transaction numbers are only allowed on a replica set member or mongos",
            ));
        }
        let mut sessions = self.sessions.lock();
        let slot = sessions.get_mut(&session).ok_or_else(|| Self::no_session(session))?;
        if slot.is_some() {
            return Err(DocumentFailure::new(251, "a transaction is already in progress"));
        }
        let data = self.data.read();
        *slot = Some(Snapshot {
            base_version: data.version,
            collections: data.collections.clone(),
            dirty: false,
        });
        debug!(session = session.0, "document transaction started");
        Ok(())
    }

    fn commit_transaction(&self, session: SessionId) -> StoreResult<()> {
        let mut sessions = self.sessions.lock();
        let slot = sessions.get_mut(&session).ok_or_else(|| Self::no_session(session))?;
        let snapshot = slot
            .take()
            .ok_or_else(|| DocumentFailure::new(251, "no transaction in progress"))?;
        if !snapshot.dirty {
            return Ok(());
        }
        let mut data = self.data.write();
        if data.version != snapshot.base_version {
            return Err(DocumentFailure::new(112, "WriteConflict").with_label("TransientTransactionError"));
        }
        data.collections = snapshot.collections;
        data.version += 1;
        Ok(())
    }

    fn abort_transaction(&self, session: SessionId) -> StoreResult<()> {
        let mut sessions = self.sessions.lock();
        let slot = sessions.get_mut(&session).ok_or_else(|| Self::no_session(session))?;
        match slot.take() {
            Some(_) => Ok(()),
            None => Err(DocumentFailure::new(251, "no transaction in progress")),
        }
    }

    fn end_session(&self, session: SessionId) {
        self.sessions.lock().remove(&session);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn seeded() -> MemoryDocumentStore {
        let store = MemoryDocumentStore::new();
        store.create_unique_index("people", "email");
        for (id, email) in [("1", "a@x"), ("2", "b@x")] {
            store
                .insert_one(None, "people", json!({ "_id": id, "email": email }))
                .unwrap();
        }
        store
    }

    #[test]
    fn test_unique_indexes() {
        let store = seeded();
        let err = store
            .insert_one(None, "people", json!({ "_id": "1", "email": "c@x" }))
            .unwrap_err();
        assert_eq!(err.code, Some(11000));
        let err = store
            .insert_one(None, "people", json!({ "_id": "3", "email": "a@x" }))
            .unwrap_err();
        assert_eq!(err.code, Some(11000));
        let err = store
            .update_one(None, "people", &json!({ "_id": "2" }), &json!({ "email": "a@x" }))
            .unwrap_err();
        assert_eq!(err.code, Some(11000));
    }

    #[test]
    fn test_find_options() {
        let store = seeded();
        let options = FindOptions {
            sort: vec![("email".into(), -1)],
            skip: Some(0),
            limit: Some(1),
            projection: Some(json!({ "email": 1, "_id": 0 })),
        };
        let docs = store.find(None, "people", &json!({}), &options).unwrap();
        assert_eq!(docs, vec![json!({ "email": "b@x" })]);
    }

    #[test]
    fn test_transaction_isolation_and_commit() {
        let store = seeded();
        let s = store.start_session().unwrap();
        store.start_transaction(s).unwrap();
        store
            .insert_one(Some(s), "people", json!({ "_id": "3", "email": "c@x" }))
            .unwrap();
        assert_eq!(store.count(Some(s), "people", &json!({})).unwrap(), 3);
        assert_eq!(store.count(None, "people", &json!({})).unwrap(), 2);

        store.commit_transaction(s).unwrap();
        store.end_session(s);
        assert_eq!(store.count(None, "people", &json!({})).unwrap(), 3);
    }

    #[test]
    fn test_write_conflict_is_transient() {
        let store = seeded();
        let s = store.start_session().unwrap();
        store.start_transaction(s).unwrap();
        store.delete_many(Some(s), "people", &json!({ "_id": "1" })).unwrap();
        store.delete_many(None, "people", &json!({ "_id": "2" })).unwrap();

        let err = store.commit_transaction(s).unwrap_err();
        assert_eq!(err.code, Some(112));
        assert!(err.has_label("TransientTransactionError"));
        assert_eq!(store.count(None, "people", &json!({})).unwrap(), 1);
    }

    #[test]
    fn test_standalone_rejects_transactions() {
        let store = MemoryDocumentStore::standalone();
        assert!(!store.supports_transactions());
        let s = store.start_session().unwrap();
        assert_eq!(store.start_transaction(s).unwrap_err().code, Some(20));
    }
}
