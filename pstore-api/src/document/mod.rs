/// Document backend
///
/// Queries compile through [`DocumentCompiler`] into filters, find options
/// or pipelines and run against any [`DocumentStore`]. The logical primary
/// key is stored as `_id`; other fields use their schema column names.
mod eval;
mod memory;
mod store;

pub use memory::MemoryDocumentStore;
pub use store::{DocumentStore, SessionId, StoreResult};

use crate::entity::EntityMapper;
use crate::repository::{
    check_delete_query, effective_context, first_only, BatchOutcome, DocumentCapable, Repository, TxFn,
};
use pstore_core::compile::document::ID_FIELD;
use pstore_core::normalize::normalize_document;
use pstore_core::transaction::run_in_scope;
use pstore_core::{
    item_from_json, Condition, Context, DocumentCommand, DocumentCompiler, EntitySchema, Error,
    FindOptions, IdStrategy, Item, Query, RepositoryConfig, Result, SubqueryPolicy, TxScope, TxStateMachine,
    Value,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Map, Value as Json};
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{debug, info};

pub struct DocumentRepository<E> {
    store: Arc<dyn DocumentStore>,
    schema: Arc<EntitySchema>,
    config: RepositoryConfig,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for DocumentRepository<E> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            schema: Arc::clone(&self.schema),
            config: self.config.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E> DocumentRepository<E> {
    pub fn new(store: Arc<dyn DocumentStore>, schema: EntitySchema, config: RepositoryConfig) -> Result<Self> {
        config.validate()?;
        schema.validate()?;
        if schema.id_strategy == IdStrategy::AutoIncrement {
            return Err(Error::unsupported(
                "auto-increment ids need the relational backend; use Uuid or Provided",
            ));
        }
        info!(collection = %schema.name, "document repository ready");
        Ok(Self {
            store,
            schema: Arc::new(schema),
            config,
            _entity: PhantomData,
        })
    }

    pub fn schema(&self) -> &EntitySchema {
        &self.schema
    }

    fn ops(&self, session: Option<SessionId>) -> DocOps<'_> {
        DocOps {
            store: self.store.as_ref(),
            schema: &self.schema,
            policy: self.config.subquery_policy,
            session,
        }
    }

    fn context(&self, ctx: &Context) -> Context {
        effective_context(ctx, self.config.default_timeout)
    }
}

/// Repository operations against one store, optionally inside a session
struct DocOps<'a> {
    store: &'a dyn DocumentStore,
    schema: &'a EntitySchema,
    policy: SubqueryPolicy,
    session: Option<SessionId>,
}

impl<'a> DocOps<'a> {
    fn compiler(&self) -> DocumentCompiler<'a> {
        DocumentCompiler::new()
            .with_policy(self.policy)
            .with_schema(self.schema)
    }

    fn mapper(&self) -> EntityMapper<'a> {
        EntityMapper::new(self.schema)
    }

    fn collection(&self) -> &str {
        &self.schema.name
    }

    /// One store call, made only while the context is live
    fn call<T>(&self, ctx: &Context, f: impl FnOnce() -> StoreResult<T>) -> Result<T> {
        ctx.check()?;
        f().map_err(normalize_document)
    }

    fn to_doc(&self, item: &Item) -> Json {
        let mut doc = Map::new();
        if let Some(id) = item.get(&self.schema.primary_key) {
            doc.insert(ID_FIELD.into(), id.to_json());
        }
        for (name, value) in item {
            if *name != self.schema.primary_key {
                doc.insert(self.schema.column_for(name).to_string(), value.to_json());
            }
        }
        Json::Object(doc)
    }

    fn from_doc(&self, doc: &Json) -> Item {
        item_from_json(doc)
            .into_iter()
            .map(|(key, value)| {
                let name = if key == ID_FIELD {
                    self.schema.primary_key.clone()
                } else {
                    self.schema.field_for_column(&key).to_string()
                };
                (name, value)
            })
            .collect()
    }

    fn id_filter(&self, id: &Value) -> Result<Json> {
        self.schema.check_id(id)?;
        Ok(json!({ ID_FIELD: id.to_json() }))
    }

    fn not_found(&self, id: &Value) -> Error {
        Error::not_found(format!("{}/{}", self.schema.name, id))
    }

    fn create<E: Serialize + DeserializeOwned>(&self, ctx: &Context, entity: &mut E) -> Result<()> {
        let mapper = self.mapper();
        let mut item = mapper.to_item(entity)?;
        let had_id = mapper.id_of(&item).is_some();
        let id = mapper
            .prepare_id(&mut item)?
            .ok_or_else(|| Error::invalid_argument("document records need an id"))?;
        let doc = self.to_doc(&item);
        self.call(ctx, || self.store.insert_one(self.session, self.collection(), doc))?;
        if !had_id {
            mapper.assign_id(entity, id)?;
        }
        Ok(())
    }

    /// Inserts what it can. Once the context is done every remaining item
    /// fails with Timeout; items already stored stay reported as inserted.
    fn create_batch<E: Serialize + DeserializeOwned>(
        &self,
        ctx: &Context,
        entities: &mut [E],
    ) -> Result<BatchOutcome> {
        let mut outcome = BatchOutcome::default();
        for (i, entity) in entities.iter_mut().enumerate() {
            match self.create(ctx, entity) {
                Ok(()) => outcome.inserted += 1,
                Err(e) => outcome.failures.push((i, e)),
            }
        }
        debug!(inserted = outcome.inserted, failed = outcome.failures.len(), "document batch");
        Ok(outcome)
    }

    fn find_by_id<E: DeserializeOwned>(&self, ctx: &Context, id: &Value) -> Result<E> {
        let filter = self.id_filter(id)?;
        let options = FindOptions {
            limit: Some(1),
            ..FindOptions::default()
        };
        let docs = self.call(ctx, || self.store.find(self.session, self.collection(), &filter, &options))?;
        let doc = docs.first().ok_or_else(|| self.not_found(id))?;
        self.mapper().from_item(&self.from_doc(doc))
    }

    fn find_all<E: DeserializeOwned>(&self, ctx: &Context, query: &Query) -> Result<Vec<E>> {
        let mapper = self.mapper();
        self.query(ctx, query)?
            .iter()
            .map(|item| mapper.from_item(item))
            .collect()
    }

    fn update<E: Serialize>(&self, ctx: &Context, entity: &E) -> Result<()> {
        let item = self.mapper().to_item(entity)?;
        let id = self
            .mapper()
            .id_of(&item)
            .ok_or_else(|| Error::invalid_argument("update needs an entity with an id"))?;
        let filter = self.id_filter(&id)?;
        let doc = self.to_doc(&item);
        match self.call(ctx, || self.store.replace_one(self.session, self.collection(), &filter, doc))? {
            0 => Err(self.not_found(&id)),
            _ => Ok(()),
        }
    }

    fn update_partial(&self, ctx: &Context, id: &Value, fields: &Item) -> Result<()> {
        self.mapper().check_partial(fields)?;
        let filter = self.id_filter(id)?;
        let set = self.to_doc(fields);
        match self.call(ctx, || self.store.update_one(self.session, self.collection(), &filter, &set))? {
            0 => Err(self.not_found(id)),
            _ => Ok(()),
        }
    }

    fn delete(&self, ctx: &Context, id: &Value) -> Result<()> {
        let filter = self.id_filter(id)?;
        match self.call(ctx, || self.store.delete_many(self.session, self.collection(), &filter))? {
            0 => Err(self.not_found(id)),
            _ => Ok(()),
        }
    }

    /// Subqueries are refused outright. A translated one runs against a
    /// `<collection>_joined` field stored documents do not carry, and a
    /// degraded one is the always-true filter; either would widen the delete.
    fn delete_by_condition(&self, ctx: &Context, query: &Query) -> Result<u64> {
        check_delete_query(query)?;
        query.validate()?;
        if query.conditions.iter().any(Condition::has_subquery) {
            return Err(Error::validation(
                "document stores cannot delete by a subquery condition",
            ));
        }
        let filter = self.compiler().compile_filter(&query.conditions)?.filter;
        self.call(ctx, || self.store.delete_many(self.session, self.collection(), &filter))
    }

    fn query(&self, ctx: &Context, query: &Query) -> Result<Vec<Item>> {
        let compiled = self.compiler().compile_query(query)?;
        let docs = match &compiled.command {
            DocumentCommand::Find { filter, options } => {
                self.call(ctx, || self.store.find(self.session, self.collection(), filter, options))?
            }
            DocumentCommand::Aggregate { pipeline } => {
                self.call(ctx, || self.store.aggregate(self.session, self.collection(), pipeline))?
            }
            DocumentCommand::Count { filter } => {
                let n = self.call(ctx, || self.store.count(self.session, self.collection(), filter))?;
                return Ok(vec![count_item(n)]);
            }
        };
        Ok(docs.iter().map(|doc| self.from_doc(doc)).collect())
    }

    fn query_one(&self, ctx: &Context, query: &Query) -> Result<Item> {
        self.query(ctx, &first_only(query))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found(format!("no {} record matches", self.schema.name)))
    }

    fn count(&self, ctx: &Context, query: &Query) -> Result<u64> {
        let compiled = self.compiler().compile_count(query)?;
        match &compiled.command {
            DocumentCommand::Count { filter } => {
                self.call(ctx, || self.store.count(self.session, self.collection(), filter))
            }
            DocumentCommand::Aggregate { pipeline } => {
                let docs = self.call(ctx, || self.store.aggregate(self.session, self.collection(), pipeline))?;
                // `$count` emits nothing for an empty input
                Ok(docs
                    .first()
                    .and_then(|d| d.get(pstore_core::compile::COUNT_FIELD))
                    .and_then(Json::as_u64)
                    .unwrap_or(0))
            }
            DocumentCommand::Find { filter, .. } => {
                self.call(ctx, || self.store.count(self.session, self.collection(), filter))
            }
        }
    }

    fn exists(&self, ctx: &Context, query: &Query) -> Result<bool> {
        Ok(!self.query(ctx, &first_only(query))?.is_empty())
    }

    fn aggregate(&self, ctx: &Context, pipeline: &[Json]) -> Result<Vec<Item>> {
        let docs = self.call(ctx, || self.store.aggregate(self.session, self.collection(), pipeline))?;
        Ok(docs.iter().map(|doc| self.from_doc(doc)).collect())
    }
}

fn count_item(n: u64) -> Item {
    let mut item = Item::new();
    item.insert(
        pstore_core::compile::COUNT_FIELD.to_string(),
        Value::Int(i64::try_from(n).unwrap_or(i64::MAX)),
    );
    item
}

impl<E> Repository<E> for DocumentRepository<E>
where
    E: Serialize + DeserializeOwned,
{
    fn create(&self, ctx: &Context, entity: &mut E) -> Result<()> {
        self.ops(None).create(&self.context(ctx), entity)
    }

    fn create_batch(&self, ctx: &Context, entities: &mut [E]) -> Result<BatchOutcome> {
        self.ops(None).create_batch(&self.context(ctx), entities)
    }

    fn find_by_id(&self, ctx: &Context, id: &Value) -> Result<E> {
        self.ops(None).find_by_id(&self.context(ctx), id)
    }

    fn find_all(&self, ctx: &Context, query: &Query) -> Result<Vec<E>> {
        self.ops(None).find_all(&self.context(ctx), query)
    }

    fn update(&self, ctx: &Context, entity: &E) -> Result<()> {
        self.ops(None).update(&self.context(ctx), entity)
    }

    fn update_partial(&self, ctx: &Context, id: &Value, fields: &Item) -> Result<()> {
        self.ops(None).update_partial(&self.context(ctx), id, fields)
    }

    fn delete(&self, ctx: &Context, id: &Value) -> Result<()> {
        self.ops(None).delete(&self.context(ctx), id)
    }

    fn delete_by_condition(&self, ctx: &Context, query: &Query) -> Result<u64> {
        self.ops(None).delete_by_condition(&self.context(ctx), query)
    }

    fn query(&self, ctx: &Context, query: &Query) -> Result<Vec<Item>> {
        self.ops(None).query(&self.context(ctx), query)
    }

    fn query_one(&self, ctx: &Context, query: &Query) -> Result<Item> {
        self.ops(None).query_one(&self.context(ctx), query)
    }

    fn count(&self, ctx: &Context, query: &Query) -> Result<u64> {
        self.ops(None).count(&self.context(ctx), query)
    }

    fn exists(&self, ctx: &Context, query: &Query) -> Result<bool> {
        self.ops(None).exists(&self.context(ctx), query)
    }

    fn transaction(&self, ctx: &Context, f: &mut TxFn<'_, E>) -> Result<()> {
        if !self.store.supports_transactions() {
            return Err(Error::transaction(
                "the document store does not support transactions",
            ));
        }
        let ctx = self.context(ctx);
        ctx.check()?;
        let store = self.store.as_ref();
        let session = store.start_session().map_err(normalize_document)?;

        let result = store
            .start_transaction(session)
            .map_err(normalize_document)
            .and_then(|()| {
                let machine = TxStateMachine::new();
                run_in_scope(&machine, SessionScope { store, session }, |_| {
                    let handle = DocumentTx {
                        ops: self.ops(Some(session)),
                        machine: &machine,
                        default_timeout: self.config.default_timeout,
                        _entity: PhantomData,
                    };
                    f(&handle)
                })
            });
        store.end_session(session);
        result
    }

    fn as_document(&self) -> Option<&dyn DocumentCapable> {
        Some(self)
    }
}

impl<E> DocumentCapable for DocumentRepository<E> {
    fn aggregate(&self, ctx: &Context, pipeline: &[Json]) -> Result<Vec<Item>> {
        self.ops(None).aggregate(&self.context(ctx), pipeline)
    }
}

struct SessionScope<'s> {
    store: &'s dyn DocumentStore,
    session: SessionId,
}

impl TxScope for SessionScope<'_> {
    fn commit(self) -> Result<()> {
        self.store.commit_transaction(self.session).map_err(normalize_document)
    }

    fn rollback(self) -> Result<()> {
        self.store.abort_transaction(self.session).map_err(normalize_document)
    }
}

/// Repository handle whose calls all carry the transaction's session
struct DocumentTx<'t, E> {
    ops: DocOps<'t>,
    machine: &'t TxStateMachine,
    default_timeout: Option<std::time::Duration>,
    _entity: PhantomData<fn() -> E>,
}

impl<E> DocumentTx<'_, E> {
    fn guard(&self, ctx: &Context) -> Result<Context> {
        self.machine.ensure_active()?;
        Ok(effective_context(ctx, self.default_timeout))
    }
}

impl<E> Repository<E> for DocumentTx<'_, E>
where
    E: Serialize + DeserializeOwned,
{
    fn create(&self, ctx: &Context, entity: &mut E) -> Result<()> {
        self.ops.create(&self.guard(ctx)?, entity)
    }

    fn create_batch(&self, ctx: &Context, entities: &mut [E]) -> Result<BatchOutcome> {
        self.ops.create_batch(&self.guard(ctx)?, entities)
    }

    fn find_by_id(&self, ctx: &Context, id: &Value) -> Result<E> {
        self.ops.find_by_id(&self.guard(ctx)?, id)
    }

    fn find_all(&self, ctx: &Context, query: &Query) -> Result<Vec<E>> {
        self.ops.find_all(&self.guard(ctx)?, query)
    }

    fn update(&self, ctx: &Context, entity: &E) -> Result<()> {
        self.ops.update(&self.guard(ctx)?, entity)
    }

    fn update_partial(&self, ctx: &Context, id: &Value, fields: &Item) -> Result<()> {
        self.ops.update_partial(&self.guard(ctx)?, id, fields)
    }

    fn delete(&self, ctx: &Context, id: &Value) -> Result<()> {
        self.ops.delete(&self.guard(ctx)?, id)
    }

    fn delete_by_condition(&self, ctx: &Context, query: &Query) -> Result<u64> {
        self.ops.delete_by_condition(&self.guard(ctx)?, query)
    }

    fn query(&self, ctx: &Context, query: &Query) -> Result<Vec<Item>> {
        self.ops.query(&self.guard(ctx)?, query)
    }

    fn query_one(&self, ctx: &Context, query: &Query) -> Result<Item> {
        self.ops.query_one(&self.guard(ctx)?, query)
    }

    fn count(&self, ctx: &Context, query: &Query) -> Result<u64> {
        self.ops.count(&self.guard(ctx)?, query)
    }

    fn exists(&self, ctx: &Context, query: &Query) -> Result<bool> {
        self.ops.exists(&self.guard(ctx)?, query)
    }

    fn transaction(&self, _ctx: &Context, _f: &mut TxFn<'_, E>) -> Result<()> {
        Err(Error::unsupported("nested transactions are not supported"))
    }

    fn as_document(&self) -> Option<&dyn DocumentCapable> {
        Some(self)
    }
}

impl<E> DocumentCapable for DocumentTx<'_, E> {
    fn aggregate(&self, ctx: &Context, pipeline: &[Json]) -> Result<Vec<Item>> {
        self.ops.aggregate(&self.guard(ctx)?, pipeline)
    }
}
