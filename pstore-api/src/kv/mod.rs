/// Key-value backend
///
/// Records live under `<prefix><entity>:<id>`, encoded with the configured
/// [`RecordCodec`] and keyed by schema column names. The store has no query
/// language, so queries scan the entity's keys in batches and evaluate a
/// [`KvPlan`](pstore_core::KvPlan) in process.
///
/// The JSON codec stores `Bytes` values as base64 text and reads them back as
/// strings; use `RecordCodec::Bincode` to keep them binary.
mod memory;
mod store;

pub use memory::MemoryKvStore;
pub use store::{KeyTtl, KvResult, KvStore};

use crate::entity::EntityMapper;
use crate::repository::{
    check_delete_query, effective_context, first_only, BatchOutcome, KeyValueCapable, Repository, TxFn,
};
use bytes::Bytes;
use pstore_core::normalize::normalize_kv;
use pstore_core::{
    item_from_json, item_to_json, Context, EntitySchema, Error, IdStrategy, Item, KvFailure,
    KvMatcher, Query, RecordCodec, RepositoryConfig, Result, Value,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashSet;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct KvRepository<E> {
    store: Arc<dyn KvStore>,
    schema: Arc<EntitySchema>,
    config: RepositoryConfig,
    _entity: PhantomData<fn() -> E>,
}

impl<E> Clone for KvRepository<E> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            schema: Arc::clone(&self.schema),
            config: self.config.clone(),
            _entity: PhantomData,
        }
    }
}

impl<E> KvRepository<E> {
    pub fn new(store: Arc<dyn KvStore>, schema: EntitySchema, config: RepositoryConfig) -> Result<Self> {
        config.validate()?;
        schema.validate()?;
        if schema.id_strategy == IdStrategy::AutoIncrement {
            return Err(Error::unsupported(
                "auto-increment ids need the relational backend; use Uuid or Provided",
            ));
        }
        info!(
            entity = %schema.name,
            prefix = %config.key_prefix,
            codec = ?config.record_codec,
            "key-value repository ready"
        );
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

    /// Store key of the record with this id. Ids are keyed by their text
    /// form, so `1` and `"1"` name the same record.
    pub fn key_for(&self, id: &Value) -> Result<String> {
        self.schema.check_id(id)?;
        let id = id.coerce_string();
        if id.is_empty() {
            return Err(Error::invalid_argument("record id must not be empty"));
        }
        Ok(format!("{}{}:{}", self.config.key_prefix, self.schema.name, id))
    }

    fn pattern(&self) -> String {
        format!("{}{}:*", self.config.key_prefix, self.schema.name)
    }

    fn context(&self, ctx: &Context) -> Context {
        effective_context(ctx, self.config.default_timeout)
    }

    fn mapper(&self) -> EntityMapper<'_> {
        EntityMapper::new(&self.schema)
    }

    /// One store call, made only while the context is live
    fn call<T>(&self, ctx: &Context, f: impl FnOnce() -> std::result::Result<T, KvFailure>) -> Result<T> {
        ctx.check()?;
        f().map_err(normalize_kv)
    }

    fn encode(&self, item: &Item) -> Result<Bytes> {
        let record: Item = item
            .iter()
            .map(|(name, value)| (self.schema.column_for(name).to_string(), value.clone()))
            .collect();
        let raw = match self.config.record_codec {
            RecordCodec::Json => serde_json::to_vec(&item_to_json(&record))?,
            RecordCodec::Bincode => bincode::serialize(&record)?,
        };
        Ok(Bytes::from(raw))
    }

    fn decode(&self, key: &str, raw: &[u8]) -> Result<Item> {
        let record: Item = match self.config.record_codec {
            RecordCodec::Json => serde_json::from_slice::<serde_json::Value>(raw)
                .map(|json| item_from_json(&json))
                .map_err(|e| Error::from(e).with_context(key))?,
            RecordCodec::Bincode => bincode::deserialize(raw).map_err(|e| Error::from(e).with_context(key))?,
        };
        Ok(record
            .into_iter()
            .map(|(column, value)| (self.schema.field_for_column(&column).to_string(), value))
            .collect())
    }

    fn not_found(&self, key: &str) -> Error {
        Error::not_found(format!("no record at '{}'", key))
    }

    /// Every live record of this entity with its key
    fn scan(&self, ctx: &Context) -> Result<Vec<(String, Item)>> {
        let pattern = self.pattern();
        let batch = self.config.scan_batch_size;
        let max = self.config.max_scan_keys;

        let mut seen = HashSet::new();
        let mut records = Vec::new();
        let mut cursor = 0;
        loop {
            let (next, keys) = self.call(ctx, || self.store.scan(cursor, &pattern, batch))?;
            for key in keys {
                if !seen.insert(key.clone()) {
                    continue;
                }
                if seen.len() > max {
                    return Err(Error::invalid_argument(format!(
                        "scan of '{}' exceeded max_scan_keys ({})",
                        self.schema.name, max
                    )));
                }
                // Expired or deleted since the scan step
                if let Some(raw) = self.call(ctx, || self.store.get(&key))? {
                    let item = self.decode(&key, &raw)?;
                    records.push((key, item));
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(entity = %self.schema.name, keys = seen.len(), records = records.len(), "key-value scan");
        Ok(records)
    }

    fn records(&self, ctx: &Context) -> Result<Vec<Item>> {
        Ok(self.scan(ctx)?.into_iter().map(|(_, item)| item).collect())
    }

    fn insert(&self, ctx: &Context, entity: &mut E, ttl: Option<Duration>) -> Result<()>
    where
        E: Serialize + DeserializeOwned,
    {
        let mapper = self.mapper();
        let mut item = mapper.to_item(entity)?;
        let had_id = mapper.id_of(&item).is_some();
        let id = mapper
            .prepare_id(&mut item)?
            .ok_or_else(|| Error::invalid_argument("key-value records need an id"))?;
        let key = self.key_for(&id)?;
        let value = self.encode(&item)?;

        if !self.call(ctx, || self.store.set_nx(&key, value, ttl))? {
            return Err(Error::duplicate(format!("'{}' already exists", key)));
        }
        if !had_id {
            mapper.assign_id(entity, id)?;
        }
        debug!(key = %key, ttl = ?ttl, "created record");
        Ok(())
    }

    fn load(&self, ctx: &Context, key: &str) -> Result<Item> {
        let raw = self
            .call(ctx, || self.store.get(key))?
            .ok_or_else(|| self.not_found(key))?;
        self.decode(key, &raw)
    }

    fn store_existing(&self, ctx: &Context, key: &str, item: &Item) -> Result<()> {
        let value = self.encode(item)?;
        if !self.call(ctx, || self.store.set_xx(key, value))? {
            return Err(self.not_found(key));
        }
        Ok(())
    }
}

fn positive_ttl(ttl: Duration) -> Result<Duration> {
    if ttl.is_zero() {
        return Err(Error::invalid_argument("ttl must be greater than 0"));
    }
    Ok(ttl)
}

impl<E> Repository<E> for KvRepository<E>
where
    E: Serialize + DeserializeOwned,
{
    fn create(&self, ctx: &Context, entity: &mut E) -> Result<()> {
        self.insert(&self.context(ctx), entity, None)
    }

    /// Inserts what it can. Once the context is done every remaining item
    /// fails with Timeout; items already stored stay reported as inserted.
    fn create_batch(&self, ctx: &Context, entities: &mut [E]) -> Result<BatchOutcome> {
        let ctx = self.context(ctx);
        let mut outcome = BatchOutcome::default();
        for (i, entity) in entities.iter_mut().enumerate() {
            match self.insert(&ctx, entity, None) {
                Ok(()) => outcome.inserted += 1,
                Err(e) => outcome.failures.push((i, e)),
            }
        }
        debug!(inserted = outcome.inserted, failed = outcome.failures.len(), "key-value batch");
        Ok(outcome)
    }

    fn find_by_id(&self, ctx: &Context, id: &Value) -> Result<E> {
        let key = self.key_for(id)?;
        let item = self.load(&self.context(ctx), &key)?;
        self.mapper().from_item(&item)
    }

    fn find_all(&self, ctx: &Context, query: &Query) -> Result<Vec<E>> {
        let mapper = self.mapper();
        self.query(ctx, query)?
            .iter()
            .map(|item| mapper.from_item(item))
            .collect()
    }

    fn update(&self, ctx: &Context, entity: &E) -> Result<()> {
        let item = self.mapper().to_item(entity)?;
        let id = self
            .mapper()
            .id_of(&item)
            .ok_or_else(|| Error::invalid_argument("update needs an entity with an id"))?;
        let key = self.key_for(&id)?;
        self.store_existing(&self.context(ctx), &key, &item)
    }

    /// Read-modify-write; not atomic against concurrent writers of the same key
    fn update_partial(&self, ctx: &Context, id: &Value, fields: &Item) -> Result<()> {
        self.mapper().check_partial(fields)?;
        let ctx = self.context(ctx);
        let key = self.key_for(id)?;
        let mut item = self.load(&ctx, &key)?;
        item.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.store_existing(&ctx, &key, &item)
    }

    fn delete(&self, ctx: &Context, id: &Value) -> Result<()> {
        let key = self.key_for(id)?;
        if !self.call(&self.context(ctx), || self.store.delete(&key))? {
            return Err(self.not_found(&key));
        }
        Ok(())
    }

    fn delete_by_condition(&self, ctx: &Context, query: &Query) -> Result<u64> {
        check_delete_query(query)?;
        let plan = KvMatcher::compile(query)?;
        let ctx = self.context(ctx);

        let mut deleted = 0;
        for (key, item) in self.scan(&ctx)? {
            if plan.matches(&item) && self.call(&ctx, || self.store.delete(&key))? {
                deleted += 1;
            }
        }
        debug!(entity = %self.schema.name, deleted, "deleted by condition");
        Ok(deleted)
    }

    fn query(&self, ctx: &Context, query: &Query) -> Result<Vec<Item>> {
        let plan = KvMatcher::compile(query)?;
        let records = self.records(&self.context(ctx))?;
        Ok(plan.execute(records))
    }

    fn query_one(&self, ctx: &Context, query: &Query) -> Result<Item> {
        self.query(ctx, &first_only(query))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found(format!("no {} record matches", self.schema.name)))
    }

    /// Matching records, or matching groups for a grouped query
    fn count(&self, ctx: &Context, query: &Query) -> Result<u64> {
        let plan = KvMatcher::compile(&query.unpaged())?;
        let records = self.records(&self.context(ctx))?;
        Ok(plan.execute(records).len() as u64)
    }

    fn exists(&self, ctx: &Context, query: &Query) -> Result<bool> {
        Ok(!self.query(ctx, &first_only(query))?.is_empty())
    }

    fn transaction(&self, _ctx: &Context, _f: &mut TxFn<'_, E>) -> Result<()> {
        Err(Error::unsupported("the key-value backend does not support transactions"))
    }

    fn as_key_value(&self) -> Option<&dyn KeyValueCapable<E>> {
        Some(self)
    }
}

impl<E> KeyValueCapable<E> for KvRepository<E>
where
    E: Serialize + DeserializeOwned,
{
    fn create_with_ttl(&self, ctx: &Context, entity: &mut E, ttl: Duration) -> Result<()> {
        let ttl = positive_ttl(ttl)?;
        self.insert(&self.context(ctx), entity, Some(ttl))
    }

    fn expire(&self, ctx: &Context, id: &Value, ttl: Duration) -> Result<()> {
        let ttl = positive_ttl(ttl)?;
        let key = self.key_for(id)?;
        if !self.call(&self.context(ctx), || self.store.expire(&key, ttl))? {
            return Err(self.not_found(&key));
        }
        Ok(())
    }

    fn ttl(&self, ctx: &Context, id: &Value) -> Result<Option<Duration>> {
        let key = self.key_for(id)?;
        match self.call(&self.context(ctx), || self.store.ttl(&key))? {
            KeyTtl::Missing => Err(self.not_found(&key)),
            KeyTtl::NoExpiry => Ok(None),
            KeyTtl::Remaining(left) => Ok(Some(left)),
        }
    }
}
