use super::convert::{decode_row, SqlParam};
use crate::entity::EntityMapper;
use crate::repository::BatchOutcome;
use pstore_core::normalize::normalize_sqlite;
use pstore_core::query::opts::where_;
use pstore_core::{
    CompiledStatement, Context, Dialect, EntitySchema, Error, Item, Operator, Query, Result,
    SqlCompiler, Value,
};
use rusqlite::{params_from_iter, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

/// Repository operations over one borrowed connection. Used by the
/// repository itself and by transaction handles.
pub(super) struct SqlOps<'a> {
    pub conn: &'a Connection,
    pub schema: &'a EntitySchema,
}

impl<'a> SqlOps<'a> {
    fn compiler(&self) -> SqlCompiler<'a> {
        SqlCompiler::new(Dialect::Sqlite).with_schema(self.schema)
    }

    fn mapper(&self) -> EntityMapper<'a> {
        EntityMapper::new(self.schema)
    }

    fn by_id(&self, id: &Value) -> Result<Query> {
        self.schema.check_id(id)?;
        Ok(Query::new().filter(where_(&self.schema.primary_key, Operator::Equal, id.clone())))
    }

    /// Run one native call once the context allows it. A call that has
    /// started reports its own outcome, even if the deadline passes meanwhile.
    fn run<T>(&self, ctx: &Context, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        ctx.check()?;
        f(self.conn).map_err(normalize_sqlite)
    }

    pub fn execute(&self, ctx: &Context, sql: &str, params: &[Value]) -> Result<usize> {
        debug!(sql, params = params.len(), "execute");
        self.run(ctx, |conn| conn.execute(sql, params_from_iter(params.iter().map(SqlParam))))
    }

    pub fn fetch(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[Value],
        schema: Option<&EntitySchema>,
    ) -> Result<Vec<Item>> {
        debug!(sql, params = params.len(), "query");
        self.run(ctx, |conn| {
            let mut stmt = conn.prepare(sql)?;
            let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
            let mut rows = stmt.query(params_from_iter(params.iter().map(SqlParam)))?;
            let mut items = Vec::new();
            while let Some(row) = rows.next()? {
                items.push(decode_row(row, &columns, schema)?);
            }
            Ok(items)
        })
    }

    fn fetch_compiled(&self, ctx: &Context, stmt: &CompiledStatement) -> Result<Vec<Item>> {
        if !stmt.preloads.is_empty() {
            debug!(preloads = ?stmt.preloads, "preloads are resolved by the caller");
        }
        self.fetch(ctx, &stmt.sql, &stmt.params, Some(self.schema))
    }

    fn scalar(&self, ctx: &Context, stmt: &CompiledStatement) -> Result<i64> {
        debug!(sql = %stmt.sql, "scalar");
        self.run(ctx, |conn| {
            conn.query_row(&stmt.sql, params_from_iter(stmt.params.iter().map(SqlParam)), |row| {
                row.get::<_, i64>(0)
            })
        })
    }

    /// INSERT one record; returns the stored id
    fn insert(&self, ctx: &Context, item: &mut Item) -> Result<Value> {
        let provided = self.mapper().prepare_id(item)?;
        let columns: Vec<&str> = self
            .schema
            .fields
            .iter()
            .map(|f| f.name.as_str())
            .filter(|name| *name != self.schema.primary_key || provided.is_some())
            .collect();
        let stmt = self.compiler().compile_insert(&self.schema.name, &columns, item)?;
        self.execute(ctx, &stmt.sql, &stmt.params)?;
        Ok(match provided {
            Some(id) => id,
            None => Value::Int(self.conn.last_insert_rowid()),
        })
    }

    pub fn create<E: Serialize + DeserializeOwned>(&self, ctx: &Context, entity: &mut E) -> Result<()> {
        let mapper = self.mapper();
        let mut item = mapper.to_item(entity)?;
        let had_id = mapper.id_of(&item).is_some();
        let id = self.insert(ctx, &mut item)?;
        if !had_id {
            mapper.assign_id(entity, id)?;
        }
        Ok(())
    }

    /// All-or-nothing under a savepoint, so it nests inside an open
    /// transaction as well
    pub fn create_batch<E: Serialize + DeserializeOwned>(
        &self,
        ctx: &Context,
        entities: &mut [E],
    ) -> Result<BatchOutcome> {
        let mapper = self.mapper();
        let mut items = entities
            .iter()
            .map(|e| mapper.to_item(e))
            .collect::<Result<Vec<_>>>()?;

        self.run(ctx, |conn| conn.execute_batch("SAVEPOINT create_batch"))?;
        let mut generated = Vec::with_capacity(items.len());
        for (i, item) in items.iter_mut().enumerate() {
            let had_id = mapper.id_of(item).is_some();
            match self.insert(ctx, item) {
                Ok(id) => generated.push((!had_id).then_some(id)),
                Err(e) => {
                    self.abandon_savepoint();
                    return Err(e.with_context(&format!("batch item {}", i)));
                }
            }
        }
        // The savepoint is closed whatever the context says
        if let Err(e) = self.conn.execute_batch("RELEASE create_batch") {
            self.abandon_savepoint();
            return Err(normalize_sqlite(e).with_context("batch release"));
        }

        for (entity, id) in entities.iter_mut().zip(generated) {
            if let Some(id) = id {
                mapper.assign_id(entity, id)?;
            }
        }
        Ok(BatchOutcome {
            inserted: items.len(),
            failures: Vec::new(),
        })
    }

    fn abandon_savepoint(&self) {
        // Rollback failures are secondary to the error being returned
        if let Err(e) = self.conn.execute_batch("ROLLBACK TO create_batch; RELEASE create_batch") {
            warn!(error = %e, "failed to roll back batch savepoint");
        }
    }

    pub fn find_by_id<E: DeserializeOwned>(&self, ctx: &Context, id: &Value) -> Result<E> {
        let item = self
            .query_one(ctx, &self.by_id(id)?)
            .map_err(|e| e.with_context(&format!("{}/{}", self.schema.name, id)))?;
        self.mapper().from_item(&item)
    }

    pub fn find_all<E: DeserializeOwned>(&self, ctx: &Context, query: &Query) -> Result<Vec<E>> {
        let mapper = self.mapper();
        self.query(ctx, query)?
            .iter()
            .map(|item| mapper.from_item(item))
            .collect()
    }

    pub fn update<E: Serialize>(&self, ctx: &Context, entity: &E) -> Result<()> {
        let item = self.mapper().to_item(entity)?;
        let id = self
            .mapper()
            .id_of(&item)
            .ok_or_else(|| Error::invalid_argument("update needs an entity with an id"))?;
        let fields: Vec<(&str, &Value)> = self
            .schema
            .fields
            .iter()
            .filter(|f| f.name != self.schema.primary_key)
            .map(|f| (f.name.as_str(), item.get(&f.name).unwrap_or(&Value::Null)))
            .collect();
        self.apply_update(ctx, &id, &fields)
    }

    pub fn update_partial(&self, ctx: &Context, id: &Value, fields: &Item) -> Result<()> {
        self.mapper().check_partial(fields)?;
        let mut fields: Vec<(&str, &Value)> = fields.iter().map(|(k, v)| (k.as_str(), v)).collect();
        fields.sort_by(|a, b| a.0.cmp(b.0));
        self.apply_update(ctx, id, &fields)
    }

    fn apply_update(&self, ctx: &Context, id: &Value, fields: &[(&str, &Value)]) -> Result<()> {
        self.schema.check_id(id)?;
        let stmt = self
            .compiler()
            .compile_update(&self.schema.name, &self.schema.primary_key, id, fields)?;
        match self.execute(ctx, &stmt.sql, &stmt.params)? {
            0 => Err(Error::not_found(format!("{}/{}", self.schema.name, id))),
            _ => Ok(()),
        }
    }

    pub fn delete(&self, ctx: &Context, id: &Value) -> Result<()> {
        match self.delete_by_condition(ctx, &self.by_id(id)?)? {
            0 => Err(Error::not_found(format!("{}/{}", self.schema.name, id))),
            _ => Ok(()),
        }
    }

    pub fn delete_by_condition(&self, ctx: &Context, query: &Query) -> Result<u64> {
        let stmt = self.compiler().compile_delete(&self.schema.name, query)?;
        Ok(self.execute(ctx, &stmt.sql, &stmt.params)? as u64)
    }

    pub fn query(&self, ctx: &Context, query: &Query) -> Result<Vec<Item>> {
        let stmt = self.compiler().compile_select(&self.schema.name, query)?;
        self.fetch_compiled(ctx, &stmt)
    }

    pub fn query_one(&self, ctx: &Context, query: &Query) -> Result<Item> {
        self.query(ctx, &crate::repository::first_only(query))?
            .into_iter()
            .next()
            .ok_or_else(|| Error::not_found(format!("no {} record matches", self.schema.name)))
    }

    pub fn count(&self, ctx: &Context, query: &Query) -> Result<u64> {
        let stmt = self.compiler().compile_count(&self.schema.name, query)?;
        Ok(self.scalar(ctx, &stmt)?.max(0) as u64)
    }

    pub fn exists(&self, ctx: &Context, query: &Query) -> Result<bool> {
        let stmt = self.compiler().compile_exists(&self.schema.name, query)?;
        Ok(!self.fetch_compiled(ctx, &stmt)?.is_empty())
    }
}
