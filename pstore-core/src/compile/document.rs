/// Document filter compiler
///
/// Produces MongoDB-style filter documents, find options and aggregation
/// pipelines as `serde_json::Value`. Negated operators (`<>`, NOT IN,
/// NOT LIKE, NOT BETWEEN) never match a missing or null field, as in SQL.

use super::{like_to_regex, COUNT_FIELD};
use crate::condition::{BasicCondition, Condition, Logic, Operator, SubQuery};
use crate::config::SubqueryPolicy;
use crate::query::{Direction, LockMode, Query};
use crate::schema::EntitySchema;
use crate::{Error, Result, Value};
use regex::Regex;
use serde_json::{json, Map, Value as Json};
use sqlparser::ast::{SetExpr, Statement, TableFactor};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser as SqlParser;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Document key holding the primary key
pub const ID_FIELD: &str = "_id";

/// A predicate the compiler could not translate and replaced with `{}`
#[derive(Debug, Clone, PartialEq)]
pub struct Degradation {
    pub raw: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FindOptions {
    /// Sort keys in priority order, `1` ascending and `-1` descending
    pub sort: Vec<(String, i32)>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
    pub projection: Option<Json>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocumentCommand {
    Find { filter: Json, options: FindOptions },
    Count { filter: Json },
    Aggregate { pipeline: Vec<Json> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompiledDocumentQuery {
    pub command: DocumentCommand,
    pub degradations: Vec<Degradation>,
}

/// A filter document with any degradations taken while building it
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledFilter {
    pub filter: Json,
    pub degradations: Vec<Degradation>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DocumentCompiler<'s> {
    policy: SubqueryPolicy,
    schema: Option<&'s EntitySchema>,
}

impl<'s> DocumentCompiler<'s> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_policy(mut self, policy: SubqueryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_schema(mut self, schema: &'s EntitySchema) -> Self {
        self.schema = Some(schema);
        self
    }

    /// Filter document for `conditions` (implicit AND)
    pub fn compile_filter(&self, conditions: &[Condition]) -> Result<CompiledFilter> {
        let mut degradations = Vec::new();
        let filter = self.conjunction(conditions, true, &mut degradations)?;
        Ok(CompiledFilter { filter, degradations })
    }

    pub fn compile_query(&self, query: &Query) -> Result<CompiledDocumentQuery> {
        self.check_supported(query)?;
        let CompiledFilter { filter, mut degradations } = self.compile_filter(&query.conditions)?;

        let command = if self.needs_pipeline(query) {
            DocumentCommand::Aggregate {
                pipeline: self.pipeline(query, filter, true, &mut degradations)?,
            }
        } else {
            let options = FindOptions {
                sort: query
                    .sort
                    .iter()
                    .map(|key| (self.field(&key.field), direction(key.direction)))
                    .collect(),
                skip: query.offset.map(|n| n as u64),
                limit: query.limit.map(|n| n as u64),
                projection: self.projection(query),
            };
            DocumentCommand::Find { filter, options }
        };
        debug!(?command, degraded = degradations.len(), "compiled document query");
        Ok(CompiledDocumentQuery { command, degradations })
    }

    /// Count of matching documents (paging and ordering ignored)
    pub fn compile_count(&self, query: &Query) -> Result<CompiledDocumentQuery> {
        self.check_supported(query)?;
        let query = query.unpaged();
        let CompiledFilter { filter, mut degradations } = self.compile_filter(&query.conditions)?;
        let command = if self.needs_pipeline(&query) {
            let mut pipeline = self.pipeline(&query, filter, false, &mut degradations)?;
            pipeline.push(json!({ "$count": COUNT_FIELD }));
            DocumentCommand::Aggregate { pipeline }
        } else {
            DocumentCommand::Count { filter }
        };
        Ok(CompiledDocumentQuery { command, degradations })
    }

    fn check_supported(&self, query: &Query) -> Result<()> {
        query.validate()?;
        if !query.joins.is_empty() {
            return Err(Error::unsupported("joins are not supported by the document backend"));
        }
        if !query.preloads.is_empty() {
            return Err(Error::unsupported("preloads are not supported by the document backend"));
        }
        if query.lock != LockMode::None {
            return Err(Error::unsupported("row locks are not supported by the document backend"));
        }
        if !query.having.is_empty() && !query.is_grouped() {
            return Err(Error::validation("HAVING requires GROUP BY"));
        }
        Ok(())
    }

    fn needs_pipeline(&self, query: &Query) -> bool {
        query.is_grouped() || (query.distinct && !query.select.is_empty())
    }

    /// `$match`, `$group`, `$project`, having `$match`, then ordering and paging
    fn pipeline(
        &self,
        query: &Query,
        filter: Json,
        paged: bool,
        degradations: &mut Vec<Degradation>,
    ) -> Result<Vec<Json>> {
        let grouped = query.is_grouped();
        let keys: &[String] = if grouped { &query.group_by } else { &query.select };
        if grouped {
            if let Some(field) = query.select.iter().find(|f| !query.group_by.contains(f)) {
                return Err(Error::validation(format!(
                    "selected field '{}' is not in GROUP BY",
                    field
                )));
            }
        }

        let mut stages = Vec::new();
        if !is_empty_filter(&filter) {
            stages.push(json!({ "$match": filter }));
        }

        let mut group_id = Map::new();
        for key in keys {
            group_id.insert(key.clone(), Json::String(format!("${}", self.field(key))));
        }
        let mut group = Map::new();
        group.insert(ID_FIELD.into(), Json::Object(group_id));
        if grouped {
            group.insert(COUNT_FIELD.into(), json!({ "$sum": 1 }));
        }
        stages.push(json!({ "$group": group }));

        let output: &[String] = if grouped && !query.select.is_empty() { &query.select } else { keys };
        let mut project = Map::new();
        project.insert(ID_FIELD.into(), json!(0));
        for key in output {
            project.insert(key.clone(), Json::String(format!("$_id.{}", key)));
        }
        if grouped {
            project.insert(COUNT_FIELD.into(), json!(1));
        }
        stages.push(json!({ "$project": project }));

        if !query.having.is_empty() {
            // Grouped output carries logical names, so no field mapping here
            let having = self.conjunction(&query.having, false, degradations)?;
            stages.push(json!({ "$match": having }));
        }

        if paged {
            if !query.sort.is_empty() {
                let mut sort = Map::new();
                for key in &query.sort {
                    sort.insert(key.field.clone(), json!(direction(key.direction)));
                }
                stages.push(json!({ "$sort": sort }));
            }
            if let Some(offset) = query.offset {
                stages.push(json!({ "$skip": offset }));
            }
            if let Some(limit) = query.limit {
                stages.push(json!({ "$limit": limit }));
            }
        }
        Ok(stages)
    }

    fn projection(&self, query: &Query) -> Option<Json> {
        if query.select.is_empty() {
            return None;
        }
        let mut project = Map::new();
        let mut has_id = false;
        for field in &query.select {
            let name = self.field(field);
            has_id |= name == ID_FIELD;
            project.insert(name, json!(1));
        }
        if !has_id {
            project.insert(ID_FIELD.into(), json!(0));
        }
        Some(Json::Object(project))
    }

    fn conjunction(&self, conditions: &[Condition], mapped: bool, deg: &mut Vec<Degradation>) -> Result<Json> {
        match conditions {
            [] => Ok(json!({})),
            [single] => self.condition(single, mapped, deg),
            many => {
                let parts: Result<Vec<Json>> = many.iter().map(|c| self.condition(c, mapped, deg)).collect();
                Ok(json!({ "$and": parts? }))
            }
        }
    }

    fn condition(&self, condition: &Condition, mapped: bool, deg: &mut Vec<Degradation>) -> Result<Json> {
        match condition {
            Condition::Basic(basic) => self.basic(basic, mapped),
            Condition::Composite(group) => {
                if group.children.is_empty() {
                    return Ok(match group.logic {
                        Logic::And | Logic::Not => json!({}),
                        Logic::Or => never(),
                    });
                }
                let children: Result<Vec<Json>> = group
                    .children
                    .iter()
                    .map(|c| self.condition(c, mapped, deg))
                    .collect();
                let key = match group.logic {
                    Logic::And => "$and",
                    Logic::Or => "$or",
                    Logic::Not => "$nor",
                };
                Ok(json!({ key: children? }))
            }
            Condition::SubQuery(sub) => self.subquery(sub, deg),
        }
    }

    fn basic(&self, c: &BasicCondition, mapped: bool) -> Result<Json> {
        c.validate()?;
        let field = if mapped { self.field(&c.field) } else { c.field.clone() };
        let value = c.value.to_json();

        let predicate = match c.effective_op() {
            Operator::Equal => json!({ "$eq": value }),
            // SQL `<>` never matches NULL
            Operator::NotEqual => json!({ "$nin": [value, Json::Null] }),
            Operator::GreaterThan => json!({ "$gt": value }),
            Operator::GreaterThanOrEqual => json!({ "$gte": value }),
            Operator::LessThan => json!({ "$lt": value }),
            Operator::LessThanOrEqual => json!({ "$lte": value }),
            Operator::In => json!({ "$in": list_json(&c.value) }),
            Operator::NotIn => {
                let mut items = list_json(&c.value);
                items.push(Json::Null);
                json!({ "$nin": items })
            }
            Operator::IsNull => Json::Null,
            Operator::IsNotNull => json!({ "$ne": Json::Null }),
            Operator::Between => {
                let (low, high) = c.between_bounds()?;
                json!({ "$gte": low.to_json(), "$lte": high.to_json() })
            }
            Operator::NotBetween => {
                let (low, high) = c.between_bounds()?;
                return Ok(json!({ "$or": [
                    { field.as_str(): { "$lt": low.to_json() } },
                    { field.as_str(): { "$gt": high.to_json() } }
                ]}));
            }
            Operator::Like => json!({ "$regex": like_to_regex(pattern(c)) }),
            Operator::NotLike => json!({
                "$not": { "$regex": like_to_regex(pattern(c)) },
                "$ne": Json::Null
            }),
            Operator::Contains => json!({ "$regex": regex::escape(pattern(c)) }),
            Operator::StartsWith => json!({ "$regex": format!("^{}", regex::escape(pattern(c))) }),
            Operator::EndsWith => json!({ "$regex": format!("{}$", regex::escape(pattern(c))) }),
            Operator::Regex => json!({ "$regex": pattern(c) }),
            Operator::Exists
            | Operator::NotExists
            | Operator::InSubquery
            | Operator::NotInSubquery => {
                return Err(Error::validation(format!(
                    "operator {} requires a subquery condition",
                    c.op
                )));
            }
        };
        Ok(json!({ field: predicate }))
    }

    /// Best-effort translation against a `<collection>_joined` array field
    fn subquery(&self, sub: &SubQuery, deg: &mut Vec<Degradation>) -> Result<Json> {
        sub.validate()?;
        let collection = match extract_collection(&sub.raw) {
            Some(name) => name,
            None => return self.degrade(sub, "cannot determine subquery collection", deg),
        };
        let joined = json!({ "$ifNull": [format!("${}_joined", collection), []] });
        let outer = sub.field.as_deref().map(|f| format!("${}", self.field(f)));

        let expr = match (sub.op, outer) {
            (Operator::Exists, _) => json!({ "$gt": [{ "$size": joined }, 0] }),
            (Operator::NotExists, _) => json!({ "$eq": [{ "$size": joined }, 0] }),
            (Operator::InSubquery, Some(f)) => json!({ "$in": [f, joined] }),
            (Operator::NotInSubquery, Some(f)) => json!({ "$not": [{ "$in": [f, joined] }] }),
            (op, Some(f)) if op.is_comparison() => {
                let name = match op {
                    Operator::Equal => "$eq",
                    Operator::NotEqual => "$ne",
                    Operator::GreaterThan => "$gt",
                    Operator::GreaterThanOrEqual => "$gte",
                    Operator::LessThan => "$lt",
                    _ => "$lte",
                };
                json!({ name: [f, { "$arrayElemAt": [joined, 0] }] })
            }
            (op, _) => {
                return self.degrade(sub, &format!("operator {} has no document form", op), deg);
            }
        };
        Ok(json!({ "$expr": expr }))
    }

    fn degrade(&self, sub: &SubQuery, reason: &str, deg: &mut Vec<Degradation>) -> Result<Json> {
        match self.policy {
            SubqueryPolicy::Strict => Err(Error::validation(format!(
                "subquery cannot be translated for the document backend: {}",
                reason
            ))),
            SubqueryPolicy::Permissive => {
                warn!(raw = %sub.raw, reason, "subquery degraded to match-all filter");
                deg.push(Degradation {
                    raw: sub.raw.clone(),
                    reason: reason.to_string(),
                });
                Ok(json!({}))
            }
        }
    }

    /// Document key for a logical field
    fn field(&self, name: &str) -> String {
        match self.schema {
            Some(schema) if schema.is_primary_key(name) => ID_FIELD.to_string(),
            Some(schema) => schema.column_for(name).to_string(),
            None if name == "id" => ID_FIELD.to_string(),
            None => name.to_string(),
        }
    }
}

fn direction(d: Direction) -> i32 {
    match d {
        Direction::Asc => 1,
        Direction::Desc => -1,
    }
}

fn pattern(c: &BasicCondition) -> &str {
    c.value.as_str().unwrap_or_default()
}

fn list_json(value: &Value) -> Vec<Json> {
    value.as_list().unwrap_or(&[]).iter().map(Value::to_json).collect()
}

/// Filter that matches no document
fn never() -> Json {
    json!({ ID_FIELD: { "$in": [] } })
}

pub(crate) fn is_empty_filter(filter: &Json) -> bool {
    filter.as_object().map_or(false, Map::is_empty)
}

fn from_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bFROM\s+([A-Za-z_][A-Za-z0-9_]*)").expect("static regex"))
}

/// First FROM table of a relational subquery text
pub(crate) fn extract_collection(raw: &str) -> Option<String> {
    if let Ok(statements) = SqlParser::parse_sql(&GenericDialect {}, raw) {
        if let Some(Statement::Query(query)) = statements.first() {
            if let SetExpr::Select(select) = &*query.body {
                if let Some(TableFactor::Table { name, .. }) = select.from.first().map(|t| &t.relation) {
                    if let Some(ident) = name.0.last() {
                        return Some(ident.value.clone());
                    }
                }
            }
        }
    }
    from_re()
        .captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}
