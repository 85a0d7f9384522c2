/// Relational statement compiler
///
/// Translates a `Query` into parameterized SQL. Condition values are always
/// bound parameters; identifiers are validated and quoted; subquery text is
/// inserted verbatim with its arguments bound in order.

use super::{check_identifier, escape_like, COUNT_FIELD};
use crate::condition::{BasicCondition, Condition, Logic, Operator, SubQuery};
use crate::query::{Direction, JoinKind, LockMode, Query};
use crate::schema::EntitySchema;
use crate::{Error, Item, Result, Value};
use tracing::debug;

/// Target SQL dialect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    Postgres,
    MySql,
    #[default]
    Sqlite,
}

impl Dialect {
    fn quote(&self) -> char {
        match self {
            Dialect::MySql => '`',
            Dialect::Postgres | Dialect::Sqlite => '"',
        }
    }

    fn like_escape_clause(&self) -> &'static str {
        match self {
            // MySQL treats backslash as an escape inside string literals
            Dialect::MySql => " ESCAPE '\\\\'",
            Dialect::Postgres | Dialect::Sqlite => " ESCAPE '\\'",
        }
    }
}

/// A compiled statement ready for execution
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledStatement {
    pub sql: String,
    pub params: Vec<Value>,
    /// Relation names for the external preload collaborator
    pub preloads: Vec<String>,
}

/// Accumulates SQL text and bound parameters
struct SqlWriter {
    dialect: Dialect,
    sql: String,
    params: Vec<Value>,
}

impl SqlWriter {
    fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            sql: String::new(),
            params: Vec::new(),
        }
    }

    fn push(&mut self, s: &str) {
        self.sql.push_str(s);
    }

    fn bind(&mut self, value: &Value) {
        self.params.push(value.clone());
        match self.dialect {
            Dialect::Postgres => {
                let n = self.params.len();
                self.sql.push('$');
                self.sql.push_str(&n.to_string());
            }
            Dialect::MySql | Dialect::Sqlite => self.sql.push('?'),
        }
    }

    /// Append raw subquery text. `?` placeholders outside string literals are
    /// renumbered for Postgres; the text is otherwise untouched. The
    /// placeholder count must equal the number of args.
    fn push_raw(&mut self, raw: &str, args: &[Value]) -> Result<()> {
        let placeholders = count_placeholders(raw);
        if placeholders != args.len() {
            return Err(Error::validation(format!(
                "subquery has {} placeholders but {} args",
                placeholders,
                args.len()
            )));
        }
        if self.dialect != Dialect::Postgres {
            self.sql.push_str(raw);
            self.params.extend(args.iter().cloned());
            return Ok(());
        }
        let base = self.params.len();
        let mut n = 0usize;
        let mut in_literal = false;
        for ch in raw.chars() {
            match ch {
                '\'' => {
                    in_literal = !in_literal;
                    self.sql.push(ch);
                }
                '?' if !in_literal => {
                    n += 1;
                    self.sql.push('$');
                    self.sql.push_str(&(base + n).to_string());
                }
                _ => self.sql.push(ch),
            }
        }
        self.params.extend(args.iter().cloned());
        Ok(())
    }

    fn finish(self, preloads: Vec<String>) -> CompiledStatement {
        CompiledStatement {
            sql: self.sql,
            params: self.params,
            preloads,
        }
    }
}

/// `?` placeholders outside single-quoted literals
fn count_placeholders(raw: &str) -> usize {
    let mut in_literal = false;
    raw.chars()
        .filter(|&ch| {
            if ch == '\'' {
                in_literal = !in_literal;
            }
            ch == '?' && !in_literal
        })
        .count()
}

/// Relational compiler
#[derive(Debug, Clone, Copy)]
pub struct SqlCompiler<'s> {
    dialect: Dialect,
    schema: Option<&'s EntitySchema>,
}

impl<'s> SqlCompiler<'s> {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            schema: None,
        }
    }

    /// Map logical fields to columns through `schema`
    pub fn with_schema(mut self, schema: &'s EntitySchema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// Compile only the boolean predicate of `conditions` (implicit AND)
    pub fn compile_predicate(&self, conditions: &[Condition]) -> Result<CompiledStatement> {
        let mut w = SqlWriter::new(self.dialect);
        self.write_conjunction(&mut w, conditions, false)?;
        Ok(w.finish(Vec::new()))
    }

    pub fn compile_select(&self, table: &str, query: &Query) -> Result<CompiledStatement> {
        query.validate()?;
        let mut w = SqlWriter::new(self.dialect);
        self.write_select(&mut w, table, query, true)?;
        let stmt = w.finish(query.preloads.clone());
        debug!(sql = %stmt.sql, params = stmt.params.len(), "compiled select");
        Ok(stmt)
    }

    /// COUNT of matching rows (paging and ordering ignored)
    pub fn compile_count(&self, table: &str, query: &Query) -> Result<CompiledStatement> {
        query.validate()?;
        let query = query.unpaged();
        let mut w = SqlWriter::new(self.dialect);
        if query.is_grouped() || (query.distinct && !query.select.is_empty()) {
            w.push("SELECT COUNT(*) FROM (");
            self.write_select(&mut w, table, &query, false)?;
            w.push(") AS counted");
        } else {
            w.push("SELECT COUNT(*) FROM ");
            w.push(&self.quote(table)?);
            self.write_joins(&mut w, &query)?;
            self.write_where(&mut w, &query.conditions)?;
        }
        Ok(w.finish(Vec::new()))
    }

    /// `SELECT 1 ... LIMIT 1`; a returned row means a match exists.
    ///
    /// Grouped, HAVING, DISTINCT and offset queries wrap the full select so
    /// the answer agrees with `compile_select` on the same query. The limit
    /// itself is ignored.
    pub fn compile_exists(&self, table: &str, query: &Query) -> Result<CompiledStatement> {
        query.validate()?;
        let mut w = SqlWriter::new(self.dialect);
        let wrapped = query.is_grouped()
            || !query.having.is_empty()
            || query.offset.is_some()
            || (query.distinct && !query.select.is_empty());
        if wrapped {
            w.push("SELECT 1 FROM (");
            self.write_select(&mut w, table, &query.unpaged(), false)?;
            w.push(") AS matched");
        } else {
            w.push("SELECT 1 FROM ");
            w.push(&self.quote(table)?);
            self.write_joins(&mut w, query)?;
            self.write_where(&mut w, &query.conditions)?;
        }
        match query.offset {
            Some(offset) => w.push(&format!(" LIMIT 1 OFFSET {}", offset)),
            None => w.push(" LIMIT 1"),
        }
        Ok(w.finish(Vec::new()))
    }

    /// DELETE by condition. Only conditions are meaningful here.
    pub fn compile_delete(&self, table: &str, query: &Query) -> Result<CompiledStatement> {
        query.validate()?;
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
        let mut w = SqlWriter::new(self.dialect);
        w.push("DELETE FROM ");
        w.push(&self.quote(table)?);
        self.write_where(&mut w, &query.conditions)?;
        Ok(w.finish(Vec::new()))
    }

    /// INSERT of one record. Columns are emitted in `columns` order.
    pub fn compile_insert(&self, table: &str, columns: &[&str], item: &Item) -> Result<CompiledStatement> {
        if columns.is_empty() {
            return Err(Error::invalid_argument("insert needs at least one column"));
        }
        let mut w = SqlWriter::new(self.dialect);
        w.push("INSERT INTO ");
        w.push(&self.quote(table)?);
        w.push(" (");
        for (i, field) in columns.iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            w.push(&self.column(field)?);
        }
        w.push(") VALUES (");
        for (i, field) in columns.iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            w.bind(item.get(*field).unwrap_or(&Value::Null));
        }
        w.push(")");
        Ok(w.finish(Vec::new()))
    }

    /// UPDATE of the given fields on the row whose primary key equals `id`
    pub fn compile_update(
        &self,
        table: &str,
        pk_field: &str,
        id: &Value,
        fields: &[(&str, &Value)],
    ) -> Result<CompiledStatement> {
        if fields.is_empty() {
            return Err(Error::invalid_argument("update needs at least one field"));
        }
        let mut w = SqlWriter::new(self.dialect);
        w.push("UPDATE ");
        w.push(&self.quote(table)?);
        w.push(" SET ");
        for (i, (field, value)) in fields.iter().enumerate() {
            if i > 0 {
                w.push(", ");
            }
            w.push(&self.column(field)?);
            w.push(" = ");
            w.bind(value);
        }
        w.push(" WHERE ");
        w.push(&self.column(pk_field)?);
        w.push(" = ");
        w.bind(id);
        Ok(w.finish(Vec::new()))
    }

    fn write_select(&self, w: &mut SqlWriter, table: &str, query: &Query, paged: bool) -> Result<()> {
        w.push("SELECT ");
        // DISTINCT without a projection is a no-op
        if query.distinct && !query.select.is_empty() {
            w.push("DISTINCT ");
        }
        self.write_projection(w, query)?;
        w.push(" FROM ");
        w.push(&self.quote(table)?);
        self.write_joins(w, query)?;
        self.write_where(w, &query.conditions)?;

        if query.is_grouped() {
            w.push(" GROUP BY ");
            let cols: Result<Vec<String>> = query.group_by.iter().map(|f| self.column(f)).collect();
            w.push(&cols?.join(", "));
        }
        if !query.having.is_empty() {
            if !query.is_grouped() {
                return Err(Error::validation("HAVING requires GROUP BY"));
            }
            w.push(" HAVING ");
            self.write_conjunction(w, &query.having, true)?;
        }

        if !query.sort.is_empty() {
            w.push(" ORDER BY ");
            for (i, key) in query.sort.iter().enumerate() {
                if i > 0 {
                    w.push(", ");
                }
                if query.is_grouped() && key.field == COUNT_FIELD {
                    w.push("COUNT(*)");
                } else {
                    w.push(&self.column(&key.field)?);
                }
                w.push(match key.direction {
                    Direction::Asc => " ASC",
                    Direction::Desc => " DESC",
                });
            }
        }

        if paged {
            self.write_paging(w, query);
            self.write_lock(w, query.lock)?;
        }
        Ok(())
    }

    fn write_projection(&self, w: &mut SqlWriter, query: &Query) -> Result<()> {
        if query.is_grouped() {
            for field in &query.select {
                if !query.group_by.contains(field) {
                    return Err(Error::validation(format!(
                        "selected field '{}' is not in GROUP BY",
                        field
                    )));
                }
            }
            let fields = if query.select.is_empty() { &query.group_by } else { &query.select };
            for field in fields {
                w.push(&self.column(field)?);
                w.push(", ");
            }
            w.push("COUNT(*) AS ");
            w.push(&self.quote(COUNT_FIELD)?);
            return Ok(());
        }
        if query.select.is_empty() {
            w.push("*");
            return Ok(());
        }
        let cols: Result<Vec<String>> = query.select.iter().map(|f| self.column(f)).collect();
        w.push(&cols?.join(", "));
        Ok(())
    }

    fn write_joins(&self, w: &mut SqlWriter, query: &Query) -> Result<()> {
        for join in &query.joins {
            w.push(match join.kind {
                JoinKind::Inner => " INNER JOIN ",
                JoinKind::Left => " LEFT JOIN ",
                JoinKind::Right => " RIGHT JOIN ",
                JoinKind::Full => " FULL JOIN ",
            });
            if self.dialect == Dialect::MySql && join.kind == JoinKind::Full {
                return Err(Error::unsupported("MySQL has no FULL JOIN"));
            }
            w.push(&self.quote(&join.table)?);
            w.push(" ON ");
            w.push(&join.on);
        }
        Ok(())
    }

    fn write_where(&self, w: &mut SqlWriter, conditions: &[Condition]) -> Result<()> {
        if conditions.is_empty() {
            return Ok(());
        }
        w.push(" WHERE ");
        self.write_conjunction(w, conditions, false)
    }

    fn write_conjunction(&self, w: &mut SqlWriter, conditions: &[Condition], having: bool) -> Result<()> {
        if conditions.is_empty() {
            w.push("1 = 1");
            return Ok(());
        }
        for (i, condition) in conditions.iter().enumerate() {
            if i > 0 {
                w.push(" AND ");
            }
            self.write_condition(w, condition, having)?;
        }
        Ok(())
    }

    fn write_condition(&self, w: &mut SqlWriter, condition: &Condition, having: bool) -> Result<()> {
        match condition {
            Condition::Basic(basic) => self.write_basic(w, basic, having),
            Condition::Composite(group) => {
                let children = &group.children;
                match (group.logic, children.len()) {
                    (Logic::And, 0) | (Logic::Not, 0) => {
                        w.push("1 = 1");
                        Ok(())
                    }
                    (Logic::Or, 0) => {
                        w.push("1 = 0");
                        Ok(())
                    }
                    (Logic::And, _) => self.write_group(w, children, " AND ", having),
                    (Logic::Or, _) => self.write_group(w, children, " OR ", having),
                    (Logic::Not, _) => {
                        // NOT over several children is NOR
                        w.push("NOT ");
                        self.write_group(w, children, " OR ", having)
                    }
                }
            }
            Condition::SubQuery(sub) => self.write_subquery(w, sub),
        }
    }

    fn write_group(&self, w: &mut SqlWriter, children: &[Condition], joiner: &str, having: bool) -> Result<()> {
        w.push("(");
        for (i, child) in children.iter().enumerate() {
            if i > 0 {
                w.push(joiner);
            }
            self.write_condition(w, child, having)?;
        }
        w.push(")");
        Ok(())
    }

    fn write_basic(&self, w: &mut SqlWriter, c: &BasicCondition, having: bool) -> Result<()> {
        c.validate()?;
        let col = if having && c.field == COUNT_FIELD {
            "COUNT(*)".to_string()
        } else {
            self.column(&c.field)?
        };

        match c.effective_op() {
            Operator::Equal => self.write_binary(w, &col, "=", &c.value),
            Operator::NotEqual => self.write_binary(w, &col, "<>", &c.value),
            Operator::GreaterThan => self.write_binary(w, &col, ">", &c.value),
            Operator::GreaterThanOrEqual => self.write_binary(w, &col, ">=", &c.value),
            Operator::LessThan => self.write_binary(w, &col, "<", &c.value),
            Operator::LessThanOrEqual => self.write_binary(w, &col, "<=", &c.value),
            Operator::Like => self.write_binary(w, &col, "LIKE", &c.value),
            Operator::NotLike => self.write_binary(w, &col, "NOT LIKE", &c.value),
            Operator::In | Operator::NotIn => {
                let negated = c.effective_op() == Operator::NotIn;
                let items = c.value.as_list().unwrap_or(&[]);
                if items.is_empty() {
                    // IN () is not portable SQL
                    if negated {
                        w.push(&col);
                        w.push(" IS NOT NULL");
                    } else {
                        w.push("1 = 0");
                    }
                    return Ok(());
                }
                w.push(&col);
                w.push(if negated { " NOT IN (" } else { " IN (" });
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        w.push(", ");
                    }
                    w.bind(item);
                }
                w.push(")");
            }
            Operator::IsNull => {
                w.push(&col);
                w.push(" IS NULL");
            }
            Operator::IsNotNull => {
                w.push(&col);
                w.push(" IS NOT NULL");
            }
            Operator::Between | Operator::NotBetween => {
                let (low, high) = c.between_bounds()?;
                w.push(&col);
                w.push(if c.effective_op() == Operator::Between {
                    " BETWEEN "
                } else {
                    " NOT BETWEEN "
                });
                w.bind(low);
                w.push(" AND ");
                w.bind(high);
            }
            Operator::Contains | Operator::StartsWith | Operator::EndsWith => {
                let literal = escape_like(c.value.as_str().unwrap_or_default());
                let pattern = match c.effective_op() {
                    Operator::Contains => format!("%{}%", literal),
                    Operator::StartsWith => format!("{}%", literal),
                    _ => format!("%{}", literal),
                };
                w.push(&col);
                w.push(" LIKE ");
                w.bind(&Value::String(pattern));
                w.push(self.dialect.like_escape_clause());
            }
            Operator::Regex => {
                let op = match self.dialect {
                    Dialect::Postgres => "~",
                    Dialect::MySql | Dialect::Sqlite => "REGEXP",
                };
                self.write_binary(w, &col, op, &c.value);
            }
            Operator::Exists
            | Operator::NotExists
            | Operator::InSubquery
            | Operator::NotInSubquery => {
                return Err(Error::validation(format!(
                    "operator {} requires a subquery condition",
                    c.op
                )));
            }
        }
        Ok(())
    }

    fn write_binary(&self, w: &mut SqlWriter, col: &str, op: &str, value: &Value) {
        w.push(col);
        w.push(" ");
        w.push(op);
        w.push(" ");
        w.bind(value);
    }

    fn write_subquery(&self, w: &mut SqlWriter, sub: &SubQuery) -> Result<()> {
        sub.validate()?;
        let prefix = match (&sub.field, sub.op) {
            (None, Operator::Exists) => "EXISTS (".to_string(),
            (None, Operator::NotExists) => "NOT EXISTS (".to_string(),
            (Some(field), Operator::InSubquery) => format!("{} IN (", self.column(field)?),
            (Some(field), Operator::NotInSubquery) => format!("{} NOT IN (", self.column(field)?),
            (Some(field), op) if op.is_comparison() => format!("{} {} (", self.column(field)?, op),
            (_, op) => {
                return Err(Error::validation(format!(
                    "subquery cannot be rendered with operator {}",
                    op
                )))
            }
        };
        w.push(&prefix);
        w.push_raw(&sub.raw, &sub.args)?;
        w.push(")");
        Ok(())
    }

    fn write_paging(&self, w: &mut SqlWriter, query: &Query) {
        match (query.limit, query.offset) {
            (None, None) => {}
            (Some(limit), None) => w.push(&format!(" LIMIT {}", limit)),
            (Some(limit), Some(offset)) => w.push(&format!(" LIMIT {} OFFSET {}", limit, offset)),
            (None, Some(offset)) => match self.dialect {
                Dialect::Postgres => w.push(&format!(" OFFSET {}", offset)),
                Dialect::MySql => w.push(&format!(" LIMIT 18446744073709551615 OFFSET {}", offset)),
                Dialect::Sqlite => w.push(&format!(" LIMIT -1 OFFSET {}", offset)),
            },
        }
    }

    fn write_lock(&self, w: &mut SqlWriter, lock: LockMode) -> Result<()> {
        match (self.dialect, lock) {
            (_, LockMode::None) => Ok(()),
            (Dialect::Postgres, LockMode::ForUpdate) | (Dialect::MySql, LockMode::ForUpdate) => {
                w.push(" FOR UPDATE");
                Ok(())
            }
            (Dialect::Postgres, LockMode::ForShare) => {
                w.push(" FOR SHARE");
                Ok(())
            }
            (Dialect::MySql, LockMode::ForShare) => {
                w.push(" LOCK IN SHARE MODE");
                Ok(())
            }
            (Dialect::Sqlite, mode) => Err(Error::unsupported(format!(
                "SQLite does not support row lock mode {:?}",
                mode
            ))),
        }
    }

    /// Quoted column for a logical field
    fn column(&self, field: &str) -> Result<String> {
        let column = match self.schema {
            Some(schema) => schema.column_for(field),
            None => field,
        };
        self.quote(column)
    }

    fn quote(&self, ident: &str) -> Result<String> {
        check_identifier(ident)?;
        let q = self.dialect.quote();
        Ok(ident
            .split('.')
            .map(|part| format!("{q}{part}{q}"))
            .collect::<Vec<_>>()
            .join("."))
    }
}
