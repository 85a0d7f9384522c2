/// Query descriptor and composable query options
///
/// A `Query` accumulates everything one request needs before compilation:
/// conditions (implicitly AND-ed), sort keys, paging, projection, grouping,
/// joins, preloads, DISTINCT and lock mode. It is immutable once built and
/// safe to share across threads.
///
/// # Examples
///
/// ```
/// use pstore_core::query::{opts::*, Direction, Query};
/// use pstore_core::Operator;
///
/// let query = Query::from_options([
///     where_("age", Operator::GreaterThan, 22).into(),
///     order_by("age", Direction::Asc),
///     limit(10),
/// ]);
/// assert_eq!(query.conditions.len(), 1);
/// assert_eq!(query.limit, Some(10));
/// ```

use crate::condition::{Condition, Logic, Operator, SubQuery, SubQueryKind};
use crate::{Result, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey {
    pub field: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    Left,
    Right,
    Full,
}

/// Relational join; `on` is raw engine text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    pub kind: JoinKind,
    pub table: String,
    pub on: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LockMode {
    #[default]
    None,
    ForUpdate,
    ForShare,
}

/// The accumulated, immutable representation of one query request
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    pub conditions: Vec<Condition>,
    pub sort: Vec<SortKey>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub select: Vec<String>,
    pub group_by: Vec<String>,
    pub having: Vec<Condition>,
    pub joins: Vec<Join>,
    pub preloads: Vec<String>,
    pub distinct: bool,
    pub lock: LockMode,
}

/// One composable query option
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOption {
    Where(Condition),
    OrderBy(SortKey),
    Limit(usize),
    Offset(usize),
    Select(Vec<String>),
    Distinct,
    GroupBy(Vec<String>),
    Having(Condition),
    Join(Join),
    Preload(Vec<String>),
    Lock(LockMode),
}

impl From<Condition> for QueryOption {
    fn from(c: Condition) -> Self {
        QueryOption::Where(c)
    }
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a sequence of options into one descriptor
    pub fn from_options<I, O>(options: I) -> Self
    where
        I: IntoIterator<Item = O>,
        O: Into<QueryOption>,
    {
        options
            .into_iter()
            .fold(Self::new(), |query, option| query.apply(option.into()))
    }

    pub fn apply(mut self, option: QueryOption) -> Self {
        match option {
            QueryOption::Where(c) => self.conditions.push(c),
            QueryOption::OrderBy(key) => self.sort.push(key),
            QueryOption::Limit(n) => self.limit = Some(n),
            QueryOption::Offset(n) => self.offset = Some(n),
            QueryOption::Select(fields) => self.select.extend(fields),
            QueryOption::Distinct => self.distinct = true,
            QueryOption::GroupBy(fields) => self.group_by.extend(fields),
            QueryOption::Having(c) => self.having.push(c),
            QueryOption::Join(join) => self.joins.push(join),
            QueryOption::Preload(names) => self.preloads.extend(names),
            QueryOption::Lock(mode) => self.lock = mode,
        }
        self
    }

    /// Add a condition (implicitly AND-ed with the others)
    pub fn filter(self, condition: impl Into<Condition>) -> Self {
        self.apply(QueryOption::Where(condition.into()))
    }

    /// Shorthand for `filter(where_(field, op, value))`
    pub fn where_(self, field: &str, op: Operator, value: impl Into<Value>) -> Self {
        self.filter(Condition::basic(field, op, value))
    }

    pub fn order_by(self, field: &str, direction: Direction) -> Self {
        self.apply(opts::order_by(field, direction))
    }

    pub fn limit(self, n: usize) -> Self {
        self.apply(QueryOption::Limit(n))
    }

    pub fn offset(self, n: usize) -> Self {
        self.apply(QueryOption::Offset(n))
    }

    pub fn select(self, fields: &[&str]) -> Self {
        self.apply(opts::select(fields))
    }

    pub fn distinct(self) -> Self {
        self.apply(QueryOption::Distinct)
    }

    pub fn group_by(self, fields: &[&str]) -> Self {
        self.apply(opts::group_by(fields))
    }

    pub fn having(self, condition: Condition) -> Self {
        self.apply(QueryOption::Having(condition))
    }

    pub fn join(self, kind: JoinKind, table: &str, on: &str) -> Self {
        self.apply(opts::join(kind, table, on))
    }

    pub fn preload(self, names: &[&str]) -> Self {
        self.apply(opts::preload(names))
    }

    pub fn lock(self, mode: LockMode) -> Self {
        self.apply(QueryOption::Lock(mode))
    }

    /// The implicit top-level AND as one condition, if there is any
    pub fn combined_condition(&self) -> Option<Condition> {
        match self.conditions.as_slice() {
            [] => None,
            [single] => Some(single.clone()),
            many => Some(Condition::group(Logic::And, many.to_vec())),
        }
    }

    /// Validate every condition in the descriptor
    pub fn validate(&self) -> Result<()> {
        self.conditions
            .iter()
            .chain(self.having.iter())
            .try_for_each(Condition::validate)
    }

    pub fn is_grouped(&self) -> bool {
        !self.group_by.is_empty()
    }

    /// Copy of the descriptor without paging and ordering, used by COUNT
    pub fn unpaged(&self) -> Query {
        Query {
            sort: Vec::new(),
            limit: None,
            offset: None,
            ..self.clone()
        }
    }
}

/// Option constructors
pub mod opts {
    use super::*;

    /// `field op value`
    pub fn where_(field: &str, op: Operator, value: impl Into<Value>) -> Condition {
        Condition::basic(field, op, value)
    }

    pub fn and(conditions: impl IntoIterator<Item = Condition>) -> Condition {
        Condition::group(Logic::And, conditions)
    }

    pub fn or(conditions: impl IntoIterator<Item = Condition>) -> Condition {
        Condition::group(Logic::Or, conditions)
    }

    /// Negation; with several children this is NOR
    pub fn not(conditions: impl IntoIterator<Item = Condition>) -> Condition {
        Condition::group(Logic::Not, conditions)
    }

    pub fn order_by(field: &str, direction: Direction) -> QueryOption {
        QueryOption::OrderBy(SortKey {
            field: field.to_string(),
            direction,
        })
    }

    pub fn limit(n: usize) -> QueryOption {
        QueryOption::Limit(n)
    }

    pub fn offset(n: usize) -> QueryOption {
        QueryOption::Offset(n)
    }

    pub fn select(fields: &[&str]) -> QueryOption {
        QueryOption::Select(fields.iter().map(|f| f.to_string()).collect())
    }

    pub fn distinct() -> QueryOption {
        QueryOption::Distinct
    }

    pub fn group_by(fields: &[&str]) -> QueryOption {
        QueryOption::GroupBy(fields.iter().map(|f| f.to_string()).collect())
    }

    pub fn having(condition: Condition) -> QueryOption {
        QueryOption::Having(condition)
    }

    pub fn join(kind: JoinKind, table: &str, on: &str) -> QueryOption {
        QueryOption::Join(Join {
            kind,
            table: table.to_string(),
            on: on.to_string(),
        })
    }

    pub fn preload(names: &[&str]) -> QueryOption {
        QueryOption::Preload(names.iter().map(|n| n.to_string()).collect())
    }

    pub fn lock(mode: LockMode) -> QueryOption {
        QueryOption::Lock(mode)
    }

    pub fn exists_subquery(raw: &str, args: Vec<Value>) -> Condition {
        Condition::SubQuery(SubQuery {
            kind: SubQueryKind::Exists,
            field: None,
            op: Operator::Exists,
            raw: raw.to_string(),
            args,
            correlated: false,
        })
    }

    pub fn not_exists_subquery(raw: &str, args: Vec<Value>) -> Condition {
        Condition::SubQuery(SubQuery {
            kind: SubQueryKind::Exists,
            field: None,
            op: Operator::NotExists,
            raw: raw.to_string(),
            args,
            correlated: false,
        })
    }

    pub fn in_subquery(field: &str, raw: &str, args: Vec<Value>) -> Condition {
        Condition::SubQuery(SubQuery {
            kind: SubQueryKind::In,
            field: Some(field.to_string()),
            op: Operator::InSubquery,
            raw: raw.to_string(),
            args,
            correlated: false,
        })
    }

    pub fn not_in_subquery(field: &str, raw: &str, args: Vec<Value>) -> Condition {
        Condition::SubQuery(SubQuery {
            kind: SubQueryKind::In,
            field: Some(field.to_string()),
            op: Operator::NotInSubquery,
            raw: raw.to_string(),
            args,
            correlated: false,
        })
    }

    /// `field op (scalar subquery)`
    pub fn where_subquery(field: &str, op: Operator, raw: &str, args: Vec<Value>) -> Condition {
        Condition::SubQuery(SubQuery {
            kind: SubQueryKind::Scalar,
            field: Some(field.to_string()),
            op,
            raw: raw.to_string(),
            args,
            correlated: false,
        })
    }

    /// Subquery whose text references the outer row
    pub fn correlated_subquery(field: Option<&str>, op: Operator, raw: &str, args: Vec<Value>) -> Condition {
        Condition::SubQuery(SubQuery {
            kind: SubQueryKind::Correlated,
            field: field.map(str::to_string),
            op,
            raw: raw.to_string(),
            args,
            correlated: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::opts::*;
    use super::*;

    #[test]
    fn test_sort_keys_keep_order() {
        let query = Query::from_options([
            order_by("last_name", Direction::Asc),
            order_by("age", Direction::Desc),
        ]);
        assert_eq!(query.sort[0].field, "last_name");
        assert_eq!(query.sort[1].direction, Direction::Desc);
    }

    #[test]
    fn test_limit_offset_last_write_wins() {
        let query = Query::from_options([limit(5), offset(1), limit(3), offset(2)]);
        assert_eq!(query.limit, Some(3));
        assert_eq!(query.offset, Some(2));
    }

    #[test]
    fn test_conditions_accumulate() {
        let query = Query::new()
            .where_("status", Operator::Equal, "active")
            .filter(or([
                where_("age", Operator::GreaterThan, 20),
                where_("vip", Operator::Equal, true),
            ]));
        assert_eq!(query.conditions.len(), 2);
        assert!(matches!(
            query.combined_condition(),
            Some(Condition::Composite(ref g)) if g.logic == Logic::And && g.children.len() == 2
        ));
    }

    #[test]
    fn test_builder_and_options_agree() {
        let built = Query::new()
            .where_("age", Operator::GreaterThan, 22)
            .order_by("age", Direction::Asc)
            .limit(3)
            .offset(2)
            .select(&["id", "age"])
            .distinct()
            .lock(LockMode::ForUpdate);

        let folded = Query::from_options([
            where_("age", Operator::GreaterThan, 22).into(),
            order_by("age", Direction::Asc),
            limit(3),
            offset(2),
            select(&["id", "age"]),
            distinct(),
            lock(LockMode::ForUpdate),
        ]);
        assert_eq!(built, folded);
    }

    #[test]
    fn test_unpaged_drops_paging() {
        let query = Query::new().where_("a", Operator::Equal, 1).limit(2).offset(4).order_by("a", Direction::Asc);
        let unpaged = query.unpaged();
        assert_eq!(unpaged.limit, None);
        assert_eq!(unpaged.offset, None);
        assert!(unpaged.sort.is_empty());
        assert_eq!(unpaged.conditions, query.conditions);
    }

    #[test]
    fn test_subquery_constructors() {
        let c = in_subquery("user_id", "SELECT id FROM users WHERE active = ?", vec![Value::Bool(true)]);
        assert!(c.validate().is_ok());
        assert!(c.has_subquery());
    }
}
