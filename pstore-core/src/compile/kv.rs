/// In-process matcher for key-value stores
///
/// Key-value backends have no predicate language, so a query compiles to a
/// plan that is evaluated against every enumerated record. Evaluation uses
/// SQL three-valued logic: a comparison against a missing or null field is
/// unknown, and a record matches only when its condition is definitely true.
/// Ordering and paging run after the full predicate pass.

use super::{like_matches, COUNT_FIELD};
use crate::condition::{Condition, Logic, Operator};
use crate::query::{Direction, LockMode, Query, SortKey};
use crate::{Error, Item, Result, Value};
use regex::Regex;
use std::cmp::Ordering;
use tracing::debug;

/// Kleene truth value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Truth {
    True,
    False,
    Unknown,
}

impl Truth {
    fn from_bool(b: bool) -> Self {
        if b {
            Truth::True
        } else {
            Truth::False
        }
    }

    pub fn and(self, other: Truth) -> Truth {
        match (self, other) {
            (Truth::False, _) | (_, Truth::False) => Truth::False,
            (Truth::True, Truth::True) => Truth::True,
            _ => Truth::Unknown,
        }
    }

    pub fn or(self, other: Truth) -> Truth {
        match (self, other) {
            (Truth::True, _) | (_, Truth::True) => Truth::True,
            (Truth::False, Truth::False) => Truth::False,
            _ => Truth::Unknown,
        }
    }

    pub fn not(self) -> Truth {
        match self {
            Truth::True => Truth::False,
            Truth::False => Truth::True,
            Truth::Unknown => Truth::Unknown,
        }
    }

    pub fn is_true(self) -> bool {
        self == Truth::True
    }
}

/// Condition tree with regexes compiled once per plan
#[derive(Debug, Clone)]
enum Node {
    Basic {
        field: String,
        op: Operator,
        value: Value,
        regex: Option<Regex>,
    },
    Group {
        logic: Logic,
        children: Vec<Node>,
    },
}

impl Node {
    fn compile(condition: &Condition) -> Result<Node> {
        match condition {
            Condition::Basic(basic) => {
                basic.validate()?;
                let op = basic.effective_op();
                let regex = match op {
                    Operator::Regex => {
                        let pattern = basic.value.as_str().unwrap_or_default();
                        Some(Regex::new(pattern).map_err(|e| Error::validation(e.to_string()))?)
                    }
                    _ => None,
                };
                Ok(Node::Basic {
                    field: basic.field.clone(),
                    op,
                    value: basic.value.clone(),
                    regex,
                })
            }
            Condition::Composite(group) => Ok(Node::Group {
                logic: group.logic,
                children: group.children.iter().map(Node::compile).collect::<Result<_>>()?,
            }),
            Condition::SubQuery(_) => Err(Error::unsupported(
                "subquery conditions are not supported by the key-value backend",
            )),
        }
    }

    fn eval(&self, item: &Item) -> Truth {
        match self {
            Node::Basic { field, op, value, regex } => {
                eval_basic(item.get(field).unwrap_or(&Value::Null), *op, value, regex.as_ref())
            }
            Node::Group { logic, children } => match logic {
                Logic::And => children
                    .iter()
                    .fold(Truth::True, |acc, c| acc.and(c.eval(item))),
                Logic::Or => children
                    .iter()
                    .fold(Truth::False, |acc, c| acc.or(c.eval(item))),
                // NOT over several children is NOR; NOT of nothing is true
                Logic::Not => {
                    if children.is_empty() {
                        Truth::True
                    } else {
                        children
                            .iter()
                            .fold(Truth::False, |acc, c| acc.or(c.eval(item)))
                            .not()
                    }
                }
            },
        }
    }
}

fn eval_basic(actual: &Value, op: Operator, expected: &Value, regex: Option<&Regex>) -> Truth {
    let null_test = matches!(op, Operator::IsNull | Operator::IsNotNull);
    if actual.is_null() && !null_test {
        return Truth::Unknown;
    }

    let cmp = |other: &Value| actual.coerced_cmp(other);
    let text = || actual.coerce_string();
    let pattern = || expected.as_str().unwrap_or_default();

    match op {
        Operator::Equal => ordering_truth(cmp(expected), |o| o == Ordering::Equal),
        Operator::NotEqual => ordering_truth(cmp(expected), |o| o != Ordering::Equal),
        Operator::GreaterThan => ordering_truth(cmp(expected), |o| o == Ordering::Greater),
        Operator::GreaterThanOrEqual => ordering_truth(cmp(expected), |o| o != Ordering::Less),
        Operator::LessThan => ordering_truth(cmp(expected), |o| o == Ordering::Less),
        Operator::LessThanOrEqual => ordering_truth(cmp(expected), |o| o != Ordering::Greater),
        Operator::In | Operator::NotIn => {
            let found = expected
                .as_list()
                .unwrap_or(&[])
                .iter()
                .any(|candidate| cmp(candidate) == Some(Ordering::Equal));
            Truth::from_bool(found == (op == Operator::In))
        }
        Operator::Between | Operator::NotBetween => match expected.as_list() {
            Some([low, high]) => {
                let inside = ordering_truth(cmp(low), |o| o != Ordering::Less)
                    .and(ordering_truth(cmp(high), |o| o != Ordering::Greater));
                if op == Operator::Between {
                    inside
                } else {
                    inside.not()
                }
            }
            _ => Truth::Unknown,
        },
        Operator::Like => Truth::from_bool(like_matches(&text(), pattern())),
        Operator::NotLike => Truth::from_bool(!like_matches(&text(), pattern())),
        Operator::Contains => Truth::from_bool(text().contains(pattern())),
        Operator::StartsWith => Truth::from_bool(text().starts_with(pattern())),
        Operator::EndsWith => Truth::from_bool(text().ends_with(pattern())),
        Operator::Regex => Truth::from_bool(regex.map_or(false, |re| re.is_match(&text()))),
        Operator::IsNull => Truth::from_bool(actual.is_null()),
        Operator::IsNotNull => Truth::from_bool(!actual.is_null()),
        // Rejected when the plan is compiled
        Operator::Exists
        | Operator::NotExists
        | Operator::InSubquery
        | Operator::NotInSubquery => Truth::Unknown,
    }
}

fn ordering_truth(ordering: Option<Ordering>, pred: impl Fn(Ordering) -> bool) -> Truth {
    match ordering {
        Some(o) => Truth::from_bool(pred(o)),
        None => Truth::Unknown,
    }
}

/// Nulls sort first ascending
fn compare_for_sort(a: &Value, b: &Value) -> Ordering {
    match (a.is_null(), b.is_null()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.coerced_cmp(b).unwrap_or(Ordering::Equal),
    }
}

/// Compiles a `Query` for in-process evaluation
pub struct KvMatcher;

impl KvMatcher {
    pub fn compile(query: &Query) -> Result<KvPlan> {
        query.validate()?;
        if !query.joins.is_empty() {
            return Err(Error::unsupported("joins are not supported by the key-value backend"));
        }
        if !query.preloads.is_empty() {
            return Err(Error::unsupported("preloads are not supported by the key-value backend"));
        }
        if query.lock != LockMode::None {
            return Err(Error::unsupported("row locks are not supported by the key-value backend"));
        }
        if !query.having.is_empty() && !query.is_grouped() {
            return Err(Error::validation("HAVING requires GROUP BY"));
        }
        if query.is_grouped() {
            if let Some(field) = query.select.iter().find(|f| !query.group_by.contains(f)) {
                return Err(Error::validation(format!(
                    "selected field '{}' is not in GROUP BY",
                    field
                )));
            }
        }

        let plan = KvPlan {
            filter: query.conditions.iter().map(Node::compile).collect::<Result<_>>()?,
            having: query.having.iter().map(Node::compile).collect::<Result<_>>()?,
            sort: query.sort.clone(),
            limit: query.limit,
            offset: query.offset,
            select: query.select.clone(),
            group_by: query.group_by.clone(),
            distinct: query.distinct,
        };
        debug!(
            conditions = plan.filter.len(),
            grouped = !plan.group_by.is_empty(),
            "compiled key-value plan"
        );
        Ok(plan)
    }
}

/// Executable in-process plan
#[derive(Debug, Clone)]
pub struct KvPlan {
    filter: Vec<Node>,
    having: Vec<Node>,
    sort: Vec<SortKey>,
    limit: Option<usize>,
    offset: Option<usize>,
    select: Vec<String>,
    group_by: Vec<String>,
    distinct: bool,
}

impl KvPlan {
    /// Three-valued result of the implicit AND of all conditions
    pub fn evaluate(&self, item: &Item) -> Truth {
        self.filter
            .iter()
            .fold(Truth::True, |acc, node| acc.and(node.eval(item)))
    }

    pub fn matches(&self, item: &Item) -> bool {
        self.evaluate(item).is_true()
    }

    /// Filter, group or deduplicate, sort, page and project `records`
    pub fn execute(&self, records: Vec<Item>) -> Vec<Item> {
        let matched: Vec<Item> = records.into_iter().filter(|r| self.matches(r)).collect();

        if !self.group_by.is_empty() {
            let groups = self.group(matched);
            return self.page(self.sorted(groups));
        }
        if self.distinct && !self.select.is_empty() {
            let mut unique: Vec<Item> = Vec::new();
            for record in matched {
                let projected = self.project(record);
                if !unique.contains(&projected) {
                    unique.push(projected);
                }
            }
            return self.page(self.sorted(unique));
        }

        self.page(self.sorted(matched))
            .into_iter()
            .map(|r| if self.select.is_empty() { r } else { self.project(r) })
            .collect()
    }

    fn group(&self, records: Vec<Item>) -> Vec<Item> {
        let mut groups: Vec<(Vec<Value>, i64)> = Vec::new();
        for record in &records {
            let key: Vec<Value> = self
                .group_by
                .iter()
                .map(|f| record.get(f).cloned().unwrap_or(Value::Null))
                .collect();
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, n)) => *n += 1,
                None => groups.push((key, 1)),
            }
        }

        let output = if self.select.is_empty() { &self.group_by } else { &self.select };
        groups
            .into_iter()
            .map(|(key, n)| {
                let mut item: Item = self
                    .group_by
                    .iter()
                    .cloned()
                    .zip(key)
                    .filter(|(f, _)| output.contains(f))
                    .collect();
                item.insert(COUNT_FIELD.to_string(), Value::Int(n));
                item
            })
            .filter(|item| {
                self.having
                    .iter()
                    .fold(Truth::True, |acc, node| acc.and(node.eval(item)))
                    .is_true()
            })
            .collect()
    }

    fn sorted(&self, mut records: Vec<Item>) -> Vec<Item> {
        if self.sort.is_empty() {
            return records;
        }
        // sort_by is stable
        records.sort_by(|a, b| {
            for key in &self.sort {
                let left = a.get(&key.field).unwrap_or(&Value::Null);
                let right = b.get(&key.field).unwrap_or(&Value::Null);
                let ord = match key.direction {
                    Direction::Asc => compare_for_sort(left, right),
                    Direction::Desc => compare_for_sort(right, left),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
        records
    }

    fn page(&self, records: Vec<Item>) -> Vec<Item> {
        let skip = self.offset.unwrap_or(0);
        let take = self.limit.unwrap_or(usize::MAX);
        records.into_iter().skip(skip).take(take).collect()
    }

    fn project(&self, mut record: Item) -> Item {
        record.retain(|field, _| self.select.contains(field));
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::opts::*;
    use crate::{ErrorKind, ItemBuilder};

    fn people() -> Vec<Item> {
        vec![
            ItemBuilder::new().set("id", 1).set("name", "alice").set("age", 20).set("status", "active").build(),
            ItemBuilder::new().set("id", 2).set("name", "bob").set("age", 25).set("status", "pending").build(),
            ItemBuilder::new().set("id", 3).set("name", "carol").set("age", 30).set("status", "active").build(),
            ItemBuilder::new().set("id", 4).set("name", "dave").null("age").set("status", "inactive").build(),
        ]
    }

    fn ids(records: &[Item]) -> Vec<i64> {
        records.iter().filter_map(|r| r.get("id").and_then(Value::as_i64)).collect()
    }

    fn run(query: Query) -> Vec<Item> {
        KvMatcher::compile(&query).unwrap().execute(people())
    }

    #[test]
    fn test_comparison() {
        let out = run(Query::new().where_("age", Operator::GreaterThan, 22));
        assert_eq!(ids(&out), vec![2, 3]);
    }

    #[test]
    fn test_nested_logic() {
        let out = run(Query::new().filter(and([
            or([
                where_("status", Operator::Equal, "active"),
                where_("status", Operator::Equal, "pending"),
            ]),
            where_("age", Operator::GreaterThan, 23),
        ])));
        assert_eq!(ids(&out), vec![2, 3]);
    }

    #[test]
    fn test_null_is_unknown() {
        // dave has no age: neither `age <> 20` nor `NOT (age = 20)` matches him
        let ne = run(Query::new().where_("age", Operator::NotEqual, 20));
        assert_eq!(ids(&ne), vec![2, 3]);

        let negated = run(Query::new().filter(not([where_("age", Operator::Equal, 20)])));
        assert_eq!(ids(&negated), vec![2, 3]);

        let not_in = run(Query::new().where_("age", Operator::NotIn, vec![25]));
        assert_eq!(ids(&not_in), vec![1, 3]);

        let is_null = run(Query::new().where_("age", Operator::IsNull, Value::Null));
        assert_eq!(ids(&is_null), vec![4]);
    }

    #[test]
    fn test_nor() {
        let out = run(Query::new().filter(not([
            where_("status", Operator::Equal, "active"),
            where_("age", Operator::GreaterThan, 24),
        ])));
        // bob is pending but 25; dave is inactive with unknown age
        assert!(ids(&out).is_empty());
    }

    #[test]
    fn test_patterns() {
        assert_eq!(ids(&run(Query::new().where_("name", Operator::Like, "%aro%"))), vec![3]);
        assert_eq!(ids(&run(Query::new().where_("name", Operator::Like, "b_b"))), vec![2]);
        assert_eq!(ids(&run(Query::new().where_("name", Operator::StartsWith, "da"))), vec![4]);
        assert_eq!(ids(&run(Query::new().where_("name", Operator::Regex, "^[ab]"))), vec![1, 2]);
    }

    #[test]
    fn test_between_and_in() {
        assert_eq!(ids(&run(Query::new().where_("age", Operator::Between, vec![20, 25]))), vec![1, 2]);
        assert_eq!(ids(&run(Query::new().where_("age", Operator::NotBetween, vec![20, 25]))), vec![3]);
        assert!(run(Query::new().where_("id", Operator::In, Vec::<Value>::new())).is_empty());
        assert_eq!(run(Query::new().where_("id", Operator::NotIn, Vec::<Value>::new())).len(), 4);
    }

    #[test]
    fn test_sort_nulls_first_and_paging() {
        let out = run(Query::new().order_by("age", Direction::Asc));
        assert_eq!(ids(&out), vec![4, 1, 2, 3]);

        let out = run(Query::new().order_by("age", Direction::Desc).limit(2).offset(1));
        assert_eq!(ids(&out), vec![2, 1]);
    }

    #[test]
    fn test_grouping() {
        let out = run(Query::new()
            .group_by(&["status"])
            .having(where_("count", Operator::GreaterThan, 1)));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].get("status"), Some(&Value::string("active")));
        assert_eq!(out[0].get("count"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_distinct_projection() {
        let out = run(Query::new().select(&["status"]).distinct().order_by("status", Direction::Asc));
        let statuses: Vec<_> = out.iter().filter_map(|r| r.get("status").and_then(Value::as_str)).collect();
        assert_eq!(statuses, vec!["active", "inactive", "pending"]);
    }

    #[test]
    fn test_relational_only_features_rejected() {
        let sub = Query::new().filter(exists_subquery("SELECT 1 FROM t", vec![]));
        assert_eq!(KvMatcher::compile(&sub).unwrap_err().kind(), ErrorKind::Unsupported);

        let locked = Query::new().lock(LockMode::ForShare);
        assert_eq!(KvMatcher::compile(&locked).unwrap_err().kind(), ErrorKind::Unsupported);

        let bad = Query::new().where_("age", Operator::Between, vec![1, 2, 3]);
        assert_eq!(KvMatcher::compile(&bad).unwrap_err().kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_kleene_tables() {
        use Truth::*;
        assert_eq!(Unknown.and(False), False);
        assert_eq!(Unknown.and(True), Unknown);
        assert_eq!(Unknown.or(True), True);
        assert_eq!(Unknown.or(False), Unknown);
        assert_eq!(Unknown.not(), Unknown);
    }
}
