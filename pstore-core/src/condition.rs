/// Condition AST shared by every backend compiler
///
/// A condition is a basic predicate (`field op value`), a logical group
/// (AND / OR / NOT over ordered children) or a subquery predicate whose raw
/// text is relational-engine specific and opaque to the other backends.

use crate::{Error, Result, Value};
use regex::Regex;
use std::fmt;

/// Predicate operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Like,
    NotLike,
    In,
    NotIn,
    IsNull,
    IsNotNull,
    Between,
    NotBetween,
    Contains,
    StartsWith,
    EndsWith,
    Regex,
    Exists,
    NotExists,
    InSubquery,
    NotInSubquery,
}

impl Operator {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            Operator::Equal
                | Operator::NotEqual
                | Operator::GreaterThan
                | Operator::GreaterThanOrEqual
                | Operator::LessThan
                | Operator::LessThanOrEqual
        )
    }

    /// Operators that only make sense inside a subquery condition
    pub fn is_subquery_only(&self) -> bool {
        matches!(
            self,
            Operator::Exists | Operator::NotExists | Operator::InSubquery | Operator::NotInSubquery
        )
    }

    pub fn is_pattern(&self) -> bool {
        matches!(
            self,
            Operator::Like
                | Operator::NotLike
                | Operator::Contains
                | Operator::StartsWith
                | Operator::EndsWith
                | Operator::Regex
        )
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::Equal => "=",
            Operator::NotEqual => "<>",
            Operator::GreaterThan => ">",
            Operator::GreaterThanOrEqual => ">=",
            Operator::LessThan => "<",
            Operator::LessThanOrEqual => "<=",
            Operator::Like => "LIKE",
            Operator::NotLike => "NOT LIKE",
            Operator::In => "IN",
            Operator::NotIn => "NOT IN",
            Operator::IsNull => "IS NULL",
            Operator::IsNotNull => "IS NOT NULL",
            Operator::Between => "BETWEEN",
            Operator::NotBetween => "NOT BETWEEN",
            Operator::Contains => "CONTAINS",
            Operator::StartsWith => "STARTS WITH",
            Operator::EndsWith => "ENDS WITH",
            Operator::Regex => "REGEX",
            Operator::Exists => "EXISTS",
            Operator::NotExists => "NOT EXISTS",
            Operator::InSubquery => "IN (subquery)",
            Operator::NotInSubquery => "NOT IN (subquery)",
        };
        f.write_str(s)
    }
}

/// Logical combinators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Logic {
    And,
    Or,
    /// Negation; over more than one child this is NOR
    Not,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BasicCondition {
    pub field: String,
    pub op: Operator,
    pub value: Value,
}

impl BasicCondition {
    pub fn new(field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op,
            value: value.into(),
        }
    }

    /// Operator after null normalization: `= NULL` means IS NULL and
    /// `<> NULL` means IS NOT NULL on every backend.
    pub fn effective_op(&self) -> Operator {
        match (self.op, &self.value) {
            (Operator::Equal, Value::Null) => Operator::IsNull,
            (Operator::NotEqual, Value::Null) => Operator::IsNotNull,
            (op, _) => op,
        }
    }

    /// Checks that the value's shape matches the operator.
    ///
    /// Every compiler calls this first, so a malformed predicate fails the
    /// same way on every backend instead of compiling to a no-op.
    pub fn validate(&self) -> Result<()> {
        if self.field.is_empty() {
            return Err(Error::validation("condition field must not be empty"));
        }
        match self.effective_op() {
            Operator::Equal
            | Operator::NotEqual
            | Operator::GreaterThan
            | Operator::GreaterThanOrEqual
            | Operator::LessThan
            | Operator::LessThanOrEqual => {
                if !self.value.is_scalar() {
                    return Err(self.shape_error("a scalar value"));
                }
                if self.value.is_null() {
                    return Err(self.shape_error("a non-null value"));
                }
            }
            Operator::In | Operator::NotIn => {
                let items = self
                    .value
                    .as_list()
                    .ok_or_else(|| self.shape_error("a list of values"))?;
                if items.iter().any(|v| !v.is_scalar() || v.is_null()) {
                    return Err(self.shape_error("a list of non-null scalar values"));
                }
            }
            Operator::Between | Operator::NotBetween => {
                self.between_bounds()?;
            }
            Operator::Like
            | Operator::NotLike
            | Operator::Contains
            | Operator::StartsWith
            | Operator::EndsWith => {
                if self.value.as_str().is_none() {
                    return Err(self.shape_error("a string pattern"));
                }
            }
            Operator::Regex => {
                let pattern = self
                    .value
                    .as_str()
                    .ok_or_else(|| self.shape_error("a string pattern"))?;
                Regex::new(pattern).map_err(|e| {
                    Error::validation(format!("invalid regex for '{}': {}", self.field, e))
                })?;
            }
            Operator::IsNull | Operator::IsNotNull => {}
            Operator::Exists
            | Operator::NotExists
            | Operator::InSubquery
            | Operator::NotInSubquery => {
                return Err(Error::validation(format!(
                    "operator {} requires a subquery condition",
                    self.op
                )));
            }
        }
        Ok(())
    }

    /// The ordered `(low, high)` pair of a BETWEEN predicate
    pub fn between_bounds(&self) -> Result<(&Value, &Value)> {
        match self.value.as_list() {
            Some([low, high]) if low.is_scalar() && high.is_scalar() && !low.is_null() && !high.is_null() => {
                Ok((low, high))
            }
            _ => Err(self.shape_error("an ordered pair [low, high]")),
        }
    }

    fn shape_error(&self, expected: &str) -> Error {
        Error::validation(format!(
            "{} on '{}' expects {}, got {}",
            self.op,
            self.field,
            expected,
            self.value.type_name()
        ))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompositeCondition {
    pub logic: Logic,
    pub children: Vec<Condition>,
}

/// Subquery flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubQueryKind {
    Exists,
    In,
    Scalar,
    Correlated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubQuery {
    pub kind: SubQueryKind,
    /// Outer field compared against the subquery (IN / scalar forms)
    pub field: Option<String>,
    pub op: Operator,
    /// Relational-engine specific text, never parsed by the SQL compiler
    pub raw: String,
    pub args: Vec<Value>,
    pub correlated: bool,
}

impl SubQuery {
    pub fn validate(&self) -> Result<()> {
        if self.raw.trim().is_empty() {
            return Err(Error::validation("subquery text must not be empty"));
        }
        match self.kind {
            SubQueryKind::Exists => {
                if !matches!(self.op, Operator::Exists | Operator::NotExists) {
                    return Err(Error::validation(format!(
                        "EXISTS subquery cannot use operator {}",
                        self.op
                    )));
                }
            }
            SubQueryKind::In => {
                if !matches!(self.op, Operator::InSubquery | Operator::NotInSubquery) {
                    return Err(Error::validation(format!(
                        "IN subquery cannot use operator {}",
                        self.op
                    )));
                }
                self.require_field()?;
            }
            SubQueryKind::Scalar => {
                if !self.op.is_comparison() {
                    return Err(Error::validation(format!(
                        "scalar subquery needs a comparison operator, got {}",
                        self.op
                    )));
                }
                self.require_field()?;
            }
            SubQueryKind::Correlated => {
                if self.field.is_some() {
                    if !(self.op.is_comparison()
                        || matches!(self.op, Operator::InSubquery | Operator::NotInSubquery))
                    {
                        return Err(Error::validation(format!(
                            "correlated subquery on a field cannot use operator {}",
                            self.op
                        )));
                    }
                } else if !matches!(self.op, Operator::Exists | Operator::NotExists) {
                    return Err(Error::validation(
                        "correlated subquery without a field must be EXISTS or NOT EXISTS",
                    ));
                }
            }
        }
        Ok(())
    }

    fn require_field(&self) -> Result<&str> {
        match self.field.as_deref() {
            Some(f) if !f.is_empty() => Ok(f),
            _ => Err(Error::validation("subquery comparison requires a field")),
        }
    }
}

/// One node of the condition AST
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Basic(BasicCondition),
    Composite(CompositeCondition),
    SubQuery(SubQuery),
}

impl Condition {
    pub fn basic(field: impl Into<String>, op: Operator, value: impl Into<Value>) -> Self {
        Condition::Basic(BasicCondition::new(field, op, value))
    }

    pub fn group(logic: Logic, children: impl IntoIterator<Item = Condition>) -> Self {
        Condition::Composite(CompositeCondition {
            logic,
            children: children.into_iter().collect(),
        })
    }

    /// Validate the whole tree
    pub fn validate(&self) -> Result<()> {
        match self {
            Condition::Basic(basic) => basic.validate(),
            Condition::Composite(group) => group.children.iter().try_for_each(Condition::validate),
            Condition::SubQuery(sub) => sub.validate(),
        }
    }

    /// True if any node in the tree is a subquery
    pub fn has_subquery(&self) -> bool {
        match self {
            Condition::Basic(_) => false,
            Condition::Composite(group) => group.children.iter().any(Condition::has_subquery),
            Condition::SubQuery(_) => true,
        }
    }

    /// Every field referenced by basic predicates in the tree
    pub fn fields(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_fields(&mut out);
        out
    }

    fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Condition::Basic(basic) => out.push(&basic.field),
            Condition::Composite(group) => {
                for child in &group.children {
                    child.collect_fields(out);
                }
            }
            Condition::SubQuery(sub) => {
                if let Some(field) = &sub.field {
                    out.push(field);
                }
            }
        }
    }
}

impl From<BasicCondition> for Condition {
    fn from(c: BasicCondition) -> Self {
        Condition::Basic(c)
    }
}

impl From<SubQuery> for Condition {
    fn from(s: SubQuery) -> Self {
        Condition::SubQuery(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_between_requires_pair() {
        let ok = BasicCondition::new("age", Operator::Between, vec![18, 30]);
        assert!(ok.validate().is_ok());

        let short = BasicCondition::new("age", Operator::Between, vec![18]);
        assert_eq!(short.validate().unwrap_err().kind(), crate::ErrorKind::Validation);

        let scalar = BasicCondition::new("age", Operator::NotBetween, 18);
        assert!(scalar.validate().is_err());

        let null_bound = BasicCondition::new("age", Operator::Between, Value::List(vec![Value::Null, 3.into()]));
        assert!(null_bound.validate().is_err());
    }

    #[test]
    fn test_in_requires_list() {
        assert!(BasicCondition::new("s", Operator::In, vec!["a", "b"]).validate().is_ok());
        assert!(BasicCondition::new("s", Operator::In, Vec::<Value>::new()).validate().is_ok());
        assert!(BasicCondition::new("s", Operator::NotIn, "a").validate().is_err());
    }

    #[test]
    fn test_null_equality_is_normalized() {
        let c = BasicCondition::new("deleted_at", Operator::Equal, Value::Null);
        assert_eq!(c.effective_op(), Operator::IsNull);
        assert!(c.validate().is_ok());

        let c = BasicCondition::new("deleted_at", Operator::NotEqual, Value::Null);
        assert_eq!(c.effective_op(), Operator::IsNotNull);
    }

    #[test]
    fn test_invalid_regex_is_validation_error() {
        let c = BasicCondition::new("name", Operator::Regex, "([a-z");
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_subquery_operator_in_basic_condition_rejected() {
        let c = BasicCondition::new("id", Operator::InSubquery, Value::Null);
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_nested_validation_recurses() {
        let tree = Condition::group(
            Logic::And,
            [
                Condition::basic("a", Operator::Equal, 1),
                Condition::group(Logic::Or, [Condition::basic("b", Operator::Between, 1)]),
            ],
        );
        assert!(tree.validate().is_err());
        assert_eq!(tree.fields(), vec!["a", "b"]);
    }

    #[test]
    fn test_subquery_shapes() {
        let exists = SubQuery {
            kind: SubQueryKind::Exists,
            field: None,
            op: Operator::Exists,
            raw: "SELECT 1 FROM orders".into(),
            args: vec![],
            correlated: false,
        };
        assert!(exists.validate().is_ok());

        let bad_in = SubQuery {
            kind: SubQueryKind::In,
            field: None,
            op: Operator::InSubquery,
            raw: "SELECT id FROM orders".into(),
            args: vec![],
            correlated: false,
        };
        assert!(bad_in.validate().is_err());
    }
}
