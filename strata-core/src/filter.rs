//! Where-clause trees and client-side evaluation
//!
//! A [`WhereClause`] is the filter half of a list query's identity. It is
//! passed through to the fetch collaborator untouched, and evaluated locally
//! when the cache needs to decide whether a freshly written object belongs in
//! a list it already holds.

use crate::ObjectInstance;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Filter operator for field comparisons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterOperator {
    /// Equal to
    Eq,
    /// Not equal to
    Ne,
    /// Greater than
    Gt,
    /// Less than
    Lt,
    /// Greater than or equal
    Gte,
    /// Less than or equal
    Lte,
    /// Array membership or substring
    Contains,
    /// In list of values
    In,
    /// String prefix
    StartsWith,
    /// Property is null (`true`) or present (`false`)
    IsNull,
    /// Full-text: any term matches. Server-side only.
    ContainsAnyTerm,
    /// Full-text: all terms match. Server-side only.
    ContainsAllTerms,
}

impl FilterOperator {
    /// Whether the cache can decide this operator without the server.
    pub fn is_locally_evaluable(self) -> bool {
        !matches!(
            self,
            FilterOperator::ContainsAnyTerm | FilterOperator::ContainsAllTerms
        )
    }
}

/// A single property predicate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterExpr {
    /// Field to filter on
    pub field: String,
    /// Operator to apply
    pub operator: FilterOperator,
    /// Value to compare against
    pub value: Value,
}

impl FilterExpr {
    pub fn new(field: impl Into<String>, operator: FilterOperator, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::Eq, value)
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::Ne, value)
    }

    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::Gt, value)
    }

    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(field, FilterOperator::Lt, value)
    }

    pub fn one_of<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        let values: Vec<Value> = values.into_iter().map(Into::into).collect();
        Self::new(field, FilterOperator::In, Value::Array(values))
    }

    pub fn is_null(field: impl Into<String>, is_null: bool) -> Self {
        Self::new(field, FilterOperator::IsNull, is_null)
    }

    pub fn contains_any_term(field: impl Into<String>, terms: impl Into<String>) -> Self {
        Self::new(field, FilterOperator::ContainsAnyTerm, terms.into())
    }

    /// Evaluate against one object. Server-only operators report `!strict`.
    fn evaluate(&self, object: &ObjectInstance, strict: bool) -> bool {
        if !self.operator.is_locally_evaluable() {
            return !strict;
        }

        let actual = object.property(&self.field);
        let actual = match (self.operator, actual) {
            (FilterOperator::IsNull, actual) => {
                let is_null = matches!(actual, None | Some(Value::Null));
                return self.value.as_bool().unwrap_or(true) == is_null;
            }
            (_, None) | (_, Some(Value::Null)) => {
                return self.operator == FilterOperator::Ne && !self.value.is_null();
            }
            (_, Some(actual)) => actual,
        };

        match self.operator {
            FilterOperator::Eq => values_equal(&actual, &self.value),
            FilterOperator::Ne => !values_equal(&actual, &self.value),
            FilterOperator::Gt => compare_values(&actual, &self.value) == Some(Ordering::Greater),
            FilterOperator::Lt => compare_values(&actual, &self.value) == Some(Ordering::Less),
            FilterOperator::Gte => matches!(
                compare_values(&actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOperator::Lte => matches!(
                compare_values(&actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOperator::Contains => match (&actual, &self.value) {
                (Value::Array(items), needle) => items.iter().any(|v| values_equal(v, needle)),
                (Value::String(s), Value::String(needle)) => s.contains(needle.as_str()),
                _ => false,
            },
            FilterOperator::In => match &self.value {
                Value::Array(options) => options.iter().any(|v| values_equal(&actual, v)),
                _ => false,
            },
            FilterOperator::StartsWith => match (&actual, &self.value) {
                (Value::String(s), Value::String(prefix)) => s.starts_with(prefix.as_str()),
                _ => false,
            },
            FilterOperator::IsNull
            | FilterOperator::ContainsAnyTerm
            | FilterOperator::ContainsAllTerms => !strict,
        }
    }
}

/// Boolean filter tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WhereClause {
    #[serde(rename = "$and")]
    And(Vec<WhereClause>),
    #[serde(rename = "$or")]
    Or(Vec<WhereClause>),
    #[serde(rename = "$not")]
    Not(Box<WhereClause>),
    #[serde(rename = "$filter")]
    Filter(FilterExpr),
}

impl Default for WhereClause {
    fn default() -> Self {
        WhereClause::all()
    }
}

impl From<FilterExpr> for WhereClause {
    fn from(expr: FilterExpr) -> Self {
        WhereClause::Filter(expr)
    }
}

impl WhereClause {
    /// Matches every object.
    pub fn all() -> Self {
        WhereClause::And(Vec::new())
    }

    pub fn and(clauses: impl IntoIterator<Item = WhereClause>) -> Self {
        WhereClause::And(clauses.into_iter().collect())
    }

    pub fn or(clauses: impl IntoIterator<Item = WhereClause>) -> Self {
        WhereClause::Or(clauses.into_iter().collect())
    }

    #[allow(clippy::should_implement_trait)]
    pub fn not(clause: WhereClause) -> Self {
        WhereClause::Not(Box::new(clause))
    }

    /// Shorthand for a single equality filter.
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        FilterExpr::eq(field, value).into()
    }

    pub fn is_match_all(&self) -> bool {
        matches!(self, WhereClause::And(c) | WhereClause::Or(c) if c.is_empty())
    }

    /// Evaluate the clause against an object.
    ///
    /// With `strict` set, only a definite match returns true: predicates the
    /// client cannot decide count as failures. Without it they count as
    /// passes, so a `false` result means the object definitely does not match.
    pub fn matches(&self, object: &ObjectInstance, strict: bool) -> bool {
        match self {
            WhereClause::And(clauses) => clauses.iter().all(|c| c.matches(object, strict)),
            WhereClause::Or(clauses) => {
                clauses.is_empty() || clauses.iter().any(|c| c.matches(object, strict))
            }
            WhereClause::Not(inner) => !inner.matches(object, !strict),
            WhereClause::Filter(expr) => expr.evaluate(object, strict),
        }
    }

    /// Classify an object against this clause.
    pub fn classify(&self, object: &ObjectInstance) -> MatchKind {
        if self.matches(object, true) {
            MatchKind::Strict
        } else if self.matches(object, false) {
            MatchKind::Sorta
        } else {
            MatchKind::None
        }
    }
}

/// Result of evaluating a where clause locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchKind {
    /// Definitely matches.
    Strict,
    /// Matches only if the server-side predicates pass.
    Sorta,
    /// Definitely does not match.
    None,
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

/// Ordering between two JSON scalars of the same family.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            if let (Some(x), Some(y)) = (x.as_i64(), y.as_i64()) {
                return Some(x.cmp(&y));
            }
            x.as_f64()?.partial_cmp(&y.as_f64()?)
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn emp(office: &str, age: i64) -> ObjectInstance {
        ObjectInstance::new("Employee", 1)
            .with_property("office", office)
            .with_property("age", age)
            .with_property("skills", json!(["rust", "sql"]))
    }

    #[test]
    fn test_equality_and_comparison() {
        let e = emp("NYC", 30);
        assert!(WhereClause::eq("office", "NYC").matches(&e, true));
        assert!(!WhereClause::eq("office", "SF").matches(&e, true));
        assert!(WhereClause::from(FilterExpr::gt("age", 29)).matches(&e, true));
        assert!(WhereClause::from(FilterExpr::gt("age", 29.5)).matches(&e, true));
        assert!(!WhereClause::from(FilterExpr::lt("age", 30)).matches(&e, true));
        assert!(WhereClause::eq("age", 30.0).matches(&e, true));
    }

    #[test]
    fn test_contains_and_in() {
        let e = emp("NYC", 30);
        let contains = FilterExpr::new("skills", FilterOperator::Contains, "rust");
        assert!(WhereClause::from(contains).matches(&e, true));
        let one_of = FilterExpr::one_of("office", ["SF", "NYC"]);
        assert!(WhereClause::from(one_of).matches(&e, true));
    }

    #[test]
    fn test_missing_property() {
        let e = emp("NYC", 30);
        assert!(WhereClause::from(FilterExpr::is_null("manager", true)).matches(&e, true));
        assert!(!WhereClause::eq("manager", "bob").matches(&e, true));
        assert!(WhereClause::from(FilterExpr::ne("manager", "bob")).matches(&e, true));
    }

    #[test]
    fn test_boolean_combinators() {
        let e = emp("NYC", 30);
        let clause = WhereClause::and([
            WhereClause::eq("office", "NYC"),
            WhereClause::not(WhereClause::eq("age", 31)),
        ]);
        assert!(clause.matches(&e, true));
        let clause = WhereClause::or([WhereClause::eq("office", "SF"), WhereClause::eq("age", 30)]);
        assert!(clause.matches(&e, true));
        assert!(WhereClause::all().matches(&e, true));
    }

    #[test]
    fn test_server_only_operators_are_sorta_matches() {
        let e = emp("NYC", 30);
        let clause = WhereClause::and([
            WhereClause::eq("office", "NYC"),
            FilterExpr::contains_any_term("bio", "rust").into(),
        ]);
        assert_eq!(clause.classify(&e), MatchKind::Sorta);

        let negated = WhereClause::not(FilterExpr::contains_any_term("bio", "rust").into());
        assert_eq!(negated.classify(&e), MatchKind::Sorta);

        let mismatch = WhereClause::and([
            WhereClause::eq("office", "SF"),
            FilterExpr::contains_any_term("bio", "rust").into(),
        ]);
        assert_eq!(mismatch.classify(&e), MatchKind::None);
    }

    #[test]
    fn test_where_clause_serde_shape() {
        let clause = WhereClause::and([WhereClause::eq("office", "NYC")]);
        let value = serde_json::to_value(&clause).unwrap();
        assert_eq!(
            value,
            json!({"$and": [{"$filter": {"field": "office", "operator": "eq", "value": "NYC"}}]})
        );
    }
}
