//! Sort specifications for collection queries.

use crate::filter::compare_values;
use crate::ObjectInstance;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderByClause {
    pub field: String,
    pub direction: SortDirection,
}

/// Ordered list of sort clauses. Earlier clauses take precedence.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderBy(pub Vec<OrderByClause>);

impl OrderBy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn asc(mut self, field: impl Into<String>) -> Self {
        self.0.push(OrderByClause {
            field: field.into(),
            direction: SortDirection::Asc,
        });
        self
    }

    pub fn desc(mut self, field: impl Into<String>) -> Self {
        self.0.push(OrderByClause {
            field: field.into(),
            direction: SortDirection::Desc,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn clauses(&self) -> &[OrderByClause] {
        &self.0
    }

    /// Compare two objects. Missing or incomparable values sort last
    /// regardless of direction.
    pub fn compare(&self, a: &ObjectInstance, b: &ObjectInstance) -> Ordering {
        for clause in &self.0 {
            let left = a.property(&clause.field).filter(|v| !v.is_null());
            let right = b.property(&clause.field).filter(|v| !v.is_null());
            let ordering = match (left, right) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(l), Some(r)) => {
                    let ord = compare_values(&l, &r).unwrap_or(Ordering::Equal);
                    match clause.direction {
                        SortDirection::Asc => ord,
                        SortDirection::Desc => ord.reverse(),
                    }
                }
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}
