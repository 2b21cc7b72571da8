use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, collections::BTreeMap};

///
/// Row
///
/// One document returned by a partition. `id` is unique within the
/// collection and doubles as the stable tie-break of every sort order.
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Row {
    pub id: String,
    pub fields: BTreeMap<String, Value>,
}

impl Row {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field insert.
    #[must_use]
    pub fn with(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(field.into(), value.into());
        self
    }

    /// Borrow one field; a missing field reads as `Null`.
    #[must_use]
    pub fn field(&self, name: &str) -> &Value {
        static NULL: Value = Value::Null;

        self.fields.get(name).unwrap_or(&NULL)
    }

    /// Project the named fields, or every field in name order when `names` is empty.
    #[must_use]
    pub fn project(&self, names: &[String]) -> Vec<Value> {
        if names.is_empty() {
            return self
                .fields
                .iter()
                .flat_map(|(name, value)| [Value::text(name.clone()), value.clone()])
                .collect();
        }

        names.iter().map(|name| self.field(name).clone()).collect()
    }
}

///
/// OrderDirection
///

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

///
/// OrderTerm
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct OrderTerm {
    pub field: String,
    pub direction: OrderDirection,
}

impl OrderTerm {
    #[must_use]
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: OrderDirection::Asc,
        }
    }

    #[must_use]
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: OrderDirection::Desc,
        }
    }
}

///
/// OrderSpec
///
/// Declared sort order of a query. An empty spec orders by row id only.
///

#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct OrderSpec {
    pub terms: Vec<OrderTerm>,
}

impl OrderSpec {
    #[must_use]
    pub const fn unordered() -> Self {
        Self { terms: Vec::new() }
    }

    #[must_use]
    pub const fn new(terms: Vec<OrderTerm>) -> Self {
        Self { terms }
    }

    /// Extract the sort key of one row under this order.
    #[must_use]
    pub fn key_of(&self, row: &Row) -> RowKey {
        RowKey {
            values: self
                .terms
                .iter()
                .map(|term| row.field(&term.field).clone())
                .collect(),
            id: row.id.clone(),
        }
    }

    /// Compare two keys produced by this spec.
    #[must_use]
    pub fn compare_keys(&self, left: &RowKey, right: &RowKey) -> Ordering {
        for (term, (l, r)) in self
            .terms
            .iter()
            .zip(left.values.iter().zip(right.values.iter()))
        {
            let cmp = match term.direction {
                OrderDirection::Asc => l.cmp(r),
                OrderDirection::Desc => r.cmp(l),
            };
            if cmp != Ordering::Equal {
                return cmp;
            }
        }

        left.id.cmp(&right.id)
    }

    /// Compare two rows under this order.
    #[must_use]
    pub fn compare_rows(&self, left: &Row, right: &Row) -> Ordering {
        self.compare_keys(&self.key_of(left), &self.key_of(right))
    }
}

///
/// RowKey
///
/// Sort position of one row: the order-term values followed by the row id.
/// Persisted as the replay boundary of a fetch node.
///

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct RowKey {
    pub values: Vec<Value>,
    pub id: String,
}

///
/// TESTS
///
