//! Column filters for the relational store's select/update/delete-by-filter calls.
//!
//! A `FilterParam` is `(column, operator, value)`; the `db` crate turns a slice of
//! them into a SeaORM `Condition` against a concrete entity.

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    String(Vec<String>),
    Int(Vec<i64>),
    Bool(Vec<bool>),
    DateTime(Vec<DateTime<Utc>>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    In,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FilterParam {
    pub column: String,
    pub operator: CompareOp,
    pub value: FilterValue,
}

pub trait IntoFilterValue {
    fn into_filter_value(self) -> FilterValue;
}

impl IntoFilterValue for String {
    fn into_filter_value(self) -> FilterValue {
        FilterValue::String(vec![self])
    }
}

impl IntoFilterValue for &str {
    fn into_filter_value(self) -> FilterValue {
        FilterValue::String(vec![self.to_string()])
    }
}

impl IntoFilterValue for &String {
    fn into_filter_value(self) -> FilterValue {
        FilterValue::String(vec![self.clone()])
    }
}

impl IntoFilterValue for i64 {
    fn into_filter_value(self) -> FilterValue {
        FilterValue::Int(vec![self])
    }
}

impl IntoFilterValue for bool {
    fn into_filter_value(self) -> FilterValue {
        FilterValue::Bool(vec![self])
    }
}

impl IntoFilterValue for DateTime<Utc> {
    fn into_filter_value(self) -> FilterValue {
        FilterValue::DateTime(vec![self])
    }
}

impl IntoFilterValue for Vec<String> {
    fn into_filter_value(self) -> FilterValue {
        FilterValue::String(self)
    }
}

impl IntoFilterValue for Vec<&str> {
    fn into_filter_value(self) -> FilterValue {
        FilterValue::String(self.into_iter().map(|s| s.to_string()).collect())
    }
}

impl IntoFilterValue for Vec<i64> {
    fn into_filter_value(self) -> FilterValue {
        FilterValue::Int(self)
    }
}

impl FilterValue {
    pub fn len(&self) -> usize {
        match self {
            FilterValue::String(v) => v.len(),
            FilterValue::Int(v) => v.len(),
            FilterValue::Bool(v) => v.len(),
            FilterValue::DateTime(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_single(&self) -> bool {
        self.len() == 1
    }
}

impl FilterParam {
    pub fn new(column: &str, operator: CompareOp, value: impl IntoFilterValue) -> Self {
        Self {
            column: column.to_string(),
            operator,
            value: value.into_filter_value(),
        }
    }

    pub fn eq(column: &str, value: impl IntoFilterValue) -> Self {
        Self::new(column, CompareOp::Eq, value)
    }

    pub fn ne(column: &str, value: impl IntoFilterValue) -> Self {
        Self::new(column, CompareOp::Ne, value)
    }

    pub fn gt(column: &str, value: impl IntoFilterValue) -> Self {
        Self::new(column, CompareOp::Gt, value)
    }

    pub fn gte(column: &str, value: impl IntoFilterValue) -> Self {
        Self::new(column, CompareOp::Gte, value)
    }

    pub fn lt(column: &str, value: impl IntoFilterValue) -> Self {
        Self::new(column, CompareOp::Lt, value)
    }

    pub fn lte(column: &str, value: impl IntoFilterValue) -> Self {
        Self::new(column, CompareOp::Lte, value)
    }

    pub fn like(column: &str, value: impl IntoFilterValue) -> Self {
        Self::new(column, CompareOp::Like, value)
    }

    pub fn is_in(column: &str, values: impl IntoFilterValue) -> Self {
        Self::new(column, CompareOp::In, values)
    }
}
