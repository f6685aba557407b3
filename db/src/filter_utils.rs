use sea_orm::{ColumnTrait, Condition, DbErr, Value};
use std::fmt::Display;
use std::str::FromStr;
use util::filters::{CompareOp, FilterParam, FilterValue};

pub struct FilterUtils;

impl FilterUtils {
    /// AND together every filter. Column names are resolved through the
    /// entity's `Column::from_str`, so unknown names are rejected rather than ignored.
    pub fn apply_all_filters<C>(filter_params: &[FilterParam]) -> Result<Condition, DbErr>
    where
        C: ColumnTrait + FromStr,
        C::Err: Display,
    {
        let mut condition = Condition::all();
        for param in filter_params {
            let column = C::from_str(&param.column).map_err(|e| {
                DbErr::Custom(format!("Invalid column name '{}': {}", param.column, e))
            })?;
            condition = Self::apply_filter(condition, column, param)?;
        }
        Ok(condition)
    }

    pub fn apply_filter<C: ColumnTrait>(
        condition: Condition,
        column: C,
        param: &FilterParam,
    ) -> Result<Condition, DbErr> {
        if param.value.is_empty() {
            return Err(DbErr::Custom(format!(
                "Filter on '{}' has no values",
                param.column
            )));
        }

        if param.operator == CompareOp::In {
            return Ok(condition.add(column.is_in(values_of(&param.value))));
        }

        if !param.value.is_single() {
            return Err(DbErr::Custom(format!(
                "Operator {:?} on '{}' takes exactly one value",
                param.operator, param.column
            )));
        }

        if param.operator == CompareOp::Like {
            return match &param.value {
                FilterValue::String(v) => {
                    Ok(condition.add(column.like(format!("%{}%", v[0]))))
                }
                _ => Err(DbErr::Custom(format!(
                    "LIKE on '{}' requires a string value",
                    param.column
                ))),
            };
        }

        let mut values = values_of(&param.value);
        let value = values.remove(0);
        let expr = match param.operator {
            CompareOp::Eq => column.eq(value),
            CompareOp::Ne => column.ne(value),
            CompareOp::Gt => column.gt(value),
            CompareOp::Gte => column.gte(value),
            CompareOp::Lt => column.lt(value),
            CompareOp::Lte => column.lte(value),
            CompareOp::Like | CompareOp::In => {
                return Err(DbErr::Custom(format!(
                    "Unhandled operator {:?}",
                    param.operator
                )));
            }
        };
        Ok(condition.add(expr))
    }
}

fn values_of(value: &FilterValue) -> Vec<Value> {
    match value {
        FilterValue::String(v) => v.iter().cloned().map(Value::from).collect(),
        FilterValue::Int(v) => v.iter().copied().map(Value::from).collect(),
        FilterValue::Bool(v) => v.iter().copied().map(Value::from).collect(),
        FilterValue::DateTime(v) => v.iter().copied().map(Value::from).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::attendance_session::{Column, Entity};
    use sea_orm::{DbBackend, EntityTrait, QueryFilter, QueryTrait};

    fn sql_for(params: &[FilterParam]) -> Result<String, DbErr> {
        let cond = FilterUtils::apply_all_filters::<Column>(params)?;
        Ok(Entity::find().filter(cond).build(DbBackend::Sqlite).to_string())
    }

    #[test]
    fn eq_and_in_are_anded() {
        let sql = sql_for(&[
            FilterParam::eq("course_code", "COS301"),
            FilterParam::is_in("id", vec!["a", "b"]),
        ])
        .unwrap();
        assert!(sql.contains(r#""course_code" = 'COS301'"#));
        assert!(sql.contains(r#""id" IN ('a', 'b')"#));
        assert!(sql.contains(" AND "));
    }

    #[test]
    fn unknown_column_is_rejected() {
        let err = sql_for(&[FilterParam::eq("nope", "x")]).unwrap_err();
        assert!(err.to_string().contains("Invalid column name 'nope'"));
    }

    #[test]
    fn comparison_needs_exactly_one_value() {
        let err = sql_for(&[FilterParam::eq("id", vec!["a", "b"])]).unwrap_err();
        assert!(err.to_string().contains("exactly one value"));
    }

    #[test]
    fn like_wraps_pattern() {
        let sql = sql_for(&[FilterParam::like("course_name", "Software")]).unwrap();
        assert!(sql.contains("LIKE '%Software%'"));
    }
}
