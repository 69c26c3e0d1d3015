//! WHERE conditions.
//!
//! A [`WhereCondition`] is a column, an [`Operator`] and an operator-dependent JSON
//! value. Conditions are validated before any SQL is rendered:
//!
//! - `isNull` / `isNotNull` take no value
//! - `in` / `notIn` take a non-empty array of scalars
//! - `like` takes a string
//! - `gt` / `gte` / `lt` / `lte` take a string or a number
//! - `eq` / `ne` take a scalar (no arrays, no objects)
//! - a bare `null` is only meaningful for the null operators

use super::builder::SqlWriter;
use super::ident::quote_column;
use crate::error::{DbError, DbResult};
use crate::models::QueryParam;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

/// Comparison operator of a WHERE condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Lt,
    Gte,
    Lte,
    Like,
    In,
    NotIn,
    IsNull,
    IsNotNull,
}

impl Operator {
    fn sql(&self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Gte => ">=",
            Self::Lte => "<=",
            Self::Like => "LIKE",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
            Self::IsNull => "IS NULL",
            Self::IsNotNull => "IS NOT NULL",
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Eq => "eq",
            Self::Ne => "ne",
            Self::Gt => "gt",
            Self::Lt => "lt",
            Self::Gte => "gte",
            Self::Lte => "lte",
            Self::Like => "like",
            Self::In => "in",
            Self::NotIn => "notIn",
            Self::IsNull => "isNull",
            Self::IsNotNull => "isNotNull",
        }
    }
}

/// Keeps an explicit JSON `null` distinct from an absent value.
fn present<'de, D>(deserializer: D) -> Result<Option<JsonValue>, D::Error>
where
    D: Deserializer<'de>,
{
    JsonValue::deserialize(deserializer).map(Some)
}

/// One ANDed term of a WHERE clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WhereCondition {
    pub column: String,
    pub operator: Operator,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub value: Option<JsonValue>,
}

fn is_scalar(value: &JsonValue) -> bool {
    matches!(
        value,
        JsonValue::Bool(_) | JsonValue::Number(_) | JsonValue::String(_)
    )
}

impl WhereCondition {
    /// Build and validate a condition.
    pub fn new(
        column: impl Into<String>,
        operator: Operator,
        value: Option<JsonValue>,
    ) -> DbResult<Self> {
        let condition = Self {
            column: column.into(),
            operator,
            value,
        };
        condition.validate()?;
        Ok(condition)
    }

    pub fn eq(column: impl Into<String>, value: impl Into<JsonValue>) -> DbResult<Self> {
        Self::new(column, Operator::Eq, Some(value.into()))
    }

    pub fn is_null(column: impl Into<String>) -> DbResult<Self> {
        Self::new(column, Operator::IsNull, None)
    }

    pub fn validate(&self) -> DbResult<()> {
        let op = self.operator.name();
        let fail = |reason: &str| {
            Err(DbError::invalid_input(format!(
                "Invalid condition on '{}': operator {op} {reason}",
                self.column
            )))
        };

        match (self.operator, &self.value) {
            (Operator::IsNull | Operator::IsNotNull, None) => Ok(()),
            (Operator::IsNull | Operator::IsNotNull, Some(_)) => fail("does not take a value"),
            (_, None) => fail("requires a value"),
            (_, Some(JsonValue::Null)) => {
                fail("cannot compare with null; use isNull or isNotNull instead")
            }
            (Operator::In | Operator::NotIn, Some(JsonValue::Array(items))) => {
                if items.is_empty() {
                    fail("requires a non-empty array")
                } else if !items.iter().all(is_scalar) {
                    fail("requires an array of strings, numbers or booleans")
                } else {
                    Ok(())
                }
            }
            (Operator::In | Operator::NotIn, Some(_)) => fail("requires an array"),
            (Operator::Like, Some(JsonValue::String(_))) => Ok(()),
            (Operator::Like, Some(_)) => fail("requires a string pattern"),
            (
                Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte,
                Some(JsonValue::String(_) | JsonValue::Number(_)),
            ) => Ok(()),
            (Operator::Gt | Operator::Gte | Operator::Lt | Operator::Lte, Some(_)) => {
                fail("requires a string or a number")
            }
            (Operator::Eq | Operator::Ne, Some(value)) if is_scalar(value) => Ok(()),
            (Operator::Eq | Operator::Ne, Some(_)) => {
                fail("requires a single value, not an array or object")
            }
        }
    }

    /// Append `column op placeholder(s)` to the writer.
    pub(crate) fn render(&self, writer: &mut SqlWriter<'_>) -> DbResult<()> {
        self.validate()?;
        let column = quote_column(writer.dialect(), &self.column)?;
        writer.push(&column);
        writer.push(" ");
        writer.push(self.operator.sql());

        match (&self.operator, &self.value) {
            (Operator::IsNull | Operator::IsNotNull, _) => {}
            (Operator::In | Operator::NotIn, Some(JsonValue::Array(items))) => {
                writer.push(" (");
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        writer.push(", ");
                    }
                    writer.push_param(QueryParam::from_json(item));
                }
                writer.push(")");
            }
            (_, Some(value)) => {
                writer.push(" ");
                writer.push_param(QueryParam::from_json(value));
            }
            (_, None) => {}
        }
        Ok(())
    }
}

/// Append ` WHERE a AND b ...` for a non-empty condition list.
pub(crate) fn render_where(
    writer: &mut SqlWriter<'_>,
    conditions: &[WhereCondition],
) -> DbResult<()> {
    for (i, condition) in conditions.iter().enumerate() {
        writer.push(if i == 0 { " WHERE " } else { " AND " });
        condition.render(writer)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::dialect::dialect_for;
    use crate::models::Vendor;
    use serde_json::json;

    fn cond(op: Operator, value: Option<JsonValue>) -> DbResult<WhereCondition> {
        WhereCondition::new("age", op, value)
    }

    #[test]
    fn test_null_operators_reject_values() {
        assert!(cond(Operator::IsNull, None).is_ok());
        assert!(cond(Operator::IsNotNull, Some(json!(1))).is_err());
        assert!(cond(Operator::IsNull, Some(json!(null))).is_err());
    }

    #[test]
    fn test_value_operators_require_value() {
        for op in [Operator::Eq, Operator::Gt, Operator::Like, Operator::In] {
            assert!(cond(op, None).is_err());
        }
    }

    #[test]
    fn test_bare_null_rejected() {
        let err = cond(Operator::Eq, Some(json!(null))).unwrap_err();
        assert!(err.to_string().contains("isNull"));
    }

    #[test]
    fn test_in_requires_non_empty_scalar_array() {
        assert!(cond(Operator::In, Some(json!([1, 2]))).is_ok());
        assert!(cond(Operator::In, Some(json!([]))).is_err());
        assert!(cond(Operator::NotIn, Some(json!([[1]]))).is_err());
        assert!(cond(Operator::NotIn, Some(json!([null]))).is_err());
        assert!(cond(Operator::In, Some(json!(1))).is_err());
    }

    #[test]
    fn test_like_requires_string() {
        assert!(cond(Operator::Like, Some(json!("a%"))).is_ok());
        assert!(cond(Operator::Like, Some(json!(5))).is_err());
    }

    #[test]
    fn test_ordering_requires_string_or_number() {
        assert!(cond(Operator::Gt, Some(json!(5))).is_ok());
        assert!(cond(Operator::Lte, Some(json!("2024-01-01"))).is_ok());
        assert!(cond(Operator::Gte, Some(json!(true))).is_err());
    }

    #[test]
    fn test_eq_rejects_compound_values() {
        assert!(cond(Operator::Eq, Some(json!(true))).is_ok());
        assert!(cond(Operator::Ne, Some(json!([1]))).is_err());
        assert!(cond(Operator::Eq, Some(json!({"a": 1}))).is_err());
    }

    #[test]
    fn test_deserialize_distinguishes_null_from_missing() {
        let with_null: WhereCondition =
            serde_json::from_value(json!({"column": "a", "operator": "eq", "value": null})).unwrap();
        assert_eq!(with_null.value, Some(JsonValue::Null));
        assert!(with_null.validate().is_err());

        let missing: WhereCondition =
            serde_json::from_value(json!({"column": "a", "operator": "isNull"})).unwrap();
        assert_eq!(missing.value, None);
        assert!(missing.validate().is_ok());
    }

    #[test]
    fn test_operator_names() {
        let op: Operator = serde_json::from_value(json!("notIn")).unwrap();
        assert_eq!(op, Operator::NotIn);
        let op: Operator = serde_json::from_value(json!("isNotNull")).unwrap();
        assert_eq!(op, Operator::IsNotNull);
    }

    #[test]
    fn test_render_in_binds_each_item() {
        let mut writer = SqlWriter::new(dialect_for(Vendor::PostgreSQL));
        let conditions = vec![
            WhereCondition::new("id", Operator::In, Some(json!([1, 2, 3]))).unwrap(),
            WhereCondition::is_null("deleted_at").unwrap(),
        ];
        render_where(&mut writer, &conditions).unwrap();
        let (sql, params) = writer.finish();
        assert_eq!(sql, " WHERE \"id\" IN ($1, $2, $3) AND \"deleted_at\" IS NULL");
        assert_eq!(params.len(), 3);
    }
}
