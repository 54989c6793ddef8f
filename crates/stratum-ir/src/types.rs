//! Type system for Stratum columns

use serde::{Deserialize, Serialize};

use crate::Value;

/// Declared type of a stored column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    /// Unique text natural key (`id`)
    Key,
    Integer,
    Real,
    Boolean,
    /// Text, including JSON-serialized lists
    Text,
}

impl ColumnType {
    /// Infer the column type for `field` from a sample value
    pub fn infer(field: &str, value: &Value) -> Self {
        if field == "id" {
            return ColumnType::Key;
        }
        if field == "number_observed" {
            return ColumnType::Integer;
        }
        match value {
            Value::Int(_) => ColumnType::Integer,
            Value::Float(_) => ColumnType::Real,
            Value::Bool(_) => ColumnType::Boolean,
            Value::Array(_) | Value::String(_) | Value::Null => ColumnType::Text,
        }
    }

    /// Map an introspected SQL type name back to a column type
    pub fn from_sql_type(field: &str, sql_type: &str) -> Self {
        if field == "id" {
            return ColumnType::Key;
        }
        let upper = sql_type.to_ascii_uppercase();
        if upper.contains("INT") {
            ColumnType::Integer
        } else if ["DOUBLE", "REAL", "FLOAT", "DECIMAL", "NUMERIC"]
            .iter()
            .any(|t| upper.starts_with(t))
        {
            ColumnType::Real
        } else if upper.starts_with("BOOL") {
            ColumnType::Boolean
        } else {
            ColumnType::Text
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::Real)
    }
}

/// Column name and declared type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_infer_type() {
        assert_eq!(ColumnType::infer("id", &Value::Int(1)), ColumnType::Key);
        assert_eq!(
            ColumnType::infer("number_observed", &Value::from("3")),
            ColumnType::Integer
        );
        assert_eq!(ColumnType::infer("pid", &Value::Int(4)), ColumnType::Integer);
        assert_eq!(ColumnType::infer("ratio", &Value::Float(0.5)), ColumnType::Real);
        assert_eq!(
            ColumnType::infer("protocols", &Value::Array(vec![])),
            ColumnType::Text
        );
        assert_eq!(ColumnType::infer("name", &Value::from("x")), ColumnType::Text);
    }

    #[test]
    fn test_from_sql_type() {
        assert_eq!(ColumnType::from_sql_type("pid", "BIGINT"), ColumnType::Integer);
        assert_eq!(ColumnType::from_sql_type("x", "DOUBLE"), ColumnType::Real);
        assert_eq!(ColumnType::from_sql_type("x", "DECIMAL(18,3)"), ColumnType::Real);
        assert_eq!(ColumnType::from_sql_type("x", "BOOLEAN"), ColumnType::Boolean);
        assert_eq!(ColumnType::from_sql_type("x", "VARCHAR"), ColumnType::Text);
        assert_eq!(ColumnType::from_sql_type("id", "VARCHAR"), ColumnType::Key);
    }
}
