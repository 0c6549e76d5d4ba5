//! Result row representation.

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::{SqlDate, SqlDateTime, SqlTime, Value};
use std::collections::HashMap;
use std::sync::Arc;

/// Column names shared across all rows in a result set.
///
/// Wrapped in `Arc` so every row from one result shares one copy.
#[derive(Debug, Clone, Default)]
pub struct ColumnInfo {
    names: Vec<String>,
    name_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    /// Create new column info from a list of column names.
    ///
    /// When a name repeats, lookups by name resolve to the first occurrence.
    pub fn new(names: Vec<String>) -> Self {
        let mut name_to_index = HashMap::with_capacity(names.len());
        for (i, name) in names.iter().enumerate() {
            name_to_index.entry(name.clone()).or_insert(i);
        }
        Self {
            names,
            name_to_index,
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.name_to_index.contains_key(name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A single row returned from a query.
///
/// Rows provide both index-based and name-based access to column values.
#[derive(Debug, Clone)]
pub struct Row {
    values: Vec<Value>,
    columns: Arc<ColumnInfo>,
}

impl Row {
    /// Create a row with its own column metadata.
    ///
    /// For multiple rows from the same result, prefer `with_columns`.
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        let columns = Arc::new(ColumnInfo::new(column_names));
        Self { values, columns }
    }

    /// Create a row with shared column metadata.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by column index.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Get a value by column name.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    pub fn contains_column(&self, name: &str) -> bool {
        self.columns.contains(name)
    }

    /// Get a typed value by column index.
    #[allow(clippy::result_large_err)]
    pub fn get_as<T: FromValue>(&self, index: usize) -> Result<T> {
        let value = self.get(index).ok_or_else(|| {
            Error::Type(TypeError {
                expected: std::any::type_name::<T>(),
                actual: format!(
                    "index {} out of bounds (row has {} columns)",
                    index,
                    self.len()
                ),
                column: None,
                rust_type: None,
            })
        })?;
        T::from_value(value)
    }

    /// Get a typed value by column name.
    #[allow(clippy::result_large_err)]
    pub fn get_named<T: FromValue>(&self, name: &str) -> Result<T> {
        let value = self.get_by_name(name).ok_or_else(|| {
            Error::Type(TypeError {
                expected: std::any::type_name::<T>(),
                actual: format!("column '{}' not found", name),
                column: Some(name.to_string()),
                rust_type: None,
            })
        })?;
        T::from_value(value).map_err(|e| match e {
            Error::Type(mut te) => {
                te.column = Some(name.to_string());
                Error::Type(te)
            }
            e => e,
        })
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.names().iter().map(String::as_str)
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.values.iter()
    }

    /// Consume the row, returning its values.
    pub fn into_values(self) -> Vec<Value> {
        self.values
    }

    /// Iterate over (column_name, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .names()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }
}

/// Trait for converting from a `Value` to a typed value.
pub trait FromValue: Sized {
    /// Convert from a Value, returning an error if the conversion fails.
    #[allow(clippy::result_large_err)]
    fn from_value(value: &Value) -> Result<Self>;
}

fn mismatch(expected: &'static str, value: &Value) -> Error {
    Error::Type(TypeError {
        expected,
        actual: value.type_name().to_string(),
        column: None,
        rust_type: None,
    })
}

fn out_of_range(expected: &'static str, shown: impl std::fmt::Display) -> Error {
    Error::Type(TypeError {
        expected,
        actual: format!("value {} out of range", shown),
        column: None,
        rust_type: None,
    })
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_bool().ok_or_else(|| mismatch("bool", value))
    }
}

macro_rules! impl_from_value_signed {
    ($($t:ty),*) => {$(
        impl FromValue for $t {
            fn from_value(value: &Value) -> Result<Self> {
                let v = value
                    .as_i64()
                    .ok_or_else(|| mismatch(stringify!($t), value))?;
                <$t>::try_from(v).map_err(|_| out_of_range(stringify!($t), v))
            }
        }
    )*};
}

macro_rules! impl_from_value_unsigned {
    ($($t:ty),*) => {$(
        impl FromValue for $t {
            fn from_value(value: &Value) -> Result<Self> {
                let v = value
                    .as_u64()
                    .ok_or_else(|| mismatch(stringify!($t), value))?;
                <$t>::try_from(v).map_err(|_| out_of_range(stringify!($t), v))
            }
        }
    )*};
}

impl_from_value_signed!(i8, i16, i32, i64);
impl_from_value_unsigned!(u8, u16, u32, u64);

#[allow(clippy::cast_possible_truncation)]
impl FromValue for f32 {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Float(v) => Ok(*v),
            other => other
                .as_f64()
                .map(|v| v as f32)
                .ok_or_else(|| mismatch("f32", other)),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> Result<Self> {
        value.as_f64().ok_or_else(|| mismatch("f64", value))
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Text(s) | Value::Decimal(s) => Ok(s.clone()),
            Value::Bytes(b) => String::from_utf8(b.clone()).map_err(|_| mismatch("String", value)),
            Value::Json(v) => Ok(v.to_string()),
            Value::Date(d) => Ok(d.to_string()),
            Value::DateTime(dt) => Ok(dt.to_string()),
            Value::Time(t) => Ok(t.to_string()),
            _ => Err(mismatch("String", value)),
        }
    }
}

impl FromValue for Vec<u8> {
    fn from_value(value: &Value) -> Result<Self> {
        value
            .as_bytes()
            .map(<[u8]>::to_vec)
            .ok_or_else(|| mismatch("Vec<u8>", value))
    }
}

impl FromValue for SqlDate {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Date(d) => Ok(*d),
            Value::DateTime(dt) => Ok(dt.date),
            Value::Text(s) => SqlDate::parse(s).ok_or_else(|| mismatch("DATE", value)),
            _ => Err(mismatch("DATE", value)),
        }
    }
}

impl FromValue for SqlDateTime {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::DateTime(dt) => Ok(*dt),
            Value::Date(d) => Ok(SqlDateTime::new(*d, 0, 0, 0, 0)),
            Value::Text(s) => SqlDateTime::parse(s).ok_or_else(|| mismatch("DATETIME", value)),
            _ => Err(mismatch("DATETIME", value)),
        }
    }
}

impl FromValue for SqlTime {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Time(t) => Ok(*t),
            Value::Text(s) => SqlTime::parse(s).ok_or_else(|| mismatch("TIME", value)),
            _ => Err(mismatch("TIME", value)),
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Result<Self> {
        if value.is_null() {
            Ok(None)
        } else {
            T::from_value(value).map(Some)
        }
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(value.clone())
    }
}

impl FromValue for serde_json::Value {
    fn from_value(value: &Value) -> Result<Self> {
        match value {
            Value::Json(v) => Ok(v.clone()),
            Value::Text(s) => serde_json::from_str(s).map_err(|e| {
                Error::Type(TypeError {
                    expected: "valid JSON",
                    actual: format!("invalid JSON: {}", e),
                    column: None,
                    rust_type: None,
                })
            }),
            _ => Err(mismatch("JSON", value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Row {
        Row::new(
            vec!["id".into(), "name".into(), "score".into(), "id".into()],
            vec![
                Value::UInt(42),
                Value::Text("ada".into()),
                Value::Null,
                Value::Int(-1),
            ],
        )
    }

    #[test]
    fn typed_access_by_index_and_name() {
        let row = sample();
        assert_eq!(row.get_as::<u32>(0).unwrap(), 42);
        assert_eq!(row.get_named::<String>("name").unwrap(), "ada");
        assert_eq!(row.get_named::<Option<f64>>("score").unwrap(), None);
        // duplicate column name resolves to the first occurrence
        assert_eq!(row.get_named::<i64>("id").unwrap(), 42);
        assert_eq!(row.get_as::<i64>(3).unwrap(), -1);
    }

    #[test]
    fn conversion_errors_name_the_column() {
        let row = sample();
        match row.get_named::<u8>("name") {
            Err(Error::Type(te)) => assert_eq!(te.column.as_deref(), Some("name")),
            other => panic!("unexpected: {other:?}"),
        }
        assert!(row.get_as::<u8>(3).is_err());
        assert!(row.get_as::<i32>(10).is_err());
        assert!(row.get_named::<i32>("missing").is_err());
    }

    #[test]
    fn iter_pairs_names_with_values() {
        let row = sample();
        let names: Vec<&str> = row.iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["id", "name", "score", "id"]);
    }
}
