// ABOUTME: Typed column values and records read from the source database
// ABOUTME: Decodes tokio_postgres rows and binds values back as statement parameters

use bytes::BytesMut;
use rust_decimal::Decimal;
use std::error::Error as StdError;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::Row;

use crate::error::{Error, Result};

/// A single column value.
///
/// Covers the types that can be carried from source to target without loss.
/// Anything else is rejected at decode time rather than silently nulled.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Numeric(Decimal),
    Text(String),
    Bytes(Vec<u8>),
    Date(chrono::NaiveDate),
    Time(chrono::NaiveTime),
    Timestamp(chrono::NaiveDateTime),
    TimestampTz(chrono::DateTime<chrono::Utc>),
    Uuid(uuid::Uuid),
    Json(serde_json::Value),
}

impl Value {
    /// Decode column `idx` of `row`, dispatching on the column's wire type.
    pub fn from_row(row: &Row, idx: usize) -> Result<Self> {
        let column = &row.columns()[idx];
        let ty = column.type_();
        let decode_err = |e: tokio_postgres::Error| {
            Error::database(format!("Failed to decode column '{}'", column.name()), e)
        };

        let value = match *ty {
            Type::BOOL => row
                .try_get::<_, Option<bool>>(idx)
                .map_err(decode_err)?
                .map(Value::Bool),
            Type::INT2 => row
                .try_get::<_, Option<i16>>(idx)
                .map_err(decode_err)?
                .map(Value::Int16),
            Type::INT4 => row
                .try_get::<_, Option<i32>>(idx)
                .map_err(decode_err)?
                .map(Value::Int32),
            Type::INT8 => row
                .try_get::<_, Option<i64>>(idx)
                .map_err(decode_err)?
                .map(Value::Int64),
            Type::FLOAT4 => row
                .try_get::<_, Option<f32>>(idx)
                .map_err(decode_err)?
                .map(Value::Float32),
            Type::FLOAT8 => row
                .try_get::<_, Option<f64>>(idx)
                .map_err(decode_err)?
                .map(Value::Float64),
            Type::NUMERIC => row
                .try_get::<_, Option<Decimal>>(idx)
                .map_err(decode_err)?
                .map(Value::Numeric),
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => row
                .try_get::<_, Option<String>>(idx)
                .map_err(decode_err)?
                .map(Value::Text),
            Type::BYTEA => row
                .try_get::<_, Option<Vec<u8>>>(idx)
                .map_err(decode_err)?
                .map(Value::Bytes),
            Type::DATE => row
                .try_get::<_, Option<chrono::NaiveDate>>(idx)
                .map_err(decode_err)?
                .map(Value::Date),
            Type::TIME => row
                .try_get::<_, Option<chrono::NaiveTime>>(idx)
                .map_err(decode_err)?
                .map(Value::Time),
            Type::TIMESTAMP => row
                .try_get::<_, Option<chrono::NaiveDateTime>>(idx)
                .map_err(decode_err)?
                .map(Value::Timestamp),
            Type::TIMESTAMPTZ => row
                .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(idx)
                .map_err(decode_err)?
                .map(Value::TimestampTz),
            Type::UUID => row
                .try_get::<_, Option<uuid::Uuid>>(idx)
                .map_err(decode_err)?
                .map(Value::Uuid),
            Type::JSON | Type::JSONB => row
                .try_get::<_, Option<serde_json::Value>>(idx)
                .map_err(decode_err)?
                .map(Value::Json),
            _ => {
                return Err(Error::UnsupportedType {
                    column: column.name().to_string(),
                    type_name: ty.name().to_string(),
                })
            }
        };

        Ok(value.unwrap_or(Value::Null))
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Canonical text form used to compare key values across databases.
    ///
    /// Numerics are normalised so that `1.5` and `1.50` (e.g. a source
    /// `numeric` mirrored as `numeric(19,2)`) compare equal. The type tag keeps
    /// `'1'` the string apart from `1` the integer.
    pub fn key_fragment(&self) -> String {
        match self {
            Value::Null => "n:".to_string(),
            Value::Bool(v) => format!("b:{}", v),
            Value::Int16(v) => format!("i:{}", v),
            Value::Int32(v) => format!("i:{}", v),
            Value::Int64(v) => format!("i:{}", v),
            Value::Float32(v) => format!("f:{}", v),
            Value::Float64(v) => format!("f:{}", v),
            Value::Numeric(v) => format!("d:{}", v.normalize()),
            Value::Text(v) => format!("s:{}", v),
            Value::Bytes(v) => format!("x:{:?}", v),
            Value::Date(v) => format!("date:{}", v),
            Value::Time(v) => format!("time:{}", v),
            Value::Timestamp(v) => format!("ts:{}", v),
            Value::TimestampTz(v) => format!("tstz:{}", v.to_rfc3339()),
            Value::Uuid(v) => format!("u:{}", v),
            Value::Json(v) => format!("j:{}", v),
        }
    }
}

impl ToSql for Value {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, Box<dyn StdError + Sync + Send>> {
        // Delegate through to_sql_checked so a type mismatch is an error
        // instead of bytes the server misreads.
        match self {
            Value::Null => Ok(IsNull::Yes),
            Value::Bool(v) => v.to_sql_checked(ty, out),
            Value::Int16(v) => v.to_sql_checked(ty, out),
            Value::Int32(v) => v.to_sql_checked(ty, out),
            Value::Int64(v) => v.to_sql_checked(ty, out),
            Value::Float32(v) => v.to_sql_checked(ty, out),
            Value::Float64(v) => v.to_sql_checked(ty, out),
            Value::Numeric(v) => v.to_sql_checked(ty, out),
            Value::Text(v) => v.to_sql_checked(ty, out),
            Value::Bytes(v) => v.to_sql_checked(ty, out),
            Value::Date(v) => v.to_sql_checked(ty, out),
            Value::Time(v) => v.to_sql_checked(ty, out),
            Value::Timestamp(v) => v.to_sql_checked(ty, out),
            Value::TimestampTz(v) => v.to_sql_checked(ty, out),
            Value::Uuid(v) => v.to_sql_checked(ty, out),
            Value::Json(v) => v.to_sql_checked(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// One source row: column names paired with values, in select order.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new(fields: Vec<(String, Value)>) -> Self {
        Self { fields }
    }

    /// Decode every column of a row.
    pub fn from_row(row: &Row) -> Result<Self> {
        let fields = row
            .columns()
            .iter()
            .enumerate()
            .map(|(idx, column)| Ok((column.name().to_string(), Value::from_row(row, idx)?)))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { fields })
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(name, _)| name.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.fields.iter().map(|(_, value)| value)
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether this record exposes exactly `columns`, in order.
    pub fn has_columns(&self, columns: &[String]) -> bool {
        self.fields.len() == columns.len()
            && self
                .fields
                .iter()
                .zip(columns)
                .all(|((name, _), expected)| name == expected)
    }
}

/// Canonical, hashable form of a primary-key tuple.
pub fn key_of(values: &[Value]) -> Vec<String> {
    values.iter().map(Value::key_fragment).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_record_accessors() {
        let record = Record::new(vec![
            ("id".to_string(), Value::Int32(1)),
            ("name".to_string(), Value::Text("alice".to_string())),
            ("deleted_at".to_string(), Value::Null),
        ]);

        assert_eq!(record.len(), 3);
        assert_eq!(
            record.columns().collect::<Vec<_>>(),
            vec!["id", "name", "deleted_at"]
        );
        assert_eq!(record.get("name"), Some(&Value::Text("alice".to_string())));
        assert!(record.get("deleted_at").unwrap().is_null());
        assert!(record.get("missing").is_none());
    }

    #[test]
    fn test_has_columns_is_order_sensitive() {
        let record = Record::new(vec![
            ("id".to_string(), Value::Int32(1)),
            ("name".to_string(), Value::Null),
        ]);
        assert!(record.has_columns(&["id".to_string(), "name".to_string()]));
        assert!(!record.has_columns(&["name".to_string(), "id".to_string()]));
        assert!(!record.has_columns(&["id".to_string()]));
    }

    #[test]
    fn test_numeric_keys_compare_by_value() {
        let source = Value::Numeric(Decimal::from_str("1.5").unwrap());
        let target = Value::Numeric(Decimal::from_str("1.50").unwrap());
        assert_eq!(source.key_fragment(), target.key_fragment());
    }

    #[test]
    fn test_key_fragments_keep_types_apart() {
        assert_ne!(
            Value::Int32(1).key_fragment(),
            Value::Text("1".to_string()).key_fragment()
        );
        // int2/int4/int8 of the same number are the same key
        assert_eq!(Value::Int16(7).key_fragment(), Value::Int64(7).key_fragment());
    }

    #[test]
    fn test_composite_key() {
        let key = key_of(&[Value::Text("DOC-1".to_string()), Value::Int64(3)]);
        assert_eq!(key, vec!["s:DOC-1".to_string(), "i:3".to_string()]);
    }

    #[test]
    fn test_to_sql_null_and_mismatch() {
        let mut buf = BytesMut::new();
        assert!(matches!(
            Value::Null.to_sql(&Type::INT4, &mut buf).unwrap(),
            IsNull::Yes
        ));

        // An i32 must not be written into an int8 slot.
        let mut buf = BytesMut::new();
        assert!(Value::Int32(5).to_sql(&Type::INT8, &mut buf).is_err());

        let mut buf = BytesMut::new();
        assert!(matches!(
            Value::Int64(5).to_sql(&Type::INT8, &mut buf).unwrap(),
            IsNull::No
        ));
        assert_eq!(buf.len(), 8);
    }
}
