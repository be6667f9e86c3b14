//! Row decoding into JSON objects.
//!
//! Each column is first classified into a [`TypeCategory`] from its declared
//! type name, then decoded by the driver-specific module below.
//!
//! SQLite values carry their own storage class, so the SQLite decoder falls
//! back to decoding by runtime type when the declared type does not match
//! (expression columns such as `count(*)` have no declared type at all).

use crate::models::DatabaseType;
use serde_json::{Map, Value as JsonValue};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo};

/// Logical category of a column type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Timestamp,
    TimestampTz,
    Date,
    Time,
    Unknown,
}

impl TypeCategory {
    /// Classify a declared type name for the given engine.
    pub fn of(type_name: &str, db: DatabaseType) -> Self {
        let lower = type_name.to_ascii_lowercase();
        let name = lower.as_str();

        match name {
            // SQLite's NUMERIC affinity stores plain numbers
            "numeric" if db == DatabaseType::SQLite => return Self::Float,
            "bool" | "boolean" => return Self::Boolean,
            "real" => return Self::Float,
            "json" | "jsonb" => return Self::Json,
            "uuid" => return Self::Uuid,
            "bytea" => return Self::Binary,
            "name" => return Self::Text,
            _ => {}
        }

        // Temporal types are only decoded natively on PostgreSQL; SQLite stores them as text
        if db == DatabaseType::PostgreSQL {
            match name {
                "timestamptz" => return Self::TimestampTz,
                "timestamp" => return Self::Timestamp,
                "date" => return Self::Date,
                "time" => return Self::Time,
                _ => {}
            }
        }

        let contains = |needles: &[&str]| needles.iter().any(|n| name.contains(n));
        if contains(&["decimal", "numeric"]) {
            Self::Decimal
        } else if contains(&["int", "serial"]) {
            Self::Integer
        } else if contains(&["float", "double"]) {
            Self::Float
        } else if contains(&["blob"]) {
            Self::Binary
        } else if contains(&["char", "text"]) {
            Self::Text
        } else {
            Self::Unknown
        }
    }
}

/// NUMERIC read as its exact textual form.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        matches!(ty.name(), "NUMERIC" | "DECIMAL")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        <&str as Decode<sqlx::Postgres>>::decode(value).map(|s| RawDecimal(s.to_owned()))
    }
}

/// Binary data is returned base64 encoded.
pub fn encode_binary_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    JsonValue::String(STANDARD.encode(bytes))
}

/// Non-finite floats have no JSON number form and are returned as strings.
fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

/// Conversion of a driver row into a column name to value map.
pub trait RowToJson {
    fn to_json_map(&self) -> Map<String, JsonValue>;
}

impl RowToJson for PgRow {
    fn to_json_map(&self) -> Map<String, JsonValue> {
        self.columns()
            .iter()
            .map(|col| {
                let category = TypeCategory::of(col.type_info().name(), DatabaseType::PostgreSQL);
                (col.name().to_string(), postgres::decode_column(self, col.ordinal(), category))
            })
            .collect()
    }
}

impl RowToJson for SqliteRow {
    fn to_json_map(&self) -> Map<String, JsonValue> {
        self.columns()
            .iter()
            .map(|col| {
                let category = TypeCategory::of(col.type_info().name(), DatabaseType::SQLite);
                (col.name().to_string(), sqlite::decode_column(self, col.ordinal(), category))
            })
            .collect()
    }
}

mod postgres {
    use super::*;
    use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};

    /// `Ok(None)` is SQL NULL, `Err` means `T` does not fit the column.
    fn decode_as<T>(row: &PgRow, idx: usize) -> Result<Option<T>, sqlx::Error>
    where
        T: for<'r> Decode<'r, sqlx::Postgres> + Type<sqlx::Postgres>,
    {
        row.try_get::<Option<T>, _>(idx)
    }

    fn display<T>(row: &PgRow, idx: usize) -> JsonValue
    where
        T: std::fmt::Display + for<'r> Decode<'r, sqlx::Postgres> + Type<sqlx::Postgres>,
    {
        match decode_as::<T>(row, idx) {
            Ok(Some(v)) => JsonValue::String(v.to_string()),
            _ => JsonValue::Null,
        }
    }

    fn integer(row: &PgRow, idx: usize) -> JsonValue {
        let value = decode_as::<i64>(row, idx)
            .or_else(|_| decode_as::<i32>(row, idx).map(|v| v.map(i64::from)))
            .or_else(|_| decode_as::<i16>(row, idx).map(|v| v.map(i64::from)));
        match value {
            Ok(Some(v)) => JsonValue::from(v),
            _ => JsonValue::Null,
        }
    }

    fn float(row: &PgRow, idx: usize) -> JsonValue {
        let value = decode_as::<f64>(row, idx)
            .or_else(|_| decode_as::<f32>(row, idx).map(|v| v.map(f64::from)));
        match value {
            Ok(Some(v)) => float_value(v),
            _ => JsonValue::Null,
        }
    }

    fn decimal(row: &PgRow, idx: usize) -> JsonValue {
        match decode_as::<RawDecimal>(row, idx) {
            Ok(Some(v)) => JsonValue::String(v.0),
            Ok(None) => JsonValue::Null,
            Err(e) => {
                tracing::error!(column = idx, error = %e, "Failed to decode NUMERIC");
                JsonValue::Null
            }
        }
    }

    pub fn decode_column(row: &PgRow, idx: usize, category: TypeCategory) -> JsonValue {
        match category {
            TypeCategory::Integer => integer(row, idx),
            TypeCategory::Float => float(row, idx),
            TypeCategory::Decimal => decimal(row, idx),
            TypeCategory::Boolean => decode_as::<bool>(row, idx)
                .ok()
                .flatten()
                .map_or(JsonValue::Null, JsonValue::Bool),
            TypeCategory::Binary => decode_as::<Vec<u8>>(row, idx)
                .ok()
                .flatten()
                .map_or(JsonValue::Null, |v| encode_binary_value(&v)),
            TypeCategory::Json => decode_as::<JsonValue>(row, idx)
                .ok()
                .flatten()
                .unwrap_or(JsonValue::Null),
            TypeCategory::Uuid => display::<uuid::Uuid>(row, idx),
            TypeCategory::TimestampTz => display::<DateTime<Utc>>(row, idx),
            TypeCategory::Timestamp => display::<NaiveDateTime>(row, idx),
            TypeCategory::Date => display::<NaiveDate>(row, idx),
            TypeCategory::Time => display::<NaiveTime>(row, idx),
            TypeCategory::Text | TypeCategory::Unknown => decode_as::<String>(row, idx)
                .ok()
                .flatten()
                .map_or(JsonValue::Null, JsonValue::String),
        }
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(row: &SqliteRow, idx: usize, category: TypeCategory) -> JsonValue {
        let declared = match category {
            TypeCategory::Boolean => row
                .try_get::<Option<bool>, _>(idx)
                .ok()
                .map(|v| v.map_or(JsonValue::Null, JsonValue::Bool)),
            TypeCategory::Json => row
                .try_get::<Option<String>, _>(idx)
                .ok()
                .flatten()
                .and_then(|text| serde_json::from_str(&text).ok()),
            _ => None,
        };
        declared.unwrap_or_else(|| by_storage_class(row, idx))
    }

    /// Decode by the value's runtime storage class.
    fn by_storage_class(row: &SqliteRow, idx: usize) -> JsonValue {
        match row.try_get::<Option<i64>, _>(idx) {
            Ok(Some(v)) => return JsonValue::from(v),
            Ok(None) => return JsonValue::Null,
            Err(_) => {}
        }
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return float_value(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<String>, _>(idx) {
            return JsonValue::String(v);
        }
        match row.try_get::<Option<Vec<u8>>, _>(idx) {
            Ok(Some(v)) => encode_binary_value(&v),
            _ => JsonValue::Null,
        }
    }
}
