//! The nine catalogue data types and their tagged value union.

use std::cmp::Ordering;
use std::fmt;

use chrono::{NaiveDate, NaiveDateTime, Timelike};
use uuid::Uuid;

use crate::geometry::Geometry;

#[derive(thiserror::Error, Debug)]
#[error("{0}")]
pub struct ParseValueError(pub String);

/// The type of a catalogue field.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Boolean,
    Integer32,
    Long64,
    Real,
    Text,
    Timestamp,
    Uuid,
    Geometry,
    Json,
}

impl DataType {
    pub fn name(&self) -> &'static str {
        match self {
            DataType::Boolean => "boolean",
            DataType::Integer32 => "integer32",
            DataType::Long64 => "long64",
            DataType::Real => "real",
            DataType::Text => "text",
            DataType::Timestamp => "timestamp",
            DataType::Uuid => "uuid",
            DataType::Geometry => "geometry",
            DataType::Json => "json",
        }
    }

    pub fn from_name(name: &str) -> Option<DataType> {
        Some(match name {
            "boolean" => DataType::Boolean,
            "integer32" => DataType::Integer32,
            "long64" => DataType::Long64,
            "real" => DataType::Real,
            "text" => DataType::Text,
            "timestamp" => DataType::Timestamp,
            "uuid" => DataType::Uuid,
            "geometry" => DataType::Geometry,
            "json" => DataType::Json,
            _ => return None,
        })
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Integer32 | DataType::Long64 | DataType::Real)
    }

    /// Types with a total comparison order. Geometry and JSON compare only
    /// by equality where a backend supports it at all.
    pub fn has_order(&self) -> bool {
        !matches!(self, DataType::Geometry | DataType::Json)
    }

    /// The wider of two numeric types, if both are numeric.
    pub fn widen(self, other: DataType) -> Option<DataType> {
        if !self.is_numeric() || !other.is_numeric() {
            return None;
        }
        Some(match (self, other) {
            (DataType::Real, _) | (_, DataType::Real) => DataType::Real,
            (DataType::Long64, _) | (_, DataType::Long64) => DataType::Long64,
            _ => DataType::Integer32,
        })
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Minimum timestamp value, the `00` literal sentinel.
pub fn timestamp_min() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or(NaiveDateTime::MIN)
}

/// Maximum timestamp value, the `99` literal sentinel.
pub fn timestamp_max() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(9999, 12, 31)
        .and_then(|d| d.and_hms_micro_opt(23, 59, 59, 999_999))
        .unwrap_or(NaiveDateTime::MAX)
}

/// Parse a timestamp literal: `YYYY-MM-DD[THH:MM:SS[.ffffff]]`, where a
/// `00` month or day denotes the minimum timestamp and `99` the maximum.
pub fn parse_timestamp(text: &str) -> Result<NaiveDateTime, ParseValueError> {
    let bytes = text.as_bytes();
    if bytes.len() >= 10 && bytes[4] == b'-' && bytes[7] == b'-' {
        let month = &bytes[5..7];
        let day = &bytes[8..10];
        if month == b"00" || day == b"00" {
            return Ok(timestamp_min());
        }
        if month == b"99" || day == b"99" {
            return Ok(timestamp_max());
        }
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(value) = NaiveDateTime::parse_from_str(text, format) {
            return check_precision(value, text);
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        if let Some(value) = date.and_hms_opt(0, 0, 0) {
            return Ok(value);
        }
    }
    Err(ParseValueError(format!("invalid timestamp {:?}", text)))
}

fn check_precision(value: NaiveDateTime, text: &str) -> Result<NaiveDateTime, ParseValueError> {
    // chrono parses up to nanoseconds; the catalogue carries microseconds.
    if value.nanosecond() % 1_000 != 0 {
        return Err(ParseValueError(format!(
            "timestamp {:?} exceeds microsecond precision",
            text
        )));
    }
    Ok(value)
}

/// Format a timestamp the way the expression language and the CLI print it.
pub fn format_timestamp(value: &NaiveDateTime) -> String {
    value.format("%Y-%m-%dT%H:%M:%S%.6f").to_string()
}

/// A typed catalogue value.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Boolean(bool),
    Integer32(i32),
    Long64(i64),
    Real(f64),
    Text(String),
    Timestamp(NaiveDateTime),
    Uuid(Uuid),
    Geometry(Geometry),
    Json(serde_json::Value),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Boolean(_) => DataType::Boolean,
            Value::Integer32(_) => DataType::Integer32,
            Value::Long64(_) => DataType::Long64,
            Value::Real(_) => DataType::Real,
            Value::Text(_) => DataType::Text,
            Value::Timestamp(_) => DataType::Timestamp,
            Value::Uuid(_) => DataType::Uuid,
            Value::Geometry(_) => DataType::Geometry,
            Value::Json(_) => DataType::Json,
        }
    }

    /// Parse the lexical literal form of `data_type`.
    pub fn parse(data_type: DataType, text: &str) -> Result<Value, ParseValueError> {
        let invalid = || ParseValueError(format!("invalid {} literal {:?}", data_type, text));
        Ok(match data_type {
            DataType::Boolean => match text {
                "true" => Value::Boolean(true),
                "false" => Value::Boolean(false),
                _ => return Err(invalid()),
            },
            DataType::Integer32 => Value::Integer32(text.parse().map_err(|_| invalid())?),
            DataType::Long64 => Value::Long64(text.parse().map_err(|_| invalid())?),
            DataType::Real => Value::Real(text.parse().map_err(|_| invalid())?),
            DataType::Text => Value::Text(text.to_string()),
            DataType::Timestamp => Value::Timestamp(parse_timestamp(text)?),
            DataType::Uuid => Value::Uuid(text.parse().map_err(|_| invalid())?),
            DataType::Geometry => {
                Value::Geometry(Geometry::from_wkt(text).map_err(|e| ParseValueError(e.to_string()))?)
            }
            DataType::Json => {
                Value::Json(serde_json::from_str(text).map_err(|_| invalid())?)
            }
        })
    }

    /// Comparison with implicit numeric widening. `None` when the types are
    /// incomparable or unordered.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        use Value::*;
        match (self, other) {
            (Boolean(a), Boolean(b)) => Some(a.cmp(b)),
            (Text(a), Text(b)) => Some(a.cmp(b)),
            (Timestamp(a), Timestamp(b)) => Some(a.cmp(b)),
            (Uuid(a), Uuid(b)) => Some(a.cmp(b)),
            _ => {
                if self.data_type().is_numeric() && other.data_type().is_numeric() {
                    match (self, other) {
                        (Real(_), _) | (_, Real(_)) => {
                            self.as_real()?.partial_cmp(&other.as_real()?)
                        }
                        _ => Some(self.as_long()?.cmp(&other.as_long()?)),
                    }
                } else {
                    None
                }
            }
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Value::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Integer32(v) => Some(*v as i64),
            Value::Long64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_real(&self) -> Option<f64> {
        match self {
            Value::Integer32(v) => Some(*v as f64),
            Value::Long64(v) => Some(*v as f64),
            Value::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<NaiveDateTime> {
        match self {
            Value::Timestamp(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Value::Uuid(u) => Some(*u),
            _ => None,
        }
    }

    pub fn as_geometry(&self) -> Option<&Geometry> {
        match self {
            Value::Geometry(g) => Some(g),
            _ => None,
        }
    }

    /// Coerce to `data_type`, applying numeric widening. Fails on any lossy
    /// or cross-kind conversion.
    pub fn coerce(self, data_type: DataType) -> Result<Value, ParseValueError> {
        if self.data_type() == data_type {
            return Ok(self);
        }
        let err = || {
            ParseValueError(format!(
                "cannot use {} value where {} is required",
                self.data_type(),
                data_type
            ))
        };
        match (&self, data_type) {
            (Value::Integer32(v), DataType::Long64) => Ok(Value::Long64(*v as i64)),
            (Value::Integer32(v), DataType::Real) => Ok(Value::Real(*v as f64)),
            (Value::Long64(v), DataType::Real) => Ok(Value::Real(*v as f64)),
            (Value::Long64(v), DataType::Integer32) => i32::try_from(*v)
                .map(Value::Integer32)
                .map_err(|_| err()),
            _ => Err(err()),
        }
    }

    /// Render as a JSON value; timestamps, UUIDs and geometry render as
    /// their literal text form.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            Value::Boolean(b) => json!(b),
            Value::Integer32(v) => json!(v),
            Value::Long64(v) => json!(v),
            Value::Real(v) => json!(v),
            Value::Text(s) => json!(s),
            Value::Timestamp(t) => json!(format_timestamp(t)),
            Value::Uuid(u) => json!(u.to_string()),
            Value::Geometry(g) => json!(g.to_string()),
            Value::Json(v) => v.clone(),
        }
    }

    /// Inverse of [`Value::to_json`] for a known target type.
    pub fn from_json(data_type: DataType, value: &serde_json::Value) -> Result<Value, ParseValueError> {
        use serde_json::Value as Json;
        let invalid =
            || ParseValueError(format!("invalid JSON for {} field: {}", data_type, value));
        Ok(match (data_type, value) {
            (DataType::Json, v) => Value::Json(v.clone()),
            (DataType::Boolean, Json::Bool(b)) => Value::Boolean(*b),
            (DataType::Integer32, Json::Number(n)) => {
                let v = n.as_i64().ok_or_else(invalid)?;
                Value::Integer32(i32::try_from(v).map_err(|_| invalid())?)
            }
            (DataType::Long64, Json::Number(n)) => Value::Long64(n.as_i64().ok_or_else(invalid)?),
            (DataType::Real, Json::Number(n)) => Value::Real(n.as_f64().ok_or_else(invalid)?),
            (_, Json::String(s)) => Value::parse(data_type, s)?,
            _ => return Err(invalid()),
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer32(v) => write!(f, "{}", v),
            Value::Long64(v) => write!(f, "{}", v),
            Value::Real(v) => write!(f, "{}", v),
            Value::Text(s) => write!(f, "{}", s),
            Value::Timestamp(t) => write!(f, "{}", format_timestamp(t)),
            Value::Uuid(u) => write!(f, "{}", u),
            Value::Geometry(g) => write!(f, "{}", g),
            Value::Json(v) => write!(f, "{}", v),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::cmp::Ordering;

    #[test]
    fn timestamp_parsing() {
        let t = parse_timestamp("2024-01-01T00:05:00").unwrap();
        assert_eq!(format_timestamp(&t), "2024-01-01T00:05:00.000000");

        let t = parse_timestamp("2024-01-01 12:30:15.250000").unwrap();
        assert_eq!(format_timestamp(&t), "2024-01-01T12:30:15.250000");

        let t = parse_timestamp("2024-06-15").unwrap();
        assert_eq!(format_timestamp(&t), "2024-06-15T00:00:00.000000");

        assert!(parse_timestamp("2024-13-01").is_err());
        assert!(parse_timestamp("not a date").is_err());
    }

    #[test]
    fn timestamp_sentinels() {
        assert_eq!(parse_timestamp("0000-00-00").unwrap(), timestamp_min());
        assert_eq!(parse_timestamp("2024-00-00").unwrap(), timestamp_min());
        assert_eq!(parse_timestamp("9999-99-99").unwrap(), timestamp_max());
        assert_eq!(
            parse_timestamp("9999-99-99T00:00:00").unwrap(),
            timestamp_max()
        );
    }

    #[test]
    fn numeric_widening() {
        assert_eq!(
            Value::Integer32(5).compare(&Value::Long64(5)),
            Some(Ordering::Equal)
        );
        assert_eq!(
            Value::Integer32(5).compare(&Value::Real(5.5)),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Text("x".into()).compare(&Value::Integer32(1)), None);
    }

    #[test]
    fn coercion() {
        assert_eq!(
            Value::Integer32(7).coerce(DataType::Long64).unwrap(),
            Value::Long64(7)
        );
        assert_eq!(
            Value::Long64(7).coerce(DataType::Integer32).unwrap(),
            Value::Integer32(7)
        );
        assert!(Value::Long64(i64::MAX).coerce(DataType::Integer32).is_err());
        assert!(Value::Text("x".into()).coerce(DataType::Real).is_err());
    }

    #[test]
    fn literal_round_trips() {
        for (dt, text) in [
            (DataType::Boolean, "true"),
            (DataType::Integer32, "-17"),
            (DataType::Long64, "12345678901"),
            (DataType::Text, "alpha.dat"),
            (DataType::Uuid, "5e8a6c74-8f2e-4b2a-9f3e-2b1c0d9e8f7a"),
        ] {
            let value = Value::parse(dt, text).unwrap();
            assert_eq!(value.to_string(), text);
            assert_eq!(value.data_type(), dt);
        }
    }

    #[test]
    fn json_conversion() {
        let value = Value::parse(DataType::Timestamp, "2024-01-01T00:00:00").unwrap();
        let json = value.to_json();
        assert_eq!(Value::from_json(DataType::Timestamp, &json).unwrap(), value);

        let value = Value::Integer32(12);
        assert_eq!(
            Value::from_json(DataType::Integer32, &value.to_json()).unwrap(),
            value
        );
    }
}
