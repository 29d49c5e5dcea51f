//! Field values as they travel through the protocol.
//!
//! Readers receive an owned [`Value`] decoded from the stream; writers hand
//! back a borrowed [`FieldValue`] that serializes straight out of the record.

use std::collections::BTreeMap;
use std::fmt;

use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

use crate::error::{ArchiveError, ArchiveResult};

/// Text token for a non-finite double, or `None` for finite values.
pub fn non_finite_token(value: f64) -> Option<&'static str> {
    if value.is_nan() {
        Some("NaN")
    } else if value == f64::INFINITY {
        Some("Infinity")
    } else if value == f64::NEG_INFINITY {
        Some("-Infinity")
    } else {
        None
    }
}

/// Parses a text token written by [`non_finite_token`].
pub fn parse_non_finite(token: &str) -> Option<f64> {
    match token {
        "NaN" => Some(f64::NAN),
        "Infinity" | "+Infinity" | "INF" => Some(f64::INFINITY),
        "-Infinity" | "-INF" => Some(f64::NEG_INFINITY),
        _ => None,
    }
}

/// A double that survives text encodings: non-finite values become strings
/// when the serializer is human readable.
#[derive(Debug, Clone, Copy)]
pub struct Double(pub f64);

impl Serialize for Double {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match non_finite_token(self.0) {
            Some(token) if serializer.is_human_readable() => serializer.serialize_str(token),
            _ => serializer.serialize_f64(self.0),
        }
    }
}

/// Owned, self-describing value decoded from either encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Explicit null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Floating point number.
    Float(f64),
    /// String.
    Str(String),
    /// Array.
    Array(Vec<Value>),
    /// Object with fields in stream order.
    Object(Vec<(String, Value)>),
}

impl Value {
    /// Short name of the variant for diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Float(_) => "number",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// Borrows the string content.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view; accepts integers and the non-finite string tokens.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Str(s) => parse_non_finite(s),
            _ => None,
        }
    }

    /// Integer view; accepts whole floats.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            _ => None,
        }
    }

    /// Boolean view.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Looks up a field of an object by exact name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Object(fields) => fields.iter().find(|(k, _)| k == name).map(|(_, v)| v),
            _ => None,
        }
    }

    /// Consumes the value as a string.
    pub fn into_string(self, field: &str) -> ArchiveResult<String> {
        match self {
            Value::Str(s) => Ok(s),
            other => Err(mismatch(field, "string", &other)),
        }
    }

    /// Consumes the value as an array.
    pub fn into_array(self, field: &str) -> ArchiveResult<Vec<Value>> {
        match self {
            Value::Array(items) => Ok(items),
            other => Err(mismatch(field, "array", &other)),
        }
    }

    /// Consumes the value as an object.
    pub fn into_object(self, field: &str) -> ArchiveResult<Vec<(String, Value)>> {
        match self {
            Value::Object(fields) => Ok(fields),
            other => Err(mismatch(field, "object", &other)),
        }
    }

    /// Consumes an array of strings.
    pub fn into_strings(self, field: &str) -> ArchiveResult<Vec<String>> {
        self.into_array(field)?
            .into_iter()
            .map(|v| v.into_string(field))
            .collect()
    }

    /// Consumes an array of numbers.
    pub fn into_doubles(self, field: &str) -> ArchiveResult<Vec<f64>> {
        self.into_array(field)?
            .into_iter()
            .map(|v| v.as_f64().ok_or_else(|| mismatch(field, "number", &v)))
            .collect()
    }

    /// Reads a number.
    pub fn to_f64(&self, field: &str) -> ArchiveResult<f64> {
        self.as_f64().ok_or_else(|| mismatch(field, "number", self))
    }

    /// Reads an integer that fits in `i32`.
    pub fn to_i32(&self, field: &str) -> ArchiveResult<i32> {
        self.as_i64()
            .and_then(|i| i32::try_from(i).ok())
            .ok_or_else(|| mismatch(field, "32-bit integer", self))
    }

    /// Reads a non-negative count.
    pub fn to_u64(&self, field: &str) -> ArchiveResult<u64> {
        self.as_i64()
            .and_then(|i| u64::try_from(i).ok())
            .ok_or_else(|| mismatch(field, "count", self))
    }
}

fn mismatch(field: &str, expected: &str, found: &Value) -> ArchiveError {
    ArchiveError::field(field, format!("expected {expected}, found {}", found.kind()))
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(ValueVisitor)
    }
}

struct ValueVisitor;

impl<'de> Visitor<'de> for ValueVisitor {
    type Value = Value;

    fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("any value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Value, E> {
        Ok(Value::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Value, E> {
        Ok(Value::Int(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Value, E> {
        Ok(match i64::try_from(v) {
            Ok(i) => Value::Int(i),
            Err(_) => Value::Float(v as f64),
        })
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Value, E> {
        Ok(Value::Float(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Value, E> {
        Ok(Value::Str(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Value, E> {
        Ok(Value::Str(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Value, E> {
        Ok(Value::Array(v.iter().map(|b| Value::Int(i64::from(*b))).collect()))
    }

    fn visit_none<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_unit<E: de::Error>(self) -> Result<Value, E> {
        Ok(Value::Null)
    }

    fn visit_some<D: Deserializer<'de>>(self, d: D) -> Result<Value, D::Error> {
        Value::deserialize(d)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Value, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0).min(4096));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(Value::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Value, A::Error> {
        let mut fields = Vec::with_capacity(map.size_hint().unwrap_or(0).min(4096));
        while let Some((key, value)) = map.next_entry::<String, Value>()? {
            fields.push((key, value));
        }
        Ok(Value::Object(fields))
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(i) => serializer.serialize_i64(*i),
            Value::Float(f) => Double(*f).serialize(serializer),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Object(fields) => {
                let mut map = serializer.serialize_map(Some(fields.len()))?;
                for (k, v) in fields {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

/// Borrowed view a field writer emits.
#[derive(Debug, Clone)]
pub enum FieldValue<'a> {
    /// Boolean.
    Bool(bool),
    /// Integer.
    Int(i64),
    /// Double, possibly non-finite.
    Float(f64),
    /// String.
    Str(&'a str),
    /// Array of strings.
    Strings(&'a [String]),
    /// Array of doubles.
    Doubles(&'a [f64]),
    /// Object of named doubles.
    NamedDoubles(&'a BTreeMap<String, f64>),
    /// Heterogeneous array.
    List(Vec<FieldValue<'a>>),
    /// Object with fields in emission order.
    Object(Vec<(&'a str, FieldValue<'a>)>),
}

impl Serialize for FieldValue<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            FieldValue::Bool(b) => serializer.serialize_bool(*b),
            FieldValue::Int(i) => serializer.serialize_i64(*i),
            FieldValue::Float(f) => Double(*f).serialize(serializer),
            FieldValue::Str(s) => serializer.serialize_str(s),
            FieldValue::Strings(items) => serializer.collect_seq(items.iter()),
            FieldValue::Doubles(items) => serializer.collect_seq(items.iter().map(|v| Double(*v))),
            FieldValue::NamedDoubles(map) => {
                serializer.collect_map(map.iter().map(|(k, v)| (k, Double(*v))))
            }
            FieldValue::List(items) => serializer.collect_seq(items),
            FieldValue::Object(fields) => {
                let mut map = serializer.serialize_map(Some(fields.len()))?;
                for (k, v) in fields {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}
