//! Decoding of source-native payloads into [`FieldValue`]s.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::value::{field_path, index_path, FieldValue, Timestamp};
use crate::error::SerializationError;

/// How a raw payload encodes its values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NativeFormat {
    /// A Firestore REST `fields` object: every value is a single-key typed
    /// wrapper such as `{"integerValue": "42"}`.
    FirestoreFields,
    /// Ordinary JSON; numbers decide integer versus double.
    PlainJson,
}

/// Decode a raw payload. `path` prefixes every error location.
pub fn decode_native(
    path: &str,
    value: &Value,
    format: NativeFormat,
) -> Result<FieldValue, SerializationError> {
    match format {
        NativeFormat::FirestoreFields => match value {
            Value::Object(fields) => decode_fields(path, fields).map(FieldValue::Map),
            Value::Null => Ok(FieldValue::Map(BTreeMap::new())),
            _ => Err(SerializationError::new(path, "document fields must be an object")),
        },
        NativeFormat::PlainJson => decode_plain(path, value),
    }
}

fn decode_fields(
    path: &str,
    fields: &Map<String, Value>,
) -> Result<BTreeMap<String, FieldValue>, SerializationError> {
    fields
        .iter()
        .map(|(k, v)| Ok((k.clone(), decode_typed(&field_path(path, k), v)?)))
        .collect()
}

/// Decode one Firestore typed value wrapper.
pub fn decode_typed(path: &str, value: &Value) -> Result<FieldValue, SerializationError> {
    let obj = value
        .as_object()
        .ok_or_else(|| SerializationError::new(path, "typed value must be an object"))?;
    let (kind, inner) = match obj.iter().next() {
        Some(entry) if obj.len() == 1 => entry,
        _ => {
            return Err(SerializationError::new(
                path,
                format!("typed value must have exactly one key, found {}", obj.len()),
            ))
        }
    };

    match kind.as_str() {
        "nullValue" => Ok(FieldValue::Null),
        "booleanValue" => inner
            .as_bool()
            .map(FieldValue::Boolean)
            .ok_or_else(|| SerializationError::new(path, "booleanValue is not a bool")),
        "integerValue" => decode_integer(path, inner).map(FieldValue::Integer),
        "doubleValue" => decode_double(path, inner).map(FieldValue::Double),
        "timestampValue" => {
            let s = inner
                .as_str()
                .ok_or_else(|| SerializationError::new(path, "timestampValue is not a string"))?;
            Timestamp::parse_rfc3339(s)
                .map(FieldValue::Timestamp)
                .ok_or_else(|| SerializationError::new(path, format!("invalid timestamp '{}'", s)))
        }
        "stringValue" => inner
            .as_str()
            .map(|s| FieldValue::String(s.to_string()))
            .ok_or_else(|| SerializationError::new(path, "stringValue is not a string")),
        "bytesValue" => {
            let s = inner
                .as_str()
                .ok_or_else(|| SerializationError::new(path, "bytesValue is not a string"))?;
            BASE64
                .decode(s)
                .map(FieldValue::Bytes)
                .map_err(|e| SerializationError::new(path, format!("invalid base64: {}", e)))
        }
        "referenceValue" => inner
            .as_str()
            .map(|s| FieldValue::Reference(canonical_document_path(s)))
            .ok_or_else(|| SerializationError::new(path, "referenceValue is not a string")),
        "geoPointValue" => {
            let coord = |key: &str| -> Result<f64, SerializationError> {
                match inner.get(key) {
                    None => Ok(0.0),
                    Some(v) => decode_double(&field_path(path, key), v),
                }
            };
            Ok(FieldValue::GeoPoint {
                latitude: coord("latitude")?,
                longitude: coord("longitude")?,
            })
        }
        "arrayValue" => match inner.get("values") {
            None | Some(Value::Null) => Ok(FieldValue::Array(Vec::new())),
            Some(Value::Array(values)) => values
                .iter()
                .enumerate()
                .map(|(i, v)| decode_typed(&index_path(path, i), v))
                .collect::<Result<_, _>>()
                .map(FieldValue::Array),
            Some(_) => Err(SerializationError::new(path, "arrayValue.values is not a list")),
        },
        "mapValue" => match inner.get("fields") {
            None | Some(Value::Null) => Ok(FieldValue::Map(BTreeMap::new())),
            Some(Value::Object(fields)) => decode_fields(path, fields).map(FieldValue::Map),
            Some(_) => Err(SerializationError::new(path, "mapValue.fields is not an object")),
        },
        other => Err(SerializationError::new(
            path,
            format!("unsupported value type '{}'", other),
        )),
    }
}

fn decode_integer(path: &str, inner: &Value) -> Result<i64, SerializationError> {
    match inner {
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| SerializationError::new(path, format!("integer '{}' out of range", s))),
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| SerializationError::new(path, format!("integer {} out of range", n))),
        _ => Err(SerializationError::new(path, "integerValue is not an integer")),
    }
}

fn decode_double(path: &str, inner: &Value) -> Result<f64, SerializationError> {
    match inner {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| SerializationError::new(path, "doubleValue is not a number")),
        Value::String(s) => match s.as_str() {
            "NaN" => Ok(f64::NAN),
            "Infinity" => Ok(f64::INFINITY),
            "-Infinity" => Ok(f64::NEG_INFINITY),
            other => other
                .parse::<f64>()
                .map_err(|_| SerializationError::new(path, format!("invalid double '{}'", other))),
        },
        _ => Err(SerializationError::new(path, "doubleValue is not a number")),
    }
}

/// Strip the `projects/<p>/databases/<d>/documents/` prefix from a resource
/// name, leaving the document path.
pub fn canonical_document_path(name: &str) -> String {
    match name.find("/documents/") {
        Some(idx) => name[idx + "/documents/".len()..].to_string(),
        None => name.to_string(),
    }
}

fn decode_plain(path: &str, value: &Value) -> Result<FieldValue, SerializationError> {
    Ok(match value {
        Value::Null => FieldValue::Null,
        Value::Bool(b) => FieldValue::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                FieldValue::Integer(i)
            } else if n.is_u64() {
                return Err(SerializationError::new(
                    path,
                    format!("integer {} exceeds 64-bit signed range", n),
                ));
            } else {
                match n.as_f64() {
                    Some(d) => FieldValue::Double(d),
                    None => {
                        return Err(SerializationError::new(
                            path,
                            format!("unrepresentable number {}", n),
                        ))
                    }
                }
            }
        }
        Value::String(s) => FieldValue::String(s.clone()),
        Value::Array(items) => FieldValue::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, v)| decode_plain(&index_path(path, i), v))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(obj) => FieldValue::Map(
            obj.iter()
                .map(|(k, v)| Ok((k.clone(), decode_plain(&field_path(path, k), v)?)))
                .collect::<Result<_, SerializationError>>()?,
        ),
    })
}
