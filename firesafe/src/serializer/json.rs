//! JSON embedding of [`SerializedValue`].
//!
//! Primitives map to plain JSON. Everything JSON cannot express on its own
//! becomes an object tagged with `_type`:
//!
//! ```text
//! {"_type": "timestamp", "seconds": 1700000000, "nanos": 500, "value": "2023-11-14T22:13:20.000000500Z"}
//! {"_type": "geopoint", "latitude": 59.91, "longitude": 10.75}
//! {"_type": "reference", "path": "users/alice"}
//! {"_type": "bytes", "value": "AJ//"}
//! {"_type": "double", "value": "NaN"}
//! {"_type": "map", "value": {"_type": "user data that happens to use the tag key"}}
//! ```

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

use super::value::{field_path, index_path, Number, SerializedValue, Timestamp};
use crate::error::SerializationError;

pub const TYPE_TAG: &str = "_type";

/// Render a portable value as JSON.
pub fn to_json(value: &SerializedValue) -> Value {
    match value {
        SerializedValue::Null => Value::Null,
        SerializedValue::Bool(b) => Value::Bool(*b),
        SerializedValue::Number(Number::Integer(i)) => Value::from(*i),
        SerializedValue::Number(Number::Double(d)) => double_to_json(*d),
        SerializedValue::String(s) => Value::String(s.clone()),
        SerializedValue::Timestamp { seconds, nanos } => {
            let mut obj = json!({
                TYPE_TAG: "timestamp",
                "seconds": seconds,
                "nanos": nanos,
            });
            if let Some(rendered) = Timestamp::new(*seconds, *nanos).to_rfc3339() {
                obj["value"] = Value::String(rendered);
            }
            obj
        }
        SerializedValue::GeoPoint { lat, lon } => json!({
            TYPE_TAG: "geopoint",
            "latitude": double_to_json(*lat),
            "longitude": double_to_json(*lon),
        }),
        SerializedValue::Reference { path } => json!({
            TYPE_TAG: "reference",
            "path": path,
        }),
        SerializedValue::Binary { base64 } => json!({
            TYPE_TAG: "bytes",
            "value": base64,
        }),
        SerializedValue::Array(items) => Value::Array(items.iter().map(to_json).collect()),
        SerializedValue::Map(fields) => {
            let obj: Map<String, Value> = fields
                .iter()
                .map(|(k, v)| (k.clone(), to_json(v)))
                .collect();
            if obj.contains_key(TYPE_TAG) {
                json!({ TYPE_TAG: "map", "value": Value::Object(obj) })
            } else {
                Value::Object(obj)
            }
        }
    }
}

fn double_to_json(d: f64) -> Value {
    if d.is_finite() {
        // from_f64 only refuses non-finite values
        serde_json::Number::from_f64(d)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    } else {
        let rendered = if d.is_nan() {
            "NaN"
        } else if d > 0.0 {
            "Infinity"
        } else {
            "-Infinity"
        };
        json!({ TYPE_TAG: "double", "value": rendered })
    }
}

/// Parse the JSON embedding back into a portable value.
pub fn from_json(value: &Value) -> Result<SerializedValue, SerializationError> {
    from_json_at("", value)
}

fn from_json_at(path: &str, value: &Value) -> Result<SerializedValue, SerializationError> {
    Ok(match value {
        Value::Null => SerializedValue::Null,
        Value::Bool(b) => SerializedValue::Bool(*b),
        Value::Number(n) => SerializedValue::Number(number_from_json(path, n)?),
        Value::String(s) => SerializedValue::String(s.clone()),
        Value::Array(items) => SerializedValue::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, v)| from_json_at(&index_path(path, i), v))
                .collect::<Result<_, _>>()?,
        ),
        Value::Object(obj) => match obj.get(TYPE_TAG) {
            None => SerializedValue::Map(object_from_json(path, obj)?),
            Some(Value::String(tag)) => tagged_from_json(path, tag, obj)?,
            Some(_) => {
                return Err(SerializationError::new(path, "type tag must be a string"));
            }
        },
    })
}

fn number_from_json(path: &str, n: &serde_json::Number) -> Result<Number, SerializationError> {
    if let Some(i) = n.as_i64() {
        Ok(Number::Integer(i))
    } else if n.is_u64() {
        Err(SerializationError::new(
            path,
            format!("integer {} exceeds 64-bit signed range", n),
        ))
    } else {
        n.as_f64()
            .map(Number::Double)
            .ok_or_else(|| SerializationError::new(path, format!("unrepresentable number {}", n)))
    }
}

fn object_from_json(
    path: &str,
    obj: &Map<String, Value>,
) -> Result<BTreeMap<String, SerializedValue>, SerializationError> {
    obj.iter()
        .map(|(k, v)| Ok((k.clone(), from_json_at(&field_path(path, k), v)?)))
        .collect()
}

fn tagged_from_json(
    path: &str,
    tag: &str,
    obj: &Map<String, Value>,
) -> Result<SerializedValue, SerializationError> {
    match tag {
        "timestamp" => {
            let seconds = obj
                .get("seconds")
                .and_then(Value::as_i64)
                .ok_or_else(|| SerializationError::new(path, "timestamp without seconds"))?;
            let nanos = obj
                .get("nanos")
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok())
                .ok_or_else(|| SerializationError::new(path, "timestamp without nanos"))?;
            Ok(SerializedValue::Timestamp { seconds, nanos })
        }
        "geopoint" => Ok(SerializedValue::GeoPoint {
            lat: double_field(path, obj, "latitude")?,
            lon: double_field(path, obj, "longitude")?,
        }),
        "reference" => Ok(SerializedValue::Reference {
            path: string_field(path, obj, "path")?,
        }),
        "bytes" => Ok(SerializedValue::Binary {
            base64: string_field(path, obj, "value")?,
        }),
        "double" => {
            let raw = obj
                .get("value")
                .ok_or_else(|| SerializationError::new(path, "double without value"))?;
            Ok(SerializedValue::Number(Number::Double(double_from_json(
                path, raw,
            )?)))
        }
        "map" => match obj.get("value") {
            Some(Value::Object(inner)) => Ok(SerializedValue::Map(object_from_json(path, inner)?)),
            _ => Err(SerializationError::new(path, "map wrapper without object value")),
        },
        other => Err(SerializationError::new(
            path,
            format!("unknown type tag '{}'", other),
        )),
    }
}

fn double_field(path: &str, obj: &Map<String, Value>, key: &str) -> Result<f64, SerializationError> {
    let raw = obj
        .get(key)
        .ok_or_else(|| SerializationError::new(path, format!("missing '{}'", key)))?;
    double_from_json(&field_path(path, key), raw)
}

fn double_from_json(path: &str, raw: &Value) -> Result<f64, SerializationError> {
    match raw {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| SerializationError::new(path, "not a double")),
        Value::String(s) => match s.as_str() {
            "NaN" => Ok(f64::NAN),
            "Infinity" => Ok(f64::INFINITY),
            "-Infinity" => Ok(f64::NEG_INFINITY),
            other => Err(SerializationError::new(
                path,
                format!("invalid double '{}'", other),
            )),
        },
        Value::Object(obj) if obj.get(TYPE_TAG).and_then(Value::as_str) == Some("double") => {
            let inner = obj
                .get("value")
                .ok_or_else(|| SerializationError::new(path, "double without value"))?;
            double_from_json(path, inner)
        }
        _ => Err(SerializationError::new(path, "not a double")),
    }
}

fn string_field(path: &str, obj: &Map<String, Value>, key: &str) -> Result<String, SerializationError> {
    obj.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| SerializationError::new(path, format!("missing string '{}'", key)))
}

impl Serialize for SerializedValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        to_json(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SerializedValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        from_json(&value).map_err(D::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitives_are_plain_json() {
        assert_eq!(to_json(&SerializedValue::Bool(true)), json!(true));
        assert_eq!(
            to_json(&SerializedValue::Number(Number::Integer(-7))),
            json!(-7)
        );
        assert_eq!(
            to_json(&SerializedValue::String("hi".into())),
            json!("hi")
        );
    }

    #[test]
    fn test_timestamp_embedding() {
        let v = SerializedValue::Timestamp {
            seconds: 1_700_000_000,
            nanos: 500,
        };
        let j = to_json(&v);
        assert_eq!(j["_type"], "timestamp");
        assert_eq!(j["nanos"], 500);
        assert_eq!(j["value"], "2023-11-14T22:13:20.000000500Z");
        assert_eq!(from_json(&j).unwrap(), v);
    }

    #[test]
    fn test_double_survives_text_round_trip() {
        for d in [1.0, -0.0, 0.1 + 0.2, f64::MIN_POSITIVE, f64::MAX, f64::NAN, f64::NEG_INFINITY] {
            let v = SerializedValue::Number(Number::Double(d));
            let text = serde_json::to_string(&v).unwrap();
            let back: SerializedValue = serde_json::from_str(&text).unwrap();
            assert_eq!(back, v, "double {} via {}", d, text);
        }
    }

    #[test]
    fn test_whole_double_is_not_read_back_as_integer() {
        let text = serde_json::to_string(&SerializedValue::Number(Number::Double(3.0))).unwrap();
        let back: SerializedValue = serde_json::from_str(&text).unwrap();
        assert_eq!(back, SerializedValue::Number(Number::Double(3.0)));
    }

    #[test]
    fn test_map_with_tag_key_is_wrapped() {
        let mut fields = BTreeMap::new();
        fields.insert(
            "_type".to_string(),
            SerializedValue::String("timestamp".into()),
        );
        let v = SerializedValue::Map(fields);
        let j = to_json(&v);
        assert_eq!(j["_type"], "map");
        assert_eq!(from_json(&j).unwrap(), v);
    }

    #[test]
    fn test_unknown_tag_rejected_with_path() {
        let j = json!({"loc": [{"_type": "vector", "value": [1, 2]}]});
        let err = from_json(&j).unwrap_err();
        assert_eq!(err.path, "loc[0]");
        assert!(err.reason.contains("vector"));
    }
}
