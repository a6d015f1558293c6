use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use std::collections::BTreeMap;

use crate::error::SerializationError;

pub(crate) const NANOS_PER_SECOND: u32 = 1_000_000_000;

/// A point in time with nanosecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Timestamp {
    pub seconds: i64,
    pub nanos: u32,
}

impl Timestamp {
    pub fn new(seconds: i64, nanos: u32) -> Self {
        Self { seconds, nanos }
    }

    /// RFC 3339 rendering in UTC, `None` outside chrono's representable range.
    pub fn to_rfc3339(&self) -> Option<String> {
        DateTime::<Utc>::from_timestamp(self.seconds, self.nanos)
            .map(|dt| dt.to_rfc3339_opts(SecondsFormat::AutoSi, true))
    }

    pub fn parse_rfc3339(s: &str) -> Option<Self> {
        let dt = DateTime::parse_from_rfc3339(s).ok()?;
        Some(Self {
            seconds: dt.timestamp(),
            nanos: dt.timestamp_subsec_nanos(),
        })
    }

    fn validate(&self, path: &str) -> Result<(), SerializationError> {
        if self.nanos >= NANOS_PER_SECOND {
            return Err(SerializationError::new(
                path,
                format!("timestamp nanos {} out of range", self.nanos),
            ));
        }
        Ok(())
    }
}

/// A value as held by a source, before it is made portable.
#[derive(Debug, Clone)]
pub enum FieldValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    String(String),
    Bytes(Vec<u8>),
    /// Canonical document path, never resolved
    Reference(String),
    GeoPoint { latitude: f64, longitude: f64 },
    Array(Vec<FieldValue>),
    Map(BTreeMap<String, FieldValue>),
}

// Doubles compare by bit pattern so that NaN == NaN and 0.0 != -0.0.
impl PartialEq for FieldValue {
    fn eq(&self, other: &Self) -> bool {
        use FieldValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Boolean(a), Boolean(b)) => a == b,
            (Integer(a), Integer(b)) => a == b,
            (Double(a), Double(b)) => a.to_bits() == b.to_bits(),
            (Timestamp(a), Timestamp(b)) => a == b,
            (String(a), String(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (Reference(a), Reference(b)) => a == b,
            (
                GeoPoint {
                    latitude: la,
                    longitude: lo,
                },
                GeoPoint {
                    latitude: lb,
                    longitude: lob,
                },
            ) => la.to_bits() == lb.to_bits() && lo.to_bits() == lob.to_bits(),
            (Array(a), Array(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            _ => false,
        }
    }
}

/// Portable number, keeping the integer/double distinction.
#[derive(Debug, Clone, Copy)]
pub enum Number {
    Integer(i64),
    Double(f64),
}

impl PartialEq for Number {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Number::Integer(a), Number::Integer(b)) => a == b,
            (Number::Double(a), Number::Double(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }
}

/// Portable, self-describing representation of a [`FieldValue`].
#[derive(Debug, Clone)]
pub enum SerializedValue {
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Timestamp { seconds: i64, nanos: u32 },
    GeoPoint { lat: f64, lon: f64 },
    Reference { path: String },
    Binary { base64: String },
    Array(Vec<SerializedValue>),
    Map(BTreeMap<String, SerializedValue>),
}

impl PartialEq for SerializedValue {
    fn eq(&self, other: &Self) -> bool {
        use SerializedValue::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Number(a), Number(b)) => a == b,
            (String(a), String(b)) => a == b,
            (
                Timestamp { seconds, nanos },
                Timestamp {
                    seconds: s2,
                    nanos: n2,
                },
            ) => seconds == s2 && nanos == n2,
            (GeoPoint { lat, lon }, GeoPoint { lat: l2, lon: o2 }) => {
                lat.to_bits() == l2.to_bits() && lon.to_bits() == o2.to_bits()
            }
            (Reference { path }, Reference { path: p2 }) => path == p2,
            (Binary { base64 }, Binary { base64: b2 }) => base64 == b2,
            (Array(a), Array(b)) => a == b,
            (Map(a), Map(b)) => a == b,
            _ => false,
        }
    }
}

/// Convert a domain value into its portable form. Never fails.
pub fn serialize(value: &FieldValue) -> SerializedValue {
    match value {
        FieldValue::Null => SerializedValue::Null,
        FieldValue::Boolean(b) => SerializedValue::Bool(*b),
        FieldValue::Integer(i) => SerializedValue::Number(Number::Integer(*i)),
        FieldValue::Double(d) => SerializedValue::Number(Number::Double(*d)),
        FieldValue::Timestamp(ts) => SerializedValue::Timestamp {
            seconds: ts.seconds,
            nanos: ts.nanos,
        },
        FieldValue::String(s) => SerializedValue::String(s.clone()),
        FieldValue::Bytes(b) => SerializedValue::Binary {
            base64: BASE64.encode(b),
        },
        FieldValue::Reference(path) => SerializedValue::Reference { path: path.clone() },
        FieldValue::GeoPoint {
            latitude,
            longitude,
        } => SerializedValue::GeoPoint {
            lat: *latitude,
            lon: *longitude,
        },
        FieldValue::Array(items) => SerializedValue::Array(items.iter().map(serialize).collect()),
        FieldValue::Map(fields) => SerializedValue::Map(
            fields
                .iter()
                .map(|(k, v)| (k.clone(), serialize(v)))
                .collect(),
        ),
    }
}

/// Exact inverse of [`serialize`].
///
/// Fails only on input [`serialize`] cannot produce: malformed base64 or a
/// nanosecond component of one second or more.
pub fn deserialize(value: &SerializedValue) -> Result<FieldValue, SerializationError> {
    deserialize_at("", value)
}

fn deserialize_at(path: &str, value: &SerializedValue) -> Result<FieldValue, SerializationError> {
    Ok(match value {
        SerializedValue::Null => FieldValue::Null,
        SerializedValue::Bool(b) => FieldValue::Boolean(*b),
        SerializedValue::Number(Number::Integer(i)) => FieldValue::Integer(*i),
        SerializedValue::Number(Number::Double(d)) => FieldValue::Double(*d),
        SerializedValue::String(s) => FieldValue::String(s.clone()),
        SerializedValue::Timestamp { seconds, nanos } => {
            let ts = Timestamp::new(*seconds, *nanos);
            ts.validate(path)?;
            FieldValue::Timestamp(ts)
        }
        SerializedValue::GeoPoint { lat, lon } => FieldValue::GeoPoint {
            latitude: *lat,
            longitude: *lon,
        },
        SerializedValue::Reference { path: p } => FieldValue::Reference(p.clone()),
        SerializedValue::Binary { base64 } => FieldValue::Bytes(
            BASE64
                .decode(base64)
                .map_err(|e| SerializationError::new(path, format!("invalid base64: {}", e)))?,
        ),
        SerializedValue::Array(items) => FieldValue::Array(
            items
                .iter()
                .enumerate()
                .map(|(i, v)| deserialize_at(&index_path(path, i), v))
                .collect::<Result<_, _>>()?,
        ),
        SerializedValue::Map(fields) => FieldValue::Map(
            fields
                .iter()
                .map(|(k, v)| Ok((k.clone(), deserialize_at(&field_path(path, k), v)?)))
                .collect::<Result<_, SerializationError>>()?,
        ),
    })
}

/// `parent.key`, or just `key` at the root.
pub(crate) fn field_path(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", parent, key)
    }
}

pub(crate) fn index_path(parent: &str, index: usize) -> String {
    format!("{}[{}]", parent, index)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_nanos_preserved() {
        let ts = FieldValue::Timestamp(Timestamp::new(1_700_000_000, 500));
        let back = deserialize(&serialize(&ts)).unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn test_timestamp_rfc3339() {
        let ts = Timestamp::new(1_700_000_000, 500);
        let s = ts.to_rfc3339().unwrap();
        assert_eq!(s, "2023-11-14T22:13:20.000000500Z");
        assert_eq!(Timestamp::parse_rfc3339(&s), Some(ts));
    }

    #[test]
    fn test_doubles_compare_bitwise() {
        assert_eq!(FieldValue::Double(f64::NAN), FieldValue::Double(f64::NAN));
        assert_ne!(FieldValue::Double(0.0), FieldValue::Double(-0.0));
        let neg_zero = FieldValue::Double(-0.0);
        assert_eq!(deserialize(&serialize(&neg_zero)).unwrap(), neg_zero);
    }

    #[test]
    fn test_integer_and_double_stay_distinct() {
        assert_ne!(
            serialize(&FieldValue::Integer(1)),
            serialize(&FieldValue::Double(1.0))
        );
    }

    #[test]
    fn test_invalid_base64_reports_path() {
        let mut fields = BTreeMap::new();
        fields.insert(
            "avatar".to_string(),
            SerializedValue::Array(vec![SerializedValue::Binary {
                base64: "not base64!".to_string(),
            }]),
        );
        let err = deserialize(&SerializedValue::Map(fields)).unwrap_err();
        assert_eq!(err.path, "avatar[0]");
        assert!(err.reason.contains("base64"));
    }

    #[test]
    fn test_out_of_range_nanos_rejected() {
        let err = deserialize(&SerializedValue::Timestamp {
            seconds: 0,
            nanos: NANOS_PER_SECOND,
        })
        .unwrap_err();
        assert!(err.reason.contains("nanos"));
    }

    #[test]
    fn test_nested_structure_round_trip() {
        let mut inner = BTreeMap::new();
        inner.insert("ref".to_string(), FieldValue::Reference("users/alice".into()));
        inner.insert(
            "where".to_string(),
            FieldValue::GeoPoint {
                latitude: 59.91,
                longitude: 10.75,
            },
        );
        inner.insert("blob".to_string(), FieldValue::Bytes(vec![0, 159, 255]));
        let value = FieldValue::Array(vec![FieldValue::Map(inner), FieldValue::Null]);

        assert_eq!(deserialize(&serialize(&value)).unwrap(), value);
    }
}
