// Runtime values and primary keys - the units that records are made of.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// A runtime value held by a record field.
///
/// Records are flat objects of these; the storage engines persist them as
/// JSON with tagged wrappers for the kinds plain JSON cannot carry
/// (dates, bigints, byte strings).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    BigInt(i128),
    String(String),
    Date(DateTime<Utc>),
    Bytes(Vec<u8>),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
}

/// A persisted record: the primary key field, plain field values, and
/// denormalized relation keys, all in one flat map.
pub type Record = BTreeMap<String, Value>;

impl Value {
    /// Runtime kind name, used in validation diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::BigInt(_) => "bigint",
            Value::String(_) => "string",
            Value::Date(_) => "date",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Build an object value from key/value pairs.
    pub fn object<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Value {
        Value::Object(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Encode to the persisted JSON form. Dates, bigints, and byte strings
    /// become single-key tagged objects so decoding is unambiguous.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(n) => serde_json::Value::Number((*n).into()),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::BigInt(n) => serde_json::json!({ "$bigint": n.to_string() }),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Date(d) => serde_json::json!({ "$date": d.to_rfc3339() }),
            Value::Bytes(b) => serde_json::json!({ "$bytes": b }),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(fields) => serde_json::Value::Object(
                fields.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }

    /// Decode from the persisted JSON form.
    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => {
                Value::Array(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(map) => {
                if map.len() == 1 {
                    if let Some(tagged) = decode_tagged(map) {
                        return tagged;
                    }
                }
                Value::Object(
                    map.iter()
                        .map(|(k, v)| (k.clone(), Value::from_json(v)))
                        .collect(),
                )
            }
        }
    }
}

fn decode_tagged(map: &serde_json::Map<String, serde_json::Value>) -> Option<Value> {
    if let Some(s) = map.get("$date").and_then(|v| v.as_str()) {
        let parsed = DateTime::parse_from_rfc3339(s).ok()?;
        return Some(Value::Date(parsed.with_timezone(&Utc)));
    }
    if let Some(s) = map.get("$bigint").and_then(|v| v.as_str()) {
        return Some(Value::BigInt(s.parse().ok()?));
    }
    if let Some(items) = map.get("$bytes").and_then(|v| v.as_array()) {
        let bytes: Option<Vec<u8>> = items
            .iter()
            .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
            .collect();
        return Some(Value::Bytes(bytes?));
    }
    None
}

// Serde carries the persisted JSON form, tagged wrappers included.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Value, D::Error> {
        let json = serde_json::Value::deserialize(deserializer)?;
        Ok(Value::from_json(&json))
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            // Debug form keeps "2.0" distinct from the int "2".
            Value::Float(x) => write!(f, "{x:?}"),
            Value::BigInt(n) => write!(f, "{n}n"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::Date(d) => write!(f, "{}", d.to_rfc3339()),
            Value::Bytes(b) => write!(f, "bytes({})", b.len()),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Object(fields) => {
                write!(f, "{{")?;
                for (i, (k, v)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Value {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Value {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Value {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Value {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Value {
        Value::String(s)
    }
}

impl From<Key> for Value {
    fn from(key: Key) -> Value {
        match key {
            Key::Int(n) => Value::Int(n),
            Key::Date(d) => Value::Date(d),
            Key::String(s) => Value::String(s),
        }
    }
}

/// A primary key: integer, date, or string.
///
/// Variant order gives the total key order int < date < string, so derived
/// `Ord` matches the scan order the engines promise.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Key {
    Int(i64),
    Date(DateTime<Utc>),
    String(String),
}

impl Key {
    /// Kind name, used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Key::Int(_) => "int",
            Key::Date(_) => "date",
            Key::String(_) => "string",
        }
    }

    /// Interpret a field value as a key, if it has a keyable kind.
    pub fn from_value(value: &Value) -> Option<Key> {
        match value {
            Value::Int(n) => Some(Key::Int(*n)),
            Value::Date(d) => Some(Key::Date(*d)),
            Value::String(s) => Some(Key::String(s.clone())),
            _ => None,
        }
    }

    /// Stable single-string encoding, used as the key column by the SQLite
    /// engine. Not order-preserving; scans re-sort after decoding.
    pub fn encode(&self) -> String {
        match self {
            Key::Int(n) => format!("i:{n}"),
            Key::Date(d) => format!("d:{}", d.to_rfc3339()),
            Key::String(s) => format!("s:{s}"),
        }
    }

    /// Decode the `encode` form.
    pub fn decode(raw: &str) -> Option<Key> {
        let (tag, rest) = raw.split_once(':')?;
        match tag {
            "i" => rest.parse().ok().map(Key::Int),
            "d" => DateTime::parse_from_rfc3339(rest)
                .ok()
                .map(|d| Key::Date(d.with_timezone(&Utc))),
            "s" => Some(Key::String(rest.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Int(n) => write!(f, "{n}"),
            Key::Date(d) => write!(f, "{}", d.to_rfc3339()),
            Key::String(s) => write!(f, "{s}"),
        }
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Key {
        Key::String(s.to_string())
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Key {
        Key::Int(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_key_order() {
        let mut keys = vec![
            Key::String("a".into()),
            Key::Int(10),
            Key::Date(Utc::now()),
            Key::Int(2),
        ];
        keys.sort();
        assert!(matches!(keys[0], Key::Int(2)));
        assert!(matches!(keys[1], Key::Int(10)));
        assert!(matches!(keys[2], Key::Date(_)));
        assert!(matches!(keys[3], Key::String(_)));
    }

    #[test]
    fn test_key_encode_roundtrip() {
        for key in [
            Key::Int(-7),
            Key::String("alice".into()),
            Key::Date(Utc::now()),
        ] {
            assert_eq!(Key::decode(&key.encode()), Some(key));
        }
    }

    #[test]
    fn test_json_roundtrip_tagged_kinds() {
        let value = Value::object([
            ("when", Value::Date(Utc::now())),
            ("big", Value::BigInt(170141183460469231731687303715884105727)),
            ("blob", Value::Bytes(vec![0, 127, 255])),
            ("plain", Value::Int(3)),
        ]);
        let json = value.to_json();
        assert_eq!(Value::from_json(&json), value);
    }

    #[test]
    fn test_serde_roundtrip() {
        let value = Value::object([
            ("when", Value::Date(Utc::now())),
            ("tags", Value::Array(vec![Value::from("a"), Value::from("b")])),
        ]);
        let encoded = serde_json::to_string(&value).unwrap();
        let decoded: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, value);
    }

    #[test]
    fn test_json_keeps_int_float_apart() {
        let json = Value::Array(vec![Value::Int(2), Value::Float(2.5)]).to_json();
        let back = Value::from_json(&json);
        assert_eq!(back, Value::Array(vec![Value::Int(2), Value::Float(2.5)]));
    }

    #[test]
    fn test_from_value_rejects_unkeyable() {
        assert_eq!(Key::from_value(&Value::Bool(true)), None);
        assert_eq!(
            Key::from_value(&Value::String("x".into())),
            Some(Key::String("x".into()))
        );
    }
}
