//! Application values as the client stores them
//!
//! Payload kind is chosen by variant:
//! - `Int` is written as decimal text with the NUMERIC flag
//! - `Str` and `Bytes` are written raw
//! - `Structured` is written as JSON with the SERIALIZED flag

use serde::Serialize;
use serde::de::DeserializeOwned;

/// A cached value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    Structured(serde_json::Value),
}

impl Value {
    /// Wrap any serializable type as a structured value
    pub fn serialize<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Value::Structured)
    }

    /// Convert back into a concrete type. Scalars are offered to the
    /// deserializer as the matching JSON scalar.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Option<T> {
        let json = match self {
            Value::Int(n) => serde_json::Value::from(*n),
            Value::Str(s) => serde_json::Value::from(s.as_str()),
            Value::Bytes(_) => return None,
            Value::Structured(v) => v.clone(),
        };
        serde_json::from_value(json).ok()
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Raw bytes of a string-like value
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Str(s) => Some(s.as_bytes()),
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Value::Structured(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int(i64::from(n))
    }
}

impl From<u32> for Value {
    fn from(n: u32) -> Self {
        Value::Int(i64::from(n))
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

impl From<&[u8]> for Value {
    fn from(b: &[u8]) -> Self {
        Value::Bytes(b.to_vec())
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Structured(v)
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{n}"),
            Value::Str(s) => f.write_str(s),
            Value::Bytes(b) => write!(f, "<{} bytes>", b.len()),
            Value::Structured(v) => write!(f, "{v}"),
        }
    }
}

impl PartialEq<str> for Value {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == Some(other)
    }
}

impl PartialEq<&str> for Value {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == Some(*other)
    }
}

impl PartialEq<i64> for Value {
    fn eq(&self, other: &i64) -> bool {
        self.as_int() == Some(*other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        edges: Vec<u32>,
    }

    #[test]
    fn test_serialize_struct() {
        let profile = Profile {
            name: "ged".into(),
            edges: vec![2, 4],
        };
        let value = Value::serialize(&profile).unwrap();
        assert_eq!(value.as_json(), Some(&json!({"name": "ged", "edges": [2, 4]})));
        assert_eq!(value.deserialize::<Profile>(), Some(profile));
    }

    #[test]
    fn test_scalar_deserialize() {
        assert_eq!(Value::Int(7).deserialize::<u16>(), Some(7));
        assert_eq!(Value::from("hi").deserialize::<String>(), Some("hi".into()));
        assert_eq!(Value::Bytes(vec![1]).deserialize::<String>(), None);
    }

    #[test]
    fn test_comparisons() {
        assert_eq!(Value::from("hello"), "hello");
        assert_eq!(Value::from(12), 12);
        assert_ne!(Value::from("12"), 12);
        assert_eq!(Value::from(b"raw".as_slice()).as_bytes(), Some(b"raw".as_slice()));
    }
}
