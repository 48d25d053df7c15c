//! JSON encoding helpers.
//!
//! Message types derive `serde` directly; this module holds the field-level
//! adapters for the parts of the JSON form that differ from serde defaults:
//! 64-bit integers travel as strings, blobs as base64, and batch step maps
//! as arrays indexed by step with `null` holes.

use std::collections::BTreeMap;

use base64::Engine;
use serde::{de::DeserializeOwned, Deserialize, Deserializer, Serialize, Serializer};

use crate::{HranaError, Result, Value};

/// Serializes a message to JSON text.
pub fn encode<T: Serialize>(msg: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(msg)
        .map_err(|err| HranaError::Internal(format!("could not serialize JSON message: {err}")))
}

/// Parses a message from JSON text.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
    serde_json::from_slice(data)
        .map_err(|err| HranaError::proto(format!("invalid JSON message: {err}")))
}

/// Tagged JSON shape of [`Value`].
#[derive(Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueRepr {
    Null,
    Integer {
        #[serde(with = "i64_string")]
        value: i64,
    },
    Float {
        value: f64,
    },
    Text {
        value: String,
    },
    Blob {
        #[serde(with = "base64_bytes")]
        base64: Vec<u8>,
    },
}

impl From<ValueRepr> for Value {
    fn from(repr: ValueRepr) -> Self {
        match repr {
            ValueRepr::Null => Value::Null,
            ValueRepr::Integer { value } => Value::Integer(value),
            ValueRepr::Float { value } => Value::Float(value),
            ValueRepr::Text { value } => Value::Text(value),
            ValueRepr::Blob { base64 } => Value::Blob(base64),
        }
    }
}

impl From<Value> for ValueRepr {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => ValueRepr::Null,
            Value::Integer(value) => ValueRepr::Integer { value },
            Value::Float(value) => ValueRepr::Float { value },
            Value::Text(value) => ValueRepr::Text { value },
            Value::Blob(base64) => ValueRepr::Blob { base64 },
        }
    }
}

/// `i64` carried as a decimal string. Plain numbers are accepted on read.
pub mod i64_string {
    use super::*;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Str(String),
        Num(i64),
    }

    pub fn serialize<S: Serializer>(value: &i64, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Str(text) => text
                .parse::<i64>()
                .map_err(|err| serde::de::Error::custom(format!("invalid integer '{text}': {err}"))),
            Repr::Num(value) => Ok(value),
        }
    }
}

/// `Option<i64>` carried as a decimal string or `null`.
pub mod opt_i64_string {
    use super::*;

    pub fn serialize<S: Serializer>(
        value: &Option<i64>,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.collect_str(value),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Option<i64>, D::Error> {
        #[derive(Deserialize)]
        struct Wrapper(#[serde(with = "i64_string")] i64);

        Ok(Option::<Wrapper>::deserialize(deserializer)?.map(|Wrapper(value)| value))
    }
}

/// Byte string carried as standard base64, padding optional on read.
pub mod base64_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(value: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        let trimmed = text.trim_end_matches('=');
        base64::engine::general_purpose::STANDARD_NO_PAD
            .decode(trimmed)
            .map_err(|err| serde::de::Error::custom(format!("invalid base64 blob: {err}")))
    }
}

/// Step-indexed map carried as an array with `null` for absent steps.
pub mod step_map {
    use super::*;

    pub fn serialize<S, T>(map: &BTreeMap<u32, T>, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        let len = map.keys().next_back().map_or(0, |last| *last as usize + 1);
        let mut items: Vec<Option<&T>> = vec![None; len];
        for (step, value) in map {
            items[*step as usize] = Some(value);
        }
        items.serialize(serializer)
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> std::result::Result<BTreeMap<u32, T>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        let items = Vec::<Option<T>>::deserialize(deserializer)?;
        Ok(items
            .into_iter()
            .enumerate()
            .filter_map(|(step, item)| item.map(|item| (step as u32, item)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::Value;

    #[test]
    fn value_json_shapes() {
        assert_eq!(serde_json::to_value(Value::Null).unwrap(), json!({"type": "null"}));
        assert_eq!(
            serde_json::to_value(Value::Integer(-9_007_199_254_740_993)).unwrap(),
            json!({"type": "integer", "value": "-9007199254740993"})
        );
        assert_eq!(
            serde_json::to_value(Value::Float(0.5)).unwrap(),
            json!({"type": "float", "value": 0.5})
        );
        assert_eq!(
            serde_json::to_value(Value::blob(vec![1u8, 2, 3])).unwrap(),
            json!({"type": "blob", "base64": "AQID"})
        );
    }

    #[test]
    fn blob_accepts_unpadded_base64() {
        let value: Value = serde_json::from_value(json!({"type": "blob", "base64": "aGk"})).unwrap();
        assert_eq!(value, Value::blob(b"hi".to_vec()));
    }

    #[test]
    fn integer_rejects_garbage() {
        let err = serde_json::from_value::<Value>(json!({"type": "integer", "value": "nope"}));
        assert!(err.is_err());
    }

    #[test]
    fn integer_accepts_plain_number() {
        let value: Value = serde_json::from_value(json!({"type": "integer", "value": 5})).unwrap();
        assert_eq!(value, Value::Integer(5));
    }
}
