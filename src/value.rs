use serde::{Deserialize, Serialize};

use crate::{HranaError, Result};

/// SQL value as carried by the protocol.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(from = "crate::encoding::json::ValueRepr", into = "crate::encoding::json::ValueRepr")]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

/// How integers are rendered when values are converted to JSON for callers.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum IntMode {
    /// Plain JSON numbers; integers outside the 53-bit safe range are rejected.
    #[default]
    Number,
    /// Full 64-bit JSON numbers.
    BigInt,
    /// Decimal strings.
    String,
}

/// Largest integer that survives a round trip through an IEEE double.
const MAX_SAFE_INTEGER: i64 = (1 << 53) - 1;

impl Value {
    pub fn null() -> Self {
        Self::Null
    }

    pub fn integer(value: i64) -> Self {
        Self::Integer(value)
    }

    pub fn float(value: f64) -> Self {
        Self::Float(value)
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::Text(value.into())
    }

    pub fn blob(value: impl Into<Vec<u8>>) -> Self {
        Self::Blob(value.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(value) => Some(*value),
            Self::Integer(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Self::Blob(value) => Some(value.as_slice()),
            _ => None,
        }
    }

    /// Renders the value as JSON, representing integers per `mode`.
    ///
    /// Blobs become base64 strings and non-finite floats become `null`.
    pub fn to_json(&self, mode: IntMode) -> Result<serde_json::Value> {
        use base64::Engine;

        Ok(match self {
            Self::Null => serde_json::Value::Null,
            Self::Integer(value) => match mode {
                IntMode::Number => {
                    if value.unsigned_abs() > MAX_SAFE_INTEGER as u64 {
                        return Err(HranaError::Misuse(format!(
                            "integer {value} cannot be represented as a number without loss; \
                             use IntMode::BigInt or IntMode::String"
                        )));
                    }
                    serde_json::Value::from(*value)
                }
                IntMode::BigInt => serde_json::Value::from(*value),
                IntMode::String => serde_json::Value::String(value.to_string()),
            },
            Self::Float(value) => serde_json::Number::from_f64(*value)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Text(value) => serde_json::Value::String(value.clone()),
            Self::Blob(value) => serde_json::Value::String(
                base64::engine::general_purpose::STANDARD.encode(value),
            ),
        })
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_owned())
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Self::Integer(value.into())
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Integer(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<Vec<u8>> for Value {
    fn from(value: Vec<u8>) -> Self {
        Self::Blob(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use crate::{IntMode, Value};

    #[test]
    fn helper_constructors() {
        assert_eq!(Value::null(), Value::Null);
        assert_eq!(Value::integer(7), Value::Integer(7));
        assert_eq!(Value::float(1.25), Value::Float(1.25));
        assert_eq!(Value::text("abc"), Value::Text("abc".to_owned()));
        assert_eq!(Value::blob([1u8, 2, 3]), Value::Blob(vec![1, 2, 3]));
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(true), Value::Integer(1));
    }

    #[test]
    fn int_mode_number_rejects_unsafe_integers() {
        let big = Value::Integer(1 << 60);
        assert!(big.to_json(IntMode::Number).is_err());
        assert_eq!(
            big.to_json(IntMode::BigInt).unwrap(),
            serde_json::json!(1i64 << 60)
        );
        assert_eq!(
            big.to_json(IntMode::String).unwrap(),
            serde_json::json!("1152921504606846976")
        );
        assert_eq!(
            Value::Integer(42).to_json(IntMode::Number).unwrap(),
            serde_json::json!(42)
        );
    }

    #[test]
    fn blob_renders_as_base64() {
        let json = Value::blob(b"hi".to_vec()).to_json(IntMode::Number).unwrap();
        assert_eq!(json, serde_json::json!("aGk="));
    }
}
