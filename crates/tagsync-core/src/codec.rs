//! # Value Codec
//!
//! Converts [`Value`]s to and from the store's wire representation, which is
//! JSON text.
//!
//! ## Mapping
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                       Value  ◄──►  JSON text                            │
//! │                                                                         │
//! │  Absent            ◄──►  null                                          │
//! │  Bool(true)        ◄──►  true                                          │
//! │  Integer(10)       ◄──►  10                                            │
//! │  Float(1.5)        ◄──►  1.5     (NaN / ±inf → Encoding error)         │
//! │  Text("a")         ◄──►  "a"                                           │
//! │  List([..])        ◄──►  [..]                                          │
//! │  Structure({..})   ◄──►  {..}                                          │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! `decode(encode(v)) == v` for every value that encodes successfully.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Number};

use crate::error::{CodecError, CodecResult};
use crate::value::Value;

/// Stateless encoder/decoder between [`Value`] and wire text.
pub struct ValueCodec;

impl ValueCodec {
    /// Encodes a value to wire text.
    pub fn encode(value: &Value) -> CodecResult<String> {
        let json = to_json(value)?;
        serde_json::to_string(&json).map_err(|e| CodecError::Encoding(e.to_string()))
    }

    /// Decodes wire text to a value.
    pub fn decode(text: &str) -> CodecResult<Value> {
        let json: serde_json::Value =
            serde_json::from_str(text).map_err(|e| CodecError::Decoding(e.to_string()))?;
        Ok(from_json(json))
    }

    /// Decodes an optional wire text, mapping a missing value to [`Value::Absent`].
    pub fn decode_optional(text: Option<&str>) -> CodecResult<Value> {
        match text {
            Some(text) => Self::decode(text),
            None => Ok(Value::Absent),
        }
    }

    /// Converts any serializable type into a [`Value`].
    ///
    /// Fails with `Encoding` for shapes JSON cannot express, such as maps
    /// keyed by non-strings.
    pub fn to_value<T: Serialize>(item: &T) -> CodecResult<Value> {
        let json = serde_json::to_value(item).map_err(|e| CodecError::Encoding(e.to_string()))?;
        Ok(from_json(json))
    }

    /// Converts a [`Value`] into any deserializable type.
    pub fn from_value<T: DeserializeOwned>(value: &Value) -> CodecResult<T> {
        let json = to_json(value).map_err(|e| CodecError::Decoding(e.to_string()))?;
        serde_json::from_value(json).map_err(|e| CodecError::Decoding(e.to_string()))
    }
}

fn to_json(value: &Value) -> CodecResult<serde_json::Value> {
    Ok(match value {
        Value::Absent => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Integer(n) => serde_json::Value::Number(Number::from(*n)),
        Value::Float(f) => serde_json::Value::Number(
            Number::from_f64(*f)
                .ok_or_else(|| CodecError::Encoding(format!("non-finite number {}", f)))?,
        ),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::List(items) => serde_json::Value::Array(
            items.iter().map(to_json).collect::<CodecResult<Vec<_>>>()?,
        ),
        Value::Structure(fields) => {
            let mut map = Map::with_capacity(fields.len());
            for (key, field) in fields {
                map.insert(key.clone(), to_json(field)?);
            }
            serde_json::Value::Object(map)
        }
    })
}

fn from_json(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Absent,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            // u64 beyond i64::MAX, or a real float
            None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
        },
        serde_json::Value::String(s) => Value::Text(s),
        serde_json::Value::Array(items) => Value::List(items.into_iter().map(from_json).collect()),
        serde_json::Value::Object(map) => {
            Value::Structure(map.into_iter().map(|(k, v)| (k, from_json(v))).collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::{BTreeMap, HashMap};

    #[test]
    fn test_encode_scalars() {
        assert_eq!(ValueCodec::encode(&Value::Integer(10)).unwrap(), "10");
        assert_eq!(ValueCodec::encode(&Value::from("score")).unwrap(), "\"score\"");
        assert_eq!(ValueCodec::encode(&Value::Absent).unwrap(), "null");
        assert_eq!(ValueCodec::encode(&Value::Bool(false)).unwrap(), "false");
    }

    #[test]
    fn test_non_finite_float_rejected() {
        let err = ValueCodec::encode(&Value::Float(f64::NAN)).unwrap_err();
        assert!(err.is_encoding());

        let nested = Value::List(vec![Value::Integer(1), Value::Float(f64::INFINITY)]);
        assert!(ValueCodec::encode(&nested).is_err());
    }

    #[test]
    fn test_float_keeps_every_digit() {
        let value = Value::Float(-125147483199.44261);
        let wire = ValueCodec::encode(&value).unwrap();
        assert_eq!(ValueCodec::decode(&wire).unwrap(), value);
    }

    #[test]
    fn test_malformed_text_rejected() {
        let err = ValueCodec::decode("{not json").unwrap_err();
        assert!(matches!(err, CodecError::Decoding(_)));
    }

    #[test]
    fn test_absence_not_conflated() {
        assert_eq!(ValueCodec::decode_optional(None).unwrap(), Value::Absent);
        assert_eq!(ValueCodec::decode("\"\"").unwrap(), Value::Text(String::new()));
        assert_eq!(ValueCodec::decode("0").unwrap(), Value::Integer(0));
    }

    #[test]
    fn test_float_stays_float() {
        let v = ValueCodec::decode(&ValueCodec::encode(&Value::Float(3.0)).unwrap()).unwrap();
        assert_eq!(v, Value::Float(3.0));
    }

    #[test]
    fn test_serializable_round_trip() {
        #[derive(Serialize, serde::Deserialize, Debug, PartialEq)]
        struct Score {
            player: String,
            points: i64,
        }

        let score = Score { player: "alice".into(), points: 7 };
        let value = ValueCodec::to_value(&score).unwrap();
        assert!(matches!(value, Value::Structure(_)));
        let back: Score = ValueCodec::from_value(&value).unwrap();
        assert_eq!(back, score);
    }

    #[test]
    fn test_non_string_keys_rejected() {
        let mut map = HashMap::new();
        map.insert(vec![1u8], 1);
        assert!(ValueCodec::to_value(&map).unwrap_err().is_encoding());
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Absent),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Integer),
            (-1.0e12f64..1.0e12).prop_map(Value::Float),
            ".{0,12}".prop_map(Value::Text),
        ];
        leaf.prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::List),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m: BTreeMap<String, Value>| Value::Structure(m)),
            ]
        })
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(value in arb_value()) {
            let wire = ValueCodec::encode(&value).unwrap();
            prop_assert_eq!(ValueCodec::decode(&wire).unwrap(), value);
        }
    }
}
