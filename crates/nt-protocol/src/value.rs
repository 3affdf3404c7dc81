//! The NT4 value model: a tagged variant with one arm per recognized type
//! pair, and the validation rules from spec §6 applied at construction time.

use crate::types::TypeInfo;
use rmpv::Value as Wire;

/// A value carried by a topic, already validated against its type.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Double(f64),
    Int(i64),
    Float(f32),
    String(String),
    Json(serde_json::Value),
    Raw(Vec<u8>),
    Rpc(Vec<u8>),
    Msgpack(Vec<u8>),
    Protobuf(Vec<u8>),
    BooleanArray(Vec<bool>),
    DoubleArray(Vec<f64>),
    IntArray(Vec<i64>),
    FloatArray(Vec<f32>),
    StringArray(Vec<String>),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValueError {
    #[error("value for type {0} is not a {1}")]
    WrongShape(TypeInfo, &'static str),
    #[error("double/float value is not finite")]
    NotFinite,
    #[error("int value is not a finite integer")]
    NotInteger,
    #[error("json value did not parse as an object")]
    JsonNotObject,
    #[error("unrecognized type pair {0}")]
    UnrecognizedType(TypeInfo),
}

impl Value {
    /// The type-info pair this value was constructed for.
    pub fn type_info(&self) -> TypeInfo {
        match self {
            Value::Boolean(_) => TypeInfo::boolean(),
            Value::Double(_) => TypeInfo::double(),
            Value::Int(_) => TypeInfo::int(),
            Value::Float(_) => TypeInfo::float(),
            Value::String(_) => TypeInfo::string(),
            Value::Json(_) => TypeInfo::json(),
            Value::Raw(_) => TypeInfo::raw(),
            Value::Rpc(_) => TypeInfo::rpc(),
            Value::Msgpack(_) => TypeInfo::msgpack(),
            Value::Protobuf(_) => TypeInfo::protobuf(),
            Value::BooleanArray(_) => TypeInfo::boolean_array(),
            Value::DoubleArray(_) => TypeInfo::double_array(),
            Value::IntArray(_) => TypeInfo::int_array(),
            Value::FloatArray(_) => TypeInfo::float_array(),
            Value::StringArray(_) => TypeInfo::string_array(),
        }
    }

    /// Decode and validate a wire value against an expected type pair,
    /// applying the §6 ingress rules.
    pub fn decode(type_info: &TypeInfo, wire: &Wire) -> Result<Value, ValueError> {
        match (type_info.number, type_info.name.as_str()) {
            (0, _) => wire
                .as_bool()
                .map(Value::Boolean)
                .ok_or(ValueError::WrongShape(type_info.clone(), "boolean")),
            (1, _) => {
                let n = wire
                    .as_f64()
                    .ok_or_else(|| ValueError::WrongShape(type_info.clone(), "double"))?;
                if !n.is_finite() {
                    return Err(ValueError::NotFinite);
                }
                Ok(Value::Double(n))
            }
            (2, _) => {
                let n = wire
                    .as_i64()
                    .ok_or(ValueError::NotInteger)?;
                Ok(Value::Int(n))
            }
            (3, _) => {
                let n = wire
                    .as_f64()
                    .ok_or_else(|| ValueError::WrongShape(type_info.clone(), "float"))?;
                if !n.is_finite() {
                    return Err(ValueError::NotFinite);
                }
                Ok(Value::Float(n as f32))
            }
            (4, "json") => {
                let s = wire
                    .as_str()
                    .ok_or_else(|| ValueError::WrongShape(type_info.clone(), "string"))?;
                let parsed: serde_json::Value =
                    serde_json::from_str(s).map_err(|_| ValueError::JsonNotObject)?;
                if !parsed.is_object() {
                    return Err(ValueError::JsonNotObject);
                }
                Ok(Value::Json(parsed))
            }
            (4, _) => wire
                .as_str()
                .map(|s| Value::String(s.to_owned()))
                .ok_or_else(|| ValueError::WrongShape(type_info.clone(), "string")),
            (5, "rpc") => bytes_of(wire)
                .map(Value::Rpc)
                .ok_or_else(|| ValueError::WrongShape(type_info.clone(), "raw")),
            (5, "msgpack") => bytes_of(wire)
                .map(Value::Msgpack)
                .ok_or_else(|| ValueError::WrongShape(type_info.clone(), "raw")),
            (5, "protobuf") => bytes_of(wire)
                .map(Value::Protobuf)
                .ok_or_else(|| ValueError::WrongShape(type_info.clone(), "raw")),
            (5, _) => bytes_of(wire)
                .map(Value::Raw)
                .ok_or_else(|| ValueError::WrongShape(type_info.clone(), "raw")),
            (16, _) => decode_array(wire, |e| e.as_bool())
                .map(Value::BooleanArray)
                .ok_or_else(|| ValueError::WrongShape(type_info.clone(), "boolean[]")),
            (17, _) => {
                let items = decode_array(wire, |e| e.as_f64())
                    .ok_or_else(|| ValueError::WrongShape(type_info.clone(), "double[]"))?;
                if items.iter().any(|n| !n.is_finite()) {
                    return Err(ValueError::NotFinite);
                }
                Ok(Value::DoubleArray(items))
            }
            (18, _) => {
                let items = decode_array(wire, |e| e.as_i64())
                    .ok_or(ValueError::NotInteger)?;
                Ok(Value::IntArray(items))
            }
            (19, _) => {
                let items = decode_array(wire, |e| e.as_f64())
                    .ok_or_else(|| ValueError::WrongShape(type_info.clone(), "float[]"))?;
                if items.iter().any(|n| !n.is_finite()) {
                    return Err(ValueError::NotFinite);
                }
                Ok(Value::FloatArray(items.into_iter().map(|n| n as f32).collect()))
            }
            (20, _) => {
                let items = decode_array(wire, |e| e.as_str().map(str::to_owned))
                    .ok_or_else(|| ValueError::WrongShape(type_info.clone(), "string[]"))?;
                Ok(Value::StringArray(items))
            }
            _ => Err(ValueError::UnrecognizedType(type_info.clone())),
        }
    }

    /// Encode back to the wire representation used in binary value frames.
    pub fn encode(&self) -> Wire {
        match self {
            Value::Boolean(b) => Wire::Boolean(*b),
            Value::Double(d) => Wire::F64(*d),
            Value::Int(i) => Wire::Integer((*i).into()),
            Value::Float(f) => Wire::F32(*f),
            Value::String(s) => Wire::String(s.clone().into()),
            Value::Json(v) => Wire::String(v.to_string().into()),
            Value::Raw(b) | Value::Rpc(b) | Value::Msgpack(b) | Value::Protobuf(b) => {
                Wire::Binary(b.clone())
            }
            Value::BooleanArray(items) => {
                Wire::Array(items.iter().map(|b| Wire::Boolean(*b)).collect())
            }
            Value::DoubleArray(items) => {
                Wire::Array(items.iter().map(|d| Wire::F64(*d)).collect())
            }
            Value::IntArray(items) => {
                Wire::Array(items.iter().map(|i| Wire::Integer((*i).into())).collect())
            }
            Value::FloatArray(items) => {
                Wire::Array(items.iter().map(|f| Wire::F32(*f)).collect())
            }
            Value::StringArray(items) => Wire::Array(
                items
                    .iter()
                    .map(|s| Wire::String(s.clone().into()))
                    .collect(),
            ),
        }
    }
}

fn bytes_of(wire: &Wire) -> Option<Vec<u8>> {
    wire.as_slice().map(<[u8]>::to_vec)
}

fn decode_array<T>(wire: &Wire, mut conv: impl FnMut(&Wire) -> Option<T>) -> Option<Vec<T>> {
    wire.as_array()?.iter().map(&mut conv).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_rejects_non_finite_double() {
        let wire = Wire::F64(f64::NAN);
        assert_eq!(
            Value::decode(&TypeInfo::double(), &wire),
            Err(ValueError::NotFinite)
        );
    }

    #[test]
    fn decode_rejects_non_object_json() {
        let wire = Wire::String("[1,2,3]".into());
        assert_eq!(
            Value::decode(&TypeInfo::json(), &wire),
            Err(ValueError::JsonNotObject)
        );
    }

    #[test]
    fn decode_accepts_object_json() {
        let wire = Wire::String(r#"{"a":1}"#.into());
        let v = Value::decode(&TypeInfo::json(), &wire).unwrap();
        assert!(matches!(v, Value::Json(_)));
    }

    #[test]
    fn int_array_round_trips_and_stays_integer() {
        let v = Value::IntArray(vec![1, 2, 3]);
        let wire = v.encode();
        let decoded = Value::decode(&TypeInfo::int_array(), &wire).unwrap();
        assert_eq!(decoded, v);
    }

    #[test]
    fn scalar_round_trip_modulo_numeric_representation() {
        for v in [
            Value::Boolean(true),
            Value::Double(1.5),
            Value::Int(-7),
            Value::Float(2.5),
            Value::String("hi".to_owned()),
            Value::Raw(vec![1, 2, 3]),
        ] {
            let t = v.type_info();
            let decoded = Value::decode(&t, &v.encode()).unwrap();
            assert_eq!(decoded, v);
        }
    }

    #[test]
    fn double_array_preserves_finiteness() {
        let wire = Wire::Array(vec![Wire::F64(1.0), Wire::F64(f64::INFINITY)]);
        assert_eq!(
            Value::decode(&TypeInfo::double_array(), &wire),
            Err(ValueError::NotFinite)
        );
    }
}
