//! The NT4 type-info table: (numeric type code, wire type name) pairs.
//!
//! Several wire type names share a numeric code (`"string"`/`"json"` both
//! carry 4; `"raw"`/`"rpc"`/`"msgpack"`/`"protobuf"` all carry 5) — the name
//! is what a subscriber or the protobuf layer uses to pick how to interpret
//! the bytes, the number is what the msgpack value frames carry on the wire.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A topic's type, as the pair the protocol carries it in.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeInfo {
    pub number: u8,
    pub name: String,
}

impl TypeInfo {
    fn new(number: u8, name: &str) -> Self {
        TypeInfo {
            number,
            name: name.to_owned(),
        }
    }

    pub fn boolean() -> Self {
        Self::new(0, "boolean")
    }
    pub fn double() -> Self {
        Self::new(1, "double")
    }
    pub fn int() -> Self {
        Self::new(2, "int")
    }
    pub fn float() -> Self {
        Self::new(3, "float")
    }
    pub fn string() -> Self {
        Self::new(4, "string")
    }
    pub fn json() -> Self {
        Self::new(4, "json")
    }
    pub fn raw() -> Self {
        Self::new(5, "raw")
    }
    pub fn rpc() -> Self {
        Self::new(5, "rpc")
    }
    pub fn msgpack() -> Self {
        Self::new(5, "msgpack")
    }
    pub fn protobuf() -> Self {
        Self::new(5, "protobuf")
    }
    pub fn boolean_array() -> Self {
        Self::new(16, "boolean[]")
    }
    pub fn double_array() -> Self {
        Self::new(17, "double[]")
    }
    pub fn int_array() -> Self {
        Self::new(18, "int[]")
    }
    pub fn float_array() -> Self {
        Self::new(19, "float[]")
    }
    pub fn string_array() -> Self {
        Self::new(20, "string[]")
    }

    /// All recognized (number, name) pairs, in the order §3 enumerates them.
    pub fn all() -> &'static [fn() -> TypeInfo] {
        &[
            Self::boolean,
            Self::double,
            Self::int,
            Self::float,
            Self::string,
            Self::json,
            Self::raw,
            Self::rpc,
            Self::msgpack,
            Self::protobuf,
            Self::boolean_array,
            Self::double_array,
            Self::int_array,
            Self::float_array,
            Self::string_array,
        ]
    }

    /// Look up the canonical pair for a wire type name. `None` for anything
    /// not in the §3 table (e.g. a custom protobuf message-type string,
    /// which callers should map to [`TypeInfo::protobuf`] themselves).
    pub fn by_name(name: &str) -> Option<TypeInfo> {
        Self::all().iter().map(|f| f()).find(|t| t.name == name)
    }

    /// Whether `number` is a recognized numeric code at all (used to reject
    /// msgpack value frames carrying a code outside 0-5, 16-20).
    pub fn number_recognized(number: u8) -> bool {
        Self::all().iter().any(|f| f().number == number)
    }
}

impl fmt::Display for TypeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_and_json_share_number_four() {
        assert_eq!(TypeInfo::string().number, 4);
        assert_eq!(TypeInfo::json().number, 4);
        assert_ne!(TypeInfo::string().name, TypeInfo::json().name);
    }

    #[test]
    fn raw_rpc_msgpack_protobuf_share_number_five() {
        for ctor in [
            TypeInfo::raw,
            TypeInfo::rpc,
            TypeInfo::msgpack,
            TypeInfo::protobuf,
        ] {
            assert_eq!(ctor().number, 5);
        }
    }

    #[test]
    fn by_name_resolves_every_canonical_pair() {
        for ctor in TypeInfo::all() {
            let t = ctor();
            assert_eq!(TypeInfo::by_name(&t.name), Some(t));
        }
    }

    #[test]
    fn by_name_rejects_unknown_names() {
        assert_eq!(TypeInfo::by_name("proto:Foo.Bar"), None);
    }
}
