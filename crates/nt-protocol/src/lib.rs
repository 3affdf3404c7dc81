//! nt-protocol: wire types for the NetworkTables 4.0 pub/sub protocol.
//!
//! Covers the JSON control-message schema and the msgpack binary value
//! frame format from the NT4 spec, plus the type-info table and value model
//! shared by every layer above the wire.

pub mod control;
pub mod frame;
pub mod types;
pub mod value;

pub use control::*;
pub use frame::{BinaryFrame, FrameError};
pub use types::TypeInfo;
pub use value::{Value, ValueError};

pub use rmpv;
