//! Crate-level error aggregation: each component raises its own error enum;
//! this type lets callers at the Client boundary match on one thing.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Socket(#[from] crate::socket::SocketError),
    #[error(transparent)]
    Messenger(#[from] crate::messenger::MessengerError),
    #[error(transparent)]
    Registry(#[from] crate::registry::RegistryError),
    #[error(transparent)]
    Value(#[from] nt_protocol::ValueError),
    #[error(transparent)]
    InFlight(#[from] crate::inflight::InFlightError),
    #[cfg(feature = "protobuf")]
    #[error(transparent)]
    Schema(#[from] crate::protobuf::SchemaError),
}
