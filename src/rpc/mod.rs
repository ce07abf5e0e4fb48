//! Multiplexed RPC on top of [`Transport`](crate::Transport): method
//! dispatch, correlated proxy calls, and two wire protocols — streaming
//! MessagePack-RPC and length-prefixed JSON.

mod dispatch;
pub mod json;
pub mod msgpack;
mod proxy;

pub use dispatch::{arg, object_dispatch, Dispatch, RemoteInterface, RemoteMethod, Reply};
pub use proxy::Proxy;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::Error;

/// The value model an RPC protocol carries on the wire.
///
/// Serialization itself is a black box behind serde; the RPC layer only
/// needs nil and typed conversion at the edges.
pub trait WireValue: Clone + Send + Sync + std::fmt::Debug + 'static {
    fn nil() -> Self;
    fn is_nil(&self) -> bool;
    fn encode<T: Serialize>(value: &T) -> Result<Self, Error>;
    fn decode<T: DeserializeOwned>(self) -> Result<T, Error>;
}

impl WireValue for rmpv::Value {
    fn nil() -> Self {
        rmpv::Value::Nil
    }

    fn is_nil(&self) -> bool {
        matches!(self, rmpv::Value::Nil)
    }

    fn encode<T: Serialize>(value: &T) -> Result<Self, Error> {
        rmpv::ext::to_value(value).map_err(|e| Error::Decode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(self) -> Result<T, Error> {
        rmpv::ext::from_value(self).map_err(|e| Error::Decode(e.to_string()))
    }
}

impl WireValue for serde_json::Value {
    fn nil() -> Self {
        serde_json::Value::Null
    }

    fn is_nil(&self) -> bool {
        self.is_null()
    }

    fn encode<T: Serialize>(value: &T) -> Result<Self, Error> {
        serde_json::to_value(value).map_err(|e| Error::Decode(e.to_string()))
    }

    fn decode<T: DeserializeOwned>(self) -> Result<T, Error> {
        serde_json::from_value(self).map_err(|e| Error::Decode(e.to_string()))
    }
}
