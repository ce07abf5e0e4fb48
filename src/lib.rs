// Event-driven socket transports, deferred results, and multiplexed RPC
// on top of the tokio runtime.

mod async_result;
mod client;
mod connection;
mod connector;
mod error;
mod framing;
pub mod rpc;
mod server;
mod transport;

pub use crate::async_result::AsyncResult;
pub use crate::client::Client;
pub use crate::connection::{Connection, ConnectionOwner, Protocol, ProtocolFactory};
pub use crate::connector::{Connector, ConnectorState};
pub use crate::error::Error;
pub use crate::framing::{frame, FrameDecoder};
pub use crate::server::{Server, ServerPhase};
pub use crate::transport::{BoxStream, Stream, Transport, TransportHandle, DEFAULT_MAX_BUFFER};
