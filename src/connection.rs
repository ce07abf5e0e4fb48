use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::error::Error;
use crate::transport::{BoxStream, Transport, TransportHandle};

/// Per-connection behavior driven by a [`Transport`].
///
/// `connection_made` runs once, before any bytes are delivered, and hands
/// over the transport handle the protocol writes through. `data_received`
/// sees every chunk in arrival order. `connection_lost` runs exactly once,
/// with `ConnectionClosed` for a graceful close or the terminal I/O error.
pub trait Protocol: Send + 'static {
    fn connection_made(&mut self, transport: TransportHandle);
    fn data_received(&mut self, data: &[u8]);
    fn connection_lost(&mut self, reason: &Error);
}

/// Builds one protocol instance per established connection.
///
/// Protocol values are cheap handles: the factory hands one clone to the
/// connection driver and returns another to whoever asked for the
/// connection.
pub trait ProtocolFactory: Send + Sync + 'static {
    type Protocol: Protocol + Clone;

    fn build(&self) -> Self::Protocol;
}

/// Whoever tracks live connections: a [`Server`](crate::Server) or a
/// [`Client`](crate::Client). Notified at most once per connection, after
/// the protocol has seen `connection_lost`.
pub trait ConnectionOwner: Send + Sync + 'static {
    fn remove_connection(&self, id: u64);
}

/// One established connection: a transport driver task bound to a protocol
/// instance and an owner.
pub struct Connection {
    id: u64,
    transport: TransportHandle,
    _driver: JoinHandle<()>,
}

impl Connection {
    /// Wire `stream`, `protocol` and `owner` together and start the driver
    /// task. The protocol's `connection_made` has already run by the time
    /// this returns.
    pub fn establish<P: Protocol>(
        id: u64,
        stream: BoxStream,
        mut protocol: P,
        owner: Arc<dyn ConnectionOwner>,
    ) -> Connection {
        let (transport, handle) = Transport::new(stream);
        protocol.connection_made(handle.clone());
        let driver = tokio::spawn(async move {
            let reason = transport.run(&mut protocol).await;
            if reason.is_connection_closed() {
                tracing::debug!(id, "connection closed");
            } else {
                tracing::warn!(id, error = %reason, "connection lost");
            }
            protocol.connection_lost(&reason);
            owner.remove_connection(id);
        });
        Connection { id, transport: handle, _driver: driver }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn transport(&self) -> &TransportHandle {
        &self.transport
    }

    /// Close the underlying transport; the owner is notified through the
    /// usual loss path.
    pub fn close(&self) {
        self.transport.close();
    }
}
