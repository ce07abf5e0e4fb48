use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::connection::{Connection, ConnectionOwner, ProtocolFactory};
use crate::connector::Connector;
use crate::error::Error;

#[derive(Clone)]
enum Target {
    Tcp(String),
    Unix(PathBuf),
}

/// A socket client holding at most one live connection.
///
/// `connect` dials the target, builds a protocol through the factory, and
/// returns the protocol handle once the connection is established.
/// Reconnecting after a loss is the application's business; the client
/// only forgets the dropped connection.
pub struct Client<F: ProtocolFactory> {
    inner: Arc<ClientInner<F>>,
}

impl<F: ProtocolFactory> Clone for Client<F> {
    fn clone(&self) -> Self {
        Client { inner: self.inner.clone() }
    }
}

struct ClientInner<F> {
    factory: F,
    target: Target,
    connection: Mutex<Option<Connection>>,
    next_id: AtomicU64,
}

impl<F: ProtocolFactory> Client<F> {
    pub fn tcp(factory: F, addr: impl Into<String>) -> Client<F> {
        Self::new(factory, Target::Tcp(addr.into()))
    }

    pub fn unix(factory: F, path: impl Into<PathBuf>) -> Client<F> {
        Self::new(factory, Target::Unix(path.into()))
    }

    fn new(factory: F, target: Target) -> Client<F> {
        Client {
            inner: Arc::new(ClientInner {
                factory,
                target,
                connection: Mutex::new(None),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Connect, replacing any previous connection, and hand back the
    /// protocol built for this one.
    pub async fn connect(&self, timeout: Duration) -> Result<F::Protocol, Error> {
        self.disconnect();
        let mut connector = match &self.inner.target {
            Target::Tcp(addr) => Connector::tcp(addr.clone(), timeout),
            Target::Unix(path) => Connector::unix(path.clone(), timeout),
        };
        let stream = connector.start()?.into_result(None).await?;
        let protocol = self.inner.factory.build();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let owner: Arc<dyn ConnectionOwner> = self.inner.clone();
        let connection = Connection::establish(id, stream, protocol.clone(), owner);
        *self.inner.lock_connection() = Some(connection);
        Ok(protocol)
    }

    /// Close the live connection, if any.
    pub fn disconnect(&self) {
        if let Some(connection) = self.inner.lock_connection().as_ref() {
            connection.close();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock_connection().is_some()
    }
}

impl<F> ClientInner<F> {
    fn lock_connection(&self) -> MutexGuard<'_, Option<Connection>> {
        self.connection.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<F: ProtocolFactory> ConnectionOwner for ClientInner<F> {
    fn remove_connection(&self, id: u64) {
        let mut connection = self.lock_connection();
        if connection.as_ref().map(Connection::id) == Some(id) {
            *connection = None;
        }
    }
}
