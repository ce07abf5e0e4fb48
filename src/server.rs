use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::net::{TcpListener, ToSocketAddrs, UnixListener};
use tokio::task::JoinHandle;

use crate::connection::{Connection, ConnectionOwner, ProtocolFactory};
use crate::error::Error;
use crate::transport::BoxStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerPhase {
    Stopped,
    Listening,
    Shutdown,
}

/// Accept source the server drains: TCP or Unix-domain.
#[async_trait]
trait Listener: Send + 'static {
    async fn accept(&mut self) -> std::io::Result<BoxStream>;
}

struct TcpAcceptor(TcpListener);

#[async_trait]
impl Listener for TcpAcceptor {
    async fn accept(&mut self) -> std::io::Result<BoxStream> {
        let (stream, peer) = self.0.accept().await?;
        tracing::debug!(%peer, "accepted tcp connection");
        Ok(Box::new(stream))
    }
}

struct UnixAcceptor {
    listener: UnixListener,
    path: PathBuf,
}

#[async_trait]
impl Listener for UnixAcceptor {
    async fn accept(&mut self) -> std::io::Result<BoxStream> {
        let (stream, _addr) = self.listener.accept().await?;
        tracing::debug!(path = %self.path.display(), "accepted unix connection");
        Ok(Box::new(stream))
    }
}

impl Drop for UnixAcceptor {
    fn drop(&mut self) {
        // Absent path is fine: shutdown may already have unlinked it.
        let _ = std::fs::remove_file(&self.path);
    }
}

/// A listening socket server.
///
/// `start` arms the accept loop, `stop` disarms it without touching live
/// connections, and `shutdown` is terminal: accepting stops, every tracked
/// connection is closed, and any further `start`/`stop`/`shutdown` fails
/// with `Shutdown`.
pub struct Server<F: ProtocolFactory> {
    inner: Arc<ServerInner<F>>,
}

impl<F: ProtocolFactory> Clone for Server<F> {
    fn clone(&self) -> Self {
        Server { inner: self.inner.clone() }
    }
}

struct ServerInner<F> {
    factory: F,
    listener: tokio::sync::Mutex<Box<dyn Listener>>,
    local_addr: Option<SocketAddr>,
    unix_path: Option<PathBuf>,
    state: Mutex<ServerState>,
}

struct ServerState {
    phase: ServerPhase,
    connections: HashMap<u64, Connection>,
    next_conn_id: u64,
    accept_task: Option<JoinHandle<()>>,
}

impl<F: ProtocolFactory> Server<F> {
    pub async fn bind_tcp<A: ToSocketAddrs>(addr: A, factory: F) -> Result<Server<F>, Error> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::debug!(%local_addr, "listening");
        Ok(Self::from_parts(
            Box::new(TcpAcceptor(listener)),
            Some(local_addr),
            None,
            factory,
        ))
    }

    pub async fn bind_unix(path: impl Into<PathBuf>, factory: F) -> Result<Server<F>, Error> {
        let path = path.into();
        // A socket file left over from an unclean exit would fail the bind.
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(&path)?;
        tracing::debug!(path = %path.display(), "listening");
        Ok(Self::from_parts(
            Box::new(UnixAcceptor { listener, path: path.clone() }),
            None,
            Some(path),
            factory,
        ))
    }

    fn from_parts(
        listener: Box<dyn Listener>,
        local_addr: Option<SocketAddr>,
        unix_path: Option<PathBuf>,
        factory: F,
    ) -> Server<F> {
        Server {
            inner: Arc::new(ServerInner {
                factory,
                listener: tokio::sync::Mutex::new(listener),
                local_addr,
                unix_path,
                state: Mutex::new(ServerState {
                    phase: ServerPhase::Stopped,
                    connections: HashMap::new(),
                    next_conn_id: 0,
                    accept_task: None,
                }),
            }),
        }
    }

    /// Bound address, for TCP servers started on an ephemeral port.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr
    }

    pub fn phase(&self) -> ServerPhase {
        self.inner.lock_state().phase
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock_state().connections.len()
    }

    /// Begin accepting connections. No-op if already listening.
    pub fn start(&self) -> Result<(), Error> {
        let mut state = self.inner.lock_state();
        match state.phase {
            ServerPhase::Shutdown => Err(Error::Shutdown),
            ServerPhase::Listening => Ok(()),
            ServerPhase::Stopped => {
                state.phase = ServerPhase::Listening;
                let inner = self.inner.clone();
                state.accept_task = Some(tokio::spawn(accept_loop(inner)));
                Ok(())
            }
        }
    }

    /// Stop accepting. Existing connections are unaffected.
    pub fn stop(&self) -> Result<(), Error> {
        let mut state = self.inner.lock_state();
        match state.phase {
            ServerPhase::Shutdown => Err(Error::Shutdown),
            ServerPhase::Stopped => Ok(()),
            ServerPhase::Listening => {
                if let Some(task) = state.accept_task.take() {
                    task.abort();
                }
                state.phase = ServerPhase::Stopped;
                Ok(())
            }
        }
    }

    /// Stop accepting and drop every tracked connection. Terminal.
    pub fn shutdown(&self) -> Result<(), Error> {
        let connections = {
            let mut state = self.inner.lock_state();
            if state.phase == ServerPhase::Shutdown {
                return Err(Error::Shutdown);
            }
            if let Some(task) = state.accept_task.take() {
                task.abort();
            }
            state.phase = ServerPhase::Shutdown;
            // Snapshot first: closing triggers owner callbacks that would
            // otherwise mutate the registry under our feet.
            state.connections.drain().map(|(_, c)| c).collect::<Vec<_>>()
        };
        tracing::debug!(count = connections.len(), "shutting down");
        for connection in &connections {
            connection.close();
        }
        if let Some(path) = &self.inner.unix_path {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }
}

async fn accept_loop<F: ProtocolFactory>(inner: Arc<ServerInner<F>>) {
    let mut listener = inner.listener.lock().await;
    loop {
        match listener.accept().await {
            Ok(stream) => {
                let protocol = inner.factory.build();
                let id = {
                    let mut state = inner.lock_state();
                    let id = state.next_conn_id;
                    state.next_conn_id += 1;
                    id
                };
                let owner: Arc<dyn ConnectionOwner> = inner.clone();
                let connection = Connection::establish(id, stream, protocol, owner);
                let mut state = inner.lock_state();
                match state.phase {
                    ServerPhase::Listening => {
                        // The driver may have torn the connection down
                        // before this insert; its removal callback has not
                        // run yet if the transport still reports open.
                        if !connection.transport().is_closed() {
                            state.connections.insert(id, connection);
                        }
                    }
                    _ => connection.close(),
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            }
        }
    }
}

impl<F> ServerInner<F> {
    fn lock_state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<F: ProtocolFactory> ConnectionOwner for ServerInner<F> {
    fn remove_connection(&self, id: u64) {
        let mut state = self.lock_state();
        // Shutdown already drained the registry; late loss signals from
        // the connections it closed are expected here.
        if state.phase == ServerPhase::Shutdown {
            return;
        }
        state.connections.remove(&id);
    }
}
