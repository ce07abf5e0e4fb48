use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::{TcpStream, UnixStream};
use tokio::task::JoinHandle;

use crate::async_result::AsyncResult;
use crate::error::Error;
use crate::transport::BoxStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    New,
    Connecting,
    Connected,
    TimedOut,
    Errored,
}

#[derive(Clone)]
enum Target {
    Tcp(String),
    Unix(PathBuf),
}

/// One-shot client connect attempt with a timeout.
///
/// `start` may be called once; it resolves the connector's [`AsyncResult`]
/// with the connected stream, a connection error, or `Timeout`. `cancel`
/// aborts an in-flight attempt and leaves the result unresolved — the
/// caller cancels the `AsyncResult` itself if it wants waiters released.
pub struct Connector {
    target: Target,
    timeout: Duration,
    state: Arc<Mutex<ConnectorState>>,
    result: AsyncResult<BoxStream>,
    attempt: Option<JoinHandle<()>>,
}

impl Connector {
    pub fn tcp(addr: impl Into<String>, timeout: Duration) -> Connector {
        Self::new(Target::Tcp(addr.into()), timeout)
    }

    pub fn unix(path: impl Into<PathBuf>, timeout: Duration) -> Connector {
        Self::new(Target::Unix(path.into()), timeout)
    }

    fn new(target: Target, timeout: Duration) -> Connector {
        Connector {
            target,
            timeout,
            state: Arc::new(Mutex::new(ConnectorState::New)),
            result: AsyncResult::new(),
            attempt: None,
        }
    }

    pub fn state(&self) -> ConnectorState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Handle on the result this connector resolves.
    pub fn result(&self) -> AsyncResult<BoxStream> {
        self.result.clone()
    }

    /// Begin the connect attempt. A second call fails with `AlreadyCalled`.
    pub fn start(&mut self) -> Result<AsyncResult<BoxStream>, Error> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != ConnectorState::New {
                return Err(Error::AlreadyCalled);
            }
            *state = ConnectorState::Connecting;
        }
        let target = self.target.clone();
        let state = self.state.clone();
        let result = self.result.clone();
        let timeout = self.timeout;
        self.attempt = Some(tokio::spawn(async move {
            let connect = async {
                match &target {
                    Target::Tcp(addr) => TcpStream::connect(addr.as_str())
                        .await
                        .map(|s| Box::new(s) as BoxStream),
                    Target::Unix(path) => UnixStream::connect(path)
                        .await
                        .map(|s| Box::new(s) as BoxStream),
                }
            };
            let settle = |new_state: ConnectorState| {
                *state.lock().unwrap_or_else(|e| e.into_inner()) = new_state;
            };
            let resolved = match tokio::time::timeout(timeout, connect).await {
                Ok(Ok(stream)) => {
                    settle(ConnectorState::Connected);
                    result.set_result(stream)
                }
                Ok(Err(e)) => {
                    settle(ConnectorState::Errored);
                    result.set_exception(e.into())
                }
                Err(_) => {
                    settle(ConnectorState::TimedOut);
                    result.set_exception(Error::Timeout)
                }
            };
            if let Err(e) = resolved {
                tracing::debug!("connect outcome discarded: {}", e);
            }
        }));
        Ok(self.result.clone())
    }

    /// Abort an in-flight attempt. The `AsyncResult` stays unresolved.
    pub fn cancel(&mut self) {
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
    }
}
