use std::sync::Arc;

/// Crate-wide error type.
///
/// Remote peers only ever see the `(kind, message)` pair produced by
/// [`Error::kind_name`] and the `Display` impl; everything else stays
/// local to the process that hit it.
#[derive(Debug, Clone)]
pub enum Error {
    /// The connection was closed, either on purpose or by the peer.
    ConnectionClosed,
    Io(Arc<std::io::Error>),
    /// Queuing a write would grow the transport buffer past its cap.
    BufferOverflow { requested: usize, max: usize },
    Timeout,
    Cancelled,
    /// An `AsyncResult` was resolved (or a one-shot state machine started)
    /// a second time.
    AlreadyCalled,
    /// Operation on a server that has already been shut down.
    Shutdown,
    UnknownMethod(String),
    BadArguments(String),
    /// An error reported by the remote side of an RPC connection.
    Remote { kind: String, message: String },
    /// The peer sent bytes that do not decode as a protocol message.
    Decode(String),
}

impl Error {
    /// Wire-visible name of this error, used as the first element of the
    /// `(kind, message)` tuple in RPC error responses.
    pub fn kind_name(&self) -> &str {
        match self {
            Error::ConnectionClosed => "ConnectionClosed",
            Error::Io(_) => "IoError",
            Error::BufferOverflow { .. } => "BufferOverflowError",
            Error::Timeout => "TimeoutError",
            Error::Cancelled => "CancelledError",
            Error::AlreadyCalled => "AlreadyCalledError",
            Error::Shutdown => "ShutdownError",
            Error::UnknownMethod(_) => "UnknownMethodError",
            Error::BadArguments(_) => "BadArgumentsError",
            Error::Remote { kind, .. } => kind,
            Error::Decode(_) => "DecodeError",
        }
    }

    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Error::ConnectionClosed)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::ConnectionClosed => write!(f, "connection closed"),
            Error::Io(e) => write!(f, "i/o error: {}", e),
            Error::BufferOverflow { requested, max } => {
                write!(f, "write of {} bytes exceeds buffer cap of {}", requested, max)
            }
            Error::Timeout => write!(f, "timed out"),
            Error::Cancelled => write!(f, "cancelled"),
            Error::AlreadyCalled => write!(f, "already called"),
            Error::Shutdown => write!(f, "server is shut down"),
            Error::UnknownMethod(name) => write!(f, "unknown method: {}", name),
            Error::BadArguments(msg) => write!(f, "bad arguments: {}", msg),
            Error::Remote { kind, message } => write!(f, "{}: {}", kind, message),
            Error::Decode(msg) => write!(f, "decode error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}
