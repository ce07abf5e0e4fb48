use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::sync::Notify;

use crate::connection::Protocol;
use crate::error::Error;

/// Default cap on bytes queued behind a slow socket.
pub const DEFAULT_MAX_BUFFER: usize = 512 * 1024;

const READ_CHUNK: usize = 4096;

/// Object-safe alias for anything a transport can drive.
pub trait Stream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Stream for T {}

impl std::fmt::Debug for dyn Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Box<dyn Stream>")
    }
}

pub type BoxStream = Box<dyn Stream>;

struct Shared {
    queued: AtomicUsize,
    closed: AtomicBool,
    close_notify: Notify,
    max_buffer: usize,
}

/// Cloneable writing/closing side of a [`Transport`].
///
/// `write` never waits: data the socket cannot take immediately is queued
/// up to the buffer cap and drained by the transport driver as the socket
/// accepts it.
#[derive(Clone)]
pub struct TransportHandle {
    sender: mpsc::UnboundedSender<Bytes>,
    shared: Arc<Shared>,
}

impl TransportHandle {
    /// Queue `data` for sending.
    ///
    /// Fails with `BufferOverflow` when queuing would exceed the buffer
    /// cap (the transport stays open), or `ConnectionClosed` once the
    /// transport is closed.
    pub fn write(&self, data: &[u8]) -> Result<(), Error> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::ConnectionClosed);
        }
        let queued = self.shared.queued.load(Ordering::Acquire);
        if queued + data.len() > self.shared.max_buffer {
            return Err(Error::BufferOverflow {
                requested: data.len(),
                max: self.shared.max_buffer,
            });
        }
        self.shared.queued.fetch_add(data.len(), Ordering::AcqRel);
        self.sender
            .send(Bytes::copy_from_slice(data))
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Close the transport. Idempotent; the close reason is reported to
    /// the protocol exactly once, by the driver.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            self.shared.close_notify.notify_waiters();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Bytes currently queued behind the socket.
    pub fn buffered(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    pub fn max_buffer(&self) -> usize {
        self.shared.max_buffer
    }
}

/// Buffered wrapper around one connected stream.
///
/// The driver half of the pair: [`run`](Transport::run) owns the socket,
/// feeds every chunk it reads to the protocol, drains queued writes, and
/// returns the reason the transport stopped. I/O errors are terminal.
pub struct Transport<S> {
    stream: S,
    receiver: mpsc::UnboundedReceiver<Bytes>,
    shared: Arc<Shared>,
}

impl<S: Stream> Transport<S> {
    pub fn new(stream: S) -> (Transport<S>, TransportHandle) {
        Self::with_max_buffer(stream, DEFAULT_MAX_BUFFER)
    }

    pub fn with_max_buffer(stream: S, max_buffer: usize) -> (Transport<S>, TransportHandle) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            queued: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
            max_buffer,
        });
        let handle = TransportHandle { sender, shared: shared.clone() };
        (Transport { stream, receiver, shared }, handle)
    }

    /// Drive the stream until it closes, delivering reads to `protocol`.
    ///
    /// Returns the close reason: `ConnectionClosed` for a local close or
    /// peer EOF, the I/O error otherwise. The caller reports it onward;
    /// `run` itself never does.
    pub async fn run<P: Protocol + ?Sized>(self, protocol: &mut P) -> Error {
        let Transport { stream, mut receiver, shared } = self;
        let (mut rd, mut wr) = tokio::io::split(stream);
        let mut buf = [0u8; READ_CHUNK];
        let mut write_open = true;
        let reason = loop {
            let closed = shared.close_notify.notified();
            tokio::pin!(closed);
            closed.as_mut().enable();
            if shared.closed.load(Ordering::Acquire) {
                break Error::ConnectionClosed;
            }
            tokio::select! {
                _ = &mut closed => continue,
                read = rd.read(&mut buf) => match read {
                    // Zero-length read is the peer hanging up.
                    Ok(0) => break Error::ConnectionClosed,
                    Ok(n) => protocol.data_received(&buf[..n]),
                    Err(e) => break e.into(),
                },
                chunk = receiver.recv(), if write_open => match chunk {
                    Some(chunk) => {
                        let len = chunk.len();
                        if let Err(e) = wr.write_all(&chunk).await {
                            break e.into();
                        }
                        shared.queued.fetch_sub(len, Ordering::AcqRel);
                    }
                    None => write_open = false,
                },
            }
        };
        shared.closed.store(true, Ordering::Release);
        let _ = wr.shutdown().await;
        reason
    }
}
