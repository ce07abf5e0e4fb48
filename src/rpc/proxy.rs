use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::async_result::AsyncResult;
use crate::error::Error;
use crate::rpc::WireValue;

/// Requests awaiting a response, keyed by request id.
///
/// Ids increase monotonically and are never reused within a connection's
/// lifetime; correlation is by id alone, never arrival order.
pub(crate) struct PendingCalls<V> {
    next_id: u32,
    calls: HashMap<u32, AsyncResult<V>>,
}

impl<V: WireValue> PendingCalls<V> {
    pub(crate) fn new() -> PendingCalls<V> {
        PendingCalls { next_id: 0, calls: HashMap::new() }
    }

    pub(crate) fn register(&mut self, result: AsyncResult<V>) -> u32 {
        let id = self.next_id;
        self.next_id += 1;
        self.calls.insert(id, result);
        id
    }

    pub(crate) fn discard(&mut self, id: u32) {
        self.calls.remove(&id);
    }

    /// Detach the call `id` correlates to. `None` is tolerated: the caller
    /// may have cancelled the call locally after the request went out.
    /// Resolution happens after the lock is released, since callbacks may
    /// issue follow-up calls through the same proxy.
    pub(crate) fn take(&mut self, id: u32) -> Option<AsyncResult<V>> {
        self.calls.remove(&id)
    }
}

/// How a proxy puts call frames on the wire; implemented by each protocol.
pub(crate) trait CallSink<V>: Send + Sync {
    fn send_request(&self, msgid: u32, method: &str, params: Vec<V>) -> Result<(), Error>;
    fn send_notify(&self, method: &str, params: Vec<V>) -> Result<(), Error>;
}

/// Client-side façade over one RPC connection.
///
/// `begin_call` returns an [`AsyncResult`] immediately; `call` is the
/// synchronous-looking convenience that awaits it with the proxy's default
/// timeout; `notify` is fire-and-forget.
pub struct Proxy<V> {
    sink: Arc<dyn CallSink<V>>,
    calls: Arc<Mutex<PendingCalls<V>>>,
    timeout: Option<Duration>,
}

impl<V> Clone for Proxy<V> {
    fn clone(&self) -> Self {
        Proxy {
            sink: self.sink.clone(),
            calls: self.calls.clone(),
            timeout: self.timeout,
        }
    }
}

impl<V: WireValue> Proxy<V> {
    pub(crate) fn new(sink: Arc<dyn CallSink<V>>, calls: Arc<Mutex<PendingCalls<V>>>) -> Proxy<V> {
        Proxy { sink, calls, timeout: None }
    }

    fn lock_calls(&self) -> MutexGuard<'_, PendingCalls<V>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Default timeout for [`call`](Proxy::call); `None` waits forever.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Issue a request and wait for its response, surfacing exactly the
    /// remote error or a local `Timeout`/`Cancelled`.
    pub async fn call(&self, method: &str, params: Vec<V>) -> Result<V, Error> {
        self.begin_call(method, params).result(self.timeout).await
    }

    /// Send a fire-and-forget notification.
    pub fn notify(&self, method: &str, params: Vec<V>) -> Result<(), Error> {
        self.sink.send_notify(method, params)
    }

    /// Allocate the next request id, register the pending call, and write
    /// the request frame. Never blocks; a write failure resolves the
    /// returned result with the error.
    pub fn begin_call(&self, method: &str, params: Vec<V>) -> AsyncResult<V> {
        let result = AsyncResult::new();
        let id = self.lock_calls().register(result.clone());
        if let Err(e) = self.sink.send_request(id, method, params) {
            self.lock_calls().discard(id);
            let _ = result.set_exception(e);
        }
        result
    }
}
