//! MessagePack-RPC: `[0, msgid, method, params]` requests,
//! `[1, msgid, error, result]` responses, `[2, method, params]`
//! notifications, decoded one at a time out of a streaming buffer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bytes::{Buf, BytesMut};
use rmpv::Value;

use crate::async_result::AsyncResult;
use crate::connection::{Protocol, ProtocolFactory};
use crate::error::Error;
use crate::rpc::proxy::{CallSink, PendingCalls};
use crate::rpc::{Dispatch, Proxy, Reply};
use crate::transport::TransportHandle;

const REQUEST: u64 = 0;
const RESPONSE: u64 = 1;
const NOTIFY: u64 = 2;

pub type MsgPackProxy = Proxy<Value>;

/// Builds a [`MsgPackProtocol`] per connection, all sharing one dispatch
/// table, and keeps the live instances until their connections go away.
#[derive(Clone)]
pub struct MsgPackFactory {
    inner: Arc<FactoryInner>,
}

struct FactoryInner {
    dispatch: Arc<Dispatch<Value>>,
    protocols: Mutex<Vec<MsgPackProtocol>>,
    next_id: AtomicU64,
}

impl MsgPackFactory {
    pub fn new(dispatch: Dispatch<Value>) -> MsgPackFactory {
        Self::with_shared_dispatch(Arc::new(dispatch))
    }

    pub fn with_shared_dispatch(dispatch: Arc<Dispatch<Value>>) -> MsgPackFactory {
        MsgPackFactory {
            inner: Arc::new(FactoryInner {
                dispatch,
                protocols: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn protocol_count(&self) -> usize {
        self.inner.lock_protocols().len()
    }

    /// Proxy of the `index`-th live protocol, resolved once its connection
    /// is established.
    pub fn proxy(&self, index: usize) -> Option<AsyncResult<MsgPackProxy>> {
        self.inner.lock_protocols().get(index).map(MsgPackProtocol::proxy)
    }
}

impl ProtocolFactory for MsgPackFactory {
    type Protocol = MsgPackProtocol;

    fn build(&self) -> MsgPackProtocol {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let protocol = MsgPackProtocol {
            inner: Arc::new(ProtoInner {
                id,
                dispatch: self.inner.dispatch.clone(),
                factory: Arc::downgrade(&self.inner),
                calls: Arc::new(Mutex::new(PendingCalls::new())),
                state: Mutex::new(ProtoState::default()),
            }),
        };
        self.inner.lock_protocols().push(protocol.clone());
        protocol
    }
}

impl FactoryInner {
    fn lock_protocols(&self) -> MutexGuard<'_, Vec<MsgPackProtocol>> {
        self.protocols.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn forget(&self, id: u64) {
        self.lock_protocols().retain(|p| p.inner.id != id);
    }
}

/// Per-connection MessagePack-RPC framer and multiplexer.
#[derive(Clone)]
pub struct MsgPackProtocol {
    inner: Arc<ProtoInner>,
}

struct ProtoInner {
    id: u64,
    dispatch: Arc<Dispatch<Value>>,
    factory: Weak<FactoryInner>,
    calls: Arc<Mutex<PendingCalls<Value>>>,
    state: Mutex<ProtoState>,
}

#[derive(Default)]
struct ProtoState {
    transport: Option<TransportHandle>,
    buffer: BytesMut,
    proxy: Option<MsgPackProxy>,
    proxy_waiters: Vec<AsyncResult<MsgPackProxy>>,
}

impl MsgPackProtocol {
    /// A handle on this connection's proxy, resolved at
    /// connection-established (immediately, if that already happened).
    pub fn proxy(&self) -> AsyncResult<MsgPackProxy> {
        let result = AsyncResult::new();
        let existing = {
            let mut st = self.inner.lock_state();
            match &st.proxy {
                Some(proxy) => Some(proxy.clone()),
                None => {
                    st.proxy_waiters.push(result.clone());
                    None
                }
            }
        };
        if let Some(proxy) = existing {
            let _ = result.set_result(proxy);
        }
        result
    }

    fn feed(&self, data: &[u8]) -> Result<(), Error> {
        let messages = {
            let mut st = self.inner.lock_state();
            st.buffer.extend_from_slice(data);
            let mut messages = Vec::new();
            loop {
                let mut cursor = std::io::Cursor::new(&st.buffer[..]);
                match rmpv::decode::read_value(&mut cursor) {
                    Ok(value) => {
                        let used = cursor.position() as usize;
                        st.buffer.advance(used);
                        messages.push(value);
                    }
                    Err(e) if is_incomplete(&e) => break,
                    Err(e) => return Err(Error::Decode(e.to_string())),
                }
            }
            messages
        };
        for message in messages {
            self.handle_message(message)?;
        }
        Ok(())
    }

    fn handle_message(&self, message: Value) -> Result<(), Error> {
        let items = match message {
            Value::Array(items) => items,
            other => return Err(Error::Decode(format!("message is not an array: {}", other))),
        };
        match items.first().and_then(Value::as_u64) {
            Some(REQUEST) => {
                let (msgid, method, params) = parse_request(items)?;
                self.handle_request(msgid, &method, params);
                Ok(())
            }
            Some(RESPONSE) => {
                let (msgid, error, result) = parse_response(items)?;
                let outcome = if error.is_nil() { Ok(result) } else { Err(remote_error(&error)) };
                self.inner.resolve_call(msgid, outcome);
                Ok(())
            }
            Some(NOTIFY) => {
                let (method, params) = parse_notify(items)?;
                self.handle_notify(&method, params);
                Ok(())
            }
            _ => Err(Error::Decode("unknown message type tag".to_string())),
        }
    }

    fn handle_request(&self, msgid: u32, method: &str, params: Vec<Value>) {
        match self.inner.dispatch.call(method, params) {
            Ok(Reply::Ready(value)) => self.inner.send_response(msgid, None, value),
            Ok(Reply::Deferred(result)) => {
                // The handler is itself asynchronous: answer when it does.
                let on_ok = self.clone();
                let on_err = self.clone();
                result.add_callbacks(
                    move |value| {
                        on_ok.inner.send_response(msgid, None, value.clone());
                        Ok(value)
                    },
                    move |error| {
                        on_err.inner.send_response(msgid, Some(&error), Value::Nil);
                        Ok(Value::Nil)
                    },
                );
            }
            Err(error) => self.inner.send_response(msgid, Some(&error), Value::Nil),
        }
    }

    fn handle_notify(&self, method: &str, params: Vec<Value>) {
        match self.inner.dispatch.call(method, params) {
            Ok(Reply::Ready(_)) => {}
            Ok(Reply::Deferred(result)) => {
                // Outcome is discarded, but observe errors so they are not
                // reported as unhandled at drop.
                let name = method.to_string();
                result.add_errback(move |e| {
                    tracing::debug!(method = %name, "notification handler failed: {}", e);
                    Ok(Value::Nil)
                });
            }
            Err(e) => tracing::debug!(method, "notification dispatch failed: {}", e),
        }
    }
}

impl Protocol for MsgPackProtocol {
    fn connection_made(&mut self, transport: TransportHandle) {
        let proxy = Proxy::new(
            self.inner.clone() as Arc<dyn CallSink<Value>>,
            self.inner.calls.clone(),
        );
        let waiters = {
            let mut st = self.inner.lock_state();
            st.transport = Some(transport);
            st.proxy = Some(proxy.clone());
            std::mem::take(&mut st.proxy_waiters)
        };
        for waiter in waiters {
            let _ = waiter.set_result(proxy.clone());
        }
        tracing::debug!(id = self.inner.id, "rpc connection established");
    }

    fn data_received(&mut self, data: &[u8]) {
        if let Err(e) = self.feed(data) {
            tracing::warn!(id = self.inner.id, error = %e, "protocol violation");
            self.inner.close_transport();
        }
    }

    fn connection_lost(&mut self, reason: &Error) {
        // Calls still pending stay unresolved; their callers find out
        // through their own timeouts.
        let waiters = {
            let mut st = self.inner.lock_state();
            st.transport = None;
            st.proxy = None;
            std::mem::take(&mut st.proxy_waiters)
        };
        for waiter in waiters {
            let _ = waiter.set_exception(Error::ConnectionClosed);
        }
        if let Some(factory) = self.inner.factory.upgrade() {
            factory.forget(self.inner.id);
        }
        tracing::debug!(id = self.inner.id, reason = %reason, "rpc connection lost");
    }
}

impl ProtoInner {
    fn lock_state(&self) -> MutexGuard<'_, ProtoState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_calls(&self) -> MutexGuard<'_, PendingCalls<Value>> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn close_transport(&self) {
        if let Some(transport) = &self.lock_state().transport {
            transport.close();
        }
    }

    fn resolve_call(&self, msgid: u32, outcome: Result<Value, Error>) {
        let pending = self.lock_calls().take(msgid);
        match pending {
            Some(result) => {
                let resolved = match outcome {
                    Ok(value) => result.set_result(value),
                    Err(error) => result.set_exception(error),
                };
                if let Err(e) = resolved {
                    tracing::debug!(msgid, "response discarded: {}", e);
                }
            }
            None => tracing::debug!(msgid, "response for unknown request id"),
        }
    }

    fn send_message(&self, message: &Value) -> Result<(), Error> {
        let mut payload = Vec::new();
        rmpv::encode::write_value(&mut payload, message)
            .map_err(|e| Error::Decode(e.to_string()))?;
        let transport = self.lock_state().transport.clone().ok_or(Error::ConnectionClosed)?;
        transport.write(&payload)
    }

    fn send_response(&self, msgid: u32, error: Option<&Error>, result: Value) {
        let error_value = match error {
            Some(e) => Value::Array(vec![
                Value::from(e.kind_name()),
                Value::from(e.to_string().as_str()),
            ]),
            None => Value::Nil,
        };
        let message = Value::Array(vec![
            Value::from(RESPONSE),
            Value::from(msgid),
            error_value,
            result,
        ]);
        if let Err(e) = self.send_message(&message) {
            tracing::debug!(msgid, "response dropped: {}", e);
        }
    }
}

impl CallSink<Value> for ProtoInner {
    fn send_request(&self, msgid: u32, method: &str, params: Vec<Value>) -> Result<(), Error> {
        self.send_message(&Value::Array(vec![
            Value::from(REQUEST),
            Value::from(msgid),
            Value::from(method),
            Value::Array(params),
        ]))
    }

    fn send_notify(&self, method: &str, params: Vec<Value>) -> Result<(), Error> {
        self.send_message(&Value::Array(vec![
            Value::from(NOTIFY),
            Value::from(method),
            Value::Array(params),
        ]))
    }
}

fn is_incomplete(err: &rmpv::decode::Error) -> bool {
    match err {
        rmpv::decode::Error::InvalidMarkerRead(io)
        | rmpv::decode::Error::InvalidDataRead(io) => {
            io.kind() == std::io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}

fn remote_error(error: &Value) -> Error {
    if let Value::Array(parts) = error {
        if let (Some(kind), Some(message)) =
            (parts.first().and_then(Value::as_str), parts.get(1).and_then(Value::as_str))
        {
            return Error::Remote { kind: kind.to_string(), message: message.to_string() };
        }
    }
    Error::Remote { kind: "RemoteError".to_string(), message: error.to_string() }
}

fn parse_request(items: Vec<Value>) -> Result<(u32, String, Vec<Value>), Error> {
    let mut items = items.into_iter().skip(1);
    let msgid = items
        .next()
        .and_then(|v| v.as_u64())
        .ok_or_else(|| Error::Decode("request msgid is not an integer".to_string()))?;
    let method = match items.next() {
        Some(Value::String(s)) => s
            .into_str()
            .ok_or_else(|| Error::Decode("request method is not utf-8".to_string()))?,
        _ => return Err(Error::Decode("request method is not a string".to_string())),
    };
    let params = match items.next() {
        Some(Value::Array(params)) => params,
        _ => return Err(Error::Decode("request params are not an array".to_string())),
    };
    Ok((msgid as u32, method, params))
}

fn parse_response(items: Vec<Value>) -> Result<(u32, Value, Value), Error> {
    let mut items = items.into_iter().skip(1);
    let msgid = items
        .next()
        .and_then(|v| v.as_u64())
        .ok_or_else(|| Error::Decode("response msgid is not an integer".to_string()))?;
    let error = items
        .next()
        .ok_or_else(|| Error::Decode("response is missing its error field".to_string()))?;
    let result = items
        .next()
        .ok_or_else(|| Error::Decode("response is missing its result field".to_string()))?;
    Ok((msgid as u32, error, result))
}

fn parse_notify(items: Vec<Value>) -> Result<(String, Vec<Value>), Error> {
    let mut items = items.into_iter().skip(1);
    let method = match items.next() {
        Some(Value::String(s)) => s
            .into_str()
            .ok_or_else(|| Error::Decode("notify method is not utf-8".to_string()))?,
        _ => return Err(Error::Decode("notify method is not a string".to_string())),
    };
    let params = match items.next() {
        Some(Value::Array(params)) => params,
        _ => return Err(Error::Decode("notify params are not an array".to_string())),
    };
    Ok((method, params))
}
