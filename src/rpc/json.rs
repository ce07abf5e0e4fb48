//! Length-prefixed JSON RPC: every message is a 4-byte big-endian length
//! followed by a JSON array. Tags: `0` request `(msgid, method, args,
//! kwargs)`, `1` notification `(method, args, kwargs)`, `2` response
//! `(msgid, result)`, `3` error `(msgid, [kind, message])`.
//!
//! The dispatcher has no named-argument support, so requests carrying a
//! non-empty `kwargs` map are answered with `BadArguments`; proxies on
//! this side always send an empty map.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde_json::{json, Map, Value};

use crate::async_result::AsyncResult;
use crate::connection::{Protocol, ProtocolFactory};
use crate::error::Error;
use crate::framing::{frame, FrameDecoder};
use crate::rpc::proxy::{CallSink, PendingCalls};
use crate::rpc::{Dispatch, Proxy, Reply};
use crate::transport::TransportHandle;

const REQUEST: u64 = 0;
const NOTIFY: u64 = 1;
const RESPONSE: u64 = 2;
const ERROR: u64 = 3;

pub type JsonProxy = Proxy<Value>;

/// Builds a [`JsonProtocol`] per connection over one shared dispatch
/// table.
#[derive(Clone)]
pub struct JsonFactory {
    inner: Arc<FactoryInner>,
}

struct FactoryInner {
    dispatch: Arc<Dispatch<Value>>,
    protocols: Mutex<Vec<JsonProtocol>>,
    next_id: AtomicU64,
}

impl JsonFactory {
    pub fn new(dispatch: Dispatch<Value>) -> JsonFactory {
        Self::with_shared_dispatch(Arc::new(dispatch))
    }

    pub fn with_shared_dispatch(dispatch: Arc<Dispatch<Value>>) -> JsonFactory {
        JsonFactory {
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

    pub fn proxy(&self, index: usize) -> Option<AsyncResult<JsonProxy>> {
        self.inner.lock_protocols().get(index).map(JsonProtocol::proxy)
    }
}

impl ProtocolFactory for JsonFactory {
    type Protocol = JsonProtocol;

    fn build(&self) -> JsonProtocol {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let protocol = JsonProtocol {
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
    fn lock_protocols(&self) -> MutexGuard<'_, Vec<JsonProtocol>> {
        self.protocols.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn forget(&self, id: u64) {
        self.lock_protocols().retain(|p| p.inner.id != id);
    }
}

/// Per-connection length-prefixed JSON framer and multiplexer.
#[derive(Clone)]
pub struct JsonProtocol {
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
    decoder: FrameDecoder,
    proxy: Option<JsonProxy>,
    proxy_waiters: Vec<AsyncResult<JsonProxy>>,
}

impl JsonProtocol {
    pub fn proxy(&self) -> AsyncResult<JsonProxy> {
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
            st.decoder.feed(data);
            let mut messages = Vec::new();
            while let Some(payload) = st.decoder.next_frame()? {
                let message: Value = serde_json::from_slice(&payload)
                    .map_err(|e| Error::Decode(e.to_string()))?;
                messages.push(message);
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
                let (msgid, method, args, kwargs) = parse_request(items)?;
                self.handle_request(msgid, &method, args, kwargs);
                Ok(())
            }
            Some(NOTIFY) => {
                let (method, args, kwargs) = parse_notify(items)?;
                if !kwargs.is_empty() {
                    tracing::debug!(method = %method, "notification with named arguments dropped");
                } else {
                    self.handle_notify(&method, args);
                }
                Ok(())
            }
            Some(RESPONSE) => {
                let (msgid, result) = parse_response(items)?;
                self.inner.resolve_call(msgid, Ok(result));
                Ok(())
            }
            Some(ERROR) => {
                let (msgid, error) = parse_response(items)?;
                self.inner.resolve_call(msgid, Err(remote_error(&error)));
                Ok(())
            }
            _ => Err(Error::Decode("unknown message type tag".to_string())),
        }
    }

    fn handle_request(&self, msgid: u32, method: &str, args: Vec<Value>, kwargs: Map<String, Value>) {
        if !kwargs.is_empty() {
            let error = Error::BadArguments("named arguments are not supported".to_string());
            self.inner.send_error(msgid, &error);
            return;
        }
        match self.inner.dispatch.call(method, args) {
            Ok(Reply::Ready(value)) => self.inner.send_response(msgid, value),
            Ok(Reply::Deferred(result)) => {
                let on_ok = self.clone();
                let on_err = self.clone();
                result.add_callbacks(
                    move |value| {
                        on_ok.inner.send_response(msgid, value.clone());
                        Ok(value)
                    },
                    move |error| {
                        on_err.inner.send_error(msgid, &error);
                        Ok(Value::Null)
                    },
                );
            }
            Err(error) => self.inner.send_error(msgid, &error),
        }
    }

    fn handle_notify(&self, method: &str, args: Vec<Value>) {
        match self.inner.dispatch.call(method, args) {
            Ok(Reply::Ready(_)) => {}
            Ok(Reply::Deferred(result)) => {
                let name = method.to_string();
                result.add_errback(move |e| {
                    tracing::debug!(method = %name, "notification handler failed: {}", e);
                    Ok(Value::Null)
                });
            }
            Err(e) => tracing::debug!(method, "notification dispatch failed: {}", e),
        }
    }
}

impl Protocol for JsonProtocol {
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
        let payload = serde_json::to_vec(message).map_err(|e| Error::Decode(e.to_string()))?;
        let transport = self.lock_state().transport.clone().ok_or(Error::ConnectionClosed)?;
        transport.write(&frame(&payload))
    }

    fn send_response(&self, msgid: u32, result: Value) {
        if let Err(e) = self.send_message(&json!([RESPONSE, msgid, result])) {
            tracing::debug!(msgid, "response dropped: {}", e);
        }
    }

    fn send_error(&self, msgid: u32, error: &Error) {
        let message = json!([ERROR, msgid, [error.kind_name(), error.to_string()]]);
        if let Err(e) = self.send_message(&message) {
            tracing::debug!(msgid, "error response dropped: {}", e);
        }
    }
}

impl CallSink<Value> for ProtoInner {
    fn send_request(&self, msgid: u32, method: &str, params: Vec<Value>) -> Result<(), Error> {
        self.send_message(&json!([REQUEST, msgid, method, params, {}]))
    }

    fn send_notify(&self, method: &str, params: Vec<Value>) -> Result<(), Error> {
        self.send_message(&json!([NOTIFY, method, params, {}]))
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

fn parse_request(items: Vec<Value>) -> Result<(u32, String, Vec<Value>, Map<String, Value>), Error> {
    let mut items = items.into_iter().skip(1);
    let msgid = items
        .next()
        .and_then(|v| v.as_u64())
        .ok_or_else(|| Error::Decode("request msgid is not an integer".to_string()))?;
    let method = match items.next() {
        Some(Value::String(method)) => method,
        _ => return Err(Error::Decode("request method is not a string".to_string())),
    };
    let args = match items.next() {
        Some(Value::Array(args)) => args,
        _ => return Err(Error::Decode("request args are not an array".to_string())),
    };
    let kwargs = match items.next() {
        Some(Value::Object(kwargs)) => kwargs,
        None => Map::new(),
        _ => return Err(Error::Decode("request kwargs are not an object".to_string())),
    };
    Ok((msgid as u32, method, args, kwargs))
}

fn parse_notify(items: Vec<Value>) -> Result<(String, Vec<Value>, Map<String, Value>), Error> {
    let mut items = items.into_iter().skip(1);
    let method = match items.next() {
        Some(Value::String(method)) => method,
        _ => return Err(Error::Decode("notify method is not a string".to_string())),
    };
    let args = match items.next() {
        Some(Value::Array(args)) => args,
        _ => return Err(Error::Decode("notify args are not an array".to_string())),
    };
    let kwargs = match items.next() {
        Some(Value::Object(kwargs)) => kwargs,
        None => Map::new(),
        _ => return Err(Error::Decode("notify kwargs are not an object".to_string())),
    };
    Ok((method, args, kwargs))
}

fn parse_response(items: Vec<Value>) -> Result<(u32, Value), Error> {
    let mut items = items.into_iter().skip(1);
    let msgid = items
        .next()
        .and_then(|v| v.as_u64())
        .ok_or_else(|| Error::Decode("response msgid is not an integer".to_string()))?;
    let payload = items
        .next()
        .ok_or_else(|| Error::Decode("response is missing its payload".to_string()))?;
    Ok((msgid as u32, payload))
}
