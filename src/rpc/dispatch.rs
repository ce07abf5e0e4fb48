use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use crate::async_result::AsyncResult;
use crate::error::Error;
use crate::rpc::WireValue;

/// What a handler hands back: a value ready now, or an [`AsyncResult`]
/// whose resolution supplies the response later.
pub enum Reply<V> {
    Ready(V),
    Deferred(AsyncResult<V>),
}

type HandlerFn<V> = Box<dyn Fn(Vec<V>) -> Result<Reply<V>, Error> + Send + Sync>;

struct Entry<V> {
    arity: Option<usize>,
    handler: HandlerFn<V>,
}

/// Remote call dispatcher: a registry from method name to handler.
///
/// Registration is last-wins on name collision. Calling an absent name is
/// `UnknownMethod`; a declared-arity mismatch is `BadArguments`; any other
/// handler error propagates as the application error it is.
pub struct Dispatch<V> {
    methods: HashMap<String, Entry<V>>,
}

impl<V: WireValue> Default for Dispatch<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: WireValue> Dispatch<V> {
    pub fn new() -> Dispatch<V> {
        Dispatch { methods: HashMap::new() }
    }

    /// Register `handler` under `name`, replacing any previous entry.
    pub fn add(
        &mut self,
        name: impl Into<String>,
        handler: impl Fn(Vec<V>) -> Result<Reply<V>, Error> + Send + Sync + 'static,
    ) {
        self.insert(name.into(), None, Box::new(handler));
    }

    /// Like [`add`](Dispatch::add), but calls with a different argument
    /// count are rejected with `BadArguments` before the handler runs.
    pub fn add_with_arity(
        &mut self,
        name: impl Into<String>,
        arity: usize,
        handler: impl Fn(Vec<V>) -> Result<Reply<V>, Error> + Send + Sync + 'static,
    ) {
        self.insert(name.into(), Some(arity), Box::new(handler));
    }

    fn insert(&mut self, name: String, arity: Option<usize>, handler: HandlerFn<V>) {
        if self.methods.insert(name.clone(), Entry { arity, handler }).is_some() {
            tracing::debug!(method = %name, "dispatch entry replaced");
        }
    }

    pub fn call(&self, method: &str, args: Vec<V>) -> Result<Reply<V>, Error> {
        let entry = self
            .methods
            .get(method)
            .ok_or_else(|| Error::UnknownMethod(method.to_string()))?;
        if let Some(arity) = entry.arity {
            if args.len() != arity {
                return Err(Error::BadArguments(format!(
                    "{} takes {} arguments, got {}",
                    method,
                    arity,
                    args.len()
                )));
            }
        }
        (entry.handler)(args)
    }

    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Extract argument `index` as a `T`, failing with `BadArguments` when the
/// argument is missing or has the wrong shape.
pub fn arg<V: WireValue, T: DeserializeOwned>(args: &[V], index: usize) -> Result<T, Error> {
    let value = args
        .get(index)
        .ok_or_else(|| Error::BadArguments(format!("missing argument {}", index)))?;
    value
        .clone()
        .decode()
        .map_err(|_| Error::BadArguments(format!("argument {} has the wrong type", index)))
}

/// One remotely callable method of a host type.
pub struct RemoteMethod<T, V> {
    pub name: &'static str,
    pub arity: Option<usize>,
    pub invoke: fn(&T, Vec<V>) -> Result<Reply<V>, Error>,
}

/// Capability contract for exposing a subset of a type's methods over RPC:
/// the type enumerates its [`RemoteMethod`] entries and
/// [`object_dispatch`] turns them into a registry.
pub trait RemoteInterface<V: WireValue>: Send + Sync + Sized + 'static {
    fn remote_methods() -> Vec<RemoteMethod<Self, V>>;
}

/// Build a [`Dispatch`] from every remote method `T` exposes.
pub fn object_dispatch<V, T>(object: Arc<T>) -> Dispatch<V>
where
    V: WireValue,
    T: RemoteInterface<V>,
{
    let mut dispatch = Dispatch::new();
    for method in T::remote_methods() {
        let object = object.clone();
        let invoke = method.invoke;
        match method.arity {
            Some(arity) => {
                dispatch.add_with_arity(method.name, arity, move |args| invoke(&object, args))
            }
            None => dispatch.add(method.name, move |args| invoke(&object, args)),
        }
    }
    dispatch
}
