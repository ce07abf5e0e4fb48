use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::Error;

type Callback<T> = Box<dyn FnOnce(T) -> Result<T, Error> + Send>;
type Errback<T> = Box<dyn FnOnce(Error) -> Result<T, Error> + Send>;
type CancelFn = Box<dyn FnOnce() + Send>;

/// A single-assignment asynchronous result, fusing a callback-chaining
/// deferred with a blocking-style future.
///
/// An `AsyncResult` is resolved exactly once with [`set_result`] or
/// [`set_exception`], after which the attached callback chain runs in
/// attachment order: each success callback consumes the value produced by
/// the previous one, and a callback returning `Err` skips every following
/// success callback until an errback handles it, exactly like exception
/// propagation through a stack of handlers.
///
/// Waiting with [`result`] does not block the runtime; other connections
/// and timers keep making progress while the caller awaits.
///
/// Handles are cheap clones sharing one cell.
///
/// [`set_result`]: AsyncResult::set_result
/// [`set_exception`]: AsyncResult::set_exception
/// [`result`]: AsyncResult::result
pub struct AsyncResult<T> {
    inner: Arc<Inner<T>>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    notify: Notify,
}

struct State<T> {
    resolved: bool,
    cancelled: bool,
    draining: bool,
    observed: bool,
    taken: bool,
    outcome: Option<Result<T, Error>>,
    callbacks: VecDeque<(Option<Callback<T>>, Option<Errback<T>>)>,
    on_cancel: Option<CancelFn>,
}

impl<T> Clone for AsyncResult<T> {
    fn clone(&self) -> Self {
        AsyncResult { inner: self.inner.clone() }
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // An error nobody looked at must not vanish silently.
        if let Ok(st) = self.state.get_mut() {
            if !st.observed {
                if let Some(Err(e)) = &st.outcome {
                    tracing::error!("unhandled error in dropped AsyncResult: {}", e);
                }
            }
        }
    }
}

impl<T: Send + 'static> Default for AsyncResult<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> AsyncResult<T> {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// An `AsyncResult` whose `on_cancel` is invoked if [`cancel`] wins the
    /// race against resolution.
    ///
    /// [`cancel`]: AsyncResult::cancel
    pub fn with_cancel_callback(on_cancel: impl FnOnce() + Send + 'static) -> Self {
        Self::build(Some(Box::new(on_cancel)))
    }

    fn build(on_cancel: Option<CancelFn>) -> Self {
        AsyncResult {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    resolved: false,
                    cancelled: false,
                    draining: false,
                    observed: false,
                    taken: false,
                    outcome: None,
                    callbacks: VecDeque::new(),
                    on_cancel,
                }),
                notify: Notify::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_resolved(&self) -> bool {
        self.lock().resolved
    }

    pub fn is_cancelled(&self) -> bool {
        self.lock().cancelled
    }

    /// Resolve with a value. Fails with `AlreadyCalled` if resolved before,
    /// or `Cancelled` if [`cancel`](AsyncResult::cancel) got there first.
    pub fn set_result(&self, value: T) -> Result<(), Error> {
        self.resolve(Ok(value))
    }

    /// Resolve with an error, starting the errback side of the chain.
    pub fn set_exception(&self, error: Error) -> Result<(), Error> {
        self.resolve(Err(error))
    }

    fn resolve(&self, outcome: Result<T, Error>) -> Result<(), Error> {
        {
            let mut st = self.lock();
            if st.cancelled {
                return Err(Error::Cancelled);
            }
            if st.resolved {
                return Err(Error::AlreadyCalled);
            }
            st.resolved = true;
            st.outcome = Some(outcome);
        }
        self.drain();
        Ok(())
    }

    /// Append a success callback; on chain error it is skipped.
    pub fn add_callback(
        &self,
        callback: impl FnOnce(T) -> Result<T, Error> + Send + 'static,
    ) -> AsyncResult<T> {
        self.push_pair(Some(Box::new(callback)), None);
        self.clone()
    }

    /// Append an errback; invoked only when the chain carries an error, and
    /// may recover by returning `Ok`.
    pub fn add_errback(
        &self,
        errback: impl FnOnce(Error) -> Result<T, Error> + Send + 'static,
    ) -> AsyncResult<T> {
        self.push_pair(None, Some(Box::new(errback)));
        self.clone()
    }

    /// Append a (callback, errback) pair; exactly one of the two runs,
    /// depending on the outcome the chain carries when the pair's turn
    /// comes.
    pub fn add_callbacks(
        &self,
        callback: impl FnOnce(T) -> Result<T, Error> + Send + 'static,
        errback: impl FnOnce(Error) -> Result<T, Error> + Send + 'static,
    ) -> AsyncResult<T> {
        self.push_pair(Some(Box::new(callback)), Some(Box::new(errback)));
        self.clone()
    }

    fn push_pair(&self, callback: Option<Callback<T>>, errback: Option<Errback<T>>) {
        let run = {
            let mut st = self.lock();
            if errback.is_some() {
                st.observed = true;
            }
            st.callbacks.push_back((callback, errback));
            // If a drain is active it will pick the new pair up itself.
            st.resolved && !st.draining
        };
        if run {
            self.drain();
        }
    }

    fn drain(&self) {
        {
            let mut st = self.lock();
            if st.draining {
                return;
            }
            st.draining = true;
        }
        loop {
            let (pair, outcome) = {
                let mut st = self.lock();
                if st.cancelled || st.callbacks.is_empty() || st.outcome.is_none() {
                    st.draining = false;
                    break;
                }
                let pair = match st.callbacks.pop_front() {
                    Some(pair) => pair,
                    None => {
                        st.draining = false;
                        break;
                    }
                };
                let outcome = match st.outcome.take() {
                    Some(outcome) => outcome,
                    None => {
                        st.draining = false;
                        break;
                    }
                };
                (pair, outcome)
            };
            // Callbacks run without the lock held; they may attach more
            // callbacks or hand the result on to other AsyncResults.
            let next = match outcome {
                Ok(value) => match pair.0 {
                    Some(cb) => cb(value),
                    None => Ok(value),
                },
                Err(err) => match pair.1 {
                    Some(eb) => eb(err),
                    None => Err(err),
                },
            };
            self.lock().outcome = Some(next);
        }
        self.inner.notify.notify_waiters();
    }

    /// Transition to cancelled, running the cancellation callback if one
    /// was supplied. Fails with `AlreadyCalled` once resolved; cancelling
    /// twice is a no-op.
    pub fn cancel(&self) -> Result<(), Error> {
        let on_cancel = {
            let mut st = self.lock();
            if st.resolved {
                return Err(Error::AlreadyCalled);
            }
            if st.cancelled {
                return Ok(());
            }
            st.cancelled = true;
            st.on_cancel.take()
        };
        if let Some(f) = on_cancel {
            f();
        }
        self.inner.notify.notify_waiters();
        Ok(())
    }

    fn settled(&self) -> bool {
        let st = self.lock();
        st.cancelled || (st.resolved && !st.draining && (st.outcome.is_some() || st.taken))
    }

    async fn wait_settled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.settled() {
                return;
            }
            notified.await;
        }
    }

    async fn wait(&self, timeout: Option<Duration>) -> Result<(), Error> {
        self.lock().observed = true;
        match timeout {
            Some(d) => tokio::time::timeout(d, self.wait_settled())
                .await
                .map_err(|_| Error::Timeout),
            None => {
                self.wait_settled().await;
                Ok(())
            }
        }
    }

    /// Wait for the final outcome of the callback chain and return a clone
    /// of it. Raises `Timeout` if `timeout` elapses first, `Cancelled` if
    /// the result was cancelled, or the stored error.
    pub async fn result(&self, timeout: Option<Duration>) -> Result<T, Error>
    where
        T: Clone,
    {
        self.wait(timeout).await?;
        let st = self.lock();
        if st.cancelled {
            return Err(Error::Cancelled);
        }
        match &st.outcome {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(err)) => Err(err.clone()),
            None => Err(Error::AlreadyCalled),
        }
    }

    /// Like [`result`](AsyncResult::result) but moves the outcome out, for
    /// payloads that cannot be cloned (sockets). A second consumer sees
    /// `AlreadyCalled`.
    pub async fn into_result(self, timeout: Option<Duration>) -> Result<T, Error> {
        self.wait(timeout).await?;
        let mut st = self.lock();
        if st.cancelled {
            return Err(Error::Cancelled);
        }
        match st.outcome.take() {
            Some(outcome) => {
                st.taken = true;
                outcome
            }
            None => Err(Error::AlreadyCalled),
        }
    }
}
