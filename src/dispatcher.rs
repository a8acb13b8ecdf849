//! Typed pub/sub of events to async handlers.
//!
//! A [`Dispatcher`] maps event keys to persistent listeners and one-shot
//! [`Dispatcher::wait_for`] futures. Handlers run as independent tasks, so a
//! slow or failing handler never blocks its siblings. Failures are routed to
//! dedicated error handlers instead of propagating into the dispatch flow.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error};

/// The error type handlers may fail with.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// What every handler returns.
pub type HandlerResult = Result<(), HandlerError>;

/// A handler failure as delivered to error handlers.
pub type DispatchFailure = Arc<dyn std::error::Error + Send + Sync>;

/// Returned by [`Dispatcher::wait_for`] when the dispatcher is dropped
/// before a matching event arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("dispatcher dropped before a matching event")]
pub struct WaitForDropped;

/// Identifies a registered handler so it can be removed later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener<P> = Arc<dyn Fn(P) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
type GlobalListener<K, P> = Arc<dyn Fn(K, P) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(DispatchFailure) -> BoxFuture<'static, ()> + Send + Sync>;
type GlobalErrorHandler<K> = Arc<dyn Fn(K, DispatchFailure) -> BoxFuture<'static, ()> + Send + Sync>;

struct Waiter<P> {
    check: Box<dyn Fn(&P) -> bool + Send + Sync>,
    tx: oneshot::Sender<P>,
}

struct GlobalWaiter<K, P> {
    check: Box<dyn Fn(&K, &P) -> bool + Send + Sync>,
    tx: oneshot::Sender<(K, P)>,
}

struct Inner<K, P> {
    next_id: u64,
    listeners: HashMap<K, Vec<(ListenerId, Listener<P>)>>,
    global_listeners: Vec<(ListenerId, GlobalListener<K, P>)>,
    waiters: HashMap<K, Vec<Waiter<P>>>,
    global_waiters: Vec<GlobalWaiter<K, P>>,
    error_handlers: HashMap<K, Vec<ErrorHandler>>,
    global_error_handlers: Vec<GlobalErrorHandler<K>>,
}

impl<K, P> Default for Inner<K, P> {
    fn default() -> Self {
        Self {
            next_id: 0,
            listeners: HashMap::new(),
            global_listeners: Vec::new(),
            waiters: HashMap::new(),
            global_waiters: Vec::new(),
            error_handlers: HashMap::new(),
            global_error_handlers: Vec::new(),
        }
    }
}

/// An event dispatcher generic over the key and payload types.
///
/// Cloning is cheap and clones share registrations.
pub struct Dispatcher<K, P> {
    inner: Arc<Mutex<Inner<K, P>>>,
}

impl<K, P> Clone for Dispatcher<K, P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, P> Default for Dispatcher<K, P> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
        }
    }
}

impl<K, P> fmt::Debug for Dispatcher<K, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Dispatcher")
            .field("listeners", &inner.listeners.len())
            .field("global_listeners", &inner.global_listeners.len())
            .field("waiters", &inner.waiters.len())
            .finish_non_exhaustive()
    }
}

impl<K, P> Dispatcher<K, P>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
    P: Clone + Send + Sync + 'static,
{
    /// Create an empty dispatcher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a persistent listener for `key`.
    pub fn add_listener<F, Fut>(&self, key: K, handler: F) -> ListenerId
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let mut inner = self.inner.lock();
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;
        let listener: Listener<P> = Arc::new(move |payload| Box::pin(handler(payload)));
        inner.listeners.entry(key).or_default().push((id, listener));
        id
    }

    /// Register a listener that receives every event with the key prepended.
    pub fn add_global_listener<F, Fut>(&self, handler: F) -> ListenerId
    where
        F: Fn(K, P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let mut inner = self.inner.lock();
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;
        let listener: GlobalListener<K, P> = Arc::new(move |key, payload| Box::pin(handler(key, payload)));
        inner.global_listeners.push((id, listener));
        id
    }

    /// Deregister a listener previously added with [`Self::add_listener`].
    ///
    /// Returns whether the listener was found.
    pub fn remove_listener(&self, key: &K, id: ListenerId) -> bool {
        let mut inner = self.inner.lock();
        let Some(listeners) = inner.listeners.get_mut(key) else {
            return false;
        };
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    /// Deregister a global listener.
    ///
    /// Returns whether the listener was found.
    pub fn remove_global_listener(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.global_listeners.len();
        inner.global_listeners.retain(|(listener_id, _)| *listener_id != id);
        inner.global_listeners.len() != before
    }

    /// Register an error handler invoked when a listener for `key` fails.
    pub fn add_error_handler<F, Fut>(&self, key: K, handler: F)
    where
        F: Fn(DispatchFailure) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: ErrorHandler = Arc::new(move |failure| Box::pin(handler(failure)));
        self.inner.lock().error_handlers.entry(key).or_default().push(handler);
    }

    /// Register an error handler invoked when any listener fails.
    pub fn add_global_error_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(K, DispatchFailure) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: GlobalErrorHandler<K> = Arc::new(move |key, failure| Box::pin(handler(key, failure)));
        self.inner.lock().global_error_handlers.push(handler);
    }

    /// Resolve with the first `key` payload for which `check` returns true.
    ///
    /// Dropping the returned future deregisters the waiter.
    ///
    /// # Errors
    ///
    /// Returns [`WaitForDropped`] if every clone of the dispatcher is dropped
    /// before a matching event is dispatched.
    pub async fn wait_for<F>(&self, key: K, check: F) -> Result<P, WaitForDropped>
    where
        F: Fn(&P) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().waiters.entry(key).or_default().push(Waiter {
            check: Box::new(check),
            tx,
        });
        rx.await.map_err(|_| WaitForDropped)
    }

    /// Resolve with the first `(key, payload)` for which `check` returns true.
    ///
    /// # Errors
    ///
    /// Returns [`WaitForDropped`] if every clone of the dispatcher is dropped
    /// before a matching event is dispatched.
    pub async fn wait_for_global<F>(&self, check: F) -> Result<(K, P), WaitForDropped>
    where
        F: Fn(&K, &P) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.inner.lock().global_waiters.push(GlobalWaiter {
            check: Box::new(check),
            tx,
        });
        rx.await.map_err(|_| WaitForDropped)
    }

    /// Dispatch `payload` under `key`.
    ///
    /// Every matching listener is spawned as an independent task in
    /// registration order. The returned future resolves once all spawned
    /// handlers have finished and may be dropped if completion does not
    /// matter.
    pub fn dispatch(&self, key: K, payload: P) -> impl Future<Output = ()> + Send + 'static {
        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        {
            let mut inner = self.inner.lock();

            for (_, listener) in &inner.global_listeners {
                let listener = Arc::clone(listener);
                let key = key.clone();
                let payload = payload.clone();
                let shared = Arc::clone(&self.inner);
                tasks.push(tokio::spawn(async move {
                    if let Err(failure) = listener(key.clone(), payload).await {
                        handle_failure(&shared, &key, failure.into()).await;
                    }
                }));
            }
            if let Some(listeners) = inner.listeners.get(&key) {
                for (_, listener) in listeners {
                    let listener = Arc::clone(listener);
                    let key = key.clone();
                    let payload = payload.clone();
                    let shared = Arc::clone(&self.inner);
                    tasks.push(tokio::spawn(async move {
                        if let Err(failure) = listener(payload).await {
                            handle_failure(&shared, &key, failure.into()).await;
                        }
                    }));
                }
            }

            if let Some(waiters) = inner.waiters.get_mut(&key) {
                let mut kept = Vec::with_capacity(waiters.len());
                for waiter in waiters.drain(..) {
                    if waiter.tx.is_closed() {
                        continue;
                    }
                    if (waiter.check)(&payload) {
                        let _ = waiter.tx.send(payload.clone());
                    } else {
                        kept.push(waiter);
                    }
                }
                *waiters = kept;
            }
            let mut kept = Vec::with_capacity(inner.global_waiters.len());
            for waiter in inner.global_waiters.drain(..) {
                if waiter.tx.is_closed() {
                    continue;
                }
                if (waiter.check)(&key, &payload) {
                    let _ = waiter.tx.send((key.clone(), payload.clone()));
                } else {
                    kept.push(waiter);
                }
            }
            inner.global_waiters = kept;
        }

        debug!(handlers = tasks.len(), "dispatched event");
        async move {
            for task in tasks {
                let _ = task.await;
            }
        }
    }
}

/// Deliver a handler failure to the registered error handlers, or log it.
async fn handle_failure<K, P>(inner: &Arc<Mutex<Inner<K, P>>>, key: &K, failure: DispatchFailure)
where
    K: Clone + Eq + Hash,
{
    let (keyed, global) = {
        let inner = inner.lock();
        (
            inner.error_handlers.get(key).cloned().unwrap_or_default(),
            inner.global_error_handlers.clone(),
        )
    };
    if keyed.is_empty() && global.is_empty() {
        error!(error = %failure, "unhandled failure in event handler");
        return;
    }
    for handler in keyed {
        handler(Arc::clone(&failure)).await;
    }
    for handler in global {
        handler(key.clone(), Arc::clone(&failure)).await;
    }
}
