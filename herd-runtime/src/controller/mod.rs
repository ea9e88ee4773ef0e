//! Typed controllers on top of shared, untyped event sources
//!
//! A [`GenericController`] owns the queue and cache for one kind and calls every
//! registered [`Handler`] with the key that changed and the object currently cached
//! under it. [`TypedController`] narrows that down to a single Rust type.
use crate::{
    error::{BoxError, Error},
    indexer::Indexer,
    lister::Lister,
};
use futures::{future::BoxFuture, FutureExt};
use herd_core::{DynamicObject, KindInfo, TypedResource};
use std::{
    future::Future,
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;

mod dispatch;
use dispatch::Dispatcher;
pub(crate) use dispatch::{Enabled, Gate};

/// An untyped handler registered on a [`GenericController`]
///
/// Receives the queue key and the cached object, or `None` when nothing is cached under
/// the key any more.
pub type Handler = Arc<
    dyn Fn(String, Option<Arc<DynamicObject>>) -> BoxFuture<'static, Result<Option<DynamicObject>, Error>>
        + Send
        + Sync,
>;

/// The queue, cache and worker pool for one kind
///
/// Implementations call each registered handler once per dequeued key, never running the
/// same registration concurrently for the same key, and requeue the key when the handler
/// fails.
pub trait GenericController: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// The kind whose events this controller delivers
    fn kind(&self) -> &KindInfo;

    /// Register `handler` until `token` is cancelled
    fn add_handler(&self, token: CancellationToken, name: &str, handler: Handler);

    /// The cache handlers read from
    fn informer(&self) -> Indexer;

    /// Schedule the key for `namespace`/`name`
    fn enqueue(&self, namespace: &str, name: &str);

    /// Schedule the key for `namespace`/`name` once `after` has passed
    fn enqueue_after(&self, namespace: &str, name: &str, after: Duration);
}

/// A [`GenericController`] viewed as delivering objects of type `K`
///
/// Cloning is cheap, clones share the underlying controller.
pub struct TypedController<K> {
    generic: Arc<dyn GenericController>,
    namespace: String,
    dropped: Arc<AtomicU64>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for TypedController<K> {
    fn clone(&self) -> Self {
        Self {
            generic: self.generic.clone(),
            namespace: self.namespace.clone(),
            dropped: self.dropped.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: TypedResource> TypedController<K> {
    /// Wrap a generic controller
    ///
    /// `namespace` is the default namespace for lister queries, empty for all.
    pub fn new(generic: Arc<dyn GenericController>, namespace: &str) -> Self {
        Self {
            generic,
            namespace: namespace.to_string(),
            dropped: Arc::default(),
            _kind: PhantomData,
        }
    }

    /// The wrapped controller
    pub fn generic(&self) -> &Arc<dyn GenericController> {
        &self.generic
    }

    /// The default namespace of this controller
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The shared cache
    pub fn informer(&self) -> Indexer {
        self.generic.informer()
    }

    /// A typed read-only view of the shared cache
    pub fn lister(&self) -> Lister<K> {
        Lister::new(&self.namespace, self.generic.informer())
    }

    /// Number of events of a foreign kind that were skipped by handlers of this controller
    pub fn dropped_events(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Schedule `namespace`/`name` for every handler
    pub fn enqueue(&self, namespace: &str, name: &str) {
        self.generic.enqueue(namespace, name);
    }

    /// Schedule `namespace`/`name` for every handler after a delay
    pub fn enqueue_after(&self, namespace: &str, name: &str, after: Duration) {
        self.generic.enqueue_after(namespace, name, after);
    }

    /// Run `handler` for every change to an object of this kind
    ///
    /// The handler is called with `None` once the object is gone. Returned objects are
    /// not written anywhere.
    pub fn add_handler<F, Fut, E>(&self, token: CancellationToken, name: &str, handler: F)
    where
        F: Fn(String, Option<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<K>, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.register(token, name, Gate::default(), business(name, handler));
    }

    /// Like [`TypedController::add_handler`], skipping events while `enabled` returns false
    pub fn add_feature_handler<F, Fut, E>(
        &self,
        token: CancellationToken,
        enabled: impl Fn() -> bool + Send + Sync + 'static,
        name: &str,
        handler: F,
    ) where
        F: Fn(String, Option<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<K>, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let gate = Gate::default().feature(Arc::new(enabled));
        self.register(token, name, gate, business(name, handler));
    }

    /// Like [`TypedController::add_handler`], skipping objects outside `cluster`
    ///
    /// See [`herd_core::cluster`] for how membership is decided.
    pub fn add_cluster_scoped_handler<F, Fut, E>(
        &self,
        token: CancellationToken,
        name: &str,
        cluster: &str,
        handler: F,
    ) where
        F: Fn(String, Option<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<K>, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let gate = Gate::default().cluster(cluster);
        self.register(token, name, gate, business(name, handler));
    }

    /// Both gates of [`TypedController::add_feature_handler`] and
    /// [`TypedController::add_cluster_scoped_handler`]
    pub fn add_cluster_scoped_feature_handler<F, Fut, E>(
        &self,
        token: CancellationToken,
        enabled: impl Fn() -> bool + Send + Sync + 'static,
        name: &str,
        cluster: &str,
        handler: F,
    ) where
        F: Fn(String, Option<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<K>, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let gate = Gate::default().feature(Arc::new(enabled)).cluster(cluster);
        self.register(token, name, gate, business(name, handler));
    }

    pub(crate) fn register<F, Fut>(&self, token: CancellationToken, name: &str, gate: Gate, handler: F)
    where
        F: Fn(String, Option<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<K>, Error>> + Send + 'static,
    {
        let dispatcher = Arc::new(Dispatcher {
            registration: name.to_string(),
            gate,
            dropped: self.dropped.clone(),
            handler,
            _kind: PhantomData,
        });
        let handler: Handler = Arc::new(move |key: String, obj: Option<Arc<DynamicObject>>| {
            let dispatcher = dispatcher.clone();
            async move { dispatcher.dispatch(key, obj).await }.boxed()
        });
        self.generic.add_handler(token, name, handler);
    }
}

/// Box the errors of a business handler under its registration name
fn business<K, F, Fut, E>(
    name: &str,
    handler: F,
) -> impl Fn(String, Option<K>) -> BoxFuture<'static, Result<Option<K>, Error>> + Send + Sync + 'static
where
    K: TypedResource,
    F: Fn(String, Option<K>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<K>, E>> + Send + 'static,
    E: Into<BoxError>,
{
    let name = name.to_string();
    move |key: String, obj: Option<K>| {
        let fut = handler(key, obj);
        let name = name.clone();
        async move {
            fut.await.map_err(|err| Error::Handler {
                name,
                source: err.into(),
            })
        }
        .boxed()
    }
}
