//! Shared controllers: one cache and one queue per handler, for each kind
//!
//! A [`SharedController`] is the in-process [`GenericController`]. Its cache is fed either
//! directly through [`SharedController::observe`] and friends or from an [`ObjectClient`]
//! by [`SharedController::reflect`]. Every change is queued for every registered handler,
//! and a pool of workers per handler drains that queue.
use crate::{
    client::{ObjectClient, TypedClient},
    controller::{GenericController, Handler, TypedController},
    error::Error,
    indexer::Indexer,
    queue::WorkQueue,
};
use ahash::AHashMap;
use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};
use futures::{FutureExt, StreamExt};
use herd_core::{DynamicObject, GroupVersionKind, KindInfo, KindRegistry, ObjectKey, Selector, TypedResource};
use kube_core::WatchEvent;
use parking_lot::Mutex;
use std::{
    any::Any,
    collections::HashMap,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Tuning for [`SharedController`]
#[derive(Clone, Debug)]
pub struct SharedControllerConfig {
    /// Number of workers per registered handler
    pub workers: usize,
    /// Delay before the first retry of a failed key
    pub min_retry_delay: Duration,
    /// Upper bound of the retry delay
    pub max_retry_delay: Duration,
}

impl Default for SharedControllerConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            min_retry_delay: Duration::from_millis(5),
            max_retry_delay: Duration::from_secs(1000),
        }
    }
}

impl SharedControllerConfig {
    /// Run `workers` workers for every handler
    ///
    /// At least one worker is always started.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Retry failed keys after `min`, doubling up to `max`
    #[must_use]
    pub fn retry_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_retry_delay = min;
        self.max_retry_delay = max.max(min);
        self
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.min_retry_delay)
            .with_max_delay(self.max_retry_delay)
            .with_factor(2.0)
            .without_max_times()
    }
}

struct Registration {
    name: String,
    token: CancellationToken,
    handler: Handler,
    queue: WorkQueue,
    retries: Mutex<AHashMap<String, ExponentialBackoff>>,
}

/// A [`GenericController`] running handlers on tokio tasks
pub struct SharedController {
    name: String,
    kind: KindInfo,
    config: SharedControllerConfig,
    indexer: Indexer,
    registrations: Mutex<Vec<Arc<Registration>>>,
    started: AtomicBool,
    shutdown: CancellationToken,
}

impl SharedController {
    /// A controller for `kind` with the default configuration
    pub fn new(kind: KindInfo) -> Arc<Self> {
        Self::with_config(kind, SharedControllerConfig::default())
    }

    /// A controller for `kind`
    pub fn with_config(kind: KindInfo, config: SharedControllerConfig) -> Arc<Self> {
        Arc::new(Self {
            name: kind.group_resource(),
            kind,
            config,
            indexer: Indexer::new(),
            registrations: Mutex::default(),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        })
    }

    /// Start the workers of every handler, including handlers registered later on
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(controller = %self.name, "starting");
        for registration in self.live_registrations() {
            self.spawn_workers(&registration);
        }
    }

    /// Stop every worker and drop queued keys
    ///
    /// Handlers that are running are allowed to finish.
    pub fn shutdown(&self) {
        info!(controller = %self.name, "shutting down");
        self.shutdown.cancel();
        for registration in self.registrations.lock().drain(..) {
            registration.queue.shut_down();
        }
    }

    /// Whether [`SharedController::shutdown`] was called
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Cache `obj` and queue its key
    pub fn observe(&self, mut obj: DynamicObject) {
        self.kind.stamp(&mut obj);
        let key = self.indexer.apply(obj);
        self.enqueue_key(&key);
    }

    /// Drop `obj` from the cache and queue its key
    pub fn forget(&self, obj: &DynamicObject) {
        let key = self.indexer.delete(obj);
        self.enqueue_key(&key);
    }

    /// Replace the cache with a fresh listing, queueing new, changed and vanished keys
    pub fn replace(&self, objs: Vec<DynamicObject>) {
        let objs = objs
            .into_iter()
            .map(|mut obj| {
                self.kind.stamp(&mut obj);
                obj
            })
            .collect();
        for key in self.indexer.replace(objs) {
            self.enqueue_key(&key);
        }
    }

    /// Apply one watch event to the cache
    pub fn apply_event(&self, event: WatchEvent<DynamicObject>) {
        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => self.observe(obj),
            WatchEvent::Deleted(obj) => self.forget(&obj),
            WatchEvent::Bookmark(_) => {}
            WatchEvent::Error(err) => warn!(controller = %self.name, error = %err, "watch error"),
        }
    }

    /// Mirror the objects of `client` into the cache until shutdown
    ///
    /// Watches first and lists second, so that no change between the two is lost.
    pub async fn reflect(&self, client: &dyn ObjectClient) -> herd_core::Result<()> {
        let mut events = client.watch(None).await?;
        self.replace(client.list(None, &Selector::default()).await?);
        debug!(controller = %self.name, objects = self.indexer.len(), "initial list applied");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                event = events.next() => match event {
                    Some(event) => self.apply_event(event),
                    None => return Ok(()),
                },
            }
        }
    }

    fn enqueue_key(&self, key: &str) {
        for registration in self.live_registrations() {
            registration.queue.add(key);
        }
    }

    /// Registrations whose token is still live, pruning the others
    fn live_registrations(&self) -> Vec<Arc<Registration>> {
        let mut registrations = self.registrations.lock();
        registrations.retain(|r| {
            let live = !r.token.is_cancelled();
            if !live {
                r.queue.shut_down();
            }
            live
        });
        registrations.clone()
    }

    fn spawn_workers(&self, registration: &Arc<Registration>) {
        for _ in 0..self.config.workers.max(1) {
            let worker = Worker {
                controller: self.name.clone(),
                indexer: self.indexer.clone(),
                registration: registration.clone(),
                backoff: self.config.backoff(),
                max_delay: self.config.max_retry_delay,
                shutdown: self.shutdown.clone(),
            };
            tokio::spawn(worker.run());
        }
    }
}

impl GenericController for SharedController {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> &KindInfo {
        &self.kind
    }

    fn add_handler(&self, token: CancellationToken, name: &str, handler: Handler) {
        if self.is_shut_down() {
            return;
        }
        let registration = Arc::new(Registration {
            name: name.to_string(),
            token,
            handler,
            queue: WorkQueue::new(),
            retries: Mutex::default(),
        });
        // a late handler still sees everything already cached
        for key in self.indexer.keys() {
            registration.queue.add(key);
        }
        debug!(controller = %self.name, handler = %name, "registered handler");
        self.registrations.lock().push(registration.clone());
        if self.started.load(Ordering::SeqCst) {
            self.spawn_workers(&registration);
        }
    }

    fn informer(&self) -> Indexer {
        self.indexer.clone()
    }

    fn enqueue(&self, namespace: &str, name: &str) {
        self.enqueue_key(&ObjectKey::from_parts(namespace, name).to_string());
    }

    fn enqueue_after(&self, namespace: &str, name: &str, after: Duration) {
        let key = ObjectKey::from_parts(namespace, name).to_string();
        for registration in self.live_registrations() {
            registration.queue.add_after(key.clone(), after);
        }
    }
}

struct Worker {
    controller: String,
    indexer: Indexer,
    registration: Arc<Registration>,
    backoff: ExponentialBuilder,
    max_delay: Duration,
    shutdown: CancellationToken,
}

impl Worker {
    fn is_cancelled(&self) -> bool {
        self.shutdown.is_cancelled() || self.registration.token.is_cancelled()
    }

    async fn run(self) {
        loop {
            let key = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = self.registration.token.cancelled() => break,
                key = self.registration.queue.get() => match key {
                    Some(key) => key,
                    None => break,
                },
            };
            if self.is_cancelled() {
                self.registration.queue.done(&key);
                break;
            }
            self.process(&key).await;
            self.registration.queue.done(&key);
        }
    }

    async fn process(&self, key: &str) {
        let span = info_span!(
            "dispatch",
            controller = %self.controller,
            handler = %self.registration.name,
            %key
        );
        let obj = self.indexer.get_by_key(key);
        let handler = &self.registration.handler;
        let result = AssertUnwindSafe(async { handler(key.to_string(), obj).await })
            .catch_unwind()
            .instrument(span.clone())
            .await
            .unwrap_or_else(|payload| {
                Err(Error::Panicked {
                    name: self.registration.name.clone(),
                    message: panic_message(&*payload),
                })
            });
        let _entered = span.enter();
        match result {
            Ok(_) => {
                self.registration.retries.lock().remove(key);
            }
            Err(err) => {
                let delay = self
                    .registration
                    .retries
                    .lock()
                    .entry(key.to_string())
                    .or_insert_with(|| self.backoff.clone().build())
                    .next()
                    .unwrap_or(self.max_delay);
                warn!(error = %err, ?delay, "handler failed, requeueing");
                self.registration.queue.add_after(key, delay);
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Hands out one [`SharedController`] per registered kind
pub struct SharedControllerFactory {
    registry: KindRegistry,
    config: SharedControllerConfig,
    controllers: Mutex<HashMap<GroupVersionKind, Arc<SharedController>>>,
    started: AtomicBool,
}

impl SharedControllerFactory {
    /// A factory serving the kinds in `registry`
    pub fn new(registry: KindRegistry, config: SharedControllerConfig) -> Self {
        Self {
            registry,
            config,
            controllers: Mutex::default(),
            started: AtomicBool::new(false),
        }
    }

    /// The kinds this factory serves
    pub fn registry(&self) -> &KindRegistry {
        &self.registry
    }

    /// The shared controller for `K`, created on first use
    pub fn for_kind<K: TypedResource>(&self) -> Result<Arc<SharedController>, Error> {
        let info = self.registry.lookup::<K>().ok_or_else(|| Error::UnregisteredKind {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
        })?;
        let controller = self
            .controllers
            .lock()
            .entry(info.gvk())
            .or_insert_with(|| SharedController::with_config(info.clone(), self.config.clone()))
            .clone();
        if self.started.load(Ordering::SeqCst) {
            controller.start();
        }
        Ok(controller)
    }

    /// A typed controller for `K` defaulting to `namespace`
    pub fn controller<K: TypedResource>(&self, namespace: &str) -> Result<TypedController<K>, Error> {
        Ok(TypedController::new(self.for_kind::<K>()?, namespace))
    }

    /// A typed client for `K` over `store`, in `namespace`
    pub fn client<K: TypedResource>(
        &self,
        store: Arc<dyn ObjectClient>,
        namespace: &str,
    ) -> Result<TypedClient<K>, Error> {
        Ok(TypedClient::new(store, self.controller(namespace)?))
    }

    /// Start every controller handed out so far and every one handed out later
    pub fn start(&self) {
        self.started.store(true, Ordering::SeqCst);
        for controller in self.controllers.lock().values() {
            controller.start();
        }
    }

    /// Shut every controller down
    pub fn shutdown(&self) {
        for controller in self.controllers.lock().values() {
            controller.shutdown();
        }
    }
}
