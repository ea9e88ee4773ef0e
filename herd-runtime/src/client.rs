//! Object store access, untyped and typed
use crate::{
    controller::{Enabled, Gate, TypedController},
    error::BoxError,
    lifecycle::{Lifecycle, LifecycleAdapter},
};
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt};
use herd_core::{DynamicObject, KindInfo, ObjectKey, Result, Selector, TypedResource};
use kube_core::{metadata::TypeMeta, WatchEvent};
use std::{future::Future, sync::Arc};
use tokio_util::sync::CancellationToken;

/// CRUD and watch access to the stored objects of one kind
///
/// Writes use optimistic concurrency: an update carrying a stale `resourceVersion`, or a
/// JSON patch whose `test` operations fail, is rejected with a conflict error.
#[async_trait]
pub trait ObjectClient: Send + Sync {
    /// The kind this client serves
    fn kind(&self) -> &KindInfo;

    /// Store a new object
    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Fetch an object by namespace and name
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<DynamicObject>;

    /// Replace an object
    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject>;

    /// Apply a JSON patch to an object
    async fn patch(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<DynamicObject>;

    /// Delete an object, or mark it for deletion while it has finalizers
    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<()>;

    /// Delete every object in `namespace` matching `selector`, all namespaces for `None`
    async fn delete_collection(&self, namespace: Option<&str>, selector: &Selector) -> Result<()>;

    /// Every object in `namespace` matching `selector`, all namespaces for `None`
    async fn list(&self, namespace: Option<&str>, selector: &Selector) -> Result<Vec<DynamicObject>>;

    /// Changes to objects in `namespace` from now on, all namespaces for `None`
    async fn watch(&self, namespace: Option<&str>) -> Result<BoxStream<'static, WatchEvent<DynamicObject>>>;
}

/// An [`ObjectClient`] and [`TypedController`] for one kind, in one namespace
///
/// Methods without a namespace argument use the client's namespace.
pub struct TypedClient<K> {
    client: Arc<dyn ObjectClient>,
    controller: TypedController<K>,
}

impl<K> Clone for TypedClient<K> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            controller: self.controller.clone(),
        }
    }
}

impl<K: TypedResource> TypedClient<K> {
    /// Pair a store client with the controller delivering the same kind
    ///
    /// The namespace is taken from the controller.
    pub fn new(client: Arc<dyn ObjectClient>, controller: TypedController<K>) -> Self {
        Self { client, controller }
    }

    /// Name and place `obj`, ready to be passed to [`TypedClient::create`]
    pub fn new_object(namespace: &str, name: &str, mut obj: K) -> K {
        let meta = obj.meta_mut();
        meta.name = Some(name.to_string());
        meta.namespace = Some(namespace.to_string()).filter(|ns| !ns.is_empty());
        obj
    }

    /// The untyped client underneath
    pub fn object_client(&self) -> &Arc<dyn ObjectClient> {
        &self.client
    }

    /// The controller delivering events for this kind
    pub fn controller(&self) -> &TypedController<K> {
        &self.controller
    }

    /// The namespace of this client, empty for all
    pub fn namespace(&self) -> &str {
        self.controller.namespace()
    }

    fn ns(&self) -> Option<&str> {
        Some(self.namespace()).filter(|ns| !ns.is_empty())
    }

    /// Store a new object, placing it in the client's namespace if it names none
    pub async fn create(&self, obj: &K) -> Result<K> {
        let mut obj = herd_core::kind::encode(obj)?;
        if obj.metadata.namespace.is_none() && self.client.kind().is_namespaced() {
            obj.metadata.namespace = self.ns().map(String::from);
        }
        into_typed(self.client.create(&obj).await?)
    }

    /// Fetch `name` from the client's namespace
    pub async fn get(&self, name: &str) -> Result<K> {
        into_typed(self.client.get(self.ns(), name).await?)
    }

    /// Fetch `name` from `namespace`
    pub async fn get_namespaced(&self, namespace: &str, name: &str) -> Result<K> {
        let key = ObjectKey::from_parts(namespace, name);
        into_typed(self.client.get(key.namespace.as_deref(), name).await?)
    }

    /// Replace an object
    pub async fn update(&self, obj: &K) -> Result<K> {
        into_typed(self.client.update(&herd_core::kind::encode(obj)?).await?)
    }

    /// Apply a JSON patch to the stored copy of `obj`
    pub async fn patch(&self, obj: &K, patch: &json_patch::Patch) -> Result<K> {
        let key = ObjectKey::from_obj(obj);
        into_typed(self.client.patch(key.namespace.as_deref(), &key.name, patch).await?)
    }

    /// Delete `name` from the client's namespace
    pub async fn delete(&self, name: &str) -> Result<()> {
        self.client.delete(self.ns(), name).await
    }

    /// Delete `name` from `namespace`
    pub async fn delete_namespaced(&self, namespace: &str, name: &str) -> Result<()> {
        let key = ObjectKey::from_parts(namespace, name);
        self.client.delete(key.namespace.as_deref(), name).await
    }

    /// Delete every object in the client's namespace matching `selector`
    pub async fn delete_collection(&self, selector: &Selector) -> Result<()> {
        self.client.delete_collection(self.ns(), selector).await
    }

    /// Every stored object in the client's namespace matching `selector`
    pub async fn list(&self, selector: &Selector) -> Result<Vec<K>> {
        self.client
            .list(self.ns(), selector)
            .await?
            .into_iter()
            .map(into_typed)
            .collect()
    }

    /// Every stored object in `namespace` matching `selector`
    pub async fn list_namespaced(&self, namespace: &str, selector: &Selector) -> Result<Vec<K>> {
        let ns = Some(namespace).filter(|ns| !ns.is_empty());
        self.client
            .list(ns, selector)
            .await?
            .into_iter()
            .map(into_typed)
            .collect()
    }

    /// Typed changes to objects in the client's namespace
    pub async fn watch(&self) -> Result<BoxStream<'static, Result<WatchEvent<K>>>> {
        let events = self.client.watch(self.ns()).await?;
        Ok(events
            .map(|event| {
                Ok(match event {
                    WatchEvent::Added(obj) => WatchEvent::Added(into_typed(obj)?),
                    WatchEvent::Modified(obj) => WatchEvent::Modified(into_typed(obj)?),
                    WatchEvent::Deleted(obj) => WatchEvent::Deleted(into_typed(obj)?),
                    WatchEvent::Bookmark(bookmark) => WatchEvent::Bookmark(bookmark),
                    WatchEvent::Error(err) => WatchEvent::Error(err),
                })
            })
            .boxed())
    }

    /// See [`TypedController::add_handler`]
    pub fn add_handler<F, Fut, E>(&self, token: CancellationToken, name: &str, handler: F)
    where
        F: Fn(String, Option<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Option<K>, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.controller.add_handler(token, name, handler);
    }

    /// See [`TypedController::add_feature_handler`]
    pub fn add_feature_handler<F, Fut, E>(
        &self,
        token: CancellationToken,
        enabled: impl Fn() -> bool + Send + Sync + 'static,
        name: &str,
        handler: F,
    ) where
        F: Fn(String, Option<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Option<K>, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.controller.add_feature_handler(token, enabled, name, handler);
    }

    /// See [`TypedController::add_cluster_scoped_handler`]
    pub fn add_cluster_scoped_handler<F, Fut, E>(
        &self,
        token: CancellationToken,
        name: &str,
        cluster: &str,
        handler: F,
    ) where
        F: Fn(String, Option<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Option<K>, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.controller.add_cluster_scoped_handler(token, name, cluster, handler);
    }

    /// See [`TypedController::add_cluster_scoped_feature_handler`]
    pub fn add_cluster_scoped_feature_handler<F, Fut, E>(
        &self,
        token: CancellationToken,
        enabled: impl Fn() -> bool + Send + Sync + 'static,
        name: &str,
        cluster: &str,
        handler: F,
    ) where
        F: Fn(String, Option<K>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Option<K>, E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.controller
            .add_cluster_scoped_feature_handler(token, enabled, name, cluster, handler);
    }

    /// Drive `lifecycle` from every change to an object of this kind
    ///
    /// The finalizer is `controller.cattle.io/<name>`.
    pub fn add_lifecycle<L: Lifecycle<K> + 'static>(&self, token: CancellationToken, name: &str, lifecycle: L) {
        self.register_lifecycle(token, name, None, None, lifecycle);
    }

    /// Like [`TypedClient::add_lifecycle`], skipping events while `enabled` returns false
    pub fn add_feature_lifecycle<L: Lifecycle<K> + 'static>(
        &self,
        token: CancellationToken,
        enabled: impl Fn() -> bool + Send + Sync + 'static,
        name: &str,
        lifecycle: L,
    ) {
        self.register_lifecycle(token, name, Some(Arc::new(enabled)), None, lifecycle);
    }

    /// Drive `lifecycle` for objects belonging to `cluster`
    ///
    /// The finalizer is `clusterscoped.controller.cattle.io/<name>_<cluster>`, so one
    /// process can finalize the same object on behalf of several clusters.
    pub fn add_cluster_scoped_lifecycle<L: Lifecycle<K> + 'static>(
        &self,
        token: CancellationToken,
        name: &str,
        cluster: &str,
        lifecycle: L,
    ) {
        self.register_lifecycle(token, name, None, Some(cluster), lifecycle);
    }

    /// Both gates of [`TypedClient::add_feature_lifecycle`] and
    /// [`TypedClient::add_cluster_scoped_lifecycle`]
    pub fn add_cluster_scoped_feature_lifecycle<L: Lifecycle<K> + 'static>(
        &self,
        token: CancellationToken,
        enabled: impl Fn() -> bool + Send + Sync + 'static,
        name: &str,
        cluster: &str,
        lifecycle: L,
    ) {
        self.register_lifecycle(token, name, Some(Arc::new(enabled)), Some(cluster), lifecycle);
    }

    fn register_lifecycle<L: Lifecycle<K> + 'static>(
        &self,
        token: CancellationToken,
        name: &str,
        enabled: Option<Enabled>,
        cluster: Option<&str>,
        lifecycle: L,
    ) {
        let mut gate = Gate::default();
        if let Some(enabled) = enabled {
            gate = gate.feature(enabled);
        }
        let adapter = match cluster {
            Some(cluster) => {
                gate = gate.cluster(cluster);
                LifecycleAdapter::new(&format!("{name}_{cluster}"), true, self.clone(), lifecycle)
            }
            None => LifecycleAdapter::new(name, false, self.clone(), lifecycle),
        };
        let adapter = Arc::new(adapter);
        self.controller.register(token, name, gate, move |key, obj| {
            let adapter = adapter.clone();
            async move { adapter.sync(&key, obj).await }
        });
    }
}

/// Convert a stored object into `K`, filling in type information left out by the store
fn into_typed<K: TypedResource>(mut obj: DynamicObject) -> Result<K> {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
        });
    }
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}
