//! Finalizer-managed lifecycles
//!
//! A [`Lifecycle`] is told once about each new object (`create`), about every later
//! change (`updated`), and once more when the object is being deleted (`remove`). The
//! [`LifecycleAdapter`] keeps track of which of these is due by leaving a finalizer on the
//! object after `create` succeeds and taking it off after `remove` succeeds.
//!
//! # Expected flow
//!
//! 1. An object is created
//! 2. The adapter sees it without its finalizer and calls `create`
//! 3. The adapter adds its finalizer
//! 4. The object is updated, the adapter calls `updated`
//! 5. The object is deleted, the store only sets its deletion timestamp
//! 6. The adapter calls `remove` and then removes its finalizer
//! 7. The store deletes the object once no finalizers remain
//!
//! Both `create` and `remove` may be called again for the same object, for example when
//! the finalizer patch after them fails, so they must be idempotent.
use crate::{client::TypedClient, error::{BoxError, Error}};
use async_trait::async_trait;
use herd_core::{ResourceExt, TypedResource};
use tracing::{debug, info};

mod state;
pub use state::{
    created_annotation, finalizer_name, LifecycleState, CLUSTER_SCOPED_FINALIZER_PREFIX,
    CREATED_ANNOTATION_PREFIX, FINALIZER_PREFIX,
};

/// Business logic run at the edges of an object's life
///
/// Each callback may return a modified object, which is written back to the store if it
/// differs from the one passed in.
#[async_trait]
pub trait Lifecycle<K: Send + 'static>: Send + Sync {
    /// The error returned by the callbacks
    type Error: std::error::Error + Send + Sync + 'static;

    /// Called for an object this lifecycle has not seen yet
    async fn create(&self, obj: K) -> Result<Option<K>, Self::Error>;

    /// Called once the object is being deleted, before the finalizer is removed
    async fn remove(&self, obj: K) -> Result<Option<K>, Self::Error>;

    /// Called for every change after `create`
    async fn updated(&self, obj: K) -> Result<Option<K>, Self::Error>;

    /// Whether `create` should be called at all
    ///
    /// When false, new objects go straight to `updated` and no finalizer is added.
    fn has_create(&self) -> bool {
        true
    }

    /// Whether deletion should wait for `remove`
    ///
    /// When false, no finalizer is ever added and `remove` is never called. Completion
    /// of `create` is then recorded in an annotation instead.
    fn has_finalize(&self) -> bool {
        true
    }
}

#[derive(Clone, Copy)]
enum Callback {
    Create,
    Updated,
    Remove,
}

/// Turns a [`Lifecycle`] into a handler for [`TypedController`](crate::TypedController)
pub struct LifecycleAdapter<K, L> {
    name: String,
    finalizer: String,
    annotation: String,
    client: TypedClient<K>,
    lifecycle: L,
}

impl<K, L> LifecycleAdapter<K, L>
where
    K: TypedResource,
    L: Lifecycle<K>,
{
    /// An adapter owning the finalizer derived from `name`
    pub fn new(name: &str, cluster_scoped: bool, client: TypedClient<K>, lifecycle: L) -> Self {
        Self {
            name: name.to_string(),
            finalizer: finalizer_name(name, cluster_scoped),
            annotation: created_annotation(name),
            client,
            lifecycle,
        }
    }

    /// The finalizer this adapter adds and removes
    pub fn finalizer(&self) -> &str {
        &self.finalizer
    }

    /// Where `obj` stands with respect to this adapter
    pub fn state(&self, obj: &K) -> LifecycleState {
        let is_deleting = obj.meta().deletion_timestamp.is_some();
        if is_deleting && !self.lifecycle.has_finalize() {
            return LifecycleState::Finalized;
        }
        LifecycleState::derive(is_deleting, self.has_marker(obj))
    }

    fn has_marker(&self, obj: &K) -> bool {
        if self.lifecycle.has_finalize() {
            obj.finalizers().iter().any(|f| *f == self.finalizer)
        } else {
            obj.annotations().get(&self.annotation).is_some_and(|v| v == "true")
        }
    }

    /// Run whichever callback is due for `obj`
    ///
    /// Returns the object as last written, or `None` when nothing was due.
    pub async fn sync(&self, key: &str, obj: Option<K>) -> Result<Option<K>, Error> {
        let Some(obj) = obj else {
            return Ok(None);
        };
        let state = self.state(&obj);
        debug!(lifecycle = %self.name, %key, ?state, "syncing");
        match state {
            LifecycleState::New if !self.lifecycle.has_create() => {
                self.record(key, Callback::Updated, obj).await.map(Some)
            }
            LifecycleState::New => {
                let obj = self.record(key, Callback::Create, obj).await?;
                let obj = self.mark(key, obj).await?;
                info!(lifecycle = %self.name, %key, "created");
                Ok(Some(obj))
            }
            LifecycleState::Active => self.record(key, Callback::Updated, obj).await.map(Some),
            LifecycleState::Deleting => {
                let obj = self.record(key, Callback::Remove, obj).await?;
                let obj = self.unmark(key, obj).await?;
                info!(lifecycle = %self.name, %key, "finalized");
                Ok(Some(obj))
            }
            LifecycleState::Finalized => Ok(None),
        }
    }

    /// Call the business callback and persist what it changed
    async fn record(&self, key: &str, callback: Callback, obj: K) -> Result<K, Error> {
        let result = match callback {
            Callback::Create => self.lifecycle.create(obj.clone()).await,
            Callback::Updated => self.lifecycle.updated(obj.clone()).await,
            Callback::Remove => self.lifecycle.remove(obj.clone()).await,
        };
        let returned = result.map_err(|err| self.callback_error(key, callback, Box::new(err)))?;
        match returned {
            Some(changed) if differs(&obj, &changed)? => {
                debug!(lifecycle = %self.name, %key, "persisting changes");
                Ok(self.client.update(&changed).await?)
            }
            Some(unchanged) => Ok(unchanged),
            None => Ok(obj),
        }
    }

    /// Record that `create` completed
    async fn mark(&self, key: &str, obj: K) -> Result<K, Error> {
        let (marker, patch) = if self.lifecycle.has_finalize() {
            (&self.finalizer, state::add_finalizer(obj.meta(), &self.finalizer))
        } else {
            (&self.annotation, state::add_annotation(obj.meta(), &self.annotation))
        };
        let add_failed = |source: herd_core::Error| Error::AddFinalizer {
            finalizer: marker.clone(),
            key: key.to_string(),
            source,
        };
        let patch = patch.map_err(|err| add_failed(err.into()))?;
        debug!(lifecycle = %self.name, %key, %marker, "adding marker");
        self.client.patch(&obj, &patch).await.map_err(add_failed)
    }

    /// Take the finalizer off after `remove` completed
    async fn unmark(&self, key: &str, obj: K) -> Result<K, Error> {
        let Some(index) = obj.finalizers().iter().position(|f| *f == self.finalizer) else {
            return Ok(obj);
        };
        let remove_failed = |source: herd_core::Error| Error::RemoveFinalizer {
            finalizer: self.finalizer.clone(),
            key: key.to_string(),
            source,
        };
        let patch = state::remove_finalizer(index, &self.finalizer).map_err(|err| remove_failed(err.into()))?;
        debug!(lifecycle = %self.name, %key, finalizer = %self.finalizer, "removing finalizer");
        self.client.patch(&obj, &patch).await.map_err(remove_failed)
    }

    fn callback_error(&self, key: &str, callback: Callback, source: BoxError) -> Error {
        let name = self.name.clone();
        let key = key.to_string();
        match callback {
            Callback::Create => Error::CreateFailed { name, key, source },
            Callback::Updated => Error::UpdatedFailed { name, key, source },
            Callback::Remove => Error::RemoveFailed { name, key, source },
        }
    }
}

fn differs<K: serde::Serialize>(before: &K, after: &K) -> Result<bool, Error> {
    let as_value = |obj: &K| serde_json::to_value(obj).map_err(herd_core::Error::from);
    Ok(as_value(before)? != as_value(after)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::ObjectClient, memory::MemoryStore, shared::SharedController, TypedController,
    };
    use futures::stream::BoxStream;
    use herd_core::{DynamicObject, KindInfo, Scope, Selector};
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube_core::WatchEvent;
    use parking_lot::Mutex;
    use std::{
        collections::BTreeMap,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
    };

    #[derive(Debug, thiserror::Error)]
    #[error("remove is not ready")]
    struct NotReady;

    #[derive(Default)]
    struct Recorder {
        calls: Arc<Mutex<Vec<&'static str>>>,
        fail_remove: Arc<AtomicBool>,
        no_create: bool,
        no_finalize: bool,
        label_on_create: bool,
    }

    #[async_trait]
    impl Lifecycle<ConfigMap> for Recorder {
        type Error = NotReady;

        async fn create(&self, mut obj: ConfigMap) -> Result<Option<ConfigMap>, NotReady> {
            self.calls.lock().push("create");
            if self.label_on_create {
                obj.labels_mut().insert("created".into(), "yes".into());
            }
            Ok(Some(obj))
        }

        async fn remove(&self, _obj: ConfigMap) -> Result<Option<ConfigMap>, NotReady> {
            self.calls.lock().push("remove");
            if self.fail_remove.load(Ordering::SeqCst) {
                return Err(NotReady);
            }
            Ok(None)
        }

        async fn updated(&self, obj: ConfigMap) -> Result<Option<ConfigMap>, NotReady> {
            self.calls.lock().push("updated");
            Ok(Some(obj))
        }

        fn has_create(&self) -> bool {
            !self.no_create
        }

        fn has_finalize(&self) -> bool {
            !self.no_finalize
        }
    }

    /// Delegates to a store, optionally failing every patch
    struct FlakyPatches {
        store: Arc<MemoryStore>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl ObjectClient for FlakyPatches {
        fn kind(&self) -> &KindInfo {
            self.store.kind()
        }

        async fn create(&self, obj: &DynamicObject) -> herd_core::Result<DynamicObject> {
            self.store.create(obj).await
        }

        async fn get(&self, namespace: Option<&str>, name: &str) -> herd_core::Result<DynamicObject> {
            self.store.get(namespace, name).await
        }

        async fn update(&self, obj: &DynamicObject) -> herd_core::Result<DynamicObject> {
            self.store.update(obj).await
        }

        async fn patch(
            &self,
            namespace: Option<&str>,
            name: &str,
            patch: &json_patch::Patch,
        ) -> herd_core::Result<DynamicObject> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(herd_core::Error::Api {
                    code: 409,
                    reason: "Conflict".into(),
                    message: "the object has been modified".into(),
                });
            }
            self.store.patch(namespace, name, patch).await
        }

        async fn delete(&self, namespace: Option<&str>, name: &str) -> herd_core::Result<()> {
            self.store.delete(namespace, name).await
        }

        async fn delete_collection(&self, namespace: Option<&str>, selector: &Selector) -> herd_core::Result<()> {
            self.store.delete_collection(namespace, selector).await
        }

        async fn list(&self, namespace: Option<&str>, selector: &Selector) -> herd_core::Result<Vec<DynamicObject>> {
            self.store.list(namespace, selector).await
        }

        async fn watch(
            &self,
            namespace: Option<&str>,
        ) -> herd_core::Result<BoxStream<'static, WatchEvent<DynamicObject>>> {
            self.store.watch(namespace).await
        }
    }

    fn kind() -> KindInfo {
        KindInfo::of::<ConfigMap>(Scope::Namespaced)
    }

    fn typed_client(store: Arc<dyn ObjectClient>) -> TypedClient<ConfigMap> {
        TypedClient::new(store, TypedController::new(SharedController::new(kind()), "ns1"))
    }

    fn adapter(lifecycle: Recorder) -> (LifecycleAdapter<ConfigMap, Recorder>, TypedClient<ConfigMap>) {
        let client = typed_client(MemoryStore::new(kind()));
        (LifecycleAdapter::new("registrationA", false, client.clone(), lifecycle), client)
    }

    async fn create_foo(client: &TypedClient<ConfigMap>, finalizers: &[&str]) -> ConfigMap {
        let mut cm = TypedClient::new_object("ns1", "foo", ConfigMap::default());
        if !finalizers.is_empty() {
            cm.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
        }
        client.create(&cm).await.unwrap()
    }

    #[tokio::test]
    async fn create_adds_the_finalizer() {
        let lifecycle = Recorder::default();
        let calls = lifecycle.calls.clone();
        let (adapter, client) = adapter(lifecycle);
        let cm = create_foo(&client, &[]).await;
        assert_eq!(adapter.state(&cm), LifecycleState::New);

        adapter.sync("ns1/foo", Some(cm)).await.unwrap();

        assert_eq!(*calls.lock(), vec!["create"]);
        let stored = client.get("foo").await.unwrap();
        assert_eq!(stored.finalizers(), ["controller.cattle.io/registrationA"]);
        assert_eq!(adapter.state(&stored), LifecycleState::Active);
    }

    #[tokio::test]
    async fn updates_go_to_updated_without_patching() {
        let lifecycle = Recorder::default();
        let calls = lifecycle.calls.clone();
        let (adapter, client) = adapter(lifecycle);
        let cm = create_foo(&client, &[]).await;
        adapter.sync("ns1/foo", Some(cm)).await.unwrap();

        let mut cm = client.get("foo").await.unwrap();
        cm.data = Some(BTreeMap::from([("spec".to_string(), "changed".to_string())]));
        let cm = client.update(&cm).await.unwrap();
        let version = cm.resource_version();

        adapter.sync("ns1/foo", Some(cm)).await.unwrap();

        assert_eq!(*calls.lock(), vec!["create", "updated"]);
        let stored = client.get("foo").await.unwrap();
        assert_eq!(stored.resource_version(), version);
        assert_eq!(stored.finalizers().len(), 1);
    }

    #[tokio::test]
    async fn delete_runs_remove_then_releases_the_object() {
        let lifecycle = Recorder::default();
        let calls = lifecycle.calls.clone();
        let (adapter, client) = adapter(lifecycle);
        let cm = create_foo(&client, &[]).await;
        adapter.sync("ns1/foo", Some(cm)).await.unwrap();

        client.delete("foo").await.unwrap();
        let deleting = client.get("foo").await.unwrap();
        assert_eq!(adapter.state(&deleting), LifecycleState::Deleting);

        adapter.sync("ns1/foo", Some(deleting)).await.unwrap();
        assert_eq!(*calls.lock(), vec!["create", "remove"]);
        assert!(client.get("foo").await.unwrap_err().is_not_found());

        assert!(adapter.sync("ns1/foo", None).await.unwrap().is_none());
        assert_eq!(calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn failed_remove_keeps_the_finalizer_and_is_retried() {
        let lifecycle = Recorder::default();
        let calls = lifecycle.calls.clone();
        let fail_remove = lifecycle.fail_remove.clone();
        let (adapter, client) = adapter(lifecycle);
        let cm = create_foo(&client, &[]).await;
        adapter.sync("ns1/foo", Some(cm)).await.unwrap();
        client.delete("foo").await.unwrap();

        fail_remove.store(true, Ordering::SeqCst);
        let deleting = client.get("foo").await.unwrap();
        let err = adapter.sync("ns1/foo", Some(deleting)).await.unwrap_err();
        assert!(matches!(err, Error::RemoveFailed { .. }));

        let stuck = client.get("foo").await.unwrap();
        assert_eq!(adapter.state(&stuck), LifecycleState::Deleting);
        assert!(adapter.sync("ns1/foo", Some(stuck.clone())).await.is_err());
        assert_eq!(*calls.lock(), vec!["create", "remove", "remove"]);

        fail_remove.store(false, Ordering::SeqCst);
        adapter.sync("ns1/foo", Some(stuck)).await.unwrap();
        assert!(client.get("foo").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn create_is_replayed_when_the_finalizer_patch_fails() {
        let store = MemoryStore::new(kind());
        let flaky = Arc::new(FlakyPatches {
            store,
            fail: AtomicBool::new(true),
        });
        let client = typed_client(flaky.clone());
        let lifecycle = Recorder::default();
        let calls = lifecycle.calls.clone();
        let adapter = LifecycleAdapter::new("registrationA", false, client.clone(), lifecycle);
        let cm = create_foo(&client, &[]).await;

        let err = adapter.sync("ns1/foo", Some(cm)).await.unwrap_err();
        assert!(matches!(err, Error::AddFinalizer { .. }));
        assert!(err.store_error().is_some_and(herd_core::Error::is_conflict));
        let stored = client.get("foo").await.unwrap();
        assert_eq!(adapter.state(&stored), LifecycleState::New);

        flaky.fail.store(false, Ordering::SeqCst);
        adapter.sync("ns1/foo", Some(stored)).await.unwrap();
        assert_eq!(*calls.lock(), vec!["create", "create"]);
        let stored = client.get("foo").await.unwrap();
        assert_eq!(stored.finalizers(), ["controller.cattle.io/registrationA"]);
    }

    #[tokio::test]
    async fn lifecycle_without_finalize_never_blocks_deletion() {
        let lifecycle = Recorder {
            no_finalize: true,
            ..Recorder::default()
        };
        let calls = lifecycle.calls.clone();
        let (adapter, client) = adapter(lifecycle);
        // another controller's finalizer keeps the object around after delete
        let cm = create_foo(&client, &["other"]).await;

        adapter.sync("ns1/foo", Some(cm)).await.unwrap();
        let stored = client.get("foo").await.unwrap();
        assert_eq!(stored.finalizers(), ["other"]);
        assert_eq!(stored.annotations()["lifecycle.cattle.io/create.registrationA"], "true");

        adapter.sync("ns1/foo", Some(stored)).await.unwrap();
        assert_eq!(*calls.lock(), vec!["create", "updated"]);

        client.delete("foo").await.unwrap();
        let deleting = client.get("foo").await.unwrap();
        assert_eq!(adapter.state(&deleting), LifecycleState::Finalized);
        assert!(adapter.sync("ns1/foo", Some(deleting)).await.unwrap().is_none());
        assert_eq!(*calls.lock(), vec!["create", "updated"]);
    }

    #[tokio::test]
    async fn objects_first_seen_while_deleting_are_left_alone() {
        let lifecycle = Recorder::default();
        let calls = lifecycle.calls.clone();
        let (adapter, client) = adapter(lifecycle);
        create_foo(&client, &["other"]).await;
        client.delete("foo").await.unwrap();

        let deleting = client.get("foo").await.unwrap();
        let version = deleting.resource_version();
        assert_eq!(adapter.state(&deleting), LifecycleState::Finalized);
        assert!(adapter.sync("ns1/foo", Some(deleting)).await.unwrap().is_none());

        assert!(calls.lock().is_empty());
        let stored = client.get("foo").await.unwrap();
        assert_eq!(stored.finalizers(), ["other"]);
        assert_eq!(stored.resource_version(), version);
    }

    #[tokio::test]
    async fn lifecycle_without_create_only_sees_updates() {
        let lifecycle = Recorder {
            no_create: true,
            ..Recorder::default()
        };
        let calls = lifecycle.calls.clone();
        let (adapter, client) = adapter(lifecycle);
        let cm = create_foo(&client, &[]).await;

        adapter.sync("ns1/foo", Some(cm)).await.unwrap();
        adapter.sync("ns1/foo", Some(client.get("foo").await.unwrap())).await.unwrap();

        assert_eq!(*calls.lock(), vec!["updated", "updated"]);
        assert!(client.get("foo").await.unwrap().finalizers().is_empty());
    }

    #[tokio::test]
    async fn changes_returned_by_create_are_persisted() {
        let lifecycle = Recorder {
            label_on_create: true,
            ..Recorder::default()
        };
        let (adapter, client) = adapter(lifecycle);
        let cm = create_foo(&client, &[]).await;

        let synced = adapter.sync("ns1/foo", Some(cm)).await.unwrap().unwrap();
        let stored = client.get("foo").await.unwrap();
        assert_eq!(stored.labels()["created"], "yes");
        assert_eq!(stored.finalizers(), ["controller.cattle.io/registrationA"]);
        assert_eq!(synced.resource_version(), stored.resource_version());
    }

    #[test]
    fn cluster_scoped_adapters_use_their_own_finalizer() {
        let client = typed_client(MemoryStore::new(kind()));
        let adapter = LifecycleAdapter::new("registrationA_c-1", true, client, Recorder::default());
        assert_eq!(
            adapter.finalizer(),
            "clusterscoped.controller.cattle.io/registrationA_c-1"
        );
    }
}
