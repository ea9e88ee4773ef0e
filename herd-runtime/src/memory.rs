//! An object store kept in process memory
//!
//! Behaves like the API server where controllers can observe the difference: resource
//! versions change on every write, stale writes conflict, and deleting an object that
//! still has finalizers only marks it for deletion.
use crate::client::ObjectClient;
use async_broadcast::{InactiveReceiver, Sender};
use async_trait::async_trait;
use futures::{future, stream::BoxStream, StreamExt};
use herd_core::{DynamicObject, Error, KindInfo, ObjectKey, Result, Selector};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube_core::{SelectorExt, WatchEvent};
use parking_lot::Mutex;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::trace;

const EVENT_BUFFER: usize = 1024;

type Objects = BTreeMap<ObjectKey, DynamicObject>;

/// An [`ObjectClient`] over a map in memory, serving one kind
pub struct MemoryStore {
    kind: KindInfo,
    objects: Mutex<Objects>,
    counter: AtomicU64,
    events: Sender<WatchEvent<DynamicObject>>,
    // keeps the channel open while nobody watches
    _events_rx: InactiveReceiver<WatchEvent<DynamicObject>>,
}

impl MemoryStore {
    /// An empty store for `kind`
    pub fn new(kind: KindInfo) -> Arc<Self> {
        let (mut events, rx) = async_broadcast::broadcast(EVENT_BUFFER);
        events.set_overflow(true);
        events.set_await_active(false);
        Arc::new(Self {
            kind,
            objects: Mutex::default(),
            counter: AtomicU64::new(0),
            events,
            _events_rx: rx.deactivate(),
        })
    }

    fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn key(&self, namespace: Option<&str>, name: &str) -> ObjectKey {
        match namespace.filter(|ns| !ns.is_empty() && self.kind.is_namespaced()) {
            Some(ns) => ObjectKey::new(name).within(ns),
            None => ObjectKey::new(name),
        }
    }

    fn not_found(&self, key: &ObjectKey) -> Error {
        self.kind.not_found(&key.to_string()).into()
    }

    fn emit(&self, event: WatchEvent<DynamicObject>) {
        // only fails when nobody listens
        let _ = self.events.try_broadcast(event);
    }

    /// Write `obj` under `key`, completing the deletion of a finalized object
    fn commit(&self, objects: &mut Objects, key: ObjectKey, mut obj: DynamicObject) -> DynamicObject {
        obj.metadata.resource_version = Some(self.next().to_string());
        let finalized = obj.metadata.deletion_timestamp.is_some()
            && obj.metadata.finalizers.as_ref().is_none_or(Vec::is_empty);
        if finalized {
            trace!(%key, "deleting finalized object");
            objects.remove(&key);
            self.emit(WatchEvent::Deleted(obj.clone()));
        } else {
            objects.insert(key, obj.clone());
            self.emit(WatchEvent::Modified(obj.clone()));
        }
        obj
    }

    /// Carry the fields a client may not change over from the stored copy
    fn preserve(&self, stored: &DynamicObject, obj: &mut DynamicObject) {
        obj.types = stored.types.clone();
        obj.metadata.name = stored.metadata.name.clone();
        obj.metadata.namespace = stored.metadata.namespace.clone();
        obj.metadata.uid = stored.metadata.uid.clone();
        obj.metadata.creation_timestamp = stored.metadata.creation_timestamp.clone();
        obj.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
    }

    fn delete_locked(&self, objects: &mut Objects, key: ObjectKey) -> Result<()> {
        let stored = objects.get(&key).ok_or_else(|| self.not_found(&key))?;
        if stored.metadata.finalizers.as_ref().is_some_and(|f| !f.is_empty()) {
            if stored.metadata.deletion_timestamp.is_none() {
                let mut marked = stored.clone();
                marked.metadata.deletion_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
                self.commit(objects, key, marked);
            }
            return Ok(());
        }
        if let Some(obj) = objects.remove(&key) {
            self.emit(WatchEvent::Deleted(obj));
        }
        Ok(())
    }

    fn selected(&self, objects: &Objects, namespace: Option<&str>, selector: &Selector) -> Vec<ObjectKey> {
        let no_labels = BTreeMap::new();
        objects
            .iter()
            .filter(|(key, _)| namespace.is_none_or(|ns| key.namespace.as_deref() == Some(ns)))
            .filter(|(_, obj)| selector.matches(obj.metadata.labels.as_ref().unwrap_or(&no_labels)))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

#[async_trait]
impl ObjectClient for MemoryStore {
    fn kind(&self) -> &KindInfo {
        &self.kind
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let mut obj = obj.clone();
        let serial = self.next();
        if obj.metadata.name.is_none() {
            let prefix = obj.metadata.generate_name.as_deref().ok_or(Error::UnnamedObject)?;
            obj.metadata.name = Some(format!("{prefix}{serial:05x}"));
        }
        let key = ObjectKey::from_obj(&obj);
        let key = self.key(key.namespace.as_deref(), &key.name);
        let mut objects = self.objects.lock();
        if objects.contains_key(&key) {
            return Err(Error::AlreadyExists {
                resource: self.kind.group_resource(),
                key: key.to_string(),
            });
        }
        self.kind.stamp(&mut obj);
        obj.metadata.namespace = key.namespace.clone();
        obj.metadata.uid = Some(format!("{serial:08x}-0000-4000-8000-{serial:012x}"));
        obj.metadata.creation_timestamp = Some(Time(k8s_openapi::chrono::Utc::now()));
        obj.metadata.deletion_timestamp = None;
        obj.metadata.resource_version = Some(self.next().to_string());
        objects.insert(key, obj.clone());
        self.emit(WatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<DynamicObject> {
        let key = self.key(namespace, name);
        self.objects
            .lock()
            .get(&key)
            .cloned()
            .ok_or_else(|| self.not_found(&key))
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::from_obj(obj);
        let key = self.key(key.namespace.as_deref(), &key.name);
        let mut objects = self.objects.lock();
        let stored = objects.get(&key).ok_or_else(|| self.not_found(&key))?;
        if obj
            .metadata
            .resource_version
            .as_ref()
            .is_some_and(|rv| Some(rv) != stored.metadata.resource_version.as_ref())
        {
            return Err(Error::Conflict {
                resource: self.kind.group_resource(),
                key: key.to_string(),
                message: "the object has been modified; please apply your changes to the latest version and try again".into(),
            });
        }
        let mut updated = obj.clone();
        self.preserve(stored, &mut updated);
        Ok(self.commit(&mut objects, key, updated))
    }

    async fn patch(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<DynamicObject> {
        let key = self.key(namespace, name);
        let mut objects = self.objects.lock();
        let stored = objects.get(&key).ok_or_else(|| self.not_found(&key))?;
        let mut doc = serde_json::to_value(stored)?;
        json_patch::patch(&mut doc, &patch.0)?;
        let mut patched: DynamicObject = serde_json::from_value(doc)?;
        self.preserve(stored, &mut patched);
        Ok(self.commit(&mut objects, key, patched))
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        let key = self.key(namespace, name);
        self.delete_locked(&mut self.objects.lock(), key)
    }

    async fn delete_collection(&self, namespace: Option<&str>, selector: &Selector) -> Result<()> {
        let mut objects = self.objects.lock();
        for key in self.selected(&objects, namespace, selector) {
            self.delete_locked(&mut objects, key)?;
        }
        Ok(())
    }

    async fn list(&self, namespace: Option<&str>, selector: &Selector) -> Result<Vec<DynamicObject>> {
        let objects = self.objects.lock();
        Ok(self
            .selected(&objects, namespace, selector)
            .iter()
            .filter_map(|key| objects.get(key).cloned())
            .collect())
    }

    async fn watch(&self, namespace: Option<&str>) -> Result<BoxStream<'static, WatchEvent<DynamicObject>>> {
        let namespace = namespace.map(String::from);
        Ok(self
            .events
            .new_receiver()
            .filter(move |event| {
                let wanted = match (&namespace, event) {
                    (None, _) => true,
                    (Some(ns), WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj)) => {
                        obj.metadata.namespace.as_ref() == Some(ns)
                    }
                    (Some(_), _) => true,
                };
                future::ready(wanted)
            })
            .boxed())
    }
}
