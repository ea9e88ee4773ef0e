//! The local object cache shared by every handler of one kind
use ahash::AHashMap;
use herd_core::{DynamicObject, ObjectKey, Selector};
use kube_core::{SelectorExt, WatchEvent};
use parking_lot::RwLock;
use std::{collections::BTreeMap, sync::Arc};

type Cache = Arc<RwLock<AHashMap<ObjectKey, Arc<DynamicObject>>>>;

/// A cache of untyped objects keyed by `namespace/name`
///
/// Cloning produces a new handle to the same backing cache. The cache is written by
/// the event source feeding a controller and only read by handlers and listers.
///
/// Note that this is a cache and may be stale. Deleted objects may still be present and
/// new ones may not have arrived yet.
#[derive(Clone, Debug, Default)]
pub struct Indexer {
    store: Cache,
}

impl Indexer {
    /// An empty cache
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Retrieve the entry cached under a queue key such as `ns1/foo`
    #[must_use]
    pub fn get_by_key(&self, key: &str) -> Option<Arc<DynamicObject>> {
        self.get(&ObjectKey::parse(key))
    }

    /// Retrieve the entry referred to by `key`
    #[must_use]
    pub fn get(&self, key: &ObjectKey) -> Option<Arc<DynamicObject>> {
        self.store.read().get(key).cloned()
    }

    /// All entries in `namespace` whose labels match `selector`
    ///
    /// An empty namespace lists every namespace.
    #[must_use]
    pub fn list(&self, namespace: &str, selector: &Selector) -> Vec<Arc<DynamicObject>> {
        let no_labels = BTreeMap::new();
        self.store
            .read()
            .iter()
            .filter(|(key, _)| namespace.is_empty() || key.namespace.as_deref() == Some(namespace))
            .filter(|(_, obj)| selector.matches(obj.metadata.labels.as_ref().unwrap_or(&no_labels)))
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    /// Every cached entry
    #[must_use]
    pub fn state(&self) -> Vec<Arc<DynamicObject>> {
        self.store.read().values().cloned().collect()
    }

    /// Every cached key, rendered as queue keys
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.store.read().keys().map(ToString::to_string).collect()
    }

    /// The number of cached entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }

    /// Insert or replace an object, returning its queue key
    pub fn apply(&self, obj: DynamicObject) -> String {
        let key = ObjectKey::from_obj(&obj);
        let rendered = key.to_string();
        self.store.write().insert(key, Arc::new(obj));
        rendered
    }

    /// Drop the entry for an object, returning its queue key
    pub fn delete(&self, obj: &DynamicObject) -> String {
        let key = ObjectKey::from_obj(obj);
        let rendered = key.to_string();
        self.store.write().remove(&key);
        rendered
    }

    /// Replace the whole cache after a relist
    ///
    /// Returns the keys of cached entries missing from `objs`, followed by the key of every
    /// object in `objs` whether it changed or not.
    pub fn replace(&self, objs: Vec<DynamicObject>) -> Vec<String> {
        let new_objs = objs
            .into_iter()
            .map(|obj| (ObjectKey::from_obj(&obj), Arc::new(obj)))
            .collect::<AHashMap<_, _>>();
        let mut store = self.store.write();
        let mut touched = store
            .keys()
            .filter(|key| !new_objs.contains_key(*key))
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        touched.extend(new_objs.keys().map(ToString::to_string));
        *store = new_objs;
        touched
    }

    /// Apply a single watch event, returning the key it touched
    pub fn apply_watch_event(&self, event: &WatchEvent<DynamicObject>) -> Option<String> {
        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => Some(self.apply(obj.clone())),
            WatchEvent::Deleted(obj) => Some(self.delete(obj)),
            WatchEvent::Bookmark(_) | WatchEvent::Error(_) => None,
        }
    }
}
