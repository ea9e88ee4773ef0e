//! Typed reads against the shared cache
use crate::indexer::Indexer;
use herd_core::{kind, NotFound, ObjectKey, Selector, TypedResource};
use std::marker::PhantomData;
use tracing::debug;

/// A read-only, typed view of an [`Indexer`]
///
/// Reads never reach the object store, so results are as fresh as the cache.
pub struct Lister<K> {
    namespace: String,
    indexer: Indexer,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for Lister<K> {
    fn clone(&self) -> Self {
        Self {
            namespace: self.namespace.clone(),
            indexer: self.indexer.clone(),
            _kind: PhantomData,
        }
    }
}

impl<K: TypedResource> Lister<K> {
    /// A lister over `indexer` defaulting to `namespace`, empty for all namespaces
    pub fn new(namespace: &str, indexer: Indexer) -> Self {
        Self {
            namespace: namespace.to_string(),
            indexer,
            _kind: PhantomData,
        }
    }

    /// Fetch the cached object `namespace`/`name`
    ///
    /// An empty namespace looks up a cluster-scoped object.
    pub fn get(&self, namespace: &str, name: &str) -> herd_core::Result<K> {
        let key = ObjectKey::from_parts(namespace, name);
        let not_found = || NotFound {
            group: K::group(&()).into_owned(),
            resource: K::plural(&()).into_owned(),
            name: key.to_string(),
        };
        let obj = self.indexer.get(&key).ok_or_else(not_found)?;
        match kind::decode::<K>(&obj) {
            Some(decoded) => decoded,
            None => Err(not_found().into()),
        }
    }

    /// All cached objects in `namespace` matching `selector`
    ///
    /// An empty namespace falls back to the lister's own namespace, and lists everything
    /// when that is empty too.
    pub fn list(&self, namespace: &str, selector: &Selector) -> herd_core::Result<Vec<K>> {
        let namespace = if namespace.is_empty() {
            &self.namespace
        } else {
            namespace
        };
        let mut objs = Vec::new();
        for obj in self.indexer.list(namespace, selector) {
            match kind::decode::<K>(&obj) {
                Some(decoded) => objs.push(decoded?),
                None => debug!(key = %ObjectKey::from_obj(&*obj), "skipping cached object of foreign kind"),
            }
        }
        Ok(objs)
    }
}
