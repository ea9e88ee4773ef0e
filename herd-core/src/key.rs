//! Cache keys for objects
use kube_core::{Resource, ResourceExt};
use std::fmt::{self, Display};

/// The `namespace/name` key an object is cached and queued under
///
/// Cluster-scoped objects are keyed by their bare name.
///
/// ```
/// use herd_core::ObjectKey;
/// assert_eq!(ObjectKey::new("foo").within("ns1").to_string(), "ns1/foo");
/// assert_eq!(ObjectKey::parse("ns1/foo"), ObjectKey::new("foo").within("ns1"));
/// assert_eq!(ObjectKey::parse("foo").namespace, None);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// The namespace of the object, `None` for cluster-scoped objects
    pub namespace: Option<String>,
    /// The name of the object
    pub name: String,
}

impl ObjectKey {
    /// A key for a cluster-scoped object
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Place the key inside a namespace
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Build a key from a namespace that may be empty
    ///
    /// An empty namespace means the object is cluster-scoped.
    #[must_use]
    pub fn from_parts(namespace: &str, name: &str) -> Self {
        let key = Self::new(name);
        if namespace.is_empty() {
            key
        } else {
            key.within(namespace)
        }
    }

    /// The key of an object, using `generateName` if it has no name yet
    #[must_use]
    pub fn from_obj<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.meta().namespace.clone().filter(|ns| !ns.is_empty()),
            name: obj.name_any(),
        }
    }

    /// Split a queue key back into namespace and name
    #[must_use]
    pub fn parse(key: &str) -> Self {
        match key.split_once('/') {
            Some((namespace, name)) => Self::from_parts(namespace, name),
            None => Self::new(key),
        }
    }

    /// The namespace, or `""` for cluster-scoped objects
    pub fn namespace_or_empty(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(namespace) = &self.namespace {
            write!(f, "{namespace}/")?;
        }
        write!(f, "{}", self.name)
    }
}

impl From<&str> for ObjectKey {
    fn from(key: &str) -> Self {
        Self::parse(key)
    }
}
