//! Kind identity for objects travelling through untyped queues
//!
//! Shared event sources hand out [`DynamicObject`]s. The helpers here decide whether
//! such an object is of a given compile-time kind and convert between the two forms.
//! [`KindRegistry`] is the explicit list of kinds a process works with.
use crate::{error::NotFound, Error, Result};
use kube_core::{
    discovery::{ApiResource, Scope},
    gvk::GroupVersion,
    metadata::TypeMeta,
    DynamicObject, GroupVersionKind, Resource,
};
use serde::{de::DeserializeOwned, Serialize};
use std::{collections::HashMap, fmt::Debug};

/// A statically known kind that can be moved in and out of a [`DynamicObject`]
///
/// Implemented for every type that satisfies the bounds, such as the k8s-openapi types
/// and types generated by `#[derive(CustomResource)]`.
pub trait TypedResource:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> TypedResource for K where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Whether `obj` declares the apiVersion and kind of `K`
pub fn is_kind<K: Resource<DynamicType = ()>>(obj: &DynamicObject) -> bool {
    obj.types
        .as_ref()
        .is_some_and(|t| t.api_version == K::api_version(&()) && t.kind == K::kind(&()))
}

/// Convert `obj` into `K`
///
/// Returns `None` when `obj` is of another kind. A matching object that does not
/// deserialize is an error.
pub fn decode<K: TypedResource>(obj: &DynamicObject) -> Option<Result<K>> {
    if !is_kind::<K>(obj) {
        return None;
    }
    Some(
        serde_json::to_value(obj)
            .and_then(serde_json::from_value)
            .map_err(Error::from),
    )
}

/// Convert a typed object into its untyped form
pub fn encode<K: Serialize>(obj: &K) -> Result<DynamicObject> {
    Ok(serde_json::from_value(serde_json::to_value(obj)?)?)
}

/// The apiVersion and kind an object declares, when it declares both
pub fn declared_kind(obj: &DynamicObject) -> Option<GroupVersionKind> {
    let types = obj.types.as_ref()?;
    let gv: GroupVersion = types.api_version.parse().ok()?;
    Some(GroupVersionKind::gvk(&gv.group, &gv.version, &types.kind))
}

/// Everything a controller needs to know about one kind
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KindInfo {
    /// Group, version, kind and plural name
    pub resource: ApiResource,
    /// Whether objects live inside namespaces
    pub scope: Scope,
}

impl KindInfo {
    /// Describe a statically known kind
    pub fn of<K: Resource<DynamicType = ()>>(scope: Scope) -> Self {
        Self {
            resource: ApiResource::erase::<K>(&()),
            scope,
        }
    }

    /// The group, version and kind
    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind::gvk(&self.resource.group, &self.resource.version, &self.resource.kind)
    }

    /// Whether objects of this kind live inside namespaces
    pub fn is_namespaced(&self) -> bool {
        self.scope == Scope::Namespaced
    }

    /// The `plural.group` form used in messages
    pub fn group_resource(&self) -> String {
        self.not_found("").group_resource()
    }

    /// A not found error for `key` carrying this kind's group and resource
    pub fn not_found(&self, key: &str) -> NotFound {
        NotFound {
            group: self.resource.group.clone(),
            resource: self.resource.plural.clone(),
            name: key.to_string(),
        }
    }

    /// Whether `obj` declares this kind
    pub fn matches(&self, obj: &DynamicObject) -> bool {
        obj.types
            .as_ref()
            .is_some_and(|t| t.api_version == self.resource.api_version && t.kind == self.resource.kind)
    }

    /// Set apiVersion and kind on an object that arrived without them
    ///
    /// List responses leave these out of their items.
    pub fn stamp(&self, obj: &mut DynamicObject) {
        if obj.types.is_none() {
            obj.types = Some(TypeMeta {
                api_version: self.resource.api_version.clone(),
                kind: self.resource.kind.clone(),
            });
        }
    }
}

/// The kinds a process serves, built once at startup and passed to whatever needs it
///
/// ```
/// use herd_core::{KindRegistry, Scope};
/// use k8s_openapi::api::core::v1::ConfigMap;
///
/// let registry = KindRegistry::new().with::<ConfigMap>(Scope::Namespaced);
/// assert_eq!(registry.lookup::<ConfigMap>().unwrap().resource.plural, "configmaps");
/// ```
#[derive(Clone, Debug, Default)]
pub struct KindRegistry {
    kinds: HashMap<GroupVersionKind, KindInfo>,
}

impl KindRegistry {
    /// An empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a statically known kind, builder style
    #[must_use]
    pub fn with<K: Resource<DynamicType = ()>>(mut self, scope: Scope) -> Self {
        self.register::<K>(scope);
        self
    }

    /// Register a statically known kind
    pub fn register<K: Resource<DynamicType = ()>>(&mut self, scope: Scope) -> &KindInfo {
        self.register_info(KindInfo::of::<K>(scope))
    }

    /// Register a kind only known at runtime
    pub fn register_resource(&mut self, resource: ApiResource, scope: Scope) -> &KindInfo {
        self.register_info(KindInfo { resource, scope })
    }

    fn register_info(&mut self, info: KindInfo) -> &KindInfo {
        let gvk = info.gvk();
        self.kinds.insert(gvk.clone(), info);
        &self.kinds[&gvk]
    }

    /// Look up a kind by group, version and kind
    pub fn get(&self, gvk: &GroupVersionKind) -> Option<&KindInfo> {
        self.kinds.get(gvk)
    }

    /// Look up a statically known kind
    pub fn lookup<K: Resource<DynamicType = ()>>(&self) -> Option<&KindInfo> {
        self.get(&GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&())))
    }

    /// Look up the kind an object declares
    pub fn for_object(&self, obj: &DynamicObject) -> Option<&KindInfo> {
        self.get(&declared_kind(obj)?)
    }

    /// All registered kinds
    pub fn iter(&self) -> impl Iterator<Item = &KindInfo> {
        self.kinds.values()
    }

    /// Number of registered kinds
    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
    use serde_json::json;

    fn configmap_object() -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "foo", "namespace": "ns1" },
            "data": { "a": "b" }
        }))
        .unwrap()
    }

    #[test]
    fn decodes_matching_kind() {
        let cm: ConfigMap = decode(&configmap_object()).unwrap().unwrap();
        assert_eq!(cm.metadata.name.as_deref(), Some("foo"));
        assert_eq!(cm.data.unwrap()["a"], "b");
    }

    #[test]
    fn foreign_kind_is_not_decoded() {
        assert!(decode::<Secret>(&configmap_object()).is_none());
        assert!(!is_kind::<Secret>(&configmap_object()));
    }

    #[test]
    fn untyped_object_is_not_decoded() {
        let mut obj = configmap_object();
        obj.types = None;
        assert!(decode::<ConfigMap>(&obj).is_none());
    }

    #[test]
    fn malformed_object_of_matching_kind_is_an_error() {
        let obj: DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "foo" },
            "data": 5
        }))
        .unwrap();
        assert!(matches!(decode::<ConfigMap>(&obj), Some(Err(Error::SerdeError(_)))));
    }

    #[test]
    fn encode_keeps_type_information() {
        let cm: ConfigMap = decode(&configmap_object()).unwrap().unwrap();
        let obj = encode(&cm).unwrap();
        assert!(is_kind::<ConfigMap>(&obj));
        assert_eq!(obj.metadata.namespace.as_deref(), Some("ns1"));
        assert_eq!(obj.data["data"]["a"], "b");
    }

    #[test]
    fn registry_finds_kinds_by_object() {
        let registry = KindRegistry::new()
            .with::<ConfigMap>(Scope::Namespaced)
            .with::<Namespace>(Scope::Cluster);
        assert_eq!(registry.len(), 2);

        let info = registry.for_object(&configmap_object()).unwrap();
        assert_eq!(info.resource.plural, "configmaps");
        assert!(info.is_namespaced());
        assert!(info.matches(&configmap_object()));

        assert!(!registry.lookup::<Namespace>().unwrap().is_namespaced());
        assert!(registry.lookup::<Secret>().is_none());
    }

    #[test]
    fn declared_kind_splits_group_and_version() {
        let mut obj = configmap_object();
        obj.types = Some(TypeMeta {
            api_version: "management.cattle.io/v3".into(),
            kind: "Project".into(),
        });
        assert_eq!(
            declared_kind(&obj),
            Some(GroupVersionKind::gvk("management.cattle.io", "v3", "Project"))
        );
    }

    #[test]
    fn stamp_fills_missing_types_only() {
        let info = KindInfo::of::<ConfigMap>(Scope::Namespaced);
        let mut obj = configmap_object();
        obj.types = None;
        info.stamp(&mut obj);
        assert!(info.matches(&obj));
        assert_eq!(info.group_resource(), "configmaps");
    }
}
