use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde_json::{json, Value};

/// Prefix of the finalizer added by a lifecycle
pub const FINALIZER_PREFIX: &str = "controller.cattle.io/";

/// Prefix of the finalizer added by a cluster-scoped lifecycle
pub const CLUSTER_SCOPED_FINALIZER_PREFIX: &str = "clusterscoped.controller.cattle.io/";

/// Prefix of the annotation marking that a non-finalizing lifecycle ran `create`
pub const CREATED_ANNOTATION_PREFIX: &str = "lifecycle.cattle.io/create.";

/// Where an object stands with respect to one lifecycle registration
///
/// Derived from the stored object alone, so a restarted process picks up where the
/// previous one left off.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum LifecycleState {
    /// Not yet seen by this registration, `create` has not completed
    New,
    /// `create` completed and the object is live
    Active,
    /// The object is being deleted and `remove` has not completed
    Deleting,
    /// `remove` completed, or was never owed, and the store may delete the object
    Finalized,
}

impl LifecycleState {
    /// The state implied by the deletion timestamp and this registration's marker
    pub fn derive(is_deleting: bool, has_marker: bool) -> Self {
        match (is_deleting, has_marker) {
            (false, false) => LifecycleState::New,
            (false, true) => LifecycleState::Active,
            (true, true) => LifecycleState::Deleting,
            (true, false) => LifecycleState::Finalized,
        }
    }
}

/// The finalizer owned by the lifecycle registered as `name`
pub fn finalizer_name(name: &str, cluster_scoped: bool) -> String {
    if cluster_scoped {
        format!("{CLUSTER_SCOPED_FINALIZER_PREFIX}{name}")
    } else {
        format!("{FINALIZER_PREFIX}{name}")
    }
}

/// The annotation recording that `create` ran for the lifecycle registered as `name`
pub fn created_annotation(name: &str) -> String {
    format!("{CREATED_ANNOTATION_PREFIX}{name}")
}

/// A patch appending `finalizer`, failing if the object changed since `meta` was read
pub(crate) fn add_finalizer(meta: &ObjectMeta, finalizer: &str) -> serde_json::Result<json_patch::Patch> {
    let mut ops = resource_version_guard(meta);
    match meta.finalizers.as_deref() {
        None | Some([]) => ops.push(json!({
            "op": "add", "path": "/metadata/finalizers", "value": [finalizer]
        })),
        Some(existing) => {
            // someone else may have appended in the meantime
            ops.push(json!({ "op": "test", "path": "/metadata/finalizers", "value": existing }));
            ops.push(json!({ "op": "add", "path": "/metadata/finalizers/-", "value": finalizer }));
        }
    }
    serde_json::from_value(Value::Array(ops))
}

/// A patch dropping `finalizer` from position `index`
///
/// The `test` makes the patch fail rather than remove another controller's finalizer
/// when the list was reordered.
pub(crate) fn remove_finalizer(index: usize, finalizer: &str) -> serde_json::Result<json_patch::Patch> {
    let path = format!("/metadata/finalizers/{index}");
    serde_json::from_value(json!([
        { "op": "test", "path": path, "value": finalizer },
        { "op": "remove", "path": path },
    ]))
}

/// A patch setting `annotation` to `"true"`
pub(crate) fn add_annotation(meta: &ObjectMeta, annotation: &str) -> serde_json::Result<json_patch::Patch> {
    let mut ops = resource_version_guard(meta);
    if meta.annotations.is_some() {
        ops.push(json!({
            "op": "add",
            "path": format!("/metadata/annotations/{}", escape(annotation)),
            "value": "true"
        }));
    } else {
        ops.push(json!({
            "op": "add", "path": "/metadata/annotations", "value": { annotation: "true" }
        }));
    }
    serde_json::from_value(Value::Array(ops))
}

fn resource_version_guard(meta: &ObjectMeta) -> Vec<Value> {
    meta.resource_version
        .iter()
        .map(|rv| json!({ "op": "test", "path": "/metadata/resourceVersion", "value": rv }))
        .collect()
}

/// Escape a JSON pointer reference token
fn escape(token: &str) -> String {
    token.replace('~', "~0").replace('/', "~1")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(value: Value) -> ObjectMeta {
        serde_json::from_value(value).unwrap()
    }

    fn apply(meta: &ObjectMeta, patch: &json_patch::Patch) -> Result<ObjectMeta, json_patch::PatchError> {
        let mut doc = json!({ "metadata": meta });
        json_patch::patch(&mut doc, &patch.0)?;
        Ok(serde_json::from_value(doc["metadata"].clone()).unwrap())
    }

    #[test]
    fn states_follow_deletion_and_marker() {
        assert_eq!(LifecycleState::derive(false, false), LifecycleState::New);
        assert_eq!(LifecycleState::derive(false, true), LifecycleState::Active);
        assert_eq!(LifecycleState::derive(true, true), LifecycleState::Deleting);
        assert_eq!(LifecycleState::derive(true, false), LifecycleState::Finalized);
    }

    #[test]
    fn finalizer_names() {
        assert_eq!(finalizer_name("registrationA", false), "controller.cattle.io/registrationA");
        assert_eq!(
            finalizer_name("registrationA_c-1", true),
            "clusterscoped.controller.cattle.io/registrationA_c-1"
        );
        assert_eq!(created_annotation("x"), "lifecycle.cattle.io/create.x");
    }

    #[test]
    fn adds_first_finalizer() {
        let m = meta(json!({ "name": "foo", "resourceVersion": "3" }));
        let patched = apply(&m, &add_finalizer(&m, "controller.cattle.io/a").unwrap()).unwrap();
        assert_eq!(patched.finalizers, Some(vec!["controller.cattle.io/a".to_string()]));
    }

    #[test]
    fn appends_to_existing_finalizers() {
        let m = meta(json!({ "name": "foo", "finalizers": ["other"] }));
        let patched = apply(&m, &add_finalizer(&m, "mine").unwrap()).unwrap();
        assert_eq!(patched.finalizers, Some(vec!["other".to_string(), "mine".to_string()]));
    }

    #[test]
    fn add_fails_on_a_newer_object() {
        let read = meta(json!({ "name": "foo", "resourceVersion": "3" }));
        let stored = meta(json!({ "name": "foo", "resourceVersion": "4" }));
        assert!(apply(&stored, &add_finalizer(&read, "mine").unwrap()).is_err());

        let read = meta(json!({ "name": "foo", "finalizers": ["other"] }));
        let stored = meta(json!({ "name": "foo", "finalizers": ["other", "third"] }));
        assert!(apply(&stored, &add_finalizer(&read, "mine").unwrap()).is_err());
    }

    #[test]
    fn removes_only_our_finalizer() {
        let m = meta(json!({ "name": "foo", "finalizers": ["other", "mine"] }));
        let patched = apply(&m, &remove_finalizer(1, "mine").unwrap()).unwrap();
        assert_eq!(patched.finalizers, Some(vec!["other".to_string()]));

        let reordered = meta(json!({ "name": "foo", "finalizers": ["mine", "other"] }));
        assert!(apply(&reordered, &remove_finalizer(1, "mine").unwrap()).is_err());
    }

    #[test]
    fn annotation_keys_are_escaped() {
        let annotation = created_annotation("registrationA");
        let bare = meta(json!({ "name": "foo" }));
        let patched = apply(&bare, &add_annotation(&bare, &annotation).unwrap()).unwrap();
        assert_eq!(patched.annotations.unwrap()[&annotation], "true");

        let annotated = meta(json!({ "name": "foo", "annotations": { "a": "b" } }));
        let patched = apply(&annotated, &add_annotation(&annotated, &annotation).unwrap()).unwrap();
        let annotations = patched.annotations.unwrap();
        assert_eq!(annotations[&annotation], "true");
        assert_eq!(annotations["a"], "b");
    }
}
