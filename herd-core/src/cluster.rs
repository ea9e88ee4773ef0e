//! Cluster membership of objects
//!
//! Objects that belong to a downstream cluster say so in one of several places,
//! depending on the kind. The first non-empty source wins:
//!
//! 1. a top-level `clusterName`
//! 2. `spec.clusterName`
//! 3. the cluster half of a top-level `projectName` (`<cluster>:<project>`)
//! 4. the cluster half of `spec.projectName`
//! 5. the cluster half of the [`PROJECT_ID_ANNOTATION`] annotation
//! 6. the namespace of the object
use kube_core::DynamicObject;
use serde_json::Value;

/// Annotation holding the `<cluster>:<project>` an object was assigned to
pub const PROJECT_ID_ANNOTATION: &str = "field.cattle.io/projectId";

/// The cluster an object belongs to, if it names one
pub fn cluster_of(obj: &DynamicObject) -> Option<String> {
    let spec = obj.data.get("spec");
    non_empty_str(obj.data.get("clusterName"))
        .or_else(|| non_empty_str(spec.and_then(|s| s.get("clusterName"))))
        .or_else(|| cluster_part(non_empty_str(obj.data.get("projectName"))))
        .or_else(|| cluster_part(non_empty_str(spec.and_then(|s| s.get("projectName")))))
        .or_else(|| {
            cluster_part(
                obj.metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(PROJECT_ID_ANNOTATION))
                    .map(String::as_str),
            )
        })
        .map(str::to_string)
        .or_else(|| obj.metadata.namespace.clone().filter(|ns| !ns.is_empty()))
}

/// Whether `obj` belongs to `cluster`
pub fn object_in_cluster(cluster: &str, obj: &DynamicObject) -> bool {
    cluster_of(obj).unwrap_or_default() == cluster
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn cluster_part(project: Option<&str>) -> Option<&str> {
    project
        .and_then(|p| p.split_once(':'))
        .map(|(cluster, _)| cluster)
        .filter(|c| !c.is_empty())
}
