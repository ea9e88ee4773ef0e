//! Collaborators backed by a Kubernetes API server
use crate::{client::ObjectClient, shared::SharedController};
use async_trait::async_trait;
use futures::{future, stream::BoxStream, StreamExt};
use herd_core::{DynamicObject, Error, KindInfo, ObjectKey, Result, Selector};
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    runtime::{watcher, WatchStreamExt},
    Client,
};
use kube_core::WatchEvent;
use std::sync::Arc;
use tracing::{debug, warn};

/// An [`ObjectClient`] talking to the API server through [`kube::Api`]
pub struct KubeObjectClient {
    client: Client,
    kind: KindInfo,
}

impl KubeObjectClient {
    /// A client for `kind`
    pub fn new(client: Client, kind: KindInfo) -> Arc<Self> {
        Arc::new(Self { client, kind })
    }

    fn api(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        match namespace {
            Some(ns) if self.kind.is_namespaced() => {
                Api::namespaced_with(self.client.clone(), ns, &self.kind.resource)
            }
            _ => Api::all_with(self.client.clone(), &self.kind.resource),
        }
    }

    fn error(&self, key: &ObjectKey, err: kube::Error) -> Error {
        map_error(&self.kind, key, err)
    }

    fn typed(&self, mut obj: DynamicObject) -> DynamicObject {
        self.kind.stamp(&mut obj);
        obj
    }
}

fn map_error(kind: &KindInfo, key: &ObjectKey, err: kube::Error) -> Error {
    match err {
        kube::Error::Api(resp) if resp.code == 404 => kind.not_found(&key.to_string()).into(),
        kube::Error::Api(resp) if resp.code == 409 => Error::Conflict {
            resource: kind.group_resource(),
            key: key.to_string(),
            message: resp.message,
        },
        kube::Error::Api(resp) => Error::Api {
            code: resp.code,
            reason: resp.reason,
            message: resp.message,
        },
        kube::Error::SerdeError(err) => Error::SerdeError(err),
        other => Error::Transport(Box::new(other)),
    }
}

#[async_trait]
impl ObjectClient for KubeObjectClient {
    fn kind(&self) -> &KindInfo {
        &self.kind
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::from_obj(obj);
        self.api(key.namespace.as_deref())
            .create(&PostParams::default(), obj)
            .await
            .map(|o| self.typed(o))
            .map_err(|err| self.error(&key, err))
    }

    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<DynamicObject> {
        let key = ObjectKey::from_parts(namespace.unwrap_or_default(), name);
        self.api(namespace)
            .get(name)
            .await
            .map(|o| self.typed(o))
            .map_err(|err| self.error(&key, err))
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject> {
        let key = ObjectKey::from_obj(obj);
        let name = obj.metadata.name.as_deref().ok_or(Error::UnnamedObject)?;
        self.api(key.namespace.as_deref())
            .replace(name, &PostParams::default(), obj)
            .await
            .map(|o| self.typed(o))
            .map_err(|err| self.error(&key, err))
    }

    async fn patch(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &json_patch::Patch,
    ) -> Result<DynamicObject> {
        let key = ObjectKey::from_parts(namespace.unwrap_or_default(), name);
        self.api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Json::<()>(patch.clone()))
            .await
            .map(|o| self.typed(o))
            .map_err(|err| self.error(&key, err))
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<()> {
        let key = ObjectKey::from_parts(namespace.unwrap_or_default(), name);
        self.api(namespace)
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|err| self.error(&key, err))
    }

    async fn delete_collection(&self, namespace: Option<&str>, selector: &Selector) -> Result<()> {
        let key = ObjectKey::from_parts(namespace.unwrap_or_default(), "");
        self.api(namespace)
            .delete_collection(&DeleteParams::default(), &ListParams::default().labels_from(selector))
            .await
            .map(|_| ())
            .map_err(|err| self.error(&key, err))
    }

    async fn list(&self, namespace: Option<&str>, selector: &Selector) -> Result<Vec<DynamicObject>> {
        let key = ObjectKey::from_parts(namespace.unwrap_or_default(), "");
        let list = self
            .api(namespace)
            .list(&ListParams::default().labels_from(selector))
            .await
            .map_err(|err| self.error(&key, err))?;
        Ok(list.items.into_iter().map(|o| self.typed(o)).collect())
    }

    /// Changes seen by a [`watcher`], which relists after every interruption
    ///
    /// Objects present when the watch starts are reported as added.
    async fn watch(&self, namespace: Option<&str>) -> Result<BoxStream<'static, WatchEvent<DynamicObject>>> {
        let kind = self.kind.clone();
        let events = watcher(self.api(namespace), watcher::Config::default())
            .default_backoff()
            .filter_map(move |event| {
                let event = match event {
                    Ok(watcher::Event::InitApply(mut obj)) => {
                        kind.stamp(&mut obj);
                        Some(WatchEvent::Added(obj))
                    }
                    Ok(watcher::Event::Apply(mut obj)) => {
                        kind.stamp(&mut obj);
                        Some(WatchEvent::Modified(obj))
                    }
                    Ok(watcher::Event::Delete(mut obj)) => {
                        kind.stamp(&mut obj);
                        Some(WatchEvent::Deleted(obj))
                    }
                    Ok(watcher::Event::Init | watcher::Event::InitDone) => None,
                    Err(err) => {
                        warn!(error = %err, "watch failed, retrying");
                        None
                    }
                };
                future::ready(event)
            });
        Ok(events.boxed())
    }
}

/// Feed `controller` from a [`watcher`] on `api` until the controller shuts down
///
/// Every relist replaces the cache wholesale, so handlers also hear about objects that
/// were deleted while the watch was interrupted.
pub async fn reflect(controller: &SharedController, api: Api<DynamicObject>) {
    let mut events = watcher(api, watcher::Config::default()).default_backoff().boxed();
    let mut relist = Vec::new();
    loop {
        let event = tokio::select! {
            _ = controller.shutdown_token().cancelled() => return,
            event = events.next() => event,
        };
        match event {
            Some(Ok(watcher::Event::Init)) => relist.clear(),
            Some(Ok(watcher::Event::InitApply(obj))) => relist.push(obj),
            Some(Ok(watcher::Event::InitDone)) => {
                debug!(objects = relist.len(), "relist complete");
                controller.replace(std::mem::take(&mut relist));
            }
            Some(Ok(watcher::Event::Apply(obj))) => controller.observe(obj),
            Some(Ok(watcher::Event::Delete(obj))) => controller.forget(&obj),
            Some(Err(err)) => warn!(error = %err, "watch failed, retrying"),
            None => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::map_error;
    use herd_core::{KindInfo, ObjectKey, Scope};
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube_core::ErrorResponse;
    use serde_json::json;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        let resp: ErrorResponse = serde_json::from_value(json!({
            "status": "Failure",
            "message": "boom",
            "reason": reason,
            "code": code
        }))
        .unwrap();
        kube::Error::Api(resp)
    }

    #[test]
    fn api_errors_are_classified() {
        let kind = KindInfo::of::<ConfigMap>(Scope::Namespaced);
        let key = ObjectKey::new("foo").within("ns1");

        let err = map_error(&kind, &key, api_error(404, "NotFound"));
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), r#"configmaps "ns1/foo" not found"#);

        assert!(map_error(&kind, &key, api_error(409, "Conflict")).is_conflict());

        let err = map_error(&kind, &key, api_error(403, "Forbidden"));
        assert!(matches!(err, herd_core::Error::Api { code: 403, .. }));
    }
}
