//! Turning untyped queue events into typed handler calls
use crate::error::Error;
use herd_core::{kind, object_in_cluster, DynamicObject, TypedResource};
use std::{
    future::Future,
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::debug;

/// Feature check re-evaluated on every event
pub(crate) type Enabled = Arc<dyn Fn() -> bool + Send + Sync>;

/// Conditions an event must pass before a handler sees it
#[derive(Clone, Default)]
pub(crate) struct Gate {
    pub(crate) enabled: Option<Enabled>,
    pub(crate) cluster: Option<String>,
}

impl Gate {
    pub(crate) fn feature(mut self, enabled: Enabled) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub(crate) fn cluster(mut self, cluster: &str) -> Self {
        self.cluster = Some(cluster.to_string());
        self
    }

    fn is_open(&self) -> bool {
        self.enabled.as_ref().is_none_or(|enabled| enabled())
    }

    fn admits(&self, obj: &DynamicObject) -> bool {
        self.cluster
            .as_deref()
            .is_none_or(|cluster| object_in_cluster(cluster, obj))
    }
}

/// One typed registration sitting on an untyped queue
pub(crate) struct Dispatcher<K, F> {
    pub(crate) registration: String,
    pub(crate) gate: Gate,
    pub(crate) dropped: Arc<AtomicU64>,
    pub(crate) handler: F,
    pub(crate) _kind: PhantomData<fn() -> K>,
}

impl<K, F, Fut> Dispatcher<K, F>
where
    K: TypedResource,
    F: Fn(String, Option<K>) -> Fut,
    Fut: Future<Output = Result<Option<K>, Error>>,
{
    /// Run the handler for `key` if the event passes the gate and holds a `K`
    ///
    /// A vanished object is passed on as `None`. Objects of other kinds are dropped
    /// without an error.
    pub(crate) async fn dispatch(
        &self,
        key: String,
        obj: Option<Arc<DynamicObject>>,
    ) -> Result<Option<DynamicObject>, Error> {
        if !self.gate.is_open() {
            return Ok(None);
        }
        let Some(obj) = obj else {
            return (self.handler)(key, None).await.and_then(encode_returned);
        };
        let typed = match kind::decode::<K>(&obj) {
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    registration = %self.registration,
                    %key,
                    expected = %K::kind(&()),
                    observed = obj.types.as_ref().map(|t| t.kind.as_str()).unwrap_or_default(),
                    "dropping event for foreign kind"
                );
                return Ok(None);
            }
            Some(decoded) => decoded.map_err(|source| Error::Decode {
                kind: K::kind(&()).into_owned(),
                key: key.clone(),
                source,
            })?,
        };
        if !self.gate.admits(&obj) {
            return Ok(None);
        }
        (self.handler)(key, Some(typed)).await.and_then(encode_returned)
    }
}

fn encode_returned<K: TypedResource>(obj: Option<K>) -> Result<Option<DynamicObject>, Error> {
    Ok(obj.map(|o| kind::encode(&o)).transpose()?)
}
