//! Herd turns untyped shared controllers into typed, finalizer-aware ones
//!
//! # Overview
//!
//! - [`core`] holds object keys, the kind registry, cluster membership and store errors
//! - [`runtime`] holds the typed controller and client, listers, lifecycles, and the
//!   in-process [`SharedController`] and [`MemoryStore`]
//!
//! # Registering a lifecycle
//!
//! ```no_run
//! use herd::{Lifecycle, MemoryStore, KindInfo, KindRegistry, Scope, SharedControllerConfig, SharedControllerFactory};
//! use k8s_openapi::api::core::v1::ConfigMap;
//! use tokio_util::sync::CancellationToken;
//!
//! struct Tracked;
//!
//! #[async_trait::async_trait]
//! impl Lifecycle<ConfigMap> for Tracked {
//!     type Error = std::convert::Infallible;
//!
//!     async fn create(&self, obj: ConfigMap) -> Result<Option<ConfigMap>, Self::Error> {
//!         Ok(Some(obj))
//!     }
//!
//!     async fn remove(&self, _obj: ConfigMap) -> Result<Option<ConfigMap>, Self::Error> {
//!         Ok(None)
//!     }
//!
//!     async fn updated(&self, _obj: ConfigMap) -> Result<Option<ConfigMap>, Self::Error> {
//!         Ok(None)
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), herd::Error> {
//!     let registry = KindRegistry::new().with::<ConfigMap>(Scope::Namespaced);
//!     let factory = SharedControllerFactory::new(registry, SharedControllerConfig::default());
//!     let store = MemoryStore::new(KindInfo::of::<ConfigMap>(Scope::Namespaced));
//!
//!     let configmaps = factory.client::<ConfigMap>(store, "default")?;
//!     configmaps.add_lifecycle(CancellationToken::new(), "tracked", Tracked);
//!     factory.start();
//!     Ok(())
//! }
//! ```
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]

#[doc(inline)]
pub use herd_core as core;
#[doc(inline)]
pub use herd_runtime as runtime;

pub use herd_core::{
    DynamicObject, GroupVersionKind, KindInfo, KindRegistry, ObjectKey, Resource, ResourceExt, Scope,
    Selector, TypedResource,
};
pub use herd_runtime::{
    Error, GenericController, Lifecycle, LifecycleAdapter, LifecycleState, Lister, MemoryStore,
    ObjectClient, Result, SharedController, SharedControllerConfig, SharedControllerFactory, TypedClient,
    TypedController,
};
