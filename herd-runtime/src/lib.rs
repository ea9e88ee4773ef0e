//! Typed handlers, listers and finalizer lifecycles over untyped controllers
//!
//! A [`GenericController`] delivers every change of one kind as a key plus an untyped
//! [`DynamicObject`](herd_core::DynamicObject). [`TypedController`] narrows that to one
//! Rust type, dropping objects of other kinds and gating handlers on feature flags and
//! cluster membership. [`TypedClient`] adds store access, and with it
//! [`Lifecycle`] registrations that hold a finalizer on each object until the object's
//! `remove` callback succeeded.
//!
//! [`SharedController`] and [`MemoryStore`] are in-process implementations of the two
//! collaborators. With the `kube` feature, [`kube::KubeObjectClient`] and
//! [`kube::reflect`] connect them to a real API server.
//!
//! Everything here is re-exported from `herd` under `herd::runtime`.
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]

pub mod client;
pub use client::{ObjectClient, TypedClient};

pub mod controller;
pub use controller::{GenericController, Handler, TypedController};

mod error;
pub use error::{BoxError, Error};

pub mod indexer;
pub use indexer::Indexer;

pub mod lifecycle;
pub use lifecycle::{Lifecycle, LifecycleAdapter, LifecycleState};

pub mod lister;
pub use lister::Lister;

pub mod memory;
pub use memory::MemoryStore;

pub mod queue;
pub use queue::WorkQueue;

pub mod shared;
pub use shared::{SharedController, SharedControllerConfig, SharedControllerFactory};

#[cfg(feature = "kube")]
#[cfg_attr(docsrs, doc(cfg(feature = "kube")))]
pub mod kube;

/// Convenient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
