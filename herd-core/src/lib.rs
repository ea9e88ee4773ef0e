//! Types and traits shared by every herd controller
//!
//! This crate holds the client-less half of herd: how objects are keyed in a cache,
//! how kinds are registered and recognised on an untyped queue, how cluster membership
//! is decided, and the error taxonomy that object stores report.
//!
//! Everything here is re-exported from `herd` under `herd::core`.
#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(unsafe_code)]

pub mod cluster;
pub use cluster::object_in_cluster;

mod error;
pub use error::{Error, NotFound};

pub mod key;
pub use key::ObjectKey;

pub mod kind;
pub use kind::{KindInfo, KindRegistry, TypedResource};

pub use kube_core::{discovery::Scope, DynamicObject, GroupVersionKind, Resource, ResourceExt, Selector};

/// Convenient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
