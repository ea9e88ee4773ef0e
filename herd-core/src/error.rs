use std::fmt;
use thiserror::Error;

/// Possible errors reported by an object store
#[derive(Error, Debug)]
pub enum Error {
    /// The object does not exist
    #[error(transparent)]
    NotFound(#[from] NotFound),

    /// A write was based on a stale copy of the object
    #[error("operation cannot be fulfilled on {resource} {key:?}: {message}")]
    Conflict {
        /// Plural resource name, qualified by group
        resource: String,
        /// Cache key of the object
        key: String,
        /// What did not match
        message: String,
    },

    /// Create was called for a key that is already taken
    #[error("{resource} {key:?} already exists")]
    AlreadyExists {
        /// Plural resource name, qualified by group
        resource: String,
        /// Cache key of the object
        key: String,
    },

    /// The object carries no `metadata.name`
    #[error("object has no name")]
    UnnamedObject,

    /// A JSON patch could not be applied, including failed `test` operations
    #[error("failed to apply patch: {0}")]
    Patch(#[from] json_patch::PatchError),

    /// An object could not be converted between its typed and untyped forms
    #[error("failed to (de)serialize object: {0}")]
    SerdeError(#[from] serde_json::Error),

    /// The API server rejected the request
    #[error("api error: {message}: {reason} ({code})")]
    Api {
        /// HTTP status code
        code: u16,
        /// Machine readable reason
        reason: String,
        /// Human readable message
        message: String,
    },

    /// The request never got an answer
    #[error("transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    /// Whether the error means the object is gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_)) || matches!(self, Error::Api { code: 404, .. })
    }

    /// Whether the error is an optimistic concurrency failure
    ///
    /// A failed JSON patch `test` operation counts, since those guard finalizer edits.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::Conflict { .. } | Error::Api { code: 409, .. } | Error::Patch(_)
        )
    }
}

/// A lookup missed, identified by group, plural resource and key
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct NotFound {
    /// API group, empty for the core group
    pub group: String,
    /// Plural resource name
    pub resource: String,
    /// Cache key that was looked up
    pub name: String,
}

impl NotFound {
    /// The `resource.group` form used in messages
    pub fn group_resource(&self) -> String {
        if self.group.is_empty() {
            self.resource.clone()
        } else {
            format!("{}.{}", self.resource, self.group)
        }
    }
}

impl fmt::Display for NotFound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:?} not found", self.group_resource(), self.name)
    }
}
