use thiserror::Error;

/// A boxed error from business code
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors returned by handlers and lifecycles to the scheduler
#[derive(Error, Debug)]
pub enum Error {
    /// The object store rejected a read or write
    #[error("object store request failed: {0}")]
    Store(#[from] herd_core::Error),

    /// An object of the expected kind could not be decoded
    #[error("failed to decode {key} as {kind}: {source}")]
    Decode {
        /// Expected kind
        kind: String,
        /// Cache key of the object
        key: String,
        /// Why it failed
        #[source]
        source: herd_core::Error,
    },

    /// A plain handler failed
    #[error("handler {name} failed: {source}")]
    Handler {
        /// Registration name
        name: String,
        /// What the handler returned
        #[source]
        source: BoxError,
    },

    /// A lifecycle's create callback failed
    #[error("lifecycle {name} failed to create {key}: {source}")]
    CreateFailed {
        /// Lifecycle name
        name: String,
        /// Cache key of the object
        key: String,
        /// What the callback returned
        #[source]
        source: BoxError,
    },

    /// A lifecycle's updated callback failed
    #[error("lifecycle {name} failed to update {key}: {source}")]
    UpdatedFailed {
        /// Lifecycle name
        name: String,
        /// Cache key of the object
        key: String,
        /// What the callback returned
        #[source]
        source: BoxError,
    },

    /// A lifecycle's remove callback failed, the finalizer stays in place
    #[error("lifecycle {name} failed to remove {key}: {source}")]
    RemoveFailed {
        /// Lifecycle name
        name: String,
        /// Cache key of the object
        key: String,
        /// What the callback returned
        #[source]
        source: BoxError,
    },

    /// Patching the finalizer in failed
    #[error("failed to add finalizer {finalizer} to {key}: {source}")]
    AddFinalizer {
        /// Finalizer marker
        finalizer: String,
        /// Cache key of the object
        key: String,
        /// Store error
        #[source]
        source: herd_core::Error,
    },

    /// Patching the finalizer out failed
    #[error("failed to remove finalizer {finalizer} from {key}: {source}")]
    RemoveFinalizer {
        /// Finalizer marker
        finalizer: String,
        /// Cache key of the object
        key: String,
        /// Store error
        #[source]
        source: herd_core::Error,
    },

    /// A handler panicked, the key is retried like any other failure
    #[error("handler {name} panicked: {message}")]
    Panicked {
        /// Registration name
        name: String,
        /// Panic payload, when it was a string
        message: String,
    },

    /// A controller was requested for a kind missing from the registry
    #[error("kind {kind} in {api_version} is not registered")]
    UnregisteredKind {
        /// apiVersion of the kind
        api_version: String,
        /// Kind name
        kind: String,
    },
}

impl Error {
    /// The store error behind this one, if any
    pub fn store_error(&self) -> Option<&herd_core::Error> {
        match self {
            Error::Store(source)
            | Error::Decode { source, .. }
            | Error::AddFinalizer { source, .. }
            | Error::RemoveFinalizer { source, .. } => Some(source),
            _ => None,
        }
    }
}
