//! Error types for the cluster provisioner

use thiserror::Error;

/// Main error type for provisioning operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Validation error for CRD specs
    #[error("validation error: {0}")]
    Validation(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A node pool's infrastructure config could not be read
    #[error("node config {reference}: {message}")]
    NodeConfig {
        /// `apiVersion/kind/namespace/name` of the referenced object
        reference: String,
        /// What went wrong
        message: String,
    },

    /// Request against the manifest endpoint failed
    #[error("http error fetching {url}: {message}")]
    Http {
        /// Requested URL (token redacted)
        url: String,
        /// What went wrong
        message: String,
    },

    /// Building or parsing a kubeconfig failed
    #[error("kubeconfig error: {0}")]
    Kubeconfig(String),

    /// Minting or reading a credential failed
    #[error("credential error: {0}")]
    Credential(String),

    /// A Rust type was used without being registered in the [`crate::scheme::Scheme`]
    ///
    /// This is a programming error and is never retried.
    #[error("type {type_name} is not registered in the scheme")]
    TypeNotRegistered {
        /// Rust type name
        type_name: String,
    },

    /// Unexpected internal condition
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a node config error for the given reference key
    pub fn node_config(reference: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::NodeConfig {
            reference: reference.into(),
            message: msg.into(),
        }
    }

    /// Create an HTTP error for the given URL
    pub fn http(url: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Http {
            url: url.into(),
            message: msg.into(),
        }
    }

    /// Create a kubeconfig error with the given message
    pub fn kubeconfig(msg: impl Into<String>) -> Self {
        Self::Kubeconfig(msg.into())
    }

    /// Create a credential error with the given message
    pub fn credential(msg: impl Into<String>) -> Self {
        Self::Credential(msg.into())
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a type-not-registered error for `T`
    pub fn type_not_registered<T: ?Sized>() -> Self {
        Self::TypeNotRegistered {
            type_name: std::any::type_name::<T>().to_string(),
        }
    }

    /// Whether the controller should retry after this error
    ///
    /// Validation failures need a spec change and unregistered types need a
    /// new build, so neither is worth requeueing.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation(_) | Self::TypeNotRegistered { .. })
    }
}
