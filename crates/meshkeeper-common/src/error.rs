//! Error types for the meshkeeper operator
//!
//! Errors carry structured fields so that the reconcile loop can decide
//! whether to retry and so that status messages stay readable.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for meshkeeper operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for the desired configuration
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "config.authorizers")
        field: Option<String>,
    },

    /// A resource quantity string could not be parsed
    #[error("invalid quantity '{value}': {message}")]
    Quantity {
        /// The rejected quantity string
        value: String,
        /// Why it was rejected
        message: String,
    },

    /// Manifest could not be parsed or merged
    #[error("manifest error [{context}]: {message}")]
    Manifest {
        /// Description of what failed
        message: String,
        /// Stage where the error occurred (e.g., "parse", "merge", "write")
        context: String,
    },

    /// The requested version transition is not allowed
    #[error("{message}")]
    VersionGate {
        /// Human readable rejection reason
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The document kind being serialized (if known)
        kind: Option<String>,
    },

    /// The external installer reported a failure
    #[error("{message}")]
    Installation {
        /// Generic message; raw process output is never surfaced here
        message: String,
    },

    /// A workload restart failed
    #[error("restart error for {workload}: {message}")]
    Restart {
        /// `namespace/name` of the workload
        workload: String,
        /// Description of what failed
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "controller", "status")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with a field path
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a quantity error for the rejected value
    pub fn quantity(value: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Quantity {
            value: value.into(),
            message: msg.into(),
        }
    }

    /// Create a manifest error with the given message
    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::Manifest {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create a manifest error with stage context
    pub fn manifest_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Manifest {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create a version gate rejection
    pub fn version_gate(msg: impl Into<String>) -> Self {
        Self::VersionGate {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with document kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an installation error
    pub fn installation(msg: impl Into<String>) -> Self {
        Self::Installation {
            message: msg.into(),
        }
    }

    /// Create a restart error for a workload
    pub fn restart(workload: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Restart {
            workload: workload.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Malformed input (validation, quantities, manifests, stored state) needs a
    /// configuration fix and is never retried. Version gate rejections wait for
    /// the user to change the target version.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::Validation { .. } => false,
            Error::Quantity { .. } => false,
            Error::Manifest { .. } => false,
            Error::VersionGate { .. } => false,
            Error::Serialization { .. } => false,
            Error::Installation { .. } => true,
            Error::Restart { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Whether the Kubernetes API reported the object as missing
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 404
        )
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Manifest { context, .. } => Some(context),
            Error::Internal { context, .. } => Some(context),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
