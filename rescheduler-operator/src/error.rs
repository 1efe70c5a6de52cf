//! Error types for the rescheduler operator.

use thiserror::Error;

/// Errors that can occur during operator operations.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// Kubernetes API error that does not map to a more specific variant.
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Resource not found.
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        /// Resource kind.
        kind: String,
        /// Resource name.
        name: String,
        /// Resource namespace.
        namespace: String,
    },

    /// The object was modified since it was read (resource version mismatch).
    #[error("Conflict on {kind}/{name}: {message}")]
    Conflict {
        /// Resource kind.
        kind: String,
        /// Resource name.
        name: String,
        /// Server message.
        message: String,
    },

    /// An object with the same name already exists.
    #[error("{kind}/{name} already exists")]
    AlreadyExists {
        /// Resource kind.
        kind: String,
        /// Resource name.
        name: String,
    },

    /// The conflict retry loop ran out of attempts.
    #[error("Gave up on {target} after {attempts} conflicting attempts")]
    ConflictRetriesExhausted {
        /// Object the loop was writing.
        target: String,
        /// Attempts made.
        attempts: u32,
    },

    /// An object was deleted for recreation but the copy could not be
    /// created. `manifest` holds the JSON of the copy so it can be restored.
    #[error("Deleted {target} but could not create it again: {source}")]
    RecreateFailed {
        /// Object that was deleted.
        target: String,
        /// JSON manifest of the copy that was not created.
        manifest: String,
        /// Last create error.
        #[source]
        source: Box<OperatorError>,
    },

    /// The pod's immediate owner is not a kind the rescheduler manages.
    #[error("Unsupported owner kind: {kind}")]
    UnsupportedOwner {
        /// Owner kind as reported by the owner reference.
        kind: String,
    },

    /// A ledger annotation could not be decoded.
    #[error("Malformed ledger annotation {key} on {object}: {cause}")]
    LedgerDecode {
        /// Annotation key.
        key: String,
        /// Object carrying the annotation.
        object: String,
        /// Decoder message.
        cause: String,
    },

    /// The retry budget annotation is not an integer.
    #[error("Invalid retry budget on {object}: {value:?}")]
    InvalidBudget {
        /// Object carrying the annotation.
        object: String,
        /// Raw annotation value.
        value: String,
    },

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// IO error.
    #[error("IO error: {0}")]
    IoError(String),

    /// TLS setup error.
    #[error("TLS error: {0}")]
    TlsError(String),
}

/// Result type for operator operations.
pub type OperatorResult<T> = Result<T, OperatorError>;

impl OperatorError {
    /// Classify a kube client error for an operation on `kind/name`.
    ///
    /// 404 becomes [`OperatorError::NotFound`], 409 becomes
    /// [`OperatorError::AlreadyExists`] or [`OperatorError::Conflict`]
    /// depending on the status reason.
    pub fn from_kube(err: kube::Error, kind: &str, namespace: &str, name: &str) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => OperatorError::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            },
            kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                OperatorError::AlreadyExists {
                    kind: kind.to_string(),
                    name: name.to_string(),
                }
            }
            kube::Error::Api(resp) if resp.code == 409 => OperatorError::Conflict {
                kind: kind.to_string(),
                name: name.to_string(),
                message: resp.message.clone(),
            },
            _ => OperatorError::KubeError(err),
        }
    }

    /// Whether this is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, OperatorError::Conflict { .. })
    }

    /// Whether the target object does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, OperatorError::NotFound { .. })
    }

    /// Whether the create collided with an existing object.
    pub fn is_already_exists(&self) -> bool {
        matches!(self, OperatorError::AlreadyExists { .. })
    }
}

impl From<serde_json::Error> for OperatorError {
    fn from(err: serde_json::Error) -> Self {
        OperatorError::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for OperatorError {
    fn from(err: std::io::Error) -> Self {
        OperatorError::IoError(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn classifies_kube_status_codes() {
        let err = OperatorError::from_kube(api_error(409, "Conflict"), "Deployment", "ns", "web");
        assert!(err.is_conflict());

        let err = OperatorError::from_kube(api_error(409, "AlreadyExists"), "Job", "ns", "job");
        assert!(err.is_already_exists());
        assert!(!err.is_conflict());

        let err = OperatorError::from_kube(api_error(404, "NotFound"), "Pod", "ns", "web-0");
        assert!(err.is_not_found());

        let err = OperatorError::from_kube(api_error(500, "InternalError"), "Pod", "ns", "web-0");
        assert!(matches!(err, OperatorError::KubeError(_)));
    }
}
