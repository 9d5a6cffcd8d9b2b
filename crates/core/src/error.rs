//! Error types shared by the reconciler and its collaborators.
//!
//! `ClientError` is what a cluster or record-store call reports. `Error` is
//! what a convergence pass reports; every variant is retryable, the work queue
//! decides when.

use thiserror::Error;

/// Failure reported by a `ClusterClient` or `RecordStore` call.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict writing {0}: object was modified")]
    Conflict(String),

    #[error("api error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("resource type {0} is not served by the cluster")]
    UnknownKind(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),
}

impl ClientError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClientError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClientError::Conflict(_))
    }
}

/// Failure of a convergence pass or one of its stages.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid resource key {0:?}")]
    InvalidKey(String),

    #[error("invalid manifest: {0}")]
    Manifest(String),

    #[error("transform of {resource} failed: {message}")]
    Transform { resource: String, message: String },

    #[error("apply of {resource} failed: {source}")]
    Apply { resource: String, source: ClientError },

    #[error("delete of {resource} failed: {source}")]
    Delete { resource: String, source: ClientError },

    #[error("reading {resource} failed: {source}")]
    Read { resource: String, source: ClientError },

    #[error("{stage} hook failed: {message}")]
    Hook { stage: &'static str, message: String },

    #[error("lookup of {record} failed: {source}")]
    Lookup { record: String, source: ClientError },

    #[error("status update for {record} failed: {source}")]
    StatusPersist { record: String, source: ClientError },

    #[error("upgrade signal for {record} failed: {source}")]
    Upgrade { record: String, source: ClientError },
}

impl Error {
    pub fn transform(resource: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Transform { resource: resource.into(), message: message.into() }
    }

    pub fn hook(stage: &'static str, message: impl Into<String>) -> Self {
        Self::Hook { stage, message: message.into() }
    }

    /// Short machine-readable tag, used as a metrics label.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::InvalidKey(_) => "invalid_key",
            Error::Manifest(_) => "manifest",
            Error::Transform { .. } => "transform",
            Error::Apply { .. } => "apply",
            Error::Delete { .. } => "delete",
            Error::Read { .. } => "read",
            Error::Hook { .. } => "hook",
            Error::Lookup { .. } => "lookup",
            Error::StatusPersist { .. } => "status_persist",
            Error::Upgrade { .. } => "upgrade",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_error_names_resource_and_cause() {
        let err = Error::Apply {
            resource: "apps/v1/Deployment ns/d1".into(),
            source: ClientError::Api { code: 422, message: "invalid".into() },
        };
        let msg = err.to_string();
        assert!(msg.contains("apps/v1/Deployment ns/d1"), "msg={}", msg);
        assert!(msg.contains("422"), "msg={}", msg);
        assert_eq!(err.kind(), "apply");
    }

    #[test]
    fn not_found_predicate() {
        assert!(ClientError::NotFound("x".into()).is_not_found());
        assert!(!ClientError::Conflict("x".into()).is_not_found());
        assert!(ClientError::Conflict("x".into()).is_conflict());
    }
}
