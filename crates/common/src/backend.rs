//! Interface to the server of record.

use async_trait::async_trait;

use crate::secret::Secret;

/// Ways a backend request can fail.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The source no longer has the secret. Distinct from other failures
    /// because it triggers delayed deletion rather than fallback to cache.
    #[error("secret deleted at source")]
    Deleted,
    /// Transport failures, unexpected status codes, unusable payloads.
    #[error(transparent)]
    Transient(#[from] anyhow::Error),
}

impl BackendError {
    pub fn is_deleted(&self) -> bool {
        matches!(self, BackendError::Deleted)
    }
}

/// A provider of secrets.
///
/// Calls may block for up to the implementation's own transport timeout and
/// must be safe to issue concurrently. The cache never holds its store lock
/// across these calls.
#[async_trait]
pub trait SecretBackend: Send + Sync {
    /// Fetches a single secret by name. A missing secret is
    /// [`BackendError::Deleted`].
    async fn fetch_secret(&self, name: &str) -> Result<Secret, BackendError>;

    /// Lists all secrets. Returned entries may be metadata-only (empty
    /// content).
    async fn list_secrets(&self) -> Result<Vec<Secret>, BackendError>;
}
