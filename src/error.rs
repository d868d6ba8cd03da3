use std::fmt::Display;

/// Failure kinds surfaced to callers of the session manager and the sync engine.
///
/// Lower-level failures (HTTP, decoding, storage) are folded into one of these
/// before they leave the crate's public operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    /// Session missing, expired or rejected by the backend.
    #[error("not authorized")]
    Unauthorized,
    /// Network or HTTP failure; safe to retry.
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// A stored credential could not be decoded.
    #[error("malformed credential: {0}")]
    Malformed(String),
}

impl SyncError {
    pub(crate) fn transient(context: &str, err: impl Display) -> Self {
        SyncError::Transient(format!("{context}: {err}"))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }

    /// Collapses `Malformed` into `Unauthorized`; a credential nobody can read
    /// is the same as no credential.
    pub fn normalized(self) -> Self {
        match self {
            SyncError::Malformed(_) => SyncError::Unauthorized,
            other => other,
        }
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SyncError::transient("decode response", err)
        } else {
            SyncError::transient("http", err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(SyncError::Transient("boom".into()).is_retryable());
        assert!(!SyncError::Unauthorized.is_retryable());
        assert!(!SyncError::NotFound("character 3".into()).is_retryable());
        assert!(!SyncError::Malformed("exp".into()).is_retryable());
    }

    #[test]
    fn malformed_normalizes_to_unauthorized() {
        assert_eq!(
            SyncError::Malformed("bad segment".into()).normalized(),
            SyncError::Unauthorized
        );
        assert_eq!(
            SyncError::NotFound("x".into()).normalized(),
            SyncError::NotFound("x".into())
        );
    }
}
