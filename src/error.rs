//! # Error Types
//!
//! Crate-wide error type and result alias.
//!
//! Cache-management failures are deliberately non-fatal to permission
//! checks: the external compute path always yields an answer, so an
//! `OutOfMemory` or a lost update only costs a future cache hit. Only
//! [`AvcError::PermissionDenied`] and the non-blocking audit refusal
//! reach callers of the decision protocol.

use thiserror::Error;

/// Access vector cache error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AvcError {
    /// The requested permissions were denied by policy while enforcing
    /// (or the check was strict).
    #[error("Permission denied")]
    PermissionDenied,

    /// A best-effort cache operation could not allocate. The decision
    /// itself is unaffected.
    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    /// An update targeted a cache entry that no longer exists. Benign;
    /// the update is discarded.
    #[error("Cache entry not found")]
    NotFound,

    /// Audit output was refused in a non-blocking context; retry from a
    /// blocking context.
    #[error("Audit deferred: non-blocking context")]
    TryAgainNonblocking,

    /// The cache has been disabled; management operations are rejected.
    #[error("Access vector cache is disabled")]
    Disabled,

    /// The security server failed to compute a decision.
    #[error("Security server error: {0}")]
    SecurityServer(String),

    /// A policy-change callback reported a failure.
    #[error("Policy callback error: {0}")]
    Callback(String),
}

/// Result type for access vector cache operations
pub type AvcResult<T> = Result<T, AvcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(AvcError::PermissionDenied.to_string(), "Permission denied");
        assert_eq!(
            AvcError::OutOfMemory("node".to_string()).to_string(),
            "Out of memory: node"
        );
        assert_eq!(
            AvcError::TryAgainNonblocking.to_string(),
            "Audit deferred: non-blocking context"
        );
    }
}
