use thiserror::Error;

use crate::types::StatusId;

/// Convenience alias for `Result<T, WarblerError>`.
pub type WarblerResult<T> = Result<T, WarblerError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`: rejected input or a forbidden call; fixing the caller fixes it
/// - `Transient`: I/O or durability hiccup; the embedding system MAY retry `persist()`
/// - `InternalBug`: should never happen; identifier space exhausted, corrupt journal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Transient,
    InternalBug,
}

/// Top-level error type for everything outside the storage core.
#[derive(Error, Debug)]
pub enum WarblerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised by the status-update store.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The submitted value is not a status update. Nothing was enqueued.
    #[error("Validation error: {0}")]
    Validation(String),

    /// A raw mutation that would bypass the allocator and the indexes.
    #[error("Unsupported operation `{operation}`: {invariant}")]
    UnsupportedOperation {
        operation: &'static str,
        invariant: &'static str,
    },

    /// Every identifier from `requested` up to `u64::MAX` is taken.
    #[error("Identifier space exhausted: no free id at or above {requested}")]
    AllocationExhausted { requested: StatusId },

    #[error("Durability error: {0}")]
    Durability(String),

    #[error("Journal error: {0}")]
    Journal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Build the error returned by every forbidden raw mutation.
    pub fn unsupported(operation: &'static str, invariant: &'static str) -> Self {
        StorageError::UnsupportedOperation {
            operation,
            invariant,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::Validation(_) => ErrorKind::UserError,
            StorageError::UnsupportedOperation { .. } => ErrorKind::UserError,
            StorageError::Durability(_) => ErrorKind::Transient,
            StorageError::Io(_) => ErrorKind::Transient,
            StorageError::AllocationExhausted { .. } => ErrorKind::InternalBug,
            StorageError::Journal(_) => ErrorKind::InternalBug,
            StorageError::Serialization(_) => ErrorKind::InternalBug,
        }
    }
}

// ── WarblerError classification & helpers ────────────────────────────────────

impl WarblerError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            WarblerError::Storage(e) => e.kind(),
            WarblerError::Config(_) => ErrorKind::UserError,
            WarblerError::Internal(_) => ErrorKind::InternalBug,
        }
    }

    /// Returns true if this is a user/input error.
    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::UserError)
    }

    /// Returns true if the embedding system may retry the failed step.
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Returns true if this is an internal bug that should never occur.
    pub fn is_internal_bug(&self) -> bool {
        matches!(self.kind(), ErrorKind::InternalBug)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_classification() {
        assert_eq!(
            StorageError::Validation("author missing".into()).kind(),
            ErrorKind::UserError
        );
        assert_eq!(
            StorageError::unsupported("pop", "ids are removed only by clear()").kind(),
            ErrorKind::UserError
        );
        assert_eq!(
            StorageError::Durability("disk full".into()).kind(),
            ErrorKind::Transient
        );
        assert_eq!(
            StorageError::AllocationExhausted {
                requested: StatusId(u64::MAX)
            }
            .kind(),
            ErrorKind::InternalBug
        );
    }

    #[test]
    fn test_unsupported_names_operation_and_invariant() {
        let err = StorageError::unsupported("merge", "indexes must mirror the primary store");
        let msg = err.to_string();
        assert!(msg.contains("merge"), "{}", msg);
        assert!(msg.contains("indexes must mirror the primary store"), "{}", msg);
    }

    #[test]
    fn test_warbler_error_wraps_storage() {
        let err: WarblerError = StorageError::Validation("blank tag".into()).into();
        assert!(err.is_user_error());
        assert!(!err.is_transient());
        let err = WarblerError::Internal("boom".into());
        assert!(err.is_internal_bug());
    }
}
