use thiserror::Error;

use crate::types::{CellId, ChunkId, TabletId, TxnId};

/// Convenience alias for `Result<T, TabulaError>`.
pub type TabulaResult<T> = Result<T, TabulaError>;

/// Error classification for retry/escalation decisions.
///
/// - `UserError`: bad input, wrong workflow, permission denied
/// - `Retryable`: quorum or leader temporarily unreachable; caller SHOULD retry with backoff
/// - `Transient`: timeout; caller MAY retry
/// - `InternalBug`: should never happen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    UserError,
    Retryable,
    Transient,
    InternalBug,
}

/// Top-level error type that all layer errors convert into.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TabulaError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Consistency error: {0}")]
    Consistency(#[from] ConsistencyError),

    #[error("Availability error: {0}")]
    Availability(#[from] AvailabilityError),

    #[error("Permission denied: user {user:?} has no {permission} permission on {path}")]
    PermissionDenied {
        user: String,
        permission: String,
        path: String,
    },

    #[error("State error: {0}")]
    State(#[from] StateError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Rejected input. Always raised before any state change.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("Invalid schema: {0}")]
    Schema(String),

    #[error("Invalid pivot keys: {0}")]
    InvalidPivotKeys(String),

    #[error("Atomicity mismatch: table has {table:?} atomicity, request has {requested:?}")]
    AtomicityMismatch { table: String, requested: String },

    #[error("Invalid row: {0}")]
    Row(String),

    #[error("Invalid expression {expression:?}: {reason}")]
    Expression { expression: String, reason: String },

    #[error("Invalid config: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    Argument(String),
}

/// Quorum/leader problems in the replicated layers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConsistencyError {
    #[error("Cell {cell} has no leader")]
    NoLeader { cell: CellId },

    #[error("Cell {cell} quorum unreachable: {alive} of {required} peers alive")]
    QuorumUnreachable {
        cell: CellId,
        alive: usize,
        required: usize,
    },

    #[error("Chunk {chunk} write quorum not reached: {acked} of {required} replicas acknowledged")]
    WriteQuorumNotReached {
        chunk: ChunkId,
        acked: usize,
        required: usize,
    },

    #[error("Reading from followers requires an explicit staleness bound (async_last_committed timestamp)")]
    StaleReadUnbounded,

    #[error("Operation timed out after {0} ms")]
    Timeout(u64),
}

/// Persisted data that cannot currently be served.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AvailabilityError {
    #[error("Chunk {0} is quorum_missing")]
    QuorumMissing(ChunkId),

    #[error("Chunk {0} is lost")]
    Lost(ChunkId),

    #[error("Not enough nodes: need {required}, {available} available")]
    NotEnoughNodes { required: usize, available: usize },
}

/// Operation invalid for the current lifecycle state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("Tablet {tablet} is {state}, cannot {operation}")]
    InvalidTabletState {
        tablet: TabletId,
        state: String,
        operation: String,
    },

    #[error("Table {0} is not dynamic")]
    NotDynamic(String),

    #[error("Table {0} is dynamic")]
    IsDynamic(String),

    #[error("Table {0} is read-only")]
    ReadOnly(String),

    #[error("Journal {0} is not sealed")]
    JournalNotSealed(String),

    #[error("Chunk {0} is already sealed")]
    ChunkSealed(ChunkId),

    #[error("Chunk {0} is not sealed")]
    ChunkNotSealed(ChunkId),

    #[error("Transaction {0} is not active")]
    TransactionNotActive(TxnId),

    #[error("Cell {0} still hosts tablets")]
    CellInUse(CellId),

    #[error("{0}")]
    Other(String),
}

impl TabulaError {
    /// Classify this error for retry/escalation decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TabulaError::Validation(_)
            | TabulaError::PermissionDenied { .. }
            | TabulaError::State(_)
            | TabulaError::NotFound(_) => ErrorKind::UserError,
            TabulaError::Consistency(ConsistencyError::StaleReadUnbounded) => ErrorKind::UserError,
            TabulaError::Consistency(ConsistencyError::Timeout(_)) => ErrorKind::Transient,
            TabulaError::Consistency(_) => ErrorKind::Retryable,
            // Surfaced to operators rather than retried past erasure tolerance.
            TabulaError::Availability(AvailabilityError::QuorumMissing(_)) => ErrorKind::Transient,
            TabulaError::Availability(_) => ErrorKind::UserError,
            TabulaError::Internal(_) => ErrorKind::InternalBug,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Retryable)
    }

    pub fn is_user_error(&self) -> bool {
        matches!(self.kind(), ErrorKind::UserError)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient)
    }

    /// Errors raised before any state was touched on any peer.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            TabulaError::Validation(_)
                | TabulaError::PermissionDenied { .. }
                | TabulaError::State(_)
                | TabulaError::NotFound(_)
        )
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        TabulaError::Internal(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        TabulaError::NotFound(what.into())
    }

    pub fn schema(msg: impl Into<String>) -> Self {
        TabulaError::Validation(ValidationError::Schema(msg.into()))
    }

    pub fn pivot_keys(msg: impl Into<String>) -> Self {
        TabulaError::Validation(ValidationError::InvalidPivotKeys(msg.into()))
    }

    pub fn invalid_row(msg: impl Into<String>) -> Self {
        TabulaError::Validation(ValidationError::Row(msg.into()))
    }

    pub fn argument(msg: impl Into<String>) -> Self {
        TabulaError::Validation(ValidationError::Argument(msg.into()))
    }

    pub fn state(msg: impl Into<String>) -> Self {
        TabulaError::State(StateError::Other(msg.into()))
    }
}

impl From<Box<bincode::ErrorKind>> for TabulaError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        TabulaError::Internal(format!("serialization: {e}"))
    }
}

impl From<serde_json::Error> for TabulaError {
    fn from(e: serde_json::Error) -> Self {
        TabulaError::Validation(ValidationError::Argument(format!("json: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let e = TabulaError::schema("no key columns");
        assert_eq!(e.kind(), ErrorKind::UserError);
        assert!(e.is_local());

        let e: TabulaError = ConsistencyError::NoLeader { cell: CellId(1) }.into();
        assert!(e.is_retryable());
        assert!(!e.is_local());

        let e: TabulaError = ConsistencyError::StaleReadUnbounded.into();
        assert!(e.is_user_error());

        let e: TabulaError = AvailabilityError::QuorumMissing(ChunkId(3)).into();
        assert!(e.is_transient());
        let e: TabulaError = AvailabilityError::Lost(ChunkId(3)).into();
        assert!(!e.is_retryable());
    }

    #[test]
    fn test_error_display() {
        let e = TabulaError::PermissionDenied {
            user: "u".into(),
            permission: "mount".into(),
            path: "//tmp/t".into(),
        };
        assert_eq!(
            e.to_string(),
            "Permission denied: user \"u\" has no mount permission on //tmp/t"
        );
    }
}
