use ulid::Ulid;

use crate::store::StoreError;

/// Caller-recoverable failure taxonomy. Every variant carries a stable
/// machine-readable code (`code()`) and a user-facing message (`Display`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Malformed input: unparseable date/time, missing required field.
    Validation(String),
    /// Entity absent: the label names what was looked up.
    NotFound(&'static str, Ulid),
    /// Actor is not authorized for the operation.
    Permission(String),
    /// Slot unavailable, capacity exceeded, overlapping reservation.
    Conflict(String),
    /// Another writer holds the reschedule lock.
    LockTimeout,
    /// The row changed between read and write.
    VersionConflict,
    /// Notice-period or reschedule-count limits exceeded.
    Policy(String),
    /// Persistence collaborator failure.
    Store(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound(..) => "not_found",
            EngineError::Permission(_) => "permission",
            EngineError::Conflict(_) => "conflict",
            EngineError::LockTimeout => "concurrency_lock_timeout",
            EngineError::VersionConflict => "concurrency_version",
            EngineError::Policy(_) => "policy",
            EngineError::Store(_) => "store",
        }
    }

    /// Retryable errors are worth a fresh attempt without changing the request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::LockTimeout | EngineError::VersionConflict | EngineError::Store(_)
        )
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::Validation(msg) => write!(f, "invalid request: {msg}"),
            EngineError::NotFound(what, id) => write!(f, "{what} not found: {id}"),
            EngineError::Permission(msg) => write!(f, "not permitted: {msg}"),
            EngineError::Conflict(msg) => write!(f, "slot unavailable: {msg}"),
            EngineError::LockTimeout => {
                write!(f, "this reservation is currently being modified, try again shortly")
            }
            EngineError::VersionConflict => {
                write!(f, "the reservation changed while processing, try again shortly")
            }
            EngineError::Policy(msg) => write!(f, "not allowed by booking policy: {msg}"),
            EngineError::Store(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::VersionConflict => EngineError::VersionConflict,
            StoreError::DuplicateSlot(msg) => EngineError::Conflict(msg),
            StoreError::Unavailable(msg) => EngineError::Store(msg),
        }
    }
}
