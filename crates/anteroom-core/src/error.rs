use crate::queue::QueueState;

/// Low-level store adapter errors. This is the error type for the `Store`
/// trait: adapters can only fail with infrastructure errors, never domain
/// errors.
///
/// `Transient` failures are retried inside the adapter with bounded backoff;
/// callers only see one after the retry budget is exhausted.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("fatal store failure: {0}")]
    Fatal(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Failures of the enqueue operation.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("queue {queue} is {state}, not accepting entrants")]
    QueueUnavailable { queue: String, state: QueueState },

    #[error("queue {queue} is full (max {max_size})")]
    QueueFull { queue: String, max_size: u64 },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures of per-position operations (heartbeat, cancel, rank lookup).
///
/// `Expired` and `Cancelled` are lifecycle outcomes the gateway surfaces
/// distinctly so clients can choose to rejoin.
#[derive(Debug, thiserror::Error)]
pub enum PositionError {
    #[error("position not found: {0}")]
    NotFound(String),

    #[error("position {0} has expired")]
    Expired(String),

    #[error("position {0} was cancelled")]
    Cancelled(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures of credential issue and validation.
///
/// `BoundMismatch` is deliberately distinct from `Invalid`: the signature
/// checked out but the presenter's fingerprint did not match the binding
/// claim. Callers may accept it anyway behind an explicit leniency flag.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("malformed or unverifiable credential")]
    Invalid,

    #[error("unexpected signing algorithm: {0}")]
    Algorithm(String),

    #[error("unknown signing key: {0}")]
    UnknownKey(String),

    #[error("credential kind mismatch")]
    KindMismatch,

    #[error("credential expired")]
    Expired,

    #[error("credential not yet valid")]
    NotYetValid,

    #[error("credential revoked: {0}")]
    Revoked(String),

    #[error("fingerprint binding mismatch")]
    BoundMismatch,

    #[error("signing failure: {0}")]
    Signing(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures of active-session operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session {0} has expired")]
    Expired(String),

    #[error("session {0} was terminated")]
    Terminated(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Failures inside the admission path. The admission loop logs these and
/// carries on; they are self-healing by the next tick.
#[derive(Debug, thiserror::Error)]
pub enum AdmitError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Credential(#[from] CredentialError),
}

/// Failures of queue administration.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    #[error("queue already exists: {0}")]
    AlreadyExists(String),

    #[error("queue not found: {0}")]
    NotFound(String),

    #[error("invalid queue configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Configuration failures. These are fatal: the process refuses to start.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value}")]
    Invalid { key: String, value: String },

    #[error("{0} must be set explicitly in release builds")]
    MissingSalt(&'static str),
}
