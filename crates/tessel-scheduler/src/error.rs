use thiserror::Error;

/// Failures of the lease / task persistence layer.
///
/// The executor treats every variant as transient: the affected lease is left
/// unfinished and picked up again on the next discovery pass.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// A stored column could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row holds a value outside its domain (e.g. a negative segment).
    #[error("Corrupt row: {0}")]
    Corrupt(String),

    /// The backend could not be reached (poisoned lock, cancelled worker, ...).
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Errors surfaced to callers of the scheduler API.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Bad task type registration, trigger or scheduler settings.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// `schedule_task` named a task type that was never registered.
    #[error("Unknown task type: {name}")]
    UnknownTaskType { name: String },

    #[error("Scheduler already started")]
    AlreadyStarted,

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<tessel_core::TesselError> for SchedulerError {
    fn from(e: tessel_core::TesselError) -> Self {
        SchedulerError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
pub type StoreResult<T> = std::result::Result<T, StoreError>;
