use login_common::login_event::NormalizeError;
use login_common::pgstore::PersistenceError;
use login_common::quarantine::FailureStage;
use thiserror::Error;

/// Enumeration of reasons a single message can't be turned into a `user_logins` row.
/// All of them end up in quarantine, none of them stops the worker.
#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("failed to parse message body: {0}")]
    ParseError(#[from] serde_json::Error),
    #[error(transparent)]
    NormalizeError(#[from] NormalizeError),
    #[error("failed to persist login event: {0}")]
    PersistenceError(#[from] PersistenceError),
}

impl ProcessingError {
    /// The processing step this error was raised at.
    pub fn stage(&self) -> FailureStage {
        match self {
            ProcessingError::ParseError(_) => FailureStage::Parse,
            ProcessingError::NormalizeError(_) => FailureStage::Normalize,
            ProcessingError::PersistenceError(_) => FailureStage::Persist,
        }
    }
}

/// The quarantine sink itself failed. Terminal for the message at hand, which stays in the
/// queue, but not for the worker.
#[derive(Error, Debug)]
#[error("failed to quarantine message after {stage} failure: {error}")]
pub struct QuarantineWriteError {
    pub stage: FailureStage,
    pub error: PersistenceError,
}

/// Enumeration of errors that stop the worker. Only raised while starting up.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to connect to the login store: {0}")]
    StoreConnectionError(#[from] PersistenceError),
}
