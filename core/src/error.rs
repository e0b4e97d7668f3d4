use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReconError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Run '{0}' not found")]
    RunNotFound(String),

    #[error("Exception '{0}' not found")]
    ExceptionNotFound(String),

    #[error("Month '{0}' has no reconciliation runs")]
    MonthNotFound(String),

    #[error("Invalid {entity} transition: cannot {action} from '{from}'")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        action: String,
    },

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Review out of order: expected {expected}, got {got}")]
    OutOfOrderReview { expected: String, got: String },

    #[error("Lock poisoned: {0}")]
    LockPoisoned(&'static str),

    #[error(transparent)]
    Worker(#[from] crate::workers::WorkerPanic),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ReconError {
    pub fn transition(entity: &'static str, from: impl ToString, action: impl ToString) -> Self {
        Self::InvalidTransition {
            entity,
            from: from.to_string(),
            action: action.to_string(),
        }
    }
}

pub type ReconResult<T> = Result<T, ReconError>;
