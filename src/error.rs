//! Engine error taxonomy
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::convert::Infallible;

/// Broad classes the caller uses to decide how to surface a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Authorization,
    Validation,
    ResourceConflict,
    NotFound,
    Infrastructure,
}

#[derive(thiserror::Error, Debug)]
pub enum EngineError {
    #[error("caller is not permitted to perform this action")]
    Forbidden,
    #[error("no authenticated user for this session")]
    NotAuthenticated,
    #[error("a pending swap request for this item already exists")]
    DuplicateRequest,
    #[error("amount must be a positive number of points")]
    InvalidAmount,
    #[error("an item cannot be redeemed by its owner")]
    SelfRedemption,
    #[error("cannot {action} a swap that is {from}")]
    InvalidTransition {
        from: &'static str,
        action: &'static str,
    },
    #[error("item {0} is not available")]
    ItemNotAvailable(String),
    #[error("one of the swapped items is already committed elsewhere")]
    ConflictingReservation,
    #[error("insufficient points: balance {balance}, required {required}")]
    InsufficientFunds { balance: u64, required: u64 },
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },
    #[error("failed to persist notification: {0}")]
    NotificationPersistFailure(String),
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("codec error: {0}")]
    Codec(String),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        EngineError::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            EngineError::Forbidden | EngineError::NotAuthenticated => ErrorClass::Authorization,
            EngineError::DuplicateRequest
            | EngineError::InvalidAmount
            | EngineError::SelfRedemption
            | EngineError::InvalidTransition { .. } => ErrorClass::Validation,
            EngineError::ItemNotAvailable(_)
            | EngineError::ConflictingReservation
            | EngineError::InsufficientFunds { .. } => ErrorClass::ResourceConflict,
            EngineError::NotFound { .. } => ErrorClass::NotFound,
            EngineError::NotificationPersistFailure(_)
            | EngineError::Storage(_)
            | EngineError::Codec(_) => ErrorClass::Infrastructure,
        }
    }

    /// Resource conflicts may succeed if the caller re-fetches state and tries
    /// again. The engine itself never retries.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::ResourceConflict
    }
}

impl From<TransactionError<EngineError>> for EngineError {
    fn from(value: TransactionError<EngineError>) -> Self {
        match value {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => EngineError::Storage(e),
        }
    }
}

impl From<EngineError> for ConflictableTransactionError<EngineError> {
    fn from(value: EngineError) -> Self {
        ConflictableTransactionError::Abort(value)
    }
}

impl From<minicbor::decode::Error> for EngineError {
    fn from(value: minicbor::decode::Error) -> Self {
        EngineError::Codec(value.to_string())
    }
}

impl From<minicbor::encode::Error<Infallible>> for EngineError {
    fn from(value: minicbor::encode::Error<Infallible>) -> Self {
        EngineError::Codec(value.to_string())
    }
}
