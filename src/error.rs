//! Error taxonomy for the loan request console
use super::status::Status;
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::convert::Infallible;

pub type Result<T, E = LoanError> = std::result::Result<T, E>;

/// Coarse classification of a [`LoanError`], one per failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Permission,
    InvalidState,
    Conflict,
    Dependency,
    NotFound,
    Storage,
}

#[derive(thiserror::Error, Debug)]
pub enum LoanError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("forbidden: {role} may not {operation}")]
    Permission { role: String, operation: String },
    #[error("invalid state: request is {current}, operation requires {}", format_expected(.expected))]
    InvalidState {
        current: Status,
        expected: Vec<Status>,
    },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("dependency failed: {0}")]
    Dependency(String),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("corrupt record: {0}")]
    Corrupt(String),
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),
    #[error("failed to encode record: {0}")]
    Encode(#[from] minicbor::encode::Error<Infallible>),
    #[error("failed to decode record: {0}")]
    Decode(#[from] minicbor::decode::Error),
}

impl LoanError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoanError::Validation(_) => ErrorKind::Validation,
            LoanError::Permission { .. } => ErrorKind::Permission,
            LoanError::InvalidState { .. } => ErrorKind::InvalidState,
            LoanError::Conflict(_) => ErrorKind::Conflict,
            LoanError::Dependency(_) => ErrorKind::Dependency,
            LoanError::NotFound { .. } => ErrorKind::NotFound,
            LoanError::Corrupt(_)
            | LoanError::Storage(_)
            | LoanError::Encode(_)
            | LoanError::Decode(_) => {
                ErrorKind::Storage
            }
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        LoanError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        LoanError::Conflict(msg.into())
    }

    pub fn invalid_state(current: Status, expected: &[Status]) -> Self {
        LoanError::InvalidState {
            current,
            expected: expected.to_vec(),
        }
    }
}

fn format_expected(expected: &[Status]) -> String {
    match expected {
        [] => "a non-terminal status".to_string(),
        [one] => one.to_string(),
        many => {
            let names: Vec<String> = many.iter().map(Status::to_string).collect();
            format!("one of [{}]", names.join(", "))
        }
    }
}

// sled transactions carry our error through `Abort`
impl From<TransactionError<LoanError>> for LoanError {
    fn from(value: TransactionError<LoanError>) -> Self {
        match value {
            TransactionError::Abort(err) => err,
            TransactionError::Storage(err) => LoanError::Storage(err),
        }
    }
}

/// Wrap any error convertible into [`LoanError`] as a transaction abort.
pub(crate) fn abort<E: Into<LoanError>>(err: E) -> ConflictableTransactionError<LoanError> {
    ConflictableTransactionError::Abort(err.into())
}
