// Error types for the tip ledger

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Every failure the ledger can report.
///
/// Errors are plain data so a relay outcome can be stored and replayed
/// exactly as it was first returned.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "code", content = "detail", rename_all = "snake_case")]
pub enum LedgerError {
    // Invalid input
    #[error("invalid handle: {0}")]
    InvalidHandle(String),
    #[error("an account must be a creator, a tipper, or both")]
    InvalidRole,
    #[error("amount must be greater than zero")]
    InvalidAmount,
    #[error("daily limit must be greater than zero")]
    InvalidLimit,
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("request id must be 1-128 printable characters")]
    InvalidRequestId,
    #[error("message exceeds {max} characters")]
    MessageTooLong { max: usize },
    #[error("cannot tip yourself")]
    SelfTip,
    #[error("fee rate {0} bps exceeds 10000")]
    InvalidFeeRate(u16),
    #[error("could not parse command: {0}")]
    InvalidCommand(String),

    // Not found
    #[error("account is not registered")]
    NotRegistered,
    #[error("recipient not found")]
    RecipientNotFound,
    #[error("no authorization exists for this operator")]
    AuthorizationNotFound,
    #[error("tip not found")]
    TipNotFound,

    // Conflict
    #[error("account is already registered")]
    AlreadyRegistered,
    #[error("handle is already taken")]
    HandleTaken,

    // Permission denied
    #[error("operator is not authorized for this account")]
    NotAuthorized,
    #[error("recipient is not a creator")]
    RecipientNotCreator,
    #[error("sender is not a tipper")]
    SenderNotTipper,
    #[error("caller is not the ledger admin")]
    NotAdmin,

    // Insufficient funds
    #[error("insufficient balance")]
    InsufficientBalance,
    #[error("daily limit exceeded")]
    DailyLimitExceeded,

    #[error("token is not supported")]
    UnsupportedToken,

    // Unavailable
    #[error("request is already being processed")]
    RequestInFlight,
    #[error("custody failure: {0}")]
    CustodyFailure(String),
    #[error("arithmetic overflow")]
    Overflow,
    #[error("storage error: {0}")]
    Storage(String),
}

/// Coarse error classes exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidInput,
    NotFound,
    Conflict,
    PermissionDenied,
    InsufficientFunds,
    Unsupported,
    Unavailable,
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        use LedgerError::*;
        match self {
            InvalidHandle(_) | InvalidRole | InvalidAmount | InvalidLimit | InvalidAddress(_)
            | InvalidRequestId | MessageTooLong { .. } | SelfTip | InvalidFeeRate(_)
            | InvalidCommand(_) => ErrorKind::InvalidInput,
            NotRegistered | RecipientNotFound | AuthorizationNotFound | TipNotFound => {
                ErrorKind::NotFound
            }
            AlreadyRegistered | HandleTaken => ErrorKind::Conflict,
            NotAuthorized | RecipientNotCreator | SenderNotTipper | NotAdmin => {
                ErrorKind::PermissionDenied
            }
            InsufficientBalance | DailyLimitExceeded => ErrorKind::InsufficientFunds,
            UnsupportedToken => ErrorKind::Unsupported,
            RequestInFlight | CustodyFailure(_) | Overflow | Storage(_) => ErrorKind::Unavailable,
        }
    }
}

impl From<sqlx::Error> for LedgerError {
    fn from(err: sqlx::Error) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

impl From<sqlx::migrate::MigrateError> for LedgerError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        LedgerError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::Storage(format!("encoding: {}", err))
    }
}

impl From<reqwest::Error> for LedgerError {
    fn from(err: reqwest::Error) -> Self {
        LedgerError::CustodyFailure(err.to_string())
    }
}

pub type Result<T, E = LedgerError> = std::result::Result<T, E>;
