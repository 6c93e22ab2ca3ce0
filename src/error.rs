use thiserror::Error;

use crate::transaction::{AbortReason, TransactionId};

pub type VellumResult<T, E = VellumError> = Result<T, E>;

#[derive(Debug, Error)]
pub enum VellumError {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Transaction {txn_id} aborted: {reason}")]
    TransactionAbort {
        txn_id: TransactionId,
        reason: AbortReason,
    },
}

impl VellumError {
    /// The abort reason if this error carries one.
    pub fn abort_reason(&self) -> Option<AbortReason> {
        match self {
            VellumError::TransactionAbort { reason, .. } => Some(*reason),
            _ => None,
        }
    }
}
