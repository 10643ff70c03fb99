//! Transaction error types.

use thiserror::Error;

use crate::events::ListenerError;
use crate::resource::{DriverError, DriverOperation};
use crate::transaction::status::CompletionState;

/// Result type for transaction operations.
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Errors raised by the coordinator itself.
#[derive(Debug, Error)]
pub enum TransactionError {
    /// Propagation rule violated, or a join was rejected by validation.
    #[error("illegal transaction state: {0}")]
    IllegalTransactionState(String),

    /// NESTED requested while the manager does not allow nesting.
    #[error("nested transaction '{name}' is not allowed by this manager")]
    NestedTransactionNotSupported { name: String },

    /// The resource driver failed.
    #[error("resource driver failed during {operation}: {source}")]
    System {
        operation: DriverOperation,
        #[source]
        source: DriverError,
    },

    /// Transaction was already committed or rolled back.
    #[error("transaction {tx_id} is no longer active (state: {state})")]
    NotActive {
        tx_id: String,
        state: CompletionState,
    },

    /// A timeout of zero was requested.
    #[error("transaction timeout must be positive")]
    InvalidTimeout,

    /// A before-commit listener failed; the transaction was rolled back instead.
    #[error("before-commit listener '{listener}' failed, transaction {tx_id} rolled back: {source}")]
    BeforeCommitFailed {
        tx_id: String,
        listener: String,
        #[source]
        source: ListenerError,
    },

    /// A participant asked to commit a transaction that is already marked
    /// rollback-only (only raised when failing early is configured).
    #[error("transaction {tx_id} has been marked rollback-only")]
    UnexpectedRollback { tx_id: String },
}

impl TransactionError {
    /// Wrap a driver failure.
    pub fn system(operation: DriverOperation, source: DriverError) -> Self {
        Self::System { operation, source }
    }

    pub(crate) fn illegal_state(message: impl Into<String>) -> Self {
        Self::IllegalTransactionState(message.into())
    }

    /// Check if the resource driver caused this error.
    pub fn is_system_failure(&self) -> bool {
        matches!(self, TransactionError::System { .. })
    }

    /// Check if a propagation rule was violated.
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, TransactionError::IllegalTransactionState(_))
    }
}

/// Error returned by the execution template and the reactive operator.
///
/// A failure of the unit of work is surfaced unchanged. When the rollback that
/// follows it fails as well, both are kept and the original stays primary.
#[derive(Debug, Error)]
pub enum ExecutionError<E> {
    /// The coordinator failed to begin, commit or roll back.
    #[error("transaction failed: {0}")]
    Transaction(#[source] TransactionError),

    /// The unit of work failed and the transaction was rolled back.
    #[error("{0}")]
    Work(E),

    /// The unit of work failed, and so did the rollback.
    #[error("{error} (rollback also failed: {rollback_error})")]
    RollbackFailed {
        error: E,
        #[source]
        rollback_error: TransactionError,
    },
}

impl<E> ExecutionError<E> {
    /// The failure raised by the unit of work, if any.
    pub fn work_error(&self) -> Option<&E> {
        match self {
            ExecutionError::Work(error) | ExecutionError::RollbackFailed { error, .. } => {
                Some(error)
            }
            ExecutionError::Transaction(_) => None,
        }
    }

    /// Take the failure raised by the unit of work, if any.
    pub fn into_work_error(self) -> Option<E> {
        match self {
            ExecutionError::Work(error) | ExecutionError::RollbackFailed { error, .. } => {
                Some(error)
            }
            ExecutionError::Transaction(_) => None,
        }
    }

    /// The coordinator failure, either the primary one or the failed rollback.
    pub fn transaction_error(&self) -> Option<&TransactionError> {
        match self {
            ExecutionError::Transaction(err)
            | ExecutionError::RollbackFailed {
                rollback_error: err,
                ..
            } => Some(err),
            ExecutionError::Work(_) => None,
        }
    }

    /// Check if a rollback failed after the unit of work failed.
    pub fn is_rollback_failure(&self) -> bool {
        matches!(self, ExecutionError::RollbackFailed { .. })
    }
}

impl<E> From<TransactionError> for ExecutionError<E> {
    fn from(err: TransactionError) -> Self {
        ExecutionError::Transaction(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let illegal = TransactionError::illegal_state("no transaction for MANDATORY");
        assert!(illegal.is_illegal_state());
        assert!(!illegal.is_system_failure());

        let system = TransactionError::system(DriverOperation::Commit, "disk full".into());
        assert!(system.is_system_failure());
        assert_eq!(
            system.to_string(),
            "resource driver failed during commit: disk full"
        );
    }

    #[test]
    fn test_not_active_display() {
        let err = TransactionError::NotActive {
            tx_id: "tx001".to_string(),
            state: CompletionState::Committed,
        };
        assert_eq!(
            err.to_string(),
            "transaction tx001 is no longer active (state: committed)"
        );
    }

    #[test]
    fn test_rollback_failure_keeps_both_errors() {
        let err: ExecutionError<String> = ExecutionError::RollbackFailed {
            error: "insert failed".to_string(),
            rollback_error: TransactionError::system(
                DriverOperation::Rollback,
                "connection lost".into(),
            ),
        };

        assert!(err.is_rollback_failure());
        assert_eq!(err.work_error().map(String::as_str), Some("insert failed"));
        assert!(err.transaction_error().unwrap().is_system_failure());
        assert_eq!(
            err.to_string(),
            "insert failed (rollback also failed: resource driver failed during rollback: connection lost)"
        );
    }

    #[test]
    fn test_work_error_is_surfaced_unchanged() {
        let err: ExecutionError<String> = ExecutionError::Work("boom".to_string());
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.into_work_error(), Some("boom".to_string()));
    }
}
