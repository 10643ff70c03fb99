//! Resource driver contracts.
//!
//! The coordinator never performs physical work itself. Beginning, committing
//! and rolling back a transaction, as well as savepoint handling, are delegated
//! to a driver through one of the two traits in this module:
//!
//! - [`ResourceDriver`] for the thread-bound [`TransactionManager`]
//! - [`ReactiveResourceDriver`] for the context-carried [`ReactiveTransactionManager`]
//!
//! Driver failures are passed through unchanged inside
//! [`TransactionError::System`].
//!
//! [`TransactionManager`]: crate::transaction::TransactionManager
//! [`ReactiveTransactionManager`]: crate::reactive::ReactiveTransactionManager
//! [`TransactionError::System`]: crate::transaction::TransactionError::System

mod memory;

use std::fmt;

use async_trait::async_trait;

use crate::transaction::TransactionDefinition;

pub use memory::{DriverCall, MemoryDriver, MemoryError, MemoryTransaction};

/// Error raised by a resource driver.
pub type DriverError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type for resource driver calls.
pub type DriverResult<T> = Result<T, DriverError>;

/// The physical operations a driver performs on behalf of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverOperation {
    Begin,
    Commit,
    Rollback,
    CreateSavepoint,
    RollbackToSavepoint,
    ReleaseSavepoint,
    Suspend,
    Resume,
}

impl fmt::Display for DriverOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DriverOperation::Begin => "begin",
            DriverOperation::Commit => "commit",
            DriverOperation::Rollback => "rollback",
            DriverOperation::CreateSavepoint => "create savepoint",
            DriverOperation::RollbackToSavepoint => "rollback to savepoint",
            DriverOperation::ReleaseSavepoint => "release savepoint",
            DriverOperation::Suspend => "suspend",
            DriverOperation::Resume => "resume",
        };
        f.write_str(name)
    }
}

/// Marker for a partial rollback point created by a driver.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Savepoint {
    name: String,
}

impl Savepoint {
    /// Create a savepoint marker with the driver-assigned name.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The driver-assigned savepoint name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Savepoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Blocking driver used by the thread-bound manager.
///
/// The physical transaction is shared between every participant of a
/// transactional scope, so all calls receive it by reference.
pub trait ResourceDriver: Send + Sync + 'static {
    /// Driver-specific physical transaction object.
    type Transaction: Send + Sync + 'static;

    /// Start a physical transaction.
    ///
    /// The definition carries the effective timeout. Enforcing it is the
    /// driver's job.
    fn begin(&self, definition: &TransactionDefinition) -> DriverResult<Self::Transaction>;

    fn commit(&self, transaction: &Self::Transaction) -> DriverResult<()>;

    fn rollback(&self, transaction: &Self::Transaction) -> DriverResult<()>;

    fn create_savepoint(&self, transaction: &Self::Transaction) -> DriverResult<Savepoint>;

    fn rollback_to_savepoint(
        &self,
        transaction: &Self::Transaction,
        savepoint: &Savepoint,
    ) -> DriverResult<()>;

    fn release_savepoint(
        &self,
        transaction: &Self::Transaction,
        savepoint: &Savepoint,
    ) -> DriverResult<()>;

    /// Detach the transaction from the underlying resource while an inner
    /// scope runs without it.
    fn suspend(&self, transaction: &Self::Transaction) -> DriverResult<()> {
        let _ = transaction;
        Ok(())
    }

    /// Re-attach a transaction previously passed to [`ResourceDriver::suspend`].
    fn resume(&self, transaction: &Self::Transaction) -> DriverResult<()> {
        let _ = transaction;
        Ok(())
    }
}

/// Non-blocking driver used by the context-carried manager.
///
/// Same contract as [`ResourceDriver`]. Implementations must not rely on
/// running on any particular thread.
#[async_trait]
pub trait ReactiveResourceDriver: Send + Sync + 'static {
    type Transaction: Send + Sync + 'static;

    async fn begin(&self, definition: &TransactionDefinition) -> DriverResult<Self::Transaction>;

    async fn commit(&self, transaction: &Self::Transaction) -> DriverResult<()>;

    async fn rollback(&self, transaction: &Self::Transaction) -> DriverResult<()>;

    async fn create_savepoint(&self, transaction: &Self::Transaction) -> DriverResult<Savepoint>;

    async fn rollback_to_savepoint(
        &self,
        transaction: &Self::Transaction,
        savepoint: &Savepoint,
    ) -> DriverResult<()>;

    async fn release_savepoint(
        &self,
        transaction: &Self::Transaction,
        savepoint: &Savepoint,
    ) -> DriverResult<()>;

    async fn suspend(&self, transaction: &Self::Transaction) -> DriverResult<()> {
        let _ = transaction;
        Ok(())
    }

    async fn resume(&self, transaction: &Self::Transaction) -> DriverResult<()> {
        let _ = transaction;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_display() {
        assert_eq!(DriverOperation::Begin.to_string(), "begin");
        assert_eq!(
            DriverOperation::RollbackToSavepoint.to_string(),
            "rollback to savepoint"
        );
    }

    #[test]
    fn test_savepoint_name() {
        let sp = Savepoint::new("sp1");
        assert_eq!(sp.name(), "sp1");
        assert_eq!(sp.to_string(), "sp1");
    }
}
