//! Callback-style transaction demarcation for blocking code.

use std::fmt;

use crate::resource::ResourceDriver;
use crate::transaction::definition::TransactionDefinition;
use crate::transaction::error::ExecutionError;
use crate::transaction::manager::TransactionManager;
use crate::transaction::status::{CompletionReport, CompletionState, TransactionStatus};

/// Value produced by a unit of work together with how its scope completed.
#[derive(Debug, Clone, PartialEq)]
pub struct Completed<R> {
    pub value: R,
    pub report: CompletionReport,
}

/// Runs units of work inside a transaction described by one definition.
///
/// ```
/// use txscope::resource::MemoryDriver;
/// use txscope::transaction::{TransactionManager, TransactionTemplate};
///
/// let driver = MemoryDriver::new();
/// let template = TransactionTemplate::new(TransactionManager::new(driver.clone()));
///
/// let stored = template.execute(|status| {
///     let tx = status.transaction().expect("transaction");
///     driver.put(tx, "orders/1", serde_json::json!({"total": 42}))?;
///     Ok::<_, txscope::resource::MemoryError>(1)
/// });
///
/// assert_eq!(stored.unwrap(), 1);
/// assert!(driver.committed("orders/1").is_some());
/// ```
pub struct TransactionTemplate<D: ResourceDriver> {
    manager: TransactionManager<D>,
    definition: TransactionDefinition,
}

impl<D: ResourceDriver> TransactionTemplate<D> {
    /// A template using the default definition.
    pub fn new(manager: TransactionManager<D>) -> Self {
        Self::with(manager, TransactionDefinition::default())
    }

    pub fn with(manager: TransactionManager<D>, definition: TransactionDefinition) -> Self {
        Self {
            manager,
            definition,
        }
    }

    /// Same manager, another definition.
    pub fn with_definition(&self, definition: TransactionDefinition) -> Self {
        Self::with(self.manager.clone(), definition)
    }

    pub fn definition(&self) -> &TransactionDefinition {
        &self.definition
    }

    pub fn manager(&self) -> &TransactionManager<D> {
        &self.manager
    }

    /// Run `work` in a transaction and return its value.
    ///
    /// `Ok` commits (or rolls back if the scope was marked rollback-only),
    /// `Err` rolls back and hands the error back unchanged.
    pub fn execute<F, R, E>(&self, work: F) -> Result<R, ExecutionError<E>>
    where
        F: FnOnce(&TransactionStatus<D::Transaction>) -> Result<R, E>,
    {
        self.execute_reported(work).map(|completed| completed.value)
    }

    /// Like [`TransactionTemplate::execute`], also reporting what completion did.
    pub fn execute_reported<F, R, E>(&self, work: F) -> Result<Completed<R>, ExecutionError<E>>
    where
        F: FnOnce(&TransactionStatus<D::Transaction>) -> Result<R, E>,
    {
        let status = self.manager.resolve(&self.definition)?;
        let guard = RollbackOnUnwind {
            manager: &self.manager,
            status: &status,
        };
        let result = work(&status);
        std::mem::forget(guard);

        match result {
            Ok(value) => {
                let report = self.manager.commit(&status)?;
                Ok(Completed { value, report })
            }
            Err(error) => match self.manager.rollback(&status) {
                Ok(_) => Err(ExecutionError::Work(error)),
                Err(rollback_error) => {
                    tracing::error!(
                        tx_id = %status.display_id(),
                        error = %rollback_error,
                        "rollback after failed unit of work failed"
                    );
                    Err(ExecutionError::RollbackFailed {
                        error,
                        rollback_error,
                    })
                }
            },
        }
    }
}

impl<D: ResourceDriver> Clone for TransactionTemplate<D> {
    fn clone(&self) -> Self {
        Self::with(self.manager.clone(), self.definition.clone())
    }
}

impl<D: ResourceDriver> fmt::Debug for TransactionTemplate<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionTemplate")
            .field("definition", &self.definition)
            .finish()
    }
}

/// Rolls the scope back if the unit of work panics.
struct RollbackOnUnwind<'a, D: ResourceDriver> {
    manager: &'a TransactionManager<D>,
    status: &'a TransactionStatus<D::Transaction>,
}

impl<D: ResourceDriver> Drop for RollbackOnUnwind<'_, D> {
    fn drop(&mut self) {
        if self.status.state() != CompletionState::Active {
            return;
        }
        tracing::warn!(tx_id = %self.status.display_id(), "unit of work panicked, rolling back");
        if let Err(err) = self.manager.rollback(self.status) {
            tracing::error!(tx_id = %self.status.display_id(), error = %err, "rollback after panic failed");
        }
    }
}
