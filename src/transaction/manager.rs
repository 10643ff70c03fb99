//! Transaction manager - coordinates transactions bound to the calling thread.
//!
//! The TransactionManager is the main entry point for synchronous code.
//! It handles:
//! - Resolving a definition against the thread's active transaction
//! - Suspending and resuming outer transactions
//! - Committing, rolling back, and savepoint handling through the driver
//! - Running the synchronizations registered on a transaction

use std::fmt;
use std::sync::Arc;

use crate::resource::{DriverOperation, ResourceDriver};
use crate::transaction::config::ManagerConfig;
use crate::transaction::context::{ContextStore, ThreadLocalStore};
use crate::transaction::definition::TransactionDefinition;
use crate::transaction::error::{ExecutionError, TransactionError, TransactionResult};
use crate::transaction::propagation::{self, Completion, DriverStep, Resolution};
use crate::transaction::status::{
    CompletionReport, ExecutionUnit, HandleKind, ManagerId, Outcome, SharedTransaction,
    Suspended, TransactionId, TransactionStatus,
};
use crate::transaction::template::TransactionTemplate;

/// Transaction manager for blocking code.
///
/// Thread-safe: can be shared across threads via Clone (uses Arc internally).
/// Each thread sees only the transaction it started itself; a handle must be
/// completed on the thread that resolved it.
pub struct TransactionManager<D: ResourceDriver> {
    inner: Arc<TransactionManagerInner<D>>,
}

struct TransactionManagerInner<D> {
    id: ManagerId,
    driver: D,
    config: ManagerConfig,
}

impl<D: ResourceDriver> Clone for TransactionManager<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: ResourceDriver> TransactionManager<D> {
    /// Create a manager with the default configuration.
    pub fn new(driver: D) -> Self {
        Self::with_config(driver, ManagerConfig::default())
    }

    pub fn with_config(driver: D, config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(TransactionManagerInner {
                id: ManagerId::generate(),
                driver,
                config,
            }),
        }
    }

    /// Get a reference to the underlying driver.
    pub fn driver(&self) -> &D {
        &self.inner.driver
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn id(&self) -> ManagerId {
        self.inner.id
    }

    /// Check if this manager has a transaction bound to the calling thread.
    pub fn has_active_transaction(&self) -> bool {
        self.current().is_some()
    }

    /// Id of this manager's transaction bound to the calling thread.
    pub fn current_transaction_id(&self) -> Option<TransactionId> {
        self.current().map(|tx| tx.id())
    }

    fn current(&self) -> Option<Arc<SharedTransaction<D::Transaction>>> {
        ThreadLocalStore
            .current()
            .and_then(|binding| SharedTransaction::from_binding(&binding, self.inner.id))
    }

    // ==================== Resolution ====================

    /// Resolve `definition` against the calling thread's transaction.
    pub fn resolve(
        &self,
        definition: &TransactionDefinition,
    ) -> TransactionResult<TransactionStatus<D::Transaction>> {
        let definition = definition.or_timeout(self.inner.config.default_timeout);
        let resolution = propagation::resolve(&definition, self.current(), &self.inner.config)?;
        let unit = ExecutionUnit::current_thread();

        match resolution {
            Resolution::Join(shared) => {
                tracing::debug!(
                    tx_id = %shared.id(),
                    name = definition.name().unwrap_or(""),
                    "participating in existing transaction"
                );
                Ok(TransactionStatus::new(
                    HandleKind::Participating,
                    Some(shared),
                    None,
                    definition,
                    None,
                    unit,
                ))
            }
            Resolution::Savepoint(shared) => {
                let savepoint = self
                    .inner
                    .driver
                    .create_savepoint(shared.resource())
                    .map_err(|e| TransactionError::system(DriverOperation::CreateSavepoint, e))?;
                tracing::debug!(
                    tx_id = %shared.id(),
                    name = definition.name().unwrap_or(""),
                    savepoint = %savepoint,
                    "created savepoint"
                );
                Ok(TransactionStatus::new(
                    HandleKind::Savepoint,
                    Some(shared),
                    Some(savepoint),
                    definition,
                    None,
                    unit,
                ))
            }
            Resolution::Begin { suspend } => {
                let suspended = self.suspend(suspend)?;
                let shared = match self.begin_physical(&definition) {
                    Ok(shared) => shared,
                    Err(err) => {
                        if let Err(resume_err) = self.restore(Some(suspended)) {
                            tracing::error!(error = %resume_err, "failed to resume after begin failure");
                        }
                        return Err(err);
                    }
                };
                ThreadLocalStore.replace(Some(shared.binding()));
                Ok(TransactionStatus::new(
                    HandleKind::NewTransaction,
                    Some(shared),
                    None,
                    definition,
                    Some(suspended),
                    unit,
                ))
            }
            Resolution::WithoutTransaction { suspend } => {
                let suspended = match suspend {
                    Some(current) => Some(self.suspend(Some(current))?),
                    None => None,
                };
                Ok(TransactionStatus::new(
                    HandleKind::NonTransactional,
                    None,
                    None,
                    definition,
                    suspended,
                    unit,
                ))
            }
        }
    }

    fn begin_physical(
        &self,
        definition: &TransactionDefinition,
    ) -> TransactionResult<Arc<SharedTransaction<D::Transaction>>> {
        let resource = self
            .inner
            .driver
            .begin(definition)
            .map_err(|e| TransactionError::system(DriverOperation::Begin, e))?;
        let shared = Arc::new(SharedTransaction::new(
            self.inner.id,
            resource,
            definition.clone(),
        ));
        tracing::debug!(
            tx_id = %shared.id(),
            name = definition.name().unwrap_or(""),
            definition = %definition,
            "began transaction"
        );
        Ok(shared)
    }

    /// Take whatever the thread holds out of its slot.
    fn suspend(
        &self,
        own: Option<Arc<SharedTransaction<D::Transaction>>>,
    ) -> TransactionResult<Suspended<D::Transaction>> {
        if let Some(tx) = &own {
            self.inner
                .driver
                .suspend(tx.resource())
                .map_err(|e| TransactionError::system(DriverOperation::Suspend, e))?;
            tracing::debug!(tx_id = %tx.id(), "suspended transaction");
        }
        let binding = ThreadLocalStore.replace(None);
        Ok(Suspended {
            binding,
            resume: own,
        })
    }

    /// Put a suspended scope back into the slot. `None` clears the slot.
    fn restore(&self, suspended: Option<Suspended<D::Transaction>>) -> TransactionResult<()> {
        let (binding, resume) = match suspended {
            Some(suspended) => (suspended.binding, suspended.resume),
            None => (None, None),
        };
        ThreadLocalStore.replace(binding);
        if let Some(tx) = resume {
            self.inner
                .driver
                .resume(tx.resource())
                .map_err(|e| TransactionError::system(DriverOperation::Resume, e))?;
            tracing::debug!(tx_id = %tx.id(), "resumed transaction");
        }
        Ok(())
    }

    // ==================== Completion ====================

    /// Commit the handle's scope.
    pub fn commit(
        &self,
        status: &TransactionStatus<D::Transaction>,
    ) -> TransactionResult<CompletionReport> {
        self.complete(status, Outcome::Commit)
    }

    /// Roll back the handle's scope.
    pub fn rollback(
        &self,
        status: &TransactionStatus<D::Transaction>,
    ) -> TransactionResult<CompletionReport> {
        self.complete(status, Outcome::Rollback)
    }

    /// Complete a handle with the requested outcome.
    ///
    /// The handle leaves the active state whatever happens, so a second call
    /// fails with [`TransactionError::NotActive`].
    pub fn complete(
        &self,
        status: &TransactionStatus<D::Transaction>,
        requested: Outcome,
    ) -> TransactionResult<CompletionReport> {
        match status.execution_unit() {
            ExecutionUnit::Thread(thread) if *thread != std::thread::current().id() => {
                return Err(TransactionError::illegal_state(format!(
                    "transaction {} must be completed on the thread that started it",
                    status.display_id()
                )));
            }
            ExecutionUnit::Thread(_) => {}
            ExecutionUnit::Pipeline(_) => {
                return Err(TransactionError::illegal_state(
                    "handle belongs to a pipeline context, complete it with the reactive manager",
                ));
            }
        }

        let mut completion =
            Completion::start(status, requested, &self.inner.config, &ThreadLocalStore)?;
        let driver = &self.inner.driver;
        while let Some(step) = completion.next_step() {
            let result = match step {
                DriverStep::Commit(tx) => driver.commit(tx),
                DriverStep::Rollback(tx) => driver.rollback(tx),
                DriverStep::ReleaseSavepoint(tx, savepoint) => driver.release_savepoint(tx, savepoint),
                DriverStep::RollbackToSavepoint(tx, savepoint) => {
                    driver.rollback_to_savepoint(tx, savepoint)
                }
                DriverStep::Resume(tx) => driver.resume(tx),
            };
            completion.record(result);
        }
        completion.finish()
    }

    // ==================== Convenience ====================

    /// Execute a function within a transaction, automatically committing or rolling back.
    ///
    /// If the function returns Ok, the transaction is committed.
    /// If the function returns Err or panics, the transaction is rolled back.
    pub fn with_transaction<F, R, E>(&self, f: F) -> Result<R, ExecutionError<E>>
    where
        F: FnOnce(&TransactionStatus<D::Transaction>) -> Result<R, E>,
    {
        TransactionTemplate::new(self.clone()).execute(f)
    }

    /// Execute a function within a transaction with a specific definition.
    pub fn with_definition<F, R, E>(
        &self,
        definition: TransactionDefinition,
        f: F,
    ) -> Result<R, ExecutionError<E>>
    where
        F: FnOnce(&TransactionStatus<D::Transaction>) -> Result<R, E>,
    {
        TransactionTemplate::with(self.clone(), definition).execute(f)
    }
}

impl<D: ResourceDriver> fmt::Debug for TransactionManager<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionManager")
            .field("id", &self.inner.id)
            .field("config", &self.inner.config)
            .finish()
    }
}
