//! Transaction manager for asynchronous pipelines.
//!
//! Mirrors [`TransactionManager`](crate::transaction::TransactionManager), but
//! the active transaction lives in the [`TransactionContext`] handed to every
//! call instead of a thread slot, and the driver is awaited. A pipeline may be
//! polled by any worker thread between two calls.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use crate::reactive::operator::Termination;
use crate::resource::{DriverOperation, ReactiveResourceDriver};
use crate::transaction::propagation::{self, Completion, DriverStep, Resolution};
use crate::transaction::status::{HandleKind, SharedTransaction, Suspended};
use crate::transaction::{
    CompletionReport, ContextStore, ExecutionUnit, ManagerConfig, ManagerId, Outcome,
    TransactionContext, TransactionDefinition, TransactionError, TransactionId,
    TransactionResult, TransactionStatus,
};

/// Context-carried transaction manager.
pub struct ReactiveTransactionManager<D: ReactiveResourceDriver> {
    inner: Arc<ReactiveManagerInner<D>>,
}

struct ReactiveManagerInner<D> {
    id: ManagerId,
    driver: D,
    config: ManagerConfig,
}

impl<D: ReactiveResourceDriver> Clone for ReactiveTransactionManager<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: ReactiveResourceDriver> ReactiveTransactionManager<D> {
    pub fn new(driver: D) -> Self {
        Self::with_config(driver, ManagerConfig::default())
    }

    pub fn with_config(driver: D, config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(ReactiveManagerInner {
                id: ManagerId::generate(),
                driver,
                config,
            }),
        }
    }

    pub fn driver(&self) -> &D {
        &self.inner.driver
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    pub fn id(&self) -> ManagerId {
        self.inner.id
    }

    /// Check if `context` holds a transaction started by this manager.
    pub fn has_active_transaction(&self, context: &TransactionContext) -> bool {
        self.current(context).is_some()
    }

    pub fn current_transaction_id(&self, context: &TransactionContext) -> Option<TransactionId> {
        self.current(context).map(|tx| tx.id())
    }

    fn current(
        &self,
        context: &TransactionContext,
    ) -> Option<Arc<SharedTransaction<D::Transaction>>> {
        ContextStore::current(context)
            .and_then(|binding| SharedTransaction::from_binding(&binding, self.inner.id))
    }

    /// Resolve `definition` against the transaction held by `context`.
    pub async fn resolve(
        &self,
        context: &TransactionContext,
        definition: &TransactionDefinition,
    ) -> TransactionResult<TransactionStatus<D::Transaction>> {
        let definition = definition.or_timeout(self.inner.config.default_timeout);
        let resolution =
            propagation::resolve(&definition, self.current(context), &self.inner.config)?;
        let unit = ExecutionUnit::Pipeline(context.clone());

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
                    .await
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
                let pending = self.suspend(context, suspend).await?;
                let shared = match self.begin_physical(&definition).await {
                    Ok(shared) => shared,
                    Err(err) => {
                        if let Err(resume_err) = self.restore(context, pending.release()).await {
                            tracing::error!(error = %resume_err, "failed to resume after begin failure");
                        }
                        return Err(err);
                    }
                };
                context.replace(Some(shared.binding()));
                Ok(TransactionStatus::new(
                    HandleKind::NewTransaction,
                    Some(shared),
                    None,
                    definition,
                    Some(pending.release()),
                    unit,
                ))
            }
            Resolution::WithoutTransaction { suspend } => {
                let suspended = match suspend {
                    Some(current) => Some(self.suspend(context, Some(current)).await?.release()),
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

    async fn begin_physical(
        &self,
        definition: &TransactionDefinition,
    ) -> TransactionResult<Arc<SharedTransaction<D::Transaction>>> {
        let resource = self
            .inner
            .driver
            .begin(definition)
            .await
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

    /// Take whatever the context holds out of it.
    ///
    /// The returned guard puts it back if the caller is dropped before
    /// releasing it.
    async fn suspend(
        &self,
        context: &TransactionContext,
        own: Option<Arc<SharedTransaction<D::Transaction>>>,
    ) -> TransactionResult<PendingSuspension<D>> {
        let mut pending = PendingSuspension {
            manager: self.clone(),
            context: context.clone(),
            suspended: Some(Suspended {
                binding: context.replace(None),
                resume: own.clone(),
            }),
        };
        if let Some(tx) = own {
            if let Err(source) = self.inner.driver.suspend(tx.resource()).await {
                // Nothing was detached at the driver, only the binding goes back.
                if let Some(suspended) = pending.suspended.as_mut() {
                    suspended.resume = None;
                }
                return Err(TransactionError::system(DriverOperation::Suspend, source));
            }
            tracing::debug!(tx_id = %tx.id(), "suspended transaction");
        }
        Ok(pending)
    }

    async fn restore(
        &self,
        context: &TransactionContext,
        suspended: Suspended<D::Transaction>,
    ) -> TransactionResult<()> {
        context.replace(suspended.binding);
        if let Some(tx) = suspended.resume {
            self.inner
                .driver
                .resume(tx.resource())
                .await
                .map_err(|e| TransactionError::system(DriverOperation::Resume, e))?;
            tracing::debug!(tx_id = %tx.id(), "resumed transaction");
        }
        Ok(())
    }

    pub async fn commit(
        &self,
        status: &TransactionStatus<D::Transaction>,
    ) -> TransactionResult<CompletionReport> {
        self.complete(status, Outcome::Commit).await
    }

    pub async fn rollback(
        &self,
        status: &TransactionStatus<D::Transaction>,
    ) -> TransactionResult<CompletionReport> {
        self.complete(status, Outcome::Rollback).await
    }

    /// Complete a handle with the requested outcome.
    ///
    /// The handle's own pipeline context is restored before the driver is
    /// called; no context argument is needed. If the returned future is
    /// dropped halfway, the remaining steps finish in the background.
    pub async fn complete(
        &self,
        status: &TransactionStatus<D::Transaction>,
        requested: Outcome,
    ) -> TransactionResult<CompletionReport> {
        let Some(context) = status.context() else {
            return Err(TransactionError::illegal_state(
                "handle is bound to a thread, complete it with the blocking manager",
            ));
        };
        let completion = Completion::start(status, requested, &self.inner.config, context)?;
        InFlight {
            manager: self.clone(),
            completion: Some(completion),
        }
        .run()
        .await
    }

    /// Roll back a handle whose pipeline was dropped.
    ///
    /// Claiming the handle and restoring its context happen before this
    /// returns; the driver calls run in the background.
    pub(crate) fn cancel(&self, status: &TransactionStatus<D::Transaction>) {
        let Some(context) = status.context() else {
            return;
        };
        match Completion::start(
            status,
            Termination::Cancelled.outcome(),
            &self.inner.config,
            context,
        ) {
            Ok(completion) => {
                tracing::warn!(
                    tx_id = %status.display_id(),
                    "pipeline cancelled, rolling back"
                );
                self.detach(completion);
            }
            Err(err) => {
                tracing::debug!(tx_id = %status.display_id(), error = %err, "cancelled handle already completing");
            }
        }
    }

    fn detach(&self, mut completion: Completion<D::Transaction>) {
        let manager = self.clone();
        run_detached(async move {
            manager.run_steps(&mut completion).await;
            if let Err(err) = completion.finish() {
                tracing::error!(error = %err, "background completion failed");
            }
        });
    }

    async fn run_steps(&self, completion: &mut Completion<D::Transaction>) {
        let driver = &self.inner.driver;
        while let Some(step) = completion.next_step() {
            let result = match step {
                DriverStep::Commit(tx) => driver.commit(tx).await,
                DriverStep::Rollback(tx) => driver.rollback(tx).await,
                DriverStep::ReleaseSavepoint(tx, savepoint) => {
                    driver.release_savepoint(tx, savepoint).await
                }
                DriverStep::RollbackToSavepoint(tx, savepoint) => {
                    driver.rollback_to_savepoint(tx, savepoint).await
                }
                DriverStep::Resume(tx) => driver.resume(tx).await,
            };
            completion.record(result);
        }
    }
}

/// Run `task` on the current runtime, or in place when there is none.
pub(crate) fn run_detached<F>(task: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(task);
        }
        Err(_) => futures::executor::block_on(task),
    }
}

/// Outer scope taken out of a context while `resolve` starts an inner one.
struct PendingSuspension<D: ReactiveResourceDriver> {
    manager: ReactiveTransactionManager<D>,
    context: TransactionContext,
    suspended: Option<Suspended<D::Transaction>>,
}

impl<D: ReactiveResourceDriver> PendingSuspension<D> {
    fn release(mut self) -> Suspended<D::Transaction> {
        self.suspended.take().unwrap_or(Suspended {
            binding: None,
            resume: None,
        })
    }
}

impl<D: ReactiveResourceDriver> Drop for PendingSuspension<D> {
    fn drop(&mut self) {
        let Some(suspended) = self.suspended.take() else {
            return;
        };
        self.context.replace(suspended.binding);
        if let Some(tx) = suspended.resume {
            tracing::warn!(tx_id = %tx.id(), "resolve cancelled, resuming outer transaction");
            let manager = self.manager.clone();
            run_detached(async move {
                if let Err(err) = manager.inner.driver.resume(tx.resource()).await {
                    tracing::error!(tx_id = %tx.id(), error = %err, "resume after cancelled resolve failed");
                }
            });
        }
    }
}

/// A completion owned by a `complete` call.
struct InFlight<D: ReactiveResourceDriver> {
    manager: ReactiveTransactionManager<D>,
    completion: Option<Completion<D::Transaction>>,
}

impl<D: ReactiveResourceDriver> InFlight<D> {
    async fn run(mut self) -> TransactionResult<CompletionReport> {
        if let Some(completion) = self.completion.as_mut() {
            self.manager.run_steps(completion).await;
        }
        match self.completion.take() {
            Some(completion) => completion.finish(),
            None => Err(TransactionError::illegal_state("completion already detached")),
        }
    }
}

impl<D: ReactiveResourceDriver> Drop for InFlight<D> {
    // A driver call interrupted by the drop is issued again.
    fn drop(&mut self) {
        if let Some(completion) = self.completion.take() {
            tracing::warn!("completion interrupted, finishing in background");
            self.manager.detach(completion);
        }
    }
}

impl<D: ReactiveResourceDriver> fmt::Debug for ReactiveTransactionManager<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReactiveTransactionManager")
            .field("id", &self.inner.id)
            .field("config", &self.inner.config)
            .finish()
    }
}
