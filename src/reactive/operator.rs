use std::fmt;
use std::future::Future;

use futures::TryStream;

use crate::reactive::manager::ReactiveTransactionManager;
use crate::reactive::stream::TransactionalStream;
use crate::resource::ReactiveResourceDriver;
use crate::transaction::{
    Completed, CompletionState, ExecutionError, Outcome, TransactionContext,
    TransactionDefinition, TransactionStatus,
};

/// How a transactional pipeline ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Termination {
    /// Every value was produced.
    Completed,
    /// The pipeline produced an error.
    Failed,
    /// The pipeline was dropped before it finished.
    Cancelled,
}

impl Termination {
    /// The outcome a termination maps to. Only completion commits.
    pub fn outcome(self) -> Outcome {
        match self {
            Termination::Completed => Outcome::Commit,
            Termination::Failed | Termination::Cancelled => Outcome::Rollback,
        }
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Completed => write!(f, "completed"),
            Termination::Failed => write!(f, "failed"),
            Termination::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Runs asynchronous units of work inside a transaction.
///
/// Dropping the returned future (or stream) before it finishes rolls the
/// transaction back.
pub struct TransactionalOperator<D: ReactiveResourceDriver> {
    manager: ReactiveTransactionManager<D>,
    definition: TransactionDefinition,
}

impl<D: ReactiveResourceDriver> TransactionalOperator<D> {
    pub fn new(manager: ReactiveTransactionManager<D>) -> Self {
        Self::with(manager, TransactionDefinition::default())
    }

    pub fn with(manager: ReactiveTransactionManager<D>, definition: TransactionDefinition) -> Self {
        Self {
            manager,
            definition,
        }
    }

    pub fn with_definition(&self, definition: TransactionDefinition) -> Self {
        Self::with(self.manager.clone(), definition)
    }

    pub fn definition(&self) -> &TransactionDefinition {
        &self.definition
    }

    pub fn manager(&self) -> &ReactiveTransactionManager<D> {
        &self.manager
    }

    /// Run a single-value unit of work in `context`.
    pub async fn execute<F, Fut, R, E>(
        &self,
        context: &TransactionContext,
        work: F,
    ) -> Result<R, ExecutionError<E>>
    where
        F: FnOnce(TransactionStatus<D::Transaction>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        self.execute_reported(context, work)
            .await
            .map(|completed| completed.value)
    }

    /// Like [`TransactionalOperator::execute`], also reporting what completion did.
    pub async fn execute_reported<F, Fut, R, E>(
        &self,
        context: &TransactionContext,
        work: F,
    ) -> Result<Completed<R>, ExecutionError<E>>
    where
        F: FnOnce(TransactionStatus<D::Transaction>) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let status = self.manager.resolve(context, &self.definition).await?;
        let _guard = CancellationGuard::new(self.manager.clone(), status.clone());

        let result = context.scope(work(status.clone())).await;
        let termination = match &result {
            Ok(_) => Termination::Completed,
            Err(_) => Termination::Failed,
        };
        let completion = self.manager.complete(&status, termination.outcome()).await;

        match (result, completion) {
            (Ok(value), Ok(report)) => Ok(Completed { value, report }),
            (Ok(_), Err(err)) => Err(ExecutionError::Transaction(err)),
            (Err(error), Ok(_)) => Err(ExecutionError::Work(error)),
            (Err(error), Err(rollback_error)) => {
                tracing::error!(
                    tx_id = %status.display_id(),
                    error = %rollback_error,
                    "rollback after failed pipeline failed"
                );
                Err(ExecutionError::RollbackFailed {
                    error,
                    rollback_error,
                })
            }
        }
    }

    /// Run a multi-value unit of work in `context`.
    ///
    /// The transaction commits once the inner stream is exhausted, rolls back
    /// on the first error item, and rolls back if the returned stream is
    /// dropped early.
    pub fn execute_stream<F, S>(&self, context: &TransactionContext, work: F) -> TransactionalStream<D, S>
    where
        F: FnOnce(TransactionStatus<D::Transaction>) -> S + Send + 'static,
        S: TryStream,
    {
        TransactionalStream::new(
            self.manager.clone(),
            context.clone(),
            self.definition.clone(),
            Box::new(work),
        )
    }
}

impl<D: ReactiveResourceDriver> Clone for TransactionalOperator<D> {
    fn clone(&self) -> Self {
        Self::with(self.manager.clone(), self.definition.clone())
    }
}

impl<D: ReactiveResourceDriver> fmt::Debug for TransactionalOperator<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionalOperator")
            .field("definition", &self.definition)
            .finish()
    }
}

/// Rolls back a handle that is still active when the pipeline is dropped.
pub(crate) struct CancellationGuard<D: ReactiveResourceDriver> {
    manager: ReactiveTransactionManager<D>,
    status: TransactionStatus<D::Transaction>,
}

impl<D: ReactiveResourceDriver> CancellationGuard<D> {
    pub(crate) fn new(
        manager: ReactiveTransactionManager<D>,
        status: TransactionStatus<D::Transaction>,
    ) -> Self {
        Self { manager, status }
    }
}

impl<D: ReactiveResourceDriver> Drop for CancellationGuard<D> {
    fn drop(&mut self) {
        if self.status.state() == CompletionState::Active {
            self.manager.cancel(&self.status);
        }
    }
}
