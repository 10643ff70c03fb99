use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::{Stream, TryStream};

use crate::reactive::manager::ReactiveTransactionManager;
use crate::reactive::operator::{CancellationGuard, Termination};
use crate::resource::ReactiveResourceDriver;
use crate::transaction::{
    CompletionReport, ExecutionError, TransactionContext, TransactionDefinition,
    TransactionResult, TransactionStatus,
};

type Work<T, S> = Box<dyn FnOnce(TransactionStatus<T>) -> S + Send>;

enum State<D: ReactiveResourceDriver, S: TryStream> {
    Begin {
        resolving: BoxFuture<'static, TransactionResult<TransactionStatus<D::Transaction>>>,
        work: Work<D::Transaction, S>,
    },
    Streaming {
        inner: Pin<Box<S>>,
        status: TransactionStatus<D::Transaction>,
        guard: CancellationGuard<D>,
    },
    Completing {
        completion: BoxFuture<'static, TransactionResult<CompletionReport>>,
        error: Option<S::Error>,
        guard: CancellationGuard<D>,
    },
    Done,
}

/// Multi-value pipeline running inside a transaction.
///
/// Created by [`TransactionalOperator::execute_stream`]. The transaction is
/// started on the first poll and committed only after the inner stream is
/// exhausted. The first error item rolls back and is yielded as
/// [`ExecutionError::Work`], after which the stream ends. Dropping the stream
/// before that rolls back.
///
/// [`TransactionalOperator::execute_stream`]: crate::reactive::TransactionalOperator::execute_stream
pub struct TransactionalStream<D: ReactiveResourceDriver, S: TryStream> {
    manager: ReactiveTransactionManager<D>,
    context: TransactionContext,
    state: State<D, S>,
}

// Never pin-projected: the inner stream is boxed and pinned separately.
impl<D: ReactiveResourceDriver, S: TryStream> Unpin for TransactionalStream<D, S> {}

impl<D: ReactiveResourceDriver, S: TryStream> TransactionalStream<D, S> {
    pub(crate) fn new(
        manager: ReactiveTransactionManager<D>,
        context: TransactionContext,
        definition: TransactionDefinition,
        work: Work<D::Transaction, S>,
    ) -> Self {
        let resolver = manager.clone();
        let resolve_in = context.clone();
        let resolving: BoxFuture<'static, _> =
            Box::pin(async move { resolver.resolve(&resolve_in, &definition).await });
        Self {
            manager,
            context,
            state: State::Begin { resolving, work },
        }
    }

    /// The handle of the running transaction, once it has been started.
    pub fn status(&self) -> Option<&TransactionStatus<D::Transaction>> {
        match &self.state {
            State::Streaming { status, .. } => Some(status),
            _ => None,
        }
    }

    fn completion(
        &self,
        status: TransactionStatus<D::Transaction>,
        termination: Termination,
    ) -> BoxFuture<'static, TransactionResult<CompletionReport>> {
        let manager = self.manager.clone();
        Box::pin(async move { manager.complete(&status, termination.outcome()).await })
    }
}

impl<D: ReactiveResourceDriver, S: TryStream> Stream for TransactionalStream<D, S> {
    type Item = Result<S::Ok, ExecutionError<S::Error>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match std::mem::replace(&mut this.state, State::Done) {
                State::Begin {
                    mut resolving,
                    work,
                } => match resolving.as_mut().poll(cx) {
                    Poll::Pending => {
                        this.state = State::Begin { resolving, work };
                        return Poll::Pending;
                    }
                    Poll::Ready(Err(err)) => {
                        return Poll::Ready(Some(Err(ExecutionError::Transaction(err))));
                    }
                    Poll::Ready(Ok(status)) => {
                        let guard = CancellationGuard::new(this.manager.clone(), status.clone());
                        let inner = this.context.sync_scope(|| work(status.clone()));
                        this.state = State::Streaming {
                            inner: Box::pin(inner),
                            status,
                            guard,
                        };
                    }
                },
                State::Streaming {
                    mut inner,
                    status,
                    guard,
                } => match this.context.sync_scope(|| inner.as_mut().try_poll_next(cx)) {
                    Poll::Pending => {
                        this.state = State::Streaming {
                            inner,
                            status,
                            guard,
                        };
                        return Poll::Pending;
                    }
                    Poll::Ready(Some(Ok(value))) => {
                        this.state = State::Streaming {
                            inner,
                            status,
                            guard,
                        };
                        return Poll::Ready(Some(Ok(value)));
                    }
                    Poll::Ready(Some(Err(error))) => {
                        this.state = State::Completing {
                            completion: this.completion(status, Termination::Failed),
                            error: Some(error),
                            guard,
                        };
                    }
                    Poll::Ready(None) => {
                        this.state = State::Completing {
                            completion: this.completion(status, Termination::Completed),
                            error: None,
                            guard,
                        };
                    }
                },
                State::Completing {
                    mut completion,
                    error,
                    guard,
                } => match completion.as_mut().poll(cx) {
                    Poll::Pending => {
                        this.state = State::Completing {
                            completion,
                            error,
                            guard,
                        };
                        return Poll::Pending;
                    }
                    Poll::Ready(result) => {
                        drop(guard);
                        return Poll::Ready(match (result, error) {
                            (Ok(_), None) => None,
                            (Ok(_), Some(error)) => Some(Err(ExecutionError::Work(error))),
                            (Err(err), None) => Some(Err(ExecutionError::Transaction(err))),
                            (Err(rollback_error), Some(error)) => {
                                Some(Err(ExecutionError::RollbackFailed {
                                    error,
                                    rollback_error,
                                }))
                            }
                        });
                    }
                },
                State::Done => return Poll::Ready(None),
            }
        }
    }
}
