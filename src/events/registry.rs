//! Per-transaction synchronization callbacks.
//!
//! Every physical transaction owns one [`SynchronizationRegistry`]. Deferred
//! listener invocations are queued here at publish time and drained by the
//! owning manager when the transaction completes.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::events::phase::TransactionPhase;
use crate::transaction::{Outcome, TransactionId};

/// Error raised by a listener callback.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub(crate) type SynchronizationCallback = Box<dyn FnOnce() -> Result<(), ListenerError> + Send>;

/// A listener failure that did not change the transaction's outcome.
#[derive(Debug)]
pub struct ListenerFailure {
    pub listener: String,
    pub phase: TransactionPhase,
    /// `None` when the listener ran without a transaction.
    pub transaction: Option<TransactionId>,
    pub error: ListenerError,
}

impl fmt::Display for ListenerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener '{}' failed in {}", self.listener, self.phase)?;
        if let Some(tx) = self.transaction {
            write!(f, " of transaction {}", tx)?;
        }
        write!(f, ": {}", self.error)
    }
}

/// Receives listener failures that cannot be surfaced to a caller.
pub trait FailureObserver: Send + Sync {
    fn listener_failed(&self, failure: &ListenerFailure);
}

impl<F> FailureObserver for F
where
    F: Fn(&ListenerFailure) + Send + Sync,
{
    fn listener_failed(&self, failure: &ListenerFailure) {
        self(failure)
    }
}

/// Default observer: logs the failure.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingObserver;

impl FailureObserver for LoggingObserver {
    fn listener_failed(&self, failure: &ListenerFailure) {
        tracing::error!(
            listener = %failure.listener,
            phase = %failure.phase,
            tx_id = ?failure.transaction.map(|id| id.to_string()),
            error = %failure.error,
            "transactional listener failed"
        );
    }
}

struct PendingSynchronization {
    phase: TransactionPhase,
    listener: String,
    observer: Arc<dyn FailureObserver>,
    callback: SynchronizationCallback,
}

/// Deferred callbacks of one physical transaction, bucketed by phase.
pub struct SynchronizationRegistry {
    transaction_id: TransactionId,
    pending: Mutex<Vec<PendingSynchronization>>,
}

impl SynchronizationRegistry {
    pub(crate) fn new(transaction_id: TransactionId) -> Self {
        Self {
            transaction_id,
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// Number of callbacks waiting for completion.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub(crate) fn register(
        &self,
        phase: TransactionPhase,
        listener: String,
        observer: Arc<dyn FailureObserver>,
        callback: SynchronizationCallback,
    ) {
        self.pending.lock().push(PendingSynchronization {
            phase,
            listener,
            observer,
            callback,
        });
    }

    /// Run before-commit callbacks, stopping at the first failure.
    ///
    /// Callbacks registered by a before-commit callback run in the same pass.
    pub(crate) fn trigger_before_commit(&self) -> Result<(), (String, ListenerError)> {
        loop {
            let batch = self.take_phase(TransactionPhase::BeforeCommit);
            if batch.is_empty() {
                return Ok(());
            }
            for pending in batch {
                (pending.callback)().map_err(|err| (pending.listener, err))?;
            }
        }
    }

    /// Run the after-phase callbacks matching `outcome`, then after-completion.
    ///
    /// `None` means the physical outcome is unknown (the driver failed), in
    /// which case only after-completion callbacks run. Every remaining
    /// callback is discarded afterwards.
    pub(crate) fn trigger_after_completion(&self, outcome: Option<Outcome>) {
        let pending = std::mem::take(&mut *self.pending.lock());
        let target = match outcome {
            Some(Outcome::Commit) => Some(TransactionPhase::AfterCommit),
            Some(Outcome::Rollback) => Some(TransactionPhase::AfterRollback),
            None => None,
        };

        let (completion, outcome_bound): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .filter(|p| Some(p.phase) == target || p.phase == TransactionPhase::AfterCompletion)
            .partition(|p| p.phase == TransactionPhase::AfterCompletion);

        for pending in outcome_bound.into_iter().chain(completion) {
            self.invoke_isolated(pending);
        }
    }

    fn invoke_isolated(&self, pending: PendingSynchronization) {
        if let Err(error) = (pending.callback)() {
            pending.observer.listener_failed(&ListenerFailure {
                listener: pending.listener,
                phase: pending.phase,
                transaction: Some(self.transaction_id),
                error,
            });
        }
    }

    fn take_phase(&self, phase: TransactionPhase) -> Vec<PendingSynchronization> {
        let mut pending = self.pending.lock();
        let (taken, rest): (Vec<_>, Vec<_>) = pending.drain(..).partition(|p| p.phase == phase);
        *pending = rest;
        taken
    }
}

impl fmt::Debug for SynchronizationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SynchronizationRegistry")
            .field("transaction_id", &self.transaction_id)
            .field("pending", &self.pending_count())
            .finish()
    }
}
