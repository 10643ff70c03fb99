//! Propagation decisions shared by the thread-bound and the reactive manager.
//!
//! Both managers look up the transaction in their context store, ask
//! [`resolve`] what to do with it, and complete handles through a
//! [`Completion`]. The completion runs every step that does not touch the
//! driver and tells the manager which driver call comes next, so the only
//! thing the two managers do differently is whether that call is awaited.

use std::sync::Arc;

use crate::resource::{DriverOperation, DriverResult, Savepoint};
use crate::transaction::config::ManagerConfig;
use crate::transaction::context::ContextStore;
use crate::transaction::definition::{Propagation, TransactionDefinition};
use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::status::{
    CompletionReport, HandleKind, Outcome, SharedTransaction, TransactionStatus,
};

/// What to do with a definition given the transaction already in scope.
pub(crate) enum Resolution<T> {
    /// Start a physical transaction, detaching `suspend` for its duration.
    Begin {
        suspend: Option<Arc<SharedTransaction<T>>>,
    },
    /// Participate in the existing transaction.
    Join(Arc<SharedTransaction<T>>),
    /// Create a savepoint inside the existing transaction.
    Savepoint(Arc<SharedTransaction<T>>),
    /// Run without a transaction, detaching `suspend` for the duration.
    WithoutTransaction {
        suspend: Option<Arc<SharedTransaction<T>>>,
    },
}

pub(crate) fn resolve<T: Send + Sync + 'static>(
    definition: &TransactionDefinition,
    existing: Option<Arc<SharedTransaction<T>>>,
    config: &ManagerConfig,
) -> TransactionResult<Resolution<T>> {
    use Propagation::*;

    match (definition.propagation(), existing) {
        (Required | RequiresNew | Nested, None) => Ok(Resolution::Begin { suspend: None }),
        (RequiresNew, Some(current)) => Ok(Resolution::Begin {
            suspend: Some(current),
        }),
        (Required | Supports | Mandatory, Some(current)) => {
            validate_join(definition, &current, config)?;
            Ok(Resolution::Join(current))
        }
        (Nested, Some(current)) => {
            if !config.nested_transaction_allowed {
                return Err(TransactionError::NestedTransactionNotSupported {
                    name: definition.name().unwrap_or("<unnamed>").to_string(),
                });
            }
            Ok(Resolution::Savepoint(current))
        }
        (Supports | NotSupported | Never, None) => {
            Ok(Resolution::WithoutTransaction { suspend: None })
        }
        (NotSupported, Some(current)) => Ok(Resolution::WithoutTransaction {
            suspend: Some(current),
        }),
        (Never, Some(current)) => Err(TransactionError::illegal_state(format!(
            "existing transaction {} found for propagation NEVER",
            current.id()
        ))),
        (Mandatory, None) => Err(TransactionError::illegal_state(
            "no existing transaction found for propagation MANDATORY",
        )),
    }
}

fn validate_join<T: Send + Sync + 'static>(
    definition: &TransactionDefinition,
    current: &SharedTransaction<T>,
    config: &ManagerConfig,
) -> TransactionResult<()> {
    if !config.validate_existing_transaction {
        return Ok(());
    }

    let existing = current.definition();
    if definition.isolation().is_specified() && definition.isolation() != existing.isolation() {
        return Err(TransactionError::illegal_state(format!(
            "participating definition [{}] requests isolation {} but transaction {} runs with {}",
            definition,
            definition.isolation(),
            current.id(),
            existing.isolation()
        )));
    }
    if !definition.is_read_only() && existing.is_read_only() {
        return Err(TransactionError::illegal_state(format!(
            "participating definition [{}] is not read-only but transaction {} is",
            definition,
            current.id()
        )));
    }
    Ok(())
}

/// Physical step a completion request turns into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    Commit,
    Rollback,
    ReleaseSavepoint,
    RollbackToSavepoint,
    MarkRollbackOnly,
    Nothing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct CompletionPlan {
    pub(crate) action: Action,
    pub(crate) performed: Outcome,
}

impl CompletionPlan {
    fn new(action: Action, performed: Outcome) -> Self {
        Self { action, performed }
    }
}

pub(crate) fn plan_completion<T: Send + Sync + 'static>(
    status: &TransactionStatus<T>,
    requested: Outcome,
    config: &ManagerConfig,
) -> TransactionResult<CompletionPlan> {
    let commit = requested == Outcome::Commit && !status.is_rollback_only();

    let plan = match status.kind() {
        HandleKind::NewTransaction if commit => CompletionPlan::new(Action::Commit, Outcome::Commit),
        HandleKind::NewTransaction => CompletionPlan::new(Action::Rollback, Outcome::Rollback),
        HandleKind::Savepoint if commit => {
            CompletionPlan::new(Action::ReleaseSavepoint, Outcome::Commit)
        }
        HandleKind::Savepoint => CompletionPlan::new(Action::RollbackToSavepoint, Outcome::Rollback),
        HandleKind::Participating => match requested {
            Outcome::Commit if status.is_global_rollback_only() => {
                if config.fail_early_on_global_rollback_only {
                    return Err(TransactionError::UnexpectedRollback {
                        tx_id: status.display_id(),
                    });
                }
                CompletionPlan::new(Action::Nothing, Outcome::Rollback)
            }
            Outcome::Commit => CompletionPlan::new(Action::Nothing, Outcome::Commit),
            Outcome::Rollback if config.global_rollback_on_participation_failure => {
                CompletionPlan::new(Action::MarkRollbackOnly, Outcome::Rollback)
            }
            Outcome::Rollback => CompletionPlan::new(Action::Nothing, Outcome::Rollback),
        },
        HandleKind::NonTransactional if commit => {
            CompletionPlan::new(Action::Nothing, Outcome::Commit)
        }
        HandleKind::NonTransactional => CompletionPlan::new(Action::Nothing, Outcome::Rollback),
    };

    if requested == Outcome::Commit && plan.performed == Outcome::Rollback {
        tracing::warn!(
            tx_id = %status.display_id(),
            name = status.name().unwrap_or(""),
            scope = ?status.scope(),
            "commit requested on rollback-only scope, rolling back instead"
        );
    }

    Ok(plan)
}

/// Driver call a [`Completion`] is waiting for.
pub(crate) enum DriverStep<'a, T> {
    Commit(&'a T),
    Rollback(&'a T),
    ReleaseSavepoint(&'a T, &'a Savepoint),
    RollbackToSavepoint(&'a T, &'a Savepoint),
    Resume(&'a T),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Commit,
    Rollback,
    RollbackAfterFailedCommit,
    ReleaseSavepoint,
    RollbackToSavepoint,
    Resume,
    Done,
}

impl Stage {
    fn operation(self) -> DriverOperation {
        match self {
            Stage::Commit => DriverOperation::Commit,
            Stage::Rollback | Stage::RollbackAfterFailedCommit | Stage::Done => {
                DriverOperation::Rollback
            }
            Stage::ReleaseSavepoint => DriverOperation::ReleaseSavepoint,
            Stage::RollbackToSavepoint => DriverOperation::RollbackToSavepoint,
            Stage::Resume => DriverOperation::Resume,
        }
    }
}

/// One in-flight completion of a handle.
///
/// [`Completion::start`] claims the handle, runs before-commit callbacks and
/// puts the outer scope back into the context store. The manager then feeds
/// each [`DriverStep`] to its driver and hands the result to
/// [`Completion::record`] until no step is left, and calls
/// [`Completion::finish`], which settles the handle and runs the after-phase
/// callbacks.
pub(crate) struct Completion<T> {
    status: TransactionStatus<T>,
    requested: Outcome,
    rollback_on_commit_failure: bool,
    stage: Stage,
    performed: Outcome,
    /// What is known to have happened at the driver; `None` when unknown.
    outcome: Option<Outcome>,
    failure: Option<TransactionError>,
    resume: Option<Arc<SharedTransaction<T>>>,
    resume_failure: Option<TransactionError>,
}

impl<T: Send + Sync + 'static> Completion<T> {
    pub(crate) fn start<S: ContextStore>(
        status: &TransactionStatus<T>,
        requested: Outcome,
        config: &ManagerConfig,
        store: &S,
    ) -> TransactionResult<Self> {
        status.claim()?;
        let plan = match plan_completion(status, requested, config) {
            Ok(plan) => plan,
            Err(err) => {
                status.finish(Outcome::Rollback);
                return Err(err);
            }
        };

        let mut completion = Self {
            status: status.clone(),
            requested,
            rollback_on_commit_failure: config.rollback_on_commit_failure,
            stage: Stage::Done,
            performed: plan.performed,
            outcome: Some(plan.performed),
            failure: None,
            resume: None,
            resume_failure: None,
        };

        completion.stage = match plan.action {
            Action::Commit => completion.before_commit(),
            Action::Rollback => Stage::Rollback,
            Action::ReleaseSavepoint | Action::RollbackToSavepoint
                if status.savepoint().is_none() =>
            {
                status.finish(Outcome::Rollback);
                return Err(TransactionError::illegal_state(
                    "nested handle without savepoint",
                ));
            }
            Action::ReleaseSavepoint => Stage::ReleaseSavepoint,
            Action::RollbackToSavepoint => Stage::RollbackToSavepoint,
            Action::MarkRollbackOnly => {
                if let Some(shared) = status.shared() {
                    shared.mark_rollback_only();
                }
                Stage::Done
            }
            Action::Nothing => Stage::Done,
        };

        // The scope stops being current before any driver call is made.
        if let Some(suspended) = status.take_suspended() {
            store.replace(suspended.binding);
            completion.resume = suspended.resume;
        }
        if completion.stage == Stage::Done && completion.resume.is_some() {
            completion.stage = Stage::Resume;
        }
        Ok(completion)
    }

    fn before_commit(&mut self) -> Stage {
        let Some(shared) = self.status.shared() else {
            return Stage::Commit;
        };
        match shared.synchronizations().trigger_before_commit() {
            Ok(()) => Stage::Commit,
            Err((listener, source)) => {
                self.failure = Some(TransactionError::BeforeCommitFailed {
                    tx_id: shared.id().to_string(),
                    listener,
                    source,
                });
                self.performed = Outcome::Rollback;
                Stage::Rollback
            }
        }
    }

    /// The next driver call, `None` once the driver has nothing left to do.
    pub(crate) fn next_step(&self) -> Option<DriverStep<'_, T>> {
        let resource = self.status.transaction();
        match self.stage {
            Stage::Commit => resource.map(DriverStep::Commit),
            Stage::Rollback | Stage::RollbackAfterFailedCommit => {
                resource.map(DriverStep::Rollback)
            }
            Stage::ReleaseSavepoint => Some(DriverStep::ReleaseSavepoint(
                resource?,
                self.status.savepoint()?,
            )),
            Stage::RollbackToSavepoint => Some(DriverStep::RollbackToSavepoint(
                resource?,
                self.status.savepoint()?,
            )),
            Stage::Resume => self
                .resume
                .as_deref()
                .map(|tx| DriverStep::Resume(tx.resource())),
            Stage::Done => None,
        }
    }

    /// Take the result of the driver call returned by [`Completion::next_step`].
    pub(crate) fn record(&mut self, result: DriverResult<()>) {
        let stage = self.stage;
        let tx_id = self.status.display_id();
        let result = result.map_err(|source| TransactionError::system(stage.operation(), source));

        match (stage, result) {
            (Stage::Commit, Ok(())) => {
                self.performed = Outcome::Commit;
                self.outcome = Some(Outcome::Commit);
            }
            (Stage::Commit, Err(err)) => {
                self.failure = Some(err);
                self.performed = Outcome::Rollback;
                self.outcome = None;
                if self.rollback_on_commit_failure {
                    self.stage = Stage::RollbackAfterFailedCommit;
                    return;
                }
            }
            (Stage::Rollback | Stage::RollbackAfterFailedCommit, Ok(())) => {
                self.performed = Outcome::Rollback;
                self.outcome = Some(Outcome::Rollback);
            }
            (Stage::Rollback, Err(err)) => {
                tracing::error!(tx_id = %tx_id, error = %err, "rollback failed");
                self.failure.get_or_insert(err);
                self.performed = Outcome::Rollback;
                self.outcome = None;
            }
            (Stage::RollbackAfterFailedCommit, Err(err)) => {
                tracing::error!(tx_id = %tx_id, error = %err, "rollback after failed commit failed");
                self.outcome = None;
            }
            (Stage::ReleaseSavepoint, Ok(())) => {
                self.performed = Outcome::Commit;
                tracing::debug!(tx_id = %tx_id, "released savepoint");
            }
            (Stage::RollbackToSavepoint, Ok(())) => {
                self.performed = Outcome::Rollback;
                tracing::debug!(tx_id = %tx_id, "rolled back to savepoint");
            }
            (Stage::ReleaseSavepoint | Stage::RollbackToSavepoint, Err(err)) => {
                // The outer transaction can no longer be trusted.
                if let Some(shared) = self.status.shared() {
                    shared.mark_rollback_only();
                }
                self.failure = Some(err);
                self.performed = Outcome::Rollback;
            }
            (Stage::Resume, Ok(())) => {
                if let Some(tx) = &self.resume {
                    tracing::debug!(tx_id = %tx.id(), "resumed transaction");
                }
            }
            (Stage::Resume, Err(err)) => self.resume_failure = Some(err),
            (Stage::Done, _) => {}
        }

        self.stage = match stage {
            Stage::Resume | Stage::Done => Stage::Done,
            _ if self.resume.is_some() => Stage::Resume,
            _ => Stage::Done,
        };
    }

    /// Settle the handle and run the after-phase callbacks.
    pub(crate) fn finish(self) -> TransactionResult<CompletionReport> {
        let status = &self.status;
        status.finish(self.performed);

        if status.kind() == HandleKind::NewTransaction {
            if let Some(shared) = status.shared() {
                shared.synchronizations().trigger_after_completion(self.outcome);
            }
        }
        tracing::debug!(
            tx_id = %status.display_id(),
            name = status.name().unwrap_or(""),
            requested = %self.requested,
            performed = %self.performed,
            scope = ?status.scope(),
            "completed"
        );

        if let Some(err) = self.failure.or(self.resume_failure) {
            return Err(err);
        }
        Ok(CompletionReport {
            requested: self.requested,
            performed: self.performed,
            scope: status.scope(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::status::{CompletionState, ExecutionUnit, ManagerId, Suspended};
    use crate::transaction::{IsolationLevel, TransactionContext};

    fn shared(definition: TransactionDefinition) -> Arc<SharedTransaction<()>> {
        Arc::new(SharedTransaction::new(ManagerId::generate(), (), definition))
    }

    fn def(propagation: Propagation) -> TransactionDefinition {
        TransactionDefinition::with_propagation(propagation)
    }

    fn handle(kind: HandleKind, tx: Option<Arc<SharedTransaction<()>>>) -> TransactionStatus<()> {
        TransactionStatus::new(
            kind,
            tx,
            None,
            TransactionDefinition::default(),
            None,
            ExecutionUnit::current_thread(),
        )
    }

    fn outcome_of(
        propagation: Propagation,
        existing: Option<Arc<SharedTransaction<()>>>,
    ) -> TransactionResult<Resolution<()>> {
        resolve(&def(propagation), existing, &ManagerConfig::default())
    }

    #[test]
    fn test_resolution_without_transaction() {
        let begin = |p| matches!(outcome_of(p, None), Ok(Resolution::Begin { suspend: None }));
        let plain = |p| {
            matches!(
                outcome_of(p, None),
                Ok(Resolution::WithoutTransaction { suspend: None })
            )
        };

        assert!(begin(Propagation::Required));
        assert!(begin(Propagation::RequiresNew));
        assert!(begin(Propagation::Nested));
        assert!(plain(Propagation::Supports));
        assert!(plain(Propagation::NotSupported));
        assert!(plain(Propagation::Never));

        let err = outcome_of(Propagation::Mandatory, None).err().unwrap();
        assert!(err.is_illegal_state());
    }

    #[test]
    fn test_resolution_with_transaction() {
        let current = shared(TransactionDefinition::default());
        let with = |p| outcome_of(p, Some(current.clone()));

        assert!(matches!(with(Propagation::Required), Ok(Resolution::Join(_))));
        assert!(matches!(with(Propagation::Supports), Ok(Resolution::Join(_))));
        assert!(matches!(with(Propagation::Mandatory), Ok(Resolution::Join(_))));
        assert!(matches!(with(Propagation::Nested), Ok(Resolution::Savepoint(_))));
        assert!(matches!(
            with(Propagation::RequiresNew),
            Ok(Resolution::Begin { suspend: Some(_) })
        ));
        assert!(matches!(
            with(Propagation::NotSupported),
            Ok(Resolution::WithoutTransaction { suspend: Some(_) })
        ));
        assert!(with(Propagation::Never).err().unwrap().is_illegal_state());
    }

    #[test]
    fn test_nested_disabled() {
        let config = ManagerConfig::new().nested_transaction_allowed(false);
        let err = resolve(
            &def(Propagation::Nested),
            Some(shared(TransactionDefinition::default())),
            &config,
        )
        .err()
        .unwrap();
        assert!(matches!(err, TransactionError::NestedTransactionNotSupported { .. }));
    }

    #[test]
    fn test_join_validation() {
        let config = ManagerConfig::new().validate_existing_transaction(true);
        let read_only = shared(TransactionDefinition::builder().read_only(true).build().unwrap());

        let writer = resolve(&def(Propagation::Required), Some(read_only.clone()), &config);
        assert!(writer.err().unwrap().is_illegal_state());

        let reader = TransactionDefinition::builder().read_only(true).build().unwrap();
        assert!(matches!(
            resolve(&reader, Some(read_only), &config),
            Ok(Resolution::Join(_))
        ));

        let serializable = TransactionDefinition::builder()
            .isolation(IsolationLevel::Serializable)
            .build()
            .unwrap();
        let plain = shared(TransactionDefinition::default());
        assert!(resolve(&serializable, Some(plain.clone()), &config).is_err());
        assert!(resolve(&serializable, Some(plain), &ManagerConfig::default()).is_ok());
    }

    #[test]
    fn test_plan_new_transaction() {
        let config = ManagerConfig::default();
        let owner = handle(HandleKind::NewTransaction, Some(shared(TransactionDefinition::default())));

        let plan = plan_completion(&owner, Outcome::Commit, &config).unwrap();
        assert_eq!(plan.action, Action::Commit);

        owner.set_rollback_only();
        let plan = plan_completion(&owner, Outcome::Commit, &config).unwrap();
        assert_eq!(plan, CompletionPlan::new(Action::Rollback, Outcome::Rollback));
    }

    #[test]
    fn test_plan_participant() {
        let config = ManagerConfig::default();
        let tx = shared(TransactionDefinition::default());
        let participant = handle(HandleKind::Participating, Some(tx.clone()));

        let plan = plan_completion(&participant, Outcome::Rollback, &config).unwrap();
        assert_eq!(plan.action, Action::MarkRollbackOnly);

        let lenient = config.clone().global_rollback_on_participation_failure(false);
        let plan = plan_completion(&participant, Outcome::Rollback, &lenient).unwrap();
        assert_eq!(plan.action, Action::Nothing);

        tx.mark_rollback_only();
        let plan = plan_completion(&participant, Outcome::Commit, &config).unwrap();
        assert_eq!(plan, CompletionPlan::new(Action::Nothing, Outcome::Rollback));

        let strict = config.fail_early_on_global_rollback_only(true);
        let err = plan_completion(&participant, Outcome::Commit, &strict).unwrap_err();
        assert!(matches!(err, TransactionError::UnexpectedRollback { .. }));
    }

    #[test]
    fn test_plan_savepoint_uses_local_flag() {
        let config = ManagerConfig::default();
        let nested = handle(HandleKind::Savepoint, Some(shared(TransactionDefinition::default())));

        let plan = plan_completion(&nested, Outcome::Commit, &config).unwrap();
        assert_eq!(plan.action, Action::ReleaseSavepoint);

        nested.set_rollback_only();
        let plan = plan_completion(&nested, Outcome::Commit, &config).unwrap();
        assert_eq!(plan.action, Action::RollbackToSavepoint);
    }

    fn requires_new(
        inner: &Arc<SharedTransaction<()>>,
        outer: &Arc<SharedTransaction<()>>,
    ) -> TransactionStatus<()> {
        TransactionStatus::new(
            HandleKind::NewTransaction,
            Some(inner.clone()),
            None,
            TransactionDefinition::default(),
            Some(Suspended {
                binding: Some(outer.binding()),
                resume: Some(outer.clone()),
            }),
            ExecutionUnit::current_thread(),
        )
    }

    #[test]
    fn test_completion_restores_scope_before_driver_calls() {
        let context = TransactionContext::new();
        let outer = shared(TransactionDefinition::default());
        let inner = shared(TransactionDefinition::default());
        let status = requires_new(&inner, &outer);
        context.replace(Some(inner.binding()));

        let mut completion =
            Completion::start(&status, Outcome::Rollback, &ManagerConfig::default(), &context)
                .unwrap();
        assert_eq!(context.transaction_id(), Some(outer.id()));
        assert_eq!(status.state(), CompletionState::Completing);

        let again = Completion::start(&status, Outcome::Commit, &ManagerConfig::default(), &context);
        assert!(matches!(
            again.err().unwrap(),
            TransactionError::NotActive { state: CompletionState::Completing, .. }
        ));

        assert!(matches!(completion.next_step(), Some(DriverStep::Rollback(_))));
        completion.record(Ok(()));
        assert!(matches!(completion.next_step(), Some(DriverStep::Resume(_))));
        completion.record(Ok(()));
        assert!(completion.next_step().is_none());

        let report = completion.finish().unwrap();
        assert_eq!(report.performed, Outcome::Rollback);
        assert_eq!(status.state(), CompletionState::RolledBack);
    }

    #[test]
    fn test_completion_after_failed_commit() {
        let context = TransactionContext::new();
        let config = ManagerConfig::new().rollback_on_commit_failure(true);
        let status = handle(HandleKind::NewTransaction, Some(shared(TransactionDefinition::default())));

        let mut completion = Completion::start(&status, Outcome::Commit, &config, &context).unwrap();
        assert!(matches!(completion.next_step(), Some(DriverStep::Commit(_))));
        completion.record(Err("disk full".into()));
        assert!(matches!(completion.next_step(), Some(DriverStep::Rollback(_))));
        completion.record(Ok(()));
        assert!(completion.next_step().is_none());

        let err = completion.finish().unwrap_err();
        assert!(err.is_system_failure());
        assert_eq!(status.state(), CompletionState::RolledBack);
    }
}
