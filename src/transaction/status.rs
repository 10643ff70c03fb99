//! Transaction handles.
//!
//! A [`TransactionStatus`] is what a unit of work holds while it runs. Several
//! statuses can point at the same physical transaction: the one that started
//! it (the owner) and any number of participants that joined it or created a
//! savepoint inside it. Only the owner commits or rolls back the physical
//! transaction; participants can only push it towards rollback.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::ThreadId;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use ulid::Ulid;

use crate::events::SynchronizationRegistry;
use crate::resource::Savepoint;
use crate::transaction::context::{Binding, TransactionContext};
use crate::transaction::definition::TransactionDefinition;
use crate::transaction::error::{TransactionError, TransactionResult};

/// Unique id of a physical transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransactionId(Ulid);

impl TransactionId {
    pub(crate) fn generate() -> Self {
        Self(Ulid::new())
    }

    pub fn as_ulid(&self) -> Ulid {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_string().to_lowercase())
    }
}

/// Identity of a transaction manager instance; bindings remember their owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ManagerId(Ulid);

impl ManagerId {
    pub(crate) fn generate() -> Self {
        Self(Ulid::new())
    }
}

impl fmt::Display for ManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_string().to_lowercase())
    }
}

/// Lifecycle of a handle. Leaves `Active` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionState {
    Active,
    /// Claimed by a completion whose driver calls are still running.
    Completing,
    Committed,
    RolledBack,
}

impl fmt::Display for CompletionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompletionState::Active => write!(f, "active"),
            CompletionState::Completing => write!(f, "completing"),
            CompletionState::Committed => write!(f, "committed"),
            CompletionState::RolledBack => write!(f, "rolled back"),
        }
    }
}

/// Commit or rollback, as requested by a caller or as performed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Commit,
    Rollback,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Commit => write!(f, "commit"),
            Outcome::Rollback => write!(f, "rollback"),
        }
    }
}

/// What a completed handle actually acted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompletionScope {
    /// The handle owned the physical transaction.
    Physical,
    /// The handle owned a savepoint inside an outer transaction.
    Savepoint,
    /// The handle joined an outer transaction; the owner decides.
    Participating,
    /// The handle ran without a transaction.
    NonTransactional,
}

/// Result of completing a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompletionReport {
    pub requested: Outcome,
    pub performed: Outcome,
    pub scope: CompletionScope,
}

impl CompletionReport {
    /// Commit was requested but rollback-only forced a rollback.
    pub fn rollback_converted(&self) -> bool {
        self.requested == Outcome::Commit && self.performed == Outcome::Rollback
    }

    pub fn is_committed(&self) -> bool {
        self.performed == Outcome::Commit
    }
}

/// Where a handle's transaction is recorded while it runs.
#[derive(Debug, Clone)]
pub enum ExecutionUnit {
    /// Bound to the thread that resolved it.
    Thread(ThreadId),
    /// Carried by an explicit pipeline context.
    Pipeline(TransactionContext),
}

impl ExecutionUnit {
    pub(crate) fn current_thread() -> Self {
        ExecutionUnit::Thread(std::thread::current().id())
    }
}

/// Physical transaction shared by its owner and every participant.
pub(crate) struct SharedTransaction<T> {
    id: TransactionId,
    owner: ManagerId,
    resource: T,
    definition: TransactionDefinition,
    started_at: DateTime<Utc>,
    deadline: Option<DateTime<Utc>>,
    rollback_only: AtomicBool,
    synchronizations: Arc<SynchronizationRegistry>,
}

impl<T: Send + Sync + 'static> SharedTransaction<T> {
    pub(crate) fn new(owner: ManagerId, resource: T, definition: TransactionDefinition) -> Self {
        let id = TransactionId::generate();
        let started_at = Utc::now();
        let deadline = definition
            .timeout()
            .and_then(|t| chrono::Duration::from_std(t).ok())
            .and_then(|t| started_at.checked_add_signed(t));
        Self {
            id,
            owner,
            resource,
            definition,
            started_at,
            deadline,
            rollback_only: AtomicBool::new(false),
            synchronizations: Arc::new(SynchronizationRegistry::new(id)),
        }
    }

    /// Recover the transaction behind a binding, if `owner` created it.
    pub(crate) fn from_binding(binding: &Binding, owner: ManagerId) -> Option<Arc<Self>> {
        if binding.owner() != owner {
            return None;
        }
        binding.transaction().clone().downcast::<Self>().ok()
    }

    pub(crate) fn binding(self: &Arc<Self>) -> Binding {
        let transaction: Arc<dyn Any + Send + Sync> = self.clone();
        Binding::new(self.owner, self.id, transaction, self.synchronizations.clone())
    }

    pub(crate) fn id(&self) -> TransactionId {
        self.id
    }

    pub(crate) fn resource(&self) -> &T {
        &self.resource
    }

    pub(crate) fn definition(&self) -> &TransactionDefinition {
        &self.definition
    }

    pub(crate) fn synchronizations(&self) -> &Arc<SynchronizationRegistry> {
        &self.synchronizations
    }

    pub(crate) fn mark_rollback_only(&self) {
        self.rollback_only.store(true, Ordering::Release);
    }

    pub(crate) fn is_rollback_only(&self) -> bool {
        self.rollback_only.load(Ordering::Acquire)
    }
}

/// Relationship of a handle to the physical transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandleKind {
    NewTransaction,
    Participating,
    Savepoint,
    NonTransactional,
}

impl HandleKind {
    pub(crate) fn scope(self) -> CompletionScope {
        match self {
            HandleKind::NewTransaction => CompletionScope::Physical,
            HandleKind::Participating => CompletionScope::Participating,
            HandleKind::Savepoint => CompletionScope::Savepoint,
            HandleKind::NonTransactional => CompletionScope::NonTransactional,
        }
    }
}

/// Outer scope taken out of the context store while a handle runs.
pub(crate) struct Suspended<T> {
    /// Whatever the store held, restored as-is on completion.
    pub(crate) binding: Option<Binding>,
    /// Own transaction detached through the driver; needs a resume call.
    pub(crate) resume: Option<Arc<SharedTransaction<T>>>,
}

struct StatusInner<T> {
    transaction: Option<Arc<SharedTransaction<T>>>,
    kind: HandleKind,
    savepoint: Option<Savepoint>,
    definition: TransactionDefinition,
    rollback_only: AtomicBool,
    state: Mutex<CompletionState>,
    suspended: Mutex<Option<Suspended<T>>>,
    unit: ExecutionUnit,
}

/// Handle on one (possibly nested) transactional scope.
///
/// Cloning is cheap and every clone refers to the same scope, so a reactive
/// unit of work can hold the handle across await points.
pub struct TransactionStatus<T> {
    inner: Arc<StatusInner<T>>,
}

impl<T> Clone for TransactionStatus<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> TransactionStatus<T> {
    pub(crate) fn new(
        kind: HandleKind,
        transaction: Option<Arc<SharedTransaction<T>>>,
        savepoint: Option<Savepoint>,
        definition: TransactionDefinition,
        suspended: Option<Suspended<T>>,
        unit: ExecutionUnit,
    ) -> Self {
        Self {
            inner: Arc::new(StatusInner {
                transaction,
                kind,
                savepoint,
                definition,
                rollback_only: AtomicBool::new(false),
                state: Mutex::new(CompletionState::Active),
                suspended: Mutex::new(suspended),
                unit,
            }),
        }
    }

    /// Id of the physical transaction, `None` when running without one.
    pub fn id(&self) -> Option<TransactionId> {
        self.inner.transaction.as_ref().map(|t| t.id())
    }

    /// Diagnostic name from the definition.
    pub fn name(&self) -> Option<&str> {
        self.inner.definition.name()
    }

    /// The definition this handle was resolved from.
    pub fn definition(&self) -> &TransactionDefinition {
        &self.inner.definition
    }

    /// The driver's physical transaction, `None` when running without one.
    pub fn transaction(&self) -> Option<&T> {
        self.inner.transaction.as_deref().map(SharedTransaction::resource)
    }

    pub fn has_transaction(&self) -> bool {
        self.inner.transaction.is_some()
    }

    /// True if this handle started the physical transaction.
    pub fn is_new_transaction(&self) -> bool {
        self.inner.kind == HandleKind::NewTransaction
    }

    pub fn has_savepoint(&self) -> bool {
        self.inner.savepoint.is_some()
    }

    pub fn savepoint(&self) -> Option<&Savepoint> {
        self.inner.savepoint.as_ref()
    }

    pub fn scope(&self) -> CompletionScope {
        self.inner.kind.scope()
    }

    /// Force the eventual outcome to rollback.
    ///
    /// Owners and joined participants mark the shared transaction; a savepoint
    /// or non-transactional handle only marks itself. The flag is never
    /// cleared.
    pub fn set_rollback_only(&self) {
        match (self.inner.kind, &self.inner.transaction) {
            (HandleKind::NewTransaction | HandleKind::Participating, Some(transaction)) => {
                transaction.mark_rollback_only();
            }
            _ => self.inner.rollback_only.store(true, Ordering::Release),
        }
    }

    /// Check the local flag and the shared one.
    pub fn is_rollback_only(&self) -> bool {
        self.inner.rollback_only.load(Ordering::Acquire)
            || self
                .inner
                .transaction
                .as_ref()
                .is_some_and(|t| t.is_rollback_only())
    }

    /// True if the shared transaction was marked by any participant.
    pub fn is_global_rollback_only(&self) -> bool {
        self.inner
            .transaction
            .as_ref()
            .is_some_and(|t| t.is_rollback_only())
    }

    pub fn state(&self) -> CompletionState {
        *self.inner.state.lock()
    }

    /// True once the outcome is final. A handle being completed is not.
    pub fn is_completed(&self) -> bool {
        matches!(
            self.state(),
            CompletionState::Committed | CompletionState::RolledBack
        )
    }

    /// When the physical transaction started.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.transaction.as_ref().map(|t| t.started_at)
    }

    /// Deadline derived from the effective timeout. Not enforced here.
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        self.inner.transaction.as_ref().and_then(|t| t.deadline)
    }

    /// Time left until the deadline, zero once it has passed.
    pub fn time_to_live(&self) -> Option<Duration> {
        self.deadline()
            .map(|deadline| (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }

    pub fn execution_unit(&self) -> &ExecutionUnit {
        &self.inner.unit
    }

    /// The pipeline context carrying this handle, for reactive handles.
    pub fn context(&self) -> Option<&TransactionContext> {
        match &self.inner.unit {
            ExecutionUnit::Pipeline(context) => Some(context),
            ExecutionUnit::Thread(_) => None,
        }
    }

    pub(crate) fn kind(&self) -> HandleKind {
        self.inner.kind
    }

    pub(crate) fn shared(&self) -> Option<&Arc<SharedTransaction<T>>> {
        self.inner.transaction.as_ref()
    }

    pub(crate) fn take_suspended(&self) -> Option<Suspended<T>> {
        self.inner.suspended.lock().take()
    }

    /// Move the handle from `Active` to `Completing`.
    ///
    /// Check and transition happen under one lock, so of two concurrent
    /// completions only one gets past this point.
    pub(crate) fn claim(&self) -> TransactionResult<()> {
        let mut state = self.inner.state.lock();
        if *state != CompletionState::Active {
            return Err(TransactionError::NotActive {
                tx_id: self.display_id(),
                state: *state,
            });
        }
        *state = CompletionState::Completing;
        Ok(())
    }

    pub(crate) fn finish(&self, performed: Outcome) {
        *self.inner.state.lock() = match performed {
            Outcome::Commit => CompletionState::Committed,
            Outcome::Rollback => CompletionState::RolledBack,
        };
    }

    pub(crate) fn display_id(&self) -> String {
        self.id()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "<none>".to_string())
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for TransactionStatus<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionStatus")
            .field("id", &self.id())
            .field("name", &self.name())
            .field("scope", &self.scope())
            .field("rollback_only", &self.is_rollback_only())
            .field("state", &self.state())
            .finish()
    }
}
