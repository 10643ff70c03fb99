//! Context stores: where the active transaction of an execution unit lives.
//!
//! Each execution unit has exactly one slot holding at most one [`Binding`]:
//!
//! - [`ThreadLocalStore`]: one slot per OS thread, used by the thread-bound
//!   manager.
//! - [`TransactionContext`]: an explicit value owned by one pipeline
//!   evaluation, used by the reactive manager. Clones share the slot, so the
//!   context can travel with a future across worker threads.
//!
//! A slot is set when a manager starts a transaction, cleared or replaced when
//! the transaction completes or is suspended, and restored bit-for-bit when the
//! suspended scope resumes.

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::events::SynchronizationRegistry;
use crate::transaction::status::{ManagerId, TransactionId};

/// Record of the transaction active in one execution unit.
#[derive(Clone)]
pub struct Binding {
    owner: ManagerId,
    transaction_id: TransactionId,
    transaction: Arc<dyn Any + Send + Sync>,
    synchronizations: Arc<SynchronizationRegistry>,
}

impl Binding {
    pub(crate) fn new(
        owner: ManagerId,
        transaction_id: TransactionId,
        transaction: Arc<dyn Any + Send + Sync>,
        synchronizations: Arc<SynchronizationRegistry>,
    ) -> Self {
        Self {
            owner,
            transaction_id,
            transaction,
            synchronizations,
        }
    }

    /// Manager that started the bound transaction.
    pub fn owner(&self) -> ManagerId {
        self.owner
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }

    /// Check if both bindings refer to the same physical transaction object.
    pub fn same_as(&self, other: &Binding) -> bool {
        Arc::ptr_eq(&self.transaction, &other.transaction)
    }

    pub(crate) fn transaction(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.transaction
    }

    pub(crate) fn synchronizations(&self) -> &Arc<SynchronizationRegistry> {
        &self.synchronizations
    }
}

impl fmt::Debug for Binding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Binding")
            .field("owner", &self.owner)
            .field("transaction_id", &self.transaction_id)
            .finish()
    }
}

/// A slot holding the active transaction of one execution unit.
pub trait ContextStore {
    /// The binding currently in the slot.
    fn current(&self) -> Option<Binding>;

    /// Put `binding` in the slot and return what was there.
    fn replace(&self, binding: Option<Binding>) -> Option<Binding>;
}

thread_local! {
    static THREAD_BINDING: RefCell<Option<Binding>> = const { RefCell::new(None) };
}

/// The calling thread's slot.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadLocalStore;

impl ContextStore for ThreadLocalStore {
    fn current(&self) -> Option<Binding> {
        THREAD_BINDING.with(|slot| slot.borrow().clone())
    }

    fn replace(&self, binding: Option<Binding>) -> Option<Binding> {
        THREAD_BINDING.with(|slot| std::mem::replace(&mut *slot.borrow_mut(), binding))
    }
}

tokio::task_local! {
    static AMBIENT_CONTEXT: TransactionContext;
}

/// Transaction slot carried explicitly through an asynchronous pipeline.
///
/// Create one per top-level pipeline evaluation and hand it to every
/// operator in that pipeline; nested operators find the outer transaction
/// through it. Clones share the same slot.
#[derive(Clone, Default)]
pub struct TransactionContext {
    slot: Arc<Mutex<Option<Binding>>>,
}

impl TransactionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a transaction is active in this context.
    pub fn has_transaction(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Id of the active transaction, if any.
    pub fn transaction_id(&self) -> Option<TransactionId> {
        self.slot.lock().as_ref().map(Binding::transaction_id)
    }

    /// Check if both values share one slot.
    pub fn same_as(&self, other: &TransactionContext) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    /// Run `future` with this context installed as the task's ambient context.
    pub async fn scope<F: Future>(&self, future: F) -> F::Output {
        AMBIENT_CONTEXT.scope(self.clone(), future).await
    }

    /// Run `f` with this context installed as the ambient context.
    pub fn sync_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        AMBIENT_CONTEXT.sync_scope(self.clone(), f)
    }

    /// The ambient context installed by [`TransactionContext::scope`], if any.
    pub fn ambient() -> Option<TransactionContext> {
        AMBIENT_CONTEXT.try_with(Clone::clone).ok()
    }
}

impl ContextStore for TransactionContext {
    fn current(&self) -> Option<Binding> {
        self.slot.lock().clone()
    }

    fn replace(&self, binding: Option<Binding>) -> Option<Binding> {
        std::mem::replace(&mut *self.slot.lock(), binding)
    }
}

impl fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionContext")
            .field("transaction_id", &self.transaction_id())
            .finish()
    }
}

/// Synchronizations of the transaction active where the caller runs.
///
/// Inside an ambient pipeline context only that context counts; the thread
/// slot of whichever worker happens to poll the task is ignored.
pub(crate) fn active_synchronizations() -> Option<Arc<SynchronizationRegistry>> {
    match TransactionContext::ambient() {
        Some(context) => context_synchronizations(&context),
        None => ThreadLocalStore
            .current()
            .map(|binding| binding.synchronizations().clone()),
    }
}

pub(crate) fn context_synchronizations(
    context: &TransactionContext,
) -> Option<Arc<SynchronizationRegistry>> {
    ContextStore::current(context).map(|binding| binding.synchronizations().clone())
}
