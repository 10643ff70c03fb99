//! In-memory document store driver.
//!
//! Documents are `serde_json::Value`s keyed by string. Each physical
//! transaction stages its writes privately until commit; savepoints are
//! snapshots of the staged writes. Every driver call is journaled and any
//! operation can be made to fail once, which makes this driver the test
//! harness for code built on the coordinator.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use thiserror::Error;

use super::{DriverOperation, DriverResult, ReactiveResourceDriver, ResourceDriver, Savepoint};
use crate::transaction::{IsolationLevel, TransactionDefinition};

/// Errors raised by [`MemoryDriver`].
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Write attempted inside a read-only transaction.
    #[error("transaction {tx} is read-only")]
    ReadOnly { tx: u64 },

    /// Failure requested through [`MemoryDriver::fail_next`].
    #[error("injected failure during {operation}")]
    Injected { operation: DriverOperation },

    /// The savepoint does not belong to the transaction.
    #[error("unknown savepoint {name} in transaction {tx}")]
    UnknownSavepoint { tx: u64, name: String },

    /// Operation on a suspended transaction.
    #[error("transaction {tx} is suspended")]
    Suspended { tx: u64 },
}

/// One journaled driver call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverCall {
    pub operation: DriverOperation,
    pub transaction: u64,
}

type Writes = BTreeMap<String, Option<Value>>;

/// Physical transaction of the [`MemoryDriver`].
#[derive(Debug)]
pub struct MemoryTransaction {
    id: u64,
    read_only: bool,
    isolation: IsolationLevel,
    timeout: Option<Duration>,
    writes: Mutex<Writes>,
    savepoints: Mutex<Vec<(Savepoint, Writes)>>,
    suspended: AtomicBool,
}

impl MemoryTransaction {
    /// Driver-local transaction number.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Timeout handed over at begin.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Acquire)
    }

    /// Number of staged writes.
    pub fn pending_writes(&self) -> usize {
        self.writes.lock().len()
    }

    fn ensure_attached(&self) -> Result<(), MemoryError> {
        if self.is_suspended() {
            return Err(MemoryError::Suspended { tx: self.id });
        }
        Ok(())
    }
}

struct MemoryDriverInner {
    committed: RwLock<BTreeMap<String, Value>>,
    calls: Mutex<Vec<DriverCall>>,
    fail_next: Mutex<HashSet<DriverOperation>>,
    next_tx: AtomicU64,
}

/// In-memory transactional document store.
///
/// Cheap to clone; clones share the same store.
#[derive(Clone)]
pub struct MemoryDriver {
    inner: Arc<MemoryDriverInner>,
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryDriverInner {
                committed: RwLock::new(BTreeMap::new()),
                calls: Mutex::new(Vec::new()),
                fail_next: Mutex::new(HashSet::new()),
                next_tx: AtomicU64::new(1),
            }),
        }
    }

    // ==================== Document Operations ====================

    /// Stage a document write.
    pub fn put(
        &self,
        tx: &MemoryTransaction,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), MemoryError> {
        tx.ensure_attached()?;
        if tx.read_only {
            return Err(MemoryError::ReadOnly { tx: tx.id });
        }
        tx.writes.lock().insert(key.into(), Some(value));
        Ok(())
    }

    /// Stage a document removal.
    pub fn delete(&self, tx: &MemoryTransaction, key: &str) -> Result<(), MemoryError> {
        tx.ensure_attached()?;
        if tx.read_only {
            return Err(MemoryError::ReadOnly { tx: tx.id });
        }
        tx.writes.lock().insert(key.to_string(), None);
        Ok(())
    }

    /// Read a document, seeing the transaction's own staged writes first.
    pub fn get(&self, tx: Option<&MemoryTransaction>, key: &str) -> Option<Value> {
        if let Some(tx) = tx {
            if let Some(staged) = tx.writes.lock().get(key) {
                return staged.clone();
            }
        }
        self.committed(key)
    }

    /// Read a committed document, ignoring every open transaction.
    pub fn committed(&self, key: &str) -> Option<Value> {
        self.inner.committed.read().get(key).cloned()
    }

    /// Number of committed documents.
    pub fn len(&self) -> usize {
        self.inner.committed.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ==================== Test Support ====================

    /// Make the next call of `operation` fail.
    pub fn fail_next(&self, operation: DriverOperation) {
        self.inner.fail_next.lock().insert(operation);
    }

    /// Every driver call made so far, in order.
    pub fn calls(&self) -> Vec<DriverCall> {
        self.inner.calls.lock().clone()
    }

    /// Operations of the journal, without transaction numbers.
    pub fn operations(&self) -> Vec<DriverOperation> {
        self.inner.calls.lock().iter().map(|c| c.operation).collect()
    }

    /// Number of journaled calls of `operation`.
    pub fn count(&self, operation: DriverOperation) -> usize {
        self.inner
            .calls
            .lock()
            .iter()
            .filter(|c| c.operation == operation)
            .count()
    }

    // ==================== Physical Operations ====================

    fn record(&self, operation: DriverOperation, transaction: u64) -> Result<(), MemoryError> {
        self.inner.calls.lock().push(DriverCall {
            operation,
            transaction,
        });
        if self.inner.fail_next.lock().remove(&operation) {
            return Err(MemoryError::Injected { operation });
        }
        Ok(())
    }

    fn do_begin(&self, definition: &TransactionDefinition) -> Result<MemoryTransaction, MemoryError> {
        let id = self.inner.next_tx.fetch_add(1, Ordering::Relaxed);
        self.record(DriverOperation::Begin, id)?;
        Ok(MemoryTransaction {
            id,
            read_only: definition.is_read_only(),
            isolation: definition.isolation(),
            timeout: definition.timeout(),
            writes: Mutex::new(BTreeMap::new()),
            savepoints: Mutex::new(Vec::new()),
            suspended: AtomicBool::new(false),
        })
    }

    fn do_commit(&self, tx: &MemoryTransaction) -> Result<(), MemoryError> {
        self.record(DriverOperation::Commit, tx.id)?;
        tx.ensure_attached()?;
        let writes = std::mem::take(&mut *tx.writes.lock());
        let mut committed = self.inner.committed.write();
        for (key, value) in writes {
            match value {
                Some(value) => {
                    committed.insert(key, value);
                }
                None => {
                    committed.remove(&key);
                }
            }
        }
        tx.savepoints.lock().clear();
        Ok(())
    }

    fn do_rollback(&self, tx: &MemoryTransaction) -> Result<(), MemoryError> {
        self.record(DriverOperation::Rollback, tx.id)?;
        tx.writes.lock().clear();
        tx.savepoints.lock().clear();
        Ok(())
    }

    fn do_create_savepoint(&self, tx: &MemoryTransaction) -> Result<Savepoint, MemoryError> {
        self.record(DriverOperation::CreateSavepoint, tx.id)?;
        tx.ensure_attached()?;
        let snapshot = tx.writes.lock().clone();
        let mut savepoints = tx.savepoints.lock();
        let savepoint = Savepoint::new(format!("sp{}", savepoints.len() + 1));
        savepoints.push((savepoint.clone(), snapshot));
        Ok(savepoint)
    }

    fn do_rollback_to_savepoint(
        &self,
        tx: &MemoryTransaction,
        savepoint: &Savepoint,
    ) -> Result<(), MemoryError> {
        self.record(DriverOperation::RollbackToSavepoint, tx.id)?;
        let mut savepoints = tx.savepoints.lock();
        let position = savepoints
            .iter()
            .position(|(sp, _)| sp == savepoint)
            .ok_or_else(|| MemoryError::UnknownSavepoint {
                tx: tx.id,
                name: savepoint.name().to_string(),
            })?;
        // Later savepoints are discarded together with the one rolled back to.
        let mut discarded = savepoints.split_off(position);
        let (_, snapshot) = discarded.swap_remove(0);
        *tx.writes.lock() = snapshot;
        Ok(())
    }

    fn do_release_savepoint(
        &self,
        tx: &MemoryTransaction,
        savepoint: &Savepoint,
    ) -> Result<(), MemoryError> {
        self.record(DriverOperation::ReleaseSavepoint, tx.id)?;
        let mut savepoints = tx.savepoints.lock();
        let position = savepoints
            .iter()
            .position(|(sp, _)| sp == savepoint)
            .ok_or_else(|| MemoryError::UnknownSavepoint {
                tx: tx.id,
                name: savepoint.name().to_string(),
            })?;
        savepoints.truncate(position);
        Ok(())
    }

    fn do_suspend(&self, tx: &MemoryTransaction) -> Result<(), MemoryError> {
        self.record(DriverOperation::Suspend, tx.id)?;
        tx.suspended.store(true, Ordering::Release);
        Ok(())
    }

    fn do_resume(&self, tx: &MemoryTransaction) -> Result<(), MemoryError> {
        self.record(DriverOperation::Resume, tx.id)?;
        tx.suspended.store(false, Ordering::Release);
        Ok(())
    }
}

impl std::fmt::Debug for MemoryDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDriver")
            .field("documents", &self.len())
            .field("calls", &self.inner.calls.lock().len())
            .finish()
    }
}

impl ResourceDriver for MemoryDriver {
    type Transaction = MemoryTransaction;

    fn begin(&self, definition: &TransactionDefinition) -> DriverResult<MemoryTransaction> {
        Ok(self.do_begin(definition)?)
    }

    fn commit(&self, transaction: &MemoryTransaction) -> DriverResult<()> {
        Ok(self.do_commit(transaction)?)
    }

    fn rollback(&self, transaction: &MemoryTransaction) -> DriverResult<()> {
        Ok(self.do_rollback(transaction)?)
    }

    fn create_savepoint(&self, transaction: &MemoryTransaction) -> DriverResult<Savepoint> {
        Ok(self.do_create_savepoint(transaction)?)
    }

    fn rollback_to_savepoint(
        &self,
        transaction: &MemoryTransaction,
        savepoint: &Savepoint,
    ) -> DriverResult<()> {
        Ok(self.do_rollback_to_savepoint(transaction, savepoint)?)
    }

    fn release_savepoint(
        &self,
        transaction: &MemoryTransaction,
        savepoint: &Savepoint,
    ) -> DriverResult<()> {
        Ok(self.do_release_savepoint(transaction, savepoint)?)
    }

    fn suspend(&self, transaction: &MemoryTransaction) -> DriverResult<()> {
        Ok(self.do_suspend(transaction)?)
    }

    fn resume(&self, transaction: &MemoryTransaction) -> DriverResult<()> {
        Ok(self.do_resume(transaction)?)
    }
}

#[async_trait]
impl ReactiveResourceDriver for MemoryDriver {
    type Transaction = MemoryTransaction;

    async fn begin(&self, definition: &TransactionDefinition) -> DriverResult<MemoryTransaction> {
        Ok(self.do_begin(definition)?)
    }

    async fn commit(&self, transaction: &MemoryTransaction) -> DriverResult<()> {
        Ok(self.do_commit(transaction)?)
    }

    async fn rollback(&self, transaction: &MemoryTransaction) -> DriverResult<()> {
        Ok(self.do_rollback(transaction)?)
    }

    async fn create_savepoint(&self, transaction: &MemoryTransaction) -> DriverResult<Savepoint> {
        Ok(self.do_create_savepoint(transaction)?)
    }

    async fn rollback_to_savepoint(
        &self,
        transaction: &MemoryTransaction,
        savepoint: &Savepoint,
    ) -> DriverResult<()> {
        Ok(self.do_rollback_to_savepoint(transaction, savepoint)?)
    }

    async fn release_savepoint(
        &self,
        transaction: &MemoryTransaction,
        savepoint: &Savepoint,
    ) -> DriverResult<()> {
        Ok(self.do_release_savepoint(transaction, savepoint)?)
    }

    async fn suspend(&self, transaction: &MemoryTransaction) -> DriverResult<()> {
        Ok(self.do_suspend(transaction)?)
    }

    async fn resume(&self, transaction: &MemoryTransaction) -> DriverResult<()> {
        Ok(self.do_resume(transaction)?)
    }
}
