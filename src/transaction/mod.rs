//! Transaction demarcation for blocking code, and the pieces shared with the
//! reactive side.
//!
//! A unit of work describes the transaction it wants with a
//! [`TransactionDefinition`]. The manager resolves the definition against the
//! transaction already active in the caller's execution unit, following the
//! definition's [`Propagation`], and hands back a [`TransactionStatus`]. The
//! handle is later completed with a commit or rollback request.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │        TransactionTemplate / TransactionalOperator          │
//! │     (run a unit of work, map its result to an outcome)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │      TransactionManager / ReactiveTransactionManager        │
//! │   (propagation, suspension, completion, synchronizations)   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!        ┌─────────────────────┼─────────────────────┐
//!        │                     │                     │
//!        ▼                     ▼                     ▼
//!  ┌─────────────┐       ┌─────────────┐       ┌─────────────┐
//!  │ ContextStore│       │ Transaction │       │  Resource   │
//!  │ (per unit)  │       │   Status    │       │   Driver    │
//!  └─────────────┘       └─────────────┘       └─────────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use txscope::resource::MemoryDriver;
//! use txscope::transaction::{Propagation, TransactionDefinition, TransactionManager};
//!
//! let driver = MemoryDriver::new();
//! let manager = TransactionManager::new(driver.clone());
//!
//! // Begin a transaction
//! let outer = manager.resolve(&TransactionDefinition::default())?;
//!
//! // A REQUIRED inner scope joins it
//! let inner = manager.resolve(&TransactionDefinition::with_propagation(Propagation::Required))?;
//! assert_eq!(inner.id(), outer.id());
//! inner.set_rollback_only();
//! manager.commit(&inner)?;
//!
//! // The owner's commit turns into a rollback
//! let report = manager.commit(&outer)?;
//! assert!(report.rollback_converted());
//! # Ok::<(), txscope::transaction::TransactionError>(())
//! ```

pub(crate) mod context;
mod config;
mod definition;
mod error;
mod isolation;
mod manager;
pub(crate) mod propagation;
pub(crate) mod status;
mod template;

pub use config::ManagerConfig;
pub use context::{Binding, ContextStore, ThreadLocalStore, TransactionContext};
pub use definition::{DefinitionBuilder, Propagation, TransactionDefinition};
pub use error::{ExecutionError, TransactionError, TransactionResult};
pub use isolation::IsolationLevel;
pub use manager::TransactionManager;
pub use status::{
    CompletionReport, CompletionScope, CompletionState, ExecutionUnit, ManagerId, Outcome,
    TransactionId, TransactionStatus,
};
pub use template::{Completed, TransactionTemplate};
