//! txscope - transaction demarcation over pluggable resource drivers
//!
//! This crate coordinates units of work against a transactional resource.
//! It decides, per propagation rule, whether a unit of work starts a
//! transaction, joins the active one, nests inside it through a savepoint,
//! or runs without one. It also defers events to transaction completion
//! phases. The physical work is done by a [`resource::ResourceDriver`] or
//! [`resource::ReactiveResourceDriver`].
//!
//! Two execution models share one decision algorithm:
//!
//! - [`transaction::TransactionManager`] binds the active transaction to the
//!   calling thread.
//! - [`reactive::ReactiveTransactionManager`] carries it in an explicit
//!   [`transaction::TransactionContext`] through an async pipeline; dropping
//!   the pipeline early rolls it back.
//!
//! # Example
//!
//! ```
//! use txscope::resource::MemoryDriver;
//! use txscope::transaction::{ExecutionError, TransactionManager};
//!
//! let driver = MemoryDriver::new();
//! let manager = TransactionManager::new(driver.clone());
//!
//! let result: Result<(), ExecutionError<String>> = manager.with_transaction(|status| {
//!     let tx = status.transaction().expect("transaction");
//!     driver.put(tx, "users/1", serde_json::json!({"name": "Alice"})).map_err(|e| e.to_string())?;
//!     Err("validation failed".to_string())
//! });
//!
//! assert!(result.is_err());
//! assert!(driver.is_empty());
//! ```

pub mod events;
pub mod reactive;
pub mod resource;
pub mod transaction;
