//! Transactions for asynchronous pipelines.
//!
//! A pipeline evaluation owns one [`TransactionContext`] and passes it to
//! every transactional step. The context, not the worker thread, decides
//! which transaction is active, so the pipeline is free to hop threads
//! between polls.
//!
//! A pipeline ends in one of three ways ([`Termination`]): it completes, it
//! fails, or it is dropped before finishing. Only completion commits.
//!
//! ```
//! # futures::executor::block_on(async {
//! use txscope::reactive::{ReactiveTransactionManager, TransactionalOperator};
//! use txscope::resource::MemoryDriver;
//! use txscope::transaction::TransactionContext;
//!
//! let driver = MemoryDriver::new();
//! let operator = TransactionalOperator::new(ReactiveTransactionManager::new(driver.clone()));
//! let context = TransactionContext::new();
//!
//! let store = driver.clone();
//! let id = operator
//!     .execute(&context, |status| async move {
//!         store.put(status.transaction().expect("transaction"), "k", serde_json::json!(1))?;
//!         Ok::<_, txscope::resource::MemoryError>(status.id())
//!     })
//!     .await
//!     .unwrap();
//!
//! assert!(id.is_some());
//! assert_eq!(driver.len(), 1);
//! # });
//! ```
//!
//! [`TransactionContext`]: crate::transaction::TransactionContext

mod manager;
mod operator;
mod stream;

pub use manager::ReactiveTransactionManager;
pub use operator::{Termination, TransactionalOperator};
pub use stream::TransactionalStream;
