//! Phase-bound event dispatch.
//!
//! Events published while a transaction is active are not delivered right
//! away. They are queued on the transaction's [`SynchronizationRegistry`] and
//! delivered by the manager when the matching completion phase is reached:
//!
//! ```text
//! commit:   BeforeCommit -> (physical commit) -> AfterCommit   -> AfterCompletion
//! rollback:                  (physical rollback) -> AfterRollback -> AfterCompletion
//! ```
//!
//! Outside a transaction a listener either runs at publish time or never,
//! depending on its fallback flag.

mod dispatcher;
mod phase;
mod registry;

pub use dispatcher::{EventDispatcher, Listener, Publication};
pub use phase::TransactionPhase;
pub use registry::{
    FailureObserver, ListenerError, ListenerFailure, LoggingObserver, SynchronizationRegistry,
};
