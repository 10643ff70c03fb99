use std::fmt;

/// Point in a transaction's completion at which a listener runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TransactionPhase {
    /// Right before the physical commit. A failure here aborts the commit.
    BeforeCommit,
    /// After a successful commit.
    #[default]
    AfterCommit,
    /// After a rollback.
    AfterRollback,
    /// After the transaction finished, whatever the outcome.
    AfterCompletion,
}

impl TransactionPhase {
    /// Check if this phase runs once the outcome is already decided.
    pub fn is_after_completion(&self) -> bool {
        !matches!(self, TransactionPhase::BeforeCommit)
    }
}

impl fmt::Display for TransactionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionPhase::BeforeCommit => "BEFORE_COMMIT",
            TransactionPhase::AfterCommit => "AFTER_COMMIT",
            TransactionPhase::AfterRollback => "AFTER_ROLLBACK",
            TransactionPhase::AfterCompletion => "AFTER_COMPLETION",
        };
        f.write_str(name)
    }
}
