//! Transaction definitions.
//!
//! A [`TransactionDefinition`] describes the transaction a unit of work wants:
//! how it relates to an already active transaction ([`Propagation`]), the
//! isolation level, an optional timeout, the read-only hint and a diagnostic
//! name. Definitions are immutable once built.

use std::fmt;
use std::time::Duration;

use crate::transaction::error::{TransactionError, TransactionResult};
use crate::transaction::isolation::IsolationLevel;

/// How a unit of work relates to a transaction that is already active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Propagation {
    /// Join the active transaction, or start one.
    #[default]
    Required,
    /// Always start a fresh transaction, suspending the active one.
    RequiresNew,
    /// Run inside a savepoint of the active transaction, or start one.
    Nested,
    /// Join the active transaction, or run without one.
    Supports,
    /// Run without a transaction, suspending the active one.
    NotSupported,
    /// Run without a transaction; fail if one is active.
    Never,
    /// Join the active transaction; fail if there is none.
    Mandatory,
}

impl fmt::Display for Propagation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Propagation::Required => "REQUIRED",
            Propagation::RequiresNew => "REQUIRES_NEW",
            Propagation::Nested => "NESTED",
            Propagation::Supports => "SUPPORTS",
            Propagation::NotSupported => "NOT_SUPPORTED",
            Propagation::Never => "NEVER",
            Propagation::Mandatory => "MANDATORY",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Propagation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| !matches!(c, '_' | ' ' | '-'))
            .collect::<String>()
            .to_uppercase();
        match normalized.as_str() {
            "REQUIRED" => Ok(Propagation::Required),
            "REQUIRESNEW" => Ok(Propagation::RequiresNew),
            "NESTED" => Ok(Propagation::Nested),
            "SUPPORTS" => Ok(Propagation::Supports),
            "NOTSUPPORTED" => Ok(Propagation::NotSupported),
            "NEVER" => Ok(Propagation::Never),
            "MANDATORY" => Ok(Propagation::Mandatory),
            _ => Err(format!("unknown propagation: {}", s)),
        }
    }
}

/// Immutable description of the transaction a unit of work requires.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TransactionDefinition {
    propagation: Propagation,
    isolation: IsolationLevel,
    timeout: Option<Duration>,
    read_only: bool,
    name: Option<String>,
}

impl TransactionDefinition {
    /// Start building a definition from the defaults.
    pub fn builder() -> DefinitionBuilder {
        DefinitionBuilder::default()
    }

    /// Shorthand for a default definition with another propagation.
    pub fn with_propagation(propagation: Propagation) -> Self {
        Self {
            propagation,
            ..Default::default()
        }
    }

    pub fn propagation(&self) -> Propagation {
        self.propagation
    }

    pub fn isolation(&self) -> IsolationLevel {
        self.isolation
    }

    /// Requested timeout, always positive when present.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Diagnostic name.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Copy of this definition with `timeout` filled in when none was requested.
    pub(crate) fn or_timeout(&self, timeout: Option<Duration>) -> Self {
        let mut definition = self.clone();
        if definition.timeout.is_none() {
            definition.timeout = timeout.filter(|t| !t.is_zero());
        }
        definition
    }
}

impl fmt::Display for TransactionDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.propagation)?;
        if self.isolation.is_specified() {
            write!(f, ", ISOLATION {}", self.isolation)?;
        }
        if let Some(timeout) = self.timeout {
            write!(f, ", TIMEOUT {}ms", timeout.as_millis())?;
        }
        if self.read_only {
            write!(f, ", READ ONLY")?;
        }
        Ok(())
    }
}

/// Builder for [`TransactionDefinition`].
#[derive(Debug, Clone, Default)]
pub struct DefinitionBuilder {
    definition: TransactionDefinition,
}

impl DefinitionBuilder {
    pub fn propagation(mut self, propagation: Propagation) -> Self {
        self.definition.propagation = propagation;
        self
    }

    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.definition.isolation = isolation;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.definition.timeout = Some(timeout);
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.definition.read_only = value;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.definition.name = Some(name.into());
        self
    }

    /// Finish the definition.
    ///
    /// Fails with [`TransactionError::InvalidTimeout`] for a zero timeout.
    pub fn build(self) -> TransactionResult<TransactionDefinition> {
        if self.definition.timeout.is_some_and(|t| t.is_zero()) {
            return Err(TransactionError::InvalidTimeout);
        }
        Ok(self.definition)
    }
}
