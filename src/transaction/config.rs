//! Transaction manager configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Behavior switches shared by the thread-bound and reactive managers.
///
/// Deserializes from any serde format; missing fields keep their defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Timeout handed to the driver when a definition carries none.
    #[serde(rename = "default_timeout_secs", with = "timeout_secs")]
    pub default_timeout: Option<Duration>,
    /// Allow NESTED propagation to create savepoints.
    pub nested_transaction_allowed: bool,
    /// Reject joins whose isolation or read-only flag conflicts with the
    /// existing transaction.
    pub validate_existing_transaction: bool,
    /// A rollback request from a participant marks the whole transaction
    /// rollback-only.
    pub global_rollback_on_participation_failure: bool,
    /// A participant's commit request on a rollback-only transaction fails
    /// instead of being reported.
    pub fail_early_on_global_rollback_only: bool,
    /// Roll back when the driver's commit fails.
    pub rollback_on_commit_failure: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_timeout: None,
            nested_transaction_allowed: true,
            validate_existing_transaction: false,
            global_rollback_on_participation_failure: true,
            fail_early_on_global_rollback_only: false,
            rollback_on_commit_failure: false,
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default timeout. A zero duration clears it.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout).filter(|t| !t.is_zero());
        self
    }

    pub fn nested_transaction_allowed(mut self, value: bool) -> Self {
        self.nested_transaction_allowed = value;
        self
    }

    pub fn validate_existing_transaction(mut self, value: bool) -> Self {
        self.validate_existing_transaction = value;
        self
    }

    pub fn global_rollback_on_participation_failure(mut self, value: bool) -> Self {
        self.global_rollback_on_participation_failure = value;
        self
    }

    pub fn fail_early_on_global_rollback_only(mut self, value: bool) -> Self {
        self.fail_early_on_global_rollback_only = value;
        self
    }

    pub fn rollback_on_commit_failure(mut self, value: bool) -> Self {
        self.rollback_on_commit_failure = value;
        self
    }
}

mod timeout_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(timeout) => serializer.serialize_some(&timeout.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.filter(|s| *s > 0).map(Duration::from_secs))
    }
}
