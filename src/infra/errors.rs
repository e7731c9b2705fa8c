// src/infra/errors.rs — Error types for spendguard

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SpendGuardError {
    // Store errors (retriable)
    #[error("Budget store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    // Lookup errors
    #[error("Budget '{id}' not found")]
    BudgetNotFound { id: String },

    #[error("Scheduled task '{id}' not found")]
    TaskNotFound { id: String },

    #[error("Rule '{id}' not found")]
    RuleNotFound { id: String },

    // Configuration errors (not retriable)
    #[error("Invalid action '{action}': {message}")]
    InvalidAction { action: String, message: String },

    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Unknown trigger type '{0}'")]
    UnknownTrigger(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // Transport errors
    #[error("Notification via {channel} failed: {message}")]
    Notification { channel: String, message: String },

    #[error("Task '{task_id}' timed out after {timeout_ms}ms")]
    Timeout { task_id: String, timeout_ms: u64 },

    // Exhaustion (terminal, expected)
    #[error("Task '{task_id}' exhausted after {attempts} consecutive failures")]
    RetriesExhausted { task_id: String, attempts: u32 },

    #[error("Rule '{rule_id}' exhausted its daily cap of {cap} executions")]
    DailyCapReached { rule_id: String, cap: u32 },

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SpendGuardError {
    /// Transient failures that a later attempt may clear.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            SpendGuardError::StoreUnavailable(_)
                | SpendGuardError::Database(_)
                | SpendGuardError::Notification { .. }
                | SpendGuardError::Timeout { .. }
        )
    }

    /// Terminal, expected conditions (auto-disable, daily cap).
    pub fn is_exhaustion(&self) -> bool {
        matches!(
            self,
            SpendGuardError::RetriesExhausted { .. } | SpendGuardError::DailyCapReached { .. }
        )
    }

    pub fn notification(channel: impl Into<String>, message: impl std::fmt::Display) -> Self {
        SpendGuardError::Notification {
            channel: channel.into(),
            message: message.to_string(),
        }
    }

    pub fn invalid_action(action: impl Into<String>, message: impl Into<String>) -> Self {
        SpendGuardError::InvalidAction {
            action: action.into(),
            message: message.into(),
        }
    }
}

pub type Result<T, E = SpendGuardError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_errors_are_retriable() {
        assert!(SpendGuardError::StoreUnavailable("down".into()).is_retriable());
        assert!(SpendGuardError::notification("email", "smtp refused").is_retriable());
        assert!(SpendGuardError::Timeout {
            task_id: "t".into(),
            timeout_ms: 10
        }
        .is_retriable());
    }

    #[test]
    fn test_config_errors_not_retriable() {
        assert!(!SpendGuardError::invalid_action("reduce_limit", "missing amount").is_retriable());
        assert!(!SpendGuardError::UnknownTrigger("bogus".into()).is_retriable());
    }

    #[test]
    fn test_exhaustion_is_distinguishable() {
        let exhausted = SpendGuardError::RetriesExhausted {
            task_id: "t-1".into(),
            attempts: 3,
        };
        assert!(exhausted.is_exhaustion());
        assert!(!exhausted.is_retriable());
        assert!(exhausted.to_string().contains("exhausted"));

        let capped = SpendGuardError::DailyCapReached {
            rule_id: "r-1".into(),
            cap: 3,
        };
        assert!(capped.is_exhaustion());
        assert!(!SpendGuardError::StoreUnavailable("x".into()).is_exhaustion());
    }
}
