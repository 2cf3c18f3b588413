//! Execution types for the Cygni worker
//!
//! These types only exist while a build runs. They are not persisted or
//! sent over the network as is.

use cygni_core::domain::build::{BuildOutcome, FailureKind};

/// How a single build execution ended
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionResult {
    Succeeded { image_ref: String },
    Failed { kind: FailureKind, reason: String },
    /// Stopped on request; carries the error if stopping the process failed
    Cancelled { termination_error: Option<String> },
    TimedOut { after_secs: u64 },
}

impl ExecutionResult {
    pub fn infrastructure(reason: impl Into<String>) -> Self {
        Self::Failed {
            kind: FailureKind::Infrastructure,
            reason: reason.into(),
        }
    }

    pub fn build_logic(reason: impl Into<String>) -> Self {
        Self::Failed {
            kind: FailureKind::BuildLogic,
            reason: reason.into(),
        }
    }

    /// The outcome reported through `complete`; `None` for a cancellation,
    /// which is acknowledged instead
    pub fn into_outcome(self) -> Option<BuildOutcome> {
        match self {
            ExecutionResult::Succeeded { image_ref } => Some(BuildOutcome::Succeeded { image_ref }),
            ExecutionResult::Failed { kind, reason } => Some(BuildOutcome::Failed { kind, reason }),
            // The executor did not finish in time; another attempt may
            ExecutionResult::TimedOut { after_secs } => Some(BuildOutcome::Failed {
                kind: FailureKind::Infrastructure,
                reason: format!("build timed out after {}s", after_secs),
            }),
            ExecutionResult::Cancelled { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_reported_as_infrastructure_failure() {
        let outcome = ExecutionResult::TimedOut { after_secs: 1800 }.into_outcome();
        assert_eq!(
            outcome,
            Some(BuildOutcome::Failed {
                kind: FailureKind::Infrastructure,
                reason: "build timed out after 1800s".to_string(),
            })
        );
    }

    #[test]
    fn test_cancellation_has_no_outcome() {
        let result = ExecutionResult::Cancelled {
            termination_error: Some("kill failed".to_string()),
        };
        assert_eq!(result.into_outcome(), None);
    }

    #[test]
    fn test_success_carries_image() {
        let outcome = ExecutionResult::Succeeded {
            image_ref: "localhost:5000/web:abc123".to_string(),
        }
        .into_outcome();
        assert!(matches!(
            outcome,
            Some(BuildOutcome::Succeeded { ref image_ref }) if image_ref == "localhost:5000/web:abc123"
        ));
    }
}
