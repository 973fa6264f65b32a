//! Orchestrator-level error rollup.
//!
//! Retry, exhaustion, and abort are outcome values, never errors. Only
//! configuration faults, store faults, signature faults, and invalid
//! state transitions surface as `Err`.

use thiserror::Error;

use crate::loops::state::InvalidTransition;
use crate::memory::{InvalidId, MemoryError};
use crate::plan::GraphError;
use crate::policy::PolicyError;
use crate::signal::SignalError;

/// Hard failures surfaced by `run` on any orchestrator.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    #[error("configuration: {0}")]
    Policy(#[from] PolicyError),

    #[error("configuration: {0}")]
    Graph(#[from] GraphError),

    #[error("configuration: {0}")]
    Id(#[from] InvalidId),

    #[error("memory store: {0}")]
    Store(#[from] MemoryError),

    #[error("signal protocol: {0}")]
    Signal(#[from] SignalError),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("loop state: {0}")]
    Transition(#[from] InvalidTransition),

    #[error("iteration cap violated: {0}")]
    CapViolation(String),
}

impl OrchestrationError {
    /// Whether the failure is a configuration fault (fatal, no retry).
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Policy(_) | Self::Graph(_) | Self::Id(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_classification() {
        let err: OrchestrationError = PolicyError::NoAgents.into();
        assert!(err.is_configuration());

        let err: OrchestrationError = GraphError::Cycle {
            node: "a".to_string(),
        }
        .into();
        assert!(err.is_configuration());

        let err: OrchestrationError = MemoryError::Backend("down".to_string()).into();
        assert!(!err.is_configuration());
    }
}
