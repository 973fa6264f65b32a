//! Structured telemetry — typed events emitted on state transitions.
//!
//! Orchestrators write named events with typed payloads to a
//! [`TelemetrySink`]; there are no duck-typed listeners. Sinks must not
//! block: the broadcast sink drops events when no receiver keeps up.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::info;

use crate::loops::state::{LoopLevel, LoopStep};

/// Channel capacity for the broadcast sink.
const CHANNEL_CAPACITY: usize = 256;

/// Every event the orchestrators emit.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    EpicStarted {
        epic_id: String,
    },
    EpicFinished {
        epic_id: String,
        outcome: String,
    },
    PhaseStarted {
        epic_id: String,
        phase_id: String,
    },
    PhaseFinished {
        epic_id: String,
        phase_id: String,
        outcome: String,
    },
    SprintStarted {
        sprint_id: String,
        scope: String,
    },
    SprintBlocked {
        sprint_id: String,
        failed_dependency: String,
    },
    SprintFinished {
        sprint_id: String,
        outcome: String,
        loop3_iter: u32,
        loop2_iter: u32,
    },
    LoopTransition {
        sprint_id: String,
        from: LoopStep,
        to: LoopStep,
        reason: String,
    },
    ConfidenceEvaluated {
        sprint_id: String,
        loop3_iter: u32,
        min: f64,
        avg: f64,
        missing: usize,
        passed: bool,
    },
    ConsensusEvaluated {
        scope_id: String,
        loop2_iter: u32,
        approval_rate: f64,
        avg_confidence: f64,
        passed: bool,
    },
    FeedbackInjected {
        sprint_id: String,
        loop2_iter: u32,
        reason_count: usize,
    },
    CapExtended {
        sprint_id: String,
        level: LoopLevel,
        new_cap: u32,
    },
    BreakerTripped {
        scope_id: String,
        breaker: String,
    },
    SignalAcknowledged {
        coordinator_id: String,
        signal_id: String,
        iteration: u64,
    },
    SecurityFault {
        coordinator_id: String,
        signal_id: String,
    },
}

impl OrchestratorEvent {
    /// Snake_case name of the event variant.
    pub fn name(&self) -> &'static str {
        match self {
            Self::EpicStarted { .. } => "epic_started",
            Self::EpicFinished { .. } => "epic_finished",
            Self::PhaseStarted { .. } => "phase_started",
            Self::PhaseFinished { .. } => "phase_finished",
            Self::SprintStarted { .. } => "sprint_started",
            Self::SprintBlocked { .. } => "sprint_blocked",
            Self::SprintFinished { .. } => "sprint_finished",
            Self::LoopTransition { .. } => "loop_transition",
            Self::ConfidenceEvaluated { .. } => "confidence_evaluated",
            Self::ConsensusEvaluated { .. } => "consensus_evaluated",
            Self::FeedbackInjected { .. } => "feedback_injected",
            Self::CapExtended { .. } => "cap_extended",
            Self::BreakerTripped { .. } => "breaker_tripped",
            Self::SignalAcknowledged { .. } => "signal_acknowledged",
            Self::SecurityFault { .. } => "security_fault",
        }
    }
}

/// Where orchestrators write their events.
pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: &OrchestratorEvent);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn emit(&self, _event: &OrchestratorEvent) {}
}

/// Logs each event as a structured `tracing` record.
#[derive(Debug, Default)]
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn emit(&self, event: &OrchestratorEvent) {
        let payload = serde_json::to_string(event).unwrap_or_default();
        info!(event = event.name(), %payload, "orchestrator event");
    }
}

/// Fans events out to in-process subscribers over a broadcast channel.
pub struct BroadcastSink {
    sender: broadcast::Sender<OrchestratorEvent>,
}

impl BroadcastSink {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySink for BroadcastSink {
    fn emit(&self, event: &OrchestratorEvent) {
        // No receivers is fine; the stream is advisory.
        let _ = self.sender.send(event.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        let event = OrchestratorEvent::SprintStarted {
            sprint_id: "s-1".to_string(),
            scope: "cfn/e/p/s-1".to_string(),
        };
        assert_eq!(event.name(), "sprint_started");

        let event = OrchestratorEvent::SecurityFault {
            coordinator_id: "c".to_string(),
            signal_id: "s".to_string(),
        };
        assert_eq!(event.name(), "security_fault");
    }

    #[test]
    fn test_event_serializes_tagged() {
        let event = OrchestratorEvent::ConsensusEvaluated {
            scope_id: "sprint-1".to_string(),
            loop2_iter: 2,
            approval_rate: 0.75,
            avg_confidence: 0.9,
            passed: false,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "consensus_evaluated");
        assert_eq!(json["loop2_iter"], 2);
        assert_eq!(json["passed"], false);
    }

    #[tokio::test]
    async fn test_broadcast_sink_delivers() {
        let sink = BroadcastSink::new();
        let mut rx = sink.subscribe();

        sink.emit(&OrchestratorEvent::EpicStarted {
            epic_id: "epic-1".to_string(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "epic_started");
    }

    #[test]
    fn test_broadcast_sink_without_receivers_is_silent() {
        let sink = BroadcastSink::new();
        assert_eq!(sink.subscriber_count(), 0);
        sink.emit(&OrchestratorEvent::EpicStarted {
            epic_id: "epic-1".to_string(),
        });
    }

    #[test]
    fn test_null_sink_accepts_everything() {
        NullSink.emit(&OrchestratorEvent::BreakerTripped {
            scope_id: "sprint-1".to_string(),
            breaker: "primary".to_string(),
        });
    }
}
