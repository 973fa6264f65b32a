//! Three-loop state machine — steps, transitions, and per-sprint state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::feedback::FeedbackPacket;

/// Which loop a cap or breaker belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopLevel {
    /// Loop 3 — the primary agent swarm.
    Primary,
    /// Loop 2 — the validator consensus swarm.
    Consensus,
}

impl std::fmt::Display for LoopLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Consensus => write!(f, "consensus"),
        }
    }
}

/// Step of a sprint execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopStep {
    /// Created but not started.
    Init,
    /// Primary swarm executing.
    Loop3Run,
    /// Confidence gate over primary results.
    Loop3Gate,
    /// Re-spawning the primary swarm with feedback.
    Loop3Retry,
    /// Validator swarm executing.
    Loop2Run,
    /// Consensus gate over validator ballots.
    Loop2Gate,
    /// Consensus reached — sprint succeeded.
    Done,
    /// Primary iteration cap exhausted.
    Loop3Exhausted,
    /// Consensus iteration cap exhausted.
    Loop2Exhausted,
    /// Cancelled or timed out.
    Aborted,
}

impl LoopStep {
    /// Whether this step ends the sprint.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Done | Self::Loop3Exhausted | Self::Loop2Exhausted | Self::Aborted
        )
    }

    /// Valid transitions from this step.
    pub fn valid_transitions(self) -> &'static [LoopStep] {
        match self {
            Self::Init => &[Self::Loop3Run, Self::Aborted],
            Self::Loop3Run => &[Self::Loop3Gate, Self::Aborted],
            Self::Loop3Gate => &[
                Self::Loop2Run,
                Self::Loop3Retry,
                Self::Loop3Exhausted,
                Self::Aborted,
            ],
            Self::Loop3Retry => &[Self::Loop3Run, Self::Aborted],
            Self::Loop2Run => &[Self::Loop2Gate, Self::Aborted],
            Self::Loop2Gate => &[
                Self::Done,
                Self::Loop3Retry,
                Self::Loop2Exhausted,
                Self::Aborted,
            ],
            Self::Done | Self::Loop3Exhausted | Self::Loop2Exhausted | Self::Aborted => &[],
        }
    }
}

impl std::fmt::Display for LoopStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Init => write!(f, "init"),
            Self::Loop3Run => write!(f, "loop3_run"),
            Self::Loop3Gate => write!(f, "loop3_gate"),
            Self::Loop3Retry => write!(f, "loop3_retry"),
            Self::Loop2Run => write!(f, "loop2_run"),
            Self::Loop2Gate => write!(f, "loop2_gate"),
            Self::Done => write!(f, "done"),
            Self::Loop3Exhausted => write!(f, "loop3_exhausted"),
            Self::Loop2Exhausted => write!(f, "loop2_exhausted"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Programming fault: a transition outside the table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid loop transition {from} → {to}")]
pub struct InvalidTransition {
    pub from: LoopStep,
    pub to: LoopStep,
}

/// One recorded transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopTransitionRecord {
    pub from: LoopStep,
    pub to: LoopStep,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Confidence gate sample kept in history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConfidenceSample {
    pub loop3_iter: u32,
    pub min: f64,
    pub avg: f64,
    pub missing: usize,
    pub passed: bool,
}

/// Consensus gate sample kept in history.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConsensusSample {
    pub loop2_iter: u32,
    pub approvals: usize,
    pub ballots: usize,
    pub approval_rate: f64,
    pub avg_confidence: f64,
    pub passed: bool,
}

/// Mutable per-sprint loop state, snapshotted to the memory store at
/// every gate evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopState {
    pub step: LoopStep,
    /// Primary iterations in the current consensus cycle (1-indexed).
    pub loop3_iter: u32,
    /// Consensus iterations (1-indexed).
    pub loop2_iter: u32,
    /// Primary iterations across all consensus cycles.
    pub loop3_total: u32,
    pub started_at: DateTime<Utc>,
    pub last_feedback: Option<FeedbackPacket>,
    pub confidence_history: Vec<ConfidenceSample>,
    pub consensus_history: Vec<ConsensusSample>,
    pub transitions: Vec<LoopTransitionRecord>,
}

impl LoopState {
    pub fn new() -> Self {
        Self {
            step: LoopStep::Init,
            loop3_iter: 0,
            loop2_iter: 0,
            loop3_total: 0,
            started_at: Utc::now(),
            last_feedback: None,
            confidence_history: Vec::new(),
            consensus_history: Vec::new(),
            transitions: Vec::new(),
        }
    }

    /// Transition to `to`, recording the step. Entering `Loop3Run`
    /// advances the primary iteration; entering `Loop2Run` advances the
    /// consensus iteration and resets the primary budget for the next
    /// cycle's use.
    pub fn transition(&mut self, to: LoopStep, reason: &str) -> Result<(), InvalidTransition> {
        if !self.step.valid_transitions().contains(&to) {
            return Err(InvalidTransition {
                from: self.step,
                to,
            });
        }
        self.transitions.push(LoopTransitionRecord {
            from: self.step,
            to,
            at: Utc::now(),
            reason: reason.to_string(),
        });
        match to {
            LoopStep::Loop3Run => {
                self.loop3_iter += 1;
                self.loop3_total += 1;
            }
            LoopStep::Loop2Run => {
                self.loop2_iter += 1;
            }
            _ => {}
        }
        self.step = to;
        Ok(())
    }

    /// Reset the primary iteration budget when consensus feedback sends
    /// the sprint back into Loop 3.
    pub fn reset_primary_budget(&mut self) {
        self.loop3_iter = 0;
    }

    /// Whether the sprint has ended.
    pub fn is_complete(&self) -> bool {
        self.step.is_terminal()
    }

    /// Compact status line for logs.
    pub fn status_line(&self) -> String {
        format!(
            "[{}] loop3 {} (total {}) | loop2 {} | {} transitions",
            self.step,
            self.loop3_iter,
            self.loop3_total,
            self.loop2_iter,
            self.transitions.len()
        )
    }
}

impl Default for LoopState {
    fn default() -> Self {
        Self::new()
    }
}
