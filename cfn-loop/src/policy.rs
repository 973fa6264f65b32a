//! Loop policy — iteration caps, quality gates, and swarm shape.
//!
//! A [`LoopPolicy`] is supplied by the caller and validated once at
//! orchestrator construction. Range violations are configuration faults
//! and never recovered at runtime.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default cap on consensus (Loop 2) iterations.
pub const DEFAULT_MAX_LOOP2: u32 = 10;
/// Default cap on primary-swarm (Loop 3) iterations.
pub const DEFAULT_MAX_LOOP3: u32 = 10;
/// One-shot cap bump applied when autonomous extension fires.
pub const DEFAULT_EXTENSION_BUMP: u32 = 3;
/// Default wall-clock budget for a single sprint run.
pub const DEFAULT_GLOBAL_TIMEOUT: Duration = Duration::from_secs(1800);
/// Default TTL for persisted signal ACKs.
pub const DEFAULT_ACK_TTL: Duration = Duration::from_secs(3600);
/// Default per-validator ballot deadline.
pub const DEFAULT_VALIDATOR_DEADLINE: Duration = Duration::from_secs(60);

/// Validation error for out-of-range policy values.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PolicyError {
    #[error("{field} must be within {min}..={max}, got {value}")]
    CapOutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("{field} must be within {min:.2}..={max:.2}, got {value:.2}")]
    ThresholdOutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("swarm must allow at least one concurrent agent")]
    NoAgents,

    #[error("global timeout must be non-zero")]
    ZeroTimeout,
}

/// Gate over primary-agent self-reported confidence.
///
/// Passes when `min(confidences) >= min` and `mean(confidences) >= avg`.
/// An agent that returned no score fails the gate outright.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConfidenceGate {
    /// Minimum acceptable per-agent confidence.
    pub min: f64,
    /// Minimum acceptable mean confidence across the swarm.
    pub avg: f64,
}

impl Default for ConfidenceGate {
    fn default() -> Self {
        Self { min: 0.75, avg: 0.80 }
    }
}

/// Gate over validator ballots.
///
/// Passes when `approvals / ballots >= approval_rate` and the mean
/// validator confidence is at least `avg_confidence`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ConsensusGate {
    /// Required approval rate across all ballots.
    pub approval_rate: f64,
    /// Required mean validator confidence.
    pub avg_confidence: f64,
}

impl Default for ConsensusGate {
    fn default() -> Self {
        Self {
            approval_rate: 0.90,
            avg_confidence: 0.85,
        }
    }
}

/// Role a validator plays when reviewing produced work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidatorRole {
    /// Line-level code and artifact review.
    Reviewer,
    /// Structural and design review.
    SystemArchitect,
    /// Security posture review.
    Security,
    /// Test adequacy review.
    Tester,
    /// Cross-component integration review.
    Integration,
    /// Latency/throughput review.
    Performance,
    /// Long-term maintainability review.
    Maintainability,
}

impl ValidatorRole {
    /// Short description used when assembling validator tasks.
    pub fn description(&self) -> &'static str {
        match self {
            Self::Reviewer => "code and artifact quality",
            Self::SystemArchitect => "architecture and design coherence",
            Self::Security => "security posture and attack surface",
            Self::Tester => "test adequacy and edge coverage",
            Self::Integration => "cross-component integration",
            Self::Performance => "latency and resource budgets",
            Self::Maintainability => "long-term maintainability",
        }
    }
}

impl std::fmt::Display for ValidatorRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reviewer => write!(f, "reviewer"),
            Self::SystemArchitect => write!(f, "system-architect"),
            Self::Security => write!(f, "security"),
            Self::Tester => write!(f, "tester"),
            Self::Integration => write!(f, "integration"),
            Self::Performance => write!(f, "performance"),
            Self::Maintainability => write!(f, "maintainability"),
        }
    }
}

/// One validator seat in a swarm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorSpec {
    /// Stable validator identifier (key-safe).
    pub id: String,
    /// The review lens this seat applies.
    pub role: ValidatorRole,
}

impl ValidatorSpec {
    /// Create a seat with the conventional `{role}-validator` id.
    pub fn for_role(role: ValidatorRole) -> Self {
        Self {
            id: format!("{role}-validator"),
            role,
        }
    }
}

/// Shape and limits of the agent swarms a sprint may spawn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwarmConfig {
    /// Upper bound on concurrently executing agents.
    pub max_agents: usize,
    /// Per-validator ballot deadline; late ballots count as reject.
    pub validator_deadline: Duration,
    /// Validator seats for sprint-level (Loop 2) consensus.
    pub sprint_validators: Vec<ValidatorSpec>,
    /// Validator seats for phase-level consensus.
    pub phase_validators: Vec<ValidatorSpec>,
    /// Validator seats for epic-level consensus.
    pub epic_validators: Vec<ValidatorSpec>,
}

impl Default for SwarmConfig {
    fn default() -> Self {
        Self {
            max_agents: 8,
            validator_deadline: DEFAULT_VALIDATOR_DEADLINE,
            sprint_validators: vec![
                ValidatorSpec::for_role(ValidatorRole::Reviewer),
                ValidatorSpec::for_role(ValidatorRole::Security),
                ValidatorSpec::for_role(ValidatorRole::Tester),
                ValidatorSpec::for_role(ValidatorRole::SystemArchitect),
            ],
            phase_validators: vec![
                ValidatorSpec::for_role(ValidatorRole::Reviewer),
                ValidatorSpec::for_role(ValidatorRole::SystemArchitect),
                ValidatorSpec::for_role(ValidatorRole::Security),
            ],
            epic_validators: vec![
                ValidatorSpec::for_role(ValidatorRole::Integration),
                ValidatorSpec::for_role(ValidatorRole::Security),
                ValidatorSpec::for_role(ValidatorRole::Performance),
                ValidatorSpec::for_role(ValidatorRole::Maintainability),
            ],
        }
    }
}

/// Complete policy for one orchestration run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopPolicy {
    /// Consensus retry cap (1..=100).
    pub max_loop2: u32,
    /// Primary retry cap (1..=100).
    pub max_loop3: u32,
    /// Confidence gate applied after each primary swarm pass.
    pub confidence_gate: ConfidenceGate,
    /// Consensus gate applied after each validator swarm pass.
    pub consensus_gate: ConsensusGate,
    /// Wall-clock budget for a single sprint run.
    pub global_timeout: Duration,
    /// TTL for persisted signal ACKs.
    pub ack_ttl: Duration,
    /// Per-iteration retry cap for individual agent execution errors.
    pub agent_retry_limit: u32,
    /// Whether a first cap exhaustion bumps the cap once.
    pub autonomous_extension: bool,
    /// Size of the one-shot cap bump.
    pub extension_bump: u32,
    /// Allow independent ready sprints of a phase to run concurrently.
    pub parallel_ready: bool,
    /// Re-run budget for a failed phase at the epic level.
    pub phase_retry_budget: u32,
    /// Swarm shape and limits.
    pub swarm: SwarmConfig,
}

impl Default for LoopPolicy {
    fn default() -> Self {
        Self {
            max_loop2: DEFAULT_MAX_LOOP2,
            max_loop3: DEFAULT_MAX_LOOP3,
            confidence_gate: ConfidenceGate::default(),
            consensus_gate: ConsensusGate::default(),
            global_timeout: DEFAULT_GLOBAL_TIMEOUT,
            ack_ttl: DEFAULT_ACK_TTL,
            agent_retry_limit: 3,
            autonomous_extension: true,
            extension_bump: DEFAULT_EXTENSION_BUMP,
            parallel_ready: false,
            phase_retry_budget: 1,
            swarm: SwarmConfig::default(),
        }
    }
}

impl LoopPolicy {
    /// Range-check every field. Called by orchestrator constructors;
    /// a violation is fatal and never retried.
    pub fn validate(&self) -> Result<(), PolicyError> {
        check_cap("max_loop2", self.max_loop2)?;
        check_cap("max_loop3", self.max_loop3)?;
        check_threshold("consensus_gate.approval_rate", self.consensus_gate.approval_rate)?;
        check_threshold("consensus_gate.avg_confidence", self.consensus_gate.avg_confidence)?;
        check_threshold("confidence_gate.min", self.confidence_gate.min)?;
        check_threshold("confidence_gate.avg", self.confidence_gate.avg)?;
        if self.swarm.max_agents == 0 {
            return Err(PolicyError::NoAgents);
        }
        if self.global_timeout.is_zero() {
            return Err(PolicyError::ZeroTimeout);
        }
        Ok(())
    }
}

fn check_cap(field: &'static str, value: u32) -> Result<(), PolicyError> {
    if (1..=100).contains(&value) {
        Ok(())
    } else {
        Err(PolicyError::CapOutOfRange {
            field,
            value,
            min: 1,
            max: 100,
        })
    }
}

fn check_threshold(field: &'static str, value: f64) -> Result<(), PolicyError> {
    if (0.5..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(PolicyError::ThresholdOutOfRange {
            field,
            value,
            min: 0.5,
            max: 1.0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy_is_valid() {
        let policy = LoopPolicy::default();
        policy.validate().unwrap();
        assert_eq!(policy.max_loop2, 10);
        assert_eq!(policy.max_loop3, 10);
        assert_eq!(policy.extension_bump, 3);
        assert!(policy.autonomous_extension);
        assert!(!policy.parallel_ready);
        assert_eq!(policy.global_timeout, Duration::from_secs(1800));
        assert_eq!(policy.ack_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn test_default_gates() {
        let policy = LoopPolicy::default();
        assert!((policy.confidence_gate.min - 0.75).abs() < f64::EPSILON);
        assert!((policy.confidence_gate.avg - 0.80).abs() < f64::EPSILON);
        assert!((policy.consensus_gate.approval_rate - 0.90).abs() < f64::EPSILON);
        assert!((policy.consensus_gate.avg_confidence - 0.85).abs() < f64::EPSILON);
    }

    #[test]
    fn test_cap_out_of_range() {
        let policy = LoopPolicy {
            max_loop2: 0,
            ..Default::default()
        };
        let err = policy.validate().unwrap_err();
        assert!(matches!(err, PolicyError::CapOutOfRange { field: "max_loop2", .. }));

        let policy = LoopPolicy {
            max_loop3: 101,
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_threshold_out_of_range() {
        let policy = LoopPolicy {
            consensus_gate: ConsensusGate {
                approval_rate: 0.4,
                avg_confidence: 0.85,
            },
            ..Default::default()
        };
        let err = policy.validate().unwrap_err();
        assert!(matches!(err, PolicyError::ThresholdOutOfRange { .. }));

        let policy = LoopPolicy {
            confidence_gate: ConfidenceGate { min: 1.1, avg: 0.8 },
            ..Default::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn test_zero_agents_rejected() {
        let mut policy = LoopPolicy::default();
        policy.swarm.max_agents = 0;
        assert_eq!(policy.validate().unwrap_err(), PolicyError::NoAgents);
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let policy = LoopPolicy {
            global_timeout: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(policy.validate().unwrap_err(), PolicyError::ZeroTimeout);
    }

    #[test]
    fn test_validator_spec_id() {
        let spec = ValidatorSpec::for_role(ValidatorRole::SystemArchitect);
        assert_eq!(spec.id, "system-architect-validator");
        assert_eq!(spec.role, ValidatorRole::SystemArchitect);
    }

    #[test]
    fn test_validator_role_display() {
        assert_eq!(ValidatorRole::Reviewer.to_string(), "reviewer");
        assert_eq!(ValidatorRole::SystemArchitect.to_string(), "system-architect");
        assert_eq!(ValidatorRole::Maintainability.to_string(), "maintainability");
    }

    #[test]
    fn test_default_swarm_seats() {
        let swarm = SwarmConfig::default();
        assert_eq!(swarm.sprint_validators.len(), 4);
        assert_eq!(swarm.phase_validators.len(), 3);
        assert_eq!(swarm.epic_validators.len(), 4);
        assert_eq!(swarm.validator_deadline, Duration::from_secs(60));
    }

    #[test]
    fn test_policy_json_roundtrip() {
        let policy = LoopPolicy::default();
        let json = serde_json::to_string(&policy).unwrap();
        let parsed: LoopPolicy = serde_json::from_str(&json).unwrap();
        parsed.validate().unwrap();
        assert_eq!(parsed.max_loop3, policy.max_loop3);
    }
}
