//! Quality gates — pure evaluation over scores and ballots.

use crate::agent::{AgentResult, ValidatorVote};
use crate::policy::{ConfidenceGate, ConsensusGate};

/// Outcome of one confidence gate evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConfidenceReport {
    /// Lowest scored confidence (missing scores count as 0).
    pub min: f64,
    /// Mean scored confidence.
    pub avg: f64,
    /// Agents that returned no score.
    pub missing: usize,
    pub passed: bool,
}

/// Evaluate the confidence gate over a primary swarm's results.
///
/// Missing scores count as 0 in the aggregates and fail the gate
/// outright; an empty swarm fails.
pub fn evaluate_confidence(gate: &ConfidenceGate, results: &[AgentResult]) -> ConfidenceReport {
    if results.is_empty() {
        return ConfidenceReport {
            min: 0.0,
            avg: 0.0,
            missing: 0,
            passed: false,
        };
    }

    let scores: Vec<f64> = results.iter().map(AgentResult::scored_confidence).collect();
    let missing = results.iter().filter(|r| r.confidence.is_none()).count();
    let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
    let avg = scores.iter().sum::<f64>() / scores.len() as f64;
    let passed = missing == 0 && min >= gate.min && avg >= gate.avg;

    ConfidenceReport {
        min,
        avg,
        missing,
        passed,
    }
}

/// Outcome of one consensus gate evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsensusReport {
    pub approvals: usize,
    pub ballots: usize,
    /// `approvals / ballots`; 0 for an empty ballot set.
    pub approval_rate: f64,
    /// Mean ballot confidence; 0 for an empty ballot set.
    pub avg_confidence: f64,
    pub passed: bool,
}

/// Evaluate the consensus gate over validator ballots.
///
/// Ballot order is irrelevant. Callers substitute zero-confidence
/// rejects for abstentions, deadline misses, and failed validators
/// before calling; an empty ballot set is a unanimous reject.
pub fn evaluate_consensus(gate: &ConsensusGate, votes: &[ValidatorVote]) -> ConsensusReport {
    if votes.is_empty() {
        return ConsensusReport {
            approvals: 0,
            ballots: 0,
            approval_rate: 0.0,
            avg_confidence: 0.0,
            passed: false,
        };
    }

    let ballots = votes.len();
    let approvals = votes.iter().filter(|v| v.is_approve()).count();
    let approval_rate = approvals as f64 / ballots as f64;
    let avg_confidence = votes.iter().map(|v| v.confidence).sum::<f64>() / ballots as f64;
    let passed = approval_rate >= gate.approval_rate && avg_confidence >= gate.avg_confidence;

    ConsensusReport {
        approvals,
        ballots,
        approval_rate,
        avg_confidence,
        passed,
    }
}
