//! Agent execution seam.
//!
//! The orchestrator treats every agent call as an opaque operation: a
//! typed [`AgentTask`] goes out, an [`AgentResult`] or [`ValidatorVote`]
//! comes back. Prompt assembly lives behind [`AgentTaskBuilder`]; the
//! core never formats prompt strings inline.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::loops::feedback::FeedbackPacket;
use crate::plan::SprintTask;
use crate::policy::ValidatorSpec;

/// Opaque failure from an agent execution.
#[derive(Debug, Clone, Error)]
#[error("agent {agent_id} failed: {message}")]
pub struct AgentError {
    pub agent_id: String,
    pub message: String,
}

impl AgentError {
    pub fn new(agent_id: &str, message: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            message: message.into(),
        }
    }
}

/// One unit of work handed to an executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentTask {
    /// Stable agent identifier (key-safe).
    pub agent_id: String,
    /// Agent capability label.
    pub agent_type: String,
    /// What the agent is asked to do.
    pub instructions: String,
    /// Validator feedback from the previous consensus round, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback_context: Option<FeedbackPacket>,
}

/// What a primary agent reports back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub agent_id: String,
    /// Self-reported confidence in \[0, 1\]. `None` scores as 0 and
    /// fails the confidence gate.
    pub confidence: Option<f64>,
    /// Produced artifacts; stored verbatim, never interpreted.
    #[serde(default)]
    pub artifacts: serde_json::Value,
    /// Free-form self report, fed back on retry.
    #[serde(default)]
    pub self_report: String,
}

impl AgentResult {
    /// Confidence with the missing-score rule applied.
    pub fn scored_confidence(&self) -> f64 {
        self.confidence.unwrap_or(0.0).clamp(0.0, 1.0)
    }

    /// Result synthesized for an agent that failed every retry.
    pub fn failed(agent_id: &str, reason: &str) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            confidence: None,
            artifacts: serde_json::Value::Null,
            self_report: format!("execution failed: {reason}"),
        }
    }
}

/// A validator's ballot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteDecision {
    Approve,
    Reject,
}

impl std::fmt::Display for VoteDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Approve => write!(f, "approve"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

/// One validator ballot with reasons.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorVote {
    pub validator_id: String,
    pub decision: VoteDecision,
    /// Confidence in \[0, 1\].
    pub confidence: f64,
    #[serde(default)]
    pub reasons: Vec<String>,
}

impl ValidatorVote {
    pub fn approve(validator_id: &str, confidence: f64) -> Self {
        Self {
            validator_id: validator_id.to_string(),
            decision: VoteDecision::Approve,
            confidence: confidence.clamp(0.0, 1.0),
            reasons: Vec::new(),
        }
    }

    pub fn reject(validator_id: &str, confidence: f64, reason: &str) -> Self {
        Self {
            validator_id: validator_id.to_string(),
            decision: VoteDecision::Reject,
            confidence: confidence.clamp(0.0, 1.0),
            reasons: vec![reason.to_string()],
        }
    }

    /// Zero-confidence reject used for abstentions, deadline misses, and
    /// execution failures.
    pub fn defaulted_reject(validator_id: &str, reason: &str) -> Self {
        Self::reject(validator_id, 0.0, reason)
    }

    pub fn is_approve(&self) -> bool {
        self.decision == VoteDecision::Approve
    }
}

/// Per-call context handed to executors.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Namespace prefix the call runs under (for executor-side scoping).
    pub scope: String,
    /// Current primary-loop iteration (1-indexed).
    pub loop3_iter: u32,
    /// Current consensus-loop iteration (1-indexed).
    pub loop2_iter: u32,
    /// Cooperative cancellation; executors should stop best-effort.
    pub cancel: CancellationToken,
}

impl ExecutionContext {
    pub fn new(scope: &str, cancel: CancellationToken) -> Self {
        Self {
            scope: scope.to_string(),
            loop3_iter: 0,
            loop2_iter: 0,
            cancel,
        }
    }
}

/// The injected execution backend: LLM calls, tool use, anything.
#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Run a primary-agent task to completion.
    async fn execute(
        &self,
        task: AgentTask,
        ctx: &ExecutionContext,
    ) -> Result<AgentResult, AgentError>;

    /// Run a validator task and return its ballot.
    async fn validate(
        &self,
        task: AgentTask,
        ctx: &ExecutionContext,
    ) -> Result<ValidatorVote, AgentError>;
}

/// What a validator swarm is asked to review.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSubject {
    /// Id of the sprint/phase/epic under review.
    pub scope_id: String,
    pub name: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    /// Artifacts collected from the work under review.
    #[serde(default)]
    pub artifacts: Vec<serde_json::Value>,
}

/// Assembles concrete [`AgentTask`]s from typed inputs.
///
/// Swapping this implementation changes how instructions read without
/// touching the loop machinery.
pub trait AgentTaskBuilder: Send + Sync {
    /// Task for one primary agent. `feedback` carries validator reasons
    /// from the last failed consensus round; `prior` carries the
    /// previous iteration's results so their self-reports can be fed
    /// back on retry.
    fn primary_task(
        &self,
        task: &SprintTask,
        feedback: Option<&FeedbackPacket>,
        prior: &[AgentResult],
    ) -> AgentTask;

    /// Task for one validator seat reviewing `subject`.
    fn validator_task(&self, seat: &ValidatorSpec, subject: &ReviewSubject) -> AgentTask;
}

/// Pass-through builder: sprint instructions go out as declared, prior
/// self-reports are appended on retry, and validator instructions name
/// the seat's review lens and the acceptance criteria.
#[derive(Debug, Default)]
pub struct DefaultTaskBuilder;

impl AgentTaskBuilder for DefaultTaskBuilder {
    fn primary_task(
        &self,
        task: &SprintTask,
        feedback: Option<&FeedbackPacket>,
        prior: &[AgentResult],
    ) -> AgentTask {
        let mut instructions = task.instructions.clone();
        if let Some(previous) = prior
            .iter()
            .find(|r| r.agent_id == task.agent_id)
            .filter(|r| !r.self_report.is_empty())
        {
            instructions.push_str("\nPrevious attempt self-report: ");
            instructions.push_str(&previous.self_report);
        }
        AgentTask {
            agent_id: task.agent_id.clone(),
            agent_type: task.agent_type.clone(),
            instructions,
            feedback_context: feedback.cloned(),
        }
    }

    fn validator_task(&self, seat: &ValidatorSpec, subject: &ReviewSubject) -> AgentTask {
        let mut instructions = format!(
            "Review {} ({}) for {}.",
            subject.name,
            subject.scope_id,
            seat.role.description()
        );
        if !subject.acceptance_criteria.is_empty() {
            instructions.push_str("\nAcceptance criteria:");
            for criterion in &subject.acceptance_criteria {
                instructions.push_str("\n- ");
                instructions.push_str(criterion);
            }
        }
        AgentTask {
            agent_id: seat.id.clone(),
            agent_type: seat.role.to_string(),
            instructions,
            feedback_context: None,
        }
    }
}

/// Run a primary task with the per-iteration retry cap. Persistent
/// failure yields a zero-confidence result instead of an error.
pub async fn execute_with_retry(
    executor: &dyn AgentExecutor,
    task: &AgentTask,
    ctx: &ExecutionContext,
    retry_limit: u32,
) -> AgentResult {
    let attempts = retry_limit.max(1);
    let mut last_error = String::from("no attempts made");

    for attempt in 1..=attempts {
        if ctx.cancel.is_cancelled() {
            last_error = "cancelled".to_string();
            break;
        }
        match executor.execute(task.clone(), ctx).await {
            Ok(result) => return result,
            Err(err) => {
                debug!(
                    agent_id = %task.agent_id,
                    attempt,
                    error = %err,
                    "agent execution failed"
                );
                last_error = err.message;
                if attempt < attempts {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    warn!(
        agent_id = %task.agent_id,
        attempts,
        "agent failed every retry; scoring confidence 0"
    );
    AgentResult::failed(&task.agent_id, &last_error)
}

/// Collected ballots plus how many validators never produced one.
#[derive(Debug, Clone)]
pub struct BallotRound {
    pub votes: Vec<ValidatorVote>,
    /// Validators whose ballot was substituted (error or deadline).
    pub defaulted: usize,
}

impl BallotRound {
    /// Whether every seat failed to produce a real ballot.
    pub fn all_defaulted(&self) -> bool {
        !self.votes.is_empty() && self.defaulted == self.votes.len()
    }
}

/// Run one validator swarm: every seat ballots concurrently under the
/// agent cap, each with its own deadline. Errors, abstentions, and
/// deadline misses become zero-confidence rejects so the consensus gate
/// always sees one ballot per seat.
pub async fn run_validator_swarm(
    executor: Arc<dyn AgentExecutor>,
    builder: &dyn AgentTaskBuilder,
    seats: &[ValidatorSpec],
    subject: &ReviewSubject,
    deadline: Duration,
    max_agents: usize,
    ctx: &ExecutionContext,
) -> BallotRound {
    use tokio::sync::Semaphore;
    use tokio::task::JoinSet;

    let sem = Arc::new(Semaphore::new(max_agents.max(1)));
    let mut join_set: JoinSet<(ValidatorVote, bool)> = JoinSet::new();

    for seat in seats {
        let task = builder.validator_task(seat, subject);
        let executor = executor.clone();
        let sem = sem.clone();
        let ctx = ctx.clone();
        join_set.spawn(async move {
            let _permit = sem.acquire().await.expect("semaphore closed");
            match tokio::time::timeout(deadline, executor.validate(task.clone(), &ctx)).await {
                Ok(Ok(vote)) => (vote, false),
                Ok(Err(err)) => {
                    debug!(validator_id = %task.agent_id, error = %err, "validator failed");
                    let reason = format!("validator error: {}", err.message);
                    (
                        ValidatorVote::defaulted_reject(&task.agent_id, &reason),
                        true,
                    )
                }
                Err(_) => (
                    ValidatorVote::defaulted_reject(&task.agent_id, "ballot deadline elapsed"),
                    true,
                ),
            }
        });
    }

    let mut votes = Vec::new();
    let mut defaulted = 0;
    while let Some(joined) = join_set.join_next().await {
        match joined {
            Ok((vote, was_defaulted)) => {
                if was_defaulted {
                    defaulted += 1;
                }
                votes.push(vote);
            }
            Err(err) => warn!(error = %err, "validator task panicked"),
        }
    }
    votes.sort_by(|a, b| a.validator_id.cmp(&b.validator_id));
    BallotRound { votes, defaulted }
}
