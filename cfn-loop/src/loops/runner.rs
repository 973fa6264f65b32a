//! LoopRunner — drives one sprint through the three-loop cycle.
//!
//! Loop 3 spawns the primary swarm and gates on self-reported
//! confidence; Loop 2 spawns the validator swarm and gates on consensus,
//! injecting feedback into the next primary pass when it fails; Loop 1
//! is the completion envelope (status write, feedback pruning, signed
//! completion signal). Caps, breakers, cancellation, and the global
//! timeout bound every path.

use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::agent::{
    execute_with_retry, run_validator_swarm, AgentResult, ExecutionContext, ReviewSubject,
    ValidatorVote,
};
use crate::breaker::{CircuitBreaker, CircuitState};
use crate::error::OrchestrationError;
use crate::memory::{validate_id, MemoryStore, Namespace, StatusRecord};
use crate::plan::{Sprint, WorkStatus};
use crate::policy::LoopPolicy;
use crate::services::Services;
use crate::signal::{Signal, SignalKind};
use crate::telemetry::OrchestratorEvent;

use super::feedback::{self, FeedbackPacket};
use super::gates;
use super::state::{
    ConfidenceSample, ConsensusSample, LoopLevel, LoopState, LoopStep, LoopTransitionRecord,
};

/// Terminal disposition of a sprint run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SprintStatus {
    /// Consensus reached.
    Complete,
    /// An iteration cap ran out (after any one-shot extension).
    Exhausted { level: LoopLevel },
    /// Cancelled or timed out.
    Aborted,
}

impl SprintStatus {
    pub fn is_complete(self) -> bool {
        matches!(self, Self::Complete)
    }
}

impl std::fmt::Display for SprintStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Complete => write!(f, "complete"),
            Self::Exhausted { level } => write!(f, "exhausted ({level})"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Everything a caller learns from one sprint run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SprintOutcome {
    pub sprint_id: String,
    pub status: SprintStatus,
    /// Primary iterations in the final consensus cycle.
    pub loop3_iter: u32,
    /// Consensus iterations.
    pub loop2_iter: u32,
    /// Primary iterations across all cycles.
    pub loop3_total: u32,
    /// Artifacts from the last primary pass.
    pub artifacts: Vec<serde_json::Value>,
    pub final_confidence: Option<ConfidenceSample>,
    pub final_consensus: Option<ConsensusSample>,
    /// Feedback from the last failed consensus round, if any.
    pub final_feedback: Option<FeedbackPacket>,
    pub transitions: Vec<LoopTransitionRecord>,
}

impl SprintOutcome {
    pub fn is_complete(&self) -> bool {
        self.status.is_complete()
    }
}

/// Drives one sprint to a terminal step.
pub struct LoopRunner {
    services: Services,
    namespace: Namespace,
    policy: LoopPolicy,
    primary_breaker: CircuitBreaker,
    consensus_breaker: CircuitBreaker,
}

impl LoopRunner {
    /// Build a runner for the sprint namespace. The policy is validated
    /// here; a violation is fatal.
    pub fn new(
        services: Services,
        namespace: Namespace,
        policy: LoopPolicy,
    ) -> Result<Self, OrchestrationError> {
        policy.validate()?;
        Ok(Self {
            services,
            namespace,
            policy,
            primary_breaker: CircuitBreaker::new("primary"),
            consensus_breaker: CircuitBreaker::new("consensus"),
        })
    }

    /// Execute the sprint until success, exhaustion, cancellation, or
    /// global timeout.
    pub async fn run(
        &self,
        sprint: &Sprint,
        cancel: CancellationToken,
    ) -> Result<SprintOutcome, OrchestrationError> {
        validate_id(&sprint.id)?;
        for task in &sprint.tasks {
            validate_id(&task.agent_id)?;
        }

        let mut state = LoopState::new();
        self.services.telemetry.emit(&OrchestratorEvent::SprintStarted {
            sprint_id: sprint.id.clone(),
            scope: self.namespace.prefix(),
        });
        info!(sprint_id = %sprint.id, scope = %self.namespace, "sprint started");

        self.services
            .store
            .put(
                &self.namespace.status_key(),
                serde_json::to_value(StatusRecord::new(WorkStatus::InProgress))?,
                None,
            )
            .await?;

        // In-flight agent calls observe this child token on abort.
        let run_token = cancel.child_token();

        let driven = tokio::select! {
            res = self.drive(sprint, &mut state, &run_token) => Some(res),
            _ = cancel.cancelled() => None,
            _ = tokio::time::sleep(self.policy.global_timeout) => {
                self.services.telemetry.emit(&OrchestratorEvent::BreakerTripped {
                    scope_id: sprint.id.clone(),
                    breaker: "global".to_string(),
                });
                warn!(sprint_id = %sprint.id, "global timeout elapsed; aborting sprint");
                None
            }
        };

        match driven {
            Some(result) => result,
            None => {
                run_token.cancel();
                // Breakers stay untouched and memory stays intact for
                // post-mortem; the only record is the telemetry trail.
                if !state.step.is_terminal() {
                    let from = state.step;
                    let _ = state.transition(LoopStep::Aborted, "cancelled or timed out");
                    self.services.telemetry.emit(&OrchestratorEvent::LoopTransition {
                        sprint_id: sprint.id.clone(),
                        from,
                        to: LoopStep::Aborted,
                        reason: "cancelled or timed out".to_string(),
                    });
                }
                self.services.telemetry.emit(&OrchestratorEvent::SprintFinished {
                    sprint_id: sprint.id.clone(),
                    outcome: SprintStatus::Aborted.to_string(),
                    loop3_iter: state.loop3_iter,
                    loop2_iter: state.loop2_iter,
                });
                info!(sprint_id = %sprint.id, "sprint aborted");
                Ok(self.outcome(sprint, &state, SprintStatus::Aborted, Vec::new()))
            }
        }
    }

    async fn drive(
        &self,
        sprint: &Sprint,
        state: &mut LoopState,
        cancel: &CancellationToken,
    ) -> Result<SprintOutcome, OrchestrationError> {
        let mut max3 = self.policy.max_loop3;
        let mut max2 = self.policy.max_loop2;
        let mut extended3 = false;
        let mut extended2 = false;
        let mut last_results: Vec<AgentResult> = Vec::new();
        let mut last_votes: Vec<ValidatorVote> = Vec::new();

        self.step(state, &sprint.id, LoopStep::Loop3Run, "primary swarm spawned")?;

        loop {
            match state.step {
                LoopStep::Loop3Run => {
                    if state.loop3_iter > max3 {
                        return Err(OrchestrationError::CapViolation(format!(
                            "loop3_iter {} exceeds cap {max3} for sprint {}",
                            state.loop3_iter, sprint.id
                        )));
                    }
                    let prior = std::mem::take(&mut last_results);
                    last_results = self.run_primary(sprint, state, &prior, cancel).await?;
                    self.persist_confidence(state, &last_results).await?;
                    self.step(
                        state,
                        &sprint.id,
                        LoopStep::Loop3Gate,
                        "confidence scores collected",
                    )?;
                }

                LoopStep::Loop3Gate => {
                    let report =
                        gates::evaluate_confidence(&self.policy.confidence_gate, &last_results);
                    state.confidence_history.push(ConfidenceSample {
                        loop3_iter: state.loop3_iter,
                        min: report.min,
                        avg: report.avg,
                        missing: report.missing,
                        passed: report.passed,
                    });
                    self.services.telemetry.emit(&OrchestratorEvent::ConfidenceEvaluated {
                        sprint_id: sprint.id.clone(),
                        loop3_iter: state.loop3_iter,
                        min: report.min,
                        avg: report.avg,
                        missing: report.missing,
                        passed: report.passed,
                    });
                    info!(
                        sprint_id = %sprint.id,
                        loop3_iter = state.loop3_iter,
                        min = report.min,
                        avg = report.avg,
                        missing = report.missing,
                        passed = report.passed,
                        "confidence gate evaluated"
                    );
                    self.snapshot(state).await?;

                    if report.passed {
                        self.step(state, &sprint.id, LoopStep::Loop2Run, "confidence gate passed")?;
                    } else if state.loop3_iter >= max3 {
                        if self.policy.autonomous_extension && !extended3 {
                            extended3 = true;
                            max3 += self.policy.extension_bump;
                            self.services.telemetry.emit(&OrchestratorEvent::CapExtended {
                                sprint_id: sprint.id.clone(),
                                level: LoopLevel::Primary,
                                new_cap: max3,
                            });
                            info!(sprint_id = %sprint.id, new_cap = max3, "primary cap extended once");
                            self.step(state, &sprint.id, LoopStep::Loop3Retry, "primary cap extended")?;
                        } else {
                            self.step(
                                state,
                                &sprint.id,
                                LoopStep::Loop3Exhausted,
                                "primary iterations exhausted",
                            )?;
                        }
                    } else {
                        self.step(state, &sprint.id, LoopStep::Loop3Retry, "confidence gate failed")?;
                    }
                }

                LoopStep::Loop3Retry => {
                    let signal = Signal::new(
                        SignalKind::Retry,
                        self.services.bus.coordinator_id(),
                        vec![self.services.bus.coordinator_id().to_string()],
                        json!({
                            "sprintId": sprint.id,
                            "loop2Iter": state.loop2_iter,
                            "loop3Iter": state.loop3_iter,
                        }),
                    );
                    self.services.bus.publish(&signal).await?;
                    self.services.bus.acknowledge(&signal).await?;
                    self.step(state, &sprint.id, LoopStep::Loop3Run, "primary swarm re-spawned")?;
                }

                LoopStep::Loop2Run => {
                    last_votes = self.run_validators(sprint, &last_results, state, cancel).await?;
                    self.step(
                        state,
                        &sprint.id,
                        LoopStep::Loop2Gate,
                        "validator ballots collected",
                    )?;
                }

                LoopStep::Loop2Gate => {
                    let report = gates::evaluate_consensus(&self.policy.consensus_gate, &last_votes);
                    state.consensus_history.push(ConsensusSample {
                        loop2_iter: state.loop2_iter,
                        approvals: report.approvals,
                        ballots: report.ballots,
                        approval_rate: report.approval_rate,
                        avg_confidence: report.avg_confidence,
                        passed: report.passed,
                    });
                    self.services.telemetry.emit(&OrchestratorEvent::ConsensusEvaluated {
                        scope_id: sprint.id.clone(),
                        loop2_iter: state.loop2_iter,
                        approval_rate: report.approval_rate,
                        avg_confidence: report.avg_confidence,
                        passed: report.passed,
                    });
                    info!(
                        sprint_id = %sprint.id,
                        loop2_iter = state.loop2_iter,
                        approval_rate = report.approval_rate,
                        avg_confidence = report.avg_confidence,
                        passed = report.passed,
                        "consensus gate evaluated"
                    );
                    self.snapshot(state).await?;

                    if report.passed {
                        self.step(state, &sprint.id, LoopStep::Done, "consensus reached")?;
                    } else {
                        let packet =
                            FeedbackPacket::from_votes(&sprint.id, state.loop2_iter, &last_votes);
                        feedback::persist(self.services.store.as_ref(), &self.namespace, &packet)
                            .await?;
                        self.services.telemetry.emit(&OrchestratorEvent::FeedbackInjected {
                            sprint_id: sprint.id.clone(),
                            loop2_iter: state.loop2_iter,
                            reason_count: packet.aggregated_reasons.len(),
                        });
                        state.last_feedback = Some(packet);
                        self.services.bus.increment_iteration();

                        if state.loop2_iter >= max2 {
                            if self.policy.autonomous_extension && !extended2 {
                                extended2 = true;
                                max2 += self.policy.extension_bump;
                                self.services.telemetry.emit(&OrchestratorEvent::CapExtended {
                                    sprint_id: sprint.id.clone(),
                                    level: LoopLevel::Consensus,
                                    new_cap: max2,
                                });
                                info!(sprint_id = %sprint.id, new_cap = max2, "consensus cap extended once");
                                state.reset_primary_budget();
                                self.step(
                                    state,
                                    &sprint.id,
                                    LoopStep::Loop3Retry,
                                    "consensus cap extended",
                                )?;
                            } else {
                                self.step(
                                    state,
                                    &sprint.id,
                                    LoopStep::Loop2Exhausted,
                                    "consensus iterations exhausted",
                                )?;
                            }
                        } else {
                            state.reset_primary_budget();
                            self.step(
                                state,
                                &sprint.id,
                                LoopStep::Loop3Retry,
                                "validator feedback injected",
                            )?;
                        }
                    }
                }

                LoopStep::Done => {
                    return self
                        .finish(sprint, state, SprintStatus::Complete, &last_results)
                        .await;
                }
                LoopStep::Loop3Exhausted => {
                    return self
                        .finish(
                            sprint,
                            state,
                            SprintStatus::Exhausted {
                                level: LoopLevel::Primary,
                            },
                            &last_results,
                        )
                        .await;
                }
                LoopStep::Loop2Exhausted => {
                    return self
                        .finish(
                            sprint,
                            state,
                            SprintStatus::Exhausted {
                                level: LoopLevel::Consensus,
                            },
                            &last_results,
                        )
                        .await;
                }

                LoopStep::Init | LoopStep::Aborted => {
                    unreachable!("driver does not park in {}", state.step)
                }
            }
        }
    }

    /// Loop 1 — completion envelope for a normally terminated sprint.
    async fn finish(
        &self,
        sprint: &Sprint,
        state: &LoopState,
        status: SprintStatus,
        last_results: &[AgentResult],
    ) -> Result<SprintOutcome, OrchestrationError> {
        let work_status = if status.is_complete() {
            WorkStatus::Complete
        } else {
            WorkStatus::Failed
        };
        self.services
            .store
            .put(
                &self.namespace.status_key(),
                serde_json::to_value(StatusRecord::with_detail(
                    work_status,
                    &status.to_string(),
                ))?,
                None,
            )
            .await?;
        self.snapshot(state).await?;

        let pruned = feedback::prune(self.services.store.as_ref(), &self.namespace).await?;
        if pruned > 0 {
            debug!(sprint_id = %sprint.id, pruned, "feedback packets pruned");
        }

        let kind = if status.is_complete() {
            SignalKind::Completion
        } else {
            SignalKind::Error
        };
        let signal = Signal::new(
            kind,
            self.services.bus.coordinator_id(),
            vec![self.services.bus.coordinator_id().to_string()],
            json!({
                "sprintId": sprint.id,
                "status": work_status.to_string(),
                "loop2Iter": state.loop2_iter,
            }),
        );
        self.services.bus.publish(&signal).await?;
        self.services.bus.acknowledge(&signal).await?;

        self.services.telemetry.emit(&OrchestratorEvent::SprintFinished {
            sprint_id: sprint.id.clone(),
            outcome: status.to_string(),
            loop3_iter: state.loop3_iter,
            loop2_iter: state.loop2_iter,
        });
        info!(
            sprint_id = %sprint.id,
            status = %status,
            loop3_iter = state.loop3_iter,
            loop2_iter = state.loop2_iter,
            "sprint finished"
        );

        Ok(self.outcome(sprint, state, status, collect_artifacts(last_results)))
    }

    fn outcome(
        &self,
        sprint: &Sprint,
        state: &LoopState,
        status: SprintStatus,
        artifacts: Vec<serde_json::Value>,
    ) -> SprintOutcome {
        SprintOutcome {
            sprint_id: sprint.id.clone(),
            status,
            loop3_iter: state.loop3_iter,
            loop2_iter: state.loop2_iter,
            loop3_total: state.loop3_total,
            artifacts,
            final_confidence: state.confidence_history.last().copied(),
            final_consensus: state.consensus_history.last().copied(),
            final_feedback: state.last_feedback.clone(),
            transitions: state.transitions.clone(),
        }
    }

    /// Spawn the primary swarm under the breaker and the agent cap.
    async fn run_primary(
        &self,
        sprint: &Sprint,
        state: &LoopState,
        prior: &[AgentResult],
        cancel: &CancellationToken,
    ) -> Result<Vec<AgentResult>, OrchestrationError> {
        self.breaker_gate(&self.primary_breaker, &sprint.id).await;

        let feedback = state.last_feedback.clone();
        let sem = Arc::new(Semaphore::new(self.policy.swarm.max_agents));
        let mut join_set: JoinSet<AgentResult> = JoinSet::new();

        for task_spec in &sprint.tasks {
            let task = self
                .services
                .builder
                .primary_task(task_spec, feedback.as_ref(), prior);
            let executor = self.services.executor.clone();
            let sem = sem.clone();
            let ctx = ExecutionContext {
                scope: self.namespace.prefix(),
                loop3_iter: state.loop3_iter,
                loop2_iter: state.loop2_iter,
                cancel: cancel.clone(),
            };
            let retry_limit = self.policy.agent_retry_limit;
            join_set.spawn(async move {
                let _permit = sem.acquire().await.expect("semaphore closed");
                execute_with_retry(executor.as_ref(), &task, &ctx, retry_limit).await
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(result) => {
                    debug!(
                        agent_id = %result.agent_id,
                        confidence = ?result.confidence,
                        "primary agent finished"
                    );
                    results.push(result);
                }
                Err(err) => warn!(error = %err, "primary agent task panicked"),
            }
        }
        results.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

        let all_failed = !results.is_empty() && results.iter().all(|r| r.confidence.is_none());
        self.note_breaker(&self.primary_breaker, &sprint.id, !all_failed);
        Ok(results)
    }

    /// Spawn the validator swarm under the breaker; one ballot per seat.
    async fn run_validators(
        &self,
        sprint: &Sprint,
        last_results: &[AgentResult],
        state: &LoopState,
        cancel: &CancellationToken,
    ) -> Result<Vec<ValidatorVote>, OrchestrationError> {
        self.breaker_gate(&self.consensus_breaker, &sprint.id).await;

        let subject = ReviewSubject {
            scope_id: sprint.id.clone(),
            name: sprint.name.clone(),
            acceptance_criteria: sprint.acceptance_criteria.clone(),
            artifacts: collect_artifacts(last_results),
        };
        let ctx = ExecutionContext {
            scope: self.namespace.prefix(),
            loop3_iter: state.loop3_iter,
            loop2_iter: state.loop2_iter,
            cancel: cancel.clone(),
        };
        let round = run_validator_swarm(
            self.services.executor.clone(),
            self.services.builder.as_ref(),
            &self.policy.swarm.sprint_validators,
            &subject,
            self.policy.swarm.validator_deadline,
            self.policy.swarm.max_agents,
            &ctx,
        )
        .await;

        self.note_breaker(&self.consensus_breaker, &sprint.id, !round.all_defaulted());
        Ok(round.votes)
    }

    /// Bounded wait while a circuit is open; probes once half-open.
    async fn breaker_gate(&self, breaker: &CircuitBreaker, sprint_id: &str) {
        loop {
            match breaker.check() {
                Ok(()) => return,
                Err(open) => {
                    warn!(
                        sprint_id,
                        breaker = breaker.name(),
                        retry_after_ms = open.retry_after.as_millis() as u64,
                        "circuit open; waiting for reset window"
                    );
                    tokio::time::sleep(open.retry_after).await;
                }
            }
        }
    }

    fn note_breaker(&self, breaker: &CircuitBreaker, sprint_id: &str, ok: bool) {
        if ok {
            breaker.record_success();
        } else {
            breaker.record_failure();
            if breaker.state() == CircuitState::Open {
                self.services.telemetry.emit(&OrchestratorEvent::BreakerTripped {
                    scope_id: sprint_id.to_string(),
                    breaker: breaker.name().to_string(),
                });
                warn!(sprint_id, breaker = breaker.name(), "circuit opened");
            }
        }
    }

    async fn persist_confidence(
        &self,
        state: &LoopState,
        results: &[AgentResult],
    ) -> Result<(), OrchestrationError> {
        let mut writes = Vec::with_capacity(results.len());
        for result in results {
            match self.namespace.confidence_key(&result.agent_id) {
                Ok(key) => {
                    let value = json!({
                        "confidence": result.scored_confidence(),
                        "loop3_iter": state.loop3_iter,
                        "loop2_iter": state.loop2_iter,
                    });
                    writes.push(async move { self.services.store.put(&key, value, None).await });
                }
                Err(err) => {
                    // Executor echoed an id we cannot key; skip the write.
                    warn!(error = %err, "confidence write skipped");
                }
            }
        }
        for written in join_all(writes).await {
            written?;
        }
        Ok(())
    }

    async fn snapshot(&self, state: &LoopState) -> Result<(), OrchestrationError> {
        self.services
            .store
            .put(
                &self.namespace.loop_state_key(),
                serde_json::to_value(state)?,
                None,
            )
            .await?;
        Ok(())
    }

    fn step(
        &self,
        state: &mut LoopState,
        sprint_id: &str,
        to: LoopStep,
        reason: &str,
    ) -> Result<(), OrchestrationError> {
        let from = state.step;
        state.transition(to, reason)?;
        self.services.telemetry.emit(&OrchestratorEvent::LoopTransition {
            sprint_id: sprint_id.to_string(),
            from,
            to,
            reason: reason.to_string(),
        });
        debug!(sprint_id, %from, %to, reason, "loop transition");
        Ok(())
    }
}

fn collect_artifacts(results: &[AgentResult]) -> Vec<serde_json::Value> {
    results
        .iter()
        .filter(|r| !r.artifacts.is_null())
        .map(|r| r.artifacts.clone())
        .collect()
}
