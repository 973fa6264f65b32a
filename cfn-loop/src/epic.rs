//! EpicOrchestrator — walks the phase DAG and owns epic consensus.
//!
//! Phases run serially in dependency order. A failed phase may be
//! re-run under the policy's retry budget; once the budget is spent its
//! transitive dependents are blocked. After every phase is terminal an
//! epic-level validator swarm (integration, security, performance,
//! maintainability by default) runs one consensus gate. Human-readable
//! status markers go through the observer; the memory store stays the
//! only system of record.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{run_validator_swarm, ExecutionContext, ReviewSubject};
use crate::error::OrchestrationError;
use crate::loops::gates;
use crate::loops::state::ConsensusSample;
use crate::memory::{MemoryStore, Namespace, StatusRecord};
use crate::observer::StatusScope;
use crate::phase::{PhaseOrchestrator, PhaseOutcome, RunStatus};
use crate::plan::{DependencyGraph, Epic, WorkStatus};
use crate::policy::LoopPolicy;
use crate::services::Services;
use crate::telemetry::OrchestratorEvent;

/// What a caller learns from one epic run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpicOutcome {
    pub epic_id: String,
    pub status: RunStatus,
    pub phase_outcomes: BTreeMap<String, PhaseOutcome>,
    /// Phases that never ran because a dependency failed.
    pub blocked_phases: Vec<String>,
    /// Epic-level consensus gate result, when it ran.
    pub consensus: Option<ConsensusSample>,
    pub failed_reasons: Vec<String>,
}

impl EpicOutcome {
    pub fn is_complete(&self) -> bool {
        self.status.is_complete()
    }
}

/// Runs one epic end to end. One orchestrator per epic; namespaces of
/// distinct epics never overlap.
pub struct EpicOrchestrator {
    services: Services,
    policy: LoopPolicy,
}

impl EpicOrchestrator {
    pub fn new(services: Services, policy: LoopPolicy) -> Result<Self, OrchestrationError> {
        policy.validate()?;
        Ok(Self { services, policy })
    }

    /// Execute the epic: phases in dependency order, then the epic
    /// consensus gate.
    pub async fn run(
        &self,
        epic: &Epic,
        cancel: CancellationToken,
    ) -> Result<EpicOutcome, OrchestrationError> {
        let epic_ns = Namespace::epic(&epic.id)?;

        // Cycle detection over phase edges before any execution.
        let phase_ids: Vec<String> = epic.phases.iter().map(|p| p.id.clone()).collect();
        let graph = DependencyGraph::build(&phase_ids, &epic.phase_edges())?;

        self.services.telemetry.emit(&OrchestratorEvent::EpicStarted {
            epic_id: epic.id.clone(),
        });
        info!(epic_id = %epic.id, phases = epic.phases.len(), "epic started");
        self.write_epic_status(&epic_ns, epic, WorkStatus::InProgress, None)
            .await?;

        let mut statuses: HashMap<String, WorkStatus> = HashMap::new();
        let mut outcomes: BTreeMap<String, PhaseOutcome> = BTreeMap::new();
        let mut blocked: Vec<String> = Vec::new();

        for id in graph.order() {
            if cancel.is_cancelled() {
                return self.aborted(epic, outcomes, blocked).await;
            }

            if let Some(failed_dep) = graph
                .dependencies_of(id)
                .iter()
                .find(|d| statuses.get(*d) != Some(&WorkStatus::Complete))
            {
                self.mark_blocked(epic, &epic_ns, id, failed_dep, &mut statuses, &mut blocked)
                    .await?;
                continue;
            }

            let Some(phase) = epic.phase(id) else {
                continue;
            };

            let mut attempt = 0u32;
            let outcome = loop {
                attempt += 1;
                let orchestrator = PhaseOrchestrator::new(
                    self.services.clone(),
                    epic_ns.clone(),
                    self.policy.clone(),
                )?;
                let outcome = orchestrator.run(phase, cancel.child_token()).await?;
                match outcome.status {
                    RunStatus::Complete | RunStatus::Aborted => break outcome,
                    RunStatus::Failed if attempt <= self.policy.phase_retry_budget => {
                        warn!(
                            phase_id = %phase.id,
                            attempt,
                            budget = self.policy.phase_retry_budget,
                            "phase failed; retrying under budget"
                        );
                    }
                    RunStatus::Failed => break outcome,
                }
            };

            if outcome.status == RunStatus::Aborted {
                outcomes.insert(id.clone(), outcome);
                return self.aborted(epic, outcomes, blocked).await;
            }
            statuses.insert(
                id.clone(),
                if outcome.is_complete() {
                    WorkStatus::Complete
                } else {
                    WorkStatus::Failed
                },
            );
            outcomes.insert(id.clone(), outcome);
        }

        let all_complete = graph
            .order()
            .iter()
            .all(|id| statuses.get(id) == Some(&WorkStatus::Complete));

        if !all_complete {
            let failed_reasons: Vec<String> = graph
                .order()
                .iter()
                .filter_map(|id| match statuses.get(id) {
                    Some(WorkStatus::Failed) => Some(format!("phase {id} failed")),
                    Some(WorkStatus::Blocked) => Some(format!("phase {id} blocked")),
                    _ => None,
                })
                .collect();
            return self
                .finish(epic, &epic_ns, RunStatus::Failed, outcomes, blocked, None, failed_reasons)
                .await;
        }

        // Epic-level consensus across the whole body of work.
        let subject = ReviewSubject {
            scope_id: epic.id.clone(),
            name: epic.name.clone(),
            acceptance_criteria: epic.epic_acceptance_criteria.clone(),
            artifacts: outcomes
                .values()
                .flat_map(|phase| phase.sprint_outcomes.values())
                .flat_map(|sprint| sprint.artifacts.iter().cloned())
                .collect(),
        };
        let ctx = ExecutionContext::new(&epic_ns.prefix(), cancel.child_token());
        let round = run_validator_swarm(
            self.services.executor.clone(),
            self.services.builder.as_ref(),
            &self.policy.swarm.epic_validators,
            &subject,
            self.policy.swarm.validator_deadline,
            self.policy.swarm.max_agents,
            &ctx,
        )
        .await;
        let report = gates::evaluate_consensus(&self.policy.consensus_gate, &round.votes);
        let consensus = Some(ConsensusSample {
            loop2_iter: 1,
            approvals: report.approvals,
            ballots: report.ballots,
            approval_rate: report.approval_rate,
            avg_confidence: report.avg_confidence,
            passed: report.passed,
        });
        self.services.telemetry.emit(&OrchestratorEvent::ConsensusEvaluated {
            scope_id: epic.id.clone(),
            loop2_iter: 1,
            approval_rate: report.approval_rate,
            avg_confidence: report.avg_confidence,
            passed: report.passed,
        });
        info!(
            epic_id = %epic.id,
            approval_rate = report.approval_rate,
            passed = report.passed,
            "epic consensus evaluated"
        );

        if report.passed {
            self.finish(epic, &epic_ns, RunStatus::Complete, outcomes, blocked, consensus, vec![])
                .await
        } else {
            let failed_reasons: Vec<String> = round
                .votes
                .iter()
                .filter(|v| !v.is_approve())
                .flat_map(|v| v.reasons.iter().cloned())
                .collect();
            self.finish(
                epic,
                &epic_ns,
                RunStatus::Failed,
                outcomes,
                blocked,
                consensus,
                failed_reasons,
            )
            .await
        }
    }

    async fn mark_blocked(
        &self,
        epic: &Epic,
        epic_ns: &Namespace,
        phase_id: &str,
        failed_dep: &str,
        statuses: &mut HashMap<String, WorkStatus>,
        blocked: &mut Vec<String>,
    ) -> Result<(), OrchestrationError> {
        statuses.insert(phase_id.to_string(), WorkStatus::Blocked);
        blocked.push(phase_id.to_string());
        self.services
            .store
            .put(
                &epic_ns.phase(phase_id)?.status_key(),
                serde_json::to_value(StatusRecord::with_detail(
                    WorkStatus::Blocked,
                    &format!("dependency {failed_dep} did not complete"),
                ))?,
                None,
            )
            .await?;
        self.services
            .observer
            .status_changed(
                &StatusScope::Phase {
                    epic_id: epic.id.clone(),
                    phase_id: phase_id.to_string(),
                },
                WorkStatus::Blocked,
            )
            .await;
        info!(phase_id, failed_dep, "phase blocked");
        Ok(())
    }

    async fn aborted(
        &self,
        epic: &Epic,
        outcomes: BTreeMap<String, PhaseOutcome>,
        blocked: Vec<String>,
    ) -> Result<EpicOutcome, OrchestrationError> {
        self.services.telemetry.emit(&OrchestratorEvent::EpicFinished {
            epic_id: epic.id.clone(),
            outcome: RunStatus::Aborted.to_string(),
        });
        info!(epic_id = %epic.id, "epic aborted");
        Ok(EpicOutcome {
            epic_id: epic.id.clone(),
            status: RunStatus::Aborted,
            phase_outcomes: outcomes,
            blocked_phases: blocked,
            consensus: None,
            failed_reasons: vec!["epic aborted".to_string()],
        })
    }

    async fn write_epic_status(
        &self,
        epic_ns: &Namespace,
        epic: &Epic,
        status: WorkStatus,
        detail: Option<&str>,
    ) -> Result<(), OrchestrationError> {
        let record = match detail {
            Some(detail) => StatusRecord::with_detail(status, detail),
            None => StatusRecord::new(status),
        };
        self.services
            .store
            .put(&epic_ns.status_key(), serde_json::to_value(record)?, None)
            .await?;
        self.services
            .observer
            .status_changed(
                &StatusScope::Epic {
                    epic_id: epic.id.clone(),
                },
                status,
            )
            .await;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish(
        &self,
        epic: &Epic,
        epic_ns: &Namespace,
        status: RunStatus,
        outcomes: BTreeMap<String, PhaseOutcome>,
        blocked: Vec<String>,
        consensus: Option<ConsensusSample>,
        failed_reasons: Vec<String>,
    ) -> Result<EpicOutcome, OrchestrationError> {
        let work_status = if status.is_complete() {
            WorkStatus::Complete
        } else {
            WorkStatus::Failed
        };
        let detail = failed_reasons.join("; ");
        self.write_epic_status(
            epic_ns,
            epic,
            work_status,
            (!detail.is_empty()).then_some(detail.as_str()),
        )
        .await?;
        self.services.telemetry.emit(&OrchestratorEvent::EpicFinished {
            epic_id: epic.id.clone(),
            outcome: status.to_string(),
        });
        info!(epic_id = %epic.id, status = %status, "epic finished");
        Ok(EpicOutcome {
            epic_id: epic.id.clone(),
            status,
            phase_outcomes: outcomes,
            blocked_phases: blocked,
            consensus,
            failed_reasons,
        })
    }
}
