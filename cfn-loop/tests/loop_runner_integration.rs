//! Mocked loop-runner integration tests — the full three-loop cycle
//! with deterministic scripted swarms (no LLM calls).
//!
//! Covers: happy path, confidence retry, consensus retry with feedback
//! injection, autonomous cap extension, and the cap boundaries.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use cfn_loop::{
    AgentError, AgentExecutor, AgentResult, AgentTask, CoordinationBus, ExecutionContext,
    InMemoryStore, LoopLevel, LoopPolicy, LoopRunner, MemoryStore, Namespace, Services,
    SigningKey, Sprint, SprintStatus, SprintTask, ValidatorVote, WorkStatus,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .try_init();
}

/// Replays scripted confidences and ballots per agent id. Once a script
/// runs dry the defaults (0.9, approve) repeat. Also snoops the store
/// and the injected feedback so tests can assert what agents saw.
struct ScriptedSwarm {
    store: Arc<InMemoryStore>,
    confidences: Mutex<HashMap<String, VecDeque<Option<f64>>>>,
    ballots: Mutex<HashMap<String, VecDeque<ValidatorVote>>>,
    feedback_reasons_seen: Mutex<Vec<String>>,
    feedback_key_snapshot: Mutex<Option<serde_json::Value>>,
}

impl ScriptedSwarm {
    fn new(store: Arc<InMemoryStore>) -> Self {
        Self {
            store,
            confidences: Mutex::new(HashMap::new()),
            ballots: Mutex::new(HashMap::new()),
            feedback_reasons_seen: Mutex::new(Vec::new()),
            feedback_key_snapshot: Mutex::new(None),
        }
    }

    fn script_confidence(self, agent_id: &str, scores: &[Option<f64>]) -> Self {
        self.confidences
            .lock()
            .unwrap()
            .insert(agent_id.to_string(), scores.iter().copied().collect());
        self
    }

    fn script_ballots(self, validator_id: &str, votes: Vec<ValidatorVote>) -> Self {
        self.ballots
            .lock()
            .unwrap()
            .insert(validator_id.to_string(), votes.into_iter().collect());
        self
    }

    fn feedback_reasons_seen(&self) -> Vec<String> {
        self.feedback_reasons_seen.lock().unwrap().clone()
    }

    fn feedback_key_snapshot(&self) -> Option<serde_json::Value> {
        self.feedback_key_snapshot.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentExecutor for ScriptedSwarm {
    async fn execute(
        &self,
        task: AgentTask,
        _ctx: &ExecutionContext,
    ) -> Result<AgentResult, AgentError> {
        if let Some(packet) = &task.feedback_context {
            self.feedback_reasons_seen
                .lock()
                .unwrap()
                .extend(packet.aggregated_reasons.iter().cloned());
            // The packet the runner handed us must also be readable at
            // its documented key while the sprint is still running.
            if let Ok(Some(value)) = self
                .store
                .get(&format!(
                    "cfn/epic-1/phase-1/sprint-1/feedback/{}",
                    packet.loop2_iter
                ))
                .await
            {
                *self.feedback_key_snapshot.lock().unwrap() = Some(value);
            }
        }

        let confidence = self
            .confidences
            .lock()
            .unwrap()
            .get_mut(&task.agent_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(Some(0.9));
        Ok(AgentResult {
            agent_id: task.agent_id,
            confidence,
            artifacts: serde_json::json!({"artifact": true}),
            self_report: "scripted run".to_string(),
        })
    }

    async fn validate(
        &self,
        task: AgentTask,
        _ctx: &ExecutionContext,
    ) -> Result<ValidatorVote, AgentError> {
        let vote = self
            .ballots
            .lock()
            .unwrap()
            .get_mut(&task.agent_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| ValidatorVote::approve(&task.agent_id, 0.9));
        Ok(vote)
    }
}

fn scenario_policy() -> LoopPolicy {
    let mut policy = LoopPolicy::default();
    policy.max_loop2 = 3;
    policy.max_loop3 = 3;
    policy.agent_retry_limit = 1;
    policy.swarm.validator_deadline = Duration::from_millis(500);
    policy
}

fn three_agent_sprint() -> Sprint {
    Sprint {
        id: "sprint-1".to_string(),
        name: "Scenario sprint".to_string(),
        status: WorkStatus::NotStarted,
        dependencies: vec![],
        tasks: (0..3)
            .map(|i| SprintTask {
                agent_id: format!("coder-{i}"),
                agent_type: "coder".to_string(),
                instructions: "implement the feature".to_string(),
            })
            .collect(),
        acceptance_criteria: vec!["feature works".to_string()],
    }
}

fn harness(executor: Arc<ScriptedSwarm>, store: Arc<InMemoryStore>, policy: LoopPolicy) -> LoopRunner {
    let bus = CoordinationBus::new(
        "loop-coordinator",
        SigningKey::new("integration-secret").unwrap(),
        store.clone(),
        Duration::from_secs(3600),
    )
    .unwrap();
    let services = Services::new(executor, store, Arc::new(bus));
    let namespace = Namespace::epic("epic-1")
        .unwrap()
        .phase("phase-1")
        .unwrap()
        .sprint("sprint-1")
        .unwrap();
    LoopRunner::new(services, namespace, policy).unwrap()
}

// ── S1: happy path, three agents, unanimous validators ─────────────

#[tokio::test]
async fn test_happy_path_single_pass() {
    init_tracing();
    let store = Arc::new(InMemoryStore::new());
    let executor = Arc::new(
        ScriptedSwarm::new(store.clone())
            .script_confidence("coder-0", &[Some(0.80)])
            .script_confidence("coder-1", &[Some(0.82)])
            .script_confidence("coder-2", &[Some(0.90)]),
    );
    let runner = harness(executor.clone(), store, scenario_policy());

    let outcome = runner
        .run(&three_agent_sprint(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, SprintStatus::Complete);
    assert_eq!(outcome.loop3_iter, 1);
    assert_eq!(outcome.loop2_iter, 1);
    let consensus = outcome.final_consensus.unwrap();
    assert_eq!(consensus.ballots, 4);
    assert_eq!(consensus.approvals, 4);
    assert!(executor.feedback_reasons_seen().is_empty());
}

// ── S2: confidence retry, second primary pass clears the gate ──────

#[tokio::test]
async fn test_confidence_retry() {
    let store = Arc::new(InMemoryStore::new());
    let executor = Arc::new(
        ScriptedSwarm::new(store.clone())
            .script_confidence("coder-0", &[Some(0.60), Some(0.80)])
            .script_confidence("coder-1", &[Some(0.90), Some(0.88)])
            .script_confidence("coder-2", &[Some(0.85), Some(0.82)]),
    );
    let runner = harness(executor, store, scenario_policy());

    let outcome = runner
        .run(&three_agent_sprint(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, SprintStatus::Complete);
    assert_eq!(outcome.loop3_iter, 2);
    assert_eq!(outcome.loop2_iter, 1);
    let confidence = outcome.final_confidence.unwrap();
    assert!(confidence.passed);
    assert!((confidence.min - 0.80).abs() < 1e-9);
}

// ── S3: consensus retry — feedback round-trips into the next pass ──

#[tokio::test]
async fn test_consensus_retry_with_feedback_injection() {
    let store = Arc::new(InMemoryStore::new());
    let executor = Arc::new(ScriptedSwarm::new(store.clone()).script_ballots(
        "reviewer-validator",
        vec![
            ValidatorVote::reject("reviewer-validator", 0.9, "missing tests"),
            ValidatorVote::approve("reviewer-validator", 0.92),
        ],
    ));
    let runner = harness(executor.clone(), store.clone(), scenario_policy());

    let outcome = runner
        .run(&three_agent_sprint(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, SprintStatus::Complete);
    assert_eq!(outcome.loop2_iter, 2);

    // The second primary pass received the first round's reasons...
    assert_eq!(
        executor.feedback_reasons_seen(),
        vec!["missing tests".to_string()]
    );
    // ...and the packet was live at its documented key during the run.
    let snapshot = executor.feedback_key_snapshot().unwrap();
    assert_eq!(snapshot["loop2_iter"], 1);
    assert!(snapshot["aggregated_reasons"]
        .as_array()
        .unwrap()
        .contains(&serde_json::json!("missing tests")));
    // Terminated sprints leave no feedback packets behind.
    assert!(store
        .search("cfn/epic-1/phase-1/sprint-1/feedback/*")
        .await
        .unwrap()
        .is_empty());
}

// ── S4: exhaustion with autonomous extension ───────────────────────

#[tokio::test]
async fn test_autonomous_extension_recovers_exhausted_consensus() {
    let store = Arc::new(InMemoryStore::new());
    let executor = Arc::new(ScriptedSwarm::new(store.clone()).script_ballots(
        "security-validator",
        vec![
            ValidatorVote::reject("security-validator", 0.9, "secrets in logs"),
            ValidatorVote::reject("security-validator", 0.9, "secrets in logs"),
            ValidatorVote::approve("security-validator", 0.9),
        ],
    ));
    let mut policy = scenario_policy();
    policy.max_loop2 = 2;
    policy.autonomous_extension = true;
    let runner = harness(executor, store, policy);

    let outcome = runner
        .run(&three_agent_sprint(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(outcome.status, SprintStatus::Complete);
    assert_eq!(outcome.loop2_iter, 3);
}

#[tokio::test]
async fn test_extension_is_one_shot() {
    let store = Arc::new(InMemoryStore::new());
    // Rejects forever: the one-shot bump (2 + 3 = 5 rounds) must not repeat.
    let executor = Arc::new(ScriptedSwarm::new(store.clone()).script_ballots(
        "security-validator",
        std::iter::repeat_with(|| {
            ValidatorVote::reject("security-validator", 0.9, "still leaking")
        })
        .take(32)
        .collect(),
    ));
    let mut policy = scenario_policy();
    policy.max_loop2 = 2;
    policy.autonomous_extension = true;
    let runner = harness(executor, store, policy);

    let outcome = runner
        .run(&three_agent_sprint(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome.status,
        SprintStatus::Exhausted {
            level: LoopLevel::Consensus
        }
    );
    assert_eq!(outcome.loop2_iter, 5);
    let feedback = outcome.final_feedback.unwrap();
    assert_eq!(feedback.aggregated_reasons, vec!["still leaking".to_string()]);
}

// ── Boundary: max_loop3 = 1 ────────────────────────────────────────

#[tokio::test]
async fn test_single_primary_iteration_boundary() {
    let store = Arc::new(InMemoryStore::new());
    let executor = Arc::new(
        ScriptedSwarm::new(store.clone()).script_confidence("coder-0", &[Some(0.50), Some(0.95)]),
    );
    let mut policy = scenario_policy();
    policy.max_loop3 = 1;
    policy.autonomous_extension = false;
    let runner = harness(executor, store, policy);

    let mut sprint = three_agent_sprint();
    sprint.tasks.truncate(1);
    let outcome = runner.run(&sprint, CancellationToken::new()).await.unwrap();

    // Exactly one iteration, then exhausted; the second scripted score
    // is never consumed.
    assert_eq!(
        outcome.status,
        SprintStatus::Exhausted {
            level: LoopLevel::Primary
        }
    );
    assert_eq!(outcome.loop3_iter, 1);
    assert_eq!(outcome.loop2_iter, 0);
}

// ── Boundary: empty validator set is a unanimous reject ────────────

#[tokio::test]
async fn test_empty_validator_set_rejects() {
    let store = Arc::new(InMemoryStore::new());
    let executor = Arc::new(ScriptedSwarm::new(store.clone()));
    let mut policy = scenario_policy();
    policy.max_loop2 = 1;
    policy.autonomous_extension = false;
    policy.swarm.sprint_validators.clear();
    let runner = harness(executor, store, policy);

    let outcome = runner
        .run(&three_agent_sprint(), CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        outcome.status,
        SprintStatus::Exhausted {
            level: LoopLevel::Consensus
        }
    );
    let consensus = outcome.final_consensus.unwrap();
    assert_eq!(consensus.ballots, 0);
    assert!(!consensus.passed);
}

// ── Invariant: observed iterations never exceed the caps ───────────

#[tokio::test]
async fn test_iteration_caps_respected_under_constant_failure() {
    let store = Arc::new(InMemoryStore::new());
    let executor = Arc::new(
        ScriptedSwarm::new(store.clone()).script_confidence(
            "coder-0",
            &std::iter::repeat(Some(0.1)).take(32).collect::<Vec<_>>(),
        ),
    );
    let mut policy = scenario_policy();
    policy.max_loop3 = 2;
    policy.autonomous_extension = false;
    let runner = harness(executor, store, policy);

    let mut sprint = three_agent_sprint();
    sprint.tasks.truncate(1);
    let outcome = runner.run(&sprint, CancellationToken::new()).await.unwrap();

    assert_eq!(
        outcome.status,
        SprintStatus::Exhausted {
            level: LoopLevel::Primary
        }
    );
    assert!(outcome.loop3_iter <= 2);
    assert_eq!(outcome.loop3_total, 2);
}
