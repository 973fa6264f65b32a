//! CFN Loop Orchestrator
//!
//! A three-loop self-correcting execution engine for epic → phase →
//! sprint work hierarchies:
//!
//! - **Loop 3** spawns a primary agent swarm and gates on self-reported
//!   confidence (min and mean thresholds).
//! - **Loop 2** spawns a validator swarm and gates on Byzantine-style
//!   approval consensus; rejections become feedback packets the next
//!   primary pass reads.
//! - **Loop 1** is the completion envelope: authoritative status write,
//!   observer update, signed completion signal.
//!
//! Coordination signals are acknowledged with HMAC-SHA256-signed
//! records persisted under a TTL; circuit breakers isolate swarm
//! failures; dependency DAGs order sprints and phases with cycle
//! refusal up front. Agent execution, the durable KV store, and the
//! pub/sub transport are injected behind traits — the engine never
//! talks to an LLM or a database directly.
//!
//! # Wiring
//!
//! ```rust,ignore
//! use cfn_loop::{
//!     CoordinationBus, EpicOrchestrator, InMemoryStore, LoopPolicy, Services, SigningKey,
//! };
//!
//! let store = Arc::new(InMemoryStore::new());
//! let bus = Arc::new(CoordinationBus::new(
//!     "epic-coordinator",
//!     SigningKey::from_env()?, // BLOCKING_COORDINATION_SECRET
//!     store.clone(),
//!     Duration::from_secs(3600),
//! )?);
//! let services = Services::new(executor, store, bus);
//! let orchestrator = EpicOrchestrator::new(services, LoopPolicy::default())?;
//! let outcome = orchestrator.run(&epic, CancellationToken::new()).await?;
//! ```

pub mod agent;
pub mod breaker;
pub mod epic;
pub mod error;
pub mod loops;
pub mod memory;
pub mod observer;
pub mod phase;
pub mod plan;
pub mod policy;
pub mod services;
pub mod signal;
pub mod telemetry;

// Re-export the orchestrator surface
pub use epic::{EpicOrchestrator, EpicOutcome};
pub use error::OrchestrationError;
pub use loops::{LoopLevel, LoopRunner, LoopState, LoopStep, SprintOutcome, SprintStatus};
pub use phase::{PhaseOrchestrator, PhaseOutcome, RunStatus};
pub use services::Services;

// Re-export the injected seams
pub use agent::{
    AgentError, AgentExecutor, AgentResult, AgentTask, AgentTaskBuilder, DefaultTaskBuilder,
    ExecutionContext, ReviewSubject, ValidatorVote, VoteDecision,
};
pub use memory::{InMemoryStore, MemoryError, MemoryStore, Namespace, StatusRecord};
pub use observer::{FileStatusObserver, NullObserver, StatusObserver, StatusScope};
pub use telemetry::{BroadcastSink, NullSink, OrchestratorEvent, TelemetrySink, TracingSink};

// Re-export policy and model types
pub use plan::{
    DependencyEdge, DependencyGraph, Epic, GraphError, Phase, Sprint, SprintTask, WorkStatus,
};
pub use policy::{
    ConfidenceGate, ConsensusGate, LoopPolicy, PolicyError, SwarmConfig, ValidatorRole,
    ValidatorSpec,
};

// Re-export the signal protocol
pub use breaker::{CircuitBreaker, CircuitOpen, CircuitState};
pub use loops::FeedbackPacket;
pub use signal::{
    CoordinationBus, Signal, SignalAck, SignalError, SignalKind, SigningKey, SECRET_ENV_VAR,
};
