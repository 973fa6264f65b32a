//! The three-loop execution engine.
//!
//! `state` holds the step machine, `gates` the pure gate math,
//! `feedback` the validator-feedback plumbing, and `runner` the driver
//! that ties them to swarms, breakers, and the signal bus.

pub mod feedback;
pub mod gates;
pub mod runner;
pub mod state;

pub use feedback::FeedbackPacket;
pub use gates::{ConfidenceReport, ConsensusReport};
pub use runner::{LoopRunner, SprintOutcome, SprintStatus};
pub use state::{LoopLevel, LoopState, LoopStep};
