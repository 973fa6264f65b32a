//! Work hierarchy model and dependency resolution.

pub mod graph;
pub mod types;

pub use graph::{DependencyGraph, GraphError};
pub use types::{DependencyEdge, Epic, Phase, Sprint, SprintTask, WorkStatus};
