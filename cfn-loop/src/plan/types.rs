//! Epic → phase → sprint work hierarchy.
//!
//! These types deserialize directly from the external epic configuration
//! (camelCase keys, fixed status vocabulary). Unknown fields are rejected
//! at the boundary; the orchestrators never see untyped bags.

use serde::{Deserialize, Serialize};

/// Lifecycle status of any unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStatus {
    /// Not yet scheduled.
    NotStarted,
    /// Currently executing.
    InProgress,
    /// Finished and accepted.
    Complete,
    /// Finished without acceptance.
    Failed,
    /// Prevented from starting by a failed dependency.
    Blocked,
}

impl WorkStatus {
    /// Whether this status ends the unit's lifecycle.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Failed | Self::Blocked)
    }
}

impl Default for WorkStatus {
    fn default() -> Self {
        Self::NotStarted
    }
}

impl std::fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Complete => write!(f, "complete"),
            Self::Failed => write!(f, "failed"),
            Self::Blocked => write!(f, "blocked"),
        }
    }
}

/// One primary-agent assignment inside a sprint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SprintTask {
    /// Stable agent identifier (key-safe).
    pub agent_id: String,
    /// Agent capability label (e.g. `coder`, `backend-dev`).
    pub agent_type: String,
    /// What the agent is asked to do.
    pub instructions: String,
}

/// A sprint: the unit the three-loop runner executes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Sprint {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: WorkStatus,
    /// Sprint ids this sprint depends on (within the same phase).
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub tasks: Vec<SprintTask>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
}

/// A phase: a DAG of sprints plus a phase-level consensus gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Phase {
    #[serde(rename = "phaseId")]
    pub id: String,
    pub name: String,
    /// Markdown file this phase was parsed from; observer-only.
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub status: WorkStatus,
    /// Phase ids this phase depends on.
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub sprints: Vec<Sprint>,
}

/// A directed dependency edge between phases (`to` depends on `from`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DependencyEdge {
    pub from: String,
    pub to: String,
}

/// Top of the work hierarchy, consumed from parsed configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Epic {
    #[serde(rename = "epicId")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub status: WorkStatus,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub estimated_duration: Option<String>,
    #[serde(default)]
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub epic_acceptance_criteria: Vec<String>,
    /// Dependencies between phases in addition to each phase's own list.
    #[serde(default)]
    pub cross_phase_dependencies: Vec<DependencyEdge>,
}

impl Epic {
    /// Look up a phase by id.
    pub fn phase(&self, id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == id)
    }

    /// All phase dependency edges: per-phase lists plus cross-phase edges,
    /// as `(dependency, dependent)` pairs.
    pub fn phase_edges(&self) -> Vec<(String, String)> {
        let mut edges = Vec::new();
        for phase in &self.phases {
            for dep in &phase.dependencies {
                edges.push((dep.clone(), phase.id.clone()));
            }
        }
        for edge in &self.cross_phase_dependencies {
            edges.push((edge.from.clone(), edge.to.clone()));
        }
        edges
    }
}

impl Phase {
    /// Look up a sprint by id.
    pub fn sprint(&self, id: &str) -> Option<&Sprint> {
        self.sprints.iter().find(|s| s.id == id)
    }

    /// Sprint dependency edges as `(dependency, dependent)` pairs.
    pub fn sprint_edges(&self) -> Vec<(String, String)> {
        let mut edges = Vec::new();
        for sprint in &self.sprints {
            for dep in &sprint.dependencies {
                edges.push((dep.clone(), sprint.id.clone()));
            }
        }
        edges
    }
}
