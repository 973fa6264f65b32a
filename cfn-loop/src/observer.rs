//! One-way status observers.
//!
//! Observers mirror status changes into human-facing places (markdown
//! files, dashboards). They are never the system of record — the memory
//! store is — so observer failures are logged and swallowed, and the
//! orchestrator never reads anything back.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::warn;

use crate::plan::WorkStatus;

/// Which unit of work changed status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusScope {
    Epic {
        epic_id: String,
    },
    Phase {
        epic_id: String,
        phase_id: String,
    },
    Sprint {
        epic_id: String,
        phase_id: String,
        sprint_id: String,
    },
}

impl StatusScope {
    /// Slash-joined path of the scope.
    pub fn path(&self) -> String {
        match self {
            Self::Epic { epic_id } => epic_id.clone(),
            Self::Phase { epic_id, phase_id } => format!("{epic_id}/{phase_id}"),
            Self::Sprint {
                epic_id,
                phase_id,
                sprint_id,
            } => format!("{epic_id}/{phase_id}/{sprint_id}"),
        }
    }
}

/// Human-readable marker for a status.
pub fn status_marker(status: WorkStatus) -> &'static str {
    match status {
        WorkStatus::NotStarted => "❌ Not Started",
        WorkStatus::InProgress => "🔄 In Progress",
        WorkStatus::Complete => "✅ Complete",
        WorkStatus::Failed => "❌ Failed",
        WorkStatus::Blocked => "⛔ Blocked",
    }
}

/// One-way sink for status changes.
#[async_trait]
pub trait StatusObserver: Send + Sync {
    /// Record a status change. Must not fail the caller.
    async fn status_changed(&self, scope: &StatusScope, status: WorkStatus);
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullObserver;

#[async_trait]
impl StatusObserver for NullObserver {
    async fn status_changed(&self, _scope: &StatusScope, _status: WorkStatus) {}
}

/// Appends one marker line per transition to a journal file.
#[derive(Debug)]
pub struct FileStatusObserver {
    path: PathBuf,
}

impl FileStatusObserver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl StatusObserver for FileStatusObserver {
    async fn status_changed(&self, scope: &StatusScope, status: WorkStatus) {
        let line = format!("{} — {}\n", status_marker(status), scope.path());
        let result = async {
            use tokio::io::AsyncWriteExt;
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            file.flush().await
        }
        .await;

        if let Err(err) = result {
            warn!(path = %self.path.display(), error = %err, "status observer write failed");
        }
    }
}
