//! Durable memory — the authoritative system of record.
//!
//! The orchestrators persist every status, confidence score, feedback
//! packet, and loop-state snapshot through [`MemoryStore`]. Any KV with
//! GET / SETEX / DEL / KEYS-pattern semantics can implement the trait;
//! [`InMemoryStore`] is the in-process reference implementation used by
//! tests and single-node runs.
//!
//! Keys are flat hierarchical strings rooted at `cfn/`. Every segment is
//! validated against `^[A-Za-z0-9_-]+$` before a key is formed, closing
//! off key-injection through crafted identifiers.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::plan::WorkStatus;

/// Root prefix for all orchestrator-owned keys.
pub const KEY_ROOT: &str = "cfn";

static ID_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_-]+$").expect("identifier regex should compile"));

/// Identifier rejected before any store key was formed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("identifier {0:?} must match ^[A-Za-z0-9_-]+$")]
pub struct InvalidId(pub String);

/// Validate a single key segment or coordinator/signal identifier.
pub fn validate_id(id: &str) -> Result<(), InvalidId> {
    if ID_PATTERN.is_match(id) {
        Ok(())
    } else {
        Err(InvalidId(id.to_string()))
    }
}

/// Store-level failures.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("store backend failure: {0}")]
    Backend(String),

    #[error(transparent)]
    InvalidId(#[from] InvalidId),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Abstract KV interface consumed by the orchestrators.
///
/// Guarantees required of implementations: read-your-writes within one
/// coordinator's process; cross-process reads may lag (readers tolerate
/// stale data within the store's replication window).
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Store `value` under `key`, optionally expiring after `ttl`.
    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), MemoryError>;

    /// Fetch the value at `key`, if present and unexpired.
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, MemoryError>;

    /// All `(key, value)` pairs whose key matches a `*`-glob pattern.
    async fn search(&self, pattern: &str)
        -> Result<Vec<(String, serde_json::Value)>, MemoryError>;

    /// Delete every key matching a `*`-glob pattern; returns the count.
    async fn delete(&self, pattern: &str) -> Result<usize, MemoryError>;
}

/// A validated key prefix scoping one orchestrator's writes.
///
/// Two orchestrators must never share overlapping namespaces; building
/// the namespace from validated ids enforces the shape, callers enforce
/// disjointness by construction (one orchestrator per epic).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    segments: Vec<String>,
}

impl Namespace {
    /// Epic-level namespace: `cfn/{epic}`.
    pub fn epic(epic_id: &str) -> Result<Self, InvalidId> {
        validate_id(epic_id)?;
        Ok(Self {
            segments: vec![epic_id.to_string()],
        })
    }

    /// Descend into a phase: `cfn/{epic}/{phase}`.
    pub fn phase(&self, phase_id: &str) -> Result<Self, InvalidId> {
        validate_id(phase_id)?;
        let mut segments = self.segments.clone();
        segments.push(phase_id.to_string());
        Ok(Self { segments })
    }

    /// Descend into a sprint: `cfn/{epic}/{phase}/{sprint}`.
    pub fn sprint(&self, sprint_id: &str) -> Result<Self, InvalidId> {
        validate_id(sprint_id)?;
        let mut segments = self.segments.clone();
        segments.push(sprint_id.to_string());
        Ok(Self { segments })
    }

    /// The key prefix, e.g. `cfn/epic-1/phase-2`.
    pub fn prefix(&self) -> String {
        let mut key = String::from(KEY_ROOT);
        for segment in &self.segments {
            key.push('/');
            key.push_str(segment);
        }
        key
    }

    /// Status record key for this scope.
    pub fn status_key(&self) -> String {
        format!("{}/status", self.prefix())
    }

    /// Per-agent confidence key (sprint scope).
    pub fn confidence_key(&self, agent_id: &str) -> Result<String, InvalidId> {
        validate_id(agent_id)?;
        Ok(format!("{}/confidence/{agent_id}", self.prefix()))
    }

    /// Feedback packet key for one consensus iteration (sprint scope).
    pub fn feedback_key(&self, loop2_iter: u32) -> String {
        format!("{}/feedback/{loop2_iter}", self.prefix())
    }

    /// Glob matching every feedback packet under this scope.
    pub fn feedback_pattern(&self) -> String {
        format!("{}/feedback/*", self.prefix())
    }

    /// Loop-state snapshot key (sprint scope).
    pub fn loop_state_key(&self) -> String {
        format!("{}/loop_state", self.prefix())
    }

    /// Last segment (the scope's own id).
    pub fn leaf(&self) -> &str {
        self.segments.last().map(String::as_str).unwrap_or(KEY_ROOT)
    }
}

impl std::fmt::Display for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.prefix())
    }
}

/// Status record persisted at a scope's `status` key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: WorkStatus,
    pub updated_at: chrono::DateTime<chrono::Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StatusRecord {
    pub fn new(status: WorkStatus) -> Self {
        Self {
            status,
            updated_at: chrono::Utc::now(),
            detail: None,
        }
    }

    pub fn with_detail(status: WorkStatus, detail: &str) -> Self {
        Self {
            status,
            updated_at: chrono::Utc::now(),
            detail: Some(detail.to_string()),
        }
    }
}

struct Entry {
    value: serde_json::Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Mutex-guarded map with lazy TTL eviction.
#[derive(Default)]
pub struct InMemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live (unexpired) entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .expect("store lock poisoned")
            .values()
            .filter(|e| !e.expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn glob_to_regex(pattern: &str) -> Regex {
    let mut escaped = String::with_capacity(pattern.len() + 8);
    escaped.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => escaped.push_str(".*"),
            c => escaped.push_str(&regex::escape(&c.to_string())),
        }
    }
    escaped.push('$');
    Regex::new(&escaped).expect("escaped glob should compile")
}

#[async_trait]
impl MemoryStore for InMemoryStore {
    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), MemoryError> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|t| Instant::now() + t),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>, MemoryError> {
        let mut entries = self.entries.lock().expect("store lock poisoned");
        let now = Instant::now();
        if entries.get(key).is_some_and(|e| e.expired(now)) {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|e| e.value.clone()))
    }

    async fn search(
        &self,
        pattern: &str,
    ) -> Result<Vec<(String, serde_json::Value)>, MemoryError> {
        let re = glob_to_regex(pattern);
        let mut entries = self.entries.lock().expect("store lock poisoned");
        let now = Instant::now();
        entries.retain(|_, e| !e.expired(now));
        let mut hits: Vec<(String, serde_json::Value)> = entries
            .iter()
            .filter(|(k, _)| re.is_match(k))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect();
        hits.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(hits)
    }

    async fn delete(&self, pattern: &str) -> Result<usize, MemoryError> {
        let re = glob_to_regex(pattern);
        let mut entries = self.entries.lock().expect("store lock poisoned");
        let now = Instant::now();
        entries.retain(|_, e| !e.expired(now));
        let before = entries.len();
        entries.retain(|k, _| !re.is_match(k));
        Ok(before - entries.len())
    }
}
