//! Signal ACK protocol — attested coordination handoff.
//!
//! Coordinators publish [`Signal`]s and acknowledge them with
//! HMAC-signed [`SignalAck`] records persisted under a TTL. Every read
//! re-verifies the signature; a record that does not verify is
//! discarded and the coordinator treated as unresponsive. Acknowledging
//! is idempotent per `(coordinator, signal)`: the first ACK is
//! authoritative and repeated calls return it byte-identically.

pub mod signature;

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

pub use signature::{canonical_string, SigningKey, SECRET_ENV_VAR};

use crate::memory::{validate_id, InvalidId, MemoryError, MemoryStore};
use crate::telemetry::{NullSink, OrchestratorEvent, TelemetrySink};

/// Polling interval for [`CoordinationBus::wait_for_acks`].
pub const ACK_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Broadcast capacity for in-process signal delivery.
const CHANNEL_CAPACITY: usize = 256;

/// Failures in the signal protocol.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("coordination secret missing; set {SECRET_ENV_VAR}")]
    MissingSecret,

    #[error(transparent)]
    InvalidId(#[from] InvalidId),

    #[error("signature mismatch on ack {coordinator_id}:{signal_id}; record discarded")]
    SignatureMismatch {
        coordinator_id: String,
        signal_id: String,
    },

    #[error("memory store: {0}")]
    Store(#[from] MemoryError),

    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// What a signal announces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    Completion,
    Retry,
    Validation,
    Error,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completion => write!(f, "completion"),
            Self::Retry => write!(f, "retry"),
            Self::Validation => write!(f, "validation"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// A coordination signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub signal_id: String,
    pub kind: SignalKind,
    /// Coordinator that emitted the signal.
    pub source: String,
    /// Coordinators expected to acknowledge.
    pub targets: Vec<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Signal {
    /// New signal with a generated id.
    pub fn new(
        kind: SignalKind,
        source: &str,
        targets: Vec<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            signal_id: Uuid::new_v4().to_string(),
            kind,
            source: source.to_string(),
            targets,
            payload,
            created_at: Utc::now(),
        }
    }
}

/// ACK lifecycle state. Only one state exists today; the enum keeps the
/// wire field typed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Received,
}

/// A signed acknowledgment record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalAck {
    pub coordinator_id: String,
    pub signal_id: String,
    /// Unix seconds at signing time; part of the canonical string.
    pub timestamp: i64,
    /// The coordinator's iteration counter at signing time.
    pub iteration: u64,
    pub status: AckStatus,
    /// Hex HMAC-SHA256 over `coordinator:signal:timestamp:iteration`.
    pub signature: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl SignalAck {
    /// The string this record's signature covers.
    pub fn canonical(&self) -> String {
        canonical_string(
            &self.coordinator_id,
            &self.signal_id,
            self.timestamp,
            self.iteration,
        )
    }
}

/// Store key for a persisted ACK.
pub fn ack_key(coordinator_id: &str, signal_id: &str) -> String {
    format!("blocking:ack:{coordinator_id}:{signal_id}")
}

/// Store key for a persisted signal payload.
pub fn signal_key(signal_id: &str) -> String {
    format!("blocking:signal:{signal_id}")
}

/// Reliable, attested signal handoff for one coordinator.
pub struct CoordinationBus {
    coordinator_id: String,
    key: SigningKey,
    store: Arc<dyn MemoryStore>,
    ack_ttl: Duration,
    iteration: AtomicU64,
    /// In-process idempotency; across restarts the stored ACK recovers it.
    processed: Mutex<HashSet<String>>,
    notify: broadcast::Sender<Signal>,
    telemetry: Arc<dyn TelemetrySink>,
}

impl std::fmt::Debug for CoordinationBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationBus")
            .field("coordinator_id", &self.coordinator_id)
            .field("ack_ttl", &self.ack_ttl)
            .field("iteration", &self.iteration)
            .finish_non_exhaustive()
    }
}

impl CoordinationBus {
    /// Build a bus for `coordinator_id`. The signing key is mandatory;
    /// construct it with [`SigningKey::from_env`] for the conventional
    /// environment wiring.
    pub fn new(
        coordinator_id: &str,
        key: SigningKey,
        store: Arc<dyn MemoryStore>,
        ack_ttl: Duration,
    ) -> Result<Self, SignalError> {
        validate_id(coordinator_id)?;
        let (notify, _) = broadcast::channel(CHANNEL_CAPACITY);
        Ok(Self {
            coordinator_id: coordinator_id.to_string(),
            key,
            store,
            ack_ttl,
            iteration: AtomicU64::new(0),
            processed: Mutex::new(HashSet::new()),
            notify,
            telemetry: Arc::new(NullSink),
        })
    }

    /// Attach a telemetry sink (security faults and acknowledgments).
    pub fn with_telemetry(mut self, telemetry: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn coordinator_id(&self) -> &str {
        &self.coordinator_id
    }

    /// Record the signal payload and notify in-process subscribers.
    pub async fn publish(&self, signal: &Signal) -> Result<(), SignalError> {
        validate_id(&signal.signal_id)?;
        validate_id(&signal.source)?;
        for target in &signal.targets {
            validate_id(target)?;
        }

        let value = serde_json::to_value(signal)?;
        self.store
            .put(&signal_key(&signal.signal_id), value, Some(self.ack_ttl))
            .await?;

        // No receivers is fine; cross-process subscribers poll the store.
        let _ = self.notify.send(signal.clone());
        debug!(
            signal_id = %signal.signal_id,
            kind = %signal.kind,
            source = %signal.source,
            "signal published"
        );
        Ok(())
    }

    /// Subscribe to in-process signal delivery.
    pub fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.notify.subscribe()
    }

    /// Acknowledge `signal` before processing it. Idempotent: the first
    /// ACK for `(coordinator, signal)` is authoritative and every later
    /// call returns that record unchanged, signature included.
    pub async fn acknowledge(&self, signal: &Signal) -> Result<SignalAck, SignalError> {
        validate_id(&signal.signal_id)?;
        let key = ack_key(&self.coordinator_id, &signal.signal_id);

        // The stored record is authoritative for idempotency, in this
        // process and across restarts alike. The processed cache only
        // marks signals this process has handled.
        match self
            .read_verified(&self.coordinator_id, &signal.signal_id)
            .await
        {
            Ok(Some(ack)) => {
                self.mark_processed(&key);
                return Ok(ack);
            }
            Ok(None) => {}
            // A forged or corrupt record was discarded; a fresh
            // legitimate ACK replaces it below.
            Err(SignalError::SignatureMismatch { .. }) => {}
            Err(err) => return Err(err),
        }

        let timestamp = Utc::now().timestamp();
        let iteration = self.current_iteration();
        let signature = self.key.sign(&canonical_string(
            &self.coordinator_id,
            &signal.signal_id,
            timestamp,
            iteration,
        ));
        let ack = SignalAck {
            coordinator_id: self.coordinator_id.clone(),
            signal_id: signal.signal_id.clone(),
            timestamp,
            iteration,
            status: AckStatus::Received,
            signature,
            metadata: None,
        };

        self.store
            .put(&key, serde_json::to_value(&ack)?, Some(self.ack_ttl))
            .await?;
        self.mark_processed(&key);

        self.telemetry.emit(&OrchestratorEvent::SignalAcknowledged {
            coordinator_id: self.coordinator_id.clone(),
            signal_id: signal.signal_id.clone(),
            iteration,
        });
        debug!(
            coordinator_id = %self.coordinator_id,
            signal_id = %signal.signal_id,
            iteration,
            "signal acknowledged"
        );
        Ok(ack)
    }

    /// Fetch and verify a stored ACK. A record whose signature does not
    /// verify is a security fault: it is deleted, logged, and surfaced
    /// as [`SignalError::SignatureMismatch`].
    pub async fn get_ack(
        &self,
        coordinator_id: &str,
        signal_id: &str,
    ) -> Result<Option<SignalAck>, SignalError> {
        validate_id(coordinator_id)?;
        validate_id(signal_id)?;
        self.read_verified(coordinator_id, signal_id).await
    }

    /// Poll for ACKs from `coordinator_ids` until all arrive or
    /// `timeout` elapses. Coordinators with signature faults count as
    /// unresponsive; absentees are simply missing from the result.
    pub async fn wait_for_acks(
        &self,
        coordinator_ids: &[String],
        signal_id: &str,
        timeout: Duration,
    ) -> Result<HashMap<String, SignalAck>, SignalError> {
        validate_id(signal_id)?;
        for coordinator in coordinator_ids {
            validate_id(coordinator)?;
        }

        let deadline = Instant::now() + timeout;
        let mut collected: HashMap<String, SignalAck> = HashMap::new();

        loop {
            for coordinator in coordinator_ids {
                if collected.contains_key(coordinator) {
                    continue;
                }
                match self.read_verified(coordinator, signal_id).await {
                    Ok(Some(ack)) => {
                        collected.insert(coordinator.clone(), ack);
                    }
                    Ok(None) => {}
                    Err(SignalError::SignatureMismatch { .. }) => {
                        // Discarded forged record; keep waiting for the
                        // legitimate ACK until the deadline.
                    }
                    Err(err) => return Err(err),
                }
            }

            if collected.len() == coordinator_ids.len() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            tokio::time::sleep(ACK_POLL_INTERVAL.min(deadline - now)).await;
        }

        Ok(collected)
    }

    /// Whether this process has already acknowledged `signal_id`.
    /// Receivers use this to skip duplicate deliveries without a store
    /// round-trip; across restarts the stored ACK takes over.
    pub fn is_processed(&self, signal_id: &str) -> bool {
        self.processed
            .lock()
            .expect("processed-set lock poisoned")
            .contains(&ack_key(&self.coordinator_id, signal_id))
    }

    /// Bump the iteration counter, returning the new value.
    pub fn increment_iteration(&self) -> u64 {
        self.iteration.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The current iteration counter.
    pub fn current_iteration(&self) -> u64 {
        self.iteration.load(Ordering::SeqCst)
    }

    /// Reset the iteration counter to zero.
    pub fn reset_iteration(&self) {
        self.iteration.store(0, Ordering::SeqCst);
    }

    fn mark_processed(&self, key: &str) {
        self.processed
            .lock()
            .expect("processed-set lock poisoned")
            .insert(key.to_string());
    }

    async fn read_verified(
        &self,
        coordinator_id: &str,
        signal_id: &str,
    ) -> Result<Option<SignalAck>, SignalError> {
        let key = ack_key(coordinator_id, signal_id);
        let Some(value) = self.store.get(&key).await? else {
            return Ok(None);
        };

        let fault = |this: &Self| {
            warn!(
                coordinator_id,
                signal_id, "ack signature verification failed; record discarded"
            );
            this.telemetry.emit(&OrchestratorEvent::SecurityFault {
                coordinator_id: coordinator_id.to_string(),
                signal_id: signal_id.to_string(),
            });
            SignalError::SignatureMismatch {
                coordinator_id: coordinator_id.to_string(),
                signal_id: signal_id.to_string(),
            }
        };

        let Ok(ack) = serde_json::from_value::<SignalAck>(value) else {
            self.store.delete(&key).await?;
            return Err(fault(self));
        };

        if ack.signature.is_empty() || !self.key.verify(&ack.canonical(), &ack.signature) {
            self.store.delete(&key).await?;
            return Err(fault(self));
        }

        Ok(Some(ack))
    }
}
