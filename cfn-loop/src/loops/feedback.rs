//! Validator feedback — aggregation, persistence, pruning.
//!
//! When a consensus gate fails, the rejecting ballots are folded into a
//! [`FeedbackPacket`] and written under `{ns}/feedback/{loop2_iter}`
//! before Loop 3 re-entry, so the next primary swarm sees exactly what
//! the validators objected to. Packets are append-only while the sprint
//! runs and pruned when it terminates normally.

use serde::{Deserialize, Serialize};

use crate::agent::ValidatorVote;
use crate::memory::{MemoryError, MemoryStore, Namespace};

/// Aggregated reasons from one failed consensus round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackPacket {
    pub sprint_id: String,
    /// The consensus iteration that produced this packet.
    pub loop2_iter: u32,
    /// The rejecting ballots, verbatim.
    pub rejected_votes: Vec<ValidatorVote>,
    /// Deduplicated reasons in first-seen order.
    pub aggregated_reasons: Vec<String>,
}

impl FeedbackPacket {
    /// Fold the rejecting ballots of a round into a packet.
    pub fn from_votes(sprint_id: &str, loop2_iter: u32, votes: &[ValidatorVote]) -> Self {
        let rejected_votes: Vec<ValidatorVote> = votes
            .iter()
            .filter(|v| !v.is_approve())
            .cloned()
            .collect();

        let mut aggregated_reasons = Vec::new();
        for vote in &rejected_votes {
            for reason in &vote.reasons {
                if !aggregated_reasons.contains(reason) {
                    aggregated_reasons.push(reason.clone());
                }
            }
        }

        Self {
            sprint_id: sprint_id.to_string(),
            loop2_iter,
            rejected_votes,
            aggregated_reasons,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rejected_votes.is_empty()
    }
}

/// Persist a packet under its iteration key.
pub async fn persist(
    store: &dyn MemoryStore,
    ns: &Namespace,
    packet: &FeedbackPacket,
) -> Result<(), MemoryError> {
    let value = serde_json::to_value(packet)?;
    store.put(&ns.feedback_key(packet.loop2_iter), value, None).await
}

/// The packet with the highest iteration under this namespace, if any.
pub async fn latest(
    store: &dyn MemoryStore,
    ns: &Namespace,
) -> Result<Option<FeedbackPacket>, MemoryError> {
    let hits = store.search(&ns.feedback_pattern()).await?;
    let mut newest: Option<FeedbackPacket> = None;
    for (_, value) in hits {
        let packet: FeedbackPacket = serde_json::from_value(value)?;
        if newest
            .as_ref()
            .map_or(true, |n| packet.loop2_iter > n.loop2_iter)
        {
            newest = Some(packet);
        }
    }
    Ok(newest)
}

/// Delete every packet under this namespace; returns the count.
pub async fn prune(store: &dyn MemoryStore, ns: &Namespace) -> Result<usize, MemoryError> {
    store.delete(&ns.feedback_pattern()).await
}
