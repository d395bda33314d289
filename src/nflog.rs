//! The notification log (§4.C): a gossip-replicated record of prior sends,
//! used by the pipeline's dedupe stage to avoid re-notifying peers that
//! already flushed the same group.

use std::{collections::HashMap, sync::Arc};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{instrument, warn};

use crate::peer::GossipChannel;

pub const GOSSIP_CHANNEL_NFLOG: &str = "nflog";

/// Key identifying one notification log entry: a receiver plus a group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NflogKey {
	pub receiver: String,
	pub group_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NflogEntry {
	pub key: NflogKey,
	pub firing_fps: Vec<u64>,
	pub resolved_fps: Vec<u64>,
	pub timestamp: Timestamp,
	pub expires_at: Timestamp,
}

pub struct NotificationLog {
	entries: RwLock<HashMap<NflogKey, NflogEntry>>,
	gossip: Arc<dyn GossipChannel>,
}

impl NotificationLog {
	pub fn new(gossip: Arc<dyn GossipChannel>) -> Self {
		Self {
			entries: RwLock::new(HashMap::new()),
			gossip,
		}
	}

	/// Upserts an entry with `timestamp := now`, then broadcasts it (§4.C).
	#[instrument(skip(self, firing_fps, resolved_fps))]
	pub async fn log(
		&self,
		receiver: impl Into<String>,
		group_key: impl Into<String>,
		firing_fps: Vec<u64>,
		resolved_fps: Vec<u64>,
		expires_at: Timestamp,
	) {
		let entry = NflogEntry {
			key: NflogKey {
				receiver: receiver.into(),
				group_key: group_key.into(),
			},
			firing_fps,
			resolved_fps,
			timestamp: Timestamp::now(),
			expires_at,
		};

		self.entries.write().await.insert(entry.key.clone(), entry.clone());
		self.broadcast(&entry).await;
	}

	pub async fn query(&self, receiver: &str, group_key: &str) -> Option<NflogEntry> {
		let key = NflogKey {
			receiver: receiver.to_string(),
			group_key: group_key.to_string(),
		};
		self.entries.read().await.get(&key).cloned()
	}

	/// Drops entries whose `expires_at < now`.
	#[instrument(skip(self))]
	pub async fn gc(&self, now: Timestamp) {
		self.entries.write().await.retain(|_, entry| entry.expires_at >= now);
	}

	/// CRDT merge handler for gossiped entries: last-writer-wins by
	/// `timestamp`; on an exact tie, union the firing/resolved sets so the
	/// merge stays idempotent regardless of arrival order (§4.C).
	#[instrument(skip(self, incoming))]
	pub async fn merge(&self, incoming: NflogEntry) {
		let mut entries = self.entries.write().await;
		match entries.get_mut(&incoming.key) {
			Some(existing) if incoming.timestamp > existing.timestamp => {
				*existing = incoming;
			}
			Some(existing) if incoming.timestamp == existing.timestamp => {
				union_sorted(&mut existing.firing_fps, &incoming.firing_fps);
				union_sorted(&mut existing.resolved_fps, &incoming.resolved_fps);
				existing.expires_at = existing.expires_at.max(incoming.expires_at);
			}
			Some(_) => {
				// Incoming is older than what we have; nothing to do.
			}
			None => {
				entries.insert(incoming.key.clone(), incoming);
			}
		}
	}

	async fn broadcast(&self, entry: &NflogEntry) {
		match serde_json::to_vec(entry) {
			Ok(bytes) => self.gossip.broadcast(GOSSIP_CHANNEL_NFLOG, bytes.into()).await,
			Err(err) => warn!("failed to serialize nflog entry for broadcast: {err}"),
		}
	}

	/// All current entries, for snapshotting (§9.8).
	pub async fn snapshot_entries(&self) -> Vec<NflogEntry> {
		self.entries.read().await.values().cloned().collect()
	}

	pub async fn load_snapshot(&self, records: Vec<NflogEntry>) {
		let mut entries = self.entries.write().await;
		for record in records {
			entries
				.entry(record.key.clone())
				.and_modify(|existing| {
					if record.timestamp > existing.timestamp {
						*existing = record.clone();
					}
				})
				.or_insert(record);
		}
	}
}

fn union_sorted(into: &mut Vec<u64>, other: &[u64]) {
	for fp in other {
		if let Err(pos) = into.binary_search(fp) {
			into.insert(pos, *fp);
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::peer::LocalGossip;

	fn log() -> NotificationLog {
		NotificationLog::new(Arc::new(LocalGossip::new()))
	}

	#[tokio::test]
	async fn log_then_query_round_trips() {
		let log = log();
		let expires = Timestamp::now() + jiff::SignedDuration::from_hours(4);
		log.log("team-a", "root/svc=a", vec![1, 2], vec![], expires).await;

		let entry = log.query("team-a", "root/svc=a").await.unwrap();
		assert_eq!(entry.firing_fps, vec![1, 2]);
		assert!(log.query("team-a", "root/svc=b").await.is_none());
	}

	#[tokio::test]
	async fn merge_prefers_newer_timestamp() {
		let log = log();
		let key = NflogKey {
			receiver: "team-a".into(),
			group_key: "root/svc=a".into(),
		};
		let now = Timestamp::now();
		let old = NflogEntry {
			key: key.clone(),
			firing_fps: vec![1],
			resolved_fps: vec![],
			timestamp: now,
			expires_at: now + jiff::SignedDuration::from_hours(1),
		};
		let new = NflogEntry {
			firing_fps: vec![1, 2],
			timestamp: now + jiff::SignedDuration::from_secs(5),
			..old.clone()
		};

		log.merge(new.clone()).await;
		log.merge(old).await; // older must not overwrite

		let entry = log.query("team-a", "root/svc=a").await.unwrap();
		assert_eq!(entry.firing_fps, vec![1, 2]);
	}

	#[tokio::test]
	async fn merge_unions_on_exact_timestamp_tie() {
		let log = log();
		let key = NflogKey {
			receiver: "team-a".into(),
			group_key: "root/svc=a".into(),
		};
		let now = Timestamp::now();
		let expires = now + jiff::SignedDuration::from_hours(1);
		let a = NflogEntry {
			key: key.clone(),
			firing_fps: vec![1],
			resolved_fps: vec![],
			timestamp: now,
			expires_at: expires,
		};
		let b = NflogEntry {
			firing_fps: vec![2],
			..a.clone()
		};

		log.merge(a).await;
		log.merge(b).await;

		let entry = log.query("team-a", "root/svc=a").await.unwrap();
		assert_eq!(entry.firing_fps, vec![1, 2]);
	}

	#[tokio::test]
	async fn gc_drops_expired_entries() {
		let log = log();
		let now = Timestamp::now();
		log.log("team-a", "g1", vec![1], vec![], now - jiff::SignedDuration::from_secs(1)).await;
		log.log("team-a", "g2", vec![2], vec![], now + jiff::SignedDuration::from_secs(60)).await;

		log.gc(now).await;

		assert!(log.query("team-a", "g1").await.is_none());
		assert!(log.query("team-a", "g2").await.is_some());
	}
}
