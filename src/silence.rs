//! The silence store (§4.B): an indexed, gossip-replicated set of
//! matcher-based suppressions with CRDT-style (last-writer-wins) merge.

use std::{
	collections::{HashMap, HashSet},
	sync::Arc,
	time::Duration,
};

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::{
	error::Error,
	label::LabelSet,
	matcher::{match_all, MatchKind, Matcher},
	peer::GossipChannel,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SilenceState {
	Pending,
	Active,
	Expired,
}

/// The wire-serializable shape of a silence — what gets snapshotted and
/// gossiped. Matchers are carried as the raw `(name, value, kind)` triples
/// rather than compiled `Matcher`s, since a compiled regex can't round-trip
/// through serde.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Silence {
	pub id: Uuid,
	pub matchers: Vec<(String, String, MatchKind)>,
	pub starts_at: Timestamp,
	pub ends_at: Timestamp,
	pub created_by: String,
	pub comment: String,
	pub updated_at: Timestamp,
}

impl Silence {
	pub fn state(&self, now: Timestamp) -> SilenceState {
		if now < self.starts_at {
			SilenceState::Pending
		} else if now < self.ends_at {
			SilenceState::Active
		} else {
			SilenceState::Expired
		}
	}

	fn compiled_matchers(&self) -> Result<Vec<Matcher>, Error> {
		self.matchers
			.iter()
			.map(|(name, value, kind)| Matcher::new(name.clone(), value.clone(), *kind))
			.collect()
	}

	fn validate_window(&self) -> Result<(), Error> {
		if self.starts_at >= self.ends_at {
			return Err(Error::validation(format!(
				"silence starts_at ({}) must be before ends_at ({})",
				self.starts_at, self.ends_at
			)));
		}
		if self.matchers.is_empty() {
			return Err(Error::validation("silence has no matchers"));
		}
		Ok(())
	}
}

/// Filters accepted by [`SilenceStore::query`].
#[derive(Debug, Clone, Default)]
pub struct SilenceFilter {
	pub id: Option<Uuid>,
	pub matcher_labels: Option<LabelSet>,
}

struct Entry {
	silence: Silence,
	matchers: Vec<Matcher>,
}

/// Secondary index keyed by the hash of the first EQ matcher in each
/// silence, accelerating `mutes`. Silences with no EQ matcher fall back to
/// a full scan (§4.B "Indexing").
#[derive(Default)]
struct Index {
	by_first_eq: HashMap<(String, String), HashSet<Uuid>>,
	unindexed: HashSet<Uuid>,
}

impl Index {
	fn first_eq(silence: &Silence) -> Option<(String, String)> {
		silence
			.matchers
			.iter()
			.find(|(_, _, kind)| *kind == MatchKind::Eq)
			.map(|(name, value, _)| (name.clone(), value.clone()))
	}

	fn insert(&mut self, silence: &Silence) {
		match Self::first_eq(silence) {
			Some(key) => {
				self.by_first_eq.entry(key).or_default().insert(silence.id);
			}
			None => {
				self.unindexed.insert(silence.id);
			}
		}
	}

	fn remove(&mut self, silence: &Silence) {
		match Self::first_eq(silence) {
			Some(key) => {
				if let Some(set) = self.by_first_eq.get_mut(&key) {
					set.remove(&silence.id);
					if set.is_empty() {
						self.by_first_eq.remove(&key);
					}
				}
			}
			None => {
				self.unindexed.remove(&silence.id);
			}
		}
	}

	/// Candidate ids whose first EQ matcher could plausibly match `labels`,
	/// plus every unindexed silence (those must always be scanned).
	fn candidates(&self, labels: &LabelSet) -> HashSet<Uuid> {
		let mut out = self.unindexed.clone();
		for (name, value) in labels {
			if let Some(set) = self.by_first_eq.get(&(name.clone(), value.clone())) {
				out.extend(set.iter().copied());
			}
		}
		// An EQ matcher with an empty value also matches a missing key, so
		// those silences must be scanned regardless of what's present.
		for (key, set) in &self.by_first_eq {
			if key.1.is_empty() {
				out.extend(set.iter().copied());
			}
		}
		out
	}
}

pub struct SilenceStore {
	entries: RwLock<HashMap<Uuid, Entry>>,
	index: RwLock<Index>,
	gossip: Arc<dyn GossipChannel>,
	retention: Duration,
}

pub const GOSSIP_CHANNEL_SILENCES: &str = "silences";

impl SilenceStore {
	pub fn new(gossip: Arc<dyn GossipChannel>, retention: Duration) -> Self {
		Self {
			entries: RwLock::new(HashMap::new()),
			index: RwLock::new(Index::default()),
			gossip,
			retention,
		}
	}

	/// Validates and inserts/updates a silence (§4.B `set`).
	///
	/// - Fresh `Uuid::nil()` id: validate, assign a new id, insert.
	/// - Known id, currently `pending`/`active`: update in place (only the
	///   time window is expected to change, but the whole record is
	///   replaced — same as upstream).
	/// - Known id, currently `expired`: `Conflict`, caller must re-create.
	#[instrument(skip(self, silence))]
	pub async fn set(&self, mut silence: Silence) -> Result<Uuid, Error> {
		silence.validate_window()?;
		let matchers = silence.compiled_matchers()?;

		let now = Timestamp::now();
		let is_new = silence.id.is_nil();

		if !is_new {
			let entries = self.entries.read().await;
			if let Some(existing) = entries.get(&silence.id) {
				if existing.silence.state(now) == SilenceState::Expired {
					return Err(Error::conflict(format!(
						"silence {} has already expired",
						silence.id
					)));
				}
			} else {
				return Err(Error::not_found(format!("silence {} not found", silence.id)));
			}
		}

		if is_new {
			silence.id = Uuid::new_v4();
		}
		silence.updated_at = now;

		self.insert_and_broadcast(silence.clone(), matchers).await?;
		Ok(silence.id)
	}

	/// Sets `ends_at := max(now, starts_at)`, bumps `updated_at`, broadcasts.
	#[instrument(skip(self))]
	pub async fn expire(&self, id: Uuid) -> Result<(), Error> {
		let now = Timestamp::now();
		let mut entries = self.entries.write().await;
		let entry = entries
			.get_mut(&id)
			.ok_or_else(|| Error::not_found(format!("silence {id} not found")))?;

		entry.silence.ends_at = now.max(entry.silence.starts_at);
		entry.silence.updated_at = now;
		let silence = entry.silence.clone();
		drop(entries);

		self.broadcast(&silence).await;
		Ok(())
	}

	pub async fn get(&self, id: Uuid) -> Option<Silence> {
		self.entries.read().await.get(&id).map(|e| e.silence.clone())
	}

	/// Returns silences regardless of state; caller filters by derived
	/// state if it wants to.
	pub async fn query(&self, filter: &SilenceFilter) -> Vec<Silence> {
		let entries = self.entries.read().await;
		entries
			.values()
			.filter(|e| match &filter.id {
				Some(id) => e.silence.id == *id,
				None => true,
			})
			.filter(|e| match &filter.matcher_labels {
				Some(labels) => match_all(&e.matchers, labels),
				None => true,
			})
			.map(|e| e.silence.clone())
			.collect()
	}

	/// List ordering per §6: active (soonest-ending first), pending
	/// (soonest-starting first), expired (most-recently-expired first);
	/// ties within a bucket break by id ascending (§9 Open Question
	/// resolution).
	pub async fn list_ordered(&self) -> Vec<Silence> {
		let now = Timestamp::now();
		let mut all = self.query(&SilenceFilter::default()).await;

		let bucket = |s: &Silence| match s.state(now) {
			SilenceState::Active => 0,
			SilenceState::Pending => 1,
			SilenceState::Expired => 2,
		};
		all.sort_by(|a, b| {
			bucket(a).cmp(&bucket(b)).then_with(|| match a.state(now) {
				SilenceState::Active => a.ends_at.cmp(&b.ends_at),
				SilenceState::Pending => a.starts_at.cmp(&b.starts_at),
				SilenceState::Expired => b.ends_at.cmp(&a.ends_at),
			}).then_with(|| a.id.cmp(&b.id))
		});
		all
	}

	/// Returns the set of active silences whose matchers all match
	/// `labels`, and whether the label set is silenced now. O(candidates)
	/// via the secondary index.
	pub async fn mutes(&self, labels: &LabelSet) -> (HashSet<Uuid>, bool) {
		let now = Timestamp::now();
		let candidates = self.index.read().await.candidates(labels);
		let entries = self.entries.read().await;

		let mut silencing = HashSet::new();
		for id in candidates {
			if let Some(entry) = entries.get(&id) {
				if entry.silence.state(now) == SilenceState::Active
					&& match_all(&entry.matchers, labels)
				{
					silencing.insert(id);
				}
			}
		}
		let silenced = !silencing.is_empty();
		(silencing, silenced)
	}

	/// Drops silences whose `ends_at + retention < now`.
	#[instrument(skip(self))]
	pub async fn gc(&self, now: Timestamp) {
		let retention = jiff::SignedDuration::try_from(self.retention).unwrap_or_default();
		let mut entries = self.entries.write().await;
		let mut index = self.index.write().await;
		let expired: Vec<Uuid> = entries
			.values()
			.filter(|e| e.silence.ends_at + retention < now)
			.map(|e| e.silence.id)
			.collect();
		for id in expired {
			if let Some(entry) = entries.remove(&id) {
				index.remove(&entry.silence);
				debug!(%id, "garbage-collected silence");
			}
		}
	}

	/// CRDT merge handler for gossiped silences: replace if no local entry
	/// or the incoming record is newer (§4.B, §8 invariants).
	#[instrument(skip(self, incoming))]
	pub async fn merge(&self, incoming: Silence) -> Result<(), Error> {
		let matchers = incoming.compiled_matchers().map_err(|err| {
			warn!(id = %incoming.id, "dropping unparseable gossiped silence: {err}");
			err
		})?;

		let mut entries = self.entries.write().await;
		let should_replace = match entries.get(&incoming.id) {
			Some(existing) => incoming.updated_at > existing.silence.updated_at,
			None => true,
		};
		if should_replace {
			let mut index = self.index.write().await;
			if let Some(old) = entries.get(&incoming.id) {
				index.remove(&old.silence);
			}
			index.insert(&incoming);
			entries.insert(
				incoming.id,
				Entry {
					silence: incoming,
					matchers,
				},
			);
		}
		Ok(())
	}

	async fn insert_and_broadcast(&self, silence: Silence, matchers: Vec<Matcher>) -> Result<(), Error> {
		{
			let mut entries = self.entries.write().await;
			let mut index = self.index.write().await;
			if let Some(old) = entries.get(&silence.id) {
				index.remove(&old.silence);
			}
			index.insert(&silence);
			entries.insert(silence.id, Entry { silence: silence.clone(), matchers });
		}
		self.broadcast(&silence).await;
		Ok(())
	}

	async fn broadcast(&self, silence: &Silence) {
		match serde_json::to_vec(silence) {
			Ok(bytes) => self.gossip.broadcast(GOSSIP_CHANNEL_SILENCES, bytes.into()).await,
			Err(err) => warn!("failed to serialize silence for broadcast: {err}"),
		}
	}

	/// All current entries, for snapshotting (§9.8).
	pub async fn snapshot_entries(&self) -> Vec<Silence> {
		self.entries.read().await.values().map(|e| e.silence.clone()).collect()
	}

	/// Loads records from a snapshot/boot source using the same merge rule
	/// as gossip (§6 "Persisted state layout").
	pub async fn load_snapshot(&self, records: Vec<Silence>) {
		for record in records {
			if let Err(err) = self.merge(record).await {
				warn!("skipping corrupt silence snapshot record: {err}");
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::peer::LocalGossip;

	fn labels(pairs: &[(&str, &str)]) -> LabelSet {
		pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
	}

	fn store() -> SilenceStore {
		SilenceStore::new(Arc::new(LocalGossip::new()), Duration::from_secs(120))
	}

	fn blank_silence(matchers: Vec<(&str, &str, MatchKind)>, starts_at: Timestamp, ends_at: Timestamp) -> Silence {
		Silence {
			id: Uuid::nil(),
			matchers: matchers.into_iter().map(|(n, v, k)| (n.to_string(), v.to_string(), k)).collect(),
			starts_at,
			ends_at,
			created_by: "test".into(),
			comment: String::new(),
			updated_at: Timestamp::UNIX_EPOCH,
		}
	}

	#[tokio::test]
	async fn set_assigns_fresh_id_and_mutes() {
		let store = store();
		let now = Timestamp::now();
		let hour = jiff::SignedDuration::from_hours(1);
		let silence = blank_silence(
			vec![("svc", "a", MatchKind::Eq)],
			now - hour,
			now + hour,
		);
		let id = store.set(silence).await.unwrap();
		assert!(!id.is_nil());

		let (ids, silenced) = store.mutes(&labels(&[("svc", "a")])).await;
		assert!(silenced);
		assert!(ids.contains(&id));

		let (_, not_silenced) = store.mutes(&labels(&[("svc", "b")])).await;
		assert!(!not_silenced);
	}

	#[tokio::test]
	async fn expire_stops_muting() {
		let store = store();
		let now = Timestamp::now();
		let hour = jiff::SignedDuration::from_hours(1);
		let silence = blank_silence(vec![("svc", "a", MatchKind::Eq)], now - hour, now + hour);
		let id = store.set(silence).await.unwrap();

		store.expire(id).await.unwrap();

		let (_, silenced) = store.mutes(&labels(&[("svc", "a")])).await;
		assert!(!silenced);
	}

	#[tokio::test]
	async fn updating_expired_silence_conflicts() {
		let store = store();
		let now = Timestamp::now();
		let hour = jiff::SignedDuration::from_hours(1);
		let mut silence = blank_silence(vec![("svc", "a", MatchKind::Eq)], now - hour, now - jiff::SignedDuration::from_secs(1));
		let id = store.set(silence.clone()).await.unwrap();

		silence.id = id;
		silence.ends_at = now + hour;
		let err = store.set(silence).await.unwrap_err();
		assert!(matches!(err, Error::Conflict(_)));
	}

	#[tokio::test]
	async fn merge_is_commutative_and_idempotent() {
		let a = store();
		let b = store();

		let now = Timestamp::now();
		let hour = jiff::SignedDuration::from_hours(1);
		let mut s1 = blank_silence(vec![("svc", "a", MatchKind::Eq)], now - hour, now + hour);
		s1.id = Uuid::new_v4();
		s1.updated_at = now;

		let mut s2 = s1.clone();
		s2.updated_at = now + jiff::SignedDuration::from_secs(10);
		s2.comment = "newer".into();

		a.merge(s1.clone()).await.unwrap();
		a.merge(s2.clone()).await.unwrap();
		a.merge(s2.clone()).await.unwrap(); // idempotent

		b.merge(s2.clone()).await.unwrap();
		b.merge(s1.clone()).await.unwrap(); // older arrives after, must not win

		let a_result = a.get(s1.id).await.unwrap();
		let b_result = b.get(s1.id).await.unwrap();
		assert_eq!(a_result.comment, "newer");
		assert_eq!(b_result.comment, "newer");
	}

	#[tokio::test]
	async fn gc_drops_past_retention_and_is_idempotent() {
		let store = store();
		let now = Timestamp::now();
		let mut silence = blank_silence(
			vec![("svc", "a", MatchKind::Eq)],
			now - jiff::SignedDuration::from_hours(3),
			now - jiff::SignedDuration::from_hours(2),
		);
		silence.id = Uuid::new_v4();
		silence.updated_at = now;
		store.merge(silence.clone()).await.unwrap();

		store.gc(now).await;
		store.gc(now).await; // idempotent

		assert!(store.get(silence.id).await.is_none());
	}
}
