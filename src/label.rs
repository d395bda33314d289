//! Label sets and the alert data model (§3).

use std::collections::BTreeMap;

use jiff::Timestamp;
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

/// A mapping from label name to label value. Keys are unique; order is
/// irrelevant, which is why this is a `BTreeMap` rather than a `Vec` of
/// pairs — it gives us a canonical iteration order for free, which
/// `fingerprint` depends on.
pub type LabelSet = BTreeMap<String, String>;

/// Stable 64-bit hash of a label set, used as an alert's identity.
///
/// Uses `xxh3` with a fixed seed rather than `std::collections::hash_map`'s
/// `RandomState`, which reseeds per-process and would make fingerprints
/// useless as a cross-process or cross-restart identity.
pub fn fingerprint(labels: &LabelSet) -> u64 {
	let mut hasher = Xxh3::new();
	for (name, value) in labels {
		hasher.update(name.as_bytes());
		hasher.update(&[0]);
		hasher.update(value.as_bytes());
		hasher.update(&[0]);
	}
	hasher.digest()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
	pub labels: LabelSet,
	#[serde(default)]
	pub annotations: LabelSet,
	pub starts_at: Timestamp,
	/// Zero (`Timestamp::UNIX_EPOCH`) means open-ended.
	#[serde(default = "zero_timestamp")]
	pub ends_at: Timestamp,
	#[serde(default)]
	pub generator_url: String,
	pub updated_at: Timestamp,
	/// True if `ends_at` was synthesized from a resolve-timeout rather than
	/// reported by the source.
	#[serde(default)]
	pub timeout: bool,
}

fn zero_timestamp() -> Timestamp {
	Timestamp::UNIX_EPOCH
}

impl Alert {
	pub fn new(labels: LabelSet, annotations: LabelSet, starts_at: Timestamp, now: Timestamp) -> Self {
		Self {
			labels,
			annotations,
			starts_at,
			ends_at: Timestamp::UNIX_EPOCH,
			generator_url: String::new(),
			updated_at: now,
			timeout: false,
		}
	}

	pub fn fingerprint(&self) -> u64 {
		fingerprint(&self.labels)
	}

	pub fn is_open_ended(&self) -> bool {
		self.ends_at == Timestamp::UNIX_EPOCH
	}

	/// An alert is resolved iff `ends_at` is set and not after `now`.
	pub fn is_resolved_at(&self, now: Timestamp) -> bool {
		!self.is_open_ended() && self.ends_at <= now
	}

	pub fn is_firing_at(&self, now: Timestamp) -> bool {
		!self.is_resolved_at(now)
	}

	/// Validates the invariants named in §3: `starts_at <= ends_at` when
	/// both are set, and labels must carry at least `alertname` (the
	/// convention every route in this system keys off of) plus be
	/// non-empty overall.
	pub fn validate(&self) -> Result<(), String> {
		if self.labels.is_empty() {
			return Err("alert has no labels".into());
		}
		if !self.is_open_ended() && self.starts_at > self.ends_at {
			return Err(format!(
				"starts_at ({}) is after ends_at ({})",
				self.starts_at, self.ends_at
			));
		}
		for (name, _) in &self.labels {
			if name.is_empty() {
				return Err("empty label name".into());
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn labels(pairs: &[(&str, &str)]) -> LabelSet {
		pairs
			.iter()
			.map(|(k, v)| (k.to_string(), v.to_string()))
			.collect()
	}

	#[test]
	fn fingerprint_is_order_independent() {
		let a = labels(&[("alertname", "Down"), ("svc", "a")]);
		let b = labels(&[("svc", "a"), ("alertname", "Down")]);
		assert_eq!(fingerprint(&a), fingerprint(&b));
	}

	#[test]
	fn fingerprint_differs_on_value_change() {
		let a = labels(&[("alertname", "Down"), ("svc", "a")]);
		let b = labels(&[("alertname", "Down"), ("svc", "b")]);
		assert_ne!(fingerprint(&a), fingerprint(&b));
	}

	#[test]
	fn fingerprint_distinguishes_concatenation_boundary() {
		// Without a separator byte, ("ab","c") and ("a","bc") could collide.
		let a = labels(&[("ab", "c")]);
		let b = labels(&[("a", "bc")]);
		assert_ne!(fingerprint(&a), fingerprint(&b));
	}

	#[test]
	fn open_ended_alert_is_never_resolved() {
		let alert = Alert::new(
			labels(&[("alertname", "X")]),
			LabelSet::new(),
			Timestamp::UNIX_EPOCH,
			Timestamp::UNIX_EPOCH,
		);
		assert!(alert.is_open_ended());
		assert!(!alert.is_resolved_at(Timestamp::now()));
	}

	#[test]
	fn validate_rejects_inverted_window() {
		let mut alert = Alert::new(
			labels(&[("alertname", "X")]),
			LabelSet::new(),
			Timestamp::now(),
			Timestamp::now(),
		);
		alert.ends_at = alert.starts_at - jiff::SignedDuration::from_secs(10);
		assert!(alert.validate().is_err());
	}
}
