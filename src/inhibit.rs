//! The inhibitor (§4.E): suppresses target alerts while a matching source
//! alert is firing, with a self-inhibition exclusion for rules whose
//! source and target patterns overlap.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::instrument;

use crate::{
	error::Error,
	label::{fingerprint, LabelSet},
	matcher::{match_all, Matcher},
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InhibitRuleConfig {
	pub source_matchers: Vec<(String, String, crate::matcher::MatchKind)>,
	pub target_matchers: Vec<(String, String, crate::matcher::MatchKind)>,
	#[serde(default)]
	pub equal_labels: Vec<String>,
}

struct CompiledRule {
	source_matchers: Vec<Matcher>,
	target_matchers: Vec<Matcher>,
	equal_labels: Vec<String>,
}

impl CompiledRule {
	fn compile(config: &InhibitRuleConfig) -> Result<Self, Error> {
		let compile = |ms: &[(String, String, crate::matcher::MatchKind)]| {
			ms.iter()
				.map(|(name, value, kind)| Matcher::new(name.clone(), value.clone(), *kind))
				.collect::<Result<Vec<_>, _>>()
		};
		Ok(Self {
			source_matchers: compile(&config.source_matchers)?,
			target_matchers: compile(&config.target_matchers)?,
			equal_labels: config.equal_labels.clone(),
		})
	}

	/// `S[l] = T[l]` for every configured label, missing labels compare
	/// equal to empty.
	fn equal_on(&self, source: &LabelSet, target: &LabelSet) -> bool {
		self.equal_labels.iter().all(|label| {
			let s = source.get(label).map(String::as_str).unwrap_or("");
			let t = target.get(label).map(String::as_str).unwrap_or("");
			s == t
		})
	}
}

/// Cache of currently-active (firing, non-resolved) alerts whose labels
/// match a rule's `source_matchers`, keyed by fingerprint.
type SourceCache = HashMap<u64, LabelSet>;

pub struct Inhibitor {
	rules: Vec<CompiledRule>,
	caches: RwLock<Vec<SourceCache>>,
}

impl Inhibitor {
	pub fn new(configs: &[InhibitRuleConfig]) -> Result<Self, Error> {
		let rules = configs
			.iter()
			.map(CompiledRule::compile)
			.collect::<Result<Vec<_>, _>>()?;
		let caches = (0..rules.len()).map(|_| SourceCache::new()).collect();
		Ok(Self {
			rules,
			caches: RwLock::new(caches),
		})
	}

	/// Feeds one alert update from the provider's subscription into every
	/// rule's source cache: inserted if it matches `source_matchers` and is
	/// firing, removed otherwise (including on resolve).
	#[instrument(skip(self, labels))]
	pub async fn observe(&self, labels: &LabelSet, firing: bool) {
		let fp = fingerprint(labels);
		let mut caches = self.caches.write().await;
		for (rule, cache) in self.rules.iter().zip(caches.iter_mut()) {
			if firing && match_all(&rule.source_matchers, labels) {
				cache.insert(fp, labels.clone());
			} else {
				cache.remove(&fp);
			}
		}
	}

	/// Whether `labels` is currently inhibited, and by which source
	/// fingerprints (§4.E).
	pub async fn mutes(&self, labels: &LabelSet) -> (HashSet<u64>, bool) {
		let caches = self.caches.read().await;
		let mut inhibiting = HashSet::new();

		for (rule, cache) in self.rules.iter().zip(caches.iter()) {
			if !match_all(&rule.target_matchers, labels) {
				continue;
			}
			// Self-inhibition exclusion: if this target also matches the
			// rule's source pattern, it can't be inhibited by a source
			// that also matches the rule's target pattern.
			let target_is_also_source = match_all(&rule.source_matchers, labels);

			for (fp, source_labels) in cache {
				if target_is_also_source && match_all(&rule.target_matchers, source_labels) {
					continue;
				}
				if rule.equal_on(source_labels, labels) {
					inhibiting.insert(*fp);
				}
			}
		}

		let muted = !inhibiting.is_empty();
		(inhibiting, muted)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::matcher::MatchKind;

	fn labels(pairs: &[(&str, &str)]) -> LabelSet {
		pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
	}

	fn rule() -> InhibitRuleConfig {
		InhibitRuleConfig {
			source_matchers: vec![("severity".into(), "critical".into(), MatchKind::Eq)],
			target_matchers: vec![("severity".into(), "warning".into(), MatchKind::Eq)],
			equal_labels: vec!["cluster".into()],
		}
	}

	#[tokio::test]
	async fn warning_is_inhibited_by_matching_critical() {
		let inhibitor = Inhibitor::new(&[rule()]).unwrap();
		let critical = labels(&[("severity", "critical"), ("cluster", "c1")]);
		inhibitor.observe(&critical, true).await;

		let warning = labels(&[("severity", "warning"), ("cluster", "c1")]);
		let (ids, muted) = inhibitor.mutes(&warning).await;
		assert!(muted);
		assert_eq!(ids.len(), 1);
	}

	#[tokio::test]
	async fn resolving_source_lifts_inhibition() {
		let inhibitor = Inhibitor::new(&[rule()]).unwrap();
		let critical = labels(&[("severity", "critical"), ("cluster", "c1")]);
		inhibitor.observe(&critical, true).await;
		inhibitor.observe(&critical, false).await; // resolved

		let warning = labels(&[("severity", "warning"), ("cluster", "c1")]);
		let (_, muted) = inhibitor.mutes(&warning).await;
		assert!(!muted);
	}

	#[tokio::test]
	async fn mismatched_equal_label_does_not_inhibit() {
		let inhibitor = Inhibitor::new(&[rule()]).unwrap();
		let critical = labels(&[("severity", "critical"), ("cluster", "c1")]);
		inhibitor.observe(&critical, true).await;

		let warning = labels(&[("severity", "warning"), ("cluster", "c2")]);
		let (_, muted) = inhibitor.mutes(&warning).await;
		assert!(!muted);
	}

	#[tokio::test]
	async fn overlapping_rule_excludes_self_inhibition() {
		// Both source and target match severity=critical|warning on the
		// same label name (an overlapping rule); an alert that matches
		// both patterns must not inhibit, or be inhibited by, another
		// alert that also matches both.
		let overlapping = InhibitRuleConfig {
			source_matchers: vec![("cluster".into(), "c1".into(), MatchKind::Eq)],
			target_matchers: vec![("cluster".into(), "c1".into(), MatchKind::Eq)],
			equal_labels: vec![],
		};
		let inhibitor = Inhibitor::new(&[overlapping]).unwrap();

		let a = labels(&[("cluster", "c1"), ("alertname", "A")]);
		let b = labels(&[("cluster", "c1"), ("alertname", "B")]);
		inhibitor.observe(&a, true).await;

		let (_, muted) = inhibitor.mutes(&b).await;
		assert!(!muted, "both a and b match source and target, self-inhibition must not apply");
	}
}
