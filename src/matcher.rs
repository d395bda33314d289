//! The matcher engine (§4.A): compile/evaluate label matchers.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{error::Error, label::LabelSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchKind {
	Eq,
	Neq,
	Regex,
	NotRegex,
}

/// A compiled matcher. `Regex`/`NotRegex` matchers carry a fully-anchored
/// compiled pattern so that partial matches never sneak through — a bare
/// `regex::Regex::new(pattern)` would happily match a substring.
#[derive(Debug, Clone)]
pub struct Matcher {
	pub name: String,
	pub value: String,
	pub kind: MatchKind,
	regex: Option<Regex>,
}

impl Matcher {
	#[instrument(skip(value), fields(name = %name, value = %value))]
	pub fn new(name: impl Into<String>, value: impl Into<String>, kind: MatchKind) -> Result<Self, Error> {
		let name = name.into();
		let value = value.into();

		let regex = match kind {
			MatchKind::Regex | MatchKind::NotRegex => {
				let anchored = format!("^(?:{value})$");
				Some(Regex::new(&anchored).map_err(|err| {
					Error::validation(format!("invalid matcher regex {value:?}: {err}"))
				})?)
			}
			MatchKind::Eq | MatchKind::Neq => None,
		};

		Ok(Self {
			name,
			value,
			kind,
			regex,
		})
	}

	/// `L[name]` exists and matches `value`; for EQ/REGEX an empty `value`
	/// also matches a missing key. For NEQ/NREGEX, the polarity flips: `L[name]`
	/// does *not* match `value`, and an empty `value` matches a present key.
	pub fn matches(&self, labels: &LabelSet) -> bool {
		let present = labels.get(self.name.as_str()).map(String::as_str);

		match self.kind {
			MatchKind::Eq => match present {
				Some(v) => v == self.value,
				None => self.value.is_empty(),
			},
			MatchKind::Regex => {
				let regex = self.regex.as_ref().expect("regex matcher always compiled");
				match present {
					Some(v) => regex.is_match(v),
					None => self.value.is_empty(),
				}
			}
			MatchKind::Neq => match present {
				Some(v) => v != self.value,
				None => !self.value.is_empty(),
			},
			MatchKind::NotRegex => {
				let regex = self.regex.as_ref().expect("regex matcher always compiled");
				match present {
					Some(v) => !regex.is_match(v),
					None => !self.value.is_empty(),
				}
			}
		}
	}
}

/// Conjunctive match: every matcher must match for the label set to match.
pub fn match_all(matchers: &[Matcher], labels: &LabelSet) -> bool {
	matchers.iter().all(|m| m.matches(labels))
}
