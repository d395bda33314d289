//! The route tree (§4.F): a tree of matcher-gated nodes carrying receiver
//! name and grouping/timing options, with unset fields inherited from the
//! parent.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
	error::Error,
	label::LabelSet,
	matcher::{match_all, Matcher},
};

/// Sentinel `group_by` entry meaning "no aggregation — one group per
/// alert" (§4.G step 2). Matches upstream Alertmanager's own
/// `group_by: ['...']` convention, rather than inventing a separate enum
/// variant for what operators already write as a list element.
pub const GROUP_BY_ALL: &str = "...";

/// `group_by` as configured: a list of label names, or containing
/// [`GROUP_BY_ALL`] to mean "one group per alert".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupBy(pub Vec<String>);

impl GroupBy {
	pub fn is_all_alerts(&self) -> bool {
		self.0.iter().any(|n| n == GROUP_BY_ALL)
	}
}

/// A configured route node, as parsed from the `Config` (unset optional
/// fields are `None` until [`RouteTree::build`] inherits them from the
/// parent).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteConfig {
	#[serde(default)]
	pub matchers: Vec<RawMatcher>,
	#[serde(default)]
	pub receiver: Option<String>,
	#[serde(default)]
	pub group_by: Option<GroupBy>,
	#[serde(default)]
	pub group_wait: Option<Duration>,
	#[serde(default)]
	pub group_interval: Option<Duration>,
	#[serde(default)]
	pub repeat_interval: Option<Duration>,
	#[serde(default)]
	pub mute_time_intervals: Vec<String>,
	#[serde(default)]
	pub active_time_intervals: Vec<String>,
	#[serde(default)]
	pub r#continue: bool,
	#[serde(default)]
	pub routes: Vec<RouteConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawMatcher {
	pub name: String,
	pub value: String,
	pub kind: crate::matcher::MatchKind,
}

/// A node in the resolved route tree: all optional timing fields have been
/// inherited from the parent, and matchers have been compiled.
#[derive(Debug, Clone)]
pub struct RouteNode {
	pub id: String,
	pub matchers: Vec<Matcher>,
    pub receiver: String,
	pub group_by: GroupBy,
	pub group_wait: Duration,
	pub group_interval: Duration,
	pub repeat_interval: Duration,
	pub mute_time_intervals: Vec<String>,
	pub active_time_intervals: Vec<String>,
	pub r#continue: bool,
	pub children: Vec<RouteNode>,
}

pub const DEFAULT_GROUP_WAIT: Duration = Duration::from_secs(30);
pub const DEFAULT_GROUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_REPEAT_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);

/// A leaf that matched, returned by [`RouteTree::matching_routes`].
#[derive(Debug, Clone, Copy)]
pub struct MatchedRoute<'a> {
	pub node: &'a RouteNode,
}

pub struct RouteTree {
	pub root: RouteNode,
}

impl RouteTree {
	/// Construction: wrap the configured root, recursively attaching
	/// children and inheriting unset timing options (§4.F).
	pub fn build(config: RouteConfig) -> Result<Self, Error> {
		let root = build_node(
			&config,
			"root",
			String::new(),
			DEFAULT_GROUP_WAIT,
			DEFAULT_GROUP_INTERVAL,
			DEFAULT_REPEAT_INTERVAL,
			&[],
			&[],
		)?;
		Ok(Self { root })
	}

	/// DFS matching per §4.F: a node whose matchers all match descends into
	/// its matching children; every matching child that bottoms out in a
	/// leaf contributes one entry. If a matched child has `continue = false`,
	/// scanning stops at that sibling level. A node with no matching
	/// children is itself the leaf. The root always matches.
	pub fn matching_routes(&self, labels: &LabelSet) -> Vec<MatchedRoute<'_>> {
		let mut out = Vec::new();
		collect_matches(&self.root, labels, &mut out);
		out
	}
}

fn collect_matches<'a>(node: &'a RouteNode, labels: &LabelSet, out: &mut Vec<MatchedRoute<'a>>) {
	let mut any_child_matched = false;
	for child in &node.children {
		if match_all(&child.matchers, labels) {
			any_child_matched = true;
			collect_matches(child, labels, out);
			if !child.r#continue {
				break;
			}
		}
	}
	if !any_child_matched {
		out.push(MatchedRoute { node });
	}
}

#[allow(clippy::too_many_arguments)]
fn build_node(
	config: &RouteConfig,
	id_prefix: &str,
	parent_receiver: String,
	parent_group_wait: Duration,
	parent_group_interval: Duration,
	parent_repeat_interval: Duration,
	parent_mute: &[String],
	parent_active: &[String],
) -> Result<RouteNode, Error> {
	let matchers = config
		.matchers
		.iter()
		.map(|m| Matcher::new(m.name.clone(), m.value.clone(), m.kind))
		.collect::<Result<Vec<_>, _>>()?;

	let receiver = config.receiver.clone().unwrap_or(parent_receiver);
	let group_wait = config.group_wait.unwrap_or(parent_group_wait);
	let group_interval = config.group_interval.unwrap_or(parent_group_interval);
	let repeat_interval = config.repeat_interval.unwrap_or(parent_repeat_interval);
	let mute_time_intervals = if config.mute_time_intervals.is_empty() {
		parent_mute.to_vec()
	} else {
		config.mute_time_intervals.clone()
	};
	let active_time_intervals = if config.active_time_intervals.is_empty() {
		parent_active.to_vec()
	} else {
		config.active_time_intervals.clone()
	};
	let group_by = config.group_by.clone().unwrap_or_default();

	let mut children = Vec::with_capacity(config.routes.len());
	for (idx, child_config) in config.routes.iter().enumerate() {
		let child_id = format!("{id_prefix}/{idx}");
		children.push(build_node(
			child_config,
			&child_id,
			receiver.clone(),
			group_wait,
			group_interval,
			repeat_interval,
			&mute_time_intervals,
			&active_time_intervals,
		)?);
	}

	Ok(RouteNode {
		id: id_prefix.to_string(),
		matchers,
		receiver,
		group_by,
		group_wait,
		group_interval,
		repeat_interval,
		mute_time_intervals,
		active_time_intervals,
		r#continue: config.r#continue,
		children,
	})
}

/// The stable group-label tuple for an alert under a given route: the
/// alert's labels projected onto `group_by`, sorted by name (§4.G).
pub fn group_label_tuple(node: &RouteNode, labels: &LabelSet) -> Vec<(String, String)> {
	if node.group_by.is_all_alerts() {
		return Vec::new();
	}
	let mut tuple: Vec<(String, String)> = node
		.group_by
		.0
		.iter()
		.filter_map(|name| labels.get(name).map(|v| (name.clone(), v.clone())))
		.collect();
	tuple.sort();
	tuple
}

/// Group-key: a stable string identity derived from the route id plus the
/// sorted group-label tuple (§4.G, §GLOSSARY). With [`GROUP_BY_ALL`] set,
/// each alert gets its own group, keyed by its fingerprint instead.
pub fn group_key(node: &RouteNode, labels: &LabelSet) -> String {
	if node.group_by.is_all_alerts() {
		return format!("{}/{:016x}", node.id, crate::label::fingerprint(labels));
	}
	let tuple = group_label_tuple(node, labels);
	let joined = tuple
		.iter()
		.map(|(k, v)| format!("{k}={v}"))
		.collect::<Vec<_>>()
		.join(",");
	format!("{}/{joined}", node.id)
}
