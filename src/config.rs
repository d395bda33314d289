//! Configuration (§6, §9.3): the on-disk shape of routes, inhibit rules,
//! receivers, and time intervals, plus global defaults.

use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
	error::Error,
	inhibit::InhibitRuleConfig,
	notifier::Notifier,
	route::RouteConfig,
	time_window::TimeInterval,
};

fn default_resolve_timeout() -> Duration {
	Duration::from_secs(5 * 60)
}

fn default_data_retention() -> Duration {
	Duration::from_secs(5 * 24 * 60 * 60)
}

fn default_peer_timeout() -> Duration {
	Duration::from_secs(15)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalConfig {
	#[serde(default = "default_resolve_timeout")]
	pub resolve_timeout: Duration,
	#[serde(default = "default_data_retention")]
	pub data_retention: Duration,
	#[serde(default = "default_peer_timeout")]
	pub peer_timeout: Duration,
}

impl Default for GlobalConfig {
	fn default() -> Self {
		Self {
			resolve_timeout: default_resolve_timeout(),
			data_retention: default_data_retention(),
			peer_timeout: default_peer_timeout(),
		}
	}
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
	#[serde(default)]
	pub global: GlobalConfig,
	pub route: RouteConfig,
	#[serde(default)]
	pub inhibit_rules: Vec<InhibitRuleConfig>,
	#[serde(default)]
	pub receivers: HashMap<String, Notifier>,
	#[serde(default)]
	pub time_intervals: Vec<TimeInterval>,
}

impl Config {
	/// Parses YAML, reporting the failing field path via
	/// `serde_path_to_error` the way the teacher's validate endpoint does
	/// for alert definitions.
	pub fn from_yaml(content: &str) -> Result<Self, Error> {
		let deserializer = serde_yaml::Deserializer::from_str(content);
		serde_path_to_error::deserialize(deserializer)
			.map_err(|err| Error::validation(format!("config error at '{}': {}", err.path(), err.into_inner())))
	}

	pub fn from_json(content: &str) -> Result<Self, Error> {
		let deserializer = &mut serde_json::Deserializer::from_str(content);
		serde_path_to_error::deserialize(deserializer)
			.map_err(|err| Error::validation(format!("config error at '{}': {}", err.path(), err.into_inner())))
	}
}
