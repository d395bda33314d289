//! The `Core`: a single value wiring together the silence store, nflog,
//! inhibitor, dispatcher, and peer handle (§2.1), matching the teacher's
//! "one struct wires everything" pattern (`Scheduler` in the teacher).

use std::{collections::HashMap, path::PathBuf, sync::Arc, time::Duration};

use regex::Regex;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::{
	config::Config,
	dispatch::Dispatcher,
	error::{Error, MultiError},
	inhibit::Inhibitor,
	label::Alert,
	matcher::{match_all, Matcher},
	nflog::NotificationLog,
	notifier::Notifier,
	peer::{ClusterPeer, GossipChannel},
	pipeline::PipelineDeps,
	provider::{AlertProvider, InMemoryProvider},
	route::{group_key, group_label_tuple, RouteTree},
	silence::{Silence, SilenceFilter, SilenceStore},
	snapshot,
	time_window::TimeInterval,
};

const GC_INTERVAL: Duration = Duration::from_secs(60);
const SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Server-side filter shared by [`Core::get_alerts`] and
/// [`Core::get_alert_groups`] (§6 "Alert listing" / "Group listing").
/// Every field left `None`/empty imposes no constraint.
#[derive(Debug, Clone, Default)]
pub struct AlertFilter {
	/// Keep only firing (`Some(true)`) or resolved (`Some(false)`) alerts.
	pub active: Option<bool>,
	/// Keep only alerts that are (`Some(true)`) or aren't (`Some(false)`)
	/// currently silenced.
	pub silenced: Option<bool>,
	/// Keep only alerts that are (`Some(true)`) or aren't (`Some(false)`)
	/// currently inhibited.
	pub inhibited: Option<bool>,
	/// Keep only alerts that are (`Some(true)`) or aren't (`Some(false)`)
	/// muted, i.e. silenced or inhibited. [`Core::get_alerts`] ignores
	/// this; only [`Core::get_alert_groups`] honours it.
	pub muted: Option<bool>,
	/// Keep only alerts routed to at least one receiver matching this
	/// regex.
	pub receiver: Option<Regex>,
	/// Keep only alerts whose labels satisfy every matcher.
	pub matchers: Vec<Matcher>,
}

/// One aggregation group as returned by [`Core::get_alert_groups`]: the
/// route it resolved to plus the group-label tuple that identifies it
/// within that route (§4.G), and the alerts currently in it.
#[derive(Debug, Clone)]
pub struct AlertGroup {
	pub route_id: String,
	pub receiver: String,
	pub group_labels: Vec<(String, String)>,
	pub alerts: Vec<Alert>,
}

pub struct SnapshotPaths {
	pub silences: PathBuf,
	pub nflog: PathBuf,
}

pub struct Core {
	pub silences: Arc<SilenceStore>,
	pub nflog: Arc<NotificationLog>,
	pub inhibitor: RwLock<Arc<Inhibitor>>,
	pub dispatcher: Arc<Dispatcher>,
	pub provider: Arc<InMemoryProvider>,
	pub peer: Arc<dyn ClusterPeer>,
	gossip: Arc<dyn GossipChannel>,
	pub routes: RwLock<Arc<RouteTree>>,
	pub receivers: Arc<RwLock<HashMap<String, Notifier>>>,
	pub time_intervals: Arc<RwLock<HashMap<String, TimeInterval>>>,
	pub location: jiff::tz::TimeZone,
	pub data_retention: Duration,
	pub peer_timeout: Duration,
	pub snapshot_paths: Option<SnapshotPaths>,
}

/// Drains gossiped silences into the local store via its CRDT merge (§4.B),
/// until `ctx` is cancelled or the channel closes.
async fn merge_gossiped_silences(
	mut rx: broadcast::Receiver<bytes::Bytes>,
	silences: Arc<SilenceStore>,
	ctx: CancellationToken,
) {
	loop {
		tokio::select! {
			received = rx.recv() => match received {
				Ok(payload) => match serde_json::from_slice::<Silence>(&payload) {
					Ok(silence) => {
						if let Err(err) = silences.merge(silence).await {
							warn!("dropping gossiped silence: {err}");
						}
					}
					Err(err) => warn!("dropping malformed gossiped silence: {err}"),
				},
				Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "silence gossip subscription lagged"),
				Err(broadcast::error::RecvError::Closed) => break,
			},
			_ = ctx.cancelled() => break,
		}
	}
}

/// Drains gossiped nflog entries into the local log via its CRDT merge
/// (§4.C), until `ctx` is cancelled or the channel closes.
async fn merge_gossiped_nflog(
	mut rx: broadcast::Receiver<bytes::Bytes>,
	nflog: Arc<NotificationLog>,
	ctx: CancellationToken,
) {
	loop {
		tokio::select! {
			received = rx.recv() => match received {
				Ok(payload) => match serde_json::from_slice::<crate::nflog::NflogEntry>(&payload) {
					Ok(entry) => nflog.merge(entry).await,
					Err(err) => warn!("dropping malformed gossiped nflog entry: {err}"),
				},
				Err(broadcast::error::RecvError::Lagged(n)) => warn!(skipped = n, "nflog gossip subscription lagged"),
				Err(broadcast::error::RecvError::Closed) => break,
			},
			_ = ctx.cancelled() => break,
		}
	}
}

impl Core {
	pub fn new(config: &Config, peer: Arc<dyn ClusterPeer>, gossip: Arc<dyn GossipChannel>) -> Result<Arc<Self>, Error> {
		let routes = RouteTree::build(config.route.clone())?;
		let inhibitor = Inhibitor::new(&config.inhibit_rules)?;
		let time_intervals = config
			.time_intervals
			.iter()
			.map(|interval| (interval.name.clone(), interval.clone()))
			.collect();

		let silences = Arc::new(SilenceStore::new(gossip.clone(), config.global.data_retention));
		let nflog = Arc::new(NotificationLog::new(gossip.clone()));
		let provider = InMemoryProvider::new();
		let routes = Arc::new(routes);
		let dispatcher = Dispatcher::new(provider.clone(), routes.clone());

		Ok(Arc::new(Self {
			silences,
			nflog,
			inhibitor: RwLock::new(Arc::new(inhibitor)),
			dispatcher,
			provider,
			peer,
			gossip,
			routes: RwLock::new(routes),
			receivers: Arc::new(RwLock::new(config.receivers.clone())),
			time_intervals: Arc::new(RwLock::new(time_intervals)),
			location: jiff::tz::TimeZone::UTC,
			data_retention: config.global.data_retention,
			peer_timeout: config.global.peer_timeout,
			snapshot_paths: None,
		}))
	}

	pub fn with_snapshot_paths(mut self: Arc<Self>, paths: SnapshotPaths) -> Arc<Self> {
		Arc::get_mut(&mut self)
			.expect("with_snapshot_paths called before Core is shared")
			.snapshot_paths = Some(paths);
		self
	}

	/// Ingests a batch of alerts: validates each one (labels well-formed,
	/// `starts_at <= ends_at`), stores the valid ones in the provider and
	/// feeds the inhibitor's source caches, and reports the invalid ones as
	/// a batch validation failure. Valid alerts in the same batch are
	/// still accepted even when others fail.
	#[instrument(skip(self, alerts))]
	pub async fn ingest(&self, alerts: Vec<Alert>) -> Result<Vec<u64>, MultiError> {
		let total = alerts.len();
		let mut valid = Vec::with_capacity(total);
		let mut errors = Vec::new();
		for (index, alert) in alerts.into_iter().enumerate() {
			match alert.validate() {
				Ok(()) => valid.push(alert),
				Err(msg) => errors.push((index, msg)),
			}
		}

		let now = jiff::Timestamp::now();
		let inhibitor = self.inhibitor.read().await.clone();
		for alert in &valid {
			inhibitor.observe(&alert.labels, alert.is_firing_at(now)).await;
		}
		let fps = self.provider.put(valid).await;
		crate::metrics::inc_alerts_ingested(fps.len());

		if errors.is_empty() {
			Ok(fps)
		} else {
			warn!(total, failed = errors.len(), "rejected invalid alerts in batch");
			Err(MultiError { total, errors })
		}
	}

	pub async fn create_or_update_silence(&self, silence: Silence) -> Result<uuid::Uuid, Error> {
		self.silences.set(silence).await
	}

	pub async fn expire_silence(&self, id: uuid::Uuid) -> Result<(), Error> {
		self.silences.expire(id).await
	}

	pub async fn query_silences(&self, filter: &SilenceFilter) -> Vec<Silence> {
		self.silences.query(filter).await
	}

	/// Computes, for one alert, whether it's currently silenced and/or
	/// inhibited and which route(s) it matches. Shared by
	/// [`Core::get_alerts`] and [`Core::get_alert_groups`] so both apply
	/// identical filtering semantics.
	async fn alert_status<'a>(
		&self,
		alert: &Alert,
		routes: &'a RouteTree,
		inhibitor: &Inhibitor,
	) -> (bool, bool, Vec<crate::route::MatchedRoute<'a>>) {
		let (_, silenced) = self.silences.mutes(&alert.labels).await;
		let (_, inhibited) = inhibitor.mutes(&alert.labels).await;
		let matched = routes.matching_routes(&alert.labels);
		(silenced, inhibited, matched)
	}

	fn passes_filter(
		filter: &AlertFilter,
		alert: &Alert,
		now: jiff::Timestamp,
		silenced: bool,
		inhibited: bool,
		matched: &[crate::route::MatchedRoute<'_>],
	) -> bool {
		if let Some(active) = filter.active {
			if alert.is_firing_at(now) != active {
				return false;
			}
		}
		if let Some(want) = filter.silenced {
			if silenced != want {
				return false;
			}
		}
		if let Some(want) = filter.inhibited {
			if inhibited != want {
				return false;
			}
		}
		if let Some(want) = filter.muted {
			if (silenced || inhibited) != want {
				return false;
			}
		}
		if let Some(receiver_re) = &filter.receiver {
			if !matched.iter().any(|m| receiver_re.is_match(&m.node.receiver)) {
				return false;
			}
		}
		if !filter.matchers.is_empty() && !match_all(&filter.matchers, &alert.labels) {
			return false;
		}
		true
	}

	/// `GetAlerts` (§6): every ingested alert passing `filter`, sorted by
	/// fingerprint string. `filter.muted` is ignored — only
	/// [`Core::get_alert_groups`] groups by mute state.
	pub async fn get_alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
		let now = jiff::Timestamp::now();
		let routes = self.routes.read().await.clone();
		let inhibitor = self.inhibitor.read().await.clone();

		let mut matched_alerts = Vec::new();
		for alert in self.provider.all().await {
			let (silenced, inhibited, matched) = self.alert_status(&alert, &routes, &inhibitor).await;
			if Self::passes_filter(filter, &alert, now, silenced, inhibited, &matched) {
				matched_alerts.push(alert);
			}
		}
		matched_alerts.sort_by_key(|a| format!("{:016x}", a.fingerprint()));
		matched_alerts
	}

	/// `GetAlertGroups` (§6): every ingested alert passing `filter`,
	/// grouped by `(route, group-label-tuple)` the same way the dispatcher
	/// groups alerts for flushing.
	pub async fn get_alert_groups(&self, filter: &AlertFilter) -> Vec<AlertGroup> {
		let now = jiff::Timestamp::now();
		let routes = self.routes.read().await.clone();
		let inhibitor = self.inhibitor.read().await.clone();

		let mut groups: HashMap<String, AlertGroup> = HashMap::new();
		for alert in self.provider.all().await {
			let (silenced, inhibited, matched) = self.alert_status(&alert, &routes, &inhibitor).await;
			if !Self::passes_filter(filter, &alert, now, silenced, inhibited, &matched) {
				continue;
			}
			for route in &matched {
				let node = route.node;
				let key = group_key(node, &alert.labels);
				groups
					.entry(key)
					.or_insert_with(|| AlertGroup {
						route_id: node.id.clone(),
						receiver: node.receiver.clone(),
						group_labels: group_label_tuple(node, &alert.labels),
						alerts: Vec::new(),
					})
					.alerts
					.push(alert.clone());
			}
		}

		let mut groups: Vec<AlertGroup> = groups.into_values().collect();
		groups.sort_by(|a, b| (&a.route_id, &a.group_labels).cmp(&(&b.route_id, &b.group_labels)));
		groups
	}

	/// Re-reads route tree and inhibit rules from a freshly-parsed config
	/// (SIGHUP handler, §2.1).
	#[instrument(skip(self, config))]
	pub async fn reload(&self, config: &Config) -> Result<(), Error> {
		let routes = Arc::new(RouteTree::build(config.route.clone())?);
		let inhibitor = Arc::new(Inhibitor::new(&config.inhibit_rules)?);
		let time_intervals = config
			.time_intervals
			.iter()
			.map(|interval| (interval.name.clone(), interval.clone()))
			.collect();

		*self.routes.write().await = routes.clone();
		self.dispatcher.reload_routes(routes).await;
		*self.inhibitor.write().await = inhibitor;
		*self.time_intervals.write().await = time_intervals;
		*self.receivers.write().await = config.receivers.clone();
		info!("configuration reloaded");
		Ok(())
	}

	fn pipeline_deps(&self, inhibitor: Arc<Inhibitor>) -> PipelineDeps {
		PipelineDeps {
			silences: self.silences.clone(),
			nflog: self.nflog.clone(),
			inhibitor,
			peer: self.peer.clone(),
			peer_timeout: self.peer_timeout,
			data_retention: self.data_retention,
		}
	}

	/// Runs the dispatcher loop plus the periodic GC and snapshot timers
	/// until `ctx` is cancelled.
	pub async fn run(self: Arc<Self>, ctx: CancellationToken) {
		let inhibitor = self.inhibitor.read().await.clone();
		let deps = Arc::new(self.pipeline_deps(inhibitor));

		let dispatcher_handle = tokio::spawn(self.dispatcher.clone().run(
			ctx.clone(),
			deps,
			self.receivers.clone(),
			self.time_intervals.clone(),
			self.location.clone(),
		));

		let silences_gossip_handle = tokio::spawn(merge_gossiped_silences(
			self.gossip.subscribe(crate::silence::GOSSIP_CHANNEL_SILENCES),
			self.silences.clone(),
			ctx.clone(),
		));
		let nflog_gossip_handle = tokio::spawn(merge_gossiped_nflog(
			self.gossip.subscribe(crate::nflog::GOSSIP_CHANNEL_NFLOG),
			self.nflog.clone(),
			ctx.clone(),
		));

		let gc_ctx = ctx.clone();
		let gc_self = self.clone();
		let gc_handle = tokio::spawn(async move {
			let mut interval = tokio::time::interval(GC_INTERVAL);
			loop {
				tokio::select! {
					_ = interval.tick() => {
						let now = jiff::Timestamp::now();
						gc_self.silences.gc(now).await;
						gc_self.nflog.gc(now).await;
					}
					_ = gc_ctx.cancelled() => break,
				}
			}
		});

		let snapshot_ctx = ctx.clone();
		let snapshot_self = self.clone();
		let snapshot_handle = tokio::spawn(async move {
			let mut interval = tokio::time::interval(SNAPSHOT_INTERVAL);
			loop {
				tokio::select! {
					_ = interval.tick() => snapshot_self.save_snapshot().await,
					_ = snapshot_ctx.cancelled() => {
						snapshot_self.save_snapshot().await;
						break;
					}
				}
			}
		});

		let _ = tokio::join!(
			dispatcher_handle,
			gc_handle,
			snapshot_handle,
			silences_gossip_handle,
			nflog_gossip_handle
		);
	}

	/// Loads silence/nflog snapshots at boot, merging via the same rule as
	/// gossip (§6).
	pub async fn load_snapshots(&self) -> Result<(), Error> {
		let Some(paths) = &self.snapshot_paths else {
			return Ok(());
		};
		let silences: Vec<Silence> = snapshot::load(&paths.silences).await?;
		self.silences.load_snapshot(silences).await;

		let entries: Vec<crate::nflog::NflogEntry> = snapshot::load(&paths.nflog).await?;
		self.nflog.load_snapshot(entries).await;
		Ok(())
	}

	async fn save_snapshot(&self) {
		let Some(paths) = &self.snapshot_paths else {
			return;
		};
		if let Err(err) = snapshot::save(&paths.silences, &self.silences.snapshot_entries().await).await {
			tracing::warn!("failed to snapshot silences: {err}");
		}
		if let Err(err) = snapshot::save(&paths.nflog, &self.nflog.snapshot_entries().await).await {
			tracing::warn!("failed to snapshot nflog: {err}");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{
		label::LabelSet,
		matcher::MatchKind,
		peer::{LocalGossip, LocalPeer},
		route::{GroupBy, RouteConfig},
	};
	use jiff::Timestamp;

	fn labels(pairs: &[(&str, &str)]) -> LabelSet {
		pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
	}

	fn new_core(route: RouteConfig) -> Arc<Core> {
		let config = Config {
			route,
			..Default::default()
		};
		Core::new(&config, Arc::new(LocalPeer::solo("node-a")), Arc::new(LocalGossip::new())).unwrap()
	}

	#[tokio::test]
	async fn ingest_accepts_valid_and_rejects_invalid_in_same_batch() {
		let core = new_core(RouteConfig {
			receiver: Some("default".into()),
			..Default::default()
		});

		let now = Timestamp::now();
		let good = Alert::new(labels(&[("alertname", "Good")]), LabelSet::new(), now, now);
		let bad = Alert::new(LabelSet::new(), LabelSet::new(), now, now);

		let err = core.ingest(vec![good.clone(), bad]).await.unwrap_err();
		assert_eq!(err.total, 2);
		assert_eq!(err.errors.len(), 1);
		assert_eq!(err.errors[0].0, 1);

		let stored = core.provider.all().await;
		assert_eq!(stored.len(), 1);
		assert_eq!(stored[0].fingerprint(), good.fingerprint());
	}

	#[tokio::test]
	async fn ingest_returns_ok_when_every_alert_is_valid() {
		let core = new_core(RouteConfig {
			receiver: Some("default".into()),
			..Default::default()
		});

		let now = Timestamp::now();
		let alert = Alert::new(labels(&[("alertname", "X")]), LabelSet::new(), now, now);
		let fps = core.ingest(vec![alert.clone()]).await.unwrap();
		assert_eq!(fps, vec![alert.fingerprint()]);
	}

	#[tokio::test]
	async fn get_alerts_filters_by_active_and_matchers() {
		let core = new_core(RouteConfig {
			receiver: Some("default".into()),
			..Default::default()
		});

		let now = Timestamp::now();
		let firing = Alert::new(labels(&[("alertname", "Firing"), ("svc", "a")]), LabelSet::new(), now, now);
		let mut resolved = Alert::new(labels(&[("alertname", "Resolved"), ("svc", "b")]), LabelSet::new(), now, now);
		resolved.ends_at = now;
		core.ingest(vec![firing.clone(), resolved.clone()]).await.unwrap();

		let only_firing = core
			.get_alerts(&AlertFilter {
				active: Some(true),
				..Default::default()
			})
			.await;
		assert_eq!(only_firing.len(), 1);
		assert_eq!(only_firing[0].fingerprint(), firing.fingerprint());

		let by_matcher = core
			.get_alerts(&AlertFilter {
				matchers: vec![Matcher::new("svc", "b", MatchKind::Eq).unwrap()],
				..Default::default()
			})
			.await;
		assert_eq!(by_matcher.len(), 1);
		assert_eq!(by_matcher[0].fingerprint(), resolved.fingerprint());
	}

	#[tokio::test]
	async fn get_alerts_filters_by_silenced_state() {
		let core = new_core(RouteConfig {
			receiver: Some("default".into()),
			..Default::default()
		});

		let now = Timestamp::now();
		let alert = Alert::new(labels(&[("alertname", "X"), ("svc", "a")]), LabelSet::new(), now, now);
		core.ingest(vec![alert.clone()]).await.unwrap();

		core.create_or_update_silence(Silence {
			id: uuid::Uuid::nil(),
			matchers: vec![("svc".into(), "a".into(), MatchKind::Eq)],
			starts_at: now - jiff::SignedDuration::from_secs(1),
			ends_at: now + jiff::SignedDuration::from_hours(1),
			created_by: "test".into(),
			comment: String::new(),
			updated_at: now,
		})
		.await
		.unwrap();

		let silenced = core
			.get_alerts(&AlertFilter {
				silenced: Some(true),
				..Default::default()
			})
			.await;
		assert_eq!(silenced.len(), 1);

		let unsilenced = core
			.get_alerts(&AlertFilter {
				silenced: Some(false),
				..Default::default()
			})
			.await;
		assert!(unsilenced.is_empty());
	}

	#[tokio::test]
	async fn get_alert_groups_groups_by_route_and_group_labels() {
		let core = new_core(RouteConfig {
			receiver: Some("default".into()),
			group_by: Some(GroupBy(vec!["svc".into()])),
			..Default::default()
		});

		let now = Timestamp::now();
		let a1 = Alert::new(labels(&[("alertname", "A"), ("svc", "x")]), LabelSet::new(), now, now);
		let a2 = Alert::new(labels(&[("alertname", "B"), ("svc", "x")]), LabelSet::new(), now, now);
		let b1 = Alert::new(labels(&[("alertname", "C"), ("svc", "y")]), LabelSet::new(), now, now);
		core.ingest(vec![a1, a2, b1]).await.unwrap();

		let groups = core.get_alert_groups(&AlertFilter::default()).await;
		assert_eq!(groups.len(), 2);
		let svc_x = groups.iter().find(|g| g.group_labels == vec![("svc".to_string(), "x".to_string())]).unwrap();
		assert_eq!(svc_x.alerts.len(), 2);
	}
}
