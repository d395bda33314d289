//! The notification pipeline (§4.H): the ordered stage chain a flushed
//! aggregation group passes through before (or instead of) reaching a
//! receiver.

use std::{collections::HashMap, sync::Arc, time::Duration};

use jiff::Timestamp;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::{
	error::Error,
	inhibit::Inhibitor,
	label::{fingerprint, Alert},
	nflog::NotificationLog,
	notifier::Notifier,
	peer::ClusterPeer,
	route::RouteNode,
	silence::SilenceStore,
	time_window::TimeInterval,
};

const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const BACKOFF_FACTOR: u32 = 2;

/// Everything a flush needs to run the pipeline, gathered in one place so
/// [`Dispatcher`](crate::dispatch::Dispatcher) doesn't have to thread nine
/// parameters through each stage.
pub struct PipelineDeps {
	pub silences: Arc<SilenceStore>,
	pub nflog: Arc<NotificationLog>,
	pub inhibitor: Arc<Inhibitor>,
	pub peer: Arc<dyn ClusterPeer>,
	pub peer_timeout: Duration,
	pub data_retention: Duration,
}

/// Outcome of one flush, for dispatcher-side metrics and logging.
#[derive(Debug)]
pub enum FlushOutcome {
	/// A stage filtered everything out; nothing was sent.
	Suppressed,
	/// Dedupe determined a resend wasn't warranted.
	Deduped,
	Sent { count: usize },
	Failed(Error),
}

/// Runs the full stage chain for one group flush (§4.H). `alerts` is the
/// group's alert set at snapshot time; `time_intervals` resolves the
/// route's named mute/active windows.
#[instrument(skip_all, fields(receiver = %receiver, group_key = %group_key, alerts = alerts.len()))]
pub async fn flush(
	deps: &PipelineDeps,
	ctx: &CancellationToken,
	route: &RouteNode,
	receiver: &str,
	group_key: &str,
	notifier: &Notifier,
	time_intervals: &HashMap<String, TimeInterval>,
	location: &jiff::tz::TimeZone,
	mut alerts: Vec<Alert>,
) -> FlushOutcome {
	let now = Timestamp::now();

	// 1. Gossip wait: block until settled or ctx deadline, fail open.
	deps.peer.wait_ready(ctx).await;

	// 2. Active-time filter.
	if !route.active_time_intervals.is_empty()
		&& !route
			.active_time_intervals
			.iter()
			.filter_map(|name| time_intervals.get(name))
			.any(|interval| interval.contains(now, location))
	{
		return FlushOutcome::Suppressed;
	}

	// 3. Mute-time filter.
	if route
		.mute_time_intervals
		.iter()
		.filter_map(|name| time_intervals.get(name))
		.any(|interval| interval.contains(now, location))
	{
		return FlushOutcome::Suppressed;
	}

	// 4. Inhibit filter.
	let mut survivors = Vec::with_capacity(alerts.len());
	for alert in alerts.drain(..) {
		let (_, muted) = deps.inhibitor.mutes(&alert.labels).await;
		if !muted {
			survivors.push(alert);
		}
	}
	alerts = survivors;

	// 5. Silence filter.
	let mut survivors = Vec::with_capacity(alerts.len());
	for alert in alerts.drain(..) {
		let (_, silenced) = deps.silences.mutes(&alert.labels).await;
		if !silenced {
			survivors.push(alert);
		}
	}
	alerts = survivors;

	if alerts.is_empty() {
		return FlushOutcome::Suppressed;
	}

	// 6. Cluster-wait: sleep position() * peer_timeout, cancellable.
	let wait = deps.peer_timeout * deps.peer.position() as u32;
	if wait > Duration::ZERO {
		tokio::select! {
			_ = sleep(wait) => {}
			_ = ctx.cancelled() => return FlushOutcome::Suppressed,
		}
	}

	// 7. Dedupe via nflog.
	let firing_fps: Vec<u64> = alerts
		.iter()
		.filter(|a| a.is_firing_at(now))
		.map(|a| fingerprint(&a.labels))
		.collect();
	let resolved_fps: Vec<u64> = alerts
		.iter()
		.filter(|a| a.is_resolved_at(now))
		.map(|a| fingerprint(&a.labels))
		.collect();

	let existing = deps.nflog.query(receiver, group_key).await;
	let should_notify = match &existing {
		None => true,
		Some(entry) => {
			let mut firing_sorted = firing_fps.clone();
			firing_sorted.sort_unstable();
			let mut entry_firing_sorted = entry.firing_fps.clone();
			entry_firing_sorted.sort_unstable();

			firing_sorted != entry_firing_sorted
				|| (notifier.send_resolved()
					&& resolved_fps.iter().any(|fp| !entry.resolved_fps.contains(fp)))
				|| (now - entry.timestamp >= repeat_interval_duration(route) && !alerts.is_empty())
		}
	};

	if !should_notify {
		return FlushOutcome::Deduped;
	}

	// 8. Retry-notify with exponential backoff, cancellable by ctx.
	let mut backoff = INITIAL_BACKOFF;
	loop {
		match notifier.notify(&alerts).await {
			Ok(()) => break,
			Err(err) if err.is_retryable() => {
				warn!("transient notify failure, retrying in {backoff:?}: {err}");
				tokio::select! {
					_ = sleep(backoff) => {}
					_ = ctx.cancelled() => return FlushOutcome::Failed(err),
				}
				backoff = (backoff * BACKOFF_FACTOR).min(MAX_BACKOFF);
			}
			Err(err) => return FlushOutcome::Failed(err),
		}
	}

	// 9. Set nflog.
	let expires_at = now
		+ jiff::SignedDuration::try_from(repeat_interval_duration(route).max(deps.data_retention))
			.unwrap_or_default();
	deps.nflog
		.log(receiver, group_key, firing_fps, resolved_fps, expires_at)
		.await;

	info!(count = alerts.len(), "notified receiver");
	FlushOutcome::Sent { count: alerts.len() }
}

fn repeat_interval_duration(route: &RouteNode) -> Duration {
	route.repeat_interval
}
