//! Prometheus metrics for the klaxon daemon.
//!
//! Tracks alert ingestion, aggregation group lifecycle, notification
//! outcomes, silence/nflog store size, and gossip merge acceptance.

use std::sync::OnceLock;

use miette::{miette, IntoDiagnostic, Result};
use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};

static REGISTRY: OnceLock<Registry> = OnceLock::new();
static ALERTS_INGESTED_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static GROUPS_ACTIVE: OnceLock<IntGauge> = OnceLock::new();
static GROUPS_FLUSHED_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static NOTIFICATIONS_SENT_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static NOTIFICATIONS_FAILED_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static NOTIFICATIONS_RETRIED_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static SILENCES_ACTIVE: OnceLock<IntGauge> = OnceLock::new();
static NFLOG_ENTRIES: OnceLock<IntGauge> = OnceLock::new();
static GOSSIP_MERGES_APPLIED_TOTAL: OnceLock<IntCounter> = OnceLock::new();
static GOSSIP_MERGES_REJECTED_TOTAL: OnceLock<IntCounter> = OnceLock::new();

pub fn init_metrics() {
	let registry = Registry::new();

	macro_rules! counter {
		($name:expr, $help:expr) => {{
			let metric = IntCounter::new($name, $help).expect("failed to create metric");
			registry
				.register(Box::new(metric.clone()))
				.expect("failed to register metric");
			metric
		}};
	}
	macro_rules! gauge {
		($name:expr, $help:expr) => {{
			let metric = IntGauge::new($name, $help).expect("failed to create metric");
			registry
				.register(Box::new(metric.clone()))
				.expect("failed to register metric");
			metric
		}};
	}

	let alerts_ingested_total = counter!("klaxon_alerts_ingested_total", "Total alerts ingested");
	let groups_active = gauge!("klaxon_groups_active", "Aggregation groups currently active");
	let groups_flushed_total = counter!("klaxon_groups_flushed_total", "Total group flushes run");
	let notifications_sent_total = counter!("klaxon_notifications_sent_total", "Total notifications sent");
	let notifications_failed_total = counter!(
		"klaxon_notifications_failed_total",
		"Total notifications that failed permanently"
	);
	let notifications_retried_total = counter!(
		"klaxon_notifications_retried_total",
		"Total transient notification retries"
	);
	let silences_active = gauge!("klaxon_silences_active", "Silences currently active");
	let nflog_entries = gauge!("klaxon_nflog_entries", "Notification log entries currently held");
	let gossip_merges_applied_total =
		counter!("klaxon_gossip_merges_applied_total", "Gossiped records accepted by merge");
	let gossip_merges_rejected_total = counter!(
		"klaxon_gossip_merges_rejected_total",
		"Gossiped records rejected by merge (stale or corrupt)"
	);

	REGISTRY.set(registry).expect("metrics already initialized");
	ALERTS_INGESTED_TOTAL.set(alerts_ingested_total).ok();
	GROUPS_ACTIVE.set(groups_active).ok();
	GROUPS_FLUSHED_TOTAL.set(groups_flushed_total).ok();
	NOTIFICATIONS_SENT_TOTAL.set(notifications_sent_total).ok();
	NOTIFICATIONS_FAILED_TOTAL.set(notifications_failed_total).ok();
	NOTIFICATIONS_RETRIED_TOTAL.set(notifications_retried_total).ok();
	SILENCES_ACTIVE.set(silences_active).ok();
	NFLOG_ENTRIES.set(nflog_entries).ok();
	GOSSIP_MERGES_APPLIED_TOTAL.set(gossip_merges_applied_total).ok();
	GOSSIP_MERGES_REJECTED_TOTAL.set(gossip_merges_rejected_total).ok();
}

pub fn inc_alerts_ingested(n: usize) {
	if let Some(metric) = ALERTS_INGESTED_TOTAL.get() {
		metric.inc_by(n as u64);
	}
}

pub fn set_groups_active(n: usize) {
	if let Some(metric) = GROUPS_ACTIVE.get() {
		metric.set(n as i64);
	}
}

pub fn inc_groups_flushed() {
	if let Some(metric) = GROUPS_FLUSHED_TOTAL.get() {
		metric.inc();
	}
}

pub fn inc_notifications_sent() {
	if let Some(metric) = NOTIFICATIONS_SENT_TOTAL.get() {
		metric.inc();
	}
}

pub fn inc_notifications_failed() {
	if let Some(metric) = NOTIFICATIONS_FAILED_TOTAL.get() {
		metric.inc();
	}
}

pub fn inc_notifications_retried() {
	if let Some(metric) = NOTIFICATIONS_RETRIED_TOTAL.get() {
		metric.inc();
	}
}

pub fn set_silences_active(n: usize) {
	if let Some(metric) = SILENCES_ACTIVE.get() {
		metric.set(n as i64);
	}
}

pub fn set_nflog_entries(n: usize) {
	if let Some(metric) = NFLOG_ENTRIES.get() {
		metric.set(n as i64);
	}
}

pub fn inc_gossip_merges_applied() {
	if let Some(metric) = GOSSIP_MERGES_APPLIED_TOTAL.get() {
		metric.inc();
	}
}

pub fn inc_gossip_merges_rejected() {
	if let Some(metric) = GOSSIP_MERGES_REJECTED_TOTAL.get() {
		metric.inc();
	}
}

pub fn gather_metrics() -> Result<String> {
	let registry = REGISTRY.get().ok_or_else(|| miette!("metrics not initialized"))?;
	let metric_families = registry.gather();
	let encoder = TextEncoder::new();
	let mut buffer = Vec::new();
	encoder.encode(&metric_families, &mut buffer).into_diagnostic()?;
	String::from_utf8(buffer).into_diagnostic()
}
