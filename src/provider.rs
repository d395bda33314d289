//! The alert provider interface (§4.I): the boundary the dispatcher
//! consumes for ingesting and iterating alerts. Ingestion itself (the
//! monitoring-system-facing producer) is out of scope; [`InMemoryProvider`]
//! is the reference implementation the dispatcher runs against.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::instrument;

use crate::label::{fingerprint, Alert};

#[async_trait]
pub trait AlertProvider: Send + Sync {
	/// Stores or updates a batch of alerts, keyed by fingerprint. Returns
	/// the fingerprints actually written (callers use this for metrics).
	async fn put(&self, alerts: Vec<Alert>) -> Vec<u64>;

	async fn get(&self, fp: u64) -> Option<Alert>;

	/// A lazy, restartable subscription: every alert stored or updated
	/// after the call is delivered to the returned receiver. Dropping the
	/// receiver releases its buffer.
	fn subscribe(&self) -> broadcast::Receiver<Alert>;
}

const SUBSCRIPTION_CAPACITY: usize = 4096;

pub struct InMemoryProvider {
	alerts: RwLock<HashMap<u64, Alert>>,
	updates: broadcast::Sender<Alert>,
}

impl InMemoryProvider {
	pub fn new() -> Arc<Self> {
		let (updates, _) = broadcast::channel(SUBSCRIPTION_CAPACITY);
		Arc::new(Self {
			alerts: RwLock::new(HashMap::new()),
			updates,
		})
	}

	pub async fn all(&self) -> Vec<Alert> {
		self.alerts.read().await.values().cloned().collect()
	}
}

#[async_trait]
impl AlertProvider for InMemoryProvider {
	#[instrument(skip(self, alerts))]
	async fn put(&self, alerts: Vec<Alert>) -> Vec<u64> {
		let mut stored = self.alerts.write().await;
		let mut written = Vec::with_capacity(alerts.len());
		for alert in alerts {
			let fp = alert.fingerprint();
			stored.insert(fp, alert.clone());
			written.push(fp);
			// No subscribers is routine at boot before the dispatcher
			// starts listening; not worth logging on every ingest.
			let _ = self.updates.send(alert);
		}
		written
	}

	async fn get(&self, fp: u64) -> Option<Alert> {
		self.alerts.read().await.get(&fp).cloned()
	}

	fn subscribe(&self) -> broadcast::Receiver<Alert> {
		self.updates.subscribe()
	}
}
