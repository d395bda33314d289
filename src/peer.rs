//! Cluster peer and replication interfaces (§4.D): the boundary this
//! system consumes for gossiping silences and notification-log entries
//! across a cluster. The transport itself (discovery, membership,
//! anti-entropy) is out of scope; [`LocalPeer`]/[`LocalGossip`] is an
//! in-process reference implementation used for single-node deployment
//! and for simulating multi-peer clusters in tests.

use std::{
	collections::HashMap,
	sync::{Arc, Mutex},
};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
	Settling,
	Ready,
	Failed,
}

/// Cluster membership and gossip-settle status (§4.D), consumed by the
/// pipeline's gossip-wait and cluster-wait stages.
#[async_trait]
pub trait ClusterPeer: Send + Sync {
	fn status(&self) -> PeerStatus;

	/// Ordered (deterministic, sorted by name) list of cluster member
	/// names, including self.
	fn peers(&self) -> Vec<String>;

	/// Index of self within [`ClusterPeer::peers`]. A single-node
	/// deployment always returns 0.
	fn position(&self) -> usize;

	/// Blocks until gossip has settled (peer count unchanged for 3
	/// consecutive push-pull intervals) or `ctx` is cancelled. Returns
	/// `true` if settled, `false` on cancellation — callers fail open on
	/// `false` rather than treat it as an error.
	async fn wait_ready(&self, ctx: &CancellationToken) -> bool;
}

/// A broadcast channel for gossiped records, keyed by a named sub-channel
/// (e.g. `"silences"`, `"nflog"`) so multiple stores can share one peer
/// transport without framing collisions.
#[async_trait]
pub trait GossipChannel: Send + Sync {
	async fn broadcast(&self, channel: &str, payload: Bytes);

	/// Subscribes to a channel; returns a receiver of raw payloads. Lagged
	/// receivers silently skip ahead (see [`LocalGossip`]) rather than
	/// erroring, matching at-least-once rather than exactly-once delivery.
	fn subscribe(&self, channel: &str) -> broadcast::Receiver<Bytes>;
}

const CHANNEL_CAPACITY: usize = 1024;

/// Reference [`ClusterPeer`] implementation: a single node that is always
/// ready and at position 0. Multi-peer clusters are simulated in tests by
/// constructing several [`LocalPeer`]s with distinct, pre-sorted names and
/// wiring their [`LocalGossip`]s together.
pub struct LocalPeer {
	peers: Vec<String>,
	position: usize,
}

impl LocalPeer {
	/// A single-node deployment.
	pub fn solo(name: impl Into<String>) -> Self {
		Self {
			peers: vec![name.into()],
			position: 0,
		}
	}

	/// A node within a simulated cluster: `peers` must already be sorted by
	/// name, `self_name` must appear in it.
	pub fn in_cluster(peers: Vec<String>, self_name: &str) -> Self {
		let position = peers
			.iter()
			.position(|p| p == self_name)
			.expect("self_name must be a member of peers");
		Self { peers, position }
	}
}

#[async_trait]
impl ClusterPeer for LocalPeer {
	fn status(&self) -> PeerStatus {
		PeerStatus::Ready
	}

	fn peers(&self) -> Vec<String> {
		self.peers.clone()
	}

	fn position(&self) -> usize {
		self.position
	}

	async fn wait_ready(&self, _ctx: &CancellationToken) -> bool {
		true
	}
}

/// Reference [`GossipChannel`] implementation backed by in-process
/// broadcast channels, one per named sub-channel, created lazily on first
/// use.
pub struct LocalGossip {
	channels: Mutex<HashMap<String, broadcast::Sender<Bytes>>>,
}

impl LocalGossip {
	pub fn new() -> Self {
		Self {
			channels: Mutex::new(HashMap::new()),
		}
	}

	fn sender(&self, channel: &str) -> broadcast::Sender<Bytes> {
		let mut channels = self.channels.lock().expect("gossip channel map poisoned");
		channels
			.entry(channel.to_string())
			.or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
			.clone()
	}

	/// Wires two local gossip hubs together: every broadcast on `a` is
	/// forwarded to `b` and vice versa, simulating a two-peer cluster.
	/// Intended for tests and small local dev clusters only.
	pub fn link(a: &Arc<LocalGossip>, b: &Arc<LocalGossip>, channel: &str) {
		Self::forward(a.clone(), b.clone(), channel);
		Self::forward(b.clone(), a.clone(), channel);
	}

	fn forward(from: Arc<LocalGossip>, to: Arc<LocalGossip>, channel: &str) {
		let mut rx = from.subscribe(channel);
		let channel = channel.to_string();
		tokio::spawn(async move {
			loop {
				match rx.recv().await {
					Ok(payload) => {
						to.sender(&channel).send(payload).ok();
					}
					Err(broadcast::error::RecvError::Lagged(skipped)) => {
						warn!(skipped, channel, "gossip forwarder lagged, dropping messages");
						continue;
					}
					Err(broadcast::error::RecvError::Closed) => break,
				}
			}
		});
	}
}

impl Default for LocalGossip {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl GossipChannel for LocalGossip {
	async fn broadcast(&self, channel: &str, payload: Bytes) {
		let sender = self.sender(channel);
		// No subscribers is a normal, silent case (e.g. a single-node
		// deployment with nothing listening on this sub-channel yet).
		if sender.send(payload).is_err() {
			debug!(channel, "gossip broadcast had no subscribers");
		}
	}

	fn subscribe(&self, channel: &str) -> broadcast::Receiver<Bytes> {
		self.sender(channel).subscribe()
	}
}
