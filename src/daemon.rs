use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use miette::{IntoDiagnostic, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{config::Config, core::Core, core::SnapshotPaths, http, peer::LocalPeer, peer::LocalGossip};

/// Configuration for the klaxon daemon.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
	/// Path to the YAML configuration file (routes, receivers, inhibit rules).
	pub config_path: PathBuf,

	/// Directory snapshots (`silences.ndjson`, `nflog.ndjson`) are persisted
	/// to and loaded from at boot. `None` disables persistence.
	pub data_dir: Option<PathBuf>,

	/// Addresses the ambient `/status`/`/metrics` HTTP server tries to bind,
	/// in order, falling back on bind failure.
	pub server_addrs: Vec<SocketAddr>,
}

impl DaemonConfig {
	pub fn new(config_path: PathBuf) -> Self {
		Self {
			config_path,
			data_dir: None,
			server_addrs: Vec::new(),
		}
	}

	pub fn with_data_dir(mut self, data_dir: PathBuf) -> Self {
		self.data_dir = Some(data_dir);
		self
	}

	pub fn with_server_addrs(mut self, addrs: Vec<SocketAddr>) -> Self {
		self.server_addrs = addrs;
		self
	}
}

async fn load_config(path: &PathBuf) -> Result<(Config, String)> {
	let content = tokio::fs::read_to_string(path).await.into_diagnostic()?;
	let config = Config::from_yaml(&content).map_err(|err| miette::miette!("{err}"))?;
	Ok((config, content))
}

pub async fn run(daemon_config: DaemonConfig) -> Result<()> {
	info!("starting klaxon daemon");
	crate::metrics::init_metrics();

	let (config, config_text) = load_config(&daemon_config.config_path).await?;

	// Single-node deployment by default; a real cluster transport plugs in
	// here by supplying a different ClusterPeer/GossipChannel pair (§4.D).
	let peer: Arc<dyn crate::peer::ClusterPeer> = Arc::new(LocalPeer::solo("klaxon-0"));
	let gossip: Arc<dyn crate::peer::GossipChannel> = Arc::new(LocalGossip::new());

	let core = Core::new(&config, peer.clone(), gossip).map_err(|err| miette::miette!("{err}"))?;
	let core = if let Some(data_dir) = &daemon_config.data_dir {
		tokio::fs::create_dir_all(data_dir).await.into_diagnostic()?;
		core.with_snapshot_paths(SnapshotPaths {
			silences: data_dir.join("silences.ndjson"),
			nflog: data_dir.join("nflog.ndjson"),
		})
	} else {
		core
	};
	core.load_snapshots().await.map_err(|err| miette::miette!("{err}"))?;

	let ctx = CancellationToken::new();

	let http_ctx = ctx.clone();
	let server_addrs = daemon_config.server_addrs.clone();
	tokio::spawn(http::serve(server_addrs, peer.clone(), config_text.clone(), http_ctx));

	#[cfg(unix)]
	{
		use tokio::signal::unix::{signal, SignalKind};

		let hup_ctx = ctx.clone();
		let hup_core = core.clone();
		let config_path = daemon_config.config_path.clone();
		tokio::spawn(async move {
			let mut sighup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
			loop {
				tokio::select! {
					_ = sighup.recv() => {
						info!("received SIGHUP, reloading configuration");
						match load_config(&config_path).await {
							Ok((config, _config_text)) => {
								if let Err(err) = hup_core.reload(&config).await {
									error!("failed to reload configuration: {err}");
								}
							}
							Err(err) => error!("failed to read configuration for reload: {err}"),
						}
					}
					_ = hup_ctx.cancelled() => break,
				}
			}
		});

		let term_ctx = ctx.clone();
		tokio::spawn(async move {
			let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
			sigterm.recv().await;
			info!("received SIGTERM, shutting down");
			term_ctx.cancel();
		});
	}

	let int_ctx = ctx.clone();
	tokio::spawn(async move {
		match tokio::signal::ctrl_c().await {
			Ok(()) => {
				info!("received SIGINT, shutting down");
				int_ctx.cancel();
			}
			Err(err) => error!("unable to listen for shutdown signal: {err}"),
		}
	});

	debug!("daemon started successfully");
	core.run(ctx).await;
	info!("daemon stopped");

	Ok(())
}
