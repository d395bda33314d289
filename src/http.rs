//! Ambient HTTP surface (§9.5): `/status` and `/metrics` only. The full
//! REST CRUD surface (alert/silence listing and mutation endpoints) is a
//! non-goal; this exists so the process is observable in the same way the
//! teacher's daemon is, without standing up the API the original system
//! exposes.

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use jiff::Timestamp;
use serde::Serialize;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{error, info, warn, Level};

use crate::{metrics, peer::ClusterPeer, peer::PeerStatus};

#[derive(Clone)]
struct ServerState {
	started_at: Timestamp,
	peer: Arc<dyn ClusterPeer>,
	config_text: Arc<String>,
}

/// §6 Status: `{uptime, cluster_status, config_text, version}`.
#[derive(Serialize)]
struct StatusResponse {
	uptime: String,
	cluster_status: PeerStatus,
	config_text: String,
	version: &'static str,
}

async fn handle_status(State(state): State<Arc<ServerState>>) -> Json<StatusResponse> {
	let uptime = Timestamp::now() - state.started_at;
	Json(StatusResponse {
		uptime: uptime.to_string(),
		cluster_status: state.peer.status(),
		config_text: (*state.config_text).clone(),
		version: env!("CARGO_PKG_VERSION"),
	})
}

async fn handle_metrics() -> (axum::http::StatusCode, String) {
	match metrics::gather_metrics() {
		Ok(body) => (axum::http::StatusCode::OK, body),
		Err(err) => {
			error!("failed to gather metrics: {err:?}");
			(
				axum::http::StatusCode::INTERNAL_SERVER_ERROR,
				format!("failed to gather metrics: {err}\n"),
			)
		}
	}
}

/// Binds and serves the ambient HTTP surface until cancelled. Mirrors the
/// teacher's `start_server` multi-address fallback, but doesn't block
/// startup on failing to bind — it warns and returns. `config_text` is the
/// raw, as-loaded configuration source, returned verbatim by `/status`.
pub async fn serve(
	addrs: Vec<std::net::SocketAddr>,
	peer: Arc<dyn ClusterPeer>,
	config_text: String,
	ctx: tokio_util::sync::CancellationToken,
) {
	let state = Arc::new(ServerState {
		started_at: Timestamp::now(),
		peer,
		config_text: Arc::new(config_text),
	});

	let app = Router::new()
		.route("/status", get(handle_status))
		.route("/metrics", get(handle_metrics))
		.layer(
			TraceLayer::new_for_http()
				.make_span_with(DefaultMakeSpan::new().level(Level::INFO).include_headers(false))
				.on_response(DefaultOnResponse::new().level(Level::INFO).include_headers(false)),
		)
		.with_state(state);

	let addrs_to_try = if addrs.is_empty() {
		vec!["[::1]:9093".parse().unwrap(), "127.0.0.1:9093".parse().unwrap()]
	} else {
		addrs
	};

	let mut listener = None;
	for addr in &addrs_to_try {
		match tokio::net::TcpListener::bind(addr).await {
			Ok(l) => {
				info!("HTTP server listening on http://{addr}");
				listener = Some(l);
				break;
			}
			Err(err) => warn!("failed to bind HTTP server to {addr}: {err}"),
		}
	}

	let Some(listener) = listener else {
		warn!("failed to bind HTTP server to any address, continuing without it");
		return;
	};

	let serve_result = axum::serve(listener, app).with_graceful_shutdown(async move {
		ctx.cancelled().await;
	});
	if let Err(err) = serve_result.await {
		error!("HTTP server error: {err}");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::peer::LocalPeer;

	#[tokio::test]
	async fn status_reports_cluster_status_and_config_text() {
		let state = Arc::new(ServerState {
			started_at: Timestamp::now(),
			peer: Arc::new(LocalPeer::solo("node-a")),
			config_text: Arc::new("route:\n  receiver: default\n".to_string()),
		});
		let Json(status) = handle_status(State(state.clone())).await;
		assert_eq!(status.cluster_status, PeerStatus::Ready);
		assert_eq!(status.config_text, "route:\n  receiver: default\n");
		assert_eq!(status.version, env!("CARGO_PKG_VERSION"));
	}

	#[tokio::test]
	async fn metrics_endpoint_reports_prometheus_text() {
		metrics::init_metrics();
		let (status, body) = handle_metrics().await;
		assert_eq!(status, axum::http::StatusCode::OK);
		assert!(body.contains("# HELP"));
	}
}
