//! Shared test-only webhook receiver: a tiny axum server that records every
//! POSTed body so scenario tests can assert on what actually reached the
//! notifier, rather than just trusting internal dispatcher state.

use std::sync::{Arc, Mutex};

use axum::{extract::State, routing::post, Json, Router};
use serde_json::Value;

#[derive(Clone, Default)]
pub struct Requests(pub Arc<Mutex<Vec<Value>>>);

impl Requests {
	pub fn count(&self) -> usize {
		self.0.lock().unwrap().len()
	}

	pub fn alertnames(&self) -> Vec<String> {
		self.0
			.lock()
			.unwrap()
			.iter()
			.flat_map(|body| body["alerts"].as_array().cloned().unwrap_or_default())
			.filter_map(|alert| alert["labels"]["alertname"].as_str().map(String::from))
			.collect()
	}
}

async fn receive(State(requests): State<Requests>, Json(body): Json<Value>) {
	requests.0.lock().unwrap().push(body);
}

/// Binds a mock webhook receiver on an OS-assigned loopback port and returns
/// its base URL plus a handle for inspecting what it received.
pub async fn spawn_webhook() -> (String, Requests) {
	let requests = Requests::default();
	let app = Router::new().route("/hook", post(receive)).with_state(requests.clone());

	let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		axum::serve(listener, app).await.ok();
	});

	(format!("http://{addr}/hook"), requests)
}
