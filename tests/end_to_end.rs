//! End-to-end scenarios driven through the public `Core` API against a real
//! (loopback) webhook receiver, covering the worked examples from the
//! notification pipeline's design.

mod support;

use std::{collections::HashMap, sync::Arc, time::Duration};

use jiff::Timestamp;
use klaxon::{
	Alert, ClusterPeer, Config, Core, GossipChannel, GroupBy, InhibitRuleConfig, LabelSet,
	LocalGossip, LocalPeer, MatchKind, Notifier, RouteConfig, Silence, WebhookConfig,
};
use uuid::Uuid;

fn labels(pairs: &[(&str, &str)]) -> LabelSet {
	pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

fn config_with_receiver(webhook_url: &str, group_by: Option<Vec<&str>>) -> Config {
	let mut receivers = HashMap::new();
	receivers.insert(
		"default".to_string(),
		Notifier::Webhook(WebhookConfig {
			url: webhook_url.parse().unwrap(),
			send_resolved: false,
		}),
	);

	Config {
		global: Default::default(),
		route: RouteConfig {
			receiver: Some("default".into()),
			group_by: group_by.map(|names| GroupBy(names.into_iter().map(String::from).collect())),
			group_wait: Some(Duration::from_millis(50)),
			group_interval: Some(Duration::from_secs(60)),
			..Default::default()
		},
		inhibit_rules: Vec::new(),
		receivers,
		time_intervals: Vec::new(),
    }
}

async fn start_core(config: &Config) -> Arc<Core> {
	let peer: Arc<dyn ClusterPeer> = Arc::new(LocalPeer::solo("node-a"));
	let gossip: Arc<dyn GossipChannel> = Arc::new(LocalGossip::new());
	let core = Core::new(config, peer, gossip).unwrap();
	let run_core = core.clone();
	tokio::spawn(async move {
		run_core.run(tokio_util::sync::CancellationToken::new()).await;
	});
	core
}

#[tokio::test]
async fn single_alert_notifies_once_after_group_wait() {
	let (url, requests) = support::spawn_webhook().await;
	let config = config_with_receiver(&url, None);
	let core = start_core(&config).await;

	let now = Timestamp::now();
	let alert = Alert::new(labels(&[("alertname", "X"), ("svc", "a")]), LabelSet::new(), now, now);
	core.ingest(vec![alert]).await.unwrap();

	tokio::time::sleep(Duration::from_millis(250)).await;

	assert_eq!(requests.count(), 1);
	assert_eq!(requests.alertnames(), vec!["X".to_string()]);
}

#[tokio::test]
async fn silenced_alert_is_never_notified() {
	let (url, requests) = support::spawn_webhook().await;
	let config = config_with_receiver(&url, None);
	let core = start_core(&config).await;

	let now = Timestamp::now();
	let hour = jiff::SignedDuration::from_hours(1);
	core.create_or_update_silence(Silence {
		id: Uuid::nil(),
		matchers: vec![("svc".into(), "a".into(), MatchKind::Eq)],
		starts_at: now - jiff::SignedDuration::from_secs(1),
		ends_at: now + hour,
		created_by: "test".into(),
		comment: String::new(),
		updated_at: now,
	})
	.await
	.unwrap();

	let alert = Alert::new(labels(&[("alertname", "X"), ("svc", "a")]), LabelSet::new(), now, now);
	core.ingest(vec![alert]).await.unwrap();

	tokio::time::sleep(Duration::from_millis(250)).await;

	assert_eq!(requests.count(), 0);
}

#[tokio::test]
async fn updating_expired_silence_returns_conflict() {
	let (url, _requests) = support::spawn_webhook().await;
	let config = config_with_receiver(&url, None);
	let core = start_core(&config).await;

	let now = Timestamp::now();
	let id = core
		.create_or_update_silence(Silence {
			id: Uuid::nil(),
			matchers: vec![("svc".into(), "a".into(), MatchKind::Eq)],
			starts_at: now - jiff::SignedDuration::from_millis(20),
			ends_at: now + jiff::SignedDuration::from_millis(20),
			created_by: "test".into(),
			comment: String::new(),
			updated_at: now,
		})
		.await
		.unwrap();

	tokio::time::sleep(Duration::from_millis(60)).await;

	let err = core
		.create_or_update_silence(Silence {
			id,
			matchers: vec![("svc".into(), "a".into(), MatchKind::Eq)],
			starts_at: now,
			ends_at: now + jiff::SignedDuration::from_hours(1),
			created_by: "test".into(),
			comment: String::new(),
			updated_at: now,
		})
		.await
		.unwrap_err();

	assert!(matches!(err, klaxon::Error::Conflict(_)));
}

#[tokio::test]
async fn inhibited_warning_is_dropped_while_critical_firing() {
	let (url, requests) = support::spawn_webhook().await;
	let mut config = config_with_receiver(&url, Some(vec!["alertname"]));
	config.inhibit_rules = vec![klaxon_inhibit_rule()];
	let core = start_core(&config).await;

	let now = Timestamp::now();
	let critical = Alert::new(
		labels(&[("alertname", "Critical"), ("severity", "critical"), ("cluster", "c1")]),
		LabelSet::new(),
		now,
		now,
	);
	let warning = Alert::new(
		labels(&[("alertname", "Warning"), ("severity", "warning"), ("cluster", "c1")]),
		LabelSet::new(),
		now,
		now,
	);
	core.ingest(vec![critical, warning]).await.unwrap();

	tokio::time::sleep(Duration::from_millis(250)).await;

	let names = requests.alertnames();
	assert!(names.contains(&"Critical".to_string()));
	assert!(!names.contains(&"Warning".to_string()));
}

fn klaxon_inhibit_rule() -> InhibitRuleConfig {
	InhibitRuleConfig {
		source_matchers: vec![("severity".into(), "critical".into(), MatchKind::Eq)],
		target_matchers: vec![("cluster".into(), "c1".into(), MatchKind::Eq)],
		equal_labels: vec!["cluster".into()],
	}
}
