//! Notifier built-ins (§9.7): the receiver-side contract consumed by the
//! pipeline's retry-notify stage. A tagged `Notifier` enum with a small
//! dispatch table stands in for the dynamic-dispatch-over-receivers the
//! original design sketched, per the redesign note in §7.
//!
//! Two built-ins are provided, each grounded in a pattern already present
//! in the wider stack: `Email` wraps a Mailgun send the way the teacher's
//! own email target does, and `Webhook` posts a JSON body via `reqwest`,
//! the HTTP client already used elsewhere in the stack.

use mailgun_rs::{EmailAddress, Mailgun, MailgunRegion, Message};
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::{error::Error, label::Alert};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmailConfig {
	pub mailgun_api_key: String,
	pub mailgun_domain: String,
	pub from: String,
	pub to: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
	pub url: url::Url,
	#[serde(default)]
	pub send_resolved: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notifier {
	Email(EmailConfig),
	Webhook(WebhookConfig),
}

impl Notifier {
	pub fn send_resolved(&self) -> bool {
		match self {
			Self::Email(_) => true,
			Self::Webhook(cfg) => cfg.send_resolved,
		}
	}

	/// Sends `alerts` through the configured integration. Errors are
	/// classified `Transient` (worth retrying) or `Permanent` per the
	/// receiver contract in §4.H — the integration, not the pipeline,
	/// decides which.
	#[instrument(skip(self, alerts), fields(alerts = alerts.len()))]
	pub async fn notify(&self, alerts: &[Alert]) -> Result<(), Error> {
		if alerts.is_empty() {
			return Ok(());
		}
		match self {
			Self::Email(cfg) => send_email(cfg, alerts).await,
			Self::Webhook(cfg) => send_webhook(cfg, alerts).await,
		}
	}
}

fn subject_for(alerts: &[Alert]) -> String {
	let name = alerts[0]
		.labels
		.get("alertname")
		.map(String::as_str)
		.unwrap_or("alert");
	if alerts.len() == 1 {
		format!("[klaxon] {name}")
	} else {
		format!("[klaxon] {name} (+{} more)", alerts.len() - 1)
	}
}

fn body_for(alerts: &[Alert]) -> String {
	alerts
		.iter()
		.map(|alert| {
			let labels = alert
				.labels
				.iter()
				.map(|(k, v)| format!("{k}={v}"))
				.collect::<Vec<_>>()
				.join(", ");
			let summary = alert.annotations.get("summary").map(String::as_str).unwrap_or("");
			format!("{labels}\n{summary}")
		})
		.collect::<Vec<_>>()
		.join("\n---\n")
}

async fn send_email(cfg: &EmailConfig, alerts: &[Alert]) -> Result<(), Error> {
	let subject = subject_for(alerts);
	let body = body_for(alerts);

	let sender = EmailAddress::address(&cfg.from);
	let mailgun = Mailgun {
		api_key: cfg.mailgun_api_key.clone(),
		domain: cfg.mailgun_domain.clone(),
		message: Message {
			to: cfg.to.iter().map(|addr| EmailAddress::address(addr)).collect(),
			subject,
			text: body,
			..Default::default()
		},
	};

	mailgun
		.async_send(MailgunRegion::US, &sender)
		.await
		.map(drop)
		.map_err(|err| {
			warn!("mailgun send failed: {err}");
			Error::transient(format!("mailgun send failed: {err}"))
		})
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
	alerts: &'a [Alert],
}

async fn send_webhook(cfg: &WebhookConfig, alerts: &[Alert]) -> Result<(), Error> {
	let client = reqwest::Client::new();
	let response = client
		.post(cfg.url.clone())
		.json(&WebhookPayload { alerts })
		.send()
		.await
		.map_err(|err| Error::transient(format!("webhook request failed: {err}")))?;

	let status = response.status();
	if status.is_success() {
		Ok(())
	} else if status.is_server_error() || status.as_u16() == 429 {
		Err(Error::transient(format!("webhook returned {status}")))
	} else {
		Err(Error::permanent(format!("webhook returned {status}")))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::label::LabelSet;
	use jiff::Timestamp;

	fn alert(name: &str) -> Alert {
		let mut labels = LabelSet::new();
		labels.insert("alertname".into(), name.into());
		Alert::new(labels, LabelSet::new(), Timestamp::now(), Timestamp::now())
	}

	#[test]
	fn subject_mentions_extra_count() {
		let alerts = vec![alert("Down"), alert("Down"), alert("Down")];
		assert_eq!(subject_for(&alerts), "[klaxon] Down (+2 more)");
	}

	#[test]
	fn email_always_sends_resolved() {
		let notifier = Notifier::Email(EmailConfig {
			mailgun_api_key: "key".into(),
			mailgun_domain: "example.com".into(),
			from: "alerts@example.com".into(),
			to: vec!["oncall@example.com".into()],
		});
		assert!(notifier.send_resolved());
	}

	#[tokio::test]
	async fn notify_with_no_alerts_is_a_noop() {
		let notifier = Notifier::Webhook(WebhookConfig {
			url: "https://example.com/hook".parse().unwrap(),
			send_resolved: false,
		});
		assert!(notifier.notify(&[]).await.is_ok());
	}
}
