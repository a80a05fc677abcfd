//! Webhook notifier.
//!
//! Pushes a subset of bus events to configured notification channels
//! (Discord, Slack, ntfy.sh). Delivery is at-most-once: failures are
//! logged and recorded in the delivery history, never retried.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use sqlx::SqlitePool;
use tokio::sync::watch;

use crate::config::Config;
use crate::db;
use crate::events::{Event, EventBus, EventType};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Events worth notifying a human about.
fn is_notifiable(event_type: EventType) -> bool {
    matches!(
        event_type,
        EventType::PrintStarted
            | EventType::JobCompleted
            | EventType::JobFailed
            | EventType::PrinterError
            | EventType::PrinterOffline
    )
}

#[derive(Debug, Clone)]
enum Channel {
    Discord { webhook_url: String },
    Slack { webhook_url: String },
    Ntfy { server: String, topic: String },
}

impl Channel {
    fn name(&self) -> &'static str {
        match self {
            Channel::Discord { .. } => "discord",
            Channel::Slack { .. } => "slack",
            Channel::Ntfy { .. } => "ntfy",
        }
    }
}

/// Human-facing title and body for one event.
pub fn format_event(event: &Event) -> (String, String) {
    let printer = event
        .payload
        .get("printer_name")
        .or_else(|| event.payload.get("printer_id"))
        .and_then(|v| v.as_str())
        .unwrap_or("printer");
    let filename = event
        .payload
        .get("filename")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    match event.event_type {
        EventType::PrintStarted => (
            format!("Print started on {printer}"),
            if filename.is_empty() {
                "A new print job has started.".to_string()
            } else {
                format!("Now printing {filename}.")
            },
        ),
        EventType::JobCompleted => (
            format!("Print finished on {printer}"),
            if filename.is_empty() {
                "The print job completed successfully.".to_string()
            } else {
                format!("{filename} completed successfully.")
            },
        ),
        EventType::JobFailed => (
            format!("Print failed on {printer}"),
            if filename.is_empty() {
                "The print job failed.".to_string()
            } else {
                format!("{filename} failed.")
            },
        ),
        EventType::PrinterError => (
            format!("Printer error: {printer}"),
            event
                .payload
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("The printer reported an error.")
                .to_string(),
        ),
        EventType::PrinterOffline => (
            format!("{printer} went offline"),
            "The printer stopped responding.".to_string(),
        ),
        other => (other.as_str().to_string(), String::new()),
    }
}

fn discord_payload(title: &str, body: &str, event_type: EventType) -> serde_json::Value {
    let color = match event_type {
        EventType::JobCompleted => 0x2E_CC71,
        EventType::JobFailed | EventType::PrinterError => 0xE7_4C3C,
        EventType::PrinterOffline => 0x95_A5A6,
        _ => 0x34_98DB,
    };
    json!({
        "embeds": [{
            "title": title,
            "description": body,
            "color": color,
        }]
    })
}

fn slack_payload(title: &str, body: &str) -> serde_json::Value {
    json!({ "text": format!("*{title}*\n{body}") })
}

pub struct WebhookNotifier {
    stop_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl WebhookNotifier {
    /// Returns `None` when no channel is configured.
    pub fn start(config: &Config, bus: Arc<EventBus>, pool: SqlitePool) -> Option<Self> {
        let mut channels = Vec::new();
        if let Some(url) = &config.discord_webhook_url {
            channels.push(Channel::Discord {
                webhook_url: url.clone(),
            });
        }
        if let Some(url) = &config.slack_webhook_url {
            channels.push(Channel::Slack {
                webhook_url: url.clone(),
            });
        }
        if let (Some(server), Some(topic)) = (&config.ntfy_server, &config.ntfy_topic) {
            channels.push(Channel::Ntfy {
                server: server.trim_end_matches('/').to_string(),
                topic: topic.clone(),
            });
        }
        if channels.is_empty() {
            return None;
        }

        tracing::info!(
            channels = ?channels.iter().map(Channel::name).collect::<Vec<_>>(),
            "webhook notifier enabled"
        );

        let http = reqwest::Client::builder()
            .timeout(DELIVERY_TIMEOUT)
            .build()
            .expect("reqwest client");
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let mut sub = bus.subscribe_filtered(|e| is_notifiable(e.event_type));

        let task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = sub.recv() => event,
                    _ = stop_rx.changed() => return,
                };
                let Some(event) = event else { return };

                for channel in &channels {
                    let result = deliver(&http, channel, &event).await;
                    let (success, error) = match &result {
                        Ok(()) => (true, None),
                        Err(e) => {
                            tracing::warn!(
                                channel = channel.name(),
                                event_type = event.event_type.as_str(),
                                error = %e,
                                "webhook delivery failed"
                            );
                            (false, Some(e.clone()))
                        }
                    };
                    let _ = db::webhooks::record_delivery(
                        &pool,
                        channel.name(),
                        event.event_type.as_str(),
                        success,
                        error.as_deref(),
                    )
                    .await;
                }
            }
        });

        Some(Self { stop_tx, task })
    }

    pub async fn shutdown(self) {
        let _ = self.stop_tx.send(true);
        self.task.abort();
    }
}

async fn deliver(
    http: &reqwest::Client,
    channel: &Channel,
    event: &Event,
) -> Result<(), String> {
    let (title, body) = format_event(event);

    let request = match channel {
        Channel::Discord { webhook_url } => http
            .post(webhook_url)
            .json(&discord_payload(&title, &body, event.event_type)),
        Channel::Slack { webhook_url } => http.post(webhook_url).json(&slack_payload(&title, &body)),
        Channel::Ntfy { server, topic } => http
            .post(format!("{server}/{topic}"))
            .header("Title", title.clone())
            .header(
                "Priority",
                match event.event_type {
                    EventType::JobFailed | EventType::PrinterError => "high",
                    _ => "default",
                },
            )
            .header("Tags", "printer")
            .body(body.clone()),
    };

    let response = request.send().await.map_err(|e| e.to_string())?;
    if response.status().is_success() {
        Ok(())
    } else {
        Err(format!("HTTP {}", response.status().as_u16()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: EventType, payload: serde_json::Value) -> Event {
        Event::new(event_type, payload)
    }

    #[test]
    fn only_human_relevant_events_notify() {
        assert!(is_notifiable(EventType::JobCompleted));
        assert!(is_notifiable(EventType::PrinterError));
        assert!(!is_notifiable(EventType::StatusUpdated));
        assert!(!is_notifiable(EventType::SubscriberDropped));
    }

    #[test]
    fn formatting_is_deterministic_per_event() {
        let e = event(
            EventType::JobCompleted,
            serde_json::json!({ "printer_name": "X1C", "filename": "benchy.3mf" }),
        );
        let first = format_event(&e);
        let second = format_event(&e);
        assert_eq!(first, second);
        assert_eq!(first.0, "Print finished on X1C");
        assert_eq!(first.1, "benchy.3mf completed successfully.");
    }

    #[test]
    fn discord_failures_are_red() {
        let payload = discord_payload("t", "b", EventType::JobFailed);
        assert_eq!(payload["embeds"][0]["color"], 0xE7_4C3C);
    }

    #[test]
    fn missing_fields_fall_back_gracefully() {
        let e = event(EventType::PrintStarted, serde_json::json!({}));
        let (title, body) = format_event(&e);
        assert_eq!(title, "Print started on printer");
        assert_eq!(body, "A new print job has started.");
    }
}
