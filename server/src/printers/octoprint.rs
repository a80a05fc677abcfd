//! OctoPrint push client over SockJS.
//!
//! OctoPrint publishes state through a SockJS endpoint at
//! `/sockjs/<server id>/<session id>/websocket`. SockJS adds a one-byte
//! framing layer on top of WebSocket text messages: `o` opens the
//! session, `h` is a heartbeat, `c` closes, and `a[...]` carries an
//! array of JSON-encoded messages.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use serde_json::Value;
use tokio::sync::{oneshot, watch, Mutex, RwLock};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use super::status::{self, PrinterStatus};
use super::{PrinterKind, ProtocolClient, RemoteFile};
use crate::error::{Result, ServiceError};
use crate::events::{EventBus, EventType};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(5);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(300);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

pub struct OctoPrintClient {
    inner: Arc<Inner>,
}

struct Inner {
    printer_id: String,
    base_url: String,
    api_key: String,
    bus: Arc<EventBus>,
    http: reqwest::Client,

    current: RwLock<Option<Value>>,
    connected: AtomicBool,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    updates_tx: watch::Sender<u64>,
    last_message: RwLock<Option<Instant>>,
}

impl OctoPrintClient {
    pub fn new(host: String, api_key: String, bus: Arc<EventBus>, printer_id: String) -> Self {
        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", host.trim_end_matches('/'))
        };
        let (updates_tx, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                printer_id,
                base_url,
                api_key,
                bus,
                http: reqwest::Client::builder()
                    .timeout(Duration::from_secs(10))
                    .build()
                    .expect("reqwest client"),
                current: RwLock::new(None),
                connected: AtomicBool::new(false),
                stop_tx: Mutex::new(None),
                updates_tx,
                last_message: RwLock::new(None),
            }),
        }
    }
}

/// Build the SockJS WebSocket URL for a base HTTP URL.
fn sockjs_url(base_url: &str, server_id: &str, session_id: &str) -> String {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        format!("ws://{base_url}")
    };
    format!("{ws_base}/sockjs/{server_id}/{session_id}/websocket")
}

fn random_server_id() -> String {
    rand::thread_rng().gen_range(100..1000).to_string()
}

fn random_session_id() -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::thread_rng();
    (0..8)
        .map(|_| CHARS[rng.gen_range(0..CHARS.len())] as char)
        .collect()
}

/// The authentication payload sent after the `o` frame: a one-element
/// JSON array holding a JSON-encoded `{"auth":"<key>:"}` string.
fn auth_frame(api_key: &str) -> String {
    let inner = serde_json::json!({ "auth": format!("{api_key}:") }).to_string();
    serde_json::to_string(&vec![inner]).expect("auth frame")
}

impl Inner {
    async fn run_receive_loop(
        self: Arc<Self>,
        mut stop_rx: watch::Receiver<bool>,
        mut first_connect: Option<oneshot::Sender<Result<()>>>,
    ) {
        let mut attempts = 0u32;

        loop {
            if *stop_rx.borrow() {
                return;
            }

            let url = sockjs_url(&self.base_url, &random_server_id(), &random_session_id());
            match self.run_session(&url, &mut stop_rx, &mut first_connect).await {
                SessionEnd::Stopped => return,
                SessionEnd::AuthRejected => {
                    if let Some(tx) = first_connect.take() {
                        let _ = tx.send(Err(ServiceError::Auth("API key rejected".into())));
                    }
                    return;
                }
                SessionEnd::Lost(reason) => {
                    self.connected.store(false, Ordering::SeqCst);
                    self.updates_tx.send_modify(|n| *n += 1);
                    attempts += 1;
                    if attempts > MAX_RECONNECT_ATTEMPTS {
                        tracing::error!(
                            printer_id = %self.printer_id,
                            attempts,
                            "SockJS reconnect attempts exhausted"
                        );
                        if let Some(tx) = first_connect.take() {
                            let _ = tx.send(Err(ServiceError::TransientNetwork(reason)));
                        }
                        return;
                    }

                    let backoff = RECONNECT_BASE_DELAY
                        .saturating_mul(2u32.saturating_pow(attempts.saturating_sub(1)))
                        .min(RECONNECT_MAX_DELAY);
                    let jittered = crate::download::jitter(backoff, 0.1);
                    tracing::info!(
                        printer_id = %self.printer_id,
                        attempt = attempts,
                        delay_s = jittered.as_secs_f64(),
                        reason = %reason,
                        "SockJS reconnecting"
                    );
                    if let Some(tx) = first_connect.take() {
                        let _ = tx.send(Err(ServiceError::TransientNetwork(reason)));
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(jittered) => {}
                        _ = stop_rx.changed() => return,
                    }
                }
                SessionEnd::Connected => {
                    // Session ran and ended cleanly after connecting:
                    // reset the attempt counter and reconnect promptly.
                    attempts = 0;
                }
            }
        }
    }

    async fn run_session(
        self: &Arc<Self>,
        url: &str,
        stop_rx: &mut watch::Receiver<bool>,
        first_connect: &mut Option<oneshot::Sender<Result<()>>>,
    ) -> SessionEnd {
        let mut request = match url.into_client_request() {
            Ok(r) => r,
            Err(e) => return SessionEnd::Lost(format!("bad URL: {e}")),
        };
        match HeaderValue::from_str(&self.api_key) {
            Ok(value) => {
                request.headers_mut().insert("X-Api-Key", value);
            }
            Err(_) => return SessionEnd::AuthRejected,
        }

        let (mut socket, _) =
            match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request)).await {
                Ok(Ok(pair)) => pair,
                Ok(Err(e)) => return SessionEnd::Lost(format!("websocket connect: {e}")),
                Err(_) => return SessionEnd::Lost("websocket connect timeout".into()),
            };

        tracing::debug!(printer_id = %self.printer_id, url, "SockJS socket open");
        let mut was_connected = false;

        loop {
            let message = tokio::select! {
                msg = socket.next() => msg,
                _ = stop_rx.changed() => {
                    let _ = socket.close(None).await;
                    return SessionEnd::Stopped;
                }
            };

            let text = match message {
                Some(Ok(Message::Text(text))) => text.to_string(),
                Some(Ok(Message::Close(_))) | None => {
                    return if was_connected {
                        SessionEnd::Connected
                    } else {
                        SessionEnd::Lost("socket closed".into())
                    };
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return SessionEnd::Lost(format!("websocket: {e}")),
            };

            if text.is_empty() {
                continue;
            }
            *self.last_message.write().await = Some(Instant::now());

            match text.as_bytes()[0] {
                b'o' => {
                    // Open frame: authenticate.
                    let frame = auth_frame(&self.api_key);
                    if socket.send(Message::Text(frame.into())).await.is_err() {
                        return SessionEnd::Lost("auth send failed".into());
                    }
                }
                b'h' => {
                    tracing::trace!(printer_id = %self.printer_id, "SockJS heartbeat");
                }
                b'c' => {
                    tracing::info!(printer_id = %self.printer_id, "SockJS close frame");
                    return if was_connected {
                        SessionEnd::Connected
                    } else {
                        SessionEnd::Lost("server sent close frame".into())
                    };
                }
                b'a' => {
                    let messages: Vec<Value> = match serde_json::from_str(&text[1..]) {
                        Ok(m) => m,
                        Err(e) => {
                            tracing::warn!(printer_id = %self.printer_id, error = %e, "invalid SockJS array frame");
                            continue;
                        }
                    };
                    for entry in messages {
                        let parsed = match &entry {
                            Value::String(s) => match serde_json::from_str::<Value>(s) {
                                Ok(v) => v,
                                Err(e) => {
                                    tracing::warn!(printer_id = %self.printer_id, error = %e, "invalid SockJS message");
                                    continue;
                                }
                            },
                            other => other.clone(),
                        };
                        if self.dispatch_message(&parsed).await {
                            was_connected = true;
                            if let Some(tx) = first_connect.take() {
                                let _ = tx.send(Ok(()));
                            }
                        }
                    }
                }
                other => {
                    tracing::debug!(printer_id = %self.printer_id, frame = %(other as char), "unknown SockJS frame");
                }
            }
        }
    }

    /// Dispatch one inner message. Returns true when it was the
    /// `connected` handshake confirmation.
    async fn dispatch_message(self: &Arc<Self>, message: &Value) -> bool {
        if let Some(connected) = message.get("connected") {
            tracing::info!(
                printer_id = %self.printer_id,
                version = connected.get("version").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
                "OctoPrint SockJS authenticated"
            );
            self.connected.store(true, Ordering::SeqCst);
            self.updates_tx.send_modify(|n| *n += 1);
            return true;
        }

        if let Some(current) = message.get("current") {
            *self.current.write().await = Some(current.clone());
            self.updates_tx.send_modify(|n| *n += 1);
        } else if let Some(history) = message.get("history") {
            // Full history arrives once on connect; its latest entry
            // seeds the cached state.
            *self.current.write().await = Some(history.clone());
            self.updates_tx.send_modify(|n| *n += 1);
        } else if let Some(event) = message.get("event") {
            self.forward_event(event);
        } else if let Some(plugin) = message.get("plugin") {
            tracing::debug!(
                printer_id = %self.printer_id,
                plugin = plugin.get("plugin").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
                "ignoring plugin message"
            );
        }
        false
    }

    fn forward_event(&self, event: &Value) {
        let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");
        let payload = event.get("payload").cloned().unwrap_or(Value::Null);
        let mapped = match event_type {
            "PrintStarted" => Some(EventType::PrintStarted),
            "PrintPaused" => Some(EventType::PrintPaused),
            "PrintResumed" => Some(EventType::PrintResumed),
            "PrintCancelled" => Some(EventType::PrintStopped),
            "PrintDone" => Some(EventType::JobCompleted),
            "PrintFailed" => Some(EventType::JobFailed),
            _ => None,
        };
        match mapped {
            Some(bus_type) => self.bus.publish(
                bus_type,
                serde_json::json!({
                    "printer_id": self.printer_id,
                    "source": "octoprint_event",
                    "event": event_type,
                    "payload": payload,
                }),
            ),
            None => {
                tracing::debug!(printer_id = %self.printer_id, event_type, "unmapped OctoPrint event");
            }
        }
    }
}

enum SessionEnd {
    Stopped,
    AuthRejected,
    Connected,
    Lost(String),
}

#[async_trait::async_trait]
impl ProtocolClient for OctoPrintClient {
    fn kind(&self) -> PrinterKind {
        PrinterKind::Octoprint
    }

    fn is_push(&self) -> bool {
        true
    }

    async fn connect(&self) -> Result<()> {
        let (stop_tx, stop_rx) = watch::channel(false);
        let (connected_tx, connected_rx) = oneshot::channel();
        *self.inner.stop_tx.lock().await = Some(stop_tx);

        tokio::spawn(
            Arc::clone(&self.inner).run_receive_loop(stop_rx, Some(connected_tx)),
        );

        match tokio::time::timeout(CONNECT_TIMEOUT, connected_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ServiceError::TransientNetwork(
                "SockJS task exited".into(),
            )),
            Err(_) => Err(ServiceError::TransientNetwork(format!(
                "SockJS connect timeout to {}",
                self.inner.base_url
            ))),
        }
    }

    async fn disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        if let Some(stop) = self.inner.stop_tx.lock().await.take() {
            let _ = stop.send(true);
        }
    }

    async fn status(&self) -> Result<PrinterStatus> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Ok(PrinterStatus::offline());
        }
        match self.inner.current.read().await.as_ref() {
            Some(current) => Ok(status::extract_octoprint(current)),
            None => Ok(PrinterStatus::with_state(status::PrinterState::Unknown)),
        }
    }

    async fn pause(&self) -> Result<()> {
        self.job_command(serde_json::json!({ "command": "pause", "action": "pause" }))
            .await
    }

    async fn resume(&self) -> Result<()> {
        self.job_command(serde_json::json!({ "command": "pause", "action": "resume" }))
            .await
    }

    async fn stop_print(&self) -> Result<()> {
        self.job_command(serde_json::json!({ "command": "cancel" })).await
    }

    async fn take_snapshot(&self) -> Result<(Vec<u8>, String)> {
        let response = self
            .inner
            .http
            .get(format!("{}/webcam/?action=snapshot", self.inner.base_url))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ServiceError::NotFound("webcam snapshot unavailable".into()));
        }
        let mime = response
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();
        Ok((response.bytes().await?.to_vec(), mime))
    }

    async fn list_files(&self) -> Result<Vec<RemoteFile>> {
        let response = self
            .inner
            .http
            .get(format!("{}/api/files?recursive=true", self.inner.base_url))
            .header("X-Api-Key", &self.inner.api_key)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(ServiceError::TransientNetwork(format!(
                "file listing: HTTP {}",
                response.status().as_u16()
            )));
        }
        let listing: Value = response.json().await?;
        let mut files = Vec::new();
        collect_files(&listing["files"], &mut files);
        Ok(files)
    }

    fn updates(&self) -> watch::Receiver<u64> {
        self.inner.updates_tx.subscribe()
    }

    fn last_message_age(&self) -> Option<Duration> {
        self.inner
            .last_message
            .try_read()
            .ok()
            .and_then(|guard| guard.map(|at| at.elapsed()))
    }
}

impl OctoPrintClient {
    async fn job_command(&self, body: Value) -> Result<()> {
        let response = self
            .inner
            .http
            .post(format!("{}/api/job", self.inner.base_url))
            .header("X-Api-Key", &self.inner.api_key)
            .json(&body)
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ServiceError::Protocol(format!(
                "job command rejected: HTTP {}",
                response.status().as_u16()
            )))
        }
    }
}

fn collect_files(node: &Value, out: &mut Vec<RemoteFile>) {
    let Some(entries) = node.as_array() else {
        return;
    };
    for entry in entries {
        if entry["type"].as_str() == Some("folder") {
            collect_files(&entry["children"], out);
            continue;
        }
        let Some(name) = entry["name"].as_str() else {
            continue;
        };
        out.push(RemoteFile {
            name: entry["display"].as_str().unwrap_or(name).to_string(),
            size: entry["size"].as_u64().unwrap_or(0),
            path: entry["path"].as_str().unwrap_or(name).to_string(),
            modified: entry["date"]
                .as_i64()
                .and_then(|t| chrono::DateTime::from_timestamp(t, 0)),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_frame_is_the_exact_wire_literal() {
        assert_eq!(auth_frame("APIKEY"), r#"["{\"auth\":\"APIKEY:\"}"]"#);
    }

    #[test]
    fn sockjs_url_upgrades_scheme() {
        assert_eq!(
            sockjs_url("http://octo.local", "123", "abcd1234"),
            "ws://octo.local/sockjs/123/abcd1234/websocket"
        );
        assert_eq!(
            sockjs_url("https://octo.local", "999", "zzzz0000"),
            "wss://octo.local/sockjs/999/zzzz0000/websocket"
        );
    }

    #[test]
    fn session_ids_have_expected_shape() {
        let server = random_server_id();
        assert_eq!(server.len(), 3);
        assert!(server.parse::<u32>().is_ok());

        let session = random_session_id();
        assert_eq!(session.len(), 8);
        assert!(session.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn connected_handshake_flips_state_and_bumps_updates() {
        let bus = crate::events::EventBus::new();
        let client = OctoPrintClient::new("octo.local".into(), "k".into(), bus, "p1".into());
        let inner = Arc::clone(&client.inner);

        let handled = inner
            .dispatch_message(&serde_json::json!({ "connected": { "version": "1.9.0" } }))
            .await;
        assert!(handled);
        assert!(inner.connected.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn current_message_updates_cached_status() {
        let bus = crate::events::EventBus::new();
        let client = OctoPrintClient::new("octo.local".into(), "k".into(), bus, "p1".into());
        let inner = Arc::clone(&client.inner);

        inner
            .dispatch_message(&serde_json::json!({ "connected": {} }))
            .await;
        inner
            .dispatch_message(&serde_json::json!({
                "current": {
                    "state": { "text": "Printing", "flags": { "printing": true } },
                    "progress": { "completion": 10.0 }
                }
            }))
            .await;

        let status = client.status().await.unwrap();
        assert_eq!(status.state, status::PrinterState::Printing);
        assert_eq!(status.percent_complete, Some(10.0));
    }

    #[tokio::test]
    async fn octoprint_events_are_forwarded_to_the_bus() {
        let bus = crate::events::EventBus::new();
        let mut sub = bus.subscribe();
        let client = OctoPrintClient::new("octo.local".into(), "k".into(), Arc::clone(&bus), "p1".into());

        client
            .inner
            .dispatch_message(&serde_json::json!({
                "event": { "type": "PrintDone", "payload": { "name": "part.gcode" } }
            }))
            .await;

        let event = sub.recv().await.unwrap();
        assert_eq!(event.event_type, EventType::JobCompleted);
        assert_eq!(event.payload["printer_id"], "p1");
    }
}
