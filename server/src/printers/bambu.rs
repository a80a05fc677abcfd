//! MQTT client for Bambu printers.
//!
//! The printer runs an MQTT broker on port 8883 (TLS, self-signed).
//! Status arrives as JSON reports on `device/<serial>/report`; commands
//! go to `device/<serial>/request`. Reports are frequently partial, so
//! incoming `print` objects are merged into a cached document before
//! extraction.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use serde_json::Value;
use tokio::sync::{oneshot, watch, Mutex, RwLock};

use super::bambu_ftp::BambuFtp;
use super::status::{self, PrinterStatus};
use super::tls::insecure_client_config;
use super::{PrinterKind, ProtocolClient, RemoteFile};
use crate::error::{Result, ServiceError};

const MQTT_PORT: u16 = 8883;
const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);
const KEEP_ALIVE: Duration = Duration::from_secs(60);

pub struct BambuClient {
    inner: Arc<Inner>,
}

struct Inner {
    printer_id: String,
    host: String,
    serial: String,
    access_code: String,
    reconnect_delay: Duration,
    ftp: Arc<BambuFtp>,

    /// Merged report document; reports are partial deltas.
    report: RwLock<Value>,
    client: Mutex<Option<AsyncClient>>,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    connected: AtomicBool,
    sequence: AtomicU64,
    updates_tx: watch::Sender<u64>,
    last_message: RwLock<Option<Instant>>,
}

impl BambuClient {
    pub fn new(
        printer_id: String,
        host: String,
        serial: String,
        access_code: String,
        reconnect_delay: Duration,
    ) -> Self {
        let (updates_tx, _) = watch::channel(0);
        let ftp = BambuFtp::new(host.clone(), access_code.clone());
        Self {
            inner: Arc::new(Inner {
                printer_id,
                host,
                serial,
                access_code,
                reconnect_delay,
                ftp,
                report: RwLock::new(Value::Null),
                client: Mutex::new(None),
                stop_tx: Mutex::new(None),
                connected: AtomicBool::new(false),
                sequence: AtomicU64::new(1),
                updates_tx,
                last_message: RwLock::new(None),
            }),
        }
    }

    pub fn ftp(&self) -> Arc<BambuFtp> {
        Arc::clone(&self.inner.ftp)
    }
}

impl Inner {
    fn next_sequence(&self) -> String {
        self.sequence.fetch_add(1, Ordering::Relaxed).to_string()
    }

    async fn publish_request(&self, payload: Value) -> Result<()> {
        let client = self.client.lock().await.clone().ok_or_else(|| {
            ServiceError::TransientNetwork(format!("printer {} not connected", self.printer_id))
        })?;
        client
            .publish(
                format!("device/{}/request", self.serial),
                QoS::AtMostOnce,
                false,
                payload.to_string().into_bytes(),
            )
            .await
            .map_err(|e| ServiceError::TransientNetwork(format!("MQTT publish: {e}")))
    }

    async fn print_command(&self, command: &str) -> Result<()> {
        self.publish_request(serde_json::json!({
            "print": { "command": command, "sequence_id": self.next_sequence() }
        }))
        .await
    }

    /// Ask the printer for a full state dump.
    async fn request_pushall(&self) -> Result<()> {
        self.publish_request(serde_json::json!({
            "pushing": { "sequence_id": "0", "command": "pushall" }
        }))
        .await
    }

    async fn handle_report(self: &Arc<Self>, payload: &[u8]) {
        let parsed: Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                // Malformed payloads are logged and skipped; the driver
                // keeps running.
                tracing::warn!(printer_id = %self.printer_id, error = %e, "malformed MQTT report");
                return;
            }
        };

        *self.last_message.write().await = Some(Instant::now());

        if parsed.get("print").is_some() {
            {
                let mut report = self.report.write().await;
                if report.is_null() {
                    *report = serde_json::json!({});
                }
                merge_json(&mut report, &parsed);
            }
            self.updates_tx.send_modify(|n| *n += 1);
        }
    }

    async fn run_event_loop(
        self: Arc<Self>,
        client: AsyncClient,
        mut event_loop: rumqttc::EventLoop,
        mut stop_rx: watch::Receiver<bool>,
        mut first_connect: Option<oneshot::Sender<Result<()>>>,
    ) {
        let report_topic = format!("device/{}/report", self.serial);
        loop {
            let event = tokio::select! {
                event = event_loop.poll() => event,
                _ = stop_rx.changed() => {
                    tracing::debug!(printer_id = %self.printer_id, "MQTT loop stopping");
                    return;
                }
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    tracing::info!(printer_id = %self.printer_id, host = %self.host, "MQTT connected");
                    self.connected.store(true, Ordering::SeqCst);
                    if let Err(e) = client.subscribe(&report_topic, QoS::AtMostOnce).await {
                        tracing::warn!(printer_id = %self.printer_id, error = %e, "subscribe failed");
                    }
                    if let Err(e) = self.request_pushall().await {
                        tracing::warn!(printer_id = %self.printer_id, error = %e, "pushall request failed");
                    }
                    if let Some(tx) = first_connect.take() {
                        let _ = tx.send(Ok(()));
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if publish.topic == report_topic {
                        self.handle_report(&publish.payload).await;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    let auth_failure = matches!(
                        e,
                        rumqttc::ConnectionError::ConnectionRefused(
                            rumqttc::ConnectReturnCode::BadUserNamePassword
                                | rumqttc::ConnectReturnCode::NotAuthorized
                        )
                    );
                    self.connected.store(false, Ordering::SeqCst);
                    self.updates_tx.send_modify(|n| *n += 1);

                    if auth_failure {
                        tracing::error!(printer_id = %self.printer_id, "MQTT authentication rejected");
                        if let Some(tx) = first_connect.take() {
                            let _ = tx.send(Err(ServiceError::Auth(
                                "MQTT credentials rejected".into(),
                            )));
                        }
                        return;
                    }

                    tracing::warn!(printer_id = %self.printer_id, error = %e, "MQTT connection error, reconnecting");
                    if let Some(tx) = first_connect.take() {
                        let _ = tx.send(Err(ServiceError::TransientNetwork(e.to_string())));
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                        _ = stop_rx.changed() => return,
                    }
                }
            }
        }
    }
}

/// Deep-merge `patch` into `target`: objects merge key-by-key, anything
/// else replaces.
pub fn merge_json(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                merge_json(target_map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

#[async_trait::async_trait]
impl ProtocolClient for BambuClient {
    fn kind(&self) -> PrinterKind {
        PrinterKind::Bambu
    }

    fn is_push(&self) -> bool {
        true
    }

    async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        let client_id = format!("printernizer_{}_{}", inner.printer_id, uuid::Uuid::new_v4());
        let mut options = MqttOptions::new(client_id, &inner.host, MQTT_PORT);
        options
            .set_credentials("bblp", &inner.access_code)
            .set_keep_alive(KEEP_ALIVE);
        options.set_transport(Transport::Tls(TlsConfiguration::Rustls(Arc::new(
            insecure_client_config(),
        ))));

        let (client, event_loop) = AsyncClient::new(options, 10);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (connected_tx, connected_rx) = oneshot::channel();

        *inner.client.lock().await = Some(client.clone());
        *inner.stop_tx.lock().await = Some(stop_tx);

        tokio::spawn(Arc::clone(inner).run_event_loop(
            client,
            event_loop,
            stop_rx,
            Some(connected_tx),
        ));

        match tokio::time::timeout(MQTT_CONNECT_TIMEOUT, connected_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ServiceError::TransientNetwork(
                "MQTT connection task exited".into(),
            )),
            Err(_) => Err(ServiceError::TransientNetwork(format!(
                "MQTT connect timeout to {}",
                inner.host
            ))),
        }
    }

    async fn disconnect(&self) {
        let inner = &self.inner;
        inner.connected.store(false, Ordering::SeqCst);
        if let Some(stop) = inner.stop_tx.lock().await.take() {
            let _ = stop.send(true);
        }
        if let Some(client) = inner.client.lock().await.take() {
            let _ = client.disconnect().await;
        }
    }

    async fn status(&self) -> Result<PrinterStatus> {
        let inner = &self.inner;
        if !inner.connected.load(Ordering::SeqCst) {
            return Ok(PrinterStatus::offline());
        }
        let report = inner.report.read().await;
        if report.is_null() {
            return Ok(PrinterStatus::with_state(status::PrinterState::Unknown));
        }
        Ok(status::extract_bambu(&report))
    }

    async fn pause(&self) -> Result<()> {
        self.inner.print_command("pause").await
    }

    async fn resume(&self) -> Result<()> {
        self.inner.print_command("resume").await
    }

    async fn stop_print(&self) -> Result<()> {
        self.inner.print_command("stop").await
    }

    async fn list_files(&self) -> Result<Vec<RemoteFile>> {
        Ok(self.inner.ftp.list_known_dirs().await)
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

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn partial_reports_merge_into_cached_document() {
        let mut cached = json!({
            "print": {
                "gcode_state": "RUNNING",
                "mc_percent": 10,
                "bed_temper": 60.0
            }
        });
        merge_json(&mut cached, &json!({ "print": { "mc_percent": 11 } }));

        assert_eq!(cached["print"]["mc_percent"], 11);
        assert_eq!(cached["print"]["gcode_state"], "RUNNING");
        assert_eq!(cached["print"]["bed_temper"], 60.0);
    }

    #[test]
    fn merge_replaces_non_object_values() {
        let mut cached = json!({ "print": { "ams": [1, 2, 3] } });
        merge_json(&mut cached, &json!({ "print": { "ams": [4] } }));
        assert_eq!(cached["print"]["ams"], json!([4]));
    }

    #[tokio::test]
    async fn status_is_offline_until_connected() {
        let client = BambuClient::new(
            "p1".into(),
            "192.0.2.1".into(),
            "SER".into(),
            "code".into(),
            Duration::from_secs(5),
        );
        let status = client.status().await.unwrap();
        assert_eq!(status.state, status::PrinterState::Offline);
    }
}
