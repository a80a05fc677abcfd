//! Home-automation MQTT discovery publisher.
//!
//! Publishes retained entity config documents under a discovery prefix
//! (Home Assistant convention) so a hub auto-creates sensors for each
//! printer, then streams state updates to a parallel topic tree on
//! every driver status event. Removing a printer clears its retained
//! configs.

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use serde_json::json;
use tokio::sync::watch;

use crate::config::Config;
use crate::db::printers::PrinterRow;
use crate::error::Result;
use crate::events::{EventBus, EventType};
use crate::printers::status::PrinterState;

/// Root of the state-topic tree (not the discovery prefix).
const STATE_ROOT: &str = "printernizer";

const SENSORS: &[(&str, &str, Option<&str>, Option<&str>)] = &[
    // (field, display suffix, device_class, unit)
    ("status", "Status", None, None),
    ("progress", "Progress", None, Some("%")),
    ("bed_temp", "Bed Temperature", Some("temperature"), Some("°C")),
    ("nozzle_temp", "Nozzle Temperature", Some("temperature"), Some("°C")),
];

const BINARY_SENSORS: &[(&str, &str, &str)] = &[
    ("printing", "Printing", "running"),
    ("online", "Online", "connectivity"),
];

pub struct DiscoveryPublisher {
    client: AsyncClient,
    prefix: String,
    stop_tx: watch::Sender<bool>,
    tasks: tokio::sync::Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl DiscoveryPublisher {
    /// Connect to the configured broker and start mirroring bus events
    /// to the state-topic tree.
    pub async fn start(config: &Config, bus: Arc<EventBus>) -> Result<Arc<Self>> {
        let client_id = format!("printernizer_discovery_{}", uuid::Uuid::new_v4());
        let mut options = MqttOptions::new(client_id, &config.mqtt_host, config.mqtt_port);
        options.set_keep_alive(Duration::from_secs(60));
        if let (Some(user), Some(password)) = (&config.mqtt_username, &config.mqtt_password) {
            options.set_credentials(user, password);
        }

        let (client, mut event_loop) = AsyncClient::new(options, 32);
        let (stop_tx, mut stop_rx) = watch::channel(false);

        // Drive the connection; rumqttc makes no progress unless polled.
        let host = config.mqtt_host.clone();
        let mut loop_stop = stop_rx.clone();
        let loop_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = event_loop.poll() => match event {
                        Ok(Event::Incoming(Packet::ConnAck(_))) => {
                            tracing::info!(host = %host, "connected to MQTT broker");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::warn!(error = %e, "MQTT broker connection error");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    },
                    _ = loop_stop.changed() => return,
                }
            }
        });

        let publisher = Arc::new(Self {
            client,
            prefix: config.mqtt_prefix.clone(),
            stop_tx,
            tasks: tokio::sync::Mutex::new(Vec::new()),
        });

        // Mirror driver events onto the state-topic tree.
        let mirror = Arc::clone(&publisher);
        let mut sub = bus.subscribe_filtered(|e| {
            matches!(
                e.event_type,
                EventType::StatusUpdated | EventType::PrinterOnline | EventType::PrinterOffline
            )
        });
        let state_task = tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = sub.recv() => event,
                    _ = stop_rx.changed() => return,
                };
                let Some(event) = event else { return };
                mirror.handle_bus_event(&event).await;
            }
        });

        publisher.tasks.lock().await.extend([loop_task, state_task]);
        Ok(publisher)
    }

    async fn handle_bus_event(&self, event: &crate::events::Event) {
        let Some(printer_id) = event.payload.get("printer_id").and_then(|v| v.as_str()) else {
            return;
        };
        match event.event_type {
            EventType::StatusUpdated => {
                if let Some(status) = event.payload.get("status") {
                    self.publish_state(printer_id, status).await;
                }
            }
            EventType::PrinterOnline => {
                self.publish_availability(printer_id, true).await;
            }
            EventType::PrinterOffline => {
                self.publish_availability(printer_id, false).await;
            }
            _ => {}
        }
    }

    async fn publish_raw(&self, topic: String, payload: String, retain: bool) {
        if let Err(e) = self
            .client
            .publish(&topic, QoS::AtLeastOnce, retain, payload.into_bytes())
            .await
        {
            tracing::warn!(topic, error = %e, "discovery publish failed");
        }
    }

    /// Publish one retained config document per derived entity for a
    /// printer.
    pub async fn publish_printer(&self, printer: &PrinterRow) {
        let device = json!({
            "identifiers": [format!("printernizer_{}", printer.id)],
            "name": printer.name,
            "manufacturer": manufacturer_for(&printer.kind),
            "model": "3D Printer",
            "sw_version": format!("printernizer {}", env!("CARGO_PKG_VERSION")),
        });
        let availability_topic = format!("{STATE_ROOT}/{}/available", printer.id);

        for (field, suffix, device_class, unit) in SENSORS {
            let unique_id = format!("printernizer_{}_{field}", printer.id);
            let mut config = json!({
                "unique_id": unique_id,
                "object_id": unique_id,
                "name": format!("{} {suffix}", printer.name),
                "state_topic": format!("{STATE_ROOT}/{}/{field}", printer.id),
                "availability_topic": availability_topic,
                "payload_available": "online",
                "payload_not_available": "offline",
                "device": device,
            });
            if let Some(device_class) = device_class {
                config["device_class"] = json!(device_class);
            }
            if let Some(unit) = unit {
                config["unit_of_measurement"] = json!(unit);
            }
            self.publish_raw(self.config_topic("sensor", &printer.id, field), config.to_string(), true)
                .await;
        }

        for (field, suffix, device_class) in BINARY_SENSORS {
            let unique_id = format!("printernizer_{}_{field}", printer.id);
            let config = json!({
                "unique_id": unique_id,
                "object_id": unique_id,
                "name": format!("{} {suffix}", printer.name),
                "state_topic": format!("{STATE_ROOT}/{}/{field}", printer.id),
                "availability_topic": availability_topic,
                "payload_available": "online",
                "payload_not_available": "offline",
                "payload_on": "ON",
                "payload_off": "OFF",
                "device_class": device_class,
                "device": device,
            });
            self.publish_raw(
                self.config_topic("binary_sensor", &printer.id, field),
                config.to_string(),
                true,
            )
            .await;
        }

        tracing::info!(printer_id = %printer.id, "published discovery config");
    }

    /// Clear the retained config documents for a removed printer.
    pub async fn remove_printer(&self, printer_id: &str) {
        for (field, _, _, _) in SENSORS {
            self.publish_raw(self.config_topic("sensor", printer_id, field), String::new(), true)
                .await;
        }
        for (field, _, _) in BINARY_SENSORS {
            self.publish_raw(
                self.config_topic("binary_sensor", printer_id, field),
                String::new(),
                true,
            )
            .await;
        }
        self.publish_availability(printer_id, false).await;
        tracing::info!(printer_id, "cleared discovery config");
    }

    fn config_topic(&self, component: &str, printer_id: &str, field: &str) -> String {
        format!(
            "{}/{component}/printernizer_{printer_id}_{field}/config",
            self.prefix
        )
    }

    /// Mirror one normalized status onto the state-topic tree.
    async fn publish_state(&self, printer_id: &str, status: &serde_json::Value) {
        let state = status.get("state").and_then(|v| v.as_str()).unwrap_or("unknown");
        self.publish_raw(
            format!("{STATE_ROOT}/{printer_id}/status"),
            state.to_string(),
            false,
        )
        .await;

        if let Some(progress) = status.get("percent_complete").and_then(|v| v.as_f64()) {
            self.publish_raw(
                format!("{STATE_ROOT}/{printer_id}/progress"),
                format!("{progress:.0}"),
                false,
            )
            .await;
        }
        if let Some(bed) = status.get("bed_current").and_then(|v| v.as_f64()) {
            self.publish_raw(
                format!("{STATE_ROOT}/{printer_id}/bed_temp"),
                format!("{bed:.1}"),
                false,
            )
            .await;
        }
        if let Some(nozzle) = status.get("nozzle_current").and_then(|v| v.as_f64()) {
            self.publish_raw(
                format!("{STATE_ROOT}/{printer_id}/nozzle_temp"),
                format!("{nozzle:.1}"),
                false,
            )
            .await;
        }

        let printing = state == PrinterState::Printing.as_str();
        self.publish_raw(
            format!("{STATE_ROOT}/{printer_id}/printing"),
            if printing { "ON" } else { "OFF" }.to_string(),
            false,
        )
        .await;

        let online = state != PrinterState::Offline.as_str();
        self.publish_raw(
            format!("{STATE_ROOT}/{printer_id}/online"),
            if online { "ON" } else { "OFF" }.to_string(),
            false,
        )
        .await;
    }

    async fn publish_availability(&self, printer_id: &str, online: bool) {
        self.publish_raw(
            format!("{STATE_ROOT}/{printer_id}/available"),
            if online { "online" } else { "offline" }.to_string(),
            true,
        )
        .await;
    }

    pub async fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        let _ = self.client.disconnect().await;
    }
}

fn manufacturer_for(kind: &str) -> &'static str {
    match kind {
        "bambu" => "Bambu Lab",
        "prusa" => "Prusa Research",
        "octoprint" => "OctoPrint",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manufacturer_mapping() {
        assert_eq!(manufacturer_for("bambu"), "Bambu Lab");
        assert_eq!(manufacturer_for("prusa"), "Prusa Research");
        assert_eq!(manufacturer_for("weird"), "Unknown");
    }
}
