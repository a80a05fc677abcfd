pub mod bambu;
pub mod bambu_ftp;
pub mod octoprint;
pub mod prusa;
pub mod status;
pub mod tls;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::{watch, Mutex, RwLock};

use crate::adapters::camera::SnapshotGateway;
use crate::config::Config;
use crate::db::{self, printers::PrinterRow};
use crate::error::{Result, ServiceError};
use crate::events::{EventBus, EventType};
use status::{PrinterState, PrinterStatus};

/// Supported printer families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrinterKind {
    Bambu,
    Prusa,
    Octoprint,
}

impl PrinterKind {
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "bambu" => Ok(PrinterKind::Bambu),
            "prusa" => Ok(PrinterKind::Prusa),
            "octoprint" => Ok(PrinterKind::Octoprint),
            other => Err(ServiceError::Config(format!("unknown printer kind: {other}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PrinterKind::Bambu => "bambu",
            PrinterKind::Prusa => "prusa",
            PrinterKind::Octoprint => "octoprint",
        }
    }
}

/// Connection lifecycle of one driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitoringState {
    Disconnected,
    Connecting,
    Connected,
    Degraded,
    Failed,
    Suspended,
}

impl MonitoringState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MonitoringState::Disconnected => "disconnected",
            MonitoringState::Connecting => "connecting",
            MonitoringState::Connected => "connected",
            MonitoringState::Degraded => "degraded",
            MonitoringState::Failed => "failed",
            MonitoringState::Suspended => "suspended",
        }
    }
}

/// A file visible on a printer's own storage.
#[derive(Debug, Clone, Serialize)]
pub struct RemoteFile {
    pub name: String,
    pub size: u64,
    pub path: String,
    pub modified: Option<DateTime<Utc>>,
}

/// Capability surface every protocol client provides. Push clients keep
/// a cached status updated from unsolicited messages; pull clients fetch
/// on demand.
#[async_trait::async_trait]
pub trait ProtocolClient: Send + Sync {
    fn kind(&self) -> PrinterKind;

    /// Push clients receive unsolicited updates; pull clients are polled.
    fn is_push(&self) -> bool;

    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self);

    /// One full status observation. An `Err` here means the cycle failed
    /// (network/protocol); it never means a single field was missing.
    async fn status(&self) -> Result<PrinterStatus>;

    async fn pause(&self) -> Result<()>;
    async fn resume(&self) -> Result<()>;
    async fn stop_print(&self) -> Result<()>;

    /// Built-in camera snapshot, where the vendor exposes one.
    async fn take_snapshot(&self) -> Result<(Vec<u8>, String)> {
        Err(ServiceError::NotFound("no built-in camera".into()))
    }

    async fn list_files(&self) -> Result<Vec<RemoteFile>> {
        Ok(Vec::new())
    }

    /// Counter bumped on every push update; pull clients never bump it.
    fn updates(&self) -> watch::Receiver<u64>;

    /// Time since the last message from the printer, for push liveness.
    fn last_message_age(&self) -> Option<Duration>;
}

/// Consecutive failures before a driver degrades.
const DEGRADE_AFTER: u32 = 3;

struct DriverInner {
    monitoring_state: MonitoringState,
    consecutive_failures: u32,
    last_status: Option<PrinterStatus>,
    current_job_id: Option<String>,
}

/// Per-printer state machine. Owns exactly one protocol client; status
/// normalization happens here, once, at the driver boundary.
pub struct PrinterDriver {
    pub id: String,
    pub name: String,
    pub kind: PrinterKind,
    pub webcam_url: Option<String>,
    client: Arc<dyn ProtocolClient>,
    bus: Arc<EventBus>,
    pool: SqlitePool,
    inner: Mutex<DriverInner>,
    suspend_after: u32,
    push_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl PrinterDriver {
    pub fn new(
        row: &PrinterRow,
        client: Arc<dyn ProtocolClient>,
        bus: Arc<EventBus>,
        pool: SqlitePool,
        suspend_after: u32,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: row.id.clone(),
            name: row.name.clone(),
            kind: client.kind(),
            webcam_url: row.webcam_url.clone(),
            client,
            bus,
            pool,
            inner: Mutex::new(DriverInner {
                monitoring_state: MonitoringState::Disconnected,
                consecutive_failures: 0,
                last_status: None,
                current_job_id: None,
            }),
            suspend_after,
            push_task: Mutex::new(None),
        })
    }

    pub fn is_push(&self) -> bool {
        self.client.is_push()
    }

    pub fn client(&self) -> &Arc<dyn ProtocolClient> {
        &self.client
    }

    pub async fn monitoring_state(&self) -> MonitoringState {
        self.inner.lock().await.monitoring_state
    }

    pub async fn last_status(&self) -> Option<PrinterStatus> {
        self.inner.lock().await.last_status.clone()
    }

    /// Time since the underlying push connection last heard from the
    /// printer. `None` for pull drivers.
    pub fn last_message_age(&self) -> Option<Duration> {
        self.client.last_message_age()
    }

    /// Begin connecting. Returns immediately; the connection work runs
    /// in the background and the state machine advances as it goes.
    pub async fn connect(self: &Arc<Self>) {
        self.transition(MonitoringState::Connecting).await;

        let driver = Arc::clone(self);
        tokio::spawn(async move {
            match driver.client.connect().await {
                Ok(()) => {
                    driver.transition(MonitoringState::Connected).await;
                    driver.spawn_push_observer().await;
                }
                Err(e) => {
                    tracing::warn!(printer_id = %driver.id, error = %e, "connect failed");
                    driver.transition(MonitoringState::Failed).await;
                }
            }
        });
    }

    /// Stop the driver: cancel the push observer and drop the protocol
    /// connection.
    pub async fn stop(&self) {
        if let Some(task) = self.push_task.lock().await.take() {
            task.abort();
        }
        self.client.disconnect().await;
        self.transition(MonitoringState::Disconnected).await;
    }

    /// For push drivers, watch the client's update counter and run a
    /// status cycle on every delta.
    async fn spawn_push_observer(self: &Arc<Self>) {
        if !self.client.is_push() {
            return;
        }
        let driver = Arc::clone(self);
        let mut updates = self.client.updates();
        let task = tokio::spawn(async move {
            while updates.changed().await.is_ok() {
                driver.run_status_cycle().await;
            }
        });
        *self.push_task.lock().await = Some(task);
    }

    /// One observe-normalize-publish cycle. Returns whether the cycle
    /// succeeded, for the scheduler's backoff accounting.
    pub async fn run_status_cycle(self: &Arc<Self>) -> bool {
        match self.client.status().await {
            Ok(status) => {
                self.record_success().await;
                self.apply_status(status).await;
                true
            }
            Err(e) => {
                tracing::debug!(printer_id = %self.id, error = %e, "status cycle failed");
                self.record_failure(&e).await;
                self.apply_status(PrinterStatus::offline()).await;
                false
            }
        }
    }

    /// Force a failed cycle into the backoff accounting without touching
    /// the observed status. Used by the scheduler's liveness probe.
    pub async fn record_probe_failure(self: &Arc<Self>) {
        self.record_failure(&ServiceError::TransientNetwork(
            "liveness probe expired".into(),
        ))
        .await;
    }

    async fn apply_status(self: &Arc<Self>, mut status: PrinterStatus) {
        // Resolve the running job's filename against the library.
        if let Some(filename) = status.current_job_filename.clone() {
            if let Ok(Some(entry)) = db::library::get_by_filename(&self.pool, &filename).await {
                status.current_job_file_id = Some(entry.checksum.clone());
                status.current_job_has_thumbnail = entry.thumbnail_width.is_some();
            }
        }

        let previous = {
            let mut inner = self.inner.lock().await;
            inner.last_status.replace(status.clone())
        };
        let prev_state = previous.as_ref().map(|s| s.state);

        if prev_state != Some(status.state) {
            self.publish_state_transition(prev_state, &status).await;
        }

        if let Some(job_id) = self.inner.lock().await.current_job_id.clone() {
            if let Some(pct) = status.percent_complete {
                let _ = db::jobs::update_progress(&self.pool, &job_id, pct).await;
            }
        }

        self.bus.publish(
            EventType::StatusUpdated,
            serde_json::json!({
                "printer_id": self.id,
                "printer_name": self.name,
                "status": status,
            }),
        );
    }

    async fn publish_state_transition(
        self: &Arc<Self>,
        prev: Option<PrinterState>,
        status: &PrinterStatus,
    ) {
        let state = status.state;
        self.bus.publish(
            EventType::PrinterStateChanged,
            serde_json::json!({
                "printer_id": self.id,
                "from": prev.map(|s| s.as_str()),
                "to": state.as_str(),
            }),
        );

        // Connectivity transitions: at most one event per edge.
        if prev == Some(PrinterState::Offline) && state != PrinterState::Offline {
            self.publish_simple(EventType::PrinterOnline).await;
        }
        if prev.is_some() && prev != Some(PrinterState::Offline) && state == PrinterState::Offline {
            self.publish_simple(EventType::PrinterOffline).await;
        }

        let was_active = matches!(prev, Some(PrinterState::Printing) | Some(PrinterState::Paused));
        match state {
            PrinterState::Printing if !was_active => {
                if let Ok(job) = db::jobs::start(
                    &self.pool,
                    &self.id,
                    status.current_job_filename.as_deref(),
                )
                .await
                {
                    self.inner.lock().await.current_job_id = Some(job.id);
                }
                self.bus.publish(
                    EventType::PrintStarted,
                    serde_json::json!({
                        "printer_id": self.id,
                        "filename": status.current_job_filename,
                    }),
                );
            }
            PrinterState::Idle | PrinterState::Unknown if was_active => {
                let completed = status.percent_complete.map(|p| p >= 99.0).unwrap_or(false)
                    || status.remaining_minutes == Some(0);
                self.finish_job(if completed { "completed" } else { "stopped" })
                    .await;
                if completed {
                    self.bus.publish(
                        EventType::JobCompleted,
                        serde_json::json!({
                            "printer_id": self.id,
                            "filename": status.current_job_filename,
                        }),
                    );
                }
            }
            PrinterState::Error if was_active => {
                self.finish_job("failed").await;
                self.bus.publish(
                    EventType::JobFailed,
                    serde_json::json!({
                        "printer_id": self.id,
                        "filename": status.current_job_filename,
                    }),
                );
            }
            _ => {}
        }
    }

    async fn finish_job(&self, terminal: &str) {
        if let Some(job_id) = self.inner.lock().await.current_job_id.take() {
            let _ = db::jobs::finish(&self.pool, &job_id, terminal).await;
        }
    }

    async fn publish_simple(&self, event_type: EventType) {
        self.bus.publish(
            event_type,
            serde_json::json!({ "printer_id": self.id, "printer_name": self.name }),
        );
    }

    async fn record_success(&self) {
        let mut inner = self.inner.lock().await;
        inner.consecutive_failures = 0;
        if matches!(
            inner.monitoring_state,
            MonitoringState::Degraded | MonitoringState::Failed
        ) {
            drop(inner);
            self.transition(MonitoringState::Connected).await;
        }
    }

    async fn record_failure(&self, error: &ServiceError) {
        let new_state = {
            let mut inner = self.inner.lock().await;
            if inner.monitoring_state == MonitoringState::Suspended {
                return;
            }
            inner.consecutive_failures += 1;
            if inner.consecutive_failures >= self.suspend_after {
                Some(MonitoringState::Suspended)
            } else if inner.consecutive_failures >= DEGRADE_AFTER {
                Some(MonitoringState::Degraded)
            } else {
                None
            }
        };

        if let Some(state) = new_state {
            self.transition(state).await;
            if state == MonitoringState::Suspended {
                self.bus.publish(
                    EventType::PrinterError,
                    serde_json::json!({
                        "printer_id": self.id,
                        "error": error.to_string(),
                        "suspended": true,
                    }),
                );
            }
        }
    }

    pub async fn consecutive_failures(&self) -> u32 {
        self.inner.lock().await.consecutive_failures
    }

    /// Operator re-enable after suspension: reset counters and reconnect.
    pub async fn resume_monitoring(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().await;
            inner.consecutive_failures = 0;
            inner.monitoring_state = MonitoringState::Disconnected;
        }
        let _ = db::printers::set_monitoring_state(&self.pool, &self.id, "disconnected").await;
        self.connect().await;
    }

    async fn transition(&self, to: MonitoringState) {
        let changed = {
            let mut inner = self.inner.lock().await;
            if inner.monitoring_state == to {
                false
            } else {
                tracing::info!(
                    printer_id = %self.id,
                    from = inner.monitoring_state.as_str(),
                    to = to.as_str(),
                    "monitoring state transition"
                );
                inner.monitoring_state = to;
                true
            }
        };
        if changed {
            let _ = db::printers::set_monitoring_state(&self.pool, &self.id, to.as_str()).await;
        }
    }

    fn require_connected(&self, state: MonitoringState) -> Result<()> {
        if state == MonitoringState::Connected {
            Ok(())
        } else {
            Err(ServiceError::Config(format!(
                "printer {} is {}, command rejected",
                self.id,
                state.as_str()
            )))
        }
    }

    pub async fn pause(&self) -> Result<()> {
        self.require_connected(self.monitoring_state().await)?;
        self.client.pause().await?;
        self.publish_simple(EventType::PrintPaused).await;
        Ok(())
    }

    pub async fn resume(&self) -> Result<()> {
        self.require_connected(self.monitoring_state().await)?;
        self.client.resume().await?;
        self.publish_simple(EventType::PrintResumed).await;
        Ok(())
    }

    pub async fn stop_print(&self) -> Result<()> {
        self.require_connected(self.monitoring_state().await)?;
        self.client.stop_print().await?;
        self.publish_simple(EventType::PrintStopped).await;
        Ok(())
    }

    pub async fn list_files(&self) -> Result<Vec<RemoteFile>> {
        self.client.list_files().await
    }
}

/// Registry of live drivers, keyed by printer id.
pub struct PrinterManager {
    drivers: RwLock<HashMap<String, Arc<PrinterDriver>>>,
    bus: Arc<EventBus>,
    pool: SqlitePool,
    config: Config,
    snapshots: Arc<SnapshotGateway>,
}

impl PrinterManager {
    pub fn new(
        bus: Arc<EventBus>,
        pool: SqlitePool,
        config: Config,
        snapshots: Arc<SnapshotGateway>,
    ) -> Arc<Self> {
        Arc::new(Self {
            drivers: RwLock::new(HashMap::new()),
            bus,
            pool,
            config,
            snapshots,
        })
    }

    /// Build a protocol client for a printer row.
    fn build_client(&self, row: &PrinterRow) -> Result<Arc<dyn ProtocolClient>> {
        match PrinterKind::parse(&row.kind)? {
            PrinterKind::Bambu => {
                let access_code = row.access_code.clone().ok_or_else(|| {
                    ServiceError::Config(format!("printer {}: missing access code", row.id))
                })?;
                let serial = row.serial.clone().ok_or_else(|| {
                    ServiceError::Config(format!("printer {}: missing serial", row.id))
                })?;
                Ok(Arc::new(bambu::BambuClient::new(
                    row.id.clone(),
                    row.host.clone(),
                    serial,
                    access_code,
                    self.config.mqtt_auto_reconnect_delay,
                )))
            }
            PrinterKind::Prusa => {
                let api_key = row.api_key.clone().ok_or_else(|| {
                    ServiceError::Config(format!("printer {}: missing API key", row.id))
                })?;
                Ok(Arc::new(prusa::PrusaClient::new(row.host.clone(), api_key)?))
            }
            PrinterKind::Octoprint => {
                let api_key = row.api_key.clone().ok_or_else(|| {
                    ServiceError::Config(format!("printer {}: missing API key", row.id))
                })?;
                Ok(Arc::new(octoprint::OctoPrintClient::new(
                    row.host.clone(),
                    api_key,
                    Arc::clone(&self.bus),
                    row.id.clone(),
                )))
            }
        }
    }

    /// Register a driver for a stored printer and start connecting if
    /// the printer is enabled.
    pub async fn register(self: &Arc<Self>, row: &PrinterRow) -> Result<Arc<PrinterDriver>> {
        let client = self.build_client(row)?;
        let driver = PrinterDriver::new(
            row,
            client,
            Arc::clone(&self.bus),
            self.pool.clone(),
            self.config.monitoring_suspend_after,
        );
        self.drivers
            .write()
            .await
            .insert(row.id.clone(), Arc::clone(&driver));
        if row.enabled {
            driver.connect().await;
        }
        Ok(driver)
    }

    pub async fn get(&self, id: &str) -> Result<Arc<PrinterDriver>> {
        self.drivers
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("printer {id}")))
    }

    pub async fn all(&self) -> Vec<Arc<PrinterDriver>> {
        self.drivers.read().await.values().cloned().collect()
    }

    /// Remove and stop a driver. The caller deletes the stored row.
    pub async fn remove(&self, id: &str) -> Result<()> {
        let driver = self
            .drivers
            .write()
            .await
            .remove(id)
            .ok_or_else(|| ServiceError::NotFound(format!("printer {id}")))?;
        driver.stop().await;
        Ok(())
    }

    /// Stop all drivers, bounded per driver.
    pub async fn shutdown(&self, per_driver_grace: Duration) {
        for driver in self.all().await {
            if tokio::time::timeout(per_driver_grace, driver.stop())
                .await
                .is_err()
            {
                tracing::warn!(printer_id = %driver.id, "driver stop timed out");
            }
        }
    }

    /// Snapshot for a printer, preferring a configured external webcam
    /// over the vendor's built-in camera.
    pub async fn take_snapshot(&self, id: &str) -> Result<(Vec<u8>, String)> {
        let driver = self.get(id).await?;
        if let Some(url) = &driver.webcam_url {
            return self.snapshots.fetch(id, url).await;
        }
        driver.client().take_snapshot().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Scripted protocol client: each status cycle pops the next
    /// result; the last one repeats.
    struct FakeClient {
        script: Mutex<VecDeque<std::result::Result<PrinterStatus, String>>>,
        updates_tx: watch::Sender<u64>,
    }

    impl FakeClient {
        fn new(script: Vec<std::result::Result<PrinterStatus, String>>) -> Arc<Self> {
            let (updates_tx, _) = watch::channel(0);
            Arc::new(Self {
                script: Mutex::new(script.into()),
                updates_tx,
            })
        }
    }

    #[async_trait::async_trait]
    impl ProtocolClient for FakeClient {
        fn kind(&self) -> PrinterKind {
            PrinterKind::Prusa
        }
        fn is_push(&self) -> bool {
            false
        }
        async fn connect(&self) -> Result<()> {
            Ok(())
        }
        async fn disconnect(&self) {}
        async fn status(&self) -> Result<PrinterStatus> {
            let mut script = self.script.lock().await;
            let next = if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap()
            };
            next.map_err(ServiceError::TransientNetwork)
        }
        async fn pause(&self) -> Result<()> {
            Ok(())
        }
        async fn resume(&self) -> Result<()> {
            Ok(())
        }
        async fn stop_print(&self) -> Result<()> {
            Ok(())
        }
        fn updates(&self) -> watch::Receiver<u64> {
            self.updates_tx.subscribe()
        }
        fn last_message_age(&self) -> Option<Duration> {
            None
        }
    }

    fn printing_status(percent: f64, filename: &str) -> PrinterStatus {
        let mut status = PrinterStatus::with_state(PrinterState::Printing);
        status.percent_complete = Some(percent);
        status.current_job_filename = Some(filename.to_string());
        status
    }

    async fn driver_with_script(
        script: Vec<std::result::Result<PrinterStatus, String>>,
        suspend_after: u32,
    ) -> (Arc<PrinterDriver>, Arc<EventBus>, SqlitePool) {
        let pool = db::test_pool().await;
        let bus = EventBus::new();
        let row = db::printers::insert(
            &pool,
            "p1",
            &db::printers::PrinterInput {
                name: "MK4".into(),
                kind: "prusa".into(),
                host: "http://192.0.2.1".into(),
                access_code: None,
                serial: None,
                api_key: Some("key".into()),
                webcam_url: None,
                enabled: true,
            },
        )
        .await
        .unwrap();

        let client = FakeClient::new(script);
        let driver = PrinterDriver::new(&row, client, Arc::clone(&bus), pool.clone(), suspend_after);
        (driver, bus, pool)
    }

    async fn drain_events(sub: &mut crate::events::Subscription) -> Vec<crate::events::Event> {
        let mut events = Vec::new();
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(50), sub.recv()).await
        {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn disconnect_reconnect_emits_one_offline_and_one_online_event() {
        let idle = || Ok(PrinterStatus::with_state(PrinterState::Idle));
        let (driver, bus, _pool) = driver_with_script(
            vec![
                idle(),
                Err("refused".into()),
                Err("refused".into()),
                idle(),
            ],
            10,
        )
        .await;
        let mut sub = bus.subscribe();

        driver.run_status_cycle().await; // idle
        driver.run_status_cycle().await; // offline
        driver.run_status_cycle().await; // still offline
        driver.run_status_cycle().await; // back to idle

        let events = drain_events(&mut sub).await;
        let offline = events
            .iter()
            .filter(|e| e.event_type == EventType::PrinterOffline)
            .count();
        let online = events
            .iter()
            .filter(|e| e.event_type == EventType::PrinterOnline)
            .count();
        assert_eq!(offline, 1);
        assert_eq!(online, 1);
    }

    #[tokio::test]
    async fn consecutive_failures_degrade_then_suspend() {
        let (driver, bus, pool) =
            driver_with_script(vec![Err("down".into())], 10).await;
        let mut sub = bus.subscribe_filtered(|e| e.event_type == EventType::PrinterError);

        for _ in 0..2 {
            driver.run_status_cycle().await;
        }
        assert_ne!(driver.monitoring_state().await, MonitoringState::Degraded);

        driver.run_status_cycle().await;
        assert_eq!(driver.monitoring_state().await, MonitoringState::Degraded);

        for _ in 0..7 {
            driver.run_status_cycle().await;
        }
        assert_eq!(driver.monitoring_state().await, MonitoringState::Suspended);

        // Suspension surfaces as a printer_error event and persists.
        let events = drain_events(&mut sub).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["suspended"], true);
        let row = db::printers::get(&pool, "p1").await.unwrap();
        assert_eq!(row.monitoring_state, "suspended");
    }

    #[tokio::test]
    async fn success_resets_the_failure_counter() {
        let (driver, _bus, _pool) = driver_with_script(
            vec![
                Err("down".into()),
                Err("down".into()),
                Ok(PrinterStatus::with_state(PrinterState::Idle)),
            ],
            10,
        )
        .await;

        driver.run_status_cycle().await;
        driver.run_status_cycle().await;
        assert_eq!(driver.consecutive_failures().await, 2);
        driver.run_status_cycle().await;
        assert_eq!(driver.consecutive_failures().await, 0);
    }

    #[tokio::test]
    async fn print_lifecycle_opens_and_completes_a_job() {
        let mut done = PrinterStatus::with_state(PrinterState::Idle);
        done.percent_complete = Some(100.0);
        let (driver, bus, pool) = driver_with_script(
            vec![
                Ok(PrinterStatus::with_state(PrinterState::Idle)),
                Ok(printing_status(10.0, "cube.3mf")),
                Ok(printing_status(60.0, "cube.3mf")),
                Ok(done),
            ],
            10,
        )
        .await;
        let mut sub = bus.subscribe_filtered(|e| {
            matches!(
                e.event_type,
                EventType::PrintStarted | EventType::JobCompleted
            )
        });

        for _ in 0..4 {
            driver.run_status_cycle().await;
        }

        let events = drain_events(&mut sub).await;
        assert_eq!(events[0].event_type, EventType::PrintStarted);
        assert_eq!(events[0].payload["filename"], "cube.3mf");
        assert_eq!(events[1].event_type, EventType::JobCompleted);

        let jobs = db::jobs::list_for_printer(&pool, "p1").await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].status, "completed");
        assert_eq!(jobs[0].filename.as_deref(), Some("cube.3mf"));
        assert!(jobs[0].finished_at.is_some());
    }

    #[tokio::test]
    async fn commands_are_rejected_unless_connected() {
        let (driver, _bus, _pool) =
            driver_with_script(vec![Ok(PrinterStatus::with_state(PrinterState::Idle))], 10)
                .await;
        assert!(matches!(
            driver.pause().await,
            Err(ServiceError::Config(_))
        ));
    }
}
