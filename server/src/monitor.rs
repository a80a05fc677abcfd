//! Monitoring scheduler.
//!
//! Each printer gets its own task: pull drivers are polled on an
//! interval with jittered exponential backoff after failures; push
//! drivers get a liveness probe instead of a poll. A slow or failing
//! printer never delays the others.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::download::jitter;
use crate::printers::{MonitoringState, PrinterDriver, PrinterManager};

/// Push connections quiet for longer than this count as a failed cycle.
fn probe_threshold(base: Duration) -> Duration {
    base * 2
}

/// Next poll delay after `failures` consecutive failures: exponential
/// backoff capped at `max`, with ±10% jitter that never exceeds the cap.
pub fn backoff_interval(base: Duration, max: Duration, failures: u32) -> Duration {
    if failures == 0 {
        return jitter(base, 0.1).min(max);
    }
    let capped = base
        .saturating_mul(2u32.saturating_pow(failures.min(16)))
        .min(max);
    jitter(capped, 0.1).min(max)
}

pub struct MonitoringScheduler {
    manager: Arc<PrinterManager>,
    config: Config,
    started_at: Instant,
    tasks: Mutex<HashMap<String, (watch::Sender<bool>, JoinHandle<()>)>>,
}

impl MonitoringScheduler {
    pub fn new(manager: Arc<PrinterManager>, config: Config) -> Arc<Self> {
        Arc::new(Self {
            manager,
            config,
            started_at: Instant::now(),
            tasks: Mutex::new(HashMap::new()),
        })
    }

    /// Start a monitoring task for every registered driver.
    pub async fn start(self: &Arc<Self>) {
        for driver in self.manager.all().await {
            self.watch_printer(driver).await;
        }
    }

    /// Begin monitoring one printer. Replaces any existing task for the
    /// same id so there is never more than one.
    pub async fn watch_printer(self: &Arc<Self>, driver: Arc<PrinterDriver>) {
        let (stop_tx, stop_rx) = watch::channel(false);
        let scheduler = Arc::clone(self);
        let id = driver.id.clone();
        let task = tokio::spawn(async move {
            scheduler.run_printer_loop(driver, stop_rx).await;
        });

        if let Some((old_stop, old_task)) =
            self.tasks.lock().await.insert(id, (stop_tx, task))
        {
            let _ = old_stop.send(true);
            old_task.abort();
        }
    }

    pub async fn unwatch_printer(&self, printer_id: &str) {
        if let Some((stop, task)) = self.tasks.lock().await.remove(printer_id) {
            let _ = stop.send(true);
            task.abort();
        }
    }

    /// Stop all monitoring tasks. No new polls start after this returns.
    pub async fn shutdown(&self) {
        let mut tasks = self.tasks.lock().await;
        for (_, (stop, task)) in tasks.drain() {
            let _ = stop.send(true);
            task.abort();
        }
    }

    async fn run_printer_loop(
        self: Arc<Self>,
        driver: Arc<PrinterDriver>,
        mut stop_rx: watch::Receiver<bool>,
    ) {
        // Let network interfaces settle after process start before
        // polling aggressively.
        let elapsed = self.started_at.elapsed();
        if elapsed < self.config.monitoring_discovery_delay {
            let wait = self.config.monitoring_discovery_delay - elapsed;
            tracing::debug!(printer_id = %driver.id, wait_s = wait.as_secs(), "startup discovery delay");
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = stop_rx.changed() => return,
            }
        }

        let base = self.config.monitoring_interval;
        let max = self.config.monitoring_backoff_max;
        let mut failures = 0u32;

        loop {
            if *stop_rx.borrow() {
                return;
            }

            let state = driver.monitoring_state().await;
            if state == MonitoringState::Suspended {
                // Re-enable is an operator action; just idle until then.
                tokio::select! {
                    _ = tokio::time::sleep(base) => continue,
                    _ = stop_rx.changed() => return,
                }
            }

            let ok = if driver.is_push() {
                self.probe_push_driver(&driver, base).await
            } else {
                driver.run_status_cycle().await
            };

            failures = if ok { 0 } else { failures.saturating_add(1) };
            let delay = backoff_interval(base, max, failures);
            tracing::trace!(
                printer_id = %driver.id,
                failures,
                delay_s = delay.as_secs_f64(),
                "next monitoring cycle scheduled"
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop_rx.changed() => return,
            }
        }
    }

    /// Liveness probe for push drivers: the scheduler never polls them,
    /// but a silent connection still counts as a failed cycle.
    async fn probe_push_driver(&self, driver: &Arc<PrinterDriver>, base: Duration) -> bool {
        match driver.last_message_age() {
            Some(age) if age <= probe_threshold(base) => true,
            Some(age) => {
                tracing::debug!(
                    printer_id = %driver.id,
                    silent_s = age.as_secs(),
                    "push connection silent past probe threshold"
                );
                driver.record_probe_failure().await;
                false
            }
            None => {
                // Never heard from the printer since connect.
                if driver.monitoring_state().await == MonitoringState::Connected {
                    driver.record_probe_failure().await;
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_after_five_failures_lands_in_spec_window() {
        let base = Duration::from_secs(30);
        let max = Duration::from_secs(300);
        for _ in 0..200 {
            let delay = backoff_interval(base, max, 5);
            assert!(delay >= Duration::from_secs(270), "delay {delay:?} below window");
            assert!(delay <= Duration::from_secs(300), "delay {delay:?} above cap");
        }
    }

    #[test]
    fn backoff_recovers_to_base_interval() {
        let base = Duration::from_secs(30);
        let max = Duration::from_secs(300);
        for _ in 0..100 {
            let delay = backoff_interval(base, max, 0);
            assert!(delay >= Duration::from_secs(27) && delay <= Duration::from_secs(33));
        }
    }

    #[test]
    fn backoff_never_exceeds_cap_for_large_failure_counts() {
        let base = Duration::from_secs(30);
        let max = Duration::from_secs(300);
        assert!(backoff_interval(base, max, 30) <= max);
    }

    #[test]
    fn probe_threshold_is_twice_the_poll_interval() {
        assert_eq!(probe_threshold(Duration::from_secs(30)), Duration::from_secs(60));
    }
}
