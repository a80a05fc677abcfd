pub mod ftp;
pub mod http;
pub mod mqtt;

use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;

/// Apply ±`factor` jitter to a duration.
pub fn jitter(duration: Duration, factor: f64) -> Duration {
    let spread = rand::thread_rng().gen_range(-factor..=factor);
    Duration::from_secs_f64((duration.as_secs_f64() * (1.0 + spread)).max(0.0))
}

/// Options for a single `download()` call.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    pub filename: String,
    pub local_path: PathBuf,
    /// Strategy-specific remote paths/URLs to try before the defaults.
    pub candidate_remote_paths: Vec<String>,
    pub max_retries: u32,
    pub timeout: Duration,
    pub chunk_size: usize,
}

impl DownloadOptions {
    pub fn new(filename: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            filename: filename.into(),
            local_path: local_path.into(),
            candidate_remote_paths: Vec::new(),
            max_retries: 3,
            timeout: Duration::from_secs(120),
            chunk_size: 8192,
        }
    }
}

/// A successful transfer.
#[derive(Debug, Clone)]
pub struct DownloadSuccess {
    pub bytes_written: u64,
    pub remote_path_used: String,
}

/// Why one strategy attempt did not produce a file.
#[derive(Debug)]
pub enum DownloadFailure {
    /// Do not retry this strategy; move to the next one.
    Fatal(String),
    /// Retry within this strategy, with backoff.
    Retryable(String),
    /// Strategy cannot run right now but may next call.
    Unavailable,
}

impl DownloadFailure {
    fn describe(&self) -> String {
        match self {
            DownloadFailure::Fatal(m) => format!("{m} (fatal)"),
            DownloadFailure::Retryable(m) => format!("{m} (retryable)"),
            DownloadFailure::Unavailable => "unavailable".to_string(),
        }
    }
}

/// One protocol-specific way of fetching a file from a printer.
#[async_trait::async_trait]
pub trait DownloadStrategy: Send + Sync {
    /// Stable identifier, used in logs and results.
    fn name(&self) -> &'static str;

    /// Cheap availability check: credentials present, port known.
    async fn available(&self) -> bool;

    async fn download(&self, options: &DownloadOptions)
        -> Result<DownloadSuccess, DownloadFailure>;
}

/// Outcome of a full handler run, tagged with the winning strategy.
#[derive(Debug, Clone, Serialize)]
pub struct DownloadReport {
    pub bytes_written: u64,
    pub remote_path_used: String,
    pub strategy_used: String,
    pub attempts: u32,
}

/// Aggregated failure across every strategy.
#[derive(Debug, thiserror::Error)]
#[error("all download strategies failed for {filename}: {}", errors.join("; "))]
pub struct DownloadExhausted {
    pub filename: String,
    pub attempts: u32,
    pub errors: Vec<String>,
}

/// Retry shaping for retryable failures inside one strategy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        let exponential = self
            .base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_delay);
        jitter(exponential, self.jitter)
    }
}

/// Tries an ordered list of strategies, retrying each before falling
/// back to the next.
pub struct DownloadHandler {
    printer_id: String,
    strategies: Vec<Box<dyn DownloadStrategy>>,
    retry: RetryPolicy,
}

impl DownloadHandler {
    pub fn new(
        printer_id: impl Into<String>,
        strategies: Vec<Box<dyn DownloadStrategy>>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            printer_id: printer_id.into(),
            strategies,
            retry,
        }
    }

    pub async fn available_strategies(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        for strategy in &self.strategies {
            if strategy.available().await {
                names.push(strategy.name());
            }
        }
        names
    }

    /// Fetch `options.filename` to `options.local_path`.
    ///
    /// On failure the local path is removed, so callers can treat any
    /// error as "no file". Total attempts never exceed
    /// `strategies × max_retries`.
    pub async fn download(
        &self,
        options: &DownloadOptions,
    ) -> Result<DownloadReport, DownloadExhausted> {
        let mut total_attempts = 0u32;
        let mut errors = Vec::new();

        for strategy in &self.strategies {
            if !strategy.available().await {
                tracing::debug!(
                    printer_id = %self.printer_id,
                    strategy = strategy.name(),
                    "strategy unavailable, skipping"
                );
                continue;
            }

            tracing::info!(
                printer_id = %self.printer_id,
                strategy = strategy.name(),
                filename = %options.filename,
                "attempting download"
            );

            let mut attempt = 0;
            while attempt < options.max_retries {
                total_attempts += 1;
                match strategy.download(options).await {
                    Ok(success) => {
                        tracing::info!(
                            printer_id = %self.printer_id,
                            strategy = strategy.name(),
                            filename = %options.filename,
                            size = success.bytes_written,
                            attempts = total_attempts,
                            "download successful"
                        );
                        return Ok(DownloadReport {
                            bytes_written: success.bytes_written,
                            remote_path_used: success.remote_path_used,
                            strategy_used: strategy.name().to_string(),
                            attempts: total_attempts,
                        });
                    }
                    Err(DownloadFailure::Unavailable) => {
                        errors.push(format!("{}: unavailable", strategy.name()));
                        break;
                    }
                    Err(failure @ DownloadFailure::Fatal(_)) => {
                        tracing::warn!(
                            printer_id = %self.printer_id,
                            strategy = strategy.name(),
                            error = %failure.describe(),
                            "fatal error, moving to next strategy"
                        );
                        errors.push(format!("{}: {}", strategy.name(), failure.describe()));
                        break;
                    }
                    Err(failure @ DownloadFailure::Retryable(_)) => {
                        errors.push(format!("{}: {}", strategy.name(), failure.describe()));
                        attempt += 1;
                        if attempt < options.max_retries {
                            let delay = self.retry.delay_for(attempt - 1);
                            tracing::debug!(
                                printer_id = %self.printer_id,
                                strategy = strategy.name(),
                                attempt,
                                delay_s = delay.as_secs_f64(),
                                "retrying after backoff"
                            );
                            tokio::time::sleep(delay).await;
                        }
                    }
                }
            }
        }

        // Callers must be able to treat the target as absent.
        remove_partial(&options.local_path).await;

        tracing::error!(
            printer_id = %self.printer_id,
            filename = %options.filename,
            attempts = total_attempts,
            "all download strategies failed"
        );
        Err(DownloadExhausted {
            filename: options.filename.clone(),
            attempts: total_attempts,
            errors,
        })
    }
}

async fn remove_partial(path: &Path) {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            tracing::warn!(path = %path.display(), error = %e, "could not remove partial file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct FakeStrategy {
        name: &'static str,
        available: bool,
        calls: Arc<AtomicU32>,
        outcome: fn(u32) -> Result<DownloadSuccess, DownloadFailure>,
    }

    #[async_trait::async_trait]
    impl DownloadStrategy for FakeStrategy {
        fn name(&self) -> &'static str {
            self.name
        }
        async fn available(&self) -> bool {
            self.available
        }
        async fn download(
            &self,
            _options: &DownloadOptions,
        ) -> Result<DownloadSuccess, DownloadFailure> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            (self.outcome)(call)
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            jitter: 0.0,
        }
    }

    fn options() -> DownloadOptions {
        let dir = std::env::temp_dir();
        DownloadOptions::new("test.3mf", dir.join("printernizer-dl-test.3mf"))
    }

    #[tokio::test]
    async fn falls_back_to_next_strategy_on_fatal_error() {
        let first_calls = Arc::new(AtomicU32::new(0));
        let second_calls = Arc::new(AtomicU32::new(0));
        let handler = DownloadHandler::new(
            "p1",
            vec![
                Box::new(FakeStrategy {
                    name: "FTP",
                    available: true,
                    calls: Arc::clone(&first_calls),
                    outcome: |_| Err(DownloadFailure::Fatal("auth rejected".into())),
                }),
                Box::new(FakeStrategy {
                    name: "HTTP",
                    available: true,
                    calls: Arc::clone(&second_calls),
                    outcome: |_| {
                        Ok(DownloadSuccess {
                            bytes_written: 12345,
                            remote_path_used: "http://x/cache/test.3mf".into(),
                        })
                    },
                }),
            ],
            fast_retry(),
        );

        let report = handler.download(&options()).await.unwrap();
        assert_eq!(report.strategy_used, "HTTP");
        assert_eq!(report.bytes_written, 12345);
        assert!(report.attempts >= 2);
        assert_eq!(first_calls.load(Ordering::SeqCst), 1);
        assert_eq!(second_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_within_a_strategy_then_succeeds() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = DownloadHandler::new(
            "p1",
            vec![Box::new(FakeStrategy {
                name: "HTTP",
                available: true,
                calls: Arc::clone(&calls),
                outcome: |call| {
                    if call < 2 {
                        Err(DownloadFailure::Retryable("connection reset".into()))
                    } else {
                        Ok(DownloadSuccess {
                            bytes_written: 10,
                            remote_path_used: "u".into(),
                        })
                    }
                },
            })],
            fast_retry(),
        );

        let report = handler.download(&options()).await.unwrap();
        assert_eq!(report.attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn attempt_budget_is_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = DownloadHandler::new(
            "p1",
            vec![
                Box::new(FakeStrategy {
                    name: "FTP",
                    available: true,
                    calls: Arc::clone(&calls),
                    outcome: |_| Err(DownloadFailure::Retryable("flaky".into())),
                }),
                Box::new(FakeStrategy {
                    name: "HTTP",
                    available: true,
                    calls: Arc::clone(&calls),
                    outcome: |_| Err(DownloadFailure::Retryable("flaky".into())),
                }),
            ],
            fast_retry(),
        );

        let mut opts = options();
        opts.max_retries = 3;
        let err = handler.download(&opts).await.unwrap_err();
        // Never more than strategies × max_retries.
        assert_eq!(err.attempts, 6);
        assert_eq!(calls.load(Ordering::SeqCst), 6);
        assert!(err.errors.iter().any(|e| e.starts_with("FTP:")));
        assert!(err.errors.iter().any(|e| e.starts_with("HTTP:")));
    }

    #[tokio::test]
    async fn unavailable_strategies_are_skipped() {
        let calls = Arc::new(AtomicU32::new(0));
        let handler = DownloadHandler::new(
            "p1",
            vec![
                Box::new(FakeStrategy {
                    name: "MQTT",
                    available: false,
                    calls: Arc::clone(&calls),
                    outcome: |_| Err(DownloadFailure::Unavailable),
                }),
                Box::new(FakeStrategy {
                    name: "HTTP",
                    available: true,
                    calls: Arc::clone(&calls),
                    outcome: |_| {
                        Ok(DownloadSuccess {
                            bytes_written: 1,
                            remote_path_used: "u".into(),
                        })
                    },
                }),
            ],
            fast_retry(),
        );

        let report = handler.download(&options()).await.unwrap();
        assert_eq!(report.strategy_used, "HTTP");
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test]
    async fn ftp_refused_falls_back_to_http_serving_the_file() {
        use axum::{routing::get, Router};

        // Local HTTP server standing in for the printer's web surface.
        let app = Router::new().route(
            "/cache/test.3mf",
            get(|| async { vec![0x42u8; 12345] }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // FTP endpoint with nothing listening: connection refused.
        let ftp = crate::printers::bambu_ftp::BambuFtp::with_port(
            "127.0.0.1".to_string(),
            "12345678".to_string(),
            1,
        );
        let handler = DownloadHandler::new(
            "p1",
            vec![
                Box::new(crate::download::ftp::FtpDownloadStrategy::new("p1", ftp)),
                Box::new(crate::download::http::HttpDownloadStrategy::new(
                    "p1",
                    addr.to_string(),
                    Some("12345678".to_string()),
                )),
                Box::new(crate::download::mqtt::MqttDownloadStrategy),
            ],
            fast_retry(),
        );

        let dir = tempfile::tempdir().unwrap();
        let mut options = DownloadOptions::new("test.3mf", dir.path().join("test.3mf"));
        options.max_retries = 2;
        options.timeout = Duration::from_secs(10);

        let report = handler.download(&options).await.unwrap();
        assert_eq!(report.strategy_used, "HTTP");
        assert_eq!(report.bytes_written, 12345);
        assert!(report.attempts >= 2);
        assert_eq!(
            std::fs::metadata(dir.path().join("test.3mf")).unwrap().len(),
            12345
        );
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..100 {
            let d = jitter(Duration::from_secs(100), 0.1);
            assert!(d >= Duration::from_secs(90) && d <= Duration::from_secs(110));
        }
    }

    #[test]
    fn retry_delay_is_capped() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
        };
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(8));
        assert_eq!(policy.delay_for(10), Duration::from_secs(30));
    }
}
