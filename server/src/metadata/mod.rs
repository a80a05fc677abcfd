//! Metadata extraction pipeline.
//!
//! A small worker pool drains a queue fed by library ingests, parses
//! 3MF/G-code/STL files off the async scheduler, and writes normalized
//! metadata back through the storage gateway. Ingest never waits on
//! extraction, and a given content hash is processed by at most one
//! worker at a time.

pub mod colors;
pub mod gcode;
pub mod stl;
pub mod threemf;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::{mpsc, Mutex};

use crate::db::{
    self,
    library::{NormalizedMetadata, Thumbnail},
};
use crate::error::{Result, ServiceError};
use crate::events::{EventBus, EventType};

/// One unit of extraction work.
#[derive(Debug, Clone)]
pub struct ExtractJob {
    /// Library row key (synthetic for duplicate rows).
    pub row_key: String,
    pub path: PathBuf,
}

/// Producer handle for the extraction queue. Enqueueing is non-blocking
/// from the ingest path's perspective.
#[derive(Clone)]
pub struct ExtractionQueue {
    tx: mpsc::Sender<ExtractJob>,
}

impl ExtractionQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ExtractJob>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    pub async fn enqueue(&self, row_key: &str, path: &Path) {
        let job = ExtractJob {
            row_key: row_key.to_string(),
            path: path.to_path_buf(),
        };
        if let Err(e) = self.tx.try_send(job.clone()) {
            match e {
                mpsc::error::TrySendError::Full(job) => {
                    // Queue saturated: hand off to a task so the caller
                    // does not wait on extraction.
                    let tx = self.tx.clone();
                    tokio::spawn(async move {
                        let _ = tx.send(job).await;
                    });
                }
                mpsc::error::TrySendError::Closed(_) => {
                    tracing::warn!(row_key = %job.row_key, "extraction queue closed, dropping job");
                }
            }
        }
    }
}

/// Everything a parser produces for one file.
#[derive(Debug, Default, Clone)]
pub struct ParsedFile {
    pub meta: NormalizedMetadata,
    pub thumbnail: Option<Thumbnail>,
}

pub struct MetadataService {
    stop_tx: tokio::sync::watch::Sender<bool>,
    workers: Vec<tokio::task::JoinHandle<()>>,
}

impl MetadataService {
    /// Spawn `worker_count` workers draining `rx`.
    pub fn start(
        pool: SqlitePool,
        bus: Arc<EventBus>,
        rx: mpsc::Receiver<ExtractJob>,
        worker_count: usize,
    ) -> Self {
        let rx = Arc::new(Mutex::new(rx));
        // Content hashes currently being extracted. The lock is held
        // only to flip membership, never across file I/O.
        let processing: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
        let mut workers = Vec::new();

        for worker_id in 0..worker_count.max(1) {
            let rx = Arc::clone(&rx);
            let processing = Arc::clone(&processing);
            let pool = pool.clone();
            let bus = Arc::clone(&bus);
            let mut stop_rx = stop_rx.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    // An idle worker leaves as soon as it is stopped; a
                    // busy one finishes its current file first.
                    let job = tokio::select! {
                        job = async { rx.lock().await.recv().await } => job,
                        _ = stop_rx.changed() => {
                            tracing::debug!(worker_id, "extraction worker stopping");
                            return;
                        }
                    };
                    let Some(job) = job else {
                        tracing::debug!(worker_id, "extraction queue closed, worker exiting");
                        return;
                    };

                    // Per-content-hash serialization: the synthetic part
                    // of duplicate keys is ignored here.
                    let guard_key = content_key(&job.row_key);
                    loop {
                        let inserted = processing.lock().await.insert(guard_key.clone());
                        if inserted {
                            break;
                        }
                        tokio::time::sleep(Duration::from_millis(250)).await;
                    }

                    let result = extract_one(&pool, &bus, &job).await;
                    processing.lock().await.remove(&guard_key);

                    if let Err(e) = result {
                        tracing::warn!(
                            row_key = %job.row_key,
                            error = %e,
                            "metadata extraction failed"
                        );
                        let _ = db::library::set_error(&pool, &job.row_key, &e.to_string()).await;
                    }
                }
            }));
        }

        Self { stop_tx, workers }
    }

    /// Drain the workers: idle ones exit immediately, in-flight
    /// extractions get the grace period, anything past it is abandoned.
    pub async fn shutdown(mut self, grace: Duration) {
        let _ = self.stop_tx.send(true);
        let drain = async {
            for worker in &mut self.workers {
                let _ = worker.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            tracing::warn!("metadata workers did not drain in time, aborting");
        }
        for worker in &self.workers {
            worker.abort();
        }
    }
}

fn content_key(row_key: &str) -> String {
    row_key.chars().take(64).collect()
}

async fn extract_one(pool: &SqlitePool, bus: &Arc<EventBus>, job: &ExtractJob) -> Result<()> {
    db::library::set_status(pool, &job.row_key, "processing").await?;
    tracing::debug!(row_key = %job.row_key, path = %job.path.display(), "extracting metadata");

    let path = job.path.clone();
    let parsed = tokio::task::spawn_blocking(move || parse_file(&path))
        .await
        .map_err(|e| ServiceError::Integrity(format!("extraction task: {e}")))??;

    db::library::apply_metadata(pool, &job.row_key, &parsed.meta, parsed.thumbnail.as_ref())
        .await?;

    if let Some(thumb) = &parsed.thumbnail {
        bus.publish(
            EventType::ThumbnailCached,
            serde_json::json!({
                "checksum": job.row_key,
                "width": thumb.width,
                "height": thumb.height,
            }),
        );
    }

    tracing::info!(row_key = %job.row_key, "metadata extraction complete");
    Ok(())
}

/// Dispatch by extension. Runs on a blocking thread.
pub fn parse_file(path: &Path) -> Result<ParsedFile> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "3mf" => threemf::parse(path),
        "gcode" | "bgcode" => gcode::parse(path),
        "stl" => stl::parse(path),
        other => Err(ServiceError::Config(format!(
            "unsupported file type for extraction: .{other}"
        ))),
    }
}

// ---- normalization helpers shared by the parsers ----

/// Sum a comma-separated per-extruder value list, ignoring empty
/// summands: `"15.5,8.3,"` → `23.8`.
pub fn sum_csv_floats(raw: &str) -> Option<f64> {
    let mut sum = 0.0;
    let mut any = false;
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        sum += part.parse::<f64>().ok()?;
        any = true;
    }
    any.then_some(sum)
}

/// Split a `;`- or `,`-joined list into trimmed entries.
pub fn split_list(raw: &str) -> Vec<String> {
    raw.split([';', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Normalize `"true"`/`"1"`/`"yes"` (any case) to a boolean.
pub fn parse_bool_like(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes"
    )
}

/// Split `"<Slicer> <Version>"` into name and version.
pub fn split_generator(raw: &str) -> (Option<String>, Option<String>) {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return (None, None);
    }
    match trimmed.rsplit_once(' ') {
        Some((name, version))
            if version.chars().next().map(|c| c.is_ascii_digit()).unwrap_or(false) =>
        {
            (Some(name.trim().to_string()), Some(version.to_string()))
        }
        _ => (Some(trimmed.to_string()), None),
    }
}

/// Parse a percentage that may arrive as `"15%"`, `"15"`, or `0.15`.
pub fn parse_percent(raw: &str) -> Option<f64> {
    let trimmed = raw.trim().trim_end_matches('%').trim();
    let value: f64 = trimmed.parse().ok()?;
    if value <= 1.0 && raw.contains('.') && !raw.contains('%') {
        Some(value * 100.0)
    } else {
        Some(value)
    }
}

/// Complexity score for a mesh, 1..=10.
pub fn complexity_score(
    vertex_count: usize,
    surface_area_to_volume: Option<f64>,
    watertight: bool,
    has_holes: bool,
) -> i64 {
    let mut score: i64 = 5;

    if vertex_count > 100_000 {
        score += 3;
    } else if vertex_count > 50_000 {
        score += 2;
    } else if vertex_count > 10_000 {
        score += 1;
    } else if vertex_count < 1_000 {
        score -= 1;
    }

    if surface_area_to_volume.map(|r| r > 10.0).unwrap_or(false) {
        score += 1;
    }
    if !watertight {
        score += 1;
    }
    if has_holes {
        score += 1;
    }

    score.clamp(1, 10)
}

pub fn difficulty_for(score: i64) -> &'static str {
    match score {
        ..=3 => "Beginner",
        4..=6 => "Intermediate",
        7..=8 => "Advanced",
        _ => "Expert",
    }
}
