//! Watch folders.
//!
//! Configured directories are watched for new model files; anything
//! that settles (stable size across two probes) is ingested into the
//! library with watch-folder provenance.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Event as NotifyEvent, EventKind, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::library::{FileSource, LibraryService};

const SETTLE_PROBE_DELAY: Duration = Duration::from_millis(500);
const SETTLE_PROBES: u32 = 20;

const WATCHED_EXTENSIONS: &[&str] = &["3mf", "stl", "obj", "gcode", "bgcode", "ply"];

fn is_watched_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| WATCHED_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

pub struct WatchFolderService {
    _watchers: Vec<notify::RecommendedWatcher>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl WatchFolderService {
    /// Start watching `folders`. Returns `None` when nothing is
    /// configured or the library is disabled.
    pub fn start(folders: &[PathBuf], library: Arc<LibraryService>) -> Option<Self> {
        if folders.is_empty() || !library.enabled() {
            return None;
        }

        let (tx, mut rx) = mpsc::unbounded_channel::<PathBuf>();
        let mut watchers = Vec::new();

        for folder in folders {
            if !folder.is_dir() {
                tracing::warn!(folder = %folder.display(), "watch folder missing, skipping");
                continue;
            }
            let tx = tx.clone();
            let watcher = notify::recommended_watcher(move |result: notify::Result<NotifyEvent>| {
                let Ok(event) = result else { return };
                if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                    return;
                }
                for path in event.paths {
                    if is_watched_file(&path) {
                        let _ = tx.send(path);
                    }
                }
            });
            match watcher {
                Ok(mut watcher) => {
                    if let Err(e) = watcher.watch(folder, RecursiveMode::Recursive) {
                        tracing::warn!(folder = %folder.display(), error = %e, "watch failed");
                        continue;
                    }
                    tracing::info!(folder = %folder.display(), "watching folder");
                    watchers.push(watcher);
                }
                Err(e) => {
                    tracing::warn!(folder = %folder.display(), error = %e, "watcher init failed");
                }
            }
        }

        if watchers.is_empty() {
            return None;
        }

        let folder_roots: Vec<PathBuf> = folders.to_vec();
        let task = tokio::spawn(async move {
            while let Some(path) = rx.recv().await {
                if !wait_until_settled(&path).await {
                    continue;
                }
                let folder = folder_roots
                    .iter()
                    .find(|root| path.starts_with(root))
                    .map(|root| root.to_string_lossy().to_string())
                    .unwrap_or_else(|| "watch".to_string());

                let mode = library.watch_folder_mode();
                match library
                    .add_file(&path, FileSource::WatchFolder { folder }, mode)
                    .await
                {
                    Ok(row) => {
                        tracing::info!(
                            path = %path.display(),
                            checksum = &row.checksum[..16.min(row.checksum.len())],
                            "watch folder file ingested"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "watch folder ingest failed");
                    }
                }
            }
        });

        Some(Self {
            _watchers: watchers,
            task: Some(task),
        })
    }

    pub fn shutdown(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Wait for a file to stop growing. Slicers and network copies write
/// incrementally; ingesting a half-written file would hash garbage.
async fn wait_until_settled(path: &Path) -> bool {
    let mut last_size: Option<u64> = None;
    for _ in 0..SETTLE_PROBES {
        tokio::time::sleep(SETTLE_PROBE_DELAY).await;
        let Ok(metadata) = tokio::fs::metadata(path).await else {
            return false;
        };
        let size = metadata.len();
        if last_size == Some(size) && size > 0 {
            return true;
        }
        last_size = Some(size);
    }
    tracing::warn!(path = %path.display(), "file never settled, skipping");
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_model_extensions_are_watched() {
        assert!(is_watched_file(Path::new("/w/part.3mf")));
        assert!(is_watched_file(Path::new("/w/part.GCODE")));
        assert!(is_watched_file(Path::new("/w/scan.stl")));
        assert!(!is_watched_file(Path::new("/w/readme.txt")));
        assert!(!is_watched_file(Path::new("/w/noext")));
    }

    #[tokio::test]
    async fn settled_file_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("part.3mf");
        std::fs::write(&path, b"complete content").unwrap();
        assert!(wait_until_settled(&path).await);
    }

    #[tokio::test]
    async fn vanished_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ghost.3mf");
        assert!(!wait_until_settled(&path).await);
    }
}
