//! FTP download strategy for Bambu printers, with filename discovery.

use std::sync::Arc;

use super::{DownloadFailure, DownloadOptions, DownloadStrategy, DownloadSuccess};
use crate::error::ServiceError;
use crate::printers::bambu_ftp::{BambuFtp, SCAN_DIRS};
use crate::printers::RemoteFile;

pub struct FtpDownloadStrategy {
    printer_id: String,
    ftp: Arc<BambuFtp>,
}

impl FtpDownloadStrategy {
    pub fn new(printer_id: impl Into<String>, ftp: Arc<BambuFtp>) -> Self {
        Self {
            printer_id: printer_id.into(),
            ftp,
        }
    }

    /// Candidate remote paths, caller-supplied ones first.
    fn candidate_paths(filename: &str, custom: &[String]) -> Vec<String> {
        let mut paths: Vec<String> = custom.to_vec();
        paths.extend([
            format!("cache/{filename}"),
            filename.to_string(),
            format!("model/{filename}"),
            format!("timelapse/{filename}"),
            format!("sdcard/{filename}"),
            format!("usb/{filename}"),
            format!("USB/{filename}"),
            format!("gcodes/{filename}"),
        ]);
        paths
    }

    fn map_error(error: &ServiceError) -> DownloadFailure {
        match error {
            ServiceError::Auth(m) => DownloadFailure::Fatal(m.clone()),
            ServiceError::NotFound(m) => DownloadFailure::Retryable(format!("not found: {m}")),
            other => DownloadFailure::Retryable(other.to_string()),
        }
    }

    /// Scan the known directories and pick the best match for a file
    /// that was not at any direct path.
    async fn discover(&self, filename: &str) -> Option<RemoteFile> {
        let discovered = self.ftp.list_known_dirs().await;
        if discovered.is_empty() {
            return None;
        }
        pick_match(filename, &discovered).cloned()
    }
}

/// Exact case-insensitive match first; otherwise fuzzy candidates where
/// the queried basename (extension stripped) is a substring, ranked to
/// prefer `.3mf` over `.gcode` and prefix matches over substring ones.
pub fn pick_match<'a>(filename: &str, discovered: &'a [RemoteFile]) -> Option<&'a RemoteFile> {
    let target = filename.to_lowercase();

    if let Some(exact) = discovered.iter().find(|f| f.name.to_lowercase() == target) {
        return Some(exact);
    }

    let base = target
        .rsplit_once('.')
        .map(|(stem, _)| stem.to_string())
        .unwrap_or(target);
    if base.is_empty() {
        return None;
    }

    let mut candidates: Vec<(&RemoteFile, f64)> = discovered
        .iter()
        .filter(|f| f.name.to_lowercase().contains(&base))
        .map(|f| {
            let name = f.name.to_lowercase();
            let mut score = 0.0;
            if name.ends_with(".3mf") {
                score += 3.0;
            }
            if name.ends_with(".gcode") {
                score += 2.0;
            }
            if name.starts_with(&base) {
                score += 1.0;
            }
            score += 0.5; // substring hit
            (f, score)
        })
        .collect();

    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    candidates.first().map(|(f, _)| *f)
}

#[async_trait::async_trait]
impl DownloadStrategy for FtpDownloadStrategy {
    fn name(&self) -> &'static str {
        "FTP"
    }

    async fn available(&self) -> bool {
        self.ftp.has_credentials()
    }

    async fn download(
        &self,
        options: &DownloadOptions,
    ) -> Result<DownloadSuccess, DownloadFailure> {
        let paths = Self::candidate_paths(&options.filename, &options.candidate_remote_paths);
        let mut last_error: Option<DownloadFailure> = None;

        for remote_path in &paths {
            tracing::debug!(
                printer_id = %self.printer_id,
                remote_path,
                "attempting FTP download"
            );
            match tokio::time::timeout(
                options.timeout,
                self.ftp.download_file(remote_path, &options.local_path),
            )
            .await
            {
                Ok(Ok(bytes_written)) if bytes_written > 0 => {
                    return Ok(DownloadSuccess {
                        bytes_written,
                        remote_path_used: remote_path.clone(),
                    });
                }
                Ok(Ok(_)) => {
                    tracing::debug!(remote_path, "FTP returned empty file");
                }
                Ok(Err(e)) => {
                    if matches!(e, ServiceError::Auth(_)) {
                        // Credentials will not improve on the next path.
                        return Err(Self::map_error(&e));
                    }
                    tracing::debug!(remote_path, error = %e, "FTP path failed");
                    last_error = Some(Self::map_error(&e));
                }
                Err(_) => {
                    last_error = Some(DownloadFailure::Retryable(format!(
                        "timeout fetching {remote_path}"
                    )));
                }
            }
        }

        // None of the direct paths had it: scan and match.
        if let Some(found) = self.discover(&options.filename).await {
            tracing::info!(
                printer_id = %self.printer_id,
                requested = %options.filename,
                matched = %found.name,
                remote_path = %found.path,
                "found file via directory scan"
            );
            match tokio::time::timeout(
                options.timeout,
                self.ftp.download_file(&found.path, &options.local_path),
            )
            .await
            {
                Ok(Ok(bytes_written)) if bytes_written > 0 => {
                    return Ok(DownloadSuccess {
                        bytes_written,
                        remote_path_used: found.path.clone(),
                    });
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(Self::map_error(&e)),
                Err(_) => {
                    return Err(DownloadFailure::Retryable(format!(
                        "timeout fetching {}",
                        found.path
                    )))
                }
            }
        } else {
            tracing::debug!(
                printer_id = %self.printer_id,
                filename = %options.filename,
                scanned = ?SCAN_DIRS,
                "file not found in any scanned directory"
            );
        }

        Err(last_error.unwrap_or_else(|| {
            DownloadFailure::Retryable(format!("file not found via FTP: {}", options.filename))
        }))
    }
}
