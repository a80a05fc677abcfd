//! Printer-to-library file transfers.
//!
//! Glue between the download strategy engine and the library: fetch a
//! named artifact from a printer with protocol fallback, then ingest
//! the result content-addressed with printer provenance.

use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::Semaphore;

use crate::config::Config;
use crate::db::{self, library::LibraryFileRow};
use crate::download::{
    ftp::FtpDownloadStrategy, http::HttpDownloadStrategy, mqtt::MqttDownloadStrategy,
    DownloadHandler, DownloadOptions, DownloadStrategy, RetryPolicy,
};
use crate::error::{Result, ServiceError};
use crate::library::{FileSource, IngestMode, LibraryService};
use crate::printers::bambu_ftp::BambuFtp;

pub struct FileTransferService {
    pool: SqlitePool,
    library: Arc<LibraryService>,
    config: Config,
    /// Caps simultaneous transfers process-wide.
    slots: Arc<Semaphore>,
}

impl FileTransferService {
    pub fn new(pool: SqlitePool, library: Arc<LibraryService>, config: Config) -> Arc<Self> {
        let slots = Arc::new(Semaphore::new(config.max_concurrent_downloads.max(1)));
        Arc::new(Self {
            pool,
            library,
            config,
            slots,
        })
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: self.config.ftp_retry_delay,
            max_delay: self.config.ftp_retry_max_delay,
            jitter: self.config.ftp_retry_jitter,
        }
    }

    /// Strategy list for a stored printer, in priority order.
    fn strategies_for(&self, printer: &db::printers::PrinterRow) -> Vec<Box<dyn DownloadStrategy>> {
        match printer.kind.as_str() {
            "bambu" => {
                let access_code = printer.access_code.clone().unwrap_or_default();
                let ftp = BambuFtp::new(printer.host.clone(), access_code.clone());
                vec![
                    Box::new(FtpDownloadStrategy::new(printer.id.clone(), ftp)),
                    Box::new(HttpDownloadStrategy::new(
                        printer.id.clone(),
                        printer.host.clone(),
                        Some(access_code),
                    )),
                    Box::new(MqttDownloadStrategy),
                ]
            }
            _ => {
                let mut http = HttpDownloadStrategy::new(
                    printer.id.clone(),
                    host_only(&printer.host),
                    None,
                );
                if let Some(api_key) = &printer.api_key {
                    http = http.with_header("X-Api-Key", api_key.clone());
                }
                vec![Box::new(http), Box::new(MqttDownloadStrategy)]
            }
        }
    }

    /// Download `filename` from a printer and ingest it into the
    /// library. The printed-file inventory row tracks the outcome.
    pub async fn download_and_ingest(
        &self,
        printer_id: &str,
        filename: &str,
        remote_path: Option<String>,
    ) -> Result<LibraryFileRow> {
        let _slot = self
            .slots
            .acquire()
            .await
            .map_err(|_| ServiceError::Config("transfer service stopped".into()))?;

        let printer = db::printers::get(&self.pool, printer_id).await?;
        let inventory = db::files::get_by_name(&self.pool, printer_id, filename)
            .await
            .ok();
        if let Some(row) = &inventory {
            db::files::set_download_status(&self.pool, &row.id, "downloading").await?;
        }

        let staging = self
            .library
            .root()
            .join(".metadata")
            .join("downloads")
            .join(uuid::Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&staging).await?;
        let local_path = staging.join(filename);

        let mut options = DownloadOptions::new(filename, &local_path);
        options.max_retries = self.config.ftp_retry_count.max(1);
        options.chunk_size = self.config.download_chunk_size_bytes;
        if let Some(remote) = inventory.as_ref().and_then(|r| r.remote_path.clone()) {
            options.candidate_remote_paths.push(remote);
        }
        if let Some(remote) = remote_path {
            options.candidate_remote_paths.push(remote);
        }

        let handler = DownloadHandler::new(
            printer_id,
            self.strategies_for(&printer),
            self.retry_policy(),
        );

        let report = match handler.download(&options).await {
            Ok(report) => report,
            Err(exhausted) => {
                if let Some(row) = &inventory {
                    let _ = db::files::set_download_status(&self.pool, &row.id, "error").await;
                }
                let _ = tokio::fs::remove_dir_all(&staging).await;
                return Err(ServiceError::TransientNetwork(exhausted.to_string()));
            }
        };

        let max_bytes = self.config.max_file_size_mb * 1024 * 1024;
        if report.bytes_written > max_bytes {
            let _ = tokio::fs::remove_dir_all(&staging).await;
            if let Some(row) = &inventory {
                let _ = db::files::set_download_status(&self.pool, &row.id, "error").await;
            }
            return Err(ServiceError::Config(format!(
                "{filename} exceeds the {} MB file size limit",
                self.config.max_file_size_mb
            )));
        }

        tracing::info!(
            printer_id,
            filename,
            strategy = %report.strategy_used,
            bytes = report.bytes_written,
            attempts = report.attempts,
            "transfer complete, ingesting"
        );

        let ingest = self
            .library
            .add_file(
                &local_path,
                FileSource::Printer {
                    id: printer.id.clone(),
                    name: printer.name.clone(),
                },
                IngestMode::Move,
            )
            .await;
        let _ = tokio::fs::remove_dir_all(&staging).await;

        match ingest {
            Ok(row) => {
                if let Some(inventory_row) = &inventory {
                    let _ = db::files::set_download_status(
                        &self.pool,
                        &inventory_row.id,
                        "downloaded",
                    )
                    .await;
                }
                Ok(row)
            }
            Err(e) => {
                if let Some(inventory_row) = &inventory {
                    let _ =
                        db::files::set_download_status(&self.pool, &inventory_row.id, "error").await;
                }
                Err(e)
            }
        }
    }

    /// Refresh a printer's file inventory from a live listing.
    pub async fn refresh_inventory(
        &self,
        driver: &Arc<crate::printers::PrinterDriver>,
    ) -> Result<usize> {
        let files = driver.list_files().await?;
        let mut observed = 0usize;
        for file in &files {
            db::files::upsert_observed(
                &self.pool,
                &driver.id,
                &file.name,
                file.size as i64,
                Some(&file.path),
            )
            .await?;
            observed += 1;
        }
        tracing::info!(printer_id = %driver.id, observed, "inventory refreshed");
        Ok(observed)
    }
}

/// Strip a scheme for the HTTP strategy's host slot.
fn host_only(host: &str) -> String {
    host.trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_only_strips_scheme() {
        assert_eq!(host_only("http://octo.local/"), "octo.local");
        assert_eq!(host_only("192.168.1.60"), "192.168.1.60");
    }
}
