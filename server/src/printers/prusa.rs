//! PrusaLink polling client.
//!
//! PrusaLink exposes an OctoPrint-compatible REST surface; the printer
//! is polled rather than pushing updates. Authentication is the
//! `X-Api-Key` header on every request.

use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;

use super::status::{self, PrinterState, PrinterStatus};
use super::{PrinterKind, ProtocolClient, RemoteFile};
use crate::error::{Result, ServiceError};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct PrusaClient {
    base_url: String,
    api_key: String,
    http: reqwest::Client,
    updates_tx: watch::Sender<u64>,
}

impl PrusaClient {
    pub fn new(host: String, api_key: String) -> Result<Self> {
        let base_url = if host.starts_with("http://") || host.starts_with("https://") {
            host.trim_end_matches('/').to_string()
        } else {
            format!("http://{host}")
        };

        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ServiceError::Config(format!("HTTP client: {e}")))?;

        let (updates_tx, _) = watch::channel(0);
        Ok(Self {
            base_url,
            api_key,
            http,
            updates_tx,
        })
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .header("X-Api-Key", &self.api_key)
            .send()
            .await?;

        match response.status().as_u16() {
            200 => Ok(response.json().await?),
            401 | 403 => Err(ServiceError::Auth(format!("{path}: API key rejected"))),
            status => Err(ServiceError::TransientNetwork(format!(
                "{path}: HTTP {status}"
            ))),
        }
    }

    async fn post_job_command(&self, body: Value) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/api/job", self.base_url))
            .header("X-Api-Key", &self.api_key)
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

#[async_trait::async_trait]
impl ProtocolClient for PrusaClient {
    fn kind(&self) -> PrinterKind {
        PrinterKind::Prusa
    }

    fn is_push(&self) -> bool {
        false
    }

    /// Probe the API once so bad endpoints/keys fail fast.
    async fn connect(&self) -> Result<()> {
        self.get_json("/api/printer").await.map(|_| ())
    }

    async fn disconnect(&self) {}

    async fn status(&self) -> Result<PrinterStatus> {
        let printer = match self.get_json("/api/printer").await {
            Ok(v) => v,
            Err(ServiceError::Auth(e)) => return Err(ServiceError::Auth(e)),
            Err(e) => {
                // Unreachable this cycle: report offline, let the
                // scheduler back off.
                tracing::debug!(error = %e, "prusa poll failed");
                return Err(e);
            }
        };

        let mut snapshot = status::extract_prusa(&printer, None);
        if snapshot.state == PrinterState::Printing || snapshot.state == PrinterState::Paused {
            match self.get_json("/api/job").await {
                Ok(job) => snapshot = status::extract_prusa(&printer, Some(&job)),
                Err(e) => tracing::debug!(error = %e, "prusa job poll failed"),
            }
        }
        Ok(snapshot)
    }

    async fn pause(&self) -> Result<()> {
        self.post_job_command(serde_json::json!({ "command": "pause", "action": "pause" }))
            .await
    }

    async fn resume(&self) -> Result<()> {
        self.post_job_command(serde_json::json!({ "command": "pause", "action": "resume" }))
            .await
    }

    async fn stop_print(&self) -> Result<()> {
        self.post_job_command(serde_json::json!({ "command": "cancel" }))
            .await
    }

    async fn list_files(&self) -> Result<Vec<RemoteFile>> {
        let listing = self.get_json("/api/files").await?;
        let mut files = Vec::new();
        collect_prusa_files(&listing["files"], &mut files);
        Ok(files)
    }

    fn updates(&self) -> watch::Receiver<u64> {
        self.updates_tx.subscribe()
    }

    fn last_message_age(&self) -> Option<Duration> {
        None
    }
}

fn collect_prusa_files(node: &Value, out: &mut Vec<RemoteFile>) {
    let Some(entries) = node.as_array() else {
        return;
    };
    for entry in entries {
        match entry["type"].as_str() {
            Some("folder") => collect_prusa_files(&entry["children"], out),
            _ => {
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
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bare_host_gets_http_scheme() {
        let client = PrusaClient::new("192.168.1.60".into(), "key".into()).unwrap();
        assert_eq!(client.base_url, "http://192.168.1.60");

        let client = PrusaClient::new("https://prusa.local/".into(), "key".into()).unwrap();
        assert_eq!(client.base_url, "https://prusa.local");
    }

    #[test]
    fn file_listing_recurses_folders() {
        let listing = json!([
            { "type": "folder", "name": "sub", "children": [
                { "type": "machinecode", "name": "a.gcode", "size": 10, "path": "sub/a.gcode" }
            ]},
            { "type": "machinecode", "name": "b.gcode", "display": "B part.gcode", "size": 20, "path": "b.gcode", "date": 1700000000 }
        ]);
        let mut out = Vec::new();
        collect_prusa_files(&listing, &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].path, "sub/a.gcode");
        assert_eq!(out[1].name, "B part.gcode");
        assert!(out[1].modified.is_some());
    }
}
