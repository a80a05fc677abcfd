//! HTTP download strategy.
//!
//! Bambu printers expose a small HTTP surface that can serve cached
//! files; it also covers any printer that publishes files over plain
//! HTTP. Responses are streamed to disk in chunks.

use futures_util::StreamExt;
use tokio::io::AsyncWriteExt;

use super::{DownloadFailure, DownloadOptions, DownloadStrategy, DownloadSuccess};

const BAMBU_CAMERA_PORT: u16 = 6000;

pub struct HttpDownloadStrategy {
    printer_id: String,
    host: String,
    access_code: Option<String>,
    headers: Vec<(String, String)>,
    http: reqwest::Client,
}

impl HttpDownloadStrategy {
    pub fn new(
        printer_id: impl Into<String>,
        host: impl Into<String>,
        access_code: Option<String>,
    ) -> Self {
        Self {
            printer_id: printer_id.into(),
            host: host.into(),
            access_code,
            headers: Vec::new(),
            http: reqwest::Client::new(),
        }
    }

    /// Attach a header (e.g. an API key) to every request.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// URLs to try, caller-supplied first, then the standard path set on
    /// the default port and the camera port.
    fn candidate_urls(&self, filename: &str, custom: &[String]) -> Vec<String> {
        let mut urls: Vec<String> = custom
            .iter()
            .filter(|u| u.starts_with("http://") || u.starts_with("https://"))
            .cloned()
            .collect();
        for dir in ["cache", "model", "files"] {
            urls.push(format!("http://{}/{dir}/{filename}", self.host));
        }
        for dir in ["cache", "model", "files"] {
            urls.push(format!(
                "http://{}:{BAMBU_CAMERA_PORT}/{dir}/{filename}",
                self.host
            ));
        }
        urls
    }

    async fn try_url(
        &self,
        url: &str,
        options: &DownloadOptions,
    ) -> Result<Option<DownloadSuccess>, DownloadFailure> {
        let mut request = self.http.get(url).timeout(options.timeout);
        if let Some(code) = &self.access_code {
            request = request.basic_auth("bblp", Some(code));
        }
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                tracing::debug!(url, error = %e, "HTTP request failed");
                return Err(DownloadFailure::Retryable(format!("{url}: {e}")));
            }
        };

        match response.status().as_u16() {
            200 => {}
            401 | 404 => {
                tracing::debug!(url, status = response.status().as_u16(), "skipping URL");
                return Ok(None);
            }
            status => {
                tracing::debug!(url, status, "unexpected HTTP status");
                return Ok(None);
            }
        }

        let total = response.content_length();
        if let Some(parent) = options.local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadFailure::Retryable(format!("create dir: {e}")))?;
        }
        let mut file = tokio::fs::File::create(&options.local_path)
            .await
            .map_err(|e| DownloadFailure::Retryable(format!("create file: {e}")))?;

        let mut stream = response.bytes_stream();
        let mut written = 0u64;
        let mut next_progress_log = 1024 * 1024u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| DownloadFailure::Retryable(format!("stream interrupted: {e}")))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadFailure::Retryable(format!("write: {e}")))?;
            written += chunk.len() as u64;
            if written >= next_progress_log {
                next_progress_log += 1024 * 1024;
                tracing::debug!(
                    printer_id = %self.printer_id,
                    filename = %options.filename,
                    written,
                    total,
                    "HTTP download progress"
                );
            }
        }
        file.flush()
            .await
            .map_err(|e| DownloadFailure::Retryable(format!("flush: {e}")))?;

        if written == 0 {
            // A 200 with an empty body will not improve on retry.
            return Err(DownloadFailure::Fatal(format!("{url}: empty response body")));
        }

        Ok(Some(DownloadSuccess {
            bytes_written: written,
            remote_path_used: url.to_string(),
        }))
    }
}

#[async_trait::async_trait]
impl DownloadStrategy for HttpDownloadStrategy {
    fn name(&self) -> &'static str {
        "HTTP"
    }

    async fn available(&self) -> bool {
        !self.host.is_empty()
    }

    async fn download(
        &self,
        options: &DownloadOptions,
    ) -> Result<DownloadSuccess, DownloadFailure> {
        let urls = self.candidate_urls(&options.filename, &options.candidate_remote_paths);
        let mut last_error: Option<DownloadFailure> = None;

        for url in &urls {
            match self.try_url(url, options).await {
                Ok(Some(success)) => return Ok(success),
                Ok(None) => {}
                Err(failure @ DownloadFailure::Fatal(_)) => return Err(failure),
                Err(failure) => last_error = Some(failure),
            }
        }

        Err(last_error.unwrap_or_else(|| {
            DownloadFailure::Retryable(format!(
                "file not accessible via HTTP at any URL: {}",
                options.filename
            ))
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_urls_cover_default_and_camera_ports() {
        let strategy = HttpDownloadStrategy::new("p1", "192.168.1.50", None);
        let urls = strategy.candidate_urls("part.3mf", &[]);
        assert_eq!(urls[0], "http://192.168.1.50/cache/part.3mf");
        assert!(urls.contains(&"http://192.168.1.50/files/part.3mf".to_string()));
        assert!(urls.contains(&"http://192.168.1.50:6000/cache/part.3mf".to_string()));
    }

    #[test]
    fn custom_urls_lead_and_non_http_entries_are_dropped() {
        let strategy = HttpDownloadStrategy::new("p1", "h", None);
        let urls = strategy.candidate_urls(
            "f.3mf",
            &["http://h/special/f.3mf".to_string(), "cache/f.3mf".to_string()],
        );
        assert_eq!(urls[0], "http://h/special/f.3mf");
        assert!(!urls.contains(&"cache/f.3mf".to_string()));
    }
}
