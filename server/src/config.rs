use std::path::PathBuf;
use std::time::Duration;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Process configuration, loaded once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_address: String,
    pub database_url: String,
    pub static_dir: String,

    /// Base poll interval for pull drivers.
    pub monitoring_interval: Duration,
    /// Cap on per-printer poll backoff.
    pub monitoring_backoff_max: Duration,
    /// Quiet period after process start before aggressive polling.
    pub monitoring_discovery_delay: Duration,
    /// Consecutive failures before a driver is suspended.
    pub monitoring_suspend_after: u32,

    // Download engine retry shaping (FTP strategy).
    pub ftp_retry_count: u32,
    pub ftp_retry_delay: Duration,
    pub ftp_retry_max_delay: Duration,
    pub ftp_retry_jitter: f64,

    // Bambu MQTT reconnect shaping.
    pub mqtt_retry_count: u32,
    pub mqtt_retry_delay: Duration,
    pub mqtt_retry_max_delay: Duration,
    pub mqtt_auto_reconnect_delay: Duration,

    // Library engine.
    pub library_enabled: bool,
    pub library_path: PathBuf,
    pub library_checksum_algorithm: String,
    pub library_processing_workers: usize,
    pub library_preserve_originals: bool,

    // Download engine limits.
    pub max_file_size_mb: u64,
    pub download_chunk_size_bytes: usize,
    pub max_concurrent_downloads: usize,

    // Home-automation discovery (outbound MQTT).
    pub enable_mqtt_discovery: bool,
    pub mqtt_prefix: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,

    // Webhook notification channels.
    pub discord_webhook_url: Option<String>,
    pub slack_webhook_url: Option<String>,
    pub ntfy_server: Option<String>,
    pub ntfy_topic: Option<String>,

    /// Directories watched for new model files.
    pub watch_folders: Vec<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_address: env_or("BIND_ADDRESS", "0.0.0.0:8000"),
            database_url: env_or("DATABASE_URL", "sqlite://printernizer.db?mode=rwc"),
            static_dir: env_or("STATIC_DIR", "static"),

            monitoring_interval: Duration::from_secs(env_parse("MONITORING_INTERVAL_S", 30)),
            monitoring_backoff_max: Duration::from_secs(env_parse("MONITORING_BACKOFF_MAX_S", 300)),
            monitoring_discovery_delay: Duration::from_secs(env_parse("MONITORING_DISCOVERY_DELAY_S", 60)),
            monitoring_suspend_after: env_parse("MONITORING_SUSPEND_AFTER", 10),

            ftp_retry_count: env_parse("FTP_RETRY_COUNT", 3),
            ftp_retry_delay: Duration::from_secs_f64(env_parse("FTP_RETRY_DELAY_S", 1.0)),
            ftp_retry_max_delay: Duration::from_secs_f64(env_parse("FTP_RETRY_MAX_DELAY_S", 30.0)),
            ftp_retry_jitter: env_parse("FTP_RETRY_JITTER", 0.1),

            mqtt_retry_count: env_parse("MQTT_RETRY_COUNT", 3),
            mqtt_retry_delay: Duration::from_secs_f64(env_parse("MQTT_RETRY_DELAY_S", 2.0)),
            mqtt_retry_max_delay: Duration::from_secs_f64(env_parse("MQTT_RETRY_MAX_DELAY_S", 60.0)),
            mqtt_auto_reconnect_delay: Duration::from_secs_f64(env_parse("MQTT_AUTO_RECONNECT_DELAY_S", 5.0)),

            library_enabled: env_parse("LIBRARY_ENABLED", true),
            library_path: PathBuf::from(env_or("LIBRARY_PATH", "data/library")),
            library_checksum_algorithm: env_or("LIBRARY_CHECKSUM_ALGORITHM", "sha256"),
            library_processing_workers: env_parse("LIBRARY_PROCESSING_WORKERS", 2),
            library_preserve_originals: env_parse("LIBRARY_PRESERVE_ORIGINALS", true),

            max_file_size_mb: env_parse("MAX_FILE_SIZE_MB", 500),
            download_chunk_size_bytes: env_parse("DOWNLOAD_CHUNK_SIZE_BYTES", 8192),
            max_concurrent_downloads: env_parse("MAX_CONCURRENT_DOWNLOADS", 3),

            enable_mqtt_discovery: env_parse("ENABLE_MQTT_DISCOVERY", false),
            mqtt_prefix: env_or("MQTT_PREFIX", "homeassistant"),
            mqtt_host: env_or("MQTT_HOST", "localhost"),
            mqtt_port: env_parse("MQTT_PORT", 1883),
            mqtt_username: env_opt("MQTT_USERNAME"),
            mqtt_password: env_opt("MQTT_PASSWORD"),

            discord_webhook_url: env_opt("DISCORD_WEBHOOK_URL"),
            slack_webhook_url: env_opt("SLACK_WEBHOOK_URL"),
            ntfy_server: env_opt("NTFY_SERVER"),
            ntfy_topic: env_opt("NTFY_TOPIC"),

            watch_folders: env_opt("WATCH_FOLDERS")
                .map(|v| v.split(':').map(PathBuf::from).collect())
                .unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::from_env();
        assert_eq!(config.monitoring_interval, Duration::from_secs(30));
        assert_eq!(config.monitoring_backoff_max, Duration::from_secs(300));
        assert_eq!(config.library_processing_workers, 2);
        assert_eq!(config.download_chunk_size_bytes, 8192);
        assert_eq!(config.mqtt_prefix, "homeassistant");
    }
}
