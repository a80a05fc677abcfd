//! MQTT slot in the strategy list.
//!
//! MQTT is a messaging protocol and does not carry files; the slot
//! exists so every printer kind presents a uniform strategy list.

use super::{DownloadFailure, DownloadOptions, DownloadStrategy, DownloadSuccess};

pub struct MqttDownloadStrategy;

#[async_trait::async_trait]
impl DownloadStrategy for MqttDownloadStrategy {
    fn name(&self) -> &'static str {
        "MQTT"
    }

    async fn available(&self) -> bool {
        false
    }

    async fn download(
        &self,
        _options: &DownloadOptions,
    ) -> Result<DownloadSuccess, DownloadFailure> {
        Err(DownloadFailure::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mqtt_is_permanently_unavailable() {
        let strategy = MqttDownloadStrategy;
        assert!(!strategy.available().await);
        let options = DownloadOptions::new("f.3mf", std::env::temp_dir().join("f.3mf"));
        assert!(matches!(
            strategy.download(&options).await,
            Err(DownloadFailure::Unavailable)
        ));
    }
}
