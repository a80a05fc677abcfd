use sqlx::SqlitePool;

use crate::error::Result;

/// Record one notification delivery attempt, success or failure.
pub async fn record_delivery(
    pool: &SqlitePool,
    channel: &str,
    event_type: &str,
    success: bool,
    error: Option<&str>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO webhook_deliveries (channel, event_type, success, error, delivered_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(channel)
    .bind(event_type)
    .bind(success)
    .bind(error)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, serde::Serialize, sqlx::FromRow)]
pub struct WebhookDeliveryRow {
    pub id: i64,
    pub channel: String,
    pub event_type: String,
    pub success: bool,
    pub error: Option<String>,
    pub delivered_at: i64,
}

pub async fn recent(pool: &SqlitePool, limit: i64) -> Result<Vec<WebhookDeliveryRow>> {
    Ok(sqlx::query_as::<_, WebhookDeliveryRow>(
        "SELECT * FROM webhook_deliveries ORDER BY delivered_at DESC, id DESC LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await?)
}
