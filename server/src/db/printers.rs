use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::error::{Result, ServiceError};

/// Persisted printer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PrinterRow {
    pub id: String,
    pub name: String,
    pub kind: String,
    pub host: String,
    pub access_code: Option<String>,
    pub serial: Option<String>,
    pub api_key: Option<String>,
    pub webcam_url: Option<String>,
    pub enabled: bool,
    pub monitoring_state: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields accepted when creating or updating a printer.
#[derive(Debug, Clone, Deserialize)]
pub struct PrinterInput {
    pub name: String,
    pub kind: String,
    pub host: String,
    pub access_code: Option<String>,
    pub serial: Option<String>,
    pub api_key: Option<String>,
    pub webcam_url: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

pub async fn insert(pool: &SqlitePool, id: &str, input: &PrinterInput) -> Result<PrinterRow> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO printers (
            id, name, kind, host, access_code, serial, api_key, webcam_url,
            enabled, monitoring_state, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 'disconnected', ?, ?)
        "#,
    )
    .bind(id)
    .bind(&input.name)
    .bind(&input.kind)
    .bind(&input.host)
    .bind(&input.access_code)
    .bind(&input.serial)
    .bind(&input.api_key)
    .bind(&input.webcam_url)
    .bind(input.enabled)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    get(pool, id).await
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<PrinterRow> {
    sqlx::query_as::<_, PrinterRow>("SELECT * FROM printers WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("printer {id}")))
}

pub async fn list(pool: &SqlitePool) -> Result<Vec<PrinterRow>> {
    Ok(
        sqlx::query_as::<_, PrinterRow>("SELECT * FROM printers ORDER BY created_at")
            .fetch_all(pool)
            .await?,
    )
}

pub async fn update(pool: &SqlitePool, id: &str, input: &PrinterInput) -> Result<PrinterRow> {
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        r#"
        UPDATE printers SET
            name = ?, kind = ?, host = ?, access_code = ?, serial = ?,
            api_key = ?, webcam_url = ?, enabled = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&input.name)
    .bind(&input.kind)
    .bind(&input.host)
    .bind(&input.access_code)
    .bind(&input.serial)
    .bind(&input.api_key)
    .bind(&input.webcam_url)
    .bind(input.enabled)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;

    if result.rows_affected() == 0 {
        return Err(ServiceError::NotFound(format!("printer {id}")));
    }
    get(pool, id).await
}

pub async fn set_monitoring_state(pool: &SqlitePool, id: &str, state: &str) -> Result<()> {
    sqlx::query("UPDATE printers SET monitoring_state = ?, updated_at = ? WHERE id = ?")
        .bind(state)
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_enabled(pool: &SqlitePool, id: &str, enabled: bool) -> Result<()> {
    let result = sqlx::query("UPDATE printers SET enabled = ?, updated_at = ? WHERE id = ?")
        .bind(enabled)
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(ServiceError::NotFound(format!("printer {id}")));
    }
    Ok(())
}

/// Delete a printer. Owned rows (printed files, jobs) go with it via
/// foreign-key cascade.
pub async fn delete(pool: &SqlitePool, id: &str) -> Result<()> {
    let result = sqlx::query("DELETE FROM printers WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    if result.rows_affected() == 0 {
        return Err(ServiceError::NotFound(format!("printer {id}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    fn bambu_input() -> PrinterInput {
        PrinterInput {
            name: "X1C".into(),
            kind: "bambu".into(),
            host: "192.168.1.50".into(),
            access_code: Some("12345678".into()),
            serial: Some("01S00C123400000".into()),
            api_key: None,
            webcam_url: None,
            enabled: true,
        }
    }

    #[tokio::test]
    async fn crud_roundtrip() {
        let pool = test_pool().await;
        let row = insert(&pool, "p1", &bambu_input()).await.unwrap();
        assert_eq!(row.kind, "bambu");
        assert_eq!(row.monitoring_state, "disconnected");

        set_monitoring_state(&pool, "p1", "connected").await.unwrap();
        let row = get(&pool, "p1").await.unwrap();
        assert_eq!(row.monitoring_state, "connected");

        delete(&pool, "p1").await.unwrap();
        assert!(matches!(
            get(&pool, "p1").await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn deleting_printer_cascades_to_files() {
        let pool = test_pool().await;
        insert(&pool, "p1", &bambu_input()).await.unwrap();
        crate::db::files::upsert_observed(&pool, "p1", "cube.3mf", 1234, Some("cache/cube.3mf"))
            .await
            .unwrap();

        delete(&pool, "p1").await.unwrap();
        let files = crate::db::files::list_for_printer(&pool, "p1").await.unwrap();
        assert!(files.is_empty());
    }
}
