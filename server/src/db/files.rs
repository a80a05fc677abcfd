use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{Result, ServiceError};

/// A file observed on one printer's storage. Owned by the printer.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PrintedFileRow {
    pub id: String,
    pub printer_id: String,
    pub filename: String,
    pub size_bytes: i64,
    pub file_type: String,
    pub download_status: String,
    pub remote_path: Option<String>,
    pub modified_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

pub fn file_type_for(filename: &str) -> &'static str {
    let ext = filename.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "3mf" => "3mf",
        "stl" => "stl",
        "obj" => "obj",
        "gcode" => "gcode",
        "bgcode" => "bgcode",
        "ply" => "ply",
        "jpg" | "jpeg" | "png" => "image",
        "mp4" | "avi" => "video",
        _ => "unknown",
    }
}

/// Record a file seen during inventory refresh. Re-observing an existing
/// file updates size and timestamps but keeps its download status.
pub async fn upsert_observed(
    pool: &SqlitePool,
    printer_id: &str,
    filename: &str,
    size_bytes: i64,
    remote_path: Option<&str>,
) -> Result<PrintedFileRow> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        r#"
        INSERT INTO printed_files (
            id, printer_id, filename, size_bytes, file_type,
            download_status, remote_path, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, 'available', ?, ?, ?)
        ON CONFLICT (printer_id, filename) DO UPDATE SET
            size_bytes = excluded.size_bytes,
            remote_path = excluded.remote_path,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(Uuid::new_v4().to_string())
    .bind(printer_id)
    .bind(filename)
    .bind(size_bytes)
    .bind(file_type_for(filename))
    .bind(remote_path)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    get_by_name(pool, printer_id, filename).await
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<PrintedFileRow> {
    sqlx::query_as::<_, PrintedFileRow>("SELECT * FROM printed_files WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("printed file {id}")))
}

pub async fn get_by_name(
    pool: &SqlitePool,
    printer_id: &str,
    filename: &str,
) -> Result<PrintedFileRow> {
    sqlx::query_as::<_, PrintedFileRow>(
        "SELECT * FROM printed_files WHERE printer_id = ? AND filename = ?",
    )
    .bind(printer_id)
    .bind(filename)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| ServiceError::NotFound(format!("file {filename} on {printer_id}")))
}

pub async fn list_for_printer(pool: &SqlitePool, printer_id: &str) -> Result<Vec<PrintedFileRow>> {
    Ok(sqlx::query_as::<_, PrintedFileRow>(
        "SELECT * FROM printed_files WHERE printer_id = ? ORDER BY filename",
    )
    .bind(printer_id)
    .fetch_all(pool)
    .await?)
}

pub async fn set_download_status(pool: &SqlitePool, id: &str, status: &str) -> Result<()> {
    sqlx::query("UPDATE printed_files SET download_status = ?, updated_at = ? WHERE id = ?")
        .bind(status)
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::printers::{self, PrinterInput};
    use crate::db::test_pool;

    #[tokio::test]
    async fn observing_twice_keeps_one_row() {
        let pool = test_pool().await;
        printers::insert(
            &pool,
            "p1",
            &PrinterInput {
                name: "MK4".into(),
                kind: "prusa".into(),
                host: "http://192.168.1.60".into(),
                access_code: None,
                serial: None,
                api_key: Some("key".into()),
                webcam_url: None,
                enabled: true,
            },
        )
        .await
        .unwrap();

        let first = upsert_observed(&pool, "p1", "benchy.gcode", 100, None)
            .await
            .unwrap();
        let second = upsert_observed(&pool, "p1", "benchy.gcode", 200, None)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.size_bytes, 200);
        assert_eq!(second.file_type, "gcode");

        let all = list_for_printer(&pool, "p1").await.unwrap();
        assert_eq!(all.len(), 1);
    }
}
