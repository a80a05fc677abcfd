use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct JobRow {
    pub id: String,
    pub printer_id: String,
    pub filename: Option<String>,
    pub status: String,
    pub progress: Option<f64>,
    pub started_at: i64,
    pub finished_at: Option<i64>,
}

/// Open a job record when a print starts.
pub async fn start(pool: &SqlitePool, printer_id: &str, filename: Option<&str>) -> Result<JobRow> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO jobs (id, printer_id, filename, status, started_at) VALUES (?, ?, ?, 'running', ?)",
    )
    .bind(&id)
    .bind(printer_id)
    .bind(filename)
    .bind(chrono::Utc::now().timestamp())
    .execute(pool)
    .await?;

    Ok(sqlx::query_as::<_, JobRow>("SELECT * FROM jobs WHERE id = ?")
        .bind(&id)
        .fetch_one(pool)
        .await?)
}

pub async fn update_progress(pool: &SqlitePool, id: &str, progress: f64) -> Result<()> {
    sqlx::query("UPDATE jobs SET progress = ? WHERE id = ?")
        .bind(progress)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Close a job with a terminal status (`completed`, `failed`, `stopped`).
pub async fn finish(pool: &SqlitePool, id: &str, status: &str) -> Result<()> {
    sqlx::query("UPDATE jobs SET status = ?, finished_at = ? WHERE id = ?")
        .bind(status)
        .bind(chrono::Utc::now().timestamp())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// The most recent still-running job for a printer, if any.
pub async fn current_for_printer(pool: &SqlitePool, printer_id: &str) -> Result<Option<JobRow>> {
    Ok(sqlx::query_as::<_, JobRow>(
        "SELECT * FROM jobs WHERE printer_id = ? AND status = 'running' ORDER BY started_at DESC LIMIT 1",
    )
    .bind(printer_id)
    .fetch_optional(pool)
    .await?)
}

pub async fn list_for_printer(pool: &SqlitePool, printer_id: &str) -> Result<Vec<JobRow>> {
    Ok(sqlx::query_as::<_, JobRow>(
        "SELECT * FROM jobs WHERE printer_id = ? ORDER BY started_at DESC",
    )
    .bind(printer_id)
    .fetch_all(pool)
    .await?)
}
