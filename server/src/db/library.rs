use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::error::{Result, ServiceError};

/// A content-addressed library entry. For duplicate rows the primary-key
/// column holds a synthetic `<checksum>-<uuid>` value so one SHA-256 can
/// have several rows; the real hash is always in `duplicate_of_checksum`.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LibraryFileRow {
    pub checksum: String,
    pub filename: String,
    pub library_path: String,
    pub file_type: String,
    pub size_bytes: i64,
    pub status: String,
    pub is_duplicate: bool,
    pub duplicate_of_checksum: Option<String>,
    pub duplicate_count: i64,
    pub sources: String,
    pub error_message: Option<String>,
    pub added_at: i64,
    pub last_modified: i64,
    pub last_analyzed: Option<i64>,

    pub model_width: Option<f64>,
    pub model_depth: Option<f64>,
    pub model_height: Option<f64>,
    pub model_volume: Option<f64>,
    pub surface_area: Option<f64>,
    pub object_count: Option<i64>,
    pub layer_height: Option<f64>,
    pub first_layer_height: Option<f64>,
    pub nozzle_diameter: Option<f64>,
    pub wall_count: Option<i64>,
    pub infill_density: Option<f64>,
    pub infill_pattern: Option<String>,
    pub support_used: Option<bool>,
    pub nozzle_temperature: Option<i64>,
    pub bed_temperature: Option<i64>,
    pub print_speed: Option<f64>,
    pub total_layer_count: Option<i64>,
    pub total_weight: Option<f64>,
    pub filament_length: Option<f64>,
    pub material_types: Option<String>,
    pub filament_colors: Option<String>,
    pub primary_color: Option<String>,
    pub color_display: Option<String>,
    pub compatible_printers: Option<String>,
    pub slicer_name: Option<String>,
    pub slicer_version: Option<String>,
    pub bed_type: Option<String>,
    pub complexity_score: Option<i64>,
    pub difficulty_level: Option<String>,

    #[serde(skip)]
    pub thumbnail: Option<Vec<u8>>,
    pub thumbnail_width: Option<i64>,
    pub thumbnail_height: Option<i64>,
}

/// Normalized metadata written back by the extraction pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NormalizedMetadata {
    pub width_mm: Option<f64>,
    pub depth_mm: Option<f64>,
    pub height_mm: Option<f64>,
    pub volume_cm3: Option<f64>,
    pub surface_area_cm2: Option<f64>,
    pub object_count: Option<i64>,

    pub layer_height_mm: Option<f64>,
    pub first_layer_height_mm: Option<f64>,
    pub nozzle_diameter_mm: Option<f64>,
    pub wall_count: Option<i64>,
    pub infill_density_pct: Option<f64>,
    pub infill_pattern: Option<String>,
    pub support_used: Option<bool>,
    pub nozzle_temp_c: Option<i64>,
    pub bed_temp_c: Option<i64>,
    pub print_speed_mm_s: Option<f64>,
    pub total_layer_count: Option<i64>,

    pub total_weight_g: Option<f64>,
    pub filament_length_m: Option<f64>,
    pub material_types: Vec<String>,
    pub filament_colors: Vec<String>,
    pub primary_color: Option<String>,
    pub color_display: Option<String>,

    pub compatible_printers: Vec<String>,
    pub slicer_name: Option<String>,
    pub slicer_version: Option<String>,
    pub bed_type: Option<String>,

    pub complexity_score: Option<i64>,
    pub difficulty_level: Option<String>,
}

/// An extracted embedded thumbnail.
#[derive(Debug, Clone)]
pub struct Thumbnail {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

/// One provenance record for a library file.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct FileSourceRow {
    pub id: i64,
    pub file_checksum: String,
    pub source_kind: String,
    pub source_id: String,
    pub source_name: Option<String>,
    pub original_path: Option<String>,
    pub discovered_at: i64,
}

/// New-row fields for an insert.
#[derive(Debug, Clone)]
pub struct NewLibraryFile {
    pub checksum: String,
    pub filename: String,
    pub library_path: String,
    pub file_type: String,
    pub size_bytes: i64,
    pub is_duplicate: bool,
    pub duplicate_of_checksum: String,
}

/// Provenance fields for one source append.
#[derive(Debug, Clone)]
pub struct NewFileSource {
    pub kind: String,
    pub source_id: String,
    pub source_name: Option<String>,
    pub original_path: Option<String>,
}

/// Serialized form of the junction rows, kept on the row itself so a
/// single `LibraryFileRow` read carries complete provenance.
fn sources_json(rows: &[FileSourceRow]) -> String {
    let list: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            serde_json::json!({
                "kind": row.source_kind,
                "source_id": row.source_id,
                "source_name": row.source_name,
                "original_path": row.original_path,
                "discovered_at": chrono::DateTime::from_timestamp(row.discovered_at, 0)
                    .map(|t| t.to_rfc3339()),
            })
        })
        .collect();
    serde_json::to_string(&list).unwrap_or_else(|_| "[]".to_string())
}

async fn insert_source_tx(
    conn: &mut sqlx::SqliteConnection,
    checksum: &str,
    source: &NewFileSource,
) -> std::result::Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT OR IGNORE INTO library_file_sources (
            file_checksum, source_kind, source_id, source_name,
            original_path, discovered_at
        ) VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(checksum)
    .bind(&source.kind)
    .bind(&source.source_id)
    .bind(&source.source_name)
    .bind(&source.original_path)
    .bind(chrono::Utc::now().timestamp())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Rebuild the denormalized `sources` column from the junction rows.
async fn refresh_sources_column(
    conn: &mut sqlx::SqliteConnection,
    checksum: &str,
) -> std::result::Result<(), sqlx::Error> {
    let rows = sqlx::query_as::<_, FileSourceRow>(
        "SELECT * FROM library_file_sources WHERE file_checksum = ? ORDER BY id",
    )
    .bind(checksum)
    .fetch_all(&mut *conn)
    .await?;

    sqlx::query("UPDATE library_files SET sources = ? WHERE checksum = ?")
        .bind(sources_json(&rows))
        .bind(checksum)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Insert a library row together with its first provenance record, in
/// one transaction: a row never exists without a matching source.
/// Uniqueness violations propagate unchanged so the caller can resolve
/// concurrent-ingest races.
pub async fn insert_with_source(
    pool: &SqlitePool,
    row: &NewLibraryFile,
    source: &NewFileSource,
) -> std::result::Result<(), sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        INSERT INTO library_files (
            checksum, filename, library_path, file_type, size_bytes,
            status, is_duplicate, duplicate_of_checksum, duplicate_count,
            sources, added_at, last_modified
        ) VALUES (?, ?, ?, ?, ?, 'pending', ?, ?, 0, '[]', ?, ?)
        "#,
    )
    .bind(&row.checksum)
    .bind(&row.filename)
    .bind(&row.library_path)
    .bind(&row.file_type)
    .bind(row.size_bytes)
    .bind(row.is_duplicate)
    .bind(&row.duplicate_of_checksum)
    .bind(now)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    insert_source_tx(&mut tx, &row.checksum, source).await?;
    refresh_sources_column(&mut tx, &row.checksum).await?;

    tx.commit().await?;
    Ok(())
}

/// Look up the canonical (non-duplicate) row for a content hash.
pub async fn get_by_checksum(pool: &SqlitePool, checksum: &str) -> Result<Option<LibraryFileRow>> {
    Ok(sqlx::query_as::<_, LibraryFileRow>(
        "SELECT * FROM library_files WHERE checksum = ?",
    )
    .bind(checksum)
    .fetch_optional(pool)
    .await?)
}

/// Look up a library entry by display filename, canonical rows first.
/// Used to resolve a printer's current job against the library.
pub async fn get_by_filename(pool: &SqlitePool, filename: &str) -> Result<Option<LibraryFileRow>> {
    Ok(sqlx::query_as::<_, LibraryFileRow>(
        "SELECT * FROM library_files WHERE filename = ? ORDER BY is_duplicate, added_at LIMIT 1",
    )
    .bind(filename)
    .fetch_optional(pool)
    .await?)
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LibraryFilter {
    pub file_type: Option<String>,
    pub status: Option<String>,
    pub search: Option<String>,
    pub include_duplicates: Option<bool>,
}

pub async fn list(
    pool: &SqlitePool,
    filter: &LibraryFilter,
    limit: i64,
    offset: i64,
) -> Result<Vec<LibraryFileRow>> {
    let mut sql = String::from("SELECT * FROM library_files WHERE 1=1");
    let mut bindings: Vec<String> = Vec::new();

    if let Some(file_type) = &filter.file_type {
        sql.push_str(" AND file_type = ?");
        bindings.push(file_type.clone());
    }
    if let Some(status) = &filter.status {
        sql.push_str(" AND status = ?");
        bindings.push(status.clone());
    }
    if let Some(search) = &filter.search {
        sql.push_str(" AND filename LIKE ?");
        bindings.push(format!("%{search}%"));
    }
    if !filter.include_duplicates.unwrap_or(true) {
        sql.push_str(" AND is_duplicate = 0");
    }
    sql.push_str(" ORDER BY added_at DESC LIMIT ? OFFSET ?");

    let mut query = sqlx::query_as::<_, LibraryFileRow>(&sql);
    for binding in &bindings {
        query = query.bind(binding);
    }
    Ok(query.bind(limit).bind(offset).fetch_all(pool).await?)
}

pub async fn set_status(pool: &SqlitePool, checksum: &str, status: &str) -> Result<()> {
    sqlx::query("UPDATE library_files SET status = ? WHERE checksum = ?")
        .bind(status)
        .bind(checksum)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_error(pool: &SqlitePool, checksum: &str, message: &str) -> Result<()> {
    sqlx::query(
        "UPDATE library_files SET status = 'error', error_message = ?, last_analyzed = ? WHERE checksum = ?",
    )
    .bind(message)
    .bind(chrono::Utc::now().timestamp())
    .bind(checksum)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn increment_duplicate_count(pool: &SqlitePool, checksum: &str) -> Result<()> {
    sqlx::query(
        "UPDATE library_files SET duplicate_count = duplicate_count + 1 WHERE checksum = ?",
    )
    .bind(checksum)
    .execute(pool)
    .await?;
    Ok(())
}

/// Write extracted metadata and flip the row to `ready` in one
/// transaction.
pub async fn apply_metadata(
    pool: &SqlitePool,
    checksum: &str,
    meta: &NormalizedMetadata,
    thumbnail: Option<&Thumbnail>,
) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE library_files SET
            model_width = ?, model_depth = ?, model_height = ?,
            model_volume = ?, surface_area = ?, object_count = ?,
            layer_height = ?, first_layer_height = ?, nozzle_diameter = ?,
            wall_count = ?, infill_density = ?, infill_pattern = ?,
            support_used = ?, nozzle_temperature = ?, bed_temperature = ?,
            print_speed = ?, total_layer_count = ?,
            total_weight = ?, filament_length = ?, material_types = ?,
            filament_colors = ?, primary_color = ?, color_display = ?,
            compatible_printers = ?, slicer_name = ?, slicer_version = ?,
            bed_type = ?, complexity_score = ?, difficulty_level = ?,
            status = 'ready', error_message = NULL, last_analyzed = ?
        WHERE checksum = ?
        "#,
    )
    .bind(meta.width_mm)
    .bind(meta.depth_mm)
    .bind(meta.height_mm)
    .bind(meta.volume_cm3)
    .bind(meta.surface_area_cm2)
    .bind(meta.object_count)
    .bind(meta.layer_height_mm)
    .bind(meta.first_layer_height_mm)
    .bind(meta.nozzle_diameter_mm)
    .bind(meta.wall_count)
    .bind(meta.infill_density_pct)
    .bind(&meta.infill_pattern)
    .bind(meta.support_used)
    .bind(meta.nozzle_temp_c)
    .bind(meta.bed_temp_c)
    .bind(meta.print_speed_mm_s)
    .bind(meta.total_layer_count)
    .bind(meta.total_weight_g)
    .bind(meta.filament_length_m)
    .bind(json_list(&meta.material_types))
    .bind(json_list(&meta.filament_colors))
    .bind(&meta.primary_color)
    .bind(&meta.color_display)
    .bind(json_list(&meta.compatible_printers))
    .bind(&meta.slicer_name)
    .bind(&meta.slicer_version)
    .bind(&meta.bed_type)
    .bind(meta.complexity_score)
    .bind(&meta.difficulty_level)
    .bind(chrono::Utc::now().timestamp())
    .bind(checksum)
    .execute(&mut *tx)
    .await?;

    if let Some(thumb) = thumbnail {
        sqlx::query(
            "UPDATE library_files SET thumbnail = ?, thumbnail_width = ?, thumbnail_height = ? WHERE checksum = ?",
        )
        .bind(&thumb.png)
        .bind(thumb.width as i64)
        .bind(thumb.height as i64)
        .bind(checksum)
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

fn json_list(values: &[String]) -> Option<String> {
    if values.is_empty() {
        None
    } else {
        serde_json::to_string(values).ok()
    }
}

/// Append a provenance record and mirror it into the row's `sources`
/// column, in one transaction. A `{checksum, source identity}` pair is
/// recorded at most once.
pub async fn add_source(pool: &SqlitePool, checksum: &str, source: &NewFileSource) -> Result<()> {
    let mut tx = pool.begin().await?;
    insert_source_tx(&mut tx, checksum, source).await?;
    refresh_sources_column(&mut tx, checksum).await?;
    tx.commit().await?;
    Ok(())
}

pub async fn sources_for(pool: &SqlitePool, checksum: &str) -> Result<Vec<FileSourceRow>> {
    Ok(sqlx::query_as::<_, FileSourceRow>(
        "SELECT * FROM library_file_sources WHERE file_checksum = ? ORDER BY id",
    )
    .bind(checksum)
    .fetch_all(pool)
    .await?)
}

pub async fn delete(pool: &SqlitePool, checksum: &str) -> Result<LibraryFileRow> {
    let row = get_by_checksum(pool, checksum)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("library file {checksum}")))?;

    let mut tx = pool.begin().await?;
    sqlx::query("DELETE FROM library_files WHERE checksum = ?")
        .bind(checksum)
        .execute(&mut *tx)
        .await?;
    sqlx::query("DELETE FROM library_file_sources WHERE file_checksum = ?")
        .bind(checksum)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(row)
}

/// Rows pointing at a canonical checksum (invariant check support).
pub async fn duplicates_of(pool: &SqlitePool, checksum: &str) -> Result<Vec<LibraryFileRow>> {
    Ok(sqlx::query_as::<_, LibraryFileRow>(
        "SELECT * FROM library_files WHERE duplicate_of_checksum = ? AND is_duplicate = 1",
    )
    .bind(checksum)
    .fetch_all(pool)
    .await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    fn new_row(checksum: &str) -> NewLibraryFile {
        NewLibraryFile {
            checksum: checksum.to_string(),
            filename: "part.3mf".into(),
            library_path: "uploads/part.3mf".into(),
            file_type: "3mf".into(),
            size_bytes: 10,
            is_duplicate: false,
            duplicate_of_checksum: checksum.to_string(),
        }
    }

    fn printer_source(id: &str) -> NewFileSource {
        NewFileSource {
            kind: "printer".into(),
            source_id: id.to_string(),
            source_name: Some("X1C".into()),
            original_path: Some("cache/part.3mf".into()),
        }
    }

    #[tokio::test]
    async fn insert_writes_row_and_first_source_together() {
        let pool = test_pool().await;
        let checksum = "c".repeat(64);
        insert_with_source(&pool, &new_row(&checksum), &printer_source("p1"))
            .await
            .unwrap();

        let row = get_by_checksum(&pool, &checksum).await.unwrap().unwrap();
        let junction = sources_for(&pool, &checksum).await.unwrap();
        assert_eq!(junction.len(), 1);

        // The denormalized column mirrors the junction table.
        let listed: Vec<serde_json::Value> = serde_json::from_str(&row.sources).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["kind"], "printer");
        assert_eq!(listed[0]["source_id"], "p1");
        assert_eq!(listed[0]["original_path"], "cache/part.3mf");
        assert!(listed[0]["discovered_at"].is_string());
    }

    #[tokio::test]
    async fn add_source_keeps_the_sources_column_in_sync() {
        let pool = test_pool().await;
        let checksum = "d".repeat(64);
        insert_with_source(&pool, &new_row(&checksum), &printer_source("p1"))
            .await
            .unwrap();

        add_source(&pool, &checksum, &printer_source("p2")).await.unwrap();

        let row = get_by_checksum(&pool, &checksum).await.unwrap().unwrap();
        let listed: Vec<serde_json::Value> = serde_json::from_str(&row.sources).unwrap();
        assert_eq!(listed.len(), 2);
        // Junction order is preserved in the column.
        assert_eq!(listed[0]["source_id"], "p1");
        assert_eq!(listed[1]["source_id"], "p2");
        assert_eq!(sources_for(&pool, &checksum).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn repeated_source_identity_is_recorded_once() {
        let pool = test_pool().await;
        let checksum = "e".repeat(64);
        insert_with_source(&pool, &new_row(&checksum), &printer_source("p1"))
            .await
            .unwrap();

        add_source(&pool, &checksum, &printer_source("p1")).await.unwrap();

        let row = get_by_checksum(&pool, &checksum).await.unwrap().unwrap();
        let listed: Vec<serde_json::Value> = serde_json::from_str(&row.sources).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(sources_for(&pool, &checksum).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_key_insert_leaves_no_partial_source_rows() {
        let pool = test_pool().await;
        let checksum = "f".repeat(64);
        insert_with_source(&pool, &new_row(&checksum), &printer_source("p1"))
            .await
            .unwrap();

        let err = insert_with_source(&pool, &new_row(&checksum), &printer_source("p2"))
            .await
            .unwrap_err();
        assert!(crate::db::is_unique_violation(&err));

        // The losing transaction rolled back: the winner's provenance is
        // untouched and nothing from the loser leaked in.
        let junction = sources_for(&pool, &checksum).await.unwrap();
        assert_eq!(junction.len(), 1);
        assert_eq!(junction[0].source_id, "p1");
    }
}
