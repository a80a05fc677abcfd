pub mod files;
pub mod jobs;
pub mod library;
pub mod printers;
pub mod webhooks;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

/// Open the SQLite pool, creating the database file if needed.
pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    Ok(pool)
}

/// Ordered schema migrations. Each entry is applied at most once; the
/// statements themselves tolerate re-runs ("already exists" and
/// "duplicate column" failures are ignored) so a partially recorded
/// migration is safe to repeat.
const MIGRATIONS: &[(i64, &[&str])] = &[
    (
        1,
        &[
            r#"
            CREATE TABLE IF NOT EXISTS printers (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                kind TEXT NOT NULL,
                host TEXT NOT NULL,
                access_code TEXT,
                serial TEXT,
                api_key TEXT,
                webcam_url TEXT,
                enabled INTEGER NOT NULL DEFAULT 1,
                monitoring_state TEXT NOT NULL DEFAULT 'disconnected',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS printed_files (
                id TEXT PRIMARY KEY,
                printer_id TEXT NOT NULL REFERENCES printers(id) ON DELETE CASCADE,
                filename TEXT NOT NULL,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                file_type TEXT NOT NULL DEFAULT 'unknown',
                download_status TEXT NOT NULL DEFAULT 'available',
                remote_path TEXT,
                modified_at INTEGER,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                UNIQUE (printer_id, filename)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                printer_id TEXT NOT NULL REFERENCES printers(id) ON DELETE CASCADE,
                filename TEXT,
                status TEXT NOT NULL,
                progress REAL,
                started_at INTEGER NOT NULL,
                finished_at INTEGER
            )
            "#,
        ],
    ),
    (
        2,
        &[
            r#"
            CREATE TABLE IF NOT EXISTS library_files (
                checksum TEXT PRIMARY KEY,
                filename TEXT NOT NULL,
                library_path TEXT NOT NULL,
                file_type TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                is_duplicate INTEGER NOT NULL DEFAULT 0,
                duplicate_of_checksum TEXT,
                duplicate_count INTEGER NOT NULL DEFAULT 0,
                sources TEXT NOT NULL DEFAULT '[]',
                error_message TEXT,
                added_at INTEGER NOT NULL,
                last_modified INTEGER NOT NULL,
                last_analyzed INTEGER
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS library_file_sources (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_checksum TEXT NOT NULL,
                source_kind TEXT NOT NULL,
                source_id TEXT NOT NULL,
                source_name TEXT,
                original_path TEXT,
                discovered_at INTEGER NOT NULL,
                UNIQUE (file_checksum, source_kind, source_id)
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_library_dup ON library_files(duplicate_of_checksum)",
        ],
    ),
    (
        3,
        &[
            "ALTER TABLE library_files ADD COLUMN model_width REAL",
            "ALTER TABLE library_files ADD COLUMN model_depth REAL",
            "ALTER TABLE library_files ADD COLUMN model_height REAL",
            "ALTER TABLE library_files ADD COLUMN model_volume REAL",
            "ALTER TABLE library_files ADD COLUMN surface_area REAL",
            "ALTER TABLE library_files ADD COLUMN object_count INTEGER",
            "ALTER TABLE library_files ADD COLUMN layer_height REAL",
            "ALTER TABLE library_files ADD COLUMN first_layer_height REAL",
            "ALTER TABLE library_files ADD COLUMN nozzle_diameter REAL",
            "ALTER TABLE library_files ADD COLUMN wall_count INTEGER",
            "ALTER TABLE library_files ADD COLUMN infill_density REAL",
            "ALTER TABLE library_files ADD COLUMN infill_pattern TEXT",
            "ALTER TABLE library_files ADD COLUMN support_used INTEGER",
            "ALTER TABLE library_files ADD COLUMN nozzle_temperature INTEGER",
            "ALTER TABLE library_files ADD COLUMN bed_temperature INTEGER",
            "ALTER TABLE library_files ADD COLUMN print_speed REAL",
            "ALTER TABLE library_files ADD COLUMN total_layer_count INTEGER",
            "ALTER TABLE library_files ADD COLUMN total_weight REAL",
            "ALTER TABLE library_files ADD COLUMN filament_length REAL",
            "ALTER TABLE library_files ADD COLUMN material_types TEXT",
            "ALTER TABLE library_files ADD COLUMN filament_colors TEXT",
            "ALTER TABLE library_files ADD COLUMN primary_color TEXT",
            "ALTER TABLE library_files ADD COLUMN color_display TEXT",
            "ALTER TABLE library_files ADD COLUMN compatible_printers TEXT",
            "ALTER TABLE library_files ADD COLUMN slicer_name TEXT",
            "ALTER TABLE library_files ADD COLUMN slicer_version TEXT",
            "ALTER TABLE library_files ADD COLUMN bed_type TEXT",
            "ALTER TABLE library_files ADD COLUMN complexity_score INTEGER",
            "ALTER TABLE library_files ADD COLUMN difficulty_level TEXT",
            "ALTER TABLE library_files ADD COLUMN thumbnail BLOB",
            "ALTER TABLE library_files ADD COLUMN thumbnail_width INTEGER",
            "ALTER TABLE library_files ADD COLUMN thumbnail_height INTEGER",
        ],
    ),
    (
        4,
        &[
            r#"
            CREATE TABLE IF NOT EXISTS webhook_deliveries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                channel TEXT NOT NULL,
                event_type TEXT NOT NULL,
                success INTEGER NOT NULL,
                error TEXT,
                delivered_at INTEGER NOT NULL
            )
            "#,
        ],
    ),
];

fn is_ignorable_migration_error(err: &sqlx::Error) -> bool {
    let text = err.to_string();
    text.contains("already exists") || text.contains("duplicate column")
}

/// Run pending migrations in order. Idempotent.
pub async fn migrate(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            applied_at INTEGER NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    for (version, statements) in MIGRATIONS {
        let applied: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM schema_migrations WHERE version = ?")
                .bind(version)
                .fetch_optional(pool)
                .await?;
        if applied.is_some() {
            continue;
        }

        tracing::info!(version, "applying schema migration");
        for statement in *statements {
            if let Err(e) = sqlx::query(statement).execute(pool).await {
                if is_ignorable_migration_error(&e) {
                    tracing::debug!(version, error = %e, "ignoring idempotent migration error");
                } else {
                    return Err(e.into());
                }
            }
        }

        sqlx::query("INSERT INTO schema_migrations (version, applied_at) VALUES (?, ?)")
            .bind(version)
            .bind(chrono::Utc::now().timestamp())
            .execute(pool)
            .await?;
    }

    Ok(())
}

/// Whether a sqlx error is a uniqueness violation. The library engine
/// relies on this as a first-class signal for concurrent-ingest races.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            db.kind() == sqlx::error::ErrorKind::UniqueViolation
        }
        _ => false,
    }
}

/// In-memory pool for tests. Single connection: each `:memory:`
/// connection is its own database.
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("in-memory pool");
    migrate(&pool).await.expect("migrations");
    pool
}
