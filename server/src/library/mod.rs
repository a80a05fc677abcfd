//! Unified file library.
//!
//! Every file observed by a driver, dropped into a watch folder, or
//! uploaded lands here, stored content-addressed under the library root
//! with SHA-256 deduplication and durable provenance records.

pub mod checksum;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::config::Config;
use crate::db::{self, library::LibraryFileRow, library::NewLibraryFile};
use crate::error::{Result, ServiceError};
use crate::events::{EventBus, EventType};
use crate::metadata::ExtractionQueue;

/// Where an ingested file came from.
#[derive(Debug, Clone, PartialEq)]
pub enum FileSource {
    Printer { id: String, name: String },
    WatchFolder { folder: String },
    Upload,
}

impl FileSource {
    pub fn kind(&self) -> &'static str {
        match self {
            FileSource::Printer { .. } => "printer",
            FileSource::WatchFolder { .. } => "watch_folder",
            FileSource::Upload => "upload",
        }
    }

    fn source_id(&self) -> String {
        match self {
            FileSource::Printer { id, .. } => id.clone(),
            FileSource::WatchFolder { folder } => folder.clone(),
            FileSource::Upload => "upload".to_string(),
        }
    }

    fn source_name(&self) -> Option<String> {
        match self {
            FileSource::Printer { name, .. } => Some(name.clone()),
            FileSource::WatchFolder { folder } => Some(folder.clone()),
            FileSource::Upload => None,
        }
    }

    fn record(&self, original_path: &str) -> db::library::NewFileSource {
        db::library::NewFileSource {
            kind: self.kind().to_string(),
            source_id: self.source_id(),
            source_name: self.source_name(),
            original_path: Some(original_path.to_string()),
        }
    }
}

/// Whether the source file is copied into the library or moved there.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestMode {
    Copy,
    Move,
}

/// Free space must exceed the file size by this factor before ingest.
const FREE_SPACE_FACTOR: f64 = 1.5;
/// Conflict suffixes are tried up to `_1000`, then the ingest aborts.
const MAX_CONFLICT_SUFFIX: u32 = 1000;

enum Placement {
    /// Copy/move into this free path.
    Place(PathBuf),
    /// An identical-content file already sits at this path; reuse it.
    Share(PathBuf),
}

pub struct LibraryService {
    pool: SqlitePool,
    bus: Arc<EventBus>,
    root: PathBuf,
    enabled: bool,
    preserve_originals: bool,
    extraction: ExtractionQueue,
}

impl LibraryService {
    pub fn new(
        pool: SqlitePool,
        bus: Arc<EventBus>,
        config: &Config,
        extraction: ExtractionQueue,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            bus,
            root: config.library_path.clone(),
            enabled: config.library_enabled,
            preserve_originals: config.library_preserve_originals,
            extraction,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Whether watch-folder sources keep their original file.
    pub fn watch_folder_mode(&self) -> IngestMode {
        if self.preserve_originals {
            IngestMode::Copy
        } else {
            IngestMode::Move
        }
    }

    /// Create the on-disk folder layout and verify it is writable.
    pub async fn initialize(&self) -> Result<()> {
        if !self.enabled {
            tracing::info!("library disabled");
            return Ok(());
        }
        for sub in [
            "models",
            "printers",
            "uploads",
            ".metadata/thumbnails",
            ".metadata/preview-cache",
        ] {
            tokio::fs::create_dir_all(self.root.join(sub)).await?;
        }

        let probe = self.root.join(".write_test");
        tokio::fs::write(&probe, b"test").await?;
        tokio::fs::remove_file(&probe).await?;
        tracing::info!(root = %self.root.display(), "library initialized");
        Ok(())
    }

    fn natural_path(&self, source: &FileSource, filename: &str) -> PathBuf {
        match source {
            FileSource::WatchFolder { .. } => self.root.join("models").join(filename),
            FileSource::Printer { name, .. } => self
                .root
                .join("printers")
                .join(sanitize_component(name))
                .join(filename),
            FileSource::Upload => self.root.join("uploads").join(filename),
        }
    }

    /// Resolve where the content should live. Walks the `_N` suffix
    /// chain; an existing file with identical content short-circuits to
    /// sharing, so re-ingesting the same bytes never multiplies copies.
    async fn resolve_placement(&self, desired: &Path, checksum: &str) -> Result<Placement> {
        let stem = desired
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("file")
            .to_string();
        let extension = desired
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{e}"))
            .unwrap_or_default();
        let parent = desired.parent().unwrap_or(Path::new(".")).to_path_buf();

        for counter in 0..=MAX_CONFLICT_SUFFIX {
            let candidate = if counter == 0 {
                desired.to_path_buf()
            } else {
                parent.join(format!("{stem}_{counter}{extension}"))
            };
            if !tokio::fs::try_exists(&candidate).await? {
                if counter > 0 {
                    tracing::info!(
                        original = %desired.display(),
                        resolved = %candidate.display(),
                        "resolved filename conflict"
                    );
                }
                return Ok(Placement::Place(candidate));
            }
            if checksum::sha256_file(&candidate).await.ok().as_deref() == Some(checksum) {
                return Ok(Placement::Share(candidate));
            }
        }

        Err(ServiceError::Integrity(format!(
            "too many filename conflicts for {}",
            desired.display()
        )))
    }

    async fn check_free_space(&self, size: u64) -> Result<()> {
        let root = self.root.clone();
        let free = tokio::task::spawn_blocking(move || {
            nix::sys::statvfs::statvfs(root.as_path())
                .map(|vfs| vfs.blocks_available() as u64 * vfs.fragment_size() as u64)
        })
        .await
        .map_err(|e| ServiceError::Integrity(format!("statvfs task: {e}")))?
        .map_err(|e| ServiceError::Io(std::io::Error::other(e)))?;

        let required = (size as f64 * FREE_SPACE_FACTOR) as u64;
        if free < required {
            return Err(ServiceError::InsufficientSpace { required, free });
        }
        Ok(())
    }

    /// Ingest a file into the library.
    ///
    /// A failed ingest leaves no partial physical file behind, and
    /// `library_file_added` fires at most once per inserted row.
    pub async fn add_file(
        &self,
        source_path: &Path,
        source: FileSource,
        mode: IngestMode,
    ) -> Result<LibraryFileRow> {
        if !self.enabled {
            return Err(ServiceError::Config("library is disabled".into()));
        }
        if !tokio::fs::try_exists(source_path).await? {
            return Err(ServiceError::NotFound(format!(
                "source file {}",
                source_path.display()
            )));
        }

        let filename = source_path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| ServiceError::Config("source path has no filename".into()))?
            .to_string();

        tracing::info!(file = %source_path.display(), "calculating checksum");
        let content_hash = checksum::sha256_file(source_path).await?;

        let canonical = db::library::get_by_checksum(&self.pool, &content_hash).await?;
        let is_duplicate = canonical.is_some();
        if let Some(existing) = &canonical {
            tracing::info!(
                checksum = &content_hash[..16],
                original = %existing.filename,
                "duplicate content detected"
            );
        }

        let size = tokio::fs::metadata(source_path).await?.len();
        self.check_free_space(size).await?;

        let desired = self.natural_path(&source, &filename);
        if let Some(parent) = desired.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let (library_path, placed) =
            match self.resolve_placement(&desired, &content_hash).await? {
                Placement::Place(path) => {
                    place_file(source_path, &path, mode).await?;
                    // Verify the copy before anything references it.
                    let verify = checksum::sha256_file(&path).await?;
                    if verify != content_hash {
                        let _ = tokio::fs::remove_file(&path).await;
                        return Err(ServiceError::Integrity(format!(
                            "checksum mismatch after copy: {verify} != {content_hash}"
                        )));
                    }
                    (path, true)
                }
                Placement::Share(path) => {
                    tracing::debug!(
                        path = %path.display(),
                        "identical content already stored, sharing"
                    );
                    if mode == IngestMode::Move {
                        let _ = tokio::fs::remove_file(source_path).await;
                    }
                    (path, false)
                }
            };

        // Duplicate rows get a synthetic primary key so one SHA-256 can
        // have several rows; the canonical row keys on the real hash.
        let row_key = if is_duplicate {
            format!("{content_hash}-{}", Uuid::new_v4())
        } else {
            content_hash.clone()
        };

        let relative = library_path
            .strip_prefix(&self.root)
            .unwrap_or(&library_path)
            .to_string_lossy()
            .to_string();
        let stored_name = library_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(&filename)
            .to_string();
        let original_path = source_path.to_string_lossy().to_string();

        let new_row = NewLibraryFile {
            checksum: row_key.clone(),
            filename: stored_name,
            library_path: relative,
            file_type: db::files::file_type_for(&filename).to_string(),
            size_bytes: size as i64,
            is_duplicate,
            duplicate_of_checksum: content_hash.clone(),
        };

        // Row and first provenance record land in one transaction.
        let source_record = source.record(&original_path);
        if let Err(e) = db::library::insert_with_source(&self.pool, &new_row, &source_record).await
        {
            if db::is_unique_violation(&e) {
                // Lost a concurrent-ingest race for the same new hash:
                // another task inserted the canonical row first.
                return self
                    .resolve_insert_race(
                        &content_hash,
                        &library_path,
                        &new_row.library_path,
                        placed,
                        &source_record,
                    )
                    .await;
            }
            if placed {
                let _ = tokio::fs::remove_file(&library_path).await;
            }
            return Err(e.into());
        }

        if is_duplicate {
            db::library::increment_duplicate_count(&self.pool, &content_hash).await?;
        }

        tracing::info!(
            checksum = &content_hash[..16],
            path = %library_path.display(),
            is_duplicate,
            "file added to library"
        );

        self.bus.publish(
            EventType::LibraryFileAdded,
            serde_json::json!({
                "checksum": row_key,
                "content_checksum": content_hash,
                "filename": filename,
                "size_bytes": size,
                "source_kind": source.kind(),
                "is_duplicate": is_duplicate,
            }),
        );

        self.extraction.enqueue(&row_key, &library_path).await;

        db::library::get_by_checksum(&self.pool, &row_key)
            .await?
            .ok_or_else(|| ServiceError::Integrity("row vanished after insert".into()))
    }

    /// Two ingests raced on the same new content hash: keep the winner's
    /// row, drop our physical copy, record our source on the canonical.
    async fn resolve_insert_race(
        &self,
        content_hash: &str,
        library_path: &Path,
        relative_path: &str,
        placed: bool,
        source: &db::library::NewFileSource,
    ) -> Result<LibraryFileRow> {
        let canonical = db::library::get_by_checksum(&self.pool, content_hash)
            .await?
            .ok_or_else(|| {
                ServiceError::Integrity(format!(
                    "duplicate key for {content_hash} but no canonical row"
                ))
            })?;

        tracing::info!(
            checksum = &content_hash[..16],
            "concurrent ingest detected, merging into canonical row"
        );

        if placed && canonical.library_path != relative_path {
            let _ = tokio::fs::remove_file(library_path).await;
        }

        db::library::add_source(&self.pool, content_hash, source).await?;

        // Re-read so the returned row reflects the appended source.
        db::library::get_by_checksum(&self.pool, content_hash)
            .await?
            .ok_or_else(|| ServiceError::Integrity("canonical row vanished during merge".into()))
    }

    /// Remove a library entry. The physical file goes too unless another
    /// row still references the same path.
    pub async fn delete_file(&self, row_key: &str, delete_physical: bool) -> Result<()> {
        let row = db::library::delete(&self.pool, row_key).await?;

        if delete_physical {
            let references: (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM library_files WHERE library_path = ?",
            )
            .bind(&row.library_path)
            .fetch_one(&self.pool)
            .await?;
            if references.0 == 0 {
                let absolute = self.root.join(&row.library_path);
                if tokio::fs::try_exists(&absolute).await.unwrap_or(false) {
                    tokio::fs::remove_file(&absolute).await?;
                    tracing::info!(path = %absolute.display(), "deleted physical file");
                }
            }
        }

        if row.is_duplicate {
            if let Some(canonical) = &row.duplicate_of_checksum {
                sqlx::query(
                    "UPDATE library_files SET duplicate_count = MAX(duplicate_count - 1, 0) WHERE checksum = ?",
                )
                .bind(canonical)
                .execute(&self.pool)
                .await?;
            }
        }

        self.bus.publish(
            EventType::LibraryFileDeleted,
            serde_json::json!({ "checksum": row_key, "filename": row.filename }),
        );
        Ok(())
    }

    pub fn absolute_path(&self, row: &LibraryFileRow) -> PathBuf {
        self.root.join(&row.library_path)
    }
}

async fn place_file(source: &Path, target: &Path, mode: IngestMode) -> Result<()> {
    match mode {
        IngestMode::Copy => {
            tokio::fs::copy(source, target).await?;
        }
        IngestMode::Move => {
            if tokio::fs::rename(source, target).await.is_err() {
                // Cross-device move: copy then unlink.
                tokio::fs::copy(source, target).await?;
                tokio::fs::remove_file(source).await?;
            }
        }
    }
    Ok(())
}

fn sanitize_component(name: &str) -> String {
    name.chars()
        .map(|c| if c == '/' || c == '\\' || c == ':' { '_' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::ExtractionQueue;

    async fn service() -> (Arc<LibraryService>, tempfile::TempDir, SqlitePool) {
        let pool = crate::db::test_pool().await;
        let bus = EventBus::new();
        let dir = tempfile::tempdir().unwrap();
        let mut config = crate::config::Config::from_env();
        config.library_path = dir.path().join("library");
        config.library_enabled = true;
        let (queue, _rx) = ExtractionQueue::new(64);
        let service = LibraryService::new(pool.clone(), bus, &config, queue);
        service.initialize().await.unwrap();
        (service, dir, pool)
    }

    fn write_source(dir: &tempfile::TempDir, name: &str, content: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[tokio::test]
    async fn first_ingest_creates_canonical_row() {
        let (service, dir, _pool) = service().await;
        let src = write_source(&dir, "a.3mf", b"content-a");

        let row = service
            .add_file(&src, FileSource::Upload, IngestMode::Copy)
            .await
            .unwrap();

        assert!(!row.is_duplicate);
        assert_eq!(row.library_path, "uploads/a.3mf");
        assert_eq!(row.duplicate_count, 0);
        assert!(service.absolute_path(&row).exists());
        // Canonical rows point their duplicate_of at their own hash.
        assert_eq!(row.duplicate_of_checksum.as_deref(), Some(row.checksum.as_str()));

        // Provenance is on the row itself as well as in the junction.
        let listed: Vec<serde_json::Value> = serde_json::from_str(&row.sources).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["kind"], "upload");
    }

    #[tokio::test]
    async fn reingesting_same_content_shares_the_physical_copy() {
        let (service, dir, pool) = service().await;
        let src = write_source(&dir, "a.3mf", b"same-bytes");

        let first = service
            .add_file(&src, FileSource::Upload, IngestMode::Copy)
            .await
            .unwrap();
        let second = service
            .add_file(&src, FileSource::Upload, IngestMode::Copy)
            .await
            .unwrap();

        assert!(second.is_duplicate);
        assert_ne!(first.checksum, second.checksum);
        assert_eq!(
            second.duplicate_of_checksum.as_deref(),
            Some(first.checksum.as_str())
        );
        // One physical copy, shared.
        assert_eq!(first.library_path, second.library_path);

        let canonical = db::library::get_by_checksum(&pool, &first.checksum)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(canonical.duplicate_count, 1);
    }

    #[tokio::test]
    async fn conflicting_name_with_different_content_gets_suffixed() {
        let (service, dir, _pool) = service().await;
        let first_src = write_source(&dir, "part.3mf", b"version one");
        service
            .add_file(&first_src, FileSource::Upload, IngestMode::Copy)
            .await
            .unwrap();

        let second_dir = tempfile::tempdir().unwrap();
        let second_src = write_source(&second_dir, "part.3mf", b"version two");
        let second = service
            .add_file(&second_src, FileSource::Upload, IngestMode::Copy)
            .await
            .unwrap();

        assert!(!second.is_duplicate);
        assert_eq!(second.library_path, "uploads/part_1.3mf");
        assert_eq!(second.filename, "part_1.3mf");
    }

    #[tokio::test]
    async fn dedup_with_foreign_conflict_matches_three_row_layout() {
        // A foreign file occupies models/a.3mf before any ingest.
        let (service, dir, pool) = service().await;
        std::fs::write(service.root().join("models/a.3mf"), b"foreign bytes").unwrap();

        let src = write_source(&dir, "a.3mf", b"ten bytes!");
        let watch = FileSource::WatchFolder {
            folder: dir.path().to_string_lossy().to_string(),
        };

        let first = service
            .add_file(&src, watch.clone(), IngestMode::Copy)
            .await
            .unwrap();
        let second = service
            .add_file(&src, watch.clone(), IngestMode::Copy)
            .await
            .unwrap();
        let third = service
            .add_file(&src, watch, IngestMode::Copy)
            .await
            .unwrap();

        // Canonical landed beside the foreign file; duplicates share it.
        assert_eq!(first.library_path, "models/a_1.3mf");
        assert!(second.is_duplicate && third.is_duplicate);
        assert_eq!(second.library_path, "models/a_1.3mf");

        assert!(service.root().join("models/a.3mf").exists());
        assert!(service.root().join("models/a_1.3mf").exists());
        assert!(!service.root().join("models/a_2.3mf").exists());

        let canonical = db::library::get_by_checksum(&pool, &first.checksum)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(canonical.duplicate_count, 2);
        for row in [&second, &third] {
            assert_eq!(
                row.duplicate_of_checksum.as_deref(),
                Some(first.checksum.as_str())
            );
        }
        let dups = db::library::duplicates_of(&pool, &first.checksum).await.unwrap();
        assert_eq!(dups.len(), 2);
    }

    #[tokio::test]
    async fn ingest_events_fire_once_per_row() {
        let (service, dir, _pool) = service().await;
        let bus_events: Arc<std::sync::Mutex<Vec<()>>> = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut sub = service.bus.subscribe_filtered(|e| {
            e.event_type == EventType::LibraryFileAdded
        });

        let src = write_source(&dir, "b.3mf", b"bytes-b");
        service
            .add_file(&src, FileSource::Upload, IngestMode::Copy)
            .await
            .unwrap();
        service
            .add_file(&src, FileSource::Upload, IngestMode::Copy)
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            seen.push(sub.recv().await.unwrap());
        }
        assert_eq!(seen.len(), 2);
        drop(bus_events);
    }

    #[tokio::test]
    async fn move_mode_removes_the_source() {
        let (service, dir, _pool) = service().await;
        let src = write_source(&dir, "m.gcode", b"gcode");

        service
            .add_file(&src, FileSource::Upload, IngestMode::Move)
            .await
            .unwrap();
        assert!(!src.exists());
    }

    #[tokio::test]
    async fn missing_source_is_not_found() {
        let (service, dir, _pool) = service().await;
        let missing = dir.path().join("ghost.3mf");
        assert!(matches!(
            service
                .add_file(&missing, FileSource::Upload, IngestMode::Copy)
                .await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn printer_sources_land_under_the_printer_folder() {
        let (service, dir, _pool) = service().await;
        let src = write_source(&dir, "job.gcode", b"printed");

        let row = service
            .add_file(
                &src,
                FileSource::Printer {
                    id: "p1".into(),
                    name: "X1 Carbon".into(),
                },
                IngestMode::Copy,
            )
            .await
            .unwrap();
        assert_eq!(row.library_path, "printers/X1 Carbon/job.gcode");
    }

    #[tokio::test]
    async fn suffix_chain_ends_at_one_thousand() {
        let (service, dir, _pool) = service().await;
        let uploads = service.root().join("uploads");

        // Foreign files occupy the base name and _1 through _999.
        std::fs::write(uploads.join("part.3mf"), b"occupant base").unwrap();
        for i in 1..=999 {
            std::fs::write(uploads.join(format!("part_{i}.3mf")), format!("occupant {i}")).unwrap();
        }

        let src = write_source(&dir, "part.3mf", b"the real content");
        let row = service
            .add_file(&src, FileSource::Upload, IngestMode::Copy)
            .await
            .unwrap();
        assert_eq!(row.library_path, "uploads/part_1000.3mf");

        // With _1000 now taken too, the next distinct content fails.
        let other_dir = tempfile::tempdir().unwrap();
        let other = write_source(&other_dir, "part.3mf", b"different again");
        assert!(matches!(
            service
                .add_file(&other, FileSource::Upload, IngestMode::Copy)
                .await,
            Err(ServiceError::Integrity(_))
        ));
    }

    #[tokio::test]
    async fn delete_keeps_shared_physical_file_until_last_reference() {
        let (service, dir, _pool) = service().await;
        let src = write_source(&dir, "s.3mf", b"shared");

        let first = service
            .add_file(&src, FileSource::Upload, IngestMode::Copy)
            .await
            .unwrap();
        let second = service
            .add_file(&src, FileSource::Upload, IngestMode::Copy)
            .await
            .unwrap();
        let path = service.absolute_path(&first);

        service.delete_file(&second.checksum, true).await.unwrap();
        assert!(path.exists());

        service.delete_file(&first.checksum, true).await.unwrap();
        assert!(!path.exists());
    }
}
