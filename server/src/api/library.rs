use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use crate::db::{self, library::LibraryFilter};
use crate::error::{Result, ServiceError};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_files))
        .route("/{checksum}", get(get_file).delete(delete_file))
        .route("/{checksum}/thumbnail", get(file_thumbnail))
        .route("/{checksum}/sources", get(file_sources))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    file_type: Option<String>,
    status: Option<String>,
    search: Option<String>,
    include_duplicates: Option<bool>,
    page: Option<i64>,
    limit: Option<i64>,
}

/// GET /api/library - List library files with filters and pagination
async fn list_files(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<serde_json::Value>> {
    let filter = LibraryFilter {
        file_type: query.file_type,
        status: query.status,
        search: query.search,
        include_duplicates: query.include_duplicates,
    };
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let page = query.page.unwrap_or(1).max(1);
    let files = db::library::list(&state.db, &filter, limit, (page - 1) * limit).await?;
    Ok(Json(json!({
        "files": files,
        "page": page,
        "limit": limit,
    })))
}

async fn get_file(
    State(state): State<Arc<AppState>>,
    Path(checksum): Path<String>,
) -> Result<Json<db::library::LibraryFileRow>> {
    db::library::get_by_checksum(&state.db, &checksum)
        .await?
        .map(Json)
        .ok_or_else(|| ServiceError::NotFound(format!("library file {checksum}")))
}

async fn file_sources(
    State(state): State<Arc<AppState>>,
    Path(checksum): Path<String>,
) -> Result<Json<Vec<db::library::FileSourceRow>>> {
    Ok(Json(db::library::sources_for(&state.db, &checksum).await?))
}

/// GET /api/library/:checksum/thumbnail - Embedded thumbnail PNG
async fn file_thumbnail(
    State(state): State<Arc<AppState>>,
    Path(checksum): Path<String>,
) -> Result<impl IntoResponse> {
    let row = db::library::get_by_checksum(&state.db, &checksum)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("library file {checksum}")))?;
    let png = row
        .thumbnail
        .ok_or_else(|| ServiceError::NotFound(format!("no thumbnail for {checksum}")))?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png))
}

async fn delete_file(
    State(state): State<Arc<AppState>>,
    Path(checksum): Path<String>,
) -> Result<StatusCode> {
    state.library.delete_file(&checksum, true).await?;
    Ok(StatusCode::NO_CONTENT)
}
