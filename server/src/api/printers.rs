use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use uuid::Uuid;

use crate::db::{self, printers::PrinterInput};
use crate::error::{Result, ServiceError};
use crate::printers::PrinterKind;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_printers).post(create_printer))
        .route(
            "/{id}",
            get(get_printer).put(update_printer).delete(delete_printer),
        )
        .route("/{id}/status", get(printer_status))
        .route("/{id}/pause", post(pause_printer))
        .route("/{id}/resume", post(resume_printer))
        .route("/{id}/stop", post(stop_printer))
        .route("/{id}/resume-monitoring", post(resume_monitoring))
        .route("/{id}/snapshot", get(printer_snapshot))
        .route("/{id}/files", get(list_printer_files))
        .route("/{id}/files/refresh", post(refresh_printer_files))
        .route("/{id}/files/{filename}/download", post(download_printer_file))
}

/// GET /api/printers - All printers with their live state
async fn list_printers(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>> {
    let rows = db::printers::list(&state.db).await?;
    let mut printers = Vec::with_capacity(rows.len());
    for row in rows {
        let (monitoring_state, status) = match state.printers.get(&row.id).await {
            Ok(driver) => (
                driver.monitoring_state().await.as_str().to_string(),
                driver.last_status().await.map(|s| json!(s)),
            ),
            Err(_) => (row.monitoring_state.clone(), None),
        };
        printers.push(json!({
            "printer": row,
            "monitoring_state": monitoring_state,
            "status": status,
        }));
    }
    Ok(Json(json!({ "printers": printers })))
}

/// POST /api/printers - Register a new printer
async fn create_printer(
    State(state): State<Arc<AppState>>,
    Json(input): Json<PrinterInput>,
) -> Result<(StatusCode, Json<db::printers::PrinterRow>)> {
    PrinterKind::parse(&input.kind)?;
    let id = Uuid::new_v4().to_string();
    let row = db::printers::insert(&state.db, &id, &input).await?;

    let driver = state.printers.register(&row).await?;
    state.scheduler.watch_printer(driver).await;
    if let Some(discovery) = &state.discovery {
        discovery.publish_printer(&row).await;
    }

    Ok((StatusCode::CREATED, Json(row)))
}

async fn get_printer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<db::printers::PrinterRow>> {
    Ok(Json(db::printers::get(&state.db, &id).await?))
}

/// PUT /api/printers/:id - Update connection settings; the driver is
/// rebuilt with the new endpoint.
async fn update_printer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(input): Json<PrinterInput>,
) -> Result<Json<db::printers::PrinterRow>> {
    PrinterKind::parse(&input.kind)?;
    let row = db::printers::update(&state.db, &id, &input).await?;

    state.scheduler.unwatch_printer(&id).await;
    let _ = state.printers.remove(&id).await;
    let driver = state.printers.register(&row).await?;
    state.scheduler.watch_printer(driver).await;
    if let Some(discovery) = &state.discovery {
        discovery.publish_printer(&row).await;
    }

    Ok(Json(row))
}

async fn delete_printer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.scheduler.unwatch_printer(&id).await;
    let _ = state.printers.remove(&id).await;
    if let Some(discovery) = &state.discovery {
        discovery.remove_printer(&id).await;
    }
    db::printers::delete(&state.db, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn printer_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let driver = state.printers.get(&id).await?;
    Ok(Json(json!({
        "monitoring_state": driver.monitoring_state().await.as_str(),
        "status": driver.last_status().await,
    })))
}

async fn pause_printer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.printers.get(&id).await?.pause().await?;
    Ok(StatusCode::ACCEPTED)
}

async fn resume_printer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.printers.get(&id).await?.resume().await?;
    Ok(StatusCode::ACCEPTED)
}

async fn stop_printer(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.printers.get(&id).await?.stop_print().await?;
    Ok(StatusCode::ACCEPTED)
}

/// POST /api/printers/:id/resume-monitoring - Operator re-enable after
/// suspension.
async fn resume_monitoring(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    let driver = state.printers.get(&id).await?;
    db::printers::set_enabled(&state.db, &id, true).await?;
    driver.resume_monitoring().await;
    state.scheduler.watch_printer(driver).await;
    Ok(StatusCode::ACCEPTED)
}

async fn printer_snapshot(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse> {
    let (bytes, mime) = state.printers.take_snapshot(&id).await?;
    Ok(([(header::CONTENT_TYPE, mime)], bytes))
}

async fn list_printer_files(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Vec<db::files::PrintedFileRow>>> {
    db::printers::get(&state.db, &id).await?;
    Ok(Json(db::files::list_for_printer(&state.db, &id).await?))
}

/// POST /api/printers/:id/files/refresh - Pull a fresh inventory
/// listing from the printer.
async fn refresh_printer_files(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let driver = state.printers.get(&id).await?;
    let observed = state.transfers.refresh_inventory(&driver).await?;
    Ok(Json(json!({ "observed": observed })))
}

/// POST /api/printers/:id/files/:filename/download - Fetch one file
/// into the library.
async fn download_printer_file(
    State(state): State<Arc<AppState>>,
    Path((id, filename)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>> {
    if filename.contains('/') || filename.contains("..") {
        return Err(ServiceError::Config("invalid filename".into()));
    }
    let row = state
        .transfers
        .download_and_ingest(&id, &filename, None)
        .await?;
    Ok(Json(json!({ "library_file": row })))
}
