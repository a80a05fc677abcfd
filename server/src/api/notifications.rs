use std::sync::Arc;

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use crate::db;
use crate::error::Result;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/history", get(delivery_history))
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<i64>,
}

/// GET /api/notifications/history - Recent webhook delivery attempts
async fn delivery_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<db::webhooks::WebhookDeliveryRow>>> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    Ok(Json(db::webhooks::recent(&state.db, limit).await?))
}
