mod library;
mod notifications;
mod printers;

use std::sync::Arc;

use axum::Router;

use crate::AppState;

/// Build the API router
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .nest("/printers", printers::router())
        .nest("/library", library::router())
        .nest("/notifications", notifications::router())
}
