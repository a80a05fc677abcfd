mod ui;

use std::sync::Arc;

use axum::Router;

use crate::AppState;

pub use ui::event_stream_ws;

/// Build the WebSocket router
pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/events", axum::routing::get(event_stream_ws))
}
