use std::sync::Arc;

use axum::{routing::get, Router};
use chime_scheduler::SqliteReminderLogStore;

/// Shared state handed to every HTTP handler.
pub struct AppState {
    pub instance_id: String,
    pub logs: Arc<SqliteReminderLogStore>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(crate::http::health::health_handler))
        .route(
            "/reminders/confirm/{token}",
            get(crate::http::confirm::confirm_handler),
        )
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
