use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Html,
};
use chrono::Utc;
use tracing::{error, info};

use crate::app::AppState;

/// GET /reminders/confirm/{token}: recipient clicked the link in a reminder email.
pub async fn confirm_handler(
    State(state): State<Arc<AppState>>,
    Path(token): Path<String>,
) -> (StatusCode, Html<&'static str>) {
    match state.logs.confirm(&token, Utc::now()) {
        Ok(true) => {
            info!("reminder receipt confirmed");
            (StatusCode::OK, Html("<p>Thanks, your reminder is confirmed.</p>"))
        }
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Html("<p>This link is invalid or was already used.</p>"),
        ),
        Err(e) => {
            error!(error = %e, "confirm failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Html("<p>Something went wrong, please try again later.</p>"),
            )
        }
    }
}
