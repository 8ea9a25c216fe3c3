//! REST handlers.

use axum::{extract::State, response::Json};
use switchboard_core::FullState;

use crate::AppState;

/// Handler for GET /api/state
pub async fn state_handler(State(state): State<AppState>) -> Json<FullState> {
    Json(state.manager.full_state())
}

/// Handler for GET /api/streams
pub async fn streams_handler(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.manager.active_stream_ids())
}
