//! Online-agent projection for dashboards and operators.

use super::{lock_or_recover, AppState};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use std::sync::Arc;

pub(super) async fn online_agents(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let agents = lock_or_recover(&state.registry).online();
    Json(json!({
        "count": agents.len(),
        "agents": agents,
    }))
}
