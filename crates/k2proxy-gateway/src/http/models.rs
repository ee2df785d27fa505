use axum::{extract::State, Json};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::app::AppState;

/// GET /v1/models — exactly one entry: the upstream model.
pub async fn list_models(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "object": "list",
        "data": [{
            "id": state.config.upstream_model_id,
            "object": "model",
            "owned_by": "MBZUAI",
        }]
    }))
}
