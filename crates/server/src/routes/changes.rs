//! Development-only change injection.

use axum::{extract::State, http::StatusCode, Json};
use backdesk_shared::SubscriptionEvent;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ChangeRequest {
    pub collection: String,
    pub event: SubscriptionEvent,
    #[serde(default)]
    pub data: Value,
}

/// Record a change and push it to every socket subscribed to the collection.
pub async fn record_change(
    State(state): State<AppState>,
    Json(req): Json<ChangeRequest>,
) -> Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)> {
    if req.collection.trim().is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "collection is required"})),
        ));
    }
    if req.event == SubscriptionEvent::Other {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({"error": "event must be create, update or delete"})),
        ));
    }

    let row = state.changes.record(&req.collection, req.event, req.data);
    tracing::info!("Recorded {:?} in {}", req.event, req.collection);
    Ok((StatusCode::CREATED, Json(row)))
}
