//! Dashboard configuration discovery endpoint.

use axum::{extract::State, Json};
use backdesk_shared::DiscoveredConfig;

use crate::state::AppState;

/// Tells the client where the realtime socket and GraphQL endpoint live.
pub async fn discovery(State(state): State<AppState>) -> Json<DiscoveredConfig> {
    Json(DiscoveredConfig {
        ws_url: Some(state.ws_url()),
        endpoint: state.graphql_url(),
        auth_mode: "handshake".to_string(),
        success: true,
    })
}
