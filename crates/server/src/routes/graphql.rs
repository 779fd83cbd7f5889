//! Minimal GraphQL endpoint answering latest-change queries.
//!
//! Only the shape the polling client sends is understood:
//! `query { <collection>(sort: [...], limit: 1) { ... } }`. Every row field is
//! returned regardless of the selection set.

use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use crate::state::AppState;

/// Only `query` is read; `variables` and `operationName` are accepted and ignored.
#[derive(Debug, Deserialize)]
pub struct GraphQlRequest {
    pub query: String,
}

fn graphql_error(status: StatusCode, message: &str) -> (StatusCode, Json<Value>) {
    (status, Json(json!({"data": null, "errors": [{"message": message}]})))
}

/// Root field of a `query { field(...) { ... } }` document.
pub fn root_field(query: &str) -> Option<&str> {
    let rest = query.trim_start();
    let rest = rest.strip_prefix("query").unwrap_or(rest).trim_start();
    let rest = rest.strip_prefix('{')?.trim_start();
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    let field = &rest[..end];
    (!field.is_empty()).then_some(field)
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

pub async fn graphql(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<GraphQlRequest>,
) -> (StatusCode, Json<Value>) {
    if !bearer_token(&headers).is_some_and(|token| state.token_matches(token)) {
        return graphql_error(StatusCode::UNAUTHORIZED, "invalid or missing access token");
    }
    let Some(collection) = root_field(&req.query) else {
        tracing::debug!("Unsupported GraphQL document: {}", req.query);
        return graphql_error(StatusCode::OK, "unsupported query");
    };

    let rows: Vec<Value> = state.changes.latest(collection).into_iter().collect();
    let mut data = Map::new();
    data.insert(collection.to_string(), Value::Array(rows));
    (StatusCode::OK, Json(json!({ "data": data })))
}
