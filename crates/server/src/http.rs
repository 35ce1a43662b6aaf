use crate::service::{
    BrainService, ChatRequest, ChatResponse, ResyncAccepted, SearchResponse, ServiceError,
    StatusResponse,
};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;

pub fn router(service: Arc<BrainService>) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/ingest", post(ingest))
        .route("/search", get(search))
        .route("/chat", post(chat))
        .with_state(service)
}

/// Client identity for admission control: an API key when one is presented,
/// the peer address otherwise.
fn client_identity(headers: &HeaderMap, addr: SocketAddr) -> String {
    headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map_or_else(|| addr.ip().to_string(), |key| format!("key:{key}"))
}

#[derive(Deserialize)]
struct SearchParams {
    q: String,
    k: Option<usize>,
}

#[derive(Deserialize)]
struct IngestParams {
    #[serde(default)]
    full_rebuild: bool,
}

async fn status(
    State(service): State<Arc<BrainService>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Result<Json<StatusResponse>, ServiceError> {
    let client = client_identity(&headers, addr);
    service.stats(&client).map(Json)
}

async fn ingest(
    State(service): State<Arc<BrainService>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<IngestParams>,
) -> Result<Json<ResyncAccepted>, ServiceError> {
    let client = client_identity(&headers, addr);
    service
        .trigger_resync(params.full_rebuild, &client)
        .await
        .map(Json)
}

async fn search(
    State(service): State<Arc<BrainService>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(params): Query<SearchParams>,
) -> Result<Json<SearchResponse>, ServiceError> {
    let client = client_identity(&headers, addr);
    service
        .search(&params.q, params.k.unwrap_or(5), &client)
        .await
        .map(Json)
}

async fn chat(
    State(service): State<Arc<BrainService>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ServiceError> {
    let client = client_identity(&headers, addr);
    service.chat(request, &client).await.map(Json)
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            Self::RateLimitExceeded => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
            Self::IndexUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "not_indexed"),
            Self::Search(_) => (StatusCode::INTERNAL_SERVER_ERROR, "search_failed"),
            Self::Generation(_) => (StatusCode::BAD_GATEWAY, "generation_failed"),
            Self::Resync(_) => (StatusCode::INTERNAL_SERVER_ERROR, "resync_unavailable"),
        };
        let body = Json(serde_json::json!({
            "error": code,
            "detail": self.to_string(),
        }));
        (status, body).into_response()
    }
}
