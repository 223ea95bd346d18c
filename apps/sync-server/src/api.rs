/// HTTP surface of the shared snapshot
/// GET returns the document or its timestamp; POST replaces it (master only).
use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use hangar_sync::{
    SaveResponse, Timestamp, TimestampResponse, DISPLAY_NAME_HEADER, ROLE_HEADER, SESSION_HEADER,
};
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

use crate::storage::{SnapshotStore, StoreError};

/// Largest accepted snapshot body.
pub const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

pub enum ApiError {
    NotFound,
    Forbidden,
    PayloadTooLarge(usize),
    BadRequest(String),
    Storage(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound => (StatusCode::NOT_FOUND, "No data stored yet".to_string()),
            ApiError::Forbidden => (
                StatusCode::FORBIDDEN,
                "Only a master client may write".to_string(),
            ),
            ApiError::PayloadTooLarge(size) => (
                StatusCode::PAYLOAD_TOO_LARGE,
                format!("Snapshot of {} bytes exceeds {} bytes", size, MAX_BODY_BYTES),
            ),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Storage(e) => {
                error!("Storage error: {}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, format!("Storage error: {}", e))
            }
        };

        let body = SaveResponse {
            success: false,
            error: Some(message),
            ..Default::default()
        };
        (status, Json(body)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotAnObject => ApiError::BadRequest(e.to_string()),
            other => ApiError::Storage(other.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DataQuery {
    pub action: Option<String>,
}

pub fn router(store: Arc<SnapshotStore>) -> Router {
    Router::new()
        .route("/sync/data", get(get_data).post(post_data))
        // Oversized bodies are answered by post_data with a JSON error.
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES * 2))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(store)
}

/// GET /sync/data[?action=timestamp]
pub async fn get_data(
    State(store): State<Arc<SnapshotStore>>,
    Query(query): Query<DataQuery>,
) -> Result<Response, ApiError> {
    if query.action.as_deref() == Some("timestamp") {
        let probe = match store.probe() {
            Some((timestamp, size)) => TimestampResponse {
                timestamp,
                size,
                success: true,
            },
            None => TimestampResponse {
                timestamp: Timestamp::ZERO,
                size: 0,
                success: false,
            },
        };
        return Ok(Json(probe).into_response());
    }

    match store.load()? {
        Some(value) => Ok(Json(value).into_response()),
        None => Err(ApiError::NotFound),
    }
}

/// POST /sync/data
pub async fn post_data(
    State(store): State<Arc<SnapshotStore>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SaveResponse>, ApiError> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    };

    let is_master = header(ROLE_HEADER).is_some_and(|role| role.eq_ignore_ascii_case("master"));
    if !is_master {
        warn!("Rejected write without master role");
        return Err(ApiError::Forbidden);
    }
    if body.len() > MAX_BODY_BYTES {
        return Err(ApiError::PayloadTooLarge(body.len()));
    }

    let value: serde_json::Value = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid JSON: {}", e)))?;
    let (timestamp, size) = store.save(value)?;

    info!(
        "Snapshot {} saved ({} bytes) by {}",
        timestamp,
        size,
        header(DISPLAY_NAME_HEADER).unwrap_or_else(|| "unnamed client".to_string())
    );
    debug!("Writer session: {:?}", header(SESSION_HEADER));

    Ok(Json(SaveResponse {
        success: true,
        timestamp: Some(timestamp),
        size: Some(size),
        error: None,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use hangar_sync::{
        CellId, FieldKind, HttpGateway, PersistenceGateway, ServerSnapshot, SyncConfig, SyncError,
        TileState,
    };
    use tower::ServiceExt;

    fn app() -> (Router, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SnapshotStore::open(dir.path().join("data.json")).unwrap());
        (router(store), dir)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(body: &str, role: Option<&str>) -> Request<Body> {
        let mut builder = Request::post("/sync/data").header("content-type", "application/json");
        if let Some(role) = role {
            builder = builder.header(ROLE_HEADER, role);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_empty_store_answers_404() {
        let (app, _dir) = app();
        let response = app
            .clone()
            .oneshot(Request::get("/sync/data").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["success"], false);

        let response = app
            .oneshot(
                Request::get("/sync/data?action=timestamp")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let probe = body_json(response).await;
        assert_eq!(probe["timestamp"], 0);
        assert_eq!(probe["success"], false);
    }

    #[tokio::test]
    async fn test_write_requires_master_role() {
        let (app, _dir) = app();
        let response = app
            .clone()
            .oneshot(post(r#"{"tiles":[]}"#, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .clone()
            .oneshot(post(r#"{"tiles":[]}"#, Some("sync")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let response = app
            .oneshot(post(r#"{"tiles":[]}"#, Some("master")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let ack = body_json(response).await;
        assert_eq!(ack["success"], true);
        assert!(ack["timestamp"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn test_oversized_and_invalid_bodies() {
        let (app, _dir) = app();
        let huge = format!(r#"{{"notes":"{}"}}"#, "x".repeat(MAX_BODY_BYTES));
        let response = app
            .clone()
            .oneshot(post(&huge, Some("master")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);

        let response = app.oneshot(post("{oops", Some("master"))).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_http_gateway_against_server() {
        let (app, _dir) = app();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let config = SyncConfig {
            endpoint: format!("http://{}/sync/data", addr),
            display_name: Some("Tower".to_string()),
            ..Default::default()
        };
        let gateway = HttpGateway::new(&config).unwrap();

        assert!(gateway.load().await.unwrap().is_none());
        assert_eq!(gateway.timestamp().await.unwrap(), Timestamp::ZERO);

        let tiles = vec![TileState::new(CellId(3)).with_field(FieldKind::Aircraft, "D-ABCD")];
        let ack = gateway
            .save(&ServerSnapshot::new(tiles, Timestamp::ZERO))
            .await
            .unwrap();
        assert_eq!(gateway.timestamp().await.unwrap(), ack.timestamp);

        let loaded = gateway.load().await.unwrap().unwrap();
        assert_eq!(loaded.timestamp(), ack.timestamp);
        assert_eq!(
            loaded.tile(CellId(3)).unwrap().aircraft_id.as_deref(),
            Some("D-ABCD")
        );

        let unreachable = HttpGateway::new(&SyncConfig {
            endpoint: "http://127.0.0.1:9/sync/data".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert!(matches!(
            unreachable.load().await,
            Err(SyncError::Network(_))
        ));
    }
}
