//! HTTP surface of the relay.
//!
//! - `GET /ws?address=…` — upgrades to a WebSocket session. The
//!   address arrives as a query parameter for now; the admission seam
//!   is isolated here so a cryptographic challenge-response can replace
//!   it without touching the hub.
//! - `GET /health` — connection and task counts as JSON.
//! - `POST /agents/register` — stores a pending key enrollment and
//!   returns its claim code.
//! - `POST /agents/claim` — operator approval of a pending enrollment,
//!   gated by the admin secret.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use pinch_types::config::RelayConfig;
use pinch_types::PinchError;

use crate::client::{self, Client};
use crate::hub::Hub;

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Shared state handed to every handler.
#[derive(Clone)]
struct AppState {
    hub: Arc<Hub>,
    config: Arc<RelayConfig>,
}

/// Builds the relay's HTTP router.
pub fn build_router(hub: Arc<Hub>, config: Arc<RelayConfig>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/agents/register", post(register_handler))
        .route("/agents/claim", post(claim_handler))
        .with_state(AppState { hub, config })
}

// ---------------------------------------------------------------------------
// WebSocket upgrade
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct WsQuery {
    address: Option<String>,
}

/// Upgrades to a WebSocket and runs the session pumps.
///
/// The address is validated before the upgrade is accepted.
/// Connections from any origin are accepted in development; origin
/// enforcement belongs to the deployment's reverse proxy.
async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    ws: Option<WebSocketUpgrade>,
) -> Response {
    let Some(address) = query.address.filter(|address| !address.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            "missing address query parameter",
        )
            .into_response();
    };
    let Some(ws) = ws else {
        return (StatusCode::UPGRADE_REQUIRED, "websocket upgrade required").into_response();
    };

    let hub = state.hub.clone();
    let send_buffer = state.config.send_buffer;
    let ping_interval = Duration::from_secs(state.config.ping_interval_secs);
    let pong_timeout = Duration::from_secs(state.config.pong_timeout_secs);

    ws.on_upgrade(move |socket| async move {
        let (session, frame_rx) = Client::new(address, send_buffer);
        hub.register(session.clone()).await;
        client::run_session(session, frame_rx, socket, hub, ping_interval, pong_timeout).await;
    })
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Health snapshot returned by `GET /health`.
#[derive(Serialize)]
struct HealthStatus {
    /// Estimated live task count (three pumps per session plus the
    /// hub loop). The wire key is kept for client compatibility.
    #[serde(rename = "goroutines")]
    tasks: usize,
    /// Currently connected sessions.
    connections: usize,
}

async fn health_handler(State(state): State<AppState>) -> Json<HealthStatus> {
    let connections = state.hub.client_count();
    Json(HealthStatus {
        tasks: connections * 3 + 1,
        connections,
    })
}

// ---------------------------------------------------------------------------
// Enrollment
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct RegisterRequest {
    pub_key_b64: String,
    address: String,
}

#[derive(Serialize)]
struct RegisterResponse {
    claim_code: String,
}

/// Stores a pending enrollment for the given key and address.
async fn register_handler(
    State(state): State<AppState>,
    Json(request): Json<RegisterRequest>,
) -> Response {
    if request.pub_key_b64.is_empty() {
        return (StatusCode::BAD_REQUEST, "missing pub_key_b64").into_response();
    }
    if let Err(e) = pinch_identity::validate_address(&request.address) {
        return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
    }

    match state
        .hub
        .key_registry()
        .register_pending(&request.pub_key_b64, &request.address)
    {
        Ok(claim_code) => {
            tracing::info!(address = %request.address, "pending registration stored");
            Json(RegisterResponse { claim_code }).into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to store pending registration");
            (StatusCode::INTERNAL_SERVER_ERROR, "registration failed").into_response()
        }
    }
}

#[derive(Deserialize)]
struct ClaimRequest {
    claim_code: String,
    admin_secret: String,
}

#[derive(Serialize)]
struct ClaimResponse {
    address: String,
    status: String,
}

/// Approves a pending enrollment by claim code.
async fn claim_handler(
    State(state): State<AppState>,
    Json(request): Json<ClaimRequest>,
) -> Response {
    let Some(expected) = state.config.admin_secret.as_deref() else {
        return (StatusCode::FORBIDDEN, "claim approval disabled").into_response();
    };
    if !constant_time_eq(request.admin_secret.as_bytes(), expected.as_bytes()) {
        return (StatusCode::UNAUTHORIZED, "invalid admin secret").into_response();
    }

    match state.hub.key_registry().claim(&request.claim_code) {
        Ok(address) => {
            tracing::info!(address = %address, "pending registration approved");
            Json(ClaimResponse {
                address,
                status: "approved".into(),
            })
            .into_response()
        }
        Err(PinchError::ClaimNotFound) => {
            (StatusCode::NOT_FOUND, "claim code not found or expired").into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "claim failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "claim failed").into_response()
        }
    }
}

/// Compares two byte slices in constant time.
///
/// The comparison time depends only on the lengths, not on the
/// content, preventing timing side-channels on the admin secret.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use pinch_crypto::Keypair;
    use pinch_store::{KeyRegistry, MessageQueue};
    use tower::util::ServiceExt;

    fn test_router(admin_secret: Option<&str>) -> (tempfile::TempDir, Router) {
        let dir = tempfile::TempDir::new().expect("tempdir");
        let db = pinch_store::open_db(&dir.path().join("http.db")).expect("open db");
        let mq = Arc::new(
            MessageQueue::new(&db, 1000, Duration::from_secs(3600)).expect("queue"),
        );
        let kr = Arc::new(KeyRegistry::new(&db).expect("registry"));
        let hub = Hub::new(mq, kr);

        let config = Arc::new(RelayConfig {
            admin_secret: admin_secret.map(str::to_owned),
            ..RelayConfig::default()
        });
        let router = build_router(hub, config);
        (dir, router)
    }

    fn keyed_address(seed: u8) -> String {
        let kp = Keypair::from_seed(&[seed; 32]);
        pinch_identity::generate_address(&kp.public_key(), "localhost")
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    /// Builds a request carrying a valid WebSocket handshake.
    fn ws_request(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header("host", "localhost")
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn ws_without_address_is_bad_request() {
        let (_dir, router) = test_router(None);

        let response = router.oneshot(ws_request("/ws")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn ws_with_address_but_no_upgradable_connection() {
        let (_dir, router) = test_router(None);

        // The address check passes; without a real upgradable
        // connection the handshake is refused afterwards.
        let response = router
            .oneshot(ws_request("/ws?address=pinch:abc@localhost"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UPGRADE_REQUIRED);
    }

    #[tokio::test]
    async fn health_reports_connection_counts() {
        let (_dir, router) = test_router(None);

        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["connections"], 0);
        assert_eq!(json["goroutines"], 1);
    }

    #[tokio::test]
    async fn enrollment_register_then_claim_flow() {
        let (_dir, router) = test_router(Some("supersecret"));
        let address = keyed_address(0x21);

        // Register a pending enrollment.
        let body = serde_json::json!({
            "pub_key_b64": "dGVzdHB1YmtleQ==",
            "address": address,
        });
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/agents/register")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let claim_code = body_json(response).await["claim_code"]
            .as_str()
            .expect("claim code")
            .to_owned();
        assert_eq!(claim_code.len(), 8);

        // Approve it.
        let body = serde_json::json!({
            "claim_code": claim_code,
            "admin_secret": "supersecret",
        });
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/agents/claim")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["address"], address.as_str());
        assert_eq!(json["status"], "approved");

        // The code is single-use: a second claim fails.
        let body = serde_json::json!({
            "claim_code": claim_code,
            "admin_secret": "supersecret",
        });
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/agents/claim")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn claim_with_unknown_code_is_not_found() {
        let (_dir, router) = test_router(Some("supersecret"));

        let body = serde_json::json!({
            "claim_code": "deadbeef",
            "admin_secret": "supersecret",
        });
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/agents/claim")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn claim_with_wrong_secret_is_unauthorized() {
        let (_dir, router) = test_router(Some("supersecret"));

        let body = serde_json::json!({
            "claim_code": "deadbeef",
            "admin_secret": "wrong",
        });
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/agents/claim")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn claim_disabled_without_admin_secret() {
        let (_dir, router) = test_router(None);

        let body = serde_json::json!({
            "claim_code": "deadbeef",
            "admin_secret": "anything",
        });
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/agents/claim")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn register_rejects_invalid_address() {
        let (_dir, router) = test_router(None);

        let body = serde_json::json!({
            "pub_key_b64": "dGVzdHB1YmtleQ==",
            "address": "not-a-pinch-address",
        });
        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/agents/register")
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn constant_time_eq_basic_properties() {
        assert!(constant_time_eq(b"secret", b"secret"));
        assert!(!constant_time_eq(b"secret", b"secres"));
        assert!(!constant_time_eq(b"secret", b"secret0"));
        assert!(constant_time_eq(b"", b""));
    }
}
