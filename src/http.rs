//! Health and admin HTTP surface.
//!
//! `/health` and `/ready` are unauthenticated. Admin endpoints are enabled
//! by configuration and authenticated by an API key in `X-Api-Key`
//! (constant-time comparison), an IP allowlist (single addresses and CIDR),
//! or both; when both are configured, both must pass. With `trustProxy`
//! enabled the first `X-Forwarded-For` entry is the client address,
//! otherwise the socket address is.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use subtle::ConstantTimeEq;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::instrument;

use crate::config::{AdminApiConfig, RouteConfig};
use crate::ledger::ChannelLedger;
use crate::node::HealthStatus;
use crate::routing::RoutingTable;
use crate::session::PeerSessionManager;
use crate::types::PeerId;

/// Shared state behind the HTTP surface.
pub struct HttpState {
    pub node_id: String,
    pub version: &'static str,
    pub started_at: Instant,
    pub health: watch::Receiver<HealthStatus>,
    pub sessions: Arc<PeerSessionManager>,
    pub routing: Arc<RoutingTable>,
    pub ledger: Arc<ChannelLedger>,
    pub admin: AdminApiConfig,
}

pub fn build_router(state: Arc<HttpState>) -> Router {
    let mut router = Router::new()
        .route("/health", get(get_health))
        .route("/ready", get(get_ready));

    if state.admin.enabled {
        let admin = Router::new()
            .route("/admin/routes", get(get_admin_routes))
            .route("/admin/routes", post(post_admin_route))
            .route("/admin/routes", delete(delete_admin_route))
            .route("/admin/peers", get(get_admin_peers))
            .route("/admin/channels", get(get_admin_channels))
            .layer(middleware::from_fn_with_state(
                Arc::clone(&state),
                admin_auth,
            ));
        router = router.merge(admin);
    }

    // Request ids are assigned outermost so the trace span and the response
    // both carry them.
    router
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

/// Bind and serve until the cancellation token fires.
pub async fn serve(
    state: Arc<HttpState>,
    port: u16,
    cancel: CancellationToken,
) -> Result<SocketAddr, std::io::Error> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    let addr = listener.local_addr()?;
    let router = build_router(state);
    tokio::spawn(async move {
        let shutdown = async move { cancel.cancelled().await };
        if let Err(e) = axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        {
            tracing::error!(error = %e, "http surface failed");
        }
    });
    Ok(addr)
}

#[instrument(skip_all)]
async fn get_health(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let status = *state.health.borrow();
    let body = json!({
        "status": status,
        "uptime": state.started_at.elapsed().as_secs(),
        "peersConnected": state.sessions.open_sessions(),
        "totalPeers": state.sessions.configured_peers(),
        "nodeId": state.node_id,
        "version": state.version,
    });
    let code = if status == HealthStatus::Healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}

#[instrument(skip_all)]
async fn get_ready(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let ready = *state.health.borrow() == HealthStatus::Healthy;
    Json(json!({ "ready": ready }))
}

// ============================================================================
// Admin endpoints
// ============================================================================

#[instrument(skip_all)]
async fn get_admin_routes(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    Json(state.routing.entries())
}

#[instrument(skip_all)]
async fn post_admin_route(
    State(state): State<Arc<HttpState>>,
    Json(route): Json<RouteConfig>,
) -> Response {
    if route.prefix.is_empty() {
        state.routing.insert_default(route.next_hop, route.priority);
        return StatusCode::CREATED.into_response();
    }
    match route.prefix.parse() {
        Ok(prefix) => {
            state.routing.insert(&prefix, route.next_hop, route.priority);
            StatusCode::CREATED.into_response()
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("invalid prefix: {e}") })),
        )
            .into_response(),
    }
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeleteRoute {
    prefix: String,
    next_hop: PeerId,
}

#[instrument(skip_all)]
async fn delete_admin_route(
    State(state): State<Arc<HttpState>>,
    Json(body): Json<DeleteRoute>,
) -> Response {
    match body.prefix.parse() {
        Ok(prefix) => {
            state.routing.remove(&prefix, &body.next_hop);
            StatusCode::NO_CONTENT.into_response()
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": format!("invalid prefix: {e}") })),
        )
            .into_response(),
    }
}

#[instrument(skip_all)]
async fn get_admin_peers(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    Json(state.sessions.peer_views())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChannelView {
    peer: PeerId,
    chain: crate::types::ChainTag,
    #[serde(flatten)]
    entry: crate::ledger::ChannelEntry,
}

#[instrument(skip_all)]
async fn get_admin_channels(State(state): State<Arc<HttpState>>) -> impl IntoResponse {
    let channels: Vec<ChannelView> = state
        .ledger
        .channels()
        .into_iter()
        .map(|(key, entry)| ChannelView {
            peer: key.peer,
            chain: key.chain,
            entry,
        })
        .collect();
    Json(channels)
}

// ============================================================================
// Admin authentication
// ============================================================================

async fn admin_auth(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(socket): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let client_ip = client_ip(&state.admin, request.headers(), socket.ip());
    let api_key = request
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok());

    match authorize(&state.admin, client_ip, api_key) {
        Ok(()) => next.run(request).await,
        Err(code) => {
            tracing::warn!(%client_ip, status = %code, "admin request refused");
            (code, Json(json!({ "error": "unauthorized" }))).into_response()
        }
    }
}

fn client_ip(admin: &AdminApiConfig, headers: &HeaderMap, socket_ip: IpAddr) -> IpAddr {
    if admin.trust_proxy {
        if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            if let Some(first) = forwarded.split(',').next() {
                if let Ok(ip) = first.trim().parse() {
                    return ip;
                }
            }
        }
    }
    socket_ip
}

/// Every configured mechanism must pass. The API key comparison is
/// constant-time regardless of where the mismatch is.
fn authorize(
    admin: &AdminApiConfig,
    client_ip: IpAddr,
    presented_key: Option<&str>,
) -> Result<(), StatusCode> {
    if let Some(expected) = &admin.api_key {
        let presented = presented_key.unwrap_or("");
        let matches = bool::from(presented.as_bytes().ct_eq(expected.inner().as_bytes()));
        if !matches {
            return Err(StatusCode::UNAUTHORIZED);
        }
    }
    if !admin.allowed_ips.is_empty() && !admin.allowed_ips.iter().any(|p| p.matches(client_ip)) {
        return Err(StatusCode::FORBIDDEN);
    }
    // No mechanism configured answers everyone; the config validator blocks
    // that combination in prod.
    Ok(())
}
