//! HTTP routes on the shared listener
//!
//! `/set` and `/get` front the score store. A WebSocket upgrade on any path
//! is intercepted before routing and handed to the relay.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::header::{
    CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY, SEC_WEBSOCKET_PROTOCOL,
    SEC_WEBSOCKET_VERSION, UPGRADE,
};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::{Json, Router};
use hyper_util::rt::TokioIo;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tokio_util::task::TaskTracker;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, warn};

use crate::relay::{Relay, RelayError};
use crate::store::{HighScore, ScoreDocument, ScoreStore, DEFAULT_NAME};

/// Shared state handed to every route
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
    pub store: Arc<dyn ScoreStore>,
    pub shutdown_tx: broadcast::Sender<()>,
    /// Tracks upgraded relay connections so shutdown can wait for them
    pub tracker: TaskTracker,
}

/// Build the router for the shared listener
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/set", any(set_score))
        .route("/get", any(get_score))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), intercept_upgrade))
        .with_state(state)
        .layer(CorsLayer::new().allow_origin(Any))
}

/// First value of `key`, treating an empty value as missing
fn param<'a>(params: &'a [(String, String)], key: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
        .filter(|v| !v.is_empty())
}

/// `/set?name=..&score=..`: replace the stored high score
async fn set_score(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
) -> Response {
    let name = param(&params, "name").unwrap_or(DEFAULT_NAME);
    let score = match param(&params, "score").map(str::parse::<u64>) {
        None => 0,
        Some(Ok(score)) => score,
        Some(Err(_)) => {
            return (StatusCode::BAD_REQUEST, "score must be a whole number").into_response()
        }
    };

    let highscore = HighScore::new(name, score);
    if let Err(e) = state.store.set(highscore.clone()).await {
        error!(
            "Failed to store high score in {} store: {}",
            state.store.backend_name(),
            e
        );
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }
    debug!("Stored high score {} by {}", highscore.score, highscore.name);

    (StatusCode::CREATED, Json(ScoreDocument::from(highscore))).into_response()
}

/// `/get`: the stored high score as `name,score`
async fn get_score(State(state): State<AppState>) -> Response {
    match state.store.get().await {
        Ok(Some(highscore)) => (
            StatusCode::CREATED,
            format!("{},{}", highscore.name, highscore.score),
        )
            .into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(e) => {
            error!(
                "Failed to read high score from {} store: {}",
                state.store.backend_name(),
                e
            );
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

fn header_has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn is_upgrade_request(headers: &HeaderMap) -> bool {
    header_has_token(headers, UPGRADE, "websocket")
}

/// Check the parts of an upgrade request that the relay does not look at.
/// Returns the client's key.
fn validate_upgrade<'a>(
    method: &Method,
    headers: &'a HeaderMap,
) -> Result<&'a HeaderValue, RelayError> {
    if method != Method::GET {
        return Err(RelayError::MalformedUpgrade("method must be GET"));
    }
    if !header_has_token(headers, CONNECTION, "upgrade") {
        return Err(RelayError::MalformedUpgrade("missing Connection: Upgrade"));
    }
    if !headers
        .get(SEC_WEBSOCKET_VERSION)
        .is_some_and(|v| v.as_bytes() == b"13")
    {
        return Err(RelayError::MalformedUpgrade("unsupported Sec-WebSocket-Version"));
    }
    headers
        .get(SEC_WEBSOCKET_KEY)
        .ok_or(RelayError::MalformedUpgrade("missing Sec-WebSocket-Key"))
}

/// Hand WebSocket upgrades to the relay; let everything else through
async fn intercept_upgrade(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    if !is_upgrade_request(req.headers()) {
        return next.run(req).await;
    }

    let peer_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
        .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

    if state.tracker.is_closed() {
        debug!("Refusing upgrade from {} during shutdown", peer_addr);
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let key = match validate_upgrade(req.method(), req.headers()) {
        Ok(key) => key.clone(),
        Err(e) => {
            debug!("Bad upgrade request from {}: {}", peer_addr, e);
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let protocol = match state.relay.admit(req.headers()) {
        Ok(protocol) => protocol,
        Err(e @ RelayError::OriginRejected(_)) => {
            warn!("Rejecting upgrade from {}: {}", peer_addr, e);
            return StatusCode::FORBIDDEN.into_response();
        }
        Err(e) => {
            warn!("Rejecting upgrade from {}: {}", peer_addr, e);
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
    };

    let on_upgrade = hyper::upgrade::on(&mut req);
    let relay = Arc::clone(&state.relay);
    let shutdown_rx = state.shutdown_tx.subscribe();

    state.tracker.spawn(async move {
        match on_upgrade.await {
            Ok(upgraded) => {
                let ws_stream =
                    WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                        .await;
                relay.serve(ws_stream, peer_addr, shutdown_rx).await;
            }
            Err(e) => error!("Upgrade from {} failed: {}", peer_addr, e),
        }
    });

    let mut response = StatusCode::SWITCHING_PROTOCOLS.into_response();
    let headers = response.headers_mut();
    headers.insert(CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(UPGRADE, HeaderValue::from_static("websocket"));
    if let Ok(accept) = HeaderValue::from_str(&derive_accept_key(key.as_bytes())) {
        headers.insert(SEC_WEBSOCKET_ACCEPT, accept);
    }
    if let Some(protocol) = protocol {
        headers.insert(SEC_WEBSOCKET_PROTOCOL, HeaderValue::from_static(protocol));
    }
    response
}
