//! HTTP(S) transport for the JSON-RPC service (spec.md §4.9).
//!
//! Grounded on
//! `examples/Galev01-LimiQuantix/agent/limiquantix-node/src/http_server.rs`
//! for the `axum_server::bind_rustls`/`bind` + `tower_http::trace`
//! shape. The 128 KiB body cap is enforced by an explicit `from_fn`
//! middleware rather than `tower_http::limit::RequestBodyLimitLayer`
//! because spec.md §8 requires the cap to apply "regardless of
//! credentials or path" (scenario 6) — a layer that only limits the
//! body *stream* would let an oversized request to an unmatched path
//! fall through to a 404 without ever being counted; reading the body
//! up front, before routing, is the only way to guarantee the 413.

use std::future::Future;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth::{self, Tarpit};
use crate::config::Config;
use crate::error::{Result, TargetdError};
use crate::metrics;
use crate::rpc::Dispatcher;

/// Request bodies larger than this are rejected with 413 before JSON
/// parsing is ever attempted (spec.md §4.9).
const MAX_BODY_BYTES: usize = 128 * 1024;

struct AppState {
    config: Arc<Config>,
    dispatcher: Arc<Dispatcher>,
    tarpit: Arc<Tarpit>,
}

/// Binds and serves the JSON-RPC endpoint, honoring `config.ssl`, until
/// `shutdown` resolves. Waits for any in-flight request to drop the
/// dispatch mutex before returning (spec.md §5).
pub async fn serve(
    config: Arc<Config>,
    dispatcher: Arc<Dispatcher>,
    tarpit: Arc<Tarpit>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", config.port)
        .parse()
        .map_err(|e| TargetdError::Invalid(format!("invalid listen port {}: {e}", config.port)))?;

    let state = Arc::new(AppState {
        config: config.clone(),
        dispatcher,
        tarpit,
    });
    let app = build_router(state);

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        shutdown.await;
        info!("shutdown signal received, draining in-flight request");
        shutdown_handle.graceful_shutdown(None);
    });

    if config.ssl {
        let cert = config
            .ssl_cert
            .as_deref()
            .ok_or_else(|| TargetdError::Invalid("ssl=true requires ssl_cert".to_string()))?;
        let key = config
            .ssl_key
            .as_deref()
            .ok_or_else(|| TargetdError::Invalid("ssl=true requires ssl_key".to_string()))?;
        let rustls_config = crate::tls::load(Path::new(cert), Path::new(key)).await?;
        info!(%addr, cert, "starting HTTPS JSON-RPC listener");
        axum_server::bind_rustls(addr, rustls_config)
            .handle(handle)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await?;
    } else {
        warn!("ssl disabled; serving JSON-RPC over plaintext HTTP");
        info!(%addr, "starting HTTP JSON-RPC listener");
        axum_server::bind(addr)
            .handle(handle)
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await?;
    }
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/targetrpc", post(handle_rpc))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(enforce_body_limit))
}

/// Reads the whole body up front and rejects with 413 if it exceeds
/// `MAX_BODY_BYTES`, before the request ever reaches route matching.
async fn enforce_body_limit(request: Request, next: Next) -> Response {
    let (parts, body) = request.into_parts();
    match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
        Ok(bytes) => {
            let request = Request::from_parts(parts, Body::from(bytes));
            next.run(request).await
        }
        Err(_) => StatusCode::PAYLOAD_TOO_LARGE.into_response(),
    }
}

/// `POST /targetrpc`: tarpit check, HTTP Basic auth, then dispatch.
/// Always responds 200 once the body has been accepted and
/// authenticated — protocol and method errors travel inside the
/// JSON-RPC envelope, per spec.md §4.9.
async fn handle_rpc(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let client_ip = peer.ip();

    if state.tarpit.is_locked(client_ip) {
        metrics::record_tarpit_lockout();
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let auth_header = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    if !auth::check_credentials(&state.config, auth_header) {
        let _guard = state.tarpit.flag(client_ip);
        metrics::record_auth_failure();
        tokio::time::sleep(Duration::from_secs(2)).await;
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let response = state.dispatcher.handle(&body).await;
    let payload = serde_json::to_vec(&response).expect("RpcResponse always serializes");
    (StatusCode::OK, [(header::CONTENT_TYPE, "application/json")], payload).into_response()
}
