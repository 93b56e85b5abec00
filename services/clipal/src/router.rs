//! HTTP surface and dispatch
//!
//! One server on `listen_addr:port`. The first path segment picks the client
//! kind (`/claudecode`, `/codex`, `/gemini`), `/health` answers liveness
//! probes, everything else is 404. The matched prefix is stripped before
//! forwarding. The router holds the `(config, proxies)` pair behind one
//! read-write lock: requests take a read snapshot, hot-reload swaps both
//! under the write lock, and in-flight requests finish against the instance
//! they started with.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::{warn, Instrument};
use uuid::Uuid;

use clipal_failover::ClientKind;

use crate::config::Config;
use crate::proxy::{plain_text, ClientProxy};

/// The swappable pair: configuration and the proxies built from it.
pub struct Shared {
    pub config: Config,
    pub proxies: HashMap<ClientKind, Arc<ClientProxy>>,
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<RwLock<Shared>>,
}

impl AppState {
    pub fn new(config: Config, proxies: HashMap<ClientKind, Arc<ClientProxy>>) -> AppState {
        AppState {
            inner: Arc::new(RwLock::new(Shared { config, proxies })),
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, Shared> {
        self.inner.read().await
    }

    /// Atomically replace configuration and proxies (hot-reload).
    pub async fn swap(&self, config: Config, proxies: HashMap<ClientKind, Arc<ClientProxy>>) {
        let mut shared = self.inner.write().await;
        shared.config = config;
        shared.proxies = proxies;
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", any(health_handler))
        .fallback(dispatch)
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        r#"{"status":"healthy"}"#,
    )
}

async fn dispatch(State(state): State<AppState>, req: Request<Body>) -> Response {
    let path = req.uri().path().to_string();
    let Some((kind, stripped)) = match_client_path(&path) else {
        warn!(%path, "unknown path prefix");
        return plain_text(
            StatusCode::NOT_FOUND,
            "Unknown endpoint. Use /claudecode, /codex, or /gemini",
        );
    };

    let (proxy, max_body, ignore_count_tokens) = {
        let shared = state.read().await;
        (
            shared.proxies.get(&kind).cloned(),
            shared.config.global.max_request_body_bytes as usize,
            shared.config.global.ignore_count_tokens_failover,
        )
    };
    let Some(proxy) = proxy else {
        warn!(client = %kind, "no providers configured");
        return plain_text(
            StatusCode::SERVICE_UNAVAILABLE,
            &format!("No providers configured for {kind}"),
        );
    };

    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let request_id = format!("req_{}", Uuid::new_v4().as_simple());
    let span = tracing::info_span!(
        "request",
        id = %request_id,
        client = %kind,
        method = %req.method(),
        path = %stripped,
    );

    let count_tokens = kind == ClientKind::ClaudeCode
        && ignore_count_tokens
        && is_count_tokens_path(&stripped);

    async move {
        if count_tokens {
            proxy
                .forward_count_tokens(req, &stripped, peer, max_body)
                .await
        } else {
            proxy.forward(req, &stripped, peer, max_body).await
        }
    }
    .instrument(span)
    .await
}

fn match_client_path(path: &str) -> Option<(ClientKind, String)> {
    for kind in ClientKind::ALL {
        if let Some(stripped) = strip_client_prefix(path, kind.path_prefix()) {
            return Some((kind, stripped));
        }
    }
    None
}

/// `/claudecode` and `/claudecode/` rewrite to `/`; `/claudecode/v1/x` to
/// `/v1/x`; `/claudecodeX` is not a match.
fn strip_client_prefix(path: &str, prefix: &str) -> Option<String> {
    if path == prefix {
        return Some("/".to_string());
    }
    let rest = path.strip_prefix(prefix)?;
    if !rest.starts_with('/') {
        return None;
    }
    Some(rest.to_string())
}

fn is_count_tokens_path(path: &str) -> bool {
    path == "/v1/messages/count_tokens" || path == "/v1/messages/count_tokens/"
}
