//! Request forwarding with failover
//!
//! One [`ClientProxy`] per client kind. The inbound body is buffered once and
//! replayed for every attempt; provider attempts walk the ring starting at
//! the sticky index, skipping cooled-down providers; upstream verdicts come
//! from the pure classifier. Responses stream back chunk by chunk so SSE and
//! incremental model output reach the client immediately - once the first
//! byte of a body has been handed to the caller the response is committed and
//! no further failover happens.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::body::Body;
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use http_body_util::BodyExt;
use tracing::{debug, error, info, warn};

use clipal_failover::classify::{self, FailureAction, FailureReason};
use clipal_failover::{classify_failure, ClientKind, FailoverState, Provider, MAX_COOLDOWN};

use crate::config::Config;
use crate::notify::Notifier;

/// Hop-by-hop headers per RFC 2616 section 13.5.1; never forwarded in either
/// direction.
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_MAX_IDLE_PER_HOST: usize = 10;

const X_API_KEY: &str = "x-api-key";

/// Proxy for one client kind: ordered providers, shared upstream client, and
/// the failover state.
pub struct ClientProxy {
    state: FailoverState,
    client: reqwest::Client,
    reactivate_after: Duration,
    notifier: Notifier,
}

impl ClientProxy {
    pub fn new(
        kind: ClientKind,
        providers: Vec<Provider>,
        reactivate_after: Duration,
        upstream_idle: Duration,
        notifier: Notifier,
    ) -> anyhow::Result<Self> {
        // Compression stays off (no gzip/brotli features) so upstream bytes
        // pass through unmodified; HTTP/2 is negotiated via ALPN.
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(upstream_idle)
            .build()
            .context("failed to build upstream HTTP client")?;
        Ok(ClientProxy {
            state: FailoverState::new(kind, providers),
            client,
            reactivate_after,
            notifier,
        })
    }

    pub fn kind(&self) -> ClientKind {
        self.state.kind()
    }

    pub fn failover(&self) -> &FailoverState {
        &self.state
    }

    /// Forward a request with failover across the active providers.
    pub async fn forward(
        &self,
        req: Request<Body>,
        upstream_path: &str,
        peer: Option<SocketAddr>,
        max_body: usize,
    ) -> Response {
        self.state.reactivate_expired();

        let (parts, body) = req.into_parts();
        let body_bytes = match read_buffered_body(body, max_body).await {
            Ok(bytes) => bytes,
            Err(resp) => return resp,
        };

        let active = self.state.active_count();
        if active == 0 {
            return self.unavailable_response();
        }

        let start = self.state.ensure_active_start();
        let n = self.state.len();
        let mut attempted = 0usize;

        for offset in 0..n {
            if attempted >= active {
                break;
            }
            let index = (start + offset) % n;
            if self.state.is_deactivated(index) {
                continue;
            }
            attempted += 1;
            let provider = &self.state.providers()[index];

            debug!(
                client = %self.kind(),
                provider = %provider.name,
                attempt = attempted,
                active,
                "forwarding"
            );

            let upstream_req = match self.build_upstream_request(
                &parts,
                provider,
                upstream_path,
                body_bytes.clone(),
                peer,
            ) {
                Ok(r) => r,
                Err(e) => {
                    error!(
                        client = %self.kind(),
                        provider = %provider.name,
                        error = %e,
                        "failed to build upstream request"
                    );
                    continue;
                }
            };

            let resp = match self.client.execute(upstream_req).await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(
                        client = %self.kind(),
                        provider = %provider.name,
                        error = %e,
                        "upstream transport failure, switching to next provider"
                    );
                    self.advance_current(index, "network", 0);
                    continue;
                }
            };

            let status = resp.status();
            if !classify::needs_body(status) {
                self.state.set_current_index(index);
                if status == StatusCode::OK {
                    info!(
                        client = %self.kind(),
                        provider = %provider.name,
                        "request completed"
                    );
                }
                return stream_response(resp);
            }

            let resp_headers = resp.headers().clone();
            let body = read_classify_body(resp).await;
            let verdict = classify_failure(status, &resp_headers, &body);
            match verdict.action {
                FailureAction::ReturnToClient => {
                    self.state.set_current_index(index);
                    return buffered_response(status, &resp_headers, body);
                }
                FailureAction::DeactivateAndRetryNext => {
                    let reason = verdict.reason.unwrap_or(FailureReason::Server);
                    self.state.deactivate_for(
                        index,
                        reason,
                        status.as_u16(),
                        verdict.snippet.clone(),
                        self.reactivate_after,
                    );
                    error!(
                        client = %self.kind(),
                        provider = %provider.name,
                        reason = %reason,
                        status = status.as_u16(),
                        snippet = %verdict.snippet,
                        "provider deactivated, switching to next provider"
                    );
                    self.advance_current(index, reason.as_str(), status.as_u16());
                }
                FailureAction::RetryNext => {
                    let reason = verdict.reason.unwrap_or(FailureReason::Server);
                    if !verdict.cooldown.is_zero() {
                        self.state.deactivate_for(
                            index,
                            reason,
                            status.as_u16(),
                            verdict.snippet.clone(),
                            verdict.cooldown.min(MAX_COOLDOWN),
                        );
                    }
                    warn!(
                        client = %self.kind(),
                        provider = %provider.name,
                        reason = %reason,
                        status = status.as_u16(),
                        "upstream failed, switching to next provider"
                    );
                    self.advance_current(index, reason.as_str(), status.as_u16());
                }
            }
        }

        // Every attempt in this request may have installed a cooldown; tell
        // the caller when to come back.
        if self.state.active_count() == 0 {
            if let Some((wait, reason)) = self.state.time_until_next_available() {
                if wait > Duration::ZERO {
                    return cooldown_response(wait, reason);
                }
            }
        }
        error!(client = %self.kind(), "all providers failed");
        plain_text(StatusCode::SERVICE_UNAVAILABLE, "All providers failed")
    }

    /// Forward a Claude Code `count_tokens` request on the isolated sticky
    /// index. These calls are frequent and tied to the upstream's prompt
    /// cache, so their transient failures must not move the primary index.
    /// Hard auth/billing failures still deactivate the provider for all
    /// traffic via the shared cooldown table.
    pub async fn forward_count_tokens(
        &self,
        req: Request<Body>,
        upstream_path: &str,
        peer: Option<SocketAddr>,
        max_body: usize,
    ) -> Response {
        self.state.reactivate_expired();

        let (parts, body) = req.into_parts();
        let body_bytes = match read_buffered_body(body, max_body).await {
            Ok(bytes) => bytes,
            Err(resp) => return resp,
        };

        let active = self.state.active_count();
        if active == 0 {
            return self.unavailable_response();
        }

        let start = self.state.ensure_active_count_tokens_start();
        let n = self.state.len();
        let mut attempted = 0usize;

        for offset in 0..n {
            if attempted >= active {
                break;
            }
            let index = (start + offset) % n;
            if self.state.is_deactivated(index) {
                continue;
            }
            attempted += 1;
            let provider = &self.state.providers()[index];

            let upstream_req = match self.build_upstream_request(
                &parts,
                provider,
                upstream_path,
                body_bytes.clone(),
                peer,
            ) {
                Ok(r) => r,
                Err(e) => {
                    error!(
                        client = %self.kind(),
                        provider = %provider.name,
                        error = %e,
                        "failed to build upstream request (count_tokens)"
                    );
                    self.state
                        .set_count_tokens_index(self.state.next_active_index(index));
                    continue;
                }
            };

            let resp = match self.client.execute(upstream_req).await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(
                        client = %self.kind(),
                        provider = %provider.name,
                        error = %e,
                        "upstream transport failure (count_tokens), trying next provider"
                    );
                    self.state
                        .set_count_tokens_index(self.state.next_active_index(index));
                    continue;
                }
            };

            let status = resp.status();
            match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                    let snippet = classify::snippet(&read_classify_body(resp).await);
                    self.state.deactivate_for(
                        index,
                        FailureReason::Auth,
                        status.as_u16(),
                        snippet.clone(),
                        self.reactivate_after,
                    );
                    self.state
                        .set_count_tokens_index(self.state.next_active_index(index));
                    error!(
                        client = %self.kind(),
                        provider = %provider.name,
                        status = status.as_u16(),
                        snippet = %snippet,
                        "provider deactivated (count_tokens auth)"
                    );
                }
                StatusCode::PAYMENT_REQUIRED => {
                    let snippet = classify::snippet(&read_classify_body(resp).await);
                    self.state.deactivate_for(
                        index,
                        FailureReason::Billing,
                        status.as_u16(),
                        snippet.clone(),
                        self.reactivate_after,
                    );
                    self.state
                        .set_count_tokens_index(self.state.next_active_index(index));
                    error!(
                        client = %self.kind(),
                        provider = %provider.name,
                        status = status.as_u16(),
                        snippet = %snippet,
                        "provider deactivated (count_tokens billing)"
                    );
                }
                s if s.is_server_error() || s == StatusCode::TOO_MANY_REQUESTS => {
                    let snippet = classify::snippet(&read_classify_body(resp).await);
                    self.state
                        .set_count_tokens_index(self.state.next_active_index(index));
                    warn!(
                        client = %self.kind(),
                        provider = %provider.name,
                        status = status.as_u16(),
                        snippet = %snippet,
                        "upstream failed (count_tokens), trying next provider"
                    );
                }
                _ => {
                    self.state.set_count_tokens_index(index);
                    return stream_response(resp);
                }
            }
        }

        error!(client = %self.kind(), "all providers failed (count_tokens)");
        plain_text(StatusCode::SERVICE_UNAVAILABLE, "All providers failed")
    }

    /// Move the primary index off `index` after a failure and raise a
    /// provider-switch notification when it lands somewhere else.
    fn advance_current(&self, index: usize, reason: &str, status: u16) {
        let next = self.state.next_active_index(index);
        self.state.set_current_index(next);
        if next != index {
            let providers = self.state.providers();
            self.notifier.provider_switched(
                self.kind(),
                &providers[index].name,
                &providers[next].name,
                reason,
                status,
            );
        }
    }

    /// Nothing is active right now: surface the soonest cooldown expiry as a
    /// Retry-After, 429 for backpressure reasons and 503 otherwise.
    fn unavailable_response(&self) -> Response {
        match self.state.time_until_next_available() {
            Some((wait, reason)) if wait > Duration::ZERO => cooldown_response(wait, reason),
            _ => {
                error!(client = %self.kind(), "all providers unavailable");
                plain_text(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "All providers are unavailable",
                )
            }
        }
    }

    fn build_upstream_request(
        &self,
        parts: &Parts,
        provider: &Provider,
        path: &str,
        body: Bytes,
        peer: Option<SocketAddr>,
    ) -> anyhow::Result<reqwest::Request> {
        let url = build_target_url(&provider.base_url, path, parts.uri.query())?;
        let mut req = self
            .client
            .request(parts.method.clone(), url)
            .body(body)
            .build()?;

        let headers = req.headers_mut();
        for (name, value) in &parts.headers {
            // Host is set from the target URL; the caller's value names the
            // proxy, not the upstream.
            if is_hop_by_hop(name.as_str()) || name == header::HOST {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }
        // reqwest derives Content-Length from the buffered body.
        headers.remove(header::CONTENT_LENGTH);

        add_forwarded_headers(headers, parts, peer);

        // Claude-style clients authenticate with x-api-key, OpenAI-style
        // with a bearer token; override whichever convention the caller used.
        if parts.headers.contains_key(X_API_KEY) {
            let key = HeaderValue::from_str(provider.api_key.expose())
                .context("provider api_key is not a valid header value")?;
            headers.insert(HeaderName::from_static(X_API_KEY), key);
        } else {
            let bearer = format!("Bearer {}", provider.api_key.expose());
            headers.insert(
                header::AUTHORIZATION,
                HeaderValue::from_str(&bearer)
                    .context("provider api_key is not a valid header value")?,
            );
        }

        Ok(req)
    }
}

/// Build the client proxy set from a configuration: one per client kind with
/// at least one enabled provider.
pub fn build_proxies(
    config: &Config,
    notifier: &Notifier,
) -> anyhow::Result<HashMap<ClientKind, Arc<ClientProxy>>> {
    let reactivate_after = config.reactivate_after();
    let upstream_idle = config.upstream_idle_timeout();

    let mut proxies = HashMap::new();
    for kind in ClientKind::ALL {
        let providers = config.enabled_providers(kind);
        if providers.is_empty() {
            continue;
        }
        let proxy = ClientProxy::new(
            kind,
            providers,
            reactivate_after,
            upstream_idle,
            notifier.clone(),
        )?;
        proxies.insert(kind, Arc::new(proxy));
    }
    Ok(proxies)
}

/// Buffer the inbound body so every attempt can replay it. Over-cap bodies
/// are 413, transport failures 400.
async fn read_buffered_body(body: Body, limit: usize) -> Result<Bytes, Response> {
    match http_body_util::Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<http_body_util::LengthLimitError>().is_some() => Err(
            plain_text(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large"),
        ),
        Err(e) => {
            warn!(error = %e, "failed to read request body");
            Err(plain_text(
                StatusCode::BAD_REQUEST,
                "Failed to read request body",
            ))
        }
    }
}

/// Read up to the classifier's limit, then drain the rest so the connection
/// can be reused.
async fn read_classify_body(mut resp: reqwest::Response) -> Vec<u8> {
    let mut buf = Vec::new();
    loop {
        match resp.chunk().await {
            Ok(Some(chunk)) => {
                if buf.len() < classify::CLASSIFY_BODY_LIMIT {
                    let take = (classify::CLASSIFY_BODY_LIMIT - buf.len()).min(chunk.len());
                    buf.extend_from_slice(&chunk[..take]);
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
    buf
}

/// Commit an upstream response to the caller, streaming the body. Each chunk
/// is written as its own frame, which keeps SSE and incremental output
/// flowing.
fn stream_response(resp: reqwest::Response) -> Response {
    let status = resp.status();
    let mut out = Response::new(Body::empty());
    *out.status_mut() = status;
    copy_response_headers(out.headers_mut(), resp.headers());
    *out.body_mut() = Body::from_stream(resp.bytes_stream());
    out
}

fn buffered_response(status: StatusCode, headers: &HeaderMap, body: Vec<u8>) -> Response {
    let mut out = Response::new(Body::from(body));
    *out.status_mut() = status;
    copy_response_headers(out.headers_mut(), headers);
    out
}

fn copy_response_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    for (name, value) in src {
        if is_hop_by_hop(name.as_str()) {
            continue;
        }
        dst.append(name.clone(), value.clone());
    }
}

/// Plain-text response for errors generated by the proxy itself.
pub fn plain_text(status: StatusCode, message: &str) -> Response {
    let mut resp = Response::new(Body::from(format!("{message}\n")));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// 429/503 with a Retry-After of the soonest cooldown expiry, rounded up and
/// at least one second.
fn cooldown_response(wait: Duration, reason: FailureReason) -> Response {
    let mut secs = wait.as_secs();
    if wait.subsec_nanos() > 0 {
        secs += 1;
    }
    let secs = secs.max(1);

    let mut resp = if reason.is_backpressure() {
        plain_text(
            StatusCode::TOO_MANY_REQUESTS,
            "All providers are rate limited; retry later",
        )
    } else {
        plain_text(
            StatusCode::SERVICE_UNAVAILABLE,
            "All providers are temporarily unavailable; retry later",
        )
    };
    if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
        resp.headers_mut().insert(header::RETRY_AFTER, value);
    }
    resp
}

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Join a provider base URL with the rewritten request path. A scheme-less
/// base is assumed https; base and request paths join with exactly one
/// slash; the raw query string is carried over untouched.
pub fn build_target_url(
    base_url: &str,
    path: &str,
    raw_query: Option<&str>,
) -> anyhow::Result<String> {
    let base = base_url.trim();
    if base.is_empty() {
        anyhow::bail!("base_url is empty");
    }
    let with_scheme = if base.contains("://") {
        base.to_string()
    } else {
        format!("https://{base}")
    };
    let mut url: reqwest::Url = with_scheme
        .parse()
        .with_context(|| format!("invalid base_url {base:?}"))?;
    if url.host_str().is_none() {
        anyhow::bail!("invalid base_url {base:?}: host is empty");
    }

    let joined = single_joining_slash(url.path(), path);
    url.set_path(&joined);
    url.set_query(raw_query);
    url.set_fragment(None);
    Ok(url.to_string())
}

fn single_joining_slash(a: &str, b: &str) -> String {
    let a_slash = a.ends_with('/');
    let b_slash = b.starts_with('/');
    match (a_slash, b_slash) {
        (true, true) => format!("{a}{}", &b[1..]),
        (false, false) => {
            if a.is_empty() {
                format!("/{b}")
            } else {
                format!("{a}/{b}")
            }
        }
        _ => format!("{a}{b}"),
    }
}

fn add_forwarded_headers(headers: &mut HeaderMap, parts: &Parts, peer: Option<SocketAddr>) {
    if let Some(peer) = peer {
        let ip = peer.ip().to_string();
        let value = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
            Some(prior) if !prior.is_empty() => format!("{prior}, {ip}"),
            _ => ip,
        };
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(
                HeaderName::from_static("x-forwarded-for"),
                value,
            );
        }
    }

    // The listener is plain HTTP on localhost.
    headers.insert(
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_static("http"),
    );

    if let Some(host) = parts.headers.get(header::HOST) {
        headers.insert(HeaderName::from_static("x-forwarded-host"), host.clone());
        if let Some(port) = host.to_str().ok().and_then(host_port) {
            if let Ok(value) = HeaderValue::from_str(&port) {
                headers.insert(HeaderName::from_static("x-forwarded-port"), value);
            }
        }
    }
}

/// Port component of a `host:port` value; bare hosts and bracketed IPv6
/// literals without a port yield nothing.
fn host_port(host: &str) -> Option<String> {
    let idx = host.rfind(':')?;
    let port = &host[idx + 1..];
    if host.ends_with(']') || port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(port.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(is_hop_by_hop("keep-alive"));
        assert!(is_hop_by_hop("Proxy-Authorization"));
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("Authorization"));
        assert!(!is_hop_by_hop("x-api-key"));
    }

    #[test]
    fn target_url_gains_https_for_schemeless_base() {
        let url = build_target_url("api.example.com", "/v1/messages", None).unwrap();
        assert_eq!(url, "https://api.example.com/v1/messages");
    }

    #[test]
    fn target_url_keeps_explicit_scheme() {
        let url = build_target_url("http://localhost:8080", "/v1/messages", None).unwrap();
        assert_eq!(url, "http://localhost:8080/v1/messages");
    }

    #[test]
    fn target_url_joins_with_exactly_one_slash() {
        for base in [
            "https://api.example.com/proxy",
            "https://api.example.com/proxy/",
        ] {
            let url = build_target_url(base, "/v1/messages", None).unwrap();
            assert_eq!(url, "https://api.example.com/proxy/v1/messages", "base {base}");
        }
    }

    #[test]
    fn target_url_preserves_query() {
        let url =
            build_target_url("https://api.example.com", "/v1/models", Some("beta=true&v=2"))
                .unwrap();
        assert_eq!(url, "https://api.example.com/v1/models?beta=true&v=2");
    }

    #[test]
    fn target_url_rejects_empty_or_hostless_base() {
        assert!(build_target_url("", "/v1", None).is_err());
        assert!(build_target_url("   ", "/v1", None).is_err());
        assert!(build_target_url("https://", "/v1", None).is_err());
    }

    #[test]
    fn host_port_extraction() {
        assert_eq!(host_port("localhost:3333"), Some("3333".into()));
        assert_eq!(host_port("localhost"), None);
        assert_eq!(host_port("[::1]"), None);
        assert_eq!(host_port("host:"), None);
        assert_eq!(host_port("host:abc"), None);
    }

    #[test]
    fn cooldown_response_rounds_up_and_floors_at_one() {
        let resp = cooldown_response(Duration::from_millis(1500), FailureReason::RateLimit);
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "2");

        let resp = cooldown_response(Duration::from_millis(10), FailureReason::Server);
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(resp.headers()[header::RETRY_AFTER], "1");
    }

    #[test]
    fn cooldown_response_status_tracks_reason() {
        for reason in [FailureReason::RateLimit, FailureReason::Overloaded] {
            let resp = cooldown_response(Duration::from_secs(5), reason);
            assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        }
        for reason in [FailureReason::Auth, FailureReason::Quota, FailureReason::Server] {
            let resp = cooldown_response(Duration::from_secs(5), reason);
            assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        }
    }
}
