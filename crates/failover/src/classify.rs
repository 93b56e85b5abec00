//! Upstream failure classification
//!
//! A pure function of the upstream response: status, headers, and (for the
//! statuses that need it) a bounded slice of the body. The verdict tells the
//! forwarding loop whether to hand the response to the caller, try the next
//! provider, or pull this provider out of rotation first.
//!
//! The 429 heuristics are keyword-driven because the provider ecosystem is
//! heterogeneous: OpenAI-compatible gateways, Anthropic-native endpoints, and
//! assorted resellers each spell "your key is dead" differently. New
//! conventions go into [`RULES_429`]; the control flow never changes.

use std::fmt;
use std::time::Duration;

use http::{HeaderMap, StatusCode};

use crate::retry_after::retry_after_duration;

/// How much response body the classifier will look at for JSON heuristics.
pub const CLASSIFY_BODY_LIMIT: usize = 32 * 1024;

/// How much of the body is kept as a diagnostic snippet.
pub const SNIPPET_LIMIT: usize = 2048;

/// What the forwarding loop should do with an upstream response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Not a failure the proxy handles: commit the response to the caller.
    ReturnToClient,
    /// Transient: move on to the next provider, optionally cooling this one
    /// down for the Retry-After-advised duration.
    RetryNext,
    /// Hard failure (auth, billing, quota): deactivate, then move on.
    DeactivateAndRetryNext,
}

/// Why a provider was skipped or deactivated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    Auth,
    Billing,
    Quota,
    RateLimit,
    Overloaded,
    Server,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::Auth => "auth",
            FailureReason::Billing => "billing",
            FailureReason::Quota => "quota",
            FailureReason::RateLimit => "rate_limit",
            FailureReason::Overloaded => "overloaded",
            FailureReason::Server => "server",
        }
    }

    /// Whether an all-providers-cooled response should be 429 rather than 503.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, FailureReason::RateLimit | FailureReason::Overloaded)
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifier output.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub action: FailureAction,
    pub reason: Option<FailureReason>,
    /// Truncated body excerpt for logs; empty for return-to-client.
    pub snippet: String,
    /// Upstream-advised cooldown for retry-next verdicts; zero otherwise.
    pub cooldown: Duration,
}

impl Verdict {
    fn return_to_client() -> Self {
        Verdict {
            action: FailureAction::ReturnToClient,
            reason: None,
            snippet: String::new(),
            cooldown: Duration::ZERO,
        }
    }
}

/// One row of the 429 keyword table. Matching is case-insensitive; `codes`
/// and `types` are exact matches, `message_contains` are substring matches.
struct KeywordRule {
    action: FailureAction,
    reason: FailureReason,
    codes: &'static [&'static str],
    types: &'static [&'static str],
    message_contains: &'static [&'static str],
}

const RULES_429: &[KeywordRule] = &[
    KeywordRule {
        action: FailureAction::DeactivateAndRetryNext,
        reason: FailureReason::Auth,
        codes: &["invalid_api_key", "account_deactivated"],
        types: &["authentication_error", "permission_error", "invalid_api_key"],
        message_contains: &["invalid api key"],
    },
    KeywordRule {
        action: FailureAction::DeactivateAndRetryNext,
        reason: FailureReason::Quota,
        codes: &[
            "insufficient_quota",
            "billing_hard_limit_reached",
            "organization_quota_exceeded",
        ],
        types: &["insufficient_quota", "billing_error"],
        message_contains: &["insufficient quota", "billing"],
    },
    KeywordRule {
        action: FailureAction::RetryNext,
        reason: FailureReason::Overloaded,
        codes: &[],
        types: &["overloaded_error"],
        message_contains: &[],
    },
    KeywordRule {
        action: FailureAction::RetryNext,
        reason: FailureReason::RateLimit,
        codes: &["rate_limit_exceeded", "requests", "tokens"],
        types: &["rate_limit_exceeded", "rate_limit_error"],
        message_contains: &["rate limit", "too many requests"],
    },
];

impl KeywordRule {
    fn matches(&self, code: &str, typ: &str, message: &str) -> bool {
        self.codes.contains(&code)
            || self.types.contains(&typ)
            || self
                .message_contains
                .iter()
                .any(|needle| message.contains(needle))
    }
}

/// Classify an upstream response.
///
/// `body` is the response body read up to [`CLASSIFY_BODY_LIMIT`]; callers
/// only need to supply it for statuses where [`needs_body`] is true.
pub fn classify_failure(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Verdict {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Verdict {
            action: FailureAction::DeactivateAndRetryNext,
            reason: Some(FailureReason::Auth),
            snippet: snippet(body),
            cooldown: Duration::ZERO,
        },
        StatusCode::PAYMENT_REQUIRED => Verdict {
            action: FailureAction::DeactivateAndRetryNext,
            reason: Some(FailureReason::Billing),
            snippet: snippet(body),
            cooldown: Duration::ZERO,
        },
        StatusCode::TOO_MANY_REQUESTS => {
            let (action, reason) = classify_429(body);
            let cooldown = if action == FailureAction::RetryNext {
                retry_after_duration(headers)
            } else {
                Duration::ZERO
            };
            Verdict {
                action,
                reason: Some(reason),
                snippet: snippet(body),
                cooldown,
            }
        }
        _ if is_retryable_status(status) => Verdict {
            action: FailureAction::RetryNext,
            reason: Some(FailureReason::Server),
            snippet: snippet(body),
            cooldown: retry_after_duration(headers),
        },
        _ => Verdict::return_to_client(),
    }
}

/// Whether the classifier wants the response body for this status.
pub fn needs_body(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::UNAUTHORIZED
            | StatusCode::FORBIDDEN
            | StatusCode::PAYMENT_REQUIRED
            | StatusCode::TOO_MANY_REQUESTS
    ) || is_retryable_status(status)
}

fn is_retryable_status(status: StatusCode) -> bool {
    matches!(status.as_u16(), 408 | 500 | 502 | 503 | 504 | 529)
}

fn classify_429(body: &[u8]) -> (FailureAction, FailureReason) {
    let Ok(value) = serde_json::from_slice::<serde_json::Value>(body) else {
        return (FailureAction::RetryNext, FailureReason::RateLimit);
    };

    let (code, typ, message) = extract_error_fields(&value);
    let code = code.to_lowercase();
    let typ = typ.to_lowercase();
    let message = message.to_lowercase();

    for rule in RULES_429 {
        if rule.matches(&code, &typ, &message) {
            return (rule.action, rule.reason);
        }
    }
    (FailureAction::RetryNext, FailureReason::RateLimit)
}

/// Fold the two error shapes in the wild into `(code, type, message)`:
/// OpenAI-style `{"error":{"code","type","message"}}`, and Anthropic-style /
/// root-level `{"type","code","message"}`.
fn extract_error_fields(value: &serde_json::Value) -> (&str, &str, &str) {
    let Some(root) = value.as_object() else {
        return ("", "", "");
    };

    let obj = match root.get("error").and_then(|e| e.as_object()) {
        Some(error_obj) => error_obj,
        None => root,
    };

    let field = |key: &str| obj.get(key).and_then(|v| v.as_str()).unwrap_or("");
    (field("code"), field("type"), field("message"))
}

/// Lossy, bounded body excerpt for diagnostics.
pub fn snippet(body: &[u8]) -> String {
    let mut s = String::from_utf8_lossy(body).into_owned();
    if s.len() > SNIPPET_LIMIT {
        let mut cut = SNIPPET_LIMIT;
        while !s.is_char_boundary(cut) {
            cut -= 1;
        }
        s.truncate(cut);
        s.push_str("...");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn no_headers() -> HeaderMap {
        HeaderMap::new()
    }

    fn retry_after(secs: &str) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert("retry-after", HeaderValue::from_str(secs).unwrap());
        h
    }

    fn status(code: u16) -> StatusCode {
        StatusCode::from_u16(code).unwrap()
    }

    #[test]
    fn auth_statuses_deactivate() {
        for code in [401, 403] {
            let v = classify_failure(status(code), &no_headers(), b"denied");
            assert_eq!(v.action, FailureAction::DeactivateAndRetryNext);
            assert_eq!(v.reason, Some(FailureReason::Auth));
            assert_eq!(v.snippet, "denied");
        }
    }

    #[test]
    fn payment_required_deactivates_as_billing() {
        let v = classify_failure(status(402), &no_headers(), b"");
        assert_eq!(v.action, FailureAction::DeactivateAndRetryNext);
        assert_eq!(v.reason, Some(FailureReason::Billing));
    }

    #[test]
    fn server_errors_retry_next() {
        for code in [408, 500, 502, 503, 504, 529] {
            let v = classify_failure(status(code), &no_headers(), b"oops");
            assert_eq!(v.action, FailureAction::RetryNext, "status {code}");
            assert_eq!(v.reason, Some(FailureReason::Server));
        }
    }

    #[test]
    fn server_error_carries_retry_after_cooldown() {
        let v = classify_failure(status(503), &retry_after("30"), b"");
        assert_eq!(v.cooldown, Duration::from_secs(30));
    }

    #[test]
    fn success_and_client_errors_return_to_client() {
        for code in [200, 201, 204, 400, 404, 409, 422] {
            let v = classify_failure(status(code), &no_headers(), b"");
            assert_eq!(v.action, FailureAction::ReturnToClient, "status {code}");
            assert_eq!(v.reason, None);
        }
    }

    #[test]
    fn rate_limit_429_openai_shape() {
        let body = br#"{"error":{"code":"rate_limit_exceeded","message":"Rate limit reached"}}"#;
        let v = classify_failure(status(429), &retry_after("120"), body);
        assert_eq!(v.action, FailureAction::RetryNext);
        assert_eq!(v.reason, Some(FailureReason::RateLimit));
        assert_eq!(v.cooldown, Duration::from_secs(120));
    }

    #[test]
    fn quota_429_deactivates_without_cooldown_hint() {
        let body = br#"{"error":{"code":"insufficient_quota"}}"#;
        let v = classify_failure(status(429), &retry_after("120"), body);
        assert_eq!(v.action, FailureAction::DeactivateAndRetryNext);
        assert_eq!(v.reason, Some(FailureReason::Quota));
        assert_eq!(v.cooldown, Duration::ZERO);
    }

    #[test]
    fn auth_429_anthropic_shape() {
        let body = br#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#;
        let v = classify_failure(status(429), &no_headers(), body);
        assert_eq!(v.action, FailureAction::DeactivateAndRetryNext);
        assert_eq!(v.reason, Some(FailureReason::Auth));
    }

    #[test]
    fn auth_429_root_level_code() {
        let body = br#"{"type":"invalid_request","code":"account_deactivated","message":""}"#;
        let v = classify_failure(status(429), &no_headers(), body);
        assert_eq!(v.reason, Some(FailureReason::Auth));
    }

    #[test]
    fn overloaded_429_is_its_own_reason() {
        let body = br#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        let v = classify_failure(status(429), &no_headers(), body);
        assert_eq!(v.action, FailureAction::RetryNext);
        assert_eq!(v.reason, Some(FailureReason::Overloaded));
    }

    #[test]
    fn billing_message_match_is_case_insensitive() {
        let body = br#"{"error":{"message":"Monthly BILLING hard limit reached"}}"#;
        let v = classify_failure(status(429), &no_headers(), body);
        assert_eq!(v.reason, Some(FailureReason::Quota));
    }

    #[test]
    fn unparsable_429_defaults_to_rate_limit() {
        let v = classify_failure(status(429), &retry_after("7"), b"<html>slow down</html>");
        assert_eq!(v.action, FailureAction::RetryNext);
        assert_eq!(v.reason, Some(FailureReason::RateLimit));
        assert_eq!(v.cooldown, Duration::from_secs(7));
    }

    #[test]
    fn unknown_json_429_defaults_to_rate_limit() {
        let body = br#"{"error":{"code":"something_new","message":"try later"}}"#;
        let v = classify_failure(status(429), &no_headers(), body);
        assert_eq!(v.reason, Some(FailureReason::RateLimit));
    }

    #[test]
    fn snippet_is_truncated_with_ellipsis() {
        let body = vec![b'x'; SNIPPET_LIMIT + 100];
        let v = classify_failure(status(500), &no_headers(), &body);
        assert_eq!(v.snippet.len(), SNIPPET_LIMIT + 3);
        assert!(v.snippet.ends_with("..."));
    }

    #[test]
    fn needs_body_matches_failure_statuses() {
        for code in [401, 402, 403, 408, 429, 500, 502, 503, 504, 529] {
            assert!(needs_body(status(code)), "status {code}");
        }
        for code in [200, 204, 400, 404] {
            assert!(!needs_body(status(code)), "status {code}");
        }
    }

    #[test]
    fn backpressure_reasons() {
        assert!(FailureReason::RateLimit.is_backpressure());
        assert!(FailureReason::Overloaded.is_backpressure());
        assert!(!FailureReason::Server.is_backpressure());
        assert!(!FailureReason::Auth.is_backpressure());
    }
}
