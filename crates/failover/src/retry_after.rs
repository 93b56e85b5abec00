//! Upstream backoff hints
//!
//! Providers advertise cooldowns three ways: a standard `Retry-After` header
//! (delta-seconds or HTTP-date), and OpenAI-style `X-RateLimit-Reset-Requests`
//! / `X-RateLimit-Reset-Tokens` headers carrying duration strings (`200ms`,
//! `1s`) or bare seconds. The effective cooldown is the maximum of whatever
//! parses, clamped to one hour.

use std::time::{Duration, SystemTime};

use http::HeaderMap;

/// Upper bound on any cooldown derived from upstream hints.
pub const MAX_COOLDOWN: Duration = Duration::from_secs(3600);

/// Extract the advised cooldown from a 429/5xx response's headers.
///
/// Returns `Duration::ZERO` when no usable hint is present.
pub fn retry_after_duration(headers: &HeaderMap) -> Duration {
    let mut max = Duration::ZERO;

    if let Some(d) = header_str(headers, "retry-after").and_then(parse_retry_after) {
        max = max.max(d);
    }
    for name in ["x-ratelimit-reset-requests", "x-ratelimit-reset-tokens"] {
        if let Some(d) = header_str(headers, name).and_then(parse_duration_hint) {
            max = max.max(d);
        }
    }

    max.min(MAX_COOLDOWN)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Parse a `Retry-After` value: delta-seconds or an HTTP-date.
/// A date in the past yields zero; a negative delta yields nothing.
pub fn parse_retry_after(v: &str) -> Option<Duration> {
    let v = v.trim();
    if v.is_empty() {
        return None;
    }
    if let Ok(secs) = v.parse::<i64>() {
        if secs < 0 {
            return None;
        }
        return Some(Duration::from_secs(secs as u64));
    }
    let when = httpdate::parse_http_date(v).ok()?;
    Some(
        when.duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO),
    )
}

/// Parse an `X-RateLimit-Reset-*` value: a duration string (`20ms`, `1s`,
/// `2m`) or a bare integer meaning seconds.
pub fn parse_duration_hint(v: &str) -> Option<Duration> {
    let v = v.trim();
    if v.is_empty() {
        return None;
    }
    if let Some(d) = parse_duration_str(v) {
        return Some(d);
    }
    let secs = v.parse::<i64>().ok()?;
    if secs < 0 {
        return None;
    }
    Some(Duration::from_secs(secs as u64))
}

/// Parse a compound duration string: one or more `<number><unit>` segments
/// with units `ns`, `us`, `ms`, `s`, `m`, `h` (e.g. `90s`, `1h30m`, `1.5h`).
/// This is the grammar the config files use for `reactivate_after` and
/// `upstream_idle_timeout` as well.
pub fn parse_duration_str(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if s == "0" {
        return Some(Duration::ZERO);
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let num_end = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if num_end == 0 {
            return None;
        }
        let value: f64 = rest[..num_end].parse().ok()?;
        rest = &rest[num_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_end] {
            "ns" => 1e-9,
            "us" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return None,
        };
        rest = &rest[unit_end..];

        total += Duration::try_from_secs_f64(value * seconds_per_unit).ok()?;
    }
    Some(total)
}
