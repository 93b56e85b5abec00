//! Provider records and the client kinds they serve

use std::fmt;

use clipal_common::Secret;
use serde::Deserialize;

/// The CLI client kinds the proxy fronts. Each kind has its own ordered
/// provider list and its own failover state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientKind {
    ClaudeCode,
    Codex,
    Gemini,
}

impl ClientKind {
    pub const ALL: [ClientKind; 3] = [ClientKind::ClaudeCode, ClientKind::Codex, ClientKind::Gemini];

    /// Short label used in logs and error messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientKind::ClaudeCode => "claudecode",
            ClientKind::Codex => "codex",
            ClientKind::Gemini => "gemini",
        }
    }

    /// URL path prefix that routes to this client kind.
    pub fn path_prefix(&self) -> &'static str {
        match self {
            ClientKind::ClaudeCode => "/claudecode",
            ClientKind::Codex => "/codex",
            ClientKind::Gemini => "/gemini",
        }
    }
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single upstream endpoint for one client kind. Immutable for the lifetime
/// of a configuration generation; reloads build fresh lists.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Provider {
    pub name: String,
    pub base_url: String,
    pub api_key: Secret<String>,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub enabled: Option<bool>,
}

impl Provider {
    /// Whether the provider participates in failover (default true).
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }
}

/// Stable sort by ascending priority; providers sharing a priority keep their
/// file order.
pub fn sort_by_priority(providers: &mut [Provider]) {
    providers.sort_by_key(|p| p.priority);
}

/// The enabled subset, in priority order.
pub fn enabled_providers(providers: &[Provider]) -> Vec<Provider> {
    providers.iter().filter(|p| p.is_enabled()).cloned().collect()
}
