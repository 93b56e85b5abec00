//! Per-client failover state for upstream LLM providers
//!
//! Each CLI client kind (Claude Code, Codex, Gemini) owns an ordered provider
//! list. Requests stick to the last provider that answered; upstream failures
//! are classified into return-to-client, retry-next, or deactivate-and-retry-
//! next, and hard failures pull a provider out of rotation until its cooldown
//! expires. This crate holds the pure parts: provider records, the failure
//! classifier, Retry-After parsing, and the cooldown/sticky-index state. All
//! HTTP I/O lives in the service on top of it.

pub mod classify;
pub mod provider;
pub mod retry_after;
pub mod state;

pub use classify::{classify_failure, FailureAction, FailureReason, Verdict};
pub use provider::{enabled_providers, sort_by_priority, ClientKind, Provider};
pub use retry_after::{parse_duration_str, retry_after_duration, MAX_COOLDOWN};
pub use state::{Deactivation, FailoverState};
