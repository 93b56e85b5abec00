//! Cooldown bookkeeping and sticky provider selection
//!
//! One [`FailoverState`] per client kind. The provider list is immutable for
//! the lifetime of the instance; a config reload builds a new one. Mutable
//! state - the deactivation records and the two sticky indices - sits behind
//! a single read-write lock. Lock-held regions are O(n) in provider count and
//! never perform I/O.
//!
//! The primary index tracks the provider the next request should try first.
//! The count-tokens index does the same for Claude's high-frequency
//! `count_tokens` traffic so its failures cannot evict the main
//! conversation's context cache. Both indices are hints: concurrent requests
//! may race on them and the last writer wins.

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::classify::FailureReason;
use crate::provider::{ClientKind, Provider};

/// A time-bounded exclusion of one provider from the active set.
#[derive(Debug, Clone)]
pub struct Deactivation {
    pub at: Instant,
    pub until: Instant,
    pub reason: FailureReason,
    pub status: u16,
    pub snippet: String,
}

impl Deactivation {
    fn is_active(&self, now: Instant) -> bool {
        now < self.until
    }
}

struct Inner {
    /// Parallel to the provider list; `None` means active.
    deactivated: Vec<Option<Deactivation>>,
    current_index: usize,
    count_tokens_index: usize,
}

impl Inner {
    fn provider_active(&self, index: usize, now: Instant) -> bool {
        match &self.deactivated[index] {
            Some(d) => !d.is_active(now),
            None => true,
        }
    }

    /// First active index scanning forward from `from + 1`, or `from` when
    /// every provider is deactivated.
    fn next_active(&self, from: usize, now: Instant) -> usize {
        let n = self.deactivated.len();
        if n == 0 {
            return 0;
        }
        for step in 1..=n {
            let index = (from + step) % n;
            if self.provider_active(index, now) {
                return index;
            }
        }
        from % n
    }
}

/// Failover state for one client kind: ordered providers, their deactivation
/// records, and the two sticky indices.
pub struct FailoverState {
    kind: ClientKind,
    providers: Vec<Provider>,
    inner: RwLock<Inner>,
}

impl FailoverState {
    pub fn new(kind: ClientKind, providers: Vec<Provider>) -> Self {
        let deactivated = providers.iter().map(|_| None).collect();
        FailoverState {
            kind,
            providers,
            inner: RwLock::new(Inner {
                deactivated,
                current_index: 0,
                count_tokens_index: 0,
            }),
        }
    }

    pub fn kind(&self) -> ClientKind {
        self.kind
    }

    pub fn providers(&self) -> &[Provider] {
        &self.providers
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn name(&self, index: usize) -> &str {
        self.providers
            .get(index)
            .map(|p| p.name.as_str())
            .unwrap_or("?")
    }

    /// Whether the provider at `index` is currently excluded from rotation.
    pub fn is_deactivated(&self, index: usize) -> bool {
        let inner = self.read();
        match inner.deactivated.get(index) {
            Some(Some(d)) => d.is_active(Instant::now()),
            _ => false,
        }
    }

    /// Snapshot of the deactivation record at `index`, if one is active.
    pub fn deactivation(&self, index: usize) -> Option<Deactivation> {
        let inner = self.read();
        inner
            .deactivated
            .get(index)
            .and_then(|d| d.clone())
            .filter(|d| d.is_active(Instant::now()))
    }

    /// Exclude a provider for `cooldown`. A non-positive cooldown is a no-op,
    /// and an already-active deactivation is never extended - a storm of
    /// rate-limit responses must not push the expiry forward forever. If the
    /// primary index points at the deactivated provider it advances to the
    /// next active one.
    pub fn deactivate_for(
        &self,
        index: usize,
        reason: FailureReason,
        status: u16,
        snippet: String,
        cooldown: Duration,
    ) {
        if cooldown.is_zero() {
            return;
        }
        let now = Instant::now();
        let mut inner = self.write();
        if index >= inner.deactivated.len() {
            return;
        }
        if let Some(existing) = &inner.deactivated[index] {
            if existing.is_active(now) {
                return;
            }
        }
        inner.deactivated[index] = Some(Deactivation {
            at: now,
            until: now + cooldown,
            reason,
            status,
            snippet,
        });
        if inner.current_index == index {
            inner.current_index = inner.next_active(index, now);
        }
        drop(inner);
        warn!(
            client = %self.kind,
            provider = self.name(index),
            reason = %reason,
            status,
            cooldown_secs = cooldown.as_secs(),
            "provider deactivated"
        );
    }

    /// Clear every deactivation whose expiry has passed, logging each
    /// reactivation. Called opportunistically on requests and from the
    /// watcher tick so reactivations are logged even on an idle proxy.
    pub fn reactivate_expired(&self) {
        let now = Instant::now();
        let mut reactivated = Vec::new();
        let mut inner = self.write();
        for index in 0..inner.deactivated.len() {
            let expired = matches!(&inner.deactivated[index], Some(d) if !d.is_active(now));
            if expired {
                inner.deactivated[index] = None;
                reactivated.push(index);
            }
        }
        drop(inner);
        for index in reactivated {
            info!(
                client = %self.kind,
                provider = self.name(index),
                "provider reactivated"
            );
        }
    }

    /// Number of providers not currently deactivated.
    pub fn active_count(&self) -> usize {
        let now = Instant::now();
        let inner = self.read();
        (0..inner.deactivated.len())
            .filter(|&i| inner.provider_active(i, now))
            .count()
    }

    /// Soonest time until some deactivated provider becomes available, with
    /// the reason attached to that record. `None` when nothing is cooling
    /// down. Ties resolve to the lowest index.
    pub fn time_until_next_available(&self) -> Option<(Duration, FailureReason)> {
        let now = Instant::now();
        let inner = self.read();
        let mut soonest: Option<(Instant, FailureReason)> = None;
        for d in inner.deactivated.iter().flatten() {
            if !d.is_active(now) {
                continue;
            }
            if soonest.map(|(until, _)| d.until < until).unwrap_or(true) {
                soonest = Some((d.until, d.reason));
            }
        }
        soonest.map(|(until, reason)| (until - now, reason))
    }

    /// First active index after `from` in ring order, or `from` if none.
    pub fn next_active_index(&self, from: usize) -> usize {
        self.read().next_active(from, Instant::now())
    }

    /// Resolve the primary start index, advancing off a deactivated current.
    pub fn ensure_active_start(&self) -> usize {
        self.ensure_active(false)
    }

    /// Same for the count-tokens index; never touches the primary.
    pub fn ensure_active_count_tokens_start(&self) -> usize {
        self.ensure_active(true)
    }

    fn ensure_active(&self, count_tokens: bool) -> usize {
        let now = Instant::now();
        let mut inner = self.write();
        let n = inner.deactivated.len();
        if n == 0 {
            return 0;
        }
        let index = if count_tokens {
            &mut inner.count_tokens_index
        } else {
            &mut inner.current_index
        };
        if *index >= n {
            *index = 0;
        }
        let current = *index;
        if inner.provider_active(current, now) {
            return current;
        }
        let next = inner.next_active(current, now);
        if count_tokens {
            inner.count_tokens_index = next;
        } else {
            inner.current_index = next;
        }
        next
    }

    pub fn current_index(&self) -> usize {
        self.read().current_index
    }

    pub fn set_current_index(&self, index: usize) {
        self.write().current_index = index;
    }

    pub fn count_tokens_index(&self) -> usize {
        self.read().count_tokens_index
    }

    pub fn set_count_tokens_index(&self, index: usize) {
        self.write().count_tokens_index = index;
    }
}
