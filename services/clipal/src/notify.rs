//! Desktop notifications
//!
//! A bounded-queue worker turns proxy events (provider switches, error-level
//! conditions) into desktop notifications without ever blocking a request:
//! enqueue is try_send and drops when the queue is full. The worker dedupes
//! identical events inside a 30 s window, caps throughput at 6 per minute,
//! truncates long messages, and redacts anything that looks like a key or
//! token. The actual delivery mechanism is an injected closure so tests (and
//! headless hosts) never touch the desktop bus.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use regex::Regex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use clipal_failover::ClientKind;

use crate::config::{LogLevel, NotificationsConfig};

const DEDUPE_WINDOW: Duration = Duration::from_secs(30);
const MAX_PER_MINUTE: usize = 6;
const MAX_MESSAGE_CHARS: usize = 280;
const QUEUE_CAPACITY: usize = 64;
const SEND_TIMEOUT: Duration = Duration::from_secs(2);
const DISABLE_COOLDOWN: Duration = Duration::from_secs(300);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Delivery mechanism: `(title, message)`.
pub type Sender = Arc<dyn Fn(&str, &str) -> anyhow::Result<()> + Send + Sync>;

/// The default sender shows a desktop notification.
pub fn desktop_sender() -> Sender {
    Arc::new(|title, message| {
        notify_rust::Notification::new()
            .summary(title)
            .body(message)
            .show()?;
        Ok(())
    })
}

struct Event {
    title: String,
    message: String,
    key: String,
}

struct Inner {
    min_level: LogLevel,
    provider_switch: bool,
    tx: mpsc::Sender<Event>,
}

/// Cheap-to-clone handle held by the proxies. A disabled notifier is a
/// no-op on every call.
#[derive(Clone)]
pub struct Notifier {
    inner: Option<Arc<Inner>>,
}

/// Owns the worker task; `shutdown` drains pending events with a cap.
pub struct NotifierWorker {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Notifier {
    pub fn disabled() -> Notifier {
        Notifier { inner: None }
    }

    pub fn spawn(config: &NotificationsConfig, sender: Sender) -> (Notifier, NotifierWorker) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(worker_loop(rx, stop_rx, sender));
        let notifier = Notifier {
            inner: Some(Arc::new(Inner {
                min_level: config.min_level(),
                provider_switch: config.provider_switch(),
                tx,
            })),
        };
        (notifier, NotifierWorker { stop: stop_tx, handle })
    }

    /// Notify that a client kind's active provider moved.
    pub fn provider_switched(
        &self,
        client: ClientKind,
        from: &str,
        to: &str,
        reason: &str,
        status: u16,
    ) {
        let Some(inner) = &self.inner else { return };
        if !inner.provider_switch {
            return;
        }
        let (from, to) = (from.trim(), to.trim());
        if from.is_empty() || to.is_empty() || from == to {
            return;
        }

        let mut message = format!("{client}: {from} → {to}");
        let reason = reason.trim();
        if !reason.is_empty() && status > 0 {
            message = format!("{message} ({reason} {status})");
        } else if !reason.is_empty() {
            message = format!("{message} ({reason})");
        } else if status > 0 {
            message = format!("{message} ({status})");
        }

        enqueue(
            inner,
            "clipal",
            &message,
            &format!("switch:{client}:{from}->{to}:{reason}"),
        );
    }

    /// Notify about a log-worthy condition at `level`; filtered by the
    /// configured minimum level.
    pub fn log_event(&self, level: LogLevel, message: &str) {
        let Some(inner) = &self.inner else { return };
        if level < inner.min_level {
            return;
        }
        let title = format!("clipal {}", level.as_str().to_uppercase());
        let key = format!("log:{level}:{message}");
        enqueue(inner, &title, message, &key);
    }
}

impl NotifierWorker {
    /// Stop the worker, draining whatever is already queued, capped at 5 s.
    pub async fn shutdown(self) {
        let _ = self.stop.send(());
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, self.handle).await.is_err() {
            tracing::warn!("notifier worker did not stop in time");
        }
    }
}

fn enqueue(inner: &Inner, title: &str, message: &str, key: &str) {
    let message = normalize_message(message);
    if message.is_empty() {
        return;
    }
    let event = Event {
        title: title.to_string(),
        message,
        key: key.to_string(),
    };
    // Best effort: drop when the queue is full.
    let _ = inner.tx.try_send(event);
}

async fn worker_loop(
    mut rx: mpsc::Receiver<Event>,
    mut stop: oneshot::Receiver<()>,
    sender: Sender,
) {
    let mut last_sent: HashMap<String, Instant> = HashMap::new();
    let mut window_start = Instant::now();
    let mut sent_in_window = 0usize;
    let mut disabled_until: Option<Instant> = None;

    loop {
        let event = tokio::select! {
            _ = &mut stop => break,
            event = rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };
        deliver(
            event,
            &sender,
            &mut last_sent,
            &mut window_start,
            &mut sent_in_window,
            &mut disabled_until,
        )
        .await;
    }

    // Drain what was already queued before the stop signal.
    while let Ok(event) = rx.try_recv() {
        deliver(
            event,
            &sender,
            &mut last_sent,
            &mut window_start,
            &mut sent_in_window,
            &mut disabled_until,
        )
        .await;
    }
}

async fn deliver(
    event: Event,
    sender: &Sender,
    last_sent: &mut HashMap<String, Instant>,
    window_start: &mut Instant,
    sent_in_window: &mut usize,
    disabled_until: &mut Option<Instant>,
) {
    let now = Instant::now();

    if now.duration_since(*window_start) >= Duration::from_secs(60) {
        *window_start = now;
        *sent_in_window = 0;
    }
    if *sent_in_window >= MAX_PER_MINUTE {
        return;
    }
    if let Some(t) = last_sent.get(&event.key) {
        if now.duration_since(*t) < DEDUPE_WINDOW {
            return;
        }
    }
    if let Some(until) = *disabled_until {
        if now < until {
            return;
        }
        *disabled_until = None;
    }

    last_sent.insert(event.key.clone(), now);
    *sent_in_window += 1;
    if last_sent.len() > 4 * QUEUE_CAPACITY {
        last_sent.retain(|_, t| now.duration_since(*t) < 2 * DEDUPE_WINDOW);
    }

    let sender = sender.clone();
    let send = tokio::task::spawn_blocking(move || sender(&event.title, &event.message));
    match tokio::time::timeout(SEND_TIMEOUT, send).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) => tracing::warn!(error = %e, "notification failed"),
        Ok(Err(e)) => tracing::warn!(error = %e, "notification sender panicked"),
        Err(_) => {
            *disabled_until = Some(now + DISABLE_COOLDOWN);
            tracing::warn!(
                "notification timed out after {SEND_TIMEOUT:?}; disabling for {DISABLE_COOLDOWN:?}"
            );
        }
    }
}

/// Redact secrets, collapse whitespace, and truncate.
fn normalize_message(message: &str) -> String {
    let redacted = redact_sensitive(message);
    let collapsed = redacted.split_whitespace().collect::<Vec<_>>().join(" ");
    let chars: Vec<char> = collapsed.chars().collect();
    if chars.len() > MAX_MESSAGE_CHARS {
        let mut out: String = chars[..MAX_MESSAGE_CHARS].iter().collect();
        out.push('…');
        out
    } else {
        collapsed
    }
}

static REDACTORS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    vec![
        (
            Regex::new(r"(?i)\b(bearer)\s+(\S+)").expect("redactor regex"),
            "$1 [redacted]",
        ),
        (
            Regex::new(r"\bsk-[A-Za-z0-9_-]{10,}\b").expect("redactor regex"),
            "[redacted]",
        ),
        (
            Regex::new(r"(?i)\b(api[_-]?key)\s*[:=]\s*(\S+)").expect("redactor regex"),
            "$1=[redacted]",
        ),
        (
            Regex::new(r"(?i)([?&](?:api[_-]?key|token|access[_-]?token)=)([^&\s]+)")
                .expect("redactor regex"),
            "$1[redacted]",
        ),
    ]
});

fn redact_sensitive(message: &str) -> String {
    let mut out = message.trim().to_string();
    for (pattern, replacement) in REDACTORS.iter() {
        out = pattern.replace_all(&out, *replacement).into_owned();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn collecting_sender() -> (Sender, Arc<Mutex<Vec<(String, String)>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let sender: Sender = Arc::new(move |title, message| {
            log2.lock()
                .unwrap()
                .push((title.to_string(), message.to_string()));
            Ok(())
        });
        (sender, log)
    }

    fn enabled_config() -> NotificationsConfig {
        NotificationsConfig {
            enabled: true,
            min_level: None,
            provider_switch: None,
        }
    }

    #[tokio::test]
    async fn provider_switch_formats_and_delivers() {
        let (sender, log) = collecting_sender();
        let (notifier, worker) = Notifier::spawn(&enabled_config(), sender);

        notifier.provider_switched(ClientKind::ClaudeCode, "main", "backup", "auth", 401);
        worker.shutdown().await;

        let sent = log.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "clipal");
        assert_eq!(sent[0].1, "claudecode: main → backup (auth 401)");
    }

    #[tokio::test]
    async fn identical_events_are_deduped() {
        let (sender, log) = collecting_sender();
        let (notifier, worker) = Notifier::spawn(&enabled_config(), sender);

        for _ in 0..5 {
            notifier.provider_switched(ClientKind::Codex, "a", "b", "server", 503);
        }
        worker.shutdown().await;

        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn per_minute_cap_applies() {
        let (sender, log) = collecting_sender();
        let (notifier, worker) = Notifier::spawn(&enabled_config(), sender);

        for i in 0..10 {
            notifier.log_event(LogLevel::Error, &format!("distinct failure {i}"));
        }
        worker.shutdown().await;

        assert_eq!(log.lock().unwrap().len(), MAX_PER_MINUTE);
    }

    #[tokio::test]
    async fn min_level_filters_low_severity() {
        let (sender, log) = collecting_sender();
        let (notifier, worker) = Notifier::spawn(&enabled_config(), sender);

        notifier.log_event(LogLevel::Warn, "just a warning");
        notifier.log_event(LogLevel::Error, "actual failure");
        worker.shutdown().await;

        let sent = log.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "clipal ERROR");
    }

    #[tokio::test]
    async fn provider_switch_can_be_disabled() {
        let (sender, log) = collecting_sender();
        let config = NotificationsConfig {
            enabled: true,
            min_level: None,
            provider_switch: Some(false),
        };
        let (notifier, worker) = Notifier::spawn(&config, sender);

        notifier.provider_switched(ClientKind::Gemini, "a", "b", "", 0);
        worker.shutdown().await;

        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn same_provider_switch_is_suppressed() {
        let (sender, log) = collecting_sender();
        let (notifier, worker) = Notifier::spawn(&enabled_config(), sender);

        notifier.provider_switched(ClientKind::Codex, "a", "a", "server", 503);
        worker.shutdown().await;

        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn messages_are_truncated() {
        let long = "x".repeat(500);
        let normalized = normalize_message(&long);
        assert_eq!(normalized.chars().count(), MAX_MESSAGE_CHARS + 1);
        assert!(normalized.ends_with('…'));
    }

    #[test]
    fn redaction_covers_common_secret_shapes() {
        assert_eq!(
            redact_sensitive("auth Bearer sk-abc failed"),
            "auth Bearer [redacted] failed"
        );
        assert_eq!(
            redact_sensitive("key sk-ant-REDACTED rejected"),
            "key [redacted] rejected"
        );
        assert_eq!(
            redact_sensitive("api_key: supersecret"),
            "api_key=[redacted]"
        );
        assert_eq!(
            redact_sensitive("GET /v1?api_key=abc123&x=1"),
            "GET /v1?api_key=[redacted]&x=1"
        );
    }

    #[test]
    fn disabled_notifier_is_a_no_op() {
        let notifier = Notifier::disabled();
        notifier.provider_switched(ClientKind::ClaudeCode, "a", "b", "auth", 401);
        notifier.log_event(LogLevel::Error, "nothing happens");
    }
}
