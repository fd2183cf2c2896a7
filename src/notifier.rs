// =============================================================================
// Notifier — bounded priority queue with pacing, mass grouping, 429 retry
// =============================================================================
//
// Alerts are queued by severity (critical first, FIFO within a severity) into
// a bounded heap; when the queue is full the new message is dropped and
// logged. A worker task dequeues one message per NOTIFIER_DELAY tick and
// hands it to the transport.
//
// Mass grouping: a sliding window of recently dequeued messages is kept per
// kind. When more of the same kind than MASS_ALERT_THRESHOLD sit in the
// window at dequeue time, one aggregated message replaces the individual one
// and the window is purged for that kind.
//
// On stop the worker is cancelled and the remaining queue drains with the
// normal pacing.
// =============================================================================

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::types::{now_ts, AnomalyKind, Severity};

/// Transport failure modes the notifier reacts to.
#[derive(Debug)]
pub enum TransportError {
    /// The chat endpoint asked us to slow down.
    RateLimited { retry_after_secs: u64 },
    Other(anyhow::Error),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RateLimited { retry_after_secs } => {
                write!(f, "rate limited, retry after {retry_after_secs}s")
            }
            Self::Other(e) => write!(f, "{e}"),
        }
    }
}

/// Outbound chat channel. The notifier core never references a concrete
/// messenger; tests inject a recording mock.
#[async_trait]
pub trait AlertTransport: Send + Sync {
    async fn deliver(&self, text: &str) -> Result<(), TransportError>;
}

// ── Telegram transport ───────────────────────────────────────────────────────

/// Telegram Bot API sendMessage transport (HTML parse mode).
pub struct TelegramTransport {
    client: reqwest::Client,
    token: String,
    chat_id: i64,
}

impl TelegramTransport {
    pub fn new(token: impl Into<String>, chat_id: i64) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .expect("failed to build reqwest client for TelegramTransport"),
            token: token.into(),
            chat_id,
        }
    }
}

#[async_trait]
impl AlertTransport for TelegramTransport {
    async fn deliver(&self, text: &str) -> Result<(), TransportError> {
        if self.token.is_empty() || self.chat_id == 0 {
            debug!("no telegram credentials, skipping notification");
            return Ok(());
        }
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.token);
        let resp = self
            .client
            .post(&url)
            .json(&serde_json::json!({
                "chat_id": self.chat_id,
                "text": text,
                "parse_mode": "HTML",
            }))
            .send()
            .await
            .map_err(|e| TransportError::Other(e.into()))?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }
        let body: serde_json::Value = resp.json().await.unwrap_or_default();
        if status.as_u16() == 429 {
            let retry_after_secs = body["parameters"]["retry_after"].as_u64().unwrap_or(5);
            return Err(TransportError::RateLimited { retry_after_secs });
        }
        Err(TransportError::Other(anyhow::anyhow!(
            "telegram send failed: HTTP {status}: {body}"
        )))
    }
}

// ── Queue internals ──────────────────────────────────────────────────────────

struct QueuedAlert {
    severity: Severity,
    /// Monotonic enqueue sequence, for FIFO within a severity.
    seq: u64,
    enqueued_at: i64,
    text: String,
    kind: Option<AnomalyKind>,
}

impl PartialEq for QueuedAlert {
    fn eq(&self, other: &Self) -> bool {
        self.severity == other.severity && self.seq == other.seq
    }
}
impl Eq for QueuedAlert {}

impl Ord for QueuedAlert {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: highest severity first, then oldest first.
        self.severity
            .cmp(&other.severity)
            .then(other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for QueuedAlert {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct RecentAlert {
    kind: AnomalyKind,
    enqueued_at: i64,
    text: String,
}

struct NotifierInner {
    cfg: Arc<Config>,
    transport: Arc<dyn AlertTransport>,
    queue: Mutex<BinaryHeap<QueuedAlert>>,
    seq: AtomicU64,
    recent: Mutex<Vec<RecentAlert>>,
}

/// Priority-queued alert dispatcher.
pub struct Notifier {
    inner: Arc<NotifierInner>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// Gate applied to cycle-emitted anomalies: OI flushes always notify, the
/// rest must reach the configured severity floor.
pub fn should_notify(kind: AnomalyKind, severity: Severity, min_severity: Severity) -> bool {
    kind == AnomalyKind::OiFlush || severity >= min_severity
}

impl Notifier {
    pub fn new(cfg: Arc<Config>, transport: Arc<dyn AlertTransport>) -> Self {
        Self {
            inner: Arc::new(NotifierInner {
                cfg,
                transport,
                queue: Mutex::new(BinaryHeap::new()),
                seq: AtomicU64::new(0),
                recent: Mutex::new(Vec::new()),
            }),
            cancel: CancellationToken::new(),
            worker: Mutex::new(None),
        }
    }

    /// Spawn the pacing worker.
    pub fn start(&self) {
        let inner = self.inner.clone();
        let cancel = self.cancel.clone();
        let delay = Duration::from_secs_f64(inner.cfg.notifier_delay);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {
                        inner.process_next().await;
                    }
                }
            }
        });
        *self.worker.lock() = Some(handle);
        info!("notifier worker started");
    }

    /// Queue one alert. Full queue drops the new message.
    pub fn enqueue(&self, text: impl Into<String>, severity: Severity, kind: Option<AnomalyKind>) {
        let mut queue = self.inner.queue.lock();
        if queue.len() >= self.inner.cfg.notifier_max_queue {
            warn!(severity = %severity, "notifier queue full, dropping message");
            return;
        }
        queue.push(QueuedAlert {
            severity,
            seq: self.inner.seq.fetch_add(1, Ordering::Relaxed),
            enqueued_at: now_ts(),
            text: text.into(),
            kind,
        });
    }

    pub fn queue_len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    /// Cancel the worker, then drain the remaining queue with normal pacing.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        let delay = Duration::from_secs_f64(self.inner.cfg.notifier_delay);
        loop {
            let msg = self.inner.queue.lock().pop();
            let Some(msg) = msg else { break };
            self.inner.send_with_retry(&msg.text).await;
            tokio::time::sleep(delay).await;
        }
        info!("notifier stopped");
    }
}

impl NotifierInner {
    /// Dequeue and dispatch one message. Returns false when the queue was
    /// empty.
    async fn process_next(&self) -> bool {
        let msg = self.queue.lock().pop();
        let Some(msg) = msg else {
            return false;
        };

        let now = now_ts();
        // The mass-alert window slides over enqueue times.
        let grouped = if let Some(kind) = msg.kind {
            let mut recent = self.recent.lock();
            recent.push(RecentAlert {
                kind,
                enqueued_at: msg.enqueued_at,
                text: msg.text.clone(),
            });
            recent.retain(|m| now - m.enqueued_at < self.cfg.mass_alert_window);

            let same_kind = recent.iter().filter(|m| m.kind == kind).count();
            if same_kind > self.cfg.mass_alert_threshold {
                let grouped = group_mass_alert(
                    recent.iter().filter(|m| m.kind == kind).collect::<Vec<_>>(),
                    kind,
                );
                recent.retain(|m| m.kind != kind);
                Some(grouped)
            } else {
                None
            }
        } else {
            None
        };

        if let Some(grouped) = grouped {
            self.send_with_retry(&grouped).await;
            return true;
        }

        self.send_with_retry(&msg.text).await;
        true
    }

    /// Deliver, retrying exactly once on a rate-limit hint; any other failure
    /// drops the message.
    async fn send_with_retry(&self, text: &str) {
        match self.transport.deliver(text).await {
            Ok(()) => {}
            Err(TransportError::RateLimited { retry_after_secs }) => {
                warn!(retry_after_secs, "chat transport rate limited, retrying once");
                tokio::time::sleep(Duration::from_secs(retry_after_secs)).await;
                if let Err(e) = self.transport.deliver(text).await {
                    error!(error = %e, "retry send failed, dropping message");
                }
            }
            Err(e) => {
                error!(error = %e, "chat transport error, dropping message");
            }
        }
    }
}

/// Build the aggregated replacement message for a burst of same-kind alerts.
fn group_mass_alert(messages: Vec<&RecentAlert>, kind: AnomalyKind) -> String {
    let mut symbols: Vec<String> = Vec::new();
    for m in &messages {
        for part in m.text.split_whitespace() {
            let cleaned = part.trim_end_matches("</b>").trim_end_matches(':');
            if cleaned.ends_with("USDT") {
                symbols.push(cleaned.to_string());
                break;
            }
        }
    }
    let mut listed = symbols
        .iter()
        .take(6)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    if symbols.len() > 6 {
        listed.push_str("...");
    }
    format!(
        "\u{1f534} MASS ALERT: {} pairs with {}\n{}\n\u{26a0}\u{fe0f} Market-wide event",
        messages.len(),
        kind.as_str(),
        listed
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[derive(Default)]
    struct MockTransport {
        sent: Mutex<Vec<String>>,
        rate_limit_first: AtomicU32,
    }

    #[async_trait]
    impl AlertTransport for MockTransport {
        async fn deliver(&self, text: &str) -> Result<(), TransportError> {
            if self.rate_limit_first.load(Ordering::Relaxed) > 0 {
                self.rate_limit_first.fetch_sub(1, Ordering::Relaxed);
                return Err(TransportError::RateLimited {
                    retry_after_secs: 0,
                });
            }
            self.sent.lock().push(text.to_string());
            Ok(())
        }
    }

    fn notifier_with(cfg: Config) -> (Notifier, Arc<MockTransport>) {
        let transport = Arc::new(MockTransport::default());
        let n = Notifier::new(Arc::new(cfg), transport.clone());
        (n, transport)
    }

    fn fast_cfg() -> Config {
        Config {
            notifier_delay: 0.0,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn dequeues_by_severity_then_fifo() {
        let (n, transport) = notifier_with(fast_cfg());
        n.enqueue("low one", Severity::Low, None);
        n.enqueue("medium one", Severity::Medium, None);
        n.enqueue("critical one", Severity::Critical, None);
        n.enqueue("critical two", Severity::Critical, None);

        for _ in 0..4 {
            assert!(n.inner.process_next().await);
        }
        assert!(!n.inner.process_next().await);

        let sent = transport.sent.lock();
        assert_eq!(
            *sent,
            vec!["critical one", "critical two", "medium one", "low one"]
        );
    }

    #[tokio::test]
    async fn full_queue_drops_newest() {
        let cfg = Config {
            notifier_max_queue: 2,
            ..fast_cfg()
        };
        let (n, _) = notifier_with(cfg);
        n.enqueue("a", Severity::Low, None);
        n.enqueue("b", Severity::Low, None);
        n.enqueue("c", Severity::Critical, None);
        assert_eq!(n.queue_len(), 2);
    }

    #[tokio::test]
    async fn mass_alert_replaces_sixth_same_kind_message() {
        let (n, transport) = notifier_with(fast_cfg());
        let symbols = ["AAAUSDT", "BBBUSDT", "CCCUSDT", "DDDUSDT", "EEEUSDT", "FFFUSDT"];
        for sym in symbols {
            n.enqueue(
                format!("\u{1f7e0} OI SURGE: {sym}\nOI surge +15.00%"),
                Severity::High,
                Some(AnomalyKind::OiSurge),
            );
        }
        for _ in 0..6 {
            n.inner.process_next().await;
        }

        let sent = transport.sent.lock();
        assert_eq!(sent.len(), 6);
        let last = sent.last().unwrap();
        assert!(last.contains("MASS ALERT: 6 pairs with oi_surge"));
        for sym in symbols {
            assert!(last.contains(sym));
        }
        // The window was purged for that kind.
        assert!(n.inner.recent.lock().is_empty());
    }

    #[tokio::test]
    async fn rate_limit_retries_once_then_delivers() {
        let (n, transport) = notifier_with(fast_cfg());
        transport.rate_limit_first.store(1, Ordering::Relaxed);
        n.enqueue("hello", Severity::High, None);
        n.inner.process_next().await;
        assert_eq!(*transport.sent.lock(), vec!["hello"]);
    }

    #[tokio::test]
    async fn rate_limit_twice_drops_message() {
        let (n, transport) = notifier_with(fast_cfg());
        transport.rate_limit_first.store(2, Ordering::Relaxed);
        n.enqueue("hello", Severity::High, None);
        n.inner.process_next().await;
        assert!(transport.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn stop_drains_queue_in_severity_order() {
        let (n, transport) = notifier_with(fast_cfg());
        n.enqueue("low", Severity::Low, None);
        n.enqueue("critical", Severity::Critical, None);
        n.stop().await;

        let sent = transport.sent.lock();
        assert_eq!(*sent, vec!["critical", "low"]);
        assert_eq!(n.queue_len(), 0);
    }

    #[tokio::test]
    async fn stop_cancels_running_worker() {
        let (n, transport) = notifier_with(fast_cfg());
        n.start();
        n.enqueue("only", Severity::High, None);
        n.stop().await;
        assert_eq!(n.queue_len(), 0);
        assert_eq!(transport.sent.lock().len(), 1);
    }

    #[test]
    fn notify_gate_always_passes_flush() {
        assert!(should_notify(
            AnomalyKind::OiFlush,
            Severity::Low,
            Severity::High
        ));
        assert!(should_notify(
            AnomalyKind::FundingSpike,
            Severity::Critical,
            Severity::High
        ));
        assert!(should_notify(
            AnomalyKind::OiSurge,
            Severity::High,
            Severity::High
        ));
        assert!(!should_notify(
            AnomalyKind::LsExtreme,
            Severity::Medium,
            Severity::High
        ));
    }
}
