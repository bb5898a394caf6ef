//! Alert values, fan-out, and the grouped rate-limited notifier.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use crate::config::AlertConfig;

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    /// Worth a look.
    Warning,
    /// Something is broken.
    Error,
    /// Someone should be paged.
    Critical,
}

impl AlertSeverity {
    /// Marker shown in notification text.
    pub fn marker(&self) -> &'static str {
        match self {
            AlertSeverity::Warning => "WARN",
            AlertSeverity::Error => "ERROR",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

/// One pipeline alert.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    /// Type key: `stuck_task`, `slow_processing`, `high_failure_rate`,
    /// `service_unhealthy`, …
    pub alert_type: String,
    /// Severity.
    pub severity: AlertSeverity,
    /// Human-readable message.
    pub message: String,
    /// Structured details.
    pub details: serde_json::Value,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Affected user, when known.
    pub user_id: Option<i64>,
    /// Affected analysis record, when known.
    pub analysis_id: Option<i64>,
}

impl Alert {
    /// Build an alert stamped now.
    pub fn new(
        alert_type: impl Into<String>,
        severity: AlertSeverity,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            alert_type: alert_type.into(),
            severity,
            message: message.into(),
            details,
            timestamp: Utc::now(),
            user_id: None,
            analysis_id: None,
        }
    }

    /// Attach the affected user.
    pub fn with_user(mut self, user_id: i64) -> Self {
        self.user_id = Some(user_id);
        self
    }

    /// Attach the affected analysis record.
    pub fn with_analysis(mut self, analysis_id: i64) -> Self {
        self.analysis_id = Some(analysis_id);
        self
    }
}

/// Receives dispatched alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Handle one alert.
    async fn send(&self, alert: &Alert);
}

/// Fans alerts out to registered sinks, de-duplicating repeats of the same
/// `(type, analysis_id)` key while the condition persists.
pub struct AlertDispatcher {
    sinks: Mutex<Vec<Arc<dyn AlertSink>>>,
    seen: Mutex<HashMap<(String, Option<i64>), Instant>>,
    dedupe_window: std::time::Duration,
    history: Mutex<Vec<Alert>>,
}

impl AlertDispatcher {
    /// Create a dispatcher with a 30-minute de-duplication window.
    pub fn new() -> Self {
        Self::with_dedupe_window(std::time::Duration::from_secs(1800))
    }

    /// Create a dispatcher with a custom de-duplication window.
    pub fn with_dedupe_window(dedupe_window: std::time::Duration) -> Self {
        Self {
            sinks: Mutex::new(Vec::new()),
            seen: Mutex::new(HashMap::new()),
            dedupe_window,
            history: Mutex::new(Vec::new()),
        }
    }

    /// Register a sink.
    pub fn add_sink(&self, sink: Arc<dyn AlertSink>) {
        self.sinks.lock().push(sink);
    }

    /// Dispatch one alert. Returns false when it was de-duplicated.
    pub async fn dispatch(&self, alert: Alert) -> bool {
        let key = (alert.alert_type.clone(), alert.analysis_id);
        {
            let mut seen = self.seen.lock();
            if let Some(last) = seen.get(&key) {
                if last.elapsed() < self.dedupe_window {
                    return false;
                }
            }
            seen.insert(key, Instant::now());
        }

        tracing::warn!(
            alert_type = %alert.alert_type,
            severity = alert.severity.marker(),
            message = %alert.message,
            "pipeline alert"
        );

        let sinks: Vec<Arc<dyn AlertSink>> = self.sinks.lock().clone();
        for sink in sinks {
            sink.send(&alert).await;
        }
        self.history.lock().push(alert);
        true
    }

    /// Clear the de-duplication memory for a key, so a recovered-then-
    /// re-broken condition can alert again.
    pub fn clear_key(&self, alert_type: &str, analysis_id: Option<i64>) {
        self.seen
            .lock()
            .remove(&(alert_type.to_string(), analysis_id));
    }

    /// Recent alerts, for ops inspection.
    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        let history = self.history.lock();
        let skip = history.len().saturating_sub(limit);
        history.iter().skip(skip).cloned().collect()
    }
}

impl Default for AlertDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Delivery channel for the notifier (a Telegram bot in deployments).
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Deliver one message to one chat.
    async fn deliver(&self, chat_id: i64, text: &str);
}

/// In-process channel capturing messages, for tests.
#[derive(Default)]
pub struct MemoryChannel {
    messages: Mutex<Vec<(i64, String)>>,
}

impl MemoryChannel {
    /// Create an empty channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Delivered messages so far.
    pub fn messages(&self) -> Vec<(i64, String)> {
        self.messages.lock().clone()
    }
}

#[async_trait]
impl NotificationChannel for MemoryChannel {
    async fn deliver(&self, chat_id: i64, text: &str) {
        self.messages.lock().push((chat_id, text.to_string()));
    }
}

struct TypeThrottle {
    count: u32,
    window_started: Instant,
}

struct PendingGroup {
    alerts: Vec<Alert>,
    first_at: Instant,
}

/// How many alerts a grouped message lists before the "+ rest" tail.
const GROUP_PREVIEW: usize = 3;
/// Pending alerts of one type that force a flush.
const GROUP_FLUSH_AT: usize = 5;

/// Alert sink with per-type rate limiting and grouping.
///
/// At most `max_per_type` notifications per alert type per window; alerts
/// of the same type arriving within the group window are coalesced into a
/// single message listing the first few and a "+ N more" tail.
pub struct GroupingNotifier {
    config: AlertConfig,
    channel: Arc<dyn NotificationChannel>,
    throttles: Mutex<HashMap<String, TypeThrottle>>,
    pending: Mutex<HashMap<String, PendingGroup>>,
}

impl GroupingNotifier {
    /// Create a notifier over `channel`.
    pub fn new(config: AlertConfig, channel: Arc<dyn NotificationChannel>) -> Self {
        Self {
            config,
            channel,
            throttles: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Flush groups whose window elapsed. Call periodically.
    pub async fn flush_due(&self) {
        let due: Vec<String> = {
            let pending = self.pending.lock();
            pending
                .iter()
                .filter(|(_, group)| group.first_at.elapsed() >= self.config.group_window)
                .map(|(alert_type, _)| alert_type.clone())
                .collect()
        };
        for alert_type in due {
            self.flush_type(&alert_type).await;
        }
    }

    /// Flush every pending group immediately. Used on shutdown and tests.
    pub async fn flush_all(&self) {
        let types: Vec<String> = self.pending.lock().keys().cloned().collect();
        for alert_type in types {
            self.flush_type(&alert_type).await;
        }
    }

    async fn flush_type(&self, alert_type: &str) {
        let group = match self.pending.lock().remove(alert_type) {
            Some(group) if !group.alerts.is_empty() => group,
            _ => return,
        };

        if !self.allow(alert_type) {
            tracing::debug!(alert_type, "alert notification throttled");
            return;
        }

        let text = format_group(alert_type, &group.alerts);
        for chat_id in &self.config.admin_ids {
            self.channel.deliver(*chat_id, &text).await;
        }
    }

    fn allow(&self, alert_type: &str) -> bool {
        let mut throttles = self.throttles.lock();
        let throttle = throttles
            .entry(alert_type.to_string())
            .or_insert_with(|| TypeThrottle {
                count: 0,
                window_started: Instant::now(),
            });

        if throttle.window_started.elapsed() >= self.config.window {
            throttle.count = 0;
            throttle.window_started = Instant::now();
        }
        if throttle.count >= self.config.max_per_type {
            return false;
        }
        throttle.count += 1;
        true
    }
}

#[async_trait]
impl AlertSink for GroupingNotifier {
    async fn send(&self, alert: &Alert) {
        if !self.config.enabled {
            return;
        }

        let flush_now = {
            let mut pending = self.pending.lock();
            let group = pending
                .entry(alert.alert_type.clone())
                .or_insert_with(|| PendingGroup {
                    alerts: Vec::new(),
                    first_at: Instant::now(),
                });
            group.alerts.push(alert.clone());
            group.alerts.len() >= GROUP_FLUSH_AT
                || group.first_at.elapsed() >= self.config.group_window
        };

        if flush_now {
            self.flush_type(&alert.alert_type).await;
        }
    }
}

fn format_group(alert_type: &str, alerts: &[Alert]) -> String {
    let severity = alerts
        .iter()
        .map(|a| a.severity)
        .max()
        .unwrap_or(AlertSeverity::Warning);

    let mut text = format!(
        "[{}] {} x{}\n",
        severity.marker(),
        alert_type,
        alerts.len()
    );
    for alert in alerts.iter().take(GROUP_PREVIEW) {
        text.push_str(&format!("- {}\n", alert.message));
    }
    if alerts.len() > GROUP_PREVIEW {
        text.push_str(&format!("+ {} more", alerts.len() - GROUP_PREVIEW));
    }
    text.trim_end().to_string()
}
