//! Pipeline monitoring: detectors, grouped rate-limited alerting, and
//! automatic lane recovery.

mod alerts;
mod auto_retry;
mod pipeline_monitor;

pub use alerts::{
    Alert, AlertDispatcher, AlertSeverity, AlertSink, GroupingNotifier, MemoryChannel,
    NotificationChannel,
};
pub use auto_retry::{AutoRetryConfig, AutoRetryManager, RetryPassStats};
pub use pipeline_monitor::{MonitorSnapshot, PipelineMonitor, QueueDepths};
