use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;

use anyhow::Result;
use chrono::{Duration, Local, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

/// Notification severity, mapped onto log levels by the logging sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
}

/// A single operator notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub title: String,
    pub message: String,
    pub severity: AlertSeverity,
    pub source: String,
}

impl Alert {
    pub fn new(
        severity: AlertSeverity,
        source: impl Into<String>,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            severity,
            source: source.into(),
        }
    }

    fn throttle_key(&self) -> String {
        format!("{}:{}", self.source, self.title)
    }
}

/// Delivery channel seam. Email/SMS transports live outside this crate and
/// plug in here; the in-repo sink writes to the log.
pub trait AlertSink: Send + Sync {
    fn send(&self, alert: &Alert) -> Result<()>;
}

/// Default sink: structured log lines.
pub struct LogSink;

impl AlertSink for LogSink {
    fn send(&self, alert: &Alert) -> Result<()> {
        match alert.severity {
            AlertSeverity::Info => info!("[{}] {}: {}", alert.source, alert.title, alert.message),
            AlertSeverity::Warning => {
                warn!("[{}] {}: {}", alert.source, alert.title, alert.message)
            }
            AlertSeverity::Error => {
                error!("[{}] {}: {}", alert.source, alert.title, alert.message)
            }
        }
        Ok(())
    }
}

/// Sends alerts through the configured sink, suppressing repeats of the same
/// (source, title) within the throttle window. The sent-history survives
/// restarts as a small JSON map.
pub struct AlertManager {
    sink: Box<dyn AlertSink>,
    history_path: PathBuf,
    sent: HashMap<String, NaiveDateTime>,
    throttle: Duration,
}

impl AlertManager {
    pub fn new(history_path: PathBuf, throttle_minutes: i64, sink: Box<dyn AlertSink>) -> Self {
        let sent = load_history(&history_path);
        Self {
            sink,
            history_path,
            sent,
            throttle: Duration::minutes(throttle_minutes),
        }
    }

    /// Deliver an alert unless an identical one went out recently. Returns
    /// whether delivery was attempted and succeeded; failures are logged and
    /// never propagate to the caller's cycle.
    pub fn send(&mut self, alert: &Alert) -> bool {
        self.send_at(alert, Local::now().naive_local())
    }

    fn send_at(&mut self, alert: &Alert, now: NaiveDateTime) -> bool {
        let key = alert.throttle_key();
        if let Some(last) = self.sent.get(&key)
            && now - *last <= self.throttle
        {
            debug!("alert throttled: {key}");
            return false;
        }
        match self.sink.send(alert) {
            Ok(()) => {
                self.sent.insert(key, now);
                self.save_history();
                true
            }
            Err(e) => {
                warn!("alert delivery failed for {key}: {e:#}");
                false
            }
        }
    }

    fn save_history(&self) {
        let serializable: HashMap<&String, String> = self
            .sent
            .iter()
            .map(|(k, v)| (k, v.format("%Y-%m-%dT%H:%M:%S").to_string()))
            .collect();
        if let Ok(json) = serde_json::to_string_pretty(&serializable) {
            if let Some(parent) = self.history_path.parent() {
                fs::create_dir_all(parent).ok();
            }
            if let Err(e) = fs::write(&self.history_path, json) {
                warn!("could not persist alert history: {e}");
            }
        }
    }
}

fn load_history(path: &PathBuf) -> HashMap<String, NaiveDateTime> {
    let Ok(raw) = fs::read_to_string(path) else {
        return HashMap::new();
    };
    let Ok(map) = serde_json::from_str::<HashMap<String, String>>(&raw) else {
        warn!("alert history at {} is unreadable, starting fresh", path.display());
        return HashMap::new();
    };
    map.into_iter()
        .filter_map(|(k, v)| {
            NaiveDateTime::parse_from_str(&v, "%Y-%m-%dT%H:%M:%S")
                .ok()
                .map(|t| (k, t))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::tempdir;

    struct RecordingSink(Arc<Mutex<Vec<String>>>);

    impl AlertSink for RecordingSink {
        fn send(&self, alert: &Alert) -> Result<()> {
            self.0.lock().unwrap().push(alert.title.clone());
            Ok(())
        }
    }

    struct FailingSink;

    impl AlertSink for FailingSink {
        fn send(&self, _alert: &Alert) -> Result<()> {
            anyhow::bail!("smtp down")
        }
    }

    fn ts(s: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M").unwrap()
    }

    #[test]
    fn duplicate_alerts_are_throttled_within_the_window() {
        let dir = tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut mgr = AlertManager::new(
            dir.path().join("alert_history.json"),
            60,
            Box::new(RecordingSink(seen.clone())),
        );
        let alert = Alert::new(AlertSeverity::Warning, "scada5", "data is stale", "old");
        assert!(mgr.send_at(&alert, ts("2025-01-01 10:00")));
        assert!(!mgr.send_at(&alert, ts("2025-01-01 10:30")));
        assert!(mgr.send_at(&alert, ts("2025-01-01 11:30")));
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn different_sources_are_throttled_independently() {
        let dir = tempdir().unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut mgr = AlertManager::new(
            dir.path().join("alert_history.json"),
            60,
            Box::new(RecordingSink(seen.clone())),
        );
        let a = Alert::new(AlertSeverity::Warning, "scada5", "stale", "x");
        let b = Alert::new(AlertSeverity::Warning, "prices5", "stale", "x");
        assert!(mgr.send_at(&a, ts("2025-01-01 10:00")));
        assert!(mgr.send_at(&b, ts("2025-01-01 10:00")));
    }

    #[test]
    fn throttle_history_persists_across_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("alert_history.json");
        let alert = Alert::new(AlertSeverity::Info, "registry", "new units", "A1");
        {
            let mut mgr = AlertManager::new(path.clone(), 60, Box::new(LogSink));
            assert!(mgr.send_at(&alert, ts("2025-01-01 10:00")));
        }
        let mut mgr = AlertManager::new(path, 60, Box::new(LogSink));
        assert!(!mgr.send_at(&alert, ts("2025-01-01 10:30")));
    }

    #[test]
    fn delivery_failure_does_not_mark_the_alert_sent() {
        let dir = tempdir().unwrap();
        let mut mgr = AlertManager::new(
            dir.path().join("alert_history.json"),
            60,
            Box::new(FailingSink),
        );
        let alert = Alert::new(AlertSeverity::Error, "scada5", "missing", "x");
        assert!(!mgr.send_at(&alert, ts("2025-01-01 10:00")));
        assert!(!mgr.sent.contains_key("scada5:missing"));
    }
}
