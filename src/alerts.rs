//! Fire-and-forget alert delivery
//!
//! The evaluation path only ever calls [`AlertDispatcher::notify`], which
//! applies the per-key cooldown and does a non-blocking `try_send`. Delivery
//! happens on a separate [`AlertWorker`] task; failures are logged and
//! counted by a per-sink breaker, never retried and never propagated.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{self, AlertConfig};
use crate::error::{GuardError, GuardResult};
use crate::sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    RegimeChange,
    StrategyDisabled,
}

/// Structured alert payload sent to the notification collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub kind: AlertKind,
    /// Rate-limit key; alerts sharing a key are spaced by the cooldown
    pub key: String,
    pub title: String,
    pub trigger: String,
    pub metrics: BTreeMap<String, f64>,
    pub recommended_action: String,
    pub timestamp: DateTime<Utc>,
}

impl Alert {
    pub fn new(kind: AlertKind, key: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            kind,
            key: key.into(),
            title: title.into(),
            trigger: String::new(),
            metrics: BTreeMap::new(),
            recommended_action: String::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = trigger.into();
        self
    }

    pub fn with_metric(mut self, name: &str, value: Option<f64>) -> Self {
        if let Some(v) = value {
            self.metrics.insert(name.to_string(), v);
        }
        self
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.recommended_action = action.into();
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Single-line text rendering for log-style sinks
    pub fn summary(&self) -> String {
        let metrics = self
            .metrics
            .iter()
            .map(|(k, v)| format!("{}={:.2}", k, v))
            .collect::<Vec<_>>()
            .join(" ");
        format!(
            "{} | trigger: {} | {} | action: {}",
            self.title, self.trigger, metrics, self.recommended_action
        )
    }
}

/// Destination for alerts. Called from a blocking worker thread.
pub trait AlertSink: Send + Sync {
    fn name(&self) -> &str;

    fn deliver(&self, alert: &Alert) -> GuardResult<()>;
}

/// Writes alerts to the tracing log
#[derive(Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn name(&self) -> &str {
        "log"
    }

    fn deliver(&self, alert: &Alert) -> GuardResult<()> {
        warn!("🚨 ALERT {}", alert.summary());
        Ok(())
    }
}

/// POSTs the JSON payload to a webhook
pub struct WebhookAlertSink {
    client: reqwest::blocking::Client,
    url: String,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>) -> GuardResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(StdDuration::from_secs(10))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl AlertSink for WebhookAlertSink {
    fn name(&self) -> &str {
        "webhook"
    }

    fn deliver(&self, alert: &Alert) -> GuardResult<()> {
        let response = self.client.post(&self.url).json(alert).send()?;
        if !response.status().is_success() {
            return Err(GuardError::Notification(format!(
                "webhook returned HTTP {}",
                response.status()
            )));
        }
        Ok(())
    }
}

/// Entry point used by the engine to raise alerts
#[derive(Debug)]
pub struct AlertDispatcher {
    tx: Option<mpsc::Sender<Alert>>,
    cooldown: Mutex<Duration>,
    last_sent: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl AlertDispatcher {
    /// Create a dispatcher and the worker that must be spawned to deliver
    pub fn new(config: &AlertConfig) -> (Self, AlertWorker) {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        let dispatcher = Self {
            tx: Some(tx),
            cooldown: Mutex::new(config.cooldown()),
            last_sent: Mutex::new(HashMap::new()),
        };
        let worker = AlertWorker::new(
            rx,
            config.failure_threshold,
            StdDuration::from_secs(config.breaker_reset_secs),
        );
        (dispatcher, worker)
    }

    /// Dispatcher with no delivery channel. Alerts are rate-limited and
    /// logged at debug level only.
    pub fn disabled() -> Self {
        Self {
            tx: None,
            cooldown: Mutex::new(AlertConfig::default().cooldown()),
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_cooldown(&self, cooldown: Duration) {
        *sync::lock(&self.cooldown) = cooldown;
    }

    /// Queue an alert without blocking. Returns `true` if it was accepted.
    pub fn notify(&self, alert: Alert) -> bool {
        let cooldown = *sync::lock(&self.cooldown);
        {
            let mut last_sent = sync::lock(&self.last_sent);
            if let Some(prev) = last_sent.get(&alert.key) {
                if alert.timestamp < config::deadline(*prev, cooldown) {
                    debug!("Alert {} suppressed by cooldown", alert.key);
                    return false;
                }
            }
            last_sent.insert(alert.key.clone(), alert.timestamp);
        }

        let Some(tx) = &self.tx else {
            debug!("Alert (no delivery channel): {}", alert.summary());
            return true;
        };

        match tx.try_send(alert) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(alert)) => {
                warn!("Alert queue full, dropping alert {}", alert.key);
                false
            }
            Err(mpsc::error::TrySendError::Closed(alert)) => {
                debug!("Alert worker stopped, dropping alert {}", alert.key);
                false
            }
        }
    }
}

/// Skips deliveries to a sink after repeated failures until a reset timeout
/// has passed, then lets one attempt through.
#[derive(Debug)]
struct DeliveryBreaker {
    failures: u32,
    threshold: u32,
    opened_at: Option<Instant>,
    reset_after: StdDuration,
}

impl DeliveryBreaker {
    fn new(threshold: u32, reset_after: StdDuration) -> Self {
        Self {
            failures: 0,
            threshold: threshold.max(1),
            opened_at: None,
            reset_after,
        }
    }

    fn allow(&mut self) -> bool {
        match self.opened_at {
            None => true,
            Some(opened) if opened.elapsed() >= self.reset_after => {
                // Half-open: one trial delivery
                self.opened_at = None;
                self.failures = self.threshold - 1;
                true
            }
            Some(_) => false,
        }
    }

    fn record_success(&mut self) {
        self.failures = 0;
        self.opened_at = None;
    }

    fn record_failure(&mut self) {
        self.failures += 1;
        if self.failures >= self.threshold && self.opened_at.is_none() {
            self.opened_at = Some(Instant::now());
        }
    }

    fn is_open(&self) -> bool {
        self.opened_at.is_some()
    }
}

/// Drains the alert channel and delivers to every configured sink
pub struct AlertWorker {
    rx: mpsc::Receiver<Alert>,
    sinks: Vec<(Arc<dyn AlertSink>, DeliveryBreaker)>,
    threshold: u32,
    reset_after: StdDuration,
}

impl AlertWorker {
    fn new(rx: mpsc::Receiver<Alert>, threshold: u32, reset_after: StdDuration) -> Self {
        Self {
            rx,
            sinks: Vec::new(),
            threshold,
            reset_after,
        }
    }

    pub fn with_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks
            .push((sink, DeliveryBreaker::new(self.threshold, self.reset_after)));
        self
    }

    /// Add the sinks described by config: always the log sink, plus a
    /// webhook when one is configured.
    pub fn with_configured_sinks(self, config: &AlertConfig) -> Self {
        let mut worker = self.with_sink(Arc::new(LogAlertSink));
        if let Some(url) = &config.webhook_url {
            match WebhookAlertSink::new(url.clone()) {
                Ok(sink) => worker = worker.with_sink(Arc::new(sink)),
                Err(e) => warn!("Webhook alert sink disabled: {}", e),
            }
        }
        worker
    }

    pub async fn run(mut self) {
        info!("Alert worker started with {} sink(s)", self.sinks.len());

        while let Some(alert) = self.rx.recv().await {
            for (sink, breaker) in self.sinks.iter_mut() {
                if !breaker.allow() {
                    debug!("Skipping {} sink for alert {}", sink.name(), alert.key);
                    continue;
                }

                let target = Arc::clone(sink);
                let payload = alert.clone();
                let result =
                    tokio::task::spawn_blocking(move || target.deliver(&payload)).await;

                match result {
                    Ok(Ok(())) => breaker.record_success(),
                    Ok(Err(e)) => {
                        warn!("Alert delivery via {} failed: {}", sink.name(), e);
                        breaker.record_failure();
                    }
                    Err(e) => {
                        warn!("Alert delivery via {} panicked: {}", sink.name(), e);
                        breaker.record_failure();
                    }
                }

                if breaker.is_open() {
                    warn!(
                        "{} sink disabled for {:?} after repeated failures",
                        sink.name(),
                        breaker.reset_after
                    );
                }
            }
        }

        // Blocking HTTP clients must not be dropped on a runtime thread
        let sinks = std::mem::take(&mut self.sinks);
        let _ = tokio::task::spawn_blocking(move || drop(sinks)).await;
        debug!("Alert worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSink {
        delivered: AtomicUsize,
        fail: bool,
    }

    impl AlertSink for CountingSink {
        fn name(&self) -> &str {
            "counting"
        }

        fn deliver(&self, _alert: &Alert) -> GuardResult<()> {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(GuardError::Notification("boom".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn alert(key: &str, at: DateTime<Utc>) -> Alert {
        Alert::new(AlertKind::RegimeChange, key, "Regime PANIC")
            .with_trigger("1h change -4.00%")
            .with_metric("change_1h", Some(-4.0))
            .with_metric("volatility_24h", None)
            .with_action("Halt new entries")
            .at(at)
    }

    #[test]
    fn test_cooldown_per_key() {
        let dispatcher = AlertDispatcher::disabled();
        let now = Utc::now();

        assert!(dispatcher.notify(alert("regime", now)));
        assert!(!dispatcher.notify(alert("regime", now + Duration::minutes(4))));
        assert!(dispatcher.notify(alert("strategy:CHANNEL", now + Duration::minutes(4))));
        assert!(dispatcher.notify(alert("regime", now + Duration::minutes(5))));
    }

    #[test]
    fn test_metrics_skip_missing_values() {
        let a = alert("regime", Utc::now());
        assert_eq!(a.metrics.len(), 1);
        assert!(a.summary().contains("change_1h=-4.00"));
    }

    #[test]
    fn test_full_queue_drops_without_blocking() {
        let config = AlertConfig {
            channel_capacity: 1,
            cooldown_secs: 0,
            ..AlertConfig::default()
        };
        let (dispatcher, _worker) = AlertDispatcher::new(&config);
        let now = Utc::now();
        assert!(dispatcher.notify(alert("a", now)));
        assert!(!dispatcher.notify(alert("b", now)));
    }

    #[test]
    fn test_breaker_opens_after_threshold() {
        let mut breaker = DeliveryBreaker::new(2, StdDuration::from_secs(60));
        assert!(breaker.allow());
        breaker.record_failure();
        assert!(breaker.allow());
        breaker.record_failure();
        assert!(!breaker.allow());

        let mut quick = DeliveryBreaker::new(1, StdDuration::from_millis(0));
        quick.record_failure();
        assert!(quick.allow());
        quick.record_success();
        assert!(!quick.is_open());
    }

    #[tokio::test]
    async fn test_worker_delivers_and_survives_failures() {
        let config = AlertConfig {
            cooldown_secs: 0,
            failure_threshold: 1,
            breaker_reset_secs: 3600,
            ..AlertConfig::default()
        };
        let ok_sink = Arc::new(CountingSink {
            delivered: AtomicUsize::new(0),
            fail: false,
        });
        let bad_sink = Arc::new(CountingSink {
            delivered: AtomicUsize::new(0),
            fail: true,
        });

        let (dispatcher, worker) = AlertDispatcher::new(&config);
        let worker = worker
            .with_sink(ok_sink.clone() as Arc<dyn AlertSink>)
            .with_sink(bad_sink.clone() as Arc<dyn AlertSink>);

        let now = Utc::now();
        assert!(dispatcher.notify(alert("a", now)));
        assert!(dispatcher.notify(alert("b", now)));
        drop(dispatcher);

        worker.run().await;

        assert_eq!(ok_sink.delivered.load(Ordering::SeqCst), 2);
        // Breaker opened after the first failure
        assert_eq!(bad_sink.delivered.load(Ordering::SeqCst), 1);
    }
}
