//! Market regime classification and per-strategy disablement
//!
//! The regime is re-derived from the reference-asset price window on every
//! call. The only state carried between calls is the last reported regime
//! (for transition logging and alert de-duplication) and the table of
//! disabled strategies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::alerts::{Alert, AlertDispatcher, AlertKind};
use crate::config::{self, RegimeConfig, StrategyVolatilityLimit};
use crate::error::{GuardError, GuardResult};
use crate::price_window::{PriceWindow, SharedPriceWindow};
use crate::sync;

/// Discrete market condition derived from the reference asset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MarketRegime {
    #[default]
    Normal,
    Caution,
    Panic,
    Euphoria,
}

impl MarketRegime {
    /// Scale applied to new entry sizes
    pub fn position_multiplier(&self) -> f64 {
        match self {
            MarketRegime::Panic => 0.0,
            MarketRegime::Caution => 0.5,
            MarketRegime::Euphoria => 0.7,
            MarketRegime::Normal => 1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MarketRegime::Normal => "NORMAL",
            MarketRegime::Caution => "CAUTION",
            MarketRegime::Panic => "PANIC",
            MarketRegime::Euphoria => "EUPHORIA",
        }
    }
}

impl fmt::Display for MarketRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of every metric the classifier looks at, taken under one read
/// lock so a concurrent append cannot split the view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegimeMetrics {
    pub change_1h: Option<f64>,
    pub change_4h: Option<f64>,
    pub change_24h: Option<f64>,
    pub volatility_24h: Option<f64>,
    pub decline_24h: Option<f64>,
    pub decline_48h: Option<f64>,
    pub latest_price: Option<f64>,
    pub as_of: Option<DateTime<Utc>>,
    pub data_points: usize,
}

impl RegimeMetrics {
    pub fn from_window(window: &PriceWindow, config: &RegimeConfig) -> Self {
        let latest = window.latest();
        RegimeMetrics {
            change_1h: window.change_over_window(1.0),
            change_4h: window.change_over_window(4.0),
            change_24h: window.change_over_window(24.0),
            volatility_24h: window.range_volatility(24.0, config.volatility_bucket_minutes),
            decline_24h: window.decline_from_peak(24.0, config.cumulative_min_samples),
            decline_48h: window.decline_from_peak(48.0, config.cumulative_min_samples),
            latest_price: latest.map(|s| s.price),
            as_of: latest.map(|s| s.timestamp),
            data_points: window.len(),
        }
    }

    /// A classification needs at least the 1h change
    pub fn ensure_classifiable(&self) -> GuardResult<f64> {
        self.change_1h.ok_or_else(|| {
            GuardError::InsufficientData(format!(
                "{} price sample(s), no 1h change yet",
                self.data_points
            ))
        })
    }
}

/// Regime plus the first condition that produced it
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub regime: MarketRegime,
    pub trigger: String,
}

impl Classification {
    fn new(regime: MarketRegime, trigger: impl Into<String>) -> Self {
        Self {
            regime,
            trigger: trigger.into(),
        }
    }
}

fn at_or_below(value: Option<f64>, threshold: f64) -> bool {
    value.is_some_and(|v| v <= threshold)
}

fn at_or_above(value: Option<f64>, threshold: f64) -> bool {
    value.is_some_and(|v| v >= threshold)
}

/// Classify a metric snapshot. PANIC conditions are checked first, then
/// CAUTION, then EUPHORIA. Without a 1h change the result is NORMAL.
pub fn classify(m: &RegimeMetrics, cfg: &RegimeConfig) -> Classification {
    let change_1h = match m.ensure_classifiable() {
        Ok(change) => change,
        Err(e) => return Classification::new(MarketRegime::Normal, e.to_string()),
    };

    // PANIC
    if change_1h <= cfg.panic_change_1h {
        return Classification::new(
            MarketRegime::Panic,
            format!("1h change {:.2}% <= {:.2}%", change_1h, cfg.panic_change_1h),
        );
    }
    if at_or_below(m.change_24h, cfg.panic_change_24h) {
        return Classification::new(
            MarketRegime::Panic,
            format!(
                "24h change {:.2}% <= {:.2}%",
                m.change_24h.unwrap_or_default(),
                cfg.panic_change_24h
            ),
        );
    }
    if at_or_above(m.volatility_24h, cfg.panic_volatility) {
        return Classification::new(
            MarketRegime::Panic,
            format!(
                "24h volatility {:.2}% >= {:.2}%",
                m.volatility_24h.unwrap_or_default(),
                cfg.panic_volatility
            ),
        );
    }
    if at_or_below(m.decline_24h, cfg.cumulative_decline_24h) {
        return Classification::new(
            MarketRegime::Panic,
            format!(
                "cumulative 24h decline {:.2}% from peak <= {:.2}%",
                m.decline_24h.unwrap_or_default(),
                cfg.cumulative_decline_24h
            ),
        );
    }
    if at_or_below(m.decline_48h, cfg.cumulative_decline_48h) {
        return Classification::new(
            MarketRegime::Panic,
            format!(
                "cumulative 48h decline {:.2}% from peak <= {:.2}%",
                m.decline_48h.unwrap_or_default(),
                cfg.cumulative_decline_48h
            ),
        );
    }

    // CAUTION
    if change_1h <= cfg.caution_change_1h {
        return Classification::new(
            MarketRegime::Caution,
            format!("1h change {:.2}% <= {:.2}%", change_1h, cfg.caution_change_1h),
        );
    }
    if at_or_below(m.change_4h, cfg.caution_change_4h) {
        return Classification::new(
            MarketRegime::Caution,
            format!(
                "4h change {:.2}% <= {:.2}%",
                m.change_4h.unwrap_or_default(),
                cfg.caution_change_4h
            ),
        );
    }
    if at_or_below(m.change_24h, cfg.caution_change_24h) {
        return Classification::new(
            MarketRegime::Caution,
            format!(
                "24h change {:.2}% <= {:.2}%",
                m.change_24h.unwrap_or_default(),
                cfg.caution_change_24h
            ),
        );
    }
    if at_or_above(m.volatility_24h, cfg.high_volatility) {
        return Classification::new(
            MarketRegime::Caution,
            format!(
                "24h volatility {:.2}% >= {:.2}%",
                m.volatility_24h.unwrap_or_default(),
                cfg.high_volatility
            ),
        );
    }

    // EUPHORIA
    if change_1h >= cfg.euphoria_change_1h {
        return Classification::new(
            MarketRegime::Euphoria,
            format!("1h change {:.2}% >= {:.2}%", change_1h, cfg.euphoria_change_1h),
        );
    }
    if at_or_above(m.change_24h, cfg.euphoria_change_24h) {
        return Classification::new(
            MarketRegime::Euphoria,
            format!(
                "24h change {:.2}% >= {:.2}%",
                m.change_24h.unwrap_or_default(),
                cfg.euphoria_change_24h
            ),
        );
    }
    // Shadowed by the CAUTION volatility check while both share a threshold
    if at_or_above(m.volatility_24h, cfg.high_volatility) && change_1h > 0.0 {
        return Classification::new(
            MarketRegime::Euphoria,
            "high volatility with rising price",
        );
    }

    Classification::new(MarketRegime::Normal, "no threshold crossed")
}

/// Active disablement of one strategy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrategyDisablement {
    pub disabled_since: DateTime<Utc>,
    pub volatility_at_disable: f64,
    pub reenable_at: DateTime<Utc>,
}

/// Monitoring view of the detector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegimeStats {
    pub regime: MarketRegime,
    pub trigger: String,
    pub change_1h: Option<f64>,
    pub change_4h: Option<f64>,
    pub change_24h: Option<f64>,
    pub volatility_24h: Option<f64>,
    pub position_multiplier: f64,
    pub disabled_strategies: Vec<String>,
    pub data_points: usize,
}

/// Classifies the market from the shared price window and tracks which
/// strategies are paused for excess volatility.
#[derive(Debug)]
pub struct RegimeDetector {
    window: SharedPriceWindow,
    config: RwLock<RegimeConfig>,
    disablements: RwLock<HashMap<String, StrategyDisablement>>,
    last_regime: Mutex<MarketRegime>,
    alerts: Arc<AlertDispatcher>,
}

impl RegimeDetector {
    pub fn new(window: SharedPriceWindow, config: RegimeConfig, alerts: Arc<AlertDispatcher>) -> Self {
        Self {
            window,
            config: RwLock::new(config),
            disablements: RwLock::new(HashMap::new()),
            last_regime: Mutex::new(MarketRegime::Normal),
            alerts,
        }
    }

    pub fn window(&self) -> &SharedPriceWindow {
        &self.window
    }

    /// Replace thresholds. Existing disablement records keep their clocks.
    pub fn apply_config(&self, config: RegimeConfig) {
        *sync::write(&self.config) = config;
    }

    pub fn config(&self) -> RegimeConfig {
        sync::read(&self.config).clone()
    }

    pub fn metrics(&self) -> RegimeMetrics {
        let config = sync::read(&self.config);
        let window = sync::read(&self.window);
        RegimeMetrics::from_window(&window, &config)
    }

    pub fn classify(&self) -> (Classification, RegimeMetrics) {
        let metrics = self.metrics();
        let classification = classify(&metrics, &sync::read(&self.config));
        (classification, metrics)
    }

    pub fn market_regime(&self) -> MarketRegime {
        let (classification, metrics) = self.classify();
        self.observe(&classification, &metrics);
        classification.regime
    }

    pub fn position_multiplier(&self) -> f64 {
        self.market_regime().position_multiplier()
    }

    /// Log regime transitions and alert on entry into PANIC
    fn observe(&self, classification: &Classification, metrics: &RegimeMetrics) {
        let previous = {
            let mut last = sync::lock(&self.last_regime);
            std::mem::replace(&mut *last, classification.regime)
        };
        if previous == classification.regime {
            return;
        }

        match classification.regime {
            MarketRegime::Panic | MarketRegime::Caution => warn!(
                "⚠️ Market regime {} -> {} ({})",
                previous, classification.regime, classification.trigger
            ),
            _ => info!(
                "Market regime {} -> {} ({})",
                previous, classification.regime, classification.trigger
            ),
        }

        if classification.regime == MarketRegime::Panic {
            let alert = Alert::new(
                AlertKind::RegimeChange,
                "regime:PANIC",
                "Market regime changed to PANIC",
            )
            .with_trigger(classification.trigger.clone())
            .with_metric("change_1h", metrics.change_1h)
            .with_metric("change_4h", metrics.change_4h)
            .with_metric("change_24h", metrics.change_24h)
            .with_metric("volatility_24h", metrics.volatility_24h)
            .with_metric("decline_24h", metrics.decline_24h)
            .with_metric("price", metrics.latest_price)
            .with_action("New entries are blocked. Review open positions and tighten stops.")
            .at(metrics.as_of.unwrap_or_else(Utc::now));
            self.alerts.notify(alert);
        }
    }

    /// Smoothed 24h volatility used for strategy limits
    pub fn volatility_24h(&self) -> Option<f64> {
        let bucket = sync::read(&self.config).volatility_bucket_minutes;
        sync::read(&self.window).range_volatility(24.0, bucket)
    }

    pub fn should_disable_strategy(&self, name: &str) -> bool {
        self.should_disable_strategy_at(name, Utc::now())
    }

    /// Volatility gate with hysteresis.
    ///
    /// A record blocks the strategy until `reenable_at`. After that it is
    /// lifted only once volatility is at or below the re-enable level; until
    /// then the record stays as it is. Strategies without a configured limit
    /// are never disabled.
    pub fn should_disable_strategy_at(&self, name: &str, now: DateTime<Utc>) -> bool {
        let key = name.trim().to_ascii_uppercase();
        let limit: Option<StrategyVolatilityLimit> =
            sync::read(&self.config).strategy_limits.get(&key).copied();
        let volatility = self.volatility_24h();

        let mut table = sync::write(&self.disablements);

        if let Some(record) = table.get(&key).copied() {
            if now < record.reenable_at {
                return true;
            }
            let lift = match (volatility, limit) {
                (Some(v), Some(limit)) => v <= limit.reenable_at,
                // Fail open once the cooldown is over
                (None, _) => true,
                (_, None) => true,
            };
            if lift {
                table.remove(&key);
                info!(
                    "✅ Strategy {} re-enabled (volatility {}, disabled since {})",
                    key,
                    fmt_pct(volatility),
                    record.disabled_since.format("%Y-%m-%d %H:%M")
                );
                return false;
            }
            debug!(
                "Strategy {} stays disabled: volatility {} above re-enable level",
                key,
                fmt_pct(volatility)
            );
            return true;
        }

        let (Some(limit), Some(v)) = (limit, volatility) else {
            return false;
        };
        if v < limit.disable_at {
            return false;
        }

        let record = StrategyDisablement {
            disabled_since: now,
            volatility_at_disable: v,
            reenable_at: config::deadline(now, config::hours(limit.cooldown_hours)),
        };
        table.insert(key.clone(), record);
        drop(table);

        warn!(
            "⛔ Strategy {} disabled: 24h volatility {:.2}% >= {:.2}% (re-enable at <= {:.2}% after {})",
            key,
            v,
            limit.disable_at,
            limit.reenable_at,
            record.reenable_at.format("%Y-%m-%d %H:%M")
        );

        let alert = Alert::new(
            AlertKind::StrategyDisabled,
            format!("strategy:{}", key),
            format!("Strategy {} disabled", key),
        )
        .with_trigger(format!(
            "24h volatility {:.2}% >= {:.2}%",
            v, limit.disable_at
        ))
        .with_metric("volatility_24h", Some(v))
        .with_metric("disable_at", Some(limit.disable_at))
        .with_metric("reenable_at", Some(limit.reenable_at))
        .with_metric("cooldown_hours", Some(limit.cooldown_hours))
        .with_action(format!(
            "Pause {} entries until volatility falls to {:.2}% or below",
            key, limit.reenable_at
        ))
        .at(now);
        self.alerts.notify(alert);

        true
    }

    /// Re-evaluate every configured strategy, returning those disabled
    pub fn refresh_disablements_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut names: Vec<String> = sync::read(&self.config)
            .strategy_limits
            .keys()
            .cloned()
            .collect();
        names.extend(sync::read(&self.disablements).keys().cloned());
        names.sort();
        names.dedup();

        names
            .into_iter()
            .filter(|name| self.should_disable_strategy_at(name, now))
            .collect()
    }

    /// Strategies with an active record, sorted
    pub fn disabled_strategies(&self) -> Vec<String> {
        let mut names: Vec<String> = sync::read(&self.disablements).keys().cloned().collect();
        names.sort();
        names
    }

    pub fn disablement(&self, name: &str) -> Option<StrategyDisablement> {
        sync::read(&self.disablements)
            .get(&name.trim().to_ascii_uppercase())
            .copied()
    }

    pub fn regime_stats(&self) -> RegimeStats {
        let (classification, metrics) = self.classify();
        self.observe(&classification, &metrics);
        RegimeStats {
            regime: classification.regime,
            trigger: classification.trigger,
            change_1h: metrics.change_1h,
            change_4h: metrics.change_4h,
            change_24h: metrics.change_24h,
            volatility_24h: metrics.volatility_24h,
            position_multiplier: classification.regime.position_multiplier(),
            disabled_strategies: self.disabled_strategies(),
            data_points: metrics.data_points,
        }
    }
}

fn fmt_pct(value: Option<f64>) -> String {
    value.map_or_else(|| "n/a".to_string(), |v| format!("{:.2}%", v))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::PriceSample;
    use approx::assert_relative_eq;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn detector() -> RegimeDetector {
        RegimeDetector::new(
            PriceWindow::shared(),
            RegimeConfig::default(),
            Arc::new(AlertDispatcher::disabled()),
        )
    }

    fn push(detector: &RegimeDetector, minutes: i64, price: f64) {
        sync::write(detector.window())
            .append(PriceSample::new(t0() + Duration::minutes(minutes), price))
            .unwrap();
    }

    /// Replace the window with three samples 10 minutes apart whose range
    /// volatility is exactly `vol` percent.
    fn set_volatility(detector: &RegimeDetector, vol: f64) {
        let mut window = sync::write(detector.window());
        *window = PriceWindow::new();
        for (i, price) in [100.0, 100.0 + vol, 100.0].into_iter().enumerate() {
            window
                .append(PriceSample::new(t0() + Duration::minutes(10 * i as i64), price))
                .unwrap();
        }
    }

    fn metrics(change_1h: f64) -> RegimeMetrics {
        RegimeMetrics {
            change_1h: Some(change_1h),
            ..Default::default()
        }
    }

    #[test]
    fn test_multipliers() {
        assert_eq!(MarketRegime::Panic.position_multiplier(), 0.0);
        assert_eq!(MarketRegime::Caution.position_multiplier(), 0.5);
        assert_eq!(MarketRegime::Euphoria.position_multiplier(), 0.7);
        assert_eq!(MarketRegime::Normal.position_multiplier(), 1.0);
    }

    #[test]
    fn test_classify_priority() {
        let cfg = RegimeConfig::default();
        assert_eq!(classify(&metrics(-3.0), &cfg).regime, MarketRegime::Panic);
        assert_eq!(classify(&metrics(-2.5), &cfg).regime, MarketRegime::Caution);
        assert_eq!(classify(&metrics(3.0), &cfg).regime, MarketRegime::Euphoria);
        assert_eq!(classify(&metrics(0.5), &cfg).regime, MarketRegime::Normal);

        // A -3% 24h move flags CAUTION, but a -3% cumulative decline wins
        let both = RegimeMetrics {
            change_1h: Some(0.0),
            change_24h: Some(-3.0),
            decline_24h: Some(-3.0),
            ..Default::default()
        };
        let c = classify(&both, &cfg);
        assert_eq!(c.regime, MarketRegime::Panic);
        assert!(c.trigger.contains("cumulative"));
    }

    #[test]
    fn test_classify_each_threshold() {
        let cfg = RegimeConfig::default();
        let base = RegimeMetrics {
            change_1h: Some(0.0),
            ..Default::default()
        };
        let cases = [
            (
                RegimeMetrics { change_24h: Some(-5.0), ..base.clone() },
                MarketRegime::Panic,
                "24h change",
            ),
            (
                RegimeMetrics { decline_48h: Some(-5.0), ..base.clone() },
                MarketRegime::Panic,
                "cumulative 48h",
            ),
            (
                RegimeMetrics { change_4h: Some(-3.0), ..base.clone() },
                MarketRegime::Caution,
                "4h change",
            ),
            (
                RegimeMetrics {
                    change_24h: Some(-3.5),
                    decline_24h: Some(-2.0),
                    ..base.clone()
                },
                MarketRegime::Caution,
                "24h change",
            ),
            (
                RegimeMetrics { change_24h: Some(8.0), ..base.clone() },
                MarketRegime::Euphoria,
                "24h change",
            ),
        ];

        for (m, regime, trigger) in cases {
            let c = classify(&m, &cfg);
            assert_eq!(c.regime, regime, "{:?}", m);
            assert!(c.trigger.starts_with(trigger), "{}", c.trigger);
        }

        // Just inside each threshold stays NORMAL
        let quiet = RegimeMetrics {
            change_4h: Some(-2.9),
            change_24h: Some(7.9),
            decline_24h: Some(-2.9),
            decline_48h: Some(-4.9),
            ..base
        };
        assert_eq!(classify(&quiet, &cfg).regime, MarketRegime::Normal);
    }

    #[test]
    fn test_slow_48h_decline_is_panic() {
        let d = detector();
        // Hourly samples sliding from 100 to 94.5 over 48h
        for h in 0..=48 {
            push(&d, h * 60, 100.0 - 5.5 * h as f64 / 48.0);
        }

        let m = d.metrics();
        assert!(m.change_24h.unwrap() > -3.0);
        assert!(m.decline_24h.unwrap() > -3.0);
        assert!(m.volatility_24h.unwrap() < 8.0);
        assert_relative_eq!(m.decline_48h.unwrap(), -5.5, epsilon = 1e-9);

        let (c, _) = d.classify();
        assert_eq!(c.regime, MarketRegime::Panic);
        assert!(c.trigger.contains("cumulative 48h"), "{}", c.trigger);
    }

    #[test]
    fn test_classify_volatility_bands() {
        let cfg = RegimeConfig::default();
        let high = RegimeMetrics {
            change_1h: Some(1.0),
            volatility_24h: Some(9.0),
            ..Default::default()
        };
        assert_eq!(classify(&high, &cfg).regime, MarketRegime::Caution);

        let extreme = RegimeMetrics {
            volatility_24h: Some(12.0),
            ..high
        };
        assert_eq!(classify(&extreme, &cfg).regime, MarketRegime::Panic);
    }

    #[test]
    fn test_missing_1h_change_is_normal() {
        let cfg = RegimeConfig::default();
        let m = RegimeMetrics {
            change_1h: None,
            change_24h: Some(-20.0),
            volatility_24h: Some(40.0),
            data_points: 1,
            ..Default::default()
        };
        assert!(matches!(
            m.ensure_classifiable(),
            Err(GuardError::InsufficientData(_))
        ));
        let c = classify(&m, &cfg);
        assert_eq!(c.regime, MarketRegime::Normal);
        assert!(c.trigger.starts_with("insufficient data"), "{}", c.trigger);
    }

    #[test]
    fn test_empty_and_single_sample_window_is_normal() {
        let d = detector();
        assert_eq!(d.market_regime(), MarketRegime::Normal);
        push(&d, 0, 50_000.0);
        assert_eq!(d.market_regime(), MarketRegime::Normal);
        assert_eq!(d.position_multiplier(), 1.0);
    }

    #[test]
    fn test_hourly_drop_is_panic_and_idempotent() {
        let d = detector();
        for minute in 0..=60 {
            push(&d, minute, 100.0 - 0.06 * minute as f64);
        }
        // 100 -> 96.4 over the hour
        assert_eq!(d.market_regime(), MarketRegime::Panic);
        assert_eq!(d.market_regime(), MarketRegime::Panic);
        assert_eq!(d.position_multiplier(), 0.0);
    }

    #[test]
    fn test_disable_and_hysteresis() {
        let d = detector();
        set_volatility(&d, 9.0);
        let now = t0();
        assert!(d.should_disable_strategy_at("channel", now));
        let record = d.disablement("CHANNEL").unwrap();
        assert_eq!(record.reenable_at, now + Duration::hours(4));
        assert_relative_eq!(record.volatility_at_disable, 9.0, epsilon = 1e-9);

        // Calm market but still inside the cooldown
        set_volatility(&d, 1.0);
        assert!(d.should_disable_strategy_at("CHANNEL", now + Duration::hours(3)));

        // Cooldown over, volatility just under the disable level
        set_volatility(&d, 7.9);
        let later = now + Duration::hours(5);
        assert!(d.should_disable_strategy_at("CHANNEL", later));
        assert_eq!(d.disablement("CHANNEL").unwrap(), record);

        // Below the re-enable level
        set_volatility(&d, 4.9);
        assert!(!d.should_disable_strategy_at("CHANNEL", later));
        assert!(d.disablement("CHANNEL").is_none());
    }

    #[test]
    fn test_unconfigured_strategy_never_disabled() {
        let d = detector();
        set_volatility(&d, 50.0);
        assert!(!d.should_disable_strategy_at("MOMENTUM", t0()));
        assert!(d.disabled_strategies().is_empty());
    }

    #[test]
    fn test_refresh_disablements_covers_configured_strategies() {
        let d = detector();
        set_volatility(&d, 11.0);
        // CHANNEL (8) and SWING (10) trip; DCA (15) does not
        assert_eq!(
            d.refresh_disablements_at(t0()),
            vec!["CHANNEL".to_string(), "SWING".to_string()]
        );
        let stats = d.regime_stats();
        assert_eq!(stats.disabled_strategies, vec!["CHANNEL", "SWING"]);
        assert_eq!(stats.data_points, 3);
    }

    #[test]
    fn test_apply_config_changes_thresholds() {
        let d = detector();
        set_volatility(&d, 9.0);
        let mut cfg = RegimeConfig::default();
        cfg.strategy_limits
            .insert("CHANNEL".to_string(), StrategyVolatilityLimit::new(20.0, 10.0, 1.0));
        d.apply_config(cfg);
        assert!(!d.should_disable_strategy_at("CHANNEL", t0()));
    }
}
