//! Configuration management
//!
//! Handles loading and parsing of the JSON configuration file with environment
//! variable overrides. Every section and field has a documented default, so the
//! engine runs with a partial file or with no file at all.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};

use crate::error::{GuardError, GuardResult};
use crate::{Symbol, Tier};

/// Longest span a config value can express; larger values saturate here
pub const MAX_CONFIG_HOURS: f64 = 1000.0 * 365.0 * 24.0;

/// Convert fractional hours from config into a chrono duration.
/// Negative and NaN become zero; huge values saturate at [`MAX_CONFIG_HOURS`].
pub fn hours(h: f64) -> Duration {
    let h = if h.is_nan() { 0.0 } else { h.clamp(0.0, MAX_CONFIG_HOURS) };
    Duration::seconds((h * 3600.0).round() as i64)
}

/// Upper bound for loop and breaker timer periods (one year)
pub const MAX_TIMER_SECS: u64 = 365 * 24 * 3600;

/// `at + span`, saturating at the latest representable instant
pub fn deadline(at: DateTime<Utc>, span: Duration) -> DateTime<Utc> {
    at.checked_add_signed(span).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Asset whose price stream drives regime detection
    pub reference_asset: String,
    pub regime: RegimeConfig,
    pub limiter: LimiterConfig,
    pub exits: ExitConfig,
    pub engine: EngineConfig,
    pub alerts: AlertConfig,
}

impl Default for GuardConfig {
    fn default() -> Self {
        GuardConfig {
            reference_asset: "BTC".to_string(),
            regime: RegimeConfig::default(),
            limiter: LimiterConfig::default(),
            exits: ExitConfig::default(),
            engine: EngineConfig::default(),
            alerts: AlertConfig::default(),
        }
    }
}

impl GuardConfig {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let mut config: GuardConfig =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        config.apply_env_overrides();
        config.validate();
        Ok(config)
    }

    /// Load from file if it exists, otherwise fall back to defaults
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::from_file(path);
        }

        warn!(
            "Config file {} not found, using built-in defaults",
            path.display()
        );
        let mut config = GuardConfig::default();
        config.apply_env_overrides();
        config.validate();
        Ok(config)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(url) = std::env::var("GUARD_ALERT_WEBHOOK") {
            if !url.trim().is_empty() {
                self.alerts.webhook_url = Some(url);
            }
        }
        if let Ok(path) = std::env::var("GUARD_STATE_FILE") {
            if !path.trim().is_empty() {
                self.limiter.state_file = Some(PathBuf::from(path));
            }
        }
    }

    /// Repair values that would break an invariant, logging each repair
    pub fn validate(&mut self) {
        for (name, limit) in self.regime.strategy_limits.iter_mut() {
            if let Err(e) = limit.check() {
                let repaired = limit.disable_at * 0.75;
                warn!("Strategy {}: {}, using {:.2}%", name, e, repaired);
                limit.reenable_at = repaired;
            }
        }

        // Keys are matched against uppercased strategy names
        let limits = std::mem::take(&mut self.regime.strategy_limits);
        self.regime.strategy_limits = limits
            .into_iter()
            .map(|(k, v)| (k.trim().to_ascii_uppercase(), v))
            .collect();

        if self.limiter.max_consecutive_stops == 0 {
            warn!("max_consecutive_stops of 0 would ban every symbol, using 3");
            self.limiter.max_consecutive_stops = 3;
        }

        if self.engine.interval_secs == 0 {
            warn!("engine.interval_secs of 0 is invalid, using 60");
            self.engine.interval_secs = 60;
        }

        // Timer periods far beyond any useful value overflow the runtime clock
        for (name, secs) in [
            ("engine.interval_secs", &mut self.engine.interval_secs),
            ("engine.config_reload_secs", &mut self.engine.config_reload_secs),
            ("engine.shutdown_flush_secs", &mut self.engine.shutdown_flush_secs),
            ("alerts.breaker_reset_secs", &mut self.alerts.breaker_reset_secs),
        ] {
            if *secs > MAX_TIMER_SECS {
                warn!("{} of {}s is too large, using {}s", name, secs, MAX_TIMER_SECS);
                *secs = MAX_TIMER_SECS;
            }
        }
    }
}

/// Regime classification thresholds, all in percent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    pub panic_change_1h: f64,
    pub panic_change_24h: f64,
    pub panic_volatility: f64,
    pub caution_change_1h: f64,
    pub caution_change_4h: f64,
    pub caution_change_24h: f64,
    pub high_volatility: f64,
    pub euphoria_change_1h: f64,
    pub euphoria_change_24h: f64,
    /// Peak-to-current decline that flags PANIC over 24h
    pub cumulative_decline_24h: f64,
    /// Peak-to-current decline that flags PANIC over 48h
    pub cumulative_decline_48h: f64,
    /// Samples required in a window before the decline check runs
    pub cumulative_min_samples: usize,
    /// Bucket size for smoothed volatility; 0 or 1 uses raw ticks
    pub volatility_bucket_minutes: u32,
    /// Per-strategy volatility limits, keyed by strategy name
    pub strategy_limits: BTreeMap<String, StrategyVolatilityLimit>,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        let mut strategy_limits = BTreeMap::new();
        strategy_limits.insert(
            "CHANNEL".to_string(),
            StrategyVolatilityLimit::new(8.0, 5.0, 4.0),
        );
        strategy_limits.insert(
            "SWING".to_string(),
            StrategyVolatilityLimit::new(10.0, 7.0, 4.0),
        );
        strategy_limits.insert(
            "DCA".to_string(),
            StrategyVolatilityLimit::new(15.0, 10.0, 6.0),
        );

        RegimeConfig {
            panic_change_1h: -3.0,
            panic_change_24h: -5.0,
            panic_volatility: 12.0,
            caution_change_1h: -2.0,
            caution_change_4h: -3.0,
            caution_change_24h: -3.0,
            high_volatility: 8.0,
            euphoria_change_1h: 3.0,
            euphoria_change_24h: 8.0,
            cumulative_decline_24h: -3.0,
            cumulative_decline_48h: -5.0,
            cumulative_min_samples: 10,
            volatility_bucket_minutes: 5,
            strategy_limits,
        }
    }
}

/// Volatility band for one strategy. `reenable_at` must sit below `disable_at`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StrategyVolatilityLimit {
    /// 24h volatility (percent) at or above which the strategy is disabled
    pub disable_at: f64,
    /// 24h volatility (percent) at or below which it may be re-enabled
    pub reenable_at: f64,
    /// Minimum time a disablement lasts
    pub cooldown_hours: f64,
}

impl StrategyVolatilityLimit {
    pub fn new(disable_at: f64, reenable_at: f64, cooldown_hours: f64) -> Self {
        Self {
            disable_at,
            reenable_at,
            cooldown_hours,
        }
    }

    /// A band whose re-enable level is not below its disable level would
    /// flap on every evaluation.
    pub fn check(&self) -> GuardResult<()> {
        if self.reenable_at >= self.disable_at {
            return Err(GuardError::Config(format!(
                "re-enable volatility {:.2}% must be below disable volatility {:.2}%",
                self.reenable_at, self.disable_at
            )));
        }
        Ok(())
    }
}

/// Cooldown after a stop-loss, per tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierCooldowns {
    pub large_cap: f64,
    pub mid_cap: f64,
    pub small_cap: f64,
    pub memecoin: f64,
}

impl Default for TierCooldowns {
    fn default() -> Self {
        TierCooldowns {
            large_cap: 4.0,
            mid_cap: 6.0,
            small_cap: 12.0,
            memecoin: 24.0,
        }
    }
}

impl TierCooldowns {
    pub fn hours_for(&self, tier: Tier) -> f64 {
        match tier {
            Tier::LargeCap => self.large_cap,
            Tier::MidCap => self.mid_cap,
            Tier::SmallCap => self.small_cap,
            Tier::Memecoin => self.memecoin,
        }
    }
}

/// Static tier membership. Symbols in no list are small caps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierLists {
    pub large_cap: Vec<String>,
    pub mid_cap: Vec<String>,
    pub memecoin: Vec<String>,
}

impl Default for TierLists {
    fn default() -> Self {
        fn list(items: &[&str]) -> Vec<String> {
            items.iter().map(|s| s.to_string()).collect()
        }

        TierLists {
            large_cap: list(&["BTC", "ETH", "BNB", "SOL", "XRP"]),
            mid_cap: list(&[
                "ADA", "AVAX", "DOT", "LINK", "LTC", "ATOM", "NEAR", "MATIC", "TRX",
            ]),
            memecoin: list(&["DOGE", "SHIB", "PEPE", "FLOKI", "BONK", "WIF"]),
        }
    }
}

impl TierLists {
    pub fn tier_of(&self, symbol: &Symbol) -> Tier {
        let key = symbol.normalized();
        let contains = |list: &[String]| list.iter().any(|s| s.eq_ignore_ascii_case(&key));

        if contains(&self.large_cap) {
            Tier::LargeCap
        } else if contains(&self.mid_cap) {
            Tier::MidCap
        } else if contains(&self.memecoin) {
            Tier::Memecoin
        } else {
            Tier::SmallCap
        }
    }
}

/// Trade limiter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
    pub max_consecutive_stops: u32,
    pub ban_duration_hours: f64,
    pub cooldown_hours: TierCooldowns,
    pub tiers: TierLists,
    /// Entries with zero consecutive stops older than this are pruned on load
    pub prune_after_hours: f64,
    /// JSON state file; `None` keeps the ledger in memory only
    pub state_file: Option<PathBuf>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        LimiterConfig {
            max_consecutive_stops: 3,
            ban_duration_hours: 24.0,
            cooldown_hours: TierCooldowns::default(),
            tiers: TierLists::default(),
            prune_after_hours: 48.0,
            state_file: Some(PathBuf::from("state/trade_limiter_state.json")),
        }
    }
}

/// Exit rule parameters. Percentages are fractions (`0.05` = 5%).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExitParams {
    pub stop_loss_pct: f64,
    pub take_profit_pct: f64,
    pub trailing_activation_pct: f64,
    pub trailing_distance_pct: f64,
    pub max_hold_hours: f64,
}

/// Exit parameters per tier
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierExitParams {
    pub large_cap: ExitParams,
    pub mid_cap: ExitParams,
    pub small_cap: ExitParams,
    pub memecoin: ExitParams,
}

impl Default for TierExitParams {
    fn default() -> Self {
        TierExitParams {
            large_cap: ExitParams {
                stop_loss_pct: 0.03,
                take_profit_pct: 0.06,
                trailing_activation_pct: 0.03,
                trailing_distance_pct: 0.015,
                max_hold_hours: 48.0,
            },
            mid_cap: ExitParams {
                stop_loss_pct: 0.04,
                take_profit_pct: 0.08,
                trailing_activation_pct: 0.04,
                trailing_distance_pct: 0.02,
                max_hold_hours: 36.0,
            },
            small_cap: ExitParams {
                stop_loss_pct: 0.05,
                take_profit_pct: 0.10,
                trailing_activation_pct: 0.05,
                trailing_distance_pct: 0.025,
                max_hold_hours: 24.0,
            },
            memecoin: ExitParams {
                stop_loss_pct: 0.08,
                take_profit_pct: 0.15,
                trailing_activation_pct: 0.06,
                trailing_distance_pct: 0.04,
                max_hold_hours: 12.0,
            },
        }
    }
}

impl TierExitParams {
    pub fn for_tier(&self, tier: Tier) -> ExitParams {
        match tier {
            Tier::LargeCap => self.large_cap,
            Tier::MidCap => self.mid_cap,
            Tier::SmallCap => self.small_cap,
            Tier::Memecoin => self.memecoin,
        }
    }
}

/// Multiplier applied to the trailing distance under each regime.
/// Values below 1.0 tighten the trail.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailingTightening {
    pub caution: f64,
    pub panic: f64,
    pub euphoria: f64,
}

impl Default for TrailingTightening {
    fn default() -> Self {
        TrailingTightening {
            caution: 0.75,
            panic: 0.5,
            euphoria: 1.0,
        }
    }
}

/// Exit evaluator configuration
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExitConfig {
    pub tiers: TierExitParams,
    pub trailing_tightening: TrailingTightening,
}

/// Evaluation loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub interval_secs: u64,
    /// Entry size in quote currency before the regime multiplier
    pub base_position_size: f64,
    /// Bounded wait for pending state saves at shutdown
    pub shutdown_flush_secs: u64,
    /// How often the config file is checked for changes
    pub config_reload_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            interval_secs: 60,
            base_position_size: 100.0,
            shutdown_flush_secs: 5,
            config_reload_secs: 30,
        }
    }
}

/// Alert delivery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Minimum gap between two alerts with the same key
    pub cooldown_secs: i64,
    pub webhook_url: Option<String>,
    pub channel_capacity: usize,
    /// Consecutive delivery failures before deliveries are skipped
    pub failure_threshold: u32,
    /// How long deliveries stay skipped once the threshold is hit
    pub breaker_reset_secs: u64,
}

impl AlertConfig {
    pub fn cooldown(&self) -> Duration {
        hours(self.cooldown_secs as f64 / 3600.0)
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        AlertConfig {
            cooldown_secs: 300,
            webhook_url: None,
            channel_capacity: 64,
            failure_threshold: 3,
            breaker_reset_secs: 300,
        }
    }
}

/// Polls the config file's modification time and re-parses it on change
#[derive(Debug)]
pub struct ConfigWatcher {
    path: PathBuf,
    last_modified: Option<SystemTime>,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let last_modified = modified_time(&path);
        Self {
            path,
            last_modified,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the new config when the file changed and parsed cleanly.
    /// A file that fails to parse keeps the running config.
    pub fn poll(&mut self) -> Option<GuardConfig> {
        let modified = modified_time(&self.path)?;
        if self.last_modified == Some(modified) {
            return None;
        }
        self.last_modified = Some(modified);

        match GuardConfig::from_file(&self.path) {
            Ok(config) => {
                info!("Config reloaded from {}", self.path.display());
                Some(config)
            }
            Err(e) => {
                warn!(
                    "Config change in {} ignored: {:#}",
                    self.path.display(),
                    e
                );
                None
            }
        }
    }
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_json_uses_defaults() {
        let config: GuardConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, GuardConfig::default());
        assert_eq!(config.regime.panic_volatility, 12.0);
        assert_eq!(config.limiter.max_consecutive_stops, 3);
        assert_eq!(config.engine.interval_secs, 60);
    }

    #[test]
    fn test_shipped_config_matches_defaults() {
        let raw = include_str!("../configs/guard.json");
        let config: GuardConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config, GuardConfig::default());
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: GuardConfig =
            serde_json::from_str(r#"{"regime": {"panic_volatility": 15.0}}"#).unwrap();
        assert_eq!(config.regime.panic_volatility, 15.0);
        assert_eq!(config.regime.high_volatility, 8.0);
        assert!(config.regime.strategy_limits.contains_key("CHANNEL"));
    }

    #[test]
    fn test_validate_repairs_inverted_hysteresis() {
        let mut config = GuardConfig::default();
        config.regime.strategy_limits.insert(
            "grid".to_string(),
            StrategyVolatilityLimit::new(10.0, 12.0, 2.0),
        );
        config.validate();

        let limit = config.regime.strategy_limits["GRID"];
        assert!(limit.reenable_at < limit.disable_at);
        assert!(limit.check().is_ok());
        assert!(matches!(
            StrategyVolatilityLimit::new(10.0, 12.0, 2.0).check(),
            Err(GuardError::Config(_))
        ));
        assert!(!config.regime.strategy_limits.contains_key("grid"));
    }

    #[test]
    fn test_tier_lookup_defaults_to_small_cap() {
        let tiers = TierLists::default();
        assert_eq!(tiers.tier_of(&Symbol::new("BTC")), Tier::LargeCap);
        assert_eq!(tiers.tier_of(&Symbol::new("link")), Tier::MidCap);
        assert_eq!(tiers.tier_of(&Symbol::new("PEPE")), Tier::Memecoin);
        assert_eq!(tiers.tier_of(&Symbol::new("UNLISTED")), Tier::SmallCap);
    }

    #[test]
    fn test_hours_conversion() {
        assert_eq!(hours(4.0), Duration::hours(4));
        assert_eq!(hours(0.5), Duration::minutes(30));
        assert_eq!(hours(-1.0), Duration::zero());
        assert_eq!(hours(f64::NAN), Duration::zero());
    }

    #[test]
    fn test_huge_hours_saturate() {
        assert_eq!(hours(1e13), hours(MAX_CONFIG_HOURS));
        assert_eq!(hours(f64::INFINITY), hours(MAX_CONFIG_HOURS));

        let now = Utc::now();
        assert!(deadline(now, hours(1e13)) > now);
        assert_eq!(deadline(DateTime::<Utc>::MAX_UTC, Duration::days(1)), DateTime::<Utc>::MAX_UTC);

        let mut config = GuardConfig::default();
        config.engine.interval_secs = u64::MAX;
        config.alerts.cooldown_secs = i64::MAX;
        config.validate();
        assert_eq!(config.engine.interval_secs, MAX_TIMER_SECS);
        assert_eq!(config.alerts.cooldown(), hours(MAX_CONFIG_HOURS));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join("crypto_guard_missing_config_test.json");
        let _ = std::fs::remove_file(&path);
        let config = GuardConfig::load_or_default(&path).unwrap();
        assert_eq!(config.regime, RegimeConfig::default());
    }

    #[test]
    fn test_watcher_detects_change() {
        let path = std::env::temp_dir().join(format!(
            "crypto_guard_watch_{}.json",
            std::process::id()
        ));
        std::fs::write(&path, "{}").unwrap();
        let mut watcher = ConfigWatcher::new(&path);
        assert!(watcher.poll().is_none());

        // Force a different mtime regardless of filesystem resolution
        watcher.last_modified = Some(SystemTime::UNIX_EPOCH);
        std::fs::write(&path, r#"{"engine": {"interval_secs": 15}}"#).unwrap();
        let reloaded = watcher.poll().expect("changed config");
        assert_eq!(reloaded.engine.interval_secs, 15);

        let _ = std::fs::remove_file(&path);
    }
}
