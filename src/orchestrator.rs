//! Protection orchestrator
//!
//! Owns one [`RegimeDetector`], one [`TradeLimiter`] and one
//! [`ExitEvaluator`] and runs the evaluation cycle:
//! 1. Re-derive the regime and strategy disablements
//! 2. Evaluate exits and feed outcomes back into the limiter
//! 3. Gate new entries: regime, strategy disablement, symbol limiter

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::alerts::AlertDispatcher;
use crate::config::GuardConfig;
use crate::exits::{ExitDecision, ExitEvaluator};
use crate::limiter::{LimiterStats, TradeLimiter, TradePermission};
use crate::paper::TradingEngine;
use crate::price_window::SharedPriceWindow;
use crate::regime::{MarketRegime, RegimeDetector, RegimeStats};
use crate::sync;
use crate::{ExitReason, Money, Position, PositionKey, Symbol};

/// Which gate refused an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryGate {
    Regime,
    StrategyDisabled,
    SymbolLimiter,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryDecision {
    pub symbol: Symbol,
    pub strategy: String,
    pub regime: MarketRegime,
    pub allowed: bool,
    /// Base size times the regime multiplier; zero when denied
    pub size: Money,
    pub denied_by: Option<EntryGate>,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtectionStats {
    pub regime: RegimeStats,
    pub limiter: LimiterStats,
}

/// Summary of one evaluation cycle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub regime: MarketRegime,
    pub position_multiplier: f64,
    pub disabled_strategies: Vec<String>,
    pub exits: Vec<ExitDecision>,
    pub entries_opened: usize,
    pub entries_denied: usize,
}

#[derive(Debug)]
pub struct ProtectionOrchestrator {
    detector: RegimeDetector,
    limiter: TradeLimiter,
    exits: ExitEvaluator,
    alerts: Arc<AlertDispatcher>,
    base_size: RwLock<Money>,
    /// Positions whose exit outcome has already reached the limiter
    reported: Mutex<HashSet<PositionKey>>,
}

impl ProtectionOrchestrator {
    pub fn new(config: &GuardConfig, window: SharedPriceWindow, alerts: Arc<AlertDispatcher>) -> Self {
        alerts.set_cooldown(config.alerts.cooldown());
        Self {
            detector: RegimeDetector::new(window, config.regime.clone(), Arc::clone(&alerts)),
            limiter: TradeLimiter::new(config.limiter.clone()),
            exits: ExitEvaluator::new(config.exits),
            alerts,
            base_size: RwLock::new(Money::from_f64(config.engine.base_position_size)),
            reported: Mutex::new(HashSet::new()),
        }
    }

    /// Replace the limiter, e.g. one with persistence attached
    pub fn with_limiter(mut self, limiter: TradeLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn detector(&self) -> &RegimeDetector {
        &self.detector
    }

    pub fn limiter(&self) -> &TradeLimiter {
        &self.limiter
    }

    pub fn exits(&self) -> &ExitEvaluator {
        &self.exits
    }

    /// Hot reload. Ledger, disablements and peak tracking are kept.
    pub fn apply_config(&self, config: &GuardConfig) {
        self.detector.apply_config(config.regime.clone());
        self.limiter.apply_config(config.limiter.clone());
        self.exits.apply_config(config.exits);
        self.alerts
            .set_cooldown(config.alerts.cooldown());
        *sync::write(&self.base_size) = Money::from_f64(config.engine.base_position_size);
        info!("Protection config applied");
    }

    pub fn check_entry(&self, symbol: &Symbol, strategy: &str) -> EntryDecision {
        self.check_entry_at(symbol, strategy, Utc::now())
    }

    /// Gates in order: regime, strategy disablement, symbol limiter
    pub fn check_entry_at(&self, symbol: &Symbol, strategy: &str, now: DateTime<Utc>) -> EntryDecision {
        let regime = self.detector.market_regime();
        let deny = |gate: EntryGate, reason: String| EntryDecision {
            symbol: symbol.clone(),
            strategy: strategy.to_string(),
            regime,
            allowed: false,
            size: Money::ZERO,
            denied_by: Some(gate),
            reason,
        };

        let multiplier = regime.position_multiplier();
        if multiplier <= 0.0 {
            return deny(
                EntryGate::Regime,
                format!("market regime {} blocks new entries", regime),
            );
        }

        if self.detector.should_disable_strategy_at(strategy, now) {
            return deny(
                EntryGate::StrategyDisabled,
                format!("strategy {} disabled for volatility", strategy),
            );
        }

        let permission = self.limiter.can_trade_symbol_at(symbol, now);
        if !permission.is_allowed() {
            return deny(EntryGate::SymbolLimiter, permission.reason());
        }

        let size = sync::read(&self.base_size).scale(multiplier);
        EntryDecision {
            symbol: symbol.clone(),
            strategy: strategy.to_string(),
            regime,
            allowed: true,
            size,
            denied_by: None,
            reason: format!("{} regime, size x{:.2}", regime, multiplier),
        }
    }

    pub fn can_trade_symbol(&self, symbol: &Symbol) -> TradePermission {
        self.limiter.can_trade_symbol(symbol)
    }

    pub fn evaluate_exits(
        &self,
        positions: &[Position],
        prices: &HashMap<Symbol, Money>,
    ) -> Vec<ExitDecision> {
        self.evaluate_exits_at(positions, prices, Utc::now())
    }

    /// Evaluate exits and forward each position's outcome to the limiter
    /// once, however many cycles the position stays open afterwards.
    pub fn evaluate_exits_at(
        &self,
        positions: &[Position],
        prices: &HashMap<Symbol, Money>,
        now: DateTime<Utc>,
    ) -> Vec<ExitDecision> {
        let regime = self.detector.market_regime();
        let decisions = self.exits.evaluate_exits_at(positions, prices, regime, now);

        let fresh: Vec<&ExitDecision> = {
            let mut reported = sync::lock(&self.reported);
            let open: HashSet<PositionKey> = positions.iter().map(Position::key).collect();
            reported.retain(|key| open.contains(key));
            decisions
                .iter()
                .filter(|d| reported.insert(d.key()))
                .collect()
        };

        for decision in fresh {
            self.record_outcome(decision, now);
        }
        decisions
    }

    fn record_outcome(&self, decision: &ExitDecision, now: DateTime<Utc>) {
        match decision.reason {
            ExitReason::StopLoss => self.limiter.record_stop_loss_at(&decision.symbol, now),
            reason => self.limiter.record_successful_trade_at(
                &decision.symbol,
                reason,
                Some(decision.profit_pct),
                Some(decision.take_profit_target_pct),
                now,
            ),
        }
    }

    /// One full evaluation cycle against a trading engine
    pub fn run_cycle_at(&self, engine: &mut dyn TradingEngine, now: DateTime<Utc>) -> CycleReport {
        // 1. Regime and disablements
        let regime = self.detector.market_regime();
        let disabled_strategies = self.detector.refresh_disablements_at(now);

        // 2. Exits
        let positions = engine.open_positions();
        let prices = engine.current_prices();
        let exits = self.evaluate_exits_at(&positions, &prices, now);
        for decision in &exits {
            if let Err(e) = engine.close_position(decision) {
                warn!("Failed to close {} [{}]: {}", decision.symbol, decision.strategy, e);
            }
        }

        // 3. Entries
        let mut entries_opened = 0;
        let mut entries_denied = 0;
        for candidate in engine.entry_candidates() {
            let decision = self.check_entry_at(&candidate.symbol, &candidate.strategy, now);
            if !decision.allowed {
                debug!(
                    "Entry {} [{}] denied: {}",
                    candidate.symbol, candidate.strategy, decision.reason
                );
                entries_denied += 1;
                continue;
            }
            let price = prices
                .get(&candidate.symbol)
                .or_else(|| prices.get(&Symbol::new(candidate.symbol.normalized())))
                .copied();
            let Some(price) = price else {
                debug!("No price for {}, entry deferred", candidate.symbol);
                continue;
            };
            let tier = self.limiter.symbol_tier(&candidate.symbol);
            match engine.open_position(&candidate, tier, decision.size, price, now) {
                Ok(()) => entries_opened += 1,
                Err(e) => warn!("Failed to open {}: {}", candidate.symbol, e),
            }
        }

        let report = CycleReport {
            regime,
            position_multiplier: regime.position_multiplier(),
            disabled_strategies,
            exits,
            entries_opened,
            entries_denied,
        };
        info!(
            "Cycle: regime {} (x{:.1}), {} exits, {} entries opened, {} denied, disabled {:?}",
            report.regime,
            report.position_multiplier,
            report.exits.len(),
            report.entries_opened,
            report.entries_denied,
            report.disabled_strategies
        );
        report
    }

    pub fn run_cycle(&self, engine: &mut dyn TradingEngine) -> CycleReport {
        self.run_cycle_at(engine, Utc::now())
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> ProtectionStats {
        ProtectionStats {
            regime: self.detector.regime_stats(),
            limiter: self.limiter.limiter_stats_at(now),
        }
    }

    pub fn stats(&self) -> ProtectionStats {
        self.stats_at(Utc::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::{EntryCandidate, PaperBook};
    use crate::price_window::PriceWindow;
    use crate::{PriceSample, Tier};
    use chrono::{Duration, TimeZone};
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn orchestrator() -> ProtectionOrchestrator {
        let mut config = GuardConfig::default();
        config.limiter.state_file = None;
        ProtectionOrchestrator::new(
            &config,
            PriceWindow::shared(),
            Arc::new(AlertDispatcher::disabled()),
        )
    }

    fn feed(o: &ProtectionOrchestrator, points: &[(i64, f64)]) {
        let mut window = sync::write(o.detector().window());
        for &(minutes, price) in points {
            window
                .append(PriceSample::new(t0() + Duration::minutes(minutes), price))
                .unwrap();
        }
    }

    fn position(symbol: &str, strategy: &str) -> Position {
        Position {
            symbol: Symbol::new(symbol),
            strategy: strategy.to_string(),
            tier: Tier::MidCap,
            entry_price: Money::new(dec!(10)),
            quantity: Money::new(dec!(5)),
            opened_at: t0(),
            stop_loss_pct: None,
            take_profit_pct: None,
            trailing_stop_pct: None,
            trailing_activation_pct: None,
        }
    }

    #[test]
    fn test_normal_entry_gets_full_size() {
        let o = orchestrator();
        let d = o.check_entry_at(&Symbol::new("LINK"), "SWING", t0());
        assert!(d.allowed);
        assert_eq!(d.regime, MarketRegime::Normal);
        assert_eq!(d.size, Money::new(dec!(100)));
    }

    #[test]
    fn test_caution_halves_size() {
        let o = orchestrator();
        // -2.5% over the hour
        feed(&o, &[(0, 100.0), (30, 99.0), (60, 97.5)]);
        let d = o.check_entry_at(&Symbol::new("LINK"), "SWING", t0());
        assert_eq!(d.regime, MarketRegime::Caution);
        assert!(d.allowed);
        assert_eq!(d.size, Money::new(dec!(50)));
    }

    #[test]
    fn test_panic_denies_before_other_gates() {
        let o = orchestrator();
        feed(&o, &[(0, 100.0), (60, 96.0)]);
        let d = o.check_entry_at(&Symbol::new("LINK"), "SWING", t0());
        assert!(!d.allowed);
        assert_eq!(d.denied_by, Some(EntryGate::Regime));
        assert_eq!(d.size, Money::ZERO);
    }

    #[test]
    fn test_limiter_gate() {
        let o = orchestrator();
        o.limiter().record_stop_loss_at(&Symbol::new("LINK"), t0());
        let d = o.check_entry_at(&Symbol::new("LINK"), "SWING", t0() + Duration::hours(1));
        assert_eq!(d.denied_by, Some(EntryGate::SymbolLimiter));
        assert!(d.reason.contains("COOLDOWN"));
    }

    #[test]
    fn test_exit_outcome_forwarded_once() {
        let o = orchestrator();
        let p = position("LINK", "SWING");
        let mut prices = HashMap::new();
        // 4% mid-cap stop at 9.6
        prices.insert(Symbol::new("LINK"), Money::new(dec!(9.5)));

        for _ in 0..3 {
            let decisions = o.evaluate_exits_at(std::slice::from_ref(&p), &prices, t0());
            assert_eq!(decisions.len(), 1);
        }
        assert_eq!(o.limiter().penalty(&Symbol::new("LINK")).unwrap().consecutive_stops, 1);

        // Closed, then a new position on the same symbol stops out again
        o.evaluate_exits_at(&[], &prices, t0());
        let mut again = position("LINK", "SWING");
        again.opened_at = t0() + Duration::minutes(5);
        o.evaluate_exits_at(&[again], &prices, t0());
        assert_eq!(o.limiter().penalty(&Symbol::new("LINK")).unwrap().consecutive_stops, 2);
    }

    #[test]
    fn test_take_profit_outcome_clears_stops() {
        let o = orchestrator();
        let link = Symbol::new("LINK");
        o.limiter().record_stop_loss_at(&link, t0());
        o.limiter().record_stop_loss_at(&link, t0());

        let mut prices = HashMap::new();
        prices.insert(link.clone(), Money::new(dec!(10.8)));
        let decisions = o.evaluate_exits_at(&[position("LINK", "SWING")], &prices, t0());
        assert_eq!(decisions[0].reason, ExitReason::TakeProfit);
        assert_eq!(o.limiter().penalty(&link).unwrap().consecutive_stops, 0);
    }

    #[test]
    fn test_run_cycle_closes_and_opens() {
        let o = orchestrator();
        let board = crate::feed::SharedPriceBoard::default();
        {
            let mut prices = sync::write(&board);
            prices.insert(Symbol::new("LINK"), Money::new(dec!(9.5)));
            prices.insert(Symbol::new("SOL"), Money::new(dec!(150)));
        }
        let mut book = PaperBook::from_file_contents(
            crate::paper::PaperBookFile {
                positions: vec![position("LINK", "SWING")],
                candidates: vec![
                    EntryCandidate {
                        symbol: Symbol::new("SOL"),
                        strategy: "CHANNEL".to_string(),
                    },
                    EntryCandidate {
                        symbol: Symbol::new("LINK"),
                        strategy: "SWING".to_string(),
                    },
                ],
                closed: Vec::new(),
            },
            board,
        );

        let report = o.run_cycle_at(&mut book, t0());
        assert_eq!(report.exits.len(), 1);
        assert_eq!(report.entries_opened, 1);
        // LINK just stopped out and is on cooldown
        assert_eq!(report.entries_denied, 1);

        let open = book.open_positions();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].symbol, Symbol::new("SOL"));
        assert_eq!(open[0].tier, Tier::LargeCap);
        assert_eq!(book.closed_trades().len(), 1);
    }
}
