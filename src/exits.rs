//! Adaptive exit evaluation for open positions
//!
//! Each position is checked against its tier's exit parameters (optionally
//! overridden per position) in a fixed order: stop-loss, take-profit,
//! trailing stop, timeout. The first rule that matches is the only reason
//! reported.
//!
//! The evaluator remembers the highest price seen for each open position so
//! the trailing stop can follow it between cycles. Positions that disappear
//! from the input are forgotten.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::config::{self, ExitConfig, ExitParams};
use crate::regime::MarketRegime;
use crate::sync;
use crate::{ExitReason, Money, Position, PositionKey, Symbol, Tier};

/// Verdict for one position in one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitDecision {
    pub symbol: Symbol,
    pub strategy: String,
    pub tier: Tier,
    pub reason: ExitReason,
    pub exit_price: Money,
    pub entry_price: Money,
    pub opened_at: DateTime<Utc>,
    /// Unrealized P&L at the exit price, percent
    pub profit_pct: f64,
    /// Take-profit distance that applied to the position, percent
    pub take_profit_target_pct: f64,
}

impl ExitDecision {
    pub fn key(&self) -> PositionKey {
        PositionKey {
            symbol: self.symbol.clone(),
            strategy: self.strategy.clone(),
            opened_at: self.opened_at,
        }
    }
}

#[derive(Debug, Default)]
pub struct ExitEvaluator {
    config: RwLock<ExitConfig>,
    peaks: Mutex<HashMap<PositionKey, Money>>,
}

impl ExitEvaluator {
    pub fn new(config: ExitConfig) -> Self {
        Self {
            config: RwLock::new(config),
            peaks: Mutex::new(HashMap::new()),
        }
    }

    pub fn apply_config(&self, config: ExitConfig) {
        *sync::write(&self.config) = config;
    }

    /// Tier parameters with per-position overrides and the regime's
    /// trailing tightening applied
    pub fn effective_params(&self, position: &Position, regime: MarketRegime) -> ExitParams {
        let config = *sync::read(&self.config);
        let mut params = config.tiers.for_tier(position.tier);

        if let Some(sl) = position.stop_loss_pct {
            params.stop_loss_pct = sl;
        }
        if let Some(tp) = position.take_profit_pct {
            params.take_profit_pct = tp;
        }
        if let Some(distance) = position.trailing_stop_pct {
            params.trailing_distance_pct = distance;
        }
        if let Some(activation) = position.trailing_activation_pct {
            params.trailing_activation_pct = activation;
        }

        let tightening = match regime {
            MarketRegime::Panic => config.trailing_tightening.panic,
            MarketRegime::Caution => config.trailing_tightening.caution,
            MarketRegime::Euphoria => config.trailing_tightening.euphoria,
            MarketRegime::Normal => 1.0,
        };
        params.trailing_distance_pct *= tightening.clamp(0.0, 1.0);
        params
    }

    /// Highest price seen for a position since it was first evaluated
    pub fn peak(&self, key: &PositionKey) -> Option<Money> {
        sync::lock(&self.peaks).get(key).copied()
    }

    pub fn evaluate(&self, position: &Position, price: Money, regime: MarketRegime) -> Option<ExitDecision> {
        self.evaluate_at(position, price, regime, Utc::now())
    }

    pub fn evaluate_at(
        &self,
        position: &Position,
        price: Money,
        regime: MarketRegime,
        now: DateTime<Utc>,
    ) -> Option<ExitDecision> {
        if !price.is_positive() {
            return None;
        }
        let params = self.effective_params(position, regime);
        let entry = position.entry_price;

        let peak = {
            let mut peaks = sync::lock(&self.peaks);
            let peak = peaks
                .entry(position.key())
                .or_insert_with(|| entry.max(price));
            *peak = (*peak).max(price);
            *peak
        };

        let held_for = now - position.opened_at;
        let reason = first_exit_reason(entry, peak, price, held_for, &params)?;

        let decision = ExitDecision {
            symbol: position.symbol.clone(),
            strategy: position.strategy.clone(),
            tier: position.tier,
            reason,
            exit_price: price,
            entry_price: entry,
            opened_at: position.opened_at,
            profit_pct: position.profit_pct(price),
            take_profit_target_pct: params.take_profit_pct * 100.0,
        };
        info!(
            "🔔 Exit {} [{}] {}: entry {} -> {} ({:+.2}%)",
            decision.symbol,
            decision.strategy,
            decision.reason,
            decision.entry_price,
            decision.exit_price,
            decision.profit_pct
        );
        Some(decision)
    }

    /// Evaluate every position that has a price. Peak tracking is dropped
    /// for positions no longer in the list.
    pub fn evaluate_exits_at(
        &self,
        positions: &[Position],
        prices: &HashMap<Symbol, Money>,
        regime: MarketRegime,
        now: DateTime<Utc>,
    ) -> Vec<ExitDecision> {
        let decisions = positions
            .iter()
            .filter_map(|position| {
                let Some(price) = lookup_price(prices, &position.symbol) else {
                    debug!("No price for {}, skipping exit checks", position.symbol);
                    return None;
                };
                self.evaluate_at(position, price, regime, now)
            })
            .collect();

        let open: HashSet<PositionKey> = positions.iter().map(Position::key).collect();
        sync::lock(&self.peaks).retain(|key, _| open.contains(key));
        decisions
    }

    pub fn evaluate_exits(
        &self,
        positions: &[Position],
        prices: &HashMap<Symbol, Money>,
        regime: MarketRegime,
    ) -> Vec<ExitDecision> {
        self.evaluate_exits_at(positions, prices, regime, Utc::now())
    }
}

/// Rules in priority order; the first match wins
fn first_exit_reason(
    entry: Money,
    peak: Money,
    price: Money,
    held_for: Duration,
    params: &ExitParams,
) -> Option<ExitReason> {
    if params.stop_loss_pct > 0.0 && price <= entry.scale(1.0 - params.stop_loss_pct) {
        return Some(ExitReason::StopLoss);
    }
    if params.take_profit_pct > 0.0 && price >= entry.scale(1.0 + params.take_profit_pct) {
        return Some(ExitReason::TakeProfit);
    }
    if trailing_triggered(entry, peak, price, params) {
        return Some(ExitReason::TrailingStop);
    }
    if held_for >= config::hours(params.max_hold_hours) {
        return Some(ExitReason::Timeout);
    }
    None
}

/// The trail arms once the peak has cleared the activation level and
/// fires when price falls to `distance` below the peak.
fn trailing_triggered(entry: Money, peak: Money, price: Money, params: &ExitParams) -> bool {
    if params.trailing_distance_pct <= 0.0 {
        return false;
    }
    let activation = entry.scale(1.0 + params.trailing_activation_pct);
    if peak < activation {
        return false;
    }
    price <= peak.scale(1.0 - params.trailing_distance_pct)
}

fn lookup_price(prices: &HashMap<Symbol, Money>, symbol: &Symbol) -> Option<Money> {
    prices
        .get(symbol)
        .or_else(|| prices.get(&Symbol::new(symbol.normalized())))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn position(symbol: &str, tier: Tier) -> Position {
        Position {
            symbol: Symbol::new(symbol),
            strategy: "SWING".to_string(),
            tier,
            entry_price: Money::new(dec!(100)),
            quantity: Money::ONE,
            opened_at: t0(),
            stop_loss_pct: None,
            take_profit_pct: None,
            trailing_stop_pct: None,
            trailing_activation_pct: None,
        }
    }

    fn m(v: rust_decimal::Decimal) -> Money {
        Money::new(v)
    }

    fn reason_at(e: &ExitEvaluator, p: &Position, price: Money, hours: i64) -> Option<ExitReason> {
        e.evaluate_at(p, price, MarketRegime::Normal, t0() + Duration::hours(hours))
            .map(|d| d.reason)
    }

    #[test]
    fn test_stop_loss_and_take_profit_levels() {
        let e = ExitEvaluator::default();
        let p = position("BTC", Tier::LargeCap);
        assert_eq!(reason_at(&e, &p, m(dec!(97.01)), 1), None);
        assert_eq!(reason_at(&e, &p, m(dec!(97)), 1), Some(ExitReason::StopLoss));

        let p = position("ETH", Tier::LargeCap);
        assert_eq!(reason_at(&e, &p, m(dec!(106)), 1), Some(ExitReason::TakeProfit));
    }

    #[test]
    fn test_stop_loss_beats_timeout() {
        let e = ExitEvaluator::default();
        let p = position("DOGE", Tier::Memecoin);
        // Past the 12h max hold and through the 8% stop
        assert_eq!(reason_at(&e, &p, m(dec!(90)), 13), Some(ExitReason::StopLoss));
        assert_eq!(reason_at(&e, &p, m(dec!(99)), 13), Some(ExitReason::Timeout));
    }

    #[test]
    fn test_timeout_at_max_hold() {
        let e = ExitEvaluator::default();
        let p = position("XYZ", Tier::SmallCap);
        assert_eq!(reason_at(&e, &p, m(dec!(100)), 23), None);
        assert_eq!(reason_at(&e, &p, m(dec!(100)), 24), Some(ExitReason::Timeout));
    }

    #[test]
    fn test_huge_max_hold_never_times_out() {
        let mut config = ExitConfig::default();
        config.tiers.small_cap.max_hold_hours = 1e13;
        let e = ExitEvaluator::new(config);
        let p = position("XYZ", Tier::SmallCap);
        assert_eq!(reason_at(&e, &p, m(dec!(100)), 24 * 365 * 50), None);
    }

    #[test]
    fn test_trailing_requires_activation() {
        let e = ExitEvaluator::default();
        let p = position("BTC", Tier::LargeCap);
        // Peak 102.9 never reaches the 3% activation level
        assert_eq!(reason_at(&e, &p, m(dec!(102.9)), 1), None);
        assert_eq!(reason_at(&e, &p, m(dec!(100.5)), 2), None);
    }

    #[test]
    fn test_trailing_follows_peak() {
        let e = ExitEvaluator::default();
        let p = position("BTC", Tier::LargeCap);
        assert_eq!(reason_at(&e, &p, m(dec!(104)), 1), None);
        assert_eq!(reason_at(&e, &p, m(dec!(103)), 2), None);
        // Floor is 104 * 0.985 = 102.44
        assert_eq!(reason_at(&e, &p, m(dec!(102.44)), 3), Some(ExitReason::TrailingStop));
        assert_eq!(e.peak(&p.key()), Some(m(dec!(104))));
    }

    #[test]
    fn test_panic_tightens_trail() {
        let e = ExitEvaluator::default();
        let p = position("BTC", Tier::LargeCap);
        e.evaluate_at(&p, m(dec!(104)), MarketRegime::Normal, t0());
        // Normal floor 102.44 vs PANIC floor 104 * 0.9925 = 103.22
        let normal = e.evaluate_at(&p, m(dec!(103.2)), MarketRegime::Normal, t0());
        assert!(normal.is_none());
        let panic = e.evaluate_at(&p, m(dec!(103.2)), MarketRegime::Panic, t0()).unwrap();
        assert_eq!(panic.reason, ExitReason::TrailingStop);
        assert_eq!(panic.exit_price, m(dec!(103.2)));
    }

    #[test]
    fn test_position_overrides() {
        let e = ExitEvaluator::default();
        let mut p = position("BTC", Tier::LargeCap);
        p.stop_loss_pct = Some(0.01);
        p.take_profit_pct = Some(0.02);
        assert_eq!(reason_at(&e, &p, m(dec!(99)), 1), Some(ExitReason::StopLoss));
        let d = e
            .evaluate_at(&p, m(dec!(102)), MarketRegime::Normal, t0())
            .unwrap();
        assert_eq!(d.reason, ExitReason::TakeProfit);
        assert!((d.take_profit_target_pct - 2.0).abs() < 1e-9);
        assert!((d.profit_pct - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_evaluate_exits_skips_missing_prices_and_prunes_peaks() {
        let e = ExitEvaluator::default();
        let btc = position("BTC", Tier::LargeCap);
        let eth = position("ETH", Tier::LargeCap);

        let mut prices = HashMap::new();
        prices.insert(Symbol::new("BTC"), m(dec!(101)));
        let decisions =
            e.evaluate_exits_at(&[btc.clone(), eth.clone()], &prices, MarketRegime::Normal, t0());
        assert!(decisions.is_empty());
        assert!(e.peak(&btc.key()).is_some());
        assert!(e.peak(&eth.key()).is_none());

        prices.insert(Symbol::new("BTC"), m(dec!(96)));
        let decisions = e.evaluate_exits_at(&[btc.clone()], &prices, MarketRegime::Normal, t0());
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].reason, ExitReason::StopLoss);

        e.evaluate_exits_at(&[], &prices, MarketRegime::Normal, t0());
        assert!(e.peak(&btc.key()).is_none());
    }
}
