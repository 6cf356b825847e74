//! Per-symbol revenge-trading protection
//!
//! Every stop-loss starts a tier-specific cooldown on the symbol. Enough
//! consecutive stops without a qualifying profitable exit in between turn
//! into a ban. The ban is derived from the ledger on each check rather than
//! stored.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::config::{self, LimiterConfig};
use crate::state_store::{LimiterStore, PersistedLimiterState, StateSender};
use crate::sync;
use crate::{ExitReason, Symbol, Tier};

/// Ledger entry for one symbol
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolPenaltyState {
    pub last_stop: Option<DateTime<Utc>>,
    pub consecutive_stops: u32,
    pub last_outcome: Option<ExitReason>,
}

/// Answer to "can this symbol be traded now"
#[derive(Debug, Clone, PartialEq)]
pub enum TradePermission {
    Allowed,
    Banned {
        consecutive_stops: u32,
        remaining: Duration,
    },
    Cooldown {
        tier: Tier,
        remaining: Duration,
    },
}

impl TradePermission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, TradePermission::Allowed)
    }

    pub fn reason(&self) -> String {
        match self {
            TradePermission::Allowed => "OK".to_string(),
            TradePermission::Banned {
                consecutive_stops,
                remaining,
            } => format!(
                "BANNED after {} consecutive stop-losses, {} remaining",
                consecutive_stops,
                format_remaining(*remaining)
            ),
            TradePermission::Cooldown { tier, remaining } => format!(
                "COOLDOWN after stop-loss ({}), {} remaining",
                tier,
                format_remaining(*remaining)
            ),
        }
    }

    /// `(allowed, reason)` pair for callers that only need text
    pub fn as_tuple(&self) -> (bool, String) {
        (self.is_allowed(), self.reason())
    }
}

/// Render a duration as `4h 12m`, `12m 5s` or `5s`
pub fn format_remaining(d: Duration) -> String {
    let secs = d.num_seconds().max(0);
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{}h {}m", h, m)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimiterStats {
    pub symbols_on_cooldown: Vec<String>,
    pub symbols_banned: Vec<String>,
    /// Non-zero counters only
    pub consecutive_stops: BTreeMap<String, u32>,
}

#[derive(Debug)]
pub struct TradeLimiter {
    config: RwLock<LimiterConfig>,
    ledger: RwLock<HashMap<String, SymbolPenaltyState>>,
    persistence: Mutex<Option<StateSender>>,
}

impl TradeLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        Self {
            config: RwLock::new(config),
            ledger: RwLock::new(HashMap::new()),
            persistence: Mutex::new(None),
        }
    }

    /// Send a snapshot to `sender` after every mutation
    pub fn with_persistence(self, sender: StateSender) -> Self {
        *sync::lock(&self.persistence) = Some(sender);
        self
    }

    /// Stop sending snapshots. Dropping the sender lets the persistence
    /// worker flush and exit.
    pub fn detach_persistence(&self) {
        sync::lock(&self.persistence).take();
    }

    pub fn apply_config(&self, config: LimiterConfig) {
        *sync::write(&self.config) = config;
    }

    pub fn config(&self) -> LimiterConfig {
        sync::read(&self.config).clone()
    }

    /// Load persisted state. Any failure leaves the ledger empty.
    pub fn load_from(&self, store: &dyn LimiterStore, now: DateTime<Utc>) -> usize {
        match store.load() {
            Ok(Some(state)) => self.restore(state, now),
            Ok(None) => {
                info!("No saved limiter state, starting with empty ledger");
                0
            }
            Err(e) => {
                warn!("Failed to load limiter state, starting empty: {}", e);
                0
            }
        }
    }

    /// Replace the ledger from a persisted document, pruning entries with no
    /// consecutive stops whose last activity is older than the prune horizon.
    /// Entries without a recorded stop age from the document's `last_updated`.
    pub fn restore(&self, state: PersistedLimiterState, now: DateTime<Utc>) -> usize {
        let prune_after = config::hours(sync::read(&self.config).prune_after_hours);

        let mut symbols: Vec<&String> = state
            .stop_loss_history
            .keys()
            .chain(state.consecutive_stops.keys())
            .chain(state.last_trade_outcomes.keys())
            .collect();
        symbols.sort();
        symbols.dedup();

        let updated = state.last_updated;
        let mut ledger = HashMap::new();
        let mut pruned = 0usize;
        for symbol in symbols {
            let entry = SymbolPenaltyState {
                last_stop: state.stop_loss_history.get(symbol).copied(),
                consecutive_stops: state.consecutive_stops.get(symbol).copied().unwrap_or(0),
                last_outcome: state
                    .last_trade_outcomes
                    .get(symbol)
                    .and_then(|r| r.parse().ok()),
            };

            let stale = entry.consecutive_stops == 0
                && entry
                    .last_stop
                    .or(updated)
                    .map_or(true, |ts| now - ts > prune_after);
            if stale {
                pruned += 1;
                continue;
            }
            ledger.insert(symbol.trim().to_ascii_uppercase(), entry);
        }

        let restored = ledger.len();
        *sync::write(&self.ledger) = ledger;
        info!(
            "📂 Limiter state restored: {} symbols ({} pruned)",
            restored, pruned
        );
        restored
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> PersistedLimiterState {
        let ledger = sync::read(&self.ledger);
        let mut state = PersistedLimiterState {
            last_updated: Some(now),
            ..Default::default()
        };
        for (symbol, entry) in ledger.iter() {
            if let Some(ts) = entry.last_stop {
                state.stop_loss_history.insert(symbol.clone(), ts);
            }
            state
                .consecutive_stops
                .insert(symbol.clone(), entry.consecutive_stops);
            if let Some(reason) = entry.last_outcome {
                state
                    .last_trade_outcomes
                    .insert(symbol.clone(), reason.as_str().to_string());
            }
        }
        state
    }

    fn persist(&self, now: DateTime<Utc>) {
        let sender = sync::lock(&self.persistence).clone();
        if let Some(sender) = sender {
            sender.submit(self.snapshot(now));
        }
    }

    pub fn symbol_tier(&self, symbol: &Symbol) -> Tier {
        sync::read(&self.config).tiers.tier_of(symbol)
    }

    pub fn penalty(&self, symbol: &Symbol) -> Option<SymbolPenaltyState> {
        sync::read(&self.ledger).get(&symbol.normalized()).cloned()
    }

    pub fn record_stop_loss(&self, symbol: &Symbol) {
        self.record_stop_loss_at(symbol, Utc::now());
    }

    pub fn record_stop_loss_at(&self, symbol: &Symbol, now: DateTime<Utc>) {
        let (max_stops, ban_hours) = {
            let config = sync::read(&self.config);
            (config.max_consecutive_stops, config.ban_duration_hours)
        };

        let stops = {
            let mut ledger = sync::write(&self.ledger);
            let entry = ledger.entry(symbol.normalized()).or_default();
            entry.last_stop = Some(now);
            entry.consecutive_stops += 1;
            entry.last_outcome = Some(ExitReason::StopLoss);
            entry.consecutive_stops
        };

        if stops >= max_stops {
            warn!(
                "🚫 {} BANNED for {}h after {} consecutive stop-losses",
                symbol, ban_hours, stops
            );
        } else {
            warn!(
                "{} stop-loss recorded ({}/{} before ban), {} cooldown",
                symbol,
                stops,
                max_stops,
                self.symbol_tier(symbol)
            );
        }
        self.persist(now);
    }

    pub fn record_successful_trade(
        &self,
        symbol: &Symbol,
        reason: ExitReason,
        profit_pct: Option<f64>,
        take_profit_target: Option<f64>,
    ) {
        self.record_successful_trade_at(symbol, reason, profit_pct, take_profit_target, Utc::now());
    }

    /// Record a non-stop exit. `profit_pct` and `take_profit_target` are in
    /// the same unit.
    pub fn record_successful_trade_at(
        &self,
        symbol: &Symbol,
        reason: ExitReason,
        profit_pct: Option<f64>,
        take_profit_target: Option<f64>,
        now: DateTime<Utc>,
    ) {
        let resets = resets_counter(reason, profit_pct, take_profit_target);

        let cleared = {
            let mut ledger = sync::write(&self.ledger);
            let entry = ledger.entry(symbol.normalized()).or_default();
            entry.last_outcome = Some(reason);
            if resets {
                std::mem::take(&mut entry.consecutive_stops)
            } else {
                0
            }
        };

        if cleared > 0 {
            info!(
                "✅ {} {} exit cleared {} consecutive stop-losses",
                symbol, reason, cleared
            );
        } else {
            debug!("{} {} exit recorded", symbol, reason);
        }
        self.persist(now);
    }

    pub fn can_trade_symbol(&self, symbol: &Symbol) -> TradePermission {
        self.can_trade_symbol_at(symbol, Utc::now())
    }

    /// Ban check first, then the tier cooldown. A stop is allowed again
    /// exactly at `last_stop + cooldown`. An expired ban resets the counter.
    pub fn can_trade_symbol_at(&self, symbol: &Symbol, now: DateTime<Utc>) -> TradePermission {
        let (max_stops, ban, cooldown, tier) = {
            let config = sync::read(&self.config);
            let tier = config.tiers.tier_of(symbol);
            (
                config.max_consecutive_stops,
                config::hours(config.ban_duration_hours),
                config::hours(config.cooldown_hours.hours_for(tier)),
                tier,
            )
        };

        let mut ban_expired = false;
        let permission = {
            let mut ledger = sync::write(&self.ledger);
            let Some(entry) = ledger.get_mut(&symbol.normalized()) else {
                return TradePermission::Allowed;
            };
            let Some(last_stop) = entry.last_stop else {
                return TradePermission::Allowed;
            };

            if entry.consecutive_stops >= max_stops {
                let ban_end = config::deadline(last_stop, ban);
                if now < ban_end {
                    return TradePermission::Banned {
                        consecutive_stops: entry.consecutive_stops,
                        remaining: ban_end - now,
                    };
                }
                entry.consecutive_stops = 0;
                ban_expired = true;
            }

            let cooldown_end = config::deadline(last_stop, cooldown);
            if now < cooldown_end {
                TradePermission::Cooldown {
                    tier,
                    remaining: cooldown_end - now,
                }
            } else {
                TradePermission::Allowed
            }
        };

        if ban_expired {
            info!("{} ban expired, consecutive stop-losses reset", symbol);
            self.persist(now);
        }
        permission
    }

    /// Read-only view; unlike [`Self::can_trade_symbol_at`] it never resets
    /// expired bans.
    pub fn limiter_stats_at(&self, now: DateTime<Utc>) -> LimiterStats {
        let config = sync::read(&self.config).clone();
        let ban = config::hours(config.ban_duration_hours);
        let ledger = sync::read(&self.ledger);

        let mut stats = LimiterStats::default();
        for (symbol, entry) in ledger.iter() {
            if entry.consecutive_stops > 0 {
                stats
                    .consecutive_stops
                    .insert(symbol.clone(), entry.consecutive_stops);
            }
            let Some(last_stop) = entry.last_stop else {
                continue;
            };
            let banned = entry.consecutive_stops >= config.max_consecutive_stops
                && now < config::deadline(last_stop, ban);
            if banned {
                stats.symbols_banned.push(symbol.clone());
                continue;
            }
            let tier = config.tiers.tier_of(&Symbol::new(symbol));
            let cooldown = config::hours(config.cooldown_hours.hours_for(tier));
            if now < config::deadline(last_stop, cooldown) {
                stats.symbols_on_cooldown.push(symbol.clone());
            }
        }
        stats.symbols_banned.sort();
        stats.symbols_on_cooldown.sort();
        stats
    }

    pub fn limiter_stats(&self) -> LimiterStats {
        self.limiter_stats_at(Utc::now())
    }
}

/// Exits that clear the consecutive stop-loss counter
fn resets_counter(reason: ExitReason, profit_pct: Option<f64>, take_profit_target: Option<f64>) -> bool {
    match reason {
        ExitReason::TakeProfit | ExitReason::TrailingStop => true,
        ExitReason::Timeout if profit_pct.is_some_and(|p| p > 0.0) => true,
        // Partial win: at least half of the take-profit target
        _ => match (profit_pct, take_profit_target) {
            (Some(p), Some(target)) if target > 0.0 => p >= 0.5 * target,
            _ => false,
        },
    }
}
