//! Core data types shared by the protection engine

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, Sub};
use std::sync::Arc;

/// Trading pair symbol using Arc<str> for cheap cloning
///
/// Symbols are cloned into ledgers, decisions and stats on every cycle.
/// Comparison is exact; use [`Symbol::normalized`] for tier and config lookups.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(#[serde(with = "arc_str_serde")] Arc<str>);

mod arc_str_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(value: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(value)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<str>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(Arc::from(s.as_str()))
    }
}

impl Symbol {
    pub fn new(s: impl AsRef<str>) -> Self {
        Symbol(Arc::from(s.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Uppercased form used for membership checks against configured lists
    pub fn normalized(&self) -> String {
        self.0.trim().to_ascii_uppercase()
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol::new(s)
    }
}

// ============================================================================
// Money - decimal arithmetic for prices, quantities and sizes
// ============================================================================

/// Decimal wrapper for position prices, quantities and sizes.
///
/// Market data statistics stay in `f64`; anything that ends up on a position
/// or an exit decision is carried as `Money` so fills and P&L do not drift.
///
/// ```
/// use crypto_guard::Money;
/// let entry = Money::from_f64(100.0);
/// let stop = entry.scale(1.0 - 0.05);
/// assert_eq!(stop.to_f64(), 95.0);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(#[serde(with = "rust_decimal::serde::str")] Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);
    pub const ONE: Money = Money(Decimal::ONE);

    pub fn new(value: Decimal) -> Self {
        Money(value)
    }

    /// NaN and infinite inputs collapse to zero.
    pub fn from_f64(value: f64) -> Self {
        if !value.is_finite() {
            return Money::ZERO;
        }
        Money(
            Decimal::try_from(value)
                .or_else(|_| Decimal::from_f64_retain(value).ok_or(()))
                .unwrap_or(Decimal::ZERO),
        )
    }

    pub fn to_f64(self) -> f64 {
        self.0.to_f64().unwrap_or(0.0)
    }

    /// Multiply by a plain ratio, e.g. `entry.scale(1.0 + take_profit_pct)`.
    pub fn scale(self, factor: f64) -> Self {
        self * Money::from_f64(factor)
    }

    /// Percentage change from `base` to `self`, `None` when base is zero.
    pub fn pct_change_from(self, base: Money) -> Option<f64> {
        if base.is_zero() {
            return None;
        }
        Some(((self - base) / base).to_f64() * 100.0)
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(self) -> bool {
        self.0.is_sign_positive() && !self.0.is_zero()
    }

    pub fn max(self, other: Self) -> Self {
        Money(self.0.max(other.0))
    }

    pub fn round_dp(self, dp: u32) -> Self {
        Money(self.0.round_dp(dp))
    }

    pub fn inner(self) -> Decimal {
        self.0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl PartialOrd for Money {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Money {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self::Output {
        Money(self.0 + rhs.0)
    }
}

impl AddAssign for Money {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self::Output {
        Money(self.0 - rhs.0)
    }
}

impl Mul for Money {
    type Output = Self;
    fn mul(self, rhs: Self) -> Self::Output {
        Money(self.0 * rhs.0)
    }
}

impl Div for Money {
    type Output = Self;
    fn div(self, rhs: Self) -> Self::Output {
        if rhs.0.is_zero() {
            Money::ZERO
        } else {
            Money(self.0 / rhs.0)
        }
    }
}

impl From<Decimal> for Money {
    fn from(value: Decimal) -> Self {
        Money(value)
    }
}

impl std::iter::Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Money::ZERO, |acc, x| acc + x)
    }
}

// ============================================================================
// Market data
// ============================================================================

/// One reference-asset price observation. Immutable once appended.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceSample {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}

impl PriceSample {
    pub fn new(timestamp: DateTime<Utc>, price: f64) -> Self {
        Self { timestamp, price }
    }
}

// ============================================================================
// Positions and outcomes
// ============================================================================

/// Market-capitalization bucket used for cooldowns and exit parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    LargeCap,
    MidCap,
    #[default]
    SmallCap,
    Memecoin,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Tier::LargeCap, Tier::MidCap, Tier::SmallCap, Tier::Memecoin];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::LargeCap => "large_cap",
            Tier::MidCap => "mid_cap",
            Tier::SmallCap => "small_cap",
            Tier::Memecoin => "memecoin",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a position was (or would be) closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    TrailingStop,
    Timeout,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::Timeout => "timeout",
        }
    }
}

impl std::str::FromStr for ExitReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stop_loss" => Ok(ExitReason::StopLoss),
            "take_profit" => Ok(ExitReason::TakeProfit),
            "trailing_stop" => Ok(ExitReason::TrailingStop),
            "timeout" => Ok(ExitReason::Timeout),
            other => Err(format!("unknown exit reason: {}", other)),
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Open position as reported by the trading engine.
///
/// The exit percentages are optional per-position overrides expressed as
/// fractions (`0.05` = 5%). Missing values fall back to the tier's
/// configured exit parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub strategy: String,
    #[serde(default)]
    pub tier: Tier,
    pub entry_price: Money,
    pub quantity: Money,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub stop_loss_pct: Option<f64>,
    #[serde(default)]
    pub take_profit_pct: Option<f64>,
    #[serde(default)]
    pub trailing_stop_pct: Option<f64>,
    #[serde(default)]
    pub trailing_activation_pct: Option<f64>,
}

/// Stable identity of a position across evaluation cycles
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PositionKey {
    pub symbol: Symbol,
    pub strategy: String,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    pub fn key(&self) -> PositionKey {
        PositionKey {
            symbol: self.symbol.clone(),
            strategy: self.strategy.clone(),
            opened_at: self.opened_at,
        }
    }

    pub fn notional(&self) -> Money {
        self.entry_price * self.quantity
    }

    /// Unrealized P&L in percent at `price`
    pub fn profit_pct(&self, price: Money) -> f64 {
        price.pct_change_from(self.entry_price).unwrap_or(0.0)
    }
}
