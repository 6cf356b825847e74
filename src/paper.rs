//! Paper trading book
//!
//! Stands in for the trading engine: it owns open positions and pending entry
//! candidates, fills at the latest board price, and keeps realised P&L.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::error::{GuardError, GuardResult};
use crate::exits::ExitDecision;
use crate::feed::SharedPriceBoard;
use crate::sync;
use crate::{ExitReason, Money, Position, Symbol, Tier};

/// Signal from a strategy that wants to open a position
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryCandidate {
    pub symbol: Symbol,
    pub strategy: String,
}

/// Interface the protection loop needs from a trading engine
pub trait TradingEngine {
    fn open_positions(&self) -> Vec<Position>;

    fn current_prices(&self) -> HashMap<Symbol, Money>;

    fn entry_candidates(&self) -> Vec<EntryCandidate>;

    fn close_position(&mut self, decision: &ExitDecision) -> GuardResult<()>;

    fn open_position(
        &mut self,
        candidate: &EntryCandidate,
        tier: Tier,
        size: Money,
        price: Money,
        now: DateTime<Utc>,
    ) -> GuardResult<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub symbol: Symbol,
    pub strategy: String,
    pub reason: ExitReason,
    pub entry_price: Money,
    pub exit_price: Money,
    pub quantity: Money,
    pub pnl: Money,
    pub closed_at: DateTime<Utc>,
}

/// On-disk shape of a paper book
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaperBookFile {
    #[serde(default)]
    pub positions: Vec<Position>,
    #[serde(default)]
    pub candidates: Vec<EntryCandidate>,
    #[serde(default)]
    pub closed: Vec<ClosedTrade>,
}

#[derive(Debug)]
pub struct PaperBook {
    positions: Vec<Position>,
    candidates: Vec<EntryCandidate>,
    closed: Vec<ClosedTrade>,
    prices: SharedPriceBoard,
}

impl PaperBook {
    pub fn new(prices: SharedPriceBoard) -> Self {
        Self::from_file_contents(PaperBookFile::default(), prices)
    }

    pub fn from_file_contents(file: PaperBookFile, prices: SharedPriceBoard) -> Self {
        Self {
            positions: file.positions,
            candidates: file.candidates,
            closed: file.closed,
            prices,
        }
    }

    /// Load a book from JSON; a missing file gives an empty book
    pub fn load(path: impl AsRef<Path>, prices: SharedPriceBoard) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!("Paper book {} not found, starting empty", path.display());
            return Ok(Self::new(prices));
        }
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read paper book: {}", path.display()))?;
        let file: PaperBookFile =
            serde_json::from_str(&contents).context("Failed to parse paper book JSON")?;
        info!(
            "Loaded paper book: {} positions, {} entry candidates",
            file.positions.len(),
            file.candidates.len()
        );
        Ok(Self::from_file_contents(file, prices))
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = PaperBookFile {
            positions: self.positions.clone(),
            candidates: self.candidates.clone(),
            closed: self.closed.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;
        fs::write(path, json)
            .with_context(|| format!("Failed to write paper book: {}", path.display()))?;
        Ok(())
    }

    pub fn add_candidate(&mut self, candidate: EntryCandidate) {
        if !self.candidates.contains(&candidate) {
            self.candidates.push(candidate);
        }
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed
    }

    pub fn realized_pnl(&self) -> Money {
        self.closed.iter().map(|t| t.pnl).sum()
    }
}

impl TradingEngine for PaperBook {
    fn open_positions(&self) -> Vec<Position> {
        self.positions.clone()
    }

    fn current_prices(&self) -> HashMap<Symbol, Money> {
        sync::read(&self.prices).clone()
    }

    fn entry_candidates(&self) -> Vec<EntryCandidate> {
        self.candidates.clone()
    }

    fn close_position(&mut self, decision: &ExitDecision) -> GuardResult<()> {
        let key = decision.key();
        let idx = self
            .positions
            .iter()
            .position(|p| p.key() == key)
            .ok_or_else(|| {
                GuardError::UnknownPosition(format!("{} [{}]", decision.symbol, decision.strategy))
            })?;
        let position = self.positions.remove(idx);

        let pnl = (decision.exit_price - position.entry_price) * position.quantity;
        info!(
            "📕 Closed {} [{}] {} @ {} pnl {}",
            position.symbol,
            position.strategy,
            decision.reason,
            decision.exit_price,
            pnl.round_dp(2)
        );
        self.closed.push(ClosedTrade {
            symbol: position.symbol,
            strategy: position.strategy,
            reason: decision.reason,
            entry_price: position.entry_price,
            exit_price: decision.exit_price,
            quantity: position.quantity,
            pnl,
            closed_at: Utc::now(),
        });
        Ok(())
    }

    fn open_position(
        &mut self,
        candidate: &EntryCandidate,
        tier: Tier,
        size: Money,
        price: Money,
        now: DateTime<Utc>,
    ) -> GuardResult<()> {
        if !price.is_positive() || !size.is_positive() {
            return Err(GuardError::InvalidPrice(price.to_f64()));
        }
        let quantity = size / price;
        info!(
            "📗 Opened {} [{}] size {} @ {} qty {}",
            candidate.symbol,
            candidate.strategy,
            size,
            price,
            quantity.round_dp(8)
        );
        self.positions.push(Position {
            symbol: candidate.symbol.clone(),
            strategy: candidate.strategy.clone(),
            tier,
            entry_price: price,
            quantity,
            opened_at: now,
            stop_loss_pct: None,
            take_profit_pct: None,
            trailing_stop_pct: None,
            trailing_activation_pct: None,
        });
        self.candidates.retain(|c| c != candidate);
        Ok(())
    }
}
