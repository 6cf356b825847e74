//! Price ingestion
//!
//! Ticks arrive as JSON lines (`{"symbol":"BTC","price":64432.1,"timestamp":"..."}`).
//! Reference-asset ticks are appended to the shared [`PriceWindow`]; every
//! tick updates the latest-price board used for exits and entries.
//!
//! Recorded reference prices can also be replayed from CSV.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

use crate::error::{GuardError, GuardResult};
use crate::price_window::SharedPriceWindow;
use crate::sync;
use crate::{Money, PriceSample, Symbol};

/// Latest price per symbol, keyed by normalized symbol
pub type SharedPriceBoard = Arc<RwLock<HashMap<Symbol, Money>>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceTick {
    pub symbol: Symbol,
    pub price: f64,
    /// Missing timestamps are stamped on arrival
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl PriceTick {
    pub fn parse_line(line: &str) -> GuardResult<Self> {
        Ok(serde_json::from_str(line.trim())?)
    }
}

/// Routes ticks into the price window and the price board
#[derive(Debug, Clone)]
pub struct PriceFeed {
    reference: Symbol,
    window: SharedPriceWindow,
    board: SharedPriceBoard,
}

impl PriceFeed {
    pub fn new(reference_asset: &str, window: SharedPriceWindow, board: SharedPriceBoard) -> Self {
        Self {
            reference: Symbol::new(reference_asset.trim().to_ascii_uppercase()),
            window,
            board,
        }
    }

    pub fn reference(&self) -> &Symbol {
        &self.reference
    }

    pub fn board(&self) -> &SharedPriceBoard {
        &self.board
    }

    pub fn ingest(&self, tick: &PriceTick) -> GuardResult<()> {
        if !tick.price.is_finite() || tick.price <= 0.0 {
            return Err(GuardError::InvalidPrice(tick.price));
        }
        let symbol = Symbol::new(tick.symbol.normalized());

        if symbol == self.reference {
            sync::write(&self.window).append(PriceSample::new(tick.timestamp, tick.price))?;
        }
        sync::write(&self.board).insert(symbol, Money::from_f64(tick.price));
        Ok(())
    }

    /// Consume JSON lines until EOF. Bad lines are logged and skipped.
    pub async fn ingest_lines<R>(&self, reader: R) -> usize
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = reader.lines();
        let mut accepted = 0usize;
        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!("Price stream read error: {}", e);
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match PriceTick::parse_line(&line).and_then(|tick| self.ingest(&tick)) {
                Ok(()) => accepted += 1,
                Err(e) => warn!("Skipping tick: {}", e),
            }
        }
        info!("Price stream ended after {} ticks", accepted);
        accepted
    }
}

#[derive(Debug, Deserialize)]
struct CsvPriceRow {
    #[serde(alias = "datetime", alias = "time", alias = "date")]
    timestamp: String,
    #[serde(alias = "close")]
    price: f64,
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    raw.parse::<DateTime<Utc>>()
        .or_else(|_| {
            // Try parsing without timezone and assume UTC
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .map(|ndt| DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc))
        })
        .with_context(|| format!("Failed to parse datetime: {}", raw))
}

/// Load reference-asset prices from a CSV with a header row.
///
/// Accepts `timestamp`/`datetime` and `price`/`close` columns; any other
/// columns (OHLCV exports) are ignored. Rows are returned oldest first.
pub fn load_price_csv(path: impl AsRef<Path>) -> Result<Vec<PriceSample>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open CSV file: {}", path.display()))?;

    let mut samples = Vec::new();
    for (row_idx, result) in reader.deserialize::<CsvPriceRow>().enumerate() {
        let row = result.with_context(|| format!("Failed to read row {}", row_idx + 1))?;
        let timestamp = parse_timestamp(row.timestamp.trim())?;
        if !row.price.is_finite() || row.price <= 0.0 {
            debug!("Skipping row {} with price {}", row_idx + 1, row.price);
            continue;
        }
        samples.push(PriceSample::new(timestamp, row.price));
    }

    samples.sort_by_key(|s| s.timestamp);
    info!("Loaded {} price samples from {}", samples.len(), path.display());
    Ok(samples)
}
