//! Print persisted limiter state

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::info;

use crypto_guard::config::GuardConfig;
use crypto_guard::limiter::TradeLimiter;
use crypto_guard::state_store;
use crypto_guard::Symbol;

pub fn run(config_path: String, symbol: Option<String>) -> Result<()> {
    let config = GuardConfig::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    let store = state_store::store_for(config.limiter.state_file.as_deref());
    let limiter = TradeLimiter::new(config.limiter.clone());
    let now = Utc::now();
    let restored = limiter.load_from(store.as_ref(), now);
    info!("Loaded {} symbols from limiter state", restored);

    let output = match symbol {
        Some(symbol) => {
            let symbol = Symbol::new(symbol);
            let permission = limiter.can_trade_symbol_at(&symbol, now);
            serde_json::json!({
                "symbol": symbol,
                "tier": limiter.symbol_tier(&symbol),
                "allowed": permission.is_allowed(),
                "reason": permission.reason(),
                "penalty": limiter.penalty(&symbol),
            })
        }
        None => serde_json::to_value(limiter.limiter_stats_at(now))?,
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
