//! Crypto Guard
//!
//! Market protection and adaptive exit engine for paper crypto trading:
//! regime classification from a reference asset, volatility gating of
//! strategies, per-symbol cooldowns and bans, and tiered exit rules.

pub mod alerts;
pub mod config;
pub mod error;
pub mod exits;
pub mod feed;
pub mod limiter;
pub mod orchestrator;
pub mod paper;
pub mod price_window;
pub mod regime;
pub mod state_store;
pub mod types;

mod sync;

pub use config::GuardConfig;
pub use error::{GuardError, GuardResult};
pub use exits::{ExitDecision, ExitEvaluator};
pub use limiter::{TradeLimiter, TradePermission};
pub use orchestrator::{EntryDecision, ProtectionOrchestrator};
pub use price_window::{PriceWindow, SharedPriceWindow};
pub use regime::{MarketRegime, RegimeDetector};
pub use types::*;
