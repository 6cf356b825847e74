//! Replay recorded reference prices through the regime detector

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crypto_guard::alerts::AlertDispatcher;
use crypto_guard::config::GuardConfig;
use crypto_guard::feed::load_price_csv;
use crypto_guard::price_window::PriceWindow;
use crypto_guard::regime::{MarketRegime, RegimeDetector};

#[derive(Debug, Serialize)]
struct Transition {
    timestamp: DateTime<Utc>,
    price: f64,
    from: MarketRegime,
    to: MarketRegime,
    trigger: String,
    disabled_strategies: Vec<String>,
}

pub fn run(config_path: String, prices_path: String, step_minutes: u32) -> Result<()> {
    let config = GuardConfig::load_or_default(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    let samples = load_price_csv(&prices_path)?;
    if samples.is_empty() {
        anyhow::bail!("No price samples in {}", prices_path);
    }

    let window = PriceWindow::shared();
    let detector = RegimeDetector::new(
        Arc::clone(&window),
        config.regime.clone(),
        Arc::new(AlertDispatcher::disabled()),
    );

    let step = Duration::minutes(i64::from(step_minutes.max(1)));
    let mut next_eval: Option<DateTime<Utc>> = None;
    let mut current = MarketRegime::Normal;
    let mut transitions = Vec::new();
    let mut evaluations = 0usize;

    for sample in &samples {
        if let Err(e) = window
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .append(*sample)
        {
            warn!("Skipping sample: {}", e);
            continue;
        }

        if next_eval.is_some_and(|at| sample.timestamp < at) {
            continue;
        }
        next_eval = Some(sample.timestamp + step);
        evaluations += 1;

        let (classification, _) = detector.classify();
        let disabled = detector.refresh_disablements_at(sample.timestamp);
        if classification.regime != current {
            transitions.push(Transition {
                timestamp: sample.timestamp,
                price: sample.price,
                from: current,
                to: classification.regime,
                trigger: classification.trigger,
                disabled_strategies: disabled,
            });
            current = classification.regime;
        }
    }

    info!(
        "Replayed {} samples, {} evaluations, {} regime transitions",
        samples.len(),
        evaluations,
        transitions.len()
    );

    let report = serde_json::json!({
        "transitions": transitions,
        "final": detector.regime_stats(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
