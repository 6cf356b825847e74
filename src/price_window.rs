//! Bounded, time-ordered buffer of reference-asset prices
//!
//! Every read is a pure function of the buffer contents. The reference
//! "now" for window queries is the newest sample, not the wall clock, so the
//! same buffer always yields the same metrics.

use chrono::{DateTime, Duration, Utc};
use itertools::{Itertools, MinMaxResult};
use std::collections::VecDeque;
use std::sync::{Arc, RwLock};

use crate::error::{GuardError, GuardResult};
use crate::PriceSample;

/// Samples older than this (relative to the newest sample) are evicted
pub const RETENTION_HOURS: i64 = 48;

/// Price window shared between the ingestion task and the evaluation loop
pub type SharedPriceWindow = Arc<RwLock<PriceWindow>>;

#[derive(Debug, Clone)]
pub struct PriceWindow {
    samples: VecDeque<PriceSample>,
    retention: Duration,
}

impl Default for PriceWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl PriceWindow {
    pub fn new() -> Self {
        Self::with_retention(Duration::hours(RETENTION_HOURS))
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            retention,
        }
    }

    pub fn shared() -> SharedPriceWindow {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Append a sample and evict everything past the retention horizon.
    ///
    /// Timestamps must be non-decreasing; an older sample is rejected.
    pub fn append(&mut self, sample: PriceSample) -> GuardResult<()> {
        if !sample.price.is_finite() || sample.price <= 0.0 {
            return Err(GuardError::InvalidPrice(sample.price));
        }
        if let Some(newest) = self.samples.back() {
            if sample.timestamp < newest.timestamp {
                return Err(GuardError::OutOfOrderSample {
                    sample: sample.timestamp,
                    newest: newest.timestamp,
                });
            }
        }

        self.samples.push_back(sample);

        let horizon = sample.timestamp - self.retention;
        while self
            .samples
            .front()
            .is_some_and(|oldest| oldest.timestamp < horizon)
        {
            self.samples.pop_front();
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn latest(&self) -> Option<&PriceSample> {
        self.samples.back()
    }

    pub fn oldest(&self) -> Option<&PriceSample> {
        self.samples.front()
    }

    /// Most recent sample at or before `at`
    pub fn value_at_or_before(&self, at: DateTime<Utc>) -> Option<&PriceSample> {
        // Samples are sorted, so the first index past `at` bounds the search
        let idx = self.samples.partition_point(|s| s.timestamp <= at);
        if idx == 0 {
            None
        } else {
            self.samples.get(idx - 1)
        }
    }

    /// Samples with timestamps in `[newest - hours, newest]`
    pub fn samples_in_window(&self, hours: f64) -> impl Iterator<Item = &PriceSample> + '_ {
        let start = self.window_start(hours);
        let skip = match start {
            Some(start) => self.samples.partition_point(|s| s.timestamp < start),
            None => self.samples.len(),
        };
        self.samples.iter().skip(skip)
    }

    pub fn count_in_window(&self, hours: f64) -> usize {
        self.samples_in_window(hours).count()
    }

    /// Percent change between the newest sample and the sample at
    /// `newest - hours`.
    ///
    /// If no sample is that old yet, the oldest available sample is used so
    /// the metric is approximate rather than missing during warm-up.
    pub fn change_over_window(&self, hours: f64) -> Option<f64> {
        if self.samples.len() < 2 {
            return None;
        }
        let latest = self.samples.back()?;
        let start = self.window_start(hours)?;
        let base = self
            .value_at_or_before(start)
            .or_else(|| self.samples.front())?;

        if base.price <= 0.0 {
            return None;
        }
        Some((latest.price - base.price) / base.price * 100.0)
    }

    /// Range volatility in percent: `(max - min) / first * 100`.
    ///
    /// With `bucket_minutes > 1` the samples are first averaged into fixed
    /// time buckets, which suppresses single-tick spikes.
    pub fn range_volatility(&self, hours: f64, bucket_minutes: u32) -> Option<f64> {
        let samples: Vec<&PriceSample> = self.samples_in_window(hours).collect();
        if samples.len() < 2 {
            return None;
        }

        let series: Vec<f64> = if bucket_minutes > 1 {
            bucket_means(&samples, Duration::minutes(i64::from(bucket_minutes)))
        } else {
            samples.iter().map(|s| s.price).collect()
        };

        let first = *series.first()?;
        if first <= 0.0 {
            return None;
        }

        let (min, max) = match series.iter().copied().minmax_by(f64::total_cmp) {
            MinMaxResult::NoElements => return None,
            MinMaxResult::OneElement(v) => (v, v),
            MinMaxResult::MinMax(lo, hi) => (lo, hi),
        };
        Some((max - min) / first * 100.0)
    }

    /// Highest price in the window
    pub fn peak_in_window(&self, hours: f64) -> Option<f64> {
        self.samples_in_window(hours)
            .map(|s| s.price)
            .max_by(f64::total_cmp)
    }

    /// Peak-to-current decline in percent (zero or negative), `None` when the
    /// window holds fewer than `min_samples`.
    pub fn decline_from_peak(&self, hours: f64, min_samples: usize) -> Option<f64> {
        if self.count_in_window(hours) < min_samples.max(1) {
            return None;
        }
        let current = self.latest()?.price;
        let peak = self.peak_in_window(hours)?;
        if peak <= 0.0 {
            return None;
        }
        Some((current - peak) / peak * 100.0)
    }

    fn window_start(&self, hours: f64) -> Option<DateTime<Utc>> {
        let latest = self.samples.back()?;
        Some(latest.timestamp - crate::config::hours(hours))
    }
}

/// Average consecutive samples that fall into the same time bucket
fn bucket_means(samples: &[&PriceSample], bucket: Duration) -> Vec<f64> {
    let Some(origin) = samples.first().map(|s| s.timestamp) else {
        return Vec::new();
    };
    let bucket_secs = bucket.num_seconds().max(1);

    let buckets = samples
        .iter()
        .chunk_by(|s| (s.timestamp - origin).num_seconds() / bucket_secs);

    let means: Vec<f64> = (&buckets)
        .into_iter()
        .map(|(_, group)| {
            let (sum, n) = group.fold((0.0, 0usize), |(sum, n), s| (sum + s.price, n + 1));
            sum / n as f64
        })
        .collect();
    means
}
