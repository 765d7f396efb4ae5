//! Timer statistics.
//!
//! Pure aggregation math over one flush period's samples: ordering,
//! min/max/mean/median, biased standard deviation, cumulative sums, and
//! nearest-rank percentile thresholds. Percentile indexing is nearest-rank
//! with round-half-up, not linear interpolation; downstream dashboards
//! depend on that exact indexing.

use anyhow::{bail, Result};

/// One configured percentile threshold.
///
/// A negative value selects the lower tail. The label keeps the textual
/// form of the configured token with `.` replaced by `_`, so `99.9` emits
/// as `upper_99_9` and `-75` as `lower_75`.
#[derive(Debug, Clone, PartialEq)]
pub struct Percentile {
    value: f64,
    label: String,
}

impl Percentile {
    /// Parses one threshold token.
    pub fn parse(token: &str) -> Result<Self> {
        let value: f64 = token
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid percentile threshold {token:?}"))?;
        if !value.is_finite() || value == 0.0 || value.abs() > 100.0 {
            bail!("percentile threshold {token} outside (0, 100]");
        }
        Ok(Self {
            value,
            label: token.trim().replace('.', "_"),
        })
    }

    /// Parses a comma-separated threshold list. Empty input means no
    /// thresholds.
    pub fn parse_list(raw: &str) -> Result<Vec<Self>> {
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        raw.split(',').map(Self::parse).collect()
    }

    pub fn value(&self) -> f64 {
        self.value
    }

    /// True when this threshold selects the lower tail.
    pub fn is_lower(&self) -> bool {
        self.value < 0.0
    }

    /// Label for the emitted suffix, without the sign for lower tails.
    pub fn tail_label(&self) -> &str {
        self.label.strip_prefix('-').unwrap_or(&self.label)
    }
}

/// Statistics computed for one threshold of one timer bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdStat {
    /// `upper_<label>` or `lower_<label>` suffix, sign already stripped.
    pub label: String,
    pub lower_tail: bool,
    pub max_at: f64,
    pub mean: f64,
    pub sum: f64,
}

/// Full set of statistics for one timer bucket over one flush period.
#[derive(Debug, Clone, PartialEq)]
pub struct TimerSummary {
    /// Estimated source-side submission count (`Σ round(1/sᵢ)`).
    pub count: i64,
    pub count_ps: f64,
    pub lower: f64,
    pub upper: f64,
    pub mean: f64,
    pub median: f64,
    pub std: f64,
    pub sum: f64,
    pub thresholds: Vec<ThresholdStat>,
}

/// Computes the summary for one bucket's samples.
///
/// `points` must be non-empty; it is sorted in place. `submitted` is the
/// accumulated submission estimate and `flush_interval_s` the period used
/// for the per-second rate.
pub fn summarize(
    points: &mut [f64],
    submitted: i64,
    flush_interval_s: f64,
    thresholds: &[Percentile],
) -> TimerSummary {
    let seen = points.len();
    debug_assert!(seen >= 1);

    points.sort_by(f64::total_cmp);
    let lower = points[0];
    let upper = points[seen - 1];

    let sum: f64 = points.iter().sum();
    let mean = sum / seen as f64;
    let variance = points.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / seen as f64;
    let std = variance.sqrt();

    let mid = seen / 2;
    let median = if seen % 2 == 1 {
        points[mid]
    } else {
        (points[mid - 1] + points[mid]) / 2.0
    };

    let mut cumulative = Vec::with_capacity(seen);
    let mut running = 0.0;
    for value in points.iter() {
        running += value;
        cumulative.push(running);
    }

    let mut stats = Vec::with_capacity(thresholds.len());
    for pct in thresholds {
        // A single sample answers every threshold with the plain stats.
        let (max_at, sum_pct, mean_pct) = if seen == 1 {
            (upper, sum, mean)
        } else {
            threshold_stats(points, &cumulative, pct.value)
        };

        stats.push(ThresholdStat {
            label: pct.tail_label().to_string(),
            lower_tail: pct.is_lower(),
            max_at,
            mean: mean_pct,
            sum: sum_pct,
        });
    }

    TimerSummary {
        count: submitted,
        count_ps: submitted as f64 / flush_interval_s,
        lower,
        upper,
        mean,
        median,
        std,
        sum,
        thresholds: stats,
    }
}

/// Nearest-rank threshold statistics over sorted samples, `seen >= 2`.
///
/// Rank is `⌊(|p|/100)·n + 0.5⌋`, clamped into the valid sample range so
/// extreme threshold/sample-count combinations cannot index out of bounds.
/// For an upper threshold the statistic covers the lowest `k` samples; for
/// a lower threshold it is the value at rank `k` from below together with
/// the sum of the top `k` samples.
fn threshold_stats(points: &[f64], cumulative: &[f64], pct: f64) -> (f64, f64, f64) {
    let seen = points.len();
    let rank = ((pct.abs() / 100.0) * seen as f64 + 0.5).floor() as usize;

    if pct >= 0.0 {
        let k = rank.clamp(1, seen);
        let max_at = points[k - 1];
        let sum_pct = cumulative[k - 1];
        (max_at, sum_pct, sum_pct / k as f64)
    } else {
        let k = rank.clamp(1, seen - 1);
        let max_at = points[k];
        let sum_pct = cumulative[seen - 1] - cumulative[seen - k - 1];
        (max_at, sum_pct, sum_pct / k as f64)
    }
}
