//! Rolling observation window for adaptive sample-rate advice.
//!
//! A separate task owns two maps of per-bucket (seen, submitted) counts.
//! Every rotation interval the current map becomes the previous one, so a
//! query shortly after rotation can still lean on a full window of history.
//! The window is advisory state only; it never feeds aggregation.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// How often the current map rotates into the previous one.
pub const ROTATION_INTERVAL: Duration = Duration::from_secs(10);

/// One parsed event as seen by the window: bucket plus client sample rate.
#[derive(Debug, Clone)]
pub struct Observation {
    pub bucket: String,
    pub sampling: f64,
}

/// An `ideal_sample_rate` query. The admin task owns the socket; the window
/// only answers through the reply channel.
#[derive(Debug)]
pub struct RateQuery {
    pub bucket: String,
    pub reply: oneshot::Sender<f64>,
}

/// Per-bucket counts: what reached us vs. what the client-side estimate says
/// was originally triggered (submitted ≥ seen after sampling and UDP loss).
#[derive(Debug, Clone, Copy, Default)]
struct Amounts {
    seen: u64,
    submitted: u64,
}

/// Dual rolling map of observation counts.
pub struct ObservationWindow {
    cur: HashMap<String, Amounts>,
    prev: HashMap<String, Amounts>,
    max_timers_per_s: u64,
}

impl ObservationWindow {
    pub fn new(max_timers_per_s: u64) -> Self {
        Self {
            cur: HashMap::new(),
            prev: HashMap::new(),
            max_timers_per_s,
        }
    }

    /// Records one observed event.
    fn observe(&mut self, bucket: &str, sampling: f64) {
        let entry = self.cur.entry(bucket.to_string()).or_default();
        entry.seen += 1;
        entry.submitted += (1.0 / sampling).round() as u64;
    }

    /// Rotates the current map into the previous slot.
    fn rotate(&mut self) {
        self.prev = std::mem::take(&mut self.cur);
    }

    /// Submission estimate for a bucket across both windows.
    fn submitted(&self, bucket: &str) -> u64 {
        let cur = self.cur.get(bucket).map_or(0, |a| a.submitted);
        let prev = self.prev.get(bucket).map_or(0, |a| a.submitted);
        cur + prev
    }

    /// Computes the recommended client sample rate for a bucket.
    ///
    /// `elapsed_s` is the time since the last rotation plus the previous
    /// window's span, i.e. the horizon the submission counts cover. The
    /// result is 1.0 when the observed rate fits under the target, otherwise
    /// the fraction that would bring it back to the target.
    fn ideal_rate(&self, bucket: &str, elapsed_s: f64) -> f64 {
        let rate_per_s = self.submitted(bucket) as f64 / elapsed_s;
        if rate_per_s <= self.max_timers_per_s as f64 {
            1.0
        } else {
            self.max_timers_per_s as f64 / rate_per_s
        }
    }

    /// Runs the window task until cancellation.
    pub async fn run(
        mut self,
        mut observations: mpsc::Receiver<Observation>,
        mut queries: mpsc::Receiver<RateQuery>,
        cancel: CancellationToken,
    ) {
        let mut swap_ts = Instant::now();
        let mut ticker = interval_at(swap_ts + ROTATION_INTERVAL, ROTATION_INTERVAL);

        info!(
            rotation = ?ROTATION_INTERVAL,
            max_timers_per_s = self.max_timers_per_s,
            "observation window started",
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return;
                }

                _ = ticker.tick() => {
                    self.rotate();
                    swap_ts = Instant::now();
                }

                Some(observation) = observations.recv() => {
                    self.observe(&observation.bucket, observation.sampling);
                }

                Some(query) = queries.recv() => {
                    let elapsed = swap_ts.elapsed().as_secs_f64()
                        + ROTATION_INTERVAL.as_secs_f64();
                    let rate = self.ideal_rate(&query.bucket, elapsed);
                    if query.reply.send(rate).is_err() {
                        debug!(bucket = %query.bucket, "sample-rate requester went away");
                    }
                }
            }
        }
    }
}
