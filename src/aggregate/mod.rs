//! The aggregation engine.
//!
//! A single task owns every counter, gauge and timer map. Events arrive on
//! a bounded channel, a ticker drives the periodic flush, and cancellation
//! triggers one final best-effort flush. Serializing all map access through
//! this task is what lets the rest of the daemon stay lock-free.

pub mod timer;

use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::{Duration, SystemTime};

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::ingest::event::{Event, MetricKind};
use crate::sink::GraphiteSink;

use self::timer::{summarize, Percentile};

/// How many queued events are drained opportunistically after each
/// received event, before the select loop runs again.
const BATCH_SIZE: usize = 256;

/// A gauge keeps its last value across flushes but only re-emits after a
/// new event clears the flushed tag.
struct GaugeEntry {
    value: f64,
    flushed: bool,
}

/// Timer samples collected during one flush period.
#[derive(Default)]
struct TimerData {
    points: Vec<f64>,
    submitted: i64,
}

/// Owner of all aggregation state.
pub struct Aggregator {
    flush_interval: Duration,
    prefix_rates: String,
    prefix_timers: String,
    prefix_gauges: String,
    percentiles: Vec<Percentile>,
    sink: GraphiteSink,

    counters: HashMap<String, f64>,
    gauges: HashMap<String, GaugeEntry>,
    timers: HashMap<String, TimerData>,
}

impl Aggregator {
    pub fn new(cfg: &Config, percentiles: Vec<Percentile>) -> Self {
        Self {
            flush_interval: cfg.flush_interval,
            prefix_rates: cfg.prefix_rates.clone(),
            prefix_timers: cfg.prefix_timers.clone(),
            prefix_gauges: cfg.prefix_gauges.clone(),
            percentiles,
            sink: GraphiteSink::new(&cfg.graphite_addr),
            counters: HashMap::new(),
            gauges: HashMap::new(),
            timers: HashMap::new(),
        }
    }

    /// Applies one event to the owning map.
    pub fn apply(&mut self, event: Event) {
        match event.kind {
            MetricKind::Counter => {
                *self.counters.entry(event.bucket).or_insert(0.0) +=
                    event.value / event.sampling;
            }

            MetricKind::Gauge => {
                self.gauges.insert(
                    event.bucket,
                    GaugeEntry {
                        value: event.value,
                        flushed: false,
                    },
                );
            }

            MetricKind::Timer => {
                let submitted = event.submitted_estimate();
                let data = self.timers.entry(event.bucket).or_default();
                data.points.push(event.value);
                data.submitted += submitted;
            }
        }
    }

    /// Renders every pending aggregate into a flush payload, applying the
    /// per-kind reset rules. Returns the payload and the number of metrics
    /// it covers (a timer counts once regardless of its line count).
    pub fn render(&mut self, now: i64) -> (String, u64) {
        let mut buffer = String::new();
        let mut num = 0;

        let started = Instant::now();
        let counters = self.render_counters(&mut buffer, now);
        debug!(lines = counters, elapsed = ?started.elapsed(), "rendered counters");
        num += counters;

        let started = Instant::now();
        let gauges = self.render_gauges(&mut buffer, now);
        debug!(lines = gauges, elapsed = ?started.elapsed(), "rendered gauges");
        num += gauges;

        let started = Instant::now();
        let timers = self.render_timers(&mut buffer, now);
        debug!(timers, elapsed = ?started.elapsed(), "rendered timers");
        num += timers;

        (buffer, num)
    }

    /// Emits one rate line per counter bucket and empties the map, so idle
    /// counters do not re-emit on the next flush.
    fn render_counters(&mut self, buffer: &mut String, now: i64) -> u64 {
        let mut num = 0;
        for (bucket, sum) in self.counters.drain() {
            let rate = sum / self.flush_interval.as_secs_f64();
            let _ = writeln!(buffer, "{}{} {:.6} {}", self.prefix_rates, bucket, rate, now);
            num += 1;
        }
        num
    }

    /// Emits unflushed gauges and tags them; a tagged entry stays silent
    /// until a new event overwrites it.
    fn render_gauges(&mut self, buffer: &mut String, now: i64) -> u64 {
        let mut num = 0;
        for (bucket, entry) in self.gauges.iter_mut() {
            if entry.flushed {
                continue;
            }
            let _ = writeln!(
                buffer,
                "{}{} {:.6} {}",
                self.prefix_gauges, bucket, entry.value, now
            );
            entry.flushed = true;
            num += 1;
        }
        num
    }

    /// Emits the full statistics block for each timer bucket with samples
    /// and consumes every entry.
    fn render_timers(&mut self, buffer: &mut String, now: i64) -> u64 {
        let mut num = 0;
        let drained: Vec<(String, TimerData)> = self.timers.drain().collect();
        for (bucket, mut data) in drained {
            if data.points.is_empty() {
                continue;
            }

            let summary = summarize(
                &mut data.points,
                data.submitted,
                self.flush_interval.as_secs_f64(),
                &self.percentiles,
            );
            let prefix = &self.prefix_timers;

            for stat in &summary.thresholds {
                let direction = if stat.lower_tail { "lower" } else { "upper" };
                let _ = writeln!(
                    buffer,
                    "{prefix}{bucket}.{direction}_{} {:.6} {now}",
                    stat.label, stat.max_at
                );
                let _ = writeln!(
                    buffer,
                    "{prefix}{bucket}.mean_{} {:.6} {now}",
                    stat.label, stat.mean
                );
                let _ = writeln!(
                    buffer,
                    "{prefix}{bucket}.sum_{} {:.6} {now}",
                    stat.label, stat.sum
                );
            }

            let _ = writeln!(buffer, "{prefix}{bucket}.mean {:.6} {now}", summary.mean);
            let _ = writeln!(buffer, "{prefix}{bucket}.median {:.6} {now}", summary.median);
            let _ = writeln!(buffer, "{prefix}{bucket}.std {:.6} {now}", summary.std);
            let _ = writeln!(buffer, "{prefix}{bucket}.sum {:.6} {now}", summary.sum);
            let _ = writeln!(buffer, "{prefix}{bucket}.upper {:.6} {now}", summary.upper);
            let _ = writeln!(buffer, "{prefix}{bucket}.lower {:.6} {now}", summary.lower);
            let _ = writeln!(buffer, "{prefix}{bucket}.count {} {now}", summary.count);
            let _ = writeln!(
                buffer,
                "{prefix}{bucket}.count_ps {:.6} {now}",
                summary.count_ps
            );

            num += 1;
        }
        num
    }

    /// One flush: render (which resets state), then deliver. Delivery
    /// failures are logged and dropped; re-sending stale aggregates would
    /// only confuse the receiver.
    async fn flush(&mut self, deadline: Instant) {
        let now = unix_now();
        let (payload, num) = self.render(now);

        if num == 0 {
            debug!("nothing to flush");
            return;
        }

        if tracing::enabled!(tracing::Level::DEBUG) {
            for line in payload.lines() {
                debug!(line, "flushing");
            }
        }

        if let Err(e) = self.sink.deliver(payload.as_bytes(), deadline).await {
            error!(error = %e, metrics = num, "flush failed");
        } else {
            debug!(metrics = num, "flush delivered");
        }
    }

    /// Runs the aggregator until cancellation, then performs one final
    /// flush with the usual deadline discipline.
    pub async fn run(mut self, mut events: mpsc::Receiver<Event>, cancel: CancellationToken) {
        let period = self.flush_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(flush_interval = ?period, "aggregator started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("shutting down, final flush");
                    self.flush(Instant::now() + period).await;
                    return;
                }

                _ = ticker.tick() => {
                    self.flush(Instant::now() + period).await;
                }

                Some(event) = events.recv() => {
                    self.apply(event);

                    // Drain a batch without yielding back to the scheduler.
                    for _ in 0..BATCH_SIZE - 1 {
                        match events.try_recv() {
                            Ok(event) => self.apply(event),
                            Err(_) => break,
                        }
                    }
                }
            }
        }
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aggregator(thresholds: &str) -> Aggregator {
        let cfg = Config {
            percentile_thresholds: thresholds.to_string(),
            ..Default::default()
        };
        let percentiles = cfg.percentiles().expect("valid thresholds");
        Aggregator::new(&cfg, percentiles)
    }

    fn counter(bucket: &str, value: f64, sampling: f64) -> Event {
        Event {
            bucket: bucket.to_string(),
            value,
            kind: MetricKind::Counter,
            sampling,
        }
    }

    fn gauge(bucket: &str, value: f64) -> Event {
        Event {
            bucket: bucket.to_string(),
            value,
            kind: MetricKind::Gauge,
            sampling: 1.0,
        }
    }

    fn timer(bucket: &str, value: f64) -> Event {
        Event {
            bucket: bucket.to_string(),
            value,
            kind: MetricKind::Timer,
            sampling: 1.0,
        }
    }

    fn lines(payload: &str) -> Vec<&str> {
        payload.lines().collect()
    }

    #[test]
    fn test_counter_sums_and_divides_by_interval() {
        let mut agg = aggregator("");
        agg.apply(counter("foo", 3.0, 1.0));
        agg.apply(counter("foo", 5.0, 1.0));

        let (payload, num) = agg.render(1000);
        assert_eq!(num, 1);
        assert_eq!(lines(&payload), vec!["stats.foo 0.800000 1000"]);
    }

    #[test]
    fn test_counter_scales_by_sample_rate() {
        let mut agg = aggregator("");
        agg.apply(counter("foo", 1.0, 0.1));

        let (payload, _) = agg.render(1000);
        assert_eq!(lines(&payload), vec!["stats.foo 1.000000 1000"]);
    }

    #[test]
    fn test_idle_counter_does_not_reemit() {
        let mut agg = aggregator("");
        agg.apply(counter("foo", 1.0, 1.0));

        let (_, num) = agg.render(1000);
        assert_eq!(num, 1);

        let (payload, num) = agg.render(1010);
        assert_eq!(num, 0);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_counter_restarts_from_zero_after_flush() {
        let mut agg = aggregator("");
        agg.apply(counter("foo", 8.0, 1.0));
        agg.render(1000);

        agg.apply(counter("foo", 2.0, 1.0));
        let (payload, _) = agg.render(1010);
        assert_eq!(lines(&payload), vec!["stats.foo 0.200000 1010"]);
    }

    #[test]
    fn test_gauge_overwrites_and_emits_once() {
        let mut agg = aggregator("");
        agg.apply(gauge("g1", 5.0));
        agg.apply(gauge("g1", 7.0));

        let (payload, num) = agg.render(1000);
        assert_eq!(num, 1);
        assert_eq!(lines(&payload), vec!["stats.gauges.g1 7.000000 1000"]);

        // Sticky-once: no new event, no line.
        let (payload, num) = agg.render(1010);
        assert_eq!(num, 0);
        assert!(payload.is_empty());
    }

    #[test]
    fn test_gauge_reemits_after_new_event() {
        let mut agg = aggregator("");
        agg.apply(gauge("g1", 5.0));
        agg.render(1000);

        agg.apply(gauge("g1", 5.0));
        let (payload, _) = agg.render(1010);
        assert_eq!(lines(&payload), vec!["stats.gauges.g1 5.000000 1010"]);
    }

    #[test]
    fn test_timer_statistics_block() {
        let mut agg = aggregator("75");
        for value in [1.0, 2.0, 3.0, 4.0] {
            agg.apply(timer("t", value));
        }

        let (payload, num) = agg.render(1000);
        assert_eq!(num, 1);

        let expected = vec![
            "stats.timers.t.upper_75 3.000000 1000",
            "stats.timers.t.mean_75 2.000000 1000",
            "stats.timers.t.sum_75 6.000000 1000",
            "stats.timers.t.mean 2.500000 1000",
            "stats.timers.t.median 2.500000 1000",
            "stats.timers.t.std 1.118034 1000",
            "stats.timers.t.sum 10.000000 1000",
            "stats.timers.t.upper 4.000000 1000",
            "stats.timers.t.lower 1.000000 1000",
            "stats.timers.t.count 4 1000",
            "stats.timers.t.count_ps 0.400000 1000",
        ];
        assert_eq!(lines(&payload), expected);
    }

    #[test]
    fn test_timer_lower_tail_threshold() {
        let mut agg = aggregator("-75");
        for value in [1.0, 2.0, 3.0, 4.0] {
            agg.apply(timer("t", value));
        }

        let (payload, _) = agg.render(1000);
        let all = lines(&payload);
        assert!(all.contains(&"stats.timers.t.lower_75 4.000000 1000"));
        assert!(all.contains(&"stats.timers.t.mean_75 3.000000 1000"));
        assert!(all.contains(&"stats.timers.t.sum_75 9.000000 1000"));
    }

    #[test]
    fn test_timer_sampled_count_estimate() {
        let mut agg = aggregator("");
        agg.apply(Event {
            bucket: "t".to_string(),
            value: 12.0,
            kind: MetricKind::Timer,
            sampling: 0.1,
        });

        let (payload, _) = agg.render(1000);
        let all = lines(&payload);
        assert!(all.contains(&"stats.timers.t.count 10 1000"));
        assert!(all.contains(&"stats.timers.t.count_ps 1.000000 1000"));
    }

    #[test]
    fn test_timer_state_resets_after_flush() {
        let mut agg = aggregator("90");
        agg.apply(timer("t", 5.0));

        let (_, num) = agg.render(1000);
        assert_eq!(num, 1);

        let (payload, num) = agg.render(1010);
        assert_eq!(num, 0);
        assert!(payload.is_empty());
        assert!(agg.timers.is_empty());
    }

    #[test]
    fn test_mixed_kinds_render_in_order() {
        let mut agg = aggregator("");
        agg.apply(counter("c", 10.0, 1.0));
        agg.apply(gauge("g", 1.0));
        agg.apply(timer("t", 2.0));

        let (payload, num) = agg.render(1000);
        assert_eq!(num, 3);

        let all = lines(&payload);
        let counter_pos = all.iter().position(|l| l.starts_with("stats.c")).unwrap();
        let gauge_pos = all
            .iter()
            .position(|l| l.starts_with("stats.gauges.g"))
            .unwrap();
        let timer_pos = all
            .iter()
            .position(|l| l.starts_with("stats.timers.t"))
            .unwrap();
        assert!(counter_pos < gauge_pos);
        assert!(gauge_pos < timer_pos);
    }
}
