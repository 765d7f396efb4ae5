/// Metric kind carried on the wire.
///
/// Maps one-to-one onto the protocol type tags: `c`, `g`, `ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Timer,
}

impl MetricKind {
    /// Parses a protocol type tag, returning `None` for unknown tags.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "c" => Some(MetricKind::Counter),
            "g" => Some(MetricKind::Gauge),
            "ms" => Some(MetricKind::Timer),
            _ => None,
        }
    }

    /// Returns the wire tag for this kind.
    pub fn as_tag(&self) -> &'static str {
        match self {
            MetricKind::Counter => "c",
            MetricKind::Gauge => "g",
            MetricKind::Timer => "ms",
        }
    }
}

/// A single measurement decoded from one input line.
///
/// Events are value-typed and short-lived: the ingester hands them to the
/// aggregator channel and drops them.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Metric name, used as the aggregation map key.
    pub bucket: String,
    /// Measured value.
    pub value: f64,
    /// Counter, gauge or timer.
    pub kind: MetricKind,
    /// Client-side sample rate in (0, 1]. 1.0 when absent on the wire.
    pub sampling: f64,
}

impl Event {
    /// Estimated number of source-side measurements this event stands for.
    pub fn submitted_estimate(&self) -> i64 {
        (1.0 / self.sampling).round() as i64
    }
}
