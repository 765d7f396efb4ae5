//! Line parsing for raw UDP payloads.
//!
//! Decodes one datagram (possibly multi-line) into typed [`Event`] values.
//! Bad input never aborts the parser: malformed lines are dropped with a
//! debug log, lines whose numeric value fails to parse are dropped with an
//! error log, and everything else in the datagram is still processed.

use thiserror::Error;
use tracing::{debug, error};

use super::event::{Event, MetricKind};

/// Errors that can occur while parsing a single input line.
#[derive(Error, Debug, PartialEq)]
pub enum LineError {
    #[error("malformed line: {0}")]
    Malformed(&'static str),

    #[error("bad value {value:?}")]
    Value { value: String },
}

/// Parse one UDP payload into the events it carries.
///
/// Lines are `\n`-separated; empty lines are skipped. Rejected lines are
/// logged and dropped, so the result may be empty.
pub fn parse_datagram(data: &[u8]) -> Vec<Event> {
    let text = match std::str::from_utf8(data) {
        Ok(text) => text,
        Err(_) => {
            debug!("dropping non-utf8 datagram");
            return Vec::new();
        }
    };

    let mut events = Vec::new();
    for line in text.split('\n') {
        if line.is_empty() {
            continue;
        }
        match parse_line(line) {
            Ok(event) => events.push(event),
            Err(LineError::Value { .. }) => {
                error!(line, "failed to parse value");
            }
            Err(err) => {
                debug!(line, %err, "invalid line");
            }
        }
    }
    events
}

/// Parse one `bucket:value|kind[|@sampling]` line.
fn parse_line(line: &str) -> Result<Event, LineError> {
    let (bucket, rest) = line
        .split_once(':')
        .ok_or(LineError::Malformed("missing ':' separator"))?;

    if bucket.is_empty() {
        return Err(LineError::Malformed("empty bucket"));
    }
    if rest.contains(':') {
        return Err(LineError::Malformed("second ':' in line"));
    }

    let mut parts = rest.splitn(3, '|');
    let raw_value = parts.next().unwrap_or_default();
    let tag = parts
        .next()
        .ok_or(LineError::Malformed("missing '|' separator"))?;

    let kind =
        MetricKind::from_tag(tag).ok_or(LineError::Malformed("unknown metric type"))?;

    let sampling = match parts.next() {
        Some(tail) => {
            let raw = tail
                .strip_prefix('@')
                .ok_or(LineError::Malformed("sampling tail must start with '@'"))?;
            let sampling: f64 = raw
                .parse()
                .map_err(|_| LineError::Malformed("unparseable sample rate"))?;
            if !(sampling > 0.0 && sampling <= 1.0) {
                return Err(LineError::Malformed("sample rate outside (0, 1]"));
            }
            sampling
        }
        None => 1.0,
    };

    let value: f64 = raw_value.parse().map_err(|_| LineError::Value {
        value: raw_value.to_string(),
    })?;
    if !value.is_finite() {
        return Err(LineError::Value {
            value: raw_value.to_string(),
        });
    }

    Ok(Event {
        bucket: bucket.to_string(),
        value,
        kind,
        sampling,
    })
}
