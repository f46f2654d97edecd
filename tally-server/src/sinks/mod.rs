//! The sink contract and reference sinks.
//!
//! Sinks are the downstream boundary of the daemon. Metric sinks receive the
//! reduced records of every flush; span sinks receive individual spans on the
//! hot path and a flush boundary marker per tick.
//!
//! Contract: `ingest` must be safe for concurrent callers; `flush` is called
//! from exactly one thread of control per tick; after `stop`, no further calls
//! are made. Sinks surface errors only through metrics and logs — callers do
//! not see them.

use async_trait::async_trait;
use thiserror::Error;

use tally_metrics::FlushRecord;

use crate::spans::Span;

mod debug;
mod hec;

pub use self::debug::DebugMetricSink;
pub use self::hec::{HecSpanSink, SerializedSpan};

/// An error starting a sink. Startup errors are fatal; everything after
/// startup is counted and logged instead.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink configuration is unusable.
    #[error("invalid sink configuration: {0}")]
    InvalidConfig(String),

    /// The sink's HTTP client could not be constructed.
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// A sink receiving reduced metric records once per flush interval.
#[async_trait]
pub trait MetricSink: Send + Sync {
    /// Stable identifier used for per-sink tag exclusion and metrics.
    fn name(&self) -> &'static str;

    /// Acquires resources; may spawn submission workers.
    async fn start(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Receives the reduced records of one flush interval.
    async fn flush_metrics(&self, records: &[FlushRecord]);

    /// Stops the sink; no further calls are made afterwards.
    async fn stop(&self) {}

    /// Advertises support for per-sink tag exclusion.
    ///
    /// Sinks that do not override this method silently ignore per-sink
    /// `tags_exclude` entries.
    fn set_excluded_tags(&self, _tags: Vec<String>) {}
}

/// A sink receiving spans on the hot path.
#[async_trait]
pub trait SpanSink: Send + Sync {
    /// Stable identifier used for per-sink tag exclusion and metrics.
    fn name(&self) -> &'static str;

    /// Acquires resources; may spawn submission workers.
    async fn start(&self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Receives one validated span. Safe for concurrent callers.
    async fn ingest(&self, span: &Span);

    /// Flush boundary: buffered data should be sent or scheduled for send.
    async fn flush(&self);

    /// Stops the sink; no further calls are made afterwards.
    async fn stop(&self) {}

    /// Advertises support for per-sink tag exclusion.
    fn set_excluded_tags(&self, _tags: Vec<String>) {}
}

/// Extracts the `tags_exclude` entries addressed to one sink.
///
/// Entries are either global (`key`) or per-sink (`key|sink-name`); only the
/// latter are returned here, with the sink part stripped.
pub fn excluded_tags_for_sink(tags_exclude: &[String], sink: &str) -> Vec<String> {
    tags_exclude
        .iter()
        .filter_map(|entry| {
            let (key, target) = entry.split_once('|')?;
            (target == sink).then(|| key.to_owned())
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_excluded_tags_for_sink() {
        let entries = vec![
            "global".to_owned(),
            "host|hec".to_owned(),
            "env|debug".to_owned(),
        ];

        assert_eq!(excluded_tags_for_sink(&entries, "hec"), vec!["host"]);
        assert_eq!(excluded_tags_for_sink(&entries, "debug"), vec!["env"]);
        assert!(excluded_tags_for_sink(&entries, "other").is_empty());
    }
}
