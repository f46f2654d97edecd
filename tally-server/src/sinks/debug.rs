use std::sync::Mutex;

use async_trait::async_trait;
use tally_metrics::FlushRecord;

use super::MetricSink;

/// A metric sink that logs flushed records at debug level.
///
/// Useful for local development and as the wiring default when no real metric
/// sink is configured. This sink advertises support for per-sink tag
/// exclusion.
#[derive(Default)]
pub struct DebugMetricSink {
    excluded_tags: Mutex<Vec<String>>,
}

impl DebugMetricSink {
    /// Creates a new debug sink.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetricSink for DebugMetricSink {
    fn name(&self) -> &'static str {
        "debug"
    }

    async fn flush_metrics(&self, records: &[FlushRecord]) {
        let excluded = self.excluded_tags.lock().unwrap().clone();

        for record in records {
            let mut record = record.clone();
            if !excluded.is_empty() {
                record.tags.retain(|tag| {
                    let key = tag.split(':').next().unwrap_or(tag);
                    !excluded.iter().any(|e| e == key)
                });
            }

            tally_log::debug!(
                name = %record.name,
                ty = %record.ty,
                value = record.value,
                tags = %record.tags,
                "flushed metric"
            );
        }

        tally_log::debug!(count = records.len(), "flush complete");
    }

    fn set_excluded_tags(&self, tags: Vec<String>) {
        *self.excluded_tags.lock().unwrap() = tags;
    }
}
