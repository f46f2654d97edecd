//! Wiring for internal self-metrics.
//!
//! The daemon observes itself through its own pipeline: the recorder installed
//! here converts every [`tally_statsd`] record into a regular metric and
//! routes it like application traffic. To break the potential recursion of a
//! failing pipeline reporting on itself, the recorder only ever performs
//! non-blocking sends and counts losses in a last-resort atomic that the admin
//! surface exposes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tally_config::Config;
use tally_metrics::{Metric, MetricValue, TagSet};
use tally_statsd::{MetricRecord, RecordValue, Recorder};

use crate::router::Router;

/// Prefix for all internally reported metric names.
const SELF_METRIC_PREFIX: &str = "tally.";

/// Converts self-metric records into pipeline metrics.
pub struct PipelineRecorder {
    router: Router,
    config: Arc<Config>,
    lost: Arc<AtomicU64>,
}

impl PipelineRecorder {
    /// Creates the recorder. `lost` is shared with the admin surface.
    pub fn new(router: Router, config: Arc<Config>, lost: Arc<AtomicU64>) -> Self {
        Self {
            router,
            config,
            lost,
        }
    }

    /// Installs this recorder process-wide.
    pub fn install(self) {
        tally_statsd::init(self);
    }
}

impl Recorder for PipelineRecorder {
    fn record(&self, record: MetricRecord) {
        let value = match record.value {
            RecordValue::Counter(v) => MetricValue::Counter(v),
            RecordValue::Gauge(v) => MetricValue::Gauge(v),
            // Timers aggregate as histograms, in milliseconds.
            RecordValue::Timer(d) => MetricValue::Histogram(d.as_secs_f64() * 1e3),
            RecordValue::Histogram(v) => MetricValue::Histogram(v),
            RecordValue::Set(member) => MetricValue::Set(member),
        };

        let scope = self.config.self_metric_scope(value.ty());

        let tags = TagSet::from_tags(
            record
                .tags
                .iter()
                .map(|(key, value)| format!("{key}:{value}")),
        );

        let metric = Metric {
            name: format!("{SELF_METRIC_PREFIX}{}", record.name),
            tags,
            value,
            sample_rate: 1.0,
            scope,
        };

        if self.router.route_self_metric(metric).is_err() {
            self.lost.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spans::Span;
    use crate::workers::spawn_workers;
    use std::time::Duration;
    use tally_metrics::{MetricScope, MetricType};

    fn recorder(config: Config, workers: usize) -> (PipelineRecorder, Router, Arc<AtomicU64>) {
        let (span_tx, _span_rx): (flume::Sender<Span>, _) = flume::bounded(1);
        let router = Router::new(spawn_workers(workers), span_tx, 4096, 4096, vec![], &[]);
        let lost = Arc::new(AtomicU64::new(0));
        let recorder = PipelineRecorder::new(router.clone(), Arc::new(config), lost.clone());
        (recorder, router, lost)
    }

    #[tokio::test]
    async fn test_records_reenter_pipeline() {
        let (recorder, router, lost) = recorder(Config::default(), 1);

        recorder.record(MetricRecord {
            name: "flush.duration",
            value: RecordValue::Timer(Duration::from_millis(5)),
            tags: vec![("worker", "0".to_owned())],
        });

        let snapshot = router.workers()[0].snapshot().await.unwrap();
        let (key, state) = snapshot.into_iter().next().unwrap();

        assert_eq!(key.name, "tally.flush.duration");
        assert_eq!(key.ty, MetricType::Histogram);
        assert_eq!(key.tags.to_string(), "worker:0");
        assert_eq!(state.scope, MetricScope::Global);
        assert_eq!(lost.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_scope_override_applies() {
        let mut config = Config::default();
        config.veneur_metrics_scopes.histogram = Some(MetricScope::Local);

        let (recorder, router, _lost) = recorder(config, 1);

        recorder.record(MetricRecord {
            name: "flush.duration",
            value: RecordValue::Timer(Duration::from_millis(5)),
            tags: vec![],
        });

        let snapshot = router.workers()[0].snapshot().await.unwrap();
        let (_, state) = snapshot.into_iter().next().unwrap();
        assert_eq!(state.scope, MetricScope::Local);
    }
}
