//! Routing from listeners into the aggregation pipeline.
//!
//! Metrics are hashed by identity onto one of the metric workers; spans go
//! into the single bounded span channel. Both paths use non-blocking sends
//! with counted fall-through, because datagram traffic cannot be paced.

use std::sync::Arc;

use tally_metrics::{Metric, ParseMetricError};
use tally_statsd::metric;

use crate::spans::{validate_span, Span};
use crate::statsd::ServerCounters;
use crate::workers::{WorkItem, WorkerHandle};

struct RouterInner {
    workers: Vec<WorkerHandle>,
    spans: flume::Sender<Span>,
    metric_max_length: usize,
    trace_max_length: usize,
    extend_tags: Vec<String>,
    exclude_tags: Vec<String>,
}

/// Routes parsed records into workers and the span channel.
#[derive(Clone)]
pub struct Router {
    inner: Arc<RouterInner>,
}

impl Router {
    /// Creates a router delivering to the given workers and span channel.
    pub fn new(
        workers: Vec<WorkerHandle>,
        spans: flume::Sender<Span>,
        metric_max_length: usize,
        trace_max_length: usize,
        extend_tags: Vec<String>,
        tags_exclude: &[String],
    ) -> Self {
        // Only global entries apply at ingest; `key|sink` entries are handed
        // to the named sinks instead.
        let exclude_tags = tags_exclude
            .iter()
            .filter(|entry| !entry.contains('|'))
            .cloned()
            .collect();

        Self {
            inner: Arc::new(RouterInner {
                workers,
                spans,
                metric_max_length,
                trace_max_length,
                extend_tags,
                exclude_tags,
            }),
        }
    }

    /// Routes one parsed metric to its worker shard.
    pub fn route_metric(&self, metric: Metric) {
        if self.dispatch_metric(metric).is_err() {
            metric!(counter(ServerCounters::DroppedMetrics) += 1, cause = "worker_full");
        }
    }

    /// Routes a self-metric without emitting drop counters.
    ///
    /// The recorder counts losses in its own last-resort atomic; emitting a
    /// counter here would recurse through the recorder on a saturated worker.
    pub fn route_self_metric(&self, metric: Metric) -> Result<(), ()> {
        self.dispatch_metric(metric)
    }

    fn dispatch_metric(&self, mut metric: Metric) -> Result<(), ()> {
        let inner = &self.inner;

        if metric.truncate_name(inner.metric_max_length) {
            tally_statsd::metric!(counter(ServerCounters::MetricsTruncated) += 1);
        }

        for tag in &inner.extend_tags {
            metric.tags.insert(tag.clone());
        }

        if !inner.exclude_tags.is_empty() {
            metric.tags.retain(|tag| {
                let key = tag.split(':').next().unwrap_or(tag);
                !inner.exclude_tags.iter().any(|excluded| excluded == key)
            });
        }

        let (key, value, sample_rate, scope) = metric.into_parts();
        let shard = key.shard(inner.workers.len());
        let metric = Metric {
            name: key.name,
            tags: key.tags,
            value,
            sample_rate,
            scope,
        };

        inner.workers[shard]
            .try_ingest(WorkItem::Metric(metric))
            .map_err(|_| ())
    }

    /// Parses and routes every record in a statsd payload.
    pub fn route_statsd(&self, payload: &[u8], listener: &'static str) {
        for result in Metric::parse_all(payload) {
            match result {
                Ok(metric) => {
                    metric!(counter(ServerCounters::MetricsReceived) += 1, listener = listener);
                    self.route_metric(metric);
                }
                Err(error) => self.count_parse_error(error),
            }
        }
    }

    /// Counts a rejected metric line by cause.
    pub fn count_parse_error(&self, error: ParseMetricError) {
        metric!(counter(ServerCounters::ParseErrors) += 1, cause = error.cause());
    }

    /// Validates and routes one span into the span channel.
    pub fn route_span(&self, span: Span, listener: &'static str) {
        if let Err(error) = validate_span(&span, self.inner.trace_max_length) {
            metric!(counter(ServerCounters::InvalidSpans) += 1, cause = error.cause());
            return;
        }

        metric!(counter(ServerCounters::SpansReceived) += 1, listener = listener);

        if self.inner.spans.try_send(span).is_err() {
            metric!(counter(ServerCounters::DroppedSpans) += 1, cause = "channel_full");
        }
    }

    /// The number of metric workers behind this router.
    pub fn num_workers(&self) -> usize {
        self.inner.workers.len()
    }

    /// Returns the worker handles, for snapshotting and imports.
    pub fn workers(&self) -> &[WorkerHandle] {
        &self.inner.workers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::spawn_workers;
    use tally_metrics::AggregateValue;

    fn test_router(num_workers: usize) -> (Router, flume::Receiver<Span>) {
        let (span_tx, span_rx) = flume::bounded(16);
        let router = Router::new(
            spawn_workers(num_workers),
            span_tx,
            4096,
            4096,
            vec![],
            &[],
        );
        (router, span_rx)
    }

    async fn flushed_counter(router: &Router, name: &str) -> Option<f64> {
        let mut merged: Option<f64> = None;
        for worker in router.workers() {
            let snapshot = worker.snapshot().await.unwrap();
            for (key, state) in snapshot {
                if key.name == name {
                    if let AggregateValue::Counter(sum) = state.value {
                        *merged.get_or_insert(0.0) += sum;
                    }
                }
            }
        }
        merged
    }

    #[tokio::test]
    async fn test_same_identity_same_worker() {
        let (router, _spans) = test_router(4);

        for _ in 0..100 {
            router.route_metric(Metric::parse(b"foo:1|c|#a:1").unwrap());
        }

        // All updates landed on a single shard.
        let mut non_empty = 0;
        for worker in router.workers() {
            if !worker.snapshot().await.unwrap().is_empty() {
                non_empty += 1;
            }
        }
        assert_eq!(non_empty, 1);
    }

    #[tokio::test]
    async fn test_single_worker_equals_multi_worker_output() {
        let (single, _s1) = test_router(1);
        let (multi, _s2) = test_router(4);

        for i in 0..32 {
            let line = format!("metric_{}:2|c", i % 8);
            single.route_metric(Metric::parse(line.as_bytes()).unwrap());
            multi.route_metric(Metric::parse(line.as_bytes()).unwrap());
        }

        for i in 0..8 {
            let name = format!("metric_{i}");
            assert_eq!(
                flushed_counter(&single, &name).await,
                flushed_counter(&multi, &name).await,
            );
        }
    }

    #[tokio::test]
    async fn test_extend_tags_applied() {
        let (span_tx, _span_rx) = flume::bounded(1);
        let router = Router::new(
            spawn_workers(1),
            span_tx,
            4096,
            4096,
            vec!["env:prod".to_owned()],
            &[],
        );

        router.route_metric(Metric::parse(b"foo:1|c").unwrap());

        let snapshot = router.workers()[0].snapshot().await.unwrap();
        let (key, _) = snapshot.into_iter().next().unwrap();
        assert_eq!(key.tags.to_string(), "env:prod");
    }

    #[tokio::test]
    async fn test_tags_exclude_global_only() {
        let (span_tx, _span_rx) = flume::bounded(1);
        let router = Router::new(
            spawn_workers(1),
            span_tx,
            4096,
            4096,
            vec![],
            &["secret".to_owned(), "host|hec".to_owned()],
        );

        router.route_metric(Metric::parse(b"foo:1|c|#secret:x,host:h1,keep:y").unwrap());

        let snapshot = router.workers()[0].snapshot().await.unwrap();
        let (key, _) = snapshot.into_iter().next().unwrap();
        // `secret` is stripped globally; `host|hec` only applies to the hec sink.
        assert_eq!(key.tags.to_string(), "host:h1,keep:y");
    }

    #[tokio::test]
    async fn test_span_channel_full_drops() {
        let (span_tx, span_rx) = flume::bounded(1);
        let router = Router::new(spawn_workers(1), span_tx, 4096, 4096, vec![], &[]);

        let span = crate::spans::test_span();
        router.route_span(span.clone(), "test");
        router.route_span(span.clone(), "test"); // dropped, channel full

        assert_eq!(span_rx.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_span_rejected() {
        let (router, span_rx) = test_router(1);

        let mut span = crate::spans::test_span();
        span.id = 0;
        router.route_span(span, "test");

        assert!(span_rx.is_empty());
    }

    #[tokio::test]
    async fn test_name_truncation_before_hash() {
        let (span_tx, _span_rx) = flume::bounded(1);
        let router = Router::new(spawn_workers(4), span_tx, 8, 4096, vec![], &[]);

        // Two over-long names sharing the first 8 bytes collapse onto one
        // aggregate.
        router.route_metric(Metric::parse(b"abcdefgh_one:1|c").unwrap());
        router.route_metric(Metric::parse(b"abcdefgh_two:1|c").unwrap());

        let mut total = 0;
        for worker in router.workers() {
            for (key, state) in worker.snapshot().await.unwrap() {
                assert_eq!(key.name, "abcdefgh");
                if let AggregateValue::Counter(sum) = state.value {
                    total += sum as u64;
                }
            }
        }
        assert_eq!(total, 2);
    }
}
