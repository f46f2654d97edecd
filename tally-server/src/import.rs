//! The global-node side of forwarding.
//!
//! Local nodes POST their pre-reduction aggregates to `/import` (or call the
//! gRPC `Import` RPC). Records are routed by identity onto the same worker
//! shards as directly ingested samples, so imported and direct traffic merge
//! into one view.

use tally_metrics::forward::{decode_payload, ForwardDecodeError};
use tally_statsd::metric;

use crate::router::Router;
use crate::statsd::ServerCounters;
use crate::workers::WorkItem;

/// Merges forwarded payloads into the local workers.
#[derive(Clone)]
pub struct Importer {
    router: Router,
}

impl Importer {
    /// Creates an importer over the given router's workers.
    pub fn new(router: Router) -> Self {
        Self { router }
    }

    /// Decodes one payload and merges its records.
    ///
    /// Returns the number of merged records. Unknown payload versions are
    /// rejected and counted; the sender's interval is lost, which mixed
    /// version fleets degrade to by design.
    pub fn import(&self, payload: &[u8]) -> Result<usize, ForwardDecodeError> {
        let records = decode_payload(payload).map_err(|error| {
            if matches!(error, ForwardDecodeError::VersionMismatch(_)) {
                metric!(counter(ServerCounters::ForwardVersionMismatch) += 1);
            }
            error
        })?;

        let mut merged = 0usize;

        for record in records {
            let (key, state) = record.into_parts();
            let shard = key.shard(self.router.num_workers());

            if self.router.workers()[shard]
                .try_ingest(WorkItem::Merge(key, state))
                .is_ok()
            {
                merged += 1;
            } else {
                metric!(
                    counter(ServerCounters::DroppedMetrics) += 1,
                    cause = "worker_full",
                );
            }
        }

        metric!(counter(ServerCounters::ImportRecordsMerged) += merged as u64);

        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spans::Span;
    use crate::workers::spawn_workers;
    use tally_metrics::forward::{encode_payload, ForwardRecord};
    use tally_metrics::{AggregateState, AggregateValue, Metric};

    fn test_router() -> Router {
        let (span_tx, _span_rx): (flume::Sender<Span>, _) = flume::bounded(1);
        Router::new(spawn_workers(2), span_tx, 4096, 4096, vec![], &[])
    }

    fn record(line: &str) -> ForwardRecord {
        let (key, value, rate, scope) = Metric::parse(line.as_bytes()).unwrap().into_parts();
        ForwardRecord::new(
            key,
            AggregateState {
                scope,
                value: AggregateValue::from_sample(value, rate),
            },
        )
    }

    #[tokio::test]
    async fn test_import_merges_into_workers() {
        let router = test_router();
        let importer = Importer::new(router.clone());

        let payload = encode_payload(&[record("users:a|s"), record("users:b|s")]);
        assert_eq!(importer.import(&payload).unwrap(), 2);

        let mut total_sets = 0;
        for worker in router.workers() {
            for (_, state) in worker.snapshot().await.unwrap() {
                if let AggregateValue::Set(set) = state.value {
                    total_sets += set.count();
                }
            }
        }
        assert_eq!(total_sets, 2);
    }

    #[tokio::test]
    async fn test_import_rejects_unknown_version() {
        let importer = Importer::new(test_router());

        let mut payload = encode_payload(&[record("foo:1|c")]);
        payload[0] = 42;

        assert!(matches!(
            importer.import(&payload),
            Err(ForwardDecodeError::VersionMismatch(42))
        ));
    }

    #[tokio::test]
    async fn test_import_routes_by_identity() {
        // The same identity imported twice lands on the same worker and
        // merges into one aggregate.
        let router = test_router();
        let importer = Importer::new(router.clone());

        importer
            .import(&encode_payload(&[record("foo:1|c")]))
            .unwrap();
        importer
            .import(&encode_payload(&[record("foo:2|c")]))
            .unwrap();

        let mut aggregates = Vec::new();
        for worker in router.workers() {
            aggregates.extend(worker.snapshot().await.unwrap());
        }

        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].1.value, AggregateValue::Counter(3.0));
    }
}
