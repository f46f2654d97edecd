//! Metric workers: the unit of aggregation parallelism.
//!
//! Each worker owns one [`Aggregator`] shard, selected by the stable hash of a
//! metric's identity. The worker applies updates serially, which makes
//! last-write-wins aggregates well defined, and hands off its state through an
//! atomic map swap when the flush coordinator requests a snapshot. Ingestion is
//! never blocked by a flush in progress.

use tally_metrics::{AggregateState, Aggregator, AggregatorSnapshot, Metric, MetricKey};
use tokio::sync::{mpsc, oneshot};

/// Capacity of a worker's bounded input channel.
///
/// When the channel is full, samples are dropped and counted; backpressure is
/// never applied upstream because UDP cannot be paced.
pub const WORKER_CHANNEL_CAPACITY: usize = 4096;

/// One unit of work for a metric worker.
#[derive(Debug)]
pub enum WorkItem {
    /// Apply a single parsed sample.
    Metric(Metric),
    /// Merge a pre-reduction aggregate received from a local node.
    Merge(MetricKey, AggregateState),
}

struct SnapshotRequest(oneshot::Sender<AggregatorSnapshot>);

/// The sending side of one metric worker.
#[derive(Clone)]
pub struct WorkerHandle {
    items: mpsc::Sender<WorkItem>,
    control: mpsc::UnboundedSender<SnapshotRequest>,
}

impl WorkerHandle {
    /// Enqueues a work item without blocking.
    ///
    /// Returns `Err` with the item when the worker's channel is full or the
    /// worker has stopped; the caller counts the drop.
    pub fn try_ingest(&self, item: WorkItem) -> Result<(), WorkItem> {
        self.items.try_send(item).map_err(|error| error.into_inner())
    }

    /// Requests an atomic snapshot of the worker's aggregation state.
    ///
    /// The worker first drains every item already queued ahead of the request,
    /// so all samples whose handoff completed before this call contribute to
    /// the returned snapshot. Returns `None` if the worker has stopped.
    pub async fn snapshot(&self) -> Option<AggregatorSnapshot> {
        let (tx, rx) = oneshot::channel();
        self.control.send(SnapshotRequest(tx)).ok()?;
        rx.await.ok()
    }
}

/// Spawns `count` metric workers and returns their handles.
///
/// Workers stop when every clone of their handle is dropped.
pub fn spawn_workers(count: usize) -> Vec<WorkerHandle> {
    (0..count)
        .map(|index| {
            let (items_tx, items_rx) = mpsc::channel(WORKER_CHANNEL_CAPACITY);
            let (control_tx, control_rx) = mpsc::unbounded_channel();

            tokio::spawn(run_worker(index, items_rx, control_rx));

            WorkerHandle {
                items: items_tx,
                control: control_tx,
            }
        })
        .collect()
}

async fn run_worker(
    index: usize,
    mut items: mpsc::Receiver<WorkItem>,
    mut control: mpsc::UnboundedReceiver<SnapshotRequest>,
) {
    let mut aggregator = Aggregator::new();

    loop {
        tokio::select! {
            biased;

            Some(SnapshotRequest(reply)) = control.recv() => {
                // Apply everything that was queued ahead of the snapshot
                // request, then swap the live map.
                while let Ok(item) = items.try_recv() {
                    apply(&mut aggregator, item);
                }
                reply.send(aggregator.take()).ok();
            }

            item = items.recv() => match item {
                Some(item) => apply(&mut aggregator, item),
                None => break,
            },
        }
    }

    if !aggregator.is_empty() {
        tally_log::debug!(
            worker = index,
            aggregates = aggregator.len(),
            "metric worker dropping final aggregates"
        );
    }
}

fn apply(aggregator: &mut Aggregator, item: WorkItem) {
    let applied = match item {
        WorkItem::Metric(metric) => aggregator.insert_metric(metric),
        WorkItem::Merge(key, state) => aggregator.merge(key, state),
    };

    if !applied {
        tally_log::debug!("discarded sample with conflicting aggregate type");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_metrics::AggregateValue;

    fn metric(line: &str) -> Metric {
        Metric::parse(line.as_bytes()).unwrap()
    }

    #[tokio::test]
    async fn test_worker_applies_and_snapshots() {
        let workers = spawn_workers(1);
        let worker = &workers[0];

        worker.try_ingest(WorkItem::Metric(metric("foo:1|c"))).unwrap();
        worker.try_ingest(WorkItem::Metric(metric("foo:2|c"))).unwrap();

        let snapshot = worker.snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 1);

        let (_, state) = snapshot.into_iter().next().unwrap();
        assert_eq!(state.value, AggregateValue::Counter(3.0));
    }

    #[tokio::test]
    async fn test_snapshot_drains_queued_items_first() {
        let workers = spawn_workers(1);
        let worker = &workers[0];

        // Enqueue without yielding so the worker task has not run yet; the
        // snapshot must still include these samples.
        for _ in 0..10 {
            worker.try_ingest(WorkItem::Metric(metric("foo:1|c"))).unwrap();
        }

        let snapshot = worker.snapshot().await.unwrap();
        let (_, state) = snapshot.into_iter().next().unwrap();
        assert_eq!(state.value, AggregateValue::Counter(10.0));
    }

    #[tokio::test]
    async fn test_consecutive_snapshots_are_disjoint() {
        let workers = spawn_workers(1);
        let worker = &workers[0];

        worker.try_ingest(WorkItem::Metric(metric("foo:1|c"))).unwrap();
        assert_eq!(worker.snapshot().await.unwrap().len(), 1);

        // No ingest in between: the next snapshot is empty.
        assert!(worker.snapshot().await.unwrap().is_empty());

        worker.try_ingest(WorkItem::Metric(metric("foo:5|c"))).unwrap();
        let snapshot = worker.snapshot().await.unwrap();
        let (_, state) = snapshot.into_iter().next().unwrap();
        assert_eq!(state.value, AggregateValue::Counter(5.0));
    }
}
