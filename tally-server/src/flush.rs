//! The flush coordinator.
//!
//! Drives the interval clock, orchestrates worker snapshots, partitions the
//! combined snapshot by scope, and hands the results to sinks and the
//! forwarder. A new tick does not begin until the previous snapshot has been
//! handed off; sink work may still run asynchronously inside the sink.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tally_config::Config;
use tally_metrics::forward::ForwardRecord;
use tally_metrics::{reduce, AggregatorSnapshot, FlushRecord, ReduceConfig};
use tally_statsd::metric;
use tally_system::Controller;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::forwarder::Forwarder;
use crate::sinks::{MetricSink, SpanSink};
use crate::statsd::{ServerCounters, ServerGauges, ServerTimers};
use crate::workers::WorkerHandle;

/// Exit code used when the flush watchdog fires.
pub const WATCHDOG_EXIT_CODE: i32 = 3;

/// Counts flush intervals that began while no flush had completed.
///
/// The coordinator resets the counter after every completed flush; a separate
/// monitor task increments it every interval. If the counter climbs past the
/// configured limit, the flush pipeline is stuck and the process terminates
/// non-zero, preferring a restart over silent data loss.
#[derive(Clone)]
pub struct Watchdog {
    missed: Arc<AtomicU32>,
    limit: u32,
}

impl Watchdog {
    /// Creates a watchdog; a `limit` of zero disables it.
    pub fn new(limit: u32) -> Self {
        Self {
            missed: Arc::new(AtomicU32::new(0)),
            limit,
        }
    }

    /// Spawns the monitor task. Returns `None` when disabled.
    pub fn spawn(&self, interval: Duration) -> Option<JoinHandle<()>> {
        if self.limit == 0 {
            return None;
        }

        let watchdog = self.clone();
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let missed = watchdog.missed.fetch_add(1, Ordering::Relaxed) + 1;
                if missed > watchdog.limit {
                    tally_log::error!(
                        missed = missed,
                        "flush watchdog expired, terminating"
                    );
                    std::process::exit(WATCHDOG_EXIT_CODE);
                }
            }
        }))
    }

    fn reset(&self) {
        self.missed.store(0, Ordering::Relaxed);
    }
}

/// Orchestrates periodic flushes of the aggregation pipeline.
pub struct FlushCoordinator {
    config: Arc<Config>,
    workers: Vec<WorkerHandle>,
    metric_sinks: Vec<Arc<dyn MetricSink>>,
    span_sinks: Vec<Arc<dyn SpanSink>>,
    forwarder: Option<Forwarder>,
    watchdog: Watchdog,
    reduce_config: ReduceConfig,
}

impl FlushCoordinator {
    /// Creates a coordinator over the given workers and sinks.
    pub fn new(
        config: Arc<Config>,
        workers: Vec<WorkerHandle>,
        metric_sinks: Vec<Arc<dyn MetricSink>>,
        span_sinks: Vec<Arc<dyn SpanSink>>,
        forwarder: Option<Forwarder>,
    ) -> Self {
        let watchdog = Watchdog::new(config.flush_watchdog_missed_flushes);
        let reduce_config = config.reduce_config();
        Self {
            config,
            workers,
            metric_sinks,
            span_sinks,
            forwarder,
            watchdog,
            reduce_config,
        }
    }

    /// Spawns the coordinator loop and the watchdog monitor.
    ///
    /// The loop runs until shutdown. With `flush_on_shutdown` set, one final
    /// flush completes before the task finishes; sinks are stopped afterwards
    /// in both cases.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let interval = self.config.interval();
        let watchdog_task = self.watchdog.spawn(interval);

        let start = tokio::time::Instant::now() + first_tick_delay(&self.config);
        let mut ticker = tokio::time::interval_at(start, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut shutdown = Controller::shutdown_handle();

        loop {
            tokio::select! {
                biased;

                _ = shutdown.notified() => {
                    if self.config.flush_on_shutdown {
                        tally_log::info!("performing final flush before shutdown");
                        self.flush().await;
                    }
                    break;
                }

                _ = ticker.tick() => {
                    self.flush().await;
                }
            }
        }

        // The watchdog must not outlive the flush loop it monitors.
        if let Some(task) = watchdog_task {
            task.abort();
        }

        for sink in &self.span_sinks {
            sink.stop().await;
        }
        for sink in &self.metric_sinks {
            sink.stop().await;
        }
    }

    /// Performs one complete flush cycle.
    pub async fn flush(&self) {
        metric!(timer(ServerTimers::FlushDuration), {
            self.flush_inner().await;
        });

        self.watchdog.reset();
    }

    async fn flush_inner(&self) {
        // Snapshot phase: every worker swaps its live map. Waiting for all
        // snapshots up front gives the atomicity guarantee; reduction below
        // happens on already-detached state.
        let mut combined = AggregatorSnapshot::default();
        for worker in &self.workers {
            if let Some(snapshot) = worker.snapshot().await {
                combined.merge(snapshot);
            }
        }

        metric!(gauge(ServerGauges::FlushAggregates) = combined.len() as f64);

        let is_local = self.config.is_local_node();
        let forward_only = self.config.forward_only;

        let mut forward_records: Vec<ForwardRecord> = Vec::new();
        let mut flush_records: Vec<FlushRecord> = Vec::new();

        for (key, state) in combined {
            let forwarded = is_local && (state.scope.is_forwarded() || forward_only);
            let reduced = if is_local {
                !forward_only && state.scope.is_reduced_locally()
            } else {
                true
            };

            if reduced {
                flush_records.extend(reduce(&key, &state.value, &self.reduce_config));
            }

            if forwarded {
                forward_records.push(ForwardRecord::new(key, state));
            }
        }

        if !forward_records.is_empty() {
            if let Some(forwarder) = &self.forwarder {
                metric!(timer(ServerTimers::ForwardDuration), {
                    forwarder.forward(forward_records).await;
                });
            }
        }

        if !flush_records.is_empty() {
            metric!(
                counter(ServerCounters::RecordsFlushed) += flush_records.len() as u64
            );

            for sink in &self.metric_sinks {
                sink.flush_metrics(&flush_records).await;
            }
        }

        for sink in &self.span_sinks {
            sink.flush().await;
        }
    }
}

/// Delay until the first tick.
///
/// With `synchronize_with_interval`, the first tick aligns to the next
/// wall-clock boundary divisible by the interval; ticks free-run afterwards.
fn first_tick_delay(config: &Config) -> Duration {
    let interval = config.interval();

    if !config.synchronize_with_interval {
        return interval;
    }

    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default();

    let remainder = now.as_millis() as u64 % interval.as_millis().max(1) as u64;
    if remainder == 0 {
        Duration::ZERO
    } else {
        Duration::from_millis(interval.as_millis() as u64 - remainder)
    }
}
