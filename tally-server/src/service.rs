//! Service wiring: brings up the whole daemon and tears it down cleanly.

use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use tally_config::Config;
use tally_statsd::metric;
use tally_system::Controller;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::endpoints::{self, AdminState};
use crate::flush::FlushCoordinator;
use crate::forwarder::{Forwarder, ForwarderError};
use crate::import::Importer;
use crate::listeners::{self, ListenerError};
use crate::router::Router;
use crate::self_metrics::PipelineRecorder;
use crate::sinks::{excluded_tags_for_sink, DebugMetricSink, HecSpanSink, MetricSink, SinkError, SpanSink};
use crate::spans::Span;
use crate::statsd::ServerCounters;
use crate::workers::spawn_workers;

/// A fatal error bringing up the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// A listener failed to construct.
    #[error(transparent)]
    Listener(#[from] ListenerError),

    /// A sink failed to start.
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// The forwarder failed to construct.
    #[error(transparent)]
    Forwarder(#[from] ForwarderError),

    /// The admin surface failed to bind.
    #[error("could not bind admin surface: {0}")]
    AdminBind(#[source] std::io::Error),
}

/// The running daemon.
pub struct ServiceState {
    config: Arc<Config>,
    router: Router,
    cancel: CancellationToken,
    coordinator: JoinHandle<()>,
    listener_tasks: Vec<JoinHandle<()>>,
    span_worker_tasks: Vec<JoinHandle<()>>,
    admin_task: JoinHandle<()>,
    admin_addr: std::net::SocketAddr,
}

impl ServiceState {
    /// Starts all services and returns the running state.
    pub async fn start(config: Arc<Config>) -> Result<Self, ServerError> {
        metric!(counter(ServerCounters::ServerStarting) += 1);

        // Aggregation plane.
        let workers = spawn_workers(config.num_workers);
        let (span_tx, span_rx) = flume::bounded::<Span>(config.span_channel_capacity);

        let router = Router::new(
            workers.clone(),
            span_tx,
            config.metric_max_length,
            config.trace_max_length_bytes,
            config.extend_tags.clone(),
            &config.tags_exclude,
        );

        // Self-metrics re-enter through the router; losses land in this
        // last-resort counter.
        let self_metrics_lost = Arc::new(AtomicU64::new(0));
        PipelineRecorder::new(router.clone(), config.clone(), self_metrics_lost.clone())
            .install();

        // Sinks.
        let mut metric_sinks: Vec<Arc<dyn MetricSink>> = Vec::new();
        let debug_sink = Arc::new(DebugMetricSink::new());
        debug_sink.set_excluded_tags(excluded_tags_for_sink(
            &config.tags_exclude,
            debug_sink.name(),
        ));
        metric_sinks.push(debug_sink);

        let mut span_sinks: Vec<Arc<dyn SpanSink>> = Vec::new();
        if let Some(hec_config) = &config.hec {
            let sink = Arc::new(HecSpanSink::new(hec_config, config.hostname.clone())?);
            span_sinks.push(sink);
        }

        for sink in &metric_sinks {
            sink.start().await?;
        }
        for sink in &span_sinks {
            sink.start().await?;
        }

        let span_worker_tasks =
            spawn_span_workers(config.num_span_workers, span_rx, span_sinks.clone());

        // Forwarding and flushing.
        let forwarder = match &config.forward_address {
            Some(address) => Some(Forwarder::new(address, config.forward_timeout())?),
            None => None,
        };

        let coordinator = FlushCoordinator::new(
            config.clone(),
            workers,
            metric_sinks,
            span_sinks,
            forwarder,
        )
        .spawn();

        // Ingestion plane.
        let cancel = CancellationToken::new();
        let importer = Importer::new(router.clone());

        let listener_tasks =
            listeners::spawn_listeners(&config, router.clone(), importer.clone(), cancel.clone())?;

        let (admin_addr, admin_task) = endpoints::serve(
            &config.http_address,
            AdminState {
                importer,
                self_metrics_lost,
                http_quit: config.http_quit,
                shutdown_timeout: config.shutdown_timeout(),
            },
        )
        .await
        .map_err(ServerError::AdminBind)?;

        Ok(Self {
            config,
            router,
            cancel,
            coordinator,
            listener_tasks,
            span_worker_tasks,
            admin_task,
            admin_addr,
        })
    }

    /// The router feeding this daemon, for in-process submission.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// The bound address of the admin surface.
    pub fn admin_addr(&self) -> std::net::SocketAddr {
        self.admin_addr
    }

    /// Waits for shutdown, then tears the pipeline down in order.
    ///
    /// The flush coordinator finishes first (performing the final flush when
    /// `flush_on_shutdown` is set and stopping the sinks), then listeners and
    /// span workers are cancelled.
    pub async fn run(self) {
        let mut shutdown = Controller::shutdown_handle();
        let shutdown = shutdown.notified().await;

        let grace = shutdown
            .timeout
            .unwrap_or(std::time::Duration::from_secs(0));

        // The coordinator observes the same shutdown broadcast; give it the
        // grace period to finish the final flush and stop the sinks.
        if tokio::time::timeout(grace.max(self.config.interval()), self.coordinator)
            .await
            .is_err()
        {
            tally_log::warn!("flush coordinator did not finish within the shutdown grace");
        }

        self.cancel.cancel();

        for task in self.listener_tasks {
            task.abort();
        }
        for task in self.span_worker_tasks {
            task.abort();
        }
        self.admin_task.abort();

        tally_log::info!("shutdown complete");
    }
}

/// Spawns the span workers draining the shared bounded span channel.
fn spawn_span_workers(
    count: usize,
    spans: flume::Receiver<Span>,
    sinks: Vec<Arc<dyn SpanSink>>,
) -> Vec<JoinHandle<()>> {
    (0..count.max(1))
        .map(|_| {
            let spans = spans.clone();
            let sinks = sinks.clone();

            tokio::spawn(async move {
                while let Ok(span) = spans.recv_async().await {
                    for sink in &sinks {
                        sink.ingest(&span).await;
                    }
                }
            })
        })
        .collect()
}

/// Runs the daemon to completion.
pub async fn run(config: Config) -> Result<(), ServerError> {
    let state = ServiceState::start(Arc::new(config)).await?;
    state.run().await;
    Ok(())
}
