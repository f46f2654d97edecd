//! The batched HEC span sink.
//!
//! Spans are serialized into HEC events and handed to a pool of submission
//! workers over a rendezvous channel. Each submitter encodes events into the
//! chunked body of a lazily opened HTTP request while a helper task drives the
//! request's response concurrently, so `sync` and `stop` can force batch
//! boundaries without interrupting an in-flight encode. The event body is a
//! concatenated stream of JSON objects, one per event, with no outer array.

use std::convert::Infallible;
use std::net::ToSocketAddrs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tally_config::HecConfig;
use tally_statsd::metric;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

use super::{SinkError, SpanSink};
use crate::spans::Span;
use crate::statsd::{ServerCounters, ServerHistograms};

/// Backoff after a failed request construction before releasing the batch.
const CONSTRUCTION_RETRY_DELAY: Duration = Duration::from_secs(1);

/// In-flight chunks buffered between the encoder and the request driver.
const BODY_CHANNEL_CAPACITY: usize = 32;

/// A span in the field layout HEC consumers can handle.
///
/// Ids are re-encoded as decimal strings: the collector cannot represent
/// 64-bit integers without float rounding. Timestamps split into a
/// second-resolution float and a nanosecond integer duration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SerializedSpan {
    /// The trace id as a decimal string.
    pub trace_id: String,
    /// The span id as a decimal string.
    pub id: String,
    /// The parent span id as a decimal string.
    pub parent_id: String,
    /// The span start in fractional epoch seconds.
    pub start_timestamp: f64,
    /// The span end in fractional epoch seconds.
    pub end_timestamp: f64,
    /// The span duration in nanoseconds.
    pub duration_ns: i64,
    /// Whether the span describes a failed operation.
    pub error: bool,
    /// The emitting service.
    pub service: String,
    /// Free-form tags.
    pub tags: std::collections::BTreeMap<String, String>,
    /// Whether the span is an indicator span.
    pub indicator: bool,
    /// The operation name.
    pub name: String,
}

impl SerializedSpan {
    fn new(span: &Span) -> Self {
        const NANOS: f64 = 1e9;

        Self {
            trace_id: span.trace_id.to_string(),
            id: span.id.to_string(),
            parent_id: span.parent_id.to_string(),
            start_timestamp: span.start_timestamp as f64 / NANOS,
            end_timestamp: span.end_timestamp as f64 / NANOS,
            duration_ns: span.duration_ns(),
            error: span.error,
            service: span.service.clone(),
            tags: span.tags.clone(),
            indicator: span.indicator,
            name: span.name.clone(),
        }
    }
}

/// The envelope posted for every span.
#[derive(Debug, Serialize)]
struct HecEvent {
    time: f64,
    host: String,
    sourcetype: String,
    event: SerializedSpan,
}

impl HecEvent {
    fn new(span: &Span, hostname: &str) -> Self {
        let event = SerializedSpan::new(span);
        Self {
            time: event.start_timestamp,
            host: hostname.to_owned(),
            sourcetype: span.service.clone(),
            event,
        }
    }
}

/// The error body returned by the collector for unexpected statuses.
#[derive(Debug, Deserialize)]
struct HecResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    code: i64,
    #[serde(rename = "invalid-event-number", default)]
    invalid_event_number: Option<i64>,
}

struct HecInner {
    client: reqwest::Client,
    endpoint: reqwest::Url,
    token: String,
    hostname: String,
    batch_size: usize,
    workers: usize,
    send_timeout: Option<Duration>,
    ingest_timeout: Option<Duration>,
    sample_rate: i64,

    ingest_tx: flume::Sender<HecEvent>,
    ingest_rx: flume::Receiver<HecEvent>,

    sync_txs: Mutex<Vec<mpsc::UnboundedSender<oneshot::Sender<()>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,

    ingested: AtomicU64,
    dropped: AtomicU64,
    skipped: AtomicU64,
}

/// The batched HEC span sink.
pub struct HecSpanSink {
    inner: Arc<HecInner>,
}

impl HecSpanSink {
    /// Builds the sink from its configuration.
    ///
    /// For any given trace id, the probability that all spans of the trace are
    /// submitted is `1/span_sample_rate`; sampling is performed on the trace
    /// id so a trace is always kept or dropped whole. Indicator spans bypass
    /// sampling.
    pub fn new(config: &HecConfig, hostname: String) -> Result<Self, SinkError> {
        let sample_rate = config.span_sample_rate.max(1);

        let endpoint = format!(
            "{}/services/collector",
            config.address.trim_end_matches('/')
        );
        let endpoint = reqwest::Url::parse(&endpoint)
            .map_err(|e| SinkError::InvalidConfig(format!("hec.address: {e}")))?;

        let workers = config.submission_workers.max(1);

        // Keep an idle connection in reserve for every submitter.
        let mut builder = reqwest::Client::builder().pool_max_idle_per_host(workers);

        // Validate a different hostname than the one on the endpoint URL:
        // connect to the resolved original address while the URL carries the
        // overridden name for SNI and certificate checks.
        let endpoint = match &config.validate_hostname {
            Some(hostname_override) => {
                let port = endpoint.port_or_known_default().unwrap_or(443);
                let host = endpoint
                    .host_str()
                    .ok_or_else(|| SinkError::InvalidConfig("hec.address has no host".into()))?;
                let addr = (host, port)
                    .to_socket_addrs()
                    .map_err(|e| SinkError::InvalidConfig(format!("hec.address: {e}")))?
                    .next()
                    .ok_or_else(|| {
                        SinkError::InvalidConfig("hec.address did not resolve".into())
                    })?;

                builder = builder.resolve(hostname_override, addr);

                let mut endpoint = endpoint;
                endpoint
                    .set_host(Some(hostname_override))
                    .map_err(|e| SinkError::InvalidConfig(format!("hec.validate_hostname: {e}")))?;
                endpoint
            }
            None => endpoint,
        };

        let client = builder.build()?;

        let (ingest_tx, ingest_rx) = flume::bounded(0);

        Ok(Self {
            inner: Arc::new(HecInner {
                client,
                endpoint,
                token: config.token.clone(),
                hostname,
                batch_size: config.batch_size.max(1),
                workers,
                send_timeout: (config.send_timeout_ms > 0)
                    .then(|| Duration::from_millis(config.send_timeout_ms)),
                ingest_timeout: (config.ingest_timeout_ms > 0)
                    .then(|| Duration::from_millis(config.ingest_timeout_ms)),
                sample_rate,
                ingest_tx,
                ingest_rx,
                sync_txs: Mutex::new(Vec::new()),
                tasks: Mutex::new(Vec::new()),
                ingested: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                skipped: AtomicU64::new(0),
            }),
        })
    }

    /// Instructs all submitters to finish their current request and start a
    /// new one, returning when every submitter has acknowledged.
    ///
    /// After `sync` returns, every span ingested before the call has been
    /// written to some outgoing request body. When racing `stop`, stop wins:
    /// submitters that already exited are skipped and no delivery guarantee is
    /// made for spans ingested after the stop began.
    pub async fn sync(&self) {
        let acks: Vec<_> = {
            let sync_txs = self.inner.sync_txs.lock().unwrap();
            sync_txs
                .iter()
                .filter_map(|tx| {
                    let (ack_tx, ack_rx) = oneshot::channel();
                    tx.send(ack_tx).ok().map(|()| ack_rx)
                })
                .collect()
        };

        for ack in acks {
            ack.await.ok();
        }
    }

    /// The interval counters `(ingested, dropped, skipped)`.
    ///
    /// Zeroed by [`flush`](SpanSink::flush). Exposed for tests.
    pub fn interval_counters(&self) -> (u64, u64, u64) {
        (
            self.inner.ingested.load(Ordering::Relaxed),
            self.inner.dropped.load(Ordering::Relaxed),
            self.inner.skipped.load(Ordering::Relaxed),
        )
    }
}

#[async_trait]
impl SpanSink for HecSpanSink {
    fn name(&self) -> &'static str {
        "hec"
    }

    async fn start(&self) -> Result<(), SinkError> {
        let mut sync_txs = self.inner.sync_txs.lock().unwrap();
        let mut tasks = self.inner.tasks.lock().unwrap();

        for _ in 0..self.inner.workers {
            let (sync_tx, sync_rx) = mpsc::unbounded_channel();
            sync_txs.push(sync_tx);
            tasks.push(tokio::spawn(submitter(self.inner.clone(), sync_rx)));
        }

        Ok(())
    }

    async fn ingest(&self, span: &Span) {
        let inner = &self.inner;

        // Choose 1/sample_rate traces. Spans with a trace id of zero and
        // indicator spans are always chosen, regardless of the rate.
        if !span.indicator && span.trace_id % inner.sample_rate != 0 {
            inner.skipped.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let event = HecEvent::new(span, &inner.hostname);

        let sent = match inner.ingest_timeout {
            Some(timeout) => {
                match tokio::time::timeout(timeout, inner.ingest_tx.send_async(event)).await {
                    Ok(result) => result.is_ok(),
                    Err(_) => false,
                }
            }
            None => inner.ingest_tx.send_async(event).await.is_ok(),
        };

        if sent {
            inner.ingested.fetch_add(1, Ordering::Relaxed);
        } else {
            inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn flush(&self) {
        // Make the submitters open a new HTTP request.
        self.sync().await;

        // Report and zero the interval counters.
        let inner = &self.inner;
        metric!(
            counter(ServerCounters::SinkSpansFlushed) += inner.ingested.swap(0, Ordering::Relaxed),
            sink = self.name(),
        );
        metric!(
            counter(ServerCounters::SinkSpansDropped) += inner.dropped.swap(0, Ordering::Relaxed),
            sink = self.name(),
        );
        metric!(
            counter(ServerCounters::SinkSpansSkipped) += inner.skipped.swap(0, Ordering::Relaxed),
            sink = self.name(),
        );
    }

    async fn stop(&self) {
        // Closing the sync channels is the terminal end-of-batch signal.
        self.inner.sync_txs.lock().unwrap().clear();

        let tasks: Vec<_> = {
            let mut tasks = self.inner.tasks.lock().unwrap();
            tasks.drain(..).collect()
        };

        for task in tasks {
            task.await.ok();
        }
    }
}

/// One submission worker.
///
/// Runs batches forever: a batch ends when `batch_size` events were encoded,
/// when a sync is requested, or terminally when the sync channel closes.
async fn submitter(inner: Arc<HecInner>, mut sync_rx: mpsc::UnboundedReceiver<oneshot::Sender<()>>) {
    let ingest = inner.ingest_rx.clone();

    'run: loop {
        let mut body: Option<mpsc::Sender<Result<Bytes, Infallible>>> = None;
        let mut encoded = 0usize;

        loop {
            tokio::select! {
                biased;

                sync = sync_rx.recv() => {
                    // Dropping the body sender completes the in-flight request.
                    drop(body.take());
                    match sync {
                        None => break 'run,
                        Some(ack) => {
                            ack.send(()).ok();
                            break;
                        }
                    }
                }

                event = ingest.recv_async() => {
                    let Ok(event) = event else { break 'run };

                    if body.is_none() {
                        match begin_request(&inner) {
                            Ok(tx) => body = Some(tx),
                            Err(error) => {
                                tally_log::warn!("could not create HEC request: {error}");
                                tokio::time::sleep(CONSTRUCTION_RETRY_DELAY).await;
                                break;
                            }
                        }
                    }

                    match serde_json::to_vec(&event) {
                        Ok(bytes) => {
                            let delivered = match &body {
                                Some(tx) => tx.send(Ok(bytes.into())).await.is_ok(),
                                None => false,
                            };

                            if !delivered {
                                // The request driver went away; restart the batch.
                                body = None;
                                break;
                            }

                            encoded += 1;
                        }
                        Err(error) => {
                            tally_log::warn!("could not json-encode HEC event: {error}");
                            continue;
                        }
                    }

                    if encoded >= inner.batch_size {
                        // A full batch worth was consumed, send it.
                        drop(body.take());
                        break;
                    }
                }
            }
        }
    }
}

/// Opens the outgoing chunked request and spawns its response driver.
///
/// Returns the sender for body chunks; dropping it ends the request body.
fn begin_request(
    inner: &Arc<HecInner>,
) -> Result<mpsc::Sender<Result<Bytes, Infallible>>, reqwest::Error> {
    let (tx, rx) = mpsc::channel(BODY_CHANNEL_CAPACITY);

    let request = inner
        .client
        .post(inner.endpoint.clone())
        .header(
            reqwest::header::AUTHORIZATION,
            format!("Splunk {}", inner.token),
        )
        .body(reqwest::Body::wrap_stream(ReceiverStream::new(rx)))
        .build()?;

    let driver = inner.clone();
    tokio::spawn(async move { driver.drive_request(request).await });

    Ok(tx)
}

impl HecInner {
    /// Sends the request and classifies the outcome.
    async fn drive_request(&self, request: reqwest::Request) {
        let start = Instant::now();

        let result = match self.send_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, self.client.execute(request)).await
            {
                Ok(result) => result,
                Err(_) => {
                    // No alert for timeouts, only the counter.
                    metric!(
                        counter(ServerCounters::HecSubmissionFailed) += 1,
                        cause = "submission_timeout",
                    );
                    self.record_lifetime(start);
                    return;
                }
            },
            None => self.client.execute(request).await,
        };

        let response = match result {
            Ok(response) => response,
            Err(error) if error.is_timeout() => {
                metric!(
                    counter(ServerCounters::HecSubmissionFailed) += 1,
                    cause = "submission_timeout",
                );
                self.record_lifetime(start);
                return;
            }
            Err(_) => {
                metric!(
                    counter(ServerCounters::HecSubmissionFailed) += 1,
                    cause = "execution",
                );
                self.record_lifetime(start);
                return;
            }
        };

        let status = response.status();
        let (cause, status_code) = match status.as_u16() {
            200 => {
                // Drain the body so the connection stays alive for reuse.
                drain(response).await;
                metric!(counter(ServerCounters::HecSubmissionSuccess) += 1);
                self.record_lifetime(start);
                return;
            }
            500 => {
                drain(response).await;
                ("internal_server_error", 8)
            }
            503 => {
                // The collector is out of capacity; no need to parse the body
                // or raise an alert for it.
                drain(response).await;
                ("service_unavailable", 9)
            }
            _ => {
                // Something else is wrong, parse the body and report a
                // detailed error.
                let parsed: HecResponse = match response.json().await {
                    Ok(parsed) => parsed,
                    Err(error) => {
                        tally_log::warn!(
                            http_status_code = status.as_u16(),
                            "could not parse response from HEC collector: {error}"
                        );
                        self.record_lifetime(start);
                        return;
                    }
                };

                tally_log::error!(
                    http_status_code = status.as_u16(),
                    hec_status_code = parsed.code,
                    hec_response_text = %parsed.text,
                    event_number = parsed.invalid_event_number,
                    "error response from HEC collector"
                );

                metric!(
                    counter(ServerCounters::HecSubmissionFailed) += 1,
                    cause = "error",
                    status_code = parsed.code.to_string(),
                );
                self.record_lifetime(start);
                return;
            }
        };

        metric!(
            counter(ServerCounters::HecSubmissionFailed) += 1,
            cause = cause,
            status_code = status_code.to_string(),
        );
        self.record_lifetime(start);
    }

    fn record_lifetime(&self, start: Instant) {
        metric!(
            histogram(ServerHistograms::HecSpanSubmissionLifetimeNs) =
                start.elapsed().as_nanos() as f64
        );
    }
}

async fn drain(mut response: reqwest::Response) {
    while let Ok(Some(_)) = response.chunk().await {}
}
