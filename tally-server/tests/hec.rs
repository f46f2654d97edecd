//! End-to-end tests for the batched HEC span sink against a local collector.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use tally_config::HecConfig;
use tally_server::sinks::{HecSpanSink, SpanSink};
use tally_server::spans::Span;
use tally_statsd::{MetricRecord, RecordValue, Recorder};

/// Captures self-metrics recorded anywhere in the test binary.
static RECORDS: OnceLock<Mutex<Vec<MetricRecord>>> = OnceLock::new();

struct TestRecorder;

impl Recorder for TestRecorder {
    fn record(&self, record: MetricRecord) {
        RECORDS
            .get_or_init(Default::default)
            .lock()
            .unwrap()
            .push(record);
    }
}

fn install_recorder() {
    RECORDS.get_or_init(Default::default);
    tally_statsd::init(TestRecorder);
}

fn recorded_counter(name: &str, tags: &[(&str, &str)]) -> f64 {
    let records = RECORDS.get_or_init(Default::default).lock().unwrap();
    records
        .iter()
        .filter(|record| {
            record.name == name
                && tags.iter().all(|(key, value)| {
                    record
                        .tags
                        .iter()
                        .any(|(k, v)| k == key && v == value)
                })
        })
        .map(|record| match record.value {
            RecordValue::Counter(v) => v,
            _ => 0.0,
        })
        .sum()
}

/// The state of the fake collector.
#[derive(Default)]
struct Collector {
    requests: AtomicUsize,
    events: AtomicUsize,
    status: AtomicU16,
    batches: Mutex<Vec<usize>>,
}

async fn collect(State(state): State<Arc<Collector>>, body: Bytes) -> StatusCode {
    state.requests.fetch_add(1, Ordering::SeqCst);

    // The body is a concatenated stream of JSON objects, no outer array.
    let events = serde_json::Deserializer::from_slice(&body)
        .into_iter::<serde_json::Value>()
        .filter_map(Result::ok)
        .count();

    state.events.fetch_add(events, Ordering::SeqCst);
    state.batches.lock().unwrap().push(events);

    StatusCode::from_u16(state.status.load(Ordering::SeqCst)).unwrap()
}

async fn start_collector(status: u16) -> (Arc<Collector>, SocketAddr) {
    let state = Arc::new(Collector {
        status: AtomicU16::new(status),
        ..Default::default()
    });

    let app = axum::Router::new()
        .route("/services/collector", post(collect))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    (state, addr)
}

fn span(trace_id: i64, id: i64) -> Span {
    Span {
        trace_id,
        id,
        parent_id: 0,
        start_timestamp: 1_500_000_000_000_000_000,
        end_timestamp: 1_500_000_000_100_000_000,
        indicator: false,
        error: false,
        service: "api".to_owned(),
        name: "op".to_owned(),
        tags: BTreeMap::new(),
    }
}

async fn wait_for(deadline: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hec_success_batches() {
    install_recorder();
    let (collector, addr) = start_collector(200).await;

    let config = HecConfig {
        address: format!("http://{addr}"),
        token: "secret".to_owned(),
        batch_size: 10,
        submission_workers: 1,
        ..Default::default()
    };

    let sink = HecSpanSink::new(&config, "test-host".to_owned()).unwrap();
    sink.start().await.unwrap();

    for i in 0..100 {
        sink.ingest(&span(i, i + 1)).await;
    }

    assert_eq!(sink.interval_counters(), (100, 0, 0));

    sink.flush().await;

    // After flush the interval counters are zeroed.
    assert_eq!(sink.interval_counters(), (0, 0, 0));

    // Exactly 100 event objects in 10 requests of batch_size each.
    assert!(
        wait_for(Duration::from_secs(5), || {
            collector.events.load(Ordering::SeqCst) == 100
        })
        .await,
        "collector only saw {} events",
        collector.events.load(Ordering::SeqCst)
    );
    assert_eq!(collector.requests.load(Ordering::SeqCst), 10);
    assert!(collector
        .batches
        .lock()
        .unwrap()
        .iter()
        .all(|&batch| batch == 10));

    sink.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hec_multiple_submitters_split_the_stream() {
    install_recorder();
    let (collector, addr) = start_collector(200).await;

    let config = HecConfig {
        address: format!("http://{addr}"),
        token: "secret".to_owned(),
        batch_size: 10,
        submission_workers: 2,
        ..Default::default()
    };

    let sink = HecSpanSink::new(&config, "test-host".to_owned()).unwrap();
    sink.start().await.unwrap();

    for i in 0..100 {
        sink.ingest(&span(i, i + 1)).await;
    }

    sink.flush().await;

    assert!(
        wait_for(Duration::from_secs(5), || {
            collector.events.load(Ordering::SeqCst) == 100
        })
        .await
    );

    // Batches never exceed the configured size; the two submitters may leave
    // at most two partial batches at the sync boundary.
    let batches = collector.batches.lock().unwrap().clone();
    assert!(batches.iter().all(|&batch| batch <= 10));
    assert!(batches.len() >= 10);

    sink.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hec_service_unavailable() {
    install_recorder();
    let (collector, addr) = start_collector(503).await;

    let config = HecConfig {
        address: format!("http://{addr}"),
        token: "secret".to_owned(),
        batch_size: 5,
        submission_workers: 1,
        ..Default::default()
    };

    let sink = HecSpanSink::new(&config, "test-host".to_owned()).unwrap();
    sink.start().await.unwrap();

    for i in 0..10 {
        sink.ingest(&span(i, i + 1)).await;
    }

    sink.flush().await;

    // Two full batches of five events each were submitted.
    assert!(
        wait_for(Duration::from_secs(5), || {
            collector.requests.load(Ordering::SeqCst) == 2
        })
        .await
    );
    let expected = 2.0;

    // Every request is classified as service_unavailable with HEC code 9; no
    // alert-level error is raised for capacity problems.
    assert!(
        wait_for(Duration::from_secs(5), || {
            recorded_counter(
                "hec.submission_failed_total",
                &[("cause", "service_unavailable"), ("status_code", "9")],
            ) >= expected
        })
        .await,
        "missing service_unavailable outcomes"
    );

    sink.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_hec_sampling_split() {
    install_recorder();
    let (collector, addr) = start_collector(200).await;

    let config = HecConfig {
        address: format!("http://{addr}"),
        token: "secret".to_owned(),
        batch_size: 10,
        submission_workers: 1,
        span_sample_rate: 2,
        ..Default::default()
    };

    let sink = HecSpanSink::new(&config, "test-host".to_owned()).unwrap();
    sink.start().await.unwrap();

    // Even trace ids are sampled in, odd ones are skipped.
    for i in 0..10 {
        sink.ingest(&span(i, i + 1)).await;
    }

    assert_eq!(sink.interval_counters(), (5, 0, 5));

    sink.flush().await;
    assert!(
        wait_for(Duration::from_secs(5), || {
            collector.events.load(Ordering::SeqCst) == 5
        })
        .await
    );

    sink.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stop_flushes_the_open_batch() {
    install_recorder();
    let (collector, addr) = start_collector(200).await;

    let config = HecConfig {
        address: format!("http://{addr}"),
        token: "secret".to_owned(),
        batch_size: 1000,
        submission_workers: 1,
        ..Default::default()
    };

    let sink = HecSpanSink::new(&config, "test-host".to_owned()).unwrap();
    sink.start().await.unwrap();

    for i in 0..7 {
        sink.ingest(&span(i, i + 1)).await;
    }

    // Stop closes the sync channel: a terminal end-of-batch that completes
    // the in-flight request.
    sink.stop().await;

    assert!(
        wait_for(Duration::from_secs(5), || {
            collector.events.load(Ordering::SeqCst) == 7
        })
        .await
    );
}
