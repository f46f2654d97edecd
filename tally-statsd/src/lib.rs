//! A type safe self-metric facade for the tally daemon.
//!
//! The daemon observes itself through the same pipeline it offers to
//! applications: every operational counter, gauge and timer re-enters the ingest
//! path as a regular metric. This crate provides the recording side of that
//! loop without depending on the pipeline crates.
//!
//! ## Defining metrics
//!
//! Metric names are declared by implementing one of the name traits on an enum,
//! one enum per crate and metric type. The traits only provide a type safe
//! name; emitting a counter through a gauge name is a compile error.
//!
//! ## Recording
//!
//! Metrics are recorded with the [`metric!`] macro:
//!
//! ```
//! use tally_statsd::{metric, CounterMetric};
//!
//! struct MyCounter;
//!
//! impl CounterMetric for MyCounter {
//!     fn name(&self) -> &'static str {
//!         "counter"
//!     }
//! }
//!
//! metric!(counter(MyCounter) += 1);
//! ```
//!
//! ## Wiring
//!
//! At startup, the server installs a [`Recorder`] via [`init`]. The recorder
//! must never block: the convention for self-metrics is a non-blocking send
//! into the router, with losses counted in a last-resort atomic. Before `init`
//! is called, recording is a no-op, so library crates can emit metrics
//! unconditionally.

use std::cell::RefCell;
use std::fmt::Write;
use std::time::Duration;

use once_cell::sync::OnceCell;

/// A single recorded self-metric.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricRecord {
    /// The metric name as declared by its name trait.
    pub name: &'static str,
    /// The recorded value.
    pub value: RecordValue,
    /// Tags as `(key, value)` pairs in the order they were written.
    pub tags: Vec<(&'static str, String)>,
}

/// The value of a [`MetricRecord`].
#[derive(Clone, Debug, PartialEq)]
pub enum RecordValue {
    /// A counter increment.
    Counter(f64),
    /// An instantaneous gauge value.
    Gauge(f64),
    /// An elapsed duration, aggregated as a histogram.
    Timer(Duration),
    /// A single histogram sample.
    Histogram(f64),
    /// A set member.
    Set(String),
}

impl RecordValue {
    /// The statsd type suffix for this value.
    fn suffix(&self) -> &'static str {
        match self {
            Self::Counter(_) => "c",
            Self::Gauge(_) => "g",
            Self::Timer(_) => "ms",
            Self::Histogram(_) => "h",
            Self::Set(_) => "s",
        }
    }
}

/// Receives every recorded self-metric.
///
/// Implementations must not block: `record` is invoked from hot paths such as
/// worker loops and sink submitters.
pub trait Recorder: Send + Sync + 'static {
    /// Records a single metric. Losses must be counted, not awaited.
    fn record(&self, record: MetricRecord);
}

static RECORDER: OnceCell<Box<dyn Recorder>> = OnceCell::new();

thread_local! {
    static CAPTURE: RefCell<Option<Vec<String>>> = const { RefCell::new(None) };
}

/// Installs the process-wide [`Recorder`].
///
/// Subsequent calls are ignored; the first recorder wins.
pub fn init<R: Recorder>(recorder: R) {
    RECORDER.set(Box::new(recorder)).ok();
}

/// Captures all metrics recorded by `f` on the current thread.
///
/// The captured lines use the plain statsd line format,
/// `name:value|type|#tag:value,...`, which keeps assertions readable.
pub fn with_capturing_test_client(f: impl FnOnce()) -> Vec<String> {
    CAPTURE.with(|capture| *capture.borrow_mut() = Some(Vec::new()));
    f();
    CAPTURE.with(|capture| capture.borrow_mut().take().unwrap_or_default())
}

/// Formats a float without a trailing `.0` for whole values.
fn format_value(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

fn format_line(record: &MetricRecord) -> String {
    let mut line = String::new();

    let value = match &record.value {
        RecordValue::Counter(v) | RecordValue::Gauge(v) | RecordValue::Histogram(v) => {
            format_value(*v)
        }
        RecordValue::Timer(d) => format_value(d.as_nanos() as f64 / 1e6),
        RecordValue::Set(s) => s.clone(),
    };

    write!(line, "{}:{}|{}|#", record.name, value, record.value.suffix()).ok();

    for (i, (key, value)) in record.tags.iter().enumerate() {
        if i > 0 {
            line.push(',');
        }
        write!(line, "{key}:{value}").ok();
    }

    line
}

/// Dispatches a record to the thread-local capture or the installed recorder.
///
/// Not meant to be called directly; use the [`metric!`] macro.
#[doc(hidden)]
pub fn record(record: MetricRecord) {
    let captured = CAPTURE.with(|capture| match &mut *capture.borrow_mut() {
        Some(lines) => {
            lines.push(format_line(&record));
            true
        }
        None => false,
    });

    if !captured {
        if let Some(recorder) = RECORDER.get() {
            recorder.record(record);
        }
    }
}

/// A metric for capturing counters.
///
/// Counters are simple values incremented by the daemon, for example the number
/// of received packets or dropped records.
///
/// ## Example
///
/// ```
/// use tally_statsd::{metric, CounterMetric};
///
/// enum MyCounter {
///     TotalRequests,
///     TotalBytes,
/// }
///
/// impl CounterMetric for MyCounter {
///     fn name(&self) -> &'static str {
///         match self {
///             Self::TotalRequests => "total_requests",
///             Self::TotalBytes => "total_bytes",
///         }
///     }
/// }
///
/// metric!(counter(MyCounter::TotalRequests) += 1);
/// metric!(counter(MyCounter::TotalBytes) += 512, listener = "udp");
/// ```
pub trait CounterMetric {
    /// Returns the counter metric name.
    fn name(&self) -> &'static str;
}

/// A metric for capturing gauges.
///
/// Gauge values are instantaneous measurements, such as queue lengths.
pub trait GaugeMetric {
    /// Returns the gauge metric name.
    fn name(&self) -> &'static str;
}

/// A metric for capturing timings.
///
/// Timings are durations between a start and end time, aggregated as
/// histograms downstream.
///
/// ## Example
///
/// ```
/// use tally_statsd::{metric, TimerMetric};
///
/// struct FlushDuration;
///
/// impl TimerMetric for FlushDuration {
///     fn name(&self) -> &'static str {
///         "flush_duration"
///     }
/// }
///
/// // measure time by explicitly setting a std::time::Duration
/// # use std::time::Instant;
/// let start_time = Instant::now();
/// metric!(timer(FlushDuration) = start_time.elapsed());
///
/// // measure time implicitly by enclosing a code block in a metric
/// metric!(timer(FlushDuration), {
///     // work
/// });
/// ```
pub trait TimerMetric {
    /// Returns the timer metric name.
    fn name(&self) -> &'static str;
}

/// A metric for capturing histogram samples directly.
pub trait HistogramMetric {
    /// Returns the histogram metric name.
    fn name(&self) -> &'static str;
}

/// A metric for counting unique members.
pub trait SetMetric {
    /// Returns the set metric name.
    fn name(&self) -> &'static str;
}

#[doc(hidden)]
#[macro_export]
macro_rules! tags_var {
    ($($k:ident = $v:expr),* $(,)?) => {
        ::std::vec![$((stringify!($k), ::std::string::String::from($v))),*]
    };
}

/// Emits a self-metric.
///
/// See the [crate-level documentation](self) for examples.
#[macro_export]
macro_rules! metric {
    // counter increment
    (counter($id:expr) += $value:expr $(, $k:ident = $v:expr)* $(,)?) => {
        $crate::record($crate::MetricRecord {
            name: $crate::CounterMetric::name(&$id),
            value: $crate::RecordValue::Counter($value as f64),
            tags: $crate::tags_var!($($k = $v),*),
        })
    };

    // gauge set
    (gauge($id:expr) = $value:expr $(, $k:ident = $v:expr)* $(,)?) => {
        $crate::record($crate::MetricRecord {
            name: $crate::GaugeMetric::name(&$id),
            value: $crate::RecordValue::Gauge($value as f64),
            tags: $crate::tags_var!($($k = $v),*),
        })
    };

    // timer value
    (timer($id:expr) = $value:expr $(, $k:ident = $v:expr)* $(,)?) => {
        $crate::record($crate::MetricRecord {
            name: $crate::TimerMetric::name(&$id),
            value: $crate::RecordValue::Timer($value),
            tags: $crate::tags_var!($($k = $v),*),
        })
    };

    // timed block
    (timer($id:expr), $($k:ident = $v:expr,)* $block:block) => {{
        let now = ::std::time::Instant::now();
        let rv = { $block };
        $crate::metric!(timer($id) = now.elapsed() $(, $k = $v)*);
        rv
    }};

    // histogram sample
    (histogram($id:expr) = $value:expr $(, $k:ident = $v:expr)* $(,)?) => {
        $crate::record($crate::MetricRecord {
            name: $crate::HistogramMetric::name(&$id),
            value: $crate::RecordValue::Histogram($value as f64),
            tags: $crate::tags_var!($($k = $v),*),
        })
    };

    // set member
    (set($id:expr) = $value:expr $(, $k:ident = $v:expr)* $(,)?) => {
        $crate::record($crate::MetricRecord {
            name: $crate::SetMetric::name(&$id),
            value: $crate::RecordValue::Set(::std::string::String::from($value)),
            tags: $crate::tags_var!($($k = $v),*),
        })
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    enum TestGauges {
        Foo,
        Bar,
    }

    impl GaugeMetric for TestGauges {
        fn name(&self) -> &'static str {
            match self {
                Self::Foo => "foo",
                Self::Bar => "bar",
            }
        }
    }

    struct TestCounter;

    impl CounterMetric for TestCounter {
        fn name(&self) -> &'static str {
            "counter"
        }
    }

    struct TestTimer;

    impl TimerMetric for TestTimer {
        fn name(&self) -> &'static str {
            "timer"
        }
    }

    struct TestSet;

    impl SetMetric for TestSet {
        fn name(&self) -> &'static str {
            "unique"
        }
    }

    #[test]
    fn test_capturing_client() {
        let captures = with_capturing_test_client(|| {
            metric!(gauge(TestGauges::Foo) = 123, server = "server1");
            metric!(gauge(TestGauges::Bar) = 456, server = "server2");
        });

        assert_eq!(
            captures,
            [
                "foo:123|g|#server:server1",
                "bar:456|g|#server:server2",
            ]
        );
    }

    #[test]
    fn test_counter_with_tags() {
        let captures = with_capturing_test_client(|| {
            metric!(counter(TestCounter) += 10, cause = "worker_full", shard = "3");
        });

        assert_eq!(captures, ["counter:10|c|#cause:worker_full,shard:3"]);
    }

    #[test]
    fn test_counter_without_tags() {
        let captures = with_capturing_test_client(|| {
            metric!(counter(TestCounter) += 2);
        });

        assert_eq!(captures, ["counter:2|c|#"]);
    }

    #[test]
    fn test_timer_millis() {
        let captures = with_capturing_test_client(|| {
            metric!(timer(TestTimer) = Duration::from_millis(1500));
        });

        assert_eq!(captures, ["timer:1500|ms|#"]);
    }

    #[test]
    fn test_timed_block() {
        let captures = with_capturing_test_client(|| {
            let value = metric!(timer(TestTimer), worker = "0", { 42 });
            assert_eq!(value, 42);
        });

        assert_eq!(captures.len(), 1);
        assert!(captures[0].starts_with("timer:"));
        assert!(captures[0].ends_with("|ms|#worker:0"));
    }

    #[test]
    fn test_set_member() {
        let captures = with_capturing_test_client(|| {
            metric!(set(TestSet) = "host-a");
        });

        assert_eq!(captures, ["unique:host-a|s|#"]);
    }

    #[test]
    fn test_uninitialized_is_noop() {
        // Must not panic without an installed recorder.
        metric!(counter(TestCounter) += 1);
    }
}
