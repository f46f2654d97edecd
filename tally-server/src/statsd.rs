use tally_statsd::{CounterMetric, GaugeMetric, HistogramMetric, TimerMetric};

/// Counter metrics for the tally server.
pub enum ServerCounters {
    /// Incremented once when the server starts.
    ServerStarting,

    /// Metric records accepted off the wire, tagged by `listener` scheme.
    MetricsReceived,

    /// Malformed metric lines, tagged by `cause` with the parse error class.
    ParseErrors,

    /// Metric names shortened to `metric_max_length` before hashing.
    MetricsTruncated,

    /// Metric samples dropped instead of applying backpressure, tagged by
    /// `cause` (`worker_full`).
    DroppedMetrics,

    /// Stream frames cut at `metric_max_length`, tagged by `listener`.
    TruncatedFrames,

    /// Spans accepted off the wire, tagged by `listener` scheme.
    SpansReceived,

    /// Spans dropped on the bounded span channel, tagged by `cause`
    /// (`channel_full`).
    DroppedSpans,

    /// Spans rejected by validation, tagged by `cause`.
    InvalidSpans,

    /// Reduced records handed to metric sinks in one flush.
    RecordsFlushed,

    /// Forward payloads successfully submitted.
    ForwardPayloads,

    /// Aggregates serialized into forward payloads.
    ForwardRecords,

    /// Failed forward submissions, tagged by `cause`. The interval's
    /// contribution is lost; there is no retry.
    ForwardErrors,

    /// Imported payloads rejected for their schema version.
    ForwardVersionMismatch,

    /// Aggregates merged from imported payloads.
    ImportRecordsMerged,

    /// Successful HEC submission requests.
    HecSubmissionSuccess,

    /// Failed HEC submission requests, tagged by `cause` and `status_code`.
    HecSubmissionFailed,

    /// Spans handed to span sinks per flush interval, tagged by `sink`.
    SinkSpansFlushed,

    /// Spans dropped by span sinks per flush interval, tagged by `sink`.
    SinkSpansDropped,

    /// Spans skipped by sampling per flush interval, tagged by `sink`.
    SinkSpansSkipped,
}

impl CounterMetric for ServerCounters {
    fn name(&self) -> &'static str {
        match *self {
            Self::ServerStarting => "server.starting",
            Self::MetricsReceived => "metrics.received",
            Self::ParseErrors => "metrics.parse_errors",
            Self::MetricsTruncated => "metrics.truncated",
            Self::DroppedMetrics => "metrics.dropped",
            Self::TruncatedFrames => "listener.truncated_frames",
            Self::SpansReceived => "spans.received",
            Self::DroppedSpans => "spans.dropped",
            Self::InvalidSpans => "spans.invalid",
            Self::RecordsFlushed => "flush.records_flushed",
            Self::ForwardPayloads => "forward.payloads",
            Self::ForwardRecords => "forward.records",
            Self::ForwardErrors => "forward.errors",
            Self::ForwardVersionMismatch => "forward.version_mismatch",
            Self::ImportRecordsMerged => "import.records_merged",
            Self::HecSubmissionSuccess => "hec.submission_success_total",
            Self::HecSubmissionFailed => "hec.submission_failed_total",
            Self::SinkSpansFlushed => "sinks.spans_flushed",
            Self::SinkSpansDropped => "sinks.spans_dropped",
            Self::SinkSpansSkipped => "sinks.spans_skipped",
        }
    }
}

/// Timer metrics for the tally server.
pub enum ServerTimers {
    /// Wall time of one complete flush: snapshot, reduction, sink handoff.
    FlushDuration,

    /// Wall time of one forward payload submission.
    ForwardDuration,
}

impl TimerMetric for ServerTimers {
    fn name(&self) -> &'static str {
        match *self {
            Self::FlushDuration => "flush.duration",
            Self::ForwardDuration => "forward.duration",
        }
    }
}

/// Gauge metrics for the tally server.
pub enum ServerGauges {
    /// Aggregates contained in the most recent flush snapshot.
    FlushAggregates,
}

impl GaugeMetric for ServerGauges {
    fn name(&self) -> &'static str {
        match *self {
            Self::FlushAggregates => "flush.aggregates",
        }
    }
}

/// Histogram metrics for the tally server.
pub enum ServerHistograms {
    /// Lifetime of one HEC submission request in nanoseconds, from first byte
    /// to classified outcome.
    HecSpanSubmissionLifetimeNs,
}

impl HistogramMetric for ServerHistograms {
    fn name(&self) -> &'static str {
        match *self {
            Self::HecSpanSubmissionLifetimeNs => "hec.span_submission_lifetime_ns",
        }
    }
}
