//! Metric protocol, aggregation and reduction for the tally daemon.
//!
//! # Protocol
//!
//! Applications submit metrics in a text-based protocol derived from statsd. A
//! sample submission looks like this:
//!
//! ```text
//! endpoint.response_time:57|ms|#route:user_index
//! endpoint.hits:1|c|@0.5|#route:user_index
//! ```
//!
//! The metric type is part of a metric's identity together with its name and
//! canonicalized tag set. It is therefore allowed to reuse a metric name for
//! multiple metric types, which results in multiple metrics being recorded.
//!
//! # Aggregation
//!
//! Metrics accumulate into [aggregates](AggregateValue) held by an
//! [`Aggregator`] for the duration of one flush interval:
//!
//! - `Counter`: running sum, flushed as a per-second rate.
//! - `Gauge`: last value wins.
//! - `Histogram`: a streaming quantile sketch plus min/max/count/sum.
//! - `Set`: hashed members, flushed as a cardinality.
//! - `Status`: the most recent severity.
//!
//! Aggregates whose [scope](MetricScope) is global are not reduced locally.
//! Their mergeable pre-reduction form is serialized with the
//! [forward codec](forward) and shipped to a global node, because a quantile of
//! quantiles is not a quantile.

mod aggregate;
mod aggregator;
pub mod forward;
mod protocol;
mod reduce;

pub use self::aggregate::*;
pub use self::aggregator::*;
pub use self::protocol::*;
pub use self::reduce::*;
