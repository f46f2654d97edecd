use std::collections::BTreeSet;

use quantiles::ckms::CKMS;
use serde::{Deserialize, Serialize};

use crate::protocol::{hash_set_value, MetricType, MetricValue, Severity};

/// The rank error guaranteed by the quantile sketch.
///
/// With 0.001, a queried quantile is within ±0.1% of the true rank, well inside
/// the documented 1% envelope for flushed percentiles.
const SKETCH_ERROR: f64 = 0.001;

/// A streaming summary of a histogram (or timer) within one flush window.
///
/// The quantile sketch is mergeable and serializable, which makes this the
/// forwarding form for globally scoped histograms. Exact first-order statistics
/// are tracked alongside the sketch, so `min`, `max`, `count`, `sum` and the
/// harmonic mean never carry sketch error.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HistogramValue {
    sketch: CKMS<f64>,
    min: f64,
    max: f64,
    count: u64,
    sum: f64,
    reciprocal_sum: f64,
}

impl HistogramValue {
    /// Creates an empty histogram.
    pub fn new() -> Self {
        Self {
            sketch: CKMS::new(SKETCH_ERROR),
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            count: 0,
            sum: 0.0,
            reciprocal_sum: 0.0,
        }
    }

    /// Creates a histogram from a single weighted sample.
    pub fn single(value: f64, weight: u64) -> Self {
        let mut histogram = Self::new();
        histogram.insert(value, weight);
        histogram
    }

    /// Inserts a sample with the given weight.
    ///
    /// The weight is the rounded inverse sample rate; an unsampled value has
    /// weight 1.
    pub fn insert(&mut self, value: f64, weight: u64) {
        let weight = weight.max(1);
        for _ in 0..weight {
            self.sketch.insert(value);
        }

        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.count += weight;
        self.sum += value * weight as f64;
        if value != 0.0 {
            self.reciprocal_sum += weight as f64 / value;
        }
    }

    /// Merges another histogram into this one.
    pub fn merge(&mut self, other: Self) {
        self.sketch += other.sketch;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.count += other.count;
        self.sum += other.sum;
        self.reciprocal_sum += other.reciprocal_sum;
    }

    /// The smallest inserted value.
    pub fn min(&self) -> f64 {
        self.min
    }

    /// The largest inserted value.
    pub fn max(&self) -> f64 {
        self.max
    }

    /// The weighted number of samples.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// The weighted sum of all samples.
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// The arithmetic mean, or `None` for an empty histogram.
    pub fn avg(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }

    /// The harmonic mean, or `None` if it is undefined.
    pub fn hmean(&self) -> Option<f64> {
        (self.count > 0 && self.reciprocal_sum != 0.0)
            .then(|| self.count as f64 / self.reciprocal_sum)
    }

    /// Queries the sketch for quantile `q` in `[0, 1]`.
    pub fn quantile(&self, q: f64) -> Option<f64> {
        self.sketch.query(q).map(|(_, value)| value)
    }
}

impl Default for HistogramValue {
    fn default() -> Self {
        Self::new()
    }
}

/// The members of a set aggregate within one flush window.
///
/// Members are hashed with [`hash_set_value`](crate::hash_set_value) on insert
/// and only the 32-bit hashes are kept, four bytes per distinct member. The
/// structure is mergeable and serializable for forwarding.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SetValue(BTreeSet<u32>);

impl SetValue {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a set containing a single member.
    pub fn single(member: &str) -> Self {
        let mut set = Self::new();
        set.insert(member);
        set
    }

    /// Hashes and inserts a member.
    pub fn insert(&mut self, member: &str) {
        self.0.insert(hash_set_value(member));
    }

    /// Merges another set into this one.
    pub fn merge(&mut self, other: Self) {
        self.0.extend(other.0);
    }

    /// The number of distinct members.
    pub fn count(&self) -> u64 {
        self.0.len() as u64
    }
}

/// The accumulated state of one metric identity within a flush window.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum AggregateValue {
    /// Running sum of counter increments, scaled by inverse sample rates.
    ///
    /// Flushed as a rate: sum divided by the flush interval in seconds.
    #[serde(rename = "c")]
    Counter(f64),

    /// The last reported gauge value.
    ///
    /// Arrival order at the owning worker decides which value wins; cross-node
    /// ordering of global gauges is undefined.
    #[serde(rename = "g")]
    Gauge(f64),

    /// A histogram summary, see [`HistogramValue`].
    #[serde(rename = "h")]
    Histogram(HistogramValue),

    /// A set of hashed members, see [`SetValue`].
    #[serde(rename = "s")]
    Set(SetValue),

    /// The most recent service-check severity.
    #[serde(rename = "st")]
    Status(Severity),
}

impl AggregateValue {
    /// Creates an aggregate from the first sample of a flush window.
    pub fn from_sample(value: MetricValue, sample_rate: f64) -> Self {
        let weight = sample_weight(sample_rate);
        match value {
            MetricValue::Counter(v) => Self::Counter(v * weight as f64),
            MetricValue::Gauge(v) => Self::Gauge(v),
            MetricValue::Histogram(v) => Self::Histogram(HistogramValue::single(v, weight)),
            MetricValue::Set(member) => Self::Set(SetValue::single(&member)),
            MetricValue::Status(severity) => Self::Status(severity),
        }
    }

    /// Applies a subsequent sample to this aggregate.
    ///
    /// Returns `Err(value)` if the sample's type does not match the aggregate,
    /// which cannot happen for samples routed by identity.
    pub fn apply(&mut self, value: MetricValue, sample_rate: f64) -> Result<(), MetricValue> {
        let weight = sample_weight(sample_rate);
        match (self, value) {
            (Self::Counter(sum), MetricValue::Counter(v)) => *sum += v * weight as f64,
            (Self::Gauge(last), MetricValue::Gauge(v)) => *last = v,
            (Self::Histogram(h), MetricValue::Histogram(v)) => h.insert(v, weight),
            (Self::Set(set), MetricValue::Set(member)) => set.insert(&member),
            (Self::Status(last), MetricValue::Status(severity)) => *last = severity,
            (_, value) => return Err(value),
        }

        Ok(())
    }

    /// Merges another aggregate of the same identity into this one.
    ///
    /// This is the operation behind `/import` on global nodes. Returns
    /// `Err(other)` when the types do not match.
    pub fn merge(&mut self, other: Self) -> Result<(), Self> {
        match (self, other) {
            (Self::Counter(sum), Self::Counter(v)) => *sum += v,
            (Self::Gauge(last), Self::Gauge(v)) => *last = v,
            (Self::Histogram(h), Self::Histogram(v)) => h.merge(v),
            (Self::Set(set), Self::Set(v)) => set.merge(v),
            (Self::Status(last), Self::Status(v)) => *last = v,
            (_, other) => return Err(other),
        }

        Ok(())
    }

    /// Returns the type of this aggregate.
    pub fn ty(&self) -> MetricType {
        match self {
            Self::Counter(_) => MetricType::Counter,
            Self::Gauge(_) => MetricType::Gauge,
            Self::Histogram(_) => MetricType::Histogram,
            Self::Set(_) => MetricType::Set,
            Self::Status(_) => MetricType::Status,
        }
    }
}

/// Converts a sample rate in `(0, 1]` into an integral weight.
fn sample_weight(sample_rate: f64) -> u64 {
    if sample_rate > 0.0 && sample_rate <= 1.0 {
        (1.0 / sample_rate).round() as u64
    } else {
        1
    }
}
