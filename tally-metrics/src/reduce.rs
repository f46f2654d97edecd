use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::aggregate::AggregateValue;
use crate::protocol::{MetricKey, MetricType, TagSet};

/// A histogram statistic selectable through the `aggregates` config option.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistogramAggregate {
    /// The smallest sample.
    Min,
    /// The largest sample.
    Max,
    /// The 50th percentile from the sketch.
    Median,
    /// The arithmetic mean.
    Avg,
    /// The weighted sample count.
    Count,
    /// The weighted sample sum.
    Sum,
    /// The harmonic mean.
    Hmean,
}

impl HistogramAggregate {
    fn suffix(self) -> &'static str {
        match self {
            Self::Min => "min",
            Self::Max => "max",
            Self::Median => "median",
            Self::Avg => "avg",
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Hmean => "hmean",
        }
    }
}

/// Settings controlling how aggregates reduce into flush records.
#[derive(Clone, Debug)]
pub struct ReduceConfig {
    /// The flush interval; counters divide by its length in seconds.
    pub interval: Duration,
    /// Percentiles emitted for histograms, each in `(0, 1)`.
    pub percentiles: Vec<f64>,
    /// Histogram statistics emitted in addition to percentiles.
    pub aggregates: Vec<HistogramAggregate>,
}

impl Default for ReduceConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            percentiles: vec![0.5, 0.75, 0.99],
            aggregates: vec![
                HistogramAggregate::Min,
                HistogramAggregate::Max,
                HistogramAggregate::Count,
            ],
        }
    }
}

/// One reduced record as handed to metric sinks.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FlushRecord {
    /// The metric name, including any statistic suffix for histograms.
    pub name: String,
    /// The canonical tag set.
    pub tags: TagSet,
    /// The type of the originating aggregate.
    pub ty: MetricType,
    /// The reduced value.
    pub value: f64,
}

/// Reduces one aggregate into its flush records.
///
/// Counters become rates, gauges and statuses pass through, sets become
/// cardinalities, and histograms expand into one record per configured
/// statistic and percentile. An empty histogram produces no records.
pub fn reduce(key: &MetricKey, value: &AggregateValue, config: &ReduceConfig) -> Vec<FlushRecord> {
    let record = |name: String, value: f64| FlushRecord {
        name,
        tags: key.tags.clone(),
        ty: key.ty,
        value,
    };

    match value {
        AggregateValue::Counter(sum) => {
            let interval = config.interval.as_secs_f64().max(1.0);
            vec![record(key.name.clone(), sum / interval)]
        }
        AggregateValue::Gauge(last) => vec![record(key.name.clone(), *last)],
        AggregateValue::Set(set) => vec![record(key.name.clone(), set.count() as f64)],
        AggregateValue::Status(severity) => vec![record(key.name.clone(), severity.as_f64())],
        AggregateValue::Histogram(histogram) => {
            if histogram.count() == 0 {
                return Vec::new();
            }

            let mut records = Vec::with_capacity(config.aggregates.len() + config.percentiles.len());

            for aggregate in &config.aggregates {
                let value = match aggregate {
                    HistogramAggregate::Min => Some(histogram.min()),
                    HistogramAggregate::Max => Some(histogram.max()),
                    HistogramAggregate::Median => histogram.quantile(0.5),
                    HistogramAggregate::Avg => histogram.avg(),
                    HistogramAggregate::Count => Some(histogram.count() as f64),
                    HistogramAggregate::Sum => Some(histogram.sum()),
                    HistogramAggregate::Hmean => histogram.hmean(),
                };

                if let Some(value) = value {
                    records.push(record(format!("{}.{}", key.name, aggregate.suffix()), value));
                }
            }

            for percentile in &config.percentiles {
                if let Some(value) = histogram.quantile(*percentile) {
                    records.push(record(
                        format!("{}.{}percentile", key.name, format_percentile(*percentile)),
                        value,
                    ));
                }
            }

            records
        }
    }
}

/// Formats a percentile for a metric name suffix: `0.5` → `50`, `0.999` → `99.9`.
fn format_percentile(percentile: f64) -> String {
    let scaled = percentile * 100.0;
    if scaled.fract() == 0.0 {
        format!("{}", scaled as u64)
    } else {
        format!("{scaled}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::HistogramValue;
    use crate::protocol::Severity;

    fn key(name: &str, ty: MetricType) -> MetricKey {
        MetricKey {
            name: name.to_owned(),
            tags: TagSet::new(),
            ty,
        }
    }

    #[test]
    fn test_counter_reduces_to_rate() {
        let config = ReduceConfig {
            interval: Duration::from_secs(10),
            ..Default::default()
        };

        let records = reduce(
            &key("foo", MetricType::Counter),
            &AggregateValue::Counter(1000.0),
            &config,
        );

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].name, "foo");
        assert_eq!(records[0].value, 100.0);
    }

    #[test]
    fn test_histogram_expansion() {
        let config = ReduceConfig {
            interval: Duration::from_secs(10),
            percentiles: vec![0.5, 0.99],
            aggregates: vec![
                HistogramAggregate::Min,
                HistogramAggregate::Max,
                HistogramAggregate::Count,
            ],
        };

        let mut histogram = HistogramValue::new();
        for v in 1..=100 {
            histogram.insert(v as f64, 1);
        }

        let records = reduce(
            &key("h", MetricType::Histogram),
            &AggregateValue::Histogram(histogram),
            &config,
        );

        let find = |name: &str| {
            records
                .iter()
                .find(|r| r.name == name)
                .unwrap_or_else(|| panic!("missing record {name}"))
                .value
        };

        assert_eq!(records.len(), 5);
        assert_eq!(find("h.min"), 1.0);
        assert_eq!(find("h.max"), 100.0);
        assert_eq!(find("h.count"), 100.0);
        assert!((find("h.50percentile") - 50.0).abs() <= 1.0);
        assert!((find("h.99percentile") - 99.0).abs() <= 1.0);
    }

    #[test]
    fn test_empty_histogram_produces_nothing() {
        let records = reduce(
            &key("h", MetricType::Histogram),
            &AggregateValue::Histogram(HistogramValue::new()),
            &ReduceConfig::default(),
        );
        assert!(records.is_empty());
    }

    #[test]
    fn test_status_reduces_to_severity() {
        let records = reduce(
            &key("db", MetricType::Status),
            &AggregateValue::Status(Severity::Critical),
            &ReduceConfig::default(),
        );
        assert_eq!(records[0].value, 2.0);
    }

    #[test]
    fn test_percentile_suffixes() {
        assert_eq!(format_percentile(0.5), "50");
        assert_eq!(format_percentile(0.99), "99");
        assert_eq!(format_percentile(0.999), "99.9");
    }
}
