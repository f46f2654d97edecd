use std::collections::hash_map::{Entry, HashMap};
use std::mem;

use serde::{Deserialize, Serialize};

use crate::aggregate::AggregateValue;
use crate::protocol::{Metric, MetricKey, MetricScope};

/// An aggregate together with its scope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AggregateState {
    /// Whether this aggregate reduces locally, globally, or both.
    pub scope: MetricScope,
    /// The accumulated value.
    pub value: AggregateValue,
}

/// A collector of metric samples for one flush window.
///
/// Each metric worker owns exactly one `Aggregator`. Samples are dispatched
/// into aggregates keyed by [`MetricKey`]; on flush, the whole live map is
/// swapped out atomically with [`take`](Self::take), so ingestion is never
/// blocked by a flush in progress.
#[derive(Debug, Default)]
pub struct Aggregator {
    aggregates: HashMap<MetricKey, AggregateState>,
}

impl Aggregator {
    /// Creates an empty aggregator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of aggregates currently held.
    pub fn len(&self) -> usize {
        self.aggregates.len()
    }

    /// Returns `true` if no aggregates are held.
    pub fn is_empty(&self) -> bool {
        self.aggregates.is_empty()
    }

    /// Applies a single metric sample.
    ///
    /// The first sample of an identity determines the aggregate's scope.
    /// Returns `false` on a type conflict, which routing by identity rules out
    /// for well-formed input.
    pub fn insert_metric(&mut self, metric: Metric) -> bool {
        let (key, value, sample_rate, scope) = metric.into_parts();

        match self.aggregates.entry(key) {
            Entry::Occupied(mut entry) => entry
                .get_mut()
                .value
                .apply(value, sample_rate)
                .is_ok(),
            Entry::Vacant(entry) => {
                entry.insert(AggregateState {
                    scope,
                    value: AggregateValue::from_sample(value, sample_rate),
                });
                true
            }
        }
    }

    /// Merges a pre-reduction aggregate, as received from a local node.
    ///
    /// Returns `false` on a type conflict with an existing aggregate.
    pub fn merge(&mut self, key: MetricKey, state: AggregateState) -> bool {
        match self.aggregates.entry(key) {
            Entry::Occupied(mut entry) => entry.get_mut().value.merge(state.value).is_ok(),
            Entry::Vacant(entry) => {
                entry.insert(state);
                true
            }
        }
    }

    /// Atomically swaps the live map for an empty one and returns the snapshot.
    ///
    /// This is the only serialization point between ingestion and flush:
    /// samples applied before the swap belong to the returned snapshot, samples
    /// applied after belong to the next window.
    pub fn take(&mut self) -> AggregatorSnapshot {
        AggregatorSnapshot {
            aggregates: mem::take(&mut self.aggregates),
        }
    }
}

/// The owned contents of one flush window, detached from ingestion.
#[derive(Debug, Default)]
pub struct AggregatorSnapshot {
    aggregates: HashMap<MetricKey, AggregateState>,
}

impl AggregatorSnapshot {
    /// Returns the number of aggregates in the snapshot.
    pub fn len(&self) -> usize {
        self.aggregates.len()
    }

    /// Returns `true` if the snapshot holds no aggregates.
    pub fn is_empty(&self) -> bool {
        self.aggregates.is_empty()
    }

    /// Iterates over the snapshot contents.
    pub fn iter(&self) -> impl Iterator<Item = (&MetricKey, &AggregateState)> {
        self.aggregates.iter()
    }

    /// Merges another snapshot into this one, combining aggregates of equal
    /// identity.
    pub fn merge(&mut self, other: AggregatorSnapshot) {
        for (key, state) in other.aggregates {
            match self.aggregates.entry(key) {
                Entry::Occupied(mut entry) => {
                    entry.get_mut().value.merge(state.value).ok();
                }
                Entry::Vacant(entry) => {
                    entry.insert(state);
                }
            }
        }
    }
}

impl IntoIterator for AggregatorSnapshot {
    type Item = (MetricKey, AggregateState);
    type IntoIter = std::collections::hash_map::IntoIter<MetricKey, AggregateState>;

    fn into_iter(self) -> Self::IntoIter {
        self.aggregates.into_iter()
    }
}

impl FromIterator<(MetricKey, AggregateState)> for AggregatorSnapshot {
    fn from_iter<I: IntoIterator<Item = (MetricKey, AggregateState)>>(iter: I) -> Self {
        Self {
            aggregates: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::MetricValue;

    fn counter(name: &str, value: f64) -> Metric {
        Metric::parse(format!("{name}:{value}|c").as_bytes()).unwrap()
    }

    #[test]
    fn test_insert_accumulates_by_identity() {
        let mut aggregator = Aggregator::new();
        aggregator.insert_metric(counter("foo", 1.0));
        aggregator.insert_metric(counter("foo", 2.0));
        aggregator.insert_metric(counter("bar", 1.0));

        assert_eq!(aggregator.len(), 2);

        let snapshot = aggregator.take();
        let foo = snapshot
            .iter()
            .find(|(key, _)| key.name == "foo")
            .map(|(_, state)| state.value.clone())
            .unwrap();
        assert_eq!(foo, AggregateValue::Counter(3.0));
    }

    #[test]
    fn test_take_resets_live_map() {
        let mut aggregator = Aggregator::new();
        aggregator.insert_metric(counter("foo", 1.0));

        let snapshot = aggregator.take();
        assert_eq!(snapshot.len(), 1);
        assert!(aggregator.is_empty());

        // Samples applied after the swap belong to the next window.
        aggregator.insert_metric(counter("foo", 5.0));
        let next = aggregator.take();
        let foo = next
            .iter()
            .map(|(_, state)| state.value.clone())
            .next()
            .unwrap();
        assert_eq!(foo, AggregateValue::Counter(5.0));
    }

    #[test]
    fn test_two_takes_without_ingest_are_empty() {
        let mut aggregator = Aggregator::new();
        aggregator.insert_metric(counter("foo", 1.0));

        assert_eq!(aggregator.take().len(), 1);
        assert!(aggregator.take().is_empty());
    }

    #[test]
    fn test_merge_combines_sets() {
        let mut aggregator = Aggregator::new();
        let member = Metric::parse(b"users:a|s").unwrap();
        aggregator.insert_metric(member);

        let other = Metric::parse(b"users:b|s").unwrap();
        let (key, value, rate, scope) = other.into_parts();
        let state = AggregateState {
            scope,
            value: AggregateValue::from_sample(value, rate),
        };
        assert!(aggregator.merge(key, state));

        let snapshot = aggregator.take();
        let entry = snapshot.iter().next().unwrap();
        match &entry.1.value {
            AggregateValue::Set(set) => assert_eq!(set.count(), 2),
            other => panic!("unexpected aggregate {other:?}"),
        }
    }
}
