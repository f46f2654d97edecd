//! Wire codec for forwarding pre-reduction aggregates to a global node.
//!
//! A payload carries all forwarded aggregates of one flush interval:
//!
//! ```text
//! +---------+----------------------+-----+----------------------+
//! | version | u32 len | record ... | ... | u32 len | record ... |
//! +---------+----------------------+-----+----------------------+
//! ```
//!
//! Record bodies are JSON so that mixed builds agree on field layout; the
//! leading version byte gates structural changes. A node receiving an unknown
//! version rejects the payload instead of guessing, so mixed-version fleets
//! degrade to dropped forward intervals rather than corrupt merges.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::aggregate::AggregateValue;
use crate::aggregator::AggregateState;
use crate::protocol::{MetricKey, MetricScope, TagSet};

/// The current forward payload schema version.
pub const FORWARD_SCHEMA_VERSION: u8 = 1;

/// One forwarded aggregate in pre-reduction form.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ForwardRecord {
    /// The metric name.
    pub name: String,
    /// The canonical tag set.
    pub tags: TagSet,
    /// The scope recorded on the originating node.
    pub scope: MetricScope,
    /// The mergeable aggregate state; carries the metric type.
    #[serde(flatten)]
    pub value: AggregateValue,
}

impl ForwardRecord {
    /// Builds a forward record from an aggregator entry.
    pub fn new(key: MetricKey, state: AggregateState) -> Self {
        Self {
            name: key.name,
            tags: key.tags,
            scope: state.scope,
            value: state.value,
        }
    }

    /// Splits this record back into an aggregator entry.
    pub fn into_parts(self) -> (MetricKey, AggregateState) {
        let key = MetricKey {
            name: self.name,
            tags: self.tags,
            ty: self.value.ty(),
        };
        let state = AggregateState {
            scope: self.scope,
            value: self.value,
        };
        (key, state)
    }
}

/// An error decoding a forward payload.
#[derive(Debug, Error)]
pub enum ForwardDecodeError {
    /// The payload was produced by an incompatible build.
    #[error("unsupported forward schema version {0}")]
    VersionMismatch(u8),
    /// The payload ended in the middle of a frame.
    #[error("truncated forward payload")]
    Truncated,
    /// A record body did not deserialize.
    #[error("malformed forward record")]
    Record(#[from] serde_json::Error),
}

/// Encodes one interval's forwarded aggregates into a self-delimited payload.
pub fn encode_payload(records: &[ForwardRecord]) -> Vec<u8> {
    let mut payload = vec![FORWARD_SCHEMA_VERSION];

    for record in records {
        let body = serde_json::to_vec(record).expect("forward records always serialize");
        payload.extend_from_slice(&(body.len() as u32).to_be_bytes());
        payload.extend_from_slice(&body);
    }

    payload
}

/// Decodes a forward payload produced by [`encode_payload`].
pub fn decode_payload(payload: &[u8]) -> Result<Vec<ForwardRecord>, ForwardDecodeError> {
    let (&version, mut rest) = payload.split_first().ok_or(ForwardDecodeError::Truncated)?;

    if version != FORWARD_SCHEMA_VERSION {
        return Err(ForwardDecodeError::VersionMismatch(version));
    }

    let mut records = Vec::new();

    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(ForwardDecodeError::Truncated);
        }

        let (len_bytes, tail) = rest.split_at(4);
        let len = u32::from_be_bytes(len_bytes.try_into().unwrap()) as usize;

        if tail.len() < len {
            return Err(ForwardDecodeError::Truncated);
        }

        let (body, tail) = tail.split_at(len);
        records.push(serde_json::from_slice(body)?);
        rest = tail;
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{HistogramValue, SetValue};
    use crate::protocol::Metric;

    fn forwarded_histogram() -> ForwardRecord {
        let mut histogram = HistogramValue::new();
        for v in [1.0, 2.0, 3.0, 5.0, 8.0, 13.0] {
            histogram.insert(v, 1);
        }

        let metric = Metric::parse(b"latency:1|ms|#service:api,region:us").unwrap();
        let (key, ..) = metric.into_parts();

        ForwardRecord {
            name: key.name,
            tags: key.tags,
            scope: MetricScope::Global,
            value: AggregateValue::Histogram(histogram),
        }
    }

    #[test]
    fn test_round_trip_is_identical() {
        let mut set = SetValue::new();
        set.insert("a");
        set.insert("b");

        let records = vec![
            forwarded_histogram(),
            ForwardRecord {
                name: "users".to_owned(),
                tags: TagSet::new(),
                scope: MetricScope::Global,
                value: AggregateValue::Set(set),
            },
        ];

        let decoded = decode_payload(&encode_payload(&records)).unwrap();
        assert_eq!(decoded, records);
    }

    #[test]
    fn test_round_trip_preserves_quantiles() {
        let record = forwarded_histogram();
        let decoded = decode_payload(&encode_payload(&[record.clone()])).unwrap();

        let (original, restored) = match (&record.value, &decoded[0].value) {
            (AggregateValue::Histogram(a), AggregateValue::Histogram(b)) => (a, b),
            _ => unreachable!(),
        };

        assert_eq!(original.quantile(0.5), restored.quantile(0.5));
        assert_eq!(original.count(), restored.count());
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let mut payload = encode_payload(&[forwarded_histogram()]);
        payload[0] = 99;

        match decode_payload(&payload) {
            Err(ForwardDecodeError::VersionMismatch(99)) => (),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_truncated_payload_is_rejected() {
        let payload = encode_payload(&[forwarded_histogram()]);
        let cut = &payload[..payload.len() - 3];

        assert!(matches!(
            decode_payload(cut),
            Err(ForwardDecodeError::Truncated)
        ));
    }

    #[test]
    fn test_empty_payload() {
        let payload = encode_payload(&[]);
        assert_eq!(decode_payload(&payload).unwrap(), Vec::new());
        assert!(matches!(
            decode_payload(&[]),
            Err(ForwardDecodeError::Truncated)
        ));
    }

    #[test]
    fn test_record_into_parts_round_trip() {
        let record = forwarded_histogram();
        let (key, state) = record.clone().into_parts();
        assert_eq!(ForwardRecord::new(key, state), record);
    }
}
