use std::fmt;
use std::hash::{Hash, Hasher};

use fnv::FnvHasher;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

/// The type of a [`Metric`], part of its identity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    /// Counts instances of an event, scaled by the inverse sample rate.
    Counter,
    /// Stores the last reported value.
    Gauge,
    /// Builds a statistical distribution over reported values.
    ///
    /// Timers are histograms: the wire types `h` and `ms` both map here.
    Histogram,
    /// Counts unique members.
    Set,
    /// Tracks the most recent severity of a service check.
    Status,
}

impl MetricType {
    /// The default [`MetricScope`] for metrics of this type.
    ///
    /// Histograms and sets require a single view of the data to reduce
    /// correctly, so they default to global. All other types reduce locally.
    pub fn default_scope(self) -> MetricScope {
        match self {
            Self::Histogram | Self::Set => MetricScope::Global,
            Self::Counter | Self::Gauge | Self::Status => MetricScope::Local,
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
            Self::Set => "set",
            Self::Status => "status",
        };
        f.write_str(name)
    }
}

/// Severity of a [status](MetricType::Status) metric.
///
/// The numeric representation follows the nagios convention used by service
/// checks on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// The check passed.
    Ok,
    /// The check is degraded.
    Warning,
    /// The check failed.
    Critical,
    /// The check state could not be determined.
    Unknown,
}

impl Severity {
    /// Parses a severity from its wire digit.
    pub fn from_digit(digit: u8) -> Option<Self> {
        match digit {
            0 => Some(Self::Ok),
            1 => Some(Self::Warning),
            2 => Some(Self::Critical),
            3 => Some(Self::Unknown),
            _ => None,
        }
    }

    /// The numeric value emitted when a status aggregate is flushed.
    pub fn as_f64(self) -> f64 {
        self as u8 as f64
    }
}

/// Whether an aggregate reduces on this node, on a global node, or both.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricScope {
    /// Reduced and flushed to sinks on the receiving node.
    Local,
    /// Shipped to the global node in pre-reduction form; not flushed locally.
    Global,
    /// Both flushed locally and shipped to the global node.
    Mixed,
}

impl MetricScope {
    /// Returns `true` if aggregates with this scope are forwarded to a global node.
    pub fn is_forwarded(self) -> bool {
        matches!(self, Self::Global | Self::Mixed)
    }

    /// Returns `true` if aggregates with this scope are reduced locally.
    pub fn is_reduced_locally(self) -> bool {
        matches!(self, Self::Local | Self::Mixed)
    }
}

/// A canonicalized set of tags.
///
/// Tags are plain strings, either `key:value` pairs or bare markers. The set is
/// kept sorted and deduplicated so that equal tag multisets compare and hash
/// byte-identically regardless of submission order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TagSet(SmallVec<[String; 4]>);

impl TagSet {
    /// Creates an empty tag set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a canonical tag set from arbitrary tags.
    pub fn from_tags<I, S>(tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = Self::new();
        for tag in tags {
            set.insert(tag.into());
        }
        set
    }

    /// Inserts a tag, maintaining canonical order. Duplicates are dropped.
    pub fn insert(&mut self, tag: String) {
        if tag.is_empty() {
            return;
        }

        if let Err(index) = self.0.binary_search(&tag) {
            self.0.insert(index, tag);
        }
    }

    /// Removes all tags for which `f` returns `false`.
    pub fn retain(&mut self, f: impl FnMut(&String) -> bool) {
        let mut f = f;
        self.0.retain(|tag| f(tag));
    }

    /// Iterates over the tags in canonical order.
    pub fn iter(&self) -> std::slice::Iter<'_, String> {
        self.0.iter()
    }

    /// Returns the number of tags.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the set contains no tags.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for TagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, tag) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            f.write_str(tag)?;
        }
        Ok(())
    }
}

impl<S: Into<String>> FromIterator<S> for TagSet {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self::from_tags(iter)
    }
}

/// The identity of a metric: name, canonical tags and type.
///
/// Identity determines the worker shard through a stable hash, so two samples
/// of the same metric always land on the same worker.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MetricKey {
    /// The metric name, truncated before hashing.
    pub name: String,
    /// The canonical tag set.
    pub tags: TagSet,
    /// The metric type.
    pub ty: MetricType,
}

impl MetricKey {
    /// Returns a stable 64-bit FNV hash of this identity.
    ///
    /// The hash is identical across processes and runs, which makes shard
    /// assignment reproducible.
    pub fn hash64(&self) -> u64 {
        let mut hasher = FnvHasher::default();
        Hash::hash(self, &mut hasher);
        hasher.finish()
    }

    /// Returns the worker shard for this identity.
    pub fn shard(&self, num_workers: usize) -> usize {
        (self.hash64() % num_workers.max(1) as u64) as usize
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|#{}", self.name, self.ty, self.tags)
    }
}

/// Hashes a set member into its 32-bit wire representation.
///
/// Set aggregates never store the original member, only this FNV-1a hash.
pub fn hash_set_value(value: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in value.as_bytes() {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// The value of a single metric sample.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MetricValue {
    /// A counter increment.
    Counter(f64),
    /// A gauge snapshot.
    Gauge(f64),
    /// A histogram or timer sample.
    Histogram(f64),
    /// A set member in its original string form.
    Set(String),
    /// A service check severity.
    Status(Severity),
}

impl MetricValue {
    /// Returns the type of this value.
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

/// An error classifying why a metric line was rejected.
///
/// Rejected lines are dropped and counted by cause; the hot path never
/// propagates them further.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum ParseMetricError {
    /// The record was cut off before its end.
    #[error("truncated metric")]
    Truncated,
    /// The record does not follow the line protocol.
    #[error("invalid metric syntax")]
    BadSyntax,
    /// The metric type is not one of `c`, `g`, `h`, `ms`, `s`.
    #[error("unknown metric type")]
    UnknownType,
    /// The sample rate is outside of `(0, 1]`.
    #[error("unsupported sample rate")]
    BadSampleRate,
}

impl ParseMetricError {
    /// A stable tag value identifying the cause.
    pub fn cause(&self) -> &'static str {
        match self {
            Self::Truncated => "truncated",
            Self::BadSyntax => "bad_syntax",
            Self::UnknownType => "unknown_type",
            Self::BadSampleRate => "bad_sample_rate",
        }
    }
}

/// A single metric sample after parsing.
#[derive(Clone, Debug, PartialEq)]
pub struct Metric {
    /// The metric name.
    pub name: String,
    /// The canonical tag set.
    pub tags: TagSet,
    /// The sample value; also determines the metric type.
    pub value: MetricValue,
    /// The client-side sample rate in `(0, 1]`.
    ///
    /// Counters and histograms scale by the inverse rate when aggregated.
    pub sample_rate: f64,
    /// The aggregation scope for this sample.
    pub scope: MetricScope,
}

impl Metric {
    /// Creates a metric with the default scope for its type.
    pub fn new(name: impl Into<String>, tags: TagSet, value: MetricValue) -> Self {
        let scope = value.ty().default_scope();
        Self {
            name: name.into(),
            tags,
            value,
            sample_rate: 1.0,
            scope,
        }
    }

    /// Returns the type of this metric.
    pub fn ty(&self) -> MetricType {
        self.value.ty()
    }

    /// Splits this metric into its identity and sample parts.
    pub fn into_parts(self) -> (MetricKey, MetricValue, f64, MetricScope) {
        let ty = self.value.ty();
        let key = MetricKey {
            name: self.name,
            tags: self.tags,
            ty,
        };
        (key, self.value, self.sample_rate, self.scope)
    }

    /// Truncates the metric name to at most `max_bytes`, on a character boundary.
    ///
    /// Must run before the identity is hashed so that all samples of an
    /// over-long name collapse onto the same aggregate. Returns `true` if the
    /// name was shortened.
    pub fn truncate_name(&mut self, max_bytes: usize) -> bool {
        if self.name.len() <= max_bytes {
            return false;
        }

        let mut end = max_bytes;
        while !self.name.is_char_boundary(end) {
            end -= 1;
        }
        self.name.truncate(end);
        true
    }

    /// Parses a single line of the metric protocol.
    ///
    /// ```text
    /// <name>:<value>|<type>[|@<rate>][|#<tag>,<tag>:<value>]
    /// _sc|<name>|<status-digit>[|#<tags>]
    /// ```
    pub fn parse(slice: &[u8]) -> Result<Self, ParseMetricError> {
        let string = std::str::from_utf8(slice).map_err(|_| ParseMetricError::BadSyntax)?;
        Self::parse_str(string.trim_end_matches('\r'))
    }

    /// Parses every newline-delimited record in `slice`, skipping empty lines.
    ///
    /// It is possible to continue consuming the iterator after `Err` is
    /// yielded.
    pub fn parse_all(slice: &[u8]) -> ParseMetrics<'_> {
        ParseMetrics { slice }
    }

    fn parse_str(line: &str) -> Result<Self, ParseMetricError> {
        if let Some(rest) = line.strip_prefix("_sc|") {
            return Self::parse_service_check(rest);
        }

        let mut sections = line.split('|');

        let (name, value_str) = sections
            .next()
            .and_then(|s| s.split_once(':'))
            .ok_or(ParseMetricError::BadSyntax)?;

        if name.is_empty() || value_str.is_empty() {
            return Err(ParseMetricError::BadSyntax);
        }

        let ty = sections.next().ok_or(ParseMetricError::Truncated)?;
        let value = match ty {
            "c" => MetricValue::Counter(parse_float(value_str)?),
            "g" => MetricValue::Gauge(parse_float(value_str)?),
            "h" | "ms" => MetricValue::Histogram(parse_float(value_str)?),
            "s" => MetricValue::Set(value_str.to_owned()),
            "" => return Err(ParseMetricError::Truncated),
            _ => return Err(ParseMetricError::UnknownType),
        };

        let mut metric = Metric::new(name, TagSet::new(), value);

        for section in sections {
            match section.as_bytes().first() {
                Some(b'@') => {
                    let rate: f64 = section[1..]
                        .parse()
                        .map_err(|_| ParseMetricError::BadSampleRate)?;
                    if !(rate > 0.0 && rate <= 1.0) {
                        return Err(ParseMetricError::BadSampleRate);
                    }
                    metric.sample_rate = rate;
                }
                Some(b'#') => {
                    metric.tags = parse_tags(&section[1..]);
                }
                _ => return Err(ParseMetricError::BadSyntax),
            }
        }

        Ok(metric)
    }

    /// Parses the service-check form carrying a [status](MetricType::Status).
    fn parse_service_check(rest: &str) -> Result<Self, ParseMetricError> {
        let mut sections = rest.split('|');

        let name = sections.next().ok_or(ParseMetricError::BadSyntax)?;
        if name.is_empty() {
            return Err(ParseMetricError::BadSyntax);
        }

        let digit = sections.next().ok_or(ParseMetricError::Truncated)?;
        let severity = digit
            .parse::<u8>()
            .ok()
            .and_then(Severity::from_digit)
            .ok_or(ParseMetricError::BadSyntax)?;

        let mut metric = Metric::new(name, TagSet::new(), MetricValue::Status(severity));

        for section in sections {
            if let Some(tags) = section.strip_prefix('#') {
                metric.tags = parse_tags(tags);
            }
        }

        Ok(metric)
    }
}

fn parse_float(string: &str) -> Result<f64, ParseMetricError> {
    let value: f64 = string.parse().map_err(|_| ParseMetricError::BadSyntax)?;
    if value.is_finite() {
        Ok(value)
    } else {
        Err(ParseMetricError::BadSyntax)
    }
}

/// Parses tags in the format `tag1,tag2:value` into a canonical [`TagSet`].
fn parse_tags(string: &str) -> TagSet {
    TagSet::from_tags(string.split(',').filter(|t| !t.is_empty()))
}

/// Iterator over parsed metrics returned from [`Metric::parse_all`].
#[derive(Clone, Debug)]
pub struct ParseMetrics<'a> {
    slice: &'a [u8],
}

impl Iterator for ParseMetrics<'_> {
    type Item = Result<Metric, ParseMetricError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.slice.is_empty() {
                return None;
            }

            let mut split = self.slice.splitn(2, |&b| b == b'\n');
            let current = split.next()?;
            self.slice = split.next().unwrap_or_default();

            if !current.is_empty() {
                return Some(Metric::parse(current));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_counter() {
        let metric = Metric::parse(b"foo:42|c").unwrap();
        assert_eq!(metric.name, "foo");
        assert_eq!(metric.value, MetricValue::Counter(42.0));
        assert_eq!(metric.sample_rate, 1.0);
        assert_eq!(metric.scope, MetricScope::Local);
    }

    #[test]
    fn test_parse_timer_is_histogram() {
        let metric = Metric::parse(b"latency:57.5|ms").unwrap();
        assert_eq!(metric.ty(), MetricType::Histogram);
        assert_eq!(metric.scope, MetricScope::Global);

        let metric = Metric::parse(b"latency:57.5|h").unwrap();
        assert_eq!(metric.ty(), MetricType::Histogram);
    }

    #[test]
    fn test_parse_sample_rate() {
        let metric = Metric::parse(b"foo:1|c|@0.25").unwrap();
        assert_eq!(metric.sample_rate, 0.25);

        assert_eq!(
            Metric::parse(b"foo:1|c|@0"),
            Err(ParseMetricError::BadSampleRate)
        );
        assert_eq!(
            Metric::parse(b"foo:1|c|@1.5"),
            Err(ParseMetricError::BadSampleRate)
        );
    }

    #[test]
    fn test_parse_tags_canonical_order() {
        let a = Metric::parse(b"foo:1|c|#b:2,a:1,c").unwrap();
        let b = Metric::parse(b"foo:1|c|#c,a:1,b:2").unwrap();
        assert_eq!(a.tags, b.tags);
        assert_eq!(a.tags.to_string(), "a:1,b:2,c");
    }

    #[test]
    fn test_parse_duplicate_tags() {
        let metric = Metric::parse(b"foo:1|c|#a:1,a:1,b").unwrap();
        assert_eq!(metric.tags.len(), 2);
    }

    #[test]
    fn test_parse_set() {
        let metric = Metric::parse(b"users:some-user-id|s").unwrap();
        assert_eq!(metric.value, MetricValue::Set("some-user-id".to_owned()));
        assert_eq!(metric.scope, MetricScope::Global);
    }

    #[test]
    fn test_parse_service_check() {
        let metric = Metric::parse(b"_sc|db.reachable|2|#env:prod").unwrap();
        assert_eq!(metric.value, MetricValue::Status(Severity::Critical));
        assert_eq!(metric.tags.to_string(), "env:prod");
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(Metric::parse(b"foo:1"), Err(ParseMetricError::Truncated));
        assert_eq!(Metric::parse(b"foo:1|"), Err(ParseMetricError::Truncated));
        assert_eq!(Metric::parse(b"foo:1|x"), Err(ParseMetricError::UnknownType));
        assert_eq!(Metric::parse(b"foo|c"), Err(ParseMetricError::BadSyntax));
        assert_eq!(Metric::parse(b":1|c"), Err(ParseMetricError::BadSyntax));
        assert_eq!(Metric::parse(b"foo:abc|c"), Err(ParseMetricError::BadSyntax));
    }

    #[test]
    fn test_parse_all_skips_empty_lines() {
        let metrics: Vec<_> = Metric::parse_all(b"foo:1|c\n\nbar:2|c\n").collect();
        assert_eq!(metrics.len(), 2);
        assert!(metrics.iter().all(|m| m.is_ok()));
    }

    #[test]
    fn test_parse_all_continues_after_error() {
        let results: Vec<_> = Metric::parse_all(b"foo:1|c\nbad\nbar:2|c").collect();
        assert_eq!(results.len(), 3);
        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
    }

    #[test]
    fn test_identity_hash_ignores_tag_order() {
        let a = Metric::parse(b"foo:1|c|#x:1,y:2").unwrap();
        let b = Metric::parse(b"foo:1|c|#y:2,x:1").unwrap();
        let (key_a, ..) = a.into_parts();
        let (key_b, ..) = b.into_parts();
        assert_eq!(key_a.hash64(), key_b.hash64());
    }

    #[test]
    fn test_identity_hash_differs_by_type() {
        let counter = Metric::parse(b"foo:1|c").unwrap();
        let histogram = Metric::parse(b"foo:1|h").unwrap();
        let (key_c, ..) = counter.into_parts();
        let (key_h, ..) = histogram.into_parts();
        assert_ne!(key_c.hash64(), key_h.hash64());
    }

    #[test]
    fn test_shard_is_stable() {
        // Shard assignment must never change between releases; these values are
        // load-bearing for multi-worker deployments replaying identical input.
        let metric = Metric::parse(b"api.requests:1|c|#route:index").unwrap();
        let (key, ..) = metric.into_parts();
        assert_eq!(key.shard(4), key.shard(4));

        let again = Metric::parse(b"api.requests:1|c|#route:index").unwrap();
        let (key2, ..) = again.into_parts();
        assert_eq!(key.hash64(), key2.hash64());
    }

    #[test]
    fn test_truncate_name_char_boundary() {
        let mut metric = Metric::new("héllo", TagSet::new(), MetricValue::Counter(1.0));
        // 'é' occupies bytes 1..3; truncating into it must back off to 1.
        assert!(metric.truncate_name(2));
        assert_eq!(metric.name, "h");
    }

    #[test]
    fn test_hash_set_value() {
        // FNV-1a reference vector.
        assert_eq!(hash_set_value(""), 0x811c9dc5);
        assert_ne!(hash_set_value("a"), hash_set_value("b"));
    }
}
