//! The span record and its framed wire representation.
//!
//! Spans arrive either as length-prefixed frames on datagram and stream
//! listeners, or as protobuf messages on the gRPC listener. Both decode into
//! [`Span`], which is validated once before entering the span channel and never
//! persisted across flushes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The version byte carried by every span frame.
pub const SPAN_FRAME_VERSION: u8 = 1;

/// A structured span record.
///
/// Ids are signed 64-bit integers; sinks that emit JSON re-encode them as
/// decimal strings to avoid float rounding in consumers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// The id shared by all spans of one trace.
    pub trace_id: i64,
    /// The id of this span, non-zero.
    pub id: i64,
    /// The id of the parent span, or `0` for a root span.
    #[serde(default)]
    pub parent_id: i64,
    /// Start of the span in nanoseconds since the epoch.
    pub start_timestamp: i64,
    /// End of the span in nanoseconds since the epoch; never before the start.
    pub end_timestamp: i64,
    /// Marks an operationally significant span, exempt from sampling.
    #[serde(default)]
    pub indicator: bool,
    /// Marks a failed operation.
    #[serde(default)]
    pub error: bool,
    /// The service that emitted the span.
    pub service: String,
    /// The operation name.
    pub name: String,
    /// Free-form tags.
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

impl Span {
    /// The span duration in nanoseconds.
    pub fn duration_ns(&self) -> i64 {
        self.end_timestamp - self.start_timestamp
    }
}

/// Why a span was rejected by validation.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum SpanValidationError {
    /// The span id is zero.
    #[error("span is missing an id")]
    MissingId,
    /// The service is empty.
    #[error("span is missing a service")]
    MissingService,
    /// The operation name is empty.
    #[error("span is missing a name")]
    MissingName,
    /// The operation name exceeds `trace_max_length_bytes`.
    #[error("span name is too long")]
    NameTooLong,
    /// A timestamp is zero or negative.
    #[error("span has invalid timestamps")]
    InvalidTimestamps,
    /// The span ends before it starts.
    #[error("span has a negative duration")]
    NegativeDuration,
}

impl SpanValidationError {
    /// A stable tag value identifying the cause.
    pub fn cause(&self) -> &'static str {
        match self {
            Self::MissingId => "missing_id",
            Self::MissingService => "missing_service",
            Self::MissingName => "missing_name",
            Self::NameTooLong => "name_too_long",
            Self::InvalidTimestamps => "invalid_timestamps",
            Self::NegativeDuration => "negative_duration",
        }
    }
}

/// Validates a span before it enters the span channel.
///
/// A trace id of zero is permitted; such spans bypass sampling downstream.
pub fn validate_span(span: &Span, max_name_bytes: usize) -> Result<(), SpanValidationError> {
    if span.id == 0 {
        return Err(SpanValidationError::MissingId);
    }

    if span.service.is_empty() {
        return Err(SpanValidationError::MissingService);
    }

    if span.name.is_empty() {
        return Err(SpanValidationError::MissingName);
    }

    if span.name.len() > max_name_bytes {
        return Err(SpanValidationError::NameTooLong);
    }

    if span.start_timestamp <= 0 || span.end_timestamp <= 0 {
        return Err(SpanValidationError::InvalidTimestamps);
    }

    if span.duration_ns() < 0 {
        return Err(SpanValidationError::NegativeDuration);
    }

    Ok(())
}

/// An error decoding a span frame.
#[derive(Debug, Error)]
pub enum SpanFrameError {
    /// The frame was produced by an incompatible build.
    #[error("unsupported span frame version {0}")]
    UnknownVersion(u8),
    /// The frame ended before its declared length.
    #[error("truncated span frame")]
    Truncated,
    /// The frame body did not deserialize.
    #[error("malformed span frame")]
    Malformed(#[from] serde_json::Error),
}

impl SpanFrameError {
    /// A stable tag value identifying the cause.
    pub fn cause(&self) -> &'static str {
        match self {
            Self::UnknownVersion(_) => "unknown_version",
            Self::Truncated => "truncated",
            Self::Malformed(_) => "malformed",
        }
    }
}

impl Span {
    /// Encodes this span into a self-delimited frame.
    ///
    /// ```text
    /// +---------+---------+------------------+
    /// | u32 len | version | json span record |
    /// +---------+---------+------------------+
    /// ```
    ///
    /// The length covers the version byte and the body.
    pub fn encode_frame(&self) -> Vec<u8> {
        let body = serde_json::to_vec(self).expect("spans always serialize");
        let mut frame = Vec::with_capacity(body.len() + 5);
        frame.extend_from_slice(&(body.len() as u32 + 1).to_be_bytes());
        frame.push(SPAN_FRAME_VERSION);
        frame.extend_from_slice(&body);
        frame
    }

    /// Decodes a frame body, the part after the length prefix.
    ///
    /// Datagram listeners receive exactly one body per datagram, without the
    /// length prefix.
    pub fn decode_frame(body: &[u8]) -> Result<Self, SpanFrameError> {
        let (&version, body) = body.split_first().ok_or(SpanFrameError::Truncated)?;

        if version != SPAN_FRAME_VERSION {
            return Err(SpanFrameError::UnknownVersion(version));
        }

        Ok(serde_json::from_slice(body)?)
    }

    /// Extracts one length-prefixed frame from a stream buffer.
    ///
    /// Returns the decoded span and the number of bytes consumed, or `None` if
    /// the buffer does not yet hold a complete frame.
    pub fn decode_stream(
        buffer: &[u8],
        max_frame_bytes: usize,
    ) -> Option<(Result<Self, SpanFrameError>, usize)> {
        if buffer.len() < 4 {
            return None;
        }

        let len = u32::from_be_bytes(buffer[..4].try_into().unwrap()) as usize;

        if len > max_frame_bytes {
            // Poisoned stream; surface as truncated and let the caller drop
            // the connection.
            return Some((Err(SpanFrameError::Truncated), buffer.len()));
        }

        if buffer.len() < 4 + len {
            return None;
        }

        let body = &buffer[4..4 + len];
        Some((Self::decode_frame(body), 4 + len))
    }
}

/// A well-formed span for tests.
#[cfg(test)]
pub(crate) fn test_span() -> Span {
    Span {
        trace_id: 42,
        id: 7,
        parent_id: 1,
        start_timestamp: 1_500_000_000_000_000_000,
        end_timestamp: 1_500_000_000_500_000_000,
        indicator: false,
        error: false,
        service: "api".to_owned(),
        name: "GET /users".to_owned(),
        tags: BTreeMap::new(),
    }
}
