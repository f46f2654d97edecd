//! The tally daemon: listeners, aggregation pipeline, flush coordination and
//! sinks.
//!
//! Data flows strictly forward through the server:
//!
//! ```text
//! listeners -> parsers -> router -> workers -> flush -> sinks
//!                                \-> span channel -> span workers -> span sinks
//! ```
//!
//! The [`service`] module wires everything together; the remaining modules
//! each own one stage of the pipeline.

pub mod endpoints;
pub mod flush;
pub mod forwarder;
pub mod import;
pub mod listeners;
pub mod router;
pub mod self_metrics;
pub mod service;
pub mod sinks;
pub mod spans;
pub mod statsd;
pub mod workers;

/// Generated protobuf types for the gRPC ingest and forward services.
pub mod pb {
    tonic::include_proto!("tally.v1");
}

pub use self::service::{run, ServerError, ServiceState};
