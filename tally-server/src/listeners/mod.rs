//! Multi-transport listeners feeding the router.
//!
//! For each configured listen URL one listener is constructed. Datagram
//! listeners reuse a preallocated receive buffer; stream listeners frame by
//! newline (metrics) or length prefix (spans). All read loops observe the
//! process-wide cancellation token; datagrams already read are still routed.

use std::io;
use std::sync::Arc;

use tally_config::{Config, ListenAddr};
use tally_statsd::metric;
use tokio_util::sync::CancellationToken;

use crate::import::Importer;
use crate::router::Router;
use crate::spans::Span;
use crate::statsd::ServerCounters;

mod datagram;
mod grpc;
mod stream;
mod tls;

pub use self::tls::make_tls_acceptor;

/// Which protocol an endpoint carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Traffic {
    /// Newline-delimited statsd records.
    Statsd,
    /// Framed span records.
    Spans,
}

/// An error constructing a listener. Listener errors are fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    /// Binding or socket setup failed.
    #[error("could not bind {address}")]
    Bind {
        /// The listen URL that failed.
        address: String,
        #[source]
        source: io::Error,
    },

    /// The address did not resolve to a socket address.
    #[error("could not resolve {0}")]
    Resolve(String),

    /// Abstract-namespace sockets are not supported on this platform.
    #[error("abstract unix sockets are not supported on this platform: {0}")]
    AbstractUnsupported(String),

    /// TLS material did not parse or build.
    #[error("invalid TLS configuration: {0}")]
    Tls(String),

    /// Parallel readers require SO_REUSEPORT, which this platform lacks.
    #[error("num_readers > 1 is not supported on this platform")]
    ReusePortUnsupported,
}

/// Spawns all configured listeners.
///
/// Returns their task handles; the tasks finish when `cancel` fires.
pub fn spawn_listeners(
    config: &Config,
    router: Router,
    importer: Importer,
    cancel: CancellationToken,
) -> Result<Vec<tokio::task::JoinHandle<()>>, ListenerError> {
    let mut tasks = Vec::new();

    let endpoints = config
        .statsd_listen_addresses
        .iter()
        .map(|addr| (addr, Traffic::Statsd))
        .chain(
            config
                .ssf_listen_addresses
                .iter()
                .map(|addr| (addr, Traffic::Spans)),
        );

    let acceptor = match (&config.tls_key, &config.tls_certificate) {
        (Some(key), Some(cert)) => Some(Arc::new(make_tls_acceptor(
            key,
            cert,
            config.tls_authority_certificate.as_deref(),
        )?)),
        _ => None,
    };

    for (addr, traffic) in endpoints {
        tally_log::info!("listening on {addr}");

        match addr {
            ListenAddr::Udp(authority) => {
                tasks.extend(datagram::spawn_udp(
                    authority,
                    traffic,
                    config,
                    router.clone(),
                    cancel.clone(),
                )?);
            }
            ListenAddr::UnixDatagram(path) => {
                tasks.extend(datagram::spawn_unixgram(
                    path,
                    traffic,
                    config,
                    router.clone(),
                    cancel.clone(),
                )?);
            }
            ListenAddr::Tcp(authority) => {
                tasks.push(stream::spawn_tcp(
                    authority,
                    traffic,
                    config,
                    router.clone(),
                    acceptor.clone(),
                    cancel.clone(),
                )?);
            }
            ListenAddr::UnixStream(path) => {
                tasks.push(stream::spawn_unix(
                    path,
                    traffic,
                    config,
                    router.clone(),
                    cancel.clone(),
                )?);
            }
            ListenAddr::Grpc(authority) => {
                tasks.push(grpc::spawn_grpc(
                    authority,
                    router.clone(),
                    importer.clone(),
                    cancel.clone(),
                )?);
            }
        }
    }

    Ok(tasks)
}

/// Routes the contents of one datagram.
///
/// A statsd datagram longer than `metric_max_length` is cut at the limit with
/// a counted error; a span datagram is exactly one frame body.
pub(crate) fn dispatch_datagram(
    router: &Router,
    traffic: Traffic,
    payload: &[u8],
    max_length: usize,
    scheme: &'static str,
) {
    match traffic {
        Traffic::Statsd => {
            let payload = if payload.len() > max_length {
                metric!(
                    counter(ServerCounters::TruncatedFrames) += 1,
                    listener = scheme,
                );
                &payload[..max_length]
            } else {
                payload
            };

            router.route_statsd(payload, scheme);
        }
        Traffic::Spans => match Span::decode_frame(payload) {
            Ok(span) => router.route_span(span, scheme),
            Err(error) => {
                metric!(
                    counter(ServerCounters::InvalidSpans) += 1,
                    cause = error.cause(),
                );
            }
        },
    }
}
