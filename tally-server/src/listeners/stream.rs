//! TCP and unix stream listeners.
//!
//! Metric streams are framed by newline; a frame exceeding `metric_max_length`
//! is cut at the limit with a counted error and the remainder of the line is
//! discarded. Span streams carry length-prefixed frames. TCP endpoints
//! optionally terminate TLS when key material is configured.

use std::sync::Arc;

use tally_config::{Config, UnixPath};
use tally_statsd::metric;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::{TcpListener, UnixListener};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use super::{ListenerError, Traffic};
use crate::router::Router;
use crate::spans::{Span, SpanFrameError};
use crate::statsd::ServerCounters;

/// Spawns the accept loop for one TCP endpoint.
pub fn spawn_tcp(
    authority: &str,
    traffic: Traffic,
    config: &Config,
    router: Router,
    acceptor: Option<Arc<TlsAcceptor>>,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>, ListenerError> {
    let authority = authority.to_owned();
    let settings = StreamSettings::from_config(config, traffic, "tcp");

    Ok(tokio::spawn(async move {
        let listener = match TcpListener::bind(&authority).await {
            Ok(listener) => listener,
            Err(error) => {
                tally_log::error!("could not bind tcp://{authority}: {error}");
                return;
            }
        };

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                accepted = listener.accept() => {
                    let Ok((stream, _peer)) = accepted else { continue };

                    let router = router.clone();
                    let cancel = cancel.clone();
                    let settings = settings.clone();
                    let acceptor = acceptor.clone();

                    tokio::spawn(async move {
                        match acceptor {
                            Some(acceptor) => match acceptor.accept(stream).await {
                                Ok(stream) => {
                                    run_stream(stream, router, settings, cancel).await;
                                }
                                Err(error) => {
                                    tally_log::debug!("tls handshake failed: {error}");
                                }
                            },
                            None => run_stream(stream, router, settings, cancel).await,
                        }
                    });
                }
            }
        }
    }))
}

#[cfg(target_os = "linux")]
fn bind_abstract_listener(
    name: &str,
) -> Result<std::os::unix::net::UnixListener, ListenerError> {
    use std::os::linux::net::SocketAddrExt;

    let bind_error = |source| ListenerError::Bind {
        address: format!("unix:@{name}"),
        source,
    };

    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())
        .map_err(bind_error)?;
    std::os::unix::net::UnixListener::bind_addr(&addr).map_err(bind_error)
}

#[cfg(not(target_os = "linux"))]
fn bind_abstract_listener(
    name: &str,
) -> Result<std::os::unix::net::UnixListener, ListenerError> {
    Err(ListenerError::AbstractUnsupported(name.to_owned()))
}

/// Spawns the accept loop for one unix stream endpoint.
pub fn spawn_unix(
    path: &UnixPath,
    traffic: Traffic,
    config: &Config,
    router: Router,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>, ListenerError> {
    let listener = match path {
        UnixPath::Path(path) => {
            std::fs::remove_file(path).ok();
            let std_listener =
                std::os::unix::net::UnixListener::bind(path).map_err(|source| {
                    ListenerError::Bind {
                        address: format!("unix://{}", path.display()),
                        source,
                    }
                })?;
            std_listener
        }
        UnixPath::Abstract(name) => bind_abstract_listener(name)?,
    };

    listener
        .set_nonblocking(true)
        .map_err(|source| ListenerError::Bind {
            address: format!("unix:{path}"),
            source,
        })?;

    let listener = UnixListener::from_std(listener).map_err(|source| ListenerError::Bind {
        address: format!("unix:{path}"),
        source,
    })?;

    let settings = StreamSettings::from_config(config, traffic, "unix");

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                accepted = listener.accept() => {
                    let Ok((stream, _peer)) = accepted else { continue };

                    let router = router.clone();
                    let cancel = cancel.clone();
                    let settings = settings.clone();

                    tokio::spawn(async move {
                        run_stream(stream, router, settings, cancel).await;
                    });
                }
            }
        }
    }))
}

#[derive(Clone)]
struct StreamSettings {
    traffic: Traffic,
    max_metric_length: usize,
    max_frame_bytes: usize,
    scheme: &'static str,
}

impl StreamSettings {
    fn from_config(config: &Config, traffic: Traffic, scheme: &'static str) -> Self {
        Self {
            traffic,
            max_metric_length: config.metric_max_length,
            // Span frames hold the whole record, not just the name.
            max_frame_bytes: config.trace_max_length_bytes.max(1 << 16),
            scheme,
        }
    }
}

async fn run_stream<S>(stream: S, router: Router, settings: StreamSettings, cancel: CancellationToken)
where
    S: AsyncRead + Unpin,
{
    match settings.traffic {
        Traffic::Statsd => run_metric_stream(stream, router, settings, cancel).await,
        Traffic::Spans => run_span_stream(stream, router, settings, cancel).await,
    }
}

/// Reads newline-framed metric records off one connection.
async fn run_metric_stream<S>(
    mut stream: S,
    router: Router,
    settings: StreamSettings,
    cancel: CancellationToken,
) where
    S: AsyncRead + Unpin,
{
    let mut buffer: Vec<u8> = Vec::with_capacity(settings.max_metric_length * 2);
    let mut chunk = vec![0u8; 8192];
    // Set while discarding the tail of an over-long line.
    let mut discarding = false;

    loop {
        let len = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            result = stream.read(&mut chunk) => match result {
                Ok(0) => break,
                Ok(len) => len,
                Err(_) => break,
            },
        };

        buffer.extend_from_slice(&chunk[..len]);
        drain_lines(&mut buffer, &mut discarding, &router, &settings);
    }

    // The final record may arrive without a trailing newline.
    if !buffer.is_empty() && !discarding {
        router.route_statsd(&buffer, settings.scheme);
    }
}

fn drain_lines(
    buffer: &mut Vec<u8>,
    discarding: &mut bool,
    router: &Router,
    settings: &StreamSettings,
) {
    let mut start = 0;

    while let Some(offset) = buffer[start..].iter().position(|&b| b == b'\n') {
        let line = &buffer[start..start + offset];

        if *discarding {
            // This newline terminates the over-long line whose head was
            // already routed.
            *discarding = false;
        } else if !line.is_empty() {
            router.route_statsd(line, settings.scheme);
        }

        start += offset + 1;
    }

    buffer.drain(..start);

    if !*discarding && buffer.len() > settings.max_metric_length {
        // No newline within the limit: cut the frame here and discard the
        // rest of the line as it streams in.
        metric!(
            counter(ServerCounters::TruncatedFrames) += 1,
            listener = settings.scheme,
        );
        let head: Vec<u8> = buffer[..settings.max_metric_length].to_vec();
        router.route_statsd(&head, settings.scheme);
        buffer.clear();
        *discarding = true;
    } else if *discarding {
        buffer.clear();
    }
}

/// Reads length-prefixed span frames off one connection.
async fn run_span_stream<S>(
    mut stream: S,
    router: Router,
    settings: StreamSettings,
    cancel: CancellationToken,
) where
    S: AsyncRead + Unpin,
{
    let mut buffer: Vec<u8> = Vec::with_capacity(8192);
    let mut chunk = vec![0u8; 8192];

    loop {
        let len = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            result = stream.read(&mut chunk) => match result {
                Ok(0) => break,
                Ok(len) => len,
                Err(_) => break,
            },
        };

        buffer.extend_from_slice(&chunk[..len]);

        loop {
            match Span::decode_stream(&buffer, settings.max_frame_bytes) {
                Some((Ok(span), consumed)) => {
                    buffer.drain(..consumed);
                    router.route_span(span, settings.scheme);
                }
                Some((Err(error), consumed)) => {
                    metric!(
                        counter(ServerCounters::InvalidSpans) += 1,
                        cause = error.cause(),
                    );

                    if matches!(error, SpanFrameError::Truncated) {
                        // The stream is poisoned; drop the connection.
                        return;
                    }

                    buffer.drain(..consumed);
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::spawn_workers;
    use tally_metrics::AggregateValue;

    fn test_router(max_len: usize) -> Router {
        let (span_tx, _span_rx) = flume::bounded(16);
        Router::new(spawn_workers(1), span_tx, max_len, 4096, vec![], &[])
    }

    fn settings(max_len: usize) -> StreamSettings {
        StreamSettings {
            traffic: Traffic::Statsd,
            max_metric_length: max_len,
            max_frame_bytes: 1 << 16,
            scheme: "tcp",
        }
    }

    #[tokio::test]
    async fn test_lines_split_across_reads() {
        let router = test_router(4096);
        let settings = settings(4096);
        let mut buffer = Vec::new();
        let mut discarding = false;

        buffer.extend_from_slice(b"foo:1|c\nba");
        drain_lines(&mut buffer, &mut discarding, &router, &settings);
        assert_eq!(buffer, b"ba");

        buffer.extend_from_slice(b"r:2|c\n");
        drain_lines(&mut buffer, &mut discarding, &router, &settings);
        assert!(buffer.is_empty());

        let snapshot = router.workers()[0].snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 2);
    }

    #[tokio::test]
    async fn test_over_long_line_truncated_and_discarded() {
        let router = test_router(16);
        let settings = settings(16);
        let mut buffer = Vec::new();
        let mut discarding = false;

        // Head of the over-long line is routed truncated, the tail dropped.
        buffer.extend_from_slice(b"exact_len_11:1|cJUNKJUNK");
        drain_lines(&mut buffer, &mut discarding, &router, &settings);
        assert!(discarding);
        assert!(buffer.is_empty());

        // The newline ends the discarded line; the next record parses.
        buffer.extend_from_slice(b"MOREJUNK\nok:1|c\n");
        drain_lines(&mut buffer, &mut discarding, &router, &settings);
        assert!(!discarding);

        let snapshot = router.workers()[0].snapshot().await.unwrap();
        let mut names: Vec<_> = snapshot.into_iter().map(|(k, _)| k.name).collect();
        names.sort();
        assert_eq!(names, ["exact_len_11", "ok"]);
    }

    #[tokio::test]
    async fn test_tcp_end_to_end() {
        use tokio::io::AsyncWriteExt;

        let router = test_router(4096);
        let cancel = CancellationToken::new();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let router2 = router.clone();
        let cancel2 = cancel.clone();
        let settings = settings(4096);
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            run_stream(stream, router2, settings, cancel2).await;
        });

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client.write_all(b"foo:5|c\nfoo:5|c\n").await.unwrap();
        client.shutdown().await.unwrap();

        server.await.unwrap();

        let snapshot = router.workers()[0].snapshot().await.unwrap();
        let (_, state) = snapshot.into_iter().next().unwrap();
        assert_eq!(state.value, AggregateValue::Counter(10.0));
    }
}
