//! UDP and unix-datagram listeners.
//!
//! Each reader owns a preallocated receive buffer that is reused for every
//! datagram, so the hot path performs no per-packet allocation. With
//! `num_readers > 1`, UDP endpoints open one socket per reader with
//! SO_REUSEPORT for kernel-level load balancing; unix datagram sockets are
//! shared between readers instead.

use std::net::SocketAddr;
use std::sync::Arc;

use socket2::{Domain, Protocol, Socket, Type};
use tally_config::{Config, UnixPath};
use tokio::net::{UdpSocket, UnixDatagram};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{dispatch_datagram, ListenerError, Traffic};
use crate::router::Router;

fn resolve(authority: &str) -> Result<SocketAddr, ListenerError> {
    use std::net::ToSocketAddrs;

    authority
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ListenerError::Resolve(authority.to_owned()))
}

fn bind_udp(addr: SocketAddr, reuse_port: bool, buffer_size: usize) -> std::io::Result<UdpSocket> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;

    #[cfg(unix)]
    if reuse_port {
        socket.set_reuse_port(true)?;
    }

    // Absorb bursts beyond what a single reader drains per wakeup.
    socket.set_recv_buffer_size(buffer_size * 4).ok();

    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    UdpSocket::from_std(socket.into())
}

/// Spawns `num_readers` UDP readers for one endpoint.
pub fn spawn_udp(
    authority: &str,
    traffic: Traffic,
    config: &Config,
    router: Router,
    cancel: CancellationToken,
) -> Result<Vec<JoinHandle<()>>, ListenerError> {
    let addr = resolve(authority)?;
    let readers = config.num_readers;

    if readers > 1 && !cfg!(unix) {
        return Err(ListenerError::ReusePortUnsupported);
    }

    let mut tasks = Vec::with_capacity(readers);

    for _ in 0..readers {
        let socket =
            bind_udp(addr, readers > 1, config.read_buffer_size_bytes).map_err(|source| {
                ListenerError::Bind {
                    address: format!("udp://{authority}"),
                    source,
                }
            })?;

        let router = router.clone();
        let cancel = cancel.clone();
        let buffer_size = config.read_buffer_size_bytes;
        let max_length = config.metric_max_length;

        tasks.push(tokio::spawn(async move {
            let mut buffer = vec![0u8; buffer_size];

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,

                    result = socket.recv(&mut buffer) => match result {
                        Ok(len) => {
                            dispatch_datagram(&router, traffic, &buffer[..len], max_length, "udp");
                        }
                        Err(error) => {
                            tally_log::debug!("udp recv error: {error}");
                        }
                    },
                }
            }
        }));
    }

    Ok(tasks)
}

#[cfg(target_os = "linux")]
fn bind_abstract_datagram(
    name: &str,
) -> Result<std::os::unix::net::UnixDatagram, ListenerError> {
    use std::os::linux::net::SocketAddrExt;

    let bind_error = |source| ListenerError::Bind {
        address: format!("unixgram:@{name}"),
        source,
    };

    let addr = std::os::unix::net::SocketAddr::from_abstract_name(name.as_bytes())
        .map_err(bind_error)?;
    std::os::unix::net::UnixDatagram::bind_addr(&addr).map_err(bind_error)
}

#[cfg(not(target_os = "linux"))]
fn bind_abstract_datagram(
    name: &str,
) -> Result<std::os::unix::net::UnixDatagram, ListenerError> {
    Err(ListenerError::AbstractUnsupported(name.to_owned()))
}

fn bind_unixgram(path: &UnixPath) -> Result<UnixDatagram, ListenerError> {
    let bind_error = |source| ListenerError::Bind {
        address: format!("unixgram:{path}"),
        source,
    };

    let socket = match path {
        UnixPath::Path(path) => {
            // A previous run may have left the socket file behind.
            std::fs::remove_file(path).ok();
            std::os::unix::net::UnixDatagram::bind(path).map_err(bind_error)?
        }
        UnixPath::Abstract(name) => bind_abstract_datagram(name)?,
    };

    socket.set_nonblocking(true).map_err(bind_error)?;
    UnixDatagram::from_std(socket).map_err(bind_error)
}

/// Spawns readers for one unix datagram endpoint.
///
/// All readers share the same socket; the kernel distributes datagrams
/// between concurrent receivers.
pub fn spawn_unixgram(
    path: &UnixPath,
    traffic: Traffic,
    config: &Config,
    router: Router,
    cancel: CancellationToken,
) -> Result<Vec<JoinHandle<()>>, ListenerError> {
    let socket = Arc::new(bind_unixgram(path)?);

    let mut tasks = Vec::with_capacity(config.num_readers);

    for _ in 0..config.num_readers {
        let socket = socket.clone();
        let router = router.clone();
        let cancel = cancel.clone();
        let buffer_size = config.read_buffer_size_bytes;
        let max_length = config.metric_max_length;

        tasks.push(tokio::spawn(async move {
            let mut buffer = vec![0u8; buffer_size];

            loop {
                tokio::select! {
                    biased;

                    _ = cancel.cancelled() => break,

                    result = socket.recv(&mut buffer) => match result {
                        Ok(len) => {
                            dispatch_datagram(
                                &router,
                                traffic,
                                &buffer[..len],
                                max_length,
                                "unixgram",
                            );
                        }
                        Err(error) => {
                            tally_log::debug!("unixgram recv error: {error}");
                        }
                    },
                }
            }
        }));
    }

    Ok(tasks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workers::spawn_workers;

    fn test_router() -> Router {
        let (span_tx, _span_rx) = flume::bounded(16);
        Router::new(spawn_workers(1), span_tx, 4096, 4096, vec![], &[])
    }

    #[tokio::test]
    async fn test_udp_end_to_end() {
        let router = test_router();
        let cancel = CancellationToken::new();

        // Bind explicitly so the ephemeral port is known to the test.
        let socket = bind_udp("127.0.0.1:0".parse().unwrap(), false, 4096).unwrap();
        let addr = socket.local_addr().unwrap();

        let router2 = router.clone();
        let cancel2 = cancel.clone();
        let task = tokio::spawn(async move {
            let mut buffer = vec![0u8; 4096];
            loop {
                tokio::select! {
                    biased;
                    _ = cancel2.cancelled() => break,
                    result = socket.recv(&mut buffer) => {
                        if let Ok(len) = result {
                            dispatch_datagram(&router2, Traffic::Statsd, &buffer[..len], 4096, "udp");
                        }
                    }
                }
            }
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"foo:3|c\nbar:1|c", addr).await.unwrap();

        // Wait for the datagram to make it through the reader.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let snapshot = router.workers()[0].snapshot().await.unwrap();
        assert_eq!(snapshot.len(), 2);

        cancel.cancel();
        task.await.unwrap();
    }
}
