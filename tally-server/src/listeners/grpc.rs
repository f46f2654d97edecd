//! The gRPC listener.
//!
//! One port serves both ingestion streams (statsd packets and spans) and the
//! forwarding `Import` RPC, so a single endpoint can act as application
//! ingress and as the global-node fan-in.

use std::collections::BTreeMap;
use std::net::ToSocketAddrs;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};

use super::ListenerError;
use crate::import::Importer;
use crate::pb;
use crate::router::Router;
use crate::spans::Span;

impl From<pb::SpanMessage> for Span {
    fn from(message: pb::SpanMessage) -> Self {
        Self {
            trace_id: message.trace_id,
            id: message.id,
            parent_id: message.parent_id,
            start_timestamp: message.start_timestamp,
            end_timestamp: message.end_timestamp,
            indicator: message.indicator,
            error: message.error,
            service: message.service,
            name: message.name,
            tags: message.tags.into_iter().collect::<BTreeMap<_, _>>(),
        }
    }
}

struct IngestService {
    router: Router,
}

#[tonic::async_trait]
impl pb::ingest_server::Ingest for IngestService {
    async fn send_metrics(
        &self,
        request: Request<Streaming<pb::StatsdPacket>>,
    ) -> Result<Response<pb::Empty>, Status> {
        let mut stream = request.into_inner();

        while let Some(packet) = stream.message().await? {
            self.router.route_statsd(&packet.lines, "grpc");
        }

        Ok(Response::new(pb::Empty {}))
    }

    async fn send_spans(
        &self,
        request: Request<Streaming<pb::SpanMessage>>,
    ) -> Result<Response<pb::Empty>, Status> {
        let mut stream = request.into_inner();

        while let Some(message) = stream.message().await? {
            self.router.route_span(message.into(), "grpc");
        }

        Ok(Response::new(pb::Empty {}))
    }
}

struct ForwardService {
    importer: Importer,
}

#[tonic::async_trait]
impl pb::forward_server::Forward for ForwardService {
    async fn import(
        &self,
        request: Request<pb::ImportRequest>,
    ) -> Result<Response<pb::Empty>, Status> {
        self.importer
            .import(&request.into_inner().payload)
            .map_err(|error| Status::invalid_argument(error.to_string()))?;

        Ok(Response::new(pb::Empty {}))
    }
}

/// Spawns the gRPC server for one endpoint.
pub fn spawn_grpc(
    authority: &str,
    router: Router,
    importer: Importer,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>, ListenerError> {
    let addr = authority
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ListenerError::Resolve(authority.to_owned()))?;

    let authority = authority.to_owned();

    Ok(tokio::spawn(async move {
        let server = tonic::transport::Server::builder()
            .add_service(pb::ingest_server::IngestServer::new(IngestService {
                router,
            }))
            .add_service(pb::forward_server::ForwardServer::new(ForwardService {
                importer,
            }))
            .serve_with_shutdown(addr, cancel.cancelled());

        if let Err(error) = server.await {
            tally_log::error!("grpc listener on {authority} failed: {error}");
        }
    }))
}
