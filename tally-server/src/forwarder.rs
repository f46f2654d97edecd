//! Local-to-global forwarding.
//!
//! The forwarder packages one flush interval's serializable aggregates into a
//! single payload and submits it to the configured global node, over HTTP or
//! gRPC depending on the address prefix. A failed submission drops that
//! interval's contribution: there is no retry, because the next flush
//! obsoletes it and queuing would compound memory pressure.

use std::time::Duration;

use tally_metrics::forward::{encode_payload, ForwardRecord};
use tally_statsd::metric;
use tokio::sync::Mutex;

use crate::pb;
use crate::statsd::ServerCounters;

type GrpcClient = pb::forward_client::ForwardClient<tonic::transport::Channel>;

enum Transport {
    Http {
        client: reqwest::Client,
        url: reqwest::Url,
    },
    Grpc {
        endpoint: String,
        timeout: Duration,
        client: Mutex<Option<GrpcClient>>,
    },
}

/// An error constructing the forwarder. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ForwarderError {
    /// The forward address did not parse.
    #[error("invalid forward_address: {0}")]
    InvalidAddress(String),

    /// The HTTP client could not be constructed.
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// Submits pre-reduction aggregates to the global node.
pub struct Forwarder {
    transport: Transport,
}

impl Forwarder {
    /// Creates a forwarder for `address`, which starts with `http://`,
    /// `https://` or `grpc://`.
    pub fn new(address: &str, timeout: Duration) -> Result<Self, ForwarderError> {
        let transport = if let Some(rest) = address.strip_prefix("grpc://") {
            Transport::Grpc {
                endpoint: format!("http://{rest}"),
                timeout,
                client: Mutex::new(None),
            }
        } else {
            let url = format!("{}/import", address.trim_end_matches('/'));
            let url = reqwest::Url::parse(&url)
                .map_err(|e| ForwarderError::InvalidAddress(e.to_string()))?;

            let client = reqwest::Client::builder().timeout(timeout).build()?;

            Transport::Http { client, url }
        };

        Ok(Self { transport })
    }

    /// Submits one interval's records.
    ///
    /// Failures are counted and logged; the records are dropped either way.
    pub async fn forward(&self, records: Vec<ForwardRecord>) {
        let count = records.len() as u64;
        let payload = encode_payload(&records);
        drop(records);

        match self.submit(payload).await {
            Ok(()) => {
                metric!(counter(ServerCounters::ForwardPayloads) += 1);
                metric!(counter(ServerCounters::ForwardRecords) += count);
            }
            Err(cause) => {
                tally_log::warn!(cause = cause, "forward submission failed, interval lost");
                metric!(counter(ServerCounters::ForwardErrors) += 1, cause = cause);
            }
        }
    }

    async fn submit(&self, payload: Vec<u8>) -> Result<(), &'static str> {
        match &self.transport {
            Transport::Http { client, url } => {
                let response = client
                    .post(url.clone())
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .body(payload)
                    .send()
                    .await
                    .map_err(|error| {
                        if error.is_timeout() {
                            "timeout"
                        } else {
                            "execution"
                        }
                    })?;

                if response.status().is_success() {
                    Ok(())
                } else {
                    Err(status_cause(response.status().as_u16()))
                }
            }

            Transport::Grpc {
                endpoint,
                timeout,
                client,
            } => {
                let mut guard = client.lock().await;

                if guard.is_none() {
                    let channel = tonic::transport::Endpoint::from_shared(endpoint.clone())
                        .map_err(|_| "connect")?
                        .timeout(*timeout)
                        .connect()
                        .await
                        .map_err(|_| "connect")?;
                    *guard = Some(GrpcClient::new(channel));
                }

                let request = pb::ImportRequest { payload };
                match guard.as_mut().unwrap().import(request).await {
                    Ok(_) => Ok(()),
                    Err(_) => {
                        // Reconnect on the next interval.
                        *guard = None;
                        Err("grpc")
                    }
                }
            }
        }
    }
}

fn status_cause(status: u16) -> &'static str {
    match status {
        400 => "http_400",
        500 => "http_500",
        503 => "http_503",
        _ => "http_error",
    }
}
