//! gRPC transport adapter.
//!
//! Batches go out as one `MetricService.Update` call with the gzip
//! compressor selected. With a shared key configured, the base64 HMAC of the
//! encoded `UpdateRequest` rides along as `hashsha256` metadata. The channel
//! connects lazily, so startup never blocks on the server; failures are
//! retried on the shared schedule.

use async_trait::async_trait;
use prost::Message;
use tonic::codec::CompressionEncoding;
use tonic::transport::{Channel, Endpoint};

use harvest_api::metrics::v1::metric_service_client::MetricServiceClient;
use harvest_api::metrics::v1::{Metric as ProtoMetric, UpdateRequest};
use harvest_core::{signature, HarvestError, Metric, Result, RetryPolicy};

use super::Transport;

/// Immutable subset of the agent configuration this adapter needs.
pub struct GrpcOptions {
    /// Server HTTP address as host:port; the gRPC service listens one port up.
    pub address: String,
    pub key: Option<String>,
    pub retry: RetryPolicy,
}

pub struct GrpcTransport {
    client: MetricServiceClient<Channel>,
    key: Option<String>,
    retry: RetryPolicy,
}

impl GrpcTransport {
    pub fn connect(opts: GrpcOptions) -> Result<Self> {
        let endpoint = grpc_endpoint(&opts.address)?;
        let channel = Endpoint::try_from(endpoint.clone())
            .map_err(|e| HarvestError::InvalidConfig {
                reason: format!("bad endpoint {endpoint}: {e}"),
            })?
            .connect_lazy();

        let client = MetricServiceClient::new(channel)
            .send_compressed(CompressionEncoding::Gzip)
            .accept_compressed(CompressionEncoding::Gzip);

        Ok(Self { client, key: opts.key, retry: opts.retry })
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn publish(&self, batch: Vec<Metric>) -> Result<()> {
        let message =
            UpdateRequest { metric: batch.into_iter().map(to_proto).collect() };
        let tag = self
            .key
            .as_ref()
            .map(|k| signature::tag(k.as_bytes(), &message.encode_to_vec()));

        self.retry
            .run(|| {
                let mut client = self.client.clone();
                let message = message.clone();
                let tag = tag.clone();
                async move {
                    let mut request = tonic::Request::new(message);
                    if let Some(tag) = tag {
                        let value = tag.parse().map_err(|_| {
                            HarvestError::transient("signature is not valid metadata")
                        })?;
                        request.metadata_mut().insert(signature::HASH_METADATA_KEY, value);
                    }

                    client
                        .update(request)
                        .await
                        .map_err(|s| HarvestError::transient(format!("send request: {s}")))?;
                    Ok(())
                }
            })
            .await
    }
}

fn to_proto(m: Metric) -> ProtoMetric {
    let (delta, value) = (m.delta(), m.gauge_value());
    ProtoMetric { id: m.id, mtype: m.kind().as_str().to_string(), delta, value }
}

fn grpc_endpoint(address: &str) -> Result<String> {
    let (host, port) = address.rsplit_once(':').ok_or_else(|| {
        HarvestError::InvalidConfig { reason: format!("address {address} is missing a port") }
    })?;
    let port: u16 = port.parse().map_err(|_| HarvestError::InvalidConfig {
        reason: format!("bad port in {address}"),
    })?;
    Ok(format!("http://{host}:{}", port + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_is_one_port_up() {
        assert_eq!(grpc_endpoint("localhost:8080").unwrap(), "http://localhost:8081");
        assert!(grpc_endpoint("localhost").is_err());
        assert!(grpc_endpoint("localhost:nope").is_err());
    }

    #[test]
    fn proto_conversion_keeps_one_payload() {
        let counter = to_proto(Metric::counter("hits", 3));
        assert_eq!(counter.mtype, "counter");
        assert_eq!(counter.delta, Some(3));
        assert_eq!(counter.value, None);

        let gauge = to_proto(Metric::gauge("temp", 36.6));
        assert_eq!(gauge.mtype, "gauge");
        assert_eq!(gauge.delta, None);
        assert_eq!(gauge.value, Some(36.6));
    }
}
