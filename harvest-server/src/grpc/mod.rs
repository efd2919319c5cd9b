//! gRPC surface: `MetricService` on the HTTP port + 1.
//!
//! The trusted-subnet check runs as an interceptor over the `x-real-ip`
//! metadata entry. The HMAC check has to see the decoded message, which
//! interceptors cannot, so each handler verifies the tag over the re-encoded
//! request before touching the store.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use prost::Message;
use tokio::sync::broadcast;
use tonic::codec::CompressionEncoding;
use tonic::service::interceptor::InterceptedService;
use tonic::transport::Server;
use tonic::{Request, Response, Status};
use tracing::info;

use harvest_api::metrics::v1::metric_service_server::{MetricService, MetricServiceServer};
use harvest_api::metrics::v1::{
    ListRequest, ListResponse, Metric as ProtoMetric, UpdateRequest, UpdateResponse,
    ValueRequest, ValueResponse,
};
use harvest_core::storage::Storage;
use harvest_core::{signature, HarvestError, Metric, MetricKind, MetricValue, TrustedSubnet};

use crate::scheduler::Flusher;

pub mod errors;

pub struct MetricsService {
    storage: Arc<dyn Storage>,
    flusher: Arc<Flusher>,
    key: Option<Arc<str>>,
}

impl MetricsService {
    pub fn new(storage: Arc<dyn Storage>, flusher: Arc<Flusher>, key: Option<Arc<str>>) -> Self {
        Self { storage, flusher, key }
    }

    /// Verify the `hashsha256` metadata tag against the re-encoded request
    /// message. Absent metadata passes; a present tag must match.
    fn verify_signature<T: Message>(&self, request: &Request<T>) -> Result<(), Status> {
        let Some(key) = &self.key else {
            return Ok(());
        };
        let Some(tag) = request.metadata().get(signature::HASH_METADATA_KEY) else {
            return Ok(());
        };
        let tag = tag.to_str().map_err(|_| errors::argument("wrong signature"))?;

        let encoded = request.get_ref().encode_to_vec();
        if !signature::verify(key.as_bytes(), &encoded, tag) {
            return Err(errors::argument("wrong signature"));
        }
        Ok(())
    }
}

fn to_proto(m: Metric) -> ProtoMetric {
    let (delta, value) = (m.delta(), m.gauge_value());
    ProtoMetric { id: m.id, mtype: m.kind().as_str().to_string(), delta, value }
}

fn from_proto(m: &ProtoMetric) -> Result<Metric, Status> {
    let kind: MetricKind =
        m.mtype.parse().map_err(|e: HarvestError| errors::argument(e.to_string()))?;

    let value = match (kind, m.delta, m.value) {
        (MetricKind::Counter, Some(delta), None) => MetricValue::Counter(delta),
        (MetricKind::Gauge, None, Some(value)) => MetricValue::Gauge(value),
        _ => {
            return Err(errors::argument(format!(
                "metric {} has no payload matching type {}",
                m.id, m.mtype
            )))
        }
    };

    Ok(Metric { id: m.id.clone(), value })
}

fn storage_error(err: HarvestError) -> Status {
    match err {
        HarvestError::Conflict { .. } | HarvestError::Malformed { .. } | HarvestError::NotFound => {
            errors::argument(err.to_string())
        }
        other => errors::internal(other.to_string()),
    }
}

#[tonic::async_trait]
impl MetricService for MetricsService {
    async fn list(
        &self,
        _request: Request<ListRequest>,
    ) -> Result<Response<ListResponse>, Status> {
        info!("gRPC: List");

        let list = self.storage.list().await.map_err(storage_error)?;
        Ok(Response::new(ListResponse {
            metric: list.into_iter().map(to_proto).collect(),
        }))
    }

    async fn update(
        &self,
        request: Request<UpdateRequest>,
    ) -> Result<Response<UpdateResponse>, Status> {
        info!(metrics = request.get_ref().metric.len(), "gRPC: Update");

        self.verify_signature(&request)?;

        let batch = request
            .get_ref()
            .metric
            .iter()
            .map(from_proto)
            .collect::<Result<Vec<_>, Status>>()?;
        if batch.iter().any(|m| m.id.is_empty()) {
            return Err(errors::argument("not found"));
        }

        self.storage.update(batch).await.map_err(storage_error)?;
        self.flusher.flush_if_sync().await;
        Ok(Response::new(UpdateResponse {}))
    }

    async fn value(
        &self,
        request: Request<ValueRequest>,
    ) -> Result<Response<ValueResponse>, Status> {
        let req = request.get_ref();
        info!(id = %req.id, "gRPC: Value");

        let kind: MetricKind =
            req.mtype.parse().map_err(|e: HarvestError| errors::argument(e.to_string()))?;

        match self.storage.get(&req.id).await {
            Ok(Some(m)) if m.kind() == kind => {
                Ok(Response::new(ValueResponse { metric: Some(to_proto(m)) }))
            }
            Ok(_) => Err(errors::argument("not found")),
            Err(err) => Err(storage_error(err)),
        }
    }
}

/// Trusted-subnet admission over the `x-real-ip` metadata entry.
pub fn admission_interceptor(
    subnet: Option<TrustedSubnet>,
) -> impl FnMut(Request<()>) -> Result<Request<()>, Status> + Clone {
    move |request: Request<()>| {
        let Some(subnet) = subnet else {
            return Ok(request);
        };

        let admitted = request
            .metadata()
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<IpAddr>().ok())
            .map(|ip| subnet.contains(ip))
            .unwrap_or(false);

        if admitted {
            Ok(request)
        } else {
            Err(Status::permission_denied("forbidden"))
        }
    }
}

/// Run the gRPC listener until the shutdown signal fires.
pub async fn serve(
    addr: SocketAddr,
    storage: Arc<dyn Storage>,
    flusher: Arc<Flusher>,
    key: Option<Arc<str>>,
    subnet: Option<TrustedSubnet>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), tonic::transport::Error> {
    let server = MetricServiceServer::new(MetricsService::new(storage, flusher, key))
        .accept_compressed(CompressionEncoding::Gzip)
        .send_compressed(CompressionEncoding::Gzip);
    let service = InterceptedService::new(server, admission_interceptor(subnet));

    info!(%addr, "gRPC listener started");
    Server::builder()
        .add_service(service)
        .serve_with_shutdown(addr, async {
            let _ = shutdown.recv().await;
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::MemoryStorage;

    fn service(key: Option<&str>) -> (MetricsService, Arc<dyn Storage>) {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let flusher = Arc::new(Flusher::new(storage.clone(), None, 300));
        (MetricsService::new(storage.clone(), flusher, key.map(Arc::from)), storage)
    }

    fn update_request() -> UpdateRequest {
        UpdateRequest {
            metric: vec![
                ProtoMetric {
                    id: "hits".to_string(),
                    mtype: "counter".to_string(),
                    delta: Some(3),
                    value: None,
                },
                ProtoMetric {
                    id: "temp".to_string(),
                    mtype: "gauge".to_string(),
                    delta: None,
                    value: Some(36.6),
                },
            ],
        }
    }

    #[tokio::test]
    async fn update_then_value() {
        let (svc, storage) = service(None);

        svc.update(Request::new(update_request())).await.unwrap();
        assert_eq!(storage.get("hits").await.unwrap().unwrap().delta(), Some(3));

        let res = svc
            .value(Request::new(ValueRequest {
                id: "temp".to_string(),
                mtype: "gauge".to_string(),
            }))
            .await
            .unwrap();
        let metric = res.into_inner().metric.unwrap();
        assert_eq!(metric.value, Some(36.6));
    }

    #[tokio::test]
    async fn value_kind_mismatch_is_invalid_argument() {
        let (svc, storage) = service(None);
        storage.set(Metric::counter("x", 1)).await.unwrap();

        let err = svc
            .value(Request::new(ValueRequest { id: "x".to_string(), mtype: "gauge".to_string() }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn update_rejects_payload_mismatch() {
        let (svc, _) = service(None);

        let err = svc
            .update(Request::new(UpdateRequest {
                metric: vec![ProtoMetric {
                    id: "x".to_string(),
                    mtype: "counter".to_string(),
                    delta: None,
                    value: Some(1.0),
                }],
            }))
            .await
            .unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn signed_update_round_trip() {
        let (svc, storage) = service(Some("K"));

        let message = update_request();
        let tag = signature::tag(b"K", &message.encode_to_vec());

        let mut request = Request::new(message);
        request
            .metadata_mut()
            .insert(signature::HASH_METADATA_KEY, tag.parse().unwrap());

        svc.update(request).await.unwrap();
        assert_eq!(storage.get("hits").await.unwrap().unwrap().delta(), Some(3));
    }

    #[tokio::test]
    async fn wrong_signature_is_rejected() {
        let (svc, storage) = service(Some("K"));

        let message = update_request();
        let tag = signature::tag(b"wrong", &message.encode_to_vec());

        let mut request = Request::new(message);
        request
            .metadata_mut()
            .insert(signature::HASH_METADATA_KEY, tag.parse().unwrap());

        let err = svc.update(request).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::InvalidArgument);
        assert!(storage.get("hits").await.unwrap().is_none());
    }

    #[test]
    fn interceptor_checks_metadata_ip() {
        let subnet: TrustedSubnet = "10.0.0.0/8".parse().unwrap();
        let mut intercept = admission_interceptor(Some(subnet));

        let mut inside = Request::new(());
        inside.metadata_mut().insert("x-real-ip", "10.1.2.3".parse().unwrap());
        assert!(intercept(inside).is_ok());

        let mut outside = Request::new(());
        outside.metadata_mut().insert("x-real-ip", "192.168.1.1".parse().unwrap());
        let err = intercept(outside).unwrap_err();
        assert_eq!(err.code(), tonic::Code::PermissionDenied);

        let err = intercept(Request::new(())).unwrap_err();
        assert_eq!(err.code(), tonic::Code::PermissionDenied);
    }
}
