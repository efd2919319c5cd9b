//! HTTP transport adapter.
//!
//! Batches travel as `POST {address}/updates/`: JSON, gzip-compressed, the
//! HMAC tag computed over the compressed payload, and the whole body
//! optionally sealed with blockwise RSA-OAEP, the exact inverse of the
//! server middleware stack. Transport and non-2xx failures are retried on
//! the shared schedule.

use std::io::Write;
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header;
use rsa::RsaPublicKey;

use harvest_core::{cipher, signature, HarvestError, Metric, Result, RetryPolicy};

use super::Transport;

/// Immutable subset of the agent configuration this adapter needs.
pub struct HttpOptions {
    /// Server address as host:port.
    pub address: String,
    pub key: Option<String>,
    pub public_key: Option<RsaPublicKey>,
    pub retry: RetryPolicy,
}

pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    real_ip: Option<String>,
    key: Option<String>,
    public_key: Option<RsaPublicKey>,
    retry: RetryPolicy,
}

impl HttpTransport {
    pub fn new(opts: HttpOptions) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| HarvestError::InvalidConfig {
                reason: format!("build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            endpoint: format!("http://{}/updates/", opts.address),
            real_ip: local_ipv4().map(|ip| ip.to_string()),
            key: opts.key,
            public_key: opts.public_key,
            retry: opts.retry,
        })
    }

    /// Produce the wire body and its tag: JSON → gzip → (tag) → RSA blocks.
    fn encode_body(&self, batch: &[Metric]) -> Result<(Vec<u8>, Option<String>)> {
        let json = serde_json::to_vec(batch)
            .map_err(|e| HarvestError::malformed(format!("marshal batch: {e}")))?;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(&json)
            .map_err(|e| HarvestError::transient(format!("compress batch: {e}")))?;
        let compressed = encoder
            .finish()
            .map_err(|e| HarvestError::transient(format!("compress batch: {e}")))?;

        let tag = self.key.as_ref().map(|k| signature::tag(k.as_bytes(), &compressed));

        let body = match &self.public_key {
            Some(public) => cipher::encrypt(public, &compressed)?,
            None => compressed,
        };
        Ok((body, tag))
    }

    async fn post(&self, body: Vec<u8>, tag: Option<String>) -> Result<()> {
        let mut request = self
            .client
            .post(&self.endpoint)
            .header(header::CONTENT_TYPE, "application/json")
            .header(header::CONTENT_ENCODING, "gzip")
            .header(header::ACCEPT_ENCODING, "gzip");

        if let Some(ip) = &self.real_ip {
            request = request.header("X-Real-IP", ip);
        }
        if let Some(tag) = tag {
            request = request.header(signature::HASH_HEADER, tag);
        }

        let response = request
            .body(body)
            .send()
            .await
            .map_err(|e| HarvestError::transient(format!("post updates: {e}")))?;

        if !response.status().is_success() {
            return Err(HarvestError::transient(format!(
                "status: {}",
                response.status().as_u16()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn publish(&self, batch: Vec<Metric>) -> Result<()> {
        let (body, tag) = self.encode_body(&batch)?;
        self.retry.run(|| self.post(body.clone(), tag.clone())).await
    }
}

/// First non-loopback IPv4 of this host, discovered through a connected UDP
/// socket (no packet is sent).
fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()? {
        SocketAddr::V4(addr) if !addr.ip().is_loopback() => Some(*addr.ip()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs1::DecodeRsaPrivateKey;
    use rsa::pkcs8::DecodePublicKey;
    use rsa::RsaPrivateKey;
    use std::io::Read;

    fn batch() -> Vec<Metric> {
        vec![Metric::counter("hits", 3), Metric::gauge("temp", 36.6)]
    }

    fn gunzip(data: &[u8]) -> Vec<u8> {
        let mut plain = Vec::new();
        flate2::read::GzDecoder::new(data).read_to_end(&mut plain).unwrap();
        plain
    }

    #[test]
    fn plain_body_is_gzipped_json() {
        let transport = HttpTransport::new(HttpOptions {
            address: "localhost:8080".to_string(),
            key: None,
            public_key: None,
            retry: RetryPolicy::none(),
        })
        .unwrap();

        let (body, tag) = transport.encode_body(&batch()).unwrap();
        assert!(tag.is_none());

        let decoded: Vec<Metric> = serde_json::from_slice(&gunzip(&body)).unwrap();
        assert_eq!(decoded, batch());
    }

    #[test]
    fn tag_covers_the_compressed_payload() {
        let transport = HttpTransport::new(HttpOptions {
            address: "localhost:8080".to_string(),
            key: Some("K".to_string()),
            public_key: None,
            retry: RetryPolicy::none(),
        })
        .unwrap();

        let (body, tag) = transport.encode_body(&batch()).unwrap();
        assert!(signature::verify(b"K", &body, &tag.unwrap()));
    }

    #[test]
    fn sealed_body_round_trips_through_the_server_pipeline() {
        let (public_pem, private_pem) = cipher::generate_keypair(2048).unwrap();
        let public = RsaPublicKey::from_public_key_pem(&public_pem).unwrap();
        let private = RsaPrivateKey::from_pkcs1_pem(&private_pem).unwrap();

        let transport = HttpTransport::new(HttpOptions {
            address: "localhost:8080".to_string(),
            key: Some("K".to_string()),
            public_key: Some(public),
            retry: RetryPolicy::none(),
        })
        .unwrap();

        let (body, tag) = transport.encode_body(&batch()).unwrap();

        // Server order: decrypt, verify the tag, then gunzip.
        let compressed = cipher::decrypt(&private, &body).unwrap();
        assert!(signature::verify(b"K", &compressed, &tag.unwrap()));
        let decoded: Vec<Metric> = serde_json::from_slice(&gunzip(&compressed)).unwrap();
        assert_eq!(decoded, batch());
    }
}
