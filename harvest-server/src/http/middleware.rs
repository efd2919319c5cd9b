//! Request middleware stack.
//!
//! Mutating endpoints are wrapped outer-to-inner: admission → decryption →
//! HMAC exchange → gzip transcoding → logging → handler. Every wrapper works
//! on a fully buffered body, so the handler observes exactly the payload the
//! client produced and vice versa.

use std::io::{Read, Write};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{to_bytes, Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rsa::RsaPrivateKey;
use tracing::info;

use harvest_core::{cipher, signature, TrustedSubnet};

/// Bodies are buffered in full; metric batches are small.
const MAX_BODY: usize = 16 * 1024 * 1024;

/// Immutable middleware configuration shared across requests.
#[derive(Clone, Default)]
pub struct MiddlewareState {
    pub trusted_subnet: Option<TrustedSubnet>,
    pub private_key: Option<Arc<RsaPrivateKey>>,
    pub key: Option<Arc<str>>,
}

fn hash_header() -> HeaderName {
    HeaderName::from_bytes(signature::HASH_HEADER.as_bytes()).expect("valid header name")
}

/// Reject requests whose declared client IP lies outside the trusted subnet.
/// A missing or unparseable `X-Real-IP` is rejected too.
pub async fn admission(
    State(st): State<MiddlewareState>,
    req: Request,
    next: Next,
) -> Response {
    if let Some(subnet) = st.trusted_subnet {
        let admitted = req
            .headers()
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<IpAddr>().ok())
            .map(|ip| subnet.contains(ip))
            .unwrap_or(false);

        if !admitted {
            return (StatusCode::FORBIDDEN, "forbidden").into_response();
        }
    }

    next.run(req).await
}

/// Replace the body with its blockwise RSA-OAEP decryption when a private
/// key is configured.
pub async fn decryption(
    State(st): State<MiddlewareState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(private_key) = st.private_key else {
        return next.run(req).await;
    };

    let (parts, body) = req.into_parts();
    let Ok(bytes) = to_bytes(body, MAX_BODY).await else {
        return (StatusCode::BAD_REQUEST, "can't read body").into_response();
    };

    match cipher::decrypt(&private_key, &bytes) {
        Ok(plain) => next.run(Request::from_parts(parts, Body::from(plain))).await,
        Err(_) => (StatusCode::FORBIDDEN, "forbidden").into_response(),
    }
}

/// Verify the request tag and stamp the response tag.
///
/// When a shared key is configured and the request carries a non-empty
/// `HashSHA256` header, the body must match it. The response always leaves
/// with the tag of its (possibly gzip-encoded, by the inner layer) body.
pub async fn hmac_exchange(
    State(st): State<MiddlewareState>,
    req: Request,
    next: Next,
) -> Response {
    let Some(key) = st.key else {
        return next.run(req).await;
    };

    let (parts, body) = req.into_parts();
    let Ok(bytes) = to_bytes(body, MAX_BODY).await else {
        return (StatusCode::BAD_REQUEST, "can't read body").into_response();
    };

    let tag = parts
        .headers
        .get(hash_header())
        .and_then(|v| v.to_str().ok())
        .filter(|s| !s.is_empty());
    if let Some(tag) = tag {
        if !signature::verify(key.as_bytes(), &bytes, tag) {
            return (StatusCode::BAD_REQUEST, "wrong signature").into_response();
        }
    }

    let response = next.run(Request::from_parts(parts, Body::from(bytes))).await;

    let (mut parts, body) = response.into_parts();
    let Ok(body_bytes) = to_bytes(body, MAX_BODY).await else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };
    let tag = signature::tag(key.as_bytes(), &body_bytes);
    if let Ok(value) = HeaderValue::from_str(&tag) {
        parts.headers.insert(hash_header(), value);
    }

    Response::from_parts(parts, Body::from(body_bytes))
}

/// Decode gzip request bodies and gzip-encode responses for clients that
/// accept it. The response is only encoded on 2xx statuses.
pub async fn gzip_transcode(req: Request, next: Next) -> Response {
    let accepts_gzip = header_contains(&req, header::ACCEPT_ENCODING, "gzip");
    let body_is_gzip = header_contains(&req, header::CONTENT_ENCODING, "gzip");

    let req = if body_is_gzip {
        let (mut parts, body) = req.into_parts();
        let Ok(bytes) = to_bytes(body, MAX_BODY).await else {
            return (StatusCode::BAD_REQUEST, "can't read body").into_response();
        };

        let mut plain = Vec::new();
        if GzDecoder::new(&bytes[..]).read_to_end(&mut plain).is_err() {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }

        parts.headers.remove(header::CONTENT_ENCODING);
        parts.headers.remove(header::CONTENT_LENGTH);
        Request::from_parts(parts, Body::from(plain))
    } else {
        req
    };

    let response = next.run(req).await;
    if !accepts_gzip || !response.status().is_success() {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let Ok(bytes) = to_bytes(body, MAX_BODY).await else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    if encoder.write_all(&bytes).is_err() {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let Ok(compressed) = encoder.finish() else {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    };

    parts.headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    parts.headers.remove(header::CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(compressed))
}

/// Emit start/finish events with method, URI, duration, status and response
/// size.
pub async fn logging(req: Request, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();
    info!(%method, %uri, "request started");

    let start = Instant::now();
    let response = next.run(req).await;

    let (parts, body) = response.into_parts();
    let bytes = to_bytes(body, MAX_BODY).await.unwrap_or_else(|_| Bytes::new());
    info!(
        %method,
        %uri,
        status = parts.status.as_u16(),
        duration_ms = start.elapsed().as_millis() as u64,
        bytes = bytes.len(),
        "request finished"
    );

    Response::from_parts(parts, Body::from(bytes))
}

fn header_contains(req: &Request, name: HeaderName, needle: &str) -> bool {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.contains(needle))
        .unwrap_or(false)
}
