//! Transport adapters.
//!
//! Both adapters sit behind the `Transport` trait; each one is built from an
//! immutable subset of the agent configuration and owns its retry policy.

use std::sync::Arc;

use async_trait::async_trait;

use harvest_core::{cipher, Metric, Result, RetryPolicy};

use crate::config::{AgentConfig, Protocol};

pub mod grpc;
pub mod http;

pub use grpc::{GrpcOptions, GrpcTransport};
pub use http::{HttpOptions, HttpTransport};

/// A publisher of metric batches.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, batch: Vec<Metric>) -> Result<()>;
}

/// Build the adapter selected by the configured protocol.
pub async fn build(cfg: &AgentConfig, retry: RetryPolicy) -> Result<Arc<dyn Transport>> {
    match cfg.protocol {
        Protocol::Http => {
            let public_key = match &cfg.crypto_key {
                Some(path) => Some(cipher::load_public_key(path).await?),
                None => None,
            };
            let transport = HttpTransport::new(HttpOptions {
                address: cfg.address.clone(),
                key: cfg.key.clone(),
                public_key,
                retry,
            })?;
            Ok(Arc::new(transport))
        }
        Protocol::Grpc => {
            let transport = GrpcTransport::connect(GrpcOptions {
                address: cfg.address.clone(),
                key: cfg.key.clone(),
                retry,
            })?;
            Ok(Arc::new(transport))
        }
    }
}
