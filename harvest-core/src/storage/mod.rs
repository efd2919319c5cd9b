//! Metric storage backends.
//!
//! The server talks to storage through the `Storage` trait object; a
//! non-empty database DSN selects the PostgreSQL backend, otherwise metrics
//! live in process memory. Both backends share the merge semantics: gauges
//! are last-writer-wins, counter deltas accumulate, and a write whose kind
//! disagrees with the stored metric is rejected.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::metric::Metric;
use crate::retry::RetryPolicy;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;

/// Capability set shared by both backends.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Upsert a single metric, accumulating counter deltas.
    async fn set(&self, metric: Metric) -> Result<()>;

    /// Exact-match read by id.
    async fn get(&self, id: &str) -> Result<Option<Metric>>;

    /// Snapshot of all entries; order unspecified.
    async fn list(&self) -> Result<Vec<Metric>>;

    /// Apply a batch so that no concurrent reader observes a partial state.
    async fn update(&self, batch: Vec<Metric>) -> Result<()>;

    /// Replace the entire contents (snapshot restore).
    async fn replace_all(&self, list: Vec<Metric>) -> Result<()>;

    /// Backend liveness probe.
    async fn ping(&self) -> Result<()>;
}

/// Open the backend selected by `dsn`: memory when empty, PostgreSQL
/// otherwise. The database connect is retried on the given policy.
pub async fn connect(dsn: Option<&str>, retry: &RetryPolicy) -> Result<Arc<dyn Storage>> {
    match dsn {
        Some(dsn) if !dsn.is_empty() => {
            let storage = PostgresStorage::connect(dsn, retry).await?;
            Ok(Arc::new(storage))
        }
        _ => Ok(Arc::new(MemoryStorage::new())),
    }
}
