//! Snapshot flushing.
//!
//! With a positive store interval a dedicated task flushes on a timer; with
//! interval zero the handlers flush synchronously after every mutating
//! request through the same `Flusher`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, error};

use harvest_core::storage::Storage;
use harvest_core::{snapshot, Result};

/// Shared flush handle: knows where snapshots go and whether the server runs
/// in synchronous mode.
pub struct Flusher {
    storage: Arc<dyn Storage>,
    path: Option<PathBuf>,
    synchronous: bool,
}

impl Flusher {
    pub fn new(storage: Arc<dyn Storage>, path: Option<PathBuf>, store_interval: u64) -> Self {
        Self { storage, path, synchronous: store_interval == 0 }
    }

    /// Flush the store to the snapshot file. A missing path is a no-op.
    pub async fn flush(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        snapshot::persist(self.storage.as_ref(), path).await?;
        debug!(path = %path.display(), "snapshot flushed");
        Ok(())
    }

    /// Called by mutating handlers; flushes only in synchronous mode. Flush
    /// failures are logged, the store stays live.
    pub async fn flush_if_sync(&self) {
        if !self.synchronous {
            return;
        }
        if let Err(err) = self.flush().await {
            error!(error = %err, "synchronous snapshot flush failed");
        }
    }
}

/// Periodic flush loop; exits on the shutdown signal.
pub async fn run(flusher: Arc<Flusher>, interval_secs: u64, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs));
    // The first tick fires immediately; skip it so the loop waits a full
    // interval before the first flush.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                return;
            }
            _ = ticker.tick() => {
                if let Err(err) = flusher.flush().await {
                    error!(error = %err, "periodic snapshot flush failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_core::{MemoryStorage, Metric};

    #[tokio::test]
    async fn sync_mode_flushes_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.json");

        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        storage.set(Metric::counter("hits", 1)).await.unwrap();

        let flusher = Flusher::new(storage, Some(path.clone()), 0);
        flusher.flush_if_sync().await;

        let restored = snapshot::load(&path).await.unwrap().unwrap();
        assert_eq!(restored.len(), 1);
    }

    #[tokio::test]
    async fn async_mode_skips_sync_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("snap.json");

        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let flusher = Flusher::new(storage, Some(path.clone()), 300);
        flusher.flush_if_sync().await;

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn missing_path_is_a_noop() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let flusher = Flusher::new(storage, None, 0);
        flusher.flush().await.unwrap();
    }
}
