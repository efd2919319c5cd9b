//! Snapshot codec: the full store as a JSON array of metric records,
//! newline-terminated. An empty file is a legal empty store; any record
//! violating the metric invariants makes the whole snapshot unreadable.

use std::path::Path;

use crate::error::{HarvestError, Result};
use crate::metric::Metric;
use crate::storage::Storage;

/// Encode a metric list as a snapshot byte stream.
pub fn encode(list: &[Metric]) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(list)
        .map_err(|e| HarvestError::malformed(format!("encode snapshot: {e}")))?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Decode a snapshot byte stream. Empty input means an empty store.
pub fn decode(bytes: &[u8]) -> std::result::Result<Vec<Metric>, serde_json::Error> {
    if bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(bytes)
}

/// Flush the storage contents to `path`.
pub async fn persist(storage: &dyn Storage, path: &Path) -> Result<()> {
    let list = storage.list().await?;
    let bytes = encode(&list)?;
    tokio::fs::write(path, bytes)
        .await
        .map_err(|source| HarvestError::Io { path: path.to_path_buf(), source })
}

/// Load a snapshot from `path`. A missing file yields `None`; a present but
/// corrupt one is an error, so startup can abort.
pub async fn load(path: &Path) -> Result<Option<Vec<Metric>>> {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(HarvestError::Io { path: path.to_path_buf(), source }),
    };

    let list = decode(&bytes).map_err(|e| HarvestError::Snapshot {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(Some(list))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::MetricValue;
    use crate::storage::MemoryStorage;

    fn sorted_triples(list: Vec<Metric>) -> Vec<(String, &'static str, String)> {
        let mut triples: Vec<_> = list
            .into_iter()
            .map(|m| (m.id.clone(), m.kind().as_str(), m.value.render()))
            .collect();
        triples.sort();
        triples
    }

    #[tokio::test]
    async fn persist_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");

        let storage = MemoryStorage::new();
        storage.set(Metric::counter("hits", 7)).await.unwrap();
        storage.set(Metric::gauge("temp", 36.6)).await.unwrap();
        storage.set(Metric::gauge("load", 0.25)).await.unwrap();

        persist(&storage, &path).await.unwrap();
        let restored = load(&path).await.unwrap().unwrap();

        assert_eq!(
            sorted_triples(restored),
            sorted_triples(storage.list().await.unwrap())
        );
    }

    #[tokio::test]
    async fn snapshot_is_newline_terminated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");

        let storage = MemoryStorage::new();
        storage.set(Metric::counter("hits", 1)).await.unwrap();
        persist(&storage, &path).await.unwrap();

        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes.last(), Some(&b'\n'));
    }

    #[tokio::test]
    async fn empty_file_is_an_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        std::fs::write(&path, "").unwrap();

        assert_eq!(load(&path).await.unwrap().unwrap(), Vec::new());
    }

    #[tokio::test]
    async fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.json");

        assert!(load(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(matches!(
            load(&path).await.unwrap_err(),
            HarvestError::Snapshot { .. }
        ));
    }

    #[test]
    fn decode_rejects_inconsistent_records() {
        // counter without a delta
        assert!(decode(br#"[{"id":"a","type":"counter","value":1.0}]"#).is_err());
        // gauge with a delta
        assert!(decode(br#"[{"id":"a","type":"gauge","delta":1}]"#).is_err());
    }

    #[test]
    fn decode_accepts_valid_records() {
        let list = decode(
            br#"[{"id":"a","type":"counter","delta":3},{"id":"b","type":"gauge","value":5}]"#,
        )
        .unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].value, MetricValue::Counter(3));
        assert_eq!(list[1].value, MetricValue::Gauge(5.0));
    }
}
