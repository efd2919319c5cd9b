//! In-memory storage backend.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::{HarvestError, Result};
use crate::metric::{Metric, MetricValue};

use super::Storage;

/// Metric map guarded by a readers–writer lock: reads take the shared side,
/// writes the exclusive one, and a batch applies under a single guard.
pub struct MemoryStorage {
    metrics: RwLock<HashMap<String, Metric>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self { metrics: RwLock::new(HashMap::new()) }
    }

    /// Build a storage pre-filled with a snapshot.
    pub fn from_snapshot(list: Vec<Metric>) -> Self {
        let metrics = list.into_iter().map(|m| (m.id.clone(), m)).collect();
        Self { metrics: RwLock::new(metrics) }
    }

    /// Merge `incoming` into the map, checking the kind of any existing entry.
    fn merge(map: &mut HashMap<String, Metric>, incoming: Metric) -> Result<()> {
        match map.entry(incoming.id.clone()) {
            Entry::Vacant(slot) => {
                slot.insert(incoming);
            }
            Entry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                match (&mut existing.value, incoming.value) {
                    (MetricValue::Counter(total), MetricValue::Counter(delta)) => {
                        *total += delta;
                    }
                    (MetricValue::Gauge(current), MetricValue::Gauge(new)) => {
                        *current = new;
                    }
                    _ => {
                        return Err(HarvestError::Conflict {
                            id: incoming.id,
                            existing: existing.kind().as_str().to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn set(&self, metric: Metric) -> Result<()> {
        let mut map = self.metrics.write().await;
        Self::merge(&mut map, metric)
    }

    async fn get(&self, id: &str) -> Result<Option<Metric>> {
        let map = self.metrics.read().await;
        Ok(map.get(id).cloned())
    }

    async fn list(&self) -> Result<Vec<Metric>> {
        let map = self.metrics.read().await;
        Ok(map.values().cloned().collect())
    }

    async fn update(&self, batch: Vec<Metric>) -> Result<()> {
        let mut map = self.metrics.write().await;
        for metric in batch {
            Self::merge(&mut map, metric)?;
        }
        Ok(())
    }

    async fn replace_all(&self, list: Vec<Metric>) -> Result<()> {
        let mut map = self.metrics.write().await;
        map.clear();
        map.extend(list.into_iter().map(|m| (m.id.clone(), m)));
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        Err(HarvestError::Unsupported { operation: "ping".to_string() })
    }
}
