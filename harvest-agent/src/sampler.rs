//! Metric sampling.
//!
//! Two pollers feed a shared sample map on every tick: the runtime poller
//! covers the agent process (a fixed set of 27 gauges plus the `PollCount`
//! counter and the `RandomValue` gauge), the host poller covers machine
//! memory and per-CPU utilization. Each pass writes its samples in one
//! transaction under the exclusive side of the map lock; the publisher reads
//! batches under the shared side.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sysinfo::{Networks, System, MINIMUM_CPU_UPDATE_INTERVAL};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error};

use harvest_core::{HarvestError, Metric, MetricValue, Result};

pub const POLL_COUNT: &str = "PollCount";
pub const RANDOM_VALUE: &str = "RandomValue";

/// Shared sample map. Counters accumulate across passes and are drained when
/// a publish succeeds, so a failed publish never loses counts.
pub struct Samples {
    metrics: RwLock<HashMap<String, Metric>>,
}

impl Samples {
    pub fn new() -> Self {
        Self { metrics: RwLock::new(HashMap::new()) }
    }

    /// Write one pass worth of samples under a single exclusive guard.
    pub async fn apply(&self, batch: Vec<Metric>) {
        let mut map = self.metrics.write().await;
        for metric in batch {
            match map.entry(metric.id.clone()) {
                Entry::Vacant(slot) => {
                    slot.insert(metric);
                }
                Entry::Occupied(mut slot) => {
                    match (&mut slot.get_mut().value, metric.value) {
                        (MetricValue::Counter(total), MetricValue::Counter(delta)) => {
                            *total += delta;
                        }
                        (current, new) => *current = new,
                    }
                }
            }
        }
    }

    /// Immutable copy of the current samples, taken under the shared side of
    /// the lock.
    pub async fn batch(&self) -> Vec<Metric> {
        let map = self.metrics.read().await;
        map.values().cloned().collect()
    }

    /// Subtract the counter deltas of a successfully published batch, so the
    /// next publish only carries what accumulated since.
    pub async fn commit_published(&self, published: &[Metric]) {
        let mut map = self.metrics.write().await;
        for metric in published {
            let Some(delta) = metric.delta() else { continue };
            if let Some(entry) = map.get_mut(&metric.id) {
                if let MetricValue::Counter(total) = &mut entry.value {
                    *total -= delta;
                }
            }
        }
    }

    pub async fn len(&self) -> usize {
        self.metrics.read().await.len()
    }
}

impl Default for Samples {
    fn default() -> Self {
        Self::new()
    }
}

/// The two pollers over a persistent `sysinfo` handle.
pub struct Sampler {
    samples: Arc<Samples>,
    system: Mutex<System>,
}

impl Sampler {
    pub fn new(samples: Arc<Samples>) -> Self {
        Self { samples, system: Mutex::new(System::new()) }
    }

    /// Tick both pollers every `poll_interval` seconds until shutdown. Each
    /// tick spawns the two passes as short tasks; their errors are logged.
    pub async fn run(
        self: Arc<Self>,
        poll_interval: u64,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        let mut ticker = tokio::time::interval(Duration::from_secs(poll_interval));
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    return;
                }
                _ = ticker.tick() => {
                    let runtime = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = runtime.runtime_pass().await {
                            error!(error = %err, "runtime sampling failed");
                        }
                    });

                    let host = self.clone();
                    tokio::spawn(async move {
                        if let Err(err) = host.host_pass().await {
                            error!(error = %err, "host sampling failed");
                        }
                    });
                }
            }
        }
    }

    /// Sample the agent process and machine runtime figures: 27 gauges plus
    /// `PollCount` (+1) and `RandomValue`.
    pub async fn runtime_pass(&self) -> Result<()> {
        let mut batch = Vec::with_capacity(29);

        {
            let mut sys = self.system.lock().await;
            sys.refresh_memory();
            sys.refresh_cpu_usage();
            sys.refresh_processes();

            let pid = sysinfo::get_current_pid().map_err(HarvestError::transient)?;
            let proc = sys
                .process(pid)
                .ok_or_else(|| HarvestError::transient("own process not visible"))?;

            let disk = proc.disk_usage();
            let load = System::load_average();

            let gauges: [(&str, f64); 24] = [
                ("CpuPercent", proc.cpu_usage() as f64),
                ("ResidentMemory", proc.memory() as f64),
                ("VirtualMemory", proc.virtual_memory() as f64),
                ("RunTime", proc.run_time() as f64),
                ("StartTime", proc.start_time() as f64),
                ("DiskReadBytes", disk.read_bytes as f64),
                ("DiskReadBytesTotal", disk.total_read_bytes as f64),
                ("DiskWrittenBytes", disk.written_bytes as f64),
                ("DiskWrittenBytesTotal", disk.total_written_bytes as f64),
                ("MemoryUsed", sys.used_memory() as f64),
                ("MemoryAvailable", sys.available_memory() as f64),
                ("SwapTotal", sys.total_swap() as f64),
                ("SwapFree", sys.free_swap() as f64),
                ("SwapUsed", sys.used_swap() as f64),
                ("Uptime", System::uptime() as f64),
                ("BootTime", System::boot_time() as f64),
                ("LoadAverage1", load.one),
                ("LoadAverage5", load.five),
                ("LoadAverage15", load.fifteen),
                ("ProcessCount", sys.processes().len() as f64),
                ("CpuCount", sys.cpus().len() as f64),
                ("PhysicalCoreCount", sys.physical_core_count().unwrap_or(0) as f64),
                ("GlobalCpuPercent", sys.global_cpu_info().cpu_usage() as f64),
                ("CpuFrequency", sys.cpus().first().map(|c| c.frequency()).unwrap_or(0) as f64),
            ];
            for (id, value) in gauges {
                batch.push(Metric::gauge(id, value));
            }

            let networks = Networks::new_with_refreshed_list();
            let (mut received, mut transmitted, mut packets) = (0u64, 0u64, 0u64);
            for (_, data) in networks.iter() {
                received += data.total_received();
                transmitted += data.total_transmitted();
                packets += data.total_packets_received();
            }
            batch.push(Metric::gauge("NetworkReceivedBytes", received as f64));
            batch.push(Metric::gauge("NetworkTransmittedBytes", transmitted as f64));
            batch.push(Metric::gauge("NetworkPacketsReceived", packets as f64));
        }

        batch.push(Metric::counter(POLL_COUNT, 1));
        batch.push(Metric::gauge(RANDOM_VALUE, rand::random::<f64>()));

        self.samples.apply(batch).await;
        debug!("runtime metrics sampled");
        Ok(())
    }

    /// Sample host memory and per-CPU utilization percentages. CPU usage
    /// needs two refreshes a minimum interval apart.
    pub async fn host_pass(&self) -> Result<()> {
        {
            let mut sys = self.system.lock().await;
            sys.refresh_cpu_usage();
        }
        tokio::time::sleep(MINIMUM_CPU_UPDATE_INTERVAL).await;

        let mut batch = Vec::new();
        {
            let mut sys = self.system.lock().await;
            sys.refresh_cpu_usage();
            sys.refresh_memory();

            batch.push(Metric::gauge("TotalMemory", sys.total_memory() as f64));
            batch.push(Metric::gauge("FreeMemory", sys.free_memory() as f64));
            for (i, cpu) in sys.cpus().iter().enumerate() {
                batch.push(Metric::gauge(
                    format!("CPUutilization{}", i + 1),
                    cpu.cpu_usage() as f64,
                ));
            }
        }

        self.samples.apply(batch).await;
        debug!("host metrics sampled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn runtime_pass_writes_the_fixed_set() {
        let samples = Arc::new(Samples::new());
        let sampler = Sampler::new(samples.clone());

        sampler.runtime_pass().await.unwrap();

        // 27 gauges + PollCount + RandomValue
        assert_eq!(samples.len().await, 29);

        let batch = samples.batch().await;
        let poll_count = batch.iter().find(|m| m.id == POLL_COUNT).unwrap();
        assert_eq!(poll_count.delta(), Some(1));
        assert!(batch.iter().any(|m| m.id == RANDOM_VALUE));
    }

    #[tokio::test]
    async fn poll_count_accumulates_across_passes() {
        let samples = Arc::new(Samples::new());
        let sampler = Sampler::new(samples.clone());

        sampler.runtime_pass().await.unwrap();
        sampler.runtime_pass().await.unwrap();

        let batch = samples.batch().await;
        let poll_count = batch.iter().find(|m| m.id == POLL_COUNT).unwrap();
        assert_eq!(poll_count.delta(), Some(2));
    }

    #[tokio::test]
    async fn host_pass_writes_memory_and_cpus() {
        let samples = Arc::new(Samples::new());
        let sampler = Sampler::new(samples.clone());

        sampler.host_pass().await.unwrap();

        let batch = samples.batch().await;
        assert!(batch.iter().any(|m| m.id == "TotalMemory"));
        assert!(batch.iter().any(|m| m.id == "FreeMemory"));
        assert!(batch.iter().any(|m| m.id == "CPUutilization1"));
    }

    #[tokio::test]
    async fn commit_published_drains_counters_only() {
        let samples = Samples::new();
        samples
            .apply(vec![Metric::counter(POLL_COUNT, 3), Metric::gauge("temp", 1.5)])
            .await;

        let published = samples.batch().await;
        // More samples arrive while the publish is in flight.
        samples.apply(vec![Metric::counter(POLL_COUNT, 1)]).await;

        samples.commit_published(&published).await;

        let batch = samples.batch().await;
        let poll_count = batch.iter().find(|m| m.id == POLL_COUNT).unwrap();
        assert_eq!(poll_count.delta(), Some(1));
        let temp = batch.iter().find(|m| m.id == "temp").unwrap();
        assert_eq!(temp.gauge_value(), Some(1.5));
    }
}
