//! Publish pipeline: report loop + bounded worker pool.
//!
//! Every `report_interval` seconds the report loop enqueues the shared
//! sample map on a bounded job queue. `rate_limit` workers take jobs off the
//! queue, copy an immutable batch under the shared lock and hand it to the
//! transport. Publish errors travel over a result channel and are logged;
//! one failure never stops the pool.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, error, warn};

use harvest_core::Result;

use crate::sampler::Samples;
use crate::transport::Transport;

const JOB_QUEUE_CAPACITY: usize = 1024;

/// How long to wait for workers to drain in-flight publishes on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Publisher {
    samples: Arc<Samples>,
    transport: Arc<dyn Transport>,
    report_interval: u64,
    rate_limit: usize,
}

impl Publisher {
    pub fn new(
        samples: Arc<Samples>,
        transport: Arc<dyn Transport>,
        report_interval: u64,
        rate_limit: usize,
    ) -> Self {
        Self { samples, transport, report_interval, rate_limit }
    }

    /// Run the report loop until shutdown, then close the queue and drain
    /// the pool.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        let (jobs_tx, jobs_rx) = mpsc::channel::<Arc<Samples>>(JOB_QUEUE_CAPACITY);
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));
        let (results_tx, mut results_rx) = mpsc::channel::<Result<()>>(JOB_QUEUE_CAPACITY);

        let mut workers = Vec::with_capacity(self.rate_limit);
        for id in 0..self.rate_limit {
            workers.push(tokio::spawn(worker(
                id,
                self.transport.clone(),
                jobs_rx.clone(),
                results_tx.clone(),
            )));
        }
        drop(results_tx);

        let mut ticker = tokio::time::interval(Duration::from_secs(self.report_interval));
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    break;
                }
                _ = ticker.tick() => {
                    if jobs_tx.try_send(self.samples.clone()).is_err() {
                        warn!("publish queue full, dropping tick");
                    }
                }
                Some(result) = results_rx.recv() => {
                    if let Err(err) = result {
                        error!(error = %err, "publish failed");
                    }
                }
            }
        }

        // Closing the queue lets each worker finish its in-flight item and
        // exit; anything still running after the drain bound is aborted.
        drop(jobs_tx);
        let drain = async {
            for handle in &mut workers {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("worker pool drain timed out, aborting");
            for handle in &workers {
                handle.abort();
            }
        }

        while let Ok(result) = results_rx.try_recv() {
            if let Err(err) = result {
                error!(error = %err, "publish failed");
            }
        }
    }
}

async fn worker(
    id: usize,
    transport: Arc<dyn Transport>,
    jobs: Arc<Mutex<mpsc::Receiver<Arc<Samples>>>>,
    results: mpsc::Sender<Result<()>>,
) {
    loop {
        let job = jobs.lock().await.recv().await;
        let Some(samples) = job else {
            return;
        };

        let batch = samples.batch().await;
        if batch.is_empty() {
            continue;
        }

        let result = transport.publish(batch.clone()).await;
        if result.is_ok() {
            samples.commit_published(&batch).await;
            debug!(worker = id, metrics = batch.len(), "metrics published");
        }

        if results.send(result).await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use harvest_core::{HarvestError, Metric};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct MockTransport {
        fail_first: usize,
        calls: AtomicUsize,
        batches: StdMutex<Vec<Vec<Metric>>>,
    }

    impl MockTransport {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self {
                fail_first,
                calls: AtomicUsize::new(0),
                batches: StdMutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for MockTransport {
        async fn publish(&self, batch: Vec<Metric>) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(HarvestError::transient("mock down"));
            }
            self.batches.lock().unwrap().push(batch);
            Ok(())
        }
    }

    async fn run_workers(
        transport: Arc<MockTransport>,
        samples: Arc<Samples>,
        jobs: usize,
        pool: usize,
    ) -> Vec<Result<()>> {
        let (jobs_tx, jobs_rx) = mpsc::channel(JOB_QUEUE_CAPACITY);
        let jobs_rx = Arc::new(Mutex::new(jobs_rx));
        let (results_tx, mut results_rx) = mpsc::channel(JOB_QUEUE_CAPACITY);

        let mut handles = Vec::new();
        for id in 0..pool {
            handles.push(tokio::spawn(worker(
                id,
                transport.clone(),
                jobs_rx.clone(),
                results_tx.clone(),
            )));
        }
        drop(results_tx);

        for _ in 0..jobs {
            jobs_tx.send(samples.clone()).await.unwrap();
        }
        drop(jobs_tx);

        for handle in handles {
            handle.await.unwrap();
        }

        let mut results = Vec::new();
        while let Some(result) = results_rx.recv().await {
            results.push(result);
        }
        results
    }

    #[tokio::test]
    async fn workers_publish_and_drain_counters() {
        let samples = Arc::new(Samples::new());
        samples.apply(vec![Metric::counter("PollCount", 5)]).await;

        let transport = MockTransport::new(0);
        let results = run_workers(transport.clone(), samples.clone(), 1, 2).await;

        assert_eq!(results.len(), 1);
        assert!(results[0].is_ok());
        assert_eq!(transport.batches.lock().unwrap().len(), 1);

        // Published counter delta was drained from the live map.
        let batch = samples.batch().await;
        assert_eq!(batch.iter().find(|m| m.id == "PollCount").unwrap().delta(), Some(0));
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_pool() {
        let samples = Arc::new(Samples::new());
        samples.apply(vec![Metric::counter("PollCount", 1)]).await;

        let transport = MockTransport::new(1);
        let results = run_workers(transport.clone(), samples.clone(), 3, 2).await;

        assert_eq!(results.len(), 3);
        assert_eq!(results.iter().filter(|r| r.is_err()).count(), 1);
        assert_eq!(transport.batches.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_publish_keeps_counters() {
        let samples = Arc::new(Samples::new());
        samples.apply(vec![Metric::counter("PollCount", 4)]).await;

        let transport = MockTransport::new(usize::MAX);
        let results = run_workers(transport, samples.clone(), 1, 1).await;

        assert!(results[0].is_err());
        let batch = samples.batch().await;
        assert_eq!(batch.iter().find(|m| m.id == "PollCount").unwrap().delta(), Some(4));
    }

    #[tokio::test]
    async fn empty_sample_map_publishes_nothing() {
        let samples = Arc::new(Samples::new());
        let transport = MockTransport::new(0);
        let results = run_workers(transport.clone(), samples, 2, 1).await;

        assert!(results.is_empty());
        assert!(transport.batches.lock().unwrap().is_empty());
    }
}
