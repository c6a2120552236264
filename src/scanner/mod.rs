pub mod matrix;
pub mod probe;
pub mod results;
pub mod signature;
pub mod transport;
pub mod wire;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use indicatif::ProgressBar;
use tokio::sync::{Mutex, Semaphore};
use tracing::{error, info};

use crate::error::Result;
pub use matrix::{generate, generate_filtered, QueryAxes, TestCase};
pub use results::{round_id, FingerprintEntry, Observations, ProbeTarget, RoundAccumulator};
pub use signature::{canonicalize, Signature};
pub use transport::{Transport, TransportError, UdpTransport};

/// Runs (target, test case) probes through a bounded worker pool.
pub struct ProbeExecutor {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    workers: usize,
    progress: Option<ProgressBar>,
}

impl ProbeExecutor {
    pub fn new(transport: Arc<dyn Transport>, timeout: Duration, workers: usize) -> Self {
        Self {
            transport,
            timeout,
            workers: workers.max(1),
            progress: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Every test case against one target.
    pub async fn probe(&self, target: &ProbeTarget, cases: &[TestCase]) -> Observations {
        let accumulator = self.sweep(std::slice::from_ref(target), cases).await;
        accumulator.observations(0).cloned().unwrap_or_default()
    }

    /// One probe per (target, test case) pair.
    ///
    /// At most `workers` probes are in flight. Returns only after every probe
    /// has finished, so the caller may start the next sweep straight away.
    pub async fn sweep(&self, targets: &[ProbeTarget], cases: &[TestCase]) -> RoundAccumulator {
        let semaphore = Arc::new(Semaphore::new(self.workers));
        let accumulator = Arc::new(Mutex::new(RoundAccumulator::new()));
        let cases: Arc<Vec<TestCase>> = Arc::new(cases.to_vec());
        let mut tasks = Vec::with_capacity(targets.len() * cases.len());

        for (target_index, target) in targets.iter().enumerate() {
            for case_index in 0..cases.len() {
                // Acquire before spawning so outstanding sockets stay bounded
                let permit = match semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(e) => {
                        error!("worker pool closed early: {}", e);
                        break;
                    }
                };
                let transport = self.transport.clone();
                let accumulator = accumulator.clone();
                let cases = cases.clone();
                let address = target.address;
                let wait = self.timeout;
                let progress = self.progress.clone();

                tasks.push(tokio::spawn(async move {
                    let case = &cases[case_index];
                    let signature = probe::probe_once(transport.as_ref(), address, case, wait).await;
                    accumulator.lock().await.record(target_index, &case.name, signature);
                    if let Some(pb) = progress {
                        pb.inc(1);
                    }
                    drop(permit);
                }));
            }
        }

        for joined in join_all(tasks).await {
            if let Err(e) = joined {
                error!("probe task failed: {}", e);
            }
        }

        match Arc::try_unwrap(accumulator) {
            Ok(accumulator) => accumulator.into_inner(),
            Err(shared) => shared.lock().await.clone(),
        }
    }

    /// Repeat full sweeps `rounds` times, handing each finished round to `on_round`.
    pub async fn run_rounds<F>(
        &self,
        targets: &[ProbeTarget],
        cases: &[TestCase],
        rounds: usize,
        mut on_round: F,
    ) -> Result<()>
    where
        F: FnMut(Vec<FingerprintEntry>) -> Result<()>,
    {
        for round in 1..=rounds {
            let accumulator = self.sweep(targets, cases).await;
            info!(
                "round {}/{} finished: {} probes, {} failed",
                round,
                rounds,
                accumulator.probes(),
                accumulator.failures()
            );
            on_round(accumulator.into_entries(targets, &round_id(round)))?;
        }
        Ok(())
    }
}
