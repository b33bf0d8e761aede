//! The scheduling loop: one cycle at startup, then one per tick, until closed.
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::metrics::ExporterMetrics;
use crate::speedtest::{run_tests, SpeedTest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Idle,
    Running,
    Stopped,
}

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("run loop task failed: {0}")]
    Task(#[from] JoinError),
}

/// Owns the background run task and the signal used to stop it.
pub struct Runner {
    run_loop: Option<RunLoop>,
    shutdown_tx: watch::Sender<bool>,
    state: Arc<watch::Sender<RunnerState>>,
    handle: Option<JoinHandle<()>>,
}

/// State moved into the background task.
struct RunLoop {
    speed_test: Arc<dyn SpeedTest>,
    server_ids: Arc<[i32]>,
    tick_rate: Duration,
    metrics: ExporterMetrics,
    shutdown_rx: watch::Receiver<bool>,
}

impl Runner {
    /// `tick_rate` must be non-zero.
    pub fn new(
        speed_test: Arc<dyn SpeedTest>,
        server_ids: impl Into<Arc<[i32]>>,
        tick_rate: Duration,
        metrics: ExporterMetrics,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (state, _) = watch::channel(RunnerState::Idle);
        Self {
            run_loop: Some(RunLoop {
                speed_test,
                server_ids: server_ids.into(),
                tick_rate,
                metrics,
                shutdown_rx,
            }),
            shutdown_tx,
            state: Arc::new(state),
            handle: None,
        }
    }

    pub fn state(&self) -> RunnerState {
        *self.state.borrow()
    }

    /// Spawns the run task. Calling it again, or after `close`, does nothing.
    pub fn start(&mut self) {
        let Some(run_loop) = self.run_loop.take() else {
            warn!("Runner already started, ignoring start request.");
            return;
        };
        self.state.send_replace(RunnerState::Running);
        let state = Arc::clone(&self.state);
        self.handle = Some(tokio::spawn(async move {
            run_loop.run().await;
            state.send_replace(RunnerState::Stopped);
        }));
    }

    /// Requests shutdown and waits for the run task to observe it.
    ///
    /// A speed test that is already running is left to finish; the loop stops
    /// at the next server or tick boundary.
    pub async fn close(&mut self) -> Result<(), RunnerError> {
        self.shutdown_tx.send_replace(true);
        self.run_loop = None;

        let result = match self.handle.take() {
            Some(handle) => handle.await.map_err(|e| {
                error!(error = %e, "Run loop task did not finish cleanly.");
                RunnerError::from(e)
            }),
            None => Ok(()),
        };
        self.state.send_replace(RunnerState::Stopped);
        result
    }
}

impl RunLoop {
    async fn run(mut self) {
        let mut ticker = tokio::time::interval_at(Instant::now() + self.tick_rate, self.tick_rate);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut cycle_start = Instant::now();
        self.run_speed_tests().await;

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown_rx.changed() => {
                    if changed.is_err() || *self.shutdown_rx.borrow() {
                        info!("Shutdown signal received, terminating speed test loop.");
                        break;
                    }
                }

                _ = ticker.tick() => {
                    let now = Instant::now();
                    self.metrics.set_wait_time(now.duration_since(cycle_start));
                    cycle_start = now;

                    info!("Running speed tests...");
                    self.run_speed_tests().await;
                    info!("Done running speed tests");
                }
            }
        }
        info!("Speed test loop gracefully shut down.");
    }

    fn closing(&self) -> bool {
        let closing = *self.shutdown_rx.borrow();
        debug!(closing, "Checked for shutdown.");
        closing
    }

    /// One full cycle over every server, recording its results and timings.
    async fn run_speed_tests(&self) {
        if self.closing() {
            return;
        }

        let start = Instant::now();
        self.metrics.cycle_started(Utc::now().timestamp());

        let (results, err) =
            run_tests(self.speed_test.as_ref(), &self.server_ids, &self.shutdown_rx).await;
        match &err {
            Some(e) => error!(
                error = %e,
                requested = self.server_ids.len(),
                succeeded = results.len(),
                "Speed tests failed"
            ),
            None => info!(num_tests = results.len(), "Speed tests succeeded"),
        }
        self.metrics.inc_runs();

        for result in &results {
            if result.is_missing_data() {
                warn!(
                    server_id = result.server.id,
                    "Speed test result is missing data, publishing it as reported."
                );
            }
            self.metrics.record_result(result);
        }

        self.metrics.set_run_time(start.elapsed());
        self.metrics.cycle_finished(Utc::now().timestamp());
    }
}
