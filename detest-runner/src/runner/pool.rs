// Copyright (c) The detest Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The bounded pool of runners behind the oracle contract.

use crate::{
    errors::{ConfigError, OracleError, RunnerError, RunnerInitError},
    oracle::{Oracle, RunResults},
    runner::Runner,
};
use futures::future;
use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{error, info, warn};

/// The default number of runners in a pool.
pub const DEFAULT_POOL_SIZE: usize = 1;

/// A bounded set of runners exposing the oracle contract with back-pressure.
///
/// Runners circulate between two queues: `ready` (bounded to the pool size)
/// holds idle, freshly reset runners; `to_reset` receives runners after each
/// use. One reset task per runner moves them back from `to_reset` to
/// `ready`, so a runner token reappears on `ready` only after its reset
/// completed.
pub struct RunnerPool<R: Runner> {
    ready_rx: Mutex<mpsc::Receiver<R>>,
    reset_tx: mpsc::UnboundedSender<R>,
    live: Arc<AtomicUsize>,
    shutdown_tx: watch::Sender<bool>,
}

impl<R: Runner> RunnerPool<R> {
    /// Creates a pool of `size` runners produced by `build`.
    ///
    /// Constructions run in parallel; runners that fail to build or to
    /// complete their initial reset are logged and excluded, and the pool
    /// comes up with the remaining ones. A pool degraded to zero runners
    /// reports [`OracleError::NoRunner`] on every call.
    pub async fn new<F, Fut>(size: usize, build: F) -> Result<Self, ConfigError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<R, RunnerInitError>>,
    {
        if size == 0 {
            return Err(ConfigError::PoolSizeZero);
        }

        let constructions = (0..size).map(|k| build(format!("runner-{k}")));
        let mut built = Vec::with_capacity(size);
        for result in future::join_all(constructions).await {
            match result {
                Ok(runner) => built.push(runner),
                Err(err) => warn!("failed to initialize runner: {err}"),
            }
        }

        // The first reset brings up each runner's app instance.
        let resets = built.into_iter().map(|mut runner| async move {
            match runner.reset().await {
                Ok(()) => Some(runner),
                Err(err) => {
                    warn!("failed to reset runner during pool init: {err}");
                    if let Err(err) = runner.destroy().await {
                        error!("failed to delete runner: {err}");
                    }
                    None
                }
            }
        });
        let runners: Vec<R> = future::join_all(resets).await.into_iter().flatten().collect();

        let count = runners.len();
        let live = Arc::new(AtomicUsize::new(count));
        let (ready_tx, ready_rx) = mpsc::channel(count.max(1));
        let (reset_tx, reset_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let reset_rx = Arc::new(Mutex::new(reset_rx));

        for _ in 0..count {
            tokio::spawn(reset_task(
                ready_tx.clone(),
                Arc::clone(&reset_rx),
                shutdown_rx.clone(),
                Arc::clone(&live),
            ));
        }

        for runner in runners {
            ready_tx
                .send(runner)
                .await
                .unwrap_or_else(|_| panic!("the pool holds the ready receiver"));
        }

        info!("successfully initialized {count} runners");

        Ok(Self {
            ready_rx: Mutex::new(ready_rx),
            reset_tx,
            live,
            shutdown_tx,
        })
    }

    /// The number of currently usable runners.
    pub fn size(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Reserves a runner, executes the schedule on it, and hands the runner
    /// back for reset.
    pub async fn run_schedule(&self, schedule: Vec<String>) -> Result<RunResults, OracleError> {
        if self.size() == 0 {
            return Err(OracleError::NoRunner);
        }

        let runner = {
            let mut ready = self.ready_rx.lock().await;
            ready.recv().await.ok_or(OracleError::NoRunner)?
        };

        let start = Instant::now();
        let result = runner.run(&schedule).await;
        let elapsed = start.elapsed();

        // Hand the runner back even when the run failed: the reset task
        // decides whether it is still usable.
        let _ = self.reset_tx.send(runner);

        Ok(RunResults {
            results: result?,
            elapsed,
        })
    }

    /// Tears the pool down: reclaims every live runner, stops the reset
    /// tasks, and destroys the runners concurrently. The first destruction
    /// error is returned.
    pub async fn delete(&self) -> Result<(), RunnerError> {
        let mut drained = Vec::new();
        {
            let mut ready = self.ready_rx.lock().await;
            // Every live runner eventually lands on the ready queue, so the
            // drain target shrinks only when a reset fails meanwhile.
            while drained.len() < self.size() {
                match ready.recv().await {
                    Some(runner) => drained.push(runner),
                    None => break,
                }
            }
        }

        let _ = self.shutdown_tx.send(true);
        self.live.store(0, Ordering::Release);

        future::join_all(drained.into_iter().map(|runner| runner.destroy()))
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(())
    }
}

impl<R: Runner> Oracle for RunnerPool<R> {
    fn run_schedule(
        &self,
        schedule: Vec<String>,
    ) -> impl Future<Output = Result<RunResults, OracleError>> + Send {
        RunnerPool::run_schedule(self, schedule)
    }

    fn size(&self) -> usize {
        RunnerPool::size(self)
    }
}

/// Moves runners from the reset queue back to the ready queue. A runner
/// whose reset fails is destroyed, the pool capacity shrinks by one, and
/// the task exits; the remaining tasks keep serving the shared queue.
async fn reset_task<R: Runner>(
    ready_tx: mpsc::Sender<R>,
    reset_rx: Arc<Mutex<mpsc::UnboundedReceiver<R>>>,
    mut shutdown_rx: watch::Receiver<bool>,
    live: Arc<AtomicUsize>,
) {
    loop {
        let runner = {
            let mut reset = reset_rx.lock().await;
            tokio::select! {
                _ = shutdown_rx.changed() => return,
                runner = reset.recv() => match runner {
                    Some(runner) => runner,
                    None => return,
                },
            }
        };

        let mut runner = runner;
        match runner.reset().await {
            Ok(()) => {
                if ready_tx.send(runner).await.is_err() {
                    return;
                }
            }
            Err(err) => {
                error!("failed to reset runner {}: {err}", runner.id());
                live.fetch_sub(1, Ordering::AcqRel);
                if let Err(err) = runner.destroy().await {
                    error!("failed to delete runner: {err}");
                }
                return;
            }
        }
    }
}
