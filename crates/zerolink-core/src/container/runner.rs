//! Supervisor for containers.
//!
//! [`ContainerRunner::start`] runs every registered container as its own task
//! and scans them once per tick. A worker that ended with an error (or a panic)
//! is replaced by a fresh one running the same container with the same
//! configuration; a worker that ended cleanly is dropped. `start` returns once
//! no workers are left, so stopping every container ends the supervisor.
//!
//! Restarts are immediate and unbounded. Once [`ContainerRunner::stop`] is
//! requested nothing is restarted any more; a container that was still starting
//! is asked to stop again on every tick and its worker is aborted when the stop
//! grace period runs out.

use crate::config::{RunConfig, RunnerConfig};
use crate::{Result, ZerolinkError};
use async_trait::async_trait;
use futures::FutureExt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

/// Something the runner can supervise.
#[async_trait]
pub trait Runnable: Send + Sync + 'static {
    /// Serve until stopped (`Ok`) or failed (`Err`).
    async fn run(&self, config: &RunConfig) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Name used in logs.
    fn type_name(&self) -> &str;
}

#[derive(Clone)]
struct Registration {
    container: Arc<dyn Runnable>,
    config: RunConfig,
}

struct Worker {
    name: String,
    registration: Registration,
    join: JoinHandle<Result<()>>,
}

impl Worker {
    fn spawn(name: String, registration: Registration) -> Self {
        let container = registration.container.clone();
        let config = registration.config.clone();
        let join = tokio::spawn(async move { container.run(&config).await });
        Self {
            name,
            registration,
            join,
        }
    }
}

struct RunnerInner {
    containers: Mutex<Vec<(String, Registration)>>,
    workers: Mutex<Vec<Worker>>,
    auxiliary: Mutex<Vec<JoinHandle<()>>>,
    tick: Duration,
    stop_grace: Duration,
    running: AtomicBool,
    /// When `stop` was first requested during the current run.
    stop_requested: Mutex<Option<Instant>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Handle to the process supervisor. Clones share the same state.
#[derive(Clone)]
pub struct ContainerRunner {
    inner: Arc<RunnerInner>,
}

impl ContainerRunner {
    pub fn new() -> Self {
        Self::with_tick(RunnerConfig::LOOP_WAIT_TIME)
    }

    /// A runner scanning its workers every `tick`.
    pub fn with_tick(tick: Duration) -> Self {
        Self::with_timings(tick, RunnerConfig::STOP_GRACE_PERIOD)
    }

    /// A runner scanning every `tick` that aborts workers which have not
    /// stopped `stop_grace` after a stop request.
    pub fn with_timings(tick: Duration, stop_grace: Duration) -> Self {
        Self {
            inner: Arc::new(RunnerInner {
                containers: Mutex::new(Vec::new()),
                workers: Mutex::new(Vec::new()),
                auxiliary: Mutex::new(Vec::new()),
                tick,
                stop_grace,
                running: AtomicBool::new(false),
                stop_requested: Mutex::new(None),
            }),
        }
    }

    /// Register `container` under `name`, replacing an earlier registration of
    /// the same name. Workers that are already running are not affected.
    pub fn register(&self, name: impl Into<String>, container: Arc<dyn Runnable>, config: RunConfig) {
        let name = name.into();
        let registration = Registration { container, config };
        let mut containers = lock(&self.inner.containers);

        match containers.iter_mut().find(|(existing, _)| *existing == name) {
            Some((_, slot)) => *slot = registration,
            None => containers.push((name, registration)),
        }
    }

    /// Registered names, in registration order.
    pub fn registered(&self) -> Vec<String> {
        lock(&self.inner.containers)
            .iter()
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Number of tracked workers.
    pub fn worker_count(&self) -> usize {
        lock(&self.inner.workers).len()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Start a side task that is not supervised. It is aborted when `start`
    /// returns.
    pub fn spawn_auxiliary<F>(&self, name: &str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Starting auxiliary worker {}", name);
        lock(&self.inner.auxiliary).push(tokio::spawn(task));
    }

    /// Run every registered container and keep them alive until all of them
    /// have stopped cleanly.
    pub async fn start(&self) -> Result<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(ZerolinkError::Other(
                "Container runner is already running".to_string(),
            ));
        }

        *lock(&self.inner.stop_requested) = None;

        let registrations: Vec<(String, Registration)> = lock(&self.inner.containers).clone();
        {
            let mut workers = lock(&self.inner.workers);
            for (name, registration) in registrations {
                info!("Starting container {} ({})", name, registration.container.type_name());
                workers.push(Worker::spawn(name, registration));
            }
        }

        loop {
            tokio::time::sleep(self.inner.tick).await;
            let stop_requested = *lock(&self.inner.stop_requested);
            if let Some(since) = stop_requested {
                self.stop_live_workers(since).await;
            }
            if self.scan(stop_requested.is_some()) == 0 {
                break;
            }
        }

        *lock(&self.inner.stop_requested) = None;
        for task in lock(&self.inner.auxiliary).drain(..) {
            task.abort();
        }
        self.inner.running.store(false, Ordering::SeqCst);
        info!("Container runner finished, no workers left");
        Ok(())
    }

    /// Replace crashed workers (unless stopping), drop finished ones; returns
    /// the tracked count.
    fn scan(&self, stopping: bool) -> usize {
        let mut workers = lock(&self.inner.workers);
        let current = std::mem::take(&mut *workers);

        for mut worker in current {
            if !worker.join.is_finished() {
                workers.push(worker);
                continue;
            }

            let outcome = match (&mut worker.join).now_or_never() {
                Some(outcome) => outcome,
                None => {
                    workers.push(worker);
                    continue;
                }
            };

            match outcome {
                Ok(Ok(())) => {
                    info!("Worker {} stopped", worker.name);
                }
                Ok(Err(e)) if stopping => {
                    info!("Worker {} ended while stopping, not restarting: {}", worker.name, e);
                }
                Err(e) if stopping => {
                    info!("Worker {} ended while stopping, not restarting: {}", worker.name, e);
                }
                Ok(Err(e)) => {
                    warn!("Worker {} is dead: {}", worker.name, e);
                    info!("Restarting worker {}", worker.name);
                    workers.push(Worker::spawn(worker.name, worker.registration));
                }
                Err(e) => {
                    error!("Worker {} panicked: {}", worker.name, e);
                    info!("Restarting worker {}", worker.name);
                    workers.push(Worker::spawn(worker.name, worker.registration));
                }
            }
        }

        workers.len()
    }

    /// Stop every registered container and stop restarting crashed ones.
    ///
    /// Containers that are not serving yet are skipped here; the supervisor
    /// loop keeps asking them on every tick until `start` returns.
    pub async fn stop(&self) -> Result<()> {
        lock(&self.inner.stop_requested).get_or_insert_with(Instant::now);

        let registrations: Vec<(String, Registration)> = lock(&self.inner.containers).clone();
        for (name, registration) in registrations {
            match registration.container.stop().await {
                Ok(()) => debug!("Stopped container {}", name),
                Err(ZerolinkError::ContainerNotRunning) => {
                    debug!("Container {} was not running", name)
                }
                Err(e) => warn!("Failed to stop container {}: {}", name, e),
            }
        }
        Ok(())
    }

    /// Ask every still running worker's container to stop; abort the ones that
    /// are not serving once the grace period since `since` is over.
    async fn stop_live_workers(&self, since: Instant) {
        let live: Vec<(String, Arc<dyn Runnable>, AbortHandle)> = lock(&self.inner.workers)
            .iter()
            .filter(|worker| !worker.join.is_finished())
            .map(|worker| {
                (
                    worker.name.clone(),
                    worker.registration.container.clone(),
                    worker.join.abort_handle(),
                )
            })
            .collect();
        let overdue = since.elapsed() >= self.inner.stop_grace;

        for (name, container, abort) in live {
            match container.stop().await {
                Ok(()) => debug!("Stopped container {}", name),
                Err(ZerolinkError::ContainerNotRunning) if overdue => {
                    warn!("Container {} did not finish starting, aborting its worker", name);
                    abort.abort();
                }
                Err(ZerolinkError::ContainerNotRunning) => {
                    debug!("Container {} is still starting", name)
                }
                Err(e) => warn!("Failed to stop container {}: {}", name, e),
            }
        }
    }
}

impl Default for ContainerRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ContainerRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerRunner")
            .field("containers", &self.registered())
            .field("workers", &self.worker_count())
            .field("tick", &self.inner.tick)
            .finish()
    }
}
