//! Bounded, concurrent dispatch of detected files through the pipeline.
//!
//! Detections arrive over a bounded queue. A semaphore caps concurrent
//! pipelines at `worker_count`, and every in-flight file is tracked in a
//! registry owned by the orchestrator instance. A path detected again while
//! in flight is marked for one more run, started when the current one ends.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, mpsc, watch, Notify, OwnedSemaphorePermit, Semaphore};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::error::WorkerError;
use crate::pipeline::{FatalError, FileOutcome, FilePipeline, ProgressReporter, TracingProgress};
use crate::sanitize;
use crate::worker::job::{FileDetected, FileReport};

const REPORT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct OrchestratorOptions {
    pub worker_count: usize,
    pub queue_capacity: usize,
}

impl OrchestratorOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            worker_count: config.worker_count,
            queue_capacity: config.queue_capacity(),
        }
    }
}

/// Cloneable intake handle returned by [`Orchestrator::start`].
#[derive(Clone)]
pub struct DetectionSender {
    tx: mpsc::Sender<FileDetected>,
    accepting: Arc<AtomicBool>,
}

impl DetectionSender {
    /// Waits for queue space.
    pub async fn send(&self, event: FileDetected) -> Result<(), WorkerError> {
        self.check_accepting()?;
        self.tx
            .send(event)
            .await
            .map_err(|_| WorkerError::ChannelClosed)
    }

    /// Blocks the calling thread while the queue is full. For use from
    /// watcher threads only, never from async code.
    pub fn blocking_send(&self, event: FileDetected) -> Result<(), WorkerError> {
        self.check_accepting()?;
        self.tx
            .blocking_send(event)
            .map_err(|_| WorkerError::ChannelClosed)
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst) && !self.tx.is_closed()
    }

    fn check_accepting(&self) -> Result<(), WorkerError> {
        if self.accepting.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(WorkerError::NotAccepting)
        }
    }
}

#[derive(Debug, Default)]
pub struct StopReport {
    /// True when every in-flight file reached a terminal state in time.
    pub drained: bool,
    /// Files whose pipelines were force-terminated. Recovery reconciles them.
    pub aborted: Vec<PathBuf>,
    /// Queued detections that were never dispatched.
    pub dropped: usize,
    pub fatal: Option<FatalError>,
}

type RunHandle = JoinHandle<Result<FileOutcome, FatalError>>;

struct InFlight {
    abort: AbortHandle,
    /// Latest detection that arrived during the current run.
    rerun: Option<FileDetected>,
}

struct Shared {
    in_flight: Mutex<HashMap<PathBuf, InFlight>>,
    idle: Notify,
    fatal: Mutex<Option<FatalError>>,
    accepting: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    reports: broadcast::Sender<FileReport>,
}

impl Shared {
    fn registry(&self) -> MutexGuard<'_, HashMap<PathBuf, InFlight>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Publishes the result of one run. Returns false when the path must
    /// not run again.
    fn settle(
        &self,
        path: &Path,
        result: Result<Result<FileOutcome, FatalError>, tokio::task::JoinError>,
        elapsed: Duration,
    ) -> bool {
        let outcome = match result {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(fatal)) => {
                error!(error = %fatal, "Fatal pipeline error, stopping intake");
                self.record_fatal(fatal);
                self.request_shutdown();
                return false;
            }
            Err(e) if e.is_panic() => {
                error!(file = %sanitize::redact_path(path), "Pipeline task panicked");
                FileOutcome::Failed {
                    reason: "pipeline task panicked".to_string(),
                    relocated_to: None,
                }
            }
            Err(_) => {
                debug!(file = %sanitize::redact_path(path), "Pipeline task aborted");
                return false;
            }
        };

        // No subscribers is fine.
        let _ = self.reports.send(FileReport {
            path: path.to_path_buf(),
            outcome,
            elapsed,
        });
        true
    }

    fn request_shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.shutdown.send_replace(true);
    }

    fn record_fatal(&self, err: FatalError) {
        let mut slot = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(err);
        }
    }
}

pub struct Orchestrator {
    pipeline: Arc<FilePipeline>,
    options: OrchestratorOptions,
    progress: Arc<dyn ProgressReporter>,
    shared: Arc<Shared>,
    dispatcher: Option<JoinHandle<usize>>,
}

impl Orchestrator {
    pub fn new(pipeline: Arc<FilePipeline>, options: OrchestratorOptions) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (reports, _) = broadcast::channel(REPORT_CAPACITY);
        Self {
            pipeline,
            options,
            progress: Arc::new(TracingProgress),
            shared: Arc::new(Shared {
                in_flight: Mutex::new(HashMap::new()),
                idle: Notify::new(),
                fatal: Mutex::new(None),
                accepting: Arc::new(AtomicBool::new(false)),
                shutdown,
                reports,
            }),
            dispatcher: None,
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// One report per finished run, in completion order.
    pub fn subscribe(&self) -> broadcast::Receiver<FileReport> {
        self.shared.reports.subscribe()
    }

    /// Flips to true when shutdown begins, including after a fatal error.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shared.shutdown.subscribe()
    }

    pub fn in_flight(&self) -> Vec<PathBuf> {
        let mut paths: Vec<_> = self.shared.registry().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Spawns the dispatcher. Must be called inside a Tokio runtime.
    pub fn start(&mut self) -> Result<DetectionSender, WorkerError> {
        if self.dispatcher.is_some() || *self.shared.shutdown.borrow() {
            return Err(WorkerError::AlreadyStarted);
        }

        let (tx, rx) = mpsc::channel(self.options.queue_capacity.max(1));
        self.shared.accepting.store(true, Ordering::SeqCst);

        let dispatcher = Dispatcher {
            rx,
            semaphore: Arc::new(Semaphore::new(self.options.worker_count.max(1))),
            pipeline: Arc::clone(&self.pipeline),
            progress: Arc::clone(&self.progress),
            shared: Arc::clone(&self.shared),
            shutdown: self.shared.shutdown.subscribe(),
        };
        self.dispatcher = Some(tokio::spawn(dispatcher.run()));

        info!(
            workers = self.options.worker_count,
            queue = self.options.queue_capacity,
            "Orchestrator started"
        );

        Ok(DetectionSender {
            tx,
            accepting: Arc::clone(&self.shared.accepting),
        })
    }

    /// Stops intake, gives in-flight files up to `grace` to finish, then
    /// aborts whatever is left.
    pub async fn stop(&mut self, grace: Duration) -> StopReport {
        info!(?grace, "Stopping orchestrator...");
        self.shared.request_shutdown();

        let dropped = match self.dispatcher.take() {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                error!(error = %e, "Dispatcher task failed");
                0
            }),
            None => 0,
        };

        let drained = tokio::time::timeout(grace, self.wait_idle()).await.is_ok();

        let mut aborted: Vec<PathBuf> = if drained {
            Vec::new()
        } else {
            self.shared
                .registry()
                .drain()
                .map(|(path, entry)| {
                    entry.abort.abort();
                    path
                })
                .collect()
        };
        aborted.sort();

        if !aborted.is_empty() {
            warn!(
                count = aborted.len(),
                "Aborted in-flight files after grace period; recovery reconciles them on next start"
            );
        }

        let fatal = self
            .shared
            .fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        info!(drained, dropped, "Orchestrator stopped");
        StopReport {
            drained,
            aborted,
            dropped,
            fatal,
        }
    }

    async fn wait_idle(&self) {
        loop {
            if self.shared.registry().is_empty() {
                return;
            }
            self.shared.idle.notified().await;
        }
    }
}

struct Dispatcher {
    rx: mpsc::Receiver<FileDetected>,
    semaphore: Arc<Semaphore>,
    pipeline: Arc<FilePipeline>,
    progress: Arc<dyn ProgressReporter>,
    shared: Arc<Shared>,
    shutdown: watch::Receiver<bool>,
}

impl Dispatcher {
    /// Returns the number of detections dropped at shutdown.
    async fn run(mut self) -> usize {
        let mut dropped = 0;

        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => break,
                event = self.rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            if let Some(entry) = self.shared.registry().get_mut(&event.absolute_path) {
                debug!(
                    file = %sanitize::redact_path(&event.absolute_path),
                    "Already in flight, running again once the current run ends"
                );
                entry.rerun = Some(event);
                continue;
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown_requested(&mut self.shutdown) => {
                    dropped += 1;
                    break;
                }
                permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            self.dispatch(event, permit);
        }

        self.rx.close();
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            info!(
                dropped,
                "Dropped queued detections; the next startup scan rediscovers them"
            );
        }
        dropped
    }

    /// Runs `event` while holding `permit`, followed by any rerun that was
    /// requested for the same path in the meantime.
    fn dispatch(&self, event: FileDetected, permit: OwnedSemaphorePermit) {
        let path = event.absolute_path.clone();
        let pipeline = Arc::clone(&self.pipeline);
        let progress = Arc::clone(&self.progress);

        // Registering under the lock keeps the finishing task from racing
        // ahead of the insert.
        let mut registry = self.shared.registry();
        let work = spawn_run(&pipeline, &progress, event);
        registry.insert(
            path.clone(),
            InFlight {
                abort: work.abort_handle(),
                rerun: None,
            },
        );
        drop(registry);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let mut work = work;
            loop {
                let started = Instant::now();
                let result = work.await;
                let may_rerun = shared.settle(&path, result, started.elapsed());

                let next = {
                    let mut registry = shared.registry();
                    let rerun = registry
                        .get_mut(&path)
                        .and_then(|entry| entry.rerun.take())
                        .filter(|_| may_rerun && shared.is_accepting());
                    match rerun {
                        Some(event) => {
                            debug!(
                                file = %sanitize::redact_path(&path),
                                "Running again for a newer detection"
                            );
                            let next = spawn_run(&pipeline, &progress, event);
                            if let Some(entry) = registry.get_mut(&path) {
                                entry.abort = next.abort_handle();
                            }
                            Some(next)
                        }
                        None => {
                            registry.remove(&path);
                            if registry.is_empty() {
                                shared.idle.notify_one();
                            }
                            None
                        }
                    }
                };

                match next {
                    Some(next) => work = next,
                    None => break,
                }
            }
            drop(permit);
        });
    }
}

fn spawn_run(
    pipeline: &Arc<FilePipeline>,
    progress: &Arc<dyn ProgressReporter>,
    event: FileDetected,
) -> RunHandle {
    let pipeline = Arc::clone(pipeline);
    let progress = Arc::clone(progress);
    tokio::spawn(async move { pipeline.run(&event, progress.as_ref()).await })
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        let stop = *rx.borrow_and_update();
        if stop {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
