use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::config::ModeConfig;
use crate::error::{CoreError, CoreResult};
use crate::model::{Job, JobDescriptor, JobMeta, JobParams, JobResult, ModeSwitchParams, Priority};
use crate::output::OutputStore;
use crate::queue::PriorityQueue;
use crate::registry::{ModelInfo, ModelRegistry, RegistryStats};
use crate::worker::{CancelToken, ProgressEvent, Worker, WorkerFactory};

/// Pushed out of the execution thread for the async side (session router, WS
/// hub) to turn into client-facing events. Sent on an unbounded channel so the
/// dedicated thread never blocks on a slow consumer.
#[derive(Debug, Clone)]
pub enum PoolEvent {
    Progress { job_id: Uuid, fraction: f32, status: String },
    Completed { job_id: Uuid, result: JobResult },
    Failed { job_id: Uuid, error: CoreError },
    Canceled { job_id: Uuid },
    QueueChanged,
    ModeChanged { mode: String },
}

struct Inflight {
    cancel: CancelToken,
    result_tx: Option<oneshot::Sender<CoreResult<JobResult>>>,
}

struct Shared {
    queue: Arc<PriorityQueue>,
    registry: Arc<ModelRegistry>,
    mode_config: RwLock<ModeConfig>,
    worker_factory: Arc<dyn WorkerFactory>,
    output_store: Arc<OutputStore>,
    events: mpsc::UnboundedSender<PoolEvent>,
    inflight: Mutex<HashMap<Uuid, Inflight>>,
    current_mode: Mutex<Option<String>>,
    job_timeout: Duration,
}

/// Owns the single dedicated execution thread that drives one accelerator.
/// Everything else talks to it through [`PriorityQueue`] and the channels in
/// [`Shared`]; the thread itself never touches async machinery.
pub struct WorkerPool {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
    shutdown_called: AtomicBool,
}

impl WorkerPool {
    pub fn new(
        queue: Arc<PriorityQueue>,
        registry: Arc<ModelRegistry>,
        mode_config: ModeConfig,
        worker_factory: Arc<dyn WorkerFactory>,
        output_store: Arc<OutputStore>,
        job_timeout: Duration,
        events: mpsc::UnboundedSender<PoolEvent>,
    ) -> CoreResult<Self> {
        let worker_id = Uuid::new_v4();
        let default_mode = mode_config.default_spec().clone();
        registry.register(ModelInfo {
            model_id: default_mode.name.clone(),
            est_bytes: default_mode.est_vram_bytes,
        });
        let worker = worker_factory.build(worker_id, &default_mode)?;
        crate::metrics::WORKERS_LOADED.set(registry.stats().loaded_models.len() as i64);

        let shared = Arc::new(Shared {
            queue,
            registry,
            mode_config: RwLock::new(mode_config),
            worker_factory,
            output_store,
            events,
            inflight: Mutex::new(HashMap::new()),
            current_mode: Mutex::new(Some(default_mode.name)),
            job_timeout,
        });

        let thread_shared = shared.clone();
        let handle = std::thread::Builder::new()
            .name("dreamqueue-worker".to_string())
            .spawn(move || run_loop(thread_shared, worker))
            .expect("failed to spawn worker execution thread");

        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
            shutdown_called: AtomicBool::new(false),
        })
    }

    /// Enqueues `job`. Non-blocking: returns a receiver that resolves once the
    /// job reaches a terminal state, or fails immediately with `QueueFull`.
    pub fn submit(&self, job: Job) -> CoreResult<oneshot::Receiver<CoreResult<JobResult>>> {
        let (tx, rx) = oneshot::channel();
        let job_id = job.id;
        {
            let mut inflight = self.shared.inflight.lock().unwrap();
            inflight.insert(
                job_id,
                Inflight {
                    cancel: CancelToken::new(),
                    result_tx: Some(tx),
                },
            );
        }
        if self.shared.queue.put(job).is_err() {
            self.shared.inflight.lock().unwrap().remove(&job_id);
            return Err(CoreError::QueueFull);
        }
        emit_queue_changed(&self.shared.events, &self.shared.queue);
        Ok(rx)
    }

    /// Best-effort cancellation. Removes a still-queued job outright; signals
    /// a running job's cancel token and lets the execution loop unwind it.
    /// Returns `false` if `job_id` is unknown or already terminal.
    pub fn cancel(&self, job_id: Uuid) -> bool {
        if self.shared.queue.remove(job_id).is_some() {
            let mut inflight = self.shared.inflight.lock().unwrap();
            if let Some(mut entry) = inflight.remove(&job_id) {
                if let Some(tx) = entry.result_tx.take() {
                    let _ = tx.send(Err(CoreError::Canceled));
                }
            }
            drop(inflight);
            let _ = self.shared.events.send(PoolEvent::Canceled { job_id });
            emit_queue_changed(&self.shared.events, &self.shared.queue);
            return true;
        }
        let inflight = self.shared.inflight.lock().unwrap();
        if let Some(entry) = inflight.get(&job_id) {
            entry.cancel.cancel();
            return true;
        }
        false
    }

    /// Only valid while a job is still queued; a no-op on a running job.
    pub fn reprioritize(&self, job_id: Uuid, new_priority: Priority) -> bool {
        let moved = self.shared.queue.update_priority(job_id, new_priority);
        if moved {
            emit_queue_changed(&self.shared.events, &self.shared.queue);
        }
        moved
    }

    pub fn current_mode(&self) -> Option<String> {
        self.shared.current_mode.lock().unwrap().clone()
    }

    pub fn queue_snapshot(&self) -> Vec<JobDescriptor> {
        self.shared.queue.snapshot()
    }

    /// Jobs tracked as either queued or currently running; always `>=
    /// queue_snapshot().len()`, with the difference being what's running.
    pub fn inflight_count(&self) -> usize {
        self.shared.inflight.lock().unwrap().len()
    }

    pub fn registry_stats(&self) -> RegistryStats {
        self.shared.registry.stats()
    }

    /// Atomically swaps the mode document consulted by future `switch_mode`
    /// calls. Does not touch whatever is currently loaded; takes effect on
    /// the next switch.
    pub fn reload_modes(&self, new_config: ModeConfig) {
        *self.shared.mode_config.write().unwrap() = new_config;
    }

    /// Resolves immediately without touching the worker if `mode_name` is
    /// already current. Otherwise routes an urgent-priority mode-switch job
    /// through the same execution loop every other job goes through.
    pub async fn switch_mode(&self, mode_name: &str) -> CoreResult<()> {
        if self.current_mode().as_deref() == Some(mode_name) {
            return Ok(());
        }
        if self.shared.mode_config.read().unwrap().get(mode_name).is_none() {
            return Err(CoreError::ModeNotFound(mode_name.to_string()));
        }
        let job = Job::new(
            "mode-switch".to_string(),
            Priority::Urgent,
            JobParams::ModeSwitch(ModeSwitchParams {
                mode: mode_name.to_string(),
            }),
            None,
        );
        let rx = self.submit(job)?;
        rx.await.map_err(|_| CoreError::Shutdown)?.map(|_| ())
    }

    /// Cancels every still-queued job with `Shutdown`, waits for any in-flight
    /// job to finish, then joins the execution thread. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown_called.swap(true, Ordering::SeqCst) {
            return;
        }
        let drained = self.shared.queue.close_and_drain();
        {
            let mut inflight = self.shared.inflight.lock().unwrap();
            for job in drained {
                if let Some(mut entry) = inflight.remove(&job.id) {
                    if let Some(tx) = entry.result_tx.take() {
                        let _ = tx.send(Err(CoreError::Shutdown));
                    }
                }
            }
        }
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn empty_result() -> JobResult {
    JobResult {
        outputs: vec![],
        meta: JobMeta {
            seed: None,
            backend: "pool".to_string(),
            sr: false,
        },
    }
}

fn priority_label(priority: Priority) -> &'static str {
    match priority {
        Priority::Urgent => "urgent",
        Priority::Normal => "normal",
        Priority::Batch => "batch",
        Priority::Background => "background",
    }
}

/// Recomputes the per-lane queue-depth gauge from a fresh snapshot. Cheap
/// enough to call on every mutation; the queue is bounded by `queue_max`.
fn refresh_queue_depth_metric(queue: &PriorityQueue) {
    let snapshot = queue.snapshot();
    for priority in Priority::ALL {
        let count = snapshot.iter().filter(|d| d.priority == priority).count();
        crate::metrics::QUEUE_DEPTH
            .with_label_values(&[priority_label(priority)])
            .set(count as i64);
    }
}

fn emit_queue_changed(events: &mpsc::UnboundedSender<PoolEvent>, queue: &PriorityQueue) {
    refresh_queue_depth_metric(queue);
    let _ = events.send(PoolEvent::QueueChanged);
}

fn finish(
    shared: &Arc<Shared>,
    job_id: Uuid,
    job_type: &'static str,
    result_tx: Option<oneshot::Sender<CoreResult<JobResult>>>,
    outcome: CoreResult<JobResult>,
) {
    shared.inflight.lock().unwrap().remove(&job_id);
    let outcome_label = match &outcome {
        Ok(_) => "done",
        Err(CoreError::Canceled) => "canceled",
        Err(_) => "failed",
    };
    crate::metrics::JOBS_TOTAL
        .with_label_values(&[outcome_label, job_type])
        .inc();
    match &outcome {
        Ok(result) => {
            let _ = shared.events.send(PoolEvent::Completed {
                job_id,
                result: result.clone(),
            });
        }
        Err(CoreError::Canceled) => {
            let _ = shared.events.send(PoolEvent::Canceled { job_id });
        }
        Err(err) => {
            let _ = shared.events.send(PoolEvent::Failed {
                job_id,
                error: err.clone(),
            });
        }
    }
    emit_queue_changed(&shared.events, &shared.queue);
    if let Some(tx) = result_tx {
        let _ = tx.send(outcome);
    }
}

/// Checks capacity and rebuilds the worker before touching any existing
/// state, so a failed switch (unknown mode, insufficient VRAM, or a factory
/// error) leaves the current worker, registry entry, and `current_mode`
/// completely untouched.
fn apply_mode_switch(
    shared: &Arc<Shared>,
    worker: &mut Box<dyn Worker>,
    mode_name: &str,
) -> CoreResult<()> {
    let spec = shared
        .mode_config
        .read()
        .unwrap()
        .get(mode_name)
        .cloned()
        .ok_or_else(|| CoreError::ModeNotFound(mode_name.to_string()))?;

    // Capacity as it would be once the currently loaded mode is freed, without
    // actually freeing it yet.
    let available_after_unload = shared.registry.available_bytes() + worker.est_vram_bytes();
    if available_after_unload < spec.est_vram_bytes {
        return Err(CoreError::ModelLoadFailed(
            mode_name.to_string(),
            "insufficient VRAM to fit the requested mode".to_string(),
        ));
    }

    let rebuilt = shared
        .worker_factory
        .build(worker.worker_id(), &spec)
        .map_err(|e| CoreError::ModelLoadFailed(mode_name.to_string(), e.to_string()))?;

    let old_mode = worker.current_mode().map(|m| m.to_string());
    worker.unload();
    if let Some(old) = &old_mode {
        shared.registry.unregister(old);
    }
    *worker = rebuilt;
    shared.registry.register(ModelInfo {
        model_id: spec.name.clone(),
        est_bytes: spec.est_vram_bytes,
    });
    *shared.current_mode.lock().unwrap() = Some(spec.name.clone());
    crate::metrics::WORKERS_LOADED.set(shared.registry.stats().loaded_models.len() as i64);
    let _ = shared.events.send(PoolEvent::ModeChanged { mode: spec.name });
    Ok(())
}

/// The pool's entire execution loop: pop highest-priority/oldest job, skip
/// anything canceled while queued, run it, persist outputs, resolve its
/// future. Exits once the queue is closed and drained (shutdown).
fn run_loop(shared: Arc<Shared>, mut worker: Box<dyn Worker>) {
    loop {
        let job = match shared.queue.get() {
            Some(job) => job,
            None => break,
        };
        let job_type = job.params.type_name();

        let (cancel, result_tx) = {
            let mut inflight = shared.inflight.lock().unwrap();
            match inflight.get_mut(&job.id) {
                Some(entry) => (entry.cancel.clone(), entry.result_tx.take()),
                // Canceled (and already resolved) between being queued and dequeued.
                None => continue,
            }
        };

        emit_queue_changed(&shared.events, &shared.queue);

        if cancel.is_canceled() {
            finish(&shared, job.id, job_type, result_tx, Err(CoreError::Canceled));
            continue;
        }

        if let JobParams::ModeSwitch(params) = &job.params {
            let outcome = apply_mode_switch(&shared, &mut worker, &params.mode);
            finish(&shared, job.id, job_type, result_tx, outcome.map(|_| empty_result()));
            continue;
        }

        let job_id = job.id;
        let events = shared.events.clone();
        // The watchdog is cooperative, like cancellation itself: it can only
        // act at a progress callback, so jobs that never call `on_progress`
        // (sr, comfy) are not currently subject to it.
        let deadline = Instant::now() + shared.job_timeout;
        let timed_out = Arc::new(AtomicBool::new(false));
        let timed_out_watch = timed_out.clone();
        let cancel_watch = cancel.clone();
        let on_progress = move |event: ProgressEvent| {
            if Instant::now() >= deadline && !cancel_watch.is_canceled() {
                timed_out_watch.store(true, Ordering::SeqCst);
                cancel_watch.cancel();
            }
            let _ = events.send(PoolEvent::Progress {
                job_id,
                fraction: event.fraction,
                status: event.status,
            });
        };

        let started = Instant::now();
        let run_result = worker.run(&job, &on_progress, &cancel);
        crate::metrics::WORKER_BUSY_SECONDS
            .with_label_values(&[job_type])
            .observe(started.elapsed().as_secs_f64());

        match run_result {
            Ok(run_output) => {
                for blob in run_output.blobs {
                    shared.output_store.put(blob.key, blob.bytes, blob.mime);
                }
                finish(&shared, job.id, job_type, result_tx, Ok(run_output.result));
            }
            Err(CoreError::Canceled) if timed_out.load(Ordering::SeqCst) => {
                finish(
                    &shared,
                    job.id,
                    job_type,
                    result_tx,
                    Err(CoreError::Timeout(shared.job_timeout)),
                );
            }
            Err(err) => {
                finish(&shared, job.id, job_type, result_tx, Err(err));
            }
        }
    }
}
