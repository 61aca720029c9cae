use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::model::{GenerateParams, Job, JobMeta, JobOutput, JobParams, JobResult, ModeSpec};

/// One stored blob alongside the wire-level [`JobOutput`] that references it.
pub struct OutputBlob {
    pub key: String,
    pub bytes: Bytes,
    pub mime: String,
}

/// What a successful [`Worker::run`] produces: the wire-facing result plus the
/// raw bytes the pool persists into the output store under each output's key.
pub struct WorkerRunOutput {
    pub result: JobResult,
    pub blobs: Vec<OutputBlob>,
}

/// Cooperative cancellation signal polled by the worker thread between steps.
/// Never forcibly interrupts the worker; the worker must check it itself.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub fraction: f32,
    pub status: String,
}

pub type ProgressCallback<'a> = dyn Fn(ProgressEvent) + Send + 'a;

/// Black-box capability set a hardware-bound accelerator presents to the pool.
/// The actual image-generation math is out of scope for this core; production
/// implementations plug in a CUDA/NPU-backed type behind this trait.
pub trait Worker: Send {
    fn worker_id(&self) -> Uuid;

    fn current_mode(&self) -> Option<&str>;

    /// Runs a single job to completion or cancellation, polling `cancel` and
    /// invoking `on_progress` zero or more times. Blocking; called from the
    /// pool's dedicated execution thread only.
    fn run(
        &mut self,
        job: &Job,
        on_progress: &ProgressCallback,
        cancel: &CancelToken,
    ) -> CoreResult<WorkerRunOutput>;

    /// Releases the currently loaded model's resources. Idempotent.
    fn unload(&mut self);

    /// Estimated VRAM footprint of the currently loaded mode, if any.
    fn est_vram_bytes(&self) -> u64;
}

/// Builds a loaded [`Worker`] for a given mode spec. Injected into the pool so
/// tests can substitute a fake; production wiring inspects model files and
/// picks a concrete backend, which is itself out of scope for this core.
pub trait WorkerFactory: Send + Sync {
    fn build(&self, worker_id: Uuid, mode: &ModeSpec) -> CoreResult<Box<dyn Worker>>;
}

/// Deterministic in-process stand-in for a real accelerator. Produces a small
/// byte buffer keyed by the job's generation parameters so the idempotence
/// property (same inputs -> same content key) is mechanically checkable.
pub struct SimWorker {
    id: Uuid,
    mode: Option<ModeSpec>,
    step_duration: Duration,
}

impl SimWorker {
    pub fn new(id: Uuid, step_duration: Duration) -> Self {
        Self {
            id,
            mode: None,
            step_duration,
        }
    }

    pub fn loaded(id: Uuid, mode: ModeSpec, step_duration: Duration) -> Self {
        Self {
            id,
            mode: Some(mode),
            step_duration,
        }
    }

    fn run_generate(
        &self,
        params: &GenerateParams,
        on_progress: &ProgressCallback,
        cancel: &CancelToken,
    ) -> CoreResult<WorkerRunOutput> {
        let steps = params.steps.max(1);
        for step in 0..steps {
            if cancel.is_canceled() {
                return Err(CoreError::Canceled);
            }
            std::thread::sleep(self.step_duration);
            on_progress(ProgressEvent {
                fraction: (step + 1) as f32 / steps as f32,
                status: "denoising".to_string(),
            });
        }
        if cancel.is_canceled() {
            return Err(CoreError::Canceled);
        }

        let mode_name = self
            .mode
            .as_ref()
            .map(|m| m.name.as_str())
            .unwrap_or("unloaded");
        let key = content_key(params, mode_name);
        single_output(key, "image/png", Some(params.seed), params.superres)
    }
}

/// Wraps a single content-addressed key into a one-output [`WorkerRunOutput`],
/// synthesizing a small deterministic blob so the content key is also the
/// blob's own hash.
fn single_output(
    key: String,
    mime: &str,
    seed: Option<u64>,
    sr: bool,
) -> CoreResult<WorkerRunOutput> {
    let bytes = Bytes::from(key.as_bytes().to_vec());
    Ok(WorkerRunOutput {
        result: JobResult {
            outputs: vec![JobOutput {
                url: format!("/storage/{key}"),
                key: key.clone(),
            }],
            meta: JobMeta {
                seed,
                backend: "sim".to_string(),
                sr,
            },
        },
        blobs: vec![OutputBlob {
            key,
            bytes,
            mime: mime.to_string(),
        }],
    })
}

/// Content-addressed key for a generate job: identical inputs always hash to
/// the same key, while each submission still gets a fresh `Job::id`.
pub fn content_key(params: &GenerateParams, mode_name: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(mode_name.as_bytes());
    hasher.update(params.prompt.as_bytes());
    hasher.update(params.size.as_bytes());
    hasher.update(&params.steps.to_le_bytes());
    hasher.update(&params.cfg.to_le_bytes());
    hasher.update(&params.seed.to_le_bytes());
    hasher.update(&[params.superres as u8]);
    hasher.update(&params.superres_magnitude.to_le_bytes());
    hasher.finalize().to_hex().to_string()
}

impl Worker for SimWorker {
    fn worker_id(&self) -> Uuid {
        self.id
    }

    fn current_mode(&self) -> Option<&str> {
        self.mode.as_ref().map(|m| m.name.as_str())
    }

    fn run(
        &mut self,
        job: &Job,
        on_progress: &ProgressCallback,
        cancel: &CancelToken,
    ) -> CoreResult<WorkerRunOutput> {
        match &job.params {
            JobParams::Generate(p) | JobParams::DreamTick(p) => {
                self.run_generate(p, on_progress, cancel)
            }
            JobParams::Sr(p) => {
                if cancel.is_canceled() {
                    return Err(CoreError::Canceled);
                }
                std::thread::sleep(self.step_duration);
                let key = blake3::hash(p.init_image_ref.as_bytes()).to_hex().to_string();
                single_output(key, "image/png", None, true)
            }
            JobParams::Comfy(p) => {
                if cancel.is_canceled() {
                    return Err(CoreError::Canceled);
                }
                std::thread::sleep(self.step_duration);
                let mut hasher = blake3::Hasher::new();
                hasher.update(p.workflow_id.as_bytes());
                hasher.update(p.input_image.as_bytes());
                let key = hasher.finalize().to_hex().to_string();
                single_output(key, "image/png", None, false)
            }
            JobParams::ModeSwitch(_) => Err(CoreError::WorkerFailure(
                "mode switches are handled by the pool, not run() on a worker".to_string(),
            )),
        }
    }

    fn unload(&mut self) {
        self.mode = None;
    }

    fn est_vram_bytes(&self) -> u64 {
        self.mode.as_ref().map(|m| m.est_vram_bytes).unwrap_or(0)
    }
}

/// Default factory producing [`SimWorker`]s. Stands in for the real dispatch
/// logic (inspecting model files to pick a concrete backend class), which is
/// out of scope for this core.
pub struct SimWorkerFactory {
    pub step_duration: Duration,
}

impl WorkerFactory for SimWorkerFactory {
    fn build(&self, worker_id: Uuid, mode: &ModeSpec) -> CoreResult<Box<dyn Worker>> {
        Ok(Box::new(SimWorker::loaded(
            worker_id,
            mode.clone(),
            self.step_duration,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GenerateParams, JobParams, ModeSpec, Priority};

    fn mode() -> ModeSpec {
        ModeSpec {
            name: "sdxl-base".into(),
            model_path: "/models/sdxl".into(),
            lora_stack: vec![],
            default_size: "512x512".into(),
            default_steps: 4,
            default_guidance: 1.0,
            is_default: true,
            est_vram_bytes: 100,
        }
    }

    fn generate_job(seed: u64) -> Job {
        Job::new(
            "corr".into(),
            Priority::Normal,
            JobParams::Generate(GenerateParams {
                prompt: "a cat".into(),
                size: "512x512".into(),
                steps: 2,
                cfg: 1.0,
                seed,
                superres: false,
                superres_magnitude: 1,
                init_image_ref: None,
                denoise_strength: None,
            }),
            None,
        )
    }

    #[test]
    fn same_inputs_produce_same_key() {
        let mut worker = SimWorker::loaded(Uuid::new_v4(), mode(), Duration::from_millis(0));
        let job_a = generate_job(42);
        let job_b = generate_job(42);
        let cancel = CancelToken::new();
        let result_a = worker.run(&job_a, &|_| {}, &cancel).unwrap();
        let result_b = worker.run(&job_b, &|_| {}, &cancel).unwrap();
        assert_eq!(result_a.result.outputs[0].key, result_b.result.outputs[0].key);
        assert_ne!(job_a.id, job_b.id);
    }

    #[test]
    fn different_seed_produces_different_key() {
        let mut worker = SimWorker::loaded(Uuid::new_v4(), mode(), Duration::from_millis(0));
        let cancel = CancelToken::new();
        let result_a = worker.run(&generate_job(1), &|_| {}, &cancel).unwrap();
        let result_b = worker.run(&generate_job(2), &|_| {}, &cancel).unwrap();
        assert_ne!(result_a.result.outputs[0].key, result_b.result.outputs[0].key);
    }

    #[test]
    fn cancel_token_stops_run() {
        let mut worker = SimWorker::loaded(Uuid::new_v4(), mode(), Duration::from_millis(10));
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = worker.run(&generate_job(1), &|_| {}, &cancel);
        assert!(matches!(result, Err(CoreError::Canceled)));
    }

    #[test]
    fn comfy_key_depends_on_input_image() {
        let mut worker = SimWorker::loaded(Uuid::new_v4(), mode(), Duration::from_millis(0));
        let cancel = CancelToken::new();
        let job_a = Job::new(
            "corr".into(),
            Priority::Normal,
            JobParams::Comfy(crate::model::ComfyParams {
                workflow_id: "wf-1".into(),
                params: serde_json::json!({}),
                input_image: "fileref-a".into(),
            }),
            None,
        );
        let job_b = Job::new(
            "corr".into(),
            Priority::Normal,
            JobParams::Comfy(crate::model::ComfyParams {
                workflow_id: "wf-1".into(),
                params: serde_json::json!({}),
                input_image: "fileref-b".into(),
            }),
            None,
        );
        let result_a = worker.run(&job_a, &|_| {}, &cancel).unwrap();
        let result_b = worker.run(&job_b, &|_| {}, &cancel).unwrap();
        assert_ne!(result_a.result.outputs[0].key, result_b.result.outputs[0].key);
    }

    #[test]
    fn unload_clears_mode() {
        let mut worker = SimWorker::loaded(Uuid::new_v4(), mode(), Duration::from_millis(0));
        assert!(worker.current_mode().is_some());
        worker.unload();
        assert!(worker.current_mode().is_none());
        assert_eq!(worker.est_vram_bytes(), 0);
    }
}
