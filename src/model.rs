use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Priority lane. Lower numeric value sorts first (drained before higher values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Urgent = 0,
    Normal = 1,
    Batch = 2,
    Background = 3,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Urgent,
        Priority::Normal,
        Priority::Batch,
        Priority::Background,
    ];
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateParams {
    pub prompt: String,
    pub size: String,
    pub steps: u32,
    pub cfg: f32,
    pub seed: u64,
    #[serde(default)]
    pub superres: bool,
    #[serde(default = "default_superres_magnitude")]
    pub superres_magnitude: u32,
    #[serde(default)]
    pub init_image_ref: Option<String>,
    #[serde(default)]
    pub denoise_strength: Option<f32>,
}

fn default_superres_magnitude() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SrParams {
    pub init_image_ref: String,
    pub magnitude: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComfyParams {
    pub workflow_id: String,
    pub params: serde_json::Value,
    pub input_image: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeSwitchParams {
    pub mode: String,
}

/// The tagged union of job payloads. `dreamTick` reuses `Generate` params since a
/// dream tick is just a mutated generate job submitted at background priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "jobType", rename_all = "camelCase")]
pub enum JobParams {
    Generate(GenerateParams),
    Sr(SrParams),
    Comfy(ComfyParams),
    ModeSwitch(ModeSwitchParams),
    DreamTick(GenerateParams),
}

impl JobParams {
    pub fn init_image_ref(&self) -> Option<&str> {
        match self {
            JobParams::Generate(p) => p.init_image_ref.as_deref(),
            JobParams::Sr(p) => Some(p.init_image_ref.as_str()),
            JobParams::Comfy(p) => Some(p.input_image.as_str()),
            JobParams::ModeSwitch(_) | JobParams::DreamTick(_) => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            JobParams::Generate(_) => "generate",
            JobParams::Sr(_) => "sr",
            JobParams::Comfy(_) => "comfy",
            JobParams::ModeSwitch(_) => "modeSwitch",
            JobParams::DreamTick(_) => "dreamTick",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Queued,
    Running,
    Canceling,
    Done,
    Failed,
    Canceled,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed | JobState::Canceled)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobOutput {
    pub key: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobMeta {
    pub seed: Option<u64>,
    pub backend: String,
    pub sr: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobResult {
    pub outputs: Vec<JobOutput>,
    pub meta: JobMeta,
}

/// The central entity. Created by the Session Router (or the Dream Controller),
/// owned exclusively by the Worker Pool once dequeued. Terminal states are immutable.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub corr_id: String,
    pub priority: Priority,
    pub params: JobParams,
    pub submitted_at: Instant,
    pub source_session: Option<Uuid>,
    pub state: JobState,
}

impl Job {
    pub fn new(corr_id: String, priority: Priority, params: JobParams, source_session: Option<Uuid>) -> Self {
        Self {
            id: Uuid::new_v4(),
            corr_id,
            priority,
            params,
            submitted_at: Instant::now(),
            source_session,
            state: JobState::Queued,
        }
    }
}

/// A queue-ordering descriptor, cheap to clone for `queue:state` snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct JobDescriptor {
    pub id: Uuid,
    pub priority: Priority,
    pub source: String,
}

#[derive(Debug, Clone)]
pub struct LoraRef {
    pub path: String,
    pub strength: f32,
}

/// A named recipe binding a base model, a LoRA stack, and default generation
/// parameters. Immutable once read; reloaded only via an explicit admin operation.
#[derive(Debug, Clone)]
pub struct ModeSpec {
    pub name: String,
    pub model_path: String,
    pub lora_stack: Vec<LoraRef>,
    pub default_size: String,
    pub default_steps: u32,
    pub default_guidance: f32,
    pub is_default: bool,
    pub est_vram_bytes: u64,
}

/// Handle to the single accelerator a [`crate::pool::WorkerPool`] drives. Re-created
/// on a mode switch, but `worker_id` survives across switches.
#[derive(Debug, Clone)]
pub struct WorkerHandleInfo {
    pub worker_id: Uuid,
    pub current_mode: Option<String>,
    pub device: String,
}
