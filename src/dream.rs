use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::model::{GenerateParams, Job, JobParams, JobResult, Priority};
use crate::pool::WorkerPool;
use crate::worker::CancelToken;

const MAX_RECENT_CANDIDATES: usize = 50;
const PROMPT_SUFFIXES: &[&str] = &[
    "dramatic lighting",
    "hyperdetailed",
    "soft focus",
    "vivid colors",
    "long exposure",
    "symmetrical composition",
    "studio lighting",
    "cinematic",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DreamPhase {
    Idle,
    Starting,
    Dreaming,
    Stopping,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DreamStats {
    pub ticks: u32,
    pub child_job_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DreamStatus {
    pub session_id: Uuid,
    pub phase: DreamPhase,
    pub base_prompt: String,
    pub temperature: f32,
    pub ticks: u32,
}

/// Push events a session's dream loop produces for the WS Hub/Session Router
/// to fan out. A candidate is emitted for every completed tick.
#[derive(Debug, Clone)]
pub enum DreamEvent {
    Candidate {
        session_id: Uuid,
        job_id: Uuid,
        result: JobResult,
    },
    Stopped {
        session_id: Uuid,
        stats: DreamStats,
    },
}

struct DreamSession {
    session_id: Uuid,
    base_prompt: Mutex<String>,
    temperature: Mutex<f32>,
    size: String,
    base_steps: u32,
    base_cfg: f32,
    phase: Mutex<DreamPhase>,
    stop: CancelToken,
    ticks: Mutex<u32>,
    recent: Mutex<VecDeque<(Uuid, JobResult)>>,
    done_rx: Mutex<Option<oneshot::Receiver<DreamStats>>>,
}

/// Owns at most one active "dream" (autonomous background generation) session
/// at a time: a slow tick loop that keeps submitting mutated generate jobs at
/// background priority until told to stop.
pub struct DreamController {
    pool: Arc<WorkerPool>,
    events: mpsc::UnboundedSender<DreamEvent>,
    active: Arc<Mutex<Option<Arc<DreamSession>>>>,
    min_interval: Duration,
    max_interval: Duration,
}

impl DreamController {
    pub fn new(
        pool: Arc<WorkerPool>,
        events: mpsc::UnboundedSender<DreamEvent>,
        min_interval: Duration,
        max_interval: Duration,
    ) -> Self {
        Self {
            pool,
            events,
            active: Arc::new(Mutex::new(None)),
            min_interval,
            max_interval: max_interval.max(min_interval),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn start(
        &self,
        session_id: Uuid,
        base_prompt: String,
        temperature: f32,
        size: String,
        base_steps: u32,
        base_cfg: f32,
    ) -> CoreResult<()> {
        let mut active = self.active.lock().unwrap();
        if active.is_some() {
            return Err(CoreError::DreamBusy);
        }

        let (done_tx, done_rx) = oneshot::channel();
        let session = Arc::new(DreamSession {
            session_id,
            base_prompt: Mutex::new(base_prompt),
            temperature: Mutex::new(temperature.clamp(0.0, 1.0)),
            size,
            base_steps: base_steps.max(1),
            base_cfg,
            phase: Mutex::new(DreamPhase::Starting),
            stop: CancelToken::new(),
            ticks: Mutex::new(0),
            recent: Mutex::new(VecDeque::new()),
            done_rx: Mutex::new(Some(done_rx)),
        });
        *active = Some(session.clone());
        drop(active);

        tokio::spawn(run_dream(
            session,
            self.pool.clone(),
            self.events.clone(),
            self.active.clone(),
            done_tx,
            self.min_interval,
            self.max_interval,
        ));
        Ok(())
    }

    /// Signals the active session to stop and waits for its tick loop to exit,
    /// returning the accumulated stats. Errors if `session_id` does not own
    /// the active dream, or no dream is active.
    pub async fn stop(&self, session_id: Uuid) -> CoreResult<DreamStats> {
        let session = self.owned_session(session_id)?;
        *session.phase.lock().unwrap() = DreamPhase::Stopping;
        session.stop.cancel();
        let done_rx = session.done_rx.lock().unwrap().take();
        match done_rx {
            Some(rx) => Ok(rx.await.unwrap_or_default()),
            None => Ok(DreamStats::default()),
        }
    }

    /// Best-effort stop used on session disconnect: silently does nothing if
    /// this session does not own the active dream.
    pub async fn disconnect_stop(&self, session_id: Uuid) {
        let _ = self.stop(session_id).await;
    }

    pub fn guide(
        &self,
        session_id: Uuid,
        base_prompt: Option<String>,
        temperature: Option<f32>,
    ) -> CoreResult<()> {
        let session = self.owned_session(session_id)?;
        if let Some(prompt) = base_prompt {
            *session.base_prompt.lock().unwrap() = prompt;
        }
        if let Some(t) = temperature {
            *session.temperature.lock().unwrap() = t.clamp(0.0, 1.0);
        }
        Ok(())
    }

    pub fn status(&self) -> Option<DreamStatus> {
        let active = self.active.lock().unwrap();
        active.as_ref().map(|s| DreamStatus {
            session_id: s.session_id,
            phase: *s.phase.lock().unwrap(),
            base_prompt: s.base_prompt.lock().unwrap().clone(),
            temperature: *s.temperature.lock().unwrap(),
            ticks: *s.ticks.lock().unwrap(),
        })
    }

    /// Most recent candidates, newest first, from the active dream session.
    pub fn top(&self, limit: usize) -> Vec<(Uuid, JobResult)> {
        let active = self.active.lock().unwrap();
        match active.as_ref() {
            Some(s) => s.recent.lock().unwrap().iter().rev().take(limit).cloned().collect(),
            None => Vec::new(),
        }
    }

    fn owned_session(&self, session_id: Uuid) -> CoreResult<Arc<DreamSession>> {
        let active = self.active.lock().unwrap();
        match active.as_ref() {
            Some(s) if s.session_id == session_id => Ok(s.clone()),
            Some(_) => Err(CoreError::BadRequest(
                "the active dream session is owned by a different session".to_string(),
            )),
            None => Err(CoreError::BadRequest("no dream session is active".to_string())),
        }
    }
}

fn mutate_prompt(base: &str, temperature: f32, rng: &mut impl Rng) -> String {
    if rng.random::<f32>() < temperature.clamp(0.0, 1.0) {
        let suffix = PROMPT_SUFFIXES[rng.random_range(0..PROMPT_SUFFIXES.len())];
        format!("{base}, {suffix}")
    } else {
        base.to_string()
    }
}

fn mutate_u32(base: u32, rng: &mut impl Rng, min: u32, max: u32) -> u32 {
    let delta = ((base as f32 * 0.2).round() as i32).max(1);
    let offset = rng.random_range(-delta..=delta);
    (base as i32 + offset).clamp(min as i32, max as i32) as u32
}

fn mutate_f32(base: f32, rng: &mut impl Rng, min: f32, max: f32) -> f32 {
    let delta = (base * 0.2).max(0.1);
    (base + rng.random_range(-delta..=delta)).clamp(min, max)
}

async fn run_dream(
    session: Arc<DreamSession>,
    pool: Arc<WorkerPool>,
    events: mpsc::UnboundedSender<DreamEvent>,
    active: Arc<Mutex<Option<Arc<DreamSession>>>>,
    done_tx: oneshot::Sender<DreamStats>,
    min_interval: Duration,
    max_interval: Duration,
) {
    *session.phase.lock().unwrap() = DreamPhase::Dreaming;
    let mut stats = DreamStats::default();

    loop {
        if session.stop.is_canceled() {
            break;
        }

        let (prompt, temperature) = {
            (
                session.base_prompt.lock().unwrap().clone(),
                *session.temperature.lock().unwrap(),
            )
        };

        let job = {
            let mut rng = rand::rng();
            let prompt = mutate_prompt(&prompt, temperature, &mut rng);
            let steps = mutate_u32(session.base_steps, &mut rng, 4, 150);
            let cfg = mutate_f32(session.base_cfg, &mut rng, 1.0, 20.0);
            let seed = rng.random::<u64>();
            Job::new(
                "dream".to_string(),
                Priority::Background,
                JobParams::DreamTick(GenerateParams {
                    prompt,
                    size: session.size.clone(),
                    steps,
                    cfg,
                    seed,
                    superres: false,
                    superres_magnitude: 1,
                    init_image_ref: None,
                    denoise_strength: None,
                }),
                Some(session.session_id),
            )
        };
        let job_id = job.id;

        // A stop requested while this tick was being prepared must be dropped
        // rather than submitted.
        if session.stop.is_canceled() {
            break;
        }

        if let Ok(rx) = pool.submit(job) {
            stats.child_job_ids.push(job_id);
            if let Ok(Ok(result)) = rx.await {
                stats.ticks += 1;
                *session.ticks.lock().unwrap() = stats.ticks;
                {
                    let mut recent = session.recent.lock().unwrap();
                    recent.push_back((job_id, result.clone()));
                    if recent.len() > MAX_RECENT_CANDIDATES {
                        recent.pop_front();
                    }
                }
                let _ = events.send(DreamEvent::Candidate {
                    session_id: session.session_id,
                    job_id,
                    result,
                });
            }
        }

        if session.stop.is_canceled() {
            break;
        }

        let wait_ms = {
            let mut rng = rand::rng();
            let min_ms = min_interval.as_millis() as u64;
            let max_ms = max_interval.as_millis() as u64;
            rng.random_range(min_ms..=max_ms.max(min_ms))
        };
        tokio::time::sleep(Duration::from_millis(wait_ms)).await;
    }

    *session.phase.lock().unwrap() = DreamPhase::Idle;
    {
        let mut guard = active.lock().unwrap();
        if let Some(current) = guard.as_ref() {
            if Arc::ptr_eq(current, &session) {
                *guard = None;
            }
        }
    }
    let _ = events.send(DreamEvent::Stopped {
        session_id: session.session_id,
        stats: stats.clone(),
    });
    let _ = done_tx.send(stats);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModeConfig;
    use crate::model::ModeSpec;
    use crate::output::OutputStore;
    use crate::queue::PriorityQueue;
    use crate::registry::ModelRegistry;
    use crate::worker::SimWorkerFactory;
    use std::collections::HashMap;

    fn test_pool() -> Arc<WorkerPool> {
        let mut modes = HashMap::new();
        modes.insert(
            "fast".to_string(),
            ModeSpec {
                name: "fast".to_string(),
                model_path: "/models/fast".to_string(),
                lora_stack: vec![],
                default_size: "512x512".to_string(),
                default_steps: 4,
                default_guidance: 7.5,
                is_default: true,
                est_vram_bytes: 100,
            },
        );
        let mode_config = ModeConfig {
            default_mode: "fast".to_string(),
            modes,
        };
        let (tx, _rx) = mpsc::unbounded_channel();
        Arc::new(
            WorkerPool::new(
                Arc::new(PriorityQueue::new(64)),
                Arc::new(ModelRegistry::new(1_000_000)),
                mode_config,
                Arc::new(SimWorkerFactory {
                    step_duration: Duration::from_millis(0),
                }),
                Arc::new(OutputStore::new()),
                Duration::from_secs(300),
                tx,
            )
            .unwrap(),
        )
    }

    fn controller() -> (DreamController, mpsc::UnboundedReceiver<DreamEvent>) {
        let pool = test_pool();
        let (tx, rx) = mpsc::unbounded_channel();
        let controller = DreamController::new(
            pool,
            tx,
            Duration::from_millis(1),
            Duration::from_millis(2),
        );
        (controller, rx)
    }

    #[tokio::test]
    async fn second_start_is_rejected_while_dreaming() {
        let (controller, _rx) = controller();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        controller
            .start(a, "a cat".to_string(), 0.5, "512x512".to_string(), 10, 7.5)
            .unwrap();
        let result = controller.start(b, "a dog".to_string(), 0.5, "512x512".to_string(), 10, 7.5);
        assert!(matches!(result, Err(CoreError::DreamBusy)));
        controller.stop(a).await.unwrap();
    }

    #[tokio::test]
    async fn start_then_stop_yields_stats_and_frees_slot() {
        let (controller, _rx) = controller();
        let session_id = Uuid::new_v4();
        controller
            .start(session_id, "a cat".to_string(), 1.0, "512x512".to_string(), 10, 7.5)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let stats = controller.stop(session_id).await.unwrap();
        assert!(stats.ticks >= 1);
        assert_eq!(stats.ticks as usize, stats.child_job_ids.len());
        assert!(controller.status().is_none());
    }

    #[tokio::test]
    async fn stop_without_active_session_errors() {
        let (controller, _rx) = controller();
        let result = controller.stop(Uuid::new_v4()).await;
        assert!(matches!(result, Err(CoreError::BadRequest(_))));
    }

    #[tokio::test]
    async fn guide_updates_prompt_and_temperature() {
        let (controller, _rx) = controller();
        let session_id = Uuid::new_v4();
        controller
            .start(session_id, "a cat".to_string(), 0.0, "512x512".to_string(), 10, 7.5)
            .unwrap();
        controller
            .guide(session_id, Some("a wizard".to_string()), Some(0.9))
            .unwrap();
        let status = controller.status().unwrap();
        assert_eq!(status.base_prompt, "a wizard");
        assert_eq!(status.temperature, 0.9);
        controller.stop(session_id).await.unwrap();
    }

    #[tokio::test]
    async fn guide_rejects_non_owning_session() {
        let (controller, _rx) = controller();
        let owner = Uuid::new_v4();
        let stranger = Uuid::new_v4();
        controller
            .start(owner, "a cat".to_string(), 0.0, "512x512".to_string(), 10, 7.5)
            .unwrap();
        let result = controller.guide(stranger, Some("hijack".to_string()), None);
        assert!(matches!(result, Err(CoreError::BadRequest(_))));
        controller.stop(owner).await.unwrap();
    }
}
