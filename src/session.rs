use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::dream::{DreamController, DreamEvent};
use crate::error::CoreError;
use crate::fileref::FileRefStore;
use crate::hub::Hub;
use crate::model::{Job, JobParams, Priority};
use crate::output::OutputStore;
use crate::pool::{PoolEvent, WorkerPool};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SubmitBody {
    #[serde(flatten)]
    params: JobParams,
    #[serde(default)]
    priority: Priority,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CancelBody {
    job_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PriorityBody {
    job_id: Uuid,
    priority: Priority,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DreamStartBody {
    base_prompt: String,
    #[serde(default = "default_temperature")]
    temperature: f32,
    #[serde(default = "default_dream_size")]
    size: String,
    #[serde(default = "default_dream_steps")]
    steps: u32,
    #[serde(default = "default_dream_cfg")]
    cfg: f32,
}

fn default_temperature() -> f32 {
    0.5
}
fn default_dream_size() -> String {
    "512x512".to_string()
}
fn default_dream_steps() -> u32 {
    20
}
fn default_dream_cfg() -> f32 {
    7.5
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DreamGuideBody {
    #[serde(default)]
    base_prompt: Option<String>,
    #[serde(default)]
    temperature: Option<f32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoragePutBody {
    text: String,
    #[serde(default = "default_content_type")]
    content_type: String,
}

fn default_content_type() -> String {
    "text/plain".to_string()
}

fn job_error(id: Option<String>, err: CoreError, job_id: Option<Uuid>) -> Value {
    json!({
        "type": "job:error",
        "id": id,
        "jobId": job_id,
        "kind": err.kind(),
        "message": err.to_string(),
    })
}

fn error_envelope(id: Option<String>, err: CoreError) -> Value {
    json!({
        "type": "error",
        "id": id,
        "kind": err.kind(),
        "message": err.to_string(),
    })
}

/// Dispatches incoming WS envelopes by `type`, and pumps asynchronous pool and
/// dream events back out to the right connection (or broadcast to all of
/// them) through the [`Hub`]. The single point where the plain-JSON wire
/// protocol meets the typed core.
pub struct SessionRouter {
    pool: Arc<WorkerPool>,
    dream: Arc<DreamController>,
    filerefs: Arc<FileRefStore>,
    outputs: Arc<OutputStore>,
    hub: Arc<Hub>,
    job_owners: Mutex<HashMap<Uuid, Uuid>>,
}

impl SessionRouter {
    pub fn new(
        pool: Arc<WorkerPool>,
        dream: Arc<DreamController>,
        filerefs: Arc<FileRefStore>,
        outputs: Arc<OutputStore>,
        hub: Arc<Hub>,
    ) -> Self {
        Self {
            pool,
            dream,
            filerefs,
            outputs,
            hub,
            job_owners: Mutex::new(HashMap::new()),
        }
    }

    /// Routes one client envelope to its handler and returns the immediate
    /// response to write back on the same connection. Progress/terminal/
    /// broadcast events are delivered separately via the event pumps.
    pub async fn dispatch(&self, session_id: Uuid, raw: Value) -> Value {
        let kind = raw.get("type").and_then(Value::as_str).unwrap_or("").to_string();
        let id = raw.get("id").and_then(Value::as_str).map(str::to_string);

        match kind.as_str() {
            "job:submit" => self.handle_submit(session_id, id, &raw),
            "job:cancel" => self.handle_cancel(id, &raw),
            "job:priority" => self.handle_priority(id, &raw),
            "dream:start" => self.handle_dream_start(session_id, id, &raw),
            "dream:stop" => self.handle_dream_stop(session_id, id).await,
            "dream:status" => self.handle_dream_status(id),
            "dream:top" => self.handle_dream_top(id, &raw),
            "dream:guide" => self.handle_dream_guide(session_id, id, &raw),
            "storage:put" => self.handle_storage_put(id, &raw),
            "ping" => json!({"type": "pong", "id": id}),
            "telemetry:otlp" => json!({"type": "ack", "id": id}),
            other => job_error(id, CoreError::UnknownType(other.to_string()), None),
        }
    }

    fn handle_submit(&self, session_id: Uuid, id: Option<String>, value: &Value) -> Value {
        let body: SubmitBody = match serde_json::from_value(value.clone()) {
            Ok(b) => b,
            Err(e) => return job_error(id, CoreError::BadRequest(e.to_string()), None),
        };

        if let Some(reference) = body.params.init_image_ref() {
            if self.filerefs.content_type(reference).is_none() {
                return job_error(id, CoreError::RefNotFound, None);
            }
        }

        let job = Job::new(
            id.clone().unwrap_or_default(),
            body.priority,
            body.params,
            Some(session_id),
        );
        let job_id = job.id;
        self.job_owners.lock().unwrap().insert(job_id, session_id);

        match self.pool.submit(job) {
            Ok(_rx) => json!({"type": "job:ack", "id": id, "jobId": job_id}),
            Err(err) => {
                self.job_owners.lock().unwrap().remove(&job_id);
                job_error(id, err, Some(job_id))
            }
        }
    }

    fn handle_cancel(&self, id: Option<String>, value: &Value) -> Value {
        let body: CancelBody = match serde_json::from_value(value.clone()) {
            Ok(b) => b,
            Err(e) => return job_error(id, CoreError::BadRequest(e.to_string()), None),
        };
        let canceled = self.pool.cancel(body.job_id);
        json!({"type": "job:ack", "id": id, "jobId": body.job_id, "canceled": canceled})
    }

    fn handle_priority(&self, id: Option<String>, value: &Value) -> Value {
        let body: PriorityBody = match serde_json::from_value(value.clone()) {
            Ok(b) => b,
            Err(e) => return job_error(id, CoreError::BadRequest(e.to_string()), None),
        };
        let moved = self.pool.reprioritize(body.job_id, body.priority);
        json!({"type": "job:ack", "id": id, "jobId": body.job_id, "updated": moved})
    }

    fn handle_dream_start(&self, session_id: Uuid, id: Option<String>, value: &Value) -> Value {
        let body: DreamStartBody = match serde_json::from_value(value.clone()) {
            Ok(b) => b,
            Err(e) => return error_envelope(id, CoreError::BadRequest(e.to_string())),
        };
        match self.dream.start(
            session_id,
            body.base_prompt,
            body.temperature,
            body.size,
            body.steps,
            body.cfg,
        ) {
            Ok(()) => json!({"type": "dream:ack", "id": id}),
            Err(err) => error_envelope(id, err),
        }
    }

    async fn handle_dream_stop(&self, session_id: Uuid, id: Option<String>) -> Value {
        match self.dream.stop(session_id).await {
            Ok(stats) => json!({"type": "dream:stopped", "id": id, "stats": stats}),
            Err(err) => error_envelope(id, err),
        }
    }

    fn handle_dream_status(&self, id: Option<String>) -> Value {
        json!({"type": "dream:status", "id": id, "status": self.dream.status()})
    }

    fn handle_dream_top(&self, id: Option<String>, value: &Value) -> Value {
        let limit = value.get("limit").and_then(Value::as_u64).unwrap_or(5) as usize;
        let candidates: Vec<Value> = self
            .dream
            .top(limit)
            .into_iter()
            .map(|(job_id, result)| json!({"jobId": job_id, "result": result}))
            .collect();
        json!({"type": "dream:top", "id": id, "candidates": candidates})
    }

    fn handle_dream_guide(&self, session_id: Uuid, id: Option<String>, value: &Value) -> Value {
        let body: DreamGuideBody = match serde_json::from_value(value.clone()) {
            Ok(b) => b,
            Err(e) => return error_envelope(id, CoreError::BadRequest(e.to_string())),
        };
        match self.dream.guide(session_id, body.base_prompt, body.temperature) {
            Ok(()) => json!({"type": "dream:ack", "id": id}),
            Err(err) => error_envelope(id, err),
        }
    }

    fn handle_storage_put(&self, id: Option<String>, value: &Value) -> Value {
        let body: StoragePutBody = match serde_json::from_value(value.clone()) {
            Ok(b) => b,
            Err(e) => return error_envelope(id, CoreError::BadRequest(e.to_string())),
        };
        let key = self.filerefs.put(Bytes::from(body.text.into_bytes()), body.content_type);
        json!({"type": "storage:ack", "id": id, "fileRef": key})
    }

    /// Called once per accepted connection, before the read loop starts.
    pub fn system_status_value(&self) -> Value {
        let stats = self.pool.registry_stats();
        let pending = self.pool.queue_snapshot().len();
        let running = self.pool.inflight_count().saturating_sub(pending);
        json!({
            "type": "system:status",
            "mode": self.pool.current_mode(),
            "vram": stats,
            "storage": {
                "outputCount": self.outputs.len(),
                "filerefCount": self.filerefs.len(),
            },
            "queueState": {
                "pending": pending,
                "running": running,
            },
        })
    }

    fn broadcast_system_status(&self) {
        if self.hub.is_empty() {
            return;
        }
        self.hub.broadcast(self.system_status_value());
    }

    /// Invoked on every tick of the idle-aware system-status ticker; a no-op
    /// while nobody is connected.
    pub fn tick_system_status(&self) {
        self.broadcast_system_status();
    }

    /// Does not cancel the session's in-flight jobs (the pool owns their
    /// lifecycle independent of the connection), but does stop any dream
    /// session this connection owns.
    pub async fn on_disconnect(&self, session_id: Uuid) {
        self.dream.disconnect_stop(session_id).await;
        self.job_owners.lock().unwrap().retain(|_, owner| *owner != session_id);
    }

    fn handle_pool_event(&self, event: PoolEvent) {
        match event {
            PoolEvent::Progress { job_id, fraction, status } => {
                if let Some(session_id) = self.job_owners.lock().unwrap().get(&job_id).copied() {
                    self.hub.send_to(
                        session_id,
                        json!({"type": "job:progress", "jobId": job_id, "fraction": fraction, "status": status}),
                    );
                }
            }
            PoolEvent::Completed { job_id, result } => {
                if let Some(session_id) = self.job_owners.lock().unwrap().remove(&job_id) {
                    self.hub
                        .send_to(session_id, json!({"type": "job:complete", "jobId": job_id, "result": result}));
                }
            }
            PoolEvent::Failed { job_id, error } => {
                if let Some(session_id) = self.job_owners.lock().unwrap().remove(&job_id) {
                    self.hub.send_to(
                        session_id,
                        json!({"type": "job:error", "jobId": job_id, "kind": error.kind(), "message": error.to_string()}),
                    );
                }
            }
            PoolEvent::Canceled { job_id } => {
                if let Some(session_id) = self.job_owners.lock().unwrap().remove(&job_id) {
                    self.hub.send_to(session_id, json!({"type": "job:canceled", "jobId": job_id}));
                }
            }
            PoolEvent::QueueChanged => {
                let jobs = self.pool.queue_snapshot();
                let pending = jobs.len();
                let running = self.pool.inflight_count().saturating_sub(pending);
                self.hub.broadcast(json!({
                    "type": "queue:state",
                    "pending": pending,
                    "running": running,
                    "jobs": jobs,
                }));
            }
            PoolEvent::ModeChanged { .. } => {
                self.broadcast_system_status();
            }
        }
    }

    fn handle_dream_event(&self, event: DreamEvent) {
        match event {
            DreamEvent::Candidate { session_id, job_id, result } => {
                self.hub.broadcast(
                    json!({"type": "dream:candidate", "sessionId": session_id, "jobId": job_id, "result": result}),
                );
            }
            DreamEvent::Stopped { session_id, stats } => {
                self.hub
                    .send_to(session_id, json!({"type": "dream:stopped", "stats": stats}));
            }
        }
    }
}

/// Drains the pool's event channel for the lifetime of the server, routing
/// each event through the router. Runs on its own task since it never
/// returns until the channel closes (pool shutdown).
pub fn spawn_pool_event_pump(
    router: Arc<SessionRouter>,
    mut events: mpsc::UnboundedReceiver<PoolEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            router.handle_pool_event(event);
        }
    })
}

/// Drains the dream controller's event channel for the lifetime of the
/// server.
pub fn spawn_dream_event_pump(
    router: Arc<SessionRouter>,
    mut events: mpsc::UnboundedReceiver<DreamEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            router.handle_dream_event(event);
        }
    })
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
    use std::time::Duration;

    fn test_router() -> (Arc<SessionRouter>, JoinHandle<()>, JoinHandle<()>) {
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
        let (pool_tx, pool_rx) = mpsc::unbounded_channel();
        let outputs = Arc::new(OutputStore::new());
        let pool = Arc::new(
            WorkerPool::new(
                Arc::new(PriorityQueue::new(64)),
                Arc::new(ModelRegistry::new(1_000_000)),
                mode_config,
                Arc::new(SimWorkerFactory {
                    step_duration: Duration::from_millis(0),
                }),
                outputs.clone(),
                Duration::from_secs(300),
                pool_tx,
            )
            .unwrap(),
        );
        let (dream_tx, dream_rx) = mpsc::unbounded_channel();
        let dream = Arc::new(DreamController::new(
            pool.clone(),
            dream_tx,
            Duration::from_millis(1),
            Duration::from_millis(2),
        ));
        let hub = Arc::new(Hub::new());
        let filerefs = Arc::new(FileRefStore::new(Duration::from_secs(300)));
        let router = Arc::new(SessionRouter::new(pool, dream, filerefs, outputs, hub));
        let pool_pump = spawn_pool_event_pump(router.clone(), pool_rx);
        let dream_pump = spawn_dream_event_pump(router.clone(), dream_rx);
        (router, pool_pump, dream_pump)
    }

    #[tokio::test]
    async fn unknown_type_echoes_id_with_unknown_type_kind() {
        let (router, _p, _d) = test_router();
        let response = router
            .dispatch(Uuid::new_v4(), json!({"type": "bogus", "id": "42"}))
            .await;
        assert_eq!(response["type"], "job:error");
        assert_eq!(response["id"], "42");
        assert_eq!(response["kind"], "UnknownType");
    }

    #[tokio::test]
    async fn ping_yields_pong_echoing_id() {
        let (router, _p, _d) = test_router();
        let response = router.dispatch(Uuid::new_v4(), json!({"type": "ping", "id": "7"})).await;
        assert_eq!(response["type"], "pong");
        assert_eq!(response["id"], "7");
    }

    #[tokio::test]
    async fn submit_generate_job_acks_with_job_id() {
        let (router, _p, _d) = test_router();
        let response = router
            .dispatch(
                Uuid::new_v4(),
                json!({
                    "type": "job:submit",
                    "id": "1",
                    "jobType": "generate",
                    "prompt": "a cat",
                    "size": "512x512",
                    "steps": 2,
                    "cfg": 1.0,
                    "seed": 1,
                }),
            )
            .await;
        assert_eq!(response["type"], "job:ack");
        assert!(response["jobId"].is_string());
    }

    #[tokio::test]
    async fn submit_with_missing_fileref_yields_ref_not_found() {
        let (router, _p, _d) = test_router();
        let response = router
            .dispatch(
                Uuid::new_v4(),
                json!({
                    "type": "job:submit",
                    "id": "1",
                    "jobType": "generate",
                    "prompt": "a cat",
                    "size": "512x512",
                    "steps": 2,
                    "cfg": 1.0,
                    "seed": 1,
                    "initImageRef": "does-not-exist",
                }),
            )
            .await;
        assert_eq!(response["type"], "job:error");
        assert_eq!(response["kind"], "RefNotFound");
    }

    #[tokio::test]
    async fn storage_put_then_submit_resolves_fileref() {
        let (router, _p, _d) = test_router();
        let put = router
            .dispatch(
                Uuid::new_v4(),
                json!({"type": "storage:put", "id": "1", "text": "hello", "contentType": "text/plain"}),
            )
            .await;
        let file_ref = put["fileRef"].as_str().unwrap().to_string();
        let response = router
            .dispatch(
                Uuid::new_v4(),
                json!({
                    "type": "job:submit",
                    "id": "2",
                    "jobType": "generate",
                    "prompt": "a cat",
                    "size": "512x512",
                    "steps": 2,
                    "cfg": 1.0,
                    "seed": 1,
                    "initImageRef": file_ref,
                }),
            )
            .await;
        assert_eq!(response["type"], "job:ack");
    }

    #[tokio::test]
    async fn dream_lifecycle_via_dispatch() {
        let (router, _p, _d) = test_router();
        let session_id = Uuid::new_v4();
        let start = router
            .dispatch(
                session_id,
                json!({"type": "dream:start", "id": "1", "basePrompt": "a cat", "temperature": 0.2}),
            )
            .await;
        assert_eq!(start["type"], "dream:ack");

        let busy = router
            .dispatch(
                Uuid::new_v4(),
                json!({"type": "dream:start", "id": "2", "basePrompt": "a dog"}),
            )
            .await;
        assert_eq!(busy["kind"], "DreamBusy");

        let stop = router.dispatch(session_id, json!({"type": "dream:stop", "id": "3"})).await;
        assert_eq!(stop["type"], "dream:stopped");
    }
}
