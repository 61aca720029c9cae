use std::collections::HashMap;
use std::path::Path;

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::model::{LoraRef, ModeSpec};

/// Runtime configuration: bind addresses, queue bounds, timeouts, TTLs, dream
/// defaults. Loaded by layering compiled-in defaults, an optional TOML file,
/// then `APP_`-prefixed environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http_address: String,
    pub http_port: u16,
    pub ws_path: String,
    pub queue_max: usize,
    pub vram_total_bytes: u64,
    pub fileref_ttl_seconds: u64,
    pub fileref_sweep_interval_seconds: u64,
    pub job_timeout_seconds: u64,
    pub system_status_interval_seconds: u64,
    pub ws_ping_interval_seconds: u64,
    pub ws_idle_timeout_seconds: u64,
    pub dream_min_interval_ms: u64,
    pub dream_max_interval_ms: u64,
    pub modes_path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            http_address: "0.0.0.0".to_string(),
            http_port: 8188,
            ws_path: "/v1/ws".to_string(),
            queue_max: 64,
            vram_total_bytes: 24 * 1024 * 1024 * 1024,
            fileref_ttl_seconds: 300,
            fileref_sweep_interval_seconds: 30,
            job_timeout_seconds: 300,
            system_status_interval_seconds: 5,
            ws_ping_interval_seconds: 30,
            ws_idle_timeout_seconds: 60,
            dream_min_interval_ms: 200,
            dream_max_interval_ms: 60_000,
            modes_path: "config/modes.yaml".to_string(),
        }
    }
}

impl AppConfig {
    pub fn load(config_file: impl AsRef<Path>) -> anyhow::Result<Self> {
        let figment = Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(config_file.as_ref()))
            .merge(Env::prefixed("APP_"));
        Ok(figment.extract()?)
    }
}

/// One LoRA entry in a mode's stack. A bare string in the YAML document means
/// strength 1.0; the richer `{path, strength}` form is also accepted.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum LoraEntry {
    Bare(String),
    Full { path: String, strength: f32 },
}

impl From<LoraEntry> for LoraRef {
    fn from(entry: LoraEntry) -> Self {
        match entry {
            LoraEntry::Bare(path) => LoraRef { path, strength: 1.0 },
            LoraEntry::Full { path, strength } => LoraRef { path, strength },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ModeDefaults {
    #[serde(default = "default_size")]
    size: String,
    #[serde(default = "default_steps")]
    steps: u32,
    #[serde(default = "default_guidance")]
    guidance: f32,
}

fn default_size() -> String {
    "512x512".to_string()
}
fn default_steps() -> u32 {
    20
}
fn default_guidance() -> f32 {
    7.5
}

impl Default for ModeDefaults {
    fn default() -> Self {
        Self {
            size: default_size(),
            steps: default_steps(),
            guidance: default_guidance(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
struct ModeDocEntry {
    model: String,
    #[serde(default)]
    loras: Vec<LoraEntry>,
    #[serde(default)]
    default_size: Option<String>,
    #[serde(default)]
    default_steps: Option<u32>,
    #[serde(default)]
    default_guidance: Option<f32>,
    #[serde(default)]
    est_vram_bytes: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct ModeDoc {
    default_mode: String,
    model_root: String,
    #[serde(default)]
    lora_root: String,
    modes: HashMap<String, ModeDocEntry>,
}

/// The parsed, in-memory set of named mode recipes. Reloaded only via an
/// explicit admin operation (never by a filesystem watcher, which is an
/// out-of-scope collaborator).
#[derive(Debug, Clone, Default)]
pub struct ModeConfig {
    pub default_mode: String,
    pub modes: HashMap<String, ModeSpec>,
}

impl ModeConfig {
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        let doc: ModeDoc = serde_yaml::from_str(yaml)?;
        Self::from_doc(doc)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&contents)
    }

    fn from_doc(doc: ModeDoc) -> anyhow::Result<Self> {
        if !doc.modes.contains_key(&doc.default_mode) {
            anyhow::bail!(
                "default_mode '{}' is not present among the configured modes",
                doc.default_mode
            );
        }
        let mut modes = HashMap::new();
        for (name, entry) in doc.modes {
            let defaults = ModeDefaults {
                size: entry.default_size.unwrap_or_else(default_size),
                steps: entry.default_steps.unwrap_or_else(default_steps),
                guidance: entry.default_guidance.unwrap_or_else(default_guidance),
            };
            let model_path = format!("{}/{}", doc.model_root, entry.model);
            let lora_stack = entry
                .loras
                .into_iter()
                .map(|l| {
                    let lora: LoraRef = l.into();
                    LoraRef {
                        path: format!("{}/{}", doc.lora_root, lora.path),
                        strength: lora.strength,
                    }
                })
                .collect();
            modes.insert(
                name.clone(),
                ModeSpec {
                    is_default: name == doc.default_mode,
                    name,
                    model_path,
                    lora_stack,
                    default_size: defaults.size,
                    default_steps: defaults.steps,
                    default_guidance: defaults.guidance,
                    est_vram_bytes: entry.est_vram_bytes.unwrap_or(0),
                },
            );
        }
        Ok(Self {
            default_mode: doc.default_mode,
            modes,
        })
    }

    pub fn get(&self, name: &str) -> Option<&ModeSpec> {
        self.modes.get(name)
    }

    /// The exactly-one mode marked `default`; it can never be deleted by the
    /// (out-of-scope) admin reload path.
    pub fn default_spec(&self) -> &ModeSpec {
        self.modes
            .get(&self.default_mode)
            .expect("default_mode is validated to exist at load time")
    }
}
