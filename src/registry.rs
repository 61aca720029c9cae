use std::collections::HashMap;
use std::sync::Mutex;

use serde::Serialize;

#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub model_id: String,
    pub est_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistryStats {
    pub used_bytes: u64,
    pub available_bytes: u64,
    pub loaded_models: Vec<String>,
}

struct Inner {
    loaded: HashMap<String, ModelInfo>,
    total_bytes: u64,
}

/// Tracks what's resident on the device and how much VRAM is in use. Purely
/// observational: it never loads anything itself, it only records what the
/// worker thread tells it after a successful load/unload.
pub struct ModelRegistry {
    inner: Mutex<Inner>,
}

impl ModelRegistry {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                loaded: HashMap::new(),
                total_bytes,
            }),
        }
    }

    pub fn register(&self, info: ModelInfo) {
        let mut inner = self.inner.lock().unwrap();
        inner.loaded.insert(info.model_id.clone(), info);
    }

    pub fn unregister(&self, model_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        inner.loaded.remove(model_id);
    }

    pub fn used_bytes(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.loaded.values().map(|m| m.est_bytes).sum()
    }

    pub fn available_bytes(&self) -> u64 {
        let inner = self.inner.lock().unwrap();
        inner.total_bytes.saturating_sub(
            inner.loaded.values().map(|m| m.est_bytes).sum::<u64>(),
        )
    }

    pub fn can_fit(&self, est_bytes: u64) -> bool {
        self.available_bytes() >= est_bytes
    }

    pub fn is_loaded(&self, model_id: &str) -> bool {
        self.inner.lock().unwrap().loaded.contains_key(model_id)
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.inner.lock().unwrap();
        RegistryStats {
            used_bytes: inner.loaded.values().map(|m| m.est_bytes).sum(),
            available_bytes: inner.total_bytes.saturating_sub(
                inner.loaded.values().map(|m| m.est_bytes).sum::<u64>(),
            ),
            loaded_models: inner.loaded.keys().cloned().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_fit_reflects_registered_models() {
        let registry = ModelRegistry::new(1000);
        assert!(registry.can_fit(900));
        registry.register(ModelInfo {
            model_id: "sdxl-base".into(),
            est_bytes: 600,
        });
        assert!(registry.is_loaded("sdxl-base"));
        assert!(!registry.can_fit(500));
        assert!(registry.can_fit(400));
    }

    #[test]
    fn unregister_frees_capacity() {
        let registry = ModelRegistry::new(1000);
        registry.register(ModelInfo {
            model_id: "m".into(),
            est_bytes: 800,
        });
        registry.unregister("m");
        assert!(!registry.is_loaded("m"));
        assert_eq!(registry.used_bytes(), 0);
        assert_eq!(registry.available_bytes(), 1000);
    }
}
