use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::backend::DetectorBackend;

pub type SharedBackend = Arc<Mutex<dyn DetectorBackend>>;

/// Thread-safe registry of detector backends.
///
/// Backends are wrapped in `Mutex` because `DetectorBackend::detect` takes `&mut self`.
/// Concurrent streams share a backend and take turns, one frame at a time,
/// unless the backend provides a `session_instance`.
pub struct BackendRegistry {
    backends: HashMap<String, SharedBackend>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_name: None,
        }
    }

    /// Register a backend. The first registered backend becomes the default.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, Arc::new(Mutex::new(backend)));
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    /// Get backend by name.
    pub fn get(&self, name: &str) -> Option<SharedBackend> {
        self.backends.get(name).cloned()
    }

    /// Get default backend.
    pub fn default_backend(&self) -> Option<SharedBackend> {
        self.default_name.as_ref().and_then(|name| self.get(name))
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default_name.as_deref()
    }

    /// List registered backends.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{Detection, MotionBackend, StubBackend};
    use crate::frame::Frame;

    fn frame() -> Frame {
        Frame::from_rgb(vec![0u8; 12], 2, 2).expect("frame")
    }

    #[test]
    fn first_registered_backend_is_default() {
        let mut registry = BackendRegistry::new();
        registry.register(StubBackend::new());
        registry.register(MotionBackend::new());
        assert_eq!(registry.default_name(), Some("stub"));
        assert_eq!(registry.list(), vec!["motion".to_string(), "stub".to_string()]);
    }

    #[test]
    fn set_default_requires_registration() {
        let mut registry = BackendRegistry::new();
        registry.register(StubBackend::new());
        assert!(registry.set_default("tract").is_err());
        registry.register(MotionBackend::new());
        registry.set_default("motion").expect("motion registered");
        assert_eq!(registry.default_name(), Some("motion"));
    }

    #[test]
    fn default_backend_is_shared_between_lookups() -> Result<()> {
        let hit = Detection {
            x1: 0.0,
            y1: 0.0,
            x2: 1.0,
            y2: 1.0,
            confidence: Some(0.5),
            class_id: 0,
            label: "bin".to_string(),
        };
        let mut registry = BackendRegistry::new();
        registry.register(StubBackend::scripted(vec![vec![hit], vec![]]));
        let first = registry.default_backend().expect("default backend");
        let second = registry.default_backend().expect("default backend");
        assert!(Arc::ptr_eq(&first, &second));

        let detect = |backend: &SharedBackend| -> Result<usize> {
            let mut guard = backend.lock().map_err(|_| anyhow!("backend lock poisoned"))?;
            Ok(guard.detect(&frame())?.count())
        };
        // both handles advance the same script
        assert_eq!(detect(&first)?, 1);
        assert_eq!(detect(&second)?, 0);
        Ok(())
    }

    #[test]
    fn empty_registry_has_no_default() {
        assert!(BackendRegistry::new().default_backend().is_none());
    }
}
