use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Result};

use super::backend::{DetectionCapability, DetectorBackend};

/// A backend shared between threads. Concurrent callers are serialised by the mutex.
pub type SharedDetector = Arc<Mutex<dyn DetectorBackend>>;

type BackendFactory = Arc<dyn Fn() -> Box<dyn DetectorBackend> + Send + Sync>;

const ALL_CAPABILITIES: [DetectionCapability; 2] = [
    DetectionCapability::Motion,
    DetectionCapability::ObjectDetection,
];

enum Entry {
    /// One instance for every stream (stateless per frame, e.g. object detectors).
    Shared(SharedDetector),
    /// A fresh instance per stream (keeps state across frames, e.g. motion).
    PerStream(BackendFactory),
}

struct Registered {
    capabilities: Vec<DetectionCapability>,
    entry: Entry,
}

/// Registry of detector backends, keyed by backend name.
pub struct BackendRegistry {
    backends: HashMap<String, Registered>,
    default_name: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
            default_name: None,
        }
    }

    /// Register a backend instance shared by every stream.
    /// The first registered backend becomes the default.
    pub fn register<B: DetectorBackend + 'static>(&mut self, backend: B) {
        let name = backend.name().to_string();
        let capabilities = capabilities_of(&backend);
        self.insert(
            name,
            Registered {
                capabilities,
                entry: Entry::Shared(Arc::new(Mutex::new(backend))),
            },
        );
    }

    /// Register a backend that needs its own instance per stream.
    pub fn register_per_stream<F, B>(&mut self, factory: F)
    where
        F: Fn() -> B + Send + Sync + 'static,
        B: DetectorBackend + 'static,
    {
        let sample = factory();
        let name = sample.name().to_string();
        let capabilities = capabilities_of(&sample);
        let factory: BackendFactory =
            Arc::new(move || -> Box<dyn DetectorBackend> { Box::new(factory()) });
        self.insert(
            name,
            Registered {
                capabilities,
                entry: Entry::PerStream(factory),
            },
        );
    }

    fn insert(&mut self, name: String, registered: Registered) {
        if self.default_name.is_none() {
            self.default_name = Some(name.clone());
        }
        self.backends.insert(name, registered);
    }

    /// Set default backend by name.
    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.backends.contains_key(name) {
            return Err(anyhow!("backend '{}' not registered", name));
        }
        self.default_name = Some(name.to_string());
        Ok(())
    }

    /// List registered backends.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.keys().cloned().collect();
        names.sort();
        names
    }

    /// Get a backend handle by name.
    pub fn get(&self, name: &str) -> Option<SharedDetector> {
        self.backends.get(name).map(instantiate)
    }

    /// Get a backend handle that supports the requested capability.
    ///
    /// Prefers the default backend when it supports the capability.
    pub fn backend_for_capability(
        &self,
        capability: DetectionCapability,
    ) -> Result<SharedDetector> {
        if let Some(default) = self
            .default_name
            .as_ref()
            .and_then(|name| self.backends.get(name))
        {
            if default.capabilities.contains(&capability) {
                return Ok(instantiate(default));
            }
        }

        let mut names: Vec<&String> = self.backends.keys().collect();
        names.sort();
        for name in names {
            let registered = &self.backends[name];
            if registered.capabilities.contains(&capability) {
                return Ok(instantiate(registered));
            }
        }

        Err(anyhow!(
            "no registered backend supports capability {:?}",
            capability
        ))
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn capabilities_of(backend: &dyn DetectorBackend) -> Vec<DetectionCapability> {
    ALL_CAPABILITIES
        .into_iter()
        .filter(|cap| backend.supports(*cap))
        .collect()
}

fn instantiate(registered: &Registered) -> SharedDetector {
    match &registered.entry {
        Entry::Shared(backend) => backend.clone(),
        Entry::PerStream(factory) => {
            let backend: Box<dyn DetectorBackend> = factory();
            Arc::new(Mutex::new(BoxedBackend(backend)))
        }
    }
}

/// Adapts a boxed backend into a sized type for `Arc<Mutex<dyn _>>`.
struct BoxedBackend(Box<dyn DetectorBackend>);

impl DetectorBackend for BoxedBackend {
    fn name(&self) -> &'static str {
        self.0.name()
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        self.0.supports(capability)
    }

    fn detect(&mut self, frame: &image::RgbImage) -> Result<super::DetectionResult> {
        self.0.detect(frame)
    }

    fn warm_up(&mut self) -> Result<()> {
        self.0.warm_up()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::backends::{CpuMotionBackend, StubBackend};

    #[test]
    fn picks_backend_by_capability() {
        let mut registry = BackendRegistry::new();
        registry.register(StubBackend::new());
        registry.register_per_stream(CpuMotionBackend::default);

        let motion = registry
            .backend_for_capability(DetectionCapability::Motion)
            .unwrap();
        assert_eq!(motion.lock().unwrap().name(), "cpu-motion");

        let objects = registry
            .backend_for_capability(DetectionCapability::ObjectDetection)
            .unwrap();
        assert_eq!(objects.lock().unwrap().name(), "stub");
    }

    #[test]
    fn per_stream_backends_are_distinct_instances() {
        let mut registry = BackendRegistry::new();
        registry.register_per_stream(CpuMotionBackend::default);
        let a = registry
            .backend_for_capability(DetectionCapability::Motion)
            .unwrap();
        let b = registry
            .backend_for_capability(DetectionCapability::Motion)
            .unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn shared_backends_are_the_same_instance() {
        let mut registry = BackendRegistry::new();
        registry.register(StubBackend::new());
        let a = registry.get("stub").unwrap();
        let b = registry.get("stub").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn missing_capability_is_an_error() {
        let mut registry = BackendRegistry::new();
        registry.register_per_stream(CpuMotionBackend::default);
        assert!(registry
            .backend_for_capability(DetectionCapability::ObjectDetection)
            .is_err());
        assert!(registry.set_default("tract").is_err());
    }
}
