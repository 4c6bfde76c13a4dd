use anyhow::{anyhow, Result};
use image::RgbImage;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::detect::backend::{DetectionCapability, DetectorBackend};
use crate::detect::result::DetectionResult;

/// Scripted backend for tests and model-less deployments.
///
/// Returns queued results in order, then the fallback result. Every call is
/// counted, including failures.
pub struct StubBackend {
    name: &'static str,
    capability: DetectionCapability,
    script: VecDeque<Result<DetectionResult, String>>,
    fallback: DetectionResult,
    calls: Arc<AtomicUsize>,
}

impl StubBackend {
    /// Object-detection stub that detects nothing.
    pub fn new() -> Self {
        Self::with_capability("stub", DetectionCapability::ObjectDetection)
    }

    /// Motion stub that detects nothing.
    pub fn motion() -> Self {
        Self::with_capability("stub-motion", DetectionCapability::Motion)
    }

    pub fn with_capability(name: &'static str, capability: DetectionCapability) -> Self {
        Self {
            name,
            capability,
            script: VecDeque::new(),
            fallback: DetectionResult::default(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Result returned once the script is exhausted.
    pub fn with_fallback(mut self, result: DetectionResult) -> Self {
        self.fallback = result;
        self
    }

    pub fn push_result(&mut self, result: DetectionResult) -> &mut Self {
        self.script.push_back(Ok(result));
        self
    }

    pub fn push_failure(&mut self, reason: &str) -> &mut Self {
        self.script.push_back(Err(reason.to_string()));
        self
    }

    /// Shared call counter; stays valid after the backend moves into a registry.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        self.name
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        capability == self.capability
    }

    fn detect(&mut self, _frame: &RgbImage) -> Result<DetectionResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.script.pop_front() {
            Some(Ok(result)) => Ok(result),
            Some(Err(reason)) => Err(anyhow!("{}: {}", self.name, reason)),
            None => Ok(self.fallback.clone()),
        }
    }
}
