//! Test utilities and mocks for segmentation and session testing
//!
//! Mocks record their calls so tests can verify which backend or loader was
//! used without requiring model files or a neural runtime.

use crate::{
    backends::{BackendDescriptor, BackendKind, SegmentationBackend},
    error::{BackendError, SessionError},
    runtime::{InferenceEngine, SessionLoader},
    session::Session,
    types::{Image, Mask},
};
use ndarray::Array4;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Shared call log
pub type CallHistory = Arc<Mutex<Vec<String>>>;

/// How a [`MockEngine`] answers
#[derive(Debug, Clone)]
pub enum MockOutput {
    /// Every output pixel has this probability
    Constant(f32),
    /// Circular foreground in the centre of the tile
    Circle,
    /// A tensor with the wrong rank-4 layout (two rows only)
    WrongShape,
    /// Fail with this error
    Fail(BackendError),
}

/// Mock inference engine producing a `(1, 1, H, W)` tensor for a `(1, 3, H, W)` input
#[derive(Debug, Clone)]
pub struct MockEngine {
    output: MockOutput,
    call_history: CallHistory,
}

impl MockEngine {
    #[must_use]
    pub fn new(output: MockOutput) -> Self {
        Self {
            output,
            call_history: Arc::new(Mutex::new(Vec::new())),
        }
    }

    #[must_use]
    pub fn constant(value: f32) -> Self {
        Self::new(MockOutput::Constant(value))
    }

    #[must_use]
    pub fn with_history(mut self, history: CallHistory) -> Self {
        self.call_history = history;
        self
    }

    fn record_call(&self, method: &str) {
        if let Ok(mut history) = self.call_history.lock() {
            history.push(method.to_string());
        }
    }
}

impl InferenceEngine for MockEngine {
    fn infer(&mut self, input: &Array4<f32>) -> Result<Array4<f32>, BackendError> {
        self.record_call("infer");
        let (batch, _, height, width) = input.dim();

        match &self.output {
            MockOutput::Constant(value) => Ok(Array4::from_elem((batch, 1, height, width), *value)),
            MockOutput::Circle => {
                let cx = width as f32 / 2.0;
                let cy = height as f32 / 2.0;
                let radius = width.min(height) as f32 / 3.0;
                Ok(Array4::from_shape_fn((batch, 1, height, width), |(_, _, y, x)| {
                    let dx = x as f32 - cx;
                    let dy = y as f32 - cy;
                    if (dx * dx + dy * dy).sqrt() < radius {
                        1.0
                    } else {
                        0.0
                    }
                }))
            },
            MockOutput::WrongShape => Ok(Array4::zeros((batch, 1, 2, 2))),
            MockOutput::Fail(err) => Err(err.clone()),
        }
    }

    fn runtime_name(&self) -> &'static str {
        "mock"
    }
}

type EngineFactory = Box<dyn Fn() -> MockEngine + Send + Sync>;

/// Mock loader with failure injection
pub struct MockLoader {
    call_history: CallHistory,
    remaining_failures: AtomicUsize,
    failing_kind: Option<BackendKind>,
    engine_factory: EngineFactory,
    reclaims: Arc<AtomicUsize>,
}

impl MockLoader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            call_history: Arc::new(Mutex::new(Vec::new())),
            remaining_failures: AtomicUsize::new(0),
            failing_kind: None,
            engine_factory: Box::new(|| MockEngine::constant(1.0)),
            reclaims: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fail the first `count` load calls
    #[must_use]
    pub fn failing_first(self, count: usize) -> Self {
        self.remaining_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Always fail loads for `kind`
    #[must_use]
    pub fn failing_kind(mut self, kind: BackendKind) -> Self {
        self.failing_kind = Some(kind);
        self
    }

    #[must_use]
    pub fn with_engine<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> MockEngine + Send + Sync + 'static,
    {
        self.engine_factory = Box::new(factory);
        self
    }

    #[must_use]
    pub fn call_history(&self) -> CallHistory {
        Arc::clone(&self.call_history)
    }

    #[must_use]
    pub fn reclaim_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.reclaims)
    }
}

impl Default for MockLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionLoader for MockLoader {
    fn load(&self, kind: BackendKind) -> Result<Box<dyn InferenceEngine>, SessionError> {
        if let Ok(mut history) = self.call_history.lock() {
            history.push(format!("load:{kind}"));
        }

        let injected = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        if injected || self.failing_kind == Some(kind) {
            return Err(SessionError::LoadFailure {
                backend: kind,
                attempts: 1,
                last_error: "simulated load failure".to_string(),
            });
        }

        Ok(Box::new((self.engine_factory)()))
    }

    fn reclaim(&self) {
        self.reclaims.fetch_add(1, Ordering::SeqCst);
    }
}

/// Mock segmentation backend returning a fixed mask value or a fixed error
pub struct MockBackend {
    descriptor: BackendDescriptor,
    result: Result<u8, BackendError>,
    calls: Arc<AtomicUsize>,
}

impl MockBackend {
    #[must_use]
    pub fn succeeding(kind: BackendKind, value: u8) -> Self {
        Self {
            descriptor: kind.descriptor(),
            result: Ok(value),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn failing(kind: BackendKind, error: BackendError) -> Self {
        Self {
            descriptor: kind.descriptor(),
            result: Err(error),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    #[must_use]
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.calls)
    }
}

impl SegmentationBackend for MockBackend {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn compute_mask(
        &self,
        image: &Image,
        _session: Option<&Session>,
    ) -> Result<Mask, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.result {
            Ok(value) => Ok(Mask::filled(image.width(), image.height(), *value)),
            Err(err) => Err(err.clone()),
        }
    }
}
