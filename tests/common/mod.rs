//! Shared mocks and fixtures for the integration tests
//!
//! Integration tests cannot see the crate's private test utilities, so the
//! loader, engine and backend doubles live here.

#![allow(dead_code)]

use image::{DynamicImage, ImageFormat, RgbImage};
use ndarray::Array4;
use pixport_bgremove::{
    BackendDescriptor, BackendError, BackendKind, BackendRegistry, DeploymentProfile,
    FixedMemoryProbe, Image, InferenceEngine, Mask, MemoryProbe, Result, SegmentationBackend,
    SegmentationService, Session, SessionError, SessionLoader,
};
use std::collections::HashSet;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Engine that marks a centred disc as foreground and counts live instances
pub struct DiscEngine {
    live: Arc<AtomicUsize>,
}

impl DiscEngine {
    fn new(live: Arc<AtomicUsize>, peak: &AtomicUsize) -> Self {
        let now = live.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
        Self { live }
    }
}

impl Drop for DiscEngine {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl InferenceEngine for DiscEngine {
    fn infer(&mut self, input: &Array4<f32>) -> std::result::Result<Array4<f32>, BackendError> {
        let (batch, _, height, width) = input.dim();
        let (cx, cy) = (width as f32 / 2.0, height as f32 / 2.0);
        let radius = width.min(height) as f32 / 3.0;
        Ok(Array4::from_shape_fn((batch, 1, height, width), |(_, _, y, x)| {
            let (dx, dy) = (x as f32 - cx, y as f32 - cy);
            if dx * dx + dy * dy <= radius * radius {
                1.0
            } else {
                0.0
            }
        }))
    }

    fn runtime_name(&self) -> &'static str {
        "disc"
    }
}

/// Loader with per-kind failure injection and engine accounting
#[derive(Default)]
pub struct ScriptedLoader {
    failing: Mutex<HashSet<BackendKind>>,
    loads: AtomicUsize,
    live_engines: Arc<AtomicUsize>,
    peak_engines: AtomicUsize,
}

impl ScriptedLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(kinds: &[BackendKind]) -> Self {
        let loader = Self::default();
        loader.failing.lock().unwrap().extend(kinds.iter().copied());
        loader
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn live_engines(&self) -> usize {
        self.live_engines.load(Ordering::SeqCst)
    }

    pub fn peak_engines(&self) -> usize {
        self.peak_engines.load(Ordering::SeqCst)
    }
}

impl SessionLoader for ScriptedLoader {
    fn load(
        &self,
        kind: BackendKind,
    ) -> std::result::Result<Box<dyn InferenceEngine>, SessionError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().unwrap().contains(&kind) {
            return Err(SessionError::LoadFailure {
                backend: kind,
                attempts: 1,
                last_error: "failed to allocate memory for model weights".to_string(),
            });
        }
        Ok(Box::new(DiscEngine::new(
            Arc::clone(&self.live_engines),
            &self.peak_engines,
        )))
    }
}

/// Backend that always fails with a fixed error, posing as `kind`
pub struct FailingBackend {
    descriptor: BackendDescriptor,
    error: BackendError,
    calls: AtomicUsize,
}

impl FailingBackend {
    pub fn new(kind: BackendKind, error: BackendError) -> Self {
        Self {
            descriptor: kind.descriptor(),
            error,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl SegmentationBackend for FailingBackend {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn compute_mask(
        &self,
        _image: &Image,
        _session: Option<&Session>,
    ) -> std::result::Result<Mask, BackendError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.error.clone())
    }
}

/// Backend returning a mask of the wrong size, posing as `kind`
pub struct WrongSizeBackend {
    descriptor: BackendDescriptor,
}

impl WrongSizeBackend {
    pub fn new(kind: BackendKind) -> Self {
        Self {
            descriptor: kind.descriptor(),
        }
    }
}

impl SegmentationBackend for WrongSizeBackend {
    fn descriptor(&self) -> &BackendDescriptor {
        &self.descriptor
    }

    fn compute_mask(
        &self,
        image: &Image,
        _session: Option<&Session>,
    ) -> std::result::Result<Mask, BackendError> {
        Ok(Mask::filled(image.width() + 1, image.height(), 255))
    }
}

/// Default registry with `backend` replacing the built-in of the same kind
pub fn registry_with(backend: Arc<dyn SegmentationBackend>) -> BackendRegistry {
    let mut registry = BackendRegistry::with_defaults();
    registry.register(backend);
    registry
}

/// Routes crate logs to the test harness, `RUST_LOG=debug` shows the fallback chain
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn service(
    profile: DeploymentProfile,
    registry: BackendRegistry,
    loader: Arc<ScriptedLoader>,
    probe: Arc<dyn MemoryProbe>,
) -> Result<SegmentationService> {
    init_logging();
    SegmentationService::with_components(profile, registry, loader, probe)
}

/// Service with built-in backends, a healthy loader and no memory figures
pub fn default_service(profile: DeploymentProfile) -> Result<SegmentationService> {
    service(
        profile,
        BackendRegistry::with_defaults(),
        Arc::new(ScriptedLoader::new()),
        Arc::new(FixedMemoryProbe::unavailable()),
    )
}

/// A subject on a plain background: dark square centred on light grey
pub fn subject_image(width: u32, height: u32) -> RgbImage {
    RgbImage::from_fn(width, height, |x, y| {
        let inside = x > width / 4 && x < width * 3 / 4 && y > height / 4 && y < height * 3 / 4;
        if inside {
            image::Rgb([40, 30, 120])
        } else {
            image::Rgb([225, 225, 225])
        }
    })
}

pub fn encode(image: RgbImage, format: ImageFormat) -> Vec<u8> {
    let mut buffer = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut buffer, format)
        .unwrap();
    buffer.into_inner()
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    encode(subject_image(width, height), ImageFormat::Png)
}
