//! Video Output Modules
//!
//! The renderer collaborator sits behind [`RenderBackend`]. The session
//! selects one [`VideoModule`] at startup: a GPU-backed module wrapping a
//! backend, or the no-op module that accepts no decoders.

use crate::decoder::{DecodedPicture, DecoderId, SurfaceFormat};
use crate::geometry::{OutputGeometry, Rect};
use crate::surface_pool::SurfaceId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Surface allocation failed: {0}")]
    SurfaceAllocation(String),
    #[error("Upload failed: {0}")]
    Upload(String),
    #[error("Vsync wait failed: {0}")]
    Vsync(String),
    #[error("Present failed: {0}")]
    Present(String),
}

/// GPU side of video output
pub trait RenderBackend: Send {
    fn name(&self) -> &str;

    /// Allocate `count` surfaces for a decoder, replacing any it had.
    fn create_surfaces(
        &mut self,
        decoder: DecoderId,
        count: usize,
        width: u32,
        height: u32,
        format: SurfaceFormat,
    ) -> Result<(), RenderError>;

    fn destroy_surfaces(&mut self, decoder: DecoderId);

    fn upload(&mut self, decoder: DecoderId, surface: SurfaceId, picture: &DecodedPicture) -> Result<(), RenderError>;

    /// Block until the next vertical refresh.
    fn wait_for_vsync(&mut self) -> Result<(), RenderError>;

    fn clear(&mut self);

    /// Draw one field (`field` 0 or 1) or progressive frame.
    fn draw_surface(&mut self, decoder: DecoderId, surface: SurfaceId, field: u8, geometry: &OutputGeometry);

    fn draw_black(&mut self, rect: Rect);

    fn present(&mut self) -> Result<(), RenderError>;

    fn resize(&mut self, _width: u32, _height: u32) {}
}

// ============================================================================
// Video Module
// ============================================================================

pub enum VideoModule {
    Gpu(Box<dyn RenderBackend>),
    Noop,
}

impl VideoModule {
    pub const NOOP_NAME: &'static str = "noop";

    /// Pick the module for `driver`. `None` takes the backend if there is
    /// one; an unknown name falls back to no-op.
    pub fn select(driver: Option<&str>, backend: Option<Box<dyn RenderBackend>>) -> Self {
        match (driver, backend) {
            (Some(name), _) if name.eq_ignore_ascii_case(Self::NOOP_NAME) => VideoModule::Noop,
            (None, Some(backend)) => VideoModule::Gpu(backend),
            (Some(name), Some(backend)) if name.eq_ignore_ascii_case(backend.name()) => {
                VideoModule::Gpu(backend)
            }
            (Some(name), _) => {
                tracing::error!("video output module '{}' isn't supported, using no-op", name);
                VideoModule::Noop
            }
            (None, None) => VideoModule::Noop,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            VideoModule::Gpu(backend) => backend.name(),
            VideoModule::Noop => Self::NOOP_NAME,
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, VideoModule::Noop)
    }

    pub fn backend_mut(&mut self) -> Option<&mut dyn RenderBackend> {
        match self {
            VideoModule::Gpu(backend) => Some(backend.as_mut()),
            VideoModule::Noop => None,
        }
    }
}

// ============================================================================
// Software Vsync
// ============================================================================

/// Fixed-rate vblank stand-in. Deadlines stay on the refresh grid; a
/// caller more than one interval late starts a new grid.
pub struct SoftwareVsync {
    period: Duration,
    next: Instant,
}

impl SoftwareVsync {
    pub fn new(refresh_hz: f64) -> Self {
        let period = if refresh_hz > 0.0 {
            Duration::from_secs_f64(1.0 / refresh_hz)
        } else {
            Duration::from_millis(20)
        };
        Self { period, next: Instant::now() + period }
    }

    pub fn wait(&mut self) {
        let now = Instant::now();
        if now < self.next {
            std::thread::sleep(self.next - now);
            self.next += self.period;
        } else if now - self.next > self.period {
            self.next = now + self.period;
        } else {
            self.next += self.period;
        }
    }
}

// ============================================================================
// Headless Backend
// ============================================================================

/// What a [`HeadlessBackend`] has been asked to do
#[derive(Debug, Clone, Default)]
pub struct HeadlessStats {
    /// Live surface count per decoder
    pub surfaces: HashMap<DecoderId, usize>,
    pub destroyed: u64,
    pub uploads: u64,
    pub vsyncs: u64,
    pub draws: u64,
    pub black: u64,
    pub presents: u64,
    /// Last surface drawn per decoder, with its field
    pub last_drawn: HashMap<DecoderId, (SurfaceId, u8)>,
}

/// Backend that renders nowhere, paced by an optional software vsync
pub struct HeadlessBackend {
    vsync: Option<SoftwareVsync>,
    stats: Arc<Mutex<HeadlessStats>>,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    pub const NAME: &'static str = "headless";

    /// Unpaced: vsync returns immediately.
    pub fn new() -> Self {
        Self {
            vsync: None,
            stats: Arc::new(Mutex::new(HeadlessStats::default())),
        }
    }

    pub fn with_refresh(refresh_hz: f64) -> Self {
        Self {
            vsync: Some(SoftwareVsync::new(refresh_hz)),
            ..Self::new()
        }
    }

    /// Shared view of the counters, usable after the backend is boxed.
    pub fn stats_handle(&self) -> Arc<Mutex<HeadlessStats>> {
        self.stats.clone()
    }

    pub fn stats(&self) -> HeadlessStats {
        self.stats.lock().clone()
    }
}

impl RenderBackend for HeadlessBackend {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn create_surfaces(
        &mut self,
        decoder: DecoderId,
        count: usize,
        width: u32,
        height: u32,
        format: SurfaceFormat,
    ) -> Result<(), RenderError> {
        if width == 0 || height == 0 {
            return Err(RenderError::SurfaceAllocation(format!("{}x{}", width, height)));
        }
        tracing::debug!("headless: {} {:?} surfaces {}x{} for {}", count, format, width, height, decoder);
        self.stats.lock().surfaces.insert(decoder, count);
        Ok(())
    }

    fn destroy_surfaces(&mut self, decoder: DecoderId) {
        let mut stats = self.stats.lock();
        stats.surfaces.remove(&decoder);
        stats.last_drawn.remove(&decoder);
        stats.destroyed += 1;
    }

    fn upload(&mut self, decoder: DecoderId, surface: SurfaceId, _picture: &DecodedPicture) -> Result<(), RenderError> {
        let mut stats = self.stats.lock();
        match stats.surfaces.get(&decoder) {
            Some(&count) if surface.index() < count => {
                stats.uploads += 1;
                Ok(())
            }
            _ => Err(RenderError::Upload(format!("{:?} not allocated for {}", surface, decoder))),
        }
    }

    fn wait_for_vsync(&mut self) -> Result<(), RenderError> {
        if let Some(vsync) = self.vsync.as_mut() {
            vsync.wait();
        }
        self.stats.lock().vsyncs += 1;
        Ok(())
    }

    fn clear(&mut self) {}

    fn draw_surface(&mut self, decoder: DecoderId, surface: SurfaceId, field: u8, _geometry: &OutputGeometry) {
        let mut stats = self.stats.lock();
        stats.draws += 1;
        stats.last_drawn.insert(decoder, (surface, field));
    }

    fn draw_black(&mut self, _rect: Rect) {
        self.stats.lock().black += 1;
    }

    fn present(&mut self) -> Result<(), RenderError> {
        self.stats.lock().presents += 1;
        Ok(())
    }
}
