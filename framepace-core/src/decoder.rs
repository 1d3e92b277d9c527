//! # Decoder Instance
//!
//! One per open video stream. Owns the surface pool, the display ring, the
//! presentation clock and the sync engine for that stream. Every method
//! here runs under the session lock held by [`crate::output::VideoOutput`];
//! only [`StreamControl`] is shared with other threads.
//!
//! ```text
//! VideoStream ──submit──► SurfacePool ──► SurfaceRing ──► RenderBackend
//!                              ▲              │
//!                              └──advance─────┘
//! ```

use crate::clock::{ClockTracker, ClockUpdate, FrameRate, FrameTimestamps, Pts};
use crate::config::{BlackPicture, ResolutionBucket, VideoConfig};
use crate::geometry::{compute_output, DisplayInfo, InputFormat, OutputGeometry, Rational, Rect};
use crate::render::{RenderBackend, RenderError};
use crate::ring_buffer::{min_frames, Advance, SurfaceRing, VIDEO_SURFACES_MAX};
use crate::surface_pool::{SurfaceId, SurfacePool};
use crate::sync::{video_clock, AudioClock, SyncDecision, SyncEngine, SyncInputs, TrickPlay};
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Closing countdown of a freshly opened stream: already drained
pub const CLOSING_FRESH: i32 = -301;
/// Countdown values below this mean the stream is closed and drained
const CLOSING_EXPIRED: i32 = -300;
/// Surfaces per decoder: full display queue plus one decode-ahead slot
pub const SURFACES_NEEDED: usize = VIDEO_SURFACES_MAX + 1;
/// Statistics are logged every this many displayed frames
const STATS_INTERVAL: u64 = 300;

#[derive(Debug, Error)]
pub enum VideoError {
    #[error("No video output module available")]
    NoModule,
    #[error("Out of decoders (max {0})")]
    OutOfDecoders(usize),
    #[error("Unknown decoder {0}")]
    UnknownDecoder(DecoderId),
    #[error("No hardware pixel format among {0:?}")]
    NoHardwareFormat(Vec<PixelFormat>),
    #[error("Render backend: {0}")]
    Render(#[from] RenderError),
}

// ============================================================================
// Formats and Pictures
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DecoderId(u32);

impl DecoderId {
    pub(crate) const fn new(n: u32) -> Self {
        Self(n)
    }
}

impl fmt::Display for DecoderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Pixel formats a codec may offer during negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// GPU-resident frames
    Cuda,
    Nv12,
    P010,
    Yuv420p,
}

impl PixelFormat {
    pub fn is_hardware(&self) -> bool {
        matches!(self, PixelFormat::Cuda)
    }
}

/// Storage layout of decoder surfaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SurfaceFormat {
    /// 8-bit 4:2:0
    Nv12,
    /// 10-bit in 16-bit containers
    P016,
}

/// Stream parameters known at negotiation time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub width: u32,
    pub height: u32,
    pub sample_aspect: Rational,
    pub interlaced: bool,
    pub frame_rate: Option<FrameRate>,
}

/// A picture coming out of the codec
#[derive(Debug, Clone)]
pub struct DecodedPicture {
    pub width: u32,
    pub height: u32,
    pub sample_aspect: Rational,
    pub timestamps: FrameTimestamps,
    pub frame_rate: Option<FrameRate>,
    pub repeat_pict: u32,
    /// Codec-side frame payload, passed to the backend untouched
    pub data: Bytes,
}

impl DecodedPicture {
    pub fn new(width: u32, height: u32, timestamps: FrameTimestamps) -> Self {
        Self {
            width,
            height,
            sample_aspect: Rational::SQUARE,
            timestamps,
            frame_rate: None,
            repeat_pict: 0,
            data: Bytes::new(),
        }
    }
}

/// Result of one decode step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeStatus {
    /// At least one picture went to the sink
    Decoded,
    /// Stream has nothing left
    Empty,
    /// Nothing this time, try again
    Busy,
}

/// Codec side of a stream, driven by the display scheduler
pub trait VideoStream: Send {
    /// Decode the next input packet. May block briefly.
    fn decode_input(&mut self, sink: &mut PictureSink<'_>) -> DecodeStatus;

    /// Deliver already decoded pictures without blocking.
    fn poll_input(&mut self, sink: &mut PictureSink<'_>) -> DecodeStatus;
}

/// Stream whose pictures are submitted from another thread
#[derive(Debug, Default)]
pub struct ExternalStream;

impl VideoStream for ExternalStream {
    fn decode_input(&mut self, _sink: &mut PictureSink<'_>) -> DecodeStatus {
        DecodeStatus::Busy
    }

    fn poll_input(&mut self, _sink: &mut PictureSink<'_>) -> DecodeStatus {
        DecodeStatus::Busy
    }
}

// ============================================================================
// Shared Control
// ============================================================================

#[derive(Debug, Default)]
struct FrameCounters {
    decoded: AtomicU64,
    displayed: AtomicU64,
    duped: AtomicU64,
    dropped: AtomicU64,
    missed: AtomicU64,
    frame_processing_us: AtomicU64,
}

/// State readable and writable without the session lock
#[derive(Debug)]
pub struct StreamControl {
    id: DecoderId,
    filled: Arc<AtomicUsize>,
    trick: TrickPlay,
    closing: AtomicI32,
    start_counter: AtomicU32,
    closed: AtomicBool,
    frames: FrameCounters,
}

impl StreamControl {
    fn new(id: DecoderId, filled: Arc<AtomicUsize>) -> Self {
        Self {
            id,
            filled,
            trick: TrickPlay::default(),
            closing: AtomicI32::new(CLOSING_FRESH),
            start_counter: AtomicU32::new(0),
            closed: AtomicBool::new(false),
            frames: FrameCounters::default(),
        }
    }

    pub fn set_trick_speed(&self, speed: u32) {
        self.trick.set(speed);
        if speed != 0 {
            self.closing.store(0, Ordering::Relaxed);
        }
    }

    fn set_closing(&self) {
        self.closing.store(1, Ordering::Relaxed);
    }

    /// One empty decode poll while closing
    fn count_down_closing(&self) {
        let closing = self.closing.load(Ordering::Relaxed);
        if closing != 0 {
            let next = if closing == 1 { -1 } else { closing - 1 };
            self.closing.store(next, Ordering::Relaxed);
        }
    }

    fn closing_expired(&self) -> bool {
        self.closing.load(Ordering::Relaxed) < CLOSING_EXPIRED
    }

    fn bump(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Handle returned to the codec and playback controller
#[derive(Debug, Clone)]
pub struct DecoderHandle {
    control: Arc<StreamControl>,
}

impl DecoderHandle {
    pub fn id(&self) -> DecoderId {
        self.control.id
    }

    /// Ring occupancy, read without the lock
    pub fn filled(&self) -> usize {
        self.control.filled.load(Ordering::Acquire)
    }

    pub fn trick_speed(&self) -> u32 {
        self.control.trick.speed()
    }

    pub fn is_closed(&self) -> bool {
        self.control.closed.load(Ordering::Acquire)
    }

    pub(crate) fn control(&self) -> &StreamControl {
        &self.control
    }
}

/// Snapshot of a decoder's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DecoderStats {
    pub missed: u64,
    pub duped: u64,
    pub dropped: u64,
    pub decoded: u64,
    pub displayed: u64,
    pub frame_processing_time: Duration,
}

// ============================================================================
// Decoder Instance
// ============================================================================

/// Session-wide inputs a decoder needs while rendering
pub struct OutputContext<'a> {
    pub config: &'a VideoConfig,
    pub display: &'a DisplayInfo,
}

pub struct DecoderInstance {
    control: Arc<StreamControl>,
    pool: SurfacePool,
    ring: SurfaceRing,
    clock: ClockTracker,
    sync: SyncEngine,
    sync_on_audio: bool,
    interlaced: bool,
    frame_rate: Option<FrameRate>,
    surface_format: Option<SurfaceFormat>,
    surfaces_needed: usize,
    surfaces_created: bool,
    input: InputFormat,
    bucket: ResolutionBucket,
    video_rect: Rect,
    geometry: OutputGeometry,
}

impl DecoderInstance {
    pub fn new(id: DecoderId, sync_on_audio: bool, video_rect: Rect) -> Self {
        let ring = SurfaceRing::new();
        let control = Arc::new(StreamControl::new(id, ring.filled_handle()));
        Self {
            control,
            pool: SurfacePool::empty(),
            ring,
            clock: ClockTracker::new(),
            sync: SyncEngine::new(),
            sync_on_audio,
            interlaced: false,
            frame_rate: None,
            surface_format: None,
            surfaces_needed: SURFACES_NEEDED,
            surfaces_created: false,
            input: InputFormat::default(),
            bucket: ResolutionBucket::Sd576i,
            video_rect,
            geometry: OutputGeometry::default(),
        }
    }

    pub fn id(&self) -> DecoderId {
        self.control.id
    }

    pub fn handle(&self) -> DecoderHandle {
        DecoderHandle { control: self.control.clone() }
    }

    pub fn filled(&self) -> usize {
        self.ring.filled()
    }

    pub fn interlaced(&self) -> bool {
        self.interlaced
    }

    pub fn bucket(&self) -> ResolutionBucket {
        self.bucket
    }

    pub fn geometry(&self) -> OutputGeometry {
        self.geometry
    }

    pub fn video_size(&self) -> (u32, u32) {
        (self.input.width, self.input.height)
    }

    pub fn surface_for_display(&self) -> Option<SurfaceId> {
        self.ring.peek()
    }

    pub fn max_rejected_jump(&self) -> i64 {
        self.clock.max_rejected_jump()
    }

    pub fn stats(&self) -> DecoderStats {
        let f = &self.control.frames;
        DecoderStats {
            missed: f.missed.load(Ordering::Relaxed),
            duped: f.duped.load(Ordering::Relaxed),
            dropped: f.dropped.load(Ordering::Relaxed),
            decoded: f.decoded.load(Ordering::Relaxed),
            displayed: f.displayed.load(Ordering::Relaxed),
            frame_processing_time: Duration::from_micros(f.frame_processing_us.load(Ordering::Relaxed)),
        }
    }

    // ------------------------------------------------------------------------
    // Clock control
    // ------------------------------------------------------------------------

    /// Presentation clock corrected for what is still queued
    pub fn clock(&self) -> Option<Pts> {
        video_clock(self.clock.get(), self.ring.filled(), self.interlaced, self.ring.field_parity())
    }

    pub fn set_clock(&mut self, pts: Option<Pts>) {
        self.clock.set(pts);
    }

    pub fn set_closing(&mut self) {
        self.control.set_closing();
        self.clock.reset();
    }

    pub fn reset_start(&mut self) {
        self.control.start_counter.store(0, Ordering::Relaxed);
        self.clock.reset();
    }

    // ------------------------------------------------------------------------
    // Format negotiation and surfaces
    // ------------------------------------------------------------------------

    /// Pick the hardware format, then rebuild surfaces and geometry.
    pub fn negotiate(
        &mut self,
        backend: &mut dyn RenderBackend,
        format: &StreamFormat,
        candidates: &[PixelFormat],
        ctx: &OutputContext<'_>,
    ) -> Result<SurfaceFormat, VideoError> {
        tracing::debug!("decoder {}: pixel formats offered {:?}", self.id(), candidates);

        if !candidates.iter().any(PixelFormat::is_hardware) {
            tracing::error!("decoder {}: no hardware pixel format offered", self.id());
            return Err(VideoError::NoHardwareFormat(candidates.to_vec()));
        }

        let surface_format = if candidates.contains(&PixelFormat::P010) {
            SurfaceFormat::P016
        } else {
            SurfaceFormat::Nv12
        };

        self.cleanup(backend);
        self.surfaces_needed = SURFACES_NEEDED;
        self.surface_format = Some(surface_format);
        self.interlaced = format.interlaced;
        self.frame_rate = format.frame_rate;
        self.input = InputFormat {
            width: format.width,
            height: format.height,
            sample_aspect: format.sample_aspect,
        };
        self.setup_output(backend, ctx)?;

        tracing::debug!(
            "decoder {}: {}x{} {} {:?} surfaces",
            self.id(),
            format.width,
            format.height,
            if format.interlaced { "interlaced" } else { "progressive" },
            surface_format
        );
        Ok(surface_format)
    }

    /// Release every surface and reset per-stream state.
    pub fn cleanup(&mut self, backend: &mut dyn RenderBackend) {
        for surface in self.ring.drain() {
            self.pool.release(surface);
        }
        if self.pool.drain() > 0 || self.surfaces_created {
            backend.destroy_surfaces(self.id());
            self.surfaces_created = false;
        }

        let control = &self.control;
        control.frames.displayed.store(0, Ordering::Relaxed);
        control.start_counter.store(0, Ordering::Relaxed);
        control.closing.store(0, Ordering::Relaxed);
        self.clock.reset();
        self.sync.reset();
    }

    fn setup_output(&mut self, backend: &mut dyn RenderBackend, ctx: &OutputContext<'_>) -> Result<(), VideoError> {
        let Some(format) = self.surface_format else {
            return Ok(());
        };
        self.bucket = ResolutionBucket::classify(self.input.width, self.input.height);
        backend.create_surfaces(
            self.id(),
            self.surfaces_needed,
            self.input.width,
            self.input.height,
            format,
        )?;
        self.pool = SurfacePool::new(self.surfaces_needed);
        self.surfaces_created = true;
        self.update_output(ctx);
        Ok(())
    }

    /// Recompute crop and output rectangles.
    pub fn update_output(&mut self, ctx: &OutputContext<'_>) {
        self.geometry = compute_output(
            &self.input,
            self.video_rect,
            ctx.display,
            &ctx.config.zoom_modes(),
            ctx.config.cut_margins(self.bucket),
        );
        tracing::debug!(
            "decoder {}: {} bucket, crop {:?} output {:?}",
            self.id(),
            self.bucket.name(),
            self.geometry.crop,
            self.geometry.output
        );
    }

    pub fn set_video_rect(&mut self, rect: Rect, ctx: &OutputContext<'_>) {
        if rect != self.video_rect {
            self.video_rect = rect;
            self.update_output(ctx);
        }
    }

    // ------------------------------------------------------------------------
    // Decode side
    // ------------------------------------------------------------------------

    /// Queue one decoded picture for display.
    pub fn submit(
        &mut self,
        picture: DecodedPicture,
        backend: &mut dyn RenderBackend,
        audio: &dyn AudioClock,
        ctx: &OutputContext<'_>,
    ) {
        if picture.repeat_pict > 0 {
            tracing::debug!("decoder {}: repeated pict {} not handled", self.id(), picture.repeat_pict);
        }

        if !picture.sample_aspect.same_ratio(&self.input.sample_aspect) && picture.sample_aspect.is_valid() {
            tracing::debug!("decoder {}: aspect ratio changed", self.id());
            self.input.sample_aspect = picture.sample_aspect;
            self.update_output(ctx);
        }

        if self.surface_format.is_some()
            && (picture.width != self.input.width || picture.height != self.input.height)
        {
            tracing::debug!(
                "decoder {}: size changed {}x{} -> {}x{}",
                self.id(),
                self.input.width,
                self.input.height,
                picture.width,
                picture.height
            );
            self.cleanup(backend);
            self.input.width = picture.width;
            self.input.height = picture.height;
            if let Err(e) = self.setup_output(backend, ctx) {
                tracing::warn!("decoder {}: surface re-creation failed: {}", self.id(), e);
                self.drop_picture();
                return;
            }
        }

        if self.control.closing.load(Ordering::Relaxed) == 0 {
            let rate = picture.frame_rate.or(self.frame_rate);
            if let ClockUpdate::First(pts) = self.clock.update(picture.timestamps, self.interlaced, rate) {
                audio.video_ready(pts);
            }
        }

        if !self.surfaces_created {
            tracing::warn!("decoder {}: picture before format negotiation, dropped", self.id());
            self.drop_picture();
            return;
        }

        let Some(surface) = self.pool.allocate() else {
            tracing::warn!("decoder {}: no free surface, dropping frame", self.id());
            self.drop_picture();
            return;
        };

        if let Err(e) = backend.upload(self.id(), surface, &picture) {
            tracing::warn!("decoder {}: upload failed: {}", self.id(), e);
            self.pool.release(surface);
            self.drop_picture();
            return;
        }

        match self.ring.enqueue(surface) {
            Ok(()) => {
                StreamControl::bump(&self.control.frames.decoded);
            }
            Err(surface) => {
                self.pool.release(surface);
                let dropped = StreamControl::bump(&self.control.frames.dropped);
                tracing::warn!(
                    "decoder {}: output buffer full, dropping frame ({}/{})",
                    self.id(),
                    dropped,
                    self.control.frames.decoded.load(Ordering::Relaxed)
                );
            }
        }
    }

    fn drop_picture(&self) {
        StreamControl::bump(&self.control.frames.dropped);
    }

    /// The stream reported nothing to decode.
    pub fn input_empty(&self) {
        self.control.count_down_closing();
    }

    // ------------------------------------------------------------------------
    // Display side
    // ------------------------------------------------------------------------

    pub fn record_frame_processing(&self, elapsed: Duration) {
        self.control
            .frames
            .frame_processing_us
            .store(u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    fn black_allowed(&self, policy: BlackPicture) -> bool {
        if self.control.trick.is_active() {
            return false;
        }
        match policy {
            BlackPicture::Off => false,
            BlackPicture::AfterClose => self.control.closing_expired(),
            BlackPicture::Always => true,
        }
    }

    /// Draw this decoder's contribution to the current display frame.
    /// Returns `false` when the ring was starved and the tick skipped; a
    /// skipped decoder is not synced this tick.
    pub fn display(&mut self, backend: &mut dyn RenderBackend, ctx: &OutputContext<'_>) -> bool {
        let frames = &self.control.frames;
        let displayed = StreamControl::bump(&frames.displayed);
        self.control.start_counter.fetch_add(1, Ordering::Relaxed);

        if displayed % STATS_INTERVAL == 0 {
            let stats = self.stats();
            tracing::debug!(
                "decoder {}: {} missed, {} duped, {} dropped, {} decoded, {} displayed",
                self.id(),
                stats.missed,
                stats.duped,
                stats.dropped,
                stats.decoded,
                stats.displayed
            );
        }

        if self.ring.filled() < min_frames(self.interlaced) {
            StreamControl::bump(&frames.missed);
            if self.black_allowed(ctx.config.black_picture) {
                backend.draw_black(self.video_rect);
                tracing::trace!("decoder {}: black surface displayed", self.id());
            }
            return false;
        }

        if let Some(surface) = self.ring.peek() {
            backend.draw_surface(self.id(), surface, self.ring.field_parity(), &self.geometry);
        }
        true
    }

    /// Run the sync engine for this tick and apply its decision.
    pub fn sync(&mut self, audio: &dyn AudioClock, ctx: &OutputContext<'_>) -> SyncDecision {
        let control = &self.control;
        let inputs = SyncInputs {
            video_clock: self.clock(),
            audio_clock: if self.sync_on_audio { audio.clock() } else { None },
            audio_delay: ctx.config.audio_delay_ticks(),
            filled: self.ring.filled(),
            interlaced: self.interlaced,
            start_counter: control.start_counter.load(Ordering::Relaxed),
            frames_displayed: control.frames.displayed.load(Ordering::Relaxed),
            trick: &control.trick,
            sync_on_audio: self.sync_on_audio,
            soft_start: ctx.config.soft_start_sync,
            sixty_hz: ctx.config.sixty_hz_mode,
        };
        let decision = self.sync.decide(&inputs);

        match decision {
            SyncDecision::Show => self.advance(),
            SyncDecision::Duplicate => {
                StreamControl::bump(&self.control.frames.duped);
            }
            SyncDecision::Drop => {
                StreamControl::bump(&self.control.frames.dropped);
                self.advance();
                self.advance();
            }
            SyncDecision::Hold => {}
        }
        decision
    }

    fn advance(&mut self) {
        match self.ring.advance(self.interlaced) {
            Advance::Rotated(Some(surface)) => self.pool.release(surface),
            Advance::Rotated(None) | Advance::NextField => {}
            Advance::Starved => {
                StreamControl::bump(&self.control.frames.duped);
            }
        }
    }

    /// Final teardown: surfaces go back through the backend.
    pub fn close(&mut self, backend: &mut dyn RenderBackend) {
        self.control.closed.store(true, Ordering::Release);
        self.cleanup(backend);
        tracing::debug!("decoder {}: closed", self.id());
    }
}

/// What a `VideoStream` sees of its decoder during a decode step
pub struct PictureSink<'a> {
    pub(crate) decoder: &'a mut DecoderInstance,
    pub(crate) backend: &'a mut dyn RenderBackend,
    pub(crate) audio: &'a dyn AudioClock,
    pub(crate) ctx: OutputContext<'a>,
}

impl<'a> PictureSink<'a> {
    pub fn decoder_id(&self) -> DecoderId {
        self.decoder.id()
    }

    pub fn filled(&self) -> usize {
        self.decoder.filled()
    }

    pub fn negotiate(
        &mut self,
        format: &StreamFormat,
        candidates: &[PixelFormat],
    ) -> Result<SurfaceFormat, VideoError> {
        self.decoder.negotiate(self.backend, format, candidates, &self.ctx)
    }

    pub fn submit(&mut self, picture: DecodedPicture) {
        self.decoder.submit(picture, self.backend, self.audio, &self.ctx);
    }
}
