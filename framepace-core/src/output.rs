//! # Video Output Session
//!
//! Owns every decoder instance, the selected output module and the
//! configuration behind one lock. Codec threads, the playback controller
//! and the display scheduler all go through this type.

use crate::clock::Pts;
use crate::config::{VideoConfig, WindowGeometry};
use crate::decoder::{
    DecodedPicture, DecoderHandle, DecoderId, DecoderInstance, DecoderStats, DecodeStatus,
    OutputContext, PictureSink, PixelFormat, StreamFormat, SurfaceFormat, VideoError, VideoStream,
};
use crate::geometry::{DisplayInfo, OutputGeometry, Rect, ZoomMode};
use crate::render::VideoModule;
use crate::surface_pool::SurfaceId;
use crate::sync::AudioClock;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Concurrent decoder instances
pub const MAX_DECODERS: usize = 2;
/// Below this many queued frames a pass decodes instead of polling
const DECODE_LOW_WATER: usize = 5;
/// A pass this soon after the last frame only decodes
const CATCH_UP_WINDOW: Duration = Duration::from_millis(15);
const IDLE_SLEEP: Duration = Duration::from_micros(100);
const NOOP_SLEEP: Duration = Duration::from_millis(20);

/// What one display pass ended with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassOutcome {
    /// A frame was presented
    Displayed,
    /// Decoded ahead, display deferred
    CatchUp,
    /// No-op module, nothing to do
    Idle,
}

struct DecoderSlot {
    stream: Box<dyn VideoStream>,
    decoder: DecoderInstance,
}

struct SessionState {
    config: VideoConfig,
    display: DisplayInfo,
    window: WindowGeometry,
    module: VideoModule,
    slots: Vec<DecoderSlot>,
    last_pass: Option<Instant>,
    frame_time: Option<Instant>,
}

impl SessionState {
    fn slot_mut(&mut self, id: DecoderId) -> Result<(&mut DecoderInstance, OutputContext<'_>), VideoError> {
        let ctx = OutputContext { config: &self.config, display: &self.display };
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.decoder.id() == id)
            .ok_or(VideoError::UnknownDecoder(id))?;
        Ok((&mut slot.decoder, ctx))
    }

    fn decoder(&self, id: DecoderId) -> Result<&DecoderInstance, VideoError> {
        self.slots
            .iter()
            .map(|s| &s.decoder)
            .find(|d| d.id() == id)
            .ok_or(VideoError::UnknownDecoder(id))
    }

    fn window_rect(&self) -> Rect {
        Rect::new(0, 0, self.window.width as i32, self.window.height as i32)
    }

    fn update_all_outputs(&mut self) {
        let ctx = OutputContext { config: &self.config, display: &self.display };
        for slot in &mut self.slots {
            slot.decoder.update_output(&ctx);
        }
    }
}

pub struct VideoOutput {
    state: Mutex<SessionState>,
    audio: Arc<dyn AudioClock>,
    next_id: AtomicU32,
}

impl VideoOutput {
    /// Start a session. The window geometry comes from the config string
    /// when it parses, defaults otherwise.
    pub fn new(config: VideoConfig, module: VideoModule, audio: Arc<dyn AudioClock>) -> Self {
        let window = config.window_geometry().unwrap_or_else(|e| {
            tracing::warn!("{}, using default window", e);
            WindowGeometry::default()
        });
        tracing::info!(
            "video output '{}' {}x{}+{}+{}",
            module.name(),
            window.width,
            window.height,
            window.x,
            window.y
        );
        Self {
            state: Mutex::new(SessionState {
                config,
                display: DisplayInfo::default(),
                window,
                module,
                slots: Vec::with_capacity(MAX_DECODERS),
                last_pass: None,
                frame_time: None,
            }),
            audio,
            next_id: AtomicU32::new(0),
        }
    }

    pub fn module_name(&self) -> String {
        self.state.lock().module.name().to_string()
    }

    pub fn decoder_count(&self) -> usize {
        self.state.lock().slots.len()
    }

    pub fn config(&self) -> VideoConfig {
        self.state.lock().config.clone()
    }

    /// Replace the configuration and recompute every output rectangle.
    pub fn set_config(&self, config: VideoConfig) {
        let mut state = self.state.lock();
        state.config = config;
        state.update_all_outputs();
    }

    pub fn set_display_info(&self, display: DisplayInfo) {
        let mut state = self.state.lock();
        state.display = display;
        state.update_all_outputs();
    }

    /// Apply a display-format code to both zoom modes.
    pub fn set_display_format(&self, code: i32) {
        let mut state = self.state.lock();
        state.config.zoom_4_3 = ZoomMode::from_display_format(code, state.config.zoom_4_3);
        state.config.zoom_other = ZoomMode::from_display_format(code, state.config.zoom_other);
        state.update_all_outputs();
    }

    pub fn set_audio_delay(&self, ms: i32) {
        self.state.lock().config.audio_delay_ms = ms;
    }

    pub fn window(&self) -> WindowGeometry {
        self.state.lock().window
    }

    // ========================================================================
    // Codec side
    // ========================================================================

    pub fn new_decoder(&self, stream: Box<dyn VideoStream>) -> Result<DecoderHandle, VideoError> {
        let mut state = self.state.lock();
        if state.module.is_noop() {
            return Err(VideoError::NoModule);
        }
        if state.slots.len() >= MAX_DECODERS {
            tracing::error!("out of decoders");
            return Err(VideoError::OutOfDecoders(MAX_DECODERS));
        }

        let id = DecoderId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let sync_on_audio = state.slots.is_empty();
        let decoder = DecoderInstance::new(id, sync_on_audio, state.window_rect());
        let handle = decoder.handle();
        state.slots.push(DecoderSlot { stream, decoder });
        tracing::debug!("decoder {} created, sync on audio: {}", id, sync_on_audio);
        Ok(handle)
    }

    /// Tear down a decoder. Safe from any thread while the scheduler runs.
    pub fn delete_decoder(&self, handle: &DecoderHandle) -> Result<(), VideoError> {
        let mut state = self.state.lock();
        let id = handle.id();
        let index = state
            .slots
            .iter()
            .position(|s| s.decoder.id() == id)
            .ok_or(VideoError::UnknownDecoder(id))?;
        let mut slot = state.slots.remove(index);
        match state.module.backend_mut() {
            Some(backend) => slot.decoder.close(backend),
            None => tracing::warn!("decoder {} deleted without a backend", id),
        }
        Ok(())
    }

    pub fn negotiate_pixel_format(
        &self,
        handle: &DecoderHandle,
        format: &StreamFormat,
        candidates: &[PixelFormat],
    ) -> Result<SurfaceFormat, VideoError> {
        let mut state = self.state.lock();
        let SessionState { config, display, module, slots, .. } = &mut *state;
        let backend = module.backend_mut().ok_or(VideoError::NoModule)?;
        let slot = find_slot(slots, handle.id())?;
        let ctx = OutputContext { config, display };
        slot.decoder.negotiate(backend, format, candidates, &ctx)
    }

    pub fn submit_picture(&self, handle: &DecoderHandle, picture: DecodedPicture) -> Result<(), VideoError> {
        let mut state = self.state.lock();
        let SessionState { config, display, module, slots, .. } = &mut *state;
        let backend = module.backend_mut().ok_or(VideoError::NoModule)?;
        let slot = find_slot(slots, handle.id())?;
        let ctx = OutputContext { config, display };
        slot.decoder.submit(picture, backend, &*self.audio, &ctx);
        Ok(())
    }

    // ========================================================================
    // Renderer side
    // ========================================================================

    pub fn surface_for_display(&self, handle: &DecoderHandle) -> Result<Option<SurfaceId>, VideoError> {
        Ok(self.state.lock().decoder(handle.id())?.surface_for_display())
    }

    pub fn output_geometry(&self, handle: &DecoderHandle) -> Result<OutputGeometry, VideoError> {
        Ok(self.state.lock().decoder(handle.id())?.geometry())
    }

    /// The output window was resized.
    pub fn notify_geometry_changed(&self, width: u32, height: u32) {
        let mut state = self.state.lock();
        state.window.width = width;
        state.window.height = height;
        if let Some(backend) = state.module.backend_mut() {
            backend.resize(width, height);
        }
        let rect = state.window_rect();
        let SessionState { config, display, slots, .. } = &mut *state;
        let ctx = OutputContext { config, display };
        for slot in slots.iter_mut() {
            slot.decoder.set_video_rect(rect, &ctx);
        }
    }

    /// Place one decoder's picture inside the window; an empty rect means
    /// the whole window.
    pub fn set_output_position(&self, handle: &DecoderHandle, rect: Rect) -> Result<(), VideoError> {
        let mut state = self.state.lock();
        let rect = if rect.is_empty() { state.window_rect() } else { rect };
        let (decoder, ctx) = state.slot_mut(handle.id())?;
        decoder.set_video_rect(rect, &ctx);
        Ok(())
    }

    // ========================================================================
    // Playback controller
    // ========================================================================

    pub fn set_clock(&self, handle: &DecoderHandle, pts: Option<Pts>) -> Result<(), VideoError> {
        let mut state = self.state.lock();
        let (decoder, _) = state.slot_mut(handle.id())?;
        decoder.set_clock(pts);
        Ok(())
    }

    pub fn clock(&self, handle: &DecoderHandle) -> Result<Option<Pts>, VideoError> {
        Ok(self.state.lock().decoder(handle.id())?.clock())
    }

    /// Lock-free; takes effect on the next display tick.
    pub fn set_trick_speed(&self, handle: &DecoderHandle, speed: u32) -> Result<(), VideoError> {
        if handle.is_closed() {
            return Err(VideoError::UnknownDecoder(handle.id()));
        }
        handle.control().set_trick_speed(speed);
        Ok(())
    }

    pub fn set_closing(&self, handle: &DecoderHandle) -> Result<(), VideoError> {
        let mut state = self.state.lock();
        let (decoder, _) = state.slot_mut(handle.id())?;
        decoder.set_closing();
        Ok(())
    }

    pub fn reset_start(&self, handle: &DecoderHandle) -> Result<(), VideoError> {
        let mut state = self.state.lock();
        let (decoder, _) = state.slot_mut(handle.id())?;
        decoder.reset_start();
        Ok(())
    }

    pub fn stats(&self, handle: &DecoderHandle) -> Result<DecoderStats, VideoError> {
        Ok(self.state.lock().decoder(handle.id())?.stats())
    }

    pub fn video_size(&self, handle: &DecoderHandle) -> Result<(u32, u32), VideoError> {
        Ok(self.state.lock().decoder(handle.id())?.video_size())
    }

    // ========================================================================
    // Display pass
    // ========================================================================

    /// One iteration of the display loop: decode, then display and sync
    /// unless the decoders are still catching up.
    pub fn display_pass(&self) -> PassOutcome {
        let decoded;
        let all_full;
        let frame_time;
        {
            let mut state = self.state.lock();
            let SessionState { config, display, module, slots, frame_time: last_frame, .. } = &mut *state;
            let Some(backend) = module.backend_mut() else {
                drop(state);
                std::thread::sleep(NOOP_SLEEP);
                return PassOutcome::Idle;
            };

            let mut any_decoded = false;
            let mut full = true;
            for slot in slots.iter_mut() {
                let filled = slot.decoder.filled();
                let mut sink = PictureSink {
                    decoder: &mut slot.decoder,
                    backend: &mut *backend,
                    audio: &*self.audio,
                    ctx: OutputContext { config, display },
                };
                let status = if filled < DECODE_LOW_WATER {
                    full = false;
                    slot.stream.decode_input(&mut sink)
                } else {
                    slot.stream.poll_input(&mut sink)
                };
                match status {
                    DecodeStatus::Decoded => any_decoded = true,
                    DecodeStatus::Empty => slot.decoder.input_empty(),
                    DecodeStatus::Busy => {}
                }
            }
            decoded = any_decoded;
            all_full = full;
            frame_time = *last_frame;
        }

        if !decoded {
            std::thread::sleep(IDLE_SLEEP);
        }

        if !all_full {
            if let Some(t) = frame_time {
                if t.elapsed() < CATCH_UP_WINDOW {
                    return PassOutcome::CatchUp;
                }
            }
        }

        let mut state = self.state.lock();
        let SessionState { config, display, module, slots, last_pass, frame_time, .. } = &mut *state;
        let Some(backend) = module.backend_mut() else {
            return PassOutcome::Idle;
        };
        let ctx = OutputContext { config, display };

        let processing = last_pass.map(|t| t.elapsed()).unwrap_or_default();
        if let Err(e) = backend.wait_for_vsync() {
            tracing::warn!("vsync: {}", e);
        }
        *last_pass = Some(Instant::now());

        backend.clear();
        let mut eligible = [false; MAX_DECODERS];
        for (slot, shown) in slots.iter_mut().zip(eligible.iter_mut()) {
            slot.decoder.record_frame_processing(processing);
            *shown = slot.decoder.display(backend, &ctx);
        }
        if let Err(e) = backend.present() {
            tracing::warn!("present: {}", e);
        }
        *frame_time = Some(Instant::now());

        for (slot, _) in slots.iter_mut().zip(eligible).filter(|(_, shown)| *shown) {
            let decision = slot.decoder.sync(&*self.audio, &ctx);
            tracing::trace!("decoder {}: {:?}", slot.decoder.id(), decision);
        }

        PassOutcome::Displayed
    }
}

fn find_slot(slots: &mut [DecoderSlot], id: DecoderId) -> Result<&mut DecoderSlot, VideoError> {
    slots
        .iter_mut()
        .find(|s| s.decoder.id() == id)
        .ok_or(VideoError::UnknownDecoder(id))
}
