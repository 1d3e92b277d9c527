//! # framepace core
//!
//! GPU surface pacing for real-time video output: a bounded surface pool
//! per decoder, a display ring between decode and vsync, and an
//! audio-mastered sync engine deciding per tick whether to show, repeat
//! or skip a picture.

// ============================================================================
// Timing
// ============================================================================
pub mod clock;
pub mod sync;

// ============================================================================
// Surfaces
// ============================================================================
pub mod surface_pool;
pub mod ring_buffer;

// ============================================================================
// Output
// ============================================================================
pub mod config;
pub mod geometry;
pub mod decoder;
pub mod render;
pub mod output;
pub mod scheduler;

pub use clock::{FrameRate, FrameTimestamps, Pts};
pub use config::{BlackPicture, ResolutionBucket, VideoConfig};
pub use decoder::{
    DecodeStatus, DecodedPicture, DecoderHandle, DecoderStats, PictureSink, PixelFormat,
    StreamFormat, SurfaceFormat, VideoError, VideoStream,
};
pub use output::{PassOutcome, VideoOutput};
pub use render::{RenderBackend, RenderError, VideoModule};
pub use scheduler::DisplayScheduler;
pub use sync::{AudioClock, SharedAudioClock, SyncDecision};

// ============================================================================
// Version
// ============================================================================
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
