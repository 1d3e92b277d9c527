//! Audio/Video Synchronization
//!
//! Audio is the master clock. Once per display tick the video side compares
//! its own presentation clock against audio and decides whether to show the
//! next picture, repeat the current one, or skip ahead.

use crate::clock::{Pts, TICKS_PER_MS};
use crate::ring_buffer::min_frames;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};

/// Display ticks after a start reset during which video may only slow down
pub const SOFT_START_FRAMES: u32 = 100;

/// Display duration of one field (or progressive frame) at 50 Hz
pub const FIELD_PERIOD_MS: i64 = 20;

const SOFT_START_LEAD_MS: i64 = 120;
const DRIFT_LIMIT_MS: i64 = 5000;
const DUPE_URGENT_MS: i64 = 100;
const DUPE_MS: i64 = 55;
const DROP_MS: i64 = -25;
const PULLDOWN_MARGIN_MS: i64 = 25;
const PULLDOWN_PERIOD: u64 = 6;

const NO_PTS: i64 = i64::MIN;

// ============================================================================
// Audio Clock
// ============================================================================

/// The audio side as seen by video output
pub trait AudioClock: Send + Sync {
    /// Current audio presentation time, `None` while audio has no clock.
    fn clock(&self) -> Option<Pts>;

    /// The first picture after a stream start carries this timestamp.
    fn video_ready(&self, pts: Pts);
}

/// Audio clock updated from an audio callback
pub struct SharedAudioClock {
    pts: AtomicI64,
    sample_rate: u32,
    samples_played: AtomicU64,
    playing: AtomicBool,
    video_ready: AtomicI64,
}

impl SharedAudioClock {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            pts: AtomicI64::new(NO_PTS),
            sample_rate: sample_rate.max(1),
            samples_played: AtomicU64::new(0),
            playing: AtomicBool::new(false),
            video_ready: AtomicI64::new(NO_PTS),
        }
    }

    /// Rebase the clock on a new timestamp (or clear it).
    pub fn update(&self, pts: Option<Pts>) {
        self.pts.store(pts.map_or(NO_PTS, Pts::ticks), Ordering::SeqCst);
        self.samples_played.store(0, Ordering::SeqCst);
    }

    pub fn add_samples(&self, n: u64) {
        self.samples_played.fetch_add(n, Ordering::SeqCst);
    }

    pub fn set_playing(&self, playing: bool) {
        self.playing.store(playing, Ordering::SeqCst);
    }

    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    /// Timestamp last reported through `video_ready`
    pub fn video_ready_pts(&self) -> Option<Pts> {
        match self.video_ready.load(Ordering::SeqCst) {
            NO_PTS => None,
            ticks => Some(Pts(ticks)),
        }
    }
}

impl AudioClock for SharedAudioClock {
    fn clock(&self) -> Option<Pts> {
        let base = match self.pts.load(Ordering::SeqCst) {
            NO_PTS => return None,
            ticks => Pts(ticks),
        };
        if !self.is_playing() {
            return Some(base);
        }
        let samples = self.samples_played.load(Ordering::SeqCst);
        let ticks = (samples as i128 * 90_000 / self.sample_rate as i128) as i64;
        Some(base + ticks)
    }

    fn video_ready(&self, pts: Pts) {
        tracing::debug!("video ready at {}", pts);
        self.video_ready.store(pts.ticks(), Ordering::SeqCst);
    }
}

// ============================================================================
// Trick Play
// ============================================================================

/// Outcome of one trick-play step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrickStep {
    /// Normal speed
    Normal,
    /// Keep the current picture
    Hold,
    /// Counter expired, let one frame through
    Release,
}

/// Slow motion by showing each picture `speed` times. Written by the
/// controller, stepped by the display thread.
#[derive(Debug, Default)]
pub struct TrickPlay {
    speed: AtomicU32,
    counter: AtomicU32,
}

impl TrickPlay {
    pub fn set(&self, speed: u32) {
        self.speed.store(speed, Ordering::Relaxed);
        self.counter.store(speed, Ordering::Relaxed);
    }

    pub fn speed(&self) -> u32 {
        self.speed.load(Ordering::Relaxed)
    }

    pub fn is_active(&self) -> bool {
        self.speed() != 0
    }

    pub fn step(&self) -> TrickStep {
        let speed = self.speed();
        if speed == 0 {
            return TrickStep::Normal;
        }
        let remaining = self.counter.load(Ordering::Relaxed).saturating_sub(1);
        if remaining > 0 {
            self.counter.store(remaining, Ordering::Relaxed);
            TrickStep::Hold
        } else {
            self.counter.store(speed, Ordering::Relaxed);
            TrickStep::Release
        }
    }
}

// ============================================================================
// Sync Engine
// ============================================================================

/// What to do with the ring on this display tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDecision {
    /// Advance normally
    Show,
    /// Repeat the current picture, counted
    Duplicate,
    /// Skip a picture, counted
    Drop,
    /// Repeat the current picture, not counted
    Hold,
}

/// Presentation clock minus what is still queued for display
pub fn video_clock(pts: Option<Pts>, filled: usize, interlaced: bool, field_parity: u8) -> Option<Pts> {
    let periods = if interlaced {
        2 * filled as i64 - field_parity as i64
    } else {
        filled as i64
    };
    pts.map(|p| p - periods * FIELD_PERIOD_MS * TICKS_PER_MS)
}

/// Everything one decision looks at
pub struct SyncInputs<'a> {
    pub video_clock: Option<Pts>,
    pub audio_clock: Option<Pts>,
    /// 90 kHz ticks
    pub audio_delay: i64,
    pub filled: usize,
    pub interlaced: bool,
    pub start_counter: u32,
    pub frames_displayed: u64,
    pub trick: &'a TrickPlay,
    pub sync_on_audio: bool,
    pub soft_start: bool,
    pub sixty_hz: bool,
}

#[derive(Debug, Default)]
pub struct SyncEngine {
    last_diff: i64,
    hold: u32,
}

impl SyncEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        self.last_diff = 0;
        self.hold = 0;
    }

    /// Smoothed video minus audio, in ticks
    pub fn last_av_diff(&self) -> i64 {
        self.last_diff
    }

    pub fn decide(&mut self, input: &SyncInputs<'_>) -> SyncDecision {
        if !input.sync_on_audio {
            return SyncDecision::Show;
        }

        let ms = |v: i64| v * TICKS_PER_MS;

        if input.sixty_hz && input.frames_displayed % PULLDOWN_PERIOD == 0 {
            let (Some(audio), Some(video)) = (input.audio_clock, input.video_clock) else {
                return SyncDecision::Hold;
            };
            if audio + input.audio_delay <= video + ms(PULLDOWN_MARGIN_MS) {
                return SyncDecision::Hold;
            }
            if !input.trick.is_active() {
                return SyncDecision::Show;
            }
        }

        if input.trick.step() == TrickStep::Hold {
            return SyncDecision::Hold;
        }

        if input.soft_start && input.start_counter < SOFT_START_FRAMES {
            if let (Some(audio), Some(video)) = (input.audio_clock, input.video_clock) {
                if video > audio + input.audio_delay + ms(SOFT_START_LEAD_MS) {
                    tracing::trace!("soft start: video {} ahead of audio {}", video, audio);
                    return SyncDecision::Duplicate;
                }
            }
        }

        if self.hold > 0 {
            self.hold -= 1;
            return SyncDecision::Show;
        }

        let (Some(audio), Some(video)) = (input.audio_clock, input.video_clock) else {
            return SyncDecision::Show;
        };

        let diff = video - audio - input.audio_delay;
        self.last_diff = (self.last_diff + diff) / 2;
        let diff = self.last_diff;

        if diff.abs() > ms(DRIFT_LIMIT_MS) {
            tracing::warn!(
                "video {} audio {} differ by {} ms, too far to correct",
                video,
                audio,
                diff / TICKS_PER_MS
            );
            SyncDecision::Show
        } else if diff > ms(DUPE_URGENT_MS) {
            tracing::trace!("video {} ms ahead, duplicating", diff / TICKS_PER_MS);
            self.hold = 1;
            SyncDecision::Duplicate
        } else if diff > ms(DUPE_MS) {
            self.hold = 1;
            SyncDecision::Duplicate
        } else if diff < ms(DROP_MS) && input.filled > min_frames(input.interlaced) + 2 {
            tracing::trace!("video {} ms behind, dropping", -diff / TICKS_PER_MS);
            self.hold = 1;
            SyncDecision::Drop
        } else {
            SyncDecision::Show
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(trick: &TrickPlay, video_ms: i64, audio_ms: i64) -> SyncInputs<'_> {
        SyncInputs {
            video_clock: Some(Pts::from_ms(video_ms)),
            audio_clock: Some(Pts::from_ms(audio_ms)),
            audio_delay: 0,
            filled: 6,
            interlaced: false,
            start_counter: SOFT_START_FRAMES,
            frames_displayed: 1,
            trick,
            sync_on_audio: true,
            soft_start: true,
            sixty_hz: false,
        }
    }

    #[test]
    fn test_audio_clock() {
        let clock = SharedAudioClock::new(48_000);
        assert_eq!(clock.clock(), None);

        clock.update(Some(Pts::from_ms(1000)));
        clock.add_samples(4800);
        // paused: samples not counted
        assert_eq!(clock.clock(), Some(Pts::from_ms(1000)));

        clock.set_playing(true);
        assert_eq!(clock.clock(), Some(Pts::from_ms(1100)));

        clock.update(None);
        assert_eq!(clock.clock(), None);
    }

    #[test]
    fn test_video_ready_recorded() {
        let clock = SharedAudioClock::new(48_000);
        assert_eq!(clock.video_ready_pts(), None);
        clock.video_ready(Pts::from_ms(40));
        assert_eq!(clock.video_ready_pts(), Some(Pts::from_ms(40)));
    }

    #[test]
    fn test_video_clock_latency() {
        let pts = Some(Pts::from_ms(1000));
        assert_eq!(video_clock(pts, 4, false, 0), Some(Pts::from_ms(920)));
        assert_eq!(video_clock(pts, 4, true, 0), Some(Pts::from_ms(840)));
        assert_eq!(video_clock(pts, 4, true, 1), Some(Pts::from_ms(860)));
        assert_eq!(video_clock(None, 4, true, 1), None);
    }

    #[test]
    fn test_in_sync_always_shows() {
        let trick = TrickPlay::default();
        let mut engine = SyncEngine::new();
        for _ in 0..500 {
            assert_eq!(engine.decide(&inputs(&trick, 5000, 5000)), SyncDecision::Show);
        }
    }

    #[test]
    fn test_video_ahead_duplicates() {
        let trick = TrickPlay::default();
        let mut engine = SyncEngine::new();
        let dupes = (0..10)
            .map(|_| engine.decide(&inputs(&trick, 1150, 1000)))
            .filter(|d| *d == SyncDecision::Duplicate)
            .count();
        assert!(dupes >= 5, "only {} duplicates", dupes);
    }

    #[test]
    fn test_video_behind_drops() {
        let trick = TrickPlay::default();
        let mut engine = SyncEngine::new();
        let decisions: Vec<_> = (0..6)
            .map(|_| engine.decide(&inputs(&trick, 1000, 1100)))
            .collect();
        assert!(decisions.contains(&SyncDecision::Drop));

        // not enough buffered to drop
        let mut engine = SyncEngine::new();
        for _ in 0..6 {
            let mut input = inputs(&trick, 1000, 1100);
            input.filled = 3;
            assert_ne!(engine.decide(&input), SyncDecision::Drop);
        }
    }

    #[test]
    fn test_drift_beyond_limit_shows() {
        let trick = TrickPlay::default();
        let mut engine = SyncEngine::new();
        // 29 s apart
        engine.decide(&inputs(&trick, 30_000, 1000));
        assert_eq!(engine.decide(&inputs(&trick, 30_000, 1000)), SyncDecision::Show);
        assert!(engine.last_av_diff() > Pts::from_ms(5000).ticks());
    }

    #[test]
    fn test_soft_start_duplicates_without_hold() {
        let trick = TrickPlay::default();
        let mut engine = SyncEngine::new();
        let mut input = inputs(&trick, 1200, 1000);
        input.start_counter = 3;
        assert_eq!(engine.decide(&input), SyncDecision::Duplicate);
        assert_eq!(engine.decide(&input), SyncDecision::Duplicate);
        assert_eq!(engine.last_av_diff(), 0);
    }

    #[test]
    fn test_trick_speed_holds() {
        let trick = TrickPlay::default();
        trick.set(3);
        let mut engine = SyncEngine::new();
        let decisions: Vec<_> = (0..6)
            .map(|_| engine.decide(&inputs(&trick, 1000, 1000)))
            .collect();
        use SyncDecision::*;
        assert_eq!(decisions, vec![Hold, Hold, Show, Hold, Hold, Show]);
    }

    #[test]
    fn test_secondary_stream_ignores_audio() {
        let trick = TrickPlay::default();
        let mut engine = SyncEngine::new();
        let mut input = inputs(&trick, 9000, 1000);
        input.sync_on_audio = false;
        assert_eq!(engine.decide(&input), SyncDecision::Show);
    }

    #[test]
    fn test_sixty_hz_pulldown() {
        let trick = TrickPlay::default();
        let mut engine = SyncEngine::new();

        let mut input = inputs(&trick, 1000, 1000);
        input.sixty_hz = true;
        input.frames_displayed = 12;
        assert_eq!(engine.decide(&input), SyncDecision::Hold);

        // audio well ahead: no repeat
        let mut input = inputs(&trick, 1000, 1030);
        input.sixty_hz = true;
        input.frames_displayed = 12;
        assert_eq!(engine.decide(&input), SyncDecision::Show);

        let mut input = inputs(&trick, 1000, 1000);
        input.sixty_hz = true;
        input.frames_displayed = 6;
        input.audio_clock = None;
        assert_eq!(engine.decide(&input), SyncDecision::Hold);
    }
}
