//! Presentation Clock
//!
//! 90 kHz timestamps and the tracker that turns raw per-frame decoder
//! timestamps into a presentation clock the sync engine can trust.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};

/// Ticks per millisecond of the 90 kHz transport clock
pub const TICKS_PER_MS: i64 = 90;

/// Delta window (exclusive low, inclusive high) in which a backwards step
/// is treated as jitter and ignored.
const JITTER_LOW_MS: i64 = -600;
const JITTER_HIGH_MS: i64 = -40;
/// Jumps beyond this are logged as a discontinuity
const DISCONTINUITY_MS: i64 = -JITTER_LOW_MS;

// ============================================================================
// Pts
// ============================================================================

/// Presentation timestamp in 90 kHz ticks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Pts(pub i64);

impl Pts {
    pub const ZERO: Pts = Pts(0);

    pub const fn from_ms(ms: i64) -> Self {
        Pts(ms * TICKS_PER_MS)
    }

    pub const fn ticks(self) -> i64 {
        self.0
    }

    pub const fn as_ms(self) -> i64 {
        self.0 / TICKS_PER_MS
    }
}

impl Add<i64> for Pts {
    type Output = Pts;
    fn add(self, ticks: i64) -> Pts {
        Pts(self.0 + ticks)
    }
}

impl Sub<i64> for Pts {
    type Output = Pts;
    fn sub(self, ticks: i64) -> Pts {
        Pts(self.0 - ticks)
    }
}

impl Sub for Pts {
    type Output = i64;
    fn sub(self, other: Pts) -> i64 {
        self.0 - other.0
    }
}

/// `H:MM:SS.mmm`, with a leading `-` for negative values
impl fmt::Display for Pts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let ms = self.0.unsigned_abs() / TICKS_PER_MS as u64;
        let secs = ms / 1000;
        write!(
            f,
            "{}{}:{:02}:{:02}.{:03}",
            sign,
            secs / 3600,
            (secs / 60) % 60,
            secs % 60,
            ms % 1000
        )
    }
}

// ============================================================================
// Frame Timing
// ============================================================================

/// Nominal stream frame rate as a fraction (e.g. 25/1, 30000/1001)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRate {
    pub num: u32,
    pub den: u32,
}

impl FrameRate {
    pub const fn new(num: u32, den: u32) -> Self {
        Self { num, den }
    }

    /// Whole milliseconds per frame, `None` for a degenerate rate
    pub fn frame_duration_ms(&self) -> Option<i64> {
        if self.num == 0 || self.den == 0 {
            return None;
        }
        Some(1000 * self.den as i64 / self.num as i64)
    }
}

/// Raw timestamps attached to one decoded picture
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameTimestamps {
    pub pts: Option<Pts>,
    pub dts: Option<Pts>,
}

impl FrameTimestamps {
    pub fn from_pts(pts: Pts) -> Self {
        Self { pts: Some(pts), dts: None }
    }

    /// PTS if present and non-zero, else DTS under the same rule
    pub fn best(&self) -> Option<Pts> {
        self.pts
            .filter(|p| p.0 != 0)
            .or_else(|| self.dts.filter(|d| d.0 != 0))
    }
}

/// Per-frame fallback duration when the stream carries no usable rate
pub fn default_frame_duration_ms(interlaced: bool) -> i64 {
    if interlaced {
        40
    } else {
        20
    }
}

// ============================================================================
// Clock Tracker
// ============================================================================

/// What a single `ClockTracker::update` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockUpdate {
    /// First valid sample after a reset. Report as video ready.
    First(Pts),
    /// No raw sample, or the sample matched the prediction
    Predicted,
    /// Sample differed from the prediction and was adopted
    Corrected { delta: i64 },
    /// Backwards jitter, ignored
    Rejected { delta: i64 },
}

/// Tracks the presentation clock of one stream
#[derive(Debug, Default)]
pub struct ClockTracker {
    pts: Option<Pts>,
    max_rejected: i64,
}

impl ClockTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Pts> {
        self.pts
    }

    /// Explicit reset; the next sample is treated as a stream start.
    pub fn reset(&mut self) {
        self.pts = None;
    }

    pub fn set(&mut self, pts: Option<Pts>) {
        self.pts = pts;
    }

    /// Largest backwards jump ignored so far, in ticks
    pub fn max_rejected_jump(&self) -> i64 {
        self.max_rejected
    }

    /// Feed one decoded picture's timestamps.
    pub fn update(
        &mut self,
        raw: FrameTimestamps,
        interlaced: bool,
        rate: Option<FrameRate>,
    ) -> ClockUpdate {
        let duration_ms = rate
            .and_then(|r| r.frame_duration_ms())
            .unwrap_or_else(|| default_frame_duration_ms(interlaced));

        if let Some(pts) = self.pts.as_mut() {
            *pts = *pts + duration_ms * TICKS_PER_MS;
        }

        let Some(sample) = raw.best() else {
            return ClockUpdate::Predicted;
        };

        let Some(current) = self.pts else {
            self.pts = Some(sample);
            tracing::debug!("video clock started at {}", sample);
            return ClockUpdate::First(sample);
        };

        let delta = sample - current;
        if delta > JITTER_LOW_MS * TICKS_PER_MS && delta <= JITTER_HIGH_MS * TICKS_PER_MS {
            if -delta > self.max_rejected {
                self.max_rejected = -delta;
                tracing::debug!("pts jitter {} ms ignored", delta / TICKS_PER_MS);
            }
            return ClockUpdate::Rejected { delta };
        }

        if delta == 0 {
            return ClockUpdate::Predicted;
        }

        if delta.abs() > DISCONTINUITY_MS * TICKS_PER_MS {
            tracing::debug!("pts discontinuity of {} ms, following new timeline", delta / TICKS_PER_MS);
        } else {
            tracing::trace!("pts corrected by {} ms", delta / TICKS_PER_MS);
        }
        self.pts = Some(sample);
        ClockUpdate::Corrected { delta }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAL: Option<FrameRate> = Some(FrameRate::new(25, 1));

    #[test]
    fn test_pts_display() {
        assert_eq!(Pts::from_ms(3_723_004).to_string(), "1:02:03.004");
        assert_eq!(Pts::from_ms(-1500).to_string(), "-0:00:01.500");
    }

    #[test]
    fn test_best_timestamp() {
        let ts = FrameTimestamps { pts: Some(Pts(0)), dts: Some(Pts(900)) };
        assert_eq!(ts.best(), Some(Pts(900)));
        let ts = FrameTimestamps { pts: None, dts: Some(Pts(0)) };
        assert_eq!(ts.best(), None);
        assert_eq!(FrameTimestamps::from_pts(Pts(5)).best(), Some(Pts(5)));
    }

    #[test]
    fn test_frame_duration() {
        assert_eq!(FrameRate::new(25, 1).frame_duration_ms(), Some(40));
        assert_eq!(FrameRate::new(30000, 1001).frame_duration_ms(), Some(33));
        assert_eq!(FrameRate::new(0, 1).frame_duration_ms(), None);
    }

    #[test]
    fn test_first_sample_after_reset() {
        let mut clock = ClockTracker::new();
        let update = clock.update(FrameTimestamps::from_pts(Pts::from_ms(1000)), true, PAL);
        assert_eq!(update, ClockUpdate::First(Pts::from_ms(1000)));

        clock.reset();
        assert_eq!(clock.get(), None);
        let update = clock.update(FrameTimestamps::from_pts(Pts::from_ms(5000)), true, PAL);
        assert_eq!(update, ClockUpdate::First(Pts::from_ms(5000)));
    }

    #[test]
    fn test_monotonic_input_is_monotonic() {
        let mut clock = ClockTracker::new();
        let mut last = None;
        // 20 ms prediction against 40 ms samples forces corrections
        for i in 1..200 {
            clock.update(FrameTimestamps::from_pts(Pts::from_ms(i * 40)), false, None);
            let now = clock.get();
            assert!(now >= last);
            last = now;
        }
        assert_eq!(last, Some(Pts::from_ms(199 * 40)));
    }

    #[test]
    fn test_jitter_rejected() {
        let mut clock = ClockTracker::new();
        for i in 1..=3 {
            clock.update(FrameTimestamps::from_pts(Pts::from_ms(i * 40)), true, PAL);
        }
        assert_eq!(clock.get(), Some(Pts::from_ms(120)));

        // 160 predicted, 110 received
        let update = clock.update(FrameTimestamps::from_pts(Pts::from_ms(110)), true, PAL);
        assert_eq!(update, ClockUpdate::Rejected { delta: Pts::from_ms(-50).ticks() });
        assert_eq!(clock.get(), Some(Pts::from_ms(160)));
        assert_eq!(clock.max_rejected_jump(), Pts::from_ms(50).ticks());

        // trend resumes
        let update = clock.update(FrameTimestamps::from_pts(Pts::from_ms(200)), true, PAL);
        assert_eq!(update, ClockUpdate::Predicted);
        assert_eq!(clock.get(), Some(Pts::from_ms(200)));
    }

    #[test]
    fn test_missing_timestamp_predicts() {
        let mut clock = ClockTracker::new();
        clock.update(FrameTimestamps::from_pts(Pts::from_ms(40)), true, None);
        let update = clock.update(FrameTimestamps::default(), true, None);
        assert_eq!(update, ClockUpdate::Predicted);
        assert_eq!(clock.get(), Some(Pts::from_ms(80)));
    }

    #[test]
    fn test_backwards_discontinuity_follows_new_timeline() {
        let mut clock = ClockTracker::new();
        clock.update(FrameTimestamps::from_pts(Pts::from_ms(10_000)), false, PAL);

        // channel switch without a reset: 10040 predicted, 1000 received
        let update = clock.update(FrameTimestamps::from_pts(Pts::from_ms(1_000)), false, PAL);
        assert_eq!(update, ClockUpdate::Corrected { delta: Pts::from_ms(-9_040).ticks() });
        assert_eq!(clock.get(), Some(Pts::from_ms(1_000)));

        for i in 1..50 {
            let update = clock.update(FrameTimestamps::from_pts(Pts::from_ms(1_000 + 40 * i)), false, PAL);
            assert_eq!(update, ClockUpdate::Predicted);
        }
        assert_eq!(clock.get(), Some(Pts::from_ms(2_960)));

        // prediction keeps advancing without samples
        clock.update(FrameTimestamps::default(), false, PAL);
        assert_eq!(clock.get(), Some(Pts::from_ms(3_000)));
    }
}
