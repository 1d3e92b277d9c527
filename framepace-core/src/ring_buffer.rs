//! Surface Ring Buffer
//!
//! Hands decoded surfaces from the decode side to the display side. All
//! mutation happens under the session lock; the occupancy counter is
//! shared so it can be read without it.

use crate::surface_pool::SurfaceId;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Depth of the display queue
pub const VIDEO_SURFACES_MAX: usize = 8;

/// Frames that must stay queued before the display may move on
pub const fn min_frames(interlaced: bool) -> usize {
    1 + 2 * interlaced as usize
}

/// Outcome of one display tick's `advance`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Switched to the second field of the current frame
    NextField,
    /// Moved to the next frame; the surface that left the display
    Rotated(Option<SurfaceId>),
    /// Not enough frames queued, the current picture stays
    Starved,
}

#[derive(Debug)]
pub struct SurfaceRing {
    slots: [Option<SurfaceId>; VIDEO_SURFACES_MAX],
    read: usize,
    write: usize,
    filled: Arc<AtomicUsize>,
    field: u8,
}

impl Default for SurfaceRing {
    fn default() -> Self {
        Self::new()
    }
}

impl SurfaceRing {
    pub fn new() -> Self {
        Self {
            slots: [None; VIDEO_SURFACES_MAX],
            read: 0,
            write: 0,
            filled: Arc::new(AtomicUsize::new(0)),
            field: 0,
        }
    }

    /// Shared occupancy counter
    pub fn filled_handle(&self) -> Arc<AtomicUsize> {
        self.filled.clone()
    }

    pub fn filled(&self) -> usize {
        self.filled.load(Ordering::Acquire)
    }

    /// 0 while the first field of the head frame is on screen
    pub fn field_parity(&self) -> u8 {
        self.field
    }

    /// Queue a surface for display. A full ring hands it back.
    pub fn enqueue(&mut self, id: SurfaceId) -> Result<(), SurfaceId> {
        if self.filled() >= VIDEO_SURFACES_MAX {
            return Err(id);
        }
        debug_assert!(self.slots[self.write].is_none());
        self.slots[self.write] = Some(id);
        self.write = (self.write + 1) % VIDEO_SURFACES_MAX;
        self.filled.fetch_add(1, Ordering::Release);
        Ok(())
    }

    /// Surface at the read position
    pub fn peek(&self) -> Option<SurfaceId> {
        if self.filled() == 0 {
            return None;
        }
        self.slots[self.read]
    }

    /// Move the display on by one field (interlaced) or frame.
    pub fn advance(&mut self, interlaced: bool) -> Advance {
        if interlaced && self.field == 0 {
            self.field = 1;
            return Advance::NextField;
        }

        if self.filled() <= min_frames(interlaced) {
            return Advance::Starved;
        }

        let released = self.slots[self.read].take();
        self.read = (self.read + 1) % VIDEO_SURFACES_MAX;
        self.filled.fetch_sub(1, Ordering::Release);
        self.field = 0;
        Advance::Rotated(released)
    }

    /// Empty the ring, returning every queued surface in display order.
    pub fn drain(&mut self) -> Vec<SurfaceId> {
        let mut surfaces = Vec::with_capacity(self.filled());
        for i in 0..VIDEO_SURFACES_MAX {
            if let Some(id) = self.slots[(self.read + i) % VIDEO_SURFACES_MAX].take() {
                surfaces.push(id);
            }
        }
        self.read = 0;
        self.write = 0;
        self.field = 0;
        self.filled.store(0, Ordering::Release);
        surfaces
    }

    /// Number of occupied slots, counted the slow way
    fn occupied(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Debug check that the counter matches the slots.
    pub fn is_consistent(&self) -> bool {
        let filled = self.filled();
        filled <= VIDEO_SURFACES_MAX
            && self.occupied() == filled
            && (self.read + filled) % VIDEO_SURFACES_MAX == self.write
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u32) -> SurfaceId {
        SurfaceId::new(n)
    }

    #[test]
    fn test_full_ring_rejects() {
        let mut ring = SurfaceRing::new();
        for n in 0..VIDEO_SURFACES_MAX as u32 {
            assert!(ring.enqueue(id(n)).is_ok());
        }
        assert_eq!(ring.enqueue(id(99)), Err(id(99)));
        assert_eq!(ring.filled(), VIDEO_SURFACES_MAX);
        assert!(ring.is_consistent());
    }

    #[test]
    fn test_progressive_rotation() {
        let mut ring = SurfaceRing::new();
        ring.enqueue(id(0)).unwrap();
        // only one frame: hold it
        assert_eq!(ring.advance(false), Advance::Starved);
        ring.enqueue(id(1)).unwrap();
        assert_eq!(ring.advance(false), Advance::Rotated(Some(id(0))));
        assert_eq!(ring.peek(), Some(id(1)));
        assert_eq!(ring.filled(), 1);
        assert!(ring.is_consistent());
    }

    #[test]
    fn test_interlaced_fields() {
        let mut ring = SurfaceRing::new();
        for n in 0..4 {
            ring.enqueue(id(n)).unwrap();
        }
        assert_eq!(ring.advance(true), Advance::NextField);
        assert_eq!(ring.field_parity(), 1);
        assert_eq!(ring.advance(true), Advance::Rotated(Some(id(0))));
        assert_eq!(ring.field_parity(), 0);
        assert_eq!(ring.advance(true), Advance::NextField);
        // three left, which is the interlaced minimum
        assert_eq!(ring.advance(true), Advance::Starved);
        assert_eq!(ring.field_parity(), 1);
        assert_eq!(ring.peek(), Some(id(1)));
    }

    #[test]
    fn test_wraparound_consistency() {
        let mut ring = SurfaceRing::new();
        let mut next = 0;
        for _ in 0..50 {
            while ring.enqueue(id(next)).is_ok() {
                next += 1;
            }
            for _ in 0..3 {
                ring.advance(false);
            }
            assert!(ring.is_consistent());
        }
    }

    #[test]
    fn test_drain() {
        let mut ring = SurfaceRing::new();
        for n in 0..5 {
            ring.enqueue(id(n)).unwrap();
        }
        ring.advance(false);
        let drained = ring.drain();
        assert_eq!(drained, vec![id(1), id(2), id(3), id(4)]);
        assert_eq!(ring.filled(), 0);
        assert_eq!(ring.peek(), None);
        assert!(ring.is_consistent());
    }

    #[test]
    fn test_shared_counter() {
        let mut ring = SurfaceRing::new();
        let filled = ring.filled_handle();
        ring.enqueue(id(0)).unwrap();
        assert_eq!(filled.load(Ordering::Acquire), 1);
    }
}
