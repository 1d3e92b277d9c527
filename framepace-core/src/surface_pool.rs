//! Surface Pool
//!
//! Fixed set of decoder surface ids split into a free list and a used
//! list. Freed surfaces go to the back of the free list, so the least
//! recently used surface is handed out next.

use std::collections::VecDeque;

/// Upper bound on surfaces per decoder
pub const CODEC_SURFACES_MAX: usize = 16;

/// Opaque handle of one decoded picture's GPU storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SurfaceId(u32);

impl SurfaceId {
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug)]
pub struct SurfacePool {
    free: VecDeque<SurfaceId>,
    used: Vec<SurfaceId>,
}

impl SurfacePool {
    /// Create a pool of `count` surfaces numbered from zero.
    ///
    /// Panics if `count` exceeds [`CODEC_SURFACES_MAX`].
    pub fn new(count: usize) -> Self {
        assert!(
            count <= CODEC_SURFACES_MAX,
            "surface pool of {} exceeds {}",
            count,
            CODEC_SURFACES_MAX
        );
        let mut free = VecDeque::with_capacity(CODEC_SURFACES_MAX);
        free.extend((0..count as u32).map(SurfaceId::new));
        Self {
            free,
            used: Vec::with_capacity(CODEC_SURFACES_MAX),
        }
    }

    /// Empty pool, no surfaces created yet
    pub fn empty() -> Self {
        Self::new(0)
    }

    /// Take the oldest free surface. `None` when everything is in use.
    pub fn allocate(&mut self) -> Option<SurfaceId> {
        let id = self.free.pop_front()?;
        self.used.push(id);
        Some(id)
    }

    /// Return a surface to the free list.
    ///
    /// Panics if the surface is not in use; a double release means the
    /// ring and the pool disagree about ownership.
    pub fn release(&mut self, id: SurfaceId) {
        match self.used.iter().position(|&u| u == id) {
            Some(i) => {
                self.used.swap_remove(i);
                self.free.push_back(id);
            }
            None => {
                tracing::error!("release of surface {:?} which is not in use", id);
                panic!("surface {:?} released while not in use", id);
            }
        }
    }

    /// Forget every surface, returning how many there were.
    pub fn drain(&mut self) -> usize {
        let total = self.free.len() + self.used.len();
        self.free.clear();
        self.used.clear();
        total
    }

    pub fn is_in_use(&self, id: SurfaceId) -> bool {
        self.used.contains(&id)
    }

    pub fn free_len(&self) -> usize {
        self.free.len()
    }

    pub fn used_len(&self) -> usize {
        self.used.len()
    }

    pub fn capacity(&self) -> usize {
        self.free.len() + self.used.len()
    }
}
