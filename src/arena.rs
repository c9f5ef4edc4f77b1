//! Per-Frame Arena
//!
//! Two-tier bump allocation for data that lives exactly one frame:
//!
//! | Tier  | Backing            | Used for                                  |
//! |-------|--------------------|-------------------------------------------|
//! | slab  | `bumpalo::Bump`    | allocations up to `large_threshold` bytes |
//! | large | separate `Bump`    | oversized allocations                     |
//!
//! Both tiers are **reset, not freed**, at the end of each frame: bumpalo keeps
//! its largest chunk so steady-state frames allocate nothing from the system.
//!
//! References handed out borrow the arena immutably, and [`FrameArena::reset`]
//! takes `&mut self`, so nothing allocated here can outlive the frame.

use bumpalo::Bump;

/// Per-frame two-tier bump allocator.
pub struct FrameArena {
    slab: Bump,
    large: Bump,
    large_threshold: usize,
    resets: u64,
}

impl FrameArena {
    #[must_use]
    pub fn new(slab_size: usize, large_threshold: usize) -> Self {
        Self {
            slab: Bump::with_capacity(slab_size),
            large: Bump::new(),
            large_threshold: large_threshold.min(slab_size.max(1)),
            resets: 0,
        }
    }

    #[inline]
    fn tier_for(&self, bytes: usize) -> &Bump {
        if bytes > self.large_threshold {
            &self.large
        } else {
            &self.slab
        }
    }

    /// Moves `value` into the arena.
    pub fn alloc<T>(&self, value: T) -> &mut T {
        self.tier_for(size_of::<T>()).alloc(value)
    }

    /// Copies a slice into the arena.
    pub fn alloc_slice_copy<T: Copy>(&self, src: &[T]) -> &mut [T] {
        self.tier_for(size_of_val(src)).alloc_slice_copy(src)
    }

    /// Collects an exact-size iterator into an arena slice.
    pub fn alloc_slice_fill_iter<T, I>(&self, iter: I) -> &mut [T]
    where
        I: IntoIterator<Item = T>,
        I::IntoIter: ExactSizeIterator,
    {
        let iter = iter.into_iter();
        let bytes = iter.len() * size_of::<T>();
        self.tier_for(bytes).alloc_slice_fill_iter(iter)
    }

    /// Zeroed byte buffer, typically a uniform staging area.
    pub fn alloc_bytes(&self, len: usize) -> &mut [u8] {
        self.tier_for(len).alloc_slice_fill_copy(len, 0u8)
    }

    /// A growable vector backed by the slab tier.
    pub fn vec<T>(&self) -> bumpalo::collections::Vec<'_, T> {
        bumpalo::collections::Vec::new_in(&self.slab)
    }

    /// Rewinds both tiers. Outstanding borrows make this a compile error.
    pub fn reset(&mut self) {
        self.slab.reset();
        self.large.reset();
        self.resets += 1;
    }

    /// Bytes currently allocated across both tiers.
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.slab.allocated_bytes() + self.large.allocated_bytes()
    }

    /// Bytes allocated in the large tier only.
    #[must_use]
    pub fn large_allocated_bytes(&self) -> usize {
        self.large.allocated_bytes()
    }

    #[must_use]
    pub fn large_threshold(&self) -> usize {
        self.large_threshold
    }

    /// Number of frame resets so far.
    #[must_use]
    pub fn reset_count(&self) -> u64 {
        self.resets
    }
}

impl Default for FrameArena {
    fn default() -> Self {
        Self::new(64 * 1024, 8 * 1024)
    }
}
