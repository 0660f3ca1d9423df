//! # Physical Frame Allocator
//!
//! One bit per 4 KiB frame of the managed region, `1` meaning allocated.
//! Searches scan a word (32 frames) at a time and skip full words.

use alloc::boxed::Box;
use alloc::vec;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K};
use kernel_vmem::{FrameAlloc, FrameAllocError};

const WORD_BITS: usize = u32::BITS as usize;

/// Fixed-size bit set over frame indices.
///
/// Bits at or past [`len`](Self::len) are never reported as free.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct FrameBitmap {
    words: Box<[u32]>,
    len: usize,
}

impl FrameBitmap {
    /// A bitmap of `len` clear bits.
    #[must_use]
    pub fn new(len: usize) -> Self {
        let mut words = vec![0u32; len.div_ceil(WORD_BITS)].into_boxed_slice();
        // Pin the tail of the last word so whole-word scans never see it as free.
        if let Some(last) = words.last_mut()
            && len % WORD_BITS != 0
        {
            *last = !0 << (len % WORD_BITS);
        }
        Self { words, len }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    const fn locate(i: usize) -> (usize, u32) {
        (i / WORD_BITS, 1 << (i % WORD_BITS))
    }

    #[inline]
    #[must_use]
    pub fn test(&self, i: usize) -> bool {
        debug_assert!(i < self.len);
        let (w, mask) = Self::locate(i);
        self.words[w] & mask != 0
    }

    #[inline]
    pub fn set(&mut self, i: usize) {
        debug_assert!(i < self.len);
        let (w, mask) = Self::locate(i);
        self.words[w] |= mask;
    }

    #[inline]
    pub fn unset(&mut self, i: usize) {
        debug_assert!(i < self.len);
        let (w, mask) = Self::locate(i);
        self.words[w] &= !mask;
    }

    /// Index of the first clear bit.
    #[must_use]
    pub fn first_free(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, w)| **w != u32::MAX)
            .map(|(i, w)| i * WORD_BITS + w.trailing_ones() as usize)
    }

    /// First index of `n` consecutive clear bits.
    ///
    /// Runs may cross word boundaries. Returns `None` rather than a partial
    /// run; `n == 0` finds nothing.
    #[must_use]
    pub fn find_free_span(&self, n: usize) -> Option<usize> {
        if n == 0 || n > self.len {
            return None;
        }

        let mut run_start = 0;
        let mut run = 0;
        let mut i = 0;
        while i < self.len {
            let word = self.words[i / WORD_BITS];
            if i % WORD_BITS == 0 && word == u32::MAX {
                run = 0;
                i += WORD_BITS;
                continue;
            }
            if i % WORD_BITS == 0 && word == 0 && i + WORD_BITS <= self.len {
                if run == 0 {
                    run_start = i;
                }
                run += WORD_BITS;
                if run >= n {
                    return Some(run_start);
                }
                i += WORD_BITS;
                continue;
            }

            if self.test(i) {
                run = 0;
            } else {
                if run == 0 {
                    run_start = i;
                }
                run += 1;
                if run >= n {
                    return Some(run_start);
                }
            }
            i += 1;
        }
        None
    }

    /// Number of consecutive clear bits directly after index `i`.
    #[must_use]
    pub fn free_slots_after(&self, i: usize) -> usize {
        (i + 1..self.len).take_while(|&j| !self.test(j)).count()
    }

    /// Sets `n` bits starting at `start`.
    pub fn mark_span(&mut self, start: usize, n: usize) {
        (start..start + n).for_each(|i| self.set(i));
    }

    /// Clears `n` bits starting at `start`.
    pub fn release_span(&mut self, start: usize, n: usize) {
        (start..start + n).for_each(|i| self.unset(i));
    }

    /// Number of clear bits.
    #[must_use]
    pub fn free_slots(&self) -> usize {
        self.words.iter().map(|w| w.count_zeros() as usize).sum()
    }
}

/// [`FrameAlloc`] over a contiguous physical region, backed by a [`FrameBitmap`].
///
/// Bitmap index `i` is the frame `base + i`.
pub struct BitmapFrameAlloc {
    bitmap: FrameBitmap,
    base: PhysicalPage<Size4K>,
}

impl BitmapFrameAlloc {
    /// Manages `frames` frames starting at `base`, all initially free.
    #[must_use]
    pub fn new(base: PhysicalPage<Size4K>, frames: usize) -> Self {
        Self {
            bitmap: FrameBitmap::new(frames),
            base,
        }
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> PhysicalPage<Size4K> {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn bitmap(&self) -> &FrameBitmap {
        &self.bitmap
    }

    #[inline]
    pub const fn bitmap_mut(&mut self) -> &mut FrameBitmap {
        &mut self.bitmap
    }

    /// The frame managed at bitmap index `i`.
    #[inline]
    #[must_use]
    pub const fn frame(&self, i: usize) -> PhysicalPage<Size4K> {
        PhysicalPage::from_frame_number(self.base.frame_number() + i as u32)
    }

    /// The bitmap index of `frame`, if it lies in the managed region.
    #[must_use]
    pub fn index_of(&self, frame: PhysicalPage<Size4K>) -> Option<usize> {
        let i = frame.frame_number().checked_sub(self.base.frame_number())? as usize;
        (i < self.bitmap.len()).then_some(i)
    }

    #[must_use]
    pub fn contains(&self, pa: PhysicalAddress) -> bool {
        self.index_of(PhysicalPage::containing_address(pa)).is_some()
    }

    #[inline]
    #[must_use]
    pub const fn total_frames(&self) -> usize {
        self.bitmap.len()
    }

    #[inline]
    #[must_use]
    pub fn free_frames(&self) -> usize {
        self.bitmap.free_slots()
    }

    #[inline]
    #[must_use]
    pub fn allocated_frames(&self) -> usize {
        self.total_frames() - self.free_frames()
    }
}

impl FrameAlloc for BitmapFrameAlloc {
    fn allocate_frame(&mut self) -> Result<PhysicalPage<Size4K>, FrameAllocError> {
        let i = self.bitmap.first_free().ok_or(FrameAllocError::OutOfMemory)?;
        self.bitmap.set(i);
        Ok(self.frame(i))
    }

    fn free_frame(&mut self, frame: PhysicalPage<Size4K>) {
        let Some(i) = self.index_of(frame) else {
            log::error!("free of {frame} outside the managed region at {}", self.base);
            panic!("freeing a frame outside the managed region");
        };
        if !self.bitmap.test(i) {
            log::error!("double free of {frame}");
            panic!("double free of a physical frame");
        }
        self.bitmap.unset(i);
    }
}
