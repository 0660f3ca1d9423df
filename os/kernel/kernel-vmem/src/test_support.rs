//! Host-side stand-ins for physical memory, frame allocation and the MMU.

use crate::{FrameAlloc, FrameAllocError, PagingHardware, PhysMapper};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::SpinLock;

#[repr(C, align(4096))]
struct Frame([u8; PAGE_SIZE as usize]);

/// Simulated physical memory covering the whole 32-bit space.
///
/// Frames are allocated zero-filled on first touch and never move, so
/// references handed out by [`PhysMapper::phys_to_mut`] stay valid for the
/// lifetime of the arena.
#[derive(Default)]
pub struct SparsePhys {
    frames: SpinLock<BTreeMap<u32, Box<Frame>>>,
}

impl SparsePhys {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of distinct frames touched so far.
    #[must_use]
    pub fn touched_frames(&self) -> usize {
        self.frames.lock().len()
    }

    fn frame_ptr(&self, frame: u32) -> *mut u8 {
        let mut frames = self.frames.lock();
        let f = frames
            .entry(frame)
            .or_insert_with(|| Box::new(Frame([0; PAGE_SIZE as usize])));
        f.0.as_mut_ptr()
    }

    #[must_use]
    pub fn read_u32(&self, pa: PhysicalAddress) -> u32 {
        let mut bytes = [0; 4];
        self.read(pa, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    pub fn write_u32(&self, pa: PhysicalAddress, value: u32) {
        self.write(pa, &value.to_le_bytes());
    }

    /// Copies bytes out of simulated memory; may cross frame boundaries.
    pub fn read(&self, pa: PhysicalAddress, out: &mut [u8]) {
        for (i, b) in out.iter_mut().enumerate() {
            let a = pa.as_u32() + i as u32;
            *b = unsafe { *self.frame_ptr(a / PAGE_SIZE).add((a % PAGE_SIZE) as usize) };
        }
    }

    pub fn write(&self, pa: PhysicalAddress, bytes: &[u8]) {
        for (i, b) in bytes.iter().enumerate() {
            let a = pa.as_u32() + i as u32;
            unsafe { *self.frame_ptr(a / PAGE_SIZE).add((a % PAGE_SIZE) as usize) = *b };
        }
    }
}

impl PhysMapper for SparsePhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let offset = pa.as_u32() % PAGE_SIZE;
        debug_assert!(offset as usize + size_of::<T>() <= PAGE_SIZE as usize, "object crosses a frame");
        unsafe { &mut *self.frame_ptr(pa.as_u32() / PAGE_SIZE).add(offset as usize).cast::<T>() }
    }
}

/// Frame allocator over a fixed range of frame numbers, lowest first.
///
/// Double frees and foreign frames panic.
#[derive(Debug)]
pub struct TestFrames {
    first: u32,
    count: u32,
    used: BTreeSet<u32>,
}

impl TestFrames {
    #[must_use]
    pub fn new(first: u32, count: u32) -> Self {
        Self {
            first,
            count,
            used: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn allocated(&self) -> usize {
        self.used.len()
    }

    #[must_use]
    pub fn is_allocated(&self, frame: PhysicalPage<Size4K>) -> bool {
        self.used.contains(&frame.frame_number())
    }
}

impl FrameAlloc for TestFrames {
    fn allocate_frame(&mut self) -> Result<PhysicalPage<Size4K>, FrameAllocError> {
        let n = (self.first..self.first + self.count)
            .find(|n| !self.used.contains(n))
            .ok_or(FrameAllocError::OutOfMemory)?;
        self.used.insert(n);
        Ok(PhysicalPage::from_frame_number(n))
    }

    fn free_frame(&mut self, frame: PhysicalPage<Size4K>) {
        assert!(
            self.used.remove(&frame.frame_number()),
            "double free of {frame}"
        );
    }
}

/// MMU that only records what it was asked to do.
#[derive(Debug, Default)]
pub struct RecordingPaging {
    loads: SpinLock<Vec<PhysicalPage<Size4K>>>,
    paging: AtomicBool,
    invalidations: AtomicUsize,
    fault: AtomicU32,
}

impl RecordingPaging {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every directory loaded so far, oldest first.
    #[must_use]
    pub fn loads(&self) -> Vec<PhysicalPage<Size4K>> {
        self.loads.lock().clone()
    }

    #[must_use]
    pub fn current(&self) -> Option<PhysicalPage<Size4K>> {
        self.loads.lock().last().copied()
    }

    #[must_use]
    pub fn paging_enabled(&self) -> bool {
        self.paging.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn invalidations(&self) -> usize {
        self.invalidations.load(Ordering::SeqCst)
    }

    /// Sets the address the next [`fault_address`](PagingHardware::fault_address) returns.
    pub fn set_fault_address(&self, va: VirtualAddress) {
        self.fault.store(va.as_u32(), Ordering::SeqCst);
    }
}

impl PagingHardware for RecordingPaging {
    fn load_directory(&self, directory: PhysicalPage<Size4K>) {
        self.loads.lock().push(directory);
    }

    fn enable_paging(&self) {
        self.paging.store(true, Ordering::SeqCst);
    }

    fn invalidate_page(&self, _va: VirtualAddress) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }

    fn fault_address(&self) -> VirtualAddress {
        VirtualAddress::new(self.fault.load(Ordering::SeqCst))
    }
}
