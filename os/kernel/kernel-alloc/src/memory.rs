//! # Kernel Memory
//!
//! The one object the rest of the kernel talks to for memory. It starts out
//! serving allocations from the [`BootstrapAlloc`] arena and switches to the
//! [`PageHeap`] once [`activate`](KernelMemory::activate) has built the kernel
//! directory and turned on paging.
//!
//! Every operation runs with interrupts masked and under a spin lock, so the
//! multi-step allocate, resize and free sequences never interleave with frame
//! reuse by a preempting task.
//!
//! ## Usage
//! ```rust,ignore
//! static MEMORY: KernelMemory<IdentityMapper, X86Paging> = KernelMemory::new(&X86Interrupts);
//!
//! MEMORY.init_bootstrap(BootstrapAlloc::for_boot(boot_info));
//! MEMORY.activate(boot_info, IdentityMapper, X86Paging)?;
//! let ptr = MEMORY.allocate(128)?;
//! ```

use crate::bootstrap::BootstrapAlloc;
use crate::heap::{HEADER_SIZE, HeapError, PageHeap};
use crate::vmm::{Vmm, VmmError};
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use kernel_info::boot::BootInfo;
use kernel_memory_addresses::{PhysicalAddress, PhysicalPage, Size4K, VirtualAddress};
use kernel_sync::{InterruptControl, InterruptLock, SpinLock};
use kernel_vmem::{
    FrameAlloc, FrameAllocError, MapError, PageAccess, PagingHardware, PhysMapper, ThreadData,
    ThreadMemory,
};

/// Largest alignment the kernel allocator honors.
pub const MAX_ALIGN: usize = HEADER_SIZE;

struct Active<M: PhysMapper, H: PagingHardware> {
    vmm: Vmm<M, H>,
    heap: PageHeap,
}

/// Memory management facade: bootstrap arena before, paged heap after
/// activation.
pub struct KernelMemory<M: PhysMapper, H: PagingHardware> {
    irq: &'static (dyn InterruptControl + Sync),
    irq_lock: InterruptLock,
    bootstrap: SpinLock<BootstrapAlloc>,
    active: SpinLock<Option<Active<M, H>>>,
}

/// Frame source handing out bootstrap frames one lock acquisition at a time,
/// so the global allocator can serve requests while the kernel directory is
/// being built.
struct LockedBootstrap<'a>(&'a SpinLock<BootstrapAlloc>);

impl FrameAlloc for LockedBootstrap<'_> {
    fn allocate_frame(&mut self) -> Result<PhysicalPage<Size4K>, FrameAllocError> {
        self.0.lock().allocate_frame()
    }

    fn free_frame(&mut self, frame: PhysicalPage<Size4K>) {
        self.0.lock().free_frame(frame);
    }
}

impl<M: PhysMapper, H: PagingHardware> KernelMemory<M, H> {
    /// A memory manager with an empty bootstrap arena.
    #[must_use]
    pub const fn new(irq: &'static (dyn InterruptControl + Sync)) -> Self {
        Self {
            irq,
            irq_lock: InterruptLock::new(),
            bootstrap: SpinLock::new(BootstrapAlloc::EMPTY),
            active: SpinLock::new(None),
        }
    }

    /// Installs the arena that serves allocations until activation.
    pub fn init_bootstrap(&self, arena: BootstrapAlloc) {
        let _irq = self.irq_lock.acquire(self.irq);
        log::debug!("bootstrap arena {}..{}", arena.start(), arena.limit());
        *self.bootstrap.lock() = arena;
    }

    /// Builds the kernel directory, enables paging and switches allocation
    /// over to the paged heap.
    ///
    /// # Errors
    /// See [`Vmm::init`].
    ///
    /// # Panics
    /// If called twice.
    pub fn activate(&self, boot_info: BootInfo<'_>, mapper: M, hw: H) -> Result<(), VmmError> {
        let _irq = self.irq_lock.acquire(self.irq);
        assert!(!self.heap_is_active(), "memory is already active");

        let reserved_end = self.bootstrap.lock().limit();
        // The bootstrap lock is only held per frame: building the directory
        // allocates the frame bitmap through the global allocator.
        let vmm = Vmm::init(
            boot_info,
            &mut LockedBootstrap(&self.bootstrap),
            reserved_end,
            mapper,
            hw,
        )?;

        log::info!(
            "heap active: {} KiB, bootstrap used {} bytes",
            vmm.heap_size() / 1024,
            self.bootstrap.lock().used()
        );
        *self.active.lock() = Some(Active {
            vmm,
            heap: PageHeap::new(),
        });
        Ok(())
    }

    /// Runs `f` on the active state with interrupts masked.
    fn with_active<R>(&self, f: impl FnOnce(&mut Active<M, H>) -> R) -> Option<R> {
        let _irq = self.irq_lock.acquire(self.irq);
        self.active.lock().as_mut().map(f)
    }

    /// Runs `f` on the virtual memory manager, if active.
    pub fn with_vmm<R>(&self, f: impl FnOnce(&mut Vmm<M, H>) -> R) -> Option<R> {
        self.with_active(|a| f(&mut a.vmm))
    }

    /// Whether the frame bitmap and the kernel directory exist.
    #[must_use]
    pub fn heap_is_active(&self) -> bool {
        let _irq = self.irq_lock.acquire(self.irq);
        self.active.lock().is_some()
    }

    /// Allocates `size` bytes; from the bootstrap arena before activation.
    ///
    /// # Errors
    /// [`HeapError::OutOfMemory`] on exhaustion of either source.
    pub fn allocate(&self, size: usize) -> Result<VirtualAddress, HeapError> {
        if let Some(result) = self.with_active(|a| a.heap.allocate(&mut a.vmm, size)) {
            return result;
        }

        let _irq = self.irq_lock.acquire(self.irq);
        let size = u32::try_from(size).map_err(|_| HeapError::OutOfMemory)?;
        let pa = self.bootstrap.lock().allocate(size).map_err(|e| {
            log::error!("{e}");
            HeapError::OutOfMemory
        })?;
        // Paging is off; physical and virtual addresses coincide.
        Ok(VirtualAddress::new(pa.as_u32()))
    }

    /// Frees a heap allocation.
    ///
    /// # Panics
    /// Before activation, for bootstrap memory, and for anything the heap
    /// rejects (see [`PageHeap::free`]).
    pub fn free(&self, ptr: VirtualAddress) {
        let _irq = self.irq_lock.acquire(self.irq);
        if self.bootstrap.lock().contains(PhysicalAddress::new(ptr.as_u32())) {
            log::error!("free of bootstrap memory at {ptr}");
            panic!("bootstrap memory cannot be freed");
        }

        let freed = self.with_active(|a| a.heap.free(&mut a.vmm, ptr));
        if freed.is_none() {
            log::error!("free of {ptr} before the heap is active");
            panic!("free before heap activation");
        }
    }

    /// Resizes a heap allocation, moving it if it cannot grow in place.
    ///
    /// # Errors
    /// [`HeapError::OutOfMemory`] (original untouched) or
    /// [`HeapError::NotActive`].
    pub fn reallocate(&self, ptr: VirtualAddress, new_size: usize) -> Result<VirtualAddress, HeapError> {
        self.with_active(|a| a.heap.reallocate(&mut a.vmm, ptr, new_size))
            .unwrap_or(Err(HeapError::NotActive))
    }

    /// Resizes a heap allocation only if that needs no move.
    ///
    /// # Errors
    /// [`HeapError::NeighborsOccupied`] or [`HeapError::NotActive`].
    pub fn try_grow_in_place(&self, ptr: VirtualAddress, new_size: usize) -> Result<VirtualAddress, HeapError> {
        self.with_active(|a| PageHeap::try_grow_in_place(&mut a.vmm, ptr, new_size))
            .unwrap_or(Err(HeapError::NotActive))
    }

    /// Maps `va` to `pa` in the kernel directory.
    ///
    /// # Errors
    /// Out of frames, or not active.
    pub fn map(&self, va: VirtualAddress, pa: PhysicalAddress, access: PageAccess) -> Result<(), VmmError> {
        self.with_vmm(|vmm| vmm.map(va, pa, access))
            .unwrap_or(Err(VmmError::Inactive))
    }

    /// Identity-maps `start..end` in the kernel directory.
    ///
    /// # Errors
    /// Out of frames, or not active.
    pub fn identity_map(
        &self,
        start: PhysicalAddress,
        end: PhysicalAddress,
        access: PageAccess,
    ) -> Result<(), VmmError> {
        self.with_vmm(|vmm| vmm.identity_map(start, end, access))
            .unwrap_or(Err(VmmError::Inactive))
    }

    /// Translates through the active directory. Before activation paging is
    /// off and every address translates to itself.
    #[must_use]
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.with_vmm(|vmm| vmm.translate(va))
            .unwrap_or(Some(PhysicalAddress::new(va.as_u32())))
    }

    /// Loads `directory`. Ignored before activation.
    pub fn switch(&self, directory: PhysicalPage<Size4K>) {
        self.with_vmm(|vmm| vmm.switch(directory));
    }

    pub fn switch_to_kernel(&self) {
        self.with_vmm(Vmm::switch_to_kernel);
    }

    /// See [`Vmm::assume_loaded`]. Ignored before activation.
    pub fn assume_loaded(&self, directory: PhysicalPage<Size4K>) {
        self.with_vmm(|vmm| vmm.assume_loaded(directory));
    }

    #[must_use]
    pub fn kernel_directory(&self) -> Option<PhysicalPage<Size4K>> {
        self.with_vmm(|vmm| vmm.kernel_directory())
    }

    #[must_use]
    pub fn current_directory(&self) -> Option<PhysicalPage<Size4K>> {
        self.with_vmm(|vmm| vmm.current_directory())
    }

    /// See [`Vmm::clone_address_space`].
    ///
    /// # Errors
    /// Out of frames, or not active.
    pub fn clone_address_space(&self) -> Result<ThreadData, VmmError> {
        self.with_vmm(Vmm::clone_address_space)
            .unwrap_or(Err(VmmError::Inactive))
    }

    /// See [`Vmm::free_address_space`].
    ///
    /// # Panics
    /// Before activation, and as [`Vmm::free_address_space`].
    pub fn free_address_space(&self, data: ThreadData) {
        let freed = self.with_vmm(|vmm| vmm.free_address_space(data));
        assert!(freed.is_some(), "address space freed before activation");
    }

    /// Bytes managed by the heap; zero before activation.
    #[must_use]
    pub fn heap_size(&self) -> usize {
        self.with_vmm(|vmm| vmm.heap_size()).unwrap_or(0)
    }

    /// Bytes of heap not allocated; zero before activation.
    #[must_use]
    pub fn free_heap(&self) -> usize {
        self.with_vmm(|vmm| vmm.free_heap()).unwrap_or(0)
    }

    #[must_use]
    pub fn live_allocations(&self) -> usize {
        self.with_active(|a| a.heap.live_allocations()).unwrap_or(0)
    }

    /// Bytes handed out by the bootstrap arena so far.
    #[must_use]
    pub fn bootstrap_used(&self) -> u32 {
        let _irq = self.irq_lock.acquire(self.irq);
        self.bootstrap.lock().used()
    }
}

impl<M, H> ThreadMemory for KernelMemory<M, H>
where
    M: PhysMapper + Send,
    H: PagingHardware + Send,
{
    fn create_thread(&self) -> Result<ThreadData, MapError> {
        self.clone_address_space().map_err(|e| match e {
            VmmError::OutOfMemory(e) | VmmError::BootstrapExhausted(e) => e,
            VmmError::NoUsableMemory => MapError::OutOfMemory(FrameAllocError::OutOfMemory),
            VmmError::Inactive => MapError::PagingInactive,
        })
    }

    fn release_thread(&self, data: ThreadData) {
        self.free_address_space(data);
    }
}

// Addresses are 32-bit and identity-mapped below the heap window, so a
// `VirtualAddress` is directly usable as a pointer on the target.
unsafe impl<M: PhysMapper, H: PagingHardware> GlobalAlloc for KernelMemory<M, H> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MAX_ALIGN {
            return ptr::null_mut();
        }
        self.allocate(layout.size())
            .map_or(ptr::null_mut(), |va| ptr::without_provenance_mut(va.as_usize()))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Ok(addr) = u32::try_from(ptr.addr()) {
            self.free(VirtualAddress::new(addr));
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Ok(addr) = u32::try_from(ptr.addr()) else {
            return ptr::null_mut();
        };
        if layout.align() > MAX_ALIGN || !self.heap_is_active() {
            // Bootstrap memory cannot grow; copy into a fresh block instead.
            let Ok(new_layout) = Layout::from_size_align(new_size, layout.align()) else {
                return ptr::null_mut();
            };
            let new = unsafe { self.alloc(new_layout) };
            if !new.is_null() {
                unsafe { ptr::copy_nonoverlapping(ptr, new, layout.size().min(new_size)) };
            }
            return new;
        }

        self.reallocate(VirtualAddress::new(addr), new_size)
            .map_or(ptr::null_mut(), |va| ptr::without_provenance_mut(va.as_usize()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{KERNEL, MEMORY_MAP};
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use kernel_info::memory::PAGE_SIZE;
    use kernel_vmem::test_support::{RecordingPaging, SparsePhys};

    struct HostIrq {
        enabled: AtomicBool,
        disables: AtomicUsize,
    }

    impl HostIrq {
        const fn new() -> Self {
            Self {
                enabled: AtomicBool::new(true),
                disables: AtomicUsize::new(0),
            }
        }

        fn disables(&self) -> usize {
            self.disables.load(Ordering::SeqCst)
        }
    }

    impl InterruptControl for HostIrq {
        fn interrupts_enabled(&self) -> bool {
            self.enabled.load(Ordering::SeqCst)
        }

        fn disable_interrupts(&self) {
            self.disables.fetch_add(1, Ordering::SeqCst);
            self.enabled.store(false, Ordering::SeqCst);
        }

        fn enable_interrupts(&self) {
            self.enabled.store(true, Ordering::SeqCst);
        }
    }

    type TestMemory = KernelMemory<&'static SparsePhys, &'static RecordingPaging>;

    fn leak<T>(v: T) -> &'static T {
        Box::leak(Box::new(v))
    }

    fn booting() -> (TestMemory, &'static SparsePhys, &'static RecordingPaging) {
        let memory = KernelMemory::new(leak(HostIrq::new()));
        memory.init_bootstrap(BootstrapAlloc::for_boot(BootInfo::new(&MEMORY_MAP, KERNEL)));
        (memory, leak(SparsePhys::new()), leak(RecordingPaging::new()))
    }

    fn active() -> (TestMemory, &'static SparsePhys) {
        let (memory, phys, paging) = booting();
        memory
            .activate(BootInfo::new(&MEMORY_MAP, KERNEL), phys, paging)
            .unwrap();
        (memory, phys)
    }

    #[test]
    fn bootstrap_serves_until_activation() {
        let (memory, _, _) = booting();
        assert!(!memory.heap_is_active());
        assert_eq!(memory.heap_size(), 0);

        let a = memory.allocate(10).unwrap();
        let b = memory.allocate(10).unwrap();
        assert_eq!(a, VirtualAddress::new(0x10_3000));
        assert_eq!(b, VirtualAddress::new(0x10_3010));
        assert_eq!(memory.bootstrap_used(), 26);
        assert_eq!(memory.translate(a), Some(PhysicalAddress::new(0x10_3000)));
        assert_eq!(memory.reallocate(a, 20), Err(HeapError::NotActive));
    }

    #[test]
    #[should_panic(expected = "free before heap activation")]
    fn free_before_activation_is_fatal() {
        let (memory, _, _) = booting();
        memory.free(VirtualAddress::new(0x0060_0008));
    }

    #[test]
    fn activation_switches_to_the_heap() {
        let (memory, _) = active();
        assert!(memory.heap_is_active());
        // Everything from the end of the 4 MiB arena to the top of memory.
        assert_eq!(memory.heap_size(), 0x80_0000 - 0x50_3000);
        assert!(memory.bootstrap_used() > 0, "page tables come from the arena");

        let ptr = memory.allocate(100).unwrap();
        assert_eq!(memory.live_allocations(), 1);
        assert_eq!(memory.free_heap(), memory.heap_size() - PAGE_SIZE as usize);
        memory.free(ptr);
        assert_eq!(memory.free_heap(), memory.heap_size());
        assert_eq!(memory.live_allocations(), 0);
    }

    #[test]
    fn heap_starts_past_the_bootstrap_arena() {
        let (memory, _) = active();
        let ptr = memory.allocate(1).unwrap();
        let pa = memory.translate(ptr).unwrap();
        let arena = BootstrapAlloc::for_boot(BootInfo::new(&MEMORY_MAP, KERNEL));
        assert!(pa.as_u32() >= arena.limit().as_u32());
    }

    #[test]
    #[should_panic(expected = "bootstrap memory cannot be freed")]
    fn freeing_bootstrap_memory_is_fatal() {
        let (memory, phys, paging) = booting();
        let early = memory.allocate(64).unwrap();
        memory
            .activate(BootInfo::new(&MEMORY_MAP, KERNEL), phys, paging)
            .unwrap();
        memory.free(early);
    }

    #[test]
    fn thread_memory_round_trip() {
        let (memory, _) = active();
        let free = memory.free_heap();

        let data = memory.create_thread().unwrap();
        assert_ne!(Some(data.directory), memory.kernel_directory());
        assert!(memory.free_heap() < free);

        memory.switch(data.directory);
        assert_eq!(memory.translate(data.stack_page.base()), Some(data.stack_frame.base()));
        memory.switch_to_kernel();
        assert_eq!(memory.current_directory(), memory.kernel_directory());

        memory.release_thread(data);
        assert_eq!(memory.free_heap(), free);
    }

    #[test]
    fn assumed_directories_are_not_loaded_again() {
        let (memory, phys, paging) = booting();
        memory
            .activate(BootInfo::new(&MEMORY_MAP, KERNEL), phys, paging)
            .unwrap();
        let data = memory.create_thread().unwrap();
        let loads = paging.loads().len();

        memory.assume_loaded(data.directory);
        assert_eq!(memory.current_directory(), Some(data.directory));
        assert_eq!(memory.translate(data.stack_page.base()), Some(data.stack_frame.base()));
        memory.switch(data.directory);
        assert_eq!(paging.loads().len(), loads);

        memory.switch_to_kernel();
        assert_eq!(paging.loads().len(), loads + 1);
        memory.release_thread(data);
    }

    #[test]
    fn thread_creation_before_activation_fails() {
        let (memory, _, _) = booting();
        assert_eq!(memory.create_thread(), Err(MapError::PagingInactive));
    }

    #[test]
    fn global_alloc_round_trip() {
        let (memory, _) = active();
        let layout = Layout::from_size_align(256, 8).unwrap();
        let p = unsafe { memory.alloc(layout) };
        assert!(!p.is_null());
        assert_eq!(p.addr() % PAGE_SIZE as usize, HEADER_SIZE);

        let grown = unsafe { memory.realloc(p, layout, 3 * 4096) };
        assert_eq!(grown, p, "grows in place into free frames");
        unsafe { memory.dealloc(grown, Layout::from_size_align(3 * 4096, 8).unwrap()) };
        assert_eq!(memory.live_allocations(), 0);

        let over_aligned = Layout::from_size_align(64, 64).unwrap();
        assert!(unsafe { memory.alloc(over_aligned) }.is_null());
    }

    #[test]
    fn interrupts_are_restored_after_each_call() {
        let (memory, _) = active();
        let ptr = memory.allocate(1).unwrap();
        assert!(memory.irq.interrupts_enabled());
        memory.free(ptr);
        assert!(memory.irq.interrupts_enabled());

        memory.irq.disable_interrupts();
        let ptr = memory.allocate(1).unwrap();
        assert!(!memory.irq.interrupts_enabled(), "stays masked");
        memory.free(ptr);
    }

    #[test]
    fn heap_is_active_masks_interrupts() {
        let irq = leak(HostIrq::new());
        let memory: TestMemory = KernelMemory::new(irq);
        memory.init_bootstrap(BootstrapAlloc::for_boot(BootInfo::new(&MEMORY_MAP, KERNEL)));

        let before = irq.disables();
        assert!(!memory.heap_is_active());
        assert_eq!(irq.disables(), before + 1);
        assert!(irq.interrupts_enabled());

        memory
            .activate(
                BootInfo::new(&MEMORY_MAP, KERNEL),
                leak(SparsePhys::new()),
                leak(RecordingPaging::new()),
            )
            .unwrap();
        let before = irq.disables();
        assert!(memory.heap_is_active());
        assert_eq!(irq.disables(), before + 1);
        assert!(irq.interrupts_enabled());
    }
}
