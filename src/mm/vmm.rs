//! Virtual memory manager.
//!
//! Owns the kernel's root page table and carves two fixed virtual ranges out
//! of it: the kernel heap (mapped once, eagerly, at init) and an MMIO range
//! used by device drivers (bump-allocated as regions are requested). Page
//! table walking itself is delegated to [`PageTableMapper`], kept generic
//! here only over the [`PageMapper`]/[`PageTranslator`] traits so a second
//! architecture could supply its own mapper without touching this file.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::addr::{PhysAddr, VirtAddr};
use crate::arch::x86_64::paging::mapper::PageTableMapper;
use crate::boot::BootInfo;
#[cfg(target_os = "none")]
use crate::boot::MemoryRegionKind;
use crate::config::{HEAP_BASE, KERNEL_HEAP_SIZE};
use crate::mm::mapper::{MapFlags, PageMapper, PageTranslator};
#[cfg(target_os = "none")]
use crate::mm::mapper::UnmapError;
use crate::mm::pmm::BitmapFrameAllocRef;
use crate::mm::{FrameAllocator, PAGE_SIZE, VmmError};
use crate::paging::{Page, PageSize, PhysFrame, Size1GiB, Size2MiB, Size4KiB};
use crate::sync::SpinLock;

// Placed by the kernel's linker script, one page-aligned boundary per
// section. The boot stub maps the kernel image before `kernel_init` runs;
// these bounds only let us tighten the permissions it started with. Only
// the real linker script provides them, so this (and everything that reads
// it) is bare-metal-only — a host test build links against no such script.
#[cfg(target_os = "none")]
unsafe extern "C" {
    static __text_start: u8;
    static __text_end: u8;
    static __rodata_start: u8;
    static __rodata_end: u8;
    static __data_start: u8;
    static __data_end: u8;
    static __requests_start: u8;
    static __requests_end: u8;
}

/// HHDM offset, published once during [`init`] for callers that need to
/// translate a physical address without going through a full VMM lock
/// (ACPI table parsing runs before most of the kernel's locking is needed).
static HHDM_OFFSET: AtomicU64 = AtomicU64::new(0);

/// Base of the MMIO virtual range, placed well past the heap so neither
/// range's growth can run into the other.
const MMIO_BASE: u64 = HEAP_BASE + KERNEL_HEAP_SIZE as u64 * 16;

/// Size of the MMIO virtual range (256 MiB, enough for LAPIC/IOAPIC/HPET
/// and a handful of device BARs).
const MMIO_SIZE: u64 = 256 * 1024 * 1024;

/// Virtual memory manager, generic over the architecture's page mapper.
struct Vmm<M> {
    root: PhysAddr,
    mapper: M,
    hhdm_offset: u64,
    #[allow(dead_code)]
    max_phys: u64,
    mmio_next: u64,
}

impl<M> Vmm<M>
where
    M: PageMapper<Size4KiB> + PageMapper<Size2MiB> + PageMapper<Size1GiB> + PageTranslator,
{
    fn new(root: PhysAddr, mapper: M, hhdm_offset: u64, max_phys: u64) -> Self {
        Self {
            root,
            mapper,
            hhdm_offset,
            max_phys,
            mmio_next: MMIO_BASE,
        }
    }

    /// Maps `byte_len` bytes starting at `virt_base`, allocating a fresh
    /// frame per page from `alloc`.
    fn map_range(
        &mut self,
        virt_base: VirtAddr,
        byte_len: u64,
        flags: MapFlags,
        alloc: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<(), VmmError> {
        let pages = byte_len.div_ceil(PAGE_SIZE as u64);
        for i in 0..pages {
            let page = Page::<Size4KiB>::containing_address(VirtAddr::new(
                virt_base.as_u64() + i * PAGE_SIZE as u64,
            ));
            let frame = alloc.allocate_frame().ok_or(VmmError::OutOfMemory)?;
            // SAFETY: `root` is this Vmm's own page table root; `frame` was
            // just handed out by `alloc` and is not mapped anywhere else.
            unsafe {
                self.mapper
                    .map(self.root, page, frame, flags, &mut || {
                        alloc.allocate_frame().unwrap_or_else(|| {
                            crate::error::set_kind(crate::error::PanicKind::ResourceExhaustion);
                            panic!("out of memory allocating page table frame")
                        })
                    })
            }
            .ignore();
        }
        Ok(())
    }

    /// Identity-style maps a fixed physical range into the MMIO virtual
    /// range, bumping the free pointer. Returns the virtual base.
    fn map_mmio(
        &mut self,
        phys: PhysAddr,
        size: u64,
        alloc: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<VirtAddr, VmmError> {
        let size = size.div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64;
        if self.mmio_next + size > MMIO_BASE + MMIO_SIZE {
            return Err(VmmError::RegionExhausted);
        }
        let virt_base = VirtAddr::new(self.mmio_next);
        let pages = size / PAGE_SIZE as u64;
        for i in 0..pages {
            let page = Page::<Size4KiB>::containing_address(VirtAddr::new(
                virt_base.as_u64() + i * PAGE_SIZE as u64,
            ));
            let frame = PhysFrame::<Size4KiB>::containing_address(PhysAddr::new(
                phys.as_u64() + i * PAGE_SIZE as u64,
            ));
            // SAFETY: `root` is this Vmm's own page table root. MMIO pages
            // are never handed to the frame allocator so double-mapping a
            // live frame cannot happen here.
            unsafe {
                self.mapper.map(
                    self.root,
                    page,
                    frame,
                    MapFlags::WRITABLE | MapFlags::CACHE_DISABLE,
                    &mut || {
                        alloc.allocate_frame().unwrap_or_else(|| {
                            crate::error::set_kind(crate::error::PanicKind::ResourceExhaustion);
                            panic!("out of memory allocating page table frame")
                        })
                    },
                )
            }
            .ignore();
        }
        self.mmio_next += size;
        Ok(virt_base)
    }

    fn map_initial_heap(
        &mut self,
        alloc: &mut impl FrameAllocator<Size4KiB>,
    ) -> Result<(VirtAddr, u64), VmmError> {
        let base = VirtAddr::new(HEAP_BASE);
        self.map_range(base, KERNEL_HEAP_SIZE as u64, MapFlags::WRITABLE, alloc)?;
        Ok((base, KERNEL_HEAP_SIZE as u64))
    }

    fn translate(&self, virt: VirtAddr) -> Option<PhysAddr> {
        // SAFETY: `root` is this Vmm's own page table root.
        unsafe { self.mapper.translate_addr(self.root, virt) }
    }

    /// Updates the permissions of the already-mapped page containing `virt`,
    /// trying 4 KiB, then 2 MiB, then 1 GiB, whichever size the page was
    /// actually mapped with. Returns the page size stepped over, so callers
    /// can advance without re-walking the same huge page one 4 KiB stride
    /// at a time.
    #[cfg(target_os = "none")]
    fn update_flags_at(&mut self, virt: VirtAddr, flags: MapFlags) -> u64 {
        let page = Page::<Size4KiB>::containing_address(virt);
        // SAFETY: `root` is this Vmm's own page table root; we only change
        // flags on entries the boot stub already mapped.
        match unsafe { self.mapper.update_flags(self.root, page, flags) } {
            Ok(flush) => {
                flush.ignore();
                return Size4KiB::SIZE;
            }
            Err(UnmapError::SizeMismatch) => {}
            Err(UnmapError::NotMapped) => {
                crate::error::set_kind(crate::error::PanicKind::InvariantViolation);
                panic!("vmm: page at {virt:?} not mapped by boot stub")
            }
        }

        let page = Page::<Size2MiB>::containing_address(virt);
        // SAFETY: same as above.
        match unsafe { self.mapper.update_flags(self.root, page, flags) } {
            Ok(flush) => {
                flush.ignore();
                return Size2MiB::SIZE;
            }
            Err(UnmapError::SizeMismatch) => {}
            Err(UnmapError::NotMapped) => {
                crate::error::set_kind(crate::error::PanicKind::InvariantViolation);
                panic!("vmm: page at {virt:?} not mapped by boot stub")
            }
        }

        let page = Page::<Size1GiB>::containing_address(virt);
        // SAFETY: same as above.
        unsafe { self.mapper.update_flags(self.root, page, flags) }
            .unwrap_or_else(|_| {
                crate::error::set_kind(crate::error::PanicKind::InvariantViolation);
                panic!("vmm: page at {virt:?} not mapped by boot stub")
            })
            .ignore();
        Size1GiB::SIZE
    }

    /// Retags every already-mapped page in `[start, end)` with `flags`.
    #[cfg(target_os = "none")]
    fn remap_range(&mut self, start: VirtAddr, end: VirtAddr, flags: MapFlags) {
        let mut virt = start.as_u64() & !(PAGE_SIZE as u64 - 1);
        let end = end.as_u64().div_ceil(PAGE_SIZE as u64) * PAGE_SIZE as u64;
        while virt < end {
            let step = self.update_flags_at(VirtAddr::new(virt), flags);
            virt = (virt & !(step - 1)) + step;
        }
    }

    /// Tightens the kernel image's permissions from whatever the boot stub
    /// started with down to the per-section set the kernel actually needs,
    /// and marks every Usable/BootloaderReclaimable/KernelAndModules/
    /// Framebuffer region's HHDM alias non-executable.
    #[cfg(target_os = "none")]
    fn harden_kernel_address_space(&mut self, boot_info: &impl BootInfo) {
        // SAFETY: these are the linker-provided section boundaries of the
        // running kernel image; reading their addresses (never their
        // contents) is always valid.
        let (text_start, text_end, rodata_start, rodata_end, data_start, data_end, req_start, req_end) = unsafe {
            (
                VirtAddr::new(core::ptr::addr_of!(__text_start) as u64),
                VirtAddr::new(core::ptr::addr_of!(__text_end) as u64),
                VirtAddr::new(core::ptr::addr_of!(__rodata_start) as u64),
                VirtAddr::new(core::ptr::addr_of!(__rodata_end) as u64),
                VirtAddr::new(core::ptr::addr_of!(__data_start) as u64),
                VirtAddr::new(core::ptr::addr_of!(__data_end) as u64),
                VirtAddr::new(core::ptr::addr_of!(__requests_start) as u64),
                VirtAddr::new(core::ptr::addr_of!(__requests_end) as u64),
            )
        };

        self.remap_range(text_start, text_end, MapFlags::EXECUTABLE | MapFlags::GLOBAL);
        self.remap_range(rodata_start, rodata_end, MapFlags::GLOBAL);
        self.remap_range(data_start, data_end, MapFlags::WRITABLE | MapFlags::GLOBAL);
        self.remap_range(req_start, req_end, MapFlags::GLOBAL);

        let hhdm_offset = self.hhdm_offset;
        for region in boot_info.memory_map() {
            let hhdm_worthy = matches!(
                region.kind,
                MemoryRegionKind::Usable
                    | MemoryRegionKind::BootloaderReclaimable
                    | MemoryRegionKind::KernelAndModules
                    | MemoryRegionKind::Framebuffer
            );
            if !hhdm_worthy || region.size == 0 {
                continue;
            }
            let virt_start = VirtAddr::new(hhdm_offset + region.start.as_u64());
            let virt_end = VirtAddr::new(hhdm_offset + region.start.as_u64() + region.size);
            self.remap_range(virt_start, virt_end, MapFlags::WRITABLE);
        }
    }
}

type KernelMapper = PageTableMapper;

/// Type alias for the kernel VMM parameterised on the active architecture's
/// mapper.
type KernelVmm = Vmm<KernelMapper>;

/// Global virtual memory manager.
static VMM: SpinLock<Option<KernelVmm>> = SpinLock::new(None);

/// Initializes the VMM from boot info and the PMM.
pub fn init(boot_info: &impl BootInfo) {
    let hhdm_offset = boot_info.hhdm_offset();
    let root_phys = boot_info.page_table_root();

    let max_phys = boot_info
        .memory_map()
        .iter()
        .map(|r| r.start.as_u64() + r.size)
        .max()
        .unwrap_or(0);

    let mapper = KernelMapper::new(hhdm_offset);
    let vmm = KernelVmm::new(root_phys, mapper, hhdm_offset, max_phys);

    let mut global = VMM.lock();
    if global.is_some() {
        crate::error::set_kind(crate::error::PanicKind::InvariantViolation);
        panic!("VMM already initialized");
    }
    *global = Some(vmm);
    #[cfg(target_os = "none")]
    global
        .as_mut()
        .expect("just inserted")
        .harden_kernel_address_space(boot_info);
    drop(global);

    HHDM_OFFSET.store(hhdm_offset, Ordering::Release);
}

/// Returns the HHDM offset published by [`init`].
///
/// `virtual = physical + hhdm_offset()`. Used by code that needs to read
/// physical memory directly (ACPI table parsing) without a full mapping.
pub fn hhdm_offset() -> u64 {
    HHDM_OFFSET.load(Ordering::Acquire)
}

/// Maps the fixed-size kernel heap range. Returns `(heap_start, heap_size)`.
pub fn map_initial_heap() -> (usize, usize) {
    let mut vmm = VMM.lock();
    let vmm = vmm.as_mut().expect("VMM not initialized");

    super::pmm::with_pmm(|pmm| {
        let mut alloc = BitmapFrameAllocRef(pmm);
        let (base, size) = vmm
            .map_initial_heap(&mut alloc)
            .expect("failed to map initial heap");
        (base.as_u64() as usize, size as usize)
    })
}

/// Executes a closure with a mutable reference to the global VMM.
pub fn with_vmm<R>(f: impl FnOnce(&mut KernelVmm) -> R) -> R {
    let mut vmm = VMM.lock();
    f(vmm.as_mut().expect("VMM not initialized"))
}

/// Attempts to execute a closure with a mutable reference to the global VMM.
///
/// Returns `None` if the VMM lock is already held (avoiding deadlock in
/// fault handlers) or if the VMM has not been initialized yet.
pub fn try_with_vmm<R>(f: impl FnOnce(&mut KernelVmm) -> R) -> Option<R> {
    let mut vmm = VMM.try_lock()?;
    Some(f(vmm.as_mut()?))
}

/// Maps an MMIO physical region into kernel virtual space.
///
/// Convenience wrapper that acquires both VMM and PMM locks internally.
/// Returns the virtual base address of the mapping.
pub fn map_mmio_region(phys: PhysAddr, size: u64) -> VirtAddr {
    with_vmm(|vmm| {
        super::pmm::with_pmm(|pmm| {
            let mut alloc = BitmapFrameAllocRef(pmm);
            vmm.map_mmio(phys, size, &mut alloc)
                .expect("failed to map MMIO region")
        })
    })
}

/// Translates a virtual address to physical using the current page table.
pub fn translate(virt: VirtAddr) -> Option<PhysAddr> {
    try_with_vmm(|vmm| vmm.translate(virt)).flatten()
}
