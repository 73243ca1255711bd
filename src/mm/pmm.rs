//! Bitmap physical frame allocator.
//!
//! Initialization scans the memory map for the single largest `Usable`
//! region and reserves a prefix of that region for the bitmap itself —
//! `ceil(usable_frames / 8)` bytes, rounded up to whole frames. The first
//! allocatable frame sits immediately after the bitmap. Frames outside the
//! chosen region are never tracked and never handed out: this keeps the
//! bitmap small and the scan below bounded by the size of one region
//! instead of the whole physical map.
//!
//! Allocation is first-fit over 64-bit words: `trailing_zeros` on the
//! complement of a word finds the lowest clear (free) bit in it. A
//! `search_hint` remembers the last word touched so repeated allocation
//! after a run of frees doesn't always start the scan at bit zero.
//!
//! Exhaustion is fail-stop: callers of [`BitmapAllocator::alloc`] and
//! [`BitmapAllocator::alloc_n`] get a frame or the kernel panics. There is
//! no path that hands back partial failure, because there is nothing a
//! caller at this layer could usefully do with `None` other than panic
//! anyway.

use core::slice;

use crate::addr::PhysAddr;
use crate::mm::{FrameAllocator, FrameDeallocator, PhysMemoryRegion, PmmError};
use crate::paging::{PhysFrame, Size4KiB};
use crate::sync::SpinLock;

const FRAME_SIZE: u64 = 4096;
const BITS_PER_WORD: u32 = 64;

/// Poison pattern written into freed frames when debug poisoning is enabled.
const PAGE_POISON_PATTERN: u32 = 0xDEAD_DEAD;

/// Writes the poison pattern across a freed frame.
///
/// # Safety
///
/// `phys_addr` must be a valid, HHDM-mapped, page-aligned physical address
/// of a frame that is not concurrently accessed by anyone else.
unsafe fn poison_page(phys_addr: PhysAddr, hhdm_offset: u64) {
    let ptr = (hhdm_offset + phys_addr.as_u64()) as *mut u32;
    // SAFETY: caller guarantees `ptr` is valid for FRAME_SIZE/4 u32 writes.
    unsafe {
        for i in 0..(FRAME_SIZE as usize / 4) {
            ptr.add(i).write_volatile(PAGE_POISON_PATTERN);
        }
    }
}

/// Checks whether a frame is still fully poisoned (never reused since free).
///
/// # Safety
///
/// Same preconditions as [`poison_page`].
unsafe fn check_page_poison(phys_addr: PhysAddr, hhdm_offset: u64) -> bool {
    let ptr = (hhdm_offset + phys_addr.as_u64()) as *const u32;
    // SAFETY: caller guarantees `ptr` is valid for FRAME_SIZE/4 u32 reads.
    unsafe {
        for i in 0..(FRAME_SIZE as usize / 4) {
            if ptr.add(i).read_volatile() != PAGE_POISON_PATTERN {
                return false;
            }
        }
    }
    true
}

struct BitmapAllocatorInner {
    /// One bit per tracked frame; `1` means reserved/allocated, `0` means free.
    bitmap: &'static mut [u64],
    /// Physical address of the first tracked frame (start of the chosen region).
    region_start: PhysAddr,
    /// Number of frames tracked by the bitmap (the whole chosen region).
    total_frames: u64,
    free_count: u64,
    search_hint: usize,
    hhdm_offset: u64,
}

impl BitmapAllocatorInner {
    fn frame_addr(&self, index: u64) -> PhysAddr {
        PhysAddr::new(self.region_start.as_u64() + index * FRAME_SIZE)
    }

    fn index_of(&self, addr: PhysAddr) -> Option<u64> {
        let offset = addr.as_u64().checked_sub(self.region_start.as_u64())?;
        if offset % FRAME_SIZE != 0 {
            return None;
        }
        let index = offset / FRAME_SIZE;
        if index >= self.total_frames {
            return None;
        }
        Some(index)
    }

    fn set_bit(&mut self, index: u64, value: bool) {
        let word = (index / u64::from(BITS_PER_WORD)) as usize;
        let bit = (index % u64::from(BITS_PER_WORD)) as u32;
        if value {
            self.bitmap[word] |= 1u64 << bit;
        } else {
            self.bitmap[word] &= !(1u64 << bit);
        }
    }

    fn test_bit(&self, index: u64) -> bool {
        let word = (index / u64::from(BITS_PER_WORD)) as usize;
        let bit = (index % u64::from(BITS_PER_WORD)) as u32;
        self.bitmap[word] & (1u64 << bit) != 0
    }

    fn allocate_one(&mut self) -> Option<u64> {
        let word_count = self.bitmap.len();
        for offset in 0..word_count {
            let word_idx = (self.search_hint + offset) % word_count;
            let word = self.bitmap[word_idx];
            if word != u64::MAX {
                let bit = (!word).trailing_zeros();
                let index = word_idx as u64 * u64::from(BITS_PER_WORD) + u64::from(bit);
                if index >= self.total_frames {
                    continue;
                }
                self.bitmap[word_idx] |= 1u64 << bit;
                self.free_count -= 1;
                self.search_hint = word_idx;
                return Some(index);
            }
        }
        None
    }

    fn allocate_contiguous(&mut self, count: u64) -> Option<u64> {
        if count == 0 {
            return None;
        }
        if count == 1 {
            return self.allocate_one();
        }
        let mut run_start: Option<u64> = None;
        let mut run_len: u64 = 0;
        for index in 0..self.total_frames {
            if self.test_bit(index) {
                run_start = None;
                run_len = 0;
                continue;
            }
            if run_start.is_none() {
                run_start = Some(index);
                run_len = 0;
            }
            run_len += 1;
            if run_len == count {
                let start = run_start.unwrap();
                for i in start..start + count {
                    self.set_bit(i, true);
                }
                self.free_count -= count;
                return Some(start);
            }
        }
        None
    }
}

/// A bitmap-backed physical frame allocator over the single largest usable
/// memory region reported by the bootloader.
pub struct BitmapAllocator {
    inner: SpinLock<BitmapAllocatorInner>,
}

// SAFETY: all access to the bitmap goes through the inner SpinLock.
unsafe impl Send for BitmapAllocator {}
unsafe impl Sync for BitmapAllocator {}

impl BitmapAllocator {
    /// Builds an allocator over the largest usable region in `regions`.
    ///
    /// # Safety
    ///
    /// `hhdm_offset` must map all of physical memory at `hhdm_offset + addr`,
    /// and no other code may concurrently write the region chosen to host
    /// the bitmap.
    pub unsafe fn new(regions: &[PhysMemoryRegion], hhdm_offset: u64) -> Result<Self, PmmError> {
        let largest = regions
            .iter()
            .filter(|r| r.usable && r.size >= FRAME_SIZE)
            .max_by_key(|r| r.size)
            .ok_or(PmmError::NoBitmapRegion)?;

        let total_frames = largest.size / FRAME_SIZE;
        let bitmap_bytes = (total_frames as usize).div_ceil(8);
        let bitmap_words = bitmap_bytes.div_ceil(8);
        let bitmap_frames = ((bitmap_words * 8) as u64).div_ceil(FRAME_SIZE);

        if bitmap_frames >= total_frames {
            return Err(PmmError::NoBitmapRegion);
        }

        let region_start = largest.start;
        let bitmap_ptr = (hhdm_offset + region_start.as_u64()) as *mut u64;
        // SAFETY: the chosen region is usable RAM, HHDM-mapped, and large
        // enough to hold `bitmap_words` u64s (checked above).
        let bitmap = unsafe { slice::from_raw_parts_mut(bitmap_ptr, bitmap_words) };
        bitmap.fill(0);

        let mut inner = BitmapAllocatorInner {
            bitmap,
            region_start,
            total_frames,
            free_count: total_frames,
            search_hint: 0,
            hhdm_offset,
        };

        for index in 0..bitmap_frames {
            inner.set_bit(index, true);
            inner.free_count -= 1;
        }

        Ok(Self {
            inner: SpinLock::new(inner),
        })
    }

    /// Allocates a single frame, panicking if physical memory is exhausted.
    ///
    /// If `zero` is set, the frame is zeroed via its HHDM mapping before
    /// being returned.
    #[must_use]
    pub fn alloc(&self, zero: bool) -> PhysFrame<Size4KiB> {
        let mut inner = self.inner.lock();
        let index = inner.allocate_one().unwrap_or_else(|| {
            crate::error::set_kind(crate::error::PanicKind::ResourceExhaustion);
            panic!("physical memory exhausted: 0 frames free")
        });
        let addr = inner.frame_addr(index);
        let hhdm_offset = inner.hhdm_offset;
        drop(inner);
        if zero {
            // SAFETY: the frame was just reserved in the bitmap under the
            // lock above, so no one else can be writing it concurrently.
            unsafe { crate::mm::zero_frame((hhdm_offset + addr.as_u64()) as *mut u8) };
        }
        PhysFrame::from_start_address(addr).expect("frame address is frame-aligned by construction")
    }

    /// Allocates `count` contiguous frames, panicking if exhausted or if no
    /// contiguous run of that length exists.
    #[must_use]
    pub fn alloc_n(&self, count: u64, zero: bool) -> PhysFrame<Size4KiB> {
        let mut inner = self.inner.lock();
        let start_index = inner.allocate_contiguous(count).unwrap_or_else(|| {
            crate::error::set_kind(crate::error::PanicKind::ResourceExhaustion);
            panic!("physical memory exhausted: no contiguous run of {count} frames")
        });
        let addr = inner.frame_addr(start_index);
        let hhdm_offset = inner.hhdm_offset;
        drop(inner);
        if zero {
            for i in 0..count {
                // SAFETY: frames [start_index, start_index+count) were just
                // reserved under the lock above.
                unsafe {
                    crate::mm::zero_frame(
                        (hhdm_offset + addr.as_u64() + i * FRAME_SIZE) as *mut u8,
                    );
                };
            }
        }
        PhysFrame::from_start_address(addr).expect("frame address is frame-aligned by construction")
    }

    /// Returns a single frame to the allocator.
    ///
    /// # Safety
    ///
    /// `frame` must have been allocated by this allocator and must not be
    /// referenced anywhere else after this call. Freeing a frame twice, or
    /// a frame never allocated by this allocator, is undefined behaviour
    /// and is not checked.
    pub unsafe fn free(&self, frame: PhysFrame<Size4KiB>) {
        let mut inner = self.inner.lock();
        let Some(index) = inner.index_of(frame.start_address()) else {
            return;
        };
        inner.set_bit(index, false);
        inner.free_count += 1;
        let hhdm_offset = inner.hhdm_offset;
        drop(inner);
        if cfg!(hadron_debug_pmm_poison) {
            // SAFETY: the frame was just released and is no longer tracked
            // as allocated, and the caller guarantees exclusive access.
            unsafe { poison_page(frame.start_address(), hhdm_offset) };
        }
    }

    /// Returns `count` contiguous frames starting at `frame` to the allocator.
    ///
    /// # Safety
    ///
    /// Same obligations as [`free`](Self::free), extended to every frame in
    /// the range.
    pub unsafe fn free_n(&self, frame: PhysFrame<Size4KiB>, count: u64) {
        for i in 0..count {
            let f = frame + i;
            // SAFETY: caller's obligations extend to each frame in the run.
            unsafe { self.free(f) };
        }
    }

    /// Number of frames currently free.
    pub fn free_frames(&self) -> u64 {
        self.inner.lock().free_count
    }

    /// Total number of frames tracked by this allocator (the chosen region).
    pub fn total_frames(&self) -> u64 {
        self.inner.lock().total_frames
    }
}

/// Wrapper that implements `FrameAllocator`/`FrameDeallocator` for
/// `&BitmapAllocator`, so the global allocator can be threaded into APIs
/// that require `&mut impl FrameAllocator<Size4KiB>` without giving up
/// shared ownership.
pub struct BitmapFrameAllocRef<'a>(pub &'a BitmapAllocator);

unsafe impl FrameAllocator<Size4KiB> for BitmapFrameAllocRef<'_> {
    fn allocate_frame(&mut self) -> Option<PhysFrame<Size4KiB>> {
        Some(self.0.alloc(false))
    }
}

unsafe impl FrameDeallocator<Size4KiB> for BitmapFrameAllocRef<'_> {
    unsafe fn deallocate_frame(&mut self, frame: PhysFrame<Size4KiB>) {
        // SAFETY: forwarded to `BitmapAllocator::free`, same obligations.
        unsafe { self.0.free(frame) };
    }
}

static PMM: SpinLock<Option<BitmapAllocator>> = SpinLock::new(None);

/// Converts the bootloader memory map into `PhysMemoryRegion`s and builds
/// the global allocator.
///
/// # Panics
///
/// Panics if the PMM was already initialized, or if no usable region is
/// large enough to host the bitmap.
pub fn init(boot_info: &impl crate::boot::BootInfo) {
    let mut regions = [PhysMemoryRegion {
        start: PhysAddr::zero(),
        size: 0,
        usable: false,
    }; 256];
    let mut count = 0;
    for region in boot_info.memory_map() {
        if count >= regions.len() {
            break;
        }
        regions[count] = PhysMemoryRegion {
            start: region.start,
            size: region.size,
            usable: region.kind == crate::boot::MemoryRegionKind::Usable,
        };
        count += 1;
    }

    let hhdm_offset = boot_info.hhdm_offset();
    // SAFETY: `hhdm_offset` comes from the bootloader and maps all physical
    // memory; this runs once, before any other CPU is started.
    let allocator = unsafe { BitmapAllocator::new(&regions[..count], hhdm_offset) }
        .expect("no usable region large enough to host the frame bitmap");

    let mut pmm = PMM.lock();
    assert!(pmm.is_none(), "PMM already initialized");
    *pmm = Some(allocator);
}

/// Runs `f` with a reference to the global allocator.
///
/// # Panics
///
/// Panics if the PMM has not been initialized yet.
pub fn with_pmm<R>(f: impl FnOnce(&BitmapAllocator) -> R) -> R {
    let pmm = PMM.lock();
    f(pmm.as_ref().expect("PMM not initialized"))
}

/// Runs `f` with a reference to the global allocator, returning `None`
/// instead of panicking or blocking if the lock is contended or the PMM is
/// not yet initialized. Intended for use from fault handlers.
pub fn try_with_pmm<R>(f: impl FnOnce(&BitmapAllocator) -> R) -> Option<R> {
    let pmm = PMM.try_lock()?;
    Some(f(pmm.as_ref()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::alloc::Layout;

    struct HostRegion {
        ptr: *mut u8,
        layout: Layout,
    }

    impl HostRegion {
        fn new(size: usize) -> Self {
            let layout = Layout::from_size_align(size, FRAME_SIZE as usize).unwrap();
            // SAFETY: layout is non-zero sized and page-aligned.
            let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
            assert!(!ptr.is_null());
            Self { ptr, layout }
        }

        fn phys_addr(&self) -> PhysAddr {
            PhysAddr::new(self.ptr as u64)
        }
    }

    impl Drop for HostRegion {
        fn drop(&mut self) {
            // SAFETY: `ptr`/`layout` match the allocation in `new`.
            unsafe { std::alloc::dealloc(self.ptr, self.layout) };
        }
    }

    fn make_allocator(region_frames: u64) -> (HostRegion, BitmapAllocator) {
        let region = HostRegion::new((region_frames * FRAME_SIZE) as usize);
        let regions = [PhysMemoryRegion {
            start: region.phys_addr(),
            size: region_frames * FRAME_SIZE,
            usable: true,
        }];
        // SAFETY: hhdm_offset of 0 means "identity mapped"; the host
        // region really is at that address in our own address space.
        let allocator = unsafe { BitmapAllocator::new(&regions, 0) }.unwrap();
        (region, allocator)
    }

    #[test]
    fn allocations_are_unique_and_in_region() {
        let (region, allocator) = make_allocator(64);
        let region_start = region.phys_addr().as_u64();
        let region_end = region_start + 64 * FRAME_SIZE;

        let mut seen = std::collections::HashSet::new();
        for _ in 0..allocator.free_frames() {
            let frame = allocator.alloc(false);
            let addr = frame.start_address().as_u64();
            assert!(addr >= region_start && addr < region_end, "frame out of region");
            assert!(seen.insert(addr), "frame handed out twice: {addr:#x}");
        }
    }

    #[test]
    fn free_and_realloc_returns_same_frame_set() {
        let (_region, allocator) = make_allocator(16);
        let a = allocator.alloc(false);
        let b = allocator.alloc(false);
        // SAFETY: both frames were allocated by `allocator` and are unused.
        unsafe {
            allocator.free(a);
            allocator.free(b);
        }
        let mut reallocated = std::collections::HashSet::new();
        reallocated.insert(allocator.alloc(false).start_address().as_u64());
        reallocated.insert(allocator.alloc(false).start_address().as_u64());
        assert!(reallocated.contains(&a.start_address().as_u64()));
        assert!(reallocated.contains(&b.start_address().as_u64()));
    }

    #[test]
    #[should_panic(expected = "exhausted")]
    fn exhaustion_panics_instead_of_returning_none() {
        let (_region, allocator) = make_allocator(2);
        let _a = allocator.alloc(false);
        let _b = allocator.alloc(false);
        let _c = allocator.alloc(false); // panics: region only has 2 frames
    }

    #[test]
    fn zeroing_clears_frame_contents() {
        let (_region, allocator) = make_allocator(4);
        let frame = allocator.alloc(false);
        // SAFETY: frame is allocated and exclusively owned by this test.
        unsafe {
            let ptr = frame.start_address().as_u64() as *mut u8;
            core::ptr::write_bytes(ptr, 0xAA, FRAME_SIZE as usize);
            allocator.free(frame);
        }
        let frame2 = allocator.alloc(true);
        assert_eq!(frame2.start_address(), frame.start_address());
        // SAFETY: frame2 is allocated and exclusively owned by this test.
        unsafe {
            let ptr = frame2.start_address().as_u64() as *const u8;
            for i in 0..FRAME_SIZE as usize {
                assert_eq!(*ptr.add(i), 0, "byte {i} not zeroed");
            }
        }
    }

    #[test]
    fn contiguous_allocation_is_actually_contiguous() {
        let (_region, allocator) = make_allocator(32);
        let frame = allocator.alloc_n(8, false);
        let start = frame.start_address().as_u64();
        for i in 0..8 {
            let f = frame + i;
            assert_eq!(f.start_address().as_u64(), start + i * FRAME_SIZE);
        }
    }

    #[test]
    fn poison_roundtrip() {
        let region = HostRegion::new(FRAME_SIZE as usize);
        let addr = region.phys_addr();
        // SAFETY: region is exclusively owned by this test and page-sized.
        unsafe {
            poison_page(addr, 0);
            assert!(check_page_poison(addr, 0));
            core::ptr::write_volatile(addr.as_u64() as *mut u8, 0);
            assert!(!check_page_poison(addr, 0));
        }
    }
}
