//! Bootloader-agnostic boot information and kernel entry point.
//!
//! [`BootInfo`] abstracts over whatever structures the boot stub (Limine,
//! in this tree) hands the kernel, so [`kernel_init`] never touches
//! bootloader-native types directly.

use crate::addr::{PhysAddr, VirtAddr};

/// The kind of a physical memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryRegionKind {
    /// Normal usable RAM.
    Usable,
    /// Reserved by firmware or hardware.
    Reserved,
    /// ACPI tables that can be reclaimed after parsing.
    AcpiReclaimable,
    /// ACPI Non-Volatile Storage — must not be used.
    AcpiNvs,
    /// Defective physical memory.
    BadMemory,
    /// Memory used by the bootloader, reclaimable after boot.
    BootloaderReclaimable,
    /// Memory occupied by the kernel image and loaded modules.
    KernelAndModules,
    /// Memory-mapped framebuffer region.
    Framebuffer,
}

/// A contiguous physical memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    /// Physical start address.
    pub start: PhysAddr,
    /// Size in bytes.
    pub size: u64,
    /// Kind of memory region.
    pub kind: MemoryRegionKind,
}

const EMPTY_REGION: MemoryRegion = MemoryRegion {
    start: PhysAddr::zero(),
    size: 0,
    kind: MemoryRegionKind::Reserved,
};

/// Pixel format of a framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 32-bit RGB (red at lowest byte offset).
    Rgb32,
    /// 32-bit BGR (blue at lowest byte offset).
    Bgr32,
}

/// Information about a linear framebuffer.
#[derive(Debug, Clone, Copy)]
pub struct FramebufferInfo {
    /// Virtual address of the framebuffer (HHDM-mapped).
    pub address: VirtAddr,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Bytes per scanline.
    pub pitch: u32,
    /// Bits per pixel.
    pub bpp: u8,
    /// Pixel format.
    pub pixel_format: PixelFormat,
}

const EMPTY_FRAMEBUFFER: FramebufferInfo = FramebufferInfo {
    address: VirtAddr::zero(),
    width: 0,
    height: 0,
    pitch: 0,
    bpp: 0,
    pixel_format: PixelFormat::Rgb32,
};

/// Physical and virtual base addresses of the loaded kernel image.
#[derive(Debug, Clone, Copy)]
pub struct KernelAddressInfo {
    /// Physical base address of the kernel.
    pub physical_base: PhysAddr,
    /// Virtual base address of the kernel.
    pub virtual_base: VirtAddr,
}

/// Physical address and size of the backtrace symbol table module, if the
/// boot stub loaded one.
#[derive(Debug, Clone, Copy)]
pub struct BacktraceInfo {
    /// Physical address of the symbol data in memory.
    pub phys_addr: PhysAddr,
    /// Size of the symbol data in bytes.
    pub size: u64,
}

/// Maximum number of memory regions the kernel can store.
pub const MAX_MEMORY_REGIONS: usize = 256;

/// Maximum number of framebuffers the kernel can store.
pub const MAX_FRAMEBUFFERS: usize = 4;

/// Maximum number of SMP CPUs the boot info can describe.
pub const MAX_SMP_CPUS: usize = crate::config::MAX_CPUS;

/// Information about a single CPU for SMP bootstrap.
///
/// `goto_address_ptr` and `extra_argument_ptr` point into bootloader-owned
/// memory; writing the entry address to `goto_address_ptr` (after writing
/// `extra_argument_ptr`) atomically starts the AP.
#[derive(Debug, Clone, Copy)]
pub struct SmpCpuEntry {
    /// Bootloader-assigned processor ID.
    pub processor_id: u32,
    /// Local APIC ID.
    pub lapic_id: u32,
    /// Pointer to the goto_address field in bootloader-owned memory.
    pub goto_address_ptr: *mut u64,
    /// Pointer to the extra_argument field in bootloader-owned memory.
    pub extra_argument_ptr: *mut u64,
}

const EMPTY_SMP_ENTRY: SmpCpuEntry = SmpCpuEntry {
    processor_id: 0,
    lapic_id: 0,
    goto_address_ptr: core::ptr::null_mut(),
    extra_argument_ptr: core::ptr::null_mut(),
};

// SAFETY: the pointers reference bootloader-owned memory reachable from
// any CPU via the HHDM mapping.
unsafe impl Send for SmpCpuEntry {}
unsafe impl Sync for SmpCpuEntry {}

impl SmpCpuEntry {
    /// Starts this AP by writing the extra argument and then the entry address.
    ///
    /// # Safety
    ///
    /// - `entry` must be the address of a valid `extern "C" fn(u64, u64) -> !`.
    /// - `extra` is passed to the entry function.
    /// - The pointed-to bootloader memory must still be valid and mapped.
    pub unsafe fn start(&self, entry: usize, extra: u64) {
        use core::sync::atomic::{Ordering, fence};
        // SAFETY: caller guarantees the pointers are still valid.
        unsafe {
            core::ptr::write_volatile(self.extra_argument_ptr, extra);
            fence(Ordering::Release);
            core::ptr::write_volatile(self.goto_address_ptr, entry as u64);
        }
    }
}

/// Bootloader-agnostic boot information.
///
/// The boot stub converts its native structures into these canonical types
/// before calling [`kernel_init`].
pub trait BootInfo {
    /// Physical memory map, sorted by start address.
    fn memory_map(&self) -> &[MemoryRegion];

    /// HHDM offset: `virtual = physical + hhdm_offset()`.
    fn hhdm_offset(&self) -> u64;

    /// Kernel load addresses (physical and virtual base).
    fn kernel_address(&self) -> KernelAddressInfo;

    /// All available framebuffers.
    fn framebuffers(&self) -> &[FramebufferInfo];

    /// ACPI RSDP physical address, if available.
    fn rsdp_address(&self) -> Option<PhysAddr>;

    /// Kernel command line, if any.
    fn command_line(&self) -> Option<&str>;

    /// Physical address of the bootstrap PML4.
    fn page_table_root(&self) -> PhysAddr;

    /// Backtrace symbol data, if loaded by the boot stub.
    fn backtrace(&self) -> Option<BacktraceInfo>;

    /// SMP CPU entries for AP bootstrap. Empty if single-processor.
    fn smp_cpus(&self) -> &[SmpCpuEntry];

    /// BSP Local APIC ID.
    fn bsp_lapic_id(&self) -> u32;
}

/// A concrete, fixed-capacity container for boot information, populated by
/// the boot stub before any heap allocator exists.
pub struct BootInfoData {
    /// Physical memory map.
    pub memory_map: [MemoryRegion; MAX_MEMORY_REGIONS],
    /// Number of valid entries in `memory_map`.
    pub memory_map_len: usize,
    /// HHDM offset.
    pub hhdm_offset: u64,
    /// Kernel load addresses.
    pub kernel_address: KernelAddressInfo,
    /// Available framebuffers.
    pub framebuffers: [FramebufferInfo; MAX_FRAMEBUFFERS],
    /// Number of valid entries in `framebuffers`.
    pub framebuffers_len: usize,
    /// ACPI RSDP physical address.
    pub rsdp_address: Option<PhysAddr>,
    /// Kernel command line.
    pub command_line: Option<&'static str>,
    /// Physical address of the bootstrap PML4.
    pub page_table_root: PhysAddr,
    /// Backtrace symbol data, if loaded by the boot stub.
    pub backtrace: Option<BacktraceInfo>,
    /// SMP CPU entries for AP bootstrap.
    pub smp_cpus: [SmpCpuEntry; MAX_SMP_CPUS],
    /// Number of valid entries in `smp_cpus`.
    pub smp_cpus_len: usize,
    /// BSP Local APIC ID.
    pub bsp_lapic_id: u32,
}

impl BootInfoData {
    /// An empty, all-zero boot info, to be filled in by the boot stub.
    pub const fn empty() -> Self {
        Self {
            memory_map: [EMPTY_REGION; MAX_MEMORY_REGIONS],
            memory_map_len: 0,
            hhdm_offset: 0,
            kernel_address: KernelAddressInfo {
                physical_base: PhysAddr::zero(),
                virtual_base: VirtAddr::zero(),
            },
            framebuffers: [EMPTY_FRAMEBUFFER; MAX_FRAMEBUFFERS],
            framebuffers_len: 0,
            rsdp_address: None,
            command_line: None,
            page_table_root: PhysAddr::zero(),
            backtrace: None,
            smp_cpus: [EMPTY_SMP_ENTRY; MAX_SMP_CPUS],
            smp_cpus_len: 0,
            bsp_lapic_id: 0,
        }
    }

    /// Appends a memory region, silently dropping it if `memory_map` is full.
    pub fn push_region(&mut self, region: MemoryRegion) {
        if self.memory_map_len < self.memory_map.len() {
            self.memory_map[self.memory_map_len] = region;
            self.memory_map_len += 1;
        }
    }

    /// Appends an SMP entry, silently dropping it if `smp_cpus` is full.
    pub fn push_smp_cpu(&mut self, entry: SmpCpuEntry) {
        if self.smp_cpus_len < self.smp_cpus.len() {
            self.smp_cpus[self.smp_cpus_len] = entry;
            self.smp_cpus_len += 1;
        }
    }
}

impl BootInfo for BootInfoData {
    fn memory_map(&self) -> &[MemoryRegion] {
        &self.memory_map[..self.memory_map_len]
    }

    fn hhdm_offset(&self) -> u64 {
        self.hhdm_offset
    }

    fn kernel_address(&self) -> KernelAddressInfo {
        self.kernel_address
    }

    fn framebuffers(&self) -> &[FramebufferInfo] {
        &self.framebuffers[..self.framebuffers_len]
    }

    fn rsdp_address(&self) -> Option<PhysAddr> {
        self.rsdp_address
    }

    fn command_line(&self) -> Option<&str> {
        self.command_line
    }

    fn page_table_root(&self) -> PhysAddr {
        self.page_table_root
    }

    fn backtrace(&self) -> Option<BacktraceInfo> {
        self.backtrace
    }

    fn smp_cpus(&self) -> &[SmpCpuEntry] {
        &self.smp_cpus[..self.smp_cpus_len]
    }

    fn bsp_lapic_id(&self) -> u32 {
        self.bsp_lapic_id
    }
}

/// Kernel entry point, called once by the boot stub on the bootstrap
/// processor.
///
/// Brings up memory management, logging, interrupts, and the scheduler in
/// dependency order, then hands control to the scheduler's idle loop —
/// this call never returns.
pub fn kernel_init(boot_info: &impl BootInfo) -> ! {
    crate::log::init_early();
    crate::klog_info!("boot: hhdm offset {:#x}", boot_info.hhdm_offset());

    if let Some(bt) = boot_info.backtrace() {
        let virt = crate::addr::VirtAddr::new(boot_info.hhdm_offset() + bt.phys_addr.as_u64());
        // SAFETY: the boot stub loaded the symbol table into contiguous
        // physical memory covered by the HHDM, and it is never reclaimed.
        let data =
            unsafe { core::slice::from_raw_parts(virt.as_u64() as *const u8, bt.size as usize) };
        crate::backtrace::init(data, boot_info.kernel_address().virtual_base.as_u64());
    }

    crate::mm::pmm::init(boot_info);
    crate::mm::pmm::with_pmm(|pmm| {
        crate::klog_info!(
            "pmm: {} MiB free / {} MiB total",
            pmm.free_frames() * 4 / 1024,
            pmm.total_frames() * 4 / 1024
        );
    });

    crate::mm::vmm::init(boot_info);
    crate::mm::heap::init();
    crate::klog_info!("heap: {} KiB mapped", crate::config::KERNEL_HEAP_SIZE / 1024);

    crate::log::init_logger();

    // SAFETY: called exactly once, after the heap and logger are up, before
    // interrupts are enabled.
    unsafe {
        crate::arch::x86_64::gdt::init();
        crate::arch::x86_64::idt::init();
        crate::percpu::init_bsp();
    }
    crate::panic::init();
    crate::arch::x86_64::acpi::init(boot_info);

    crate::sched::init();

    if let Some(rsdp) = boot_info.rsdp_address() {
        crate::klog_info!("acpi: rsdp at {}", rsdp);
        crate::arch::x86_64::smp::boot_aps(boot_info);
    }

    crate::klog_info!("kernel initialized");

    // SAFETY: IDT, GDT, APIC, per-CPU state, and the scheduler are all
    // initialized at this point.
    unsafe { crate::arch::x86_64::instructions::enable_interrupts() };

    crate::sched::idle_loop()
}
