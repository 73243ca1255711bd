//! Per-CPU state (SMP-ready).
//!
//! Each CPU's `Cpu` record lives at a fixed `#[repr(C)]` offset reachable
//! through `GS:[0]` (a self-pointer, set once at bring-up) so assembly
//! trampolines can get at it without depending on Rust struct layout at the
//! call site. `current_cpu()` is a thin `asm!("mov {}, gs:[0]", ...)`
//! wrapper. The BSP uses a static instance; APs allocate theirs on the heap
//! during bring-up and are leaked, since they live for the kernel's entire
//! uptime.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};

use crate::id::CpuId;
use crate::sched::thread::Thread;
use crate::sync::IrqSpinLock;

/// Per-CPU record.
///
/// `#[repr(C)]` with `self_ptr` first: `current_cpu()` reads `GS:[0]`, which
/// is this struct's own address written into its first field during
/// bring-up (`GS_BASE` is set to the same address, so the read is really
/// "dereference my own base").
#[repr(C)]
pub struct Cpu {
    self_ptr: u64,
    id: AtomicU32,
    acpi_id: AtomicU32,
    lapic_id: AtomicU8,
    /// Virtual address of this CPU's mapped Local APIC MMIO region. Zero
    /// until ACPI/MP bring-up maps it.
    lapic_mmio: AtomicU64,
    /// Virtual address of this CPU's Task State Segment.
    ///
    /// All CPUs currently share one TSS (see `arch::x86_64::gdt`); this
    /// field stores that shared address rather than a per-CPU one. A genuine
    /// per-CPU TSS only matters once ring-3 transitions exist, which this
    /// kernel never performs.
    tss: AtomicU64,
    /// LAPIC timer ticks per millisecond, measured once at bring-up against
    /// the HPET/PIT. Used to convert [`crate::config::TIMESLICE_NS`] into a
    /// one-shot initial-count value.
    lapic_calibration_ticks: AtomicU64,
    cpuid_max_basic: AtomicU32,
    cpuid_max_extended: AtomicU32,
    /// The thread currently running on this CPU, or null before the
    /// scheduler has started here.
    current_thread: core::sync::atomic::AtomicPtr<Thread>,
    /// Threads ready to run on this CPU.
    pub run_queue: IrqSpinLock<crate::sched::thread::ThreadQueue>,
    /// Threads that have exited on this CPU, awaiting the reaper.
    pub dead_queue: IrqSpinLock<crate::sched::thread::ThreadQueue>,
    interrupts_enabled: AtomicBool,
    initialized: AtomicBool,
}

impl Cpu {
    /// Creates a new, uninitialized `Cpu` record.
    pub const fn new() -> Self {
        Self {
            self_ptr: 0,
            id: AtomicU32::new(0),
            acpi_id: AtomicU32::new(0),
            lapic_id: AtomicU8::new(0),
            lapic_mmio: AtomicU64::new(0),
            tss: AtomicU64::new(0),
            lapic_calibration_ticks: AtomicU64::new(0),
            cpuid_max_basic: AtomicU32::new(0),
            cpuid_max_extended: AtomicU32::new(0),
            current_thread: core::sync::atomic::AtomicPtr::new(core::ptr::null_mut()),
            run_queue: IrqSpinLock::new(crate::sched::thread::ThreadQueue::new()),
            dead_queue: IrqSpinLock::new(crate::sched::thread::ThreadQueue::new()),
            interrupts_enabled: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
        }
    }

    /// Records this CPU's logical id and LAPIC id. Called once during
    /// bring-up (BSP: from ACPI init; AP: from its own bootstrap).
    pub fn init(&self, cpu_id: CpuId, lapic_id: u8) {
        self.id.store(cpu_id.as_u32(), Ordering::Relaxed);
        self.lapic_id.store(lapic_id, Ordering::Relaxed);
        self.initialized.store(true, Ordering::Release);

        // SAFETY: every `Cpu` is either the `'static BSP_CPU` or a
        // heap-allocated record leaked for the kernel's entire uptime, so
        // extending its lifetime here is sound.
        let static_self: &'static Cpu = unsafe { &*(self as *const Cpu) };
        register_cpu(cpu_id, static_self);
    }

    pub fn get_cpu_id(&self) -> CpuId {
        CpuId::new(self.id.load(Ordering::Relaxed))
    }

    pub fn get_apic_id(&self) -> u8 {
        self.lapic_id.load(Ordering::Relaxed)
    }

    pub fn set_acpi_id(&self, acpi_id: u32) {
        self.acpi_id.store(acpi_id, Ordering::Relaxed);
    }

    pub fn acpi_id(&self) -> u32 {
        self.acpi_id.load(Ordering::Relaxed)
    }

    pub fn set_lapic_mmio(&self, virt: u64) {
        self.lapic_mmio.store(virt, Ordering::Release);
    }

    pub fn lapic_mmio(&self) -> Option<u64> {
        match self.lapic_mmio.load(Ordering::Acquire) {
            0 => None,
            addr => Some(addr),
        }
    }

    pub fn set_tss_addr(&self, virt: u64) {
        self.tss.store(virt, Ordering::Release);
    }

    pub fn set_lapic_calibration_ticks(&self, ticks_per_ms: u64) {
        self.lapic_calibration_ticks
            .store(ticks_per_ms, Ordering::Release);
    }

    pub fn lapic_calibration_ticks(&self) -> u64 {
        self.lapic_calibration_ticks.load(Ordering::Acquire)
    }

    pub fn set_cpuid_max(&self, basic: u32, extended: u32) {
        self.cpuid_max_basic.store(basic, Ordering::Relaxed);
        self.cpuid_max_extended.store(extended, Ordering::Relaxed);
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Returns the thread currently running on this CPU, if the scheduler
    /// has started here.
    pub fn current_thread(&self) -> *mut Thread {
        self.current_thread.load(Ordering::Acquire)
    }

    pub fn set_current_thread(&self, thread: *mut Thread) {
        self.current_thread.store(thread, Ordering::Release);
    }

    /// Atomically disables interrupts, swaps the recorded "interrupts
    /// enabled" flag to `enabled`, re-enables if `enabled` is true, and
    /// returns the previous value.
    ///
    /// IRQ-saving spinlocks snapshot and restore this flag around their
    /// critical sections instead of raw CLI/STI, so nested critical
    /// sections don't clobber each other's enable state.
    pub fn set_interrupts(&self, enabled: bool) -> bool {
        crate::arch::x86_64::instructions::interrupts::disable();
        let previous = self.interrupts_enabled.swap(enabled, Ordering::AcqRel);
        if enabled {
            // SAFETY: the IDT is fully configured by the time any code
            // calls set_interrupts(true).
            unsafe { crate::arch::x86_64::instructions::interrupts::enable() };
        }
        previous
    }
}

// SAFETY: every field is either atomic or a lock-protected queue; the only
// non-atomic access (`self_ptr`) is write-once during bring-up, before the
// record is reachable from any other CPU.
unsafe impl Sync for Cpu {}

/// BSP per-CPU data (single static instance for BSP).
static mut BSP_CPU: Cpu = Cpu::new();

/// Number of online CPUs.
static CPU_COUNT: AtomicU32 = AtomicU32::new(1);

/// Table of every online CPU's `Cpu` record, indexed by logical id.
///
/// Populated as each CPU comes up (`register_cpu`) so the scheduler can
/// enqueue a new thread onto a CPU other than the one creating it. AP
/// records are heap-allocated and leaked by `arch::x86_64::smp` before being
/// registered here.
static CPU_TABLE: [core::sync::atomic::AtomicPtr<Cpu>; MAX_CPUS] = {
    const NULL: core::sync::atomic::AtomicPtr<Cpu> =
        core::sync::atomic::AtomicPtr::new(core::ptr::null_mut());
    [NULL; MAX_CPUS]
};

/// Registers `cpu` as the per-CPU record for logical id `cpu_id`.
///
/// Called once per CPU during bring-up, after `Cpu::init` has stamped its
/// id. Safe to call from the CPU itself or from whoever is driving its
/// bring-up (the BSP, for APs).
pub fn register_cpu(cpu_id: CpuId, cpu: &'static Cpu) {
    CPU_TABLE[cpu_id.as_u32() as usize].store(cpu as *const Cpu as *mut Cpu, Ordering::Release);
}

/// Looks up a CPU's per-CPU record by logical id. Returns `None` if that CPU
/// has not registered yet (or `cpu_id` is out of range).
pub fn cpu_by_id(cpu_id: CpuId) -> Option<&'static Cpu> {
    let idx = cpu_id.as_u32() as usize;
    if idx >= MAX_CPUS {
        return None;
    }
    let ptr = CPU_TABLE[idx].load(Ordering::Acquire);
    // SAFETY: pointers stored here always come from `register_cpu`, passed a
    // `'static` reference to a `Cpu` that is never deallocated.
    unsafe { ptr.as_ref() }
}

/// Set once [`init_gs_base`] (BSP) or an AP's bootstrap has run. Lets code
/// that may execute before per-CPU state exists (early panics) check before
/// calling [`current_cpu`], which would otherwise dereference a null
/// `GS_BASE`.
static PERCPU_READY: AtomicBool = AtomicBool::new(false);

/// Returns whether per-CPU state is safe to access via [`current_cpu`].
pub fn is_ready() -> bool {
    PERCPU_READY.load(Ordering::Acquire)
}

/// Returns the number of online CPUs.
pub fn cpu_count() -> u32 {
    CPU_COUNT.load(Ordering::Acquire)
}

/// Sets the number of online CPUs.
pub fn set_cpu_count(count: u32) {
    CPU_COUNT.store(count, Ordering::Release);
}

/// Returns a reference to the current CPU's per-CPU data.
///
/// Reads the self-pointer from `GS:[0]`, which was set during bring-up.
#[cfg(target_arch = "x86_64")]
pub fn current_cpu() -> &'static Cpu {
    let ptr: u64;
    // SAFETY: GS:[0] holds `self_ptr`, which was set to this struct's own
    // address during `init_gs_base` (BSP) or AP bootstrap. Lock-free and
    // always valid once bring-up has run.
    unsafe {
        core::arch::asm!("mov {}, gs:[0]", out(reg) ptr, options(readonly, nostack));
        &*(ptr as *const Cpu)
    }
}

/// Initializes GS-base MSRs to point to the BSP per-CPU data.
///
/// Sets both `IA32_GS_BASE` and `IA32_KERNEL_GS_BASE` to `&BSP_CPU`, and
/// writes `self_ptr` so `current_cpu()` works via `GS:[0]`. Both MSRs get
/// the same value so `swapgs` is a no-op from ring 0 — correct before any
/// ring-3 transition exists.
///
/// # Safety
///
/// Must be called exactly once, on the bootstrap processor.
#[cfg(target_arch = "x86_64")]
pub unsafe fn init_gs_base() {
    use crate::arch::x86_64::registers::model_specific::{IA32_GS_BASE, IA32_KERNEL_GS_BASE};

    let cpu_addr = core::ptr::addr_of!(BSP_CPU) as u64;

    // SAFETY: BSP_CPU is a module-level static; addr_of_mut! is valid, and
    // nothing else reads it before this store (the caller's contract).
    unsafe {
        let cpu_ptr = core::ptr::addr_of_mut!(BSP_CPU);
        (*cpu_ptr).self_ptr = cpu_addr;

        IA32_GS_BASE.write(cpu_addr);
        IA32_KERNEL_GS_BASE.write(cpu_addr);
    }

    PERCPU_READY.store(true, Ordering::Release);

    crate::klog_debug!("GS base initialized: cpu={:#x}", cpu_addr);
}

/// Brings up per-CPU state for the bootstrap processor.
///
/// Points `GS_BASE`/`KERNEL_GS_BASE` at [`BSP_CPU`] so [`current_cpu`]
/// works. Must run after GDT/IDT init and before anything calls
/// `current_cpu()` — in particular before ACPI bring-up, which records the
/// BSP's APIC id via `current_cpu().init(..)`.
///
/// # Safety
///
/// Must be called exactly once, on the bootstrap processor, before any
/// other CPU is started.
#[cfg(target_arch = "x86_64")]
pub unsafe fn init_bsp() {
    // SAFETY: forwarded from the caller's contract.
    unsafe { init_gs_base() };
}

/// Points GS-base MSRs at an AP's own `Cpu` record.
///
/// Mirrors [`init_gs_base`] for a CPU that isn't the BSP: writes `self_ptr`
/// and both GS-base MSRs to `cpu`'s address.
///
/// # Safety
///
/// Must be called exactly once per AP, on that AP, before anything on it
/// calls [`current_cpu`].
#[cfg(target_arch = "x86_64")]
pub unsafe fn init_ap(cpu: &'static Cpu) {
    use crate::arch::x86_64::registers::model_specific::{IA32_GS_BASE, IA32_KERNEL_GS_BASE};

    let cpu_addr = cpu as *const Cpu as u64;

    // SAFETY: cpu is a valid, leaked Cpu record reachable only from this AP
    // at this point in bring-up.
    unsafe {
        let cpu_ptr = cpu as *const Cpu as *mut Cpu;
        (*cpu_ptr).self_ptr = cpu_addr;

        IA32_GS_BASE.write(cpu_addr);
        IA32_KERNEL_GS_BASE.write(cpu_addr);
    }
}

/// Maximum supported CPUs (from Kconfig).
pub use crate::config::MAX_CPUS;

/// CPU-local storage. Wraps `[T; MAX_CPUS]`, indexed by current CPU id.
pub struct CpuLocal<T> {
    data: [T; MAX_CPUS],
}

impl<T> CpuLocal<T> {
    pub const fn new(data: [T; MAX_CPUS]) -> Self {
        Self { data }
    }

    #[cfg(target_arch = "x86_64")]
    pub fn get(&self) -> &T {
        &self.data[current_cpu().get_cpu_id().as_u32() as usize]
    }

    #[cfg(not(target_arch = "x86_64"))]
    pub fn get(&self) -> &T {
        &self.data[0]
    }

    pub fn get_for(&self, cpu_id: CpuId) -> &T {
        &self.data[cpu_id.as_u32() as usize]
    }
}

// SAFETY: CpuLocal<T> is designed for per-CPU access; each CPU only
// accesses its own slot.
unsafe impl<T: Send> Send for CpuLocal<T> {}
unsafe impl<T: Send> Sync for CpuLocal<T> {}
