//! SMP bootstrap: boots Application Processors (APs) using bootloader MP data.
//!
//! AP startup uses a two-phase approach:
//!
//! **Phase 1 — Parking (boot stub):** The boot stub calls [`park_aps`] right
//! after switching CR3 to the kernel page tables. This starts each AP via
//! Limine's `goto_address` mechanism, but sends them to a parking function
//! ([`ap_early_park`]) that immediately switches the AP's CR3 to the kernel
//! page tables and spins. This prevents APs from crashing in Limine's spin
//! loop when the BSP's kernel init modifies memory layouts.
//!
//! **Phase 2 — Initialization (kernel_init):** The BSP calls [`boot_aps`]
//! after platform init. It allocates a [`Cpu`] record for each AP, stores
//! its address in a shared table, and releases the parked APs. Each AP then
//! completes its own bring-up (GS base, GDT, IDT, LAPIC, scheduler) and
//! enters the scheduler's idle loop.

extern crate alloc;

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use alloc::boxed::Box;

use crate::arch::x86_64::hw::local_apic::LocalApic;
use crate::id::CpuId;
use crate::percpu::{self, Cpu, MAX_CPUS};

use crate::boot::{BootInfo, SmpCpuEntry};

// ---------------------------------------------------------------------------
// Phase 1: AP parking (called from boot stub before kernel_init)
// ---------------------------------------------------------------------------

/// Kernel CR3 value for APs to switch to when parking.
static AP_KERNEL_CR3: AtomicU64 = AtomicU64::new(0);

/// Number of APs that have parked (switched to kernel page tables).
static AP_PARKED_COUNT: AtomicU32 = AtomicU32::new(0);

/// Flag set by `boot_aps` to release parked APs for full initialization.
static AP_RELEASE: AtomicBool = AtomicBool::new(false);

/// Per-AP `Cpu` addresses, indexed by LAPIC ID. Written by `boot_aps`, read
/// by parked APs after release.
static AP_PERCPU_TABLE: [AtomicU64; MAX_CPUS] = {
    const ZERO: AtomicU64 = AtomicU64::new(0);
    [ZERO; MAX_CPUS]
};

/// Parks all APs on kernel page tables immediately after the CR3 switch.
///
/// Called by the boot stub (hadron-boot-limine) right after switching the
/// BSP's CR3 to the kernel-owned page tables. For each AP, this writes the
/// parking trampoline address to Limine's `goto_address`, causing the AP to
/// leave Limine's spin loop and switch to the kernel page tables.
///
/// After this function returns, all APs are safely parked with kernel CR3
/// and will remain spinning until [`boot_aps`] releases them.
///
/// # Arguments
///
/// * `smp_cpus` — AP entries from the Limine MP response (BSP excluded)
/// * `kernel_cr3` — Physical address of the kernel PML4
pub fn park_aps(smp_cpus: &[SmpCpuEntry], kernel_cr3: u64) {
    let ap_count = smp_cpus.len();
    if ap_count == 0 {
        return;
    }

    // Store kernel CR3 so APs can read it in the parking trampoline.
    AP_KERNEL_CR3.store(kernel_cr3, Ordering::Release);

    // Start each AP with the parking trampoline.
    for cpu_entry in smp_cpus {
        // SAFETY: The boot stub has just switched CR3 and the Limine MP info
        // memory is still valid and mapped via HHDM. ap_early_park is a valid
        // entry point matching Limine's calling convention.
        unsafe {
            cpu_entry.start(ap_early_park as *const () as usize, 0);
        }
    }

    // Wait for all APs to park (with timeout).
    let expected = ap_count as u32;
    let mut spin_count = 0u64;
    const PARK_TIMEOUT: u64 = 100_000_000;

    while AP_PARKED_COUNT.load(Ordering::Acquire) < expected {
        core::hint::spin_loop();
        spin_count += 1;
        if spin_count >= PARK_TIMEOUT {
            crate::klog_warn!(
                "SMP: Timeout parking APs ({}/{} parked)",
                AP_PARKED_COUNT.load(Ordering::Acquire),
                expected
            );
            break;
        }
    }

    let parked = AP_PARKED_COUNT.load(Ordering::Acquire);
    crate::klog_info!("SMP: {} APs parked on kernel page tables", parked);
}

/// AP parking trampoline. Limine calls this with RDI = MpInfo*, RSI = extra_argument.
///
/// Immediately switches CR3 to the kernel page tables, parks the AP in a spin
/// loop, and waits for `boot_aps` to release it with per-CPU data.
extern "C" fn ap_early_park(mp_info: u64, _extra: u64) -> ! {
    // 1. Switch to kernel page tables immediately.
    // SAFETY: AP_KERNEL_CR3 was stored with Release before starting this AP.
    // The kernel page tables are valid and map the HHDM, kernel image, and
    // the Limine stack this AP is using.
    let cr3 = AP_KERNEL_CR3.load(Ordering::Acquire);
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
    }

    // 2. Read our LAPIC ID from the MpInfo struct (offset 4: lapic_id field).
    // SAFETY: mp_info points to a valid MpInfo in bootloader memory, which is
    // still accessible via HHDM in the kernel page tables.
    let lapic_id = unsafe { *((mp_info as *const u8).add(4) as *const u32) };

    // 3. Signal BSP that we are parked.
    AP_PARKED_COUNT.fetch_add(1, Ordering::Release);

    // 4. Spin until boot_aps releases us.
    while !AP_RELEASE.load(Ordering::Acquire) {
        core::hint::spin_loop();
    }

    // 5. Read our Cpu record's address from the shared table.
    let percpu_addr = AP_PERCPU_TABLE[lapic_id as usize].load(Ordering::Acquire);
    assert!(percpu_addr != 0, "AP released without a Cpu record");

    // 6. Continue with full AP initialization.
    // SAFETY: percpu_addr was set by boot_aps and points to a valid, leaked
    // Cpu record. This function never returns.
    ap_entry(percpu_addr);
}

// ---------------------------------------------------------------------------
// Phase 2: AP initialization (called from kernel_init)
// ---------------------------------------------------------------------------

/// Counter of APs that have completed full initialization.
static AP_READY_COUNT: AtomicU32 = AtomicU32::new(0);

/// Initializes all parked Application Processors.
///
/// For each AP:
/// 1. Heap-allocates a [`Cpu`] record and populates it
/// 2. Stores its address in [`AP_PERCPU_TABLE`] (indexed by LAPIC ID)
/// 3. Releases all parked APs by setting [`AP_RELEASE`]
/// 4. Waits for all APs to signal readiness
///
/// After this function returns, all CPUs are online and running the
/// scheduler's idle loop.
pub fn boot_aps(boot_info: &impl BootInfo) {
    let smp_cpus = boot_info.smp_cpus();
    let ap_count = smp_cpus.len();

    if ap_count == 0 {
        crate::klog_info!("SMP: No APs to boot (single-processor system)");
        return;
    }

    crate::klog_info!("SMP: Initializing {} parked APs...", ap_count);

    // Allocate per-CPU state for each AP and store in the shared table.
    for (i, cpu_entry) in smp_cpus.iter().enumerate() {
        let cpu_id = CpuId::new((i + 1) as u32); // BSP is CPU 0

        // Heap-allocate a Cpu record for this AP. Leaked: it lives forever.
        let cpu = Box::leak(Box::new(Cpu::new()));
        let cpu_addr = cpu as *const Cpu as u64;
        #[allow(clippy::cast_possible_truncation)]
        let lapic_id = cpu_entry.lapic_id as u8;
        cpu.init(cpu_id, lapic_id);

        crate::klog_debug!(
            "SMP: Prepared AP {} (LAPIC ID={}, Cpu={:#x})",
            cpu_id,
            cpu_entry.lapic_id,
            cpu_addr
        );

        // Store the Cpu address indexed by LAPIC ID for the parked AP to find.
        AP_PERCPU_TABLE[cpu_entry.lapic_id as usize].store(cpu_addr, Ordering::Release);
    }

    // Release all parked APs. The Release ordering ensures the table writes
    // above are visible before APs read them.
    AP_RELEASE.store(true, Ordering::Release);
    crate::klog_info!("SMP: Released {} APs for initialization", ap_count);

    // Wait for all APs to complete their initialization (with timeout).
    let expected = ap_count as u32;
    let mut spin_count = 0u64;
    const SPIN_TIMEOUT: u64 = 100_000_000; // ~a few seconds on modern CPUs

    while AP_READY_COUNT.load(Ordering::Acquire) < expected {
        core::hint::spin_loop();
        spin_count += 1;
        if spin_count >= SPIN_TIMEOUT {
            crate::klog_warn!(
                "SMP: Timeout waiting for APs ({}/{} ready)",
                AP_READY_COUNT.load(Ordering::Acquire),
                expected
            );
            break;
        }
    }

    let ready = AP_READY_COUNT.load(Ordering::Acquire);
    percpu::set_cpu_count(1 + ready);
    crate::klog_info!("SMP: {} APs online ({} total CPUs)", ready, 1 + ready);
}

/// Full AP initialization. Called from [`ap_early_park`] after release.
///
/// Sets up this CPU's GS base, GDT, IDT, Local APIC and scheduler queues,
/// then hands off to the scheduler's idle loop. Never returns.
fn ap_entry(percpu_addr: u64) -> ! {
    // SAFETY: percpu_addr was produced by `boot_aps` from `Box::leak`, so it
    // is valid and lives for the rest of the kernel's uptime.
    let cpu: &'static Cpu = unsafe { &*(percpu_addr as *const Cpu) };
    let cpu_id = cpu.get_cpu_id();

    // 1. Point GS base at this CPU's own Cpu record.
    // SAFETY: cpu is a valid, leaked Cpu record; no other CPU is running on
    // this GS base yet.
    unsafe { percpu::init_ap(cpu) };

    // 2. Load the shared GDT and reload segment registers.
    // SAFETY: the BSP has already built the shared GDT.
    unsafe { super::gdt::init_ap() };

    // 3. Load the shared IDT.
    // SAFETY: the IDT is initialized by the BSP and is a shared immutable
    // static.
    unsafe { super::idt::init() };

    // 4. Enable this AP's Local APIC and calibrate/start its timer.
    init_ap_lapic(cpu);

    // 5. Bring up this CPU's scheduler queues (spawns its reaper thread).
    crate::sched::init_cpu();

    // 6. Signal BSP that we are ready.
    AP_READY_COUNT.fetch_add(1, Ordering::Release);

    crate::klog_info!("SMP: AP {} online (LAPIC ID={})", cpu_id, cpu.get_apic_id());

    // 7. Enable interrupts and enter this AP's scheduler loop.
    // SAFETY: all interrupt infrastructure is initialized.
    unsafe { crate::arch::x86_64::instructions::interrupts::enable() };

    crate::sched::idle_loop()
}

/// Initializes the Local APIC on an AP, calibrates its timer against the
/// HPET/PIT, and records both in its [`Cpu`] record.
fn init_ap_lapic(cpu: &Cpu) {
    use crate::arch::x86_64::interrupts::dispatch::vectors;

    let lapic_virt = super::acpi::lapic_virt().expect("AP bootstrap: LAPIC not set up by BSP");

    // SAFETY: lapic_virt was mapped by the BSP during ACPI bring-up and is
    // valid for every CPU's view of the Local APIC.
    let lapic = unsafe { LocalApic::new(lapic_virt) };
    lapic.enable(vectors::SPURIOUS);
    lapic.set_tpr(0);
    cpu.set_lapic_mmio(lapic_virt.as_u64());

    let ticks_per_ms = super::acpi::calibrate_lapic_timer(&lapic, None);
    cpu.set_lapic_calibration_ticks(ticks_per_ms);

    crate::klog_debug!(
        "SMP: AP {} LAPIC calibrated ({} ticks/ms)",
        cpu.get_cpu_id(),
        ticks_per_ms
    );
}
