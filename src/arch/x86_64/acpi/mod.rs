//! Kernel-side ACPI integration.
//!
//! Provides the HHDM-backed [`tables::AcpiHandler`] implementation and
//! drives the platform bring-up sequence: parse RSDP/MADT/HPET, disable the
//! legacy PIC, map and enable the BSP's Local APIC, configure the I/O APIC,
//! and calibrate + start the LAPIC timer.

pub mod tables;

use core::sync::atomic::{AtomicU64, Ordering};

use tables::{AcpiError, MadtEntry};

use crate::addr::{PhysAddr, VirtAddr};
use crate::arch::x86_64::hw::io_apic::{
    DeliveryMode, DestinationMode, IoApic, Polarity, RedirectionEntry, TriggerMode,
};
use crate::arch::x86_64::hw::local_apic::LocalApic;
use crate::arch::x86_64::hw::hpet::Hpet;
use crate::arch::x86_64::hw::{pic, pit};
use crate::arch::x86_64::interrupts::dispatch::vectors;
use crate::boot::BootInfo;
use crate::sync::IrqSpinLock;

/// HHDM-based ACPI handler: translates physical addresses via the HHDM
/// offset published by [`crate::mm::vmm::init`].
struct HhdmAcpiHandler;

// SAFETY: the VMM (and its HHDM offset) is initialized before ACPI parsing
// runs, so `phys_to_virt` below is valid for the lifetime of the kernel.
unsafe impl tables::AcpiHandler for HhdmAcpiHandler {
    unsafe fn map_physical_region(&self, phys: u64, size: usize) -> &'static [u8] {
        let virt = crate::mm::vmm::hhdm_offset() + phys;
        // SAFETY: the HHDM maps all physical memory; `size` is bounded by
        // the caller to the table's own validated length.
        unsafe { core::slice::from_raw_parts(virt as *const u8, size) }
    }
}

/// Consolidated APIC platform state, initialized once during [`init`].
struct AcpiPlatformState {
    lapic_base: VirtAddr,
    io_apic_base: VirtAddr,
    gsi_base: u32,
}

/// `None` before [`init`] runs, `Some` after.
static PLATFORM: IrqSpinLock<Option<AcpiPlatformState>> = IrqSpinLock::new(None);

/// Timer tick counter, incremented by the LAPIC timer handler. Kept separate
/// from `PLATFORM` since it's on the hot path of every timer interrupt.
static TIMER_TICKS: AtomicU64 = AtomicU64::new(0);

/// Sends LAPIC EOI if the LAPIC has been initialized.
///
/// Called by the interrupt dispatch subsystem after every hardware
/// interrupt. Uses `try_lock` so an ISR that interrupted code already
/// holding the platform lock doesn't deadlock.
pub fn send_lapic_eoi() {
    if let Some(guard) = PLATFORM.try_lock() {
        if let Some(state) = guard.as_ref() {
            // SAFETY: the LAPIC was mapped during init and stays mapped.
            let lapic = unsafe { LocalApic::new(state.lapic_base) };
            lapic.eoi();
        }
    }
}

/// Returns the current timer tick count.
pub fn timer_ticks() -> u64 {
    TIMER_TICKS.load(Ordering::Relaxed)
}

/// Returns the BSP's Local APIC MMIO base, if ACPI bring-up has completed.
///
/// Uses `try_lock` so the panic path can call this even if the panicking
/// CPU happens to hold `PLATFORM` at the moment of the fault; a stuck lock
/// just means no halt IPI gets sent, not a deadlock.
pub fn lapic_virt() -> Option<VirtAddr> {
    PLATFORM.try_lock()?.as_ref().map(|state| state.lapic_base)
}

/// Runs a closure with a reference to the I/O APIC, if initialized.
///
/// Reconstructs the [`IoApic`] from the stored virtual base address.
pub fn with_io_apic<R>(f: impl FnOnce(&IoApic) -> R) -> Option<R> {
    let lock = PLATFORM.lock();
    let state = lock.as_ref()?;
    // SAFETY: the I/O APIC was mapped during init and stays mapped.
    let ioapic = unsafe { IoApic::new(state.io_apic_base, state.gsi_base) };
    Some(f(&ioapic))
}

/// LAPIC timer interrupt handler.
///
/// Only increments the tick count; this vector is the ~1ms time-base timer,
/// not the scheduler's preemption timer (which runs one-shot on its own
/// dynamically allocated vector, see [`crate::sched`]).
fn timer_handler(_vector: u8) {
    TIMER_TICKS.fetch_add(1, Ordering::Relaxed);
}

/// Initializes ACPI tables and all interrupt controllers.
///
/// Called from kernel setup after the heap and VMM are ready:
/// 1. Parses ACPI tables (RSDP -> RSDT/XSDT -> MADT, HPET)
/// 2. Disables the legacy PIC
/// 3. Maps and enables the BSP's Local APIC
/// 4. Maps and configures the I/O APIC, routing ISA IRQs
/// 5. Initializes the HPET, if present
/// 6. Calibrates and starts the LAPIC timer
/// 7. Enables interrupts
pub fn init(boot_info: &impl BootInfo) {
    let Some(rsdp_phys) = boot_info.rsdp_address() else {
        crate::klog_warn!("ACPI: no RSDP address available, skipping ACPI init");
        return;
    };

    let handler = HhdmAcpiHandler;

    let (rsdt_addr, is_xsdt) = match tables::parse_rsdp(&handler, rsdp_phys.as_u64()) {
        Ok(v) => {
            crate::klog_info!(
                "ACPI: RSDP validated, {} at {:#x}",
                if v.1 { "XSDT" } else { "RSDT" },
                v.0
            );
            v
        }
        Err(e) => {
            crate::klog_error!("ACPI: failed to parse RSDP: {:?}", e);
            return;
        }
    };

    let madt_phys = tables::find_table(&handler, rsdt_addr, is_xsdt, tables::MADT_SIGNATURE);
    let madt_info = match madt_phys.map(|phys| tables::Madt::parse(&handler, phys)) {
        Some(Ok(m)) => {
            let mut cpu_count = 0u32;
            let mut io_apic_count = 0u32;
            for entry in m.entries() {
                match entry {
                    MadtEntry::LocalApic { flags, .. } => {
                        if flags & 1 != 0 {
                            cpu_count += 1;
                        }
                    }
                    MadtEntry::IoApic { .. } => io_apic_count += 1,
                    _ => {}
                }
            }
            crate::klog_info!(
                "ACPI: MADT: {} CPUs, {} I/O APICs, LAPIC at {:#x}",
                cpu_count,
                io_apic_count,
                m.local_apic_address
            );
            Some(m)
        }
        Some(Err(e)) => {
            crate::klog_warn!("ACPI: MADT invalid: {:?}", e);
            None
        }
        None => {
            crate::klog_warn!("ACPI: MADT not found");
            None
        }
    };

    let hpet_phys = tables::find_table(&handler, rsdt_addr, is_xsdt, tables::HPET_SIGNATURE);
    let hpet_info = match hpet_phys.map(|phys| tables::HpetTable::parse(&handler, phys)) {
        Some(Ok(h)) => {
            crate::klog_debug!("ACPI: HPET at {:#x}", h.base_address);
            Some(h)
        }
        Some(Err(e)) => {
            crate::klog_warn!("ACPI: HPET table invalid: {:?}", e);
            None
        }
        None => {
            crate::klog_warn!("ACPI: HPET not found");
            None
        }
    };

    // --- 2. Disable legacy PIC ---
    // SAFETY: interrupts are disabled at this point (CLI from boot).
    unsafe { pic::remap_and_disable() };
    crate::klog_debug!("PIC: remapped to vectors 32-47, masked all");

    // --- 3. Map and enable Local APIC ---
    let Some(madt) = madt_info else {
        crate::klog_error!("ACPI: cannot initialize APIC without MADT");
        return;
    };

    let lapic_phys = PhysAddr::new(u64::from(madt.local_apic_address));
    let lapic_virt = crate::mm::vmm::map_mmio_region(lapic_phys, crate::mm::PAGE_SIZE as u64);

    // SAFETY: lapic_virt was just mapped to the LAPIC MMIO region.
    let lapic = unsafe { LocalApic::new(lapic_virt) };
    lapic.enable(vectors::SPURIOUS);
    lapic.set_tpr(0);

    let apic_id = lapic.id();
    crate::percpu::current_cpu().init(crate::id::CpuId::new(0), apic_id);

    crate::klog_info!(
        "LAPIC: enabled, ID={}, spurious vector={}",
        apic_id,
        vectors::SPURIOUS
    );

    // --- 4. Map and configure I/O APIC ---
    let mut io_apic_virt = VirtAddr::new(0);
    let mut io_apic_gsi_base = 0u32;

    for entry in madt.entries() {
        if let MadtEntry::IoApic {
            io_apic_address,
            gsi_base,
            ..
        } = entry
        {
            let ioapic_phys = PhysAddr::new(u64::from(io_apic_address));
            let ioapic_virt =
                crate::mm::vmm::map_mmio_region(ioapic_phys, crate::mm::PAGE_SIZE as u64);

            // SAFETY: ioapic_virt was just mapped to the I/O APIC MMIO region.
            let ioapic = unsafe { IoApic::new(ioapic_virt, gsi_base) };
            let max_entry = ioapic.max_redirection_entry();

            crate::klog_debug!(
                "I/O APIC: ID={}, GSI base={}, {} entries",
                ioapic.id(),
                gsi_base,
                max_entry + 1
            );

            for i in 0..=max_entry {
                ioapic.mask(i);
            }

            if gsi_base == 0 {
                setup_isa_irqs(&ioapic, &madt, apic_id);
            }

            io_apic_virt = ioapic_virt;
            io_apic_gsi_base = gsi_base;
        }
    }

    *PLATFORM.lock() = Some(AcpiPlatformState {
        lapic_base: lapic_virt,
        io_apic_base: io_apic_virt,
        gsi_base: io_apic_gsi_base,
    });

    // --- 5. Initialize HPET ---
    let hpet = hpet_info.and_then(|info| {
        let hpet_phys = PhysAddr::new(info.base_address);
        let hpet_virt = crate::mm::vmm::map_mmio_region(hpet_phys, crate::mm::PAGE_SIZE as u64);

        // SAFETY: hpet_virt was just mapped to the HPET MMIO region.
        let hpet = unsafe { Hpet::new(hpet_virt) };
        hpet.enable();

        // Global time source becomes real from this point on.
        crate::time::init_hpet(hpet_virt, hpet.period_fs());

        crate::klog_info!(
            "HPET: enabled, {} Hz, {} comparators",
            hpet.frequency_hz(),
            hpet.num_comparators()
        );
        Some(hpet)
    });

    // --- 6. Calibrate and start LAPIC timer ---
    calibrate_and_start_timer(&lapic, hpet.as_ref());

    // --- 7. Enable interrupts ---
    // SAFETY: the IDT is configured, the LAPIC is enabled, and the I/O APIC
    // is set up.
    unsafe { crate::arch::x86_64::instructions::interrupts::enable() };
    crate::klog_info!("Interrupts enabled");
}

/// Sets up ISA IRQ routing through the I/O APIC, respecting MADT interrupt
/// source overrides.
fn setup_isa_irqs(ioapic: &IoApic, madt: &tables::Madt, bsp_apic_id: u8) {
    for irq in 0u8..16 {
        let mut gsi = u32::from(irq);
        let mut polarity = Polarity::ActiveHigh;
        let mut trigger = TriggerMode::Edge;

        for entry in madt.entries() {
            if let MadtEntry::InterruptSourceOverride {
                source,
                gsi: override_gsi,
                flags,
                ..
            } = entry
            {
                if source == irq {
                    gsi = override_gsi;
                    match flags & 0x03 {
                        0b10 => polarity = Polarity::ActiveHigh,
                        0b11 => polarity = Polarity::ActiveLow,
                        _ => {}
                    }
                    match (flags >> 2) & 0x03 {
                        0b10 => trigger = TriggerMode::Edge,
                        0b11 => trigger = TriggerMode::Level,
                        _ => {}
                    }
                    break;
                }
            }
        }

        let vector = 32 + gsi as u8;
        let entry = RedirectionEntry {
            vector,
            delivery_mode: DeliveryMode::Fixed,
            destination_mode: DestinationMode::Physical,
            polarity,
            trigger_mode: trigger,
            masked: true,
            destination: bsp_apic_id,
        };

        if gsi < u32::from(ioapic.max_redirection_entry()) + 1 {
            #[allow(clippy::cast_possible_truncation)]
            ioapic.set_entry(gsi as u8, entry);
        }
    }
}

/// Calibrates the LAPIC timer against the HPET (or PIT, as a fallback) and
/// starts it in periodic mode at ~1000 Hz.
fn calibrate_and_start_timer(lapic: &LocalApic, hpet: Option<&Hpet>) {
    crate::arch::x86_64::interrupts::dispatch::register_handler(vectors::TIMER, timer_handler)
        .expect("failed to register timer handler");

    let ticks_per_ms = calibrate_lapic_timer(lapic, hpet);
    crate::percpu::current_cpu().set_lapic_calibration_ticks(ticks_per_ms);

    #[allow(clippy::cast_possible_truncation)]
    let initial_count = ticks_per_ms as u32;
    if initial_count > 0 {
        lapic.start_timer_periodic(vectors::TIMER, initial_count, 16);
        crate::klog_info!("Timer: LAPIC periodic timer started (1ms interval)");
    } else {
        crate::klog_warn!("Timer: calibration returned 0 ticks, timer not started");
    }
}

/// Measures LAPIC timer ticks per millisecond against the HPET (or PIT, as
/// a fallback), busy-waiting for [`crate::config::LAPIC_CALIBRATION_US`].
///
/// Shared between the BSP (`calibrate_and_start_timer`) and AP bring-up
/// (`arch::x86_64::smp`), which needs the same measurement per-core before
/// the scheduler can program one-shot preemption timers on that CPU.
pub fn calibrate_lapic_timer(lapic: &LocalApic, hpet: Option<&Hpet>) -> u64 {
    let divide = 16u8;
    lapic.start_timer_oneshot(vectors::TIMER, u32::MAX, divide);

    #[allow(clippy::cast_possible_truncation)]
    let calibration_ms = (crate::config::LAPIC_CALIBRATION_US / 1000) as u32;
    if let Some(hpet) = hpet {
        hpet.busy_wait_ms(calibration_ms);
    } else {
        // SAFETY: the PIT is available and interrupts are disabled.
        unsafe { pit::busy_wait_ms(calibration_ms) };
    }

    let elapsed = u32::MAX - lapic.timer_current_count();
    lapic.stop_timer();

    let ticks_per_second = u64::from(elapsed) * (1000 / u64::from(calibration_ms));
    let ticks_per_ms = ticks_per_second / 1000;

    crate::klog_info!(
        "Timer: LAPIC calibrated at {} MHz ({} ticks/ms, divide={})",
        ticks_per_second / 1_000_000,
        ticks_per_ms,
        divide
    );

    ticks_per_ms
}
