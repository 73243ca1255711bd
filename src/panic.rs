//! Kernel panic handler: the single place a Rust `panic!` turns into the
//! fail-stop halt sequence.
//!
//! On the first CPU to panic: broadcast the halt IPI to every other CPU,
//! print a fatal line (CPU id, message, backtrace) to the emergency serial
//! path, and park in a `hlt` loop. A CPU that panics while another CPU's
//! panic is already in flight skips straight to parking — there is only
//! ever one crash report.

use core::sync::atomic::{AtomicBool, Ordering};

use crate::arch::x86_64::hw::local_apic::LocalApic;
use crate::arch::x86_64::interrupts::dispatch;
use crate::config::IPI_HALT_VECTOR;

/// Set by the first CPU to reach the panic handler.
static PANIC_IN_PROGRESS: AtomicBool = AtomicBool::new(false);

/// Registers the halt-IPI handler.
///
/// Must run after the IDT is loaded and before any AP is started, so a
/// panic on one CPU can always park the others.
pub fn init() {
    // A fresh registration on every boot; failure here would mean the
    // vector was already claimed, which is itself a setup bug worth
    // panicking over.
    dispatch::register_handler(IPI_HALT_VECTOR, halt_ipi_handler)
        .expect("IPI_HALT_VECTOR already registered");
}

/// Halt-IPI handler: parks the receiving CPU permanently.
fn halt_ipi_handler(_vector: u8) {
    halt_forever();
}

/// Disables interrupts and spins in `hlt` forever.
fn halt_forever() -> ! {
    loop {
        // SAFETY: unconditionally parking the CPU; no further kernel code
        // on this core is reachable after this point.
        unsafe {
            core::arch::asm!("cli", options(nomem, nostack, preserves_flags));
        }
        core::hint::spin_loop();
        unsafe {
            core::arch::asm!("hlt", options(nomem, nostack, preserves_flags));
        }
    }
}

/// Sends [`IPI_HALT_VECTOR`] to every other CPU, if the Local APIC is up.
///
/// A no-op during early boot panics, before ACPI bring-up has mapped the
/// LAPIC — there are no other CPUs running yet in that window.
fn halt_other_cpus() {
    if let Some(lapic_virt) = crate::arch::x86_64::acpi::lapic_virt() {
        // SAFETY: the LAPIC stays mapped for the kernel's lifetime once
        // ACPI bring-up has published it. The handler wired to
        // IPI_HALT_VECTOR only parks the receiving CPU.
        unsafe {
            let lapic = LocalApic::new(lapic_virt);
            lapic.send_ipi_all_excluding_self(IPI_HALT_VECTOR);
        }
    }
}

// Only registered as the lang-item panic handler on the bare-metal target;
// under `cfg(test)` std already supplies one, so this is just an ordinary
// function there (unused, but it still has to compile and stay correct).
#[cfg_attr(target_os = "none", panic_handler)]
fn panic(info: &core::panic::PanicInfo) -> ! {
    if PANIC_IN_PROGRESS.swap(true, Ordering::SeqCst) {
        // Another CPU is already printing the crash report; don't race it
        // on the serial port, just park.
        halt_forever();
    }

    halt_other_cpus();

    let cpu_id = if crate::percpu::is_ready() {
        Some(crate::percpu::current_cpu().get_cpu_id().as_u32())
    } else {
        None
    };

    crate::log::panic_serial(info, cpu_id, crate::error::current_kind());

    halt_forever();
}
