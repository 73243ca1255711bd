//! Architecture-specific modules and uniform facade.

pub mod x86_64;

// --- Arch facade: uniform API re-exported from the active arch ---

/// Architecture-specific CPU initialization: GDT, IDT, and per-CPU state.
///
/// Does not register the panic-halt IPI handler or bring up ACPI/the
/// scheduler — callers that need the full boot sequence use
/// [`crate::boot::kernel_init`] instead, which sequences those in dependency
/// order. This is the minimal setup lightweight test harnesses need.
pub fn cpu_init() {
    // SAFETY: called once, before interrupts are enabled and before any
    // other CPU is started.
    unsafe {
        x86_64::gdt::init();
        x86_64::idt::init();
        crate::percpu::init_bsp();
    }
}

/// Arch-uniform interrupt facade.
pub mod interrupts {
    pub use super::x86_64::interrupts::*;
}
