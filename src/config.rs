//! Kernel configuration constants.
//!
//! A single source of truth for compile-time-tunable sizes and vector
//! assignments so that subsystems don't repeat magic numbers at each use
//! site.

/// Maximum number of CPUs the kernel tracks (BSP + APs).
pub const MAX_CPUS: usize = 64;

/// Base virtual address of the kernel heap.
///
/// Chosen well inside the canonical higher half, clear of the HHDM and of
/// the kernel image itself.
pub const HEAP_BASE: u64 = 0xFFFF_9000_0000_0000;

/// Kernel heap size in bytes (2 MiB, per the fixed virtual range the heap
/// is eagerly mapped into at init).
pub const KERNEL_HEAP_SIZE: usize = 2 * 1024 * 1024;

/// Kernel thread stack size (32 KiB).
pub const KERNEL_STACK_SIZE: usize = 32 * 1024;

/// Double-fault IST stack size (16 KiB).
pub const DOUBLE_FAULT_STACK_SIZE: usize = 16 * 1024;

/// Default scheduler timeslice in nanoseconds (30 microseconds).
pub const TIMESLICE_NS: u64 = 30_000;

/// PIT fallback frequency in Hz when no HPET table is present.
pub const PIT_FREQUENCY_HZ: u32 = 1000;

/// First vector reserved for ISA IRQs (0x30..0x3F).
pub const ISA_IRQ_BASE: u8 = 0x30;

/// Last vector reserved for ISA IRQs, inclusive.
pub const ISA_IRQ_END: u8 = 0x3F;

/// First vector in the dynamically-allocated free pool.
pub const DYNAMIC_VECTOR_START: u8 = 0x40;

/// Last vector in the dynamically-allocated free pool, inclusive.
///
/// 0xEF is reserved for future use and is deliberately excluded from the
/// pool.
pub const DYNAMIC_VECTOR_END: u8 = 0xEE;

/// Vector reserved for future use, between the dynamic pool and the LAPIC
/// spurious vector.
pub const RESERVED_VECTOR: u8 = 0xEF;

/// LAPIC spurious-interrupt vector.
pub const LAPIC_SPURIOUS_VECTOR: u8 = 0xF0;

/// LAPIC timer vector (one-shot/periodic tick driving preemption).
pub const LAPIC_TIMER_VECTOR: u8 = 0xF1;

/// Inter-processor interrupt requesting a reschedule on the target CPU.
pub const IPI_RESCHEDULE_VECTOR: u8 = 0xF2;

/// Inter-processor interrupt halting the target CPU (sent by the panic path).
pub const IPI_HALT_VECTOR: u8 = 0xF3;

/// Target microseconds used for LAPIC timer calibration.
pub const LAPIC_CALIBRATION_US: u64 = 10_000;

/// Build target name, reported by diagnostics.
pub const TARGET: &str = "x86_64-unknown-hadron";

/// Project version, reported by diagnostics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
