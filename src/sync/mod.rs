//! Synchronization primitives for the kernel.
//!
//! Provides [`SpinLock`], [`IrqSpinLock`], and [`LazyLock`], suitable for use
//! in `static` items and usable before any allocator or scheduler is
//! available.

mod irq_spinlock;
mod lazy;
mod spinlock;

pub use irq_spinlock::{IrqSpinLock, IrqSpinLockGuard};
pub use lazy::LazyLock;
pub use spinlock::{SpinLock, SpinLockGuard};
