//! x86_64 instruction wrappers.

pub mod interrupts;
pub mod port;
pub mod segmentation;
pub mod tables;
pub mod tlb;

pub use interrupts::{disable as disable_interrupts, enable as enable_interrupts};
