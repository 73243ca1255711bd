//! Early device drivers.
//!
//! Framebuffer/TTY backends and the async driver-capability framework are
//! out of scope; the logger's serial sink is the only thing this kernel
//! ships a driver for.

pub mod early_console;
