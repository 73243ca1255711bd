//! Kernel logging infrastructure.
//!
//! The logger starts in an uninitialized state where every write falls back
//! to a lock-free, allocation-free write straight to COM1 — this is the path
//! exercised during GDT, IDT, PMM, VMM, and heap init. Once the heap is up,
//! [`init_logger`] installs a [`Logger`] holding a `Vec<Box<dyn LogSink>>`;
//! from that point on writes fan out to every registered sink instead.

extern crate alloc;

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt::{self, Write as _};

use crate::drivers::early_console::{COM1, EarlySerial};
use crate::sync::SpinLock;

// ---------------------------------------------------------------------------
// LogLevel
// ---------------------------------------------------------------------------

/// Log severity, ordered from most to least severe.
///
/// A sink's `max_level` is the least severe level it accepts: a sink
/// configured at `Trace` accepts everything, one at `Error` accepts only
/// `Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Unrecoverable condition; the kernel panics immediately after.
    Error,
    /// Recoverable but unexpected condition.
    Warn,
    /// Routine informational message.
    Info,
    /// Diagnostic detail useful when tracking down a specific bug.
    Debug,
    /// Highest-volume tracing output.
    Trace,
}

impl LogLevel {
    /// Fixed-width name used in the leveled log line prefix.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN ",
            LogLevel::Info => "INFO ",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

// ---------------------------------------------------------------------------
// LogSink trait
// ---------------------------------------------------------------------------

/// A dyn-compatible output sink for the kernel logger.
///
/// Uses `&self`, not `&mut self`: serial port I/O is stateless register
/// access, so sinks that need mutable state keep it behind their own lock.
pub trait LogSink: Send + Sync {
    /// Writes a string fragment to this sink.
    fn write_str(&self, s: &str);
    /// Maximum log level accepted (messages with `level <= max_level` are written).
    fn max_level(&self) -> LogLevel;
    /// Human-readable name for diagnostics.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// SerialSink
// ---------------------------------------------------------------------------

/// A [`LogSink`] that writes to a 16550 UART serial port.
pub struct SerialSink {
    uart: EarlySerial,
    max_level: LogLevel,
}

impl SerialSink {
    /// Creates a new serial sink.
    #[must_use]
    pub fn new(uart: EarlySerial, max_level: LogLevel) -> Self {
        Self { uart, max_level }
    }
}

impl LogSink for SerialSink {
    fn write_str(&self, s: &str) {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.uart.write_byte(b'\r');
            }
            self.uart.write_byte(byte);
        }
    }

    fn max_level(&self) -> LogLevel {
        self.max_level
    }

    fn name(&self) -> &str {
        "serial"
    }
}

// ---------------------------------------------------------------------------
// Early serial writer (pre-heap, pre-logger)
// ---------------------------------------------------------------------------

/// Wrapper around [`EarlySerial`] implementing `fmt::Write`. Stateless, so it
/// is constructed fresh for every write — safe to use from any context,
/// including with the logger lock held.
struct SerialWriter(EarlySerial);

impl fmt::Write for SerialWriter {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.0.write_byte(b'\r');
            }
            self.0.write_byte(byte);
        }
        Ok(())
    }
}

fn early_write_fmt(args: fmt::Arguments<'_>) {
    let mut w = SerialWriter(EarlySerial::new(COM1));
    let _ = w.write_fmt(args);
}

fn early_log(level: LogLevel, args: fmt::Arguments<'_>) {
    let nanos = crate::time::boot_nanos();
    let total_micros = nanos / 1_000;
    let secs = total_micros / 1_000_000;
    let micros = total_micros % 1_000_000;

    let mut w = SerialWriter(EarlySerial::new(COM1));
    let _ = write!(w, "[{secs:>5}.{micros:06}] {} {args}\n", level.name());
}

/// Confirms the early serial path is reachable.
///
/// Call once, after UART hardware init and before the first `klog_*!` use.
/// No heap allocation required; this only needs port I/O to work.
pub fn init_early() {
    early_write_fmt(format_args!("serial: early logging active\n"));
}

// ---------------------------------------------------------------------------
// Logger (post-heap)
// ---------------------------------------------------------------------------

/// Interior data protected by the logger's spin lock.
struct LoggerInner {
    sinks: Vec<Box<dyn LogSink>>,
}

/// The kernel logger.
///
/// Holds a `Vec<Box<dyn LogSink>>` behind a [`SpinLock`], `None` until
/// [`init_logger`] runs. While `None`, every write falls back to the
/// allocation-free early serial path.
pub struct Logger {
    inner: SpinLock<Option<LoggerInner>>,
}

impl Logger {
    /// Creates a new logger (uninitialized).
    const fn new() -> Self {
        Self {
            inner: SpinLock::new(None),
        }
    }

    /// Installs a serial sink and switches writes over to the sink fan-out.
    fn init_with_serial(&self) {
        let mut guard = self.inner.lock();
        let serial_sink = Box::new(SerialSink::new(EarlySerial::new(COM1), LogLevel::Trace));
        let mut sinks: Vec<Box<dyn LogSink>> = Vec::with_capacity(4);
        sinks.push(serial_sink);
        *guard = Some(LoggerInner { sinks });
    }

    /// Registers an additional output sink.
    fn add_sink(&self, sink: Box<dyn LogSink>) {
        let mut guard = self.inner.lock();
        if let Some(inner) = guard.as_mut() {
            inner.sinks.push(sink);
        }
    }

    /// Replaces the first sink whose [`name()`](LogSink::name) matches `name`
    /// with `new_sink`. Returns `true` if a replacement was made.
    fn replace_sink_by_name(&self, name: &str, new_sink: Box<dyn LogSink>) -> bool {
        let mut guard = self.inner.lock();
        if let Some(inner) = guard.as_mut() {
            for sink in &mut inner.sinks {
                if sink.name() == name {
                    *sink = new_sink;
                    return true;
                }
            }
        }
        false
    }

    /// Raw write, fanned out to **all** sinks with no level filtering. Falls
    /// back to the early serial path before [`init_logger`] has run.
    fn write_fmt(&self, args: fmt::Arguments<'_>) {
        let guard = self.inner.lock();
        match guard.as_ref() {
            Some(inner) => {
                for sink in &inner.sinks {
                    let mut w = SinkWriter(sink.as_ref());
                    let _ = fmt::Write::write_fmt(&mut w, args);
                }
            }
            None => {
                drop(guard);
                early_write_fmt(args);
            }
        }
    }

    /// Leveled write: formats a timestamped, level-tagged message and writes
    /// it only to sinks whose `max_level >= level`. Falls back to the early
    /// serial path before [`init_logger`] has run.
    fn log(&self, level: LogLevel, args: fmt::Arguments<'_>) {
        let guard = self.inner.lock();
        match guard.as_ref() {
            Some(inner) => {
                let nanos = crate::time::boot_nanos();
                let total_micros = nanos / 1_000;
                let secs = total_micros / 1_000_000;
                let micros = total_micros % 1_000_000;
                for sink in &inner.sinks {
                    if level <= sink.max_level() {
                        let mut w = SinkWriter(sink.as_ref());
                        let _ = write!(w, "[{secs:>5}.{micros:06}] {} {args}\n", level.name());
                    }
                }
            }
            None => {
                drop(guard);
                early_log(level, args);
            }
        }
    }
}

/// Adapter that wraps a `&dyn LogSink` to implement `fmt::Write`.
struct SinkWriter<'a>(&'a dyn LogSink);

impl fmt::Write for SinkWriter<'_> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.0.write_str(s);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Global logger instance and public API
// ---------------------------------------------------------------------------

/// Global logger instance.
pub static LOGGER: Logger = Logger::new();

/// Raw, unfiltered write to every sink. Used by `kprint!`-style macros.
pub fn print(args: fmt::Arguments<'_>) {
    LOGGER.write_fmt(args);
}

/// Leveled, timestamped write, filtered per sink by `max_level`.
pub fn log(level: LogLevel, args: fmt::Arguments<'_>) {
    LOGGER.log(level, args);
}

/// Initializes the full logger, switching over from the early serial path.
///
/// Call this after the heap allocator is available.
pub fn init_logger() {
    LOGGER.init_with_serial();
}

/// Registers an additional output sink with the global logger.
pub fn add_sink(sink: Box<dyn LogSink>) {
    LOGGER.add_sink(sink);
}

/// Replaces a named sink in the global logger. Returns `true` on success.
pub fn replace_sink_by_name(name: &str, new_sink: Box<dyn LogSink>) -> bool {
    LOGGER.replace_sink_by_name(name, new_sink)
}

// ---------------------------------------------------------------------------
// Logging macros
// ---------------------------------------------------------------------------

/// Logs a message at [`LogLevel::Error`].
#[macro_export]
macro_rules! klog_error {
    ($($arg:tt)*) => {
        $crate::log::log($crate::log::LogLevel::Error, format_args!($($arg)*))
    };
}

/// Logs a message at [`LogLevel::Warn`].
#[macro_export]
macro_rules! klog_warn {
    ($($arg:tt)*) => {
        $crate::log::log($crate::log::LogLevel::Warn, format_args!($($arg)*))
    };
}

/// Logs a message at [`LogLevel::Info`].
#[macro_export]
macro_rules! klog_info {
    ($($arg:tt)*) => {
        $crate::log::log($crate::log::LogLevel::Info, format_args!($($arg)*))
    };
}

/// Logs a message at [`LogLevel::Debug`].
#[macro_export]
macro_rules! klog_debug {
    ($($arg:tt)*) => {
        $crate::log::log($crate::log::LogLevel::Debug, format_args!($($arg)*))
    };
}

// ---------------------------------------------------------------------------
// Panic helper
// ---------------------------------------------------------------------------

/// Writes a panic message directly to COM1, bypassing the logger entirely.
///
/// No locks, no allocation — safe from any context, including inside a panic
/// while the logger lock is held. `cpu_id` is `None` when the panic happens
/// before per-CPU state exists (early boot, before [`crate::percpu::init_bsp`]).
/// `kind` is `None` when the panic did not go through a call site that tags
/// a [`crate::error::PanicKind`] first (a bare `unwrap()` or out-of-bounds
/// index, for instance) — the crash dump just omits the tag in that case.
pub fn panic_serial(
    info: &core::panic::PanicInfo,
    cpu_id: Option<u32>,
    kind: Option<crate::error::PanicKind>,
) {
    let mut w = SerialWriter(EarlySerial::new(COM1));
    match (cpu_id, kind) {
        (Some(id), Some(kind)) => {
            let _ = write!(w, "\n!!! KERNEL PANIC (cpu {id}) [{kind}] !!!\n{info}\n");
        }
        (Some(id), None) => {
            let _ = write!(w, "\n!!! KERNEL PANIC (cpu {id}) !!!\n{info}\n");
        }
        (None, Some(kind)) => {
            let _ = write!(w, "\n!!! KERNEL PANIC (cpu ?) [{kind}] !!!\n{info}\n");
        }
        (None, None) => {
            let _ = write!(w, "\n!!! KERNEL PANIC (cpu ?) !!!\n{info}\n");
        }
    }
    crate::backtrace::panic_backtrace(&mut w);
}
