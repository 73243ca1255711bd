//! The closed taxonomy of fatal-error kinds carried alongside a panic.
//!
//! The kernel has exactly one error mode at this layer: fail-stop. A
//! `PanicKind` is not a `Result`-style recoverable error — it just tags a
//! panic for the crash dump and log line so a reader scanning a serial
//! capture can tell "out of memory" from "double free" without parsing the
//! message text.

use core::fmt;

/// Category of fatal condition that reached the panic handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanicKind {
    /// Out of frames, heap out of memory, all vectors allocated, no
    /// runnable thread.
    ResourceExhaustion,
    /// Invalid ACPI checksum, HHDM offset set twice, double-free header
    /// detected, attempt to create a user process without a pagemap.
    InvariantViolation,
    /// Exception 0..31 or any vector whose slot still holds the default
    /// handler; PIC spurious IRQ; interrupt in a reserved vector.
    UnhandledInterrupt,
    /// A `kassert!` condition was false.
    AssertionFailure,
}

impl PanicKind {
    /// Short tag printed in the crash dump's fatal line.
    pub const fn tag(self) -> &'static str {
        match self {
            PanicKind::ResourceExhaustion => "resource-exhaustion",
            PanicKind::InvariantViolation => "invariant-violation",
            PanicKind::UnhandledInterrupt => "unhandled-interrupt",
            PanicKind::AssertionFailure => "assertion-failure",
        }
    }
}

impl fmt::Display for PanicKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Records the [`PanicKind`] of the in-flight panic, if any, so
/// [`crate::panic`]'s `#[panic_handler]` can recover it without the kind
/// having to ride along inside `core::panic::PanicInfo` (which has no room
/// for one).
///
/// Set by [`kassert_fail`] and anything else that wants to tag the panic
/// it is about to trigger; read once by the panic handler and never
/// cleared, since there is only ever one crash report.
static CURRENT_KIND: crate::cell::RacyCell<Option<PanicKind>> = crate::cell::RacyCell::new(None);

/// Tags the panic about to happen with `kind`.
///
/// Must be called immediately before the `panic!`/`unwrap` that actually
/// unwinds into the handler, on the same CPU — there is no synchronization
/// between the tag and the panic itself.
pub fn set_kind(kind: PanicKind) {
    // SAFETY: a CPU only ever panics once (the handler parks it forever
    // afterward), so there is no writer/writer race on the same core; a
    // concurrent panic on another core races the *read*, not this write,
    // and the handler treats a torn read as "kind unknown", not unsound.
    unsafe {
        *CURRENT_KIND.get() = Some(kind);
    }
}

/// Returns the kind tagged by the most recent [`set_kind`] call, if any.
pub fn current_kind() -> Option<PanicKind> {
    // SAFETY: read-only; see `set_kind`.
    unsafe { *CURRENT_KIND.get() }
}

/// Called by `kassert!` when its condition is false.
///
/// Tags the panic as [`PanicKind::AssertionFailure`] and panics with a
/// message naming the failed expression, its location, and the enclosing
/// function — mirrors the teacher's C `kassert_fail(expr, file, line,
/// func)`.
#[track_caller]
pub fn kassert_fail(expr: &str, func: &str) -> ! {
    set_kind(PanicKind::AssertionFailure);
    let loc = core::panic::Location::caller();
    panic!("assertion failed: {expr}, at {}:{}:{} in {func}", loc.file(), loc.line(), loc.column());
}

/// Runtime assertion that tags its panic as [`PanicKind::AssertionFailure`].
///
/// Unlike [`crate::static_assert`], this checks its condition at runtime —
/// use it for invariants that depend on values only known at runtime
/// (an index bound, a pointer's alignment, a lock's expected state).
#[macro_export]
macro_rules! kassert {
    ($cond:expr) => {
        if !($cond) {
            $crate::error::kassert_fail(stringify!($cond), $crate::fn_name!());
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !($cond) {
            $crate::error::set_kind($crate::error::PanicKind::AssertionFailure);
            panic!($($arg)+);
        }
    };
}

/// Expands to the name of the function it is invoked in.
///
/// Helper for [`kassert!`]; `core` has no `__func__`-equivalent, so this
/// walks `core::any::type_name` of a local zero-sized marker the way the
/// standard `stdext`/`function_name` crates do.
#[macro_export]
macro_rules! fn_name {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            core::any::type_name::<T>()
        }
        let name = type_name_of(f);
        &name[..name.len() - 3]
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trips_through_display() {
        assert_eq!(PanicKind::ResourceExhaustion.tag(), "resource-exhaustion");
        assert_eq!(alloc::format!("{}", PanicKind::InvariantViolation), "invariant-violation");
    }

    #[test]
    fn set_kind_is_observed_by_current_kind() {
        set_kind(PanicKind::UnhandledInterrupt);
        assert_eq!(current_kind(), Some(PanicKind::UnhandledInterrupt));
    }

    #[test]
    #[should_panic(expected = "assertion failed")]
    fn kassert_fails_on_false_condition() {
        kassert!(1 + 1 == 3);
    }

    #[test]
    fn kassert_passes_on_true_condition() {
        kassert!(1 + 1 == 2);
    }
}
