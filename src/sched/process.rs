//! Process: the container a thread belongs to.
//!
//! User processes are out of scope; the kernel itself is the single,
//! singleton `Process` every kernel thread belongs to, sharing the kernel
//! pagemap. Tracked mostly for introspection — scheduling operates purely on
//! per-CPU thread queues and never looks at a thread's parent process.

extern crate alloc;

use alloc::string::String;
use alloc::vec::Vec;

use crate::id::Pid;
use crate::sync::{IrqSpinLock, LazyLock};

/// A process: a name, a pagemap root, and the threads running under it.
pub struct Process {
    pub pid: Pid,
    pub name: String,
    /// Physical address of this process's top-level page table (CR3 value).
    pub pagemap_root: u64,
    threads: IrqSpinLock<Vec<super::thread::Tid>>,
}

impl Process {
    /// Records a thread as belonging to this process.
    pub fn register_thread(&self, tid: super::thread::Tid) {
        self.threads.lock().push(tid);
    }

    /// Number of threads currently attributed to this process.
    pub fn thread_count(&self) -> usize {
        self.threads.lock().len()
    }
}

fn current_cr3() -> u64 {
    let cr3: u64;
    // SAFETY: reading CR3 has no side effects.
    unsafe {
        core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
    }
    cr3
}

/// The singleton kernel process every kernel thread belongs to.
pub static KERNEL_PROCESS: LazyLock<Process> = LazyLock::new(|| Process {
    pid: Pid::new(0),
    name: String::from("kernel"),
    pagemap_root: current_cr3(),
    threads: IrqSpinLock::new(Vec::new()),
});
