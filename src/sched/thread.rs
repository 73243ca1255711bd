//! Kernel threads: stack layout, the raw context switch, and the per-CPU
//! intrusive run/dead queues.
//!
//! Mirrors the teacher's `task::process` context-switch mechanics (fake
//! initial stack frame, `global_asm!` switch routine, trampoline that pops
//! its arguments off the incoming stack) adapted to plain kernel threads
//! instead of ring-3 processes: there is no `iretq` at the end of the
//! trampoline, just a call into the thread's start function.

extern crate alloc;

use alloc::alloc::{alloc_zeroed, dealloc};
use core::alloc::Layout;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::config::KERNEL_STACK_SIZE;

/// Thread identifier. 32 bits is generous for a kernel that never spawns
/// user processes; wraps only after four billion threads.
pub type Tid = u32;

static NEXT_TID: AtomicU32 = AtomicU32::new(1);

fn alloc_tid() -> Tid {
    NEXT_TID.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    Ready,
    Running,
    Dead,
}

/// A kernel thread.
///
/// Lives on the heap for its whole life; queues hold raw pointers to it so a
/// thread can move between the run queue and the dead queue without an
/// owning `Box` changing hands mid-flight (the reaper frees it once unlinked
/// from the dead queue).
#[repr(C)]
pub struct Thread {
    /// Intrusive run/dead-queue links. A thread is a member of exactly one
    /// queue at a time.
    prev: *mut Thread,
    next: *mut Thread,
    kstack: *mut u8,
    kstack_layout: Layout,
    /// Saved stack pointer. Valid only while the thread is not `Running`.
    sp: u64,
    pub state: ThreadState,
    pub tid: Tid,
}

// SAFETY: a `Thread` only has its queue links and `sp` touched by the CPU
// that owns the queue it's currently on, under that queue's lock.
unsafe impl Send for Thread {}

impl Thread {
    /// Allocates a new thread with a fresh kernel stack, laid out so that
    /// the first context switch into it lands in [`thread_entry_trampoline`]
    /// with `start`/`arg` ready to run.
    fn new(start: extern "C" fn(u64) -> u64, arg: u64) -> *mut Thread {
        let kstack_layout = Layout::from_size_align(KERNEL_STACK_SIZE, 16).unwrap();
        // SAFETY: layout has non-zero size and valid alignment.
        let kstack = unsafe { alloc_zeroed(kstack_layout) };
        if kstack.is_null() {
            crate::error::set_kind(crate::error::PanicKind::ResourceExhaustion);
            panic!("out of memory allocating kernel stack");
        }

        let kstack_bottom = kstack as u64 + KERNEL_STACK_SIZE as u64;
        let mut sp = kstack_bottom;

        // Fake initial frame: ctx_switch's `ret` lands in the trampoline,
        // which then pops `start` and `arg` itself.
        macro_rules! push {
            ($val:expr) => {
                sp -= 8;
                // SAFETY: sp stays within the stack allocated above; 16
                // quadwords fit comfortably inside KERNEL_STACK_SIZE.
                unsafe {
                    (sp as *mut u64).write($val);
                }
            };
        }
        push!(arg);
        push!(start as u64);
        push!(thread_entry_trampoline as u64); // return address for ctx_switch's ret
        push!(0); // rbx
        push!(0); // rbp
        push!(0); // r12
        push!(0); // r13
        push!(0); // r14
        push!(0); // r15

        let thread = alloc::boxed::Box::new(Thread {
            prev: core::ptr::null_mut(),
            next: core::ptr::null_mut(),
            kstack,
            kstack_layout,
            sp,
            state: ThreadState::Ready,
            tid: alloc_tid(),
        });
        alloc::boxed::Box::into_raw(thread)
    }

    /// Frees a dead thread's kernel stack and the `Thread` record itself.
    ///
    /// # Safety
    ///
    /// `ptr` must have come from [`Thread::new`], be unlinked from every
    /// queue, and not be the currently running thread.
    unsafe fn free(ptr: *mut Thread) {
        // SAFETY: ptr was produced by Box::into_raw in `new` and the caller
        // guarantees it is no longer referenced anywhere else.
        let thread = unsafe { alloc::boxed::Box::from_raw(ptr) };
        // SAFETY: kstack/kstack_layout were paired in `new`.
        unsafe {
            dealloc(thread.kstack, thread.kstack_layout);
        }
    }
}

core::arch::global_asm!(
    ".global hadron_ctx_switch",
    "hadron_ctx_switch:",
    // rdi = &mut old_sp, rsi = new_sp
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, rsi",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

unsafe extern "C" {
    /// Saves callee-saved registers and switches to `new_sp`, writing the
    /// outgoing stack pointer to `*old_sp_out`.
    ///
    /// Does not return to its caller in the usual sense: it `ret`s into
    /// whatever return address sits at the top of `new_sp`'s stack, which is
    /// either a suspended `yield()` call (resuming mid-quantum) or
    /// [`thread_entry_trampoline`] (a thread's first run).
    fn hadron_ctx_switch(old_sp_out: *mut u64, new_sp: u64);
}

/// Entered via `ret` from [`hadron_ctx_switch`] the first time a thread
/// runs. Pops its `start`/`arg` pair off the stack `Thread::new` prepared
/// and calls into it.
core::arch::global_asm!(
    ".global thread_entry_trampoline",
    "thread_entry_trampoline:",
    "pop rax", // start
    "pop rdi", // arg
    "call rax",
    "mov rdi, rax",
    "call {thread_exit}",
    "ud2",
    thread_exit = sym super::thread_exit_asm_entry,
);

unsafe extern "C" {
    fn thread_entry_trampoline();
}

/// Intrusive doubly-linked queue of threads, protected by the caller's lock.
///
/// Mirrors the teacher's `thread_queue_t`: insert at the head, delete by
/// unlinking in place. Not `Sync` on its own; callers hold an
/// [`crate::sync::IrqSpinLock`] around every access.
pub struct ThreadQueue {
    head: *mut Thread,
}

// SAFETY: queue contents are only ever touched while the owning
// IrqSpinLock is held.
unsafe impl Send for ThreadQueue {}

impl ThreadQueue {
    pub const fn new() -> Self {
        Self {
            head: core::ptr::null_mut(),
        }
    }

    /// Inserts `thread` at the head of the queue.
    pub fn insert(&mut self, thread: *mut Thread) {
        // SAFETY: thread is a valid, exclusively-owned Thread pointer; the
        // queue lock is held by the caller.
        unsafe {
            (*thread).prev = core::ptr::null_mut();
            (*thread).next = self.head;
            if !self.head.is_null() {
                (*self.head).prev = thread;
            }
            self.head = thread;
        }
    }

    /// Unlinks `thread` from the queue. No-op if it is not a member.
    pub fn delete(&mut self, thread: *mut Thread) {
        // SAFETY: thread is either a member of this queue (in which case
        // its links are valid) or the caller has guaranteed it was already
        // removed.
        unsafe {
            let prev = (*thread).prev;
            let next = (*thread).next;
            if !prev.is_null() {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            if self.head == thread {
                self.head = next;
            }
            (*thread).prev = core::ptr::null_mut();
            (*thread).next = core::ptr::null_mut();
        }
    }

    /// Returns the first `Ready` thread starting at `start` (inclusive) and
    /// wrapping around to the head of the queue once.
    pub fn search_ready_from(&self, start: *mut Thread) -> Option<*mut Thread> {
        let mut cursor = if start.is_null() { self.head } else { start };
        while !cursor.is_null() {
            // SAFETY: cursor is either `self.head` or a link reachable from
            // it; both are valid while the queue lock is held.
            if unsafe { (*cursor).state } == ThreadState::Ready {
                return Some(cursor);
            }
            cursor = unsafe { (*cursor).next };
        }
        None
    }

    /// Returns the head of the queue (for iteration by the reaper).
    pub fn head(&self) -> *mut Thread {
        self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }
}

pub(super) fn new_thread(start: extern "C" fn(u64) -> u64, arg: u64) -> *mut Thread {
    Thread::new(start, arg)
}

pub(super) unsafe fn free_thread(ptr: *mut Thread) {
    // SAFETY: forwarded from the caller's safety contract.
    unsafe { Thread::free(ptr) };
}

pub(super) fn thread_state(ptr: *mut Thread) -> ThreadState {
    // SAFETY: ptr is a live thread owned by the calling CPU's queues.
    unsafe { (*ptr).state }
}

pub(super) fn set_thread_state(ptr: *mut Thread, state: ThreadState) {
    // SAFETY: ptr is a live thread owned by the calling CPU's queues.
    unsafe {
        (*ptr).state = state;
    }
}

pub(super) fn thread_tid(ptr: *mut Thread) -> Tid {
    // SAFETY: ptr is a live thread owned by the calling CPU's queues.
    unsafe { (*ptr).tid }
}

pub(super) fn next_link(ptr: *mut Thread) -> *mut Thread {
    // SAFETY: ptr is a live thread owned by the calling CPU's queues.
    unsafe { (*ptr).next }
}

pub(super) fn sp_slot(ptr: *mut Thread) -> *mut u64 {
    // SAFETY: ptr is a live thread; the `sp` field has a stable offset.
    unsafe { core::ptr::addr_of_mut!((*ptr).sp) }
}

pub(super) fn sp_value(ptr: *mut Thread) -> u64 {
    // SAFETY: ptr is a live thread owned by the calling CPU's queues.
    unsafe { (*ptr).sp }
}

/// Performs the raw context switch. See [`hadron_ctx_switch`].
///
/// # Safety
///
/// `old_sp_out` must be a valid slot to receive the outgoing stack pointer
/// (or dangling, if the outgoing thread is dead and will never resume), and
/// `new_sp` must be a stack pointer previously saved by this function or
/// produced by [`Thread::new`].
pub(super) unsafe fn ctx_switch(old_sp_out: *mut u64, new_sp: u64) {
    // SAFETY: forwarded from the caller.
    unsafe { hadron_ctx_switch(old_sp_out, new_sp) };
}

#[cfg(test)]
mod tests {
    use super::*;

    extern "C" fn dummy_start(arg: u64) -> u64 {
        arg
    }

    fn make_thread() -> *mut Thread {
        Thread::new(dummy_start, 0)
    }

    fn free_all(threads: &[*mut Thread]) {
        for &t in threads {
            // SAFETY: every thread in `threads` was unlinked from its queue
            // by the test before calling this and is not running.
            unsafe { Thread::free(t) };
        }
    }

    #[test]
    fn insert_prepends_to_head() {
        let a = make_thread();
        let b = make_thread();
        let c = make_thread();
        let mut queue = ThreadQueue::new();

        queue.insert(a);
        queue.insert(b);
        queue.insert(c);

        assert_eq!(queue.head(), c);
        assert_eq!(next_link(c), b);
        assert_eq!(next_link(b), a);
        assert_eq!(next_link(a), core::ptr::null_mut());

        queue.delete(a);
        queue.delete(b);
        queue.delete(c);
        free_all(&[a, b, c]);
    }

    #[test]
    fn delete_unlinks_from_any_position() {
        let a = make_thread();
        let b = make_thread();
        let c = make_thread();
        let mut queue = ThreadQueue::new();
        queue.insert(a);
        queue.insert(b);
        queue.insert(c); // order: c, b, a

        queue.delete(b);

        assert_eq!(queue.head(), c);
        assert_eq!(next_link(c), a);
        assert_eq!(next_link(a), core::ptr::null_mut());

        queue.delete(a);
        queue.delete(c);
        assert!(queue.is_empty());
        free_all(&[a, b, c]);
    }

    #[test]
    fn delete_head_updates_head() {
        let a = make_thread();
        let mut queue = ThreadQueue::new();
        queue.insert(a);

        queue.delete(a);

        assert!(queue.is_empty());
        assert_eq!(queue.head(), core::ptr::null_mut());
        free_all(&[a]);
    }

    #[test]
    fn delete_is_noop_for_unlinked_thread() {
        let a = make_thread();
        let b = make_thread();
        let mut queue = ThreadQueue::new();
        queue.insert(a);

        // b was never inserted; deleting it must not disturb the queue.
        queue.delete(b);

        assert_eq!(queue.head(), a);
        queue.delete(a);
        free_all(&[a, b]);
    }

    #[test]
    fn search_ready_from_skips_non_ready_threads() {
        let a = make_thread();
        let b = make_thread();
        let c = make_thread();
        let mut queue = ThreadQueue::new();
        queue.insert(a);
        queue.insert(b);
        queue.insert(c); // order: c, b, a

        set_thread_state(c, ThreadState::Running);
        set_thread_state(b, ThreadState::Dead);
        set_thread_state(a, ThreadState::Ready);

        let found = queue.search_ready_from(queue.head());
        assert_eq!(found, Some(a));

        queue.delete(a);
        queue.delete(b);
        queue.delete(c);
        free_all(&[a, b, c]);
    }

    #[test]
    fn search_ready_from_wraps_to_head() {
        let a = make_thread();
        let b = make_thread();
        let c = make_thread();
        let mut queue = ThreadQueue::new();
        queue.insert(a);
        queue.insert(b);
        queue.insert(c); // order: c, b, a

        // Only the head is Ready; the "current" thread b sits in the middle
        // with nothing Ready between it and the tail, so a plain forward
        // search from b comes up empty and the caller has to retry from null.
        set_thread_state(c, ThreadState::Ready);
        set_thread_state(b, ThreadState::Running);
        set_thread_state(a, ThreadState::Dead);

        let forward = queue.search_ready_from(next_link(b));
        assert_eq!(forward, None);

        let wrapped = queue.search_ready_from(core::ptr::null_mut());
        assert_eq!(wrapped, Some(c));

        queue.delete(a);
        queue.delete(b);
        queue.delete(c);
        free_all(&[a, b, c]);
    }

    #[test]
    fn search_ready_from_returns_none_when_nothing_ready() {
        let a = make_thread();
        let mut queue = ThreadQueue::new();
        queue.insert(a);
        set_thread_state(a, ThreadState::Dead);

        assert_eq!(queue.search_ready_from(core::ptr::null_mut()), None);

        queue.delete(a);
        free_all(&[a]);
    }

    #[test]
    fn new_thread_is_ready_with_unique_tid() {
        let a = make_thread();
        let b = make_thread();

        assert_eq!(thread_state(a), ThreadState::Ready);
        assert_ne!(thread_tid(a), thread_tid(b));

        free_all(&[a, b]);
    }
}
