//! Preemptive per-CPU thread scheduler.
//!
//! Each CPU owns a run queue and a dead queue of [`thread::Thread`]s
//! ([`percpu::Cpu::run_queue`]/`dead_queue`). Scheduling never crosses CPUs
//! except when a new thread is first placed on its chosen CPU's run queue:
//! once running, a thread stays on the CPU it started on. Preemption is
//! driven by each CPU's own LAPIC, programmed one-shot for
//! [`crate::config::TIMESLICE_NS`] on a dynamically allocated vector shared
//! by every CPU.

pub mod process;
pub mod thread;

extern crate alloc;

use core::sync::atomic::{AtomicU32, AtomicU8, Ordering};

use thread::{ThreadState, Tid};

use crate::arch::x86_64::interrupts::dispatch;
use crate::id::CpuId;
use crate::percpu::{self, Cpu};

/// Vector the scheduler's one-shot preemption timer fires on. Allocated
/// once, during [`init`], and shared by every CPU (each CPU only ever
/// programs its own LAPIC, so one vector suffices).
static PREEMPT_VECTOR: AtomicU8 = AtomicU8::new(0);

/// Next CPU to hand a new kernel thread to, round-robin over the CPUs that
/// have registered themselves so far.
static NEXT_CPU: AtomicU32 = AtomicU32::new(0);

/// Installs the scheduler's preemption handler and brings up the calling
/// CPU's queues.
///
/// Must run after `percpu`/ACPI bring-up (so `dispatch::alloc_vector` and
/// `current_cpu()` work) and before the caller enables interrupts for good.
/// Called once by the BSP; each AP calls [`init_cpu`] instead once it has
/// its own `Cpu` record and LAPIC running.
pub fn init() {
    let vector = dispatch::alloc_vector().expect("no free vector for scheduler preemption");
    dispatch::register_handler(vector, preempt_handler)
        .expect("scheduler preemption vector already registered");
    PREEMPT_VECTOR.store(vector, Ordering::Release);

    crate::klog_info!("scheduler: preemption vector {}", vector);

    init_cpu();
}

/// Brings up the calling CPU's scheduler state: spawns its reaper thread.
///
/// Called once per CPU (BSP from [`init`], each AP from its own bring-up)
/// after that CPU's `Cpu` record is registered and its LAPIC is running.
pub fn init_cpu() {
    new_kthread_here(reaper_main, 0);
}

/// Interrupt handler for the scheduler's preemption vector.
///
/// Runs on whichever CPU's one-shot timer fired. Sends LAPIC EOI before
/// yielding: `yield_now` reprograms the same LAPIC's timer, which needs the
/// in-service bit for this vector cleared first.
fn preempt_handler(_vector: u8) {
    crate::arch::x86_64::acpi::send_lapic_eoi();
    yield_now();
}

/// Picks the CPU a new kernel thread should start on: round-robin over all
/// CPUs registered so far.
fn pick_cpu() -> CpuId {
    let count = percpu::cpu_count().max(1);
    let idx = NEXT_CPU.fetch_add(1, Ordering::Relaxed) % count;
    CpuId::new(idx)
}

/// Creates a new kernel thread, enqueues it `Ready` on a round-robin-picked
/// CPU, and returns its id.
///
/// `start` receives `arg` and its return value becomes the exit code passed
/// to [`thread_exit`] when it returns.
pub fn new_kthread(start: extern "C" fn(u64) -> u64, arg: u64) -> Tid {
    let cpu_id = pick_cpu();
    spawn_on(cpu_id, start, arg)
}

/// Creates a new kernel thread and enqueues it on the calling CPU.
fn new_kthread_here(start: extern "C" fn(u64) -> u64, arg: u64) -> Tid {
    spawn_on(percpu::current_cpu().get_cpu_id(), start, arg)
}

fn spawn_on(cpu_id: CpuId, start: extern "C" fn(u64) -> u64, arg: u64) -> Tid {
    let thread = thread::new_thread(start, arg);
    let tid = thread::thread_tid(thread);

    process::KERNEL_PROCESS.register_thread(tid);

    let cpu = percpu::cpu_by_id(cpu_id).expect("pick_cpu chose an unregistered CPU");
    cpu.run_queue.lock().insert(thread);

    tid
}

/// Gives up the remainder of the current timeslice and runs the scheduler.
///
/// Implements the same five steps as the original design this port is
/// based on: stop the local timer, requeue the current thread if it's still
/// alive, pick the next `Ready` thread (wrapping back to the head of the
/// queue), program a fresh one-shot timeslice, and context-switch into it.
/// A CPU with no other `Ready` thread just switches back into itself.
pub fn yield_now() {
    let cpu = percpu::current_cpu();
    let was_enabled = cpu.set_interrupts(false);

    stop_local_timer();

    let current = cpu.current_thread();
    let mut run_queue = cpu.run_queue.lock();

    if !current.is_null() && thread::thread_state(current) != ThreadState::Dead {
        thread::set_thread_state(current, ThreadState::Ready);
    }

    let search_start = if current.is_null() {
        core::ptr::null_mut()
    } else {
        thread::next_link(current)
    };

    let next = run_queue
        .search_ready_from(search_start)
        .or_else(|| run_queue.search_ready_from(core::ptr::null_mut()))
        .unwrap_or(current);

    if next.is_null() {
        crate::error::set_kind(crate::error::PanicKind::ResourceExhaustion);
        panic!("no ready thread to schedule");
    }

    thread::set_thread_state(next, ThreadState::Running);
    cpu.set_current_thread(next);
    drop(run_queue);

    arm_local_timer(cpu);

    if next != current {
        // The very first `yield_now` on a CPU runs on its boot stack, not a
        // `Thread` the scheduler knows about; there's nowhere meaningful to
        // save that outgoing stack pointer, so give `ctx_switch` a scratch
        // slot it's free to discard.
        let mut discard: u64 = 0;
        let old_sp_slot = if current.is_null() {
            &mut discard as *mut u64
        } else {
            thread::sp_slot(current)
        };
        let new_sp = thread::sp_value(next);
        // SAFETY: `next` was just dequeued as Ready and its saved `sp` came
        // from either `Thread::new` or a prior `ctx_switch` out of it.
        // `old_sp_slot` is a valid slot: either inside the live `current`
        // thread or the local `discard` above.
        unsafe { thread::ctx_switch(old_sp_slot, new_sp) };
    }

    cpu.set_interrupts(was_enabled);
}

fn stop_local_timer() {
    if let Some(lapic_virt) = crate::arch::x86_64::acpi::lapic_virt() {
        // SAFETY: lapic_virt points at this CPU's own mapped LAPIC MMIO.
        let lapic = unsafe { crate::arch::x86_64::hw::local_apic::LocalApic::new(lapic_virt) };
        lapic.stop_timer();
    }
}

fn arm_local_timer(cpu: &Cpu) {
    let Some(lapic_virt) = crate::arch::x86_64::acpi::lapic_virt() else {
        return;
    };
    let ticks_per_ms = cpu.lapic_calibration_ticks();
    if ticks_per_ms == 0 {
        return;
    }
    let ticks = ((ticks_per_ms * crate::config::TIMESLICE_NS) / 1_000_000).max(1);
    #[allow(clippy::cast_possible_truncation)]
    let initial_count = ticks.min(u64::from(u32::MAX)) as u32;

    let vector = PREEMPT_VECTOR.load(Ordering::Acquire);
    // SAFETY: lapic_virt points at this CPU's own mapped LAPIC MMIO.
    let lapic = unsafe { crate::arch::x86_64::hw::local_apic::LocalApic::new(lapic_virt) };
    lapic.start_timer_oneshot(vector, initial_count, 16);
}

/// Terminates the calling thread. Marks it `Dead`, moves it from the run
/// queue to the dead queue for the reaper to free, and yields — it never
/// returns.
pub fn thread_exit(_ret: u64) -> ! {
    let cpu = percpu::current_cpu();
    let was_enabled = cpu.set_interrupts(false);

    let current = cpu.current_thread();
    assert!(!current.is_null(), "thread_exit with no current thread");
    thread::set_thread_state(current, ThreadState::Dead);

    {
        let mut run_queue = cpu.run_queue.lock();
        run_queue.delete(current);
    }
    {
        let mut dead_queue = cpu.dead_queue.lock();
        dead_queue.insert(current);
    }

    cpu.set_interrupts(was_enabled);
    yield_now();
    unreachable!("a dead thread was rescheduled");
}

/// Entry point `thread::thread_entry_trampoline` calls into on thread exit.
/// Exists so the raw asm trampoline has a plain `extern "C"` symbol to call
/// rather than reaching across modules into a generic Rust function.
pub(crate) extern "C" fn thread_exit_asm_entry(ret: u64) -> ! {
    thread_exit(ret)
}

/// Reaper loop: one spawned per CPU by [`init_cpu`]. Frees every thread on
/// the local dead queue, then yields, forever.
extern "C" fn reaper_main(_arg: u64) -> u64 {
    loop {
        let cpu = percpu::current_cpu();
        loop {
            let mut dead_queue = cpu.dead_queue.lock();
            let head = dead_queue.head();
            if head.is_null() {
                break;
            }
            dead_queue.delete(head);
            drop(dead_queue);
            // SAFETY: head was just unlinked from the dead queue, the only
            // place a pointer to it could still live, and it is not the
            // currently running thread (dead threads never resume).
            unsafe { thread::free_thread(head) };
        }
        yield_now();
    }
}

/// Runs the scheduler forever on the calling CPU. Called once bring-up has
/// finished; returns only if every thread on this CPU exits, which never
/// happens in practice (the reaper never exits).
pub fn idle_loop() -> ! {
    loop {
        yield_now();
        // SAFETY: interrupts are enabled by yield_now's restore; halting
        // until the next one (the preemption timer or any other IRQ) just
        // saves power between quanta.
        unsafe { crate::arch::x86_64::instructions::interrupts::enable_and_hlt() };
    }
}
