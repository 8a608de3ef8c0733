//! Kernel glue: the global descriptor table, the interrupt vector table,
//! the scheduler, and the switch trap that ties them together.
//!
//! The member crates hold all of the mechanism as plain objects; this
//! crate is the only place the kernel-wide instances live. Everything is
//! behind spinlocks because the timer interrupt and the running task both
//! reach the task table, and every mainline entry point masks interrupts
//! around its lock scope so the timer handler can never spin on a lock
//! its own interrupted context holds.
//!
//! Context transfer is done in software: the descriptor and vector tables
//! record each task's identity and gate assignments, while the switch
//! itself parks the outgoing callee-saved state on its stack and resumes
//! the incoming task from its parked stack pointer.
#![no_std]

extern crate alloc;

pub mod heap;

use alloc::boxed::Box;
use conquer_once::spin::OnceCell;
use gdt::ivt::VectorTable;
use gdt::{DescriptorTable, Selector};
use lazy_static::lazy_static;
use lowmem::LowMemory;
use pic8259::ChainedPics;
use serial::serial_println;
use spin::Mutex;
use task::{Mode, Runnable, Scheduler, SwitchGate, SwitchTrap, TaskId, TaskSummary};
use x86_64::instructions::interrupts;

pub const PIC_1_OFFSET: u8 = 32;
pub const PIC_2_OFFSET: u8 = PIC_1_OFFSET + 8;

/// Hardware interrupt line of the programmable interval timer
pub const TIMER_VECTOR: u8 = PIC_1_OFFSET;

lazy_static! {
    /// The one descriptor table the CPU sees
    pub static ref GDT: Mutex<DescriptorTable> = Mutex::new(DescriptorTable::new());

    /// All 256 interrupt vectors, including the task-gate switch vector
    pub static ref VECTORS: Mutex<VectorTable> = Mutex::new(VectorTable::new());
}

pub static PICS: Mutex<ChainedPics> =
    Mutex::new(unsafe { ChainedPics::new(PIC_1_OFFSET, PIC_2_OFFSET) });

static SCHEDULER: OnceCell<Mutex<Scheduler>> = OnceCell::uninit();

/// The kernel-wide switch-enable gate
pub static SWITCH_GATE: SwitchGate = SwitchGate::new();

/// The real context-transfer mechanism
///
/// Retargets the switch vector's gate at the chosen descriptor, then
/// parks the outgoing task's stack pointer in its slot and loads the
/// incoming task's parked one. The outgoing slot is the scheduler's
/// `previous`, recorded when the incoming task was selected.
pub struct ContextSwitch;

impl SwitchTrap for ContextSwitch {
    fn raise(&self, target: Selector) {
        VECTORS.lock().set_task_gate(target);
        let (park, load) = {
            let mut sched = scheduler().lock();
            // A sole active task reschedules onto itself; its parked frame
            // is stale while it runs, so there is nothing to transfer.
            if sched.previous() == sched.current() {
                return;
            }
            let load = sched.task(sched.current()).parked_sp();
            let outgoing = sched.previous();
            (sched.task_mut(outgoing).parked_sp_mut() as *mut usize, load)
        };
        // The lock is already released: interrupts are masked on every
        // path that reaches here, and nothing else touches the two slots
        // until the transfer completes.
        unsafe {
            task::context::transfer(park, load);
        }
    }
}

/// 1. Bring up the serial port
/// 2. Initialize the heap
/// 3. Bind the timer vector and the entry table
/// 4. Register the running kernel thread and the idle task
pub fn init() {
    serial::init();
    heap::init();
    VECTORS.lock().bind_service(TIMER_VECTOR, timer_tick);

    SCHEDULER.init_once(|| Mutex::new(Scheduler::new()));
    let scheduler = scheduler();
    task::register_entry_table(scheduler);

    // Slot 0 describes the thread that is already executing; its runnable
    // is only entered if the kernel task is ever restarted. The idle task
    // keeps the table non-empty so schedule() always has a candidate.
    let kernel = Box::new(|| halt_loop());
    let idle = Box::new(|| loop {
        yield_now();
        x86_64::instructions::hlt();
    });
    let mut sched = scheduler.lock();
    let id = sched.add(&mut GDT.lock(), kernel, None, Mode::Protected32);
    sched.add(&mut GDT.lock(), idle, None, Mode::Protected32);
    serial_println!("kernel registered as task {:?}", id);
}

fn scheduler() -> &'static Mutex<Scheduler> {
    match SCHEDULER.get() {
        Some(scheduler) => scheduler,
        None => panic!("scheduler used before init"),
    }
}

/// Voluntarily hand the CPU to the next active task
///
/// Interrupts stay masked across the scheduling decision and the
/// transfer; the incoming task restores its own interrupt state.
pub fn yield_now() {
    interrupts::without_interrupts(|| {
        task::switch(&SWITCH_GATE, scheduler(), &ContextSwitch);
    });
}

/// Timer interrupt body: preempt the current task
///
/// The gate is closed for the duration so the outgoing task cannot race a
/// voluntary switch against the preemption, and reopened before the end
/// of interrupt is signalled.
pub fn timer_tick() {
    SWITCH_GATE.disable();
    if let Some(scheduler) = SCHEDULER.get() {
        let target = {
            let mut sched = scheduler.lock();
            let id = sched.schedule();
            sched.task(id).tss_selector()
        };
        ContextSwitch.raise(target);
    }
    SWITCH_GATE.enable();
    unsafe {
        PICS.lock().notify_end_of_interrupt(TIMER_VECTOR);
    }
}

/// Register a virtual-real-mode task and place a legacy MZ image into low
/// memory for it
///
/// On any load failure the half-built task is retired again and `None` is
/// returned; low memory and the descriptor pool are left as they were.
pub fn launch_legacy(low: &mut LowMemory, image: &[u8]) -> Option<TaskId> {
    interrupts::without_interrupts(|| {
        let scheduler = scheduler();
        let shell: Box<dyn Runnable + Send> = Box::new(|| halt_loop());
        let id = scheduler
            .lock()
            .add(&mut GDT.lock(), shell, None, Mode::VirtualReal16);

        let mut sched = scheduler.lock();
        match mz::load(sched.task_mut(id), low, image) {
            Ok(segment) => {
                serial_println!("launched legacy image at segment {:#x}", segment);
                Some(id)
            }
            Err(err) => {
                serial_println!("legacy image rejected: {}", err);
                sched.retire(&mut GDT.lock(), id);
                None
            }
        }
    })
}

/// Remove a task and release its descriptors and stack
pub fn retire(id: TaskId) {
    interrupts::without_interrupts(|| {
        scheduler().lock().retire(&mut GDT.lock(), id);
    });
}

pub fn task_summary() -> TaskSummary {
    interrupts::without_interrupts(|| scheduler().lock().summary())
}

///Halts the CPU on a loop without return
pub fn halt_loop() -> ! {
    loop {
        x86_64::instructions::hlt();
    }
}
