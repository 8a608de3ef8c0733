//! Task table and round-robin scheduler
//!
//! The kernel multiplexes a fixed table of eight task slots. Each slot owns
//! a register file (32-bit protected or 16-bit virtual-real), one task
//! descriptor and one local descriptor table allocated from the global
//! descriptor pool, and either a caller-supplied stack or one drawn from a
//! fixed pool. Selection is strict round-robin by slot index; the only
//! synchronization primitive in the system is a single switch-enable gate.
//! While the gate is closed, voluntary switch requests are silently ignored
//! (not deferred).
#![no_std]

extern crate alloc;

pub mod context;
mod stack;
mod task;

pub use stack::{StackPool, ENTRY_FRAME_BYTES, STACK_SIZE};
pub use task::{
    LocalEntries, Mode, Registers16, Registers32, Runnable, Task, TaskId, TaskState, Tss16,
    Tss32, IO_BITMAP_BYTES, IO_PERMISSION_OFFSET,
};

use alloc::boxed::Box;
use conquer_once::spin::OnceCell;
use core::sync::atomic::{AtomicBool, Ordering};
use gdt::{DescriptorTable, Entry, Selector};
use serial::serial_println;
use spin::Mutex;

/// Capacity of the task table
pub const MAX_TASKS: usize = 8;

/// Diagnostic snapshot of the task table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskSummary {
    pub active: usize,
    pub capacity: usize,
}

/// The mechanism that performs the actual context transfer
///
/// The scheduler only decides who runs next; raising the trap saves the
/// outgoing register file and loads the incoming one as a single
/// primitive, which is why no further locking surrounds the swap itself.
pub trait SwitchTrap {
    fn raise(&self, target: Selector);
}

/// The switch-enable gate
///
/// Closed during interrupt handlers and other critical sections. A closed
/// gate makes [`switch`] a silent no-op; requests are not queued.
pub struct SwitchGate {
    enabled: AtomicBool,
}

impl SwitchGate {
    pub const fn new() -> SwitchGate {
        SwitchGate {
            enabled: AtomicBool::new(true),
        }
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn can_switch(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// The table the entry trampoline consults on a task's first entry.
/// The one piece of module state here; everything else is explicit.
static ENTRY_TABLE: OnceCell<&'static Mutex<Scheduler>> = OnceCell::uninit();

/// Make `scheduler` the table whose current task the entry trampoline
/// claims its runnable from
pub fn register_entry_table(scheduler: &'static Mutex<Scheduler>) {
    ENTRY_TABLE.init_once(|| scheduler);
}

/// First code of every task
///
/// Reached through the frame the stack pool prepared; its address is
/// also what [`Scheduler::add`] seeds into the register file's
/// instruction pointer. Claims the slot's runnable and runs it.
pub(crate) extern "C" fn entry_trampoline() -> ! {
    let mut runnable = {
        let scheduler = match ENTRY_TABLE.get() {
            Some(scheduler) => *scheduler,
            None => panic!("task entered with no entry table registered"),
        };
        let mut sched = scheduler.lock();
        let id = sched.current();
        match sched.task_mut(id).take_runnable() {
            Some(runnable) => runnable,
            None => panic!("task entered twice"),
        }
    };
    runnable.run()
}

/// The fixed task table plus the round-robin cursor
///
/// Held behind a mutex by the kernel; kept as an explicit object so the
/// scheduling discipline has no hidden module state.
pub struct Scheduler {
    slots: [Task; MAX_TASKS],
    stacks: StackPool,
    current: usize,
    previous: usize,
}

impl Scheduler {
    pub const fn new() -> Scheduler {
        Scheduler {
            slots: [Task::EMPTY; MAX_TASKS],
            stacks: StackPool::new(),
            current: 0,
            previous: 0,
        }
    }

    /// Register a new task in the first free slot
    ///
    /// With no caller-supplied stack one is drawn from the fixed pool. The
    /// slot gets one task descriptor and one local-table descriptor from
    /// `gdt`, six flat privilege-differentiated local entries sized for
    /// `mode`, and a register file seeded with the stack pointer and, for
    /// protected-mode tasks, the active page-table root. The returned id
    /// stays valid until the task is retired.
    ///
    /// # Panics
    /// Panics when the table or the stack pool is exhausted; both pools are
    /// sized so that this cannot happen in a correctly configured system,
    /// and continuing without a slot would corrupt the one-descriptor-per-
    /// task invariant.
    pub fn add(
        &mut self,
        gdt: &mut DescriptorTable,
        runnable: Box<dyn Runnable + Send>,
        stack: Option<u32>,
        mode: Mode,
    ) -> TaskId {
        let index = match self.slots.iter().position(|t| !t.active) {
            Some(index) => index,
            None => panic!("task table exhausted"),
        };

        let entry_point = entry_trampoline as usize;
        // Pool stacks get a first-entry frame returning into the
        // trampoline; a caller-supplied stack is the caller's to prepare.
        let (stack_top, parked_sp, pool_stack) = match stack {
            Some(top) => (top, top as usize, None),
            None => match self.stacks.take() {
                Some((pool_index, top)) => {
                    let parked = self.stacks.prepare_entry_frame(pool_index, entry_point);
                    (top as u32, parked, Some(pool_index))
                }
                None => panic!("stack pool exhausted"),
            },
        };

        let bits32 = mode == Mode::Protected32;
        let task = &mut self.slots[index];
        task.pool_stack = pool_stack;
        task.runnable = Some(runnable);
        task.parked_sp = parked_sp;

        task.local_entries.null = Entry::empty();
        task.local_entries.kernel_code = Entry::code_segment(false, bits32);
        task.local_entries.kernel_data = Entry::data_segment(false, bits32);
        task.local_entries.user_code = Entry::code_segment(true, bits32);
        task.local_entries.user_data = Entry::data_segment(true, bits32);
        task.local_entries.stack = Entry::data_segment(false, bits32);

        let ldt_selector = gdt.allocate_entry();
        *gdt.entry_mut(ldt_selector) = Entry::system(
            &task.local_entries as *const LocalEntries as usize as u32,
            core::mem::size_of::<LocalEntries>() as u32 - 1,
            Entry::TYPE_LDT,
        );

        task.registers = match mode {
            Mode::Protected32 => {
                let mut tss = Tss32::zeroed();
                let regs = &mut tss.regs;
                regs.ldtr = ldt_selector.bits();
                regs.eip = entry_point as u32;
                regs.esp = stack_top;
                regs.ebp = stack_top;
                regs.esp0 = stack_top;
                regs.esp1 = stack_top;
                regs.esp2 = stack_top;
                regs.cs = gdt::KERNEL_CODE | gdt::LOCAL_TABLE;
                regs.ds = gdt::KERNEL_DATA | gdt::LOCAL_TABLE;
                regs.es = gdt::KERNEL_DATA | gdt::LOCAL_TABLE;
                regs.ss = gdt::KERNEL_DATA | gdt::LOCAL_TABLE;
                regs.fs = gdt::KERNEL_DATA | gdt::LOCAL_TABLE;
                regs.gs = gdt::KERNEL_DATA | gdt::LOCAL_TABLE;
                regs.ss0 = gdt::KERNEL_DATA | gdt::LOCAL_TABLE;
                regs.ss1 = gdt::KERNEL_DATA | gdt::LOCAL_TABLE;
                regs.ss2 = gdt::KERNEL_DATA | gdt::LOCAL_TABLE;
                regs.iopb = IO_PERMISSION_OFFSET;
                regs.cr3 = active_page_table_root();
                serial_println!(
                    "task: new protected-mode task in slot {}, esp={:#x}",
                    index,
                    stack_top
                );
                TaskState::Protected(tss)
            }
            Mode::VirtualReal16 => {
                let mut tss = Tss16::zeroed();
                let regs = &mut tss.regs;
                regs.ldtr = ldt_selector.bits();
                regs.ip = entry_point as u16;
                regs.sp = stack_top as u16;
                regs.bp = stack_top as u16;
                regs.sp0 = stack_top as u16;
                regs.sp1 = stack_top as u16;
                regs.sp2 = stack_top as u16;
                regs.cs = gdt::KERNEL_CODE | gdt::LOCAL_TABLE;
                regs.ds = gdt::KERNEL_DATA | gdt::LOCAL_TABLE;
                regs.es = gdt::KERNEL_DATA | gdt::LOCAL_TABLE;
                regs.ss = gdt::KERNEL_DATA | gdt::LOCAL_TABLE;
                regs.ss0 = gdt::KERNEL_DATA | gdt::LOCAL_TABLE;
                regs.ss1 = gdt::KERNEL_DATA | gdt::LOCAL_TABLE;
                regs.ss2 = gdt::KERNEL_DATA | gdt::LOCAL_TABLE;
                serial_println!(
                    "task: new virtual-real task in slot {}, sp={:#x}",
                    index,
                    stack_top as u16
                );
                TaskState::VirtualReal(tss)
            }
        };

        // The descriptor is based on the hardware-layout state inside the
        // slot, not on the slot struct itself; the variant is fixed for
        // the task's lifetime so the payload address is stable.
        let (tss_base, tss_limit, tss_type) = match &task.registers {
            TaskState::Protected(tss) => (
                tss as *const Tss32 as usize as u32,
                core::mem::size_of::<Tss32>() as u32 - 1,
                Entry::TYPE_TSS32_AVAILABLE,
            ),
            TaskState::VirtualReal(tss) => (
                tss as *const Tss16 as usize as u32,
                core::mem::size_of::<Tss16>() as u32 - 1,
                Entry::TYPE_TSS16_AVAILABLE,
            ),
        };
        let tss_selector = gdt.allocate_entry();
        *gdt.entry_mut(tss_selector) = Entry::system(tss_base, tss_limit, tss_type);

        task.tss_selector = tss_selector;
        task.ldt_selector = ldt_selector;
        task.active = true;
        TaskId(index)
    }

    /// Retire a task, making its slot, descriptors and pool stack reusable
    ///
    /// The caller of a self-retire must switch away immediately afterwards
    /// and can never be scheduled again. Retiring an inactive slot is a
    /// no-op.
    pub fn retire(&mut self, gdt: &mut DescriptorTable, id: TaskId) {
        let pool_stack = {
            let task = &mut self.slots[id.index()];
            if !task.active {
                return;
            }
            task.active = false;
            task.runnable = None;
            gdt.release_entry(task.tss_selector);
            gdt.release_entry(task.ldt_selector);
            task.tss_selector = Selector::new(0);
            task.ldt_selector = Selector::new(0);
            task.pool_stack.take()
        };
        if let Some(pool_index) = pool_stack {
            self.stacks.release(pool_index);
        }
    }

    /// Pick the next task: the first active slot after the current one,
    /// wrapping around, with the current slot itself as the last resort
    ///
    /// # Panics
    /// Panics when no slot is active. In practice the idle task guarantees
    /// at least one.
    pub fn schedule(&mut self) -> TaskId {
        for step in 1..=MAX_TASKS {
            let index = (self.current + step) % MAX_TASKS;
            if self.slots[index].active {
                self.previous = self.current;
                self.current = index;
                return TaskId(index);
            }
        }
        panic!("no active task to schedule");
    }

    /// Slot currently selected for execution
    pub fn current(&self) -> TaskId {
        TaskId(self.current)
    }

    /// Slot that was current before the last [`schedule`](Self::schedule),
    /// i.e. the task a transfer switches away from
    pub fn previous(&self) -> TaskId {
        TaskId(self.previous)
    }

    pub fn task(&self, id: TaskId) -> &Task {
        &self.slots[id.index()]
    }

    pub fn task_mut(&mut self, id: TaskId) -> &mut Task {
        &mut self.slots[id.index()]
    }

    /// Diagnostic snapshot, no side effects
    pub fn summary(&self) -> TaskSummary {
        TaskSummary {
            active: self.slots.iter().filter(|t| t.active).count(),
            capacity: MAX_TASKS,
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Scheduler::new()
    }
}

/// Voluntary yield, the universal "let other work happen" primitive
///
/// Gate closed: returns immediately. Otherwise picks the next task,
/// releases the table lock, and raises the switch trap at its descriptor.
/// Wait loops call this repeatedly instead of blocking.
pub fn switch(gate: &SwitchGate, scheduler: &Mutex<Scheduler>, trap: &dyn SwitchTrap) {
    if !gate.can_switch() {
        return;
    }
    let target = {
        let mut sched = scheduler.lock();
        let id = sched.schedule();
        sched.task(id).tss_selector()
    };
    // The lock must be dropped before the transfer; the next task may
    // yield right back.
    trap.raise(target);
}

/// Busy-wait for roughly `usec` microseconds
///
/// One spin hint per count, an uncalibrated approximation: the polling
/// helpers built on top only need an order of magnitude, not a clock.
pub fn sleep(usec: u32) {
    for _ in 0..usec {
        core::hint::spin_loop();
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
fn active_page_table_root() -> u32 {
    let cr3: u64;
    unsafe {
        core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack));
    }
    cr3 as u32
}

/// New protected-mode tasks share the kernel address space; off target
/// there is no paging root to capture.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
fn active_page_table_root() -> u32 {
    0
}

#[cfg(test)]
mod tests {
    extern crate std;

    use super::*;
    use std::cell::RefCell;
    use std::vec::Vec;

    fn idle() -> Box<dyn Runnable + Send> {
        Box::new(|| loop {
            core::hint::spin_loop();
        })
    }

    /// Records every trap raise instead of transferring control
    struct RecordingTrap {
        raised: RefCell<Vec<Selector>>,
    }

    impl RecordingTrap {
        fn new() -> RecordingTrap {
            RecordingTrap {
                raised: RefCell::new(Vec::new()),
            }
        }
    }

    impl SwitchTrap for RecordingTrap {
        fn raise(&self, target: Selector) {
            self.raised.borrow_mut().push(target);
        }
    }

    #[test]
    fn add_fills_slots_in_order() {
        let mut gdt = DescriptorTable::new();
        let mut sched = Scheduler::new();
        let a = sched.add(&mut gdt, idle(), None, Mode::Protected32);
        let b = sched.add(&mut gdt, idle(), None, Mode::VirtualReal16);
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 1);
        assert_eq!(sched.task(a).mode(), Mode::Protected32);
        assert_eq!(sched.task(b).mode(), Mode::VirtualReal16);
        assert_eq!(sched.summary(), TaskSummary { active: 2, capacity: 8 });
    }

    #[test]
    fn caller_stack_seeds_the_register_file() {
        let mut gdt = DescriptorTable::new();
        let mut sched = Scheduler::new();
        let id = sched.add(&mut gdt, idle(), Some(0x8000), Mode::Protected32);
        match sched.task(id).registers() {
            TaskState::Protected(tss) => {
                let esp = tss.regs.esp;
                let cs = tss.regs.cs;
                let ss0 = tss.regs.ss0;
                let iopb = tss.regs.iopb;
                let ldtr = tss.regs.ldtr;
                assert_eq!(esp, 0x8000);
                assert_eq!(cs, gdt::KERNEL_CODE | gdt::LOCAL_TABLE);
                assert_eq!(ss0, gdt::KERNEL_DATA | gdt::LOCAL_TABLE);
                assert_eq!(iopb, IO_PERMISSION_OFFSET);
                assert_eq!(ldtr, sched.task(id).ldt_selector().bits());
            }
            TaskState::VirtualReal(_) => panic!("wrong state variant"),
        }
    }

    #[test]
    fn entry_point_is_seeded_into_the_register_file() {
        let mut gdt = DescriptorTable::new();
        let mut sched = Scheduler::new();
        let expected = entry_trampoline as usize;

        let prot = sched.add(&mut gdt, idle(), None, Mode::Protected32);
        match sched.task(prot).registers() {
            TaskState::Protected(tss) => {
                let eip = tss.regs.eip;
                assert_ne!(eip, 0, "entry point was never seeded");
                assert_eq!(eip, expected as u32);
            }
            TaskState::VirtualReal(_) => panic!("wrong state variant"),
        }
        // the pool stack is parked on a frame returning into the same
        // entry point
        assert_ne!(sched.task(prot).parked_sp(), 0);

        let v86 = sched.add(&mut gdt, idle(), None, Mode::VirtualReal16);
        match sched.task(v86).registers() {
            TaskState::VirtualReal(tss) => {
                let ip = tss.regs.ip;
                assert_eq!(ip, expected as u16);
            }
            TaskState::Protected(_) => panic!("wrong state variant"),
        }
    }

    #[test]
    fn task_descriptor_covers_the_hardware_state() {
        let mut gdt = DescriptorTable::new();
        let mut sched = Scheduler::new();
        let id = sched.add(&mut gdt, idle(), None, Mode::Protected32);

        let entry = *gdt.entry(sched.task(id).tss_selector());
        assert_eq!(entry.limit() as usize, core::mem::size_of::<Tss32>() - 1);
        let base = match sched.task(id).registers() {
            TaskState::Protected(tss) => tss as *const Tss32 as usize as u32,
            TaskState::VirtualReal(_) => panic!("wrong state variant"),
        };
        assert_eq!(entry.base(), base);
        // the bitmap sits immediately after the register file
        assert_eq!(IO_PERMISSION_OFFSET as usize, core::mem::size_of::<Registers32>());
    }

    #[test]
    fn virtual_real_tasks_get_sixteen_bit_registers() {
        let mut gdt = DescriptorTable::new();
        let mut sched = Scheduler::new();
        let id = sched.add(&mut gdt, idle(), Some(0x1FFE), Mode::VirtualReal16);
        match sched.task(id).registers() {
            TaskState::VirtualReal(tss) => {
                let sp = tss.regs.sp;
                let ss2 = tss.regs.ss2;
                assert_eq!(sp, 0x1FFE);
                assert_eq!(ss2, gdt::KERNEL_DATA | gdt::LOCAL_TABLE);
            }
            TaskState::Protected(_) => panic!("wrong state variant"),
        }
    }

    #[test]
    fn each_task_owns_two_descriptors() {
        let mut gdt = DescriptorTable::new();
        let mut sched = Scheduler::new();
        let before = gdt.present_entries();
        let id = sched.add(&mut gdt, idle(), None, Mode::Protected32);
        assert_eq!(gdt.present_entries(), before + 2);
        assert_ne!(sched.task(id).tss_selector(), sched.task(id).ldt_selector());
    }

    #[test]
    fn round_robin_visits_every_active_slot_once_per_cycle() {
        let mut gdt = DescriptorTable::new();
        let mut sched = Scheduler::new();
        for _ in 0..3 {
            sched.add(&mut gdt, idle(), None, Mode::Protected32);
        }
        // current starts at slot 0
        let order: Vec<usize> = (0..6).map(|_| sched.schedule().index()).collect();
        assert_eq!(order, std::vec![1, 2, 0, 1, 2, 0]);
    }

    #[test]
    fn schedule_skips_inactive_slots() {
        let mut gdt = DescriptorTable::new();
        let mut sched = Scheduler::new();
        let a = sched.add(&mut gdt, idle(), None, Mode::Protected32);
        let b = sched.add(&mut gdt, idle(), None, Mode::Protected32);
        let c = sched.add(&mut gdt, idle(), None, Mode::Protected32);
        assert_eq!(sched.schedule(), b);
        sched.retire(&mut gdt, c);
        // from slot 1, slot 2 is gone: wrap to slot 0, not slot 2
        assert_eq!(sched.schedule(), a);
    }

    #[test]
    fn schedule_tracks_the_outgoing_slot() {
        let mut gdt = DescriptorTable::new();
        let mut sched = Scheduler::new();
        let a = sched.add(&mut gdt, idle(), None, Mode::Protected32);
        let b = sched.add(&mut gdt, idle(), None, Mode::Protected32);

        assert_eq!(sched.schedule(), b);
        assert_eq!(sched.previous(), a);
        assert_eq!(sched.schedule(), a);
        assert_eq!(sched.previous(), b);
    }

    #[test]
    fn sleep_returns() {
        sleep(0);
        sleep(50);
    }

    #[test]
    fn sole_active_task_keeps_running() {
        let mut gdt = DescriptorTable::new();
        let mut sched = Scheduler::new();
        let only = sched.add(&mut gdt, idle(), None, Mode::Protected32);
        assert_eq!(sched.schedule(), only);
        assert_eq!(sched.schedule(), only);
    }

    #[test]
    #[should_panic(expected = "no active task")]
    fn empty_table_cannot_schedule() {
        Scheduler::new().schedule();
    }

    #[test]
    #[should_panic(expected = "task table exhausted")]
    fn table_exhaustion_is_fatal() {
        let mut gdt = DescriptorTable::new();
        let mut sched = Scheduler::new();
        for _ in 0..=MAX_TASKS {
            sched.add(&mut gdt, idle(), None, Mode::Protected32);
        }
    }

    #[test]
    fn retire_releases_slot_descriptors_and_stack() {
        let mut gdt = DescriptorTable::new();
        let mut sched = Scheduler::new();
        let baseline = gdt.present_entries();
        let a = sched.add(&mut gdt, idle(), None, Mode::Protected32);
        sched.add(&mut gdt, idle(), None, Mode::Protected32);

        sched.retire(&mut gdt, a);
        assert!(!sched.task(a).is_active());
        assert_eq!(gdt.present_entries(), baseline + 2);

        // slot, descriptors and pool stack are all reusable
        let again = sched.add(&mut gdt, idle(), None, Mode::VirtualReal16);
        assert_eq!(again.index(), a.index());
        assert_eq!(gdt.present_entries(), baseline + 4);
    }

    #[test]
    fn runnable_is_handed_over_exactly_once() {
        let mut gdt = DescriptorTable::new();
        let mut sched = Scheduler::new();
        let id = sched.add(&mut gdt, idle(), None, Mode::Protected32);
        assert!(sched.task_mut(id).take_runnable().is_some());
        assert!(sched.task_mut(id).take_runnable().is_none());
    }

    #[test]
    fn retire_of_inactive_slot_is_a_no_op() {
        let mut gdt = DescriptorTable::new();
        let mut sched = Scheduler::new();
        sched.retire(&mut gdt, TaskId(5));
        assert_eq!(sched.summary().active, 0);
    }

    #[test]
    fn switch_raises_at_the_next_task_descriptor() {
        let mut gdt = DescriptorTable::new();
        let mut sched = Scheduler::new();
        let a = sched.add(&mut gdt, idle(), None, Mode::Protected32);
        let b = sched.add(&mut gdt, idle(), None, Mode::Protected32);
        let sel_a = sched.task(a).tss_selector();
        let sel_b = sched.task(b).tss_selector();

        let gate = SwitchGate::new();
        let trap = RecordingTrap::new();
        let scheduler = Mutex::new(sched);

        switch(&gate, &scheduler, &trap);
        switch(&gate, &scheduler, &trap);
        switch(&gate, &scheduler, &trap);
        let raised = trap.raised.borrow();
        assert_eq!(&raised[..], &[sel_b, sel_a, sel_b]);
        // no two consecutive raises target the same descriptor
        assert!(raised.windows(2).all(|w| w[0] != w[1]));
    }

    #[test]
    fn closed_gate_makes_switch_a_silent_no_op() {
        let mut gdt = DescriptorTable::new();
        let mut sched = Scheduler::new();
        sched.add(&mut gdt, idle(), None, Mode::Protected32);
        sched.add(&mut gdt, idle(), None, Mode::Protected32);

        let gate = SwitchGate::new();
        let trap = RecordingTrap::new();
        let scheduler = Mutex::new(sched);

        gate.disable();
        assert!(!gate.can_switch());
        switch(&gate, &scheduler, &trap);
        assert!(trap.raised.borrow().is_empty());
        assert_eq!(scheduler.lock().current().index(), 0);

        gate.enable();
        switch(&gate, &scheduler, &trap);
        assert_eq!(trap.raised.borrow().len(), 1);
    }
}
