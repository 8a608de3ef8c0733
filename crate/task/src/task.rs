//! Task control blocks and their register files

use alloc::boxed::Box;
use gdt::{Entry, Selector};

/// Offset of the I/O permission bitmap from the base of a 32-bit task
/// state segment, derived from the register-file layout so the two can
/// never drift apart.
pub const IO_PERMISSION_OFFSET: u16 = core::mem::size_of::<Registers32>() as u16;

/// Size of the embedded I/O permission bitmap
pub const IO_BITMAP_BYTES: usize = 256 / 8;

/// Execution mode of a task, fixed at creation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Flat 32-bit supervisor task
    Protected32,
    /// 16-bit virtual-real-mode task confined to the low megabyte
    VirtualReal16,
}

/// Index of a task's slot in the task table, valid for the task's lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(pub(crate) usize);

impl TaskId {
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Entry-point capability of a task
///
/// Replaces a raw function pointer: anything callable can be scheduled
/// without giving up type safety. The switch mechanism runs the task's
/// runnable on first entry; it never returns.
pub trait Runnable {
    fn run(&mut self) -> !;
}

impl<F> Runnable for F
where
    F: FnMut(),
{
    fn run(&mut self) -> ! {
        // The closure is expected to diverge; one that returns is simply
        // entered again.
        loop {
            self();
        }
    }
}

/// Register file of a 16-bit virtual-real-mode task
///
/// Layout matches the hardware 16-bit task state segment, including the
/// three stack pointer/segment shadow pairs used on privilege transitions.
#[repr(C, packed)]
pub struct Registers16 {
    pub link: u16,
    pub sp0: u16,
    pub ss0: u16,
    pub sp1: u16,
    pub ss1: u16,
    pub sp2: u16,
    pub ss2: u16,
    pub ip: u16,
    pub flags: u16,
    pub ax: u16,
    pub cx: u16,
    pub dx: u16,
    pub bx: u16,
    pub sp: u16,
    pub bp: u16,
    pub si: u16,
    pub di: u16,
    pub es: u16,
    pub cs: u16,
    pub ss: u16,
    pub ds: u16,
    pub ldtr: u16,
}

impl Registers16 {
    pub const fn zeroed() -> Registers16 {
        Registers16 {
            link: 0,
            sp0: 0,
            ss0: 0,
            sp1: 0,
            ss1: 0,
            sp2: 0,
            ss2: 0,
            ip: 0,
            flags: 0,
            ax: 0,
            cx: 0,
            dx: 0,
            bx: 0,
            sp: 0,
            bp: 0,
            si: 0,
            di: 0,
            es: 0,
            cs: 0,
            ss: 0,
            ds: 0,
            ldtr: 0,
        }
    }
}

/// Register file of a 32-bit protected-mode task, hardware layout
#[repr(C, packed)]
pub struct Registers32 {
    pub link: u16,
    reserved1: u16,
    pub esp0: u32,
    pub ss0: u16,
    reserved2: u16,
    pub esp1: u32,
    pub ss1: u16,
    reserved3: u16,
    pub esp2: u32,
    pub ss2: u16,
    reserved4: u16,
    pub cr3: u32,
    pub eip: u32,
    pub eflags: u32,
    pub eax: u32,
    pub ecx: u32,
    pub edx: u32,
    pub ebx: u32,
    pub esp: u32,
    pub ebp: u32,
    pub esi: u32,
    pub edi: u32,
    pub es: u16,
    reserved5: u16,
    pub cs: u16,
    reserved6: u16,
    pub ss: u16,
    reserved7: u16,
    pub ds: u16,
    reserved8: u16,
    pub fs: u16,
    reserved9: u16,
    pub gs: u16,
    reserved10: u16,
    pub ldtr: u16,
    reserved11: u16,
    reserved12: u16,
    pub iopb: u16,
}

impl Registers32 {
    pub const fn zeroed() -> Registers32 {
        Registers32 {
            link: 0,
            reserved1: 0,
            esp0: 0,
            ss0: 0,
            reserved2: 0,
            esp1: 0,
            ss1: 0,
            reserved3: 0,
            esp2: 0,
            ss2: 0,
            reserved4: 0,
            cr3: 0,
            eip: 0,
            eflags: 0,
            eax: 0,
            ecx: 0,
            edx: 0,
            ebx: 0,
            esp: 0,
            ebp: 0,
            esi: 0,
            edi: 0,
            es: 0,
            reserved5: 0,
            cs: 0,
            reserved6: 0,
            ss: 0,
            reserved7: 0,
            ds: 0,
            reserved8: 0,
            fs: 0,
            reserved9: 0,
            gs: 0,
            reserved10: 0,
            ldtr: 0,
            reserved11: 0,
            reserved12: 0,
            iopb: 0,
        }
    }
}

/// Hardware-layout 32-bit task state segment: the register file
/// immediately followed by the I/O permission bitmap. Task descriptors
/// are based on this struct, so the layout must be exactly what the
/// descriptor's limit promises.
#[repr(C)]
pub struct Tss32 {
    pub regs: Registers32,
    pub io_bitmap: [u8; IO_BITMAP_BYTES],
}

impl Tss32 {
    pub const fn zeroed() -> Tss32 {
        Tss32 {
            regs: Registers32::zeroed(),
            io_bitmap: [0; IO_BITMAP_BYTES],
        }
    }
}

/// Hardware-layout 16-bit task state segment; no I/O bitmap
#[repr(C)]
pub struct Tss16 {
    pub regs: Registers16,
}

impl Tss16 {
    pub const fn zeroed() -> Tss16 {
        Tss16 {
            regs: Registers16::zeroed(),
        }
    }
}

/// The two mutually exclusive saved-state variants
pub enum TaskState {
    Protected(Tss32),
    VirtualReal(Tss16),
}

impl TaskState {
    pub fn mode(&self) -> Mode {
        match self {
            TaskState::Protected(_) => Mode::Protected32,
            TaskState::VirtualReal(_) => Mode::VirtualReal16,
        }
    }

    pub fn as_virtual_real(&self) -> Option<&Registers16> {
        match self {
            TaskState::VirtualReal(tss) => Some(&tss.regs),
            _ => None,
        }
    }

    pub fn as_virtual_real_mut(&mut self) -> Option<&mut Registers16> {
        match self {
            TaskState::VirtualReal(tss) => Some(&mut tss.regs),
            _ => None,
        }
    }

    pub fn as_protected(&self) -> Option<&Registers32> {
        match self {
            TaskState::Protected(tss) => Some(&tss.regs),
            _ => None,
        }
    }

    pub fn as_protected_mut(&mut self) -> Option<&mut Registers32> {
        match self {
            TaskState::Protected(tss) => Some(&mut tss.regs),
            _ => None,
        }
    }
}

/// The per-task local descriptor entries
///
/// All tasks get the same flat, privilege-differentiated views of memory;
/// the 16-bit variants differ only in limit and operand size.
#[repr(C)]
pub struct LocalEntries {
    pub null: Entry,
    pub kernel_code: Entry,
    pub kernel_data: Entry,
    pub user_code: Entry,
    pub user_data: Entry,
    pub stack: Entry,
}

impl LocalEntries {
    pub const fn empty() -> LocalEntries {
        LocalEntries {
            null: Entry::empty(),
            kernel_code: Entry::empty(),
            kernel_data: Entry::empty(),
            user_code: Entry::empty(),
            user_data: Entry::empty(),
            stack: Entry::empty(),
        }
    }
}

/// One task table slot
pub struct Task {
    pub(crate) active: bool,
    pub(crate) registers: TaskState,
    pub(crate) tss_selector: Selector,
    pub(crate) ldt_selector: Selector,
    pub(crate) local_entries: LocalEntries,
    /// Index into the stack pool when the stack was pool-drawn
    pub(crate) pool_stack: Option<usize>,
    pub(crate) runnable: Option<Box<dyn Runnable + Send>>,
    /// Stack pointer the software switch last parked this task at
    pub(crate) parked_sp: usize,
}

impl Task {
    pub(crate) const EMPTY: Task = Task {
        active: false,
        registers: TaskState::Protected(Tss32::zeroed()),
        tss_selector: Selector::new(0),
        ldt_selector: Selector::new(0),
        local_entries: LocalEntries::empty(),
        pool_stack: None,
        runnable: None,
        parked_sp: 0,
    };

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn mode(&self) -> Mode {
        self.registers.mode()
    }

    pub fn registers(&self) -> &TaskState {
        &self.registers
    }

    pub fn registers_mut(&mut self) -> &mut TaskState {
        &mut self.registers
    }

    /// Where the software switch resumes this task from
    pub fn parked_sp(&self) -> usize {
        self.parked_sp
    }

    pub fn parked_sp_mut(&mut self) -> &mut usize {
        &mut self.parked_sp
    }

    pub fn tss_selector(&self) -> Selector {
        self.tss_selector
    }

    pub fn ldt_selector(&self) -> Selector {
        self.ldt_selector
    }

    pub fn local_entries(&self) -> &LocalEntries {
        &self.local_entries
    }

    /// Hand the entry capability to the switch mechanism; present until
    /// the task has been entered once
    pub fn take_runnable(&mut self) -> Option<Box<dyn Runnable + Send>> {
        self.runnable.take()
    }
}
