//! The software context transfer
//!
//! The target has no usable hardware task gate, so transferring control
//! is a plain stack switch: push the callee-saved registers, park the
//! outgoing stack pointer in its task slot, load the incoming one, pop,
//! return. A task's first entry returns through the frame its stack
//! pool prepared, which lands in the entry trampoline.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
core::arch::global_asm!(
    ".global task_context_transfer",
    "task_context_transfer:",
    "push rbx",
    "push rbp",
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
    "pop rbp",
    "pop rbx",
    "ret",
);

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
extern "C" {
    fn task_context_transfer(park: *mut usize, load: usize);
}

/// Swap stacks with the task parked at `load`, recording the outgoing
/// stack pointer through `park`
///
/// Returns only once some other task transfers back here.
///
/// # Safety
/// Interrupts must be disabled. `park` must stay valid until this task
/// is switched back to, and `load` must hold a frame this routine or
/// [`StackPool::prepare_entry_frame`](crate::StackPool::prepare_entry_frame)
/// produced.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub unsafe fn transfer(park: *mut usize, load: usize) {
    task_context_transfer(park, load);
}

/// Hosted builds never transfer control; the bookkeeping still runs.
#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
pub unsafe fn transfer(park: *mut usize, load: usize) {
    let _ = (park, load);
}
