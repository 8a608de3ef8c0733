//! Interrupt vector table ownership
//!
//! All 256 vectors start out wired to a diagnostic handler that reports the
//! vector number and halts; boot code binds the handful of device and
//! service vectors it actually uses. One vector is reserved as the task
//! gate the scheduler retargets before every switch. There is no
//! reconfiguration after boot beyond retargeting that gate.

use crate::Selector;
use serial::serial_println;

/// Number of interrupt vectors
pub const VECTOR_COUNT: usize = 256;

/// Vector reserved for the task-switch trap; not claimed by any device
pub const SWITCH_VECTOR: u8 = 0x84;

/// What a vector is wired to
#[derive(Clone, Copy)]
pub enum Vector {
    /// No handler bound; dispatching is fatal
    Unhandled,
    /// A device or service handler
    Service(fn()),
    /// The task gate: its target descriptor is the destination of the
    /// next switch-trap raise
    TaskGate(Selector),
}

pub struct VectorTable {
    vectors: [Vector; VECTOR_COUNT],
}

impl VectorTable {
    /// Build the boot-time table: every vector unhandled, the switch
    /// vector armed as a task gate with no target yet
    pub fn new() -> VectorTable {
        let mut table = VectorTable {
            vectors: [Vector::Unhandled; VECTOR_COUNT],
        };
        table.vectors[SWITCH_VECTOR as usize] = Vector::TaskGate(Selector::new(0));
        table
    }

    /// Bind a device or service handler to a vector
    ///
    /// The switch vector stays a task gate and cannot be claimed.
    pub fn bind_service(&mut self, vector: u8, handler: fn()) {
        assert_ne!(vector, SWITCH_VECTOR, "vector {:#x} is the task gate", vector);
        self.vectors[vector as usize] = Vector::Service(handler);
    }

    /// Retarget the task gate at a task descriptor
    pub fn set_task_gate(&mut self, target: Selector) {
        self.vectors[SWITCH_VECTOR as usize] = Vector::TaskGate(target);
    }

    /// Current target of the task gate
    pub fn task_gate(&self) -> Option<Selector> {
        match self.vectors[SWITCH_VECTOR as usize] {
            Vector::TaskGate(target) => Some(target),
            _ => None,
        }
    }

    /// Run the handler bound to `vector`
    ///
    /// # Panics
    /// Panics on an unhandled vector; continuing past a stray interrupt
    /// would leave the machine in an unknown state.
    pub fn dispatch(&self, vector: u8) {
        match self.vectors[vector as usize] {
            Vector::Service(handler) => handler(),
            // The context transfer itself is performed by the switch
            // mechanism, not by a software handler.
            Vector::TaskGate(_) => {}
            Vector::Unhandled => {
                serial_println!("ivt: unhandled vector {}", vector);
                panic!("unhandled vector {}", vector);
            }
        }
    }
}

impl Default for VectorTable {
    fn default() -> Self {
        VectorTable::new()
    }
}
