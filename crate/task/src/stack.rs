//! Fixed pool of pre-sized task stacks
//!
//! One stack buffer per task slot. A task either brings its own stack or
//! draws one from here, never both; the pool being the same size as the
//! task table means exhaustion cannot happen while that invariant holds.

use crate::MAX_TASKS;

/// Size of one pooled stack in bytes
pub const STACK_SIZE: usize = 8192;

/// Bytes of the frame the software switch unwinds through on a task's
/// first entry: six callee-saved register slots, the entry address, and
/// alignment padding.
pub const ENTRY_FRAME_BYTES: usize = 64;

#[repr(C, align(4096))]
struct StackBuf([u8; STACK_SIZE]);

struct StackSlot {
    buf: StackBuf,
    used: bool,
}

pub struct StackPool {
    slots: [StackSlot; MAX_TASKS],
}

impl StackPool {
    const EMPTY_SLOT: StackSlot = StackSlot {
        buf: StackBuf([0; STACK_SIZE]),
        used: false,
    };

    pub const fn new() -> StackPool {
        StackPool {
            slots: [Self::EMPTY_SLOT; MAX_TASKS],
        }
    }

    /// Claim a free stack; returns its pool index and the address one
    /// past its top (16-byte aligned)
    pub fn take(&mut self) -> Option<(usize, usize)> {
        for (index, slot) in self.slots.iter_mut().enumerate() {
            if !slot.used {
                slot.used = true;
                let top = slot.buf.0.as_ptr() as usize + STACK_SIZE;
                return Some((index, top));
            }
        }
        None
    }

    /// Lay down the first-entry frame at the top of a claimed stack
    ///
    /// The switch routine pops six zeroed callee-saved registers and then
    /// returns into `entry`. Returns the stack pointer to park the task
    /// at; the pointer lands 8 bytes below a 16-byte boundary after the
    /// return, as the calling convention requires at function entry.
    pub fn prepare_entry_frame(&mut self, index: usize, entry: usize) -> usize {
        let buf = &mut self.slots[index].buf.0;
        let frame = STACK_SIZE - ENTRY_FRAME_BYTES;
        for byte in buf[frame..].iter_mut() {
            *byte = 0;
        }
        buf[STACK_SIZE - 16..STACK_SIZE - 8].copy_from_slice(&(entry as u64).to_le_bytes());
        buf.as_ptr() as usize + frame
    }

    /// Return a pool stack once its task has been retired
    pub fn release(&mut self, index: usize) {
        self.slots[index].used = false;
    }

    /// Number of stacks currently claimed
    pub fn in_use(&self) -> usize {
        self.slots.iter().filter(|s| s.used).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn take_claims_distinct_aligned_stacks() {
        let mut pool = StackPool::new();
        let (a, top_a) = pool.take().unwrap();
        let (b, top_b) = pool.take().unwrap();
        assert_ne!(a, b);
        assert_ne!(top_a, top_b);
        assert_eq!(top_a % 16, 0);
        assert_eq!(top_b % 16, 0);
        assert_eq!(pool.in_use(), 2);
    }

    #[test]
    fn entry_frame_returns_into_the_entry_point() {
        let mut pool = StackPool::new();
        let (index, top) = pool.take().unwrap();
        let sp = pool.prepare_entry_frame(index, 0x1122_3344);
        assert_eq!(sp, top - ENTRY_FRAME_BYTES);
        // six zeroed register slots, then the return address
        let buf = &pool.slots[index].buf.0;
        assert!(buf[STACK_SIZE - 64..STACK_SIZE - 16].iter().all(|&b| b == 0));
        assert_eq!(
            &buf[STACK_SIZE - 16..STACK_SIZE - 8],
            &0x1122_3344u64.to_le_bytes()
        );
    }

    #[test]
    fn released_stacks_are_reused() {
        let mut pool = StackPool::new();
        let (index, _) = pool.take().unwrap();
        pool.release(index);
        let (again, _) = pool.take().unwrap();
        assert_eq!(index, again);
    }

    #[test]
    fn pool_is_bounded() {
        let mut pool = StackPool::new();
        for _ in 0..MAX_TASKS {
            assert!(pool.take().is_some());
        }
        assert!(pool.take().is_none());
    }
}
