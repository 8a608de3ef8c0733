//! Kernel heap
//!
//! A fixed in-image arena handed to a linked-list allocator. Only the
//! freestanding kernel installs it; hosted builds use the platform
//! allocator.

pub const HEAP_SIZE: usize = 100 * 1024;

#[cfg(target_os = "none")]
#[global_allocator]
static ALLOCATOR: linked_list_allocator::LockedHeap = linked_list_allocator::LockedHeap::empty();

#[cfg(target_os = "none")]
static mut HEAP: [u8; HEAP_SIZE] = [0; HEAP_SIZE];

#[cfg(target_os = "none")]
pub fn init() {
    unsafe {
        ALLOCATOR.lock().init(HEAP.as_mut_ptr(), HEAP_SIZE);
    }
}

#[cfg(not(target_os = "none"))]
pub fn init() {}
