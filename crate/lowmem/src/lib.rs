//! Low memory allocator
//!
//! Allocates memory in the low address space so real-mode compatible
//! programs can run at the addresses they expect. The allocator is simple
//! on purpose: a bitmap with one bit per paragraph tracks occupancy across
//! the whole range, and a separate fixed list records the live blocks.
//! Only a handful of legacy images are ever resident at once and the
//! addressable range is capped at 1 MiB, so nothing fancier is warranted.
//!
//! This allocator is NOT meant for ordinary kernel allocations; it exists
//! solely to carve out regions for virtual-real-mode image loading.
#![no_std]

/// Size of the managed range: the first megabyte of the address space
pub const LOW_MEMORY_SIZE: usize = 0x10_0000;
/// Allocation granularity in bytes
pub const PARAGRAPH_SIZE: usize = 512;
/// Capacity of the block record table
pub const MAX_BLOCKS: usize = 512;

/// Paragraphs at the bottom of the range that are never handed out
/// (interrupt vectors and firmware data live there)
const RESERVED_START: usize = 4;
const RESERVED_END: usize = 8;

const PARAGRAPH_COUNT: usize = LOW_MEMORY_SIZE / PARAGRAPH_SIZE;
const BITMAP_BYTES: usize = PARAGRAPH_COUNT / 8;

/// One allocated region: base linear address plus paragraph count.
/// A zero count marks a free record.
#[derive(Debug, Clone, Copy)]
struct Block {
    addr: u32,
    paragraphs: u16,
}

impl Block {
    const FREE: Block = Block {
        addr: 0,
        paragraphs: 0,
    };
}

/// The low-memory range and its allocation state
pub struct LowMemory<'m> {
    memory: &'m mut [u8],
    bitmap: [u8; BITMAP_BYTES],
    blocks: [Block; MAX_BLOCKS],
}

impl<'m> LowMemory<'m> {
    /// Take ownership of the backing range
    ///
    /// `memory` must span the whole low megabyte.
    pub fn new(memory: &'m mut [u8]) -> LowMemory<'m> {
        assert_eq!(memory.len(), LOW_MEMORY_SIZE, "backing range must be 1 MiB");
        let mut low = LowMemory {
            memory,
            bitmap: [0; BITMAP_BYTES],
            blocks: [Block::FREE; MAX_BLOCKS],
        };
        for index in RESERVED_START..RESERVED_END {
            low.set_bit(index, true);
        }
        low
    }

    fn bit(&self, index: usize) -> bool {
        self.bitmap[index / 8] & (1 << (index % 8)) != 0
    }

    fn set_bit(&mut self, index: usize, value: bool) {
        if value {
            self.bitmap[index / 8] |= 1 << (index % 8);
        } else {
            self.bitmap[index / 8] &= !(1 << (index % 8));
        }
    }

    fn block_index(&self, addr: u32) -> Option<usize> {
        self.blocks
            .iter()
            .position(|b| b.paragraphs != 0 && b.addr == addr)
    }

    /// Carve out `paragraphs` consecutive paragraphs
    ///
    /// First-fit scan over the bitmap. Returns the base linear address, or
    /// `None` when no sufficiently long run (or no free block record) is
    /// left. Failure is recoverable; the caller aborts its own load, not
    /// the kernel.
    pub fn allocate(&mut self, paragraphs: usize) -> Option<u32> {
        if paragraphs == 0 || paragraphs > PARAGRAPH_COUNT {
            return None;
        }
        let record = self.blocks.iter().position(|b| b.paragraphs == 0)?;

        let mut address = 0usize;
        let mut remaining = paragraphs;
        for index in 0..PARAGRAPH_COUNT {
            if self.bit(index) {
                // Run broken, start over past this paragraph
                remaining = paragraphs;
                continue;
            }
            if remaining == paragraphs {
                address = index * PARAGRAPH_SIZE;
            }
            remaining -= 1;
            if remaining == 0 {
                break;
            }
        }
        if remaining != 0 {
            return None;
        }

        for index in address / PARAGRAPH_SIZE..address / PARAGRAPH_SIZE + paragraphs {
            self.set_bit(index, true);
        }
        self.blocks[record] = Block {
            addr: address as u32,
            paragraphs: paragraphs as u16,
        };
        Some(address as u32)
    }

    /// Release the block based at `addr`
    ///
    /// Freeing an address with no matching block is a silent no-op.
    pub fn free(&mut self, addr: u32) {
        if let Some(record) = self.block_index(addr) {
            let block = self.blocks[record];
            let first = block.addr as usize / PARAGRAPH_SIZE;
            for index in first..first + block.paragraphs as usize {
                self.set_bit(index, false);
            }
            self.blocks[record] = Block::FREE;
        }
    }

    /// Move the block at `addr` into a fresh run of `paragraphs` paragraphs,
    /// preserving its contents
    ///
    /// The copy happens only once the new run is fully reserved; if the new
    /// allocation cannot be satisfied (or `addr` names no live block) the
    /// original block is left valid and unchanged and `None` is returned.
    pub fn resize(&mut self, addr: u32, paragraphs: usize) -> Option<u32> {
        let record = self.block_index(addr)?;
        let old = self.blocks[record];

        let new_addr = self.allocate(paragraphs)?;
        let bytes = (old.paragraphs as usize).min(paragraphs) * PARAGRAPH_SIZE;
        self.memory.copy_within(
            old.addr as usize..old.addr as usize + bytes,
            new_addr as usize,
        );
        self.free(addr);
        Some(new_addr)
    }

    /// Bounds-checked window into an allocated block
    ///
    /// `addr..addr + len` must fall entirely within one live block.
    pub fn bytes_mut(&mut self, addr: u32, len: usize) -> Option<&mut [u8]> {
        let block = self.blocks[self.block_index_covering(addr, len)?];
        debug_assert!(block.paragraphs != 0);
        let start = addr as usize;
        Some(&mut self.memory[start..start + len])
    }

    fn block_index_covering(&self, addr: u32, len: usize) -> Option<usize> {
        self.blocks.iter().position(|b| {
            b.paragraphs != 0
                && addr >= b.addr
                && (addr as usize + len)
                    <= b.addr as usize + b.paragraphs as usize * PARAGRAPH_SIZE
        })
    }

    /// Paragraphs currently marked used, the reserved bottom included
    pub fn used_paragraphs(&self) -> usize {
        self.bitmap.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Paragraph counts of all live blocks summed
    pub fn live_paragraphs(&self) -> usize {
        self.blocks.iter().map(|b| b.paragraphs as usize).sum()
    }
}
