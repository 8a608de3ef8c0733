//! Global Descriptor Table functionality
//!
//! The kernel keeps one fixed pool of segment descriptors. Two entries are
//! seeded at construction (flat 32-bit kernel code and data); every other
//! entry is handed out on demand for task state segments and per-task local
//! tables. The pool is sized for the task table, so running out of entries
//! is a configuration error, not a runtime condition.
#![no_std]

pub mod ivt;

/// Number of entries in the descriptor pool, including the null entry.
/// Two descriptors per task slot plus the fixed kernel segments leave
/// generous headroom.
pub const MAX_ENTRIES: usize = 64;

/// Selector of the flat kernel code segment
pub const KERNEL_CODE: u16 = 0x08;
/// Selector of the flat kernel data segment
pub const KERNEL_DATA: u16 = 0x10;
/// Table-indicator bit: the selector refers to the current local table
/// rather than the global one.
pub const LOCAL_TABLE: u16 = 1 << 2;

/// Index (scaled to a byte offset) identifying one descriptor-table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selector(u16);

impl Selector {
    /// Build a selector from an entry index
    pub const fn new(index: usize) -> Selector {
        Selector((index as u16) << 3)
    }

    /// Raw selector value as loaded into a segment register
    pub const fn bits(self) -> u16 {
        self.0
    }

    /// Entry index within the descriptor table
    pub const fn index(self) -> usize {
        (self.0 >> 3) as usize
    }
}

/// One 8-byte segment descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C, packed)]
pub struct Entry {
    limit_lo: u16,
    base_lo: u16,
    base_mid: u8,
    access: u8,
    flags: u8,
    base_hi: u8,
}

impl Entry {
    pub const TYPE_TSS16_AVAILABLE: u8 = 0x01;
    pub const TYPE_LDT: u8 = 0x02;
    pub const TYPE_TSS16_BUSY: u8 = 0x03;
    pub const TYPE_TSS32_AVAILABLE: u8 = 0x09;
    pub const TYPE_TSS32_BUSY: u8 = 0x0B;

    pub const ACCESS_PRESENT: u8 = 0x80;
    pub const ACCESS_RING3: u8 = 0x60;
    pub const ACCESS_SEGMENT: u8 = 0x10;
    pub const ACCESS_EXECUTABLE: u8 = 0x08;
    pub const ACCESS_READ_WRITE: u8 = 0x02;

    /// Default operand size bit: 1 = 32-bit segment
    pub const FLAG_SIZE_32: u8 = 0x40;
    /// Limit granularity bit: 1 = limit counts 4 KiB pages
    pub const FLAG_GRANULARITY: u8 = 0x80;

    pub const fn empty() -> Entry {
        Entry {
            limit_lo: 0,
            base_lo: 0,
            base_mid: 0,
            access: 0,
            flags: 0,
            base_hi: 0,
        }
    }

    /// Build an executable segment descriptor with a flat base
    pub fn code_segment(ring3: bool, bits32: bool) -> Entry {
        let mut entry = Entry::empty();
        let mut access =
            Entry::ACCESS_PRESENT | Entry::ACCESS_SEGMENT | Entry::ACCESS_EXECUTABLE;
        if ring3 {
            access |= Entry::ACCESS_RING3;
        }
        entry.set_access(access);
        entry.set_base(0);
        entry.set_limit(if bits32 { 0xFFFF_FFFF } else { 0xFFFF });
        if bits32 {
            entry.flags |= Entry::FLAG_SIZE_32;
        }
        entry
    }

    /// Build a writable data segment descriptor with a flat base
    pub fn data_segment(ring3: bool, bits32: bool) -> Entry {
        let mut entry = Entry::empty();
        let mut access =
            Entry::ACCESS_PRESENT | Entry::ACCESS_SEGMENT | Entry::ACCESS_READ_WRITE;
        if ring3 {
            access |= Entry::ACCESS_RING3;
        }
        entry.set_access(access);
        entry.set_base(0);
        entry.set_limit(if bits32 { 0xFFFF_FFFF } else { 0xFFFF });
        if bits32 {
            entry.flags |= Entry::FLAG_SIZE_32;
        }
        entry
    }

    /// Build a system descriptor (TSS or LDT) covering `limit + 1` bytes at `base`
    pub fn system(base: u32, limit: u32, system_type: u8) -> Entry {
        let mut entry = Entry::empty();
        entry.set_access(Entry::ACCESS_PRESENT | system_type);
        entry.set_base(base);
        entry.set_limit(limit);
        entry
    }

    pub fn set_access(&mut self, access: u8) {
        self.access = access;
    }

    pub fn access(&self) -> u8 {
        self.access
    }

    pub fn is_present(&self) -> bool {
        self.access & Entry::ACCESS_PRESENT != 0
    }

    pub fn set_base(&mut self, base: u32) {
        self.base_lo = base as u16;
        self.base_mid = (base >> 16) as u8;
        self.base_hi = (base >> 24) as u8;
    }

    pub fn base(&self) -> u32 {
        self.base_lo as u32 | (self.base_mid as u32) << 16 | (self.base_hi as u32) << 24
    }

    pub fn set_limit(&mut self, mut limit: u32) {
        if limit > 0xF_FFFF {
            self.flags |= Entry::FLAG_GRANULARITY;
            limit >>= 12;
        }
        self.limit_lo = limit as u16;
        self.flags = (self.flags & 0xF0) | ((limit >> 16) as u8 & 0x0F);
    }

    pub fn limit(&self) -> u32 {
        let raw = self.limit_lo as u32 | ((self.flags as u32 & 0x0F) << 16);
        if self.flags & Entry::FLAG_GRANULARITY != 0 {
            (raw << 12) | 0xFFF
        } else {
            raw
        }
    }
}

/// The fixed pool of segment descriptors
///
/// Entry 0 is the architectural null descriptor, entries 1 and 2 the flat
/// kernel code and data segments. Everything past [`FIXED_ENTRIES`] is
/// allocatable.
pub struct DescriptorTable {
    entries: [Entry; MAX_ENTRIES],
}

/// Entries that are never allocated or released: null, kernel code, kernel data
const FIXED_ENTRIES: usize = 3;

impl DescriptorTable {
    pub fn new() -> DescriptorTable {
        let mut table = DescriptorTable {
            entries: [Entry::empty(); MAX_ENTRIES],
        };
        table.entries[1] = Entry::code_segment(false, true);
        table.entries[2] = Entry::data_segment(false, true);
        table
    }

    /// Hand out the first free entry, marking it present
    ///
    /// # Panics
    /// Panics when the pool is exhausted. The pool is sized to the task
    /// table, so exhaustion means the configuration is corrupt and the
    /// kernel must not continue.
    pub fn allocate_entry(&mut self) -> Selector {
        for index in FIXED_ENTRIES..MAX_ENTRIES {
            let entry = &mut self.entries[index];
            if !entry.is_present() {
                entry.set_access(Entry::ACCESS_PRESENT);
                return Selector::new(index);
            }
        }
        panic!("descriptor pool exhausted");
    }

    /// Return a previously allocated entry to the pool
    pub fn release_entry(&mut self, selector: Selector) {
        let index = selector.index();
        assert!(
            index >= FIXED_ENTRIES && index < MAX_ENTRIES,
            "released selector {:#x} is not an allocatable entry",
            selector.bits()
        );
        self.entries[index] = Entry::empty();
    }

    pub fn entry(&self, selector: Selector) -> &Entry {
        &self.entries[selector.index()]
    }

    pub fn entry_mut(&mut self, selector: Selector) -> &mut Entry {
        &mut self.entries[selector.index()]
    }

    /// Number of present entries, the null descriptor excluded
    pub fn present_entries(&self) -> usize {
        self.entries.iter().filter(|e| e.is_present()).count()
    }
}

impl Default for DescriptorTable {
    fn default() -> Self {
        DescriptorTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_arithmetic() {
        assert_eq!(Selector::new(1).bits(), KERNEL_CODE);
        assert_eq!(Selector::new(2).bits(), KERNEL_DATA);
        assert_eq!(Selector::new(5).index(), 5);
    }

    #[test]
    fn allocate_returns_distinct_present_entries() {
        let mut table = DescriptorTable::new();
        let a = table.allocate_entry();
        let b = table.allocate_entry();
        assert_ne!(a, b);
        assert!(table.entry(a).is_present());
        assert!(table.entry(b).is_present());
    }

    #[test]
    fn release_makes_entry_reusable() {
        let mut table = DescriptorTable::new();
        let a = table.allocate_entry();
        table.release_entry(a);
        assert!(!table.entry(a).is_present());
        let b = table.allocate_entry();
        assert_eq!(a, b);
    }

    #[test]
    #[should_panic(expected = "descriptor pool exhausted")]
    fn exhaustion_is_fatal() {
        let mut table = DescriptorTable::new();
        for _ in 0..MAX_ENTRIES {
            table.allocate_entry();
        }
    }

    #[test]
    #[should_panic(expected = "not an allocatable entry")]
    fn fixed_entries_cannot_be_released() {
        let mut table = DescriptorTable::new();
        table.release_entry(Selector::new(1));
    }

    #[test]
    fn code_and_data_access_bytes() {
        assert_eq!(
            Entry::code_segment(false, true).access(),
            Entry::ACCESS_PRESENT | Entry::ACCESS_SEGMENT | Entry::ACCESS_EXECUTABLE
        );
        assert_eq!(
            Entry::data_segment(true, true).access(),
            Entry::ACCESS_PRESENT
                | Entry::ACCESS_RING3
                | Entry::ACCESS_SEGMENT
                | Entry::ACCESS_READ_WRITE
        );
    }

    #[test]
    fn limit_granularity() {
        let mut entry = Entry::empty();
        entry.set_limit(0xFFFF);
        assert_eq!(entry.limit(), 0xFFFF);

        let mut entry = Entry::empty();
        entry.set_limit(0xFFFF_FFFF);
        assert_eq!(entry.limit(), 0xFFFF_FFFF);
    }

    #[test]
    fn base_roundtrip() {
        let mut entry = Entry::empty();
        entry.set_base(0x00AB_CDEF);
        assert_eq!(entry.base(), 0x00AB_CDEF);
    }
}
