//! Legacy MZ executable loading
//!
//! An MZ image is a segmented, relocatable 16-bit executable: its header
//! names a table of far-pointer sites that must be patched with the
//! load-time segment bias, because the image was assembled assuming it
//! starts at segment zero. Loading relocates the image, copies it into a
//! region carved from low memory, and seeds the target task's
//! virtual-real-mode register file. The header is parsed for the duration
//! of the call only; nothing of it is retained afterwards.
//!
//! Unlike the hardware this imitates, every header field and relocation
//! site is bounds-checked against the supplied buffer; a malformed image
//! fails the load, it never reads out of bounds.
#![no_std]

extern crate alloc;

use alloc::vec::Vec;
use lowmem::LowMemory;
use serial::serial_println;
use task::Task;

/// 'M','Z' in ASCII
pub const SIGNATURE: u16 = 0x5A4D;

/// Size of the fixed header fields in bytes
const HEADER_BYTES: usize = 28;

/// Bytes per real-mode addressing paragraph
const PARAGRAPH: usize = 16;

/// Why a legacy image failed to load
///
/// All variants are recoverable: the caller reports the failure and drops
/// the launch; the rest of the system is unaffected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadError {
    /// The buffer does not carry the MZ signature
    InvalidImage,
    /// A header field or relocation entry points outside the buffer
    CorruptImage,
    /// Low memory cannot satisfy the image's footprint
    OutOfMemory,
}

impl core::fmt::Display for LoadError {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        match self {
            LoadError::InvalidImage => write!(f, "not an MZ executable"),
            LoadError::CorruptImage => write!(f, "malformed MZ executable"),
            LoadError::OutOfMemory => write!(f, "out of low memory"),
        }
    }
}

/// Parsed MZ header
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub signature: u16,
    /// Bytes used in the last page
    pub bytes_last_page: u16,
    pub pages: u16,
    /// Number of relocation table entries
    pub relocations: u16,
    /// Header size in 16-byte paragraphs
    pub header_paragraphs: u16,
    /// Extra paragraphs required beyond the image itself
    pub min_alloc: u16,
    pub max_alloc: u16,
    pub initial_ss: u16,
    pub initial_sp: u16,
    pub checksum: u16,
    pub initial_ip: u16,
    pub initial_cs: u16,
    /// Absolute offset of the relocation table
    pub relocation_offset: u16,
    /// Zero for a plain executable
    pub overlay: u16,
}

fn read_u16(bytes: &[u8], offset: usize) -> Option<u16> {
    let lo = *bytes.get(offset)?;
    let hi = *bytes.get(offset + 1)?;
    Some(u16::from_le_bytes([lo, hi]))
}

impl Header {
    pub fn parse(image: &[u8]) -> Result<Header, LoadError> {
        let signature = read_u16(image, 0).ok_or(LoadError::CorruptImage)?;
        if signature != SIGNATURE {
            return Err(LoadError::InvalidImage);
        }
        if image.len() < HEADER_BYTES {
            return Err(LoadError::CorruptImage);
        }
        Ok(Header {
            signature,
            bytes_last_page: read_u16(image, 2).ok_or(LoadError::CorruptImage)?,
            pages: read_u16(image, 4).ok_or(LoadError::CorruptImage)?,
            relocations: read_u16(image, 6).ok_or(LoadError::CorruptImage)?,
            header_paragraphs: read_u16(image, 8).ok_or(LoadError::CorruptImage)?,
            min_alloc: read_u16(image, 10).ok_or(LoadError::CorruptImage)?,
            max_alloc: read_u16(image, 12).ok_or(LoadError::CorruptImage)?,
            initial_ss: read_u16(image, 14).ok_or(LoadError::CorruptImage)?,
            initial_sp: read_u16(image, 16).ok_or(LoadError::CorruptImage)?,
            checksum: read_u16(image, 18).ok_or(LoadError::CorruptImage)?,
            initial_ip: read_u16(image, 20).ok_or(LoadError::CorruptImage)?,
            initial_cs: read_u16(image, 22).ok_or(LoadError::CorruptImage)?,
            relocation_offset: read_u16(image, 24).ok_or(LoadError::CorruptImage)?,
            overlay: read_u16(image, 26).ok_or(LoadError::CorruptImage)?,
        })
    }
}

/// One relocation table entry: a segment:offset pair locating a 16-bit
/// far-pointer field inside the image
#[derive(Debug, Clone, Copy)]
pub struct RelocationEntry {
    pub offset: u16,
    pub segment: u16,
}

impl RelocationEntry {
    /// Byte offset of the patch site within the image
    pub fn site(self) -> usize {
        self.segment as usize * PARAGRAPH + self.offset as usize
    }
}

/// Every relocation site, validated against the buffer
fn relocation_sites(header: &Header, image: &[u8]) -> Result<Vec<usize>, LoadError> {
    let table = header.relocation_offset as usize;
    let count = header.relocations as usize;
    let end = table
        .checked_add(count * 4)
        .ok_or(LoadError::CorruptImage)?;
    if end > image.len() {
        return Err(LoadError::CorruptImage);
    }

    let mut sites = Vec::with_capacity(count);
    for index in 0..count {
        let entry = RelocationEntry {
            offset: read_u16(image, table + index * 4).ok_or(LoadError::CorruptImage)?,
            segment: read_u16(image, table + index * 4 + 2).ok_or(LoadError::CorruptImage)?,
        };
        let site = entry.site();
        if site + 2 > image.len() {
            return Err(LoadError::CorruptImage);
        }
        sites.push(site);
    }
    Ok(sites)
}

/// Place a legacy image into low memory and seed `task` to run it
///
/// Carves the image's footprint (program plus stack extent) out of `low`,
/// patches every relocation site with the load-time segment bias, copies
/// the program bytes to their destination, and seeds the task's CS:IP and
/// SS:SP from the header. Returns the segment the image was loaded at.
///
/// # Panics
/// Panics if `task` is not a virtual-real-mode task; a legacy image cannot
/// execute in a 32-bit register file.
pub fn load(task: &mut Task, low: &mut LowMemory, image: &[u8]) -> Result<u16, LoadError> {
    let header = Header::parse(image)?;
    let header_bytes = header.header_paragraphs as usize * PARAGRAPH;
    if header_bytes > image.len() {
        return Err(LoadError::CorruptImage);
    }
    let sites = relocation_sites(&header, image)?;

    serial_println!(
        "mz: header {} paragraphs ({} bytes), {} relocations",
        header.header_paragraphs,
        header_bytes,
        header.relocations
    );

    let program_len = image.len() - header_bytes;
    let code_offset = header.initial_cs as usize * PARAGRAPH + header.initial_ip as usize;
    let stack_extent = header.initial_ss as usize * PARAGRAPH + header.initial_sp as usize;
    let span = (code_offset + program_len)
        .max(stack_extent)
        .max(program_len)
        + header.min_alloc as usize * PARAGRAPH;
    let paragraphs = (span + lowmem::PARAGRAPH_SIZE - 1) / lowmem::PARAGRAPH_SIZE;

    let base = low.allocate(paragraphs.max(1)).ok_or(LoadError::OutOfMemory)?;
    let start_segment = (base as usize / PARAGRAPH) as u16;

    // Patch the far-pointer sites in a scratch copy; the source buffer
    // stays pristine for the caller.
    let mut patched = image.to_vec();
    for site in sites {
        let value = u16::from_le_bytes([patched[site], patched[site + 1]]);
        let bytes = value.wrapping_add(start_segment).to_le_bytes();
        patched[site] = bytes[0];
        patched[site + 1] = bytes[1];
    }

    let destination = match low.bytes_mut(base + code_offset as u32, program_len) {
        Some(window) => window,
        None => {
            // The footprint was sized from the same header fields, so the
            // window must exist; bail out rather than write blind.
            low.free(base);
            return Err(LoadError::CorruptImage);
        }
    };
    destination.copy_from_slice(&patched[header_bytes..]);

    let regs = match task.registers_mut().as_virtual_real_mut() {
        Some(regs) => regs,
        None => panic!("legacy image load requires a virtual-real-mode task"),
    };
    regs.ss = start_segment.wrapping_add(header.initial_ss);
    regs.sp = header.initial_sp;
    regs.cs = start_segment.wrapping_add(header.initial_cs);
    regs.ip = header.initial_ip;

    serial_println!(
        "mz: loaded at segment {:#x}, CS:IP={:#x}:{:#x} SS:SP={:#x}:{:#x}",
        start_segment,
        start_segment.wrapping_add(header.initial_cs),
        header.initial_ip,
        start_segment.wrapping_add(header.initial_ss),
        header.initial_sp
    );

    Ok(start_segment)
}
