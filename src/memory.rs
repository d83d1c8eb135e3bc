//! Memory image
//!
//! Owns the story's address space: the working byte buffer, the pristine
//! copy kept from load time (save diffs, restart), and the parsed header.
//! All access is bounds-checked; writes at or above the static boundary are
//! fatal faults.

use crate::fault::Fault;
use crate::files::{FileMode, FileService};
use crate::header::{Header, HDR_INTERPRETER};
use log::{debug, info};

/// Largest addressable story across the supported versions.
pub const MAX_STORY_SIZE: usize = 2 * 1024 * 1024;

/// Block size for streamed loading after the header.
const LOAD_BLOCK: usize = 4096;

/// Dynamic memory below this offset is the header itself; save diffs start
/// here.
pub const DYNAMIC_BASE: usize = 0x40;

#[derive(Debug)]
pub struct MemoryImage {
    bytes: Vec<u8>,
    original: Vec<u8>,
    header: Header,
}

impl MemoryImage {
    /// Build an image from raw story bytes.
    pub fn from_bytes(bytes: Vec<u8>) -> Result<MemoryImage, Fault> {
        if bytes.len() > MAX_STORY_SIZE {
            return Err(Fault::Load(format!(
                "story file of {} bytes exceeds the {} byte limit",
                bytes.len(),
                MAX_STORY_SIZE
            )));
        }
        let header = Header::parse(&bytes)?;
        if header.static_start > bytes.len() {
            return Err(Fault::Load(format!(
                "static memory boundary {:#06x} beyond end of file ({:#06x})",
                header.static_start,
                bytes.len()
            )));
        }

        let mut bytes = bytes;
        bytes.reserve(MAX_STORY_SIZE.saturating_sub(bytes.len()));
        // Interpreter identity stamp, re-read by some stories
        bytes[HDR_INTERPRETER] = 6;
        bytes[HDR_INTERPRETER + 1] = b'L';

        let original = bytes.clone();
        info!(
            "loaded story: version {}, {} bytes, dynamic below {:#06x}",
            header.version,
            bytes.len(),
            header.static_start
        );

        Ok(MemoryImage {
            bytes,
            original,
            header,
        })
    }

    /// Stream a story in through the file service: the 64-byte header block
    /// first, then the remainder.
    pub fn load(files: &mut dyn FileService, name: &str) -> Result<MemoryImage, Fault> {
        let handle = files
            .open(name, FileMode::Read)
            .map_err(|e| Fault::Load(format!("cannot open story {}: {}", name, e)))?;
        let mut bytes = files.read_block(handle, 64)?;
        if bytes.len() < 64 {
            files.close(handle)?;
            return Err(Fault::Load(format!(
                "story file too small for header: {} bytes",
                bytes.len()
            )));
        }
        loop {
            let block = files.read_block(handle, LOAD_BLOCK)?;
            if block.is_empty() {
                break;
            }
            bytes.extend_from_slice(&block);
            if bytes.len() > MAX_STORY_SIZE {
                files.close(handle)?;
                return Err(Fault::Load("story file exceeds the size limit".to_string()));
            }
        }
        files.close(handle)?;
        MemoryImage::from_bytes(bytes)
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn version(&self) -> u8 {
        self.header.version
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn read_byte(&self, addr: usize) -> Result<u8, Fault> {
        self.bytes
            .get(addr)
            .copied()
            .ok_or(Fault::AddressOutOfRange { addr })
    }

    pub fn read_word(&self, addr: usize) -> Result<u16, Fault> {
        if addr + 1 >= self.bytes.len() {
            return Err(Fault::AddressOutOfRange { addr });
        }
        Ok(((self.bytes[addr] as u16) << 8) | (self.bytes[addr + 1] as u16))
    }

    pub fn write_byte(&mut self, addr: usize, value: u8) -> Result<(), Fault> {
        if addr >= self.header.static_start {
            return Err(Fault::StaticWrite { addr });
        }
        if addr >= self.bytes.len() {
            return Err(Fault::AddressOutOfRange { addr });
        }
        self.bytes[addr] = value;
        Ok(())
    }

    pub fn write_word(&mut self, addr: usize, value: u16) -> Result<(), Fault> {
        self.write_byte(addr, (value >> 8) as u8)?;
        self.write_byte(addr + 1, value as u8)
    }

    /// Resolve a packed routine address to a byte address.
    pub fn routine_addr(&self, packed: u16) -> u32 {
        (((packed as usize) << self.header.packed_shift) + self.header.routine_start) as u32
    }

    /// Resolve a packed string address to a byte address.
    pub fn string_addr(&self, packed: u16) -> u32 {
        (((packed as usize) << self.header.packed_shift) + self.header.text_start) as u32
    }

    /// The writable region below the static boundary, header included.
    pub fn dynamic(&self) -> &[u8] {
        &self.bytes[..self.header.static_start]
    }

    /// The pristine image as loaded.
    pub fn original(&self) -> &[u8] {
        &self.original
    }

    /// Raw view of the whole image; text decoding and instruction fetch
    /// read through this without the write checks.
    pub fn raw(&self) -> &[u8] {
        &self.bytes
    }

    /// Overwrite the writable region, e.g. from an undo snapshot. The
    /// snapshot must span exactly the dynamic region.
    pub fn set_dynamic(&mut self, dynamic: &[u8]) {
        debug_assert_eq!(dynamic.len(), self.header.static_start);
        self.bytes[..self.header.static_start].copy_from_slice(dynamic);
    }

    /// Restore the writable region from the pristine image (restart).
    pub fn reset_dynamic(&mut self) {
        let boundary = self.header.static_start;
        let pristine = self.original[..boundary].to_vec();
        self.bytes[..boundary].copy_from_slice(&pristine);
        debug!("dynamic memory reset to pristine image");
    }

    /// Checksum over the pristine file per the header's recorded length,
    /// for the verify opcode.
    pub fn checksum(&self) -> u16 {
        let end = self.header.file_length.min(self.original.len());
        let mut sum = 0u16;
        for &b in &self.original[DYNAMIC_BASE..end.max(DYNAMIC_BASE)] {
            sum = sum.wrapping_add(b as u16);
        }
        sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::MemFileService;

    fn story(version: u8) -> Vec<u8> {
        let mut bytes = vec![0u8; 0x800];
        bytes[0] = version;
        // static boundary at 0x400
        bytes[0x0E] = 0x04;
        bytes
    }

    #[test]
    fn write_above_static_boundary_faults() {
        let mut mem = MemoryImage::from_bytes(story(3)).unwrap();
        assert!(mem.write_byte(0x3FF, 1).is_ok());
        assert!(matches!(
            mem.write_byte(0x400, 1),
            Err(Fault::StaticWrite { addr: 0x400 })
        ));
    }

    #[test]
    fn read_out_of_range_faults() {
        let mem = MemoryImage::from_bytes(story(3)).unwrap();
        assert!(matches!(
            mem.read_byte(0x800),
            Err(Fault::AddressOutOfRange { addr: 0x800 })
        ));
        assert!(matches!(
            mem.read_word(0x7FF),
            Err(Fault::AddressOutOfRange { .. })
        ));
    }

    #[test]
    fn packed_addresses_scale_by_version() {
        let mem = MemoryImage::from_bytes(story(3)).unwrap();
        assert_eq!(mem.routine_addr(0x100), 0x200);
        let mem = MemoryImage::from_bytes(story(5)).unwrap();
        assert_eq!(mem.routine_addr(0x100), 0x400);
        let mem = MemoryImage::from_bytes(story(8)).unwrap();
        assert_eq!(mem.routine_addr(0x40), 0x200);
        let mem = MemoryImage::from_bytes(story(10)).unwrap();
        assert_eq!(mem.routine_addr(0x40), 0x400);
    }

    #[test]
    fn v7_packed_addresses_add_bases() {
        let mut bytes = story(7);
        bytes[0x28] = 0x00;
        bytes[0x29] = 0x08; // routines at 8 << 3 = 0x40
        bytes[0x2A] = 0x00;
        bytes[0x2B] = 0x10; // strings at 16 << 3 = 0x80
        let mem = MemoryImage::from_bytes(bytes).unwrap();
        assert_eq!(mem.routine_addr(4), (4 << 2) + 0x40);
        assert_eq!(mem.string_addr(4), (4 << 2) + 0x80);
    }

    #[test]
    fn reset_restores_pristine_bytes() {
        let mut mem = MemoryImage::from_bytes(story(3)).unwrap();
        let before = mem.read_byte(0x100).unwrap();
        mem.write_byte(0x100, before.wrapping_add(7)).unwrap();
        mem.reset_dynamic();
        assert_eq!(mem.read_byte(0x100).unwrap(), before);
    }

    #[test]
    fn streamed_load_matches_from_bytes() {
        let bytes = story(3);
        let mut files = MemFileService::new();
        files.insert("story.z3", bytes.clone());
        let mem = MemoryImage::load(&mut files, "story.z3").unwrap();
        assert_eq!(mem.len(), bytes.len());
        assert_eq!(mem.version(), 3);
    }

    #[test]
    fn rejects_truncated_dynamic_region() {
        let mut bytes = vec![0u8; 0x100];
        bytes[0] = 3;
        bytes[0x0E] = 0x04; // static boundary 0x400 beyond the file
        assert!(matches!(
            MemoryImage::from_bytes(bytes),
            Err(Fault::Load(_))
        ));
    }
}
