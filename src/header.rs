//! Story file header
//!
//! The first 64 bytes of a story file are a fixed table of addresses and
//! flags. They are parsed once at load; the version byte selects the
//! address/packed shift pair used everywhere else.

use crate::fault::Fault;
use std::fmt;

/// Fixed header offsets, big-endian words unless noted.
pub const HDR_VERSION: usize = 0x00;
pub const HDR_FLAGS1: usize = 0x01;
pub const HDR_RELEASE: usize = 0x02;
pub const HDR_HIGH_MEM: usize = 0x04;
pub const HDR_INITIAL_PC: usize = 0x06;
pub const HDR_DICTIONARY: usize = 0x08;
pub const HDR_OBJECT_TABLE: usize = 0x0A;
pub const HDR_GLOBALS: usize = 0x0C;
pub const HDR_STATIC_START: usize = 0x0E;
pub const HDR_FLAGS2: usize = 0x10;
pub const HDR_SERIAL: usize = 0x12;
pub const HDR_ABBREVIATIONS: usize = 0x18;
pub const HDR_FILE_LENGTH: usize = 0x1A;
pub const HDR_CHECKSUM: usize = 0x1C;
pub const HDR_INTERPRETER: usize = 0x1E;
pub const HDR_ROUTINE_OFFSET: usize = 0x28;
pub const HDR_STRING_OFFSET: usize = 0x2A;
pub const HDR_ALPHABET_TABLE: usize = 0x34;

/// Parsed story header. Addresses are byte addresses, already scaled by
/// the version's address shift.
#[derive(Debug, Clone)]
pub struct Header {
    pub version: u8,
    pub flags1: u8,
    pub release: u16,
    pub serial: String,
    pub high_mem: usize,
    pub initial_pc: u32,
    pub dictionary: usize,
    pub object_table: usize,
    pub global_table: usize,
    pub static_start: usize,
    pub abbrev_table: usize,
    pub alphabet_table: usize,
    pub routine_start: usize,
    pub text_start: usize,
    pub file_length: usize,
    pub checksum: u16,
    /// Header-word address scale (left shift)
    pub address_shift: u32,
    /// Packed routine/string address scale (left shift)
    pub packed_shift: u32,
}

/// Address/packed shift pair per story version. `None` for versions this
/// interpreter does not run (notably 6).
pub fn version_shifts(version: u8) -> Option<(u32, u32)> {
    match version {
        1..=4 => Some((0, 1)),
        5 | 7 => Some((1, 2)),
        8 => Some((1, 3)),
        9 => Some((2, 3)),
        10 => Some((2, 4)),
        _ => None,
    }
}

fn word(bytes: &[u8], offset: usize) -> u16 {
    ((bytes[offset] as u16) << 8) | (bytes[offset + 1] as u16)
}

impl Header {
    /// Parse the fixed header from the first 64 bytes of a story image.
    pub fn parse(bytes: &[u8]) -> Result<Header, Fault> {
        if bytes.len() < 64 {
            return Err(Fault::Load(format!(
                "story file too small for header: {} bytes",
                bytes.len()
            )));
        }

        let version = bytes[HDR_VERSION];
        let (address_shift, packed_shift) = match version_shifts(version) {
            Some(shifts) => shifts,
            None => return Err(Fault::UnsupportedVersion(version)),
        };

        let scale = |w: u16| (w as usize) << address_shift;

        // v7/9/10 pack routine and string addresses against separately
        // scaled bases; everything else uses base 0.
        let (routine_start, text_start) = if matches!(version, 7 | 9 | 10) {
            (
                (word(bytes, HDR_ROUTINE_OFFSET) as usize) << 3,
                (word(bytes, HDR_STRING_OFFSET) as usize) << 3,
            )
        } else {
            (0, 0)
        };

        let serial = bytes[HDR_SERIAL..HDR_SERIAL + 6]
            .iter()
            .map(|&b| b as char)
            .collect();

        // File length is stored divided by a version-dependent factor
        let length_scale = match version {
            1..=3 => 2,
            4 | 5 => 4,
            _ => 8,
        };

        Ok(Header {
            version,
            flags1: bytes[HDR_FLAGS1],
            release: word(bytes, HDR_RELEASE),
            serial,
            high_mem: scale(word(bytes, HDR_HIGH_MEM)),
            initial_pc: scale(word(bytes, HDR_INITIAL_PC)) as u32,
            dictionary: scale(word(bytes, HDR_DICTIONARY)),
            object_table: scale(word(bytes, HDR_OBJECT_TABLE)),
            global_table: scale(word(bytes, HDR_GLOBALS)),
            static_start: scale(word(bytes, HDR_STATIC_START)),
            abbrev_table: if version >= 2 {
                scale(word(bytes, HDR_ABBREVIATIONS))
            } else {
                0
            },
            alphabet_table: if version >= 5 {
                scale(word(bytes, HDR_ALPHABET_TABLE))
            } else {
                0
            },
            routine_start,
            text_start,
            file_length: word(bytes, HDR_FILE_LENGTH) as usize * length_scale,
            checksum: word(bytes, HDR_CHECKSUM),
            address_shift,
            packed_shift,
        })
    }
}

impl fmt::Display for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "
Story version:            {}
Release number:           {}
Serial number:            {}
Start PC:                 {:#06x}
Dictionary address:       {:#06x}
Object table address:     {:#06x}
Global variables address: {:#06x}
Size of dynamic memory:   {:#06x}
Abbreviations address:    {:#06x}
File size:                {:#06x}
Checksum:                 {:#06x}
",
            self.version,
            self.release,
            self.serial,
            self.initial_pc,
            self.dictionary,
            self.object_table,
            self.global_table,
            self.static_start,
            self.abbrev_table,
            self.file_length,
            self.checksum,
        )
    }
}
