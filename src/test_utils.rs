//! Shared test scaffolding: a builder for small, valid story images.
//!
//! Layout of built stories:
//!   0x0000 header
//!   0x0040 abbreviation table (96 entries)
//!   0x0100 global variables
//!   0x0300 object table (defaults + entries)
//!   0x0500 property tables
//!   0x0700 dictionary
//!   0x0800 static boundary and code

use crate::memory::MemoryImage;
use crate::text::{self, AlphabetSet};

pub const ABBREV_ADDR: usize = 0x40;
pub const GLOBALS_ADDR: usize = 0x100;
pub const OBJECTS_ADDR: usize = 0x300;
pub const PROPS_ADDR: usize = 0x500;
pub const DICT_ADDR: usize = 0x700;
pub const CODE_ADDR: usize = 0x800;
pub const STORY_SIZE: usize = 0x2000;

pub struct StoryBuilder {
    pub version: u8,
    bytes: Vec<u8>,
    code_cursor: usize,
    prop_cursor: usize,
    object_count: u16,
}

impl StoryBuilder {
    pub fn new(version: u8) -> StoryBuilder {
        let mut bytes = vec![0u8; STORY_SIZE];
        bytes[0x00] = version;
        // Header words are stored pre-scaling; divide out the version's
        // address shift so the parsed addresses land on the layout above.
        let shift = match version {
            1..=4 => 0,
            5 | 7 | 8 => 1,
            _ => 2,
        };
        let hdr = |addr: usize| (addr >> shift) as u16;
        set_word(&mut bytes, 0x04, hdr(CODE_ADDR)); // high memory
        set_word(&mut bytes, 0x06, hdr(CODE_ADDR)); // initial PC
        set_word(&mut bytes, 0x08, hdr(DICT_ADDR));
        set_word(&mut bytes, 0x0A, hdr(OBJECTS_ADDR));
        set_word(&mut bytes, 0x0C, hdr(GLOBALS_ADDR));
        set_word(&mut bytes, 0x0E, hdr(CODE_ADDR)); // static boundary
        set_word(&mut bytes, 0x18, hdr(ABBREV_ADDR));

        // Empty dictionary: one separator, version-sized entries, no words
        let mut cursor = DICT_ADDR;
        bytes[cursor] = 1;
        bytes[cursor + 1] = b',';
        cursor += 2;
        bytes[cursor] = if version <= 3 { 7 } else { 9 };
        set_word(&mut bytes, cursor + 1, 0);

        StoryBuilder {
            version,
            bytes,
            code_cursor: CODE_ADDR,
            prop_cursor: PROPS_ADDR,
            object_count: 0,
        }
    }

    pub fn set_byte(&mut self, addr: usize, value: u8) -> &mut Self {
        self.bytes[addr] = value;
        self
    }

    pub fn set_word(&mut self, addr: usize, value: u16) -> &mut Self {
        set_word(&mut self.bytes, addr, value);
        self
    }

    pub fn global(&mut self, n: u8, value: u16) -> &mut Self {
        self.set_word(GLOBALS_ADDR + 2 * n as usize, value)
    }

    /// Current code cursor (the next emitted byte's address).
    pub fn here(&self) -> usize {
        self.code_cursor
    }

    /// Append code bytes at the cursor.
    pub fn code(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes[self.code_cursor..self.code_cursor + bytes.len()].copy_from_slice(bytes);
        self.code_cursor += bytes.len();
        self
    }

    /// Append an inline Z-string encoding of plain lowercase text.
    pub fn code_zstring(&mut self, s: &str) -> &mut Self {
        let words = encode_zstring(s);
        for w in words {
            let bytes = w.to_be_bytes();
            self.code(&bytes);
        }
        self
    }

    fn entry_size(&self) -> usize {
        if self.version <= 3 {
            9
        } else {
            14
        }
    }

    fn entries_base(&self) -> usize {
        let defaults = if self.version <= 3 { 31 } else { 63 };
        OBJECTS_ADDR + defaults * 2
    }

    pub fn object_addr(&self, obj: u16) -> usize {
        self.entries_base() + (obj as usize - 1) * self.entry_size()
    }

    /// Set a property default (1-based property number).
    pub fn property_default(&mut self, prop: u8, value: u16) -> &mut Self {
        self.set_word(OBJECTS_ADDR + (prop as usize - 1) * 2, value)
    }

    /// Add an object with the given links and properties; returns its
    /// number. Properties should be supplied in descending number order as
    /// a compiler would emit them.
    pub fn add_object(
        &mut self,
        parent: u16,
        sibling: u16,
        child: u16,
        name: &str,
        props: &[(u8, &[u8])],
    ) -> u16 {
        self.object_count += 1;
        let obj = self.object_count;
        let addr = self.object_addr(obj);
        let v3 = self.version <= 3;

        if v3 {
            self.bytes[addr + 4] = parent as u8;
            self.bytes[addr + 5] = sibling as u8;
            self.bytes[addr + 6] = child as u8;
            set_word(&mut self.bytes, addr + 7, self.prop_cursor as u16);
        } else {
            set_word(&mut self.bytes, addr + 6, parent);
            set_word(&mut self.bytes, addr + 8, sibling);
            set_word(&mut self.bytes, addr + 10, child);
            set_word(&mut self.bytes, addr + 12, self.prop_cursor as u16);
        }

        // Property table: short name then descending property list
        let name_words = encode_zstring(name);
        self.bytes[self.prop_cursor] = name_words.len() as u8;
        self.prop_cursor += 1;
        for w in &name_words {
            set_word(&mut self.bytes, self.prop_cursor, *w);
            self.prop_cursor += 2;
        }
        for &(num, data) in props {
            if v3 {
                self.bytes[self.prop_cursor] = ((data.len() as u8 - 1) << 5) | num;
                self.prop_cursor += 1;
            } else if data.len() <= 2 {
                let size_bit = if data.len() == 2 { 0x40 } else { 0 };
                self.bytes[self.prop_cursor] = size_bit | num;
                self.prop_cursor += 1;
            } else {
                self.bytes[self.prop_cursor] = 0x80 | num;
                self.bytes[self.prop_cursor + 1] = 0x80 | (data.len() as u8 & 0x3F);
                self.prop_cursor += 2;
            }
            self.bytes[self.prop_cursor..self.prop_cursor + data.len()].copy_from_slice(data);
            self.prop_cursor += data.len();
        }
        self.bytes[self.prop_cursor] = 0;
        self.prop_cursor += 1;
        obj
    }

    /// Set an attribute bit directly in the built image.
    pub fn set_attribute(&mut self, obj: u16, attr: u16) -> &mut Self {
        let addr = self.object_addr(obj) + attr as usize / 8;
        self.bytes[addr] |= 0x80 >> (attr % 8);
        self
    }

    /// Install a sorted dictionary with the given words and separators.
    pub fn dictionary(&mut self, separators: &[u8], words: &[&str]) -> &mut Self {
        let alphabets = AlphabetSet::builtin(self.version);
        let encoded_len = if self.version <= 3 { 4 } else { 6 };
        let entry_length = encoded_len + 3;

        let mut entries: Vec<Vec<u8>> = words
            .iter()
            .map(|w| text::encode_word(w.as_bytes(), self.version, &alphabets))
            .collect();
        entries.sort();

        let mut cursor = DICT_ADDR;
        self.bytes[cursor] = separators.len() as u8;
        cursor += 1;
        for &sep in separators {
            self.bytes[cursor] = sep;
            cursor += 1;
        }
        self.bytes[cursor] = entry_length as u8;
        cursor += 1;
        set_word(&mut self.bytes, cursor, entries.len() as u16);
        cursor += 2;
        for entry in &entries {
            self.bytes[cursor..cursor + encoded_len].copy_from_slice(entry);
            cursor += entry_length;
        }
        self
    }

    /// Install an abbreviation: index slot pointing at a string placed in
    /// the property area. Abbreviation entries are word addresses.
    pub fn abbreviation(&mut self, index: usize, s: &str) -> &mut Self {
        let words = encode_zstring(s);
        self.prop_cursor += self.prop_cursor % 2;
        let addr = self.prop_cursor;
        for w in &words {
            set_word(&mut self.bytes, self.prop_cursor, *w);
            self.prop_cursor += 2;
        }
        set_word(&mut self.bytes, ABBREV_ADDR + index * 2, (addr / 2) as u16);
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut bytes = self.bytes.clone();
        // Record file length and checksum so verify passes
        let length_scale = match self.version {
            1..=3 => 2,
            4 | 5 => 4,
            _ => 8,
        };
        set_word(&mut bytes, 0x1A, (STORY_SIZE / length_scale) as u16);
        let mut sum = 0u16;
        for &b in &bytes[0x40..] {
            sum = sum.wrapping_add(b as u16);
        }
        set_word(&mut bytes, 0x1C, sum);
        bytes
    }

    pub fn build_image(&self) -> MemoryImage {
        match MemoryImage::from_bytes(self.build()) {
            Ok(image) => image,
            Err(fault) => panic!("story builder produced a bad image: {}", fault),
        }
    }
}

fn set_word(bytes: &mut [u8], addr: usize, value: u16) {
    bytes[addr] = (value >> 8) as u8;
    bytes[addr + 1] = value as u8;
}

/// Pack plain text (lowercase letters and spaces) into Z-string words.
pub fn encode_zstring(s: &str) -> Vec<u16> {
    let mut zchars: Vec<u8> = s
        .chars()
        .map(|c| match c {
            ' ' => 0,
            'a'..='z' => c as u8 - b'a' + 6,
            _ => 5,
        })
        .collect();
    while zchars.len() % 3 != 0 || zchars.is_empty() {
        zchars.push(5);
    }
    let words = zchars.len() / 3;
    zchars
        .chunks(3)
        .enumerate()
        .map(|(n, chunk)| {
            let mut w =
                ((chunk[0] as u16) << 10) | ((chunk[1] as u16) << 5) | (chunk[2] as u16);
            if n == words - 1 {
                w |= 0x8000;
            }
            w
        })
        .collect()
}

use crate::console::{Console, RecordingConsole};
use crate::fault::Fault;
use crate::files::{FileHandle, FileMode, FileService, MemFileService, SeekOrigin};
use crate::interpreter::{Interpreter, Options};
use crate::machine::Machine;
use std::cell::RefCell;
use std::rc::Rc;

/// Console handle tests can keep while the interpreter owns the box.
#[derive(Clone)]
pub struct SharedConsole(pub Rc<RefCell<RecordingConsole>>);

impl Console for SharedConsole {
    fn write_char(&mut self, c: char) {
        self.0.borrow_mut().write_char(c);
    }

    fn write_str(&mut self, s: &str) {
        self.0.borrow_mut().write_str(s);
    }

    fn read_line(&mut self) -> String {
        self.0.borrow_mut().read_line()
    }

    fn log_error(&mut self, msg: &str) {
        self.0.borrow_mut().log_error(msg);
    }
}

/// File service handle shared the same way.
#[derive(Clone)]
pub struct SharedFiles(pub Rc<RefCell<MemFileService>>);

impl FileService for SharedFiles {
    fn open(&mut self, name: &str, mode: FileMode) -> Result<FileHandle, Fault> {
        self.0.borrow_mut().open(name, mode)
    }

    fn close(&mut self, handle: FileHandle) -> Result<(), Fault> {
        self.0.borrow_mut().close(handle)
    }

    fn read_byte(&mut self, handle: FileHandle) -> Result<u8, Fault> {
        self.0.borrow_mut().read_byte(handle)
    }

    fn read_block(&mut self, handle: FileHandle, size: usize) -> Result<Vec<u8>, Fault> {
        self.0.borrow_mut().read_block(handle, size)
    }

    fn write_byte(&mut self, handle: FileHandle, value: u8) -> Result<(), Fault> {
        self.0.borrow_mut().write_byte(handle, value)
    }

    fn seek(&mut self, handle: FileHandle, offset: i64, origin: SeekOrigin) -> Result<(), Fault> {
        self.0.borrow_mut().seek(handle, offset, origin)
    }

    fn tell(&mut self, handle: FileHandle) -> Result<u64, Fault> {
        self.0.borrow_mut().tell(handle)
    }

    fn eof(&mut self, handle: FileHandle) -> Result<bool, Fault> {
        self.0.borrow_mut().eof(handle)
    }

    fn rewind(&mut self, handle: FileHandle) -> Result<(), Fault> {
        self.0.borrow_mut().rewind(handle)
    }

    fn flush(&mut self, handle: FileHandle) -> Result<(), Fault> {
        self.0.borrow_mut().flush(handle)
    }
}

pub struct TestHarness {
    pub interpreter: Interpreter,
    pub console: Rc<RefCell<RecordingConsole>>,
    pub files: Rc<RefCell<MemFileService>>,
}

impl TestHarness {
    pub fn output(&self) -> String {
        self.console.borrow().output.clone()
    }

    pub fn queue_input(&self, line: &str) {
        self.console
            .borrow_mut()
            .inputs
            .push_back(line.to_string());
    }
}

/// Interpreter over a built story with a scripted console and in-memory
/// files. Pagination is off unless a test turns it on.
pub fn harness(builder: &StoryBuilder) -> TestHarness {
    let console = Rc::new(RefCell::new(RecordingConsole::new()));
    let files = Rc::new(RefCell::new(MemFileService::new()));
    let options = Options {
        rows: 0,
        ..Options::default()
    };
    let interpreter = Interpreter::with_options(
        Machine::new(builder.build_image()),
        Box::new(SharedConsole(console.clone())),
        Box::new(SharedFiles(files.clone())),
        options,
    );
    TestHarness {
        interpreter,
        console,
        files,
    }
}
