//! Handle-based file service
//!
//! The host owns all file naming, picking and archival concerns; the core
//! only sees opaque integer handles through this trait. The story file is
//! opened once for streamed loading; save files are opened on demand by the
//! save/restore opcodes.

use crate::fault::Fault;
use log::debug;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

pub type FileHandle = i32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMode {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    Start,
    Current,
    End,
}

/// Abstract file access used by the interpreter. Handles are opaque scalars;
/// they are never aliased or pooled by the core.
pub trait FileService {
    fn open(&mut self, name: &str, mode: FileMode) -> Result<FileHandle, Fault>;
    fn close(&mut self, handle: FileHandle) -> Result<(), Fault>;
    fn read_byte(&mut self, handle: FileHandle) -> Result<u8, Fault>;
    fn read_block(&mut self, handle: FileHandle, size: usize) -> Result<Vec<u8>, Fault>;
    fn write_byte(&mut self, handle: FileHandle, value: u8) -> Result<(), Fault>;
    fn seek(&mut self, handle: FileHandle, offset: i64, origin: SeekOrigin) -> Result<(), Fault>;
    fn tell(&mut self, handle: FileHandle) -> Result<u64, Fault>;
    fn eof(&mut self, handle: FileHandle) -> Result<bool, Fault>;
    fn rewind(&mut self, handle: FileHandle) -> Result<(), Fault>;
    fn flush(&mut self, handle: FileHandle) -> Result<(), Fault>;
}

/// File service over std::fs, used by the terminal binary.
pub struct StdFileService {
    next_handle: FileHandle,
    files: HashMap<FileHandle, (File, u64)>,
}

impl StdFileService {
    pub fn new() -> Self {
        StdFileService {
            next_handle: 1,
            files: HashMap::new(),
        }
    }

    fn file(&mut self, handle: FileHandle) -> Result<&mut (File, u64), Fault> {
        self.files
            .get_mut(&handle)
            .ok_or_else(|| Fault::Io(format!("unknown file handle {}", handle)))
    }
}

impl Default for StdFileService {
    fn default() -> Self {
        Self::new()
    }
}

impl FileService for StdFileService {
    fn open(&mut self, name: &str, mode: FileMode) -> Result<FileHandle, Fault> {
        let file = match mode {
            FileMode::Read => File::open(name)?,
            FileMode::Write => OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(name)?,
        };
        let len = file.metadata()?.len();
        let handle = self.next_handle;
        self.next_handle += 1;
        self.files.insert(handle, (file, len));
        debug!("open {:?} {:?} -> handle {}", name, mode, handle);
        Ok(handle)
    }

    fn close(&mut self, handle: FileHandle) -> Result<(), Fault> {
        self.files
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| Fault::Io(format!("close of unknown handle {}", handle)))
    }

    fn read_byte(&mut self, handle: FileHandle) -> Result<u8, Fault> {
        let (file, _) = self.file(handle)?;
        let mut buf = [0u8; 1];
        file.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_block(&mut self, handle: FileHandle, size: usize) -> Result<Vec<u8>, Fault> {
        let (file, _) = self.file(handle)?;
        let mut buf = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    fn write_byte(&mut self, handle: FileHandle, value: u8) -> Result<(), Fault> {
        let (file, len) = self.file(handle)?;
        file.write_all(&[value])?;
        *len = (*len).max(file.stream_position()?);
        Ok(())
    }

    fn seek(&mut self, handle: FileHandle, offset: i64, origin: SeekOrigin) -> Result<(), Fault> {
        let (file, _) = self.file(handle)?;
        let pos = match origin {
            SeekOrigin::Start => SeekFrom::Start(offset as u64),
            SeekOrigin::Current => SeekFrom::Current(offset),
            SeekOrigin::End => SeekFrom::End(offset),
        };
        file.seek(pos)?;
        Ok(())
    }

    fn tell(&mut self, handle: FileHandle) -> Result<u64, Fault> {
        let (file, _) = self.file(handle)?;
        Ok(file.stream_position()?)
    }

    fn eof(&mut self, handle: FileHandle) -> Result<bool, Fault> {
        let (file, len) = self.file(handle)?;
        let pos = file.stream_position()?;
        Ok(pos >= *len)
    }

    fn rewind(&mut self, handle: FileHandle) -> Result<(), Fault> {
        self.seek(handle, 0, SeekOrigin::Start)
    }

    fn flush(&mut self, handle: FileHandle) -> Result<(), Fault> {
        let (file, _) = self.file(handle)?;
        file.flush()?;
        Ok(())
    }
}

/// In-memory file service for tests and embedded hosts. Named buffers
/// persist across open/close so a save can be read back by a restore.
pub struct MemFileService {
    next_handle: FileHandle,
    store: HashMap<String, Vec<u8>>,
    open_files: HashMap<FileHandle, OpenMemFile>,
}

struct OpenMemFile {
    name: String,
    pos: usize,
    mode: FileMode,
}

impl MemFileService {
    pub fn new() -> Self {
        MemFileService {
            next_handle: 1,
            store: HashMap::new(),
            open_files: HashMap::new(),
        }
    }

    /// Pre-load a named buffer (e.g. the story file) before running.
    pub fn insert(&mut self, name: &str, bytes: Vec<u8>) {
        self.store.insert(name.to_string(), bytes);
    }

    /// Inspect a named buffer after the fact.
    pub fn contents(&self, name: &str) -> Option<&[u8]> {
        self.store.get(name).map(|v| v.as_slice())
    }

    fn open_file(&mut self, handle: FileHandle) -> Result<&mut OpenMemFile, Fault> {
        self.open_files
            .get_mut(&handle)
            .ok_or_else(|| Fault::Io(format!("unknown file handle {}", handle)))
    }
}

impl Default for MemFileService {
    fn default() -> Self {
        Self::new()
    }
}

impl FileService for MemFileService {
    fn open(&mut self, name: &str, mode: FileMode) -> Result<FileHandle, Fault> {
        match mode {
            FileMode::Read => {
                if !self.store.contains_key(name) {
                    return Err(Fault::Io(format!("no such file: {}", name)));
                }
            }
            FileMode::Write => {
                self.store.insert(name.to_string(), Vec::new());
            }
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        self.open_files.insert(
            handle,
            OpenMemFile {
                name: name.to_string(),
                pos: 0,
                mode,
            },
        );
        Ok(handle)
    }

    fn close(&mut self, handle: FileHandle) -> Result<(), Fault> {
        self.open_files
            .remove(&handle)
            .map(|_| ())
            .ok_or_else(|| Fault::Io(format!("close of unknown handle {}", handle)))
    }

    fn read_byte(&mut self, handle: FileHandle) -> Result<u8, Fault> {
        let file = self.open_files
            .get_mut(&handle)
            .ok_or_else(|| Fault::Io(format!("unknown file handle {}", handle)))?;
        let bytes = &self.store[&file.name];
        if file.pos >= bytes.len() {
            return Err(Fault::Io("read past end of file".to_string()));
        }
        let b = bytes[file.pos];
        file.pos += 1;
        Ok(b)
    }

    fn read_block(&mut self, handle: FileHandle, size: usize) -> Result<Vec<u8>, Fault> {
        let file = self.open_files
            .get_mut(&handle)
            .ok_or_else(|| Fault::Io(format!("unknown file handle {}", handle)))?;
        let bytes = &self.store[&file.name];
        let end = (file.pos + size).min(bytes.len());
        let block = bytes[file.pos..end].to_vec();
        file.pos = end;
        Ok(block)
    }

    fn write_byte(&mut self, handle: FileHandle, value: u8) -> Result<(), Fault> {
        let file = self.open_files
            .get_mut(&handle)
            .ok_or_else(|| Fault::Io(format!("unknown file handle {}", handle)))?;
        if file.mode != FileMode::Write {
            return Err(Fault::Io("write to read-only handle".to_string()));
        }
        let bytes = self
            .store
            .get_mut(&file.name)
            .ok_or_else(|| Fault::Io(format!("backing buffer missing for {}", file.name)))?;
        if file.pos < bytes.len() {
            bytes[file.pos] = value;
        } else {
            bytes.push(value);
        }
        file.pos += 1;
        Ok(())
    }

    fn seek(&mut self, handle: FileHandle, offset: i64, origin: SeekOrigin) -> Result<(), Fault> {
        let len = {
            let file = self.open_file(handle)?;
            let name = file.name.clone();
            self.store[&name].len()
        };
        let file = self.open_file(handle)?;
        let base = match origin {
            SeekOrigin::Start => 0i64,
            SeekOrigin::Current => file.pos as i64,
            SeekOrigin::End => len as i64,
        };
        let target = base + offset;
        if target < 0 {
            return Err(Fault::Io("seek before start of file".to_string()));
        }
        file.pos = target as usize;
        Ok(())
    }

    fn tell(&mut self, handle: FileHandle) -> Result<u64, Fault> {
        Ok(self.open_file(handle)?.pos as u64)
    }

    fn eof(&mut self, handle: FileHandle) -> Result<bool, Fault> {
        let (name, pos) = {
            let file = self.open_file(handle)?;
            (file.name.clone(), file.pos)
        };
        Ok(pos >= self.store[&name].len())
    }

    fn rewind(&mut self, handle: FileHandle) -> Result<(), Fault> {
        self.open_file(handle)?.pos = 0;
        Ok(())
    }

    fn flush(&mut self, _handle: FileHandle) -> Result<(), Fault> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_file_round_trip() {
        let mut files = MemFileService::new();
        let h = files.open("save.dat", FileMode::Write).unwrap();
        for b in [1u8, 2, 3] {
            files.write_byte(h, b).unwrap();
        }
        files.close(h).unwrap();

        let h = files.open("save.dat", FileMode::Read).unwrap();
        assert_eq!(files.read_block(h, 3).unwrap(), vec![1, 2, 3]);
        assert!(files.eof(h).unwrap());
        files.rewind(h).unwrap();
        assert_eq!(files.read_byte(h).unwrap(), 1);
        files.close(h).unwrap();
    }

    #[test]
    fn missing_file_is_an_error() {
        let mut files = MemFileService::new();
        assert!(files.open("absent", FileMode::Read).is_err());
    }
}
