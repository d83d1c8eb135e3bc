//! Save, restore and undo
//!
//! A save stream records the call frames and operand stack, then the
//! dynamic-memory region as an XOR/RLE diff against the pristine story
//! image: a zero byte plus a two-byte big-endian count skips unchanged
//! bytes, a non-zero byte is the XOR of current and original. Trailing
//! unchanged bytes are omitted. Undo keeps one full in-memory snapshot
//! instead of diffing.

use crate::fault::Fault;
use crate::files::{FileHandle, FileService};
use crate::machine::{CallFrame, Machine, MAX_FRAMES};
use crate::memory::DYNAMIC_BASE;
use log::debug;

/// Longest run a single skip record can encode.
const MAX_RUN: usize = 0xFFFF;

/// One retained generation of machine state for save_undo/restore_undo.
pub struct UndoSnapshot {
    frames: Vec<CallFrame>,
    stack: Vec<u16>,
    dynamic: Vec<u8>,
    pc: u32,
}

/// Capture the machine with its PC already positioned on the triggering
/// instruction's store byte.
pub fn capture_undo(machine: &Machine) -> UndoSnapshot {
    UndoSnapshot {
        frames: machine.frames.clone(),
        stack: machine.stack.clone(),
        dynamic: machine.memory.dynamic().to_vec(),
        pc: machine.pc,
    }
}

pub fn apply_undo(machine: &mut Machine, snapshot: &UndoSnapshot) {
    machine.frames = snapshot.frames.clone();
    machine.stack = snapshot.stack.clone();
    machine.memory.set_dynamic(&snapshot.dynamic);
    machine.pc = snapshot.pc;
}

fn frame_flags(frame: &CallFrame) -> u8 {
    let mut flags = frame.num_locals & 0x0F;
    flags |= frame.argc.min(7) << 4;
    if frame.result_expected {
        flags |= 0x80;
    }
    flags
}

fn write_pc24(
    files: &mut dyn FileService,
    handle: FileHandle,
    pc: u32,
) -> Result<(), Fault> {
    files.write_byte(handle, (pc >> 16) as u8)?;
    files.write_byte(handle, (pc >> 8) as u8)?;
    files.write_byte(handle, pc as u8)
}

fn read_pc24(files: &mut dyn FileService, handle: FileHandle) -> Result<u32, Fault> {
    let high = files.read_byte(handle)? as u32;
    let mid = files.read_byte(handle)? as u32;
    let low = files.read_byte(handle)? as u32;
    Ok((high << 16) | (mid << 8) | low)
}

/// Write the machine state to an open handle. `resume_pc` points at the
/// triggering instruction's store or branch byte so a restore can replay
/// its result.
pub fn write_save(
    machine: &Machine,
    resume_pc: u32,
    files: &mut dyn FileService,
    handle: FileHandle,
) -> Result<(), Fault> {
    // Non-root frames; the root frame carries no information
    let frames = &machine.frames[1..];
    files.write_byte(handle, frames.len() as u8)?;
    for frame in frames {
        files.write_byte(handle, frame_flags(frame))?;
        write_pc24(files, handle, frame.return_pc)?;
        files.write_byte(handle, (frame.locals_base >> 8) as u8)?;
        files.write_byte(handle, frame.locals_base as u8)?;
    }
    // Resume PC rides as a final base-less tuple
    files.write_byte(handle, 0)?;
    write_pc24(files, handle, resume_pc)?;

    files.write_byte(handle, (machine.stack.len() >> 8) as u8)?;
    files.write_byte(handle, machine.stack.len() as u8)?;
    for &word in &machine.stack {
        files.write_byte(handle, (word >> 8) as u8)?;
        files.write_byte(handle, word as u8)?;
    }

    let boundary = machine.memory.header().static_start;
    let current = &machine.memory.dynamic()[DYNAMIC_BASE..boundary];
    let original = &machine.memory.original()[DYNAMIC_BASE..boundary];
    let diff = compress_dynamic(current, original);
    debug!(
        "save: {} frames, {} stack words, {} diff bytes",
        frames.len(),
        machine.stack.len(),
        diff.len()
    );
    for b in diff {
        files.write_byte(handle, b)?;
    }
    files.flush(handle)
}

/// Read a save stream back into the machine. Returns the resume PC; the
/// caller replays the triggering instruction's branch/store from there.
pub fn read_save(
    machine: &mut Machine,
    files: &mut dyn FileService,
    handle: FileHandle,
) -> Result<u32, Fault> {
    let frame_count = files.read_byte(handle)? as usize;
    if frame_count >= MAX_FRAMES {
        return Err(Fault::Io(format!(
            "save stream holds {} frames",
            frame_count
        )));
    }
    let mut frames = vec![CallFrame {
        return_pc: 0,
        locals_base: 0,
        num_locals: 0,
        argc: 0,
        result_expected: false,
    }];
    for _ in 0..frame_count {
        let flags = files.read_byte(handle)?;
        let return_pc = read_pc24(files, handle)?;
        let base_high = files.read_byte(handle)? as usize;
        let base_low = files.read_byte(handle)? as usize;
        frames.push(CallFrame {
            return_pc,
            locals_base: (base_high << 8) | base_low,
            num_locals: flags & 0x0F,
            argc: (flags >> 4) & 0x07,
            result_expected: flags & 0x80 != 0,
        });
    }
    let resume_flags = files.read_byte(handle)?;
    if resume_flags != 0 {
        return Err(Fault::Io("malformed resume tuple in save stream".to_string()));
    }
    let resume_pc = read_pc24(files, handle)?;

    let stack_high = files.read_byte(handle)? as usize;
    let stack_low = files.read_byte(handle)? as usize;
    let stack_len = (stack_high << 8) | stack_low;
    let mut stack = Vec::with_capacity(stack_len);
    for _ in 0..stack_len {
        let high = files.read_byte(handle)? as u16;
        let low = files.read_byte(handle)? as u16;
        stack.push((high << 8) | low);
    }

    let mut diff = Vec::new();
    while !files.eof(handle)? {
        diff.push(files.read_byte(handle)?);
    }
    let boundary = machine.memory.header().static_start;
    let original = &machine.memory.original()[DYNAMIC_BASE..boundary];
    let dynamic = decompress_dynamic(&diff, original)?;

    let mut region = machine.memory.original()[..DYNAMIC_BASE].to_vec();
    region.extend_from_slice(&dynamic);
    machine.memory.set_dynamic(&region);
    machine.frames = frames;
    machine.stack = stack;
    machine.pc = resume_pc;
    debug!(
        "restore: {} frames, {} stack words, resume at {:05x}",
        frame_count, stack_len, resume_pc
    );
    Ok(resume_pc)
}

/// Diff the dynamic region against the pristine image.
pub fn compress_dynamic(current: &[u8], original: &[u8]) -> Vec<u8> {
    let mut diff = Vec::new();
    let mut n = 0;
    while n < current.len() {
        let xor = current[n] ^ original[n];
        if xor != 0 {
            diff.push(xor);
            n += 1;
            continue;
        }
        let start = n;
        while n < current.len() && current[n] ^ original[n] == 0 {
            n += 1;
        }
        if n == current.len() {
            // Trailing unchanged bytes are implicit
            break;
        }
        let mut run = n - start;
        while run > 0 {
            let chunk = run.min(MAX_RUN);
            diff.push(0);
            diff.push((chunk >> 8) as u8);
            diff.push(chunk as u8);
            run -= chunk;
        }
    }
    diff
}

/// Rebuild the dynamic region from a diff and the pristine image.
pub fn decompress_dynamic(diff: &[u8], original: &[u8]) -> Result<Vec<u8>, Fault> {
    let mut dynamic = Vec::with_capacity(original.len());
    let mut cursor = 0;
    while cursor < diff.len() {
        if dynamic.len() >= original.len() {
            return Err(Fault::Io("save diff longer than dynamic memory".to_string()));
        }
        let b = diff[cursor];
        cursor += 1;
        if b == 0 {
            if cursor + 1 >= diff.len() {
                return Err(Fault::Io("truncated run in save diff".to_string()));
            }
            let run = ((diff[cursor] as usize) << 8) | diff[cursor + 1] as usize;
            cursor += 2;
            if dynamic.len() + run > original.len() {
                return Err(Fault::Io("save diff run beyond dynamic memory".to_string()));
            }
            let at = dynamic.len();
            dynamic.extend_from_slice(&original[at..at + run]);
        } else {
            dynamic.push(original[dynamic.len()] ^ b);
        }
    }
    // Remainder is unchanged
    let at = dynamic.len();
    dynamic.extend_from_slice(&original[at..]);
    Ok(dynamic)
}
