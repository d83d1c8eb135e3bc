//! Instruction dispatch engine
//!
//! A single fetch-execute loop: decode at the PC, resolve operands, run one
//! exhaustive dispatch, then apply the store/branch post-processing each
//! opcode calls for. Output funnels through one pipeline (memory
//! redirection, transcript, pagination); input opcodes make one blocking
//! console call each.

use crate::console::Console;
use crate::dictionary::{self, Dictionary};
use crate::fault::Fault;
use crate::files::{FileHandle, FileMode, FileService};
use crate::instruction::{Instruction, OperandCount, OperandType};
use crate::machine::Machine;
use crate::object::ObjectSystem;
use crate::random::ZRand;
use crate::save::{self, UndoSnapshot};
use crate::text;
use log::{debug, trace, warn};

/// Maximum nesting of memory-table output redirection.
const STREAM3_DEPTH: usize = 16;

/// Result of executing one instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// Fall through to the next instruction
    Continue,
    /// Branch taken, PC already updated
    Branched,
    /// Routine called, PC at its first instruction
    Called,
    /// Routine returned, PC restored
    Returned,
    /// Story requested termination
    Quit,
}

/// Terminal outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Quit,
}

/// Host-tunable knobs for a run.
pub struct Options {
    /// Screen rows before a [MORE] pause; 0 disables pagination
    pub rows: u16,
    pub save_name: String,
    pub transcript_name: String,
    pub command_name: String,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            rows: 24,
            save_name: "story.sav".to_string(),
            transcript_name: "transcript.txt".to_string(),
            command_name: "commands.rec".to_string(),
        }
    }
}

pub struct Interpreter {
    pub machine: Machine,
    rng: ZRand,
    console: Box<dyn Console>,
    files: Box<dyn FileService>,
    options: Options,
    undo: Option<UndoSnapshot>,
    /// Stream 1: the screen
    screen_enabled: bool,
    /// Stream 2: transcript file handle
    transcript: Option<FileHandle>,
    /// Stream 3: nested memory-table redirection
    stream3: Vec<usize>,
    /// Stream 4: command log handle
    command_log: Option<FileHandle>,
    /// Input stream 1: command replay handle
    input_replay: Option<FileHandle>,
    rows_printed: u16,
    instruction_count: u64,
}

impl Interpreter {
    pub fn new(machine: Machine, console: Box<dyn Console>, files: Box<dyn FileService>) -> Self {
        Interpreter::with_options(machine, console, files, Options::default())
    }

    pub fn with_options(
        machine: Machine,
        console: Box<dyn Console>,
        files: Box<dyn FileService>,
        options: Options,
    ) -> Self {
        Interpreter {
            machine,
            rng: ZRand::new(),
            console,
            files,
            options,
            undo: None,
            screen_enabled: true,
            transcript: None,
            stream3: Vec::new(),
            command_log: None,
            input_replay: None,
            rows_printed: 0,
            instruction_count: 0,
        }
    }

    pub fn console(&self) -> &dyn Console {
        self.console.as_ref()
    }

    pub fn rng_mut(&mut self) -> &mut ZRand {
        &mut self.rng
    }

    /// Fetch-execute until the story quits or a fatal fault occurs.
    pub fn run(&mut self) -> Result<Outcome, Fault> {
        loop {
            let pc = self.machine.pc;
            match self.step() {
                Ok(ExecutionResult::Quit) => {
                    debug!("quit after {} instructions", self.instruction_count);
                    return Ok(Outcome::Quit);
                }
                Ok(_) => {}
                Err(fault) => {
                    self.console
                        .log_error(&format!("fatal at PC {:05x}: {}", pc, fault));
                    return Err(fault);
                }
            }
        }
    }

    /// Decode and execute one instruction.
    pub fn step(&mut self) -> Result<ExecutionResult, Fault> {
        let inst = Instruction::decode(&self.machine.memory, self.machine.pc)?;
        trace!("{}", inst);
        self.instruction_count += 1;
        self.machine.pc += inst.size as u32;
        self.execute(&inst)
    }

    /// Fetch operand values; variable operands read (and may pop) now, in
    /// operand order.
    fn resolve_operands(&mut self, inst: &Instruction) -> Result<Vec<u16>, Fault> {
        let mut values = Vec::with_capacity(inst.operands.len());
        for (n, &raw) in inst.operands.iter().enumerate() {
            let value = match inst.operand_types[n] {
                OperandType::Variable => self.machine.read_variable(raw as u8)?,
                _ => raw,
            };
            values.push(value);
        }
        Ok(values)
    }

    pub fn execute(&mut self, inst: &Instruction) -> Result<ExecutionResult, Fault> {
        let operands = self.resolve_operands(inst)?;
        if inst.ext_opcode.is_some() {
            return self.execute_ext(inst, &operands);
        }
        match inst.operand_count {
            OperandCount::OP0 => self.execute_0op(inst),
            OperandCount::OP1 => self.execute_1op(inst, operands[0]),
            OperandCount::OP2 => self.execute_2op(inst, &operands),
            OperandCount::VAR => self.execute_var(inst, &operands),
        }
    }

    fn unknown(&self, inst: &Instruction) -> Fault {
        Fault::UnknownOpcode {
            opcode: inst.canonical(),
            pc: inst.addr,
        }
    }

    fn store(&mut self, inst: &Instruction, value: u16) -> Result<(), Fault> {
        if let Some(var) = inst.store_var {
            self.machine.write_variable(var, value)?;
        }
        Ok(())
    }

    /// Apply a taken branch offset: 0 and 1 return from the routine, any
    /// other offset jumps relative to the address after the branch data.
    fn apply_branch_offset(&mut self, offset: i16) -> Result<ExecutionResult, Fault> {
        match offset {
            0 => self.do_return(0),
            1 => self.do_return(1),
            _ => {
                self.machine.pc = (self.machine.pc as i64 + offset as i64 - 2) as u32;
                Ok(ExecutionResult::Branched)
            }
        }
    }

    fn do_branch(
        &mut self,
        inst: &Instruction,
        condition: bool,
    ) -> Result<ExecutionResult, Fault> {
        let branch = inst.branch.as_ref().ok_or_else(|| Fault::BadInstruction {
            pc: inst.addr,
            reason: "branch post-byte missing".to_string(),
        })?;
        if condition == branch.on_true {
            self.apply_branch_offset(branch.offset)
        } else {
            Ok(ExecutionResult::Continue)
        }
    }

    fn do_return(&mut self, value: u16) -> Result<ExecutionResult, Fault> {
        self.machine.exit_routine(value)?;
        Ok(ExecutionResult::Returned)
    }

    /// Common routine-call path. Address 0 returns false immediately
    /// without calling.
    fn do_call(
        &mut self,
        inst: &Instruction,
        operands: &[u16],
        stores: bool,
    ) -> Result<ExecutionResult, Fault> {
        let packed = operands.first().copied().ok_or_else(|| Fault::BadInstruction {
            pc: inst.addr,
            reason: "call without a routine operand".to_string(),
        })?;
        if packed == 0 {
            if stores {
                self.store(inst, 0)?;
            }
            return Ok(ExecutionResult::Continue);
        }
        let addr = self.machine.memory.routine_addr(packed);
        self.machine.enter_routine(addr, stores, &operands[1..])?;
        Ok(ExecutionResult::Called)
    }

    // ---- output pipeline ----

    /// Emit text through the active output streams. While stream 3 is
    /// selected it captures everything and the others stay silent.
    fn output(&mut self, s: &str) -> Result<(), Fault> {
        if let Some(&table) = self.stream3.last() {
            for c in s.chars() {
                let code = if c == '\n' {
                    13
                } else {
                    text::char_to_zscii(c).unwrap_or(b'?')
                };
                let count = self.machine.memory.read_word(table)?;
                self.machine
                    .memory
                    .write_byte(table + 2 + count as usize, code)?;
                self.machine.memory.write_word(table, count + 1)?;
            }
            return Ok(());
        }
        if self.screen_enabled {
            self.page_output(s);
        }
        if let Some(handle) = self.transcript {
            for &b in s.as_bytes() {
                if self.files.write_byte(handle, b).is_err() {
                    warn!("transcript write failed; stream disabled");
                    self.transcript = None;
                    break;
                }
            }
        }
        Ok(())
    }

    /// Screen output with [MORE] pagination.
    fn page_output(&mut self, s: &str) {
        for segment in s.split_inclusive('\n') {
            self.console.write_str(segment);
            if segment.ends_with('\n') {
                self.rows_printed += 1;
                if self.options.rows > 1 && self.rows_printed >= self.options.rows - 1 {
                    self.console.write_str("[MORE]");
                    self.console.read_line();
                    self.rows_printed = 0;
                }
            }
        }
    }

    /// One blocking line of input, from the replay stream when selected.
    /// Input resets the pagination budget and feeds the command log.
    fn read_input_line(&mut self) -> String {
        self.rows_printed = 0;
        let line = match self.input_replay {
            Some(handle) => {
                let mut bytes = Vec::new();
                loop {
                    match self.files.read_byte(handle) {
                        Ok(b'\n') => break,
                        Ok(b'\r') => {}
                        Ok(b) => bytes.push(b),
                        Err(_) => {
                            debug!("command replay exhausted");
                            self.close_replay();
                            break;
                        }
                    }
                }
                let line = String::from_utf8_lossy(&bytes).to_string();
                // Echo replayed commands as if typed
                self.console.write_str(&line);
                self.console.write_str("\n");
                line
            }
            None => self.console.read_line(),
        };
        if let Some(handle) = self.command_log {
            for &b in line.as_bytes() {
                let _ = self.files.write_byte(handle, b);
            }
            let _ = self.files.write_byte(handle, b'\n');
        }
        line
    }

    fn close_replay(&mut self) {
        if let Some(handle) = self.input_replay.take() {
            let _ = self.files.close(handle);
        }
    }

    // ---- opcode families ----

    fn execute_0op(&mut self, inst: &Instruction) -> Result<ExecutionResult, Fault> {
        let version = self.machine.version();
        match inst.opcode {
            0x00 => self.do_return(1),
            0x01 => self.do_return(0),
            0x02 => {
                if let Some(s) = inst.text.clone() {
                    self.output(&s)?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x03 => {
                if let Some(s) = inst.text.clone() {
                    self.output(&s)?;
                }
                self.output("\n")?;
                self.do_return(1)
            }
            0x04 => Ok(ExecutionResult::Continue),
            0x05 if version <= 4 => self.do_save(inst),
            0x06 if version <= 4 => self.do_restore(inst),
            0x07 => {
                debug!("restart");
                self.machine.restart();
                self.stream3.clear();
                self.undo = None;
                Ok(ExecutionResult::Branched)
            }
            0x08 => {
                let value = self.machine.pop()?;
                self.do_return(value)
            }
            0x09 if version <= 4 => {
                self.machine.pop()?;
                Ok(ExecutionResult::Continue)
            }
            0x09 => {
                let depth = self.machine.frame_depth();
                self.store(inst, depth)?;
                Ok(ExecutionResult::Continue)
            }
            0x0A => Ok(ExecutionResult::Quit),
            0x0B => {
                self.output("\n")?;
                Ok(ExecutionResult::Continue)
            }
            0x0C if version <= 3 => {
                // Status-line rendering lives outside the core
                debug!("show_status ignored");
                Ok(ExecutionResult::Continue)
            }
            0x0D => {
                let sum = self.machine.memory.checksum();
                let expected = self.machine.memory.header().checksum;
                self.do_branch(inst, sum == expected)
            }
            0x0F if version >= 5 => self.do_branch(inst, true),
            _ => Err(self.unknown(inst)),
        }
    }

    fn execute_1op(&mut self, inst: &Instruction, op: u16) -> Result<ExecutionResult, Fault> {
        let version = self.machine.version();
        match inst.opcode {
            0x00 => self.do_branch(inst, op == 0),
            0x01 => {
                let sibling = self.machine.obj_sibling(op)?;
                self.store(inst, sibling)?;
                self.do_branch(inst, sibling != 0)
            }
            0x02 => {
                let child = self.machine.obj_child(op)?;
                self.store(inst, child)?;
                self.do_branch(inst, child != 0)
            }
            0x03 => {
                let parent = self.machine.obj_parent(op)?;
                self.store(inst, parent)?;
                Ok(ExecutionResult::Continue)
            }
            0x04 => {
                let len = self.machine.property_length_at(op as usize)?;
                self.store(inst, len)?;
                Ok(ExecutionResult::Continue)
            }
            0x05 => {
                let var = op as u8;
                let value = (self.machine.read_variable_indirect(var)? as i16).wrapping_add(1);
                self.machine.write_variable_indirect(var, value as u16)?;
                Ok(ExecutionResult::Continue)
            }
            0x06 => {
                let var = op as u8;
                let value = (self.machine.read_variable_indirect(var)? as i16).wrapping_sub(1);
                self.machine.write_variable_indirect(var, value as u16)?;
                Ok(ExecutionResult::Continue)
            }
            0x07 => {
                let (s, _) = text::decode_string(&self.machine.memory, op as usize)?;
                self.output(&s)?;
                Ok(ExecutionResult::Continue)
            }
            0x08 if version >= 4 => self.do_call(inst, &[op], true),
            0x09 => {
                self.machine.remove_object(op)?;
                Ok(ExecutionResult::Continue)
            }
            0x0A => {
                let name = self.machine.object_name(op)?;
                self.output(&name)?;
                Ok(ExecutionResult::Continue)
            }
            0x0B => self.do_return(op),
            0x0C => {
                self.machine.pc =
                    (self.machine.pc as i64 + (op as i16) as i64 - 2) as u32;
                Ok(ExecutionResult::Branched)
            }
            0x0D => {
                let addr = self.machine.memory.string_addr(op);
                let (s, _) = text::decode_string(&self.machine.memory, addr as usize)?;
                self.output(&s)?;
                Ok(ExecutionResult::Continue)
            }
            0x0E => {
                let value = self.machine.read_variable_indirect(op as u8)?;
                self.store(inst, value)?;
                Ok(ExecutionResult::Continue)
            }
            0x0F if version <= 4 => {
                self.store(inst, !op)?;
                Ok(ExecutionResult::Continue)
            }
            0x0F => self.do_call(inst, &[op], false),
            _ => Err(self.unknown(inst)),
        }
    }

    fn execute_2op(
        &mut self,
        inst: &Instruction,
        ops: &[u16],
    ) -> Result<ExecutionResult, Fault> {
        if ops.len() < 2 && !matches!(inst.opcode, 0x01) {
            return Err(Fault::BadInstruction {
                pc: inst.addr,
                reason: format!("2OP {:#04x} with {} operands", inst.opcode, ops.len()),
            });
        }
        let version = self.machine.version();
        let a = ops[0];
        let b = ops.get(1).copied().unwrap_or(0);
        match inst.opcode {
            0x01 => {
                let hit = ops[1..].contains(&a);
                self.do_branch(inst, hit)
            }
            0x02 => self.do_branch(inst, (a as i16) < (b as i16)),
            0x03 => self.do_branch(inst, (a as i16) > (b as i16)),
            0x04 => {
                let var = a as u8;
                let value = (self.machine.read_variable_indirect(var)? as i16).wrapping_sub(1);
                self.machine.write_variable_indirect(var, value as u16)?;
                self.do_branch(inst, value < b as i16)
            }
            0x05 => {
                let var = a as u8;
                let value = (self.machine.read_variable_indirect(var)? as i16).wrapping_add(1);
                self.machine.write_variable_indirect(var, value as u16)?;
                self.do_branch(inst, value > b as i16)
            }
            0x06 => {
                let parent = self.machine.obj_parent(a)?;
                self.do_branch(inst, parent == b)
            }
            0x07 => self.do_branch(inst, a & b == b),
            0x08 => {
                self.store(inst, a | b)?;
                Ok(ExecutionResult::Continue)
            }
            0x09 => {
                self.store(inst, a & b)?;
                Ok(ExecutionResult::Continue)
            }
            0x0A => {
                let set = self.machine.test_attribute(a, b)?;
                self.do_branch(inst, set)
            }
            0x0B => {
                self.machine.set_attribute(a, b)?;
                Ok(ExecutionResult::Continue)
            }
            0x0C => {
                self.machine.clear_attribute(a, b)?;
                Ok(ExecutionResult::Continue)
            }
            0x0D => {
                self.machine.write_variable_indirect(a as u8, b)?;
                Ok(ExecutionResult::Continue)
            }
            0x0E => {
                self.machine.insert_object(a, b)?;
                Ok(ExecutionResult::Continue)
            }
            0x0F => {
                let addr = a.wrapping_add(b.wrapping_mul(2)) as usize;
                let value = self.machine.memory.read_word(addr)?;
                self.store(inst, value)?;
                Ok(ExecutionResult::Continue)
            }
            0x10 => {
                let addr = a.wrapping_add(b) as usize;
                let value = self.machine.memory.read_byte(addr)? as u16;
                self.store(inst, value)?;
                Ok(ExecutionResult::Continue)
            }
            0x11 => {
                let value = self.machine.get_property(a, b)?;
                self.store(inst, value)?;
                Ok(ExecutionResult::Continue)
            }
            0x12 => {
                let addr = self.machine.property_address(a, b)?;
                self.store(inst, addr as u16)?;
                Ok(ExecutionResult::Continue)
            }
            0x13 => {
                let next = self.machine.next_property(a, b)?;
                self.store(inst, next)?;
                Ok(ExecutionResult::Continue)
            }
            0x14 => {
                let value = (a as i16).wrapping_add(b as i16) as u16;
                self.store(inst, value)?;
                Ok(ExecutionResult::Continue)
            }
            0x15 => {
                let value = (a as i16).wrapping_sub(b as i16) as u16;
                self.store(inst, value)?;
                Ok(ExecutionResult::Continue)
            }
            0x16 => {
                let value = (a as i16).wrapping_mul(b as i16) as u16;
                self.store(inst, value)?;
                Ok(ExecutionResult::Continue)
            }
            0x17 => {
                let value = self.signed_div(inst, a, b, false)?;
                self.store(inst, value)?;
                Ok(ExecutionResult::Continue)
            }
            0x18 => {
                let value = self.signed_div(inst, a, b, true)?;
                self.store(inst, value)?;
                Ok(ExecutionResult::Continue)
            }
            0x19 if version >= 4 => self.do_call(inst, ops, true),
            0x1A if version >= 5 => self.do_call(inst, ops, false),
            0x1B if version >= 5 => {
                debug!("set_colour ignored");
                Ok(ExecutionResult::Continue)
            }
            0x1C if version >= 5 => {
                self.machine.throw_to(a, b)?;
                Ok(ExecutionResult::Returned)
            }
            _ => Err(self.unknown(inst)),
        }
    }

    /// Signed division and modulo with the historical leniency: division by
    /// zero warns and yields zero instead of aborting.
    fn signed_div(
        &mut self,
        inst: &Instruction,
        a: u16,
        b: u16,
        modulo: bool,
    ) -> Result<u16, Fault> {
        if b == 0 {
            warn!(
                "{} by zero at PC {:05x}, storing 0",
                if modulo { "modulo" } else { "division" },
                inst.addr
            );
            return Ok(0);
        }
        let a = a as i16;
        let b = b as i16;
        let value = if modulo {
            a.wrapping_rem(b)
        } else {
            a.wrapping_div(b)
        };
        Ok(value as u16)
    }

    fn execute_var(
        &mut self,
        inst: &Instruction,
        ops: &[u16],
    ) -> Result<ExecutionResult, Fault> {
        let version = self.machine.version();
        match inst.opcode {
            0x00 => self.do_call(inst, ops, true),
            0x01 => {
                let addr = ops[0].wrapping_add(ops[1].wrapping_mul(2)) as usize;
                self.machine.memory.write_word(addr, ops[2])?;
                Ok(ExecutionResult::Continue)
            }
            0x02 => {
                let addr = ops[0].wrapping_add(ops[1]) as usize;
                self.machine.memory.write_byte(addr, ops[2] as u8)?;
                Ok(ExecutionResult::Continue)
            }
            0x03 => {
                self.machine.put_property(ops[0], ops[1], ops[2])?;
                Ok(ExecutionResult::Continue)
            }
            0x04 => self.do_read(inst, ops),
            0x05 => {
                if let Some(c) = text::zscii_to_char(ops[0]) {
                    self.output(&c.to_string())?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x06 => {
                self.output(&(ops[0] as i16).to_string())?;
                Ok(ExecutionResult::Continue)
            }
            0x07 => {
                let range = ops[0] as i16;
                if range > 0 {
                    let value = self.rng.get_random(range as u16);
                    self.store(inst, value)?;
                } else {
                    self.rng.randomize(range.unsigned_abs());
                    self.store(inst, 0)?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x08 => {
                self.machine.push(ops[0])?;
                Ok(ExecutionResult::Continue)
            }
            0x09 => {
                let value = self.machine.pop()?;
                self.machine.write_variable_indirect(ops[0] as u8, value)?;
                Ok(ExecutionResult::Continue)
            }
            // Window management is a rendering concern; the opcodes are
            // recognised and ignored
            0x0A | 0x0B => Ok(ExecutionResult::Continue),
            0x0C if version >= 4 => self.do_call(inst, ops, true),
            0x0D | 0x0E | 0x0F | 0x11 | 0x12 if version >= 4 => Ok(ExecutionResult::Continue),
            0x10 if version >= 4 => {
                // get_cursor reports a fixed origin without a screen model
                let addr = ops[0] as usize;
                self.machine.memory.write_word(addr, 1)?;
                self.machine.memory.write_word(addr + 2, 1)?;
                Ok(ExecutionResult::Continue)
            }
            0x13 => self.do_output_stream(ops),
            0x14 => self.do_input_stream(ops),
            0x15 => {
                // Sound lives outside the core; the capability is a no-op
                debug!("sound_effect ignored");
                Ok(ExecutionResult::Continue)
            }
            0x16 if version >= 4 => {
                let line = self.read_input_line();
                let code = match line.chars().next() {
                    Some(c) => text::char_to_zscii(c).unwrap_or(13) as u16,
                    None => 13,
                };
                self.store(inst, code)?;
                Ok(ExecutionResult::Continue)
            }
            0x17 if version >= 4 => self.do_scan_table(inst, ops),
            0x18 if version >= 5 => {
                self.store(inst, !ops[0])?;
                Ok(ExecutionResult::Continue)
            }
            0x19 | 0x1A if version >= 5 => self.do_call(inst, ops, false),
            0x1B if version >= 5 => self.do_tokenise(ops),
            0x1C if version >= 5 => self.do_encode_text(ops),
            0x1D if version >= 5 => self.do_copy_table(ops),
            0x1E if version >= 5 => self.do_print_table(ops),
            0x1F if version >= 5 => {
                let argc = self.machine.frame()?.argc as u16;
                self.do_branch(inst, ops[0] <= argc)
            }
            _ => Err(self.unknown(inst)),
        }
    }

    fn execute_ext(
        &mut self,
        inst: &Instruction,
        ops: &[u16],
    ) -> Result<ExecutionResult, Fault> {
        let ext = inst.ext_opcode.unwrap_or(0);
        match ext {
            0x00 => self.do_save(inst),
            0x01 => self.do_restore(inst),
            0x02 => {
                let places = ops[1] as i16;
                let value = if places >= 0 {
                    ops[0].wrapping_shl(places as u32)
                } else {
                    ops[0].wrapping_shr((-places) as u32)
                };
                self.store(inst, value)?;
                Ok(ExecutionResult::Continue)
            }
            0x03 => {
                let places = ops[1] as i16;
                let value = if places >= 0 {
                    (ops[0] as i16).wrapping_shl(places as u32)
                } else {
                    (ops[0] as i16).wrapping_shr((-places) as u32)
                };
                self.store(inst, value as u16)?;
                Ok(ExecutionResult::Continue)
            }
            0x04 => {
                // No font model; report failure
                self.store(inst, 0)?;
                Ok(ExecutionResult::Continue)
            }
            0x09 => {
                // Snapshot resumes after this instruction; the store byte
                // just behind the PC receives 2 on the restored side
                self.undo = Some(save::capture_undo(&self.machine));
                self.store(inst, 1)?;
                Ok(ExecutionResult::Continue)
            }
            0x0A => match self.undo.take() {
                Some(snapshot) => {
                    save::apply_undo(&mut self.machine, &snapshot);
                    let store_var = self
                        .machine
                        .memory
                        .read_byte(self.machine.pc as usize - 1)?;
                    self.machine.write_variable(store_var, 2)?;
                    Ok(ExecutionResult::Branched)
                }
                None => {
                    self.store(inst, 0)?;
                    Ok(ExecutionResult::Continue)
                }
            },
            0x0B => {
                if let Some(c) = char::from_u32(ops[0] as u32) {
                    self.output(&c.to_string())?;
                }
                Ok(ExecutionResult::Continue)
            }
            0x0C => {
                let known = char::from_u32(ops[0] as u32).is_some();
                self.store(inst, if known { 3 } else { 0 })?;
                Ok(ExecutionResult::Continue)
            }
            0x1D => {
                self.store(inst, ops[0] ^ ops[1])?;
                Ok(ExecutionResult::Continue)
            }
            _ => Err(Fault::UnknownOpcode {
                opcode: ext,
                pc: inst.addr,
            }),
        }
    }

    // ---- reading ----

    fn do_read(&mut self, inst: &Instruction, ops: &[u16]) -> Result<ExecutionResult, Fault> {
        let version = self.machine.version();
        let text_addr = ops[0] as usize;
        let parse_addr = ops.get(1).copied().unwrap_or(0) as usize;

        let line = self.read_input_line().to_lowercase();
        let max = self.machine.memory.read_byte(text_addr)? as usize;
        let bytes: Vec<u8> = line.bytes().take(max.max(1)).collect();

        if version <= 4 {
            for (n, &b) in bytes.iter().enumerate() {
                self.machine.memory.write_byte(text_addr + 1 + n, b)?;
            }
            self.machine.memory.write_byte(text_addr + 1 + bytes.len(), 0)?;
        } else {
            self.machine
                .memory
                .write_byte(text_addr + 1, bytes.len() as u8)?;
            for (n, &b) in bytes.iter().enumerate() {
                self.machine.memory.write_byte(text_addr + 2 + n, b)?;
            }
        }

        if parse_addr != 0 {
            let dict = Dictionary::main(&self.machine.memory)?;
            let offset_base = if version <= 4 { 1 } else { 2 };
            dictionary::tokenise(
                &mut self.machine.memory,
                &dict,
                &bytes,
                parse_addr,
                offset_base,
                false,
            )?;
        }

        if version >= 5 {
            // Terminated by return
            self.store(inst, 13)?;
        }
        Ok(ExecutionResult::Continue)
    }

    fn do_tokenise(&mut self, ops: &[u16]) -> Result<ExecutionResult, Fault> {
        let text_addr = ops[0] as usize;
        let parse_addr = ops[1] as usize;
        let dict_addr = ops.get(2).copied().unwrap_or(0) as usize;
        let skip_unknown = ops.get(3).copied().unwrap_or(0) != 0;

        let len = self.machine.memory.read_byte(text_addr + 1)? as usize;
        let mut bytes = Vec::with_capacity(len);
        for n in 0..len {
            bytes.push(self.machine.memory.read_byte(text_addr + 2 + n)?);
        }

        let dict = if dict_addr != 0 {
            Dictionary::at(&self.machine.memory, dict_addr)?
        } else {
            Dictionary::main(&self.machine.memory)?
        };
        dictionary::tokenise(
            &mut self.machine.memory,
            &dict,
            &bytes,
            parse_addr,
            2,
            skip_unknown,
        )?;
        Ok(ExecutionResult::Continue)
    }

    fn do_encode_text(&mut self, ops: &[u16]) -> Result<ExecutionResult, Fault> {
        let text_addr = ops[0] as usize;
        let length = ops[1] as usize;
        let from = ops[2] as usize;
        let dest = ops[3] as usize;

        let mut bytes = Vec::with_capacity(length);
        for n in 0..length {
            bytes.push(self.machine.memory.read_byte(text_addr + from + n)?);
        }
        let alphabets = text::AlphabetSet::for_story(&self.machine.memory);
        let encoded = text::encode_word(&bytes, self.machine.version(), &alphabets);
        for (n, &b) in encoded.iter().enumerate() {
            self.machine.memory.write_byte(dest + n, b)?;
        }
        Ok(ExecutionResult::Continue)
    }

    // ---- tables ----

    fn do_scan_table(
        &mut self,
        inst: &Instruction,
        ops: &[u16],
    ) -> Result<ExecutionResult, Fault> {
        let target = ops[0];
        let table = ops[1] as usize;
        let len = ops[2] as usize;
        let form = ops.get(3).copied().unwrap_or(0x82);
        let words = form & 0x80 != 0;
        let field = (form & 0x7F) as usize;
        if field == 0 {
            return Err(Fault::BadInstruction {
                pc: inst.addr,
                reason: "scan_table with zero field length".to_string(),
            });
        }

        for n in 0..len {
            let addr = table + n * field;
            let value = if words {
                self.machine.memory.read_word(addr)?
            } else {
                self.machine.memory.read_byte(addr)? as u16
            };
            if value == target {
                self.store(inst, addr as u16)?;
                return self.do_branch(inst, true);
            }
        }
        self.store(inst, 0)?;
        self.do_branch(inst, false)
    }

    fn do_copy_table(&mut self, ops: &[u16]) -> Result<ExecutionResult, Fault> {
        let first = ops[0] as usize;
        let second = ops[1] as usize;
        let size = ops[2] as i16;

        if second == 0 {
            // Zero-fill the source region
            for n in 0..size.unsigned_abs() as usize {
                self.machine.memory.write_byte(first + n, 0)?;
            }
            return Ok(ExecutionResult::Continue);
        }

        if size < 0 {
            // Forced forward copy, overlap effects included
            for n in 0..size.unsigned_abs() as usize {
                let b = self.machine.memory.read_byte(first + n)?;
                self.machine.memory.write_byte(second + n, b)?;
            }
        } else {
            let len = size as usize;
            if second > first && second < first + len {
                // Overlapping tail: copy backwards to preserve the source
                for n in (0..len).rev() {
                    let b = self.machine.memory.read_byte(first + n)?;
                    self.machine.memory.write_byte(second + n, b)?;
                }
            } else {
                for n in 0..len {
                    let b = self.machine.memory.read_byte(first + n)?;
                    self.machine.memory.write_byte(second + n, b)?;
                }
            }
        }
        Ok(ExecutionResult::Continue)
    }

    fn do_print_table(&mut self, ops: &[u16]) -> Result<ExecutionResult, Fault> {
        let mut addr = ops[0] as usize;
        let width = ops[1] as usize;
        let height = ops.get(2).copied().unwrap_or(1) as usize;
        let skip = ops.get(3).copied().unwrap_or(0) as usize;

        for row in 0..height {
            if row > 0 {
                self.output("\n")?;
            }
            for col in 0..width {
                let code = self.machine.memory.read_byte(addr + col)? as u16;
                if let Some(c) = text::zscii_to_char(code) {
                    self.output(&c.to_string())?;
                }
            }
            addr += width + skip;
        }
        Ok(ExecutionResult::Continue)
    }

    // ---- streams ----

    fn do_output_stream(&mut self, ops: &[u16]) -> Result<ExecutionResult, Fault> {
        let selector = ops[0] as i16;
        match selector {
            0 => {}
            1 => self.screen_enabled = true,
            -1 => self.screen_enabled = false,
            2 => {
                if self.transcript.is_none() {
                    match self.files.open(&self.options.transcript_name, FileMode::Write) {
                        Ok(handle) => self.transcript = Some(handle),
                        Err(e) => warn!("cannot open transcript: {}", e),
                    }
                }
            }
            -2 => {
                if let Some(handle) = self.transcript.take() {
                    let _ = self.files.flush(handle);
                    let _ = self.files.close(handle);
                }
            }
            3 => {
                if self.stream3.len() >= STREAM3_DEPTH {
                    warn!("output stream 3 nesting exceeded; selection ignored");
                } else {
                    let table = ops.get(1).copied().unwrap_or(0) as usize;
                    self.machine.memory.write_word(table, 0)?;
                    self.stream3.push(table);
                }
            }
            -3 => {
                if self.stream3.pop().is_none() {
                    warn!("output stream 3 deselected while inactive");
                }
            }
            4 => {
                if self.command_log.is_none() {
                    match self.files.open(&self.options.command_name, FileMode::Write) {
                        Ok(handle) => self.command_log = Some(handle),
                        Err(e) => warn!("cannot open command log: {}", e),
                    }
                }
            }
            -4 => {
                if let Some(handle) = self.command_log.take() {
                    let _ = self.files.flush(handle);
                    let _ = self.files.close(handle);
                }
            }
            _ => warn!("unknown output stream {}", selector),
        }
        Ok(ExecutionResult::Continue)
    }

    fn do_input_stream(&mut self, ops: &[u16]) -> Result<ExecutionResult, Fault> {
        match ops[0] {
            0 => self.close_replay(),
            1 => match self.files.open(&self.options.command_name, FileMode::Read) {
                Ok(handle) => self.input_replay = Some(handle),
                Err(e) => warn!("cannot open command replay: {}", e),
            },
            n => warn!("unknown input stream {}", n),
        }
        Ok(ExecutionResult::Continue)
    }

    // ---- persistence ----

    /// Address of the triggering instruction's store or branch byte, the
    /// point a restore resumes at.
    fn resume_addr(&self, inst: &Instruction) -> u32 {
        let post = match &inst.branch {
            Some(branch) => branch.bytes as usize,
            None => 1,
        };
        inst.addr + (inst.size - post) as u32
    }

    fn do_save(&mut self, inst: &Instruction) -> Result<ExecutionResult, Fault> {
        let resume_pc = self.resume_addr(inst);
        let saved = match self.files.open(&self.options.save_name, FileMode::Write) {
            Ok(handle) => {
                let result = save::write_save(&self.machine, resume_pc, self.files.as_mut(), handle);
                let _ = self.files.close(handle);
                match result {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("save failed: {}", e);
                        false
                    }
                }
            }
            Err(e) => {
                warn!("cannot open save file: {}", e);
                false
            }
        };
        // Failure reports through the normal result path, never a fault
        if inst.branch.is_some() {
            self.do_branch(inst, saved)
        } else {
            self.store(inst, saved as u16)?;
            Ok(ExecutionResult::Continue)
        }
    }

    fn do_restore(&mut self, inst: &Instruction) -> Result<ExecutionResult, Fault> {
        let restored = match self.files.open(&self.options.save_name, FileMode::Read) {
            Ok(handle) => {
                let result = save::read_save(&mut self.machine, self.files.as_mut(), handle);
                let _ = self.files.close(handle);
                match result {
                    Ok(_) => true,
                    Err(e) => {
                        warn!("restore failed: {}", e);
                        false
                    }
                }
            }
            Err(e) => {
                warn!("cannot open save file: {}", e);
                false
            }
        };
        if !restored {
            return if inst.branch.is_some() {
                self.do_branch(inst, false)
            } else {
                self.store(inst, 0)?;
                Ok(ExecutionResult::Continue)
            };
        }
        // The machine now sits on the original save instruction's store or
        // branch byte; replay it with the "just restored" result
        self.replay_save_result()
    }

    fn replay_save_result(&mut self) -> Result<ExecutionResult, Fault> {
        if self.machine.version() <= 3 {
            let pc = self.machine.pc as usize;
            let b1 = self.machine.memory.read_byte(pc)?;
            let on_true = b1 & 0x80 != 0;
            let (offset, after) = if b1 & 0x40 != 0 {
                ((b1 & 0x3F) as i16, pc + 1)
            } else {
                let b2 = self.machine.memory.read_byte(pc + 1)?;
                let mut raw = (((b1 & 0x3F) as i16) << 8) | b2 as i16;
                if raw & 0x2000 != 0 {
                    raw -= 0x4000;
                }
                (raw, pc + 2)
            };
            self.machine.pc = after as u32;
            if on_true {
                self.apply_branch_offset(offset)
            } else {
                Ok(ExecutionResult::Continue)
            }
        } else {
            let pc = self.machine.pc as usize;
            let store_var = self.machine.memory.read_byte(pc)?;
            self.machine.pc = (pc + 1) as u32;
            self.machine.write_variable(store_var, 2)?;
            Ok(ExecutionResult::Branched)
        }
    }
}
