//! Instruction decoding
//!
//! An opcode byte's top two bits classify its form, which fixes how operand
//! types are encoded; store and branch post-bytes follow the operands
//! according to the opcode tables. Decoding produces an `Instruction` value
//! the engine dispatches on; nothing here mutates machine state.

use crate::fault::Fault;
use crate::memory::MemoryImage;
use crate::text;
use std::fmt;

/// Operand types, two bits each in type bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandType {
    LargeConstant,
    SmallConstant,
    Variable,
    Omitted,
}

impl OperandType {
    pub fn from_bits(bits: u8) -> OperandType {
        match bits & 0x03 {
            0b00 => OperandType::LargeConstant,
            0b01 => OperandType::SmallConstant,
            0b10 => OperandType::Variable,
            _ => OperandType::Omitted,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstructionForm {
    Long,
    Short,
    Variable,
    Extended,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandCount {
    OP0,
    OP1,
    OP2,
    VAR,
}

/// Branch post-byte(s): sense, signed offset, encoded length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BranchInfo {
    pub on_true: bool,
    /// 0 and 1 mean return false/true from the current routine
    pub offset: i16,
    pub bytes: u8,
}

/// A decoded instruction.
#[derive(Debug, Clone)]
pub struct Instruction {
    /// Address of the opcode byte
    pub addr: u32,
    /// Opcode number within its operand-count class
    pub opcode: u8,
    /// Extended-set opcode, when form is Extended
    pub ext_opcode: Option<u8>,
    pub form: InstructionForm,
    pub operand_count: OperandCount,
    pub operand_types: Vec<OperandType>,
    /// Raw operand values; Variable operands still name the variable
    pub operands: Vec<u16>,
    pub store_var: Option<u8>,
    pub branch: Option<BranchInfo>,
    /// Inline string for print/print_ret
    pub text: Option<String>,
    /// Total encoded size in bytes
    pub size: usize,
}

impl Instruction {
    /// Decode the instruction at `addr`.
    pub fn decode(mem: &MemoryImage, addr: u32) -> Result<Instruction, Fault> {
        let version = mem.version();
        let mut cursor = addr as usize;
        let opcode_byte = mem.read_byte(cursor)?;
        cursor += 1;

        let (form, operand_count, opcode, ext_opcode) = if opcode_byte == 0xBE && version >= 5 {
            let ext = mem.read_byte(cursor)?;
            cursor += 1;
            (InstructionForm::Extended, OperandCount::VAR, 0xBE, Some(ext))
        } else {
            match opcode_byte >> 6 {
                0b11 => {
                    let count = if opcode_byte & 0x20 != 0 {
                        OperandCount::VAR
                    } else {
                        OperandCount::OP2
                    };
                    (InstructionForm::Variable, count, opcode_byte & 0x1F, None)
                }
                0b10 => {
                    let count = if opcode_byte & 0x30 == 0x30 {
                        OperandCount::OP0
                    } else {
                        OperandCount::OP1
                    };
                    (InstructionForm::Short, count, opcode_byte & 0x0F, None)
                }
                _ => (InstructionForm::Long, OperandCount::OP2, opcode_byte & 0x1F, None),
            }
        };

        // Operand types
        let mut operand_types = Vec::new();
        match form {
            InstructionForm::Long => {
                for bit in [0x40, 0x20] {
                    operand_types.push(if opcode_byte & bit != 0 {
                        OperandType::Variable
                    } else {
                        OperandType::SmallConstant
                    });
                }
            }
            InstructionForm::Short => {
                if operand_count == OperandCount::OP1 {
                    operand_types.push(OperandType::from_bits(opcode_byte >> 4));
                }
            }
            InstructionForm::Variable | InstructionForm::Extended => {
                // call_vs2/call_vn2 carry two type bytes for up to 8
                // operands
                let double = form == InstructionForm::Variable
                    && operand_count == OperandCount::VAR
                    && matches!(opcode, 0x0C | 0x1A);
                let type_bytes = if double { 2 } else { 1 };
                for _ in 0..type_bytes {
                    let types = mem.read_byte(cursor)?;
                    cursor += 1;
                    for shift in [6, 4, 2, 0] {
                        operand_types.push(OperandType::from_bits(types >> shift));
                    }
                }
            }
        }
        // Types end at the first Omitted
        if let Some(stop) = operand_types
            .iter()
            .position(|&t| t == OperandType::Omitted)
        {
            operand_types.truncate(stop);
        }

        // Operand values
        let mut operands = Vec::with_capacity(operand_types.len());
        for &t in &operand_types {
            match t {
                OperandType::LargeConstant => {
                    operands.push(mem.read_word(cursor)?);
                    cursor += 2;
                }
                OperandType::SmallConstant | OperandType::Variable => {
                    operands.push(mem.read_byte(cursor)? as u16);
                    cursor += 1;
                }
                OperandType::Omitted => {}
            }
        }

        // Inline string for print/print_ret
        let mut inline_text = None;
        if operand_count == OperandCount::OP0 && matches!(opcode, 0x02 | 0x03) {
            let (s, consumed) = text::decode_string(mem, cursor)?;
            inline_text = Some(s);
            cursor += consumed;
        }

        // Store byte
        let stores = match form {
            InstructionForm::Extended => ext_stores(ext_opcode.unwrap_or(0)),
            _ => opcode_stores(operand_count, opcode, version),
        };
        let store_var = if stores {
            let var = mem.read_byte(cursor)?;
            cursor += 1;
            Some(var)
        } else {
            None
        };

        // Branch byte(s)
        let branches = match form {
            InstructionForm::Extended => false,
            _ => opcode_branches(operand_count, opcode, version),
        };
        let branch = if branches {
            let b1 = mem.read_byte(cursor)?;
            cursor += 1;
            let on_true = b1 & 0x80 != 0;
            let (offset, bytes) = if b1 & 0x40 != 0 {
                ((b1 & 0x3F) as i16, 1)
            } else {
                let b2 = mem.read_byte(cursor)?;
                cursor += 1;
                let mut raw = (((b1 & 0x3F) as i16) << 8) | b2 as i16;
                if raw & 0x2000 != 0 {
                    raw -= 0x4000;
                }
                (raw, 2)
            };
            Some(BranchInfo {
                on_true,
                offset,
                bytes,
            })
        } else {
            None
        };

        Ok(Instruction {
            addr,
            opcode,
            ext_opcode,
            form,
            operand_count,
            operand_types,
            operands,
            store_var,
            branch,
            text: inline_text,
            size: cursor - addr as usize,
        })
    }

    /// The canonical combined opcode byte: long forms fold into their
    /// variable-form encoding, short and variable bytes stand as they are.
    pub fn canonical(&self) -> u8 {
        match self.form {
            InstructionForm::Long => 0xC0 | self.opcode,
            InstructionForm::Extended => 0xBE,
            _ => match self.operand_count {
                OperandCount::OP0 => 0xB0 | self.opcode,
                OperandCount::OP1 => 0x80 | self.opcode,
                OperandCount::OP2 => 0xC0 | self.opcode,
                OperandCount::VAR => 0xE0 | self.opcode,
            },
        }
    }
}

/// Does this opcode store a result?
fn opcode_stores(count: OperandCount, opcode: u8, version: u8) -> bool {
    match count {
        OperandCount::OP0 => match opcode {
            // save/restore became store-form in v4 before moving to EXT
            0x05 | 0x06 => version == 4,
            // catch
            0x09 => version >= 5,
            _ => false,
        },
        OperandCount::OP1 => match opcode {
            0x01 | 0x02 | 0x03 | 0x04 | 0x08 | 0x0E => true,
            // not in v1-4; call_1n from v5
            0x0F => version <= 4,
            _ => false,
        },
        OperandCount::OP2 => matches!(opcode, 0x08 | 0x09 | 0x0F..=0x19),
        OperandCount::VAR => match opcode {
            0x00 | 0x07 | 0x0C => true,
            // aread stores the terminator from v5
            0x04 => version >= 5,
            0x16 | 0x17 => true,
            // not moved into VAR in v5
            0x18 => version >= 5,
            _ => false,
        },
    }
}

/// Does this extended-set opcode store a result?
fn ext_stores(ext: u8) -> bool {
    matches!(ext, 0x00..=0x04 | 0x09 | 0x0A | 0x0C | 0x1D)
}

/// Does this opcode carry a branch?
fn opcode_branches(count: OperandCount, opcode: u8, version: u8) -> bool {
    match count {
        OperandCount::OP0 => match opcode {
            0x05 | 0x06 => version <= 3,
            0x0D | 0x0F => true,
            _ => false,
        },
        OperandCount::OP1 => matches!(opcode, 0x00..=0x02),
        OperandCount::OP2 => matches!(opcode, 0x01..=0x07 | 0x0A),
        OperandCount::VAR => matches!(opcode, 0x17),
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:05x}: {:?}/{:02x} {:?}",
            self.addr, self.operand_count, self.opcode, self.operands
        )?;
        if let Some(var) = self.store_var {
            write!(f, " -> var {}", var)?;
        }
        if let Some(branch) = &self.branch {
            write!(
                f,
                " ?{}{}",
                if branch.on_true { "" } else { "~" },
                branch.offset
            )?;
        }
        Ok(())
    }
}
