//! Fatal and recoverable execution faults
//!
//! Every component reports failure through `Fault`. Fatal variants abort the
//! run loop; the interpreter logs them with PC context before propagating.
//! Arithmetic faults and save/restore I/O failures are deliberately *not*
//! represented here: those are handled in place (warn + zero result, or a
//! failed branch/store) per the historical interpreter behaviour.

use std::fmt;

/// A distinguished fault raised by the instruction-execute step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Bad or truncated story file
    Load(String),
    /// Story version outside {1..5, 7, 8, 9, 10}
    UnsupportedVersion(u8),
    /// Read or write outside the memory image
    AddressOutOfRange { addr: usize },
    /// Write at or above the static-memory boundary
    StaticWrite { addr: usize },
    /// Operand stack exceeded its 1024-word bound
    StackOverflow,
    /// Call stack exceeded its 256-frame bound
    FrameOverflow,
    /// Pop from an empty operand stack
    StackUnderflow,
    /// Return or local access with no routine active
    NoActiveFrame,
    /// Opcode byte not in the dispatch table for this version
    UnknownOpcode { opcode: u8, pc: u32 },
    /// Structurally invalid instruction encoding
    BadInstruction { pc: u32, reason: String },
    /// File service failure outside the recoverable save/restore path
    Io(String),
    /// Host-requested cancellation surfaced through a collaborator
    Cancelled,
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Load(msg) => write!(f, "Load error: {}", msg),
            Fault::UnsupportedVersion(v) => write!(f, "Unsupported story version {}", v),
            Fault::AddressOutOfRange { addr } => {
                write!(f, "Address {:#06x} outside memory image", addr)
            }
            Fault::StaticWrite { addr } => {
                write!(f, "Write to read-only memory at {:#06x}", addr)
            }
            Fault::StackOverflow => write!(f, "Operand stack overflow"),
            Fault::FrameOverflow => write!(f, "Call stack overflow"),
            Fault::StackUnderflow => write!(f, "Operand stack underflow"),
            Fault::NoActiveFrame => write!(f, "No active routine frame"),
            Fault::UnknownOpcode { opcode, pc } => {
                write!(f, "Unknown opcode {:#04x} at PC {:05x}", opcode, pc)
            }
            Fault::BadInstruction { pc, reason } => {
                write!(f, "Bad instruction at PC {:05x}: {}", pc, reason)
            }
            Fault::Io(msg) => write!(f, "I/O error: {}", msg),
            Fault::Cancelled => write!(f, "Execution cancelled by host"),
        }
    }
}

impl std::error::Error for Fault {}

impl From<std::io::Error> for Fault {
    fn from(error: std::io::Error) -> Self {
        Fault::Io(error.to_string())
    }
}
