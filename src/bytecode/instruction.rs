use std::fmt;
use crate::bytecode::OpCode;

/// Represents a single decoded bytecode instruction
///
/// The argument is always the full 32-bit value; `EXTENDED_ARG` prefixes only
/// exist in the binary encoding and are folded in by the parser.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub opcode: OpCode,
    pub arg: u32,
    pub line: u32,
}

impl Instruction {
    pub fn new(opcode: OpCode) -> Self {
        Self {
            opcode,
            arg: 0,
            line: 0,
        }
    }

    pub fn with_arg(mut self, arg: u32) -> Self {
        self.arg = arg;
        self
    }

    pub fn with_line(mut self, line: u32) -> Self {
        self.line = line;
        self
    }

    /// Split a local-slot operand into `(uplevel, slot)`
    pub fn local_operand(&self) -> (u32, usize) {
        (self.arg >> 8, (self.arg & 0xFF) as usize)
    }

    /// Build a local-slot operand from `uplevel` and `slot`
    pub fn encode_local(uplevel: u32, slot: u8) -> u32 {
        (uplevel << 8) | slot as u32
    }

    /// Number of `EXTENDED_ARG` prefixes needed to encode this argument
    pub fn extended_prefixes(&self) -> usize {
        match self.arg {
            0..=0xFF => 0,
            0x100..=0xFFFF => 1,
            0x1_0000..=0xFF_FFFF => 2,
            _ => 3,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.opcode.mnemonic(), self.arg)
    }
}
