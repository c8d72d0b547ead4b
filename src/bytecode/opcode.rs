/// Opcodes for the VM

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpCode {
    // Control operations
    Nop = 0x00,         // No operation
    ExtendedArg = 0x01, // High-order argument byte for the next opcode (encoding only)

    // Stack manipulation
    Pop = 0x02,         // Pop top value from stack
    Dup = 0x03,         // Duplicate top value

    // Loads and stores
    LdNull = 0x10,      // Push null
    LdTrue = 0x11,      // Push true
    LdFalse = 0x12,     // Push false
    LdConst = 0x13,     // Push constant (1 operand)
    LdVar = 0x14,       // Load module-level variable (1 operand)
    StVar = 0x15,       // Store module-level variable (1 operand)
    LdLocal = 0x16,     // Load local, operand = (uplevel << 8) | slot
    StLocal = 0x17,     // Store local, operand = (uplevel << 8) | slot
    LdArg = 0x18,       // Load frame argument (1 operand)
    StArg = 0x19,       // Store frame argument (1 operand)
    LdFunc = 0x1A,      // Push closure over the active environment (1 operand)
    LdClass = 0x1B,     // Push class closure over the active environment (1 operand)
    LdThis = 0x1C,      // Push the enclosing class instance
    LdMember = 0x1D,    // Load a named member, falling back outward (1 operand)
    StMember = 0x1E,    // Store a named member, falling back outward (1 operand)

    // Arithmetic, comparison and logic
    Add = 0x20,
    Sub = 0x21,
    Mul = 0x22,
    Div = 0x23,
    Lt = 0x24,
    Lte = 0x25,
    Eq = 0x26,
    And = 0x27,
    Or = 0x28,
    Not = 0x29,

    // Control flow
    Jmp = 0x30,         // Relative forward jump
    Jmpb = 0x31,        // Relative backward jump
    Jmpa = 0x32,        // Absolute jump
    Jmpt = 0x33,        // Pop, jump forward if truthy
    Jmpf = 0x34,        // Pop, jump forward if falsy
    Call = 0x40,        // Call with N arguments
    Ret = 0x41,         // Return from the active frame
    New = 0x42,         // Construct with N arguments

    // Exception handling
    Throw = 0x48,       // Throw the top value
    Catch = 0x49,       // Register a handler (1 operand, relative)
    TryEnd = 0x4A,      // Drop the innermost handler

    // Aggregates, indexing and properties
    LdList = 0x50,      // Build a list from N values
    LdObj = 0x51,       // Build a dictionary from N key/value pairs
    LdIndex = 0x52,
    StIndex = 0x53,
    LdProp = 0x54,      // Load property (1 operand, name constant)
    StProp = 0x55,      // Store property (1 operand, name constant)
    Iter = 0x56,        // Replace an iterable with its iterator

    // Events
    LdEvent = 0x60,     // Push a new event
    Attach = 0x61,      // Attach a callable to an event
}

const NOP: u8 = OpCode::Nop as u8;
const EXTENDED_ARG: u8 = OpCode::ExtendedArg as u8;

const POP: u8 = OpCode::Pop as u8;
const DUP: u8 = OpCode::Dup as u8;

const LD_NULL: u8 = OpCode::LdNull as u8;
const LD_TRUE: u8 = OpCode::LdTrue as u8;
const LD_FALSE: u8 = OpCode::LdFalse as u8;
const LD_CONST: u8 = OpCode::LdConst as u8;
const LD_VAR: u8 = OpCode::LdVar as u8;
const ST_VAR: u8 = OpCode::StVar as u8;
const LD_LOCAL: u8 = OpCode::LdLocal as u8;
const ST_LOCAL: u8 = OpCode::StLocal as u8;
const LD_ARG: u8 = OpCode::LdArg as u8;
const ST_ARG: u8 = OpCode::StArg as u8;
const LD_FUNC: u8 = OpCode::LdFunc as u8;
const LD_CLASS: u8 = OpCode::LdClass as u8;
const LD_THIS: u8 = OpCode::LdThis as u8;
const LD_MEMBER: u8 = OpCode::LdMember as u8;
const ST_MEMBER: u8 = OpCode::StMember as u8;

const ADD: u8 = OpCode::Add as u8;
const SUB: u8 = OpCode::Sub as u8;
const MUL: u8 = OpCode::Mul as u8;
const DIV: u8 = OpCode::Div as u8;
const LT: u8 = OpCode::Lt as u8;
const LTE: u8 = OpCode::Lte as u8;
const EQ: u8 = OpCode::Eq as u8;
const AND: u8 = OpCode::And as u8;
const OR: u8 = OpCode::Or as u8;
const NOT: u8 = OpCode::Not as u8;

const JMP: u8 = OpCode::Jmp as u8;
const JMPB: u8 = OpCode::Jmpb as u8;
const JMPA: u8 = OpCode::Jmpa as u8;
const JMPT: u8 = OpCode::Jmpt as u8;
const JMPF: u8 = OpCode::Jmpf as u8;
const CALL: u8 = OpCode::Call as u8;
const RET: u8 = OpCode::Ret as u8;
const NEW: u8 = OpCode::New as u8;

// Exception handling
const THROW: u8 = OpCode::Throw as u8;
const CATCH: u8 = OpCode::Catch as u8;
const TRY_END: u8 = OpCode::TryEnd as u8;

const LD_LIST: u8 = OpCode::LdList as u8;
const LD_OBJ: u8 = OpCode::LdObj as u8;
const LD_INDEX: u8 = OpCode::LdIndex as u8;
const ST_INDEX: u8 = OpCode::StIndex as u8;
const LD_PROP: u8 = OpCode::LdProp as u8;
const ST_PROP: u8 = OpCode::StProp as u8;
const ITER: u8 = OpCode::Iter as u8;

const LD_EVENT: u8 = OpCode::LdEvent as u8;
const ATTACH: u8 = OpCode::Attach as u8;

impl OpCode {
    /// Convert a byte to an opcode
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            NOP => Some(OpCode::Nop),
            EXTENDED_ARG => Some(OpCode::ExtendedArg),

            POP => Some(OpCode::Pop),
            DUP => Some(OpCode::Dup),

            LD_NULL => Some(OpCode::LdNull),
            LD_TRUE => Some(OpCode::LdTrue),
            LD_FALSE => Some(OpCode::LdFalse),
            LD_CONST => Some(OpCode::LdConst),
            LD_VAR => Some(OpCode::LdVar),
            ST_VAR => Some(OpCode::StVar),
            LD_LOCAL => Some(OpCode::LdLocal),
            ST_LOCAL => Some(OpCode::StLocal),
            LD_ARG => Some(OpCode::LdArg),
            ST_ARG => Some(OpCode::StArg),
            LD_FUNC => Some(OpCode::LdFunc),
            LD_CLASS => Some(OpCode::LdClass),
            LD_THIS => Some(OpCode::LdThis),
            LD_MEMBER => Some(OpCode::LdMember),
            ST_MEMBER => Some(OpCode::StMember),

            ADD => Some(OpCode::Add),
            SUB => Some(OpCode::Sub),
            MUL => Some(OpCode::Mul),
            DIV => Some(OpCode::Div),
            LT => Some(OpCode::Lt),
            LTE => Some(OpCode::Lte),
            EQ => Some(OpCode::Eq),
            AND => Some(OpCode::And),
            OR => Some(OpCode::Or),
            NOT => Some(OpCode::Not),

            JMP => Some(OpCode::Jmp),
            JMPB => Some(OpCode::Jmpb),
            JMPA => Some(OpCode::Jmpa),
            JMPT => Some(OpCode::Jmpt),
            JMPF => Some(OpCode::Jmpf),
            CALL => Some(OpCode::Call),
            RET => Some(OpCode::Ret),
            NEW => Some(OpCode::New),

            THROW => Some(OpCode::Throw),
            CATCH => Some(OpCode::Catch),
            TRY_END => Some(OpCode::TryEnd),

            LD_LIST => Some(OpCode::LdList),
            LD_OBJ => Some(OpCode::LdObj),
            LD_INDEX => Some(OpCode::LdIndex),
            ST_INDEX => Some(OpCode::StIndex),
            LD_PROP => Some(OpCode::LdProp),
            ST_PROP => Some(OpCode::StProp),
            ITER => Some(OpCode::Iter),

            LD_EVENT => Some(OpCode::LdEvent),
            ATTACH => Some(OpCode::Attach),

            _ => None,
        }
    }

    /// Convert an opcode to a byte
    pub fn to_byte(&self) -> u8 {
        *self as u8
    }

    /// Upper-case mnemonic used in traces and listings
    pub fn mnemonic(&self) -> &'static str {
        match self {
            OpCode::Nop => "NOP",
            OpCode::ExtendedArg => "EXTENDED_ARG",
            OpCode::Pop => "POP",
            OpCode::Dup => "DUP",
            OpCode::LdNull => "LDNULL",
            OpCode::LdTrue => "LDTRUE",
            OpCode::LdFalse => "LDFALSE",
            OpCode::LdConst => "LDCONST",
            OpCode::LdVar => "LDVAR",
            OpCode::StVar => "STVAR",
            OpCode::LdLocal => "LDLOCAL",
            OpCode::StLocal => "STLOCAL",
            OpCode::LdArg => "LDARG",
            OpCode::StArg => "STARG",
            OpCode::LdFunc => "LDFUNC",
            OpCode::LdClass => "LDCLASS",
            OpCode::LdThis => "LDTHIS",
            OpCode::LdMember => "LDMEMBER",
            OpCode::StMember => "STMEMBER",
            OpCode::Add => "ADD",
            OpCode::Sub => "SUB",
            OpCode::Mul => "MUL",
            OpCode::Div => "DIV",
            OpCode::Lt => "LT",
            OpCode::Lte => "LTE",
            OpCode::Eq => "EQ",
            OpCode::And => "AND",
            OpCode::Or => "OR",
            OpCode::Not => "NOT",
            OpCode::Jmp => "JMP",
            OpCode::Jmpb => "JMPB",
            OpCode::Jmpa => "JMPA",
            OpCode::Jmpt => "JMPT",
            OpCode::Jmpf => "JMPF",
            OpCode::Call => "CALL",
            OpCode::Ret => "RET",
            OpCode::New => "NEW",
            OpCode::Throw => "THROW",
            OpCode::Catch => "CATCH",
            OpCode::TryEnd => "TRY_END",
            OpCode::LdList => "LDLIST",
            OpCode::LdObj => "LDOBJ",
            OpCode::LdIndex => "LDINDEX",
            OpCode::StIndex => "STINDEX",
            OpCode::LdProp => "LDPROP",
            OpCode::StProp => "STPROP",
            OpCode::Iter => "ITER",
            OpCode::LdEvent => "LDEVENT",
            OpCode::Attach => "ATTACH",
        }
    }
}

impl From<OpCode> for u8 {
    fn from(opcode: OpCode) -> Self {
        opcode.to_byte()
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        OpCode::from_byte(byte).ok_or(byte)
    }
}
