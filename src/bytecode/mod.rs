mod instruction;
mod opcode;
mod parser;
mod writer;

pub use instruction::Instruction;
pub use opcode::OpCode;
pub use parser::{Parser, ParseError, read_module};
pub use writer::{Writer, write_module};

/// Magic word at the start of every module file: `b"blzm"` read little-endian
pub const MAGIC: u32 = u32::from_le_bytes(*b"blzm");

/// Current module format version
pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 0;

/// Represents a constant value in the bytecode
#[derive(Debug, Clone, PartialEq)]
pub enum Constant {
    Number(f64),
    String(String),
}

impl Constant {
    /// Pool identity: numbers compare by bit pattern, strings by content
    fn same_as(&self, other: &Constant) -> bool {
        match (self, other) {
            (Constant::Number(a), Constant::Number(b)) => a.to_bits() == b.to_bits(),
            (Constant::String(a), Constant::String(b)) => a == b,
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Constant::String(s) => Some(s),
            Constant::Number(_) => None,
        }
    }
}

/// Module-level variable visibility
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Visibility {
    /// Visible only to the declaring module
    Private = 0,
    /// Visible to the declaring module and resolvable from linked modules
    Public = 1,
    /// A proxy for a public variable declared by another module in the tree
    External = 2,
}

impl Visibility {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Visibility::Private),
            1 => Some(Visibility::Public),
            2 => Some(Visibility::External),
            _ => None,
        }
    }
}

/// A module-level variable declaration
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    /// Index of the name constant, `None` for anonymous slots
    pub name: Option<u32>,
    pub visibility: Visibility,
}

/// A compiled function body
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub name: Option<u32>,
    pub arg_count: u16,
    pub is_vararg: bool,
    pub local_count: u16,
    pub instructions: Vec<Instruction>,
}

impl Function {
    pub fn new(name: Option<u32>, arg_count: u16, is_vararg: bool, local_count: u16) -> Self {
        Self {
            name,
            arg_count,
            is_vararg,
            local_count,
            instructions: Vec::new(),
        }
    }

    /// Append an instruction and return its offset
    pub fn emit(&mut self, opcode: OpCode, arg: u32, line: u32) -> usize {
        self.instructions.push(Instruction { opcode, arg, line });
        self.instructions.len() - 1
    }

    /// Rewrite the argument of an already emitted instruction (jump back-patching)
    pub fn patch(&mut self, offset: usize, arg: u32) {
        if let Some(instruction) = self.instructions.get_mut(offset) {
            instruction.arg = arg;
        }
    }

    /// Offset the next emitted instruction will receive
    pub fn next_offset(&self) -> usize {
        self.instructions.len()
    }
}

/// A compiled class blueprint
#[derive(Debug, Clone, PartialEq)]
pub struct Class {
    pub name: Option<u32>,
    /// Member name constants, in declaration order and without duplicates
    pub members: Vec<u32>,
    /// Index of the constructor function in the owning module
    pub constructor: u32,
}

impl Class {
    pub fn new(name: Option<u32>, constructor: u32) -> Self {
        Self {
            name,
            members: Vec::new(),
            constructor,
        }
    }

    pub fn add_member(&mut self, name: u32) {
        if !self.members.contains(&name) {
            self.members.push(name);
        }
    }
}

/// Represents a bytecode module
///
/// Function 0 is the static initializer; it is the only function run when the
/// module is loaded and it binds every top-level declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct Module {
    pub name: String,
    pub debug: bool,
    pub version: (u8, u8),
    pub constants: Vec<Constant>,
    pub variables: Vec<Variable>,
    pub functions: Vec<Function>,
    pub classes: Vec<Class>,
}

impl Module {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            debug: false,
            version: (VERSION_MAJOR, VERSION_MINOR),
            constants: Vec::new(),
            variables: Vec::new(),
            functions: Vec::new(),
            classes: Vec::new(),
        }
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Add a constant to the pool, returning the index of an equal entry if one exists
    pub fn add_constant(&mut self, constant: Constant) -> u32 {
        if let Some(index) = self.constants.iter().position(|c| c.same_as(&constant)) {
            return index as u32;
        }
        self.constants.push(constant);
        (self.constants.len() - 1) as u32
    }

    pub fn add_string(&mut self, value: &str) -> u32 {
        self.add_constant(Constant::String(value.to_string()))
    }

    pub fn add_number(&mut self, value: f64) -> u32 {
        self.add_constant(Constant::Number(value))
    }

    pub fn add_variable(&mut self, name: Option<&str>, visibility: Visibility) -> u32 {
        let name = name.map(|n| self.add_string(n));
        self.variables.push(Variable { name, visibility });
        (self.variables.len() - 1) as u32
    }

    pub fn add_function(&mut self, function: Function) -> u32 {
        self.functions.push(function);
        (self.functions.len() - 1) as u32
    }

    pub fn add_class(&mut self, class: Class) -> u32 {
        self.classes.push(class);
        (self.classes.len() - 1) as u32
    }

    /// The string stored at a constant index, if it is a string
    pub fn constant_str(&self, index: u32) -> Option<&str> {
        self.constants.get(index as usize).and_then(Constant::as_str)
    }

    pub fn variable_name(&self, index: u32) -> Option<&str> {
        self.variables
            .get(index as usize)
            .and_then(|v| v.name)
            .and_then(|n| self.constant_str(n))
    }

    pub fn function_name(&self, index: u32) -> Option<&str> {
        self.functions
            .get(index as usize)
            .and_then(|f| f.name)
            .and_then(|n| self.constant_str(n))
    }

    pub fn class_name(&self, index: u32) -> Option<&str> {
        self.classes
            .get(index as usize)
            .and_then(|c| c.name)
            .and_then(|n| self.constant_str(n))
    }

    pub fn static_initializer(&self) -> Option<&Function> {
        self.functions.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants_are_deduplicated() {
        let mut module = Module::new("dedup");

        let a = module.add_string("hello");
        let b = module.add_number(3.5);
        let c = module.add_string("hello");
        let d = module.add_number(3.5);

        assert_eq!(a, c);
        assert_eq!(b, d);
        assert_eq!(module.constants.len(), 2);
    }

    #[test]
    fn test_signed_zero_constants_stay_distinct() {
        let mut module = Module::new("zeros");
        let pos = module.add_number(0.0);
        let neg = module.add_number(-0.0);
        assert_ne!(pos, neg);
    }

    #[test]
    fn test_string_and_number_do_not_collide() {
        let mut module = Module::new("mixed");
        let s = module.add_string("1");
        let n = module.add_number(1.0);
        assert_ne!(s, n);
    }

    #[test]
    fn test_variables_intern_their_names() {
        let mut module = Module::new("vars");
        let name = module.add_string("x");
        let var = module.add_variable(Some("x"), Visibility::Public);
        let anon = module.add_variable(None, Visibility::Private);

        assert_eq!(module.variables[var as usize].name, Some(name));
        assert_eq!(module.variable_name(var), Some("x"));
        assert_eq!(module.variable_name(anon), None);
        assert_eq!(module.constants.len(), 1);
    }

    #[test]
    fn test_emit_and_patch() {
        let mut function = Function::new(None, 0, false, 0);
        let jump = function.emit(OpCode::Jmp, 0, 1);
        function.emit(OpCode::LdNull, 0, 2);
        let target = function.next_offset();
        function.patch(jump, (target - jump - 1) as u32);
        function.emit(OpCode::Ret, 0, 3);

        assert_eq!(function.instructions[jump].arg, 1);
        assert_eq!(function.instructions.len(), 3);
    }

    #[test]
    fn test_class_members_are_an_ordered_set() {
        let mut module = Module::new("classes");
        let x = module.add_string("x");
        let y = module.add_string("y");
        let mut class = Class::new(None, 1);
        class.add_member(y);
        class.add_member(x);
        class.add_member(y);
        assert_eq!(class.members, vec![y, x]);
    }

    #[test]
    fn test_magic_spells_blzm() {
        assert_eq!(MAGIC.to_le_bytes(), *b"blzm");
    }

    #[test]
    fn test_visibility_bytes() {
        assert_eq!(Visibility::from_byte(0), Some(Visibility::Private));
        assert_eq!(Visibility::from_byte(1), Some(Visibility::Public));
        assert_eq!(Visibility::from_byte(2), Some(Visibility::External));
        assert_eq!(Visibility::from_byte(3), None);
    }
}
