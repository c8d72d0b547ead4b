use std::fmt;
use thiserror::Error;
use crate::vm::{ModuleId, Value};

/// Fatal error type for VM operations
///
/// These indicate malformed bytecode or a broken host contract and are never
/// routed through script-level exception handlers.
#[derive(Error, Debug)]
pub enum VMError {
    #[error("Stack underflow")]
    StackUnderflow,

    #[error("Invalid program counter: {0}")]
    InvalidProgramCounter(usize),

    #[error("Invalid constant index: {0}")]
    InvalidConstantIndex(u32),

    #[error("Invalid variable index: {0}")]
    InvalidVariableIndex(u32),

    #[error("Invalid function index: {0}")]
    InvalidFunctionIndex(u32),

    #[error("Invalid class index: {0}")]
    InvalidClassIndex(u32),

    #[error("Invalid local variable index: {0}")]
    InvalidLocalIndex(u32),

    #[error("Invalid environment: {0}")]
    InvalidEnvironment(String),

    #[error("No active call frame")]
    MissingCallFrame,

    #[error("Unknown module: {0}")]
    UnknownModule(ModuleId),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("{0}")]
    Uncaught(ScriptException),
}

/// Script-level runtime errors
///
/// Raised as ordinary thrown string values, so script code can catch them.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScriptError {
    #[error("Undefined variable '{0}'")]
    UndefinedVariable(String),

    #[error("{name} expects {expected} argument(s), got {got}")]
    ArityMismatch { name: String, expected: usize, got: usize },

    #[error("Unsupported operand types for {op}: {left} and {right}")]
    UnsupportedOperands { op: &'static str, left: &'static str, right: &'static str },

    #[error("Value of type {0} is not callable")]
    NotCallable(&'static str),

    #[error("Value of type {0} is not constructible")]
    NotConstructible(&'static str),

    #[error("Value of type {0} is not iterable")]
    NotIterable(&'static str),

    #[error("Value of type {0} is not indexable")]
    NotIndexable(&'static str),

    #[error("Cannot attach a callback to value of type {0}")]
    NotAttachable(&'static str),

    #[error("Index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: i64, len: usize },

    #[error("Cannot index {target} with a value of type {index}")]
    IndexKind { target: &'static str, index: &'static str },

    #[error("Key {0} not found")]
    KeyNotFound(String),

    #[error("Property '{name}' not found on {kind}")]
    PropertyNotFound { kind: &'static str, name: String },

    #[error("Property '{name}' of {kind} is read-only")]
    ReadOnlyProperty { kind: &'static str, name: String },

    #[error("'this' used outside of a class")]
    NoInstance,

    #[error("Iterator exhausted")]
    IteratorExhausted,

    #[error("Maximum call depth of {0} exceeded")]
    StackOverflow(usize),

    #[error("Repeated string would exceed {0} bytes")]
    RepeatTooLarge(usize),

    #[error("{0}")]
    Host(String),
}

/// An exception that escaped every handler of a VM
#[derive(Debug, Clone)]
pub struct ScriptException {
    pub module: String,
    pub line: u32,
    pub value: Value,
}

impl fmt::Display for ScriptException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Uncaught exception in {} at line {}: {}", self.module, self.line, self.value)
    }
}

/// Outcome of a failed instruction: either a catchable throw or a fatal error
#[derive(Debug)]
pub enum Fault {
    Throw(Value),
    Fatal(VMError),
}

impl From<VMError> for Fault {
    fn from(err: VMError) -> Self {
        Fault::Fatal(err)
    }
}

impl From<ScriptError> for Fault {
    fn from(err: ScriptError) -> Self {
        Fault::Throw(Value::from(err.to_string()))
    }
}

/// Result type for VM operations
pub type VMResult<T> = Result<T, VMError>;
