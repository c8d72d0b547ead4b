// Blaze - A bytecode runtime for the Blaze scripting language

pub mod bytecode;
pub mod vm;
pub mod runtime;

pub use bytecode::{Instruction, Module, OpCode};
pub use vm::{Value, VM};
pub use runtime::{Executor, Runtime, RuntimeConfig};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
