mod builtins;
mod config;
mod executor;
mod host;

pub use builtins::install_builtins;
pub use config::RuntimeConfig;
pub use executor::{Executor, VmId};
pub use host::Runtime;

use std::io;
use thiserror::Error;

/// Errors that can occur in the runtime
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("VM error: {0}")]
    VMError(#[from] crate::vm::VMError),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Bytecode parsing error: {0}")]
    ParsingError(#[from] crate::bytecode::ParseError),

    #[error("Module '{module}' has no public variable '{name}'")]
    MissingExport { module: String, name: String },

    #[error("Runtime configuration error: {0}")]
    ConfigError(String),
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;
