//! Runtime configuration options

use crate::vm::DEFAULT_MAX_CALL_DEPTH;

/// Configuration options for the Blaze runtime
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// Log module summaries as they are loaded
    pub debug_mode: bool,
    /// Trace the operand stack before every instruction
    pub stack_trace: bool,
    /// Frames allowed before a call throws a stack overflow
    pub max_call_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            debug_mode: false,
            stack_trace: false,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
        }
    }
}

impl RuntimeConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable debug mode
    pub fn with_debug_mode(mut self, debug_mode: bool) -> Self {
        self.debug_mode = debug_mode;
        self
    }

    /// Enable or disable stack trace
    pub fn with_stack_trace(mut self, stack_trace: bool) -> Self {
        self.stack_trace = stack_trace;
        self
    }

    /// Set the maximum call depth
    pub fn with_max_call_depth(mut self, depth: usize) -> Self {
        self.max_call_depth = depth;
        self
    }
}
