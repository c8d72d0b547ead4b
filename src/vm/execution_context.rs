use std::rc::Rc;
use crate::bytecode::{Function, Instruction, Module};
use crate::vm::environment::Environment;
use crate::vm::{ModuleId, VMError, VMResult, Value};

/// A protected region opened by `CATCH`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionHandler {
    /// Program counter where the handler starts
    pub handler_pc: usize,
    /// Operand stack depth when the region was entered
    pub stack_depth: usize,
}

/// One call frame: the function being run and where it is in it
pub struct ExecutionContext {
    module_id: ModuleId,
    module: Rc<Module>,
    constants: Rc<[Value]>,
    function: u32,
    pc: usize,
    env: Environment,
    handlers: Vec<ExceptionHandler>,
    in_constructor: bool,
}

impl ExecutionContext {
    pub fn new(
        module_id: ModuleId,
        module: Rc<Module>,
        constants: Rc<[Value]>,
        function: u32,
        env: Environment,
    ) -> VMResult<Self> {
        if module.functions.get(function as usize).is_none() {
            return Err(VMError::InvalidFunctionIndex(function));
        }
        Ok(Self {
            module_id,
            module,
            constants,
            function,
            pc: 0,
            env,
            handlers: Vec::new(),
            in_constructor: false,
        })
    }

    pub fn with_constructor(mut self, in_constructor: bool) -> Self {
        self.in_constructor = in_constructor;
        self
    }

    pub fn module_id(&self) -> ModuleId {
        self.module_id
    }

    pub fn module(&self) -> &Rc<Module> {
        &self.module
    }

    pub fn module_name(&self) -> &str {
        &self.module.name
    }

    pub fn function_index(&self) -> u32 {
        self.function
    }

    pub fn function(&self) -> VMResult<&Function> {
        self.module
            .functions
            .get(self.function as usize)
            .ok_or(VMError::InvalidFunctionIndex(self.function))
    }

    pub fn env(&self) -> &Environment {
        &self.env
    }

    pub fn pc(&self) -> usize {
        self.pc
    }

    pub fn set_pc(&mut self, pc: usize) {
        self.pc = pc;
    }

    pub fn in_constructor(&self) -> bool {
        self.in_constructor
    }

    /// Fetch the instruction under the program counter and step past it
    pub fn fetch(&mut self) -> VMResult<Instruction> {
        let pc = self.pc;
        let instruction = *self
            .function()?
            .instructions
            .get(pc)
            .ok_or(VMError::InvalidProgramCounter(pc))?;
        self.pc += 1;
        Ok(instruction)
    }

    pub fn jump_forward(&mut self, distance: u32) {
        self.pc += distance as usize;
    }

    pub fn jump_backward(&mut self, distance: u32) -> VMResult<()> {
        self.pc = self
            .pc
            .checked_sub(distance as usize)
            .ok_or(VMError::InvalidProgramCounter(self.pc))?;
        Ok(())
    }

    pub fn constant(&self, index: u32) -> VMResult<Value> {
        self.constants
            .get(index as usize)
            .cloned()
            .ok_or(VMError::InvalidConstantIndex(index))
    }

    /// A constant used as an identifier; it must be a string
    pub fn name_constant(&self, index: u32) -> VMResult<Rc<str>> {
        match self.constants.get(index as usize) {
            Some(Value::String(name)) => Ok(name.clone()),
            _ => Err(VMError::InvalidConstantIndex(index)),
        }
    }

    pub fn push_handler(&mut self, handler: ExceptionHandler) {
        self.handlers.push(handler);
    }

    pub fn pop_handler(&mut self) -> Option<ExceptionHandler> {
        self.handlers.pop()
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}
