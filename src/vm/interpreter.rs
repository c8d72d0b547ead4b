use std::cell::RefCell;
use std::rc::Rc;
use tracing::{debug, trace, warn};
use crate::bytecode::{Instruction, OpCode};
use crate::vm::environment::{Environment, FuncEnv};
use crate::vm::execution_context::{ExceptionHandler, ExecutionContext};
use crate::vm::module_env::{ModuleId, ModuleRegistry};
use crate::vm::object::{ClassBlueprint, ClassValue, Closure, Dictionary, Event, FunctionValue, Instance, List};
use crate::vm::{Fault, ScriptError, ScriptException, VMError, VMResult, Value};

/// Frames allowed on one VM, nested callback VMs included
pub const DEFAULT_MAX_CALL_DEPTH: usize = 1024;

/// Module name reported for exceptions raised before any frame exists
const HOST_MODULE_NAME: &str = "<host>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    /// No call has been started
    Idle,
    /// A call is set up but no instruction has run
    Ready,
    Running,
    Finished,
}

/// The Virtual Machine that executes bytecode instructions
///
/// A VM runs one top-level call at a time. Script-level calls push an
/// `ExecutionContext` instead of recursing on the native stack, so a VM can be
/// advanced one instruction at a time by the executor.
pub struct VM {
    registry: Rc<RefCell<ModuleRegistry>>,
    stack: Vec<Value>,
    current: Option<ExecutionContext>,
    call_stack: Vec<ExecutionContext>,
    state: VmState,
    result: Option<Value>,
    stack_trace_enabled: bool,
    max_call_depth: usize,
    base_depth: usize,
    last_line: u32,
}

impl VM {
    pub fn new(registry: Rc<RefCell<ModuleRegistry>>) -> Self {
        Self {
            registry,
            stack: Vec::with_capacity(256),
            current: None,
            call_stack: Vec::new(),
            state: VmState::Idle,
            result: None,
            stack_trace_enabled: false,
            max_call_depth: DEFAULT_MAX_CALL_DEPTH,
            base_depth: 0,
            last_line: 0,
        }
    }

    /// A fresh VM sharing this one's registry and settings
    pub fn spawn(&self) -> VM {
        let mut vm = VM::new(self.registry.clone());
        vm.stack_trace_enabled = self.stack_trace_enabled;
        vm.max_call_depth = self.max_call_depth;
        vm.base_depth = self.call_depth();
        vm
    }

    /// Enable or disable operand stack tracing
    pub fn set_stack_trace(&mut self, enabled: bool) {
        self.stack_trace_enabled = enabled;
    }

    pub fn set_max_call_depth(&mut self, depth: usize) {
        self.max_call_depth = depth;
    }

    pub fn registry(&self) -> Rc<RefCell<ModuleRegistry>> {
        self.registry.clone()
    }

    pub fn state(&self) -> VmState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.state == VmState::Finished
    }

    pub fn result(&self) -> Option<&Value> {
        self.result.as_ref()
    }

    pub fn take_result(&mut self) -> Option<Value> {
        self.result.take()
    }

    /// Module owning the frame that is currently executing
    pub fn current_module(&self) -> Option<ModuleId> {
        self.current.as_ref().map(ExecutionContext::module_id)
    }

    pub fn call_depth(&self) -> usize {
        self.base_depth + self.call_stack.len() + usize::from(self.current.is_some())
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    pub fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    pub fn pop(&mut self) -> VMResult<Value> {
        self.stack.pop().ok_or(VMError::StackUnderflow)
    }

    pub fn peek(&self) -> VMResult<&Value> {
        self.stack.last().ok_or(VMError::StackUnderflow)
    }

    /// Pop `count` values, keeping pop order
    fn pop_many(&mut self, count: u32) -> VMResult<Vec<Value>> {
        let count = count as usize;
        if count > self.stack.len() {
            return Err(VMError::StackUnderflow);
        }
        let mut values = self.stack.split_off(self.stack.len() - count);
        values.reverse();
        Ok(values)
    }

    /// Pop `count` call arguments, restoring push order
    fn pop_args(&mut self, count: u32) -> VMResult<Vec<Value>> {
        let mut args = self.pop_many(count)?;
        args.reverse();
        Ok(args)
    }

    fn frame(&self) -> VMResult<&ExecutionContext> {
        self.current.as_ref().ok_or(VMError::MissingCallFrame)
    }

    fn frame_mut(&mut self) -> VMResult<&mut ExecutionContext> {
        self.current.as_mut().ok_or(VMError::MissingCallFrame)
    }

    /// Start a top-level call without executing any instruction
    ///
    /// Builtins and events complete immediately; script functions and
    /// constructors leave the VM `Ready` for `step`/`run`.
    pub fn begin_call(&mut self, callee: Value, args: Vec<Value>) -> VMResult<()> {
        if self.current.is_some() {
            return Err(VMError::InvalidOperation("a call is already in progress".to_string()));
        }
        self.stack.clear();
        self.call_stack.clear();
        self.result = None;
        self.last_line = 0;

        let outcome = match callee.as_constructible() {
            Some(class) => class.construct(self, args),
            None => match callee.as_callable() {
                Some(callable) => callable.call(self, args),
                None => Err(ScriptError::NotCallable(callee.type_name()).into()),
            },
        };

        match outcome {
            Ok(()) => {}
            Err(Fault::Throw(value)) => return Err(self.uncaught(HOST_MODULE_NAME.to_string(), value)),
            Err(Fault::Fatal(err)) => return Err(self.abort(err)),
        }

        if self.current.is_some() {
            self.state = VmState::Ready;
        } else {
            let value = self.stack.pop().unwrap_or(Value::Null);
            self.finish(value);
        }
        Ok(())
    }

    /// Mark a prepared VM as running
    pub fn setup(&mut self) -> VMResult<()> {
        match self.state {
            VmState::Idle => Err(VMError::MissingCallFrame),
            VmState::Ready => {
                self.state = VmState::Running;
                Ok(())
            }
            VmState::Running | VmState::Finished => Ok(()),
        }
    }

    /// Execute exactly one instruction
    pub fn step(&mut self) -> VMResult<VmState> {
        match self.state {
            VmState::Finished => return Ok(VmState::Finished),
            VmState::Idle => return Err(VMError::MissingCallFrame),
            VmState::Ready => self.state = VmState::Running,
            VmState::Running => {}
        }

        let instruction = match self.frame_mut().and_then(ExecutionContext::fetch) {
            Ok(instruction) => instruction,
            Err(err) => return Err(self.abort(err)),
        };
        self.last_line = instruction.line;

        if self.stack_trace_enabled {
            trace!(stack = ?self.stack, "operand stack");
        }
        trace!(
            pc = self.frame().map(|f| f.pc() - 1).unwrap_or(0),
            instruction = %instruction,
            "dispatch"
        );

        match self.execute(instruction) {
            Ok(()) => {}
            Err(Fault::Throw(value)) => self.throw(value)?,
            Err(Fault::Fatal(err)) => return Err(self.abort(err)),
        }
        Ok(self.state)
    }

    /// Run the prepared call to completion
    pub fn run(&mut self) -> VMResult<Value> {
        self.setup()?;
        while self.step()? != VmState::Finished {}
        Ok(self.result.clone().unwrap_or(Value::Null))
    }

    /// Run a callable to completion on a nested VM
    ///
    /// An exception escaping the nested VM is re-thrown here.
    pub fn invoke(&mut self, callee: Value, args: Vec<Value>) -> Result<Value, Fault> {
        if self.call_depth() >= self.max_call_depth {
            return Err(ScriptError::StackOverflow(self.max_call_depth).into());
        }
        let mut nested = self.spawn();
        let result = nested.begin_call(callee, args).and_then(|()| nested.run());
        result.map_err(|err| match err {
            VMError::Uncaught(exception) => Fault::Throw(exception.value),
            other => Fault::Fatal(other),
        })
    }

    fn finish(&mut self, value: Value) {
        debug!(result = %value, "vm finished");
        self.current = None;
        self.call_stack.clear();
        self.result = Some(value);
        self.state = VmState::Finished;
    }

    fn abort(&mut self, err: VMError) -> VMError {
        self.current = None;
        self.call_stack.clear();
        self.state = VmState::Finished;
        err
    }

    /// Route a thrown value to the innermost handler, unwinding frames as needed
    fn throw(&mut self, value: Value) -> VMResult<()> {
        let module = self
            .current
            .as_ref()
            .map(|frame| frame.module_name().to_string())
            .unwrap_or_else(|| HOST_MODULE_NAME.to_string());

        while let Some(frame) = self.current.as_mut() {
            if let Some(handler) = frame.pop_handler() {
                trace!(handler_pc = handler.handler_pc, thrown = %value, "exception caught");
                frame.set_pc(handler.handler_pc);
                self.stack.truncate(handler.stack_depth);
                self.stack.push(value);
                return Ok(());
            }
            self.current = self.call_stack.pop();
            if self.current.is_some() {
                debug!(depth = self.call_depth(), "unwinding frame");
            }
        }

        Err(self.uncaught(module, value))
    }

    fn uncaught(&mut self, module: String, value: Value) -> VMError {
        let exception = ScriptException { module, line: self.last_line, value };
        warn!(%exception, "uncaught exception");
        self.abort(VMError::Uncaught(exception))
    }

    /// Push a frame for a script function call
    pub(crate) fn enter_function(
        &mut self,
        function: &FunctionValue,
        mut args: Vec<Value>,
        in_constructor: bool,
    ) -> Result<(), Fault> {
        let depth = self.call_depth();
        if depth >= self.max_call_depth {
            return Err(ScriptError::StackOverflow(self.max_call_depth).into());
        }

        let (module, constants) = {
            let registry = self.registry.borrow();
            (registry.module(function.module())?, registry.constants(function.module())?)
        };
        let (declared, is_vararg, local_count) = match module.functions.get(function.index() as usize) {
            Some(def) => (def.arg_count as usize, def.is_vararg, def.local_count as usize),
            None => return Err(VMError::InvalidFunctionIndex(function.index()).into()),
        };

        if is_vararg {
            let rest = if args.len() > declared { args.split_off(declared) } else { Vec::new() };
            args.resize(declared, Value::Null);
            args.push(Value::List(List::new(rest)));
        } else if args.len() > declared {
            return Err(ScriptError::ArityMismatch {
                name: function.name().unwrap_or("<anonymous>").to_string(),
                expected: declared,
                got: args.len(),
            }
            .into());
        }

        let env = Environment::Function(Rc::new(FuncEnv::new(args, local_count, function.env().clone())));
        let context = ExecutionContext::new(function.module(), module, constants, function.index(), env)?
            .with_constructor(in_constructor);
        debug!(
            module = context.module_name(),
            function = function.name().unwrap_or("<anonymous>"),
            depth = depth + 1,
            "enter frame"
        );

        if let Some(caller) = self.current.take() {
            self.call_stack.push(caller);
        }
        self.current = Some(context);
        Ok(())
    }

    /// Allocate an instance and run the class constructor on it
    pub(crate) fn construct(&mut self, class: &ClassValue, args: Vec<Value>) -> Result<(), Fault> {
        let blueprint = class.blueprint();
        let instance = Instance::allocate(class);
        let constructor = FunctionValue::new(Closure {
            module: blueprint.module,
            index: blueprint.constructor,
            name: blueprint.name.clone(),
            env: Environment::Class(instance.env().clone()),
        });
        self.push(Value::Instance(instance));
        self.enter_function(&constructor, args, true)
    }

    /// Fire every callback of an event, most recently attached first
    pub(crate) fn raise_event(&mut self, event: &Event, args: Vec<Value>) -> Result<(), Fault> {
        for callback in event.raise_order() {
            self.invoke(callback, args.clone())?;
        }
        self.push(Value::Null);
        Ok(())
    }

    fn return_from_frame(&mut self) -> Result<(), Fault> {
        let frame = self.current.take().ok_or(VMError::MissingCallFrame)?;
        let mut value = self.pop()?;
        if frame.in_constructor() {
            // The constructor's own result is dropped; the instance sits beneath it
            value = self.pop()?;
        }
        debug!(module = frame.module_name(), depth = self.call_depth() + 1, "leave frame");

        match self.call_stack.pop() {
            Some(caller) => {
                self.current = Some(caller);
                self.push(value);
            }
            None => self.finish(value),
        }
        Ok(())
    }

    fn load_function(&self, index: u32) -> VMResult<FunctionValue> {
        let frame = self.frame()?;
        let module = frame.module();
        if module.functions.get(index as usize).is_none() {
            return Err(VMError::InvalidFunctionIndex(index));
        }
        Ok(FunctionValue::new(Closure {
            module: frame.module_id(),
            index,
            name: module.function_name(index).map(Rc::from),
            env: frame.env().clone(),
        }))
    }

    fn load_class(&self, index: u32) -> VMResult<ClassValue> {
        let frame = self.frame()?;
        let module = frame.module();
        let class = module
            .classes
            .get(index as usize)
            .ok_or(VMError::InvalidClassIndex(index))?;
        if module.functions.get(class.constructor as usize).is_none() {
            return Err(VMError::InvalidFunctionIndex(class.constructor));
        }
        let members = class
            .members
            .iter()
            .map(|&member| {
                module
                    .constant_str(member)
                    .map(Rc::from)
                    .ok_or(VMError::InvalidConstantIndex(member))
            })
            .collect::<VMResult<Vec<Rc<str>>>>()?;

        Ok(ClassValue::new(ClassBlueprint {
            module: frame.module_id(),
            index,
            name: module.class_name(index).map(Rc::from),
            members,
            constructor: class.constructor,
            env: frame.env().clone(),
        }))
    }

    fn execute(&mut self, instruction: Instruction) -> Result<(), Fault> {
        let arg = instruction.arg;
        match instruction.opcode {
            OpCode::Nop => {}

            OpCode::ExtendedArg => {
                return Err(VMError::InvalidOperation("EXTENDED_ARG reached the dispatcher".to_string()).into());
            }

            OpCode::Pop => {
                self.pop()?;
            }

            OpCode::Dup => {
                let value = self.peek()?.clone();
                self.push(value);
            }

            OpCode::LdNull => self.push(Value::Null),
            OpCode::LdTrue => self.push(Value::Boolean(true)),
            OpCode::LdFalse => self.push(Value::Boolean(false)),

            OpCode::LdConst => {
                let value = self.frame()?.constant(arg)?;
                self.push(value);
            }

            OpCode::LdVar => {
                let id = self.frame()?.module_id();
                let value = self.registry.borrow().load_variable(id, arg)?;
                self.push(value);
            }

            OpCode::StVar => {
                let value = self.pop()?;
                let id = self.frame()?.module_id();
                self.registry.borrow_mut().store_variable(id, arg, value)?;
            }

            OpCode::LdLocal => {
                let (uplevel, slot) = instruction.local_operand();
                let value = self.frame()?.env().load_local(uplevel, slot)?;
                self.push(value);
            }

            OpCode::StLocal => {
                let (uplevel, slot) = instruction.local_operand();
                let value = self.pop()?;
                self.frame()?.env().store_local(uplevel, slot, value)?;
            }

            OpCode::LdArg => {
                let value = self.frame()?.env().load_arg(arg as usize)?;
                self.push(value);
            }

            OpCode::StArg => {
                let value = self.pop()?;
                self.frame()?.env().store_arg(arg as usize, value)?;
            }

            OpCode::LdFunc => {
                let function = self.load_function(arg)?;
                self.push(Value::Function(function));
            }

            OpCode::LdClass => {
                let class = self.load_class(arg)?;
                self.push(Value::Class(class));
            }

            OpCode::LdThis => {
                let instance = self
                    .frame()?
                    .env()
                    .nearest_class()
                    .map(|class| class.instance())
                    .ok_or(ScriptError::NoInstance)?;
                self.push(Value::Instance(instance));
            }

            OpCode::LdMember => {
                let frame = self.frame()?;
                let name = frame.name_constant(arg)?;
                let (env, id) = (frame.env().clone(), frame.module_id());
                let value = match env.find_member(&name) {
                    Some(value) => value,
                    None => self
                        .registry
                        .borrow()
                        .load_named(id, &name)?
                        .ok_or_else(|| ScriptError::UndefinedVariable(name.to_string()))?,
                };
                self.push(value);
            }

            OpCode::StMember => {
                let frame = self.frame()?;
                let name = frame.name_constant(arg)?;
                let (env, id) = (frame.env().clone(), frame.module_id());
                let value = self.pop()?;
                if let Err(value) = env.assign_member(&name, value) {
                    if !self.registry.borrow_mut().store_named(id, &name, value)? {
                        return Err(ScriptError::UndefinedVariable(name.to_string()).into());
                    }
                }
            }

            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Lt | OpCode::Lte => {
                let right = self.pop()?;
                let left = self.pop()?;
                let value = binary(instruction.opcode, &left, &right)?;
                self.push(value);
            }

            OpCode::Eq => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.push(Value::Boolean(left.value_equals(&right)));
            }

            OpCode::And => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.push(Value::Boolean(left.truthy() && right.truthy()));
            }

            OpCode::Or => {
                let right = self.pop()?;
                let left = self.pop()?;
                self.push(Value::Boolean(left.truthy() || right.truthy()));
            }

            OpCode::Not => {
                let value = self.pop()?;
                self.push(Value::Boolean(!value.truthy()));
            }

            OpCode::Jmp => self.frame_mut()?.jump_forward(arg),
            OpCode::Jmpb => self.frame_mut()?.jump_backward(arg)?,
            OpCode::Jmpa => self.frame_mut()?.set_pc(arg as usize),

            OpCode::Jmpt | OpCode::Jmpf => {
                let condition = self.pop()?.truthy();
                if condition == (instruction.opcode == OpCode::Jmpt) {
                    self.frame_mut()?.jump_forward(arg);
                }
            }

            OpCode::Call => {
                let callee = self.pop()?;
                let args = self.pop_args(arg)?;
                match callee.as_callable() {
                    Some(callable) => callable.call(self, args)?,
                    None => return Err(ScriptError::NotCallable(callee.type_name()).into()),
                }
            }

            OpCode::Ret => self.return_from_frame()?,

            OpCode::New => {
                let class = self.pop()?;
                let args = self.pop_args(arg)?;
                match class.as_constructible() {
                    Some(constructible) => constructible.construct(self, args)?,
                    None => return Err(ScriptError::NotConstructible(class.type_name()).into()),
                }
            }

            OpCode::Throw => {
                let value = self.pop()?;
                return Err(Fault::Throw(value));
            }

            OpCode::Catch => {
                if arg == 0 {
                    return Err(VMError::InvalidOperation("CATCH with a zero handler offset".to_string()).into());
                }
                let stack_depth = self.stack.len();
                let frame = self.frame_mut()?;
                // Offset counts from the CATCH itself; pc already sits one past it
                let handler_pc = frame.pc() + arg as usize - 1;
                frame.push_handler(ExceptionHandler { handler_pc, stack_depth });
                trace!(handler_pc, stack_depth, "handler pushed");
            }

            OpCode::TryEnd => {
                self.frame_mut()?
                    .pop_handler()
                    .ok_or_else(|| VMError::InvalidOperation("TRY_END without an open CATCH".to_string()))?;
                trace!("handler popped");
            }

            OpCode::LdList => {
                let items = self.pop_many(arg)?;
                self.push(Value::List(List::new(items)));
            }

            OpCode::LdObj => {
                let dict = Dictionary::default();
                for _ in 0..arg {
                    let key = self.pop()?;
                    let value = self.pop()?;
                    dict.insert(key, value);
                }
                self.push(Value::Dictionary(dict));
            }

            OpCode::LdIndex => {
                let index = self.pop()?;
                let target = self.pop()?;
                let indexable = target
                    .as_indexable()
                    .ok_or(ScriptError::NotIndexable(target.type_name()))?;
                let value = indexable.get_at(&index)?;
                self.push(value);
            }

            OpCode::StIndex => {
                let index = self.pop()?;
                let target = self.pop()?;
                let value = self.pop()?;
                let indexable = target
                    .as_indexable()
                    .ok_or(ScriptError::NotIndexable(target.type_name()))?;
                indexable.set_at(&index, value)?;
            }

            OpCode::LdProp => {
                let name = self.frame()?.name_constant(arg)?;
                let target = self.pop()?;
                let properties = target.as_properties().ok_or_else(|| ScriptError::PropertyNotFound {
                    kind: target.type_name(),
                    name: name.to_string(),
                })?;
                let value = properties.get_property(&name)?;
                self.push(value);
            }

            OpCode::StProp => {
                let name = self.frame()?.name_constant(arg)?;
                let target = self.pop()?;
                let value = self.pop()?;
                let properties = target.as_properties().ok_or_else(|| ScriptError::PropertyNotFound {
                    kind: target.type_name(),
                    name: name.to_string(),
                })?;
                properties.set_property(&name, value)?;
            }

            OpCode::Iter => {
                let value = self.pop()?;
                let iterable = value
                    .as_iterable()
                    .ok_or(ScriptError::NotIterable(value.type_name()))?;
                let iterator = iterable.make_iterator();
                self.push(Value::Iterator(iterator));
            }

            OpCode::LdEvent => self.push(Value::Event(Event::new())),

            OpCode::Attach => {
                let target = self.pop()?;
                let callback = self.pop()?;
                let event = match &target {
                    Value::Event(event) => event,
                    other => return Err(ScriptError::NotAttachable(other.type_name()).into()),
                };
                if callback.as_callable().is_none() {
                    return Err(ScriptError::NotCallable(callback.type_name()).into());
                }
                event.attach(callback);
            }
        }
        Ok(())
    }
}

fn binary(op: OpCode, left: &Value, right: &Value) -> Result<Value, ScriptError> {
    let result = match left.as_operable() {
        Some(operand) => match op {
            OpCode::Add => operand.add(right)?,
            OpCode::Sub => operand.subtract(right)?,
            OpCode::Mul => operand.multiply(right)?,
            OpCode::Div => operand.divide(right)?,
            OpCode::Lt => operand.less_than(right)?,
            OpCode::Lte => operand.less_than_or_equal(right)?,
            _ => None,
        },
        None => None,
    };
    result.ok_or(ScriptError::UnsupportedOperands {
        op: op.mnemonic(),
        left: left.type_name(),
        right: right.type_name(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Class, Function, Module, Visibility};
    use crate::vm::BuiltinFunction;

    type Registry = Rc<RefCell<ModuleRegistry>>;

    /// Append a function built from `(opcode, arg)` pairs; line numbers are 1-based positions
    fn body(module: &mut Module, name: Option<&str>, args: u16, vararg: bool, locals: u16, code: &[(OpCode, u32)]) -> u32 {
        let name = name.map(|n| module.add_string(n));
        let mut function = Function::new(name, args, vararg, locals);
        for (position, (opcode, arg)) in code.iter().enumerate() {
            function.emit(*opcode, *arg, position as u32 + 1);
        }
        module.add_function(function)
    }

    fn load(registry: &Registry, module: Module, parent: Option<ModuleId>) -> ModuleId {
        registry.borrow_mut().load(Rc::new(module), parent).unwrap()
    }

    fn run_init(registry: &Registry, id: ModuleId) -> VMResult<Value> {
        let init = registry
            .borrow()
            .static_initializer(id)
            .unwrap()
            .expect("module has a static initializer");
        let mut vm = VM::new(registry.clone());
        vm.begin_call(Value::Function(init), Vec::new())?;
        vm.run()
    }

    fn run_module(module: Module) -> VMResult<Value> {
        let registry: Registry = Rc::new(RefCell::new(ModuleRegistry::new()));
        let id = load(&registry, module, None);
        run_init(&registry, id)
    }

    fn uncaught(result: VMResult<Value>) -> ScriptException {
        match result {
            Err(VMError::Uncaught(exception)) => exception,
            other => panic!("Expected uncaught exception, got {:?}", other.map(|v| v.to_string())),
        }
    }

    #[test]
    fn test_arithmetic_semantics() {
        let mut module = Module::new("math");
        let ab = module.add_string("ab");
        let two = module.add_number(2.0);
        let three = module.add_number(3.0);
        let zero = module.add_number(0.0);
        body(&mut module, None, 0, false, 0, &[
            (OpCode::LdConst, ab),
            (OpCode::LdConst, three),
            (OpCode::Mul, 0),
            (OpCode::LdConst, two),
            (OpCode::LdConst, three),
            (OpCode::Add, 0),
            (OpCode::LdConst, two),
            (OpCode::LdConst, zero),
            (OpCode::Div, 0),
            (OpCode::LdList, 3),
            (OpCode::Ret, 0),
        ]);

        let result = run_module(module).unwrap();
        assert_eq!(result.to_string(), "[Infinity, 5, \"ababab\"]");
    }

    #[test]
    fn test_list_literal_elements_come_out_reversed() {
        let mut module = Module::new("lists");
        let consts: Vec<u32> = (1..=3).map(|n| module.add_number(n as f64)).collect();
        body(&mut module, None, 0, false, 0, &[
            (OpCode::LdConst, consts[0]),
            (OpCode::LdConst, consts[1]),
            (OpCode::LdConst, consts[2]),
            (OpCode::LdList, 3),
            (OpCode::Ret, 0),
        ]);
        assert_eq!(run_module(module).unwrap().to_string(), "[3, 2, 1]");
    }

    #[test]
    fn test_object_literal_and_indexing() {
        let mut module = Module::new("objects");
        let one = module.add_number(1.0);
        let two = module.add_number(2.0);
        let key = module.add_string("a");
        let other = module.add_string("b");
        body(&mut module, None, 0, false, 1, &[
            (OpCode::LdConst, one),
            (OpCode::LdConst, key),
            (OpCode::LdObj, 1),
            (OpCode::StLocal, 0),
            (OpCode::LdConst, two),
            (OpCode::LdLocal, 0),
            (OpCode::LdConst, other),
            (OpCode::StIndex, 0),
            (OpCode::LdLocal, 0),
            (OpCode::LdConst, key),
            (OpCode::LdIndex, 0),
            (OpCode::LdLocal, 0),
            (OpCode::LdConst, other),
            (OpCode::LdIndex, 0),
            (OpCode::Add, 0),
            (OpCode::Ret, 0),
        ]);
        assert_eq!(run_module(module).unwrap().as_number(), Some(3.0));
    }

    #[test]
    fn test_each_load_closes_over_its_own_frame() {
        let mut module = Module::new("closures");
        let zero = module.add_number(0.0);
        let one = module.add_number(1.0);
        let two = module.add_number(2.0);
        let three = module.add_number(3.0);
        let ten = module.add_number(10.0);
        let twenty = module.add_number(20.0);

        // closures = []; for (i = 0; i < 3; i += 1) closures += [counter(i)]
        let mut init = Function::new(None, 0, false, 2);
        init.emit(OpCode::LdList, 0, 1);
        init.emit(OpCode::StLocal, 0, 1);
        init.emit(OpCode::LdConst, zero, 2);
        init.emit(OpCode::StLocal, 1, 2);
        let loop_start = init.next_offset();
        init.emit(OpCode::LdLocal, 1, 3);
        init.emit(OpCode::LdConst, three, 3);
        init.emit(OpCode::Lt, 0, 3);
        let exit = init.emit(OpCode::Jmpf, 0, 3);
        init.emit(OpCode::LdLocal, 0, 4);
        init.emit(OpCode::LdLocal, 1, 4);
        init.emit(OpCode::LdFunc, 1, 4);
        init.emit(OpCode::Call, 1, 4);
        init.emit(OpCode::LdList, 1, 4);
        init.emit(OpCode::Add, 0, 4);
        init.emit(OpCode::StLocal, 0, 4);
        init.emit(OpCode::LdLocal, 1, 5);
        init.emit(OpCode::LdConst, one, 5);
        init.emit(OpCode::Add, 0, 5);
        init.emit(OpCode::StLocal, 1, 5);
        let back = init.emit(OpCode::Jmpb, 0, 5);
        init.patch(back, (back + 1 - loop_start) as u32);
        let after_loop = init.next_offset();
        init.patch(exit, (after_loop - exit - 1) as u32);

        // closures[0](10); closures[1](20)
        for (index, amount) in [(zero, ten), (one, twenty)] {
            init.emit(OpCode::LdConst, amount, 6);
            init.emit(OpCode::LdLocal, 0, 6);
            init.emit(OpCode::LdConst, index, 6);
            init.emit(OpCode::LdIndex, 0, 6);
            init.emit(OpCode::Call, 1, 6);
            init.emit(OpCode::Pop, 0, 6);
        }
        // [closures[0](0), closures[1](0), closures[2](0)]
        for index in [zero, one, two] {
            init.emit(OpCode::LdConst, zero, 7);
            init.emit(OpCode::LdLocal, 0, 7);
            init.emit(OpCode::LdConst, index, 7);
            init.emit(OpCode::LdIndex, 0, 7);
            init.emit(OpCode::Call, 1, 7);
        }
        init.emit(OpCode::LdList, 3, 8);
        init.emit(OpCode::Ret, 0, 8);
        module.add_function(init);

        let captured = Instruction::encode_local(1, 0);
        body(&mut module, Some("counter"), 1, false, 1, &[
            (OpCode::LdArg, 0),
            (OpCode::StLocal, 0),
            (OpCode::LdFunc, 2),
            (OpCode::Ret, 0),
        ]);
        body(&mut module, Some("bump"), 1, false, 0, &[
            (OpCode::LdLocal, captured),
            (OpCode::LdArg, 0),
            (OpCode::Add, 0),
            (OpCode::Dup, 0),
            (OpCode::StLocal, captured),
            (OpCode::Ret, 0),
        ]);

        let result = run_module(module).unwrap();
        assert_eq!(result.to_string(), "[2, 21, 10]");
    }

    #[test]
    fn test_repeated_loads_are_distinct_closures() {
        let mut module = Module::new("identity");
        body(&mut module, None, 0, false, 0, &[
            (OpCode::LdFunc, 1),
            (OpCode::LdFunc, 1),
            (OpCode::Eq, 0),
            (OpCode::Ret, 0),
        ]);
        body(&mut module, None, 0, false, 0, &[(OpCode::LdNull, 0), (OpCode::Ret, 0)]);
        assert!(matches!(run_module(module).unwrap(), Value::Boolean(false)));
    }

    #[test]
    fn test_throw_unwinds_into_caller_handler() {
        let mut module = Module::new("unwind");
        let one = module.add_number(1.0);
        let boom = module.add_string("boom");
        let caught = module.add_string(" caught");
        let unreached = module.add_string("unreached");
        body(&mut module, None, 0, false, 0, &[
            (OpCode::Catch, 6),
            (OpCode::LdFunc, 1),
            (OpCode::Call, 0),
            (OpCode::TryEnd, 0),
            (OpCode::LdConst, unreached),
            (OpCode::Ret, 0),
            (OpCode::LdConst, caught),
            (OpCode::Add, 0),
            (OpCode::Ret, 0),
        ]);
        body(&mut module, Some("thrower"), 0, false, 0, &[
            (OpCode::LdConst, one),
            (OpCode::LdConst, boom),
            (OpCode::Throw, 0),
        ]);
        assert_eq!(run_module(module).unwrap().as_str(), Some("boom caught"));
    }

    #[test]
    fn test_uncaught_exception_reports_module_and_line() {
        let mut module = Module::new("main");
        let bad = module.add_string("bad");
        body(&mut module, None, 0, false, 0, &[
            (OpCode::Nop, 0),
            (OpCode::LdConst, bad),
            (OpCode::Throw, 0),
        ]);
        let exception = uncaught(run_module(module));
        assert_eq!(exception.module, "main");
        assert_eq!(exception.line, 3);
        assert_eq!(exception.value.as_str(), Some("bad"));
    }

    #[test]
    fn test_runtime_errors_are_catchable() {
        let mut module = Module::new("errors");
        let one = module.add_number(1.0);
        body(&mut module, None, 0, false, 0, &[
            (OpCode::Catch, 5),
            (OpCode::LdNull, 0),
            (OpCode::LdConst, one),
            (OpCode::Add, 0),
            (OpCode::Ret, 0),
            (OpCode::Ret, 0),
        ]);
        let result = run_module(module).unwrap();
        assert_eq!(result.as_str(), Some("Unsupported operand types for ADD: null and number"));
    }

    #[test]
    fn test_stack_underflow_is_not_catchable() {
        let mut module = Module::new("fatal");
        body(&mut module, None, 0, false, 0, &[
            (OpCode::Catch, 3),
            (OpCode::Pop, 0),
            (OpCode::Ret, 0),
            (OpCode::Ret, 0),
        ]);
        assert!(matches!(run_module(module), Err(VMError::StackUnderflow)));
    }

    #[test]
    fn test_runaway_recursion_becomes_catchable_overflow() {
        let mut module = Module::new("recursion");
        body(&mut module, None, 0, false, 0, &[
            (OpCode::Catch, 4),
            (OpCode::LdFunc, 1),
            (OpCode::Call, 0),
            (OpCode::Ret, 0),
            (OpCode::Ret, 0),
        ]);
        body(&mut module, Some("forever"), 0, false, 0, &[
            (OpCode::LdFunc, 1),
            (OpCode::Call, 0),
            (OpCode::Ret, 0),
        ]);

        let registry: Registry = Rc::new(RefCell::new(ModuleRegistry::new()));
        let id = load(&registry, module, None);
        let init = registry.borrow().static_initializer(id).unwrap().unwrap();
        let mut vm = VM::new(registry.clone());
        vm.set_max_call_depth(50);
        vm.begin_call(Value::Function(init), Vec::new()).unwrap();
        let result = vm.run().unwrap();
        assert_eq!(result.as_str(), Some("Maximum call depth of 50 exceeded"));
    }

    #[test]
    fn test_vararg_packs_extra_arguments() {
        let mut module = Module::new("varargs");
        let consts: Vec<u32> = (1..=3).map(|n| module.add_number(n as f64)).collect();
        body(&mut module, None, 0, false, 0, &[
            (OpCode::LdConst, consts[0]),
            (OpCode::LdConst, consts[1]),
            (OpCode::LdConst, consts[2]),
            (OpCode::LdFunc, 1),
            (OpCode::Call, 3),
            (OpCode::Ret, 0),
        ]);
        body(&mut module, Some("rest"), 1, true, 0, &[(OpCode::LdArg, 1), (OpCode::Ret, 0)]);
        assert_eq!(run_module(module).unwrap().to_string(), "[2, 3]");
    }

    #[test]
    fn test_too_many_arguments_is_an_arity_error() {
        let mut module = Module::new("arity");
        body(&mut module, None, 0, false, 0, &[
            (OpCode::LdNull, 0),
            (OpCode::LdNull, 0),
            (OpCode::LdFunc, 1),
            (OpCode::Call, 2),
            (OpCode::Ret, 0),
        ]);
        body(&mut module, Some("one"), 1, false, 0, &[(OpCode::LdArg, 3), (OpCode::Ret, 0)]);
        let exception = uncaught(run_module(module));
        assert_eq!(exception.value.as_str(), Some("one expects 1 argument(s), got 2"));
    }

    #[test]
    fn test_missing_arguments_are_null() {
        let mut module = Module::new("missing");
        body(&mut module, None, 0, false, 0, &[(OpCode::LdFunc, 1), (OpCode::Call, 0), (OpCode::Ret, 0)]);
        body(&mut module, None, 2, false, 0, &[(OpCode::LdArg, 1), (OpCode::Ret, 0)]);
        assert!(run_module(module).unwrap().is_null());
    }

    #[test]
    fn test_constructor_initializes_members() {
        let mut module = Module::new("classes");
        let five = module.add_number(5.0);
        let six = module.add_number(6.0);
        let hundred = module.add_number(100.0);
        let x = module.add_string("x");
        let y = module.add_string("y");
        let offset = module.add_string("offset");
        module.add_variable(Some("offset"), Visibility::Private);

        let mut class = Class::new(Some(module.add_string("Point")), 1);
        class.add_member(x);
        class.add_member(y);
        module.add_class(class);

        body(&mut module, None, 0, false, 1, &[
            (OpCode::LdConst, hundred),
            (OpCode::StVar, 0),
            (OpCode::LdConst, five),
            (OpCode::LdConst, six),
            (OpCode::LdClass, 0),
            (OpCode::New, 2),
            (OpCode::StLocal, 0),
            (OpCode::LdLocal, 0),
            (OpCode::LdProp, x),
            (OpCode::LdLocal, 0),
            (OpCode::LdProp, y),
            (OpCode::LdLocal, 0),
            (OpCode::LdList, 3),
            (OpCode::Ret, 0),
        ]);
        // x = offset + a; this.y = b
        body(&mut module, Some("Point"), 2, false, 0, &[
            (OpCode::LdMember, offset),
            (OpCode::LdArg, 0),
            (OpCode::Add, 0),
            (OpCode::StMember, x),
            (OpCode::LdArg, 1),
            (OpCode::LdThis, 0),
            (OpCode::StProp, y),
            (OpCode::LdNull, 0),
            (OpCode::Ret, 0),
        ]);

        let result = run_module(module).unwrap();
        assert_eq!(result.to_string(), "[<Point instance>, 6, 105]");
    }

    #[test]
    fn test_new_on_non_class_throws() {
        let mut module = Module::new("bad_new");
        body(&mut module, None, 0, false, 0, &[(OpCode::LdNull, 0), (OpCode::New, 0), (OpCode::Ret, 0)]);
        let exception = uncaught(run_module(module));
        assert_eq!(exception.value.as_str(), Some("Value of type null is not constructible"));
    }

    #[test]
    fn test_this_outside_class_throws() {
        let mut module = Module::new("no_this");
        body(&mut module, None, 0, false, 0, &[(OpCode::LdThis, 0), (OpCode::Ret, 0)]);
        let exception = uncaught(run_module(module));
        assert_eq!(exception.value.as_str(), Some("'this' used outside of a class"));
    }

    #[test]
    fn test_constructor_closure_keeps_this_after_instance_is_dropped() {
        let mut module = Module::new("this");
        module.add_variable(Some("cb"), Visibility::Private);
        let widget = module.add_string("Widget");
        module.add_class(Class::new(Some(widget), 1));

        body(&mut module, None, 0, false, 0, &[
            (OpCode::LdClass, 0),
            (OpCode::New, 0),
            (OpCode::Pop, 0),
            (OpCode::LdVar, 0),
            (OpCode::Call, 0),
            (OpCode::Ret, 0),
        ]);
        body(&mut module, Some("Widget"), 0, false, 0, &[
            (OpCode::LdFunc, 2),
            (OpCode::StVar, 0),
            (OpCode::LdNull, 0),
            (OpCode::Ret, 0),
        ]);
        body(&mut module, Some("getThis"), 0, false, 0, &[(OpCode::LdThis, 0), (OpCode::Ret, 0)]);

        match run_module(module).unwrap() {
            Value::Instance(instance) => assert_eq!(instance.class().name(), Some("Widget")),
            other => panic!("Expected instance, got {}", other),
        }
    }

    #[test]
    fn test_catch_offset_counts_from_the_catch_instruction() {
        let mut module = Module::new("offsets");
        let boom = module.add_string("boom");
        let wrong = module.add_string("wrong");
        body(&mut module, None, 0, false, 0, &[
            (OpCode::Catch, 4),
            (OpCode::LdConst, boom),
            (OpCode::Throw, 0),
            (OpCode::LdConst, wrong),
            (OpCode::Ret, 0),
        ]);
        assert_eq!(run_module(module).unwrap().as_str(), Some("boom"));
    }

    #[test]
    fn test_zero_catch_offset_is_fatal() {
        let mut module = Module::new("zero");
        body(&mut module, None, 0, false, 0, &[(OpCode::Catch, 0), (OpCode::LdNull, 0), (OpCode::Ret, 0)]);
        assert!(matches!(run_module(module), Err(VMError::InvalidOperation(_))));
    }

    #[test]
    fn test_oversized_string_repeat_is_catchable() {
        let mut module = Module::new("repeat");
        let ab = module.add_string("ab");
        let huge = module.add_number(1e18);
        body(&mut module, None, 0, false, 0, &[
            (OpCode::Catch, 4),
            (OpCode::LdConst, ab),
            (OpCode::LdConst, huge),
            (OpCode::Mul, 0),
            (OpCode::Ret, 0),
        ]);
        let expected = format!("Repeated string would exceed {} bytes", crate::vm::MAX_REPEAT_LEN);
        assert_eq!(run_module(module).unwrap().as_str(), Some(expected.as_str()));
    }

    #[test]
    fn test_external_variable_resolves_through_parent() {
        let registry: Registry = Rc::new(RefCell::new(ModuleRegistry::new()));

        let mut parent = Module::new("parent");
        let one = parent.add_number(1.0);
        parent.add_variable(Some("x"), Visibility::Public);
        body(&mut parent, None, 0, false, 0, &[
            (OpCode::LdConst, one),
            (OpCode::StVar, 0),
            (OpCode::LdNull, 0),
            (OpCode::Ret, 0),
        ]);
        let parent_id = load(&registry, parent, None);
        run_init(&registry, parent_id).unwrap();

        let mut child = Module::new("child");
        child.add_variable(Some("x"), Visibility::External);
        body(&mut child, None, 0, false, 0, &[(OpCode::LdVar, 0), (OpCode::Ret, 0)]);
        let child_id = load(&registry, child, Some(parent_id));

        assert_eq!(run_init(&registry, child_id).unwrap().as_number(), Some(1.0));
    }

    #[test]
    fn test_iterator_properties_drive_iteration() {
        let mut module = Module::new("iter");
        let ab = module.add_string("ab");
        let next = module.add_string("next");
        let available = module.add_string("available");
        body(&mut module, None, 0, false, 1, &[
            (OpCode::LdConst, ab),
            (OpCode::Iter, 0),
            (OpCode::StLocal, 0),
            (OpCode::LdLocal, 0),
            (OpCode::LdProp, next),
            (OpCode::LdLocal, 0),
            (OpCode::LdProp, next),
            (OpCode::Add, 0),
            (OpCode::LdLocal, 0),
            (OpCode::LdProp, available),
            (OpCode::LdList, 2),
            (OpCode::Ret, 0),
        ]);
        assert_eq!(run_module(module).unwrap().to_string(), "[false, \"ab\"]");
    }

    #[test]
    fn test_event_callbacks_fire_in_reverse_order() {
        let log = Rc::new(RefCell::new(Vec::<String>::new()));
        let recorder = |tag: &'static str| {
            let log = log.clone();
            Value::Builtin(BuiltinFunction::new(tag, move |_vm, args| {
                log.borrow_mut().push(format!("{}:{}", tag, args[0]));
                Ok(None)
            }))
        };

        let mut module = Module::new("events");
        let payload = module.add_string("x");
        module.add_variable(Some("first"), Visibility::Private);
        module.add_variable(Some("second"), Visibility::Private);
        body(&mut module, None, 0, false, 1, &[
            (OpCode::LdEvent, 0),
            (OpCode::StLocal, 0),
            (OpCode::LdVar, 0),
            (OpCode::LdLocal, 0),
            (OpCode::Attach, 0),
            (OpCode::LdVar, 1),
            (OpCode::LdLocal, 0),
            (OpCode::Attach, 0),
            (OpCode::LdConst, payload),
            (OpCode::LdLocal, 0),
            (OpCode::Call, 1),
            (OpCode::Ret, 0),
        ]);

        let registry: Registry = Rc::new(RefCell::new(ModuleRegistry::new()));
        let id = load(&registry, module, None);
        registry.borrow_mut().store_variable(id, 0, recorder("first")).unwrap();
        registry.borrow_mut().store_variable(id, 1, recorder("second")).unwrap();

        assert!(run_init(&registry, id).unwrap().is_null());
        assert_eq!(*log.borrow(), vec!["second:x".to_string(), "first:x".to_string()]);
    }

    #[test]
    fn test_callback_exception_rethrown_in_raiser() {
        let mut module = Module::new("event_errors");
        let failed = module.add_string("cb failed");
        body(&mut module, None, 0, false, 1, &[
            (OpCode::LdEvent, 0),
            (OpCode::StLocal, 0),
            (OpCode::LdFunc, 1),
            (OpCode::LdLocal, 0),
            (OpCode::Attach, 0),
            (OpCode::Catch, 7),
            (OpCode::LdNull, 0),
            (OpCode::LdLocal, 0),
            (OpCode::Call, 1),
            (OpCode::TryEnd, 0),
            (OpCode::LdNull, 0),
            (OpCode::Ret, 0),
            (OpCode::Ret, 0),
        ]);
        body(&mut module, None, 1, false, 0, &[(OpCode::LdConst, failed), (OpCode::Throw, 0)]);
        assert_eq!(run_module(module).unwrap().as_str(), Some("cb failed"));
    }

    #[test]
    fn test_attach_requires_event_and_callable() {
        let mut module = Module::new("attach");
        body(&mut module, None, 0, false, 0, &[
            (OpCode::LdFunc, 0),
            (OpCode::LdNull, 0),
            (OpCode::Attach, 0),
            (OpCode::Ret, 0),
        ]);
        let exception = uncaught(run_module(module));
        assert_eq!(exception.value.as_str(), Some("Cannot attach a callback to value of type null"));
    }

    #[test]
    fn test_builtin_errors_become_script_exceptions() {
        let registry: Registry = Rc::new(RefCell::new(ModuleRegistry::new()));
        let mut module = Module::new("host_errors");
        module.add_variable(Some("fail"), Visibility::Private);
        body(&mut module, None, 0, false, 0, &[
            (OpCode::Catch, 4),
            (OpCode::LdVar, 0),
            (OpCode::Call, 0),
            (OpCode::Ret, 0),
            (OpCode::Ret, 0),
        ]);
        let id = load(&registry, module, None);
        let fail = BuiltinFunction::new("fail", |_vm, _args| Err(ScriptError::Host("nope".to_string()).into()));
        registry.borrow_mut().store_variable(id, 0, Value::Builtin(fail)).unwrap();

        assert_eq!(run_init(&registry, id).unwrap().as_str(), Some("nope"));
    }

    #[test]
    fn test_step_state_transitions() {
        let mut module = Module::new("steps");
        body(&mut module, None, 0, false, 0, &[(OpCode::LdTrue, 0), (OpCode::Ret, 0)]);
        let registry: Registry = Rc::new(RefCell::new(ModuleRegistry::new()));
        let id = load(&registry, module, None);
        let init = registry.borrow().static_initializer(id).unwrap().unwrap();

        let mut vm = VM::new(registry);
        assert_eq!(vm.state(), VmState::Idle);
        assert!(vm.step().is_err());

        vm.begin_call(Value::Function(init), Vec::new()).unwrap();
        assert_eq!(vm.state(), VmState::Ready);
        assert_eq!(vm.call_depth(), 1);
        assert_eq!(vm.step().unwrap(), VmState::Running);
        assert_eq!(vm.stack_depth(), 1);
        assert_eq!(vm.step().unwrap(), VmState::Finished);
        assert!(vm.is_finished());
        assert!(matches!(vm.result(), Some(Value::Boolean(true))));
        assert_eq!(vm.call_depth(), 0);
    }

    #[test]
    fn test_begin_call_on_builtin_finishes_immediately() {
        let registry: Registry = Rc::new(RefCell::new(ModuleRegistry::new()));
        let double = BuiltinFunction::new("double", |_vm, args| {
            Ok(args.first().and_then(Value::as_number).map(|n| Value::Number(n * 2.0)))
        });
        let mut vm = VM::new(registry);
        vm.begin_call(Value::Builtin(double), vec![Value::Number(4.0)]).unwrap();
        assert!(vm.is_finished());
        assert_eq!(vm.run().unwrap().as_number(), Some(8.0));
    }

    #[test]
    fn test_conditional_jumps() {
        let mut module = Module::new("jumps");
        let yes = module.add_string("yes");
        let no = module.add_string("no");
        body(&mut module, None, 0, false, 0, &[
            (OpCode::LdFalse, 0),
            (OpCode::Jmpt, 2),
            (OpCode::LdConst, yes),
            (OpCode::Jmp, 1),
            (OpCode::LdConst, no),
            (OpCode::LdTrue, 0),
            (OpCode::Jmpf, 1),
            (OpCode::Ret, 0),
            (OpCode::LdNull, 0),
            (OpCode::Ret, 0),
        ]);
        assert_eq!(run_module(module).unwrap().as_str(), Some("yes"));
    }
}
