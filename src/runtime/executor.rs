//! Cooperative round-robin scheduler over VM instances

use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;
use crate::runtime::{RuntimeConfig, RuntimeError, RuntimeResult};
use crate::vm::{Event, ModuleRegistry, VMError, Value, VmState, VM};

/// Identifier handed out for every VM added to an executor
pub type VmId = usize;

type FinishHook = Box<dyn FnMut(VmId, &Value)>;

/// Drives a set of VMs one instruction each per pass, in insertion order
pub struct Executor {
    registry: Rc<RefCell<ModuleRegistry>>,
    config: RuntimeConfig,
    vms: Vec<(VmId, VM)>,
    next_id: VmId,
    steps: usize,
    results: Vec<(VmId, Value)>,
    on_finish: Option<FinishHook>,
}

impl Executor {
    pub fn new(registry: Rc<RefCell<ModuleRegistry>>, config: RuntimeConfig) -> Self {
        Self {
            registry,
            config,
            vms: Vec::new(),
            next_id: 0,
            steps: 0,
            results: Vec::new(),
            on_finish: None,
        }
    }

    /// A VM wired to this executor's registry and configuration
    pub fn create_vm(&self) -> VM {
        let mut vm = VM::new(self.registry.clone());
        vm.set_stack_trace(self.config.stack_trace);
        vm.set_max_call_depth(self.config.max_call_depth);
        vm
    }

    pub fn add_vm(&mut self, vm: VM) -> VmId {
        let id = self.next_id;
        self.next_id += 1;
        self.vms.push((id, vm));
        id
    }

    /// Queue a call on a new VM without running it
    pub fn load_function(&mut self, function: Value, args: Vec<Value>) -> RuntimeResult<VmId> {
        let mut vm = self.create_vm();
        vm.begin_call(function, args)?;
        Ok(self.add_vm(vm))
    }

    /// Register a callback fired with each finished VM's result
    pub fn on_finish<F>(&mut self, hook: F)
    where
        F: FnMut(VmId, &Value) + 'static,
    {
        self.on_finish = Some(Box::new(hook));
    }

    /// Run every queued VM to completion
    ///
    /// A VM that fails, including one that was never given a call, is dropped
    /// from the set and its error returned; the remaining VMs stay queued.
    pub fn execute(&mut self) -> RuntimeResult<()> {
        for index in 0..self.vms.len() {
            if let Err(err) = self.vms[index].1.setup() {
                return Err(self.fail(index, err));
            }
        }
        self.reap_finished();

        while !self.vms.is_empty() {
            let mut index = 0;
            while index < self.vms.len() {
                let state = match self.vms[index].1.step() {
                    Ok(state) => state,
                    Err(err) => return Err(self.fail(index, err)),
                };
                self.steps += 1;

                if state == VmState::Finished {
                    let (id, vm) = self.vms.remove(index);
                    self.finish(id, vm);
                } else {
                    index += 1;
                }
            }
        }
        Ok(())
    }

    /// Queue every callback of `event`, most recently attached first, then
    /// drive the executor if nothing else is doing so
    ///
    /// Driving the executor runs every queued VM, so VMs loaded earlier and
    /// not yet executed finish here along with the callbacks.
    pub fn raise_event(&mut self, event: &Event, args: Vec<Value>) -> RuntimeResult<Vec<VmId>> {
        let mut ids = Vec::with_capacity(event.len());
        for callback in event.raise_order() {
            ids.push(self.load_function(callback, args.clone())?);
        }
        self.resume_if_idle()?;
        Ok(ids)
    }

    /// Run all queued VMs to completion if any are waiting; returns whether
    /// anything ran
    pub fn resume_if_idle(&mut self) -> RuntimeResult<bool> {
        if self.vms.is_empty() {
            return Ok(false);
        }
        self.execute()?;
        Ok(true)
    }

    fn fail(&mut self, index: usize, err: VMError) -> RuntimeError {
        let (id, _) = self.vms.remove(index);
        debug!(vm = id, error = %err, "vm failed");
        err.into()
    }

    fn reap_finished(&mut self) {
        let mut index = 0;
        while index < self.vms.len() {
            if self.vms[index].1.is_finished() {
                let (id, vm) = self.vms.remove(index);
                self.finish(id, vm);
            } else {
                index += 1;
            }
        }
    }

    fn finish(&mut self, id: VmId, mut vm: VM) {
        let value = vm.take_result().unwrap_or(Value::Null);
        debug!(vm = id, result = %value, "vm finished");
        if let Some(hook) = self.on_finish.as_mut() {
            hook(id, &value);
        }
        self.results.push((id, value));
    }

    /// Instructions executed since the executor was created
    pub fn step_count(&self) -> usize {
        self.steps
    }

    /// Results of finished VMs in the order they finished
    pub fn take_results(&mut self) -> Vec<(VmId, Value)> {
        std::mem::take(&mut self.results)
    }

    pub fn len(&self) -> usize {
        self.vms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vms.is_empty()
    }

    pub fn registry(&self) -> Rc<RefCell<ModuleRegistry>> {
        self.registry.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Function, Module, OpCode, Visibility};
    use crate::vm::{BuiltinFunction, Closure, Environment, FunctionValue, ModuleId};

    fn setup() -> (Executor, Rc<RefCell<ModuleRegistry>>) {
        let registry = Rc::new(RefCell::new(ModuleRegistry::new()));
        (Executor::new(registry.clone(), RuntimeConfig::default()), registry)
    }

    /// A module whose function `i` runs exactly `lengths[i]` instructions (at least 2) and returns `i`
    fn counting_module(lengths: &[usize]) -> Module {
        let mut module = Module::new("counting");
        for (index, &len) in lengths.iter().enumerate() {
            let value = module.add_number(index as f64);
            let mut function = Function::new(None, 0, false, 0);
            function.emit(OpCode::LdConst, value, 1);
            for _ in 2..len {
                function.emit(OpCode::Nop, 0, 1);
            }
            function.emit(OpCode::Ret, 0, 2);
            module.add_function(function);
        }
        module
    }

    fn function(id: ModuleId, index: u32) -> Value {
        Value::Function(FunctionValue::new(Closure {
            module: id,
            index,
            name: None,
            env: Environment::Module(id),
        }))
    }

    #[test]
    fn test_total_steps_equal_instruction_counts() {
        let (mut executor, registry) = setup();
        let lengths = [3, 2, 5, 2];
        let id = registry.borrow_mut().load(Rc::new(counting_module(&lengths)), None).unwrap();

        for index in 0..lengths.len() {
            executor.load_function(function(id, index as u32), Vec::new()).unwrap();
        }
        executor.execute().unwrap();

        assert_eq!(executor.step_count(), lengths.iter().sum::<usize>());
        assert!(executor.is_empty());
    }

    #[test]
    fn test_vms_finish_in_round_robin_order() {
        let (mut executor, registry) = setup();
        let id = registry.borrow_mut().load(Rc::new(counting_module(&[4, 2, 3])), None).unwrap();
        for index in 0..3 {
            executor.load_function(function(id, index), Vec::new()).unwrap();
        }
        executor.execute().unwrap();

        let finished: Vec<VmId> = executor.take_results().into_iter().map(|(id, _)| id).collect();
        assert_eq!(finished, vec![1, 2, 0]);
        assert!(executor.take_results().is_empty());
    }

    #[test]
    fn test_results_keep_each_vm_value() {
        let (mut executor, registry) = setup();
        let id = registry.borrow_mut().load(Rc::new(counting_module(&[2, 2])), None).unwrap();
        let first = executor.load_function(function(id, 0), Vec::new()).unwrap();
        let second = executor.load_function(function(id, 1), Vec::new()).unwrap();
        executor.execute().unwrap();

        let results = executor.take_results();
        assert_eq!(results[0].0, first);
        assert_eq!(results[0].1.as_number(), Some(0.0));
        assert_eq!(results[1].0, second);
        assert_eq!(results[1].1.as_number(), Some(1.0));
    }

    #[test]
    fn test_on_finish_hook_fires_per_vm() {
        let (mut executor, registry) = setup();
        let id = registry.borrow_mut().load(Rc::new(counting_module(&[2, 3])), None).unwrap();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let sink = seen.clone();
        executor.on_finish(move |vm, value| sink.borrow_mut().push((vm, value.to_string())));

        executor.load_function(function(id, 0), Vec::new()).unwrap();
        executor.load_function(function(id, 1), Vec::new()).unwrap();
        executor.execute().unwrap();

        assert_eq!(*seen.borrow(), vec![(0, "0".to_string()), (1, "1".to_string())]);
    }

    #[test]
    fn test_builtin_calls_finish_without_steps() {
        let (mut executor, _registry) = setup();
        let echo = BuiltinFunction::new("echo", |_vm, args| Ok(args.into_iter().next()));
        executor.load_function(Value::Builtin(echo), vec![Value::from("hi")]).unwrap();
        executor.execute().unwrap();

        assert_eq!(executor.step_count(), 0);
        assert_eq!(executor.take_results()[0].1.as_str(), Some("hi"));
    }

    #[test]
    fn test_uncaught_exception_surfaces_and_drops_vm() {
        let (mut executor, registry) = setup();
        let mut module = Module::new("failing");
        let message = module.add_string("boom");
        let mut good = Function::new(None, 0, false, 0);
        good.emit(OpCode::LdNull, 0, 1);
        good.emit(OpCode::LdNull, 0, 1);
        good.emit(OpCode::Ret, 0, 1);
        module.add_function(good);
        let mut bad = Function::new(None, 0, false, 0);
        bad.emit(OpCode::LdConst, message, 7);
        bad.emit(OpCode::Throw, 0, 8);
        module.add_function(bad);
        let id = registry.borrow_mut().load(Rc::new(module), None).unwrap();

        executor.load_function(function(id, 0), Vec::new()).unwrap();
        executor.load_function(function(id, 1), Vec::new()).unwrap();

        match executor.execute() {
            Err(RuntimeError::VMError(VMError::Uncaught(exception))) => {
                assert_eq!(exception.module, "failing");
                assert_eq!(exception.line, 8);
                assert_eq!(exception.value.as_str(), Some("boom"));
            }
            other => panic!("Expected uncaught exception, got {:?}", other),
        }
        assert_eq!(executor.len(), 1);

        executor.execute().unwrap();
        assert!(executor.is_empty());
    }

    #[test]
    fn test_vm_without_a_call_is_dropped() {
        let (mut executor, registry) = setup();
        let id = registry.borrow_mut().load(Rc::new(counting_module(&[2])), None).unwrap();
        let idle = executor.create_vm();
        executor.add_vm(idle);
        executor.load_function(function(id, 0), Vec::new()).unwrap();

        assert!(matches!(
            executor.execute(),
            Err(RuntimeError::VMError(VMError::MissingCallFrame))
        ));
        assert_eq!(executor.len(), 1);

        executor.execute().unwrap();
        assert!(executor.is_empty());
        assert_eq!(executor.take_results()[0].1.as_number(), Some(0.0));
    }

    #[test]
    fn test_raise_event_also_drives_previously_queued_vms() {
        let (mut executor, registry) = setup();
        let id = registry.borrow_mut().load(Rc::new(counting_module(&[3])), None).unwrap();
        let queued = executor.load_function(function(id, 0), Vec::new()).unwrap();

        let event = Event::new();
        event.attach(Value::Builtin(BuiltinFunction::new("noop", |_vm, _args| Ok(None))));
        let callbacks = executor.raise_event(&event, Vec::new()).unwrap();

        assert!(executor.is_empty());
        let finished: Vec<VmId> = executor.take_results().into_iter().map(|(id, _)| id).collect();
        assert!(finished.contains(&queued));
        assert!(finished.contains(&callbacks[0]));
    }

    #[test]
    fn test_raise_event_runs_callbacks_in_reverse() {
        let (mut executor, registry) = setup();
        let mut module = Module::new("listeners");
        module.add_variable(Some("log"), Visibility::Public);
        let id = registry.borrow_mut().load(Rc::new(module), None).unwrap();

        let event = Event::new();
        for tag in ["first", "second", "third"] {
            let registry = registry.clone();
            event.attach(Value::Builtin(BuiltinFunction::new(tag, move |_vm, args| {
                let mut registry = registry.borrow_mut();
                let previous = registry.get_public(id, "log")?.unwrap_or(Value::from(""));
                let entry = format!("{}{}({}) ", previous, tag, args[0]);
                registry.set_public(id, "log", Value::from(entry))?;
                Ok(None)
            })));
        }

        let ids = executor.raise_event(&event, vec![Value::Number(1.0)]).unwrap();
        assert_eq!(ids.len(), 3);
        let log = registry.borrow().get_public(id, "log").unwrap().unwrap();
        assert_eq!(log.as_str(), Some("third(1) second(1) first(1) "));
        assert!(!executor.resume_if_idle().unwrap());
    }
}
