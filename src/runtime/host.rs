//! Host-facing entry point tying the registry, builtins and VMs together

use std::cell::RefCell;
use std::path::Path;
use std::rc::Rc;
use tracing::debug;
use crate::bytecode::{read_module, Module, Visibility};
use crate::runtime::{install_builtins, Executor, RuntimeConfig, RuntimeError, RuntimeResult};
use crate::vm::{BuiltinFunction, Fault, ModuleId, ModuleRegistry, Value, VM};

/// Public function run by `execute_file` after the module initializes
const ENTRY_POINT: &str = "main";

/// The Blaze runtime
///
/// Owns the module tree. Its root is the `<host>` module that carries every
/// builtin, and script modules loaded through the runtime hang below it.
pub struct Runtime {
    config: RuntimeConfig,
    registry: Rc<RefCell<ModuleRegistry>>,
    host: ModuleId,
}

impl Runtime {
    /// Create a new runtime with default configuration
    pub fn new() -> RuntimeResult<Self> {
        Self::with_config(RuntimeConfig::default())
    }

    /// Create a new runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> RuntimeResult<Self> {
        if config.max_call_depth == 0 {
            return Err(RuntimeError::ConfigError("max_call_depth must be at least 1".to_string()));
        }

        let registry = Rc::new(RefCell::new(ModuleRegistry::new()));
        let host = registry.borrow_mut().load(Rc::new(Module::new("<host>")), None)?;
        install_builtins(&mut registry.borrow_mut(), host)?;

        Ok(Self { config, registry, host })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn registry(&self) -> Rc<RefCell<ModuleRegistry>> {
        self.registry.clone()
    }

    /// The root module holding the builtins
    pub fn host(&self) -> ModuleId {
        self.host
    }

    /// Expose a native function to every module as a public host variable
    pub fn register_builtin<F>(&self, name: &str, func: F) -> RuntimeResult<()>
    where
        F: Fn(&mut VM, Vec<Value>) -> Result<Option<Value>, Fault> + 'static,
    {
        let builtin = BuiltinFunction::new(name, func);
        self.registry
            .borrow_mut()
            .define(self.host, name, Visibility::Public, Value::Builtin(builtin))?;
        Ok(())
    }

    fn vm(&self) -> VM {
        let mut vm = VM::new(self.registry.clone());
        vm.set_stack_trace(self.config.stack_trace);
        vm.set_max_call_depth(self.config.max_call_depth);
        vm
    }

    /// Load a module below the host and run its static initializer
    pub fn load_module(&self, module: Module) -> RuntimeResult<ModuleId> {
        self.load_module_under(module, self.host)
    }

    /// Load a module below `parent` and run its static initializer
    ///
    /// A module whose initializer fails is unloaded before the error is returned.
    pub fn load_module_under(&self, module: Module, parent: ModuleId) -> RuntimeResult<ModuleId> {
        if self.config.debug_mode {
            debug!(
                module = %module.name,
                constants = module.constants.len(),
                variables = module.variables.len(),
                functions = module.functions.len(),
                classes = module.classes.len(),
                "loaded module"
            );
        }

        let id = self.registry.borrow_mut().load(Rc::new(module), Some(parent))?;
        let initializer = self.registry.borrow().static_initializer(id)?;

        if let Some(initializer) = initializer {
            let mut vm = self.vm();
            let result = vm.begin_call(Value::Function(initializer), Vec::new()).and_then(|()| vm.run());
            if let Err(err) = result {
                self.registry.borrow_mut().unload(id)?;
                return Err(err.into());
            }
        }
        Ok(id)
    }

    /// Read a compiled module from disk and load it below the host
    pub fn load_file<P: AsRef<Path>>(&self, path: P) -> RuntimeResult<ModuleId> {
        let module = read_module(path)?;
        self.load_module(module)
    }

    /// Load a compiled module and run its public `main` function if it has one
    ///
    /// Returns `main`'s result, or null for a module without one.
    pub fn execute_file<P: AsRef<Path>>(&self, path: P) -> RuntimeResult<Value> {
        let id = self.load_file(path)?;
        let entry = self.registry.borrow().get_public(id, ENTRY_POINT)?;
        match entry {
            Some(entry) => self.invoke(entry, Vec::new()),
            None => Ok(Value::Null),
        }
    }

    /// Call the public function `name` of a loaded module to completion
    pub fn call(&self, module: ModuleId, name: &str, args: Vec<Value>) -> RuntimeResult<Value> {
        let callee = self.registry.borrow().get_public(module, name)?;
        match callee {
            Some(callee) => self.invoke(callee, args),
            None => Err(RuntimeError::MissingExport {
                module: self.registry.borrow().name(module)?.to_string(),
                name: name.to_string(),
            }),
        }
    }

    fn invoke(&self, callee: Value, args: Vec<Value>) -> RuntimeResult<Value> {
        let mut vm = self.vm();
        vm.begin_call(callee, args)?;
        Ok(vm.run()?)
    }

    /// Unlink a module and everything it loaded
    pub fn unload(&self, id: ModuleId) -> RuntimeResult<()> {
        if id == self.host {
            return Err(RuntimeError::ConfigError("the host module cannot be unloaded".to_string()));
        }
        self.registry.borrow_mut().unload(id)?;
        Ok(())
    }

    /// A scheduler sharing this runtime's modules and configuration
    pub fn executor(&self) -> Executor {
        Executor::new(self.registry.clone(), self.config.clone())
    }
}
