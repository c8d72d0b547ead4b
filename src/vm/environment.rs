//! Lexical environment chain
//!
//! Every function or class value captures the environment that was active
//! when it was loaded. Frames reach outer locals by walking `parent` links,
//! so a captured chain outlives the call that created it.

use std::cell::RefCell;
use std::rc::Rc;
use rustc_hash::FxHashMap;
use crate::vm::object::{ClassValue, Instance};
use crate::vm::{ModuleId, VMError, VMResult, Value};

#[derive(Clone)]
pub enum Environment {
    Module(ModuleId),
    Function(Rc<FuncEnv>),
    Class(Rc<ClassEnv>),
}

impl Environment {
    pub fn parent(&self) -> Option<&Environment> {
        match self {
            Environment::Module(_) => None,
            Environment::Function(env) => Some(&env.parent),
            Environment::Class(env) => Some(&env.parent),
        }
    }

    /// Walk `uplevel` parent links
    pub fn ancestor(&self, uplevel: u32) -> Option<&Environment> {
        let mut env = self;
        for _ in 0..uplevel {
            env = env.parent()?;
        }
        Some(env)
    }

    /// The module at the root of this chain
    pub fn module(&self) -> ModuleId {
        let mut env = self;
        loop {
            match env {
                Environment::Module(id) => return *id,
                Environment::Function(f) => env = &f.parent,
                Environment::Class(c) => env = &c.parent,
            }
        }
    }

    /// Closest enclosing class environment, used for `this`
    pub fn nearest_class(&self) -> Option<&Rc<ClassEnv>> {
        let mut env = self;
        loop {
            match env {
                Environment::Class(class) => return Some(class),
                Environment::Function(f) => env = &f.parent,
                Environment::Module(_) => return None,
            }
        }
    }

    fn function_at(&self, uplevel: u32) -> VMResult<&Rc<FuncEnv>> {
        match self.ancestor(uplevel) {
            Some(Environment::Function(env)) => Ok(env),
            Some(_) => Err(VMError::InvalidEnvironment(format!(
                "uplevel {} does not name a function scope",
                uplevel
            ))),
            None => Err(VMError::InvalidEnvironment(format!(
                "uplevel {} exceeds the closure depth",
                uplevel
            ))),
        }
    }

    pub fn load_local(&self, uplevel: u32, slot: usize) -> VMResult<Value> {
        self.function_at(uplevel)?.local(slot)
    }

    pub fn store_local(&self, uplevel: u32, slot: usize, value: Value) -> VMResult<()> {
        self.function_at(uplevel)?.set_local(slot, value)
    }

    pub fn load_arg(&self, index: usize) -> VMResult<Value> {
        Ok(self.function_at(0)?.arg(index))
    }

    pub fn store_arg(&self, index: usize, value: Value) -> VMResult<()> {
        self.function_at(0)?.set_arg(index, value);
        Ok(())
    }

    /// Resolve a named member against class scopes, innermost first
    pub fn find_member(&self, name: &str) -> Option<Value> {
        let mut env = Some(self);
        while let Some(current) = env {
            if let Environment::Class(class) = current {
                if let Some(value) = class.member(name) {
                    return Some(value);
                }
            }
            env = current.parent();
        }
        None
    }

    /// Assign a named member on the innermost class scope declaring it
    pub fn assign_member(&self, name: &str, value: Value) -> Result<(), Value> {
        let mut env = Some(self);
        while let Some(current) = env {
            if let Environment::Class(class) = current {
                if class.has_member(name) {
                    class.set_member(name, value);
                    return Ok(());
                }
            }
            env = current.parent();
        }
        Err(value)
    }
}

/// One activation of a function
pub struct FuncEnv {
    args: RefCell<Vec<Value>>,
    locals: RefCell<Vec<Value>>,
    parent: Environment,
}

impl FuncEnv {
    pub fn new(args: Vec<Value>, local_count: usize, parent: Environment) -> Self {
        Self {
            args: RefCell::new(args),
            locals: RefCell::new(vec![Value::Null; local_count]),
            parent,
        }
    }

    /// Arguments the caller did not pass read as null
    pub fn arg(&self, index: usize) -> Value {
        self.args.borrow().get(index).cloned().unwrap_or(Value::Null)
    }

    pub fn set_arg(&self, index: usize, value: Value) {
        let mut args = self.args.borrow_mut();
        if index >= args.len() {
            args.resize(index + 1, Value::Null);
        }
        args[index] = value;
    }

    pub fn arg_count(&self) -> usize {
        self.args.borrow().len()
    }

    pub fn local(&self, slot: usize) -> VMResult<Value> {
        self.locals
            .borrow()
            .get(slot)
            .cloned()
            .ok_or(VMError::InvalidLocalIndex(slot as u32))
    }

    pub fn set_local(&self, slot: usize, value: Value) -> VMResult<()> {
        match self.locals.borrow_mut().get_mut(slot) {
            Some(local) => {
                *local = value;
                Ok(())
            }
            None => Err(VMError::InvalidLocalIndex(slot as u32)),
        }
    }

    pub fn parent(&self) -> &Environment {
        &self.parent
    }
}

/// Member storage of one class instance
///
/// The environment is the instance itself: `this` inside any closure created
/// under it resolves to this environment, for as long as the closure lives.
pub struct ClassEnv {
    class: ClassValue,
    members: RefCell<FxHashMap<Rc<str>, Value>>,
    parent: Environment,
}

impl ClassEnv {
    /// Fresh member storage for `class`, every declared member null
    pub fn new(class: ClassValue) -> Self {
        let blueprint = class.blueprint();
        let members = blueprint
            .members
            .iter()
            .map(|name| (name.clone(), Value::Null))
            .collect();
        let parent = blueprint.env.clone();
        Self {
            class,
            members: RefCell::new(members),
            parent,
        }
    }

    pub fn class(&self) -> &ClassValue {
        &self.class
    }

    pub fn member(&self, name: &str) -> Option<Value> {
        self.members.borrow().get(name).cloned()
    }

    pub fn has_member(&self, name: &str) -> bool {
        self.members.borrow().contains_key(name)
    }

    /// Overwrite a declared member; undeclared names are rejected
    pub fn set_member(&self, name: &str, value: Value) -> bool {
        match self.members.borrow_mut().get_mut(name) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    /// A new handle to the instance this environment stores
    pub fn instance(self: &Rc<Self>) -> Instance {
        Instance::from_env(self.clone())
    }

    pub fn parent(&self) -> &Environment {
        &self.parent
    }
}
