//! Loaded module instances and cross-module variable resolution
//!
//! Modules live in an arena indexed by `ModuleId`. Parent and child links are
//! plain ids, so the tree carries no reference cycles and an unloaded slot is
//! simply emptied.

use std::fmt;
use std::rc::Rc;
use rustc_hash::FxHashMap;
use tracing::debug;
use crate::bytecode::{Constant, Module, Visibility};
use crate::vm::environment::Environment;
use crate::vm::object::{Closure, FunctionValue};
use crate::vm::{Fault, ScriptError, VMError, VMResult, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleId(usize);

impl ModuleId {
    pub fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone)]
pub struct VariableSlot {
    pub name: Option<Rc<str>>,
    pub visibility: Visibility,
    pub value: Value,
}

/// One loaded instance of a `Module`
pub struct ModuleEnv {
    pub id: ModuleId,
    pub module: Rc<Module>,
    pub name: Rc<str>,
    pub constants: Rc<[Value]>,
    slots: Vec<VariableSlot>,
    names: FxHashMap<Rc<str>, usize>,
    parent: Option<ModuleId>,
    children: Vec<ModuleId>,
}

impl ModuleEnv {
    fn new(id: ModuleId, module: Rc<Module>, parent: Option<ModuleId>) -> Self {
        let constants: Rc<[Value]> = module
            .constants
            .iter()
            .map(|constant| match constant {
                Constant::Number(n) => Value::Number(*n),
                Constant::String(s) => Value::from(s.as_str()),
            })
            .collect();

        let mut env = Self {
            id,
            name: Rc::from(module.name.as_str()),
            constants,
            slots: Vec::with_capacity(module.variables.len()),
            names: FxHashMap::default(),
            parent,
            children: Vec::new(),
            module: module.clone(),
        };
        for variable in &module.variables {
            let name = variable
                .name
                .and_then(|index| module.constant_str(index))
                .map(Rc::from);
            env.push_slot(name, variable.visibility, Value::Null);
        }
        env
    }

    fn push_slot(&mut self, name: Option<Rc<str>>, visibility: Visibility, value: Value) -> usize {
        let index = self.slots.len();
        if let Some(name) = &name {
            self.names.insert(name.clone(), index);
        }
        self.slots.push(VariableSlot { name, visibility, value });
        index
    }

    pub fn slot(&self, index: usize) -> Option<&VariableSlot> {
        self.slots.get(index)
    }

    pub fn slot_index(&self, name: &str) -> Option<usize> {
        self.names.get(name).copied()
    }

    pub fn parent(&self) -> Option<ModuleId> {
        self.parent
    }

    pub fn children(&self) -> &[ModuleId] {
        &self.children
    }

    fn public_slot(&self, name: &str) -> Option<usize> {
        self.slot_index(name)
            .filter(|&index| self.slots[index].visibility == Visibility::Public)
    }
}

/// Arena of every module loaded into one runtime
#[derive(Default)]
pub struct ModuleRegistry {
    modules: Vec<Option<ModuleEnv>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Materialize a module and link it under `parent`
    pub fn load(&mut self, module: Rc<Module>, parent: Option<ModuleId>) -> VMResult<ModuleId> {
        if let Some(parent) = parent {
            self.get(parent)?;
        }
        let id = ModuleId(self.modules.len());
        let env = ModuleEnv::new(id, module, parent);
        debug!(module = %env.name, id = %id, parent = ?parent, "loaded module");
        self.modules.push(Some(env));
        if let Some(parent) = parent {
            self.get_mut(parent)?.children.push(id);
        }
        Ok(id)
    }

    /// Unlink a module from its parent and drop it with its whole subtree
    pub fn unload(&mut self, id: ModuleId) -> VMResult<()> {
        let parent = self.get(id)?.parent;
        if let Some(parent) = parent {
            if let Ok(env) = self.get_mut(parent) {
                env.children.retain(|&child| child != id);
            }
        }

        let mut pending = vec![id];
        while let Some(next) = pending.pop() {
            if let Some(env) = self.modules.get_mut(next.0).and_then(Option::take) {
                debug!(module = %env.name, id = %next, "unloaded module");
                pending.extend(env.children);
            }
        }
        Ok(())
    }

    pub fn contains(&self, id: ModuleId) -> bool {
        matches!(self.modules.get(id.0), Some(Some(_)))
    }

    pub fn get(&self, id: ModuleId) -> VMResult<&ModuleEnv> {
        self.modules
            .get(id.0)
            .and_then(Option::as_ref)
            .ok_or(VMError::UnknownModule(id))
    }

    pub fn get_mut(&mut self, id: ModuleId) -> VMResult<&mut ModuleEnv> {
        self.modules
            .get_mut(id.0)
            .and_then(Option::as_mut)
            .ok_or(VMError::UnknownModule(id))
    }

    pub fn module(&self, id: ModuleId) -> VMResult<Rc<Module>> {
        Ok(self.get(id)?.module.clone())
    }

    pub fn constants(&self, id: ModuleId) -> VMResult<Rc<[Value]>> {
        Ok(self.get(id)?.constants.clone())
    }

    pub fn name(&self, id: ModuleId) -> VMResult<Rc<str>> {
        Ok(self.get(id)?.name.clone())
    }

    pub fn parent(&self, id: ModuleId) -> VMResult<Option<ModuleId>> {
        Ok(self.get(id)?.parent)
    }

    pub fn children(&self, id: ModuleId) -> VMResult<Vec<ModuleId>> {
        Ok(self.get(id)?.children.clone())
    }

    /// Declare a named variable at runtime, replacing an existing declaration
    pub fn define(&mut self, id: ModuleId, name: &str, visibility: Visibility, value: Value) -> VMResult<()> {
        let env = self.get_mut(id)?;
        match env.slot_index(name) {
            Some(index) => {
                let slot = &mut env.slots[index];
                slot.visibility = visibility;
                slot.value = value;
            }
            None => {
                env.push_slot(Some(Rc::from(name)), visibility, value);
            }
        }
        Ok(())
    }

    /// Find the slot that backs variable `index` of module `id`
    ///
    /// Private and public variables back themselves; an external variable is
    /// resolved by name through the module tree.
    pub fn resolve_slot(&self, id: ModuleId, index: u32) -> VMResult<Option<(ModuleId, usize)>> {
        let env = self.get(id)?;
        let slot = env
            .slot(index as usize)
            .ok_or(VMError::InvalidVariableIndex(index))?;
        match (slot.visibility, &slot.name) {
            (Visibility::External, Some(name)) => Ok(self.resolve_external(id, name)),
            (Visibility::External, None) => Ok(None),
            _ => Ok(Some((id, index as usize))),
        }
    }

    /// Resolve a variable by name as seen from inside module `id`
    pub fn resolve_name(&self, id: ModuleId, name: &str) -> VMResult<Option<(ModuleId, usize)>> {
        match self.get(id)?.slot_index(name) {
            Some(index) => self.resolve_slot(id, index as u32),
            None => Ok(None),
        }
    }

    /// Children first, depth-first; then each ancestor, skipping the branch
    /// the search came from
    pub fn resolve_external(&self, id: ModuleId, name: &str) -> Option<(ModuleId, usize)> {
        let env = self.get(id).ok()?;
        for &child in &env.children {
            if let Some(found) = self.find_public(child, name, None) {
                return Some(found);
            }
        }

        let mut from = id;
        let mut current = env.parent;
        while let Some(parent) = current {
            if let Some(found) = self.find_public(parent, name, Some(from)) {
                return Some(found);
            }
            from = parent;
            current = self.get(parent).ok()?.parent;
        }
        None
    }

    fn find_public(&self, id: ModuleId, name: &str, exclude: Option<ModuleId>) -> Option<(ModuleId, usize)> {
        let env = self.get(id).ok()?;
        if let Some(index) = env.public_slot(name) {
            return Some((id, index));
        }
        env.children
            .iter()
            .filter(|&&child| Some(child) != exclude)
            .find_map(|&child| self.find_public(child, name, None))
    }

    pub fn load_named(&self, id: ModuleId, name: &str) -> VMResult<Option<Value>> {
        match self.resolve_name(id, name)? {
            Some((owner, slot)) => Ok(Some(self.get(owner)?.slots[slot].value.clone())),
            None => Ok(None),
        }
    }

    pub fn store_named(&mut self, id: ModuleId, name: &str, value: Value) -> VMResult<bool> {
        match self.resolve_name(id, name)? {
            Some((owner, slot)) => {
                self.get_mut(owner)?.slots[slot].value = value;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn undefined(&self, id: ModuleId, index: u32) -> Fault {
        let name = self
            .get(id)
            .ok()
            .and_then(|env| env.slot(index as usize))
            .and_then(|slot| slot.name.as_deref())
            .unwrap_or("<anonymous>")
            .to_string();
        ScriptError::UndefinedVariable(name).into()
    }

    pub fn load_variable(&self, id: ModuleId, index: u32) -> Result<Value, Fault> {
        match self.resolve_slot(id, index)? {
            Some((owner, slot)) => Ok(self.get(owner)?.slots[slot].value.clone()),
            None => Err(self.undefined(id, index)),
        }
    }

    pub fn store_variable(&mut self, id: ModuleId, index: u32, value: Value) -> Result<(), Fault> {
        match self.resolve_slot(id, index)? {
            Some((owner, slot)) => {
                self.get_mut(owner)?.slots[slot].value = value;
                Ok(())
            }
            None => Err(self.undefined(id, index)),
        }
    }

    /// Read a public variable of a module from outside
    pub fn get_public(&self, id: ModuleId, name: &str) -> VMResult<Option<Value>> {
        let env = self.get(id)?;
        Ok(env.public_slot(name).map(|index| env.slots[index].value.clone()))
    }

    pub fn set_public(&mut self, id: ModuleId, name: &str, value: Value) -> VMResult<bool> {
        let env = self.get_mut(id)?;
        match env.public_slot(name) {
            Some(index) => {
                env.slots[index].value = value;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Function 0 closed over the module scope
    pub fn static_initializer(&self, id: ModuleId) -> VMResult<Option<FunctionValue>> {
        let env = self.get(id)?;
        if env.module.functions.is_empty() {
            return Ok(None);
        }
        Ok(Some(FunctionValue::new(Closure {
            module: id,
            index: 0,
            name: env.module.function_name(0).map(Rc::from),
            env: Environment::Module(id),
        })))
    }

    pub fn len(&self) -> usize {
        self.modules.iter().filter(|m| m.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
