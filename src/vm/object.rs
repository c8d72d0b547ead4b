//! Reference-counted payloads behind the non-primitive value variants

use std::cell::{Ref, RefCell};
use std::fmt;
use std::rc::Rc;
use crate::vm::environment::{ClassEnv, Environment};
use crate::vm::{Fault, ModuleId, Value, VM};

/// Ordered, mutable list shared by every value that refers to it
#[derive(Clone, Default)]
pub struct List(Rc<RefCell<Vec<Value>>>);

impl List {
    pub fn new(items: Vec<Value>) -> Self {
        Self(Rc::new(RefCell::new(items)))
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub fn get(&self, index: usize) -> Option<Value> {
        self.0.borrow().get(index).cloned()
    }

    pub fn set(&self, index: usize, value: Value) -> bool {
        match self.0.borrow_mut().get_mut(index) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn push(&self, value: Value) {
        self.0.borrow_mut().push(value);
    }

    pub fn items(&self) -> Ref<'_, Vec<Value>> {
        self.0.borrow()
    }

    /// Snapshot of the current elements
    pub fn to_vec(&self) -> Vec<Value> {
        self.0.borrow().clone()
    }

    pub fn ptr_eq(&self, other: &List) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Insertion-ordered map whose keys compare with `Value::value_equals`
#[derive(Clone, Default)]
pub struct Dictionary(Rc<RefCell<Vec<(Value, Value)>>>);

impl Dictionary {
    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    pub fn get(&self, key: &Value) -> Option<Value> {
        self.0
            .borrow()
            .iter()
            .find(|(k, _)| k.value_equals(key))
            .map(|(_, v)| v.clone())
    }

    pub fn insert(&self, key: Value, value: Value) {
        let mut entries = self.0.borrow_mut();
        match entries.iter_mut().find(|(k, _)| k.value_equals(&key)) {
            Some(entry) => entry.1 = value,
            None => entries.push((key, value)),
        }
    }

    pub fn entries(&self) -> Vec<(Value, Value)> {
        self.0.borrow().clone()
    }

    pub fn entry_at(&self, index: usize) -> Option<(Value, Value)> {
        self.0.borrow().get(index).cloned()
    }

    pub fn keys(&self) -> Vec<Value> {
        self.0.borrow().iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn values(&self) -> Vec<Value> {
        self.0.borrow().iter().map(|(_, v)| v.clone()).collect()
    }

    pub fn ptr_eq(&self, other: &Dictionary) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// A function body bound to the environment that was active when it was loaded
pub struct Closure {
    pub module: ModuleId,
    pub index: u32,
    pub name: Option<Rc<str>>,
    pub env: Environment,
}

#[derive(Clone)]
pub struct FunctionValue(Rc<Closure>);

impl FunctionValue {
    pub fn new(closure: Closure) -> Self {
        Self(Rc::new(closure))
    }

    pub fn closure(&self) -> &Closure {
        &self.0
    }

    pub fn module(&self) -> ModuleId {
        self.0.module
    }

    pub fn index(&self) -> u32 {
        self.0.index
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn env(&self) -> &Environment {
        &self.0.env
    }

    pub fn ptr_eq(&self, other: &FunctionValue) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Class blueprint bound to the environment that was active when it was loaded
pub struct ClassBlueprint {
    pub module: ModuleId,
    pub index: u32,
    pub name: Option<Rc<str>>,
    pub members: Vec<Rc<str>>,
    pub constructor: u32,
    pub env: Environment,
}

#[derive(Clone)]
pub struct ClassValue(Rc<ClassBlueprint>);

impl ClassValue {
    pub fn new(blueprint: ClassBlueprint) -> Self {
        Self(Rc::new(blueprint))
    }

    pub fn blueprint(&self) -> &ClassBlueprint {
        &self.0
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn ptr_eq(&self, other: &ClassValue) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// A constructed object: a handle to the class environment holding its members
#[derive(Clone)]
pub struct Instance(Rc<ClassEnv>);

impl Instance {
    /// Allocate an instance whose members all start as null
    pub fn allocate(class: &ClassValue) -> Self {
        Self(Rc::new(ClassEnv::new(class.clone())))
    }

    pub(crate) fn from_env(env: Rc<ClassEnv>) -> Self {
        Self(env)
    }

    pub fn class(&self) -> &ClassValue {
        self.0.class()
    }

    pub fn env(&self) -> &Rc<ClassEnv> {
        &self.0
    }

    pub fn member(&self, name: &str) -> Option<Value> {
        self.0.member(name)
    }

    pub fn ptr_eq(&self, other: &Instance) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Ordered list of callbacks fired together
#[derive(Clone, Default)]
pub struct Event(Rc<RefCell<Vec<Value>>>);

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attach(&self, callback: Value) {
        self.0.borrow_mut().push(callback);
    }

    pub fn len(&self) -> usize {
        self.0.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    /// Callbacks in the order they fire: most recently attached first
    pub fn raise_order(&self) -> Vec<Value> {
        self.0.borrow().iter().rev().cloned().collect()
    }

    pub fn ptr_eq(&self, other: &Event) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

enum IterSource {
    List(List),
    Dictionary(Dictionary),
    String(Vec<char>),
}

struct IterState {
    source: IterSource,
    position: usize,
}

/// Forward-only cursor over a list, dictionary or string
#[derive(Clone)]
pub struct ValueIterator(Rc<RefCell<IterState>>);

impl ValueIterator {
    fn with_source(source: IterSource) -> Self {
        Self(Rc::new(RefCell::new(IterState { source, position: 0 })))
    }

    pub fn over_list(list: List) -> Self {
        Self::with_source(IterSource::List(list))
    }

    pub fn over_dictionary(dict: Dictionary) -> Self {
        Self::with_source(IterSource::Dictionary(dict))
    }

    pub fn over_string(s: &str) -> Self {
        Self::with_source(IterSource::String(s.chars().collect()))
    }

    pub fn available(&self) -> bool {
        let state = self.0.borrow();
        let len = match &state.source {
            IterSource::List(list) => list.len(),
            IterSource::Dictionary(dict) => dict.len(),
            IterSource::String(chars) => chars.len(),
        };
        state.position < len
    }

    /// Yield the element under the cursor and advance past it
    pub fn next_value(&self) -> Option<Value> {
        let mut state = self.0.borrow_mut();
        let position = state.position;
        let item = match &state.source {
            IterSource::List(list) => list.get(position),
            IterSource::Dictionary(dict) => dict
                .entry_at(position)
                .map(|(k, v)| Value::List(List::new(vec![k, v]))),
            IterSource::String(chars) => chars.get(position).map(|c| Value::from(c.to_string())),
        };
        if item.is_some() {
            state.position += 1;
        }
        item
    }

    pub fn ptr_eq(&self, other: &ValueIterator) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

/// Host callback signature: the live VM and the call arguments in order
pub type BuiltinFn = dyn Fn(&mut VM, Vec<Value>) -> Result<Option<Value>, Fault>;

pub struct Builtin {
    name: Rc<str>,
    func: Box<BuiltinFn>,
}

#[derive(Clone)]
pub struct BuiltinFunction(Rc<Builtin>);

impl BuiltinFunction {
    pub fn new<F>(name: &str, func: F) -> Self
    where
        F: Fn(&mut VM, Vec<Value>) -> Result<Option<Value>, Fault> + 'static,
    {
        Self(Rc::new(Builtin {
            name: Rc::from(name),
            func: Box::new(func),
        }))
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn invoke(&self, vm: &mut VM, args: Vec<Value>) -> Result<Option<Value>, Fault> {
        (self.0.func)(vm, args)
    }

    pub fn ptr_eq(&self, other: &BuiltinFunction) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for BuiltinFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BuiltinFunction({})", self.0.name)
    }
}
