//! Optional behaviours implemented by selected value variants
//!
//! The interpreter asks a value for a capability through the `Value::as_*`
//! accessors and reports a typed script error when the variant lacks it.

use std::rc::Rc;
use crate::vm::object::{BuiltinFunction, ClassValue, Dictionary, Event, FunctionValue, Instance, List, ValueIterator};
use crate::vm::value::format_number;
use crate::vm::{Fault, ScriptError, Value, VM};

pub trait Indexable {
    fn get_at(&self, index: &Value) -> Result<Value, ScriptError>;
    fn set_at(&self, index: &Value, value: Value) -> Result<(), ScriptError>;
}

pub trait HasProperties {
    fn get_property(&self, name: &str) -> Result<Value, ScriptError>;
    fn set_property(&self, name: &str, value: Value) -> Result<(), ScriptError>;
}

pub trait Iterable {
    fn make_iterator(&self) -> ValueIterator;
}

/// Longest string a repetition may produce, in bytes
pub const MAX_REPEAT_LEN: usize = 1 << 28;

/// Arithmetic and ordering with the receiver as left operand
///
/// `Ok(None)` means the right operand's type is not supported.
pub trait BinaryOperable {
    fn add(&self, _rhs: &Value) -> Result<Option<Value>, ScriptError> {
        Ok(None)
    }

    fn subtract(&self, _rhs: &Value) -> Result<Option<Value>, ScriptError> {
        Ok(None)
    }

    fn multiply(&self, _rhs: &Value) -> Result<Option<Value>, ScriptError> {
        Ok(None)
    }

    fn divide(&self, _rhs: &Value) -> Result<Option<Value>, ScriptError> {
        Ok(None)
    }

    fn less_than(&self, _rhs: &Value) -> Result<Option<Value>, ScriptError> {
        Ok(None)
    }

    fn less_than_or_equal(&self, _rhs: &Value) -> Result<Option<Value>, ScriptError> {
        Ok(None)
    }
}

/// Invoked by `CALL`; acts on the VM instead of returning a value directly
pub trait Callable {
    fn call(&self, vm: &mut VM, args: Vec<Value>) -> Result<(), Fault>;
}

/// Invoked by `NEW`; leaves the new instance on the stack once the constructor returns
pub trait Constructible {
    fn construct(&self, vm: &mut VM, args: Vec<Value>) -> Result<(), Fault>;
}

fn element_index(target: &'static str, index: &Value, len: usize) -> Result<usize, ScriptError> {
    let n = match index {
        Value::Number(n) => *n,
        other => {
            return Err(ScriptError::IndexKind { target, index: other.type_name() });
        }
    };
    if n.fract() != 0.0 {
        return Err(ScriptError::IndexKind { target, index: "fractional number" });
    }
    if n < 0.0 || n >= len as f64 {
        return Err(ScriptError::IndexOutOfBounds { index: n as i64, len });
    }
    Ok(n as usize)
}

fn not_found(kind: &'static str, name: &str) -> ScriptError {
    ScriptError::PropertyNotFound { kind, name: name.to_string() }
}

fn read_only(kind: &'static str, name: &str) -> ScriptError {
    ScriptError::ReadOnlyProperty { kind, name: name.to_string() }
}

impl Indexable for Rc<str> {
    fn get_at(&self, index: &Value) -> Result<Value, ScriptError> {
        let len = self.chars().count();
        let position = element_index("string", index, len)?;
        let ch = self.chars().nth(position).map(String::from).unwrap_or_default();
        Ok(Value::from(ch))
    }

    fn set_at(&self, index: &Value, _value: Value) -> Result<(), ScriptError> {
        Err(read_only("string", &index.to_string()))
    }
}

impl HasProperties for Rc<str> {
    fn get_property(&self, name: &str) -> Result<Value, ScriptError> {
        match name {
            "length" => Ok(Value::Number(self.chars().count() as f64)),
            _ => Err(not_found("string", name)),
        }
    }

    fn set_property(&self, name: &str, _value: Value) -> Result<(), ScriptError> {
        match name {
            "length" => Err(read_only("string", name)),
            _ => Err(not_found("string", name)),
        }
    }
}

impl Iterable for Rc<str> {
    fn make_iterator(&self) -> ValueIterator {
        ValueIterator::over_string(self)
    }
}

impl BinaryOperable for Rc<str> {
    fn add(&self, rhs: &Value) -> Result<Option<Value>, ScriptError> {
        Ok(match rhs {
            Value::String(s) => Some(Value::from(format!("{}{}", self, s))),
            Value::Number(n) => Some(Value::from(format!("{}{}", self, format_number(*n)))),
            _ => None,
        })
    }

    fn multiply(&self, rhs: &Value) -> Result<Option<Value>, ScriptError> {
        let n = match rhs {
            Value::Number(n) if n.is_finite() => *n,
            _ => return Ok(None),
        };
        if n < 1.0 || self.is_empty() {
            return Ok(Some(Value::from("")));
        }
        let count = n.trunc();
        if self.len() as f64 * count > MAX_REPEAT_LEN as f64 {
            return Err(ScriptError::RepeatTooLarge(MAX_REPEAT_LEN));
        }
        Ok(Some(Value::from(self.repeat(count as usize))))
    }

    fn less_than(&self, rhs: &Value) -> Result<Option<Value>, ScriptError> {
        Ok(rhs.as_str().map(|s| Value::Boolean(&**self < s)))
    }

    fn less_than_or_equal(&self, rhs: &Value) -> Result<Option<Value>, ScriptError> {
        Ok(rhs.as_str().map(|s| Value::Boolean(&**self <= s)))
    }
}

impl BinaryOperable for f64 {
    fn add(&self, rhs: &Value) -> Result<Option<Value>, ScriptError> {
        Ok(rhs.as_number().map(|n| Value::Number(self + n)))
    }

    fn subtract(&self, rhs: &Value) -> Result<Option<Value>, ScriptError> {
        Ok(rhs.as_number().map(|n| Value::Number(self - n)))
    }

    fn multiply(&self, rhs: &Value) -> Result<Option<Value>, ScriptError> {
        Ok(rhs.as_number().map(|n| Value::Number(self * n)))
    }

    // IEEE-754 division: a zero divisor yields an infinity or NaN
    fn divide(&self, rhs: &Value) -> Result<Option<Value>, ScriptError> {
        Ok(rhs.as_number().map(|n| Value::Number(self / n)))
    }

    fn less_than(&self, rhs: &Value) -> Result<Option<Value>, ScriptError> {
        Ok(rhs.as_number().map(|n| Value::Boolean(*self < n)))
    }

    fn less_than_or_equal(&self, rhs: &Value) -> Result<Option<Value>, ScriptError> {
        Ok(rhs.as_number().map(|n| Value::Boolean(*self <= n)))
    }
}

impl Indexable for List {
    fn get_at(&self, index: &Value) -> Result<Value, ScriptError> {
        let position = element_index("list", index, self.len())?;
        Ok(self.get(position).unwrap_or(Value::Null))
    }

    fn set_at(&self, index: &Value, value: Value) -> Result<(), ScriptError> {
        let position = element_index("list", index, self.len())?;
        self.set(position, value);
        Ok(())
    }
}

impl HasProperties for List {
    fn get_property(&self, name: &str) -> Result<Value, ScriptError> {
        match name {
            "length" => Ok(Value::Number(self.len() as f64)),
            _ => Err(not_found("list", name)),
        }
    }

    fn set_property(&self, name: &str, _value: Value) -> Result<(), ScriptError> {
        match name {
            "length" => Err(read_only("list", name)),
            _ => Err(not_found("list", name)),
        }
    }
}

impl Iterable for List {
    fn make_iterator(&self) -> ValueIterator {
        ValueIterator::over_list(self.clone())
    }
}

impl BinaryOperable for List {
    fn add(&self, rhs: &Value) -> Result<Option<Value>, ScriptError> {
        Ok(match rhs {
            Value::List(other) => {
                let mut items = self.to_vec();
                items.extend(other.to_vec());
                Some(Value::List(List::new(items)))
            }
            _ => None,
        })
    }
}

impl Indexable for Dictionary {
    fn get_at(&self, index: &Value) -> Result<Value, ScriptError> {
        self.get(index)
            .ok_or_else(|| ScriptError::KeyNotFound(index.to_string()))
    }

    fn set_at(&self, index: &Value, value: Value) -> Result<(), ScriptError> {
        self.insert(index.clone(), value);
        Ok(())
    }
}

/// Computed properties shadow string keys of the same name
impl HasProperties for Dictionary {
    fn get_property(&self, name: &str) -> Result<Value, ScriptError> {
        match name {
            "length" => Ok(Value::Number(self.len() as f64)),
            "keys" => Ok(Value::List(List::new(self.keys()))),
            "values" => Ok(Value::List(List::new(self.values()))),
            _ => self
                .get(&Value::from(name))
                .ok_or_else(|| not_found("dictionary", name)),
        }
    }

    fn set_property(&self, name: &str, value: Value) -> Result<(), ScriptError> {
        match name {
            "length" | "keys" | "values" => Err(read_only("dictionary", name)),
            _ => {
                self.insert(Value::from(name), value);
                Ok(())
            }
        }
    }
}

impl Iterable for Dictionary {
    fn make_iterator(&self) -> ValueIterator {
        ValueIterator::over_dictionary(self.clone())
    }
}

impl HasProperties for Instance {
    fn get_property(&self, name: &str) -> Result<Value, ScriptError> {
        self.member(name).ok_or_else(|| not_found("instance", name))
    }

    fn set_property(&self, name: &str, value: Value) -> Result<(), ScriptError> {
        if self.env().set_member(name, value) {
            Ok(())
        } else {
            Err(not_found("instance", name))
        }
    }
}

impl HasProperties for ValueIterator {
    fn get_property(&self, name: &str) -> Result<Value, ScriptError> {
        match name {
            "next" => self.next_value().ok_or(ScriptError::IteratorExhausted),
            "available" => Ok(Value::Boolean(self.available())),
            _ => Err(not_found("iterator", name)),
        }
    }

    fn set_property(&self, name: &str, _value: Value) -> Result<(), ScriptError> {
        match name {
            "next" | "available" => Err(read_only("iterator", name)),
            _ => Err(not_found("iterator", name)),
        }
    }
}

impl Callable for FunctionValue {
    fn call(&self, vm: &mut VM, args: Vec<Value>) -> Result<(), Fault> {
        vm.enter_function(self, args, false)
    }
}

impl Callable for BuiltinFunction {
    fn call(&self, vm: &mut VM, args: Vec<Value>) -> Result<(), Fault> {
        let result = self.invoke(vm, args)?;
        vm.push(result.unwrap_or(Value::Null));
        Ok(())
    }
}

impl Callable for Event {
    fn call(&self, vm: &mut VM, args: Vec<Value>) -> Result<(), Fault> {
        vm.raise_event(self, args)
    }
}

impl Constructible for ClassValue {
    fn construct(&self, vm: &mut VM, args: Vec<Value>) -> Result<(), Fault> {
        vm.construct(self, args)
    }
}
