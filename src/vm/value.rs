use std::fmt;
use std::rc::Rc;
use crate::vm::capability::{BinaryOperable, Callable, Constructible, HasProperties, Indexable, Iterable};
use crate::vm::object::{
    BuiltinFunction, ClassValue, Dictionary, Event, FunctionValue, Instance, List, ValueIterator,
};

/// Nesting depth after which container display is elided
const DISPLAY_DEPTH: usize = 16;

/// Represents a value in the VM
///
/// Containers and callables are reference handles; cloning a value never
/// copies the underlying list, dictionary or instance.
#[derive(Clone)]
pub enum Value {
    Null,
    Boolean(bool),
    Number(f64),
    String(Rc<str>),
    List(List),
    Dictionary(Dictionary),
    Function(FunctionValue),
    Builtin(BuiltinFunction),
    Class(ClassValue),
    Instance(Instance),
    Event(Event),
    Iterator(ValueIterator),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Boolean(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::List(_) => "list",
            Value::Dictionary(_) => "dictionary",
            Value::Function(_) => "function",
            Value::Builtin(_) => "builtin",
            Value::Class(_) => "class",
            Value::Instance(_) => "instance",
            Value::Event(_) => "event",
            Value::Iterator(_) => "iterator",
        }
    }

    pub fn to_display_string(&self) -> String {
        self.to_string()
    }

    /// Checks if the value is truthy (used in conditionals)
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Boolean(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }

    /// Primitive values compare by content, everything else by identity
    pub fn value_equals(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::List(a), Value::List(b)) => a.ptr_eq(b),
            (Value::Dictionary(a), Value::Dictionary(b)) => a.ptr_eq(b),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            (Value::Builtin(a), Value::Builtin(b)) => a.ptr_eq(b),
            (Value::Class(a), Value::Class(b)) => a.ptr_eq(b),
            (Value::Instance(a), Value::Instance(b)) => a.ptr_eq(b),
            (Value::Event(a), Value::Event(b)) => a.ptr_eq(b),
            (Value::Iterator(a), Value::Iterator(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// Shallow copy; every variant shares its identity with the original
    pub fn duplicate(&self) -> Value {
        self.clone()
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_indexable(&self) -> Option<&dyn Indexable> {
        match self {
            Value::String(s) => Some(s),
            Value::List(l) => Some(l),
            Value::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_properties(&self) -> Option<&dyn HasProperties> {
        match self {
            Value::String(s) => Some(s),
            Value::List(l) => Some(l),
            Value::Dictionary(d) => Some(d),
            Value::Instance(i) => Some(i),
            Value::Iterator(it) => Some(it),
            _ => None,
        }
    }

    pub fn as_iterable(&self) -> Option<&dyn Iterable> {
        match self {
            Value::String(s) => Some(s),
            Value::List(l) => Some(l),
            Value::Dictionary(d) => Some(d),
            _ => None,
        }
    }

    pub fn as_operable(&self) -> Option<&dyn BinaryOperable> {
        match self {
            Value::Number(n) => Some(n),
            Value::String(s) => Some(s),
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_callable(&self) -> Option<&dyn Callable> {
        match self {
            Value::Function(f) => Some(f),
            Value::Builtin(b) => Some(b),
            Value::Event(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_constructible(&self) -> Option<&dyn Constructible> {
        match self {
            Value::Class(c) => Some(c),
            _ => None,
        }
    }

    fn fmt_nested(&self, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
        match self {
            Value::String(s) if depth > 0 => write!(f, "\"{}\"", s),
            Value::List(list) => {
                if depth >= DISPLAY_DEPTH {
                    return write!(f, "[...]");
                }
                write!(f, "[")?;
                for (i, item) in list.to_vec().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    item.fmt_nested(f, depth + 1)?;
                }
                write!(f, "]")
            }
            Value::Dictionary(dict) => {
                if depth >= DISPLAY_DEPTH {
                    return write!(f, "{{...}}");
                }
                write!(f, "{{")?;
                for (i, (key, value)) in dict.entries().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    key.fmt_nested(f, depth + 1)?;
                    write!(f, ": ")?;
                    value.fmt_nested(f, depth + 1)?;
                }
                write!(f, "}}")
            }
            other => other.fmt_scalar(f),
        }
    }

    fn fmt_scalar(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::String(s) => write!(f, "{}", s),
            Value::Function(func) => match func.name() {
                Some(name) => write!(f, "<function {}>", name),
                None => write!(f, "<function>"),
            },
            Value::Builtin(builtin) => write!(f, "<builtin {}>", builtin.name()),
            Value::Class(class) => match class.name() {
                Some(name) => write!(f, "<class {}>", name),
                None => write!(f, "<class>"),
            },
            Value::Instance(instance) => match instance.class().name() {
                Some(name) => write!(f, "<{} instance>", name),
                None => write!(f, "<instance>"),
            },
            Value::Event(event) => write!(f, "<event with {} callback(s)>", event.len()),
            Value::Iterator(_) => write!(f, "<iterator>"),
            Value::List(_) | Value::Dictionary(_) => self.fmt_nested(f, 0),
        }
    }
}

/// Integral values print without a fraction; non-finite values use script spelling
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        if n > 0.0 { "Infinity".to_string() } else { "-Infinity".to_string() }
    } else if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.fmt_nested(f, 0)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.type_name())?;
        self.fmt_nested(f, 1)?;
        write!(f, ")")
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(Rc::from(s))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(Rc::from(s))
    }
}

impl From<Rc<str>> for Value {
    fn from(s: Rc<str>) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(List::new(items))
    }
}
