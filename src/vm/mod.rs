mod capability;
mod environment;
mod error;
mod execution_context;
mod interpreter;
mod module_env;
mod object;
mod value;

pub use capability::{BinaryOperable, Callable, Constructible, HasProperties, Indexable, Iterable, MAX_REPEAT_LEN};
pub use environment::{ClassEnv, Environment, FuncEnv};
pub use error::{Fault, ScriptError, ScriptException, VMError, VMResult};
pub use execution_context::{ExceptionHandler, ExecutionContext};
pub use interpreter::{VmState, DEFAULT_MAX_CALL_DEPTH, VM};
pub use module_env::{ModuleEnv, ModuleId, ModuleRegistry, VariableSlot};
pub use object::{
    BuiltinFn, BuiltinFunction, ClassBlueprint, ClassValue, Closure, Dictionary, Event, FunctionValue, Instance,
    List, ValueIterator,
};
pub use value::{format_number, Value};
