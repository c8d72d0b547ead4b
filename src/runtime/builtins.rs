//! Host functions every runtime exposes to scripts
//!
//! Builtins are public variables of the root `<host>` module, so script
//! modules reach them by declaring an external variable of the same name.

use std::rc::Rc;
use tracing::debug;
use crate::bytecode::{read_module, Module, Visibility};
use crate::vm::{BuiltinFunction, Fault, ModuleId, ModuleRegistry, ScriptError, VMResult, Value, VM};

type BuiltinResult = Result<Option<Value>, Fault>;

/// Register the default builtins on `host`
pub fn install_builtins(registry: &mut ModuleRegistry, host: ModuleId) -> VMResult<()> {
    let mut define = |name: &str, builtin: BuiltinFunction| {
        registry.define(host, name, Visibility::Public, Value::Builtin(builtin))
    };

    define("print", BuiltinFunction::new("print", print))?;
    define(
        "module_load",
        BuiltinFunction::new("module_load", move |vm, args| module_load(vm, args, host)),
    )?;
    define("module_unload", BuiltinFunction::new("module_unload", module_unload))?;
    define("module_get", BuiltinFunction::new("module_get", module_get))?;
    define("module_set", BuiltinFunction::new("module_set", module_set))?;
    Ok(())
}

fn host_error(message: String) -> Fault {
    ScriptError::Host(message).into()
}

fn string_arg<'a>(name: &str, args: &'a [Value], index: usize) -> Result<&'a str, Fault> {
    args.get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| host_error(format!("{} expects a string as argument {}", name, index + 1)))
}

fn handle_arg(vm: &VM, name: &str, args: &[Value]) -> Result<ModuleId, Fault> {
    let handle = args
        .first()
        .and_then(Value::as_number)
        .ok_or_else(|| host_error(format!("{} expects a module handle", name)))?;
    if handle < 0.0 || handle.fract() != 0.0 {
        return Err(host_error(format!("Invalid module handle {}", handle)));
    }
    let id = ModuleId::from_index(handle as usize);
    if !vm.registry().borrow().contains(id) {
        return Err(host_error(format!("Invalid module handle {}", handle)));
    }
    Ok(id)
}

fn print(_vm: &mut VM, args: Vec<Value>) -> BuiltinResult {
    let line = args.iter().map(Value::to_string).collect::<Vec<_>>().join(" ");
    println!("{}", line);
    Ok(None)
}

/// Load a module under `parent` and run its static initializer on a nested VM
///
/// The module is unloaded again if its initializer throws.
pub(crate) fn load_and_initialize(vm: &mut VM, module: Module, parent: Option<ModuleId>) -> Result<ModuleId, Fault> {
    let registry = vm.registry();
    let id = registry.borrow_mut().load(Rc::new(module), parent)?;
    let initializer = registry.borrow().static_initializer(id)?;

    if let Some(initializer) = initializer {
        if let Err(fault) = vm.invoke(Value::Function(initializer), Vec::new()) {
            registry.borrow_mut().unload(id)?;
            return Err(fault);
        }
    }
    Ok(id)
}

fn module_load(vm: &mut VM, args: Vec<Value>, host: ModuleId) -> BuiltinResult {
    let path = string_arg("module_load", &args, 0)?;
    let module = read_module(path)
        .map_err(|err| host_error(format!("Cannot load module '{}': {}", path, err)))?;
    let parent = vm.current_module().unwrap_or(host);
    let id = load_and_initialize(vm, module, Some(parent))?;
    debug!(path, id = %id, parent = %parent, "module_load");
    Ok(Some(Value::Number(id.index() as f64)))
}

fn module_unload(vm: &mut VM, args: Vec<Value>) -> BuiltinResult {
    let id = handle_arg(vm, "module_unload", &args)?;
    vm.registry().borrow_mut().unload(id)?;
    Ok(None)
}

fn module_get(vm: &mut VM, args: Vec<Value>) -> BuiltinResult {
    let id = handle_arg(vm, "module_get", &args)?;
    let name = string_arg("module_get", &args, 1)?;
    let registry = vm.registry();
    let registry = registry.borrow();
    match registry.get_public(id, name)? {
        Some(value) => Ok(Some(value)),
        None => Err(host_error(format!(
            "Module '{}' has no public variable '{}'",
            registry.name(id)?,
            name
        ))),
    }
}

fn module_set(vm: &mut VM, args: Vec<Value>) -> BuiltinResult {
    let id = handle_arg(vm, "module_set", &args)?;
    let name = string_arg("module_set", &args, 1)?;
    let value = args.get(2).cloned().unwrap_or(Value::Null);
    let registry = vm.registry();
    let mut registry = registry.borrow_mut();
    if registry.set_public(id, name, value)? {
        Ok(None)
    } else {
        Err(host_error(format!(
            "Module '{}' has no public variable '{}'",
            registry.name(id)?,
            name
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tempfile::tempdir;
    use crate::bytecode::{write_module, Function, OpCode};
    use crate::vm::VMError;

    type Registry = Rc<RefCell<ModuleRegistry>>;

    fn host() -> (Registry, ModuleId) {
        let registry: Registry = Rc::new(RefCell::new(ModuleRegistry::new()));
        let host = registry.borrow_mut().load(Rc::new(Module::new("<host>")), None).unwrap();
        install_builtins(&mut registry.borrow_mut(), host).unwrap();
        (registry, host)
    }

    fn call(registry: &Registry, host: ModuleId, name: &str, args: Vec<Value>) -> VMResult<Value> {
        let builtin = registry.borrow().get_public(host, name).unwrap().unwrap();
        let mut vm = VM::new(registry.clone());
        vm.begin_call(builtin, args)?;
        vm.run()
    }

    fn thrown(result: VMResult<Value>) -> String {
        match result {
            Err(VMError::Uncaught(exception)) => exception.value.to_string(),
            other => panic!("Expected a thrown error, got {:?}", other.map(|v| v.to_string())),
        }
    }

    #[test]
    fn test_builtins_are_public_on_host() {
        let (registry, host) = host();
        for name in ["print", "module_load", "module_unload", "module_get", "module_set"] {
            let value = registry.borrow().get_public(host, name).unwrap();
            assert!(matches!(value, Some(Value::Builtin(_))), "missing builtin {}", name);
        }
    }

    #[test]
    fn test_print_returns_null() {
        let (registry, host) = host();
        let result = call(&registry, host, "print", vec![Value::from("hello"), Value::Number(1.0)]);
        assert!(result.unwrap().is_null());
    }

    #[test]
    fn test_module_get_and_set() {
        let (registry, host) = host();
        registry.borrow_mut().define(host, "answer", Visibility::Public, Value::Number(1.0)).unwrap();

        let handle = Value::Number(host.index() as f64);
        let got = call(&registry, host, "module_get", vec![handle.clone(), Value::from("answer")]).unwrap();
        assert_eq!(got.as_number(), Some(1.0));

        call(&registry, host, "module_set", vec![handle.clone(), Value::from("answer"), Value::Number(2.0)]).unwrap();
        let got = call(&registry, host, "module_get", vec![handle, Value::from("answer")]).unwrap();
        assert_eq!(got.as_number(), Some(2.0));
    }

    #[test]
    fn test_bad_handles_and_names_throw() {
        let (registry, host) = host();
        let err = thrown(call(&registry, host, "module_get", vec![Value::Number(99.0), Value::from("x")]));
        assert_eq!(err, "Invalid module handle 99");

        let err = thrown(call(&registry, host, "module_get", vec![Value::Number(0.0), Value::from("nothing")]));
        assert_eq!(err, "Module '<host>' has no public variable 'nothing'");

        let err = thrown(call(&registry, host, "module_unload", vec![Value::from("0")]));
        assert_eq!(err, "module_unload expects a module handle");
    }

    #[test]
    fn test_module_load_runs_initializer_and_links_under_caller() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("child.blzm");

        let mut child = Module::new("child");
        let value = child.add_number(7.0);
        child.add_variable(Some("answer"), Visibility::Public);
        let mut init = Function::new(None, 0, false, 0);
        init.emit(OpCode::LdConst, value, 1);
        init.emit(OpCode::StVar, 0, 1);
        init.emit(OpCode::LdNull, 0, 2);
        init.emit(OpCode::Ret, 0, 2);
        child.add_function(init);
        write_module(&child, &path).unwrap();

        let (registry, host) = host();
        let path = Value::from(path.to_string_lossy().into_owned());
        let handle = call(&registry, host, "module_load", vec![path]).unwrap();
        let id = ModuleId::from_index(handle.as_number().unwrap() as usize);

        assert_eq!(registry.borrow().parent(id).unwrap(), Some(host));
        let answer = call(&registry, host, "module_get", vec![handle.clone(), Value::from("answer")]).unwrap();
        assert_eq!(answer.as_number(), Some(7.0));

        call(&registry, host, "module_unload", vec![handle]).unwrap();
        assert!(!registry.borrow().contains(id));
    }

    #[test]
    fn test_module_load_missing_file_throws() {
        let (registry, host) = host();
        let err = thrown(call(&registry, host, "module_load", vec![Value::from("/nonexistent/none.blzm")]));
        assert!(err.starts_with("Cannot load module '/nonexistent/none.blzm'"));
    }

    #[test]
    fn test_failed_initializer_unloads_module() {
        let mut module = Module::new("broken");
        let message = module.add_string("init failed");
        let mut init = Function::new(None, 0, false, 0);
        init.emit(OpCode::LdConst, message, 1);
        init.emit(OpCode::Throw, 0, 1);
        module.add_function(init);

        let (registry, host) = host();
        let mut vm = VM::new(registry.clone());
        match load_and_initialize(&mut vm, module, Some(host)) {
            Err(Fault::Throw(value)) => assert_eq!(value.as_str(), Some("init failed")),
            Err(Fault::Fatal(err)) => panic!("Unexpected fatal error: {}", err),
            Ok(id) => panic!("Expected failure, loaded {}", id),
        }
        assert!(registry.borrow().children(host).unwrap().is_empty());
    }
}
