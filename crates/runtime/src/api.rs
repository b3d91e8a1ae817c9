//! Embedding API (spec §6): `aql_newstate`, `aql_loadstring`/`aql_loadfile`,
//! and the `aql_execute`/protected-call entry point, collected behind a
//! single `State` handle the way the teacher's crates expose one top-level
//! handle per subsystem rather than a scattering of free functions.

use std::fs;
use std::path::Path;
use std::rc::Rc;

use aql_core::{Closure, DictObj, NativeFn, RuntimeConfig, Thread, UpVal, Value};
pub use aql_core::Status;

use crate::vm::{ExecResult, Vm};

/// One AQL interpreter instance: global state, a main thread, and the host
/// builtin table. Cloning a `State` isn't supported -- construct a new one
/// or share a `&State` the way the teacher shares its top-level handles.
pub struct State {
    vm: Vm,
}

impl State {
    pub fn new() -> Self {
        State { vm: Vm::new() }
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        State { vm: Vm::with_config(config) }
    }

    /// Install a host function under a `BUILTIN` id (>= 6; 0-5 are the
    /// fixed `print/len/type/tostring/tonumber/range` table).
    pub fn register_builtin(&mut self, id: u16, f: NativeFn) {
        self.vm.register_builtin(id, f);
    }

    /// The shared global table (`_ENV`'s contents). Exposed so an embedder
    /// can seed globals before running a chunk.
    pub fn globals(&self) -> Rc<std::cell::RefCell<DictObj>> {
        Rc::clone(&self.vm.global.borrow().globals)
    }

    pub fn set_global(&self, name: &str, value: Value) -> Result<(), aql_core::AqlError> {
        let key = self.vm.global.borrow_mut().strings.intern(name);
        let globals = self.globals();
        let result = globals.borrow_mut().set(Value::Str(key), value);
        result
    }

    pub fn get_global(&self, name: &str) -> Result<Value, aql_core::AqlError> {
        let key = self.vm.global.borrow_mut().strings.intern(name);
        let globals = self.globals();
        let result = globals.borrow().get(Value::Str(key));
        result
    }

    /// `aql_loadstring`: compile `source` into a top-level closure whose
    /// sole upvalue (`_ENV`) is bound to this state's global table.
    pub fn load_string(&self, source_name: impl Into<String>, source: &str) -> Result<Rc<Closure>, aql_core::AqlError> {
        let proto = aql_compiler::compile(source_name, source)?;
        self.wrap_chunk(proto)
    }

    /// `aql_loadfile`: read `path` and compile it, using the path itself as
    /// the chunk's source name for error messages.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<Rc<Closure>, aql_core::AqlError> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)
            .map_err(|e| aql_core::AqlError::runtime(format!("cannot open {}: {e}", path.display())))?;
        self.load_string(path.display().to_string(), &source)
    }

    fn wrap_chunk(&self, proto: aql_core::Proto) -> Result<Rc<Closure>, aql_core::AqlError> {
        let env = UpVal::new_closed(Value::Dict(self.globals()));
        Ok(Closure::new(Rc::new(proto), vec![env]))
    }

    /// `aql_execute` / the `aqlD_pcall`-equivalent protected call (spec §7):
    /// runs `closure` on this state's main thread, rolling the thread back
    /// to its pre-call checkpoint if it errors.
    pub fn execute(&self, closure: Rc<Closure>, args: &[Value]) -> Result<Vec<Value>, aql_core::AqlError> {
        let thread = Rc::clone(&self.vm.main_thread);
        Thread::protected_call(&thread, || match self.vm.call(Rc::clone(&closure), args)? {
            ExecResult::Return(vals) | ExecResult::Yield(vals) => Ok(vals),
        })
    }

    /// Compile and run `source` in one step, discarding anything but its
    /// return values -- the common case for a script-driven embedder.
    pub fn run_string(&self, source_name: impl Into<String>, source: &str) -> Result<Vec<Value>, aql_core::AqlError> {
        let closure = self.load_string(source_name, source)?;
        self.execute(closure, &[])
    }

    pub fn spawn_thread(&self) -> Rc<std::cell::RefCell<Thread>> {
        self.vm.spawn_thread()
    }
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runs_a_return_statement() {
        let state = State::new();
        let result = state.run_string("test", "return 1 + 2").unwrap();
        assert_eq!(result, vec![Value::Int(3)]);
    }

    #[test]
    fn globals_round_trip() {
        let state = State::new();
        state.set_global("x", Value::Int(42)).unwrap();
        let result = state.run_string("test", "return x").unwrap();
        assert_eq!(result, vec![Value::Int(42)]);
    }

    #[test]
    fn runtime_error_unwinds_without_poisoning_the_state() {
        let state = State::new();
        assert!(state.run_string("bad", "return nil + 1").is_err());
        // The main thread's checkpoint was restored; a fresh chunk still runs.
        let result = state.run_string("good", "return 1").unwrap();
        assert_eq!(result, vec![Value::Int(1)]);
    }
}
