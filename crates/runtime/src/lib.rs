//! VM executor, built-in dispatch, and embedding API for AQL (spec §4.F,
//! §6). Depends on `aql-core` for the value/stack/instruction model and on
//! `aql-compiler` for `aql_loadstring`/`aql_loadfile`.

pub mod api;
pub mod builtins;
pub mod diagnostics;
pub mod vm;

pub use api::{State, Status};
pub use vm::{ExecResult, Vm};
