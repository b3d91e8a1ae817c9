//! Runtime configuration and host extension points.
//!
//! Mirrors the teacher's `CompilerConfig` builder pattern: a host embeds
//! `aql-runtime` by constructing one [`RuntimeConfig`], optionally loading
//! overrides from a TOML file, and registering additional builtins before
//! the first `State` comes up.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::AqlError;
use crate::stack::{DEFAULT_MAX_STACK, EXTRA_STACK};
use crate::string::SHORT_STRING_LIMIT;

/// A host-provided extension to `OP_BUILTIN`'s fixed table. The name is
/// what source code calls; `id` is the stable `BuiltinId` the compiler
/// bakes into bytecode, so renaming a host builtin never invalidates
/// already-compiled chunks as long as the id stays put.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredBuiltin {
    pub name: String,
    pub id: u16,
}

impl RegisteredBuiltin {
    pub fn new(name: impl Into<String>, id: u16) -> Self {
        RegisteredBuiltin { name: name.into(), id }
    }
}

/// Tunables for one interpreter instance (spec §4.B stack ceiling, §3
/// short-string limit, §4.F GC debt granularity).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Ceiling a thread's stack may grow to (`AQL_MAXSTACK`).
    pub max_stack: usize,
    /// Slots reserved past the ceiling for error recovery (`EXTRA_STACK`).
    pub extra_stack: usize,
    /// Strings at or under this byte length are interned by identity.
    pub short_string_limit: usize,
    /// Bytes allocated between successive GC-debt checks.
    pub gc_step_size: u64,
    /// Host builtins layered on top of the fixed table
    /// (`print, len, type, tostring, tonumber, range`).
    pub extra_builtins: Vec<RegisteredBuiltin>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            max_stack: DEFAULT_MAX_STACK,
            extra_stack: EXTRA_STACK,
            short_string_limit: SHORT_STRING_LIMIT,
            gc_step_size: 64 * 1024,
            extra_builtins: Vec::new(),
        }
    }
}

impl RuntimeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_stack(mut self, max_stack: usize) -> Self {
        self.max_stack = max_stack;
        self
    }

    pub fn with_gc_step_size(mut self, bytes: u64) -> Self {
        self.gc_step_size = bytes;
        self
    }

    /// Builder-pattern registration (spec §6 `register_builtin` hook),
    /// matching the teacher's `with_builtin`.
    pub fn register_builtin(mut self, builtin: RegisteredBuiltin) -> Self {
        self.extra_builtins.push(builtin);
        self
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, AqlError> {
        toml::from_str(contents).map_err(|e| AqlError::runtime(format!("invalid runtime config: {e}")))
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, AqlError> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| AqlError::runtime(format!("reading runtime config: {e}")))?;
        Self::from_toml_str(&contents)
    }
}

/// 4-byte signature, version, and format identifying a precompiled chunk
/// (spec §6 "Precompiled bytecode format").
pub const BYTECODE_SIGNATURE: [u8; 4] = *b"\x1bAQL";
pub const BYTECODE_VERSION: u8 = 1;
pub const BYTECODE_FORMAT: u8 = 0;
const INT_TEST_VALUE: i64 = 0x5678;
const FLOAT_TEST_VALUE: f64 = 370.5;

/// Write the fixed 12-byte-plus-test-values header a precompiled chunk
/// begins with. One recursively-nested [`crate::proto::Proto`] body
/// (written by `Proto::to_bytes`) follows immediately after.
pub fn dump_header(out: &mut Vec<u8>) {
    out.extend_from_slice(&BYTECODE_SIGNATURE);
    out.push(BYTECODE_VERSION);
    out.push(BYTECODE_FORMAT);
    out.push(std::mem::size_of::<i32>() as u8);
    out.push(std::mem::size_of::<usize>() as u8);
    out.push(std::mem::size_of::<u32>() as u8);
    out.push(std::mem::size_of::<i64>() as u8);
    out.push(std::mem::size_of::<f64>() as u8);
    out.push(if cfg!(target_endian = "little") { 0 } else { 1 });
    out.extend_from_slice(&INT_TEST_VALUE.to_le_bytes());
    out.extend_from_slice(&FLOAT_TEST_VALUE.to_le_bytes());
}

/// Validate a chunk's header against this build's expectations, returning
/// the number of bytes consumed.
pub fn check_header(data: &[u8]) -> Result<usize, AqlError> {
    let mut header = Vec::new();
    dump_header(&mut header);
    if data.len() < header.len() {
        return Err(AqlError::runtime("truncated precompiled chunk header"));
    }
    if data[..header.len()] != header[..] {
        return Err(AqlError::runtime("precompiled chunk header mismatch"));
    }
    Ok(header.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_stack_module_constants() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.max_stack, DEFAULT_MAX_STACK);
        assert_eq!(cfg.extra_stack, EXTRA_STACK);
        assert_eq!(cfg.short_string_limit, SHORT_STRING_LIMIT);
    }

    #[test]
    fn builder_registers_builtins() {
        let cfg = RuntimeConfig::new()
            .with_max_stack(1000)
            .register_builtin(RegisteredBuiltin::new("json_encode", 100));
        assert_eq!(cfg.max_stack, 1000);
        assert_eq!(cfg.extra_builtins.len(), 1);
        assert_eq!(cfg.extra_builtins[0].name, "json_encode");
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = RuntimeConfig::new().with_max_stack(2048);
        let text = toml::to_string(&cfg).unwrap();
        let back = RuntimeConfig::from_toml_str(&text).unwrap();
        assert_eq!(back.max_stack, 2048);
    }

    #[test]
    fn header_roundtrip_checks_out() {
        let mut buf = Vec::new();
        dump_header(&mut buf);
        let consumed = check_header(&buf).unwrap();
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn header_rejects_truncated_input() {
        assert!(check_header(&[0x1b, b'A']).is_err());
    }
}
