//! Function prototype: the immutable artifact the parser builds and the VM
//! executes (spec §3 "Function prototype (Proto)").

use crate::opcodes::Instruction;
use crate::value::Value;

/// One upvalue descriptor, per spec §3: name, source, kind.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UpvalDesc {
    pub name: String,
    /// `true`: captures a register of the *enclosing* function's frame.
    /// `false`: captures one of the enclosing function's own upvalues.
    pub in_stack: bool,
    /// Register index (if `in_stack`) or upvalue index (otherwise) in the
    /// enclosing function.
    pub idx: u8,
}

/// Local-variable debug descriptor (spec §3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LocVar {
    pub name: String,
    pub start_pc: u32,
    pub end_pc: u32,
}

/// A compile-time constant. A restricted view of [`Value`] containing only
/// what `addk` (spec §4.D) can fold: nil/bool/int/float/string. Container
/// and function values are never constant-table entries.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub enum Constant {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Constant {
    pub fn to_value(&self, strings: &mut crate::string::StringTable) -> Value {
        match self {
            Constant::Nil => Value::Nil,
            Constant::Bool(b) => Value::Bool(*b),
            Constant::Int(i) => Value::Int(*i),
            Constant::Float(f) => Value::Float(*f),
            Constant::Str(s) => Value::Str(strings.intern(s)),
        }
    }
}

/// Immutable after its emitting function closes (spec §3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Proto {
    pub code: Vec<Instruction>,
    pub constants: Vec<Constant>,
    /// Nested prototypes, indexed by `CLOSURE`'s `Bx` argument.
    pub protos: Vec<Proto>,
    pub upvalues: Vec<UpvalDesc>,
    pub locals: Vec<LocVar>,
    /// Parallel to `code`: the source line each instruction was emitted
    /// from, for error messages.
    pub line_info: Vec<u32>,
    pub numparams: u8,
    pub is_vararg: bool,
    pub maxstacksize: u8,
    pub source: String,
    /// 1-based line the function definition begins on.
    pub line_defined: u32,
}

impl Proto {
    pub fn new(source: impl Into<String>) -> Self {
        Proto {
            code: Vec::new(),
            constants: Vec::new(),
            protos: Vec::new(),
            upvalues: Vec::new(),
            locals: Vec::new(),
            line_info: Vec::new(),
            numparams: 0,
            is_vararg: false,
            maxstacksize: 2,
            source: source.into(),
            line_defined: 0,
        }
    }

    /// Serialize to the precompiled bytecode format's body encoding
    /// (spec §6). The 12-byte header with the magic signature and
    /// endianness/size sentinels is written by [`crate::config::dump_header`];
    /// this only covers one recursively-nested prototype body.
    pub fn to_bytes(&self) -> Result<Vec<u8>, crate::error::AqlError> {
        bincode::serialize(self).map_err(|e| crate::error::AqlError::runtime(format!("bytecode serialize: {e}")))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, crate::error::AqlError> {
        bincode::deserialize(bytes).map_err(|e| crate::error::AqlError::runtime(format!("bytecode deserialize: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_through_bincode() {
        let mut p = Proto::new("test");
        p.constants.push(Constant::Int(42));
        p.code.push(Instruction::iabc(crate::opcodes::OpCode::RET_VOID, 0, 0, 0, false));
        let bytes = p.to_bytes().unwrap();
        let back = Proto::from_bytes(&bytes).unwrap();
        assert_eq!(back.constants, p.constants);
        assert_eq!(back.code.len(), 1);
    }
}
