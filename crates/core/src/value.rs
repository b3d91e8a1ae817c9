//! `TValue`: the tagged value shared by the parser's constant-folder and the
//! VM's arithmetic opcodes (spec §4.A).
//!
//! Numeric semantics, equality, and truthiness are specified once here so
//! that `aql-compiler`'s constant folding (`posfix` in spec §4.D) and
//! `aql-runtime`'s `ADD`/`SUB`/... opcodes can never disagree about what an
//! operation produces.

use std::cell::RefCell;
use std::rc::Rc;

use crate::closure::{CClosure, Closure};
use crate::containers::{ArrayObj, DictObj, RangeObj, SliceObj, VectorObj};
use crate::error::AqlError;
use crate::gc::{GcHeader, GcTag};
use crate::proto::Proto;
use crate::string::TString;
use crate::thread::Thread;

/// Host-defined opaque payload (spec §3: "userdata").
pub struct UserData {
    pub header: GcHeader,
    pub tag: &'static str,
    pub data: Box<dyn std::any::Any>,
}

impl UserData {
    pub fn new(tag: &'static str, data: Box<dyn std::any::Any>) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(UserData {
            header: GcHeader::new(GcTag::UserData),
            tag,
            data,
        }))
    }
}

/// The tagged value. Broad types per spec §3: nil, boolean, number
/// (int|float), string (short|long, unified in [`TString`]), function
/// (AQL-closure | C-closure | prototype), thread, userdata, array, slice,
/// dict, vector, range.
#[derive(Clone)]
pub enum Value {
    Nil,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(TString),
    Array(Rc<RefCell<ArrayObj>>),
    Slice(Rc<RefCell<SliceObj>>),
    Dict(Rc<RefCell<DictObj>>),
    Vector(Rc<RefCell<VectorObj>>),
    Range(Rc<RangeObj>),
    Closure(Rc<Closure>),
    CFunction(Rc<CClosure>),
    Proto(Rc<Proto>),
    Thread(Rc<RefCell<Thread>>),
    UserData(Rc<RefCell<UserData>>),
    LightUserData(usize),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Nil => "nil",
            Value::Bool(_) => "boolean",
            Value::Int(_) | Value::Float(_) => "number",
            Value::Str(_) => "string",
            Value::Array(_) => "array",
            Value::Slice(_) => "slice",
            Value::Dict(_) => "dict",
            Value::Vector(_) => "vector",
            Value::Range(_) => "range",
            Value::Closure(_) | Value::CFunction(_) | Value::Proto(_) => "function",
            Value::Thread(_) => "thread",
            Value::UserData(_) => "userdata",
            Value::LightUserData(_) => "userdata",
        }
    }

    /// Only `nil` and `false` are falsy; everything else (including `0` and
    /// `""`) is truthy, matching the Lua-family convention `TEST`/`TESTSET`
    /// rely on (spec §4.F).
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Nil | Value::Bool(false))
    }

    pub fn is_collectable(&self) -> bool {
        !matches!(
            self,
            Value::Nil | Value::Bool(_) | Value::Int(_) | Value::Float(_) | Value::LightUserData(_)
        )
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Int(_) | Value::Float(_))
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Float -> integer conversion succeeds only when the float is finite
    /// and has an exact integer value (spec §4.A).
    pub fn float_to_int_exact(f: f64) -> Option<i64> {
        if f.is_finite() && f.fract() == 0.0 && f >= -(2f64.powi(63)) && f < 2f64.powi(63) {
            Some(f as i64)
        } else {
            None
        }
    }

    /// Integer -> float conversion is exact up to 2^53 (spec §4.A).
    pub fn fits_exact_f64(i: i64) -> bool {
        const LIMIT: i64 = 1 << 53;
        (-LIMIT..=LIMIT).contains(&i)
    }
}

/// Numeric equality: `int 5 == float 5.0`.
fn numeric_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => x == y,
        (Value::Float(x), Value::Float(y)) => x == y,
        (Value::Int(x), Value::Float(y)) | (Value::Float(y), Value::Int(x)) => (*x as f64) == *y,
        _ => false,
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => numeric_eq(self, other),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Slice(a), Value::Slice(b)) => Rc::ptr_eq(a, b),
            (Value::Dict(a), Value::Dict(b)) => Rc::ptr_eq(a, b),
            (Value::Vector(a), Value::Vector(b)) => Rc::ptr_eq(a, b),
            (Value::Range(a), Value::Range(b)) => Rc::ptr_eq(a, b),
            (Value::Closure(a), Value::Closure(b)) => Rc::ptr_eq(a, b),
            (Value::CFunction(a), Value::CFunction(b)) => Rc::ptr_eq(a, b),
            (Value::Proto(a), Value::Proto(b)) => Rc::ptr_eq(a, b),
            (Value::Thread(a), Value::Thread(b)) => Rc::ptr_eq(a, b),
            (Value::UserData(a), Value::UserData(b)) => Rc::ptr_eq(a, b),
            (Value::LightUserData(a), Value::LightUserData(b)) => a == b,
            _ => false,
        }
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Array(_) => write!(f, "array: <object>"),
            Value::Slice(_) => write!(f, "slice: <object>"),
            Value::Dict(_) => write!(f, "dict: <object>"),
            Value::Vector(_) => write!(f, "vector: <object>"),
            Value::Range(_) => write!(f, "range: <object>"),
            Value::Closure(_) => write!(f, "function: <aql>"),
            Value::CFunction(_) => write!(f, "function: <builtin>"),
            Value::Proto(_) => write!(f, "prototype: <object>"),
            Value::Thread(_) => write!(f, "thread: <object>"),
            Value::UserData(_) => write!(f, "userdata: <object>"),
            Value::LightUserData(p) => write!(f, "userdata: 0x{p:x}"),
        }
    }
}

/// Result of coercing a binary-operand pair into a common numeric domain,
/// per spec §4.A: "Mixed int/float arithmetic promotes to float."
enum Promoted {
    Int(i64, i64),
    Float(f64, f64),
}

fn promote(a: &Value, b: &Value) -> Result<Promoted, AqlError> {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => Ok(Promoted::Int(*x, *y)),
        (Value::Float(_), _) | (_, Value::Float(_)) if a.is_number() && b.is_number() => {
            Ok(Promoted::Float(a.as_f64().unwrap(), b.as_f64().unwrap()))
        }
        _ => Err(AqlError::runtime(format!(
            "attempt to perform arithmetic on a {} value",
            if a.is_number() { b.type_name() } else { a.type_name() }
        ))),
    }
}

/// Floor division: `wrapping_div` truncates toward zero, so when the
/// remainder is nonzero and the operands' signs differ, correct the
/// quotient down by one to match the float path's `(a/b).floor()`.
pub fn checked_idiv(a: i64, b: i64) -> Result<i64, AqlError> {
    if b == 0 {
        return Err(AqlError::runtime("attempt to perform 'n//0'"));
    }
    let q = a.wrapping_div(b);
    let r = a.wrapping_rem(b);
    if r != 0 && (r ^ b) < 0 {
        Ok(q.wrapping_sub(1))
    } else {
        Ok(q)
    }
}

/// Floor modulo: result always carries the divisor's sign, matching the
/// float path's `a - (a/b).floor()*b`.
pub fn checked_imod(a: i64, b: i64) -> Result<i64, AqlError> {
    if b == 0 {
        return Err(AqlError::runtime("attempt to perform 'n%%0'"));
    }
    let r = a.wrapping_rem(b);
    if r != 0 && (r ^ b) < 0 {
        Ok(r.wrapping_add(b))
    } else {
        Ok(r)
    }
}

impl Value {
    pub fn add(&self, other: &Value) -> Result<Value, AqlError> {
        if let (Value::Str(a), Value::Str(b)) = (self, other) {
            return Ok(Value::Str(TString::owned(format!("{}{}", a.as_str(), b.as_str()))));
        }
        match promote(self, other)? {
            Promoted::Int(a, b) => Ok(Value::Int(a.wrapping_add(b))),
            Promoted::Float(a, b) => Ok(Value::Float(a + b)),
        }
    }

    pub fn sub(&self, other: &Value) -> Result<Value, AqlError> {
        match promote(self, other)? {
            Promoted::Int(a, b) => Ok(Value::Int(a.wrapping_sub(b))),
            Promoted::Float(a, b) => Ok(Value::Float(a - b)),
        }
    }

    pub fn mul(&self, other: &Value) -> Result<Value, AqlError> {
        match promote(self, other)? {
            Promoted::Int(a, b) => Ok(Value::Int(a.wrapping_mul(b))),
            Promoted::Float(a, b) => Ok(Value::Float(a * b)),
        }
    }

    /// `DIV` always produces a float (spec §4.F).
    pub fn div(&self, other: &Value) -> Result<Value, AqlError> {
        let a = self.as_f64().ok_or_else(|| AqlError::runtime("attempt to perform arithmetic on a non-number value"))?;
        let b = other.as_f64().ok_or_else(|| AqlError::runtime("attempt to perform arithmetic on a non-number value"))?;
        Ok(Value::Float(a / b))
    }

    /// Integer division (`//`), wraps per spec §4.A.
    pub fn idiv(&self, other: &Value) -> Result<Value, AqlError> {
        match promote(self, other)? {
            Promoted::Int(a, b) => Ok(Value::Int(checked_idiv(a, b)?)),
            Promoted::Float(a, b) => Ok(Value::Float((a / b).floor())),
        }
    }

    pub fn modulo(&self, other: &Value) -> Result<Value, AqlError> {
        match promote(self, other)? {
            Promoted::Int(a, b) => Ok(Value::Int(checked_imod(a, b)?)),
            Promoted::Float(a, b) => Ok(Value::Float(a - (a / b).floor() * b)),
        }
    }

    /// `POW` always produces a float (spec §4.F).
    pub fn pow(&self, other: &Value) -> Result<Value, AqlError> {
        let a = self.as_f64().ok_or_else(|| AqlError::runtime("attempt to perform arithmetic on a non-number value"))?;
        let b = other.as_f64().ok_or_else(|| AqlError::runtime("attempt to perform arithmetic on a non-number value"))?;
        Ok(Value::Float(a.powf(b)))
    }

    pub fn neg(&self) -> Result<Value, AqlError> {
        match self {
            Value::Int(i) => Ok(Value::Int(i.wrapping_neg())),
            Value::Float(f) => Ok(Value::Float(-f)),
            _ => Err(AqlError::runtime(format!("attempt to perform arithmetic on a {} value", self.type_name()))),
        }
    }

    fn as_int_for_bitop(&self) -> Result<i64, AqlError> {
        match self {
            Value::Int(i) => Ok(*i),
            Value::Float(f) => Value::float_to_int_exact(*f)
                .ok_or_else(|| AqlError::runtime("number has no integer representation")),
            _ => Err(AqlError::runtime(format!("attempt to perform bitwise operation on a {} value", self.type_name()))),
        }
    }

    pub fn band(&self, other: &Value) -> Result<Value, AqlError> {
        Ok(Value::Int(self.as_int_for_bitop()? & other.as_int_for_bitop()?))
    }
    pub fn bor(&self, other: &Value) -> Result<Value, AqlError> {
        Ok(Value::Int(self.as_int_for_bitop()? | other.as_int_for_bitop()?))
    }
    pub fn bxor(&self, other: &Value) -> Result<Value, AqlError> {
        Ok(Value::Int(self.as_int_for_bitop()? ^ other.as_int_for_bitop()?))
    }
    pub fn bnot(&self) -> Result<Value, AqlError> {
        Ok(Value::Int(!self.as_int_for_bitop()?))
    }
    pub fn shl(&self, other: &Value) -> Result<Value, AqlError> {
        let a = self.as_int_for_bitop()?;
        let b = other.as_int_for_bitop()?;
        Ok(Value::Int(shift(a, b)))
    }
    pub fn shr(&self, other: &Value) -> Result<Value, AqlError> {
        let a = self.as_int_for_bitop()?;
        let b = other.as_int_for_bitop()?;
        Ok(Value::Int(shift(a, -b)))
    }

    pub fn lt(&self, other: &Value) -> Result<bool, AqlError> {
        self.compare(other).map(|o| o == std::cmp::Ordering::Less)
    }
    pub fn le(&self, other: &Value) -> Result<bool, AqlError> {
        self.compare(other).map(|o| o != std::cmp::Ordering::Greater)
    }

    fn compare(&self, other: &Value) -> Result<std::cmp::Ordering, AqlError> {
        match (self, other) {
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                let a = self.as_f64().unwrap();
                let b = other.as_f64().unwrap();
                a.partial_cmp(&b).ok_or_else(|| AqlError::runtime("comparison with NaN"))
            }
            (Value::Str(a), Value::Str(b)) => Ok(a.as_str().cmp(b.as_str())),
            _ => Err(AqlError::runtime(format!(
                "attempt to compare {} with {}",
                self.type_name(),
                other.type_name()
            ))),
        }
    }

    /// `#` / `OP_LEN`.
    pub fn len(&self) -> Result<i64, AqlError> {
        match self {
            Value::Str(s) => Ok(s.len() as i64),
            Value::Array(a) => Ok(a.borrow().len() as i64),
            Value::Slice(s) => Ok(s.borrow().len() as i64),
            Value::Dict(d) => Ok(d.borrow().len() as i64),
            Value::Vector(v) => Ok(v.borrow().len() as i64),
            _ => Err(AqlError::runtime(format!("attempt to get length of a {} value", self.type_name()))),
        }
    }
}

/// Wrapping shift matching the original's `intop`-style modular semantics:
/// shifts by >= 64 (or <= -64) produce 0, negative `b` shifts the other way.
fn shift(a: i64, b: i64) -> i64 {
    if b <= -64 || b >= 64 {
        0
    } else if b >= 0 {
        ((a as u64) << b) as i64
    } else {
        ((a as u64) >> (-b)) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mixed_int_float_equality() {
        assert_eq!(Value::Int(5), Value::Float(5.0));
    }

    #[test]
    fn integer_add_wraps() {
        let a = Value::Int(i64::MAX);
        let b = Value::Int(1);
        assert_eq!(a.add(&b).unwrap(), Value::Int(i64::MIN));
    }

    #[test]
    fn div_always_float() {
        let a = Value::Int(10);
        let b = Value::Int(2);
        match a.div(&b).unwrap() {
            Value::Float(f) => assert_eq!(f, 5.0),
            _ => panic!("DIV must produce float"),
        }
    }

    #[test]
    fn idiv_by_zero_errors() {
        let a = Value::Int(1);
        let b = Value::Int(0);
        assert!(a.idiv(&b).is_err());
    }

    #[test]
    fn idiv_roundtrip_property() {
        for (a, b) in [(17i64, 5i64), (-17, 5), (17, -5), (-17, -5)] {
            let q = checked_idiv(a, b).unwrap();
            let r = checked_imod(a, b).unwrap();
            assert_eq!(q.wrapping_mul(b).wrapping_add(r), a);
        }
    }

    /// Cross-check against known floor-division results, not just
    /// self-consistency: truncating division would give `-7 // 2 == -3`,
    /// `-3 == -3` isn't the floor result of `-3 % 2`, etc.
    #[test]
    fn idiv_and_modulo_floor_toward_negative_infinity() {
        assert_eq!(checked_idiv(-7, 2).unwrap(), -4);
        assert_eq!(checked_imod(-7, 2).unwrap(), 1);
        assert_eq!(checked_idiv(7, -2).unwrap(), -4);
        assert_eq!(checked_imod(7, -2).unwrap(), -1);
        assert_eq!(checked_idiv(-7, -2).unwrap(), 3);
        assert_eq!(checked_imod(-7, -2).unwrap(), -1);
        assert_eq!(checked_idiv(5, 2).unwrap(), 2);
        assert_eq!(checked_imod(5, 2).unwrap(), 1);

        let float_result = Value::Float(-7.0).idiv(&Value::Float(2.0)).unwrap();
        assert_eq!(float_result, Value::Float(-4.0));
    }

    #[test]
    fn truthiness() {
        assert!(!Value::Nil.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(Value::Bool(true).is_truthy());
        assert!(Value::Int(0).is_truthy());
    }
}
