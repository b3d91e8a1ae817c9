//! Hash map from arbitrary hashable value to value (spec §3).
//!
//! Lua-family languages normalize a float key with an exact integer value
//! to its integer form before hashing, so `d[1]` and `d[1.0]` name the same
//! slot; this implementation follows that convention since spec §4.A
//! already requires `int 5 == float 5.0` for value equality, and a dict
//! whose key equality didn't match its `Hash` impl would violate the
//! `HashMap` contract.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

use crate::error::AqlError;
use crate::gc::{GcHeader, GcTag};
use crate::value::Value;

/// A hashable, normalized dict key.
#[derive(Clone)]
pub struct DictKey(Value);

fn identity_addr(v: &Value) -> usize {
    match v {
        Value::Array(r) => Rc::as_ptr(r) as usize,
        Value::Slice(r) => Rc::as_ptr(r) as usize,
        Value::Dict(r) => Rc::as_ptr(r) as usize,
        Value::Vector(r) => Rc::as_ptr(r) as usize,
        Value::Range(r) => Rc::as_ptr(r) as usize,
        Value::Closure(r) => Rc::as_ptr(r) as usize,
        Value::CFunction(r) => Rc::as_ptr(r) as usize,
        Value::Proto(r) => Rc::as_ptr(r) as usize,
        Value::Thread(r) => Rc::as_ptr(r) as usize,
        Value::UserData(r) => Rc::as_ptr(r) as usize,
        Value::LightUserData(p) => *p,
        _ => 0,
    }
}

impl DictKey {
    pub fn new(v: Value) -> Result<Self, AqlError> {
        let normalized = match v {
            Value::Float(f) => match Value::float_to_int_exact(f) {
                Some(i) => Value::Int(i),
                None if f.is_nan() => return Err(AqlError::runtime("dict key is NaN")),
                None => Value::Float(f),
            },
            Value::Nil => return Err(AqlError::runtime("dict key is nil")),
            other => other,
        };
        Ok(DictKey(normalized))
    }

    pub fn value(&self) -> &Value {
        &self.0
    }
}

impl PartialEq for DictKey {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}
impl Eq for DictKey {}

impl Hash for DictKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match &self.0 {
            Value::Nil => 0u8.hash(state),
            Value::Bool(b) => {
                1u8.hash(state);
                b.hash(state);
            }
            Value::Int(i) => {
                2u8.hash(state);
                i.hash(state);
            }
            Value::Float(f) => {
                2u8.hash(state);
                f.to_bits().hash(state);
            }
            Value::Str(s) => {
                3u8.hash(state);
                s.hash_value().hash(state);
            }
            other => {
                4u8.hash(state);
                identity_addr(other).hash(state);
            }
        }
    }
}

pub struct DictObj {
    pub header: GcHeader,
    map: HashMap<DictKey, Value>,
    /// Randomized so iteration order (and, incidentally, hash-flood
    /// resistance) doesn't leak across runs; matches the spirit of the
    /// original's table hash seed.
    _seed: u64,
}

impl DictObj {
    pub fn new() -> Self {
        use rand::Rng;
        DictObj {
            header: GcHeader::new(GcTag::Dict),
            map: HashMap::new(),
            _seed: rand::thread_rng().gen(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, key: Value) -> Result<Value, AqlError> {
        let key = DictKey::new(key)?;
        Ok(self.map.get(&key).cloned().unwrap_or(Value::Nil))
    }

    pub fn set(&mut self, key: Value, value: Value) -> Result<(), AqlError> {
        let key = DictKey::new(key)?;
        if matches!(value, Value::Nil) {
            self.map.remove(&key);
        } else {
            self.map.insert(key, value);
        }
        Ok(())
    }

    pub fn contains(&self, key: Value) -> Result<bool, AqlError> {
        let key = DictKey::new(key)?;
        Ok(self.map.contains_key(&key))
    }

    pub fn keys(&self) -> impl Iterator<Item = &Value> {
        self.map.keys().map(|k| k.value())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.map.iter().map(|(k, v)| (k.value(), v))
    }
}

impl Default for DictObj {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_and_float_key_share_slot() {
        let mut d = DictObj::new();
        d.set(Value::Int(1), Value::Str(crate::string::StringTable::new().intern("a"))).unwrap();
        assert_eq!(d.get(Value::Float(1.0)).unwrap().type_name(), "string");
    }

    #[test]
    fn nil_value_removes_key() {
        let mut d = DictObj::new();
        d.set(Value::Int(1), Value::Int(2)).unwrap();
        d.set(Value::Int(1), Value::Nil).unwrap();
        assert!(!d.contains(Value::Int(1)).unwrap());
    }
}
