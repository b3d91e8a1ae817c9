//! A view over an [`ArrayObj`]: `(base-array, offset, length, capacity)`.
//! Does not own storage (spec §3).

use std::cell::RefCell;
use std::rc::Rc;

use super::array::{normalize_index, ArrayObj};
use crate::error::AqlError;
use crate::gc::{GcHeader, GcTag};
use crate::value::Value;

pub struct SliceObj {
    pub header: GcHeader,
    base: Rc<RefCell<ArrayObj>>,
    offset: usize,
    length: usize,
    capacity: usize,
}

impl SliceObj {
    pub fn new(base: Rc<RefCell<ArrayObj>>, offset: usize, length: usize, capacity: usize) -> Self {
        SliceObj {
            header: GcHeader::new(GcTag::Slice),
            base,
            offset,
            length,
            capacity,
        }
    }

    pub fn whole(base: Rc<RefCell<ArrayObj>>) -> Self {
        let len = base.borrow().len();
        SliceObj::new(base, 0, len, len)
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn get(&self, index: i64) -> Result<Value, AqlError> {
        let idx = normalize_index(index, self.length)?;
        self.base.borrow().get((self.offset + idx) as i64)
    }

    pub fn set(&self, index: i64, value: Value) -> Result<(), AqlError> {
        let idx = normalize_index(index, self.length)?;
        self.base.borrow_mut().set((self.offset + idx) as i64, value)
    }

    /// `slice[lo..hi]` re-slicing: shares the same backing array, never
    /// copies.
    pub fn reslice(&self, lo: usize, hi: usize) -> Result<SliceObj, AqlError> {
        if lo > hi || hi > self.length {
            return Err(AqlError::runtime(format!("slice bounds [{lo}:{hi}] out of range for length {}", self.length)));
        }
        Ok(SliceObj::new(Rc::clone(&self.base), self.offset + lo, hi - lo, self.capacity - lo))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn view_shares_storage() {
        let base = Rc::new(RefCell::new(ArrayObj::from_values(vec![
            Value::Int(1),
            Value::Int(2),
            Value::Int(3),
        ])));
        let s = SliceObj::new(Rc::clone(&base), 1, 2, 2);
        assert_eq!(s.get(0).unwrap(), Value::Int(2));
        s.set(0, Value::Int(99)).unwrap();
        assert_eq!(base.borrow().get(1).unwrap(), Value::Int(99));
    }
}
