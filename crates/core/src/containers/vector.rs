//! Fixed-size numeric vector (spec §3). SIMD kernels over this layout are
//! an external, optional acceleration path (spec §1) and are not
//! implemented here; what this module specifies is the fixed-length,
//! numeric-only storage contract a SIMD backend would need.

use crate::error::AqlError;
use crate::gc::{GcHeader, GcTag};
use crate::value::Value;

/// 32-byte alignment is enough headroom for AVX-class SIMD backends without
/// committing to a specific ISA width.
#[repr(align(32))]
#[derive(Clone, Copy)]
struct AlignedF64(f64);

pub struct VectorObj {
    pub header: GcHeader,
    data: Vec<AlignedF64>,
}

impl VectorObj {
    pub fn zeroed(len: usize) -> Self {
        VectorObj {
            header: GcHeader::new(GcTag::Vector),
            data: vec![AlignedF64(0.0); len],
        }
    }

    pub fn from_values(values: &[f64]) -> Self {
        VectorObj {
            header: GcHeader::new(GcTag::Vector),
            data: values.iter().map(|&v| AlignedF64(v)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, index: i64) -> Result<Value, AqlError> {
        let idx = super::array::normalize_index(index, self.data.len())?;
        Ok(Value::Float(self.data[idx].0))
    }

    pub fn set(&mut self, index: i64, value: f64) -> Result<(), AqlError> {
        let idx = super::array::normalize_index(index, self.data.len())?;
        self.data[idx].0 = value;
        Ok(())
    }

    pub fn as_slice_f64(&self) -> Vec<f64> {
        self.data.iter().map(|a| a.0).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_is_32_bytes() {
        assert_eq!(std::mem::align_of::<AlignedF64>(), 32);
    }

    #[test]
    fn get_set_roundtrip() {
        let mut v = VectorObj::zeroed(4);
        v.set(2, 3.5).unwrap();
        assert_eq!(v.get(2).unwrap(), Value::Float(3.5));
    }
}
