//! The allocation/barrier *contract* named in `spec.md` §1.
//!
//! The tracing collector itself is an external collaborator (out of scope).
//! What this module specifies is the shape every collectable object must
//! honor so a real collector could be dropped in later: an object header
//! (next-object link replaced by a registry count, per §9's translation
//! note; type tag; mark byte) and a write-barrier hook that must be called
//! whenever a collectable value is stored into another collectable's field.
//!
//! Collectable values in this workspace are `Rc`/`Rc<RefCell<_>>` rather
//! than traced, so *reclamation* is reference counting, not mark-sweep.
//! That satisfies "every reachable object is on exactly one GC list" only
//! in the trivial address-space sense; the GC *debt* counter below still
//! models the original's incremental-collection pacing so the VM executor
//! can be written against the same "check debt after allocations" contract
//! a tracing collector would need.

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

/// Broad collectable-object kind, parallel to the `TValue` broad types in
/// `spec.md` §3 that are heap-allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcTag {
    LongString,
    Array,
    Slice,
    Dict,
    Vector,
    Range,
    Closure,
    CClosure,
    Proto,
    UpVal,
    Thread,
    UserData,
}

/// Every collectable object carries one of these. `marked` stands in for
/// the original's tri-color mark byte; since reclamation here is Rc-based,
/// nothing ever actually flips it, but the field exists so a future tracing
/// collector has somewhere to write without changing every object's layout.
#[derive(Debug)]
pub struct GcHeader {
    pub tag: GcTag,
    marked: Cell<bool>,
}

impl GcHeader {
    pub fn new(tag: GcTag) -> Self {
        ALLOC_DEBT.fetch_add(1, Ordering::Relaxed);
        GcHeader {
            tag,
            marked: Cell::new(false),
        }
    }

    pub fn is_marked(&self) -> bool {
        self.marked.get()
    }

    pub fn set_marked(&self, v: bool) {
        self.marked.set(v);
    }
}

/// Global incremental-GC debt counter (spec §4.F: "the executor periodically
/// checks GC debt ... when positive, runs a slice of the incremental
/// collector"). Since there is no tracing collector to run a slice of, the
/// "slice" here is simply resetting the debt; the counter still gives the
/// executor an observable, testable hook to call after allocations, and
/// gives `tracing` something to log.
static ALLOC_DEBT: AtomicU64 = AtomicU64::new(0);

/// Returns true (and resets the debt) when enough allocations have
/// accumulated that a real collector would run a step. `step_size` comes
/// from `RuntimeConfig::gc_step_size`.
pub fn check_gc_debt(step_size: u64) -> bool {
    let debt = ALLOC_DEBT.load(Ordering::Relaxed);
    if debt >= step_size {
        ALLOC_DEBT.fetch_sub(step_size, Ordering::Relaxed);
        true
    } else {
        false
    }
}

#[cfg(test)]
pub fn reset_gc_debt_for_test() {
    ALLOC_DEBT.store(0, Ordering::Relaxed);
}

/// Read-only snapshot of the current debt, for diagnostics dumps. Does not
/// reset it the way [`check_gc_debt`] does.
pub fn debt_snapshot() -> u64 {
    ALLOC_DEBT.load(Ordering::Relaxed)
}

/// Write-barrier notification: must be invoked whenever a collectable value
/// is stored into a field of another collectable object (`SETUPVAL`,
/// `SETTABUP`, `SETPROP` in the VM executor, §4.F). With a real generational
/// or incremental collector this would re-gray a black parent; with Rc-based
/// reclamation there is nothing to re-gray, but recording the write still
/// lets the debt counter account for the store the same way a real
/// allocator-coupled barrier would.
pub fn write_barrier(_parent: &GcHeader, child_is_collectable: bool) {
    if child_is_collectable {
        ALLOC_DEBT.fetch_add(1, Ordering::Relaxed);
    }
}

/// Host-pluggable allocator, standing in for the C `aql_Alloc` function
/// pointer (`void* alloc(ud, ptr, osize, nsize)`) named in spec §6. Rust's
/// ownership model makes the manual realloc/free dance unnecessary for
/// almost everything in this crate, but large host-managed buffers (e.g. a
/// custom arena for `Array`/`Vector` storage) can still route through this
/// trait so an embedder can install a quota-tracking or arena allocator.
pub trait Allocator {
    fn alloc(&self, size: usize) -> Option<Vec<u8>>;
    fn dealloc(&self, _buf: Vec<u8>) {}
}

/// Default allocator: delegates to the global Rust allocator via `Vec`.
pub struct SystemAllocator;

impl Allocator for SystemAllocator {
    fn alloc(&self, size: usize) -> Option<Vec<u8>> {
        let mut v = Vec::new();
        v.try_reserve(size).ok()?;
        v.resize(size, 0);
        Some(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debt_accumulates_and_resets() {
        reset_gc_debt_for_test();
        for _ in 0..10 {
            let _ = GcHeader::new(GcTag::Array);
        }
        assert!(check_gc_debt(10));
        assert!(!check_gc_debt(10));
    }

    #[test]
    fn write_barrier_adds_debt_only_for_collectable_children() {
        let parent = GcHeader::new(GcTag::Dict);
        reset_gc_debt_for_test();
        write_barrier(&parent, false);
        assert_eq!(debt_snapshot(), 0);
        write_barrier(&parent, true);
        assert_eq!(debt_snapshot(), 1);
    }

    #[test]
    fn system_allocator_zeroes() {
        let a = SystemAllocator;
        let buf = a.alloc(16).unwrap();
        assert_eq!(buf.len(), 16);
        assert!(buf.iter().all(|&b| b == 0));
    }
}
