//! Closures and upvalues (spec §3 "Closure", "Upvalue (UpVal)", and §4.G).

use std::cell::RefCell;
use std::rc::Rc;

use crate::error::AqlError;
use crate::gc::{GcHeader, GcTag};
use crate::proto::Proto;
use crate::thread::Thread;
use crate::value::Value;

/// An upvalue's dual state (spec §3): *open* while it aliases a live stack
/// slot on some thread, *closed* once that slot has gone out of scope and
/// the value has been copied into the cell.
///
/// Per §9's translation note, the open state references a stack slot by
/// **index**, not by raw pointer, so the stack-growth protocol in §4.B
/// never needs to patch this reference — only the index's owning `Thread`
/// can move, and the index itself stays valid across a grow.
pub enum UpValState {
    Open { thread: Rc<RefCell<Thread>>, index: usize },
    Closed(Value),
}

pub struct UpVal {
    pub header: GcHeader,
    state: RefCell<UpValState>,
}

impl UpVal {
    pub fn new_open(thread: Rc<RefCell<Thread>>, index: usize) -> Rc<UpVal> {
        Rc::new(UpVal {
            header: GcHeader::new(GcTag::UpVal),
            state: RefCell::new(UpValState::Open { thread, index }),
        })
    }

    pub fn new_closed(value: Value) -> Rc<UpVal> {
        Rc::new(UpVal {
            header: GcHeader::new(GcTag::UpVal),
            state: RefCell::new(UpValState::Closed(value)),
        })
    }

    pub fn get(&self) -> Value {
        match &*self.state.borrow() {
            UpValState::Open { thread, index } => thread.borrow().stack_peek(*index),
            UpValState::Closed(v) => v.clone(),
        }
    }

    pub fn set(&self, v: Value) {
        match &mut *self.state.borrow_mut() {
            UpValState::Open { thread, index } => thread.borrow_mut().stack_set(*index, v),
            UpValState::Closed(slot) => *slot = v,
        }
    }

    /// Stack index this upvalue aliases, if still open. Used by the
    /// open-upvalue list's descending-index ordering (spec §4.G invariant).
    pub fn open_index(&self) -> Option<usize> {
        match &*self.state.borrow() {
            UpValState::Open { index, .. } => Some(*index),
            UpValState::Closed(_) => None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open_index().is_some()
    }

    /// Copy `*value_ptr` into the upvalue's internal cell and mark it
    /// closed; transition is one-way (spec §3).
    pub fn close(&self) {
        let mut state = self.state.borrow_mut();
        if let UpValState::Open { thread, index } = &*state {
            let v = thread.borrow().stack_peek(*index);
            *state = UpValState::Closed(v);
        }
    }
}

/// Binds a prototype to its captured upvalues (spec §3 "Closure").
pub struct Closure {
    pub header: GcHeader,
    pub proto: Rc<Proto>,
    pub upvalues: Vec<Rc<UpVal>>,
}

impl Closure {
    pub fn new(proto: Rc<Proto>, upvalues: Vec<Rc<UpVal>>) -> Rc<Closure> {
        Rc::new(Closure {
            header: GcHeader::new(GcTag::Closure),
            proto,
            upvalues,
        })
    }
}

/// A native function pointer plus its boxed captured values (spec §3
/// "C-closure"). `aql-runtime`'s builtin table is the main producer of
/// these; the signature mirrors a protected call: it receives the calling
/// thread and the argument slice, and returns the result values or an
/// error.
pub type NativeFn = fn(&mut Thread, &[Value]) -> Result<Vec<Value>, AqlError>;

pub struct CClosure {
    pub header: GcHeader,
    pub name: &'static str,
    pub func: NativeFn,
    pub upvalues: Vec<Value>,
}

impl CClosure {
    pub fn new(name: &'static str, func: NativeFn, upvalues: Vec<Value>) -> Rc<CClosure> {
        Rc::new(CClosure {
            header: GcHeader::new(GcTag::CClosure),
            name,
            func,
            upvalues,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::GlobalState;

    #[test]
    fn open_then_close_preserves_value() {
        let global = Rc::new(RefCell::new(GlobalState::new()));
        let thread = Thread::new(global);
        thread.borrow_mut().stack_ensure(4).unwrap();
        thread.borrow_mut().stack_set(1, Value::Int(7));

        let upval = UpVal::new_open(Rc::clone(&thread), 1);
        assert!(upval.is_open());
        assert_eq!(upval.get(), Value::Int(7));

        upval.close();
        assert!(!upval.is_open());
        // Mutating the (now irrelevant) stack slot no longer affects it.
        thread.borrow_mut().stack_set(1, Value::Int(99));
        assert_eq!(upval.get(), Value::Int(7));
    }
}
