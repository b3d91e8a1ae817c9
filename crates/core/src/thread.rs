//! Thread (`aql_State` in the original): owns a value stack, a call-info
//! chain, an open-upvalue list, and a link to the shared global state
//! (spec §3 "Thread (aql_State)").

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::callinfo::CallInfo;
use crate::closure::UpVal;
use crate::error::AqlError;
use crate::global::GlobalState;
use crate::stack::{Stack, DEFAULT_MAX_STACK};
use crate::value::Value;

/// Bounds recursion into native code (spec §4.B "C-call depth"). Matches
/// the original's `LUAI_MAXCCALLS`-style default.
pub const MAX_C_CALLS: u32 = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadStatus {
    Ready,
    Running,
    Suspended,
    Dead,
}

pub struct Thread {
    pub stack: Stack,
    call_infos: Vec<CallInfo>,
    /// Sorted strictly descending by stack index (spec §4.G invariant).
    open_upvalues: Vec<Rc<UpVal>>,
    pub status: ThreadStatus,
    n_c_calls: u32,
    pub global: Rc<RefCell<GlobalState>>,
    self_ref: Weak<RefCell<Thread>>,
}

impl Thread {
    pub fn new(global: Rc<RefCell<GlobalState>>) -> Rc<RefCell<Thread>> {
        Self::with_max_stack(global, DEFAULT_MAX_STACK)
    }

    pub fn with_max_stack(global: Rc<RefCell<GlobalState>>, max_stack: usize) -> Rc<RefCell<Thread>> {
        let thread = Thread {
            stack: Stack::new(max_stack),
            call_infos: Vec::new(),
            open_upvalues: Vec::new(),
            status: ThreadStatus::Ready,
            n_c_calls: 0,
            global,
            self_ref: Weak::new(),
        };
        let rc = Rc::new(RefCell::new(thread));
        rc.borrow_mut().self_ref = Rc::downgrade(&rc);
        rc
    }

    pub fn stack_peek(&self, index: usize) -> Value {
        self.stack.get(index)
    }

    pub fn stack_set(&mut self, index: usize, v: Value) {
        self.stack.set(index, v);
    }

    pub fn stack_ensure(&mut self, extra: usize) -> Result<(), AqlError> {
        self.stack.ensure(extra)
    }

    pub fn push_call_info(&mut self, ci: CallInfo) {
        self.call_infos.push(ci);
    }

    pub fn pop_call_info(&mut self) -> Option<CallInfo> {
        self.call_infos.pop()
    }

    pub fn current_call_info(&self) -> Option<&CallInfo> {
        self.call_infos.last()
    }

    pub fn current_call_info_mut(&mut self) -> Option<&mut CallInfo> {
        self.call_infos.last_mut()
    }

    pub fn call_depth(&self) -> usize {
        self.call_infos.len()
    }

    /// `shrinkCI`: reclaim half the unused tail capacity once the chain has
    /// shrunk back down. With a `Vec` this is advisory bookkeeping rather
    /// than a correctness requirement.
    pub fn shrink_call_infos(&mut self) {
        if self.call_infos.capacity() > self.call_infos.len() * 4 {
            self.call_infos.shrink_to(self.call_infos.len() * 2);
        }
    }

    pub fn incr_c_calls(&mut self) -> Result<(), AqlError> {
        self.n_c_calls += 1;
        if self.n_c_calls > MAX_C_CALLS {
            self.n_c_calls -= 1;
            return Err(AqlError::runtime("C stack overflow"));
        }
        Ok(())
    }

    pub fn decr_c_calls(&mut self) {
        self.n_c_calls = self.n_c_calls.saturating_sub(1);
    }

    /// Find the open upvalue for `index`, creating one if none exists yet
    /// (spec §4.G "CLOSURE-emit time" / `OP_CLOSURE` semantics).
    pub fn find_or_create_upvalue(&mut self, index: usize) -> Rc<UpVal> {
        if let Some(existing) = self.open_upvalues.iter().find(|u| u.open_index() == Some(index)) {
            return Rc::clone(existing);
        }
        let self_rc = self.self_ref.upgrade().expect("Thread must be Rc-owned before use");
        let uv = UpVal::new_open(self_rc, index);
        let pos = self
            .open_upvalues
            .iter()
            .position(|u| u.open_index().is_none_or(|i| i < index))
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(pos, Rc::clone(&uv));
        uv
    }

    /// Close every open upvalue at or above stack index `level` (spec §4.G
    /// "Closing an upvalue" / `OP_CLOSE`, `OP_JMP`'s close-on-A, and
    /// `RET`'s "close upvalues >= frame base").
    pub fn close_upvalues_from(&mut self, level: usize) {
        while let Some(front) = self.open_upvalues.first() {
            match front.open_index() {
                Some(idx) if idx >= level => {
                    front.close();
                    self.open_upvalues.remove(0);
                }
                _ => break,
            }
        }
    }

    pub fn open_upvalue_count(&self) -> usize {
        self.open_upvalues.len()
    }

    /// Spec §8 property 2: the open-upvalue list is sorted strictly
    /// descending by stack index.
    pub fn open_upvalues_sorted_descending(&self) -> bool {
        self.open_upvalues.windows(2).all(|w| {
            let a = w[0].open_index().unwrap_or(usize::MAX);
            let b = w[1].open_index().unwrap_or(usize::MAX);
            a > b
        })
    }

    /// `aqlD_pcall` equivalent: run `f`, and on `Err` unwind `thread` back
    /// to the call-info depth and stack top it had before `f` ran, closing
    /// any upvalues `f` opened above that point. `f` does its own work
    /// through whatever borrows it needs of `thread` (the VM executor holds
    /// its own `borrow_mut` for the duration of a call); this only restores
    /// the checkpoint, it doesn't run the call itself.
    pub fn protected_call<T>(
        thread: &Rc<RefCell<Thread>>,
        f: impl FnOnce() -> Result<T, AqlError>,
    ) -> Result<T, AqlError> {
        let (depth, top) = {
            let t = thread.borrow();
            (t.call_depth(), t.stack.top)
        };
        match f() {
            Ok(v) => Ok(v),
            Err(e) => {
                let mut t = thread.borrow_mut();
                while t.call_depth() > depth {
                    t.pop_call_info();
                }
                t.close_upvalues_from(top);
                t.stack.truncate(top);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::global::GlobalState;

    #[test]
    fn upvalue_list_stays_sorted_descending() {
        let global = Rc::new(RefCell::new(GlobalState::new()));
        let thread = Thread::new(global);
        thread.borrow_mut().stack_ensure(16).unwrap();
        {
            let mut t = thread.borrow_mut();
            t.find_or_create_upvalue(3);
            t.find_or_create_upvalue(7);
            t.find_or_create_upvalue(1);
            assert!(t.open_upvalues_sorted_descending());
            assert_eq!(t.open_upvalue_count(), 3);
        }
    }

    #[test]
    fn closing_removes_from_open_list() {
        let global = Rc::new(RefCell::new(GlobalState::new()));
        let thread = Thread::new(global);
        thread.borrow_mut().stack_ensure(16).unwrap();
        {
            let mut t = thread.borrow_mut();
            t.find_or_create_upvalue(2);
            t.find_or_create_upvalue(5);
            t.close_upvalues_from(3);
            assert_eq!(t.open_upvalue_count(), 1);
        }
    }

    #[test]
    fn c_call_depth_is_bounded() {
        let global = Rc::new(RefCell::new(GlobalState::new()));
        let thread = Thread::new(global);
        let mut t = thread.borrow_mut();
        for _ in 0..MAX_C_CALLS {
            t.incr_c_calls().unwrap();
        }
        assert!(t.incr_c_calls().is_err());
    }
}
