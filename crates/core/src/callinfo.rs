//! Call-info frame descriptor (spec §3 "Call-info (CallInfo)").
//!
//! The original links `CallInfo` nodes in a doubly-linked list per thread
//! and reuses nodes across calls (`shrinkCI` reclaims the unused tail).
//! Per §9's translation note this becomes a plain `Vec<CallInfo>` owned by
//! the thread: pushing/popping a frame is `Vec::push`/`Vec::pop`, and the
//! "lazily extend, occasionally shrink" behavior falls out of `Vec`'s own
//! capacity growth for free — there is no separate node-reuse mechanism to
//! implement.

use std::rc::Rc;

use crate::closure::{CClosure, Closure};

/// `nresults == MULTRET` means "all results", matching the original's
/// `AQL_MULTRET` (`-1`).
pub const MULTRET: i32 = -1;

/// A frame descriptor (spec §3). Represented as a sum type rather than the
/// original's tagged union of an AQL-function-only field group and a
/// C-function-only field group — the translation §9 recommends for
/// `TValue` applies just as well here.
pub enum CallInfo {
    Aql {
        /// Stack index of the function value itself (`ci->func`).
        func: usize,
        /// Register window base = `func + 1`.
        base: usize,
        /// Frame top: highest stack index this call may use.
        top: usize,
        /// Saved program counter, an index into `closure.proto.code`.
        saved_pc: usize,
        /// Extra (beyond `numparams`) vararg values stored below `base`.
        nextraargs: usize,
        /// Results the caller expects, or [`MULTRET`].
        nresults: i32,
        closure: Rc<Closure>,
    },
    C {
        func: usize,
        top: usize,
        nresults: i32,
        cclosure: Rc<CClosure>,
    },
}

impl CallInfo {
    pub fn new_aql(func: usize, base: usize, top: usize, nresults: i32, closure: Rc<Closure>) -> Self {
        CallInfo::Aql { func, base, top, saved_pc: 0, nextraargs: 0, nresults, closure }
    }

    pub fn new_c(func: usize, top: usize, nresults: i32, cclosure: Rc<CClosure>) -> Self {
        CallInfo::C { func, top, nresults, cclosure }
    }

    pub fn func(&self) -> usize {
        match self {
            CallInfo::Aql { func, .. } => *func,
            CallInfo::C { func, .. } => *func,
        }
    }

    /// Register-window base (`func + 1`). Only meaningful for an AQL frame.
    pub fn base(&self) -> usize {
        match self {
            CallInfo::Aql { base, .. } => *base,
            CallInfo::C { func, .. } => func + 1,
        }
    }

    pub fn saved_pc(&self) -> usize {
        match self {
            CallInfo::Aql { saved_pc, .. } => *saved_pc,
            CallInfo::C { .. } => 0,
        }
    }

    pub fn set_saved_pc(&mut self, pc: usize) {
        if let CallInfo::Aql { saved_pc, .. } = self {
            *saved_pc = pc;
        }
    }

    pub fn nextraargs(&self) -> usize {
        match self {
            CallInfo::Aql { nextraargs, .. } => *nextraargs,
            CallInfo::C { .. } => 0,
        }
    }

    pub fn set_nextraargs(&mut self, n: usize) {
        if let CallInfo::Aql { nextraargs, .. } = self {
            *nextraargs = n;
        }
    }

    pub fn closure(&self) -> Option<&Rc<Closure>> {
        match self {
            CallInfo::Aql { closure, .. } => Some(closure),
            CallInfo::C { .. } => None,
        }
    }

    pub fn cclosure(&self) -> Option<&Rc<CClosure>> {
        match self {
            CallInfo::C { cclosure, .. } => Some(cclosure),
            CallInfo::Aql { .. } => None,
        }
    }

    pub fn set_nresults(&mut self, n: i32) {
        match self {
            CallInfo::Aql { nresults, .. } => *nresults = n,
            CallInfo::C { nresults, .. } => *nresults = n,
        }
    }

    pub fn top(&self) -> usize {
        match self {
            CallInfo::Aql { top, .. } => *top,
            CallInfo::C { top, .. } => *top,
        }
    }

    pub fn set_top(&mut self, new_top: usize) {
        match self {
            CallInfo::Aql { top, .. } => *top = new_top,
            CallInfo::C { top, .. } => *top = new_top,
        }
    }

    pub fn nresults(&self) -> i32 {
        match self {
            CallInfo::Aql { nresults, .. } => *nresults,
            CallInfo::C { nresults, .. } => *nresults,
        }
    }

    pub fn is_aql(&self) -> bool {
        matches!(self, CallInfo::Aql { .. })
    }
}
