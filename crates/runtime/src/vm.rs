//! Fetch-decode-dispatch executor over `aql_core::Proto` bytecode (spec
//! §4.F). `CALL`/`RET` push and pop frames on `Thread`'s own `CallInfo`
//! stack rather than recursing through Rust's call stack, so `YIELD` can
//! hand control back to an enclosing `RESUME` without unwinding anything.
//!
//! The opcode set the compiler actually emits (`MOVE`, the `ADD`/`SUB`/...
//! families, `GETTABUP`/`SETTABUP`, `GETPROP`/`SETPROP`, the `FOR*`/`ITER_*`
//! loop pairs, `BUILTIN`, `RET*`) is exercised by every AQL program this
//! workspace can produce. The rest of the 66-entry opcode table --
//! `CALL`/`TAILCALL`/`CLOSURE`/`GETUPVAL`/`SETUPVAL`/`VARARG`/`YIELD`/
//! `RESUME`/`TBC`/`TESTSET`/`EQI`/`LTI`/`SHRI`/`LOADF`/`LOADKX`/`INVOKE` --
//! has no source syntax that can emit it (there is no function-literal,
//! method-call, or coroutine-creation grammar), but is implemented here
//! anyway to the same correctness standard, because a `Proto` produced by
//! some other emitter is still a legal input to this executor. See
//! `DESIGN.md` for the specific simplifications taken in that dead code
//! (`TAILCALL` doesn't reuse the caller's frame; `RESUME` has no transfer
//! protocol to hand yielded values back through).

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use aql_core::{
    AqlError, ArrayObj, CallInfo, Closure, ContainerKind, DictObj, GlobalState, Instruction, NativeFn, OpCode, Proto,
    RangeObj, RuntimeConfig, SliceObj, Thread, TString, Value, VectorObj, MULTRET,
};

use tracing::{debug, trace};

use crate::builtins;
use crate::diagnostics::{CALLS_DISPATCHED, THREADS_CREATED};
use std::sync::atomic::Ordering;

/// What one call into the executor produced.
pub enum ExecResult {
    Return(Vec<Value>),
    Yield(Vec<Value>),
}

/// One interpreter instance: a `GlobalState`, its main thread, and the
/// host builtins layered on top of the fixed `BUILTIN` table (spec §6
/// `register_builtin`).
pub struct Vm {
    pub global: Rc<RefCell<GlobalState>>,
    pub main_thread: Rc<RefCell<Thread>>,
    extra_builtins: HashMap<u16, NativeFn>,
    gc_step_size: u64,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let global = Rc::new(RefCell::new(GlobalState::new()));
        let main_thread = Thread::with_max_stack(Rc::clone(&global), config.max_stack);
        THREADS_CREATED.fetch_add(1, Ordering::Relaxed);
        debug!(max_stack = config.max_stack, "aql thread created");
        Vm { global, main_thread, extra_builtins: HashMap::new(), gc_step_size: config.gc_step_size }
    }

    /// Installs a host function under a `BUILTIN` id past the fixed
    /// `print/len/type/tostring/tonumber/range` table (ids 0-5). Pair with
    /// `RuntimeConfig::register_builtin` so the name a host chunk compiles
    /// against resolves to the same id dispatched here -- the config entry
    /// is metadata only, this is where the actual function pointer lives.
    pub fn register_builtin(&mut self, id: u16, f: NativeFn) {
        self.extra_builtins.insert(id, f);
    }

    pub fn call(&self, closure: Rc<Closure>, args: &[Value]) -> Result<ExecResult, AqlError> {
        run_closure(&self.main_thread, closure, args, &self.extra_builtins, self.gc_step_size)
    }

    pub fn spawn_thread(&self) -> Rc<RefCell<Thread>> {
        THREADS_CREATED.fetch_add(1, Ordering::Relaxed);
        Thread::new(Rc::clone(&self.global))
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

/// Sets up a call frame for `closure` on `thread` and runs it to
/// completion (or suspension). The embedding API's `aql_execute`/protected
/// call eventually bottoms out here.
pub(crate) fn run_closure(
    thread: &Rc<RefCell<Thread>>,
    closure: Rc<Closure>,
    args: &[Value],
    extra_builtins: &HashMap<u16, NativeFn>,
    gc_step_size: u64,
) -> Result<ExecResult, AqlError> {
    let entry_depth;
    {
        let mut t = thread.borrow_mut();
        entry_depth = t.call_depth();
        let func_abs = t.stack.top;
        let numparams = closure.proto.numparams as usize;
        let maxstack = closure.proto.maxstacksize as usize;
        let before = t.stack.len();
        t.stack_ensure(1 + maxstack.max(numparams) + args.len() + 8)?;
        if t.stack.len() != before {
            trace!(from = before, to = t.stack.len(), "stack grown for new call");
        }
        t.stack_set(func_abs, Value::Closure(Rc::clone(&closure)));
        let base = func_abs + 1;
        for (i, v) in args.iter().enumerate() {
            t.stack_set(base + i, v.clone());
        }
        for i in args.len()..numparams {
            t.stack_set(base + i, Value::Nil);
        }
        let nextra = if closure.proto.is_vararg && args.len() > numparams { args.len() - numparams } else { 0 };
        let top = (base + maxstack).max(base + args.len());
        t.stack.top = top;
        let mut ci = CallInfo::new_aql(func_abs, base, top, MULTRET, Rc::clone(&closure));
        ci.set_nextraargs(nextra);
        t.push_call_info(ci);
    }
    dispatch_loop(thread, entry_depth, extra_builtins, gc_step_size)
}

/// What happened to the currently executing frame after one instruction.
enum Flow {
    /// Advance to `pc + 1` in the same frame.
    Next,
    /// Set the current frame's saved pc directly (jumps, loop back-edges).
    Jump(usize),
    /// A frame was pushed or popped already; re-fetch from scratch.
    FrameChanged,
    /// The frame at `entry_depth` returned; unwind out of the loop.
    Returned(Vec<Value>),
    /// `YIELD` was executed; suspend without popping anything.
    Yielded(Vec<Value>),
}

fn dispatch_loop(
    thread: &Rc<RefCell<Thread>>,
    entry_depth: usize,
    extra_builtins: &HashMap<u16, NativeFn>,
    gc_step_size: u64,
) -> Result<ExecResult, AqlError> {
    let mut t = thread.borrow_mut();
    loop {
        debug_assert!(t.call_depth() > entry_depth, "dispatch loop exited its own frame without returning");
        if aql_core::gc::check_gc_debt(gc_step_size) {
            trace!(debt = aql_core::gc::debt_snapshot(), "gc debt slice reclaimed");
        }
        let (closure, base, pc) = match t.current_call_info().expect("active frame") {
            CallInfo::Aql { closure, base, saved_pc, .. } => (Rc::clone(closure), *base, *saved_pc),
            CallInfo::C { .. } => panic!("dispatch loop only ever runs atop an AQL frame"),
        };
        let proto = Rc::clone(&closure.proto);
        let global = Rc::clone(&t.global);
        let inst = proto.code[pc];
        let line = proto.line_info[pc];

        macro_rules! rr_arith {
            ($op:ident) => {{
                let a = get_reg(&t, base, inst.b());
                let b = get_reg(&t, base, inst.c());
                let v = a.$op(&b).map_err(|e| with_line(e, line))?;
                set_reg(&mut t, base, inst.a(), v);
                Flow::Next
            }};
        }
        macro_rules! rk_arith {
            ($op:ident) => {{
                let a = get_reg(&t, base, inst.b());
                let b = konst(&global, &proto, inst.c());
                let v = a.$op(&b).map_err(|e| with_line(e, line))?;
                set_reg(&mut t, base, inst.a(), v);
                Flow::Next
            }};
        }
        macro_rules! ri_arith {
            ($op:ident) => {{
                let a = get_reg(&t, base, inst.b());
                let b = Value::Int(inst.sc() as i64);
                let v = a.$op(&b).map_err(|e| with_line(e, line))?;
                set_reg(&mut t, base, inst.a(), v);
                Flow::Next
            }};
        }

        let flow: Flow = match inst.opcode() {
            OpCode::MOVE => {
                let v = get_reg(&t, base, inst.b());
                set_reg(&mut t, base, inst.a(), v);
                Flow::Next
            }
            OpCode::LOADI => {
                set_reg(&mut t, base, inst.a(), Value::Int(inst.sbx() as i64));
                Flow::Next
            }
            OpCode::LOADF => {
                set_reg(&mut t, base, inst.a(), Value::Float(inst.sbx() as f64));
                Flow::Next
            }
            OpCode::LOADK => {
                let v = konst(&global, &proto, inst.bx());
                set_reg(&mut t, base, inst.a(), v);
                Flow::Next
            }
            OpCode::LOADKX => {
                let extra = proto.code[pc + 1];
                debug_assert_eq!(extra.opcode(), OpCode::EXTRAARG);
                let v = konst(&global, &proto, extra.ax());
                set_reg(&mut t, base, inst.a(), v);
                Flow::Jump(pc + 2)
            }
            OpCode::LOADFALSE => {
                set_reg(&mut t, base, inst.a(), Value::Bool(false));
                Flow::Next
            }
            OpCode::LOADTRUE => {
                set_reg(&mut t, base, inst.a(), Value::Bool(true));
                Flow::Next
            }
            OpCode::LOADNIL => {
                let a = inst.a();
                let n = inst.b() + 1;
                for i in 0..n {
                    set_reg(&mut t, base, a + i, Value::Nil);
                }
                Flow::Next
            }
            OpCode::GETUPVAL => {
                let v = closure.upvalues[inst.b() as usize].get();
                set_reg(&mut t, base, inst.a(), v);
                Flow::Next
            }
            OpCode::SETUPVAL => {
                let v = get_reg(&t, base, inst.a());
                aql_core::gc::write_barrier(&closure.upvalues[inst.b() as usize].header, v.is_collectable());
                closure.upvalues[inst.b() as usize].set(v);
                Flow::Next
            }
            OpCode::GETTABUP => {
                let env = closure.upvalues[inst.b() as usize].get();
                let key = konst(&global, &proto, inst.c());
                let v = match &env {
                    Value::Dict(d) => d.borrow().get(key).map_err(|e| with_line(e, line))?,
                    other => {
                        return Err(with_line(
                            AqlError::runtime(format!("attempt to index a {} value", other.type_name())),
                            line,
                        ))
                    }
                };
                set_reg(&mut t, base, inst.a(), v);
                Flow::Next
            }
            OpCode::SETTABUP => {
                let env = closure.upvalues[inst.a() as usize].get();
                let key = konst(&global, &proto, inst.b());
                let value = if inst.k() { konst(&global, &proto, inst.c()) } else { get_reg(&t, base, inst.c()) };
                match &env {
                    Value::Dict(d) => {
                        aql_core::gc::write_barrier(&d.borrow().header, value.is_collectable());
                        d.borrow_mut().set(key, value).map_err(|e| with_line(e, line))?;
                    }
                    other => {
                        return Err(with_line(
                            AqlError::runtime(format!("attempt to index a {} value", other.type_name())),
                            line,
                        ))
                    }
                }
                Flow::Next
            }
            OpCode::CLOSE => {
                t.close_upvalues_from(base + inst.a() as usize);
                Flow::Next
            }
            OpCode::TBC => Flow::Next,
            OpCode::CONCAT => {
                let a = inst.a();
                let n = inst.b();
                let mut s = String::new();
                for i in 0..n {
                    let v = get_reg(&t, base, a + i);
                    s.push_str(&builtins::concat_operand(&v).map_err(|e| with_line(e, line))?);
                }
                set_reg(&mut t, base, a, Value::Str(TString::owned(s)));
                Flow::Next
            }
            OpCode::EXTRAARG => {
                // Only ever consumed as LOADKX's lookahead; reached directly
                // only for a malformed instruction stream.
                return Err(with_line(AqlError::runtime("stray EXTRAARG instruction"), line));
            }

            OpCode::ADD => rr_arith!(add),
            OpCode::ADDK => rk_arith!(add),
            OpCode::ADDI => ri_arith!(add),
            OpCode::SUB => rr_arith!(sub),
            OpCode::SUBK => rk_arith!(sub),
            OpCode::SUBI => ri_arith!(sub),
            OpCode::MUL => rr_arith!(mul),
            OpCode::MULK => rk_arith!(mul),
            OpCode::MULI => ri_arith!(mul),
            OpCode::DIV => rr_arith!(div),
            OpCode::DIVK => rk_arith!(div),
            OpCode::DIVI => ri_arith!(div),
            OpCode::MOD => rr_arith!(modulo),
            OpCode::POW => rr_arith!(pow),
            OpCode::UNM => {
                let v = get_reg(&t, base, inst.b()).neg().map_err(|e| with_line(e, line))?;
                set_reg(&mut t, base, inst.a(), v);
                Flow::Next
            }
            OpCode::LEN => {
                let v = container_len(&get_reg(&t, base, inst.b())).map_err(|e| with_line(e, line))?;
                set_reg(&mut t, base, inst.a(), Value::Int(v));
                Flow::Next
            }

            OpCode::BAND => rr_arith!(band),
            OpCode::BOR => rr_arith!(bor),
            OpCode::BXOR => rr_arith!(bxor),
            OpCode::SHL => rr_arith!(shl),
            OpCode::SHR => rr_arith!(shr),
            OpCode::BNOT => {
                let v = get_reg(&t, base, inst.b()).bnot().map_err(|e| with_line(e, line))?;
                set_reg(&mut t, base, inst.a(), v);
                Flow::Next
            }
            OpCode::NOT => {
                let truthy = get_reg(&t, base, inst.b()).is_truthy();
                set_reg(&mut t, base, inst.a(), Value::Bool(!truthy));
                Flow::Next
            }
            OpCode::SHRI => {
                let a = get_reg(&t, base, inst.b());
                let imm = Value::Int(inst.sc() as i64);
                let v = a.shr(&imm).map_err(|e| with_line(e, line))?;
                set_reg(&mut t, base, inst.a(), v);
                Flow::Next
            }

            OpCode::JMP => Flow::Jump(jump_target(pc, inst)),
            OpCode::EQ => {
                let a = get_reg(&t, base, inst.a());
                let b = get_reg(&t, base, inst.b());
                skip_or_fall(a == b, inst.k(), pc)
            }
            OpCode::LT => {
                let a = get_reg(&t, base, inst.a());
                let b = get_reg(&t, base, inst.b());
                let cond = a.lt(&b).map_err(|e| with_line(e, line))?;
                skip_or_fall(cond, inst.k(), pc)
            }
            OpCode::LE => {
                let a = get_reg(&t, base, inst.a());
                let b = get_reg(&t, base, inst.b());
                let cond = a.le(&b).map_err(|e| with_line(e, line))?;
                skip_or_fall(cond, inst.k(), pc)
            }
            OpCode::TEST => {
                let cond = get_reg(&t, base, inst.a()).is_truthy();
                skip_or_fall(cond, inst.k(), pc)
            }
            OpCode::TESTSET => {
                let b = get_reg(&t, base, inst.b());
                let cond = b.is_truthy();
                if cond == inst.k() {
                    set_reg(&mut t, base, inst.a(), b);
                    Flow::Next
                } else {
                    Flow::Jump(pc + 2)
                }
            }
            OpCode::EQI => {
                let a = get_reg(&t, base, inst.a());
                let imm = inst.sb() as i64;
                let cond = match &a {
                    Value::Int(i) => *i == imm,
                    Value::Float(f) => *f == imm as f64,
                    _ => false,
                };
                skip_or_fall(cond, inst.k(), pc)
            }
            OpCode::LTI => {
                let a = get_reg(&t, base, inst.a());
                let imm = inst.sb() as f64;
                let av = a
                    .as_f64()
                    .ok_or_else(|| with_line(AqlError::runtime(format!("attempt to compare a {} value", a.type_name())), line))?;
                skip_or_fall(av < imm, inst.k(), pc)
            }

            OpCode::CALL => do_call(&mut t, base, inst, pc, line)?,
            // No true tail-call frame reuse: this is unreachable from the
            // grammar (no call-tail-position syntax emits it), so only
            // value-forwarding correctness matters here.
            OpCode::TAILCALL => do_call(&mut t, base, inst, pc, line)?,
            OpCode::RET_VOID => do_return(&mut t, Vec::new(), entry_depth),
            OpCode::RET_ONE => {
                let v = get_reg(&t, base, inst.a());
                do_return(&mut t, vec![v], entry_depth)
            }
            OpCode::RET => {
                let a = inst.a();
                let b = inst.b();
                let vals: Vec<Value> = if b == 0 {
                    (base + a as usize..t.stack.top).map(|i| t.stack_peek(i)).collect()
                } else {
                    (0..b - 1).map(|i| get_reg(&t, base, a + i)).collect()
                };
                do_return(&mut t, vals, entry_depth)
            }
            OpCode::FORLOOP => for_loop(&mut t, base, inst, pc).map_err(|e| with_line(e, line))?,
            OpCode::FORPREP => for_prep(&mut t, base, inst, pc).map_err(|e| with_line(e, line))?,
            OpCode::CLOSURE => {
                let bx = inst.bx() as usize;
                let child = proto
                    .protos
                    .get(bx)
                    .ok_or_else(|| with_line(AqlError::runtime("invalid child prototype index"), line))?;
                let child_rc = Rc::new(child.clone());
                let mut upvalues = Vec::with_capacity(child_rc.upvalues.len());
                for ud in &child_rc.upvalues {
                    if ud.in_stack {
                        upvalues.push(t.find_or_create_upvalue(base + ud.idx as usize));
                    } else {
                        upvalues.push(Rc::clone(&closure.upvalues[ud.idx as usize]));
                    }
                }
                let new_closure = Closure::new(child_rc, upvalues);
                set_reg(&mut t, base, inst.a(), Value::Closure(new_closure));
                Flow::Next
            }

            OpCode::NEWOBJECT => {
                let kind = ContainerKind::from_u8(inst.b() as u8)
                    .ok_or_else(|| with_line(AqlError::runtime("invalid container kind"), line))?;
                set_reg(&mut t, base, inst.a(), new_container(kind));
                Flow::Next
            }
            OpCode::GETPROP => {
                let container = get_reg(&t, base, inst.b());
                let key = get_reg(&t, base, inst.c());
                let v = container_get(&container, key).map_err(|e| with_line(e, line))?;
                set_reg(&mut t, base, inst.a(), v);
                Flow::Next
            }
            OpCode::SETPROP => {
                let container = get_reg(&t, base, inst.a());
                let key = get_reg(&t, base, inst.b());
                let value = if inst.k() { konst(&global, &proto, inst.c()) } else { get_reg(&t, base, inst.c()) };
                container_set(&container, key, value).map_err(|e| with_line(e, line))?;
                Flow::Next
            }
            OpCode::INVOKE => {
                // Method-call sugar, `OP_SELF`-style: stage the receiver at
                // A+1 and the looked-up method at A so a following CALL can
                // use A as its func register. No `obj:method(...)` syntax
                // exists, so this is never actually emitted.
                let obj = get_reg(&t, base, inst.b());
                let key = if inst.k() { konst(&global, &proto, inst.c()) } else { get_reg(&t, base, inst.c()) };
                let method = container_get(&obj, key).map_err(|e| with_line(e, line))?;
                set_reg(&mut t, base, inst.a() + 1, obj);
                set_reg(&mut t, base, inst.a(), method);
                Flow::Next
            }

            OpCode::YIELD => {
                let a = inst.a();
                let n = inst.b();
                let vals: Vec<Value> = if n == 0 {
                    (base + a as usize..t.stack.top).map(|i| t.stack_peek(i)).collect()
                } else {
                    (0..n - 1).map(|i| get_reg(&t, base, a + i)).collect()
                };
                debug!(values = vals.len(), "coroutine yield");
                Flow::Yielded(vals)
            }
            OpCode::RESUME => {
                let a = inst.a();
                let target = get_reg(&t, base, a);
                let other = match target {
                    Value::Thread(th) => th,
                    other => {
                        return Err(with_line(
                            AqlError::runtime(format!("attempt to resume a {} value", other.type_name())),
                            line,
                        ))
                    }
                };
                if Rc::ptr_eq(&other, thread) {
                    return Err(with_line(AqlError::runtime("cannot resume a running thread"), line));
                }
                let other_depth = other.borrow().call_depth();
                if other_depth == 0 {
                    return Err(with_line(AqlError::runtime("cannot resume a dead coroutine"), line));
                }
                debug!(other_depth, "coroutine resume");
                let result = dispatch_loop(&other, other_depth - 1, extra_builtins, gc_step_size)?;
                let vals = match result {
                    ExecResult::Return(v) | ExecResult::Yield(v) => v,
                };
                for (i, v) in vals.iter().enumerate() {
                    set_reg(&mut t, base, a + i as u32, v.clone());
                }
                t.stack.top = (base + a as usize + vals.len()).max(t.stack.top);
                Flow::Next
            }
            OpCode::BUILTIN => {
                let a = inst.a();
                let id = inst.b() as u16;
                let argc = inst.c();
                let call_args: Vec<Value> = (0..argc).map(|i| get_reg(&t, base, a + i)).collect();
                let result = if id < 6 {
                    builtins::dispatch(id as u8, &mut t, &call_args).map_err(|e| with_line(e, line))?
                } else if let Some(f) = extra_builtins.get(&id) {
                    let mut results = f(&mut t, &call_args).map_err(|e| with_line(e, line))?;
                    if results.is_empty() { Value::Nil } else { results.remove(0) }
                } else {
                    return Err(with_line(AqlError::runtime(format!("unknown builtin id {id}")), line));
                };
                set_reg(&mut t, base, a, result);
                Flow::Next
            }
            OpCode::VARARG => {
                let a = inst.a();
                let c = inst.c();
                let nextra = t.current_call_info().expect("active frame").nextraargs();
                let count = if c == 0 { nextra } else { (c as usize).saturating_sub(1) };
                for i in 0..count {
                    let v = if i < nextra { t.stack_peek(base - nextra + i) } else { Value::Nil };
                    set_reg(&mut t, base, a + i as u32, v);
                }
                if c == 0 {
                    t.stack.top = base + a as usize + count;
                }
                Flow::Next
            }
            OpCode::ITER_INIT => {
                let container = get_reg(&t, base, inst.a());
                set_reg(&mut t, base, inst.a(), iter_init_value(container));
                set_reg(&mut t, base, inst.a() + 1, Value::Int(0));
                Flow::Next
            }
            OpCode::ITER_NEXT => {
                let a = inst.a();
                let container = get_reg(&t, base, a);
                let cursor = match get_reg(&t, base, a + 1) {
                    Value::Int(i) => i,
                    _ => unreachable!("ITER_INIT always leaves an Int cursor"),
                };
                let len = container_iter_len(&container).map_err(|e| with_line(e, line))? as i64;
                if cursor >= len {
                    Flow::Jump(jump_target(pc, inst))
                } else {
                    let elem = container_iter_elem(&container, cursor).map_err(|e| with_line(e, line))?;
                    set_reg(&mut t, base, a + 2, elem);
                    set_reg(&mut t, base, a + 1, Value::Int(cursor + 1));
                    Flow::Next
                }
            }
        };

        match flow {
            Flow::Next => {
                t.current_call_info_mut().expect("frame still active").set_saved_pc(pc + 1);
            }
            Flow::Jump(target) => {
                t.current_call_info_mut().expect("frame still active").set_saved_pc(target);
            }
            Flow::FrameChanged => {}
            Flow::Returned(vals) => return Ok(ExecResult::Return(vals)),
            Flow::Yielded(vals) => {
                t.current_call_info_mut().expect("frame still active").set_saved_pc(pc + 1);
                return Ok(ExecResult::Yield(vals));
            }
        }
    }
}

fn get_reg(t: &Thread, base: usize, r: u32) -> Value {
    t.stack_peek(base + r as usize)
}

fn set_reg(t: &mut Thread, base: usize, r: u32, v: Value) {
    t.stack_set(base + r as usize, v);
}

fn konst(global: &Rc<RefCell<GlobalState>>, proto: &Proto, idx: u32) -> Value {
    proto.constants[idx as usize].to_value(&mut global.borrow_mut().strings)
}

/// `JMP`/`FORPREP`/`FORLOOP`/`ITER_NEXT` all encode a relative target the
/// same way: offset from the instruction *after* the jump.
fn jump_target(pc: usize, inst: Instruction) -> usize {
    ((pc as i64) + 1 + inst.sbx() as i64) as usize
}

fn skip_or_fall(cond: bool, k: bool, pc: usize) -> Flow {
    if cond != k {
        Flow::Jump(pc + 2)
    } else {
        Flow::Next
    }
}

fn with_line(e: AqlError, line: u32) -> AqlError {
    match e {
        AqlError::Runtime { line: None, message } => AqlError::runtime_at(line, message),
        other => other,
    }
}

fn adjust_results(mut vals: Vec<Value>, nresults: i32) -> Vec<Value> {
    if nresults >= 0 {
        vals.resize(nresults as usize, Value::Nil);
    }
    vals
}

fn do_return(t: &mut Thread, vals: Vec<Value>, entry_depth: usize) -> Flow {
    let popped = t.pop_call_info().expect("RET executed with no active frame");
    let vals = adjust_results(vals, popped.nresults());
    if t.call_depth() == entry_depth {
        return Flow::Returned(vals);
    }
    let func_abs = popped.func();
    for (i, v) in vals.iter().enumerate() {
        t.stack_set(func_abs + i, v.clone());
    }
    t.stack.top = func_abs + vals.len();
    let depth_before = t.call_depth();
    t.shrink_call_infos();
    trace!(depth = depth_before, "call-info chain shrunk");
    Flow::FrameChanged
}

fn do_call(t: &mut Thread, base: usize, inst: Instruction, pc: usize, line: u32) -> Result<Flow, AqlError> {
    CALLS_DISPATCHED.fetch_add(1, Ordering::Relaxed);
    let a = inst.a();
    let b = inst.b();
    let c = inst.c();
    let func_abs = base + a as usize;
    let callee = t.stack_peek(func_abs);
    let nargs = if b == 0 { t.stack.top - (func_abs + 1) } else { (b as usize) - 1 };
    match callee {
        Value::Closure(cl) => {
            let new_base = func_abs + 1;
            let numparams = cl.proto.numparams as usize;
            let maxstack = cl.proto.maxstacksize as usize;
            let before = t.stack.len();
            t.stack_ensure(maxstack + 8).map_err(|e| with_line(e, line))?;
            if t.stack.len() != before {
                trace!(from = before, to = t.stack.len(), "stack grown for nested call");
            }
            for i in nargs..numparams {
                t.stack_set(new_base + i, Value::Nil);
            }
            let nextra = if cl.proto.is_vararg && nargs > numparams { nargs - numparams } else { 0 };
            let top = new_base + maxstack;
            let nresults = if c == 0 { MULTRET } else { c as i32 - 1 };
            t.current_call_info_mut().expect("active frame").set_saved_pc(pc + 1);
            t.stack.top = top.max(new_base + nargs);
            let mut ci = CallInfo::new_aql(func_abs, new_base, top, nresults, Rc::clone(&cl));
            ci.set_nextraargs(nextra);
            t.push_call_info(ci);
            Ok(Flow::FrameChanged)
        }
        Value::CFunction(cf) => {
            let call_args: Vec<Value> = (0..nargs).map(|i| t.stack_peek(func_abs + 1 + i)).collect();
            let results = (cf.func)(t, &call_args).map_err(|e| with_line(e, line))?;
            let nresults = if c == 0 { -1 } else { c as i32 - 1 };
            let results = adjust_results(results, nresults);
            for (i, v) in results.iter().enumerate() {
                t.stack_set(func_abs + i, v.clone());
            }
            t.stack.top = func_abs + results.len();
            Ok(Flow::Jump(pc + 1))
        }
        other => Err(with_line(AqlError::runtime(format!("attempt to call a {} value", other.type_name())), line)),
    }
}

fn for_prep(t: &mut Thread, base: usize, inst: Instruction, pc: usize) -> Result<Flow, AqlError> {
    let a = inst.a();
    let start = get_reg(t, base, a);
    let stop = get_reg(t, base, a + 1);
    let step = get_reg(t, base, a + 2);
    let after = jump_target(pc, inst);
    match (&start, &stop, &step) {
        (Value::Int(s), Value::Int(e), Value::Int(st)) => {
            if *st == 0 {
                return Err(AqlError::runtime("'for' step is zero"));
            }
            let zero = if *st > 0 { s > e } else { s < e };
            set_reg(t, base, a, Value::Int(s.wrapping_sub(*st)));
            if zero {
                Ok(Flow::Jump(after))
            } else {
                set_reg(t, base, a + 3, Value::Int(*s));
                Ok(Flow::Next)
            }
        }
        _ => {
            let s = start.as_f64().ok_or_else(|| AqlError::runtime("'for' initial value must be a number"))?;
            let e = stop.as_f64().ok_or_else(|| AqlError::runtime("'for' limit must be a number"))?;
            let st = step.as_f64().ok_or_else(|| AqlError::runtime("'for' step must be a number"))?;
            if st == 0.0 {
                return Err(AqlError::runtime("'for' step is zero"));
            }
            let zero = if st > 0.0 { s > e } else { s < e };
            set_reg(t, base, a, Value::Float(s - st));
            if zero {
                Ok(Flow::Jump(after))
            } else {
                set_reg(t, base, a + 3, Value::Float(s));
                Ok(Flow::Next)
            }
        }
    }
}

fn for_loop(t: &mut Thread, base: usize, inst: Instruction, pc: usize) -> Result<Flow, AqlError> {
    let a = inst.a();
    let body_start = jump_target(pc, inst);
    match get_reg(t, base, a) {
        Value::Int(i) => {
            let st = match get_reg(t, base, a + 2) {
                Value::Int(s) => s,
                _ => unreachable!("FORPREP keeps start/stop/step in lockstep"),
            };
            let e = match get_reg(t, base, a + 1) {
                Value::Int(e) => e,
                _ => unreachable!("FORPREP keeps start/stop/step in lockstep"),
            };
            let next = i.wrapping_add(st);
            let cont = if st > 0 { next <= e } else { next >= e };
            set_reg(t, base, a, Value::Int(next));
            if cont {
                set_reg(t, base, a + 3, Value::Int(next));
                Ok(Flow::Jump(body_start))
            } else {
                Ok(Flow::Next)
            }
        }
        Value::Float(f) => {
            let st = get_reg(t, base, a + 2).as_f64().expect("FORPREP keeps start/stop/step in lockstep");
            let e = get_reg(t, base, a + 1).as_f64().expect("FORPREP keeps start/stop/step in lockstep");
            let next = f + st;
            let cont = if st > 0.0 { next <= e } else { next >= e };
            set_reg(t, base, a, Value::Float(next));
            if cont {
                set_reg(t, base, a + 3, Value::Float(next));
                Ok(Flow::Jump(body_start))
            } else {
                Ok(Flow::Next)
            }
        }
        _ => unreachable!("FORPREP always leaves an Int or Float counter at R(A)"),
    }
}

fn new_container(kind: ContainerKind) -> Value {
    match kind {
        ContainerKind::Array => Value::Array(Rc::new(RefCell::new(ArrayObj::new()))),
        ContainerKind::Slice => {
            Value::Slice(Rc::new(RefCell::new(SliceObj::whole(Rc::new(RefCell::new(ArrayObj::new()))))))
        }
        ContainerKind::Dict => Value::Dict(Rc::new(RefCell::new(DictObj::new()))),
        ContainerKind::Vector => Value::Vector(Rc::new(RefCell::new(VectorObj::zeroed(0)))),
        ContainerKind::Range => Value::Range(Rc::new(RangeObj::new(0, 0, 1).expect("(0, 0, 1) is a valid range"))),
    }
}

fn key_to_index(key: &Value) -> Result<i64, AqlError> {
    match key {
        Value::Int(i) => Ok(*i),
        Value::Float(f) => Value::float_to_int_exact(*f).ok_or_else(|| AqlError::runtime("index is not an integer")),
        other => Err(AqlError::runtime(format!("attempt to index with a {} value", other.type_name()))),
    }
}

fn container_get(container: &Value, key: Value) -> Result<Value, AqlError> {
    match container {
        Value::Dict(d) => d.borrow().get(key),
        Value::Array(a) => a.borrow().get(key_to_index(&key)?),
        Value::Slice(s) => s.borrow().get(key_to_index(&key)?),
        Value::Vector(v) => v.borrow().get(key_to_index(&key)?),
        Value::Range(r) => {
            let i = key_to_index(&key)?;
            if i < 0 || i as usize >= r.len() {
                return Err(AqlError::runtime(format!("index {i} out of bounds (length {})", r.len())));
            }
            Ok(Value::Int(r.start + i * r.step))
        }
        other => Err(AqlError::runtime(format!("attempt to index a {} value", other.type_name()))),
    }
}

fn array_set(a: &Rc<RefCell<ArrayObj>>, index: i64, value: Value) -> Result<(), AqlError> {
    let len = a.borrow().len() as i64;
    if index == len {
        a.borrow_mut().push(value);
        Ok(())
    } else {
        a.borrow_mut().set(index, value)
    }
}

fn container_set(container: &Value, key: Value, value: Value) -> Result<(), AqlError> {
    match container {
        Value::Dict(d) => {
            aql_core::gc::write_barrier(&d.borrow().header, value.is_collectable());
            d.borrow_mut().set(key, value)
        }
        Value::Array(a) => {
            aql_core::gc::write_barrier(&a.borrow().header, value.is_collectable());
            array_set(a, key_to_index(&key)?, value)
        }
        Value::Slice(s) => {
            aql_core::gc::write_barrier(&s.borrow().header, value.is_collectable());
            s.borrow().set(key_to_index(&key)?, value)
        }
        Value::Vector(v) => {
            let i = key_to_index(&key)?;
            let f = value
                .as_f64()
                .ok_or_else(|| AqlError::runtime(format!("attempt to store a {} value in a vector", value.type_name())))?;
            v.borrow_mut().set(i, f)
        }
        Value::Range(_) => Err(AqlError::runtime("range values are immutable")),
        other => Err(AqlError::runtime(format!("attempt to index a {} value", other.type_name()))),
    }
}

/// `#`/`OP_LEN`, extended to `Range` (`Value::len` doesn't cover it since
/// container lengths outside the core arithmetic model live here instead).
fn container_len(v: &Value) -> Result<i64, AqlError> {
    match v {
        Value::Range(r) => Ok(r.len() as i64),
        other => other.len(),
    }
}

/// `for x in <dict>` iterates keys; everything else iterates itself.
/// Materializing into a fresh `Array` up front means `ITER_NEXT` only ever
/// deals with index-addressable containers.
fn iter_init_value(container: Value) -> Value {
    match container {
        Value::Dict(d) => {
            let keys: Vec<Value> = d.borrow().keys().cloned().collect();
            Value::Array(Rc::new(RefCell::new(ArrayObj::from_values(keys))))
        }
        other => other,
    }
}

fn container_iter_len(container: &Value) -> Result<usize, AqlError> {
    match container {
        Value::Array(a) => Ok(a.borrow().len()),
        Value::Slice(s) => Ok(s.borrow().len()),
        Value::Vector(v) => Ok(v.borrow().len()),
        Value::Range(r) => Ok(r.len()),
        other => Err(AqlError::runtime(format!("attempt to iterate a {} value", other.type_name()))),
    }
}

fn container_iter_elem(container: &Value, cursor: i64) -> Result<Value, AqlError> {
    match container {
        Value::Array(a) => a.borrow().get(cursor),
        Value::Slice(s) => s.borrow().get(cursor),
        Value::Vector(v) => v.borrow().get(cursor),
        Value::Range(r) => Ok(Value::Int(r.start + cursor * r.step)),
        other => Err(AqlError::runtime(format!("attempt to iterate a {} value", other.type_name()))),
    }
}
