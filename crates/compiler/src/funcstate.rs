//! Compile-time function context (spec §3 "Function state (FuncState)",
//! "Block (BlockCnt)") and the `expdesc` primitives from spec §4.D that
//! turn an `ExpDesc` into concrete instructions.
//!
//! This implementation compiles a single top-level chunk (the "main
//! function"); there is no nested function-literal production in the
//! documented surface grammar (spec §6 lists no function-definition
//! statement), so `FuncState` has no parent link and `singlevar` only ever
//! bottoms out at the chunk's own `_ENV` upvalue. See `DESIGN.md` for the
//! scope note — `CLOSURE`/`GETUPVAL`/`SETUPVAL`/upvalue-chain machinery
//! still exists and is exercised directly in `aql-runtime`'s VM tests.

use aql_core::{AqlError, Constant, Instruction, OpCode, Proto, UpvalDesc};

use crate::expdesc::{ExpDesc, ExpKind, NO_JUMP};

pub const ENV_UPVAL_INDEX: u8 = 0;

/// A compile-time scope (spec §3 "Block (BlockCnt)").
pub struct BlockCnt {
    pub nactvar_on_entry: u8,
    pub is_loop: bool,
    pub break_list: i32,
    pub continue_list: i32,
    /// Set when some local declared in this block has been captured by an
    /// upvalue and therefore needs a `CLOSE` on block exit.
    pub upval: bool,
}

pub struct FuncState {
    pub proto: Proto,
    pub freereg: u8,
    pub nactvar: u8,
    /// Active locals in declaration order; index doubles as register.
    actvar: Vec<String>,
    blocks: Vec<BlockCnt>,
    line: u32,
}

impl FuncState {
    pub fn new(source: impl Into<String>) -> Self {
        let mut proto = Proto::new(source);
        // Main-chunk prologue (spec §4.D "Function prologue/epilogue"):
        // allocate upvalue #0 named `_ENV`.
        proto.upvalues.push(UpvalDesc { name: "_ENV".to_string(), in_stack: true, idx: 0 });
        FuncState {
            proto,
            freereg: 0,
            nactvar: 0,
            actvar: Vec::new(),
            blocks: Vec::new(),
            line: 0,
        }
    }

    pub fn set_line(&mut self, line: u32) {
        self.line = line;
    }

    pub fn pc(&self) -> i32 {
        self.proto.code.len() as i32
    }

    // ---- instruction emission ----

    fn emit(&mut self, inst: Instruction) -> i32 {
        self.proto.code.push(inst);
        self.proto.line_info.push(self.line);
        self.pc() - 1
    }

    pub fn code_abc(&mut self, op: OpCode, a: u32, b: u32, c: u32, k: bool) -> i32 {
        self.emit(Instruction::iabc(op, a, b, c, k))
    }

    pub fn code_abx(&mut self, op: OpCode, a: u32, bx: u32) -> i32 {
        self.emit(Instruction::iabx(op, a, bx))
    }

    pub fn code_asbx(&mut self, op: OpCode, a: u32, sbx: i32) -> i32 {
        self.emit(Instruction::iasbx(op, a, sbx))
    }

    /// `LOADNIL A B`: nil-fill `R(A..A+B)`.
    pub fn nil(&mut self, from: u8, n: u8) {
        if n > 0 {
            self.code_abc(OpCode::LOADNIL, from as u32, (n - 1) as u32, 0, false);
        }
    }

    // ---- jump-patch-list primitives (spec §4.D, §8 property 7) ----

    pub fn jump(&mut self) -> i32 {
        self.code_asbx(OpCode::JMP, 0, NO_JUMP)
    }

    fn get_jump(&self, pc: i32) -> i32 {
        let sbx = self.proto.code[pc as usize].sbx();
        if sbx == NO_JUMP {
            NO_JUMP
        } else {
            pc + 1 + sbx
        }
    }

    fn fix_jump(&mut self, pc: i32, target: i32) {
        let offset = target - (pc + 1);
        self.proto.code[pc as usize].set_sbx(offset);
    }

    pub fn concat(&mut self, l1: i32, l2: i32) -> i32 {
        if l2 == NO_JUMP {
            return l1;
        }
        if l1 == NO_JUMP {
            return l2;
        }
        let mut list = l1;
        loop {
            let next = self.get_jump(list);
            if next == NO_JUMP {
                break;
            }
            list = next;
        }
        self.fix_jump(list, l2);
        l1
    }

    pub fn patch_list(&mut self, list: i32, target: i32) {
        let mut list = list;
        while list != NO_JUMP {
            let next = self.get_jump(list);
            self.fix_jump(list, target);
            list = next;
        }
    }

    pub fn patch_to_here(&mut self, list: i32) {
        let here = self.pc();
        self.patch_list(list, here);
    }

    /// Every jump this chunk emitted must have been patched away from
    /// `NO_JUMP` by the time compilation finishes (spec §8 property 7).
    pub fn assert_no_pending_jumps(&self) -> Result<(), AqlError> {
        for (pc, inst) in self.proto.code.iter().enumerate() {
            if inst.opcode() == OpCode::JMP && inst.sbx() == NO_JUMP {
                return Err(AqlError::runtime(format!("internal: unpatched jump at pc {pc}")));
            }
        }
        Ok(())
    }

    // ---- registers ----

    pub fn reserve_regs(&mut self, n: u8) {
        self.freereg += n;
        if self.freereg > self.proto.maxstacksize {
            self.proto.maxstacksize = self.freereg;
        }
    }

    /// Reclaim every temporary above the active locals. Called at each
    /// statement boundary so register allocation never drifts.
    pub fn close_temporaries(&mut self) {
        self.freereg = self.nactvar;
    }

    pub fn free_reg(&mut self, reg: u8) {
        if reg >= self.nactvar && reg == self.freereg.saturating_sub(1) {
            self.freereg -= 1;
        }
    }

    pub fn free_exp(&mut self, e: &ExpDesc) {
        if let ExpKind::NonReloc(r) = e.kind {
            self.free_reg(r);
        }
    }

    // ---- constants ----

    /// `addk`: linear scan for deduplication (spec §4.D, §8 property 3).
    pub fn addk(&mut self, c: Constant) -> u32 {
        if let Some(pos) = self.proto.constants.iter().position(|existing| *existing == c) {
            return pos as u32;
        }
        self.proto.constants.push(c);
        (self.proto.constants.len() - 1) as u32
    }

    // ---- locals ----

    pub fn new_local(&mut self, name: impl Into<String>) -> u8 {
        self.actvar.push(name.into());
        (self.actvar.len() - 1) as u8
    }

    /// Activate the most recently declared local (spec §4.D "Local
    /// declaration": the new local is only active *after* its RHS is
    /// evaluated).
    pub fn activate_local(&mut self) {
        self.nactvar = self.actvar.len() as u8;
    }

    pub fn resolve_local(&self, name: &str) -> Option<u8> {
        self.actvar[..self.nactvar as usize].iter().rposition(|n| n == name).map(|i| i as u8)
    }

    pub fn local_name(&self, reg: u8) -> Option<&str> {
        self.actvar.get(reg as usize).map(|s| s.as_str())
    }

    // ---- blocks ----

    pub fn enter_block(&mut self, is_loop: bool) {
        self.blocks.push(BlockCnt {
            nactvar_on_entry: self.nactvar,
            is_loop,
            break_list: NO_JUMP,
            continue_list: NO_JUMP,
            upval: false,
        });
    }

    /// Leave the innermost block, truncating locals declared inside it and
    /// returning its break-jump list for the caller to patch.
    pub fn leave_block(&mut self) -> i32 {
        let block = self.blocks.pop().expect("leave_block without matching enter_block");
        self.actvar.truncate(block.nactvar_on_entry as usize);
        self.nactvar = block.nactvar_on_entry;
        self.freereg = self.nactvar;
        block.break_list
    }

    pub fn innermost_loop(&self) -> Option<usize> {
        self.blocks.iter().rposition(|b| b.is_loop)
    }

    pub fn add_break(&mut self, pc: i32) -> Result<(), AqlError> {
        let idx = self.innermost_loop().ok_or_else(|| AqlError::runtime("break outside a loop"))?;
        self.blocks[idx].break_list = self.concat(self.blocks[idx].break_list, pc);
        Ok(())
    }

    pub fn add_continue(&mut self, pc: i32) -> Result<(), AqlError> {
        let idx = self.innermost_loop().ok_or_else(|| AqlError::runtime("continue outside a loop"))?;
        self.blocks[idx].continue_list = self.concat(self.blocks[idx].continue_list, pc);
        Ok(())
    }

    pub fn loop_continue_list(&self, idx: usize) -> i32 {
        self.blocks[idx].continue_list
    }

    // ---- expdesc materialization (spec §4.D "expdesc protocol") ----

    /// Resolve a name to a local register or a `_ENV` index (spec §4.D
    /// `singlevar`). With no nested functions there is no upvalue chain to
    /// walk: anything that is not an active local is a global.
    pub fn singlevar(&mut self, name: &str) -> ExpDesc {
        if let Some(reg) = self.resolve_local(name) {
            return ExpDesc::new(ExpKind::Local(reg));
        }
        let key_k = self.addk(Constant::Str(name.to_string()));
        ExpDesc::new(ExpKind::IndexUp { upval: ENV_UPVAL_INDEX, key_k })
    }

    pub fn indexed(&mut self, table: &ExpDesc, key: &ExpDesc) -> Result<ExpDesc, AqlError> {
        if let (ExpKind::IndexUp { upval, key_k: _ }, ExpKind::K(k)) = (&table.kind, &key.kind) {
            return Ok(ExpDesc::new(ExpKind::IndexUp { upval: *upval, key_k: *k }));
        }
        let table_reg = self.exp2anyreg_val(table.clone())?;
        let key_reg = self.exp2anyreg_val(key.clone())?;
        Ok(ExpDesc::new(ExpKind::Index { table: table_reg, key: key_reg }))
    }

    /// Turn `Local`/`IndexUp`/`Index` into something `discharge2reg` can
    /// place in a register; multi-result `Call`/`Vararg` are pinned down to
    /// exactly one result.
    fn dischargevars(&mut self, e: ExpDesc) -> Result<ExpDesc, AqlError> {
        match e.kind {
            ExpKind::Local(r) => Ok(ExpDesc { kind: ExpKind::NonReloc(r), ..e }),
            ExpKind::IndexUp { upval, key_k } => {
                let pc = self.code_abc(OpCode::GETTABUP, 0, upval as u32, key_k, true);
                Ok(ExpDesc { kind: ExpKind::Reloc(pc as u32), ..e })
            }
            ExpKind::Index { table, key } => {
                let pc = self.code_abc(OpCode::GETPROP, 0, table as u32, key as u32, false);
                Ok(ExpDesc { kind: ExpKind::Reloc(pc as u32), ..e })
            }
            ExpKind::Call(pc) => {
                self.proto.code[pc as usize].set_c(2);
                Ok(ExpDesc { kind: ExpKind::NonReloc(self.proto.code[pc as usize].a() as u8), ..e })
            }
            ExpKind::Vararg(pc) => {
                self.proto.code[pc as usize].set_c(2);
                Ok(ExpDesc { kind: ExpKind::Reloc(pc), ..e })
            }
            _ => Ok(e),
        }
    }

    /// Emit whatever instruction is needed to land `e`'s value in `reg`
    /// (spec §4.D `discharge2reg`).
    fn discharge2reg(&mut self, e: ExpDesc, reg: u8) -> Result<ExpDesc, AqlError> {
        let e = self.dischargevars(e)?;
        match e.kind {
            ExpKind::Nil => {
                self.code_abc(OpCode::LOADNIL, reg as u32, 0, 0, false);
            }
            ExpKind::True => {
                self.code_abc(OpCode::LOADTRUE, reg as u32, 0, 0, false);
            }
            ExpKind::False => {
                self.code_abc(OpCode::LOADFALSE, reg as u32, 0, 0, false);
            }
            ExpKind::KInt(i) if i32::try_from(i).is_ok() => {
                self.code_asbx(OpCode::LOADI, reg as u32, i as i32);
            }
            ExpKind::KInt(i) => {
                let k = self.addk(Constant::Int(i));
                self.code_abx(OpCode::LOADK, reg as u32, k);
            }
            ExpKind::KFlt(f) => {
                let k = self.addk(Constant::Float(f));
                self.code_abx(OpCode::LOADK, reg as u32, k);
            }
            ExpKind::K(k) => {
                self.code_abx(OpCode::LOADK, reg as u32, k);
            }
            ExpKind::NonReloc(src) => {
                if src != reg {
                    self.code_abc(OpCode::MOVE, reg as u32, src as u32, 0, false);
                }
            }
            ExpKind::Reloc(pc) => {
                self.proto.code[pc as usize].set_a(reg as u32);
            }
            // A bare jump (a pending comparison) is not a value yet;
            // `exp2reg` turns it into one below. Leave it untouched here,
            // matching the original's discharge2reg default case.
            ExpKind::Void | ExpKind::Jmp(_) => return Ok(e),
            ExpKind::IndexUp { .. } | ExpKind::Index { .. } | ExpKind::Call(_) | ExpKind::Vararg(_) => {
                unreachable!("dischargevars should have removed this kind")
            }
        }
        Ok(ExpDesc { kind: ExpKind::NonReloc(reg), t: e.t, f: e.f })
    }

    /// Materialize `e` into `reg`. A comparison's pending jump becomes a
    /// real boolean: `LOADFALSE`/`LOADTRUE` pair bracketed around a skip
    /// jump, with the comparison's own jump routed to whichever half
    /// matches its outcome (spec §4.D `exp2reg`).
    pub fn exp2reg(&mut self, e: ExpDesc, reg: u8) -> Result<(), AqlError> {
        let mut e = self.discharge2reg(e, reg)?;
        if let ExpKind::Jmp(pc) = e.kind {
            e.t = self.concat(e.t, pc as i32);
        }
        if !e.has_jumps() {
            return Ok(());
        }
        let skip_dance = if matches!(e.kind, ExpKind::Jmp(_)) { NO_JUMP } else { self.jump() };
        let load_false_pc = self.code_abc(OpCode::LOADFALSE, reg as u32, 0, 0, false);
        let over_true = self.jump();
        let load_true_pc = self.code_abc(OpCode::LOADTRUE, reg as u32, 0, 0, false);
        self.patch_to_here(over_true);
        if skip_dance != NO_JUMP {
            self.patch_to_here(skip_dance);
        }
        self.patch_list(e.f, load_false_pc);
        self.patch_list(e.t, load_true_pc);
        Ok(())
    }

    /// Emit `TEST reg _ k` followed by a forward jump, for a condition or
    /// short-circuit test already materialized into `reg` (spec §4.F
    /// `TEST`). Returns the jump's pc for the caller to patch.
    pub fn test_and_jump(&mut self, reg: u8, k: bool) -> i32 {
        self.code_abc(OpCode::TEST, reg as u32, 0, 0, k);
        self.jump()
    }

    pub fn exp2nextreg(&mut self, e: ExpDesc) -> Result<u8, AqlError> {
        let e = self.dischargevars(e)?;
        self.free_exp(&e);
        let reg = self.freereg;
        self.reserve_regs(1);
        self.exp2reg(e, reg)?;
        Ok(reg)
    }

    pub fn exp2anyreg(&mut self, e: ExpDesc) -> Result<u8, AqlError> {
        let e = self.dischargevars(e)?;
        if let ExpKind::NonReloc(r) = e.kind {
            if !e.has_jumps() {
                return Ok(r);
            }
            if r >= self.nactvar {
                self.exp2reg(e, r)?;
                return Ok(r);
            }
        }
        self.exp2nextreg(e)
    }

    fn exp2anyreg_val(&mut self, e: ExpDesc) -> Result<u8, AqlError> {
        self.exp2anyreg(e)
    }

    /// Constant-or-register operand for an opcode argument carrying a
    /// shared `k` bit (spec §4.D `exp2RK`): returns the full-width index
    /// (constant-table index, or register number) plus whether it's a
    /// constant. The caller threads the bool into the instruction's single
    /// `k` flag rather than folding it into the index itself.
    pub fn exp2rk(&mut self, e: ExpDesc) -> Result<(u32, bool), AqlError> {
        match e.kind {
            ExpKind::Nil => Ok((self.addk(Constant::Nil), true)),
            ExpKind::True => Ok((self.addk(Constant::Bool(true)), true)),
            ExpKind::False => Ok((self.addk(Constant::Bool(false)), true)),
            ExpKind::KInt(i) => Ok((self.addk(Constant::Int(i)), true)),
            ExpKind::KFlt(f) => Ok((self.addk(Constant::Float(f)), true)),
            ExpKind::K(k) => Ok((k, true)),
            _ => Ok((self.exp2anyreg(e)? as u32, false)),
        }
    }

    /// Assign the value in `ex` to the variable described by `var` (spec
    /// §4.D `storevar`).
    pub fn storevar(&mut self, var: &ExpDesc, ex: ExpDesc) -> Result<(), AqlError> {
        match var.kind {
            ExpKind::Local(reg) => {
                self.exp2reg(ex, reg)?;
            }
            ExpKind::IndexUp { upval, key_k } => {
                let (src, is_k) = self.exp2rk(ex)?;
                self.code_abc(OpCode::SETTABUP, upval as u32, key_k, src, is_k);
            }
            ExpKind::Index { table, key } => {
                let (src, is_k) = self.exp2rk(ex)?;
                self.code_abc(OpCode::SETPROP, table as u32, key as u32, src, is_k);
            }
            _ => return Err(AqlError::runtime("internal: cannot assign to this expression")),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addk_dedups_equal_constants() {
        let mut fs = FuncState::new("test");
        let a = fs.addk(Constant::Int(7));
        let b = fs.addk(Constant::Str("x".to_string()));
        let c = fs.addk(Constant::Int(7));
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(fs.proto.constants.len(), 2);
    }

    #[test]
    fn jump_patch_list_resolves_forward_references() {
        let mut fs = FuncState::new("test");
        let j1 = fs.jump();
        let j2 = fs.jump();
        let list = fs.concat(j1, j2);
        fs.patch_to_here(list);
        assert!(fs.assert_no_pending_jumps().is_ok());
        assert_eq!(fs.get_jump(j1), fs.pc());
        assert_eq!(fs.get_jump(j2), fs.pc());
    }

    #[test]
    fn local_resolution_respects_activation() {
        let mut fs = FuncState::new("test");
        fs.new_local("x");
        assert_eq!(fs.resolve_local("x"), None, "not active until activate_local");
        fs.activate_local();
        assert_eq!(fs.resolve_local("x"), Some(0));
    }

    #[test]
    fn block_exit_truncates_locals_and_registers() {
        let mut fs = FuncState::new("test");
        fs.new_local("x");
        fs.activate_local();
        fs.reserve_regs(1);
        fs.enter_block(false);
        fs.new_local("y");
        fs.activate_local();
        fs.reserve_regs(1);
        fs.leave_block();
        assert_eq!(fs.nactvar, 1);
        assert_eq!(fs.freereg, 1);
        assert_eq!(fs.resolve_local("y"), None);
        assert_eq!(fs.resolve_local("x"), Some(0));
    }
}
