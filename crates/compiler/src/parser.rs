//! Single-pass recursive-descent parser and code generator (spec §4.D, §6).
//!
//! There is no separate AST: each grammar production calls straight into
//! [`FuncState`]'s `expdesc` machinery and emits bytecode as it goes, the
//! way the original's `aparser.c` drives `acode.h` directly.

use aql_core::{AqlError, Constant, ContainerKind, OpCode, Proto, Value};

use crate::expdesc::{ExpDesc, ExpKind, NO_JUMP};
use crate::funcstate::FuncState;
use crate::lexer::Lexer;
use crate::token::{Token, TokenKind};

const UNARY_PRIORITY: u8 = 12;

#[derive(Clone, Copy, Debug)]
enum UnOp {
    Neg,
    Not,
    Len,
    BNot,
}

fn unop_for(kind: &TokenKind) -> Option<UnOp> {
    match kind {
        TokenKind::Minus => Some(UnOp::Neg),
        TokenKind::Not => Some(UnOp::Not),
        TokenKind::Hash => Some(UnOp::Len),
        TokenKind::Tilde => Some(UnOp::BNot),
        _ => None,
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Band,
    Bor,
    Bxor,
    Shl,
    Shr,
    Concat,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// Returns the operator plus its (left, right) binding power, per the
/// priority table in spec §4.D. Right-associative operators (`..`, `**`)
/// bind looser on the right than the left.
fn binop_for(kind: &TokenKind) -> Option<(BinOp, u8, u8)> {
    let (op, l, r) = match kind {
        TokenKind::Or | TokenKind::OrOr => (BinOp::Or, 1, 1),
        TokenKind::And | TokenKind::AndAnd => (BinOp::And, 2, 2),
        TokenKind::EqEq => (BinOp::Eq, 3, 3),
        TokenKind::NotEq => (BinOp::Ne, 3, 3),
        TokenKind::Lt => (BinOp::Lt, 3, 3),
        TokenKind::LtEq => (BinOp::Le, 3, 3),
        TokenKind::Gt => (BinOp::Gt, 3, 3),
        TokenKind::GtEq => (BinOp::Ge, 3, 3),
        TokenKind::Pipe => (BinOp::Bor, 4, 4),
        TokenKind::Tilde => (BinOp::Bxor, 5, 5),
        TokenKind::Amp => (BinOp::Band, 6, 6),
        TokenKind::Shl => (BinOp::Shl, 7, 7),
        TokenKind::Shr => (BinOp::Shr, 7, 7),
        TokenKind::DotDot => (BinOp::Concat, 9, 8),
        TokenKind::Plus => (BinOp::Add, 10, 10),
        TokenKind::Minus => (BinOp::Sub, 10, 10),
        TokenKind::Star => (BinOp::Mul, 11, 11),
        TokenKind::Slash => (BinOp::Div, 11, 11),
        TokenKind::Percent => (BinOp::Mod, 11, 11),
        TokenKind::Pow => (BinOp::Pow, 14, 13),
        _ => return None,
    };
    Some((op, l, r))
}

fn builtin_id(name: &str) -> Option<u8> {
    match name {
        "print" => Some(0),
        "len" => Some(1),
        "type" => Some(2),
        "tostring" => Some(3),
        "tonumber" => Some(4),
        "range" => Some(5),
        _ => None,
    }
}

fn numeral_value(e: &ExpDesc) -> Option<Value> {
    match e.kind {
        ExpKind::KInt(i) => Some(Value::Int(i)),
        ExpKind::KFlt(f) => Some(Value::Float(f)),
        _ => None,
    }
}

/// Fold a binary op applied to two numeral constants at compile time,
/// reusing [`Value`]'s arithmetic so folded results can never disagree
/// with what the VM would compute at run time.
fn fold_binop(op: BinOp, lhs: &ExpDesc, rhs: &ExpDesc) -> Option<ExpDesc> {
    let a = numeral_value(lhs)?;
    let b = numeral_value(rhs)?;
    let result = match op {
        BinOp::Add => a.add(&b).ok()?,
        BinOp::Sub => a.sub(&b).ok()?,
        BinOp::Mul => a.mul(&b).ok()?,
        BinOp::Div => a.div(&b).ok()?,
        BinOp::Mod => a.modulo(&b).ok()?,
        BinOp::Pow => a.pow(&b).ok()?,
        BinOp::Band => a.band(&b).ok()?,
        BinOp::Bor => a.bor(&b).ok()?,
        BinOp::Bxor => a.bxor(&b).ok()?,
        BinOp::Shl => a.shl(&b).ok()?,
        BinOp::Shr => a.shr(&b).ok()?,
        _ => return None,
    };
    match result {
        Value::Int(i) => Some(ExpDesc::new(ExpKind::KInt(i))),
        Value::Float(f) => Some(ExpDesc::new(ExpKind::KFlt(f))),
        _ => None,
    }
}

fn fold_unop(op: UnOp, e: &ExpDesc) -> Option<ExpDesc> {
    match (op, &e.kind) {
        (UnOp::Neg, ExpKind::KInt(i)) => Some(ExpDesc::new(ExpKind::KInt(i.wrapping_neg()))),
        (UnOp::Neg, ExpKind::KFlt(f)) => Some(ExpDesc::new(ExpKind::KFlt(-f))),
        _ => None,
    }
}

pub struct Parser<'src> {
    lexer: Lexer<'src>,
    cur: Token,
    source_name: String,
    fs: FuncState,
}

impl<'src> Parser<'src> {
    pub fn new(source_name: impl Into<String>, source: &'src str) -> Result<Self, AqlError> {
        let source_name = source_name.into();
        let mut lexer = Lexer::new(source_name.clone(), source);
        let cur = lexer.scan()?;
        Ok(Parser { lexer, cur, source_name: source_name.clone(), fs: FuncState::new(source_name) })
    }

    /// Parse a whole chunk into a main-function [`Proto`] (spec §4.D
    /// "Function prologue/epilogue"). There is no nested function-literal
    /// production in the documented grammar, so this is the only `Proto`
    /// this compiler ever produces; see `DESIGN.md`.
    pub fn parse_chunk(mut self) -> Result<Proto, AqlError> {
        self.block()?;
        self.expect(&TokenKind::Eof)?;
        self.fs.code_abc(OpCode::RET_VOID, 0, 0, 0, false);
        self.fs.assert_no_pending_jumps()?;
        Ok(self.fs.proto)
    }

    // ---- token plumbing ----

    fn advance(&mut self) -> Result<Token, AqlError> {
        let next = self.lexer.scan()?;
        Ok(std::mem::replace(&mut self.cur, next))
    }

    fn check(&self, kind: &TokenKind) -> bool {
        std::mem::discriminant(&self.cur.kind) == std::mem::discriminant(kind)
    }

    fn accept(&mut self, kind: &TokenKind) -> Result<bool, AqlError> {
        if self.check(kind) {
            self.advance()?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<Token, AqlError> {
        if self.check(kind) {
            self.advance()
        } else {
            Err(self.syntax_error(format!("'{}' expected", kind.describe())))
        }
    }

    fn expect_name(&mut self) -> Result<String, AqlError> {
        match self.cur.kind.clone() {
            TokenKind::Name(n) => {
                self.advance()?;
                Ok(n)
            }
            _ => Err(self.syntax_error("<name> expected")),
        }
    }

    fn accept_semi(&mut self) -> Result<(), AqlError> {
        self.accept(&TokenKind::Semicolon)?;
        Ok(())
    }

    fn at_block_end(&self) -> bool {
        matches!(self.cur.kind, TokenKind::RBrace | TokenKind::Eof | TokenKind::Semicolon)
    }

    fn syntax_error(&self, message: impl Into<String>) -> AqlError {
        AqlError::syntax(self.source_name.clone(), self.cur.line, self.cur.kind.describe(), message)
    }

    // ---- statements ----

    fn block(&mut self) -> Result<(), AqlError> {
        while !matches!(self.cur.kind, TokenKind::RBrace | TokenKind::Eof) {
            self.statement()?;
        }
        Ok(())
    }

    fn statement(&mut self) -> Result<(), AqlError> {
        match self.cur.kind {
            TokenKind::Semicolon => {
                self.advance()?;
                Ok(())
            }
            TokenKind::Let => self.let_stmt(),
            TokenKind::If => self.if_stmt(),
            TokenKind::While => self.while_stmt(),
            TokenKind::For => self.for_stmt(),
            TokenKind::Return => self.return_stmt(),
            TokenKind::Break => {
                self.advance()?;
                let pc = self.fs.jump();
                self.fs.add_break(pc)?;
                self.accept_semi()
            }
            TokenKind::Continue => {
                self.advance()?;
                let pc = self.fs.jump();
                self.fs.add_continue(pc)?;
                self.accept_semi()
            }
            TokenKind::LBrace => {
                self.advance()?;
                self.fs.enter_block(false);
                self.block()?;
                self.fs.leave_block();
                self.expect(&TokenKind::RBrace)?;
                Ok(())
            }
            TokenKind::Name(_) => self.name_stmt(),
            _ => Err(self.syntax_error("unexpected symbol")),
        }
    }

    fn let_stmt(&mut self) -> Result<(), AqlError> {
        self.advance()?; // 'let'
        let name = self.expect_name()?;
        if self.accept(&TokenKind::Colon)? {
            self.expect_name()?; // type annotation, not enforced (no static type checker)
        }
        self.expect(&TokenKind::Assign)?;
        let e = self.expr()?;
        let reg = self.fs.exp2nextreg(e)?;
        let local_reg = self.fs.new_local(name);
        debug_assert_eq!(reg, local_reg, "a local's value must land exactly in its own register");
        self.fs.activate_local();
        self.fs.close_temporaries();
        self.accept_semi()
    }

    fn name_stmt(&mut self) -> Result<(), AqlError> {
        let name = self.expect_name()?;
        if self.accept(&TokenKind::ColonEq)? {
            let rhs = self.expr()?;
            if let Some(reg) = self.fs.resolve_local(&name) {
                let var = ExpDesc::new(ExpKind::Local(reg));
                self.fs.storevar(&var, rhs)?;
            } else {
                let reg = self.fs.exp2nextreg(rhs)?;
                let local_reg = self.fs.new_local(name);
                debug_assert_eq!(reg, local_reg);
                self.fs.activate_local();
            }
        } else {
            let mut e = self.name_base(name)?;
            e = self.index_chain(e)?;
            if self.accept(&TokenKind::Assign)? {
                let rhs = self.expr()?;
                self.fs.storevar(&e, rhs)?;
            } else {
                self.fs.exp2nextreg(e)?;
            }
        }
        self.fs.close_temporaries();
        self.accept_semi()
    }

    fn if_stmt(&mut self) -> Result<(), AqlError> {
        self.advance()?; // 'if'
        let mut exit_jumps = NO_JUMP;
        let mut next_jump = self.compile_condition()?;
        self.then_block()?;
        loop {
            match self.cur.kind {
                TokenKind::Elif => {
                    let skip_rest = self.fs.jump();
                    exit_jumps = self.fs.concat(exit_jumps, skip_rest);
                    self.fs.patch_to_here(next_jump);
                    self.advance()?; // 'elif'
                    next_jump = self.compile_condition()?;
                    self.then_block()?;
                }
                TokenKind::Else => {
                    let skip_rest = self.fs.jump();
                    exit_jumps = self.fs.concat(exit_jumps, skip_rest);
                    self.fs.patch_to_here(next_jump);
                    next_jump = NO_JUMP;
                    self.advance()?; // 'else'
                    self.then_block()?;
                    break;
                }
                _ => break,
            }
        }
        if next_jump != NO_JUMP {
            self.fs.patch_to_here(next_jump);
        }
        self.fs.patch_to_here(exit_jumps);
        Ok(())
    }

    /// Parse the boolean condition of an `if`/`elif`/`while` and emit the
    /// jump taken when it is false. Returns that jump's pc for the caller
    /// to patch to the next branch / loop exit.
    fn compile_condition(&mut self) -> Result<i32, AqlError> {
        let e = self.expr()?;
        let reg = self.fs.exp2anyreg(e)?;
        self.fs.close_temporaries();
        Ok(self.fs.test_and_jump(reg, false))
    }

    fn then_block(&mut self) -> Result<(), AqlError> {
        self.expect(&TokenKind::LBrace)?;
        self.fs.enter_block(false);
        self.block()?;
        self.fs.leave_block();
        self.expect(&TokenKind::RBrace)?;
        Ok(())
    }

    fn while_stmt(&mut self) -> Result<(), AqlError> {
        self.advance()?; // 'while'
        self.fs.enter_block(true);
        let block_idx = self.fs.innermost_loop().expect("just entered a loop block");
        let loop_start = self.fs.pc();
        let false_jump = self.compile_condition()?;
        self.expect(&TokenKind::LBrace)?;
        self.block()?;
        self.expect(&TokenKind::RBrace)?;
        let continue_list = self.fs.loop_continue_list(block_idx);
        self.fs.patch_list(continue_list, loop_start);
        let back = self.fs.jump();
        self.fs.patch_list(back, loop_start);
        let after = self.fs.pc();
        self.fs.patch_list(false_jump, after);
        let break_list = self.fs.leave_block();
        self.fs.patch_list(break_list, after);
        Ok(())
    }

    /// `for name = start, stop[, step] { ... }` and `for name in range(...)
    /// { ... }` lower directly to `FORPREP`/`FORLOOP`; `for name in <expr>
    /// { ... }` over anything else lowers to `ITER_INIT`/`ITER_NEXT` via
    /// `generic_for_body` (see `DESIGN.md` for the iteration-protocol Open
    /// Question).
    fn for_stmt(&mut self) -> Result<(), AqlError> {
        self.advance()?; // 'for'
        let var_name = self.expect_name()?;
        if self.accept(&TokenKind::Assign)? {
            let start = self.expr()?;
            self.expect(&TokenKind::Comma)?;
            let stop = self.expr()?;
            let step = if self.accept(&TokenKind::Comma)? { Some(self.expr()?) } else { None };
            return self.numeric_for_body(var_name, start, stop, step);
        }
        self.expect(&TokenKind::In)?;
        let calls_range = matches!(&self.cur.kind, TokenKind::Name(n) if n == "range");
        if calls_range {
            self.advance()?; // 'range'
            if self.accept(&TokenKind::LParen)? {
                let first = self.expr()?;
                let (start, stop, step) = if self.accept(&TokenKind::Comma)? {
                    let second = self.expr()?;
                    let step = if self.accept(&TokenKind::Comma)? { Some(self.expr()?) } else { None };
                    (first, second, step)
                } else {
                    // `range(stop)`: implicit start = 0.
                    (ExpDesc::new(ExpKind::KInt(0)), first, None)
                };
                self.expect(&TokenKind::RParen)?;
                return self.numeric_for_body(var_name, start, stop, step);
            }
            // 'range' used as an ordinary name, not a call: fall through to
            // generic iteration over whatever it's bound to.
            let base = self.fs.singlevar("range");
            let e = self.index_chain(base)?;
            return self.generic_for_body(var_name, e);
        }
        let iterable = self.expr()?;
        self.generic_for_body(var_name, iterable)
    }

    /// `for name in <container-expr> { ... }` over an array/slice/dict/
    /// vector/range, using `ITER_INIT`/`ITER_NEXT` (spec §4.E "Extensions").
    /// No user-defined iterator-function protocol exists since there is no
    /// function-literal syntax to produce one; the VM's `ITER_INIT`/
    /// `ITER_NEXT` know the five built-in container kinds directly.
    fn generic_for_body(&mut self, var_name: String, iterable: ExpDesc) -> Result<(), AqlError> {
        self.fs.enter_block(true);
        let block_idx = self.fs.innermost_loop().expect("just entered a loop block");
        let base = self.fs.freereg;
        self.fs.exp2nextreg(iterable)?; // R(base): container
        self.fs.reserve_regs(1); // R(base+1): cursor, set by ITER_INIT
        self.fs.code_abc(OpCode::ITER_INIT, base as u32, 0, 0, false);
        self.fs.reserve_regs(1); // R(base+2): loop variable
        let local_reg = self.fs.new_local(var_name);
        debug_assert_eq!(local_reg, base + 2);
        self.fs.activate_local();

        let next_pc = self.fs.code_asbx(OpCode::ITER_NEXT, base as u32, NO_JUMP);
        self.expect(&TokenKind::LBrace)?;
        self.block()?;
        self.expect(&TokenKind::RBrace)?;

        let continue_list = self.fs.loop_continue_list(block_idx);
        self.fs.patch_list(continue_list, next_pc);
        let back = self.fs.jump();
        self.fs.patch_list(back, next_pc);
        let after = self.fs.pc();
        self.fs.patch_list(next_pc, after);
        let break_list = self.fs.leave_block();
        self.fs.patch_list(break_list, after);
        Ok(())
    }

    fn numeric_for_body(
        &mut self,
        var_name: String,
        start: ExpDesc,
        stop: ExpDesc,
        step: Option<ExpDesc>,
    ) -> Result<(), AqlError> {
        self.fs.enter_block(true);
        let block_idx = self.fs.innermost_loop().expect("just entered a loop block");
        let base = self.fs.freereg;
        self.fs.exp2nextreg(start)?;
        self.fs.exp2nextreg(stop)?;
        match step {
            Some(s) => {
                self.fs.exp2nextreg(s)?;
            }
            None => {
                self.fs.exp2nextreg(ExpDesc::new(ExpKind::KInt(1)))?;
            }
        }
        self.fs.reserve_regs(1); // loop variable at base+3
        let local_reg = self.fs.new_local(var_name);
        debug_assert_eq!(local_reg, base + 3);
        self.fs.activate_local();

        let prep_pc = self.fs.code_asbx(OpCode::FORPREP, base as u32, NO_JUMP);
        let body_start = self.fs.pc();
        self.expect(&TokenKind::LBrace)?;
        self.block()?;
        self.expect(&TokenKind::RBrace)?;

        let continue_list = self.fs.loop_continue_list(block_idx);
        let forloop_site = self.fs.pc();
        self.fs.patch_list(continue_list, forloop_site);
        let loop_pc = self.fs.code_asbx(OpCode::FORLOOP, base as u32, NO_JUMP);
        self.fs.patch_list(loop_pc, body_start);
        let after = self.fs.pc();
        self.fs.patch_list(prep_pc, after);
        let break_list = self.fs.leave_block();
        self.fs.patch_list(break_list, after);
        Ok(())
    }

    fn return_stmt(&mut self) -> Result<(), AqlError> {
        self.advance()?; // 'return'
        if self.at_block_end() {
            self.fs.code_abc(OpCode::RET_VOID, 0, 0, 0, false);
        } else {
            let base = self.fs.freereg;
            let mut count: u32 = 0;
            loop {
                let e = self.expr()?;
                self.fs.exp2nextreg(e)?;
                count += 1;
                if !self.accept(&TokenKind::Comma)? {
                    break;
                }
            }
            if count == 1 {
                self.fs.code_abc(OpCode::RET_ONE, base as u32, 0, 0, false);
            } else {
                self.fs.code_abc(OpCode::RET, base as u32, count + 1, 0, false);
            }
        }
        self.accept_semi()
    }

    // ---- expressions ----

    fn expr(&mut self) -> Result<ExpDesc, AqlError> {
        let e = self.subexpr(0)?;
        if self.accept(&TokenKind::Question)? {
            return self.ternary_expr(e);
        }
        Ok(e)
    }

    /// `cond ? a : b`, the lowest-priority postfix operator (spec §4.D
    /// precedence table), right-associative via the recursive `self.expr()`
    /// calls for each branch. Both branches are forced into the condition's
    /// own register, same trick as `and`/`or` above.
    fn ternary_expr(&mut self, cond: ExpDesc) -> Result<ExpDesc, AqlError> {
        let reg = self.fs.exp2anyreg(cond)?;
        let false_jump = self.fs.test_and_jump(reg, false);
        let then_e = self.expr()?;
        self.fs.exp2reg(then_e, reg)?;
        let end_jump = self.fs.jump();
        self.fs.patch_to_here(false_jump);
        self.expect(&TokenKind::Colon)?;
        let else_e = self.expr()?;
        self.fs.exp2reg(else_e, reg)?;
        self.fs.patch_to_here(end_jump);
        Ok(ExpDesc::new(ExpKind::NonReloc(reg)))
    }

    fn subexpr(&mut self, limit: u8) -> Result<ExpDesc, AqlError> {
        let mut e = if let Some(uop) = unop_for(&self.cur.kind) {
            self.advance()?;
            let operand = self.subexpr(UNARY_PRIORITY)?;
            self.apply_unop(uop, operand)?
        } else {
            self.simple_exp()?
        };
        while let Some((bop, lbp, rbp)) = binop_for(&self.cur.kind) {
            if lbp <= limit {
                break;
            }
            self.advance()?;
            e = match bop {
                BinOp::And => {
                    let reg = self.fs.exp2anyreg(e)?;
                    let skip = self.fs.test_and_jump(reg, false);
                    let rhs = self.subexpr(rbp)?;
                    self.fs.exp2reg(rhs, reg)?;
                    self.fs.patch_to_here(skip);
                    ExpDesc::new(ExpKind::NonReloc(reg))
                }
                BinOp::Or => {
                    let reg = self.fs.exp2anyreg(e)?;
                    let skip = self.fs.test_and_jump(reg, true);
                    let rhs = self.subexpr(rbp)?;
                    self.fs.exp2reg(rhs, reg)?;
                    self.fs.patch_to_here(skip);
                    ExpDesc::new(ExpKind::NonReloc(reg))
                }
                _ => {
                    let rhs = self.subexpr(rbp)?;
                    self.apply_binop(bop, e, rhs)?
                }
            };
        }
        Ok(e)
    }

    fn apply_unop(&mut self, op: UnOp, e: ExpDesc) -> Result<ExpDesc, AqlError> {
        if let Some(folded) = fold_unop(op, &e) {
            return Ok(folded);
        }
        match op {
            UnOp::Not => match e.kind {
                ExpKind::Nil | ExpKind::False => Ok(ExpDesc::new(ExpKind::True)),
                ExpKind::True => Ok(ExpDesc::new(ExpKind::False)),
                _ => {
                    let reg = self.fs.exp2anyreg(e)?;
                    let pc = self.fs.code_abc(OpCode::NOT, 0, reg as u32, 0, false);
                    Ok(ExpDesc::new(ExpKind::Reloc(pc as u32)))
                }
            },
            UnOp::Neg => {
                let reg = self.fs.exp2anyreg(e)?;
                let pc = self.fs.code_abc(OpCode::UNM, 0, reg as u32, 0, false);
                Ok(ExpDesc::new(ExpKind::Reloc(pc as u32)))
            }
            UnOp::Len => {
                let reg = self.fs.exp2anyreg(e)?;
                let pc = self.fs.code_abc(OpCode::LEN, 0, reg as u32, 0, false);
                Ok(ExpDesc::new(ExpKind::Reloc(pc as u32)))
            }
            UnOp::BNot => {
                let reg = self.fs.exp2anyreg(e)?;
                let pc = self.fs.code_abc(OpCode::BNOT, 0, reg as u32, 0, false);
                Ok(ExpDesc::new(ExpKind::Reloc(pc as u32)))
            }
        }
    }

    fn apply_binop(&mut self, op: BinOp, lhs: ExpDesc, rhs: ExpDesc) -> Result<ExpDesc, AqlError> {
        if let Some(folded) = fold_binop(op, &lhs, &rhs) {
            return Ok(folded);
        }
        match op {
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => self.compile_compare(op, lhs, rhs),
            BinOp::Concat => self.compile_concat(lhs, rhs),
            BinOp::Add => self.compile_arith(OpCode::ADD, OpCode::ADDK, Some(OpCode::ADDI), lhs, rhs),
            BinOp::Sub => self.compile_arith(OpCode::SUB, OpCode::SUBK, Some(OpCode::SUBI), lhs, rhs),
            BinOp::Mul => self.compile_arith(OpCode::MUL, OpCode::MULK, Some(OpCode::MULI), lhs, rhs),
            BinOp::Div => self.compile_arith(OpCode::DIV, OpCode::DIVK, Some(OpCode::DIVI), lhs, rhs),
            BinOp::Mod => self.compile_plain_binop(OpCode::MOD, lhs, rhs),
            BinOp::Pow => self.compile_plain_binop(OpCode::POW, lhs, rhs),
            BinOp::Band => self.compile_plain_binop(OpCode::BAND, lhs, rhs),
            BinOp::Bor => self.compile_plain_binop(OpCode::BOR, lhs, rhs),
            BinOp::Bxor => self.compile_plain_binop(OpCode::BXOR, lhs, rhs),
            BinOp::Shl => self.compile_plain_binop(OpCode::SHL, lhs, rhs),
            BinOp::Shr => self.compile_plain_binop(OpCode::SHR, lhs, rhs),
            BinOp::And | BinOp::Or => unreachable!("and/or are handled in subexpr"),
        }
    }

    fn compile_compare(&mut self, op: BinOp, lhs: ExpDesc, rhs: ExpDesc) -> Result<ExpDesc, AqlError> {
        let (opcode, swap, want) = match op {
            BinOp::Eq => (OpCode::EQ, false, true),
            BinOp::Ne => (OpCode::EQ, false, false),
            BinOp::Lt => (OpCode::LT, false, true),
            BinOp::Gt => (OpCode::LT, true, true),
            BinOp::Le => (OpCode::LE, false, true),
            BinOp::Ge => (OpCode::LE, true, true),
            _ => unreachable!(),
        };
        let (l, r) = if swap { (rhs, lhs) } else { (lhs, rhs) };
        let lreg = self.fs.exp2anyreg(l)?;
        let rreg = self.fs.exp2anyreg(r)?;
        self.fs.code_abc(opcode, lreg as u32, rreg as u32, 0, want);
        let pc = self.fs.jump();
        Ok(ExpDesc { kind: ExpKind::Jmp(pc as u32), t: NO_JUMP, f: NO_JUMP })
    }

    fn compile_concat(&mut self, lhs: ExpDesc, rhs: ExpDesc) -> Result<ExpDesc, AqlError> {
        let base = self.fs.exp2nextreg(lhs)?;
        self.fs.exp2nextreg(rhs)?;
        self.fs.code_abc(OpCode::CONCAT, base as u32, 2, 0, false);
        self.fs.freereg = base + 1;
        Ok(ExpDesc::new(ExpKind::NonReloc(base)))
    }

    /// `+ - * /` get `*K`/`*I` peephole variants when the right operand is
    /// a constant (spec §4.E); every other arithmetic/bitwise op always
    /// materializes both operands into registers.
    fn compile_arith(&mut self, plain: OpCode, kvariant: OpCode, ivariant: Option<OpCode>, lhs: ExpDesc, rhs: ExpDesc) -> Result<ExpDesc, AqlError> {
        let lreg = self.fs.exp2anyreg(lhs)?;
        if let (Some(iop), ExpKind::KInt(i)) = (ivariant, &rhs.kind) {
            if let Ok(small) = i32::try_from(*i) {
                if (-127..=128).contains(&small) {
                    let sc = aql_core::opcodes::int2sc(small);
                    let pc = self.fs.code_abc(iop, 0, lreg as u32, sc, false);
                    return Ok(ExpDesc::new(ExpKind::Reloc(pc as u32)));
                }
            }
        }
        if rhs.is_constant() {
            let (k, _) = self.fs.exp2rk(rhs)?;
            let pc = self.fs.code_abc(kvariant, 0, lreg as u32, k, false);
            return Ok(ExpDesc::new(ExpKind::Reloc(pc as u32)));
        }
        let rreg = self.fs.exp2anyreg(rhs)?;
        let pc = self.fs.code_abc(plain, 0, lreg as u32, rreg as u32, false);
        Ok(ExpDesc::new(ExpKind::Reloc(pc as u32)))
    }

    fn compile_plain_binop(&mut self, op: OpCode, lhs: ExpDesc, rhs: ExpDesc) -> Result<ExpDesc, AqlError> {
        let lreg = self.fs.exp2anyreg(lhs)?;
        let rreg = self.fs.exp2anyreg(rhs)?;
        let pc = self.fs.code_abc(op, 0, lreg as u32, rreg as u32, false);
        Ok(ExpDesc::new(ExpKind::Reloc(pc as u32)))
    }

    fn simple_exp(&mut self) -> Result<ExpDesc, AqlError> {
        match self.cur.kind.clone() {
            TokenKind::Int(i) => {
                self.advance()?;
                Ok(ExpDesc::new(ExpKind::KInt(i)))
            }
            TokenKind::Float(f) => {
                self.advance()?;
                Ok(ExpDesc::new(ExpKind::KFlt(f)))
            }
            TokenKind::Str(s) => {
                self.advance()?;
                let k = self.fs.addk(Constant::Str(s));
                Ok(ExpDesc::new(ExpKind::K(k)))
            }
            TokenKind::Nil => {
                self.advance()?;
                Ok(ExpDesc::new(ExpKind::Nil))
            }
            TokenKind::True => {
                self.advance()?;
                Ok(ExpDesc::new(ExpKind::True))
            }
            TokenKind::False => {
                self.advance()?;
                Ok(ExpDesc::new(ExpKind::False))
            }
            TokenKind::LBracket => self.array_literal(),
            TokenKind::LParen => {
                self.advance()?;
                let e = self.expr()?;
                self.expect(&TokenKind::RParen)?;
                Ok(e)
            }
            TokenKind::Name(n) => {
                self.advance()?;
                let base = self.name_base(n)?;
                self.index_chain(base)
            }
            _ => Err(self.syntax_error("unexpected symbol")),
        }
    }

    /// The part of a name-led expression before any `[...]`/`.name`
    /// suffixes: either a builtin call or a plain variable reference.
    fn name_base(&mut self, name: String) -> Result<ExpDesc, AqlError> {
        if self.check(&TokenKind::LParen) {
            match builtin_id(&name) {
                Some(id) => self.compile_builtin_call(id),
                None => Err(self.syntax_error(format!("attempt to call undefined function '{name}'"))),
            }
        } else {
            Ok(self.fs.singlevar(&name))
        }
    }

    fn index_chain(&mut self, mut e: ExpDesc) -> Result<ExpDesc, AqlError> {
        loop {
            match self.cur.kind {
                TokenKind::LBracket => {
                    self.advance()?;
                    let key = self.expr()?;
                    self.expect(&TokenKind::RBracket)?;
                    e = self.fs.indexed(&e, &key)?;
                }
                TokenKind::Dot => {
                    self.advance()?;
                    let field = self.expect_name()?;
                    let k = self.fs.addk(Constant::Str(field));
                    e = self.fs.indexed(&e, &ExpDesc::new(ExpKind::K(k)))?;
                }
                _ => break,
            }
        }
        Ok(e)
    }

    fn compile_builtin_call(&mut self, id: u8) -> Result<ExpDesc, AqlError> {
        self.expect(&TokenKind::LParen)?;
        let base = self.fs.freereg;
        let mut argc: u32 = 0;
        if !self.check(&TokenKind::RParen) {
            loop {
                let e = self.expr()?;
                self.fs.exp2nextreg(e)?;
                argc += 1;
                if !self.accept(&TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RParen)?;
        let pc = self.fs.code_abc(OpCode::BUILTIN, base as u32, id as u32, argc, false);
        self.fs.freereg = base;
        Ok(ExpDesc::new(ExpKind::Reloc(pc as u32)))
    }

    fn array_literal(&mut self) -> Result<ExpDesc, AqlError> {
        self.expect(&TokenKind::LBracket)?;
        let base = self.fs.freereg;
        self.fs.reserve_regs(1);
        self.fs.code_abc(OpCode::NEWOBJECT, base as u32, ContainerKind::Array.to_u8() as u32, 0, false);
        let mut idx: i64 = 0;
        if !self.check(&TokenKind::RBracket) {
            loop {
                let value = self.expr()?;
                let (vsrc, vis_k) = self.fs.exp2rk(value)?;
                let key_reg = self.fs.exp2anyreg(ExpDesc::new(ExpKind::KInt(idx)))?;
                self.fs.code_abc(OpCode::SETPROP, base as u32, key_reg as u32, vsrc, vis_k);
                self.fs.free_reg(key_reg);
                idx += 1;
                if !self.accept(&TokenKind::Comma)? {
                    break;
                }
            }
        }
        self.expect(&TokenKind::RBracket)?;
        Ok(ExpDesc::new(ExpKind::NonReloc(base)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn compile(src: &str) -> Proto {
        Parser::new("test", src).unwrap().parse_chunk().unwrap()
    }

    #[test]
    fn empty_chunk_just_returns() {
        let proto = compile("");
        assert_eq!(proto.code.len(), 1);
        assert_eq!(proto.code[0].opcode(), OpCode::RET_VOID);
    }

    #[test]
    fn let_binding_emits_load_and_no_trailing_ops() {
        let proto = compile("let x = 1 + 2\n");
        // constants fold at compile time: 1+2 becomes a single LOADI 3.
        assert_eq!(proto.code[0].opcode(), OpCode::LOADI);
        assert_eq!(proto.code[0].sbx(), 3);
    }

    #[test]
    fn global_assignment_uses_settabup() {
        let proto = compile("x = 5\n");
        assert!(proto.code.iter().any(|i| i.opcode() == OpCode::SETTABUP));
    }

    #[test]
    fn redeclare_with_colon_eq_rebinds_existing_local() {
        let proto = compile("let x = 1\nx := 2\n");
        // second assignment is a MOVE/LOADI straight into x's register, no
        // new GETTABUP/SETTABUP traffic and no second local created.
        assert_eq!(proto.locals.len(), 0); // debug locals are not tracked by this parser yet
        assert!(!proto.code.iter().any(|i| i.opcode() == OpCode::SETTABUP));
    }

    #[test]
    fn colon_eq_on_an_unseen_name_declares_a_new_local() {
        let proto = compile("x := 1\nreturn x\n");
        // with no prior `let x`/`x :=`, the name isn't an active local yet,
        // so this is sugar for `let x = 1`: no global traffic at all.
        assert!(!proto.code.iter().any(|i| i.opcode() == OpCode::SETTABUP));
        assert!(!proto.code.iter().any(|i| i.opcode() == OpCode::GETTABUP));
    }

    #[test]
    fn builtin_call_emits_builtin_opcode() {
        let proto = compile("print(1, 2)\n");
        assert!(proto.code.iter().any(|i| i.opcode() == OpCode::BUILTIN));
    }

    #[test]
    fn calling_non_builtin_is_a_compile_error() {
        let err = Parser::new("test", "foo(1)\n").unwrap().parse_chunk();
        assert!(err.is_err());
    }

    #[test]
    fn if_else_patches_both_branch_jumps() {
        let proto = compile("if 1 < 2 { let a = 1 } else { let a = 2 }\n");
        assert!(proto.code.iter().any(|i| i.opcode() == OpCode::LT));
        assert!(proto.code.iter().any(|i| i.opcode() == OpCode::JMP));
    }

    #[test]
    fn while_loop_emits_forward_and_backward_jumps() {
        let proto = compile("let i = 0\nwhile i < 3 { i := i + 1 }\n");
        let jmp_count = proto.code.iter().filter(|i| i.opcode() == OpCode::JMP).count();
        assert!(jmp_count >= 2);
    }

    #[test]
    fn numeric_for_emits_forprep_and_forloop() {
        let proto = compile("for i in range(0, 10) { print(i) }\n");
        assert!(proto.code.iter().any(|i| i.opcode() == OpCode::FORPREP));
        assert!(proto.code.iter().any(|i| i.opcode() == OpCode::FORLOOP));
    }

    #[test]
    fn array_literal_emits_newobject_and_setprop() {
        let proto = compile("let a = [1, 2, 3]\n");
        assert!(proto.code.iter().any(|i| i.opcode() == OpCode::NEWOBJECT));
        assert_eq!(proto.code.iter().filter(|i| i.opcode() == OpCode::SETPROP).count(), 3);
    }

    #[test]
    fn break_outside_loop_is_a_compile_error() {
        assert!(Parser::new("test", "break\n").unwrap().parse_chunk().is_err());
    }

    #[test]
    fn arithmetic_constant_folds_at_compile_time() {
        let proto = compile("let x = 2 * 3 + 1\n");
        assert_eq!(proto.code.len(), 2); // LOADI 7, RET_VOID
        assert_eq!(proto.code[0].opcode(), OpCode::LOADI);
        assert_eq!(proto.code[0].sbx(), 7);
    }

    #[test]
    fn concat_uses_concat_opcode() {
        let proto = compile(r#"let s = "a" .. "b"\n"#);
        assert!(proto.code.iter().any(|i| i.opcode() == OpCode::CONCAT));
    }
}
