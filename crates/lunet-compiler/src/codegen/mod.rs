//! Bytecode generation: AST to register-machine code.
//!
//! Single pass over the AST with a bump register allocator per block.
//! Expressions lower into one of three shapes: a register, a constant-pool
//! index (RK-encodable when small enough), or a deferred boolean carried
//! as a pair of jump patch lists. Short-circuit operators and comparisons
//! stay in jump form until a value or a branch is demanded, which lets
//! nested condition chains share their jumps.

pub mod scope;

use crate::ast::*;
use crate::opcode::*;
use crate::proto::{Constant, LocalVar, Proto, UpvalDesc};
use crate::{CompileError, Stage};
use lunet_core::string::{Interner, StrId};
use scope::{LabelInfo, PendingGoto, ScopeManager};

/// Generate a prototype for a parsed chunk. The chunk compiles as a
/// vararg function whose single upvalue is `_ENV`.
pub fn generate(
    block: &Block,
    interner: &mut Interner,
    chunk_name: &str,
) -> Result<Proto, CompileError> {
    let mut cg = CodeGen {
        interner,
        funcs: Vec::new(),
    };

    let mut top = FuncState::new();
    let source = cg.interner.intern(chunk_name.as_bytes());
    top.proto.source = Some(source);
    top.proto.is_vararg = true;
    let env = cg.interner.intern(b"_ENV");
    top.upvals.push(UpvalInfo {
        name: env,
        in_stack: true,
        index: 0,
    });
    cg.funcs.push(top);

    cg.fs_mut().scope.enter_block(false);
    cg.gen_block_stmts(block)?;
    let line = block.stmts.last().map(stmt_line).unwrap_or(block.line);
    cg.end_scope(line)?;
    cg.emit(Instruction::abc(OpCode::Return, 0, 1, 0), line);

    Ok(cg.finish_func())
}

fn stmt_line(s: &Stmt) -> u32 {
    match s {
        Stmt::Assign { line, .. }
        | Stmt::Local { line, .. }
        | Stmt::LocalFunction { line, .. }
        | Stmt::Function { line, .. }
        | Stmt::While { line, .. }
        | Stmt::Repeat { line, .. }
        | Stmt::If { line, .. }
        | Stmt::NumericFor { line, .. }
        | Stmt::GenericFor { line, .. }
        | Stmt::Return { line, .. }
        | Stmt::Goto { line, .. }
        | Stmt::Label { line, .. } => *line,
        Stmt::Break(line) | Stmt::Continue(line) => *line,
        Stmt::Call(e) => e.line(),
        Stmt::Do(b) => b.line,
    }
}

/// Compile-time upvalue record for one function.
#[derive(Clone, Debug)]
struct UpvalInfo {
    name: StrId,
    in_stack: bool,
    index: u8,
}

/// State for one function being compiled.
struct FuncState {
    proto: Proto,
    scope: ScopeManager,
    upvals: Vec<UpvalInfo>,
}

impl FuncState {
    fn new() -> Self {
        FuncState {
            proto: Proto::new(),
            scope: ScopeManager::new(),
            upvals: Vec::new(),
        }
    }
}

/// Where a table being indexed lives.
#[derive(Clone, Copy, Debug)]
enum TabSlot {
    Reg(u8),
    Upval(u8),
}

/// Result shape of a lowered expression.
#[derive(Debug)]
enum ExprVal {
    Nil,
    True,
    False,
    Int(i64),
    Float(f64),
    Str(StrId),
    /// Value in a register (a local, or a temporary above the watermark).
    Reg(u8),
    Upval(u8),
    /// `_ENV[name]`; payload is the name's constant index.
    Global(u32),
    /// `table[key]`, key already RK-encoded.
    Index { table: TabSlot, key: u32 },
    /// A CALL whose result count is still open.
    Call { pc: usize },
    /// A VARARG whose destination and count are still open.
    Vararg { pc: usize },
    /// Deferred boolean: jumps taken on true / on false; falling through
    /// both lists means the condition was true.
    Test {
        true_jumps: Vec<usize>,
        false_jumps: Vec<usize>,
    },
}

/// An assignment destination, resolved before any value is computed.
#[derive(Clone, Copy, Debug)]
enum Target {
    Local(u8),
    Upval(u8),
    Global(u32),
    Index { table: TabSlot, key: u32 },
}

struct CodeGen<'a> {
    interner: &'a mut Interner,
    funcs: Vec<FuncState>,
}

/// Opcode for a plain (non-short-circuit, non-comparison, non-concat)
/// binary operator.
fn arith_opcode(op: BinOp) -> OpCode {
    match op {
        BinOp::Add => OpCode::Add,
        BinOp::Sub => OpCode::Sub,
        BinOp::Mul => OpCode::Mul,
        BinOp::Mod => OpCode::Mod,
        BinOp::Pow => OpCode::Pow,
        BinOp::Div => OpCode::Div,
        BinOp::IDiv => OpCode::IDiv,
        BinOp::BAnd => OpCode::BAnd,
        BinOp::BOr => OpCode::BOr,
        BinOp::BXor => OpCode::BXor,
        BinOp::Shl => OpCode::Shl,
        BinOp::Shr => OpCode::Shr,
        _ => unreachable!("not an arithmetic operator: {op:?}"),
    }
}

impl<'a> CodeGen<'a> {
    fn err(&self, line: u32, msg: impl Into<String>) -> CompileError {
        CompileError {
            stage: Stage::CodeGen,
            message: msg.into(),
            line,
        }
    }

    fn fs(&self) -> &FuncState {
        self.funcs.last().unwrap()
    }

    fn fs_mut(&mut self) -> &mut FuncState {
        self.funcs.last_mut().unwrap()
    }

    fn pc(&self) -> usize {
        self.fs().proto.code_len()
    }

    fn emit(&mut self, inst: Instruction, line: u32) -> usize {
        self.fs_mut().proto.emit(inst, line)
    }

    // ---- Jump plumbing ----

    fn jump(&mut self, line: u32) -> usize {
        self.emit(Instruction::asbx(OpCode::Jmp, 0, 0), line)
    }

    fn patch_to(&mut self, jump_pc: usize, target: usize) {
        let offset = target as i32 - jump_pc as i32 - 1;
        self.fs_mut().proto.get_mut(jump_pc).set_sbx(offset);
    }

    fn patch_here(&mut self, jump_pc: usize) {
        let target = self.pc();
        self.patch_to(jump_pc, target);
    }

    fn patch_list_here(&mut self, jumps: &[usize]) {
        for &pc in jumps {
            self.patch_here(pc);
        }
    }

    fn patch_list_to(&mut self, jumps: &[usize], target: usize) {
        for &pc in jumps {
            self.patch_to(pc, target);
        }
    }

    /// Put a close-upvalue hint on a JMP: registers >= `level` close when
    /// the jump executes.
    fn set_close_hint(&mut self, jump_pc: usize, level: u8) {
        self.fs_mut().proto.get_mut(jump_pc).set_a(level as u32 + 1);
    }

    // ---- Constants ----

    fn const_idx(&mut self, k: Constant) -> u32 {
        self.fs_mut().proto.add_constant(k)
    }

    fn str_const(&mut self, id: StrId) -> u32 {
        self.const_idx(Constant::String(id))
    }

    /// RK-encode a constant index, spilling to a register when it does
    /// not fit the 8-bit RK payload.
    fn rk_from_const(&mut self, k: u32, line: u32) -> u32 {
        if k <= MAX_INDEX_RK {
            rk_const(k)
        } else {
            let reg = self.fs_mut().scope.alloc_reg();
            self.emit_load_const(reg, k, line);
            reg as u32
        }
    }

    fn emit_load_const(&mut self, reg: u8, k: u32, line: u32) {
        if k <= MAX_BX {
            self.emit(Instruction::abx(OpCode::LoadK, reg as u32, k), line);
        } else {
            self.emit(Instruction::abx(OpCode::LoadKX, reg as u32, 0), line);
            self.emit(Instruction::ax(OpCode::ExtraArg, k), line);
        }
    }

    // ---- Scope helpers ----

    fn add_local(&mut self, name: StrId) -> u8 {
        let start_pc = self.pc() as u32;
        let fs = self.fs_mut();
        let debug_idx = fs.proto.local_vars.len();
        fs.proto.local_vars.push(LocalVar {
            name,
            start_pc,
            end_pc: 0,
        });
        fs.scope.add_local(name, debug_idx)
    }

    /// Close the innermost block: finalize debug ranges, propagate pending
    /// gotos to the enclosing block, emit a close hint when a dropped
    /// local was captured. Returns the block plus the close JMP's pc.
    fn end_scope(&mut self, line: u32) -> Result<(scope::BlockScope, Option<usize>), CompileError> {
        let entry_level = self
            .fs()
            .scope
            .blocks
            .last()
            .expect("unbalanced block")
            .free_reg_on_entry;
        let needs_close = self.fs().scope.captured_at_or_above(entry_level);

        let end_pc = self.pc() as u32;
        let (block, dead) = self.fs_mut().scope.leave_block();
        for local in dead {
            self.fs_mut().proto.local_vars[local.debug_idx].end_pc = end_pc;
        }

        // Unresolved forward gotos escape to the parent block.
        if !block.pending_gotos.is_empty() {
            if self.fs_mut().scope.blocks.is_empty() {
                let g = &block.pending_gotos[0];
                let name = self.interner.get_lossy(g.name).into_owned();
                return Err(self.err(g.line, format!("no visible label '{name}' for goto")));
            }
            let clamp = block.locals_on_entry;
            let parent = self.fs_mut().scope.current_block_mut();
            for mut g in block.pending_gotos.clone() {
                g.num_locals = g.num_locals.min(clamp);
                parent.pending_gotos.push(g);
            }
        }

        let close_pc = if needs_close {
            let pc = self.jump(line);
            self.set_close_hint(pc, entry_level);
            Some(pc)
        } else {
            None
        };
        Ok((block, close_pc))
    }

    // ---- Name resolution ----

    fn resolve_name(&mut self, name: StrId, _line: u32) -> Result<ExprVal, CompileError> {
        if let Some(local) = self.fs().scope.resolve_local(name) {
            return Ok(ExprVal::Reg(local.reg));
        }
        let top = self.funcs.len() - 1;
        if let Some(idx) = self.resolve_upvalue(top, name) {
            return Ok(ExprVal::Upval(idx));
        }
        let k = self.str_const(name);
        Ok(ExprVal::Global(k))
    }

    /// Find `name` as an upvalue of `funcs[fs_idx]`, registering entries
    /// down the chain of enclosing functions as needed.
    fn resolve_upvalue(&mut self, fs_idx: usize, name: StrId) -> Option<u8> {
        // Already declared here?
        for (i, up) in self.funcs[fs_idx].upvals.iter().enumerate() {
            if up.name == name {
                return Some(i as u8);
            }
        }
        if fs_idx == 0 {
            return None;
        }

        let parent = fs_idx - 1;
        if let Some(local) = self.funcs[parent].scope.resolve_local(name) {
            let reg = local.reg;
            self.funcs[parent].scope.mark_captured(reg);
            return Some(self.add_upvalue(fs_idx, name, true, reg));
        }
        if let Some(parent_idx) = self.resolve_upvalue(parent, name) {
            return Some(self.add_upvalue(fs_idx, name, false, parent_idx));
        }
        None
    }

    fn add_upvalue(&mut self, fs_idx: usize, name: StrId, in_stack: bool, index: u8) -> u8 {
        let fs = &mut self.funcs[fs_idx];
        for (i, up) in fs.upvals.iter().enumerate() {
            if up.in_stack == in_stack && up.index == index {
                return i as u8;
            }
        }
        let idx = fs.upvals.len() as u8;
        fs.upvals.push(UpvalInfo {
            name,
            in_stack,
            index,
        });
        idx
    }

    /// Upvalue index of `_ENV` in the current function.
    fn env_upvalue(&mut self) -> u8 {
        let env = self.interner.intern(b"_ENV");
        let top = self.funcs.len() - 1;
        self.resolve_upvalue(top, env)
            .expect("_ENV is always reachable")
    }

    // ---- Expression lowering ----

    fn expr(&mut self, e: &Expr) -> Result<ExprVal, CompileError> {
        match e {
            Expr::Nil(_) => Ok(ExprVal::Nil),
            Expr::True(_) => Ok(ExprVal::True),
            Expr::False(_) => Ok(ExprVal::False),
            Expr::Integer(i, _) => Ok(ExprVal::Int(*i)),
            Expr::Float(f, _) => Ok(ExprVal::Float(*f)),
            Expr::Str(id, _) => Ok(ExprVal::Str(*id)),
            Expr::Name(id, line) => self.resolve_name(*id, *line),
            Expr::Vararg(line) => {
                if !self.fs().proto.is_vararg {
                    return Err(self.err(*line, "cannot use '...' outside a vararg function"));
                }
                let pc = self.emit(Instruction::abc(OpCode::Vararg, 0, 2, 0), *line);
                Ok(ExprVal::Vararg { pc })
            }
            Expr::Paren(inner, line) => {
                let val = self.expr(inner)?;
                // A parenthesized expression is exactly one value.
                match val {
                    ExprVal::Call { pc } => {
                        let a = self.truncate_call(pc);
                        Ok(ExprVal::Reg(a))
                    }
                    ExprVal::Vararg { .. } => {
                        let reg = self.val_any_reg(val, *line);
                        Ok(ExprVal::Reg(reg))
                    }
                    other => Ok(other),
                }
            }
            Expr::Field { table, field, line } => {
                let tab = self.table_slot(table, *line)?;
                let k = self.str_const(*field);
                let key = self.rk_from_const(k, *line);
                Ok(ExprVal::Index { table: tab, key })
            }
            Expr::Index { table, key, line } => {
                let tab = self.table_slot(table, *line)?;
                let key = self.expr_rk(key, *line)?;
                Ok(ExprVal::Index { table: tab, key })
            }
            Expr::Call { .. } | Expr::MethodCall { .. } => self.lower_call(e),
            Expr::Function(fb) => {
                let dest = self.fs_mut().scope.alloc_reg();
                self.emit_closure(fb, dest)?;
                Ok(ExprVal::Reg(dest))
            }
            Expr::Table(items, line) => self.table_constructor(items, *line),
            Expr::Unary { op, operand, line } => self.unary(*op, operand, *line),
            Expr::Binary { op, lhs, rhs, line } => self.binary(*op, lhs, rhs, *line),
        }
    }

    /// Lower the table operand of an indexing expression.
    fn table_slot(&mut self, table: &Expr, line: u32) -> Result<TabSlot, CompileError> {
        if let Expr::Name(id, nline) = table {
            match self.resolve_name(*id, *nline)? {
                ExprVal::Reg(r) => return Ok(TabSlot::Reg(r)),
                ExprVal::Upval(u) => return Ok(TabSlot::Upval(u)),
                val => {
                    let reg = self.val_any_reg(val, line);
                    return Ok(TabSlot::Reg(reg));
                }
            }
        }
        let reg = self.expr_any_reg(table, line)?;
        Ok(TabSlot::Reg(reg))
    }

    /// Force a call to one result, returning the result register.
    fn truncate_call(&mut self, pc: usize) -> u8 {
        let inst = self.fs().proto.code[pc];
        let mut inst2 = inst;
        inst2.set_c(2);
        *self.fs_mut().proto.get_mut(pc) = inst2;
        inst.a() as u8
    }

    /// Materialize a lowered expression into a specific register.
    fn discharge(&mut self, val: ExprVal, reg: u8, line: u32) {
        match val {
            ExprVal::Nil => {
                self.emit(Instruction::abc(OpCode::LoadNil, reg as u32, 0, 0), line);
            }
            ExprVal::True => {
                self.emit(Instruction::abc(OpCode::LoadBool, reg as u32, 1, 0), line);
            }
            ExprVal::False => {
                self.emit(Instruction::abc(OpCode::LoadBool, reg as u32, 0, 0), line);
            }
            ExprVal::Int(i) => {
                let k = self.const_idx(Constant::Integer(i));
                self.emit_load_const(reg, k, line);
            }
            ExprVal::Float(f) => {
                let k = self.const_idx(Constant::Float(f));
                self.emit_load_const(reg, k, line);
            }
            ExprVal::Str(id) => {
                let k = self.const_idx(Constant::String(id));
                self.emit_load_const(reg, k, line);
            }
            ExprVal::Reg(src) => {
                if src != reg {
                    self.emit(
                        Instruction::abc(OpCode::Move, reg as u32, src as u32, 0),
                        line,
                    );
                }
            }
            ExprVal::Upval(u) => {
                self.emit(
                    Instruction::abc(OpCode::GetUpval, reg as u32, u as u32, 0),
                    line,
                );
            }
            ExprVal::Global(k) => {
                let env = self.env_upvalue();
                let key = self.rk_from_const(k, line);
                self.emit(
                    Instruction::abc(OpCode::GetTabUp, reg as u32, env as u32, key),
                    line,
                );
            }
            ExprVal::Index { table, key } => match table {
                TabSlot::Reg(t) => {
                    self.emit(
                        Instruction::abc(OpCode::GetTable, reg as u32, t as u32, key),
                        line,
                    );
                }
                TabSlot::Upval(u) => {
                    self.emit(
                        Instruction::abc(OpCode::GetTabUp, reg as u32, u as u32, key),
                        line,
                    );
                }
            },
            ExprVal::Call { pc } => {
                let a = self.truncate_call(pc);
                if a != reg {
                    self.emit(Instruction::abc(OpCode::Move, reg as u32, a as u32, 0), line);
                }
            }
            ExprVal::Vararg { pc } => {
                let mut inst = self.fs().proto.code[pc];
                inst.set_a(reg as u32);
                inst.set_b(2);
                *self.fs_mut().proto.get_mut(pc) = inst;
            }
            ExprVal::Test {
                true_jumps,
                false_jumps,
            } => {
                // Fall-through means true: load true and hop the false
                // loader via LOADBOOL's skip flag.
                let load_true = self.emit(
                    Instruction::abc(OpCode::LoadBool, reg as u32, 1, 1),
                    line,
                );
                let load_false = self.emit(
                    Instruction::abc(OpCode::LoadBool, reg as u32, 0, 0),
                    line,
                );
                self.patch_list_to(&true_jumps, load_true);
                self.patch_list_to(&false_jumps, load_false);
            }
        }
    }

    fn val_any_reg(&mut self, val: ExprVal, line: u32) -> u8 {
        match val {
            ExprVal::Reg(r) => r,
            ExprVal::Call { pc } => {
                let a = self.truncate_call(pc);
                // The call already freed its argument window; keep the
                // result slot claimed.
                if self.fs().scope.free_reg <= a {
                    self.fs_mut().scope.free_to(a + 1);
                }
                a
            }
            other => {
                let reg = self.fs_mut().scope.alloc_reg();
                self.discharge(other, reg, line);
                reg
            }
        }
    }

    fn expr_any_reg(&mut self, e: &Expr, line: u32) -> Result<u8, CompileError> {
        let val = self.expr(e)?;
        Ok(self.val_any_reg(val, line))
    }

    /// Lower into a specific register. `reg` may sit below the current
    /// watermark (a list slot); temporaries stay above it. Arithmetic and
    /// short-circuit forms write the register directly instead of going
    /// through a temporary plus MOVE.
    fn expr_to_reg(&mut self, e: &Expr, reg: u8, line: u32) -> Result<(), CompileError> {
        match e {
            Expr::Binary {
                op: op @ (BinOp::And | BinOp::Or),
                lhs,
                rhs,
                line: op_line,
            } => {
                self.and_or_into(*op, lhs, rhs, reg, *op_line)?;
            }
            Expr::Binary { op, lhs, rhs, line: op_line }
                if !op.is_comparison() && *op != BinOp::Concat =>
            {
                let save = self.fs().scope.free_reg;
                let rb = self.expr_rk(lhs, *op_line)?;
                let rc = self.expr_rk(rhs, *op_line)?;
                self.fs_mut().scope.free_to(save);
                self.emit(
                    Instruction::abc(arith_opcode(*op), reg as u32, rb, rc),
                    *op_line,
                );
            }
            _ => {
                let val = self.expr(e)?;
                self.discharge(val, reg, line);
            }
        }
        Ok(())
    }

    /// Value-context short circuit: the result register first holds the
    /// left value; a TEST decides whether the right side overwrites it.
    fn and_or_into(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        reg: u8,
        line: u32,
    ) -> Result<(), CompileError> {
        self.expr_to_reg(lhs, reg, line)?;
        let c = if op == BinOp::And { 0 } else { 1 };
        self.emit(Instruction::abc(OpCode::Test, reg as u32, 0, c), line);
        let short = self.jump(line);
        self.expr_to_reg(rhs, reg, line)?;
        self.patch_here(short);
        Ok(())
    }

    /// Lower to an RK operand: small constants encode inline, everything
    /// else goes through a register.
    fn expr_rk(&mut self, e: &Expr, line: u32) -> Result<u32, CompileError> {
        let val = self.expr(e)?;
        Ok(self.val_rk(val, line))
    }

    fn val_rk(&mut self, val: ExprVal, line: u32) -> u32 {
        let k = match val {
            ExprVal::Nil => self.const_idx(Constant::Nil),
            ExprVal::True => self.const_idx(Constant::Boolean(true)),
            ExprVal::False => self.const_idx(Constant::Boolean(false)),
            ExprVal::Int(i) => self.const_idx(Constant::Integer(i)),
            ExprVal::Float(f) => self.const_idx(Constant::Float(f)),
            ExprVal::Str(id) => self.const_idx(Constant::String(id)),
            other => return self.val_any_reg(other, line) as u32,
        };
        self.rk_from_const(k, line)
    }

    // ---- Operators ----

    fn unary(&mut self, op: UnOp, operand: &Expr, line: u32) -> Result<ExprVal, CompileError> {
        // Constant folding on literals.
        let folded = match (op, operand) {
            (UnOp::Neg, Expr::Integer(i, _)) => Some(ExprVal::Int(i.wrapping_neg())),
            (UnOp::Neg, Expr::Float(f, _)) => Some(ExprVal::Float(-f)),
            (UnOp::BNot, Expr::Integer(i, _)) => Some(ExprVal::Int(!i)),
            (UnOp::Not, Expr::Nil(_) | Expr::False(_)) => Some(ExprVal::True),
            (
                UnOp::Not,
                Expr::True(_) | Expr::Integer(..) | Expr::Float(..) | Expr::Str(..),
            ) => Some(ExprVal::False),
            _ => None,
        };
        if let Some(v) = folded {
            return Ok(v);
        }

        let save = self.fs().scope.free_reg;
        let rb = self.expr_any_reg(operand, line)?;
        self.fs_mut().scope.free_to(save);
        let dest = self.fs_mut().scope.alloc_reg();
        let opcode = match op {
            UnOp::Neg => OpCode::Unm,
            UnOp::Not => OpCode::Not,
            UnOp::Len => OpCode::Len,
            UnOp::BNot => OpCode::BNot,
        };
        self.emit(Instruction::abc(opcode, dest as u32, rb as u32, 0), line);
        Ok(ExprVal::Reg(dest))
    }

    fn binary(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        line: u32,
    ) -> Result<ExprVal, CompileError> {
        if op == BinOp::And || op == BinOp::Or {
            let reg = self.fs_mut().scope.alloc_reg();
            self.and_or_into(op, lhs, rhs, reg, line)?;
            return Ok(ExprVal::Reg(reg));
        }
        if op.is_comparison() {
            let pc = self.emit_compare(op, lhs, rhs, 0, line)?;
            return Ok(ExprVal::Test {
                true_jumps: Vec::new(),
                false_jumps: vec![pc],
            });
        }
        if op == BinOp::Concat {
            return self.concat(lhs, rhs, line);
        }

        let save = self.fs().scope.free_reg;
        let rb = self.expr_rk(lhs, line)?;
        let rc = self.expr_rk(rhs, line)?;
        self.fs_mut().scope.free_to(save);
        let dest = self.fs_mut().scope.alloc_reg();
        self.emit(Instruction::abc(arith_opcode(op), dest as u32, rb, rc), line);
        Ok(ExprVal::Reg(dest))
    }

    /// A run of `..` lowers to one CONCAT over consecutive registers.
    fn concat(&mut self, lhs: &Expr, rhs: &Expr, line: u32) -> Result<ExprVal, CompileError> {
        let mut operands = vec![lhs];
        let mut tail = rhs;
        // `..` is right associative, so the chain nests to the right.
        while let Expr::Binary {
            op: BinOp::Concat,
            lhs: l,
            rhs: r,
            ..
        } = tail
        {
            operands.push(l);
            tail = r;
        }
        operands.push(tail);

        let save = self.fs().scope.free_reg;
        let first = self.fs_mut().scope.alloc_reg();
        let mut last = first;
        self.expr_to_reg(operands[0], first, line)?;
        for operand in &operands[1..] {
            last = self.fs_mut().scope.alloc_reg();
            self.expr_to_reg(operand, last, line)?;
            self.fs_mut().scope.free_to(last + 1);
        }
        self.fs_mut().scope.free_to(save);
        let dest = self.fs_mut().scope.alloc_reg();
        self.emit(
            Instruction::abc(OpCode::Concat, dest as u32, first as u32, last as u32),
            line,
        );
        Ok(ExprVal::Reg(dest))
    }

    /// Emit a comparison plus its JMP. With `sense == 0` the jump is taken
    /// when the comparison is false, with `sense == 1` when true.
    fn emit_compare(
        &mut self,
        op: BinOp,
        lhs: &Expr,
        rhs: &Expr,
        sense: u32,
        line: u32,
    ) -> Result<usize, CompileError> {
        // a > b  ==  b < a;  a >= b  ==  b <= a
        let (op, lhs, rhs) = match op {
            BinOp::Gt => (BinOp::Lt, rhs, lhs),
            BinOp::GtEq => (BinOp::LtEq, rhs, lhs),
            other => (other, lhs, rhs),
        };
        let (opcode, a) = match op {
            BinOp::Eq => (OpCode::Eq, sense),
            BinOp::NotEq => (OpCode::Eq, 1 - sense),
            BinOp::Lt => (OpCode::Lt, sense),
            BinOp::LtEq => (OpCode::Le, sense),
            _ => unreachable!(),
        };
        let save = self.fs().scope.free_reg;
        let rb = self.expr_rk(lhs, line)?;
        let rc = self.expr_rk(rhs, line)?;
        self.fs_mut().scope.free_to(save);
        self.emit(Instruction::abc(opcode, a, rb, rc), line);
        Ok(self.jump(line))
    }

    // ---- Condition lowering ----

    /// Lower `e` as a branch condition. Returns the jumps taken when the
    /// condition is FALSE; control falls through when it is true.
    fn cond_false_jumps(&mut self, e: &Expr) -> Result<Vec<usize>, CompileError> {
        let line = e.line();
        match e {
            Expr::True(_) | Expr::Integer(..) | Expr::Float(..) | Expr::Str(..) => Ok(Vec::new()),
            Expr::Nil(_) | Expr::False(_) => Ok(vec![self.jump(line)]),
            Expr::Paren(inner, _) => self.cond_false_jumps(inner),
            Expr::Unary {
                op: UnOp::Not,
                operand,
                ..
            } => self.cond_true_jumps(operand),
            Expr::Binary {
                op: BinOp::And,
                lhs,
                rhs,
                ..
            } => {
                let mut jumps = self.cond_false_jumps(lhs)?;
                jumps.extend(self.cond_false_jumps(rhs)?);
                Ok(jumps)
            }
            Expr::Binary {
                op: BinOp::Or,
                lhs,
                rhs,
                ..
            } => {
                let true_jumps = self.cond_true_jumps(lhs)?;
                let jumps = self.cond_false_jumps(rhs)?;
                // Left-true skips the right test straight to fall-through.
                self.patch_list_here(&true_jumps);
                Ok(jumps)
            }
            Expr::Binary { op, lhs, rhs, line } if op.is_comparison() => {
                Ok(vec![self.emit_compare(*op, lhs, rhs, 0, *line)?])
            }
            _ => {
                let save = self.fs().scope.free_reg;
                let reg = self.expr_any_reg(e, line)?;
                self.fs_mut().scope.free_to(save);
                self.emit(Instruction::abc(OpCode::Test, reg as u32, 0, 0), line);
                Ok(vec![self.jump(line)])
            }
        }
    }

    /// Dual of `cond_false_jumps`: jumps taken when the condition is TRUE.
    fn cond_true_jumps(&mut self, e: &Expr) -> Result<Vec<usize>, CompileError> {
        let line = e.line();
        match e {
            Expr::Nil(_) | Expr::False(_) => Ok(Vec::new()),
            Expr::True(_) | Expr::Integer(..) | Expr::Float(..) | Expr::Str(..) => {
                Ok(vec![self.jump(line)])
            }
            Expr::Paren(inner, _) => self.cond_true_jumps(inner),
            Expr::Unary {
                op: UnOp::Not,
                operand,
                ..
            } => self.cond_false_jumps(operand),
            Expr::Binary {
                op: BinOp::Or,
                lhs,
                rhs,
                ..
            } => {
                let mut jumps = self.cond_true_jumps(lhs)?;
                jumps.extend(self.cond_true_jumps(rhs)?);
                Ok(jumps)
            }
            Expr::Binary {
                op: BinOp::And,
                lhs,
                rhs,
                ..
            } => {
                let false_jumps = self.cond_false_jumps(lhs)?;
                let jumps = self.cond_true_jumps(rhs)?;
                self.patch_list_here(&false_jumps);
                Ok(jumps)
            }
            Expr::Binary { op, lhs, rhs, line } if op.is_comparison() => {
                Ok(vec![self.emit_compare(*op, lhs, rhs, 1, *line)?])
            }
            _ => {
                let save = self.fs().scope.free_reg;
                let reg = self.expr_any_reg(e, line)?;
                self.fs_mut().scope.free_to(save);
                self.emit(Instruction::abc(OpCode::Test, reg as u32, 0, 1), line);
                Ok(vec![self.jump(line)])
            }
        }
    }

    // ---- Calls ----

    fn lower_call(&mut self, e: &Expr) -> Result<ExprVal, CompileError> {
        match e {
            Expr::Call { func, args, line } => {
                let base = self.fs_mut().scope.alloc_reg();
                self.expr_to_reg(func, base, *line)?;
                self.fs_mut().scope.free_to(base + 1);
                let (count, multi) = self.expr_list_to_regs(args, base + 1, -1, *line)?;
                let b = if multi { 0 } else { count as u32 + 1 };
                let pc = self.emit(Instruction::abc(OpCode::Call, base as u32, b, 0), *line);
                self.fs_mut().scope.free_to(base + 1);
                Ok(ExprVal::Call { pc })
            }
            Expr::MethodCall {
                object,
                method,
                args,
                line,
            } => {
                // The RK key is prepared first so a spilled constant
                // cannot wedge itself between the call registers.
                let k = self.str_const(*method);
                let key = self.rk_from_const(k, *line);
                let base = self.fs_mut().scope.alloc_reg();
                self.expr_to_reg(object, base, *line)?;
                self.fs_mut().scope.free_to(base + 1);
                let _self_slot = self.fs_mut().scope.alloc_reg();
                self.emit(
                    Instruction::abc(OpCode::Self_, base as u32, base as u32, key),
                    *line,
                );
                let (count, multi) = self.expr_list_to_regs(args, base + 2, -1, *line)?;
                // The receiver is an implicit first argument.
                let b = if multi { 0 } else { count as u32 + 2 };
                let pc = self.emit(Instruction::abc(OpCode::Call, base as u32, b, 0), *line);
                self.fs_mut().scope.free_to(base + 1);
                Ok(ExprVal::Call { pc })
            }
            _ => unreachable!("lower_call on non-call"),
        }
    }

    /// Lower an expression list into consecutive registers from `base`.
    ///
    /// `wanted == -1` keeps a trailing call/vararg open (multi-value);
    /// otherwise the list is adjusted to exactly `wanted` values, padding
    /// with nil or dropping extras. Requires `free_reg == base` on entry.
    /// Returns (fixed value count, trailing-multi flag).
    fn expr_list_to_regs(
        &mut self,
        exprs: &[Expr],
        base: u8,
        wanted: i32,
        line: u32,
    ) -> Result<(u8, bool), CompileError> {
        debug_assert_eq!(self.fs().scope.free_reg, base);
        let n = exprs.len();

        if n == 0 {
            if wanted > 0 {
                self.fs_mut().scope.alloc_regs(wanted as u8);
                self.emit(
                    Instruction::abc(OpCode::LoadNil, base as u32, wanted as u32 - 1, 0),
                    line,
                );
                return Ok((wanted as u8, false));
            }
            return Ok((0, false));
        }

        for (i, e) in exprs[..n - 1].iter().enumerate() {
            let reg = self.fs_mut().scope.alloc_reg();
            self.expr_to_reg(e, reg, e.line())?;
            self.fs_mut().scope.free_to(base + i as u8 + 1);
        }

        let last = &exprs[n - 1];
        let last_slot = base + n as u8 - 1;

        if wanted < 0 {
            if last.is_multivalue() {
                let val = self.expr(last)?;
                match val {
                    ExprVal::Call { .. } => {
                        // CALL already sits at last_slot with C == 0.
                    }
                    ExprVal::Vararg { pc } => {
                        let mut inst = self.fs().proto.code[pc];
                        inst.set_a(last_slot as u32);
                        inst.set_b(0);
                        *self.fs_mut().proto.get_mut(pc) = inst;
                    }
                    _ => unreachable!(),
                }
                return Ok((n as u8 - 1, true));
            }
            let reg = self.fs_mut().scope.alloc_reg();
            self.expr_to_reg(last, reg, last.line())?;
            self.fs_mut().scope.free_to(base + n as u8);
            return Ok((n as u8, false));
        }

        let wanted = wanted as usize;
        let remaining = wanted.saturating_sub(n - 1);
        if remaining >= 2 && last.is_multivalue() {
            let val = self.expr(last)?;
            match val {
                ExprVal::Call { pc } => {
                    let mut inst = self.fs().proto.code[pc];
                    inst.set_c(remaining as u32 + 1);
                    *self.fs_mut().proto.get_mut(pc) = inst;
                }
                ExprVal::Vararg { pc } => {
                    let mut inst = self.fs().proto.code[pc];
                    inst.set_a(last_slot as u32);
                    inst.set_b(remaining as u32 + 1);
                    *self.fs_mut().proto.get_mut(pc) = inst;
                }
                _ => unreachable!(),
            }
            self.fs_mut().scope.reserve_to(base + wanted as u8);
            return Ok((wanted as u8, false));
        }

        let reg = self.fs_mut().scope.alloc_reg();
        self.expr_to_reg(last, reg, last.line())?;
        self.fs_mut().scope.free_to(base + n as u8);

        if n < wanted {
            let pad = wanted - n;
            self.fs_mut().scope.alloc_regs(pad as u8);
            self.emit(
                Instruction::abc(
                    OpCode::LoadNil,
                    (base + n as u8) as u32,
                    pad as u32 - 1,
                    0,
                ),
                line,
            );
        } else if n > wanted {
            self.fs_mut().scope.free_to(base + wanted as u8);
        }
        Ok((wanted as u8, false))
    }

    // ---- Table constructors ----

    fn table_constructor(
        &mut self,
        items: &[TableItem],
        line: u32,
    ) -> Result<ExprVal, CompileError> {
        let table = self.fs_mut().scope.alloc_reg();
        let newtable_pc = self.emit(Instruction::abc(OpCode::NewTable, table as u32, 0, 0), line);

        let mut array_total = 0u32;
        let mut hash_total = 0u32;
        let mut pending = 0u32; // array values staged above `table`
        let mut batch = 0u32;
        let n = items.len();

        for (idx, item) in items.iter().enumerate() {
            match item {
                TableItem::Named(name, value) => {
                    let vline = value.line();
                    let save = self.fs().scope.free_reg;
                    let k = self.str_const(*name);
                    let key = self.rk_from_const(k, vline);
                    let val = self.expr_rk(value, vline)?;
                    self.emit(
                        Instruction::abc(OpCode::SetTable, table as u32, key, val),
                        vline,
                    );
                    self.fs_mut().scope.free_to(save);
                    hash_total += 1;
                }
                TableItem::Keyed(key, value) => {
                    let vline = value.line();
                    let save = self.fs().scope.free_reg;
                    let k = self.expr_rk(key, vline)?;
                    let val = self.expr_rk(value, vline)?;
                    self.emit(
                        Instruction::abc(OpCode::SetTable, table as u32, k, val),
                        vline,
                    );
                    self.fs_mut().scope.free_to(save);
                    hash_total += 1;
                }
                TableItem::Item(value) => {
                    let vline = value.line();
                    let is_last = idx == n - 1;
                    if is_last && value.is_multivalue() {
                        // Trailing call/vararg expands into the list part.
                        // A call claims the next free register itself; a
                        // vararg is pointed at it.
                        let slot = self.fs().scope.free_reg;
                        let val = self.expr(value)?;
                        match val {
                            ExprVal::Call { .. } => {}
                            ExprVal::Vararg { pc } => {
                                let mut inst = self.fs().proto.code[pc];
                                inst.set_a(slot as u32);
                                inst.set_b(0);
                                *self.fs_mut().proto.get_mut(pc) = inst;
                            }
                            _ => unreachable!(),
                        }
                        array_total += 1;
                        self.emit_setlist(table, 0, batch + 1, vline);
                        self.fs_mut().scope.free_to(table + 1);
                        pending = 0;
                        batch += 1;
                        continue;
                    }

                    let reg = self.fs_mut().scope.alloc_reg();
                    self.expr_to_reg(value, reg, vline)?;
                    self.fs_mut().scope.free_to(reg + 1);
                    pending += 1;
                    array_total += 1;
                    if pending == FIELDS_PER_FLUSH {
                        self.emit_setlist(table, pending, batch + 1, vline);
                        self.fs_mut().scope.free_to(table + 1);
                        pending = 0;
                        batch += 1;
                    }
                }
            }
        }

        if pending > 0 {
            self.emit_setlist(table, pending, batch + 1, line);
            self.fs_mut().scope.free_to(table + 1);
        }

        // Fill in the size hints now that the counts are known.
        let hint = Instruction::abc(
            OpCode::NewTable,
            table as u32,
            int_to_fb(array_total),
            int_to_fb(hash_total),
        );
        *self.fs_mut().proto.get_mut(newtable_pc) = hint;
        self.fs_mut().scope.free_to(table + 1);
        Ok(ExprVal::Reg(table))
    }

    fn emit_setlist(&mut self, table: u8, count: u32, batch: u32, line: u32) {
        if batch <= MAX_C {
            self.emit(
                Instruction::abc(OpCode::SetList, table as u32, count, batch),
                line,
            );
        } else {
            self.emit(Instruction::abc(OpCode::SetList, table as u32, count, 0), line);
            self.emit(Instruction::ax(OpCode::ExtraArg, batch), line);
        }
    }

    // ---- Functions ----

    fn emit_closure(&mut self, fb: &FuncBody, dest: u8) -> Result<(), CompileError> {
        let parent_source = self.fs().proto.source;
        let mut child = FuncState::new();
        child.proto.source = parent_source;
        child.proto.num_params = fb.params.len() as u8;
        child.proto.is_vararg = fb.is_vararg;
        child.proto.line_defined = fb.line;
        child.proto.last_line_defined = fb.end_line;
        self.funcs.push(child);

        self.fs_mut().scope.enter_block(false);
        for &param in &fb.params {
            self.add_local(param);
        }
        self.gen_block_stmts(&fb.body)?;
        self.end_scope(fb.end_line)?;
        self.emit(Instruction::abc(OpCode::Return, 0, 1, 0), fb.end_line);

        let proto = self.finish_func();
        let fs = self.fs_mut();
        let idx = fs.proto.protos.len() as u32;
        fs.proto.protos.push(proto);
        self.emit(Instruction::abx(OpCode::Closure, dest as u32, idx), fb.line);
        Ok(())
    }

    fn finish_func(&mut self) -> Proto {
        let mut fs = self.funcs.pop().unwrap();
        fs.proto.max_stack = fs.scope.max_reg.saturating_add(2).max(2);
        fs.proto.upvalues = fs
            .upvals
            .iter()
            .map(|u| UpvalDesc {
                name: Some(u.name),
                in_stack: u.in_stack,
                index: u.index,
            })
            .collect();
        fs.proto
    }

    // ---- Statements ----

    fn gen_block_stmts(&mut self, block: &Block) -> Result<(), CompileError> {
        for stmt in &block.stmts {
            self.statement(stmt)?;
        }
        Ok(())
    }

    /// A nested scope: `do ... end`, if arms, loop bodies handle their own
    /// blocks for patch lists.
    fn scoped_block(&mut self, block: &Block) -> Result<(), CompileError> {
        self.fs_mut().scope.enter_block(false);
        self.gen_block_stmts(block)?;
        let line = block.stmts.last().map(stmt_line).unwrap_or(block.line);
        self.end_scope(line)?;
        Ok(())
    }

    fn statement(&mut self, stmt: &Stmt) -> Result<(), CompileError> {
        match stmt {
            Stmt::Local {
                names,
                values,
                line,
            } => self.stat_local(names, values, *line),
            Stmt::LocalFunction { name, body, line } => {
                // The local is registered first so the function can refer
                // to itself.
                let reg = self.add_local(*name);
                self.emit_closure(body, reg)?;
                let _ = line;
                Ok(())
            }
            Stmt::Function { name, body, line } => self.stat_function(name, body, *line),
            Stmt::Assign {
                targets,
                values,
                line,
            } => self.stat_assign(targets, values, *line),
            Stmt::Call(e) => {
                let save = self.fs().scope.free_reg;
                let val = self.lower_call(e)?;
                if let ExprVal::Call { pc } = val {
                    // Statement position: discard every result.
                    let mut inst = self.fs().proto.code[pc];
                    inst.set_c(1);
                    *self.fs_mut().proto.get_mut(pc) = inst;
                }
                self.fs_mut().scope.free_to(save);
                Ok(())
            }
            Stmt::Do(block) => self.scoped_block(block),
            Stmt::If {
                cond,
                then,
                elseifs,
                else_block,
                line,
            } => self.stat_if(cond, then, elseifs, else_block.as_ref(), *line),
            Stmt::While { cond, body, line } => self.stat_while(cond, body, *line),
            Stmt::Repeat { body, cond, line } => self.stat_repeat(body, cond, *line),
            Stmt::NumericFor {
                var,
                start,
                limit,
                step,
                body,
                line,
            } => self.stat_numeric_for(*var, start, limit, step.as_ref(), body, *line),
            Stmt::GenericFor {
                vars,
                exprs,
                body,
                line,
            } => self.stat_generic_for(vars, exprs, body, *line),
            Stmt::Return { values, line } => self.stat_return(values, *line),
            Stmt::Break(line) => self.stat_break(*line),
            Stmt::Continue(line) => self.stat_continue(*line),
            Stmt::Goto { label, line } => self.stat_goto(*label, *line),
            Stmt::Label { name, line } => self.stat_label(*name, *line),
        }
    }

    fn stat_local(
        &mut self,
        names: &[StrId],
        values: &[Expr],
        line: u32,
    ) -> Result<(), CompileError> {
        let base = self.fs().scope.free_reg;
        self.expr_list_to_regs(values, base, names.len() as i32, line)?;
        // The value slots become the locals' registers.
        self.fs_mut().scope.free_to(base);
        for &name in names {
            self.add_local(name);
        }
        Ok(())
    }

    fn stat_function(
        &mut self,
        name: &FuncName,
        body: &FuncBody,
        line: u32,
    ) -> Result<(), CompileError> {
        let save = self.fs().scope.free_reg;
        let target = if name.fields.is_empty() && name.method.is_none() {
            self.name_target(name.base, line)?
        } else {
            // Walk `a.b.c`: everything before the last key is a read.
            let mut tab = match self.resolve_name(name.base, line)? {
                ExprVal::Reg(r) => TabSlot::Reg(r),
                ExprVal::Upval(u) => TabSlot::Upval(u),
                val => TabSlot::Reg(self.val_any_reg(val, line)),
            };
            let mut keys: Vec<StrId> = name.fields.clone();
            if let Some(m) = name.method {
                keys.push(m);
            }
            let last = keys.pop().unwrap();
            for field in keys {
                let k = self.str_const(field);
                let key = self.rk_from_const(k, line);
                let reg = self.fs_mut().scope.alloc_reg();
                let inst = match tab {
                    TabSlot::Reg(t) => {
                        Instruction::abc(OpCode::GetTable, reg as u32, t as u32, key)
                    }
                    TabSlot::Upval(u) => {
                        Instruction::abc(OpCode::GetTabUp, reg as u32, u as u32, key)
                    }
                };
                self.emit(inst, line);
                tab = TabSlot::Reg(reg);
            }
            let k = self.str_const(last);
            let key = self.rk_from_const(k, line);
            Target::Index { table: tab, key }
        };

        let dest = self.fs_mut().scope.alloc_reg();
        self.emit_closure(body, dest)?;
        self.store_target(target, dest, line);
        self.fs_mut().scope.free_to(save);
        Ok(())
    }

    fn name_target(&mut self, name: StrId, line: u32) -> Result<Target, CompileError> {
        Ok(match self.resolve_name(name, line)? {
            ExprVal::Reg(r) => Target::Local(r),
            ExprVal::Upval(u) => Target::Upval(u),
            ExprVal::Global(k) => Target::Global(k),
            _ => unreachable!(),
        })
    }

    fn assign_target(&mut self, e: &Expr) -> Result<Target, CompileError> {
        match e {
            Expr::Name(id, line) => self.name_target(*id, *line),
            Expr::Field { table, field, line } => {
                let tab = self.table_slot(table, *line)?;
                let k = self.str_const(*field);
                let key = self.rk_from_const(k, *line);
                Ok(Target::Index { table: tab, key })
            }
            Expr::Index { table, key, line } => {
                let tab = self.table_slot(table, *line)?;
                let key = self.expr_rk(key, *line)?;
                Ok(Target::Index { table: tab, key })
            }
            other => Err(self.err(other.line(), "cannot assign to this expression")),
        }
    }

    fn store_target(&mut self, target: Target, src: u8, line: u32) {
        match target {
            Target::Local(r) => {
                if r != src {
                    self.emit(Instruction::abc(OpCode::Move, r as u32, src as u32, 0), line);
                }
            }
            Target::Upval(u) => {
                self.emit(
                    Instruction::abc(OpCode::SetUpval, src as u32, u as u32, 0),
                    line,
                );
            }
            Target::Global(k) => {
                let env = self.env_upvalue();
                let key = self.rk_from_const(k, line);
                self.emit(
                    Instruction::abc(OpCode::SetTabUp, env as u32, key, src as u32),
                    line,
                );
            }
            Target::Index { table, key } => {
                let inst = match table {
                    TabSlot::Reg(t) => {
                        Instruction::abc(OpCode::SetTable, t as u32, key, src as u32)
                    }
                    TabSlot::Upval(u) => {
                        Instruction::abc(OpCode::SetTabUp, u as u32, key, src as u32)
                    }
                };
                self.emit(inst, line);
            }
        }
    }

    /// Multi-target assignment. Targets are resolved to descriptors first,
    /// values land in fresh registers, then any descriptor whose register
    /// an earlier store would clobber is redirected to a saved copy, and
    /// stores run right to left.
    fn stat_assign(
        &mut self,
        targets: &[Expr],
        values: &[Expr],
        line: u32,
    ) -> Result<(), CompileError> {
        let outer_base = self.fs().scope.free_reg;

        let mut descs = Vec::with_capacity(targets.len());
        for t in targets {
            descs.push(self.assign_target(t)?);
        }

        let base = self.fs().scope.free_reg;
        self.expr_list_to_regs(values, base, targets.len() as i32, line)?;

        // `t, t[1] = {}, 2` must index the original t: preserve any
        // register an assignment to a local is about to overwrite.
        for i in 0..descs.len() {
            let Target::Local(clobbered) = descs[i] else {
                continue;
            };
            let mut saved: Option<u8> = None;
            for j in 0..descs.len() {
                if j == i {
                    continue;
                }
                if let Target::Index { table, key } = &mut descs[j] {
                    let table_hit = matches!(table, TabSlot::Reg(r) if *r == clobbered);
                    let key_hit = !is_rk_const(*key) && *key == clobbered as u32;
                    if table_hit || key_hit {
                        let copy = match saved {
                            Some(c) => c,
                            None => {
                                let c = self.fs_mut().scope.alloc_reg();
                                self.emit(
                                    Instruction::abc(
                                        OpCode::Move,
                                        c as u32,
                                        clobbered as u32,
                                        0,
                                    ),
                                    line,
                                );
                                saved = Some(c);
                                c
                            }
                        };
                        if table_hit {
                            *table = TabSlot::Reg(copy);
                        }
                        if key_hit {
                            *key = copy as u32;
                        }
                    }
                }
            }
        }

        for (i, desc) in descs.iter().enumerate().rev() {
            self.store_target(*desc, base + i as u8, line);
        }
        self.fs_mut().scope.free_to(outer_base);
        Ok(())
    }

    fn stat_if(
        &mut self,
        cond: &Expr,
        then: &Block,
        elseifs: &[(Expr, Block)],
        else_block: Option<&Block>,
        _line: u32,
    ) -> Result<(), CompileError> {
        let mut escapes = Vec::new();
        let mut false_jumps = self.cond_false_jumps(cond)?;
        self.scoped_block(then)?;

        for (c, b) in elseifs {
            escapes.push(self.jump(c.line()));
            self.patch_list_here(&false_jumps);
            false_jumps = self.cond_false_jumps(c)?;
            self.scoped_block(b)?;
        }

        if let Some(b) = else_block {
            escapes.push(self.jump(b.line));
            self.patch_list_here(&false_jumps);
            self.scoped_block(b)?;
        } else {
            self.patch_list_here(&false_jumps);
        }

        self.patch_list_here(&escapes);
        Ok(())
    }

    fn stat_while(&mut self, cond: &Expr, body: &Block, line: u32) -> Result<(), CompileError> {
        let loop_start = self.pc();
        let exit_jumps = self.cond_false_jumps(cond)?;

        self.fs_mut().scope.enter_block(true);
        let entry_level = self.fs().scope.free_reg;
        self.gen_block_stmts(body)?;
        let (block, close_pc) = self.end_scope(line)?;

        let back = self.jump(line);
        self.patch_to(back, loop_start);

        self.patch_list_here(&exit_jumps);
        self.finish_loop(&block, close_pc.unwrap_or(back), entry_level);
        Ok(())
    }

    fn stat_repeat(&mut self, body: &Block, cond: &Expr, line: u32) -> Result<(), CompileError> {
        let loop_start = self.pc();
        self.fs_mut().scope.enter_block(true);
        let entry_level = self.fs().scope.free_reg;
        self.gen_block_stmts(body)?;

        // The until-condition runs inside the body's scope, so block
        // closure is deferred until after it is emitted.
        let cond_start = self.pc();
        let again_jumps = self.cond_false_jumps(cond)?;

        let captured = self.fs().scope.captured_at_or_above(entry_level);
        if captured {
            // Looping back leaves the iteration's scope: close on the way.
            for &pc in &again_jumps {
                self.set_close_hint(pc, entry_level);
            }
        }
        self.patch_list_to(&again_jumps, loop_start);

        let (block, close_pc) = self.end_scope(line)?;
        let _ = close_pc; // fall-through close emitted by end_scope
        // Continue re-tests the condition with locals still live.
        self.patch_list_to(&block.continues, cond_start);
        if captured {
            for &pc in &block.breaks {
                self.set_close_hint(pc, entry_level);
            }
        }
        self.patch_list_here(&block.breaks);
        Ok(())
    }

    fn stat_numeric_for(
        &mut self,
        var: StrId,
        start: &Expr,
        limit: &Expr,
        step: Option<&Expr>,
        body: &Block,
        line: u32,
    ) -> Result<(), CompileError> {
        let base = self.fs().scope.free_reg;
        // Three internal control slots: index, limit, step.
        self.fs_mut().scope.alloc_regs(3);

        self.expr_to_reg(start, base, line)?;
        self.fs_mut().scope.free_to(base + 3);
        self.expr_to_reg(limit, base + 1, line)?;
        self.fs_mut().scope.free_to(base + 3);
        match step {
            Some(e) => self.expr_to_reg(e, base + 2, line)?,
            None => self.discharge(ExprVal::Int(1), base + 2, line),
        }
        self.fs_mut().scope.free_to(base + 3);

        let prep = self.emit(Instruction::asbx(OpCode::ForPrep, base as u32, 0), line);
        let body_start = self.pc();

        self.fs_mut().scope.enter_block(true);
        let entry_level = self.fs().scope.free_reg; // == base + 3
        self.add_local(var); // the user-visible counter at base+3
        self.gen_block_stmts(body)?;
        let (block, close_pc) = self.end_scope(line)?;

        let loop_pc = self.emit(Instruction::asbx(OpCode::ForLoop, base as u32, 0), line);
        self.patch_to(prep, loop_pc);
        let back = body_start as i32 - loop_pc as i32 - 1;
        self.fs_mut().proto.get_mut(loop_pc).set_sbx(back);

        self.finish_loop(&block, close_pc.unwrap_or(loop_pc), entry_level);
        self.fs_mut().scope.free_to(base);
        Ok(())
    }

    fn stat_generic_for(
        &mut self,
        vars: &[StrId],
        exprs: &[Expr],
        body: &Block,
        line: u32,
    ) -> Result<(), CompileError> {
        let base = self.fs().scope.free_reg;
        // Three internal slots: generator, state, control.
        self.expr_list_to_regs(exprs, base, 3, line)?;

        let prep = self.jump(line); // to the TFORCALL
        let body_start = self.pc();

        self.fs_mut().scope.enter_block(true);
        let entry_level = self.fs().scope.free_reg; // == base + 3
        for &v in vars {
            self.add_local(v);
        }
        self.gen_block_stmts(body)?;
        let (block, close_pc) = self.end_scope(line)?;

        let call_pc = self.emit(
            Instruction::abc(OpCode::TForCall, base as u32, 0, vars.len() as u32),
            line,
        );
        self.patch_to(prep, call_pc);
        let loop_pc = self.emit(Instruction::asbx(OpCode::TForLoop, base as u32 + 2, 0), line);
        let back = body_start as i32 - loop_pc as i32 - 1;
        self.fs_mut().proto.get_mut(loop_pc).set_sbx(back);

        // Continue must re-invoke the generator, after closing.
        self.finish_loop(&block, close_pc.unwrap_or(call_pc), entry_level);
        self.fs_mut().scope.free_to(base);
        Ok(())
    }

    /// Patch a finished loop's break/continue lists. Breaks land after the
    /// loop (the current pc); continues land on `continue_target`, which
    /// is the close hint when one was emitted so skipped-tail upvalues
    /// still close.
    fn finish_loop(
        &mut self,
        block: &scope::BlockScope,
        continue_target: usize,
        entry_level: u8,
    ) {
        if self.fs().scope.captured_at_or_above(entry_level) {
            for &pc in block.breaks.iter().chain(block.continues.iter()) {
                self.set_close_hint(pc, entry_level);
            }
        }
        self.patch_list_here(&block.breaks);
        self.patch_list_to(&block.continues, continue_target);
    }

    fn stat_return(&mut self, values: &[Expr], line: u32) -> Result<(), CompileError> {
        if values.is_empty() {
            self.emit(Instruction::abc(OpCode::Return, 0, 1, 0), line);
            return Ok(());
        }

        if values.len() == 1 {
            match &values[0] {
                e @ (Expr::Call { .. } | Expr::MethodCall { .. }) => {
                    // `return f(...)` is a tail call.
                    let val = self.lower_call(e)?;
                    let ExprVal::Call { pc } = val else {
                        unreachable!()
                    };
                    let inst = self.fs().proto.code[pc];
                    *self.fs_mut().proto.get_mut(pc) =
                        Instruction::abc(OpCode::TailCall, inst.a(), inst.b(), 0);
                    self.emit(Instruction::abc(OpCode::Return, inst.a(), 0, 0), line);
                    return Ok(());
                }
                Expr::Vararg(_) => {
                    let base = self.fs().scope.free_reg;
                    let val = self.expr(&values[0])?;
                    let ExprVal::Vararg { pc } = val else {
                        unreachable!()
                    };
                    let mut inst = self.fs().proto.code[pc];
                    inst.set_a(base as u32);
                    inst.set_b(0);
                    *self.fs_mut().proto.get_mut(pc) = inst;
                    self.emit(Instruction::abc(OpCode::Return, base as u32, 0, 0), line);
                    return Ok(());
                }
                _ => {}
            }
        }

        let base = self.fs().scope.free_reg;
        let (count, multi) = self.expr_list_to_regs(values, base, -1, line)?;
        let b = if multi { 0 } else { count as u32 + 1 };
        self.emit(Instruction::abc(OpCode::Return, base as u32, b, 0), line);
        self.fs_mut().scope.free_to(base);
        Ok(())
    }

    fn stat_break(&mut self, line: u32) -> Result<(), CompileError> {
        let pc = self.jump(line);
        match self.fs_mut().scope.innermost_loop() {
            Some(b) => {
                b.breaks.push(pc);
                Ok(())
            }
            None => Err(self.err(line, "break outside a loop")),
        }
    }

    fn stat_continue(&mut self, line: u32) -> Result<(), CompileError> {
        let pc = self.jump(line);
        match self.fs_mut().scope.innermost_loop() {
            Some(b) => {
                b.continues.push(pc);
                Ok(())
            }
            None => Err(self.err(line, "continue outside a loop")),
        }
    }

    fn stat_goto(&mut self, label: StrId, line: u32) -> Result<(), CompileError> {
        let pc = self.jump(line);
        if let Some(info) = self.fs().scope.find_label(label) {
            // Backward goto: resolve now, closing anything captured above
            // the label's watermark.
            let target = info.pc;
            let level = info.free_reg;
            if self.fs().scope.captured_at_or_above(level) {
                self.set_close_hint(pc, level);
            }
            self.patch_to(pc, target);
            return Ok(());
        }
        let num_locals = self.fs().scope.num_locals();
        self.fs_mut()
            .scope
            .current_block_mut()
            .pending_gotos
            .push(PendingGoto {
                name: label,
                pc,
                line,
                num_locals,
            });
        Ok(())
    }

    fn stat_label(&mut self, name: StrId, line: u32) -> Result<(), CompileError> {
        let pc = self.pc();
        let num_locals = self.fs().scope.num_locals();
        let free_reg = self.fs().scope.free_reg;

        // Duplicate labels in the same block are rejected.
        if self
            .fs()
            .scope
            .blocks
            .last()
            .is_some_and(|b| b.labels.iter().any(|l| l.name == name))
        {
            let text = self.interner.get_lossy(name).into_owned();
            return Err(self.err(line, format!("label '{text}' already defined")));
        }

        let block = self.fs_mut().scope.current_block_mut();
        block.labels.push(LabelInfo {
            name,
            pc,
            num_locals,
            free_reg,
        });

        // Resolve forward gotos waiting in this block.
        let matching: Vec<PendingGoto> = {
            let block = self.fs_mut().scope.current_block_mut();
            let (hit, rest): (Vec<_>, Vec<_>) =
                block.pending_gotos.drain(..).partition(|g| g.name == name);
            block.pending_gotos = rest;
            hit
        };
        for g in matching {
            if num_locals > g.num_locals {
                // The jump would land inside the scope of a local that
                // did not exist at the goto.
                let local = &self.fs().scope.locals[g.num_locals];
                let lname = self.interner.get_lossy(local.name).into_owned();
                return Err(self.err(
                    g.line,
                    format!("goto jumps into the scope of local '{lname}'"),
                ));
            }
            // Jumping forward may leave blocks whose locals were
            // captured; those upvalues close at the jump.
            if self.fs().scope.captured_at_or_above(free_reg) {
                self.set_close_hint(g.pc, free_reg);
            }
            self.patch_to(g.pc, pc);
        }
        Ok(())
    }
}
