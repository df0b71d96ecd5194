//! The bytecode interpreter: a switch-over-opcode loop on decoded 32-bit
//! instruction words.
//!
//! Lua-to-Lua calls never recurse in Rust: CALL pushes a frame and the
//! loop continues in the callee; RETURN pops back. Native functions and
//! meta-methods run nested through `State::call_value_at`.

use crate::arith::ArithOp;
use crate::coerce;
use crate::error::Error;
use crate::state::State;
use lunet_compiler::opcode::{fb_to_int, is_rk_const, rk_index, OpCode, FIELDS_PER_FLUSH};
use lunet_compiler::proto::{Constant, Proto};
use lunet_core::heap::{Closure, FuncKind};
use lunet_core::value::Value;
use std::rc::Rc;

/// Convert a constant-pool entry to a runtime value. String ids are
/// already resident in the state's interner (chunks are adopted on load).
pub(crate) fn constant_to_value(k: &Constant) -> Value {
    match k {
        Constant::Nil => Value::Nil,
        Constant::Boolean(b) => Value::Boolean(*b),
        Constant::Integer(i) => Value::Integer(*i),
        Constant::Float(f) => Value::Float(*f),
        Constant::String(id) => Value::String(*id),
    }
}

/// Run until the frame stack drops back to `entry_depth`.
pub(crate) fn execute(l: &mut State, entry_depth: usize) -> Result<(), Error> {
    loop {
        if l.stack.depth() <= entry_depth {
            return Ok(());
        }

        // Current frame context. The proto Rc is cheap to clone and keeps
        // the borrow checker out of the per-opcode code.
        let frame = l.stack.frame();
        let window = frame.window();
        let frame_start = frame.start;
        let frame_args = frame.num_args;
        let pc = frame.pc;
        let closure_ref = frame
            .func
            .as_function_ref()
            .ok_or_else(|| Error::internal("executing frame without a closure"))?;
        let proto_id = match l.heap.closure(closure_ref).kind {
            FuncKind::Lua { proto } => proto,
            FuncKind::Native { .. } => {
                return Err(Error::internal("executing a native frame"));
            }
        };
        let proto: Rc<Proto> = l.protos[proto_id as usize].proto.clone();

        if pc >= proto.code.len() {
            // Fell off the end of the bytecode; treat as a bare return.
            l.close_upvalues(frame_start);
            l.stack.return_frame(l.stack.data.len(), 0);
            continue;
        }

        let inst = proto.code[pc];
        l.stack.frame_mut().pc = pc + 1;

        let a = inst.a() as usize;
        let ra = window + a;

        // RK operand: register or constant by the encoding bit.
        macro_rules! rk {
            ($x:expr) => {{
                let x = $x;
                if is_rk_const(x) {
                    constant_to_value(&proto.constants[rk_index(x) as usize])
                } else {
                    l.stack.get_abs(window + x as usize)
                }
            }};
        }

        match inst.opcode() {
            OpCode::Move => {
                let v = l.stack.get_abs(window + inst.b() as usize);
                l.stack.set_abs(ra, v);
            }

            OpCode::LoadK => {
                let v = constant_to_value(&proto.constants[inst.bx() as usize]);
                l.stack.set_abs(ra, v);
            }

            OpCode::LoadKX => {
                let extra = proto.code[pc + 1];
                l.stack.frame_mut().pc = pc + 2;
                let v = constant_to_value(&proto.constants[extra.ax_field() as usize]);
                l.stack.set_abs(ra, v);
            }

            OpCode::LoadBool => {
                l.stack.set_abs(ra, Value::Boolean(inst.b() != 0));
                if inst.c() != 0 {
                    l.stack.frame_mut().pc += 1;
                }
            }

            OpCode::LoadNil => {
                for i in 0..=inst.b() as usize {
                    l.stack.set_abs(ra + i, Value::Nil);
                }
            }

            OpCode::GetUpval => {
                let uv = l.heap.closure(closure_ref).upvalues[inst.b() as usize];
                let v = l.upvalue_get(uv);
                l.stack.set_abs(ra, v);
            }

            OpCode::SetUpval => {
                let uv = l.heap.closure(closure_ref).upvalues[inst.b() as usize];
                let v = l.stack.get_abs(ra);
                l.upvalue_set(uv, v);
            }

            OpCode::GetTabUp => {
                let uv = l.heap.closure(closure_ref).upvalues[inst.b() as usize];
                let t = l.upvalue_get(uv);
                let key = rk!(inst.c());
                let v = l.table_get(t, key)?;
                l.stack.set_abs(ra, v);
            }

            OpCode::GetTable => {
                let t = l.stack.get_abs(window + inst.b() as usize);
                let key = rk!(inst.c());
                let v = l.table_get(t, key)?;
                l.stack.set_abs(ra, v);
            }

            OpCode::SetTabUp => {
                let uv = l.heap.closure(closure_ref).upvalues[a];
                let t = l.upvalue_get(uv);
                let key = rk!(inst.b());
                let val = rk!(inst.c());
                l.table_set(t, key, val)?;
            }

            OpCode::SetTable => {
                let t = l.stack.get_abs(ra);
                let key = rk!(inst.b());
                let val = rk!(inst.c());
                l.table_set(t, key, val)?;
            }

            OpCode::NewTable => {
                let array_hint = fb_to_int(inst.b()) as usize;
                let hash_hint = fb_to_int(inst.c()) as usize;
                let t = l.heap.alloc_table(array_hint, hash_hint);
                l.stack.set_abs(ra, Value::Table(t));
            }

            OpCode::Self_ => {
                let obj = l.stack.get_abs(window + inst.b() as usize);
                l.stack.set_abs(ra + 1, obj);
                let key = rk!(inst.c());
                let method = l.table_get(obj, key)?;
                l.stack.set_abs(ra, method);
            }

            OpCode::Add
            | OpCode::Sub
            | OpCode::Mul
            | OpCode::Mod
            | OpCode::Pow
            | OpCode::Div
            | OpCode::IDiv
            | OpCode::BAnd
            | OpCode::BOr
            | OpCode::BXor
            | OpCode::Shl
            | OpCode::Shr => {
                let op = match inst.opcode() {
                    OpCode::Add => ArithOp::Add,
                    OpCode::Sub => ArithOp::Sub,
                    OpCode::Mul => ArithOp::Mul,
                    OpCode::Mod => ArithOp::Mod,
                    OpCode::Pow => ArithOp::Pow,
                    OpCode::Div => ArithOp::Div,
                    OpCode::IDiv => ArithOp::IDiv,
                    OpCode::BAnd => ArithOp::BAnd,
                    OpCode::BOr => ArithOp::BOr,
                    OpCode::BXor => ArithOp::BXor,
                    OpCode::Shl => ArithOp::Shl,
                    _ => ArithOp::Shr,
                };
                let vb = rk!(inst.b());
                let vc = rk!(inst.c());
                let v = l.arith_value(op, vb, vc)?;
                l.stack.set_abs(ra, v);
            }

            OpCode::Unm => {
                let vb = l.stack.get_abs(window + inst.b() as usize);
                let v = l.unm_value(vb)?;
                l.stack.set_abs(ra, v);
            }

            OpCode::BNot => {
                let vb = l.stack.get_abs(window + inst.b() as usize);
                let v = l.bnot_value(vb)?;
                l.stack.set_abs(ra, v);
            }

            OpCode::Not => {
                let vb = l.stack.get_abs(window + inst.b() as usize);
                l.stack.set_abs(ra, Value::Boolean(vb.is_falsy()));
            }

            OpCode::Len => {
                let vb = l.stack.get_abs(window + inst.b() as usize);
                let v = l.len_value(vb)?;
                l.stack.set_abs(ra, v);
            }

            OpCode::Concat => {
                let b = inst.b() as usize;
                let c = inst.c() as usize;
                let values: Vec<Value> =
                    (b..=c).map(|i| l.stack.get_abs(window + i)).collect();
                let v = l.concat_values(&values)?;
                l.stack.set_abs(ra, v);
            }

            OpCode::Jmp => {
                if a != 0 {
                    // Close-upvalue hint: everything at or above A-1.
                    l.close_upvalues(window + a - 1);
                }
                let frame = l.stack.frame_mut();
                frame.pc = (frame.pc as i64 + inst.sbx() as i64) as usize;
            }

            OpCode::Eq => {
                let vb = rk!(inst.b());
                let vc = rk!(inst.c());
                let r = l.eq_value(vb, vc)?;
                if r != (a != 0) {
                    l.stack.frame_mut().pc += 1;
                }
            }

            OpCode::Lt => {
                let vb = rk!(inst.b());
                let vc = rk!(inst.c());
                let r = l.lt_value(vb, vc)?;
                if r != (a != 0) {
                    l.stack.frame_mut().pc += 1;
                }
            }

            OpCode::Le => {
                let vb = rk!(inst.b());
                let vc = rk!(inst.c());
                let r = l.le_value(vb, vc)?;
                if r != (a != 0) {
                    l.stack.frame_mut().pc += 1;
                }
            }

            OpCode::Test => {
                let va = l.stack.get_abs(ra);
                if va.is_truthy() != (inst.c() != 0) {
                    l.stack.frame_mut().pc += 1;
                }
            }

            OpCode::TestSet => {
                let vb = l.stack.get_abs(window + inst.b() as usize);
                if vb.is_truthy() == (inst.c() != 0) {
                    l.stack.set_abs(ra, vb);
                } else {
                    l.stack.frame_mut().pc += 1;
                }
            }

            OpCode::Call => {
                let b = inst.b() as usize;
                let nargs = if b == 0 {
                    l.stack.data.len().saturating_sub(ra + 1)
                } else {
                    b - 1
                };
                let c = inst.c();
                let nret = if c == 0 { -1 } else { c as i32 - 1 };
                // A Lua callee continues in this loop; a native completes
                // inside precall.
                l.precall(ra, nargs, nret)?;
            }

            OpCode::TailCall => {
                let b = inst.b() as usize;
                let nargs = if b == 0 {
                    l.stack.data.len().saturating_sub(ra + 1)
                } else {
                    b - 1
                };
                tail_call(l, ra, nargs, frame_start)?;
            }

            OpCode::Return => {
                let b = inst.b() as usize;
                let count = if b == 0 {
                    l.stack.data.len().saturating_sub(ra)
                } else {
                    b - 1
                };
                // Departing frames close their entire open list first.
                l.close_upvalues(frame_start);
                l.stack.return_frame(ra, count);
            }

            OpCode::ForPrep => {
                for_prep(l, window, a, inst.sbx())?;
            }

            OpCode::ForLoop => {
                for_loop(l, window, a, inst.sbx());
            }

            OpCode::TForCall => {
                // Fresh per-iteration loop variables: anything captured
                // from the previous round closes now.
                l.close_upvalues(window + a + 3);
                let cb = ra + 3;
                let func = l.stack.get_abs(ra);
                let state_arg = l.stack.get_abs(ra + 1);
                let control = l.stack.get_abs(ra + 2);
                l.stack.set_abs(cb, func);
                l.stack.set_abs(cb + 1, state_arg);
                l.stack.set_abs(cb + 2, control);
                l.stack.data.truncate(cb + 3);
                let nret = inst.c() as i32;
                l.precall(cb, 2, nret)?;
            }

            OpCode::TForLoop => {
                let control = l.stack.get_abs(ra + 1);
                if !control.is_nil() {
                    l.stack.set_abs(ra, control);
                    let frame = l.stack.frame_mut();
                    frame.pc = (frame.pc as i64 + inst.sbx() as i64) as usize;
                }
            }

            OpCode::SetList => {
                let b = inst.b() as usize;
                let mut c = inst.c() as usize;
                if c == 0 {
                    let extra = proto.code[pc + 1];
                    l.stack.frame_mut().pc = pc + 2;
                    c = extra.ax_field() as usize;
                }
                let count = if b == 0 {
                    l.stack.data.len().saturating_sub(ra + 1)
                } else {
                    b
                };
                let t = l
                    .stack
                    .get_abs(ra)
                    .as_table_ref()
                    .ok_or_else(|| Error::internal("SETLIST target is not a table"))?;
                let offset = (c as i64 - 1) * FIELDS_PER_FLUSH as i64;
                for i in 1..=count {
                    let v = l.stack.get_abs(ra + i);
                    l.heap.table_mut(t).set_int(offset + i as i64, v);
                }
            }

            OpCode::Closure => {
                let child = l.protos[proto_id as usize].children[inst.bx() as usize];
                let descs = l.protos[child as usize].proto.upvalues.clone();
                let mut upvalues = Vec::with_capacity(descs.len());
                for desc in &descs {
                    if desc.in_stack {
                        // Capture (or share) the enclosing frame's local.
                        let abs = window + desc.index as usize;
                        upvalues.push(l.find_or_create_upvalue(abs));
                    } else {
                        let parent = l.heap.closure(closure_ref);
                        upvalues.push(parent.upvalues[desc.index as usize]);
                    }
                }
                let r = l.heap.alloc_closure(Closure {
                    kind: FuncKind::Lua { proto: child },
                    upvalues,
                });
                l.stack.set_abs(ra, Value::Function(r));
            }

            OpCode::Vararg => {
                let b = inst.b() as usize;
                let np = proto.num_params;
                let va_start = frame_start + np as usize;
                let va_count = (frame_start + frame_args).saturating_sub(va_start);
                let wanted = if b == 0 { va_count } else { b - 1 };
                for i in 0..wanted {
                    let v = if i < va_count {
                        l.stack.get_abs(va_start + i)
                    } else {
                        Value::Nil
                    };
                    l.stack.set_abs(ra + i, v);
                }
                if b == 0 {
                    l.stack.data.truncate(ra + wanted);
                }
            }

            OpCode::ExtraArg => {
                // Consumed by its paired instruction; reaching it alone is
                // harmless.
            }
        }
    }
}

/// TAILCALL: the departing frame's upvalues close, then the callee reuses
/// the frame. A native callee degrades to call-then-return.
fn tail_call(l: &mut State, ra: usize, nargs: usize, frame_start: usize) -> Result<(), Error> {
    let callable = l.stack.get_abs(ra);

    let lua_proto = callable.as_function_ref().and_then(|cref| {
        match l.heap.closure(cref).kind {
            FuncKind::Lua { proto } => Some(proto),
            FuncKind::Native { .. } => None,
        }
    });

    match lua_proto {
        Some(proto_id) => {
            l.close_upvalues(frame_start);
            let p = l.protos[proto_id as usize].proto.clone();
            let hold = p.is_vararg;
            l.stack.tail_frame(callable, ra + 1, nargs, hold);

            let frame = l.stack.frame();
            let start = frame.start;
            let window = frame.window();
            let np = p.num_params as usize;
            if hold {
                for i in 0..np.min(nargs) {
                    let v = l.stack.get_abs(start + i);
                    l.stack.set_abs(window + i, v);
                }
            }
            for i in nargs.min(np)..np {
                l.stack.set_abs(window + i, Value::Nil);
            }
            let need = window + p.max_stack as usize;
            if l.stack.data.len() < need {
                l.stack.data.resize(need, Value::Nil);
            }
            Ok(())
        }
        None => {
            // Native (or __call) target: run it, then return its results
            // from this frame, preserving the caller's contract.
            l.close_upvalues(frame_start);
            l.call_value_at(ra, nargs, -1)?;
            let count = l.stack.data.len().saturating_sub(ra);
            l.stack.return_frame(ra, count);
            Ok(())
        }
    }
}

/// FORPREP: coerce the three control values (all-integer when possible,
/// else all-float), subtract the step from the index so the first FORLOOP
/// addition restores it, and jump to the FORLOOP.
fn for_prep(l: &mut State, window: usize, a: usize, sbx: i32) -> Result<(), Error> {
    let ra = window + a;
    let init = l.stack.get_abs(ra);
    let limit = l.stack.get_abs(ra + 1);
    let step = l.stack.get_abs(ra + 2);

    if let (Value::Integer(ii), Value::Integer(is)) = (init, step) {
        if is == 0 {
            return Err(Error::runtime("'for' step is zero"));
        }
        // An integer loop tolerates a float limit by clamping it inward.
        if let Some(il) = integer_for_limit(limit, is, &l.strings) {
            l.stack.set_abs(ra, Value::Integer(ii.wrapping_sub(is)));
            l.stack.set_abs(ra + 1, Value::Integer(il));
            l.stack.set_abs(ra + 2, Value::Integer(is));
            let frame = l.stack.frame_mut();
            frame.pc = (frame.pc as i64 + sbx as i64) as usize;
            return Ok(());
        }
    }

    let fi = coerce::to_number(init, &l.strings)
        .ok_or_else(|| Error::runtime("'for' initial value must be a number"))?;
    let fl = coerce::to_number(limit, &l.strings)
        .ok_or_else(|| Error::runtime("'for' limit must be a number"))?;
    let fs = coerce::to_number(step, &l.strings)
        .ok_or_else(|| Error::runtime("'for' step must be a number"))?;
    if fs == 0.0 {
        return Err(Error::runtime("'for' step is zero"));
    }
    l.stack.set_abs(ra, Value::Float(fi - fs));
    l.stack.set_abs(ra + 1, Value::Float(fl));
    l.stack.set_abs(ra + 2, Value::Float(fs));
    let frame = l.stack.frame_mut();
    frame.pc = (frame.pc as i64 + sbx as i64) as usize;
    Ok(())
}

/// Clamp a loop limit into integer range in the step's direction. Returns
/// None when the loop must run in floats.
fn integer_for_limit(
    limit: Value,
    step: i64,
    strings: &lunet_core::string::Interner,
) -> Option<i64> {
    if let Value::Integer(i) = limit {
        return Some(i);
    }
    let f = coerce::to_number(limit, strings)?;
    if f.is_nan() {
        // NaN limit: produce an immediately-false bound.
        return Some(if step > 0 { i64::MIN } else { i64::MAX });
    }
    let rounded = if step > 0 { f.floor() } else { f.ceil() };
    const IMAX_P1: f64 = -(i64::MIN as f64);
    if rounded >= IMAX_P1 {
        Some(i64::MAX)
    } else if rounded < i64::MIN as f64 {
        Some(i64::MIN)
    } else {
        Some(rounded as i64)
    }
}

/// FORLOOP: advance, test against the limit in the step's direction,
/// publish the counter, and loop while in range.
fn for_loop(l: &mut State, window: usize, a: usize, sbx: i32) {
    let ra = window + a;
    let counter = l.stack.get_abs(ra);
    let limit = l.stack.get_abs(ra + 1);
    let step = l.stack.get_abs(ra + 2);

    match (counter, limit, step) {
        (Value::Integer(ic), Value::Integer(il), Value::Integer(is)) => {
            // Overflow of the induction variable ends the loop.
            let Some(next) = ic.checked_add(is) else {
                return;
            };
            let cont = if is > 0 { next <= il } else { next >= il };
            if cont {
                l.stack.set_abs(ra, Value::Integer(next));
                l.stack.set_abs(ra + 3, Value::Integer(next));
                let frame = l.stack.frame_mut();
                frame.pc = (frame.pc as i64 + sbx as i64) as usize;
            }
        }
        _ => {
            let fc = counter.as_float().unwrap_or(0.0);
            let fl = limit.as_float().unwrap_or(0.0);
            let fs = step.as_float().unwrap_or(0.0);
            let next = fc + fs;
            let cont = if fs > 0.0 { next <= fl } else { next >= fl };
            if cont {
                l.stack.set_abs(ra, Value::Float(next));
                l.stack.set_abs(ra + 3, Value::Float(next));
                let frame = l.stack.frame_mut();
                frame.pc = (frame.pc as i64 + sbx as i64) as usize;
            }
        }
    }
}
