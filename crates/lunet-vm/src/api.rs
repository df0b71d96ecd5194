//! The embedding API: the host drives the VM through an opaque [`State`]
//! and integer stack indices.
//!
//! Positive indices count from the current frame's first slot (1-based);
//! negative indices count from the top. Two sentinels select the
//! per-state registry and the global table, and `FIRST_UPVAL - i`
//! addresses upvalue `i` of the running native function.

use crate::chunk;
use crate::error::{Error, ErrorKind};
use crate::state::{NativeFn, State};
use lunet_compiler::proto::{Constant, Proto};
use lunet_core::heap::{Closure, FuncKind, Upvalue};
use lunet_core::string::Interner;
use lunet_core::table::Cursor;
use lunet_core::value::{SubType, Type, Value};
use std::any::Any;

/// Comparison operators for [`State::compare`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Lt,
    Le,
}

/// Sentinel index selecting the per-state registry table.
pub const REGISTRY_INDEX: i64 = -1_000_000;
/// Sentinel index selecting the global table.
pub const GLOBALS_INDEX: i64 = -1_000_001;
/// First native-upvalue sentinel; upvalue `i` is `FIRST_UPVAL - i`.
pub const FIRST_UPVAL: i64 = -1_000_002;

enum Slot {
    Stack(usize),
    Registry,
    Globals,
    Upval(usize),
}

impl State {
    fn slot(&self, idx: i64) -> Result<Slot, Error> {
        if idx == REGISTRY_INDEX {
            Ok(Slot::Registry)
        } else if idx == GLOBALS_INDEX {
            Ok(Slot::Globals)
        } else if idx <= FIRST_UPVAL {
            Ok(Slot::Upval((FIRST_UPVAL - idx) as usize))
        } else {
            Ok(Slot::Stack(self.stack.abs_index(idx)?))
        }
    }

    /// The value at a stack index (or sentinel).
    pub fn value_at(&self, idx: i64) -> Result<Value, Error> {
        match self.slot(idx)? {
            Slot::Stack(abs) => Ok(self.stack.get_abs(abs)),
            Slot::Registry => Ok(Value::Table(self.registry)),
            Slot::Globals => Ok(Value::Table(self.globals)),
            Slot::Upval(n) => {
                let frame = self.stack.frame();
                let cref = frame.func.as_function_ref().ok_or_else(|| {
                    Error::runtime("no native function is running")
                })?;
                let upvals = &self.heap.closure(cref).upvalues;
                let uv = upvals
                    .get(n)
                    .copied()
                    .ok_or_else(|| Error::runtime(format!("no upvalue {n}")))?;
                Ok(self.upvalue_get(uv))
            }
        }
    }

    // ---- Stack shape ----

    /// Number of values in the current frame.
    pub fn top(&self) -> usize {
        self.stack.top()
    }

    /// Convert a relative index to its positive form.
    pub fn abs_index(&self, idx: i64) -> Result<i64, Error> {
        if idx <= REGISTRY_INDEX {
            return Ok(idx);
        }
        let abs = self.stack.abs_index(idx)?;
        Ok((abs - self.stack.frame().window()) as i64 + 1)
    }

    pub fn pop(&mut self, n: usize) {
        self.stack.pop(n);
    }

    /// Push a copy of the value at `idx`.
    pub fn push_index(&mut self, idx: i64) -> Result<(), Error> {
        let v = self.value_at(idx)?;
        self.stack.push(v);
        Ok(())
    }

    /// Move the top value into position `idx`, shifting what was there up.
    pub fn insert(&mut self, idx: i64) -> Result<(), Error> {
        let abs = self.stack.abs_index(idx)?;
        let v = self
            .stack
            .data
            .pop()
            .ok_or_else(|| Error::runtime("insert on an empty frame"))?;
        self.stack.data.insert(abs, v);
        Ok(())
    }

    /// Assign the value at `src` into `dest` (both may be sentinels).
    pub fn copy(&mut self, dest: i64, src: i64) -> Result<(), Error> {
        let v = self.value_at(src)?;
        match self.slot(dest)? {
            Slot::Stack(abs) => {
                self.stack.set_abs(abs, v);
                Ok(())
            }
            Slot::Registry => match v.as_table_ref() {
                Some(r) => {
                    self.registry = r;
                    Ok(())
                }
                None => Err(Error::runtime("the registry must be a table")),
            },
            Slot::Globals => match v.as_table_ref() {
                Some(r) => {
                    self.globals = r;
                    Ok(())
                }
                None => Err(Error::runtime("the global environment must be a table")),
            },
            Slot::Upval(n) => {
                let frame = self.stack.frame();
                let cref = frame
                    .func
                    .as_function_ref()
                    .ok_or_else(|| Error::runtime("no native function is running"))?;
                let uv = self
                    .heap
                    .closure(cref)
                    .upvalues
                    .get(n)
                    .copied()
                    .ok_or_else(|| Error::runtime(format!("no upvalue {n}")))?;
                self.upvalue_set(uv, v);
                Ok(())
            }
        }
    }

    // ---- Push ----

    pub fn push_value(&mut self, v: Value) {
        self.stack.push(v);
    }

    pub fn push_nil(&mut self) {
        self.stack.push(Value::Nil);
    }

    pub fn push_bool(&mut self, b: bool) {
        self.stack.push(Value::Boolean(b));
    }

    pub fn push_integer(&mut self, i: i64) {
        self.stack.push(Value::Integer(i));
    }

    pub fn push_float(&mut self, f: f64) {
        self.stack.push(Value::Float(f));
    }

    pub fn push_string(&mut self, s: &str) {
        let id = self.strings.intern(s.as_bytes());
        self.stack.push(Value::String(id));
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        let id = self.strings.intern(bytes);
        self.stack.push(Value::String(id));
    }

    /// Push a native function bound to the global environment.
    pub fn push_native(&mut self, func: NativeFn, name: &'static str) {
        let v = self.new_native_closure(func, name);
        self.stack.push(v);
    }

    /// Push a native closure capturing `n` values from the top of the
    /// stack as its extra upvalues (after the conventional environment).
    pub fn push_closure(&mut self, func: NativeFn, name: &'static str, n: usize) -> Result<(), Error> {
        if self.stack.top() < n {
            return Err(Error::runtime("not enough values for closure upvalues"));
        }
        let native = self.register_native(func, name);
        let env = Value::Table(self.globals);
        let mut upvalues = vec![self.heap.alloc_upvalue(Upvalue::Closed(env))];
        let base = self.stack.data.len() - n;
        for i in 0..n {
            let v = self.stack.data[base + i];
            upvalues.push(self.heap.alloc_upvalue(Upvalue::Closed(v)));
        }
        self.stack.data.truncate(base);
        let r = self.heap.alloc_closure(Closure {
            kind: FuncKind::Native { native },
            upvalues,
        });
        self.stack.push(Value::Function(r));
        Ok(())
    }

    /// Wrap an arbitrary host object as userdata.
    pub fn push_userdata(&mut self, data: Box<dyn Any>) {
        let r = self.heap.alloc_userdata(data);
        self.stack.push(Value::Userdata(r));
    }

    // ---- Type queries and typed reads ----

    pub fn type_of(&self, idx: i64) -> Result<Type, Error> {
        Ok(self.value_at(idx)?.type_of())
    }

    pub fn sub_type_of(&self, idx: i64) -> Result<SubType, Error> {
        Ok(self.value_at(idx)?.sub_type_of())
    }

    pub fn is_nil(&self, idx: i64) -> bool {
        self.value_at(idx).map(|v| v.is_nil()).unwrap_or(true)
    }

    /// Integer value with coercion, or None.
    pub fn try_integer(&self, idx: i64) -> Option<i64> {
        let v = self.value_at(idx).ok()?;
        crate::coerce::to_integer(v, &self.strings)
    }

    /// Integer value with coercion, defaulting to 0.
    pub fn to_integer(&self, idx: i64) -> i64 {
        self.try_integer(idx).unwrap_or(0)
    }

    /// Integer value, or `default` when absent or nil.
    pub fn opt_integer(&self, idx: i64, default: i64) -> i64 {
        if self.is_nil(idx) {
            default
        } else {
            self.to_integer(idx)
        }
    }

    pub fn try_float(&self, idx: i64) -> Option<f64> {
        let v = self.value_at(idx).ok()?;
        crate::coerce::to_number(v, &self.strings)
    }

    pub fn to_float(&self, idx: i64) -> f64 {
        self.try_float(idx).unwrap_or(0.0)
    }

    pub fn opt_float(&self, idx: i64, default: f64) -> f64 {
        if self.is_nil(idx) {
            default
        } else {
            self.to_float(idx)
        }
    }

    pub fn to_bool(&self, idx: i64) -> bool {
        self.value_at(idx).map(|v| v.is_truthy()).unwrap_or(false)
    }

    /// Raw bytes of a string value (numbers convert), or None.
    pub fn try_bytes(&self, idx: i64) -> Option<Vec<u8>> {
        match self.value_at(idx).ok()? {
            Value::String(id) => Some(self.strings.get_bytes(id).to_vec()),
            v @ (Value::Integer(_) | Value::Float(_)) => {
                Some(crate::coerce::number_to_str(v).unwrap().into_bytes())
            }
            _ => None,
        }
    }

    /// Lossy string form of a string or number value; other types give "".
    pub fn to_string_at(&self, idx: i64) -> String {
        self.try_bytes(idx)
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default()
    }

    pub fn opt_string(&self, idx: i64, default: &str) -> String {
        if self.is_nil(idx) {
            default.to_string()
        } else {
            self.to_string_at(idx)
        }
    }

    // ---- Tables ----

    /// Push a fresh table with capacity hints.
    pub fn new_table(&mut self, array_hint: usize, hash_hint: usize) {
        let t = self.heap.alloc_table(array_hint, hash_hint);
        self.stack.push(Value::Table(t));
    }

    /// `t[k]` with meta: pops the key, pushes the result.
    pub fn get_table(&mut self, idx: i64) -> Result<Type, Error> {
        let t = self.value_at(idx)?;
        let key = self
            .stack
            .data
            .pop()
            .ok_or_else(|| Error::runtime("get_table needs a key on the stack"))?;
        let v = self.table_get(t, key)?;
        self.stack.push(v);
        Ok(v.type_of())
    }

    /// Raw `t[k]`: pops the key, pushes the result.
    pub fn get_table_raw(&mut self, idx: i64) -> Result<Type, Error> {
        let t = self.value_at(idx)?;
        let key = self
            .stack
            .data
            .pop()
            .ok_or_else(|| Error::runtime("get_table_raw needs a key on the stack"))?;
        let tr = t
            .as_table_ref()
            .ok_or_else(|| Error::runtime("value is not a table"))?;
        let v = self.heap.table(tr).get(key);
        self.stack.push(v);
        Ok(v.type_of())
    }

    /// `t[k] = v` with meta: pops the value then the key.
    pub fn set_table(&mut self, idx: i64) -> Result<(), Error> {
        let t = self.value_at(idx)?;
        let val = self
            .stack
            .data
            .pop()
            .ok_or_else(|| Error::runtime("set_table needs key and value"))?;
        let key = self
            .stack
            .data
            .pop()
            .ok_or_else(|| Error::runtime("set_table needs key and value"))?;
        self.table_set(t, key, val)
    }

    /// Raw `t[k] = v`: pops the value then the key.
    pub fn set_table_raw(&mut self, idx: i64) -> Result<(), Error> {
        let t = self.value_at(idx)?;
        let val = self
            .stack
            .data
            .pop()
            .ok_or_else(|| Error::runtime("set_table_raw needs key and value"))?;
        let key = self
            .stack
            .data
            .pop()
            .ok_or_else(|| Error::runtime("set_table_raw needs key and value"))?;
        let tr = t
            .as_table_ref()
            .ok_or_else(|| Error::runtime("value is not a table"))?;
        self.heap
            .table_mut(tr)
            .set(key, val)
            .map_err(|e| Error::runtime(e.message()))
    }

    /// Bulk-register native functions as fields of the table at `idx`.
    pub fn set_table_functions(
        &mut self,
        idx: i64,
        funcs: &[(&'static str, NativeFn)],
    ) -> Result<(), Error> {
        let t = self.value_at(idx)?;
        let tr = t
            .as_table_ref()
            .ok_or_else(|| Error::runtime("value is not a table"))?;
        for &(name, func) in funcs {
            let v = self.new_native_closure(func, name);
            let key = self.strings.intern(name.as_bytes());
            self.heap.table_mut(tr).set_str(key, v);
        }
        Ok(())
    }

    /// Raw length of a string or table.
    pub fn length_raw(&self, idx: i64) -> Result<i64, Error> {
        match self.value_at(idx)? {
            Value::String(id) => Ok(self.strings.get_bytes(id).len() as i64),
            Value::Table(tr) => Ok(self.heap.table(tr).length()),
            v => Err(Error::runtime(format!(
                "attempt to get length of a {} value",
                v.type_name()
            ))),
        }
    }

    /// Length honoring `__len`.
    pub fn length(&mut self, idx: i64) -> Result<i64, Error> {
        let v = self.value_at(idx)?;
        let r = self.len_value(v)?;
        crate::coerce::to_integer(r, &self.strings)
            .ok_or_else(|| Error::runtime("'__len' must return an integer"))
    }

    // ---- Iteration ----

    /// Legacy resumable iteration: pops a key, pushes the next key/value
    /// pair and returns true, or pushes nothing and returns false at the
    /// end. Not reentrant on one table.
    pub fn next(&mut self, idx: i64) -> Result<bool, Error> {
        let t = self.value_at(idx)?;
        let tr = t
            .as_table_ref()
            .ok_or_else(|| Error::runtime("value is not a table"))?;
        let key = self
            .stack
            .data
            .pop()
            .ok_or_else(|| Error::runtime("next needs a key on the stack"))?;
        match self.heap.table(tr).next(key) {
            Ok(Some((k, v))) => {
                self.stack.push(k);
                self.stack.push(v);
                Ok(true)
            }
            Ok(None) => Ok(false),
            Err(()) => Err(Error::runtime("invalid key to 'next'")),
        }
    }

    /// A self-contained iterator handle over the table at `idx`. Safe to
    /// interleave with other cursors over the same table.
    pub fn table_cursor(&self, idx: i64) -> Result<Cursor, Error> {
        self.value_at(idx)?
            .as_table_ref()
            .map(|_| Cursor::default())
            .ok_or_else(|| Error::runtime("value is not a table"))
    }

    /// Advance a cursor: pushes the next key/value pair and returns true,
    /// or pushes nothing at the end.
    pub fn cursor_next(&mut self, idx: i64, cursor: &mut Cursor) -> Result<bool, Error> {
        let t = self.value_at(idx)?;
        let tr = t
            .as_table_ref()
            .ok_or_else(|| Error::runtime("value is not a table"))?;
        match self.heap.table(tr).cursor_next(cursor) {
            Some((k, v)) => {
                self.stack.push(k);
                self.stack.push(v);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Invoke `body` once per key/value pair of the table at `idx`. The
    /// pair sits at -2/-1 during the callback and is popped afterwards;
    /// returning false breaks the walk.
    pub fn for_each<F>(&mut self, idx: i64, mut body: F) -> Result<(), Error>
    where
        F: FnMut(&mut State) -> Result<bool, Error>,
    {
        let idx = if idx < 0 && idx > REGISTRY_INDEX {
            self.abs_index(idx)?
        } else {
            idx
        };
        let mut cursor = self.table_cursor(idx)?;
        while self.cursor_next(idx, &mut cursor)? {
            let keep_going = body(self)?;
            self.pop(2);
            if !keep_going {
                break;
            }
        }
        Ok(())
    }

    /// Like `for_each`, but honors a `__pairs` metafield when present.
    pub fn for_each_pairs<F>(&mut self, idx: i64, mut body: F) -> Result<(), Error>
    where
        F: FnMut(&mut State) -> Result<bool, Error>,
    {
        let t = self.value_at(idx)?;
        let Some(handler) = self.metafield(t, self.meta.pairs) else {
            return self.for_each(idx, body);
        };

        // __pairs returns iterator, state, control.
        let base = self.stack.data.len();
        self.stack.push(handler);
        self.stack.push(t);
        self.call_value_at(base, 1, 3)?;
        let iter = self.stack.get_abs(base);
        let iter_state = self.stack.get_abs(base + 1);
        let mut control = self.stack.get_abs(base + 2);
        self.stack.data.truncate(base);

        loop {
            let call_at = self.stack.data.len();
            self.stack.push(iter);
            self.stack.push(iter_state);
            self.stack.push(control);
            self.call_value_at(call_at, 2, 2)?;
            let k = self.stack.get_abs(call_at);
            if k.is_nil() {
                self.stack.data.truncate(call_at);
                return Ok(());
            }
            control = k;
            let keep_going = body(self)?;
            self.stack.data.truncate(call_at);
            if !keep_going {
                return Ok(());
            }
        }
    }

    // ---- Meta-tables ----

    /// Push the meta-table of the value at `idx`, or return false.
    pub fn get_metatable(&mut self, idx: i64) -> Result<bool, Error> {
        let v = self.value_at(idx)?;
        match self.metatable_of(v) {
            Some(mt) => {
                self.stack.push(Value::Table(mt));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Pop a table (or nil) and install it as the meta-table of the value
    /// at `idx`. For non-table, non-userdata values the meta-table is
    /// shared by the whole type.
    pub fn set_metatable(&mut self, idx: i64) -> Result<(), Error> {
        let mt = self
            .stack
            .data
            .pop()
            .ok_or_else(|| Error::runtime("set_metatable needs a value"))?;
        let mt_ref = match mt {
            Value::Nil => None,
            Value::Table(r) => Some(r),
            _ => return Err(Error::runtime("meta-table must be a table or nil")),
        };
        let v = self.value_at(idx)?;
        match v {
            Value::Table(r) => self.heap.table_mut(r).metatable = mt_ref,
            Value::Userdata(r) => self.heap.userdata_mut(r).metatable = mt_ref,
            other => self.type_metatables[other.type_of() as usize] = mt_ref,
        }
        Ok(())
    }

    /// Push the named metafield of the value at `idx`, if present.
    pub fn get_meta_field(&mut self, idx: i64, name: &str) -> Result<bool, Error> {
        let v = self.value_at(idx)?;
        let key = self.strings.intern(name.as_bytes());
        match self.metafield(v, key) {
            Some(field) => {
                self.stack.push(field);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Compare the values at two indices, honoring `__eq`/`__lt`/`__le`.
    pub fn compare(&mut self, idx1: i64, idx2: i64, op: CompareOp) -> Result<bool, Error> {
        let a = self.value_at(idx1)?;
        let b = self.value_at(idx2)?;
        match op {
            CompareOp::Eq => self.eq_value(a, b),
            CompareOp::Lt => self.lt_value(a, b),
            CompareOp::Le => self.le_value(a, b),
        }
    }

    /// Raw comparison without meta-methods; only Eq is total.
    pub fn compare_raw(&self, idx1: i64, idx2: i64, op: CompareOp) -> Result<bool, Error> {
        let a = self.value_at(idx1)?;
        let b = self.value_at(idx2)?;
        match op {
            CompareOp::Eq => Ok(crate::compare::raw_eq(a, b)),
            CompareOp::Lt => crate::compare::raw_lt(a, b, &self.strings)
                .ok_or_else(|| self.cmp_error(a, b)),
            CompareOp::Le => crate::compare::raw_le(a, b, &self.strings)
                .ok_or_else(|| self.cmp_error(a, b)),
        }
    }

    fn cmp_error(&self, a: Value, b: Value) -> Error {
        Error::runtime(format!(
            "attempt to compare {} with {}",
            a.type_name(),
            b.type_name()
        ))
    }

    // ---- Calls and recovery ----

    /// Call the function below the top `nargs` values. Errors propagate
    /// without unwinding; only use inside a protected region.
    pub fn call(&mut self, nargs: usize, nrets: i32) -> Result<(), Error> {
        let len = self.stack.data.len();
        if len < nargs + 1 {
            return Err(Error::runtime("not enough values on the stack for call"));
        }
        self.call_value_at(len - nargs - 1, nargs, nrets)
    }

    /// The recovery primitive `Call` and host-side protection build on.
    ///
    /// On failure: upvalues above the watermark close, frames and slots
    /// above it unwind (cleared to nil), a back-trace is captured, and
    /// the wrapped error returns. `consumed` slots below the watermark
    /// (the callable and its arguments) are also discarded.
    pub fn recover<F>(&mut self, consumed: usize, with_trace: bool, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut State) -> Result<(), Error>,
    {
        let frames = self.stack.depth();
        let watermark = self.stack.data.len().saturating_sub(consumed);
        match f(self) {
            Ok(()) => Ok(()),
            Err(mut e) => {
                if e.is_fatal() {
                    return Err(e);
                }
                if with_trace && e.trace.is_none() {
                    let mut trace = self.build_trace(frames);
                    if self.native_trace {
                        trace.push_str(&format!(
                            "\n  host: {}",
                            std::backtrace::Backtrace::force_capture()
                        ));
                    }
                    e.trace = Some(trace);
                }
                self.close_upvalues(watermark);
                self.stack.frames.truncate(frames);
                let floor = watermark.min(self.stack.data.len());
                for slot in &mut self.stack.data[floor..] {
                    *slot = Value::Nil;
                }
                self.stack.data.truncate(watermark);
                Err(e)
            }
        }
    }

    /// Protected call: like `call`, but recovers cleanly. On error the
    /// stack is exactly as before the call minus the function and its
    /// arguments.
    pub fn pcall(&mut self, nargs: usize, nrets: i32) -> Result<(), Error> {
        self.recover(nargs + 1, true, |l| l.call(nargs, nrets))
    }

    /// Run a host closure under the recovery discipline.
    pub fn protect<F>(&mut self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut State) -> Result<(), Error>,
    {
        self.recover(0, true, f)
    }

    // ---- Load and dump ----

    /// Load a chunk and push the resulting closure bound to the global
    /// environment. A chunk starting with the binary signature is treated
    /// as binary regardless of `mode` ("b", "t", or "bt").
    pub fn load(&mut self, data: &[u8], name: &str, mode: &str) -> Result<(), Error> {
        let env = Value::Table(self.globals);
        self.load_with_env(data, name, mode, env)
    }

    /// Load a chunk against an explicit environment value.
    pub fn load_with_env(
        &mut self,
        data: &[u8],
        name: &str,
        mode: &str,
        env: Value,
    ) -> Result<(), Error> {
        let proto = if chunk::looks_binary(data) {
            chunk::undump(data, name, &mut self.strings)?
        } else {
            if !mode.contains('t') {
                return Err(Error::new(
                    ErrorKind::BinLoader,
                    format!("attempt to load a text chunk (mode is '{mode}')"),
                ));
            }
            let (mut proto, chunk_strings) = lunet_compiler::compile(data, name)?;
            adopt_proto(&mut proto, &chunk_strings, &mut self.strings);
            proto
        };

        let id = self.register_proto(proto);
        let env_uv = self.heap.alloc_upvalue(Upvalue::Closed(env));
        let r = self.heap.alloc_closure(Closure {
            kind: FuncKind::Lua { proto: id },
            upvalues: vec![env_uv],
        });
        self.stack.push(Value::Function(r));
        Ok(())
    }

    /// Serialize the Lua closure at `idx` to the binary chunk format.
    pub fn dump_function(&self, idx: i64, strip: bool) -> Result<Vec<u8>, Error> {
        let v = self.value_at(idx)?;
        let cref = v
            .as_function_ref()
            .ok_or_else(|| Error::new(ErrorKind::BinDumper, "value is not a function"))?;
        match self.heap.closure(cref).kind {
            FuncKind::Lua { proto } => {
                let tree = self.proto_tree(proto);
                Ok(chunk::dump(&tree, &self.strings, strip))
            }
            FuncKind::Native { .. } => Err(Error::new(
                ErrorKind::BinDumper,
                "unable to dump a native function",
            )),
        }
    }

    // ---- Globals ----

    /// Pop the top value and store it as a global.
    pub fn set_global(&mut self, name: &str) -> Result<(), Error> {
        let v = self
            .stack
            .data
            .pop()
            .ok_or_else(|| Error::runtime("set_global needs a value"))?;
        let key = self.strings.intern(name.as_bytes());
        let globals = self.globals;
        self.heap.table_mut(globals).set_str(key, v);
        Ok(())
    }

    /// Push the value of a global.
    pub fn get_global(&mut self, name: &str) -> Result<Type, Error> {
        let key = self.strings.intern(name.as_bytes());
        let v = self.heap.table(self.globals).get_str(key);
        self.stack.push(v);
        Ok(v.type_of())
    }

    /// Register a native function as a global.
    pub fn register(&mut self, name: &'static str, func: NativeFn) {
        let v = self.new_native_closure(func, name);
        let key = self.strings.intern(name.as_bytes());
        let globals = self.globals;
        self.heap.table_mut(globals).set_str(key, v);
    }

    /// Convenience: load and run a chunk, returning how many values it
    /// left on the stack.
    pub fn do_string(&mut self, source: &str, name: &str) -> Result<usize, Error> {
        let before = self.stack.data.len();
        self.load(source.as_bytes(), name, "bt")?;
        self.pcall(0, -1)?;
        Ok(self.stack.data.len() - before)
    }
}

/// Re-intern every string a freshly compiled prototype references, moving
/// it from the compiler's interner into the state's.
fn adopt_proto(proto: &mut Proto, from: &Interner, to: &mut Interner) {
    for k in &mut proto.constants {
        if let Constant::String(id) = k {
            *id = to.intern(from.get_bytes(*id));
        }
    }
    if let Some(src) = &mut proto.source {
        *src = to.intern(from.get_bytes(*src));
    }
    for lv in &mut proto.local_vars {
        lv.name = to.intern(from.get_bytes(lv.name));
    }
    for uv in &mut proto.upvalues {
        if let Some(name) = &mut uv.name {
            *name = to.intern(from.get_bytes(*name));
        }
    }
    for child in &mut proto.protos {
        adopt_proto(child, from, to);
    }
}
