//! The VM state: heap, interner, segmented stack, globals and registry,
//! prototype and native registries, and the open-upvalue engine.

use crate::error::Error;
use crate::meta::MetaNames;
use crate::stack::{Frame, Stack};
use crate::{arith, coerce, compare, dispatch};
use lunet_compiler::proto::Proto;
use lunet_core::heap::{Closure, FuncKind, Heap, Ref, Upvalue};
use lunet_core::string::{Interner, StrId};
use lunet_core::table::Table;
use lunet_core::value::Value;
use std::rc::Rc;

/// A host function callable from scripts. Arguments arrive as the frame's
/// stack slots; the function pushes its results and returns how many.
pub type NativeFn = fn(&mut State) -> Result<i32, Error>;

pub(crate) struct NativeEntry {
    pub func: NativeFn,
    pub name: &'static str,
}

/// A registered prototype: the node itself plus the registry ids of its
/// children (CLOSURE's Bx indexes this list).
pub(crate) struct StoredProto {
    pub proto: Rc<Proto>,
    pub children: Vec<u32>,
}

/// Recovery depth for native re-entry (pcall nesting, meta-method calls).
const MAX_NATIVE_DEPTH: usize = 200;
/// Frame-count ceiling; the value stack itself grows without limit.
const MAX_FRAMES: usize = 1 << 20;
/// Longest tolerated `__index`/`__newindex` chain.
const MAX_META_CHAIN: usize = 100;

/// A single independent Lua runtime.
pub struct State {
    pub heap: Heap,
    pub strings: Interner,
    pub(crate) stack: Stack,
    pub(crate) globals: Ref<Table>,
    pub(crate) registry: Ref<Table>,
    pub(crate) protos: Vec<StoredProto>,
    pub(crate) natives: Vec<NativeEntry>,
    /// Open upvalues ordered by descending absolute stack index.
    pub(crate) open_upvalues: Vec<(usize, Ref<Upvalue>)>,
    /// Shared per-type meta-tables, indexed by `Type as usize`.
    pub(crate) type_metatables: [Option<Ref<Table>>; 7],
    pub(crate) meta: MetaNames,
    pub(crate) native_depth: usize,
    /// Attach a host back-trace to recovered errors.
    pub native_trace: bool,
}

impl State {
    pub fn new() -> Self {
        let mut heap = Heap::new();
        let mut strings = Interner::new();
        let meta = MetaNames::init(&mut strings);
        let globals = heap.alloc_table(0, 32);
        let registry = heap.alloc_table(0, 8);

        let mut stack = Stack::new();
        stack.frames.push(Frame {
            func: Value::Nil,
            pc: 0,
            start: 0,
            num_args: 0,
            hold_args: false,
            num_ret: -1,
            ret_to: 0,
        });

        State {
            heap,
            strings,
            stack,
            globals,
            registry,
            protos: Vec::new(),
            natives: Vec::new(),
            open_upvalues: Vec::new(),
            type_metatables: [None; 7],
            meta,
            native_depth: 0,
            native_trace: false,
        }
    }

    // ---- Registries ----

    /// Register a prototype tree, returning the root's id. Children are
    /// detached into their own registry slots so CLOSURE can reference
    /// them by id.
    pub(crate) fn register_proto(&mut self, mut proto: Proto) -> u32 {
        let kids = std::mem::take(&mut proto.protos);
        let children: Vec<u32> = kids.into_iter().map(|c| self.register_proto(c)).collect();
        let id = self.protos.len() as u32;
        self.protos.push(StoredProto {
            proto: Rc::new(proto),
            children,
        });
        id
    }

    /// Rebuild the owned prototype tree for a registry id (for dump and
    /// disassembly).
    pub(crate) fn proto_tree(&self, id: u32) -> Proto {
        let stored = &self.protos[id as usize];
        let mut proto = (*stored.proto).clone();
        proto.protos = stored
            .children
            .iter()
            .map(|&c| self.proto_tree(c))
            .collect();
        proto
    }

    pub(crate) fn register_native(&mut self, func: NativeFn, name: &'static str) -> u32 {
        let id = self.natives.len() as u32;
        self.natives.push(NativeEntry { func, name });
        id
    }

    /// Allocate a native closure whose first upvalue is the given
    /// environment table (conventionally the globals).
    pub(crate) fn new_native_closure(&mut self, func: NativeFn, name: &'static str) -> Value {
        let native = self.register_native(func, name);
        let env = Value::Table(self.globals);
        let env_uv = self.heap.alloc_upvalue(Upvalue::Closed(env));
        let r = self.heap.alloc_closure(Closure {
            kind: FuncKind::Native { native },
            upvalues: vec![env_uv],
        });
        Value::Function(r)
    }

    // ---- Upvalue engine ----

    /// Find or create the open upvalue aliasing an absolute stack slot.
    /// Two closures capturing the same slot share the handle.
    pub(crate) fn find_or_create_upvalue(&mut self, abs: usize) -> Ref<Upvalue> {
        for &(idx, uv) in &self.open_upvalues {
            if idx == abs {
                return uv;
            }
        }
        let uv = self.heap.alloc_upvalue(Upvalue::Open(abs));
        self.open_upvalues.push((abs, uv));
        // The list stays ordered by descending absolute index.
        self.open_upvalues.sort_by(|a, b| b.0.cmp(&a.0));
        uv
    }

    /// Close every open upvalue at or above `level`: copy the slot value
    /// into the handle and drop the entry from the open list.
    pub(crate) fn close_upvalues(&mut self, level: usize) {
        // Descending order: the qualifying prefix is at the front.
        let mut keep = 0;
        while keep < self.open_upvalues.len() && self.open_upvalues[keep].0 >= level {
            keep += 1;
        }
        for &(abs, uv) in &self.open_upvalues[..keep] {
            let v = self.stack.get_abs(abs);
            *self.heap.upvalue_mut(uv) = Upvalue::Closed(v);
        }
        self.open_upvalues.drain(..keep);
    }

    pub(crate) fn upvalue_get(&self, uv: Ref<Upvalue>) -> Value {
        match *self.heap.upvalue(uv) {
            Upvalue::Open(abs) => self.stack.get_abs(abs),
            Upvalue::Closed(v) => v,
        }
    }

    pub(crate) fn upvalue_set(&mut self, uv: Ref<Upvalue>, v: Value) {
        match *self.heap.upvalue(uv) {
            Upvalue::Open(abs) => self.stack.set_abs(abs, v),
            Upvalue::Closed(_) => *self.heap.upvalue_mut(uv) = Upvalue::Closed(v),
        }
    }

    // ---- Calls ----

    /// Call the value at `func_abs` with `nargs` arguments above it, to
    /// completion. Results land at `func_abs`, adjusted to `nret`.
    pub(crate) fn call_value_at(
        &mut self,
        func_abs: usize,
        nargs: usize,
        nret: i32,
    ) -> Result<(), Error> {
        if self.native_depth >= MAX_NATIVE_DEPTH {
            return Err(Error::runtime("stack overflow (native call depth)"));
        }
        self.native_depth += 1;
        let entry = self.stack.depth();
        let result = (|| {
            if self.precall(func_abs, nargs, nret)? {
                dispatch::execute(self, entry)?;
            }
            Ok(())
        })();
        self.native_depth -= 1;
        result
    }

    /// Begin a call: push a frame for a Lua closure (returning true) or
    /// run a native to completion (returning false). Non-callables are
    /// retried through `__call` with the original value as first argument.
    pub(crate) fn precall(
        &mut self,
        func_abs: usize,
        mut nargs: usize,
        nret: i32,
    ) -> Result<bool, Error> {
        let mut callable = self.stack.get_abs(func_abs);
        let mut handler_hops = 0;
        let cref = loop {
            if let Some(cref) = callable.as_function_ref() {
                break cref;
            }
            // Not callable directly: retry through __call with the
            // original value slid in as the first argument.
            handler_hops += 1;
            if handler_hops > 8 {
                return Err(Error::runtime("'__call' chain too long"));
            }
            match self.metafield(callable, self.meta.call) {
                Some(handler) => {
                    self.stack.data.insert(func_abs, handler);
                    nargs += 1;
                    callable = handler;
                }
                None => {
                    return Err(Error::runtime(format!(
                        "attempt to call a {} value",
                        callable.type_name()
                    )));
                }
            }
        };

        if self.stack.depth() >= MAX_FRAMES {
            return Err(Error::runtime("stack overflow"));
        }

        let kind = self.heap.closure(cref).kind;
        match kind {
            FuncKind::Lua { proto } => {
                let p = self.protos[proto as usize].proto.clone();
                let hold = p.is_vararg;
                self.stack.add_frame(callable, func_abs, nargs, nret, hold);
                let frame = self.stack.frame();
                let start = frame.start;
                let window = frame.window();
                let np = p.num_params as usize;
                if hold {
                    // Fixed parameters move up into the register window;
                    // the raw arguments stay held below it for VARARG.
                    for i in 0..np.min(nargs) {
                        let v = self.stack.get_abs(start + i);
                        self.stack.set_abs(window + i, v);
                    }
                }
                for i in nargs.min(np)..np {
                    self.stack.set_abs(window + i, Value::Nil);
                }
                let need = window + p.max_stack as usize;
                if self.stack.data.len() < need {
                    self.stack.data.resize(need, Value::Nil);
                }
                Ok(true)
            }
            FuncKind::Native { native } => {
                self.stack.add_frame(callable, func_abs, nargs, nret, false);
                let func = self.natives[native as usize].func;
                let nres = func(self)? as usize;
                let src = self.stack.data.len() - nres;
                self.stack.return_frame(src, nres);
                Ok(false)
            }
        }
    }

    /// Call a meta-method with plain value arguments, returning its first
    /// result.
    pub(crate) fn call_meta(&mut self, f: Value, args: &[Value]) -> Result<Value, Error> {
        let func_abs = self.stack.data.len();
        self.stack.push(f);
        for &a in args {
            self.stack.push(a);
        }
        self.call_value_at(func_abs, args.len(), 1)?;
        let v = self.stack.get_abs(func_abs);
        self.stack.data.truncate(func_abs);
        Ok(v)
    }

    /// Textual back-trace of every frame above `from_depth`, innermost
    /// first.
    pub(crate) fn build_trace(&self, from_depth: usize) -> String {
        let mut out = String::new();
        for frame in self.stack.frames[from_depth.min(self.stack.frames.len())..]
            .iter()
            .rev()
        {
            match frame.func.as_function_ref() {
                Some(cref) => match self.heap.closure(cref).kind {
                    FuncKind::Lua { proto } => {
                        let p = &self.protos[proto as usize].proto;
                        let source = p
                            .source
                            .map(|id| self.strings.get_lossy(id).into_owned())
                            .unwrap_or_else(|| "?".to_string());
                        let line = p.line_at(frame.pc.saturating_sub(1));
                        out.push_str(&format!("\n    \"{source}\": <line: {line}>"));
                    }
                    FuncKind::Native { native } => {
                        let name = self.natives[native as usize].name;
                        out.push_str(&format!("\n    (native: {name})"));
                    }
                },
                None => out.push_str("\n    (boundary)"),
            }
        }
        out
    }

    /// Source position ("chunk:line: ") `level` frames up, for messages.
    pub fn where_at(&self, level: usize) -> String {
        let frames = &self.stack.frames;
        let mut remaining = level;
        for frame in frames.iter().rev() {
            if let Some(cref) = frame.func.as_function_ref() {
                if let FuncKind::Lua { proto } = self.heap.closure(cref).kind {
                    if remaining <= 1 {
                        let p = &self.protos[proto as usize].proto;
                        let source = p
                            .source
                            .map(|id| self.strings.get_lossy(id).into_owned())
                            .unwrap_or_else(|| "?".to_string());
                        let source = source
                            .strip_prefix(['=', '@'])
                            .map(str::to_string)
                            .unwrap_or(source);
                        let line = p.line_at(frame.pc.saturating_sub(1));
                        return format!("{source}:{line}: ");
                    }
                    remaining -= 1;
                }
            }
        }
        String::new()
    }

    // ---- Meta-tables ----

    /// The meta-table governing a value: own table for tables and
    /// userdata, the per-type shared table otherwise.
    pub(crate) fn metatable_of(&self, v: Value) -> Option<Ref<Table>> {
        match v {
            Value::Table(r) => self.heap.table(r).metatable,
            Value::Userdata(r) => self.heap.userdata(r).metatable,
            other => self.type_metatables[other.type_of() as usize],
        }
    }

    /// Read a named metafield of a value; nil fields read as absent.
    pub(crate) fn metafield(&self, v: Value, name: StrId) -> Option<Value> {
        let mt = self.metatable_of(v)?;
        let field = self.heap.table(mt).get_str(name);
        (!field.is_nil()).then_some(field)
    }

    // ---- Meta-aware table access ----

    /// Indexing with `__index` fallback: tables recurse, functions are
    /// called with `(table, key)`.
    pub(crate) fn table_get(&mut self, t: Value, key: Value) -> Result<Value, Error> {
        let mut cur = t;
        for _ in 0..MAX_META_CHAIN {
            if let Value::Table(tr) = cur {
                let raw = self.heap.table(tr).get(key);
                if !raw.is_nil() {
                    return Ok(raw);
                }
                match self.metafield(cur, self.meta.index) {
                    None => return Ok(Value::Nil),
                    Some(handler) if handler.as_function_ref().is_some() => {
                        return self.call_meta(handler, &[cur, key]);
                    }
                    Some(next) => cur = next,
                }
            } else {
                match self.metafield(cur, self.meta.index) {
                    Some(handler) if handler.as_function_ref().is_some() => {
                        return self.call_meta(handler, &[cur, key]);
                    }
                    Some(next) => cur = next,
                    None => {
                        return Err(Error::runtime(format!(
                            "attempt to index a {} value",
                            cur.type_name()
                        )));
                    }
                }
            }
        }
        Err(Error::runtime("'__index' chain too long; possible loop"))
    }

    /// Assignment with `__newindex` fallback for absent keys.
    pub(crate) fn table_set(&mut self, t: Value, key: Value, val: Value) -> Result<(), Error> {
        let mut cur = t;
        for _ in 0..MAX_META_CHAIN {
            if let Value::Table(tr) = cur {
                let present = !self.heap.table(tr).get(key).is_nil();
                if present {
                    return self
                        .heap
                        .table_mut(tr)
                        .set(key, val)
                        .map_err(|e| Error::runtime(e.message()));
                }
                match self.metafield(cur, self.meta.newindex) {
                    None => {
                        return self
                            .heap
                            .table_mut(tr)
                            .set(key, val)
                            .map_err(|e| Error::runtime(e.message()));
                    }
                    Some(handler) if handler.as_function_ref().is_some() => {
                        self.call_meta(handler, &[cur, key, val])?;
                        return Ok(());
                    }
                    Some(next) => cur = next,
                }
            } else {
                match self.metafield(cur, self.meta.newindex) {
                    Some(handler) if handler.as_function_ref().is_some() => {
                        self.call_meta(handler, &[cur, key, val])?;
                        return Ok(());
                    }
                    Some(next) => cur = next,
                    None => {
                        return Err(Error::runtime(format!(
                            "attempt to index a {} value",
                            cur.type_name()
                        )));
                    }
                }
            }
        }
        Err(Error::runtime("'__newindex' chain too long; possible loop"))
    }

    // ---- Meta-aware operators ----

    pub(crate) fn arith_value(
        &mut self,
        op: arith::ArithOp,
        a: Value,
        b: Value,
    ) -> Result<Value, Error> {
        match arith::arith(op, a, b, &self.strings) {
            arith::ArithResult::Ok(v) => Ok(v),
            arith::ArithResult::Error(e) => Err(e),
            arith::ArithResult::NeedMeta => {
                let event = self.arith_event(op);
                let mm = self
                    .metafield(a, event)
                    .or_else(|| self.metafield(b, event));
                match mm {
                    Some(handler) => self.call_meta(handler, &[a, b]),
                    None => {
                        let bad = if a.is_number() || a.as_str_id().is_some() {
                            b
                        } else {
                            a
                        };
                        let verb = if op.is_bitwise() {
                            "perform bitwise operation on"
                        } else {
                            "perform arithmetic on"
                        };
                        Err(Error::runtime(format!(
                            "attempt to {verb} a {} value",
                            bad.type_name()
                        )))
                    }
                }
            }
        }
    }

    fn arith_event(&self, op: arith::ArithOp) -> StrId {
        use arith::ArithOp::*;
        match op {
            Add => self.meta.add,
            Sub => self.meta.sub,
            Mul => self.meta.mul,
            Div => self.meta.div,
            IDiv => self.meta.idiv,
            Mod => self.meta.mod_,
            Pow => self.meta.pow,
            BAnd => self.meta.band,
            BOr => self.meta.bor,
            BXor => self.meta.bxor,
            Shl => self.meta.shl,
            Shr => self.meta.shr,
        }
    }

    pub(crate) fn unm_value(&mut self, v: Value) -> Result<Value, Error> {
        match arith::unary_minus(v, &self.strings) {
            arith::ArithResult::Ok(r) => Ok(r),
            arith::ArithResult::Error(e) => Err(e),
            arith::ArithResult::NeedMeta => match self.metafield(v, self.meta.unm) {
                Some(handler) => self.call_meta(handler, &[v, v]),
                None => Err(Error::runtime(format!(
                    "attempt to perform arithmetic on a {} value",
                    v.type_name()
                ))),
            },
        }
    }

    pub(crate) fn bnot_value(&mut self, v: Value) -> Result<Value, Error> {
        match arith::bitwise_not(v, &self.strings) {
            arith::ArithResult::Ok(r) => Ok(r),
            arith::ArithResult::Error(e) => Err(e),
            arith::ArithResult::NeedMeta => match self.metafield(v, self.meta.bnot) {
                Some(handler) => self.call_meta(handler, &[v, v]),
                None => Err(Error::runtime(format!(
                    "attempt to perform bitwise operation on a {} value",
                    v.type_name()
                ))),
            },
        }
    }

    /// Equality with `__eq`: the meta-method applies only between two
    /// tables or two userdata that are not already raw-equal.
    pub(crate) fn eq_value(&mut self, a: Value, b: Value) -> Result<bool, Error> {
        if compare::raw_eq(a, b) {
            return Ok(true);
        }
        let both_tables = matches!((a, b), (Value::Table(_), Value::Table(_)));
        let both_userdata = matches!((a, b), (Value::Userdata(_), Value::Userdata(_)));
        if !(both_tables || both_userdata) {
            return Ok(false);
        }
        let mm = self
            .metafield(a, self.meta.eq)
            .or_else(|| self.metafield(b, self.meta.eq));
        match mm {
            Some(handler) => Ok(self.call_meta(handler, &[a, b])?.is_truthy()),
            None => Ok(false),
        }
    }

    pub(crate) fn lt_value(&mut self, a: Value, b: Value) -> Result<bool, Error> {
        if let Some(r) = compare::raw_lt(a, b, &self.strings) {
            return Ok(r);
        }
        let mm = self
            .metafield(a, self.meta.lt)
            .or_else(|| self.metafield(b, self.meta.lt));
        match mm {
            Some(handler) => Ok(self.call_meta(handler, &[a, b])?.is_truthy()),
            None => Err(self.order_error(a, b)),
        }
    }

    pub(crate) fn le_value(&mut self, a: Value, b: Value) -> Result<bool, Error> {
        if let Some(r) = compare::raw_le(a, b, &self.strings) {
            return Ok(r);
        }
        let mm = self
            .metafield(a, self.meta.le)
            .or_else(|| self.metafield(b, self.meta.le));
        if let Some(handler) = mm {
            return Ok(self.call_meta(handler, &[a, b])?.is_truthy());
        }
        // a <= b  ==  not (b < a) when __le is absent.
        let mm = self
            .metafield(b, self.meta.lt)
            .or_else(|| self.metafield(a, self.meta.lt));
        match mm {
            Some(handler) => Ok(!self.call_meta(handler, &[b, a])?.is_truthy()),
            None => Err(self.order_error(a, b)),
        }
    }

    fn order_error(&self, a: Value, b: Value) -> Error {
        let (ta, tb) = (a.type_name(), b.type_name());
        if ta == tb {
            Error::runtime(format!("attempt to compare two {ta} values"))
        } else {
            Error::runtime(format!("attempt to compare {ta} with {tb}"))
        }
    }

    /// Length with `__len`: strings answer directly, a `__len` metafield
    /// wins over the raw table border.
    pub(crate) fn len_value(&mut self, v: Value) -> Result<Value, Error> {
        if let Value::String(id) = v {
            return Ok(Value::Integer(self.strings.get_bytes(id).len() as i64));
        }
        if let Some(handler) = self.metafield(v, self.meta.len) {
            return self.call_meta(handler, &[v]);
        }
        if let Value::Table(tr) = v {
            return Ok(Value::Integer(self.heap.table(tr).length()));
        }
        Err(Error::runtime(format!(
            "attempt to get length of a {} value",
            v.type_name()
        )))
    }

    /// Concatenate a run of values, right to left: adjacent
    /// string/number pairs concatenate textually, anything else goes
    /// through `__concat`.
    pub(crate) fn concat_values(&mut self, values: &[Value]) -> Result<Value, Error> {
        debug_assert!(!values.is_empty());
        let mut acc = *values.last().unwrap();
        for &v in values[..values.len() - 1].iter().rev() {
            let v_textual = v.as_str_id().is_some() || v.is_number();
            let acc_textual = acc.as_str_id().is_some() || acc.is_number();
            if v_textual && acc_textual {
                let mut bytes = Vec::new();
                let left = coerce::to_str_for_concat(v, &mut self.strings).unwrap();
                bytes.extend_from_slice(self.strings.get_bytes(left));
                let right = coerce::to_str_for_concat(acc, &mut self.strings).unwrap();
                bytes.extend_from_slice(self.strings.get_bytes(right));
                acc = Value::String(self.strings.intern(&bytes));
            } else {
                let mm = self
                    .metafield(v, self.meta.concat)
                    .or_else(|| self.metafield(acc, self.meta.concat));
                match mm {
                    Some(handler) => acc = self.call_meta(handler, &[v, acc])?,
                    None => {
                        let bad = if v_textual { acc } else { v };
                        return Err(Error::runtime(format!(
                            "attempt to concatenate a {} value",
                            bad.type_name()
                        )));
                    }
                }
            }
        }
        Ok(acc)
    }

    /// Human-readable form of a value, honoring `__tostring`.
    pub fn display_value(&mut self, v: Value) -> Result<String, Error> {
        if let Some(handler) = self.metafield(v, self.meta.tostring) {
            let r = self.call_meta(handler, &[v])?;
            return match r.as_str_id() {
                Some(id) => Ok(self.strings.get_lossy(id).into_owned()),
                None => Ok(self.raw_display(r)),
            };
        }
        Ok(self.raw_display(v))
    }

    pub(crate) fn raw_display(&self, v: Value) -> String {
        match v {
            Value::Nil => "nil".to_string(),
            Value::Boolean(b) => b.to_string(),
            Value::Integer(_) | Value::Float(_) => coerce::number_to_str(v).unwrap(),
            Value::String(id) => self.strings.get_lossy(id).into_owned(),
            Value::Table(r) => format!("table: 0x{:08x}", r.index()),
            Value::Function(r) => format!("function: 0x{:08x}", r.index()),
            Value::Userdata(r) => format!("userdata: 0x{:08x}", r.index()),
        }
    }

}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}
