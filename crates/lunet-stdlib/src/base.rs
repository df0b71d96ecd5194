//! The base library: globals available to every chunk.

use lunet_core::table::Cursor;
use lunet_core::value::{Type, Value};
use lunet_vm::{Error, State, FIRST_UPVAL, GLOBALS_INDEX, REGISTRY_INDEX};
use std::cell::RefCell;

/// Registry key for the ipairs iterator helper.
const RK_INEXT: &str = "lunet.base.inext";

pub fn open(l: &mut State) -> Result<(), Error> {
    l.register("print", lua_print);
    l.register("type", lua_type);
    l.register("tostring", lua_tostring);
    l.register("tonumber", lua_tonumber);
    l.register("next", lua_next);
    l.register("getiter", lua_getiter);
    l.register("pairs", lua_pairs);
    l.register("ipairs", lua_ipairs);
    l.register("select", lua_select);
    l.register("rawget", lua_rawget);
    l.register("rawset", lua_rawset);
    l.register("rawequal", lua_rawequal);
    l.register("rawlen", lua_rawlen);
    l.register("setmetatable", lua_setmetatable);
    l.register("getmetatable", lua_getmetatable);
    l.register("assert", lua_assert);
    l.register("error", lua_error);
    l.register("pcall", lua_pcall);
    l.register("xpcall", lua_xpcall);
    l.register("load", lua_load);

    // _G and _VERSION.
    l.push_index(GLOBALS_INDEX)?;
    l.set_global("_G")?;
    l.push_string("Lua 5.3");
    l.set_global("_VERSION")?;

    // Stash the ipairs primitive where redefinition of the global
    // cannot reach it.
    l.push_string(RK_INEXT);
    l.push_native(lua_inext, "inext");
    l.set_table_raw(REGISTRY_INDEX)?;
    Ok(())
}

fn arg_error(l: &State, n: usize, expected: &str) -> Error {
    Error::runtime(format!(
        "{}bad argument #{n} ({expected} expected, got {})",
        l.where_at(1),
        l.type_of(n as i64).map(|t| t.name()).unwrap_or("no value")
    ))
}

fn lua_print(l: &mut State) -> Result<i32, Error> {
    let n = l.top();
    let mut line = String::new();
    for i in 1..=n {
        if i > 1 {
            line.push('\t');
        }
        let v = l.value_at(i as i64)?;
        line.push_str(&l.display_value(v)?);
    }
    println!("{line}");
    Ok(0)
}

fn lua_type(l: &mut State) -> Result<i32, Error> {
    if l.top() == 0 {
        return Err(arg_error(l, 1, "value"));
    }
    let name = l.type_of(1)?.name();
    l.push_string(name);
    Ok(1)
}

fn lua_tostring(l: &mut State) -> Result<i32, Error> {
    if l.top() == 0 {
        return Err(arg_error(l, 1, "value"));
    }
    let v = l.value_at(1)?;
    let s = l.display_value(v)?;
    l.push_string(&s);
    Ok(1)
}

fn lua_tonumber(l: &mut State) -> Result<i32, Error> {
    if l.top() >= 2 && !l.is_nil(2) {
        // Explicit base: the value must be a string of digits.
        let base = l.to_integer(2);
        if !(2..=36).contains(&base) {
            return Err(Error::runtime(format!(
                "{}bad argument #2 to 'tonumber' (base out of range)",
                l.where_at(1)
            )));
        }
        let Some(text) = l.try_bytes(1) else {
            return Err(arg_error(l, 1, "string"));
        };
        let s = String::from_utf8_lossy(&text);
        let s = s.trim();
        let (neg, digits) = match s.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, s.strip_prefix('+').unwrap_or(s)),
        };
        if digits.is_empty() {
            l.push_nil();
            return Ok(1);
        }
        let mut acc: i64 = 0;
        for c in digits.chars() {
            match c.to_digit(36) {
                Some(d) if (d as i64) < base => {
                    acc = acc.wrapping_mul(base).wrapping_add(d as i64);
                }
                _ => {
                    l.push_nil();
                    return Ok(1);
                }
            }
        }
        l.push_integer(if neg { acc.wrapping_neg() } else { acc });
        return Ok(1);
    }

    match l.value_at(1)? {
        v @ (Value::Integer(_) | Value::Float(_)) => l.push_value(v),
        Value::String(id) => {
            let bytes = l.strings.get_bytes(id).to_vec();
            match lunet_vm::coerce::str_to_number(&bytes) {
                Some(v) => l.push_value(v),
                None => l.push_nil(),
            }
        }
        _ => l.push_nil(),
    }
    Ok(1)
}

fn lua_next(l: &mut State) -> Result<i32, Error> {
    if l.type_of(1)? != Type::Table {
        return Err(arg_error(l, 1, "table"));
    }
    if l.top() < 2 {
        l.push_nil();
    }
    // The key sits on top; `next` consumes it.
    if l.next(1)? {
        Ok(2)
    } else {
        l.push_nil();
        Ok(1)
    }
}

/// ipairs' iterator: (t, i) -> i+1, t[i+1], stopping at the first nil.
fn lua_inext(l: &mut State) -> Result<i32, Error> {
    let i = l.to_integer(2).wrapping_add(1);
    l.push_integer(i);
    l.push_integer(i);
    l.get_table(1)?;
    if l.is_nil(-1) {
        l.pop(2);
        l.push_nil();
        Ok(1)
    } else {
        Ok(2)
    }
}

/// A self-contained table iterator: call it repeatedly for key/value
/// pairs. The closure owns its cursor, so interleaved iterations over
/// one table stay independent.
fn lua_getiter(l: &mut State) -> Result<i32, Error> {
    if l.type_of(1)? != Type::Table {
        return Err(arg_error(l, 1, "table"));
    }
    let cursor = l.table_cursor(1)?;
    l.push_index(1)?;
    l.push_userdata(Box::new(RefCell::new(cursor)));
    l.push_closure(lua_iter_step, "tableiter", 2)?;
    Ok(1)
}

/// The closure getiter hands out. Upvalue 1 is the table, upvalue 2 the
/// cursor cell; call arguments are ignored so it fits a generic for.
fn lua_iter_step(l: &mut State) -> Result<i32, Error> {
    let table = l.value_at(FIRST_UPVAL - 1)?;
    let cell = l.value_at(FIRST_UPVAL - 2)?;
    let tr = table
        .as_table_ref()
        .ok_or_else(|| Error::internal("table iterator lost its table"))?;
    let ur = cell
        .as_userdata_ref()
        .ok_or_else(|| Error::internal("table iterator lost its cursor"))?;

    let pair = {
        let cursor_cell = l
            .heap
            .userdata(ur)
            .data
            .downcast_ref::<RefCell<Cursor>>()
            .ok_or_else(|| Error::internal("table iterator cursor has a foreign type"))?;
        let mut cursor = cursor_cell.borrow_mut();
        l.heap.table(tr).cursor_next(&mut cursor)
    };

    match pair {
        Some((k, v)) => {
            l.push_value(k);
            l.push_value(v);
            Ok(2)
        }
        None => {
            l.push_nil();
            Ok(1)
        }
    }
}

fn lua_pairs(l: &mut State) -> Result<i32, Error> {
    if l.top() == 0 {
        return Err(arg_error(l, 1, "table"));
    }
    // __pairs overrides the default triple.
    if l.get_meta_field(1, "__pairs")? {
        l.push_index(1)?;
        l.call(1, 3)?;
        return Ok(3);
    }
    // The default iterator is a self-contained cursor, not `next`, so
    // nested pairs loops over one table cannot disturb each other. The
    // table and first key ride along only for generic-for's benefit.
    lua_getiter(l)?;
    l.push_index(1)?;
    l.push_nil();
    Ok(3)
}

fn lua_ipairs(l: &mut State) -> Result<i32, Error> {
    if l.top() == 0 {
        return Err(arg_error(l, 1, "table"));
    }
    l.push_string(RK_INEXT);
    l.get_table_raw(REGISTRY_INDEX)?;
    l.push_index(1)?;
    l.push_integer(0);
    Ok(3)
}

fn lua_select(l: &mut State) -> Result<i32, Error> {
    let n = l.top();
    if let Some(b) = l.try_bytes(1) {
        if b == b"#" {
            l.push_integer(n as i64 - 1);
            return Ok(1);
        }
    }
    let i = l.to_integer(1);
    if i == 0 {
        return Err(Error::runtime(format!(
            "{}bad argument #1 to 'select' (index out of range)",
            l.where_at(1)
        )));
    }
    let start = if i < 0 {
        let s = n as i64 + i;
        if s < 1 {
            return Err(Error::runtime(format!(
                "{}bad argument #1 to 'select' (index out of range)",
                l.where_at(1)
            )));
        }
        s + 1
    } else {
        i + 1
    };
    let mut count = 0;
    for idx in start..=(n as i64) {
        l.push_index(idx)?;
        count += 1;
    }
    Ok(count)
}

fn lua_rawget(l: &mut State) -> Result<i32, Error> {
    if l.type_of(1)? != Type::Table {
        return Err(arg_error(l, 1, "table"));
    }
    l.push_index(2)?;
    l.get_table_raw(1)?;
    Ok(1)
}

fn lua_rawset(l: &mut State) -> Result<i32, Error> {
    if l.type_of(1)? != Type::Table {
        return Err(arg_error(l, 1, "table"));
    }
    l.push_index(2)?;
    l.push_index(3)?;
    l.set_table_raw(1)?;
    l.push_index(1)?;
    Ok(1)
}

fn lua_rawequal(l: &mut State) -> Result<i32, Error> {
    let a = l.value_at(1).unwrap_or(Value::Nil);
    let b = l.value_at(2).unwrap_or(Value::Nil);
    l.push_bool(a == b);
    Ok(1)
}

fn lua_rawlen(l: &mut State) -> Result<i32, Error> {
    let n = l.length_raw(1)?;
    l.push_integer(n);
    Ok(1)
}

fn lua_setmetatable(l: &mut State) -> Result<i32, Error> {
    if l.type_of(1)? != Type::Table {
        return Err(arg_error(l, 1, "table"));
    }
    let mt_type = l.type_of(2)?;
    if mt_type != Type::Table && mt_type != Type::Nil {
        return Err(arg_error(l, 2, "nil or table"));
    }
    if l.get_meta_field(1, "__metatable")? {
        return Err(Error::runtime(format!(
            "{}cannot change a protected metatable",
            l.where_at(1)
        )));
    }
    l.push_index(2)?;
    l.set_metatable(1)?;
    l.push_index(1)?;
    Ok(1)
}

fn lua_getmetatable(l: &mut State) -> Result<i32, Error> {
    // __metatable shields the real table.
    if l.get_meta_field(1, "__metatable")? {
        return Ok(1);
    }
    if l.get_metatable(1)? {
        Ok(1)
    } else {
        l.push_nil();
        Ok(1)
    }
}

fn lua_assert(l: &mut State) -> Result<i32, Error> {
    if l.top() == 0 || !l.to_bool(1) {
        if l.top() >= 2 {
            let v = l.value_at(2)?;
            let msg = l.display_value(v)?;
            return Err(Error::with_value(v, Some(msg)));
        }
        return Err(Error::runtime(format!(
            "{}assertion failed!",
            l.where_at(1)
        )));
    }
    // Pass every argument through.
    Ok(l.top() as i32)
}

fn lua_error(l: &mut State) -> Result<i32, Error> {
    let level = l.opt_integer(2, 1);
    let v = l.value_at(1).unwrap_or(Value::Nil);
    // A string message at level > 0 gains position information.
    if let Value::String(id) = v {
        if level > 0 {
            let msg = format!(
                "{}{}",
                l.where_at(level as usize),
                l.strings.get_lossy(id)
            );
            let sid = l.strings.intern(msg.as_bytes());
            return Err(Error::with_value(Value::String(sid), Some(msg)));
        }
        let msg = l.strings.get_lossy(id).into_owned();
        return Err(Error::with_value(v, Some(msg)));
    }
    Err(Error::with_value(v, None))
}

/// Push an error's script-visible value: the carried Lua value when there
/// is one, otherwise the message as a string.
fn push_error_value(l: &mut State, e: &Error) {
    match e.value {
        Some(v) => l.push_value(v),
        None => {
            let msg = e.message.clone().unwrap_or_else(|| "unknown error".into());
            l.push_string(&msg);
        }
    }
}

fn lua_pcall(l: &mut State) -> Result<i32, Error> {
    let n = l.top();
    if n == 0 {
        return Err(arg_error(l, 1, "value"));
    }
    match l.pcall(n - 1, -1) {
        Ok(()) => {
            // Everything left in the frame is a result.
            l.push_bool(true);
            l.insert(1)?;
            Ok(l.top() as i32)
        }
        Err(e) => {
            l.push_bool(false);
            push_error_value(l, &e);
            Ok(2)
        }
    }
}

fn lua_xpcall(l: &mut State) -> Result<i32, Error> {
    let n = l.top();
    if n < 2 {
        return Err(arg_error(l, 2, "value"));
    }
    // (f, handler, args...): run a copy of f protected, keeping the
    // handler reachable at slot 2 for the error path.
    let nargs = n - 2;
    l.push_index(1)?;
    for i in 0..nargs {
        l.push_index(3 + i as i64)?;
    }
    match l.pcall(nargs, -1) {
        Ok(()) => {
            let results = l.top() - n;
            l.push_bool(true);
            l.insert(n as i64 + 1)?;
            Ok(results as i32 + 1)
        }
        Err(e) => {
            // Invoke the message handler with the error value.
            l.push_index(2)?;
            push_error_value(l, &e);
            match l.pcall(1, 1) {
                Ok(()) => {
                    l.push_bool(false);
                    l.insert(-2)?;
                    Ok(2)
                }
                Err(e2) => {
                    l.push_bool(false);
                    push_error_value(l, &e2);
                    Ok(2)
                }
            }
        }
    }
}

fn lua_load(l: &mut State) -> Result<i32, Error> {
    let Some(chunk_bytes) = l.try_bytes(1) else {
        return Err(arg_error(l, 1, "string"));
    };
    let name = l.opt_string(2, "=(load)");
    let mode = l.opt_string(3, "bt");
    let env = if l.top() >= 4 {
        Some(l.value_at(4)?)
    } else {
        None
    };
    let result = match env {
        Some(env) => l.load_with_env(&chunk_bytes, &name, &mode, env),
        None => l.load(&chunk_bytes, &name, &mode),
    };
    match result {
        Ok(()) => Ok(1),
        Err(e) => {
            // load reports failure as (nil, message) instead of raising.
            l.push_nil();
            let msg = e.message.clone().unwrap_or_else(|| e.to_string());
            l.push_string(&msg);
            Ok(2)
        }
    }
}
