//! Meta-method dispatch: __index/__newindex chains, operators, __call.

use crate::helpers::*;

#[test]
fn index_table_chain() {
    run_ints(
        "local base = {x = 1}\n\
         local mid = setmetatable({y = 2}, {__index = base})\n\
         local top = setmetatable({}, {__index = mid})\n\
         return top.x, top.y",
        &[1, 2],
    );
}

#[test]
fn index_function() {
    run_ints(
        "local t = setmetatable({}, {__index = function(_, k) return #k end})\n\
         return t.abc, t.de",
        &[3, 2],
    );
}

#[test]
fn index_only_fires_on_miss() {
    run_ints(
        "local t = setmetatable({x = 5}, {__index = function() return 99 end})\n\
         return t.x, t.missing",
        &[5, 99],
    );
}

#[test]
fn newindex_function_intercepts_fresh_keys() {
    run_ints(
        "local log = {}\n\
         local t = setmetatable({}, {__newindex = function(_, k, v) log[k] = v * 2 end})\n\
         t.a = 21\n\
         return log.a, rawget(t, 'a') == nil and 1 or 0",
        &[42, 1],
    );
}

#[test]
fn newindex_skipped_for_present_keys() {
    run_ints(
        "local t = setmetatable({a = 1}, {__newindex = function() error('never') end})\n\
         t.a = 2\n\
         return t.a",
        &[2],
    );
}

#[test]
fn newindex_table_redirects() {
    run_ints(
        "local store = {}\n\
         local t = setmetatable({}, {__newindex = store})\n\
         t.k = 7\n\
         return store.k, rawget(t, 'k') == nil and 1 or 0",
        &[7, 1],
    );
}

#[test]
fn arithmetic_metamethods() {
    run_ints(
        "local mt = {}\n\
         mt.__add = function(a, b) return a.v + b.v end\n\
         mt.__mul = function(a, b) return a.v * b.v end\n\
         local x = setmetatable({v = 6}, mt)\n\
         local y = setmetatable({v = 7}, mt)\n\
         return x + y, x * y",
        &[13, 42],
    );
}

#[test]
fn arith_metamethod_on_second_operand() {
    run_ints(
        "local mt = {__add = function(a, b) return 100 end}\n\
         local x = setmetatable({}, mt)\n\
         return 1 + x, x + 1",
        &[100, 100],
    );
}

#[test]
fn unm_and_len_metamethods() {
    run_ints(
        "local mt = {__unm = function(a) return -a.v end, __len = function() return 7 end}\n\
         local x = setmetatable({v = 3}, mt)\n\
         return -x, #x",
        &[-3, 7],
    );
}

#[test]
fn eq_metamethod_same_type_only() {
    run_bool(
        "local mt = {__eq = function(a, b) return a.id == b.id end}\n\
         local a = setmetatable({id = 1}, mt)\n\
         local b = setmetatable({id = 1}, mt)\n\
         return a == b",
        true,
    );
    run_bool(
        "local mt = {__eq = function() return true end}\n\
         local a = setmetatable({}, mt)\n\
         return a == 1",
        false,
    );
}

#[test]
fn lt_and_le_metamethods() {
    run_bool(
        "local mt = {__lt = function(a, b) return a.v < b.v end}\n\
         local a = setmetatable({v = 1}, mt)\n\
         local b = setmetatable({v = 2}, mt)\n\
         return a < b and b > a",
        true,
    );
    // Without __le, a <= b falls back to not (b < a).
    run_bool(
        "local mt = {__lt = function(a, b) return a.v < b.v end}\n\
         local a = setmetatable({v = 2}, mt)\n\
         local b = setmetatable({v = 2}, mt)\n\
         return a <= b",
        true,
    );
}

#[test]
fn concat_metamethod() {
    // `..` associates right, so the meta-method fires for x .. 'b' first
    // and the textual prefix joins afterwards.
    run_str(
        "local mt = {__concat = function(a, b)\n\
           local av = type(a) == 'table' and a.v or a\n\
           local bv = type(b) == 'table' and b.v or b\n\
           return av .. '|' .. bv\n\
         end}\n\
         local x = setmetatable({v = 'X'}, mt)\n\
         return 'a' .. x .. 'b'",
        "aX|b",
    );
}

#[test]
fn call_metamethod() {
    run_ints(
        "local t = setmetatable({base = 10}, {__call = function(self, n) return self.base + n end})\n\
         return t(5)",
        &[15],
    );
}

#[test]
fn tostring_metamethod() {
    run_str(
        "local t = setmetatable({}, {__tostring = function() return 'custom' end})\n\
         return tostring(t)",
        "custom",
    );
}

#[test]
fn metatable_protection() {
    run_bool(
        "local t = setmetatable({}, {__metatable = 'locked'})\n\
         local ok = pcall(setmetatable, t, {})\n\
         return not ok and getmetatable(t) == 'locked'",
        true,
    );
}

#[test]
fn getmetatable_roundtrip() {
    run_bool(
        "local mt = {}\nlocal t = setmetatable({}, mt)\nreturn getmetatable(t) == mt",
        true,
    );
}

#[test]
fn string_type_metatable_provides_methods() {
    run_ints("return ('hello'):len(), ('abc'):byte(2)", &[5, 98]);
}

#[test]
fn pairs_metamethod() {
    run_ints(
        "local t = setmetatable({}, {__pairs = function(t)\n\
           local i = 0\n\
           return function()\n\
             i = i + 1\n\
             if i <= 3 then return i, i * 10 end\n\
           end, t, nil\n\
         end})\n\
         local s = 0\n\
         for k, v in pairs(t) do s = s + v end\n\
         return s",
        &[60],
    );
}
