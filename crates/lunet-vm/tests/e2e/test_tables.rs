//! Table semantics at the script level.

use crate::helpers::*;

#[test]
fn constructor_parts() {
    run_ints(
        "local t = {10, 20, x = 30, [4] = 40, 3}\n\
         return t[1], t[2], t[3], t[4], t.x",
        &[10, 20, 3, 40, 30],
    );
}

#[test]
fn constructor_trailing_call_expands() {
    run_ints(
        "local function three() return 7, 8, 9 end\n\
         local t = {1, three()}\n\
         return #t, t[2], t[4]",
        &[4, 7, 9],
    );
}

#[test]
fn constructor_inner_call_truncates() {
    run_ints(
        "local function three() return 7, 8, 9 end\n\
         local t = {three(), 1}\n\
         return #t, t[1], t[2]",
        &[2, 7, 1],
    );
}

#[test]
fn int_and_float_keys_are_one_key() {
    run_ints(
        "local t = {}\nt[1] = 10\nt[2.0] = 20\n\
         return t[1.0], t[2]",
        &[10, 20],
    );
}

#[test]
fn nil_assignment_removes() {
    run_ints(
        "local t = {a = 1}\nt.a = nil\n\
         return t.a == nil and 1 or 0",
        &[1],
    );
}

#[test]
fn length_of_sequence() {
    run_ints("local t = {1, 2, 3, 4, 5}\nreturn #t", &[5]);
    run_ints("local t = {}\nfor i = 1, 100 do t[i] = i end\nreturn #t", &[100]);
}

#[test]
fn length_tracks_mutation() {
    run_ints(
        "local t = {1, 2, 3}\nt[4] = 4\nlocal a = #t\nt[4] = nil\nreturn a, #t",
        &[4, 3],
    );
}

#[test]
fn sparse_length_is_a_border() {
    run_bool(
        "local t = {}\nt[1] = 1\nt[2] = 2\nt[4] = 4\n\
         local n = #t\nreturn t[n] ~= nil and t[n + 1] == nil",
        true,
    );
}

#[test]
fn big_constructor_crosses_setlist_batches() {
    let items: Vec<String> = (1..=120).map(|i| i.to_string()).collect();
    let src = format!(
        "local t = {{{}}}\nlocal s = 0\nfor _, v in ipairs(t) do s = s + v end\nreturn #t, s",
        items.join(",")
    );
    run_ints(&src, &[120, (1..=120).sum()]);
}

#[test]
fn next_walks_everything() {
    run_ints(
        "local t = {10, 20, a = 30}\n\
         local count, sum = 0, 0\n\
         local k, v = next(t)\n\
         while k ~= nil do\n\
           count = count + 1\n\
           sum = sum + v\n\
           k, v = next(t, k)\n\
         end\n\
         return count, sum",
        &[3, 60],
    );
}

#[test]
fn next_on_empty_table() {
    run_bool("return next({}) == nil", true);
}

#[test]
fn nested_tables() {
    run_ints(
        "local t = {a = {b = {c = 42}}}\nreturn t.a.b.c",
        &[42],
    );
}

#[test]
fn table_identity() {
    run_bool("local a = {}\nlocal b = {}\nreturn a == b", false);
    run_bool("local a = {}\nlocal b = a\nreturn a == b", true);
}

#[test]
fn tables_as_keys() {
    run_ints(
        "local k1, k2 = {}, {}\nlocal t = {}\nt[k1] = 1\nt[k2] = 2\n\
         return t[k1], t[k2]",
        &[1, 2],
    );
}

#[test]
fn swap_assignment() {
    run_ints("local a, b = 1, 2\na, b = b, a\nreturn a, b", &[2, 1]);
}

#[test]
fn aliasing_assignment_hits_original_table() {
    // a[1] goes to the original table; a is rebound afterwards.
    run_ints(
        "local orig = {}\nlocal a = orig\n\
         a[1], a = 1, 1\n\
         return orig[1], a",
        &[1, 1],
    );
}

#[test]
fn reverse_order_aliasing_assignment() {
    run_ints(
        "local orig = {}\nlocal a = orig\n\
         a, a[1] = 2, 3\n\
         return orig[1], a",
        &[3, 2],
    );
}

#[test]
fn multi_assignment_excess_values_dropped() {
    run_ints("local a, b = 1, 2, 3\nreturn a, b", &[1, 2]);
}

#[test]
fn multi_assignment_missing_values_nil() {
    run_bool("local a, b, c = 1\nreturn b == nil and c == nil", true);
}

#[test]
fn rawget_rawset_bypass_meta() {
    run_ints(
        "local t = setmetatable({}, {\n\
           __index = function() return 99 end,\n\
           __newindex = function() error('no') end,\n\
         })\n\
         rawset(t, 'x', 7)\n\
         return rawget(t, 'x'), rawget(t, 'y') == nil and 1 or 0, t.y",
        &[7, 1, 99],
    );
}

#[test]
fn rawlen_and_rawequal() {
    run_bool("return rawequal({}, {}) == false and rawlen({1,2,3}) == 3", true);
}
