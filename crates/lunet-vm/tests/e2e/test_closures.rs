//! Upvalue and closure semantics: sharing, closing, lifetimes.

use crate::helpers::*;

#[test]
fn counter_closure() {
    run_ints(
        "local function make()\n\
           local n = 0\n\
           return function() n = n + 1 return n end\n\
         end\n\
         local c = make()\n\
         c() c()\n\
         return c()",
        &[3],
    );
}

#[test]
fn two_closures_share_one_upvalue() {
    // Writes through either closure are visible to the other.
    run_ints(
        "local function make()\n\
           local x = 0\n\
           local function set(v) x = v end\n\
           local function get() return x end\n\
           return set, get\n\
         end\n\
         local set, get = make()\n\
         set(42)\n\
         return get()",
        &[42],
    );
}

#[test]
fn sharing_survives_scope_exit() {
    // After the local dies both closures keep mutating the same cell.
    run_ints(
        "local set, get\n\
         do\n\
           local x = 1\n\
           set = function(v) x = v end\n\
           get = function() return x end\n\
         end\n\
         set(10)\n\
         local a = get()\n\
         set(20)\n\
         return a, get()",
        &[10, 20],
    );
}

#[test]
fn separate_invocations_get_separate_cells() {
    run_ints(
        "local function make()\n\
           local n = 0\n\
           return function() n = n + 1 return n end\n\
         end\n\
         local a, b = make(), make()\n\
         a() a()\n\
         return a(), b()",
        &[3, 1],
    );
}

#[test]
fn break_leaves_captured_locals_reachable() {
    run_ints(
        "local f\n\
         for i = 1, 10 do\n\
           local v = i * 100\n\
           f = function() return v end\n\
           if i == 2 then break end\n\
         end\n\
         return f()",
        &[200],
    );
}

#[test]
fn while_loop_iterations_capture_fresh_locals() {
    run_ints(
        "local fs = {}\n\
         local i = 1\n\
         while i <= 3 do\n\
           local v = i\n\
           fs[i] = function() return v end\n\
           i = i + 1\n\
         end\n\
         return fs[1]() + fs[2]() + fs[3]()",
        &[6],
    );
}

#[test]
fn generic_for_captures_fresh_variable() {
    run_ints(
        "local fs = {}\n\
         for _, v in ipairs({10, 20, 30}) do\n\
           fs[#fs + 1] = function() return v end\n\
         end\n\
         return fs[1]() + fs[2]() + fs[3]()",
        &[60],
    );
}

#[test]
fn nested_upvalue_through_two_levels() {
    run_ints(
        "local x = 5\n\
         local function outer()\n\
           return function() return x end\n\
         end\n\
         x = 7\n\
         return outer()()",
        &[7],
    );
}

#[test]
fn upvalue_write_from_inner_function() {
    run_ints(
        "local total = 0\n\
         local function add(n) total = total + n end\n\
         add(1) add(2) add(3)\n\
         return total",
        &[6],
    );
}

#[test]
fn local_function_recursion_via_upvalue() {
    run_ints(
        "local function fact(n)\n\
           if n <= 1 then return 1 end\n\
           return n * fact(n - 1)\n\
         end\n\
         return fact(6)",
        &[720],
    );
}

#[test]
fn closure_sees_env_through_chunk() {
    run_ints("g = 11\nlocal function get() return g end\nreturn get()", &[11]);
}

#[test]
fn repeat_loop_closures_close_per_iteration() {
    run_ints(
        "local fs = {}\n\
         local i = 0\n\
         repeat\n\
           i = i + 1\n\
           local v = i\n\
           fs[i] = function() return v end\n\
         until i == 3\n\
         return fs[1]() + fs[2]() + fs[3]()",
        &[6],
    );
}

#[test]
fn upvalues_closed_on_error_unwind() {
    run_ints(
        "local get\n\
         local ok = pcall(function()\n\
           local x = 123\n\
           get = function() return x end\n\
           error('bail')\n\
         end)\n\
         return (not ok) and get() or -1",
        &[123],
    );
}
