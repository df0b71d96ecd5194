//! Loops, conditionals, goto, break, and continue.

use crate::helpers::*;

#[test]
fn if_elseif_else() {
    run_ints(
        "local function grade(n)\n\
           if n >= 90 then return 1\n\
           elseif n >= 60 then return 2\n\
           else return 3 end\n\
         end\n\
         return grade(95), grade(70), grade(10)",
        &[1, 2, 3],
    );
}

#[test]
fn while_loop() {
    run_ints(
        "local n, s = 1, 0\nwhile n <= 10 do s = s + n n = n + 1 end\nreturn s",
        &[55],
    );
}

#[test]
fn repeat_until_runs_once() {
    run_ints("local n = 0\nrepeat n = n + 1 until true\nreturn n", &[1]);
}

#[test]
fn repeat_condition_sees_body_local() {
    run_ints(
        "local n = 0\nrepeat local done = n >= 3 n = n + 1 until done\nreturn n",
        &[4],
    );
}

#[test]
fn numeric_for_basic() {
    run_ints("local s = 0\nfor i = 1, 5 do s = s + i end\nreturn s", &[15]);
}

#[test]
fn numeric_for_with_step() {
    run_ints(
        "local s = 0\nfor i = 10, 1, -2 do s = s + i end\nreturn s",
        &[30],
    );
    run_ints("local s = 0\nfor i = 1, 10, 3 do s = s + i end\nreturn s", &[22]);
}

#[test]
fn numeric_for_zero_iterations() {
    run_ints("local s = 99\nfor i = 5, 1 do s = i end\nreturn s", &[99]);
}

#[test]
fn numeric_for_float_control() {
    let (l, n) = run("local s = 0.0\nfor i = 0.5, 2.5, 0.5 do s = s + i end\nreturn s");
    assert_float(&l, n, 0, 7.5);
}

#[test]
fn numeric_for_zero_step_errors() {
    let msg = run_err("for i = 1, 10, 0 do end");
    assert!(msg.contains("'for' step is zero"), "{msg}");
}

#[test]
fn numeric_for_counter_is_local_copy() {
    // Mutating the visible counter does not affect iteration.
    run_ints(
        "local count = 0\nfor i = 1, 3 do i = 100 count = count + 1 end\nreturn count",
        &[3],
    );
}

#[test]
fn generic_for_over_pairs() {
    run_ints(
        "local t = {a = 1, b = 2, c = 3}\nlocal s = 0\n\
         for _, v in pairs(t) do s = s + v end\nreturn s",
        &[6],
    );
}

#[test]
fn generic_for_over_ipairs_stops_at_hole() {
    run_ints(
        "local t = {10, 20, 30}\nt[5] = 50\nlocal s = 0\n\
         for _, v in ipairs(t) do s = s + v end\nreturn s",
        &[60],
    );
}

#[test]
fn break_exits_innermost_loop() {
    run_ints(
        "local s = 0\n\
         for i = 1, 3 do\n\
           for j = 1, 10 do\n\
             if j > 2 then break end\n\
             s = s + 1\n\
           end\n\
         end\n\
         return s",
        &[6],
    );
}

#[test]
fn continue_skips_rest_of_iteration() {
    run_ints(
        "local s = 0\n\
         for i = 1, 10 do\n\
           if i % 2 == 0 then continue end\n\
           s = s + i\n\
         end\n\
         return s",
        &[25],
    );
}

#[test]
fn continue_in_while_retests_condition() {
    run_ints(
        "local i, s = 0, 0\n\
         while i < 10 do\n\
           i = i + 1\n\
           if i > 5 then continue end\n\
           s = s + i\n\
         end\n\
         return i, s",
        &[10, 15],
    );
}

#[test]
fn goto_backward_loop() {
    run_ints(
        "local i = 0\n::top::\ni = i + 1\nif i < 5 then goto top end\nreturn i",
        &[5],
    );
}

#[test]
fn goto_forward_skips() {
    run_ints(
        "local touched = 0\ngoto done\ntouched = 1\n::done::\nreturn touched",
        &[0],
    );
}

#[test]
fn goto_out_of_nested_block() {
    run_ints(
        "local n = 0\nfor i = 1, 3 do\n  do goto next end\n  n = n + 100\n  ::next::\n  n = n + 1\nend\nreturn n",
        &[3],
    );
}

#[test]
fn nested_function_calls() {
    run_ints(
        "local function add(a, b) return a + b end\n\
         local function twice(f, x) return f(x, x) end\n\
         return twice(add, 21)",
        &[42],
    );
}

#[test]
fn recursion() {
    run_ints(
        "local function fib(n)\n\
           if n <= 1 then return n end\n\
           return fib(n - 1) + fib(n - 2)\n\
         end\n\
         return fib(15)",
        &[610],
    );
}

#[test]
fn deep_tail_recursion_reuses_frame() {
    // Without TAILCALL frame reuse this would overflow the frame stack.
    run_ints(
        "local function count(n, acc)\n\
           if n == 0 then return acc end\n\
           return count(n - 1, acc + 1)\n\
         end\n\
         return count(100000, 0)",
        &[100000],
    );
}

#[test]
fn method_calls() {
    run_ints(
        "local obj = {base = 10}\n\
         function obj:add(n) return self.base + n end\n\
         return obj:add(5)",
        &[15],
    );
}

#[test]
fn multiple_returns_and_adjustment() {
    run_ints(
        "local function three() return 1, 2, 3 end\n\
         local a, b = three()\n\
         local c, d, e, f = three()\n\
         return a, b, c, d, e, f == nil and 99 or f",
        &[1, 2, 1, 2, 3, 99],
    );
}

#[test]
fn call_in_middle_of_list_truncates_to_one() {
    run_ints(
        "local function three() return 1, 2, 3 end\n\
         local a, b, c = three(), 10\n\
         return a, b, c == nil and -1 or c",
        &[1, 10, -1],
    );
}

#[test]
fn parenthesized_call_is_single_value() {
    run_ints(
        "local function three() return 1, 2, 3 end\n\
         local a, b = (three())\n\
         return a, b == nil and -1 or b",
        &[1, -1],
    );
}

#[test]
fn varargs() {
    run_ints(
        "local function sum(...)\n\
           local s = 0\n\
           for _, v in ipairs({...}) do s = s + v end\n\
           return s\n\
         end\n\
         return sum(1, 2, 3, 4)",
        &[10],
    );
}

#[test]
fn select_over_varargs() {
    run_ints(
        "local function count(...) return select('#', ...) end\n\
         local function second(...) return (select(2, ...)) end\n\
         return count(7, 8, 9), second(7, 8, 9)",
        &[3, 8],
    );
}

#[test]
fn vararg_forwarding() {
    run_ints(
        "local function inner(a, b, c) return a + b + c end\n\
         local function outer(...) return inner(...) end\n\
         return outer(1, 2, 3)",
        &[6],
    );
}
