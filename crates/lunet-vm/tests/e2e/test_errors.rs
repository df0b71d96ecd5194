//! Errors, pcall/xpcall, and the recovery discipline.

use crate::helpers::*;
use lunet_vm::State;

#[test]
fn runtime_type_errors() {
    assert!(run_err("return nil + 1").contains("arithmetic on a nil value"));
    assert!(run_err("local t = nil\nreturn t.x").contains("index a nil value"));
    assert!(run_err("local f = 5\nf()").contains("call a number value"));
    assert!(run_err("return #5").contains("length of a number value"));
    assert!(run_err("return {} < {}").contains("compare two table values"));
    assert!(run_err("return 1 .. {}").contains("concatenate a table value"));
}

#[test]
fn error_messages_carry_position() {
    let msg = run_err("local x\n\nerror('here')");
    assert!(msg.contains("test:3: here"), "{msg}");
}

#[test]
fn error_with_level_zero_has_no_position() {
    run_str(
        "local ok, err = pcall(function() error('raw', 0) end)\nreturn err",
        "raw",
    );
}

#[test]
fn error_with_table_value() {
    run_ints(
        "local ok, err = pcall(function() error({code = 42}) end)\n\
         return (not ok) and err.code or -1",
        &[42],
    );
}

#[test]
fn pcall_returns_results_on_success() {
    run_ints(
        "local ok, a, b = pcall(function() return 1, 2 end)\n\
         return ok and 1 or 0, a, b",
        &[1, 1, 2],
    );
}

#[test]
fn pcall_catches_nested_error() {
    run_bool(
        "local function deep(n)\n\
           if n == 0 then error('bottom') end\n\
           return deep(n - 1)\n\
         end\n\
         local ok, err = pcall(deep, 10)\n\
         return not ok and err:sub(-6) == 'bottom'",
        true,
    );
}

#[test]
fn nested_pcall_inner_catches() {
    run_ints(
        "local outer_ok = pcall(function()\n\
           local inner_ok = pcall(error, 'x')\n\
           if inner_ok then error('inner should have failed') end\n\
         end)\n\
         return outer_ok and 1 or 0",
        &[1],
    );
}

#[test]
fn execution_continues_after_pcall() {
    run_ints(
        "pcall(error, 'ignored')\n\
         local s = 0\n\
         for i = 1, 5 do s = s + i end\n\
         return s",
        &[15],
    );
}

#[test]
fn xpcall_handler_transforms_error() {
    run_str(
        "local ok, msg = xpcall(function() error('oops') end, function(e)\n\
           return 'handled: ' .. e:sub(-4)\n\
         end)\n\
         return msg",
        "handled: oops",
    );
}

#[test]
fn xpcall_success_passes_results() {
    run_ints(
        "local ok, v = xpcall(function() return 7 end, function() return -1 end)\n\
         return ok and v or -1",
        &[7],
    );
}

#[test]
fn assert_passes_and_fails() {
    run_ints("return assert(42)", &[42]);
    let msg = run_err("assert(false)");
    assert!(msg.contains("assertion failed!"), "{msg}");
    let msg = run_err("assert(nil, 'custom reason')");
    assert!(msg.contains("custom reason"), "{msg}");
}

#[test]
fn protected_call_restores_stack_exactly() {
    // The host-level invariant: after a caught error the value and frame
    // stacks are exactly as before the call, minus the callable and its
    // arguments.
    let mut l = State::new();
    lunet_stdlib::open_all(&mut l).unwrap();
    l.push_integer(111);
    l.push_integer(222);
    let top_before = l.top();

    l.load(b"error('kaboom')", "=boom", "t").unwrap();
    let err = l.pcall(0, -1).unwrap_err();
    assert!(err.to_string().contains("kaboom"));
    assert!(err.trace.is_some(), "recovered errors carry a trace");

    assert_eq!(l.top(), top_before);
    assert_eq!(l.try_integer(-1), Some(222));
    assert_eq!(l.try_integer(-2), Some(111));

    // The state stays usable.
    let n = l.do_string("return 5 + 5", "=again").unwrap();
    assert_eq!(n, 1);
    assert_eq!(l.try_integer(-1), Some(10));
}

#[test]
fn protect_runs_host_closures() {
    let mut l = State::new();
    lunet_stdlib::open_all(&mut l).unwrap();
    let r = l.protect(|l| {
        l.push_integer(1);
        Ok(())
    });
    assert!(r.is_ok());
    assert_eq!(l.try_integer(-1), Some(1));

    let r = l.protect(|l| {
        l.push_integer(2);
        Err(lunet_vm::Error::runtime("host failure"))
    });
    let err = r.unwrap_err();
    assert!(err.to_string().contains("host failure"));
    // The pushed value was unwound.
    assert_eq!(l.try_integer(-1), Some(1));
}

#[test]
fn traces_mention_script_frames() {
    let mut l = State::new();
    lunet_stdlib::open_all(&mut l).unwrap();
    l.load(b"local function f() error('deep') end\nf()", "=traced", "t")
        .unwrap();
    let err = l.pcall(0, 0).unwrap_err();
    let trace = err.trace.expect("trace");
    assert!(trace.contains("=traced"), "{trace}");
}

#[test]
fn goto_into_scope_is_rejected() {
    let msg = run_err("goto skip\nlocal v = 1\n::skip::\nreturn v");
    assert!(msg.contains("scope of local"), "{msg}");
}

#[test]
fn lexer_and_parser_errors_are_tagged() {
    let mut l = State::new();
    let e = l.load(b"return 'unterminated", "=lex", "t").unwrap_err();
    assert_eq!(e.kind, lunet_vm::ErrorKind::Lexer);
    let e = l.load(b"if true do end", "=parse", "t").unwrap_err();
    assert_eq!(e.kind, lunet_vm::ErrorKind::Syntax);
}
