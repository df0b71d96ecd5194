//! Binary chunk round-trips through the live VM, and loader modes.

use crate::helpers::*;
use lunet_vm::State;

fn fresh_state() -> State {
    let mut l = State::new();
    lunet_stdlib::open_all(&mut l).unwrap();
    l
}

/// Dump a compiled chunk from one state and run the bytes in another.
fn roundtrip_run(source: &str) -> (State, usize) {
    let mut a = fresh_state();
    a.load(source.as_bytes(), "=rt", "t").unwrap();
    let blob = a.dump_function(-1, false).unwrap();

    let mut b = fresh_state();
    let before = b.top();
    b.load(&blob, "=rt", "b").unwrap();
    b.pcall(0, -1).unwrap_or_else(|e| panic!("binary chunk failed: {e}"));
    let n = b.top() - before;
    (b, n)
}

#[test]
fn simple_chunk_roundtrips() {
    let (l, n) = roundtrip_run("return 1 + 2");
    assert_eq!(n, 1);
    assert_int(&l, n, 0, 3);
}

#[test]
fn closures_and_upvalues_roundtrip() {
    let (l, n) = roundtrip_run(
        "local function make()\n\
           local c = 0\n\
           return function() c = c + 1 return c end\n\
         end\n\
         local f = make()\n\
         f() f()\n\
         return f()",
    );
    assert_int(&l, n, 0, 3);
}

#[test]
fn loops_and_tables_roundtrip() {
    let (l, n) = roundtrip_run(
        "local t = {}\n\
         for i = 1, 10 do t[i] = i * i end\n\
         local s = 0\n\
         for _, v in ipairs(t) do s = s + v end\n\
         return s",
    );
    assert_int(&l, n, 0, 385);
}

#[test]
fn string_constants_roundtrip() {
    let (l, n) = roundtrip_run("return ('hello'):upper() .. '!'");
    assert_str(&l, n, 0, "HELLO!");
}

#[test]
fn stripped_chunk_still_runs() {
    let mut a = fresh_state();
    a.load(b"return 40 + 2", "=strip", "t").unwrap();
    let blob = a.dump_function(-1, true).unwrap();

    let mut b = fresh_state();
    b.load(&blob, "=strip", "b").unwrap();
    b.pcall(0, 1).unwrap();
    assert_eq!(b.try_integer(-1), Some(42));
}

#[test]
fn binary_detected_regardless_of_mode() {
    let mut a = fresh_state();
    a.load(b"return 9", "=m", "t").unwrap();
    let blob = a.dump_function(-1, false).unwrap();

    // Mode says text, payload says binary: the payload wins.
    let mut b = fresh_state();
    b.load(&blob, "=m", "t").unwrap();
    b.pcall(0, 1).unwrap();
    assert_eq!(b.try_integer(-1), Some(9));
}

#[test]
fn text_rejected_in_binary_only_mode() {
    let mut l = fresh_state();
    let e = l.load(b"return 1", "=mode", "b").unwrap_err();
    assert!(e.to_string().contains("text chunk"), "{e}");
}

#[test]
fn dumping_native_function_fails() {
    let mut l = fresh_state();
    l.get_global("print").unwrap();
    let e = l.dump_function(-1, false).unwrap_err();
    assert_eq!(e.kind, lunet_vm::ErrorKind::BinDumper);
}

#[test]
fn corrupt_chunk_rejected() {
    let mut a = fresh_state();
    a.load(b"return 1", "=c", "t").unwrap();
    let mut blob = a.dump_function(-1, false).unwrap();
    // Mangle the float canary.
    let len = blob.len();
    blob[25] ^= 0xFF;
    assert!(len > 33);
    let mut b = fresh_state();
    assert!(b.load(&blob, "=c", "b").is_err());
}

#[test]
fn script_level_load_of_dumped_chunk() {
    // string.dump equivalent via the host API feeding script-level load.
    let mut l = fresh_state();
    l.load(b"return 123", "=lvl", "t").unwrap();
    let blob = l.dump_function(-1, false).unwrap();
    l.pop(1);
    l.push_bytes(&blob);
    l.set_global("blob").unwrap();
    let n = l.do_string("local f = load(blob)\nreturn f()", "=use").unwrap();
    assert_eq!(n, 1);
    assert_eq!(l.try_integer(-1), Some(123));
}
