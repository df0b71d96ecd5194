//! Shared test plumbing: run a script, inspect the values it returned.

use lunet_vm::State;

/// Compile and run a chunk with the stdlib open. Returns the state and
/// how many values the chunk returned (left on top of the stack).
pub fn run(source: &str) -> (State, usize) {
    let mut l = State::new();
    lunet_stdlib::open_all(&mut l).expect("stdlib should open");
    let n = l
        .do_string(source, "=test")
        .unwrap_or_else(|e| panic!("script failed: {e}\n--- source ---\n{source}"));
    (l, n)
}

/// Run a chunk expecting a runtime error; returns its message.
pub fn run_err(source: &str) -> String {
    let mut l = State::new();
    lunet_stdlib::open_all(&mut l).expect("stdlib should open");
    match l.do_string(source, "=test") {
        Err(e) => e.to_string(),
        Ok(n) => panic!("expected error, got {n} results\n--- source ---\n{source}"),
    }
}

/// Index of result `i` (0-based) among the `n` returned values.
fn result_index(n: usize, i: usize) -> i64 {
    -(n as i64) + i as i64
}

pub fn assert_int(l: &State, n: usize, i: usize, expected: i64) {
    let idx = result_index(n, i);
    let got = l
        .try_integer(idx)
        .unwrap_or_else(|| panic!("result[{i}] is not an integer"));
    assert_eq!(got, expected, "result[{i}]");
}

pub fn assert_float(l: &State, n: usize, i: usize, expected: f64) {
    let idx = result_index(n, i);
    let got = l
        .try_float(idx)
        .unwrap_or_else(|| panic!("result[{i}] is not a number"));
    assert!(
        (got - expected).abs() < 1e-12,
        "result[{i}] = {got}, expected {expected}"
    );
}

pub fn assert_bool(l: &State, n: usize, i: usize, expected: bool) {
    assert_eq!(l.to_bool(result_index(n, i)), expected, "result[{i}]");
}

pub fn assert_str(l: &State, n: usize, i: usize, expected: &str) {
    let got = l.to_string_at(result_index(n, i));
    assert_eq!(got, expected, "result[{i}]");
}

pub fn assert_nil(l: &State, n: usize, i: usize) {
    assert!(l.is_nil(result_index(n, i)), "result[{i}] should be nil");
}

/// Run and compare all results against expected integers.
pub fn run_ints(source: &str, expected: &[i64]) {
    let (l, n) = run(source);
    assert_eq!(n, expected.len(), "result count for\n{source}");
    for (i, &e) in expected.iter().enumerate() {
        assert_int(&l, n, i, e);
    }
}

/// Run a chunk returning one string.
pub fn run_str(source: &str, expected: &str) {
    let (l, n) = run(source);
    assert_eq!(n, 1, "result count");
    assert_str(&l, n, 0, expected);
}

/// Run a chunk returning one boolean.
pub fn run_bool(source: &str, expected: bool) {
    let (l, n) = run(source);
    assert_eq!(n, 1, "result count");
    assert_bool(&l, n, 0, expected);
}
