//! Arithmetic, comparison, logic, and string expressions.

use crate::helpers::*;

#[test]
fn integer_arithmetic() {
    run_ints("return 1 + 2, 7 - 3, 6 * 7, 7 // 2, 7 % 3", &[3, 4, 42, 3, 1]);
}

#[test]
fn division_is_float() {
    let (l, n) = run("return 7 / 2");
    assert_float(&l, n, 0, 3.5);
}

#[test]
fn pow_is_float_and_right_assoc() {
    let (l, n) = run("return 2 ^ 10, 2 ^ 3 ^ 2");
    assert_float(&l, n, 0, 1024.0);
    assert_float(&l, n, 1, 512.0);
}

#[test]
fn negative_floor_div_and_mod() {
    run_ints("return -7 // 2, -7 % 2, 7 % -2", &[-4, 1, -1]);
}

#[test]
fn mixed_int_float_promotes() {
    let (l, n) = run("return 1 + 0.5");
    assert_float(&l, n, 0, 1.5);
}

#[test]
fn integer_overflow_wraps() {
    run_ints(
        "return math.maxinteger + 1 == math.mininteger and 1 or 0",
        &[1],
    );
}

#[test]
fn bitwise_operators() {
    run_ints(
        "return 6 & 3, 6 | 3, 6 ~ 3, ~0, 1 << 4, 256 >> 4",
        &[2, 7, 5, -1, 16, 16],
    );
}

#[test]
fn shift_by_64_or_more_is_zero() {
    run_ints("return 1 << 64, 1 << 100, -1 >> 64", &[0, 0, 0]);
}

#[test]
fn comparisons() {
    run_bool("return 1 < 2", true);
    run_bool("return 2 <= 2", true);
    run_bool("return 3 > 4", false);
    run_bool("return 'abc' < 'abd'", true);
    run_bool("return 1 == 1.0", true);
    run_bool("return 1 ~= 2", true);
    run_bool("return 0.5 < 1", true);
}

#[test]
fn equality_across_types_is_false() {
    run_bool("return 0 == '0'", false);
    run_bool("return nil == false", false);
}

#[test]
fn short_circuit_values() {
    let (l, n) = run("return 1 and 2, nil and 2, false or 'x', nil or false");
    assert_eq!(n, 4);
    assert_int(&l, n, 0, 2);
    assert_nil(&l, n, 1);
    assert_str(&l, n, 2, "x");
    assert_bool(&l, n, 3, false);
}

#[test]
fn short_circuit_skips_evaluation() {
    run_ints(
        "local called = 0\nlocal function f() called = called + 1 return true end\n\
         local _ = false and f()\nlocal _ = true or f()\nreturn called",
        &[0],
    );
}

#[test]
fn not_operator() {
    run_bool("return not nil", true);
    run_bool("return not 0", false);
    run_bool("return not not false", false);
}

#[test]
fn concat_strings_and_numbers() {
    run_str("return 'a' .. 'b' .. 'c'", "abc");
    run_str("return 'n=' .. 42", "n=42");
    run_str("return 1 .. 2", "12");
    run_str("return 'f=' .. 1.5", "f=1.5");
}

#[test]
fn string_number_coercion_in_arith() {
    run_ints("return '10' + 5, '0x10' + 0", &[15, 16]);
    let (l, n) = run("return '1.5' + 1");
    assert_float(&l, n, 0, 2.5);
}

#[test]
fn unary_minus_and_len() {
    run_ints("return -(3), #'hello', #({1,2,3})", &[-3, 5, 3]);
}

#[test]
fn comparison_result_is_boolean_value() {
    let (l, n) = run("local x = 3 > 2\nreturn x");
    assert_bool(&l, n, 0, true);
}

#[test]
fn chained_conditions_in_value_position() {
    run_ints("local a, b = 5, 10\nreturn (a < b and a or b)", &[5]);
}

#[test]
fn numeric_literal_forms() {
    let (l, n) = run("return 0x10, 1e2, .5, 0x1p4");
    assert_int(&l, n, 0, 16);
    assert_float(&l, n, 1, 100.0);
    assert_float(&l, n, 2, 0.5);
    assert_float(&l, n, 3, 16.0);
}

#[test]
fn float_integer_key_equality() {
    run_bool("return 1 == 1.0 and 2.0 == 2", true);
}

#[test]
fn nan_inequality() {
    run_bool("local nan = 0/0\nreturn nan == nan", false);
}
