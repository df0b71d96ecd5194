//! Arithmetic and bitwise primitives with Lua 5.3 semantics: wrapping
//! integer arithmetic, floor division and modulo, float fallbacks, and
//! string-to-number coercion.

use crate::coerce;
use crate::error::Error;
use lunet_core::string::Interner;
use lunet_core::value::Value;

/// Outcome of a primitive operation.
pub enum ArithResult {
    Ok(Value),
    /// Type mismatch: the caller should try a meta-method.
    NeedMeta,
    /// A hard error (division by zero, no integer representation).
    Error(Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
}

impl ArithOp {
    pub fn is_bitwise(self) -> bool {
        matches!(
            self,
            ArithOp::BAnd | ArithOp::BOr | ArithOp::BXor | ArithOp::Shl | ArithOp::Shr
        )
    }
}

/// Perform a binary arithmetic or bitwise operation on raw values.
pub fn arith(op: ArithOp, a: Value, b: Value, strings: &Interner) -> ArithResult {
    if op.is_bitwise() {
        return bitwise(op, a, b, strings);
    }

    // Div and Pow always produce floats.
    if !matches!(op, ArithOp::Div | ArithOp::Pow) {
        if let (Value::Integer(ia), Value::Integer(ib)) = (a, b) {
            return int_arith(op, ia, ib);
        }
        // String operands coerce; an integer result is kept when both
        // sides had integer form.
        if a.as_str_id().is_some() || b.as_str_id().is_some() {
            if let (Some(ia), Some(ib)) = (exact_int(a, strings), exact_int(b, strings)) {
                return int_arith(op, ia, ib);
            }
        }
    }

    match (
        coerce::to_number(a, strings),
        coerce::to_number(b, strings),
    ) {
        (Some(fa), Some(fb)) => ArithResult::Ok(Value::Float(float_arith(op, fa, fb))),
        _ => ArithResult::NeedMeta,
    }
}

/// Integer form of a value without going through float rounding: integers
/// directly, strings only when they parse as integers.
fn exact_int(v: Value, strings: &Interner) -> Option<i64> {
    match v {
        Value::Integer(i) => Some(i),
        Value::String(id) => match coerce::str_to_number(strings.get_bytes(id))? {
            Value::Integer(i) => Some(i),
            _ => None,
        },
        _ => None,
    }
}

fn int_arith(op: ArithOp, a: i64, b: i64) -> ArithResult {
    let v = match op {
        ArithOp::Add => a.wrapping_add(b),
        ArithOp::Sub => a.wrapping_sub(b),
        ArithOp::Mul => a.wrapping_mul(b),
        ArithOp::IDiv => {
            if b == 0 {
                return ArithResult::Error(Error::runtime("attempt to perform 'n//0'"));
            }
            floor_div(a, b)
        }
        ArithOp::Mod => {
            if b == 0 {
                return ArithResult::Error(Error::runtime("attempt to perform 'n%0'"));
            }
            floor_mod(a, b)
        }
        _ => unreachable!("float-only or bitwise op in int_arith"),
    };
    ArithResult::Ok(Value::Integer(v))
}

fn float_arith(op: ArithOp, a: f64, b: f64) -> f64 {
    match op {
        ArithOp::Add => a + b,
        ArithOp::Sub => a - b,
        ArithOp::Mul => a * b,
        ArithOp::Div => a / b,
        ArithOp::Pow => a.powf(b),
        // Float floor-div and mod by zero follow IEEE-754.
        ArithOp::IDiv => (a / b).floor(),
        ArithOp::Mod => float_mod(a, b),
        _ => unreachable!(),
    }
}

fn bitwise(op: ArithOp, a: Value, b: Value, strings: &Interner) -> ArithResult {
    let ia = match coerce::to_integer(a, strings) {
        Some(i) => i,
        None => {
            if a.is_number() {
                return ArithResult::Error(Error::runtime(
                    "number has no integer representation",
                ));
            }
            return ArithResult::NeedMeta;
        }
    };
    let ib = match coerce::to_integer(b, strings) {
        Some(i) => i,
        None => {
            if b.is_number() {
                return ArithResult::Error(Error::runtime(
                    "number has no integer representation",
                ));
            }
            return ArithResult::NeedMeta;
        }
    };
    let v = match op {
        ArithOp::BAnd => ia & ib,
        ArithOp::BOr => ia | ib,
        ArithOp::BXor => ia ^ ib,
        ArithOp::Shl => shift_left(ia, ib),
        ArithOp::Shr => shift_left(ia, ib.wrapping_neg()),
        _ => unreachable!(),
    };
    ArithResult::Ok(Value::Integer(v))
}

/// Floor division, rounding toward negative infinity.
fn floor_div(a: i64, b: i64) -> i64 {
    let d = a.wrapping_div(b);
    let r = a.wrapping_rem(b);
    if r != 0 && (r ^ b) < 0 {
        d - 1
    } else {
        d
    }
}

/// Modulo with the sign of the divisor.
fn floor_mod(a: i64, b: i64) -> i64 {
    let r = a.wrapping_rem(b);
    if r != 0 && (r ^ b) < 0 {
        r.wrapping_add(b)
    } else {
        r
    }
}

/// Float modulo: `a - floor(a/b)*b`, computed via the truncated remainder
/// to avoid precision loss.
fn float_mod(a: f64, b: f64) -> f64 {
    let r = a % b;
    if r != 0.0 && (r > 0.0) != (b > 0.0) {
        r + b
    } else {
        r
    }
}

/// Logical shift left; negative or oversized counts shift the other way
/// or produce zero, they never trap.
fn shift_left(a: i64, b: i64) -> i64 {
    if b <= -64 || b >= 64 {
        0
    } else if b >= 0 {
        ((a as u64) << b) as i64
    } else {
        ((a as u64) >> -b) as i64
    }
}

/// Unary minus.
pub fn unary_minus(v: Value, strings: &Interner) -> ArithResult {
    match v {
        Value::Integer(i) => ArithResult::Ok(Value::Integer(i.wrapping_neg())),
        Value::Float(f) => ArithResult::Ok(Value::Float(-f)),
        Value::String(_) => match coerce::to_number(v, strings) {
            Some(f) => ArithResult::Ok(Value::Float(-f)),
            None => ArithResult::NeedMeta,
        },
        _ => ArithResult::NeedMeta,
    }
}

/// Bitwise not.
pub fn bitwise_not(v: Value, strings: &Interner) -> ArithResult {
    match coerce::to_integer(v, strings) {
        Some(i) => ArithResult::Ok(Value::Integer(!i)),
        None => {
            if v.is_number() {
                ArithResult::Error(Error::runtime("number has no integer representation"))
            } else {
                ArithResult::NeedMeta
            }
        }
    }
}
