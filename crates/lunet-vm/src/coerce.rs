//! Numeric and string coercions.

use lunet_core::string::{Interner, StrId};
use lunet_core::value::Value;

/// Coerce a value to f64: floats pass through, integers widen, strings
/// parse in trimmed form.
pub fn to_number(v: Value, strings: &Interner) -> Option<f64> {
    match v {
        Value::Float(f) => Some(f),
        Value::Integer(i) => Some(i as f64),
        Value::String(id) => match str_to_number(strings.get_bytes(id))? {
            Value::Integer(i) => Some(i as f64),
            Value::Float(f) => Some(f),
            _ => None,
        },
        _ => None,
    }
}

/// Coerce a value to i64. Floats convert only when exactly representable;
/// strings parse then convert.
pub fn to_integer(v: Value, strings: &Interner) -> Option<i64> {
    match v {
        Value::Integer(i) => Some(i),
        Value::Float(f) => float_to_integer(f),
        Value::String(id) => match str_to_number(strings.get_bytes(id))? {
            Value::Integer(i) => Some(i),
            Value::Float(f) => float_to_integer(f),
            _ => None,
        },
        _ => None,
    }
}

/// Exact float-to-integer conversion.
pub fn float_to_integer(f: f64) -> Option<i64> {
    if !f.is_finite() || f.floor() != f {
        return None;
    }
    // i64::MIN is exactly representable; 2^63 (== -(i64::MIN as f64)) is
    // the first value that is not.
    const IMIN: f64 = i64::MIN as f64;
    const IMAX_P1: f64 = -(i64::MIN as f64);
    if !(IMIN..IMAX_P1).contains(&f) {
        return None;
    }
    Some(f as i64)
}

/// Parse a string as a Lua number: optional sign, decimal or hex, integer
/// tried first, then float. Returns an Integer or Float value.
pub fn str_to_number(bytes: &[u8]) -> Option<Value> {
    let s = std::str::from_utf8(bytes).ok()?.trim();
    if s.is_empty() {
        return None;
    }

    let (neg, body) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };

    if let Some(hex) = body
        .strip_prefix("0x")
        .or_else(|| body.strip_prefix("0X"))
    {
        if hex.is_empty() {
            return None;
        }
        if hex.contains(['.', 'p', 'P']) {
            let f = parse_hex_float(hex)?;
            return Some(Value::Float(if neg { -f } else { f }));
        }
        let mut val: u64 = 0;
        for c in hex.chars() {
            let d = c.to_digit(16)? as u64;
            // Large hex integers wrap modulo 2^64.
            val = val.wrapping_mul(16).wrapping_add(d);
        }
        let i = val as i64;
        return Some(Value::Integer(if neg { i.wrapping_neg() } else { i }));
    }

    if let Ok(i) = body.parse::<i64>() {
        return Some(Value::Integer(if neg { i.wrapping_neg() } else { i }));
    }

    // Rust accepts "inf"/"nan" spellings that Lua does not.
    let lower = body.to_ascii_lowercase();
    if lower.starts_with("inf") || lower.starts_with("nan") {
        return None;
    }
    if let Ok(f) = body.parse::<f64>() {
        return Some(Value::Float(if neg { -f } else { f }));
    }
    None
}

/// Parse the body of a hex float (after "0x"), like "1.8p1".
fn parse_hex_float(hex: &str) -> Option<f64> {
    let (mantissa_str, exp) = match hex.find(['p', 'P']) {
        Some(p) => (&hex[..p], hex[p + 1..].parse::<i64>().ok()?),
        None => (hex, 0),
    };
    let (int_part, frac_part) = match mantissa_str.find('.') {
        Some(dot) => (&mantissa_str[..dot], &mantissa_str[dot + 1..]),
        None => (mantissa_str, ""),
    };
    if int_part.is_empty() && frac_part.is_empty() {
        return None;
    }

    // Accumulate with a separate binary exponent so very long literals
    // cannot overflow.
    let mut value: f64 = 0.0;
    let mut bin_exp: i64 = exp;
    for c in int_part.chars() {
        value = value * 16.0 + c.to_digit(16)? as f64;
        if value > 1e18 {
            value /= (1u64 << 52) as f64;
            bin_exp += 52;
        }
    }
    for c in frac_part.chars() {
        value = value * 16.0 + c.to_digit(16)? as f64;
        bin_exp -= 4;
        if value > 1e18 {
            value /= (1u64 << 52) as f64;
            bin_exp += 52;
        }
    }

    while bin_exp > 1023 {
        value *= (2.0f64).powi(1023);
        bin_exp -= 1023;
    }
    while bin_exp < -1023 {
        value *= (2.0f64).powi(-1023);
        bin_exp += 1023;
    }
    Some(value * (2.0f64).powi(bin_exp as i32))
}

/// Convert a number to its string form for `..`, `tostring`, `print`.
pub fn number_to_str(v: Value) -> Option<String> {
    match v {
        Value::Integer(i) => Some(i.to_string()),
        Value::Float(f) => Some(format_float(f)),
        _ => None,
    }
}

/// String form of a value for concatenation: strings pass through,
/// numbers format, everything else is rejected.
pub fn to_str_for_concat(v: Value, strings: &mut Interner) -> Option<StrId> {
    match v {
        Value::String(id) => Some(id),
        Value::Integer(_) | Value::Float(_) => {
            let s = number_to_str(v).unwrap();
            Some(strings.intern(s.as_bytes()))
        }
        _ => None,
    }
}

/// Format a float the way Lua's `%.14g` does, always keeping a mark that
/// the number is a float ("1.0", "inf", "-nan").
pub fn format_float(f: f64) -> String {
    if f.is_nan() {
        return "-nan".to_string();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf" } else { "-inf" }.to_string();
    }
    if f == 0.0 {
        return if f.is_sign_negative() { "-0.0" } else { "0.0" }.to_string();
    }

    let abs = f.abs();
    let exp = abs.log10().floor() as i32;
    if (-4..14).contains(&exp) {
        let decimals = (13 - exp).max(0) as usize;
        let mut s = format!("{:.*}", decimals, f);
        if s.contains('.') {
            let trimmed = s.trim_end_matches('0');
            s = if trimmed.ends_with('.') {
                format!("{trimmed}0")
            } else {
                trimmed.to_string()
            };
        } else {
            s.push_str(".0");
        }
        s
    } else {
        let s = format!("{:.13e}", f);
        fix_exponent_format(&s)
    }
}

/// Rust prints `1.23e5`; C's %g prints `1.23e+05`.
fn fix_exponent_format(s: &str) -> String {
    let Some(e_pos) = s.find('e') else {
        return s.to_string();
    };
    let mantissa = s[..e_pos].trim_end_matches('0').trim_end_matches('.');
    let exp_str = &s[e_pos + 1..];
    let (sign, digits) = match exp_str.strip_prefix('-') {
        Some(rest) => ("-", rest),
        None => ("+", exp_str.strip_prefix('+').unwrap_or(exp_str)),
    };
    let exp_num: i32 = digits.parse().unwrap_or(0);
    format!("{mantissa}e{sign}{:02}", exp_num)
}
