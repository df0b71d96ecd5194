//! The math library.

use lunet_core::value::Value;
use lunet_vm::{coerce, Error, State};
use std::cell::RefCell;

/// xoshiro256** state backing math.random, one generator per thread.
struct RanState {
    s: [u64; 4],
}

thread_local! {
    static RNG_STATE: RefCell<RanState> = const { RefCell::new(RanState { s: [0; 4] }) };
}

fn rotl(x: u64, n: u32) -> u64 {
    x.rotate_left(n)
}

/// xoshiro256** next value.
fn nextrand(state: &mut RanState) -> u64 {
    let s = &mut state.s;
    let res = rotl(s[1].wrapping_mul(5), 7).wrapping_mul(9);
    let t = s[1] << 17;
    s[2] ^= s[0];
    s[3] ^= s[1];
    s[1] ^= s[2];
    s[0] ^= s[3];
    s[2] ^= t;
    s[3] = rotl(s[3], 45);
    res
}

/// Re-seed and discard the first words so close seeds diverge.
fn setseed(state: &mut RanState, n1: u64, n2: u64) {
    state.s[0] = n1;
    state.s[1] = 0xff;
    state.s[2] = n2;
    state.s[3] = 0;
    for _ in 0..16 {
        nextrand(state);
    }
}

/// Random u64 to float in [0, 1): keep the top 53 bits.
fn i2d(x: u64) -> f64 {
    (x >> 11) as f64 * (1.0 / 9007199254740992.0)
}

/// Project a random value into [0, n] by masking to the smallest
/// all-ones cover of n and rejecting overshoots.
fn project(mut rv: u64, n: u64, state: &mut RanState) -> u64 {
    if n == 0 {
        return 0;
    }
    let mut lim = n;
    lim |= lim >> 1;
    lim |= lim >> 2;
    lim |= lim >> 4;
    lim |= lim >> 8;
    lim |= lim >> 16;
    lim |= lim >> 32;
    loop {
        let masked = rv & lim;
        if masked <= n {
            return masked;
        }
        rv = nextrand(state);
    }
}

pub fn open(l: &mut State) -> Result<(), Error> {
    l.new_table(0, 16);
    l.set_table_functions(
        -1,
        &[
            ("floor", math_floor),
            ("ceil", math_ceil),
            ("abs", math_abs),
            ("sqrt", math_sqrt),
            ("max", math_max),
            ("min", math_min),
            ("fmod", math_fmod),
            ("modf", math_modf),
            ("tointeger", math_tointeger),
            ("type", math_type),
            ("exp", math_exp),
            ("log", math_log),
            ("sin", math_sin),
            ("cos", math_cos),
            ("tan", math_tan),
            ("asin", math_asin),
            ("acos", math_acos),
            ("atan", math_atan),
            ("deg", math_deg),
            ("rad", math_rad),
            ("ult", math_ult),
            ("random", math_random),
            ("randomseed", math_randomseed),
        ],
    )?;

    // A fresh state starts from a clock seed, like the reference library;
    // math.randomseed(n) pins the sequence for reproducibility.
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x2545_f491_4f6c_dd1d);
    RNG_STATE.with(|cell| setseed(&mut cell.borrow_mut(), t, 0));

    // Constants.
    l.push_string("pi");
    l.push_float(std::f64::consts::PI);
    l.set_table_raw(-3)?;
    l.push_string("huge");
    l.push_float(f64::INFINITY);
    l.set_table_raw(-3)?;
    l.push_string("maxinteger");
    l.push_integer(i64::MAX);
    l.set_table_raw(-3)?;
    l.push_string("mininteger");
    l.push_integer(i64::MIN);
    l.set_table_raw(-3)?;

    l.set_global("math")?;
    Ok(())
}

fn num_error(l: &State, n: i64, fname: &str) -> Error {
    Error::runtime(format!(
        "{}bad argument #{n} to '{fname}' (number expected, got {})",
        l.where_at(1),
        l.type_of(n).map(|t| t.name()).unwrap_or("no value")
    ))
}

fn math_floor(l: &mut State) -> Result<i32, Error> {
    match l.value_at(1)? {
        Value::Integer(i) => l.push_integer(i),
        v => {
            let f = coerce::to_number(v, &l.strings)
                .ok_or_else(|| num_error(l, 1, "floor"))?
                .floor();
            match coerce::float_to_integer(f) {
                Some(i) => l.push_integer(i),
                None => l.push_float(f),
            }
        }
    }
    Ok(1)
}

fn math_ceil(l: &mut State) -> Result<i32, Error> {
    match l.value_at(1)? {
        Value::Integer(i) => l.push_integer(i),
        v => {
            let f = coerce::to_number(v, &l.strings)
                .ok_or_else(|| num_error(l, 1, "ceil"))?
                .ceil();
            match coerce::float_to_integer(f) {
                Some(i) => l.push_integer(i),
                None => l.push_float(f),
            }
        }
    }
    Ok(1)
}

fn math_abs(l: &mut State) -> Result<i32, Error> {
    match l.value_at(1)? {
        Value::Integer(i) => l.push_integer(i.wrapping_abs()),
        v => {
            let f = coerce::to_number(v, &l.strings).ok_or_else(|| num_error(l, 1, "abs"))?;
            l.push_float(f.abs());
        }
    }
    Ok(1)
}

fn math_sqrt(l: &mut State) -> Result<i32, Error> {
    let f = l.try_float(1).ok_or_else(|| num_error(l, 1, "sqrt"))?;
    l.push_float(f.sqrt());
    Ok(1)
}

fn minmax(l: &mut State, want_max: bool, fname: &str) -> Result<i32, Error> {
    let n = l.top();
    if n == 0 {
        return Err(num_error(l, 1, fname));
    }
    let mut best = l.value_at(1)?;
    if !best.is_number() {
        return Err(num_error(l, 1, fname));
    }
    for i in 2..=n {
        let v = l.value_at(i as i64)?;
        if !v.is_number() {
            return Err(num_error(l, i as i64, fname));
        }
        let swap = match (v, best) {
            (Value::Integer(a), Value::Integer(b)) => {
                if want_max {
                    a > b
                } else {
                    a < b
                }
            }
            _ => {
                let a = coerce::to_number(v, &l.strings).unwrap();
                let b = coerce::to_number(best, &l.strings).unwrap();
                if want_max {
                    a > b
                } else {
                    a < b
                }
            }
        };
        if swap {
            best = v;
        }
    }
    l.push_value(best);
    Ok(1)
}

fn math_max(l: &mut State) -> Result<i32, Error> {
    minmax(l, true, "max")
}

fn math_min(l: &mut State) -> Result<i32, Error> {
    minmax(l, false, "min")
}

fn math_fmod(l: &mut State) -> Result<i32, Error> {
    let a = l.try_float(1).ok_or_else(|| num_error(l, 1, "fmod"))?;
    let b = l.try_float(2).ok_or_else(|| num_error(l, 2, "fmod"))?;
    l.push_float(a % b);
    Ok(1)
}

fn math_modf(l: &mut State) -> Result<i32, Error> {
    let f = l.try_float(1).ok_or_else(|| num_error(l, 1, "modf"))?;
    let int_part = f.trunc();
    match coerce::float_to_integer(int_part) {
        Some(i) => l.push_integer(i),
        None => l.push_float(int_part),
    }
    l.push_float(f - int_part);
    Ok(2)
}

fn math_tointeger(l: &mut State) -> Result<i32, Error> {
    match l.value_at(1)? {
        Value::Integer(i) => l.push_integer(i),
        Value::Float(f) => match coerce::float_to_integer(f) {
            Some(i) => l.push_integer(i),
            None => l.push_nil(),
        },
        _ => l.push_nil(),
    }
    Ok(1)
}

fn math_type(l: &mut State) -> Result<i32, Error> {
    match l.value_at(1)? {
        Value::Integer(_) => l.push_string("integer"),
        Value::Float(_) => l.push_string("float"),
        _ => l.push_nil(),
    }
    Ok(1)
}

fn math_exp(l: &mut State) -> Result<i32, Error> {
    let f = l.try_float(1).ok_or_else(|| num_error(l, 1, "exp"))?;
    l.push_float(f.exp());
    Ok(1)
}

/// math.log(x [, base]); natural log by default.
fn math_log(l: &mut State) -> Result<i32, Error> {
    let x = l.try_float(1).ok_or_else(|| num_error(l, 1, "log"))?;
    if l.top() >= 2 && !l.is_nil(2) {
        let base = l.try_float(2).ok_or_else(|| num_error(l, 2, "log"))?;
        l.push_float(x.log(base));
    } else {
        l.push_float(x.ln());
    }
    Ok(1)
}

fn math_sin(l: &mut State) -> Result<i32, Error> {
    let f = l.try_float(1).ok_or_else(|| num_error(l, 1, "sin"))?;
    l.push_float(f.sin());
    Ok(1)
}

fn math_cos(l: &mut State) -> Result<i32, Error> {
    let f = l.try_float(1).ok_or_else(|| num_error(l, 1, "cos"))?;
    l.push_float(f.cos());
    Ok(1)
}

fn math_tan(l: &mut State) -> Result<i32, Error> {
    let f = l.try_float(1).ok_or_else(|| num_error(l, 1, "tan"))?;
    l.push_float(f.tan());
    Ok(1)
}

fn math_asin(l: &mut State) -> Result<i32, Error> {
    let f = l.try_float(1).ok_or_else(|| num_error(l, 1, "asin"))?;
    l.push_float(f.asin());
    Ok(1)
}

fn math_acos(l: &mut State) -> Result<i32, Error> {
    let f = l.try_float(1).ok_or_else(|| num_error(l, 1, "acos"))?;
    l.push_float(f.acos());
    Ok(1)
}

/// math.atan(y [, x]); the two-argument form is atan2.
fn math_atan(l: &mut State) -> Result<i32, Error> {
    let y = l.try_float(1).ok_or_else(|| num_error(l, 1, "atan"))?;
    let x = if l.top() >= 2 && !l.is_nil(2) {
        l.try_float(2).ok_or_else(|| num_error(l, 2, "atan"))?
    } else {
        1.0
    };
    l.push_float(y.atan2(x));
    Ok(1)
}

fn math_deg(l: &mut State) -> Result<i32, Error> {
    let f = l.try_float(1).ok_or_else(|| num_error(l, 1, "deg"))?;
    l.push_float(f.to_degrees());
    Ok(1)
}

fn math_rad(l: &mut State) -> Result<i32, Error> {
    let f = l.try_float(1).ok_or_else(|| num_error(l, 1, "rad"))?;
    l.push_float(f.to_radians());
    Ok(1)
}

fn int_arg(l: &State, n: i64, fname: &str) -> Result<i64, Error> {
    l.try_integer(n).ok_or_else(|| {
        Error::runtime(format!(
            "{}bad argument #{n} to '{fname}' (number has no integer representation)",
            l.where_at(1)
        ))
    })
}

/// math.ult: unsigned integer comparison.
fn math_ult(l: &mut State) -> Result<i32, Error> {
    let a = int_arg(l, 1, "ult")?;
    let b = int_arg(l, 2, "ult")?;
    l.push_bool((a as u64) < (b as u64));
    Ok(1)
}

/// math.random(): float in [0, 1); math.random(n): integer in [1, n];
/// math.random(m, n): integer in [m, n]; math.random(0): raw 64 bits.
fn math_random(l: &mut State) -> Result<i32, Error> {
    let nargs = l.top();
    if nargs > 2 {
        return Err(Error::runtime(format!(
            "{}wrong number of arguments to 'random'",
            l.where_at(1)
        )));
    }
    let (low, up) = match nargs {
        0 => {
            let rv = RNG_STATE.with(|cell| nextrand(&mut cell.borrow_mut()));
            l.push_float(i2d(rv));
            return Ok(1);
        }
        1 => {
            let n = int_arg(l, 1, "random")?;
            if n == 0 {
                let rv = RNG_STATE.with(|cell| nextrand(&mut cell.borrow_mut()));
                l.push_integer(rv as i64);
                return Ok(1);
            }
            (1, n)
        }
        _ => (int_arg(l, 1, "random")?, int_arg(l, 2, "random")?),
    };
    if low > up {
        return Err(Error::runtime(format!(
            "{}bad argument #{nargs} to 'random' (interval is empty)",
            l.where_at(1)
        )));
    }
    let range = (up as u64).wrapping_sub(low as u64);
    let r = RNG_STATE.with(|cell| {
        let mut state = cell.borrow_mut();
        let rv = nextrand(&mut state);
        project(rv, range, &mut state)
    });
    l.push_integer((low as u64).wrapping_add(r) as i64);
    Ok(1)
}

/// math.randomseed([n1 [, n2]]): re-seed, from the clock when called
/// bare. Returns the two seed words so a run can be replayed.
fn math_randomseed(l: &mut State) -> Result<i32, Error> {
    let (n1, n2) = if l.top() == 0 {
        let t = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let mix = RNG_STATE.with(|cell| nextrand(&mut cell.borrow_mut()));
        (t, mix)
    } else {
        let seed_word = |l: &State, n: i64| {
            l.try_integer(n)
                .map(|i| i as u64)
                .or_else(|| l.try_float(n).map(|f| f as i64 as u64))
                .unwrap_or(0)
        };
        let n1 = seed_word(l, 1);
        let n2 = if l.top() >= 2 { seed_word(l, 2) } else { 0 };
        (n1, n2)
    };
    RNG_STATE.with(|cell| setseed(&mut cell.borrow_mut(), n1, n2));
    l.push_integer(n1 as i64);
    l.push_integer(n2 as i64);
    Ok(2)
}
