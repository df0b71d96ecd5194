//! The table library.

use lunet_core::value::Type;
use lunet_vm::{CompareOp, Error, State};

pub fn open(l: &mut State) -> Result<(), Error> {
    l.new_table(0, 4);
    l.set_table_functions(
        -1,
        &[
            ("insert", table_insert),
            ("remove", table_remove),
            ("concat", table_concat),
            ("unpack", table_unpack),
            ("pack", table_pack),
            ("sort", table_sort),
            ("move", table_move),
        ],
    )?;
    l.set_global("table")?;
    Ok(())
}

fn check_table(l: &State, n: i64, fname: &str) -> Result<(), Error> {
    if l.type_of(n).ok() != Some(Type::Table) {
        return Err(Error::runtime(format!(
            "{}bad argument #{n} to '{fname}' (table expected, got {})",
            l.where_at(1),
            l.type_of(n).map(|t| t.name()).unwrap_or("no value")
        )));
    }
    Ok(())
}

/// table.insert(t, v) appends; table.insert(t, pos, v) shifts up.
fn table_insert(l: &mut State) -> Result<i32, Error> {
    check_table(l, 1, "insert")?;
    let len = l.length_raw(1)?;
    match l.top() {
        2 => {
            l.push_integer(len + 1);
            l.push_index(2)?;
            l.set_table_raw(1)?;
        }
        3 => {
            let pos = l.to_integer(2);
            if pos < 1 || pos > len + 1 {
                return Err(Error::runtime(format!(
                    "{}bad argument #2 to 'insert' (position out of bounds)",
                    l.where_at(1)
                )));
            }
            // Shift everything at or above pos one slot up.
            let mut i = len;
            while i >= pos {
                l.push_integer(i + 1);
                l.push_integer(i);
                l.get_table_raw(1)?;
                l.set_table_raw(1)?;
                i -= 1;
            }
            l.push_integer(pos);
            l.push_index(3)?;
            l.set_table_raw(1)?;
        }
        n => {
            return Err(Error::runtime(format!(
                "{}wrong number of arguments to 'insert' (got {n})",
                l.where_at(1)
            )));
        }
    }
    Ok(0)
}

/// table.remove(t [, pos]) removes and returns the element, shifting down.
fn table_remove(l: &mut State) -> Result<i32, Error> {
    check_table(l, 1, "remove")?;
    let len = l.length_raw(1)?;
    let pos = l.opt_integer(2, len);
    if len == 0 && l.top() < 2 {
        l.push_nil();
        return Ok(1);
    }
    if len > 0 && (pos < 1 || pos > len + 1) {
        return Err(Error::runtime(format!(
            "{}bad argument #2 to 'remove' (position out of bounds)",
            l.where_at(1)
        )));
    }
    // The removed value is the result.
    l.push_integer(pos);
    l.get_table_raw(1)?;
    let mut i = pos;
    while i < len {
        l.push_integer(i);
        l.push_integer(i + 1);
        l.get_table_raw(1)?;
        l.set_table_raw(1)?;
        i += 1;
    }
    if pos <= len {
        l.push_integer(len);
        l.push_nil();
        l.set_table_raw(1)?;
    }
    Ok(1)
}

fn table_concat(l: &mut State) -> Result<i32, Error> {
    check_table(l, 1, "concat")?;
    let sep = if l.top() >= 2 && !l.is_nil(2) {
        l.try_bytes(2).ok_or_else(|| {
            Error::runtime(format!(
                "{}bad argument #2 to 'concat' (string expected)",
                l.where_at(1)
            ))
        })?
    } else {
        Vec::new()
    };
    let i = l.opt_integer(3, 1);
    let j = l.opt_integer(4, l.length_raw(1)?);

    let mut out = Vec::new();
    for k in i..=j {
        l.push_integer(k);
        l.get_table_raw(1)?;
        let piece = l.try_bytes(-1).ok_or_else(|| {
            Error::runtime(format!(
                "{}invalid value (at index {k}) in table for 'concat'",
                l.where_at(1)
            ))
        })?;
        l.pop(1);
        if k > i {
            out.extend_from_slice(&sep);
        }
        out.extend_from_slice(&piece);
    }
    l.push_bytes(&out);
    Ok(1)
}

/// table.move(a1, f, e, t [, a2]): copy a1[f..e] to a2[t..], defaulting
/// a2 to a1. Overlapping same-table moves copy back to front when the
/// destination sits inside the source range. Returns a2.
fn table_move(l: &mut State) -> Result<i32, Error> {
    check_table(l, 1, "move")?;
    let f = l.to_integer(2);
    let e = l.to_integer(3);
    let t = l.to_integer(4);
    let a2: i64 = if l.top() >= 5 && !l.is_nil(5) {
        check_table(l, 5, "move")?;
        5
    } else {
        1
    };

    if f <= e {
        let copy_one = |l: &mut State, i: i64| -> Result<(), Error> {
            l.push_integer(t + (i - f));
            l.push_integer(i);
            l.get_table_raw(1)?;
            l.set_table_raw(a2)
        };
        let same_table = l.value_at(1)? == l.value_at(a2)?;
        if t <= f || !same_table {
            let mut i = f;
            while i <= e {
                copy_one(l, i)?;
                i += 1;
            }
        } else {
            let mut i = e;
            while i >= f {
                copy_one(l, i)?;
                i -= 1;
            }
        }
    }

    l.push_index(a2)?;
    Ok(1)
}

/// table.pack(...) gathers the arguments into a fresh sequence with an
/// `n` field holding the count.
fn table_pack(l: &mut State) -> Result<i32, Error> {
    let n = l.top();
    l.new_table(n, 1);
    let t = n as i64 + 1;
    for i in 1..=n {
        l.push_integer(i as i64);
        l.push_index(i as i64)?;
        l.set_table_raw(t)?;
    }
    l.push_string("n");
    l.push_integer(n as i64);
    l.set_table_raw(t)?;
    // Only the table goes back.
    Ok(1)
}

/// table.sort(t [, comp]) with binary insertion by repeated comparison.
/// The comparator (default `<`) is invoked through a normal call so
/// meta-methods and errors behave like any other call.
fn table_sort(l: &mut State) -> Result<i32, Error> {
    check_table(l, 1, "sort")?;
    let has_comp = l.top() >= 2 && !l.is_nil(2);
    let len = l.length_raw(1)?;

    // Pull out the sequence part.
    let mut i = 1;
    while i <= len {
        l.push_integer(i);
        l.get_table_raw(1)?;
        i += 1;
    }
    // Values now sit at slots (top-len+1)..top; insertion sort in place
    // on the stack, then write back.
    let base = l.top() as i64 - len; // slot before the first value
    for a in 2..=len {
        let mut b = a;
        while b > 1 {
            let less = if has_comp {
                l.push_index(2)?;
                l.push_index(base + b)?;
                l.push_index(base + b - 1)?;
                l.call(2, 1)?;
                let r = l.to_bool(-1);
                l.pop(1);
                r
            } else {
                l.push_index(base + b)?;
                l.push_index(base + b - 1)?;
                let r = l.compare(-2, -1, CompareOp::Lt)?;
                l.pop(2);
                r
            };
            if !less {
                break;
            }
            // Swap the two slots.
            l.push_index(base + b)?;
            l.push_index(base + b - 1)?;
            l.copy(base + b, -1)?;
            l.copy(base + b - 1, -2)?;
            l.pop(2);
            b -= 1;
        }
    }

    for k in (1..=len).rev() {
        // Top value is element k.
        l.push_integer(k);
        l.insert(-2)?;
        l.set_table_raw(1)?;
    }
    Ok(0)
}

fn table_unpack(l: &mut State) -> Result<i32, Error> {
    check_table(l, 1, "unpack")?;
    let i = l.opt_integer(2, 1);
    let j = l.opt_integer(3, l.length_raw(1)?);
    if i > j {
        return Ok(0);
    }
    let count = j - i + 1;
    if count > 1_000_000 {
        return Err(Error::runtime(format!(
            "{}too many results to unpack",
            l.where_at(1)
        )));
    }
    for k in i..=j {
        l.push_integer(k);
        l.get_table_raw(1)?;
    }
    Ok(count as i32)
}
