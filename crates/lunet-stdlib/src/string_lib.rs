//! The string library (no pattern matching; that runtime is out of
//! scope). The module table doubles as the `__index` of the string
//! type's meta-table, so `("x"):len()` works.

use lunet_vm::{Error, State};

pub fn open(l: &mut State) -> Result<(), Error> {
    l.new_table(0, 8);
    l.set_table_functions(
        -1,
        &[
            ("len", str_len),
            ("sub", str_sub),
            ("upper", str_upper),
            ("lower", str_lower),
            ("rep", str_rep),
            ("reverse", str_reverse),
            ("byte", str_byte),
            ("char", str_char),
            ("format", str_format),
            ("find", str_find),
            ("dump", str_dump),
            ("count", str_count),
            ("hasprefix", str_hasprefix),
            ("hassuffix", str_hassuffix),
            ("join", str_join),
            ("replace", str_replace),
            ("split", str_split),
            ("splitafter", str_splitafter),
            ("title", str_title),
            ("trim", str_trimspace),
            ("trimspace", str_trimspace),
            ("trimprefix", str_trimprefix),
            ("trimsuffix", str_trimsuffix),
            ("unquote", str_unquote),
        ],
    )?;

    // String values share one meta-table whose __index is this module.
    l.new_table(0, 1); // ... strtab mt
    l.push_string("__index");
    l.push_index(-3)?; // ... strtab mt "__index" strtab
    l.set_table_raw(-3)?; // ... strtab mt
    l.push_string(""); // a string value to hang the type meta-table on
    l.insert(-2)?; // ... strtab "" mt
    l.set_metatable(-1)?; // ... strtab ""
    l.pop(1);

    l.set_global("string")?;
    Ok(())
}

fn check_str(l: &mut State, n: i64, fname: &str) -> Result<Vec<u8>, Error> {
    l.try_bytes(n).ok_or_else(|| {
        Error::runtime(format!(
            "{}bad argument #{n} to '{fname}' (string expected, got {})",
            l.where_at(1),
            l.type_of(n).map(|t| t.name()).unwrap_or("no value")
        ))
    })
}

/// Resolve a 1-based, possibly negative string position. No clamping;
/// callers clamp in the direction their operation needs.
fn str_pos(len: usize, pos: i64) -> i64 {
    if pos >= 0 {
        pos
    } else {
        len as i64 + pos + 1
    }
}

fn str_len(l: &mut State) -> Result<i32, Error> {
    let s = check_str(l, 1, "len")?;
    l.push_integer(s.len() as i64);
    Ok(1)
}

fn str_sub(l: &mut State) -> Result<i32, Error> {
    let s = check_str(l, 1, "sub")?;
    let len = s.len();
    let mut i = str_pos(len, l.opt_integer(2, 1));
    let mut j = str_pos(len, l.opt_integer(3, -1));
    if i < 1 {
        i = 1;
    }
    if j > len as i64 {
        j = len as i64;
    }
    if i > j {
        l.push_string("");
    } else {
        l.push_bytes(&s[(i - 1) as usize..j as usize]);
    }
    Ok(1)
}

fn str_upper(l: &mut State) -> Result<i32, Error> {
    let s = check_str(l, 1, "upper")?;
    let out: Vec<u8> = s.iter().map(|b| b.to_ascii_uppercase()).collect();
    l.push_bytes(&out);
    Ok(1)
}

fn str_lower(l: &mut State) -> Result<i32, Error> {
    let s = check_str(l, 1, "lower")?;
    let out: Vec<u8> = s.iter().map(|b| b.to_ascii_lowercase()).collect();
    l.push_bytes(&out);
    Ok(1)
}

fn str_rep(l: &mut State) -> Result<i32, Error> {
    let s = check_str(l, 1, "rep")?;
    let n = l.to_integer(2);
    let sep = if l.top() >= 3 {
        check_str(l, 3, "rep")?
    } else {
        Vec::new()
    };
    if n <= 0 {
        l.push_string("");
        return Ok(1);
    }
    let mut out = Vec::with_capacity(s.len() * n as usize);
    for i in 0..n {
        if i > 0 {
            out.extend_from_slice(&sep);
        }
        out.extend_from_slice(&s);
    }
    l.push_bytes(&out);
    Ok(1)
}

fn str_reverse(l: &mut State) -> Result<i32, Error> {
    let mut s = check_str(l, 1, "reverse")?;
    s.reverse();
    l.push_bytes(&s);
    Ok(1)
}

fn str_byte(l: &mut State) -> Result<i32, Error> {
    let s = check_str(l, 1, "byte")?;
    let len = s.len();
    let i = str_pos(len, l.opt_integer(2, 1)).max(1);
    let j = str_pos(len, l.opt_integer(3, i)).min(len as i64);
    let mut count = 0;
    for pos in i..=j {
        l.push_integer(s[(pos - 1) as usize] as i64);
        count += 1;
    }
    Ok(count)
}

fn str_char(l: &mut State) -> Result<i32, Error> {
    let n = l.top();
    let mut out = Vec::with_capacity(n);
    for i in 1..=n {
        let c = l.to_integer(i as i64);
        if !(0..=255).contains(&c) {
            return Err(Error::runtime(format!(
                "{}bad argument #{i} to 'char' (value out of range)",
                l.where_at(1)
            )));
        }
        out.push(c as u8);
    }
    l.push_bytes(&out);
    Ok(1)
}

/// string.format with the numeric and string directives: d/i, u, f, g, e,
/// x/X, o, c, s, q, and %%. Width and precision are honored for the
/// common cases; pattern-style directives do not exist here.
fn str_format(l: &mut State) -> Result<i32, Error> {
    let fmt = check_str(l, 1, "format")?;
    let mut out: Vec<u8> = Vec::with_capacity(fmt.len());
    let mut arg: i64 = 1;
    let mut iter = fmt.iter().copied().peekable();

    while let Some(ch) = iter.next() {
        if ch != b'%' {
            out.push(ch);
            continue;
        }
        if iter.peek() == Some(&b'%') {
            iter.next();
            out.push(b'%');
            continue;
        }

        // Flags, width, precision.
        let mut spec = String::from("%");
        while matches!(iter.peek(), Some(&(b'-' | b'+' | b' ' | b'#' | b'0'))) {
            spec.push(iter.next().unwrap() as char);
        }
        while iter.peek().is_some_and(|c| c.is_ascii_digit()) {
            spec.push(iter.next().unwrap() as char);
        }
        if iter.peek() == Some(&b'.') {
            spec.push(iter.next().unwrap() as char);
            while iter.peek().is_some_and(|c| c.is_ascii_digit()) {
                spec.push(iter.next().unwrap() as char);
            }
        }
        let conv = iter
            .next()
            .ok_or_else(|| Error::runtime(format!("{}invalid format string", l.where_at(1))))?;

        arg += 1;
        let piece = format_one(l, &spec, conv, arg)?;
        out.extend_from_slice(&piece);
    }

    l.push_bytes(&out);
    Ok(1)
}

fn format_one(l: &mut State, spec: &str, conv: u8, arg: i64) -> Result<Vec<u8>, Error> {
    let bad = |l: &State, what: &str| {
        Error::runtime(format!(
            "{}bad argument #{} to 'format' ({what} expected, got {})",
            l.where_at(1),
            arg - 1,
            l.type_of(arg).map(|t| t.name()).unwrap_or("no value")
        ))
    };

    // Parse "%[flags][width][.precision]" into pad controls.
    let body = &spec[1..];
    let (flags, rest) = body.split_at(body.find(|c: char| !"-+ #0".contains(c)).unwrap_or(body.len()));
    let left = flags.contains('-');
    let zero = flags.contains('0');
    let plus = flags.contains('+');
    let (width_str, prec_str) = match rest.find('.') {
        Some(dot) => (&rest[..dot], &rest[dot + 1..]),
        None => (rest, ""),
    };
    let width: usize = width_str.parse().unwrap_or(0);
    let precision: Option<usize> = if prec_str.is_empty() && !rest.contains('.') {
        None
    } else {
        Some(prec_str.parse().unwrap_or(0))
    };

    let raw = match conv {
        b'd' | b'i' => {
            let n = l.try_integer(arg).ok_or_else(|| bad(l, "number"))?;
            if plus && n >= 0 {
                format!("+{n}")
            } else {
                n.to_string()
            }
        }
        b'u' => {
            let n = l.try_integer(arg).ok_or_else(|| bad(l, "number"))?;
            (n as u64).to_string()
        }
        b'x' => {
            let n = l.try_integer(arg).ok_or_else(|| bad(l, "number"))?;
            format!("{:x}", n as u64)
        }
        b'X' => {
            let n = l.try_integer(arg).ok_or_else(|| bad(l, "number"))?;
            format!("{:X}", n as u64)
        }
        b'o' => {
            let n = l.try_integer(arg).ok_or_else(|| bad(l, "number"))?;
            format!("{:o}", n as u64)
        }
        b'c' => {
            let n = l.try_integer(arg).ok_or_else(|| bad(l, "number"))?;
            return Ok(vec![n as u8]);
        }
        b'f' | b'F' => {
            let f = l.try_float(arg).ok_or_else(|| bad(l, "number"))?;
            format!("{:.*}", precision.unwrap_or(6), f)
        }
        b'e' => {
            let f = l.try_float(arg).ok_or_else(|| bad(l, "number"))?;
            format!("{:.*e}", precision.unwrap_or(6), f)
        }
        b'g' | b'G' => {
            let f = l.try_float(arg).ok_or_else(|| bad(l, "number"))?;
            // %g drops a trailing ".0" where the float formatter keeps it.
            if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e15 {
                format!("{}", f as i64)
            } else {
                lunet_vm::coerce::format_float(f)
            }
        }
        b's' => {
            let v = l.value_at(arg)?;
            let mut s = l.display_value(v)?;
            if let Some(p) = precision {
                s.truncate(p);
            }
            s
        }
        b'q' => {
            let v = l.value_at(arg)?;
            let s = l.display_value(v)?;
            let mut quoted = String::with_capacity(s.len() + 2);
            quoted.push('"');
            for c in s.chars() {
                match c {
                    '"' => quoted.push_str("\\\""),
                    '\\' => quoted.push_str("\\\\"),
                    '\n' => quoted.push_str("\\n"),
                    '\r' => quoted.push_str("\\r"),
                    '\0' => quoted.push_str("\\0"),
                    other => quoted.push(other),
                }
            }
            quoted.push('"');
            quoted
        }
        other => {
            return Err(Error::runtime(format!(
                "{}invalid conversion '%{}' to 'format'",
                l.where_at(1),
                other as char
            )));
        }
    };

    // Apply width padding.
    let mut s = raw;
    if s.len() < width {
        let pad = width - s.len();
        if left {
            s.push_str(&" ".repeat(pad));
        } else if zero && matches!(conv, b'd' | b'i' | b'u' | b'x' | b'X' | b'o' | b'f' | b'e') {
            let insert_at = usize::from(s.starts_with('-') || s.starts_with('+'));
            s.insert_str(insert_at, &"0".repeat(pad));
        } else {
            s.insert_str(0, &" ".repeat(pad));
        }
    }
    Ok(s.into_bytes())
}

/// string.find without pattern matching: a plain substring search with an
/// optional (possibly negative) start position. Returns the 1-based start
/// and end of the match, or nothing.
fn str_find(l: &mut State) -> Result<i32, Error> {
    let s = check_str(l, 1, "find")?;
    let needle = check_str(l, 2, "find")?;
    let mut init = l.opt_integer(3, 1);
    if init < 0 {
        init = s.len() as i64 + init + 1;
    }
    if init < 1 {
        init = 1;
    }
    let from = (init - 1) as usize;
    if from > s.len() {
        return Ok(0);
    }
    match find_sub(&s[from..], &needle) {
        Some(idx) => {
            let start = from + idx;
            l.push_integer(start as i64 + 1);
            l.push_integer((start + needle.len()) as i64);
            Ok(2)
        }
        None => Ok(0),
    }
}

fn find_sub(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// string.dump: the binary chunk form of a Lua function.
fn str_dump(l: &mut State) -> Result<i32, Error> {
    let strip = l.to_bool(2);
    let blob = l.dump_function(1, strip)?;
    l.push_bytes(&blob);
    Ok(1)
}

/// Count non-overlapping occurrences; an empty separator counts the
/// gaps between bytes plus one.
fn str_count(l: &mut State) -> Result<i32, Error> {
    let s = check_str(l, 1, "count")?;
    let sep = check_str(l, 2, "count")?;
    if sep.is_empty() {
        l.push_integer(s.len() as i64 + 1);
        return Ok(1);
    }
    let mut n = 0i64;
    let mut at = 0;
    while let Some(idx) = find_sub(&s[at..], &sep) {
        n += 1;
        at += idx + sep.len();
    }
    l.push_integer(n);
    Ok(1)
}

fn str_hasprefix(l: &mut State) -> Result<i32, Error> {
    let s = check_str(l, 1, "hasprefix")?;
    let p = check_str(l, 2, "hasprefix")?;
    l.push_bool(s.starts_with(&p[..]));
    Ok(1)
}

fn str_hassuffix(l: &mut State) -> Result<i32, Error> {
    let s = check_str(l, 1, "hassuffix")?;
    let p = check_str(l, 2, "hassuffix")?;
    l.push_bool(s.ends_with(&p[..]));
    Ok(1)
}

/// string.join(t [, sep]): like table.concat, but stringifies each
/// element and defaults the separator to ", ".
fn str_join(l: &mut State) -> Result<i32, Error> {
    let len = l.length(1)?;
    let sep = if l.top() >= 2 && !l.is_nil(2) {
        check_str(l, 2, "join")?
    } else {
        b", ".to_vec()
    };
    let mut out = Vec::new();
    for i in 1..=len {
        l.push_integer(i);
        l.get_table(1)?;
        let v = l.value_at(-1)?;
        let piece = l.display_value(v)?;
        l.pop(1);
        if i > 1 {
            out.extend_from_slice(&sep);
        }
        out.extend_from_slice(piece.as_bytes());
    }
    l.push_bytes(&out);
    Ok(1)
}

/// string.replace(s, old, new [, n]): replace the first n occurrences
/// (all of them when n is negative). An empty `old` inserts `new`
/// between every byte, like the reference behavior.
fn str_replace(l: &mut State) -> Result<i32, Error> {
    let s = check_str(l, 1, "replace")?;
    let old = check_str(l, 2, "replace")?;
    let new = check_str(l, 3, "replace")?;
    let mut n = l.opt_integer(4, -1);

    let mut out = Vec::with_capacity(s.len());
    if old.is_empty() {
        for &b in &s {
            if n != 0 {
                out.extend_from_slice(&new);
                if n > 0 {
                    n -= 1;
                }
            }
            out.push(b);
        }
        if n != 0 {
            out.extend_from_slice(&new);
        }
        l.push_bytes(&out);
        return Ok(1);
    }

    let mut at = 0;
    while n != 0 {
        match find_sub(&s[at..], &old) {
            Some(idx) => {
                out.extend_from_slice(&s[at..at + idx]);
                out.extend_from_slice(&new);
                at += idx + old.len();
                if n > 0 {
                    n -= 1;
                }
            }
            None => break,
        }
    }
    out.extend_from_slice(&s[at..]);
    l.push_bytes(&out);
    Ok(1)
}

/// Shared splitter: pieces of `s` around `sep`, keeping the separator
/// attached when `keep_sep`, limited to `n` pieces when n > 0.
fn split_pieces(s: &[u8], sep: &[u8], n: i64, keep_sep: bool) -> Vec<Vec<u8>> {
    if n == 0 {
        return Vec::new();
    }
    if sep.is_empty() {
        // Degenerate separator: one piece per byte.
        let mut pieces: Vec<Vec<u8>> = s.iter().map(|&b| vec![b]).collect();
        if n > 0 && pieces.len() > n as usize {
            let tail = pieces.split_off(n as usize - 1).concat();
            pieces.push(tail);
        }
        return pieces;
    }
    let mut pieces = Vec::new();
    let mut at = 0;
    loop {
        if n > 0 && pieces.len() as i64 == n - 1 {
            break;
        }
        match find_sub(&s[at..], sep) {
            Some(idx) => {
                let end = at + idx + if keep_sep { sep.len() } else { 0 };
                pieces.push(s[at..end].to_vec());
                at += idx + sep.len();
            }
            None => break,
        }
    }
    pieces.push(s[at..].to_vec());
    pieces
}

fn push_pieces(l: &mut State, pieces: Vec<Vec<u8>>) -> Result<i32, Error> {
    l.new_table(pieces.len(), 0);
    for (i, piece) in pieces.into_iter().enumerate() {
        l.push_integer(i as i64 + 1);
        l.push_bytes(&piece);
        l.set_table_raw(-3)?;
    }
    Ok(1)
}

/// string.split(s, sep [, n]): the pieces of s around sep.
fn str_split(l: &mut State) -> Result<i32, Error> {
    let s = check_str(l, 1, "split")?;
    let sep = check_str(l, 2, "split")?;
    let n = l.opt_integer(3, -1);
    let pieces = split_pieces(&s, &sep, n, false);
    push_pieces(l, pieces)
}

/// string.splitafter: like split, but each piece keeps its separator.
fn str_splitafter(l: &mut State) -> Result<i32, Error> {
    let s = check_str(l, 1, "splitafter")?;
    let sep = check_str(l, 2, "splitafter")?;
    let n = l.opt_integer(3, -1);
    let pieces = split_pieces(&s, &sep, n, true);
    push_pieces(l, pieces)
}

/// Uppercase the first letter of each ASCII word.
fn str_title(l: &mut State) -> Result<i32, Error> {
    let s = check_str(l, 1, "title")?;
    let mut out = Vec::with_capacity(s.len());
    let mut at_word_start = true;
    for &b in &s {
        if b.is_ascii_alphabetic() {
            out.push(if at_word_start {
                b.to_ascii_uppercase()
            } else {
                b
            });
            at_word_start = false;
        } else {
            out.push(b);
            at_word_start = true;
        }
    }
    l.push_bytes(&out);
    Ok(1)
}

fn is_space(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r' | 0x0B | 0x0C)
}

fn str_trimspace(l: &mut State) -> Result<i32, Error> {
    let s = check_str(l, 1, "trim")?;
    let start = s.iter().position(|&b| !is_space(b)).unwrap_or(s.len());
    let end = s.iter().rposition(|&b| !is_space(b)).map_or(start, |e| e + 1);
    l.push_bytes(&s[start..end]);
    Ok(1)
}

fn str_trimprefix(l: &mut State) -> Result<i32, Error> {
    let s = check_str(l, 1, "trimprefix")?;
    let p = check_str(l, 2, "trimprefix")?;
    let out = s.strip_prefix(&p[..]).unwrap_or(&s);
    l.push_bytes(out);
    Ok(1)
}

fn str_trimsuffix(l: &mut State) -> Result<i32, Error> {
    let s = check_str(l, 1, "trimsuffix")?;
    let p = check_str(l, 2, "trimsuffix")?;
    let out = s.strip_suffix(&p[..]).unwrap_or(&s);
    l.push_bytes(out);
    Ok(1)
}

/// string.unquote: strip one level of double quoting, decoding the
/// common backslash escapes. A string that is not a well-formed quoted
/// literal comes back unchanged.
fn str_unquote(l: &mut State) -> Result<i32, Error> {
    let s = check_str(l, 1, "unquote")?;
    match unquote_bytes(&s) {
        Some(out) => l.push_bytes(&out),
        None => l.push_bytes(&s),
    }
    Ok(1)
}

fn unquote_bytes(s: &[u8]) -> Option<Vec<u8>> {
    if s.len() < 2 || s[0] != b'"' || s[s.len() - 1] != b'"' {
        return None;
    }
    let body = &s[1..s.len() - 1];
    let mut out = Vec::with_capacity(body.len());
    let mut iter = body.iter().copied();
    while let Some(b) = iter.next() {
        if b == b'"' {
            return None; // an unescaped quote means the literal ended early
        }
        if b != b'\\' {
            out.push(b);
            continue;
        }
        match iter.next()? {
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0C),
            b'v' => out.push(0x0B),
            b'\\' => out.push(b'\\'),
            b'"' => out.push(b'"'),
            b'\'' => out.push(b'\''),
            b'0' => out.push(0),
            b'x' => {
                let hi = hex_digit(iter.next()?)?;
                let lo = hex_digit(iter.next()?)?;
                out.push((hi << 4) | lo);
            }
            _ => return None,
        }
    }
    Some(out)
}

fn hex_digit(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}
