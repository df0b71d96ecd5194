//! Library functions: base, string, math, table.

use crate::helpers::*;

#[test]
fn type_names() {
    run_str("return type(nil)", "nil");
    run_str("return type(true)", "boolean");
    run_str("return type(1)", "number");
    run_str("return type(1.5)", "number");
    run_str("return type('s')", "string");
    run_str("return type({})", "table");
    run_str("return type(print)", "function");
}

#[test]
fn tostring_forms() {
    run_str("return tostring(nil)", "nil");
    run_str("return tostring(true)", "true");
    run_str("return tostring(42)", "42");
    run_str("return tostring(1.5)", "1.5");
    run_str("return tostring(1.0)", "1.0");
    run_str("return tostring('already')", "already");
}

#[test]
fn tonumber_forms() {
    run_ints("return tonumber('42'), tonumber('0xff'), tonumber('  7  ')", &[42, 255, 7]);
    run_bool("return tonumber('zzz') == nil", true);
    run_bool("return tonumber({}) == nil", true);
    let (l, n) = run("return tonumber('1.25')");
    assert_float(&l, n, 0, 1.25);
}

#[test]
fn tonumber_with_base() {
    run_ints(
        "return tonumber('ff', 16), tonumber('111', 2), tonumber('z', 36)",
        &[255, 7, 35],
    );
    run_bool("return tonumber('2', 2) == nil", true);
}

#[test]
fn globals_table_is_reachable() {
    run_ints("x = 5\nreturn _G.x, _G._G.x", &[5, 5]);
    run_str("return _VERSION", "Lua 5.3");
}

#[test]
fn string_len_and_sub() {
    run_ints("return string.len('hello'), ('hello'):len()", &[5, 5]);
    run_str("return ('hello world'):sub(1, 5)", "hello");
    run_str("return ('hello'):sub(-3)", "llo");
    run_str("return ('hello'):sub(2, -2)", "ell");
    run_str("return ('hello'):sub(3, 2)", "");
    run_str("return ('hello'):sub(1, 100)", "hello");
}

#[test]
fn string_case_and_reverse() {
    run_str("return ('mIxEd'):upper()", "MIXED");
    run_str("return ('mIxEd'):lower()", "mixed");
    run_str("return ('abc'):reverse()", "cba");
}

#[test]
fn string_rep() {
    run_str("return ('ab'):rep(3)", "ababab");
    run_str("return ('x'):rep(3, '-')", "x-x-x");
    run_str("return ('x'):rep(0)", "");
}

#[test]
fn string_byte_and_char() {
    run_ints("return ('A'):byte()", &[65]);
    run_ints("return ('abc'):byte(1, 3)", &[97, 98, 99]);
    run_str("return string.char(104, 105)", "hi");
}

#[test]
fn string_find_is_plain_text() {
    run_ints("return string.find('hello world', 'o')", &[5, 5]);
    run_ints("return string.find('hello world', 'o', 6)", &[8, 8]);
    run_ints("return string.find('hello', 'll')", &[3, 4]);
    run_ints("return ('abcabc'):find('bc', -3)", &[5, 6]);
    run_bool("return string.find('hello', 'z') == nil", true);
    // No pattern magic: the dot is just a dot.
    run_bool("return string.find('hello', 'h.l') == nil", true);
}

#[test]
fn string_dump_roundtrips_through_load() {
    run_ints(
        "local f = function() return 6 * 7 end\n\
         local blob = string.dump(f)\n\
         return load(blob)()",
        &[42],
    );
    run_bool("return pcall(string.dump, print) == false", true);
}

#[test]
fn string_prefix_suffix_helpers() {
    run_bool("return ('lunet.lua'):hasprefix('lunet')", true);
    run_bool("return ('lunet.lua'):hassuffix('.lua')", true);
    run_bool("return ('lunet.lua'):hasprefix('lua')", false);
    run_str("return ('lunet.lua'):trimprefix('lunet')", ".lua");
    run_str("return ('lunet.lua'):trimsuffix('.lua')", "lunet");
    run_str("return ('x'):trimprefix('y')", "x");
    run_str("return ('  padded\\t'):trim()", "padded");
    run_str("return ('  padded\\t'):trimspace()", "padded");
}

#[test]
fn string_count_and_replace() {
    run_ints("return ('banana'):count('an'), ('banana'):count('x')", &[2, 0]);
    run_ints("return ('ab'):count('')", &[3]);
    run_str("return ('banana'):replace('an', 'AN')", "bANANa");
    run_str("return ('banana'):replace('an', 'AN', 1)", "bANana");
    run_str("return ('ab'):replace('', '-')", "-a-b-");
}

#[test]
fn string_split_and_join() {
    run_str(
        "local parts = ('a,b,c'):split(',')\nreturn table.concat(parts, '|')",
        "a|b|c",
    );
    run_str(
        "local parts = ('a,b,c'):split(',', 2)\nreturn table.concat(parts, '|')",
        "a|b,c",
    );
    run_str(
        "local parts = ('a,b'):splitafter(',')\nreturn parts[1] .. '/' .. parts[2]",
        "a,/b",
    );
    run_str("return string.join({1, 'two', 3})", "1, two, 3");
    run_str("return string.join({'a', 'b'}, '-')", "a-b");
}

#[test]
fn string_title_and_unquote() {
    run_str("return ('hello lua world'):title()", "Hello Lua World");
    run_str("return ('\"a\\\\nb\"'):unquote()", "a\nb");
    // Not a quoted literal: unchanged.
    run_str("return ('plain'):unquote()", "plain");
}

#[test]
fn math_rounding() {
    run_ints("return math.floor(3.7), math.ceil(3.2), math.floor(-1.5)", &[3, 4, -2]);
    run_str("return math.type(math.floor(1.5))", "integer");
}

#[test]
fn math_abs_and_sqrt() {
    run_ints("return math.abs(-5), math.abs(5)", &[5, 5]);
    let (l, n) = run("return math.sqrt(2)");
    assert_float(&l, n, 0, std::f64::consts::SQRT_2);
}

#[test]
fn math_min_max() {
    run_ints("return math.max(3, 1, 4, 1, 5), math.min(3, 1, 4)", &[5, 1]);
}

#[test]
fn math_tointeger_and_type() {
    run_ints("return math.tointeger(3.0)", &[3]);
    run_bool("return math.tointeger(3.5) == nil", true);
    run_str("return math.type(1)", "integer");
    run_str("return math.type(1.0)", "float");
    run_bool("return math.type('1') == nil", true);
}

#[test]
fn math_constants() {
    run_bool("return math.huge > 1e308", true);
    run_bool("return math.maxinteger + 1 == math.mininteger", true);
    let (l, n) = run("return math.pi");
    assert_float(&l, n, 0, std::f64::consts::PI);
}

#[test]
fn math_modf() {
    let (l, n) = run("return math.modf(3.75)");
    assert_eq!(n, 2);
    assert_int(&l, n, 0, 3);
    assert_float(&l, n, 1, 0.75);
}

#[test]
fn table_insert_and_remove() {
    run_ints(
        "local t = {1, 2, 3}\n\
         table.insert(t, 4)\n\
         table.insert(t, 1, 0)\n\
         return #t, t[1], t[5]",
        &[5, 0, 4],
    );
    run_ints(
        "local t = {10, 20, 30}\n\
         local last = table.remove(t)\n\
         local first = table.remove(t, 1)\n\
         return last, first, #t, t[1]",
        &[30, 10, 1, 20],
    );
}

#[test]
fn table_concat() {
    run_str("return table.concat({'a', 'b', 'c'})", "abc");
    run_str("return table.concat({'a', 'b', 'c'}, ', ')", "a, b, c");
    run_str("return table.concat({1, 2, 3}, '-', 2, 3)", "2-3");
    run_str("return table.concat({})", "");
}

#[test]
fn table_unpack() {
    run_ints("return table.unpack({1, 2, 3})", &[1, 2, 3]);
    run_ints("return table.unpack({1, 2, 3, 4}, 2, 3)", &[2, 3]);
    run_ints(
        "local function sum(a, b, c) return a + b + c end\n\
         return sum(table.unpack({7, 8, 9}))",
        &[24],
    );
}

#[test]
fn string_format_directives() {
    run_str("return string.format('%d items', 3)", "3 items");
    run_str("return string.format('%s=%d', 'x', -7)", "x=-7");
    run_str("return string.format('%x %X %o', 255, 255, 8)", "ff FF 10");
    run_str("return string.format('%5d|%-5d|', 42, 42)", "   42|42   |");
    run_str("return string.format('%05d', 42)", "00042");
    run_str("return string.format('%.2f', 3.14159)", "3.14");
    run_str("return string.format('%g', 2.0)", "2");
    run_str("return string.format('100%%')", "100%");
    run_str("return string.format('%q', 'a\"b')", "\"a\\\"b\"");
    run_str("return string.format('%c%c', 104, 105)", "hi");
}

#[test]
fn math_transcendentals() {
    let (l, n) = run("return math.exp(0), math.log(math.exp(1)), math.sin(0), math.cos(0)");
    assert_float(&l, n, 0, 1.0);
    assert_float(&l, n, 1, 1.0);
    assert_float(&l, n, 2, 0.0);
    assert_float(&l, n, 3, 1.0);
    let (l, n) = run("return math.log(8, 2)");
    assert_float(&l, n, 0, 3.0);
}

#[test]
fn math_inverse_trig_and_angles() {
    let (l, n) = run(
        "return math.asin(1), math.acos(1), math.atan(0), math.atan(1, 1), \
         math.deg(math.pi), math.rad(180)",
    );
    assert_float(&l, n, 0, std::f64::consts::FRAC_PI_2);
    assert_float(&l, n, 1, 0.0);
    assert_float(&l, n, 2, 0.0);
    assert_float(&l, n, 3, std::f64::consts::FRAC_PI_4);
    assert_float(&l, n, 4, 180.0);
    assert_float(&l, n, 5, std::f64::consts::PI);
}

#[test]
fn math_ult_is_unsigned() {
    run_bool("return math.ult(1, 2)", true);
    run_bool("return math.ult(2, 1)", false);
    // -1 is the largest unsigned value.
    run_bool("return math.ult(-1, 1)", false);
    run_bool("return math.ult(1, -1)", true);
    run_bool("return math.ult(math.maxinteger, math.mininteger)", true);
}

#[test]
fn math_random_ranges() {
    run_bool(
        "for _ = 1, 100 do\n\
           local r = math.random()\n\
           if r < 0 or r >= 1 then return false end\n\
         end\n\
         return true",
        true,
    );
    run_bool(
        "for _ = 1, 100 do\n\
           local r = math.random(6)\n\
           if r < 1 or r > 6 or math.type(r) ~= 'integer' then return false end\n\
         end\n\
         return true",
        true,
    );
    run_bool(
        "for _ = 1, 100 do\n\
           local r = math.random(-5, 5)\n\
           if r < -5 or r > 5 then return false end\n\
         end\n\
         return true",
        true,
    );
    let msg = run_err("return math.random(5, 1)");
    assert!(msg.contains("interval is empty"), "{msg}");
}

#[test]
fn math_randomseed_pins_the_sequence() {
    run_bool(
        "math.randomseed(42)\n\
         local a = {math.random(1000), math.random(1000), math.random(1000)}\n\
         math.randomseed(42)\n\
         local b = {math.random(1000), math.random(1000), math.random(1000)}\n\
         return a[1] == b[1] and a[2] == b[2] and a[3] == b[3]",
        true,
    );
}

#[test]
fn table_move_plain_and_between_tables() {
    run_str(
        "local a = {1, 2, 3}\nlocal b = {0, 0, 0, 0}\n\
         table.move(a, 1, 3, 2, b)\n\
         return table.concat(b, ',')",
        "0,1,2,3",
    );
    run_str(
        "local a = {1, 2, 3, 4, 5}\n\
         local r = table.move(a, 2, 4, 1)\n\
         return table.concat(r, ',')",
        "2,3,4,4,5",
    );
}

#[test]
fn table_move_overlapping_shifts_safely() {
    // Destination inside the source range must copy back to front.
    run_str(
        "local a = {1, 2, 3, 4, 5}\n\
         table.move(a, 1, 3, 3)\n\
         return table.concat(a, ',')",
        "1,2,1,2,3",
    );
}

#[test]
fn table_move_empty_range_returns_destination() {
    run_ints(
        "local a = {1}\nlocal b = {9}\n\
         local r = table.move(a, 2, 1, 1, b)\n\
         return r[1]",
        &[9],
    );
}

#[test]
fn table_pack() {
    run_ints(
        "local p = table.pack(7, 8, 9)\nreturn p.n, p[1], p[3]",
        &[3, 7, 9],
    );
    run_ints("return table.pack().n", &[0]);
}

#[test]
fn table_sort_default_order() {
    run_str(
        "local t = {5, 2, 9, 1, 7}\ntable.sort(t)\nreturn table.concat(t, ',')",
        "1,2,5,7,9",
    );
    run_str(
        "local t = {'pear', 'apple', 'mango'}\ntable.sort(t)\nreturn table.concat(t, ',')",
        "apple,mango,pear",
    );
}

#[test]
fn table_sort_with_comparator() {
    run_str(
        "local t = {5, 2, 9, 1, 7}\n\
         table.sort(t, function(a, b) return a > b end)\n\
         return table.concat(t, ',')",
        "9,7,5,2,1",
    );
}

#[test]
fn load_compiles_strings() {
    run_ints("local f = load('return 6 * 7')\nreturn f()", &[42]);
    run_bool(
        "local f, err = load('syntax error here')\nreturn f == nil and err ~= nil",
        true,
    );
}

#[test]
fn load_with_custom_env() {
    run_ints(
        "local env = {value = 10}\n\
         local f = load('return value', '=env', 't', env)\n\
         return f()",
        &[10],
    );
}

#[test]
fn select_hash_and_positions() {
    run_ints("return select('#')", &[0]);
    run_ints("return select('#', 1, 2, 3)", &[3]);
    run_ints("return select(2, 'a', 10, 20)", &[10, 20]);
    run_ints("return (select(-1, 7, 8, 9))", &[9]);
}

#[test]
fn getiter_is_self_contained_and_composable() {
    run_ints(
        "local t = {10, 20, 30}\n\
         local it = getiter(t)\n\
         local sum = 0\n\
         local k, v = it()\n\
         while k ~= nil do\n\
           sum = sum + v\n\
           k, v = it()\n\
         end\n\
         return sum",
        &[60],
    );
    // Two iterators over one table advance independently.
    run_ints(
        "local t = {1, 2}\n\
         local a, b = getiter(t), getiter(t)\n\
         local _, av = a()\n\
         local _, bv = b()\n\
         local _, av2 = a()\n\
         return av, bv, av2",
        &[1, 1, 2],
    );
}

#[test]
fn nested_pairs_over_one_table() {
    run_ints(
        "local t = {1, 2, 3}\n\
         local count = 0\n\
         for _ in pairs(t) do\n\
           for _ in pairs(t) do count = count + 1 end\n\
         end\n\
         return count",
        &[9],
    );
}

#[test]
fn pairs_sees_mixed_parts() {
    run_ints(
        "local t = {1, 2, 3, x = 10, y = 20}\n\
         local count = 0\n\
         for _ in pairs(t) do count = count + 1 end\n\
         return count",
        &[5],
    );
}
