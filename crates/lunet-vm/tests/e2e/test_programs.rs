//! End-to-end programs exercising several subsystems at once.

use crate::helpers::*;

#[test]
fn sum_of_squares_via_ipairs() {
    run_ints(
        "return (function() local t={} for i=1,5 do t[i]=i*i end \
         local s=0 for _,v in ipairs(t) do s=s+v end return s end)()",
        &[55],
    );
}

#[test]
fn loop_counter_captured_per_iteration() {
    run_ints(
        "local a={}; for i=1,3 do a[i]=(function() return i end) end; \
         return a[1]()+a[2]()+a[3]()",
        &[6],
    );
}

#[test]
fn index_metamethod_builds_value_from_key() {
    run_str(
        "local t=setmetatable({},{__index=function(_,k) return k..\"!\" end}); return t.hello",
        "hello!",
    );
}

#[test]
fn pcall_catches_error_with_position() {
    run_str(
        "local ok,err = pcall(function() error(\"boom\") end); \
         return (not ok) and err:sub(-4)",
        "boom",
    );
}

#[test]
fn sixty_four_bit_integer_bitops() {
    run_ints(
        "return (1<<62) | 0, 0xFFFFFFFFFFFFFFFF | 0",
        &[4611686018427387904, -1],
    );
}

#[test]
fn length_of_table_with_hole() {
    run_bool("local t={1,2,3,nil,5}; return #t>=3", true);
}
