//! Host-side tests of the embedding API: stack indexing, typed reads,
//! table operations, iteration, and meta-tables.

use lunet_core::value::{SubType, Type};
use lunet_vm::{Error, State, GLOBALS_INDEX, REGISTRY_INDEX};

#[test]
fn push_and_read_back() {
    let mut l = State::new();
    l.push_integer(42);
    l.push_float(1.5);
    l.push_string("hi");
    l.push_bool(true);
    l.push_nil();

    assert_eq!(l.top(), 5);
    assert_eq!(l.try_integer(1), Some(42));
    assert_eq!(l.try_float(2), Some(1.5));
    assert_eq!(l.to_string_at(3), "hi");
    assert!(l.to_bool(4));
    assert!(l.is_nil(5));

    // Negative indices mirror positives.
    assert!(l.is_nil(-1));
    assert_eq!(l.try_integer(-5), Some(42));
}

#[test]
fn type_queries() {
    let mut l = State::new();
    l.push_integer(1);
    l.push_float(1.0);
    l.push_string("s");
    assert_eq!(l.type_of(1).unwrap(), Type::Number);
    assert_eq!(l.sub_type_of(1).unwrap(), SubType::Integer);
    assert_eq!(l.sub_type_of(2).unwrap(), SubType::Float);
    assert_eq!(l.type_of(3).unwrap(), Type::String);
    assert_eq!(l.sub_type_of(3).unwrap(), SubType::None);
}

#[test]
fn coercing_reads() {
    let mut l = State::new();
    l.push_string("42");
    l.push_string("1.5");
    l.push_integer(3);
    assert_eq!(l.try_integer(1), Some(42));
    assert_eq!(l.try_float(2), Some(1.5));
    // Numbers read back as strings too.
    assert_eq!(l.to_string_at(3), "3");
    // Defaults.
    l.push_nil();
    assert_eq!(l.opt_integer(4, 9), 9);
    assert_eq!(l.opt_float(4, 2.5), 2.5);
    assert_eq!(l.opt_string(4, "d"), "d");
}

#[test]
fn pop_insert_copy() {
    let mut l = State::new();
    l.push_integer(1);
    l.push_integer(2);
    l.push_integer(3);
    l.pop(1);
    assert_eq!(l.top(), 2);

    // Insert the top below the previous value.
    l.push_integer(99);
    l.insert(1).unwrap();
    assert_eq!(l.try_integer(1), Some(99));
    assert_eq!(l.try_integer(2), Some(1));
    assert_eq!(l.try_integer(3), Some(2));

    l.copy(1, 3).unwrap();
    assert_eq!(l.try_integer(1), Some(2));
}

#[test]
fn abs_index_conversion() {
    let mut l = State::new();
    l.push_integer(10);
    l.push_integer(20);
    assert_eq!(l.abs_index(-1).unwrap(), 2);
    assert_eq!(l.abs_index(-2).unwrap(), 1);
    assert_eq!(l.abs_index(1).unwrap(), 1);
    // Sentinels pass through untouched.
    assert_eq!(l.abs_index(REGISTRY_INDEX).unwrap(), REGISTRY_INDEX);
}

#[test]
fn index_zero_is_invalid() {
    let l = State::new();
    assert!(l.value_at(0).is_err());
}

#[test]
fn registry_and_globals_sentinels() {
    let mut l = State::new();
    assert_eq!(l.type_of(REGISTRY_INDEX).unwrap(), Type::Table);
    assert_eq!(l.type_of(GLOBALS_INDEX).unwrap(), Type::Table);

    // A value stored through the globals sentinel is a real global.
    l.push_string("key");
    l.push_integer(7);
    l.set_table_raw(GLOBALS_INDEX).unwrap();
    l.get_global("key").unwrap();
    assert_eq!(l.try_integer(-1), Some(7));
}

#[test]
fn table_get_set_with_and_without_meta() {
    let mut l = State::new();
    l.new_table(0, 0);

    l.push_string("k");
    l.push_integer(5);
    l.set_table_raw(1).unwrap();

    l.push_string("k");
    l.get_table_raw(1).unwrap();
    assert_eq!(l.try_integer(-1), Some(5));
    l.pop(1);

    // A missing key reads nil raw.
    l.push_string("missing");
    l.get_table_raw(1).unwrap();
    assert!(l.is_nil(-1));
    l.pop(1);

    assert_eq!(l.length_raw(1).unwrap(), 0);
    l.push_integer(1);
    l.push_string("first");
    l.set_table(1).unwrap();
    assert_eq!(l.length(1).unwrap(), 1);
}

#[test]
fn set_table_functions_bulk() {
    fn one(l: &mut State) -> Result<i32, Error> {
        l.push_integer(1);
        Ok(1)
    }
    fn two(l: &mut State) -> Result<i32, Error> {
        l.push_integer(2);
        Ok(1)
    }

    let mut l = State::new();
    l.new_table(0, 2);
    l.set_table_functions(1, &[("one", one), ("two", two)]).unwrap();

    l.push_string("two");
    l.get_table_raw(1).unwrap();
    assert_eq!(l.type_of(-1).unwrap(), Type::Function);
    l.call(0, 1).unwrap();
    assert_eq!(l.try_integer(-1), Some(2));
}

#[test]
fn legacy_next_iteration() {
    let mut l = State::new();
    l.new_table(4, 0);
    for i in 1..=4 {
        l.push_integer(i);
        l.push_integer(i * 10);
        l.set_table_raw(1).unwrap();
    }

    let mut sum = 0;
    l.push_nil();
    while l.next(1).unwrap() {
        sum += l.to_integer(-1);
        l.pop(1); // keep the key for the next round
    }
    assert_eq!(sum, 100);
    assert_eq!(l.top(), 1); // only the table remains
}

#[test]
fn cursor_iteration_is_reentrant() {
    let mut l = State::new();
    l.new_table(3, 0);
    for i in 1..=3 {
        l.push_integer(i);
        l.push_integer(i);
        l.set_table_raw(1).unwrap();
    }

    let mut outer = l.table_cursor(1).unwrap();
    let mut pairs_seen = 0;
    while l.cursor_next(1, &mut outer).unwrap() {
        l.pop(2);
        // A second cursor over the same table does not disturb the first.
        let mut inner = l.table_cursor(1).unwrap();
        while l.cursor_next(1, &mut inner).unwrap() {
            l.pop(2);
            pairs_seen += 1;
        }
    }
    assert_eq!(pairs_seen, 9);
}

#[test]
fn for_each_with_break() {
    let mut l = State::new();
    l.new_table(5, 0);
    for i in 1..=5 {
        l.push_integer(i);
        l.push_integer(i);
        l.set_table_raw(1).unwrap();
    }

    let mut visited = 0;
    l.for_each(1, |l| {
        visited += l.to_integer(-1);
        Ok(visited < 6) // break once the sum reaches 6
    })
    .unwrap();
    assert_eq!(visited, 6);
    assert_eq!(l.top(), 1);
}

#[test]
fn metatable_roundtrip_via_api() {
    let mut l = State::new();
    l.new_table(0, 0); // the value
    l.new_table(0, 1); // its meta-table
    l.push_string("__marker");
    l.push_integer(9);
    l.set_table_raw(2).unwrap();

    // Install: set_metatable pops the meta-table.
    l.set_metatable(1).unwrap();
    assert!(l.get_metatable(1).unwrap());
    l.pop(1);
    assert!(l.get_meta_field(1, "__marker").unwrap());
    assert_eq!(l.try_integer(-1), Some(9));
}

#[test]
fn call_native_through_stack() {
    fn add(l: &mut State) -> Result<i32, Error> {
        let a = l.to_integer(1);
        let b = l.to_integer(2);
        l.push_integer(a + b);
        Ok(1)
    }

    let mut l = State::new();
    l.push_native(add, "add");
    l.push_integer(30);
    l.push_integer(12);
    l.call(2, 1).unwrap();
    assert_eq!(l.top(), 1);
    assert_eq!(l.try_integer(-1), Some(42));
}

#[test]
fn native_closure_upvalues() {
    fn bump(l: &mut State) -> Result<i32, Error> {
        // Upvalue 0 is the environment; 1 is ours.
        let n = l
            .value_at(lunet_vm::FIRST_UPVAL - 1)
            .map(|v| v.as_integer().unwrap_or(0))?;
        l.push_integer(n + 1);
        Ok(1)
    }

    let mut l = State::new();
    l.push_integer(41);
    l.push_closure(bump, "bump", 1).unwrap();
    l.call(0, 1).unwrap();
    assert_eq!(l.try_integer(-1), Some(42));
}

#[test]
fn call_non_function_errors() {
    let mut l = State::new();
    l.push_integer(1);
    let e = l.pcall(0, 0).unwrap_err();
    assert!(e.to_string().contains("call a number value"));
}

#[test]
fn separate_states_are_independent() {
    let mut a = State::new();
    let mut b = State::new();
    a.push_string("only-in-a");
    a.set_global("marker").unwrap();
    b.get_global("marker").unwrap();
    assert!(b.is_nil(-1));
}
