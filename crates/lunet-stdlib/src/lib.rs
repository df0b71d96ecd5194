//! lunet standard library: base, string, math, and table modules.
//!
//! Every function here goes through the public embedding API; nothing
//! reaches into the VM internals.

pub mod base;
pub mod math;
pub mod string_lib;
pub mod table_lib;

use lunet_vm::{Error, State};

/// Open every bundled library module.
pub fn open_all(l: &mut State) -> Result<(), Error> {
    base::open(l)?;
    string_lib::open(l)?;
    math::open(l)?;
    table_lib::open(l)?;
    Ok(())
}
