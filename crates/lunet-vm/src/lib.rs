//! lunet virtual machine: execution engine, binary chunk codec, and the
//! stack-indexed embedding API.
//!
//! The [`state::State`] is the sole public surface; everything else is
//! reachable only through it.
//!
//! ```ignore
//! let mut l = lunet_vm::state::State::new();
//! lunet_stdlib::open_all(&mut l)?;
//! let n = l.do_string("return 1 + 2", "=demo")?;
//! assert_eq!(l.to_integer(-1), 3);
//! ```

pub mod api;
pub mod arith;
pub mod chunk;
pub mod coerce;
pub mod compare;
pub mod dispatch;
pub mod error;
pub mod meta;
pub mod stack;
pub mod state;

pub use api::{CompareOp, FIRST_UPVAL, GLOBALS_INDEX, REGISTRY_INDEX};
pub use error::{Error, ErrorKind};
pub use state::{NativeFn, State};
