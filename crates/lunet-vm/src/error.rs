//! The error type shared by the VM and its embedding API.
//!
//! Every failure the runtime can surface is one `Error` value: a kind tag,
//! an optional message, an optional carried Lua value (for `error(v)` with
//! a non-string), an optional cause, and an optional textual stack trace
//! attached at the recovery boundary.

use lunet_compiler::{CompileError, Stage};
use lunet_core::value::Value;
use thiserror::Error as ThisError;

/// What produced an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Anything that does not fit another category.
    Undefined,
    /// An invariant break inside the VM itself. Never recoverable.
    Internal,
    Lexer,
    Syntax,
    Runtime,
    BinLoader,
    BinDumper,
    /// A foreign error wrapped into the standard type.
    Wrapped,
    /// A non-error panic value wrapped into the standard type.
    Opaque,
}

#[derive(Clone, Debug, ThisError)]
#[error("{}", render(.kind, .message, .cause, .trace))]
pub struct Error {
    pub kind: ErrorKind,
    pub message: Option<String>,
    /// The Lua value raised by `error(v)` when it was not a string.
    pub value: Option<Value>,
    pub cause: Option<Box<Error>>,
    pub trace: Option<String>,
}

fn render(
    kind: &ErrorKind,
    message: &Option<String>,
    cause: &Option<Box<Error>>,
    trace: &Option<String>,
) -> String {
    let mut msg = match message {
        Some(m) => m.clone(),
        None => "unspecified error".to_string(),
    };
    if *kind == ErrorKind::Internal {
        msg = format!("major internal error, this indicates a VM bug! {msg}");
    }
    if let Some(c) = cause {
        msg = format!("{msg}: {c}");
    }
    if let Some(t) = trace {
        msg = format!("{msg}\n  stack trace:{t}");
    }
    msg
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Error {
            kind,
            message: Some(message.into()),
            value: None,
            cause: None,
            trace: None,
        }
    }

    /// A runtime error, the common case inside the dispatch loop.
    pub fn runtime(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Runtime, message)
    }

    /// An error carrying a raised Lua value.
    pub fn with_value(value: Value, message: Option<String>) -> Self {
        Error {
            kind: ErrorKind::Runtime,
            message,
            value: Some(value),
            cause: None,
            trace: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::new(ErrorKind::Internal, message)
    }

    /// Wrap a foreign error.
    pub fn wrapped(message: impl Into<String>, cause: Error) -> Self {
        Error {
            kind: ErrorKind::Wrapped,
            message: Some(message.into()),
            value: None,
            cause: Some(Box::new(cause)),
            trace: None,
        }
    }

    /// Whether the condition is unrecoverable (only `Internal` is).
    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::Internal
    }
}

impl From<CompileError> for Error {
    fn from(e: CompileError) -> Self {
        let kind = match e.stage {
            Stage::Lexer => ErrorKind::Lexer,
            Stage::Parser | Stage::CodeGen => ErrorKind::Syntax,
        };
        Error::new(kind, format!("{}: {}", e.line, e.message))
    }
}
