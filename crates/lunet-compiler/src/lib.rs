//! lunet compiler: lexer, parser, and bytecode generator.
//!
//! The pipeline is `source -> tokens -> AST -> Proto`:
//!
//! ```ignore
//! let (proto, interner) = lunet_compiler::compile(b"return 1 + 2", "=chunk")?;
//! ```

pub mod ast;
pub mod codegen;
pub mod disasm;
pub mod lexer;
pub mod opcode;
pub mod parser;
pub mod proto;
pub mod token;

use lunet_core::string::Interner;
use proto::Proto;
use std::fmt;

/// A front-end failure: which stage rejected the chunk, plus line info.
#[derive(Clone, Debug)]
pub struct CompileError {
    pub stage: Stage,
    pub message: String,
    pub line: u32,
}

/// The front-end stage an error originated from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Lexer,
    Parser,
    CodeGen,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.line, self.message)
    }
}

impl std::error::Error for CompileError {}

/// Compile a source chunk to a prototype. The returned interner owns every
/// string the chunk references (names, literals, the source name).
pub fn compile(source: &[u8], name: &str) -> Result<(Proto, Interner), CompileError> {
    let (block, mut interner) = parser::parse(source)?;
    let proto = codegen::generate(&block, &mut interner, name)?;
    Ok((proto, interner))
}
