//! Compiler library for the Slate programming language.
//!
//! Compilation is a single pass: the parser pulls tokens lazily from the
//! scanner, resolves names and types against the scope stack, and emits
//! target-machine statements through the code generator as it goes. On a
//! clean parse the statement buffer is serialized into a C translation unit
//! which executes against the runtime sources in `runtime/`.

pub mod codegen;
pub mod diagnostics;
pub mod lexer;
pub mod parser;
pub mod symbols;
