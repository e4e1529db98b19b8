//! # ozboot - Bootstrap compiler for the Oz language
//!
//! ozboot compiles Oz functors into C++ source that, linked against the
//! Mozart virtual machine runtime, rebuilds the compiled program as VM
//! data structures (code areas, constant pools, abstractions).
//!
//! ## Pipeline
//!
//! Compilation is a fixed sequence of passes over a mutable [`Program`]:
//!
//! ```text
//! raw AST -> Namer -> DesugarFunctor -> DesugarClass -> Desugar ->
//! PatternMatcher -> ConstantFolding -> Unnester -> Flattener ->
//! CodeGen -> C++ emission
//! ```
//!
//! The front half resolves names and lowers sugar; the back half
//! normalizes the tree to flat operations, converts closures, and emits
//! opcodes into per-abstraction code areas.
//!
//! ## Quick Start
//!
//! Parse a statement and run it through the pipeline:
//!
//! ```rust
//! use std::collections::HashSet;
//! use ozboot::{parser, transform, Program};
//!
//! let source = "local X Y in X = 1 Y = X end";
//! let stmt = parser::parse_statement(source, "demo.oz", &HashSet::new()).unwrap();
//!
//! let mut program = Program::new(false);
//! program.set_code(stmt);
//! transform::compile(&mut program).unwrap();
//!
//! assert!(!program.has_errors());
//! assert!(program.top_level().code_area.is_some());
//! ```
//!
//! ## Modules
//!
//! - [`ast`]: the tree shared by all passes
//! - [`lexer`] / [`parser`]: the Oz frontend
//! - [`symbol`] / [`program`]: identity, scoping, and ownership
//! - [`builtins`]: boot-module descriptors and the builtin registry
//! - [`transform`]: the pass framework and the lowering passes
//! - [`codegen`]: register allocation, opcodes, and the C++ emitter
//! - [`assembly`]: the module / base-environment / linker shapes

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod assembly;
pub mod ast;
pub mod builtins;
pub mod codegen;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod program;
pub mod rewrite;
pub mod symbol;
pub mod transform;

// Re-exports for convenience
pub use ast::{Constant, Expression, Pattern, Pos, Statement};
pub use builtins::{Builtin, BuiltinRegistry, ModuleDescriptor};
pub use codegen::{CodeArea, CppEmitter, EmitMode, EmitOptions};
pub use error::{CompileError, LexError, ParseError};
pub use program::{AbsId, Abstraction, Program};
pub use symbol::{Symbol, SymbolId, SymbolStore};
pub use transform::{Pass, PassError, PassPipeline};
