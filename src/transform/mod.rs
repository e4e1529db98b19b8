//! The AST transformation pipeline.
//!
//! Compilation is a fixed sequence of passes over the mutable
//! [`Program`]: each pass takes the current statement tree, rebuilds it,
//! and may mint symbols, allocate abstractions, and record errors.
//!
//! # Architecture
//!
//! - **Pass**: a single transformation over the program
//! - **PassPipeline**: chains passes; stops when a pass records errors
//! - [`standard_pipeline`]: the fixed compilation order
//!
//! User-level problems are accumulated on the program (a pass always runs
//! to completion so one run reports everything it can find); the pipeline
//! then stops before the next pass. A [`PassError`] is different: it
//! signals a broken invariant between passes and aborts compilation.

pub mod constant_folding;
pub mod desugar;
pub mod desugar_class;
pub mod desugar_functor;
pub mod flattener;
pub mod namer;
pub mod pattern_matcher;
pub mod unnester;

pub use constant_folding::ConstantFolding;
pub use desugar::Desugar;
pub use desugar_class::DesugarClass;
pub use desugar_functor::DesugarFunctor;
pub use flattener::Flattener;
pub use namer::Namer;
pub use pattern_matcher::PatternMatcher;
pub use unnester::Unnester;

use crate::program::Program;
use std::fmt;

/// An internal invariant violation inside a transformation pass.
#[derive(Debug, Clone)]
pub struct PassError {
    /// Error message
    pub message: String,
    /// Pass that produced the error
    pub pass_name: String,
}

impl PassError {
    /// Creates a new pass error.
    pub fn new(pass_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            pass_name: pass_name.into(),
        }
    }
}

impl fmt::Display for PassError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.pass_name, self.message)
    }
}

impl std::error::Error for PassError {}

/// Result type for transformation passes.
pub type PassResult<T> = Result<T, PassError>;

/// A transformation pass over the program.
pub trait Pass {
    /// Name of this pass for debugging and error messages.
    fn name(&self) -> &str;

    /// Runs the pass, transforming the program in place.
    fn run(&mut self, program: &mut Program) -> PassResult<()>;
}

/// A pipeline of passes to run in sequence.
pub struct PassPipeline {
    passes: Vec<Box<dyn Pass>>,
}

impl PassPipeline {
    /// Creates a new empty pipeline.
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Adds a pass to the pipeline.
    pub fn add<P: Pass + 'static>(&mut self, pass: P) -> &mut Self {
        self.passes.push(Box::new(pass));
        self
    }

    /// Runs the passes in order. A pass that records user-level errors on
    /// the program finishes, then the pipeline stops; the caller inspects
    /// `program.errors`.
    pub fn run(&mut self, program: &mut Program) -> PassResult<()> {
        for pass in &mut self.passes {
            pass.run(program)?;
            if program.has_errors() {
                break;
            }
        }
        Ok(())
    }
}

impl Default for PassPipeline {
    fn default() -> Self {
        Self::new()
    }
}

/// The fixed compilation order, from naming to code generation.
pub fn standard_pipeline() -> PassPipeline {
    let mut pipeline = PassPipeline::new();
    pipeline
        .add(Namer::new())
        .add(DesugarFunctor::new())
        .add(DesugarClass::new())
        .add(Desugar::new())
        .add(PatternMatcher::new())
        .add(ConstantFolding::new())
        .add(Unnester::new())
        .add(Flattener::new())
        .add(crate::codegen::CodeGen::new());
    pipeline
}

/// Runs the standard pipeline on an assembled program.
pub fn compile(program: &mut Program) -> PassResult<()> {
    standard_pipeline().run(program)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Pos, Statement};

    struct ReportingPass {
        fail_with_user_error: bool,
    }

    impl Pass for ReportingPass {
        fn name(&self) -> &str {
            "reporting"
        }

        fn run(&mut self, program: &mut Program) -> PassResult<()> {
            if self.fail_with_user_error {
                program.report(crate::error::CompileError::Unsupported {
                    message: "test error".to_string(),
                    pos: Pos::dummy(),
                });
            }
            Ok(())
        }
    }

    #[test]
    fn test_pipeline_runs_passes_in_order() {
        let mut program = Program::new(false);
        program.set_code(Statement::Skip { pos: Pos::dummy() });

        let mut pipeline = PassPipeline::new();
        pipeline.add(ReportingPass {
            fail_with_user_error: false,
        });
        assert!(pipeline.run(&mut program).is_ok());
        assert!(!program.has_errors());
    }

    #[test]
    fn test_pipeline_stops_after_erroring_pass() {
        struct MustNotRun;
        impl Pass for MustNotRun {
            fn name(&self) -> &str {
                "must_not_run"
            }
            fn run(&mut self, _program: &mut Program) -> PassResult<()> {
                panic!("pipeline kept running past an erroring pass");
            }
        }

        let mut program = Program::new(false);
        program.set_code(Statement::Skip { pos: Pos::dummy() });

        let mut pipeline = PassPipeline::new();
        pipeline
            .add(ReportingPass {
                fail_with_user_error: true,
            })
            .add(MustNotRun);
        assert!(pipeline.run(&mut program).is_ok());
        assert!(program.has_errors());
    }

    #[test]
    fn test_pass_error_display() {
        let err = PassError::new("flattener", "unexpected node");
        assert_eq!(err.to_string(), "[flattener] unexpected node");
    }
}
