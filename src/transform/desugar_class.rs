//! Class lowering.
//!
//! The bootstrap corpus is written in the kernel subset and contains no
//! class declarations, so this pass is a pass-through. It keeps its slot
//! in the pipeline so that the lowering order stays the documented one
//! when class support lands.

use crate::program::Program;
use crate::transform::{Pass, PassResult};

/// The class-lowering pass.
pub struct DesugarClass;

impl DesugarClass {
    /// Creates the pass.
    pub fn new() -> Self {
        Self
    }
}

impl Default for DesugarClass {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for DesugarClass {
    fn name(&self) -> &str {
        "desugar_class"
    }

    fn run(&mut self, _program: &mut Program) -> PassResult<()> {
        Ok(())
    }
}
