//! The program aggregate and the abstraction arena.
//!
//! A [`Program`] is the mutable state threaded through the whole pipeline:
//! the abstraction arena, the symbol store, the builtin registry, the list
//! of base-environment declarations, and the accumulated compile errors.
//!
//! Abstractions and symbols reference each other cyclically (a symbol names
//! its owner, an abstraction lists its symbols). The cycle is broken by
//! keeping abstractions in an arena addressed by [`AbsId`] and storing ids
//! on both sides.

use crate::ast::{Pos, Statement};
use crate::builtins::BuiltinRegistry;
use crate::codegen::CodeArea;
use crate::error::CompileError;
use crate::symbol::{SymbolId, SymbolStore};

/// Index of an abstraction in the program's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AbsId(u32);

impl AbsId {
    /// The arena slot of the top-level abstraction.
    pub fn top_level() -> Self {
        AbsId(0)
    }

    /// The raw arena index.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl std::fmt::Display for AbsId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "A{}", self.0)
    }
}

/// A compiled procedure body with its own register frame and code area.
#[derive(Debug)]
pub struct Abstraction {
    /// Arena slot of this abstraction
    pub id: AbsId,
    /// Display name, used for diagnostics and generated identifiers
    pub name: String,
    /// Parameters, in declaration order (Y registers)
    pub formals: Vec<SymbolId>,
    /// Local variables, in first-declaration order (Y registers)
    pub locals: Vec<SymbolId>,
    /// Captured variables, in first-reference order (G registers)
    pub globals: Vec<SymbolId>,
    /// The flat body, installed by the flattener
    pub body: Statement,
    /// The generated code area, installed by codegen
    pub code_area: Option<CodeArea>,
}

impl Abstraction {
    fn new(id: AbsId, name: String) -> Self {
        Self {
            id,
            name,
            formals: Vec::new(),
            locals: Vec::new(),
            globals: Vec::new(),
            body: Statement::Skip { pos: Pos::dummy() },
            code_area: None,
        }
    }

    /// The number of parameters.
    pub fn arity(&self) -> usize {
        self.formals.len()
    }

    /// Records a local variable once, preserving first-declaration order.
    pub fn add_local(&mut self, symbol: SymbolId) {
        if !self.locals.contains(&symbol) {
            self.locals.push(symbol);
        }
    }

    /// Records a captured variable once, preserving first-reference order,
    /// and returns its G register index.
    pub fn add_global(&mut self, symbol: SymbolId) -> usize {
        if let Some(i) = self.global_index(symbol) {
            return i;
        }
        self.globals.push(symbol);
        self.globals.len() - 1
    }

    /// The G register index of a captured variable.
    pub fn global_index(&self, symbol: SymbolId) -> Option<usize> {
        self.globals.iter().position(|&g| g == symbol)
    }
}

/// The mutable aggregate driven through the compilation pipeline.
#[derive(Debug)]
pub struct Program {
    /// All abstractions; slot 0 is the top level
    abstractions: Vec<Abstraction>,
    /// All symbols
    pub symbols: SymbolStore,
    /// Known builtins, fed from module descriptors
    pub builtins: BuiltinRegistry,
    /// Names exported by the base environment, in export order
    pub base_declarations: Vec<String>,
    /// Accumulated user-level errors
    pub errors: Vec<CompileError>,
    /// True when compiling the base environment itself
    pub is_base_environment: bool,
    /// The statement being compiled, between passes
    raw_code: Option<Statement>,
    /// The variable holding the base environment record
    pub base_env_symbol: SymbolId,
    /// The variable holding the boot module manager
    pub boot_mm_symbol: SymbolId,
}

impl Program {
    /// Creates a program with an empty top-level abstraction and the two
    /// distinguished environment symbols.
    pub fn new(is_base_environment: bool) -> Self {
        let mut symbols = SymbolStore::new();
        let base_env_symbol = symbols.fresh("Base");
        let boot_mm_symbol = symbols.fresh("BootMM");
        // The environment symbols live at the top level; the entry
        // function supplies their values
        symbols.place(base_env_symbol, AbsId::top_level());
        symbols.place(boot_mm_symbol, AbsId::top_level());

        let top = Abstraction::new(AbsId::top_level(), "<top level>".to_string());

        Self {
            abstractions: vec![top],
            symbols,
            builtins: BuiltinRegistry::new(),
            base_declarations: Vec::new(),
            errors: Vec::new(),
            is_base_environment,
            raw_code: None,
            base_env_symbol,
            boot_mm_symbol,
        }
    }

    /// Allocates a new abstraction in the arena.
    pub fn new_abstraction(&mut self, name: impl Into<String>) -> AbsId {
        let id = AbsId(self.abstractions.len() as u32);
        self.abstractions.push(Abstraction::new(id, name.into()));
        id
    }

    /// Looks up an abstraction.
    pub fn abstraction(&self, id: AbsId) -> &Abstraction {
        &self.abstractions[id.index()]
    }

    /// Looks up an abstraction mutably.
    pub fn abstraction_mut(&mut self, id: AbsId) -> &mut Abstraction {
        &mut self.abstractions[id.index()]
    }

    /// The top-level abstraction.
    pub fn top_level(&self) -> &Abstraction {
        self.abstraction(AbsId::top_level())
    }

    /// All abstractions, in arena order.
    pub fn abstractions(&self) -> impl Iterator<Item = &Abstraction> {
        self.abstractions.iter()
    }

    /// The number of abstractions.
    pub fn abstraction_count(&self) -> usize {
        self.abstractions.len()
    }

    /// Installs the statement the next pass will consume.
    pub fn set_code(&mut self, code: Statement) {
        self.raw_code = Some(code);
    }

    /// Takes the statement out of the program for rewriting.
    ///
    /// Panics if no code is installed; passes run only on a program that
    /// has been assembled.
    pub fn take_code(&mut self) -> Statement {
        self.raw_code.take().expect("no code installed in program")
    }

    /// A read-only view of the current code, if installed.
    pub fn code(&self) -> Option<&Statement> {
        self.raw_code.as_ref()
    }

    /// Records a user-level error. The pass keeps running; the pipeline
    /// stops before the next pass.
    pub fn report(&mut self, error: CompileError) {
        self.errors.push(error);
    }

    /// Returns true if any user-level error has been recorded.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Records a base-environment declaration once, preserving order.
    pub fn add_base_declaration(&mut self, name: &str) {
        if !self.base_declarations.iter().any(|n| n == name) {
            self.base_declarations.push(name.to_string());
        }
    }

    /// Returns true if the name is exported by the base environment.
    pub fn is_base_declaration(&self, name: &str) -> bool {
        self.base_declarations.iter().any(|n| n == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_top_level_is_slot_zero() {
        let program = Program::new(false);
        assert_eq!(program.top_level().id, AbsId::top_level());
        assert_eq!(program.abstraction_count(), 1);
    }

    #[test]
    fn test_globals_first_encounter_order() {
        let mut program = Program::new(false);
        let x = program.symbols.fresh("X");
        let y = program.symbols.fresh("Y");
        let id = program.new_abstraction("P");

        let abs = program.abstraction_mut(id);
        assert_eq!(abs.add_global(y), 0);
        assert_eq!(abs.add_global(x), 1);
        // Re-adding returns the existing index
        assert_eq!(abs.add_global(y), 0);
        assert_eq!(abs.globals, vec![y, x]);
    }

    #[test]
    fn test_locals_deduplicate() {
        let mut program = Program::new(false);
        let x = program.symbols.fresh("X");
        let id = program.new_abstraction("P");

        let abs = program.abstraction_mut(id);
        abs.add_local(x);
        abs.add_local(x);
        assert_eq!(abs.locals.len(), 1);
    }

    #[test]
    fn test_base_declarations_deduplicate() {
        let mut program = Program::new(true);
        program.add_base_declaration("Show");
        program.add_base_declaration("Browse");
        program.add_base_declaration("Show");
        assert_eq!(program.base_declarations, vec!["Show", "Browse"]);
    }
}
