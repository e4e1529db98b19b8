//! Code areas and the per-abstraction register allocator.
//!
//! A [`CodeArea`] is the compiled form of one abstraction: its opcode
//! vector, its constant pool, and its register counts. The
//! [`CodeAreaBuilder`] accumulates opcodes while handing out registers:
//!
//! - **X** registers are scratch, allocated by a bump counter that is
//!   reset between statements
//! - **Y** registers hold formals and locals, assigned once per symbol
//!   by a monotonic counter
//! - **G** registers are fixed by the symbol's position in the
//!   abstraction's global list
//! - **K** registers are constant-pool slots, appended on first use
//!
//! Register assignment is memoized: asking again for the same symbol or
//! an equal constant returns the same register.
//!
//! Forward jumps go through [`Hole`]s: a slot of declared size is
//! reserved, the target code is emitted (its size measured with
//! [`CodeAreaBuilder::counting`]), and the hole is filled exactly once.

use std::collections::HashMap;

use crate::ast::Constant;
use crate::codegen::opcodes::{OpCode, Register};
use crate::symbol::SymbolId;
use crate::transform::PassError;

/// The compiled code of one abstraction.
#[derive(Debug)]
pub struct CodeArea {
    name: String,
    arity: u32,
    opcodes: Vec<OpCode>,
    constants: Vec<Constant>,
    x_count: u32,
    y_count: u32,
}

impl CodeArea {
    /// The abstraction's display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The number of parameters.
    pub fn arity(&self) -> u32 {
        self.arity
    }

    /// The instruction vector.
    pub fn opcodes(&self) -> &[OpCode] {
        &self.opcodes
    }

    /// The constant pool, in first-use order.
    pub fn constants(&self) -> &[Constant] {
        &self.constants
    }

    /// The number of X registers the code needs.
    pub fn x_count(&self) -> u32 {
        self.x_count
    }

    /// The number of Y registers the code needs.
    pub fn y_count(&self) -> u32 {
        self.y_count
    }

    /// Total code size in words.
    pub fn size_words(&self) -> u32 {
        self.opcodes.iter().map(|op| op.size()).sum()
    }

    /// Scans the opcodes for X-register arguments and returns one more
    /// than the highest index used (at least the arity, since arguments
    /// arrive in X registers).
    pub fn compute_x_count(&self) -> u32 {
        let max_used = self
            .opcodes
            .iter()
            .flat_map(|op| op.registers())
            .filter_map(|r| r.x_index())
            .max()
            .map(|i| i + 1)
            .unwrap_or(0);
        max_used.max(self.arity)
    }
}

/// A reserved opcode slot awaiting back-patching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Hole(usize);

/// Accumulates the code area of one abstraction.
#[derive(Debug)]
pub struct CodeAreaBuilder {
    name: String,
    formals: Vec<SymbolId>,
    globals: Vec<SymbolId>,
    opcodes: Vec<OpCode>,
    constants: Vec<Constant>,
    constant_slots: HashMap<Constant, u32>,
    symbol_regs: HashMap<SymbolId, Register>,
    next_y: u32,
    next_x: u32,
    emitted_words: u32,
}

impl CodeAreaBuilder {
    /// Starts a builder for an abstraction with the given formals and
    /// globals. Formals receive the first Y registers, in order.
    pub fn new(name: impl Into<String>, formals: Vec<SymbolId>, globals: Vec<SymbolId>) -> Self {
        let mut builder = Self {
            name: name.into(),
            formals: formals.clone(),
            globals,
            opcodes: Vec::new(),
            constants: Vec::new(),
            constant_slots: HashMap::new(),
            symbol_regs: HashMap::new(),
            next_y: 0,
            next_x: 0,
            emitted_words: 0,
        };
        for formal in formals {
            let y = Register::Y(builder.next_y);
            builder.next_y += 1;
            builder.symbol_regs.insert(formal, y);
        }
        builder
    }

    /// The number of formals.
    pub fn arity(&self) -> u32 {
        self.formals.len() as u32
    }

    /// Appends an instruction.
    pub fn add(&mut self, op: OpCode) {
        self.emitted_words += op.size();
        self.opcodes.push(op);
    }

    /// Reserves a slot of the given word size for back-patching.
    pub fn reserve(&mut self, size: u32) -> Hole {
        let hole = Hole(self.opcodes.len());
        self.emitted_words += size;
        self.opcodes.push(OpCode::Hole { size });
        hole
    }

    /// Fills a reserved slot. Panics if the slot was already filled or
    /// the instruction size does not match the reservation; both are
    /// compiler bugs.
    pub fn fill(&mut self, hole: Hole, op: OpCode) {
        match &self.opcodes[hole.0] {
            OpCode::Hole { size } => {
                assert_eq!(
                    *size,
                    op.size(),
                    "back-patch size mismatch in {}",
                    self.name
                );
            }
            other => panic!("hole filled twice in {}: {:?}", self.name, other),
        }
        self.opcodes[hole.0] = op;
    }

    /// Runs the closure and returns the number of words it emitted,
    /// reservations included. Jump offsets are differences of these
    /// counts.
    pub fn counting(&mut self, f: impl FnOnce(&mut Self)) -> u32 {
        let before = self.emitted_words;
        f(self);
        self.emitted_words - before
    }

    /// The register of a symbol: its G slot when the symbol is captured
    /// by this abstraction, otherwise a memoized Y register.
    pub fn register_for_symbol(&mut self, symbol: SymbolId) -> Register {
        if let Some(index) = self.globals.iter().position(|&g| g == symbol) {
            return Register::G(index as u32);
        }
        if let Some(&reg) = self.symbol_regs.get(&symbol) {
            return reg;
        }
        let reg = Register::Y(self.next_y);
        self.next_y += 1;
        self.symbol_regs.insert(symbol, reg);
        reg
    }

    /// The K register of a constant, appending to the pool on first use.
    pub fn register_for_constant(&mut self, constant: &Constant) -> Register {
        if let Some(&slot) = self.constant_slots.get(constant) {
            return Register::K(slot);
        }
        let slot = self.constants.len() as u32;
        self.constants.push(constant.clone());
        self.constant_slots.insert(constant.clone(), slot);
        Register::K(slot)
    }

    /// A fresh scratch register.
    pub fn alloc_x(&mut self) -> Register {
        let reg = Register::X(self.next_x);
        self.next_x += 1;
        reg
    }

    /// Resets the scratch allocator; called between statements.
    pub fn reset_x(&mut self) {
        self.next_x = 0;
    }

    /// The number of Y registers handed out so far.
    pub fn y_count(&self) -> u32 {
        self.next_y
    }

    /// Words emitted so far, reservations included.
    pub fn emitted_words(&self) -> u32 {
        self.emitted_words
    }

    /// Seals the builder. Fails when a reserved hole was never filled.
    pub fn finish(self) -> Result<CodeArea, PassError> {
        if let Some(index) = self
            .opcodes
            .iter()
            .position(|op| matches!(op, OpCode::Hole { .. }))
        {
            return Err(PassError::new(
                "codegen",
                format!("unfilled hole at opcode {} in {}", index, self.name),
            ));
        }
        let mut area = CodeArea {
            name: self.name,
            arity: self.formals.len() as u32,
            opcodes: self.opcodes,
            constants: self.constants,
            x_count: 0,
            y_count: self.next_y,
        };
        area.x_count = area.compute_x_count();
        Ok(area)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::SymbolStore;

    fn two_symbols() -> (SymbolStore, SymbolId, SymbolId) {
        let mut store = SymbolStore::new();
        let a = store.fresh("A");
        let b = store.fresh("B");
        (store, a, b)
    }

    #[test]
    fn test_symbol_registers_are_memoized() {
        let (_store, a, b) = two_symbols();
        let mut builder = CodeAreaBuilder::new("t", vec![], vec![]);
        let ra = builder.register_for_symbol(a);
        let rb = builder.register_for_symbol(b);
        assert_ne!(ra, rb);
        assert_eq!(builder.register_for_symbol(a), ra);
        assert_eq!(builder.register_for_symbol(b), rb);
    }

    #[test]
    fn test_formals_get_leading_y_registers() {
        let (_store, a, b) = two_symbols();
        let mut builder = CodeAreaBuilder::new("t", vec![a, b], vec![]);
        assert_eq!(builder.register_for_symbol(a), Register::Y(0));
        assert_eq!(builder.register_for_symbol(b), Register::Y(1));
    }

    #[test]
    fn test_globals_resolve_by_position() {
        let (_store, a, b) = two_symbols();
        let mut builder = CodeAreaBuilder::new("t", vec![], vec![b, a]);
        assert_eq!(builder.register_for_symbol(b), Register::G(0));
        assert_eq!(builder.register_for_symbol(a), Register::G(1));
    }

    #[test]
    fn test_constant_pool_first_use_order_no_duplicates() {
        let mut builder = CodeAreaBuilder::new("t", vec![], vec![]);
        let foo = Constant::Atom("foo".into());
        let one = Constant::Int(1);

        assert_eq!(builder.register_for_constant(&foo), Register::K(0));
        assert_eq!(builder.register_for_constant(&one), Register::K(1));
        // Pooling is idempotent for equal keys
        assert_eq!(builder.register_for_constant(&foo), Register::K(0));
        assert_eq!(
            builder.register_for_constant(&Constant::Atom("foo".into())),
            Register::K(0)
        );

        let area = builder.finish().unwrap();
        assert_eq!(area.constants(), &[foo, one]);
    }

    #[test]
    fn test_counting_measures_emitted_words() {
        let mut builder = CodeAreaBuilder::new("t", vec![], vec![]);
        let words = builder.counting(|b| {
            b.add(OpCode::Return);
            b.add(OpCode::Move {
                src: Register::X(0),
                dst: Register::Y(0),
            });
        });
        assert_eq!(words, 4);
    }

    #[test]
    fn test_hole_reserve_and_fill() {
        let mut builder = CodeAreaBuilder::new("t", vec![], vec![]);
        let hole = builder.reserve(2);
        let body = builder.counting(|b| b.add(OpCode::Return));
        builder.fill(
            hole,
            OpCode::Branch {
                offset: body as i32,
            },
        );
        let area = builder.finish().unwrap();
        assert_eq!(
            area.opcodes()[0],
            OpCode::Branch { offset: 1 }
        );
    }

    #[test]
    fn test_unfilled_hole_fails_finish() {
        let mut builder = CodeAreaBuilder::new("t", vec![], vec![]);
        let _hole = builder.reserve(2);
        assert!(builder.finish().is_err());
    }

    #[test]
    #[should_panic(expected = "size mismatch")]
    fn test_fill_size_mismatch_panics() {
        let mut builder = CodeAreaBuilder::new("t", vec![], vec![]);
        let hole = builder.reserve(3);
        builder.fill(hole, OpCode::Return);
    }

    #[test]
    fn test_x_count_covers_max_index_and_arity() {
        let (_store, a, b) = two_symbols();
        let mut builder = CodeAreaBuilder::new("t", vec![a, b], vec![]);
        builder.add(OpCode::Move {
            src: Register::X(4),
            dst: Register::Y(0),
        });
        let area = builder.finish().unwrap();
        assert_eq!(area.x_count(), 5);
        assert!(area.x_count() >= 1 + 4);

        let empty = CodeAreaBuilder::new("e", vec![a, b], vec![]).finish().unwrap();
        // No X use at all: the arity still bounds the count
        assert_eq!(empty.x_count(), 2);
    }
}
