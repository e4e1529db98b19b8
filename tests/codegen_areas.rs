//! Register allocation, constant pooling, and opcode emission checked
//! against compiled programs.

mod common;

use common::compile_statement;
use ozboot::codegen::{OpCode, Register};
use ozboot::Constant;

// ============================================================================
// CONSTANT POOLING
// ============================================================================

#[test]
fn two_uses_of_one_atom_share_a_pool_slot() {
    let program = compile_statement("local X Y in X = foo Y = foo end");
    let area = program.top_level().code_area.as_ref().unwrap();
    assert_eq!(
        area.constants()
            .iter()
            .filter(|c| matches!(c, Constant::Atom(a) if a == "foo"))
            .count(),
        1
    );
}

#[test]
fn pool_keeps_first_use_order() {
    let program = compile_statement("local X Y Z in X = foo Y = 1 Z = foo end");
    let area = program.top_level().code_area.as_ref().unwrap();
    assert_eq!(
        area.constants(),
        &[Constant::Atom("foo".into()), Constant::Int(1)]
    );
}

#[test]
fn pool_has_no_duplicate_keys() {
    let program = compile_statement(
        "local A B C D in A = 1 B = 1 C = 2.5 D = 2.5 A = B end",
    );
    for abs in program.abstractions() {
        let constants = abs.code_area.as_ref().unwrap().constants();
        for (i, c) in constants.iter().enumerate() {
            for other in &constants[i + 1..] {
                assert_ne!(c, other, "duplicate pool entry {:?}", c);
            }
        }
    }
}

// ============================================================================
// REGISTERS
// ============================================================================

#[test]
fn synthetic_temporaries_get_distinct_y_registers() {
    // Two unnester temporaries inside one abstraction
    let program = compile_statement(
        "local P F in \
           fun {F A} A end \
           proc {P} local X in X = pair({F 1} {F 2}) end end \
         end",
    );
    assert!(!program.has_errors(), "{:?}", program.errors);
    let p = program
        .abstractions()
        .find(|a| a.name == "P")
        .expect("abstraction P");
    let area = p.code_area.as_ref().unwrap();
    // Every CreateVar writes a distinct Y register
    let mut created: Vec<Register> = area
        .opcodes()
        .iter()
        .filter_map(|op| match op {
            OpCode::CreateVar { dst } => Some(*dst),
            _ => None,
        })
        .collect();
    let before = created.len();
    created.sort_by_key(|r| match r {
        Register::Y(i) => *i,
        _ => u32::MAX,
    });
    created.dedup();
    assert_eq!(created.len(), before);
    assert!(before >= 2);
}

#[test]
fn x_count_covers_every_x_use() {
    let program = compile_statement(
        "local P A B C D in {P A B C D} {P D C B A} end",
    );
    for abs in program.abstractions() {
        let area = abs.code_area.as_ref().unwrap();
        let max_x = area
            .opcodes()
            .iter()
            .flat_map(|op| op.registers())
            .filter_map(|r| r.x_index())
            .max();
        if let Some(max_x) = max_x {
            assert!(
                area.x_count() >= 1 + max_x,
                "x_count {} does not cover X({})",
                area.x_count(),
                max_x
            );
        }
    }
}

// ============================================================================
// CLOSURE CAPTURE
// ============================================================================

#[test]
fn captured_variable_becomes_single_global() {
    let program = compile_statement(
        "local P in proc {P X} local Q in proc {Q} X = unit end {Q} end end end",
    );
    assert!(!program.has_errors(), "{:?}", program.errors);
    check_capture(&program);
}

fn check_capture(program: &ozboot::Program) {
    let q = program
        .abstractions()
        .find(|a| a.name == "Q")
        .expect("abstraction Q");
    assert_eq!(q.globals.len(), 1);
    assert_eq!(program.symbols.name(q.globals[0]), "X");

    // Q's code reads X through G0
    let q_area = q.code_area.as_ref().unwrap();
    assert!(q_area
        .opcodes()
        .iter()
        .any(|op| op.registers().contains(&Register::G(0))));

    // P's code allocates the closure, passing X's Y register
    let p = program.abstractions().find(|a| a.name == "P").unwrap();
    let p_area = p.code_area.as_ref().unwrap();
    let globals = p_area
        .opcodes()
        .iter()
        .find_map(|op| match op {
            OpCode::CreateAbstraction { globals, .. } => Some(globals.clone()),
            _ => None,
        })
        .expect("closure allocation in P");
    assert_eq!(globals, vec![Register::Y(0)]);
}

// ============================================================================
// BRANCHES AND HOLES
// ============================================================================

#[test]
fn no_hole_survives_code_generation() {
    let program = compile_statement(
        "local A B in \
           if A then B = 1 else B = 2 end \
           try B = 3 catch E then E = unit end \
         end",
    );
    for abs in program.abstractions() {
        let area = abs.code_area.as_ref().unwrap();
        assert!(area
            .opcodes()
            .iter()
            .all(|op| !matches!(op, OpCode::Hole { .. })));
    }
}

#[test]
fn conditional_offsets_skip_the_then_branch() {
    let program = compile_statement("local A B in if A then B = 1 else B = 2 end end");
    let area = program.top_level().code_area.as_ref().unwrap();
    let opcodes = area.opcodes();
    let cond_at = opcodes
        .iter()
        .position(|op| matches!(op, OpCode::CondBranch { .. }))
        .unwrap();
    let OpCode::CondBranch { offset, .. } = &opcodes[cond_at] else {
        unreachable!()
    };
    // Walking offset words forward from the next instruction lands just
    // past the unconditional end branch
    let mut walked = 0;
    let mut index = cond_at + 1;
    while walked < *offset as u32 {
        walked += opcodes[index].size();
        index += 1;
    }
    assert_eq!(walked, *offset as u32);
    assert!(matches!(opcodes[index - 1], OpCode::Branch { .. }));
}
