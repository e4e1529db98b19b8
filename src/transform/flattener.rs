//! Closure conversion.
//!
//! The flattener hoists every remaining procedure expression into the
//! abstraction arena and replaces it with a `CreateAbstraction` node
//! carrying the captured variables.
//!
//! For each hoisted body, innermost first:
//!
//! 1. the `local` declarations (and `catch` captures) become the
//!    abstraction's locals,
//! 2. every referenced symbol that is neither a formal nor a local is a
//!    free variable; in first-reference order these become the
//!    abstraction's globals, the G registers,
//! 3. the body moves into the arena entry, and the expression becomes
//!    `CreateAbstraction(abs, captured)` listing one enclosing-scope
//!    variable per G register.
//!
//! The statement left on the program afterwards is trivial; the
//! top-level body lives in the top-level abstraction like every other
//! body. Free variables of the top level itself (the base environment
//! and the boot module manager) end up as its globals, supplied by the
//! generated entry function.

use crate::ast::{Expression, Pattern, Statement};
use crate::program::{AbsId, Program};
use crate::rewrite::{walk_expr, walk_stmt, Rewrite};
use crate::symbol::SymbolId;
use crate::transform::{Pass, PassError, PassResult};

/// The closure-conversion pass.
pub struct Flattener;

impl Flattener {
    /// Creates the pass.
    pub fn new() -> Self {
        Self
    }
}

impl Default for Flattener {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for Flattener {
    fn name(&self) -> &str {
        "flattener"
    }

    fn run(&mut self, program: &mut Program) -> PassResult<()> {
        let code = program.take_code();
        let mut hoist = Hoist {
            program: &mut *program,
            broken: None,
        };
        let code = hoist.rewrite_stmt(code);
        if let Some(err) = hoist.broken {
            return Err(err);
        }

        seal_abstraction(program, AbsId::top_level(), code);
        program.set_code(Statement::Skip {
            pos: crate::ast::Pos::dummy(),
        });
        Ok(())
    }
}

struct Hoist<'a> {
    program: &'a mut Program,
    broken: Option<PassError>,
}

impl Hoist<'_> {
    fn broken(&mut self, message: impl Into<String>) {
        if self.broken.is_none() {
            self.broken = Some(PassError::new("flattener", message));
        }
    }
}

impl Rewrite for Hoist<'_> {
    fn rewrite_expr(&mut self, expr: Expression) -> Expression {
        match expr {
            Expression::Proc {
                formals: _,
                body,
                abs,
                pos,
                ..
            } => {
                let Some(abs) = abs else {
                    self.broken(format!("procedure without an arena slot at {}", pos));
                    return Expression::Constant {
                        value: crate::ast::Constant::Unit,
                        pos,
                    };
                };
                // Hoist nested procedures first, so the captured lists of
                // inner abstractions count as references here
                let body = self.rewrite_stmt(*body);
                let frees = seal_abstraction(self.program, abs, body);
                let captured = frees
                    .into_iter()
                    .map(|symbol| Expression::var(symbol, pos.clone()))
                    .collect();
                Expression::CreateAbstraction { abs, captured, pos }
            }
            Expression::Fun { pos, .. } | Expression::Functor { pos, .. } => {
                self.broken(format!("unlowered abstraction form at {}", pos));
                Expression::Constant {
                    value: crate::ast::Constant::Unit,
                    pos,
                }
            }
            other => walk_expr(self, other),
        }
    }

    fn rewrite_stmt(&mut self, stmt: Statement) -> Statement {
        walk_stmt(self, stmt)
    }
}

/// Installs a hoisted body: records locals, computes the ordered free
/// variables as globals, and moves the body into the arena entry.
/// Returns the globals.
fn seal_abstraction(program: &mut Program, abs: AbsId, body: Statement) -> Vec<SymbolId> {
    let mut locals = Vec::new();
    collect_decls(&body, &mut locals);
    for &symbol in &locals {
        program.symbols.place(symbol, abs);
        program.abstraction_mut(abs).add_local(symbol);
    }

    let mut declared: Vec<SymbolId> = program.abstraction(abs).formals.clone();
    declared.extend(locals);

    let mut refs = Vec::new();
    collect_refs(&body, &mut refs);

    let mut frees = Vec::new();
    for symbol in refs {
        if !declared.contains(&symbol) && !frees.contains(&symbol) {
            frees.push(symbol);
        }
    }
    for &symbol in &frees {
        program.abstraction_mut(abs).add_global(symbol);
        program.symbols.mark_captured(symbol);
    }

    program.abstraction_mut(abs).body = body;
    frees
}

/// Symbols declared inside a body: `local` declarations and `catch`
/// captures. Nested abstractions are already hoisted out, so the walk
/// never crosses an abstraction boundary.
fn collect_decls(stmt: &Statement, out: &mut Vec<SymbolId>) {
    match stmt {
        Statement::Compound { statements, .. } => {
            for s in statements {
                collect_decls(s, out);
            }
        }
        Statement::Local { decls, body, .. } => {
            out.extend(decls.iter().copied());
            collect_decls(body, out);
        }
        Statement::If {
            then_body,
            else_body,
            ..
        } => {
            collect_decls(then_body, out);
            collect_decls(else_body, out);
        }
        Statement::Try {
            body,
            catch_pattern,
            catch_body,
            ..
        } => {
            collect_decls(body, out);
            if let Pattern::Capture { var, .. } = catch_pattern {
                if let Some(symbol) = var.symbol() {
                    out.push(symbol);
                }
            }
            collect_decls(catch_body, out);
        }
        _ => {}
    }
}

/// Every variable reference in a body, in first-appearance order,
/// including the captured lists of already-hoisted abstractions.
fn collect_refs(stmt: &Statement, out: &mut Vec<SymbolId>) {
    fn expr_refs(expr: &Expression, out: &mut Vec<SymbolId>) {
        match expr {
            Expression::Variable { symbol, .. } => out.push(*symbol),
            Expression::Record { label, fields, .. } => {
                expr_refs(label, out);
                for f in fields {
                    expr_refs(&f.feature, out);
                    expr_refs(&f.value, out);
                }
            }
            Expression::CreateAbstraction { captured, .. } => {
                for c in captured {
                    expr_refs(c, out);
                }
            }
            _ => {}
        }
    }
    match stmt {
        Statement::Compound { statements, .. } => {
            for s in statements {
                collect_refs(s, out);
            }
        }
        Statement::Local { body, .. } => collect_refs(body, out),
        Statement::Bind { lhs, rhs, .. } => {
            expr_refs(lhs, out);
            expr_refs(rhs, out);
        }
        Statement::Call { callee, args, .. } => {
            expr_refs(callee, out);
            for a in args {
                expr_refs(a, out);
            }
        }
        Statement::If {
            cond,
            then_body,
            else_body,
            ..
        } => {
            expr_refs(cond, out);
            collect_refs(then_body, out);
            collect_refs(else_body, out);
        }
        Statement::Try {
            body, catch_body, ..
        } => {
            collect_refs(body, out);
            collect_refs(catch_body, out);
        }
        Statement::Raise { value, .. } => expr_refs(value, out),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::test_registry;
    use crate::parser::parse_statement;
    use crate::transform::{ConstantFolding, Desugar, Namer, PatternMatcher, Unnester};
    use std::collections::HashSet;

    fn flatten(source: &str) -> Program {
        let mut program = Program::new(false);
        program.builtins = test_registry();
        let stmt = parse_statement(source, "test.oz", &HashSet::new()).unwrap();
        program.set_code(stmt);
        Namer::new().run(&mut program).unwrap();
        Desugar::new().run(&mut program).unwrap();
        PatternMatcher::new().run(&mut program).unwrap();
        ConstantFolding::new().run(&mut program).unwrap();
        Unnester::new().run(&mut program).unwrap();
        assert!(!program.has_errors(), "{:?}", program.errors);
        Flattener::new().run(&mut program).unwrap();
        assert!(!program.has_errors(), "{:?}", program.errors);
        program
    }

    fn assert_no_inline_abstractions(stmt: &Statement) {
        fn check_expr(e: &Expression) {
            match e {
                Expression::Proc { .. } | Expression::Fun { .. } => {
                    panic!("inline abstraction survived flattening: {:?}", e)
                }
                Expression::Record { label, fields, .. } => {
                    check_expr(label);
                    for f in fields {
                        check_expr(&f.value);
                    }
                }
                Expression::CreateAbstraction { captured, .. } => {
                    captured.iter().for_each(check_expr)
                }
                _ => {}
            }
        }
        match stmt {
            Statement::Compound { statements, .. } => {
                statements.iter().for_each(assert_no_inline_abstractions)
            }
            Statement::Local { body, .. } => assert_no_inline_abstractions(body),
            Statement::Bind { lhs, rhs, .. } => {
                check_expr(lhs);
                check_expr(rhs);
            }
            Statement::Call { callee, args, .. } => {
                check_expr(callee);
                args.iter().for_each(check_expr);
            }
            Statement::If {
                then_body,
                else_body,
                ..
            } => {
                assert_no_inline_abstractions(then_body);
                assert_no_inline_abstractions(else_body);
            }
            Statement::Try {
                body, catch_body, ..
            } => {
                assert_no_inline_abstractions(body);
                assert_no_inline_abstractions(catch_body);
            }
            _ => {}
        }
    }

    #[test]
    fn test_no_abstraction_remains_inline() {
        let program = flatten(
            "local P in proc {P X} local Q in proc {Q} X = unit end {Q} end end {P 1} end",
        );
        for abs in program.abstractions() {
            assert_no_inline_abstractions(&abs.body);
        }
    }

    #[test]
    fn test_nested_capture_is_single_global() {
        let program =
            flatten("local P in proc {P X} local Q in proc {Q} X = unit end {Q} end end end");
        let q = program
            .abstractions()
            .find(|a| a.name == "Q")
            .expect("abstraction Q");
        let globals: Vec<_> = q
            .globals
            .iter()
            .map(|&g| program.symbols.name(g).to_string())
            .collect();
        assert_eq!(globals, vec!["X"]);
        // The captured symbol keeps its defining owner
        let x = q.globals[0];
        let p = program.abstractions().find(|a| a.name == "P").unwrap();
        assert_eq!(program.symbols.get(x).owner, Some(p.id));
        assert!(program.symbols.get(x).captured);
    }

    #[test]
    fn test_create_abstraction_passes_enclosing_variables() {
        let program =
            flatten("local P in proc {P X} local Q in proc {Q} X = unit end {Q} end end end");
        let p = program.abstractions().find(|a| a.name == "P").unwrap();
        fn find_create(stmt: &Statement) -> Option<&Expression> {
            match stmt {
                Statement::Compound { statements, .. } => {
                    statements.iter().find_map(find_create)
                }
                Statement::Local { body, .. } => find_create(body),
                Statement::Bind {
                    rhs: rhs @ Expression::CreateAbstraction { .. },
                    ..
                } => Some(rhs),
                _ => None,
            }
        }
        match find_create(&p.body) {
            Some(Expression::CreateAbstraction { captured, .. }) => {
                assert_eq!(captured.len(), 1);
                let sym = captured[0].symbol().unwrap();
                assert_eq!(program.symbols.name(sym), "X");
            }
            other => panic!("expected closure allocation, got {:?}", other),
        }
    }

    #[test]
    fn test_transitive_capture_chains_through_middle() {
        let program = flatten(
            "local P in proc {P X} local Q in proc {Q} local R in proc {R} X = unit end {R} end end {Q} end end end",
        );
        // X is declared in P, referenced only in R; it must be a global
        // of both Q and R
        let q = program.abstractions().find(|a| a.name == "Q").unwrap();
        let r = program.abstractions().find(|a| a.name == "R").unwrap();
        let q_globals: Vec<_> = q
            .globals
            .iter()
            .map(|&g| program.symbols.name(g).to_string())
            .collect();
        let r_globals: Vec<_> = r
            .globals
            .iter()
            .map(|&g| program.symbols.name(g).to_string())
            .collect();
        assert!(q_globals.contains(&"X".to_string()));
        assert!(r_globals.contains(&"X".to_string()));
    }

    #[test]
    fn test_top_level_body_installed() {
        let program = flatten("local X in X = 1 end");
        let top = program.top_level();
        assert!(!matches!(top.body, Statement::Skip { .. }));
        assert_eq!(top.locals.len(), 1);
    }

    #[test]
    fn test_globals_in_first_reference_order() {
        let program = flatten(
            "local A B P in A = 1 B = 2 proc {P} B = A A = B end end",
        );
        let p = program.abstractions().find(|a| a.name == "P").unwrap();
        let names: Vec<_> = p
            .globals
            .iter()
            .map(|&g| program.symbols.name(g).to_string())
            .collect();
        assert_eq!(names, vec!["B", "A"]);
    }
}
