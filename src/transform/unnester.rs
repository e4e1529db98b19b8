//! A-normalization.
//!
//! After this pass, every operand is flat: call arguments, record
//! fields, conditions, and raised values are either a resolved variable
//! or a constant. Anything deeper gets a synthetic local and a preceding
//! binding.
//!
//! Calls in expression position are where the function-call convention
//! appears: `X = {F A}` becomes `{F A X}`, the out-argument appended to
//! the call. Together with the function lowering of the desugarer this
//! makes every value-returning call a plain procedure call.
//!
//! The pass introduces `local` statements around the statements it had
//! to split, so its output keeps the shape `local Temps in Binds Stmt
//! end`.

use crate::ast::{Expression, Pos, RecordField, Statement};
use crate::error::CompileError;
use crate::program::{AbsId, Program};
use crate::symbol::SymbolId;
use crate::transform::{Pass, PassError, PassResult};

/// The A-normalization pass.
pub struct Unnester;

impl Unnester {
    /// Creates the pass.
    pub fn new() -> Self {
        Self
    }
}

impl Default for Unnester {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for Unnester {
    fn name(&self) -> &str {
        "unnester"
    }

    fn run(&mut self, program: &mut Program) -> PassResult<()> {
        let code = program.take_code();
        let mut ctx = Normalize {
            program: &mut *program,
            abs_stack: vec![AbsId::top_level()],
            broken: None,
        };
        let code = ctx.stmt(code);
        if let Some(err) = ctx.broken {
            return Err(err);
        }
        program.set_code(code);
        Ok(())
    }
}

#[derive(Default)]
struct Emit {
    decls: Vec<SymbolId>,
    stmts: Vec<Statement>,
}

impl Emit {
    fn is_empty(&self) -> bool {
        self.decls.is_empty() && self.stmts.is_empty()
    }
}

struct Normalize<'a> {
    program: &'a mut Program,
    abs_stack: Vec<AbsId>,
    broken: Option<PassError>,
}

impl Normalize<'_> {
    fn fresh_local(&mut self) -> SymbolId {
        let symbol = self.program.symbols.fresh_synthetic();
        let abs = *self.abs_stack.last().expect("abstraction stack is empty");
        self.program.symbols.place(symbol, abs);
        symbol
    }

    fn broken(&mut self, message: impl Into<String>) {
        if self.broken.is_none() {
            self.broken = Some(PassError::new("unnester", message));
        }
    }

    fn wrap(&mut self, out: Emit, stmt: Statement) -> Statement {
        if out.is_empty() {
            return stmt;
        }
        let pos = stmt.pos().clone();
        let mut statements = out.stmts;
        statements.push(stmt);
        Statement::Local {
            decls: out.decls,
            body: Box::new(Statement::sequence(statements, pos.clone())),
            pos,
        }
    }

    fn stmt(&mut self, stmt: Statement) -> Statement {
        match stmt {
            Statement::Compound { statements, pos } => Statement::Compound {
                statements: statements.into_iter().map(|s| self.stmt(s)).collect(),
                pos,
            },
            Statement::Local { decls, body, pos } => Statement::Local {
                decls,
                body: Box::new(self.stmt(*body)),
                pos,
            },
            Statement::Bind { lhs, rhs, pos } => {
                let mut out = Emit::default();
                let lhs = self.flatten(lhs, &mut out);
                let stmt = match rhs {
                    Expression::Call {
                        callee,
                        args,
                        pos: call_pos,
                    } => {
                        // Function-call convention: the bound variable
                        // becomes the trailing out-argument
                        let callee = self.flatten(*callee, &mut out);
                        let mut args: Vec<Expression> = args
                            .into_iter()
                            .map(|a| self.flatten(a, &mut out))
                            .collect();
                        args.push(lhs);
                        Statement::Call {
                            callee,
                            args,
                            pos: call_pos,
                        }
                    }
                    Expression::Record { label, fields, pos: record_pos } => {
                        let record = self.flat_record(*label, fields, record_pos, &mut out);
                        Statement::Bind {
                            lhs,
                            rhs: record,
                            pos,
                        }
                    }
                    Expression::Proc {
                        name,
                        formals,
                        body,
                        abs,
                        pos: proc_pos,
                    } => {
                        self.abs_stack.push(abs.unwrap_or_else(AbsId::top_level));
                        let body = Box::new(self.stmt(*body));
                        self.abs_stack.pop();
                        Statement::Bind {
                            lhs,
                            rhs: Expression::Proc {
                                name,
                                formals,
                                body,
                                abs,
                                pos: proc_pos,
                            },
                            pos,
                        }
                    }
                    flat @ (Expression::Variable { .. } | Expression::Constant { .. }) => {
                        Statement::Bind {
                            lhs,
                            rhs: flat,
                            pos,
                        }
                    }
                    other => {
                        self.broken(format!(
                            "binding of an unlowered expression at {}",
                            other.pos()
                        ));
                        Statement::Bind {
                            lhs,
                            rhs: other,
                            pos,
                        }
                    }
                };
                self.wrap(out, stmt)
            }
            Statement::Call { callee, args, pos } => {
                let mut out = Emit::default();
                let callee = self.flatten(callee, &mut out);
                let args = args
                    .into_iter()
                    .map(|a| self.flatten(a, &mut out))
                    .collect();
                self.wrap(out, Statement::Call { callee, args, pos })
            }
            Statement::If {
                cond,
                then_body,
                else_body,
                pos,
            } => {
                let mut out = Emit::default();
                let cond = self.flatten(cond, &mut out);
                let then_body = Box::new(self.stmt(*then_body));
                let else_body = Box::new(self.stmt(*else_body));
                self.wrap(
                    out,
                    Statement::If {
                        cond,
                        then_body,
                        else_body,
                        pos,
                    },
                )
            }
            Statement::Try {
                body,
                catch_pattern,
                catch_body,
                pos,
            } => Statement::Try {
                body: Box::new(self.stmt(*body)),
                catch_pattern,
                catch_body: Box::new(self.stmt(*catch_body)),
                pos,
            },
            Statement::Raise { value, pos } => {
                let mut out = Emit::default();
                let value = self.flatten(value, &mut out);
                self.wrap(out, Statement::Raise { value, pos })
            }
            skip @ Statement::Skip { .. } => skip,
            other => {
                self.broken(format!("unlowered statement at {}", other.pos()));
                other
            }
        }
    }

    /// Reduces an expression to a variable or constant, emitting the
    /// bindings that compute it.
    fn flatten(&mut self, expr: Expression, out: &mut Emit) -> Expression {
        match expr {
            Expression::Variable { .. } | Expression::Constant { .. } => expr,
            Expression::Record { label, fields, pos } => {
                let record = self.flat_record(*label, fields, pos.clone(), out);
                let temp = self.fresh_local();
                out.decls.push(temp);
                out.stmts.push(Statement::Bind {
                    lhs: Expression::var(temp, pos.clone()),
                    rhs: record,
                    pos: pos.clone(),
                });
                Expression::var(temp, pos)
            }
            Expression::Call { callee, args, pos } => {
                let callee = self.flatten(*callee, out);
                let mut args: Vec<Expression> =
                    args.into_iter().map(|a| self.flatten(a, out)).collect();
                let temp = self.fresh_local();
                out.decls.push(temp);
                args.push(Expression::var(temp, pos.clone()));
                out.stmts.push(Statement::Call {
                    callee,
                    args,
                    pos: pos.clone(),
                });
                Expression::var(temp, pos)
            }
            Expression::Proc {
                name,
                formals,
                body,
                abs,
                pos,
            } => {
                self.abs_stack.push(abs.unwrap_or_else(AbsId::top_level));
                let body = Box::new(self.stmt(*body));
                self.abs_stack.pop();
                let temp = self.fresh_local();
                out.decls.push(temp);
                out.stmts.push(Statement::Bind {
                    lhs: Expression::var(temp, pos.clone()),
                    rhs: Expression::Proc {
                        name,
                        formals,
                        body,
                        abs,
                        pos: pos.clone(),
                    },
                    pos: pos.clone(),
                });
                Expression::var(temp, pos)
            }
            other => {
                self.broken(format!(
                    "unlowered expression at {}",
                    other.pos()
                ));
                other
            }
        }
    }

    /// Flattens the parts of a record construction, keeping the record
    /// itself in place (a record may sit directly on the right side of a
    /// binding). Features must be constants by now.
    fn flat_record(
        &mut self,
        label: Expression,
        fields: Vec<RecordField>,
        pos: Pos,
        out: &mut Emit,
    ) -> Expression {
        let label = self.flatten(label, out);
        if !matches!(label, Expression::Constant { .. }) {
            self.program.report(CompileError::Unsupported {
                message: "record label must be statically known".to_string(),
                pos: label.pos().clone(),
            });
        }
        let fields = fields
            .into_iter()
            .map(|f| {
                if !matches!(f.feature, Expression::Constant { .. }) {
                    self.program.report(CompileError::Unsupported {
                        message: "record feature must be statically known".to_string(),
                        pos: f.feature.pos().clone(),
                    });
                }
                RecordField {
                    feature: f.feature,
                    value: self.flatten(f.value, out),
                }
            })
            .collect();
        Expression::Record {
            label: Box::new(label),
            fields,
            pos,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::test_registry;
    use crate::parser::parse_statement;
    use crate::transform::{ConstantFolding, Desugar, Namer, PatternMatcher};
    use std::collections::HashSet;

    fn normalize(source: &str) -> Program {
        let mut program = Program::new(false);
        program.builtins = test_registry();
        let stmt = parse_statement(source, "test.oz", &HashSet::new()).unwrap();
        program.set_code(stmt);
        Namer::new().run(&mut program).unwrap();
        Desugar::new().run(&mut program).unwrap();
        PatternMatcher::new().run(&mut program).unwrap();
        ConstantFolding::new().run(&mut program).unwrap();
        assert!(!program.has_errors(), "{:?}", program.errors);
        Unnester::new().run(&mut program).unwrap();
        assert!(!program.has_errors(), "{:?}", program.errors);
        program
    }

    /// Checks the flatness invariant over a whole tree.
    fn assert_flat(stmt: &Statement) {
        fn check_expr(e: &Expression) {
            assert!(
                e.is_flat(),
                "operand is not a variable or constant: {:?}",
                e
            );
        }
        match stmt {
            Statement::Compound { statements, .. } => statements.iter().for_each(assert_flat),
            Statement::Local { body, .. } => assert_flat(body),
            Statement::Bind { lhs, rhs, .. } => {
                check_expr(lhs);
                match rhs {
                    Expression::Record { label, fields, .. } => {
                        check_expr(label);
                        for f in fields {
                            check_expr(&f.feature);
                            check_expr(&f.value);
                        }
                    }
                    Expression::Proc { body, .. } => assert_flat(body),
                    other => check_expr(other),
                }
            }
            Statement::Call { callee, args, .. } => {
                check_expr(callee);
                args.iter().for_each(check_expr);
            }
            Statement::If {
                cond,
                then_body,
                else_body,
                ..
            } => {
                check_expr(cond);
                assert_flat(then_body);
                assert_flat(else_body);
            }
            Statement::Try {
                body, catch_body, ..
            } => {
                assert_flat(body);
                assert_flat(catch_body);
            }
            Statement::Raise { value, .. } => check_expr(value),
            Statement::Skip { .. } => {}
            other => panic!("unexpected statement after unnesting: {:?}", other),
        }
    }

    #[test]
    fn test_nested_call_argument_gets_temporary() {
        let program = normalize("local P X Y in {P {P X Y} Y} end");
        assert_flat(program.code().unwrap());
    }

    #[test]
    fn test_function_call_bind_appends_out_argument() {
        let program = normalize("local F X in X = {F 1} end");
        let code = program.code().unwrap();
        assert_flat(code);
        fn find_call(stmt: &Statement) -> Option<(usize, bool)> {
            match stmt {
                Statement::Compound { statements, .. } => statements.iter().find_map(find_call),
                Statement::Local { body, .. } => find_call(body),
                Statement::Call { args, .. } => Some((
                    args.len(),
                    matches!(args.last(), Some(Expression::Variable { .. })),
                )),
                _ => None,
            }
        }
        let (argc, last_is_var) = find_call(code).unwrap();
        assert_eq!(argc, 2);
        assert!(last_is_var);
    }

    #[test]
    fn test_record_fields_are_flat() {
        let program = normalize("local F X in X = r(a:{F 1} b:2) end");
        assert_flat(program.code().unwrap());
    }

    #[test]
    fn test_two_temporaries_are_distinct() {
        let program = normalize("local P X in {P {P X X} {P X X}} end");
        assert_flat(program.code().unwrap());
        // Two synthetic locals were introduced with distinct ids and
        // names of the minted x$N form
        let synthetics: Vec<_> = program
            .symbols
            .iter()
            .filter(|s| s.synthetic)
            .collect();
        assert!(synthetics.len() >= 2);
        let mut ids: Vec<_> = synthetics.iter().map(|s| s.id).collect();
        ids.dedup();
        assert_eq!(ids.len(), synthetics.len());
        for s in &synthetics {
            assert!(s.name.starts_with("x$"));
        }
    }

    #[test]
    fn test_output_is_local_wrapped() {
        let program = normalize("local P X in {P X 1 + 2} end");
        // Constant folding already reduced 1 + 2, so no wrapping needed;
        // a genuinely nested call does get wrapped
        let program2 = normalize("local P F X in {P {F X}} end");
        fn has_local(stmt: &Statement) -> bool {
            match stmt {
                Statement::Local { .. } => true,
                Statement::Compound { statements, .. } => statements.iter().any(has_local),
                _ => false,
            }
        }
        let _ = program;
        fn inner(stmt: &Statement) -> &Statement {
            match stmt {
                Statement::Local { body, .. } => body,
                other => other,
            }
        }
        assert!(has_local(inner(program2.code().unwrap())));
    }
}
