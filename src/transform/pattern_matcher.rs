//! Pattern-match compilation.
//!
//! Compiles every `case` statement into a decision tree of record-shape
//! tests and feature binds:
//!
//! - a literal pattern becomes a `Value.'=='` test
//! - a closed record pattern becomes one `Record.'test'` against the
//!   pattern's arity, then one `Value.'.'` bind per field
//! - an open record pattern (`...`) tests the label and each listed
//!   feature separately
//! - a capture binds the scrutinee (or field) to its variable
//!
//! A clause that fails falls through to the next clause; when no `else`
//! is given, the default raises a `matchError` record carrying the
//! scrutinee.
//!
//! `try` statements with a non-trivial catch pattern are normalized here
//! too: the handler catches a fresh variable and matches on it, raising
//! the caught value again when nothing matches.

use crate::ast::{
    Arity, Constant, Expression, MatchClause, Pattern, Pos, Statement,
};
use crate::error::CompileError;
use crate::program::{AbsId, Program};
use crate::rewrite::{walk_expr, walk_stmt, Rewrite};
use crate::symbol::SymbolId;
use crate::transform::{Pass, PassResult};

/// The pattern-match compilation pass.
pub struct PatternMatcher;

impl PatternMatcher {
    /// Creates the pass.
    pub fn new() -> Self {
        Self
    }
}

impl Default for PatternMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for PatternMatcher {
    fn name(&self) -> &str {
        "pattern_matcher"
    }

    fn run(&mut self, program: &mut Program) -> PassResult<()> {
        let code = program.take_code();
        let mut compiler = MatchCompiler {
            program: &mut *program,
            abs_stack: vec![AbsId::top_level()],
        };
        let code = compiler.rewrite_stmt(code);
        program.set_code(code);
        Ok(())
    }
}

struct MatchCompiler<'a> {
    program: &'a mut Program,
    abs_stack: Vec<AbsId>,
}

impl MatchCompiler<'_> {
    fn fresh_local(&mut self) -> SymbolId {
        let symbol = self.program.symbols.fresh_synthetic();
        let abs = *self.abs_stack.last().expect("abstraction stack is empty");
        self.program.symbols.place(symbol, abs);
        symbol
    }

    fn builtin(&mut self, module: &str, name: &str, pos: &Pos) -> Option<Expression> {
        match self.program.builtins.lookup(module, name) {
            Some(builtin) => Some(Expression::Constant {
                value: Constant::Builtin(builtin),
                pos: pos.clone(),
            }),
            None => {
                self.program.report(CompileError::UnknownBuiltin {
                    module: module.to_string(),
                    name: name.to_string(),
                    pos: pos.clone(),
                });
                None
            }
        }
    }

    /// A one-result builtin test followed by a conditional on the result.
    fn test(
        &mut self,
        module: &str,
        name: &str,
        args: Vec<Expression>,
        then_body: Statement,
        else_body: Statement,
        pos: &Pos,
    ) -> Statement {
        let Some(callee) = self.builtin(module, name, pos) else {
            return then_body;
        };
        let t = self.fresh_local();
        let mut call_args = args;
        call_args.push(Expression::var(t, pos.clone()));
        Statement::Local {
            decls: vec![t],
            body: Box::new(Statement::sequence(
                vec![
                    Statement::Call {
                        callee,
                        args: call_args,
                        pos: pos.clone(),
                    },
                    Statement::If {
                        cond: Expression::var(t, pos.clone()),
                        then_body: Box::new(then_body),
                        else_body: Box::new(else_body),
                        pos: pos.clone(),
                    },
                ],
                pos.clone(),
            )),
            pos: pos.clone(),
        }
    }

    /// Binds a field of the scrutinee and matches the subpattern on it.
    fn bind_field_and_match(
        &mut self,
        scrut: &Expression,
        feature: &Constant,
        pattern: &Pattern,
        success: Statement,
        fail: &Statement,
        pos: &Pos,
    ) -> Statement {
        let Some(dot) = self.builtin("Value", ".", pos) else {
            return success;
        };
        let f = self.fresh_local();
        let inner = self.compile_pattern(
            &Expression::var(f, pos.clone()),
            pattern,
            success,
            fail,
        );
        Statement::Local {
            decls: vec![f],
            body: Box::new(Statement::sequence(
                vec![
                    Statement::Call {
                        callee: dot,
                        args: vec![
                            scrut.clone(),
                            Expression::Constant {
                                value: feature.clone(),
                                pos: pos.clone(),
                            },
                            Expression::var(f, pos.clone()),
                        ],
                        pos: pos.clone(),
                    },
                    inner,
                ],
                pos.clone(),
            )),
            pos: pos.clone(),
        }
    }

    /// Compiles one pattern against a scrutinee already held in a
    /// variable. `success` runs with the captures bound; `fail` is the
    /// next clause.
    fn compile_pattern(
        &mut self,
        scrut: &Expression,
        pattern: &Pattern,
        success: Statement,
        fail: &Statement,
    ) -> Statement {
        match pattern {
            Pattern::Wildcard { .. } => success,
            Pattern::Capture { var, pos } => Statement::sequence(
                vec![
                    Statement::Bind {
                        lhs: var.clone(),
                        rhs: scrut.clone(),
                        pos: pos.clone(),
                    },
                    success,
                ],
                pos.clone(),
            ),
            Pattern::Literal { value, pos } => self.test(
                "Value",
                "==",
                vec![
                    scrut.clone(),
                    Expression::Constant {
                        value: value.clone(),
                        pos: pos.clone(),
                    },
                ],
                success,
                fail.clone(),
                pos,
            ),
            Pattern::Record {
                label,
                fields,
                open: false,
                pos,
            } => {
                let arity = Arity::new(
                    label.clone(),
                    fields.iter().map(|f| f.feature.clone()).collect(),
                );
                let mut inner = success;
                for field in fields.iter().rev() {
                    inner = self.bind_field_and_match(
                        scrut,
                        &field.feature,
                        &field.pattern,
                        inner,
                        fail,
                        pos,
                    );
                }
                self.test(
                    "Record",
                    "test",
                    vec![
                        scrut.clone(),
                        Expression::Constant {
                            value: Constant::Arity(arity),
                            pos: pos.clone(),
                        },
                    ],
                    inner,
                    fail.clone(),
                    pos,
                )
            }
            Pattern::Record {
                label,
                fields,
                open: true,
                pos,
            } => {
                let mut inner = success;
                for field in fields.iter().rev() {
                    let bound = self.bind_field_and_match(
                        scrut,
                        &field.feature,
                        &field.pattern,
                        inner,
                        fail,
                        pos,
                    );
                    inner = self.test(
                        "Record",
                        "hasFeature",
                        vec![
                            scrut.clone(),
                            Expression::Constant {
                                value: field.feature.clone(),
                                pos: pos.clone(),
                            },
                        ],
                        bound,
                        fail.clone(),
                        pos,
                    );
                }
                self.test(
                    "Record",
                    "testLabel",
                    vec![
                        scrut.clone(),
                        Expression::Constant {
                            value: label.clone(),
                            pos: pos.clone(),
                        },
                    ],
                    inner,
                    fail.clone(),
                    pos,
                )
            }
        }
    }

    fn compile_match(
        &mut self,
        value: Expression,
        clauses: Vec<MatchClause>,
        else_body: Option<Statement>,
        pos: Pos,
    ) -> Statement {
        // The scrutinee must sit in a variable so every test can reuse it
        let (scrut, intro) = match value {
            var @ Expression::Variable { .. } => (var, None),
            other => {
                let v = self.fresh_local();
                let bind = Statement::Bind {
                    lhs: Expression::var(v, pos.clone()),
                    rhs: other,
                    pos: pos.clone(),
                };
                (Expression::var(v, pos.clone()), Some((v, bind)))
            }
        };

        let default = else_body.unwrap_or_else(|| Statement::Raise {
            value: Expression::Record {
                label: Box::new(Expression::atom("matchError", pos.clone())),
                fields: vec![crate::ast::RecordField {
                    feature: Expression::int(1, pos.clone()),
                    value: scrut.clone(),
                }],
                pos: pos.clone(),
            },
            pos: pos.clone(),
        });

        let mut compiled = default;
        for clause in clauses.into_iter().rev() {
            compiled = self.compile_pattern(&scrut, &clause.pattern, clause.body, &compiled);
        }

        match intro {
            Some((v, bind)) => Statement::Local {
                decls: vec![v],
                body: Box::new(Statement::sequence(vec![bind, compiled], pos.clone())),
                pos,
            },
            None => compiled,
        }
    }
}

impl Rewrite for MatchCompiler<'_> {
    fn rewrite_stmt(&mut self, stmt: Statement) -> Statement {
        match stmt {
            Statement::Match {
                value,
                clauses,
                else_body,
                pos,
            } => {
                let clauses = clauses
                    .into_iter()
                    .map(|c| MatchClause {
                        pattern: c.pattern,
                        body: self.rewrite_stmt(c.body),
                    })
                    .collect();
                let else_body = else_body.map(|s| self.rewrite_stmt(*s));
                self.compile_match(value, clauses, else_body, pos)
            }
            Statement::Try {
                body,
                catch_pattern,
                catch_body,
                pos,
            } => {
                let body = Box::new(self.rewrite_stmt(*body));
                let catch_body = self.rewrite_stmt(*catch_body);
                match catch_pattern {
                    simple @ Pattern::Capture { .. } => Statement::Try {
                        body,
                        catch_pattern: simple,
                        catch_body: Box::new(catch_body),
                        pos,
                    },
                    pattern => {
                        // Catch a fresh variable, match on it, and raise
                        // again when the pattern rejects the value
                        let e = self.fresh_local();
                        let rethrow = Statement::Raise {
                            value: Expression::var(e, pos.clone()),
                            pos: pos.clone(),
                        };
                        let matched = self.compile_match(
                            Expression::var(e, pos.clone()),
                            vec![MatchClause {
                                pattern,
                                body: catch_body,
                            }],
                            Some(rethrow),
                            pos.clone(),
                        );
                        Statement::Try {
                            body,
                            catch_pattern: Pattern::Capture {
                                var: Expression::var(e, pos.clone()),
                                pos: pos.clone(),
                            },
                            catch_body: Box::new(matched),
                            pos,
                        }
                    }
                }
            }
            other => walk_stmt(self, other),
        }
    }

    fn rewrite_expr(&mut self, expr: Expression) -> Expression {
        match expr {
            Expression::Proc {
                name,
                formals,
                body,
                abs,
                pos,
            } => {
                self.abs_stack.push(abs.unwrap_or_else(AbsId::top_level));
                let body = Box::new(self.rewrite_stmt(*body));
                self.abs_stack.pop();
                Expression::Proc {
                    name,
                    formals,
                    body,
                    abs,
                    pos,
                }
            }
            other => walk_expr(self, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::test_registry;
    use crate::parser::parse_statement;
    use crate::transform::{Desugar, Namer};
    use std::collections::HashSet;

    fn compile(source: &str) -> Program {
        let mut program = Program::new(false);
        program.builtins = test_registry();
        let stmt = parse_statement(source, "test.oz", &HashSet::new()).unwrap();
        program.set_code(stmt);
        Namer::new().run(&mut program).unwrap();
        Desugar::new().run(&mut program).unwrap();
        assert!(!program.has_errors(), "{:?}", program.errors);
        PatternMatcher::new().run(&mut program).unwrap();
        assert!(!program.has_errors(), "{:?}", program.errors);
        program
    }

    fn no_match_left(stmt: &Statement) -> bool {
        match stmt {
            Statement::Match { .. } => false,
            Statement::Compound { statements, .. } => statements.iter().all(no_match_left),
            Statement::Local { body, .. } => no_match_left(body),
            Statement::If {
                then_body,
                else_body,
                ..
            } => no_match_left(then_body) && no_match_left(else_body),
            Statement::Try {
                body, catch_body, ..
            } => no_match_left(body) && no_match_left(catch_body),
            _ => true,
        }
    }

    fn count_calls_of(stmt: &Statement, module: &str, name: &str) -> usize {
        fn is_builtin(e: &Expression, module: &str, name: &str) -> bool {
            matches!(
                e,
                Expression::Constant { value: Constant::Builtin(b), .. }
                    if b.module() == module && b.name() == name
            )
        }
        match stmt {
            Statement::Compound { statements, .. } => statements
                .iter()
                .map(|s| count_calls_of(s, module, name))
                .sum(),
            Statement::Local { body, .. } => count_calls_of(body, module, name),
            Statement::If {
                then_body,
                else_body,
                ..
            } => count_calls_of(then_body, module, name) + count_calls_of(else_body, module, name),
            Statement::Try {
                body, catch_body, ..
            } => count_calls_of(body, module, name) + count_calls_of(catch_body, module, name),
            Statement::Call { callee, .. } => usize::from(is_builtin(callee, module, name)),
            _ => 0,
        }
    }

    #[test]
    fn test_literal_clause_becomes_eq_test() {
        let program = compile("local X in case X of 1 then skip else skip end end");
        let code = program.code().unwrap();
        assert!(no_match_left(code));
        assert_eq!(count_calls_of(code, "Value", "=="), 1);
    }

    #[test]
    fn test_record_clause_tests_arity_and_binds_fields() {
        let program = compile("local X in case X of point(x:A y:B) then A = B end end");
        let code = program.code().unwrap();
        assert!(no_match_left(code));
        assert_eq!(count_calls_of(code, "Record", "test"), 1);
        // One dot per bound field
        assert_eq!(count_calls_of(code, "Value", "."), 2);
    }

    #[test]
    fn test_open_record_uses_label_and_feature_tests() {
        let program = compile("local X in case X of point(x:A ...) then skip end end");
        let code = program.code().unwrap();
        assert_eq!(count_calls_of(code, "Record", "testLabel"), 1);
        assert_eq!(count_calls_of(code, "Record", "hasFeature"), 1);
        assert_eq!(count_calls_of(code, "Record", "test"), 0);
    }

    #[test]
    fn test_missing_else_raises_match_error() {
        let program = compile("local X in case X of 1 then skip end end");
        fn has_raise(stmt: &Statement) -> bool {
            match stmt {
                Statement::Raise { value, .. } => matches!(
                    value,
                    Expression::Record { label, .. }
                        if matches!(&**label, Expression::Constant { value: Constant::Atom(a), .. } if a == "matchError")
                ),
                Statement::Compound { statements, .. } => statements.iter().any(has_raise),
                Statement::Local { body, .. } => has_raise(body),
                Statement::If {
                    then_body,
                    else_body,
                    ..
                } => has_raise(then_body) || has_raise(else_body),
                _ => false,
            }
        }
        assert!(has_raise(program.code().unwrap()));
    }

    #[test]
    fn test_clauses_chain_through_else_branches() {
        let program =
            compile("local X in case X of 1 then skip [] 2 then skip else skip end end");
        let code = program.code().unwrap();
        assert_eq!(count_calls_of(code, "Value", "=="), 2);
    }

    #[test]
    fn test_try_catch_pattern_normalized_to_capture() {
        let program = compile("try skip catch failure(E) then E = unit end");
        fn try_has_capture(stmt: &Statement) -> bool {
            match stmt {
                Statement::Try { catch_pattern, .. } => {
                    matches!(catch_pattern, Pattern::Capture { .. })
                }
                Statement::Compound { statements, .. } => statements.iter().any(try_has_capture),
                Statement::Local { body, .. } => try_has_capture(body),
                _ => false,
            }
        }
        assert!(try_has_capture(program.code().unwrap()));
        // The normalized handler raises again when the pattern rejects
        fn has_reraise(stmt: &Statement) -> bool {
            match stmt {
                Statement::Raise { value, .. } => matches!(value, Expression::Variable { .. }),
                Statement::Compound { statements, .. } => statements.iter().any(has_reraise),
                Statement::Local { body, .. } => has_reraise(body),
                Statement::Try { catch_body, .. } => has_reraise(catch_body),
                Statement::If {
                    then_body,
                    else_body,
                    ..
                } => has_reraise(then_body) || has_reraise(else_body),
                _ => false,
            }
        }
        assert!(has_reraise(program.code().unwrap()));
    }
}
