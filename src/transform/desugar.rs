//! Lowering of the remaining syntactic sugar.
//!
//! After functors are gone, this pass reduces the tree to the kernel
//! forms the later passes understand:
//!
//! - functions become procedures with a trailing result parameter, and
//!   expression-position control forms (`local`, `if`, `case`) become
//!   statements binding that result
//! - operator forms become calls of the corresponding builtins
//! - feature selection becomes a `Value.'.'` call
//! - `for` loops become a local recursive procedure
//! - `thread S end` becomes `Thread.create` of a nullary procedure

use crate::ast::{
    BinaryOp, Constant, Expression, MatchClause, Pos, RecordField, Statement, UnaryOp,
};
use crate::error::CompileError;
use crate::program::{AbsId, Program};
use crate::symbol::SymbolId;
use crate::transform::{Pass, PassResult};

/// The sugar-lowering pass.
pub struct Desugar;

impl Desugar {
    /// Creates the pass.
    pub fn new() -> Self {
        Self
    }
}

impl Default for Desugar {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for Desugar {
    fn name(&self) -> &str {
        "desugar"
    }

    fn run(&mut self, program: &mut Program) -> PassResult<()> {
        let code = program.take_code();
        let mut sugar = Sugar {
            program: &mut *program,
            abs_stack: vec![AbsId::top_level()],
        };
        let code = sugar.stmt(code);
        program.set_code(code);
        Ok(())
    }
}

/// Statements and declarations hoisted in front of the statement being
/// rewritten, for control forms pulled out of expression position.
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

struct Sugar<'a> {
    program: &'a mut Program,
    abs_stack: Vec<AbsId>,
}

impl Sugar<'_> {
    fn current_abs(&self) -> AbsId {
        *self.abs_stack.last().expect("abstraction stack is empty")
    }

    fn fresh_local(&mut self) -> SymbolId {
        let symbol = self.program.symbols.fresh_synthetic();
        self.program.symbols.place(symbol, self.current_abs());
        symbol
    }

    /// Looks up a builtin, reporting a compile error when it is missing.
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
                let lhs = self.expr(lhs, &mut out);
                let stmt = match rhs {
                    rhs @ (Expression::Local { .. }
                    | Expression::IfExpression { .. }
                    | Expression::MatchExpression { .. }) => self.bind_into(lhs, rhs),
                    rhs => {
                        let rhs = self.expr(rhs, &mut out);
                        Statement::Bind { lhs, rhs, pos }
                    }
                };
                self.wrap(out, stmt)
            }
            Statement::Call { callee, args, pos } => {
                let mut out = Emit::default();
                let callee = self.expr(callee, &mut out);
                let args = args.into_iter().map(|a| self.expr(a, &mut out)).collect();
                self.wrap(out, Statement::Call { callee, args, pos })
            }
            Statement::If {
                cond,
                then_body,
                else_body,
                pos,
            } => {
                let mut out = Emit::default();
                let cond = self.expr(cond, &mut out);
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
            Statement::Match {
                value,
                clauses,
                else_body,
                pos,
            } => {
                let mut out = Emit::default();
                let value = self.expr(value, &mut out);
                let clauses = clauses
                    .into_iter()
                    .map(|c| MatchClause {
                        pattern: c.pattern,
                        body: self.stmt(c.body),
                    })
                    .collect();
                let else_body = else_body.map(|s| Box::new(self.stmt(*s)));
                self.wrap(
                    out,
                    Statement::Match {
                        value,
                        clauses,
                        else_body,
                        pos,
                    },
                )
            }
            Statement::For {
                var,
                from,
                to,
                body,
                pos,
            } => self.lower_for(var, from, to, *body, pos),
            Statement::Thread { body, pos } => self.lower_thread(*body, pos),
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
                let value = self.expr(value, &mut out);
                self.wrap(out, Statement::Raise { value, pos })
            }
            other @ (Statement::RawLocal { .. } | Statement::Skip { .. }) => other,
        }
    }

    fn expr(&mut self, expr: Expression, out: &mut Emit) -> Expression {
        match expr {
            Expression::RawVariable { .. }
            | Expression::Variable { .. }
            | Expression::Constant { .. }
            | Expression::CreateAbstraction { .. } => expr,
            Expression::Record { label, fields, pos } => Expression::Record {
                label: Box::new(self.expr(*label, out)),
                fields: fields
                    .into_iter()
                    .map(|f| RecordField {
                        feature: self.expr(f.feature, out),
                        value: self.expr(f.value, out),
                    })
                    .collect(),
                pos,
            },
            Expression::FeatureAccess {
                record,
                feature,
                pos,
            } => {
                let record = self.expr(*record, out);
                let feature = self.expr(*feature, out);
                match self.builtin("Value", ".", &pos) {
                    Some(dot) => Expression::Call {
                        callee: Box::new(dot),
                        args: vec![record, feature],
                        pos,
                    },
                    None => Expression::FeatureAccess {
                        record: Box::new(record),
                        feature: Box::new(feature),
                        pos,
                    },
                }
            }
            Expression::UnaryOp { op, operand, pos } => {
                let operand = self.expr(*operand, out);
                let UnaryOp::Neg = op;
                match self.builtin("Number", "~", &pos) {
                    Some(neg) => Expression::Call {
                        callee: Box::new(neg),
                        args: vec![operand],
                        pos,
                    },
                    None => Expression::UnaryOp {
                        op,
                        operand: Box::new(operand),
                        pos,
                    },
                }
            }
            Expression::BinaryOp { op, lhs, rhs, pos } => {
                let lhs = self.expr(*lhs, out);
                let rhs = self.expr(*rhs, out);
                let (module, name) = binary_builtin(op);
                match self.builtin(module, name, &pos) {
                    Some(callee) => Expression::Call {
                        callee: Box::new(callee),
                        args: vec![lhs, rhs],
                        pos,
                    },
                    None => Expression::BinaryOp {
                        op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                        pos,
                    },
                }
            }
            Expression::Call { callee, args, pos } => Expression::Call {
                callee: Box::new(self.expr(*callee, out)),
                args: args.into_iter().map(|a| self.expr(a, out)).collect(),
                pos,
            },
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
                Expression::Proc {
                    name,
                    formals,
                    body,
                    abs,
                    pos,
                }
            }
            Expression::Fun {
                name,
                formals,
                body,
                abs,
                pos,
            } => {
                let abs_id = abs.unwrap_or_else(AbsId::top_level);
                self.abs_stack.push(abs_id);

                // The trailing formal the function result is bound to
                let result = self.program.symbols.fresh_synthetic();
                self.program.symbols.mark_formal(result);
                self.program.symbols.place(result, abs_id);
                self.program.abstraction_mut(abs_id).formals.push(result);

                let target = Expression::var(result, pos.clone());
                let body = self.bind_into(target, *body);
                self.abs_stack.pop();

                let mut formals = formals;
                formals.push(Expression::var(result, pos.clone()));
                Expression::Proc {
                    name,
                    formals,
                    body: Box::new(body),
                    abs,
                    pos,
                }
            }
            expr @ (Expression::Local { .. }
            | Expression::IfExpression { .. }
            | Expression::MatchExpression { .. }) => {
                // Pull the control form out into a statement binding a
                // fresh variable
                let pos = expr.pos().clone();
                let temp = self.fresh_local();
                out.decls.push(temp);
                let bind = self.bind_into(Expression::var(temp, pos.clone()), expr);
                out.stmts.push(bind);
                Expression::var(temp, pos)
            }
            Expression::Functor { .. } => expr,
        }
    }

    /// Turns `target = <expr>` into a statement, pushing the binding into
    /// the branches of control forms.
    fn bind_into(&mut self, target: Expression, expr: Expression) -> Statement {
        match expr {
            Expression::Local {
                decls,
                body,
                result,
                pos,
            } => {
                let decls = decls.into_iter().filter_map(|d| d.symbol()).collect();
                let body = body.map(|s| self.stmt(*s));
                let inner = self.bind_into(target, *result);
                let statements = match body {
                    Some(s) => vec![s, inner],
                    None => vec![inner],
                };
                Statement::Local {
                    decls,
                    body: Box::new(Statement::sequence(statements, pos.clone())),
                    pos,
                }
            }
            Expression::IfExpression {
                cond,
                then_value,
                else_value,
                pos,
            } => {
                let mut out = Emit::default();
                let cond = self.expr(*cond, &mut out);
                let then_body = Box::new(self.bind_into(target.clone(), *then_value));
                let else_body = Box::new(self.bind_into(target, *else_value));
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
            Expression::MatchExpression {
                value,
                clauses,
                else_value,
                pos,
            } => {
                let mut out = Emit::default();
                let value = self.expr(*value, &mut out);
                let clauses = clauses
                    .into_iter()
                    .map(|c| MatchClause {
                        pattern: c.pattern,
                        body: self.bind_into(target.clone(), c.value),
                    })
                    .collect();
                let else_body = else_value.map(|e| Box::new(self.bind_into(target, *e)));
                self.wrap(
                    out,
                    Statement::Match {
                        value,
                        clauses,
                        else_body,
                        pos,
                    },
                )
            }
            other => {
                let mut out = Emit::default();
                let pos = other.pos().clone();
                let rhs = self.expr(other, &mut out);
                self.wrap(
                    out,
                    Statement::Bind {
                        lhs: target,
                        rhs,
                        pos,
                    },
                )
            }
        }
    }

    /// `for X in From..To do S end` becomes
    ///
    /// ```text
    /// local Loop Bound in
    ///    Bound = To
    ///    proc {Loop X}
    ///       if X =< Bound then S {Loop X+1} end
    ///    end
    ///    {Loop From}
    /// end
    /// ```
    fn lower_for(
        &mut self,
        var: Expression,
        from: Expression,
        to: Expression,
        body: Statement,
        pos: Pos,
    ) -> Statement {
        let Some(var_sym) = var.symbol() else {
            self.program.report(CompileError::Unsupported {
                message: "loop variable is not resolved".to_string(),
                pos: pos.clone(),
            });
            return Statement::Skip { pos };
        };

        let mut out = Emit::default();
        let from = self.expr(from, &mut out);
        let to = self.expr(to, &mut out);

        let loop_sym = self.fresh_local();
        let bound_sym = self.fresh_local();

        // The loop variable becomes the formal of the loop procedure
        let loop_abs = self.program.new_abstraction("<for loop>");
        self.program.symbols.place(var_sym, loop_abs);
        self.program.symbols.mark_formal(var_sym);
        self.program.abstraction_mut(loop_abs).formals.push(var_sym);

        self.abs_stack.push(loop_abs);
        let body = self.stmt(body);
        self.abs_stack.pop();

        let le = self.builtin("Value", "=<", &pos);
        let add = self.builtin("Number", "+", &pos);
        let (Some(le), Some(add)) = (le, add) else {
            return Statement::Skip { pos };
        };

        let cond = Expression::Call {
            callee: Box::new(le),
            args: vec![
                Expression::var(var_sym, pos.clone()),
                Expression::var(bound_sym, pos.clone()),
            ],
            pos: pos.clone(),
        };
        let next = Expression::Call {
            callee: Box::new(add),
            args: vec![Expression::var(var_sym, pos.clone()), Expression::int(1, pos.clone())],
            pos: pos.clone(),
        };
        let loop_body = Statement::If {
            cond,
            then_body: Box::new(Statement::sequence(
                vec![
                    body,
                    Statement::Call {
                        callee: Expression::var(loop_sym, pos.clone()),
                        args: vec![next],
                        pos: pos.clone(),
                    },
                ],
                pos.clone(),
            )),
            else_body: Box::new(Statement::Skip { pos: pos.clone() }),
            pos: pos.clone(),
        };

        let stmt = Statement::Local {
            decls: vec![loop_sym, bound_sym],
            body: Box::new(Statement::sequence(
                vec![
                    Statement::Bind {
                        lhs: Expression::var(bound_sym, pos.clone()),
                        rhs: to,
                        pos: pos.clone(),
                    },
                    Statement::Bind {
                        lhs: Expression::var(loop_sym, pos.clone()),
                        rhs: Expression::Proc {
                            name: String::new(),
                            formals: vec![Expression::var(var_sym, pos.clone())],
                            body: Box::new(loop_body),
                            abs: Some(loop_abs),
                            pos: pos.clone(),
                        },
                        pos: pos.clone(),
                    },
                    Statement::Call {
                        callee: Expression::var(loop_sym, pos.clone()),
                        args: vec![from],
                        pos: pos.clone(),
                    },
                ],
                pos.clone(),
            )),
            pos,
        };
        self.wrap(out, stmt)
    }

    /// `thread S end` becomes `{Thread.create proc {$} S end}`.
    fn lower_thread(&mut self, body: Statement, pos: Pos) -> Statement {
        let Some(create) = self.builtin("Thread", "create", &pos) else {
            return Statement::Thread {
                body: Box::new(self.stmt(body)),
                pos,
            };
        };

        let abs = self.program.new_abstraction("<thread>");
        self.abs_stack.push(abs);
        let body = self.stmt(body);
        self.abs_stack.pop();

        Statement::Call {
            callee: create,
            args: vec![Expression::Proc {
                name: String::new(),
                formals: Vec::new(),
                body: Box::new(body),
                abs: Some(abs),
                pos: pos.clone(),
            }],
            pos,
        }
    }
}

fn binary_builtin(op: BinaryOp) -> (&'static str, &'static str) {
    match op {
        BinaryOp::Add => ("Number", "+"),
        BinaryOp::Sub => ("Number", "-"),
        BinaryOp::Mul => ("Number", "*"),
        BinaryOp::FloatDiv => ("Float", "/"),
        BinaryOp::Div => ("Int", "div"),
        BinaryOp::Mod => ("Int", "mod"),
        BinaryOp::Eq => ("Value", "=="),
        BinaryOp::Ne => ("Value", "\\="),
        BinaryOp::Lt => ("Value", "<"),
        BinaryOp::Le => ("Value", "=<"),
        BinaryOp::Gt => ("Value", ">"),
        BinaryOp::Ge => ("Value", ">="),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::test_registry;
    use crate::parser::parse_statement;
    use crate::transform::Namer;
    use std::collections::HashSet;

    fn desugar(source: &str) -> Program {
        let mut program = Program::new(false);
        program.builtins = test_registry();
        let stmt = parse_statement(source, "test.oz", &HashSet::new()).unwrap();
        program.set_code(stmt);
        Namer::new().run(&mut program).unwrap();
        assert!(!program.has_errors(), "namer: {:?}", program.errors);
        Desugar::new().run(&mut program).unwrap();
        program
    }

    fn contains_fun(stmt: &Statement) -> bool {
        // Spot check used by the conversion tests
        fn in_expr(e: &Expression) -> bool {
            match e {
                Expression::Fun { .. } => true,
                Expression::Proc { body, .. } => contains_fun(body),
                Expression::Call { callee, args, .. } => {
                    in_expr(callee) || args.iter().any(in_expr)
                }
                Expression::Record { label, fields, .. } => {
                    in_expr(label) || fields.iter().any(|f| in_expr(&f.feature) || in_expr(&f.value))
                }
                _ => false,
            }
        }
        match stmt {
            Statement::Compound { statements, .. } => statements.iter().any(contains_fun),
            Statement::Local { body, .. } => contains_fun(body),
            Statement::Bind { lhs, rhs, .. } => in_expr(lhs) || in_expr(rhs),
            Statement::Call { callee, args, .. } => in_expr(callee) || args.iter().any(in_expr),
            Statement::If {
                then_body,
                else_body,
                ..
            } => contains_fun(then_body) || contains_fun(else_body),
            _ => false,
        }
    }

    #[test]
    fn test_fun_becomes_proc_with_result_formal() {
        let program = desugar("local F in fun {F X} X end end");
        assert!(!program.has_errors(), "{:?}", program.errors);
        assert!(!contains_fun(program.code().unwrap()));
        // The fun's abstraction now has two formals: X and the result
        let abs = program
            .abstractions()
            .find(|a| a.name == "F")
            .expect("abstraction for F");
        assert_eq!(abs.formals.len(), 2);
        let result = abs.formals[1];
        assert!(program.symbols.get(result).synthetic);
        assert!(program.symbols.get(result).formal);
    }

    #[test]
    fn test_operators_become_builtin_calls() {
        let program = desugar("local X in X = 1 + 2 end");
        assert!(!program.has_errors(), "{:?}", program.errors);
        fn find_call(stmt: &Statement) -> Option<&Expression> {
            match stmt {
                Statement::Local { body, .. } => find_call(body),
                Statement::Bind { rhs, .. } => Some(rhs),
                Statement::Compound { statements, .. } => statements.iter().find_map(find_call),
                _ => None,
            }
        }
        match find_call(program.code().unwrap()) {
            Some(Expression::Call { callee, args, .. }) => {
                assert!(matches!(
                    &**callee,
                    Expression::Constant { value: Constant::Builtin(b), .. }
                        if b.module() == "Number" && b.name() == "+"
                ));
                assert_eq!(args.len(), 2);
            }
            other => panic!("expected builtin call, got {:?}", other),
        }
    }

    #[test]
    fn test_feature_access_becomes_dot_call() {
        let program = desugar("local R X in X = R.foo end");
        assert!(!program.has_errors(), "{:?}", program.errors);
        fn has_dot(stmt: &Statement) -> bool {
            match stmt {
                Statement::Local { body, .. } => has_dot(body),
                Statement::Compound { statements, .. } => statements.iter().any(has_dot),
                Statement::Bind { rhs, .. } => matches!(
                    rhs,
                    Expression::Call { callee, .. }
                        if matches!(&**callee, Expression::Constant { value: Constant::Builtin(b), .. }
                            if b.name() == ".")
                ),
                _ => false,
            }
        }
        assert!(has_dot(program.code().unwrap()));
    }

    #[test]
    fn test_for_becomes_recursive_proc() {
        let program = desugar("local S in for I in 1..10 do S = I end end");
        assert!(!program.has_errors(), "{:?}", program.errors);
        // A loop abstraction was allocated with the loop variable as its
        // formal
        let abs = program
            .abstractions()
            .find(|a| a.name == "<for loop>")
            .expect("loop abstraction");
        assert_eq!(abs.formals.len(), 1);
        assert_eq!(program.symbols.name(abs.formals[0]), "I");
        assert!(program.symbols.get(abs.formals[0]).formal);
    }

    #[test]
    fn test_thread_becomes_create_call() {
        let program = desugar("local X in thread X = 1 end end");
        assert!(!program.has_errors(), "{:?}", program.errors);
        fn has_create(stmt: &Statement) -> bool {
            match stmt {
                Statement::Local { body, .. } => has_create(body),
                Statement::Compound { statements, .. } => statements.iter().any(has_create),
                Statement::Call { callee, args, .. } => {
                    matches!(
                        callee,
                        Expression::Constant { value: Constant::Builtin(b), .. }
                            if b.module() == "Thread" && b.name() == "create"
                    ) && matches!(args[0], Expression::Proc { .. })
                }
                _ => false,
            }
        }
        assert!(has_create(program.code().unwrap()));
    }

    #[test]
    fn test_if_expression_becomes_statement() {
        let program = desugar("local X A in X = if A == 1 then 2 else 3 end end");
        assert!(!program.has_errors(), "{:?}", program.errors);
        fn has_if(stmt: &Statement) -> bool {
            match stmt {
                Statement::Local { body, .. } => has_if(body),
                Statement::Compound { statements, .. } => statements.iter().any(has_if),
                Statement::If {
                    then_body,
                    else_body,
                    ..
                } => {
                    matches!(**then_body, Statement::Bind { .. })
                        && matches!(**else_body, Statement::Bind { .. })
                }
                _ => false,
            }
        }
        assert!(has_if(program.code().unwrap()));
    }

    #[test]
    fn test_missing_builtin_is_reported() {
        let mut program = Program::new(false);
        // Empty registry: every operator lookup fails
        let stmt = parse_statement("local X in X = 1 + 2 end", "t.oz", &HashSet::new()).unwrap();
        program.set_code(stmt);
        Namer::new().run(&mut program).unwrap();
        Desugar::new().run(&mut program).unwrap();
        assert!(program.has_errors());
        assert!(matches!(
            program.errors[0],
            CompileError::UnknownBuiltin { .. }
        ));
    }
}
