//! Name resolution.
//!
//! The namer walks the raw tree with a lexical scope stack and replaces
//! every `RawVariable` with a `Variable` carrying symbol identity. Each
//! declaring construct (a `local`, procedure formals, pattern captures,
//! functor sections) pushes a frame and mints one fresh symbol per
//! declared name.
//!
//! Procedures, functions, and functors are allocated their arena slot
//! here, so every declared symbol is placed into an owning abstraction as
//! soon as it exists.
//!
//! Unresolved references to names exported by the base environment are
//! rewritten to feature accesses on the base-environment variable; other
//! unresolved references and same-frame duplicates are recorded on the
//! program.

use std::collections::HashMap;

use crate::ast::{Constant, Expression, MatchClause, MatchExprClause, Pattern, Pos, Statement};
use crate::error::CompileError;
use crate::program::{AbsId, Program};
use crate::rewrite::{walk_expr, walk_pattern, walk_stmt, Rewrite};
use crate::symbol::SymbolId;
use crate::transform::{Pass, PassResult};

/// The name-resolution pass.
pub struct Namer;

impl Namer {
    /// Creates the pass.
    pub fn new() -> Self {
        Self
    }
}

impl Default for Namer {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for Namer {
    fn name(&self) -> &str {
        "namer"
    }

    fn run(&mut self, program: &mut Program) -> PassResult<()> {
        let code = program.take_code();
        let mut resolver = Resolver {
            program: &mut *program,
            frames: Vec::new(),
            abs_stack: vec![AbsId::top_level()],
        };
        let code = resolver.rewrite_stmt(code);
        program.set_code(code);
        Ok(())
    }
}

struct Frame {
    abs: AbsId,
    bindings: HashMap<String, SymbolId>,
}

struct Resolver<'a> {
    program: &'a mut Program,
    frames: Vec<Frame>,
    abs_stack: Vec<AbsId>,
}

impl Resolver<'_> {
    fn current_abs(&self) -> AbsId {
        *self.abs_stack.last().expect("abstraction stack is empty")
    }

    fn push_frame(&mut self) {
        self.frames.push(Frame {
            abs: self.current_abs(),
            bindings: HashMap::new(),
        });
    }

    fn pop_frame(&mut self) {
        self.frames.pop();
    }

    /// Declares a name in the innermost frame, minting a fresh symbol.
    fn declare(&mut self, name: &str, pos: &Pos) -> SymbolId {
        let frame = self.frames.last_mut().expect("no scope frame");
        if let Some(&existing) = frame.bindings.get(name) {
            self.program.report(CompileError::DuplicateDeclaration {
                name: name.to_string(),
                pos: pos.clone(),
            });
            return existing;
        }
        let abs = frame.abs;
        let symbol = self.program.symbols.fresh(name);
        self.program.symbols.place(symbol, abs);
        self.frames
            .last_mut()
            .expect("no scope frame")
            .bindings
            .insert(name.to_string(), symbol);
        symbol
    }

    /// Resolves a name, innermost frame first. Marks the symbol captured
    /// when the resolution crosses an abstraction boundary.
    fn resolve(&mut self, name: &str) -> Option<SymbolId> {
        let current = self.current_abs();
        for frame in self.frames.iter().rev() {
            if let Some(&symbol) = frame.bindings.get(name) {
                if frame.abs != current {
                    self.program.symbols.mark_captured(symbol);
                }
                return Some(symbol);
            }
        }
        None
    }

    fn declare_decls(&mut self, decls: Vec<Expression>) -> Vec<SymbolId> {
        decls
            .into_iter()
            .map(|decl| match decl {
                Expression::RawVariable { name, pos } => self.declare(&name, &pos),
                Expression::Variable { symbol, .. } => symbol,
                other => {
                    self.program.report(CompileError::Unsupported {
                        message: "declaration is not a variable".to_string(),
                        pos: other.pos().clone(),
                    });
                    self.program.symbols.fresh_synthetic()
                }
            })
            .collect()
    }

    /// Declares the captures of a pattern and resolves it.
    fn declare_pattern(&mut self, pattern: Pattern) -> Pattern {
        match pattern {
            Pattern::Capture { var, pos } => {
                let var = match var {
                    Expression::RawVariable { name, pos } => {
                        let symbol = self.declare(&name, &pos);
                        Expression::Variable { symbol, pos }
                    }
                    other => other,
                };
                Pattern::Capture { var, pos }
            }
            other => walk_pattern(self, other),
        }
    }

    /// Declares the formals of an abstraction, recording them in order.
    fn declare_formals(&mut self, formals: Vec<Expression>, abs: AbsId) -> Vec<Expression> {
        formals
            .into_iter()
            .map(|formal| match formal {
                Expression::RawVariable { name, pos } => {
                    let symbol = self.declare(&name, &pos);
                    self.program.symbols.mark_formal(symbol);
                    self.program.abstraction_mut(abs).formals.push(symbol);
                    Expression::Variable { symbol, pos }
                }
                other => {
                    self.program.report(CompileError::Unsupported {
                        message: "formal parameter is not a variable".to_string(),
                        pos: other.pos().clone(),
                    });
                    other
                }
            })
            .collect()
    }

    fn enter_abstraction(&mut self, name: &str, fallback: &str) -> AbsId {
        let label = if name.is_empty() { fallback } else { name };
        let abs = self.program.new_abstraction(label);
        self.abs_stack.push(abs);
        self.push_frame();
        abs
    }

    fn leave_abstraction(&mut self) {
        self.pop_frame();
        self.abs_stack.pop();
    }
}

/// Collects the names implicitly declared by top-level bindings of a
/// functor section body.
fn implicit_bind_targets(stmt: &Statement, out: &mut Vec<(String, Pos)>) {
    match stmt {
        Statement::Compound { statements, .. } => {
            for s in statements {
                implicit_bind_targets(s, out);
            }
        }
        Statement::Bind {
            lhs: Expression::RawVariable { name, pos },
            ..
        } => {
            if !out.iter().any(|(n, _)| n == name) {
                out.push((name.clone(), pos.clone()));
            }
        }
        _ => {}
    }
}

impl Rewrite for Resolver<'_> {
    fn rewrite_stmt(&mut self, stmt: Statement) -> Statement {
        match stmt {
            Statement::RawLocal { decls, body, pos } => {
                self.push_frame();
                let decls = self.declare_decls(decls);
                let body = Box::new(self.rewrite_stmt(*body));
                self.pop_frame();
                Statement::Local { decls, body, pos }
            }
            Statement::Match {
                value,
                clauses,
                else_body,
                pos,
            } => {
                let value = self.rewrite_expr(value);
                let clauses = clauses
                    .into_iter()
                    .map(|clause| {
                        self.push_frame();
                        let pattern = self.declare_pattern(clause.pattern);
                        let body = self.rewrite_stmt(clause.body);
                        self.pop_frame();
                        MatchClause { pattern, body }
                    })
                    .collect();
                let else_body = else_body.map(|s| Box::new(self.rewrite_stmt(*s)));
                Statement::Match {
                    value,
                    clauses,
                    else_body,
                    pos,
                }
            }
            Statement::Try {
                body,
                catch_pattern,
                catch_body,
                pos,
            } => {
                let body = Box::new(self.rewrite_stmt(*body));
                self.push_frame();
                let catch_pattern = self.declare_pattern(catch_pattern);
                let catch_body = Box::new(self.rewrite_stmt(*catch_body));
                self.pop_frame();
                Statement::Try {
                    body,
                    catch_pattern,
                    catch_body,
                    pos,
                }
            }
            Statement::For {
                var,
                from,
                to,
                body,
                pos,
            } => {
                // The bounds are evaluated outside the loop variable's scope
                let from = self.rewrite_expr(from);
                let to = self.rewrite_expr(to);
                self.push_frame();
                let var = match var {
                    Expression::RawVariable { name, pos } => {
                        let symbol = self.declare(&name, &pos);
                        Expression::Variable { symbol, pos }
                    }
                    other => other,
                };
                let body = Box::new(self.rewrite_stmt(*body));
                self.pop_frame();
                Statement::For {
                    var,
                    from,
                    to,
                    body,
                    pos,
                }
            }
            other => walk_stmt(self, other),
        }
    }

    fn rewrite_expr(&mut self, expr: Expression) -> Expression {
        match expr {
            Expression::RawVariable { name, pos } => {
                if let Some(symbol) = self.resolve(&name) {
                    return Expression::Variable { symbol, pos };
                }
                if !self.program.is_base_environment && self.program.is_base_declaration(&name) {
                    let base = self.program.base_env_symbol;
                    return Expression::FeatureAccess {
                        record: Box::new(Expression::Variable {
                            symbol: base,
                            pos: pos.clone(),
                        }),
                        feature: Box::new(Expression::Constant {
                            value: Constant::Atom(name),
                            pos: pos.clone(),
                        }),
                        pos,
                    };
                }
                self.program.report(CompileError::UnresolvedVariable {
                    name: name.clone(),
                    pos: pos.clone(),
                });
                Expression::RawVariable { name, pos }
            }
            Expression::Proc {
                name,
                formals,
                body,
                abs: _,
                pos,
            } => {
                let abs = self.enter_abstraction(&name, "<anonymous proc>");
                let formals = self.declare_formals(formals, abs);
                let body = Box::new(self.rewrite_stmt(*body));
                self.leave_abstraction();
                Expression::Proc {
                    name,
                    formals,
                    body,
                    abs: Some(abs),
                    pos,
                }
            }
            Expression::Fun {
                name,
                formals,
                body,
                abs: _,
                pos,
            } => {
                let abs = self.enter_abstraction(&name, "<anonymous fun>");
                let formals = self.declare_formals(formals, abs);
                let body = Box::new(self.rewrite_expr(*body));
                self.leave_abstraction();
                Expression::Fun {
                    name,
                    formals,
                    body,
                    abs: Some(abs),
                    pos,
                }
            }
            Expression::Local {
                decls,
                body,
                result,
                pos,
            } => {
                self.push_frame();
                let decls = self
                    .declare_decls(decls)
                    .into_iter()
                    .map(|symbol| Expression::Variable {
                        symbol,
                        pos: pos.clone(),
                    })
                    .collect();
                let body = body.map(|s| Box::new(self.rewrite_stmt(*s)));
                let result = Box::new(self.rewrite_expr(*result));
                self.pop_frame();
                Expression::Local {
                    decls,
                    body,
                    result,
                    pos,
                }
            }
            Expression::MatchExpression {
                value,
                clauses,
                else_value,
                pos,
            } => {
                let value = Box::new(self.rewrite_expr(*value));
                let clauses = clauses
                    .into_iter()
                    .map(|clause| {
                        self.push_frame();
                        let pattern = self.declare_pattern(clause.pattern);
                        let value = self.rewrite_expr(clause.value);
                        self.pop_frame();
                        MatchExprClause { pattern, value }
                    })
                    .collect();
                let else_value = else_value.map(|e| Box::new(self.rewrite_expr(*e)));
                Expression::MatchExpression {
                    value,
                    clauses,
                    else_value,
                    pos,
                }
            }
            Expression::Functor {
                name,
                require,
                prepare,
                imports,
                define,
                exports,
                abs: _,
                pos,
            } => {
                let abs = self.enter_abstraction(&name, "<functor>");

                let mut declare_imports = |this: &mut Self, items: Vec<crate::ast::FunctorImport>| {
                    items
                        .into_iter()
                        .map(|item| {
                            let var = match item.var {
                                Expression::RawVariable { name, pos } => {
                                    let symbol = this.declare(&name, &pos);
                                    Expression::Variable { symbol, pos }
                                }
                                other => other,
                            };
                            crate::ast::FunctorImport {
                                var,
                                url: item.url,
                                pos: item.pos,
                            }
                        })
                        .collect::<Vec<_>>()
                };
                let require = declare_imports(self, require);
                let imports = declare_imports(self, imports);

                // The prepare and define sections implicitly declare the
                // variables their top-level bindings define
                let mut implicit = Vec::new();
                if let Some(ref s) = prepare {
                    implicit_bind_targets(s, &mut implicit);
                }
                if let Some(ref s) = define {
                    implicit_bind_targets(s, &mut implicit);
                }
                for (name, decl_pos) in implicit {
                    self.declare(&name, &decl_pos);
                }

                let prepare = prepare.map(|s| Box::new(self.rewrite_stmt(*s)));
                let define = define.map(|s| Box::new(self.rewrite_stmt(*s)));
                let exports = exports
                    .into_iter()
                    .map(|e| crate::ast::FunctorExport {
                        feature: e.feature,
                        value: self.rewrite_expr(e.value),
                        pos: e.pos,
                    })
                    .collect();

                self.leave_abstraction();
                Expression::Functor {
                    name,
                    require,
                    prepare,
                    imports,
                    define,
                    exports,
                    abs: Some(abs),
                    pos,
                }
            }
            other => walk_expr(self, other),
        }
    }
}
