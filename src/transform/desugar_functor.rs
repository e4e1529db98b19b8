//! Functor lowering.
//!
//! A functor is sugar for a function from an import record to an export
//! record. This pass rewrites every `Functor` expression into the
//! equivalent `Fun`:
//!
//! ```text
//! functor import A B at Url export f:V define ... end
//! ```
//!
//! becomes
//!
//! ```text
//! fun {$ Imports}
//!    local A B ... in
//!       A = Imports.'A'
//!       B = Imports.'B'
//!       <prepare statements>
//!       <define statements>
//!       'export'(f: V)
//!    end
//! end
//! ```
//!
//! An import whose URL names a boot module known to the builtin registry
//! is bound to that module's synthetic export record instead of a field
//! of the import record, so later passes can resolve its features to
//! builtin constants.
//!
//! When compiling the base environment, the names of all exported
//! variables are recorded as base declarations.

use crate::ast::{Expression, FunctorImport, RecordField, Statement};
use crate::error::CompileError;
use crate::program::{AbsId, Program};
use crate::rewrite::{walk_expr, walk_stmt, Rewrite};
use crate::symbol::SymbolId;
use crate::transform::{Pass, PassResult};

/// The functor-lowering pass.
pub struct DesugarFunctor;

impl DesugarFunctor {
    /// Creates the pass.
    pub fn new() -> Self {
        Self
    }
}

impl Default for DesugarFunctor {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for DesugarFunctor {
    fn name(&self) -> &str {
        "desugar_functor"
    }

    fn run(&mut self, program: &mut Program) -> PassResult<()> {
        let code = program.take_code();
        let mut lowering = Lowering {
            program: &mut *program,
        };
        let code = lowering.rewrite_stmt(code);
        program.set_code(code);
        Ok(())
    }
}

struct Lowering<'a> {
    program: &'a mut Program,
}

impl Lowering<'_> {
    /// Lowers one import: a bind of the module variable, either to the
    /// synthetic export record of a known boot module or to a field of
    /// the import record.
    fn lower_import(
        &mut self,
        item: &FunctorImport,
        import_formal: SymbolId,
        binds: &mut Vec<Statement>,
    ) {
        let Some(symbol) = item.var.symbol() else {
            self.program.report(CompileError::MalformedFunctor {
                message: "import is not a resolved variable".to_string(),
                pos: item.pos.clone(),
            });
            return;
        };
        let pos = item.pos.clone();
        let var_name = self.program.symbols.name(symbol).to_string();

        if let Some(url) = item.url.as_deref() {
            if let Some(module) = url.strip_prefix("x-oz://boot/") {
                let module = module.to_string();
                match self.program.builtins.export_record(&module, &pos) {
                    Some(record) => {
                        binds.push(Statement::Bind {
                            lhs: Expression::var(symbol, pos.clone()),
                            rhs: record,
                            pos,
                        });
                        return;
                    }
                    None => {
                        self.program.report(CompileError::MalformedFunctor {
                            message: format!("unknown boot module '{}'", url),
                            pos: pos.clone(),
                        });
                        return;
                    }
                }
            }
        }

        // Ordinary import: bound by feature from the import record,
        // keyed by the module variable's name
        binds.push(Statement::Bind {
            lhs: Expression::var(symbol, pos.clone()),
            rhs: Expression::FeatureAccess {
                record: Box::new(Expression::var(import_formal, pos.clone())),
                feature: Box::new(Expression::atom(var_name, pos.clone())),
                pos: pos.clone(),
            },
            pos,
        });
    }
}

/// Collects the symbols bound at the top level of a functor section, the
/// implicitly declared variables of `prepare` and `define`.
fn bound_symbols(stmt: &Statement, out: &mut Vec<SymbolId>) {
    match stmt {
        Statement::Compound { statements, .. } => {
            for s in statements {
                bound_symbols(s, out);
            }
        }
        Statement::Bind { lhs, .. } => {
            if let Some(symbol) = lhs.symbol() {
                if !out.contains(&symbol) {
                    out.push(symbol);
                }
            }
        }
        _ => {}
    }
}

impl Rewrite for Lowering<'_> {
    fn rewrite_stmt(&mut self, stmt: Statement) -> Statement {
        walk_stmt(self, stmt)
    }

    fn rewrite_expr(&mut self, expr: Expression) -> Expression {
        let (name, require, prepare, imports, define, exports, abs, pos) = match expr {
            Expression::Functor {
                name,
                require,
                prepare,
                imports,
                define,
                exports,
                abs,
                pos,
            } => (name, require, prepare, imports, define, exports, abs, pos),
            other => return walk_expr(self, other),
        };

        let abs = abs.unwrap_or_else(AbsId::top_level);

        // Rewrite nested functors first
        let prepare = prepare.map(|s| Box::new(self.rewrite_stmt(*s)));
        let define = define.map(|s| Box::new(self.rewrite_stmt(*s)));

        // The single formal: the import record
        let import_formal = self.program.symbols.fresh_synthetic();
        self.program.symbols.mark_formal(import_formal);
        self.program.symbols.place(import_formal, abs);
        self.program.abstraction_mut(abs).formals.push(import_formal);

        // Scope of the lowered body: import variables plus the variables
        // the sections implicitly declare
        let mut decls: Vec<SymbolId> = Vec::new();
        for item in require.iter().chain(imports.iter()) {
            if let Some(symbol) = item.var.symbol() {
                decls.push(symbol);
            }
        }
        if let Some(ref s) = prepare {
            bound_symbols(s, &mut decls);
        }
        if let Some(ref s) = define {
            bound_symbols(s, &mut decls);
        }

        let mut body = Vec::new();
        for item in require.iter().chain(imports.iter()) {
            self.lower_import(item, import_formal, &mut body);
        }
        if let Some(s) = prepare {
            body.push(*s);
        }
        if let Some(s) = define {
            body.push(*s);
        }

        // Record base declarations when building the base environment:
        // the feature is the name user programs reference, and the atom
        // installed on the export record below
        if self.program.is_base_environment {
            for export in &exports {
                if let crate::ast::Constant::Atom(ref name) = export.feature {
                    let name = name.clone();
                    self.program.add_base_declaration(&name);
                }
            }
        }

        let export_record = Expression::Record {
            label: Box::new(Expression::atom("export", pos.clone())),
            fields: exports
                .into_iter()
                .map(|e| RecordField {
                    feature: Expression::Constant {
                        value: e.feature,
                        pos: e.pos.clone(),
                    },
                    value: e.value,
                })
                .collect(),
            pos: pos.clone(),
        };

        let decls = decls
            .into_iter()
            .map(|symbol| Expression::var(symbol, pos.clone()))
            .collect();

        let fun_body = Expression::Local {
            decls,
            body: if body.is_empty() {
                None
            } else {
                Some(Box::new(Statement::sequence(body, pos.clone())))
            },
            result: Box::new(export_record),
            pos: pos.clone(),
        };

        Expression::Fun {
            name,
            formals: vec![Expression::var(import_formal, pos.clone())],
            body: Box::new(fun_body),
            abs: Some(abs),
            pos,
        }
    }
}
