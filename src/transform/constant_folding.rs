//! Constant folding.
//!
//! Evaluates builtin calls whose operands are all constants, both in
//! expression position (`1 + 2` is already a `Number.'+'` call here) and
//! in statement position (where the folded value binds the out
//! parameter).
//!
//! Because variables are single-assignment, a binding of a variable to a
//! constant or to a record with constant features can be used wherever
//! the variable is read. The pass exploits this in two ways:
//!
//! - feature selection on a statically known record folds to the field
//!   value; this is what turns `Module.name` on a boot-module record
//!   into a builtin constant
//! - record features that are variables bound to constants are replaced
//!   by the constants, so the later record/tuple representation decision
//!   is made on literal features only
//!
//! Conditionals with a constant condition keep only the taken branch.

use std::collections::HashMap;

use crate::ast::{Constant, Expression, RecordField, Statement};
use crate::builtins::Builtin;
use crate::program::Program;
use crate::rewrite::{walk_expr, walk_stmt, Rewrite};
use crate::symbol::SymbolId;
use crate::transform::{Pass, PassResult};

/// The constant-folding pass.
pub struct ConstantFolding;

impl ConstantFolding {
    /// Creates the pass.
    pub fn new() -> Self {
        Self
    }
}

impl Default for ConstantFolding {
    fn default() -> Self {
        Self::new()
    }
}

impl Pass for ConstantFolding {
    fn name(&self) -> &str {
        "constant_folding"
    }

    fn run(&mut self, program: &mut Program) -> PassResult<()> {
        let code = program.take_code();
        let mut folder = Folder {
            env: HashMap::new(),
        };
        let code = folder.rewrite_stmt(code);
        program.set_code(code);
        Ok(())
    }
}

/// What a variable is statically known to be bound to.
#[derive(Debug, Clone)]
enum Known {
    Const(Constant),
    Record {
        fields: Vec<(Constant, Expression)>,
    },
}

struct Folder {
    env: HashMap<SymbolId, Known>,
}

impl Folder {
    fn known_const(&self, expr: &Expression) -> Option<Constant> {
        match expr {
            Expression::Constant { value, .. } => Some(value.clone()),
            Expression::Variable { symbol, .. } => match self.env.get(symbol) {
                Some(Known::Const(c)) => Some(c.clone()),
                _ => None,
            },
            _ => None,
        }
    }

    /// Resolves a feature selection on a statically known record. The
    /// substituted field value must itself be flat.
    fn known_field(&self, base: &Expression, feature: &Constant) -> Option<Expression> {
        let fields: Vec<(Constant, Expression)> = match base {
            Expression::Variable { symbol, .. } => match self.env.get(symbol) {
                Some(Known::Record { fields }) => fields.clone(),
                _ => return None,
            },
            Expression::Record { fields, .. } => fields
                .iter()
                .filter_map(|f| match &f.feature {
                    Expression::Constant { value, .. } => Some((value.clone(), f.value.clone())),
                    _ => None,
                })
                .collect(),
            _ => return None,
        };
        fields.into_iter().find_map(|(feat, value)| {
            if feat == *feature && value.is_flat() {
                Some(value)
            } else {
                None
            }
        })
    }

    /// Records what a binding statement teaches us about a variable.
    fn learn(&mut self, lhs: &Expression, rhs: &Expression) {
        let Some(symbol) = lhs.symbol() else {
            return;
        };
        match rhs {
            Expression::Constant { value, .. } => {
                self.env.insert(symbol, Known::Const(value.clone()));
            }
            Expression::Record { fields, .. } => {
                let mut known = Vec::with_capacity(fields.len());
                for field in fields {
                    let Expression::Constant { value: feat, .. } = &field.feature else {
                        return;
                    };
                    if field.value.is_flat() {
                        known.push((feat.clone(), field.value.clone()));
                    }
                }
                self.env.insert(symbol, Known::Record { fields: known });
            }
            _ => {}
        }
    }
}

impl Rewrite for Folder {
    fn rewrite_stmt(&mut self, stmt: Statement) -> Statement {
        match stmt {
            Statement::Bind { lhs, rhs, pos } => {
                let lhs = self.rewrite_expr(lhs);
                let rhs = self.rewrite_expr(rhs);
                self.learn(&lhs, &rhs);
                Statement::Bind { lhs, rhs, pos }
            }
            Statement::Call { callee, args, pos } => {
                let callee = self.rewrite_expr(callee);
                let args: Vec<Expression> =
                    args.into_iter().map(|a| self.rewrite_expr(a)).collect();

                // A test or arithmetic builtin whose in-arguments are all
                // constants folds into a binding of its out-argument
                if let Expression::Constant {
                    value: Constant::Builtin(ref builtin),
                    ..
                } = callee
                {
                    let last_is_out =
                        builtin.params().last() == Some(crate::builtins::ParamKind::Out);
                    if args.len() == builtin.arity() && args.len() >= 2 && last_is_out {
                        let ins: Option<Vec<Constant>> = args[..args.len() - 1]
                            .iter()
                            .map(|a| self.known_const(a))
                            .collect();
                        if let Some(ins) = ins {
                            if let Some(result) = eval_builtin(builtin, &ins) {
                                let out = args[args.len() - 1].clone();
                                let rhs = Expression::Constant {
                                    value: result,
                                    pos: pos.clone(),
                                };
                                self.learn(&out, &rhs);
                                return Statement::Bind {
                                    lhs: out,
                                    rhs,
                                    pos,
                                };
                            }
                        }
                    }
                }

                Statement::Call { callee, args, pos }
            }
            Statement::If {
                cond,
                then_body,
                else_body,
                pos,
            } => {
                let cond = self.rewrite_expr(cond);
                if let Some(Constant::Bool(b)) = self.known_const(&cond) {
                    return if b {
                        self.rewrite_stmt(*then_body)
                    } else {
                        self.rewrite_stmt(*else_body)
                    };
                }
                Statement::If {
                    cond,
                    then_body: Box::new(self.rewrite_stmt(*then_body)),
                    else_body: Box::new(self.rewrite_stmt(*else_body)),
                    pos,
                }
            }
            other => walk_stmt(self, other),
        }
    }

    fn rewrite_expr(&mut self, expr: Expression) -> Expression {
        let expr = walk_expr(self, expr);
        match expr {
            Expression::Call { callee, args, pos } => {
                if let Expression::Constant {
                    value: Constant::Builtin(ref builtin),
                    ..
                } = *callee
                {
                    // Feature selection on a known record
                    if builtin.module() == "Value" && builtin.name() == "." && args.len() == 2 {
                        if let Some(feature) = self.known_const(&args[1]) {
                            if let Some(value) = self.known_field(&args[0], &feature) {
                                return value;
                            }
                        }
                    }
                    // Pure computation on constants, with the out
                    // parameter still implicit in expression position
                    if args.len() + 1 == builtin.arity() {
                        let ins: Option<Vec<Constant>> =
                            args.iter().map(|a| self.known_const(a)).collect();
                        if let Some(ins) = ins {
                            if let Some(result) = eval_builtin(builtin, &ins) {
                                return Expression::Constant { value: result, pos };
                            }
                        }
                    }
                }
                Expression::Call { callee, args, pos }
            }
            Expression::Record { label, fields, pos } => {
                // Substitute constant-bound variables into features
                let fields = fields
                    .into_iter()
                    .map(|f| {
                        let feature = match self.known_const(&f.feature) {
                            Some(value) if value.is_feature() => Expression::Constant {
                                value,
                                pos: f.feature.pos().clone(),
                            },
                            _ => f.feature,
                        };
                        RecordField {
                            feature,
                            value: f.value,
                        }
                    })
                    .collect();
                Expression::Record { label, fields, pos }
            }
            other => other,
        }
    }
}

/// Evaluates a pure builtin over constant operands. Returns `None` for
/// anything outside the folding table (including division by zero, which
/// is left for the runtime to raise).
fn eval_builtin(builtin: &Builtin, args: &[Constant]) -> Option<Constant> {
    use Constant::{Bool, Float, Int};
    match (builtin.module(), builtin.name(), args) {
        ("Number", "+", [Int(a), Int(b)]) => Some(Int(a.wrapping_add(*b))),
        ("Number", "+", [Float(a), Float(b)]) => Some(Float(a + b)),
        ("Number", "-", [Int(a), Int(b)]) => Some(Int(a.wrapping_sub(*b))),
        ("Number", "-", [Float(a), Float(b)]) => Some(Float(a - b)),
        ("Number", "*", [Int(a), Int(b)]) => Some(Int(a.wrapping_mul(*b))),
        ("Number", "*", [Float(a), Float(b)]) => Some(Float(a * b)),
        ("Number", "~", [Int(a)]) => Some(Int(a.wrapping_neg())),
        ("Number", "~", [Float(a)]) => Some(Float(-a)),
        ("Int", "div", [Int(a), Int(b)]) if *b != 0 => Some(Int(a / b)),
        ("Int", "mod", [Int(a), Int(b)]) if *b != 0 => Some(Int(a % b)),
        ("Float", "/", [Float(a), Float(b)]) if *b != 0.0 => Some(Float(a / b)),
        ("Value", "==", [a, b]) => Some(Bool(a == b)),
        ("Value", "\\=", [a, b]) => Some(Bool(a != b)),
        ("Value", "<", [a, b]) => compare(a, b).map(|o| Bool(o.is_lt())),
        ("Value", "=<", [a, b]) => compare(a, b).map(|o| Bool(o.is_le())),
        ("Value", ">", [a, b]) => compare(a, b).map(|o| Bool(o.is_gt())),
        ("Value", ">=", [a, b]) => compare(a, b).map(|o| Bool(o.is_ge())),
        _ => None,
    }
}

fn compare(a: &Constant, b: &Constant) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Constant::Int(x), Constant::Int(y)) => Some(x.cmp(y)),
        (Constant::Float(x), Constant::Float(y)) => x.partial_cmp(y),
        (Constant::Atom(x), Constant::Atom(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builtins::test_registry;
    use crate::parser::parse_statement;
    use crate::transform::{Desugar, Namer, PatternMatcher};
    use std::collections::HashSet;

    fn fold(source: &str) -> Program {
        let mut program = Program::new(false);
        program.builtins = test_registry();
        let stmt = parse_statement(source, "test.oz", &HashSet::new()).unwrap();
        program.set_code(stmt);
        Namer::new().run(&mut program).unwrap();
        Desugar::new().run(&mut program).unwrap();
        PatternMatcher::new().run(&mut program).unwrap();
        assert!(!program.has_errors(), "{:?}", program.errors);
        ConstantFolding::new().run(&mut program).unwrap();
        program
    }

    fn find_bind_rhs<'a>(stmt: &'a Statement, name: &str, program: &Program) -> Option<&'a Expression> {
        match stmt {
            Statement::Compound { statements, .. } => {
                statements.iter().find_map(|s| find_bind_rhs(s, name, program))
            }
            Statement::Local { body, .. } => find_bind_rhs(body, name, program),
            Statement::If {
                then_body,
                else_body,
                ..
            } => find_bind_rhs(then_body, name, program)
                .or_else(|| find_bind_rhs(else_body, name, program)),
            Statement::Bind { lhs, rhs, .. } => match lhs.symbol() {
                Some(symbol) if program.symbols.name(symbol) == name => Some(rhs),
                _ => None,
            },
            _ => None,
        }
    }

    #[test]
    fn test_arithmetic_folds_to_constant() {
        let program = fold("local X in X = 1 + 2 * 3 end");
        let rhs = find_bind_rhs(program.code().unwrap(), "X", &program).unwrap();
        assert!(matches!(
            rhs,
            Expression::Constant {
                value: Constant::Int(7),
                ..
            }
        ));
    }

    #[test]
    fn test_comparison_folds_to_bool() {
        let program = fold("local X in X = 1 < 2 end");
        let rhs = find_bind_rhs(program.code().unwrap(), "X", &program).unwrap();
        assert!(matches!(
            rhs,
            Expression::Constant {
                value: Constant::Bool(true),
                ..
            }
        ));
    }

    #[test]
    fn test_constant_condition_selects_branch() {
        let program = fold("local X in if 1 < 2 then X = 1 else X = 2 end end");
        let code = program.code().unwrap();
        fn has_if(stmt: &Statement) -> bool {
            match stmt {
                Statement::If { .. } => true,
                Statement::Compound { statements, .. } => statements.iter().any(has_if),
                Statement::Local { body, .. } => has_if(body),
                _ => false,
            }
        }
        assert!(!has_if(code));
        let rhs = find_bind_rhs(code, "X", &program).unwrap();
        assert!(matches!(
            rhs,
            Expression::Constant {
                value: Constant::Int(1),
                ..
            }
        ));
    }

    #[test]
    fn test_dot_on_known_record_folds() {
        let program = fold("local M X in M = m(f:42) X = M.f end");
        let rhs = find_bind_rhs(program.code().unwrap(), "X", &program).unwrap();
        assert!(matches!(
            rhs,
            Expression::Constant {
                value: Constant::Int(42),
                ..
            }
        ));
    }

    #[test]
    fn test_division_by_zero_not_folded() {
        let program = fold("local X in X = 1 div 0 end");
        let rhs = find_bind_rhs(program.code().unwrap(), "X", &program);
        // The bind stays a call through the function-call convention, so
        // no constant appears for X
        assert!(rhs.is_none() || !matches!(rhs, Some(Expression::Constant { .. })));
    }

    #[test]
    fn test_record_feature_variable_substituted() {
        let program = fold("local F R in F = foo R = r(F:1) end");
        fn find_record(stmt: &Statement) -> Option<&Expression> {
            match stmt {
                Statement::Compound { statements, .. } => {
                    statements.iter().find_map(find_record)
                }
                Statement::Local { body, .. } => find_record(body),
                Statement::Bind {
                    rhs: rhs @ Expression::Record { .. },
                    ..
                } => Some(rhs),
                _ => None,
            }
        }
        let record = find_record(program.code().unwrap()).unwrap();
        match record {
            Expression::Record { fields, .. } => {
                assert!(matches!(
                    fields[0].feature,
                    Expression::Constant {
                        value: Constant::Atom(ref a),
                        ..
                    } if a == "foo"
                ));
            }
            other => panic!("expected record, got {:?}", other),
        }
    }
}
