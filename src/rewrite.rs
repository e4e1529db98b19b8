//! Structure-preserving tree rewriting.
//!
//! Every pass is a transformation from one tree to a new tree. This module
//! provides the shared recursion: a [`Rewrite`] implementation overrides
//! the node shapes it cares about and delegates everything else to the
//! `walk_*` functions, which reconstruct a node from its rewritten
//! children while keeping its position.
//!
//! [`at_pos_stmt`] and [`at_pos_expr`] stamp a position onto a freshly
//! synthesized subtree so that diagnostics and generated code point at the
//! construct the subtree was lowered from.

use crate::ast::{
    Expression, FunctorExport, FunctorImport, MatchClause, MatchExprClause, Pattern, PatternField,
    Pos, RecordField, Statement,
};

/// A tree-to-tree transformation.
///
/// The default methods perform an identity rewrite; implementations
/// override the entry points for the nodes they transform and call back
/// into [`walk_stmt`] / [`walk_expr`] for the generic recursion.
pub trait Rewrite {
    /// Rewrites a statement.
    fn rewrite_stmt(&mut self, stmt: Statement) -> Statement {
        walk_stmt(self, stmt)
    }

    /// Rewrites an expression.
    fn rewrite_expr(&mut self, expr: Expression) -> Expression {
        walk_expr(self, expr)
    }

    /// Rewrites a pattern.
    fn rewrite_pattern(&mut self, pattern: Pattern) -> Pattern {
        walk_pattern(self, pattern)
    }
}

/// Reconstructs a statement from its rewritten children.
pub fn walk_stmt<R: Rewrite + ?Sized>(r: &mut R, stmt: Statement) -> Statement {
    match stmt {
        Statement::Compound { statements, pos } => Statement::Compound {
            statements: statements.into_iter().map(|s| r.rewrite_stmt(s)).collect(),
            pos,
        },
        Statement::RawLocal { decls, body, pos } => Statement::RawLocal {
            decls: decls.into_iter().map(|d| r.rewrite_expr(d)).collect(),
            body: Box::new(r.rewrite_stmt(*body)),
            pos,
        },
        Statement::Local { decls, body, pos } => Statement::Local {
            decls,
            body: Box::new(r.rewrite_stmt(*body)),
            pos,
        },
        Statement::Bind { lhs, rhs, pos } => Statement::Bind {
            lhs: r.rewrite_expr(lhs),
            rhs: r.rewrite_expr(rhs),
            pos,
        },
        Statement::Call { callee, args, pos } => Statement::Call {
            callee: r.rewrite_expr(callee),
            args: args.into_iter().map(|a| r.rewrite_expr(a)).collect(),
            pos,
        },
        Statement::If {
            cond,
            then_body,
            else_body,
            pos,
        } => Statement::If {
            cond: r.rewrite_expr(cond),
            then_body: Box::new(r.rewrite_stmt(*then_body)),
            else_body: Box::new(r.rewrite_stmt(*else_body)),
            pos,
        },
        Statement::Match {
            value,
            clauses,
            else_body,
            pos,
        } => Statement::Match {
            value: r.rewrite_expr(value),
            clauses: clauses
                .into_iter()
                .map(|c| MatchClause {
                    pattern: r.rewrite_pattern(c.pattern),
                    body: r.rewrite_stmt(c.body),
                })
                .collect(),
            else_body: else_body.map(|s| Box::new(r.rewrite_stmt(*s))),
            pos,
        },
        Statement::For {
            var,
            from,
            to,
            body,
            pos,
        } => Statement::For {
            var: r.rewrite_expr(var),
            from: r.rewrite_expr(from),
            to: r.rewrite_expr(to),
            body: Box::new(r.rewrite_stmt(*body)),
            pos,
        },
        Statement::Skip { pos } => Statement::Skip { pos },
        Statement::Thread { body, pos } => Statement::Thread {
            body: Box::new(r.rewrite_stmt(*body)),
            pos,
        },
        Statement::Try {
            body,
            catch_pattern,
            catch_body,
            pos,
        } => Statement::Try {
            body: Box::new(r.rewrite_stmt(*body)),
            catch_pattern: r.rewrite_pattern(catch_pattern),
            catch_body: Box::new(r.rewrite_stmt(*catch_body)),
            pos,
        },
        Statement::Raise { value, pos } => Statement::Raise {
            value: r.rewrite_expr(value),
            pos,
        },
    }
}

/// Reconstructs an expression from its rewritten children.
pub fn walk_expr<R: Rewrite + ?Sized>(r: &mut R, expr: Expression) -> Expression {
    match expr {
        Expression::RawVariable { .. }
        | Expression::Variable { .. }
        | Expression::Constant { .. } => expr,
        Expression::Record { label, fields, pos } => Expression::Record {
            label: Box::new(r.rewrite_expr(*label)),
            fields: fields
                .into_iter()
                .map(|f| RecordField {
                    feature: r.rewrite_expr(f.feature),
                    value: r.rewrite_expr(f.value),
                })
                .collect(),
            pos,
        },
        Expression::FeatureAccess {
            record,
            feature,
            pos,
        } => Expression::FeatureAccess {
            record: Box::new(r.rewrite_expr(*record)),
            feature: Box::new(r.rewrite_expr(*feature)),
            pos,
        },
        Expression::UnaryOp { op, operand, pos } => Expression::UnaryOp {
            op,
            operand: Box::new(r.rewrite_expr(*operand)),
            pos,
        },
        Expression::BinaryOp { op, lhs, rhs, pos } => Expression::BinaryOp {
            op,
            lhs: Box::new(r.rewrite_expr(*lhs)),
            rhs: Box::new(r.rewrite_expr(*rhs)),
            pos,
        },
        Expression::Call { callee, args, pos } => Expression::Call {
            callee: Box::new(r.rewrite_expr(*callee)),
            args: args.into_iter().map(|a| r.rewrite_expr(a)).collect(),
            pos,
        },
        Expression::Proc {
            name,
            formals,
            body,
            abs,
            pos,
        } => Expression::Proc {
            name,
            formals: formals.into_iter().map(|f| r.rewrite_expr(f)).collect(),
            body: Box::new(r.rewrite_stmt(*body)),
            abs,
            pos,
        },
        Expression::Fun {
            name,
            formals,
            body,
            abs,
            pos,
        } => Expression::Fun {
            name,
            formals: formals.into_iter().map(|f| r.rewrite_expr(f)).collect(),
            body: Box::new(r.rewrite_expr(*body)),
            abs,
            pos,
        },
        Expression::Local {
            decls,
            body,
            result,
            pos,
        } => Expression::Local {
            decls: decls.into_iter().map(|d| r.rewrite_expr(d)).collect(),
            body: body.map(|s| Box::new(r.rewrite_stmt(*s))),
            result: Box::new(r.rewrite_expr(*result)),
            pos,
        },
        Expression::IfExpression {
            cond,
            then_value,
            else_value,
            pos,
        } => Expression::IfExpression {
            cond: Box::new(r.rewrite_expr(*cond)),
            then_value: Box::new(r.rewrite_expr(*then_value)),
            else_value: Box::new(r.rewrite_expr(*else_value)),
            pos,
        },
        Expression::MatchExpression {
            value,
            clauses,
            else_value,
            pos,
        } => Expression::MatchExpression {
            value: Box::new(r.rewrite_expr(*value)),
            clauses: clauses
                .into_iter()
                .map(|c| MatchExprClause {
                    pattern: r.rewrite_pattern(c.pattern),
                    value: r.rewrite_expr(c.value),
                })
                .collect(),
            else_value: else_value.map(|e| Box::new(r.rewrite_expr(*e))),
            pos,
        },
        Expression::Functor {
            name,
            require,
            prepare,
            imports,
            define,
            exports,
            abs,
            pos,
        } => Expression::Functor {
            name,
            require: require
                .into_iter()
                .map(|i| FunctorImport {
                    var: r.rewrite_expr(i.var),
                    url: i.url,
                    pos: i.pos,
                })
                .collect(),
            prepare: prepare.map(|s| Box::new(r.rewrite_stmt(*s))),
            imports: imports
                .into_iter()
                .map(|i| FunctorImport {
                    var: r.rewrite_expr(i.var),
                    url: i.url,
                    pos: i.pos,
                })
                .collect(),
            define: define.map(|s| Box::new(r.rewrite_stmt(*s))),
            exports: exports
                .into_iter()
                .map(|e| FunctorExport {
                    feature: e.feature,
                    value: r.rewrite_expr(e.value),
                    pos: e.pos,
                })
                .collect(),
            abs,
            pos,
        },
        Expression::CreateAbstraction { abs, captured, pos } => Expression::CreateAbstraction {
            abs,
            captured: captured.into_iter().map(|c| r.rewrite_expr(c)).collect(),
            pos,
        },
    }
}

/// Reconstructs a pattern from its rewritten children.
pub fn walk_pattern<R: Rewrite + ?Sized>(r: &mut R, pattern: Pattern) -> Pattern {
    match pattern {
        Pattern::Wildcard { .. } | Pattern::Literal { .. } => pattern,
        Pattern::Capture { var, pos } => Pattern::Capture {
            var: r.rewrite_expr(var),
            pos,
        },
        Pattern::Record {
            label,
            fields,
            open,
            pos,
        } => Pattern::Record {
            label,
            fields: fields
                .into_iter()
                .map(|f| PatternField {
                    feature: f.feature,
                    pattern: r.rewrite_pattern(f.pattern),
                })
                .collect(),
            open,
            pos,
        },
    }
}

struct Stamp {
    pos: Pos,
}

impl Rewrite for Stamp {
    fn rewrite_stmt(&mut self, stmt: Statement) -> Statement {
        let mut stmt = walk_stmt(self, stmt);
        set_stmt_pos(&mut stmt, &self.pos);
        stmt
    }

    fn rewrite_expr(&mut self, expr: Expression) -> Expression {
        let mut expr = walk_expr(self, expr);
        set_expr_pos(&mut expr, &self.pos);
        expr
    }

    fn rewrite_pattern(&mut self, pattern: Pattern) -> Pattern {
        let mut pattern = walk_pattern(self, pattern);
        set_pattern_pos(&mut pattern, &self.pos);
        pattern
    }
}

/// Stamps a position onto every node of a synthesized statement.
pub fn at_pos_stmt(stmt: Statement, pos: &Pos) -> Statement {
    Stamp { pos: pos.clone() }.rewrite_stmt(stmt)
}

/// Stamps a position onto every node of a synthesized expression.
pub fn at_pos_expr(expr: Expression, pos: &Pos) -> Expression {
    Stamp { pos: pos.clone() }.rewrite_expr(expr)
}

fn set_stmt_pos(stmt: &mut Statement, new: &Pos) {
    let pos = match stmt {
        Statement::Compound { pos, .. }
        | Statement::RawLocal { pos, .. }
        | Statement::Local { pos, .. }
        | Statement::Bind { pos, .. }
        | Statement::Call { pos, .. }
        | Statement::If { pos, .. }
        | Statement::Match { pos, .. }
        | Statement::For { pos, .. }
        | Statement::Skip { pos }
        | Statement::Thread { pos, .. }
        | Statement::Try { pos, .. }
        | Statement::Raise { pos, .. } => pos,
    };
    *pos = new.clone();
}

fn set_expr_pos(expr: &mut Expression, new: &Pos) {
    let pos = match expr {
        Expression::RawVariable { pos, .. }
        | Expression::Variable { pos, .. }
        | Expression::Constant { pos, .. }
        | Expression::Record { pos, .. }
        | Expression::FeatureAccess { pos, .. }
        | Expression::UnaryOp { pos, .. }
        | Expression::BinaryOp { pos, .. }
        | Expression::Call { pos, .. }
        | Expression::Proc { pos, .. }
        | Expression::Fun { pos, .. }
        | Expression::Local { pos, .. }
        | Expression::IfExpression { pos, .. }
        | Expression::MatchExpression { pos, .. }
        | Expression::Functor { pos, .. }
        | Expression::CreateAbstraction { pos, .. } => pos,
    };
    *pos = new.clone();
}

fn set_pattern_pos(pattern: &mut Pattern, new: &Pos) {
    let pos = match pattern {
        Pattern::Wildcard { pos }
        | Pattern::Capture { pos, .. }
        | Pattern::Literal { pos, .. }
        | Pattern::Record { pos, .. } => pos,
    };
    *pos = new.clone();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Constant;

    struct Identity;
    impl Rewrite for Identity {}

    #[test]
    fn test_identity_rewrite_preserves_tree() {
        let pos = Pos::new("A.oz", 1, 1);
        let stmt = Statement::Bind {
            lhs: Expression::RawVariable {
                name: "X".into(),
                pos: pos.clone(),
            },
            rhs: Expression::int(42, pos.clone()),
            pos: pos.clone(),
        };
        let rewritten = Identity.rewrite_stmt(stmt.clone());
        assert_eq!(rewritten, stmt);
    }

    #[test]
    fn test_at_pos_stamps_whole_subtree() {
        let inner = Expression::Record {
            label: Box::new(Expression::atom("point", Pos::dummy())),
            fields: vec![RecordField {
                feature: Expression::int(1, Pos::dummy()),
                value: Expression::int(7, Pos::dummy()),
            }],
            pos: Pos::dummy(),
        };
        let pos = Pos::new("B.oz", 9, 3);
        let stamped = at_pos_expr(inner, &pos);
        assert_eq!(stamped.pos(), &pos);
        if let Expression::Record { label, fields, .. } = &stamped {
            assert_eq!(label.pos(), &pos);
            assert_eq!(fields[0].value.pos(), &pos);
        } else {
            panic!("expected record");
        }
    }

    #[test]
    fn test_walk_rebuilds_constants_unchanged() {
        let expr = Expression::Constant {
            value: Constant::Atom("foo".into()),
            pos: Pos::dummy(),
        };
        assert_eq!(Identity.rewrite_expr(expr.clone()), expr);
    }
}
