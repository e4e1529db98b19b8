//! Recursive descent parser for the Oz kernel subset.
//!
//! The parser consumes the token stream of [`crate::lexer`] and produces
//! the raw AST: variables are [`Expression::RawVariable`], declarations
//! are [`Statement::RawLocal`], and all sugar (operators, feature access,
//! functions, loops) is kept for the transform pipeline to lower.
//!
//! The two entry points mirror how the driver uses the parser:
//! [`parse_statement`] for whole programs and [`parse_expression`] for
//! functor files, both taking the conditional-compilation defines.
//!
//! # Example
//!
//! ```rust
//! use std::collections::HashSet;
//! use ozboot::parser::parse_statement;
//!
//! let stmt = parse_statement("local X in X = 1 end", "demo.oz", &HashSet::new());
//! assert!(stmt.is_ok());
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use crate::ast::{
    Constant, Expression, FunctorExport, FunctorImport, MatchClause, MatchExprClause, Pattern,
    PatternField, Pos, RecordField, Statement,
};
use crate::error::ParseError;
use crate::lexer::{apply_defines, tokenize, SpannedTok, Tok};

/// Parses a source file as a statement sequence.
pub fn parse_statement(
    source: &str,
    file: &str,
    defines: &HashSet<String>,
) -> Result<Statement, ParseError> {
    let tokens = apply_defines(tokenize(source, file)?, defines)?;
    let mut parser = Parser::new(tokens, file);
    let pos = parser.pos();
    let statements = parser.parse_statements()?;
    parser.expect_eof()?;
    Ok(Statement::sequence(statements, pos))
}

/// Parses a source file as a single expression (the functor form).
pub fn parse_expression(
    source: &str,
    file: &str,
    defines: &HashSet<String>,
) -> Result<Expression, ParseError> {
    let tokens = apply_defines(tokenize(source, file)?, defines)?;
    let mut parser = Parser::new(tokens, file);
    let expr = parser.parse_expr()?;
    parser.expect_eof()?;
    Ok(expr)
}

struct Parser {
    tokens: Vec<SpannedTok>,
    index: usize,
    eof_pos: Pos,
}

impl Parser {
    fn new(tokens: Vec<SpannedTok>, file: &str) -> Self {
        let eof_pos = tokens
            .last()
            .map(|t| t.pos.clone())
            .unwrap_or_else(|| Pos::new(Arc::from(file), 1, 1));
        Self {
            tokens,
            index: 0,
            eof_pos,
        }
    }

    // === token helpers ===

    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.index).map(|t| &t.tok)
    }

    fn peek_at(&self, offset: usize) -> Option<&Tok> {
        self.tokens.get(self.index + offset).map(|t| &t.tok)
    }

    fn pos(&self) -> Pos {
        self.tokens
            .get(self.index)
            .map(|t| t.pos.clone())
            .unwrap_or_else(|| self.eof_pos.clone())
    }

    fn advance(&mut self) -> Option<SpannedTok> {
        let tok = self.tokens.get(self.index).cloned();
        if tok.is_some() {
            self.index += 1;
        }
        tok
    }

    fn at(&self, tok: &Tok) -> bool {
        self.peek() == Some(tok)
    }

    fn eat(&mut self, tok: &Tok) -> bool {
        if self.at(tok) {
            self.index += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, tok: Tok, expected: &str) -> Result<Pos, ParseError> {
        if self.at(&tok) {
            let pos = self.pos();
            self.index += 1;
            Ok(pos)
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn expect_eof(&mut self) -> Result<(), ParseError> {
        if self.peek().is_none() {
            Ok(())
        } else {
            Err(self.unexpected("end of file"))
        }
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        match self.peek() {
            Some(tok) => ParseError::UnexpectedToken {
                expected: expected.to_string(),
                found: describe(tok),
                pos: self.pos(),
            },
            None => ParseError::UnexpectedEof {
                context: format!("expected {}", expected),
                pos: self.eof_pos.clone(),
            },
        }
    }

    /// True at any token that terminates a statement sequence.
    fn at_block_end(&self) -> bool {
        matches!(
            self.peek(),
            None | Some(
                Tok::End
                    | Tok::Else
                    | Tok::ElseIf
                    | Tok::Catch
                    | Tok::ClauseSep
                    | Tok::In
                    | Tok::Of
                    | Tok::Then
                    | Tok::Do
                    | Tok::Require
                    | Tok::Prepare
                    | Tok::Import
                    | Tok::Export
                    | Tok::Define
            )
        )
    }

    // === statements ===

    fn parse_statements(&mut self) -> Result<Vec<Statement>, ParseError> {
        let mut statements = Vec::new();
        while !self.at_block_end() {
            statements.push(self.parse_single_statement()?);
        }
        Ok(statements)
    }

    fn parse_statement_block(&mut self) -> Result<Statement, ParseError> {
        let pos = self.pos();
        let statements = self.parse_statements()?;
        if statements.is_empty() {
            Ok(Statement::Skip { pos })
        } else {
            Ok(Statement::sequence(statements, pos))
        }
    }

    fn parse_single_statement(&mut self) -> Result<Statement, ParseError> {
        let pos = self.pos();
        match self.peek() {
            Some(Tok::Local) => {
                self.advance();
                let decls = self.parse_decl_list()?;
                self.expect(Tok::In, "'in'")?;
                let body = self.parse_statement_block()?;
                self.expect(Tok::End, "'end'")?;
                Ok(Statement::RawLocal {
                    decls,
                    body: Box::new(body),
                    pos,
                })
            }
            Some(Tok::Skip) => {
                self.advance();
                Ok(Statement::Skip { pos })
            }
            Some(Tok::Thread) => {
                self.advance();
                let body = self.parse_statement_block()?;
                self.expect(Tok::End, "'end'")?;
                Ok(Statement::Thread {
                    body: Box::new(body),
                    pos,
                })
            }
            Some(Tok::If) => {
                self.advance();
                self.parse_if_chain(pos)
            }
            Some(Tok::Case) => {
                self.advance();
                self.parse_case_statement(pos)
            }
            Some(Tok::For) => {
                self.advance();
                let var = self.parse_variable()?;
                self.expect(Tok::In, "'in'")?;
                let from = self.parse_expr()?;
                self.expect(Tok::DotDot, "'..'")?;
                let to = self.parse_expr()?;
                self.expect(Tok::Do, "'do'")?;
                let body = self.parse_statement_block()?;
                self.expect(Tok::End, "'end'")?;
                Ok(Statement::For {
                    var,
                    from,
                    to,
                    body: Box::new(body),
                    pos,
                })
            }
            Some(Tok::Try) => {
                self.advance();
                let body = self.parse_statement_block()?;
                self.expect(Tok::Catch, "'catch'")?;
                let catch_pattern = self.parse_pattern()?;
                self.expect(Tok::Then, "'then'")?;
                let catch_body = self.parse_statement_block()?;
                self.expect(Tok::End, "'end'")?;
                Ok(Statement::Try {
                    body: Box::new(body),
                    catch_pattern,
                    catch_body: Box::new(catch_body),
                    pos,
                })
            }
            Some(Tok::Raise) => {
                self.advance();
                let value = self.parse_expr()?;
                self.expect(Tok::End, "'end'")?;
                Ok(Statement::Raise { value, pos })
            }
            Some(Tok::Proc) => {
                self.advance();
                let (name_var, proc) = self.parse_proc_tail(pos.clone(), true)?;
                Ok(Statement::Bind {
                    lhs: name_var.expect("named procedure statement"),
                    rhs: proc,
                    pos,
                })
            }
            Some(Tok::Fun) => {
                self.advance();
                let (name_var, fun) = self.parse_fun_tail(pos.clone(), true)?;
                Ok(Statement::Bind {
                    lhs: name_var.expect("named function statement"),
                    rhs: fun,
                    pos,
                })
            }
            Some(Tok::LBrace) => {
                let (callee, args) = self.parse_call_brace()?;
                Ok(Statement::Call { callee, args, pos })
            }
            Some(_) => {
                let lhs = self.parse_expr()?;
                self.expect(Tok::Eq, "'='")?;
                let rhs = self.parse_expr()?;
                Ok(Statement::Bind { lhs, rhs, pos })
            }
            None => Err(self.unexpected("a statement")),
        }
    }

    fn parse_if_chain(&mut self, pos: Pos) -> Result<Statement, ParseError> {
        let cond = self.parse_expr()?;
        self.expect(Tok::Then, "'then'")?;
        let then_body = self.parse_statement_block()?;
        let else_body = match self.peek() {
            Some(Tok::ElseIf) => {
                let elseif_pos = self.pos();
                self.advance();
                self.parse_if_chain(elseif_pos)?
            }
            Some(Tok::Else) => {
                self.advance();
                let body = self.parse_statement_block()?;
                self.expect(Tok::End, "'end'")?;
                body
            }
            _ => {
                let end_pos = self.expect(Tok::End, "'else' or 'end'")?;
                Statement::Skip { pos: end_pos }
            }
        };
        Ok(Statement::If {
            cond,
            then_body: Box::new(then_body),
            else_body: Box::new(else_body),
            pos,
        })
    }

    fn parse_case_statement(&mut self, pos: Pos) -> Result<Statement, ParseError> {
        let value = self.parse_expr()?;
        self.expect(Tok::Of, "'of'")?;
        let mut clauses = Vec::new();
        loop {
            let pattern = self.parse_pattern()?;
            self.expect(Tok::Then, "'then'")?;
            let body = self.parse_statement_block()?;
            clauses.push(MatchClause { pattern, body });
            if !self.eat(&Tok::ClauseSep) {
                break;
            }
        }
        let else_body = if self.eat(&Tok::Else) {
            let body = self.parse_statement_block()?;
            Some(Box::new(body))
        } else {
            None
        };
        self.expect(Tok::End, "'end'")?;
        Ok(Statement::Match {
            value,
            clauses,
            else_body,
            pos,
        })
    }

    fn parse_decl_list(&mut self) -> Result<Vec<Expression>, ParseError> {
        let mut decls = Vec::new();
        while let Some(Tok::Variable(_)) = self.peek() {
            decls.push(self.parse_variable()?);
        }
        if decls.is_empty() {
            return Err(self.unexpected("a variable declaration"));
        }
        Ok(decls)
    }

    fn parse_variable(&mut self) -> Result<Expression, ParseError> {
        let pos = self.pos();
        match self.advance().map(|t| t.tok) {
            Some(Tok::Variable(name)) => Ok(Expression::RawVariable { name, pos }),
            _ => Err(ParseError::UnexpectedToken {
                expected: "a variable".to_string(),
                found: "something else".to_string(),
                pos,
            }),
        }
    }

    /// Parses `{Callee Arg1 .. ArgN}` after peeking the opening brace.
    fn parse_call_brace(&mut self) -> Result<(Expression, Vec<Expression>), ParseError> {
        self.expect(Tok::LBrace, "'{'")?;
        let callee = self.parse_expr()?;
        let mut args = Vec::new();
        while !self.at(&Tok::RBrace) {
            if self.peek().is_none() {
                return Err(self.unexpected("'}'"));
            }
            args.push(self.parse_expr()?);
        }
        self.expect(Tok::RBrace, "'}'")?;
        Ok((callee, args))
    }

    /// Parses the tail of a `proc` after the keyword: `{Designator
    /// Formals} Body end`. With `statement` set, the designator must be a
    /// variable and the result is a binding of that variable.
    fn parse_proc_tail(
        &mut self,
        pos: Pos,
        statement: bool,
    ) -> Result<(Option<Expression>, Expression), ParseError> {
        self.expect(Tok::LBrace, "'{'")?;
        let (name_var, name) = self.parse_designator(statement)?;
        let formals = self.parse_formals()?;
        self.expect(Tok::RBrace, "'}'")?;
        let body = self.parse_statement_block()?;
        self.expect(Tok::End, "'end'")?;
        Ok((
            name_var,
            Expression::Proc {
                name,
                formals,
                body: Box::new(body),
                abs: None,
                pos,
            },
        ))
    }

    fn parse_fun_tail(
        &mut self,
        pos: Pos,
        statement: bool,
    ) -> Result<(Option<Expression>, Expression), ParseError> {
        self.expect(Tok::LBrace, "'{'")?;
        let (name_var, name) = self.parse_designator(statement)?;
        let formals = self.parse_formals()?;
        self.expect(Tok::RBrace, "'}'")?;
        let body = self.parse_body_expression()?;
        self.expect(Tok::End, "'end'")?;
        Ok((
            name_var,
            Expression::Fun {
                name,
                formals,
                body: Box::new(body),
                abs: None,
                pos,
            },
        ))
    }

    fn parse_designator(
        &mut self,
        statement: bool,
    ) -> Result<(Option<Expression>, String), ParseError> {
        match self.peek() {
            Some(Tok::Variable(name)) => {
                let name = name.clone();
                let var = self.parse_variable()?;
                Ok((Some(var), name))
            }
            Some(Tok::Dollar) if !statement => {
                self.advance();
                Ok((None, String::new()))
            }
            _ => Err(self.unexpected(if statement {
                "a procedure name"
            } else {
                "'$' or a procedure name"
            })),
        }
    }

    fn parse_formals(&mut self) -> Result<Vec<Expression>, ParseError> {
        let mut formals = Vec::new();
        while let Some(Tok::Variable(_)) = self.peek() {
            formals.push(self.parse_variable()?);
        }
        Ok(formals)
    }

    // === expressions ===

    fn parse_expr(&mut self) -> Result<Expression, ParseError> {
        self.parse_comparison()
    }

    fn parse_comparison(&mut self) -> Result<Expression, ParseError> {
        let lhs = self.parse_cons()?;
        let op = match self.peek() {
            Some(Tok::EqEq) => crate::ast::BinaryOp::Eq,
            Some(Tok::Ne) => crate::ast::BinaryOp::Ne,
            Some(Tok::Lt) => crate::ast::BinaryOp::Lt,
            Some(Tok::Le) => crate::ast::BinaryOp::Le,
            Some(Tok::Gt) => crate::ast::BinaryOp::Gt,
            Some(Tok::Ge) => crate::ast::BinaryOp::Ge,
            _ => return Ok(lhs),
        };
        let pos = self.pos();
        self.advance();
        let rhs = self.parse_cons()?;
        Ok(Expression::BinaryOp {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
            pos,
        })
    }

    fn parse_cons(&mut self) -> Result<Expression, ParseError> {
        let head = self.parse_hash()?;
        if self.at(&Tok::Bar) {
            let pos = self.pos();
            self.advance();
            let tail = self.parse_cons()?;
            Ok(cons_record(head, tail, pos))
        } else {
            Ok(head)
        }
    }

    fn parse_hash(&mut self) -> Result<Expression, ParseError> {
        let first = self.parse_additive()?;
        if !self.at(&Tok::Hash) {
            return Ok(first);
        }
        let pos = first.pos().clone();
        let mut parts = vec![first];
        while self.eat(&Tok::Hash) {
            parts.push(self.parse_additive()?);
        }
        let fields = parts
            .into_iter()
            .enumerate()
            .map(|(i, value)| RecordField {
                feature: Expression::int(i as i64 + 1, pos.clone()),
                value,
            })
            .collect();
        Ok(Expression::Record {
            label: Box::new(Expression::atom("#", pos.clone())),
            fields,
            pos,
        })
    }

    fn parse_additive(&mut self) -> Result<Expression, ParseError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Plus) => crate::ast::BinaryOp::Add,
                Some(Tok::Minus) => crate::ast::BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            let pos = self.pos();
            self.advance();
            let rhs = self.parse_multiplicative()?;
            lhs = Expression::BinaryOp {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                pos,
            };
        }
    }

    fn parse_multiplicative(&mut self) -> Result<Expression, ParseError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Tok::Star) => crate::ast::BinaryOp::Mul,
                Some(Tok::Slash) => crate::ast::BinaryOp::FloatDiv,
                Some(Tok::Div) => crate::ast::BinaryOp::Div,
                Some(Tok::Mod) => crate::ast::BinaryOp::Mod,
                _ => return Ok(lhs),
            };
            let pos = self.pos();
            self.advance();
            let rhs = self.parse_unary()?;
            lhs = Expression::BinaryOp {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
                pos,
            };
        }
    }

    fn parse_unary(&mut self) -> Result<Expression, ParseError> {
        if self.at(&Tok::Tilde) {
            let pos = self.pos();
            self.advance();
            // A literal right after `~` folds into a negative constant
            match self.peek() {
                Some(Tok::IntLit(n)) => {
                    let n = *n;
                    self.advance();
                    return Ok(Expression::int(-n, pos));
                }
                Some(Tok::FloatLit(f)) => {
                    let f = *f;
                    self.advance();
                    return Ok(Expression::Constant {
                        value: Constant::Float(-f),
                        pos,
                    });
                }
                _ => {}
            }
            let operand = self.parse_unary()?;
            return Ok(Expression::UnaryOp {
                op: crate::ast::UnaryOp::Neg,
                operand: Box::new(operand),
                pos,
            });
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> Result<Expression, ParseError> {
        let mut expr = self.parse_primary()?;
        while self.at(&Tok::Dot) {
            let pos = self.pos();
            self.advance();
            let feature = self.parse_feature_expr()?;
            expr = Expression::FeatureAccess {
                record: Box::new(expr),
                feature: Box::new(feature),
                pos,
            };
        }
        Ok(expr)
    }

    fn parse_feature_expr(&mut self) -> Result<Expression, ParseError> {
        let pos = self.pos();
        match self.peek() {
            Some(Tok::Atom(s)) => {
                let s = s.clone();
                self.advance();
                Ok(Expression::atom(s, pos))
            }
            Some(Tok::QuotedAtom(s)) => {
                let s = s.clone();
                self.advance();
                Ok(Expression::atom(s, pos))
            }
            Some(Tok::IntLit(n)) => {
                let n = *n;
                self.advance();
                Ok(Expression::int(n, pos))
            }
            Some(Tok::Variable(_)) => self.parse_variable(),
            Some(Tok::LParen) => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(expr)
            }
            _ => Err(self.unexpected("a feature")),
        }
    }

    fn parse_primary(&mut self) -> Result<Expression, ParseError> {
        let pos = self.pos();
        match self.peek() {
            Some(Tok::IntLit(n)) => {
                let n = *n;
                self.advance();
                Ok(Expression::int(n, pos))
            }
            Some(Tok::FloatLit(f)) => {
                let f = *f;
                self.advance();
                Ok(Expression::Constant {
                    value: Constant::Float(f),
                    pos,
                })
            }
            Some(Tok::True) => {
                self.advance();
                Ok(Expression::Constant {
                    value: Constant::Bool(true),
                    pos,
                })
            }
            Some(Tok::False) => {
                self.advance();
                Ok(Expression::Constant {
                    value: Constant::Bool(false),
                    pos,
                })
            }
            Some(Tok::Unit) => {
                self.advance();
                Ok(Expression::Constant {
                    value: Constant::Unit,
                    pos,
                })
            }
            Some(Tok::Atom(s)) => {
                let s = s.clone();
                self.advance();
                self.maybe_record(s, pos)
            }
            Some(Tok::QuotedAtom(s)) => {
                let s = s.clone();
                self.advance();
                self.maybe_record(s, pos)
            }
            Some(Tok::Variable(_)) => {
                let var = self.parse_variable()?;
                if self.at(&Tok::LParen) {
                    return Err(ParseError::InvalidSyntax {
                        message: "record label must be a literal".to_string(),
                        pos: self.pos(),
                    });
                }
                Ok(var)
            }
            Some(Tok::StringLit(s)) => {
                let s = s.clone();
                self.advance();
                Ok(string_to_list(&s, pos))
            }
            Some(Tok::LBracket) => {
                self.advance();
                let mut elements = Vec::new();
                while !self.at(&Tok::RBracket) {
                    if self.peek().is_none() {
                        return Err(self.unexpected("']'"));
                    }
                    elements.push(self.parse_expr()?);
                }
                self.expect(Tok::RBracket, "']'")?;
                Ok(list_to_conses(elements, pos))
            }
            Some(Tok::LParen) => {
                self.advance();
                let expr = self.parse_expr()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(expr)
            }
            Some(Tok::LBrace) => {
                let (callee, args) = self.parse_call_brace()?;
                Ok(Expression::Call {
                    callee: Box::new(callee),
                    args,
                    pos,
                })
            }
            Some(Tok::Local) => {
                self.advance();
                let decls = self.parse_decl_list()?;
                self.expect(Tok::In, "'in'")?;
                let result = self.parse_body_expression()?;
                self.expect(Tok::End, "'end'")?;
                match result {
                    // Merge into one scope when the body was already
                    // statements-then-result
                    Expression::Local {
                        decls: inner,
                        body,
                        result,
                        ..
                    } if inner.is_empty() => Ok(Expression::Local {
                        decls,
                        body,
                        result,
                        pos,
                    }),
                    other => Ok(Expression::Local {
                        decls,
                        body: None,
                        result: Box::new(other),
                        pos,
                    }),
                }
            }
            Some(Tok::If) => {
                self.advance();
                self.parse_if_expression(pos)
            }
            Some(Tok::Case) => {
                self.advance();
                self.parse_case_expression(pos)
            }
            Some(Tok::Proc) => {
                self.advance();
                let (_, proc) = self.parse_proc_tail(pos, false)?;
                Ok(proc)
            }
            Some(Tok::Fun) => {
                self.advance();
                let (_, fun) = self.parse_fun_tail(pos, false)?;
                Ok(fun)
            }
            Some(Tok::Functor) => {
                self.advance();
                self.parse_functor(pos)
            }
            Some(_) => Err(self.unexpected("an expression")),
            None => Err(self.unexpected("an expression")),
        }
    }

    fn maybe_record(&mut self, label: String, pos: Pos) -> Result<Expression, ParseError> {
        if !self.eat(&Tok::LParen) {
            return Ok(Expression::atom(label, pos));
        }
        let mut fields = Vec::new();
        let mut next_positional: i64 = 1;
        while !self.at(&Tok::RParen) {
            if self.peek().is_none() {
                return Err(self.unexpected("')'"));
            }
            let explicit = matches!(
                (self.peek(), self.peek_at(1)),
                (
                    Some(Tok::Atom(_) | Tok::QuotedAtom(_) | Tok::IntLit(_) | Tok::Variable(_)),
                    Some(Tok::Colon)
                )
            );
            if explicit {
                let feature = self.parse_feature_expr()?;
                self.expect(Tok::Colon, "':'")?;
                let value = self.parse_expr()?;
                fields.push(RecordField { feature, value });
            } else {
                let value = self.parse_expr()?;
                fields.push(RecordField {
                    feature: Expression::int(next_positional, value.pos().clone()),
                    value,
                });
                next_positional += 1;
            }
        }
        self.expect(Tok::RParen, "')'")?;
        Ok(Expression::Record {
            label: Box::new(Expression::atom(label, pos.clone())),
            fields,
            pos,
        })
    }

    fn parse_if_expression(&mut self, pos: Pos) -> Result<Expression, ParseError> {
        let cond = self.parse_expr()?;
        self.expect(Tok::Then, "'then'")?;
        let then_value = self.parse_body_expression()?;
        let else_value = match self.peek() {
            Some(Tok::ElseIf) => {
                let elseif_pos = self.pos();
                self.advance();
                self.parse_if_expression(elseif_pos)?
            }
            Some(Tok::Else) => {
                self.advance();
                let value = self.parse_body_expression()?;
                self.expect(Tok::End, "'end'")?;
                value
            }
            _ => return Err(self.unexpected("'else' (conditional expressions need one)")),
        };
        Ok(Expression::IfExpression {
            cond: Box::new(cond),
            then_value: Box::new(then_value),
            else_value: Box::new(else_value),
            pos,
        })
    }

    fn parse_case_expression(&mut self, pos: Pos) -> Result<Expression, ParseError> {
        let value = self.parse_expr()?;
        self.expect(Tok::Of, "'of'")?;
        let mut clauses = Vec::new();
        loop {
            let pattern = self.parse_pattern()?;
            self.expect(Tok::Then, "'then'")?;
            let value = self.parse_body_expression()?;
            clauses.push(MatchExprClause { pattern, value });
            if !self.eat(&Tok::ClauseSep) {
                break;
            }
        }
        let else_value = if self.eat(&Tok::Else) {
            Some(Box::new(self.parse_body_expression()?))
        } else {
            None
        };
        self.expect(Tok::End, "'end'")?;
        Ok(Expression::MatchExpression {
            value: Box::new(value),
            clauses,
            else_value,
            pos,
        })
    }

    /// Parses a body that ends in an expression, with optional statements
    /// before it: the body form of functions, conditional branches, and
    /// case arms in expression position.
    fn parse_body_expression(&mut self) -> Result<Expression, ParseError> {
        let pos = self.pos();
        let mut statements = Vec::new();
        loop {
            if self.at_block_end() {
                return Err(self.unexpected("an expression"));
            }
            match self.peek() {
                // Forms that are always statements
                Some(Tok::Skip | Tok::Thread | Tok::For | Tok::Try | Tok::Raise) => {
                    statements.push(self.parse_single_statement()?);
                }
                // proc/fun with a variable designator is a statement;
                // with `$` it is an expression
                Some(Tok::Proc | Tok::Fun)
                    if matches!(self.peek_at(2), Some(Tok::Variable(_))) =>
                {
                    statements.push(self.parse_single_statement()?);
                }
                _ => {
                    let expr = self.parse_expr()?;
                    if self.eat(&Tok::Eq) {
                        let rhs = self.parse_expr()?;
                        let bind_pos = expr.pos().clone();
                        statements.push(Statement::Bind {
                            lhs: expr,
                            rhs,
                            pos: bind_pos,
                        });
                    } else if self.at_block_end() {
                        return Ok(if statements.is_empty() {
                            expr
                        } else {
                            Expression::Local {
                                decls: Vec::new(),
                                body: Some(Box::new(Statement::sequence(statements, pos.clone()))),
                                result: Box::new(expr),
                                pos,
                            }
                        });
                    } else {
                        statements.push(expr_to_statement(expr)?);
                    }
                }
            }
        }
    }

    // === functors ===

    fn parse_functor(&mut self, pos: Pos) -> Result<Expression, ParseError> {
        let name = match self.peek() {
            Some(Tok::Variable(name)) => {
                let name = name.clone();
                self.advance();
                name
            }
            Some(Tok::Dollar) => {
                self.advance();
                String::new()
            }
            _ => String::new(),
        };

        let mut require = Vec::new();
        let mut prepare = None;
        let mut imports = Vec::new();
        let mut define = None;
        let mut exports = Vec::new();

        loop {
            match self.peek() {
                Some(Tok::Require) => {
                    self.advance();
                    require = self.parse_import_items()?;
                }
                Some(Tok::Prepare) => {
                    self.advance();
                    prepare = Some(Box::new(self.parse_statement_block()?));
                }
                Some(Tok::Import) => {
                    self.advance();
                    imports = self.parse_import_items()?;
                }
                Some(Tok::Export) => {
                    self.advance();
                    exports = self.parse_export_items()?;
                }
                Some(Tok::Define) => {
                    self.advance();
                    define = Some(Box::new(self.parse_statement_block()?));
                }
                Some(Tok::End) => {
                    self.advance();
                    break;
                }
                _ => return Err(self.unexpected("a functor section or 'end'")),
            }
        }

        Ok(Expression::Functor {
            name,
            require,
            prepare,
            imports,
            define,
            exports,
            abs: None,
            pos,
        })
    }

    fn parse_import_items(&mut self) -> Result<Vec<FunctorImport>, ParseError> {
        let mut items = Vec::new();
        while let Some(Tok::Variable(_)) = self.peek() {
            let pos = self.pos();
            let var = self.parse_variable()?;
            let url = if self.eat(&Tok::At) {
                let url_pos = self.pos();
                match self.advance().map(|t| t.tok) {
                    Some(Tok::QuotedAtom(s) | Tok::Atom(s) | Tok::StringLit(s)) => Some(s),
                    _ => {
                        return Err(ParseError::UnexpectedToken {
                            expected: "a module URL".to_string(),
                            found: "something else".to_string(),
                            pos: url_pos,
                        })
                    }
                }
            } else {
                None
            };
            items.push(FunctorImport { var, url, pos });
        }
        Ok(items)
    }

    fn parse_export_items(&mut self) -> Result<Vec<FunctorExport>, ParseError> {
        let mut items = Vec::new();
        loop {
            let pos = self.pos();
            match (self.peek(), self.peek_at(1)) {
                (Some(Tok::Atom(_) | Tok::QuotedAtom(_) | Tok::IntLit(_)), Some(Tok::Colon)) => {
                    let feature = self.parse_export_feature()?;
                    self.expect(Tok::Colon, "':'")?;
                    let value = self.parse_variable()?;
                    items.push(FunctorExport {
                        feature,
                        value,
                        pos,
                    });
                }
                (Some(Tok::Variable(name)), _) => {
                    let feature = Constant::Atom(default_export_feature(name));
                    let value = self.parse_variable()?;
                    items.push(FunctorExport {
                        feature,
                        value,
                        pos,
                    });
                }
                _ => break,
            }
        }
        Ok(items)
    }

    fn parse_export_feature(&mut self) -> Result<Constant, ParseError> {
        let pos = self.pos();
        match self.advance().map(|t| t.tok) {
            Some(Tok::Atom(s) | Tok::QuotedAtom(s)) => Ok(Constant::Atom(s)),
            Some(Tok::IntLit(n)) => Ok(Constant::Int(n)),
            _ => Err(ParseError::UnexpectedToken {
                expected: "an export feature".to_string(),
                found: "something else".to_string(),
                pos,
            }),
        }
    }

    // === patterns ===

    fn parse_pattern(&mut self) -> Result<Pattern, ParseError> {
        let head = self.parse_pattern_hash()?;
        if self.at(&Tok::Bar) {
            let pos = self.pos();
            self.advance();
            let tail = self.parse_pattern()?;
            Ok(cons_pattern(head, tail, pos))
        } else {
            Ok(head)
        }
    }

    fn parse_pattern_hash(&mut self) -> Result<Pattern, ParseError> {
        let first = self.parse_pattern_primary()?;
        if !self.at(&Tok::Hash) {
            return Ok(first);
        }
        let pos = first.pos().clone();
        let mut parts = vec![first];
        while self.eat(&Tok::Hash) {
            parts.push(self.parse_pattern_primary()?);
        }
        let fields = parts
            .into_iter()
            .enumerate()
            .map(|(i, pattern)| PatternField {
                feature: Constant::Int(i as i64 + 1),
                pattern,
            })
            .collect();
        Ok(Pattern::Record {
            label: Constant::Atom("#".into()),
            fields,
            open: false,
            pos,
        })
    }

    fn parse_pattern_primary(&mut self) -> Result<Pattern, ParseError> {
        let pos = self.pos();
        match self.peek() {
            Some(Tok::Underscore) => {
                self.advance();
                Ok(Pattern::Wildcard { pos })
            }
            Some(Tok::Variable(_)) => {
                let var = self.parse_variable()?;
                Ok(Pattern::Capture { var, pos })
            }
            Some(Tok::IntLit(n)) => {
                let n = *n;
                self.advance();
                Ok(Pattern::Literal {
                    value: Constant::Int(n),
                    pos,
                })
            }
            Some(Tok::FloatLit(f)) => {
                let f = *f;
                self.advance();
                Ok(Pattern::Literal {
                    value: Constant::Float(f),
                    pos,
                })
            }
            Some(Tok::Tilde) => {
                self.advance();
                match self.advance().map(|t| t.tok) {
                    Some(Tok::IntLit(n)) => Ok(Pattern::Literal {
                        value: Constant::Int(-n),
                        pos,
                    }),
                    Some(Tok::FloatLit(f)) => Ok(Pattern::Literal {
                        value: Constant::Float(-f),
                        pos,
                    }),
                    _ => Err(ParseError::InvalidSyntax {
                        message: "'~' in a pattern must precede a number".to_string(),
                        pos,
                    }),
                }
            }
            Some(Tok::True) => {
                self.advance();
                Ok(Pattern::Literal {
                    value: Constant::Bool(true),
                    pos,
                })
            }
            Some(Tok::False) => {
                self.advance();
                Ok(Pattern::Literal {
                    value: Constant::Bool(false),
                    pos,
                })
            }
            Some(Tok::Unit) => {
                self.advance();
                Ok(Pattern::Literal {
                    value: Constant::Unit,
                    pos,
                })
            }
            Some(Tok::Atom(s)) => {
                let s = s.clone();
                self.advance();
                self.maybe_record_pattern(s, pos)
            }
            Some(Tok::QuotedAtom(s)) => {
                let s = s.clone();
                self.advance();
                self.maybe_record_pattern(s, pos)
            }
            Some(Tok::LBracket) => {
                self.advance();
                let mut elements = Vec::new();
                while !self.at(&Tok::RBracket) {
                    if self.peek().is_none() {
                        return Err(self.unexpected("']'"));
                    }
                    elements.push(self.parse_pattern()?);
                }
                self.expect(Tok::RBracket, "']'")?;
                Ok(list_to_cons_patterns(elements, pos))
            }
            Some(Tok::LParen) => {
                self.advance();
                let pattern = self.parse_pattern()?;
                self.expect(Tok::RParen, "')'")?;
                Ok(pattern)
            }
            _ => Err(self.unexpected("a pattern")),
        }
    }

    fn maybe_record_pattern(&mut self, label: String, pos: Pos) -> Result<Pattern, ParseError> {
        if !self.eat(&Tok::LParen) {
            return Ok(Pattern::Literal {
                value: Constant::Atom(label),
                pos,
            });
        }
        let mut fields = Vec::new();
        let mut open = false;
        let mut next_positional: i64 = 1;
        while !self.at(&Tok::RParen) {
            if self.peek().is_none() {
                return Err(self.unexpected("')'"));
            }
            if self.eat(&Tok::Ellipsis) {
                open = true;
                break;
            }
            let explicit = matches!(
                (self.peek(), self.peek_at(1)),
                (
                    Some(Tok::Atom(_) | Tok::QuotedAtom(_) | Tok::IntLit(_)),
                    Some(Tok::Colon)
                )
            );
            if explicit {
                let feature = self.parse_pattern_feature()?;
                self.expect(Tok::Colon, "':'")?;
                let pattern = self.parse_pattern()?;
                fields.push(PatternField { feature, pattern });
            } else {
                let pattern = self.parse_pattern()?;
                fields.push(PatternField {
                    feature: Constant::Int(next_positional),
                    pattern,
                });
                next_positional += 1;
            }
        }
        self.expect(Tok::RParen, "')'")?;
        Ok(Pattern::Record {
            label: Constant::Atom(label),
            fields,
            open,
            pos,
        })
    }

    fn parse_pattern_feature(&mut self) -> Result<Constant, ParseError> {
        let pos = self.pos();
        match self.advance().map(|t| t.tok) {
            Some(Tok::Atom(s) | Tok::QuotedAtom(s)) => Ok(Constant::Atom(s)),
            Some(Tok::IntLit(n)) => Ok(Constant::Int(n)),
            _ => Err(ParseError::UnexpectedToken {
                expected: "a feature".to_string(),
                found: "something else".to_string(),
                pos,
            }),
        }
    }
}

fn expr_to_statement(expr: Expression) -> Result<Statement, ParseError> {
    match expr {
        Expression::Call { callee, args, pos } => Ok(Statement::Call {
            callee: *callee,
            args,
            pos,
        }),
        other => Err(ParseError::InvalidSyntax {
            message: "expected a statement".to_string(),
            pos: other.pos().clone(),
        }),
    }
}

fn cons_record(head: Expression, tail: Expression, pos: Pos) -> Expression {
    Expression::Record {
        label: Box::new(Expression::atom("|", pos.clone())),
        fields: vec![
            RecordField {
                feature: Expression::int(1, pos.clone()),
                value: head,
            },
            RecordField {
                feature: Expression::int(2, pos.clone()),
                value: tail,
            },
        ],
        pos,
    }
}

fn cons_pattern(head: Pattern, tail: Pattern, pos: Pos) -> Pattern {
    Pattern::Record {
        label: Constant::Atom("|".into()),
        fields: vec![
            PatternField {
                feature: Constant::Int(1),
                pattern: head,
            },
            PatternField {
                feature: Constant::Int(2),
                pattern: tail,
            },
        ],
        open: false,
        pos,
    }
}

fn list_to_conses(elements: Vec<Expression>, pos: Pos) -> Expression {
    let mut list = Expression::atom("nil", pos.clone());
    for element in elements.into_iter().rev() {
        list = cons_record(element, list, pos.clone());
    }
    list
}

fn list_to_cons_patterns(elements: Vec<Pattern>, pos: Pos) -> Pattern {
    let mut list = Pattern::Literal {
        value: Constant::Atom("nil".into()),
        pos: pos.clone(),
    };
    for element in elements.into_iter().rev() {
        list = cons_pattern(element, list, pos.clone());
    }
    list
}

fn string_to_list(s: &str, pos: Pos) -> Expression {
    let mut list = Expression::atom("nil", pos.clone());
    for ch in s.chars().rev() {
        list = cons_record(Expression::int(ch as i64, pos.clone()), list, pos.clone());
    }
    list
}

/// The feature a bare `export V` is exported under: the variable name
/// with its first letter lowercased.
fn default_export_feature(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn describe(tok: &Tok) -> String {
    match tok {
        Tok::Variable(name) => format!("variable '{}'", name),
        Tok::Atom(name) => format!("atom '{}'", name),
        Tok::QuotedAtom(name) => format!("atom '{}'", name),
        Tok::IntLit(n) => format!("integer {}", n),
        Tok::FloatLit(f) => format!("float {}", f),
        Tok::StringLit(_) => "a string".to_string(),
        Tok::Directive(name) => format!("directive '\\{}'", name),
        other => format!("'{:?}'", other),
    }
}
