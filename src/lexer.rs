//! Lexical analysis for Oz source text.
//!
//! The token grammar is defined with `logos`; [`tokenize`] attaches a
//! file/line/column [`Pos`] to every token, and [`apply_defines`]
//! evaluates the `\ifdef` family of conditional-compilation directives
//! against the set of symbols supplied on the command line.
//!
//! # Example
//!
//! ```rust
//! use ozboot::lexer::{tokenize, Tok};
//!
//! let tokens = tokenize("local X in {Show X} end", "demo.oz").unwrap();
//! assert_eq!(tokens[0].tok, Tok::Local);
//! assert_eq!(tokens[1].tok, Tok::Variable("X".to_string()));
//! ```

use logos::Logos;
use std::collections::HashSet;
use std::sync::Arc;

use crate::ast::Pos;
use crate::error::LexError;

/// One Oz token.
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r"%[^\n]*")]
pub enum Tok {
    // === Keywords ===
    /// `local`
    #[token("local")]
    Local,
    /// `in`
    #[token("in")]
    In,
    /// `end`
    #[token("end")]
    End,
    /// `proc`
    #[token("proc")]
    Proc,
    /// `fun`
    #[token("fun")]
    Fun,
    /// `functor`
    #[token("functor")]
    Functor,
    /// `if`
    #[token("if")]
    If,
    /// `then`
    #[token("then")]
    Then,
    /// `else`
    #[token("else")]
    Else,
    /// `elseif`
    #[token("elseif")]
    ElseIf,
    /// `case`
    #[token("case")]
    Case,
    /// `of`
    #[token("of")]
    Of,
    /// `skip`
    #[token("skip")]
    Skip,
    /// `thread`
    #[token("thread")]
    Thread,
    /// `try`
    #[token("try")]
    Try,
    /// `catch`
    #[token("catch")]
    Catch,
    /// `raise`
    #[token("raise")]
    Raise,
    /// `for`
    #[token("for")]
    For,
    /// `do`
    #[token("do")]
    Do,
    /// `require`
    #[token("require")]
    Require,
    /// `prepare`
    #[token("prepare")]
    Prepare,
    /// `import`
    #[token("import")]
    Import,
    /// `export`
    #[token("export")]
    Export,
    /// `define`
    #[token("define")]
    Define,
    /// `at`
    #[token("at")]
    At,
    /// `true`
    #[token("true")]
    True,
    /// `false`
    #[token("false")]
    False,
    /// `unit`
    #[token("unit")]
    Unit,
    /// `div`
    #[token("div")]
    Div,
    /// `mod`
    #[token("mod")]
    Mod,

    // === Punctuation ===
    /// `(`
    #[token("(")]
    LParen,
    /// `)`
    #[token(")")]
    RParen,
    /// `[`
    #[token("[")]
    LBracket,
    /// `]`
    #[token("]")]
    RBracket,
    /// `{`
    #[token("{")]
    LBrace,
    /// `}`
    #[token("}")]
    RBrace,
    /// Clause separator `[]`
    #[token("[]")]
    ClauseSep,
    /// Open-pattern tail `...`
    #[token("...")]
    Ellipsis,
    /// Range `..`
    #[token("..")]
    DotDot,
    /// Feature selection `.`
    #[token(".")]
    Dot,
    /// `==`
    #[token("==")]
    EqEq,
    /// `=<`
    #[token("=<")]
    Le,
    /// `=`
    #[token("=")]
    Eq,
    /// `\=`
    #[token("\\=")]
    Ne,
    /// `<`
    #[token("<")]
    Lt,
    /// `>=`
    #[token(">=")]
    Ge,
    /// `>`
    #[token(">")]
    Gt,
    /// `+`
    #[token("+")]
    Plus,
    /// `-`
    #[token("-")]
    Minus,
    /// `*`
    #[token("*")]
    Star,
    /// `/`
    #[token("/")]
    Slash,
    /// `:`
    #[token(":")]
    Colon,
    /// `#`
    #[token("#")]
    Hash,
    /// `|`
    #[token("|")]
    Bar,
    /// `$`
    #[token("$")]
    Dollar,
    /// `~`
    #[token("~")]
    Tilde,
    /// `_`
    #[token("_")]
    Underscore,

    // === Literals and identifiers ===
    /// A variable: capitalized identifier
    #[regex(r"[A-Z][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Variable(String),
    /// An atom: lowercase identifier
    #[regex(r"[a-z][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Atom(String),
    /// A quoted atom: `'any text'`
    #[regex(r"'(?:[^'\\\n]|\\.)*'", |lex| unescape(lex.slice()))]
    QuotedAtom(String),
    /// A float literal
    #[regex(r"[0-9]+\.[0-9]+", |lex| lex.slice().parse::<f64>().ok())]
    FloatLit(f64),
    /// An integer literal
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i64>().ok())]
    IntLit(i64),
    /// A string literal, sugar for a list of character codes
    #[regex(r#""(?:[^"\\\n]|\\.)*""#, |lex| unescape(lex.slice()))]
    StringLit(String),
    /// A `\name` conditional-compilation directive
    #[regex(r"\\[A-Za-z]+", |lex| lex.slice()[1..].to_string())]
    Directive(String),
}

fn unescape(quoted: &str) -> String {
    let inner = &quoted[1..quoted.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(ch) = chars.next() {
        if ch == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(ch);
        }
    }
    out
}

/// A token with its source position.
#[derive(Debug, Clone, PartialEq)]
pub struct SpannedTok {
    /// The token
    pub tok: Tok,
    /// Where it starts
    pub pos: Pos,
}

/// Maps byte offsets to line and column numbers.
struct LineIndex {
    line_starts: Vec<usize>,
}

impl LineIndex {
    fn new(source: &str) -> Self {
        let mut line_starts = vec![0];
        for (i, b) in source.bytes().enumerate() {
            if b == b'\n' {
                line_starts.push(i + 1);
            }
        }
        Self { line_starts }
    }

    fn locate(&self, offset: usize) -> (u32, u32) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        let column = offset - self.line_starts[line];
        (line as u32 + 1, column as u32 + 1)
    }
}

/// Tokenizes Oz source text, attaching positions.
pub fn tokenize(source: &str, file: &str) -> Result<Vec<SpannedTok>, LexError> {
    let file: Arc<str> = Arc::from(file);
    let index = LineIndex::new(source);
    let mut tokens = Vec::new();

    let mut lexer = Tok::lexer(source);
    while let Some(result) = lexer.next() {
        let span = lexer.span();
        let (line, column) = index.locate(span.start);
        let pos = Pos {
            file: file.clone(),
            line,
            column,
        };
        match result {
            Ok(tok) => tokens.push(SpannedTok { tok, pos }),
            Err(()) => {
                let slice = lexer.slice();
                let ch = slice.chars().next().unwrap_or('\0');
                return Err(if ch == '\'' || ch == '"' {
                    LexError::UnterminatedLiteral { pos }
                } else {
                    LexError::UnexpectedChar { ch, pos }
                });
            }
        }
    }
    Ok(tokens)
}

/// Evaluates the `\ifdef` / `\ifndef` / `\else` / `\endif` directives
/// against the supplied define set, dropping the tokens of inactive
/// regions and all directive tokens.
pub fn apply_defines(
    tokens: Vec<SpannedTok>,
    defines: &HashSet<String>,
) -> Result<Vec<SpannedTok>, LexError> {
    // Each frame: (this branch taken, any branch taken, opening pos)
    let mut stack: Vec<(bool, bool, Pos)> = Vec::new();
    let mut out = Vec::new();
    let mut iter = tokens.into_iter();

    while let Some(spanned) = iter.next() {
        let directive = match &spanned.tok {
            Tok::Directive(name) => name.clone(),
            _ => {
                if stack.iter().all(|(active, _, _)| *active) {
                    out.push(spanned);
                }
                continue;
            }
        };
        match directive.as_str() {
            "ifdef" | "ifndef" => {
                let sym = match iter.next() {
                    Some(SpannedTok {
                        tok: Tok::Variable(s) | Tok::Atom(s),
                        ..
                    }) => s,
                    _ => {
                        return Err(LexError::UnterminatedConditional {
                            pos: spanned.pos.clone(),
                        })
                    }
                };
                let defined = defines.contains(&sym);
                let active = if directive == "ifdef" { defined } else { !defined };
                stack.push((active, active, spanned.pos.clone()));
            }
            "else" => {
                let Some((_, taken, open)) = stack.pop() else {
                    return Err(LexError::DanglingConditional {
                        name: directive.clone(),
                        pos: spanned.pos.clone(),
                    });
                };
                stack.push((!taken, true, open));
            }
            "endif" => {
                if stack.pop().is_none() {
                    return Err(LexError::DanglingConditional {
                        name: directive.clone(),
                        pos: spanned.pos.clone(),
                    });
                }
            }
            _ => {
                return Err(LexError::UnknownDirective {
                    name: directive.clone(),
                    pos: spanned.pos.clone(),
                })
            }
        }
    }

    if let Some((_, _, pos)) = stack.pop() {
        return Err(LexError::UnterminatedConditional { pos });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(source: &str) -> Vec<Tok> {
        tokenize(source, "test.oz")
            .unwrap()
            .into_iter()
            .map(|s| s.tok)
            .collect()
    }

    #[test]
    fn test_keywords_and_variables() {
        assert_eq!(
            toks("local Xs in skip end"),
            vec![
                Tok::Local,
                Tok::Variable("Xs".into()),
                Tok::In,
                Tok::Skip,
                Tok::End,
            ]
        );
    }

    #[test]
    fn test_operators_longest_match() {
        assert_eq!(toks("=<"), vec![Tok::Le]);
        assert_eq!(toks("=="), vec![Tok::EqEq]);
        assert_eq!(toks("= <"), vec![Tok::Eq, Tok::Lt]);
        assert_eq!(toks("..."), vec![Tok::Ellipsis]);
        assert_eq!(toks(".."), vec![Tok::DotDot]);
        assert_eq!(toks("[]"), vec![Tok::ClauseSep]);
        assert_eq!(toks("[ ]"), vec![Tok::LBracket, Tok::RBracket]);
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            toks("42 3.25 'hello world' \"hi\" foo"),
            vec![
                Tok::IntLit(42),
                Tok::FloatLit(3.25),
                Tok::QuotedAtom("hello world".into()),
                Tok::StringLit("hi".into()),
                Tok::Atom("foo".into()),
            ]
        );
    }

    #[test]
    fn test_comments_are_skipped() {
        assert_eq!(
            toks("X % the rest is ignored\nY"),
            vec![Tok::Variable("X".into()), Tok::Variable("Y".into())]
        );
    }

    #[test]
    fn test_positions() {
        let tokens = tokenize("X\n  Y", "pos.oz").unwrap();
        assert_eq!((tokens[0].pos.line, tokens[0].pos.column), (1, 1));
        assert_eq!((tokens[1].pos.line, tokens[1].pos.column), (2, 3));
        assert_eq!(&*tokens[0].pos.file, "pos.oz");
    }

    #[test]
    fn test_unexpected_char() {
        let err = tokenize("X @ Y", "bad.oz").unwrap_err();
        assert!(matches!(err, LexError::UnexpectedChar { ch: '@', .. }));
    }

    #[test]
    fn test_ifdef_taken_and_skipped() {
        let mut defines = HashSet::new();
        defines.insert("DEBUG".to_string());

        let tokens = tokenize("\\ifdef DEBUG X \\else Y \\endif Z", "d.oz").unwrap();
        let kept: Vec<_> = apply_defines(tokens, &defines)
            .unwrap()
            .into_iter()
            .map(|s| s.tok)
            .collect();
        assert_eq!(
            kept,
            vec![Tok::Variable("X".into()), Tok::Variable("Z".into())]
        );

        let tokens = tokenize("\\ifdef DEBUG X \\else Y \\endif Z", "d.oz").unwrap();
        let kept: Vec<_> = apply_defines(tokens, &HashSet::new())
            .unwrap()
            .into_iter()
            .map(|s| s.tok)
            .collect();
        assert_eq!(
            kept,
            vec![Tok::Variable("Y".into()), Tok::Variable("Z".into())]
        );
    }

    #[test]
    fn test_ifndef_and_nesting() {
        let mut defines = HashSet::new();
        defines.insert("A".to_string());
        let source = "\\ifndef A X \\endif \\ifdef A \\ifdef B Y \\endif Z \\endif";
        let tokens = tokenize(source, "n.oz").unwrap();
        let kept: Vec<_> = apply_defines(tokens, &defines)
            .unwrap()
            .into_iter()
            .map(|s| s.tok)
            .collect();
        assert_eq!(kept, vec![Tok::Variable("Z".into())]);
    }

    #[test]
    fn test_dangling_endif() {
        let tokens = tokenize("\\endif", "d.oz").unwrap();
        let err = apply_defines(tokens, &HashSet::new()).unwrap_err();
        assert!(matches!(err, LexError::DanglingConditional { .. }));
    }

    #[test]
    fn test_unterminated_ifdef() {
        let tokens = tokenize("\\ifdef A X", "d.oz").unwrap();
        let err = apply_defines(tokens, &HashSet::new()).unwrap_err();
        assert!(matches!(err, LexError::UnterminatedConditional { .. }));
    }
}
