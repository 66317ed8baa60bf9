//! Boolean expression grammar for entry/exit logic.
//!
//! ```text
//! expr       := or
//! or         := and (OR and)*
//! and        := unary (AND unary)*
//! unary      := NOT unary | primary
//! primary    := '(' expr ')'
//!             | ('crossover' | 'crossunder') '(' term ',' term ')'
//!             | term cmp term
//! term       := NUMBER | IDENT | IDENT '(' INTEGER ')'
//! cmp        := '>' | '<' | '>=' | '<=' | '==' | '!='
//! ```
//!
//! `IDENT '(' n ')'` is only valid for the derived-column forms
//! (`<col>_lag(n)`, `<col>_slope(n)`, `<col>_rollmean(n)`). Anything outside
//! the grammar, natural language included, fails at the offending token;
//! there is no fallback.

use serde::{Deserialize, Serialize};

use crate::indicators::derived::Transform;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Cmp {
        op: CmpOp,
        lhs: Term,
        rhs: Term,
    },
    /// `crossover(a, b)` / `crossunder(a, b)`.
    Cross {
        above: bool,
        a: Term,
        b: Term,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CmpOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Term {
    Number(f64),
    Column {
        name: String,
        transform: Option<Transform>,
    },
}

impl Term {
    pub fn column(name: &str) -> Term {
        Term::Column {
            name: name.to_string(),
            transform: None,
        }
    }
}

impl Expr {
    /// Every column reference in the tree, for resolution and warmup math.
    pub fn column_refs(&self) -> Vec<&Term> {
        fn walk<'a>(expr: &'a Expr, out: &mut Vec<&'a Term>) {
            let mut push = |t: &'a Term| {
                if matches!(t, Term::Column { .. }) {
                    out.push(t);
                }
            };
            match expr {
                Expr::And(l, r) | Expr::Or(l, r) => {
                    walk(l, out);
                    walk(r, out);
                }
                Expr::Not(inner) => walk(inner, out),
                Expr::Cmp { lhs, rhs, .. } => {
                    push(lhs);
                    push(rhs);
                }
                Expr::Cross { a, b, .. } => {
                    push(a);
                    push(b);
                }
            }
        }
        let mut out = Vec::new();
        walk(self, &mut out);
        out
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub position: usize,
    pub token: String,
    pub message: String,
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} at token `{}`", self.message, self.token)
    }
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Number(f64),
    Cmp(CmpOp),
    LParen,
    RParen,
    Comma,
}

struct Lexed {
    tok: Tok,
    pos: usize,
    text: String,
}

fn lex(input: &str) -> Result<Vec<Lexed>, ParseError> {
    let bytes = input.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        let tok = match c {
            '(' => {
                i += 1;
                Tok::LParen
            }
            ')' => {
                i += 1;
                Tok::RParen
            }
            ',' => {
                i += 1;
                Tok::Comma
            }
            '>' | '<' | '=' | '!' => {
                let two = input.get(i..i + 2).unwrap_or("");
                let (op, len) = match two {
                    ">=" => (CmpOp::Ge, 2),
                    "<=" => (CmpOp::Le, 2),
                    "==" => (CmpOp::Eq, 2),
                    "!=" => (CmpOp::Ne, 2),
                    _ => match c {
                        '>' => (CmpOp::Gt, 1),
                        '<' => (CmpOp::Lt, 1),
                        _ => {
                            return Err(ParseError {
                                position: i,
                                token: c.to_string(),
                                message: "unexpected character".into(),
                            })
                        }
                    },
                };
                i += len;
                Tok::Cmp(op)
            }
            _ if c.is_ascii_digit()
                || (c == '-' && bytes.get(i + 1).is_some_and(u8::is_ascii_digit)) =>
            {
                let mut j = i + 1;
                while j < bytes.len()
                    && ((bytes[j] as char).is_ascii_digit() || bytes[j] == b'.')
                {
                    j += 1;
                }
                let text = &input[i..j];
                let value: f64 = text.parse().map_err(|_| ParseError {
                    position: i,
                    token: text.to_string(),
                    message: "malformed number".into(),
                })?;
                i = j;
                Tok::Number(value)
            }
            _ if c.is_ascii_alphabetic() || c == '_' => {
                let mut j = i + 1;
                while j < bytes.len()
                    && ((bytes[j] as char).is_ascii_alphanumeric() || bytes[j] == b'_')
                {
                    j += 1;
                }
                let text = input[i..j].to_string();
                i = j;
                Tok::Ident(text)
            }
            _ => {
                return Err(ParseError {
                    position: i,
                    token: c.to_string(),
                    message: "unexpected character".into(),
                })
            }
        };
        out.push(Lexed {
            tok,
            pos: start,
            text: input[start..i].to_string(),
        });
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser {
    toks: Vec<Lexed>,
    idx: usize,
    input_len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Lexed> {
        self.toks.get(self.idx)
    }

    fn next(&mut self) -> Option<&Lexed> {
        let lexed = self.toks.get(self.idx);
        if lexed.is_some() {
            self.idx += 1;
        }
        lexed
    }

    fn err_here(&self, message: &str) -> ParseError {
        match self.toks.get(self.idx) {
            Some(lexed) => ParseError {
                position: lexed.pos,
                token: lexed.text.clone(),
                message: message.into(),
            },
            None => ParseError {
                position: self.input_len,
                token: "<end>".into(),
                message: message.into(),
            },
        }
    }

    fn expect(&mut self, want: &Tok, message: &str) -> Result<(), ParseError> {
        match self.peek() {
            Some(lexed) if lexed.tok == *want => {
                self.idx += 1;
                Ok(())
            }
            _ => Err(self.err_here(message)),
        }
    }

    fn keyword(&self) -> Option<String> {
        match self.peek() {
            Some(Lexed {
                tok: Tok::Ident(s), ..
            }) => Some(s.to_lowercase()),
            _ => None,
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_and()?;
        while self.keyword().as_deref() == Some("or") {
            self.idx += 1;
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        while self.keyword().as_deref() == Some("and") {
            self.idx += 1;
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.keyword().as_deref() == Some("not") {
            self.idx += 1;
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        if let Some(Lexed { tok: Tok::LParen, .. }) = self.peek() {
            self.idx += 1;
            let inner = self.parse_or()?;
            self.expect(&Tok::RParen, "expected `)`")?;
            return Ok(inner);
        }

        if let Some(keyword) = self.keyword() {
            if keyword == "crossover" || keyword == "crossunder" {
                self.idx += 1;
                self.expect(&Tok::LParen, "expected `(` after crossover/crossunder")?;
                let a = self.parse_term()?;
                self.expect(&Tok::Comma, "expected `,` between crossover arguments")?;
                let b = self.parse_term()?;
                self.expect(&Tok::RParen, "expected `)` after crossover arguments")?;
                return Ok(Expr::Cross {
                    above: keyword == "crossover",
                    a,
                    b,
                });
            }
        }

        let lhs = self.parse_term()?;
        let op = match self.peek() {
            Some(Lexed {
                tok: Tok::Cmp(op), ..
            }) => *op,
            _ => return Err(self.err_here("expected a comparison operator")),
        };
        self.idx += 1;
        let rhs = self.parse_term()?;
        Ok(Expr::Cmp { op, lhs, rhs })
    }

    fn parse_term(&mut self) -> Result<Term, ParseError> {
        match self.next().map(|l| (l.tok.clone(), l.pos, l.text.clone())) {
            Some((Tok::Number(value), _, _)) => Ok(Term::Number(value)),
            Some((Tok::Ident(name), pos, text)) => {
                // Reserved words cannot be column names.
                let lowered = name.to_lowercase();
                if matches!(lowered.as_str(), "and" | "or" | "not") {
                    return Err(ParseError {
                        position: pos,
                        token: text,
                        message: "expected a column or number".into(),
                    });
                }
                if let Some(Lexed { tok: Tok::LParen, .. }) = self.peek() {
                    return self.parse_derived_term(&name, pos, &text);
                }
                Ok(Term::column(&name))
            }
            Some((_, pos, text)) => Err(ParseError {
                position: pos,
                token: text,
                message: "expected a column or number".into(),
            }),
            None => Err(self.err_here("expected a column or number")),
        }
    }

    /// `<base>_lag(n)` / `<base>_slope(n)` / `<base>_rollmean(n)`.
    fn parse_derived_term(
        &mut self,
        name: &str,
        pos: usize,
        text: &str,
    ) -> Result<Term, ParseError> {
        let (base, make): (&str, fn(usize) -> Transform) =
            if let Some(base) = name.strip_suffix("_lag") {
                (base, Transform::Lag)
            } else if let Some(base) = name.strip_suffix("_slope") {
                (base, Transform::Slope)
            } else if let Some(base) = name.strip_suffix("_rollmean") {
                (base, Transform::RollMean)
            } else {
                return Err(ParseError {
                    position: pos,
                    token: text.to_string(),
                    message: "unknown function".into(),
                });
            };
        if base.is_empty() {
            return Err(ParseError {
                position: pos,
                token: text.to_string(),
                message: "unknown function".into(),
            });
        }

        self.expect(&Tok::LParen, "expected `(`")?;
        let n = match self.next().map(|l| (l.tok.clone(), l.pos, l.text.clone())) {
            Some((Tok::Number(value), _, _)) if value.fract() == 0.0 && value >= 1.0 => {
                value as usize
            }
            Some((_, p, t)) => {
                return Err(ParseError {
                    position: p,
                    token: t,
                    message: "expected a positive integer argument".into(),
                })
            }
            None => return Err(self.err_here("expected a positive integer argument")),
        };
        self.expect(&Tok::RParen, "expected `)`")?;

        Ok(Term::Column {
            name: base.to_string(),
            transform: Some(make(n)),
        })
    }
}

/// Parse an entry/exit expression. Any token outside the grammar fails with
/// its position — free-form text is rejected, never guessed at.
pub fn parse(input: &str) -> Result<Expr, ParseError> {
    let toks = lex(input)?;
    if toks.is_empty() {
        return Err(ParseError {
            position: 0,
            token: "<end>".into(),
            message: "empty expression".into(),
        });
    }
    let mut parser = Parser {
        toks,
        idx: 0,
        input_len: input.len(),
    };
    let expr = parser.parse_or()?;
    if parser.idx != parser.toks.len() {
        return Err(parser.err_here("unexpected trailing input"));
    }
    Ok(expr)
}
