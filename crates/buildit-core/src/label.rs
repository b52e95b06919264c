//! Label expressions restricting where a project may build.
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! expr := or
//! or   := and ("||" and)*
//! and  := not ("&&" not)*
//! not  := "!" not | atom
//! atom := LABEL | "(" expr ")"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LabelExpr {
    Atom(String),
    Not(Box<LabelExpr>),
    And(Box<LabelExpr>, Box<LabelExpr>),
    Or(Box<LabelExpr>, Box<LabelExpr>),
}

impl LabelExpr {
    pub fn parse(input: &str) -> Result<Self> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(Error::InvalidInput("empty label expression".to_string()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.or()?;
        if let Some(token) = parser.tokens.get(parser.pos) {
            return Err(Error::InvalidInput(format!(
                "unexpected {token:?} in label expression '{input}'"
            )));
        }
        Ok(expr)
    }

    /// Evaluate against the label set of an executor.
    pub fn matches(&self, labels: &BTreeSet<String>) -> bool {
        match self {
            LabelExpr::Atom(label) => labels.contains(label),
            LabelExpr::Not(inner) => !inner.matches(labels),
            LabelExpr::And(a, b) => a.matches(labels) && b.matches(labels),
            LabelExpr::Or(a, b) => a.matches(labels) || b.matches(labels),
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            LabelExpr::Or(..) => 0,
            LabelExpr::And(..) => 1,
            LabelExpr::Not(_) | LabelExpr::Atom(_) => 2,
        }
    }

    fn fmt_operand(&self, f: &mut fmt::Formatter<'_>, min: u8) -> fmt::Result {
        if self.precedence() < min {
            write!(f, "({self})")
        } else {
            write!(f, "{self}")
        }
    }
}

impl fmt::Display for LabelExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LabelExpr::Atom(label) => f.write_str(label),
            LabelExpr::Not(inner) => {
                f.write_str("!")?;
                inner.fmt_operand(f, 2)
            }
            LabelExpr::And(a, b) => {
                a.fmt_operand(f, 1)?;
                f.write_str(" && ")?;
                b.fmt_operand(f, 2)
            }
            LabelExpr::Or(a, b) => {
                a.fmt_operand(f, 0)?;
                f.write_str(" || ")?;
                b.fmt_operand(f, 1)
            }
        }
    }
}

impl TryFrom<String> for LabelExpr {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        LabelExpr::parse(&value)
    }
}

impl From<LabelExpr> for String {
    fn from(expr: LabelExpr) -> Self {
        expr.to_string()
    }
}

impl std::str::FromStr for LabelExpr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        LabelExpr::parse(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Label(String),
    And,
    Or,
    Not,
    Open,
    Close,
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::Open);
            }
            ')' => {
                chars.next();
                tokens.push(Token::Close);
            }
            '!' => {
                chars.next();
                tokens.push(Token::Not);
            }
            '&' | '|' => {
                chars.next();
                if chars.next() != Some(c) {
                    return Err(Error::InvalidInput(format!(
                        "expected '{c}{c}' in label expression '{input}'"
                    )));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
            }
            _ => {
                let mut label = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_whitespace() || matches!(c, '(' | ')' | '!' | '&' | '|') {
                        break;
                    }
                    label.push(c);
                    chars.next();
                }
                tokens.push(Token::Label(label));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn or(&mut self) -> Result<LabelExpr> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and()?;
            left = LabelExpr::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<LabelExpr> {
        let mut left = self.not()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.not()?;
            left = LabelExpr::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn not(&mut self) -> Result<LabelExpr> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(LabelExpr::Not(Box::new(self.not()?)));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<LabelExpr> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        match token {
            Some(Token::Label(label)) => Ok(LabelExpr::Atom(label)),
            Some(Token::Open) => {
                let inner = self.or()?;
                if self.peek() != Some(&Token::Close) {
                    return Err(Error::InvalidInput("unbalanced parenthesis".to_string()));
                }
                self.pos += 1;
                Ok(inner)
            }
            other => Err(Error::InvalidInput(format!(
                "expected a label, found {other:?}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_and_display_round_trip() {
        let expr = LabelExpr::parse("foo && bar").unwrap();
        assert_eq!(expr.to_string(), "foo && bar");
        assert_eq!(LabelExpr::parse(&expr.to_string()).unwrap(), expr);

        let grouped = LabelExpr::parse("(a || b) && !c").unwrap();
        assert_eq!(grouped.to_string(), "(a || b) && !c");
    }

    #[test]
    fn test_matches() {
        let expr = LabelExpr::parse("linux && (x64 || arm64) && !slow").unwrap();
        assert!(expr.matches(&labels(&["linux", "x64"])));
        assert!(!expr.matches(&labels(&["linux", "x64", "slow"])));
        assert!(!expr.matches(&labels(&["windows", "x64"])));
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(LabelExpr::parse("").is_err());
        assert!(LabelExpr::parse("a &").is_err());
        assert!(LabelExpr::parse("a & b").is_err());
        assert!(LabelExpr::parse("(a || b").is_err());
        assert!(LabelExpr::parse("a b").is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let expr = LabelExpr::parse("foo && bar").unwrap();
        let json = serde_json::to_string(&expr).unwrap();
        assert_eq!(json, "\"foo && bar\"");
        let back: LabelExpr = serde_json::from_str(&json).unwrap();
        assert_eq!(back, expr);
    }
}
