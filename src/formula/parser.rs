//! Recursive-descent parser producing the formula AST.
//!
//! Grammar, lowest precedence first:
//!
//! ```text
//! expr   := term (('+' | '-') term)*
//! term   := factor (('*' | '/') factor)*
//! factor := ('+' | '-') factor | power
//! power  := atom ('**' factor)?            // right-associative
//! atom   := NUMBER | IDENT | IDENT '(' args ')' | '(' expr ')'
//! ```
//!
//! The exponent binds tighter than unary minus on its left and accepts a
//! signed factor on its right, so `-2 ** 2 == -4` and `2 ** -1 == 0.5`.

use super::lexer::{tokenize, Spanned, Token};
use super::FormulaError;

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

/// A parsed formula expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Ident(String),
    Call(String, Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

/// Parse a formula string into an [`Expr`].
pub fn parse(input: &str) -> Result<Expr, FormulaError> {
    let tokens = tokenize(input)?;
    let mut parser = Parser {
        tokens,
        pos: 0,
        end: input.len(),
    };
    let expr = parser.expr()?;
    if let Some((token, at)) = parser.peek_spanned() {
        return Err(FormulaError::parse(
            at,
            format!("unexpected {}", token.describe()),
        ));
    }
    Ok(expr)
}

struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
    end: usize,
}

impl Parser {
    fn peek_spanned(&self) -> Option<(&Token, usize)> {
        self.tokens.get(self.pos).map(|(t, at)| (t, *at))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn bump(&mut self) -> Option<Spanned> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), FormulaError> {
        match self.bump() {
            Some((token, _)) if &token == expected => Ok(()),
            Some((token, at)) => Err(FormulaError::parse(
                at,
                format!("expected {what}, found {}", token.describe()),
            )),
            None => Err(FormulaError::parse(
                self.end,
                format!("expected {what}, found end of formula"),
            )),
        }
    }

    fn expr(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.bump();
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.factor()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => break,
            };
            self.bump();
            let rhs = self.factor()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn factor(&mut self) -> Result<Expr, FormulaError> {
        match self.peek() {
            Some(Token::Minus) => {
                self.bump();
                let inner = self.factor()?;
                Ok(Expr::Unary(UnaryOp::Neg, Box::new(inner)))
            }
            Some(Token::Plus) => {
                self.bump();
                self.factor()
            }
            _ => self.power(),
        }
    }

    fn power(&mut self) -> Result<Expr, FormulaError> {
        let base = self.atom()?;
        if matches!(self.peek(), Some(Token::DoubleStar)) {
            self.bump();
            let exponent = self.factor()?;
            return Ok(Expr::Binary(
                BinaryOp::Pow,
                Box::new(base),
                Box::new(exponent),
            ));
        }
        Ok(base)
    }

    fn atom(&mut self) -> Result<Expr, FormulaError> {
        match self.bump() {
            Some((Token::Number(value), _)) => Ok(Expr::Number(value)),
            Some((Token::Ident(name), _)) => {
                if matches!(self.peek(), Some(Token::LParen)) {
                    self.bump();
                    let args = self.args()?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Some((Token::LParen, _)) => {
                let inner = self.expr()?;
                self.expect(&Token::RParen, "`)`")?;
                Ok(inner)
            }
            Some((token, at)) => Err(FormulaError::parse(
                at,
                format!("expected a value, found {}", token.describe()),
            )),
            None => Err(FormulaError::parse(
                self.end,
                "expected a value, found end of formula",
            )),
        }
    }

    fn args(&mut self) -> Result<Vec<Expr>, FormulaError> {
        let mut args = Vec::new();
        if matches!(self.peek(), Some(Token::RParen)) {
            self.bump();
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            match self.bump() {
                Some((Token::Comma, _)) => {}
                Some((Token::RParen, _)) => break,
                Some((token, at)) => {
                    return Err(FormulaError::parse(
                        at,
                        format!("expected `,` or `)`, found {}", token.describe()),
                    ));
                }
                None => {
                    return Err(FormulaError::parse(
                        self.end,
                        "expected `,` or `)`, found end of formula",
                    ));
                }
            }
        }
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_precedence() {
        // 1 + 2 * 3 groups as 1 + (2 * 3)
        let expr = parse("1 + 2 * 3").unwrap();
        assert_eq!(
            expr,
            Expr::Binary(
                BinaryOp::Add,
                Box::new(Expr::Number(1.0)),
                Box::new(Expr::Binary(
                    BinaryOp::Mul,
                    Box::new(Expr::Number(2.0)),
                    Box::new(Expr::Number(3.0)),
                )),
            )
        );
    }

    #[test]
    fn test_parse_power_right_associative() {
        // 2 ** 3 ** 2 groups as 2 ** (3 ** 2)
        let expr = parse("2 ** 3 ** 2").unwrap();
        assert_eq!(
            expr,
            Expr::Binary(
                BinaryOp::Pow,
                Box::new(Expr::Number(2.0)),
                Box::new(Expr::Binary(
                    BinaryOp::Pow,
                    Box::new(Expr::Number(3.0)),
                    Box::new(Expr::Number(2.0)),
                )),
            )
        );
    }

    #[test]
    fn test_parse_unary_binds_looser_than_power() {
        // -2 ** 2 groups as -(2 ** 2)
        let expr = parse("-2 ** 2").unwrap();
        assert_eq!(
            expr,
            Expr::Unary(
                UnaryOp::Neg,
                Box::new(Expr::Binary(
                    BinaryOp::Pow,
                    Box::new(Expr::Number(2.0)),
                    Box::new(Expr::Number(2.0)),
                )),
            )
        );
    }

    #[test]
    fn test_parse_call_with_arguments() {
        let expr = parse("max(foo, 2 + 1)").unwrap();
        assert_eq!(
            expr,
            Expr::Call(
                "max".to_string(),
                vec![
                    Expr::Ident("foo".to_string()),
                    Expr::Binary(
                        BinaryOp::Add,
                        Box::new(Expr::Number(2.0)),
                        Box::new(Expr::Number(1.0)),
                    ),
                ],
            )
        );
    }

    #[test]
    fn test_parse_parentheses() {
        let expr = parse("(1 + 2) * 3").unwrap();
        assert_eq!(
            expr,
            Expr::Binary(
                BinaryOp::Mul,
                Box::new(Expr::Binary(
                    BinaryOp::Add,
                    Box::new(Expr::Number(1.0)),
                    Box::new(Expr::Number(2.0)),
                )),
                Box::new(Expr::Number(3.0)),
            )
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("").is_err());
        assert!(parse("1 +").is_err());
        assert!(parse("(1 + 2").is_err());
        assert!(parse("1 2").is_err());
        assert!(parse("foo(1,").is_err());
    }
}
