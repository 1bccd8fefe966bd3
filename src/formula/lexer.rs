//! Tokenizer for the formula grammar.

use super::FormulaError;

/// A single token together with its byte offset in the source string.
pub type Spanned = (Token, usize);

/// Tokens of the closed arithmetic grammar.
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    DoubleStar,
    LParen,
    RParen,
    Comma,
}

impl Token {
    /// Human-readable description for parse error messages.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Number(n) => format!("number `{n}`"),
            Self::Ident(name) => format!("identifier `{name}`"),
            Self::Plus => "`+`".to_string(),
            Self::Minus => "`-`".to_string(),
            Self::Star => "`*`".to_string(),
            Self::Slash => "`/`".to_string(),
            Self::DoubleStar => "`**`".to_string(),
            Self::LParen => "`(`".to_string(),
            Self::RParen => "`)`".to_string(),
            Self::Comma => "`,`".to_string(),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Tokenize a formula string.
///
/// Identifiers are ASCII `[A-Za-z_][A-Za-z0-9_]*`. Numbers are decimal with
/// an optional fraction and exponent.
pub fn tokenize(input: &str) -> Result<Vec<Spanned>, FormulaError> {
    let bytes = input.as_bytes();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < bytes.len() {
        let c = bytes[pos] as char;

        if c.is_ascii_whitespace() {
            pos += 1;
            continue;
        }

        let start = pos;
        match c {
            '+' => {
                tokens.push((Token::Plus, start));
                pos += 1;
            }
            '-' => {
                tokens.push((Token::Minus, start));
                pos += 1;
            }
            '*' => {
                if bytes.get(pos + 1) == Some(&b'*') {
                    tokens.push((Token::DoubleStar, start));
                    pos += 2;
                } else {
                    tokens.push((Token::Star, start));
                    pos += 1;
                }
            }
            '/' => {
                tokens.push((Token::Slash, start));
                pos += 1;
            }
            '(' => {
                tokens.push((Token::LParen, start));
                pos += 1;
            }
            ')' => {
                tokens.push((Token::RParen, start));
                pos += 1;
            }
            ',' => {
                tokens.push((Token::Comma, start));
                pos += 1;
            }
            '0'..='9' | '.' => {
                pos = scan_number(bytes, start)?;
                let text = &input[start..pos];
                let value: f64 = text
                    .parse()
                    .map_err(|_| FormulaError::parse(start, format!("invalid number `{text}`")))?;
                tokens.push((Token::Number(value), start));
            }
            _ if is_ident_start(c) => {
                pos += 1;
                while pos < bytes.len() && is_ident_continue(bytes[pos] as char) {
                    pos += 1;
                }
                tokens.push((Token::Ident(input[start..pos].to_string()), start));
            }
            _ => {
                return Err(FormulaError::parse(
                    start,
                    format!("unexpected character `{c}`"),
                ));
            }
        }
    }

    Ok(tokens)
}

/// Scan a numeric literal starting at `start`; returns the end offset.
fn scan_number(bytes: &[u8], start: usize) -> Result<usize, FormulaError> {
    let mut pos = start;
    let mut saw_digit = false;

    while pos < bytes.len() && bytes[pos].is_ascii_digit() {
        saw_digit = true;
        pos += 1;
    }
    if pos < bytes.len() && bytes[pos] == b'.' {
        pos += 1;
        while pos < bytes.len() && bytes[pos].is_ascii_digit() {
            saw_digit = true;
            pos += 1;
        }
    }
    if !saw_digit {
        return Err(FormulaError::parse(start, "expected digits"));
    }
    if pos < bytes.len() && (bytes[pos] == b'e' || bytes[pos] == b'E') {
        let mut exp = pos + 1;
        if exp < bytes.len() && (bytes[exp] == b'+' || bytes[exp] == b'-') {
            exp += 1;
        }
        if exp < bytes.len() && bytes[exp].is_ascii_digit() {
            pos = exp;
            while pos < bytes.len() && bytes[pos].is_ascii_digit() {
                pos += 1;
            }
        }
    }
    Ok(pos)
}
