//! SQL lexer

use veld_common::{VeldError, VeldResult};

use crate::token::{keyword, Position, Token, TokenType};

pub struct Lexer<'a> {
    source: &'a [u8],
    pos: usize,
    line: u32,
    column: u32,
}

impl<'a> Lexer<'a> {
    pub fn new(source: &'a str) -> Self {
        Self { source: source.as_bytes(), pos: 0, line: 1, column: 1 }
    }

    pub fn tokenize(mut self) -> VeldResult<Vec<Token>> {
        let mut tokens = Vec::new();
        loop {
            self.skip_whitespace_and_comments();
            let pos = self.position();
            let Some(c) = self.peek() else {
                tokens.push(Token::new(TokenType::Eof, pos));
                return Ok(tokens);
            };

            let ty = match c {
                b',' => self.single(TokenType::Comma),
                b'.' => self.single(TokenType::Dot),
                b';' => self.single(TokenType::Semicolon),
                b'(' => self.single(TokenType::LeftParen),
                b')' => self.single(TokenType::RightParen),
                b'*' => self.single(TokenType::Star),
                b'+' => self.single(TokenType::Plus),
                b'-' => self.single(TokenType::Minus),
                b'/' => self.single(TokenType::Slash),
                b'=' => self.single(TokenType::Eq),
                b'<' => {
                    self.advance();
                    match self.peek() {
                        Some(b'=') => self.single(TokenType::Leq),
                        Some(b'>') => self.single(TokenType::Neq),
                        _ => TokenType::Lt,
                    }
                }
                b'>' => {
                    self.advance();
                    if self.peek() == Some(b'=') {
                        self.single(TokenType::Geq)
                    } else {
                        TokenType::Gt
                    }
                }
                b'!' => {
                    self.advance();
                    if self.peek() == Some(b'=') {
                        self.single(TokenType::Neq)
                    } else {
                        return Err(VeldError::parse_error(format!(
                            "unexpected '!' at {pos}"
                        )));
                    }
                }
                b'\'' => self.string_literal(pos)?,
                b'"' => self.quoted_identifier(pos)?,
                b'0'..=b'9' => self.number(pos)?,
                c if c.is_ascii_alphabetic() || c == b'_' => self.identifier(),
                other => {
                    return Err(VeldError::parse_error(format!(
                        "unexpected character '{}' at {pos}",
                        other as char
                    )))
                }
            };
            tokens.push(Token::new(ty, pos));
        }
    }

    fn position(&self) -> Position {
        Position { line: self.line, column: self.column }
    }

    fn peek(&self) -> Option<u8> {
        self.source.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<u8> {
        self.source.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn single(&mut self, ty: TokenType) -> TokenType {
        self.advance();
        ty
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                Some(c) if c.is_ascii_whitespace() => {
                    self.advance();
                }
                Some(b'-') if self.peek_at(1) == Some(b'-') => {
                    while let Some(c) = self.advance() {
                        if c == b'\n' {
                            break;
                        }
                    }
                }
                _ => return,
            }
        }
    }

    fn string_literal(&mut self, pos: Position) -> VeldResult<TokenType> {
        self.advance(); // opening quote
        let mut out = String::new();
        loop {
            match self.advance() {
                None => {
                    return Err(VeldError::parse_error(format!(
                        "unterminated string starting at {pos}"
                    )))
                }
                Some(b'\'') => {
                    // '' escapes a quote.
                    if self.peek() == Some(b'\'') {
                        self.advance();
                        out.push('\'');
                    } else {
                        return Ok(TokenType::StringLiteral(out));
                    }
                }
                Some(c) => out.push(c as char),
            }
        }
    }

    fn quoted_identifier(&mut self, pos: Position) -> VeldResult<TokenType> {
        self.advance();
        let mut out = String::new();
        loop {
            match self.advance() {
                None => {
                    return Err(VeldError::parse_error(format!(
                        "unterminated quoted identifier starting at {pos}"
                    )))
                }
                Some(b'"') => return Ok(TokenType::Identifier(out)),
                Some(c) => out.push(c as char),
            }
        }
    }

    fn number(&mut self, pos: Position) -> VeldResult<TokenType> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.advance();
        }
        let mut float = false;
        if self.peek() == Some(b'.') && matches!(self.peek_at(1), Some(c) if c.is_ascii_digit()) {
            float = true;
            self.advance();
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.advance();
            }
        }
        let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap();
        if float {
            text.parse::<f64>()
                .map(TokenType::FloatLiteral)
                .map_err(|_| VeldError::parse_error(format!("bad numeric literal at {pos}")))
        } else {
            text.parse::<i64>()
                .map(TokenType::IntLiteral)
                .map_err(|_| VeldError::parse_error(format!("bad integer literal at {pos}")))
        }
    }

    fn identifier(&mut self) -> TokenType {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphanumeric() || c == b'_') {
            self.advance();
        }
        let text = std::str::from_utf8(&self.source[start..self.pos]).unwrap();
        keyword(text).unwrap_or_else(|| TokenType::Identifier(text.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn types(source: &str) -> Vec<TokenType> {
        Lexer::new(source).tokenize().unwrap().into_iter().map(|t| t.ty).collect()
    }

    #[test]
    fn test_basic_select() {
        assert_eq!(
            types("SELECT x FROM t;"),
            vec![
                TokenType::Select,
                TokenType::Identifier("x".into()),
                TokenType::From,
                TokenType::Identifier("t".into()),
                TokenType::Semicolon,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            types("< <= <> > >= = !="),
            vec![
                TokenType::Lt,
                TokenType::Leq,
                TokenType::Neq,
                TokenType::Gt,
                TokenType::Geq,
                TokenType::Eq,
                TokenType::Neq,
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            types("42 3.25 'it''s'"),
            vec![
                TokenType::IntLiteral(42),
                TokenType::FloatLiteral(3.25),
                TokenType::StringLiteral("it's".into()),
                TokenType::Eof,
            ]
        );
    }

    #[test]
    fn test_keywords_case_insensitive() {
        assert_eq!(
            types("select SeLeCt SELECT"),
            vec![TokenType::Select, TokenType::Select, TokenType::Select, TokenType::Eof]
        );
    }

    #[test]
    fn test_comments_skipped() {
        assert_eq!(
            types("SELECT -- everything here\n x"),
            vec![TokenType::Select, TokenType::Identifier("x".into()), TokenType::Eof]
        );
    }

    #[test]
    fn test_positions() {
        let tokens = Lexer::new("SELECT\n  x").tokenize().unwrap();
        assert_eq!(tokens[0].pos, Position { line: 1, column: 1 });
        assert_eq!(tokens[1].pos, Position { line: 2, column: 3 });
    }
}
