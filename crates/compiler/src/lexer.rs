//! Byte-stream scanner (spec §4.C). Consumes a source buffer (the ZIO
//! abstraction's role is filled by handing the lexer the whole buffer up
//! front rather than chunk-by-chunk; chunked input is assembled by the
//! embedding API before the lexer ever runs, per the Reader interface
//! expansion).

use aql_core::AqlError;
use bumpalo::collections::String as BumpString;
use bumpalo::Bump;

use crate::token::{Token, TokenKind};

pub struct Lexer<'src> {
    source_name: String,
    bytes: &'src [u8],
    pos: usize,
    line: u32,
    scratch: Bump,
}

impl<'src> Lexer<'src> {
    pub fn new(source_name: impl Into<String>, source: &'src str) -> Self {
        Lexer {
            source_name: source_name.into(),
            bytes: source.as_bytes(),
            pos: 0,
            line: 1,
            scratch: Bump::new(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn peek2(&self) -> Option<u8> {
        self.bytes.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        Some(c)
    }

    fn err(&self, message: impl Into<String>) -> AqlError {
        AqlError::syntax(self.source_name.clone(), self.line, "", message)
    }

    fn newline(&mut self) {
        let first = self.advance();
        debug_assert!(matches!(first, Some(b'\n') | Some(b'\r')));
        // \r\n and \n\r both count as a single newline (spec §4.C).
        if let (Some(b'\n'), Some(b'\r')) | (Some(b'\r'), Some(b'\n')) = (first, self.peek()) {
            self.pos += 1;
        }
        self.line += 1;
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<(), AqlError> {
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(0x0b) | Some(0x0c) => {
                    self.pos += 1;
                }
                Some(b'\n') | Some(b'\r') => self.newline(),
                Some(b'/') if self.peek2() == Some(b'/') => {
                    while !matches!(self.peek(), None | Some(b'\n') | Some(b'\r')) {
                        self.pos += 1;
                    }
                }
                Some(b'/') if self.peek2() == Some(b'*') => {
                    self.pos += 2;
                    loop {
                        match self.peek() {
                            None => return Err(self.err("unfinished long comment")),
                            Some(b'*') if self.peek2() == Some(b'/') => {
                                self.pos += 2;
                                break;
                            }
                            Some(b'\n') | Some(b'\r') => self.newline(),
                            Some(_) => self.pos += 1,
                        }
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn read_name(&mut self) -> TokenKind {
        self.scratch.reset();
        let mut buf = BumpString::new_in(&self.scratch);
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                buf.push(c as char);
                self.pos += 1;
            } else {
                break;
            }
        }
        TokenKind::keyword_or_name(buf.to_string())
    }

    fn read_numeral(&mut self) -> Result<TokenKind, AqlError> {
        let start = self.pos;
        if self.peek() == Some(b'0') && matches!(self.peek2(), Some(b'x') | Some(b'X')) {
            self.pos += 2;
            let digits_start = self.pos;
            while matches!(self.peek(), Some(c) if c.is_ascii_hexdigit()) {
                self.pos += 1;
            }
            if self.pos == digits_start {
                return Err(self.err("malformed number"));
            }
            let text = std::str::from_utf8(&self.bytes[digits_start..self.pos]).unwrap();
            // Overflow wraps: parse as u64 bit pattern, reinterpret as i64
            // (spec EXPANSION 4.C, matching `alex.c`'s hex numeral path).
            let mut value: u64 = 0;
            for c in text.chars() {
                value = value.wrapping_shl(4).wrapping_add(c.to_digit(16).unwrap() as u64);
            }
            return Ok(TokenKind::Int(value as i64));
        }

        let mut is_float = false;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        if self.peek() == Some(b'.') {
            is_float = true;
            self.pos += 1;
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        if matches!(self.peek(), Some(b'e') | Some(b'E')) {
            is_float = true;
            self.pos += 1;
            if matches!(self.peek(), Some(b'+') | Some(b'-')) {
                self.pos += 1;
            }
            if !matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                return Err(self.err("malformed number"));
            }
            while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
                self.pos += 1;
            }
        }
        // A numeral directly followed by another letter (`3.4.5`, `1abc`)
        // is malformed.
        if matches!(self.peek(), Some(c) if c.is_ascii_alphabetic() || c == b'.' || c == b'_') {
            return Err(self.err("malformed number"));
        }

        let text = std::str::from_utf8(&self.bytes[start..self.pos]).unwrap();
        if is_float {
            text.parse::<f64>().map(TokenKind::Float).map_err(|_| self.err("malformed number"))
        } else {
            match text.parse::<i64>() {
                Ok(i) => Ok(TokenKind::Int(i)),
                Err(_) => text.parse::<f64>().map(TokenKind::Float).map_err(|_| self.err("malformed number")),
            }
        }
    }

    fn read_string(&mut self, quote: u8) -> Result<TokenKind, AqlError> {
        self.scratch.reset();
        let mut buf = BumpString::new_in(&self.scratch);
        self.pos += 1; // opening quote
        loop {
            match self.advance() {
                None => return Err(self.err("unfinished string")),
                Some(b'\n') | Some(b'\r') => return Err(self.err("unfinished string")),
                Some(c) if c == quote => break,
                Some(b'\\') => {
                    let escaped = self.read_escape()?;
                    if let Some(c) = escaped {
                        buf.push(c as char);
                    }
                }
                Some(c) => buf.push(c as char),
            }
        }
        Ok(TokenKind::Str(buf.to_string()))
    }

    /// Returns `None` for `\<newline>`, which contributes no character but
    /// still consumes the newline (spec §4.C).
    fn read_escape(&mut self) -> Result<Option<u8>, AqlError> {
        match self.advance() {
            Some(b'a') => Ok(Some(0x07)),
            Some(b'b') => Ok(Some(0x08)),
            Some(b'f') => Ok(Some(0x0c)),
            Some(b'n') => Ok(Some(b'\n')),
            Some(b'r') => Ok(Some(b'\r')),
            Some(b't') => Ok(Some(b'\t')),
            Some(0x0b) => Ok(Some(0x0b)),
            Some(b'\\') => Ok(Some(b'\\')),
            Some(b'"') => Ok(Some(b'"')),
            Some(b'\'') => Ok(Some(b'\'')),
            Some(b'\n') | Some(b'\r') => {
                self.pos -= 1;
                self.newline();
                Ok(None)
            }
            Some(c) if c.is_ascii_digit() => {
                let mut value: u32 = (c - b'0') as u32;
                for _ in 0..2 {
                    match self.peek() {
                        Some(d) if d.is_ascii_digit() => {
                            value = value * 10 + (d - b'0') as u32;
                            self.pos += 1;
                        }
                        _ => break,
                    }
                }
                if value > 255 {
                    return Err(self.err("decimal escape too large"));
                }
                Ok(Some(value as u8))
            }
            None => Err(self.err("unfinished string")),
            Some(c) => Err(self.err(format!("invalid escape sequence '\\{}'", c as char))),
        }
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.pos += 1;
        kind
    }

    fn two(&mut self, kind: TokenKind) -> TokenKind {
        self.pos += 2;
        kind
    }

    fn three(&mut self, kind: TokenKind) -> TokenKind {
        self.pos += 3;
        kind
    }

    /// Scan and return the next token (spec §4.C `next()`).
    pub fn scan(&mut self) -> Result<Token, AqlError> {
        self.skip_whitespace_and_comments()?;
        let line = self.line;
        let c = match self.peek() {
            None => return Ok(Token::new(TokenKind::Eof, line)),
            Some(c) => c,
        };

        let kind = match c {
            b'A'..=b'Z' | b'a'..=b'z' | b'_' => self.read_name(),
            b'0'..=b'9' => self.read_numeral()?,
            b'"' | b'\'' => self.read_string(c)?,
            b'+' => self.single(TokenKind::Plus),
            b'-' if self.peek2() == Some(b'>') => self.two(TokenKind::Arrow),
            b'-' => self.single(TokenKind::Minus),
            b'*' if self.peek2() == Some(b'*') => self.two(TokenKind::Pow),
            b'*' => self.single(TokenKind::Star),
            b'/' if self.peek2() == Some(b'/') => self.two(TokenKind::IDiv),
            b'/' => self.single(TokenKind::Slash),
            b'%' => self.single(TokenKind::Percent),
            b'=' if self.peek2() == Some(b'=') => self.two(TokenKind::EqEq),
            b'=' => self.single(TokenKind::Assign),
            b'!' if self.peek2() == Some(b'=') => self.two(TokenKind::NotEq),
            b'!' => self.single(TokenKind::Bang),
            b'<' if self.peek2() == Some(b'=') => self.two(TokenKind::LtEq),
            b'<' if self.peek2() == Some(b'<') => self.two(TokenKind::Shl),
            b'<' => self.single(TokenKind::Lt),
            b'>' if self.peek2() == Some(b'=') => self.two(TokenKind::GtEq),
            b'>' if self.peek2() == Some(b'>') => self.two(TokenKind::Shr),
            b'>' => self.single(TokenKind::Gt),
            b'&' if self.peek2() == Some(b'&') => self.two(TokenKind::AndAnd),
            b'&' => self.single(TokenKind::Amp),
            b'|' if self.peek2() == Some(b'|') => self.two(TokenKind::OrOr),
            b'|' => self.single(TokenKind::Pipe),
            b'~' => self.single(TokenKind::Tilde),
            b'#' => self.single(TokenKind::Hash),
            b'?' if self.peek2() == Some(b'?') => self.two(TokenKind::NullCoal),
            b'?' => self.single(TokenKind::Question),
            b':' if self.peek2() == Some(b'=') => self.two(TokenKind::ColonEq),
            b':' if self.peek2() == Some(b':') => self.two(TokenKind::ColonColon),
            b':' => self.single(TokenKind::Colon),
            b'.' if self.peek2() == Some(b'.') && self.bytes.get(self.pos + 2) == Some(&b'.') => {
                self.three(TokenKind::DotDotDot)
            }
            b'.' if self.peek2() == Some(b'.') => self.two(TokenKind::DotDot),
            b'.' => self.single(TokenKind::Dot),
            b'(' => self.single(TokenKind::LParen),
            b')' => self.single(TokenKind::RParen),
            b'{' => self.single(TokenKind::LBrace),
            b'}' => self.single(TokenKind::RBrace),
            b'[' => self.single(TokenKind::LBracket),
            b']' => self.single(TokenKind::RBracket),
            b',' => self.single(TokenKind::Comma),
            b';' => self.single(TokenKind::Semicolon),
            other => return Err(self.err(format!("unexpected symbol near '{}'", other as char))),
        };
        Ok(Token::new(kind, line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_all(src: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new("test", src);
        let mut out = Vec::new();
        loop {
            let tok = lexer.scan().unwrap();
            let done = tok.kind == TokenKind::Eof;
            out.push(tok.kind);
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn skips_whitespace_and_line_comments() {
        let toks = scan_all("  // hello\n  42");
        assert_eq!(toks, vec![TokenKind::Int(42), TokenKind::Eof]);
    }

    #[test]
    fn block_comment_not_nested() {
        let toks = scan_all("/* a /* b */ 7");
        assert_eq!(toks, vec![TokenKind::Int(7), TokenKind::Eof]);
    }

    #[test]
    fn hex_integer() {
        let toks = scan_all("0xFF");
        assert_eq!(toks, vec![TokenKind::Int(255), TokenKind::Eof]);
    }

    #[test]
    fn hex_overflow_wraps() {
        let toks = scan_all("0xFFFFFFFFFFFFFFFF");
        assert_eq!(toks, vec![TokenKind::Int(-1), TokenKind::Eof]);
    }

    #[test]
    fn float_with_exponent() {
        let toks = scan_all("1.5e2");
        assert_eq!(toks, vec![TokenKind::Float(150.0), TokenKind::Eof]);
    }

    #[test]
    fn malformed_number_errors() {
        let mut lexer = Lexer::new("test", "3.4.5");
        assert!(lexer.scan().is_err());
    }

    #[test]
    fn string_escapes() {
        let toks = scan_all(r#""a\tb\65""#);
        assert_eq!(toks, vec![TokenKind::Str("a\tbA".to_string()), TokenKind::Eof]);
    }

    #[test]
    fn decimal_escape_too_large_errors() {
        let mut lexer = Lexer::new("test", r#""\999""#);
        assert!(lexer.scan().is_err());
    }

    #[test]
    fn unterminated_string_errors() {
        let mut lexer = Lexer::new("test", "\"abc");
        assert!(lexer.scan().is_err());
    }

    #[test]
    fn reserved_words_are_case_sensitive() {
        assert_eq!(scan_all("If")[0], TokenKind::Name("If".to_string()));
        assert_eq!(scan_all("if")[0], TokenKind::If);
    }

    #[test]
    fn multi_char_operators() {
        let toks = scan_all(":= // -> ?? :: .. ... ** && ||");
        assert_eq!(
            toks,
            vec![
                TokenKind::ColonEq,
                TokenKind::IDiv,
                TokenKind::Arrow,
                TokenKind::NullCoal,
                TokenKind::ColonColon,
                TokenKind::DotDot,
                TokenKind::DotDotDot,
                TokenKind::Pow,
                TokenKind::AndAnd,
                TokenKind::OrOr,
                TokenKind::Eof,
            ]
        );
    }
}
