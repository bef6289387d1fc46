//! Expression tokenizer.

use std::iter::Peekable;
use std::str::CharIndices;

use super::ExpressionError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Integer(i64),
    Float(f64),
    /// Single-quoted string literal.
    Str(String),
    /// Bare identifier or keyword; keywords are resolved by the parser.
    Ident(String),
    /// Double-quoted identifier; never a keyword.
    QuotedIdent(String),
    LParen,
    RParen,
    Comma,
    Dot,
    Plus,
    Minus,
    Star,
    Slash,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    /// Byte offset of the first character.
    pub offset: usize,
}

/// True when `name` can be written without double quotes.
pub(crate) fn is_plain_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        && !is_reserved(name)
}

fn is_reserved(name: &str) -> bool {
    matches!(
        name.to_ascii_uppercase().as_str(),
        "AND" | "OR" | "NOT" | "IS" | "NULL" | "TRUE" | "FALSE" | "DATE"
    )
}

struct Lexer<'a> {
    source: &'a str,
    chars: Peekable<CharIndices<'a>>,
}

pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, ExpressionError> {
    let mut lexer = Lexer {
        source,
        chars: source.char_indices().peekable(),
    };
    let mut tokens = Vec::new();
    loop {
        let token = lexer.next_token()?;
        let is_eof = token.kind == TokenKind::Eof;
        tokens.push(token);
        if is_eof {
            return Ok(tokens);
        }
    }
}

impl Lexer<'_> {
    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, c)| c)
    }

    fn offset(&mut self) -> usize {
        self.chars.peek().map_or(self.source.len(), |&(i, _)| i)
    }

    fn bump_if(&mut self, expected: char) -> bool {
        if self.peek_char() == Some(expected) {
            self.chars.next();
            true
        } else {
            false
        }
    }

    fn next_token(&mut self) -> Result<Token, ExpressionError> {
        while self.peek_char().is_some_and(char::is_whitespace) {
            self.chars.next();
        }

        let offset = self.offset();
        let Some((_, c)) = self.chars.next() else {
            return Ok(Token {
                kind: TokenKind::Eof,
                offset,
            });
        };

        let kind = match c {
            '(' => TokenKind::LParen,
            ')' => TokenKind::RParen,
            ',' => TokenKind::Comma,
            '+' => TokenKind::Plus,
            '-' => TokenKind::Minus,
            '*' => TokenKind::Star,
            '/' => TokenKind::Slash,
            '=' => {
                self.bump_if('=');
                TokenKind::Eq
            }
            '!' => {
                if !self.bump_if('=') {
                    return Err(ExpressionError::new("expected '=' after '!'", offset));
                }
                TokenKind::Ne
            }
            '<' => {
                if self.bump_if('=') {
                    TokenKind::Le
                } else if self.bump_if('>') {
                    TokenKind::Ne
                } else {
                    TokenKind::Lt
                }
            }
            '>' => {
                if self.bump_if('=') {
                    TokenKind::Ge
                } else {
                    TokenKind::Gt
                }
            }
            '\'' => TokenKind::Str(self.quoted('\'', offset)?),
            '"' => TokenKind::QuotedIdent(self.quoted('"', offset)?),
            '.' if !self.peek_char().is_some_and(|c| c.is_ascii_digit()) => TokenKind::Dot,
            c if c.is_ascii_digit() || c == '.' => self.number(offset)?,
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut end = offset + c.len_utf8();
                while let Some(&(i, c)) = self.chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        end = i + c.len_utf8();
                        self.chars.next();
                    } else {
                        break;
                    }
                }
                TokenKind::Ident(self.source[offset..end].to_string())
            }
            other => {
                return Err(ExpressionError::new(
                    format!("unexpected character '{other}'"),
                    offset,
                ));
            }
        };

        Ok(Token { kind, offset })
    }

    /// Read up to the closing `quote`; a doubled quote is an escaped quote.
    fn quoted(&mut self, quote: char, start: usize) -> Result<String, ExpressionError> {
        let mut out = String::new();
        loop {
            match self.chars.next() {
                Some((_, c)) if c == quote => {
                    if self.bump_if(quote) {
                        out.push(quote);
                    } else {
                        return Ok(out);
                    }
                }
                Some((_, c)) => out.push(c),
                None => {
                    return Err(ExpressionError::new("unterminated quoted text", start));
                }
            }
        }
    }

    fn number(&mut self, start: usize) -> Result<TokenKind, ExpressionError> {
        let mut is_float = self.source[start..].starts_with('.');
        let mut end = start + 1;
        while let Some(&(i, c)) = self.chars.peek() {
            let accept = match c {
                '0'..='9' => true,
                '.' if !is_float => {
                    is_float = true;
                    true
                }
                'e' | 'E' => {
                    is_float = true;
                    self.chars.next();
                    end = i + 1;
                    if let Some(&(j, sign @ ('+' | '-'))) = self.chars.peek() {
                        self.chars.next();
                        end = j + sign.len_utf8();
                    }
                    continue;
                }
                _ => false,
            };
            if !accept {
                break;
            }
            self.chars.next();
            end = i + 1;
        }

        let text = &self.source[start..end];
        let invalid = || ExpressionError::new(format!("invalid number '{text}'"), start);
        if is_float {
            text.parse().map(TokenKind::Float).map_err(|_| invalid())
        } else {
            text.parse().map(TokenKind::Integer).map_err(|_| invalid())
        }
    }
}
