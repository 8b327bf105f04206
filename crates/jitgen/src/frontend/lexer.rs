use std::rc::Rc;

use crate::{Error, Result};

/// Token kinds of the script language.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Keywords
    Break,
    Case,
    Catch,
    Const,
    Continue,
    Debugger,
    Default,
    Delete,
    Do,
    Else,
    False,
    Finally,
    For,
    Function,
    If,
    In,
    InstanceOf,
    New,
    Null,
    Return,
    Switch,
    This,
    Throw,
    True,
    Try,
    Typeof,
    Var,
    Void,
    While,
    With,

    // Literals
    Number(f64),
    Str(Rc<str>),
    Ident(Rc<str>),
    RegExp { pattern: Rc<str>, flags: Rc<str> },

    // Operators
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    PlusPlus,
    MinusMinus,
    Shl,
    Sar,
    Shr,
    Amp,
    Pipe,
    Caret,
    Bang,
    Tilde,
    AndAnd,
    OrOr,
    Question,
    Colon,
    Eq,
    EqEq,
    NotEq,
    EqEqEq,
    NotEqEq,
    Lt,
    Le,
    Gt,
    Ge,
    /// Compound assignment `op=`.
    AssignOp(CompoundOp),
    Dot,

    // Delimiters
    LParen,
    RParen,
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Comma,
    Semi,

    // Special
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompoundOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Sar,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
}

impl TokenKind {
    fn keyword(word: &str) -> Option<Self> {
        let kind = match word {
            "break" => Self::Break,
            "case" => Self::Case,
            "catch" => Self::Catch,
            "const" => Self::Const,
            "continue" => Self::Continue,
            "debugger" => Self::Debugger,
            "default" => Self::Default,
            "delete" => Self::Delete,
            "do" => Self::Do,
            "else" => Self::Else,
            "false" => Self::False,
            "finally" => Self::Finally,
            "for" => Self::For,
            "function" => Self::Function,
            "if" => Self::If,
            "in" => Self::In,
            "instanceof" => Self::InstanceOf,
            "new" => Self::New,
            "null" => Self::Null,
            "return" => Self::Return,
            "switch" => Self::Switch,
            "this" => Self::This,
            "throw" => Self::Throw,
            "true" => Self::True,
            "try" => Self::Try,
            "typeof" => Self::Typeof,
            "var" => Self::Var,
            "void" => Self::Void,
            "while" => Self::While,
            "with" => Self::With,
            _ => return None,
        };
        Some(kind)
    }

    /// Source text of keywords, for use as property names.
    #[must_use]
    pub fn keyword_text(&self) -> Option<&'static str> {
        let text = match self {
            Self::Break => "break",
            Self::Case => "case",
            Self::Catch => "catch",
            Self::Const => "const",
            Self::Continue => "continue",
            Self::Debugger => "debugger",
            Self::Default => "default",
            Self::Delete => "delete",
            Self::Do => "do",
            Self::Else => "else",
            Self::False => "false",
            Self::Finally => "finally",
            Self::For => "for",
            Self::Function => "function",
            Self::If => "if",
            Self::In => "in",
            Self::InstanceOf => "instanceof",
            Self::New => "new",
            Self::Null => "null",
            Self::Return => "return",
            Self::Switch => "switch",
            Self::This => "this",
            Self::Throw => "throw",
            Self::True => "true",
            Self::Try => "try",
            Self::Typeof => "typeof",
            Self::Var => "var",
            Self::Void => "void",
            Self::While => "while",
            Self::With => "with",
            _ => return None,
        };
        Some(text)
    }

    /// Whether a `/` after this token starts a regular expression.
    fn allows_regexp_after(&self) -> bool {
        !matches!(
            self,
            Self::Number(_)
                | Self::Str(_)
                | Self::Ident(_)
                | Self::RegExp { .. }
                | Self::RParen
                | Self::RBracket
                | Self::RBrace
                | Self::This
                | Self::True
                | Self::False
                | Self::Null
        )
    }
}

/// Source location information.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    pub line: usize,
    pub column: usize,
    /// Character offset from the start of the source.
    pub offset: u32,
}

impl Span {
    #[must_use]
    pub fn new(line: usize, column: usize, offset: u32) -> Self {
        Self {
            line,
            column,
            offset,
        }
    }
}

/// A token with its kind and location.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
    /// A line terminator separates this token from the previous one.
    pub newline_before: bool,
}

/// The lexer for script source code.
pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
    column: usize,
    offset: u32,
    newline_before: bool,
}

impl<'a> Lexer<'a> {
    #[must_use]
    pub fn new(source: &'a str) -> Self {
        Self {
            chars: source.chars().peekable(),
            line: 1,
            column: 1,
            offset: 0,
            newline_before: false,
        }
    }

    pub fn scan_tokens(&mut self) -> Result<Vec<Token>> {
        let mut tokens: Vec<Token> = Vec::new();
        loop {
            self.newline_before = false;
            self.skip_whitespace_and_comments()?;
            let span = Span::new(self.line, self.column, self.offset);
            let newline_before = self.newline_before;

            let Some(ch) = self.peek() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    span,
                    newline_before: true,
                });
                break;
            };

            let regexp_allowed = tokens
                .last()
                .is_none_or(|token| token.kind.allows_regexp_after());
            let kind = match ch {
                '(' => self.single(TokenKind::LParen),
                ')' => self.single(TokenKind::RParen),
                '{' => self.single(TokenKind::LBrace),
                '}' => self.single(TokenKind::RBrace),
                '[' => self.single(TokenKind::LBracket),
                ']' => self.single(TokenKind::RBracket),
                ',' => self.single(TokenKind::Comma),
                ';' => self.single(TokenKind::Semi),
                ':' => self.single(TokenKind::Colon),
                '?' => self.single(TokenKind::Question),
                '~' => self.single(TokenKind::Tilde),
                '.' => {
                    self.advance();
                    if self.peek().is_some_and(|c| c.is_ascii_digit()) {
                        self.scan_number(String::from("0."))?
                    } else {
                        TokenKind::Dot
                    }
                }
                '+' => {
                    self.advance();
                    if self.match_char('+') {
                        TokenKind::PlusPlus
                    } else {
                        self.compound_or(CompoundOp::Add, TokenKind::Plus)
                    }
                }
                '-' => {
                    self.advance();
                    if self.match_char('-') {
                        TokenKind::MinusMinus
                    } else {
                        self.compound_or(CompoundOp::Sub, TokenKind::Minus)
                    }
                }
                '*' => {
                    self.advance();
                    self.compound_or(CompoundOp::Mul, TokenKind::Star)
                }
                '%' => {
                    self.advance();
                    self.compound_or(CompoundOp::Mod, TokenKind::Percent)
                }
                '^' => {
                    self.advance();
                    self.compound_or(CompoundOp::BitXor, TokenKind::Caret)
                }
                '/' if regexp_allowed => self.scan_regexp()?,
                '/' => {
                    self.advance();
                    self.compound_or(CompoundOp::Div, TokenKind::Slash)
                }
                '&' => {
                    self.advance();
                    if self.match_char('&') {
                        TokenKind::AndAnd
                    } else {
                        self.compound_or(CompoundOp::BitAnd, TokenKind::Amp)
                    }
                }
                '|' => {
                    self.advance();
                    if self.match_char('|') {
                        TokenKind::OrOr
                    } else {
                        self.compound_or(CompoundOp::BitOr, TokenKind::Pipe)
                    }
                }
                '!' => {
                    self.advance();
                    if !self.match_char('=') {
                        TokenKind::Bang
                    } else if self.match_char('=') {
                        TokenKind::NotEqEq
                    } else {
                        TokenKind::NotEq
                    }
                }
                '=' => {
                    self.advance();
                    if !self.match_char('=') {
                        TokenKind::Eq
                    } else if self.match_char('=') {
                        TokenKind::EqEqEq
                    } else {
                        TokenKind::EqEq
                    }
                }
                '<' => {
                    self.advance();
                    if self.match_char('<') {
                        self.compound_or(CompoundOp::Shl, TokenKind::Shl)
                    } else if self.match_char('=') {
                        TokenKind::Le
                    } else {
                        TokenKind::Lt
                    }
                }
                '>' => {
                    self.advance();
                    if self.match_char('>') {
                        if self.match_char('>') {
                            self.compound_or(CompoundOp::Shr, TokenKind::Shr)
                        } else {
                            self.compound_or(CompoundOp::Sar, TokenKind::Sar)
                        }
                    } else if self.match_char('=') {
                        TokenKind::Ge
                    } else {
                        TokenKind::Gt
                    }
                }
                '"' | '\'' => self.scan_string(ch)?,
                '0'..='9' => self.scan_number(String::new())?,
                c if is_identifier_start(c) => self.scan_identifier()?,
                _ => return Err(self.error(&format!("unexpected character '{ch}'"))),
            };

            tokens.push(Token {
                kind,
                span,
                newline_before,
            });
        }
        Ok(tokens)
    }

    fn peek(&mut self) -> Option<char> {
        self.chars.peek().copied()
    }

    fn advance(&mut self) -> Option<char> {
        let result = self.chars.next();
        if let Some(ch) = result {
            self.offset += 1;
            if ch == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        result
    }

    fn match_char(&mut self, expected: char) -> bool {
        if self.peek() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn single(&mut self, kind: TokenKind) -> TokenKind {
        self.advance();
        kind
    }

    fn compound_or(&mut self, op: CompoundOp, plain: TokenKind) -> TokenKind {
        if self.match_char('=') {
            TokenKind::AssignOp(op)
        } else {
            plain
        }
    }

    fn error(&self, message: &str) -> Error {
        Error::Parse {
            line: self.line,
            column: self.column,
            message: message.to_string(),
        }
    }

    fn skip_whitespace_and_comments(&mut self) -> Result<()> {
        loop {
            match self.peek() {
                Some('\n' | '\r' | '\u{2028}' | '\u{2029}') => {
                    self.newline_before = true;
                    self.advance();
                }
                Some(c) if c.is_whitespace() || c == '\u{feff}' => {
                    self.advance();
                }
                Some('/') => {
                    let mut chars = self.chars.clone();
                    chars.next();
                    match chars.peek() {
                        Some('/') => {
                            while let Some(ch) = self.peek() {
                                if ch == '\n' {
                                    break;
                                }
                                self.advance();
                            }
                        }
                        Some('*') => {
                            self.advance();
                            self.advance();
                            loop {
                                match self.advance() {
                                    None => return Err(self.error("unterminated comment")),
                                    Some('*') if self.peek() == Some('/') => {
                                        self.advance();
                                        break;
                                    }
                                    Some('\n') => self.newline_before = true,
                                    Some(_) => {}
                                }
                            }
                        }
                        _ => return Ok(()),
                    }
                }
                _ => return Ok(()),
            }
        }
    }

    fn scan_number(&mut self, mut text: String) -> Result<TokenKind> {
        if text.is_empty() && self.peek() == Some('0') {
            let mut chars = self.chars.clone();
            chars.next();
            if matches!(chars.peek(), Some('x' | 'X')) {
                self.advance();
                self.advance();
                let mut value = 0.0_f64;
                let mut digits = 0;
                while let Some(digit) = self.peek().and_then(|c| c.to_digit(16)) {
                    self.advance();
                    value = value * 16.0 + f64::from(digit);
                    digits += 1;
                }
                if digits == 0 {
                    return Err(self.error("missing hexadecimal digits"));
                }
                return self.finish_number(value);
            }
        }

        let fraction_started = !text.is_empty();
        self.take_digits(&mut text);
        if !fraction_started && self.peek() == Some('.') {
            self.advance();
            text.push('.');
            self.take_digits(&mut text);
        }
        if matches!(self.peek(), Some('e' | 'E')) {
            self.advance();
            text.push('e');
            if let Some(sign @ ('+' | '-')) = self.peek() {
                self.advance();
                text.push(sign);
            }
            if !self.peek().is_some_and(|c| c.is_ascii_digit()) {
                return Err(self.error("missing exponent digits"));
            }
            self.take_digits(&mut text);
        }
        let value: f64 = text
            .parse()
            .map_err(|_| self.error(&format!("invalid number '{text}'")))?;
        self.finish_number(value)
    }

    fn take_digits(&mut self, text: &mut String) {
        while let Some(ch) = self.peek().filter(char::is_ascii_digit) {
            self.advance();
            text.push(ch);
        }
    }

    fn finish_number(&mut self, value: f64) -> Result<TokenKind> {
        if self.peek().is_some_and(is_identifier_start) {
            return Err(self.error("identifier starts immediately after number"));
        }
        Ok(TokenKind::Number(value))
    }

    fn scan_string(&mut self, quote: char) -> Result<TokenKind> {
        self.advance();
        let mut value = String::new();
        loop {
            match self.advance() {
                None | Some('\n') => return Err(self.error("unterminated string")),
                Some(ch) if ch == quote => break,
                Some('\\') => {
                    let escaped = self
                        .advance()
                        .ok_or_else(|| self.error("unterminated string"))?;
                    match escaped {
                        'n' => value.push('\n'),
                        't' => value.push('\t'),
                        'r' => value.push('\r'),
                        'b' => value.push('\u{8}'),
                        'f' => value.push('\u{c}'),
                        'v' => value.push('\u{b}'),
                        '0' if !self.peek().is_some_and(|c| c.is_ascii_digit()) => {
                            value.push('\0');
                        }
                        'x' => value.push(self.scan_hex_escape(2)?),
                        'u' => value.push(self.scan_hex_escape(4)?),
                        // Line continuation.
                        '\n' => {}
                        other => value.push(other),
                    }
                }
                Some(ch) => value.push(ch),
            }
        }
        Ok(TokenKind::Str(Rc::from(value)))
    }

    fn scan_hex_escape(&mut self, length: usize) -> Result<char> {
        let mut code = 0_u32;
        for _ in 0..length {
            let digit = self
                .advance()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| self.error("invalid escape sequence"))?;
            code = code * 16 + digit;
        }
        char::from_u32(code).ok_or_else(|| self.error("invalid character code in escape"))
    }

    fn scan_identifier(&mut self) -> Result<TokenKind> {
        let mut name = String::new();
        while let Some(ch) = self.peek() {
            if ch == '\\' {
                self.advance();
                if self.advance() != Some('u') {
                    return Err(self.error("invalid escape in identifier"));
                }
                name.push(self.scan_hex_escape(4)?);
            } else if is_identifier_part(ch) {
                self.advance();
                name.push(ch);
            } else {
                break;
            }
        }
        Ok(TokenKind::keyword(&name).unwrap_or_else(|| TokenKind::Ident(Rc::from(name))))
    }

    fn scan_regexp(&mut self) -> Result<TokenKind> {
        self.advance();
        let mut pattern = String::new();
        let mut in_class = false;
        loop {
            match self.advance() {
                None | Some('\n') => return Err(self.error("unterminated regular expression")),
                Some('/') if !in_class => break,
                Some('\\') => {
                    pattern.push('\\');
                    let escaped = self
                        .advance()
                        .ok_or_else(|| self.error("unterminated regular expression"))?;
                    pattern.push(escaped);
                }
                Some(ch) => {
                    match ch {
                        '[' => in_class = true,
                        ']' => in_class = false,
                        _ => {}
                    }
                    pattern.push(ch);
                }
            }
        }
        let mut flags = String::new();
        while let Some(ch) = self.peek().filter(|c| is_identifier_part(*c)) {
            self.advance();
            flags.push(ch);
        }
        Ok(TokenKind::RegExp {
            pattern: Rc::from(pattern),
            flags: Rc::from(flags),
        })
    }
}

fn is_identifier_start(ch: char) -> bool {
    ch == '$' || ch == '_' || ch.is_alphabetic()
}

fn is_identifier_part(ch: char) -> bool {
    is_identifier_start(ch) || ch.is_alphanumeric()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        Lexer::new(source)
            .scan_tokens()
            .unwrap()
            .into_iter()
            .map(|token| token.kind)
            .collect()
    }

    #[test]
    fn test_operators() {
        assert_eq!(
            kinds("a >>>= b !== c >> 1"),
            vec![
                TokenKind::Ident("a".into()),
                TokenKind::AssignOp(CompoundOp::Shr),
                TokenKind::Ident("b".into()),
                TokenKind::NotEqEq,
                TokenKind::Ident("c".into()),
                TokenKind::Sar,
                TokenKind::Number(1.0),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_numbers() {
        assert_eq!(
            kinds("0x1F 1.5e3 .25 7"),
            vec![
                TokenKind::Number(31.0),
                TokenKind::Number(1500.0),
                TokenKind::Number(0.25),
                TokenKind::Number(7.0),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_strings_and_escapes() {
        assert_eq!(
            kinds(r#"'a\'b' "\x41B\n""#),
            vec![
                TokenKind::Str("a'b".into()),
                TokenKind::Str("AB\n".into()),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_regexp_versus_division() {
        assert_eq!(
            kinds("x = /a[/]b/gi; y = x / 2"),
            vec![
                TokenKind::Ident("x".into()),
                TokenKind::Eq,
                TokenKind::RegExp {
                    pattern: "a[/]b".into(),
                    flags: "gi".into(),
                },
                TokenKind::Semi,
                TokenKind::Ident("y".into()),
                TokenKind::Eq,
                TokenKind::Ident("x".into()),
                TokenKind::Slash,
                TokenKind::Number(2.0),
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn test_newlines_and_comments() {
        let tokens = Lexer::new("a /* x\n */ b // c\nc").scan_tokens().unwrap();
        let flags: Vec<bool> = tokens.iter().map(|t| t.newline_before).collect();
        assert_eq!(flags, vec![false, true, true, true]);
        assert_eq!(tokens[1].span.line, 2);
    }

    #[test]
    fn test_unterminated_string() {
        let err = Lexer::new("'abc").scan_tokens().unwrap_err();
        assert!(matches!(err, Error::Parse { line: 1, .. }));
    }
}
