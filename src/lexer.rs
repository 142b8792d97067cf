use crate::token::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub line: usize,
    pub col: usize,
}

#[derive(Debug, Clone)]
pub struct Spanned {
    pub token: Token,
    pub span: Span,
}

pub const ERR_UNTERMINATED_STRING: u32 = 1001;
pub const ERR_BAD_ESCAPE: u32 = 1002;
pub const ERR_UNTERMINATED_COMMENT: u32 = 1003;
pub const ERR_BAD_NUMBER: u32 = 1004;
pub const ERR_UNEXPECTED_CHAR: u32 = 1005;
pub const ERR_BAD_CHAR_LITERAL: u32 = 1006;

#[derive(Debug, Clone)]
pub struct LexerError {
    pub code: u32,
    pub message: String,
    pub line: usize,
    pub col: usize,
}

impl std::fmt::Display for LexerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.col, self.message)
    }
}

/// Turns source text into spanned tokens.
///
/// Errors do not stop the scan: the offending text is skipped and the
/// error recorded, so one pass reports every lexical problem in a file.
pub struct Lexer {
    source: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    errors: Vec<LexerError>,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Lexer {
            source: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            errors: Vec::new(),
        }
    }

    fn current(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    fn peek(&self) -> Option<char> {
        self.source.get(self.pos + 1).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.source.get(self.pos + offset).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current();
        if ch == Some('\n') {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        self.pos += 1;
        ch
    }

    fn span(&self) -> Span {
        Span {
            line: self.line,
            col: self.col,
        }
    }

    fn error_at(&mut self, code: u32, message: String, span: Span) {
        self.errors.push(LexerError {
            code,
            message,
            line: span.line,
            col: span.col,
        });
    }

    /// Skips blanks and both comment forms. Block comments nest.
    fn skip_trivia(&mut self) {
        loop {
            match (self.current(), self.peek()) {
                (Some(' ' | '\t' | '\r' | '\n'), _) => {
                    self.advance();
                }
                (Some('/'), Some('/')) => {
                    while let Some(ch) = self.current() {
                        if ch == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                (Some('/'), Some('*')) => self.skip_block_comment(),
                _ => break,
            }
        }
    }

    fn skip_block_comment(&mut self) {
        let start = self.span();
        self.advance();
        self.advance();
        let mut depth = 1;
        while depth > 0 {
            match (self.current(), self.peek()) {
                (None, _) => {
                    self.error_at(
                        ERR_UNTERMINATED_COMMENT,
                        "unexpected end of file inside comment block".to_string(),
                        start,
                    );
                    return;
                }
                (Some('/'), Some('*')) => {
                    self.advance();
                    self.advance();
                    depth += 1;
                }
                (Some('*'), Some('/')) => {
                    self.advance();
                    self.advance();
                    depth -= 1;
                }
                _ => {
                    self.advance();
                }
            }
        }
    }

    /// Reads the character after a backslash. Returns `None` on a malformed
    /// escape (already reported).
    fn read_escape(&mut self) -> Option<i64> {
        let span = self.span();
        let ch = match self.advance() {
            Some(ch) => ch,
            None => {
                self.error_at(
                    ERR_BAD_ESCAPE,
                    "unexpected end of file in escape sequence".to_string(),
                    span,
                );
                return None;
            }
        };
        let value = match ch {
            'n' => '\n' as i64,
            'r' => '\r' as i64,
            't' => '\t' as i64,
            'v' => 0x0b,
            'a' => 0x07,
            'b' => 0x08,
            'f' => 0x0c,
            '"' | '\'' | '\\' | '?' => ch as i64,
            'x' => return self.read_escape_digits(16, 2, span),
            'o' => return self.read_escape_digits(8, 3, span),
            d if d.is_ascii_digit() => {
                let mut value = d as i64 - '0' as i64;
                for _ in 0..2 {
                    match self.current() {
                        Some(c) if c.is_ascii_digit() => {
                            value = value * 10 + (c as i64 - '0' as i64);
                            self.advance();
                        }
                        _ => break,
                    }
                }
                value
            }
            other => {
                self.error_at(
                    ERR_BAD_ESCAPE,
                    format!("unknown escape sequence: \\{}", other),
                    span,
                );
                return None;
            }
        };
        Some(value)
    }

    fn read_escape_digits(&mut self, radix: u32, max: usize, span: Span) -> Option<i64> {
        let mut value = 0i64;
        let mut count = 0;
        while count < max {
            match self.current().and_then(|c| c.to_digit(radix)) {
                Some(d) => {
                    value = value * radix as i64 + d as i64;
                    self.advance();
                    count += 1;
                }
                None => break,
            }
        }
        if count == 0 {
            self.error_at(
                ERR_BAD_ESCAPE,
                "escape sequence needs at least one digit".to_string(),
                span,
            );
            return None;
        }
        Some(value)
    }

    fn read_string(&mut self) -> Option<Token> {
        let start = self.span();
        self.advance();

        let mut string = String::new();
        let mut valid = true;
        loop {
            match self.current() {
                Some('"') => {
                    self.advance();
                    return valid.then_some(Token::Str(string));
                }
                Some('\\') => {
                    self.advance();
                    match self.read_escape().and_then(|c| char::from_u32(c as u32)) {
                        Some(ch) => string.push(ch),
                        None => valid = false,
                    }
                }
                Some('\n') | None => {
                    self.error_at(
                        ERR_UNTERMINATED_STRING,
                        "unterminated string literal".to_string(),
                        start,
                    );
                    return None;
                }
                Some(ch) => {
                    string.push(ch);
                    self.advance();
                }
            }
        }
    }

    /// `@"..."@` strings keep their text as written, newlines included.
    fn read_verbatim(&mut self) -> Option<Token> {
        let start = self.span();
        self.advance();
        self.advance();

        let mut string = String::new();
        loop {
            match (self.current(), self.peek()) {
                (Some('"'), Some('@')) => {
                    self.advance();
                    self.advance();
                    return Some(Token::Str(string));
                }
                (Some(ch), _) => {
                    string.push(ch);
                    self.advance();
                }
                (None, _) => {
                    self.error_at(
                        ERR_UNTERMINATED_STRING,
                        "unterminated verbatim string".to_string(),
                        start,
                    );
                    return None;
                }
            }
        }
    }

    fn read_char(&mut self) -> Option<Token> {
        let start = self.span();
        self.advance();

        let value = match self.current() {
            Some('\\') => {
                self.advance();
                self.read_escape()
            }
            Some('\'') | Some('\n') | None => None,
            Some(ch) => {
                self.advance();
                Some(ch as i64)
            }
        };

        if self.current() == Some('\'') && value.is_some() {
            self.advance();
            return value.map(Token::Char);
        }

        while let Some(ch) = self.current() {
            if ch == '\n' {
                break;
            }
            self.advance();
            if ch == '\'' {
                break;
            }
        }
        self.error_at(
            ERR_BAD_CHAR_LITERAL,
            "malformed character literal".to_string(),
            start,
        );
        None
    }

    fn read_number(&mut self) -> Option<Token> {
        let start = self.span();

        // Hex: 0x... or 0X...
        if self.current() == Some('0') && matches!(self.peek(), Some('x') | Some('X')) {
            self.advance();
            self.advance();

            let mut hex = String::new();
            while let Some(ch) = self.current() {
                if ch.is_ascii_hexdigit() {
                    hex.push(ch);
                    self.advance();
                } else {
                    break;
                }
            }

            if hex.is_empty() {
                self.error_at(ERR_BAD_NUMBER, "expected hex digits after 0x".to_string(), start);
                return None;
            }

            return match u64::from_str_radix(&hex, 16) {
                Ok(value) => Some(Token::Integer(value as i64)),
                Err(_) => {
                    self.error_at(ERR_BAD_NUMBER, format!("hex number too large: 0x{}", hex), start);
                    None
                }
            };
        }

        let mut digits = String::new();
        let mut is_float = false;

        while let Some(ch) = self.current() {
            if ch.is_ascii_digit() {
                digits.push(ch);
                self.advance();
            } else if ch == '.' && !is_float {
                // `1..5` is a range, not a float
                if self.peek().map(|c| c.is_ascii_digit()).unwrap_or(false) {
                    is_float = true;
                    digits.push('.');
                    self.advance();
                } else {
                    break;
                }
            } else if (ch == 'e' || ch == 'E') && is_float {
                let sign = matches!(self.peek(), Some('+') | Some('-'));
                let digit_at = if sign { 2 } else { 1 };
                if !self.peek_at(digit_at).map(|c| c.is_ascii_digit()).unwrap_or(false) {
                    break;
                }
                digits.push('e');
                self.advance();
                if sign {
                    if let Some(s) = self.advance() {
                        digits.push(s);
                    }
                }
            } else {
                break;
            }
        }

        if self.current() == Some('#') && !is_float {
            self.advance();
            return Some(Token::BigNumber(digits));
        }

        if is_float {
            match digits.parse::<f64>() {
                Ok(value) => Some(Token::Float(value)),
                Err(_) => {
                    self.error_at(ERR_BAD_NUMBER, format!("invalid float: {}", digits), start);
                    None
                }
            }
        } else {
            match digits.parse::<i64>() {
                Ok(value) => Some(Token::Integer(value)),
                Err(_) => {
                    self.error_at(
                        ERR_BAD_NUMBER,
                        format!("too many digits in number: {}", digits),
                        start,
                    );
                    None
                }
            }
        }
    }

    fn read_identifier(&mut self) -> Token {
        let mut ident = String::new();
        while let Some(ch) = self.current() {
            if ch.is_alphanumeric() || ch == '_' {
                ident.push(ch);
                self.advance();
            } else {
                break;
            }
        }

        Token::keyword(&ident).unwrap_or(Token::Ident(ident))
    }

    fn read_operator(&mut self) -> Option<Token> {
        let ch = self.current()?;
        let next = self.peek();
        let third = self.peek_at(2);

        let (token, len) = match (ch, next, third) {
            ('<', Some('<'), Some('=')) => (Token::ShlAssign, 3),
            ('>', Some('>'), Some('=')) => (Token::ShrAssign, 3),
            ('$', Some('!'), Some('=')) => (Token::StrNotEq, 3),
            ('$', Some('='), _) => (Token::StrEq, 2),
            (':', Some('='), _) => (Token::Assign, 2),
            ('+', Some('='), _) => (Token::PlusAssign, 2),
            ('-', Some('='), _) => (Token::MinusAssign, 2),
            ('*', Some('='), _) => (Token::StarAssign, 2),
            ('/', Some('='), _) => (Token::SlashAssign, 2),
            ('^', Some('='), _) => (Token::CaretAssign, 2),
            ('|', Some('='), _) => (Token::PipeAssign, 2),
            ('&', Some('='), _) => (Token::AmpAssign, 2),
            ('+', Some('+'), _) => (Token::PlusPlus, 2),
            ('-', Some('-'), _) => (Token::MinusMinus, 2),
            ('&', Some('&'), _) => (Token::AndAnd, 2),
            ('|', Some('|'), _) => (Token::OrOr, 2),
            ('<', Some('<'), _) => (Token::Shl, 2),
            ('>', Some('>'), _) => (Token::Shr, 2),
            ('!', Some('='), _) => (Token::NotEq, 2),
            ('<', Some('>'), _) => (Token::NotEq, 2),
            ('<', Some('='), _) => (Token::LtEq, 2),
            ('>', Some('='), _) => (Token::GtEq, 2),
            ('=', Some('>'), _) => (Token::FatArrow, 2),
            ('.', Some('.'), _) => (Token::DotDot, 2),
            ('+', _, _) => (Token::Plus, 1),
            ('-', _, _) => (Token::Minus, 1),
            ('*', _, _) => (Token::Star, 1),
            ('/', _, _) => (Token::Slash, 1),
            ('%', _, _) => (Token::Percent, 1),
            ('&', _, _) => (Token::Amp, 1),
            ('|', _, _) => (Token::Pipe, 1),
            ('^', _, _) => (Token::Caret, 1),
            ('~', _, _) => (Token::Tilde, 1),
            ('!', _, _) => (Token::Bang, 1),
            ('=', _, _) => (Token::Eq, 1),
            ('<', _, _) => (Token::Lt, 1),
            ('>', _, _) => (Token::Gt, 1),
            ('(', _, _) => (Token::LParen, 1),
            (')', _, _) => (Token::RParen, 1),
            ('[', _, _) => (Token::LBracket, 1),
            (']', _, _) => (Token::RBracket, 1),
            ('{', _, _) => (Token::LBrace, 1),
            ('}', _, _) => (Token::RBrace, 1),
            (',', _, _) => (Token::Comma, 1),
            (';', _, _) => (Token::Semicolon, 1),
            (':', _, _) => (Token::Colon, 1),
            ('?', _, _) => (Token::Question, 1),
            _ => return None,
        };

        for _ in 0..len {
            self.advance();
        }
        Some(token)
    }

    /// Scans the whole source. On failure every lexical error found is
    /// returned, in source order.
    pub fn tokenize(&mut self) -> Result<Vec<Spanned>, Vec<LexerError>> {
        let mut tokens = Vec::new();

        loop {
            self.skip_trivia();
            let span = self.span();

            let token = match self.current() {
                None => {
                    tokens.push(Spanned {
                        token: Token::Eof,
                        span,
                    });
                    break;
                }
                Some('"') => self.read_string(),
                Some('@') if self.peek() == Some('"') => self.read_verbatim(),
                Some('\'') => self.read_char(),
                Some(ch) if ch.is_ascii_digit() => self.read_number(),
                Some(ch) if ch.is_alphabetic() || ch == '_' => Some(self.read_identifier()),
                Some(ch) => match self.read_operator() {
                    Some(token) => Some(token),
                    None => {
                        self.error_at(
                            ERR_UNEXPECTED_CHAR,
                            format!("unexpected character: '{}'", ch),
                            span,
                        );
                        self.advance();
                        None
                    }
                },
            };

            if let Some(token) = token {
                tokens.push(Spanned { token, span });
            }
        }

        if self.errors.is_empty() {
            Ok(tokens)
        } else {
            Err(std::mem::take(&mut self.errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(source: &str) -> Vec<Token> {
        let mut lexer = Lexer::new(source);
        lexer
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|s| s.token)
            .filter(|t| !matches!(t, Token::Eof))
            .collect()
    }

    fn errors(source: &str) -> Vec<LexerError> {
        let mut lexer = Lexer::new(source);
        lexer.tokenize().unwrap_err()
    }

    #[test]
    fn test_assignment_statement() {
        let t = tokens("x := x + 1;");
        assert_eq!(
            t,
            vec![
                Token::Ident("x".to_string()),
                Token::Assign,
                Token::Ident("x".to_string()),
                Token::Plus,
                Token::Integer(1),
                Token::Semicolon
            ]
        );
    }

    #[test]
    fn test_keywords_and_aliases() {
        let t = tokens("function procedure using include option pragma which case");
        assert_eq!(
            t,
            vec![
                Token::Function,
                Token::Procedure,
                Token::Include,
                Token::Include,
                Token::Pragma,
                Token::Pragma,
                Token::Which,
                Token::Case
            ]
        );
    }

    #[test]
    fn test_compound_operators() {
        let t = tokens("+= -= *= /= <<= >>= ^= |= &= ++ -- && || $= $!= <> =>");
        assert_eq!(
            t,
            vec![
                Token::PlusAssign,
                Token::MinusAssign,
                Token::StarAssign,
                Token::SlashAssign,
                Token::ShlAssign,
                Token::ShrAssign,
                Token::CaretAssign,
                Token::PipeAssign,
                Token::AmpAssign,
                Token::PlusPlus,
                Token::MinusMinus,
                Token::AndAnd,
                Token::OrOr,
                Token::StrEq,
                Token::StrNotEq,
                Token::NotEq,
                Token::FatArrow
            ]
        );
    }

    #[test]
    fn test_numbers() {
        let t = tokens("42 0xff 2.5 1.5e3 123456789012345678901234567890#");
        assert_eq!(
            t,
            vec![
                Token::Integer(42),
                Token::Integer(255),
                Token::Float(2.5),
                Token::Float(1500.0),
                Token::BigNumber("123456789012345678901234567890".to_string())
            ]
        );
    }

    #[test]
    fn test_range_is_not_float() {
        let t = tokens("a[1..]");
        assert_eq!(
            t,
            vec![
                Token::Ident("a".to_string()),
                Token::LBracket,
                Token::Integer(1),
                Token::DotDot,
                Token::RBracket
            ]
        );
    }

    #[test]
    fn test_string_escapes() {
        let t = tokens(r#""a\tb\n\x41\o101\65\"""#);
        assert_eq!(t, vec![Token::Str("a\tb\nAAA\"".to_string())]);
    }

    #[test]
    fn test_verbatim_string_keeps_backslashes() {
        let t = tokens("@\"c:\\dir\nline\"@");
        assert_eq!(t, vec![Token::Str("c:\\dir\nline".to_string())]);
    }

    #[test]
    fn test_char_literals() {
        let t = tokens(r"'a' '\n' '\\'");
        assert_eq!(
            t,
            vec![Token::Char(97), Token::Char(10), Token::Char(92)]
        );
    }

    #[test]
    fn test_comments_are_skipped_and_nest() {
        let t = tokens("a // line\n/* outer /* inner */ still */ b");
        assert_eq!(
            t,
            vec![Token::Ident("a".to_string()), Token::Ident("b".to_string())]
        );
    }

    #[test]
    fn test_spans() {
        let mut lexer = Lexer::new("var\n  x;");
        let spanned = lexer.tokenize().unwrap();
        assert_eq!(spanned[0].span, Span { line: 1, col: 1 });
        assert_eq!(spanned[1].span, Span { line: 2, col: 3 });
        assert_eq!(spanned[2].span, Span { line: 2, col: 4 });
    }

    #[test]
    fn test_errors_accumulate() {
        let errs = errors("\"abc\n x := 1 ` y := \"\\q\";");
        let codes: Vec<u32> = errs.iter().map(|e| e.code).collect();
        assert_eq!(
            codes,
            vec![ERR_UNTERMINATED_STRING, ERR_UNEXPECTED_CHAR, ERR_BAD_ESCAPE]
        );
        assert_eq!(errs[0].line, 1);
        assert_eq!(errs[1].line, 2);
    }

    #[test]
    fn test_unterminated_comment() {
        let errs = errors("x /* never closed");
        assert_eq!(errs[0].code, ERR_UNTERMINATED_COMMENT);
        assert_eq!((errs[0].line, errs[0].col), (1, 3));
    }

    #[test]
    fn test_number_overflow() {
        let errs = errors("99999999999999999999999");
        assert_eq!(errs[0].code, ERR_BAD_NUMBER);
    }
}
