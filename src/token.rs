#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Integer(i64),
    Float(f64),
    Str(std::string::String),
    BigNumber(std::string::String),
    Char(i64),

    // Declarations
    Const,
    Var,
    Function,
    Procedure,
    Declare,
    Type,
    Include,
    Pragma,
    Ref,
    Val,
    Lambda,

    // Statements
    Begin,
    End,
    If,
    Then,
    Else,
    While,
    Do,
    Repeat,
    For,
    To,
    Step,
    Which,
    Case,
    Exit,
    Continue,
    Return,
    Goto,
    Call,

    // Word operators and constants
    True,
    False,
    Null,
    Not,
    And,
    Or,
    Abs,
    Odd,

    // Arithmetic and bitwise
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Amp,
    Pipe,
    Caret,
    Tilde,
    Bang,
    Shl,
    Shr,
    PlusPlus,
    MinusMinus,

    // Comparison
    Eq,
    NotEq,
    Lt,
    Gt,
    LtEq,
    GtEq,
    StrEq,
    StrNotEq,
    AndAnd,
    OrOr,

    // Assignment
    Assign,
    PlusAssign,
    MinusAssign,
    StarAssign,
    SlashAssign,
    ShlAssign,
    ShrAssign,
    CaretAssign,
    PipeAssign,
    AmpAssign,

    // Delimiters
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Comma,
    Semicolon,
    Colon,
    Question,
    DotDot,
    FatArrow,

    Ident(std::string::String),
    Eof,
}

impl Token {
    /// Maps an identifier-shaped word to its keyword, if it is one.
    pub fn keyword(word: &str) -> Option<Token> {
        let token = match word {
            "const" => Token::Const,
            "var" => Token::Var,
            "function" => Token::Function,
            "procedure" => Token::Procedure,
            "declare" => Token::Declare,
            "type" => Token::Type,
            "include" | "using" => Token::Include,
            "pragma" | "option" => Token::Pragma,
            "ref" => Token::Ref,
            "val" => Token::Val,
            "lambda" => Token::Lambda,
            "begin" => Token::Begin,
            "end" => Token::End,
            "if" => Token::If,
            "then" => Token::Then,
            "else" => Token::Else,
            "while" => Token::While,
            "do" => Token::Do,
            "repeat" => Token::Repeat,
            "for" => Token::For,
            "to" => Token::To,
            "step" => Token::Step,
            "which" => Token::Which,
            "case" => Token::Case,
            "exit" => Token::Exit,
            "continue" => Token::Continue,
            "return" => Token::Return,
            "goto" => Token::Goto,
            "call" => Token::Call,
            "true" => Token::True,
            "false" => Token::False,
            "null" => Token::Null,
            "not" => Token::Not,
            "and" => Token::And,
            "or" => Token::Or,
            "abs" => Token::Abs,
            "odd" => Token::Odd,
            _ => return None,
        };
        Some(token)
    }

    /// True for the tokens a statement may start with after error recovery.
    pub fn starts_statement(&self) -> bool {
        matches!(
            self,
            Token::Begin
                | Token::If
                | Token::While
                | Token::Do
                | Token::Repeat
                | Token::For
                | Token::Which
                | Token::Exit
                | Token::Continue
                | Token::Return
                | Token::Goto
                | Token::Call
                | Token::Var
        )
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Integer(n) => write!(f, "{}", n),
            Token::Float(n) => write!(f, "{}", n),
            Token::Str(s) => write!(f, "\"{}\"", s),
            Token::BigNumber(s) => write!(f, "{}#", s),
            Token::Char(c) => match char::from_u32(*c as u32) {
                Some(ch) => write!(f, "'{}'", ch.escape_default()),
                None => write!(f, "'\\{}'", c),
            },
            Token::Const => write!(f, "const"),
            Token::Var => write!(f, "var"),
            Token::Function => write!(f, "function"),
            Token::Procedure => write!(f, "procedure"),
            Token::Declare => write!(f, "declare"),
            Token::Type => write!(f, "type"),
            Token::Include => write!(f, "include"),
            Token::Pragma => write!(f, "pragma"),
            Token::Ref => write!(f, "ref"),
            Token::Val => write!(f, "val"),
            Token::Lambda => write!(f, "lambda"),
            Token::Begin => write!(f, "begin"),
            Token::End => write!(f, "end"),
            Token::If => write!(f, "if"),
            Token::Then => write!(f, "then"),
            Token::Else => write!(f, "else"),
            Token::While => write!(f, "while"),
            Token::Do => write!(f, "do"),
            Token::Repeat => write!(f, "repeat"),
            Token::For => write!(f, "for"),
            Token::To => write!(f, "to"),
            Token::Step => write!(f, "step"),
            Token::Which => write!(f, "which"),
            Token::Case => write!(f, "case"),
            Token::Exit => write!(f, "exit"),
            Token::Continue => write!(f, "continue"),
            Token::Return => write!(f, "return"),
            Token::Goto => write!(f, "goto"),
            Token::Call => write!(f, "call"),
            Token::True => write!(f, "true"),
            Token::False => write!(f, "false"),
            Token::Null => write!(f, "null"),
            Token::Not => write!(f, "not"),
            Token::And => write!(f, "and"),
            Token::Or => write!(f, "or"),
            Token::Abs => write!(f, "abs"),
            Token::Odd => write!(f, "odd"),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Slash => write!(f, "/"),
            Token::Percent => write!(f, "%"),
            Token::Amp => write!(f, "&"),
            Token::Pipe => write!(f, "|"),
            Token::Caret => write!(f, "^"),
            Token::Tilde => write!(f, "~"),
            Token::Bang => write!(f, "!"),
            Token::Shl => write!(f, "<<"),
            Token::Shr => write!(f, ">>"),
            Token::PlusPlus => write!(f, "++"),
            Token::MinusMinus => write!(f, "--"),
            Token::Eq => write!(f, "="),
            Token::NotEq => write!(f, "!="),
            Token::Lt => write!(f, "<"),
            Token::Gt => write!(f, ">"),
            Token::LtEq => write!(f, "<="),
            Token::GtEq => write!(f, ">="),
            Token::StrEq => write!(f, "$="),
            Token::StrNotEq => write!(f, "$!="),
            Token::AndAnd => write!(f, "&&"),
            Token::OrOr => write!(f, "||"),
            Token::Assign => write!(f, ":="),
            Token::PlusAssign => write!(f, "+="),
            Token::MinusAssign => write!(f, "-="),
            Token::StarAssign => write!(f, "*="),
            Token::SlashAssign => write!(f, "/="),
            Token::ShlAssign => write!(f, "<<="),
            Token::ShrAssign => write!(f, ">>="),
            Token::CaretAssign => write!(f, "^="),
            Token::PipeAssign => write!(f, "|="),
            Token::AmpAssign => write!(f, "&="),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::Comma => write!(f, ","),
            Token::Semicolon => write!(f, ";"),
            Token::Colon => write!(f, ":"),
            Token::Question => write!(f, "?"),
            Token::DotDot => write!(f, ".."),
            Token::FatArrow => write!(f, "=>"),
            Token::Ident(s) => write!(f, "{}", s),
            Token::Eof => write!(f, "end of file"),
        }
    }
}
