use crate::lexer::Span;

/// A parsed source file: the declarations of its top-level block.
#[derive(Debug, Clone, Default)]
pub struct Program {
    pub decls: Vec<Decl>,
}

#[derive(Debug, Clone)]
pub enum Decl {
    Const(Vec<ConstItem>),
    Var(Vec<VarItem>),
    Type {
        name: String,
        ty: TypeExpr,
        span: Span,
    },
    Function(FunctionDecl),
    Declare(FunctionSig),
    Include {
        path: String,
        span: Span,
    },
    Pragma(Pragma),
}

#[derive(Debug, Clone)]
pub struct ConstItem {
    pub name: String,
    pub value: Expr,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct VarItem {
    pub name: String,
    pub ty: Option<TypeExpr>,
    pub init: Option<Expr>,
    pub span: Span,
}

/// Array suffix of a type: `[N]`, `[]` or `[..]`.
#[derive(Debug, Clone)]
pub enum Dim {
    Sized(Expr),
    Reference,
    Open,
}

#[derive(Debug, Clone)]
pub struct TypeExpr {
    pub name: String,
    pub dims: Vec<Dim>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub byref: bool,
    pub ty: Option<TypeExpr>,
    pub default: Option<Expr>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct FunctionSig {
    pub name: String,
    pub params: Vec<Param>,
    /// `None` for procedures. Functions without an annotation return integer.
    pub ret: Option<TypeExpr>,
    pub is_function: bool,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct FunctionDecl {
    pub sig: FunctionSig,
    pub decls: Vec<Decl>,
    pub body: Stmt,
}

#[derive(Debug, Clone)]
pub struct Pragma {
    pub name: String,
    pub value: Expr,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct Stmt {
    pub kind: StmtKind,
    pub span: Span,
}

/// Construct named by `exit`/`continue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JumpTarget {
    For,
    While,
    Do,
    Repeat,
    Which,
    Function,
}

#[derive(Debug, Clone)]
pub enum StmtKind {
    Block(Vec<Stmt>),
    Var(Vec<VarItem>),
    Assign {
        target: Expr,
        op: Option<BinaryOp>,
        value: Expr,
    },
    Step {
        target: Expr,
        delta: i64,
    },
    Expr(Expr),
    If {
        cond: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    While {
        cond: Expr,
        body: Box<Stmt>,
    },
    DoWhile {
        body: Box<Stmt>,
        cond: Expr,
    },
    Repeat {
        body: Box<Stmt>,
    },
    For {
        var: String,
        start: Expr,
        end: Expr,
        step: Option<Expr>,
        body: Box<Stmt>,
    },
    Which {
        subject: Expr,
        cases: Vec<WhichCase>,
        default: Option<Vec<Stmt>>,
    },
    Exit {
        target: Option<JumpTarget>,
        count: i64,
    },
    Continue {
        target: Option<JumpTarget>,
        count: i64,
    },
    Return(Option<Expr>),
    Goto(String),
    Label(String),
    Pragma(Pragma),
    Empty,
}

/// One `case` arm. Terms combine strictly left to right.
#[derive(Debug, Clone)]
pub struct WhichCase {
    pub terms: Vec<CaseTerm>,
    pub body: Vec<Stmt>,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub struct CaseTerm {
    /// How this term joins the terms before it; `None` for the first.
    pub join: Option<LogicOp>,
    /// Comparison against the subject; plain values compare with `=`.
    pub op: BinaryOp,
    pub value: Expr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Shl,
    Shr,
    BitAnd,
    BitOr,
    BitXor,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    StrEq,
    StrNotEq,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq
                | BinaryOp::NotEq
                | BinaryOp::Lt
                | BinaryOp::LtEq
                | BinaryOp::Gt
                | BinaryOp::GtEq
        )
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Shl => "<<",
            BinaryOp::Shr => ">>",
            BinaryOp::BitAnd => "&",
            BinaryOp::BitOr => "|",
            BinaryOp::BitXor => "^",
            BinaryOp::Eq => "=",
            BinaryOp::NotEq => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::LtEq => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::GtEq => ">=",
            BinaryOp::StrEq => "$=",
            BinaryOp::StrNotEq => "$!=",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicOp {
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
    BitNot,
    Abs,
    Odd,
}

#[derive(Debug, Clone)]
pub struct Arg {
    pub byref: bool,
    pub value: Expr,
}

#[derive(Debug, Clone)]
pub struct Expr {
    pub kind: ExprKind,
    pub span: Span,
}

#[derive(Debug, Clone)]
pub enum ExprKind {
    Integer(i64),
    Float(f64),
    Str(String),
    BigNumber(String),
    Char(i64),
    Bool(bool),
    Null,
    Ident(String),
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    IncDec {
        target: Box<Expr>,
        delta: i64,
        prefix: bool,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Logical {
        op: LogicOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Ternary {
        cond: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Arg>,
    },
    Index {
        base: Box<Expr>,
        index: Box<Expr>,
    },
    ArrayLit(Vec<Expr>),
    Lambda {
        params: Vec<Param>,
        ret: Option<TypeExpr>,
        body: Box<Expr>,
    },
}

impl Expr {
    pub fn new(kind: ExprKind, span: Span) -> Self {
        Expr { kind, span }
    }

    /// Name of the variable this expression designates, if it is a bare identifier.
    pub fn as_ident(&self) -> Option<&str> {
        match &self.kind {
            ExprKind::Ident(name) => Some(name),
            _ => None,
        }
    }
}
