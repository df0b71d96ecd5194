//! Typed AST for Lua 5.3 source.
//!
//! Names and string literals are interned `StrId`s; every node carries the
//! 1-based line it started on so the code generator can attribute each
//! emitted instruction to a source line.

use lunet_core::string::StrId;

/// A sequence of statements. Blocks open a scope in the code generator.
#[derive(Clone, Debug, PartialEq)]
pub struct Block {
    pub stmts: Vec<Stmt>,
    pub line: u32,
}

/// All statement forms.
#[derive(Clone, Debug, PartialEq)]
pub enum Stmt {
    /// `varlist = explist`, with multi-target and multi-value forms.
    Assign {
        targets: Vec<Expr>,
        values: Vec<Expr>,
        line: u32,
    },

    /// `local namelist [= explist]`
    Local {
        names: Vec<StrId>,
        values: Vec<Expr>,
        line: u32,
    },

    /// `local function Name funcbody`. Distinct from `Local` so the name
    /// is in scope inside its own initializer.
    LocalFunction {
        name: StrId,
        body: FuncBody,
        line: u32,
    },

    /// `function funcname funcbody`
    Function {
        name: FuncName,
        body: FuncBody,
        line: u32,
    },

    /// A bare call used as a statement.
    Call(Expr),

    Do(Block),

    While {
        cond: Expr,
        body: Block,
        line: u32,
    },

    Repeat {
        body: Block,
        cond: Expr,
        line: u32,
    },

    If {
        cond: Expr,
        then: Block,
        elseifs: Vec<(Expr, Block)>,
        else_block: Option<Block>,
        line: u32,
    },

    NumericFor {
        var: StrId,
        start: Expr,
        limit: Expr,
        step: Option<Expr>,
        body: Block,
        line: u32,
    },

    GenericFor {
        vars: Vec<StrId>,
        exprs: Vec<Expr>,
        body: Block,
        line: u32,
    },

    Return {
        values: Vec<Expr>,
        line: u32,
    },

    Break(u32),
    Continue(u32),

    Goto {
        label: StrId,
        line: u32,
    },

    Label {
        name: StrId,
        line: u32,
    },
}

/// Dotted function name with an optional trailing `:method`.
#[derive(Clone, Debug, PartialEq)]
pub struct FuncName {
    pub base: StrId,
    pub fields: Vec<StrId>,
    pub method: Option<StrId>,
}

/// Parameter list plus body.
#[derive(Clone, Debug, PartialEq)]
pub struct FuncBody {
    pub params: Vec<StrId>,
    pub is_vararg: bool,
    pub body: Block,
    pub line: u32,
    pub end_line: u32,
}

/// All expression forms.
#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    Nil(u32),
    True(u32),
    False(u32),
    Integer(i64, u32),
    Float(f64, u32),
    Str(StrId, u32),
    Vararg(u32),

    Name(StrId, u32),

    /// `(e)`: semantically a single value even if `e` is multi-valued.
    Paren(Box<Expr>, u32),

    Binary {
        op: BinOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
        line: u32,
    },

    Unary {
        op: UnOp,
        operand: Box<Expr>,
        line: u32,
    },

    /// `t[k]`
    Index {
        table: Box<Expr>,
        key: Box<Expr>,
        line: u32,
    },

    /// `t.name`
    Field {
        table: Box<Expr>,
        field: StrId,
        line: u32,
    },

    /// `f(args)`, `f{...}`, `f"s"`
    Call {
        func: Box<Expr>,
        args: Vec<Expr>,
        line: u32,
    },

    /// `o:m(args)`
    MethodCall {
        object: Box<Expr>,
        method: StrId,
        args: Vec<Expr>,
        line: u32,
    },

    Function(FuncBody),

    /// `{ list and record fields }`
    Table(Vec<TableItem>, u32),
}

impl Expr {
    pub fn line(&self) -> u32 {
        match self {
            Expr::Nil(l)
            | Expr::True(l)
            | Expr::False(l)
            | Expr::Integer(_, l)
            | Expr::Float(_, l)
            | Expr::Str(_, l)
            | Expr::Vararg(l)
            | Expr::Name(_, l)
            | Expr::Paren(_, l)
            | Expr::Table(_, l) => *l,
            Expr::Binary { line, .. }
            | Expr::Unary { line, .. }
            | Expr::Index { line, .. }
            | Expr::Field { line, .. }
            | Expr::Call { line, .. }
            | Expr::MethodCall { line, .. } => *line,
            Expr::Function(fb) => fb.line,
        }
    }

    /// Whether the expression can produce multiple values in tail position.
    pub fn is_multivalue(&self) -> bool {
        matches!(
            self,
            Expr::Call { .. } | Expr::MethodCall { .. } | Expr::Vararg(_)
        )
    }
}

/// One item of a table constructor.
#[derive(Clone, Debug, PartialEq)]
pub enum TableItem {
    /// Positional list entry.
    Item(Expr),
    /// `name = expr`
    Named(StrId, Expr),
    /// `[key] = expr`
    Keyed(Expr, Expr),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    Concat,
    BAnd,
    BOr,
    BXor,
    Shl,
    Shr,
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
    And,
    Or,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
    Len,
    BNot,
}

impl BinOp {
    /// (left, right) binding priorities; right < left means
    /// right-associative.
    pub fn priority(self) -> (u8, u8) {
        match self {
            BinOp::Or => (1, 1),
            BinOp::And => (2, 2),
            BinOp::Lt | BinOp::Gt | BinOp::LtEq | BinOp::GtEq | BinOp::NotEq | BinOp::Eq => (3, 3),
            BinOp::BOr => (4, 4),
            BinOp::BXor => (5, 5),
            BinOp::BAnd => (6, 6),
            BinOp::Shl | BinOp::Shr => (7, 7),
            BinOp::Concat => (9, 8),
            BinOp::Add | BinOp::Sub => (10, 10),
            BinOp::Mul | BinOp::Div | BinOp::IDiv | BinOp::Mod => (11, 11),
            BinOp::Pow => (14, 13),
        }
    }

    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::NotEq | BinOp::Lt | BinOp::LtEq | BinOp::Gt | BinOp::GtEq
        )
    }
}

/// Binding priority of unary operators.
pub const UNARY_PRIORITY: u8 = 12;
