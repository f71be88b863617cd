//! AST for the sandboxed script language.
//!
//! Owned (`Arc<str>`) rather than borrowed from source text: compiled
//! scripts outlive the definition strings they were compiled from, and
//! clones are cheap when the sandbox caches them per expression key.

use std::sync::Arc;

use crate::store::FieldPath;
use crate::value::Value;

use super::Spanned;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Negate,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Equal,
    NotEqual,
    Greater,
    GreaterOrEqual,
    Less,
    LessOrEqual,
    And,
    Or,
}

#[derive(Debug, Clone)]
pub enum Expr {
    Literal(Value),
    /// Bare identifier; resolution depends on the evaluation mode
    /// (script locals vs. store fields).
    Ident(Arc<str>),
    /// Multi-hop field reference written with `->`.
    FieldRef(FieldPath),
    List(Vec<Spanned<Expr>>),
    Unary {
        op: UnaryOp,
        operand: Box<Spanned<Expr>>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Spanned<Expr>>,
        right: Box<Spanned<Expr>>,
    },
    /// Free function call: sandbox context function, helper or a function
    /// exported by the current module.
    Call {
        function: Arc<str>,
        arguments: Vec<Spanned<Expr>>,
    },
    /// Field access on an object value or a module export table.
    Member {
        object: Box<Spanned<Expr>>,
        field: Arc<str>,
    },
    /// Module function invocation: `Colors.ramp(x)`.
    MethodCall {
        object: Box<Spanned<Expr>>,
        method: Arc<str>,
        arguments: Vec<Spanned<Expr>>,
    },
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Let {
        name: Arc<str>,
        value: Spanned<Expr>,
    },
    Assign {
        name: Arc<str>,
        value: Spanned<Expr>,
    },
    If {
        condition: Spanned<Expr>,
        then_block: Vec<Spanned<Stmt>>,
        else_block: Vec<Spanned<Stmt>>,
    },
    Return(Option<Spanned<Expr>>),
    Expr(Spanned<Expr>),
}

/// A compiled script body: statements plus an optional trailing expression
/// whose value is the implicit result.
#[derive(Debug, Clone)]
pub struct Script {
    pub statements: Vec<Spanned<Stmt>>,
    pub tail: Option<Spanned<Expr>>,
}

impl Script {
    pub fn from_expression(expression: Spanned<Expr>) -> Self {
        Self {
            statements: Vec::new(),
            tail: Some(expression),
        }
    }
}

/// A function exported by a script module.
#[derive(Debug, Clone)]
pub struct FunctionDef {
    pub name: Arc<str>,
    pub parameters: Vec<Arc<str>>,
    pub body: Script,
}

/// Top-level item of a script module: an exported constant or function.
#[derive(Debug, Clone)]
pub enum ModuleItem {
    Const {
        name: Arc<str>,
        value: Spanned<Expr>,
    },
    Function(FunctionDef),
}

/// A compiled binding transform.
#[derive(Debug, Clone)]
pub enum TransformDef {
    /// `value => expr`
    Arrow {
        parameter: Arc<str>,
        body: Spanned<Expr>,
    },
    /// Full statement body; the raw value is bound as `value`.
    Block(Script),
}
