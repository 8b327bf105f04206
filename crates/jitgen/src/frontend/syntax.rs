//! Unresolved syntax tree built by the parser.
//!
//! Names are still plain strings here; the resolver turns this tree into the
//! slot-annotated [`crate::ast`] consumed by the code generator.

use std::rc::Rc;

use crate::ast::{BinaryOp, CompareOp, CountOp, UnaryOp};

#[derive(Debug, Clone)]
pub struct FunctionNode {
    pub name: Option<Rc<str>>,
    pub params: Vec<Rc<str>>,
    pub body: Vec<Stmt>,
    pub start: u32,
    pub end: u32,
    pub is_expression: bool,
}

#[derive(Debug, Clone)]
pub struct VarDecl {
    pub name: Rc<str>,
    pub init: Option<Expr>,
}

#[derive(Debug, Clone)]
pub enum ForInit {
    Var { is_const: bool, decls: Vec<VarDecl> },
    Expr(Expr),
}

#[derive(Debug, Clone)]
pub enum ForInTarget {
    Var(Rc<str>),
    Expr(Expr),
}

#[derive(Debug, Clone)]
pub struct Case {
    pub label: Option<Expr>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub struct CatchClause {
    pub name: Rc<str>,
    pub body: Vec<Stmt>,
}

#[derive(Debug, Clone)]
pub enum Stmt {
    Var {
        is_const: bool,
        decls: Vec<VarDecl>,
    },
    Function(Rc<FunctionNode>),
    Block(Vec<Stmt>),
    Expr(Expr),
    Empty,
    If {
        condition: Expr,
        then_branch: Box<Stmt>,
        else_branch: Option<Box<Stmt>>,
    },
    DoWhile {
        body: Box<Stmt>,
        condition: Expr,
    },
    While {
        condition: Expr,
        body: Box<Stmt>,
    },
    For {
        init: Option<ForInit>,
        condition: Option<Expr>,
        next: Option<Expr>,
        body: Box<Stmt>,
    },
    ForIn {
        each: ForInTarget,
        object: Expr,
        body: Box<Stmt>,
    },
    Continue(Option<Rc<str>>),
    Break(Option<Rc<str>>),
    Return(Option<Expr>),
    With {
        object: Expr,
        body: Box<Stmt>,
    },
    Switch {
        tag: Expr,
        cases: Vec<Case>,
    },
    Labeled {
        label: Rc<str>,
        body: Box<Stmt>,
    },
    Throw(Expr),
    Try {
        block: Vec<Stmt>,
        catch: Option<CatchClause>,
        finally: Option<Vec<Stmt>>,
    },
    Debugger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyRole {
    Value,
    Getter,
    Setter,
}

#[derive(Debug, Clone)]
pub struct Property {
    pub key: PropertyKey,
    pub value: Expr,
    pub role: PropertyRole,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyKey {
    Name(Rc<str>),
    Number(f64),
}

#[derive(Debug, Clone)]
pub enum Expr {
    Number(f64),
    Str(Rc<str>),
    True,
    False,
    Null,
    This,
    Ident(Rc<str>),
    RegExp {
        pattern: Rc<str>,
        flags: Rc<str>,
    },
    /// `None` marks an elision.
    Array(Vec<Option<Expr>>),
    Object(Vec<Property>),
    Function(Rc<FunctionNode>),
    Member {
        object: Box<Expr>,
        key: Box<Expr>,
    },
    Call {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    New {
        callee: Box<Expr>,
        args: Vec<Expr>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expr>,
    },
    Count {
        op: CountOp,
        is_prefix: bool,
        target: Box<Expr>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Compare {
        op: CompareOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    Conditional {
        condition: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
    /// `target = value`, or `target op= value` when `op` is set.
    Assign {
        op: Option<BinaryOp>,
        target: Box<Expr>,
        value: Box<Expr>,
    },
}
