//! Resolved abstract syntax tree consumed by the code generator.
//!
//! Every variable reference already carries its storage [`Slot`]; scope
//! analysis happens before code generation (see the `frontend` module, or
//! supply a serialized tree directly).

use std::rc::Rc;

use serde::{Deserialize, Serialize};

/// Identity of a breakable statement, used by `break` and `continue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

/// One function (or a whole script / eval program) ready for compilation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionLiteral {
    pub name: String,
    pub scope: Scope,
    pub body: Vec<Statement>,
    pub start_position: u32,
    pub end_position: u32,
    /// Number of boilerplate slots (object, array and regexp literals).
    pub materialized_literal_count: usize,
    /// Expected number of named properties of objects constructed by `new`.
    pub expected_property_count: usize,
    pub is_expression: bool,
    /// Static loop nesting depth of the literal's definition site.
    pub loop_nesting: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScopeKind {
    Function,
    Global,
    Eval,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scope {
    pub kind: ScopeKind,
    pub num_parameters: usize,
    pub num_stack_slots: usize,
    /// Context slots including the reserved header slots; 0 when the
    /// function needs no heap context.
    pub num_heap_slots: usize,
    pub calls_eval: bool,
    /// Parameter variables in declaration order.
    pub parameters: Vec<Variable>,
    pub declarations: Vec<Declaration>,
    /// Message reported instead of running the body.
    pub illegal_redeclaration: Option<String>,
    /// The `arguments` variable and its hidden shadow, when used.
    pub arguments: Option<Variable>,
    pub arguments_shadow: Option<Variable>,
}

impl Scope {
    #[must_use]
    pub fn new(kind: ScopeKind) -> Self {
        Self {
            kind,
            num_parameters: 0,
            num_stack_slots: 0,
            num_heap_slots: 0,
            calls_eval: false,
            parameters: Vec::new(),
            declarations: Vec::new(),
            illegal_redeclaration: None,
            arguments: None,
            arguments_shadow: None,
        }
    }

    #[must_use]
    pub fn is_global(&self) -> bool {
        self.kind == ScopeKind::Global
    }

    #[must_use]
    pub fn is_eval(&self) -> bool {
        self.kind == ScopeKind::Eval
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VariableMode {
    Var,
    Const,
    /// Introduced by `with` or `eval`; always resolved by name at runtime.
    Dynamic,
    /// Compiler-introduced temporary.
    Temporary,
}

/// Where a variable lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Slot {
    Parameter(usize),
    Local(usize),
    /// Slot `index` of the function context `depth` closures out.
    Context { index: usize, depth: usize },
    /// Resolved by name through the context chain at runtime.
    Lookup,
    /// Property of the global object.
    Global,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: Rc<str>,
    pub mode: VariableMode,
    pub slot: Slot,
}

impl Variable {
    #[must_use]
    pub fn new(name: &str, mode: VariableMode, slot: Slot) -> Self {
        Self {
            name: Rc::from(name),
            mode,
            slot,
        }
    }

    #[must_use]
    pub fn is_global(&self) -> bool {
        self.slot == Slot::Global
    }

    #[must_use]
    pub fn is_const(&self) -> bool {
        self.mode == VariableMode::Const
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Declaration {
    pub variable: Variable,
    /// Only `Var` and `Const` are declared.
    pub mode: VariableMode,
    pub function: Option<Rc<FunctionLiteral>>,
}

// ── Statements ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopKind {
    DoWhile,
    While,
    For,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseClause {
    /// `None` for `default:`.
    pub label: Option<Expression>,
    pub statements: Vec<Statement>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Statement {
    Block {
        /// Present when the block is a `break` target.
        id: Option<NodeId>,
        statements: Vec<Statement>,
    },
    Expression(Expression),
    Empty,
    If {
        condition: Expression,
        then_statement: Box<Statement>,
        else_statement: Box<Statement>,
    },
    Continue {
        target: NodeId,
    },
    Break {
        target: NodeId,
    },
    Return(Expression),
    WithEnter {
        expression: Expression,
        is_catch_block: bool,
    },
    WithExit,
    Switch {
        id: NodeId,
        tag: Expression,
        cases: Vec<CaseClause>,
    },
    Loop {
        id: NodeId,
        kind: LoopKind,
        init: Option<Box<Statement>>,
        condition: Option<Expression>,
        next: Option<Box<Statement>>,
        body: Box<Statement>,
    },
    ForIn {
        id: NodeId,
        each: Expression,
        enumerable: Expression,
        body: Box<Statement>,
    },
    TryCatch {
        try_block: Vec<Statement>,
        /// Hidden temporary receiving the exception.
        catch_var: Variable,
        catch_block: Vec<Statement>,
    },
    TryFinally {
        try_block: Vec<Statement>,
        finally_block: Vec<Statement>,
    },
    Debugger,
}

// ── Expressions ──

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Undefined,
    Null,
    True,
    False,
    TheHole,
    Number(f64),
    String(Rc<str>),
}

impl Literal {
    /// The literal's value as a small integer, if it is one.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::float_cmp)]
    pub fn as_smi(&self) -> Option<i32> {
        match self {
            Self::Number(n) => {
                let value = *n;
                if value.fract() != 0.0 || value.is_nan() || value.is_infinite() {
                    return None;
                }
                if value == 0.0 && value.is_sign_negative() {
                    return None;
                }
                if value < f64::from(crate::layout::SMI_MIN)
                    || value > f64::from(crate::layout::SMI_MAX)
                {
                    return None;
                }
                Some(value as i32)
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

/// A string key that names an array element rather than a property.
#[must_use]
pub fn as_array_index(key: &str) -> Option<u32> {
    if key.is_empty() || key.len() > 10 {
        return None;
    }
    if key.len() > 1 && key.starts_with('0') {
        return None;
    }
    if !key.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: u64 = key.parse().ok()?;
    // 2^32 - 1 is not a valid index.
    u32::try_from(value).ok().filter(|v| *v != u32::MAX)
}

/// Value known at compile time, stored in literal boilerplates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CompileTimeValue {
    Literal(Literal),
    Object(Vec<(Literal, CompileTimeValue)>),
    Array(Vec<CompileTimeValue>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyKind {
    /// Value is part of the boilerplate.
    Constant,
    /// Nested literal; part of the boilerplate when it is a compile-time value.
    MaterializedLiteral,
    Computed,
    Getter,
    Setter,
    /// `__proto__: value`.
    Prototype,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectProperty {
    pub key: Literal,
    pub value: Expression,
    pub kind: PropertyKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnaryOp {
    Not,
    Delete,
    Typeof,
    Void,
    Add,
    Sub,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Comma,
    Or,
    And,
    BitOr,
    BitXor,
    BitAnd,
    Shl,
    Sar,
    Shr,
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl BinaryOp {
    /// Source spelling of the operator.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Comma => ",",
            Self::Or => "||",
            Self::And => "&&",
            Self::BitOr => "|",
            Self::BitXor => "^",
            Self::BitAnd => "&",
            Self::Shl => "<<",
            Self::Sar => ">>",
            Self::Shr => ">>>",
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Mod => "%",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Ne,
    StrictEq,
    StrictNe,
    Lt,
    Gt,
    Le,
    Ge,
    In,
    InstanceOf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AssignOp {
    Assign,
    /// Initialization of a `var` from its declaration.
    InitVar,
    /// Initialization of a `const`.
    InitConst,
    Compound(BinaryOp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CountOp {
    Inc,
    Dec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Expression {
    Literal(Literal),
    RegExpLiteral {
        pattern: Rc<str>,
        flags: Rc<str>,
        literal_index: usize,
    },
    ObjectLiteral {
        properties: Vec<ObjectProperty>,
        constant_properties: Vec<(Literal, CompileTimeValue)>,
        literal_index: usize,
        depth: usize,
    },
    ArrayLiteral {
        values: Vec<Expression>,
        /// Boilerplate contents; non-constant positions hold the hole.
        constant_elements: Vec<CompileTimeValue>,
        literal_index: usize,
        depth: usize,
    },
    Variable(Variable),
    This,
    ThisFunction,
    Property {
        object: Box<Expression>,
        key: Box<Expression>,
    },
    Assignment {
        op: AssignOp,
        target: Box<Expression>,
        value: Box<Expression>,
    },
    Throw(Box<Expression>),
    Call {
        callee: Box<Expression>,
        arguments: Vec<Expression>,
    },
    CallEval {
        callee: Box<Expression>,
        arguments: Vec<Expression>,
    },
    CallNew {
        callee: Box<Expression>,
        arguments: Vec<Expression>,
    },
    Unary {
        op: UnaryOp,
        operand: Box<Expression>,
    },
    Count {
        op: CountOp,
        is_prefix: bool,
        target: Box<Expression>,
    },
    Binary {
        op: BinaryOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Compare {
        op: CompareOp,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    Conditional {
        condition: Box<Expression>,
        then_expression: Box<Expression>,
        else_expression: Box<Expression>,
    },
    FunctionLiteral(Rc<FunctionLiteral>),
    CatchExtensionObject {
        key: Rc<str>,
        value: Box<Expression>,
    },
}

impl Expression {
    #[must_use]
    pub fn as_literal(&self) -> Option<&Literal> {
        match self {
            Self::Literal(literal) => Some(literal),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_smi_literal(&self) -> Option<i32> {
        self.as_literal().and_then(Literal::as_smi)
    }

    #[must_use]
    pub fn as_variable(&self) -> Option<&Variable> {
        match self {
            Self::Variable(var) => Some(var),
            _ => None,
        }
    }

    /// Value of a literal node that is fully known at compile time.
    #[must_use]
    pub fn compile_time_value(&self) -> Option<CompileTimeValue> {
        match self {
            Self::Literal(literal) => Some(CompileTimeValue::Literal(literal.clone())),
            Self::ObjectLiteral {
                properties,
                constant_properties,
                ..
            } => {
                let simple = properties.iter().all(|p| match p.kind {
                    PropertyKind::Constant => true,
                    PropertyKind::MaterializedLiteral => p.value.compile_time_value().is_some(),
                    _ => false,
                });
                simple.then(|| CompileTimeValue::Object(constant_properties.clone()))
            }
            Self::ArrayLiteral {
                values,
                constant_elements,
                ..
            } => {
                let simple = values.iter().all(|v| v.compile_time_value().is_some());
                simple.then(|| CompileTimeValue::Array(constant_elements.clone()))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_index_keys() {
        assert_eq!(as_array_index("0"), Some(0));
        assert_eq!(as_array_index("42"), Some(42));
        assert_eq!(as_array_index("4294967294"), Some(4_294_967_294));
        assert_eq!(as_array_index("4294967295"), None);
        assert_eq!(as_array_index("007"), None);
        assert_eq!(as_array_index("x1"), None);
        assert_eq!(as_array_index(""), None);
    }

    #[test]
    fn test_smi_literals() {
        assert_eq!(Literal::Number(3.0).as_smi(), Some(3));
        assert_eq!(Literal::Number(-0.0).as_smi(), None);
        assert_eq!(Literal::Number(1.5).as_smi(), None);
        assert_eq!(Literal::Number(f64::from(1 << 30)).as_smi(), None);
        assert_eq!(Literal::String("1".into()).as_smi(), None);
    }
}
