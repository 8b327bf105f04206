//! Scope analysis and lowering of the syntax tree to the resolved AST.
//!
//! Resolution runs in two passes. [`Analyzer`] builds one [`ScopeInfo`] per
//! function, hoists declarations, records every name reference and then
//! decides where each variable lives. [`Lowerer`] walks the syntax tree again
//! and emits [`crate::ast`] nodes whose variables carry their final slots.
//!
//! A variable stays on the stack unless an inner function, an `eval` or a
//! `with` / `catch` region can observe it, in which case it moves into the
//! function's heap context. Names referenced inside `with` or `catch` regions,
//! and names that could be shadowed by code passed to `eval`, are looked up by
//! name at runtime.

use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use super::syntax::{
    Case, CatchClause, Expr, ForInTarget, ForInit, FunctionNode, Property, PropertyKey,
    PropertyRole, Stmt, VarDecl,
};
use crate::ast::{
    AssignOp, CaseClause, CompileTimeValue, Declaration, Expression, FunctionLiteral, Literal,
    LoopKind, NodeId, ObjectProperty, PropertyKind, Scope, ScopeKind, Slot, Statement, Variable,
    VariableMode, as_array_index,
};
use crate::layout::CONTEXT_MIN_SLOTS;
use crate::{Error, Result};

const ARGUMENTS: &str = "arguments";
const ARGUMENTS_SHADOW: &str = ".arguments";
const RESULT: &str = ".result";
const CATCH: &str = ".catch";

/// Resolves a parsed program of the given kind.
pub fn resolve(program: &FunctionNode, kind: ScopeKind) -> Result<FunctionLiteral> {
    if kind == ScopeKind::Function {
        return Err(Error::Resolve(
            "a program must be global or eval code".to_string(),
        ));
    }
    let tree = Analyzer::analyze(program, kind);
    Lowerer::lower(&tree, 0, program, 0)
}

// ── Scope information ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    Parameter(usize),
    Var,
    Const,
    Arguments,
    /// The name of a function expression, visible inside its body.
    SelfName,
}

#[derive(Debug, Clone)]
struct Entry {
    name: Rc<str>,
    kind: EntryKind,
    /// Function declared under this name, with the loop depth of its site.
    function: Option<(Rc<FunctionNode>, u32)>,
    /// Seen from an inner function or through a dynamic lookup.
    captured: bool,
    written: bool,
    slot: Slot,
}

impl Entry {
    fn new(name: &Rc<str>, kind: EntryKind) -> Self {
        Self {
            name: Rc::clone(name),
            kind,
            function: None,
            captured: false,
            written: false,
            slot: Slot::Lookup,
        }
    }

    fn mode(&self) -> VariableMode {
        match self.kind {
            EntryKind::Const | EntryKind::SelfName => VariableMode::Const,
            EntryKind::Parameter(_) | EntryKind::Var | EntryKind::Arguments => VariableMode::Var,
        }
    }

    fn variable(&self) -> Variable {
        Variable {
            name: Rc::clone(&self.name),
            mode: self.mode(),
            slot: self.slot,
        }
    }
}

#[derive(Debug)]
struct ScopeInfo {
    kind: ScopeKind,
    parent: Option<usize>,
    /// The function literal sits inside a `with` or `catch` region of its
    /// parent.
    defined_in_dynamic: bool,
    params: Vec<Rc<str>>,
    entries: Vec<Entry>,
    function_name: Option<Rc<str>>,
    calls_eval: bool,
    inner_calls_eval: bool,
    uses_arguments: bool,
    illegal_redeclaration: Option<String>,
    num_heap_slots: usize,
    num_locals: usize,
    arguments_shadow: Option<Slot>,
}

impl ScopeInfo {
    fn new(kind: ScopeKind, parent: Option<usize>, defined_in_dynamic: bool) -> Self {
        Self {
            kind,
            parent,
            defined_in_dynamic,
            params: Vec::new(),
            entries: Vec::new(),
            function_name: None,
            calls_eval: false,
            inner_calls_eval: false,
            uses_arguments: false,
            illegal_redeclaration: None,
            num_heap_slots: 0,
            num_locals: 0,
            arguments_shadow: None,
        }
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|entry| &*entry.name == name)
    }

    fn add_parameter(&mut self, name: &Rc<str>, index: usize) {
        self.params.push(Rc::clone(name));
        // A repeated parameter name refers to the last one.
        match self.find(name) {
            Some(existing) => self.entries[existing].kind = EntryKind::Parameter(index),
            None => self.entries.push(Entry::new(name, EntryKind::Parameter(index))),
        }
    }

    fn declare(&mut self, declaration: Hoisted) {
        let (name, is_const, function) = match declaration {
            Hoisted::Var { name, is_const } => (name, is_const, None),
            Hoisted::Function { node, loop_depth } => match node.name.clone() {
                Some(name) => (name, false, Some((node, loop_depth))),
                None => return,
            },
        };
        let Some(existing) = self.find(&name) else {
            let kind = if is_const {
                EntryKind::Const
            } else {
                EntryKind::Var
            };
            let mut entry = Entry::new(&name, kind);
            entry.function = function;
            self.entries.push(entry);
            return;
        };
        let entry = &mut self.entries[existing];
        match (entry.kind, is_const) {
            (EntryKind::Const, false) => self.report_redeclaration("const", &name),
            (EntryKind::Parameter(_) | EntryKind::Var, true) => {
                self.report_redeclaration("var", &name);
            }
            _ => {
                if function.is_some() {
                    entry.function = function;
                }
            }
        }
    }

    fn report_redeclaration(&mut self, kind: &str, name: &str) {
        if self.illegal_redeclaration.is_none() {
            self.illegal_redeclaration = Some(format!("redeclaration of {kind} {name}"));
        }
    }

    fn self_name_materialized(&self, entry: &Entry) -> bool {
        entry.captured || entry.written || self.calls_eval || self.inner_calls_eval
    }
}

/// Declarations found while hoisting a function body.
enum Hoisted {
    Var { name: Rc<str>, is_const: bool },
    Function { node: Rc<FunctionNode>, loop_depth: u32 },
}

/// Collects the declarations of `statements` in source order, without
/// entering nested functions.
fn hoist(statements: &[Stmt], loop_depth: u32, out: &mut Vec<Hoisted>) {
    for statement in statements {
        hoist_statement(statement, loop_depth, out);
    }
}

fn hoist_statement(statement: &Stmt, loop_depth: u32, out: &mut Vec<Hoisted>) {
    match statement {
        Stmt::Var { is_const, decls } => hoist_vars(*is_const, decls, out),
        Stmt::Function(node) => out.push(Hoisted::Function {
            node: Rc::clone(node),
            loop_depth,
        }),
        Stmt::Block(statements) => hoist(statements, loop_depth, out),
        Stmt::If {
            then_branch,
            else_branch,
            ..
        } => {
            hoist_statement(then_branch, loop_depth, out);
            if let Some(else_branch) = else_branch {
                hoist_statement(else_branch, loop_depth, out);
            }
        }
        Stmt::DoWhile { body, .. } | Stmt::While { body, .. } => {
            hoist_statement(body, loop_depth + 1, out);
        }
        Stmt::For { init, body, .. } => {
            if let Some(ForInit::Var { is_const, decls }) = init {
                hoist_vars(*is_const, decls, out);
            }
            hoist_statement(body, loop_depth + 1, out);
        }
        Stmt::ForIn { each, body, .. } => {
            if let ForInTarget::Var(name) = each {
                out.push(Hoisted::Var {
                    name: Rc::clone(name),
                    is_const: false,
                });
            }
            hoist_statement(body, loop_depth + 1, out);
        }
        Stmt::With { body, .. } | Stmt::Labeled { body, .. } => {
            hoist_statement(body, loop_depth, out);
        }
        Stmt::Switch { cases, .. } => {
            for case in cases {
                hoist(&case.body, loop_depth, out);
            }
        }
        Stmt::Try {
            block,
            catch,
            finally,
        } => {
            hoist(block, loop_depth, out);
            if let Some(catch) = catch {
                hoist(&catch.body, loop_depth, out);
            }
            if let Some(finally) = finally {
                hoist(finally, loop_depth, out);
            }
        }
        Stmt::Expr(_)
        | Stmt::Empty
        | Stmt::Continue(_)
        | Stmt::Break(_)
        | Stmt::Return(_)
        | Stmt::Throw(_)
        | Stmt::Debugger => {}
    }
}

fn hoist_vars(is_const: bool, decls: &[VarDecl], out: &mut Vec<Hoisted>) {
    for decl in decls {
        out.push(Hoisted::Var {
            name: Rc::clone(&decl.name),
            is_const,
        });
    }
}

/// Where a name reference statically leads.
#[derive(Debug, Clone, Copy)]
enum Located {
    Entry {
        owner: usize,
        entry: usize,
        dynamic: bool,
    },
    Unresolved {
        dynamic: bool,
    },
}

#[derive(Debug)]
struct ScopeTree {
    scopes: Vec<ScopeInfo>,
    ids: HashMap<*const FunctionNode, usize>,
}

impl ScopeTree {
    /// Follows `name` outwards from scope `from`. A lookup becomes dynamic
    /// when it starts inside a `with` or `catch` region, leaves a function
    /// defined in one, or passes a scope whose variables `eval` can extend.
    fn locate(&self, from: usize, name: &str, dynamic: bool) -> Located {
        let mut dynamic = dynamic;
        let mut current = from;
        loop {
            let scope = &self.scopes[current];
            if let Some(entry) = scope.find(name) {
                return Located::Entry {
                    owner: current,
                    entry,
                    dynamic,
                };
            }
            let extensible = scope.kind == ScopeKind::Eval
                || (scope.kind == ScopeKind::Function && scope.calls_eval);
            if extensible || scope.defined_in_dynamic {
                dynamic = true;
            }
            match scope.parent {
                Some(parent) => current = parent,
                None => return Located::Unresolved { dynamic },
            }
        }
    }

    /// Number of heap contexts between scope `from` and its ancestor `owner`.
    fn context_depth(&self, from: usize, owner: usize) -> Result<usize> {
        let mut depth = 0;
        let mut current = from;
        while current != owner {
            let scope = &self.scopes[current];
            if scope.num_heap_slots > 0 {
                depth += 1;
            }
            current = scope
                .parent
                .ok_or_else(|| Error::Internal(format!("scope {owner} is not an ancestor")))?;
        }
        Ok(depth)
    }

    /// The expression a name reference in scope `from` lowers to.
    fn bind(&self, from: usize, name: &Rc<str>, dynamic: bool) -> Result<Expression> {
        let lookup = || {
            Expression::Variable(Variable {
                name: Rc::clone(name),
                mode: VariableMode::Dynamic,
                slot: Slot::Lookup,
            })
        };
        let (owner, index, dynamic) = match self.locate(from, name, dynamic) {
            Located::Unresolved { dynamic: true } => return Ok(lookup()),
            Located::Unresolved { dynamic: false } => {
                return Ok(Expression::Variable(Variable {
                    name: Rc::clone(name),
                    mode: VariableMode::Var,
                    slot: Slot::Global,
                }));
            }
            Located::Entry {
                owner,
                entry,
                dynamic,
            } => (owner, entry, dynamic),
        };
        let scope = &self.scopes[owner];
        let entry = &scope.entries[index];
        match scope.kind {
            ScopeKind::Eval => return Ok(lookup()),
            ScopeKind::Global if dynamic => return Ok(lookup()),
            ScopeKind::Global => {
                return Ok(Expression::Variable(Variable {
                    name: Rc::clone(name),
                    mode: entry.mode(),
                    slot: Slot::Global,
                }));
            }
            ScopeKind::Function if dynamic => return Ok(lookup()),
            ScopeKind::Function => {}
        }
        if entry.kind == EntryKind::SelfName && !scope.self_name_materialized(entry) {
            return Ok(Expression::ThisFunction);
        }
        let slot = match entry.slot {
            Slot::Context { index, .. } => Slot::Context {
                index,
                depth: self.context_depth(from, owner)?,
            },
            slot @ (Slot::Parameter(_) | Slot::Local(_)) if owner == from => slot,
            slot => {
                return Err(Error::Internal(format!(
                    "{name} resolved to {slot:?} of an outer function"
                )));
            }
        };
        Ok(Expression::Variable(Variable {
            name: Rc::clone(name),
            mode: entry.mode(),
            slot,
        }))
    }
}

// ── Analysis ──

struct PendingReference {
    scope: usize,
    name: Rc<str>,
    dynamic: bool,
    is_write: bool,
}

struct Analyzer {
    scopes: Vec<ScopeInfo>,
    ids: HashMap<*const FunctionNode, usize>,
    references: Vec<PendingReference>,
    current: usize,
    dynamic: bool,
}

impl Analyzer {
    fn analyze(program: &FunctionNode, kind: ScopeKind) -> ScopeTree {
        let mut analyzer = Self {
            scopes: Vec::new(),
            ids: HashMap::new(),
            references: Vec::new(),
            current: 0,
            dynamic: false,
        };
        analyzer.current = analyzer.new_scope(kind, None, false, program);
        analyzer.walk_statements(&program.body);
        analyzer.finish()
    }

    fn new_scope(
        &mut self,
        kind: ScopeKind,
        parent: Option<usize>,
        defined_in_dynamic: bool,
        node: &FunctionNode,
    ) -> usize {
        let mut scope = ScopeInfo::new(kind, parent, defined_in_dynamic);
        for (index, param) in node.params.iter().enumerate() {
            scope.add_parameter(param, index);
        }
        if kind == ScopeKind::Function && node.is_expression {
            scope.function_name = node.name.clone();
        }
        let mut hoisted = Vec::new();
        hoist(&node.body, 0, &mut hoisted);
        for declaration in hoisted {
            scope.declare(declaration);
        }
        self.scopes.push(scope);
        self.scopes.len() - 1
    }

    fn enter_function(&mut self, node: &Rc<FunctionNode>, defined_in_dynamic: bool) {
        let id = self.new_scope(
            ScopeKind::Function,
            Some(self.current),
            defined_in_dynamic,
            node,
        );
        self.ids.insert(Rc::as_ptr(node), id);
        let saved = (self.current, self.dynamic);
        self.current = id;
        self.dynamic = false;
        self.walk_statements(&node.body);
        (self.current, self.dynamic) = saved;
    }

    fn reference(&mut self, name: &Rc<str>, is_write: bool) {
        if &**name == ARGUMENTS {
            self.scopes[self.current].uses_arguments = true;
        }
        self.references.push(PendingReference {
            scope: self.current,
            name: Rc::clone(name),
            dynamic: self.dynamic,
            is_write,
        });
    }

    fn in_dynamic_region(&mut self, walk: impl FnOnce(&mut Self)) {
        let saved = std::mem::replace(&mut self.dynamic, true);
        walk(self);
        self.dynamic = saved;
    }

    fn walk_statements(&mut self, statements: &[Stmt]) {
        for statement in statements {
            self.walk_statement(statement);
        }
    }

    fn walk_statement(&mut self, statement: &Stmt) {
        match statement {
            Stmt::Var { decls, .. } => self.walk_declarations(decls),
            // Declared functions are instantiated on entry, outside any
            // with or catch region.
            Stmt::Function(node) => self.enter_function(node, false),
            Stmt::Block(statements) => self.walk_statements(statements),
            Stmt::Expr(expr) | Stmt::Throw(expr) | Stmt::Return(Some(expr)) => {
                self.walk_expr(expr);
            }
            Stmt::If {
                condition,
                then_branch,
                else_branch,
            } => {
                self.walk_expr(condition);
                self.walk_statement(then_branch);
                if let Some(else_branch) = else_branch {
                    self.walk_statement(else_branch);
                }
            }
            Stmt::DoWhile { body, condition } | Stmt::While { condition, body } => {
                self.walk_expr(condition);
                self.walk_statement(body);
            }
            Stmt::For {
                init,
                condition,
                next,
                body,
            } => {
                match init {
                    Some(ForInit::Var { decls, .. }) => self.walk_declarations(decls),
                    Some(ForInit::Expr(expr)) => self.walk_expr(expr),
                    None => {}
                }
                for expr in [condition, next].into_iter().flatten() {
                    self.walk_expr(expr);
                }
                self.walk_statement(body);
            }
            Stmt::ForIn { each, object, body } => {
                match each {
                    ForInTarget::Var(name) => self.reference(name, true),
                    ForInTarget::Expr(expr) => self.walk_expr(expr),
                }
                self.walk_expr(object);
                self.walk_statement(body);
            }
            Stmt::With { object, body } => {
                self.walk_expr(object);
                self.in_dynamic_region(|analyzer| analyzer.walk_statement(body));
            }
            Stmt::Switch { tag, cases } => {
                self.walk_expr(tag);
                for case in cases {
                    if let Some(label) = &case.label {
                        self.walk_expr(label);
                    }
                    self.walk_statements(&case.body);
                }
            }
            Stmt::Labeled { body, .. } => self.walk_statement(body),
            Stmt::Try {
                block,
                catch,
                finally,
            } => {
                self.walk_statements(block);
                if let Some(catch) = catch {
                    self.in_dynamic_region(|analyzer| analyzer.walk_statements(&catch.body));
                }
                if let Some(finally) = finally {
                    self.walk_statements(finally);
                }
            }
            Stmt::Empty
            | Stmt::Continue(_)
            | Stmt::Break(_)
            | Stmt::Return(None)
            | Stmt::Debugger => {}
        }
    }

    fn walk_declarations(&mut self, decls: &[VarDecl]) {
        for decl in decls {
            if let Some(init) = &decl.init {
                self.reference(&decl.name, true);
                self.walk_expr(init);
            }
        }
    }

    fn walk_expr(&mut self, expr: &Expr) {
        match expr {
            Expr::Number(_)
            | Expr::Str(_)
            | Expr::True
            | Expr::False
            | Expr::Null
            | Expr::This
            | Expr::RegExp { .. } => {}
            Expr::Ident(name) => self.reference(name, false),
            Expr::Array(elements) => {
                for element in elements.iter().flatten() {
                    self.walk_expr(element);
                }
            }
            Expr::Object(properties) => {
                for property in properties {
                    self.walk_expr(&property.value);
                }
            }
            Expr::Function(node) => self.enter_function(node, self.dynamic),
            Expr::Member { object, key } => {
                self.walk_expr(object);
                self.walk_expr(key);
            }
            Expr::Call { callee, args } => {
                if matches!(&**callee, Expr::Ident(name) if &**name == "eval") {
                    self.scopes[self.current].calls_eval = true;
                }
                self.walk_expr(callee);
                for arg in args {
                    self.walk_expr(arg);
                }
            }
            Expr::New { callee, args } => {
                self.walk_expr(callee);
                for arg in args {
                    self.walk_expr(arg);
                }
            }
            Expr::Unary { operand, .. } => self.walk_expr(operand),
            Expr::Count { target, .. } => self.walk_target(target),
            Expr::Binary { left, right, .. } | Expr::Compare { left, right, .. } => {
                self.walk_expr(left);
                self.walk_expr(right);
            }
            Expr::Conditional {
                condition,
                then_expr,
                else_expr,
            } => {
                self.walk_expr(condition);
                self.walk_expr(then_expr);
                self.walk_expr(else_expr);
            }
            Expr::Assign { target, value, .. } => {
                self.walk_target(target);
                self.walk_expr(value);
            }
        }
    }

    fn walk_target(&mut self, target: &Expr) {
        match target {
            Expr::Ident(name) => self.reference(name, true),
            other => self.walk_expr(other),
        }
    }

    fn finish(mut self) -> ScopeTree {
        for scope in &mut self.scopes {
            if scope.kind != ScopeKind::Function {
                continue;
            }
            let shadowed_by_parameter = scope.params.iter().any(|p| &**p == ARGUMENTS);
            if (scope.uses_arguments || scope.calls_eval) && !shadowed_by_parameter {
                match scope.find(ARGUMENTS) {
                    Some(index) if scope.entries[index].kind == EntryKind::Var => {
                        scope.entries[index].kind = EntryKind::Arguments;
                    }
                    Some(_) => {}
                    None => {
                        let name: Rc<str> = Rc::from(ARGUMENTS);
                        scope.entries.push(Entry::new(&name, EntryKind::Arguments));
                    }
                }
            }
            if let Some(name) = scope.function_name.clone() {
                if scope.find(&name).is_none() {
                    scope.entries.push(Entry::new(&name, EntryKind::SelfName));
                }
            }
        }

        for index in 0..self.scopes.len() {
            if !self.scopes[index].calls_eval {
                continue;
            }
            let mut parent = self.scopes[index].parent;
            while let Some(current) = parent {
                self.scopes[current].inner_calls_eval = true;
                parent = self.scopes[current].parent;
            }
        }

        let mut tree = ScopeTree {
            scopes: self.scopes,
            ids: self.ids,
        };
        for reference in &self.references {
            let Located::Entry {
                owner,
                entry,
                dynamic,
            } = tree.locate(reference.scope, &reference.name, reference.dynamic)
            else {
                continue;
            };
            let entry = &mut tree.scopes[owner].entries[entry];
            if owner != reference.scope || dynamic {
                entry.captured = true;
            }
            if reference.is_write {
                entry.written = true;
            }
        }
        for scope in &mut tree.scopes {
            allocate(scope);
        }
        tree
    }
}

/// Assigns every variable of `scope` its slot.
fn allocate(scope: &mut ScopeInfo) {
    match scope.kind {
        ScopeKind::Global => {
            for entry in &mut scope.entries {
                entry.slot = Slot::Global;
            }
            return;
        }
        ScopeKind::Eval => {
            for entry in &mut scope.entries {
                entry.slot = Slot::Lookup;
            }
            return;
        }
        ScopeKind::Function => {}
    }

    let force_context = scope.calls_eval || scope.inner_calls_eval;
    let mut next_context = CONTEXT_MIN_SLOTS;
    let mut next_local = 0;
    for index in 0..scope.entries.len() {
        let entry = &scope.entries[index];
        if entry.kind == EntryKind::SelfName && !scope.self_name_materialized(entry) {
            continue;
        }
        let slot = if force_context || entry.captured {
            next_context += 1;
            Slot::Context {
                index: next_context - 1,
                depth: 0,
            }
        } else if let EntryKind::Parameter(parameter) = entry.kind {
            Slot::Parameter(parameter)
        } else {
            next_local += 1;
            Slot::Local(next_local - 1)
        };
        scope.entries[index].slot = slot;
    }
    if scope.entries.iter().any(|e| e.kind == EntryKind::Arguments) {
        scope.arguments_shadow = Some(Slot::Local(next_local));
        next_local += 1;
    }
    scope.num_locals = next_local;
    scope.num_heap_slots = if next_context > CONTEXT_MIN_SLOTS || scope.calls_eval {
        next_context
    } else {
        0
    };
}

// ── Lowering ──

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakableKind {
    Loop,
    Switch,
    Block,
}

struct Breakable {
    id: NodeId,
    labels: Vec<Rc<str>>,
    kind: BreakableKind,
}

struct Lowerer<'t> {
    tree: &'t ScopeTree,
    scope: usize,
    next_local: usize,
    literal_count: usize,
    this_properties: BTreeSet<Rc<str>>,
    breakables: Vec<Breakable>,
    next_node: u32,
    loop_depth: u32,
    dynamic: bool,
    /// Receives the value of expression statements in global and eval code.
    completion: Option<Variable>,
}

impl<'t> Lowerer<'t> {
    fn lower(
        tree: &'t ScopeTree,
        scope: usize,
        node: &FunctionNode,
        loop_nesting: u32,
    ) -> Result<FunctionLiteral> {
        let info = &tree.scopes[scope];
        let mut lowerer = Self {
            tree,
            scope,
            next_local: info.num_locals,
            literal_count: 0,
            this_properties: BTreeSet::new(),
            breakables: Vec::new(),
            next_node: 0,
            loop_depth: 0,
            dynamic: false,
            completion: None,
        };
        if info.kind != ScopeKind::Function {
            lowerer.completion = Some(lowerer.temporary(RESULT));
        }

        let parameters = lowerer.parameters();
        let (arguments, arguments_shadow) = lowerer.arguments();
        let declarations = lowerer.declarations()?;

        let mut body = Vec::new();
        if let Some(self_name) = lowerer.materialized_self_name() {
            body.push(Statement::Expression(Expression::Assignment {
                op: AssignOp::InitConst,
                target: Box::new(Expression::Variable(self_name)),
                value: Box::new(Expression::ThisFunction),
            }));
        }
        body.extend(lowerer.statements(&node.body)?);
        if let Some(result) = lowerer.completion.clone() {
            body.push(Statement::Return(Expression::Variable(result)));
        }

        Ok(FunctionLiteral {
            name: node.name.as_deref().unwrap_or_default().to_string(),
            scope: Scope {
                kind: info.kind,
                num_parameters: info.params.len(),
                num_stack_slots: lowerer.next_local,
                num_heap_slots: info.num_heap_slots,
                calls_eval: info.calls_eval,
                parameters,
                declarations,
                illegal_redeclaration: info.illegal_redeclaration.clone(),
                arguments,
                arguments_shadow,
            },
            body,
            start_position: node.start,
            end_position: node.end,
            materialized_literal_count: lowerer.literal_count,
            expected_property_count: lowerer.this_properties.len(),
            is_expression: node.is_expression,
            loop_nesting,
        })
    }

    fn info(&self) -> &'t ScopeInfo {
        &self.tree.scopes[self.scope]
    }

    fn temporary(&mut self, name: &str) -> Variable {
        self.next_local += 1;
        Variable::new(
            name,
            VariableMode::Temporary,
            Slot::Local(self.next_local - 1),
        )
    }

    fn node_id(&mut self) -> NodeId {
        self.next_node += 1;
        NodeId(self.next_node - 1)
    }

    fn literal_index(&mut self) -> usize {
        self.literal_count += 1;
        self.literal_count - 1
    }

    fn parameters(&self) -> Vec<Variable> {
        let info = self.info();
        info.params
            .iter()
            .enumerate()
            .map(|(index, name)| {
                let slot = info
                    .find(name)
                    .map(|entry| &info.entries[entry])
                    .filter(|entry| entry.kind == EntryKind::Parameter(index))
                    .map_or(Slot::Parameter(index), |entry| entry.slot);
                Variable::new(name, VariableMode::Var, slot)
            })
            .collect()
    }

    fn arguments(&self) -> (Option<Variable>, Option<Variable>) {
        let info = self.info();
        let arguments = info
            .entries
            .iter()
            .find(|entry| entry.kind == EntryKind::Arguments)
            .map(Entry::variable);
        let shadow = info
            .arguments_shadow
            .map(|slot| Variable::new(ARGUMENTS_SHADOW, VariableMode::Temporary, slot));
        (arguments, shadow)
    }

    fn materialized_self_name(&self) -> Option<Variable> {
        let info = self.info();
        info.entries
            .iter()
            .find(|entry| entry.kind == EntryKind::SelfName)
            .filter(|entry| info.self_name_materialized(entry))
            .map(Entry::variable)
    }

    fn declarations(&mut self) -> Result<Vec<Declaration>> {
        let info = self.info();
        let mut declarations = Vec::new();
        for entry in &info.entries {
            let mode = entry.mode();
            let declared = match entry.kind {
                EntryKind::Var | EntryKind::Const => true,
                EntryKind::Parameter(_) | EntryKind::Arguments => entry.function.is_some(),
                EntryKind::SelfName => info.self_name_materialized(entry),
            };
            if !declared {
                continue;
            }
            let function = match &entry.function {
                Some((node, loop_depth)) => Some(self.function_literal(node, *loop_depth)?),
                None => None,
            };
            declarations.push(Declaration {
                variable: entry.variable(),
                mode,
                function,
            });
        }
        Ok(declarations)
    }

    fn function_literal(
        &self,
        node: &Rc<FunctionNode>,
        loop_nesting: u32,
    ) -> Result<Rc<FunctionLiteral>> {
        let scope = self
            .tree
            .ids
            .get(&Rc::as_ptr(node))
            .copied()
            .ok_or_else(|| Error::Internal("function literal without a scope".to_string()))?;
        Self::lower(self.tree, scope, node, loop_nesting).map(Rc::new)
    }

    fn identifier(&self, name: &Rc<str>) -> Result<Expression> {
        self.tree.bind(self.scope, name, self.dynamic)
    }

    fn in_dynamic_region<T>(&mut self, lower: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        let saved = std::mem::replace(&mut self.dynamic, true);
        let result = lower(self);
        self.dynamic = saved;
        result
    }

    // ── Statements ──

    fn statements(&mut self, statements: &[Stmt]) -> Result<Vec<Statement>> {
        statements
            .iter()
            .map(|statement| self.statement(statement))
            .collect()
    }

    fn statement(&mut self, statement: &Stmt) -> Result<Statement> {
        match statement {
            Stmt::Var { is_const, decls } => self.var_declarations(*is_const, decls),
            // Hoisted into the scope's declarations.
            Stmt::Function(_) | Stmt::Empty => Ok(Statement::Empty),
            Stmt::Block(statements) => Ok(Statement::Block {
                id: None,
                statements: self.statements(statements)?,
            }),
            Stmt::Expr(expr) => {
                let value = self.expression(expr)?;
                Ok(Statement::Expression(match self.completion.clone() {
                    Some(result) => Expression::Assignment {
                        op: AssignOp::Assign,
                        target: Box::new(Expression::Variable(result)),
                        value: Box::new(value),
                    },
                    None => value,
                }))
            }
            Stmt::If {
                condition,
                then_branch,
                else_branch,
            } => Ok(Statement::If {
                condition: self.expression(condition)?,
                then_statement: Box::new(self.statement(then_branch)?),
                else_statement: Box::new(match else_branch {
                    Some(else_branch) => self.statement(else_branch)?,
                    None => Statement::Empty,
                }),
            }),
            Stmt::DoWhile { .. } | Stmt::While { .. } | Stmt::For { .. } | Stmt::ForIn { .. } => {
                self.iteration(statement, Vec::new())
            }
            Stmt::Continue(label) => self.continue_statement(label.as_ref()),
            Stmt::Break(label) => self.break_statement(label.as_ref()),
            Stmt::Return(value) => {
                if self.info().kind != ScopeKind::Function {
                    return Err(Error::Resolve("illegal return statement".to_string()));
                }
                let value = match value {
                    Some(value) => self.expression(value)?,
                    None => Expression::Literal(Literal::Undefined),
                };
                Ok(Statement::Return(value))
            }
            Stmt::With { object, body } => {
                let expression = self.expression(object)?;
                let body = self.in_dynamic_region(|lowerer| lowerer.statement(body))?;
                Ok(Statement::Block {
                    id: None,
                    statements: vec![
                        Statement::WithEnter {
                            expression,
                            is_catch_block: false,
                        },
                        Statement::TryFinally {
                            try_block: vec![body],
                            finally_block: vec![Statement::WithExit],
                        },
                    ],
                })
            }
            Stmt::Switch { tag, cases } => self.switch(tag, cases, Vec::new()),
            Stmt::Labeled { .. } => self.labeled(statement),
            Stmt::Throw(value) => Ok(Statement::Expression(Expression::Throw(Box::new(
                self.expression(value)?,
            )))),
            Stmt::Try {
                block,
                catch,
                finally,
            } => self.try_statement(block, catch.as_ref(), finally.as_deref()),
            Stmt::Debugger => Ok(Statement::Debugger),
        }
    }

    fn var_declarations(&mut self, is_const: bool, decls: &[VarDecl]) -> Result<Statement> {
        let op = if is_const {
            AssignOp::InitConst
        } else {
            AssignOp::InitVar
        };
        let mut statements = Vec::new();
        for decl in decls {
            let Some(init) = &decl.init else {
                continue;
            };
            let target = self.identifier(&decl.name)?;
            let value = self.expression(init)?;
            statements.push(Statement::Expression(Expression::Assignment {
                op,
                target: Box::new(target),
                value: Box::new(value),
            }));
        }
        Ok(match statements.len() {
            0 => Statement::Empty,
            1 => statements.remove(0),
            _ => Statement::Block {
                id: None,
                statements,
            },
        })
    }

    fn labeled(&mut self, statement: &Stmt) -> Result<Statement> {
        let mut labels = Vec::new();
        let mut inner = statement;
        while let Stmt::Labeled { label, body } = inner {
            labels.push(Rc::clone(label));
            inner = body;
        }
        match inner {
            Stmt::DoWhile { .. } | Stmt::While { .. } | Stmt::For { .. } | Stmt::ForIn { .. } => {
                self.iteration(inner, labels)
            }
            Stmt::Switch { tag, cases } => self.switch(tag, cases, labels),
            other => {
                let id = self.node_id();
                self.breakables.push(Breakable {
                    id,
                    labels,
                    kind: BreakableKind::Block,
                });
                let lowered = self.statement(other);
                self.breakables.pop();
                Ok(Statement::Block {
                    id: Some(id),
                    statements: vec![lowered?],
                })
            }
        }
    }

    fn iteration(&mut self, statement: &Stmt, labels: Vec<Rc<str>>) -> Result<Statement> {
        let id = self.node_id();
        self.breakables.push(Breakable {
            id,
            labels,
            kind: BreakableKind::Loop,
        });
        self.loop_depth += 1;
        let lowered = self.iteration_body(id, statement);
        self.loop_depth -= 1;
        self.breakables.pop();
        lowered
    }

    fn iteration_body(&mut self, id: NodeId, statement: &Stmt) -> Result<Statement> {
        match statement {
            Stmt::DoWhile { body, condition } => Ok(Statement::Loop {
                id,
                kind: LoopKind::DoWhile,
                init: None,
                condition: Some(self.expression(condition)?),
                next: None,
                body: Box::new(self.statement(body)?),
            }),
            Stmt::While { condition, body } => Ok(Statement::Loop {
                id,
                kind: LoopKind::While,
                init: None,
                condition: Some(self.expression(condition)?),
                next: None,
                body: Box::new(self.statement(body)?),
            }),
            Stmt::For {
                init,
                condition,
                next,
                body,
            } => {
                let init = match init {
                    Some(ForInit::Var { is_const, decls }) => {
                        Some(self.var_declarations(*is_const, decls)?)
                    }
                    Some(ForInit::Expr(expr)) => Some(Statement::Expression(self.expression(expr)?)),
                    None => None,
                }
                .filter(|init| !matches!(init, Statement::Empty));
                let condition = condition
                    .as_ref()
                    .map(|condition| self.expression(condition))
                    .transpose()?;
                let next = next
                    .as_ref()
                    .map(|next| self.expression(next).map(Statement::Expression))
                    .transpose()?;
                Ok(Statement::Loop {
                    id,
                    kind: LoopKind::For,
                    init: init.map(Box::new),
                    condition,
                    next: next.map(Box::new),
                    body: Box::new(self.statement(body)?),
                })
            }
            Stmt::ForIn { each, object, body } => {
                let each = match each {
                    ForInTarget::Var(name) => self.identifier(name)?,
                    ForInTarget::Expr(expr) => self.expression(expr)?,
                };
                Ok(Statement::ForIn {
                    id,
                    each,
                    enumerable: self.expression(object)?,
                    body: Box::new(self.statement(body)?),
                })
            }
            _ => Err(Error::Internal("not an iteration statement".to_string())),
        }
    }

    fn switch(&mut self, tag: &Expr, cases: &[Case], labels: Vec<Rc<str>>) -> Result<Statement> {
        let tag = self.expression(tag)?;
        let id = self.node_id();
        self.breakables.push(Breakable {
            id,
            labels,
            kind: BreakableKind::Switch,
        });
        let lowered = cases
            .iter()
            .map(|case| {
                Ok(CaseClause {
                    label: case
                        .label
                        .as_ref()
                        .map(|label| self.expression(label))
                        .transpose()?,
                    statements: self.statements(&case.body)?,
                })
            })
            .collect::<Result<Vec<_>>>();
        self.breakables.pop();
        Ok(Statement::Switch {
            id,
            tag,
            cases: lowered?,
        })
    }

    fn break_statement(&self, label: Option<&Rc<str>>) -> Result<Statement> {
        let target = self.breakables.iter().rev().find(|breakable| match label {
            Some(label) => breakable.labels.contains(label),
            None => breakable.kind != BreakableKind::Block,
        });
        match target {
            Some(breakable) => Ok(Statement::Break {
                target: breakable.id,
            }),
            None => Err(Error::Resolve(match label {
                Some(label) => format!("undefined label '{label}'"),
                None => "illegal break statement".to_string(),
            })),
        }
    }

    fn continue_statement(&self, label: Option<&Rc<str>>) -> Result<Statement> {
        let target = self.breakables.iter().rev().find(|breakable| match label {
            Some(label) => breakable.labels.contains(label),
            None => breakable.kind == BreakableKind::Loop,
        });
        match target {
            Some(breakable) if breakable.kind == BreakableKind::Loop => Ok(Statement::Continue {
                target: breakable.id,
            }),
            Some(_) => Err(Error::Resolve("illegal continue statement".to_string())),
            None => Err(Error::Resolve(match label {
                Some(label) => format!("undefined label '{label}'"),
                None => "illegal continue statement".to_string(),
            })),
        }
    }

    fn try_statement(
        &mut self,
        block: &[Stmt],
        catch: Option<&CatchClause>,
        finally: Option<&[Stmt]>,
    ) -> Result<Statement> {
        let try_block = self.statements(block)?;
        let protected = match catch {
            Some(clause) => self.try_catch(try_block, clause)?,
            None => {
                let finally_block = self.statements(finally.unwrap_or_default())?;
                return Ok(Statement::TryFinally {
                    try_block,
                    finally_block,
                });
            }
        };
        match finally {
            Some(finally) => Ok(Statement::TryFinally {
                try_block: vec![protected],
                finally_block: self.statements(finally)?,
            }),
            None => Ok(protected),
        }
    }

    /// The exception lands in a hidden temporary; the catch body runs with
    /// a context whose extension object binds the catch name to it.
    fn try_catch(&mut self, try_block: Vec<Statement>, clause: &CatchClause) -> Result<Statement> {
        let catch_var = self.temporary(CATCH);
        let body = self.in_dynamic_region(|lowerer| lowerer.statements(&clause.body))?;
        let enter = Statement::WithEnter {
            expression: Expression::CatchExtensionObject {
                key: Rc::clone(&clause.name),
                value: Box::new(Expression::Variable(catch_var.clone())),
            },
            is_catch_block: true,
        };
        let catch_block = if leaves_block(&clause.body) {
            vec![
                enter,
                Statement::TryFinally {
                    try_block: body,
                    finally_block: vec![Statement::WithExit],
                },
            ]
        } else {
            let mut catch_block = Vec::with_capacity(body.len() + 2);
            catch_block.push(enter);
            catch_block.extend(body);
            catch_block.push(Statement::WithExit);
            catch_block
        };
        Ok(Statement::TryCatch {
            try_block,
            catch_var,
            catch_block,
        })
    }

    // ── Expressions ──

    fn expression(&mut self, expr: &Expr) -> Result<Expression> {
        Ok(match expr {
            Expr::Number(value) => Expression::Literal(Literal::Number(*value)),
            Expr::Str(value) => Expression::Literal(Literal::String(Rc::clone(value))),
            Expr::True => Expression::Literal(Literal::True),
            Expr::False => Expression::Literal(Literal::False),
            Expr::Null => Expression::Literal(Literal::Null),
            Expr::This => Expression::This,
            Expr::Ident(name) => self.identifier(name)?,
            Expr::RegExp { pattern, flags } => Expression::RegExpLiteral {
                pattern: Rc::clone(pattern),
                flags: Rc::clone(flags),
                literal_index: self.literal_index(),
            },
            Expr::Array(elements) => self.array_literal(elements)?,
            Expr::Object(properties) => self.object_literal(properties)?,
            Expr::Function(node) => {
                Expression::FunctionLiteral(self.function_literal(node, self.loop_depth)?)
            }
            Expr::Member { object, key } => Expression::Property {
                object: Box::new(self.expression(object)?),
                key: Box::new(self.expression(key)?),
            },
            Expr::Call { callee, args } => {
                let is_eval = matches!(&**callee, Expr::Ident(name) if &**name == "eval");
                let callee = Box::new(self.expression(callee)?);
                let arguments = self.expressions(args)?;
                if is_eval {
                    Expression::CallEval { callee, arguments }
                } else {
                    Expression::Call { callee, arguments }
                }
            }
            Expr::New { callee, args } => Expression::CallNew {
                callee: Box::new(self.expression(callee)?),
                arguments: self.expressions(args)?,
            },
            Expr::Unary { op, operand } => Expression::Unary {
                op: *op,
                operand: Box::new(self.expression(operand)?),
            },
            Expr::Count {
                op,
                is_prefix,
                target,
            } => Expression::Count {
                op: *op,
                is_prefix: *is_prefix,
                target: Box::new(self.expression(target)?),
            },
            Expr::Binary { op, left, right } => Expression::Binary {
                op: *op,
                left: Box::new(self.expression(left)?),
                right: Box::new(self.expression(right)?),
            },
            Expr::Compare { op, left, right } => Expression::Compare {
                op: *op,
                left: Box::new(self.expression(left)?),
                right: Box::new(self.expression(right)?),
            },
            Expr::Conditional {
                condition,
                then_expr,
                else_expr,
            } => Expression::Conditional {
                condition: Box::new(self.expression(condition)?),
                then_expression: Box::new(self.expression(then_expr)?),
                else_expression: Box::new(self.expression(else_expr)?),
            },
            Expr::Assign { op, target, value } => {
                if let Expr::Member { object, key } = &**target {
                    if let (Expr::This, Expr::Str(name)) = (&**object, &**key) {
                        if as_array_index(name).is_none() {
                            self.this_properties.insert(Rc::clone(name));
                        }
                    }
                }
                Expression::Assignment {
                    op: op.map_or(AssignOp::Assign, AssignOp::Compound),
                    target: Box::new(self.expression(target)?),
                    value: Box::new(self.expression(value)?),
                }
            }
        })
    }

    fn expressions(&mut self, exprs: &[Expr]) -> Result<Vec<Expression>> {
        exprs.iter().map(|expr| self.expression(expr)).collect()
    }

    fn array_literal(&mut self, elements: &[Option<Expr>]) -> Result<Expression> {
        let literal_index = self.literal_index();
        let values = elements
            .iter()
            .map(|element| match element {
                Some(element) => self.expression(element),
                None => Ok(Expression::Literal(Literal::TheHole)),
            })
            .collect::<Result<Vec<_>>>()?;
        let mut depth = 1;
        let constant_elements = values
            .iter()
            .map(|value| match value.compile_time_value() {
                Some(constant) => {
                    depth = depth.max(1 + literal_depth(value));
                    constant
                }
                None => CompileTimeValue::Literal(Literal::TheHole),
            })
            .collect();
        Ok(Expression::ArrayLiteral {
            values,
            constant_elements,
            literal_index,
            depth,
        })
    }

    fn object_literal(&mut self, properties: &[Property]) -> Result<Expression> {
        let literal_index = self.literal_index();
        let mut lowered = Vec::with_capacity(properties.len());
        let mut constant_properties = Vec::new();
        let mut depth = 1;
        for property in properties {
            let key = property_key(&property.key);
            let value = self.expression(&property.value)?;
            let kind = match property.role {
                PropertyRole::Getter => PropertyKind::Getter,
                PropertyRole::Setter => PropertyKind::Setter,
                PropertyRole::Value if key.as_string() == Some("__proto__") => {
                    PropertyKind::Prototype
                }
                PropertyRole::Value => match value {
                    Expression::Literal(_) => PropertyKind::Constant,
                    Expression::ObjectLiteral { .. } | Expression::ArrayLiteral { .. } => {
                        PropertyKind::MaterializedLiteral
                    }
                    _ => PropertyKind::Computed,
                },
            };
            if matches!(
                kind,
                PropertyKind::Constant | PropertyKind::MaterializedLiteral | PropertyKind::Computed
            ) {
                let constant = match value.compile_time_value() {
                    Some(constant) => {
                        depth = depth.max(1 + literal_depth(&value));
                        constant
                    }
                    None => CompileTimeValue::Literal(Literal::Undefined),
                };
                constant_properties.push((key.clone(), constant));
            }
            lowered.push(ObjectProperty { key, value, kind });
        }
        Ok(Expression::ObjectLiteral {
            properties: lowered,
            constant_properties,
            literal_index,
            depth,
        })
    }
}

/// Nesting depth of an object or array literal; 0 for anything else.
fn literal_depth(expression: &Expression) -> usize {
    match expression {
        Expression::ObjectLiteral { depth, .. } | Expression::ArrayLiteral { depth, .. } => *depth,
        _ => 0,
    }
}

/// Object literal keys: array indices stay numbers, other numbers become
/// their string form.
#[allow(clippy::float_cmp)]
fn property_key(key: &PropertyKey) -> Literal {
    match key {
        PropertyKey::Name(name) => Literal::String(Rc::clone(name)),
        PropertyKey::Number(value) => {
            let index = *value as u32;
            if f64::from(index) == *value && index != u32::MAX {
                Literal::Number(f64::from(index))
            } else {
                Literal::String(Rc::from(value.to_string()))
            }
        }
    }
}

/// Whether control can leave `statements` by `break`, `continue` or `return`.
fn leaves_block(statements: &[Stmt]) -> bool {
    statements.iter().any(leaves_statement)
}

fn leaves_statement(statement: &Stmt) -> bool {
    match statement {
        Stmt::Break(_) | Stmt::Continue(_) | Stmt::Return(_) => true,
        Stmt::Block(statements) => leaves_block(statements),
        Stmt::If {
            then_branch,
            else_branch,
            ..
        } => leaves_statement(then_branch) || else_branch.as_deref().is_some_and(leaves_statement),
        Stmt::DoWhile { body, .. }
        | Stmt::While { body, .. }
        | Stmt::For { body, .. }
        | Stmt::ForIn { body, .. }
        | Stmt::With { body, .. }
        | Stmt::Labeled { body, .. } => leaves_statement(body),
        Stmt::Switch { cases, .. } => cases.iter().any(|case| leaves_block(&case.body)),
        Stmt::Try {
            block,
            catch,
            finally,
        } => {
            leaves_block(block)
                || catch.as_ref().is_some_and(|catch| leaves_block(&catch.body))
                || finally.as_deref().is_some_and(leaves_block)
        }
        Stmt::Var { .. }
        | Stmt::Function(_)
        | Stmt::Expr(_)
        | Stmt::Empty
        | Stmt::Throw(_)
        | Stmt::Debugger => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::lexer::Lexer;
    use crate::frontend::parser::Parser;

    fn resolve_source(source: &str, kind: ScopeKind) -> Result<FunctionLiteral> {
        let tokens = Lexer::new(source).scan_tokens()?;
        let program = Parser::new(tokens).parse()?;
        resolve(&program, kind)
    }

    fn global(source: &str) -> FunctionLiteral {
        resolve_source(source, ScopeKind::Global).unwrap()
    }

    /// The literal of the first function declared by the program.
    fn first_function(program: &FunctionLiteral) -> Rc<FunctionLiteral> {
        program
            .scope
            .declarations
            .iter()
            .find_map(|declaration| declaration.function.clone())
            .unwrap()
    }

    fn return_value(function: &FunctionLiteral) -> &Expression {
        function
            .body
            .iter()
            .find_map(|statement| match statement {
                Statement::Return(value) => Some(value),
                _ => None,
            })
            .unwrap()
    }

    #[test]
    fn test_program_completion_value() {
        let program = global("1; 2;");
        assert_eq!(program.scope.num_stack_slots, 1);
        assert_eq!(program.body.len(), 3);
        let Expression::Variable(result) = return_value(&program) else {
            panic!("expected the completion variable");
        };
        assert_eq!(result.slot, Slot::Local(0));
        assert_eq!(result.mode, VariableMode::Temporary);
    }

    #[test]
    fn test_global_declarations() {
        let program = global("var a = 1; const b = 2; function f() {} a;");
        let names: Vec<(&str, VariableMode, Slot)> = program
            .scope
            .declarations
            .iter()
            .map(|d| (&*d.variable.name, d.mode, d.variable.slot))
            .collect();
        assert_eq!(
            names,
            vec![
                ("a", VariableMode::Var, Slot::Global),
                ("b", VariableMode::Const, Slot::Global),
                ("f", VariableMode::Var, Slot::Global),
            ]
        );
        assert!(program.scope.declarations[2].function.is_some());
    }

    #[test]
    fn test_parameters_and_locals_stay_on_stack() {
        let program = global("function f(x, y) { var z = x; return z + y; }");
        let f = first_function(&program);
        assert_eq!(f.scope.num_parameters, 2);
        assert_eq!(f.scope.num_heap_slots, 0);
        assert_eq!(f.scope.num_stack_slots, 1);
        assert_eq!(f.scope.parameters[1].slot, Slot::Parameter(1));
        let Expression::Binary { left, right, .. } = return_value(&f) else {
            panic!("expected addition");
        };
        assert_eq!(left.as_variable().unwrap().slot, Slot::Local(0));
        assert_eq!(right.as_variable().unwrap().slot, Slot::Parameter(1));
    }

    #[test]
    fn test_captured_variables_move_to_context() {
        let program = global("function f(x) { var y = 1; return function () { return x + y; }; }");
        let f = first_function(&program);
        assert_eq!(f.scope.num_heap_slots, CONTEXT_MIN_SLOTS + 2);
        assert_eq!(
            f.scope.parameters[0].slot,
            Slot::Context {
                index: CONTEXT_MIN_SLOTS,
                depth: 0
            }
        );
        let Expression::FunctionLiteral(inner) = return_value(&f) else {
            panic!("expected a closure");
        };
        assert_eq!(inner.scope.num_heap_slots, 0);
        let Expression::Binary { left, right, .. } = return_value(inner) else {
            panic!("expected addition");
        };
        // The inner function has no context of its own.
        assert_eq!(
            left.as_variable().unwrap().slot,
            Slot::Context {
                index: CONTEXT_MIN_SLOTS,
                depth: 0
            }
        );
        assert_eq!(
            right.as_variable().unwrap().slot,
            Slot::Context {
                index: CONTEXT_MIN_SLOTS + 1,
                depth: 0
            }
        );
    }

    #[test]
    fn test_context_depth_counts_intermediate_contexts() {
        let program = global(
            "function f() { var a = 1; return function () { var b = 2; \
             return function () { return a + b; }; }; }",
        );
        let f = first_function(&program);
        let Expression::FunctionLiteral(middle) = return_value(&f) else {
            panic!("expected a closure");
        };
        assert_eq!(middle.scope.num_heap_slots, CONTEXT_MIN_SLOTS + 1);
        let Expression::FunctionLiteral(inner) = return_value(middle) else {
            panic!("expected a closure");
        };
        let Expression::Binary { left, right, .. } = return_value(inner) else {
            panic!("expected addition");
        };
        assert_eq!(
            left.as_variable().unwrap().slot,
            Slot::Context {
                index: CONTEXT_MIN_SLOTS,
                depth: 1
            }
        );
        assert_eq!(
            right.as_variable().unwrap().slot,
            Slot::Context {
                index: CONTEXT_MIN_SLOTS,
                depth: 0
            }
        );
    }

    #[test]
    fn test_with_makes_names_dynamic() {
        let program = global("function f(o) { var x = 1; with (o) { x; } return x; }");
        let f = first_function(&program);
        // x is visible to the runtime lookup, so it lives in the context.
        assert_eq!(
            f.scope.declarations[0].variable.slot,
            Slot::Context {
                index: CONTEXT_MIN_SLOTS,
                depth: 0
            }
        );
        let Statement::Block { statements, .. } = &f.body[1] else {
            panic!("expected the with block");
        };
        assert!(matches!(
            statements[0],
            Statement::WithEnter {
                is_catch_block: false,
                ..
            }
        ));
        let Statement::TryFinally {
            try_block,
            finally_block,
        } = &statements[1]
        else {
            panic!("expected the with body to be protected");
        };
        assert!(matches!(finally_block[..], [Statement::WithExit]));
        let Statement::Block { statements, .. } = &try_block[0] else {
            panic!("expected the body block");
        };
        let Statement::Expression(Expression::Variable(x)) = &statements[0] else {
            panic!("expected a variable load");
        };
        assert_eq!(x.slot, Slot::Lookup);
        assert_eq!(x.mode, VariableMode::Dynamic);
    }

    #[test]
    fn test_catch_lowering() {
        let program = global("try { throw 1; } catch (e) { e; }");
        let Statement::TryCatch {
            catch_var,
            catch_block,
            ..
        } = &program.body[0]
        else {
            panic!("expected try/catch");
        };
        assert_eq!(catch_var.slot, Slot::Local(1));
        assert!(matches!(
            &catch_block[0],
            Statement::WithEnter {
                expression: Expression::CatchExtensionObject { key, .. },
                is_catch_block: true,
            } if &**key == "e"
        ));
        assert!(matches!(catch_block.last(), Some(Statement::WithExit)));
    }

    #[test]
    fn test_catch_with_break_restores_context_in_finally() {
        let program = global("while (1) { try { throw 1; } catch (e) { break; } }");
        let Statement::Loop { body, .. } = &program.body[0] else {
            panic!("expected a loop");
        };
        let Statement::Block { statements, .. } = &**body else {
            panic!("expected the loop body");
        };
        let Statement::TryCatch { catch_block, .. } = &statements[0] else {
            panic!("expected try/catch");
        };
        assert_eq!(catch_block.len(), 2);
        assert!(matches!(catch_block[1], Statement::TryFinally { .. }));
    }

    #[test]
    fn test_eval_forces_context_and_lookup() {
        let program = global("function f(a) { var b; eval('a'); return c; }");
        let f = first_function(&program);
        assert!(f.scope.calls_eval);
        assert!(f.scope.arguments.is_some());
        assert!(matches!(f.scope.parameters[0].slot, Slot::Context { .. }));
        assert!(matches!(
            f.scope.declarations[0].variable.slot,
            Slot::Context { .. }
        ));
        // a, b and arguments.
        assert_eq!(f.scope.num_heap_slots, CONTEXT_MIN_SLOTS + 3);
        assert!(matches!(f.body[0], Statement::Empty));
        assert!(matches!(
            f.body[1],
            Statement::Expression(Expression::CallEval { .. })
        ));
        assert_eq!(return_value(&f).as_variable().unwrap().slot, Slot::Lookup);
    }

    #[test]
    fn test_eval_code_uses_lookup_slots() {
        let program = resolve_source("var x = 1; x + y;", ScopeKind::Eval).unwrap();
        assert_eq!(program.scope.num_heap_slots, 0);
        assert_eq!(program.scope.declarations[0].variable.slot, Slot::Lookup);
        let Statement::Expression(Expression::Assignment { target, .. }) = &program.body[0] else {
            panic!("expected the initialization");
        };
        assert_eq!(target.as_variable().unwrap().slot, Slot::Lookup);
    }

    #[test]
    fn test_arguments_object() {
        let program = global("function f() { return arguments.length; }");
        let f = first_function(&program);
        let arguments = f.scope.arguments.as_ref().unwrap();
        assert_eq!(arguments.slot, Slot::Local(0));
        let shadow = f.scope.arguments_shadow.as_ref().unwrap();
        assert_eq!(shadow.slot, Slot::Local(1));
        assert_eq!(f.scope.num_stack_slots, 2);
    }

    #[test]
    fn test_self_reference_from_inner_function_is_materialized() {
        let program = global("(function f() { return function () { return f; }; });");
        let Statement::Expression(Expression::Assignment { value, .. }) = &program.body[0] else {
            panic!("expected the completion assignment");
        };
        let Expression::FunctionLiteral(f) = &**value else {
            panic!("expected a function literal");
        };
        assert_eq!(f.scope.declarations.len(), 1);
        assert_eq!(f.scope.declarations[0].mode, VariableMode::Const);
        assert!(matches!(
            &f.body[0],
            Statement::Expression(Expression::Assignment {
                op: AssignOp::InitConst,
                value,
                ..
            }) if matches!(**value, Expression::ThisFunction)
        ));
    }

    #[test]
    fn test_direct_self_reference_is_this_function() {
        let program = global("(function f() { return f; });");
        let Statement::Expression(Expression::Assignment { value, .. }) = &program.body[0] else {
            panic!("expected the completion assignment");
        };
        let Expression::FunctionLiteral(f) = &**value else {
            panic!("expected a function literal");
        };
        assert!(f.scope.declarations.is_empty());
        assert!(matches!(return_value(f), Expression::ThisFunction));
    }

    #[test]
    fn test_const_redeclaration_is_reported() {
        let program = global("var x; const x = 1;");
        assert_eq!(
            program.scope.illegal_redeclaration.as_deref(),
            Some("redeclaration of var x")
        );
        let program = global("const x = 1; const x = 2;");
        assert!(program.scope.illegal_redeclaration.is_none());
    }

    #[test]
    fn test_literal_counts_and_depth() {
        let program = global("var o = { a: 1, b: [1, 2], c: { d: x } }; /re/g;");
        assert_eq!(program.materialized_literal_count, 4);
        let Statement::Expression(Expression::Assignment { value, .. }) = &program.body[0] else {
            panic!("expected the initialization");
        };
        let Expression::ObjectLiteral {
            properties,
            constant_properties,
            depth,
            ..
        } = &**value
        else {
            panic!("expected an object literal");
        };
        assert_eq!(*depth, 2);
        assert_eq!(properties[0].kind, PropertyKind::Constant);
        assert_eq!(properties[1].kind, PropertyKind::MaterializedLiteral);
        assert_eq!(properties[2].kind, PropertyKind::MaterializedLiteral);
        assert_eq!(
            constant_properties[2].1,
            CompileTimeValue::Literal(Literal::Undefined)
        );
    }

    #[test]
    fn test_expected_property_count() {
        let program = global("function P() { this.a = 1; this.b = 2; this.a = 3; this[0] = 4; }");
        assert_eq!(first_function(&program).expected_property_count, 2);
    }

    #[test]
    fn test_labels() {
        let program = global("outer: for (;;) { inner: { break inner; } continue outer; }");
        let Statement::Loop { id, body, .. } = &program.body[0] else {
            panic!("expected a loop");
        };
        let Statement::Block { statements, .. } = &**body else {
            panic!("expected the loop body");
        };
        let Statement::Block {
            id: Some(block_id),
            statements: inner,
        } = &statements[0]
        else {
            panic!("expected the labeled block");
        };
        let Statement::Block { statements: inner, .. } = &inner[0] else {
            panic!("expected the block body");
        };
        assert!(matches!(inner[0], Statement::Break { target } if target == *block_id));
        assert!(matches!(statements[1], Statement::Continue { target } if target == *id));
    }

    #[test]
    fn test_jump_errors() {
        assert!(matches!(
            resolve_source("break;", ScopeKind::Global),
            Err(Error::Resolve(_))
        ));
        assert!(matches!(
            resolve_source("a: { continue a; }", ScopeKind::Global),
            Err(Error::Resolve(_))
        ));
        assert!(matches!(
            resolve_source("return 1;", ScopeKind::Global),
            Err(Error::Resolve(_))
        ));
    }

    #[test]
    fn test_loop_nesting_of_closures() {
        let program = global("for (;;) { g = function () {}; }");
        let Statement::Loop { body, .. } = &program.body[0] else {
            panic!("expected a loop");
        };
        let Statement::Block { statements, .. } = &**body else {
            panic!("expected the loop body");
        };
        let Statement::Expression(Expression::Assignment { value, .. }) = &statements[0] else {
            panic!("expected the completion assignment");
        };
        let Expression::Assignment { value, .. } = &**value else {
            panic!("expected the assignment");
        };
        let Expression::FunctionLiteral(g) = &**value else {
            panic!("expected a closure");
        };
        assert_eq!(g.loop_nesting, 1);
    }
}
