//! Generator state shared by every lowering routine.
//!
//! Expressions are loaded with [`CodeGenerator::load`], which leaves exactly
//! one value on the virtual frame, or with [`CodeGenerator::load_condition`],
//! which may instead leave the result in the condition flags or as branches
//! to a pair of jump targets.

use std::collections::BTreeMap;

use super::deferred::{DeferredKind, DeferredQueue};
use super::jump_target::{Direction, Emitter, TargetId};
use super::virtual_frame::VirtualFrame;
use super::{
    arithmetic, calls, comparison, control_flow, exceptions, expressions, literals, reference,
    statements,
};
use crate::ast::{Expression, FunctionLiteral, NodeId, Statement};
use crate::layout::{SMI_TAG_MASK, STACK_LIMIT_ADDRESS};
use crate::machine::{Condition, Constant, MacroAssembler, MemOperand, Operand, Reg};
use crate::options::CompileOptions;
use crate::runtime::{Builtin, CallTarget, RuntimeFunction};
use crate::{Error, Result};

/// Whether a variable load happens directly under `typeof`, where an
/// unresolvable name yields `undefined` instead of a reference error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeofState {
    NotInsideTypeof,
    InsideTypeof,
}

#[derive(Debug, Clone, Copy)]
struct ConditionTargets {
    true_target: TargetId,
    false_target: TargetId,
}

/// Targets of `break` and `continue` for one breakable statement.
#[derive(Debug, Clone, Copy)]
pub struct ExitTargets {
    pub break_target: TargetId,
    pub continue_target: Option<TargetId>,
}

pub struct CodeGenerator<'a> {
    pub(super) function: &'a FunctionLiteral,
    pub(super) options: &'a CompileOptions,
    pub(super) emitter: Emitter,
    pub(super) deferred: DeferredQueue,
    typeof_state: TypeofState,
    targets: Option<ConditionTargets>,
    cc_reg: Option<Condition>,
    /// Exits of the enclosing breakable statements, by node.
    pub(super) exits: BTreeMap<NodeId, ExitTargets>,
    /// The function's own return sequence.
    pub(super) function_return: TargetId,
    /// Where `return` jumps: the function return, or a shadow installed by
    /// an enclosing `try`.
    pub(super) return_target: TargetId,
    depth: usize,
    /// Nesting of [`CodeGenerator::in_spilled_code`] scopes.
    spilled_depth: usize,
}

impl<'a> CodeGenerator<'a> {
    #[must_use]
    pub fn new(function: &'a FunctionLiteral, options: &'a CompileOptions) -> Self {
        let mut emitter = Emitter::new();
        let function_return = emitter.new_target(Direction::Bidirectional);
        emitter.set_expected_height(function_return, 0);
        Self {
            function,
            options,
            emitter,
            deferred: DeferredQueue::new(),
            typeof_state: TypeofState::NotInsideTypeof,
            targets: None,
            cc_reg: None,
            exits: BTreeMap::new(),
            function_return,
            return_target: function_return,
            depth: 0,
            spilled_depth: 0,
        }
    }

    // ── Frame access ──

    pub fn masm(&mut self) -> &mut MacroAssembler {
        &mut self.emitter.masm
    }

    #[must_use]
    pub fn has_valid_frame(&self) -> bool {
        self.emitter.has_valid_frame()
    }

    pub fn frame(&mut self) -> Result<&mut VirtualFrame> {
        self.emitter.frame()
    }

    pub fn parts(&mut self) -> Result<(&mut MacroAssembler, &mut VirtualFrame)> {
        self.emitter.parts()
    }

    pub fn height(&self) -> Result<usize> {
        self.emitter
            .frame_ref()
            .map(VirtualFrame::height)
            .ok_or_else(|| Error::Internal("no valid frame".to_string()))
    }

    pub fn spill(&mut self) -> Result<()> {
        self.emitter.spill()
    }

    /// Runs `f` on a fully spilled frame. The frame must still be spilled
    /// (or invalid) when `f` returns. Nested scopes re-enter cleanly.
    pub fn in_spilled_code<T>(&mut self, f: impl FnOnce(&mut Self) -> Result<T>) -> Result<T> {
        if self.spilled_depth == 0 && self.has_valid_frame() {
            self.spill()?;
        }
        self.spilled_depth += 1;
        let result = f(self);
        self.spilled_depth -= 1;
        let value = result?;
        if self
            .emitter
            .frame_ref()
            .is_some_and(|frame| !frame.is_spilled())
        {
            return Err(Error::Internal(
                "frame not spilled at the end of a spilled scope".to_string(),
            ));
        }
        Ok(value)
    }

    #[must_use]
    pub fn in_spilled_scope(&self) -> bool {
        self.spilled_depth > 0
    }

    pub fn emit_push(&mut self, reg: Reg) -> Result<()> {
        let (masm, frame) = self.emitter.parts()?;
        frame.emit_push(masm, reg)
    }

    pub fn emit_pop(&mut self, reg: Reg) -> Result<()> {
        let (masm, frame) = self.emitter.parts()?;
        frame.emit_pop(masm, reg)
    }

    pub fn push_constant(&mut self, constant: Constant) -> Result<()> {
        self.frame()?.push_constant(constant);
        Ok(())
    }

    pub fn drop_elements(&mut self, count: usize) -> Result<()> {
        let (masm, frame) = self.emitter.parts()?;
        frame.drop(masm, count)
    }

    /// Loads `constant` into `r0` and pushes it on the machine stack.
    pub fn push_r0_constant(&mut self, constant: Constant) -> Result<()> {
        self.spill()?;
        self.masm().load_constant(Reg::R0, constant);
        self.emit_push(Reg::R0)
    }

    /// Loads the stack element `depth` positions below the top into `reg`.
    pub fn load_element(&mut self, reg: Reg, depth: usize) -> Result<()> {
        let (masm, frame) = self.emitter.parts()?;
        frame.spill_all(masm)?;
        let operand = frame.element_at(depth)?;
        masm.ldr(reg, operand);
        Ok(())
    }

    /// Stores `reg` into the stack element `depth` positions below the top.
    pub fn store_element(&mut self, reg: Reg, depth: usize) -> Result<()> {
        let (masm, frame) = self.emitter.parts()?;
        frame.spill_all(masm)?;
        let operand = frame.element_at(depth)?;
        masm.str(reg, operand);
        Ok(())
    }

    pub fn call_code(&mut self, target: CallTarget, popped: usize) -> Result<()> {
        let (masm, frame) = self.emitter.parts()?;
        frame.call(masm, target, popped)
    }

    pub fn call_runtime(&mut self, function: RuntimeFunction) -> Result<()> {
        self.call_code(CallTarget::Runtime(function), function.argument_count())
    }

    pub fn call_builtin(&mut self, builtin: Builtin) -> Result<()> {
        self.call_code(CallTarget::Builtin(builtin), builtin.argument_count())
    }

    pub fn comment(&mut self, text: impl Into<String>) {
        self.emitter.masm.comment(text);
    }

    /// Reloads `cp` from the frame after a call into JS code.
    pub fn restore_context(&mut self) -> Result<()> {
        let (masm, frame) = self.emitter.parts()?;
        let context = frame.context();
        masm.ldr(Reg::CP, context);
        Ok(())
    }

    // ── Jump targets ──

    pub fn forward_target(&mut self) -> TargetId {
        self.emitter.forward_target()
    }

    pub fn bidirectional_target(&mut self) -> TargetId {
        self.emitter.new_target(Direction::Bidirectional)
    }

    /// A target for `break` or `continue` that expects the current height.
    pub fn exit_target(&mut self, direction: Direction) -> Result<TargetId> {
        let height = self.height()?;
        let id = self.emitter.new_target(direction);
        self.emitter.set_expected_height(id, height);
        Ok(id)
    }

    pub fn break_target(&self, node: NodeId) -> Result<TargetId> {
        self.exits
            .get(&node)
            .map(|exits| exits.break_target)
            .ok_or_else(|| Error::Internal(format!("break to unknown statement {}", node.0)))
    }

    pub fn continue_target(&self, node: NodeId) -> Result<TargetId> {
        self.exits
            .get(&node)
            .and_then(|exits| exits.continue_target)
            .ok_or_else(|| Error::Internal(format!("continue to non-loop statement {}", node.0)))
    }

    /// Binds `id` if anything reaches it.
    pub fn bind_if_linked(&mut self, id: TargetId) -> Result<()> {
        if self.emitter.is_linked(id) {
            self.emitter.bind(id)?;
        }
        Ok(())
    }

    // ── Condition code ──

    #[must_use]
    pub fn has_cc(&self) -> bool {
        self.cc_reg.is_some()
    }

    pub fn set_cc(&mut self, cond: Condition) {
        self.cc_reg = Some(cond);
    }

    /// Branches to `target` when the pending condition is `if_true`, and
    /// consumes the condition.
    pub fn branch_cc(&mut self, if_true: bool, target: TargetId) -> Result<()> {
        let cc = self
            .cc_reg
            .take()
            .ok_or_else(|| Error::Internal("branch without a condition".to_string()))?;
        let cond = if if_true { cc } else { cc.negate() };
        self.emitter.branch(target, cond)
    }

    pub fn clear_cc(&mut self) {
        self.cc_reg = None;
    }

    /// Negates the pending condition, if there is one.
    pub fn negate_cc(&mut self) {
        self.cc_reg = self.cc_reg.map(Condition::negate);
    }

    pub fn true_target(&self) -> Result<TargetId> {
        self.targets
            .map(|t| t.true_target)
            .ok_or_else(|| Error::Internal("no true target outside a condition".to_string()))
    }

    pub fn false_target(&self) -> Result<TargetId> {
        self.targets
            .map(|t| t.false_target)
            .ok_or_else(|| Error::Internal("no false target outside a condition".to_string()))
    }

    /// Exchanges the true and false targets of the condition being loaded.
    pub fn swap_targets(&mut self) {
        if let Some(targets) = &mut self.targets {
            std::mem::swap(&mut targets.true_target, &mut targets.false_target);
        }
    }

    #[must_use]
    pub fn typeof_state(&self) -> TypeofState {
        self.typeof_state
    }

    // ── Loading ──

    pub fn load(&mut self, expression: &Expression) -> Result<()> {
        self.load_with(expression, TypeofState::NotInsideTypeof)
    }

    /// Evaluates `expression` and leaves its value on top of the frame.
    pub fn load_with(&mut self, expression: &Expression, typeof_state: TypeofState) -> Result<()> {
        let original_height = self.height()?;
        let true_target = self.forward_target();
        let false_target = self.forward_target();
        self.load_condition(expression, typeof_state, true_target, false_target, false)?;

        if let Some(cc) = self.cc_reg.take() {
            let loaded = self.forward_target();
            let materialize_true = self.forward_target();
            self.emitter.branch(materialize_true, cc)?;
            self.push_constant(Constant::False)?;
            self.emitter.jump(loaded)?;
            self.emitter.bind(materialize_true)?;
            self.push_constant(Constant::True)?;
            self.emitter.bind(loaded)?;
        }

        let true_linked = self.emitter.is_linked(true_target);
        let false_linked = self.emitter.is_linked(false_target);
        if true_linked || false_linked {
            let loaded = self.forward_target();
            if self.has_valid_frame() {
                self.emitter.jump(loaded)?;
            }
            if true_linked {
                self.emitter.bind(true_target)?;
                self.push_constant(Constant::True)?;
            }
            if true_linked && false_linked {
                self.emitter.jump(loaded)?;
            }
            if false_linked {
                self.emitter.bind(false_target)?;
                self.push_constant(Constant::False)?;
            }
            self.emitter.bind(loaded)?;
        }

        let height = self.height()?;
        if height != original_height + 1 {
            return Err(Error::Internal(format!(
                "load left height {height}, expected {}",
                original_height + 1
            )));
        }
        Ok(())
    }

    /// Evaluates `expression` for its truth value. On return the value is on
    /// the frame, or pending in the condition flags, or control has left
    /// through `true_target` / `false_target`. With `force_cc` a value on the
    /// frame is converted to a condition.
    pub fn load_condition(
        &mut self,
        expression: &Expression,
        typeof_state: TypeofState,
        true_target: TargetId,
        false_target: TargetId,
        force_cc: bool,
    ) -> Result<()> {
        if self.cc_reg.is_some() {
            return Err(Error::Internal("condition pending at load".to_string()));
        }
        let original_height = self.height()?;

        let saved_state = self.typeof_state;
        let saved_targets = self.targets;
        self.typeof_state = typeof_state;
        self.targets = Some(ConditionTargets {
            true_target,
            false_target,
        });
        let visited = self.visit_expression(expression);
        self.typeof_state = saved_state;
        self.targets = saved_targets;
        visited?;

        if force_cc && self.has_valid_frame() && self.cc_reg.is_none() {
            self.to_boolean(true_target, false_target)?;
        }

        if let Some(frame) = self.emitter.frame_ref() {
            let expected = if self.cc_reg.is_some() {
                original_height
            } else {
                original_height + 1
            };
            if frame.height() != expected {
                return Err(Error::Internal(format!(
                    "condition left height {}, expected {expected}",
                    frame.height()
                )));
            }
        }
        Ok(())
    }

    /// Pops the top of the frame and converts it to a condition, branching
    /// directly for the values whose truth is known without a call.
    pub fn to_boolean(&mut self, true_target: TargetId, false_target: TargetId) -> Result<()> {
        self.comment("[ ToBoolean");
        self.spill()?;
        self.emit_pop(Reg::R0)?;

        self.masm().cmp_constant(Reg::R0, Constant::False);
        self.emitter.branch(false_target, Condition::Eq)?;
        self.masm().cmp_constant(Reg::R0, Constant::True);
        self.emitter.branch(true_target, Condition::Eq)?;
        self.masm().cmp_constant(Reg::R0, Constant::Undefined);
        self.emitter.branch(false_target, Condition::Eq)?;
        self.masm().cmp(Reg::R0, Operand::smi(0));
        self.emitter.branch(false_target, Condition::Eq)?;
        self.masm().tst(Reg::R0, Operand::Imm(SMI_TAG_MASK as i32));
        self.emitter.branch(true_target, Condition::Eq)?;

        self.emit_push(Reg::R0)?;
        self.call_runtime(RuntimeFunction::ToBool)?;
        self.masm().cmp_constant(Reg::R0, Constant::False);
        self.cc_reg = Some(Condition::Ne);
        self.comment("]");
        Ok(())
    }

    /// Calls the stack guard when `sp` is below the limit.
    pub fn check_stack(&mut self) -> Result<()> {
        let (entry, exit) = {
            let record = self.deferred.push(&mut self.emitter, DeferredKind::StackCheck);
            (record.entry, record.exit)
        };
        self.comment("[ check stack");
        let masm = self.masm();
        masm.mov(Reg::IP, Operand::Imm(STACK_LIMIT_ADDRESS as i32));
        masm.ldr(Reg::IP, MemOperand::new(Reg::IP, 0));
        masm.cmp(Reg::SP, Reg::IP);
        self.emitter.branch(entry, Condition::Lo)?;
        self.emitter.bind(exit)?;
        self.comment("]");
        Ok(())
    }

    /// Queues a deferred region and returns its entry and exit targets.
    pub fn defer(&mut self, kind: DeferredKind) -> (TargetId, TargetId) {
        let record = self.deferred.push(&mut self.emitter, kind);
        (record.entry, record.exit)
    }

    // ── Dispatch ──

    fn enter_node(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > self.options.max_recursion_depth {
            return Err(Error::StackOverflow);
        }
        Ok(())
    }

    /// Visits statements until control can no longer reach the next one.
    pub fn visit_statements(&mut self, statements: &[Statement]) -> Result<()> {
        for statement in statements {
            if !self.has_valid_frame() {
                break;
            }
            self.visit_statement(statement)?;
        }
        Ok(())
    }

    pub fn visit_statement(&mut self, statement: &Statement) -> Result<()> {
        self.enter_node()?;
        self.spill()?;
        match statement {
            Statement::Block { id, statements } => statements::visit_block(self, *id, statements)?,
            Statement::Expression(expression) => {
                statements::visit_expression_statement(self, expression)?;
            }
            Statement::Empty => {}
            Statement::If {
                condition,
                then_statement,
                else_statement,
            } => statements::visit_if(self, condition, then_statement, else_statement)?,
            Statement::Continue { target } => statements::visit_continue(self, *target)?,
            Statement::Break { target } => statements::visit_break(self, *target)?,
            Statement::Return(expression) => statements::visit_return(self, expression)?,
            Statement::WithEnter {
                expression,
                is_catch_block,
            } => statements::visit_with_enter(self, expression, *is_catch_block)?,
            Statement::WithExit => statements::visit_with_exit(self)?,
            Statement::Switch { id, tag, cases } => {
                control_flow::visit_switch(self, *id, tag, cases)?;
            }
            Statement::Loop {
                id,
                kind,
                init,
                condition,
                next,
                body,
            } => control_flow::visit_loop(
                self,
                *id,
                *kind,
                init.as_deref(),
                condition.as_ref(),
                next.as_deref(),
                body,
            )?,
            Statement::ForIn {
                id,
                each,
                enumerable,
                body,
            } => control_flow::visit_for_in(self, *id, each, enumerable, body)?,
            Statement::TryCatch {
                try_block,
                catch_var,
                catch_block,
            } => exceptions::visit_try_catch(self, try_block, catch_var, catch_block)?,
            Statement::TryFinally {
                try_block,
                finally_block,
            } => exceptions::visit_try_finally(self, try_block, finally_block)?,
            Statement::Debugger => statements::visit_debugger(self)?,
        }
        self.depth -= 1;
        Ok(())
    }

    pub fn visit_expression(&mut self, expression: &Expression) -> Result<()> {
        self.enter_node()?;
        self.spill()?;
        match expression {
            Expression::Literal(literal) => expressions::visit_literal(self, literal)?,
            Expression::RegExpLiteral {
                pattern,
                flags,
                literal_index,
            } => literals::visit_regexp_literal(self, pattern, flags, *literal_index)?,
            Expression::ObjectLiteral {
                properties,
                constant_properties,
                literal_index,
                depth,
            } => literals::visit_object_literal(
                self,
                properties,
                constant_properties,
                *literal_index,
                *depth,
            )?,
            Expression::ArrayLiteral {
                values,
                constant_elements,
                literal_index,
                depth,
            } => literals::visit_array_literal(
                self,
                values,
                constant_elements,
                *literal_index,
                *depth,
            )?,
            Expression::Variable(variable) => reference::visit_variable(self, variable)?,
            Expression::This => expressions::visit_this(self)?,
            Expression::ThisFunction => expressions::visit_this_function(self)?,
            Expression::Property { .. } => reference::visit_property(self, expression)?,
            Expression::Assignment { op, target, value } => {
                expressions::visit_assignment(self, *op, target, value)?;
            }
            Expression::Throw(exception) => expressions::visit_throw(self, exception)?,
            Expression::Call { callee, arguments } => calls::visit_call(self, callee, arguments)?,
            Expression::CallEval { callee, arguments } => {
                calls::visit_call_eval(self, callee, arguments)?;
            }
            Expression::CallNew { callee, arguments } => {
                calls::visit_call_new(self, callee, arguments)?;
            }
            Expression::Unary { op, operand } => expressions::visit_unary(self, *op, operand)?,
            Expression::Count {
                op,
                is_prefix,
                target,
            } => arithmetic::visit_count(self, *op, *is_prefix, target)?,
            Expression::Binary { op, left, right } => {
                arithmetic::visit_binary(self, *op, left, right)?;
            }
            Expression::Compare { op, left, right } => {
                comparison::visit_compare(self, *op, left, right)?;
            }
            Expression::Conditional {
                condition,
                then_expression,
                else_expression,
            } => expressions::visit_conditional(self, condition, then_expression, else_expression)?,
            Expression::FunctionLiteral(literal) => {
                literals::visit_function_literal(self, literal)?;
            }
            Expression::CatchExtensionObject { key, value } => {
                expressions::visit_catch_extension_object(self, key, value)?;
            }
        }
        self.depth -= 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Scope, ScopeKind};

    fn empty_function() -> FunctionLiteral {
        FunctionLiteral {
            name: "f".into(),
            scope: Scope::new(ScopeKind::Function),
            body: Vec::new(),
            start_position: 0,
            end_position: 0,
            materialized_literal_count: 0,
            expected_property_count: 0,
            is_expression: false,
            loop_nesting: 0,
        }
    }

    fn generator<'a>(
        function: &'a FunctionLiteral,
        options: &'a CompileOptions,
    ) -> CodeGenerator<'a> {
        let mut g = CodeGenerator::new(function, options);
        let mut frame = VirtualFrame::new(0, 0);
        frame.enter(g.masm());
        g.emitter.set_frame(frame);
        g
    }

    #[test]
    fn test_spilled_scope_materializes_and_nests() {
        let function = empty_function();
        let options = CompileOptions::default();
        let mut g = generator(&function, &options);
        g.push_constant(Constant::Undefined).unwrap();
        assert!(!g.frame().unwrap().is_spilled());

        let height = g
            .in_spilled_code(|g| {
                assert!(g.in_spilled_scope());
                assert!(g.frame()?.is_spilled());
                g.in_spilled_code(|g| g.height())
            })
            .unwrap();
        assert_eq!(height, 1);
        assert!(!g.in_spilled_scope());
        assert!(g.frame().unwrap().is_spilled());
    }

    #[test]
    fn test_spilled_scope_rejects_virtual_elements_on_exit() {
        let function = empty_function();
        let options = CompileOptions::default();
        let mut g = generator(&function, &options);
        let result = g.in_spilled_code(|g| g.push_constant(Constant::Undefined));
        assert!(matches!(result, Err(Error::Internal(_))));
        assert!(!g.in_spilled_scope());
    }
}
