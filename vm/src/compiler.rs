//! AST → bytecode compiler.
//!
//! One [`FunctionCompiler`] instance compiles one function body with its
//! own symbol table, label space, and constant pool. Nested function
//! declarations are not compiled inline: they produce metadata immediately
//! (so calls can resolve) and a deferred-compile record in a worklist that
//! the program compile drains afterwards.
//!
//! Stack discipline: every expression pushes exactly one value, every
//! statement leaves the operand stack depth unchanged. Assignments
//! compile to `<rhs> Dup StoreLocal`, expression statements append `Drop`.
//!
//! Calling convention: arguments are pushed right-to-left, so argument 0
//! ends up directly below the callee frame base and parameter `i` is
//! addressable at slot `-(i + 1)` without renumbering locals.

use std::collections::{HashMap, VecDeque};

use bytecode::{BytecodeBuilder, Label};
use parser::ast::{BinOp, Expr, ExprKind, Ident, Stmt, StmtKind};
use parser::span::Span;

use crate::function::{
    BytecodeUnit, FunctionId, FunctionMeta, Functions, FIXED_SLOT_COUNT,
};

#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub span: Option<Span>,
}

impl CompileError {
    fn new(message: impl Into<String>, span: Span) -> Self {
        Self {
            message: message.into(),
            span: Some(span),
        }
    }
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(span) = &self.span {
            write!(
                f,
                "{}:{}: {}",
                span.start.line, span.start.column, self.message
            )
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl std::error::Error for CompileError {}

/// A function whose metadata exists but whose body still needs compiling.
struct PendingFunction<'a> {
    id: FunctionId,
    params: &'a [Ident],
    body: &'a [Stmt],
}

/// State shared by all function compiles of one program: the function
/// arena, the name → function resolution map (foreign bindings plus
/// declared functions), and the deferred-compile worklist.
struct ProgramContext<'a, 'f> {
    functions: &'f mut Functions,
    known: HashMap<String, FunctionId>,
    worklist: VecDeque<PendingFunction<'a>>,
}

/// Compile a whole program. Returns the id of the synthetic zero-parameter
/// top-level function; every declared function has its unit attached.
pub fn compile_program<'a>(
    program: &'a [Stmt],
    foreign: &HashMap<String, FunctionId>,
    functions: &mut Functions,
) -> Result<FunctionId, CompileError> {
    let mut cx = ProgramContext {
        functions,
        known: foreign.clone(),
        worklist: VecDeque::new(),
    };

    let top = cx.functions.add(FunctionMeta::new_bytecode_placeholder(
        "<top-level>".to_string(),
        0,
    ));
    let unit = FunctionCompiler::new(&mut cx).compile(&[], program)?;
    cx.functions.get_mut(top).attach_unit(unit);

    // Drain deferred function bodies; each gets a fresh compiler with a
    // fresh symbol table and label space. Compiling a body may queue more.
    while let Some(pending) = cx.worklist.pop_front() {
        let unit =
            FunctionCompiler::new(&mut cx).compile(pending.params, pending.body)?;
        cx.functions.get_mut(pending.id).attach_unit(unit);
    }

    Ok(top)
}

struct FunctionCompiler<'c, 'a, 'f> {
    cx: &'c mut ProgramContext<'a, 'f>,
    builder: BytecodeBuilder,
    /// Variable name → local slot. Parameters occupy negative slots.
    locals: HashMap<String, i16>,
    next_slot: i16,
    constants: Vec<FunctionId>,
}

impl<'c, 'a, 'f> FunctionCompiler<'c, 'a, 'f> {
    fn new(cx: &'c mut ProgramContext<'a, 'f>) -> Self {
        Self {
            cx,
            builder: BytecodeBuilder::new(),
            locals: HashMap::new(),
            next_slot: FIXED_SLOT_COUNT as i16,
            constants: Vec::new(),
        }
    }

    fn compile(
        mut self,
        params: &'a [Ident],
        body: &'a [Stmt],
    ) -> Result<BytecodeUnit, CompileError> {
        for (i, param) in params.iter().enumerate() {
            if self.locals.contains_key(&param.name) {
                return Err(CompileError::new(
                    format!("Duplicate parameter `{}`", param.name),
                    param.span,
                ));
            }
            self.locals.insert(param.name.clone(), -(i as i16) - 1);
        }

        self.hoist_declarations(body)?;
        for statement in body {
            // Declarations were handled by hoisting; everything else
            // compiles in order.
            if !matches!(statement.kind, StmtKind::FunctionDecl { .. }) {
                self.statement(statement)?;
            }
        }

        // Implicit `return 0` so execution never runs off the end.
        self.builder.load_number(0.0);
        self.builder.return_();

        Ok(BytecodeUnit {
            code: self.builder.into_bytes(),
            local_count: self.next_slot as u16,
            constants: self.constants,
        })
    }

    /// Declare every function of this body up front so calls can resolve
    /// regardless of declaration order.
    fn hoist_declarations(&mut self, body: &'a [Stmt]) -> Result<(), CompileError> {
        for statement in body {
            let StmtKind::FunctionDecl { name, params, body } = &statement.kind
            else {
                continue;
            };
            if self.cx.known.contains_key(&name.name) {
                return Err(CompileError::new(
                    format!("Duplicate function `{}`", name.name),
                    name.span,
                ));
            }
            let id = self.cx.functions.add(FunctionMeta::new_bytecode_placeholder(
                name.name.clone(),
                params.len() as u16,
            ));
            self.cx.known.insert(name.name.clone(), id);
            self.cx.worklist.push_back(PendingFunction {
                id,
                params,
                body,
            });
        }
        Ok(())
    }

    // ── statements ─────────────────────────────────────────────────

    fn statement(&mut self, statement: &'a Stmt) -> Result<(), CompileError> {
        match &statement.kind {
            StmtKind::VarDecl { name, init } => self.var_declaration(name, init),
            StmtKind::Expr(expr) => {
                self.expression(expr)?;
                self.builder.drop_top();
                Ok(())
            }
            StmtKind::If {
                condition,
                then_branch,
                else_branch,
            } => self.if_statement(condition, then_branch, else_branch.as_deref()),
            StmtKind::While { condition, body } => {
                self.while_statement(condition, body)
            }
            StmtKind::Block(statements) => {
                for s in statements {
                    self.statement(s)?;
                }
                Ok(())
            }
            StmtKind::Return(value) => {
                match value {
                    Some(expr) => self.expression(expr)?,
                    None => self.builder.load_number(0.0),
                }
                self.builder.return_();
                Ok(())
            }
            StmtKind::FunctionDecl { name, .. } => Err(CompileError::new(
                format!(
                    "function `{}` must be declared directly in a function body",
                    name.name
                ),
                statement.span,
            )),
        }
    }

    fn var_declaration(
        &mut self,
        name: &Ident,
        init: &Expr,
    ) -> Result<(), CompileError> {
        // Only the `var x = <literal>` form is supported.
        let ExprKind::Number(value) = init.kind else {
            return Err(CompileError::new(
                "unsupported variable initializer; a number literal is required",
                init.span,
            ));
        };
        let slot = self.declare_variable(&name.name);
        self.builder.load_number(value);
        self.builder.store_local(slot);
        Ok(())
    }

    /// Allocate a slot on first definition; redeclaring reuses the slot.
    fn declare_variable(&mut self, name: &str) -> i16 {
        if let Some(&slot) = self.locals.get(name) {
            return slot;
        }
        let slot = self.next_slot;
        self.next_slot += 1;
        self.locals.insert(name.to_string(), slot);
        slot
    }

    fn if_statement(
        &mut self,
        condition: &'a Expr,
        then_branch: &'a Stmt,
        else_branch: Option<&'a Stmt>,
    ) -> Result<(), CompileError> {
        self.expression(condition)?;
        let mut else_label = Label::new();
        self.builder.jump_if_false(&mut else_label);
        self.statement(then_branch)?;
        match else_branch {
            Some(else_branch) => {
                let mut end_label = Label::new();
                self.builder.jump(&mut end_label);
                self.builder.bind(&mut else_label);
                self.statement(else_branch)?;
                self.builder.bind(&mut end_label);
            }
            None => {
                self.builder.bind(&mut else_label);
            }
        }
        Ok(())
    }

    fn while_statement(
        &mut self,
        condition: &'a Expr,
        body: &'a Stmt,
    ) -> Result<(), CompileError> {
        let mut header = Label::new();
        let mut exit = Label::new();
        // The LoopHeader marker sits at the back-edge target so the
        // optimizing pipeline can recognize the loop entry directly.
        self.builder.bind(&mut header);
        self.builder.loop_header();
        self.expression(condition)?;
        self.builder.jump_if_false(&mut exit);
        self.statement(body)?;
        self.builder.jump_loop(&mut header);
        self.builder.bind(&mut exit);
        Ok(())
    }

    // ── expressions ────────────────────────────────────────────────

    fn expression(&mut self, expr: &'a Expr) -> Result<(), CompileError> {
        match &expr.kind {
            ExprKind::Number(value) => {
                self.builder.load_number(*value);
                Ok(())
            }
            ExprKind::Ident(name) => {
                let slot = self.resolve_variable(name, expr.span)?;
                self.builder.load_local(slot);
                Ok(())
            }
            ExprKind::Assign { target, value } => {
                self.expression(value)?;
                let slot = self.resolve_variable(&target.name, target.span)?;
                // Keep the assigned value as the expression result.
                self.builder.dup();
                self.builder.store_local(slot);
                Ok(())
            }
            ExprKind::Binary { op, left, right } => {
                self.expression(left)?;
                self.expression(right)?;
                match op {
                    BinOp::Add => self.builder.add(),
                    BinOp::Sub => self.builder.sub(),
                    BinOp::Mul => self.builder.mul(),
                    BinOp::Div => self.builder.div(),
                    BinOp::Eq => self.builder.test_equal(),
                    BinOp::Lt => self.builder.test_less_than(),
                    BinOp::Le => self.builder.test_less_than_or_equal(),
                }
                Ok(())
            }
            ExprKind::Call { callee, args } => self.call(expr, callee, args),
        }
    }

    fn resolve_variable(
        &self,
        name: &str,
        span: Span,
    ) -> Result<i16, CompileError> {
        self.locals.get(name).copied().ok_or_else(|| {
            CompileError::new(format!("Unknown variable `{name}`"), span)
        })
    }

    fn call(
        &mut self,
        expr: &'a Expr,
        callee: &Ident,
        args: &'a [Expr],
    ) -> Result<(), CompileError> {
        let Some(&id) = self.cx.known.get(&callee.name) else {
            return Err(CompileError::new(
                format!("Unknown function `{}`", callee.name),
                callee.span,
            ));
        };
        let expected = self.cx.functions.get(id).parameter_count as usize;
        if args.len() != expected {
            return Err(CompileError::new(
                format!(
                    "function `{}` expects {} arguments, received {}",
                    callee.name,
                    expected,
                    args.len()
                ),
                expr.span,
            ));
        }
        if args.len() > u8::MAX as usize {
            return Err(CompileError::new(
                "too many call arguments",
                expr.span,
            ));
        }

        // Right-to-left, so argument 0 lands directly below the callee
        // frame base.
        for arg in args.iter().rev() {
            self.expression(arg)?;
        }
        let constant = self.constant(id, expr.span)?;
        self.builder.call(constant, args.len() as u8);
        Ok(())
    }

    fn constant(
        &mut self,
        id: FunctionId,
        span: Span,
    ) -> Result<u16, CompileError> {
        if let Some(index) = self.constants.iter().position(|&c| c == id) {
            return Ok(index as u16);
        }
        if self.constants.len() > u16::MAX as usize {
            return Err(CompileError::new("constant pool overflow", span));
        }
        self.constants.push(id);
        Ok((self.constants.len() - 1) as u16)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytecode::{BytecodeDecoder, Instruction, UNBOUND_TARGET};

    fn compile(source: &str) -> (Functions, FunctionId) {
        let program = parser::parse(source).expect("parse");
        let mut functions = Functions::new();
        let top = compile_program(&program, &HashMap::new(), &mut functions)
            .expect("compile");
        (functions, top)
    }

    fn compile_err(source: &str) -> CompileError {
        let program = parser::parse(source).expect("parse");
        let mut functions = Functions::new();
        compile_program(&program, &HashMap::new(), &mut functions).unwrap_err()
    }

    fn instructions(functions: &Functions, id: FunctionId) -> Vec<Instruction> {
        let unit = functions.get(id).bytecode().unwrap();
        BytecodeDecoder::new(&unit.code).map(|(_, i)| i).collect()
    }

    #[test]
    fn var_and_load() {
        let (functions, top) = compile("var x = 42; x;");
        assert_eq!(instructions(&functions, top), vec![
            Instruction::LoadNumber { value: 42.0 },
            Instruction::StoreLocal { slot: 2 },
            Instruction::LoadLocal { slot: 2 },
            Instruction::Drop,
            Instruction::LoadNumber { value: 0.0 },
            Instruction::Return,
        ]);
    }

    #[test]
    fn assignment_keeps_value_and_statement_drops_it() {
        let (functions, top) = compile("var x = 1; x = x + 1;");
        assert_eq!(instructions(&functions, top), vec![
            Instruction::LoadNumber { value: 1.0 },
            Instruction::StoreLocal { slot: 2 },
            Instruction::LoadLocal { slot: 2 },
            Instruction::LoadNumber { value: 1.0 },
            Instruction::Add,
            Instruction::Dup,
            Instruction::StoreLocal { slot: 2 },
            Instruction::Drop,
            Instruction::LoadNumber { value: 0.0 },
            Instruction::Return,
        ]);
    }

    #[test]
    fn while_emits_loop_header_and_back_edge() {
        let (functions, top) = compile("var i = 0; while (i < 10) { i = i + 1; }");
        let all = instructions(&functions, top);
        let header_offset = {
            let unit = functions.get(top).bytecode().unwrap();
            BytecodeDecoder::new(&unit.code)
                .find(|(_, i)| matches!(i, Instruction::LoopHeader))
                .map(|(at, _)| at as u32)
                .unwrap()
        };
        assert!(all.iter().any(
            |i| matches!(i, Instruction::JumpLoop { target } if *target == header_offset)
        ));
        // The conditional exit jump must leave the loop, i.e. point past
        // the back edge.
        let exit_target = all
            .iter()
            .find_map(|i| match i {
                Instruction::JumpIfFalse { target } => Some(*target),
                _ => None,
            })
            .unwrap();
        assert!(exit_target > header_offset);
    }

    #[test]
    fn labels_are_fully_bound() {
        let (functions, top) = compile(
            "var i = 0; var s = 0;
             while (i < 10) {
                 if (s < 5) { s = s + 2; } else { s = s + 1; }
                 i = i + 1;
             }",
        );
        for instruction in instructions(&functions, top) {
            if let Instruction::Jump { target }
            | Instruction::JumpIfTrue { target }
            | Instruction::JumpIfFalse { target }
            | Instruction::JumpLoop { target } = instruction
            {
                assert_ne!(target, UNBOUND_TARGET);
            }
        }
    }

    #[test]
    fn functions_hoist_and_call_args_go_right_to_left() {
        let (functions, top) = compile(
            "var r = 0; r = f(1, 2);
             function f(a, b) { return a - b; }",
        );
        let all = instructions(&functions, top);
        // Arguments pushed right-to-left: 2 first, then 1.
        let call_at = all
            .iter()
            .position(|i| matches!(i, Instruction::Call { .. }))
            .unwrap();
        assert_eq!(all[call_at - 2], Instruction::LoadNumber { value: 2.0 });
        assert_eq!(all[call_at - 1], Instruction::LoadNumber { value: 1.0 });

        // The declared function compiled too, reading parameters from
        // negative slots.
        let (f_id, _) = functions
            .iter()
            .find(|(_, m)| m.name == "f")
            .expect("f compiled");
        let f_instructions = instructions(&functions, f_id);
        assert!(f_instructions.contains(&Instruction::LoadLocal { slot: -1 }));
        assert!(f_instructions.contains(&Instruction::LoadLocal { slot: -2 }));
    }

    #[test]
    fn unknown_function_error_carries_position() {
        let err = compile_err("var x = 1;\nmissing(x);");
        assert!(err.message.contains("Unknown function `missing`"));
        let span = err.span.unwrap();
        assert_eq!(span.start.line, 2);
        assert_eq!(span.start.column, 1);
    }

    #[test]
    fn arity_mismatch_is_an_error() {
        let err = compile_err("function f(a) { return a; } f(1, 2);");
        assert!(err.message.contains("expects 1 arguments, received 2"));
    }

    #[test]
    fn unknown_variable_is_an_error() {
        let err = compile_err("y;");
        assert!(err.message.contains("Unknown variable `y`"));
    }

    #[test]
    fn non_literal_initializer_is_an_error() {
        let err = compile_err("var x = 1 + 2;");
        assert!(err.message.contains("number literal is required"));
    }

    #[test]
    fn nested_declaration_in_block_is_an_error() {
        let err = compile_err("if (1) { function g() { return 1; } }");
        assert!(err.message.contains("must be declared directly"));
    }
}
