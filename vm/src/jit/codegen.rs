//! Graph + block order → structured instruction stream.
//!
//! Instructions are emitted in reverse relative to the final block order:
//! per-block fragments are appended back-to-front and the whole sequence
//! is reversed once at the end. Reverse order is what makes structured
//! emission tractable — the `Block`/`Loop` delimiters enclosing a branch
//! target can only be placed once every block between the branch and its
//! target has been processed, and walking backward makes the processed
//! set exactly the suffix needed to compute each branch's nesting depth.
//!
//! A virtual stack tracks the currently open constructs. Every block's
//! construct carries an outstanding-branch count equal to its predecessor
//! count; emitting a branch (or falling through) to the block decrements
//! it, and the construct closes when the count reaches zero. Loop
//! constructs open at the first back edge that needs them and close on
//! self-arrival — when the walk reaches the header's own position.

use super::graph::{BinopKind, BlockId, Graph, NodeId, NodeOp};
use super::machine::{CompiledCode, MachineInst};

/// log2 of the stack slot size; the prologue shifts the frame base by
/// this to turn a slot index into a byte address.
const STACK_SLOT_LOG2_SIZE: i32 = 3;

struct InstructionAssembler {
    code: Vec<MachineInst>,
}

impl InstructionAssembler {
    fn new() -> Self {
        Self { code: Vec::new() }
    }

    fn block(&mut self) {
        self.code.push(MachineInst::Block);
    }

    fn loop_(&mut self) {
        self.code.push(MachineInst::Loop);
    }

    fn end(&mut self) {
        self.code.push(MachineInst::End);
    }

    fn br(&mut self, depth: u32) {
        self.code.push(MachineInst::Br(depth));
    }

    fn br_if(&mut self, depth: u32) {
        self.code.push(MachineInst::BrIf(depth));
    }

    fn ret(&mut self) {
        self.code.push(MachineInst::Return);
    }

    fn local_get(&mut self, local: u32) {
        self.code.push(MachineInst::LocalGet(local));
    }

    fn local_set(&mut self, local: u32) {
        self.code.push(MachineInst::LocalSet(local));
    }

    fn f64_const(&mut self, value: f64) {
        self.code.push(MachineInst::F64Const(value));
    }

    fn i32_const(&mut self, value: i32) {
        self.code.push(MachineInst::I32Const(value));
    }

    fn i32_add(&mut self) {
        self.code.push(MachineInst::I32Add);
    }

    fn i32_shl(&mut self) {
        self.code.push(MachineInst::I32Shl);
    }

    fn f64_load(&mut self) {
        self.code.push(MachineInst::F64Load);
    }
}

/// Completed fragments in reverse block order; reversed once at the end.
/// Also owns the lazy node-id → target-local map: node ids are assigned
/// in append order, so they make a stable allocation key.
struct ReversedInstructionSequence {
    code: Vec<MachineInst>,
    node_local: Vec<Option<u32>>,
    /// Local 0 is reserved for the frame base.
    local_count: u32,
}

impl ReversedInstructionSequence {
    fn new(node_count: usize) -> Self {
        Self {
            code: Vec::new(),
            node_local: vec![None; node_count],
            local_count: 1,
        }
    }

    fn add(&mut self, assembler: InstructionAssembler) {
        self.code.extend(assembler.code.into_iter().rev());
    }

    fn local_for(&mut self, node: NodeId) -> u32 {
        if let Some(local) = self.node_local[node.index()] {
            return local;
        }
        let local = self.local_count;
        self.local_count += 1;
        self.node_local[node.index()] = Some(local);
        local
    }

    fn finish(mut self) -> (Vec<MachineInst>, u32) {
        self.code.reverse();
        (self.code, self.local_count)
    }
}

struct OpenConstruct {
    block: BlockId,
    is_loop: bool,
}

pub fn generate(graph: &Graph, order: &[BlockId]) -> Option<CompiledCode> {
    let mut generator = Generator {
        graph,
        order,
        sequence: ReversedInstructionSequence::new(graph.node_count()),
        control_stack: Vec::new(),
        outstanding: vec![0; graph.block_count()],
    };
    generator.run()
}

struct Generator<'a> {
    graph: &'a Graph,
    order: &'a [BlockId],
    sequence: ReversedInstructionSequence,
    control_stack: Vec<OpenConstruct>,
    outstanding: Vec<u32>,
}

impl Generator<'_> {
    fn run(mut self) -> Option<CompiledCode> {
        for i in (0..self.order.len()).rev() {
            let block = self.order[i];
            let next = self.order.get(i + 1).copied();
            self.emit_block(block, next)?;
        }
        // Every construct must have been closed by now.
        if !self.control_stack.is_empty() {
            return None;
        }

        // Prologue: convert the incoming frame base from a slot index to
        // a byte address before any node code runs.
        let mut a = InstructionAssembler::new();
        a.local_get(0);
        a.i32_const(STACK_SLOT_LOG2_SIZE);
        a.i32_shl();
        a.local_set(0);
        self.sequence.add(a);

        let (code, local_count) = self.sequence.finish();
        Some(CompiledCode::new(code, local_count))
    }

    /// Nesting depth of the open construct for `target`, innermost = 0.
    fn depth_of(&self, target: BlockId) -> Option<u32> {
        self.control_stack
            .iter()
            .rev()
            .position(|c| c.block == target)
            .map(|d| d as u32)
    }

    fn account_edge(&mut self, successor: BlockId) {
        let count = &mut self.outstanding[successor.index()];
        *count = count.saturating_sub(1);
    }

    fn emit_block(&mut self, bb: BlockId, next: Option<BlockId>) -> Option<()> {
        let block = self.graph.block(bb);
        let terminator = block.nodes.last().copied().filter(|&n| {
            matches!(self.graph.node(n).op, NodeOp::Branch | NodeOp::Return)
        });

        // Terminator first: it is the last thing in the block's final
        // code, so it goes into the reversed sequence first.
        match terminator.map(|n| (n, self.graph.node(n).op)) {
            Some((node, NodeOp::Return)) => {
                for &successor in &block.successors {
                    self.account_edge(successor);
                }
                let value = *self.graph.node(node).inputs.first()?;
                let mut a = InstructionAssembler::new();
                a.local_get(self.sequence.local_for(value));
                a.ret();
                self.sequence.add(a);
            }
            Some((node, NodeOp::Branch)) => {
                self.emit_branch(bb, node, next)?;
            }
            _ => {
                if let Some(&successor) = block.successors.first() {
                    self.emit_goto(bb, successor, next)?;
                }
            }
        }

        // Per-node lowering, table-driven by opcode, in reverse node
        // order.
        for &node in block.nodes.iter().rev() {
            if Some(node) == terminator {
                continue;
            }
            self.emit_node(node)?;
        }

        // Close constructs that end right before this block's code:
        // resolved blocks by count, this block's own loop on
        // self-arrival.
        loop {
            let Some(top) = self.control_stack.last() else { break };
            if !top.is_loop && self.outstanding[top.block.index()] == 0 {
                self.control_stack.pop();
                let mut a = InstructionAssembler::new();
                a.block();
                self.sequence.add(a);
            } else if top.is_loop && top.block == bb {
                self.control_stack.pop();
                let mut a = InstructionAssembler::new();
                a.loop_();
                self.sequence.add(a);
            } else {
                break;
            }
        }
        if self.graph.block(bb).is_loop_header
            && self
                .control_stack
                .iter()
                .any(|c| c.is_loop && c.block == bb)
        {
            // The loop construct could not close on self-arrival; the
            // schedule is not one this emitter can serialize.
            return None;
        }

        // Open this block's own construct: its End sits directly before
        // the block's code, where branches will land. The entry needs no
        // construct, and loop headers get a Loop from their back edge
        // instead.
        if bb != self.graph.entry()
            && !self.graph.block(bb).is_loop_header
            && !self.graph.block(bb).predecessors.is_empty()
        {
            let mut a = InstructionAssembler::new();
            a.end();
            self.sequence.add(a);
            self.control_stack.push(OpenConstruct {
                block: bb,
                is_loop: false,
            });
            self.outstanding[bb.index()] =
                self.graph.block(bb).predecessors.len() as u32;
        }
        Some(())
    }

    fn emit_branch(
        &mut self,
        bb: BlockId,
        node: NodeId,
        next: Option<BlockId>,
    ) -> Option<()> {
        let block = self.graph.block(bb);
        let [on_true, on_false]: [BlockId; 2] =
            block.successors.as_slice().try_into().ok()?;
        let condition = *self.graph.node(node).inputs.first()?;

        let mut a = InstructionAssembler::new();
        a.local_get(self.sequence.local_for(condition));
        a.f64_const(0.0);
        if next == Some(on_false) {
            // Fall through to the false target; branch when the
            // condition is non-zero.
            a.code.push(MachineInst::F64Ne);
            a.br_if(self.depth_of(on_true)?);
        } else if next == Some(on_true) {
            a.code.push(MachineInst::F64Eq);
            a.br_if(self.depth_of(on_false)?);
        } else {
            a.code.push(MachineInst::F64Ne);
            a.br_if(self.depth_of(on_true)?);
            a.br(self.depth_of(on_false)?);
        }
        self.account_edge(on_true);
        self.account_edge(on_false);
        self.sequence.add(a);
        Some(())
    }

    /// Single-successor block: a back edge, a fallthrough, or a forward
    /// branch, followed (in final order: preceded) by this edge's phi
    /// moves.
    fn emit_goto(
        &mut self,
        bb: BlockId,
        successor: BlockId,
        next: Option<BlockId>,
    ) -> Option<()> {
        let is_back_edge = self.graph.block(successor).is_loop_header
            && self.graph.block(successor).order_index
                < self.graph.block(bb).order_index;

        if is_back_edge {
            if self.depth_of(successor).is_none() {
                // First latch reached walking backward: this is where
                // the loop construct ends, so open it here.
                let mut a = InstructionAssembler::new();
                a.end();
                self.sequence.add(a);
                self.control_stack.push(OpenConstruct {
                    block: successor,
                    is_loop: true,
                });
                // The back edge is what closes a loop construct.
                self.outstanding[successor.index()] = 1;
            }
            self.account_edge(successor);
            let mut a = InstructionAssembler::new();
            a.br(self.depth_of(successor)?);
            self.sequence.add(a);
        } else {
            self.account_edge(successor);
            if next != Some(successor) {
                let mut a = InstructionAssembler::new();
                a.br(self.depth_of(successor)?);
                self.sequence.add(a);
            }
        }

        self.emit_phi_moves(bb, successor)
    }

    /// Copy this edge's phi inputs into the phis' locals. All sources are
    /// read onto the value stack before any destination is written, so
    /// mutually dependent moves (swaps through a loop) stay parallel.
    fn emit_phi_moves(&mut self, bb: BlockId, successor: BlockId) -> Option<()> {
        let succ = self.graph.block(successor);
        let phis: Vec<NodeId> = succ
            .nodes
            .iter()
            .copied()
            .filter(|&n| self.graph.node(n).op == NodeOp::Phi)
            .collect();
        if phis.is_empty() {
            return Some(());
        }
        // Split-edge form: this block is the predecessor owning the edge.
        let pred_index = succ.predecessors.iter().position(|&p| p == bb)?;

        let mut a = InstructionAssembler::new();
        for &phi in &phis {
            let source = *self.graph.node(phi).inputs.get(pred_index)?;
            a.local_get(self.sequence.local_for(source));
        }
        for &phi in phis.iter().rev() {
            a.local_set(self.sequence.local_for(phi));
        }
        self.sequence.add(a);
        Some(())
    }

    fn emit_node(&mut self, node: NodeId) -> Option<()> {
        let mut a = InstructionAssembler::new();
        match self.graph.node(node).op {
            // Phi values live in their local slot; reads and writes are
            // emitted at the uses and the predecessor edges.
            NodeOp::Phi => return Some(()),
            NodeOp::Parameter(i) => {
                // Parameters sit below the frame base at fixed offsets.
                a.local_get(0);
                a.i32_const((-(i as i32) - 1) << STACK_SLOT_LOG2_SIZE);
                a.i32_add();
                a.f64_load();
                a.local_set(self.sequence.local_for(node));
            }
            NodeOp::NumberConstant(value) => {
                a.f64_const(value);
                a.local_set(self.sequence.local_for(node));
            }
            NodeOp::Binop(kind) => {
                let inputs = &self.graph.node(node).inputs;
                let left = *inputs.first()?;
                let right = *inputs.get(1)?;
                a.local_get(self.sequence.local_for(left));
                a.local_get(self.sequence.local_for(right));
                let (inst, is_comparison) = match kind {
                    BinopKind::Add => (MachineInst::F64Add, false),
                    BinopKind::Sub => (MachineInst::F64Sub, false),
                    BinopKind::Mul => (MachineInst::F64Mul, false),
                    BinopKind::Div => (MachineInst::F64Div, false),
                    BinopKind::Equal => (MachineInst::F64Eq, true),
                    BinopKind::LessThan => (MachineInst::F64Lt, true),
                    BinopKind::LessThanOrEqual => (MachineInst::F64Le, true),
                };
                a.code.push(inst);
                if is_comparison {
                    // Comparison results become ordinary values.
                    a.code.push(MachineInst::F64ConvertI32U);
                }
                a.local_set(self.sequence.local_for(node));
            }
            // Terminators are handled by the block walk; one appearing
            // mid-block means the graph is malformed.
            NodeOp::Branch | NodeOp::Return => return None,
        }
        self.sequence.add(a);
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile_program;
    use crate::function::Functions;
    use crate::jit::{graph_builder, scheduler};
    use crate::memory::Memory;
    use std::collections::HashMap;

    /// Compile `name` from source all the way to machine code.
    fn generate_named(source: &str, name: &str) -> CompiledCode {
        let program = parser::parse(source).expect("parse");
        let mut functions = Functions::new();
        compile_program(&program, &HashMap::new(), &mut functions)
            .expect("compile");
        let (_, meta) = functions
            .iter()
            .find(|(_, m)| m.name == name)
            .expect("function exists");
        let mut graph =
            graph_builder::build(meta.parameter_count, meta.bytecode().unwrap())
                .expect("graph builds");
        let order = scheduler::compute_block_order(&mut graph);
        generate(&graph, &order).expect("code generates")
    }

    /// Invoke compiled code the way the interpreter would: arguments
    /// below the frame base, slot 0 holding the caller frame base.
    fn invoke(code: &CompiledCode, args: &[f64]) -> f64 {
        let mut memory = Memory::default();
        let base = memory.stack_start() + args.len() + 1;
        for (i, &arg) in args.iter().enumerate() {
            memory.write_slot(base - 1 - i, arg);
        }
        memory.write_slot(base, -1.0);
        code.invoke(&mut memory, base)
    }

    #[test]
    fn straight_line_function() {
        let code = generate_named(
            "function f(x) { return x * 2 + 1; }",
            "f",
        );
        assert_eq!(invoke(&code, &[20.0]), 41.0);
    }

    #[test]
    fn branches_pick_the_right_arm() {
        let code = generate_named(
            "function f(x) {
                 if (x < 200) { return x + 1; } else { return x + 2; }
             }",
            "f",
        );
        assert_eq!(invoke(&code, &[100.0]), 101.0);
        assert_eq!(invoke(&code, &[500.0]), 502.0);
        assert_eq!(invoke(&code, &[199.0]), 200.0);
        assert_eq!(invoke(&code, &[200.0]), 202.0);
    }

    #[test]
    fn merge_after_if_uses_phi_slot() {
        let code = generate_named(
            "function f(x) {
                 var r = 0;
                 if (x == 1) { r = 10; } else { r = 20; }
                 return r + 1;
             }",
            "f",
        );
        assert_eq!(invoke(&code, &[1.0]), 11.0);
        assert_eq!(invoke(&code, &[2.0]), 21.0);
    }

    #[test]
    fn else_less_if_flows_through_split_edge() {
        // One arm of the branch reaches the merge through a split-edge
        // block that carries only the phi move.
        let code = generate_named(
            "function f(x) {
                 var r = 5;
                 if (x < 10) { r = r + 1; }
                 return r * 2;
             }",
            "f",
        );
        assert_eq!(invoke(&code, &[3.0]), 12.0);
        assert_eq!(invoke(&code, &[20.0]), 10.0);
    }

    #[test]
    fn loop_counts_to_limit() {
        let code = generate_named(
            "function f(n) {
                 var i = 0;
                 while (i < n) { i = i + 1; }
                 return i;
             }",
            "f",
        );
        assert_eq!(invoke(&code, &[10.0]), 10.0);
        assert_eq!(invoke(&code, &[0.0]), 0.0);
        assert_eq!(invoke(&code, &[1.0]), 1.0);
    }

    #[test]
    fn loop_accumulates() {
        let code = generate_named(
            "function f(n) {
                 var i = 0; var s = 0;
                 while (i < n) { i = i + 1; s = s + i; }
                 return s;
             }",
            "f",
        );
        assert_eq!(invoke(&code, &[4.0]), 10.0);
    }

    #[test]
    fn loop_carried_swap_moves_in_parallel() {
        let code = generate_named(
            "function f(n) {
                 var a = 0; var b = 1; var i = 0; var t = 0;
                 while (i < n) {
                     t = a;
                     a = b;
                     b = t + b;
                     i = i + 1;
                 }
                 return a;
             }",
            "f",
        );
        // Fibonacci by parallel loop-carried updates.
        assert_eq!(invoke(&code, &[10.0]), 55.0);
    }

    #[test]
    fn nested_loops() {
        let code = generate_named(
            "function f(n) {
                 var i = 0; var s = 0;
                 while (i < n) {
                     var j = 0;
                     while (j < i) { s = s + 1; j = j + 1; }
                     i = i + 1;
                 }
                 return s;
             }",
            "f",
        );
        // Sum of 0..n = n*(n-1)/2 inner iterations.
        assert_eq!(invoke(&code, &[5.0]), 10.0);
    }

    #[test]
    fn branch_inside_loop() {
        let code = generate_named(
            "function f(n) {
                 var i = 0; var s = 0;
                 while (i < n) {
                     if (i < 3) { s = s + 10; } else { s = s + 1; }
                     i = i + 1;
                 }
                 return s;
             }",
            "f",
        );
        assert_eq!(invoke(&code, &[5.0]), 32.0);
    }

    #[test]
    fn prologue_comes_first() {
        let code = generate_named("function f(x) { return x; }", "f");
        let insts = code.instructions();
        assert_eq!(insts[0], MachineInst::LocalGet(0));
        assert_eq!(insts[1], MachineInst::I32Const(STACK_SLOT_LOG2_SIZE));
        assert_eq!(insts[2], MachineInst::I32Shl);
        assert_eq!(insts[3], MachineInst::LocalSet(0));
    }
}
