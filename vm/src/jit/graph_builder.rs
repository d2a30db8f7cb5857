//! Bytecode → graph translation.
//!
//! A single linear scan over the bytecode maintains one abstract
//! [`Environment`] — the current value of every local slot plus the
//! operand stack — per reachable program point. Forward jump targets get
//! a pending merge environment; arriving paths merge pointwise, creating
//! phis lazily on the first disagreement. Loop headers are special-cased:
//! the `LoopHeader` marker installs a phi for every slot up front, since
//! the back-edge value is not known yet.
//!
//! The builder is deliberately incomplete: calls (and any bytecode shape
//! it does not understand) make it return `None`, and the function simply
//! stays interpreted. That is a negative result, not an error.

use std::collections::BTreeMap;

use bytecode::{decode_at, Instruction};
use log::trace;

use super::graph::{BinopKind, BlockId, Graph, NodeId, NodeOp};
use crate::function::BytecodeUnit;

/// Values for every slot (parameters first, then locals) plus the operand
/// stack, tied to the block currently being appended to.
#[derive(Clone)]
struct Environment {
    block: BlockId,
    values: Vec<NodeId>,
    stack: Vec<NodeId>,
}

/// Merge state for a forward jump target that has not been reached yet.
struct PendingMerge {
    block: BlockId,
    values: Vec<NodeId>,
    stack: Vec<NodeId>,
    value_phis: Vec<Option<NodeId>>,
    stack_phis: Vec<Option<NodeId>>,
    arrivals: u32,
}

/// A loop header with its eagerly installed phis, keyed by the offset of
/// the `LoopHeader` marker (which is what `JumpLoop` targets).
struct LoopRecord {
    block: BlockId,
    value_phis: Vec<NodeId>,
    stack_phis: Vec<NodeId>,
}

pub fn build(parameter_count: u16, unit: &BytecodeUnit) -> Option<Graph> {
    Builder::new(parameter_count, unit).run()
}

struct Builder<'a> {
    unit: &'a BytecodeUnit,
    parameter_count: usize,
    graph: Graph,
    env: Option<Environment>,
    pending: BTreeMap<u32, PendingMerge>,
    loops: BTreeMap<u32, LoopRecord>,
}

impl<'a> Builder<'a> {
    fn new(parameter_count: u16, unit: &'a BytecodeUnit) -> Self {
        let mut graph = Graph::new(parameter_count);
        let mut values =
            Vec::with_capacity(parameter_count as usize + unit.local_count as usize);
        for i in 0..parameter_count {
            values.push(graph.parameter(i));
        }
        for _ in 0..unit.local_count {
            values.push(graph.undefined_constant());
        }
        let first = graph.new_block();
        graph.add_edge(graph.entry(), first);
        Self {
            unit,
            parameter_count: parameter_count as usize,
            env: Some(Environment {
                block: first,
                values,
                stack: Vec::new(),
            }),
            graph,
            pending: BTreeMap::new(),
            loops: BTreeMap::new(),
        }
    }

    fn run(mut self) -> Option<Graph> {
        let code = &self.unit.code;
        let mut pc = 0usize;
        while pc < code.len() {
            // A pending merge at this offset revives (or joins) the
            // environment before the instruction executes.
            if let Some(merge) = self.pending.remove(&(pc as u32)) {
                self.env = Some(self.adopt_merge(merge)?);
            }

            let (instruction, next_pc) = decode_at(code, pc)?;
            if self.env.is_none() {
                // Unreachable code; skip until a merge target revives us.
                pc = next_pc;
                continue;
            }
            self.step(instruction, pc)?;
            pc = next_pc;
        }

        // Every registered jump target must lie inside the unit, and a
        // well-formed unit ends each path with Return.
        if !self.pending.is_empty() || self.env.is_some() {
            return None;
        }

        self.split_critical_edges();
        Some(self.graph)
    }

    fn step(&mut self, instruction: Instruction, pc: usize) -> Option<()> {
        match instruction {
            Instruction::Drop => {
                self.pop()?;
            }
            Instruction::Dup => {
                let top = *self.env()?.stack.last()?;
                self.env()?.stack.push(top);
            }
            Instruction::LoadNumber { value } => {
                let block = self.env()?.block;
                let node = self.graph.append_node(
                    block,
                    NodeOp::NumberConstant(value),
                    vec![],
                );
                self.env()?.stack.push(node);
            }
            Instruction::LoadLocal { slot } => {
                let index = self.value_index(slot)?;
                let value = self.env()?.values[index];
                self.env()?.stack.push(value);
            }
            Instruction::StoreLocal { slot } => {
                let index = self.value_index(slot)?;
                let value = self.pop()?;
                self.env()?.values[index] = value;
            }
            Instruction::Add => self.binop(BinopKind::Add)?,
            Instruction::Sub => self.binop(BinopKind::Sub)?,
            Instruction::Mul => self.binop(BinopKind::Mul)?,
            Instruction::Div => self.binop(BinopKind::Div)?,
            Instruction::TestEqual => self.binop(BinopKind::Equal)?,
            Instruction::TestLessThan => self.binop(BinopKind::LessThan)?,
            Instruction::TestLessThanOrEqual => {
                self.binop(BinopKind::LessThanOrEqual)?
            }
            Instruction::Jump { target } => {
                if (target as usize) <= pc {
                    // A backward jump that is not a loop back edge; the
                    // compiler never emits this shape.
                    return None;
                }
                let env = self.env.take()?;
                self.register_merge(target, &env)?;
            }
            Instruction::JumpIfTrue { target } => {
                self.branch(target, pc, true)?;
            }
            Instruction::JumpIfFalse { target } => {
                self.branch(target, pc, false)?;
            }
            Instruction::LoopHeader => {
                self.loop_header(pc)?;
            }
            Instruction::JumpLoop { target } => {
                let env = self.env.take()?;
                let record = self.loops.get(&target)?;
                if env.stack.len() != record.stack_phis.len() {
                    return None;
                }
                self.graph.add_edge(env.block, record.block);
                let value_phis = record.value_phis.clone();
                let stack_phis = record.stack_phis.clone();
                for (phi, value) in value_phis.iter().zip(&env.values) {
                    self.graph.phi_append_input(*phi, *value);
                }
                for (phi, value) in stack_phis.iter().zip(&env.stack) {
                    self.graph.phi_append_input(*phi, *value);
                }
            }
            Instruction::Call { .. } => {
                // Calls are out of scope for the optimizing tier.
                trace!("graph builder: bailing out on Call at offset {pc}");
                return None;
            }
            Instruction::Return => {
                let value = self.pop()?;
                let env = self.env.take()?;
                self.graph
                    .append_node(env.block, NodeOp::Return, vec![value]);
                self.graph.add_edge(env.block, self.graph.exit());
            }
        }
        Some(())
    }

    fn env(&mut self) -> Option<&mut Environment> {
        self.env.as_mut()
    }

    fn pop(&mut self) -> Option<NodeId> {
        self.env.as_mut()?.stack.pop()
    }

    fn value_index(&self, slot: i16) -> Option<usize> {
        if slot < 0 {
            let index = (-(slot as i32) - 1) as usize;
            (index < self.parameter_count).then_some(index)
        } else {
            let index = self.parameter_count + slot as usize;
            (slot < self.unit.local_count as i16).then_some(index)
        }
    }

    fn binop(&mut self, kind: BinopKind) -> Option<()> {
        let right = self.pop()?;
        let left = self.pop()?;
        let block = self.env()?.block;
        let node = self.graph.append_node(
            block,
            NodeOp::Binop(kind),
            vec![left, right],
        );
        self.env()?.stack.push(node);
        Some(())
    }

    /// Conditional branch: emit the branch node, register the taken
    /// target for deferred merging, and continue into a fresh
    /// fall-through block. Successor order encodes the condition sense:
    /// the first successor is the taken-when-true target.
    fn branch(&mut self, target: u32, pc: usize, when_true: bool) -> Option<()> {
        if (target as usize) <= pc {
            return None;
        }
        let condition = self.pop()?;
        let env = self.env.take()?;
        self.graph
            .append_node(env.block, NodeOp::Branch, vec![condition]);
        let fallthrough = self.graph.new_block();
        if when_true {
            self.register_merge(target, &env)?;
            self.graph.add_edge(env.block, fallthrough);
        } else {
            self.graph.add_edge(env.block, fallthrough);
            self.register_merge(target, &env)?;
        }
        self.env = Some(Environment {
            block: fallthrough,
            values: env.values,
            stack: env.stack,
        });
        Some(())
    }

    /// `LoopHeader` at offset `pc`: create the header block eagerly and
    /// install a phi for every slot, so loop-carried values are always
    /// phi-represented even if the body leaves them unchanged.
    fn loop_header(&mut self, pc: usize) -> Option<()> {
        let env = self.env.take()?;
        let header = self.graph.new_loop_header();
        self.graph.add_edge(env.block, header);

        let mut values = Vec::with_capacity(env.values.len());
        let mut value_phis = Vec::with_capacity(env.values.len());
        for &value in &env.values {
            let phi = self.graph.append_node(header, NodeOp::Phi, vec![value]);
            values.push(phi);
            value_phis.push(phi);
        }
        let mut stack = Vec::with_capacity(env.stack.len());
        let mut stack_phis = Vec::with_capacity(env.stack.len());
        for &value in &env.stack {
            let phi = self.graph.append_node(header, NodeOp::Phi, vec![value]);
            stack.push(phi);
            stack_phis.push(phi);
        }
        self.loops.insert(
            pc as u32,
            LoopRecord {
                block: header,
                value_phis,
                stack_phis,
            },
        );
        self.env = Some(Environment {
            block: header,
            values,
            stack,
        });
        Some(())
    }

    /// Merge `env` into the pending environment for `target`, creating it
    /// on first arrival.
    fn register_merge(&mut self, target: u32, env: &Environment) -> Option<()> {
        if let Some(pending) = self.pending.get_mut(&target) {
            if env.stack.len() != pending.stack.len() {
                return None;
            }
            self.graph.add_edge(env.block, pending.block);
            merge_values(
                &mut self.graph,
                pending.block,
                pending.arrivals,
                &mut pending.values,
                &mut pending.value_phis,
                &env.values,
            );
            merge_values(
                &mut self.graph,
                pending.block,
                pending.arrivals,
                &mut pending.stack,
                &mut pending.stack_phis,
                &env.stack,
            );
            pending.arrivals += 1;
        } else {
            let block = self.graph.new_block();
            self.graph.add_edge(env.block, block);
            self.pending.insert(target, PendingMerge {
                block,
                values: env.values.clone(),
                stack: env.stack.clone(),
                value_phis: vec![None; env.values.len()],
                stack_phis: vec![None; env.stack.len()],
                arrivals: 1,
            });
        }
        Some(())
    }

    /// The scan reached a pending merge target: fold the fall-through
    /// environment in (if reachable) and continue in the merge block.
    fn adopt_merge(&mut self, mut merge: PendingMerge) -> Option<Environment> {
        if let Some(env) = self.env.take() {
            if env.stack.len() != merge.stack.len() {
                return None;
            }
            self.graph.add_edge(env.block, merge.block);
            merge_values(
                &mut self.graph,
                merge.block,
                merge.arrivals,
                &mut merge.values,
                &mut merge.value_phis,
                &env.values,
            );
            merge_values(
                &mut self.graph,
                merge.block,
                merge.arrivals,
                &mut merge.stack,
                &mut merge.stack_phis,
                &env.stack,
            );
        }
        Some(Environment {
            block: merge.block,
            values: merge.values,
            stack: merge.stack,
        })
    }

    /// Keep the graph in split-edge form: every block with multiple
    /// predecessors gets exactly one predecessor per incoming edge, so
    /// the code generator can place phi moves on the edge's own block.
    fn split_critical_edges(&mut self) {
        let targets: Vec<BlockId> = self.graph.block_ids().collect();
        for target in targets {
            if self.graph.block(target).predecessors.len() < 2 {
                continue;
            }
            let preds = self.graph.block(target).predecessors.clone();
            for pred in preds {
                if self.graph.block(pred).successors.len() > 1 {
                    self.graph.split_edge(pred, target);
                }
            }
        }
    }
}

/// Pointwise merge of one arriving path into the accumulated values:
/// identical values need nothing; a divergence creates the slot's phi on
/// the spot (with one input per path seen so far) and later arrivals
/// append to it.
fn merge_values(
    graph: &mut Graph,
    block: BlockId,
    previous_arrivals: u32,
    current: &mut [NodeId],
    phis: &mut [Option<NodeId>],
    incoming: &[NodeId],
) {
    for k in 0..current.len() {
        if let Some(phi) = phis[k] {
            graph.phi_append_input(phi, incoming[k]);
        } else if current[k] != incoming[k] {
            let mut inputs = vec![current[k]; previous_arrivals as usize];
            inputs.push(incoming[k]);
            let phi = graph.append_node(block, NodeOp::Phi, inputs);
            phis[k] = Some(phi);
            current[k] = phi;
        }
    }
}
