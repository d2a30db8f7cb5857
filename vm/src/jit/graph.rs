//! The intermediate representation: a control-flow graph of basic blocks
//! holding typed value nodes.
//!
//! Blocks and nodes live in arenas owned by the [`Graph`]; every
//! cross-reference is a plain index ([`BlockId`], [`NodeId`]), which keeps
//! the cyclic predecessor/successor structure trivially owned. A node's id
//! is assigned exactly once, when it is appended to a block, and ids are
//! strictly increasing in append order — the code generator later reuses
//! that ordering as a stable key for target-local allocation.

use std::fmt::Write;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinopKind {
    Add,
    Sub,
    Mul,
    Div,
    Equal,
    LessThan,
    LessThanOrEqual,
}

/// Node payloads, one case per opcode category. Each case carries exactly
/// the data that category needs; inputs live in [`Node::inputs`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NodeOp {
    /// Incoming parameter by index; entry block only.
    Parameter(u16),
    NumberConstant(f64),
    Binop(BinopKind),
    /// One input per predecessor of the containing block, in predecessor
    /// order.
    Phi,
    /// Terminator. Input: the condition. The block's first successor is
    /// the taken-when-true target, the second the false target.
    Branch,
    /// Terminator. Input: the return value.
    Return,
}

#[derive(Debug)]
pub struct Node {
    pub op: NodeOp,
    pub inputs: Vec<NodeId>,
}

#[derive(Debug, Default)]
pub struct BasicBlock {
    pub nodes: Vec<NodeId>,
    pub successors: Vec<BlockId>,
    pub predecessors: Vec<BlockId>,
    pub is_loop_header: bool,
    /// Position in the final schedule; set by the block scheduler.
    pub order_index: usize,
    /// Innermost loop this block belongs to (the loop's header block);
    /// set by the block scheduler.
    pub containing_loop: Option<BlockId>,
}

/// Graph of one function. The entry block carries one node per parameter
/// plus the undefined constant; the exit block collects all return paths.
pub struct Graph {
    blocks: Vec<BasicBlock>,
    nodes: Vec<Node>,
    entry: BlockId,
    exit: BlockId,
    parameters: Vec<NodeId>,
    undefined_constant: NodeId,
}

impl Graph {
    pub fn new(parameter_count: u16) -> Self {
        let mut graph = Self {
            blocks: Vec::new(),
            nodes: Vec::new(),
            entry: BlockId(0),
            exit: BlockId(0),
            parameters: Vec::new(),
            undefined_constant: NodeId(0),
        };
        graph.entry = graph.new_block();
        graph.exit = graph.new_block();
        for i in 0..parameter_count {
            let p = graph.append_node(graph.entry, NodeOp::Parameter(i), vec![]);
            graph.parameters.push(p);
        }
        graph.undefined_constant = graph.append_node(
            graph.entry,
            NodeOp::NumberConstant(0.0),
            vec![],
        );
        graph
    }

    pub fn entry(&self) -> BlockId {
        self.entry
    }

    pub fn exit(&self) -> BlockId {
        self.exit
    }

    pub fn parameter(&self, i: u16) -> NodeId {
        self.parameters[i as usize]
    }

    pub fn undefined_constant(&self) -> NodeId {
        self.undefined_constant
    }

    pub fn new_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(BasicBlock {
            order_index: usize::MAX,
            ..BasicBlock::default()
        });
        id
    }

    pub fn new_loop_header(&mut self) -> BlockId {
        let id = self.new_block();
        self.blocks[id.index()].is_loop_header = true;
        id
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.index()]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut BasicBlock {
        &mut self.blocks[id.index()]
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    /// Create a node and append it to `block`. This is the only way to
    /// create a node, so the id invariant holds by construction.
    pub fn append_node(
        &mut self,
        block: BlockId,
        op: NodeOp,
        inputs: Vec<NodeId>,
    ) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node { op, inputs });
        self.blocks[block.index()].nodes.push(id);
        id
    }

    /// Append one more input to a phi (a later-arriving merge path).
    pub fn phi_append_input(&mut self, phi: NodeId, input: NodeId) {
        debug_assert_eq!(self.nodes[phi.index()].op, NodeOp::Phi);
        self.nodes[phi.index()].inputs.push(input);
    }

    pub fn add_edge(&mut self, from: BlockId, to: BlockId) {
        self.blocks[from.index()].successors.push(to);
        self.blocks[to.index()].predecessors.push(from);
    }

    /// Split the edge `from → to` with a fresh empty block, preserving
    /// the edge's position on both sides (phi inputs stay aligned with
    /// predecessor order).
    pub fn split_edge(&mut self, from: BlockId, to: BlockId) -> BlockId {
        let split = self.new_block();
        let succ_pos = self.blocks[from.index()]
            .successors
            .iter()
            .position(|&s| s == to)
            .expect("edge to split exists");
        self.blocks[from.index()].successors[succ_pos] = split;
        let pred_pos = self.blocks[to.index()]
            .predecessors
            .iter()
            .position(|&p| p == from)
            .expect("edge to split exists");
        self.blocks[to.index()].predecessors[pred_pos] = split;
        self.blocks[split.index()].predecessors.push(from);
        self.blocks[split.index()].successors.push(to);
        split
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    pub fn edge_count(&self) -> usize {
        self.blocks.iter().map(|b| b.successors.len()).sum()
    }

    pub fn phi_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.op == NodeOp::Phi).count()
    }

    /// Human-readable dump in block order of creation.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for id in self.block_ids() {
            let block = self.block(id);
            let _ = write!(out, "  Block {}", id.0);
            if !block.predecessors.is_empty() {
                let _ = write!(out, " (preds: {})", list(&block.predecessors));
            }
            if !block.successors.is_empty() {
                let _ = write!(out, " (succ: {})", list(&block.successors));
            }
            if block.is_loop_header {
                let _ = write!(out, " (loop)");
            }
            let _ = writeln!(out);
            for &node_id in &block.nodes {
                let _ = writeln!(out, "    {}", self.node_to_string(node_id));
            }
        }
        out
    }

    fn node_to_string(&self, id: NodeId) -> String {
        let node = self.node(id);
        let label = match node.op {
            NodeOp::Parameter(i) => format!("Parameter[{i}]"),
            NodeOp::NumberConstant(n) => format!("NumberConstant[{n}]"),
            NodeOp::Binop(kind) => format!("{kind:?}"),
            NodeOp::Phi => "Phi".to_string(),
            NodeOp::Branch => "Branch".to_string(),
            NodeOp::Return => "Return".to_string(),
        };
        let inputs: Vec<String> =
            node.inputs.iter().map(|n| n.0.to_string()).collect();
        format!("{}: {}: {}", id.0, label, inputs.join(", "))
    }
}

fn list(blocks: &[BlockId]) -> String {
    blocks
        .iter()
        .map(|b| format!("B{}", b.0))
        .collect::<Vec<_>>()
        .join(", ")
}
