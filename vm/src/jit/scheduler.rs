//! Loop-aware basic-block scheduling.
//!
//! Two passes produce the final linear order the code generator consumes:
//!
//! 1. A depth-first walk from the entry records blocks in post-order
//!    (a reverse topological order once back edges are ignored) and
//!    classifies every edge to an on-stack block as a back edge. Back
//!    edges are grouped into one loop record per header, then loop
//!    membership is marked by walking predecessors backward from each
//!    back-edge source, re-parenting only the outermost untagged ancestor
//!    so nested loops keep correct nesting.
//!
//! 2. A stable re-sort keyed on each block's stack of enclosing-loop
//!    indices (outermost first) pulls every loop's members together
//!    without disturbing the relative order of unrelated blocks. Plain
//!    DFS order cannot guarantee loop contiguity once several loops share
//!    exit edges, which is why the resort exists.
//!
//! The returned order starts at the entry block; the sole reachable exit
//! is last; every loop's members are contiguous, nested loops inside
//! their parents. `order_index` and `containing_loop` are filled in on
//! the graph's blocks as a side effect.

use std::cmp::Ordering;

use super::graph::{BlockId, Graph};

struct LoopInfo {
    header: BlockId,
    backedges: Vec<BlockId>,
}

#[derive(Default)]
struct Loops {
    infos: Vec<LoopInfo>,
}

impl Loops {
    fn add_backedge(&mut self, backedge: BlockId, header: BlockId) {
        for info in &mut self.infos {
            if info.header == header {
                info.backedges.push(backedge);
                return;
            }
        }
        self.infos.push(LoopInfo {
            header,
            backedges: vec![backedge],
        });
    }
}

pub fn compute_block_order(graph: &mut Graph) -> Vec<BlockId> {
    let block_count = graph.block_count();
    let mut visited = vec![false; block_count];
    let mut on_stack = vec![false; block_count];
    // Post-order position per block; the comparator keys off these.
    let mut post_index = vec![usize::MAX; block_count];
    let mut post_order: Vec<BlockId> = Vec::new();
    let mut loops = Loops::default();

    process_block(
        graph,
        graph.entry(),
        &mut visited,
        &mut on_stack,
        &mut post_index,
        &mut post_order,
        &mut loops,
    );

    // Mark loop membership from every back edge toward its header.
    for i in 0..loops.infos.len() {
        let header = loops.infos[i].header;
        let backedges = loops.infos[i].backedges.clone();
        for backedge in backedges {
            mark_loop(graph, backedge, header);
        }
    }

    // Precompute each block's stack of enclosing post-order indices,
    // outermost loop first, own index last.
    let index_stack = |mut block: BlockId| -> Vec<usize> {
        let mut stack = vec![post_index[block.index()]];
        while let Some(header) = graph.block(block).containing_loop {
            stack.push(post_index[header.index()]);
            block = header;
        }
        stack.reverse();
        stack
    };
    let stacks: Vec<Vec<usize>> =
        post_order.iter().map(|&b| index_stack(b)).collect();
    let stack_of = {
        let mut by_block: Vec<Vec<usize>> = vec![Vec::new(); block_count];
        for (i, &b) in post_order.iter().enumerate() {
            by_block[b.index()] = stacks[i].clone();
        }
        by_block
    };

    let mut order = post_order;
    order.sort_by(|&left, &right| {
        compare_block_order(&stack_of[left.index()], &stack_of[right.index()])
    });
    // The sort yields reverse topological order (entry last); flip it so
    // the schedule starts at the entry.
    order.reverse();

    for (i, &block) in order.iter().enumerate() {
        graph.block_mut(block).order_index = i;
    }
    order
}

fn process_block(
    graph: &Graph,
    block: BlockId,
    visited: &mut [bool],
    on_stack: &mut [bool],
    post_index: &mut [usize],
    post_order: &mut Vec<BlockId>,
    loops: &mut Loops,
) {
    visited[block.index()] = true;
    on_stack[block.index()] = true;
    for &successor in &graph.block(block).successors {
        if on_stack[successor.index()] {
            // With only reducible loops, the first-pushed block of any
            // loop is its header, so the target of a back edge is always
            // the header.
            loops.add_backedge(block, successor);
        } else if !visited[successor.index()] {
            process_block(
                graph, successor, visited, on_stack, post_index, post_order,
                loops,
            );
        }
    }
    on_stack[block.index()] = false;
    post_index[block.index()] = post_order.len();
    post_order.push(block);
}

/// Mark `block` as belonging to the loop of `header`. When the block
/// already belongs to a (necessarily more deeply nested) loop, walk its
/// containing-loop chain and re-parent only the outermost ancestor that
/// is not yet inside `header`'s loop. Returns the re-parented block, or
/// `None` if the block was already a member.
fn try_mark_block(
    graph: &mut Graph,
    block: BlockId,
    header: BlockId,
) -> Option<BlockId> {
    let parent = graph.block(header).containing_loop;
    let mut marked: Option<BlockId> = None;
    let mut current = Some(block);
    loop {
        if current == Some(header) {
            return None;
        }
        if current == parent {
            let marked = marked.expect("header is not its own parent");
            graph.block_mut(marked).containing_loop = Some(header);
            return Some(marked);
        }
        let block = current.expect("walk reaches header or parent first");
        marked = Some(block);
        current = graph.block(block).containing_loop;
    }
}

/// Walk the graph backward from a back-edge source until the header is
/// reached, marking every visited block as a member of the loop.
fn mark_loop(graph: &mut Graph, block: BlockId, header: BlockId) {
    if try_mark_block(graph, block, header).is_none() {
        return;
    }
    let predecessors = graph.block(block).predecessors.clone();
    for predecessor in predecessors {
        mark_loop(graph, predecessor, header);
    }
}

/// Order blocks by their enclosing-loop index stacks so members of one
/// loop stay together; equal prefixes put the shorter stack (the loop
/// header side) after its members, which the final reversal turns into
/// header-first.
fn compare_block_order(left: &[usize], right: &[usize]) -> Ordering {
    let shared = left.len().min(right.len());
    for i in 0..shared {
        match left[i].cmp(&right[i]) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    right.len().cmp(&left.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::graph::Graph;

    /// Final position of `block` in `order`.
    fn position(order: &[BlockId], block: BlockId) -> usize {
        order.iter().position(|&b| b == block).unwrap()
    }

    fn assert_contiguous(order: &[BlockId], members: &[BlockId]) {
        let mut positions: Vec<usize> =
            members.iter().map(|&b| position(order, b)).collect();
        positions.sort_unstable();
        for pair in positions.windows(2) {
            assert_eq!(
                pair[1],
                pair[0] + 1,
                "loop members are not contiguous: {positions:?}"
            );
        }
    }

    #[test]
    fn diamond_keeps_entry_first_and_exit_last() {
        let mut graph = Graph::new(0);
        let a = graph.new_block();
        let t = graph.new_block();
        let f = graph.new_block();
        let merge = graph.new_block();
        graph.add_edge(graph.entry(), a);
        graph.add_edge(a, t);
        graph.add_edge(a, f);
        graph.add_edge(t, merge);
        graph.add_edge(f, merge);
        graph.add_edge(merge, graph.exit());

        let order = compute_block_order(&mut graph);
        assert_eq!(order.first(), Some(&graph.entry()));
        assert_eq!(order.last(), Some(&graph.exit()));
        assert!(position(&order, a) < position(&order, t));
        assert!(position(&order, a) < position(&order, f));
        assert!(position(&order, t) < position(&order, merge));
        assert!(position(&order, f) < position(&order, merge));
    }

    #[test]
    fn single_loop_is_contiguous_with_header_first() {
        let mut graph = Graph::new(0);
        let pre = graph.new_block();
        let header = graph.new_loop_header();
        let body = graph.new_block();
        let exit = graph.new_block();
        graph.add_edge(graph.entry(), pre);
        graph.add_edge(pre, header);
        graph.add_edge(header, body);
        graph.add_edge(header, exit);
        graph.add_edge(body, header); // back edge
        graph.add_edge(exit, graph.exit());

        let order = compute_block_order(&mut graph);
        assert_contiguous(&order, &[header, body]);
        assert!(position(&order, header) < position(&order, body));
        assert_eq!(graph.block(body).containing_loop, Some(header));
        assert_eq!(graph.block(header).containing_loop, None);
        assert!(position(&order, exit) > position(&order, body));
    }

    #[test]
    fn nested_loops_group_inside_parent() {
        let mut graph = Graph::new(0);
        let outer = graph.new_loop_header();
        let inner = graph.new_loop_header();
        let inner_body = graph.new_block();
        let outer_latch = graph.new_block();
        let exit = graph.new_block();
        graph.add_edge(graph.entry(), outer);
        graph.add_edge(outer, inner);
        graph.add_edge(inner, inner_body);
        graph.add_edge(inner_body, inner); // inner back edge
        graph.add_edge(inner, outer_latch);
        graph.add_edge(outer_latch, outer); // outer back edge
        graph.add_edge(outer, exit);
        graph.add_edge(exit, graph.exit());

        let order = compute_block_order(&mut graph);
        assert_contiguous(&order, &[outer, inner, inner_body, outer_latch]);
        assert_contiguous(&order, &[inner, inner_body]);
        assert_eq!(graph.block(inner).containing_loop, Some(outer));
        assert_eq!(graph.block(inner_body).containing_loop, Some(inner));
        assert_eq!(graph.block(outer_latch).containing_loop, Some(outer));
        assert!(position(&order, outer) < position(&order, inner));
    }

    #[test]
    fn multi_latch_loop_collects_all_backedges() {
        let mut graph = Graph::new(0);
        let header = graph.new_loop_header();
        let split = graph.new_block();
        let latch_a = graph.new_block();
        let latch_b = graph.new_block();
        let exit = graph.new_block();
        graph.add_edge(graph.entry(), header);
        graph.add_edge(header, split);
        graph.add_edge(split, latch_a);
        graph.add_edge(split, latch_b);
        graph.add_edge(latch_a, header);
        graph.add_edge(latch_b, header);
        graph.add_edge(header, exit);
        graph.add_edge(exit, graph.exit());

        let order = compute_block_order(&mut graph);
        assert_contiguous(&order, &[header, split, latch_a, latch_b]);
        for member in [split, latch_a, latch_b] {
            assert_eq!(graph.block(member).containing_loop, Some(header));
        }
    }

    #[test]
    fn order_is_deterministic() {
        let build = || {
            let mut graph = Graph::new(0);
            let a = graph.new_block();
            let header = graph.new_loop_header();
            let body = graph.new_block();
            let exit = graph.new_block();
            graph.add_edge(graph.entry(), a);
            graph.add_edge(a, header);
            graph.add_edge(header, body);
            graph.add_edge(body, header);
            graph.add_edge(header, exit);
            graph.add_edge(exit, graph.exit());
            compute_block_order(&mut graph)
        };
        assert_eq!(build(), build());
    }
}
