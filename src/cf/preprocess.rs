//! Graph normalization ahead of PST construction.
//!
//! Three local guarantees, each fixed the same way (insert a fresh empty
//! block immediately before the offending block, redirect all *forward*
//! edges to it, leave backward edges untouched):
//!
//! (a) no block's label is targeted by both a forward and a backward branch;
//! (b) no backward-branch block's physical fallthrough successor is itself
//!     the target of another backward branch (back-to-back loop collision);
//! (c) the terminal block is not the far target of a forward branch without
//!     an intervening landing block.
//!
//! The pass is idempotent: a second run inserts zero blocks.

use crate::{Block, FlowGraph, Terminator};
use smallvec::SmallVec;
use tracing::debug;

/// Run the preprocessor, returning how many landing blocks were inserted.
pub fn preprocess(graph: &mut FlowGraph) -> usize {
    let blocks: Vec<Block> = graph.layout_order().collect();
    let mut inserted = 0;

    for &block in &blocks {
        if targeted_by_mixed_directions(graph, block) {
            debug!(?block, "preprocess: splitting label shared by forward and backward branches");
            insert_forward_landing(graph, block);
            inserted += 1;
        }
    }

    for &block in &blocks {
        if loop_collision_at(graph, block) {
            debug!(?block, "preprocess: separating back-to-back loops");
            insert_forward_landing(graph, block);
            inserted += 1;
        }
    }

    let terminal = blocks.last().copied();
    if let Some(terminal) = terminal
        && has_forward_branch_pred(graph, terminal)
    {
        debug!(?terminal, "preprocess: landing block ahead of terminal block");
        insert_forward_landing(graph, terminal);
        inserted += 1;
    }

    inserted
}

/// Whether the edge `p -> t` is materialized by a branch instruction in `p`
/// (as opposed to pure fallthrough, which consumes no label).
fn is_branch_edge(graph: &FlowGraph, p: Block, t: Block) -> bool {
    graph.branch_inst(p).is_some_and(|inst| match inst.kind {
        crate::InstKind::Branch(branch) => branch.target == t,
        _ => false,
    })
}

fn targeted_by_mixed_directions(graph: &FlowGraph, t: Block) -> bool {
    let mut fwd = false;
    let mut bwd = false;
    for &p in &graph[t].preds {
        if !is_branch_edge(graph, p, t) {
            continue;
        }
        if graph.is_backward(p, t) {
            bwd = true;
        } else {
            fwd = true;
        }
    }
    fwd && bwd
}

/// Back-to-back loop collision: `t`'s physical predecessor closes one loop
/// with a backward goto, while `t` itself is the head of another.
fn loop_collision_at(graph: &FlowGraph, t: Block) -> bool {
    let Some(prev) = graph[t].phys_pred else { return false };
    let prev_closes_loop = matches!(
        graph.terminator(prev),
        Terminator::CondGoto { backward: true } | Terminator::UncondGoto { backward: true }
    );
    prev_closes_loop
        && graph[t].preds.iter().any(|&p| is_branch_edge(graph, p, t) && graph.is_backward(p, t))
}

fn has_forward_branch_pred(graph: &FlowGraph, t: Block) -> bool {
    graph[t].preds.iter().any(|&p| is_branch_edge(graph, p, t) && !graph.is_backward(p, t))
}

/// The one fix all three guarantees share: a fresh empty block immediately
/// before `offending`, absorbing every forward edge into it.
fn insert_forward_landing(graph: &mut FlowGraph, offending: Block) -> Block {
    let landing = graph.insert_block_before(offending);
    let forward_preds: SmallVec<[Block; 4]> = graph
        .preds(offending)
        .into_iter()
        .filter(|&p| p != landing && !graph.is_backward(p, offending))
        .collect();
    for p in forward_preds {
        graph.retarget_edge(p, offending, landing);
    }
    graph.add_edge(landing, offending);
    landing
}
