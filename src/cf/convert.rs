//! PST conversion: the top-down pass that picks, per region, one of three
//! code-generation strategies and rewrites terminators in place.
//!
//! * **scalar-jump** — the branch is provably lane-uniform, so a plain
//!   `jmpi` suffices (no mask bookkeeping at all);
//! * **structured** — the hardware set (`if`/`else`/`endif`,
//!   `while`/`break`), available when construction kept the region's
//!   `allow_scf` and the configuration enables it;
//! * **goto-join** — the always-available fallback: a negated-predicate
//!   `goto` plus a `join` at the reconvergence block, with every JIP
//!   resolved lazily through the [`ActiveJoinQueue`] once the next pending
//!   join in program order is known.
//!
//! Backward-branch Leaves of a loop are converted before ordinary child
//! iteration reaches their physical position: the loop-closing instruction
//! must exist before any join strictly between loop head and tail can
//! receive a correct JIP.

use crate::cf::construct::Pst;
use crate::cf::pst::{ANode, ANodeShape, CodeGenKind, PstArena, RegionKind};
use crate::cf::{ScfConfig, UniformityOracle};
use crate::{
    Block, BranchInst, BranchOp, FlowGraph, FxIndexMap, FxIndexSet, Inst, InstKind, LayoutKey,
    Predicate, ScfInst, Terminator,
};
use smallvec::SmallVec;
use tracing::{debug, trace};

pub fn convert_pst<O: UniformityOracle + ?Sized>(
    graph: &mut FlowGraph,
    pst: &mut Pst,
    oracle: &O,
    config: ScfConfig,
) {
    let root = pst.root;
    let mut converter = Converter {
        graph,
        arena: &mut pst.arena,
        leaf_of: &pst.leaf_of,
        oracle,
        config,
        queue: ActiveJoinQueue::default(),
        converted: FxIndexSet::default(),
        loop_ctx: None,
    };
    converter.convert_node(root);
    converter.queue.flush_all(converter.graph);
}

/// Innermost enclosing loop, as seen by break-bearing descendants.
#[derive(Copy, Clone)]
struct LoopCtx {
    tail: Block,
    exit: Option<Block>,
    structured: bool,
}

struct Converter<'a, O: ?Sized> {
    graph: &'a mut FlowGraph,
    arena: &'a mut PstArena,
    leaf_of: &'a FxIndexMap<Block, ANode>,
    oracle: &'a O,
    config: ScfConfig,
    queue: ActiveJoinQueue,
    /// Blocks whose terminator has already been rewritten (loop tails are
    /// converted ahead of their physical position).
    converted: FxIndexSet<Block>,
    loop_ctx: Option<LoopCtx>,
}

impl<O: UniformityOracle + ?Sized> Converter<'_, O> {
    fn convert_node(&mut self, node: ANode) {
        if let Some(block) = self.arena.leaf_block(node) {
            self.convert_leaf(node, block);
            return;
        }
        match self.arena.region(node).unwrap() {
            RegionKind::Sequence | RegionKind::Composite => self.convert_children(node),
            RegionKind::IfThenEndif | RegionKind::IfThenElseEndif => self.convert_if(node),
            RegionKind::DoWhile => self.convert_do_while(node),
        }
    }

    fn convert_children(&mut self, node: ANode) {
        let children: SmallVec<[ANode; 8]> = self.arena.children(node).iter().copied().collect();
        for child in children {
            self.convert_node(child);
        }
    }

    fn convert_leaf(&mut self, node: ANode, block: Block) {
        if self.converted.contains(&block) {
            return;
        }
        match self.graph.terminator(block) {
            Terminator::CondGoto { backward: false } | Terminator::UncondGoto { backward: false } => {
                match self.loop_ctx {
                    Some(ctx) if self.arena.has_break(node) && ctx.structured => {
                        self.emit_break(node, block, ctx);
                    }
                    _ => self.convert_forward_goto(node, block),
                }
            }
            Terminator::CondGoto { backward: true } | Terminator::UncondGoto { backward: true } => {
                self.convert_backward_goto(node, block);
            }
            Terminator::None
            | Terminator::Jmpi
            | Terminator::Call
            | Terminator::Return
            | Terminator::Scf => {}
        }
        self.converted.insert(block);
        let cursor = self.graph.order(block);
        self.queue.resolve_ready(self.graph, cursor);
    }

    fn emit_break(&mut self, node: ANode, block: Block, ctx: LoopCtx) {
        let inst = self.graph.branch_inst(block).unwrap().clone();
        let uip = ctx.exit.expect("structurizer: break out of a loop with no exit");
        let brk = inst.retaining_fidelity(ScfInst::Break { jip: ctx.tail, uip });
        self.graph.set_terminator(block, brk);
        self.arena[node].kind = CodeGenKind::Structured;
        trace!(?block, "break");
    }

    fn convert_forward_goto(&mut self, node: ANode, block: Block) {
        let inst = self.graph.branch_inst(block).unwrap().clone();
        let InstKind::Branch(br) = inst.kind else { unreachable!() };

        if self.config.enable_scalar_jump && self.oracle.is_uniform(self.graph, block) {
            self.graph.set_terminator(block, inst.retaining_fidelity(BranchInst::jmpi(br.target)));
            self.arena[node].kind = CodeGenKind::ScalarJump;
            trace!(?block, "scalar jump");
            return;
        }

        // The fallback: lanes passing the (negated) predicate fall through,
        // the rest jump and wait for reconvergence at the target's join.
        let mut goto = inst.retaining_fidelity(BranchInst {
            op: BranchOp::Goto,
            target: br.target,
            jip: Some(br.target),
        });
        goto.pred = inst.pred.map(Predicate::inverted);
        self.graph.set_terminator(block, goto);
        self.queue.register_join(self.graph, br.target);
        self.queue.note_goto(self.graph, block);
        self.mark_label_used(br.target);
        self.arena[node].kind = CodeGenKind::GotoJoin;
    }

    /// Backward gotos reach this only in degraded regions (`Composite`
    /// shapes, loops that could not keep their `while` form).
    fn convert_backward_goto(&mut self, node: ANode, block: Block) {
        let inst = self.graph.branch_inst(block).unwrap().clone();
        let InstKind::Branch(br) = inst.kind else { unreachable!() };

        if self.config.enable_scalar_jump && self.oracle.is_uniform(self.graph, block) {
            self.graph.set_terminator(block, inst.retaining_fidelity(BranchInst::jmpi(br.target)));
            self.arena[node].kind = CodeGenKind::ScalarJump;
            return;
        }

        let mut goto = inst.retaining_fidelity(BranchInst {
            op: BranchOp::Goto,
            target: br.target,
            jip: Some(br.target),
        });
        goto.pred = inst.pred.map(Predicate::inverted);
        self.graph.set_terminator(block, goto);
        // Lanes falling out of the loop reconverge right after it.
        if let Some(after) = self.graph[block].phys_succ {
            self.queue.register_join(self.graph, after);
            self.mark_label_used(after);
        }
        self.queue.note_goto(self.graph, block);
        self.arena[node].kind = CodeGenKind::GotoJoin;
    }

    fn convert_if(&mut self, node: ANode) {
        let children: SmallVec<[ANode; 4]> = self.arena.children(node).iter().copied().collect();
        let entry = children[0];
        let entry_block =
            self.arena.leaf_block(entry).expect("structurizer: if-region with non-leaf entry");
        let exit = self.arena[node].exit.expect("structurizer: if-region without an exit");
        let inst = self.graph.branch_inst(entry_block).unwrap().clone();

        // scalar-jump: uniform branch, and no join required strictly inside
        // the region (a join would need the mask the jump never saves).
        if self.config.enable_scalar_jump
            && self.oracle.is_uniform(self.graph, entry_block)
            && !self.interior_join_required(node)
        {
            let InstKind::Branch(br) = inst.kind else { unreachable!() };
            self.graph.set_terminator(entry_block, inst.retaining_fidelity(BranchInst::jmpi(br.target)));
            self.converted.insert(entry_block);
            self.arena[node].kind = CodeGenKind::ScalarJump;
            debug!(?node, "if-region as scalar jump");
            for &c in &children[1..] {
                self.convert_node(c);
            }
            return;
        }

        // A break-bearing if can only stay structured under a structured loop.
        let structured = self.config.enable_scf
            && self.arena.allow_scf(node)
            && (!self.arena.contains_break(node)
                || self.loop_ctx.is_some_and(|ctx| ctx.structured));
        if !structured {
            self.arena[node].kind = CodeGenKind::GotoJoin;
            self.convert_children(node);
            return;
        }

        self.arena[node].kind = CodeGenKind::Structured;
        match self.arena.region(node).unwrap() {
            RegionKind::IfThenEndif => {
                let mut if_inst = inst.retaining_fidelity(ScfInst::If { jip: exit, uip: exit });
                if_inst.pred = inst.pred.map(Predicate::inverted);
                self.graph.set_terminator(entry_block, if_inst);
                self.converted.insert(entry_block);
                self.place_endif(exit, &inst);
            }
            RegionKind::IfThenElseEndif => {
                // The entry branch names the else-part's head; everything
                // between is the then-part.
                let InstKind::Branch(br) = inst.kind else { unreachable!() };
                let else_begin = br.target;
                let else_at = children
                    .iter()
                    .position(|&c| self.arena[c].begin == else_begin)
                    .expect("structurizer: if/else lost its else-part");
                let mut if_inst =
                    inst.retaining_fidelity(ScfInst::If { jip: else_begin, uip: else_begin });
                if_inst.pred = inst.pred.map(Predicate::inverted);
                self.graph.set_terminator(entry_block, if_inst);
                self.converted.insert(entry_block);

                // The then-part's jump over the else becomes the `else`.
                let then_end = self.arena[children[else_at - 1]].end;
                let then_inst = self.graph.branch_inst(then_end).unwrap().clone();
                self.graph
                    .set_terminator(then_end, then_inst.retaining_fidelity(ScfInst::Else {
                        jip: exit,
                        uip: exit,
                    }));
                self.converted.insert(then_end);
                self.place_endif(exit, &inst);
            }
            RegionKind::DoWhile | RegionKind::Composite | RegionKind::Sequence => unreachable!(),
        }
        debug!(?node, ?entry_block, ?exit, "if-region structured");
        for &c in &children[1..] {
            self.convert_node(c);
        }
    }

    fn convert_do_while(&mut self, node: ANode) {
        let head = self.arena[node].begin;
        let tail = self.arena[node].end;
        let exit = self.arena[node].exit;

        // The loop-closing branch must be a direct Leaf child (Sequences are
        // transparent); a backedge buried deeper has no `while` placement.
        let tail_inst = self.graph.branch_inst(tail).cloned();
        let tail_ok = tail_inst
            .as_ref()
            .is_some_and(|i| matches!(i.kind, InstKind::Branch(br) if br.target == head))
            && self.tail_leaf_is_direct(node, tail);

        let has_break = self.arena.contains_break(node);
        let uniform = self.config.enable_scalar_jump && self.oracle.is_uniform(self.graph, tail);

        let kind = if !tail_ok {
            CodeGenKind::GotoJoin
        } else if uniform && !has_break {
            // No break forces structured CF, so the uniform backedge can be
            // a plain (predicated) scalar jump.
            CodeGenKind::ScalarJump
        } else if self.config.enable_scf && self.arena.allow_scf(node) {
            CodeGenKind::Structured
        } else {
            CodeGenKind::GotoJoin
        };
        self.arena[node].kind = kind;
        debug!(?node, ?head, ?tail, ?kind, "do-while");

        // Convert the loop-closing instruction first: joins strictly between
        // head and tail need it in place to chain correctly.
        if tail_ok {
            let inst = tail_inst.unwrap();
            match kind {
                CodeGenKind::ScalarJump => {
                    self.graph.set_terminator(tail, inst.retaining_fidelity(BranchInst::jmpi(head)));
                }
                CodeGenKind::Structured => {
                    self.graph
                        .set_terminator(tail, inst.retaining_fidelity(ScfInst::While {
                            jip: head,
                            uip: head,
                        }));
                }
                CodeGenKind::GotoJoin => {
                    let mut goto = inst.retaining_fidelity(BranchInst {
                        op: BranchOp::Goto,
                        target: head,
                        jip: Some(head),
                    });
                    goto.pred = inst.pred.map(Predicate::inverted);
                    self.graph.set_terminator(tail, goto);
                    if let Some(exit) = exit {
                        self.queue.register_join(self.graph, exit);
                        self.mark_label_used(exit);
                    }
                    self.queue.note_goto(self.graph, tail);
                }
                CodeGenKind::Undetermined => unreachable!(),
            }
            self.converted.insert(tail);
        }

        let saved = self.loop_ctx.replace(LoopCtx {
            tail,
            exit,
            structured: kind == CodeGenKind::Structured,
        });
        self.convert_children(node);
        self.loop_ctx = saved;

        // Interior reconvergence must not chain past the loop-closing
        // instruction; whatever is still pending inside resolves now.
        let head_key = self.graph.order(head);
        let tail_key = self.graph.order(tail);
        self.queue.flush_scope(self.graph, head_key, tail_key);
    }

    fn tail_leaf_is_direct(&self, loop_node: ANode, tail: Block) -> bool {
        let Some(&leaf) = self.leaf_of.get(&tail) else { return false };
        let mut n = leaf;
        loop {
            let Some(parent) = self.arena[n].parent else { return false };
            if parent == loop_node {
                return true;
            }
            if self.arena.region(parent) != Some(RegionKind::Sequence) {
                return false;
            }
            n = parent;
        }
    }

    /// Whether converting this region needs a reconvergence point strictly
    /// inside it: either a pending join already sits there, or some interior
    /// branch will diverge when its turn comes.
    fn interior_join_required(&self, node: ANode) -> bool {
        let begin = self.arena[node].begin;
        let lo = self.graph.order(begin);
        let hi = match self.arena[node].exit {
            Some(exit) => self.graph.order(exit),
            None => LayoutKey(u32::MAX, u32::MAX),
        };
        if self.queue.any_join_inside(self.graph, lo, hi) {
            return true;
        }

        let mut stack = vec![node];
        while let Some(n) = stack.pop() {
            stack.extend(self.arena.children(n).iter().copied());
            let Some(block) = self.arena.leaf_block(n) else { continue };
            if block == begin || self.converted.contains(&block) {
                continue;
            }
            let diverging = matches!(
                self.graph.terminator(block),
                Terminator::CondGoto { .. } | Terminator::UncondGoto { .. }
            ) && !(self.config.enable_scalar_jump
                && self.oracle.is_uniform(self.graph, block));
            if diverging {
                return true;
            }
        }
        false
    }

    fn place_endif(&mut self, exit: Block, fidelity: &Inst) {
        let mut endif = fidelity.retaining_fidelity(ScfInst::EndIf { jip: exit });
        endif.pred = None;
        self.graph.push_inst_front(exit, endif);
        self.mark_label_used(exit);
    }

    fn mark_label_used(&mut self, block: Block) {
        if let Some(&leaf) = self.leaf_of.get(&block)
            && let ANodeShape::Leaf { label_used, .. } = &mut self.arena[leaf].shape
        {
            *label_used = true;
        }
    }
}

/// Pending reconvergence points awaiting a JIP, kept in layout order.
///
/// A `join`'s JIP (and a fallback `goto`'s) must name the *next* join in
/// program order, which generally is not known at emission time; entries
/// therefore resolve lazily, either as soon as no later registration can
/// precede their answer ([`resolve_ready`](Self::resolve_ready)) or at scope
/// end, where leftovers take their own block (no further reconvergence point
/// exists).
#[derive(Default)]
struct ActiveJoinQueue {
    /// Blocks carrying a `join` instruction, in layout order.
    joins: Vec<Block>,
    consumers: Vec<Consumer>,
}

#[derive(Copy, Clone)]
struct Consumer {
    after: LayoutKey,
    site: Site,
}

#[derive(Copy, Clone)]
enum Site {
    /// A fallback `goto`'s `jip` field.
    Goto(Block),
    /// The `join` instruction at this block.
    JoinInst(Block),
}

impl ActiveJoinQueue {
    /// Ensure a `join` instruction exists at `block`, registering its JIP as
    /// pending. Idempotent per block.
    fn register_join(&mut self, graph: &mut FlowGraph, block: Block) {
        let key = graph.order(block);
        match self.joins.binary_search_by_key(&key, |&b| graph.order(b)) {
            Ok(_) => {}
            Err(at) => {
                self.joins.insert(at, block);
                graph.push_inst_front(block, Inst::new(ScfInst::Join { jip: block }));
                self.consumers.push(Consumer { after: key, site: Site::JoinInst(block) });
                trace!(?block, "join registered");
            }
        }
    }

    fn note_goto(&mut self, graph: &FlowGraph, block: Block) {
        self.consumers.push(Consumer { after: graph.order(block), site: Site::Goto(block) });
    }

    fn any_join_inside(&self, graph: &FlowGraph, lo: LayoutKey, hi: LayoutKey) -> bool {
        self.joins.iter().any(|&j| {
            let k = graph.order(j);
            lo < k && k < hi
        })
    }

    fn first_join_after(
        &self,
        graph: &FlowGraph,
        after: LayoutKey,
        limit: Option<LayoutKey>,
    ) -> Option<Block> {
        self.joins.iter().copied().find(|&j| {
            let k = graph.order(j);
            k > after && limit.is_none_or(|l| k <= l)
        })
    }

    /// Resolve every consumer whose answer can no longer change: conversion
    /// has passed `cursor`, and future joins only register beyond it.
    fn resolve_ready(&mut self, graph: &mut FlowGraph, cursor: LayoutKey) {
        let mut pending = std::mem::take(&mut self.consumers);
        pending.retain(|c| match self.first_join_after(graph, c.after, None) {
            Some(j) if graph.order(j) <= cursor => {
                assign(graph, c.site, Some(j));
                false
            }
            _ => true,
        });
        self.consumers = pending;
    }

    /// Resolve everything pending inside `[lo, hi)` against joins up to and
    /// including `hi` (used when leaving a loop: interior chains must not
    /// cross the loop-closing instruction).
    fn flush_scope(&mut self, graph: &mut FlowGraph, lo: LayoutKey, hi: LayoutKey) {
        let mut pending = std::mem::take(&mut self.consumers);
        pending.retain(|c| {
            if c.after >= lo && c.after < hi {
                let j = self.first_join_after(graph, c.after, Some(hi));
                assign(graph, c.site, j);
                false
            } else {
                true
            }
        });
        self.consumers = pending;
    }

    fn flush_all(&mut self, graph: &mut FlowGraph) {
        for c in std::mem::take(&mut self.consumers) {
            let j = self.first_join_after(graph, c.after, None);
            assign(graph, c.site, j);
        }
    }
}

fn assign(graph: &mut FlowGraph, site: Site, next_join: Option<Block>) {
    match site {
        Site::JoinInst(block) => {
            // A trailing join with nothing to chain to targets itself.
            let jip = next_join.unwrap_or(block);
            for inst in &mut graph[block].insts {
                if let InstKind::Scf(ScfInst::Join { jip: j }) = &mut inst.kind {
                    *j = jip;
                    return;
                }
            }
            unreachable!("structurizer: missing join instruction at {block:?}");
        }
        Site::Goto(block) => {
            // Without a later join the goto keeps its target as JIP.
            let Some(jip) = next_join else { return };
            if let Some(inst) = graph[block].insts.last_mut()
                && let InstKind::Branch(br) = &mut inst.kind
            {
                br.jip = Some(jip);
                return;
            }
            unreachable!("structurizer: goto vanished from {block:?}");
        }
    }
}
