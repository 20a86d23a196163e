//! PST construction: a single left-to-right scan over blocks in layout
//! order, maintaining a construction stack of open hammocks and the set of
//! currently-crossing control-graph edges.
//!
//! Per block: (1) stack entries merge when a crossing edge begins or ends
//! outside the innermost open node; (2) edges starting at the block open new
//! hammocks (loops before conditionals, plain jumps only extend); (3) the
//! block joins the top-of-stack as a Leaf, folding straight chains into
//! `Sequence`s; (4) nodes whose end is reached are classified, condensed
//! into the ACFG, deduplicated against siblings sharing their exit label,
//! and closure cascades outward.

use crate::cf::pst::{ANode, ANodeShape, PstArena, RegionKind};
use crate::{Block, FlowGraph, FxIndexMap, InstKind, LayoutKey, Terminator};
use smallvec::SmallVec;
use tracing::{debug, trace};

/// One discovered `goto`, alive from the scan of its layout-earlier endpoint
/// until the scan of its layout-later one.
#[derive(Copy, Clone, Debug)]
struct ControlGraphEdge {
    source: Block,
    target: Block,
    backward: bool,
    /// Every backward goto whose target is its layout-earlier endpoint is
    /// treated as a genuine loop candidate.
    loop_candidate: bool,
}

impl ControlGraphEdge {
    /// The layout-earlier endpoint, where the scan first learns of the edge.
    fn begin(&self) -> Block {
        if self.backward { self.target } else { self.source }
    }
}

/// When an open hammock is complete.
#[derive(Copy, Clone, Debug)]
enum Close {
    /// Loop hammock: closes once the given backedge-source block is scanned.
    Backedge(Block),
    /// Forward hammock: closes once the scan is about to enter this exit.
    Exit(Block),
}

/// Last-interior-block bound of a [`Close`], for overlap comparisons
/// (`Backedge` bounds are inclusive of their block, `Exit` bounds exclusive).
fn close_bound(graph: &FlowGraph, close: Close) -> (LayoutKey, u8) {
    match close {
        Close::Backedge(d) => (graph.order(d), 1),
        Close::Exit(x) => (graph.order(x), 0),
    }
}

fn farther_close(graph: &FlowGraph, a: Close, b: Close) -> Close {
    if close_bound(graph, a) >= close_bound(graph, b) { a } else { b }
}

struct OpenHammock {
    node: ANode,
    close: Close,
}

/// Everything `constructPST` produces: the arena, the (virtual) root, and
/// the block-to-Leaf map the converter navigates by.
pub struct Pst {
    pub arena: PstArena,
    pub root: ANode,
    pub leaf_of: FxIndexMap<Block, ANode>,
}

pub fn construct_pst(graph: &mut FlowGraph) -> Pst {
    let mut builder = PstBuilder {
        graph,
        pst: PstArena::new(),
        leaf_of: FxIndexMap::default(),
        stack: Vec::new(),
        open_edges: Vec::new(),
        edges_by_begin: FxIndexMap::default(),
        toplevel: Vec::new(),
        exit_claims: FxIndexMap::default(),
    };
    builder.prescan_edges();

    let mut cursor = if builder.graph.is_empty() { None } else { Some(builder.graph.entry()) };
    while let Some(block) = cursor {
        builder.scan_block(block);
        cursor = builder.graph[block].phys_succ;
    }

    assert!(
        builder.stack.is_empty(),
        "structurizer: construction stack not empty at end of scan",
    );
    assert!(
        builder.open_edges.is_empty(),
        "structurizer: unclosed control-graph edge at end of scan",
    );

    let root = builder.finish_root();
    builder.pst.assert_invariants(builder.graph);
    Pst { arena: builder.pst, root, leaf_of: builder.leaf_of }
}

struct PstBuilder<'a> {
    graph: &'a mut FlowGraph,
    pst: PstArena,
    leaf_of: FxIndexMap<Block, ANode>,

    /// Nesting of open hammocks; LIFO, backed by an index vector since nodes
    /// may be merged mid-scan.
    stack: Vec<OpenHammock>,
    open_edges: Vec<ControlGraphEdge>,
    edges_by_begin: FxIndexMap<Block, SmallVec<[ControlGraphEdge; 2]>>,

    /// Finalized nodes not (yet) enclosed by anything, in layout order.
    toplevel: Vec<ANode>,

    /// Exit block -> hammocks that finalized with it, for landing-block
    /// deduplication (no two sibling regions may share one join label).
    exit_claims: FxIndexMap<Block, SmallVec<[ANode; 2]>>,
}

impl PstBuilder<'_> {
    fn prescan_edges(&mut self) {
        let blocks: Vec<Block> = self.graph.layout_order().collect();
        for source in blocks {
            let Some(inst) = self.graph.branch_inst(source) else { continue };
            let InstKind::Branch(branch) = inst.kind else { continue };
            let backward = self.graph.is_backward(source, branch.target);
            let edge = ControlGraphEdge {
                source,
                target: branch.target,
                backward,
                loop_candidate: backward,
            };
            self.edges_by_begin.entry(edge.begin()).or_default().push(edge);
        }
    }

    fn scan_block(&mut self, block: Block) {
        trace!(?block, depth = self.stack.len(), "scan");
        self.merge_for_incoming_edges(block);
        self.open_edges.retain(|e| !(!e.backward && e.target == block));
        self.start_edges_at(block);
        self.append_block_leaf(block);
        self.close_finished(block);
        self.open_edges.retain(|e| !(e.backward && e.source == block));
    }

    /// Step 1: a forward edge ending here that began outside the innermost
    /// open node means that node cannot be a hammock on its own; collapse
    /// stack entries (innermost first) until the edge's begin is covered.
    fn merge_for_incoming_edges(&mut self, block: Block) {
        let incoming: SmallVec<[Block; 4]> = self
            .open_edges
            .iter()
            .filter(|e| !e.backward && e.target == block)
            .map(|e| e.source)
            .collect();
        for source in incoming {
            loop {
                let Some(top) = self.stack.last() else { break };
                if self.graph.order(self.pst[top.node].begin) <= self.graph.order(source) {
                    break;
                }
                if self.stack.len() >= 2 {
                    self.merge_top_into_below();
                } else {
                    self.pull_toplevel_into_bottom(source);
                }
            }
        }
    }

    fn merge_top_into_below(&mut self) {
        let inner = self.stack.pop().expect("structurizer: merge with empty stack");
        let outer = self.stack.last_mut().expect("structurizer: merge with no outer entry");
        debug!(inner = ?inner.node, outer = ?outer.node, "merging open hammocks");

        let inner_children = match &mut self.pst[inner.node].shape {
            ANodeShape::Hammock { children, .. } => std::mem::take(children),
            ANodeShape::Leaf { .. } => unreachable!("structurizer: leaf on construction stack"),
        };
        let outer_node = outer.node;
        outer.close = farther_close(self.graph, outer.close, inner.close);

        for &child in &inner_children {
            self.pst[child].parent = Some(outer_node);
        }
        let inner_end = self.pst[inner.node].end;
        match &mut self.pst[outer_node].shape {
            ANodeShape::Hammock { children, .. } => children.extend(inner_children),
            ANodeShape::Leaf { .. } => unreachable!("structurizer: leaf on construction stack"),
        }
        if self.graph.order(inner_end) > self.graph.order(self.pst[outer_node].end) {
            self.pst[outer_node].end = inner_end;
        }
        // The abandoned hammock stays in the arena as an absorbed husk, so
        // `top()` lookups through it keep resolving.
        self.pst[inner.node].absorbed = true;
        self.pst[inner.node].parent = Some(outer_node);
    }

    /// The outermost open node is pierced from toplevel: already-finalized
    /// siblings back to (and including) the one covering `source` become its
    /// leading children.
    fn pull_toplevel_into_bottom(&mut self, source: Block) {
        let bottom = self.stack[0].node;
        let mut pulled: SmallVec<[ANode; 4]> = SmallVec::new();
        loop {
            let last = self
                .toplevel
                .pop()
                .expect("structurizer: crossing edge from before all scanned structure");
            let covers = self.graph.order(self.pst[last].begin) <= self.graph.order(source);
            pulled.push(last);
            if covers {
                break;
            }
        }
        pulled.reverse();
        debug!(?pulled, into = ?bottom, "pulling toplevel siblings into open hammock");

        for &n in &pulled {
            self.pst[n].parent = Some(bottom);
        }
        self.pst[bottom].begin = self.pst[pulled[0]].begin;
        match &mut self.pst[bottom].shape {
            ANodeShape::Hammock { children, .. } => {
                children.splice(0..0, pulled);
            }
            ANodeShape::Leaf { .. } => unreachable!("structurizer: leaf on construction stack"),
        }
    }

    /// Step 2: edges starting at this block, in priority order.
    fn start_edges_at(&mut self, block: Block) {
        let Some(starting) = self.edges_by_begin.swap_remove(&block) else { return };
        self.open_edges.extend(starting.iter().copied());

        // Innermost backward edge that is a genuine loop candidate: this
        // block is a loop head. Multiple backedges to one head extend a
        // single hammock out to the farthest source.
        let close_at = starting
            .iter()
            .filter(|e| e.backward && e.loop_candidate)
            .map(|e| e.source)
            .max_by_key(|&s| self.graph.order(s));
        if let Some(close_at) = close_at {
            self.begin_loop(block, close_at);
        }

        for edge in starting.iter().filter(|e| !e.backward) {
            // An edge to an enclosing open loop's exit is a break: it leaves
            // through the loop's structured exit and neither widens nor
            // opens a region (break reconstruction picks it up later).
            let breaks_out_of_loop = self.stack.iter().any(|en| match en.close {
                Close::Backedge(d) => self.graph[d].phys_succ == Some(edge.target),
                Close::Exit(_) => false,
            });
            if breaks_out_of_loop {
                continue;
            }
            let conditional = self
                .graph
                .branch_inst(edge.source)
                .is_some_and(|inst| inst.pred.is_some());
            self.extend_open_entries(edge.target);
            if conditional || self.stack.is_empty() {
                // A plain jump gets no new nesting level inside an open node,
                // but with nothing open it has to anchor a region itself.
                let node = self.pst.new_hammock(block, block, None);
                self.stack.push(OpenHammock { node, close: Close::Exit(edge.target) });
            }
        }
    }

    fn begin_loop(&mut self, head: Block, close_at: Block) {
        let needed = close_bound(self.graph, Close::Backedge(close_at));
        // Overlapping extents (a loop reaching past an open region's close,
        // or two loops sharing blocks without nesting) collapse into one
        // region instead of pretending to nest.
        while self.stack.len() >= 2
            && close_bound(self.graph, self.stack.last().unwrap().close) < needed
        {
            self.merge_top_into_below();
        }
        if let Some(top) = self.stack.last_mut()
            && close_bound(self.graph, top.close) < needed
        {
            trace!(?head, "loop overlaps open region; extending instead of nesting");
            top.close = Close::Backedge(close_at);
            return;
        }
        let node = self.pst.new_hammock(head, head, None);
        self.stack.push(OpenHammock { node, close: Close::Backedge(close_at) });
    }

    /// An edge to `target` forces every open entry that would close earlier
    /// to stay open through `target` (break edges never get here).
    fn extend_open_entries(&mut self, target: Block) {
        let graph = &*self.graph;
        let needed = close_bound(graph, Close::Exit(target));
        for entry in &mut self.stack {
            if close_bound(graph, entry.close) < needed {
                entry.close = farther_close(graph, entry.close, Close::Exit(target));
            }
        }
    }

    /// Step 3: the block joins the PST as a Leaf of the innermost open node
    /// (or toplevel), then straight chains fold flat.
    fn append_block_leaf(&mut self, block: Block) {
        let leaf = self.pst.new_leaf(self.graph, block);
        self.leaf_of.insert(block, leaf);

        for p in self.graph.preds(block) {
            if let Some(&pl) = self.leaf_of.get(&p) {
                let pn = self.pst.top(pl);
                self.pst.add_edge(pn, leaf);
            }
        }
        for s in self.graph.succs(block) {
            if s == block {
                continue; // self-loop edge already added via preds
            }
            if let Some(&sl) = self.leaf_of.get(&s) {
                let sn = self.pst.top(sl);
                self.pst.add_edge(leaf, sn);
            }
        }

        self.attach(leaf);
    }

    fn attach(&mut self, node: ANode) {
        match self.stack.last() {
            Some(top) => {
                let parent = top.node;
                self.pst[node].parent = Some(parent);
                let end = self.pst[node].end;
                if self.graph.order(end) > self.graph.order(self.pst[parent].end) {
                    self.pst[parent].end = end;
                }
                match &mut self.pst[parent].shape {
                    ANodeShape::Hammock { children, .. } => children.push(node),
                    ANodeShape::Leaf { .. } => {
                        unreachable!("structurizer: leaf on construction stack")
                    }
                }
            }
            None => self.toplevel.push(node),
        }
        self.try_fold_with_prev(node);
    }

    /// Fold `node` onto its immediately preceding sibling when the two form
    /// a straight, unbranched chain, producing/extending a `Sequence`.
    fn try_fold_with_prev(&mut self, node: ANode) {
        let siblings: &[ANode] = match self.stack.last() {
            Some(top) => self.pst.children(top.node),
            None => &self.toplevel,
        };
        let len = siblings.len();
        if len < 2 || siblings[len - 1] != node {
            return;
        }
        let prev = siblings[len - 2];

        // "Straight, unbranched": neither end block branches (a guard or a
        // break must stay a visible sibling), and the two are joined by a
        // single fallthrough link.
        let prev_end = self.pst[prev].end;
        let node_end = self.pst[node].end;
        if !matches!(self.graph.terminator(prev_end), Terminator::None)
            || !matches!(self.graph.terminator(node_end), Terminator::None)
        {
            return;
        }
        let begin = self.pst[node].begin;
        if self.graph[begin].preds.as_slice() != [prev_end]
            || self.graph[prev_end].succs.as_slice() != [begin]
        {
            return;
        }

        let node_exit = self.pst[node].exit;
        if self.pst.region(prev) == Some(RegionKind::Sequence) {
            // Extend the existing chain.
            self.remove_last_sibling();
            self.pst.absorb_into(prev, node);
            match &mut self.pst[prev].shape {
                ANodeShape::Hammock { children, .. } => children.push(node),
                ANodeShape::Leaf { .. } => unreachable!(),
            }
            self.pst[prev].end = node_end;
            self.pst[prev].exit = node_exit;
        } else {
            let begin = self.pst[prev].begin;
            let seq = self.pst.new_hammock(begin, node_end, node_exit);
            self.pst.set_region(seq, RegionKind::Sequence);
            self.remove_last_sibling();
            self.replace_last_sibling(seq);
            self.pst[prev].parent = Some(seq);
            self.pst[node].parent = Some(seq);
            match &mut self.pst[seq].shape {
                ANodeShape::Hammock { children, .. } => children.extend([prev, node]),
                ANodeShape::Leaf { .. } => unreachable!(),
            }
            self.pst.condense(seq);
            if let Some(top) = self.stack.last() {
                self.pst[seq].parent = Some(top.node);
            }
        }
    }

    fn remove_last_sibling(&mut self) {
        match self.stack.last() {
            Some(top) => match &mut self.pst[top.node].shape {
                ANodeShape::Hammock { children, .. } => {
                    children.pop();
                }
                ANodeShape::Leaf { .. } => unreachable!(),
            },
            None => {
                self.toplevel.pop();
            }
        }
    }

    fn replace_last_sibling(&mut self, with: ANode) {
        match self.stack.last() {
            Some(top) => match &mut self.pst[top.node].shape {
                ANodeShape::Hammock { children, .. } => {
                    *children.last_mut().unwrap() = with;
                }
                ANodeShape::Leaf { .. } => unreachable!(),
            },
            None => *self.toplevel.last_mut().unwrap() = with,
        }
    }

    /// Step 4: cascade closure of every open hammock completed by this block.
    fn close_finished(&mut self, block: Block) {
        loop {
            let Some(top) = self.stack.last() else { return };
            let closes = match top.close {
                Close::Backedge(d) => block == d,
                Close::Exit(x) => self.graph[block].phys_succ == Some(x),
            };
            if !closes {
                return;
            }

            // A still-open forward edge escaping the would-be region to some
            // other target means this is not single-exit after all (only
            // break edges can get here, everything else extended the close).
            // The node dissolves and its children spill into the parent, so
            // break reconstruction later sees them as loop children.
            let expected_exit = match top.close {
                Close::Backedge(d) => self.graph[d].phys_succ,
                Close::Exit(x) => Some(x),
            };
            let begin_key = self.graph.order(self.pst[top.node].begin);
            let end_key = self.graph.order(block);
            let second_exit = self.open_edges.iter().any(|e| {
                !e.backward
                    && self.graph.order(e.source) >= begin_key
                    && self.graph.order(e.source) <= end_key
                    && Some(e.target) != expected_exit
            });
            if second_exit && matches!(top.close, Close::Exit(_)) {
                self.dissolve_top();
                continue;
            }

            let entry = self.stack.pop().unwrap();
            self.finalize(entry, block);
        }
    }

    /// Abandon the top open node without materializing it: its children are
    /// handed, in order, to the next enclosing container.
    fn dissolve_top(&mut self) {
        let entry = self.stack.pop().expect("structurizer: dissolve with empty stack");
        debug!(node = ?entry.node, "dissolving non-single-exit region");
        let children = match &mut self.pst[entry.node].shape {
            ANodeShape::Hammock { children, .. } => std::mem::take(children),
            ANodeShape::Leaf { .. } => unreachable!("structurizer: leaf on construction stack"),
        };
        match self.stack.last() {
            Some(top) => {
                let parent = top.node;
                for &child in &children {
                    self.pst[child].parent = Some(parent);
                    let end = self.pst[child].end;
                    if self.graph.order(end) > self.graph.order(self.pst[parent].end) {
                        self.pst[parent].end = end;
                    }
                }
                match &mut self.pst[parent].shape {
                    ANodeShape::Hammock { children: dst, .. } => dst.extend(children),
                    ANodeShape::Leaf { .. } => unreachable!(),
                }
            }
            None => {
                for &child in &children {
                    self.pst[child].parent = None;
                }
                self.toplevel.extend(children);
            }
        }
        self.pst[entry.node].absorbed = true;
    }

    fn finalize(&mut self, entry: OpenHammock, block: Block) {
        let node = entry.node;
        let exit = match entry.close {
            Close::Backedge(_) => self.graph[block].phys_succ,
            Close::Exit(x) => {
                debug_assert_eq!(self.graph[block].phys_succ, Some(x));
                Some(x)
            }
        };
        self.pst[node].exit = exit;
        self.pst[node].end = block;

        let region = self.classify(node);
        self.pst.set_region(node, region);
        debug!(?node, ?region, "hammock finalized");

        if region == RegionKind::DoWhile {
            self.reconstruct_breaks(node);
        }

        self.pst.condense(node);
        if let Some(exit) = exit {
            self.claim_exit(node, exit);
        }
        self.attach(node);
    }

    /// Region classification over the finalized children: loop-closure test
    /// first, then the two if shapes, everything else `Composite`.
    fn classify(&self, node: ANode) -> RegionKind {
        let children = self.pst.children(node);
        let entry = children[0];

        // Loop-closure test: the end block branches back to the entry. This
        // is checked on the block graph because sequence folding may have
        // condensed the backedge inside a child.
        let (begin, end) = (self.pst[node].begin, self.pst[node].end);
        if self.graph[end].succs.contains(&begin) {
            return RegionKind::DoWhile;
        }

        let Some(exit) = self.pst[node].exit else { return RegionKind::Composite };
        let entry_branch = self.pst.leaf_block(entry).and_then(|eb| {
            let inst = self.graph.branch_inst(eb)?;
            let InstKind::Branch(br) = inst.kind else { return None };
            (inst.pred.is_some() && !self.graph.is_backward(eb, br.target))
                .then_some(br.target)
        });
        let Some(cond_target) = entry_branch else { return RegionKind::Composite };

        // Two successors converging directly into the shared exit. The
        // malformed both-successors-identical case fails `cond_target ==
        // exit` and lands in `Composite` below, deliberately.
        if cond_target == exit && self.chains_into(&children[1..], exit) {
            return RegionKind::IfThenEndif;
        }

        // The two successors converge into each other (the then-part jumps
        // over the else-part to the exit) and then into the exit.
        if let Some(k) = children.iter().position(|&c| self.pst[c].begin == cond_target)
            && k >= 2
            && self.chain_jumps_to(&children[1..k], exit)
            && self.chains_into(&children[k..], exit)
        {
            return RegionKind::IfThenElseEndif;
        }

        RegionKind::Composite
    }

    /// `chain` is a linear run (each member falling through to the next)
    /// that converges into `to` by fallthrough.
    fn chains_into(&self, chain: &[ANode], to: Block) -> bool {
        if !self.chain_is_straight(chain) {
            return false;
        }
        let last = self.pst[*chain.last().unwrap()].end;
        matches!(self.graph.terminator(last), Terminator::None)
            && self.graph[last].succs.as_slice() == [to]
    }

    /// `chain` is a linear run ending in an unconditional jump to `to`.
    fn chain_jumps_to(&self, chain: &[ANode], to: Block) -> bool {
        if !self.chain_is_straight(chain) {
            return false;
        }
        let last = self.pst[*chain.last().unwrap()].end;
        self.branch_target(last) == Some(to)
            && self.graph.branch_inst(last).is_some_and(|i| i.pred.is_none())
    }

    fn chain_is_straight(&self, chain: &[ANode]) -> bool {
        if chain.is_empty() {
            return false;
        }
        chain.windows(2).all(|pair| {
            let end = self.pst[pair[0]].end;
            matches!(self.graph.terminator(end), Terminator::None)
                && self.graph[end].succs.as_slice() == [self.pst[pair[1]].begin]
        })
    }

    fn branch_target(&self, block: Block) -> Option<Block> {
        let inst = self.graph.branch_inst(block)?;
        match inst.kind {
            InstKind::Branch(br) => Some(br.target),
            _ => None,
        }
    }

    /// Break reconstruction, on finalized `DoWhile` nodes only.
    fn reconstruct_breaks(&mut self, loop_node: ANode) {
        let Some(exit) = self.pst[loop_node].exit else { return };
        let mut degraded = false;
        let mut idx = 0;
        loop {
            let children = self.pst.children(loop_node).to_vec();
            if idx >= children.len() {
                break;
            }
            let child = children[idx];
            let is_break = self
                .pst
                .leaf_block(child)
                .and_then(|b| self.branch_target(b).map(|t| (b, t)))
                .is_some_and(|(b, t)| t == exit && !self.graph.is_backward(b, t));
            if !is_break {
                idx += 1;
                continue;
            }

            if idx == 0 || self.pending_joins_before(loop_node, idx) == 0 {
                // Unconditionally reachable: the branch itself becomes the
                // (possibly predicated) break.
                self.pst.set_has_break(child);
                idx += 1;
            } else if let Some(wrapped_at) = self.try_rewrap_break(loop_node, idx) {
                idx = wrapped_at + 1;
            } else {
                self.pst.set_has_break(child);
                degraded = true;
                idx += 1;
            }
        }

        if degraded {
            debug!(?loop_node, "break shape not re-expressible; loop degrades to goto/join");
            self.pst.set_allow_scf(loop_node, false);
            let mut subtree = vec![loop_node];
            let mut i = 0;
            while i < subtree.len() {
                subtree.extend(self.pst.children(subtree[i]).iter().copied());
                i += 1;
            }
            for n in subtree {
                if n != loop_node
                    && matches!(self.pst[n].shape, ANodeShape::Hammock { .. })
                    && self.pst.contains_break(n)
                {
                    self.pst.set_allow_scf(n, false);
                }
            }
        }
    }

    /// Pending-join count ahead of child `idx`: forward branch targets from
    /// earlier children that land at or after it (loop-interior only; breaks
    /// jumping to the loop exit reduce the mask but keep reachability
    /// unconditional).
    fn pending_joins_before(&self, loop_node: ANode, idx: usize) -> usize {
        let children = self.pst.children(loop_node);
        let at = self.graph.order(self.pst[children[idx]].begin);
        let loop_end = self.graph.order(self.pst[loop_node].end);
        let exit = self.pst[loop_node].exit;
        let mut pending = 0;
        for &earlier in &children[..idx] {
            let mut leaves = vec![earlier];
            let mut i = 0;
            while i < leaves.len() {
                leaves.extend(self.pst.children(leaves[i]).iter().copied());
                i += 1;
            }
            for n in leaves {
                let Some(b) = self.pst.leaf_block(n) else { continue };
                let Some(t) = self.branch_target(b) else { continue };
                if Some(t) == exit || self.graph.is_backward(b, t) {
                    continue;
                }
                let tk = self.graph.order(t);
                if tk >= at && tk <= loop_end {
                    pending += 1;
                }
            }
        }
        pending
    }

    /// Re-wrap the conditional(s) guarding an interior break into a
    /// synthetic if-region, so conversion can emit a native break. Returns
    /// the index of the wrap on success.
    fn try_rewrap_break(&mut self, loop_node: ANode, idx: usize) -> Option<usize> {
        let children = self.pst.children(loop_node).to_vec();
        let ci = children[idx];

        // The interior node must itself be a Leaf, entered from exactly one
        // place, leaving unconditionally (its guard is what gets re-wrapped).
        let break_block = self.pst.leaf_block(ci)?;
        if self.graph[break_block].preds.len() != 1 {
            return None;
        }
        let break_inst = self.graph.branch_inst(break_block)?;
        if break_inst.pred.is_some() {
            return None;
        }
        let continue_at = children.get(idx + 1).map(|&n| self.pst[n].begin)?;

        let guard = |b: Block| -> Option<Block> {
            let inst = self.graph.branch_inst(b)?;
            let InstKind::Branch(br) = inst.kind else { return None };
            (inst.pred.is_some() && !self.graph.is_backward(b, br.target)).then_some(br.target)
        };

        // if (p) {} over the break: guard immediately precedes, jumping past.
        if idx >= 1
            && let Some(p_block) = self.pst.leaf_block(children[idx - 1])
            && guard(p_block) == Some(continue_at)
            && self.graph[break_block].preds.as_slice() == [p_block]
        {
            let wrap =
                self.wrap_children(loop_node, idx - 1, idx, RegionKind::IfThenEndif, continue_at);
            self.pst.set_has_break(ci);
            trace!(?wrap, "break re-wrapped as if/endif");
            return Some(idx - 1);
        }

        // if (p) { break } else {}: guard two back jumps straight to the
        // break; the then-part between jumps past it.
        if idx >= 2
            && let Some(g_block) = self.pst.leaf_block(children[idx - 2])
            && guard(g_block) == Some(break_block)
            && self.graph[break_block].preds.as_slice() == [g_block]
            && let Some(mid_block) = self.pst.leaf_block(children[idx - 1])
            && self.branch_target(mid_block) == Some(continue_at)
            && self.graph.branch_inst(mid_block).is_some_and(|i| i.pred.is_none())
        {
            let wrap = self.wrap_children(
                loop_node,
                idx - 2,
                idx,
                RegionKind::IfThenElseEndif,
                continue_at,
            );
            self.pst.set_has_break(ci);
            trace!(?wrap, "break re-wrapped as if/else/endif");
            return Some(idx - 2);
        }

        None
    }

    /// Wrap `children[from..=to]` of `parent` into a fresh hammock.
    fn wrap_children(
        &mut self,
        parent: ANode,
        from: usize,
        to: usize,
        region: RegionKind,
        exit: Block,
    ) -> ANode {
        let children = self.pst.children(parent).to_vec();
        let range: Vec<ANode> = children[from..=to].to_vec();
        let begin = self.pst[range[0]].begin;
        let end = self.pst[*range.last().unwrap()].end;

        let wrap = self.pst.new_hammock(begin, end, Some(exit));
        self.pst.set_region(wrap, region);
        self.pst[wrap].parent = Some(parent);
        for &n in &range {
            self.pst[n].parent = Some(wrap);
        }
        match &mut self.pst[wrap].shape {
            ANodeShape::Hammock { children, .. } => children.extend(range.iter().copied()),
            ANodeShape::Leaf { .. } => unreachable!(),
        }
        self.pst.condense(wrap);
        match &mut self.pst[parent].shape {
            ANodeShape::Hammock { children, .. } => {
                children.splice(from..=to, [wrap]);
            }
            ANodeShape::Leaf { .. } => unreachable!(),
        }
        wrap
    }

    /// No two regions may share one join label: once a second hammock claims
    /// an exit block, every claimant still holding it gets a dedicated
    /// synthesized landing block (inner regions land first, so their joins
    /// precede the outer ones in layout).
    fn claim_exit(&mut self, node: ANode, exit: Block) {
        self.exit_claims.entry(exit).or_default().push(node);
        let claimants = self.exit_claims[&exit].clone();
        if claimants.len() < 2 {
            return;
        }
        for m in claimants {
            if self.pst[m].exit != Some(exit) {
                continue;
            }
            let landing = self.insert_landing(exit, m);
            debug!(node = ?m, ?landing, "dedicated landing block for shared exit");
            self.pst[m].exit = Some(landing);
        }
    }

    /// Synthesize a landing block before `exit` and reroute every forward
    /// edge from inside `owner`'s range onto it.
    fn insert_landing(&mut self, exit: Block, owner: ANode) -> Block {
        let landing = self.graph.insert_block_before(exit);
        let lo = self.graph.order(self.pst[owner].begin);
        let hi = self.graph.order(self.pst[owner].end);
        let in_range =
            |graph: &FlowGraph, b: Block| graph.order(b) >= lo && graph.order(b) <= hi;

        let preds: SmallVec<[Block; 4]> = self
            .graph
            .preds(exit)
            .into_iter()
            .filter(|&p| p != landing && in_range(self.graph, p))
            .collect();
        for p in preds {
            self.graph.retarget_edge(p, exit, landing);
        }
        // The block now physically ahead of the landing falls through it, so
        // its fallthrough edge (if any) has to follow the chain.
        let prev = self.graph[landing].phys_pred.unwrap();
        if self.graph[prev].succs.contains(&exit) && self.branch_target(prev) != Some(exit) {
            self.graph.retarget_edge(prev, exit, landing);
        }
        self.graph.add_edge(landing, exit);

        for e in &mut self.open_edges {
            if !e.backward && e.target == exit && in_range(self.graph, e.source) {
                e.target = landing;
            }
        }
        landing
    }

    /// Wrap whatever is left at toplevel into the (virtual) function root.
    fn finish_root(&mut self) -> ANode {
        assert!(!self.toplevel.is_empty(), "structurizer: no blocks scanned");
        if self.toplevel.len() == 1
            && matches!(self.pst[self.toplevel[0]].shape, ANodeShape::Hammock { .. })
        {
            return self.toplevel[0];
        }
        let begin = self.pst[self.toplevel[0]].begin;
        let end = self.pst[*self.toplevel.last().unwrap()].end;
        let root = self.pst.new_hammock(begin, end, None);
        for &n in &self.toplevel {
            self.pst[n].parent = Some(root);
        }
        let toplevel = std::mem::take(&mut self.toplevel);
        match &mut self.pst[root].shape {
            ANodeShape::Hammock { children, .. } => children.extend(toplevel),
            ANodeShape::Leaf { .. } => unreachable!(),
        }
        root
    }
}
