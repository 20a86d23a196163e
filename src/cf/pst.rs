//! Program structure tree (PST): the hierarchy of single-entry/single-exit
//! regions ("hammocks") built over one function's blocks.
//!
//! Nodes live in a per-invocation arena ([`PstArena`]) and are addressed by
//! stable [`ANode`] indices; parent/children/predecessor/successor links are
//! index sets, so node absorption and block renumbering can never dangle.
//! The arena is built fresh per structurizer invocation and discarded with
//! it — the rewritten [`FlowGraph`] persists, the PST does not.

use crate::{Block, FlowGraph, FxIndexSet, Terminator};
use smallvec::SmallVec;
use std::fmt;

/// Entity handle for an [`ANodeDef`] in a [`PstArena`].
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ANode(u32);

impl ANode {
    fn idx(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for ANode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// What a Leaf's single block does besides branching.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum BlockRole {
    Normal,
    Call,
    Return,
}

/// The code-generation strategy chosen for a node by the converter.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum CodeGenKind {
    Undetermined,
    /// Branch is provably lane-uniform: plain `jmpi`, no mask bookkeeping.
    ScalarJump,
    /// Hardware structured set: `if`/`else`/`endif`, `while`/`break`.
    Structured,
    /// Explicit `goto`+`join` with chained reconvergence targets.
    GotoJoin,
}

/// Shape of a hammock region, decided at finalization (see `cf::construct`).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum RegionKind {
    IfThenEndif,
    IfThenElseEndif,
    DoWhile,
    /// Anything that fits no structured pattern — including the defensively
    /// tolerated conditional whose two successors are identical (an upstream
    /// producer defect, classified rather than asserted on).
    Composite,
    /// Straight unbranched chain, kept flat to keep the tree shallow.
    Sequence,
}

/// One program-structure-tree node: a Leaf wraps a single block, a Hammock
/// wraps a single-entry/single-exit region of children.
#[derive(Clone, Debug)]
pub enum ANodeShape {
    Leaf {
        block: Block,
        role: BlockRole,
        /// Loop-interior early exit, re-expressed as a native `break` by the
        /// converter when the enclosing loop stays structured.
        has_break: bool,
        /// The block's label is already consumed by an emitted instruction,
        /// so further joins for it need a split-label block.
        label_used: bool,
    },
    Hammock {
        children: Vec<ANode>,
        region: RegionKind,
        /// Cleared when break reconstruction finds a shape it cannot
        /// re-express, forcing `goto`/`join` for this region only.
        allow_scf: bool,
    },
}

#[derive(Clone, Debug)]
pub struct ANodeDef {
    pub begin: Block,
    pub end: Block,
    /// `None` only for a trailing node with no successor.
    pub exit: Option<Block>,

    pub parent: Option<ANode>,

    /// ACFG edges: ordered predecessor/successor sets over currently
    /// top-level (not yet enclosed) nodes.
    pub preds: FxIndexSet<ANode>,
    pub succs: FxIndexSet<ANode>,

    pub kind: CodeGenKind,

    /// Set once this node has been condensed into an enclosing hammock and
    /// is no longer a live ACFG node.
    pub absorbed: bool,

    pub shape: ANodeShape,
}

/// Arena of PST nodes for one structurizer invocation.
#[derive(Default)]
pub struct PstArena {
    nodes: Vec<ANodeDef>,
}

impl std::ops::Index<ANode> for PstArena {
    type Output = ANodeDef;
    fn index(&self, n: ANode) -> &ANodeDef {
        &self.nodes[n.idx()]
    }
}

impl std::ops::IndexMut<ANode> for PstArena {
    fn index_mut(&mut self, n: ANode) -> &mut ANodeDef {
        &mut self.nodes[n.idx()]
    }
}

impl PstArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_leaf(&mut self, graph: &FlowGraph, block: Block) -> ANode {
        let role = match graph.terminator(block) {
            Terminator::Call => BlockRole::Call,
            Terminator::Return => BlockRole::Return,
            _ => BlockRole::Normal,
        };
        self.push(ANodeDef {
            begin: block,
            end: block,
            exit: graph[block].phys_succ,
            parent: None,
            preds: FxIndexSet::default(),
            succs: FxIndexSet::default(),
            kind: CodeGenKind::Undetermined,
            absorbed: false,
            shape: ANodeShape::Leaf { block, role, has_break: false, label_used: false },
        })
    }

    pub fn new_hammock(&mut self, begin: Block, end: Block, exit: Option<Block>) -> ANode {
        self.push(ANodeDef {
            begin,
            end,
            exit,
            parent: None,
            preds: FxIndexSet::default(),
            succs: FxIndexSet::default(),
            kind: CodeGenKind::Undetermined,
            absorbed: false,
            shape: ANodeShape::Hammock {
                children: Vec::new(),
                region: RegionKind::Composite,
                allow_scf: true,
            },
        })
    }

    fn push(&mut self, def: ANodeDef) -> ANode {
        let n = ANode(u32::try_from(self.nodes.len()).unwrap());
        self.nodes.push(def);
        n
    }

    pub fn iter(&self) -> impl Iterator<Item = ANode> + '_ {
        (0..self.nodes.len()).map(|i| ANode(u32::try_from(i).unwrap()))
    }

    /// The live ACFG node currently standing for `n` (follows parents out of
    /// absorbed nodes).
    pub fn top(&self, mut n: ANode) -> ANode {
        while self[n].absorbed {
            n = self[n].parent.expect("pst: absorbed node with no enclosing hammock");
        }
        n
    }

    pub fn children(&self, n: ANode) -> &[ANode] {
        match &self[n].shape {
            ANodeShape::Leaf { .. } => &[],
            ANodeShape::Hammock { children, .. } => children,
        }
    }

    pub fn region(&self, n: ANode) -> Option<RegionKind> {
        match self[n].shape {
            ANodeShape::Leaf { .. } => None,
            ANodeShape::Hammock { region, .. } => Some(region),
        }
    }

    pub fn leaf_block(&self, n: ANode) -> Option<Block> {
        match self[n].shape {
            ANodeShape::Leaf { block, .. } => Some(block),
            ANodeShape::Hammock { .. } => None,
        }
    }

    pub fn allow_scf(&self, n: ANode) -> bool {
        match self[n].shape {
            ANodeShape::Leaf { .. } => true,
            ANodeShape::Hammock { allow_scf, .. } => allow_scf,
        }
    }

    pub fn set_allow_scf(&mut self, n: ANode, allowed: bool) {
        if let ANodeShape::Hammock { allow_scf, .. } = &mut self[n].shape {
            *allow_scf = allowed;
        }
    }

    pub fn set_region(&mut self, n: ANode, kind: RegionKind) {
        match &mut self[n].shape {
            ANodeShape::Leaf { .. } => unreachable!("pst: region kind on a leaf"),
            ANodeShape::Hammock { region, .. } => *region = kind,
        }
    }

    pub fn set_has_break(&mut self, n: ANode) {
        match &mut self[n].shape {
            ANodeShape::Leaf { has_break, .. } => *has_break = true,
            ANodeShape::Hammock { .. } => unreachable!("pst: break tag on a hammock"),
        }
    }

    pub fn has_break(&self, n: ANode) -> bool {
        matches!(self[n].shape, ANodeShape::Leaf { has_break: true, .. })
    }

    /// Whether any descendant Leaf of `n` is tagged as a break.
    pub fn contains_break(&self, n: ANode) -> bool {
        self.has_break(n) || self.children(n).iter().any(|&c| self.contains_break(c))
    }

    pub fn add_edge(&mut self, from: ANode, to: ANode) {
        self[from].succs.insert(to);
        self[to].preds.insert(from);
    }

    pub fn remove_edge(&mut self, from: ANode, to: ANode) {
        self[from].succs.swap_remove(&to);
        self[to].preds.swap_remove(&from);
    }

    /// Whether `n` is `ancestor` or nested (at any depth) inside it.
    pub fn is_inside(&self, mut n: ANode, ancestor: ANode) -> bool {
        loop {
            if n == ancestor {
                return true;
            }
            match self[n].parent {
                Some(p) => n = p,
                None => return false,
            }
        }
    }

    /// Condense a just-finalized hammock into the ACFG: all of its direct
    /// children's external edges are replaced with a single edge to/from the
    /// hammock, and the children are marked absorbed.
    pub fn condense(&mut self, node: ANode) {
        let children: SmallVec<[ANode; 8]> = self.children(node).iter().copied().collect();
        for &child in &children {
            self[child].absorbed = true;
        }
        for &child in &children {
            self.reroute_external_edges(child, node);
        }
    }

    /// Absorb one already-attached node into `container` (e.g. appending to a
    /// growing `Sequence`): marks it absorbed and replaces its external edges
    /// with `container`'s.
    pub fn absorb_into(&mut self, container: ANode, node: ANode) {
        self[node].parent = Some(container);
        self[node].absorbed = true;
        self.reroute_external_edges(node, container);
    }

    fn reroute_external_edges(&mut self, node: ANode, container: ANode) {
        let preds: SmallVec<[ANode; 4]> = self[node].preds.iter().copied().collect();
        for p in preds {
            self.remove_edge(p, node);
            if !self.is_inside(p, container) {
                self[p].succs.insert(container);
                self[container].preds.insert(p);
            }
        }
        let succs: SmallVec<[ANode; 4]> = self[node].succs.iter().copied().collect();
        for s in succs {
            self.remove_edge(node, s);
            if !self.is_inside(s, container) {
                self[s].preds.insert(container);
                self[container].succs.insert(s);
            }
        }
    }

    /// Check the PST range invariants; broken ones indicate a structurizer
    /// defect or a violated producer precondition, and abort compilation.
    pub fn assert_invariants(&self, graph: &FlowGraph) {
        for n in self.iter() {
            let def = &self[n];
            // Husks left behind by mid-scan stack merges keep their `absorbed`
            // marker but no children; they carry no ranges worth checking.
            if def.absorbed
                && let ANodeShape::Hammock { children, .. } = &def.shape
                && children.is_empty()
            {
                continue;
            }
            assert!(
                graph.order(def.begin) <= graph.order(def.end),
                "pst: {n:?} has begin after end",
            );
            if let Some(exit) = def.exit {
                assert!(
                    graph.order(def.end) < graph.order(exit),
                    "pst: {n:?} has end at or after exit",
                );
            }
            if let ANodeShape::Hammock { children, .. } = &def.shape {
                assert!(!children.is_empty(), "pst: {n:?} is an empty hammock");
                assert_eq!(self[children[0]].begin, def.begin, "pst: {n:?} children begin late");
                assert_eq!(
                    self[*children.last().unwrap()].end,
                    def.end,
                    "pst: {n:?} children end early",
                );
                for pair in children.windows(2) {
                    assert!(
                        graph.order(self[pair[0]].end) < graph.order(self[pair[1]].begin),
                        "pst: {n:?} children overlap or reorder",
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FlowGraph;

    #[test]
    fn condense_reroutes_external_edges() {
        let mut graph = FlowGraph::new();
        let blocks: Vec<Block> = (0..4).map(|_| graph.add_block()).collect();

        let mut pst = PstArena::new();
        let outside_pred = pst.new_leaf(&graph, blocks[0]);
        let inner_a = pst.new_leaf(&graph, blocks[1]);
        let inner_b = pst.new_leaf(&graph, blocks[2]);
        let outside_succ = pst.new_leaf(&graph, blocks[3]);

        pst.add_edge(outside_pred, inner_a);
        pst.add_edge(inner_a, inner_b);
        pst.add_edge(inner_b, outside_succ);

        let hammock = pst.new_hammock(blocks[1], blocks[2], Some(blocks[3]));
        if let ANodeShape::Hammock { children, .. } = &mut pst[hammock].shape {
            children.extend([inner_a, inner_b]);
        }
        pst[inner_a].parent = Some(hammock);
        pst[inner_b].parent = Some(hammock);
        pst.condense(hammock);

        assert!(pst[inner_a].absorbed && pst[inner_b].absorbed);
        assert_eq!(pst.top(inner_b), hammock);
        assert!(pst[outside_pred].succs.contains(&hammock));
        assert!(pst[hammock].succs.contains(&outside_succ));
        // Interior edges vanish rather than becoming self-loops.
        assert!(!pst[hammock].succs.contains(&hammock));
    }
}
