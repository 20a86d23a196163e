//! **`lanecf`** is a control-flow structurizer for SIMD ("per-lane") targets:
//! it rewrites a basic-block graph full of unstructured `goto`s (expressing
//! lane divergence) into the structured forms the hardware tracks active-mask
//! state for implicitly — `if`/`endif`, `if`/`else`/`endif`, `do`/`while` with
//! `break` — or, where a branch is provably uniform across lanes, into plain
//! scalar jumps, falling back to explicit `goto`+`join` pairs with computed
//! reconvergence targets everywhere else.
//!
//! #### Notable types/modules
//!
//! ##### IR data types
//! * [`FlowGraph`]: owns [`Block`]s, their instructions, and the physical
//!   (fallthrough) layout chain
//! * [`Inst`]/[`InstKind`]: the control-flow-relevant instruction model,
//!   including the hardware structured set ([`ScfInst`])
//!
//! ##### Utilities and passes
//! * [`cf::structurize::Structurizer`]: the structurization pass itself
//! * [`cf::pst`]: the program structure tree built during structurization

// BEGIN - Embark standard lints v6 for Rust 1.55+
// do not change or add/remove here, but one can add exceptions after this section
// for more info see: <https://github.com/EmbarkStudios/rust-ecosystem/issues/59>
#![deny(unsafe_code)]
#![warn(
    clippy::all,
    clippy::await_holding_lock,
    clippy::char_lit_as_u8,
    clippy::checked_conversions,
    clippy::dbg_macro,
    clippy::debug_assert_with_mut_call,
    clippy::doc_markdown,
    clippy::empty_enum,
    clippy::enum_glob_use,
    clippy::exit,
    clippy::expl_impl_clone_on_copy,
    clippy::explicit_deref_methods,
    clippy::explicit_into_iter_loop,
    clippy::fallible_impl_from,
    clippy::filter_map_next,
    clippy::flat_map_option,
    clippy::float_cmp_const,
    clippy::fn_params_excessive_bools,
    clippy::from_iter_instead_of_collect,
    clippy::if_let_mutex,
    clippy::implicit_clone,
    clippy::imprecise_flops,
    clippy::inefficient_to_string,
    clippy::invalid_upcast_comparisons,
    clippy::large_digit_groups,
    clippy::large_stack_arrays,
    clippy::large_types_passed_by_value,
    clippy::let_unit_value,
    clippy::linkedlist,
    clippy::lossy_float_literal,
    clippy::macro_use_imports,
    clippy::manual_ok_or,
    clippy::map_err_ignore,
    clippy::map_flatten,
    clippy::map_unwrap_or,
    clippy::match_same_arms,
    clippy::match_wild_err_arm,
    clippy::match_wildcard_for_single_variants,
    clippy::mem_forget,
    clippy::missing_enforced_import_renames,
    clippy::mut_mut,
    clippy::mutex_integer,
    clippy::needless_borrow,
    clippy::needless_continue,
    clippy::needless_for_each,
    clippy::option_option,
    clippy::path_buf_push_overwrite,
    clippy::ptr_as_ptr,
    clippy::rc_mutex,
    clippy::ref_option_ref,
    clippy::rest_pat_in_fully_bound_structs,
    clippy::same_functions_in_if_condition,
    clippy::semicolon_if_nothing_returned,
    clippy::single_match_else,
    clippy::string_add_assign,
    clippy::string_add,
    clippy::string_lit_as_bytes,
    clippy::string_to_string,
    clippy::todo,
    clippy::trait_duplication_in_bounds,
    clippy::unimplemented,
    clippy::unnested_or_patterns,
    clippy::unused_self,
    clippy::useless_transmute,
    clippy::verbose_file_reads,
    clippy::zero_sized_map_values,
    future_incompatible,
    nonstandard_style,
    rust_2018_idioms
)]
// END - Embark standard lints v6 for Rust 1.55+
// crate-specific exceptions:
#![allow(
    // NOTE(lanecf) ignored for readability (`match` used when `if let` is too long).
    clippy::single_match_else,
)]
// NOTE(lanecf) this is stronger than the "Embark standard lints" above, because
// we almost never need `unsafe` code and this is a further "speed bump" to it.
#![forbid(unsafe_code)]

// NOTE(lanecf) all the modules are declared here, but they're documented "inside"
// (i.e. using inner doc comments).
pub mod cf;

use smallvec::SmallVec;
use std::fmt;

// HACK(lanecf) work around the lack of `FxIndex{Map,Set}` type aliases elsewhere.
#[doc(hidden)]
type FxIndexMap<K, V> =
    indexmap::IndexMap<K, V, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;
#[doc(hidden)]
type FxIndexSet<V> = indexmap::IndexSet<V, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;

/// Entity handle for a [`BlockDef`] (a basic block), allocated by [`FlowGraph`].
///
/// Handles are never reused within one graph, and are only meaningful for the
/// graph that allocated them. Note the deliberate lack of `Ord`: handle order
/// says nothing about layout order, which is what every comparison in this
/// crate needs (see [`LayoutKey`]).
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct Block(u32);

impl Block {
    fn idx(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Total order over blocks, including blocks synthesized mid-pass.
///
/// Original blocks compare by their assigned index (the second component
/// being `0`). A synthesized block compares as if it were inserted
/// immediately after the original block it was attached to, with ties among
/// blocks at the same insertion point broken by creation order (a graph-wide
/// monotonic counter).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Default)]
pub struct LayoutKey(pub u32, pub u32);

/// A flag-register predicate guarding an instruction, i.e. the per-lane
/// condition of a divergent branch.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct Predicate {
    pub flag: u32,
    pub inverse: bool,
}

impl Predicate {
    pub fn inverted(self) -> Self {
        Self { flag: self.flag, inverse: !self.inverse }
    }
}

/// Execution width (lane count) of an instruction, preserved verbatim when
/// one instruction is rewritten into another.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ExecSize(pub u8);

impl Default for ExecSize {
    fn default() -> Self {
        Self(16)
    }
}

/// An instruction, modeled only up to what structurization needs: the
/// optional predicate, the execution width, and the control-flow kind
/// (everything else is [`InstKind::Other`]).
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Inst {
    pub pred: Option<Predicate>,
    pub exec_size: ExecSize,
    pub kind: InstKind,
}

impl Inst {
    pub fn new(kind: impl Into<InstKind>) -> Self {
        Self { pred: None, exec_size: ExecSize::default(), kind: kind.into() }
    }

    pub fn with_pred(mut self, pred: Predicate) -> Self {
        self.pred = Some(pred);
        self
    }

    /// Synthesize a replacement instruction with predicate/execution-width
    /// fidelity matching `self` (the originating branch).
    pub fn retaining_fidelity(&self, kind: impl Into<InstKind>) -> Inst {
        Inst { pred: self.pred, exec_size: self.exec_size, kind: kind.into() }
    }
}

/// The kind of an [`Inst`], as far as control flow is concerned.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, derive_more::From)]
pub enum InstKind {
    /// Straight-line instruction with no control-flow relevance.
    Other,

    /// Branch target marker (the "label" the hardware branches resolve to).
    Label,

    Call,
    Return,

    /// Unstructured branches: divergent `goto` and scalar `jmpi`.
    #[from]
    Branch(BranchInst),

    /// The hardware structured control-flow set.
    #[from]
    Scf(ScfInst),
}

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum BranchOp {
    /// Divergent branch. In the producer's (unresolved) form, lanes passing
    /// the predicate jump to `target`. In the hardware form (`jip`
    /// assigned), the predicate instead names the lanes that *stay* on the
    /// fallthrough path — the rest jump and wait at the target's `join` —
    /// which is why conversion emits it with the negated predicate.
    Goto,

    /// Scalar jump: all lanes (or a provably uniform subset) jump together,
    /// no mask bookkeeping.
    Jmpi,
}

/// An unstructured branch instruction.
///
/// `jip` starts out `None` and is only assigned for `Goto`s that survive to
/// the `goto`/`join` fallback, once the next reconvergence point in program
/// order is known (see [`cf::convert`]); its presence distinguishes the
/// hardware form from the producer's.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct BranchInst {
    pub op: BranchOp,
    pub target: Block,
    pub jip: Option<Block>,
}

impl BranchInst {
    pub fn goto(target: Block) -> Self {
        Self { op: BranchOp::Goto, target, jip: None }
    }

    pub fn jmpi(target: Block) -> Self {
        Self { op: BranchOp::Jmpi, target, jip: None }
    }
}

/// Structured control-flow instructions, i.e. the small set the hardware
/// tracks per-lane active-mask state for implicitly.
///
/// `jip` ("jump instruction pointer") designates where disabled lanes skip
/// to; `uip` ("unconditional instruction pointer") the target when every
/// active lane takes the branch.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum ScfInst {
    If { jip: Block, uip: Block },
    Else { jip: Block, uip: Block },
    EndIf { jip: Block },
    While { jip: Block, uip: Block },
    Break { jip: Block, uip: Block },
    Join { jip: Block },
}

/// Classification of how a block's last instruction leaves it.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Terminator {
    /// Falls through to the physical successor.
    None,
    CondGoto { backward: bool },
    UncondGoto { backward: bool },
    Jmpi,
    Call,
    Return,
    /// Already-structured terminator (only after conversion).
    Scf,
}

/// Definition of a basic block: its instructions, CFG edges, and position in
/// the physical (fallthrough) chain.
#[derive(Clone, Default, Debug)]
pub struct BlockDef {
    pub insts: Vec<Inst>,

    pub preds: SmallVec<[Block; 2]>,
    pub succs: SmallVec<[Block; 2]>,

    pub phys_pred: Option<Block>,
    pub phys_succ: Option<Block>,

    pub layout: LayoutKey,

    /// Whether this block was synthesized by the structurizer (landing
    /// blocks, loop-tail blocks, split-label blocks), as opposed to being
    /// owned by the graph's producer.
    pub synthesized: bool,
}

/// A function's basic-block graph: ordered blocks with predecessor/successor
/// lists and a physical layout (fallthrough) chain.
///
/// The structurizer is the sole writer of the predecessor/successor/physical
/// links while it runs; it may insert new blocks but never deletes blocks it
/// did not create. Block count/IDs may grow during the pass and are
/// renumbered at the end of the run (see [`FlowGraph::renumber`]).
#[derive(Clone, Default)]
pub struct FlowGraph {
    blocks: Vec<BlockDef>,

    first: Option<Block>,
    last: Option<Block>,

    /// Count of producer-owned blocks, i.e. the next original layout index.
    original_count: u32,

    /// Creation-order tiebreaker for synthesized blocks' [`LayoutKey`]s.
    layout_ties: u32,
}

impl std::ops::Index<Block> for FlowGraph {
    type Output = BlockDef;
    fn index(&self, b: Block) -> &BlockDef {
        &self.blocks[b.idx()]
    }
}

impl std::ops::IndexMut<Block> for FlowGraph {
    fn index_mut(&mut self, b: Block) -> &mut BlockDef {
        &mut self.blocks[b.idx()]
    }
}

impl FlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a producer-owned block at the end of the physical chain.
    pub fn add_block(&mut self) -> Block {
        let block = Block(u32::try_from(self.blocks.len()).unwrap());
        let layout = LayoutKey(self.original_count, 0);
        self.original_count += 1;
        self.blocks.push(BlockDef { layout, ..BlockDef::default() });
        self.link_phys_at_end(block);
        block
    }

    /// Insert a synthesized (structurizer-owned) block into the physical
    /// chain immediately before `before`.
    ///
    /// `before` must have a physical predecessor: every site that needs a
    /// landing block sits past the entry block, so a missing link is a
    /// broken precondition from the graph's producer.
    pub fn insert_block_before(&mut self, before: Block) -> Block {
        let anchor = self[before]
            .phys_pred
            .expect("flowgraph: physical-predecessor link missing where required");
        self.insert_block_after(anchor)
    }

    /// Insert a synthesized block into the physical chain immediately after
    /// `after`, ordering it per [`LayoutKey`] rules.
    pub fn insert_block_after(&mut self, after: Block) -> Block {
        let block = Block(u32::try_from(self.blocks.len()).unwrap());
        self.layout_ties += 1;
        let layout = LayoutKey(self[after].layout.0, self.layout_ties);
        self.blocks.push(BlockDef {
            layout,
            synthesized: true,
            insts: vec![Inst::new(InstKind::Label)],
            ..BlockDef::default()
        });

        let next = self[after].phys_succ;
        self[after].phys_succ = Some(block);
        self[block].phys_pred = Some(after);
        self[block].phys_succ = next;
        match next {
            Some(next) => self[next].phys_pred = Some(block),
            None => self.last = Some(block),
        }
        block
    }

    fn link_phys_at_end(&mut self, block: Block) {
        match self.last {
            Some(last) => {
                self[last].phys_succ = Some(block);
                self[block].phys_pred = Some(last);
            }
            None => self.first = Some(block),
        }
        self.last = Some(block);
    }

    /// The entry block (head of the physical chain).
    pub fn entry(&self) -> Block {
        self.first.expect("flowgraph: empty graph has no entry block")
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Iterate blocks in physical (layout) order.
    pub fn layout_order(&self) -> impl Iterator<Item = Block> + '_ {
        let mut next = self.first;
        std::iter::from_fn(move || {
            let block = next?;
            next = self[block].phys_succ;
            Some(block)
        })
    }

    pub fn order(&self, b: Block) -> LayoutKey {
        self[b].layout
    }

    /// Whether an edge `src -> target` runs backward (or self-loops) in
    /// layout order.
    pub fn is_backward(&self, src: Block, target: Block) -> bool {
        self.order(target) <= self.order(src)
    }

    // FIXME(lanecf) `preds`/`succs` are also reachable via `Index`, but the
    // copied-out forms below sidestep borrow conflicts at most call sites.
    pub fn preds(&self, b: Block) -> SmallVec<[Block; 2]> {
        self[b].preds.clone()
    }

    pub fn succs(&self, b: Block) -> SmallVec<[Block; 2]> {
        self[b].succs.clone()
    }

    pub fn add_edge(&mut self, from: Block, to: Block) {
        if !self[from].succs.contains(&to) {
            self[from].succs.push(to);
        }
        if !self[to].preds.contains(&from) {
            self[to].preds.push(from);
        }
    }

    pub fn remove_edge(&mut self, from: Block, to: Block) {
        self[from].succs.retain(|&mut s| s != to);
        self[to].preds.retain(|&mut p| p != from);
    }

    /// Repoint the edge `from -> old_to` at `new_to`, rewriting `from`'s
    /// branch instruction when it names `old_to` (fallthrough edges have no
    /// instruction to rewrite).
    pub fn retarget_edge(&mut self, from: Block, old_to: Block, new_to: Block) {
        self.remove_edge(from, old_to);
        self.add_edge(from, new_to);
        if let Some(inst) = self[from].insts.last_mut()
            && let InstKind::Branch(branch) = &mut inst.kind
            && branch.target == old_to
        {
            branch.target = new_to;
        }
    }

    /// The block's last instruction, if it is any kind of branch.
    pub fn branch_inst(&self, b: Block) -> Option<&Inst> {
        self[b].insts.last().filter(|inst| matches!(inst.kind, InstKind::Branch(_)))
    }

    /// Replace the block's terminating branch in place.
    pub fn set_terminator(&mut self, b: Block, inst: Inst) {
        match self[b].insts.last_mut() {
            Some(last) if matches!(last.kind, InstKind::Branch(_) | InstKind::Scf(_)) => {
                *last = inst;
            }
            _ => self[b].insts.push(inst),
        }
    }

    /// Append an instruction without disturbing an existing terminator.
    pub fn push_inst(&mut self, b: Block, inst: Inst) {
        let insts = &mut self[b].insts;
        match insts.last() {
            Some(last) if matches!(last.kind, InstKind::Branch(_) | InstKind::Scf(_)) => {
                let at = insts.len() - 1;
                insts.insert(at, inst);
            }
            _ => insts.push(inst),
        }
    }

    /// Prepend an instruction just after the block's label (if any).
    pub fn push_inst_front(&mut self, b: Block, inst: Inst) {
        let at =
            usize::from(matches!(self[b].insts.first().map(|i| &i.kind), Some(InstKind::Label)));
        self[b].insts.insert(at, inst);
    }

    /// Classify how `b` terminates (already-available facts later passes
    /// consult, not an analysis).
    pub fn terminator(&self, b: Block) -> Terminator {
        let Some(inst) = self[b].insts.last() else { return Terminator::None };
        match &inst.kind {
            InstKind::Other | InstKind::Label => Terminator::None,
            InstKind::Call => Terminator::Call,
            InstKind::Return => Terminator::Return,
            InstKind::Scf(_) => Terminator::Scf,
            InstKind::Branch(branch) => {
                let backward = self.is_backward(b, branch.target);
                match branch.op {
                    BranchOp::Jmpi => Terminator::Jmpi,
                    BranchOp::Goto => {
                        if inst.pred.is_some() {
                            Terminator::CondGoto { backward }
                        } else {
                            Terminator::UncondGoto { backward }
                        }
                    }
                }
            }
        }
    }

    /// Reassign sequential block indices following the physical chain, after
    /// the pass may have grown the block count.
    pub fn renumber(&mut self) {
        let order: Vec<Block> = self.layout_order().collect();
        for (i, block) in order.into_iter().enumerate() {
            self[block].layout = LayoutKey(u32::try_from(i).unwrap(), 0);
        }
        self.original_count = u32::try_from(self.blocks.len()).unwrap();
        self.layout_ties = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(n: usize) -> (FlowGraph, Vec<Block>) {
        let mut graph = FlowGraph::new();
        let blocks: Vec<Block> = (0..n).map(|_| graph.add_block()).collect();
        for w in blocks.windows(2) {
            graph.add_edge(w[0], w[1]);
        }
        (graph, blocks)
    }

    #[test]
    fn synthesized_blocks_order_after_their_anchor() {
        let (mut graph, blocks) = chain(3);
        let mid = graph.insert_block_after(blocks[0]);
        let mid2 = graph.insert_block_after(blocks[0]);
        assert!(graph.order(blocks[0]) < graph.order(mid));
        assert!(graph.order(mid) < graph.order(mid2));
        assert!(graph.order(mid2) < graph.order(blocks[1]));
        // Ties at one insertion point break by creation order, even though
        // `mid2` physically precedes `mid`.
        assert_eq!(graph[blocks[0]].phys_succ, Some(mid2));
    }

    #[test]
    fn insert_before_anchors_to_physical_predecessor() {
        let (mut graph, blocks) = chain(3);
        let landing = graph.insert_block_before(blocks[2]);
        assert_eq!(graph[landing].phys_pred, Some(blocks[1]));
        assert_eq!(graph[landing].phys_succ, Some(blocks[2]));
        assert!(graph.order(blocks[1]) < graph.order(landing));
        assert!(graph.order(landing) < graph.order(blocks[2]));
    }

    #[test]
    fn renumber_restores_dense_original_indices() {
        let (mut graph, blocks) = chain(3);
        graph.insert_block_before(blocks[1]);
        graph.renumber();
        let keys: Vec<LayoutKey> = graph.layout_order().map(|b| graph.order(b)).collect();
        assert_eq!(keys, vec![
            LayoutKey(0, 0),
            LayoutKey(1, 0),
            LayoutKey(2, 0),
            LayoutKey(3, 0)
        ]);
    }

    #[test]
    fn retarget_edge_rewrites_branch_instructions() {
        let (mut graph, blocks) = chain(2);
        let elsewhere = graph.add_block();
        graph[blocks[0]].insts.push(Inst::new(BranchInst::goto(blocks[1])));
        graph.add_edge(blocks[0], elsewhere);
        graph.retarget_edge(blocks[0], blocks[1], elsewhere);
        let branch = graph.branch_inst(blocks[0]).unwrap();
        assert_eq!(branch.kind, InstKind::Branch(BranchInst::goto(elsewhere)));
        assert!(!graph[blocks[1]].preds.contains(&blocks[0]));
    }
}
