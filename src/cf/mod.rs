//! Control-flow abstractions and passes.

use crate::{Block, FlowGraph};

// NOTE(lanecf) all the modules are declared here, but they're documented "inside"
// (i.e. using inner doc comments).
pub mod construct;
pub mod convert;
pub mod preprocess;
pub mod pst;
pub mod structurize;

/// Which rewrites the structurizer is allowed to use.
///
/// Structured control flow and scalar jumps are both optimizations over the
/// `goto`/`join` fallback, which is always available.
#[derive(Copy, Clone, Debug)]
pub struct ScfConfig {
    /// Allow emitting the hardware structured set (`if`/`else`/`endif`,
    /// `while`/`break`).
    pub enable_scf: bool,

    /// Allow rewriting provably lane-uniform branches into scalar jumps.
    pub enable_scalar_jump: bool,
}

impl Default for ScfConfig {
    fn default() -> Self {
        Self { enable_scf: true, enable_scalar_jump: true }
    }
}

/// Oracle deciding whether a branch is provably uniform across lanes.
///
/// The decision itself (divergence analysis) is owned by the surrounding
/// compiler; the structurizer only consults the verdict for the branch
/// terminating `branch_block`.
pub trait UniformityOracle {
    fn is_uniform(&self, graph: &FlowGraph, branch_block: Block) -> bool;
}

/// The conservative oracle: nothing is uniform, every divergent branch keeps
/// its mask bookkeeping.
#[derive(Copy, Clone, Default)]
pub struct AllDivergent;

impl UniformityOracle for AllDivergent {
    fn is_uniform(&self, _: &FlowGraph, _: Block) -> bool {
        false
    }
}
