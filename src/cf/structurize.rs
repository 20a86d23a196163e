//! The structurization pass: preprocess, build the PST, convert, renumber.
//!
//! Invoked programmatically as one pass in a larger pipeline; the PST lives
//! only for the duration of one invocation (the rewritten [`FlowGraph`]
//! persists, the tree does not).

use crate::FlowGraph;
use crate::cf::construct::construct_pst;
use crate::cf::convert::convert_pst;
use crate::cf::preprocess::preprocess;
use crate::cf::{ScfConfig, UniformityOracle};
use tracing::{debug, debug_span};

/// Control-flow structurizer for one function's block graph.
///
/// Rewrites every unstructured branch into one of: scalar jump, structured
/// `if`/`else`/`endif`, structured `while`/`break`, or explicit `goto`+`join`
/// with resolved JIPs. Block count/IDs may grow and are renumbered at the
/// end of the run.
pub struct Structurizer<'a, O: ?Sized> {
    graph: &'a mut FlowGraph,
    oracle: &'a O,
    config: ScfConfig,
}

impl<'a, O: UniformityOracle + ?Sized> Structurizer<'a, O> {
    pub fn new(graph: &'a mut FlowGraph, oracle: &'a O, config: ScfConfig) -> Self {
        Self { graph, oracle, config }
    }

    pub fn structurize_function(self) {
        if self.graph.is_empty() {
            return;
        }
        let _span = debug_span!("structurize").entered();

        let inserted = preprocess(self.graph);
        debug!(inserted, "preprocess");

        let mut pst = construct_pst(self.graph);
        convert_pst(self.graph, &mut pst, self.oracle, self.config);
        pst.arena.assert_invariants(self.graph);

        self.graph.renumber();
        // `pst` drops here: node handles must not outlive the invocation.
    }
}
