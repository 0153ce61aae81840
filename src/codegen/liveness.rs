use std::collections::BTreeSet;

use crate::ir::{BlockId, ValueId};

use super::flow::{FlowGraph, Node};

pub type LiveSet = BTreeSet<ValueId>;

/// Block-level liveness of one function.
///
/// Phi destinations are defined on block entry, so they never appear in
/// their own block's live-in. A phi source is live-out of the predecessor
/// that supplies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Liveness {
    live_in: Vec<LiveSet>,
    live_out: Vec<LiveSet>,
}

pub fn analyze(flow_graph: &FlowGraph) -> Liveness {
    Liveness::empty(flow_graph.len()).refine(flow_graph)
}

impl Liveness {
    fn empty(len: usize) -> Self {
        Self {
            live_in: vec![LiveSet::new(); len],
            live_out: vec![LiveSet::new(); len],
        }
    }

    pub fn live_in(&self, block: BlockId) -> &LiveSet {
        &self.live_in[block.index()]
    }

    pub fn live_out(&self, block: BlockId) -> &LiveSet {
        &self.live_out[block.index()]
    }

    /// Iterates the backward dataflow equations from the current sets until
    /// nothing changes. Sets only grow, so this terminates; running it on a
    /// stable result returns the same sets.
    pub fn refine(mut self, flow_graph: &FlowGraph) -> Self {
        let mut rounds = 0;
        loop {
            let mut has_change = false;
            rounds += 1;

            for (id, block) in flow_graph.blocks().rev() {
                let mut new_out: LiveSet = block.exit_uses.iter().copied().collect();
                for succ in flow_graph.succs(id) {
                    new_out.extend(self.live_in[succ.index()].iter().copied());
                }

                let mut new_in = new_out.clone();
                for node in block.nodes.iter().rev() {
                    step_back(&mut new_in, node);
                }
                for def in &block.phi_defs {
                    new_in.remove(def);
                }

                has_change |= self.live_out[id.index()] != new_out;
                has_change |= self.live_in[id.index()] != new_in;
                self.live_out[id.index()] = new_out;
                self.live_in[id.index()] = new_in;
            }

            if !has_change {
                break;
            }
        }
        log::trace!("liveness converged after {} round(s)", rounds);

        self
    }

    /// Walks `block` backwards, handing each node the set of values live
    /// right after it.
    pub fn walk_backward<F>(&self, flow_graph: &FlowGraph, block: BlockId, mut f: F) -> LiveSet
    where
        F: FnMut(&Node, &LiveSet),
    {
        let mut live = self.live_out(block).clone();
        for node in flow_graph.block(block).nodes.iter().rev() {
            f(node, &live);
            step_back(&mut live, node);
        }
        live
    }
}

fn step_back(live: &mut LiveSet, node: &Node) {
    for def in node.defs() {
        live.remove(def);
    }
    live.extend(node.uses().iter().copied());
}
