//! Chaitin-style graph coloring.
//!
//! Build, coalesce, simplify, select, assign. Coalesced nodes stay in the
//! arena with an `alias` pointing at the node they were merged into, so a
//! value's final location is the location of its representative.

use std::collections::{BTreeSet, HashMap, HashSet};

use itertools::Itertools;

use crate::{frame::Register, ir::ValueId};

use super::{
    flow::FlowGraph,
    graph::{Graph, ID},
    liveness::Liveness,
    reg_alloc::{Allocation, Location},
};

type SpillCost = HashMap<ValueId, u64>;
type Degree = HashMap<ID, usize>;
type SimplifyWorkList = Vec<ID>;
type SpillWorkList = BTreeSet<ID>;
type SelectStack = Vec<ID>;
type Colors = HashMap<ID, usize>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub value: ValueId,
    /// Set once this node has been coalesced into another.
    pub alias: Option<ID>,
}

pub struct Interference {
    graph: Graph<Node>,
    value2id: HashMap<ValueId, ID>,
    moves: Vec<(ValueId, ValueId)>, // (dst, src)
}

impl Interference {
    fn new() -> Self {
        Self {
            graph: Graph::new(),
            value2id: HashMap::new(),
            moves: Vec::new(),
        }
    }

    pub fn build(flow_graph: &FlowGraph, liveness: &Liveness) -> Self {
        let mut interference = Self::new();

        // Parameters are all written by the prologue, dead or not.
        let params = flow_graph.params();
        for (i, param) in params.iter().enumerate() {
            interference.node(*param);
            for other in &params[..i] {
                interference.add_edge(*param, *other);
            }
        }

        for (block_id, block) in flow_graph.blocks() {
            let live_at_start = liveness.walk_backward(flow_graph, block_id, |node, live| {
                let is_move_src = |value: &ValueId| node.is_move && node.uses().contains(value);
                for def in node.defs() {
                    interference.node(*def);
                    for live in live.iter().filter(|v| !is_move_src(v)) {
                        interference.add_edge(*def, *live);
                    }
                }
                if node.is_move {
                    if let (Some(dst), Some(src)) = (node.defs().first(), node.uses().first()) {
                        interference.moves.push((*dst, *src));
                    }
                }
            });

            for (i, def) in block.phi_defs.iter().enumerate() {
                interference.node(*def);
                for other in &block.phi_defs[..i] {
                    interference.add_edge(*def, *other);
                }
                for live in &live_at_start {
                    interference.add_edge(*def, *live);
                }
            }

            if block_id.index() == 0 {
                for param in params {
                    for live in &live_at_start {
                        interference.add_edge(*param, *live);
                    }
                }
            }
        }

        interference
    }

    /// Graph with the given nodes and edges and no moves.
    #[cfg(test)]
    pub fn from_edges(values: &[ValueId], edges: &[(ValueId, ValueId)]) -> Self {
        let mut interference = Self::new();
        for value in values {
            interference.node(*value);
        }
        for (one, other) in edges {
            interference.add_edge(*one, *other);
        }
        interference
    }

    fn node(&mut self, value: ValueId) -> ID {
        if let Some(id) = self.value2id.get(&value) {
            return *id;
        }
        let id = self.graph.insert(Node { value, alias: None });
        self.value2id.insert(value, id);
        id
    }

    fn add_edge(&mut self, one: ValueId, other: ValueId) {
        if one == other {
            return;
        }
        let one = self.node(one);
        let other = self.node(other);
        self.graph.double_link(one, other);
    }

    fn find(&self, mut id: ID) -> ID {
        while let Some(alias) = self.graph.get(id).val().alias {
            id = alias;
        }
        id
    }

    fn degree(&self, id: ID) -> usize {
        self.graph.get(id).adj().len()
    }

    #[cfg(test)]
    pub fn interferes(&self, one: ValueId, other: ValueId) -> bool {
        match (self.value2id.get(&one), self.value2id.get(&other)) {
            (Some(one), Some(other)) => self.graph.is_linked(self.find(*one), self.find(*other)),
            _ => false,
        }
    }

    /// Every edge of the graph as value pairs, representatives resolved.
    #[cfg(test)]
    pub fn edges(&self) -> Vec<(ValueId, ValueId)> {
        self.graph
            .nodes()
            .iter()
            .flat_map(|node| {
                node.adj()
                    .iter()
                    .filter(move |other| node.id() < **other)
                    .map(move |other| (node.val().value, self.graph.get(*other).val().value))
            })
            .collect()
    }

    /// Merges move-related nodes that do not interfere when their combined
    /// degree stays below `k`. Returns the number of merges.
    pub fn coalesce(&mut self, k: usize) -> usize {
        let mut merged = 0;
        for (dst, src) in self.moves.clone() {
            let (Some(dst), Some(src)) = (self.value2id.get(&dst), self.value2id.get(&src)) else {
                continue;
            };
            let keep = self.find(*dst);
            let gone = self.find(*src);
            if keep == gone || self.graph.is_linked(keep, gone) {
                continue;
            }
            if self.degree(keep) + self.degree(gone) >= k {
                continue;
            }

            let neighbours: Vec<ID> = self.graph.get(gone).adj().iter().copied().collect();
            for neighbour in neighbours {
                self.graph.double_unlink(gone, neighbour);
                self.graph.double_link(keep, neighbour);
            }
            self.graph.get_mut(gone).val_mut().alias = Some(keep);
            log::trace!(
                "coalesced {} into {}",
                self.graph.get(gone).val().value,
                self.graph.get(keep).val().value
            );
            merged += 1;
        }
        merged
    }

    fn representatives(&self) -> impl Iterator<Item = ID> + '_ {
        self.graph
            .nodes()
            .iter()
            .filter(|node| node.val().alias.is_none())
            .map(|node| node.id())
    }
}

pub fn color(
    flow_graph: &FlowGraph,
    liveness: &Liveness,
    spill_cost: SpillCost,
    registers: &[Register],
) -> Allocation {
    let mut interference = Interference::build(flow_graph, liveness);
    let merged = interference.coalesce(registers.len());
    log::debug!("coalesced {} move(s)", merged);
    color_graph(&interference, &spill_cost, registers)
}

/// Simplify, select and assign on an already built (and possibly
/// coalesced) graph.
pub fn color_graph(
    interference: &Interference,
    spill_cost: &SpillCost,
    registers: &[Register],
) -> Allocation {
    let k = registers.len();
    let select_stack = simplify_all(interference, spill_cost, k);
    let (colors, spills) = assign_colors(interference, &select_stack, k);

    let slots: HashMap<ID, Location> = spills
        .iter()
        .enumerate()
        .map(|(i, id)| (*id, Location::Stack(i as u32 * 8)))
        .collect();

    let mut allocation = Allocation::new();
    for node in interference.graph.nodes() {
        let representative = interference.find(node.id());
        let location = match colors.get(&representative) {
            Some(color) => Location::Register(registers[*color]),
            None => slots[&representative],
        };
        allocation.assign(node.val().value, location);
    }
    allocation
}

fn simplify_all(interference: &Interference, spill_cost: &SpillCost, k: usize) -> SelectStack {
    let mut degree: Degree = interference
        .representatives()
        .map(|id| (id, interference.degree(id)))
        .collect();
    let (mut simplify_worklist, mut spill_worklist) =
        make_work_list(interference.representatives(), &degree, k);

    let mut select_stack = SelectStack::new();
    let mut on_stack = HashSet::new();
    loop {
        if !simplify_worklist.is_empty() {
            simplify(
                interference,
                &mut select_stack,
                &mut on_stack,
                &mut simplify_worklist,
                &mut spill_worklist,
                &mut degree,
                k,
            );
        } else if !spill_worklist.is_empty() {
            select_spill(
                interference,
                spill_cost,
                &degree,
                &mut spill_worklist,
                &mut simplify_worklist,
            );
        }

        if simplify_worklist.is_empty() && spill_worklist.is_empty() {
            break;
        }
    }

    select_stack
}

fn make_work_list(
    initial: impl Iterator<Item = ID>,
    degree: &Degree,
    k: usize,
) -> (SimplifyWorkList, SpillWorkList) {
    let mut simplify_work_list = SimplifyWorkList::new();
    let mut spill_work_list = SpillWorkList::new();
    for id in initial {
        if degree[&id] < k {
            simplify_work_list.push(id);
        } else {
            spill_work_list.insert(id);
        }
    }
    // pop() takes the lowest id first
    simplify_work_list.reverse();

    (simplify_work_list, spill_work_list)
}

fn simplify(
    interference: &Interference,
    select_stack: &mut SelectStack,
    on_stack: &mut HashSet<ID>,
    simplify_worklist: &mut SimplifyWorkList,
    spill_worklist: &mut SpillWorkList,
    degree: &mut Degree,
    k: usize,
) {
    let Some(id) = simplify_worklist.pop() else {
        return;
    };
    select_stack.push(id);
    on_stack.insert(id);
    log::trace!("simplify {}", interference.graph.get(id).val().value);

    let adjacent: Vec<ID> = interference
        .graph
        .get(id)
        .adj()
        .iter()
        .filter(|adj| !on_stack.contains(adj))
        .copied()
        .collect();
    for adj in adjacent {
        decrement_degree(adj, k, degree, simplify_worklist, spill_worklist);
    }
}

fn decrement_degree(
    id: ID,
    k: usize,
    degree: &mut Degree,
    simplify_worklist: &mut SimplifyWorkList,
    spill_worklist: &mut SpillWorkList,
) {
    let Some(deg) = degree.get_mut(&id) else {
        return;
    };
    let old_deg = *deg;
    *deg = deg.saturating_sub(1);

    if old_deg == k && spill_worklist.remove(&id) {
        simplify_worklist.push(id);
    }
}

/// Optimistically pushes the highest-degree node. Ties go to the cheaper
/// value to spill.
fn select_spill(
    interference: &Interference,
    spill_cost: &SpillCost,
    degree: &Degree,
    spill_worklist: &mut SpillWorkList,
    simplify_worklist: &mut SimplifyWorkList,
) {
    let cost = |id: &ID| {
        spill_cost
            .get(&interference.graph.get(*id).val().value)
            .copied()
            .unwrap_or(0)
    };
    let candidate = spill_worklist
        .iter()
        .copied()
        .sorted_by(|a, b| {
            degree[b]
                .cmp(&degree[a])
                .then_with(|| cost(a).cmp(&cost(b)))
                .then_with(|| a.cmp(b))
        })
        .next();

    if let Some(id) = candidate {
        log::trace!(
            "potential spill {} (degree {})",
            interference.graph.get(id).val().value,
            degree[&id]
        );
        spill_worklist.remove(&id);
        simplify_worklist.push(id);
    }
}

fn assign_colors(
    interference: &Interference,
    select_stack: &SelectStack,
    k: usize,
) -> (Colors, Vec<ID>) {
    let mut colors = Colors::new();
    let mut spills = Vec::new();

    for id in select_stack.iter().rev() {
        let taken: HashSet<usize> = interference
            .graph
            .get(*id)
            .adj()
            .iter()
            .filter_map(|adj| colors.get(adj).copied())
            .collect();

        match (0..k).find(|color| !taken.contains(color)) {
            Some(color) => {
                colors.insert(*id, color);
            }
            None => spills.push(*id),
        }
    }
    spills.sort();

    (colors, spills)
}
