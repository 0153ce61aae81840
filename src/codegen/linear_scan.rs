use std::collections::{BTreeMap, BTreeSet};

use crate::{
    frame::TargetDescriptor,
    ir::{Function, ValueId},
};

use super::{
    flow::FlowGraph,
    liveness::Liveness,
    reg_alloc::{Allocation, Error, Location},
};

/// `[start, end]` in instruction positions. Positions advance by two per
/// instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Interval {
    value: ValueId,
    start: usize,
    end: usize,
}

/// Numbers every block and instruction in function order and returns one
/// conservative interval per value.
fn build_intervals(flow_graph: &FlowGraph, liveness: &Liveness) -> Vec<Interval> {
    let mut ranges: BTreeMap<ValueId, (usize, usize)> = BTreeMap::new();
    let mut touch = |value: ValueId, pos: usize| {
        let range = ranges.entry(value).or_insert((pos, pos));
        range.0 = range.0.min(pos);
        range.1 = range.1.max(pos);
    };

    for param in flow_graph.params() {
        touch(*param, 0);
    }

    let mut pos = 0;
    for (id, block) in flow_graph.blocks() {
        let block_start = pos;
        for value in liveness.live_in(id) {
            touch(*value, block_start);
        }
        for def in &block.phi_defs {
            touch(*def, block_start);
        }

        for node in &block.nodes {
            pos += 2;
            for value in node.defs().iter().chain(node.uses()) {
                touch(*value, pos);
            }
        }

        let block_end = pos + 1;
        for value in liveness.live_out(id) {
            touch(*value, block_end);
        }
        pos = block_end + 1;
    }

    let mut intervals: Vec<Interval> = ranges
        .into_iter()
        .map(|(value, (start, end))| Interval { value, start, end })
        .collect();
    intervals.sort_by_key(|interval| (interval.start, interval.value));
    intervals
}

/// Linear scan in the style of Poletto and Sarkar. Intervals are visited in
/// order of their start; when no register is free the interval that ends
/// last goes to the stack.
pub fn allocate(
    func: &Function,
    flow_graph: &FlowGraph,
    liveness: &Liveness,
    target: &TargetDescriptor,
) -> Result<Allocation, Error> {
    let pool = target.allocatable;
    if pool.is_empty() {
        return Err(Error::RegisterExhaustion {
            function: func.name().to_string(),
            arch: target.arch.to_string(),
        });
    }

    let mut allocation = Allocation::new();
    let mut free: BTreeSet<usize> = (0..pool.len()).collect();
    // sorted by end point
    let mut active: Vec<(Interval, usize)> = Vec::new();

    for current in build_intervals(flow_graph, liveness) {
        expire_old_intervals(&mut active, &mut free, current.start);

        if let Some(reg) = free.iter().next().copied() {
            free.remove(&reg);
            allocation.assign(current.value, Location::Register(pool[reg]));
            insert_active(&mut active, current, reg);
            continue;
        }

        match active.last().copied() {
            Some((spill, reg)) if spill.end > current.end => {
                log::trace!("{}: evicting {} for {}", func.name(), spill.value, current.value);
                active.pop();
                let slot = allocation.spill_slot();
                allocation.assign(spill.value, slot);
                allocation.assign(current.value, Location::Register(pool[reg]));
                insert_active(&mut active, current, reg);
            }
            _ => {
                log::trace!("{}: spilling {}", func.name(), current.value);
                let slot = allocation.spill_slot();
                allocation.assign(current.value, slot);
            }
        }
    }

    Ok(allocation)
}

fn expire_old_intervals(active: &mut Vec<(Interval, usize)>, free: &mut BTreeSet<usize>, pos: usize) {
    active.retain(|(interval, reg)| {
        if interval.end < pos {
            free.insert(*reg);
            false
        } else {
            true
        }
    });
}

fn insert_active(active: &mut Vec<(Interval, usize)>, interval: Interval, reg: usize) {
    let at = active.partition_point(|(other, _)| other.end <= interval.end);
    active.insert(at, (interval, reg));
}
