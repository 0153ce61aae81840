use std::{
    collections::{BTreeSet, HashMap},
    fmt::Display,
};

use strum::{EnumIter, EnumString};
use thiserror::Error;

use crate::{
    frame::{Register, TargetDescriptor},
    ir::{Function, ValueId},
    profile::Profile,
};

use super::{color, flow::FlowGraph, linear_scan, liveness};

/// Where a value lives for its whole lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Register(Register),
    /// Byte offset inside the spill area.
    Stack(u32),
}

impl Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Location::Register(reg) => write!(f, "{}", reg),
            Location::Stack(offset) => write!(f, "spill[{}]", offset),
        }
    }
}

/// Result of register allocation, the only thing a code generator needs
/// to know about it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    locations: HashMap<ValueId, Location>,
    spill_size: u32,
}

impl Allocation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self, value: ValueId, location: Location) {
        if let Location::Stack(offset) = location {
            self.spill_size = self.spill_size.max(offset + 8);
        }
        self.locations.insert(value, location);
    }

    /// Hands out a fresh 8-byte slot.
    pub fn spill_slot(&self) -> Location {
        Location::Stack(self.spill_size)
    }

    pub fn location(&self, value: ValueId) -> Option<Location> {
        self.locations.get(&value).copied()
    }

    pub fn spill_size(&self) -> u32 {
        self.spill_size
    }

    pub fn registers(&self) -> BTreeSet<Register> {
        self.locations
            .values()
            .filter_map(|location| match location {
                Location::Register(reg) => Some(*reg),
                Location::Stack(_) => None,
            })
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (ValueId, Location)> + '_ {
        self.locations.iter().map(|(value, location)| (*value, *location))
    }

    pub fn len(&self) -> usize {
        self.locations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }
}

impl Display for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut entries: Vec<_> = self.iter().collect();
        entries.sort();
        for (value, location) in entries {
            writeln!(f, "{} -> {}", value, location)?;
        }
        write!(f, "spill area: {} bytes", self.spill_size)
    }
}

impl PartialOrd for Location {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Location {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self, other) {
            (Location::Register(a), Location::Register(b)) => a.cmp(b),
            (Location::Register(_), Location::Stack(_)) => std::cmp::Ordering::Less,
            (Location::Stack(_), Location::Register(_)) => std::cmp::Ordering::Greater,
            (Location::Stack(a), Location::Stack(b)) => a.cmp(b),
        }
    }
}

/// Register allocation strategy, chosen per compilation unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, EnumIter, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum Strategy {
    /// Fast, single pass.
    LinearScan,
    /// Chaitin-style coloring with coalescing.
    GraphColoring,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("function {function}: no allocatable registers on {arch}")]
    RegisterExhaustion { function: String, arch: String },
}

pub fn alloc(
    func: &Function,
    target: &TargetDescriptor,
    strategy: Strategy,
    profile: Option<&Profile>,
) -> Result<Allocation, Error> {
    let flow_graph = FlowGraph::convert(func);
    let liveness = liveness::analyze(&flow_graph);

    let allocation = match strategy {
        Strategy::LinearScan => linear_scan::allocate(func, &flow_graph, &liveness, target)?,
        Strategy::GraphColoring => {
            let spill_cost = match profile {
                Some(profile) => profile.spill_costs(func),
                None => Profile::default().spill_costs(func),
            };
            color::color(&flow_graph, &liveness, spill_cost, target.allocatable)
        }
    };

    log::debug!(
        "{}: {} allocated {} value(s) into {} register(s), {} spill byte(s)",
        func.name(),
        strategy,
        allocation.len(),
        allocation.registers().len(),
        allocation.spill_size()
    );

    Ok(allocation)
}
