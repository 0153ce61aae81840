//! Runtime profile consumed by block layout and spill selection.
//!
//! A profile only steers heuristics. Every layout and every spill choice it
//! produces is as correct as the default one.

use std::collections::{HashMap, HashSet};

use crate::ir::{BlockId, Function, Instruction, Terminator, ValueId};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Profile {
    /// Block label -> execution count.
    pub hot_blocks: HashMap<String, u64>,
    /// Block label -> probability that its conditional branch is taken.
    pub branch_weights: HashMap<String, f64>,
    /// Callee name -> call count.
    pub call_frequency: HashMap<String, u64>,
}

impl Profile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_hot_block(mut self, label: impl Into<String>, count: u64) -> Self {
        self.hot_blocks.insert(label.into(), count);
        self
    }

    pub fn with_branch_weight(mut self, label: impl Into<String>, taken: f64) -> Self {
        self.branch_weights.insert(label.into(), taken);
        self
    }

    pub fn with_call_frequency(mut self, callee: impl Into<String>, count: u64) -> Self {
        self.call_frequency.insert(callee.into(), count);
        self
    }

    fn hotness(&self, label: &str) -> u64 {
        self.hot_blocks.get(label).copied().unwrap_or(0)
    }

    /// Emission order of the blocks of `func`.
    ///
    /// The entry block stays first. After a block whose conditional branch
    /// is likely taken, its true successor follows so the hot path falls
    /// through; otherwise the hottest remaining block comes next.
    pub fn layout(&self, func: &Function) -> Vec<BlockId> {
        let mut remaining: Vec<BlockId> = func.blocks().iter().skip(1).map(|b| b.id()).collect();
        // stable: equally hot blocks keep their original order
        remaining.sort_by_key(|id| std::cmp::Reverse(self.hotness(func.block(*id).label())));

        let mut order = vec![func.entry().id()];
        let mut placed: HashSet<BlockId> = order.iter().copied().collect();

        while order.len() < func.blocks().len() {
            let last = func.block(order[order.len() - 1]);
            let likely = match last.terminator() {
                Terminator::CondBranch { then_block, .. } => self
                    .branch_weights
                    .get(last.label())
                    .filter(|weight| **weight > 0.5)
                    .map(|_| *then_block),
                _ => None,
            };

            let next = match likely.filter(|id| !placed.contains(id)) {
                Some(next) => next,
                None => match remaining.iter().copied().find(|id| !placed.contains(id)) {
                    Some(next) => next,
                    None => break,
                },
            };
            placed.insert(next);
            order.push(next);
        }

        order
    }

    /// Profile-weighted number of defs and uses of every value. A value
    /// used in a hot block or passed to a frequently called function costs
    /// more to spill.
    pub fn spill_costs(&self, func: &Function) -> HashMap<ValueId, u64> {
        let mut costs: HashMap<ValueId, u64> = HashMap::new();
        for param in func.params().iter().filter_map(|p| p.id()) {
            *costs.entry(param).or_default() += 1;
        }

        for block in func.blocks() {
            let weight = self.hotness(block.label()).max(1);
            let mut charge = |value: ValueId, times: u64| {
                *costs.entry(value).or_default() += weight.saturating_mul(times);
            };

            for phi in block.phis() {
                if let Some(dst) = phi.dst.id() {
                    charge(dst, 1);
                }
                for src in phi.sources.iter().filter_map(|(_, v)| v.id()) {
                    charge(src, 1);
                }
            }
            for instruction in block.instructions() {
                if let Some(def) = instruction.def() {
                    charge(def, 1);
                }
                let times = match instruction {
                    Instruction::Call { callee, .. } => {
                        self.call_frequency.get(callee).copied().unwrap_or(1).max(1)
                    }
                    _ => 1,
                };
                for used in instruction.uses() {
                    charge(used, times);
                }
            }
            for used in block.terminator().uses() {
                charge(used, 1);
            }
        }

        costs
    }
}
