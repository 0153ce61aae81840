use std::collections::{BTreeSet, HashSet};

use super::{
    BasicBlock, BinOp, BlockId, Error, Function, Instruction, Phi, Terminator, Type, Value,
    ValueId,
};

struct BlockData {
    label: String,
    phis: Vec<Phi>,
    instructions: Vec<Instruction>,
    terminator: Option<Terminator>,
}

/// Incremental constructor for [`Function`].
///
/// The first block created is the entry block. Value ids are allocated
/// densely per function, so two builders never share state.
pub struct FunctionBuilder {
    name: String,
    ret: Option<Type>,
    params: Vec<Value>,
    blocks: Vec<BlockData>,
    next_id: u32,
}

impl FunctionBuilder {
    pub fn new(name: impl Into<String>, ret: Option<Type>) -> Self {
        Self {
            name: name.into(),
            ret,
            params: Vec::new(),
            blocks: Vec::new(),
            next_id: 0,
        }
    }

    fn fresh(&mut self) -> ValueId {
        let id = ValueId::new_with(self.next_id);
        self.next_id += 1;
        id
    }

    pub fn param(&mut self, ty: Type) -> Value {
        let value = Value::Parameter {
            id: self.fresh(),
            index: self.params.len(),
            ty,
        };
        self.params.push(value);
        value
    }

    pub fn temp(&mut self, ty: Type) -> Value {
        Value::Temporary {
            id: self.fresh(),
            ty,
        }
    }

    pub fn block(&mut self, label: impl Into<String>) -> BlockId {
        self.blocks.push(BlockData {
            label: label.into(),
            phis: Vec::new(),
            instructions: Vec::new(),
            terminator: None,
        });
        BlockId(self.blocks.len() - 1)
    }

    pub fn push(&mut self, block: BlockId, instruction: Instruction) {
        self.blocks[block.0].instructions.push(instruction);
    }

    pub fn binop(&mut self, block: BlockId, op: BinOp, lhs: Value, rhs: Value) -> Value {
        let ty = if op.is_comparison() {
            Type::Bool
        } else {
            lhs.ty()
        };
        let dst = self.temp(ty);
        self.push(block, Instruction::BinOp { dst, op, lhs, rhs });
        dst
    }

    pub fn call(
        &mut self,
        block: BlockId,
        callee: impl Into<String>,
        args: Vec<Value>,
        ret: Option<Type>,
    ) -> Option<Value> {
        let dst = ret.map(|ty| self.temp(ty));
        self.push(
            block,
            Instruction::Call {
                dst,
                callee: callee.into(),
                args,
            },
        );
        dst
    }

    pub fn load(&mut self, block: BlockId, src: Value) -> Value {
        let dst = self.temp(src.ty());
        self.push(block, Instruction::Load { dst, src });
        dst
    }

    pub fn store(&mut self, block: BlockId, addr: Value, src: Value) {
        self.push(block, Instruction::Store { addr, src });
    }

    /// Adds a phi to `block`. Sources can be given later with
    /// [`add_phi_source`](Self::add_phi_source) when they are defined
    /// after the phi (loops).
    pub fn phi(&mut self, block: BlockId, ty: Type, sources: Vec<(BlockId, Value)>) -> Value {
        let dst = self.temp(ty);
        self.blocks[block.0].phis.push(Phi { dst, sources });
        dst
    }

    pub fn add_phi_source(&mut self, block: BlockId, phi: Value, pred: BlockId, src: Value) {
        if let Some(phi) = self.blocks[block.0]
            .phis
            .iter_mut()
            .find(|candidate| candidate.dst == phi)
        {
            phi.sources.push((pred, src));
        }
    }

    pub fn terminate(&mut self, block: BlockId, terminator: Terminator) {
        self.blocks[block.0].terminator = Some(terminator);
    }

    pub fn ret(&mut self, block: BlockId, value: Option<Value>) {
        self.terminate(block, Terminator::Return(value));
    }

    pub fn branch(&mut self, block: BlockId, target: BlockId) {
        self.terminate(block, Terminator::Branch(target));
    }

    pub fn cond_branch(
        &mut self,
        block: BlockId,
        cond: Value,
        then_block: BlockId,
        else_block: BlockId,
    ) {
        self.terminate(
            block,
            Terminator::CondBranch {
                cond,
                then_block,
                else_block,
            },
        );
    }

    pub fn build(self) -> Result<Function, Error> {
        let function = self.name.clone();
        if !is_symbol(&function) || function.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(Error::InvalidName { name: function });
        }
        if self.blocks.is_empty() {
            return Err(Error::NoBlocks(function));
        }

        let mut labels = HashSet::new();
        for data in &self.blocks {
            if !is_symbol(&data.label) {
                return Err(Error::InvalidName {
                    name: data.label.clone(),
                });
            }
            if !labels.insert(data.label.as_str()) {
                return Err(Error::DuplicateLabel {
                    function,
                    block: data.label.clone(),
                });
            }
        }

        let mut terminators = Vec::with_capacity(self.blocks.len());
        for data in &self.blocks {
            let terminator = data.terminator.clone().ok_or_else(|| Error::Unterminated {
                function: function.clone(),
                block: data.label.clone(),
            })?;
            for target in terminator.successors() {
                if target.0 >= self.blocks.len() {
                    return Err(Error::UnknownBlock {
                        function: function.clone(),
                        target,
                    });
                }
            }
            terminators.push(terminator);
        }

        let succs: Vec<Vec<BlockId>> = terminators.iter().map(Terminator::successors).collect();
        let mut preds = vec![Vec::new(); self.blocks.len()];
        for (from, targets) in succs.iter().enumerate() {
            for to in targets {
                preds[to.0].push(BlockId(from));
            }
        }
        if !preds[0].is_empty() {
            return Err(Error::EntryHasPredecessors { function });
        }

        let mut defined = HashSet::new();
        let mut define = |value: Option<ValueId>| -> Result<(), Error> {
            match value {
                Some(id) if !defined.insert(id) => Err(Error::Redefined {
                    function: function.clone(),
                    value: id,
                }),
                _ => Ok(()),
            }
        };
        for param in &self.params {
            define(param.id())?;
        }
        for (index, data) in self.blocks.iter().enumerate() {
            let expected: BTreeSet<BlockId> = preds[index].iter().copied().collect();
            for phi in &data.phis {
                let given: BTreeSet<BlockId> = phi.sources.iter().map(|(b, _)| *b).collect();
                if given != expected || phi.sources.len() != expected.len() {
                    return Err(Error::PhiMismatch {
                        function: function.clone(),
                        block: data.label.clone(),
                        phi: phi.dst,
                    });
                }
                define(phi.dst.id())?;
            }
            for instruction in &data.instructions {
                if instruction.dst().map_or(false, |dst| dst.is_constant()) {
                    return Err(Error::ConstantDestination {
                        function: function.clone(),
                        instruction: instruction.clone(),
                    });
                }
                define(instruction.def())?;
            }
        }

        let mut used = Vec::new();
        for (data, terminator) in self.blocks.iter().zip(&terminators) {
            for phi in &data.phis {
                used.extend(phi.sources.iter().filter_map(|(_, v)| v.id()));
            }
            for instruction in &data.instructions {
                used.extend(instruction.uses());
            }
            used.extend(terminator.uses());
        }
        if let Some(value) = used.into_iter().find(|id| !defined.contains(id)) {
            return Err(Error::Undefined { function, value });
        }

        let blocks = self
            .blocks
            .into_iter()
            .zip(terminators)
            .zip(succs.into_iter().zip(preds))
            .enumerate()
            .map(|(index, ((data, terminator), (succs, preds)))| BasicBlock {
                id: BlockId(index),
                label: data.label,
                phis: data.phis,
                instructions: data.instructions,
                terminator,
                preds,
                succs,
            })
            .collect();

        Ok(Function {
            name: self.name,
            params: self.params,
            ret: self.ret,
            blocks,
            value_count: self.next_id,
        })
    }
}

/// Function names and block labels end up in assembler labels.
fn is_symbol(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}
