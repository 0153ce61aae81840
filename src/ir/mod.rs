mod builder;
mod value;

use std::fmt::Display;

use thiserror::Error;

pub use builder::FunctionBuilder;
pub use value::{Type, Value, ValueId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Xor,
}

impl BinOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinOp::Eq | BinOp::Ne | BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    BinOp {
        dst: Value,
        op: BinOp,
        lhs: Value,
        rhs: Value,
    },
    Call {
        dst: Option<Value>,
        callee: String,
        args: Vec<Value>,
    },
    /// Copies `src` into `dst`. With a non-constant source this is a
    /// register-to-register move and a coalescing candidate.
    Load { dst: Value, src: Value },
    /// Writes `src` to the memory `addr` points at.
    Store { addr: Value, src: Value },
}

impl Instruction {
    /// The value written, if any.
    pub fn dst(&self) -> Option<Value> {
        match self {
            Instruction::BinOp { dst, .. } | Instruction::Load { dst, .. } => Some(*dst),
            Instruction::Call { dst, .. } => *dst,
            Instruction::Store { .. } => None,
        }
    }

    pub fn def(&self) -> Option<ValueId> {
        self.dst().and_then(|dst| dst.id())
    }

    pub fn operands(&self) -> Vec<Value> {
        match self {
            Instruction::BinOp { lhs, rhs, .. } => vec![*lhs, *rhs],
            Instruction::Call { args, .. } => args.clone(),
            Instruction::Load { src, .. } => vec![*src],
            Instruction::Store { addr, src } => vec![*addr, *src],
        }
    }

    pub fn uses(&self) -> Vec<ValueId> {
        self.operands().iter().filter_map(Value::id).collect()
    }

    pub fn is_move(&self) -> bool {
        matches!(self, Instruction::Load { src, .. } if !src.is_constant())
    }
}

impl Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Instruction::BinOp { dst, op, lhs, rhs } => {
                write!(f, "{} = {} {}, {}", dst, op, lhs, rhs)
            }
            Instruction::Call { dst, callee, args } => {
                if let Some(dst) = dst {
                    write!(f, "{} = ", dst)?;
                }
                write!(f, "call {}(", callee)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
            Instruction::Load { dst, src } => write!(f, "{} = load {}", dst, src),
            Instruction::Store { addr, src } => write!(f, "store {}, [{}]", src, addr),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminator {
    Return(Option<Value>),
    Branch(BlockId),
    CondBranch {
        cond: Value,
        then_block: BlockId,
        else_block: BlockId,
    },
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Return(_) => vec![],
            Terminator::Branch(target) => vec![*target],
            Terminator::CondBranch {
                then_block,
                else_block,
                ..
            } => {
                if then_block == else_block {
                    vec![*then_block]
                } else {
                    vec![*then_block, *else_block]
                }
            }
        }
    }

    pub fn uses(&self) -> Vec<ValueId> {
        match self {
            Terminator::Return(value) => value.and_then(|v| v.id()).into_iter().collect(),
            Terminator::Branch(_) => vec![],
            Terminator::CondBranch { cond, .. } => cond.id().into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Phi {
    pub dst: Value,
    pub sources: Vec<(BlockId, Value)>,
}

impl Phi {
    pub fn source_for(&self, pred: BlockId) -> Option<Value> {
        self.sources
            .iter()
            .find(|(block, _)| *block == pred)
            .map(|(_, value)| *value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(usize);

impl BlockId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// A basic block. Predecessor and successor lists are derived when the
/// function is built and cannot be edited afterwards.
#[derive(Debug, Clone)]
pub struct BasicBlock {
    id: BlockId,
    label: String,
    phis: Vec<Phi>,
    instructions: Vec<Instruction>,
    terminator: Terminator,
    preds: Vec<BlockId>,
    succs: Vec<BlockId>,
}

impl BasicBlock {
    pub fn id(&self) -> BlockId {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn phis(&self) -> &[Phi] {
        &self.phis
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn terminator(&self) -> &Terminator {
        &self.terminator
    }

    pub fn preds(&self) -> &[BlockId] {
        &self.preds
    }

    pub fn succs(&self) -> &[BlockId] {
        &self.succs
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    name: String,
    params: Vec<Value>,
    ret: Option<Type>,
    blocks: Vec<BasicBlock>,
    value_count: u32,
}

impl Function {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn ret(&self) -> Option<Type> {
        self.ret
    }

    pub fn blocks(&self) -> &[BasicBlock] {
        &self.blocks
    }

    pub fn block(&self, id: BlockId) -> &BasicBlock {
        &self.blocks[id.0]
    }

    pub fn entry(&self) -> &BasicBlock {
        &self.blocks[0]
    }

    /// Upper bound (exclusive) of the `ValueId`s used in this function.
    pub fn value_count(&self) -> usize {
        self.value_count as usize
    }

    /// Every value with a definition: parameters, phi destinations and
    /// instruction results, in program order.
    pub fn defined_values(&self) -> Vec<ValueId> {
        let mut values: Vec<ValueId> = self.params.iter().filter_map(Value::id).collect();
        for block in &self.blocks {
            values.extend(block.phis.iter().filter_map(|phi| phi.dst.id()));
            values.extend(block.instructions.iter().filter_map(Instruction::def));
        }
        values
    }
}

impl Display for Function {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fn {}(", self.name)?;
        for (i, param) in self.params.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}: {}", param, param.ty())?;
        }
        write!(f, ")")?;
        if let Some(ret) = self.ret {
            write!(f, " -> {}", ret)?;
        }
        writeln!(f, " {{")?;
        for block in &self.blocks {
            writeln!(f, "{}:", block.label)?;
            for phi in &block.phis {
                write!(f, "    {} = phi", phi.dst)?;
                for (pred, value) in &phi.sources {
                    write!(f, " [{}: {}]", self.blocks[pred.0].label, value)?;
                }
                writeln!(f)?;
            }
            for instruction in &block.instructions {
                writeln!(f, "    {}", instruction)?;
            }
            match &block.terminator {
                Terminator::Return(Some(value)) => writeln!(f, "    ret {}", value)?,
                Terminator::Return(None) => writeln!(f, "    ret")?,
                Terminator::Branch(target) => {
                    writeln!(f, "    br {}", self.blocks[target.0].label)?
                }
                Terminator::CondBranch {
                    cond,
                    then_block,
                    else_block,
                } => writeln!(
                    f,
                    "    br {}, {}, {}",
                    cond, self.blocks[then_block.0].label, self.blocks[else_block.0].label
                )?,
            }
        }
        write!(f, "}}")
    }
}

#[derive(Debug, Clone, Default)]
pub struct Program {
    functions: Vec<Function>,
}

impl Program {
    pub fn new(functions: Vec<Function>) -> Self {
        Self { functions }
    }

    pub fn push(&mut self, function: Function) {
        self.functions.push(function);
    }

    pub fn functions(&self) -> &[Function] {
        &self.functions
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("function {0} has no blocks")]
    NoBlocks(String),
    #[error("function {function}: block `{block}` has no terminator")]
    Unterminated { function: String, block: String },
    #[error("`{name}` is not a valid symbol name")]
    InvalidName { name: String },
    #[error("function {function}: duplicate block label `{block}`")]
    DuplicateLabel { function: String, block: String },
    #[error("function {function}: branch to unknown block {target}")]
    UnknownBlock { function: String, target: BlockId },
    #[error("function {function}: the entry block cannot be a branch target")]
    EntryHasPredecessors { function: String },
    #[error("function {function}: phi {phi} in `{block}` does not match the block's predecessors")]
    PhiMismatch {
        function: String,
        block: String,
        phi: Value,
    },
    #[error("function {function}: `{instruction}` writes to a constant")]
    ConstantDestination {
        function: String,
        instruction: Instruction,
    },
    #[error("function {function}: {value} is defined more than once")]
    Redefined { function: String, value: ValueId },
    #[error("function {function}: {value} is used but never defined")]
    Undefined { function: String, value: ValueId },
}
