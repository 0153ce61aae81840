use thiserror::Error;

use crate::{
    asm::{Assembly, Line},
    frame::{Arch, Frame, Register, TargetDescriptor},
    ir::{BinOp, BlockId, Function, Instruction, Terminator, Type, Value, ValueId},
};
use reg_alloc::{Allocation, Location};

pub mod amd64;
pub mod arm64;
pub(super) mod color;
pub(super) mod flow;
mod graph;
pub(super) mod linear_scan;
pub(super) mod liveness;
pub mod peephole;
pub mod reg_alloc;
pub mod riscv64;

/// Where an instruction finds one of its operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    Immediate(i64),
    Register(Register),
    /// Offset inside the spill area.
    Stack(u32),
}

impl From<Location> for Operand {
    fn from(location: Location) -> Self {
        match location {
            Location::Register(reg) => Operand::Register(reg),
            Location::Stack(slot) => Operand::Stack(slot),
        }
    }
}

/// Switches that change the emitted code but not the allocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Options {
    /// Sign the return address on entry and authenticate it before
    /// returning. Only arm64 has instructions for this.
    pub pointer_auth: bool,
}

/// Per-function emission state. Created fresh for every function and
/// dropped once its assembly is returned.
pub struct Context<'a> {
    func: &'a Function,
    target: &'static TargetDescriptor,
    frame: Frame,
    options: Options,
    lines: Vec<Line>,
}

impl<'a> Context<'a> {
    pub fn name(&self) -> &str {
        self.func.name()
    }

    pub fn target(&self) -> &'static TargetDescriptor {
        self.target
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn options(&self) -> Options {
        self.options
    }

    /// The `index`-th register the target reserves for the code generator.
    pub fn scratch(&self, index: usize) -> Register {
        self.target.scratch[index]
    }

    pub fn emit(&mut self, instruction: impl Into<String>) {
        self.lines.push(Line::Instruction(instruction.into()));
    }

    fn label(&mut self, name: impl Into<String>) {
        self.lines.push(Line::Label(name.into()));
    }

    fn directive(&mut self, text: impl Into<String>) {
        self.lines.push(Line::Directive(text.into()));
    }
}

/// Instruction selection for one ISA. The shared driver in [`generate`]
/// handles parameters, block order, phi resolution and terminators and
/// calls into these hooks for everything that differs between targets.
pub trait Codegen {
    const ARCH: Arch;
    /// Index of the scratch register that holds one value while a cycle of
    /// parallel moves is broken up.
    const CYCLE_SCRATCH: usize;
    /// Stack arguments go to a reserved area at the bottom of the frame
    /// instead of being pushed around the call.
    const RESERVES_OUTGOING: bool;

    fn prologue(ctx: &mut Context);

    /// Restores the saved registers, releases the frame and returns.
    fn epilogue(ctx: &mut Context);

    /// Moves the `index`-th stack-passed parameter into `dst`.
    fn incoming(ctx: &mut Context, index: usize, dst: Operand);

    fn mov(ctx: &mut Context, dst: Operand, src: Operand);

    fn binop(ctx: &mut Context, op: BinOp, dst: Operand, lhs: Operand, rhs: Operand);

    /// Writes `src` to the address held by `addr`.
    fn store(ctx: &mut Context, addr: Operand, src: Operand);

    fn call(ctx: &mut Context, callee: &str, args: &[Operand], dst: Option<Operand>);

    fn jump(ctx: &mut Context, label: &str);

    /// Jumps to `label` when `cond` is nonzero.
    fn branch_if(ctx: &mut Context, cond: Operand, label: &str);
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("function {function}: unsupported instruction `{instruction}`")]
    UnsupportedInstruction {
        function: String,
        instruction: String,
    },
    #[error("function {function}: unsupported terminator `{terminator}`")]
    UnsupportedTerminator {
        function: String,
        terminator: String,
    },
    #[error("function {function}: call to {callee} passes {count} arguments, at most {max} are supported")]
    TooManyArguments {
        function: String,
        callee: String,
        count: usize,
        max: usize,
    },
    #[error("function {function}: {value} has no location")]
    UnallocatedValue { function: String, value: ValueId },
}

/// `.L<function>.<block>`. Names never contain a `.`, so labels of
/// different functions and blocks cannot collide.
pub fn block_label(func: &Function, block: BlockId) -> String {
    format!(".L{}.{}", func.name(), func.block(block).label())
}

fn edge_label(func: &Function, pred: BlockId, succ: BlockId) -> String {
    format!(
        ".L{}.{}.{}.edge",
        func.name(),
        func.block(pred).label(),
        func.block(succ).label()
    )
}

/// Emits `func` in the block order given by `layout`, whose first entry
/// must be the entry block.
pub fn generate<C: Codegen>(
    func: &Function,
    allocation: &Allocation,
    layout: &[BlockId],
    options: Options,
) -> Result<(Assembly, Frame), Error> {
    let target = C::ARCH.target();
    check(func, target)?;

    let outgoing = if C::RESERVES_OUTGOING {
        max_stack_args(func, target)
    } else {
        0
    };
    let frame = Frame::new(target, allocation, outgoing);
    log::debug!("{}: {}", func.name(), frame);

    let mut ctx = Context {
        func,
        target,
        frame,
        options,
        lines: Vec::new(),
    };
    ctx.directive(".text");
    ctx.directive(format!(".globl {}", func.name()));
    ctx.label(func.name());
    C::prologue(&mut ctx);

    let mut moves = Vec::new();
    for (index, param) in func.params().iter().enumerate() {
        let dst = operand(func, allocation, param)?;
        match target.arg_regs.get(index) {
            Some(reg) => moves.push((dst, Operand::Register(*reg))),
            None => C::incoming(&mut ctx, index - target.arg_regs.len(), dst),
        }
    }
    parallel_move::<C>(&mut ctx, moves);

    let mut stubs = Vec::new();
    for (position, id) in layout.iter().copied().enumerate() {
        let block = func.block(id);
        let next = layout.get(position + 1).copied();
        if position > 0 {
            ctx.label(block_label(func, id));
        }

        for instruction in block.instructions() {
            lower::<C>(&mut ctx, allocation, instruction)?;
        }

        match block.terminator() {
            Terminator::Return(value) => {
                if let Some(value) = value {
                    let src = operand(func, allocation, value)?;
                    C::mov(&mut ctx, Operand::Register(target.ret_reg), src);
                }
                C::epilogue(&mut ctx);
            }
            Terminator::Branch(succ) => {
                fall_or_jump::<C>(&mut ctx, allocation, id, *succ, next)?;
            }
            Terminator::CondBranch {
                cond,
                then_block,
                else_block,
            } => match operand(func, allocation, cond)? {
                Operand::Immediate(value) => {
                    let taken = if value != 0 { *then_block } else { *else_block };
                    fall_or_jump::<C>(&mut ctx, allocation, id, taken, next)?;
                }
                _ if then_block == else_block => {
                    fall_or_jump::<C>(&mut ctx, allocation, id, *then_block, next)?;
                }
                cond => {
                    let then_target = edge_target(func, id, *then_block, &mut stubs);
                    let else_target = edge_target(func, id, *else_block, &mut stubs);
                    C::branch_if(&mut ctx, cond, &then_target);
                    if else_target != block_label(func, *else_block) || next != Some(*else_block) {
                        C::jump(&mut ctx, &else_target);
                    }
                }
            },
        }
    }

    // split edges of conditional branches that carry phi moves
    for (label, pred, succ) in stubs {
        ctx.label(label);
        edge_moves::<C>(&mut ctx, allocation, pred, succ)?;
        C::jump(&mut ctx, &block_label(func, succ));
    }

    Ok((Assembly::new(ctx.lines), ctx.frame))
}

fn check(func: &Function, target: &TargetDescriptor) -> Result<(), Error> {
    let unsupported = |instruction: String| Error::UnsupportedInstruction {
        function: func.name().to_string(),
        instruction,
    };

    if let Some(param) = func.params().iter().find(|p| p.ty() == Type::Float) {
        return Err(unsupported(format!("float parameter {}", param)));
    }

    for block in func.blocks() {
        for instruction in block.instructions() {
            match instruction {
                Instruction::BinOp { dst, lhs, rhs, .. } => {
                    if [dst, lhs, rhs].iter().any(|v| v.ty() == Type::Float) {
                        return Err(unsupported(instruction.to_string()));
                    }
                }
                Instruction::Call { dst, callee, args } => {
                    if dst.iter().chain(args).any(|v| v.ty() == Type::Float) {
                        return Err(unsupported(instruction.to_string()));
                    }
                    if args.len() > target.max_call_args() {
                        return Err(Error::TooManyArguments {
                            function: func.name().to_string(),
                            callee: callee.clone(),
                            count: args.len(),
                            max: target.max_call_args(),
                        });
                    }
                }
                Instruction::Load { .. } | Instruction::Store { .. } => {}
            }
        }

        if let Terminator::Return(Some(value)) = block.terminator() {
            if value.ty() == Type::Float {
                return Err(Error::UnsupportedTerminator {
                    function: func.name().to_string(),
                    terminator: format!("ret {}", value),
                });
            }
        }
    }

    Ok(())
}

fn max_stack_args(func: &Function, target: &TargetDescriptor) -> usize {
    func.blocks()
        .iter()
        .flat_map(|block| block.instructions())
        .filter_map(|instruction| match instruction {
            Instruction::Call { args, .. } => Some(args.len().saturating_sub(target.arg_regs.len())),
            _ => None,
        })
        .max()
        .unwrap_or(0)
}

fn operand(func: &Function, allocation: &Allocation, value: &Value) -> Result<Operand, Error> {
    match value {
        Value::Constant { value, .. } => Ok(Operand::Immediate(*value)),
        Value::Parameter { id, .. } | Value::Temporary { id, .. } => allocation
            .location(*id)
            .map(Operand::from)
            .ok_or_else(|| Error::UnallocatedValue {
                function: func.name().to_string(),
                value: *id,
            }),
    }
}

fn lower<C: Codegen>(
    ctx: &mut Context,
    allocation: &Allocation,
    instruction: &Instruction,
) -> Result<(), Error> {
    let func = ctx.func;
    match instruction {
        Instruction::BinOp { dst, op, lhs, rhs } => {
            let dst = operand(func, allocation, dst)?;
            let lhs = operand(func, allocation, lhs)?;
            let rhs = operand(func, allocation, rhs)?;
            C::binop(ctx, *op, dst, lhs, rhs);
        }
        Instruction::Call { dst, callee, args } => {
            let args = args
                .iter()
                .map(|arg| operand(func, allocation, arg))
                .collect::<Result<Vec<_>, _>>()?;
            let dst = dst
                .as_ref()
                .map(|dst| operand(func, allocation, dst))
                .transpose()?;
            C::call(ctx, callee, &args, dst);
        }
        Instruction::Load { dst, src } => {
            let dst = operand(func, allocation, dst)?;
            let src = operand(func, allocation, src)?;
            C::mov(ctx, dst, src);
        }
        Instruction::Store { addr, src } => {
            let addr = operand(func, allocation, addr)?;
            let src = operand(func, allocation, src)?;
            C::store(ctx, addr, src);
        }
    }
    Ok(())
}

fn fall_or_jump<C: Codegen>(
    ctx: &mut Context,
    allocation: &Allocation,
    pred: BlockId,
    succ: BlockId,
    next: Option<BlockId>,
) -> Result<(), Error> {
    edge_moves::<C>(ctx, allocation, pred, succ)?;
    if next != Some(succ) {
        let label = block_label(ctx.func, succ);
        C::jump(ctx, &label);
    }
    Ok(())
}

fn edge_target(
    func: &Function,
    pred: BlockId,
    succ: BlockId,
    stubs: &mut Vec<(String, BlockId, BlockId)>,
) -> String {
    if func.block(succ).phis().is_empty() {
        return block_label(func, succ);
    }
    let label = edge_label(func, pred, succ);
    stubs.push((label.clone(), pred, succ));
    label
}

/// Copies the phi sources `pred` supplies into the phi destinations of
/// `succ`.
fn edge_moves<C: Codegen>(
    ctx: &mut Context,
    allocation: &Allocation,
    pred: BlockId,
    succ: BlockId,
) -> Result<(), Error> {
    let func = ctx.func;
    let mut moves = Vec::new();
    for phi in func.block(succ).phis() {
        if let Some(src) = phi.source_for(pred) {
            moves.push((
                operand(func, allocation, &phi.dst)?,
                operand(func, allocation, &src)?,
            ));
        }
    }
    parallel_move::<C>(ctx, moves);
    Ok(())
}

fn parallel_move<C: Codegen>(ctx: &mut Context, moves: Vec<(Operand, Operand)>) {
    let scratch = Operand::Register(ctx.scratch(C::CYCLE_SCRATCH));
    for (dst, src) in sequentialize(moves, scratch) {
        C::mov(ctx, dst, src);
    }
}

/// Orders a set of simultaneous `(dst, src)` copies so that no source is
/// overwritten before it is read. Cycles go through `scratch`.
pub fn sequentialize(moves: Vec<(Operand, Operand)>, scratch: Operand) -> Vec<(Operand, Operand)> {
    let mut pending: Vec<(Operand, Operand)> =
        moves.into_iter().filter(|(dst, src)| dst != src).collect();
    let mut sequence = Vec::with_capacity(pending.len() + 1);

    while !pending.is_empty() {
        let ready = pending
            .iter()
            .position(|(dst, _)| pending.iter().all(|(_, src)| src != dst));
        match ready {
            Some(index) => sequence.push(pending.remove(index)),
            None => {
                // every destination is still to be read: only cycles remain
                let (dst, _) = pending[0];
                sequence.push((scratch, dst));
                for (_, src) in pending.iter_mut().filter(|(_, src)| *src == dst) {
                    *src = scratch;
                }
            }
        }
    }

    sequence
}
