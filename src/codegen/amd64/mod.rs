pub mod frame;

use crate::{frame::Arch, ir::BinOp};

use super::{Codegen, Context, Operand};

// indices into `frame::AMD64.scratch`
/// Accumulator: results, dividends and memory-to-memory routing.
const ACC: usize = 0;
const CYCLE: usize = 2;
/// Wide immediates and divisors.
const WIDE: usize = 3;

pub struct AMD64;

fn fits_i32(value: i64) -> bool {
    i32::try_from(value).is_ok()
}

/// Bytes below the saved callee-saved registers, reserved with `subq`.
fn rest_size(ctx: &Context) -> u32 {
    ctx.frame().local_size() - ctx.frame().saved().len() as u32 * 8
}

/// Spill slots sit right below the pushed callee-saved registers.
fn spill_address(ctx: &Context, slot: u32) -> String {
    let offset = ctx.frame().saved().len() as u32 * 8 + slot + 8;
    format!("-{}(%rbp)", offset)
}

/// AT&T spelling of `op`. A wide immediate is first moved to %r11.
fn source(ctx: &mut Context, op: Operand) -> String {
    match op {
        Operand::Immediate(value) if fits_i32(value) => format!("${}", value),
        Operand::Immediate(value) => {
            let wide = ctx.scratch(WIDE);
            ctx.emit(format!("movabsq ${}, %{}", value, wide));
            format!("%{}", wide)
        }
        Operand::Register(reg) => format!("%{}", reg),
        Operand::Stack(slot) => spill_address(ctx, slot),
    }
}

enum Selection {
    /// Two-operand instruction computing in place.
    Arith(&'static str),
    /// `cqto` + `idivq` through %rdx:%rax.
    Divide,
    /// `cmpq` + `setCC` on this condition code.
    Compare(&'static str),
}

fn select(op: BinOp) -> Selection {
    match op {
        BinOp::Add => Selection::Arith("addq"),
        BinOp::Sub => Selection::Arith("subq"),
        BinOp::Mul => Selection::Arith("imulq"),
        BinOp::Div => Selection::Divide,
        BinOp::And => Selection::Arith("andq"),
        BinOp::Or => Selection::Arith("orq"),
        BinOp::Xor => Selection::Arith("xorq"),
        BinOp::Eq => Selection::Compare("e"),
        BinOp::Ne => Selection::Compare("ne"),
        BinOp::Lt => Selection::Compare("l"),
        BinOp::Le => Selection::Compare("le"),
        BinOp::Gt => Selection::Compare("g"),
        BinOp::Ge => Selection::Compare("ge"),
    }
}

impl Codegen for AMD64 {
    const ARCH: Arch = Arch::Amd64;
    const CYCLE_SCRATCH: usize = CYCLE;
    const RESERVES_OUTGOING: bool = false;

    fn prologue(ctx: &mut Context) {
        ctx.emit("pushq %rbp");
        ctx.emit("movq %rsp, %rbp");
        let saved = ctx.frame().saved().to_vec();
        for reg in saved {
            ctx.emit(format!("pushq %{}", reg));
        }
        let rest = rest_size(ctx);
        if rest > 0 {
            ctx.emit(format!("subq ${}, %rsp", rest));
        }
    }

    fn epilogue(ctx: &mut Context) {
        let rest = rest_size(ctx);
        if rest > 0 {
            ctx.emit(format!("addq ${}, %rsp", rest));
        }
        let saved = ctx.frame().saved().to_vec();
        for reg in saved.into_iter().rev() {
            ctx.emit(format!("popq %{}", reg));
        }
        ctx.emit("popq %rbp");
        ctx.emit("retq");
    }

    fn incoming(ctx: &mut Context, index: usize, dst: Operand) {
        // above the saved %rbp and the return address
        let address = format!("{}(%rbp)", 16 + 8 * index);
        match dst {
            Operand::Register(reg) => ctx.emit(format!("movq {}, %{}", address, reg)),
            _ => {
                let acc = ctx.scratch(ACC);
                ctx.emit(format!("movq {}, %{}", address, acc));
                Self::mov(ctx, dst, Operand::Register(acc));
            }
        }
    }

    fn mov(ctx: &mut Context, dst: Operand, src: Operand) {
        if dst == src {
            return;
        }
        match (dst, src) {
            (Operand::Register(reg), Operand::Immediate(value)) if !fits_i32(value) => {
                ctx.emit(format!("movabsq ${}, %{}", value, reg));
            }
            (Operand::Register(reg), _) => {
                let src = source(ctx, src);
                ctx.emit(format!("movq {}, %{}", src, reg));
            }
            (Operand::Stack(slot), Operand::Register(_)) => {
                let src = source(ctx, src);
                ctx.emit(format!("movq {}, {}", src, spill_address(ctx, slot)));
            }
            (Operand::Stack(slot), Operand::Immediate(value)) if fits_i32(value) => {
                ctx.emit(format!("movq ${}, {}", value, spill_address(ctx, slot)));
            }
            (Operand::Stack(_), _) => {
                let acc = Operand::Register(ctx.scratch(ACC));
                Self::mov(ctx, acc, src);
                Self::mov(ctx, dst, acc);
            }
            (Operand::Immediate(_), _) => unreachable!("an immediate is never a destination"),
        }
    }

    fn binop(ctx: &mut Context, op: BinOp, dst: Operand, lhs: Operand, rhs: Operand) {
        let acc = ctx.scratch(ACC);
        match select(op) {
            Selection::Divide => {
                let divisor = match rhs {
                    Operand::Immediate(_) => {
                        let wide = ctx.scratch(WIDE);
                        Self::mov(ctx, Operand::Register(wide), rhs);
                        format!("%{}", wide)
                    }
                    _ => source(ctx, rhs),
                };
                Self::mov(ctx, Operand::Register(acc), lhs);
                // cqto must sit right before idivq
                ctx.emit("cqto");
                ctx.emit(format!("idivq {}", divisor));
                Self::mov(ctx, dst, Operand::Register(acc));
            }
            Selection::Compare(cond) => {
                Self::mov(ctx, Operand::Register(acc), lhs);
                let rhs = source(ctx, rhs);
                ctx.emit(format!("cmpq {}, %{}", rhs, acc));
                ctx.emit(format!("set{} %al", cond));
                ctx.emit("movzbq %al, %rax");
                Self::mov(ctx, dst, Operand::Register(acc));
            }
            Selection::Arith(opcode) => {
                // compute in place unless that would clobber the right operand
                let acc = match dst {
                    Operand::Register(reg) if rhs != dst => reg,
                    _ => acc,
                };
                Self::mov(ctx, Operand::Register(acc), lhs);
                let rhs = source(ctx, rhs);
                ctx.emit(format!("{} {}, %{}", opcode, rhs, acc));
                Self::mov(ctx, dst, Operand::Register(acc));
            }
        }
    }

    fn store(ctx: &mut Context, addr: Operand, src: Operand) {
        let addr = match addr {
            Operand::Register(reg) => reg,
            _ => {
                let acc = ctx.scratch(ACC);
                Self::mov(ctx, Operand::Register(acc), addr);
                acc
            }
        };
        let src = match src {
            Operand::Register(reg) => format!("%{}", reg),
            Operand::Immediate(value) if fits_i32(value) => format!("${}", value),
            _ => {
                let wide = ctx.scratch(WIDE);
                Self::mov(ctx, Operand::Register(wide), src);
                format!("%{}", wide)
            }
        };
        ctx.emit(format!("movq {}, (%{})", src, addr));
    }

    fn call(ctx: &mut Context, callee: &str, args: &[Operand], dst: Option<Operand>) {
        let target = ctx.target();
        let stack_args = &args[args.len().min(target.arg_regs.len())..];

        // %rsp must be 16-byte aligned at the call
        let padding = if stack_args.len() % 2 == 1 { 8 } else { 0 };
        if padding > 0 {
            ctx.emit(format!("subq ${}, %rsp", padding));
        }
        for arg in stack_args.iter().rev() {
            let arg = source(ctx, *arg);
            ctx.emit(format!("pushq {}", arg));
        }
        for (reg, arg) in target.arg_regs.iter().zip(args) {
            Self::mov(ctx, Operand::Register(*reg), *arg);
        }

        ctx.emit(format!("callq {}", callee));

        let cleanup = stack_args.len() * 8 + padding;
        if cleanup > 0 {
            ctx.emit(format!("addq ${}, %rsp", cleanup));
        }
        if let Some(dst) = dst {
            Self::mov(ctx, dst, Operand::Register(target.ret_reg));
        }
    }

    fn jump(ctx: &mut Context, label: &str) {
        ctx.emit(format!("jmp {}", label));
    }

    fn branch_if(ctx: &mut Context, cond: Operand, label: &str) {
        match cond {
            Operand::Register(reg) => ctx.emit(format!("testq %{}, %{}", reg, reg)),
            _ => {
                let cond = source(ctx, cond);
                ctx.emit(format!("cmpq $0, {}", cond));
            }
        }
        ctx.emit(format!("jne {}", label));
    }
}
