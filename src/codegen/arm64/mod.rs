pub mod frame;

use crate::{
    frame::{Arch, Register, FIXED_AREA},
    ir::BinOp,
};

use super::{Codegen, Context, Operand};

// indices into `frame::ARM64.scratch`
const TMP0: usize = 0;
const TMP1: usize = 1;
const RESULT: usize = 2;
const CYCLE: usize = 3;
// frame adjustment and far addresses
const FAR_SIZE: usize = 4;
const FAR_ADDR: usize = 5;

/// Largest unscaled immediate of `add`/`sub`/`cmp`.
const MAX_ARITH_IMM: i64 = 4095;
/// Largest scaled offset of a 64-bit `ldr`/`str`.
const MAX_LDR_OFFSET: u32 = 32760;

pub struct ARM64;

/// Loads `value` into `reg`, with a `movz`/`movk` chain when a single
/// `mov` cannot encode it.
fn materialize(ctx: &mut Context, reg: Register, value: i64) {
    if (-65536..=65535).contains(&value) {
        ctx.emit(format!("mov {}, #{}", reg, value));
        return;
    }

    let bits = value as u64;
    let mut first = true;
    for shift in [0, 16, 32, 48] {
        let chunk = (bits >> shift) & 0xffff;
        if chunk == 0 {
            continue;
        }
        let opcode = if first { "movz" } else { "movk" };
        if shift == 0 {
            ctx.emit(format!("{} {}, #{}", opcode, reg, chunk));
        } else {
            ctx.emit(format!("{} {}, #{}, lsl #{}", opcode, reg, chunk, shift));
        }
        first = false;
    }
}

/// `[sp, #offset]`, going through x17 when the offset does not fit.
fn sp_address(ctx: &mut Context, offset: u32) -> String {
    if offset == 0 {
        "[sp]".to_string()
    } else if offset % 8 == 0 && offset <= MAX_LDR_OFFSET {
        format!("[sp, #{}]", offset)
    } else {
        let far = ctx.scratch(FAR_ADDR);
        materialize(ctx, far, offset as i64);
        ctx.emit(format!("add {}, sp, {}", far, far));
        format!("[{}]", far)
    }
}

fn spill_address(ctx: &mut Context, slot: u32) -> String {
    let offset = ctx.frame().spill_offset(slot);
    sp_address(ctx, offset)
}

/// Makes `op` available in a register, using the `scratch`-th scratch
/// register if it is not in one.
fn read(ctx: &mut Context, op: Operand, scratch: usize) -> Register {
    let scratch = ctx.scratch(scratch);
    match op {
        Operand::Register(reg) => reg,
        Operand::Immediate(value) => {
            materialize(ctx, scratch, value);
            scratch
        }
        Operand::Stack(slot) => {
            let address = spill_address(ctx, slot);
            ctx.emit(format!("ldr {}, {}", scratch, address));
            scratch
        }
    }
}

fn write(ctx: &mut Context, dst: Operand, from: Register) {
    match dst {
        Operand::Register(reg) => {
            if reg != from {
                ctx.emit(format!("mov {}, {}", reg, from));
            }
        }
        Operand::Stack(slot) => {
            let address = spill_address(ctx, slot);
            ctx.emit(format!("str {}, {}", from, address));
        }
        Operand::Immediate(_) => unreachable!("an immediate is never a destination"),
    }
}

fn arith_imm(op: Operand) -> Option<i64> {
    match op {
        Operand::Immediate(value) if (0..=MAX_ARITH_IMM).contains(&value) => Some(value),
        _ => None,
    }
}

enum Selection {
    /// Three-register data processing instruction.
    Arith(&'static str),
    /// `cmp` followed by `cset` on this condition.
    Compare(&'static str),
}

fn select(op: BinOp) -> Selection {
    match op {
        BinOp::Add => Selection::Arith("add"),
        BinOp::Sub => Selection::Arith("sub"),
        BinOp::Mul => Selection::Arith("mul"),
        BinOp::Div => Selection::Arith("sdiv"),
        BinOp::And => Selection::Arith("and"),
        BinOp::Or => Selection::Arith("orr"),
        BinOp::Xor => Selection::Arith("eor"),
        BinOp::Eq => Selection::Compare("eq"),
        BinOp::Ne => Selection::Compare("ne"),
        BinOp::Lt => Selection::Compare("lt"),
        BinOp::Le => Selection::Compare("le"),
        BinOp::Gt => Selection::Compare("gt"),
        BinOp::Ge => Selection::Compare("ge"),
    }
}

impl Codegen for ARM64 {
    const ARCH: Arch = Arch::Arm64;
    const CYCLE_SCRATCH: usize = CYCLE;
    const RESERVES_OUTGOING: bool = true;

    fn prologue(ctx: &mut Context) {
        if ctx.options().pointer_auth {
            ctx.emit("paciasp");
        }
        ctx.emit(format!("stp x29, x30, [sp, #-{}]!", FIXED_AREA));
        ctx.emit("mov x29, sp");

        let local = ctx.frame().local_size();
        if local > 0 {
            if local as i64 <= MAX_ARITH_IMM {
                ctx.emit(format!("sub sp, sp, #{}", local));
            } else {
                let size = ctx.scratch(FAR_SIZE);
                materialize(ctx, size, local as i64);
                ctx.emit(format!("sub sp, sp, {}", size));
            }
        }

        let saved = ctx.frame().saved().to_vec();
        for (index, reg) in saved.into_iter().enumerate() {
            let offset = ctx.frame().save_offset(index);
            let address = sp_address(ctx, offset);
            ctx.emit(format!("str {}, {}", reg, address));
        }
    }

    fn epilogue(ctx: &mut Context) {
        let saved = ctx.frame().saved().to_vec();
        for (index, reg) in saved.into_iter().enumerate() {
            let offset = ctx.frame().save_offset(index);
            let address = sp_address(ctx, offset);
            ctx.emit(format!("ldr {}, {}", reg, address));
        }
        ctx.emit("mov sp, x29");
        ctx.emit(format!("ldp x29, x30, [sp], #{}", FIXED_AREA));
        if ctx.options().pointer_auth {
            ctx.emit("autiasp");
        }
        ctx.emit("ret");
    }

    fn incoming(ctx: &mut Context, index: usize, dst: Operand) {
        let address = format!("[x29, #{}]", FIXED_AREA as usize + 8 * index);
        match dst {
            Operand::Register(reg) => ctx.emit(format!("ldr {}, {}", reg, address)),
            _ => {
                let tmp = ctx.scratch(TMP0);
                ctx.emit(format!("ldr {}, {}", tmp, address));
                write(ctx, dst, tmp);
            }
        }
    }

    fn mov(ctx: &mut Context, dst: Operand, src: Operand) {
        if dst == src {
            return;
        }
        match (dst, src) {
            (Operand::Register(reg), Operand::Immediate(value)) => materialize(ctx, reg, value),
            (Operand::Register(reg), Operand::Stack(slot)) => {
                let address = spill_address(ctx, slot);
                ctx.emit(format!("ldr {}, {}", reg, address));
            }
            _ => {
                let src = read(ctx, src, TMP0);
                write(ctx, dst, src);
            }
        }
    }

    fn binop(ctx: &mut Context, op: BinOp, dst: Operand, lhs: Operand, rhs: Operand) {
        let result = match dst {
            Operand::Register(reg) => reg,
            _ => ctx.scratch(RESULT),
        };
        let lhs = read(ctx, lhs, TMP0);

        match select(op) {
            Selection::Compare(cond) => {
                match arith_imm(rhs) {
                    Some(imm) => ctx.emit(format!("cmp {}, #{}", lhs, imm)),
                    None => {
                        let rhs = read(ctx, rhs, TMP1);
                        ctx.emit(format!("cmp {}, {}", lhs, rhs));
                    }
                }
                ctx.emit(format!("cset {}, {}", result, cond));
            }
            Selection::Arith(opcode) => {
                match arith_imm(rhs).filter(|_| matches!(op, BinOp::Add | BinOp::Sub)) {
                    Some(imm) => ctx.emit(format!("{} {}, {}, #{}", opcode, result, lhs, imm)),
                    None => {
                        let rhs = read(ctx, rhs, TMP1);
                        ctx.emit(format!("{} {}, {}, {}", opcode, result, lhs, rhs));
                    }
                }
            }
        }

        write(ctx, dst, result);
    }

    fn store(ctx: &mut Context, addr: Operand, src: Operand) {
        let addr = read(ctx, addr, TMP0);
        let src = read(ctx, src, TMP1);
        ctx.emit(format!("str {}, [{}]", src, addr));
    }

    fn call(ctx: &mut Context, callee: &str, args: &[Operand], dst: Option<Operand>) {
        let target = ctx.target();
        let in_regs = target.arg_regs.len();

        for (index, arg) in args.iter().enumerate().skip(in_regs) {
            let reg = read(ctx, *arg, TMP0);
            let address = sp_address(ctx, (index - in_regs) as u32 * target.word_size);
            ctx.emit(format!("str {}, {}", reg, address));
        }
        for (reg, arg) in target.arg_regs.iter().zip(args) {
            Self::mov(ctx, Operand::Register(*reg), *arg);
        }

        ctx.emit(format!("bl {}", callee));

        if let Some(dst) = dst {
            write(ctx, dst, target.ret_reg);
        }
    }

    fn jump(ctx: &mut Context, label: &str) {
        ctx.emit(format!("b {}", label));
    }

    fn branch_if(ctx: &mut Context, cond: Operand, label: &str) {
        let cond = read(ctx, cond, TMP0);
        ctx.emit(format!("cbnz {}, {}", cond, label));
    }
}
