pub mod frame;

use crate::{
    frame::{Arch, Register},
    ir::BinOp,
};

use super::{Codegen, Context, Operand};

// indices into `frame::RISCV64.scratch`
const ADDR: usize = 0;
const TMP0: usize = 1;
const TMP1: usize = 2;
const RESULT: usize = 3;
const CYCLE: usize = 4;

pub struct RISCV64;

fn fits_i12(value: i64) -> bool {
    (-2048..=2047).contains(&value)
}

/// Loads `value` into `reg` with `li` for 12-bit values, `lui`+`addiw` for
/// 32-bit ones and a shifted sequence above that.
fn materialize(ctx: &mut Context, reg: Register, value: i64) {
    if fits_i12(value) {
        ctx.emit(format!("li {}, {}", reg, value));
        return;
    }

    // low 12 bits, sign extended; the upper part absorbs the borrow
    let lo = (value << 52) >> 52;
    if i32::try_from(value).is_ok() {
        let hi = ((value - lo) >> 12) & 0xfffff;
        ctx.emit(format!("lui {}, {}", reg, hi));
        if lo != 0 {
            ctx.emit(format!("addiw {}, {}, {}", reg, reg, lo));
        }
        return;
    }

    let hi = value.wrapping_sub(lo) >> 12;
    materialize(ctx, reg, hi);
    ctx.emit(format!("slli {}, {}, 12", reg, reg));
    if lo != 0 {
        ctx.emit(format!("addi {}, {}, {}", reg, reg, lo));
    }
}

/// `offset(sp)`, going through t0 when the offset does not fit.
fn sp_address(ctx: &mut Context, offset: u32) -> String {
    if fits_i12(offset as i64) {
        format!("{}(sp)", offset)
    } else {
        let addr = ctx.scratch(ADDR);
        materialize(ctx, addr, offset as i64);
        ctx.emit(format!("add {}, sp, {}", addr, addr));
        format!("0({})", addr)
    }
}

fn spill_address(ctx: &mut Context, slot: u32) -> String {
    let offset = ctx.frame().spill_offset(slot);
    sp_address(ctx, offset)
}

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
            ctx.emit(format!("ld {}, {}", scratch, address));
            scratch
        }
    }
}

fn write(ctx: &mut Context, dst: Operand, from: Register) {
    match dst {
        Operand::Register(reg) => {
            if reg != from {
                ctx.emit(format!("mv {}, {}", reg, from));
            }
        }
        Operand::Stack(slot) => {
            let address = spill_address(ctx, slot);
            ctx.emit(format!("sd {}, {}", from, address));
        }
        Operand::Immediate(_) => unreachable!("an immediate is never a destination"),
    }
}

/// `dst = base + delta` for stack and frame pointer arithmetic.
fn adjust(ctx: &mut Context, dst: Register, base: Register, delta: i64) {
    if fits_i12(delta) {
        ctx.emit(format!("addi {}, {}, {}", dst, base, delta));
    } else {
        let addr = ctx.scratch(ADDR);
        materialize(ctx, addr, delta.abs());
        let opcode = if delta < 0 { "sub" } else { "add" };
        ctx.emit(format!("{} {}, {}, {}", opcode, dst, base, addr));
    }
}

impl Codegen for RISCV64 {
    const ARCH: Arch = Arch::Riscv64;
    const CYCLE_SCRATCH: usize = CYCLE;
    const RESERVES_OUTGOING: bool = true;

    fn prologue(ctx: &mut Context) {
        let size = ctx.frame().size();
        adjust(ctx, "sp", "sp", -(size as i64));
        let address = sp_address(ctx, size - 8);
        ctx.emit(format!("sd ra, {}", address));
        let address = sp_address(ctx, size - 16);
        ctx.emit(format!("sd s0, {}", address));
        adjust(ctx, "s0", "sp", size as i64);

        let saved = ctx.frame().saved().to_vec();
        for (index, reg) in saved.into_iter().enumerate() {
            let offset = ctx.frame().save_offset(index);
            let address = sp_address(ctx, offset);
            ctx.emit(format!("sd {}, {}", reg, address));
        }
    }

    fn epilogue(ctx: &mut Context) {
        let saved = ctx.frame().saved().to_vec();
        for (index, reg) in saved.into_iter().enumerate() {
            let offset = ctx.frame().save_offset(index);
            let address = sp_address(ctx, offset);
            ctx.emit(format!("ld {}, {}", reg, address));
        }

        let size = ctx.frame().size();
        let address = sp_address(ctx, size - 8);
        ctx.emit(format!("ld ra, {}", address));
        let address = sp_address(ctx, size - 16);
        ctx.emit(format!("ld s0, {}", address));
        adjust(ctx, "sp", "sp", size as i64);
        ctx.emit("ret");
    }

    fn incoming(ctx: &mut Context, index: usize, dst: Operand) {
        // s0 is the stack pointer at entry, where the caller put its stack arguments
        let address = format!("{}(s0)", 8 * index);
        match dst {
            Operand::Register(reg) => ctx.emit(format!("ld {}, {}", reg, address)),
            _ => {
                let tmp = ctx.scratch(TMP0);
                ctx.emit(format!("ld {}, {}", tmp, address));
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
                ctx.emit(format!("ld {}, {}", reg, address));
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

        let imm = match rhs {
            Operand::Immediate(value) => Some(value),
            _ => None,
        };
        let with_imm = match (op, imm) {
            (BinOp::Add, Some(value)) if fits_i12(value) => Some(("addi", value)),
            (BinOp::Sub, Some(value)) if (-2047..=2048).contains(&value) => Some(("addi", -value)),
            (BinOp::And, Some(value)) if fits_i12(value) => Some(("andi", value)),
            (BinOp::Or, Some(value)) if fits_i12(value) => Some(("ori", value)),
            (BinOp::Xor, Some(value)) if fits_i12(value) => Some(("xori", value)),
            _ => None,
        };
        if let Some((opcode, value)) = with_imm {
            ctx.emit(format!("{} {}, {}, {}", opcode, result, lhs, value));
            write(ctx, dst, result);
            return;
        }

        let rhs = read(ctx, rhs, TMP1);
        let three = |opcode: &str, lhs: Register, rhs: Register| {
            format!("{} {}, {}, {}", opcode, result, lhs, rhs)
        };
        match op {
            BinOp::Eq => {
                ctx.emit(three("xor", lhs, rhs));
                ctx.emit(format!("sltiu {}, {}, 1", result, result));
            }
            BinOp::Ne => {
                ctx.emit(three("xor", lhs, rhs));
                ctx.emit(format!("sltu {}, zero, {}", result, result));
            }
            BinOp::Lt => ctx.emit(three("slt", lhs, rhs)),
            BinOp::Gt => ctx.emit(three("slt", rhs, lhs)),
            BinOp::Le => {
                ctx.emit(three("slt", rhs, lhs));
                ctx.emit(format!("xori {}, {}, 1", result, result));
            }
            BinOp::Ge => {
                ctx.emit(three("slt", lhs, rhs));
                ctx.emit(format!("xori {}, {}, 1", result, result));
            }
            BinOp::Add => ctx.emit(three("add", lhs, rhs)),
            BinOp::Sub => ctx.emit(three("sub", lhs, rhs)),
            BinOp::Mul => ctx.emit(three("mul", lhs, rhs)),
            BinOp::Div => ctx.emit(three("div", lhs, rhs)),
            BinOp::And => ctx.emit(three("and", lhs, rhs)),
            BinOp::Or => ctx.emit(three("or", lhs, rhs)),
            BinOp::Xor => ctx.emit(three("xor", lhs, rhs)),
        }
        write(ctx, dst, result);
    }

    fn store(ctx: &mut Context, addr: Operand, src: Operand) {
        let addr = read(ctx, addr, TMP0);
        let src = read(ctx, src, TMP1);
        ctx.emit(format!("sd {}, 0({})", src, addr));
    }

    fn call(ctx: &mut Context, callee: &str, args: &[Operand], dst: Option<Operand>) {
        let target = ctx.target();
        let in_regs = target.arg_regs.len();

        for (index, arg) in args.iter().enumerate().skip(in_regs) {
            let reg = read(ctx, *arg, TMP0);
            let address = sp_address(ctx, (index - in_regs) as u32 * target.word_size);
            ctx.emit(format!("sd {}, {}", reg, address));
        }
        for (reg, arg) in target.arg_regs.iter().zip(args) {
            Self::mov(ctx, Operand::Register(*reg), *arg);
        }

        ctx.emit(format!("call {}", callee));

        if let Some(dst) = dst {
            write(ctx, dst, target.ret_reg);
        }
    }

    fn jump(ctx: &mut Context, label: &str) {
        ctx.emit(format!("j {}", label));
    }

    fn branch_if(ctx: &mut Context, cond: Operand, label: &str) {
        let cond = read(ctx, cond, TMP0);
        ctx.emit(format!("bnez {}, {}", cond, label));
    }
}
