//! Local cleanups on finished assembly.
//!
//! Every rewrite looks at two neighbouring lines only and never across a
//! label, so no control-flow information is needed.

use crate::{
    asm::{Assembly, Line},
    frame::Arch,
    validate::{self, Amd64, Arm64, Dialect, Inst, Item, Riscv64},
};

/// What to do with the previous line and the current one.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Rewrite {
    DropCurrent,
    DropBoth,
    ReplacePrevious(String),
    ReplaceCurrent(String),
    /// Both lines become one instruction.
    Merge(String),
}

/// Looks at `(previous, current)`.
type Rule = fn(&Inst, &Inst) -> Option<Rewrite>;

pub fn optimize(arch: Arch, assembly: Assembly) -> Assembly {
    let before = assembly.len();
    let (lines, applied) = match arch {
        Arch::Amd64 => run::<Amd64>(assembly.into_lines(), &[]),
        Arch::Arm64 => run::<Arm64>(assembly.into_lines(), ARM64),
        Arch::Riscv64 => run::<Riscv64>(assembly.into_lines(), &[]),
    };
    log::debug!(
        "peephole applied {} rewrite(s), removed {} line(s)",
        applied,
        before - lines.len()
    );
    Assembly::new(lines)
}

fn parse<D: Dialect>(line: &Line) -> Option<Inst> {
    let text = line.instruction()?;
    match validate::parse_with::<D>(text).pop() {
        Some(Item::Inst(inst)) => Some(inst),
        _ => None,
    }
}

fn run<D: Dialect>(lines: Vec<Line>, extra: &[Rule]) -> (Vec<Line>, usize) {
    let common: [Rule; 3] = [swap_back::<D>, reload::<D>, store_back::<D>];
    let mut applied = 0;
    let mut out: Vec<Line> = Vec::with_capacity(lines.len());

    for line in lines {
        let previous = out.last().and_then(parse::<D>);

        if let (Line::Label(name), Some(previous)) = (&line, &previous) {
            if D::as_jump(previous) == Some(name.as_str()) {
                out.pop();
                applied += 1;
            }
        }
        let rewrite = match (previous, parse::<D>(&line)) {
            (Some(previous), Some(current)) => common
                .iter()
                .chain(extra)
                .find_map(|rule| rule(&previous, &current)),
            _ => None,
        };

        let Some(rewrite) = rewrite else {
            out.push(line);
            continue;
        };
        applied += 1;
        match rewrite {
            Rewrite::DropCurrent => {}
            Rewrite::DropBoth => {
                out.pop();
            }
            Rewrite::ReplacePrevious(text) => {
                out.pop();
                out.push(Line::Instruction(text));
                out.push(line);
            }
            Rewrite::ReplaceCurrent(text) => out.push(Line::Instruction(text)),
            Rewrite::Merge(text) => {
                out.pop();
                out.push(Line::Instruction(text));
            }
        }
    }
    (out, applied)
}

// mov a, b; mov b, a
fn swap_back<D: Dialect>(first: &Inst, second: &Inst) -> Option<Rewrite> {
    let (dst, src) = D::as_move(first)?;
    let (dst2, src2) = D::as_move(second)?;
    (dst2 == src && src2 == dst).then_some(Rewrite::DropCurrent)
}

// store r to m; load r from m
fn reload<D: Dialect>(first: &Inst, second: &Inst) -> Option<Rewrite> {
    let (stored, to) = D::as_store(first)?;
    let (loaded, from) = D::as_load(second)?;
    (stored == loaded && to == from).then_some(Rewrite::DropCurrent)
}

// load r from m; store r to m
fn store_back<D: Dialect>(first: &Inst, second: &Inst) -> Option<Rewrite> {
    let (loaded, from) = D::as_load(first)?;
    let (stored, to) = D::as_store(second)?;
    (stored == loaded && to == from).then_some(Rewrite::DropCurrent)
}

const ARM64: &[Rule] = &[cancel_add_sub, mul_to_shift, pair_stores, cmp_zero_to_tst, fuse_madd];

fn operands<'a, const N: usize>(inst: &'a Inst, mnemonic: &str) -> Option<[&'a str; N]> {
    if inst.mnemonic != mnemonic {
        return None;
    }
    let operands: Vec<&str> = inst.operands.iter().map(String::as_str).collect();
    operands.try_into().ok()
}

fn immediate(operand: &str) -> Option<i64> {
    operand.strip_prefix('#')?.parse().ok()
}

/// `[base]` or `[base, #offset]` without writeback.
fn base_offset(address: &str) -> Option<(&str, i64)> {
    let inner = address.strip_prefix('[')?.strip_suffix(']')?;
    match inner.split_once(", ") {
        None => Some((inner, 0)),
        Some((base, offset)) => Some((base, immediate(offset)?)),
    }
}

// add x, x, #n; sub x, x, #n (either order)
fn cancel_add_sub(first: &Inst, second: &Inst) -> Option<Rewrite> {
    let inverse = match first.mnemonic.as_str() {
        "add" => "sub",
        "sub" => "add",
        _ => return None,
    };
    let [dst, src, amount] = operands(first, &first.mnemonic)?;
    let [dst2, src2, amount2] = operands(second, inverse)?;
    let same = dst == src && dst2 == dst && src2 == dst && amount == amount2;
    (same && immediate(amount).is_some()).then_some(Rewrite::DropBoth)
}

// mov t, #2^k; mul d, a, t  =>  mov t, #2^k; lsl d, a, #k
fn mul_to_shift(first: &Inst, second: &Inst) -> Option<Rewrite> {
    let [constant, value] = operands(first, "mov")?;
    let [dst, lhs, rhs] = operands(second, "mul")?;
    let value = immediate(value)?;
    if value < 2 || value.count_ones() != 1 {
        return None;
    }
    let other = match (lhs == constant, rhs == constant) {
        (false, true) => lhs,
        (true, false) => rhs,
        _ => return None,
    };
    let text = format!("lsl {}, {}, #{}", dst, other, value.trailing_zeros());
    Some(Rewrite::ReplaceCurrent(text))
}

// str a, [b, #o]; str c, [b, #o+8]  =>  stp a, c, [b, #o]
fn pair_stores(first: &Inst, second: &Inst) -> Option<Rewrite> {
    let [low, address] = operands(first, "str")?;
    let [high, address2] = operands(second, "str")?;
    let (base, offset) = base_offset(address)?;
    let (base2, offset2) = base_offset(address2)?;
    let fits = offset % 8 == 0 && (-256..=504).contains(&offset);
    if base != base2 || offset2 != offset + 8 || !fits {
        return None;
    }
    Some(Rewrite::Merge(format!("stp {}, {}, {}", low, high, address)))
}

// cmp x, #0; cset d, cc  =>  tst x, x; cset d, cc
//
// tst clears the carry flag where cmp sets it, so only conditions that
// ignore carry are rewritten.
fn cmp_zero_to_tst(first: &Inst, second: &Inst) -> Option<Rewrite> {
    let [reg, zero] = operands(first, "cmp")?;
    if immediate(zero) != Some(0) {
        return None;
    }
    let condition = match (second.mnemonic.as_str(), second.operands.as_slice()) {
        ("cset", [_, condition]) => condition.as_str(),
        (branch, [_]) => branch.strip_prefix("b.")?,
        _ => return None,
    };
    if !matches!(condition, "eq" | "ne" | "lt" | "ge" | "gt" | "le" | "mi" | "pl") {
        return None;
    }
    Some(Rewrite::ReplacePrevious(format!("tst {}, {}", reg, reg)))
}

// mul t, a, b; add t, t, c  =>  madd t, a, b, c
fn fuse_madd(first: &Inst, second: &Inst) -> Option<Rewrite> {
    let [product, lhs, rhs] = operands(first, "mul")?;
    let [dst, x, y] = operands(second, "add")?;
    let addend = match (x == product, y == product) {
        (true, false) => y,
        (false, true) => x,
        _ => return None,
    };
    if dst != product || addend.starts_with('#') {
        return None;
    }
    let text = format!("madd {}, {}, {}, {}", dst, lhs, rhs, addend);
    Some(Rewrite::Merge(text))
}
