use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::frame::Arch;

use super::{Dialect, Inst, StackEffect};

/// AArch64 with `//` comments.
pub struct Arm64;

static MNEMONICS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "mov", "movz", "movk", "movn", "add", "sub", "mul", "sdiv", "udiv", "msub", "madd", "neg",
        "and", "orr", "eor", "mvn", "lsl", "lsr", "asr", "cmp", "cmn", "tst", "cset", "csel",
        "ldr", "str", "ldp", "stp", "b", "bl", "blr", "br", "cbz", "cbnz", "ret", "nop", "b.eq",
        "b.ne", "b.lt", "b.le", "b.gt", "b.ge", "paciasp", "autiasp",
    ]
    .into_iter()
    .collect()
});

/// Condition codes and shift or extend operators.
static KEYWORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "eq", "ne", "lt", "le", "gt", "ge", "hi", "lo", "hs", "ls", "mi", "pl", "vs", "vc", "al",
        "nv", "lsl", "lsr", "asr", "ror", "uxtw", "sxtw",
    ]
    .into_iter()
    .collect()
});

static REGISTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([xw]([0-9]|[12][0-9]|30)|sp|xzr|wzr|fp|lr)$").unwrap());

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[a-z][a-z0-9]*\b").unwrap());

static MEMORY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[([a-z0-9]+)(, #(-?\d+)|, ([a-z0-9]+)(, lsl #(\d+))?)?\](!)?$").unwrap()
});

fn immediate(operand: &str) -> Option<i64> {
    operand.strip_prefix('#')?.parse().ok()
}

/// `#imm` or a register holding a known constant.
fn amount(operand: &str, constants: &HashMap<String, i64>) -> Option<i64> {
    immediate(operand).or_else(|| constants.get(operand).copied())
}

/// Writeback amount of `[sp, #imm]!`.
fn pre_index(operand: &str) -> Option<i64> {
    let caps = MEMORY.captures(operand)?;
    if &caps[1] != "sp" || caps.get(7).is_none() {
        return None;
    }
    caps.get(3)?.as_str().parse().ok()
}

impl Dialect for Arm64 {
    const ARCH: Arch = Arch::Arm64;
    const COMMENT: &'static str = "//";
    const FRAME_SCRATCH: &'static [&'static str] = &["x16", "x17"];

    fn is_mnemonic(mnemonic: &str) -> bool {
        MNEMONICS.contains(mnemonic)
    }

    fn is_register(name: &str) -> bool {
        REGISTER.is_match(name)
    }

    fn registers(operand: &str) -> Vec<String> {
        if operand.starts_with('#') {
            return Vec::new();
        }
        WORD.find_iter(operand)
            .map(|m| m.as_str())
            .filter(|word| !KEYWORDS.contains(word))
            .map(str::to_string)
            .collect()
    }

    fn is_immediate(operand: &str) -> bool {
        operand.starts_with('#')
    }

    fn is_memory(operand: &str) -> bool {
        operand.starts_with('[')
    }

    fn check_memory(operand: &str) -> Result<(), String> {
        let caps = MEMORY
            .captures(operand)
            .ok_or_else(|| format!("malformed memory operand `{}`", operand))?;
        if let Some(offset) = caps.get(3) {
            let offset: i64 = offset.as_str().parse().map_err(|_| format!("bad offset in `{}`", operand))?;
            if !(-256..=32760).contains(&offset) {
                return Err(format!("offset {} out of range in `{}`", offset, operand));
            }
        }
        if let Some(shift) = caps.get(6) {
            if !matches!(shift.as_str(), "0" | "1" | "2" | "3") {
                return Err(format!("invalid shift in `{}`", operand));
            }
        }
        Ok(())
    }

    fn label_operand(inst: &Inst) -> Option<usize> {
        match inst.mnemonic.as_str() {
            "b" | "bl" => Some(0),
            "cbz" | "cbnz" => Some(1),
            m if m.starts_with("b.") => Some(0),
            _ => None,
        }
    }

    fn destinations(inst: &Inst) -> Vec<usize> {
        match inst.mnemonic.as_str() {
            "str" | "stp" | "cmp" | "cmn" | "tst" | "cbz" | "cbnz" | "ret" | "nop" | "bl" | "blr"
            | "br" => Vec::new(),
            m if m == "b" || m.starts_with("b.") => Vec::new(),
            "ldp" => vec![0, 1],
            _ if inst.operands.is_empty() => Vec::new(),
            _ => vec![0],
        }
    }

    fn reads_destination(inst: &Inst) -> bool {
        inst.mnemonic == "movk"
    }

    fn is_call(inst: &Inst) -> bool {
        matches!(inst.mnemonic.as_str(), "bl" | "blr")
    }

    fn is_return(inst: &Inst) -> bool {
        inst.mnemonic == "ret"
    }

    fn signs_return_address(inst: &Inst) -> bool {
        inst.mnemonic == "paciasp"
    }

    fn authenticates_return_address(inst: &Inst) -> bool {
        inst.mnemonic == "autiasp"
    }

    fn as_move(inst: &Inst) -> Option<(&str, &str)> {
        match (inst.mnemonic.as_str(), inst.operands.as_slice()) {
            // sp copies are frame bookkeeping
            ("mov", [dst, src]) if !Self::is_immediate(src) && dst != "sp" && src != "sp" => {
                Some((dst.as_str(), src.as_str()))
            }
            _ => None,
        }
    }

    fn as_store(inst: &Inst) -> Option<(&str, &str)> {
        match (inst.mnemonic.as_str(), inst.operands.as_slice()) {
            ("str", [src, address]) if !address.ends_with('!') => Some((src.as_str(), address.as_str())),
            _ => None,
        }
    }

    fn as_load(inst: &Inst) -> Option<(&str, &str)> {
        match (inst.mnemonic.as_str(), inst.operands.as_slice()) {
            ("ldr", [dst, address]) if !address.ends_with('!') => Some((dst.as_str(), address.as_str())),
            _ => None,
        }
    }

    fn as_jump(inst: &Inst) -> Option<&str> {
        match (inst.mnemonic.as_str(), inst.operands.as_slice()) {
            ("b", [label]) => Some(label.as_str()),
            _ => None,
        }
    }

    fn stack_effects(inst: &Inst, constants: &HashMap<String, i64>) -> Vec<StackEffect> {
        let operands: Vec<&str> = inst.operands.iter().map(String::as_str).collect();
        let effect = match (inst.mnemonic.as_str(), operands.as_slice()) {
            ("stp" | "str", [.., address]) if address.ends_with('!') => match pre_index(address) {
                Some(offset) if offset <= 0 => StackEffect::Grow(-offset),
                Some(offset) => StackEffect::Shrink(offset),
                None => StackEffect::Unknown,
            },
            ("ldp" | "ldr", [.., "[sp]", post]) => match immediate(post) {
                Some(offset) => StackEffect::Shrink(offset),
                None => StackEffect::Unknown,
            },
            ("mov", ["x29", "sp"]) => StackEffect::SetFrame(0),
            ("add", ["x29", "sp", offset]) => match amount(offset, constants) {
                Some(offset) => StackEffect::SetFrame(offset),
                None => StackEffect::Unknown,
            },
            ("mov", ["sp", "x29"]) => StackEffect::RestoreFrame(0),
            ("add" | "sub", ["sp", base, value]) => {
                let value = match amount(value, constants) {
                    Some(value) => value,
                    None => return vec![StackEffect::Unknown],
                };
                match (inst.mnemonic.as_str(), *base) {
                    ("sub", "sp") => StackEffect::Grow(value),
                    ("add", "sp") => StackEffect::Shrink(value),
                    ("sub", "x29") => StackEffect::RestoreFrame(-value),
                    ("add", "x29") => StackEffect::RestoreFrame(value),
                    _ => StackEffect::Unknown,
                }
            }
            (_, ["sp", ..]) if !Self::destinations(inst).is_empty() => StackEffect::Unknown,
            _ => return Vec::new(),
        };
        vec![effect]
    }

    fn constant(inst: &Inst, constants: &HashMap<String, i64>) -> Option<i64> {
        let shift = |operand: Option<&String>| -> Option<u32> {
            match operand {
                None => Some(0),
                Some(text) => text.strip_prefix("lsl #")?.parse().ok(),
            }
        };
        match (inst.mnemonic.as_str(), inst.operands.as_slice()) {
            ("mov", [_, src]) => immediate(src),
            ("movz", [_, chunk, rest @ ..]) => {
                let chunk = immediate(chunk)?;
                Some(chunk << shift(rest.first())?)
            }
            ("movk", [dst, chunk, rest @ ..]) => {
                let old = *constants.get(dst.as_str())?;
                let shift = shift(rest.first())?;
                let chunk = immediate(chunk)?;
                Some((old & !(0xffff << shift)) | (chunk << shift))
            }
            _ => None,
        }
    }

    fn saved_registers(inst: &Inst) -> Vec<String> {
        match (inst.mnemonic.as_str(), inst.operands.as_slice()) {
            ("stp", [first, second, ..]) => vec![first.clone(), second.clone()],
            ("str", [src, ..]) => vec![src.clone()],
            _ => Vec::new(),
        }
    }

    fn restored_registers(inst: &Inst) -> Vec<String> {
        match (inst.mnemonic.as_str(), inst.operands.as_slice()) {
            ("ldp", [first, second, ..]) => vec![first.clone(), second.clone()],
            ("ldr", [dst, ..]) => vec![dst.clone()],
            _ => Vec::new(),
        }
    }
}
