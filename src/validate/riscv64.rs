use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::frame::Arch;

use super::{Dialect, Inst, StackEffect};

/// RV64IM with ABI register names.
pub struct Riscv64;

static MNEMONICS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "li", "lui", "auipc", "mv", "add", "addi", "addiw", "sub", "subw", "mul", "div", "divu",
        "divw", "rem", "remu", "remw", "and", "andi", "or", "ori", "xor", "xori", "slli", "srli",
        "srai", "slt", "slti", "sltu", "sltiu", "seqz", "snez", "neg", "not", "ld", "sd", "lw",
        "sw", "j", "jal", "jalr", "jr", "call", "tail", "ret", "beqz", "bnez", "beq", "bne",
        "blt", "bge", "bltu", "bgeu", "nop",
    ]
    .into_iter()
    .collect()
});

static REGISTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(zero|ra|sp|gp|tp|fp|t[0-6]|s([0-9]|1[01])|a[0-7]|x([0-9]|[12][0-9]|3[01]))$")
        .unwrap()
});

static WORD: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[a-z][a-z0-9]*\b").unwrap());

static MEMORY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^(-?\d+)\(([a-z0-9]+)\)$").unwrap());

fn immediate(operand: &str) -> Option<i64> {
    operand.parse().ok()
}

fn fits_i12(value: i64) -> bool {
    (-2048..=2047).contains(&value)
}

impl Dialect for Riscv64 {
    const ARCH: Arch = Arch::Riscv64;
    const COMMENT: &'static str = "#";
    const FRAME_SCRATCH: &'static [&'static str] = &["t0"];

    fn is_mnemonic(mnemonic: &str) -> bool {
        MNEMONICS.contains(mnemonic)
    }

    fn is_register(name: &str) -> bool {
        REGISTER.is_match(name)
    }

    fn registers(operand: &str) -> Vec<String> {
        WORD.find_iter(operand)
            .map(|m| m.as_str().to_string())
            .collect()
    }

    fn is_immediate(operand: &str) -> bool {
        immediate(operand).is_some()
    }

    fn is_memory(operand: &str) -> bool {
        operand.contains('(')
    }

    fn check_memory(operand: &str) -> Result<(), String> {
        let caps = MEMORY
            .captures(operand)
            .ok_or_else(|| format!("malformed memory operand `{}`", operand))?;
        match caps[1].parse::<i64>() {
            Ok(offset) if fits_i12(offset) => Ok(()),
            _ => Err(format!("offset out of range in `{}`", operand)),
        }
    }

    fn label_operand(inst: &Inst) -> Option<usize> {
        match inst.mnemonic.as_str() {
            "j" | "call" | "tail" => Some(0),
            "jal" => Some(inst.operands.len().saturating_sub(1)),
            "beqz" | "bnez" => Some(1),
            "beq" | "bne" | "blt" | "bge" | "bltu" | "bgeu" => Some(2),
            _ => None,
        }
    }

    fn destinations(inst: &Inst) -> Vec<usize> {
        match inst.mnemonic.as_str() {
            "sd" | "sw" | "j" | "jr" | "call" | "tail" | "ret" | "nop" | "beqz" | "bnez" | "beq"
            | "bne" | "blt" | "bge" | "bltu" | "bgeu" => Vec::new(),
            "jal" | "jalr" if inst.operands.len() < 2 => Vec::new(),
            _ if inst.operands.is_empty() => Vec::new(),
            _ => vec![0],
        }
    }

    fn reads_destination(_inst: &Inst) -> bool {
        false
    }

    fn is_call(inst: &Inst) -> bool {
        matches!(inst.mnemonic.as_str(), "call" | "jal" | "jalr")
    }

    fn is_return(inst: &Inst) -> bool {
        match (inst.mnemonic.as_str(), inst.operands.as_slice()) {
            ("ret", _) => true,
            ("jr", [reg]) => reg == "ra",
            _ => false,
        }
    }

    fn as_move(inst: &Inst) -> Option<(&str, &str)> {
        match (inst.mnemonic.as_str(), inst.operands.as_slice()) {
            ("mv", [dst, src]) if dst != "sp" && src != "sp" => Some((dst.as_str(), src.as_str())),
            _ => None,
        }
    }

    fn as_store(inst: &Inst) -> Option<(&str, &str)> {
        match (inst.mnemonic.as_str(), inst.operands.as_slice()) {
            ("sd", [src, address]) => Some((src.as_str(), address.as_str())),
            _ => None,
        }
    }

    fn as_load(inst: &Inst) -> Option<(&str, &str)> {
        match (inst.mnemonic.as_str(), inst.operands.as_slice()) {
            ("ld", [dst, address]) => Some((dst.as_str(), address.as_str())),
            _ => None,
        }
    }

    fn as_jump(inst: &Inst) -> Option<&str> {
        match (inst.mnemonic.as_str(), inst.operands.as_slice()) {
            ("j", [label]) => Some(label.as_str()),
            _ => None,
        }
    }

    fn stack_effects(inst: &Inst, constants: &HashMap<String, i64>) -> Vec<StackEffect> {
        let operands: Vec<&str> = inst.operands.iter().map(String::as_str).collect();
        let amount = |operand: &str| constants.get(operand).copied();

        let effect = match (inst.mnemonic.as_str(), operands.as_slice()) {
            ("addi", ["sp", "sp", value]) => match immediate(value) {
                Some(value) if value < 0 => StackEffect::Grow(-value),
                Some(value) => StackEffect::Shrink(value),
                None => StackEffect::Unknown,
            },
            ("add", ["sp", "sp", reg]) => amount(*reg).map_or(StackEffect::Unknown, StackEffect::Shrink),
            ("sub", ["sp", "sp", reg]) => amount(*reg).map_or(StackEffect::Unknown, StackEffect::Grow),
            ("mv", ["sp", "s0" | "fp"]) => StackEffect::RestoreFrame(0),
            ("addi", ["sp", "s0" | "fp", value]) => {
                immediate(value).map_or(StackEffect::Unknown, StackEffect::RestoreFrame)
            }
            ("mv", ["s0" | "fp", "sp"]) => StackEffect::SetFrame(0),
            ("addi", ["s0" | "fp", "sp", value]) => {
                immediate(value).map_or(StackEffect::Unknown, StackEffect::SetFrame)
            }
            ("add", ["s0" | "fp", "sp", reg]) => amount(*reg).map_or(StackEffect::Unknown, StackEffect::SetFrame),
            ("sub", ["s0" | "fp", "sp", reg]) => {
                amount(*reg).map_or(StackEffect::Unknown, |value| StackEffect::SetFrame(-value))
            }
            (_, ["sp", ..]) if !Self::destinations(inst).is_empty() => StackEffect::Unknown,
            _ => return Vec::new(),
        };
        vec![effect]
    }

    fn constant(inst: &Inst, constants: &HashMap<String, i64>) -> Option<i64> {
        let known = |reg: &str| constants.get(reg).copied();
        match (inst.mnemonic.as_str(), inst.operands.as_slice()) {
            ("li", [_, value]) => immediate(value),
            ("lui", [_, value]) => Some(((immediate(value)? << 12) as i32) as i64),
            ("addiw", [_, src, value]) => {
                Some((known(src.as_str())? as i32).wrapping_add(immediate(value)? as i32) as i64)
            }
            ("addi", [_, src, value]) => Some(known(src.as_str())?.wrapping_add(immediate(value)?)),
            ("slli", [_, src, value]) => Some(known(src.as_str())?.wrapping_shl(immediate(value)? as u32)),
            ("mv", [_, src]) => known(src.as_str()),
            _ => None,
        }
    }

    fn saved_registers(inst: &Inst) -> Vec<String> {
        match (inst.mnemonic.as_str(), inst.operands.as_slice()) {
            ("sd", [src, _]) => vec![src.clone()],
            _ => Vec::new(),
        }
    }

    fn restored_registers(inst: &Inst) -> Vec<String> {
        match (inst.mnemonic.as_str(), inst.operands.as_slice()) {
            ("ld", [dst, _]) => vec![dst.clone()],
            _ => Vec::new(),
        }
    }

    fn extra_errors(inst: &Inst) -> Vec<String> {
        match (inst.mnemonic.as_str(), inst.operands.as_slice()) {
            ("div" | "divu" | "divw" | "rem" | "remu" | "remw", [_, _, divisor]) if is_zero(divisor) => {
                vec!["division by the zero register".to_string()]
            }
            _ => Vec::new(),
        }
    }

    fn extra_warnings(inst: &Inst) -> Vec<String> {
        // `jal x0, label` is a plain jump
        if matches!(inst.mnemonic.as_str(), "jal" | "jalr") {
            return Vec::new();
        }
        Self::destinations(inst)
            .into_iter()
            .filter_map(|index| inst.operand(index))
            .filter(|operand| is_zero(operand))
            .map(|operand| format!("write to `{}` is discarded", operand))
            .collect()
    }
}

fn is_zero(register: &str) -> bool {
    matches!(register, "zero" | "x0")
}
