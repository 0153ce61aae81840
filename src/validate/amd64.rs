use std::collections::{HashMap, HashSet};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::frame::Arch;

use super::{Dialect, Inst, StackEffect};

/// AT&T syntax as emitted for System V AMD64.
pub struct Amd64;

static MNEMONICS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "movq", "movl", "movabsq", "movzbq", "leaq", "addq", "subq", "imulq", "idivq", "andq",
        "orq", "xorq", "negq", "notq", "cqto", "cmpq", "testq", "sete", "setne", "setl", "setle",
        "setg", "setge", "pushq", "popq", "call", "callq", "ret", "retq", "jmp", "je", "jne", "jl",
        "jle", "jg", "jge", "leave", "nop",
    ]
    .into_iter()
    .collect()
});

static REGISTER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(r[abcd]x|r[sd]i|r[sb]p|r(8|9|1[0-5])[dwb]?|e[abcd]x|e[sd]i|[abcd]l|sil|dil|rip)$")
        .unwrap()
});

static REGISTER_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"%([a-z0-9]+)").unwrap());

static MEMORY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^-?\d*\((%[a-z0-9]+)?(,\s*%[a-z0-9]+(,\s*(\d+))?)?\)$").unwrap()
});

fn register(operand: &str) -> Option<&str> {
    operand.strip_prefix('%')
}

fn immediate(operand: &str) -> Option<i64> {
    operand.strip_prefix('$')?.parse().ok()
}

impl Dialect for Amd64 {
    const ARCH: Arch = Arch::Amd64;
    const COMMENT: &'static str = "#";
    const FRAME_SCRATCH: &'static [&'static str] = &[];

    fn is_mnemonic(mnemonic: &str) -> bool {
        MNEMONICS.contains(mnemonic)
    }

    fn is_register(name: &str) -> bool {
        REGISTER.is_match(name)
    }

    fn registers(operand: &str) -> Vec<String> {
        REGISTER_NAME
            .captures_iter(operand)
            .map(|caps| caps[1].to_string())
            .collect()
    }

    fn is_immediate(operand: &str) -> bool {
        operand.starts_with('$')
    }

    fn is_memory(operand: &str) -> bool {
        operand.contains('(')
    }

    fn check_memory(operand: &str) -> Result<(), String> {
        let caps = MEMORY
            .captures(operand)
            .ok_or_else(|| format!("malformed memory operand `{}`", operand))?;
        match caps.get(4).map(|scale| scale.as_str()) {
            None | Some("1" | "2" | "4" | "8") => Ok(()),
            Some(scale) => Err(format!("invalid scale {} in `{}`", scale, operand)),
        }
    }

    fn label_operand(inst: &Inst) -> Option<usize> {
        let m = inst.mnemonic.as_str();
        (m.starts_with('j') || m == "call" || m == "callq").then_some(0)
    }

    fn destinations(inst: &Inst) -> Vec<usize> {
        match inst.mnemonic.as_str() {
            "cqto" | "idivq" | "cmpq" | "testq" | "pushq" | "call" | "callq" | "ret" | "retq"
            | "leave" | "nop" => Vec::new(),
            m if m.starts_with('j') => Vec::new(),
            _ if inst.operands.is_empty() => Vec::new(),
            _ => vec![inst.operands.len() - 1],
        }
    }

    fn reads_destination(inst: &Inst) -> bool {
        matches!(
            inst.mnemonic.as_str(),
            "addq" | "subq" | "imulq" | "andq" | "orq" | "xorq" | "negq" | "notq"
        )
    }

    fn is_call(inst: &Inst) -> bool {
        matches!(inst.mnemonic.as_str(), "call" | "callq")
    }

    fn is_return(inst: &Inst) -> bool {
        matches!(inst.mnemonic.as_str(), "ret" | "retq")
    }

    fn as_move(inst: &Inst) -> Option<(&str, &str)> {
        match (inst.mnemonic.as_str(), inst.operands.as_slice()) {
            ("movq", [src, dst]) => Some((register(dst)?, register(src)?)),
            _ => None,
        }
    }

    fn as_store(inst: &Inst) -> Option<(&str, &str)> {
        match (inst.mnemonic.as_str(), inst.operands.as_slice()) {
            ("movq", [src, dst]) if Self::is_memory(dst) => Some((register(src)?, dst.as_str())),
            _ => None,
        }
    }

    fn as_load(inst: &Inst) -> Option<(&str, &str)> {
        match (inst.mnemonic.as_str(), inst.operands.as_slice()) {
            ("movq", [src, dst]) if Self::is_memory(src) => Some((register(dst)?, src.as_str())),
            _ => None,
        }
    }

    fn as_jump(inst: &Inst) -> Option<&str> {
        match (inst.mnemonic.as_str(), inst.operands.as_slice()) {
            ("jmp", [label]) => Some(label.as_str()),
            _ => None,
        }
    }

    fn stack_effects(inst: &Inst, constants: &HashMap<String, i64>) -> Vec<StackEffect> {
        let amount = |operand: &str| {
            immediate(operand).or_else(|| register(operand).and_then(|reg| constants.get(reg).copied()))
        };

        let effect = match (inst.mnemonic.as_str(), inst.operands.as_slice()) {
            ("pushq", _) => StackEffect::Grow(8),
            ("popq", _) => StackEffect::Shrink(8),
            ("leave", _) => return vec![StackEffect::RestoreFrame(0), StackEffect::Shrink(8)],
            ("movq", [src, dst]) if src == "%rsp" && dst == "%rbp" => StackEffect::SetFrame(0),
            ("movq", [src, dst]) if src == "%rbp" && dst == "%rsp" => StackEffect::RestoreFrame(0),
            ("subq", [src, dst]) if dst == "%rsp" => match amount(src.as_str()) {
                Some(bytes) => StackEffect::Grow(bytes),
                None => StackEffect::Unknown,
            },
            ("addq", [src, dst]) if dst == "%rsp" => match amount(src.as_str()) {
                Some(bytes) => StackEffect::Shrink(bytes),
                None => StackEffect::Unknown,
            },
            (_, [.., dst]) if dst == "%rsp" && !Self::destinations(inst).is_empty() => {
                StackEffect::Unknown
            }
            _ => return Vec::new(),
        };
        vec![effect]
    }

    fn constant(inst: &Inst, _constants: &HashMap<String, i64>) -> Option<i64> {
        match (inst.mnemonic.as_str(), inst.operands.as_slice()) {
            ("movq" | "movabsq", [src, _]) => immediate(src),
            ("xorq", [src, dst]) if src == dst => Some(0),
            _ => None,
        }
    }

    fn saved_registers(inst: &Inst) -> Vec<String> {
        match (inst.mnemonic.as_str(), inst.operands.as_slice()) {
            ("pushq", [src]) => register(src).map(str::to_string).into_iter().collect(),
            _ => Vec::new(),
        }
    }

    fn restored_registers(inst: &Inst) -> Vec<String> {
        match (inst.mnemonic.as_str(), inst.operands.as_slice()) {
            ("popq", [dst]) => register(dst).map(str::to_string).into_iter().collect(),
            _ => Vec::new(),
        }
    }

    fn required_predecessor(inst: &Inst) -> Option<&'static str> {
        (inst.mnemonic == "idivq").then_some("cqto")
    }

    fn extra_errors(inst: &Inst) -> Vec<String> {
        let memory = inst.operands.iter().filter(|op| Self::is_memory(op)).count();
        if memory > 1 {
            vec!["memory-to-memory operands".to_string()]
        } else {
            Vec::new()
        }
    }
}
