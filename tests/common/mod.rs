//! A register machine that runs emitted assembly for all three targets.
//!
//! Only the subset the code generator emits is understood. Calls to labels
//! outside the text go to registered externals, which return the sum of
//! their arguments and clobber every caller-saved register.

#![allow(dead_code)]

use std::collections::HashMap;

use anyhow::{bail, ensure, Context as _, Result};
use ssa_codegen::{
    validate::{self, Inst, Item},
    Arch,
};

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

const STACK_BASE: i64 = 0x10_0000;
/// Return address of the outermost call.
const HALT: i64 = -1;
const RETURN_BASE: i64 = 0x4000_0000;
const CLOBBER: i64 = 0x5a5a_5a5a;
const FRAME_MARK: i64 = 0x7777;
const MAX_STEPS: usize = 1_000_000;

pub struct Machine {
    arch: Arch,
    insts: Vec<Inst>,
    labels: HashMap<String, usize>,
    externals: HashMap<String, usize>,
    regs: HashMap<String, i64>,
    memory: HashMap<i64, i64>,
    flags: (i64, i64),
    calls: Vec<(String, Vec<i64>)>,
}

fn condition(code: &str, (lhs, rhs): (i64, i64)) -> Result<bool> {
    Ok(match code {
        "e" | "eq" => lhs == rhs,
        "ne" => lhs != rhs,
        "l" | "lt" => lhs < rhs,
        "le" => lhs <= rhs,
        "g" | "gt" => lhs > rhs,
        "ge" => lhs >= rhs,
        _ => bail!("unknown condition `{}`", code),
    })
}

fn parse_int(text: &str) -> Result<i64> {
    text.parse().with_context(|| format!("bad immediate `{}`", text))
}

impl Machine {
    pub fn new(arch: Arch, text: &str) -> Self {
        let mut insts = Vec::new();
        let mut labels = HashMap::new();
        for item in validate::parse(arch, text) {
            match item {
                Item::Label(name) => {
                    labels.insert(name, insts.len());
                }
                Item::Inst(inst) => insts.push(inst),
                Item::Directive(_) => {}
            }
        }
        Self {
            arch,
            insts,
            labels,
            externals: HashMap::new(),
            regs: HashMap::new(),
            memory: HashMap::new(),
            flags: (0, 0),
            calls: Vec::new(),
        }
    }

    pub fn external(mut self, name: &str, arity: usize) -> Self {
        self.externals.insert(name.to_string(), arity);
        self
    }

    /// Arguments of every external call made so far.
    pub fn calls(&self) -> &[(String, Vec<i64>)] {
        &self.calls
    }

    pub fn memory(&self, address: i64) -> Option<i64> {
        self.memory.get(&address).copied()
    }

    fn sp(&self) -> &'static str {
        match self.arch {
            Arch::Amd64 => "rsp",
            _ => "sp",
        }
    }

    /// Runs `function` to completion and returns its result register.
    pub fn call(&mut self, function: &str, args: &[i64]) -> Result<i64> {
        let target = self.arch.target();
        let entry = *self
            .labels
            .get(function)
            .with_context(|| format!("no function `{}`", function))?;

        for (reg, arg) in target.arg_regs.iter().zip(args) {
            self.set(reg, *arg);
        }
        for (index, arg) in args.iter().skip(target.arg_regs.len()).enumerate() {
            self.memory.insert(STACK_BASE + 8 * index as i64, *arg);
        }
        let callee_saved: Vec<_> = target
            .callee_saved
            .iter()
            .enumerate()
            .map(|(index, reg)| (*reg, 0x1000 + index as i64))
            .chain([(target.frame_pointer, FRAME_MARK)])
            .collect();
        for (reg, value) in &callee_saved {
            self.set(reg, *value);
        }

        match self.arch {
            Arch::Amd64 => {
                self.set("rsp", STACK_BASE - 8);
                self.memory.insert(STACK_BASE - 8, HALT);
            }
            Arch::Arm64 => {
                self.set("sp", STACK_BASE);
                self.set("x30", HALT);
            }
            Arch::Riscv64 => {
                self.set("sp", STACK_BASE);
                self.set("ra", HALT);
            }
        }

        self.run(entry)?;

        ensure!(
            self.get(self.sp()) == STACK_BASE,
            "stack pointer not restored: {:#x}",
            self.get(self.sp())
        );
        for (reg, value) in callee_saved {
            ensure!(self.get(reg) == value, "{} not preserved", reg);
        }
        Ok(self.get(target.ret_reg))
    }

    fn run(&mut self, entry: usize) -> Result<()> {
        let mut pc = entry;
        for _ in 0..MAX_STEPS {
            let inst = self
                .insts
                .get(pc)
                .cloned()
                .with_context(|| format!("ran past the last instruction ({})", pc))?;
            let next = match self.arch {
                Arch::Amd64 => self.amd64(&inst, pc),
                Arch::Arm64 => self.arm64(&inst, pc),
                Arch::Riscv64 => self.riscv64(&inst, pc),
            }
            .with_context(|| format!("line {}: `{}`", inst.line, inst.text))?;
            match next {
                Some(next) => pc = next,
                None => return Ok(()),
            }
        }
        bail!("step limit exceeded")
    }

    fn get(&self, reg: &str) -> i64 {
        match reg {
            "xzr" | "zero" => 0,
            "al" => self.get("rax") & 0xff,
            _ => self.regs.get(reg).copied().unwrap_or(0),
        }
    }

    fn set(&mut self, reg: &str, value: i64) {
        match reg {
            "xzr" | "zero" => {}
            "al" => {
                let rax = self.get("rax");
                self.regs.insert("rax".to_string(), (rax & !0xff) | (value & 0xff));
            }
            _ => {
                self.regs.insert(reg.to_string(), value);
            }
        }
    }

    fn load(&self, address: i64) -> Result<i64> {
        ensure!(address % 8 == 0, "unaligned load from {:#x}", address);
        self.memory
            .get(&address)
            .copied()
            .with_context(|| format!("load from uninitialized {:#x}", address))
    }

    fn store(&mut self, address: i64, value: i64) -> Result<()> {
        ensure!(address % 8 == 0, "unaligned store to {:#x}", address);
        self.memory.insert(address, value);
        Ok(())
    }

    fn label(&self, name: &str) -> Result<usize> {
        self.labels
            .get(name)
            .copied()
            .with_context(|| format!("unknown label `{}`", name))
    }

    fn return_to(&self, address: i64) -> Result<Option<usize>> {
        if address == HALT {
            return Ok(None);
        }
        ensure!(address >= RETURN_BASE, "return to garbage {:#x}", address);
        Ok(Some((address - RETURN_BASE) as usize))
    }

    /// Either enters a function in the text or runs an external. Returns
    /// the entry of an internal callee.
    fn enter(&mut self, callee: &str, sp: i64) -> Result<Option<usize>> {
        ensure!(sp % 16 == 0, "misaligned stack ({:#x}) at call to {}", sp, callee);
        if let Some(entry) = self.labels.get(callee) {
            return Ok(Some(*entry));
        }

        let arity = *self
            .externals
            .get(callee)
            .with_context(|| format!("call to unknown function `{}`", callee))?;
        let target = self.arch.target();
        let mut args: Vec<i64> = target
            .arg_regs
            .iter()
            .take(arity)
            .map(|reg| self.get(reg))
            .collect();
        for index in 0..arity.saturating_sub(target.arg_regs.len()) {
            args.push(self.load(sp + 8 * index as i64)?);
        }

        for reg in target.caller_saved {
            self.set(reg, CLOBBER);
        }
        let sum = args.iter().fold(0i64, |acc, arg| acc.wrapping_add(*arg));
        self.set(target.ret_reg, sum);
        self.calls.push((callee.to_string(), args));
        Ok(None)
    }

    // amd64

    fn x86_address(&self, operand: &str) -> Result<i64> {
        let (offset, base) = operand
            .split_once('(')
            .with_context(|| format!("bad address `{}`", operand))?;
        let base = base.trim_end_matches(')').trim_start_matches('%');
        let offset = if offset.is_empty() { 0 } else { parse_int(offset)? };
        Ok(self.get(base).wrapping_add(offset))
    }

    fn x86_value(&self, operand: &str) -> Result<i64> {
        if let Some(imm) = operand.strip_prefix('$') {
            parse_int(imm)
        } else if let Some(reg) = operand.strip_prefix('%') {
            Ok(self.get(reg))
        } else {
            self.load(self.x86_address(operand)?)
        }
    }

    fn x86_write(&mut self, operand: &str, value: i64) -> Result<()> {
        match operand.strip_prefix('%') {
            Some(reg) => {
                self.set(reg, value);
                Ok(())
            }
            None => {
                let address = self.x86_address(operand)?;
                self.store(address, value)
            }
        }
    }

    fn push(&mut self, value: i64) -> Result<()> {
        let rsp = self.get("rsp") - 8;
        self.set("rsp", rsp);
        self.store(rsp, value)
    }

    fn pop(&mut self) -> Result<i64> {
        let rsp = self.get("rsp");
        let value = self.load(rsp)?;
        self.set("rsp", rsp + 8);
        Ok(value)
    }

    fn amd64(&mut self, inst: &Inst, pc: usize) -> Result<Option<usize>> {
        let ops: Vec<&str> = inst.operands.iter().map(String::as_str).collect();
        match (inst.mnemonic.as_str(), ops.as_slice()) {
            ("movq" | "movabsq", [src, dst]) => {
                let value = self.x86_value(src)?;
                self.x86_write(dst, value)?;
            }
            (op @ ("addq" | "subq" | "imulq" | "andq" | "orq" | "xorq"), [src, dst]) => {
                let lhs = self.x86_value(dst)?;
                let rhs = self.x86_value(src)?;
                let value = match op {
                    "addq" => lhs.wrapping_add(rhs),
                    "subq" => lhs.wrapping_sub(rhs),
                    "imulq" => lhs.wrapping_mul(rhs),
                    "andq" => lhs & rhs,
                    "orq" => lhs | rhs,
                    _ => lhs ^ rhs,
                };
                self.x86_write(dst, value)?;
            }
            ("cmpq", [src, dst]) => self.flags = (self.x86_value(dst)?, self.x86_value(src)?),
            ("testq", [src, dst]) => self.flags = (self.x86_value(dst)? & self.x86_value(src)?, 0),
            (m, [dst]) if m.starts_with("set") => {
                let bit = condition(&m[3..], self.flags)? as i64;
                self.x86_write(dst, bit)?;
            }
            ("movzbq", [src, dst]) => {
                let value = self.x86_value(src)? & 0xff;
                self.x86_write(dst, value)?;
            }
            ("cqto", []) => {
                let rdx = if self.get("rax") < 0 { -1 } else { 0 };
                self.set("rdx", rdx);
            }
            ("idivq", [divisor]) => {
                let divisor = self.x86_value(divisor)?;
                let rax = self.get("rax");
                let sign = if rax < 0 { -1 } else { 0 };
                ensure!(self.get("rdx") == sign, "rdx does not hold the sign of rax");
                ensure!(divisor != 0, "division by zero");
                self.set("rax", rax.wrapping_div(divisor));
                self.set("rdx", rax.wrapping_rem(divisor));
            }
            ("pushq", [src]) => {
                let value = self.x86_value(src)?;
                self.push(value)?;
            }
            ("popq", [dst]) => {
                let value = self.pop()?;
                self.x86_write(dst, value)?;
            }
            ("callq" | "call", [callee]) => {
                if let Some(entry) = self.enter(callee, self.get("rsp"))? {
                    self.push(RETURN_BASE + pc as i64 + 1)?;
                    return Ok(Some(entry));
                }
            }
            ("retq" | "ret", []) => {
                let address = self.pop()?;
                return self.return_to(address);
            }
            ("jmp", [label]) => return self.label(label).map(Some),
            (m, [label]) if m.starts_with('j') => {
                if condition(&m[1..], self.flags)? {
                    return self.label(label).map(Some);
                }
            }
            _ => bail!("unsupported instruction"),
        }
        Ok(Some(pc + 1))
    }

    // arm64

    fn arm_value(&self, operand: &str) -> Result<i64> {
        match operand.strip_prefix('#') {
            Some(imm) => parse_int(imm),
            None => Ok(self.get(operand)),
        }
    }

    /// Address of `[base]`, `[base, #imm]` or `[base, #imm]!`, applying
    /// the pre-index writeback.
    fn arm_address(&mut self, operand: &str) -> Result<i64> {
        let writeback = operand.ends_with('!');
        let inner = operand
            .trim_end_matches('!')
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .with_context(|| format!("bad address `{}`", operand))?;
        let (base, offset) = match inner.split_once(", ") {
            Some((base, offset)) => (base, self.arm_value(offset)?),
            None => (inner, 0),
        };
        let address = self.get(base).wrapping_add(offset);
        if writeback {
            self.set(base, address);
        }
        Ok(address)
    }

    fn post_index(&mut self, address: &str, post: Option<&&str>) -> Result<()> {
        if let Some(post) = post {
            let base = address.trim_start_matches('[').trim_end_matches(']');
            let value = self.get(base) + self.arm_value(post)?;
            self.set(base, value);
        }
        Ok(())
    }

    fn arm64(&mut self, inst: &Inst, pc: usize) -> Result<Option<usize>> {
        let ops: Vec<&str> = inst.operands.iter().map(String::as_str).collect();
        let shift = |operand: Option<&&str>| -> Result<u32> {
            match operand {
                None => Ok(0),
                Some(text) => Ok(parse_int(text.trim_start_matches("lsl #"))? as u32),
            }
        };

        match (inst.mnemonic.as_str(), ops.as_slice()) {
            ("mov", [dst, src]) => {
                let value = self.arm_value(src)?;
                self.set(dst, value);
            }
            ("movz", [dst, chunk, rest @ ..]) => {
                let value = self.arm_value(chunk)? << shift(rest.first())?;
                self.set(dst, value);
            }
            ("movk", [dst, chunk, rest @ ..]) => {
                let shift = shift(rest.first())?;
                let value = (self.get(dst) & !(0xffff << shift)) | (self.arm_value(chunk)? << shift);
                self.set(dst, value);
            }
            (op @ ("add" | "sub" | "mul" | "sdiv" | "and" | "orr" | "eor" | "lsl"), [dst, lhs, rhs]) => {
                let lhs = self.get(lhs);
                let rhs = self.arm_value(rhs)?;
                let value = match op {
                    "add" => lhs.wrapping_add(rhs),
                    "sub" => lhs.wrapping_sub(rhs),
                    "mul" => lhs.wrapping_mul(rhs),
                    "sdiv" if rhs == 0 => 0,
                    "sdiv" => lhs.wrapping_div(rhs),
                    "and" => lhs & rhs,
                    "orr" => lhs | rhs,
                    "lsl" => lhs.wrapping_shl(rhs as u32),
                    _ => lhs ^ rhs,
                };
                self.set(dst, value);
            }
            ("madd", [dst, lhs, rhs, addend]) => {
                let value = self.get(lhs).wrapping_mul(self.get(rhs)).wrapping_add(self.get(addend));
                self.set(dst, value);
            }
            ("cmp", [lhs, rhs]) => self.flags = (self.get(lhs), self.arm_value(rhs)?),
            ("tst", [lhs, rhs]) => self.flags = (self.get(lhs) & self.arm_value(rhs)?, 0),
            ("paciasp" | "autiasp", []) => {}
            ("cset", [dst, code]) => {
                let bit = condition(code, self.flags)? as i64;
                self.set(dst, bit);
            }
            ("ldr", [dst, address, post @ ..]) => {
                let value = self.arm_address(address).and_then(|a| self.load(a))?;
                self.set(dst, value);
                self.post_index(address, post.first())?;
            }
            ("str", [src, address, post @ ..]) => {
                let value = self.get(src);
                let at = self.arm_address(address)?;
                self.store(at, value)?;
                self.post_index(address, post.first())?;
            }
            ("ldp", [first, second, address, post @ ..]) => {
                let at = self.arm_address(address)?;
                let (a, b) = (self.load(at)?, self.load(at + 8)?);
                self.set(first, a);
                self.set(second, b);
                self.post_index(address, post.first())?;
            }
            ("stp", [first, second, address, post @ ..]) => {
                let (a, b) = (self.get(first), self.get(second));
                let at = self.arm_address(address)?;
                self.store(at, a)?;
                self.store(at + 8, b)?;
                self.post_index(address, post.first())?;
            }
            ("b", [label]) => return self.label(label).map(Some),
            ("bl", [callee]) => {
                if let Some(entry) = self.enter(callee, self.get("sp"))? {
                    self.set("x30", RETURN_BASE + pc as i64 + 1);
                    return Ok(Some(entry));
                }
            }
            ("cbnz", [reg, label]) if self.get(reg) != 0 => return self.label(label).map(Some),
            ("cbz", [reg, label]) if self.get(reg) == 0 => return self.label(label).map(Some),
            ("cbnz" | "cbz", [_, _]) => {}
            ("ret", []) => return self.return_to(self.get("x30")),
            _ => bail!("unsupported instruction"),
        }
        Ok(Some(pc + 1))
    }

    // riscv64

    fn rv_address(&self, operand: &str) -> Result<i64> {
        let (offset, base) = operand
            .split_once('(')
            .with_context(|| format!("bad address `{}`", operand))?;
        Ok(self.get(base.trim_end_matches(')')).wrapping_add(parse_int(offset)?))
    }

    fn riscv64(&mut self, inst: &Inst, pc: usize) -> Result<Option<usize>> {
        let ops: Vec<&str> = inst.operands.iter().map(String::as_str).collect();
        match (inst.mnemonic.as_str(), ops.as_slice()) {
            ("li", [dst, imm]) => self.set(dst, parse_int(imm)?),
            ("lui", [dst, imm]) => self.set(dst, ((parse_int(imm)? << 12) as i32) as i64),
            ("addiw", [dst, src, imm]) => {
                let value = (self.get(src) as i32).wrapping_add(parse_int(imm)? as i32);
                self.set(dst, value as i64);
            }
            (op @ ("addi" | "slli" | "andi" | "ori" | "xori" | "sltiu"), [dst, src, imm]) => {
                let lhs = self.get(src);
                let imm = parse_int(imm)?;
                let value = match op {
                    "addi" => lhs.wrapping_add(imm),
                    "slli" => lhs.wrapping_shl(imm as u32),
                    "andi" => lhs & imm,
                    "ori" => lhs | imm,
                    "xori" => lhs ^ imm,
                    _ => ((lhs as u64) < (imm as u64)) as i64,
                };
                self.set(dst, value);
            }
            ("mv", [dst, src]) => {
                let value = self.get(src);
                self.set(dst, value);
            }
            (
                op @ ("add" | "sub" | "mul" | "div" | "and" | "or" | "xor" | "slt" | "sltu"),
                [dst, lhs, rhs],
            ) => {
                let (lhs, rhs) = (self.get(lhs), self.get(rhs));
                let value = match op {
                    "add" => lhs.wrapping_add(rhs),
                    "sub" => lhs.wrapping_sub(rhs),
                    "mul" => lhs.wrapping_mul(rhs),
                    "div" if rhs == 0 => -1,
                    "div" => lhs.wrapping_div(rhs),
                    "and" => lhs & rhs,
                    "or" => lhs | rhs,
                    "xor" => lhs ^ rhs,
                    "slt" => (lhs < rhs) as i64,
                    _ => ((lhs as u64) < (rhs as u64)) as i64,
                };
                self.set(dst, value);
            }
            ("ld", [dst, address]) => {
                let value = self.load(self.rv_address(address)?)?;
                self.set(dst, value);
            }
            ("sd", [src, address]) => {
                let at = self.rv_address(address)?;
                self.store(at, self.get(src))?;
            }
            ("j", [label]) => return self.label(label).map(Some),
            ("bnez", [reg, label]) if self.get(reg) != 0 => return self.label(label).map(Some),
            ("beqz", [reg, label]) if self.get(reg) == 0 => return self.label(label).map(Some),
            ("bnez" | "beqz", [_, _]) => {}
            ("call", [callee]) => {
                if let Some(entry) = self.enter(callee, self.get("sp"))? {
                    self.set("ra", RETURN_BASE + pc as i64 + 1);
                    return Ok(Some(entry));
                }
            }
            ("ret", []) => return self.return_to(self.get("ra")),
            _ => bail!("unsupported instruction"),
        }
        Ok(Some(pc + 1))
    }
}
