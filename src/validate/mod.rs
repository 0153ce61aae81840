//! Text-level checks on emitted assembly.
//!
//! The validator never looks at the IR. It re-parses the assembly with a
//! small per-target [`Dialect`] and looks for the mistakes a code generator
//! can make: unknown instructions, bad registers, unbalanced frames and
//! callee-saved registers that are not restored.

mod amd64;
mod arm64;
mod riscv64;

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    fmt::Display,
};

use itertools::Itertools;
use thiserror::Error;

use crate::frame::{Arch, TargetDescriptor};

pub use amd64::Amd64;
pub use arm64::Arm64;
pub use riscv64::Riscv64;

/// One parsed instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inst {
    pub mnemonic: String,
    pub operands: Vec<String>,
    /// 1-based line number in the input.
    pub line: usize,
    pub text: String,
}

impl Inst {
    pub fn operand(&self, index: usize) -> Option<&str> {
        self.operands.get(index).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    Label(String),
    Directive(String),
    Inst(Inst),
}

/// How an instruction moves the stack pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackEffect {
    Grow(i64),
    Shrink(i64),
    /// `fp = sp + offset`
    SetFrame(i64),
    /// `sp = fp + offset`
    RestoreFrame(i64),
    /// The stack pointer changes by an amount the validator cannot see.
    Unknown,
}

/// Syntax and conventions of one target's assembly.
pub trait Dialect {
    const ARCH: Arch;
    const COMMENT: &'static str;
    /// Registers the prologue may clobber while setting up the frame.
    const FRAME_SCRATCH: &'static [&'static str];

    fn is_mnemonic(mnemonic: &str) -> bool;
    fn is_register(name: &str) -> bool;
    /// Register names mentioned in one operand.
    fn registers(operand: &str) -> Vec<String>;
    fn is_immediate(operand: &str) -> bool;
    fn is_memory(operand: &str) -> bool;
    /// Checks the syntax of a memory operand.
    fn check_memory(operand: &str) -> Result<(), String>;

    /// Index of the operand naming a branch target or callee.
    fn label_operand(inst: &Inst) -> Option<usize>;
    /// Indices of the operands the instruction writes.
    fn destinations(inst: &Inst) -> Vec<usize>;
    /// Whether the written operand is also an input (`addq %rbx, %rax`).
    fn reads_destination(inst: &Inst) -> bool;
    fn is_call(inst: &Inst) -> bool;
    fn is_return(inst: &Inst) -> bool;
    /// `paciasp` and friends.
    fn signs_return_address(_inst: &Inst) -> bool {
        false
    }
    fn authenticates_return_address(_inst: &Inst) -> bool {
        false
    }

    /// Register-to-register copy as `(dst, src)`.
    fn as_move(inst: &Inst) -> Option<(&str, &str)>;
    /// Store of a register as `(register, address)`.
    fn as_store(inst: &Inst) -> Option<(&str, &str)>;
    /// Load into a register as `(register, address)`.
    fn as_load(inst: &Inst) -> Option<(&str, &str)>;
    /// Target of an unconditional jump.
    fn as_jump(inst: &Inst) -> Option<&str>;

    fn stack_effects(inst: &Inst, constants: &HashMap<String, i64>) -> Vec<StackEffect>;
    /// Value the instruction leaves in its destination register, if known.
    fn constant(inst: &Inst, constants: &HashMap<String, i64>) -> Option<i64>;
    /// Registers written to memory (pushes and stores).
    fn saved_registers(inst: &Inst) -> Vec<String>;
    /// Registers read back from memory (pops and loads).
    fn restored_registers(inst: &Inst) -> Vec<String>;

    /// Mnemonic that must directly precede this instruction.
    fn required_predecessor(_inst: &Inst) -> Option<&'static str> {
        None
    }

    /// Target-specific hard errors.
    fn extra_errors(_inst: &Inst) -> Vec<String> {
        Vec::new()
    }

    fn extra_warnings(_inst: &Inst) -> Vec<String> {
        Vec::new()
    }
}

/// Splits `text` into labels, directives and instructions.
pub fn parse(arch: Arch, text: &str) -> Vec<Item> {
    match arch {
        Arch::Amd64 => parse_with::<Amd64>(text),
        Arch::Arm64 => parse_with::<Arm64>(text),
        Arch::Riscv64 => parse_with::<Riscv64>(text),
    }
}

pub fn parse_with<D: Dialect>(text: &str) -> Vec<Item> {
    let mut items = Vec::new();
    for (index, raw) in text.lines().enumerate() {
        let line = match raw.find(D::COMMENT) {
            Some(at) => &raw[..at],
            None => raw,
        }
        .trim();

        if line.is_empty() {
            continue;
        }
        if let Some(label) = line.strip_suffix(':') {
            items.push(Item::Label(label.to_string()));
        } else if line.starts_with('.') {
            items.push(Item::Directive(line.to_string()));
        } else {
            let (mnemonic, rest) = match line.split_once(char::is_whitespace) {
                Some((mnemonic, rest)) => (mnemonic, rest),
                None => (line, ""),
            };
            items.push(Item::Inst(Inst {
                mnemonic: mnemonic.to_string(),
                operands: split_operands(rest),
                line: index + 1,
                text: line.to_string(),
            }));
        }
    }
    items
}

/// Splits at commas outside of brackets and parentheses.
fn split_operands(text: &str) -> Vec<String> {
    let mut operands = Vec::new();
    let mut depth = 0;
    let mut current = String::new();
    for c in text.chars() {
        match c {
            '[' | '(' => depth += 1,
            ']' | ')' => depth -= 1,
            ',' if depth == 0 => {
                operands.push(current.trim().to_string());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if !current.trim().is_empty() {
        operands.push(current.trim().to_string());
    }
    operands
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: usize,
    pub message: String,
    pub text: String,
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "line {}: {} (`{}`)", self.line, self.message, self.text)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Report {
    pub errors: Vec<Diagnostic>,
    pub warnings: Vec<Diagnostic>,
}

impl Report {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, inst: &Inst, message: impl Into<String>) {
        self.errors.push(Diagnostic {
            line: inst.line,
            message: message.into(),
            text: inst.text.clone(),
        });
    }

    fn warning(&mut self, inst: &Inst, message: impl Into<String>) {
        self.warnings.push(Diagnostic {
            line: inst.line,
            message: message.into(),
            text: inst.text.clone(),
        });
    }
}

impl Display for Report {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lines = self
            .errors
            .iter()
            .map(|d| format!("error: {}", d))
            .chain(self.warnings.iter().map(|d| format!("warning: {}", d)));
        write!(f, "{}", lines.format("\n"))
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Error {
    #[error("invalid assembly:\n{0}")]
    Invalid(Report),
}

/// Runs every check. Hard errors fail validation, warnings are returned.
pub fn validate(arch: Arch, text: &str) -> Result<Report, Error> {
    let report = check(arch, text);
    for warning in &report.warnings {
        log::warn!("{}: {}", arch, warning);
    }
    if report.is_ok() {
        Ok(report)
    } else {
        Err(Error::Invalid(report))
    }
}

/// Mnemonic and register checks only.
pub fn quick_validate(arch: Arch, text: &str) -> bool {
    fn quick<D: Dialect>(text: &str) -> bool {
        let mut report = Report::default();
        for item in parse_with::<D>(text) {
            if let Item::Inst(inst) = item {
                check_names::<D>(&inst, &mut report);
            }
        }
        report.is_ok()
    }

    match arch {
        Arch::Amd64 => quick::<Amd64>(text),
        Arch::Arm64 => quick::<Arm64>(text),
        Arch::Riscv64 => quick::<Riscv64>(text),
    }
}

/// Human-readable summary: whether the text passed, and every finding.
pub fn report(arch: Arch, text: &str) -> (bool, String) {
    let report = check(arch, text);
    let summary = format!(
        "{}: {} error(s), {} warning(s)",
        arch,
        report.errors.len(),
        report.warnings.len()
    );
    if report.errors.is_empty() && report.warnings.is_empty() {
        (true, summary)
    } else {
        (report.is_ok(), format!("{}\n{}", summary, report))
    }
}

pub fn check(arch: Arch, text: &str) -> Report {
    match arch {
        Arch::Amd64 => Checker::<Amd64>::new().run(text),
        Arch::Arm64 => Checker::<Arm64>::new().run(text),
        Arch::Riscv64 => Checker::<Riscv64>::new().run(text),
    }
}

/// Returns false if the instruction is not worth checking further.
fn check_names<D: Dialect>(inst: &Inst, report: &mut Report) -> bool {
    if !D::is_mnemonic(&inst.mnemonic) {
        report.error(inst, format!("unknown mnemonic `{}`", inst.mnemonic));
        return false;
    }

    let label = D::label_operand(inst);
    for (index, operand) in inst.operands.iter().enumerate() {
        if Some(index) == label {
            continue;
        }
        for name in D::registers(operand) {
            if !D::is_register(&name) {
                report.error(inst, format!("illegal register `{}`", name));
            }
        }
    }
    true
}

fn registers_of<D: Dialect>(inst: &Inst, indices: impl Iterator<Item = usize>) -> Vec<String> {
    indices
        .filter_map(|index| inst.operand(index))
        .flat_map(D::registers)
        .collect()
}

/// Registers the instruction writes, not counting address registers of a
/// memory destination.
fn written<D: Dialect>(inst: &Inst) -> Vec<String> {
    let indices = D::destinations(inst)
        .into_iter()
        .filter(|index| inst.operand(*index).map_or(false, |op| !D::is_memory(op)));
    registers_of::<D>(inst, indices)
}

fn read<D: Dialect>(inst: &Inst) -> Vec<String> {
    let destinations = D::destinations(inst);
    let label = D::label_operand(inst);
    let indices = (0..inst.operands.len()).filter(|index| {
        Some(*index) != label
            && (!destinations.contains(index)
                || D::reads_destination(inst)
                || inst.operand(*index).map_or(false, D::is_memory))
    });
    registers_of::<D>(inst, indices)
}

/// Per-function state, reset at every global label.
struct Frame {
    in_prologue: bool,
    saved: BTreeSet<String>,
    fp_saved: bool,
    lr_saved: bool,
    signed: bool,
    authenticated: bool,
    restored: HashSet<String>,
    depth: i64,
    body_depth: i64,
    fp_depth: Option<i64>,
    tracking: bool,
}

impl Frame {
    fn new() -> Self {
        Self {
            in_prologue: true,
            saved: BTreeSet::new(),
            fp_saved: false,
            lr_saved: false,
            signed: false,
            authenticated: false,
            restored: HashSet::new(),
            depth: 0,
            body_depth: 0,
            fp_depth: None,
            tracking: true,
        }
    }
}

struct Checker<D: Dialect> {
    target: &'static TargetDescriptor,
    report: Report,
    frame: Frame,
    constants: HashMap<String, i64>,
    clobbered: HashSet<String>,
    _dialect: std::marker::PhantomData<D>,
}

impl<D: Dialect> Checker<D> {
    fn new() -> Self {
        Self {
            target: D::ARCH.target(),
            report: Report::default(),
            frame: Frame::new(),
            constants: HashMap::new(),
            clobbered: HashSet::new(),
            _dialect: std::marker::PhantomData,
        }
    }

    fn run(mut self, text: &str) -> Report {
        let items = parse_with::<D>(text);

        for item in &items {
            match item {
                Item::Label(name) => self.label(name),
                Item::Directive(_) => {}
                Item::Inst(inst) => self.instruction(inst),
            }
        }

        // adjacent instructions, not separated by a label
        let runs = items.split(|item| matches!(item, Item::Label(_)));
        for run in runs {
            let insts = run.iter().filter_map(|item| match item {
                Item::Inst(inst) => Some(inst),
                _ => None,
            });
            for (first, second) in insts.tuple_windows() {
                self.pair(first, second);
            }
        }
        if let Some(Item::Inst(first)) = items.iter().find(|item| matches!(item, Item::Inst(_))) {
            self.pair_start(first);
        }

        self.report
    }

    fn label(&mut self, name: &str) {
        if !name.starts_with(".L") {
            self.frame = Frame::new();
        } else {
            self.end_prologue();
        }
        self.constants.clear();
        self.clobbered.clear();
    }

    fn end_prologue(&mut self) {
        if self.frame.in_prologue {
            self.frame.in_prologue = false;
            self.frame.body_depth = self.frame.depth;
        }
    }

    fn is_frame_setup(&self, inst: &Inst, effects: &[StackEffect]) -> bool {
        if !D::saved_registers(inst).is_empty()
            || !effects.is_empty()
            || D::signs_return_address(inst)
        {
            return true;
        }
        let written = written::<D>(inst);
        !written.is_empty()
            && written
                .iter()
                .all(|reg| D::FRAME_SCRATCH.contains(&reg.as_str()))
    }

    fn instruction(&mut self, inst: &Inst) {
        if !check_names::<D>(inst, &mut self.report) {
            return;
        }

        for operand in inst.operands.iter().filter(|op| D::is_memory(op)) {
            if let Err(message) = D::check_memory(operand) {
                self.report.error(inst, message);
            }
        }
        for index in D::destinations(inst) {
            if inst.operand(index).map_or(false, D::is_immediate) {
                self.report.error(inst, "immediate used as a destination");
            }
        }
        for message in D::extra_errors(inst) {
            self.report.error(inst, message);
        }
        for message in D::extra_warnings(inst) {
            self.report.warning(inst, message);
        }

        let effects = D::stack_effects(inst, &self.constants);
        if self.frame.in_prologue && !self.is_frame_setup(inst, &effects) {
            self.end_prologue();
        }
        self.stack(inst, &effects);
        self.authentication(inst);
        self.saves(inst);
        self.calls(inst);

        let value = D::constant(inst, &self.constants);
        for reg in written::<D>(inst) {
            match value {
                Some(value) => self.constants.insert(reg, value),
                None => self.constants.remove(&reg),
            };
        }
    }

    fn stack(&mut self, inst: &Inst, effects: &[StackEffect]) {
        let frame = &mut self.frame;
        for effect in effects {
            match *effect {
                StackEffect::Grow(bytes) => frame.depth += bytes,
                StackEffect::Shrink(bytes) => frame.depth -= bytes,
                StackEffect::SetFrame(offset) => frame.fp_depth = Some(frame.depth - offset),
                StackEffect::RestoreFrame(offset) => match frame.fp_depth {
                    Some(fp_depth) => frame.depth = fp_depth - offset,
                    None => frame.tracking = false,
                },
                StackEffect::Unknown => frame.tracking = false,
            }
            if frame.tracking && frame.depth < 0 {
                self.report.error(inst, "stack underflow");
                frame.depth = 0;
            }
        }

        if D::is_return(inst) {
            if frame.tracking && frame.depth != 0 {
                let message = format!("possible stack imbalance: {} byte(s) at return", frame.depth);
                self.report.warning(inst, message);
            }
            frame.depth = frame.body_depth;
        }
    }

    fn authentication(&mut self, inst: &Inst) {
        let frame = &mut self.frame;
        if D::signs_return_address(inst) {
            if !frame.in_prologue || frame.signed {
                self.report
                    .error(inst, "return address signed outside the prologue");
            }
            frame.signed = true;
        }
        if D::authenticates_return_address(inst) {
            if !frame.signed {
                self.report
                    .error(inst, "return address authenticated but never signed");
            }
            frame.authenticated = true;
        }
        if D::is_return(inst) {
            if frame.signed && !frame.authenticated {
                self.report
                    .error(inst, "signed return address is not authenticated before return");
            }
            frame.authenticated = false;
        }
    }

    fn saves(&mut self, inst: &Inst) {
        let fp = self.target.frame_pointer;
        let lr = self.target.link_register;

        if self.frame.in_prologue {
            for reg in D::saved_registers(inst) {
                if reg == fp {
                    self.frame.fp_saved = true;
                } else if Some(reg.as_str()) == lr {
                    self.frame.lr_saved = true;
                } else if self.target.is_callee_saved(&reg) {
                    self.frame.saved.insert(reg);
                }
            }
        }
        for reg in D::restored_registers(inst) {
            self.frame.restored.insert(reg);
        }

        if !D::is_return(inst) {
            return;
        }
        for reg in &self.frame.saved {
            if !self.frame.restored.contains(reg) {
                let message = format!("callee-saved register {} is saved but not restored before return", reg);
                self.report.error(inst, message);
            }
        }
        if lr.is_some() && self.frame.fp_saved != self.frame.lr_saved {
            self.report
                .warning(inst, "frame pointer and link register are not saved as a pair");
        }
        if self.frame.fp_saved && !self.frame.restored.contains(fp) {
            self.report.warning(inst, "frame pointer is not restored before return");
        }
        if let Some(lr) = lr.filter(|_| self.frame.lr_saved) {
            if !self.frame.restored.contains(lr) {
                self.report.warning(inst, "link register is not restored before return");
            }
        }
        self.frame.restored.clear();
    }

    fn calls(&mut self, inst: &Inst) {
        for reg in read::<D>(inst) {
            if self.clobbered.remove(&reg) {
                let message = format!("{} is read after a call clobbered it", reg);
                self.report.warning(inst, message);
            }
        }
        for reg in written::<D>(inst) {
            self.clobbered.remove(&reg);
        }
        if D::is_call(inst) {
            self.clobbered = self
                .target
                .caller_saved
                .iter()
                .filter(|reg| **reg != self.target.ret_reg)
                .map(|reg| reg.to_string())
                .collect();
        }
    }

    fn pair_start(&mut self, first: &Inst) {
        if let Some(required) = D::required_predecessor(first) {
            let message = format!("{} without a preceding {}", first.mnemonic, required);
            self.report.warning(first, message);
        }
    }

    fn pair(&mut self, first: &Inst, second: &Inst) {
        if let Some(required) = D::required_predecessor(second) {
            if first.mnemonic != required {
                let message = format!("{} without a preceding {}", second.mnemonic, required);
                self.report.warning(second, message);
            }
        }

        if let Some((dst, src)) = D::as_move(first) {
            if dst == src {
                self.report.warning(first, "self-move");
                return;
            }
            if let Some((dst2, src2)) = D::as_move(second) {
                if dst2 == src && src2 == dst {
                    self.report.warning(second, "swap idiom: the second move is redundant");
                    return;
                }
            }
            let overwritten = written::<D>(second).iter().any(|reg| reg == dst)
                && !read::<D>(second).iter().any(|reg| reg == dst);
            if overwritten {
                self.report.warning(first, "move result is immediately overwritten");
            }
        }
    }
}
