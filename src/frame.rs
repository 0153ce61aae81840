use std::fmt::Display;

use strum::{EnumIter, EnumString};

use crate::codegen::reg_alloc::Allocation;

pub type Register = &'static str;

/// Target instruction set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumString, EnumIter, strum::Display)]
pub enum Arch {
    #[strum(to_string = "amd64", serialize = "x86_64", serialize = "x86-64")]
    Amd64,
    #[strum(to_string = "arm64", serialize = "aarch64")]
    Arm64,
    #[strum(to_string = "riscv64", serialize = "rv64")]
    Riscv64,
}

impl Arch {
    pub fn target(self) -> &'static TargetDescriptor {
        match self {
            Arch::Amd64 => &crate::codegen::amd64::frame::AMD64,
            Arch::Arm64 => &crate::codegen::arm64::frame::ARM64,
            Arch::Riscv64 => &crate::codegen::riscv64::frame::RISCV64,
        }
    }
}

/// Constant description of a calling convention and register file.
#[derive(Debug)]
pub struct TargetDescriptor {
    pub arch: Arch,

    /// Must be in the same order as the arguments in the function.
    /// ex. `[x0, x1, x2, ..., x7]` for ARM64.
    pub arg_regs: &'static [Register],
    /// Return value register.
    pub ret_reg: Register,
    pub callee_saved: &'static [Register],
    pub caller_saved: &'static [Register],

    /// Registers handed out by the allocators, in preference order. All of
    /// them are callee-saved, so no allocated value is clobbered by a call.
    pub allocatable: &'static [Register],
    /// Registers reserved for the code generator. Each backend refers to
    /// them by index.
    pub scratch: &'static [Register],

    pub frame_pointer: Register,
    /// `None` when the return address lives on the stack (amd64).
    pub link_register: Option<Register>,

    pub stack_align: u32,
    pub word_size: u32,
    /// Calls may pass at most this many arguments on the stack.
    pub max_stack_args: usize,
}

impl TargetDescriptor {
    pub fn is_callee_saved(&self, reg: &str) -> bool {
        self.callee_saved.contains(&reg)
    }

    pub fn max_call_args(&self) -> usize {
        self.arg_regs.len() + self.max_stack_args
    }
}

/// Stack frame layout of one function.
///
/// ```text
///   higher addresses
///   | incoming stack arguments      |
///   | return address / link         |
///   | saved frame pointer           |  <- fixed 16 bytes
///   | saved callee-saved registers  |
///   | spill slots                   |
///   | outgoing stack arguments      |  <- stack pointer inside the body
///   lower addresses
/// ```
///
/// amd64 pushes outgoing arguments instead of reserving them, so its
/// `outgoing` size is always zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    saved: Vec<Register>,
    spill_size: u32,
    outgoing_size: u32,
    size: u32,
}

/// Frame pointer plus return address.
pub const FIXED_AREA: u32 = 16;

impl Frame {
    pub fn new(target: &TargetDescriptor, allocation: &Allocation, outgoing_args: usize) -> Self {
        let used = allocation.registers();
        let saved: Vec<Register> = target
            .callee_saved
            .iter()
            .copied()
            .filter(|reg| used.contains(reg))
            .collect();

        let spill_size = allocation.spill_size();
        let outgoing_size = outgoing_args as u32 * target.word_size;
        let body = outgoing_size + saved.len() as u32 * target.word_size + spill_size;
        let size = FIXED_AREA + align(body, target.stack_align);

        Self {
            saved,
            spill_size,
            outgoing_size,
            size,
        }
    }

    /// Total bytes, a multiple of the stack alignment.
    pub fn size(&self) -> u32 {
        self.size
    }

    /// Bytes below the fixed area.
    pub fn local_size(&self) -> u32 {
        self.size - FIXED_AREA
    }

    pub fn saved(&self) -> &[Register] {
        &self.saved
    }

    pub fn spill_size(&self) -> u32 {
        self.spill_size
    }

    pub fn outgoing_size(&self) -> u32 {
        self.outgoing_size
    }

    /// Offset of the `index`-th saved register from the body stack pointer.
    pub fn save_offset(&self, index: usize) -> u32 {
        self.outgoing_size + index as u32 * 8
    }

    /// Offset of a spill slot from the body stack pointer.
    pub fn spill_offset(&self, slot: u32) -> u32 {
        self.outgoing_size + self.saved.len() as u32 * 8 + slot
    }
}

impl Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "frame {} bytes (saved {:?}, spills {}, outgoing {})",
            self.size, self.saved, self.spill_size, self.outgoing_size
        )
    }
}

pub fn align(value: u32, to: u32) -> u32 {
    (value + to - 1) / to * to
}
