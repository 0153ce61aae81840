use crate::frame::{Arch, TargetDescriptor};

/// RV64 LP64 integer calling convention. s0 doubles as the frame pointer.
pub static RISCV64: TargetDescriptor = TargetDescriptor {
    arch: Arch::Riscv64,
    arg_regs: &["a0", "a1", "a2", "a3", "a4", "a5", "a6", "a7"],
    ret_reg: "a0",
    callee_saved: &[
        "s1", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11",
    ],
    caller_saved: &[
        "t0", "t1", "t2", "t3", "t4", "t5", "t6", "a0", "a1", "a2", "a3", "a4", "a5", "a6", "a7",
    ],
    allocatable: &[
        "s1", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11",
    ],
    scratch: &["t0", "t1", "t2", "t3", "t6"],
    frame_pointer: "s0",
    link_register: Some("ra"),
    stack_align: 16,
    word_size: 8,
    max_stack_args: 16,
};
