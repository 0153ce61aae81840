use crate::frame::{Arch, TargetDescriptor};

/// AAPCS64. x18 is the platform register and is never touched.
pub static ARM64: TargetDescriptor = TargetDescriptor {
    arch: Arch::Arm64,
    arg_regs: &["x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7"],
    ret_reg: "x0",
    callee_saved: &[
        "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27", "x28",
    ],
    caller_saved: &[
        "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
        "x14", "x15", "x16", "x17",
    ],
    allocatable: &[
        "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27", "x28",
    ],
    scratch: &["x9", "x10", "x11", "x15", "x16", "x17"],
    frame_pointer: "x29",
    link_register: Some("x30"),
    stack_align: 16,
    word_size: 8,
    max_stack_args: 16,
};
