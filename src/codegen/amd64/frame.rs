use crate::frame::{Arch, TargetDescriptor};

/// System V AMD64. Register names carry no `%`; the code generator adds it.
pub static AMD64: TargetDescriptor = TargetDescriptor {
    arch: Arch::Amd64,
    arg_regs: &["rdi", "rsi", "rdx", "rcx", "r8", "r9"],
    ret_reg: "rax",
    callee_saved: &["rbx", "r12", "r13", "r14", "r15"],
    caller_saved: &[
        "rax", "rcx", "rdx", "rsi", "rdi", "r8", "r9", "r10", "r11",
    ],
    allocatable: &["rbx", "r12", "r13", "r14", "r15"],
    scratch: &["rax", "rdx", "r10", "r11"],
    frame_pointer: "rbp",
    link_register: None,
    stack_align: 16,
    word_size: 8,
    max_stack_args: 16,
};
