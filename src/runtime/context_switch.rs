//! Abstraction over userspace context switching.
//!
//! A [Continuation] is the saved stack pointer of a suspended computation.
//! The callee-saved registers and the resume address live on that stack, so a
//! continuation is only meaningful while the stack it points into is mapped.
//!
//! Provides an implementation for every supported CPU architecture.

use std::arch::global_asm;

/// Handle to a stack pointer set up for context switching.
#[repr(transparent)]
#[derive(Debug, Copy, Clone)]
pub(super) struct Continuation(*const ());

impl Continuation {
    #[cfg(test)]
    pub(super) fn stack_pointer(&self) -> *const () {
        self.0
    }
}

extern "C" {
    /// Initializes a stack for context switching.
    ///
    /// Restoring the returned continuation calls `func` on `stack`, which is the
    /// highest address of the region since stacks grow downward.
    #[link_name = "threadlet_prepare_stack"]
    pub(super) fn prepare_stack(stack: *mut u8, func: extern "C" fn() -> !) -> Continuation;

    /// Executes a context switch.
    ///
    /// Spills registers, sets `from` to updated stack pointer.
    /// Sets stack pointer to `to`, restores registers.
    /// Returns once another context jumps or restores back to `from`.
    #[link_name = "threadlet_jump"]
    pub(super) fn jump(from: *mut Continuation, to: *const Continuation);

    /// Sets stack pointer to `to`, restores registers.
    ///
    /// Nothing is saved, the current stack is abandoned.
    #[link_name = "threadlet_restore"]
    pub(super) fn restore(to: *const Continuation) -> !;
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
compile_error!("threadlet only supports x86_64 and aarch64");

// Frame left behind by `jump`, from low to high addresses:
// r15 r14 r13 r12 rbx rbp <resume address>
#[cfg(target_arch = "x86_64")]
global_asm!(
    ".text",
    ".global threadlet_prepare_stack",
    ".p2align 4",
    "threadlet_prepare_stack:",
    // align the top, then fake a call frame whose return address is null
    "and rdi, -16",
    "sub rdi, 16",
    "mov qword ptr [rdi + 8], 0",
    "mov [rdi], rsi",
    // zeroed callee-saved registers
    "sub rdi, 48",
    "xor eax, eax",
    "mov [rdi], rax",
    "mov [rdi + 8], rax",
    "mov [rdi + 16], rax",
    "mov [rdi + 24], rax",
    "mov [rdi + 32], rax",
    "mov [rdi + 40], rax",
    "mov rax, rdi",
    "ret",
    "",
    ".global threadlet_jump",
    ".p2align 4",
    "threadlet_jump:",
    "push rbp",
    "push rbx",
    "push r12",
    "push r13",
    "push r14",
    "push r15",
    "mov [rdi], rsp",
    "mov rsp, [rsi]",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
    "",
    ".global threadlet_restore",
    ".p2align 4",
    "threadlet_restore:",
    "mov rsp, [rdi]",
    "pop r15",
    "pop r14",
    "pop r13",
    "pop r12",
    "pop rbx",
    "pop rbp",
    "ret",
);

// Frame left behind by `jump`, from low to high addresses:
// x19..x28 x29 x30 d8..d15
#[cfg(target_arch = "aarch64")]
global_asm!(
    ".text",
    ".global threadlet_prepare_stack",
    ".p2align 4",
    "threadlet_prepare_stack:",
    "and x0, x0, #0xfffffffffffffff0",
    "sub x0, x0, #160",
    "stp xzr, xzr, [x0, #0]",
    "stp xzr, xzr, [x0, #16]",
    "stp xzr, xzr, [x0, #32]",
    "stp xzr, xzr, [x0, #48]",
    "stp xzr, xzr, [x0, #64]",
    "stp xzr, xzr, [x0, #80]",
    "stp xzr, xzr, [x0, #96]",
    "stp xzr, xzr, [x0, #112]",
    "stp xzr, xzr, [x0, #128]",
    "stp xzr, xzr, [x0, #144]",
    // x19 carries the entry function, x30 resumes into the bootstrap
    "str x1, [x0, #0]",
    "adr x9, threadlet_bootstrap",
    "str x9, [x0, #88]",
    "ret",
    "",
    ".p2align 4",
    "threadlet_bootstrap:",
    // null frame pointer and link register terminate backtraces
    "mov x29, xzr",
    "mov x30, xzr",
    "br x19",
    "",
    ".global threadlet_jump",
    ".p2align 4",
    "threadlet_jump:",
    "sub sp, sp, #160",
    "stp x19, x20, [sp, #0]",
    "stp x21, x22, [sp, #16]",
    "stp x23, x24, [sp, #32]",
    "stp x25, x26, [sp, #48]",
    "stp x27, x28, [sp, #64]",
    "stp x29, x30, [sp, #80]",
    "stp d8, d9, [sp, #96]",
    "stp d10, d11, [sp, #112]",
    "stp d12, d13, [sp, #128]",
    "stp d14, d15, [sp, #144]",
    "mov x9, sp",
    "str x9, [x0]",
    "ldr x9, [x1]",
    "mov sp, x9",
    "b threadlet_pop_frame",
    "",
    ".global threadlet_restore",
    ".p2align 4",
    "threadlet_restore:",
    "ldr x9, [x0]",
    "mov sp, x9",
    "threadlet_pop_frame:",
    "ldp x19, x20, [sp, #0]",
    "ldp x21, x22, [sp, #16]",
    "ldp x23, x24, [sp, #32]",
    "ldp x25, x26, [sp, #48]",
    "ldp x27, x28, [sp, #64]",
    "ldp x29, x30, [sp, #80]",
    "ldp d8, d9, [sp, #96]",
    "ldp d10, d11, [sp, #112]",
    "ldp d12, d13, [sp, #128]",
    "ldp d14, d15, [sp, #144]",
    "add sp, sp, #160",
    "ret",
);
