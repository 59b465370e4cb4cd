// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Symmetric stack switching for x86_64 SysV.
//!
//! Unlike a generator's resume/suspend pair, a switch here does not assume
//! anything about who it is switching to or who will eventually switch back.
//! `fiber_switch` just saves the current stack pointer to the address it is
//! given and jumps to the stack pointer it is given. Every fiber keeps track
//! of its own resume point; there is no shared "parent link" slot.

use crate::stack::StackPointer;
use core::arch::naked_asm;

pub const STACK_ALIGNMENT: usize = 16;

/// Number of callee-saved registers `fiber_switch` pushes/pops, used by
/// [`init_stack`] to lay out a stack that looks like one that already
/// suspended inside `fiber_switch` once.
const SAVED_REGISTERS: usize = 6; // rbp, rbx, r12, r13, r14, r15

/// Prepares a fresh stack so that the first switch into it lands in `entry`
/// with `arg` available as its only argument.
///
/// # Safety
///
/// `top` must be the top (highest address) of a valid, writable, at least
/// [`STACK_ALIGNMENT`]-aligned stack allocation that nothing else is using.
pub unsafe fn init_stack(
    top: StackPointer,
    entry: unsafe extern "C" fn(usize) -> !,
) -> StackPointer {
    unsafe {
        let mut sp = top.get();

        let mut push = |val: usize| {
            sp -= size_of::<usize>();
            (sp as *mut usize).write(val);
        };

        // Popped by `ret` inside `fiber_switch` the first time this stack is
        // resumed, once the placeholder callee-saved registers below it have
        // been popped.
        push(entry as usize);
        for _ in 0..SAVED_REGISTERS {
            push(0);
        }

        StackPointer::new(sp).expect("stack pointer must be non-zero")
    }
}

/// Saves the currently executing context's stack pointer to `*old_sp_slot`,
/// switches to `new_sp`, and resumes execution there (either a fresh
/// [`init_stack`] trampoline, or a previous `fiber_switch` call on that
/// stack returning).
///
/// Returns the `arg` the other side passed when it switched into us.
///
/// # Safety
///
/// `old_sp_slot` must be valid for writes of a `usize`. `new_sp` must have
/// been produced by [`init_stack`], or be the stack pointer most recently
/// saved by a `fiber_switch` call that switched away from that stack and has
/// not been resumed since.
#[unsafe(naked)]
pub unsafe extern "C" fn fiber_switch(old_sp_slot: *mut usize, new_sp: usize, arg: usize) -> usize {
        naked_asm! {
            ".cfi_startproc",
            "push rbp",
            "push rbx",
            "push r12",
            "push r13",
            "push r14",
            "push r15",
            // Save our stack pointer (post-push) to *old_sp_slot (rdi).
            "mov [rdi], rsp",
            // Load the target stack pointer (rsi).
            "mov rsp, rsi",
            // `arg` (rdx) doubles as the return value for a resuming
            // `fiber_switch` call (rax) and as the first argument for a
            // fresh `entry` function (rdi, SysV calling convention).
            "mov rax, rdx",
            "mov rdi, rdx",
            "pop r15",
            "pop r14",
            "pop r13",
            "pop r12",
            "pop rbx",
            "pop rbp",
            "ret",
            ".cfi_endproc",
        }
}
