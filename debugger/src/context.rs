// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Thread-context capture and manipulation across bitness. A context is
//! captured while the owning thread is frozen by a debug event and flushed
//! back with the matching Set call before the thread resumes.

use std::mem::MaybeUninit;

use anyhow::{Context as AnyhowContext, Result};
use win_util::{check_winapi, process};
use winapi::um::{
    processthreadsapi::{GetThreadContext, SetThreadContext},
    winbase::{Wow64GetThreadContext, Wow64SetThreadContext},
    winnt::{CONTEXT, CONTEXT_ALL, HANDLE, WOW64_CONTEXT, WOW64_CONTEXT_ALL},
};

use crate::{
    error::DebuggerError,
    registers::{DrReg, Flag, Register, Register32, Register64},
};

const TRAP_FLAG: u32 = 1 << 8;

// Required by `CONTEXT`, which winapi does not align (a long-standing FIXME
// there).
#[repr(C, align(16))]
pub struct Aligned16<T>(pub T);

#[allow(clippy::large_enum_variant)]
pub enum ThreadContext {
    X64(Aligned16<CONTEXT>),
    X86(WOW64_CONTEXT),
}

/// Capture the full context of a frozen thread; the flavor follows the
/// debuggee's bitness, not the debugger's.
pub fn get_thread_context(process_handle: HANDLE, thread_handle: HANDLE) -> Result<ThreadContext> {
    if process::is_wow64_process(process_handle) {
        let mut ctx: WOW64_CONTEXT = unsafe { MaybeUninit::zeroed().assume_init() };
        ctx.ContextFlags = WOW64_CONTEXT_ALL;

        check_winapi(|| unsafe { Wow64GetThreadContext(thread_handle, &mut ctx) })
            .context("Wow64GetThreadContext")?;
        Ok(ThreadContext::X86(ctx))
    } else {
        let mut ctx: Aligned16<CONTEXT> = unsafe { MaybeUninit::zeroed().assume_init() };

        ctx.0.ContextFlags = CONTEXT_ALL;
        check_winapi(|| unsafe { GetThreadContext(thread_handle, &mut ctx.0) })
            .context("GetThreadContext")?;
        Ok(ThreadContext::X64(ctx))
    }
}

impl ThreadContext {
    pub fn set_thread_context(&self, thread_handle: HANDLE) -> Result<()> {
        match self {
            ThreadContext::X86(ctx) => {
                check_winapi(|| unsafe { Wow64SetThreadContext(thread_handle, ctx) })
                    .context("Wow64SetThreadContext")?
            }
            ThreadContext::X64(ctx) => {
                check_winapi(|| unsafe { SetThreadContext(thread_handle, &ctx.0) })
                    .context("SetThreadContext")?
            }
        }

        Ok(())
    }

    pub fn program_counter(&self) -> u64 {
        match self {
            ThreadContext::X64(ctx) => ctx.0.Rip,
            ThreadContext::X86(ctx) => ctx.Eip as u64,
        }
    }

    pub fn set_program_counter(&mut self, ip: u64) {
        match self {
            ThreadContext::X64(ctx) => {
                ctx.0.Rip = ip;
            }
            ThreadContext::X86(ctx) => {
                ctx.Eip = ip as u32;
            }
        }
    }

    /// Back the instruction pointer up, e.g. over the INT3 byte the OS
    /// already consumed when it reported a breakpoint exception.
    pub fn rewind_program_counter(&mut self, bytes: u64) {
        let pc = self.program_counter().wrapping_sub(bytes);
        self.set_program_counter(pc);
    }

    pub fn flags(&self) -> u32 {
        match self {
            ThreadContext::X64(ctx) => ctx.0.EFlags,
            ThreadContext::X86(ctx) => ctx.EFlags,
        }
    }

    fn flags_mut(&mut self) -> &mut u32 {
        match self {
            ThreadContext::X64(ctx) => &mut ctx.0.EFlags,
            ThreadContext::X86(ctx) => &mut ctx.EFlags,
        }
    }

    pub fn set_single_step(&mut self, enable: bool) {
        let flags = self.flags_mut();
        if enable {
            *flags |= TRAP_FLAG;
        } else {
            *flags &= !TRAP_FLAG;
        }
    }

    fn check_width(&self, is_x64_value: bool) -> Result<()> {
        let matches = matches!(self, ThreadContext::X64(_)) == is_x64_value;
        if matches {
            Ok(())
        } else {
            Err(DebuggerError::ArchMismatch.into())
        }
    }

    pub fn get_flag(&self, flag: impl Into<Flag>) -> Result<bool> {
        let flag = flag.into();
        self.check_width(matches!(flag, Flag::X64(_)))?;
        Ok(self.flags() & flag.mask() != 0)
    }

    pub fn set_flag(&mut self, flag: impl Into<Flag>, value: bool) -> Result<()> {
        let flag = flag.into();
        self.check_width(matches!(flag, Flag::X64(_)))?;

        let flags = self.flags_mut();
        if value {
            *flags |= flag.mask();
        } else {
            *flags &= !flag.mask();
        }
        Ok(())
    }

    pub fn read_register(&self, reg: impl Into<Register>) -> Result<u64> {
        let value = match (self, reg.into()) {
            (ThreadContext::X64(cr), Register::X64(reg)) => {
                let cr = &cr.0;
                match reg {
                    Register64::Rax => cr.Rax,
                    Register64::Rbx => cr.Rbx,
                    Register64::Rcx => cr.Rcx,
                    Register64::Rdx => cr.Rdx,
                    Register64::Rsi => cr.Rsi,
                    Register64::Rdi => cr.Rdi,
                    Register64::Rbp => cr.Rbp,
                    Register64::Rsp => cr.Rsp,
                    Register64::R8 => cr.R8,
                    Register64::R9 => cr.R9,
                    Register64::R10 => cr.R10,
                    Register64::R11 => cr.R11,
                    Register64::R12 => cr.R12,
                    Register64::R13 => cr.R13,
                    Register64::R14 => cr.R14,
                    Register64::R15 => cr.R15,
                    Register64::Rip => cr.Rip,
                    Register64::Rflags => cr.EFlags as u64,
                    Register64::Cs => cr.SegCs as u64,
                    Register64::Ds => cr.SegDs as u64,
                    Register64::Es => cr.SegEs as u64,
                    Register64::Fs => cr.SegFs as u64,
                    Register64::Gs => cr.SegGs as u64,
                    Register64::Ss => cr.SegSs as u64,
                }
            }

            (ThreadContext::X86(cr), Register::X86(reg)) => {
                let value = match reg {
                    Register32::Eax => cr.Eax,
                    Register32::Ebx => cr.Ebx,
                    Register32::Ecx => cr.Ecx,
                    Register32::Edx => cr.Edx,
                    Register32::Esi => cr.Esi,
                    Register32::Edi => cr.Edi,
                    Register32::Ebp => cr.Ebp,
                    Register32::Esp => cr.Esp,
                    Register32::Eip => cr.Eip,
                    Register32::Eflags => cr.EFlags,
                    Register32::Cs => cr.SegCs,
                    Register32::Ds => cr.SegDs,
                    Register32::Es => cr.SegEs,
                    Register32::Fs => cr.SegFs,
                    Register32::Gs => cr.SegGs,
                    Register32::Ss => cr.SegSs,
                };
                value as u64
            }

            _ => return Err(DebuggerError::ArchMismatch.into()),
        };

        Ok(value)
    }

    pub fn write_register(&mut self, reg: impl Into<Register>, value: u64) -> Result<()> {
        match (self, reg.into()) {
            (ThreadContext::X64(cr), Register::X64(reg)) => {
                let cr = &mut cr.0;
                match reg {
                    Register64::Rax => cr.Rax = value,
                    Register64::Rbx => cr.Rbx = value,
                    Register64::Rcx => cr.Rcx = value,
                    Register64::Rdx => cr.Rdx = value,
                    Register64::Rsi => cr.Rsi = value,
                    Register64::Rdi => cr.Rdi = value,
                    Register64::Rbp => cr.Rbp = value,
                    Register64::Rsp => cr.Rsp = value,
                    Register64::R8 => cr.R8 = value,
                    Register64::R9 => cr.R9 = value,
                    Register64::R10 => cr.R10 = value,
                    Register64::R11 => cr.R11 = value,
                    Register64::R12 => cr.R12 = value,
                    Register64::R13 => cr.R13 = value,
                    Register64::R14 => cr.R14 = value,
                    Register64::R15 => cr.R15 = value,
                    Register64::Rip => cr.Rip = value,
                    Register64::Rflags => cr.EFlags = value as u32,
                    Register64::Cs => cr.SegCs = value as u16,
                    Register64::Ds => cr.SegDs = value as u16,
                    Register64::Es => cr.SegEs = value as u16,
                    Register64::Fs => cr.SegFs = value as u16,
                    Register64::Gs => cr.SegGs = value as u16,
                    Register64::Ss => cr.SegSs = value as u16,
                }
            }

            (ThreadContext::X86(cr), Register::X86(reg)) => {
                let value = value as u32;
                match reg {
                    Register32::Eax => cr.Eax = value,
                    Register32::Ebx => cr.Ebx = value,
                    Register32::Ecx => cr.Ecx = value,
                    Register32::Edx => cr.Edx = value,
                    Register32::Esi => cr.Esi = value,
                    Register32::Edi => cr.Edi = value,
                    Register32::Ebp => cr.Ebp = value,
                    Register32::Esp => cr.Esp = value,
                    Register32::Eip => cr.Eip = value,
                    Register32::Eflags => cr.EFlags = value,
                    Register32::Cs => cr.SegCs = value,
                    Register32::Ds => cr.SegDs = value,
                    Register32::Es => cr.SegEs = value,
                    Register32::Fs => cr.SegFs = value,
                    Register32::Gs => cr.SegGs = value,
                    Register32::Ss => cr.SegSs = value,
                }
            }

            _ => return Err(DebuggerError::ArchMismatch.into()),
        }

        Ok(())
    }

    pub fn dr(&self, slot: DrReg) -> u64 {
        match self {
            ThreadContext::X64(cr) => match slot {
                DrReg::Dr0 => cr.0.Dr0,
                DrReg::Dr1 => cr.0.Dr1,
                DrReg::Dr2 => cr.0.Dr2,
                DrReg::Dr3 => cr.0.Dr3,
            },
            ThreadContext::X86(cr) => {
                let value = match slot {
                    DrReg::Dr0 => cr.Dr0,
                    DrReg::Dr1 => cr.Dr1,
                    DrReg::Dr2 => cr.Dr2,
                    DrReg::Dr3 => cr.Dr3,
                };
                value as u64
            }
        }
    }

    pub fn set_dr(&mut self, slot: DrReg, address: u64) {
        match self {
            ThreadContext::X64(cr) => match slot {
                DrReg::Dr0 => cr.0.Dr0 = address,
                DrReg::Dr1 => cr.0.Dr1 = address,
                DrReg::Dr2 => cr.0.Dr2 = address,
                DrReg::Dr3 => cr.0.Dr3 = address,
            },
            ThreadContext::X86(cr) => {
                let address = address as u32;
                match slot {
                    DrReg::Dr0 => cr.Dr0 = address,
                    DrReg::Dr1 => cr.Dr1 = address,
                    DrReg::Dr2 => cr.Dr2 = address,
                    DrReg::Dr3 => cr.Dr3 = address,
                }
            }
        }
    }

    pub fn dr6(&self) -> u64 {
        match self {
            ThreadContext::X64(cr) => cr.0.Dr6,
            ThreadContext::X86(cr) => cr.Dr6 as u64,
        }
    }

    pub fn set_dr6(&mut self, value: u64) {
        match self {
            ThreadContext::X64(cr) => cr.0.Dr6 = value,
            ThreadContext::X86(cr) => cr.Dr6 = value as u32,
        }
    }

    pub fn dr7(&self) -> u64 {
        match self {
            ThreadContext::X64(cr) => cr.0.Dr7,
            ThreadContext::X86(cr) => cr.Dr7 as u64,
        }
    }

    pub fn set_dr7(&mut self, value: u64) {
        match self {
            ThreadContext::X64(cr) => cr.0.Dr7 = value,
            ThreadContext::X86(cr) => cr.Dr7 = value as u32,
        }
    }

    pub fn clear_debug_registers(&mut self) {
        for slot in 0..4 {
            if let Some(slot) = DrReg::from_index(slot) {
                self.set_dr(slot, 0);
            }
        }
        self.set_dr6(0);
        self.set_dr7(0);
    }
}
