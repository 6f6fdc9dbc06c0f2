// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PEB patching to defeat the common user-mode debugger checks:
//! `IsDebuggerPresent` (PEB.BeingDebugged), `NtGlobalFlag`, and the debug
//! heap flags. All writes are idempotent.

#![allow(bad_style)]

use std::{
    mem::{size_of, MaybeUninit},
    ptr,
};

use anyhow::{Context, Result};
use win_util::process;
use winapi::{
    shared::{
        basetsd::ULONG_PTR,
        minwindef::ULONG,
        ntdef::{LONG, NTSTATUS, PULONG, PVOID},
    },
    um::winnt::HANDLE,
    STRUCT,
};

// Not defined in winapi; resolved from ntdll at link time.
type THREADINFOCLASS = u32;
const ThreadBasicInformation: THREADINFOCLASS = 0;

#[link(name = "ntdll")]
extern "system" {
    fn NtQueryInformationThread(
        ThreadHandle: HANDLE,
        ThreadInformationClass: THREADINFOCLASS,
        ThreadInformation: PVOID,
        ThreadInformationLength: ULONG,
        ReturnLength: PULONG,
    ) -> NTSTATUS;
}

STRUCT! {struct CLIENT_ID {
    UniqueProcess: HANDLE,
    UniqueThread: HANDLE,
}}

STRUCT! {struct THREAD_BASIC_INFORMATION {
    ExitStatus: NTSTATUS,
    TebBaseAddress: PVOID,
    ClientId: CLIENT_ID,
    AffinityMask: ULONG_PTR,
    Priority: LONG,
    BasePriority: LONG,
}}

// PEB field offsets per bitness.
const PEB32_BEING_DEBUGGED: u64 = 0x02;
const PEB32_PROCESS_HEAP: u64 = 0x18;
const PEB32_NT_GLOBAL_FLAG: u64 = 0x68;
const PEB64_BEING_DEBUGGED: u64 = 0x02;
const PEB64_PROCESS_HEAP: u64 = 0x30;
const PEB64_NT_GLOBAL_FLAG: u64 = 0xBC;

const TEB32_PEB_POINTER: u64 = 0x30;
const TEB64_PEB_POINTER: u64 = 0x60;

const HEAP32_FLAGS: u64 = 0x40;
const HEAP32_FORCE_FLAGS: u64 = 0x44;
const HEAP64_FLAGS: u64 = 0x70;
const HEAP64_FORCE_FLAGS: u64 = 0x74;

const HEAP_TAIL_CHECKING_ENABLED: u32 = 0x0000_0020;
const HEAP_FREE_CHECKING_ENABLED: u32 = 0x0000_0040;
const HEAP_VALIDATE_PARAMETERS_ENABLED: u32 = 0x4000_0000;
const HEAP_DEBUG_FLAGS: u32 =
    HEAP_TAIL_CHECKING_ENABLED | HEAP_FREE_CHECKING_ENABLED | HEAP_VALIDATE_PARAMETERS_ENABLED;

fn teb_base_address(thread_handle: HANDLE) -> Result<u64> {
    let mut info: THREAD_BASIC_INFORMATION = unsafe { MaybeUninit::zeroed().assume_init() };
    let status = unsafe {
        NtQueryInformationThread(
            thread_handle,
            ThreadBasicInformation,
            &mut info as *mut THREAD_BASIC_INFORMATION as PVOID,
            size_of::<THREAD_BASIC_INFORMATION>() as ULONG,
            ptr::null_mut(),
        )
    };
    anyhow::ensure!(
        status >= 0,
        "NtQueryInformationThread failed: 0x{:08x}",
        status
    );
    Ok(info.TebBaseAddress as u64)
}

fn peb_base_address(process_handle: HANDLE, thread_handle: HANDLE, x86: bool) -> Result<u64> {
    let teb = teb_base_address(thread_handle)?;

    if x86 {
        // For a WoW64 thread seen from a 64-bit debugger, the 32-bit TEB
        // sits one page past the native TEB.
        #[cfg(target_pointer_width = "64")]
        let teb = teb + 0x2000;

        let peb: u32 = process::read_memory(process_handle, (teb + TEB32_PEB_POINTER) as _)
            .context("reading PEB pointer from TEB")?;
        Ok(peb as u64)
    } else {
        let peb: u64 = process::read_memory(process_handle, (teb + TEB64_PEB_POINTER) as _)
            .context("reading PEB pointer from TEB")?;
        Ok(peb)
    }
}

/// Clear `PEB.BeingDebugged` and `NtGlobalFlag`, and mask the debug flags
/// out of the default process heap.
pub(crate) fn hide_debugger(
    process_handle: HANDLE,
    main_thread_handle: HANDLE,
    x86: bool,
) -> Result<()> {
    let peb = peb_base_address(process_handle, main_thread_handle, x86)?;

    let (being_debugged, nt_global_flag, process_heap) = if x86 {
        (
            PEB32_BEING_DEBUGGED,
            PEB32_NT_GLOBAL_FLAG,
            PEB32_PROCESS_HEAP,
        )
    } else {
        (
            PEB64_BEING_DEBUGGED,
            PEB64_NT_GLOBAL_FLAG,
            PEB64_PROCESS_HEAP,
        )
    };

    process::write_memory(process_handle, (peb + being_debugged) as _, &0u8)
        .context("clearing PEB.BeingDebugged")?;
    process::write_memory(process_handle, (peb + nt_global_flag) as _, &0u32)
        .context("clearing PEB.NtGlobalFlag")?;

    let heap = if x86 {
        let heap: u32 = process::read_memory(process_handle, (peb + process_heap) as _)?;
        heap as u64
    } else {
        process::read_memory(process_handle, (peb + process_heap) as _)?
    };

    if heap != 0 {
        let (flags_offset, force_offset) = if x86 {
            (HEAP32_FLAGS, HEAP32_FORCE_FLAGS)
        } else {
            (HEAP64_FLAGS, HEAP64_FORCE_FLAGS)
        };

        let flags: u32 = process::read_memory(process_handle, (heap + flags_offset) as _)?;
        process::write_memory(
            process_handle,
            (heap + flags_offset) as _,
            &(flags & !HEAP_DEBUG_FLAGS),
        )
        .context("masking ProcessHeap.Flags")?;
        process::write_memory(process_handle, (heap + force_offset) as _, &0u32)
            .context("clearing ProcessHeap.ForceFlags")?;
    }

    Ok(())
}
