// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use thiserror::Error;

/// Typed failures of engine operations. OS-level failures keep their
/// last-error details attached by the `anyhow` context chain wrapping
/// these values.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DebuggerError {
    #[error("invalid or closed handle")]
    InvalidHandle,

    #[error("no running process named {name:?}")]
    ProcessNotFound { name: String },

    #[error("access denied")]
    AccessDenied,

    #[error("short read: {read} of {requested} bytes transferred")]
    MemoryReadShort { requested: usize, read: usize },

    #[error("memory at 0x{address:x} is not writable")]
    MemoryWriteProtected { address: u64 },

    #[error("debug register slot is already in use")]
    NoFreeDebugRegister,

    #[error("breakpoint already set at 0x{address:x}")]
    DuplicateBreakpoint { address: u64 },

    #[error("no breakpoint at 0x{address:x}")]
    UnknownBreakpoint { address: u64 },

    #[error("register width does not match the target bitness")]
    ArchMismatch,

    #[error("could not attach to process {pid}")]
    AttachFailed { pid: u32 },

    #[error("could not detach from the debuggee")]
    DetachFailed,
}
