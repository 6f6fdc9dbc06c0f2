// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

#![cfg(windows)]

pub mod file;
pub mod handle;
pub mod memory;
pub mod process;
pub mod string;

use anyhow::Result;
use winapi::shared::minwindef::{BOOL, FALSE};

pub fn last_os_error() -> anyhow::Error {
    std::io::Error::last_os_error().into()
}

/// Run a winapi call that reports failure by returning FALSE, converting
/// failure into the calling thread's last OS error.
pub fn check_winapi(f: impl FnOnce() -> BOOL) -> Result<()> {
    if f() == FALSE {
        Err(last_os_error())
    } else {
        Ok(())
    }
}
