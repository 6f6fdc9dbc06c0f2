// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::mem::{size_of, MaybeUninit};

use anyhow::{Context, Result};
use winapi::{
    shared::minwindef::{DWORD, LPVOID},
    um::{
        memoryapi::{VirtualProtectEx, VirtualQueryEx},
        winnt::{
            HANDLE, MEMORY_BASIC_INFORMATION, MEM_COMMIT, PAGE_EXECUTE_READ,
            PAGE_EXECUTE_READWRITE, PAGE_EXECUTE_WRITECOPY, PAGE_GUARD, PAGE_NOACCESS,
            PAGE_READONLY, PAGE_READWRITE, PAGE_WRITECOPY,
        },
    },
};

use crate::{check_winapi, last_os_error};

pub struct MemoryInfo {
    base_address: u64,
    region_size: u64,
    state: DWORD,
    protection: DWORD,
}

impl MemoryInfo {
    pub fn new(base_address: u64, region_size: u64, state: DWORD, protection: DWORD) -> Self {
        Self {
            base_address,
            region_size,
            state,
            protection,
        }
    }

    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    pub fn region_size(&self) -> u64 {
        self.region_size
    }

    /// First address past this region, where the next VirtualQueryEx starts.
    pub fn next_region_base(&self) -> u64 {
        self.base_address.saturating_add(self.region_size)
    }

    pub fn is_committed(&self) -> bool {
        self.state & MEM_COMMIT != 0
    }

    pub fn is_guard(&self) -> bool {
        self.protection & PAGE_GUARD != 0
    }

    pub fn is_readable(&self) -> bool {
        if self.is_guard() || self.protection & PAGE_NOACCESS != 0 {
            return false;
        }

        0 != (self.protection
            & (PAGE_READONLY
                | PAGE_READWRITE
                | PAGE_WRITECOPY
                | PAGE_EXECUTE_READ
                | PAGE_EXECUTE_READWRITE
                | PAGE_EXECUTE_WRITECOPY))
    }

    pub fn is_writable(&self) -> bool {
        0 != (self.protection
            & (PAGE_READWRITE | PAGE_WRITECOPY | PAGE_EXECUTE_READWRITE | PAGE_EXECUTE_WRITECOPY))
    }
}

pub fn get_memory_info(process_handle: HANDLE, address: u64) -> Result<MemoryInfo> {
    let mut mbi = MaybeUninit::zeroed();
    let size = unsafe {
        VirtualQueryEx(
            process_handle,
            address as LPVOID,
            mbi.as_mut_ptr(),
            size_of::<MEMORY_BASIC_INFORMATION>(),
        )
    };
    if size != size_of::<MEMORY_BASIC_INFORMATION>() {
        return Err(last_os_error());
    }

    let mbi = unsafe { mbi.assume_init() };
    Ok(MemoryInfo::new(
        mbi.BaseAddress as u64,
        mbi.RegionSize as u64,
        mbi.State,
        mbi.Protect,
    ))
}

/// Change the protection of a remote range, returning the previous protection.
pub fn virtual_protect(
    process_handle: HANDLE,
    address: u64,
    size: usize,
    protection: DWORD,
) -> Result<DWORD> {
    let mut old_protection: DWORD = 0;
    check_winapi(|| unsafe {
        VirtualProtectEx(
            process_handle,
            address as LPVOID,
            size,
            protection,
            &mut old_protection,
        )
    })
    .context("VirtualProtectEx")?;
    Ok(old_protection)
}
