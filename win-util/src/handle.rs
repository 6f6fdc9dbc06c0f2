// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use winapi::{
    shared::minwindef::FALSE,
    um::{
        handleapi::{CloseHandle, DuplicateHandle, INVALID_HANDLE_VALUE},
        processthreadsapi::GetCurrentProcess,
        winnt::{DUPLICATE_SAME_ACCESS, HANDLE},
    },
};

/// An owned HANDLE, closed exactly once on drop.
pub struct Handle(pub HANDLE);

impl Clone for Handle {
    fn clone(&self) -> Self {
        let mut duplicate = INVALID_HANDLE_VALUE;
        unsafe {
            let current_process = GetCurrentProcess();
            DuplicateHandle(
                current_process,
                self.0,
                current_process,
                &mut duplicate,
                0,
                FALSE,
                DUPLICATE_SAME_ACCESS,
            );
        }

        Self(duplicate)
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if !self.0.is_null() && self.0 != INVALID_HANDLE_VALUE {
            unsafe { CloseHandle(self.0) };
        }
    }
}

unsafe impl Send for Handle {}

unsafe impl Sync for Handle {}
