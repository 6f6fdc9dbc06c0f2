// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Result;
use log::error;
use win_util::{file, handle::Handle};
use winapi::um::winnt::{HANDLE, IMAGE_FILE_MACHINE_AMD64, IMAGE_FILE_MACHINE_I386};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Machine {
    Unknown,
    X64,
    X86,
}

/// A module mapped into the debuggee, created from a CREATE_PROCESS or
/// LOAD_DLL event. Owns the file handle the OS gave us with the event.
pub struct Module {
    path: PathBuf,
    file_handle: Option<Handle>,
    base_address: u64,
    image_size: u32,
    entry_point: u64,
    machine: Machine,
}

impl Module {
    pub fn new(module_handle: HANDLE, base_address: u64) -> Result<Self> {
        // Own the handle before anything can fail so it is closed either way.
        let file_handle = Handle(module_handle);

        let path = file::get_path_from_handle(module_handle).unwrap_or_else(|e| {
            error!("Error getting path from file handle: {}", e);
            "???".into()
        });

        let image_details = get_image_details(&path)?;

        Ok(Module {
            path,
            file_handle: Some(file_handle),
            base_address,
            image_size: image_details.image_size,
            entry_point: base_address.wrapping_add(image_details.entry_rva as u64),
            machine: image_details.machine,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn base_address(&self) -> u64 {
        self.base_address
    }

    pub fn image_size(&self) -> u32 {
        self.image_size
    }

    pub fn entry_point(&self) -> u64 {
        self.entry_point
    }

    pub fn machine(&self) -> Machine {
        self.machine
    }

    pub fn name(&self) -> &Path {
        // Unwrap guaranteed by construction, we always have a filename.
        self.path.file_stem().unwrap().as_ref()
    }

    /// Release the file handle the debug event carried. Called once the
    /// load callback has run; the handle must not outlive that.
    pub fn close_file_handle(&mut self) {
        self.file_handle.take();
    }
}

struct ImageDetails {
    image_size: u32,
    entry_rva: u32,
    machine: Machine,
}

fn get_image_details(path: &Path) -> Result<ImageDetails> {
    let file = fs::File::open(path)?;
    let map = unsafe { memmap2::Mmap::map(&file)? };

    let header = goblin::pe::header::Header::parse(&map)?;
    let optional_header = header
        .optional_header
        .ok_or_else(|| anyhow::anyhow!("Missing optional header in PE image"))?;

    let image_size = optional_header.windows_fields.size_of_image;
    let entry_rva = optional_header.standard_fields.address_of_entry_point as u32;

    let machine = match header.coff_header.machine {
        IMAGE_FILE_MACHINE_AMD64 => Machine::X64,
        IMAGE_FILE_MACHINE_I386 => Machine::X86,
        _ => Machine::Unknown,
    };

    Ok(ImageDetails {
        image_size,
        entry_rva,
        machine,
    })
}
