// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::collections::{btree_map, BTreeMap};

use anyhow::Result;
use win_util::process;
use winapi::um::winnt::HANDLE;

use crate::{
    context::ThreadContext,
    error::DebuggerError,
    registers::{dr7_clear_slot, dr7_set_slot, AccessType, BreakpointLength, DrReg},
};

const INT3: u8 = 0xcc;

pub(crate) fn write_instruction_byte(process_handle: HANDLE, ip: u64, b: u8) -> Result<()> {
    let byte = [b; 1];
    let remote_address = ip as _;
    process::write_memory_slice(process_handle, remote_address, &byte)?;
    process::flush_instruction_cache(process_handle, remote_address, byte.len())?;
    Ok(())
}

/// A software (INT3) breakpoint. `original_byte` is `Some` exactly while the
/// `0xCC` shadow is present in debuggee memory.
pub(crate) struct SwBreakpoint {
    address: u64,
    enabled: bool,
    original_byte: Option<u8>,
    hit_count: u64,
}

impl SwBreakpoint {
    pub fn new(address: u64) -> Self {
        SwBreakpoint {
            address,
            enabled: false,
            original_byte: None,
            hit_count: 0,
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    #[allow(unused)]
    pub fn is_armed(&self) -> bool {
        self.original_byte.is_some()
    }

    pub fn original_byte(&self) -> Option<u8> {
        self.original_byte
    }

    #[allow(unused)]
    pub fn hit_count(&self) -> u64 {
        self.hit_count
    }

    pub fn increment_hit_count(&mut self) {
        self.hit_count = self.hit_count.saturating_add(1);
    }

    /// Save the byte currently at the address and plant `0xCC`.
    pub fn arm(&mut self, process_handle: HANDLE) -> Result<()> {
        if self.original_byte.is_none() {
            let original: u8 = process::read_memory(process_handle, self.address as _)?;
            self.original_byte = Some(original);
            write_instruction_byte(process_handle, self.address, INT3)?;
        }
        self.enabled = true;
        Ok(())
    }

    /// Put the saved byte back, leaving the breakpoint entry in place.
    pub fn disarm(&mut self, process_handle: HANDLE) -> Result<()> {
        if let Some(original) = self.original_byte.take() {
            write_instruction_byte(process_handle, self.address, original)?;
        }
        Ok(())
    }
}

pub(crate) struct SwBreakpointTable {
    breakpoints: BTreeMap<u64, SwBreakpoint>,
}

impl SwBreakpointTable {
    pub fn new() -> Self {
        SwBreakpointTable {
            breakpoints: BTreeMap::new(),
        }
    }

    pub fn get(&self, address: u64) -> Option<&SwBreakpoint> {
        self.breakpoints.get(&address)
    }

    pub fn get_mut(&mut self, address: u64) -> Option<&mut SwBreakpoint> {
        self.breakpoints.get_mut(&address)
    }

    pub fn entry(&mut self, address: u64) -> &mut SwBreakpoint {
        self.breakpoints
            .entry(address)
            .or_insert_with(|| SwBreakpoint::new(address))
    }

    pub fn remove(&mut self, address: u64) -> Option<SwBreakpoint> {
        self.breakpoints.remove(&address)
    }

    pub fn iter_mut(&mut self) -> btree_map::ValuesMut<u64, SwBreakpoint> {
        self.breakpoints.values_mut()
    }

    /// Replace every armed `0xCC` shadow within `buf` (read from debuggee
    /// address `base`) with the saved original byte, so callers never see
    /// the breakpoint instrumentation.
    pub fn overlay_original_bytes(&self, base: u64, buf: &mut [u8]) {
        if buf.is_empty() {
            return;
        }

        let end = base.saturating_add(buf.len() as u64);
        for (&address, bp) in self.breakpoints.range(base..end) {
            if let Some(original) = bp.original_byte {
                buf[(address - base) as usize] = original;
            }
        }
    }

    /// Prepare a buffer about to be written at `base`: armed breakpoints in
    /// range keep their `0xCC` shadow in debuggee memory, and the byte the
    /// caller intended becomes the new saved original.
    pub fn capture_overlapping_writes(&mut self, base: u64, buf: &mut [u8]) {
        if buf.is_empty() {
            return;
        }

        let end = base.saturating_add(buf.len() as u64);
        for (&address, bp) in self.breakpoints.range_mut(base..end) {
            if bp.original_byte.is_some() {
                let offset = (address - base) as usize;
                bp.original_byte = Some(buf[offset]);
                buf[offset] = INT3;
            }
        }
    }
}

/// A hardware breakpoint occupying one DR slot.
#[derive(Copy, Clone, Debug)]
pub(crate) struct HwBreakpoint {
    pub address: u64,
    pub slot: DrReg,
    pub access: AccessType,
    pub length: BreakpointLength,
}

/// The four debug-register slots, applied process-wide. The DR7 bits of
/// every debuggee thread mirror this table after each transition.
pub(crate) struct HwSlots {
    slots: [Option<HwBreakpoint>; 4],
}

impl HwSlots {
    pub fn new() -> Self {
        HwSlots { slots: [None; 4] }
    }

    pub fn occupy(&mut self, bp: HwBreakpoint) -> Result<()> {
        let slot = &mut self.slots[bp.slot.index()];
        if slot.is_some() {
            return Err(DebuggerError::NoFreeDebugRegister.into());
        }
        *slot = Some(bp);
        Ok(())
    }

    pub fn release(&mut self, slot: DrReg) -> Option<HwBreakpoint> {
        self.slots[slot.index()].take()
    }

    pub fn get(&self, slot: DrReg) -> Option<&HwBreakpoint> {
        self.slots[slot.index()].as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// DR7 with all four slots rewritten from this table; bits outside the
    /// per-slot fields (GE/LE, GD) are taken from `existing`.
    pub fn compose_dr7(&self, existing: u64) -> u64 {
        let mut dr7 = existing;
        for index in 0..4 {
            let slot = DrReg::from_index(index).unwrap();
            dr7 = dr7_clear_slot(dr7, slot);
            if let Some(bp) = &self.slots[index] {
                dr7 = dr7_set_slot(dr7, slot, bp.access, bp.length);
            }
        }
        dr7
    }

    /// Stamp DR0-DR3 and DR7 of a captured context to mirror this table.
    pub fn apply_to_context(&self, context: &mut ThreadContext) {
        for index in 0..4 {
            let slot = DrReg::from_index(index).unwrap();
            let address = self.slots[index].as_ref().map_or(0, |bp| bp.address);
            context.set_dr(slot, address);
        }
        let dr7 = self.compose_dr7(context.dr7());
        context.set_dr7(dr7);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registers::dr7_local_enabled;

    fn armed(address: u64, original: u8) -> SwBreakpoint {
        SwBreakpoint {
            address,
            enabled: true,
            original_byte: Some(original),
            hit_count: 0,
        }
    }

    fn table(bps: Vec<SwBreakpoint>) -> SwBreakpointTable {
        let mut table = SwBreakpointTable::new();
        for bp in bps {
            table.breakpoints.insert(bp.address, bp);
        }
        table
    }

    #[test]
    fn overlay_replaces_shadow_bytes() {
        let table = table(vec![armed(0x1002, 0x90), armed(0x1005, 0x74)]);

        let mut buf = vec![0x55, 0x8b, 0xcc, 0xec, 0x33, 0xcc, 0xc3];
        table.overlay_original_bytes(0x1000, &mut buf);

        assert_eq!(buf, vec![0x55, 0x8b, 0x90, 0xec, 0x33, 0x74, 0xc3]);
    }

    #[test]
    fn overlay_ignores_out_of_range_and_disarmed() {
        let mut disarmed = SwBreakpoint::new(0x1001);
        disarmed.enabled = true;
        let table = table(vec![armed(0x0fff, 0xaa), armed(0x1003, 0xbb), disarmed]);

        let mut buf = vec![0xcc, 0xcc, 0xcc];
        table.overlay_original_bytes(0x1000, &mut buf);

        // Only the armed in-range entry at 0x1003 is outside the buffer;
        // the disarmed one at 0x1001 is untouched, 0x0fff is below range.
        assert_eq!(buf, vec![0xcc, 0xcc, 0xcc]);
    }

    #[test]
    fn write_through_breakpoint_updates_original() {
        let mut table = table(vec![armed(0x2001, 0x90)]);

        let mut buf = vec![0x11, 0x22, 0x33];
        table.capture_overlapping_writes(0x2000, &mut buf);

        // The shadow stays armed in memory, the new byte becomes the
        // original restored on clear.
        assert_eq!(buf, vec![0x11, 0xcc, 0x33]);
        assert_eq!(table.get(0x2001).unwrap().original_byte(), Some(0x22));
    }

    #[test]
    fn slots_are_exclusive() {
        let mut slots = HwSlots::new();
        let bp = HwBreakpoint {
            address: 0x4000,
            slot: DrReg::Dr1,
            access: AccessType::Execute,
            length: BreakpointLength::Byte,
        };
        slots.occupy(bp).unwrap();
        assert!(slots.occupy(bp).is_err());

        assert!(slots.release(DrReg::Dr1).is_some());
        slots.occupy(bp).unwrap();
    }

    #[test]
    fn dr7_mirrors_slot_table() {
        let mut slots = HwSlots::new();
        slots
            .occupy(HwBreakpoint {
                address: 0x4000,
                slot: DrReg::Dr1,
                access: AccessType::Execute,
                length: BreakpointLength::Byte,
            })
            .unwrap();
        slots
            .occupy(HwBreakpoint {
                address: 0x5000,
                slot: DrReg::Dr3,
                access: AccessType::Write,
                length: BreakpointLength::Dword,
            })
            .unwrap();

        let dr7 = slots.compose_dr7(0);
        assert!(dr7_local_enabled(dr7, DrReg::Dr1));
        assert!(dr7_local_enabled(dr7, DrReg::Dr3));
        assert!(!dr7_local_enabled(dr7, DrReg::Dr0));
        assert_eq!((dr7 >> 28) & 0b1111, 0b1101); // LEN3=11, R/W3=01

        // Releasing a slot clears only that slot's bits.
        slots.release(DrReg::Dr3);
        let dr7 = slots.compose_dr7(dr7);
        assert!(dr7_local_enabled(dr7, DrReg::Dr1));
        assert!(!dr7_local_enabled(dr7, DrReg::Dr3));
        assert_eq!((dr7 >> 28) & 0b1111, 0);
    }
}
