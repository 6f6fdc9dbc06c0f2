// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use anyhow::Result;
use log::{error, trace};
use rand::{thread_rng, Rng};
use win_util::process;
use winapi::{
    shared::minwindef::DWORD,
    um::{
        processthreadsapi::{ResumeThread, SuspendThread},
        winbase::Wow64SuspendThread,
        winnt::HANDLE,
    },
};

use crate::{
    breakpoint::{HwBreakpoint, HwSlots, SwBreakpointTable},
    context::{self, ThreadContext},
    error::DebuggerError,
    memory::{self, Pattern},
    module::{Machine, Module},
    registers::{
        dr6_clear_hit, dr6_lowest_hit, dr7_set_local_enable, AccessType, BreakpointLength, DrReg,
        Flag, Register,
    },
    stealth,
};

/// What a thread is in the middle of stepping over. Owned by the thread
/// record so concurrent hits on different threads cannot clobber each
/// other's re-arm.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) enum StepState {
    None,
    /// TF is set; the next single-step re-plants `0xCC` at `address`.
    ResumeSwBreakpoint { address: u64 },
    /// TF is set with the slot's local-enable bit cleared on this thread;
    /// the next single-step re-enables it.
    ResumeHwBreakpoint { slot: DrReg },
}

struct ThreadInfo {
    id: DWORD,
    handle: HANDLE,
    suspended: bool,
    wow64: bool,
    step_state: StepState,
}

impl ThreadInfo {
    fn new(id: DWORD, handle: HANDLE, wow64: bool) -> Self {
        ThreadInfo {
            id,
            handle,
            wow64,
            suspended: false,
            step_state: StepState::None,
        }
    }

    fn resume_thread(&mut self) -> Result<()> {
        if !self.suspended {
            return Ok(());
        }

        let suspend_count = unsafe { ResumeThread(self.handle) };
        if suspend_count == (-1i32 as DWORD) {
            Err(win_util::last_os_error())
        } else {
            self.suspended = false;
            trace!("Resume {:x} - suspend_count: {}", self.id, suspend_count);
            Ok(())
        }
    }

    fn suspend_thread(&mut self) -> Result<()> {
        if self.suspended {
            return Ok(());
        }

        let suspend_count = if self.wow64 {
            unsafe { Wow64SuspendThread(self.handle) }
        } else {
            unsafe { SuspendThread(self.handle) }
        };

        if suspend_count == (-1i32 as DWORD) {
            Err(win_util::last_os_error())
        } else {
            self.suspended = true;
            trace!("Suspend {:x} - suspend_count: {}", self.id, suspend_count);
            Ok(())
        }
    }
}

pub struct Target {
    process_id: DWORD,
    process_handle: HANDLE,
    current_thread_handle: HANDLE,
    current_thread_id: DWORD,
    main_thread_id: DWORD,

    image_base: u64,
    entry_point: u64,
    machine: Machine,
    wow64: bool,
    attached: bool,

    saw_initial_bp: bool,
    saw_initial_wow64_bp: bool,
    exited: bool,
    exit_code: Option<DWORD>,

    thread_info: fnv::FnvHashMap<DWORD, ThreadInfo>,

    // Key is the module base address.
    modules: fnv::FnvHashMap<u64, Module>,

    sw_breakpoints: SwBreakpointTable,
    hw_slots: HwSlots,

    // We cache the current thread context for possible repeated queries and
    // modifications, calling GetThreadContext once and SetThreadContext (if
    // necessary) before resuming. Get/Set/Get/Set does not round-trip.
    current_context: Option<ThreadContext>,
}

impl Target {
    pub(crate) fn new(
        process_id: DWORD,
        thread_id: DWORD,
        process_handle: HANDLE,
        thread_handle: HANDLE,
        exe_module: Module,
        attached: bool,
    ) -> Self {
        let mut thread_info = fnv::FnvHashMap::default();
        let wow64 = process::is_wow64_process(process_handle);
        thread_info.insert(thread_id, ThreadInfo::new(thread_id, thread_handle, wow64));

        let image_base = exe_module.base_address();
        let entry_point = exe_module.entry_point();
        let machine = exe_module.machine();

        let mut modules = fnv::FnvHashMap::default();
        modules.insert(image_base, exe_module);

        Self {
            process_id,
            process_handle,
            current_thread_handle: thread_handle,
            current_thread_id: thread_id,
            main_thread_id: thread_id,
            image_base,
            entry_point,
            machine,
            wow64,
            attached,
            saw_initial_bp: false,
            saw_initial_wow64_bp: false,
            exited: false,
            exit_code: None,
            thread_info,
            modules,
            sw_breakpoints: SwBreakpointTable::new(),
            hw_slots: HwSlots::new(),
            current_context: None,
        }
    }

    pub fn process_handle(&self) -> HANDLE {
        self.process_handle
    }

    pub fn process_id(&self) -> DWORD {
        self.process_id
    }

    pub fn current_thread_handle(&self) -> HANDLE {
        self.current_thread_handle
    }

    pub fn current_thread_id(&self) -> DWORD {
        self.current_thread_id
    }

    pub fn image_base(&self) -> u64 {
        self.image_base
    }

    pub fn entry_point(&self) -> u64 {
        self.entry_point
    }

    pub fn machine(&self) -> Machine {
        self.machine
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn exited(&self) -> bool {
        self.exited
    }

    pub fn exit_code(&self) -> Option<DWORD> {
        self.exit_code
    }

    pub(crate) fn saw_initial_bp(&self) -> bool {
        self.saw_initial_bp
    }

    pub(crate) fn set_saw_initial_bp(&mut self) {
        self.saw_initial_bp = true;
    }

    pub(crate) fn saw_initial_wow64_bp(&self) -> bool {
        self.saw_initial_wow64_bp
    }

    pub(crate) fn set_saw_initial_wow64_bp(&mut self) {
        self.saw_initial_wow64_bp = true;
    }

    pub(crate) fn set_exited(&mut self, exit_code: DWORD) {
        self.exited = true;
        self.exit_code = Some(exit_code);
    }

    pub(crate) fn create_new_thread(&mut self, thread_handle: HANDLE, thread_id: DWORD) {
        self.current_thread_handle = thread_handle;
        self.current_thread_id = thread_id;
        self.thread_info.insert(
            thread_id,
            ThreadInfo::new(thread_id, thread_handle, self.wow64),
        );

        // Process-wide hardware breakpoints are stamped onto every thread
        // as it appears.
        if !self.hw_slots.is_empty() {
            if let Err(e) = self.apply_debug_registers(thread_handle) {
                error!("Error installing debug registers on new thread: {}", e);
            }
        }
    }

    pub(crate) fn set_current_thread(&mut self, thread_id: DWORD) {
        self.current_thread_id = thread_id;
        self.current_thread_handle = self.thread_info.get(&thread_id).unwrap().handle;
    }

    pub(crate) fn exit_thread(&mut self, thread_id: DWORD) {
        if let Some(info) = self.thread_info.remove(&thread_id) {
            // A thread dying mid step-over would leave the breakpoint
            // disarmed for everyone; re-plant it now while the debuggee
            // is frozen.
            if let StepState::ResumeSwBreakpoint { address } = info.step_state {
                trace!(
                    "thread {:x} exited with a pending re-arm at 0x{:x}",
                    thread_id,
                    address
                );
                if let Err(e) = self.rearm_sw_breakpoint(address) {
                    error!("Error re-arming breakpoint at 0x{:x}: {}", address, e);
                }
            }
        }
    }

    pub(crate) fn track_module(&mut self, module: Module) {
        let base_address = module.base_address();
        if let Some(old_value) = self.modules.insert(base_address, module) {
            error!(
                "Existing module {} replaced at base address 0x{:x}",
                old_value.path().display(),
                base_address
            );
        }
    }

    pub(crate) fn remove_module(&mut self, base_address: u64) -> Option<Module> {
        self.modules.remove(&base_address)
    }

    pub fn module_at(&self, base_address: u64) -> Option<&Module> {
        self.modules.get(&base_address)
    }

    pub(crate) fn module_mut(&mut self, base_address: u64) -> Option<&mut Module> {
        self.modules.get_mut(&base_address)
    }

    // Context cache for the thread owning the current event.

    fn current_context_mut(&mut self) -> Result<&mut ThreadContext> {
        if self.current_context.is_none() {
            self.current_context = Some(context::get_thread_context(
                self.process_handle,
                self.current_thread_handle,
            )?);
        }

        Ok(self.current_context.as_mut().unwrap())
    }

    fn flush_current_context(&mut self) -> Result<()> {
        if let Some(ctx) = &self.current_context {
            ctx.set_thread_context(self.current_thread_handle)?;
        }
        Ok(())
    }

    // Register surface. Operations on the current event thread go through
    // the cached context; other frozen threads get a fetch-modify-flush.

    pub fn read_register(
        &mut self,
        thread_handle: HANDLE,
        reg: impl Into<Register>,
    ) -> Result<u64> {
        if thread_handle == self.current_thread_handle {
            self.current_context_mut()?.read_register(reg)
        } else {
            let ctx = context::get_thread_context(self.process_handle, thread_handle)?;
            ctx.read_register(reg)
        }
    }

    pub fn write_register(
        &mut self,
        thread_handle: HANDLE,
        reg: impl Into<Register>,
        value: u64,
    ) -> Result<()> {
        if thread_handle == self.current_thread_handle {
            self.current_context_mut()?.write_register(reg, value)?;
            self.flush_current_context()
        } else {
            let mut ctx = context::get_thread_context(self.process_handle, thread_handle)?;
            ctx.write_register(reg, value)?;
            ctx.set_thread_context(thread_handle)
        }
    }

    pub fn get_flag(&mut self, thread_handle: HANDLE, flag: impl Into<Flag>) -> Result<bool> {
        if thread_handle == self.current_thread_handle {
            self.current_context_mut()?.get_flag(flag)
        } else {
            let ctx = context::get_thread_context(self.process_handle, thread_handle)?;
            ctx.get_flag(flag)
        }
    }

    pub fn set_flag(
        &mut self,
        thread_handle: HANDLE,
        flag: impl Into<Flag>,
        value: bool,
    ) -> Result<()> {
        if thread_handle == self.current_thread_handle {
            self.current_context_mut()?.set_flag(flag, value)?;
            self.flush_current_context()
        } else {
            let mut ctx = context::get_thread_context(self.process_handle, thread_handle)?;
            ctx.set_flag(flag, value)?;
            ctx.set_thread_context(thread_handle)
        }
    }

    // Memory surface.

    pub fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = memory::read_exact(self.process_handle, address, len)?;
        self.sw_breakpoints.overlay_original_bytes(address, &mut buf);
        Ok(buf)
    }

    /// Like `read_memory`, but a partially-unmapped range returns the
    /// readable prefix instead of failing.
    pub fn read_memory_partial(&self, address: u64, len: usize) -> Vec<u8> {
        let mut buf = memory::read_prefix(self.process_handle, address, len);
        self.sw_breakpoints.overlay_original_bytes(address, &mut buf);
        buf
    }

    pub fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<()> {
        let mut buf = data.to_vec();
        // Keep armed breakpoints armed; the newly written byte becomes the
        // original restored when the breakpoint is cleared.
        self.sw_breakpoints
            .capture_overlapping_writes(address, &mut buf);
        memory::write_through(self.process_handle, address, &buf)
    }

    pub fn search_in_memory(&self, pattern: &Pattern) -> Result<Vec<u64>> {
        memory::search_committed_regions(self.process_handle, pattern, &self.sw_breakpoints)
    }

    /// `(base, size)` of every committed, non-guard, readable region.
    pub fn committed_regions(&self) -> Vec<(u64, u64)> {
        memory::committed_regions(self.process_handle)
    }

    pub fn query_memory(&self, address: u64) -> Result<win_util::memory::MemoryInfo> {
        win_util::memory::get_memory_info(self.process_handle, address)
    }

    /// Change the protection of a range, returning the previous protection.
    pub fn protect_memory(&mut self, address: u64, len: usize, protection: DWORD) -> Result<DWORD> {
        win_util::memory::virtual_protect(self.process_handle, address, len, protection)
    }

    // Software breakpoints.

    pub fn set_breakpoint(&mut self, address: u64) -> Result<()> {
        let process_handle = self.process_handle;
        let bp = self.sw_breakpoints.entry(address);
        if bp.is_enabled() {
            return Err(DebuggerError::DuplicateBreakpoint { address }.into());
        }

        trace!("Setting breakpoint at 0x{:x}", address);
        bp.arm(process_handle)
    }

    pub fn clear_breakpoint(&mut self, address: u64) -> Result<()> {
        let process_handle = self.process_handle;
        match self.sw_breakpoints.get_mut(address) {
            Some(bp) => bp.disarm(process_handle)?,
            None => return Err(DebuggerError::UnknownBreakpoint { address }.into()),
        }
        self.sw_breakpoints.remove(address);

        // Abandon any in-flight step-over of this breakpoint.
        let pending: Vec<DWORD> = self
            .thread_info
            .values()
            .filter(|t| t.step_state == StepState::ResumeSwBreakpoint { address })
            .map(|t| t.id)
            .collect();
        for thread_id in pending {
            self.clear_pending_step(thread_id)?;
        }

        Ok(())
    }

    fn rearm_sw_breakpoint(&mut self, address: u64) -> Result<()> {
        let process_handle = self.process_handle;
        if let Some(bp) = self.sw_breakpoints.get_mut(address) {
            if bp.is_enabled() {
                trace!("Restoring breakpoint at 0x{:x}", address);
                bp.arm(process_handle)?;
            }
        }
        Ok(())
    }

    /// Engine bookkeeping for a breakpoint exception at `pc`: if it is one
    /// of ours, rewind the instruction pointer over the consumed INT3 and
    /// put the original byte back. Returns false when no enabled breakpoint
    /// matches (the debuggee's own INT3).
    pub(crate) fn prepare_sw_breakpoint_hit(&mut self, pc: u64) -> Result<bool> {
        let process_handle = self.process_handle;
        let known = match self.sw_breakpoints.get_mut(pc) {
            Some(bp) if bp.is_enabled() => {
                bp.increment_hit_count();
                bp.disarm(process_handle)?;
                true
            }
            _ => false,
        };

        if known {
            // The reported context holds the post-fault IP; step it back
            // over the consumed one-byte INT3.
            let ctx = self.current_context_mut()?;
            if ctx.program_counter() != pc {
                ctx.rewind_program_counter(1);
            }
            self.flush_current_context()?;
        }

        Ok(known)
    }

    /// Apply the user's verdict after `on_breakpoint`.
    pub(crate) fn finish_sw_breakpoint_hit(
        &mut self,
        pc: u64,
        restore: bool,
    ) -> Result<()> {
        if restore {
            let ctx = self.current_context_mut()?;
            ctx.set_single_step(true);
            self.flush_current_context()?;

            if let Some(info) = self.thread_info.get_mut(&self.current_thread_id) {
                info.step_state = StepState::ResumeSwBreakpoint { address: pc };
            }
        } else if let Some(bp) = self.sw_breakpoints.get_mut(pc) {
            // Break: the original byte stays; only a fresh set_breakpoint
            // brings it back.
            bp.set_enabled(false);
        }

        Ok(())
    }

    /// Returns the step state the current thread entered this single-step
    /// for, clearing it.
    pub(crate) fn take_step_state(&mut self) -> StepState {
        match self.thread_info.get_mut(&self.current_thread_id) {
            Some(info) => std::mem::replace(&mut info.step_state, StepState::None),
            None => StepState::None,
        }
    }

    pub(crate) fn complete_sw_step(&mut self, address: u64) -> Result<()> {
        self.rearm_sw_breakpoint(address)?;

        // DR6 is sticky; scrub anything the step accumulated so it cannot
        // read as a fresh hardware hit later.
        let ctx = self.current_context_mut()?;
        if ctx.dr6() != 0 {
            ctx.set_dr6(0);
            self.flush_current_context()?;
        }
        Ok(())
    }

    pub(crate) fn complete_hw_step(&mut self, slot: DrReg) -> Result<()> {
        let rearm = self.hw_slots.get(slot).is_some();
        let ctx = self.current_context_mut()?;
        if rearm {
            let dr7 = dr7_set_local_enable(ctx.dr7(), slot, true);
            ctx.set_dr7(dr7);
        }
        ctx.set_dr6(0);
        self.flush_current_context()
    }

    /// Check DR6 of the current thread for a hardware breakpoint hit.
    /// The lowest flagged slot wins; its DR6 bit is cleared before the
    /// debuggee resumes.
    pub(crate) fn pending_hw_hit(&mut self) -> Result<Option<(DrReg, u64, AccessType)>> {
        let (slot, dr6) = {
            let ctx = self.current_context_mut()?;
            let dr6 = ctx.dr6();
            match dr6_lowest_hit(dr6) {
                Some(slot) => (slot, dr6),
                None => return Ok(None),
            }
        };

        let hit = self.hw_slots.get(slot).map(|bp| (slot, bp.address, bp.access));

        let ctx = self.current_context_mut()?;
        ctx.set_dr6(dr6_clear_hit(dr6, slot));
        self.flush_current_context()?;

        Ok(hit)
    }

    /// Apply the user's verdict after `on_hardware_breakpoint`.
    pub(crate) fn finish_hw_breakpoint_hit(&mut self, slot: DrReg, restore: bool) -> Result<()> {
        if !restore {
            self.hw_slots.release(slot);
            return self.sync_debug_registers();
        }

        let access = match self.hw_slots.get(slot) {
            Some(bp) => bp.access,
            None => return Ok(()),
        };

        // An execute trap is reported before the instruction retires;
        // disarm the slot on this thread and step across it. Data traps
        // fire after the access and resume cleanly as-is.
        if access == AccessType::Execute {
            let ctx = self.current_context_mut()?;
            let dr7 = dr7_set_local_enable(ctx.dr7(), slot, false);
            ctx.set_dr7(dr7);
            ctx.set_single_step(true);
            self.flush_current_context()?;

            if let Some(info) = self.thread_info.get_mut(&self.current_thread_id) {
                info.step_state = StepState::ResumeHwBreakpoint { slot };
            }
        }

        Ok(())
    }

    // Hardware breakpoints.

    pub fn set_hardware_breakpoint(
        &mut self,
        address: u64,
        slot: DrReg,
        access: AccessType,
        length: BreakpointLength,
    ) -> Result<()> {
        anyhow::ensure!(
            access != AccessType::Execute || length == BreakpointLength::Byte,
            "execute breakpoints cover a single byte"
        );

        self.hw_slots.occupy(HwBreakpoint {
            address,
            slot,
            access,
            length,
        })?;

        trace!(
            "Setting hardware breakpoint at 0x{:x} in {:?}",
            address,
            slot
        );
        self.sync_debug_registers()
    }

    /// Clearing an empty slot is a no-op.
    pub fn clear_hardware_breakpoint(&mut self, slot: DrReg) -> Result<()> {
        if self.hw_slots.release(slot).is_none() {
            return Ok(());
        }

        let pending: Vec<DWORD> = self
            .thread_info
            .values()
            .filter(|t| t.step_state == StepState::ResumeHwBreakpoint { slot })
            .map(|t| t.id)
            .collect();
        for thread_id in pending {
            self.clear_pending_step(thread_id)?;
        }

        self.sync_debug_registers()
    }

    fn apply_debug_registers(&mut self, thread_handle: HANDLE) -> Result<()> {
        if thread_handle == self.current_thread_handle {
            self.current_context_mut()?;
            let Target {
                hw_slots,
                current_context,
                ..
            } = self;
            hw_slots.apply_to_context(current_context.as_mut().unwrap());
            self.flush_current_context()
        } else {
            let mut ctx = context::get_thread_context(self.process_handle, thread_handle)?;
            self.hw_slots.apply_to_context(&mut ctx);
            ctx.set_thread_context(thread_handle)
        }
    }

    /// Mirror the slot table into DR0-DR7 of every live thread.
    fn sync_debug_registers(&mut self) -> Result<()> {
        let handles: Vec<HANDLE> = self.thread_info.values().map(|t| t.handle).collect();
        for handle in handles {
            self.apply_debug_registers(handle)?;
        }
        Ok(())
    }

    /// Drop a thread's pending step-over and its trap flag.
    fn clear_pending_step(&mut self, thread_id: DWORD) -> Result<()> {
        let handle = match self.thread_info.get_mut(&thread_id) {
            Some(info) => {
                info.step_state = StepState::None;
                info.handle
            }
            None => return Ok(()),
        };

        if handle == self.current_thread_handle {
            self.current_context_mut()?.set_single_step(false);
            self.flush_current_context()
        } else {
            let mut ctx = context::get_thread_context(self.process_handle, handle)?;
            ctx.set_single_step(false);
            ctx.set_thread_context(handle)
        }
    }

    /// Scheduling before ContinueDebugEvent. While any thread has a pending
    /// step-over, only one stepping thread may run; everyone else stays
    /// suspended so no thread can slip through a disarmed breakpoint.
    pub(crate) fn prepare_to_resume(&mut self) -> Result<()> {
        let pending: Vec<DWORD> = self
            .thread_info
            .values()
            .filter(|t| t.step_state != StepState::None)
            .map(|t| t.id)
            .collect();

        if pending.is_empty() {
            for thread_info in self.thread_info.values_mut() {
                thread_info.resume_thread()?;
            }
        } else {
            for thread_info in self.thread_info.values_mut() {
                thread_info.suspend_thread()?;
            }

            let stepping = pending[thread_rng().gen_range(0..pending.len())];
            self.thread_info
                .get_mut(&stepping)
                .unwrap()
                .resume_thread()?;
        }

        // The cached context is stale once the debuggee runs.
        self.current_context = None;

        Ok(())
    }

    pub fn hide_debugger(&mut self) -> Result<()> {
        let main_thread_handle = self
            .thread_info
            .get(&self.main_thread_id)
            .map_or(self.current_thread_handle, |t| t.handle);

        stealth::hide_debugger(
            self.process_handle,
            main_thread_handle,
            self.machine == Machine::X86,
        )
    }

    /// Undo every trace of the debugger before DebugActiveProcessStop:
    /// restore breakpoint bytes, zero debug registers everywhere, resume
    /// engine-suspended threads.
    pub(crate) fn prepare_detach(&mut self) -> Result<()> {
        let process_handle = self.process_handle;

        for bp in self.sw_breakpoints.iter_mut() {
            if let Err(e) = bp.disarm(process_handle) {
                error!(
                    "Error restoring byte at 0x{:x} on detach: {}",
                    bp.address(),
                    e
                );
            }
        }

        self.current_context = None;
        let handles: Vec<HANDLE> = self.thread_info.values().map(|t| t.handle).collect();
        for handle in handles {
            let mut ctx = context::get_thread_context(process_handle, handle)?;
            ctx.clear_debug_registers();
            ctx.set_single_step(false);
            ctx.set_thread_context(handle)?;
        }

        for thread_info in self.thread_info.values_mut() {
            thread_info.step_state = StepState::None;
            thread_info.resume_thread()?;
        }

        Ok(())
    }
}
