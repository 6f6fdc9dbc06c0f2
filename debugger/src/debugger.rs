// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::{
    mem::MaybeUninit,
    os::windows::process::CommandExt,
    path::{Path, PathBuf},
    process::{Child, Command},
};

use anyhow::{Context, Result};
use log::{error, trace};
use win_util::{check_winapi, last_os_error, process, string};
use winapi::{
    shared::{
        minwindef::{DWORD, FALSE, LPCVOID, TRUE},
        winerror::ERROR_SEM_TIMEOUT,
    },
    um::{
        debugapi::{
            ContinueDebugEvent, DebugActiveProcess, DebugActiveProcessStop, WaitForDebugEvent,
        },
        errhandlingapi::GetLastError,
        minwinbase::{
            EXCEPTION_ACCESS_VIOLATION, EXCEPTION_BREAKPOINT, EXCEPTION_DEBUG_INFO,
            EXCEPTION_SINGLE_STEP,
        },
        winbase::{DebugSetProcessKillOnExit, DEBUG_ONLY_THIS_PROCESS, INFINITE},
        winnt::{DBG_CONTINUE, DBG_EXCEPTION_NOT_HANDLED, HANDLE},
    },
};

use crate::{
    debug_event::{DebugEvent, DebugEventInfo},
    error::DebuggerError,
    memory::Pattern,
    module::Module,
    registers::{AccessType, BreakpointLength, DrReg, Flag, Register},
    target::{StepState, Target},
};

// When debugging a WoW64 process, we see STATUS_WX86_BREAKPOINT in addition
// to EXCEPTION_BREAKPOINT.
const STATUS_WX86_BREAKPOINT: u32 = ::winapi::shared::ntstatus::STATUS_WX86_BREAKPOINT as u32;

/// The user's verdict on a breakpoint hit.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BreakpointAction {
    /// Leave the breakpoint disarmed; only a fresh `set_breakpoint` (or
    /// `set_hardware_breakpoint`) revives it.
    Break,
    /// Step over the faulting instruction and re-arm the breakpoint.
    Restore,
}

/// How the faulting instruction touched memory in an access violation.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AccessKind {
    Read,
    Write,
    Execute,
    Unknown,
}

impl AccessKind {
    fn from_exception_info(code: usize) -> Self {
        match code {
            0 => AccessKind::Read,
            1 => AccessKind::Write,
            8 => AccessKind::Execute,
            _ => AccessKind::Unknown,
        }
    }
}

/// Which process to attach to.
pub enum AttachTarget {
    Pid(DWORD),
    Name(String),
}

impl From<DWORD> for AttachTarget {
    fn from(pid: DWORD) -> Self {
        AttachTarget::Pid(pid)
    }
}

impl From<&str> for AttachTarget {
    fn from(name: &str) -> Self {
        AttachTarget::Name(name.to_string())
    }
}

impl From<String> for AttachTarget {
    fn from(name: String) -> Self {
        AttachTarget::Name(name)
    }
}

/// Debug-event callbacks. Every method has a default no-op implementation;
/// override the ones you care about. Handlers get the `Debugger` back so
/// they can set breakpoints, touch memory and registers, or tear the
/// session down - every engine operation is safe to call here because the
/// debuggee is frozen while a callback runs.
#[rustfmt::skip]
#[allow(unused_variables)]
pub trait DebugEventHandler {
    fn on_start(&mut self, debugger: &mut Debugger, image_base: u64, entry_point: u64) {}
    fn on_end(&mut self, debugger: &mut Debugger, exit_code: u32, pid: u32) {}
    fn on_attach(&mut self, debugger: &mut Debugger) {}
    fn on_thread_create(&mut self, debugger: &mut Debugger, thread_handle: HANDLE, thread_id: u32, teb_base: u64, start_address: u64) {}
    fn on_thread_exit(&mut self, debugger: &mut Debugger, thread_id: u32) {}
    /// Return false to drop the module from the module table.
    fn on_dll_load(&mut self, debugger: &mut Debugger, address: u64, name: &Path, entry_point: u64) -> bool { true }
    fn on_dll_unload(&mut self, debugger: &mut Debugger, address: u64, name: &Path) {}
    fn on_breakpoint(&mut self, debugger: &mut Debugger, address: u64, thread_handle: HANDLE) -> BreakpointAction { BreakpointAction::Break }
    fn on_hardware_breakpoint(&mut self, debugger: &mut Debugger, address: u64, thread_handle: HANDLE, slot: DrReg) -> BreakpointAction { BreakpointAction::Break }
    fn on_single_step(&mut self, debugger: &mut Debugger, address: u64, thread_handle: HANDLE) {}
    fn on_debug_string(&mut self, debugger: &mut Debugger, text: &str) {}
    fn on_access_violation(&mut self, debugger: &mut Debugger, address: u64, faulting_address: u64, access: AccessKind) {}
    fn on_rip_error(&mut self, debugger: &mut Debugger, error: u32, kind: u32) {}
    fn on_unknown_exception(&mut self, debugger: &mut Debugger, address: u64, exception_code: u32) {}
    fn on_unknown_debug_event(&mut self, debugger: &mut Debugger, event_code: u32) {}
}

#[derive(Default)]
struct ContinueDebugEventArguments {
    process_id: u32,
    thread_id: u32,
    continue_status: u32,
}

pub struct Debugger {
    target: Target,
    continue_args: Option<ContinueDebugEventArguments>,
    detached: bool,
}

impl Debugger {
    /// Spawn `command_line` as a debuggee, suspended at its entry. The
    /// initial CreateProcess event is consumed here and `on_start` fires
    /// with the image base and entry point before this returns.
    pub fn start(
        command_line: impl AsRef<str>,
        callbacks: &mut impl DebugEventHandler,
    ) -> Result<(Self, Child)> {
        let argv = string::to_argv(command_line.as_ref());
        anyhow::ensure!(!argv.is_empty(), "empty command line");

        let mut command = Command::new(&argv[0]);
        command.args(&argv[1..]);

        let child = command
            .creation_flags(DEBUG_ONLY_THIS_PROCESS)
            .spawn()
            .context("debuggee failed to start")?;

        check_winapi(|| unsafe { DebugSetProcessKillOnExit(TRUE) })
            .context("Setting DebugSetProcessKillOnExit to TRUE")?;

        let debugger = Self::wait_for_initial_event(false, callbacks)?;
        Ok((debugger, child))
    }

    /// Attach to a running process by pid or by executable name. `on_start`
    /// fires for the initial CreateProcess event, then `on_attach`.
    pub fn attach(
        target: impl Into<AttachTarget>,
        callbacks: &mut impl DebugEventHandler,
    ) -> Result<Self> {
        let pid = match target.into() {
            AttachTarget::Pid(pid) => pid,
            AttachTarget::Name(name) => process::find_process_id(&name)?
                .ok_or(DebuggerError::ProcessNotFound { name })?,
        };

        check_winapi(|| unsafe { DebugActiveProcess(pid) })
            .map_err(|e| e.context(DebuggerError::AttachFailed { pid }))?;

        // An attached process outlives the debugger unless terminated.
        check_winapi(|| unsafe { DebugSetProcessKillOnExit(FALSE) })
            .context("Setting DebugSetProcessKillOnExit to FALSE")?;

        let mut debugger = Self::wait_for_initial_event(true, callbacks)?;
        callbacks.on_attach(&mut debugger);
        Ok(debugger)
    }

    // The kernel blocks the process from starting until the CreateProcess
    // event is processed, so we must wait forever here. The kernel reliably
    // generates the event, so there is no true hang.
    fn wait_for_initial_event(
        attached: bool,
        callbacks: &mut impl DebugEventHandler,
    ) -> Result<Self> {
        let mut de = MaybeUninit::uninit();
        if unsafe { WaitForDebugEvent(de.as_mut_ptr(), INFINITE) } == FALSE {
            return Err(last_os_error());
        }

        let de = unsafe { de.assume_init() };
        let de = DebugEvent::new(&de);
        if let DebugEventInfo::CreateProcess(info) = de.info() {
            trace!("{}", de);

            let module = Module::new(info.hFile, info.lpBaseOfImage as u64)
                .context("Inspecting the process image")?;

            let target = Target::new(
                de.process_id(),
                de.thread_id(),
                info.hProcess,
                info.hThread,
                module,
                attached,
            );

            let mut debugger = Debugger {
                target,
                continue_args: Some(ContinueDebugEventArguments {
                    process_id: de.process_id(),
                    thread_id: de.thread_id(),
                    continue_status: DBG_CONTINUE,
                }),
                detached: false,
            };

            let image_base = debugger.target.image_base();
            let entry_point = debugger.target.entry_point();
            callbacks.on_start(&mut debugger, image_base, entry_point);
            debugger.close_module_file_handle(image_base);

            debugger.continue_debugging()?;

            Ok(debugger)
        } else {
            anyhow::bail!("Unexpected event: {}", de)
        }
    }

    /// Pump debug events until the debuggee exits or is detached.
    pub fn run(&mut self, callbacks: &mut impl DebugEventHandler) -> Result<()> {
        while !self.target.exited() && !self.detached {
            self.process_event(callbacks, INFINITE)?;
            self.continue_debugging()?;
        }

        Ok(())
    }

    /// Wait for and dispatch one debug event. Returns true if an event was
    /// processed, false on timeout.
    pub fn process_event(
        &mut self,
        callbacks: &mut impl DebugEventHandler,
        timeout_ms: DWORD,
    ) -> Result<bool> {
        let mut de = MaybeUninit::uninit();
        if unsafe { WaitForDebugEvent(de.as_mut_ptr(), timeout_ms) } == TRUE {
            let de = unsafe { de.assume_init() };
            let de = DebugEvent::new(&de);
            trace!("{}", de);

            let continue_status = self.dispatch_event(&de, callbacks);
            self.continue_args = Some(ContinueDebugEventArguments {
                continue_status,
                process_id: de.process_id(),
                thread_id: de.thread_id(),
            });
            Ok(true)
        } else {
            self.continue_args = None;

            let err = unsafe { GetLastError() };
            if err != ERROR_SEM_TIMEOUT {
                return Err(last_os_error());
            }

            trace!("timeout waiting for debug event");
            Ok(false)
        }
    }

    pub fn continue_debugging(&mut self) -> Result<()> {
        if self.detached {
            self.continue_args = None;
            return Ok(());
        }

        if let Some(continue_args) = self.continue_args.take() {
            self.target.prepare_to_resume()?;

            if unsafe {
                ContinueDebugEvent(
                    continue_args.process_id,
                    continue_args.thread_id,
                    continue_args.continue_status,
                )
            } == FALSE
            {
                return Err(last_os_error());
            }
        }

        Ok(())
    }

    fn dispatch_event(&mut self, de: &DebugEvent, callbacks: &mut impl DebugEventHandler) -> u32 {
        let mut continue_status = DBG_CONTINUE;

        if let DebugEventInfo::CreateThread(info) = de.info() {
            self.target.create_new_thread(info.hThread, de.thread_id());
        } else {
            self.target.set_current_thread(de.thread_id());
        }

        match de.info() {
            DebugEventInfo::CreateProcess(_info) => {
                // We pass DEBUG_ONLY_THIS_PROCESS when spawning and handle
                // the single CreateProcess event before entering the loop.
                unreachable!("Nested targets not supported");
            }

            DebugEventInfo::CreateThread(info) => {
                let start_address = info.lpStartAddress.map_or(0u64, |f| f as usize as u64);
                callbacks.on_thread_create(
                    self,
                    info.hThread,
                    de.thread_id(),
                    info.lpThreadLocalBase as u64,
                    start_address,
                );
            }

            DebugEventInfo::ExitThread(_info) => {
                callbacks.on_thread_exit(self, de.thread_id());
                self.target.exit_thread(de.thread_id());
            }

            DebugEventInfo::LoadDll(info) => {
                match Module::new(info.hFile, info.lpBaseOfDll as u64) {
                    Ok(mut module) => {
                        let name = module.name().to_owned();
                        let base_address = module.base_address();
                        let entry_point = module.entry_point();

                        let keep = callbacks.on_dll_load(self, base_address, &name, entry_point);

                        // The OS handed us the file handle with the event;
                        // it is done once the callback has run.
                        module.close_file_handle();
                        if keep {
                            self.target.track_module(module);
                        }
                    }
                    Err(e) => {
                        error!("Error loading module: {}", e);
                    }
                }
            }

            DebugEventInfo::UnloadDll(info) => {
                let base_address = info.lpBaseOfDll as u64;
                let name: PathBuf = match self.target.remove_module(base_address) {
                    Some(module) => module.name().to_owned(),
                    None => "???".into(),
                };
                callbacks.on_dll_unload(self, base_address, &name);
            }

            DebugEventInfo::Exception(info) => {
                continue_status = match self.dispatch_exception_event(info, callbacks) {
                    Ok(status) => status,
                    Err(e) => {
                        error!("Error processing exception: {}", e);
                        DBG_EXCEPTION_NOT_HANDLED
                    }
                }
            }

            DebugEventInfo::ExitProcess(info) => {
                self.target.set_exited(info.dwExitCode);
                let pid = self.target.process_id();
                callbacks.on_end(self, info.dwExitCode, pid);
            }

            DebugEventInfo::OutputDebugString(info) => {
                // Remove the terminating NUL as it's not needed in a Rust string.
                let length = info.nDebugStringLength.saturating_sub(1) as usize;
                let remote_address = info.lpDebugStringData as LPCVOID;
                let process_handle = self.target.process_handle();

                if info.fUnicode != 0 {
                    if let Ok(message) =
                        process::read_wide_string(process_handle, remote_address, length)
                    {
                        let message = message.to_string_lossy();
                        callbacks.on_debug_string(self, &message);
                    }
                } else {
                    if let Ok(message) =
                        process::read_narrow_string(process_handle, remote_address, length)
                    {
                        callbacks.on_debug_string(self, &message);
                    }
                }
            }

            DebugEventInfo::Rip(info) => {
                callbacks.on_rip_error(self, info.dwError, info.dwType);
            }

            DebugEventInfo::Unknown(code) => {
                callbacks.on_unknown_debug_event(self, *code);
            }
        }

        continue_status
    }

    fn dispatch_exception_event(
        &mut self,
        info: &EXCEPTION_DEBUG_INFO,
        callbacks: &mut impl DebugEventHandler,
    ) -> Result<u32> {
        let exception_code = info.ExceptionRecord.ExceptionCode;
        let exception_address = info.ExceptionRecord.ExceptionAddress as u64;
        let thread_handle = self.target.current_thread_handle();

        match exception_code {
            EXCEPTION_BREAKPOINT => {
                if !self.target.saw_initial_bp() {
                    // The OS-injected loader breakpoint: delivered without
                    // a table entry, and there is nothing to re-arm.
                    self.target.set_saw_initial_bp();
                    let _ = callbacks.on_breakpoint(self, exception_address, thread_handle);
                    Ok(DBG_CONTINUE)
                } else {
                    let known = self.target.prepare_sw_breakpoint_hit(exception_address)?;
                    let action = callbacks.on_breakpoint(self, exception_address, thread_handle);
                    if known {
                        self.target.finish_sw_breakpoint_hit(
                            exception_address,
                            action == BreakpointAction::Restore,
                        )?;
                    }
                    Ok(DBG_CONTINUE)
                }
            }

            // The second notification breakpoint seen when debugging a
            // WoW64 process; a debugger detail, not surfaced.
            STATUS_WX86_BREAKPOINT => {
                if self.target.saw_initial_wow64_bp() {
                    callbacks.on_unknown_exception(self, exception_address, exception_code);
                    Ok(DBG_EXCEPTION_NOT_HANDLED)
                } else {
                    self.target.set_saw_initial_wow64_bp();
                    Ok(DBG_CONTINUE)
                }
            }

            EXCEPTION_SINGLE_STEP => match self.target.take_step_state() {
                StepState::ResumeSwBreakpoint { address } => {
                    self.target.complete_sw_step(address)?;
                    Ok(DBG_CONTINUE)
                }
                StepState::ResumeHwBreakpoint { slot } => {
                    self.target.complete_hw_step(slot)?;
                    Ok(DBG_CONTINUE)
                }
                StepState::None => {
                    if let Some((slot, address, _access)) = self.target.pending_hw_hit()? {
                        let action =
                            callbacks.on_hardware_breakpoint(self, address, thread_handle, slot);
                        self.target
                            .finish_hw_breakpoint_hit(slot, action == BreakpointAction::Restore)?;
                    } else {
                        // A trap flag we did not plant, e.g. one the user
                        // set through set_flag.
                        callbacks.on_single_step(self, exception_address, thread_handle);
                    }
                    Ok(DBG_CONTINUE)
                }
            },

            EXCEPTION_ACCESS_VIOLATION => {
                let access =
                    AccessKind::from_exception_info(info.ExceptionRecord.ExceptionInformation[0]);
                let faulting_address = info.ExceptionRecord.ExceptionInformation[1] as u64;
                callbacks.on_access_violation(self, exception_address, faulting_address, access);
                Ok(DBG_EXCEPTION_NOT_HANDLED)
            }

            // Surfaced but left unhandled so the debuggee's own handlers
            // get their turn.
            _ => {
                callbacks.on_unknown_exception(self, exception_address, exception_code);
                Ok(DBG_EXCEPTION_NOT_HANDLED)
            }
        }
    }

    // Control surface. Everything below is safe to call from within a
    // callback; the debuggee is frozen until the event is continued.

    pub fn set_breakpoint(&mut self, address: u64) -> Result<()> {
        self.target.set_breakpoint(address)
    }

    pub fn clear_breakpoint(&mut self, address: u64) -> Result<()> {
        self.target.clear_breakpoint(address)
    }

    pub fn set_hardware_breakpoint(
        &mut self,
        address: u64,
        slot: DrReg,
        access: AccessType,
        length: BreakpointLength,
    ) -> Result<()> {
        self.target
            .set_hardware_breakpoint(address, slot, access, length)
    }

    pub fn clear_hardware_breakpoint(&mut self, slot: DrReg) -> Result<()> {
        self.target.clear_hardware_breakpoint(slot)
    }

    pub fn read_memory(&self, address: u64, len: usize) -> Result<Vec<u8>> {
        self.target.read_memory(address, len)
    }

    pub fn read_memory_partial(&self, address: u64, len: usize) -> Vec<u8> {
        self.target.read_memory_partial(address, len)
    }

    pub fn write_memory(&mut self, address: u64, data: &[u8]) -> Result<()> {
        self.target.write_memory(address, data)
    }

    pub fn search_in_memory(&self, pattern: impl Into<Pattern>) -> Result<Vec<u64>> {
        self.target.search_in_memory(&pattern.into())
    }

    /// `(base, size)` of every committed, non-guard, readable region.
    pub fn committed_regions(&self) -> Vec<(u64, u64)> {
        self.target.committed_regions()
    }

    pub fn query_memory(&self, address: u64) -> Result<win_util::memory::MemoryInfo> {
        self.target.query_memory(address)
    }

    /// Change the protection of a range, returning the previous protection.
    pub fn protect_memory(&mut self, address: u64, len: usize, protection: DWORD) -> Result<DWORD> {
        self.target.protect_memory(address, len, protection)
    }

    pub fn get_register(
        &mut self,
        thread_handle: HANDLE,
        reg: impl Into<Register>,
    ) -> Result<u64> {
        self.target.read_register(thread_handle, reg)
    }

    pub fn set_register(
        &mut self,
        thread_handle: HANDLE,
        reg: impl Into<Register>,
        value: u64,
    ) -> Result<()> {
        self.target.write_register(thread_handle, reg, value)
    }

    pub fn get_flag(&mut self, thread_handle: HANDLE, flag: impl Into<Flag>) -> Result<bool> {
        self.target.get_flag(thread_handle, flag)
    }

    pub fn set_flag(
        &mut self,
        thread_handle: HANDLE,
        flag: impl Into<Flag>,
        value: bool,
    ) -> Result<()> {
        self.target.set_flag(thread_handle, flag, value)
    }

    /// Map an RVA to its absolute address under the observed image base.
    pub fn aslr(&self, rva: u64) -> u64 {
        self.target.image_base().wrapping_add(rva)
    }

    pub fn hide_debugger(&mut self) -> Result<()> {
        self.target.hide_debugger()
    }

    pub fn process_handle(&self) -> HANDLE {
        self.target.process_handle()
    }

    pub fn process_id(&self) -> u32 {
        self.target.process_id()
    }

    pub fn target(&mut self) -> &mut Target {
        &mut self.target
    }

    /// Restore every breakpoint byte, zero the debug registers in every
    /// thread, and let the debuggee run free.
    pub fn detach(&mut self) -> Result<()> {
        if self.detached {
            return Ok(());
        }

        self.target.prepare_detach()?;
        check_winapi(|| unsafe { DebugActiveProcessStop(self.target.process_id()) })
            .map_err(|e| e.context(DebuggerError::DetachFailed))?;

        self.detached = true;
        self.continue_args = None;
        Ok(())
    }

    /// Forcibly end the debuggee. The event loop winds down when the
    /// resulting ExitProcess event arrives.
    pub fn terminate(&self) {
        if !self.target.exited() {
            trace!("terminating pid: {}", self.target.process_id());
            process::terminate(self.target.process_handle());
        }
    }

    fn close_module_file_handle(&mut self, base_address: u64) {
        if let Some(module) = self.target.module_mut(base_address) {
            module.close_file_handle();
        }
    }
}
