//! Recovery of the per-thread goroutine descriptor address.
//!
//! The descriptor lives at a fixed offset from the `fs`/`gs` segment base
//! and none of the supported stubs expose the segment base registers. The
//! engine therefore executes a single MOV instruction inside the inferior
//! and captures the result from `rcx`.

use crate::debugger::binary::{BinaryInfo, TargetOs};
use crate::debugger::error::Error;
use crate::debugger::register::{REGNAME_CX, REGNAME_PC};
use crate::debugger::RemoteProcess;
use log::debug;

/// How the load instruction reaches the inferior. Fixed once per
/// connection, right after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GLoadStrategy {
    /// The instruction was written to stub-allocated scratch memory at this
    /// address; threads jump there to execute it.
    ViaScratch(u64),
    /// No allocation support: the instruction is written over the bytes at
    /// the thread's PC and everything is restored afterwards.
    ViaInPlace,
}

/// Runtime functions a thread parks in without carrying a goroutine. A PC
/// inside one of these makes instruction injection both pointless and
/// unsafe, so the resolver short-circuits to "no G".
const BLOCKED_FUNCTIONS: &[&str] = &[
    "runtime.futex",
    "runtime.usleep",
    "runtime.clone",
    "runtime.kevent",
    "runtime.mach_semaphore_wait",
    "runtime.mach_semaphore_timedwait",
];

/// The MOV that loads the goroutine descriptor address into `rcx` for the
/// given system and runtime G-struct offset.
pub(crate) fn load_g_instr(os: TargetOs, g_struct_offset: u64) -> Result<Vec<u8>, Error> {
    match os {
        TargetOs::Linux => match g_struct_offset {
            // mov rcx, qword ptr fs:[0xfffffffffffffff8]
            0xfffffffffffffff8 | 0x0 => {
                Ok(vec![0x64, 0x48, 0x8b, 0x0c, 0x25, 0xf8, 0xff, 0xff, 0xff])
            }
            // mov rcx, qword ptr fs:[0xfffffffffffffff0]
            0xfffffffffffffff0 => {
                Ok(vec![0x64, 0x48, 0x8b, 0x0c, 0x25, 0xf0, 0xff, 0xff, 0xff])
            }
            other => Err(Error::GOffsetNotSupported(other)),
        },
        // mov rcx, qword ptr gs:[0x8a0]
        TargetOs::Darwin => Ok(vec![0x65, 0x48, 0x8b, 0x0c, 0x25, 0xa0, 0x08, 0x00, 0x00]),
    }
}

impl<B: BinaryInfo> RemoteProcess<B> {
    pub(crate) fn reload_g(&mut self, tid: u32) -> Result<(), Error> {
        match self.g_strategy {
            GLoadStrategy::ViaScratch(addr) => self.reload_g_alloc(tid, addr),
            GLoadStrategy::ViaInPlace => self.reload_g_at_pc(tid),
        }
    }

    fn thread_blocked(&self, tid: u32) -> bool {
        let Some(th) = self.threads.get(&tid) else {
            return false;
        };
        match self.bi.function_at(th.regs.pc()) {
            Some(name) => BLOCKED_FUNCTIONS.contains(&name.as_str()),
            None => false,
        }
    }

    /// Execute the scratch-memory copy of the load instruction: point the
    /// PC at it, step once, read `rcx`, restore PC and `rcx`.
    fn reload_g_alloc(&mut self, tid: u32, instr_addr: u64) -> Result<(), Error> {
        if self.thread_blocked(tid) {
            if let Some(th) = self.threads.get_mut(&tid) {
                th.regs.set_gaddr(0);
            }
            return Ok(());
        }

        let str_id = self.thread_str_id(tid)?;
        let (cx, pc) = {
            let th = self
                .threads
                .get(&tid)
                .ok_or_else(|| Error::ThreadNotFound(str_id.clone()))?;
            (th.regs.cx(), th.regs.pc())
        };

        if let Some(th) = self.threads.get_mut(&tid) {
            th.regs.set_pc(instr_addr);
        }
        self.write_some_registers(tid, &[REGNAME_PC])?;

        let mut first_err = None;
        keep_err(&mut first_err, self.conn.step(&str_id, None).map(drop));
        if first_err.is_none() {
            keep_err(&mut first_err, self.read_some_registers(tid, &[REGNAME_CX]));
        }
        let gaddr = self.threads.get(&tid).map(|t| t.regs.cx()).unwrap_or(0);

        if let Some(th) = self.threads.get_mut(&tid) {
            th.regs.set_pc(pc);
            th.regs.set_cx(cx);
        }
        keep_err(
            &mut first_err,
            self.write_some_registers(tid, &[REGNAME_PC, REGNAME_CX]),
        );

        if let Some(e) = first_err {
            return Err(e);
        }
        debug!(target: "debugger", "thread {tid:x} G descriptor at {gaddr:#x}");
        if let Some(th) = self.threads.get_mut(&tid) {
            th.regs.set_gaddr(gaddr);
        }
        Ok(())
    }

    /// Execute the load instruction in place: overwrite the bytes at the
    /// PC, step, then restore code and registers.
    ///
    /// lldb-server corrupts the saved original byte when a breakpoint is
    /// set on freshly written memory. The required order: clear trapped
    /// addresses, write the instruction, step, restore the code, restore
    /// the registers, re-set the breakpoints.
    fn reload_g_at_pc(&mut self, tid: u32) -> Result<(), Error> {
        if self.thread_blocked(tid) {
            if let Some(th) = self.threads.get_mut(&tid) {
                th.regs.set_gaddr(0);
            }
            return Ok(());
        }

        let movinstr = load_g_instr(self.bi.target_os(), self.bi.g_struct_offset())?;
        let pc = self
            .threads
            .get(&tid)
            .map(|t| t.regs.pc())
            .ok_or_else(|| Error::ThreadNotFound(format!("{tid:x}")))?;

        let overlapping: Vec<u64> = self
            .breakpoints
            .keys()
            .copied()
            .filter(|addr| *addr >= pc && *addr <= pc + movinstr.len() as u64)
            .collect();
        let mut cleared = Vec::with_capacity(overlapping.len());
        let mut res = Ok(());
        for addr in overlapping {
            match self.conn.clear_breakpoint(addr) {
                Ok(()) => cleared.push(addr),
                Err(e) => {
                    res = Err(e);
                    break;
                }
            }
        }
        if res.is_ok() {
            res = self.inject_g_load(tid, pc, &movinstr);
        }
        for addr in cleared.into_iter().rev() {
            crate::weak_error!(self.conn.set_breakpoint(addr), "reinstall breakpoint:");
        }
        res
    }

    fn inject_g_load(&mut self, tid: u32, pc: u64, movinstr: &[u8]) -> Result<(), Error> {
        let str_id = self.thread_str_id(tid)?;
        let cx = self
            .threads
            .get(&tid)
            .map(|th| th.regs.cx())
            .ok_or_else(|| Error::ThreadNotFound(str_id.clone()))?;

        let mut saved = vec![0u8; movinstr.len()];
        self.conn.read_memory(&mut saved, pc)?;
        self.conn.write_memory(pc, movinstr)?;

        let mut first_err = None;
        keep_err(&mut first_err, self.conn.step(&str_id, None).map(drop));
        if first_err.is_none() {
            keep_err(
                &mut first_err,
                self.read_some_registers(tid, &[REGNAME_PC, REGNAME_CX]),
            );
        }
        let gaddr = self.threads.get(&tid).map(|t| t.regs.cx()).unwrap_or(0);

        keep_err(&mut first_err, self.conn.write_memory(pc, &saved).map(drop));
        if let Some(th) = self.threads.get_mut(&tid) {
            th.regs.set_pc(pc);
            th.regs.set_cx(cx);
        }
        keep_err(
            &mut first_err,
            self.write_some_registers(tid, &[REGNAME_PC, REGNAME_CX]),
        );

        if let Some(e) = first_err {
            return Err(e);
        }
        debug!(target: "debugger", "thread {tid:x} G descriptor at {gaddr:#x}");
        if let Some(th) = self.threads.get_mut(&tid) {
            th.regs.set_gaddr(gaddr);
        }
        Ok(())
    }
}

fn keep_err(slot: &mut Option<Error>, res: Result<(), Error>) {
    if slot.is_none() {
        if let Err(e) = res {
            *slot = Some(e);
        }
    }
}
