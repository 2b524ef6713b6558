use crate::debugger::binary::BinaryInfo;
use crate::debugger::error::Error;
use crate::debugger::register::{RegisterBank, REGNAME_PC};
use crate::debugger::{RemoteProcess, ThreadUpdater, BREAKPOINT_SIZE};
use crate::protocol::{RegisterInfo, ThreadSink};
use crate::weak_error;
use log::debug;
use std::sync::Arc;

/// One thread of the inferior, as reported by the stub.
///
/// Threads are owned by the engine and only mutated between stops; they hold
/// no reference back to it. All operations that talk to the stub live on
/// [`RemoteProcess`] and take a thread id.
pub struct RemoteThread {
    id: u32,
    /// The stub's identifier, verbatim (possibly `<pid>.<tid>`).
    str_id: String,
    pub(crate) regs: RegisterBank,
    pub(crate) current_breakpoint: Option<u64>,
    pub(crate) breakpoint_condition_met: bool,
    pub(crate) breakpoint_condition_error: Option<Error>,
    /// The most recent stop reported reason "breakpoint" for this thread.
    pub(crate) setbp: bool,
}

impl RemoteThread {
    pub(crate) fn new(id: u32, str_id: String, layout: Arc<[RegisterInfo]>) -> Self {
        RemoteThread {
            id,
            str_id,
            regs: RegisterBank::new(layout),
            current_breakpoint: None,
            breakpoint_condition_met: false,
            breakpoint_condition_error: None,
            setbp: false,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn str_id(&self) -> &str {
        &self.str_id
    }

    pub fn registers(&self) -> &RegisterBank {
        &self.regs
    }

    pub fn pc(&self) -> u64 {
        self.regs.pc()
    }

    /// Address of the breakpoint this thread is stopped at. Non-empty only
    /// between a stop and the next resume.
    pub fn current_breakpoint(&self) -> Option<u64> {
        self.current_breakpoint
    }

    pub fn breakpoint_condition_met(&self) -> bool {
        self.breakpoint_condition_met
    }

    pub fn breakpoint_condition_error(&self) -> Option<&Error> {
        self.breakpoint_condition_error.as_ref()
    }

    pub(crate) fn clear_breakpoint_state(&mut self) {
        self.setbp = false;
        self.current_breakpoint = None;
        self.breakpoint_condition_met = false;
        self.breakpoint_condition_error = None;
    }
}

impl<B: BinaryInfo> RemoteProcess<B> {
    /// Reload the thread's whole register bank, then recover its goroutine
    /// descriptor address.
    ///
    /// Uses one bulk `g` transfer while the stub supports it; after the
    /// first empty reply the session downgrades to one `p` per declared
    /// register, permanently.
    pub(crate) fn reload_registers(&mut self, tid: u32) -> Result<(), Error> {
        let str_id = self.thread_str_id(tid)?;
        if self.conn.gcmd_ok() {
            let th = self
                .threads
                .get_mut(&tid)
                .ok_or_else(|| Error::ThreadNotFound(str_id.clone()))?;
            match self.conn.read_registers(&str_id, th.regs.buf_mut()) {
                Ok(()) => {}
                Err(e) if e.is_unsupported() => {
                    debug!(target: "debugger", "stub lacks the g command, falling back to p");
                    self.conn.downgrade_gcmd();
                }
                Err(e) => return Err(e),
            }
        }
        if !self.conn.gcmd_ok() {
            let layout = self.conn.regs_info();
            for info in layout.iter() {
                let th = self
                    .threads
                    .get_mut(&tid)
                    .ok_or_else(|| Error::ThreadNotFound(str_id.clone()))?;
                let buf = th.regs.slot_bytes_mut(&info.name)?;
                self.conn.read_register(&str_id, info.regnum, buf)?;
            }
        }
        self.reload_g(tid)
    }

    /// Refresh a subset of registers. Under `g`/`G` support the whole bank
    /// is transferred anyway (it is no more expensive).
    pub(crate) fn read_some_registers(&mut self, tid: u32, names: &[&str]) -> Result<(), Error> {
        let str_id = self.thread_str_id(tid)?;
        if self.conn.gcmd_ok() {
            let th = self
                .threads
                .get_mut(&tid)
                .ok_or_else(|| Error::ThreadNotFound(str_id.clone()))?;
            return self.conn.read_registers(&str_id, th.regs.buf_mut());
        }
        for name in names {
            let th = self
                .threads
                .get_mut(&tid)
                .ok_or_else(|| Error::ThreadNotFound(str_id.clone()))?;
            let regnum = th.regs.regnum(name)?;
            let buf = th.regs.slot_bytes_mut(name)?;
            self.conn.read_register(&str_id, regnum, buf)?;
        }
        Ok(())
    }

    pub(crate) fn write_some_registers(&mut self, tid: u32, names: &[&str]) -> Result<(), Error> {
        let str_id = self.thread_str_id(tid)?;
        if self.conn.gcmd_ok() {
            let th = self
                .threads
                .get(&tid)
                .ok_or_else(|| Error::ThreadNotFound(str_id.clone()))?;
            return self.conn.write_registers(&str_id, th.regs.buf());
        }
        for name in names {
            let th = self
                .threads
                .get(&tid)
                .ok_or_else(|| Error::ThreadNotFound(str_id.clone()))?;
            let regnum = th.regs.regnum(name)?;
            let buf = th.regs.slot_bytes(name)?;
            self.conn.write_register(&str_id, regnum, buf)?;
        }
        Ok(())
    }

    /// Single-step one instruction with any trap at the current PC
    /// temporarily cleared, so the step makes progress instead of
    /// re-trapping in place.
    pub(crate) fn step_thread(
        &mut self,
        tid: u32,
        tu: Option<&mut ThreadUpdater>,
    ) -> Result<(), Error> {
        let str_id = self.thread_str_id(tid)?;
        let pc = self
            .threads
            .get(&tid)
            .map(|t| t.regs.pc())
            .ok_or_else(|| Error::ThreadNotFound(str_id.clone()))?;
        let trapped = self.breakpoints.contains_key(&pc);
        if trapped {
            self.conn.clear_breakpoint(pc)?;
        }
        let step_res = self
            .conn
            .step(&str_id, tu.map(|t| t as &mut dyn ThreadSink))
            .map(drop);
        if trapped {
            weak_error!(self.conn.set_breakpoint(pc), "reinstall breakpoint:");
        }
        step_res
    }

    /// Step one instruction and refresh the thread's state.
    pub(crate) fn thread_step_instruction(&mut self, tid: u32) -> Result<(), Error> {
        self.step_thread(tid, None)?;
        self.reload_registers(tid)
    }

    /// Locate the breakpoint the thread is stopped at, rewinding the PC when
    /// the stub reported it one byte past the trap, then evaluate the
    /// breakpoint condition and bump hit counters.
    pub(crate) fn set_current_breakpoint(&mut self, tid: u32) -> Result<(), Error> {
        let th = self
            .threads
            .get_mut(&tid)
            .ok_or_else(|| Error::ThreadNotFound(format!("{tid:x}")))?;
        th.current_breakpoint = None;
        let pc = th.regs.pc();

        let Some(addr) = self.find_breakpoint(pc).map(|bp| bp.addr) else {
            return Ok(());
        };
        if pc != addr {
            if let Some(th) = self.threads.get_mut(&tid) {
                th.regs.set_pc(addr);
            }
            self.write_some_registers(tid, &[REGNAME_PC])?;
        }

        let cond = self.breakpoints.get(&addr).and_then(|bp| bp.cond);
        let (met, cond_err) = match cond {
            None => (true, None),
            Some(crate::debugger::breakpoint::BreakpointCondition::SameGoroutine(want)) => {
                match self.thread_goroutine(tid) {
                    Ok(g) => (g.map(|g| g.id == want).unwrap_or(false), None),
                    Err(e) => (false, Some(e)),
                }
            }
        };

        if let Some(th) = self.threads.get_mut(&tid) {
            th.current_breakpoint = Some(addr);
            th.breakpoint_condition_met = met;
            th.breakpoint_condition_error = cond_err;
        }
        if met {
            let gid = self
                .thread_goroutine(tid)
                .ok()
                .flatten()
                .map(|g| g.id);
            if let Some(bp) = self.breakpoints.get_mut(&addr) {
                bp.hit(gid);
            }
        }
        Ok(())
    }

    pub(crate) fn thread_str_id(&self, tid: u32) -> Result<String, Error> {
        self.threads
            .get(&tid)
            .map(|t| t.str_id.clone())
            .ok_or_else(|| Error::ThreadNotFound(format!("{tid:x}")))
    }

    /// Two-probe breakpoint lookup: the stub may report the PC either at the
    /// trap address or one byte past it.
    pub fn find_breakpoint(&self, pc: u64) -> Option<&crate::debugger::breakpoint::Breakpoint> {
        pc.checked_sub(BREAKPOINT_SIZE)
            .and_then(|probe| self.breakpoints.get(&probe))
            .or_else(|| self.breakpoints.get(&pc))
    }
}
