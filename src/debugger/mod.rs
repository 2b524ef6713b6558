//! Run-control engine on top of a Gdb Remote Serial Protocol stub.
//!
//! Stubs differ wildly in which packets they implement and in how they
//! report multithreaded stops. This engine assumes the lldb-server /
//! debugserver model: in all-stop mode only the first stop event is
//! reported and the state of the remaining threads is queried afterwards
//! (`qThreadStopInfo`). gdbserver-style delayed events are not handled.

pub mod binary;
pub mod breakpoint;
pub mod error;
pub mod gresolver;
pub mod register;
pub mod thread;

pub use binary::{BinaryInfo, Goroutine, MemoryAccess, Place, TargetOs};
pub use breakpoint::{Breakpoint, BreakpointCondition, BreakpointKind};
pub use thread::RemoteThread;

use crate::debugger::error::Error;
use crate::debugger::gresolver::{load_g_instr, GLoadStrategy};
use crate::protocol::stop::parse_thread_id;
use crate::protocol::{GdbConn, ThreadSink};
use crate::weak_error;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::net::TcpStream;
use std::process::Child;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread as stdthread;
use std::time::Duration;

const INTERRUPT_SIGNAL: u8 = 0x02;
const BREAKPOINT_SIGNAL: u8 = 0x05;
const CHILD_SIGNAL: u8 = 0x11;
const STOP_SIGNAL: u8 = 0x13;

/// Size of the trap instruction the stub installs for `Z0`.
pub(crate) const BREAKPOINT_SIZE: u64 = 1;

/// What to do with a stop signal reported by the stub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopDisposition {
    /// Report the stop to the caller.
    Stop,
    /// Resume the inferior with the signal delivered to it.
    Forward(u8),
}

/// Classification of the signal in a stop reply.
///
/// `0x05` is always a breakpoint. A manual stop manifests as `0x13` (lldb)
/// or `0x11` (debugserver); `0x02` is reported both for our own interrupt
/// and for a genuine ^C typed at the inferior, so `ctrl_c` records which of
/// the two happened. `0x91..=0x96` are debugserver's encodings of Mach
/// exceptions, which cannot be delivered back to the process.
fn classify_stop_signal(sig: u8, ctrl_c: bool, is_debugserver: bool) -> StopDisposition {
    match sig {
        INTERRUPT_SIGNAL if ctrl_c => StopDisposition::Stop,
        BREAKPOINT_SIGNAL | STOP_SIGNAL => StopDisposition::Stop,
        CHILD_SIGNAL if is_debugserver => StopDisposition::Stop,
        0x91..=0x96 => StopDisposition::Stop,
        other => StopDisposition::Forward(other),
    }
}

/// Collects thread ids reported by the stub, either from an explicit
/// `qfThreadInfo` sweep or inlined in a stop reply. The engine applies the
/// collected set to its thread table afterwards.
#[derive(Default)]
pub(crate) struct ThreadUpdater {
    seen: HashSet<u32>,
    discovered: Vec<(u32, String)>,
    pub(crate) done: bool,
}

impl ThreadSink for ThreadUpdater {
    fn add(&mut self, ids: &[&str]) -> Result<(), Error> {
        debug_assert!(!self.done, "thread updater reused after finish");
        for id in ids {
            let tid = parse_thread_id(id)?;
            if self.seen.insert(tid) {
                self.discovered.push((tid, id.to_string()));
            }
        }
        Ok(())
    }

    fn set_done(&mut self) {
        self.done = true;
    }
}

/// Connection parameters for [`RemoteProcess::connect`].
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Path to the inferior's executable. When absent the stub is asked,
    /// first with `qXfer:exec-file:read`, then with `qProcessInfo`.
    pub executable: Option<String>,
    /// PID of the inferior when attaching; zero means unknown.
    pub pid: u64,
    /// TCP connect attempts, one second apart. Zero behaves like one.
    pub attempts: usize,
}

/// Outcome of [`RemoteProcess::detach`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachStatus {
    Detached,
    /// The inferior was already gone before the call.
    AlreadyExited,
}

/// Handle for interrupting a blocked [`RemoteProcess::continue_once`] from
/// another thread. The interrupt byte is the only out-of-band datum in the
/// protocol, so this is the only cross-thread entry point.
pub struct InterruptHandle {
    stream: TcpStream,
    ctrl_c: Arc<AtomicBool>,
}

impl InterruptHandle {
    pub fn interrupt(&self) -> std::io::Result<()> {
        self.ctrl_c.store(true, Ordering::SeqCst);
        (&self.stream).write_all(&[0x03])
    }
}

/// A process controlled through a remote debugging stub.
///
/// Owns the connection, the thread table, the breakpoint table and the
/// current-thread / selected-goroutine pointers. All tables are mutated
/// only between stops; readers during a resume observe the previous,
/// self-consistent snapshot.
pub struct RemoteProcess<B: BinaryInfo> {
    pub(crate) conn: GdbConn,
    pub(crate) bi: B,
    pub(crate) threads: HashMap<u32, RemoteThread>,
    current_thread: Option<u32>,
    selected_goroutine: Option<Goroutine>,
    pub(crate) breakpoints: HashMap<u64, Breakpoint>,
    breakpoint_id: i32,
    internal_breakpoint_id: i32,
    exited: bool,
    exit_status: u8,
    ctrl_c: Arc<AtomicBool>,
    pub(crate) g_strategy: GLoadStrategy,
    all_g_cache: Option<Vec<Goroutine>>,
    exec_path: Option<String>,
    stub_process: Option<Child>,
}

impl<B: BinaryInfo> std::fmt::Debug for RemoteProcess<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteProcess")
            .field("exec_path", &self.exec_path)
            .field("exited", &self.exited)
            .finish_non_exhaustive()
    }
}

impl<B: BinaryInfo> RemoteProcess<B> {
    /// Connect to a stub at `addr` and prepare the inferior for debugging:
    /// negotiate the session, resolve the executable path, pick a strategy
    /// for goroutine descriptor recovery, enumerate threads and install the
    /// panic breakpoint.
    ///
    /// Symbols must already be loaded into `bi`; the engine only consumes
    /// them.
    pub fn connect(addr: &str, opts: ConnectOptions, bi: B) -> Result<Self, Error> {
        let mut stream = None;
        let mut last_err = None;
        let attempts = opts.attempts.max(1);
        for i in 0..attempts {
            match TcpStream::connect(addr) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    last_err = Some(e);
                    if i + 1 < attempts {
                        stdthread::sleep(Duration::from_secs(1));
                    }
                }
            }
        }
        let Some(stream) = stream else {
            return Err(last_err.map(Error::IO).unwrap_or(Error::ConnectionClosed));
        };

        let mut conn = GdbConn::new(stream);
        conn.set_pid(opts.pid);
        conn.handshake()?;

        let exec_path = match opts.executable {
            Some(path) => Some(path),
            None => match conn.read_exec_file() {
                Ok(path) => Some(path),
                Err(e) if e.is_unsupported() => {
                    // the gdb way failed, try the lldb way
                    match conn.query_process_info(opts.pid) {
                        Ok(info) => info.get("name").cloned(),
                        Err(e) => return Err(Error::ExecutablePathUnknown(Box::new(e))),
                    }
                }
                Err(e) => return Err(Error::ExecutablePathUnknown(Box::new(e))),
            },
        };

        // No supported stub reports fs_base/gs_base, so goroutine lookup
        // executes a MOV inside the inferior. Stash it in scratch memory if
        // the stub can allocate some; otherwise it will be written over the
        // code at the PC every time.
        let g_strategy = match conn.alloc_memory(256) {
            Ok(scratch) => {
                let instr = load_g_instr(bi.target_os(), bi.g_struct_offset())?;
                match conn.write_memory(scratch, &instr) {
                    Ok(_) => GLoadStrategy::ViaScratch(scratch),
                    Err(e) => {
                        warn!(target: "debugger", "cannot seed scratch memory: {e:#}");
                        GLoadStrategy::ViaInPlace
                    }
                }
            }
            Err(e) => {
                debug!(target: "debugger", "stub cannot allocate memory ({e:#}), \
                       G loading will patch code at the PC");
                GLoadStrategy::ViaInPlace
            }
        };

        let mut process = RemoteProcess {
            conn,
            bi,
            threads: HashMap::new(),
            current_thread: None,
            selected_goroutine: None,
            breakpoints: HashMap::new(),
            breakpoint_id: 0,
            internal_breakpoint_id: 0,
            exited: false,
            exit_status: 0,
            ctrl_c: Arc::new(AtomicBool::new(false)),
            g_strategy,
            all_g_cache: None,
            exec_path,
            stub_process: None,
        };

        // attach leaves the inferior in an implicit stop
        weak_error!(process.conn.query_halt_reason());

        let mut tu = ThreadUpdater::default();
        process.update_thread_list(&mut tu)?;

        if process.conn.pid() == 0 {
            let (pid, _) = process.load_process_info(0)?;
            process.conn.set_pid(pid);
        }

        if let Some(tid) = process.current_thread {
            process.selected_goroutine =
                weak_error!(process.thread_goroutine(tid)).flatten();
        }

        if let Some(panic_pc) = process.bi.function_address("runtime.startpanic") {
            let installed = process
                .set_breakpoint(panic_pc, BreakpointKind::User, None)
                .map(|bp| bp.addr);
            match installed {
                Ok(addr) => {
                    // hand back the user id it consumed and relabel it
                    process.breakpoint_id -= 1;
                    if let Some(bp) = process.breakpoints.get_mut(&addr) {
                        bp.name = Some("unrecovered-panic".to_string());
                        bp.id = -1;
                    }
                }
                Err(e) => warn!(target: "debugger", "cannot install panic breakpoint: {e:#}"),
            }
        }

        info!(target: "debugger", "attached to process {}", process.conn.pid());
        Ok(process)
    }

    /// Resume the inferior and block until a stop the engine reports to the
    /// caller. Signals the classifier does not recognize as stops are
    /// forwarded to the inferior and the wait continues. Returns the id of
    /// the thread that reported the stop.
    pub fn continue_once(&mut self) -> Result<u32, Error> {
        if self.exited {
            return Err(self.exited_error());
        }

        // step threads stopped at a breakpoint over it, so resuming does
        // not immediately re-trap at the same address
        let trapped: Vec<u32> = self
            .threads
            .iter()
            .filter(|(_, th)| th.current_breakpoint.is_some())
            .map(|(tid, _)| *tid)
            .collect();
        for tid in trapped {
            self.step_thread(tid, None)?;
        }

        self.all_g_cache = None;
        for th in self.threads.values_mut() {
            th.clear_breakpoint_state();
        }
        self.ctrl_c.store(false, Ordering::SeqCst);

        let mut tu = ThreadUpdater::default();
        let mut sig = 0u8;
        let reporting_thread;
        loop {
            tu.done = false;
            let stop = match self.conn.resume(sig, &mut tu) {
                Ok(stop) => stop,
                Err(e) => {
                    if let Error::ProcessExited { status, .. } = &e {
                        self.exited = true;
                        self.exit_status = *status;
                    }
                    return Err(e);
                }
            };
            let ctrl_c = self.ctrl_c.load(Ordering::SeqCst);
            match classify_stop_signal(stop.signal, ctrl_c, self.conn.is_debugserver()) {
                StopDisposition::Stop => {
                    reporting_thread = stop.thread_id;
                    break;
                }
                StopDisposition::Forward(fwd) => {
                    debug!(target: "debugger", "forwarding signal {fwd:#04x} to the inferior");
                    sig = fwd;
                }
            }
        }

        self.update_thread_list(&mut tu)?;
        self.set_current_breakpoints()?;

        self.threads
            .values()
            .find(|th| th.str_id() == reporting_thread)
            .map(|th| th.id())
            .ok_or(Error::ThreadNotFound(reporting_thread))
    }

    /// Single-step the selected goroutine by one instruction.
    ///
    /// A goroutine parked on a run queue has no thread to step; it gets an
    /// internal breakpoint at its saved PC, conditional on itself, and the
    /// inferior is continued instead.
    pub fn step_instruction(&mut self) -> Result<(), Error> {
        let Some(g) = self.selected_goroutine.clone() else {
            return Err(Error::NoSelectedGoroutine);
        };
        match g.thread_id {
            None => {
                self.set_breakpoint(
                    g.pc,
                    BreakpointKind::Next,
                    Some(BreakpointCondition::SameGoroutine(g.id)),
                )?;
                self.continue_once()?;
                Ok(())
            }
            Some(tid) => {
                if self.exited {
                    return Err(self.exited_error());
                }
                self.all_g_cache = None;
                self.threads
                    .get_mut(&tid)
                    .ok_or_else(|| Error::ThreadNotFound(format!("{tid:x}")))?
                    .clear_breakpoint_state();
                self.thread_step_instruction(tid)?;
                self.set_current_breakpoint(tid)
            }
        }
    }

    /// Install a software breakpoint. Fails when one already exists at the
    /// address or when the address is not inside a known function.
    pub fn set_breakpoint(
        &mut self,
        addr: u64,
        kind: BreakpointKind,
        cond: Option<BreakpointCondition>,
    ) -> Result<&Breakpoint, Error> {
        if let Some(bp) = self.breakpoints.get(&addr) {
            return Err(Error::BreakpointExists {
                addr: bp.addr,
                file: bp.file.clone(),
                line: bp.line,
            });
        }
        let place = self.bi.pc_to_place(addr).ok_or(Error::InvalidAddress(addr))?;
        let id = if kind == BreakpointKind::User {
            self.breakpoint_id += 1;
            self.breakpoint_id
        } else {
            self.internal_breakpoint_id -= 1;
            self.internal_breakpoint_id
        };
        self.conn.set_breakpoint(addr)?;
        debug!(target: "debugger", "breakpoint {id} installed at {addr:#x}");
        Ok(self
            .breakpoints
            .entry(addr)
            .or_insert_with(|| Breakpoint::new(addr, kind, place, cond, id)))
    }

    /// Remove a breakpoint and return its record.
    pub fn clear_breakpoint(&mut self, addr: u64) -> Result<Breakpoint, Error> {
        if self.exited {
            return Err(self.exited_error());
        }
        if !self.breakpoints.contains_key(&addr) {
            return Err(Error::NoBreakpoint(addr));
        }
        self.conn.clear_breakpoint(addr)?;
        debug!(target: "debugger", "breakpoint cleared at {addr:#x}");
        self.breakpoints
            .remove(&addr)
            .ok_or(Error::NoBreakpoint(addr))
    }

    /// Remove every engine-installed breakpoint and detach it from threads.
    pub fn clear_internal_breakpoints(&mut self) -> Result<(), Error> {
        let internal: Vec<u64> = self
            .breakpoints
            .values()
            .filter(|bp| bp.is_internal())
            .map(|bp| bp.addr)
            .collect();
        for addr in internal {
            self.clear_breakpoint(addr)?;
            for th in self.threads.values_mut() {
                if th.current_breakpoint == Some(addr) {
                    th.current_breakpoint = None;
                }
            }
        }
        Ok(())
    }

    /// Ask the stub to interrupt the inferior. The next stop reply carrying
    /// the interrupt signal is then reported as a stop instead of being
    /// forwarded.
    pub fn request_manual_stop(&mut self) -> Result<(), Error> {
        self.ctrl_c.store(true, Ordering::SeqCst);
        self.conn.send_ctrl_c()
    }

    /// Alias of [`RemoteProcess::request_manual_stop`].
    pub fn halt(&mut self) -> Result<(), Error> {
        self.request_manual_stop()
    }

    /// Handle usable from another thread while this one is blocked in
    /// [`RemoteProcess::continue_once`].
    pub fn interrupt_handle(&self) -> Result<InterruptHandle, Error> {
        Ok(InterruptHandle {
            stream: self.conn.try_clone_stream()?,
            ctrl_c: Arc::clone(&self.ctrl_c),
        })
    }

    /// Kill the inferior. Killing an already exited process succeeds.
    pub fn kill(&mut self) -> Result<(), Error> {
        if self.exited {
            return Ok(());
        }
        match self.conn.kill() {
            Err(Error::ProcessExited { status, .. }) => {
                self.exited = true;
                self.exit_status = status;
                Ok(())
            }
            other => other,
        }
    }

    /// Detach from the inferior, optionally killing it first, and reap the
    /// stub child process if this engine spawned one.
    pub fn detach(&mut self, kill: bool) -> Result<DetachStatus, Error> {
        let already_exited = self.exited;
        if kill {
            self.kill()?;
        }
        if !self.exited {
            self.conn.detach()?;
        }
        if let Some(mut child) = self.stub_process.take() {
            weak_error!(child.kill(), "stop stub process:");
            weak_error!(child.wait(), "reap stub process:");
        }
        Ok(if already_exited {
            DetachStatus::AlreadyExited
        } else {
            DetachStatus::Detached
        })
    }

    /// Focus a thread; the selected goroutine follows it.
    pub fn switch_thread(&mut self, tid: u32) -> Result<(), Error> {
        if !self.threads.contains_key(&tid) {
            return Err(Error::ThreadNotFound(format!("{tid:x}")));
        }
        self.current_thread = Some(tid);
        self.selected_goroutine = weak_error!(self.thread_goroutine(tid)).flatten();
        Ok(())
    }

    /// Select a goroutine by id. A goroutine running on a thread moves the
    /// thread focus too; a parked one only moves the selection.
    pub fn switch_goroutine(&mut self, gid: i64) -> Result<(), Error> {
        let g = if gid == -1 {
            self.selected_goroutine.clone()
        } else {
            self.all_g_cache
                .as_ref()
                .and_then(|cache| cache.iter().find(|g| g.id == gid).cloned())
        };
        let Some(g) = g else {
            if gid == -1 {
                return Ok(());
            }
            return Err(Error::GoroutineNotFound(gid));
        };
        match g.thread_id {
            Some(tid) => self.switch_thread(tid),
            None => {
                self.selected_goroutine = Some(g);
                Ok(())
            }
        }
    }

    pub fn read_memory(&mut self, buf: &mut [u8], addr: u64) -> Result<(), Error> {
        self.conn.read_memory(buf, addr)
    }

    pub fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<usize, Error> {
        self.conn.write_memory(addr, data)
    }

    pub fn pid(&self) -> u64 {
        self.conn.pid()
    }

    pub fn exited(&self) -> bool {
        self.exited
    }

    pub fn running(&self) -> bool {
        self.conn.running()
    }

    /// Path of the inferior's executable, when it could be determined.
    pub fn exec_path(&self) -> Option<&str> {
        self.exec_path.as_deref()
    }

    pub fn thread_list(&self) -> Vec<&RemoteThread> {
        self.threads.values().collect()
    }

    pub fn find_thread(&self, tid: u32) -> Option<&RemoteThread> {
        self.threads.get(&tid)
    }

    pub fn current_thread(&self) -> Option<&RemoteThread> {
        self.current_thread.and_then(|tid| self.threads.get(&tid))
    }

    pub fn selected_goroutine(&self) -> Option<&Goroutine> {
        self.selected_goroutine.as_ref()
    }

    pub fn breakpoints(&self) -> &HashMap<u64, Breakpoint> {
        &self.breakpoints
    }

    /// Cache for externally produced goroutine listings; dropped on every
    /// resume.
    pub fn all_g_cache_mut(&mut self) -> &mut Option<Vec<Goroutine>> {
        &mut self.all_g_cache
    }

    /// Route inferior console output (`O` packets) to `sink` instead of the
    /// log.
    pub fn set_console_sink(&mut self, sink: Box<dyn Write + Send>) {
        self.conn.set_console_sink(sink);
    }

    pub(crate) fn set_debugserver(&mut self, v: bool) {
        self.conn.set_debugserver(v);
    }

    pub(crate) fn set_stub_process(&mut self, child: Child) {
        self.stub_process = Some(child);
    }

    /// Refresh the thread table and every thread's registers after a stop.
    /// The explicit enumeration is skipped when the stop reply already
    /// inlined the thread list into `tu`.
    pub(crate) fn update_thread_list(&mut self, tu: &mut ThreadUpdater) -> Result<(), Error> {
        if !tu.done {
            let mut first = true;
            loop {
                let ids = self.conn.query_threads(first)?;
                if ids.is_empty() {
                    break;
                }
                first = false;
                let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
                tu.add(&refs)?;
            }
            tu.set_done();
        }

        let layout = self.conn.regs_info();
        self.threads.retain(|tid, _| tu.seen.contains(tid));
        for (tid, str_id) in &tu.discovered {
            self.threads.entry(*tid).or_insert_with(|| {
                debug!(target: "debugger", "new thread {str_id}");
                RemoteThread::new(*tid, str_id.clone(), Arc::clone(&layout))
            });
        }
        let current_alive = self
            .current_thread
            .map(|tid| self.threads.contains_key(&tid))
            .unwrap_or(false);
        if !current_alive {
            self.current_thread = self.threads.keys().next().copied();
        }
        // a goroutine selection may not point at a vanished thread
        if let Some(g) = &mut self.selected_goroutine {
            if let Some(tid) = g.thread_id {
                if !self.threads.contains_key(&tid) {
                    g.thread_id = None;
                }
            }
        }

        if self.conn.thread_stop_info_supported() {
            let ids: Vec<(u32, String)> = self
                .threads
                .values()
                .map(|th| (th.id(), th.str_id().to_string()))
                .collect();
            for (tid, str_id) in ids {
                match self.conn.thread_stop_info(&str_id) {
                    Ok((sig, reason)) => {
                        if let Some(th) = self.threads.get_mut(&tid) {
                            th.setbp = reason == "breakpoint"
                                || (reason.is_empty() && sig == BREAKPOINT_SIGNAL);
                        }
                    }
                    Err(e) if e.is_unsupported() => {
                        debug!(target: "debugger", "stub lacks qThreadStopInfo");
                        self.conn.downgrade_thread_stop_info();
                        break;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let tids: Vec<u32> = self.threads.keys().copied().collect();
        for tid in tids {
            self.reload_registers(tid)?;
        }
        Ok(())
    }

    /// Compute each thread's current breakpoint. With `qThreadStopInfo`
    /// only threads whose stop reason was a breakpoint are considered;
    /// without it every thread is matched against its PC.
    fn set_current_breakpoints(&mut self) -> Result<(), Error> {
        let tids: Vec<u32> = self.threads.keys().copied().collect();
        if self.conn.thread_stop_info_supported() {
            for tid in tids {
                let setbp = self.threads.get(&tid).map(|th| th.setbp).unwrap_or(false);
                if setbp {
                    self.set_current_breakpoint(tid)?;
                }
            }
        } else {
            for tid in tids {
                let unset = self
                    .threads
                    .get(&tid)
                    .map(|th| th.current_breakpoint.is_none())
                    .unwrap_or(false);
                if unset {
                    self.set_current_breakpoint(tid)?;
                }
            }
        }
        Ok(())
    }

    /// Resolve the goroutine currently bound to a thread through the
    /// symbol-side collaborator.
    pub(crate) fn thread_goroutine(&mut self, tid: u32) -> Result<Option<Goroutine>, Error> {
        let Some(th) = self.threads.get(&tid) else {
            return Ok(None);
        };
        let (gaddr, valid) = th.regs.gaddr();
        if !valid || gaddr == 0 {
            return Ok(None);
        }
        let mut g = self
            .bi
            .goroutine_at(gaddr, &mut ConnMemory { conn: &mut self.conn })
            .map_err(Error::BinaryInfo)?;
        if let Some(g) = &mut g {
            g.thread_id = Some(tid);
        }
        Ok(g)
    }

    fn load_process_info(&mut self, pid: u64) -> Result<(u64, String), Error> {
        let info = self.conn.query_process_info(pid)?;
        let pid = if pid == 0 {
            info.get("pid")
                .and_then(|p| u64::from_str_radix(p, 16).ok())
                .unwrap_or(0)
        } else {
            pid
        };
        Ok((pid, info.get("name").cloned().unwrap_or_default()))
    }

    fn exited_error(&self) -> Error {
        Error::ProcessExited {
            pid: self.conn.pid(),
            status: self.exit_status,
        }
    }
}

/// Inferior memory view handed to collaborators; borrows the connection for
/// the duration of one call.
pub(crate) struct ConnMemory<'a> {
    conn: &'a mut GdbConn,
}

impl MemoryAccess for ConnMemory<'_> {
    fn read_memory(&mut self, buf: &mut [u8], addr: u64) -> Result<(), Error> {
        self.conn.read_memory(buf, addr)
    }

    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<usize, Error> {
        self.conn.write_memory(addr, data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_classification_table() {
        use StopDisposition::*;
        // a breakpoint always stops
        assert_eq!(classify_stop_signal(0x05, false, false), Stop);
        assert_eq!(classify_stop_signal(0x05, true, true), Stop);
        // SIGINT stops only when we sent it ourselves
        assert_eq!(classify_stop_signal(0x02, true, false), Stop);
        assert_eq!(classify_stop_signal(0x02, false, false), Forward(0x02));
        // SIGCHLD means "stopped" on debugserver, a real signal elsewhere
        assert_eq!(classify_stop_signal(0x11, false, true), Stop);
        assert_eq!(classify_stop_signal(0x11, false, false), Forward(0x11));
        // SIGSTOP stops
        assert_eq!(classify_stop_signal(0x13, false, false), Stop);
        // encoded Mach exceptions cannot be delivered back
        for sig in 0x91..=0x96 {
            assert_eq!(classify_stop_signal(sig, false, false), Stop);
        }
        assert_eq!(classify_stop_signal(0x90, false, false), Forward(0x90));
        assert_eq!(classify_stop_signal(0x97, false, false), Forward(0x97));
        // everything else is the inferior's business
        assert_eq!(classify_stop_signal(0x0b, false, true), Forward(0x0b));
        assert_eq!(classify_stop_signal(0x0f, true, true), Forward(0x0f));
    }

    #[test]
    fn thread_updater_parses_and_dedups() {
        let mut tu = ThreadUpdater::default();
        tu.add(&["1a2", "p12.1a3", "1a2"]).unwrap();
        assert_eq!(tu.discovered.len(), 2);
        assert!(tu.seen.contains(&0x1a2));
        assert!(tu.seen.contains(&0x1a3));
        assert!(tu.add(&["zz"]).is_err());
    }
}
