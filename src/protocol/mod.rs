//! Client side of the Gdb Remote Serial Protocol, as spoken by lldb-server
//! and debugserver. One request is in flight at a time; the engine above
//! owns the ordering between a resume request and its stop reply.

pub mod stop;
pub(crate) mod wire;

use crate::debugger::error::Error;
use log::debug;
use std::cell::Cell;
use std::cmp::min;
use std::collections::HashMap;
use std::io::Write;
use std::net::TcpStream;
use std::sync::Arc;
use stop::{parse_stop_packet, StopPacket, StopReply};
use wire::{hex_decode, hex_encode, WireConn};

const DEFAULT_PACKET_SIZE: usize = 256;

/// One entry of the stub's register layout, learned from `qRegisterInfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterInfo {
    pub name: String,
    pub regnum: usize,
    pub offset: usize,
    pub bitsize: usize,
}

/// Receiver for a thread list inlined into a stop reply. When the stub
/// provides one, the engine can skip the explicit `qfThreadInfo` sweep.
pub trait ThreadSink {
    fn add(&mut self, ids: &[&str]) -> Result<(), Error>;
    fn set_done(&mut self);
}

/// Typed request/response channel to the stub. Owns the session flags
/// learned at handshake.
pub struct GdbConn {
    wire: WireConn,
    packet_size: usize,
    pid: u64,
    regs_info: Arc<[RegisterInfo]>,
    /// Stub supports bulk `g`/`G` register transfer. Downgraded at most
    /// once, on the first empty reply; never raised back.
    gcmd_ok: Cell<bool>,
    /// Stub supports `qThreadStopInfo`. Downgrade-only, like `gcmd_ok`.
    thread_stop_info: Cell<bool>,
    is_debugserver: bool,
    running: Cell<bool>,
    ops_thread: Option<String>,
}

impl GdbConn {
    pub fn new(stream: TcpStream) -> Self {
        GdbConn {
            wire: WireConn::new(stream),
            packet_size: DEFAULT_PACKET_SIZE,
            pid: 0,
            regs_info: Arc::from(Vec::<RegisterInfo>::new()),
            gcmd_ok: Cell::new(true),
            thread_stop_info: Cell::new(true),
            is_debugserver: false,
            running: Cell::new(false),
            ops_thread: None,
        }
    }

    /// Negotiate the session: drop acknowledgements, learn the packet size,
    /// require `vCont` and walk the register layout.
    pub fn handshake(&mut self) -> Result<(), Error> {
        match self.exec(b"QStartNoAckMode") {
            Ok(reply) if reply == b"OK" => self.wire.set_ack_mode(false),
            Ok(_) => {}
            Err(e) if e.is_unsupported() => {}
            Err(e) => return Err(e),
        }

        match self.exec(b"qSupported") {
            Ok(reply) => {
                let text = String::from_utf8_lossy(&reply);
                for feature in text.split(';') {
                    if let Some(size) = feature.strip_prefix("PacketSize=") {
                        if let Ok(size) = usize::from_str_radix(size, 16) {
                            self.packet_size = size;
                        }
                    }
                }
            }
            Err(e) if e.is_unsupported() => {}
            Err(e) => return Err(e),
        }
        debug!(target: "gdbwire", "negotiated packet size {}", self.packet_size);

        match self.exec(b"vCont?") {
            Ok(reply) if reply.starts_with(b"vCont") => {}
            Ok(_) | Err(Error::Unsupported) => {
                return Err(Error::UnsupportedStub("vCont is not supported"))
            }
            Err(e) => return Err(e),
        }

        let mut regs = Vec::new();
        loop {
            let cmd = format!("qRegisterInfo{:x}", regs.len());
            match self.exec(cmd.as_bytes()) {
                Ok(reply) => regs.push(parse_register_info(regs.len(), &reply)?),
                // the stub signals the end of the list with an error reply
                Err(Error::Protocol { .. }) => break,
                Err(e) if e.is_unsupported() => break,
                Err(e) => return Err(e),
            }
        }
        if regs.is_empty() {
            return Err(Error::UnsupportedStub("qRegisterInfo is not supported"));
        }
        debug!(target: "gdbwire", "stub declares {} registers", regs.len());
        self.regs_info = regs.into();
        Ok(())
    }

    pub fn regs_info(&self) -> Arc<[RegisterInfo]> {
        Arc::clone(&self.regs_info)
    }

    pub fn pid(&self) -> u64 {
        self.pid
    }

    pub(crate) fn set_pid(&mut self, pid: u64) {
        self.pid = pid;
    }

    pub fn gcmd_ok(&self) -> bool {
        self.gcmd_ok.get()
    }

    /// Record that the stub does not implement `g`/`G`. This transition is
    /// one-way for the lifetime of the session.
    pub(crate) fn downgrade_gcmd(&self) {
        self.gcmd_ok.set(false);
    }

    pub fn thread_stop_info_supported(&self) -> bool {
        self.thread_stop_info.get()
    }

    pub(crate) fn downgrade_thread_stop_info(&self) {
        self.thread_stop_info.set(false);
    }

    pub fn is_debugserver(&self) -> bool {
        self.is_debugserver
    }

    pub(crate) fn set_debugserver(&mut self, v: bool) {
        self.is_debugserver = v;
    }

    pub fn running(&self) -> bool {
        self.running.get()
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    pub fn set_console_sink(&mut self, sink: Box<dyn Write + Send>) {
        self.wire.set_console_sink(sink);
    }

    pub(crate) fn try_clone_stream(&self) -> std::io::Result<TcpStream> {
        self.wire.try_clone_stream()
    }

    /// `qProcessInfo` / `qProcessInfoPID`. The `name` value arrives
    /// hex-encoded and is decoded here.
    pub fn query_process_info(&mut self, pid: u64) -> Result<HashMap<String, String>, Error> {
        let cmd = if pid != 0 {
            format!("qProcessInfoPID:{pid}")
        } else {
            "qProcessInfo".to_string()
        };
        let reply = self.exec(cmd.as_bytes())?;
        let text = String::from_utf8_lossy(&reply).into_owned();
        let mut info = HashMap::new();
        for field in text.split(';').filter(|f| !f.is_empty()) {
            let Some((key, value)) = field.split_once(':') else {
                continue;
            };
            let value = if key == "name" {
                String::from_utf8(hex_decode(value.as_bytes())?)
                    .map_err(|_| Error::MalformedReply(text.clone()))?
            } else {
                value.to_string()
            };
            info.insert(key.to_string(), value);
        }
        Ok(info)
    }

    /// `qXfer:exec-file:read`: the path of the inferior's executable.
    pub fn read_exec_file(&mut self) -> Result<String, Error> {
        let mut path = Vec::new();
        loop {
            let cmd = format!(
                "qXfer:exec-file:read::{:x},{:x}",
                path.len(),
                self.packet_size
            );
            let reply = self.exec(cmd.as_bytes())?;
            match reply.first() {
                Some(b'l') => {
                    path.extend_from_slice(&reply[1..]);
                    break;
                }
                Some(b'm') => path.extend_from_slice(&reply[1..]),
                _ => {
                    return Err(Error::MalformedReply(
                        String::from_utf8_lossy(&reply).into_owned(),
                    ))
                }
            }
        }
        String::from_utf8(path).map_err(|e| Error::MalformedReply(e.to_string()))
    }

    /// One page of the paginated thread list. An empty vector marks the end.
    pub fn query_threads(&mut self, first: bool) -> Result<Vec<String>, Error> {
        let cmd: &[u8] = if first { b"qfThreadInfo" } else { b"qsThreadInfo" };
        let reply = self.exec(cmd)?;
        match reply.first() {
            Some(b'm') => {
                let text = String::from_utf8_lossy(&reply[1..]).into_owned();
                Ok(text
                    .split(',')
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect())
            }
            Some(b'l') => Ok(Vec::new()),
            _ => Err(Error::MalformedReply(
                String::from_utf8_lossy(&reply).into_owned(),
            )),
        }
    }

    /// `qThreadStopInfo`: why a given thread stopped. Returns the signal and
    /// the stub's textual reason (possibly empty).
    pub fn thread_stop_info(&mut self, tid: &str) -> Result<(u8, String), Error> {
        let reply = self.exec(format!("qThreadStopInfo{tid}").as_bytes())?;
        match parse_stop_packet(&reply)? {
            StopPacket::Stopped(stop) => Ok((stop.signal, stop.reason)),
            StopPacket::Exited { status, pid } => Err(Error::ProcessExited {
                pid: pid.unwrap_or(self.pid),
                status,
            }),
        }
    }

    /// `?`: the reason for the current (implicit) stop.
    pub fn query_halt_reason(&mut self) -> Result<StopReply, Error> {
        let reply = self.exec(b"?")?;
        match parse_stop_packet(&reply)? {
            StopPacket::Stopped(stop) => Ok(stop),
            StopPacket::Exited { status, pid } => Err(Error::ProcessExited {
                pid: pid.unwrap_or(self.pid),
                status,
            }),
        }
    }

    /// Bulk register read (`g`) into a caller-provided buffer covering the
    /// whole declared layout.
    pub fn read_registers(&mut self, tid: &str, buf: &mut [u8]) -> Result<(), Error> {
        self.select_thread(tid)?;
        let reply = self.exec(b"g")?;
        let data = hex_decode(&reply)?;
        if data.len() != buf.len() {
            return Err(Error::MalformedReply(format!(
                "g returned {} bytes, layout spans {}",
                data.len(),
                buf.len()
            )));
        }
        buf.copy_from_slice(&data);
        Ok(())
    }

    pub fn write_registers(&mut self, tid: &str, buf: &[u8]) -> Result<(), Error> {
        self.select_thread(tid)?;
        self.exec_ok(format!("G{}", hex_encode(buf)).as_bytes())
    }

    /// Single register read (`p`) into the register's slot buffer.
    pub fn read_register(&mut self, tid: &str, regnum: usize, buf: &mut [u8]) -> Result<(), Error> {
        self.select_thread(tid)?;
        let reply = self.exec(format!("p{regnum:x}").as_bytes())?;
        let data = hex_decode(&reply)?;
        if data.len() != buf.len() {
            return Err(Error::MalformedReply(format!(
                "p {regnum:x} returned {} bytes, register holds {}",
                data.len(),
                buf.len()
            )));
        }
        buf.copy_from_slice(&data);
        Ok(())
    }

    pub fn write_register(&mut self, tid: &str, regnum: usize, buf: &[u8]) -> Result<(), Error> {
        self.select_thread(tid)?;
        self.exec_ok(format!("P{regnum:x}={}", hex_encode(buf)).as_bytes())
    }

    /// `m`: read inferior memory, split into chunks that keep each reply
    /// under the negotiated packet size.
    pub fn read_memory(&mut self, buf: &mut [u8], addr: u64) -> Result<(), Error> {
        let chunk = self.memory_chunk_len();
        let mut done = 0;
        while done < buf.len() {
            let want = min(chunk, buf.len() - done);
            let at = addr + done as u64;
            let cmd = format!("m{at:x},{want:x}");
            let reply = self
                .exec(cmd.as_bytes())
                .map_err(|e| memory_error(e, at, want))?;
            let data = hex_decode(&reply)?;
            if data.is_empty() || data.len() > want {
                return Err(Error::MemoryAccess {
                    addr: at,
                    len: want,
                });
            }
            buf[done..done + data.len()].copy_from_slice(&data);
            done += data.len();
        }
        Ok(())
    }

    /// `M`: write inferior memory, chunked like [`GdbConn::read_memory`].
    pub fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<usize, Error> {
        let chunk = self.memory_chunk_len();
        let mut written = 0;
        while written < data.len() {
            let len = min(chunk, data.len() - written);
            let at = addr + written as u64;
            let cmd = format!("M{at:x},{len:x}:{}", hex_encode(&data[written..written + len]));
            self.exec_ok(cmd.as_bytes())
                .map_err(|e| memory_error(e, at, len))?;
            written += len;
        }
        Ok(written)
    }

    /// `_M`: ask the stub to allocate memory in the inferior.
    pub fn alloc_memory(&mut self, size: u64) -> Result<u64, Error> {
        let reply = self.exec(format!("_M{size:x},rwx").as_bytes())?;
        let text = String::from_utf8_lossy(&reply).into_owned();
        u64::from_str_radix(&text, 16).map_err(|_| Error::MalformedReply(text))
    }

    /// `Z0`: install a software breakpoint.
    pub fn set_breakpoint(&mut self, addr: u64) -> Result<(), Error> {
        self.exec_ok(format!("Z0,{addr:x},1").as_bytes())
    }

    /// `z0`: remove a software breakpoint.
    pub fn clear_breakpoint(&mut self, addr: u64) -> Result<(), Error> {
        self.exec_ok(format!("z0,{addr:x},1").as_bytes())
    }

    /// `vCont;c`: resume the inferior, optionally forwarding a signal, and
    /// block until the stop reply. An inlined thread list is pushed into
    /// `tu` and marked done.
    pub fn resume(&mut self, sig: u8, tu: &mut dyn ThreadSink) -> Result<StopReply, Error> {
        self.ops_thread = None;
        // notifications queued while processing the previous stop belong to
        // non-stop mode, which the supported stubs do not run in
        for stale in self.wire.take_notifications() {
            debug!(
                target: "gdbwire",
                "dropping stale notification: {}",
                String::from_utf8_lossy(&stale)
            );
        }
        let cmd = if sig == 0 {
            "vCont;c".to_string()
        } else {
            format!("vCont;C{sig:02x}")
        };
        self.running.set(true);
        let res = self.exec_stop(cmd.as_bytes(), Some(tu));
        self.running.set(false);
        res
    }

    /// `vCont;s`: single-step one thread.
    pub fn step(&mut self, tid: &str, tu: Option<&mut dyn ThreadSink>) -> Result<StopReply, Error> {
        self.ops_thread = None;
        let cmd = format!("vCont;s:{tid}");
        self.running.set(true);
        let res = self.exec_stop(cmd.as_bytes(), tu);
        self.running.set(false);
        res
    }

    pub fn send_ctrl_c(&mut self) -> Result<(), Error> {
        self.wire.write_ctrl_c()
    }

    /// `k`: kill the inferior. A `W`/`X` reply is reported as
    /// [`Error::ProcessExited`]; the engine treats that as success.
    pub fn kill(&mut self) -> Result<(), Error> {
        self.wire.send(b"k")?;
        let reply = self.read_reply(b"k")?;
        match parse_stop_packet(&reply) {
            Ok(StopPacket::Exited { status, pid }) => Err(Error::ProcessExited {
                pid: pid.unwrap_or(self.pid),
                status,
            }),
            _ => Ok(()),
        }
    }

    /// `D`: detach from the inferior.
    pub fn detach(&mut self) -> Result<(), Error> {
        self.exec_ok(b"D")
    }

    fn exec_stop(
        &mut self,
        cmd: &[u8],
        tu: Option<&mut dyn ThreadSink>,
    ) -> Result<StopReply, Error> {
        let reply = self.exec(cmd)?;
        match parse_stop_packet(&reply)? {
            StopPacket::Stopped(stop) => {
                if let (Some(sink), Some(threads)) = (tu, &stop.threads) {
                    let ids: Vec<&str> = threads.iter().map(String::as_str).collect();
                    sink.add(&ids)?;
                    sink.set_done();
                }
                Ok(stop)
            }
            StopPacket::Exited { status, pid } => Err(Error::ProcessExited {
                pid: pid.unwrap_or(self.pid),
                status,
            }),
        }
    }

    fn select_thread(&mut self, tid: &str) -> Result<(), Error> {
        if self.ops_thread.as_deref() == Some(tid) {
            return Ok(());
        }
        self.exec_ok(format!("Hg{tid}").as_bytes())?;
        self.ops_thread = Some(tid.to_string());
        Ok(())
    }

    fn memory_chunk_len(&self) -> usize {
        // hex doubles the data and the command header needs headroom
        ((self.packet_size.saturating_sub(64)) / 2).max(1)
    }

    fn exec(&mut self, payload: &[u8]) -> Result<Vec<u8>, Error> {
        self.wire.send(payload)?;
        self.read_reply(payload)
    }

    fn exec_ok(&mut self, payload: &[u8]) -> Result<(), Error> {
        let reply = self.exec(payload)?;
        if reply != b"OK" {
            return Err(Error::MalformedReply(
                String::from_utf8_lossy(&reply).into_owned(),
            ));
        }
        Ok(())
    }

    fn read_reply(&mut self, cmd: &[u8]) -> Result<Vec<u8>, Error> {
        let reply = self.wire.recv()?;
        if reply.is_empty() {
            return Err(Error::Unsupported);
        }
        if reply.len() == 3 && reply[0] == b'E' && reply[1..].iter().all(u8::is_ascii_hexdigit) {
            let code = u8::from_str_radix(std::str::from_utf8(&reply[1..]).unwrap(), 16).unwrap();
            return Err(Error::Protocol {
                code,
                packet: String::from_utf8_lossy(cmd).into_owned(),
            });
        }
        Ok(reply)
    }
}

fn memory_error(e: Error, addr: u64, len: usize) -> Error {
    match e {
        Error::Protocol { .. } | Error::Unsupported => Error::MemoryAccess { addr, len },
        other => other,
    }
}

fn parse_register_info(regnum: usize, payload: &[u8]) -> Result<RegisterInfo, Error> {
    let text = std::str::from_utf8(payload)
        .map_err(|_| Error::MalformedReply(String::from_utf8_lossy(payload).into_owned()))?;
    let mut name = None;
    let mut bitsize = None;
    let mut offset = None;
    for field in text.split(';') {
        let Some((key, value)) = field.split_once(':') else {
            continue;
        };
        match key {
            "name" => name = Some(value.to_string()),
            "bitsize" => bitsize = value.parse::<usize>().ok(),
            "offset" => offset = value.parse::<usize>().ok(),
            _ => {}
        }
    }
    match (name, bitsize, offset) {
        (Some(name), Some(bitsize), Some(offset)) => Ok(RegisterInfo {
            name,
            regnum,
            offset,
            bitsize,
        }),
        _ => Err(Error::MalformedReply(text.to_string())),
    }
}
