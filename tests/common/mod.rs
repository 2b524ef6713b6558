//! A scripted in-process stub: accepts one connection, answers the
//! handshake and bookkeeping packets from a canned register file and a tiny
//! memory/register store, and replies to resume packets from a per-test
//! script. Everything it sees and does is recorded for assertions.

use gostalker::debugger::{BinaryInfo, Goroutine, MemoryAccess, Place, TargetOs};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;

/// Register layout the stub declares via `qRegisterInfo`: 16 general
/// purpose registers, rip at offset 128, control/segment registers and nine
/// xmm banks for a 320-byte `g` payload.
pub const LAYOUT: &[(&str, usize)] = &[
    ("rax", 64),
    ("rbx", 64),
    ("rcx", 64),
    ("rdx", 64),
    ("rsi", 64),
    ("rdi", 64),
    ("rbp", 64),
    ("rsp", 64),
    ("r8", 64),
    ("r9", 64),
    ("r10", 64),
    ("r11", 64),
    ("r12", 64),
    ("r13", 64),
    ("r14", 64),
    ("r15", 64),
    ("rip", 64),
    ("rflags", 64),
    ("cs", 64),
    ("ss", 64),
    ("fs_base", 64),
    ("gs_base", 64),
    ("xmm0", 128),
    ("xmm1", 128),
    ("xmm2", 128),
    ("xmm3", 128),
    ("xmm4", 128),
    ("xmm5", 128),
    ("xmm6", 128),
    ("xmm7", 128),
    ("xmm8", 128),
];

pub const INITIAL_PC: u64 = 0x401000;
pub const DEFAULT_MEMORY_BYTE: u8 = 0x90;

fn layout_size() -> usize {
    LAYOUT.iter().map(|(_, bits)| bits / 8).sum()
}

fn slot_of(name: &str) -> (usize, usize) {
    let mut offset = 0;
    for (reg, bits) in LAYOUT {
        if *reg == name {
            return (offset, bits / 8);
        }
        offset += bits / 8;
    }
    panic!("register {name} not in stub layout");
}

#[derive(Clone)]
pub enum Reply {
    Packet(String),
    /// Wait for the out-of-band interrupt byte, then send.
    AfterInterrupt(String),
}

pub struct StubConfig {
    pub threads: Vec<String>,
    /// Value deposited in rcx whenever the stub is asked to single-step,
    /// standing in for the executed G-load instruction.
    pub gaddr_on_step: Option<u64>,
    script: Vec<(String, VecDeque<Reply>)>,
}

impl Default for StubConfig {
    fn default() -> Self {
        StubConfig {
            threads: vec!["1a2".to_string()],
            gaddr_on_step: None,
            script: Vec::new(),
        }
    }
}

impl StubConfig {
    pub fn with_threads(mut self, threads: &[&str]) -> Self {
        self.threads = threads.iter().map(|t| t.to_string()).collect();
        self
    }

    pub fn with_gaddr_on_step(mut self, gaddr: u64) -> Self {
        self.gaddr_on_step = Some(gaddr);
        self
    }

    pub fn on(mut self, prefix: &str, replies: &[&str]) -> Self {
        self.script.push((
            prefix.to_string(),
            replies.iter().map(|r| Reply::Packet(r.to_string())).collect(),
        ));
        self
    }

    pub fn on_reply(mut self, prefix: &str, reply: Reply) -> Self {
        self.script.push((prefix.to_string(), VecDeque::from([reply])));
        self
    }
}

#[derive(Default)]
pub struct StubState {
    pub regs: Vec<u8>,
    pub mem: HashMap<u64, u8>,
    pub breakpoints: HashSet<u64>,
    pub transcript: Vec<String>,
    /// Signal and reason of the most recent scripted stop, echoed back by
    /// the default `qThreadStopInfo` handler.
    pub last_stop: (u8, String),
}

pub struct StubHandle {
    pub addr: String,
    state: Arc<Mutex<StubState>>,
}

impl StubHandle {
    pub fn transcript(&self) -> Vec<String> {
        self.state.lock().unwrap().transcript.clone()
    }

    pub fn transcript_len(&self) -> usize {
        self.state.lock().unwrap().transcript.len()
    }

    pub fn breakpoints(&self) -> HashSet<u64> {
        self.state.lock().unwrap().breakpoints.clone()
    }

    pub fn memory_byte(&self, addr: u64) -> u8 {
        self.state
            .lock()
            .unwrap()
            .mem
            .get(&addr)
            .copied()
            .unwrap_or(DEFAULT_MEMORY_BYTE)
    }

    pub fn register(&self, name: &str) -> u64 {
        let (offset, len) = slot_of(name);
        let state = self.state.lock().unwrap();
        let mut le = [0u8; 8];
        le[..len.min(8)].copy_from_slice(&state.regs[offset..offset + len.min(8)]);
        u64::from_le_bytes(le)
    }

    /// Index of the first transcript entry equal to `payload` at or after
    /// `from`.
    pub fn find_packet(&self, payload: &str, from: usize) -> Option<usize> {
        self.state.lock().unwrap().transcript[from..]
            .iter()
            .position(|p| p == payload)
            .map(|i| i + from)
    }

    pub fn count_packets(&self, payload: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .transcript
            .iter()
            .filter(|p| *p == payload)
            .count()
    }
}

pub fn start_stub(config: StubConfig) -> StubHandle {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let mut regs = vec![0u8; layout_size()];
    let (pc_off, _) = slot_of("rip");
    regs[pc_off..pc_off + 8].copy_from_slice(&INITIAL_PC.to_le_bytes());
    let (sp_off, _) = slot_of("rsp");
    regs[sp_off..sp_off + 8].copy_from_slice(&0x7ffffff000u64.to_le_bytes());

    let state = Arc::new(Mutex::new(StubState {
        regs,
        last_stop: (0x13, String::new()),
        ..Default::default()
    }));
    let thread_state = Arc::clone(&state);
    thread::spawn(move || {
        if let Ok((sock, _)) = listener.accept() {
            serve(sock, config, thread_state);
        }
    });
    StubHandle { addr, state }
}

enum Event {
    Frame(String),
    Interrupt,
    Eof,
}

struct FrameReader {
    sock: TcpStream,
    buf: VecDeque<u8>,
}

impl FrameReader {
    fn next_byte(&mut self) -> Option<u8> {
        while self.buf.is_empty() {
            let mut chunk = [0u8; 1024];
            match self.sock.read(&mut chunk) {
                Ok(0) | Err(_) => return None,
                Ok(n) => self.buf.extend(&chunk[..n]),
            }
        }
        self.buf.pop_front()
    }

    fn next_event(&mut self) -> Event {
        loop {
            let Some(b) = self.next_byte() else {
                return Event::Eof;
            };
            match b {
                0x03 => return Event::Interrupt,
                b'$' => {
                    let mut payload = Vec::new();
                    loop {
                        let Some(c) = self.next_byte() else {
                            return Event::Eof;
                        };
                        if c == b'#' {
                            break;
                        }
                        payload.push(c);
                    }
                    // consume the checksum digits
                    for _ in 0..2 {
                        if self.next_byte().is_none() {
                            return Event::Eof;
                        }
                    }
                    return Event::Frame(String::from_utf8_lossy(&payload).into_owned());
                }
                _ => {}
            }
        }
    }
}

fn serve(sock: TcpStream, mut config: StubConfig, state: Arc<Mutex<StubState>>) {
    let mut reader = FrameReader {
        sock: sock.try_clone().unwrap(),
        buf: VecDeque::new(),
    };
    let mut sock = sock;
    let mut ack_mode = true;
    loop {
        let payload = match reader.next_event() {
            Event::Frame(p) => p,
            Event::Interrupt => {
                state.lock().unwrap().transcript.push("^C".to_string());
                continue;
            }
            Event::Eof => return,
        };
        state.lock().unwrap().transcript.push(payload.clone());
        if ack_mode {
            let _ = sock.write_all(b"+");
        }

        let reply = scripted_reply(&mut config, &payload)
            .unwrap_or_else(|| Reply::Packet(default_reply(&config, &state, &payload)));
        let text = match reply {
            Reply::Packet(text) => text,
            Reply::AfterInterrupt(text) => {
                loop {
                    match reader.next_event() {
                        Event::Interrupt => break,
                        Event::Eof => return,
                        Event::Frame(p) => {
                            state.lock().unwrap().transcript.push(p);
                        }
                    }
                }
                state.lock().unwrap().transcript.push("^C".to_string());
                text
            }
        };

        if text.starts_with('T') && payload.starts_with("vCont") {
            remember_stop(&state, &text);
        }
        send_packet(&mut sock, &text);
        if payload == "QStartNoAckMode" {
            ack_mode = false;
        }
    }
}

fn remember_stop(state: &Arc<Mutex<StubState>>, reply: &str) {
    let Some(sig) = reply.get(1..3).and_then(|s| u8::from_str_radix(s, 16).ok()) else {
        return;
    };
    let reason = reply
        .split(';')
        .find_map(|f| f.strip_prefix("reason:"))
        .unwrap_or("")
        .to_string();
    state.lock().unwrap().last_stop = (sig, reason);
}

fn scripted_reply(config: &mut StubConfig, payload: &str) -> Option<Reply> {
    for (prefix, queue) in &mut config.script {
        if payload.starts_with(prefix.as_str()) && !queue.is_empty() {
            return queue.pop_front();
        }
    }
    None
}

fn default_reply(config: &StubConfig, state: &Arc<Mutex<StubState>>, payload: &str) -> String {
    let first_thread = config.threads[0].clone();
    if payload == "QStartNoAckMode" || payload == "D" {
        return "OK".to_string();
    }
    if payload.starts_with("qSupported") {
        return "PacketSize=4000;QStartNoAckMode+".to_string();
    }
    if payload == "vCont?" {
        return "vCont;c;C;s;S".to_string();
    }
    if let Some(index) = payload.strip_prefix("qRegisterInfo") {
        let Some(n) = usize::from_str_radix(index, 16).ok().filter(|n| *n < LAYOUT.len()) else {
            return "E45".to_string();
        };
        let (name, bits) = LAYOUT[n];
        let (offset, _) = slot_of(name);
        return format!("name:{name};bitsize:{bits};offset:{offset};encoding:uint;format:hex;");
    }
    if payload.starts_with("qXfer:exec-file:read") {
        return "l/bin/inferior".to_string();
    }
    if payload.starts_with("qProcessInfo") {
        return format!("pid:4d2;name:{};", hex_encode(b"/bin/inferior"));
    }
    if payload == "qfThreadInfo" {
        return format!("m{}", config.threads.join(","));
    }
    if payload == "qsThreadInfo" {
        return "l".to_string();
    }
    if let Some(tid) = payload.strip_prefix("qThreadStopInfo") {
        let (sig, reason) = state.lock().unwrap().last_stop.clone();
        if reason.is_empty() {
            return format!("T{sig:02x}thread:{tid};");
        }
        return format!("T{sig:02x}thread:{tid};reason:{reason};");
    }
    if payload == "?" {
        return format!("T13thread:{first_thread};");
    }
    if payload.starts_with("Hg") {
        return "OK".to_string();
    }
    if payload == "g" {
        return hex_encode(&state.lock().unwrap().regs);
    }
    if let Some(data) = payload.strip_prefix('G') {
        let bytes = hex_decode(data);
        let mut state = state.lock().unwrap();
        let n = bytes.len().min(state.regs.len());
        state.regs[..n].copy_from_slice(&bytes[..n]);
        return "OK".to_string();
    }
    if let Some(assign) = payload.strip_prefix('P') {
        let Some((n, data)) = assign.split_once('=') else {
            return "E01".to_string();
        };
        let Some(n) = usize::from_str_radix(n, 16).ok().filter(|n| *n < LAYOUT.len()) else {
            return "E01".to_string();
        };
        let (offset, len) = slot_of(LAYOUT[n].0);
        let bytes = hex_decode(data);
        if bytes.len() != len {
            return "E01".to_string();
        }
        state.lock().unwrap().regs[offset..offset + len].copy_from_slice(&bytes);
        return "OK".to_string();
    }
    if let Some(n) = payload.strip_prefix('p') {
        let Some(n) = usize::from_str_radix(n, 16).ok().filter(|n| *n < LAYOUT.len()) else {
            return "E01".to_string();
        };
        let (offset, len) = slot_of(LAYOUT[n].0);
        return hex_encode(&state.lock().unwrap().regs[offset..offset + len]);
    }
    if let Some(args) = payload.strip_prefix('m') {
        let Some((addr, len)) = parse_addr_len(args) else {
            return "E01".to_string();
        };
        let state = state.lock().unwrap();
        let bytes: Vec<u8> = (0..len)
            .map(|i| {
                state
                    .mem
                    .get(&(addr + i as u64))
                    .copied()
                    .unwrap_or(DEFAULT_MEMORY_BYTE)
            })
            .collect();
        return hex_encode(&bytes);
    }
    if let Some(args) = payload.strip_prefix('M') {
        let Some((head, data)) = args.split_once(':') else {
            return "E01".to_string();
        };
        let Some((addr, len)) = parse_addr_len(head) else {
            return "E01".to_string();
        };
        let bytes = hex_decode(data);
        if bytes.len() != len {
            return "E01".to_string();
        }
        let mut state = state.lock().unwrap();
        for (i, b) in bytes.iter().enumerate() {
            state.mem.insert(addr + i as u64, *b);
        }
        return "OK".to_string();
    }
    if payload.starts_with("_M") {
        return String::new();
    }
    if let Some(args) = payload.strip_prefix("Z0,") {
        if let Some(addr) = args
            .split(',')
            .next()
            .and_then(|a| u64::from_str_radix(a, 16).ok())
        {
            state.lock().unwrap().breakpoints.insert(addr);
        }
        return "OK".to_string();
    }
    if let Some(args) = payload.strip_prefix("z0,") {
        if let Some(addr) = args
            .split(',')
            .next()
            .and_then(|a| u64::from_str_radix(a, 16).ok())
        {
            state.lock().unwrap().breakpoints.remove(&addr);
        }
        return "OK".to_string();
    }
    if let Some(tid) = payload.strip_prefix("vCont;s:") {
        if let Some(gaddr) = config.gaddr_on_step {
            let (offset, len) = slot_of("rcx");
            state.lock().unwrap().regs[offset..offset + len]
                .copy_from_slice(&gaddr.to_le_bytes());
        }
        return format!("T05thread:{tid};");
    }
    if payload.starts_with("vCont;c") || payload.starts_with("vCont;C") {
        // resumes must be scripted; exiting is the safest fallback
        return "W00".to_string();
    }
    if payload == "k" {
        return "X09".to_string();
    }
    String::new()
}

fn parse_addr_len(args: &str) -> Option<(u64, usize)> {
    let (addr, len) = args.split_once(',')?;
    Some((
        u64::from_str_radix(addr, 16).ok()?,
        usize::from_str_radix(len, 16).ok()?,
    ))
}

fn send_packet(sock: &mut TcpStream, payload: &str) {
    let checksum = payload
        .as_bytes()
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b));
    let _ = sock.write_all(format!("${payload}#{checksum:02x}").as_bytes());
}

fn hex_encode(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(data: &str) -> Vec<u8> {
    data.as_bytes()
        .chunks_exact(2)
        .map(|pair| {
            u8::from_str_radix(std::str::from_utf8(pair).unwrap(), 16).unwrap_or(0)
        })
        .collect()
}

/// Symbol collaborator for tests. With `parked` set, every PC resolves to a
/// runtime wait function, which keeps the engine from injecting the G-load
/// instruction and keeps transcripts small.
#[derive(Default)]
pub struct TestBinaryInfo {
    pub parked: bool,
    pub places: HashMap<u64, Place>,
    pub functions: HashMap<String, u64>,
    pub goroutines: HashMap<u64, Goroutine>,
    pub g_offset: u64,
}

impl TestBinaryInfo {
    pub fn parked() -> Self {
        TestBinaryInfo {
            parked: true,
            g_offset: 0xfffffffffffffff8,
            ..Default::default()
        }
    }

    pub fn running() -> Self {
        TestBinaryInfo {
            parked: false,
            g_offset: 0xfffffffffffffff8,
            ..Default::default()
        }
    }

    pub fn with_place(mut self, addr: u64, function: &str, line: u64) -> Self {
        self.places.insert(
            addr,
            Place {
                file: "main.go".to_string(),
                line,
                function: function.to_string(),
            },
        );
        self
    }

    pub fn with_function(mut self, name: &str, addr: u64) -> Self {
        self.functions.insert(name.to_string(), addr);
        self
    }

    pub fn with_goroutine(mut self, gaddr: u64, id: i64, pc: u64) -> Self {
        self.goroutines.insert(
            gaddr,
            Goroutine {
                id,
                pc,
                thread_id: None,
            },
        );
        self
    }
}

impl BinaryInfo for TestBinaryInfo {
    fn target_os(&self) -> TargetOs {
        TargetOs::Linux
    }

    fn pc_to_place(&self, pc: u64) -> Option<Place> {
        self.places.get(&pc).cloned()
    }

    fn function_at(&self, pc: u64) -> Option<String> {
        if self.parked {
            return Some("runtime.futex".to_string());
        }
        self.places.get(&pc).map(|p| p.function.clone())
    }

    fn function_address(&self, name: &str) -> Option<u64> {
        self.functions.get(name).copied()
    }

    fn g_struct_offset(&self) -> u64 {
        self.g_offset
    }

    fn goroutine_at(
        &self,
        gaddr: u64,
        _mem: &mut dyn MemoryAccess,
    ) -> anyhow::Result<Option<Goroutine>> {
        Ok(self.goroutines.get(&gaddr).cloned())
    }
}
