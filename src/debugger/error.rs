use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    // --------------------------------- transport errors ------------------------------------------
    #[error(transparent)]
    IO(#[from] std::io::Error),
    #[error("connection to the stub is closed")]
    ConnectionClosed,
    #[error("checksum mismatch persisted after {0} transmit attempts")]
    Transmit(usize),

    // --------------------------------- protocol errors -------------------------------------------
    #[error("packet not supported by the stub")]
    Unsupported,
    #[error("stub replied error {code:#04x} to packet {packet:?}")]
    Protocol { code: u8, packet: String },
    #[error("malformed stub reply {0:?}")]
    MalformedReply(String),
    #[error("malformed thread id {0:?}")]
    MalformedThreadID(String),
    #[error("stub cannot be used: {0}")]
    UnsupportedStub(&'static str),

    // --------------------------------- inferior memory errors ------------------------------------
    #[error("memory access failed at {addr:#x} ({len} bytes)")]
    MemoryAccess { addr: u64, len: usize },

    // --------------------------------- process state errors --------------------------------------
    #[error("process {pid} has exited with status {status}")]
    ProcessExited { pid: u64, status: u8 },
    #[error("thread {0:?} not found")]
    ThreadNotFound(String),
    #[error("goroutine {0} not found")]
    GoroutineNotFound(i64),
    #[error("cannot single step: no selected goroutine")]
    NoSelectedGoroutine,

    // --------------------------------- breakpoint table errors -----------------------------------
    #[error("breakpoint already exists at {addr:#x} ({file}:{line})")]
    BreakpointExists { addr: u64, file: String, line: u64 },
    #[error("no breakpoint at {0:#x}")]
    NoBreakpoint(u64),
    #[error("invalid address {0:#x}")]
    InvalidAddress(u64),

    // --------------------------------- register errors -------------------------------------------
    #[error("unknown register {0:?}")]
    UnknownRegister(String),

    // --------------------------------- goroutine loader errors -----------------------------------
    #[error("no known load instruction for G offset {0:#x}")]
    GOffsetNotSupported(u64),

    // --------------------------------- launch errors ---------------------------------------------
    #[error("{0} is not an executable file")]
    NotExecutable(PathBuf),
    #[error("could not determine executable path: {0}")]
    ExecutablePathUnknown(#[source] Box<Error>),

    // --------------------------------- collaborator errors ---------------------------------------
    #[error("binary info: {0}")]
    BinaryInfo(#[source] anyhow::Error),
}

impl Error {
    /// True for the empty-reply "feature probe failed" error, the only error
    /// callers are allowed to recover from by downgrading a capability.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Error::Unsupported)
    }

    pub fn is_exited(&self) -> bool {
        matches!(self, Error::ProcessExited { .. })
    }
}

#[macro_export]
macro_rules! _error {
    ($log_fn: path, $res: expr) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", "{:#}", e);
                None
            }
        }
    };
    ($log_fn: path, $res: expr, $msg: tt) => {
        match $res {
            Ok(value) => Some(value),
            Err(e) => {
                $log_fn!(target: "debugger", concat!($msg, " {:#}"), e);
                None
            }
        }
    };
}

/// Transforms `Result` into `Option` and logs an error if it occurs.
#[macro_export]
macro_rules! weak_error {
    ($res: expr) => {
        $crate::_error!(log::warn, $res)
    };
    ($res: expr, $msg: tt) => {
        $crate::_error!(log::warn, $res, $msg)
    };
}
