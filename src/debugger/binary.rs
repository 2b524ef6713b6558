use crate::debugger::error::Error;

/// Operating system the stub runs the inferior on. Only the two systems with
/// lldb-style stubs are representable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOs {
    Linux,
    Darwin,
}

/// Source position of an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Place {
    pub file: String,
    pub line: u64,
    pub function: String,
}

/// Minimal view of a goroutine record, as resolved by the symbol-side
/// collaborator. `thread_id` is filled in by the engine when the record was
/// reached through a stopped thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Goroutine {
    pub id: i64,
    pub pc: u64,
    pub thread_id: Option<u32>,
}

/// Reader/writer over inferior memory, as seen by collaborators. The engine
/// hands out an implementation backed by the protocol connection.
pub trait MemoryAccess {
    fn read_memory(&mut self, buf: &mut [u8], addr: u64) -> Result<(), Error>;
    fn write_memory(&mut self, addr: u64, data: &[u8]) -> Result<usize, Error>;
}

/// Symbol and runtime metadata collaborator.
///
/// Everything the engine knows about the inferior's binary comes through
/// this narrow interface: PC to source mapping, function lookup, the
/// runtime-version-specific offset of the goroutine descriptor in thread
/// local storage, and (optionally) decoding a goroutine record from
/// inferior memory.
pub trait BinaryInfo {
    fn target_os(&self) -> TargetOs;

    /// Source position of `pc`, if it falls inside a known function.
    fn pc_to_place(&self, pc: u64) -> Option<Place>;

    /// Name of the function containing `pc`.
    fn function_at(&self, pc: u64) -> Option<String>;

    /// Entry address of a function by its fully qualified name.
    fn function_address(&self, name: &str) -> Option<u64>;

    /// Offset of the G pointer from the TLS segment base for the inferior's
    /// runtime version.
    fn g_struct_offset(&self) -> u64;

    /// Decode the goroutine record at `gaddr`. Implementations without
    /// runtime awareness keep the default.
    fn goroutine_at(
        &self,
        gaddr: u64,
        mem: &mut dyn MemoryAccess,
    ) -> anyhow::Result<Option<Goroutine>> {
        let _ = (gaddr, mem);
        Ok(None)
    }
}
