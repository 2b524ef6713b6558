use crate::debugger::error::Error;
use crate::protocol::RegisterInfo;
use indexmap::IndexMap;
use itertools::Itertools;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

pub(crate) const REGNAME_PC: &str = "rip";
pub(crate) const REGNAME_SP: &str = "rsp";
pub(crate) const REGNAME_BP: &str = "rbp";
pub(crate) const REGNAME_CX: &str = "rcx";

#[derive(Debug, Clone, Copy)]
struct RegisterSlot {
    offset: usize,
    len: usize,
    regnum: usize,
}

/// Current value of all registers of one thread.
///
/// Storage is a single contiguous buffer spanning every declared register
/// offset; each named register is a subrange of it. The buffer is rewritten
/// in place on every reload. `gaddr` survives reloads: it caches the address
/// of the goroutine descriptor recovered for the thread.
pub struct RegisterBank {
    layout: Arc<[RegisterInfo]>,
    regs: IndexMap<String, RegisterSlot>,
    buf: Vec<u8>,
    gaddr: u64,
    has_gaddr: bool,
}

impl RegisterBank {
    pub(crate) fn new(layout: Arc<[RegisterInfo]>) -> Self {
        let size = layout
            .iter()
            .map(|info| info.offset + info.bitsize / 8)
            .max()
            .unwrap_or(0);
        let mut regs = IndexMap::with_capacity(layout.len());
        for info in layout.iter() {
            regs.insert(
                info.name.clone(),
                RegisterSlot {
                    offset: info.offset,
                    len: info.bitsize / 8,
                    regnum: info.regnum,
                },
            );
        }
        RegisterBank {
            layout,
            regs,
            buf: vec![0; size],
            gaddr: 0,
            has_gaddr: false,
        }
    }

    pub(crate) fn buf(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    fn slot(&self, name: &str) -> Result<RegisterSlot, Error> {
        self.regs
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownRegister(name.to_string()))
    }

    pub(crate) fn slot_bytes(&self, name: &str) -> Result<&[u8], Error> {
        let slot = self.slot(name)?;
        Ok(&self.buf[slot.offset..slot.offset + slot.len])
    }

    pub(crate) fn slot_bytes_mut(&mut self, name: &str) -> Result<&mut [u8], Error> {
        let slot = self.slot(name)?;
        Ok(&mut self.buf[slot.offset..slot.offset + slot.len])
    }

    pub(crate) fn regnum(&self, name: &str) -> Result<usize, Error> {
        Ok(self.slot(name)?.regnum)
    }

    /// Value of a register by its stub-declared name, zero if the stub does
    /// not declare it. Registers wider than 64 bits yield their low qword.
    pub fn value(&self, name: &str) -> u64 {
        let Ok(slot) = self.slot(name) else {
            return 0;
        };
        le_u64(&self.buf[slot.offset..slot.offset + slot.len])
    }

    pub(crate) fn set_value(&mut self, name: &str, value: u64) {
        let Ok(slot) = self.slot(name) else {
            return;
        };
        let le = value.to_le_bytes();
        let n = slot.len.min(8);
        self.buf[slot.offset..slot.offset + n].copy_from_slice(&le[..n]);
    }

    pub fn pc(&self) -> u64 {
        self.value(REGNAME_PC)
    }

    pub(crate) fn set_pc(&mut self, value: u64) {
        self.set_value(REGNAME_PC, value);
    }

    pub fn sp(&self) -> u64 {
        self.value(REGNAME_SP)
    }

    pub fn bp(&self) -> u64 {
        self.value(REGNAME_BP)
    }

    pub fn cx(&self) -> u64 {
        self.value(REGNAME_CX)
    }

    pub(crate) fn set_cx(&mut self, value: u64) {
        self.set_value(REGNAME_CX, value);
    }

    /// Address of the goroutine descriptor bound to this thread, with its
    /// validity flag. Zero with a true flag means "no goroutine".
    pub fn gaddr(&self) -> (u64, bool) {
        (self.gaddr, self.has_gaddr)
    }

    pub(crate) fn set_gaddr(&mut self, gaddr: u64) {
        self.gaddr = gaddr;
        self.has_gaddr = true;
    }

    /// Register lookup by DWARF number (x86-64 numbering).
    pub fn dwarf_register(&self, num: i32) -> Result<u64, Error> {
        let name = DWARF_REGISTERS
            .iter()
            .find_map(|(n, name)| (*n == num).then_some(*name))
            .ok_or_else(|| Error::UnknownRegister(format!("dwarf {num}")))?;
        self.slot(name)?;
        Ok(self.value(name))
    }

    /// Register lookup by assembly-level name, including the 8/16/32-bit
    /// sub-register forms of the sixteen general purpose registers.
    pub fn sub_register(&self, name: &str) -> Result<u64, Error> {
        let (container, mask, shift) = SUB_REGISTERS
            .iter()
            .find_map(|(n, container, mask, shift)| {
                (*n == name).then_some((*container, *mask, *shift))
            })
            .ok_or_else(|| Error::UnknownRegister(name.to_string()))?;
        self.slot(container)?;
        Ok((self.value(container) >> shift) & mask)
    }

    /// Export every declared register with a display format deduced from its
    /// width, in declaration order.
    pub fn snapshot(&self) -> Vec<RegisterEntry> {
        let mut out = Vec::with_capacity(self.regs.len());
        for info in self.layout.iter() {
            let Ok(bytes) = self.slot_bytes(&info.name) else {
                continue;
            };
            if info.name == "eflags" || info.name == "rflags" {
                out.push(RegisterEntry {
                    name: info.name.clone(),
                    value: RegisterValue::Flags {
                        value: self.value(&info.name),
                        descr: &EFLAGS_DESCRIPTION,
                    },
                });
                continue;
            }
            if info.name == "mxcsr" {
                out.push(RegisterEntry {
                    name: info.name.clone(),
                    value: RegisterValue::Flags {
                        value: self.value(&info.name),
                        descr: &MXCSR_DESCRIPTION,
                    },
                });
                continue;
            }
            match info.bitsize {
                16 => out.push(RegisterEntry {
                    name: info.name.clone(),
                    value: RegisterValue::Word(u16::from_le_bytes([bytes[0], bytes[1]])),
                }),
                32 => out.push(RegisterEntry {
                    name: info.name.clone(),
                    value: RegisterValue::Dword(le_u64(bytes) as u32),
                }),
                64 => out.push(RegisterEntry {
                    name: info.name.clone(),
                    value: RegisterValue::Qword(self.value(&info.name)),
                }),
                80 => {
                    let index = ["stmm", "st"]
                        .iter()
                        .find_map(|prefix| info.name.strip_prefix(prefix))
                        .and_then(|suffix| suffix.parse::<usize>().ok())
                        .unwrap_or(0);
                    out.push(RegisterEntry {
                        name: info.name.clone(),
                        value: RegisterValue::X87 {
                            index,
                            exponent: u16::from_le_bytes([bytes[8], bytes[9]]),
                            mantissa: le_u64(&bytes[..8]),
                        },
                    });
                }
                128 => out.push(RegisterEntry {
                    name: info.name.to_uppercase(),
                    value: RegisterValue::Sse(bytes.to_vec()),
                }),
                256 => {
                    // only the ymm banks have a meaningful low/high split
                    if !info.name.to_lowercase().starts_with("ymm") {
                        continue;
                    }
                    let xmm_name = format!("x{}", &info.name[1..]);
                    out.push(RegisterEntry {
                        name: xmm_name.to_uppercase(),
                        value: RegisterValue::Sse(bytes[..16].to_vec()),
                    });
                    out.push(RegisterEntry {
                        name: info.name.to_uppercase(),
                        value: RegisterValue::Sse(bytes[16..].to_vec()),
                    });
                }
                _ => {}
            }
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct RegisterEntry {
    pub name: String,
    pub value: RegisterValue,
}

#[derive(Debug, Clone)]
pub enum RegisterValue {
    Word(u16),
    Dword(u32),
    Qword(u64),
    X87 {
        index: usize,
        exponent: u16,
        mantissa: u64,
    },
    Sse(Vec<u8>),
    Flags {
        value: u64,
        descr: &'static FlagsDescription,
    },
}

impl Display for RegisterValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            RegisterValue::Word(v) => write!(f, "{v:#06x}"),
            RegisterValue::Dword(v) => write!(f, "{v:#010x}"),
            RegisterValue::Qword(v) => write!(f, "{v:#018x}"),
            RegisterValue::X87 {
                index,
                exponent,
                mantissa,
            } => {
                let sign = exponent >> 15;
                let exponent = exponent & 0x7fff;
                write!(
                    f,
                    "ST({index}) sign:{sign} exponent:{exponent:#x} mantissa:{mantissa:#x}"
                )
            }
            RegisterValue::Sse(bytes) => {
                write!(f, "0x")?;
                for b in bytes.iter().rev() {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
            RegisterValue::Flags { value, descr } => {
                let rendered = descr
                    .fields
                    .iter()
                    .filter_map(|(name, mask)| {
                        let field = (value & mask) >> mask.trailing_zeros();
                        if field == 0 {
                            None
                        } else if mask.count_ones() == 1 {
                            Some((*name).to_string())
                        } else {
                            Some(format!("{name}={field}"))
                        }
                    })
                    .join(" ");
                write!(f, "{value:#x} [{rendered}]")
            }
        }
    }
}

#[derive(Debug)]
pub struct FlagsDescription {
    pub fields: &'static [(&'static str, u64)],
}

pub static EFLAGS_DESCRIPTION: FlagsDescription = FlagsDescription {
    fields: &[
        ("CF", 1 << 0),
        ("PF", 1 << 2),
        ("AF", 1 << 4),
        ("ZF", 1 << 6),
        ("SF", 1 << 7),
        ("TF", 1 << 8),
        ("IF", 1 << 9),
        ("DF", 1 << 10),
        ("OF", 1 << 11),
        ("IOPL", 0b11 << 12),
        ("NT", 1 << 14),
        ("RF", 1 << 16),
        ("VM", 1 << 17),
        ("AC", 1 << 18),
        ("VIF", 1 << 19),
        ("VIP", 1 << 20),
        ("ID", 1 << 21),
    ],
};

pub static MXCSR_DESCRIPTION: FlagsDescription = FlagsDescription {
    fields: &[
        ("IE", 1 << 0),
        ("DE", 1 << 1),
        ("ZE", 1 << 2),
        ("OE", 1 << 3),
        ("UE", 1 << 4),
        ("PE", 1 << 5),
        ("DAZ", 1 << 6),
        ("IM", 1 << 7),
        ("DM", 1 << 8),
        ("ZM", 1 << 9),
        ("OM", 1 << 10),
        ("UM", 1 << 11),
        ("PM", 1 << 12),
        ("RC", 0b11 << 13),
        ("FZ", 1 << 15),
    ],
};

const DWARF_REGISTERS: &[(i32, &str)] = &[
    (0, "rax"),
    (1, "rdx"),
    (2, "rcx"),
    (3, "rbx"),
    (4, "rsi"),
    (5, "rdi"),
    (6, "rbp"),
    (7, "rsp"),
    (8, "r8"),
    (9, "r9"),
    (10, "r10"),
    (11, "r11"),
    (12, "r12"),
    (13, "r13"),
    (14, "r14"),
    (15, "r15"),
    (16, "rip"),
    (49, "eflags"),
    (50, "es"),
    (51, "cs"),
    (52, "ss"),
    (53, "ds"),
    (54, "fs"),
    (55, "gs"),
    (58, "fs_base"),
    (59, "gs_base"),
];

/// Little-endian read of up to eight bytes.
fn le_u64(bytes: &[u8]) -> u64 {
    let mut le = [0u8; 8];
    let n = bytes.len().min(8);
    le[..n].copy_from_slice(&bytes[..n]);
    u64::from_le_bytes(le)
}

const MASK8: u64 = 0xff;
const MASK16: u64 = 0xffff;
const MASK32: u64 = 0xffff_ffff;

#[rustfmt::skip]
const SUB_REGISTERS: &[(&str, &str, u64, u32)] = &[
    // 8-bit low
    ("al", "rax", MASK8, 0), ("cl", "rcx", MASK8, 0), ("dl", "rdx", MASK8, 0),
    ("bl", "rbx", MASK8, 0), ("spl", "rsp", MASK8, 0), ("bpl", "rbp", MASK8, 0),
    ("sil", "rsi", MASK8, 0), ("dil", "rdi", MASK8, 0),
    ("r8b", "r8", MASK8, 0), ("r9b", "r9", MASK8, 0), ("r10b", "r10", MASK8, 0),
    ("r11b", "r11", MASK8, 0), ("r12b", "r12", MASK8, 0), ("r13b", "r13", MASK8, 0),
    ("r14b", "r14", MASK8, 0), ("r15b", "r15", MASK8, 0),
    // 8-bit high
    ("ah", "rax", MASK8, 8), ("ch", "rcx", MASK8, 8), ("dh", "rdx", MASK8, 8),
    ("bh", "rbx", MASK8, 8),
    // 16-bit
    ("ax", "rax", MASK16, 0), ("cx", "rcx", MASK16, 0), ("dx", "rdx", MASK16, 0),
    ("bx", "rbx", MASK16, 0), ("sp", "rsp", MASK16, 0), ("bp", "rbp", MASK16, 0),
    ("si", "rsi", MASK16, 0), ("di", "rdi", MASK16, 0),
    ("r8w", "r8", MASK16, 0), ("r9w", "r9", MASK16, 0), ("r10w", "r10", MASK16, 0),
    ("r11w", "r11", MASK16, 0), ("r12w", "r12", MASK16, 0), ("r13w", "r13", MASK16, 0),
    ("r14w", "r14", MASK16, 0), ("r15w", "r15", MASK16, 0),
    // 32-bit
    ("eax", "rax", MASK32, 0), ("ecx", "rcx", MASK32, 0), ("edx", "rdx", MASK32, 0),
    ("ebx", "rbx", MASK32, 0), ("esp", "rsp", MASK32, 0), ("ebp", "rbp", MASK32, 0),
    ("esi", "rsi", MASK32, 0), ("edi", "rdi", MASK32, 0),
    ("r8d", "r8", MASK32, 0), ("r9d", "r9", MASK32, 0), ("r10d", "r10", MASK32, 0),
    ("r11d", "r11", MASK32, 0), ("r12d", "r12", MASK32, 0), ("r13d", "r13", MASK32, 0),
    ("r14d", "r14", MASK32, 0), ("r15d", "r15", MASK32, 0),
    // 64-bit
    ("rax", "rax", u64::MAX, 0), ("rcx", "rcx", u64::MAX, 0), ("rdx", "rdx", u64::MAX, 0),
    ("rbx", "rbx", u64::MAX, 0), ("rsp", "rsp", u64::MAX, 0), ("rbp", "rbp", u64::MAX, 0),
    ("rsi", "rsi", u64::MAX, 0), ("rdi", "rdi", u64::MAX, 0),
    ("r8", "r8", u64::MAX, 0), ("r9", "r9", u64::MAX, 0), ("r10", "r10", u64::MAX, 0),
    ("r11", "r11", u64::MAX, 0), ("r12", "r12", u64::MAX, 0), ("r13", "r13", u64::MAX, 0),
    ("r14", "r14", u64::MAX, 0), ("r15", "r15", u64::MAX, 0),
];
